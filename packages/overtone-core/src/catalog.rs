//! Upstream catalog client.
//!
//! The catalog server is the authority over play-queue contents and media
//! locations. The bridge never configures it explicitly: its identity
//! arrives piggybacked on inbound commands and is refreshed opportunistically
//! ([`Catalog::update_server_info`]). Queue documents are fetched on
//! demand and parsed from the container XML; media URLs are built from
//! catalog-relative paths with the renderer's rewrite rules applied.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::queue::{QueueDocument, TrackEntry};
use crate::state::RewriteRules;

/// Errors that can occur talking to the catalog server.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No command has announced the catalog server yet.
    #[error("Catalog server not yet announced by any controller")]
    ServerUnknown,

    /// HTTP request to the catalog failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Catalog answered with a non-success status.
    #[error("HTTP error {0}")]
    UnexpectedStatus(u16),

    /// Queue document XML could not be parsed.
    #[error("Failed to parse queue document: {0}")]
    Parse(#[from] quick_xml::DeError),
}

/// Convenient Result alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Last-known identity of the controlling catalog server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub protocol: String,
    pub address: String,
    pub port: String,
    pub token: String,
    pub machine_id: String,
}

impl ServerInfo {
    /// Returns true once a server has announced itself.
    pub fn is_known(&self) -> bool {
        !self.address.is_empty()
    }
}

/// Contract the coordinator and fanout consume the catalog through.
///
/// A trait so tests can substitute a scripted catalog for the HTTP-backed
/// [`CatalogClient`].
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Refreshes the server identity from inbound command parameters.
    fn update_server_info(&self, params: &HashMap<String, String>);

    /// Snapshot of the last-known server identity.
    fn server_info(&self) -> ServerInfo;

    /// Builds an absolute URL for a catalog-relative resource path.
    fn build_url(
        &self,
        resource: &str,
        with_token: bool,
        rewrite: &RewriteRules,
    ) -> CatalogResult<String>;

    /// URL of the upstream timeline endpoint.
    fn timeline_url(&self) -> CatalogResult<String>;

    /// Fetches and parses the play-queue document under `container_key`.
    async fn fetch_queue(&self, container_key: &str) -> CatalogResult<QueueDocument>;
}

/// Client for the upstream catalog server.
pub struct CatalogClient {
    http: Client,
    info: RwLock<ServerInfo>,
}

impl CatalogClient {
    /// Creates a catalog client using the shared HTTP client.
    pub fn new(http: Client) -> Self {
        Self {
            http,
            info: RwLock::new(ServerInfo::default()),
        }
    }
}

#[async_trait]
impl Catalog for CatalogClient {
    /// Only applies when all five identity keys are present; partial
    /// parameter sets leave the stored identity untouched.
    fn update_server_info(&self, params: &HashMap<String, String>) {
        let keys = ["protocol", "address", "port", "token", "machineIdentifier"];
        if keys.iter().all(|k| params.contains_key(*k)) {
            let mut info = self.info.write();
            info.protocol = params["protocol"].clone();
            info.address = params["address"].clone();
            info.port = params["port"].clone();
            info.token = params["token"].clone();
            info.machine_id = params["machineIdentifier"].clone();
        }
    }

    fn server_info(&self) -> ServerInfo {
        self.info.read().clone()
    }

    /// `with_token` appends the access token as a query parameter. Rewrite
    /// rules replace the scheme and/or host for renderers that cannot reach
    /// the advertised ones.
    fn build_url(
        &self,
        resource: &str,
        with_token: bool,
        rewrite: &RewriteRules,
    ) -> CatalogResult<String> {
        let info = self.info.read();
        if !info.is_known() {
            return Err(CatalogError::ServerUnknown);
        }

        let protocol = if rewrite.rewrite_http {
            "http"
        } else {
            info.protocol.as_str()
        };
        let address = rewrite.rewrite_host.as_deref().unwrap_or(&info.address);

        let mut url = format!("{}://{}:{}{}", protocol, address, info.port, resource);
        if with_token {
            let separator = if resource.contains('?') { '&' } else { '?' };
            url.push_str(&format!("{}token={}", separator, info.token));
        }
        Ok(url)
    }

    /// Token travels as a parameter of the notification itself, not in the
    /// URL.
    fn timeline_url(&self) -> CatalogResult<String> {
        self.build_url(
            crate::protocol_constants::UPSTREAM_TIMELINE_PATH,
            false,
            &RewriteRules::default(),
        )
    }

    async fn fetch_queue(&self, container_key: &str) -> CatalogResult<QueueDocument> {
        let url = self.build_url(container_key, true, &RewriteRules::default())?;
        log::debug!("Fetching play queue: {}", url);
        let response = self
            .http
            .get(&url)
            .header("Accept", "*/*")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::UnexpectedStatus(status.as_u16()));
        }
        let body = response.text().await?;
        parse_queue_document(&body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue Document Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawContainer {
    #[serde(rename = "@playQueueID")]
    queue_id: String,
    #[serde(rename = "@playQueueVersion")]
    version: String,
    #[serde(rename = "@playQueueSelectedItemOffset", default)]
    selected_offset: usize,
    #[serde(rename = "Track", default)]
    tracks: Vec<RawTrack>,
}

#[derive(Debug, Deserialize)]
struct RawTrack {
    #[serde(rename = "@ratingKey")]
    rating_key: String,
    #[serde(rename = "@key")]
    key: String,
    #[serde(rename = "@title", default)]
    title: String,
    #[serde(rename = "@duration", default)]
    duration: u64,
    #[serde(rename = "@thumb", default)]
    thumb: String,
    #[serde(rename = "@playQueueItemID")]
    item_id: String,
    #[serde(rename = "Media", default)]
    media: Vec<RawMedia>,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    #[serde(rename = "Part", default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize)]
struct RawPart {
    #[serde(rename = "@key")]
    key: String,
}

/// Parses a queue container document into a [`QueueDocument`].
pub fn parse_queue_document(xml: &str) -> CatalogResult<QueueDocument> {
    let raw: RawContainer = quick_xml::de::from_str(xml)?;
    let tracks = raw
        .tracks
        .into_iter()
        .map(|t| {
            let media_path = t
                .media
                .first()
                .and_then(|m| m.parts.first())
                .map(|p| p.key.clone())
                .unwrap_or_default();
            if media_path.is_empty() {
                log::warn!("Track {} has no playable media part", t.rating_key);
            }
            TrackEntry {
                rating_key: t.rating_key,
                key: t.key,
                title: t.title,
                duration_ms: t.duration,
                thumb: t.thumb,
                item_id: t.item_id,
                media_path,
            }
        })
        .collect();

    Ok(QueueDocument {
        queue_id: raw.queue_id,
        version: raw.version,
        selected_offset: raw.selected_offset,
        tracks,
    })
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// Scripted catalog double for coordinator and fanout tests.
    #[derive(Default)]
    pub(crate) struct MockCatalog {
        pub document: parking_lot::Mutex<Option<QueueDocument>>,
        pub info: RwLock<ServerInfo>,
        pub fetches: parking_lot::Mutex<Vec<String>>,
    }

    impl MockCatalog {
        pub fn with_document(document: QueueDocument) -> Self {
            let fixture = Self::default();
            *fixture.document.lock() = Some(document);
            fixture
        }
    }

    #[async_trait]
    impl Catalog for MockCatalog {
        fn update_server_info(&self, params: &HashMap<String, String>) {
            let keys = ["protocol", "address", "port", "token", "machineIdentifier"];
            if keys.iter().all(|k| params.contains_key(*k)) {
                let mut info = self.info.write();
                info.protocol = params["protocol"].clone();
                info.address = params["address"].clone();
                info.port = params["port"].clone();
                info.token = params["token"].clone();
                info.machine_id = params["machineIdentifier"].clone();
            }
        }

        fn server_info(&self) -> ServerInfo {
            self.info.read().clone()
        }

        fn build_url(
            &self,
            resource: &str,
            with_token: bool,
            _rewrite: &RewriteRules,
        ) -> CatalogResult<String> {
            let mut url = format!("http://catalog.test:32400{}", resource);
            if with_token {
                url.push_str("?token=test");
            }
            Ok(url)
        }

        fn timeline_url(&self) -> CatalogResult<String> {
            Ok("http://catalog.test:32400/:/timeline".to_string())
        }

        async fn fetch_queue(&self, container_key: &str) -> CatalogResult<QueueDocument> {
            self.fetches.lock().push(container_key.to_string());
            self.document
                .lock()
                .clone()
                .ok_or(CatalogError::ServerUnknown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUEUE_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MediaContainer size="2" playQueueID="101" playQueueVersion="3" playQueueSelectedItemOffset="1" playQueueTotalCount="2">
  <Track ratingKey="555" key="/library/metadata/555" title="First" duration="214000" thumb="/library/metadata/555/thumb" playQueueItemID="9001">
    <Media>
      <Part key="/library/parts/81/file.flac"/>
    </Media>
  </Track>
  <Track ratingKey="556" key="/library/metadata/556" title="Second" duration="187000" thumb="/library/metadata/556/thumb" playQueueItemID="9002">
    <Media>
      <Part key="/library/parts/82/file.flac"/>
    </Media>
  </Track>
</MediaContainer>"#;

    fn announced_client() -> CatalogClient {
        let client = CatalogClient::new(Client::new());
        let params: HashMap<String, String> = [
            ("protocol", "https"),
            ("address", "10.0.0.2"),
            ("port", "32400"),
            ("token", "secret"),
            ("machineIdentifier", "abc-def"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        client.update_server_info(&params);
        client
    }

    #[test]
    fn parses_queue_document() {
        let doc = parse_queue_document(QUEUE_XML).unwrap();
        assert_eq!(doc.queue_id, "101");
        assert_eq!(doc.version, "3");
        assert_eq!(doc.selected_offset, 1);
        assert_eq!(doc.tracks.len(), 2);
        assert_eq!(doc.tracks[0].rating_key, "555");
        assert_eq!(doc.tracks[0].media_path, "/library/parts/81/file.flac");
        assert_eq!(doc.tracks[1].duration_ms, 187_000);
    }

    #[test]
    fn single_track_document_parses() {
        let xml = r#"<MediaContainer playQueueID="5" playQueueVersion="1" playQueueTotalCount="1">
            <Track ratingKey="9" key="/library/metadata/9" playQueueItemID="1">
                <Media><Part key="/library/parts/9/file.mp3"/></Media>
            </Track>
        </MediaContainer>"#;
        let doc = parse_queue_document(xml).unwrap();
        assert_eq!(doc.tracks.len(), 1);
        assert_eq!(doc.selected_offset, 0);
    }

    #[test]
    fn malformed_document_is_an_error() {
        assert!(parse_queue_document("<bogus/>").is_err());
    }

    #[test]
    fn partial_server_info_is_ignored() {
        let client = CatalogClient::new(Client::new());
        let params: HashMap<String, String> =
            [("address".to_string(), "10.0.0.2".to_string())].into();
        client.update_server_info(&params);
        assert!(!client.server_info().is_known());
        assert!(matches!(
            client.build_url("/x", false, &RewriteRules::default()),
            Err(CatalogError::ServerUnknown)
        ));
    }

    #[test]
    fn build_url_appends_token() {
        let client = announced_client();
        let url = client
            .build_url("/library/parts/81/file.flac", true, &RewriteRules::default())
            .unwrap();
        assert_eq!(
            url,
            "https://10.0.0.2:32400/library/parts/81/file.flac?token=secret"
        );
    }

    #[test]
    fn build_url_uses_ampersand_when_query_present() {
        let client = announced_client();
        let url = client
            .build_url("/photo?width=3", true, &RewriteRules::default())
            .unwrap();
        assert!(url.ends_with("/photo?width=3&token=secret"));
    }

    #[test]
    fn build_url_applies_rewrites() {
        let client = announced_client();
        let rewrite = RewriteRules {
            rewrite_http: true,
            rewrite_host: Some("192.168.7.7".to_string()),
        };
        let url = client.build_url("/a", false, &rewrite).unwrap();
        assert_eq!(url, "http://192.168.7.7:32400/a");
    }

    #[test]
    fn timeline_url_has_no_token() {
        let client = announced_client();
        let url = client.timeline_url().unwrap();
        assert_eq!(url, "https://10.0.0.2:32400/:/timeline");
    }
}
