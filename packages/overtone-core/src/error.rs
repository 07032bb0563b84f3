//! Centralized error types for the Overtone Bridge core library.
//!
//! Per-module error enums live next to the code that produces them (SOAP in
//! `renderer::soap`, catalog in `catalog`); this module aggregates them into
//! the application-wide [`BridgeError`] used by bootstrap and the binary.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::renderer::soap::SoapError;
use crate::renderer::RendererError;

/// Application-wide error type for the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The discovery beacon could not set up or use its socket.
    #[error("Beacon error: {0}")]
    Beacon(#[from] std::io::Error),

    /// Talking to the renderer device failed.
    #[error("Renderer error: {0}")]
    Renderer(#[from] RendererError),

    /// Talking to the upstream catalog server failed.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The companion HTTP server could not bind or serve.
    #[error("Server error: {0}")]
    Server(String),

    /// Invalid configuration (bad renderer selection, missing device address).
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<SoapError> for BridgeError {
    fn from(err: SoapError) -> Self {
        Self::Renderer(RendererError::from(err))
    }
}

/// Convenient Result alias for application-wide operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

// Re-export Result aliases from their defining modules
pub use crate::catalog::CatalogResult;
pub use crate::renderer::soap::SoapResult;
pub use crate::renderer::RendererResult;
