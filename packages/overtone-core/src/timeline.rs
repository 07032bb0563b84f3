//! Wire representation of the timeline documents pushed to controllers.
//!
//! A timeline is one container element carrying the echoed `commandID` and
//! one sub-element per media type. Only music is ever active on this bridge;
//! video and photo are always reported stopped.

use quick_xml::escape::escape;

use crate::protocol_constants::CONTROLLABLE;

/// Transport state reported on timelines and upstream notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
}

impl TransportState {
    /// Wire spelling of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// One shared snapshot of the outward-facing playback state.
///
/// Built once per notification tick (or per poll response) and rendered per
/// subscriber with that subscriber's own command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineSnapshot {
    /// Nothing is playing.
    Stopped,
    /// Music is active; attributes are rendered in order onto the music
    /// element.
    Playing(Vec<(String, String)>),
}

impl TimelineSnapshot {
    /// Returns true for the playing variant.
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::Playing(_))
    }

    /// Renders the timeline document with the given echoed command id.
    pub fn render(&self, command_id: &str) -> String {
        match self {
            Self::Stopped => format!(
                "<MediaContainer commandID=\"{}\">\
                 <Timeline type=\"music\" state=\"stopped\"/>\
                 <Timeline type=\"video\" state=\"stopped\"/>\
                 <Timeline type=\"photo\" state=\"stopped\"/>\
                 </MediaContainer>",
                escape(command_id)
            ),
            Self::Playing(attributes) => {
                let mut music = String::new();
                for (name, value) in attributes {
                    music.push_str(&format!(" {}=\"{}\"", name, escape(value.as_str())));
                }
                format!(
                    "<MediaContainer commandID=\"{}\">\
                     <Timeline controllable=\"{}\" type=\"music\"{}/>\
                     <Timeline type=\"video\" state=\"stopped\"/>\
                     <Timeline type=\"photo\" state=\"stopped\"/>\
                     </MediaContainer>",
                    escape(command_id),
                    CONTROLLABLE,
                    music
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_timeline_reports_all_types_stopped() {
        let xml = TimelineSnapshot::Stopped.render("12");
        assert!(xml.contains("commandID=\"12\""));
        assert_eq!(xml.matches("state=\"stopped\"").count(), 3);
    }

    #[test]
    fn playing_timeline_carries_attributes_in_order() {
        let snapshot = TimelineSnapshot::Playing(vec![
            ("time".to_string(), "1500".to_string()),
            ("state".to_string(), "playing".to_string()),
        ]);
        let xml = snapshot.render("3");
        assert!(xml.contains("controllable=\""));
        let time_idx = xml.find("time=\"1500\"").unwrap();
        let state_idx = xml.find("state=\"playing\"").unwrap();
        assert!(time_idx < state_idx);
        // Video and photo stay stopped.
        assert!(xml.contains("<Timeline type=\"video\" state=\"stopped\"/>"));
    }

    #[test]
    fn attribute_values_are_escaped() {
        let snapshot = TimelineSnapshot::Playing(vec![(
            "key".to_string(),
            "/library/metadata/1?a=b&c=\"d\"".to_string(),
        )]);
        let xml = snapshot.render("0");
        assert!(xml.contains("&amp;"));
        assert!(xml.contains("&quot;"));
        assert!(!xml.contains("=\"d\"\""));
    }

    #[test]
    fn transport_state_spelling() {
        assert_eq!(TransportState::Playing.as_str(), "playing");
        assert_eq!(TransportState::Paused.as_str(), "paused");
        assert_eq!(TransportState::Stopped.as_str(), "stopped");
    }
}
