//! Playback session state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The single state a playback coordinator is in at any moment.
///
/// `Downloading` and `Converting` carry progress in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlayerState {
    #[default]
    Idle,
    Downloading {
        progress: f64,
    },
    Converting {
        progress: f64,
    },
    Playing,
    Paused,
    Error {
        message: String,
    },
}

impl PlayerState {
    /// `Downloading` state with progress clamped to `[0, 1]`.
    pub fn downloading(progress: f64) -> Self {
        Self::Downloading {
            progress: clamp_unit(progress),
        }
    }

    /// `Converting` state with progress clamped to `[0, 1]`.
    pub fn converting(progress: f64) -> Self {
        Self::Converting {
            progress: clamp_unit(progress),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Progress of the current stage, if the state has one.
    pub fn progress(&self) -> Option<f64> {
        match self {
            Self::Downloading { progress } | Self::Converting { progress } => Some(*progress),
            _ => None,
        }
    }

    /// Whether a player exists that pause/resume/seek can act on.
    pub fn has_player(&self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }

    /// Whether the download/convert pipeline is still running.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Downloading { .. } | Self::Converting { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Downloading { progress } => write!(f, "downloading ({:.0}%)", progress * 100.0),
            Self::Converting { progress } => write!(f, "converting ({:.0}%)", progress * 100.0),
            Self::Playing => write!(f, "playing"),
            Self::Paused => write!(f, "paused"),
            Self::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        assert_eq!(PlayerState::downloading(1.7).progress(), Some(1.0));
        assert_eq!(PlayerState::converting(-0.2).progress(), Some(0.0));
        assert_eq!(PlayerState::converting(f64::NAN).progress(), Some(0.0));
    }

    #[test]
    fn only_playing_and_paused_have_player() {
        assert!(PlayerState::Playing.has_player());
        assert!(PlayerState::Paused.has_player());
        assert!(!PlayerState::Idle.has_player());
        assert!(!PlayerState::downloading(0.5).has_player());
        assert!(!PlayerState::error("boom").has_player());
    }

    #[test]
    fn serializes_with_tag() {
        let json = serde_json::to_string(&PlayerState::converting(0.25)).unwrap();
        assert_eq!(json, r#"{"state":"converting","progress":0.25}"#);
    }

    #[test]
    fn display() {
        assert_eq!(PlayerState::downloading(0.5).to_string(), "downloading (50%)");
        assert_eq!(PlayerState::error("no track").to_string(), "error: no track");
    }
}
