use serde::{Deserialize, Serialize};

/// Coarse lifecycle phase of a backup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Registering,
    Reconnecting,
    ExchangingKeys,
    Transferring,
    Verifying,
    Done,
    Aborted,
}

/// Events pushed from the transfer engine to whoever renders status
/// (dashboard bridge, terminal, log file).
///
/// Never carries key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum StatusEvent {
    Phase(Phase),

    /// A named step finished, successfully or not.
    Operation {
        name: String,
        success: bool,
        details: String,
    },

    /// Emitted after every acknowledged packet.
    Progress {
        bytes_done: u64,
        bytes_total: u64,
        speed_bytes_per_sec: u64,
        eta_ms: u64,
    },

    ConnectionState { connected: bool },

    Error { message: String, fatal: bool },
}

impl StatusEvent {
    pub fn operation(name: impl Into<String>, success: bool, details: impl Into<String>) -> Self {
        Self::Operation {
            name: name.into(),
            success,
            details: details.into(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
        }
    }

    /// Terminal events close a session: a finished `Operation` named
    /// `backup` or any fatal error.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Operation { name, .. } => name == "backup",
            Self::Error { fatal, .. } => *fatal,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_serializes_tagged() {
        let ev = StatusEvent::Progress {
            bytes_done: 10,
            bytes_total: 20,
            speed_bytes_per_sec: 5,
            eta_ms: 2000,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "Progress");
        assert_eq!(json["data"]["eta_ms"], 2000);
    }

    #[test]
    fn phase_is_snake_case() {
        let json = serde_json::to_string(&StatusEvent::Phase(Phase::ExchangingKeys)).unwrap();
        assert_eq!(json, r#"{"type":"Phase","data":"exchanging_keys"}"#);
    }

    #[test]
    fn terminal_detection() {
        assert!(StatusEvent::operation("backup", true, "").is_terminal());
        assert!(!StatusEvent::operation("register", true, "").is_terminal());
        assert!(StatusEvent::error("boom", true).is_terminal());
        assert!(!StatusEvent::error("retrying", false).is_terminal());
    }
}
