use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::control::{CaptureRequest, StreamToggle};

/// Plain-text commands accepted on the command topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Capture,
    Status,
    EnableStreaming,
    DisableStreaming,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "capture" => Ok(Command::Capture),
            "status" => Ok(Command::Status),
            "rtsp_enable" => Ok(Command::EnableStreaming),
            "rtsp_disable" => Ok(Command::DisableStreaming),
            other => Err(format!("unknown command: {:?}", other)),
        }
    }
}

/// Plain-text acknowledgements published on the status topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMessage {
    Online,
    CapturingImage,
    RtspEnabled,
    RtspDisabled,
    Heartbeat,
}

impl StatusMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusMessage::Online => "online",
            StatusMessage::CapturingImage => "capturing_image",
            StatusMessage::RtspEnabled => "rtsp_enabled",
            StatusMessage::RtspDisabled => "rtsp_disabled",
            StatusMessage::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies commands to the shared control flags
#[derive(Debug, Clone)]
pub struct CommandHandler {
    toggle: StreamToggle,
    capture: CaptureRequest,
}

impl CommandHandler {
    pub fn new(toggle: StreamToggle, capture: CaptureRequest) -> Self {
        Self { toggle, capture }
    }

    /// Runs one command and returns the acknowledgement to publish.
    pub fn handle(&self, command: Command) -> StatusMessage {
        match command {
            Command::Capture => {
                self.capture.request();
                info!("Snapshot requested");
                StatusMessage::CapturingImage
            }
            Command::Status => StatusMessage::Online,
            Command::EnableStreaming => {
                let was = self.toggle.enable();
                info!(was_enabled = was, "Streaming enabled");
                StatusMessage::RtspEnabled
            }
            Command::DisableStreaming => {
                let was = self.toggle.disable();
                info!(was_enabled = was, "Streaming disabled");
                StatusMessage::RtspDisabled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("capture", Command::Capture)]
    #[case("status", Command::Status)]
    #[case("rtsp_enable", Command::EnableStreaming)]
    #[case("rtsp_disable\n", Command::DisableStreaming)]
    fn test_parse_command(#[case] text: &str, #[case] expected: Command) {
        assert_eq!(text.parse::<Command>(), Ok(expected));
    }

    #[rstest]
    #[case("")]
    #[case("reboot")]
    #[case("CAPTURE")]
    fn test_reject_unknown_command(#[case] text: &str) {
        assert!(text.parse::<Command>().is_err());
    }

    #[test]
    fn test_handler_updates_flags() {
        let toggle = StreamToggle::new(true);
        let capture = CaptureRequest::default();
        let handler = CommandHandler::new(toggle.clone(), capture.clone());

        assert_eq!(handler.handle(Command::DisableStreaming), StatusMessage::RtspDisabled);
        assert!(!toggle.is_enabled());
        assert_eq!(handler.handle(Command::DisableStreaming), StatusMessage::RtspDisabled);
        assert!(!toggle.is_enabled());

        assert_eq!(handler.handle(Command::EnableStreaming), StatusMessage::RtspEnabled);
        assert!(toggle.is_enabled());

        assert_eq!(handler.handle(Command::Capture), StatusMessage::CapturingImage);
        assert!(capture.is_pending());

        assert_eq!(handler.handle(Command::Status), StatusMessage::Online);
    }
}
