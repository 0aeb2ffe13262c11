use thiserror::Error;

/// Errors produced by the media layer.
#[derive(Error, Debug)]
pub enum MediaError {
    /// No microphone present or permission denied. Fatal to call setup,
    /// surfaced to the user, never retried automatically.
    #[error("No input device available")]
    NoInputDevice,

    #[error("No output device available")]
    NoOutputDevice,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    /// Peer connection or negotiation failure (create/apply description,
    /// candidate application).
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Operation on a session that has already been closed.
    #[error("Media session closed")]
    Closed,
}

impl MediaError {
    /// Whether this is a microphone-access failure, which callers report
    /// with a permission hint rather than a generic call-failed notice.
    pub fn is_access_error(&self) -> bool {
        matches!(self, Self::NoInputDevice | Self::Device(_))
    }
}
