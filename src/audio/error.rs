use std::time::Duration;
use thiserror::Error;

/// Errors raised by the per-guild playback pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlaybackError {
    /// The media reference could not be resolved or produced no audio.
    #[error("could not stream {reference}: {reason}")]
    SourceUnavailable { reference: String, reason: String },

    /// The fetch process started but wrote nothing within the allowed window.
    #[error("{reference} produced no audio within {}", human(.timeout))]
    FirstByteTimeout { reference: String, timeout: Duration },

    /// `play` was called while the engine was already streaming.
    #[error("audio engine is already playing")]
    EngineBusy,

    /// The fetch process ended because it was cancelled.
    #[error("source process was cancelled")]
    ExpectedTermination,

    /// The fetch process ended abnormally without being cancelled.
    #[error("source process terminated unexpectedly: {detail}")]
    UnexpectedTermination { detail: String },

    /// The engine has no voice channel attached.
    #[error("no voice channel attached")]
    NoChannel,

    /// Joining the voice channel failed.
    #[error("failed to join voice channel: {0}")]
    Connect(String),

    /// The voice transport rejected an operation on an established session.
    #[error("voice transport error: {0}")]
    Transport(String),

    #[error("queue is full (max {0} tracks)")]
    QueueFull(usize),

    #[error("nothing is playing")]
    NothingPlaying,

    /// The subscription was torn down while the caller held a reference to it.
    #[error("subscription already closed")]
    Closed,
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

impl PlaybackError {
    /// Whether this error should ever be reported back to a user.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            PlaybackError::ExpectedTermination | PlaybackError::EngineBusy | PlaybackError::Closed
        )
    }

    /// True for failures that only affect the track being fetched.
    pub fn is_track_failure(&self) -> bool {
        matches!(
            self,
            PlaybackError::SourceUnavailable { .. } | PlaybackError::FirstByteTimeout { .. }
        )
    }
}
