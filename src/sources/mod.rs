//! # Sources
//!
//! Media fetch processes that turn a track reference into a raw audio byte
//! stream. The subscription engine only sees the [`MediaFetcher`] trait; the
//! production implementation lives in [`ytdlp`].

pub mod ytdlp;

use async_trait::async_trait;
use std::io::Read;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::audio::error::PlaybackError;

pub use ytdlp::YtDlpFetcher;

/// Blocking byte stream handed to the voice driver, which decodes off the async runtime.
pub type ByteStream = Box<dyn Read + Send + Sync>;

/// Starts one fetch/decode process per track reference.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Launches the fetch for `reference` and waits until it has produced audio.
    ///
    /// Resolution failures come back as [`PlaybackError::SourceUnavailable`] or
    /// [`PlaybackError::FirstByteTimeout`]; they never bring the bot down.
    async fn fetch(&self, reference: &str) -> Result<TrackSource, PlaybackError>;
}

/// How a fetch process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited with status 0 after writing everything.
    Completed,
    /// Killed because [`SourceHandle::cancel`] was called first.
    Cancelled,
    /// Ended abnormally with nobody asking it to.
    Failed(String),
}

impl Termination {
    pub fn into_result(self) -> Result<(), PlaybackError> {
        match self {
            Termination::Completed => Ok(()),
            Termination::Cancelled => Err(PlaybackError::ExpectedTermination),
            Termination::Failed(detail) => Err(PlaybackError::UnexpectedTermination { detail }),
        }
    }
}

/// Cancel signal and exit report for a running fetch process.
///
/// Cloning is cheap; all clones control the same process.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    token: CancellationToken,
    exit: watch::Receiver<Option<Termination>>,
}

impl SourceHandle {
    pub(crate) fn new(token: CancellationToken, exit: watch::Receiver<Option<Termination>>) -> Self {
        Self { token, exit }
    }

    /// Requests termination. Safe to call any number of times, also after exit.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Exit outcome, if the process has already ended.
    pub fn termination(&self) -> Option<Termination> {
        self.exit.borrow().clone()
    }

    /// Waits until the process has ended and reports how.
    pub async fn wait(&mut self) -> Termination {
        match self.exit.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Termination::Cancelled),
            Err(_) => Termination::Failed("supervisor dropped before reporting".into()),
        }
    }
}

/// One running fetch: the audio bytes plus the handle that controls the process.
pub struct TrackSource {
    reference: String,
    stream: ByteStream,
    handle: SourceHandle,
}

impl TrackSource {
    pub fn new(reference: impl Into<String>, stream: ByteStream, handle: SourceHandle) -> Self {
        Self {
            reference: reference.into(),
            stream,
            handle,
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn handle(&self) -> &SourceHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (ByteStream, SourceHandle) {
        (self.stream, self.handle)
    }
}

impl std::fmt::Debug for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSource")
            .field("reference", &self.reference)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}
