//! In-memory stand-ins for the fetcher and voice transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    collections::HashSet,
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    audio::{
        channel::{PlaybackChannel, SessionSevered, StreamHandle, VoiceConnector},
        engine::StreamEnd,
        error::PlaybackError,
    },
    sources::{ByteStream, MediaFetcher, SourceHandle, TrackSource},
};

pub fn stream(content: &str) -> ByteStream {
    Box::new(Cursor::new(content.as_bytes().to_vec()))
}

/// Fetcher that succeeds instantly unless the reference was marked bad.
#[derive(Default)]
pub struct FakeFetcher {
    bad: Mutex<HashSet<String>>,
    fetched: Mutex<Vec<(String, SourceHandle)>>,
}

impl FakeFetcher {
    pub fn fail_on(&self, reference: &str) {
        self.bad.lock().insert(reference.to_string());
    }

    /// References passed to `fetch`, in call order (failed ones included).
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn handle(&self, reference: &str) -> Option<SourceHandle> {
        self.fetched
            .lock()
            .iter()
            .rev()
            .find(|(r, _)| r == reference)
            .map(|(_, h)| h.clone())
    }

    /// Sources that were started and never cancelled.
    pub fn uncancelled(&self) -> Vec<String> {
        self.fetched
            .lock()
            .iter()
            .filter(|(_, h)| !h.is_cancelled())
            .map(|(r, _)| r.clone())
            .collect()
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, reference: &str) -> Result<TrackSource, PlaybackError> {
        let (_tx, rx) = watch::channel(None);
        let handle = SourceHandle::new(CancellationToken::new(), rx);

        if self.bad.lock().contains(reference) {
            handle.cancel();
            self.fetched.lock().push((reference.to_string(), handle));
            return Err(PlaybackError::SourceUnavailable {
                reference: reference.to_string(),
                reason: "unsupported url".into(),
            });
        }

        self.fetched
            .lock()
            .push((reference.to_string(), handle.clone()));
        Ok(TrackSource::new(reference, stream(reference), handle))
    }
}

struct StartedStream {
    end: StreamEnd,
    live: Arc<AtomicBool>,
}

struct FakeStream {
    live: Arc<AtomicBool>,
}

impl StreamHandle for FakeStream {
    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Voice channel that records streams and lets tests end them by hand.
#[derive(Default)]
pub struct FakeChannel {
    streams: Mutex<Vec<StartedStream>>,
    disconnects: AtomicUsize,
    fail_next: AtomicBool,
}

impl FakeChannel {
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Ends the most recent stream as if the source ran dry.
    pub fn finish_current(&self) {
        let end = {
            let streams = self.streams.lock();
            streams.last().map(|s| {
                s.live.store(false, Ordering::SeqCst);
                s.end.clone()
            })
        };
        if let Some(end) = end {
            end.fire();
        }
    }

    pub fn started(&self) -> usize {
        self.streams.lock().len()
    }

    /// Streams started and not yet stopped or finished.
    pub fn live(&self) -> usize {
        self.streams
            .lock()
            .iter()
            .filter(|s| s.live.load(Ordering::SeqCst))
            .count()
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaybackChannel for FakeChannel {
    async fn start_stream(
        &self,
        _stream: ByteStream,
        end: StreamEnd,
    ) -> Result<Box<dyn StreamHandle>, PlaybackError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlaybackError::Transport("driver unavailable".into()));
        }
        let live = Arc::new(AtomicBool::new(true));
        self.streams.lock().push(StartedStream {
            end,
            live: live.clone(),
        });
        Ok(Box::new(FakeStream { live }))
    }

    async fn disconnect(&self) -> Result<(), PlaybackError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out one shared [`FakeChannel`].
///
/// Keeps the severed signal of every session it opened so tests can drop a
/// session from outside, including one that already ended.
#[derive(Default)]
pub struct FakeConnector {
    pub channel: Arc<FakeChannel>,
    connects: AtomicUsize,
    refuse: AtomicBool,
    sessions: Mutex<Vec<SessionSevered>>,
}

impl FakeConnector {
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Severs the `index`-th session opened, counting from zero.
    pub fn sever(&self, index: usize) {
        let severed = self.sessions.lock().get(index).cloned();
        match severed {
            Some(severed) => severed.fire(),
            None => panic!("no session #{index}"),
        }
    }
}

#[async_trait]
impl VoiceConnector for FakeConnector {
    async fn connect(
        &self,
        _guild_id: GuildId,
        _channel_id: ChannelId,
        severed: SessionSevered,
    ) -> Result<Arc<dyn PlaybackChannel>, PlaybackError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PlaybackError::Connect("missing permissions".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().push(severed);
        Ok(self.channel.clone())
    }
}

/// Polls `check` until it holds, failing the test after one second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Gives spawned listener tasks a chance to drain pending notices.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
