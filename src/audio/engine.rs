use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    audio::{
        channel::{PlaybackChannel, StreamHandle},
        error::PlaybackError,
    },
    sources::ByteStream,
};

/// Identifies one `play` call; idle notices carry it so stale ones can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackId(u64);

#[cfg(test)]
impl PlaybackId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

pub type IdleReceiver = mpsc::UnboundedReceiver<PlaybackId>;

enum EngineState {
    Idle,
    Playing {
        id: PlaybackId,
        // None while the transport is still starting the stream
        stream: Option<Box<dyn StreamHandle>>,
    },
}

struct EngineInner {
    state: Mutex<EngineState>,
    channel: Mutex<Option<Arc<dyn PlaybackChannel>>>,
    idle_tx: mpsc::UnboundedSender<PlaybackId>,
    next_id: AtomicU64,
}

impl EngineInner {
    fn finish(&self, id: PlaybackId) {
        let mut state = self.state.lock();
        if !matches!(&*state, EngineState::Playing { id: current, .. } if *current == id) {
            debug!("Fin de stream {:?} ignorado, ya no está activo", id);
            return;
        }
        *state = EngineState::Idle;
        drop(state);
        self.notify_idle(id);
    }

    fn notify_idle(&self, id: PlaybackId) {
        if self.idle_tx.send(id).is_err() {
            debug!("Nadie escucha el aviso idle de {:?}", id);
        }
    }
}

/// Drives one byte stream at a time into the attached voice channel.
///
/// States are `Idle` and `Playing`. Every playback that reaches `Playing`
/// produces exactly one idle notice, whether it ends on its own or via
/// [`AudioEngine::stop`].
pub struct AudioEngine {
    inner: Arc<EngineInner>,
}

impl AudioEngine {
    pub fn new() -> (Self, IdleReceiver) {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let engine = Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(EngineState::Idle),
                channel: Mutex::new(None),
                idle_tx,
                next_id: AtomicU64::new(0),
            }),
        };
        (engine, idle_rx)
    }

    /// Binds the channel this engine plays through, replacing any previous one.
    pub fn attach(&self, channel: Arc<dyn PlaybackChannel>) {
        *self.inner.channel.lock() = Some(channel);
    }

    pub fn detach(&self) {
        self.inner.channel.lock().take();
    }

    pub fn is_playing(&self) -> bool {
        matches!(&*self.inner.state.lock(), EngineState::Playing { .. })
    }

    /// Moves `Idle -> Playing` and starts forwarding `stream` to the channel.
    pub async fn play(&self, stream: ByteStream) -> Result<PlaybackId, PlaybackError> {
        let channel = self
            .inner
            .channel
            .lock()
            .clone()
            .ok_or(PlaybackError::NoChannel)?;

        let id = {
            let mut state = self.inner.state.lock();
            if let EngineState::Playing { id, .. } = &*state {
                error!("❌ play() con el motor ocupado por {:?}", id);
                return Err(PlaybackError::EngineBusy);
            }
            let id = PlaybackId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
            *state = EngineState::Playing { id, stream: None };
            id
        };

        let end = StreamEnd {
            engine: Arc::downgrade(&self.inner),
            id,
        };

        match channel.start_stream(stream, end).await {
            Ok(handle) => {
                let mut state = self.inner.state.lock();
                let still_current =
                    matches!(&*state, EngineState::Playing { id: current, .. } if *current == id);
                if still_current {
                    *state = EngineState::Playing {
                        id,
                        stream: Some(handle),
                    };
                } else {
                    // stopped or finished while starting
                    drop(state);
                    handle.stop();
                }
                Ok(id)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if matches!(&*state, EngineState::Playing { id: current, .. } if *current == id) {
                    *state = EngineState::Idle;
                }
                Err(e)
            }
        }
    }

    /// Forces `Playing -> Idle`, cutting the stream. Returns false if already idle.
    ///
    /// The idle notice for the cut playback is sent from here; the transport's
    /// own end signal that follows is then ignored.
    pub fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), EngineState::Idle);
        match previous {
            EngineState::Idle => false,
            EngineState::Playing { id, stream } => {
                if let Some(stream) = stream {
                    stream.stop();
                }
                self.inner.notify_idle(id);
                true
            }
        }
    }
}

/// Signal handed to the transport so it can report the end of one stream.
///
/// Firing it more than once, or after [`AudioEngine::stop`], has no effect.
#[derive(Clone)]
pub struct StreamEnd {
    engine: Weak<EngineInner>,
    id: PlaybackId,
}

impl StreamEnd {
    pub fn id(&self) -> PlaybackId {
        self.id
    }

    pub fn fire(&self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.finish(self.id);
        }
    }
}

impl std::fmt::Debug for StreamEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEnd").field("id", &self.id).finish()
    }
}
