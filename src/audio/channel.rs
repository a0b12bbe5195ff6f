//! Voice transport seam.
//!
//! [`VoiceConnector`] opens one [`PlaybackChannel`] per guild; the engine
//! pushes byte streams into it. The songbird-backed implementation is the
//! only one used outside tests.
//!
//! Each connection is a numbered session. When a session is lost without
//! our own `disconnect`, the channel fires its [`SessionSevered`] signal,
//! which reaches only the subscription that opened that session.

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::{
        core::io::{MediaSource, ReadOnlySource},
        AudioStream, Input, LiveInput,
    },
    tracks::TrackHandle,
    Call, CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, Songbird,
    TrackEvent,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::{engine::StreamEnd, error::PlaybackError},
    sources::ByteStream,
};

/// Identifies one connection made by a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Fired by a channel when its session ends from outside (kicked, channel
/// deleted, driver gave up reconnecting).
#[derive(Debug, Clone)]
pub struct SessionSevered {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionId>,
}

impl SessionSevered {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionId>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn fire(&self) {
        // el receptor ya no existe si la suscripción se cerró
        let _ = self.tx.send(self.session);
    }
}

/// Opens voice sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Joins `channel_id`; the returned channel fires `severed` at most once.
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        severed: SessionSevered,
    ) -> Result<Arc<dyn PlaybackChannel>, PlaybackError>;
}

/// One live voice session for a guild.
#[async_trait]
pub trait PlaybackChannel: Send + Sync {
    /// Starts sending `stream`; `end` must be fired once the stream stops for any reason.
    async fn start_stream(
        &self,
        stream: ByteStream,
        end: StreamEnd,
    ) -> Result<Box<dyn StreamHandle>, PlaybackError>;

    /// Leaves the voice channel. Calling it again is a no-op.
    async fn disconnect(&self) -> Result<(), PlaybackError>;
}

/// Control over one stream already handed to the transport.
pub trait StreamHandle: Send + Sync {
    fn stop(&self);
}

pub struct SongbirdConnector {
    manager: Arc<Songbird>,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn connect(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        severed: SessionSevered,
    ) -> Result<Arc<dyn PlaybackChannel>, PlaybackError> {
        let call = self
            .manager
            .join(guild_id, channel_id)
            .await
            .map_err(|e| PlaybackError::Connect(e.to_string()))?;

        let watch = Arc::new(SessionWatch::new(severed));
        {
            let mut handler = call.lock().await;
            if let Err(e) = handler.deafen(true).await {
                warn!("No se pudo ensordecer al bot en guild {}: {:?}", guild_id, e);
            }
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DriverDisconnectNotifier {
                    guild_id,
                    watch: watch.clone(),
                },
            );
        }

        info!(
            "🔊 Conectado al canal de voz {} en guild {} (sesión {:?})",
            channel_id,
            guild_id,
            watch.session()
        );
        Ok(Arc::new(SongbirdChannel {
            guild_id,
            manager: self.manager.clone(),
            call,
            watch,
        }))
    }
}

/// Tells our own leave apart from a session lost from outside.
///
/// Songbird reports both as a driver disconnect, so the channel marks its
/// own leave first and only an unmarked disconnect fires the signal.
struct SessionWatch {
    connected: AtomicBool,
    severed: SessionSevered,
}

impl SessionWatch {
    fn new(severed: SessionSevered) -> Self {
        Self {
            connected: AtomicBool::new(true),
            severed,
        }
    }

    fn session(&self) -> SessionId {
        self.severed.session()
    }

    /// Marks a requested leave. False if the session was already over.
    fn leave(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    /// Driver reported the session gone. Returns true when it was not requested.
    fn driver_disconnected(&self) -> bool {
        let external = self.connected.swap(false, Ordering::SeqCst);
        if external {
            self.severed.fire();
        }
        external
    }
}

pub struct SongbirdChannel {
    guild_id: GuildId,
    manager: Arc<Songbird>,
    call: Arc<Mutex<Call>>,
    watch: Arc<SessionWatch>,
}

#[async_trait]
impl PlaybackChannel for SongbirdChannel {
    async fn start_stream(
        &self,
        stream: ByteStream,
        end: StreamEnd,
    ) -> Result<Box<dyn StreamHandle>, PlaybackError> {
        let source: Box<dyn MediaSource> = Box::new(ReadOnlySource::new(stream));
        let input = Input::Live(
            LiveInput::Raw(AudioStream {
                input: source,
                hint: None,
            }),
            None,
        );

        let handle = {
            let mut handler = self.call.lock().await;
            handler.play_only_input(input)
        };

        for event in [TrackEvent::End, TrackEvent::Error] {
            if let Err(e) = handle.add_event(Event::Track(event), TrackEndNotifier { end: end.clone() }) {
                let _ = handle.stop();
                return Err(PlaybackError::Transport(format!(
                    "failed to register track event: {e}"
                )));
            }
        }

        debug!("▶️ Stream {:?} enviado al canal de guild {}", end.id(), self.guild_id);
        Ok(Box::new(SongbirdStream { handle }))
    }

    async fn disconnect(&self) -> Result<(), PlaybackError> {
        if !self.watch.leave() {
            return Ok(());
        }
        self.manager
            .remove(self.guild_id)
            .await
            .map_err(|e| PlaybackError::Transport(e.to_string()))?;
        info!("👋 Desconectado del canal de voz en guild {}", self.guild_id);
        Ok(())
    }
}

struct SongbirdStream {
    handle: TrackHandle,
}

impl StreamHandle for SongbirdStream {
    fn stop(&self) {
        // el track puede haber terminado ya
        let _ = self.handle.stop();
    }
}

/// Forwards songbird's end/error events for a track to the engine.
struct TrackEndNotifier {
    end: StreamEnd,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            for (state, _handle) in *tracks {
                debug!("Track {:?} terminó en estado {:?}", self.end.id(), state.playing);
            }
        }
        self.end.fire();
        None
    }
}

struct DriverDisconnectNotifier {
    guild_id: GuildId,
    watch: Arc<SessionWatch>,
}

#[async_trait]
impl VoiceEventHandler for DriverDisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            if self.watch.driver_disconnected() {
                info!(
                    "🔌 Sesión {:?} perdida en guild {} ({:?}, {:?})",
                    self.watch.session(),
                    self.guild_id,
                    data.kind,
                    data.reason
                );
            } else {
                debug!("Desconexión solicitada confirmada en guild {}", self.guild_id);
            }
        }
        None
    }
}
