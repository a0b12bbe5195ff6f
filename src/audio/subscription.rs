use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        channel::{PlaybackChannel, SessionId, SessionSevered, VoiceConnector},
        engine::{AudioEngine, IdleReceiver, PlaybackId},
        error::PlaybackError,
        queue::{QueueEntry, QueueSnapshot, TrackQueue},
        registry::SubscriptionMap,
    },
    sources::{MediaFetcher, SourceHandle, Termination},
};

/// Result of a successful `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    /// The track began streaming right away.
    Started,
    /// Something else is playing; the track waits at this 1-based position.
    Queued { position: usize },
}

/// What one `advance` pass did.
#[derive(Debug, Default)]
pub struct Advance {
    pub started: Option<QueueEntry>,
    /// Tracks dropped because their source failed, in queue order.
    pub failed: Vec<(QueueEntry, PlaybackError)>,
    /// The queue ran dry and the subscription was torn down.
    pub finished: bool,
}

struct ActiveTrack {
    playback: PlaybackId,
    entry: QueueEntry,
    source: SourceHandle,
}

struct LiveSession {
    id: SessionId,
    channel: Arc<dyn PlaybackChannel>,
}

struct SubscriptionState {
    connection: Option<LiveSession>,
    next_session: u64,
    queue: TrackQueue,
    active: Option<ActiveTrack>,
    closed: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    Channel,
    AlreadyGone,
}

/// One guild's playback: voice connection, engine and FIFO queue.
///
/// Every handler takes the state lock for its whole run, including starting
/// the next source, so two events for the same guild never interleave.
/// Events for different guilds only share the registry map.
pub struct GuildSubscription {
    guild_id: GuildId,
    engine: AudioEngine,
    state: Mutex<SubscriptionState>,
    fetcher: Arc<dyn MediaFetcher>,
    connector: Arc<dyn VoiceConnector>,
    severed_tx: mpsc::UnboundedSender<SessionId>,
    registry: Weak<SubscriptionMap>,
}

impl GuildSubscription {
    /// Builds the subscription and spawns the task that reacts to engine idle
    /// notices and to severed voice sessions.
    pub(crate) fn spawn(
        guild_id: GuildId,
        fetcher: Arc<dyn MediaFetcher>,
        connector: Arc<dyn VoiceConnector>,
        registry: Weak<SubscriptionMap>,
        max_queue_size: usize,
    ) -> Arc<Self> {
        let (engine, idle_rx) = AudioEngine::new();
        let (severed_tx, severed_rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(Self {
            guild_id,
            engine,
            state: Mutex::new(SubscriptionState {
                connection: None,
                next_session: 0,
                queue: TrackQueue::new(max_queue_size),
                active: None,
                closed: false,
            }),
            fetcher,
            connector,
            severed_tx,
            registry,
        });

        tokio::spawn(listen(Arc::downgrade(&subscription), idle_rx, severed_rx));
        info!("🆕 Suscripción creada para guild {}", guild_id);
        subscription
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Appends `reference`; starts it immediately when nothing is active.
    ///
    /// Connects to `channel_id` on first use. If the track is the one that
    /// would start and its source fails, the error is returned and the queue
    /// keeps advancing.
    pub async fn enqueue(
        self: &Arc<Self>,
        channel_id: ChannelId,
        reference: &str,
        requested_by: UserId,
    ) -> Result<Enqueued, PlaybackError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(PlaybackError::Closed);
        }

        if state.connection.is_none() {
            let session = SessionId::new(state.next_session);
            state.next_session += 1;
            let severed = SessionSevered::new(session, self.severed_tx.clone());
            match self.connector.connect(self.guild_id, channel_id, severed).await {
                Ok(channel) => {
                    self.engine.attach(channel.clone());
                    state.connection = Some(LiveSession { id: session, channel });
                }
                Err(e) => {
                    warn!("No se pudo conectar en guild {}: {}", self.guild_id, e);
                    self.teardown(&mut state, Disconnect::AlreadyGone).await;
                    return Err(e);
                }
            }
        }

        let entry = state.queue.push(reference, requested_by)?;

        // Mientras haya una pista activa (aunque su aviso idle esté pendiente)
        // el siguiente arranque le corresponde a on_engine_idle.
        if state.active.is_some() {
            let position = state.queue.position(entry.ticket).unwrap_or(state.queue.len());
            return Ok(Enqueued::Queued { position });
        }

        let advance = self.advance(&mut state).await;
        if advance.started.as_ref().map(|e| e.ticket) == Some(entry.ticket) {
            return Ok(Enqueued::Started);
        }
        if let Some((_, err)) = advance.failed.into_iter().find(|(e, _)| e.ticket == entry.ticket) {
            return Err(err);
        }
        match state.queue.position(entry.ticket) {
            Some(position) => Ok(Enqueued::Queued { position }),
            None => Err(PlaybackError::Closed),
        }
    }

    /// Reaction to the engine's idle notice for `playback`.
    pub async fn on_engine_idle(self: &Arc<Self>, playback: PlaybackId) -> Advance {
        let mut state = self.state.lock().await;
        if state.closed {
            debug!("Aviso idle {:?} tras cerrar guild {}, ignorado", playback, self.guild_id);
            return Advance::default();
        }

        match state.active.take() {
            Some(active) if active.playback == playback => {
                if let Some(Err(e)) = active.source.termination().map(Termination::into_result) {
                    debug!("Fuente de {} ya había terminado: {}", active.entry.reference, e);
                }
                // con stdout agotado el supervisor reporta la salida real, no Cancelled
                active.source.cancel();
                info!("⏹️ Terminó {} en guild {}", active.entry.reference, self.guild_id);
            }
            other => {
                debug!("Aviso idle obsoleto {:?} en guild {}", playback, self.guild_id);
                state.active = other;
                return Advance::default();
            }
        }

        self.advance(&mut state).await
    }

    /// Stops the current track; the resulting idle notice starts the next one.
    ///
    /// Returns false when there was nothing to cut (idle, or a skip is
    /// already waiting on its notice).
    pub async fn skip(&self) -> Result<bool, PlaybackError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(PlaybackError::Closed);
        }
        let Some(active) = state.active.as_ref() else {
            return Ok(false);
        };
        if !self.engine.is_playing() {
            return Ok(false);
        }

        // cancelar antes de cortar: la tubería rota cuenta como terminación esperada
        active.source.cancel();
        let stopped = self.engine.stop();
        if stopped {
            info!("⏭️ Saltando {} en guild {}", active.entry.reference, self.guild_id);
        }
        Ok(stopped)
    }

    /// Hard reset: cancels the source, stops the engine, leaves the channel
    /// and drops out of the registry, whatever is still queued.
    pub async fn stop_all(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        self.teardown(&mut state, Disconnect::Channel).await;
    }

    /// Same as [`stop_all`](Self::stop_all) for a session that was already
    /// severed from outside, so the channel is not disconnected again.
    ///
    /// Ignored unless `session` is the connection currently in use.
    pub async fn on_external_disconnect(self: &Arc<Self>, session: SessionId) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        match &state.connection {
            Some(live) if live.id == session => {}
            _ => {
                debug!("Desconexión de sesión {:?} obsoleta en guild {}", session, self.guild_id);
                return;
            }
        }
        info!("🔌 Bot desconectado externamente en guild {}", self.guild_id);
        self.teardown(&mut state, Disconnect::AlreadyGone).await;
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            now_playing: state.active.as_ref().map(|a| a.entry.clone()),
            pending: state.queue.entries(),
        }
    }

    /// Starts the next queued track, skipping ones whose source fails.
    /// Tears the subscription down when the queue is exhausted.
    ///
    /// Only called with the state lock held and no active track.
    async fn advance(self: &Arc<Self>, state: &mut SubscriptionState) -> Advance {
        let mut outcome = Advance::default();

        while let Some(entry) = state.queue.pop() {
            let source = match self.fetcher.fetch(&entry.reference).await {
                Ok(source) => source,
                Err(e) => {
                    warn!(
                        "⚠️ Pista de <@{}> descartada en guild {}: {}",
                        entry.requested_by, self.guild_id, e
                    );
                    outcome.failed.push((entry, e));
                    continue;
                }
            };

            debug!("Fuente lista para {}", source.reference());
            let (stream, handle) = source.into_parts();
            match self.engine.play(stream).await {
                Ok(playback) => {
                    info!("🎵 Ahora transmitiendo en guild {}: {}", self.guild_id, entry.reference);
                    state.active = Some(ActiveTrack {
                        playback,
                        entry: entry.clone(),
                        source: handle,
                    });
                    outcome.started = Some(entry);
                    return outcome;
                }
                Err(PlaybackError::EngineBusy) => {
                    // no debería ocurrir: el lock serializa los arranques
                    error!("❌ Motor ocupado al avanzar en guild {}", self.guild_id);
                    handle.cancel();
                    outcome.failed.push((entry, PlaybackError::EngineBusy));
                    return outcome;
                }
                Err(e) => {
                    warn!("⚠️ No se pudo reproducir {} en guild {}: {}", entry.reference, self.guild_id, e);
                    handle.cancel();
                    outcome.failed.push((entry, e));
                }
            }
        }

        self.teardown(state, Disconnect::Channel).await;
        outcome.finished = true;
        outcome
    }

    async fn teardown(self: &Arc<Self>, state: &mut SubscriptionState, disconnect: Disconnect) {
        state.closed = true;
        state.queue.clear();

        if let Some(active) = state.active.take() {
            active.source.cancel();
        }
        self.engine.stop();
        self.engine.detach();

        if let Some(live) = state.connection.take() {
            if disconnect == Disconnect::Channel {
                if let Err(e) = live.channel.disconnect().await {
                    warn!("Error al desconectar guild {}: {}", self.guild_id, e);
                }
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.guild_id, |_, current| Arc::ptr_eq(current, self));
        }
        info!("🧹 Suscripción eliminada para guild {}", self.guild_id);
    }
}

async fn listen(
    subscription: Weak<GuildSubscription>,
    mut idle_rx: IdleReceiver,
    mut severed_rx: mpsc::UnboundedReceiver<SessionId>,
) {
    loop {
        tokio::select! {
            Some(playback) = idle_rx.recv() => {
                let Some(subscription) = subscription.upgrade() else {
                    break;
                };
                let advance = subscription.on_engine_idle(playback).await;
                for (entry, err) in &advance.failed {
                    debug!("Fallo al avanzar {} (pedido por {}): {}", entry.reference, entry.requested_by, err);
                }
                if let Some(entry) = &advance.started {
                    debug!("Avanzó al ticket {} en guild {}", entry.ticket, subscription.guild_id());
                }
                if advance.finished || subscription.is_closed().await {
                    break;
                }
            }
            Some(session) = severed_rx.recv() => {
                let Some(subscription) = subscription.upgrade() else {
                    break;
                };
                subscription.on_external_disconnect(session).await;
                if subscription.is_closed().await {
                    break;
                }
            }
            else => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{
        registry::SubscriptionRegistry,
        testing::{eventually, settle, FakeConnector, FakeFetcher},
    };
    use pretty_assertions::assert_eq;

    fn guild() -> GuildId {
        GuildId::new(1)
    }

    fn voice() -> ChannelId {
        ChannelId::new(10)
    }

    fn user() -> UserId {
        UserId::new(100)
    }

    struct Harness {
        registry: SubscriptionRegistry,
        fetcher: Arc<FakeFetcher>,
        connector: Arc<FakeConnector>,
    }

    impl Harness {
        fn new() -> Self {
            let fetcher = Arc::new(FakeFetcher::default());
            let connector = Arc::new(FakeConnector::default());
            let registry = SubscriptionRegistry::new(fetcher.clone(), connector.clone(), 100);
            Self {
                registry,
                fetcher,
                connector,
            }
        }

        async fn play(&self, reference: &str) -> Result<Enqueued, PlaybackError> {
            self.registry.play(guild(), voice(), reference, user()).await
        }

        fn subscription(&self) -> Arc<GuildSubscription> {
            self.registry.get(guild()).expect("subscription exists")
        }

        async fn now_playing(&self) -> Option<String> {
            match self.registry.get(guild()) {
                Some(sub) => sub.snapshot().await.now_playing.map(|e| e.reference),
                None => None,
            }
        }

        async fn pending(&self) -> Vec<String> {
            match self.registry.get(guild()) {
                Some(sub) => sub.snapshot().await.pending.into_iter().map(|e| e.reference).collect(),
                None => Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn plays_tracks_in_enqueue_order() {
        let h = Harness::new();
        assert_eq!(h.play("a").await, Ok(Enqueued::Started));
        assert_eq!(h.play("b").await, Ok(Enqueued::Queued { position: 1 }));
        assert_eq!(h.play("c").await, Ok(Enqueued::Queued { position: 2 }));

        for expected in ["b", "c"] {
            h.connector.channel.finish_current();
            settle().await;
            assert_eq!(h.now_playing().await.as_deref(), Some(expected));
            assert!(h.connector.channel.live() <= 1);
        }

        h.connector.channel.finish_current();
        settle().await;
        assert_eq!(h.fetcher.fetched(), vec!["a", "b", "c"]);
        assert!(h.registry.get(guild()).is_none());
        assert_eq!(h.connector.channel.disconnects(), 1);
        assert!(h.fetcher.uncancelled().is_empty());
    }

    #[tokio::test]
    async fn second_track_starts_when_first_goes_idle() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        h.play("b").await.unwrap();
        assert_eq!(h.now_playing().await.as_deref(), Some("a"));
        assert_eq!(h.pending().await, vec!["b"]);

        h.connector.channel.finish_current();
        settle().await;

        assert_eq!(h.now_playing().await.as_deref(), Some("b"));
        assert!(h.pending().await.is_empty());
        assert_eq!(h.connector.channel.started(), 2);
    }

    #[tokio::test]
    async fn double_skip_advances_once() {
        let h = Harness::new();
        for reference in ["a", "b", "c"] {
            h.play(reference).await.unwrap();
        }

        let sub = h.subscription();
        assert_eq!(sub.skip().await, Ok(true));
        assert_eq!(sub.skip().await, Ok(false));
        settle().await;

        assert_eq!(h.fetcher.fetched(), vec!["a", "b"]);
        assert_eq!(h.now_playing().await.as_deref(), Some("b"));
        assert_eq!(h.pending().await, vec!["c"]);
        assert_eq!(h.connector.channel.live(), 1);
        // the skipped source was cancelled, not left streaming
        assert!(h.fetcher.handle("a").unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn enqueue_while_idle_notice_pending_does_not_double_start() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        let sub = h.subscription();

        // el motor queda Idle pero el aviso aún no se procesó
        assert_eq!(sub.skip().await, Ok(true));
        assert_eq!(h.play("b").await, Ok(Enqueued::Queued { position: 1 }));
        settle().await;

        assert_eq!(h.fetcher.fetched(), vec!["a", "b"]);
        assert_eq!(h.now_playing().await.as_deref(), Some("b"));
        assert_eq!(h.connector.channel.live(), 1);
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        h.play("b").await.unwrap();
        let sub = h.subscription();

        sub.stop_all().await;
        sub.stop_all().await;

        assert!(sub.is_closed().await);
        assert!(h.registry.get(guild()).is_none());
        assert_eq!(h.connector.channel.disconnects(), 1);
        assert_eq!(h.connector.channel.live(), 0);
        assert!(h.fetcher.uncancelled().is_empty());
        assert_eq!(sub.skip().await, Err(PlaybackError::Closed));
    }

    #[tokio::test]
    async fn late_completion_after_stop_does_not_reanimate() {
        let h = Harness::new();
        h.play("x").await.unwrap();
        h.subscription().stop_all().await;

        // the transport reports the end of "x" after the stop
        h.connector.channel.finish_current();
        settle().await;

        assert!(h.registry.get(guild()).is_none());
        assert_eq!(h.fetcher.fetched(), vec!["x"]);
        assert_eq!(h.connector.connects(), 1);
    }

    #[tokio::test]
    async fn external_disconnect_tears_down_without_disconnecting() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        h.play("b").await.unwrap();

        h.connector.sever(0);
        settle().await;

        assert!(h.registry.get(guild()).is_none());
        assert!(h.fetcher.handle("a").unwrap().is_cancelled());
        assert_eq!(h.connector.channel.live(), 0);
        assert_eq!(h.connector.channel.disconnects(), 0);
        assert_eq!(h.fetcher.fetched(), vec!["a"]);
    }

    #[tokio::test]
    async fn stale_session_loss_keeps_new_subscription() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        h.registry.stop(guild()).await.unwrap();
        assert_eq!(h.play("b").await, Ok(Enqueued::Started));
        assert_eq!(h.connector.connects(), 2);

        // the first session's loss is reported after the new one is up
        h.connector.sever(0);
        settle().await;

        assert!(h.registry.get(guild()).is_some());
        assert_eq!(h.now_playing().await.as_deref(), Some("b"));
        assert_eq!(h.connector.channel.disconnects(), 1);
        assert_eq!(h.fetcher.uncancelled(), vec!["b"]);

        // the live session is still the one that tears down
        h.connector.sever(1);
        settle().await;
        assert!(h.registry.get(guild()).is_none());
        assert_eq!(h.connector.channel.disconnects(), 1);
    }

    #[tokio::test]
    async fn disconnect_for_unknown_session_is_ignored() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        let sub = h.subscription();

        sub.on_external_disconnect(SessionId::new(7)).await;

        assert!(!sub.is_closed().await);
        assert_eq!(h.now_playing().await.as_deref(), Some("a"));

        sub.on_external_disconnect(SessionId::new(0)).await;
        assert!(sub.is_closed().await);
        assert!(h.registry.get(guild()).is_none());
    }

    #[tokio::test]
    async fn failed_source_is_reported_and_queue_moves_on() {
        let h = Harness::new();
        h.fetcher.fail_on("bad");
        h.play("a").await.unwrap();
        h.play("bad").await.unwrap();
        h.play("c").await.unwrap();

        h.connector.channel.finish_current();
        settle().await;

        assert_eq!(h.fetcher.fetched(), vec!["a", "bad", "c"]);
        assert_eq!(h.now_playing().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn failed_first_track_returns_error_and_cleans_up() {
        let h = Harness::new();
        h.fetcher.fail_on("bad");

        let err = h.play("bad").await.unwrap_err();
        assert!(matches!(err, PlaybackError::SourceUnavailable { .. }));
        assert!(h.registry.get(guild()).is_none());
        assert_eq!(h.connector.channel.disconnects(), 1);

        // a later play starts a fresh subscription
        assert_eq!(h.play("good").await, Ok(Enqueued::Started));
        assert_eq!(h.connector.connects(), 2);
    }

    #[tokio::test]
    async fn connect_failure_leaves_no_subscription() {
        let h = Harness::new();
        h.connector.refuse_connections();

        assert!(matches!(h.play("a").await, Err(PlaybackError::Connect(_))));
        assert!(h.registry.get(guild()).is_none());
        assert!(h.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn queue_full_is_rejected_without_disturbing_playback() {
        let fetcher = Arc::new(FakeFetcher::default());
        let connector = Arc::new(FakeConnector::default());
        let registry = SubscriptionRegistry::new(fetcher.clone(), connector.clone(), 1);

        registry.play(guild(), voice(), "a", user()).await.unwrap();
        registry.play(guild(), voice(), "b", user()).await.unwrap();
        assert_eq!(
            registry.play(guild(), voice(), "c", user()).await,
            Err(PlaybackError::QueueFull(1))
        );
        assert_eq!(fetcher.fetched(), vec!["a"]);
        assert!(registry.get(guild()).is_some());
    }

    #[tokio::test]
    async fn stale_idle_notice_is_ignored() {
        let h = Harness::new();
        h.play("a").await.unwrap();
        h.connector.channel.finish_current();
        settle().await;
        assert!(h.registry.get(guild()).is_none());

        h.play("b").await.unwrap();
        h.play("c").await.unwrap();
        let sub = h.subscription();

        // a notice for a playback this subscription never ran
        let advance = sub.on_engine_idle(PlaybackId::from_raw(999)).await;

        assert!(advance.started.is_none());
        assert_eq!(h.now_playing().await.as_deref(), Some("b"));
        assert_eq!(h.pending().await, vec!["c"]);
    }

    #[tokio::test]
    async fn at_most_one_live_stream_under_churn() {
        let h = Harness::new();
        for i in 0..5 {
            h.play(&format!("t{i}")).await.unwrap();
        }
        for _ in 0..4 {
            let sub = h.subscription();
            let _ = sub.skip().await;
            assert!(h.connector.channel.live() <= 1);
            let started = h.connector.channel.started();
            eventually(|| h.connector.channel.started() > started).await;
            assert!(h.connector.channel.live() <= 1);
        }
        assert_eq!(h.now_playing().await.as_deref(), Some("t4"));
        assert_eq!(h.fetcher.uncancelled(), vec!["t4"]);
    }
}
