use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    audio::{
        channel::VoiceConnector,
        error::PlaybackError,
        queue::QueueSnapshot,
        subscription::{Enqueued, GuildSubscription},
    },
    sources::MediaFetcher,
};

pub(crate) type SubscriptionMap = DashMap<GuildId, Arc<GuildSubscription>>;

/// Process-wide map from guild to its live subscription.
///
/// Entries are only inserted here (on first `play`) and only removed by the
/// subscription's own teardown, so at most one subscription exists per guild.
pub struct SubscriptionRegistry {
    subscriptions: Arc<SubscriptionMap>,
    fetcher: Arc<dyn MediaFetcher>,
    connector: Arc<dyn VoiceConnector>,
    max_queue_size: usize,
}

impl SubscriptionRegistry {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        connector: Arc<dyn VoiceConnector>,
        max_queue_size: usize,
    ) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            fetcher,
            connector,
            max_queue_size,
        }
    }

    pub fn get(&self, guild_id: GuildId) -> Option<Arc<GuildSubscription>> {
        self.subscriptions.get(&guild_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildSubscription> {
        self.subscriptions
            .entry(guild_id)
            .or_insert_with(|| {
                GuildSubscription::spawn(
                    guild_id,
                    self.fetcher.clone(),
                    self.connector.clone(),
                    Arc::downgrade(&self.subscriptions),
                    self.max_queue_size,
                )
            })
            .clone()
    }

    /// `play` command: enqueue on the guild's subscription, creating it if needed.
    pub async fn play(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
        reference: &str,
        requested_by: UserId,
    ) -> Result<Enqueued, PlaybackError> {
        loop {
            let subscription = self.get_or_create(guild_id);
            match subscription.enqueue(channel_id, reference, requested_by).await {
                // se cerró entre la búsqueda y el lock; ya salió del mapa
                Err(PlaybackError::Closed) => {
                    debug!("Suscripción de guild {} cerrada en carrera, reintentando", guild_id);
                    continue;
                }
                result => return result,
            }
        }
    }

    /// `skip` command.
    pub async fn skip(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        let subscription = self.get(guild_id).ok_or(PlaybackError::NothingPlaying)?;
        match subscription.skip().await {
            Ok(true) => Ok(()),
            Ok(false) | Err(PlaybackError::Closed) => Err(PlaybackError::NothingPlaying),
            Err(e) => Err(e),
        }
    }

    /// `stop` command.
    pub async fn stop(&self, guild_id: GuildId) -> Result<(), PlaybackError> {
        let subscription = self.get(guild_id).ok_or(PlaybackError::NothingPlaying)?;
        subscription.stop_all().await;
        Ok(())
    }

    pub async fn snapshot(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        let subscription = self.get(guild_id)?;
        Some(subscription.snapshot().await)
    }

    /// Stops every guild; used on shutdown so no fetch process outlives the bot.
    pub async fn shutdown(&self) {
        if self.is_empty() {
            return;
        }
        info!("🛑 Deteniendo {} suscripciones", self.len());
        let subscriptions: Vec<_> = self.subscriptions.iter().map(|s| s.value().clone()).collect();
        join_all(subscriptions.iter().map(|s| async move {
            debug!("Deteniendo guild {}", s.guild_id());
            s.stop_all().await;
        }))
        .await;
    }
}
