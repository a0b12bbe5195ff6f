//! # Bot Module
//!
//! Discord front end for the playback core.
//!
//! - Prefix message commands (`play`, `stop`, `skip`, `queue`)
//!
//! ## Architecture
//!
//! [`SerenadeBot`] implements Serenity's [`EventHandler`] and forwards every
//! command to the shared [`SubscriptionRegistry`]. Serenity runs each event in
//! its own task, so a failing handler only affects that one message.
//!
//! Losing the voice connection is not handled here: each voice session
//! reports its own loss to the subscription that opened it (see
//! [`crate::audio::channel`]), so a late gateway echo of an earlier leave
//! cannot reach a newer subscription.

use serenity::{
    all::{Context, EventHandler, Message, Ready},
    async_trait,
};
use std::sync::Arc;
use tracing::{error, info};

pub mod commands;
pub mod handlers;

use crate::{audio::registry::SubscriptionRegistry, config::Config};

/// Main Discord event handler.
pub struct SerenadeBot {
    /// Bot configuration loaded from environment variables
    config: Arc<Config>,
    /// Per-guild playback subscriptions
    registry: Arc<SubscriptionRegistry>,
}

impl SerenadeBot {
    pub fn new(config: Arc<Config>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { config, registry }
    }
}

#[async_trait]
impl EventHandler for SerenadeBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());
        info!("⌨️ Prefijo de comandos: {}", self.config.command_prefix);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if let Err(e) = handlers::handle_message(&ctx, &msg, self).await {
            error!("Error manejando mensaje: {:?}", e);
        }
    }
}
