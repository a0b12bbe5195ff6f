//! # Audio Module
//!
//! Per-guild playback for the bot: one subscription per guild, each owning a
//! voice connection, a single-stream engine and a FIFO queue.
//!
//! ## Architecture
//!
//! ### [`registry`] - Subscription Registry
//! - Maps guild to its live [`subscription::GuildSubscription`]
//! - Creates one on first `play`; the subscription removes itself on teardown
//!
//! ### [`subscription`] - Guild Subscription
//! - Serializes enqueue, skip, stop and idle handling behind one lock
//! - Advances the queue, dropping tracks whose source fails
//!
//! ### [`engine`] - Audio Engine
//! - `Idle`/`Playing` state machine over a [`channel::PlaybackChannel`]
//! - Exactly one idle notice per playback
//!
//! ### [`channel`] - Voice Transport
//! - Songbird-backed connector and channel
//! - Numbered sessions; a session lost from outside reports to its own subscription
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! let fetcher = Arc::new(YtDlpFetcher::new(
//!     vec!["yt-dlp".into()],
//!     "bestaudio",
//!     Duration::from_secs(20),
//! ));
//! let connector = Arc::new(SongbirdConnector::new(manager));
//! let registry = SubscriptionRegistry::new(fetcher, connector, 1000);
//!
//! registry
//!     .play(guild_id, channel_id, "https://youtu.be/dQw4w9WgXcQ", user_id)
//!     .await?;
//! registry.skip(guild_id).await?;
//! ```

pub mod channel;
pub mod engine;
pub mod error;
pub mod queue;
pub mod registry;
pub mod subscription;

#[cfg(test)]
pub mod testing;
