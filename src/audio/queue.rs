use chrono::{DateTime, Utc};
use serenity::model::id::UserId;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::audio::error::PlaybackError;

/// A track reference waiting in (or just taken from) a guild queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    /// Monotonic per-queue number, used to recognise an entry after it leaves the queue.
    pub ticket: u64,
    pub reference: String,
    pub requested_by: UserId,
    pub added_at: DateTime<Utc>,
}

/// Strict FIFO of pending track references.
///
/// Only `push` (append) and `pop` (take front) mutate the order; the track
/// currently playing is never part of the queue.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<QueueEntry>,
    max_size: usize,
    next_ticket: u64,
}

impl TrackQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
            next_ticket: 0,
        }
    }

    /// Appends a reference and returns the stored entry.
    pub fn push(
        &mut self,
        reference: impl Into<String>,
        requested_by: UserId,
    ) -> Result<QueueEntry, PlaybackError> {
        if self.items.len() >= self.max_size {
            return Err(PlaybackError::QueueFull(self.max_size));
        }

        let entry = QueueEntry {
            ticket: self.next_ticket,
            reference: reference.into(),
            requested_by,
            added_at: Utc::now(),
        };
        self.next_ticket += 1;

        info!("➕ Agregado a la cola: {}", entry.reference);
        self.items.push_back(entry.clone());
        Ok(entry)
    }

    /// Takes the next track in enqueue order.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        let next = self.items.pop_front();
        match &next {
            Some(entry) => debug!("➡️ Siguiente en cola: {}", entry.reference),
            None => debug!("📭 Cola vacía"),
        }
        next
    }

    /// 1-based position of a pending entry.
    pub fn position(&self, ticket: u64) -> Option<usize> {
        self.items
            .iter()
            .position(|entry| entry.ticket == ticket)
            .map(|index| index + 1)
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            info!("🗑️ Cola limpiada ({} pistas descartadas)", self.items.len());
        }
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn entries(&self) -> Vec<QueueEntry> {
        self.items.iter().cloned().collect()
    }
}

/// Point-in-time view of one guild's playback state.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub now_playing: Option<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Returns at most `limit` pending entries plus how many were left out.
    pub fn head(&self, limit: usize) -> (&[QueueEntry], usize) {
        let shown = limit.min(self.pending.len());
        (&self.pending[..shown], self.pending.len() - shown)
    }
}
