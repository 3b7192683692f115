//! Mailbox monitoring and shared registry gauges.
//!
//! | Actor      | Normal | Warning  | Critical |
//! |------------|--------|----------|----------|
//! | Registry   | < 256  | 256-1024 | > 1024   |
//! | Connection | < 32   | 32-128   | > 128    |
//!
//! Connection mailboxes are bounded at [`CONNECTION_MAILBOX_CAPACITY`]; a
//! full mailbox drops the outbound message and counts it.

use crate::observability::metrics as prom;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const REGISTRY_MAILBOX_NORMAL: usize = 256;
pub const REGISTRY_MAILBOX_WARNING: usize = 1024;
pub const REGISTRY_MAILBOX_CAPACITY: usize = 2048;

pub const CONNECTION_MAILBOX_NORMAL: usize = 32;
pub const CONNECTION_MAILBOX_WARNING: usize = 128;
pub const CONNECTION_MAILBOX_CAPACITY: usize = 256;

/// Actor type for log fields and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `RegistryActor` (singleton).
    Registry,
    /// `ConnectionActor` (one per signaling channel).
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_WARNING,
            ActorType::Connection => CONNECTION_MAILBOX_WARNING,
        }
    }

    #[must_use]
    pub const fn normal_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_NORMAL,
            ActorType::Connection => CONNECTION_MAILBOX_NORMAL,
        }
    }
}

/// Mailbox depth level for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks queue depth of one actor's mailbox.
#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    messages_processed: AtomicU64,
    messages_dropped: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Record a message entering the mailbox.
    pub fn record_enqueue(&self) {
        let new_depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(new_depth, Ordering::Relaxed);

        match self.level_for_depth(new_depth) {
            MailboxLevel::Critical => warn!(
                target: "rs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                threshold = self.actor_type.warning_threshold(),
                "Mailbox depth critical"
            ),
            // Log once on crossing into the warning band
            MailboxLevel::Warning if new_depth == self.actor_type.normal_threshold() + 1 => debug!(
                target: "rs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth = new_depth,
                "Mailbox depth elevated"
            ),
            _ => {}
        }
    }

    /// Record a message leaving the mailbox.
    pub fn record_dequeue(&self) {
        // Saturate: a dequeue without a matching enqueue must not wrap
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a message dropped because the mailbox was full or closed.
    pub fn record_drop(&self) {
        let dropped = self.messages_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        prom::record_outbound_dropped(self.actor_type.as_str());
        warn!(
            target: "rs.actor.mailbox",
            actor_type = self.actor_type.as_str(),
            actor_id = %self.actor_id,
            dropped,
            "Message dropped due to backpressure"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.level_for_depth(self.current_depth())
    }

    fn level_for_depth(&self, depth: usize) -> MailboxLevel {
        if depth > self.actor_type.warning_threshold() {
            MailboxLevel::Critical
        } else if depth > self.actor_type.normal_threshold() {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

/// Registry-wide counts shared with the HTTP layer.
///
/// The registry actor is the only writer; readers (readiness checks, tests)
/// see eventually consistent values.
#[derive(Debug, Default)]
pub struct RegistryGauges {
    rooms: AtomicUsize,
    connections: AtomicUsize,
    reconnecting: AtomicUsize,
}

/// Point-in-time copy of [`RegistryGauges`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryGaugesSnapshot {
    pub rooms: usize,
    pub connections: usize,
    pub reconnecting: usize,
}

impl RegistryGauges {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store new values and mirror them to Prometheus.
    pub fn update(&self, rooms: usize, connections: usize, reconnecting: usize) {
        self.rooms.store(rooms, Ordering::SeqCst);
        self.connections.store(connections, Ordering::SeqCst);
        self.reconnecting.store(reconnecting, Ordering::SeqCst);

        prom::set_rooms_active(rooms);
        prom::set_connections_active(connections);
        prom::set_reconnecting_identities(reconnecting);
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistryGaugesSnapshot {
        RegistryGaugesSnapshot {
            rooms: self.rooms.load(Ordering::SeqCst),
            connections: self.connections.load(Ordering::SeqCst),
            reconnecting: self.reconnecting.load(Ordering::SeqCst),
        }
    }
}
