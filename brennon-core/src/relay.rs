//! Bridge between the local [`EventBus`] and the network transport.
//!
//! Outbound events are wrapped in an [`Envelope`] stamped with a per-key
//! sequence number. Inbound envelopes from other processes are checked against
//! the last sequence applied for their key and replayed on the local bus as
//! remote events. Our own broadcasts are dropped on receipt since they were
//! applied before being sent.

use crate::bus::EventBus;
use crate::error::{BrennonError, Result};
use crate::events::{
    Event, EventSource, LinkRestored, PlayerJoinedNetwork, PlayerLeftNetwork, PlayerRankChanged,
    PlayerSwitchedServer, PunishmentIssued, PunishmentRevoked, RankDefinitionChanged, ServerGroupChanged,
    ServerGroupDeleted, ServerRegistryChanged, ServerStateChanged,
};
use crate::helpers::bounded;
use async_trait::async_trait;
use scc::hash_map::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Logical channels, one per event category.
pub mod channels {
    pub const RANK_CHANGES: &str = "rank-changes";
    pub const PUNISHMENTS: &str = "punishments";
    pub const TOPOLOGY: &str = "topology";
    pub const PRESENCE: &str = "presence";
}

/// Envelope `kind` values.
pub mod kinds {
    pub const PLAYER_RANK_CHANGED: &str = "PlayerRankChanged";
    pub const RANK_DEFINITION_CHANGED: &str = "RankDefinitionChanged";
    pub const PUNISHMENT_ISSUED: &str = "PunishmentIssued";
    pub const PUNISHMENT_REVOKED: &str = "PunishmentRevoked";
    pub const PLAYER_JOINED_NETWORK: &str = "PlayerJoinedNetwork";
    pub const PLAYER_LEFT_NETWORK: &str = "PlayerLeftNetwork";
    pub const PLAYER_SWITCHED_SERVER: &str = "PlayerSwitchedServer";
    pub const SERVER_STATE_CHANGED: &str = "ServerStateChanged";
    pub const SERVER_GROUP_CHANGED: &str = "ServerGroupChanged";
    pub const SERVER_GROUP_DELETED: &str = "ServerGroupDeleted";
    pub const SERVER_REGISTRY_CHANGED: &str = "ServerRegistryChanged";
}

/// Wire format of one broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub origin_id: String,
    pub sequence_id: u64,
    pub key: String,
    pub kind: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport link is down")]
    Disconnected,

    #[error("transport rejected message: {0}")]
    Rejected(String),
}

/// Pub/sub link to the other processes. At-least-once per channel, no
/// ordering across channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> std::result::Result<(), TransportError>;

    /// Receiver for every envelope on every channel, including our own.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    fn is_connected(&self) -> bool;
}

/// In-process broker. Every [`LocalTransport`] created from the same hub sees
/// every envelope published through any of them.
#[derive(Clone)]
pub struct LocalHub {
    sender: broadcast::Sender<Envelope>,
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            sender: self.sender.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One process's link to a [`LocalHub`]. Cloning shares the link state, so a
/// test can keep a handle and cut the link with `set_connected(false)`.
#[derive(Clone)]
pub struct LocalTransport {
    sender: broadcast::Sender<Envelope>,
    connected: Arc<AtomicBool>,
}

impl LocalTransport {
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish(&self, envelope: Envelope) -> std::result::Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        // No subscribers is not a failure: nobody else is listening yet.
        let _ = self.sender.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Last applied `(sequence, origin)` per `(channel, key)`.
///
/// Ordering is lexicographic on `(sequence, origin)`, so concurrent writers in
/// different processes that pick the same sequence still have a single winner
/// everywhere.
#[derive(Default)]
pub struct SequenceTracker {
    clocks: scc::HashMap<(String, String), (u64, String)>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next sequence for a local update.
    pub fn next(&self, channel: &str, key: &str, floor: u64, origin: &str) -> u64 {
        match self.clocks.entry_sync((channel.to_string(), key.to_string())) {
            Entry::Occupied(mut entry) => {
                let sequence = (entry.get().0 + 1).max(floor);
                *entry.get_mut() = (sequence, origin.to_string());
                sequence
            }
            Entry::Vacant(entry) => {
                let sequence = floor.max(1);
                entry.insert_entry((sequence, origin.to_string()));
                sequence
            }
        }
    }

    /// Record an inbound update. Returns false for duplicates and for anything
    /// not newer than what was already applied.
    pub fn observe(&self, channel: &str, key: &str, sequence: u64, origin: &str) -> bool {
        match self.clocks.entry_sync((channel.to_string(), key.to_string())) {
            Entry::Occupied(mut entry) => {
                let (current, current_origin) = entry.get();
                if (sequence, origin) > (*current, current_origin.as_str()) {
                    *entry.get_mut() = (sequence, origin.to_string());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert_entry((sequence, origin.to_string()));
                true
            }
        }
    }

    pub fn current(&self, channel: &str, key: &str) -> Option<u64> {
        self.clocks
            .read_sync(&(channel.to_string(), key.to_string()), |_, (sequence, _)| *sequence)
    }
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// An event that crosses process boundaries.
pub trait Relayable: Event + Serialize + DeserializeOwned {
    const CHANNEL: &'static str;
    const KIND: &'static str;

    /// Entity the event is about; ordering is per key.
    fn key(&self) -> String;

    /// Lowest sequence a local update may take. Defaults to wall-clock
    /// milliseconds so a restarted process (empty clocks) still orders after
    /// what it published before the restart.
    fn sequence_floor(&self) -> u64 {
        wall_clock_millis()
    }
}

impl Relayable for PlayerRankChanged {
    const CHANNEL: &'static str = channels::RANK_CHANGES;
    const KIND: &'static str = kinds::PLAYER_RANK_CHANGED;

    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

impl Relayable for RankDefinitionChanged {
    const CHANNEL: &'static str = channels::RANK_CHANGES;
    const KIND: &'static str = kinds::RANK_DEFINITION_CHANGED;

    fn key(&self) -> String {
        format!("rank:{}", self.rank_id)
    }
}

// Punishment keys are fresh ids, so plain counters suffice: issuance is 1 and a
// revocation is always at least 2, even from a process that never saw the issue.
impl Relayable for PunishmentIssued {
    const CHANNEL: &'static str = channels::PUNISHMENTS;
    const KIND: &'static str = kinds::PUNISHMENT_ISSUED;

    fn key(&self) -> String {
        self.punishment.id.clone()
    }

    fn sequence_floor(&self) -> u64 {
        1
    }
}

impl Relayable for PunishmentRevoked {
    const CHANNEL: &'static str = channels::PUNISHMENTS;
    const KIND: &'static str = kinds::PUNISHMENT_REVOKED;

    fn key(&self) -> String {
        self.punishment.id.clone()
    }

    fn sequence_floor(&self) -> u64 {
        2
    }
}

impl Relayable for PlayerJoinedNetwork {
    const CHANNEL: &'static str = channels::PRESENCE;
    const KIND: &'static str = kinds::PLAYER_JOINED_NETWORK;

    fn key(&self) -> String {
        self.player.uuid.to_string()
    }
}

impl Relayable for PlayerLeftNetwork {
    const CHANNEL: &'static str = channels::PRESENCE;
    const KIND: &'static str = kinds::PLAYER_LEFT_NETWORK;

    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

impl Relayable for PlayerSwitchedServer {
    const CHANNEL: &'static str = channels::PRESENCE;
    const KIND: &'static str = kinds::PLAYER_SWITCHED_SERVER;

    fn key(&self) -> String {
        self.uuid.to_string()
    }
}

impl Relayable for ServerStateChanged {
    const CHANNEL: &'static str = channels::TOPOLOGY;
    const KIND: &'static str = kinds::SERVER_STATE_CHANGED;

    fn key(&self) -> String {
        self.server.name.clone()
    }
}

impl Relayable for ServerGroupChanged {
    const CHANNEL: &'static str = channels::TOPOLOGY;
    const KIND: &'static str = kinds::SERVER_GROUP_CHANGED;

    fn key(&self) -> String {
        format!("group:{}", self.group.id)
    }
}

// Same key as the group's saves, so a save and a delete have a single winner.
impl Relayable for ServerGroupDeleted {
    const CHANNEL: &'static str = channels::TOPOLOGY;
    const KIND: &'static str = kinds::SERVER_GROUP_DELETED;

    fn key(&self) -> String {
        format!("group:{}", self.group_id)
    }
}

// Shares the heartbeat key: a heartbeat sent before an unregistration is stale
// once the unregistration applied.
impl Relayable for ServerRegistryChanged {
    const CHANNEL: &'static str = channels::TOPOLOGY;
    const KIND: &'static str = kinds::SERVER_REGISTRY_CHANGED;

    fn key(&self) -> String {
        self.name.clone()
    }
}

pub struct MessagingRelay {
    origin_id: String,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    sequences: SequenceTracker,
    timeout: Duration,
    /// Unix seconds when the link was first seen down, 0 while connected
    disconnected_since: AtomicI64,
}

impl MessagingRelay {
    pub fn new(
        origin_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        bus: Arc<EventBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            transport,
            bus,
            sequences: SequenceTracker::new(),
            timeout,
            disconnected_since: AtomicI64::new(0),
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Fail fast for mutations that need the network.
    pub fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrennonError::TransportUnavailable)
        }
    }

    pub fn sequences(&self) -> &SequenceTracker {
        &self.sequences
    }

    /// Reserve the event's sequence number before it is applied locally.
    pub fn stamp<E: Relayable>(&self, event: &mut E) {
        let sequence = self
            .sequences
            .next(E::CHANNEL, &event.key(), event.sequence_floor(), &self.origin_id);
        event.meta_mut().sequence = sequence;
    }

    /// Send an already applied event to the other processes.
    pub async fn broadcast<E: Relayable>(&self, event: &E) -> Result<()> {
        self.ensure_connected()?;

        let key = event.key();
        let sequence_id = match event.meta().sequence {
            0 => self
                .sequences
                .next(E::CHANNEL, &key, event.sequence_floor(), &self.origin_id),
            sequence => sequence,
        };

        let envelope = Envelope {
            channel: E::CHANNEL.to_string(),
            origin_id: self.origin_id.clone(),
            sequence_id,
            key,
            kind: E::KIND.to_string(),
            payload: serde_json::to_vec(event)?,
        };

        debug!(channel = E::CHANNEL, kind = E::KIND, key = %envelope.key, sequence_id, "broadcasting");
        bounded(self.timeout, "transport publish", self.transport.publish(envelope)).await
    }

    /// Stamp, apply locally through the bus, then broadcast.
    pub async fn publish_and_broadcast<E: Relayable>(&self, mut event: E) -> Result<E> {
        self.stamp(&mut event);
        let event = self.bus.publish(event);
        self.broadcast(&event).await?;
        Ok(event)
    }

    /// Apply one inbound envelope. Returns whether it reached the bus.
    pub fn handle_inbound(&self, envelope: Envelope) -> bool {
        if envelope.origin_id == self.origin_id {
            return false;
        }

        match envelope.kind.as_str() {
            kinds::PLAYER_RANK_CHANGED => self.replay::<PlayerRankChanged>(&envelope),
            kinds::RANK_DEFINITION_CHANGED => self.replay::<RankDefinitionChanged>(&envelope),
            kinds::PUNISHMENT_ISSUED => self.replay::<PunishmentIssued>(&envelope),
            kinds::PUNISHMENT_REVOKED => self.replay::<PunishmentRevoked>(&envelope),
            kinds::PLAYER_JOINED_NETWORK => self.replay::<PlayerJoinedNetwork>(&envelope),
            kinds::PLAYER_LEFT_NETWORK => self.replay::<PlayerLeftNetwork>(&envelope),
            kinds::PLAYER_SWITCHED_SERVER => self.replay::<PlayerSwitchedServer>(&envelope),
            kinds::SERVER_STATE_CHANGED => self.replay::<ServerStateChanged>(&envelope),
            kinds::SERVER_GROUP_CHANGED => self.replay::<ServerGroupChanged>(&envelope),
            kinds::SERVER_GROUP_DELETED => self.replay::<ServerGroupDeleted>(&envelope),
            kinds::SERVER_REGISTRY_CHANGED => self.replay::<ServerRegistryChanged>(&envelope),
            other => {
                warn!(kind = other, origin = %envelope.origin_id, "dropping envelope of unknown kind");
                false
            }
        }
    }

    fn replay<E: Relayable>(&self, envelope: &Envelope) -> bool {
        if envelope.channel != E::CHANNEL {
            warn!(kind = E::KIND, channel = %envelope.channel, "dropping envelope on wrong channel");
            return false;
        }

        let mut event: E = match serde_json::from_slice(&envelope.payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(kind = E::KIND, origin = %envelope.origin_id, error = %err, "dropping malformed envelope");
                return false;
            }
        };

        if event.key() != envelope.key {
            warn!(kind = E::KIND, key = %envelope.key, "dropping envelope with mismatched key");
            return false;
        }

        if !self
            .sequences
            .observe(E::CHANNEL, &envelope.key, envelope.sequence_id, &envelope.origin_id)
        {
            debug!(
                kind = E::KIND,
                key = %envelope.key,
                sequence_id = envelope.sequence_id,
                "dropping duplicate or stale envelope"
            );
            return false;
        }

        let meta = event.meta_mut();
        meta.source = EventSource::Remote(envelope.origin_id.clone());
        meta.sequence = envelope.sequence_id;
        self.bus.publish(event);
        true
    }

    /// Start consuming inbound envelopes. The subscription is taken before
    /// this returns, so nothing published afterwards is missed.
    pub fn spawn_inbound(self: &Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.transport.subscribe();
        let relay: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        let Some(relay) = relay.upgrade() else {
                            break;
                        };
                        if !relay.is_connected() {
                            debug!(kind = %envelope.kind, "link down, dropping inbound envelope");
                            continue;
                        }
                        relay.handle_inbound(envelope);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "relay fell behind, envelopes were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("relay inbound loop stopped");
        })
    }

    /// Track link transitions. Returns the current link state.
    ///
    /// On the lost to restored transition a local [`LinkRestored`] is
    /// published, since everything broadcast in between was dropped here.
    pub fn check_connection(&self, now: i64) -> bool {
        let connected = self.is_connected();
        if connected {
            let since = self.disconnected_since.swap(0, Ordering::SeqCst);
            if since != 0 {
                let down_for_secs = (now - since).max(0);
                info!(down_for_secs, "transport link restored");
                self.bus.publish(LinkRestored::new(down_for_secs));
            }
        } else if self
            .disconnected_since
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            warn!("transport link lost, serving cached state");
        }
        connected
    }

    /// Seconds the link has been down, None while connected.
    pub fn disconnected_for(&self, now: i64) -> Option<i64> {
        if self.check_connection(now) {
            return None;
        }
        let since = self.disconnected_since.load(Ordering::SeqCst);
        Some((now - since).max(0))
    }

    /// Whether cached punishment state can no longer be trusted.
    pub fn is_stale(&self, now: i64, threshold: Duration) -> bool {
        match self.disconnected_for(now) {
            Some(down_for) => down_for >= threshold.as_secs() as i64,
            None => false,
        }
    }

    /// Periodically call [`check_connection`](Self::check_connection) so link
    /// loss is reported even when nothing else happens.
    pub fn spawn_health_check(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let relay: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(relay) = relay.upgrade() else {
                    break;
                };
                relay.check_connection(crate::helpers::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn relay(origin: &str, transport: LocalTransport) -> (Arc<MessagingRelay>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let relay = Arc::new(MessagingRelay::new(
            origin,
            Arc::new(transport),
            bus.clone(),
            Duration::from_secs(1),
        ));
        (relay, bus)
    }

    fn rank_envelope(origin: &str, uuid: Uuid, sequence_id: u64, rank: &str) -> Envelope {
        let event = PlayerRankChanged::new(uuid, BTreeSet::from([rank.to_string()]), BTreeSet::new(), None);
        Envelope {
            channel: channels::RANK_CHANGES.to_string(),
            origin_id: origin.to_string(),
            sequence_id,
            key: uuid.to_string(),
            kind: kinds::PLAYER_RANK_CHANGED.to_string(),
            payload: serde_json::to_vec(&event).unwrap(),
        }
    }

    fn record_ranks(bus: &EventBus) -> Arc<Mutex<Vec<BTreeSet<String>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event: &mut PlayerRankChanged| {
            assert!(event.is_remote());
            sink.lock().unwrap().push(event.ranks.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn test_sequence_tracker_orders_by_sequence_then_origin() {
        let tracker = SequenceTracker::new();
        assert!(tracker.observe("c", "k", 5, "a"));
        assert!(!tracker.observe("c", "k", 5, "a"));
        assert!(!tracker.observe("c", "k", 4, "z"));
        assert!(tracker.observe("c", "k", 5, "b"));
        assert!(tracker.observe("c", "other", 1, "a"));
        assert_eq!(tracker.current("c", "k"), Some(5));
    }

    #[test]
    fn test_local_sequences_follow_observed_ones() {
        let tracker = SequenceTracker::new();
        assert_eq!(tracker.next("c", "k", 1, "me"), 1);
        assert_eq!(tracker.next("c", "k", 1, "me"), 2);
        assert!(tracker.observe("c", "k", 10, "peer"));
        assert_eq!(tracker.next("c", "k", 1, "me"), 11);
        assert_eq!(tracker.next("c", "fresh", 2, "me"), 2);
    }

    #[test]
    fn test_own_envelopes_are_ignored() {
        let hub = LocalHub::default();
        let (relay, bus) = relay("node-a", hub.transport());
        let seen = record_ranks(&bus);

        assert!(!relay.handle_inbound(rank_envelope("node-a", Uuid::new_v4(), 1, "vip")));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_delivery_applies_once() {
        let hub = LocalHub::default();
        let (relay, bus) = relay("node-a", hub.transport());
        let seen = record_ranks(&bus);
        let envelope = rank_envelope("node-b", Uuid::new_v4(), 3, "vip");

        assert!(relay.handle_inbound(envelope.clone()));
        assert!(!relay.handle_inbound(envelope));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_out_of_order_delivery_keeps_newest() {
        let hub = LocalHub::default();
        let (relay, bus) = relay("node-a", hub.transport());
        let seen = record_ranks(&bus);
        let uuid = Uuid::new_v4();

        assert!(relay.handle_inbound(rank_envelope("node-b", uuid, 7, "admin")));
        assert!(!relay.handle_inbound(rank_envelope("node-b", uuid, 5, "member")));
        // Different key, unaffected
        assert!(relay.handle_inbound(rank_envelope("node-b", Uuid::new_v4(), 5, "member")));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("admin"));
    }

    #[test]
    fn test_malformed_envelope_does_not_advance_clock() {
        let hub = LocalHub::default();
        let (relay, bus) = relay("node-a", hub.transport());
        let seen = record_ranks(&bus);
        let uuid = Uuid::new_v4();

        let mut broken = rank_envelope("node-b", uuid, 9, "vip");
        broken.payload = b"not json".to_vec();
        assert!(!relay.handle_inbound(broken));
        assert_eq!(relay.sequences().current(channels::RANK_CHANGES, &uuid.to_string()), None);

        assert!(relay.handle_inbound(rank_envelope("node-b", uuid, 2, "vip")));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_fails_fast_when_disconnected() {
        let hub = LocalHub::default();
        let transport = hub.transport();
        let (relay, _bus) = relay("node-a", transport.clone());

        transport.set_connected(false);
        let event = PlayerRankChanged::new(Uuid::new_v4(), BTreeSet::new(), BTreeSet::new(), None);
        let result = relay.broadcast(&event).await;
        assert!(matches!(result, Err(BrennonError::TransportUnavailable)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_peer() {
        let hub = LocalHub::default();
        let (sender, _) = relay("node-a", hub.transport());
        let (receiver, bus) = relay("node-b", hub.transport());
        let seen = record_ranks(&bus);
        let _inbound = receiver.spawn_inbound();

        let uuid = Uuid::new_v4();
        let mut event = PlayerRankChanged::new(uuid, BTreeSet::from(["vip".to_string()]), BTreeSet::new(), None);
        sender.stamp(&mut event);
        sender.broadcast(&event).await.unwrap();

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(
            receiver.sequences().current(channels::RANK_CHANGES, &uuid.to_string()),
            Some(event.meta.sequence)
        );
    }

    #[test]
    fn test_staleness_tracks_link_loss() {
        let hub = LocalHub::default();
        let transport = hub.transport();
        let (relay, _bus) = relay("node-a", transport.clone());
        let threshold = Duration::from_secs(30);

        assert!(!relay.is_stale(1_000, threshold));

        transport.set_connected(false);
        assert!(!relay.is_stale(1_000, threshold));
        assert!(!relay.is_stale(1_029, threshold));
        assert!(relay.is_stale(1_030, threshold));

        transport.set_connected(true);
        assert!(!relay.is_stale(1_100, threshold));
        assert_eq!(relay.disconnected_for(1_100), None);
    }

    #[test]
    fn test_link_restored_is_published_once_per_outage() {
        let hub = LocalHub::default();
        let transport = hub.transport();
        let (relay, bus) = relay("node-a", transport.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |event: &mut LinkRestored| {
            sink.lock().unwrap().push(event.down_for_secs);
            Ok(())
        });

        // Never down: nothing to restore
        assert!(relay.check_connection(1_000));

        transport.set_connected(false);
        assert!(!relay.check_connection(1_000));
        assert!(!relay.check_connection(1_010));
        transport.set_connected(true);
        assert!(relay.check_connection(1_025));
        assert!(relay.check_connection(1_030));

        assert_eq!(*seen.lock().unwrap(), vec![25]);
    }
}
