//! Per-process view of known players.
//!
//! Holds each player's record, their effective permission snapshot and the
//! punishments active at last sync. It is filled on first contact from the
//! store and kept current by domain events, local or replayed by the relay.
//! Exactness across the network is best-effort: this process knows its own
//! sessions for sure and everything else only as far as it has received the
//! peers' presence events (eventual, not linearizable).

use crate::bus::EventBus;
use crate::error::{BrennonError, Result};
use crate::events::{
    Event, LinkRestored, PlayerJoinAttempt, PlayerJoinedNetwork, PlayerLeftNetwork, PlayerRankChanged,
    PlayerSwitchedServer, PunishmentIssued, PunishmentRevoked, RankDefinitionChanged,
};
use crate::helpers::{bounded, now};
use crate::ranks::{EffectivePermissions, RankResolver};
use crate::relay::MessagingRelay;
use crate::validation::{ValidationError, validate_player_name};
use brennon_db::{Database, PlayerName, PlayerRecord, Punishment, PunishmentKind};
use scc::hash_map::Entry;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A player as this process currently sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPlayer {
    pub uuid: Uuid,
    pub name: PlayerName,
    /// Name rendered with the primary rank's prefix and suffix
    pub display_name: String,
    pub ranks: BTreeSet<String>,
    /// Nodes set on the player directly
    pub permissions: BTreeSet<String>,
    pub primary_rank: String,
    pub last_server: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub online: bool,
}

impl NetworkPlayer {
    pub fn to_record(&self) -> PlayerRecord {
        PlayerRecord {
            uuid: self.uuid,
            name: self.name,
            ranks: self.ranks.clone(),
            permissions: self.permissions.clone(),
            last_server: self.last_server.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

/// Immutable cache entry; replaced as a whole on every change.
#[derive(Debug, Clone)]
pub struct PlayerView {
    pub player: NetworkPlayer,
    pub permissions: Arc<EffectivePermissions>,
    pub punishments: Vec<Punishment>,
}

impl PlayerView {
    pub fn active_punishments(&self, now: i64) -> Vec<Punishment> {
        self.punishments
            .iter()
            .filter(|p| p.is_active(now))
            .cloned()
            .collect()
    }

    pub fn active_of_kind(&self, kind: PunishmentKind, now: i64) -> Option<&Punishment> {
        self.punishments
            .iter()
            .find(|p| p.kind == kind && p.is_active(now))
    }

    pub fn is_banned_at(&self, now: i64) -> bool {
        self.active_of_kind(PunishmentKind::Ban, now).is_some()
    }

    pub fn is_muted_at(&self, now: i64) -> bool {
        self.active_of_kind(PunishmentKind::Mute, now).is_some()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired_punishments: usize,
    pub evicted_players: usize,
}

pub struct PresenceCache {
    db: Database,
    bus: Arc<EventBus>,
    relay: Arc<MessagingRelay>,
    ranks: Arc<RankResolver>,
    players: scc::HashMap<Uuid, Arc<PlayerView>>,
    /// Lowercase name -> uuid
    names: scc::HashMap<String, Uuid>,
    store_timeout: Duration,
    staleness_threshold: Duration,
    retention: Duration,
}

impl PresenceCache {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        relay: Arc<MessagingRelay>,
        ranks: Arc<RankResolver>,
        store_timeout: Duration,
        staleness_threshold: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            relay,
            ranks,
            players: scc::HashMap::new(),
            names: scc::HashMap::new(),
            store_timeout,
            staleness_threshold,
            retention,
        }
    }

    /// Keep the cache current from domain events. Must be attached after the
    /// rank resolver so definition changes see the new graph.
    pub fn attach(self: &Arc<Self>) {
        self.on(Self::apply_rank_change);
        self.on(Self::apply_rank_definition);
        self.on(Self::apply_issued);
        self.on(Self::apply_revoked);
        self.on(Self::apply_joined);
        self.on(Self::apply_left);
        self.on(Self::apply_switched);

        let cache: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut LinkRestored| {
            let Some(cache) = cache.upgrade() else {
                return Ok(());
            };
            let down_for_secs = event.down_for_secs;
            let runtime = tokio::runtime::Handle::try_current()?;
            runtime.spawn(async move {
                match cache.resync().await {
                    Ok(players) => info!(players, down_for_secs, "presence resynced after link loss"),
                    Err(err) => error!(error = %err, "presence resync failed"),
                }
            });
            Ok(())
        });
    }

    fn on<E: Event>(self: &Arc<Self>, apply: fn(&Self, &E)) {
        let cache: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut E| {
            if let Some(cache) = cache.upgrade() {
                apply(&cache, event);
            }
            Ok(())
        });
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Cached view, online or not.
    pub fn get_view(&self, uuid: Uuid) -> Option<Arc<PlayerView>> {
        self.players.read_sync(&uuid, |_, view| view.clone())
    }

    /// Player record, loading it from the store on a cache miss.
    pub async fn get_player(&self, uuid: Uuid) -> Result<Option<NetworkPlayer>> {
        if let Some(view) = self.get_view(uuid) {
            return Ok(Some(view.player.clone()));
        }

        let record = bounded(self.store_timeout, "load player", self.db.get_player(uuid)).await?;
        match record {
            Some(record) => Ok(Some(self.populate(record).await?.player.clone())),
            None => Ok(None),
        }
    }

    /// Case-insensitive lookup by last known name.
    pub async fn get_player_by_name(&self, name: &str) -> Result<Option<NetworkPlayer>> {
        let key = name.to_ascii_lowercase();
        if let Some(uuid) = self.names.read_sync(&key, |_, uuid| *uuid) {
            if let Some(view) = self.get_view(uuid) {
                return Ok(Some(view.player.clone()));
            }
        }

        let record = bounded(self.store_timeout, "load player", self.db.get_player_by_name(key)).await?;
        match record {
            Some(record) => Ok(Some(self.populate(record).await?.player.clone())),
            None => Ok(None),
        }
    }

    /// Cache-only lookup. Only valid once the player's join has been processed here.
    pub fn get_online_player(&self, uuid: Uuid) -> Option<Arc<PlayerView>> {
        self.get_view(uuid).filter(|view| view.player.online)
    }

    pub fn is_online(&self, uuid: Uuid) -> bool {
        self.players
            .read_sync(&uuid, |_, view| view.player.online)
            .unwrap_or(false)
    }

    pub fn online_count(&self) -> usize {
        let mut count = 0;
        self.players.iter_sync(|_, view| {
            if view.player.online {
                count += 1;
            }
            true
        });
        count
    }

    pub fn online_players(&self) -> Vec<NetworkPlayer> {
        let mut players = Vec::new();
        self.players.iter_sync(|_, view| {
            if view.player.online {
                players.push(view.player.clone());
            }
            true
        });
        players.sort_by(|a, b| a.name.cmp(&b.name));
        players
    }

    /// Online players currently on `server`.
    pub fn count_on_server(&self, server: &str) -> u32 {
        let mut count = 0;
        self.players.iter_sync(|_, view| {
            if view.player.online && view.player.last_server.as_deref() == Some(server) {
                count += 1;
            }
            true
        });
        count
    }

    pub fn current_server(&self, uuid: Uuid) -> Option<String> {
        self.get_online_player(uuid)
            .and_then(|view| view.player.last_server.clone())
    }

    pub fn has_permission(&self, uuid: Uuid, node: &str) -> bool {
        self.players
            .read_sync(&uuid, |_, view| view.permissions.has_permission(node))
            .unwrap_or(false)
    }

    pub fn permissions(&self, uuid: Uuid) -> Option<Arc<EffectivePermissions>> {
        self.players
            .read_sync(&uuid, |_, view| view.permissions.clone())
    }

    pub fn active_punishments(&self, uuid: Uuid) -> Vec<Punishment> {
        self.active_punishments_at(uuid, now())
    }

    pub fn active_punishments_at(&self, uuid: Uuid, now: i64) -> Vec<Punishment> {
        self.players
            .read_sync(&uuid, |_, view| view.active_punishments(now))
            .unwrap_or_default()
    }

    pub fn is_banned(&self, uuid: Uuid) -> bool {
        self.is_banned_at(uuid, now())
    }

    pub fn is_banned_at(&self, uuid: Uuid, now: i64) -> bool {
        self.players
            .read_sync(&uuid, |_, view| view.is_banned_at(now))
            .unwrap_or(false)
    }

    pub fn is_muted(&self, uuid: Uuid) -> bool {
        self.is_muted_at(uuid, now())
    }

    pub fn is_muted_at(&self, uuid: Uuid, now: i64) -> bool {
        self.players
            .read_sync(&uuid, |_, view| view.is_muted_at(now))
            .unwrap_or(false)
    }

    /// Chat gate consulted for every outbound message.
    pub fn can_chat(&self, uuid: Uuid) -> bool {
        !self.is_muted(uuid)
    }

    /// Whether cached punishment state can no longer be trusted.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(now())
    }

    pub fn is_stale_at(&self, now: i64) -> bool {
        self.relay.is_stale(now, self.staleness_threshold)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    pub async fn handle_join(&self, uuid: Uuid, name: &str, server: &str) -> Result<Arc<PlayerView>> {
        self.handle_join_at(uuid, name, server, now()).await
    }

    /// Admit a player on `server`.
    ///
    /// Refuses when a handler cancels the attempt, when the relay has been
    /// down past the staleness threshold, or when the store holds an active
    /// ban. The cached view is not trusted here: it misses whatever was
    /// broadcast while the link was down.
    pub async fn handle_join_at(&self, uuid: Uuid, name: &str, server: &str, now: i64) -> Result<Arc<PlayerView>> {
        validate_player_name(name)?;
        let player_name =
            PlayerName::try_from(name).map_err(|_| ValidationError::PlayerNameTooLong(name.len()))?;

        let attempt = self.bus.publish(PlayerJoinAttempt::new(uuid, name, server));
        if attempt.is_cancelled() {
            let reason = attempt
                .deny_reason
                .unwrap_or_else(|| "join refused".to_string());
            return Err(BrennonError::Cancelled(reason));
        }

        if self.is_stale_at(now) {
            warn!(%uuid, server, "refusing join, punishment state is stale");
            return Err(BrennonError::Stale);
        }

        let existing = bounded(self.store_timeout, "load player", self.db.get_player(uuid)).await?;
        let mut record = existing.unwrap_or_else(|| {
            info!(%uuid, name, "first network contact");
            PlayerRecord::first_contact(uuid, player_name, &self.ranks.get_default_rank().id, now)
        });
        record.name = player_name;
        record.last_server = Some(server.to_string());
        record.last_seen = now;

        let punishments = bounded(
            self.store_timeout,
            "load punishments",
            self.db.active_punishments(uuid, now),
        )
        .await?;

        if let Some(ban) = punishments
            .iter()
            .find(|p| p.kind == PunishmentKind::Ban && p.is_active(now))
        {
            info!(%uuid, punishment = %ban.id, "refusing join, player is banned");
            return Err(BrennonError::Banned {
                id: ban.id.clone(),
                reason: ban.reason.clone(),
                expires_at: ban.expires_at,
            });
        }

        bounded(self.store_timeout, "save player", self.db.save_player(record.clone())).await?;

        let mut event = PlayerJoinedNetwork::new(record.clone(), server, punishments.clone());
        self.relay.stamp(&mut event);
        let event = self.bus.publish(event);
        if let Err(err) = self.relay.broadcast(&event).await {
            warn!(%uuid, error = %err, "join admitted but not broadcast");
        }

        info!(%uuid, name, server, "player joined");
        Ok(self
            .get_view(uuid)
            .unwrap_or_else(|| Arc::new(self.build_view(record, true, punishments))))
    }

    pub async fn handle_quit(&self, uuid: Uuid) -> Result<()> {
        self.handle_quit_at(uuid, now()).await
    }

    pub async fn handle_quit_at(&self, uuid: Uuid, now: i64) -> Result<()> {
        let view = self
            .get_online_player(uuid)
            .ok_or_else(|| BrennonError::PlayerNotFound(uuid.to_string()))?;

        let mut record = view.player.to_record();
        record.last_seen = now;
        bounded(self.store_timeout, "save player", self.db.save_player(record.clone())).await?;

        let mut event = PlayerLeftNetwork::new(uuid, record.name.as_str(), record.last_server.clone(), now);
        self.relay.stamp(&mut event);
        let event = self.bus.publish(event);
        if let Err(err) = self.relay.broadcast(&event).await {
            warn!(%uuid, error = %err, "quit applied but not broadcast");
        }

        info!(%uuid, "player left");
        Ok(())
    }

    pub async fn handle_switch(&self, uuid: Uuid, server: &str) -> Result<()> {
        self.handle_switch_at(uuid, server, now()).await
    }

    pub async fn handle_switch_at(&self, uuid: Uuid, server: &str, now: i64) -> Result<()> {
        let view = self
            .get_online_player(uuid)
            .ok_or_else(|| BrennonError::PlayerNotFound(uuid.to_string()))?;

        let from = view.player.last_server.clone();
        let mut record = view.player.to_record();
        record.last_server = Some(server.to_string());
        record.last_seen = now;
        bounded(self.store_timeout, "save player", self.db.save_player(record)).await?;

        let mut event = PlayerSwitchedServer::new(uuid, from.clone(), server);
        self.relay.stamp(&mut event);
        let event = self.bus.publish(event);
        if let Err(err) = self.relay.broadcast(&event).await {
            warn!(%uuid, error = %err, "switch applied but not broadcast");
        }

        debug!(%uuid, from = ?from, to = server, "player switched server");
        Ok(())
    }

    /// Drop expired punishments from cached views and forget offline players
    /// not seen within the retention window.
    pub fn sweep(&self, now: i64) -> SweepStats {
        let cutoff = now - self.retention.as_secs() as i64;
        let mut stats = SweepStats::default();
        let mut evicted = Vec::new();

        self.players.retain_sync(|uuid, view| {
            if !view.player.online && view.player.last_seen < cutoff {
                evicted.push((*uuid, view.player.name.to_ascii_lowercase()));
                return false;
            }

            let before = view.punishments.len();
            let active = view.active_punishments(now);
            if active.len() != before {
                stats.expired_punishments += before - active.len();
                let mut next = PlayerView::clone(view);
                next.punishments = active;
                *view = Arc::new(next);
            }
            true
        });

        for (uuid, name) in evicted {
            self.names.remove_if_sync(&name, |owner| *owner == uuid);
            stats.evicted_players += 1;
        }

        if stats != SweepStats::default() {
            debug!(
                expired = stats.expired_punishments,
                evicted = stats.evicted_players,
                "presence sweep"
            );
        }
        stats
    }

    /// Reread grants and active punishments of every cached player from the
    /// store, after refreshing the rank graph. Views changed by an event while
    /// their row was being read are left alone. Returns the number of players
    /// refreshed.
    pub async fn resync(&self) -> Result<usize> {
        self.ranks.refresh().await?;

        let mut cached = Vec::new();
        self.players.iter_sync(|uuid, view| {
            cached.push((*uuid, view.clone()));
            true
        });

        let now = now();
        let mut refreshed = 0;
        for (uuid, seen) in cached {
            let stored = bounded(self.store_timeout, "load player", self.db.get_player(uuid)).await?;
            let punishments = bounded(
                self.store_timeout,
                "load punishments",
                self.db.active_punishments(uuid, now),
            )
            .await?;

            if let Entry::Occupied(mut entry) = self.players.entry_sync(uuid) {
                if !Arc::ptr_eq(entry.get(), &seen) {
                    continue;
                }
                let mut record = seen.player.to_record();
                if let Some(stored) = stored {
                    record.ranks = stored.ranks;
                    record.permissions = stored.permissions;
                }
                *entry.get_mut() = Arc::new(self.build_view(record, seen.player.online, punishments));
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }

    // ========================================================================
    // Event application
    // ========================================================================

    fn build_view(&self, record: PlayerRecord, online: bool, punishments: Vec<Punishment>) -> PlayerView {
        let graph = self.ranks.graph();
        let permissions = Arc::new(graph.resolve_with(&record.ranks, &record.permissions));
        let primary = graph.primary_rank(&record.ranks);

        PlayerView {
            player: NetworkPlayer {
                uuid: record.uuid,
                name: record.name,
                display_name: format!("{}{}{}", primary.prefix, record.name, primary.suffix),
                ranks: record.ranks,
                permissions: record.permissions,
                primary_rank: primary.id.clone(),
                last_server: record.last_server,
                first_seen: record.first_seen,
                last_seen: record.last_seen,
                online,
            },
            permissions,
            punishments,
        }
    }

    /// First-contact fill from the store. Never overwrites an entry that
    /// events created in the meantime.
    async fn populate(&self, record: PlayerRecord) -> Result<Arc<PlayerView>> {
        let uuid = record.uuid;
        let punishments = bounded(
            self.store_timeout,
            "load punishments",
            self.db.active_punishments(uuid, now()),
        )
        .await?;
        let view = Arc::new(self.build_view(record, false, punishments));

        let stored = match self.players.entry_sync(uuid) {
            Entry::Occupied(entry) => return Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert_entry(view.clone());
                view
            }
        };
        self.index_name(&stored.player.name, uuid);
        Ok(stored)
    }

    fn index_name(&self, name: &str, uuid: Uuid) {
        match self.names.entry_sync(name.to_ascii_lowercase()) {
            Entry::Occupied(mut entry) => *entry.get_mut() = uuid,
            Entry::Vacant(entry) => {
                entry.insert_entry(uuid);
            }
        }
    }

    /// Replace an existing entry. Writers for one player are serialized by
    /// the map's entry lock.
    fn update_view<F>(&self, uuid: Uuid, update: F) -> bool
    where
        F: FnOnce(&PlayerView) -> Option<PlayerView>,
    {
        match self.players.entry_sync(uuid) {
            Entry::Occupied(mut entry) => match update(entry.get()) {
                Some(next) => {
                    *entry.get_mut() = Arc::new(next);
                    true
                }
                None => false,
            },
            Entry::Vacant(_) => false,
        }
    }

    fn apply_rank_change(&self, event: &PlayerRankChanged) {
        self.update_view(event.uuid, |view| {
            let mut record = view.player.to_record();
            record.ranks = event.ranks.clone();
            record.permissions = event.permissions.clone();
            Some(self.build_view(record, view.player.online, view.punishments.clone()))
        });
    }

    fn apply_rank_definition(&self, event: &RankDefinitionChanged) {
        self.players.retain_sync(|_, view| {
            let next = self.build_view(view.player.to_record(), view.player.online, view.punishments.clone());
            *view = Arc::new(next);
            true
        });
        debug!(rank = %event.rank_id, "recomputed cached permissions");
    }

    fn apply_issued(&self, event: &PunishmentIssued) {
        let punishment = &event.punishment;
        if !punishment.is_active(now()) {
            return;
        }
        self.update_view(punishment.target, |view| {
            if view.punishments.iter().any(|p| p.id == punishment.id) {
                return None;
            }
            let mut next = view.clone();
            next.punishments.push(punishment.clone());
            Some(next)
        });
    }

    fn apply_revoked(&self, event: &PunishmentRevoked) {
        let punishment = &event.punishment;
        self.update_view(punishment.target, |view| {
            if !view.punishments.iter().any(|p| p.id == punishment.id) {
                return None;
            }
            let mut next = view.clone();
            next.punishments.retain(|p| p.id != punishment.id);
            Some(next)
        });
    }

    fn apply_joined(&self, event: &PlayerJoinedNetwork) {
        let now = now();
        let uuid = event.player.uuid;
        let mut record = event.player.clone();
        record.last_server = Some(event.server.clone());

        let mut punishments: Vec<Punishment> = event
            .active_punishments
            .iter()
            .filter(|p| p.is_active(now))
            .cloned()
            .collect();

        let mut previous_name = None;
        match self.players.entry_sync(uuid) {
            Entry::Occupied(mut entry) => {
                for known in entry.get().active_punishments(now) {
                    if !punishments.iter().any(|p| p.id == known.id) {
                        punishments.push(known);
                    }
                }
                previous_name = Some(entry.get().player.name);
                *entry.get_mut() = Arc::new(self.build_view(record, true, punishments));
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(Arc::new(self.build_view(record, true, punishments)));
            }
        }

        if let Some(previous) = previous_name {
            if !previous.eq_ignore_ascii_case(&event.player.name) {
                self.names
                    .remove_if_sync(&previous.to_ascii_lowercase(), |owner| *owner == uuid);
            }
        }
        self.index_name(&event.player.name, uuid);
    }

    fn apply_left(&self, event: &PlayerLeftNetwork) {
        self.update_view(event.uuid, |view| {
            let mut next = view.clone();
            next.player.online = false;
            next.player.last_seen = event.last_seen;
            if event.last_server.is_some() {
                next.player.last_server = event.last_server.clone();
            }
            Some(next)
        });
    }

    fn apply_switched(&self, event: &PlayerSwitchedServer) {
        self.update_view(event.uuid, |view| {
            let mut next = view.clone();
            next.player.online = true;
            next.player.last_server = Some(event.to.clone());
            next.player.last_seen = event.meta().timestamp;
            Some(next)
        });
    }
}
