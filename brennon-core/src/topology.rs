//! Server fleet view and player routing.

use crate::adapter::PlatformAdapter;
use crate::bus::EventBus;
use crate::cache::PresenceCache;
use crate::error::{BrennonError, Result};
use crate::events::{ServerGroupChanged, ServerGroupDeleted, ServerRegistryChanged, ServerStateChanged};
use crate::helpers::{bounded, now};
use crate::relay::MessagingRelay;
use crate::validation::validate_server_name;
use brennon_db::{Database, DbError, ServerDefinition, ServerGroup};
use scc::hash_map::Entry;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Live status of one server, as last reported by its heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub group: String,
    pub host: String,
    pub port: u16,
    pub player_count: u32,
    pub max_players: u32,
    /// Reported state; see [`ServerInfo::is_alive`]
    pub online: bool,
    pub motd: String,
    pub last_heartbeat: i64,
}

impl ServerInfo {
    fn from_definition(definition: ServerDefinition) -> Self {
        Self {
            name: definition.name,
            group: definition.group,
            host: definition.host,
            port: definition.port,
            player_count: 0,
            max_players: definition.max_players,
            online: false,
            motd: String::new(),
            last_heartbeat: 0,
        }
    }

    /// Reported online and heard from within `timeout`.
    pub fn is_alive(&self, now: i64, timeout: Duration) -> bool {
        self.online && now - self.last_heartbeat < timeout.as_secs() as i64
    }

    pub fn is_full(&self) -> bool {
        self.player_count >= self.max_players
    }
}

/// How this process describes itself in heartbeats.
#[derive(Debug, Clone)]
pub struct LocalServer {
    pub name: String,
    pub group: String,
    pub host: String,
    pub port: u16,
    pub max_players: u32,
    pub motd: String,
}

pub struct ServerTopology {
    db: Database,
    bus: Arc<EventBus>,
    relay: Arc<MessagingRelay>,
    presence: Arc<PresenceCache>,
    adapter: Arc<dyn PlatformAdapter>,
    servers: scc::HashMap<String, ServerInfo>,
    groups: scc::HashMap<String, ServerGroup>,
    local: LocalServer,
    default_group: String,
    heartbeat_timeout: Duration,
    store_timeout: Duration,
}

impl ServerTopology {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        relay: Arc<MessagingRelay>,
        presence: Arc<PresenceCache>,
        adapter: Arc<dyn PlatformAdapter>,
        local: LocalServer,
        default_group: impl Into<String>,
        heartbeat_timeout: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            relay,
            presence,
            adapter,
            servers: scc::HashMap::new(),
            groups: scc::HashMap::new(),
            local,
            default_group: default_group.into(),
            heartbeat_timeout,
            store_timeout,
        }
    }

    /// Load groups and servers from the store, creating the default group,
    /// the local group and the local server entry when missing.
    pub async fn load(&self) -> Result<()> {
        let groups = bounded(self.store_timeout, "load groups", self.db.get_groups()).await?;
        for group in groups {
            self.upsert_group(group);
        }

        for id in [self.default_group.clone(), self.local.group.clone()] {
            if !self.groups.contains_sync(&id) {
                let mut group = ServerGroup::new(id.clone(), 0);
                group.fallback = id == self.default_group;
                bounded(self.store_timeout, "save group", self.db.save_group(group.clone())).await?;
                info!(group = %id, "created server group");
                self.upsert_group(group);
            }
        }

        bounded(
            self.store_timeout,
            "register server",
            self.db.save_server(ServerDefinition {
                name: self.local.name.clone(),
                group: self.local.group.clone(),
                host: self.local.host.clone(),
                port: self.local.port,
                max_players: self.local.max_players,
            }),
        )
        .await?;

        let servers = bounded(self.store_timeout, "load servers", self.db.get_servers()).await?;
        for definition in servers {
            let info = ServerInfo::from_definition(definition);
            // Keep live state learned from heartbeats
            if let Entry::Vacant(entry) = self.servers.entry_sync(info.name.clone()) {
                entry.insert_entry(info);
            }
        }

        info!(
            servers = self.servers.len(),
            groups = self.groups.len(),
            "server topology loaded"
        );
        Ok(())
    }

    /// Track heartbeats, registrations and group changes from every process,
    /// this one included.
    pub fn attach(self: &Arc<Self>) {
        let topology: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut ServerStateChanged| {
            if let Some(topology) = topology.upgrade() {
                topology.upsert_server(event.server.clone());
            }
            Ok(())
        });

        let topology: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut ServerGroupChanged| {
            if let Some(topology) = topology.upgrade() {
                topology.upsert_group(event.group.clone());
            }
            Ok(())
        });

        let topology: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut ServerGroupDeleted| {
            if let Some(topology) = topology.upgrade() {
                topology.groups.remove_sync(&event.group_id);
            }
            Ok(())
        });

        let topology: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut ServerRegistryChanged| {
            if let Some(topology) = topology.upgrade() {
                match &event.server {
                    Some(definition) => topology.upsert_definition(definition.clone()),
                    None => {
                        topology.servers.remove_sync(&event.name);
                    }
                }
            }
            Ok(())
        });
    }

    /// Static fields from a registration; live state from heartbeats is kept.
    fn upsert_definition(&self, definition: ServerDefinition) {
        match self.servers.entry_sync(definition.name.clone()) {
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                info.group = definition.group;
                info.host = definition.host;
                info.port = definition.port;
                info.max_players = definition.max_players;
                info.player_count = info.player_count.min(info.max_players);
            }
            Entry::Vacant(entry) => {
                entry.insert_entry(ServerInfo::from_definition(definition));
            }
        }
    }

    fn upsert_server(&self, mut info: ServerInfo) {
        info.player_count = info.player_count.min(info.max_players);
        match self.servers.entry_sync(info.name.clone()) {
            Entry::Occupied(mut entry) => *entry.get_mut() = info,
            Entry::Vacant(entry) => {
                entry.insert_entry(info);
            }
        }
    }

    fn upsert_group(&self, group: ServerGroup) {
        match self.groups.entry_sync(group.id.clone()) {
            Entry::Occupied(mut entry) => *entry.get_mut() = group,
            Entry::Vacant(entry) => {
                entry.insert_entry(group);
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn local_name(&self) -> &str {
        &self.local.name
    }

    pub fn get_server(&self, name: &str) -> Option<ServerInfo> {
        self.servers.read_sync(name, |_, info| info.clone())
    }

    /// Sorted by name.
    pub fn servers(&self) -> Vec<ServerInfo> {
        let mut servers = Vec::new();
        self.servers.iter_sync(|_, info| {
            servers.push(info.clone());
            true
        });
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub fn online_servers(&self, now: i64) -> Vec<ServerInfo> {
        self.servers()
            .into_iter()
            .filter(|s| s.is_alive(now, self.heartbeat_timeout))
            .collect()
    }

    pub fn servers_by_group(&self, group: &str) -> Vec<ServerInfo> {
        self.servers()
            .into_iter()
            .filter(|s| s.group == group)
            .collect()
    }

    pub fn is_alive(&self, server: &ServerInfo, now: i64) -> bool {
        server.is_alive(now, self.heartbeat_timeout)
    }

    pub fn group(&self, id: &str) -> Option<ServerGroup> {
        self.groups.read_sync(id, |_, group| group.clone())
    }

    pub fn groups(&self) -> Vec<ServerGroup> {
        let mut groups = Vec::new();
        self.groups.iter_sync(|_, group| {
            groups.push(group.clone());
            true
        });
        groups.sort_by(|a, b| a.join_priority.cmp(&b.join_priority).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// Players on live servers of a group.
    pub fn group_player_count(&self, group: &str, now: i64) -> u32 {
        self.servers_by_group(group)
            .iter()
            .filter(|s| s.is_alive(now, self.heartbeat_timeout))
            .map(|s| s.player_count)
            .sum()
    }

    pub fn network_player_count(&self, now: i64) -> u32 {
        self.online_servers(now).iter().map(|s| s.player_count).sum()
    }

    fn group_is_full(&self, group: &ServerGroup, now: i64) -> bool {
        group
            .max_players
            .is_some_and(|max| self.group_player_count(&group.id, now) >= max)
    }

    /// Live, non-full server of a group with the fewest players.
    pub fn least_loaded_server(&self, group: &str, now: i64) -> Option<ServerInfo> {
        self.servers_by_group(group)
            .into_iter()
            .filter(|s| s.is_alive(now, self.heartbeat_timeout) && !s.is_full())
            .min_by(|a, b| a.player_count.cmp(&b.player_count).then_with(|| a.name.cmp(&b.name)))
    }

    /// Pick where to put a player with no explicit target.
    ///
    /// Candidates are live, non-full servers in the default group or any group
    /// flagged as fallback, never in restricted or full groups. Lowest group
    /// join priority wins, then lowest player count.
    pub fn select_fallback(&self, exclude: Option<&str>, now: i64) -> Option<ServerInfo> {
        let groups: Vec<ServerGroup> = self
            .groups()
            .into_iter()
            .filter(|g| (g.id == self.default_group || g.fallback) && !g.restricted)
            .filter(|g| !self.group_is_full(g, now))
            .collect();

        self.servers()
            .into_iter()
            .filter(|s| Some(s.name.as_str()) != exclude)
            .filter(|s| s.is_alive(now, self.heartbeat_timeout) && !s.is_full())
            .filter_map(|s| {
                let priority = groups.iter().find(|g| g.id == s.group)?.join_priority;
                Some((priority, s))
            })
            .min_by(|(pa, a), (pb, b)| {
                pa.cmp(pb)
                    .then_with(|| a.player_count.cmp(&b.player_count))
                    .then_with(|| a.name.cmp(&b.name))
            })
            .map(|(_, server)| server)
    }

    // ========================================================================
    // Routing
    // ========================================================================

    pub async fn send_player(&self, uuid: Uuid, server: &str) -> Result<()> {
        self.send_player_at(uuid, server, now()).await
    }

    /// Move a player to `server`. Checks run in order: existence, liveness,
    /// group restriction, group capacity, server capacity. A server in a group
    /// this process does not know is refused. Nothing changes on failure.
    pub async fn send_player_at(&self, uuid: Uuid, server: &str, now: i64) -> Result<()> {
        let target = self
            .get_server(server)
            .ok_or_else(|| BrennonError::ServerNotFound(server.to_string()))?;

        if !target.is_alive(now, self.heartbeat_timeout) {
            return Err(BrennonError::ServerOffline(target.name));
        }

        let group = self
            .group(&target.group)
            .ok_or_else(|| BrennonError::GroupNotFound(target.group.clone()))?;
        if group.restricted && !self.presence.has_permission(uuid, &group.bypass_permission()) {
            return Err(BrennonError::Restricted(group.id));
        }
        if self.group_is_full(&group, now) {
            return Err(BrennonError::GroupFull(group.id));
        }

        if target.is_full() {
            return Err(BrennonError::ServerFull(target.name));
        }

        if !self.presence.is_online(uuid) {
            return Err(BrennonError::PlayerNotFound(uuid.to_string()));
        }

        self.adapter.transfer(uuid, &target.name).await?;
        self.presence.handle_switch_at(uuid, &target.name, now).await?;
        info!(%uuid, server = %target.name, "player sent");
        Ok(())
    }

    /// Send a player to the best fallback server other than their current one.
    pub async fn connect_fallback(&self, uuid: Uuid) -> Result<ServerInfo> {
        let now = now();
        let current = self.presence.current_server(uuid);
        let target = self
            .select_fallback(current.as_deref(), now)
            .ok_or(BrennonError::NoFallbackServer)?;

        self.send_player_at(uuid, &target.name, now).await?;
        Ok(target)
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create or replace a group definition and tell the network.
    pub async fn save_group(&self, group: ServerGroup) -> Result<ServerGroup> {
        validate_server_name(&group.id)?;
        self.relay.ensure_connected()?;

        bounded(self.store_timeout, "save group", self.db.save_group(group.clone())).await?;
        self.relay
            .publish_and_broadcast(ServerGroupChanged::new(group.clone()))
            .await?;
        info!(group = %group.id, "server group saved");
        Ok(group)
    }

    /// Delete an empty group. The default group and the local group stay.
    pub async fn delete_group(&self, id: &str) -> Result<()> {
        if self.group(id).is_none() {
            return Err(BrennonError::GroupNotFound(id.to_string()));
        }
        if id == self.default_group || id == self.local.group {
            return Err(BrennonError::Configuration(format!("cannot delete server group {id}")));
        }
        if !self.servers_by_group(id).is_empty() {
            return Err(BrennonError::GroupNotEmpty(id.to_string()));
        }
        self.relay.ensure_connected()?;

        bounded(self.store_timeout, "delete group", self.db.delete_group(id.to_string()))
            .await
            .or_else(|err| match err {
                // Known from events only
                BrennonError::Database(DbError::GroupNotFound) => Ok(()),
                err => Err(err),
            })?;
        self.relay
            .publish_and_broadcast(ServerGroupDeleted::new(id))
            .await?;
        info!(group = id, "server group deleted");
        Ok(())
    }

    /// Declare a new server. Names are unique across the network and the
    /// group must exist.
    pub async fn register_server(&self, definition: ServerDefinition) -> Result<ServerInfo> {
        validate_server_name(&definition.name)?;
        if self.get_server(&definition.name).is_some() {
            return Err(BrennonError::ServerExists(definition.name));
        }
        if self.group(&definition.group).is_none() {
            return Err(BrennonError::GroupNotFound(definition.group));
        }
        self.relay.ensure_connected()?;

        bounded(self.store_timeout, "register server", self.db.save_server(definition.clone())).await?;
        self.relay
            .publish_and_broadcast(ServerRegistryChanged::registered(definition.clone()))
            .await?;
        info!(server = %definition.name, group = %definition.group, "server registered");
        Ok(ServerInfo::from_definition(definition))
    }

    /// Forget a server. A server that keeps sending heartbeats reappears.
    pub async fn unregister_server(&self, name: &str) -> Result<()> {
        if self.get_server(name).is_none() {
            return Err(BrennonError::ServerNotFound(name.to_string()));
        }
        if name == self.local.name {
            return Err(BrennonError::Configuration(format!("cannot unregister local server {name}")));
        }
        self.relay.ensure_connected()?;

        bounded(self.store_timeout, "unregister server", self.db.delete_server(name.to_string()))
            .await
            .or_else(|err| match err {
                // Known from heartbeats only
                BrennonError::Database(DbError::ServerNotFound) => Ok(()),
                err => Err(err),
            })?;
        self.relay
            .publish_and_broadcast(ServerRegistryChanged::unregistered(name))
            .await?;
        info!(server = name, "server unregistered");
        Ok(())
    }

    /// Current status of this process as a heartbeat.
    pub fn local_status(&self, online: bool, now: i64) -> ServerInfo {
        ServerInfo {
            name: self.local.name.clone(),
            group: self.local.group.clone(),
            host: self.local.host.clone(),
            port: self.local.port,
            player_count: self.presence.count_on_server(&self.local.name),
            max_players: self.local.max_players,
            online,
            motd: self.local.motd.clone(),
            last_heartbeat: now,
        }
    }

    /// Publish this process's heartbeat locally and to the network.
    pub async fn report_local_status(&self, online: bool, now: i64) -> Result<()> {
        let status = self.local_status(online, now);
        debug!(server = %status.name, players = status.player_count, online, "heartbeat");
        self.relay
            .publish_and_broadcast(ServerStateChanged::new(status))
            .await?;
        Ok(())
    }
}
