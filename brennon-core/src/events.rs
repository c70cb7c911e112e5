//! Domain events.
//!
//! Every event is an immutable description of what changed, carrying enough
//! data to be replayed as a cache update without reading the store again.
//! Two events are published *before* an action happens (`PlayerJoinAttempt`,
//! `PunishmentIssuing`); publishers check `is_cancelled()` afterwards.

use crate::helpers::now;
use crate::topology::ServerInfo;
use brennon_db::{PlayerRecord, Punishment, PunishmentKind, RankDefinition, ServerDefinition, ServerGroup};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Where an event was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventSource {
    /// This process
    #[default]
    Local,
    /// Replayed from a peer's broadcast (origin id)
    Remote(String),
}

/// Bookkeeping shared by all events. Only the timestamp travels over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub timestamp: i64,
    #[serde(skip)]
    pub cancelled: bool,
    #[serde(skip)]
    pub source: EventSource,
    /// Per-key sequence number, 0 until stamped by the relay
    #[serde(skip)]
    pub sequence: u64,
}

impl Default for EventMeta {
    fn default() -> Self {
        Self {
            timestamp: now(),
            cancelled: false,
            source: EventSource::Local,
            sequence: 0,
        }
    }
}

pub trait Event: Any + Send + Sync {
    fn meta(&self) -> &EventMeta;
    fn meta_mut(&mut self) -> &mut EventMeta;

    fn is_cancelled(&self) -> bool {
        self.meta().cancelled
    }

    fn set_cancelled(&mut self, cancelled: bool) {
        self.meta_mut().cancelled = cancelled;
    }

    fn is_remote(&self) -> bool {
        matches!(self.meta().source, EventSource::Remote(_))
    }
}

macro_rules! impl_event {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Event for $ty {
                fn meta(&self) -> &EventMeta {
                    &self.meta
                }

                fn meta_mut(&mut self) -> &mut EventMeta {
                    &mut self.meta
                }
            }
        )*
    };
}

// ============================================================================
// Pre-action events (cancellable, never broadcast)
// ============================================================================

/// A player is about to be admitted. Cancel to refuse the join.
#[derive(Debug, Clone)]
pub struct PlayerJoinAttempt {
    pub meta: EventMeta,
    pub uuid: Uuid,
    pub name: String,
    pub server: String,
    /// Message shown to the player when a handler cancels
    pub deny_reason: Option<String>,
}

impl PlayerJoinAttempt {
    pub fn new(uuid: Uuid, name: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::default(),
            uuid,
            name: name.into(),
            server: server.into(),
            deny_reason: None,
        }
    }

    pub fn deny(&mut self, reason: impl Into<String>) {
        self.deny_reason = Some(reason.into());
        self.set_cancelled(true);
    }
}

/// A punishment is about to be issued. Cancel to abort it.
#[derive(Debug, Clone)]
pub struct PunishmentIssuing {
    pub meta: EventMeta,
    pub target: Uuid,
    pub kind: PunishmentKind,
    pub reason: String,
    pub issuer: Option<Uuid>,
}

impl PunishmentIssuing {
    pub fn new(target: Uuid, kind: PunishmentKind, reason: impl Into<String>, issuer: Option<Uuid>) -> Self {
        Self {
            meta: EventMeta::default(),
            target,
            kind,
            reason: reason.into(),
            issuer,
        }
    }
}

// ============================================================================
// Rank events
// ============================================================================

/// A player's rank membership or directly held nodes changed. Carries both
/// complete sets, so either kind of change orders against the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRankChanged {
    pub meta: EventMeta,
    pub uuid: Uuid,
    pub ranks: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    pub changed_by: Option<Uuid>,
}

impl PlayerRankChanged {
    pub fn new(
        uuid: Uuid,
        ranks: BTreeSet<String>,
        permissions: BTreeSet<String>,
        changed_by: Option<Uuid>,
    ) -> Self {
        Self {
            meta: EventMeta::default(),
            uuid,
            ranks,
            permissions,
            changed_by,
        }
    }
}

/// A rank definition was created, replaced, or deleted (`definition: None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankDefinitionChanged {
    pub meta: EventMeta,
    pub rank_id: String,
    pub definition: Option<RankDefinition>,
}

impl RankDefinitionChanged {
    pub fn saved(definition: RankDefinition) -> Self {
        Self {
            meta: EventMeta::default(),
            rank_id: definition.id.clone(),
            definition: Some(definition),
        }
    }

    pub fn deleted(rank_id: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::default(),
            rank_id: rank_id.into(),
            definition: None,
        }
    }
}

// ============================================================================
// Punishment events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunishmentIssued {
    pub meta: EventMeta,
    pub punishment: Punishment,
}

impl PunishmentIssued {
    pub fn new(punishment: Punishment) -> Self {
        Self {
            meta: EventMeta::default(),
            punishment,
        }
    }
}

/// Carries the record as stored after revocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunishmentRevoked {
    pub meta: EventMeta,
    pub punishment: Punishment,
}

impl PunishmentRevoked {
    pub fn new(punishment: Punishment) -> Self {
        Self {
            meta: EventMeta::default(),
            punishment,
        }
    }
}

// ============================================================================
// Presence events
// ============================================================================

/// A player was admitted somewhere on the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerJoinedNetwork {
    pub meta: EventMeta,
    pub player: PlayerRecord,
    pub server: String,
    /// The admitting process's view of the player's active punishments
    pub active_punishments: Vec<Punishment>,
}

impl PlayerJoinedNetwork {
    pub fn new(player: PlayerRecord, server: impl Into<String>, active_punishments: Vec<Punishment>) -> Self {
        Self {
            meta: EventMeta::default(),
            player,
            server: server.into(),
            active_punishments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerLeftNetwork {
    pub meta: EventMeta,
    pub uuid: Uuid,
    pub name: String,
    pub last_server: Option<String>,
    pub last_seen: i64,
}

impl PlayerLeftNetwork {
    pub fn new(uuid: Uuid, name: impl Into<String>, last_server: Option<String>, last_seen: i64) -> Self {
        Self {
            meta: EventMeta::default(),
            uuid,
            name: name.into(),
            last_server,
            last_seen,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSwitchedServer {
    pub meta: EventMeta,
    pub uuid: Uuid,
    pub from: Option<String>,
    pub to: String,
}

impl PlayerSwitchedServer {
    pub fn new(uuid: Uuid, from: Option<String>, to: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::default(),
            uuid,
            from,
            to: to.into(),
        }
    }
}

// ============================================================================
// Topology events
// ============================================================================

/// Heartbeat or status change of one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStateChanged {
    pub meta: EventMeta,
    pub server: ServerInfo,
}

impl ServerStateChanged {
    pub fn new(server: ServerInfo) -> Self {
        Self {
            meta: EventMeta::default(),
            server,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroupChanged {
    pub meta: EventMeta,
    pub group: ServerGroup,
}

impl ServerGroupChanged {
    pub fn new(group: ServerGroup) -> Self {
        Self {
            meta: EventMeta::default(),
            group,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGroupDeleted {
    pub meta: EventMeta,
    pub group_id: String,
}

impl ServerGroupDeleted {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::default(),
            group_id: group_id.into(),
        }
    }
}

/// A server was registered or updated (`server: Some`) or unregistered (`None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRegistryChanged {
    pub meta: EventMeta,
    pub name: String,
    pub server: Option<ServerDefinition>,
}

impl ServerRegistryChanged {
    pub fn registered(server: ServerDefinition) -> Self {
        Self {
            meta: EventMeta::default(),
            name: server.name.clone(),
            server: Some(server),
        }
    }

    pub fn unregistered(name: impl Into<String>) -> Self {
        Self {
            meta: EventMeta::default(),
            name: name.into(),
            server: None,
        }
    }
}

// ============================================================================
// Link events (local only)
// ============================================================================

/// The transport came back after being seen down. Updates broadcast in the
/// meantime were dropped, so cached state should be reread from the store.
#[derive(Debug, Clone)]
pub struct LinkRestored {
    pub meta: EventMeta,
    pub down_for_secs: i64,
}

impl LinkRestored {
    pub fn new(down_for_secs: i64) -> Self {
        Self {
            meta: EventMeta::default(),
            down_for_secs,
        }
    }
}

impl_event!(
    PlayerJoinAttempt,
    PunishmentIssuing,
    PlayerRankChanged,
    RankDefinitionChanged,
    PunishmentIssued,
    PunishmentRevoked,
    PlayerJoinedNetwork,
    PlayerLeftNetwork,
    PlayerSwitchedServer,
    ServerStateChanged,
    ServerGroupChanged,
    ServerGroupDeleted,
    ServerRegistryChanged,
    LinkRestored,
);
