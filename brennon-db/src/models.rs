use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Minecraft player name - max 16 characters, stored inline (no heap allocation).
pub type PlayerName = ArrayString<16>;

/// Id of the rank every store starts with when nothing else is marked default.
pub const FALLBACK_RANK_ID: &str = "default";

/// A player as known to the network. Never deleted, only updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
  /// Stable Mojang UUID
  pub uuid: Uuid,
  /// Last seen username (mutable)
  pub name: PlayerName,
  /// Rank ids held by this player
  pub ranks: BTreeSet<String>,
  /// Nodes granted or negated (`-` prefix) on the player directly, checked before any rank
  #[serde(default)]
  pub permissions: BTreeSet<String>,
  /// Server the player was last seen on
  pub last_server: Option<String>,
  /// Unix timestamp of first network contact
  pub first_seen: i64,
  /// Unix timestamp of the last join/quit/switch
  pub last_seen: i64,
}

impl PlayerRecord {
  /// Record for a player contacting the network for the first time.
  pub fn first_contact(uuid: Uuid, name: PlayerName, default_rank: &str, now: i64) -> Self {
    Self {
      uuid,
      name,
      ranks: BTreeSet::from([default_rank.to_string()]),
      permissions: BTreeSet::new(),
      last_server: None,
      first_seen: now,
      last_seen: now,
    }
  }
}

/// A rank definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankDefinition {
  pub id: String,
  pub display_name: String,
  pub prefix: String,
  pub suffix: String,
  /// Higher weight wins on conflicting grants and picks the primary rank
  pub weight: i32,
  /// Permission nodes, `-` prefix negates
  pub permissions: BTreeSet<String>,
  /// Ids of ranks this one inherits from
  pub inheritance: BTreeSet<String>,
  pub is_default: bool,
  pub is_staff: bool,
}

impl RankDefinition {
  pub fn new(id: impl Into<String>, weight: i32) -> Self {
    let id = id.into();
    Self {
      display_name: id.clone(),
      id,
      prefix: String::new(),
      suffix: String::new(),
      weight,
      permissions: BTreeSet::new(),
      inheritance: BTreeSet::new(),
      is_default: false,
      is_staff: false,
    }
  }

  pub fn grant(mut self, node: impl Into<String>) -> Self {
    self.permissions.insert(node.into());
    self
  }

  pub fn inherit(mut self, parent: impl Into<String>) -> Self {
    self.inheritance.insert(parent.into());
    self
  }

  pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  pub fn default_rank(mut self) -> Self {
    self.is_default = true;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PunishmentKind {
  Ban,
  Mute,
  Kick,
  Warn,
}

impl PunishmentKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      PunishmentKind::Ban => "BAN",
      PunishmentKind::Mute => "MUTE",
      PunishmentKind::Kick => "KICK",
      PunishmentKind::Warn => "WARN",
    }
  }

  /// Kicks are one-shot; everything else stays in force until expiry or revocation.
  pub fn is_duration_bearing(&self) -> bool {
    !matches!(self, PunishmentKind::Kick)
  }
}

impl fmt::Display for PunishmentKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown punishment kind: {0}")]
pub struct UnknownPunishmentKind(pub String);

impl FromStr for PunishmentKind {
  type Err = UnknownPunishmentKind;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "BAN" => Ok(PunishmentKind::Ban),
      "MUTE" => Ok(PunishmentKind::Mute),
      "KICK" => Ok(PunishmentKind::Kick),
      "WARN" => Ok(PunishmentKind::Warn),
      _ => Err(UnknownPunishmentKind(s.to_string())),
    }
  }
}

/// Where a punishment currently sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentState {
  Active,
  Expired,
  Revoked,
  /// Kicks: applied once, never active
  Enforced,
}

/// A punishment record. History is append-only; revocation only flips flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Punishment {
  pub id: String,
  pub target: Uuid,
  /// None for system-issued punishments
  pub issuer: Option<Uuid>,
  pub kind: PunishmentKind,
  pub reason: String,
  pub issued_at: i64,
  /// None = permanent
  pub expires_at: Option<i64>,
  pub revoked: bool,
  pub revoked_by: Option<Uuid>,
  pub revoked_at: Option<i64>,
}

impl Punishment {
  pub fn is_permanent(&self) -> bool {
    self.expires_at.is_none()
  }

  pub fn has_expired(&self, now: i64) -> bool {
    matches!(self.expires_at, Some(expires_at) if expires_at <= now)
  }

  pub fn is_active(&self, now: i64) -> bool {
    self.kind.is_duration_bearing() && !self.revoked && !self.has_expired(now)
  }

  pub fn state(&self, now: i64) -> PunishmentState {
    if !self.kind.is_duration_bearing() {
      PunishmentState::Enforced
    } else if self.revoked {
      PunishmentState::Revoked
    } else if self.has_expired(now) {
      PunishmentState::Expired
    } else {
      PunishmentState::Active
    }
  }

  /// Seconds until expiry, None when permanent.
  pub fn remaining(&self, now: i64) -> Option<i64> {
    self.expires_at.map(|expires_at| (expires_at - now).max(0))
  }
}

/// A logical group of servers (lobby, survival, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGroup {
  pub id: String,
  pub display_name: String,
  /// Lower connects first when used as a fallback
  pub join_priority: i32,
  /// Invite-only: joining requires `permission`
  pub restricted: bool,
  pub permission: String,
  /// Eligible for fallback routing besides the default group
  pub fallback: bool,
  /// Ceiling across all servers in the group, None = unlimited
  pub max_players: Option<u32>,
}

impl ServerGroup {
  pub fn new(id: impl Into<String>, join_priority: i32) -> Self {
    let id = id.into();
    Self {
      display_name: id.clone(),
      id,
      join_priority,
      restricted: false,
      permission: String::new(),
      fallback: false,
      max_players: None,
    }
  }

  /// Permission that bypasses the restriction flag.
  pub fn bypass_permission(&self) -> String {
    if self.permission.is_empty() {
      format!("brennon.server.{}", self.id)
    } else {
      self.permission.clone()
    }
  }
}

/// Static declaration that a server exists. Live status is tracked in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
  pub name: String,
  pub group: String,
  pub host: String,
  pub port: u16,
  pub max_players: u32,
}
