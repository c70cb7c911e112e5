mod error;
mod models;

pub use error::{DbError, Result};
pub use models::{
  FALLBACK_RANK_ID, PlayerName, PlayerRecord, Punishment, PunishmentKind, PunishmentState,
  RankDefinition, ServerDefinition, ServerGroup, UnknownPunishmentKind,
};

use std::collections::BTreeSet;
use std::path::Path;
use tokio_rusqlite::Connection;
use tokio_rusqlite::rusqlite::{self, OptionalExtension, Row, params, types::Type};
use tracing::{debug, info};
use uuid::Uuid;

/// Backing store for players, ranks, punishments and server topology.
#[derive(Clone)]
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create a database at the given path.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = Connection::open(path).await.map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Create an in-memory database (useful for testing).
  pub async fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .await
      .map_err(DbError::Sqlite)?;
    let db = Self { conn };
    db.initialize().await?;
    Ok(db)
  }

  /// Initialize the database schema.
  async fn initialize(&self) -> Result<()> {
    self.conn
            .call(|conn| {
                // Enable WAL mode for better concurrent read/write performance
                conn.pragma_update(None, "journal_mode", "WAL")?;

                // Enable foreign key constraints (must be set per-connection)
                conn.pragma_update(None, "foreign_keys", "ON")?;

                conn.execute_batch(
                    r#"
                    -- Every player the network has ever seen
                    CREATE TABLE IF NOT EXISTS players (
                        uuid TEXT PRIMARY KEY,
                        name TEXT NOT NULL,
                        name_lower TEXT NOT NULL,
                        ranks TEXT NOT NULL,
                        permissions TEXT NOT NULL DEFAULT '[]',
                        last_server TEXT,
                        first_seen INTEGER NOT NULL,
                        last_seen INTEGER NOT NULL
                    );

                    -- Rank definitions (permissions/inheritance as JSON arrays)
                    CREATE TABLE IF NOT EXISTS ranks (
                        id TEXT PRIMARY KEY,
                        display_name TEXT NOT NULL,
                        prefix TEXT NOT NULL,
                        suffix TEXT NOT NULL,
                        weight INTEGER NOT NULL,
                        permissions TEXT NOT NULL,
                        inheritance TEXT NOT NULL,
                        is_default INTEGER NOT NULL,
                        is_staff INTEGER NOT NULL
                    );

                    -- Append-only punishment history
                    CREATE TABLE IF NOT EXISTS punishments (
                        id TEXT PRIMARY KEY,
                        target TEXT NOT NULL,
                        issuer TEXT,
                        kind TEXT NOT NULL,
                        reason TEXT NOT NULL,
                        issued_at INTEGER NOT NULL,
                        expires_at INTEGER,
                        revoked INTEGER NOT NULL DEFAULT 0,
                        revoked_by TEXT,
                        revoked_at INTEGER
                    );

                    CREATE TABLE IF NOT EXISTS server_groups (
                        id TEXT PRIMARY KEY,
                        display_name TEXT NOT NULL,
                        join_priority INTEGER NOT NULL,
                        restricted INTEGER NOT NULL,
                        permission TEXT NOT NULL,
                        fallback INTEGER NOT NULL,
                        max_players INTEGER
                    );

                    CREATE TABLE IF NOT EXISTS servers (
                        name TEXT PRIMARY KEY,
                        group_id TEXT NOT NULL REFERENCES server_groups(id) ON DELETE CASCADE,
                        host TEXT NOT NULL,
                        port INTEGER NOT NULL,
                        max_players INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_players_name ON players(name_lower);
                    CREATE INDEX IF NOT EXISTS idx_punishments_target ON punishments(target, kind);
                    "#,
                )?;
                Ok(())
            })
            .await?;

    info!("database initialized");
    Ok(())
  }

  // ========================================================================
  // Players
  // ========================================================================

  /// Insert or update a player record.
  pub async fn save_player(&self, player: PlayerRecord) -> Result<()> {
    let ranks = serde_json::to_string(&player.ranks).map_err(encode_error)?;
    let permissions = serde_json::to_string(&player.permissions).map_err(encode_error)?;
    let uuid = player.uuid;

    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            r#"
            INSERT INTO players (uuid, name, name_lower, ranks, permissions, last_server, first_seen, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(uuid) DO UPDATE SET
                name = excluded.name,
                name_lower = excluded.name_lower,
                ranks = excluded.ranks,
                permissions = excluded.permissions,
                last_server = excluded.last_server,
                last_seen = excluded.last_seen
            "#,
          )?
          .execute(params![
            player.uuid.to_string(),
            player.name.as_str(),
            player.name.to_lowercase(),
            &ranks,
            &permissions,
            &player.last_server,
            player.first_seen,
            player.last_seen,
          ])?;
        Ok(())
      })
      .await?;

    debug!(%uuid, "saved player");
    Ok(())
  }

  /// Get a player by UUID.
  pub async fn get_player(&self, uuid: Uuid) -> Result<Option<PlayerRecord>> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{PLAYER_COLUMNS} WHERE uuid = ?1"))?
          .query_row(params![uuid.to_string()], player_from_row)
          .optional()
      })
      .await?;

    Ok(player)
  }

  /// Get a player by name (case-insensitive).
  pub async fn get_player_by_name(&self, name: String) -> Result<Option<PlayerRecord>> {
    let player = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!(
            "{PLAYER_COLUMNS} WHERE name_lower = ?1 ORDER BY last_seen DESC LIMIT 1"
          ))?
          .query_row(params![name.to_lowercase()], player_from_row)
          .optional()
      })
      .await?;

    Ok(player)
  }

  /// Replace the rank set of a player and return the updated record.
  pub async fn set_player_ranks(&self, uuid: Uuid, ranks: BTreeSet<String>) -> Result<PlayerRecord> {
    let encoded = serde_json::to_string(&ranks).map_err(encode_error)?;

    let player = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let updated = tx
          .prepare_cached("UPDATE players SET ranks = ?2 WHERE uuid = ?1")?
          .execute(params![uuid.to_string(), &encoded])?;

        if updated == 0 {
          return Ok(Err(DbError::PlayerNotFound));
        }

        let player = tx
          .prepare_cached(&format!("{PLAYER_COLUMNS} WHERE uuid = ?1"))?
          .query_row(params![uuid.to_string()], player_from_row)?;

        tx.commit()?;
        Ok(Ok(player))
      })
      .await??;

    debug!(%uuid, ranks = ?player.ranks, "updated player ranks");
    Ok(player)
  }

  /// Replace the directly held permission nodes of a player and return the updated record.
  pub async fn set_player_permissions(
    &self,
    uuid: Uuid,
    permissions: BTreeSet<String>,
  ) -> Result<PlayerRecord> {
    let encoded = serde_json::to_string(&permissions).map_err(encode_error)?;

    let player = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let updated = tx
          .prepare_cached("UPDATE players SET permissions = ?2 WHERE uuid = ?1")?
          .execute(params![uuid.to_string(), &encoded])?;

        if updated == 0 {
          return Ok(Err(DbError::PlayerNotFound));
        }

        let player = tx
          .prepare_cached(&format!("{PLAYER_COLUMNS} WHERE uuid = ?1"))?
          .query_row(params![uuid.to_string()], player_from_row)?;

        tx.commit()?;
        Ok(Ok(player))
      })
      .await??;

    debug!(%uuid, permissions = ?player.permissions, "updated player permissions");
    Ok(player)
  }

  // ========================================================================
  // Ranks
  // ========================================================================

  /// Get all rank definitions, heaviest first.
  pub async fn get_ranks(&self) -> Result<Vec<RankDefinition>> {
    let ranks = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          r#"
          SELECT id, display_name, prefix, suffix, weight, permissions, inheritance, is_default, is_staff
          FROM ranks ORDER BY weight DESC, id
          "#,
        )?;

        let ranks = stmt
          .query_map([], rank_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ranks)
      })
      .await?;

    Ok(ranks)
  }

  /// Create or replace a rank definition.
  pub async fn save_rank(&self, rank: RankDefinition) -> Result<()> {
    let permissions = serde_json::to_string(&rank.permissions).map_err(encode_error)?;
    let inheritance = serde_json::to_string(&rank.inheritance).map_err(encode_error)?;
    let id = rank.id.clone();

    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            r#"
            INSERT OR REPLACE INTO ranks
                (id, display_name, prefix, suffix, weight, permissions, inheritance, is_default, is_staff)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
          )?
          .execute(params![
            &rank.id,
            &rank.display_name,
            &rank.prefix,
            &rank.suffix,
            rank.weight,
            &permissions,
            &inheritance,
            rank.is_default,
            rank.is_staff,
          ])?;
        Ok(())
      })
      .await?;

    debug!(%id, "saved rank");
    Ok(())
  }

  /// Delete a rank definition.
  pub async fn delete_rank(&self, id: String) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM ranks WHERE id = ?1")?
          .execute(params![&id])?;

        if deleted == 0 {
          return Ok(Err(DbError::RankNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!("deleted rank");
    Ok(result)
  }

  // ========================================================================
  // Punishments
  // ========================================================================

  /// Append a punishment to the history.
  pub async fn insert_punishment(&self, punishment: Punishment) -> Result<()> {
    let id = punishment.id.clone();

    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            r#"
            INSERT INTO punishments
                (id, target, issuer, kind, reason, issued_at, expires_at, revoked, revoked_by, revoked_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
          )?
          .execute(params![
            &punishment.id,
            punishment.target.to_string(),
            punishment.issuer.map(|u| u.to_string()),
            punishment.kind.as_str(),
            &punishment.reason,
            punishment.issued_at,
            punishment.expires_at,
            punishment.revoked,
            punishment.revoked_by.map(|u| u.to_string()),
            punishment.revoked_at,
          ])?;
        Ok(())
      })
      .await?;

    debug!(%id, "inserted punishment");
    Ok(())
  }

  /// Get a punishment by id.
  pub async fn get_punishment(&self, id: String) -> Result<Option<Punishment>> {
    let punishment = self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(&format!("{PUNISHMENT_COLUMNS} WHERE id = ?1"))?
          .query_row(params![&id], punishment_from_row)
          .optional()
      })
      .await?;

    Ok(punishment)
  }

  /// Full history for a target, newest first.
  pub async fn punishment_history(&self, target: Uuid) -> Result<Vec<Punishment>> {
    let history = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          "{PUNISHMENT_COLUMNS} WHERE target = ?1 ORDER BY issued_at DESC, id"
        ))?;

        let history = stmt
          .query_map(params![target.to_string()], punishment_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(history)
      })
      .await?;

    Ok(history)
  }

  /// Punishments currently in force for a target.
  pub async fn active_punishments(&self, target: Uuid, now: i64) -> Result<Vec<Punishment>> {
    let active = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(&format!(
          r#"
          {PUNISHMENT_COLUMNS}
          WHERE target = ?1 AND revoked = 0 AND kind != 'KICK'
            AND (expires_at IS NULL OR expires_at > ?2)
          ORDER BY issued_at, id
          "#
        ))?;

        let active = stmt
          .query_map(params![target.to_string(), now], punishment_from_row)?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(active)
      })
      .await?;

    Ok(active)
  }

  /// Active punishments of one kind for a target.
  pub async fn active_punishments_of_kind(
    &self,
    target: Uuid,
    kind: PunishmentKind,
    now: i64,
  ) -> Result<Vec<Punishment>> {
    let active = self.active_punishments(target, now).await?;
    Ok(active.into_iter().filter(|p| p.kind == kind).collect())
  }

  /// Flag a punishment as revoked.
  /// Returns the stored record and whether this call changed it; revoking twice is not an error.
  pub async fn revoke_punishment(
    &self,
    id: String,
    revoked_by: Option<Uuid>,
    now: i64,
  ) -> Result<(Punishment, bool)> {
    let (punishment, changed) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let changed = tx
          .prepare_cached(
            "UPDATE punishments SET revoked = 1, revoked_by = ?2, revoked_at = ?3 WHERE id = ?1 AND revoked = 0",
          )?
          .execute(params![&id, revoked_by.map(|u| u.to_string()), now])?;

        let punishment: Option<Punishment> = tx
          .prepare_cached(&format!("{PUNISHMENT_COLUMNS} WHERE id = ?1"))?
          .query_row(params![&id], punishment_from_row)
          .optional()?;

        let punishment = match punishment {
          Some(p) => p,
          None => return Ok(Err(DbError::PunishmentNotFound)),
        };

        tx.commit()?;
        Ok(Ok((punishment, changed > 0)))
      })
      .await??;

    debug!(%punishment.id, changed, "revoked punishment");
    Ok((punishment, changed))
  }

  // ========================================================================
  // Server topology
  // ========================================================================

  /// Get all server groups.
  pub async fn get_groups(&self) -> Result<Vec<ServerGroup>> {
    let groups = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare_cached(
          r#"
          SELECT id, display_name, join_priority, restricted, permission, fallback, max_players
          FROM server_groups ORDER BY join_priority, id
          "#,
        )?;

        let groups = stmt
          .query_map([], |row| {
            Ok(ServerGroup {
              id: row.get(0)?,
              display_name: row.get(1)?,
              join_priority: row.get(2)?,
              restricted: row.get(3)?,
              permission: row.get(4)?,
              fallback: row.get(5)?,
              max_players: row.get(6)?,
            })
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(groups)
      })
      .await?;

    Ok(groups)
  }

  /// Create or replace a server group.
  pub async fn save_group(&self, group: ServerGroup) -> Result<()> {
    let id = group.id.clone();

    self
      .conn
      .call(move |conn| {
        conn
          .prepare_cached(
            r#"
            INSERT INTO server_groups (id, display_name, join_priority, restricted, permission, fallback, max_players)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                join_priority = excluded.join_priority,
                restricted = excluded.restricted,
                permission = excluded.permission,
                fallback = excluded.fallback,
                max_players = excluded.max_players
            "#,
          )?
          .execute(params![
            &group.id,
            &group.display_name,
            group.join_priority,
            group.restricted,
            &group.permission,
            group.fallback,
            group.max_players,
          ])?;
        Ok(())
      })
      .await?;

    debug!(%id, "saved server group");
    Ok(())
  }

  /// Delete a server group. Servers still registered in it go with it.
  pub async fn delete_group(&self, id: String) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM server_groups WHERE id = ?1")?
          .execute(params![&id])?;

        if deleted == 0 {
          return Ok(Err(DbError::GroupNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!("deleted server group");
    Ok(result)
  }

  /// Get all registered servers.
  pub async fn get_servers(&self) -> Result<Vec<ServerDefinition>> {
    let servers = self
      .conn
      .call(move |conn| {
        let mut stmt = conn
          .prepare_cached("SELECT name, group_id, host, port, max_players FROM servers ORDER BY name")?;

        let servers = stmt
          .query_map([], |row| {
            Ok(ServerDefinition {
              name: row.get(0)?,
              group: row.get(1)?,
              host: row.get(2)?,
              port: row.get(3)?,
              max_players: row.get(4)?,
            })
          })?
          .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(servers)
      })
      .await?;

    Ok(servers)
  }

  /// Register or update a server. The group must exist.
  pub async fn save_server(&self, server: ServerDefinition) -> Result<()> {
    let name = server.name.clone();

    self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                // Verify the group exists
                let exists: bool = tx
                    .prepare_cached("SELECT EXISTS(SELECT 1 FROM server_groups WHERE id = ?1)")?
                    .query_row(params![&server.group], |row| row.get(0))?;

                if !exists {
                    return Ok(Err(DbError::GroupNotFound));
                }

                tx.prepare_cached(
                    "INSERT OR REPLACE INTO servers (name, group_id, host, port, max_players) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?
                    .execute(params![&server.name, &server.group, &server.host, server.port, server.max_players])?;

                tx.commit()?;
                Ok(Ok(()))
            })
            .await??;

    debug!(%name, "saved server");
    Ok(())
  }

  /// Remove a server registration.
  pub async fn delete_server(&self, name: String) -> Result<()> {
    let result = self
      .conn
      .call(move |conn| {
        let deleted = conn
          .prepare_cached("DELETE FROM servers WHERE name = ?1")?
          .execute(params![&name])?;

        if deleted == 0 {
          return Ok(Err(DbError::ServerNotFound));
        }

        Ok(Ok(()))
      })
      .await??;

    debug!("deleted server");
    Ok(result)
  }
}

const PLAYER_COLUMNS: &str =
  "SELECT uuid, name, ranks, permissions, last_server, first_seen, last_seen FROM players";

const PUNISHMENT_COLUMNS: &str = "SELECT id, target, issuer, kind, reason, issued_at, expires_at, revoked, revoked_by, revoked_at FROM punishments";

fn encode_error(err: serde_json::Error) -> DbError {
  DbError::Sqlite(rusqlite::Error::ToSqlConversionFailure(Box::new(err)))
}

fn conversion_error(
  idx: usize,
  err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
  rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
  let text: String = row.get(idx)?;
  Uuid::parse_str(&text).map_err(|e| conversion_error(idx, e))
}

fn optional_uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
  let text: Option<String> = row.get(idx)?;
  text
    .map(|t| Uuid::parse_str(&t).map_err(|e| conversion_error(idx, e)))
    .transpose()
}

fn set_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
  let text: String = row.get(idx)?;
  serde_json::from_str(&text).map_err(|e| conversion_error(idx, e))
}

fn player_from_row(row: &Row<'_>) -> rusqlite::Result<PlayerRecord> {
  let name: String = row.get(1)?;
  Ok(PlayerRecord {
    uuid: uuid_column(row, 0)?,
    name: PlayerName::from(&name).map_err(|e| conversion_error(1, e.simplify()))?,
    ranks: set_column(row, 2)?,
    permissions: set_column(row, 3)?,
    last_server: row.get(4)?,
    first_seen: row.get(5)?,
    last_seen: row.get(6)?,
  })
}

fn rank_from_row(row: &Row<'_>) -> rusqlite::Result<RankDefinition> {
  Ok(RankDefinition {
    id: row.get(0)?,
    display_name: row.get(1)?,
    prefix: row.get(2)?,
    suffix: row.get(3)?,
    weight: row.get(4)?,
    permissions: set_column(row, 5)?,
    inheritance: set_column(row, 6)?,
    is_default: row.get(7)?,
    is_staff: row.get(8)?,
  })
}

fn punishment_from_row(row: &Row<'_>) -> rusqlite::Result<Punishment> {
  let kind: String = row.get(3)?;
  Ok(Punishment {
    id: row.get(0)?,
    target: uuid_column(row, 1)?,
    issuer: optional_uuid_column(row, 2)?,
    kind: kind.parse().map_err(|e| conversion_error(3, e))?,
    reason: row.get(4)?,
    issued_at: row.get(5)?,
    expires_at: row.get(6)?,
    revoked: row.get(7)?,
    revoked_by: optional_uuid_column(row, 8)?,
    revoked_at: row.get(9)?,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn now() -> i64 {
    1700000000 // Fixed timestamp for testing
  }

  fn name(n: &str) -> PlayerName {
    PlayerName::from(n).unwrap()
  }

  fn ban(id: &str, target: Uuid, expires_at: Option<i64>) -> Punishment {
    Punishment {
      id: id.to_string(),
      target,
      issuer: None,
      kind: PunishmentKind::Ban,
      reason: "cheating".to_string(),
      issued_at: now(),
      expires_at,
      revoked: false,
      revoked_by: None,
      revoked_at: None,
    }
  }

  #[tokio::test]
  async fn test_player_lifecycle() {
    let db = Database::open_in_memory().await.unwrap();
    let uuid = Uuid::new_v4();

    let record = PlayerRecord::first_contact(uuid, name("Steve"), FALLBACK_RANK_ID, now());
    db.save_player(record.clone()).await.unwrap();

    // Get by uuid and by name, case-insensitively
    let loaded = db.get_player(uuid).await.unwrap().unwrap();
    assert_eq!(loaded, record);
    let by_name = db.get_player_by_name("steve".to_string()).await.unwrap().unwrap();
    assert_eq!(by_name.uuid, uuid);

    // Rename keeps first_seen
    let mut renamed = loaded.clone();
    renamed.name = name("Steve2");
    renamed.first_seen = now() + 500;
    renamed.last_seen = now() + 500;
    db.save_player(renamed).await.unwrap();
    let loaded = db.get_player(uuid).await.unwrap().unwrap();
    assert_eq!(loaded.name.as_str(), "Steve2");
    assert_eq!(loaded.first_seen, now());
    assert_eq!(loaded.last_seen, now() + 500);

    // Replace ranks
    let ranks = BTreeSet::from(["vip".to_string(), "default".to_string()]);
    let updated = db.set_player_ranks(uuid, ranks.clone()).await.unwrap();
    assert_eq!(updated.ranks, ranks);

    // Direct nodes are stored apart from ranks and survive a later save
    let nodes = BTreeSet::from(["essentials.fly".to_string(), "-chat.color".to_string()]);
    let updated = db.set_player_permissions(uuid, nodes.clone()).await.unwrap();
    assert_eq!(updated.permissions, nodes);
    assert_eq!(updated.ranks, ranks);
    db.save_player(updated.clone()).await.unwrap();
    assert_eq!(db.get_player(uuid).await.unwrap().unwrap().permissions, nodes);
  }

  #[tokio::test]
  async fn test_set_ranks_for_unknown_player() {
    let db = Database::open_in_memory().await.unwrap();

    let result = db.set_player_ranks(Uuid::new_v4(), BTreeSet::new()).await;
    assert!(matches!(result, Err(DbError::PlayerNotFound)));

    let result = db.set_player_permissions(Uuid::new_v4(), BTreeSet::new()).await;
    assert!(matches!(result, Err(DbError::PlayerNotFound)));
  }

  #[tokio::test]
  async fn test_rank_lifecycle() {
    let db = Database::open_in_memory().await.unwrap();

    db.save_rank(RankDefinition::new("default", 0).default_rank())
      .await
      .unwrap();
    db.save_rank(
      RankDefinition::new("admin", 100)
        .grant("brennon.ban")
        .grant("-brennon.fly")
        .inherit("default"),
    )
    .await
    .unwrap();

    let ranks = db.get_ranks().await.unwrap();
    assert_eq!(ranks.len(), 2);
    assert_eq!(ranks[0].id, "admin");
    assert!(ranks[0].permissions.contains("-brennon.fly"));
    assert!(ranks[0].inheritance.contains("default"));
    assert!(ranks[1].is_default);

    db.delete_rank("admin".to_string()).await.unwrap();
    assert_eq!(db.get_ranks().await.unwrap().len(), 1);

    let result = db.delete_rank("admin".to_string()).await;
    assert!(matches!(result, Err(DbError::RankNotFound)));
  }

  #[tokio::test]
  async fn test_active_punishments_respect_expiry() {
    let db = Database::open_in_memory().await.unwrap();
    let target = Uuid::new_v4();

    db.insert_punishment(ban("perm", target, None)).await.unwrap();
    db.insert_punishment(ban("hour", target, Some(now() + 3600)))
      .await
      .unwrap();

    let mut kick = ban("kick", target, None);
    kick.kind = PunishmentKind::Kick;
    db.insert_punishment(kick).await.unwrap();

    let active = db.active_punishments(target, now()).await.unwrap();
    assert_eq!(active.len(), 2);

    // An hour later only the permanent ban remains
    let active = db.active_punishments(target, now() + 3600).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "perm");

    // History keeps everything, kicks included
    assert_eq!(db.punishment_history(target).await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_revoke_is_idempotent() {
    let db = Database::open_in_memory().await.unwrap();
    let target = Uuid::new_v4();
    let staff = Uuid::new_v4();

    db.insert_punishment(ban("b1", target, None)).await.unwrap();

    let (revoked, changed) = db
      .revoke_punishment("b1".to_string(), Some(staff), now() + 10)
      .await
      .unwrap();
    assert!(changed);
    assert!(revoked.revoked);
    assert_eq!(revoked.revoked_by, Some(staff));
    assert_eq!(revoked.revoked_at, Some(now() + 10));

    // Second revocation changes nothing and keeps the first revoker
    let (again, changed) = db
      .revoke_punishment("b1".to_string(), None, now() + 20)
      .await
      .unwrap();
    assert!(!changed);
    assert_eq!(again.revoked_by, Some(staff));

    assert!(db.active_punishments(target, now()).await.unwrap().is_empty());

    let missing = db.revoke_punishment("nope".to_string(), None, now()).await;
    assert!(matches!(missing, Err(DbError::PunishmentNotFound)));
  }

  #[tokio::test]
  async fn test_server_topology() {
    let db = Database::open_in_memory().await.unwrap();

    let mut lobby = ServerGroup::new("lobby", 0);
    lobby.max_players = Some(200);
    db.save_group(lobby).await.unwrap();

    let server = ServerDefinition {
      name: "lobby-1".to_string(),
      group: "lobby".to_string(),
      host: "10.0.0.1".to_string(),
      port: 25565,
      max_players: 100,
    };
    db.save_server(server.clone()).await.unwrap();

    let groups = db.get_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].max_players, Some(200));
    assert_eq!(db.get_servers().await.unwrap(), vec![server]);

    // Unknown group is rejected
    let orphan = ServerDefinition {
      name: "pvp-1".to_string(),
      group: "pvp".to_string(),
      host: "10.0.0.2".to_string(),
      port: 25565,
      max_players: 50,
    };
    assert!(matches!(
      db.save_server(orphan).await,
      Err(DbError::GroupNotFound)
    ));

    db.delete_server("lobby-1".to_string()).await.unwrap();
    assert!(db.get_servers().await.unwrap().is_empty());
    assert!(matches!(
      db.delete_server("lobby-1".to_string()).await,
      Err(DbError::ServerNotFound)
    ));

    db.delete_group("lobby".to_string()).await.unwrap();
    assert!(db.get_groups().await.unwrap().is_empty());
    assert!(matches!(
      db.delete_group("lobby".to_string()).await,
      Err(DbError::GroupNotFound)
    ));
  }
}
