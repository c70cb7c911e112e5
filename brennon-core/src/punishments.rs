//! Punishment lifecycle and network-wide enforcement.
//!
//! A punishment is issued once and then only ever leaves the active state:
//! by expiring (computed at read time) or by revocation (a flag, one way).
//! Enforcement (disconnecting the target) only happens after the broadcast
//! went out, and on peers when they replay it.

use crate::adapter::PlatformAdapter;
use crate::bus::EventBus;
use crate::cache::PresenceCache;
use crate::error::{BrennonError, Result};
use crate::events::{Event, PunishmentIssued, PunishmentIssuing, PunishmentRevoked};
use crate::helpers::{bounded, expiry_after, format_duration, generate_punishment_id, now};
use crate::relay::MessagingRelay;
use crate::validation::{ValidationError, validate_reason};
use brennon_db::{Database, DbError, Punishment, PunishmentKind};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct PunishmentEngine {
    db: Database,
    bus: Arc<EventBus>,
    relay: Arc<MessagingRelay>,
    presence: Arc<PresenceCache>,
    adapter: Arc<dyn PlatformAdapter>,
    store_timeout: Duration,
}

impl PunishmentEngine {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        relay: Arc<MessagingRelay>,
        presence: Arc<PresenceCache>,
        adapter: Arc<dyn PlatformAdapter>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            db,
            bus,
            relay,
            presence,
            adapter,
            store_timeout,
        }
    }

    /// Enforce punishments issued on other processes against sessions hosted here.
    pub fn attach(self: &Arc<Self>) {
        let engine: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut PunishmentIssued| {
            if !event.is_remote() {
                return Ok(());
            }
            let Some(engine) = engine.upgrade() else {
                return Ok(());
            };
            let punishment = event.punishment.clone();
            if !needs_disconnect(&punishment) || !engine.adapter.hosts(punishment.target) {
                return Ok(());
            }

            let runtime = tokio::runtime::Handle::try_current()?;
            runtime.spawn(async move { engine.enforce(&punishment).await });
            Ok(())
        });
    }

    pub async fn ban(
        &self,
        target: Uuid,
        reason: &str,
        duration: Option<Duration>,
        issuer: Option<Uuid>,
    ) -> Result<Punishment> {
        self.issue(target, PunishmentKind::Ban, reason, duration, issuer)
            .await
    }

    pub async fn mute(
        &self,
        target: Uuid,
        reason: &str,
        duration: Option<Duration>,
        issuer: Option<Uuid>,
    ) -> Result<Punishment> {
        self.issue(target, PunishmentKind::Mute, reason, duration, issuer)
            .await
    }

    pub async fn warn(&self, target: Uuid, reason: &str, issuer: Option<Uuid>) -> Result<Punishment> {
        self.issue(target, PunishmentKind::Warn, reason, None, issuer)
            .await
    }

    /// One-shot: recorded in history, never active.
    pub async fn kick(&self, target: Uuid, reason: &str, issuer: Option<Uuid>) -> Result<Punishment> {
        self.issue(target, PunishmentKind::Kick, reason, None, issuer)
            .await
    }

    /// Create a new record. Existing punishments of the same kind are left alone.
    pub async fn issue(
        &self,
        target: Uuid,
        kind: PunishmentKind,
        reason: &str,
        duration: Option<Duration>,
        issuer: Option<Uuid>,
    ) -> Result<Punishment> {
        validate_reason(reason)?;
        let duration = if kind.is_duration_bearing() { duration } else { None };
        if duration.is_some_and(|d| d.as_secs() == 0) {
            return Err(ValidationError::DurationNotPositive.into());
        }
        let issued_at = now();
        let expires_at = match duration {
            Some(d) => {
                let expires_at =
                    expiry_after(issued_at, d).ok_or(ValidationError::DurationTooLong(d.as_secs()))?;
                Some(expires_at)
            }
            None => None,
        };

        let issuing = self
            .bus
            .publish(PunishmentIssuing::new(target, kind, reason, issuer));
        if issuing.is_cancelled() {
            return Err(BrennonError::Cancelled(format!("{kind} of {target} cancelled")));
        }

        self.relay.ensure_connected()?;

        let punishment = Punishment {
            id: generate_punishment_id(),
            target,
            issuer,
            kind,
            reason: issuing.reason,
            issued_at,
            expires_at,
            revoked: false,
            revoked_by: None,
            revoked_at: None,
        };

        bounded(
            self.store_timeout,
            "insert punishment",
            self.db.insert_punishment(punishment.clone()),
        )
        .await?;

        self.relay
            .publish_and_broadcast(PunishmentIssued::new(punishment.clone()))
            .await?;

        info!(
            id = %punishment.id,
            %target,
            kind = %kind,
            duration = %format_duration(expires_at.map(|at| at - issued_at)),
            "punishment issued"
        );

        self.enforce(&punishment).await;
        Ok(punishment)
    }

    /// Disconnect the target if this process hosts them. Mutes are enforced
    /// by the chat gate instead.
    async fn enforce(&self, punishment: &Punishment) {
        if !needs_disconnect(punishment) || !self.adapter.hosts(punishment.target) {
            return;
        }

        let message = disconnect_message(punishment, now());
        match self.adapter.disconnect(punishment.target, &message).await {
            Ok(()) => info!(id = %punishment.id, target = %punishment.target, "enforced"),
            Err(err) => error!(id = %punishment.id, error = %err, "enforcement failed"),
        }
    }

    /// Revoke every active ban of `target`. Succeeds with an empty list when
    /// there is nothing to revoke.
    pub async fn unban(&self, target: Uuid, revoker: Option<Uuid>) -> Result<Vec<Punishment>> {
        self.revoke_all(target, PunishmentKind::Ban, revoker).await
    }

    pub async fn unmute(&self, target: Uuid, revoker: Option<Uuid>) -> Result<Vec<Punishment>> {
        self.revoke_all(target, PunishmentKind::Mute, revoker).await
    }

    async fn revoke_all(&self, target: Uuid, kind: PunishmentKind, revoker: Option<Uuid>) -> Result<Vec<Punishment>> {
        self.relay.ensure_connected()?;

        let now = now();
        let active = bounded(
            self.store_timeout,
            "load punishments",
            self.db.active_punishments_of_kind(target, kind, now),
        )
        .await?;

        let mut revoked = Vec::with_capacity(active.len());
        for punishment in active {
            if let Some(record) = self.revoke_at(&punishment.id, revoker, now).await? {
                revoked.push(record);
            }
        }

        info!(%target, kind = %kind, count = revoked.len(), "revoked active punishments");
        Ok(revoked)
    }

    /// Revoke one punishment by id. Revoking twice is a no-op success.
    pub async fn revoke(&self, id: &str, revoker: Option<Uuid>) -> Result<Punishment> {
        self.relay.ensure_connected()?;

        let now = now();
        match self.revoke_at(id, revoker, now).await? {
            Some(record) => Ok(record),
            None => self.get_punishment(id).await,
        }
    }

    /// Returns the record if this call revoked it, None if it already was.
    async fn revoke_at(&self, id: &str, revoker: Option<Uuid>, now: i64) -> Result<Option<Punishment>> {
        let (record, changed) = bounded(
            self.store_timeout,
            "revoke punishment",
            self.db.revoke_punishment(id.to_string(), revoker, now),
        )
        .await
        .map_err(|err| match err {
            BrennonError::Database(DbError::PunishmentNotFound) => BrennonError::PunishmentNotFound(id.to_string()),
            err => err,
        })?;

        if !changed {
            return Ok(None);
        }

        self.relay
            .publish_and_broadcast(PunishmentRevoked::new(record.clone()))
            .await?;
        Ok(Some(record))
    }

    pub async fn get_punishment(&self, id: &str) -> Result<Punishment> {
        bounded(self.store_timeout, "load punishment", self.db.get_punishment(id.to_string()))
            .await?
            .ok_or_else(|| BrennonError::PunishmentNotFound(id.to_string()))
    }

    /// Full history, newest first.
    pub async fn history(&self, target: Uuid) -> Result<Vec<Punishment>> {
        bounded(self.store_timeout, "load history", self.db.punishment_history(target)).await
    }

    /// Active punishments from the cache, or from the store for players this
    /// process has never seen.
    pub async fn get_active_punishments(&self, target: Uuid) -> Result<Vec<Punishment>> {
        if self.presence.get_view(target).is_some() {
            return Ok(self.presence.active_punishments(target));
        }
        bounded(
            self.store_timeout,
            "load punishments",
            self.db.active_punishments(target, now()),
        )
        .await
    }

    pub fn is_banned(&self, target: Uuid) -> bool {
        self.presence.is_banned(target)
    }

    pub fn is_muted(&self, target: Uuid) -> bool {
        self.presence.is_muted(target)
    }
}

fn needs_disconnect(punishment: &Punishment) -> bool {
    match punishment.kind {
        PunishmentKind::Ban => !punishment.revoked,
        PunishmentKind::Kick => true,
        PunishmentKind::Mute | PunishmentKind::Warn => false,
    }
}

/// Text shown to a player removed by a ban or kick.
pub fn disconnect_message(punishment: &Punishment, now: i64) -> String {
    match punishment.kind {
        PunishmentKind::Ban => format!(
            "You are banned from the network.\nReason: {}\nDuration: {}",
            punishment.reason,
            format_duration(punishment.remaining(now))
        ),
        PunishmentKind::Kick => format!("You were kicked.\nReason: {}", punishment.reason),
        kind => {
            warn!(kind = %kind, "no disconnect message for punishment kind");
            punishment.reason.clone()
        }
    }
}
