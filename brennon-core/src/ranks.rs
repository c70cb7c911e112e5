//! Rank graph and permission resolution.

use crate::bus::EventBus;
use crate::error::{BrennonError, Result};
use crate::events::{Event, PlayerRankChanged, RankDefinitionChanged};
use crate::helpers::bounded;
use crate::relay::MessagingRelay;
use crate::validation::{validate_permission_node, validate_rank_id};
use brennon_db::{Database, FALLBACK_RANK_ID, PlayerRecord, RankDefinition};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A validated, acyclic set of rank definitions.
#[derive(Debug, Clone)]
pub struct RankGraph {
    ranks: HashMap<String, RankDefinition>,
    default_rank: String,
}

impl RankGraph {
    /// Validate and index a set of definitions.
    ///
    /// Rejects unknown parents, inheritance cycles, and anything other than
    /// exactly one default rank.
    pub fn build(definitions: impl IntoIterator<Item = RankDefinition>) -> Result<Self> {
        let ranks: HashMap<String, RankDefinition> = definitions
            .into_iter()
            .map(|rank| (rank.id.clone(), rank))
            .collect();

        for rank in ranks.values() {
            if let Some(parent) = rank.inheritance.iter().find(|p| !ranks.contains_key(*p)) {
                return Err(BrennonError::Configuration(format!(
                    "rank {} inherits unknown rank {parent}",
                    rank.id
                )));
            }
        }

        detect_cycle(&ranks)?;

        let mut defaults: Vec<&str> = ranks
            .values()
            .filter(|r| r.is_default)
            .map(|r| r.id.as_str())
            .collect();
        defaults.sort_unstable();
        let default_rank = match defaults.as_slice() {
            [only] => only.to_string(),
            [] => return Err(BrennonError::Configuration("no default rank defined".into())),
            many => {
                return Err(BrennonError::Configuration(format!(
                    "multiple default ranks: {}",
                    many.join(", ")
                )));
            }
        };

        Ok(Self { ranks, default_rank })
    }

    pub fn get(&self, id: &str) -> Option<&RankDefinition> {
        self.ranks.get(id)
    }

    pub fn default_rank(&self) -> &RankDefinition {
        &self.ranks[&self.default_rank]
    }

    /// Heaviest first, ties by id.
    pub fn ranks(&self) -> Vec<&RankDefinition> {
        let mut ranks: Vec<&RankDefinition> = self.ranks.values().collect();
        ranks.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.id.cmp(&b.id)));
        ranks
    }

    /// The rank itself plus everything it inherits, depth first.
    pub fn closure(&self, id: &str) -> Vec<&RankDefinition> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        let mut stack = vec![id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(rank) = self.ranks.get(current) {
                out.push(rank);
                stack.extend(rank.inheritance.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// Copy of this graph's definitions with one rank replaced or removed.
    fn with_change(&self, id: &str, definition: Option<RankDefinition>) -> Result<Self> {
        let mut definitions = self.ranks.clone();
        match definition {
            Some(definition) => {
                definitions.insert(id.to_string(), definition);
            }
            None => {
                definitions.remove(id);
            }
        }
        Self::build(definitions.into_values())
    }

    /// Held ranks that exist in the graph, falling back to the default rank.
    fn known<'a>(&'a self, held: &BTreeSet<String>) -> Vec<&'a RankDefinition> {
        let known: Vec<&RankDefinition> = held.iter().filter_map(|id| self.ranks.get(id)).collect();
        if known.is_empty() {
            vec![self.default_rank()]
        } else {
            known
        }
    }

    /// Highest weight wins, ties go to the lowest id.
    pub fn primary_rank(&self, held: &BTreeSet<String>) -> &RankDefinition {
        self.known(held)
            .into_iter()
            .max_by(|a, b| a.weight.cmp(&b.weight).then_with(|| b.id.cmp(&a.id)))
            .unwrap_or_else(|| self.default_rank())
    }

    /// Compute the effective permission set for a player holding `held`.
    ///
    /// Every rank reachable from a held rank contributes at the held rank's
    /// weight (the highest one, if reachable from several). Per node, a
    /// negation at a weight >= the highest grant wins.
    pub fn resolve(&self, held: &BTreeSet<String>) -> EffectivePermissions {
        self.resolve_with(held, &BTreeSet::new())
    }

    /// Like [`resolve`](Self::resolve), with nodes held by the player directly.
    /// Those are consulted before any rank, wildcards included.
    pub fn resolve_with(&self, held: &BTreeSet<String>, personal: &BTreeSet<String>) -> EffectivePermissions {
        let known = self.known(held);

        let mut source_weight: HashMap<&str, i32> = HashMap::new();
        for rank in &known {
            for reachable in self.closure(&rank.id) {
                source_weight
                    .entry(reachable.id.as_str())
                    .and_modify(|w| *w = (*w).max(rank.weight))
                    .or_insert(rank.weight);
            }
        }

        // node -> (highest grant, highest negation)
        let mut grants: HashMap<String, (Option<i32>, Option<i32>)> = HashMap::new();
        for (id, weight) in source_weight {
            for node in &self.ranks[id].permissions {
                let (negated, name) = match node.strip_prefix('-') {
                    Some(name) => (true, name),
                    None => (false, node.as_str()),
                };
                let slot = grants.entry(name.to_ascii_lowercase()).or_default();
                let target = if negated { &mut slot.1 } else { &mut slot.0 };
                *target = Some(target.map_or(weight, |w| w.max(weight)));
            }
        }

        let nodes = grants
            .into_iter()
            .map(|(node, grant)| {
                let allowed = match grant {
                    (Some(positive), Some(negative)) => negative < positive,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                (node, allowed)
            })
            .collect();

        // A player never holds both forms of a node; if they do, the negation wins
        let mut direct: HashMap<String, bool> = HashMap::new();
        for node in personal {
            let (allowed, name) = match node.strip_prefix('-') {
                Some(name) => (false, name),
                None => (true, node.as_str()),
            };
            let slot = direct.entry(name.to_ascii_lowercase()).or_insert(allowed);
            *slot &= allowed;
        }

        EffectivePermissions {
            ranks: known.iter().map(|r| r.id.clone()).collect(),
            primary_rank: self.primary_rank(held).id.clone(),
            personal: direct,
            nodes,
        }
    }
}

fn detect_cycle(ranks: &HashMap<String, RankDefinition>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        ranks: &'a HashMap<String, RankDefinition>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(id);
                let start = path.iter().position(|p| *p == id).unwrap_or(0);
                return Err(BrennonError::Configuration(format!(
                    "rank inheritance cycle: {}",
                    path[start..].join(" -> ")
                )));
            }
            None => {}
        }

        marks.insert(id, Mark::Visiting);
        path.push(id);
        if let Some(rank) = ranks.get(id) {
            for parent in &rank.inheritance {
                visit(parent, ranks, marks, path)?;
            }
        }
        path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut ids: Vec<&str> = ranks.keys().map(String::as_str).collect();
    ids.sort_unstable();
    for id in ids {
        visit(id, ranks, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

/// Immutable permission snapshot for one player. Replaced, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectivePermissions {
    /// Held ranks that exist
    pub ranks: BTreeSet<String>,
    pub primary_rank: String,
    /// Nodes set on the player, checked first
    personal: HashMap<String, bool>,
    nodes: HashMap<String, bool>,
}

/// Exact node first, then the most specific wildcard.
fn lookup(nodes: &HashMap<String, bool>, node: &str) -> Option<bool> {
    if let Some(allowed) = nodes.get(node) {
        return Some(*allowed);
    }

    let mut prefix = node;
    while let Some(idx) = prefix.rfind('.') {
        prefix = &prefix[..idx];
        if let Some(allowed) = nodes.get(&format!("{prefix}.*")) {
            return Some(*allowed);
        }
    }

    nodes.get("*").copied()
}

impl EffectivePermissions {
    /// Player nodes, then rank nodes, else denied.
    pub fn has_permission(&self, node: &str) -> bool {
        let node = node.to_ascii_lowercase();
        lookup(&self.personal, &node)
            .or_else(|| lookup(&self.nodes, &node))
            .unwrap_or(false)
    }

    fn merged(&self) -> HashMap<&str, bool> {
        let mut merged: HashMap<&str, bool> = self.nodes.iter().map(|(n, a)| (n.as_str(), *a)).collect();
        merged.extend(self.personal.iter().map(|(n, a)| (n.as_str(), *a)));
        merged
    }

    /// Granted nodes, sorted.
    pub fn granted(&self) -> Vec<&str> {
        let mut granted: Vec<&str> = self
            .merged()
            .into_iter()
            .filter(|(_, allowed)| *allowed)
            .map(|(node, _)| node)
            .collect();
        granted.sort_unstable();
        granted
    }

    /// Negated nodes, sorted.
    pub fn denied(&self) -> Vec<&str> {
        let mut denied: Vec<&str> = self
            .merged()
            .into_iter()
            .filter(|(_, allowed)| !*allowed)
            .map(|(node, _)| node)
            .collect();
        denied.sort_unstable();
        denied
    }
}

/// Owns the live rank graph and player rank membership writes.
pub struct RankResolver {
    db: Database,
    bus: Arc<EventBus>,
    relay: Arc<MessagingRelay>,
    graph: RwLock<Arc<RankGraph>>,
    /// Serializes local definition writes
    definition_lock: Mutex<()>,
    player_locks: scc::HashMap<Uuid, Arc<Mutex<()>>>,
    store_timeout: Duration,
}

impl RankResolver {
    /// Load definitions from the store. An empty store gets a fallback
    /// default rank; an invalid graph is a configuration error.
    pub async fn load(
        db: Database,
        bus: Arc<EventBus>,
        relay: Arc<MessagingRelay>,
        store_timeout: Duration,
    ) -> Result<Self> {
        let mut definitions = bounded(store_timeout, "load ranks", db.get_ranks()).await?;
        if definitions.is_empty() {
            let fallback = RankDefinition::new(FALLBACK_RANK_ID, 0).default_rank();
            bounded(store_timeout, "create default rank", db.save_rank(fallback.clone())).await?;
            info!(rank = FALLBACK_RANK_ID, "no ranks defined, created fallback default rank");
            definitions.push(fallback);
        }

        let graph = RankGraph::build(definitions)?;
        info!(
            ranks = graph.ranks.len(),
            default = %graph.default_rank,
            "rank graph loaded"
        );

        Ok(Self {
            db,
            bus,
            relay,
            graph: RwLock::new(Arc::new(graph)),
            definition_lock: Mutex::new(()),
            player_locks: scc::HashMap::new(),
            store_timeout,
        })
    }

    /// Apply definition changes broadcast by other processes.
    pub fn attach(self: &Arc<Self>) {
        let resolver: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(move |event: &mut RankDefinitionChanged| {
            if !event.is_remote() {
                return Ok(());
            }
            let Some(resolver) = resolver.upgrade() else {
                return Ok(());
            };
            if let Err(err) = resolver.apply_change(&event.rank_id, event.definition.clone()) {
                // Usually a parent that has not arrived yet; the store has it.
                warn!(rank = %event.rank_id, error = %err, "remote rank change rejected, reloading from store");
                resolver.spawn_reload(event.rank_id.clone());
            }
            Ok(())
        });
    }

    /// Current graph snapshot.
    pub fn graph(&self) -> Arc<RankGraph> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_rank(&self, id: &str) -> Option<RankDefinition> {
        self.graph().get(id).cloned()
    }

    pub fn get_ranks(&self) -> Vec<RankDefinition> {
        self.graph().ranks().into_iter().cloned().collect()
    }

    pub fn get_default_rank(&self) -> RankDefinition {
        self.graph().default_rank().clone()
    }

    pub fn resolve(&self, held: &BTreeSet<String>, personal: &BTreeSet<String>) -> Arc<EffectivePermissions> {
        Arc::new(self.graph().resolve_with(held, personal))
    }

    fn apply_change(&self, id: &str, definition: Option<RankDefinition>) -> Result<()> {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        let next = graph.with_change(id, definition)?;
        *graph = Arc::new(next);
        Ok(())
    }

    fn spawn_reload(self: Arc<Self>, rank_id: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("no runtime available to reload ranks");
            return;
        };
        runtime.spawn(async move {
            if let Err(err) = self.reload(&rank_id).await {
                error!(error = %err, "rank reload failed");
            }
        });
    }

    /// Replace the graph with the store's definitions without notifying anyone.
    pub async fn refresh(&self) -> Result<Arc<RankGraph>> {
        let definitions = bounded(self.store_timeout, "load ranks", self.db.get_ranks()).await?;
        let graph = Arc::new(RankGraph::build(definitions)?);
        *self.graph.write().unwrap_or_else(PoisonError::into_inner) = graph.clone();
        Ok(graph)
    }

    /// Replace the graph with the store's definitions and notify local observers.
    pub async fn reload(&self, rank_id: &str) -> Result<()> {
        let definition = self.refresh().await?.get(rank_id).cloned();

        let event = match definition {
            Some(definition) => RankDefinitionChanged::saved(definition),
            None => RankDefinitionChanged::deleted(rank_id),
        };
        self.bus.publish(event);
        info!(rank = rank_id, "rank graph reloaded from store");
        Ok(())
    }

    /// Create or replace a rank definition.
    pub async fn save_rank(&self, definition: RankDefinition) -> Result<RankDefinition> {
        validate_rank_id(&definition.id)?;
        for node in definition.permissions.iter() {
            validate_permission_node(node)?;
        }
        self.relay.ensure_connected()?;

        let _guard = self.definition_lock.lock().await;
        self.graph()
            .with_change(&definition.id, Some(definition.clone()))?;

        bounded(self.store_timeout, "save rank", self.db.save_rank(definition.clone())).await?;
        self.apply_change(&definition.id, Some(definition.clone()))?;
        info!(rank = %definition.id, weight = definition.weight, "rank saved");

        self.relay
            .publish_and_broadcast(RankDefinitionChanged::saved(definition.clone()))
            .await?;
        Ok(definition)
    }

    /// Delete a rank. The default rank and ranks still inherited by others
    /// cannot be deleted.
    pub async fn delete_rank(&self, id: &str) -> Result<()> {
        self.relay.ensure_connected()?;

        let _guard = self.definition_lock.lock().await;
        let graph = self.graph();
        if graph.get(id).is_none() {
            return Err(BrennonError::RankNotFound(id.to_string()));
        }
        if graph.default_rank().id == id {
            return Err(BrennonError::Configuration(format!("cannot delete default rank {id}")));
        }
        graph.with_change(id, None)?;

        bounded(self.store_timeout, "delete rank", self.db.delete_rank(id.to_string())).await?;
        self.apply_change(id, None)?;
        info!(rank = id, "rank deleted");

        self.relay
            .publish_and_broadcast(RankDefinitionChanged::deleted(id))
            .await?;
        Ok(())
    }

    /// Replace every rank the player holds with `rank_id`.
    pub async fn set_player_rank(&self, uuid: Uuid, rank_id: &str, actor: Option<Uuid>) -> Result<BTreeSet<String>> {
        self.require_rank(rank_id)?;
        let record = self
            .change_player(uuid, actor, |player| {
                player.ranks = BTreeSet::from([rank_id.to_string()]);
            })
            .await?;
        Ok(record.ranks)
    }

    pub async fn add_player_rank(&self, uuid: Uuid, rank_id: &str, actor: Option<Uuid>) -> Result<BTreeSet<String>> {
        self.require_rank(rank_id)?;
        let record = self
            .change_player(uuid, actor, |player| {
                player.ranks.insert(rank_id.to_string());
            })
            .await?;
        Ok(record.ranks)
    }

    /// Removing the last rank leaves the player with the default rank.
    pub async fn remove_player_rank(
        &self,
        uuid: Uuid,
        rank_id: &str,
        actor: Option<Uuid>,
    ) -> Result<BTreeSet<String>> {
        let record = self
            .change_player(uuid, actor, |player| {
                player.ranks.remove(rank_id);
            })
            .await?;
        Ok(record.ranks)
    }

    /// Grant (`node`) or negate (`-node`) a node on the player directly.
    /// Replaces the opposite form if the player held it.
    pub async fn set_player_permission(
        &self,
        uuid: Uuid,
        node: &str,
        actor: Option<Uuid>,
    ) -> Result<BTreeSet<String>> {
        validate_permission_node(node)?;
        let node = node.to_string();
        let opposite = match node.strip_prefix('-') {
            Some(name) => name.to_string(),
            None => format!("-{node}"),
        };

        let record = self
            .change_player(uuid, actor, |player| {
                player.permissions.remove(&opposite);
                player.permissions.insert(node.clone());
            })
            .await?;
        Ok(record.permissions)
    }

    /// Drop a node set on the player directly. Unknown nodes are a no-op.
    pub async fn unset_player_permission(
        &self,
        uuid: Uuid,
        node: &str,
        actor: Option<Uuid>,
    ) -> Result<BTreeSet<String>> {
        validate_permission_node(node)?;

        let record = self
            .change_player(uuid, actor, |player| {
                player.permissions.remove(node);
            })
            .await?;
        Ok(record.permissions)
    }

    fn require_rank(&self, rank_id: &str) -> Result<()> {
        match self.graph().get(rank_id) {
            Some(_) => Ok(()),
            None => Err(BrennonError::RankNotFound(rank_id.to_string())),
        }
    }

    fn player_lock(&self, uuid: Uuid) -> Arc<Mutex<()>> {
        self.player_locks.entry_sync(uuid).or_default().get().clone()
    }

    /// Store write, then local apply through the bus, then broadcast. The
    /// returned record is what the local cache now shows.
    async fn change_player<F>(&self, uuid: Uuid, actor: Option<Uuid>, change: F) -> Result<PlayerRecord>
    where
        F: FnOnce(&mut PlayerRecord),
    {
        self.relay.ensure_connected()?;

        let lock = self.player_lock(uuid);
        let _guard = lock.lock().await;

        let record = bounded(self.store_timeout, "load player", self.db.get_player(uuid))
            .await?
            .ok_or_else(|| BrennonError::PlayerNotFound(uuid.to_string()))?;

        let mut next = record.clone();
        change(&mut next);
        if next.ranks.is_empty() {
            next.ranks.insert(self.graph().default_rank().id.clone());
        }
        if next == record {
            return Ok(next);
        }

        if next.ranks != record.ranks {
            bounded(
                self.store_timeout,
                "save player ranks",
                self.db.set_player_ranks(uuid, next.ranks.clone()),
            )
            .await?;
        }
        if next.permissions != record.permissions {
            bounded(
                self.store_timeout,
                "save player permissions",
                self.db.set_player_permissions(uuid, next.permissions.clone()),
            )
            .await?;
        }

        self.relay
            .publish_and_broadcast(PlayerRankChanged::new(
                uuid,
                next.ranks.clone(),
                next.permissions.clone(),
                actor,
            ))
            .await?;
        info!(%uuid, ranks = ?next.ranks, permissions = ?next.permissions, "player grants changed");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn held(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn ladder() -> RankGraph {
        RankGraph::build([
            RankDefinition::new("member", 10)
                .default_rank()
                .grant("chat.send")
                .grant("essentials.fly"),
            RankDefinition::new("helper", 20)
                .inherit("member")
                .grant("-essentials.fly")
                .grant("staff.chat"),
            RankDefinition::new("mod", 30)
                .inherit("helper")
                .grant("punish.ban")
                .with_prefix("[Mod] "),
        ])
        .unwrap()
    }

    #[test]
    fn test_transitive_inheritance() {
        let perms = ladder().resolve(&held(&["mod"]));
        assert!(perms.has_permission("punish.ban"));
        assert!(perms.has_permission("staff.chat"));
        assert!(perms.has_permission("chat.send"));
        assert_eq!(perms.primary_rank, "mod");
    }

    #[test]
    fn test_negation_on_middle_rank_beats_grant_below_it() {
        let graph = ladder();
        assert!(!graph.resolve(&held(&["mod"])).has_permission("essentials.fly"));
        assert!(!graph.resolve(&held(&["helper"])).has_permission("essentials.fly"));
        assert!(graph.resolve(&held(&["member"])).has_permission("essentials.fly"));
    }

    #[test]
    fn test_heavier_held_rank_overrides_lighter_negation() {
        let graph = RankGraph::build([
            RankDefinition::new("member", 0).default_rank(),
            RankDefinition::new("muted", 5).grant("-chat.send"),
            RankDefinition::new("vip", 50).grant("chat.send"),
        ])
        .unwrap();

        assert!(graph.resolve(&held(&["muted", "vip"])).has_permission("chat.send"));
        assert!(!graph.resolve(&held(&["muted"])).has_permission("chat.send"));
    }

    #[test]
    fn test_negation_at_equal_weight_wins() {
        let graph = RankGraph::build([
            RankDefinition::new("a", 10).default_rank().grant("x.y"),
            RankDefinition::new("b", 10).grant("-x.y"),
        ])
        .unwrap();

        assert!(!graph.resolve(&held(&["a", "b"])).has_permission("x.y"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = RankGraph::build([
            RankDefinition::new("member", 0).default_rank(),
            RankDefinition::new("a", 1).inherit("b"),
            RankDefinition::new("b", 2).inherit("a"),
        ]);

        match result {
            Err(BrennonError::Configuration(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_parent_and_missing_default_are_rejected() {
        assert!(matches!(
            RankGraph::build([RankDefinition::new("a", 1).default_rank().inherit("ghost")]),
            Err(BrennonError::Configuration(_))
        ));
        assert!(matches!(
            RankGraph::build([RankDefinition::new("a", 1)]),
            Err(BrennonError::Configuration(_))
        ));
        assert!(matches!(
            RankGraph::build([
                RankDefinition::new("a", 1).default_rank(),
                RankDefinition::new("b", 2).default_rank(),
            ]),
            Err(BrennonError::Configuration(_))
        ));
    }

    #[test]
    fn test_wildcards() {
        let graph = RankGraph::build([
            RankDefinition::new("admin", 100)
                .default_rank()
                .grant("*")
                .grant("-server.stop")
                .grant("-world.*")
                .grant("world.spawn.*"),
        ])
        .unwrap();
        let perms = graph.resolve(&held(&["admin"]));

        assert!(perms.has_permission("anything.at.all"));
        assert!(!perms.has_permission("server.stop"));
        assert!(perms.has_permission("server.restart"));
        assert!(!perms.has_permission("world.edit"));
        assert!(perms.has_permission("world.spawn.set"));
    }

    #[test]
    fn test_unknown_ranks_fall_back_to_default() {
        let perms = ladder().resolve(&held(&["ghost"]));
        assert_eq!(perms.primary_rank, "member");
        assert!(perms.has_permission("chat.send"));
        assert!(!perms.has_permission("staff.chat"));
    }

    #[test]
    fn test_primary_rank_ties_break_by_id() {
        let graph = RankGraph::build([
            RankDefinition::new("beta", 10).default_rank(),
            RankDefinition::new("alpha", 10),
        ])
        .unwrap();
        assert_eq!(graph.primary_rank(&held(&["alpha", "beta"])).id, "alpha");
    }

    #[test]
    fn test_closure_terminates_on_diamond() {
        let graph = RankGraph::build([
            RankDefinition::new("base", 0).default_rank(),
            RankDefinition::new("left", 1).inherit("base"),
            RankDefinition::new("right", 2).inherit("base"),
            RankDefinition::new("top", 3).inherit("left").inherit("right"),
        ])
        .unwrap();

        let ids: Vec<&str> = graph.closure("top").iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids.iter().filter(|id| **id == "base").count(), 1);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_changes() {
        let graph = ladder();
        let before = graph.resolve(&held(&["member"]));

        let changed = graph
            .with_change("member", Some(RankDefinition::new("member", 10).default_rank()))
            .unwrap();
        let after = changed.resolve(&held(&["member"]));

        assert!(before.has_permission("chat.send"));
        assert!(!after.has_permission("chat.send"));
    }

    #[test]
    fn test_player_grant_beats_rank_negation() {
        let graph = ladder();
        let perms = graph.resolve_with(&held(&["helper"]), &held(&["essentials.fly"]));

        assert!(perms.has_permission("essentials.fly"));
        assert!(perms.granted().contains(&"essentials.fly"));
        assert!(!perms.denied().contains(&"essentials.fly"));
    }

    #[test]
    fn test_player_negation_beats_rank_wildcard() {
        let graph = RankGraph::build([RankDefinition::new("admin", 100).default_rank().grant("*")]).unwrap();
        let perms = graph.resolve_with(&held(&["admin"]), &held(&["-server.stop"]));

        assert!(!perms.has_permission("server.stop"));
        assert!(perms.has_permission("server.restart"));
    }

    #[test]
    fn test_player_wildcard_is_checked_before_ranks() {
        let graph = ladder();
        let perms = graph.resolve_with(&held(&["mod"]), &held(&["-punish.*"]));

        assert!(!perms.has_permission("punish.ban"));
        assert!(perms.has_permission("staff.chat"));
    }

    #[test]
    fn test_player_negation_wins_over_own_grant() {
        let graph = ladder();
        let perms = graph.resolve_with(&held(&["member"]), &held(&["kit.vip", "-kit.vip"]));

        assert!(!perms.has_permission("kit.vip"));
        assert_eq!(perms.primary_rank, "member");
    }
}
