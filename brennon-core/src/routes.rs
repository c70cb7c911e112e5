use crate::AppState;
use crate::cache::{NetworkPlayer, PlayerView};
use crate::error::{AppError, BrennonError};
use crate::helpers::{hash_api_key, now, parse_duration};
use crate::topology::ServerInfo;
use crate::validation::{self, ValidationError};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::TypedHeader;
use axum_macros::debug_handler;
use brennon_db::{
    Punishment, PunishmentKind, PunishmentState, RankDefinition, ServerDefinition, ServerGroup,
};
use headers::Authorization;
use headers::authorization::Bearer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize)]
pub(crate) struct StatusResponse {
    server: String,
    origin_id: String,
    connected: bool,
    stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    disconnected_for_secs: Option<i64>,
    online_players: usize,
    cached_players: usize,
    network_players: u32,
    servers_online: usize,
}

#[derive(Serialize)]
pub(crate) struct PlayerResponse {
    #[serde(flatten)]
    player: NetworkPlayer,
    granted: Vec<String>,
    denied: Vec<String>,
    active_punishments: Vec<Punishment>,
    banned: bool,
    muted: bool,
}

impl PlayerResponse {
    fn new(view: &PlayerView, now: i64) -> Self {
        Self {
            player: view.player.clone(),
            granted: view.permissions.granted().into_iter().map(String::from).collect(),
            denied: view.permissions.denied().into_iter().map(String::from).collect(),
            active_punishments: view.active_punishments(now),
            banned: view.is_banned_at(now),
            muted: view.is_muted_at(now),
        }
    }
}

#[derive(Serialize)]
pub(crate) struct HistoryEntry {
    #[serde(flatten)]
    punishment: Punishment,
    state: PunishmentState,
}

#[derive(Serialize)]
pub(crate) struct PermissionResponse {
    uuid: Uuid,
    node: String,
    granted: bool,
}

#[derive(Serialize)]
pub(crate) struct ServerStatus {
    #[serde(flatten)]
    info: ServerInfo,
    alive: bool,
}

#[derive(Deserialize)]
pub(crate) struct JoinRequest {
    uuid: Uuid,
    name: String,
    server: String,
}

#[derive(Deserialize)]
pub(crate) struct QuitRequest {
    uuid: Uuid,
}

#[derive(Deserialize)]
pub(crate) struct IssueRequest {
    target: Uuid,
    kind: PunishmentKind,
    reason: String,
    /// `30m`, `1d12h`, `perm`; omitted = permanent
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    issuer: Option<Uuid>,
}

#[derive(Deserialize)]
pub(crate) struct RevokeRequest {
    #[serde(default)]
    revoker: Option<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct RevokedResponse {
    revoked: Vec<Punishment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RankAction {
    Set,
    Add,
    Remove,
}

#[derive(Deserialize)]
pub(crate) struct RankChangeRequest {
    action: RankAction,
    rank: String,
    #[serde(default)]
    actor: Option<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct RanksResponse {
    uuid: Uuid,
    ranks: BTreeSet<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum PermissionAction {
    Set,
    Unset,
}

#[derive(Deserialize)]
pub(crate) struct PermissionChangeRequest {
    action: PermissionAction,
    /// `node` grants, `-node` negates
    node: String,
    #[serde(default)]
    actor: Option<Uuid>,
}

#[derive(Serialize)]
pub(crate) struct PermissionsResponse {
    uuid: Uuid,
    permissions: BTreeSet<String>,
}

#[derive(Deserialize)]
pub(crate) struct RegisterServerRequest {
    group: String,
    host: String,
    port: u16,
    max_players: u32,
}

#[derive(Deserialize)]
pub(crate) struct SendRequest {
    /// None picks a fallback server
    #[serde(default)]
    server: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct SendResponse {
    server: String,
}

fn authorize(state: &AppState, auth: &Authorization<Bearer>) -> Result<(), AppError> {
    match &state.api_key_hash {
        Some(expected) if *expected == hash_api_key(auth.token()) => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}

/// Cached view, loading the player from the store on first contact.
async fn load_view(state: &AppState, uuid: Uuid) -> Result<Arc<PlayerView>, AppError> {
    let presence = &state.brennon.presence;
    presence
        .get_player(uuid)
        .await?
        .and_then(|_| presence.get_view(uuid))
        .ok_or_else(|| BrennonError::PlayerNotFound(uuid.to_string()).into())
}

// ============================================================================
// Queries
// ============================================================================

#[debug_handler]
pub(crate) async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let brennon = &state.brennon;
    let now = now();

    Json(StatusResponse {
        server: brennon.topology.local_name().to_string(),
        origin_id: brennon.relay.origin_id().to_string(),
        connected: brennon.relay.is_connected(),
        stale: brennon.presence.is_stale_at(now),
        disconnected_for_secs: brennon.relay.disconnected_for(now),
        online_players: brennon.presence.online_count(),
        cached_players: brennon.presence.len(),
        network_players: brennon.topology.network_player_count(now),
        servers_online: brennon.topology.online_servers(now).len(),
    })
}

#[debug_handler]
pub(crate) async fn player(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let view = load_view(&state, uuid).await?;
    Ok(Json(PlayerResponse::new(&view, now())))
}

/// Players online anywhere on the network, by name.
pub(crate) async fn online_players(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.brennon.presence.online_players())
}

#[debug_handler]
pub(crate) async fn player_by_name(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_player_name(&name)?;

    let player = state
        .brennon
        .presence
        .get_player_by_name(&name)
        .await?
        .ok_or_else(|| BrennonError::PlayerNotFound(name.clone()))?;
    let view = load_view(&state, player.uuid).await?;
    Ok(Json(PlayerResponse::new(&view, now())))
}

#[debug_handler]
pub(crate) async fn permission(
    State(state): State<Arc<AppState>>,
    Path((uuid, node)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, AppError> {
    validation::validate_permission_query(&node)?;

    let view = load_view(&state, uuid).await?;
    let granted = view.permissions.has_permission(&node);
    Ok(Json(PermissionResponse { uuid, node, granted }))
}

pub(crate) async fn active_punishments(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let active = state
        .brennon
        .punishments
        .get_active_punishments(uuid)
        .await?;
    Ok(Json(active))
}

pub(crate) async fn history(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let now = now();
    let history: Vec<HistoryEntry> = state
        .brennon
        .punishments
        .history(uuid)
        .await?
        .into_iter()
        .map(|punishment| HistoryEntry {
            state: punishment.state(now),
            punishment,
        })
        .collect();
    Ok(Json(history))
}

pub(crate) async fn ranks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.brennon.ranks.get_ranks())
}

pub(crate) async fn servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let topology = &state.brennon.topology;
    let now = now();
    let servers: Vec<ServerStatus> = topology
        .servers()
        .into_iter()
        .map(|info| ServerStatus {
            alive: topology.is_alive(&info, now),
            info,
        })
        .collect();
    Json(servers)
}

pub(crate) async fn groups(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.brennon.topology.groups())
}

// ============================================================================
// Sessions
// ============================================================================

#[debug_handler]
pub(crate) async fn session_join(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<JoinRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    validation::validate_player_name(&payload.name)?;
    validation::validate_server_name(&payload.server)?;

    let view = state
        .brennon
        .presence
        .handle_join(payload.uuid, &payload.name, &payload.server)
        .await?;

    Ok(Json(PlayerResponse::new(&view, now())))
}

pub(crate) async fn session_quit(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<QuitRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.brennon.presence.handle_quit(payload.uuid).await?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Moderation
// ============================================================================

#[debug_handler]
pub(crate) async fn issue_punishment(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(payload): Json<IssueRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    validation::validate_reason(&payload.reason)?;

    let duration = match payload.duration.as_deref() {
        None => None,
        Some(raw) => parse_duration(raw).ok_or_else(|| ValidationError::DurationInvalid(raw.to_string()))?,
    };

    let punishment = state
        .brennon
        .punishments
        .issue(payload.target, payload.kind, &payload.reason, duration, payload.issuer)
        .await?;

    Ok((StatusCode::CREATED, Json(punishment)))
}

pub(crate) async fn revoke_punishment(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<String>,
    Json(payload): Json<RevokeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let punishment = state
        .brennon
        .punishments
        .revoke(&id, payload.revoker)
        .await?;
    Ok(Json(punishment))
}

pub(crate) async fn unban(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<RevokeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let revoked = state
        .brennon
        .punishments
        .unban(uuid, payload.revoker)
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

pub(crate) async fn unmute(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<RevokeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let revoked = state
        .brennon
        .punishments
        .unmute(uuid, payload.revoker)
        .await?;
    Ok(Json(RevokedResponse { revoked }))
}

// ============================================================================
// Ranks and routing
// ============================================================================

#[debug_handler]
pub(crate) async fn change_ranks(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<RankChangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    validation::validate_rank_id(&payload.rank)?;

    let resolver = &state.brennon.ranks;
    let ranks = match payload.action {
        RankAction::Set => resolver.set_player_rank(uuid, &payload.rank, payload.actor).await?,
        RankAction::Add => resolver.add_player_rank(uuid, &payload.rank, payload.actor).await?,
        RankAction::Remove => {
            resolver
                .remove_player_rank(uuid, &payload.rank, payload.actor)
                .await?
        }
    };

    Ok(Json(RanksResponse { uuid, ranks }))
}

#[debug_handler]
pub(crate) async fn change_permissions(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<PermissionChangeRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    validation::validate_permission_node(&payload.node)?;

    let resolver = &state.brennon.ranks;
    let permissions = match payload.action {
        PermissionAction::Set => {
            resolver
                .set_player_permission(uuid, &payload.node, payload.actor)
                .await?
        }
        PermissionAction::Unset => {
            resolver
                .unset_player_permission(uuid, &payload.node, payload.actor)
                .await?
        }
    };

    Ok(Json(PermissionsResponse { uuid, permissions }))
}

pub(crate) async fn save_rank(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<String>,
    Json(definition): Json<RankDefinition>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    if definition.id != id {
        return Err(AppError::ValidationError("Rank id in path and body differ".to_string()));
    }

    let saved = state.brennon.ranks.save_rank(definition).await?;
    Ok(Json(saved))
}

pub(crate) async fn delete_rank(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.brennon.ranks.delete_rank(&id).await?;
    Ok(StatusCode::OK)
}

pub(crate) async fn save_group(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<String>,
    Json(group): Json<ServerGroup>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    if group.id != id {
        return Err(AppError::ValidationError("Group id in path and body differ".to_string()));
    }

    let saved = state.brennon.topology.save_group(group).await?;
    Ok(Json(saved))
}

pub(crate) async fn delete_group(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.brennon.topology.delete_group(&id).await?;
    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn register_server(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(name): Path<String>,
    Json(payload): Json<RegisterServerRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    validation::validate_server_name(&name)?;

    let info = state
        .brennon
        .topology
        .register_server(ServerDefinition {
            name,
            group: payload.group,
            host: payload.host,
            port: payload.port,
            max_players: payload.max_players,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub(crate) async fn unregister_server(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    state.brennon.topology.unregister_server(&name).await?;
    Ok(StatusCode::OK)
}

#[debug_handler]
pub(crate) async fn send_player(
    State(state): State<Arc<AppState>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<SendRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize(&state, &auth)?;
    let topology = &state.brennon.topology;

    let server = match payload.server {
        Some(server) => {
            validation::validate_server_name(&server)?;
            topology.send_player(uuid, &server).await?;
            server
        }
        None => topology.connect_fallback(uuid).await?.name,
    };

    Ok(Json(SendResponse { server }))
}
