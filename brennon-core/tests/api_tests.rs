use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use brennon_core::adapter::StandaloneAdapter;
use brennon_core::config::Config;
use brennon_core::relay::LocalHub;
use brennon_core::{Brennon, create_app};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot` method
use uuid::Uuid;

const API_KEY: &str = "brennon-test-key";

/// Helper to start a single node on an in-memory store
async fn setup_node() -> Arc<Brennon> {
    let db = brennon_db::Database::open_in_memory()
        .await
        .expect("Failed to create in-memory database");
    let mut config = Config::for_server("lobby-1", "lobby");
    config.api_key = Some(API_KEY.to_string());
    let hub = LocalHub::default();
    Brennon::start(config, db, Arc::new(hub.transport()), Arc::new(StandaloneAdapter))
        .await
        .expect("Failed to start node")
}

/// Helper to send a request and get response
async fn send_request(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut request_builder = Request::builder().uri(uri).method(method);

    if let Some(token) = auth_token {
        request_builder = request_builder.header("Authorization", format!("Bearer {}", token));
    }

    let request = if let Some(json_body) = body {
        request_builder
            .header("Content-Type", "application/json")
            .body(Body::from(serde_json::to_vec(&json_body).unwrap()))
            .unwrap()
    } else {
        request_builder.body(Body::empty()).unwrap()
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();

    let json = if body_bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(json!({}))
    };

    (status, json)
}

async fn join(app: &axum::Router, uuid: Uuid, name: &str) -> (StatusCode, Value) {
    send_request(
        app.clone(),
        "POST",
        "/sessions/join",
        Some(json!({ "uuid": uuid, "name": name, "server": "lobby-1" })),
        Some(API_KEY),
    )
    .await
}

// =============================================================================
// QUERIES
// =============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Making a GET request to /health
    let (status, _body) = send_request(app, "GET", "/health", None, None).await;

    // THEN: Should return 200 OK
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_status_reports_local_node() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Requesting status
    let (status, body) = send_request(app, "GET", "/status", None, None).await;

    // THEN: It names itself, is connected and sees its own server
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"], "lobby-1");
    assert_eq!(body["connected"], true);
    assert_eq!(body["stale"], false);
    assert_eq!(body["servers_online"], 1);
}

#[tokio::test]
async fn test_unknown_player_returns_404() {
    // GIVEN: An empty network
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Looking up a player never seen
    let uri = format!("/players/{}", Uuid::new_v4());
    let (status, body) = send_request(app, "GET", &uri, None, None).await;

    // THEN: Should return 404 with a JSON error
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error_msg = body["error"].as_str().unwrap();
    assert!(error_msg.contains("not found"), "Error message: {}", error_msg);
}

#[tokio::test]
async fn test_player_and_permission_lookup() {
    // GIVEN: A joined player and a rank granting a wildcard
    let brennon = setup_node().await;
    let default_id = brennon.ranks.get_default_rank().id;
    let app = create_app(brennon).unwrap();
    let uuid = Uuid::new_v4();
    let (status, _) = join(&app, uuid, "Steve").await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send_request(
        app.clone(),
        "PUT",
        "/ranks/builder",
        Some(json!({
            "id": "builder",
            "display_name": "Builder",
            "prefix": "[B] ",
            "suffix": "",
            "weight": 10,
            "permissions": ["worldedit.*"],
            "inheritance": [default_id],
            "is_default": false,
            "is_staff": false
        })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_request(
        app.clone(),
        "POST",
        &format!("/players/{uuid}/ranks"),
        Some(json!({ "action": "add", "rank": "builder" })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["ranks"].as_array().unwrap().contains(&json!("builder")));

    // WHEN: Querying the player and permissions
    let (status, player) = send_request(app.clone(), "GET", &format!("/players/{uuid}"), None, None).await;
    let (_, granted) = send_request(
        app.clone(),
        "GET",
        &format!("/players/{uuid}/permissions/worldedit.wand"),
        None,
        None,
    )
    .await;
    let (_, missing) = send_request(
        app,
        "GET",
        &format!("/players/{uuid}/permissions/essentials.fly"),
        None,
        None,
    )
    .await;

    // THEN: The rank is primary and the wildcard covers its children only
    assert_eq!(status, StatusCode::OK);
    assert_eq!(player["primary_rank"], "builder");
    assert_eq!(player["display_name"], "[B] Steve");
    assert_eq!(player["online"], true);
    assert_eq!(granted["granted"], true);
    assert_eq!(missing["granted"], false);
}

#[tokio::test]
async fn test_online_players_and_name_lookup() {
    // GIVEN: One player online and one who left
    let app = create_app(setup_node().await).unwrap();
    let steve = Uuid::new_v4();
    let alex = Uuid::new_v4();
    join(&app, steve, "Steve").await;
    join(&app, alex, "Alex").await;
    send_request(
        app.clone(),
        "POST",
        "/sessions/quit",
        Some(json!({ "uuid": alex })),
        Some(API_KEY),
    )
    .await;

    // WHEN: Listing online players
    let (status, online) = send_request(app.clone(), "GET", "/players", None, None).await;

    // THEN: Only the connected one is listed
    assert_eq!(status, StatusCode::OK);
    let online = online.as_array().unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0]["name"], "Steve");

    // WHEN: Looking players up by name, in any case
    let (status, found) = send_request(app.clone(), "GET", "/names/alex", None, None).await;
    let (missing, _) = send_request(app.clone(), "GET", "/names/Nobody", None, None).await;
    let (invalid, _) = send_request(app, "GET", "/names/no-dashes", None, None).await;

    // THEN: Known names resolve, offline players included
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["uuid"], json!(alex));
    assert_eq!(found["online"], false);
    assert_eq!(missing, StatusCode::NOT_FOUND);
    assert_eq!(invalid, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_player_permissions_over_http() {
    // GIVEN: A joined player
    let app = create_app(setup_node().await).unwrap();
    let uuid = Uuid::new_v4();
    join(&app, uuid, "Steve").await;
    let check = |node: &'static str| {
        let app = app.clone();
        async move {
            let (_, body) = send_request(
                app,
                "GET",
                &format!("/players/{uuid}/permissions/{node}"),
                None,
                None,
            )
            .await;
            body["granted"].as_bool().unwrap()
        }
    };

    // WHEN: A node is granted on the player
    let (status, body) = send_request(
        app.clone(),
        "POST",
        &format!("/players/{uuid}/permissions"),
        Some(json!({ "action": "set", "node": "essentials.fly" })),
        Some(API_KEY),
    )
    .await;

    // THEN: The player has it without any rank
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["permissions"], json!(["essentials.fly"]));
    assert!(check("essentials.fly").await);

    // WHEN: It is unset again
    let (status, body) = send_request(
        app.clone(),
        "POST",
        &format!("/players/{uuid}/permissions"),
        Some(json!({ "action": "unset", "node": "essentials.fly" })),
        Some(API_KEY),
    )
    .await;

    // THEN: It is gone
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["permissions"], json!([]));
    assert!(!check("essentials.fly").await);

    // AND: Malformed nodes and unknown players are refused
    let (status, _) = send_request(
        app.clone(),
        "POST",
        &format!("/players/{uuid}/permissions"),
        Some(json!({ "action": "set", "node": "Bad Node" })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = send_request(
        app,
        "POST",
        &format!("/players/{}/permissions", Uuid::new_v4()),
        Some(json!({ "action": "set", "node": "essentials.fly" })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// =============================================================================
// TOPOLOGY
// =============================================================================

#[tokio::test]
async fn test_server_registry_over_http() {
    // GIVEN: An arena group
    let app = create_app(setup_node().await).unwrap();
    let (status, _) = send_request(
        app.clone(),
        "PUT",
        "/groups/arena",
        Some(json!({
            "id": "arena",
            "display_name": "Arena",
            "join_priority": 3,
            "restricted": false,
            "permission": "",
            "fallback": false,
            "max_players": null
        })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let arena = json!({ "group": "arena", "host": "10.0.0.7", "port": 25570, "max_players": 16 });

    // WHEN: A server is registered, twice
    let (created, server) =
        send_request(app.clone(), "PUT", "/servers/arena-1", Some(arena.clone()), Some(API_KEY)).await;
    let (duplicate, _) =
        send_request(app.clone(), "PUT", "/servers/arena-1", Some(arena), Some(API_KEY)).await;

    // THEN: The first is created offline and the second conflicts
    assert_eq!(created, StatusCode::CREATED);
    assert_eq!(server["name"], "arena-1");
    assert_eq!(server["online"], false);
    assert_eq!(duplicate, StatusCode::CONFLICT);

    // AND: Its group cannot be deleted yet
    let (status, _) = send_request(app.clone(), "DELETE", "/groups/arena", None, Some(API_KEY)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // WHEN: The server is unregistered and the group deleted
    let (unregistered, _) =
        send_request(app.clone(), "DELETE", "/servers/arena-1", None, Some(API_KEY)).await;
    let (deleted, _) = send_request(app.clone(), "DELETE", "/groups/arena", None, Some(API_KEY)).await;
    let (again, _) = send_request(app.clone(), "DELETE", "/groups/arena", None, Some(API_KEY)).await;
    let (protected, _) = send_request(app.clone(), "DELETE", "/servers/lobby-1", None, Some(API_KEY)).await;
    let (_, groups) = send_request(app, "GET", "/groups", None, None).await;

    // THEN: Both are gone and the local server stays
    assert_eq!(unregistered, StatusCode::OK);
    assert_eq!(deleted, StatusCode::OK);
    assert_eq!(again, StatusCode::NOT_FOUND);
    assert_eq!(protected, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(groups.as_array().unwrap().iter().all(|g| g["id"] != "arena"));
}

// =============================================================================
// AUTHORIZATION AND VALIDATION
// =============================================================================

#[tokio::test]
async fn test_mutation_with_wrong_key_is_unauthorized() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Issuing a punishment with the wrong key
    let (status, body) = send_request(
        app,
        "POST",
        "/punishments",
        Some(json!({ "target": Uuid::new_v4(), "kind": "BAN", "reason": "spam" })),
        Some("not-the-key"),
    )
    .await;

    // THEN: Should return 401 with JSON error
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let error_msg = body["error"].as_str().unwrap();
    assert!(error_msg.contains("API key"), "Error message: {}", error_msg);
}

#[tokio::test]
async fn test_join_with_invalid_name_is_rejected() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Joining with a 17 character name
    let (status, body) = join(&app, Uuid::new_v4(), "12345678901234567").await;

    // THEN: Should return 400 explaining the limit
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error_msg = body["error"].as_str().unwrap();
    assert!(error_msg.contains("too long"), "Error message: {}", error_msg);
}

#[tokio::test]
async fn test_invalid_duration_is_rejected() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Issuing a ban with an unparseable duration
    let (status, body) = send_request(
        app,
        "POST",
        "/punishments",
        Some(json!({
            "target": Uuid::new_v4(),
            "kind": "BAN",
            "reason": "spam",
            "duration": "soon"
        })),
        Some(API_KEY),
    )
    .await;

    // THEN: Should return 400 naming the value
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("soon"));
}

#[tokio::test]
async fn test_overlong_duration_is_rejected() {
    // GIVEN: A joined player
    let app = create_app(setup_node().await).unwrap();
    let uuid = Uuid::new_v4();
    join(&app, uuid, "Steve").await;

    // WHEN: Issuing a ban whose expiry would not fit
    let (status, body) = send_request(
        app.clone(),
        "POST",
        "/punishments",
        Some(json!({
            "target": uuid,
            "kind": "BAN",
            "reason": "spam",
            "duration": "9223372036854775000s"
        })),
        Some(API_KEY),
    )
    .await;

    // THEN: Should return 400 and store nothing
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("too long"));
    let (_, history) = send_request(app, "GET", &format!("/players/{uuid}/history"), None, None).await;
    assert!(history.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_rank_cycle_is_unprocessable() {
    // GIVEN: A rank inheriting the default rank
    let brennon = setup_node().await;
    let default_id = brennon.ranks.get_default_rank().id;
    let app = create_app(brennon).unwrap();
    let rank = |id: &str, parent: &str| {
        json!({
            "id": id,
            "display_name": id,
            "prefix": "",
            "suffix": "",
            "weight": 1,
            "permissions": [],
            "inheritance": [parent],
            "is_default": false,
            "is_staff": false
        })
    };
    let (status, _) = send_request(
        app.clone(),
        "PUT",
        "/ranks/helper",
        Some(rank("helper", &default_id)),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // WHEN: The default rank is made to inherit it
    let mut default = rank(&default_id, "helper");
    default["is_default"] = json!(true);
    let (status, body) = send_request(
        app,
        "PUT",
        &format!("/ranks/{default_id}"),
        Some(default),
        Some(API_KEY),
    )
    .await;

    // THEN: The cycle is refused with its path
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("cycle"));
}

// =============================================================================
// MODERATION
// =============================================================================

#[tokio::test]
async fn test_ban_flow_over_http() {
    // GIVEN: A player who joined and left
    let app = create_app(setup_node().await).unwrap();
    let uuid = Uuid::new_v4();
    join(&app, uuid, "Griefer").await;
    let (status, _) = send_request(
        app.clone(),
        "POST",
        "/sessions/quit",
        Some(json!({ "uuid": uuid })),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // WHEN: They are banned for a day
    let (status, ban) = send_request(
        app.clone(),
        "POST",
        "/punishments",
        Some(json!({
            "target": uuid,
            "kind": "BAN",
            "reason": "griefing",
            "duration": "1d"
        })),
        Some(API_KEY),
    )
    .await;

    // THEN: The record is created with an expiry one day out
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(ban["kind"], "BAN");
    let issued_at = ban["issued_at"].as_i64().unwrap();
    assert_eq!(ban["expires_at"].as_i64().unwrap(), issued_at + 86_400);

    // AND: Rejoining is forbidden
    let (status, body) = join(&app, uuid, "Griefer").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].as_str().unwrap().contains("griefing"));

    // WHEN: They are unbanned
    let (status, body) = send_request(
        app.clone(),
        "POST",
        &format!("/players/{uuid}/unban"),
        Some(json!({})),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"].as_array().unwrap().len(), 1);

    // THEN: Nothing is active, history keeps the record, and they can join
    let (_, active) = send_request(
        app.clone(),
        "GET",
        &format!("/players/{uuid}/punishments"),
        None,
        None,
    )
    .await;
    assert!(active.as_array().unwrap().is_empty());
    let (_, history) = send_request(
        app.clone(),
        "GET",
        &format!("/players/{uuid}/history"),
        None,
        None,
    )
    .await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["revoked"], true);
    assert_eq!(history[0]["state"], "revoked");
    let (status, _) = join(&app, uuid, "Griefer").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_revoking_unknown_punishment_returns_404() {
    // GIVEN: A running node
    let app = create_app(setup_node().await).unwrap();

    // WHEN: Revoking an id that was never issued
    let (status, body) = send_request(
        app,
        "POST",
        "/punishments/AbCd1234/revoke",
        Some(json!({})),
        Some(API_KEY),
    )
    .await;

    // THEN: Should return 404 without internal details
    assert_eq!(status, StatusCode::NOT_FOUND);
    let error_msg = body["error"].as_str().unwrap();
    assert!(!error_msg.contains("SQL"), "Should not expose SQL details");
    assert!(!error_msg.contains("rusqlite"), "Should not expose library names");
}

#[tokio::test]
async fn test_send_to_unknown_server_returns_404() {
    // GIVEN: An online player
    let app = create_app(setup_node().await).unwrap();
    let uuid = Uuid::new_v4();
    join(&app, uuid, "Steve").await;

    // WHEN: Sending them to a server nobody announced
    let (status, _) = send_request(
        app,
        "POST",
        &format!("/players/{uuid}/send"),
        Some(json!({ "server": "nowhere" })),
        Some(API_KEY),
    )
    .await;

    // THEN: Should return 404
    assert_eq!(status, StatusCode::NOT_FOUND);
}
