//! API Integration Tests
//!
//! Tests the HTTP API endpoints with a real database.
//!
//! Tests are serialized because they share a global test pool.
//!
//! Note: The `more-di` DI framework doesn't support injecting custom pools.
//! We work around this by using `DatabaseConnection::set_test_pool()` to set
//! a global pool that the DI-created DatabaseConnection will use.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use clinic_omnichannel_api::{
    api,
    core::sequencer::AppendSequencer,
    core::services::{MyConversationService, MyMessageService, MyProfileService},
    core::subscriptions::SubscriptionRegistry,
    infrastructure::changes::ChangeFeed,
    infrastructure::database::DatabaseConnection,
    infrastructure::entities::Role,
    infrastructure::repositories::{
        DbConversationRepository, DbMessageRepository, DbProfileRepository,
    },
};
use di::{Injectable, ServiceCollection};
use di_axum::RouterServiceProviderExtensions;
use serde_json::{Value, json};
use serial_test::serial;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicU32, Ordering};
use tower::ServiceExt;
use uuid::Uuid;

/// Counter for unique test database URIs
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Setup test database with migrations and returns pool
/// Uses in-memory SQLite for test isolation
async fn setup_test_db() -> SqlitePool {
    let db_num = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    // Use file URI format with shared cache - each test gets a unique DB
    let db_url = format!("sqlite:file:apitestdb{}?mode=memory&cache=shared", db_num);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();

    // Set this pool as the global test pool so DI uses it
    DatabaseConnection::set_test_pool(pool.clone());

    pool
}

/// Clean up after test
fn cleanup_test_db() {
    DatabaseConnection::clear_test_pool();
}

/// Create test app - uses the global test pool set by setup_test_db()
fn create_test_app() -> axum::Router {
    let provider = ServiceCollection::new()
        .add(DatabaseConnection::singleton())
        .add(ChangeFeed::singleton())
        .add(SubscriptionRegistry::singleton())
        .add(AppendSequencer::singleton())
        .add(DbProfileRepository::scoped())
        .add(DbConversationRepository::scoped())
        .add(DbMessageRepository::scoped())
        .add(MyProfileService::scoped())
        .add(MyConversationService::scoped())
        .add(MyMessageService::scoped())
        .build_provider()
        .unwrap();

    axum::Router::new()
        .nest("/profiles", api::profiles::router())
        .nest("/conversations", api::conversations::router())
        .nest("/messages", api::messages::router())
        .with_provider(provider)
}

async fn insert_profile(pool: &SqlitePool, role: Role, is_active: bool) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO user_profiles (id, role, full_name, is_active, created_at, updated_at) VALUES (?, ?, NULL, ?, ?, ?)",
    )
    .bind(id)
    .bind(role)
    .bind(is_active)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .unwrap();
    id
}

async fn send(
    method: &str,
    uri: &str,
    user: Option<Uuid>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header("X-User-ID", user.to_string());
    }
    let request = match body {
        Some(body) => request
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = create_test_app().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

async fn open_conversation(patient: Uuid) -> Value {
    let (status, json) = send(
        "POST",
        "/conversations",
        Some(patient),
        Some(json!({ "channel": "site", "subject": "Appointment" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json
}

#[tokio::test]
#[serial]
async fn test_list_conversations_empty() {
    let _pool = setup_test_db().await;

    let (status, json) = send("GET", "/conversations", Some(Uuid::new_v4()), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["conversations"].as_array().unwrap().len(), 0);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_list_conversations_requires_auth() {
    let _pool = setup_test_db().await;

    let (status, _) = send("GET", "/conversations", None, None).await;

    // Should fail without X-User-ID header
    assert_eq!(status, StatusCode::BAD_REQUEST);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_first_request_creates_patient_profile() {
    let _pool = setup_test_db().await;
    let user = Uuid::new_v4();

    let (status, json) = send("GET", "/profiles/me", Some(user), None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], user.to_string());
    assert_eq!(json["role"], "patient");
    assert_eq!(json["is_active"], true);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_create_conversation_posts_welcome() {
    let _pool = setup_test_db().await;
    let patient = Uuid::new_v4();

    let conversation = open_conversation(patient).await;
    assert_eq!(conversation["status"], "open");
    assert_eq!(conversation["channel"], "site");
    assert_eq!(conversation["patient_id"], patient.to_string());
    assert_eq!(conversation["attendant_id"], Value::Null);

    let uri = format!("/conversations/{}/messages", conversation["id"].as_str().unwrap());
    let (status, json) = send("GET", &uri, Some(patient), None).await;

    assert_eq!(status, StatusCode::OK);
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["sender_kind"], "bot");

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_create_conversation_with_first_message() {
    let _pool = setup_test_db().await;
    let patient = Uuid::new_v4();

    let (status, conversation) = send(
        "POST",
        "/conversations",
        Some(patient),
        Some(json!({ "channel": "whatsapp", "message": "I need my exam results" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let uri = format!("/conversations/{}/messages", conversation["id"].as_str().unwrap());
    let (_, json) = send("GET", &uri, Some(patient), None).await;

    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["content"], "I need my exam results");
    assert_eq!(messages[1]["sender_id"], patient.to_string());
    assert_eq!(messages[1]["seq"], 2);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_blank_first_message_creates_nothing() {
    let _pool = setup_test_db().await;
    let patient = Uuid::new_v4();

    let (status, json) = send(
        "POST",
        "/conversations",
        Some(patient),
        Some(json!({ "channel": "email", "message": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Validation");

    let (status, json) = send("GET", "/conversations", Some(patient), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["conversations"].as_array().unwrap().len(), 0);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_unknown_channel_is_rejected() {
    let _pool = setup_test_db().await;

    let (status, json) = send(
        "POST",
        "/conversations",
        Some(Uuid::new_v4()),
        Some(json!({ "channel": "pager" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "Validation");

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_get_messages_nonexistent_conversation() {
    let _pool = setup_test_db().await;

    let uri = format!("/conversations/{}/messages", Uuid::new_v4());
    let (status, json) = send("GET", &uri, Some(Uuid::new_v4()), None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "NotFound");

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_get_messages_wrong_user() {
    let _pool = setup_test_db().await;
    let owner = Uuid::new_v4();
    let other_user = Uuid::new_v4();

    let conversation = open_conversation(owner).await;
    let uri = format!("/conversations/{}/messages", conversation["id"].as_str().unwrap());

    // other patients cannot tell the conversation exists
    let (status, _) = send("GET", &uri, Some(other_user), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        "POST",
        &uri,
        Some(other_user),
        Some(json!({ "content": "hello?" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_user_isolation() {
    let _pool = setup_test_db().await;
    let user1 = Uuid::new_v4();
    let user2 = Uuid::new_v4();

    for (user, count) in [(user1, 2), (user2, 3)] {
        for _ in 0..count {
            open_conversation(user).await;
        }
    }

    let (_, json) = send("GET", "/conversations", Some(user1), None).await;
    assert_eq!(json["conversations"].as_array().unwrap().len(), 2);

    let (_, json) = send("GET", "/conversations", Some(user2), None).await;
    assert_eq!(json["conversations"].as_array().unwrap().len(), 3);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_attendant_claims_and_replies() {
    let pool = setup_test_db().await;
    let patient = Uuid::new_v4();
    let attendant = insert_profile(&pool, Role::Attendant, true).await;
    let other_attendant = insert_profile(&pool, Role::Attendant, true).await;

    let conversation = open_conversation(patient).await;
    let id = conversation["id"].as_str().unwrap().to_owned();

    // a patient cannot claim
    let (status, _) = send(
        "POST",
        &format!("/conversations/{id}/assign"),
        Some(patient),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // nor may an attendant claim for someone else
    let (status, _) = send(
        "POST",
        &format!("/conversations/{id}/assign"),
        Some(attendant),
        Some(json!({ "attendant_id": other_attendant })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, assigned) = send(
        "POST",
        &format!("/conversations/{id}/assign"),
        Some(attendant),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assigned["attendant_id"], attendant.to_string());

    let (_, queue) = send("GET", "/conversations", Some(other_attendant), None).await;
    assert_eq!(queue["conversations"].as_array().unwrap().len(), 0);

    let (status, reply) = send(
        "POST",
        &format!("/conversations/{id}/messages"),
        Some(attendant),
        Some(json!({ "content": "Hi there" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["status"], "sent");

    let (status, read) = send(
        "POST",
        &format!("/messages/{}/read", reply["id"].as_str().unwrap()),
        Some(patient),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["status"], "read");
    assert!(read["read_at"].is_string());

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_close_then_send_conflicts() {
    let _pool = setup_test_db().await;
    let patient = Uuid::new_v4();

    let conversation = open_conversation(patient).await;
    let id = conversation["id"].as_str().unwrap().to_owned();

    let (status, _) = send(
        "POST",
        &format!("/conversations/{id}/close"),
        Some(patient),
        Some(json!({ "rating": 7 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, closed) = send(
        "POST",
        &format!("/conversations/{id}/close"),
        Some(patient),
        Some(json!({ "rating": 5, "feedback": "Quick and kind" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["status"], "closed");
    assert_eq!(closed["rating"], 5);

    let (status, json) = send(
        "POST",
        &format!("/conversations/{id}/messages"),
        Some(patient),
        Some(json!({ "content": "still there?" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["error"], "InvalidState");

    let (status, _) = send(
        "POST",
        &format!("/conversations/{id}/close"),
        Some(patient),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_waiting_is_for_staff() {
    let pool = setup_test_db().await;
    let patient = Uuid::new_v4();
    let manager = insert_profile(&pool, Role::Manager, true).await;

    let conversation = open_conversation(patient).await;
    let uri = format!(
        "/conversations/{}/waiting",
        conversation["id"].as_str().unwrap()
    );

    let (status, _) = send("POST", &uri, Some(patient), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = send("POST", &uri, Some(manager), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "waiting");

    let (status, _) = send("POST", &uri, Some(manager), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_manager_administers_profiles() {
    let pool = setup_test_db().await;
    let manager = insert_profile(&pool, Role::Manager, true).await;
    let patient = Uuid::new_v4();

    // patients cannot list profiles
    let (status, _) = send("GET", "/profiles", Some(patient), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = send("GET", "/profiles", Some(manager), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["profiles"].as_array().unwrap().len(), 2);

    let (status, promoted) = send(
        "PUT",
        &format!("/profiles/{patient}/role"),
        Some(manager),
        Some(json!({ "role": "attendant" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(promoted["role"], "attendant");

    let (status, _) = send(
        "PUT",
        &format!("/profiles/{patient}/role"),
        Some(manager),
        Some(json!({ "role": "owner" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, deactivated) = send(
        "PUT",
        &format!("/profiles/{patient}/active"),
        Some(manager),
        Some(json!({ "is_active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deactivated["is_active"], false);

    // deactivated users are locked out everywhere
    let (status, json) = send("GET", "/conversations", Some(patient), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "Forbidden");

    let (status, _) = send(
        "PUT",
        &format!("/profiles/{}/active", Uuid::new_v4()),
        Some(manager),
        Some(json!({ "is_active": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    cleanup_test_db();
}

#[tokio::test]
#[serial]
async fn test_staff_opens_conversation_for_patient() {
    let pool = setup_test_db().await;
    let attendant = insert_profile(&pool, Role::Attendant, true).await;
    let patient = Uuid::new_v4();

    let (status, _) = send(
        "POST",
        "/conversations",
        Some(attendant),
        Some(json!({ "channel": "email" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(
        "POST",
        "/conversations",
        Some(attendant),
        Some(json!({ "channel": "email", "patient_id": patient })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["patient_id"], patient.to_string());

    // patients only open conversations for themselves
    let (status, _) = send(
        "POST",
        "/conversations",
        Some(Uuid::new_v4()),
        Some(json!({ "channel": "email", "patient_id": patient })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    cleanup_test_db();
}
