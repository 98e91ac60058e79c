//! Endpoint tests driving the actix app in-process.

use crate::accounts::Accounts;
use crate::rest::AppState;
use crate::tokens::{TokenManager, ROLE_AUTHENTICATED};
use crate::topics::TopicRegistry;
use crate::ws::WsState;
use crate::{routes, PrivateTopicPolicy};
use actix_web::{test as actix_test, web, App};
use realtime_kit_protocol::Session;
use serde_json::{json, Value};
use std::sync::Arc;

struct Fixture {
    app_state: web::Data<AppState>,
    ws_state: web::Data<WsState>,
    anon_key: String,
}

fn fixture() -> Fixture {
    fixture_with(PrivateTopicPolicy::AuthenticatedOnly)
}

fn fixture_with(policy: PrivateTopicPolicy) -> Fixture {
    let tokens = Arc::new(TokenManager::new(b"test-secret", 3600));
    let accounts = Arc::new(Accounts::new());
    accounts.insert("test1@test.com", "test_test");
    let registry = Arc::new(TopicRegistry::new());
    let anon_key = tokens.issue_anon().unwrap();

    Fixture {
        app_state: web::Data::new(AppState {
            tokens: Arc::clone(&tokens),
            accounts,
            registry: Arc::clone(&registry),
            policy,
        }),
        ws_state: web::Data::new(WsState {
            registry,
            tokens,
            policy,
        }),
        anon_key,
    }
}

macro_rules! app {
    ($fx:expr) => {
        actix_test::init_service(
            App::new()
                .app_data($fx.app_state.clone())
                .app_data($fx.ws_state.clone())
                .configure(routes),
        )
        .await
    };
}

fn sign_in_request(anon_key: &str, password: &str) -> actix_test::TestRequest {
    actix_test::TestRequest::post()
        .uri("/auth/v1/token?grant_type=password")
        .insert_header(("apikey", anon_key))
        .set_json(json!({ "email": "test1@test.com", "password": password }))
}

#[actix_web::test]
async fn password_grant_issues_authenticated_session() {
    let fx = fixture();
    let app = app!(fx);

    let resp = actix_test::call_service(&app, sign_in_request(&fx.anon_key, "test_test").to_request()).await;
    assert_eq!(resp.status(), 200);
    let session: Session = actix_test::read_body_json(resp).await;
    assert_eq!(session.user.email.as_deref(), Some("test1@test.com"));
    assert_eq!(session.token_type, "bearer");

    let claims = fx.app_state.tokens.validate(&session.access_token).unwrap();
    assert_eq!(claims.role, ROLE_AUTHENTICATED);
}

#[actix_web::test]
async fn wrong_password_is_invalid_grant() {
    let fx = fixture();
    let app = app!(fx);

    let resp = actix_test::call_service(&app, sign_in_request(&fx.anon_key, "nope").to_request()).await;
    assert_eq!(resp.status(), 400);
    let body: Value = actix_test::read_body_json(resp).await;
    assert_eq!(body["error"], "invalid_grant");
    assert_eq!(body["error_description"], "Invalid login credentials");
}

#[actix_web::test]
async fn requests_without_apikey_are_unauthorized() {
    let fx = fixture();
    let app = app!(fx);

    let req = actix_test::TestRequest::post()
        .uri("/auth/v1/token?grant_type=password")
        .set_json(json!({ "email": "test1@test.com", "password": "test_test" }))
        .to_request();
    assert_eq!(actix_test::call_service(&app, req).await.status(), 401);
}

#[actix_web::test]
async fn logout_revokes_the_token() {
    let fx = fixture();
    let app = app!(fx);

    let resp = actix_test::call_service(&app, sign_in_request(&fx.anon_key, "test_test").to_request()).await;
    let session: Session = actix_test::read_body_json(resp).await;

    let logout = || {
        actix_test::TestRequest::post()
            .uri("/auth/v1/logout")
            .insert_header(("apikey", fx.anon_key.as_str()))
            .insert_header(("Authorization", format!("Bearer {}", session.access_token)))
            .to_request()
    };
    assert_eq!(actix_test::call_service(&app, logout()).await.status(), 204);
    assert_eq!(actix_test::call_service(&app, logout()).await.status(), 401);
    assert!(fx.app_state.tokens.validate(&session.access_token).is_err());
}

#[actix_web::test]
async fn broadcast_endpoint_accepts_public_and_gates_private() {
    let fx = fixture();
    let app = app!(fx);

    let public = actix_test::TestRequest::post()
        .uri("/realtime/v1/api/broadcast")
        .insert_header(("apikey", fx.anon_key.as_str()))
        .set_json(json!({
            "messages": [{ "topic": "room", "event": "ping", "payload": {}, "private": false }]
        }))
        .to_request();
    assert_eq!(actix_test::call_service(&app, public).await.status(), 202);

    let private = actix_test::TestRequest::post()
        .uri("/realtime/v1/api/broadcast")
        .insert_header(("apikey", fx.anon_key.as_str()))
        .set_json(json!({
            "messages": [{ "topic": "room", "event": "ping", "payload": {}, "private": true }]
        }))
        .to_request();
    assert_eq!(actix_test::call_service(&app, private).await.status(), 403);
}

fn private_broadcast_request(apikey: &str, bearer: Option<&str>) -> actix_test::TestRequest {
    let req = actix_test::TestRequest::post()
        .uri("/realtime/v1/api/broadcast")
        .insert_header(("apikey", apikey))
        .set_json(json!({
            "messages": [{ "topic": "room", "event": "ping", "payload": {}, "private": true }]
        }));
    match bearer {
        Some(token) => req.insert_header(("Authorization", format!("Bearer {}", token))),
        None => req,
    }
}

#[actix_web::test]
async fn private_broadcasts_follow_the_topic_policy() {
    let open = fixture_with(PrivateTopicPolicy::AllowAll);
    let app = app!(open);
    let resp = actix_test::call_service(&app, private_broadcast_request(&open.anon_key, None).to_request()).await;
    assert_eq!(resp.status(), 202);

    let closed = fixture_with(PrivateTopicPolicy::DenyAll);
    let app = app!(closed);
    let resp = actix_test::call_service(&app, sign_in_request(&closed.anon_key, "test_test").to_request()).await;
    let session: Session = actix_test::read_body_json(resp).await;
    let resp = actix_test::call_service(
        &app,
        private_broadcast_request(&closed.anon_key, Some(&session.access_token)).to_request(),
    )
    .await;
    assert_eq!(resp.status(), 403);
}

#[test]
fn policy_decides_private_access() {
    let tokens = TokenManager::new(b"s", 60);
    let anon = tokens.validate(&tokens.issue_anon().unwrap()).unwrap();

    assert!(!PrivateTopicPolicy::AuthenticatedOnly.allows(&anon));
    assert!(PrivateTopicPolicy::AllowAll.allows(&anon));
    assert!(!PrivateTopicPolicy::DenyAll.allows(&anon));
}

#[tokio::test]
async fn spawned_service_binds_an_ephemeral_port() {
    let service = crate::MockService::builder()
        .user("test1@test.com", "test_test")
        .spawn()
        .unwrap();
    assert!(service.url().starts_with("http://127.0.0.1:"));
    assert_ne!(service.local_addr().port(), 0);
    assert!(service.tokens().validate(service.anon_key()).is_ok());
    service.stop().await;
}
