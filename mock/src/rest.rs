//! REST API handlers for actix-web: auth and the broadcast endpoint.

use crate::accounts::Accounts;
use crate::tokens::{now_secs, Claims, TokenManager};
use crate::topics::{TopicKey, TopicRegistry};
use crate::PrivateTopicPolicy;
use actix_web::{web, HttpRequest, HttpResponse};
use realtime_kit_protocol::{
    realtime_topic, BroadcastMessage, HttpBroadcastRequest, PasswordCredentials, Session,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state for REST handlers.
pub struct AppState {
    pub tokens: Arc<TokenManager>,
    pub accounts: Arc<Accounts>,
    pub registry: Arc<TopicRegistry>,
    pub policy: PrivateTopicPolicy,
}

/// Error body in the auth service's `{error, error_description}` shape.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: String,
}

impl ErrorResponse {
    fn new(error: &str, description: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            error_description: description.into(),
        }
    }
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub grant_type: String,
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Extract the bearer token from the Authorization header.
fn extract_bearer(req: &HttpRequest) -> Option<&str> {
    header(req, "Authorization").and_then(|v| v.strip_prefix("Bearer "))
}

/// Every request must carry a valid `apikey` header.
fn check_api_key(req: &HttpRequest, tokens: &TokenManager) -> Result<Claims, HttpResponse> {
    let Some(key) = header(req, "apikey") else {
        return Err(HttpResponse::Unauthorized().json(ErrorResponse::new(
            "unauthorized",
            "No API key found in request",
        )));
    };
    tokens.validate(key).map_err(|_| {
        HttpResponse::Unauthorized().json(ErrorResponse::new("unauthorized", "Invalid API key"))
    })
}

/// POST /auth/v1/token?grant_type=password - Exchange credentials for a session.
pub async fn token(
    req: HttpRequest,
    query: web::Query<TokenQuery>,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    if let Err(response) = check_api_key(&req, &state.tokens) {
        return response;
    }

    if query.grant_type != "password" {
        return HttpResponse::BadRequest().json(ErrorResponse::new(
            "unsupported_grant_type",
            format!("grant_type {} is not supported", query.grant_type),
        ));
    }

    let credentials: PasswordCredentials = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            return HttpResponse::BadRequest()
                .json(ErrorResponse::new("invalid_request", format!("Invalid body: {}", e)));
        }
    };

    let Some(user) = state.accounts.verify(&credentials.email, &credentials.password) else {
        tracing::info!("Rejected password sign-in for {}", credentials.email);
        return HttpResponse::BadRequest()
            .json(ErrorResponse::new("invalid_grant", "Invalid login credentials"));
    };

    let access_token = match state.tokens.issue_for(&user) {
        Ok(token) => token,
        Err(e) => {
            return HttpResponse::InternalServerError()
                .json(ErrorResponse::new("server_error", e.to_string()));
        }
    };

    let expires_in = state.tokens.expiry_secs();
    tracing::info!("Issued session for {}", credentials.email);
    HttpResponse::Ok().json(Session {
        access_token,
        token_type: "bearer".to_string(),
        expires_in,
        expires_at: Some(now_secs() + expires_in),
        refresh_token: uuid::Uuid::new_v4().simple().to_string(),
        user,
    })
}

/// POST /auth/v1/logout - Revoke the bearer token.
pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(response) = check_api_key(&req, &state.tokens) {
        return response;
    }

    let Some(token) = extract_bearer(&req) else {
        return HttpResponse::Unauthorized().json(ErrorResponse::new(
            "unauthorized",
            "Missing Authorization header",
        ));
    };

    match state.tokens.validate(token) {
        Ok(claims) if claims.is_authenticated() => {
            state.tokens.revoke(token);
            tracing::info!("Signed out {}", claims.sub.as_deref().unwrap_or("<unknown>"));
            HttpResponse::NoContent().finish()
        }
        Ok(_) => HttpResponse::Forbidden().json(ErrorResponse::new(
            "forbidden",
            "Only user sessions can be signed out",
        )),
        Err(_) => HttpResponse::Unauthorized()
            .json(ErrorResponse::new("unauthorized", "Invalid or revoked token")),
    }
}

/// POST /realtime/v1/api/broadcast - Publish messages without a socket.
pub async fn broadcast(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> HttpResponse {
    let api_claims = match check_api_key(&req, &state.tokens) {
        Ok(claims) => claims,
        Err(response) => return response,
    };

    let claims = match extract_bearer(&req) {
        Some(token) => match state.tokens.validate(token) {
            Ok(claims) => claims,
            Err(_) => {
                return HttpResponse::Unauthorized()
                    .json(ErrorResponse::new("unauthorized", "Invalid or revoked token"));
            }
        },
        None => api_claims,
    };

    let request: HttpBroadcastRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return HttpResponse::BadRequest()
                .json(ErrorResponse::new("invalid_request", format!("Invalid body: {}", e)));
        }
    };

    if request.messages.iter().any(|m| m.private) && !state.policy.allows(&claims) {
        tracing::info!("Rejected private broadcast as {}", claims.role);
        return HttpResponse::Forbidden().json(ErrorResponse::new(
            "forbidden",
            "Not allowed to broadcast to private topics",
        ));
    }

    let mut delivered = 0;
    for message in request.messages {
        let key = TopicKey::new(realtime_topic(&message.topic), message.private);
        delivered += state.registry.broadcast(
            &key,
            None,
            &BroadcastMessage::new(message.event, message.payload),
        );
    }

    tracing::debug!("Broadcast endpoint delivered to {} socket(s)", delivered);
    HttpResponse::Accepted().finish()
}
