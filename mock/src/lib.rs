//! In-process stand-in for the hosted realtime service.
//!
//! Serves the public contract the client consumes: password sign-in and
//! logout, the realtime WebSocket and the REST broadcast endpoint. Meant for
//! hermetic tests; state lives in memory and dies with the service.

pub mod accounts;
pub mod builder;
pub mod error;
pub mod rest;
pub mod tokens;
pub mod topics;
pub mod ws;

#[cfg(test)]
mod tests;

use crate::accounts::Accounts;
use crate::rest::AppState;
use crate::tokens::{Claims, TokenManager};
use crate::topics::TopicRegistry;
use crate::ws::WsState;
use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use std::net::SocketAddr;
use std::sync::Arc;

pub use builder::MockServiceBuilder;
pub use error::ServiceError;

/// Who may join a channel whose config sets `private: true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrivateTopicPolicy {
    /// Only tokens with the `authenticated` role.
    #[default]
    AuthenticatedOnly,
    AllowAll,
    DenyAll,
}

impl PrivateTopicPolicy {
    pub fn allows(&self, claims: &Claims) -> bool {
        match self {
            PrivateTopicPolicy::AuthenticatedOnly => claims.is_authenticated(),
            PrivateTopicPolicy::AllowAll => true,
            PrivateTopicPolicy::DenyAll => false,
        }
    }
}

/// Configuration for the service.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Address to bind the HTTP server.
    pub bind_addr: String,
    /// HS256 secret for anon keys and access tokens.
    pub jwt_secret: Vec<u8>,
    /// User session lifetime in seconds.
    pub token_expiry_secs: u64,
    pub private_topic_policy: PrivateTopicPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            jwt_secret: b"realtime-kit-mock-secret".to_vec(),
            token_expiry_secs: 3600,
            private_topic_policy: PrivateTopicPolicy::default(),
        }
    }
}

/// Mount the service's endpoints.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/auth/v1/token", web::post().to(rest::token))
        .route("/auth/v1/logout", web::post().to(rest::logout))
        .route("/realtime/v1/api/broadcast", web::post().to(rest::broadcast))
        .route("/realtime/v1/websocket", web::get().to(ws::realtime_ws));
}

/// A running service. Call [`MockService::stop`] to shut it down.
pub struct MockService {
    addr: SocketAddr,
    anon_key: String,
    tokens: Arc<TokenManager>,
    registry: Arc<TopicRegistry>,
    handle: ServerHandle,
}

impl MockService {
    pub fn builder() -> MockServiceBuilder {
        MockServiceBuilder::new()
    }

    fn start(config: ServiceConfig, users: Vec<(String, String)>) -> Result<Self, ServiceError> {
        let tokens = Arc::new(TokenManager::new(&config.jwt_secret, config.token_expiry_secs));
        let accounts = Arc::new(Accounts::new());
        for (email, password) in &users {
            accounts.insert(email, password);
        }
        let registry = Arc::new(TopicRegistry::new());
        let anon_key = tokens.issue_anon()?;

        let app_state = web::Data::new(AppState {
            tokens: Arc::clone(&tokens),
            accounts: Arc::clone(&accounts),
            registry: Arc::clone(&registry),
            policy: config.private_topic_policy,
        });
        let ws_state = web::Data::new(WsState {
            registry: Arc::clone(&registry),
            tokens: Arc::clone(&tokens),
            policy: config.private_topic_policy,
        });

        let bind_addr = config.bind_addr.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        // The server gets its own thread and actix system so it runs the same
        // under any caller runtime.
        std::thread::Builder::new()
            .name("realtime-kit-mock".to_string())
            .spawn(move || {
                let system = actix_web::rt::System::new();
                system.block_on(async move {
                    let server = HttpServer::new(move || {
                        App::new()
                            .wrap(Cors::permissive())
                            .app_data(app_state.clone())
                            .app_data(ws_state.clone())
                            .configure(routes)
                    })
                    .workers(1)
                    .disable_signals()
                    .bind(&bind_addr);

                    let server = match server {
                        Ok(server) => server,
                        Err(e) => {
                            let _ = ready_tx.send(Err(ServiceError::Io(e)));
                            return;
                        }
                    };
                    let Some(addr) = server.addrs().first().copied() else {
                        let _ = ready_tx.send(Err(ServiceError::Config(format!(
                            "nothing bound on {}",
                            bind_addr
                        ))));
                        return;
                    };

                    let server = server.run();
                    let _ = ready_tx.send(Ok((addr, server.handle())));
                    if let Err(e) = server.await {
                        tracing::warn!("Mock service stopped with error: {}", e);
                    }
                });
            })?;

        let (addr, handle) = ready_rx
            .recv()
            .map_err(|_| ServiceError::Startup("service thread exited before binding".to_string()))??;

        tracing::info!("Mock service listening on {} ({} user(s))", addr, accounts.len());
        Ok(Self {
            addr,
            anon_key,
            tokens,
            registry,
            handle,
        })
    }

    /// Base URL, e.g. `http://127.0.0.1:54321`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Public API key with the `anon` role.
    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Stop accepting connections and close open sockets.
    pub async fn stop(self) {
        self.handle.stop(false).await;
        tracing::info!("Mock service on {} stopped", self.addr);
    }
}
