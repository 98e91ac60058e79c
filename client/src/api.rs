//! HTTP plumbing for the service's REST endpoints.
//!
//! Uses ehttp so the same calls work on any platform ehttp supports.

use crate::error::{ConfigError, ConnectionError, ReceiveError};
use crate::ClientError;
use realtime_kit_protocol::{HttpBroadcastMessage, HttpBroadcastRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;

// ============================================================================
// Endpoint layout
// ============================================================================

/// Endpoint URLs derived from the project URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrls {
    base: String,
}

impl ServiceUrls {
    /// Validate a project URL. Only `http` and `https` are accepted.
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::InvalidUrl {
                    url: url.to_string(),
                    reason: format!("unsupported scheme {}", other),
                })
            }
        }
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn auth(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn broadcast(&self) -> String {
        format!("{}/realtime/v1/api/broadcast", self.base)
    }

    /// Realtime socket endpoint, with http(s) converted to ws(s).
    pub fn realtime_socket(&self) -> String {
        let ws_base = self
            .base
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        format!("{}/realtime/v1/websocket", ws_base)
    }
}

// ============================================================================
// HTTP helpers (wrapping ehttp's callback API into async)
// ============================================================================

pub(crate) async fn fetch(request: ehttp::Request) -> Result<ehttp::Response, ClientError> {
    let (tx, rx) = futures::channel::oneshot::channel();

    tracing::debug!("{} {}", request.method, request.url);
    ehttp::fetch(request, move |result| {
        let _ = tx.send(result);
    });

    rx.await
        .map_err(|_| ClientError::Connection(ConnectionError::Transport("Request cancelled".to_string())))?
        .map_err(|e| ClientError::Connection(ConnectionError::Transport(e)))
}

pub(crate) fn parse_response<T: DeserializeOwned>(response: ehttp::Response) -> Result<T, ClientError> {
    if !response.ok {
        let status = response.status;
        let body = response.text().unwrap_or_default();
        return Err(ClientError::Connection(ConnectionError::ServerRejected(
            format!("{}: {}", status, body),
        )));
    }

    serde_json::from_slice(&response.bytes)
        .map_err(|e| ClientError::Receive(ReceiveError::MalformedMessage(e.to_string())))
}

pub(crate) fn post_json<B: Serialize>(
    url: String,
    body: &B,
    api_key: &str,
    bearer: Option<&str>,
) -> Result<ehttp::Request, ClientError> {
    let body = serde_json::to_vec(body)?;
    let mut req = ehttp::Request::post(url, body);
    req.headers.insert("Content-Type", "application/json");
    req.headers.insert("apikey", api_key);
    req.headers
        .insert("Authorization", format!("Bearer {}", bearer.unwrap_or(api_key)));
    Ok(req)
}

// ============================================================================
// Broadcast endpoint
// ============================================================================

/// REST client for `POST /realtime/v1/api/broadcast`.
#[derive(Debug, Clone)]
pub struct BroadcastEndpoint {
    url: String,
    api_key: String,
}

impl BroadcastEndpoint {
    pub fn new(urls: &ServiceUrls, api_key: &str) -> Self {
        Self {
            url: urls.broadcast(),
            api_key: api_key.to_string(),
        }
    }

    /// Publish messages without holding a socket.
    ///
    /// `access_token` defaults to the API key, which is enough for public
    /// topics only.
    pub async fn send(
        &self,
        access_token: Option<&str>,
        messages: Vec<HttpBroadcastMessage>,
    ) -> Result<(), ClientError> {
        let count = messages.len();
        let request = post_json(
            self.url.clone(),
            &HttpBroadcastRequest { messages },
            &self.api_key,
            access_token,
        )?;
        let response = fetch(request).await?;

        if !response.ok {
            let status = response.status;
            let body = response.text().unwrap_or_default().to_string();
            tracing::warn!("Broadcast endpoint rejected {} message(s): {} {}", count, status, body);
            return Err(ClientError::Connection(ConnectionError::ServerRejected(
                format!("{}: {}", status, body),
            )));
        }

        tracing::debug!("Broadcast endpoint accepted {} message(s)", count);
        Ok(())
    }
}
