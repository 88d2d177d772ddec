//! Outbound async-call bridge
//!
//! When a workflow executes in asynchronous (fire-and-forget) mode, outbound
//! calls made by activity bodies are intercepted before they are sent: the
//! request is registered with an external async request service and the step
//! postpones carrying the request id. When a later tick replays the same code
//! path the bridge finds the stored response and returns it as if the call
//! had completed synchronously, so the body resumes exactly where it left
//! off. In synchronous mode calls pass straight through an [`HttpSender`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::activity::step::ActivityStep;
use crate::outcome::{ActivityFailure, Outcome, Postponement};

/// Context-dictionary key holding the ordered request ids a body has issued.
const OUTBOUND_REQUESTS_KEY: &str = "outbound_requests";

/// A serialized outbound request: everything needed to send it later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The eventual response to an outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl OutboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the response body to the expected type.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, ActivityFailure> {
        let body = self.body.clone().ok_or_else(|| {
            ActivityFailure::technical("outbound response has no body to deserialize")
        })?;
        serde_json::from_value(body).map_err(|e| {
            ActivityFailure::technical(format!("outbound response body did not deserialize: {e}"))
        })
    }
}

/// Error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The async request service failed
    #[error("async request service error: {0}")]
    Service(String),

    /// Sending the request synchronously failed
    #[error("send failed: {0}")]
    Send(String),
}

/// External service that executes registered requests asynchronously.
#[async_trait]
pub trait AsyncRequestService: Send + Sync + 'static {
    /// Register a request for asynchronous execution, returning its id.
    async fn create(
        &self,
        request: &OutboundRequest,
        priority: f64,
    ) -> Result<Uuid, BridgeError>;

    /// The response for a registered request, or `None` while still pending.
    async fn response(&self, request_id: Uuid) -> Result<Option<OutboundResponse>, BridgeError>;
}

/// Transport used for pass-through sends in synchronous mode.
#[async_trait]
pub trait HttpSender: Send + Sync + 'static {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, BridgeError>;
}

/// [`HttpSender`] backed by a shared `reqwest` client.
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, BridgeError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| BridgeError::Send(format!("invalid method '{}': {e}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))?;
        let body = if bytes.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).to_string())
            }))
        };

        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}

/// In-memory [`AsyncRequestService`] for tests: registered requests stay
/// pending until a response is supplied with [`respond`](Self::respond).
#[derive(Default)]
pub struct InMemoryAsyncRequestService {
    requests: RwLock<HashMap<Uuid, OutboundRequest>>,
    responses: RwLock<HashMap<Uuid, OutboundResponse>>,
}

impl InMemoryAsyncRequestService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered requests that have no response yet.
    pub fn pending_requests(&self) -> Vec<(Uuid, OutboundRequest)> {
        let responses = self.responses.read();
        self.requests
            .read()
            .iter()
            .filter(|(id, _)| !responses.contains_key(id))
            .map(|(id, request)| (*id, request.clone()))
            .collect()
    }

    /// Supply the response for a registered request.
    pub fn respond(&self, request_id: Uuid, response: OutboundResponse) {
        self.responses.write().insert(request_id, response);
    }
}

#[async_trait]
impl AsyncRequestService for InMemoryAsyncRequestService {
    async fn create(
        &self,
        request: &OutboundRequest,
        _priority: f64,
    ) -> Result<Uuid, BridgeError> {
        let request_id = Uuid::now_v7();
        self.requests.write().insert(request_id, request.clone());
        Ok(request_id)
    }

    async fn response(&self, request_id: Uuid) -> Result<Option<OutboundResponse>, BridgeError> {
        Ok(self.responses.read().get(&request_id).cloned())
    }
}

/// Intercept one outbound call from an activity body.
///
/// Call ordinals within one body invocation map onto the ordered request-id
/// list in the activity's context dictionary, so a body that issues several
/// sequential calls resumes each one with its own response on replay.
pub(crate) async fn send_intercepted(
    step: &ActivityStep,
    request: OutboundRequest,
) -> Outcome<OutboundResponse> {
    let ctx = step.context();

    if !ctx.is_asynchronous() {
        return match ctx.inner.http.send(&request).await {
            Ok(response) => Outcome::Completed(response),
            Err(e) => Outcome::Failed(
                ActivityFailure::technical(format!("outbound call failed: {e}"))
                    .for_activity(step.activity_instance_id()),
            ),
        };
    }

    let service = match ctx.inner.async_requests.as_ref() {
        Some(service) => service.clone(),
        None => {
            return Outcome::Failed(ActivityFailure::capability(
                "workflow is asynchronous but no async request service is configured",
            ))
        }
    };

    let ordinal = step.next_outbound_ordinal();
    let issued: Vec<Uuid> = step
        .get_context_value(OUTBOUND_REQUESTS_KEY)
        .unwrap_or_default();

    if let Some(request_id) = issued.get(ordinal).copied() {
        // Replaying a call issued on an earlier tick.
        match service.response(request_id).await {
            Ok(Some(response)) => {
                debug!(%request_id, ordinal, "outbound call resumed with stored response");
                Outcome::Completed(response)
            }
            Ok(None) => Outcome::Postponed(Postponement::async_request(request_id)),
            Err(e) => Outcome::Failed(
                ActivityFailure::capability(format!("async request service error: {e}"))
                    .for_activity(step.activity_instance_id()),
            ),
        }
    } else {
        let request_id = match service
            .create(&request, step.options().async_priority)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                return Outcome::Failed(
                    ActivityFailure::capability(format!(
                        "could not register async request: {e}"
                    ))
                    .for_activity(step.activity_instance_id()),
                )
            }
        };

        let mut issued = issued;
        issued.push(request_id);
        if let Err(failure) = step.set_context_value(OUTBOUND_REQUESTS_KEY, &issued).await {
            return Outcome::Failed(failure);
        }

        debug!(%request_id, ordinal, "outbound call redirected to async request service");
        Outcome::Postponed(Postponement::async_request(request_id))
    }
}
