//! Remote HTTP sink.
//!
//! Mirrors the local store against a collection server:
//!
//! | Call | Request | Success |
//! |---|---|---|
//! | lookup | `GET /contexts/{hash}` | `200 {"contexts": [{"h": ..}]}` |
//! | create context | `POST /contexts/` | `201 {"h": ..}` |
//! | create session | `POST /sessions/` | `201` |
//! | submit metric | `POST /metrics/` | `201` |
//!
//! The first failed call (bad status or transport error) disables the sink
//! for the rest of the run. Nothing here is ever fatal to the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::ExecutionEnvironment;
use crate::model::{Kind, Metric, SessionRecord};

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Body of `POST /contexts/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub cpu_count: usize,
    pub cpu_frequency: f64,
    pub cpu_type: String,
    pub cpu_vendor: String,
    pub ram_total: u64,
    pub machine_node: String,
    pub machine_type: String,
    pub machine_arch: String,
    pub system_info: String,
    /// Runtime version. The name is what existing collectors expect.
    pub python_info: String,
    pub h: String,
}

impl From<&ExecutionEnvironment> for ContextPayload {
    fn from(env: &ExecutionEnvironment) -> Self {
        Self {
            cpu_count: env.cpu_count,
            cpu_frequency: env.cpu_frequency_mhz,
            cpu_type: env.cpu_model.clone(),
            cpu_vendor: env.cpu_vendor.clone(),
            ram_total: env.ram_total_mb,
            machine_node: env.hostname.clone(),
            machine_type: env.machine_type.clone(),
            machine_arch: env.architecture.clone(),
            system_info: env.os_description.clone(),
            python_info: env.runtime_version.clone(),
            h: env.hash(),
        }
    }
}

/// Entry in a context lookup answer. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    pub h: String,
}

/// Body of a `GET /contexts/{hash}` answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextLookup {
    pub contexts: Vec<ContextRef>,
}

/// Body of a `201` answer to `POST /contexts/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCreated {
    pub h: String,
}

/// Body of `POST /sessions/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub session_h: String,
    pub run_date: String,
    pub scm_ref: String,
    pub description: serde_json::Value,
}

impl SessionPayload {
    pub fn from_record(record: &SessionRecord) -> Result<Self, serde_json::Error> {
        Ok(Self {
            session_h: record.session_id.clone(),
            run_date: record.run_date.clone(),
            scm_ref: record.scm_revision.clone(),
            description: serde_json::from_str(&record.run_description)?,
        })
    }
}

/// Body of `POST /metrics/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    pub session_h: String,
    pub context_h: String,
    pub item_start_time: String,
    pub item_path: String,
    pub item: String,
    pub item_variant: String,
    pub item_fs_loc: String,
    pub kind: Kind,
    pub component: String,
    pub total_time: f64,
    pub user_time: f64,
    pub kernel_time: f64,
    pub cpu_usage: f64,
    pub mem_usage: f64,
}

impl MetricPayload {
    /// Build the payload, pointing at the environment id the remote assigned.
    pub fn new(metric: &Metric, context_h: &str) -> Self {
        Self {
            session_h: metric.session_id.clone(),
            context_h: context_h.to_string(),
            item_start_time: metric.start_time.clone(),
            item_path: metric.item_path.clone(),
            item: metric.item.clone(),
            item_variant: metric.item_variant.clone(),
            item_fs_loc: metric.item_location.clone(),
            kind: metric.kind,
            component: metric.component.clone(),
            total_time: metric.total_time,
            user_time: metric.user_time,
            kernel_time: metric.kernel_time,
            cpu_usage: metric.cpu_usage,
            mem_usage: metric.memory_usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Status and raw body of an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot build http client: {0}")]
    Client(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Blocking request/response channel to the collector.
pub trait Transport {
    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError> {
        (**self).send(method, url, body)
    }
}

/// [`Transport`] over `reqwest`'s blocking client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError> {
        let mut request = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
        };
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Response { status, body })
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected status {status} from {what}")]
    Status { what: &'static str, status: u16 },
    #[error("malformed answer from {what}: {source}")]
    Decode {
        what: &'static str,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Active,
    Disabled,
}

const OK: u16 = 200;
const CREATED: u16 = 201;

/// The remote sink. Once disabled it stays disabled and sends nothing.
#[derive(Debug)]
pub struct RemoteSink<T: Transport> {
    base: String,
    transport: T,
    state: SinkState,
    calls: u64,
}

impl<T: Transport> RemoteSink<T> {
    pub fn new(base: &str, transport: T) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            transport,
            state: SinkState::Active,
            calls: 0,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn is_active(&self) -> bool {
        self.state == SinkState::Active
    }

    /// Number of requests handed to the transport so far.
    pub fn calls_made(&self) -> u64 {
        self.calls
    }

    /// Identifier the collector holds for this environment hash, if any.
    ///
    /// Any status other than `200` means "not known". Only a transport
    /// failure disables the sink here.
    pub fn lookup_environment(&mut self, hash: &str) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        let url = format!("{}/contexts/{hash}", self.base);
        let response = match self.send(Method::Get, &url, None) {
            Ok(r) => r,
            Err(e) => {
                self.disable("environment lookup", e);
                return None;
            }
        };
        if response.status != OK {
            log::debug!("environment {hash} unknown to remote (status {})", response.status);
            return None;
        }
        match serde_json::from_str::<ContextLookup>(&response.body) {
            Ok(lookup) => lookup.contexts.into_iter().next().map(|c| c.h),
            Err(e) => {
                log::debug!("unreadable environment lookup answer: {e}");
                None
            }
        }
    }

    /// Find or create the environment remotely, returning its identifier.
    pub fn register_environment(&mut self, env: &ExecutionEnvironment) -> Option<String> {
        let payload = ContextPayload::from(env);
        if let Some(id) = self.lookup_environment(&payload.h) {
            return Some(id);
        }
        if !self.is_active() {
            return None;
        }
        let result = self
            .post("execution context", "contexts", &payload)
            .and_then(|response| {
                serde_json::from_str::<ContextCreated>(&response.body)
                    .map(|c| c.h)
                    .map_err(|source| RemoteError::Decode {
                        what: "execution context",
                        source,
                    })
            });
        match result {
            Ok(id) => Some(id),
            Err(e) => {
                self.disable("execution context", e);
                None
            }
        }
    }

    pub fn create_session(&mut self, record: &SessionRecord) -> bool {
        if !self.is_active() {
            return false;
        }
        let payload = match SessionPayload::from_record(record) {
            Ok(p) => p,
            Err(source) => {
                self.disable(
                    "session",
                    RemoteError::Decode {
                        what: "run description",
                        source,
                    },
                );
                return false;
            }
        };
        self.post_or_disable("session", "sessions", &payload)
    }

    pub fn submit_metric(&mut self, metric: &Metric, context_h: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        let payload = MetricPayload::new(metric, context_h);
        self.post_or_disable("metric", "metrics", &payload)
    }

    fn post_or_disable<P: Serialize>(
        &mut self,
        what: &'static str,
        path: &str,
        payload: &P,
    ) -> bool {
        match self.post(what, path, payload) {
            Ok(_) => true,
            Err(e) => {
                self.disable(what, e);
                false
            }
        }
    }

    fn post<P: Serialize>(
        &mut self,
        what: &'static str,
        path: &str,
        payload: &P,
    ) -> Result<Response, RemoteError> {
        let body =
            serde_json::to_value(payload).map_err(|source| RemoteError::Decode { what, source })?;
        let url = format!("{}/{path}/", self.base);
        let response = self.send(Method::Post, &url, Some(&body))?;
        if response.status != CREATED {
            return Err(RemoteError::Status {
                what,
                status: response.status,
            });
        }
        Ok(response)
    }

    fn send(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError> {
        self.calls += 1;
        log::debug!("{} {url}", method.as_str());
        self.transport.send(method, url, body)
    }

    fn disable(&mut self, what: &str, err: impl Into<RemoteError>) {
        let err = err.into();
        log::warn!(
            "cannot send {what} to remote monitor server {} ({err}); deactivating remote sink",
            self.base
        );
        self.state = SinkState::Disabled;
    }
}
