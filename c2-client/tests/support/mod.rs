#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use c2emu_client::{C2Client, C2Transport, TransportError};
use c2emu_common::AgentConfig;
use serde_json::{json, Value};

#[derive(Debug, Clone)]
pub enum Call {
    Json { url: String, body: Value },
    File { url: String, name: String, data: Vec<u8> },
    Get { url: String, body: Value },
}

impl Call {
    pub fn action(&self) -> Option<&str> {
        match self {
            Call::Json { body, .. } => body.get("action").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Call::Json { body, .. } | Call::Get { body, .. } => Some(body),
            Call::File { .. } => None,
        }
    }
}

pub enum Reply {
    Json(Value),
    Bytes(Vec<u8>),
}

type Responder = Box<dyn Fn(&Call) -> Result<Reply, TransportError> + Send + Sync>;

/// Records every request and answers from a closure. Optionally holds each
/// request open for `delay` to expose overlapping exchanges.
pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    responder: Responder,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&Call) -> Result<Reply, TransportError> + Send + Sync + 'static,
    {
        Self::with_delay(responder, Duration::ZERO)
    }

    pub fn with_delay<F>(responder: F, delay: Duration) -> Arc<Self>
    where
        F: Fn(&Call) -> Result<Reply, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// A cooperative controller: confirms registration and reports, has no
    /// task queued, grants every transfer and serves `payload` bytes.
    pub fn controller() -> Arc<Self> {
        Self::new(default_reply)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| match call {
                Call::Json { .. } => call.action().unwrap_or("?").to_string(),
                Call::File { .. } => "<file>".to_string(),
                Call::Get { .. } => "<get>".to_string(),
            })
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn handle(&self, call: Call) -> Result<Reply, TransportError> {
        self.calls.lock().unwrap().push(call.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (self.responder)(&call)
    }
}

pub fn default_reply(call: &Call) -> Result<Reply, TransportError> {
    Ok(match call {
        Call::Json { body, .. } => match body["action"].as_str() {
            Some("register") | Some("report") => Reply::Json(json!({"state": 1})),
            Some("getTask") => Reply::Json(json!({"task": null})),
            Some("upload") => Reply::Json(json!({"upload": "ok"})),
            Some("download") => Reply::Json(json!({"download": "ok"})),
            _ => Reply::Json(json!({})),
        },
        Call::File { name, .. } => Reply::Json(json!({"uploaded": name})),
        Call::Get { .. } => Reply::Bytes(b"payload".to_vec()),
    })
}

#[async_trait]
impl C2Transport for MockTransport {
    async fn post_json(&self, url: &str, body: &Value) -> Result<Value, TransportError> {
        let call = Call::Json {
            url: url.to_string(),
            body: body.clone(),
        };
        match self.handle(call).await? {
            Reply::Json(value) => Ok(value),
            Reply::Bytes(_) => Err(TransportError::InvalidResponse("expected json".into())),
        }
    }

    async fn post_file(
        &self,
        url: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Value, TransportError> {
        let call = Call::File {
            url: url.to_string(),
            name: file_name.to_string(),
            data,
        };
        match self.handle(call).await? {
            Reply::Json(value) => Ok(value),
            Reply::Bytes(_) => Err(TransportError::InvalidResponse("expected json".into())),
        }
    }

    async fn get_bytes(&self, url: &str, body: &Value) -> Result<Vec<u8>, TransportError> {
        let call = Call::Get {
            url: url.to_string(),
            body: body.clone(),
        };
        match self.handle(call).await? {
            Reply::Bytes(bytes) => Ok(bytes),
            Reply::Json(_) => Err(TransportError::InvalidResponse("expected bytes".into())),
        }
    }
}

pub fn test_config(download_dir: &Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.agent.id = "agent-1".into();
    config.agent.own_ip = "10.0.0.5".into();
    config.agent.download_dir = download_dir.to_path_buf();
    config.controller.host = "10.0.0.1".into();
    config
}

pub fn client_with(transport: Arc<MockTransport>, download_dir: &Path) -> Arc<C2Client> {
    Arc::new(C2Client::new(&test_config(download_dir), transport).unwrap())
}

/// Client that already completed registration. The register call stays in
/// the transport's log as the first entry.
pub async fn connected_client(transport: Arc<MockTransport>, download_dir: &Path) -> Arc<C2Client> {
    let client = client_with(transport, download_dir);
    assert!(client.register(&[]).await);
    client
}
