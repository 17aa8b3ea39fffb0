//! Shared test transport: scripted responses per path, with call recording.
#![allow(dead_code)]

use async_trait::async_trait;
use convoy::{HttpCall, HttpResponse, NetworkErrorCode, Transport, TransportFailure};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted response step.
#[derive(Clone)]
pub struct Step {
    pub status: u16,
    pub body: Value,
    pub delay: Duration,
    pub network_error: Option<NetworkErrorCode>,
}

impl Step {
    pub fn status(status: u16, body: Value) -> Self {
        Self { status, body, delay: Duration::ZERO, network_error: None }
    }

    pub fn delayed(status: u16, body: Value, delay: Duration) -> Self {
        Self { status, body, delay, network_error: None }
    }
}

/// Responds from a per-path script; the last step repeats once the script is
/// exhausted. Records every call and start/end events.
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<String>>,
    events: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        // Surface engine logs in failing tests; repeat attempts no-op.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, path: &str, steps: Vec<Step>) -> Self {
        self.routes.lock().unwrap().insert(path.to_string(), steps.into());
        self
    }

    /// Calls made to `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|p| p.as_str() == path).count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_index(&self, event: &str) -> Option<usize> {
        self.events.lock().unwrap().iter().position(|e| e == event)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        call: &HttpCall,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportFailure> {
        let step = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(&call.path) {
                Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
                Some(steps) => steps
                    .front()
                    .cloned()
                    .unwrap_or_else(|| Step::status(200, Value::Null)),
                None => Step::status(404, Value::Null),
            }
        };
        self.calls.lock().unwrap().push(call.path.clone());
        self.events.lock().unwrap().push(format!("start {}", call.path));
        if !step.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.events.lock().unwrap().push(format!("cancel {}", call.path));
                    return Err(TransportFailure::network(
                        NetworkErrorCode::ConnReset,
                        "cancelled mid-flight",
                    ));
                }
                _ = tokio::time::sleep(step.delay) => {}
            }
        }
        self.events.lock().unwrap().push(format!("end {}", call.path));
        if let Some(code) = step.network_error {
            return Err(TransportFailure::network(code, "scripted network failure"));
        }
        Ok(HttpResponse {
            status: step.status,
            status_text: format!("status {}", step.status),
            headers: BTreeMap::new(),
            body: step.body,
        })
    }
}
