// Executor: performs one deferred call and classifies the outcome

use std::{panic::AssertUnwindSafe, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use thiserror::Error;

use crate::scheduled_item::{Method, ScheduledItem};

// Every variant is a transient failure: retryable until the attempt ceiling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Rejected: {status_code} - {message}")]
    Rejected { status_code: u16, message: String },

    #[error("Executor panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn perform(
        &self,
        method: Method,
        target: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError>;
}

/// Runs one item through `executor` so that nothing the call does can escape:
/// a panic or an overrun of `timeout` comes back as a `TransportError`.
pub async fn guarded_perform(
    executor: &dyn Executor,
    item: &ScheduledItem,
    timeout: Duration,
) -> Result<Response, TransportError> {
    let call = executor.perform(item.method, &item.target, item.payload.as_ref());
    let guarded = AssertUnwindSafe(tokio::time::timeout(timeout, call)).catch_unwind();

    match guarded.await {
        Ok(Ok(result)) => result,
        Ok(Err(_elapsed)) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TransportError::Panicked(msg))
        }
    }
}

// reqwest-backed executor; any non-2xx status is a rejection
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn perform(
        &self,
        method: Method,
        target: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Response, TransportError> {
        let mut request = self.client.request(method.into(), target);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status_code: status.as_u16(),
                message: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(Response {
            status: status.as_u16(),
            body,
        })
    }
}

// Scriptable executor for tests and local runs
pub mod mock_executor {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockReply {
        Accept,
        Reject(u16),
        NetworkError,
        Panic,
        // never completes; only the guard timeout ends it
        Hang,
    }

    #[derive(Debug, Clone)]
    pub struct MockCall {
        pub method: Method,
        pub target: String,
        pub payload: Option<serde_json::Value>,
        pub at: Instant,
    }

    pub struct MockExecutor {
        default_reply: Mutex<MockReply>,
        scripted: Mutex<HashMap<String, VecDeque<MockReply>>>,
        calls: Mutex<Vec<MockCall>>,
        call_count: AtomicUsize,
        delay_ms: AtomicU64,
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self {
                default_reply: Mutex::new(MockReply::Accept),
                scripted: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
                delay_ms: AtomicU64::new(0),
            }
        }

        pub fn failing() -> Self {
            let mock = Self::new();
            mock.set_default(MockReply::Reject(503));
            mock
        }

        pub fn set_default(&self, reply: MockReply) {
            *self.default_reply.lock() = reply;
        }

        pub fn set_delay(&self, delay_ms: u64) {
            self.delay_ms.store(delay_ms, Ordering::SeqCst);
        }

        // Replies used, in order, for the next calls to `target`
        pub fn script(&self, target: &str, replies: Vec<MockReply>) {
            self.scripted
                .lock()
                .entry(target.to_string())
                .or_default()
                .extend(replies);
        }

        pub fn calls(&self) -> Vec<MockCall> {
            self.calls.lock().clone()
        }

        pub fn calls_for(&self, target: &str) -> Vec<MockCall> {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.target == target)
                .cloned()
                .collect()
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        fn next_reply(&self, target: &str) -> MockReply {
            let scripted = self
                .scripted
                .lock()
                .get_mut(target)
                .and_then(|q| q.pop_front());
            scripted.unwrap_or_else(|| self.default_reply.lock().clone())
        }
    }

    impl Default for MockExecutor {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        async fn perform(
            &self,
            method: Method,
            target: &str,
            payload: Option<&serde_json::Value>,
        ) -> Result<Response, TransportError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push(MockCall {
                method,
                target: target.to_string(),
                payload: payload.cloned(),
                at: Instant::now(),
            });

            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            match self.next_reply(target) {
                MockReply::Accept => Ok(Response {
                    status: 200,
                    body: Bytes::from_static(b"{\"success\":true}"),
                }),
                MockReply::Reject(status_code) => Err(TransportError::Rejected {
                    status_code,
                    message: "Service temporarily unavailable".to_string(),
                }),
                MockReply::NetworkError => {
                    Err(TransportError::Network("connection reset".to_string()))
                }
                MockReply::Panic => panic!("mock executor blew up on {target}"),
                MockReply::Hang => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }
}
