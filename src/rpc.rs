//! JSON-RPC 2.0 transport over HTTP(S) with bounded retry

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Longest params summary carried in an error
const PARAMS_SUMMARY_LEN: usize = 160;

/// A JSON-RPC endpoint.
///
/// Implementations must be safe to share between tasks; the transaction
/// pipeline and the event subscriber call the same instance concurrently.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Issue `method` with `params` and return the raw `result` value
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

#[async_trait]
impl<T: RpcTransport + ?Sized> RpcTransport for Arc<T> {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        (**self).call(method, params).await
    }
}

/// Retry policy for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Node error codes treated as transient (rate limiting, overload)
    pub retryable_codes: Vec<i64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            retryable_codes: vec![-32005, -32029, 429],
        }
    }
}

impl RetryPolicy {
    /// Policy that performs a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (1-based), doubling up to `max_backoff`
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1) && error.is_transient(&self.retryable_codes)
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// HTTP JSON-RPC client.
///
/// Cloning is cheap; clones share the connection pool and the request id
/// counter.
#[derive(Clone)]
pub struct HttpRpcClient {
    client: Client,
    url: Url,
    policy: RetryPolicy,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for HttpRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // endpoint paths often embed API keys
        f.debug_struct("HttpRpcClient")
            .field("host", &self.url.host_str())
            .field("policy", &self.policy)
            .finish()
    }
}

impl HttpRpcClient {
    /// Create a new client for `rpc_url`
    pub fn new(rpc_url: &str, request_timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let url: Url = rpc_url
            .parse()
            .map_err(|e| PipelineError::Configuration(format!("Invalid RPC URL: {}", e)))?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url,
            policy,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| network_error(method, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PipelineError::Network {
                method: method.to_string(),
                reason: format!("HTTP {}", status),
            });
        }

        let body = response.bytes().await.map_err(|e| network_error(method, e))?;
        debug!("{} (id {}) -> HTTP {}, {} bytes", method, id, status, body.len());

        parse_response(method, params, &body)
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut attempt = 1;
        loop {
            match self.call_once(method, &params).await {
                Ok(result) => return Ok(result),
                Err(e) if self.policy.should_retry(&e, attempt) => {
                    let backoff = self.policy.backoff_for(attempt);
                    warn!(
                        "{} failed: {}, retrying in {:?} (attempt {}/{})",
                        method, e, backoff, attempt, self.policy.max_attempts
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn network_error(method: &str, error: reqwest::Error) -> PipelineError {
    PipelineError::Network {
        method: method.to_string(),
        reason: error.without_url().to_string(),
    }
}

/// Split a JSON-RPC response body into its result or a typed error
pub(crate) fn parse_response(method: &str, params: &Value, body: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| PipelineError::decode(format!("{} response", method), e))?;

    let Value::Object(mut object) = value else {
        return Err(PipelineError::decode(
            format!("{} response", method),
            "response is not a JSON object",
        ));
    };

    if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
        let error: JsonRpcErrorObject = serde_json::from_value(error)
            .map_err(|e| PipelineError::decode(format!("{} error object", method), e))?;
        return Err(PipelineError::Rpc {
            method: method.to_string(),
            params: summarize_params(params),
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }

    // `"result": null` is a legitimate answer (e.g. receipt not yet available)
    object.remove("result").ok_or_else(|| {
        PipelineError::decode(
            format!("{} response", method),
            "response has neither result nor error",
        )
    })
}

/// Short, single-line rendering of request params for error context
pub(crate) fn summarize_params(params: &Value) -> String {
    let rendered = params.to_string();
    if rendered.chars().count() <= PARAMS_SUMMARY_LEN {
        return rendered;
    }
    let mut summary: String = rendered.chars().take(PARAMS_SUMMARY_LEN).collect();
    summary.push_str("...");
    summary
}
