//! Scripted RPC transport for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::rpc::RpcTransport;

type Responder = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Transport answering from per-method queues, then per-method responders.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    queued: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
    responders: Mutex<HashMap<String, Responder>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a one-shot result for `method`
    pub(crate) fn push(&self, method: &str, result: Value) {
        self.push_result(method, Ok(result));
    }

    /// Queue a one-shot error for `method`
    pub(crate) fn push_err(&self, method: &str, error: PipelineError) {
        self.push_result(method, Err(error));
    }

    fn push_result(&self, method: &str, result: Result<Value>) {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Answer `method` with `responder` once its queue is drained
    pub(crate) fn respond<F>(&self, method: &str, responder: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .insert(method.to_string(), Box::new(responder));
    }

    /// Params of every call made to `method`, in order
    pub(crate) fn calls(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        if let Some(result) = queued {
            return result;
        }

        match self.responders.lock().unwrap().get(method) {
            Some(responder) => responder(&params),
            None => Err(PipelineError::decode(method, "no scripted response")),
        }
    }
}

/// Node error object as the transport would surface it
pub(crate) fn node_error(method: &str, code: i64, message: &str) -> PipelineError {
    PipelineError::Rpc {
        method: method.to_string(),
        params: "[]".to_string(),
        code,
        message: message.to_string(),
        data: None,
    }
}
