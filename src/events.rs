//! Event signatures, `eth_getLogs` filters and log decoding

use std::collections::HashMap;
use std::fmt;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{Event, EventParam, JsonAbi};
use alloy_primitives::{Address, Bytes, B256};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::eth::RpcLog;

/// Parsed Solidity event declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSignature {
    event: Event,
}

impl EventSignature {
    /// Parse a human-readable declaration such as
    /// `event Buy(address indexed owner, address indexed spender, uint256 value)`
    pub fn parse(declaration: &str) -> Result<Self> {
        let event = Event::parse(declaration.trim())
            .map_err(|e| PipelineError::decode(format!("event declaration `{}`", declaration), e))?;
        Ok(Self { event })
    }

    /// Every event declared in a JSON ABI document
    pub fn from_abi_json(abi_json: &str) -> Result<Vec<Self>> {
        let abi: JsonAbi =
            serde_json::from_str(abi_json).map_err(|e| PipelineError::decode("JSON ABI", e))?;
        Ok(abi.events().cloned().map(Self::from).collect())
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    /// Canonical form, e.g. `Buy(address,address,uint256)`
    pub fn canonical(&self) -> String {
        self.event.signature()
    }

    /// keccak256 of the canonical form
    pub fn topic0(&self) -> B256 {
        self.event.selector()
    }

    pub fn is_anonymous(&self) -> bool {
        self.event.anonymous
    }

    pub fn inputs(&self) -> &[EventParam] {
        &self.event.inputs
    }
}

impl From<Event> for EventSignature {
    fn from(event: Event) -> Self {
        Self { event }
    }
}

/// Position of a log on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogKey {
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.transaction_hash, self.log_index)
    }
}

/// Decoded contract event
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub contract_address: Address,
    pub event_name: String,
    /// Arguments in declaration order
    pub args: Vec<(String, DynSolValue)>,
    pub block_number: u64,
    pub block_hash: Option<B256>,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub removed: bool,
}

impl LogEvent {
    pub fn key(&self) -> LogKey {
        LogKey {
            transaction_hash: self.transaction_hash,
            log_index: self.log_index,
        }
    }

    /// Argument by name
    pub fn arg(&self, name: &str) -> Option<&DynSolValue> {
        self.args.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Arguments as a JSON object; integers become decimal strings
    pub fn args_json(&self) -> Value {
        let mut object = Map::new();
        for (name, value) in &self.args {
            object.insert(name.clone(), value_to_json(value));
        }
        Value::Object(object)
    }
}

/// A log that matched the filter but could not be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub event_name: Option<String>,
    pub reason: String,
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "undecodable log")?;
        if let Some(name) = &self.event_name {
            write!(f, " for {}", name)?;
        }
        if let Some(block) = self.block_number {
            write!(f, " in block {}", block)?;
        }
        if let Some(tx) = &self.transaction_hash {
            write!(f, " (tx {}", tx)?;
            match self.log_index {
                Some(index) => write!(f, ", log {})", index)?,
                None => write!(f, ")")?,
            }
        }
        write!(f, ": {}", self.reason)
    }
}

/// Outcome of decoding one raw log entry
#[derive(Debug, Clone, PartialEq)]
pub enum LogDecode {
    Decoded(LogEvent),
    /// Other contract, unknown topic0, or no topics at all
    Ignored,
    Warning(DecodeWarning),
}

/// Contract address plus the events of interest
#[derive(Debug, Clone)]
pub struct EventFilter {
    address: Address,
    events: Vec<EventSignature>,
    by_topic: HashMap<B256, usize>,
}

impl EventFilter {
    /// Build a filter; anonymous events have no topic0 and are rejected
    pub fn new(address: Address, events: Vec<EventSignature>) -> Result<Self> {
        if events.is_empty() {
            return Err(PipelineError::Configuration(
                "event filter needs at least one event".to_string(),
            ));
        }

        let mut by_topic = HashMap::new();
        for (position, event) in events.iter().enumerate() {
            if event.is_anonymous() {
                return Err(PipelineError::Configuration(format!(
                    "anonymous event {} cannot be matched by topic",
                    event.name()
                )));
            }
            by_topic.insert(event.topic0(), position);
        }

        Ok(Self {
            address,
            events,
            by_topic,
        })
    }

    /// Parse each declaration and build a filter
    pub fn from_declarations<S: AsRef<str>>(address: Address, declarations: &[S]) -> Result<Self> {
        let events = declarations
            .iter()
            .map(|d| EventSignature::parse(d.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::new(address, events)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn events(&self) -> &[EventSignature] {
        &self.events
    }

    /// `eth_getLogs` filter object for an inclusive block range
    pub fn to_filter_params(&self, from_block: u64, to_block: u64) -> Value {
        let topic0s: Vec<B256> = self.events.iter().map(EventSignature::topic0).collect();
        json!({
            "address": self.address,
            "fromBlock": format!("{:#x}", from_block),
            "toBlock": format!("{:#x}", to_block),
            "topics": [topic0s],
        })
    }

    /// Decode one raw log entry
    pub fn decode(&self, raw: Value) -> LogDecode {
        let log = match RpcLog::from_value(raw) {
            Ok(log) => log,
            Err(e) => {
                return LogDecode::Warning(DecodeWarning {
                    block_number: None,
                    transaction_hash: None,
                    log_index: None,
                    event_name: None,
                    reason: e.to_string(),
                })
            }
        };

        if log.address != self.address {
            debug!("Ignoring log from unexpected address {}", log.address);
            return LogDecode::Ignored;
        }

        let Some(event) = log
            .topics
            .first()
            .and_then(|topic0| self.by_topic.get(topic0))
            .map(|&position| &self.events[position])
        else {
            return LogDecode::Ignored;
        };

        let warning = |reason: String| {
            LogDecode::Warning(DecodeWarning {
                block_number: log.block_number.map(|n| n.to::<u64>()),
                transaction_hash: log.transaction_hash,
                log_index: log.log_index.map(|i| i.to::<u64>()),
                event_name: Some(event.name().to_string()),
                reason,
            })
        };

        let (Some(block_number), Some(transaction_hash), Some(log_index)) =
            (log.block_number, log.transaction_hash, log.log_index)
        else {
            return warning("log is missing its block number, transaction hash or log index".to_string());
        };

        match decode_args(event, &log.topics[1..], &log.data) {
            Ok(args) => LogDecode::Decoded(LogEvent {
                contract_address: log.address,
                event_name: event.name().to_string(),
                args,
                block_number: block_number.to::<u64>(),
                block_hash: log.block_hash,
                transaction_hash,
                log_index: log_index.to::<u64>(),
                removed: log.removed,
            }),
            Err(reason) => warning(reason),
        }
    }
}

fn arg_name(param: &EventParam, position: usize) -> String {
    if param.name.is_empty() {
        format!("arg{}", position)
    } else {
        param.name.clone()
    }
}

/// Decode indexed arguments from `topics` (topic0 excluded) and the rest from `data`
fn decode_args(
    event: &EventSignature,
    topics: &[B256],
    data: &Bytes,
) -> std::result::Result<Vec<(String, DynSolValue)>, String> {
    let inputs = event.inputs();
    let indexed_count = inputs.iter().filter(|p| p.indexed).count();
    if topics.len() != indexed_count {
        return Err(format!(
            "expected {} indexed topics, found {}",
            indexed_count,
            topics.len()
        ));
    }

    let mut topic_values = topics.iter();
    let mut indexed = Vec::with_capacity(indexed_count);
    let mut body_types = Vec::new();
    for param in inputs.iter().filter(|p| p.indexed) {
        let ty = param
            .resolve()
            .map_err(|e| format!("unsupported type for {}: {}", param.name, e))?;
        let topic = topic_values
            .next()
            .ok_or_else(|| format!("missing topic for {}", param.name))?;
        indexed.push(decode_indexed(param, &ty, *topic)?);
    }
    for param in inputs.iter().filter(|p| !p.indexed) {
        body_types.push(
            param
                .resolve()
                .map_err(|e| format!("unsupported type for {}: {}", param.name, e))?,
        );
    }

    let body = if body_types.is_empty() {
        Vec::new()
    } else {
        match DynSolType::Tuple(body_types).abi_decode_params(data) {
            Ok(DynSolValue::Tuple(values)) => values,
            Ok(_) => return Err("log data did not decode to a tuple".to_string()),
            Err(e) => return Err(format!("failed to decode log data: {}", e)),
        }
    };

    let mut indexed = indexed.into_iter();
    let mut body = body.into_iter();
    let mut args = Vec::with_capacity(inputs.len());
    for (position, param) in inputs.iter().enumerate() {
        let value = if param.indexed {
            indexed.next()
        } else {
            body.next()
        };
        let value = value.ok_or_else(|| format!("missing value for {}", param.name))?;
        args.push((arg_name(param, position), value));
    }
    Ok(args)
}

/// Dynamic indexed values are stored as their keccak256 hash
fn decode_indexed(
    param: &EventParam,
    ty: &DynSolType,
    topic: B256,
) -> std::result::Result<DynSolValue, String> {
    match ty {
        DynSolType::String
        | DynSolType::Bytes
        | DynSolType::Array(_)
        | DynSolType::FixedArray(..)
        | DynSolType::Tuple(_) => Ok(DynSolValue::FixedBytes(topic, 32)),
        _ => ty
            .abi_decode(topic.as_slice())
            .map_err(|e| format!("failed to decode indexed {}: {}", param.name, e)),
    }
}

fn value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..*size])))
        }
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::Address(addr) => Value::String(format!("{:#x}", addr)),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(value_to_json).collect())
        }
        other => Value::String(format!("{:?}", other)),
    }
}
