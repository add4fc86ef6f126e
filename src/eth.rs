//! Typed `eth_*` calls on top of an [`RpcTransport`]

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U128, U256, U64};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};
use crate::rpc::RpcTransport;

/// Block selector for state queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
    Number(u64),
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Pending => json!("pending"),
            BlockTag::Number(n) => json!(format!("{:#x}", n)),
        }
    }
}

/// Call object for `eth_estimateGas`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Bytes>,
}

/// Log entry as served by `eth_getLogs`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub transaction_index: Option<U64>,
    #[serde(default)]
    pub log_index: Option<U64>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// Parse a single log entry
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| PipelineError::decode("log entry", e))
    }
}

/// Receipt as served by `eth_getTransactionReceipt`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    pub gas_used: U64,
    #[serde(default)]
    pub effective_gas_price: Option<U128>,
    #[serde(default)]
    pub from: Option<Address>,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub logs: Vec<Value>,
}

#[derive(Deserialize)]
struct BlockHash {
    hash: B256,
}

/// Ethereum JSON-RPC client.
///
/// Holds no mutable state; clones share the underlying transport.
#[derive(Clone)]
pub struct EthClient {
    transport: Arc<dyn RpcTransport>,
}

impl EthClient {
    /// Create a client over a shared transport
    pub fn new(transport: Arc<dyn RpcTransport>) -> Self {
        Self { transport }
    }

    /// Create a client that owns `transport`
    pub fn from_transport<T: RpcTransport + 'static>(transport: T) -> Self {
        Self::new(Arc::new(transport))
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.transport.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| PipelineError::decode(format!("{} result", method), e))
    }

    /// Current chain head
    pub async fn block_number(&self) -> Result<u64> {
        let n: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(n.to::<u64>())
    }

    /// Chain id reported by the node
    pub async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    /// Current gas price in wei
    pub async fn gas_price(&self) -> Result<u128> {
        let price: U128 = self.request("eth_gasPrice", json!([])).await?;
        Ok(price.to::<u128>())
    }

    /// Balance of `address` in wei
    pub async fn get_balance(&self, address: Address, block: BlockTag) -> Result<U256> {
        self.request("eth_getBalance", json!([address, block.to_param()]))
            .await
    }

    /// Number of transactions sent from `address`
    pub async fn get_transaction_count(&self, address: Address, block: BlockTag) -> Result<u64> {
        let count: U64 = self
            .request("eth_getTransactionCount", json!([address, block.to_param()]))
            .await?;
        Ok(count.to::<u64>())
    }

    /// Gas estimate for `call`
    pub async fn estimate_gas(&self, call: &CallRequest) -> Result<u64> {
        let gas: U64 = self.request("eth_estimateGas", json!([call])).await?;
        Ok(gas.to::<u64>())
    }

    /// Hash of block `number`, or `None` if the node does not have it
    pub async fn get_block_hash(&self, number: u64) -> Result<Option<B256>> {
        let block: Option<BlockHash> = self
            .request("eth_getBlockByNumber", json!([format!("{:#x}", number), false]))
            .await?;
        Ok(block.map(|b| b.hash))
    }

    /// Submit a signed, serialized transaction; returns the node's hash
    pub async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256> {
        self.request("eth_sendRawTransaction", json!([raw])).await
    }

    /// Receipt for `tx_hash`, or `None` while the transaction is unmined
    pub async fn get_transaction_receipt(&self, tx_hash: B256) -> Result<Option<RpcReceipt>> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }

    /// Logs matching `filter`.
    ///
    /// Entries are returned undecoded so that one malformed entry can be
    /// skipped without failing the whole range.
    pub async fn get_logs(&self, filter: &Value) -> Result<Vec<Value>> {
        self.request("eth_getLogs", json!([filter])).await
    }
}
