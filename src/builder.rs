//! EIP-1559 transaction building with RPC-resolved defaults

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::eth::{BlockTag, CallRequest, EthClient};
use crate::transaction::{AccessListItem, FeeParameters, Transaction, MIN_TRANSFER_GAS};

/// Defaults applied to fee and gas fields left unset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    /// Max fee as a percentage of the current gas price (200 = 2x)
    pub max_fee_multiplier_percent: u64,
    /// Fixed tip in wei
    pub priority_fee_wei: u128,
    /// Headroom added on top of `eth_estimateGas`
    pub gas_limit_margin_percent: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            max_fee_multiplier_percent: 200,
            // 0.002 gwei
            priority_fee_wei: 2_000_000,
            gas_limit_margin_percent: 20,
        }
    }
}

impl FeePolicy {
    /// Max fee derived from a gas price quote; fails when it does not fit in `u128`
    pub fn scaled_max_fee(&self, gas_price: u128) -> Result<u128> {
        gas_price
            .checked_mul(u128::from(self.max_fee_multiplier_percent))
            .map(|scaled| scaled / 100)
            .ok_or_else(|| {
                PipelineError::InvalidFee(format!(
                    "gas price {} scaled by {}% overflows the max fee",
                    gas_price, self.max_fee_multiplier_percent
                ))
            })
    }

    /// Gas limit derived from an estimate
    pub fn padded_gas_limit(&self, estimate: u64) -> u64 {
        let margin = estimate.saturating_mul(self.gas_limit_margin_percent) / 100;
        estimate.saturating_add(margin).max(MIN_TRANSFER_GAS)
    }
}

/// Partially specified transaction; `None` fields are resolved by the builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub chain_id: u64,
    pub to: Address,
    pub value: U256,
    pub nonce: Option<u64>,
    pub gas_limit: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
    pub data: Bytes,
    pub access_list: Vec<AccessListItem>,
}

impl TransactionRequest {
    /// Plain value transfer with everything else unset
    pub fn transfer(chain_id: u64, to: Address, value: U256) -> Self {
        Self {
            chain_id,
            to,
            value,
            nonce: None,
            gas_limit: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            data: Bytes::new(),
            access_list: Vec::new(),
        }
    }

    /// Set nonce
    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Set gas limit
    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    /// Set max fee per gas
    pub fn max_fee_per_gas(mut self, max_fee_per_gas: u128) -> Self {
        self.max_fee_per_gas = Some(max_fee_per_gas);
        self
    }

    /// Set max priority fee per gas
    pub fn max_priority_fee_per_gas(mut self, max_priority_fee_per_gas: u128) -> Self {
        self.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
        self
    }

    /// Set calldata
    pub fn data(mut self, data: Bytes) -> Self {
        self.data = data;
        self
    }

    /// Set access list
    pub fn access_list(mut self, access_list: Vec<AccessListItem>) -> Self {
        self.access_list = access_list;
        self
    }

    fn is_plain_transfer(&self) -> bool {
        self.data.is_empty() && self.access_list.is_empty()
    }

    /// Reject caller-supplied values that can never form a valid transaction
    fn validate_explicit(&self) -> Result<()> {
        if self.max_fee_per_gas == Some(0) || self.max_priority_fee_per_gas == Some(0) {
            return Err(PipelineError::InvalidFee("fee caps must be positive".to_string()));
        }
        if let (Some(max_fee), Some(tip)) = (self.max_fee_per_gas, self.max_priority_fee_per_gas) {
            if tip > max_fee {
                return Err(PipelineError::InvalidFee(format!(
                    "max priority fee {} exceeds max fee {}",
                    tip, max_fee
                )));
            }
        }
        if let Some(gas_limit) = self.gas_limit {
            if gas_limit < MIN_TRANSFER_GAS {
                return Err(PipelineError::InvalidFee(format!(
                    "gas limit {} is below the {} intrinsic minimum",
                    gas_limit, MIN_TRANSFER_GAS
                )));
            }
        }
        Ok(())
    }
}

/// Transaction builder for a single sending account.
///
/// Nonces come from `eth_getTransactionCount(from, "pending")`; the builder
/// does not serialize concurrent builds for the same account.
#[derive(Clone)]
pub struct TransactionBuilder {
    client: EthClient,
    from: Address,
    policy: FeePolicy,
}

impl TransactionBuilder {
    /// Create a builder with the default fee policy
    pub fn new(client: EthClient, from: Address) -> Self {
        Self {
            client,
            from,
            policy: FeePolicy::default(),
        }
    }

    /// Replace the fee policy
    pub fn with_policy(mut self, policy: FeePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Get the fee policy
    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    /// Resolve every unset field and return a valid unsigned transaction
    pub async fn build(&self, request: TransactionRequest) -> Result<Transaction> {
        request.validate_explicit()?;

        let nonce = match request.nonce {
            Some(nonce) => nonce,
            None => {
                self.client
                    .get_transaction_count(self.from, BlockTag::Pending)
                    .await?
            }
        };

        let (max_fee_per_gas, max_priority_fee_per_gas) = self.resolve_fees(&request).await?;

        let gas_limit = match request.gas_limit {
            Some(gas_limit) => gas_limit,
            None => self.resolve_gas_limit(&request).await?,
        };

        let tx = Transaction {
            chain_id: request.chain_id,
            nonce,
            to: request.to,
            value: request.value,
            fees: FeeParameters {
                max_fee_per_gas,
                max_priority_fee_per_gas,
                gas_limit,
            },
            data: request.data,
            access_list: request.access_list,
        };
        tx.fees.validate()?;

        debug!(
            "Built transaction: nonce {}, max fee {}, priority fee {}, gas limit {}",
            tx.nonce, max_fee_per_gas, max_priority_fee_per_gas, gas_limit
        );

        Ok(tx)
    }

    async fn resolve_fees(&self, request: &TransactionRequest) -> Result<(u128, u128)> {
        match (request.max_fee_per_gas, request.max_priority_fee_per_gas) {
            (Some(max_fee), Some(tip)) => Ok((max_fee, tip)),
            (Some(max_fee), None) => Ok((max_fee, self.policy.priority_fee_wei.min(max_fee))),
            (None, tip) => {
                let gas_price = self.client.gas_price().await?;
                let tip = tip.unwrap_or(self.policy.priority_fee_wei);
                let max_fee = self.policy.scaled_max_fee(gas_price)?.max(tip);
                debug!("Gas price {} -> max fee {}, priority fee {}", gas_price, max_fee, tip);
                Ok((max_fee, tip))
            }
        }
    }

    async fn resolve_gas_limit(&self, request: &TransactionRequest) -> Result<u64> {
        if request.is_plain_transfer() {
            return Ok(MIN_TRANSFER_GAS);
        }

        let call = CallRequest {
            from: Some(self.from),
            to: request.to,
            value: Some(request.value),
            data: Some(request.data.clone()),
        };

        let estimate = self.client.estimate_gas(&call).await.map_err(|e| match e {
            PipelineError::Rpc { code, message, .. } => {
                PipelineError::Estimation(format!("{} (code {})", message, code))
            }
            PipelineError::Decode { reason, .. } => PipelineError::Estimation(reason),
            other => other,
        })?;

        Ok(self.policy.padded_gas_limit(estimate))
    }
}
