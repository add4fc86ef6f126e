//! Service configuration: `config.toml`, an optional local override and
//! `PIPELINE_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use serde::Deserialize;

use crate::builder::FeePolicy;
use crate::error::{PipelineError, Result};
use crate::events::{EventFilter, EventSignature};
use crate::rpc::RetryPolicy;
use crate::subscriber::SubscriptionConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Secret string that never shows up in `Debug` output
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub fees: FeesConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    pub transfer: Option<TransferConfig>,
    pub subscription: Option<SubscriptionSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_retryable_codes")]
    pub retryable_codes: Vec<i64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChainConfig {
    /// Expected chain id; the node's `eth_chainId` is used when absent
    pub chain_id: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AccountConfig {
    pub private_key: Option<Secret>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeesConfig {
    #[serde(default = "default_multiplier")]
    pub max_fee_multiplier_percent: u64,
    #[serde(default = "default_priority_fee")]
    pub priority_fee_wei: u64,
    #[serde(default = "default_gas_margin")]
    pub gas_limit_margin_percent: u64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        Self {
            max_fee_multiplier_percent: default_multiplier(),
            priority_fee_wei: default_priority_fee(),
            gas_limit_margin_percent: default_gas_margin(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_receipt_poll")]
    pub poll_interval_ms: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_confirmation_timeout(),
            poll_interval_ms: default_receipt_poll(),
        }
    }
}

/// Demo transfer sent once at startup
#[derive(Debug, Deserialize, Clone)]
pub struct TransferConfig {
    pub to: String,
    /// Decimal or `0x` hex amount in wei
    pub value_wei: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriptionSection {
    pub contract_address: String,
    /// Human-readable event declarations
    #[serde(default)]
    pub events: Vec<String>,
    /// JSON ABI file whose events are added to `events`
    pub abi_path: Option<String>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_log_poll")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "default_rewind")]
    pub reorg_rewind_blocks: u64,
    #[serde(default = "default_cursor_path")]
    pub cursor_path: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    250
}
fn default_max_backoff() -> u64 {
    8000
}
fn default_retryable_codes() -> Vec<i64> {
    vec![-32005, -32029, 429]
}
fn default_multiplier() -> u64 {
    200
}
fn default_priority_fee() -> u64 {
    2_000_000
}
fn default_gas_margin() -> u64 {
    20
}
fn default_confirmation_timeout() -> u64 {
    120
}
fn default_receipt_poll() -> u64 {
    2000
}
fn default_chunk_size() -> u64 {
    1000
}
fn default_log_poll() -> u64 {
    4000
}
fn default_rewind() -> u64 {
    12
}
fn default_cursor_path() -> String {
    "cursor.json".to_string()
}

fn config_error(e: impl fmt::Display) -> PipelineError {
    PipelineError::Configuration(e.to_string())
}

impl Config {
    /// Load from `path`, or from `config.toml` if present when `path` is `None`.
    ///
    /// `RPC_URL` and `PRIVATE_KEY` from the environment (or `.env`) fill in
    /// values the files leave unset.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(url) = std::env::var("RPC_URL") {
            builder = builder.set_default("rpc.url", url).map_err(config_error)?;
        }
        if let Ok(key) = std::env::var("PRIVATE_KEY") {
            builder = builder
                .set_default("account.private_key", key)
                .map_err(config_error)?;
        }

        let main_file = match path {
            Some(path) => config::File::with_name(path),
            None => config::File::with_name(DEFAULT_CONFIG_PATH).required(false),
        };

        let config: Config = builder
            .add_source(main_file)
            .add_source(config::File::with_name("config.local").required(false))
            .add_source(
                config::Environment::with_prefix("PIPELINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; used by tests and embedders
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc.url.trim().is_empty() {
            return Err(config_error("rpc.url must not be empty"));
        }
        if self.fees.max_fee_multiplier_percent < 100 {
            return Err(config_error(
                "fees.max_fee_multiplier_percent must be at least 100",
            ));
        }
        if self.fees.priority_fee_wei == 0 {
            return Err(config_error("fees.priority_fee_wei must be positive"));
        }

        if let Some(transfer) = &self.transfer {
            if self.account.private_key.is_none() {
                return Err(config_error(
                    "[transfer] requires account.private_key or PRIVATE_KEY",
                ));
            }
            transfer.recipient()?;
            transfer.value()?;
        }

        if let Some(subscription) = &self.subscription {
            if subscription.chunk_size == 0 {
                return Err(config_error("subscription.chunk_size must be positive"));
            }
            subscription.contract()?;
            subscription.event_signatures()?;
        }

        Ok(())
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            retryable_codes: self.retryable_codes.clone(),
        }
    }
}

impl FeesConfig {
    pub fn fee_policy(&self) -> FeePolicy {
        FeePolicy {
            max_fee_multiplier_percent: self.max_fee_multiplier_percent,
            priority_fee_wei: u128::from(self.priority_fee_wei),
            gas_limit_margin_percent: self.gas_limit_margin_percent,
        }
    }
}

impl ConfirmationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TransferConfig {
    pub fn recipient(&self) -> Result<Address> {
        Address::from_str(self.to.trim())
            .map_err(|e| config_error(format!("invalid transfer.to {}: {}", self.to, e)))
    }

    pub fn value(&self) -> Result<U256> {
        U256::from_str(self.value_wei.trim())
            .map_err(|e| config_error(format!("invalid transfer.value_wei {}: {}", self.value_wei, e)))
    }
}

impl SubscriptionSection {
    pub fn contract(&self) -> Result<Address> {
        Address::from_str(self.contract_address.trim()).map_err(|e| {
            config_error(format!(
                "invalid subscription.contract_address {}: {}",
                self.contract_address, e
            ))
        })
    }

    /// Declared events followed by those of `abi_path`
    pub fn event_signatures(&self) -> Result<Vec<EventSignature>> {
        let mut events = self
            .events
            .iter()
            .map(|declaration| EventSignature::parse(declaration).map_err(config_error))
            .collect::<Result<Vec<_>>>()?;

        if let Some(path) = &self.abi_path {
            let abi = std::fs::read_to_string(path)
                .map_err(|e| config_error(format!("failed to read ABI {}: {}", path, e)))?;
            events.extend(EventSignature::from_abi_json(&abi).map_err(config_error)?);
        }

        if events.is_empty() {
            return Err(config_error(
                "subscription needs at least one entry in events or an abi_path",
            ));
        }
        Ok(events)
    }

    pub fn filter(&self) -> Result<EventFilter> {
        EventFilter::new(self.contract()?, self.event_signatures()?)
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            start_block: self.start_block,
            chunk_size: self.chunk_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            confirmations: self.confirmations,
            reorg_rewind_blocks: self.reorg_rewind_blocks,
        }
    }

    pub fn cursor_path(&self) -> PathBuf {
        PathBuf::from(&self.cursor_path)
    }
}
