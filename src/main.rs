use anyhow::{bail, Result};
use alloy_primitives::utils::format_ether;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chain_pipeline::config::{Config, ConfirmationConfig, SubscriptionSection, TransferConfig};
use chain_pipeline::{
    Account, BlockTag, ConfirmationTracker, EthClient, EventSubscriber, FeePolicy,
    FileCursorStore, HttpRpcClient, LogBatch, LogNotice, PipelineError, TransactionBuilder,
    TransactionRequest,
};

/// Build, sign and send the configured transfer, then wait for its receipt
async fn run_transfer(
    client: EthClient,
    account: Account,
    chain_id: u64,
    transfer: TransferConfig,
    fees: FeePolicy,
    confirmation: ConfirmationConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let to = transfer.recipient()?;
    let value = transfer.value()?;

    let builder = TransactionBuilder::new(client.clone(), account.address()).with_policy(fees);
    let tx = builder
        .build(TransactionRequest::transfer(chain_id, to, value))
        .await?;
    info!(
        "Prepared transaction: nonce {}, to {}, value {} ETH, max fee {} wei, priority fee {} wei, gas limit {}",
        tx.nonce,
        tx.to,
        format_ether(tx.value),
        tx.fees.max_fee_per_gas,
        tx.fees.max_priority_fee_per_gas,
        tx.fees.gas_limit
    );

    let signed = account.sign_transaction(tx)?;
    let tracker = ConfirmationTracker::new(client, confirmation.poll_interval());
    let pending = tracker.submit(&signed).await?;
    info!("Transaction hash: {}", pending.tx_hash);

    match tracker
        .await_receipt(&pending, confirmation.timeout(), &cancel)
        .await
    {
        Ok(receipt) => {
            info!(
                "Transaction {} confirmed: status {:?}, block {}, gas used {}",
                receipt.transaction_hash, receipt.status, receipt.block_number, receipt.gas_used
            );
            if !receipt.is_success() {
                warn!("Transaction {} reverted", receipt.transaction_hash);
            }
        }
        Err(PipelineError::Cancelled) => {
            warn!("Stopped waiting for transaction {}", pending.tx_hash);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn log_batch(batch: &LogBatch) {
    for notice in &batch.notices {
        let event = notice.event();
        match notice {
            LogNotice::Delivered(_) => info!(
                "{} event from {} in tx {} (block {}, log {}): {}",
                event.event_name,
                event.contract_address,
                event.transaction_hash,
                event.block_number,
                event.log_index,
                event.args_json()
            ),
            LogNotice::Retracted(_) => warn!(
                "{} event in tx {} (block {}, log {}) retracted by reorg",
                event.event_name, event.transaction_hash, event.block_number, event.log_index
            ),
        }
    }
}

/// Watch the configured contract until cancelled
async fn run_subscription(
    client: EthClient,
    section: SubscriptionSection,
    cancel: CancellationToken,
) -> Result<()> {
    let filter = section.filter()?;
    let names: Vec<&str> = filter.events().iter().map(|e| e.name()).collect();
    info!(
        "Watching {} for events [{}], cursor file {}",
        filter.address(),
        names.join(", "),
        section.cursor_path().display()
    );

    let store = FileCursorStore::new(section.cursor_path());
    let (sender, mut receiver) = mpsc::channel::<LogBatch>(64);
    let consumer = tokio::spawn(async move {
        while let Some(batch) = receiver.recv().await {
            log_batch(&batch);
        }
    });

    let mut subscriber =
        EventSubscriber::new(client, filter, section.subscription_config(), store, sender);
    let result = subscriber.run(&cancel).await;

    // closes the channel so the consumer drains and exits
    drop(subscriber);
    consumer.await?;

    result.map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Load configuration first
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    // Initialize logging; RUST_LOG takes precedence over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("Configuration loaded successfully");

    let transport = HttpRpcClient::new(
        &config.rpc.url,
        config.rpc.request_timeout(),
        config.rpc.retry_policy(),
    )?;
    info!("Connecting to RPC endpoint: {:?}", transport);
    let client = EthClient::from_transport(transport);

    let head = client.block_number().await?;
    let node_chain_id = client.chain_id().await?;
    let chain_id = match config.chain.chain_id {
        Some(expected) if expected != node_chain_id => {
            bail!("Configured chain id {} but node reports {}", expected, node_chain_id)
        }
        _ => node_chain_id,
    };
    let gas_price = client.gas_price().await?;
    info!("Block number: {}, chain ID: {}, gas price: {} wei", head, chain_id, gas_price);

    let account = match &config.account.private_key {
        Some(key) => Some(Account::from_hex(key.expose())?),
        None => None,
    };
    if let Some(account) = &account {
        let balance = client.get_balance(account.address(), BlockTag::Latest).await?;
        let nonce = client
            .get_transaction_count(account.address(), BlockTag::Pending)
            .await?;
        info!(
            "Signer {}: balance {} ETH, next nonce {}",
            account.address(),
            format_ether(balance),
            nonce
        );
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<(&str, JoinHandle<Result<()>>)> = Vec::new();

    if let (Some(transfer), Some(account)) = (config.transfer.clone(), account.clone()) {
        info!("Starting transfer task");
        tasks.push((
            "transfer",
            tokio::spawn(run_transfer(
                client.clone(),
                account,
                chain_id,
                transfer,
                config.fees.fee_policy(),
                config.confirmation.clone(),
                cancel.clone(),
            )),
        ));
    }

    if let Some(section) = config.subscription.clone() {
        info!("Starting event subscription task");
        tasks.push((
            "subscription",
            tokio::spawn(run_subscription(client.clone(), section, cancel.clone())),
        ));
    }

    if tasks.is_empty() {
        info!("No [transfer] or [subscription] configured, exiting");
        return Ok(());
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let mut failed = false;
    for (name, handle) in tasks {
        match handle.await {
            Ok(Ok(())) => info!("{} task completed successfully", name),
            Ok(Err(e)) => {
                error!("{} task failed: {:#}", name, e);
                failed = true;
            }
            Err(e) => {
                error!("{} task panicked: {}", name, e);
                failed = true;
            }
        }
    }

    if failed {
        bail!("one or more tasks failed");
    }
    info!("Shutdown complete");
    Ok(())
}
