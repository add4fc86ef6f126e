//! Event subscriber: historical backfill followed by live polling.
//!
//! The subscriber walks `[cursor + 1, head - confirmations]` in chunks,
//! hands every chunk to a [`LogHandler`] and stores the cursor once the
//! handler accepts it.
//!
//! Reorgs are detected two ways while live: the chain head moving below the
//! highest head seen, and the hash of the last scanned block changing. Either
//! rewinds the cursor and re-queries the window; logs that left the canonical
//! chain are reported as [`LogNotice::Retracted`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cursor::CursorStore;
use crate::error::{PipelineError, Result};
use crate::eth::EthClient;
use crate::events::{DecodeWarning, EventFilter, LogDecode, LogEvent, LogKey};

/// Scanning parameters of one subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    /// First block scanned when the cursor store is empty
    pub start_block: u64,
    /// Blocks per `eth_getLogs` request
    pub chunk_size: u64,
    pub poll_interval: Duration,
    /// Blocks kept between the head and the highest scanned block
    pub confirmations: u64,
    /// How far below the new head the cursor is moved on a reorg
    pub reorg_rewind_blocks: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            chunk_size: 1000,
            poll_interval: Duration::from_millis(4000),
            confirmations: 0,
            reorg_rewind_blocks: 12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Catching up on `[from, to]`, `to` fixed at start
    Backfilling { from: u64, to: u64 },
    /// Following the head; `next_block` is the first unscanned block
    Live { next_block: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Backfill,
    Live,
}

/// Change to the set of delivered events
#[derive(Debug, Clone, PartialEq)]
pub enum LogNotice {
    Delivered(LogEvent),
    /// A previously delivered event is no longer on the canonical chain
    Retracted(LogEvent),
}

impl LogNotice {
    pub fn event(&self) -> &LogEvent {
        match self {
            LogNotice::Delivered(event) | LogNotice::Retracted(event) => event,
        }
    }

    pub fn key(&self) -> LogKey {
        self.event().key()
    }
}

/// Everything found in one block range
#[derive(Debug, Clone, PartialEq)]
pub struct LogBatch {
    pub phase: BatchPhase,
    pub from_block: u64,
    pub to_block: u64,
    pub notices: Vec<LogNotice>,
    pub warnings: Vec<DecodeWarning>,
}

impl LogBatch {
    pub fn is_empty(&self) -> bool {
        self.notices.is_empty() && self.warnings.is_empty()
    }
}

/// Consumer of log batches.
///
/// Returning an error leaves the cursor where it was; the same range is
/// fetched and offered again after the poll interval.
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn handle(&mut self, batch: &LogBatch) -> Result<()>;
}

#[async_trait]
impl LogHandler for mpsc::Sender<LogBatch> {
    async fn handle(&mut self, batch: &LogBatch) -> Result<()> {
        self.send(batch.clone())
            .await
            .map_err(|_| PipelineError::Handler("batch receiver dropped".to_string()))
    }
}

/// Every copy of one log key seen in a range
#[derive(Default)]
struct Sighting {
    canonical: Option<LogEvent>,
    removed: Option<LogEvent>,
}

enum RangeOutcome {
    Committed,
    HandlerFailed,
    Cancelled,
}

/// Run `fut` unless `cancel` fires first
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

pub struct EventSubscriber<S, H> {
    client: EthClient,
    filter: EventFilter,
    config: SubscriptionConfig,
    store: S,
    handler: H,
    state: Option<SubscriptionState>,
    highest_head: u64,
    /// Last scanned block and its hash while live
    tip: Option<(u64, B256)>,
    delivered: HashMap<LogKey, LogEvent>,
    /// Delivered keys inside a rewound window, not yet seen again
    unconfirmed: BTreeSet<LogKey>,
}

impl<S: CursorStore, H: LogHandler> EventSubscriber<S, H> {
    pub fn new(
        client: EthClient,
        filter: EventFilter,
        config: SubscriptionConfig,
        store: S,
        handler: H,
    ) -> Self {
        Self {
            client,
            filter,
            config,
            store,
            handler,
            state: None,
            highest_head: 0,
            tip: None,
            delivered: HashMap::new(),
            unconfirmed: BTreeSet::new(),
        }
    }

    /// Current phase; `None` before `run` has read the chain head
    pub fn state(&self) -> Option<SubscriptionState> {
        self.state
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn chunk_end(&self, from: u64, limit: u64) -> u64 {
        from.saturating_add(self.config.chunk_size.max(1) - 1).min(limit)
    }

    /// Scan until cancelled.
    ///
    /// Returns `Ok(())` on cancellation; RPC and cursor store failures end
    /// the scan with an error.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(cursor) = until_cancelled(cancel, self.store.load()).await.transpose()? else {
            return Ok(());
        };
        let Some(head) = until_cancelled(cancel, self.client.block_number()).await.transpose()? else {
            return Ok(());
        };

        self.highest_head = head;
        let from = cursor.map_or(self.config.start_block, |c| c.saturating_add(1));
        let to = head.saturating_sub(self.config.confirmations);
        info!(
            "Starting event subscription for {} from block {} (head {}, backfill target {}, chunk size {})",
            self.filter.address(),
            from,
            head,
            to,
            self.config.chunk_size
        );
        self.state = Some(SubscriptionState::Backfilling { from, to });

        loop {
            let Some(state) = self.state else {
                return Ok(());
            };
            if cancel.is_cancelled() {
                info!("Event subscription cancelled in state {:?}", state);
                return Ok(());
            }

            match state {
                SubscriptionState::Backfilling { from, to } => {
                    if from > to {
                        info!("Backfill complete up to block {}, switching to live polling", to);
                        self.state = Some(SubscriptionState::Live { next_block: from });
                        continue;
                    }

                    let end = self.chunk_end(from, to);
                    match self.process_range(BatchPhase::Backfill, from, end, cancel).await? {
                        RangeOutcome::Committed => {
                            self.state = Some(SubscriptionState::Backfilling { from: end + 1, to });
                        }
                        RangeOutcome::HandlerFailed => {
                            if self.pause(cancel).await {
                                return Ok(());
                            }
                        }
                        RangeOutcome::Cancelled => return Ok(()),
                    }
                }
                SubscriptionState::Live { next_block } => {
                    let Some(head) = until_cancelled(cancel, self.client.block_number()).await.transpose()? else {
                        return Ok(());
                    };
                    let next_block = self.observe_head(head, next_block).await?;
                    self.state = Some(SubscriptionState::Live { next_block });
                    let Some(next_block) = until_cancelled(cancel, self.check_tip(next_block)).await.transpose()? else {
                        return Ok(());
                    };
                    self.state = Some(SubscriptionState::Live { next_block });

                    let safe_head = head.saturating_sub(self.config.confirmations);
                    if next_block > safe_head {
                        if self.pause(cancel).await {
                            return Ok(());
                        }
                        continue;
                    }

                    let end = self.chunk_end(next_block, safe_head);
                    match self.process_range(BatchPhase::Live, next_block, end, cancel).await? {
                        RangeOutcome::Committed => {
                            self.state = Some(SubscriptionState::Live { next_block: end + 1 });
                            if until_cancelled(cancel, self.record_tip(end)).await.transpose()?.is_none() {
                                return Ok(());
                            }
                            if end == safe_head && self.pause(cancel).await {
                                return Ok(());
                            }
                        }
                        RangeOutcome::HandlerFailed => {
                            if self.pause(cancel).await {
                                return Ok(());
                            }
                        }
                        RangeOutcome::Cancelled => return Ok(()),
                    }
                }
            }
        }
    }

    /// Sleep for the poll interval; `true` if cancelled meanwhile
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        until_cancelled(cancel, tokio::time::sleep(self.config.poll_interval))
            .await
            .is_none()
    }

    /// Track the highest head and rewind when the chain moved backwards
    async fn observe_head(&mut self, head: u64, next_block: u64) -> Result<u64> {
        if head >= self.highest_head {
            self.highest_head = head;
            return Ok(next_block);
        }

        warn!("Chain head moved back from {} to {}", self.highest_head, head);
        self.highest_head = head;
        self.rewind(head, next_block).await
    }

    /// Rewind when the last scanned block is no longer canonical
    async fn check_tip(&mut self, next_block: u64) -> Result<u64> {
        let Some((number, hash)) = self.tip else {
            if let Some(last) = next_block.checked_sub(1) {
                self.record_tip(last).await?;
            }
            return Ok(next_block);
        };

        let current = self.client.get_block_hash(number).await?;
        if current == Some(hash) {
            return Ok(next_block);
        }

        match current {
            Some(current) => warn!("Block {} hash changed from {} to {}", number, hash, current),
            None => warn!("Block {} ({}) is no longer served by the node", number, hash),
        }
        self.rewind(number, next_block).await
    }

    async fn record_tip(&mut self, block: u64) -> Result<()> {
        self.tip = self
            .client
            .get_block_hash(block)
            .await?
            .map(|hash| (block, hash));
        Ok(())
    }

    /// Move the scan back so that `reorg_rewind_blocks` blocks up to `anchor`
    /// are queried again
    async fn rewind(&mut self, anchor: u64, next_block: u64) -> Result<u64> {
        self.tip = None;
        let rewound = anchor
            .checked_sub(self.config.reorg_rewind_blocks)
            .map_or(0, |keep| keep + 1)
            .max(self.config.start_block);
        if rewound >= next_block {
            return Ok(next_block);
        }
        warn!("Rewinding from block {} to {}", next_block, rewound);

        self.unconfirmed.extend(
            self.delivered
                .values()
                .filter(|event| event.block_number >= rewound)
                .map(LogEvent::key),
        );
        match rewound.checked_sub(1) {
            Some(cursor) => self.store.store(cursor).await?,
            None => self.store.clear().await?,
        }
        Ok(rewound)
    }

    async fn process_range(
        &mut self,
        phase: BatchPhase,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome> {
        let params = self.filter.to_filter_params(from, to);
        let Some(raw_logs) = until_cancelled(cancel, self.client.get_logs(&params)).await.transpose()? else {
            return Ok(RangeOutcome::Cancelled);
        };

        let batch = self.assemble(phase, from, to, raw_logs);

        if !batch.is_empty() {
            match until_cancelled(cancel, self.handler.handle(&batch)).await {
                None => return Ok(RangeOutcome::Cancelled),
                Some(Err(e)) => {
                    warn!(
                        "Log handler failed for blocks {}..={}, will retry: {}",
                        from, to, e
                    );
                    return Ok(RangeOutcome::HandlerFailed);
                }
                Some(Ok(())) => {}
            }
        }

        self.store.store(to).await?;
        self.commit(&batch);

        let retracted = batch
            .notices
            .iter()
            .filter(|n| matches!(n, LogNotice::Retracted(_)))
            .count();
        if batch.is_empty() {
            debug!("{:?} blocks {}..={}: no events", phase, from, to);
        } else {
            info!(
                "{:?} blocks {}..={}: {} delivered, {} retracted, {} undecodable",
                phase,
                from,
                to,
                batch.notices.len() - retracted,
                retracted,
                batch.warnings.len()
            );
        }
        Ok(RangeOutcome::Committed)
    }

    fn assemble(&self, phase: BatchPhase, from: u64, to: u64, raw_logs: Vec<Value>) -> LogBatch {
        let mut notices = Vec::new();
        let mut warnings = Vec::new();
        let mut order = Vec::new();
        let mut sightings: HashMap<LogKey, Sighting> = HashMap::new();

        for raw in raw_logs {
            let event = match self.filter.decode(raw) {
                LogDecode::Decoded(event) => event,
                LogDecode::Ignored => continue,
                LogDecode::Warning(warning) => {
                    warn!("Skipping log: {}", warning);
                    warnings.push(warning);
                    continue;
                }
            };
            let key = event.key();

            let sighting = sightings.entry(key).or_insert_with(|| {
                order.push(key);
                Sighting::default()
            });
            if event.removed {
                sighting.removed.get_or_insert(event);
            } else if sighting.canonical.is_some() {
                debug!("Duplicate log {} in blocks {}..={}", key, from, to);
            } else {
                sighting.canonical = Some(event);
            }
        }

        // a canonical copy outweighs any removed copy of the same key
        let mut seen = HashSet::new();
        let mut retracted = HashSet::new();
        for key in order {
            let Some(sighting) = sightings.remove(&key) else {
                continue;
            };
            let previous = self.delivered.get(&key);

            match (sighting.canonical, sighting.removed) {
                (Some(event), _) => {
                    seen.insert(key);
                    match previous {
                        None => notices.push(LogNotice::Delivered(event)),
                        Some(previous) if previous.block_hash == event.block_hash => {
                            debug!("Log {} already delivered", key);
                        }
                        Some(previous) => {
                            debug!(
                                "Log {} moved from block {} to {}",
                                key, previous.block_number, event.block_number
                            );
                            let mut stale = previous.clone();
                            stale.removed = true;
                            retracted.insert(key);
                            notices.push(LogNotice::Retracted(stale));
                            notices.push(LogNotice::Delivered(event));
                        }
                    }
                }
                (None, Some(event)) if previous.is_some() => {
                    retracted.insert(key);
                    notices.push(LogNotice::Retracted(event));
                }
                (None, _) => debug!("Dropping removed log {} that was never delivered", key),
            }
        }

        for key in &self.unconfirmed {
            let Some(event) = self.delivered.get(key) else {
                continue;
            };
            if (from..=to).contains(&event.block_number)
                && !seen.contains(key)
                && !retracted.contains(key)
            {
                let mut event = event.clone();
                event.removed = true;
                notices.push(LogNotice::Retracted(event));
            }
        }

        LogBatch {
            phase,
            from_block: from,
            to_block: to,
            notices,
            warnings,
        }
    }

    fn commit(&mut self, batch: &LogBatch) {
        for notice in &batch.notices {
            match notice {
                LogNotice::Delivered(event) => {
                    self.delivered.insert(event.key(), event.clone());
                }
                LogNotice::Retracted(event) => {
                    self.delivered.remove(&event.key());
                }
            }
        }

        let to = batch.to_block;
        let delivered = &self.delivered;
        self.unconfirmed
            .retain(|key| delivered.get(key).is_some_and(|event| event.block_number > to));

        let floor = to.saturating_sub(self.config.reorg_rewind_blocks);
        self.delivered.retain(|_, event| event.block_number >= floor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use crate::testing::{node_error, ScriptedTransport};
    use alloy_primitives::{Address, LogData, B256, U256};
    use alloy_sol_types::{sol, SolEvent};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::task::JoinHandle;

    sol! {
        event Buy(address indexed owner, address indexed spender, uint256 value);
        event List(address indexed from, address indexed to, uint256 value);
    }

    const BUY: &str = "event Buy(address indexed owner, address indexed spender, uint256 value)";
    const LIST: &str = "event List(address indexed from, address indexed to, uint256 value)";

    fn market() -> Address {
        Address::repeat_byte(0x94)
    }

    fn log_json(data: &LogData, block: u64, tx: u8, log_index: u64, removed: bool) -> Value {
        json!({
            "address": market(),
            "topics": data.topics(),
            "data": data.data,
            "blockNumber": format!("{:#x}", block),
            "blockHash": B256::with_last_byte(block as u8),
            "transactionHash": B256::repeat_byte(tx),
            "transactionIndex": "0x0",
            "logIndex": format!("{:#x}", log_index),
            "removed": removed
        })
    }

    fn buy(value: u64) -> LogData {
        Buy {
            owner: Address::repeat_byte(0x01),
            spender: Address::repeat_byte(0x02),
            value: U256::from(value),
        }
        .encode_log_data()
    }

    fn list(value: u64) -> LogData {
        List {
            from: Address::repeat_byte(0x03),
            to: market(),
            value: U256::from(value),
        }
        .encode_log_data()
    }

    fn hex_param(value: &Value) -> u64 {
        let digits = value.as_str().unwrap().trim_start_matches("0x");
        u64::from_str_radix(digits, 16).unwrap()
    }

    #[derive(Default)]
    struct Chain {
        head: u64,
        logs: Vec<Value>,
        /// Bumped to give every block a new hash
        fork: u8,
        logs_unavailable: bool,
    }

    fn block_hash(number: u64, fork: u8) -> B256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&number.to_be_bytes());
        bytes[31] = fork;
        B256::from(bytes)
    }

    /// Transport serving `eth_blockNumber`, `eth_getBlockByNumber` and
    /// `eth_getLogs` from shared state
    fn chain_transport(chain: Arc<Mutex<Chain>>) -> Arc<ScriptedTransport> {
        let transport = ScriptedTransport::new();
        let heads = chain.clone();
        transport.respond("eth_blockNumber", move |_| {
            Ok(json!(format!("{:#x}", heads.lock().unwrap().head)))
        });
        let blocks = chain.clone();
        transport.respond("eth_getBlockByNumber", move |params| {
            let number = hex_param(&params[0]);
            let chain = blocks.lock().unwrap();
            if number > chain.head {
                return Ok(Value::Null);
            }
            Ok(json!({
                "number": format!("{:#x}", number),
                "hash": block_hash(number, chain.fork),
            }))
        });
        transport.respond("eth_getLogs", move |params| {
            let from = hex_param(&params[0]["fromBlock"]);
            let to = hex_param(&params[0]["toBlock"]);
            let chain = chain.lock().unwrap();
            if chain.logs_unavailable {
                return Err(node_error("eth_getLogs", -32000, "header not found"));
            }
            let logs: Vec<Value> = chain
                .logs
                .iter()
                .filter(|log| (from..=to).contains(&hex_param(&log["blockNumber"])))
                .cloned()
                .collect();
            Ok(Value::Array(logs))
        });
        transport
    }

    #[derive(Clone, Default)]
    struct Recorder {
        batches: Arc<Mutex<Vec<LogBatch>>>,
        failures_left: Arc<Mutex<usize>>,
        attempts: Arc<Mutex<Vec<(u64, u64)>>>,
    }

    #[async_trait]
    impl LogHandler for Recorder {
        async fn handle(&mut self, batch: &LogBatch) -> Result<()> {
            self.attempts.lock().unwrap().push((batch.from_block, batch.to_block));
            let mut failures = self.failures_left.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PipelineError::Handler("database unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(())
        }
    }

    impl Recorder {
        fn notices(&self) -> Vec<LogNotice> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| b.notices.clone())
                .collect()
        }
    }

    fn config(chunk_size: u64) -> SubscriptionConfig {
        SubscriptionConfig {
            start_block: 0,
            chunk_size,
            poll_interval: Duration::from_millis(10),
            confirmations: 0,
            reorg_rewind_blocks: 12,
        }
    }

    fn spawn_subscriber<H: LogHandler + 'static>(
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryCursorStore>,
        config: SubscriptionConfig,
        handler: H,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let filter = EventFilter::from_declarations(market(), &[LIST, BUY]).unwrap();
        let mut subscriber =
            EventSubscriber::new(EthClient::new(transport), filter, config, store, handler);
        tokio::spawn(async move { subscriber.run(&cancel).await })
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_cursor(store: &MemoryCursorStore, block: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.load().await.unwrap() != Some(block) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("cursor did not reach the expected block");
    }

    #[tokio::test]
    async fn test_backfill_delivers_each_key_once() {
        let replayed = log_json(&buy(10), 3, 0xa1, 0, false);
        let chain = Arc::new(Mutex::new(Chain {
            head: 10,
            logs: vec![
                replayed.clone(),
                replayed,
                log_json(&list(20), 7, 0xa2, 1, false),
            ],
            ..Default::default()
        }));
        let transport = chain_transport(chain);
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport.clone(), store.clone(), config(4), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 10).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let notices = recorder.notices();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|n| matches!(n, LogNotice::Delivered(_))));
        assert_eq!(notices[0].event().event_name, "Buy");
        assert_eq!(notices[1].event().event_name, "List");

        let ranges: Vec<(u64, u64)> = transport
            .calls("eth_getLogs")
            .iter()
            .take(3)
            .map(|p| (hex_param(&p[0]["fromBlock"]), hex_param(&p[0]["toBlock"])))
            .collect();
        assert_eq!(ranges, vec![(0, 3), (4, 7), (8, 10)]);

        let batches = recorder.batches.lock().unwrap();
        assert!(batches.iter().all(|b| b.phase == BatchPhase::Backfill));
    }

    #[tokio::test]
    async fn test_resumes_after_stored_cursor_and_respects_confirmations() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 20,
            ..Default::default()
        }));
        let transport = chain_transport(chain);
        let store = Arc::new(MemoryCursorStore::starting_at(5));
        let cancel = CancellationToken::new();
        let mut cfg = config(100);
        cfg.confirmations = 3;

        let task = spawn_subscriber(transport.clone(), store.clone(), cfg, Recorder::default(), cancel.clone());
        wait_for_cursor(&store, 17).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let calls = transport.calls("eth_getLogs");
        assert_eq!(hex_param(&calls[0][0]["fromBlock"]), 6);
        assert!(calls.iter().all(|p| hex_param(&p[0]["toBlock"]) <= 17));
    }

    #[tokio::test]
    async fn test_live_phase_picks_up_new_blocks() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 5,
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport, store.clone(), config(50), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 5).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.logs.push(log_json(&buy(1), 8, 0xb1, 0, false));
            chain.head = 9;
        }
        wait_for_cursor(&store, 9).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].phase, BatchPhase::Live);
        assert_eq!(batches[0].notices[0].event().block_number, 8);
    }

    #[tokio::test]
    async fn test_removed_log_retracts_delivered_key() {
        let original = log_json(&buy(10), 8, 0xc1, 2, false);
        let chain = Arc::new(Mutex::new(Chain {
            head: 10,
            logs: vec![original],
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport, store.clone(), config(100), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 10).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.head = 9;
            chain.logs = vec![
                log_json(&buy(10), 8, 0xc1, 2, true),
                log_json(&buy(11), 8, 0xc2, 0, false),
                log_json(&buy(99), 7, 0xc3, 0, true),
            ];
        }
        let watched = recorder.clone();
        wait_until(move || watched.notices().len() >= 3).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let notices = recorder.notices();
        assert_eq!(notices.len(), 3);
        let retracted = LogKey {
            transaction_hash: B256::repeat_byte(0xc1),
            log_index: 2,
        };
        assert!(matches!(&notices[0], LogNotice::Delivered(e) if e.key() == retracted));
        assert!(matches!(&notices[1], LogNotice::Retracted(e) if e.key() == retracted));
        assert!(matches!(&notices[2], LogNotice::Delivered(e) if e.transaction_hash == B256::repeat_byte(0xc2)));
    }

    #[tokio::test]
    async fn test_vanished_log_is_retracted_after_rewind() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 30,
            logs: vec![log_json(&list(5), 28, 0xd1, 0, false)],
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        let mut cfg = config(100);
        cfg.reorg_rewind_blocks = 4;

        let task = spawn_subscriber(transport, store.clone(), cfg, recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 30).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.head = 29;
            chain.logs.clear();
        }
        let watched = recorder.clone();
        wait_until(move || watched.notices().len() >= 2).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let notices = recorder.notices();
        assert!(matches!(&notices[1], LogNotice::Retracted(e) if e.transaction_hash == B256::repeat_byte(0xd1) && e.removed));

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches[1].from_block, 26);
    }

    #[tokio::test]
    async fn test_handler_failure_retries_same_range() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 4,
            logs: vec![log_json(&buy(1), 2, 0xe1, 0, false)],
            ..Default::default()
        }));
        let transport = chain_transport(chain);
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        *recorder.failures_left.lock().unwrap() = 2;
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport, store.clone(), config(100), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 4).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let attempts = recorder.attempts.lock().unwrap().clone();
        assert_eq!(attempts[..3].to_vec(), vec![(0u64, 4u64); 3]);
        assert_eq!(recorder.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_log_becomes_warning() {
        let mut malformed = log_json(&buy(1), 1, 0xf1, 0, false);
        malformed["data"] = json!("0x1234");
        let chain = Arc::new(Mutex::new(Chain {
            head: 2,
            logs: vec![malformed, log_json(&list(2), 2, 0xf2, 0, false)],
            ..Default::default()
        }));
        let transport = chain_transport(chain);
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport, store.clone(), config(100), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 2).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches[0].warnings.len(), 1);
        assert_eq!(batches[0].warnings[0].event_name.as_deref(), Some("Buy"));
        assert_eq!(batches[0].notices.len(), 1);
    }

    #[tokio::test]
    async fn test_rpc_error_ends_subscription() {
        let transport = ScriptedTransport::new();
        transport.push("eth_blockNumber", json!("0x10"));
        transport.push_err("eth_getLogs", node_error("eth_getLogs", -32602, "invalid block range"));
        let store = Arc::new(MemoryCursorStore::new());

        let task = spawn_subscriber(transport, store.clone(), config(100), Recorder::default(), CancellationToken::new());
        let err = task.await.unwrap().unwrap_err();

        assert_eq!(err.rpc_code(), Some(-32602));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_returns_ok() {
        let transport = ScriptedTransport::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let task = spawn_subscriber(
            transport.clone(),
            Arc::new(MemoryCursorStore::new()),
            config(100),
            Recorder::default(),
            cancel,
        );
        task.await.unwrap().unwrap();
        assert!(transport.calls("eth_getLogs").is_empty());
    }

    #[tokio::test]
    async fn test_channel_handler_forwards_batches() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 3,
            logs: vec![log_json(&buy(3), 1, 0x11, 0, false)],
            ..Default::default()
        }));
        let (sender, mut receiver) = mpsc::channel(8);
        let store = Arc::new(MemoryCursorStore::new());
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(chain_transport(chain), store.clone(), config(100), sender, cancel.clone());
        let batch = receiver.recv().await.unwrap();
        wait_for_cursor(&store, 3).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!((batch.from_block, batch.to_block), (0, 3));
        assert_eq!(batch.notices[0].event().arg("value"), Some(&alloy_dyn_abi::DynSolValue::Uint(U256::from(3u64), 256)));
    }

    #[tokio::test]
    async fn test_rewind_to_first_block_clears_cursor() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 10,
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());

        let task = spawn_subscriber(transport, store.clone(), config(100), Recorder::default(), CancellationToken::new());
        wait_for_cursor(&store, 10).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.head = 9;
            chain.logs_unavailable = true;
        }
        let err = task.await.unwrap().unwrap_err();

        assert_eq!(err.rpc_code(), Some(-32000));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_canonical_copy_outweighs_removed_copy() {
        for removed_first in [true, false] {
            let chain = Arc::new(Mutex::new(Chain {
                head: 10,
                logs: vec![log_json(&buy(7), 8, 0x71, 0, false)],
                ..Default::default()
            }));
            let transport = chain_transport(chain.clone());
            let store = Arc::new(MemoryCursorStore::new());
            let recorder = Recorder::default();
            let cancel = CancellationToken::new();

            let task = spawn_subscriber(transport, store.clone(), config(100), recorder.clone(), cancel.clone());
            wait_for_cursor(&store, 10).await;

            {
                let mut chain = chain.lock().unwrap();
                let mut copies = vec![
                    log_json(&buy(7), 8, 0x71, 0, true),
                    log_json(&buy(7), 8, 0x71, 0, false),
                ];
                if !removed_first {
                    copies.reverse();
                }
                copies.push(log_json(&list(8), 9, 0x72, 0, false));
                chain.head = 9;
                chain.logs = copies;
            }
            let watched = recorder.clone();
            wait_until(move || watched.notices().len() >= 2).await;
            cancel.cancel();
            task.await.unwrap().unwrap();

            let notices = recorder.notices();
            assert_eq!(notices.len(), 2, "removed copy first: {}", removed_first);
            assert!(notices.iter().all(|n| matches!(n, LogNotice::Delivered(_))));
            assert_eq!(notices[1].event().transaction_hash, B256::repeat_byte(0x72));
        }
    }

    #[tokio::test]
    async fn test_relocated_log_is_retracted_and_redelivered() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 10,
            logs: vec![log_json(&buy(4), 8, 0x73, 1, false)],
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();

        let task = spawn_subscriber(transport, store.clone(), config(100), recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 10).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.head = 9;
            chain.logs = vec![
                log_json(&buy(4), 9, 0x73, 1, false),
                log_json(&buy(4), 8, 0x73, 1, true),
            ];
        }
        let watched = recorder.clone();
        wait_until(move || watched.notices().len() >= 3).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let notices = recorder.notices();
        assert_eq!(notices.len(), 3);
        assert!(matches!(&notices[0], LogNotice::Delivered(e) if e.block_number == 8));
        assert!(matches!(&notices[1], LogNotice::Retracted(e) if e.block_number == 8 && e.removed));
        assert!(matches!(&notices[2], LogNotice::Delivered(e) if e.block_number == 9 && !e.removed));
        assert!(notices.iter().all(|n| n.key() == notices[0].key()));
    }

    #[tokio::test]
    async fn test_same_height_fork_is_detected_by_block_hash() {
        let chain = Arc::new(Mutex::new(Chain {
            head: 10,
            logs: vec![log_json(&list(5), 9, 0x81, 0, false)],
            ..Default::default()
        }));
        let transport = chain_transport(chain.clone());
        let store = Arc::new(MemoryCursorStore::new());
        let recorder = Recorder::default();
        let cancel = CancellationToken::new();
        let mut cfg = config(100);
        cfg.reorg_rewind_blocks = 3;

        let task = spawn_subscriber(transport.clone(), store.clone(), cfg, recorder.clone(), cancel.clone());
        wait_for_cursor(&store, 10).await;
        wait_until(|| !transport.calls("eth_getBlockByNumber").is_empty()).await;

        {
            let mut chain = chain.lock().unwrap();
            chain.fork = 1;
            chain.logs.clear();
        }
        let watched = recorder.clone();
        wait_until(move || watched.notices().len() >= 2).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let notices = recorder.notices();
        assert!(matches!(&notices[1], LogNotice::Retracted(e) if e.transaction_hash == B256::repeat_byte(0x81) && e.removed));

        let batches = recorder.batches.lock().unwrap();
        assert_eq!(batches[1].from_block, 8);
        assert_eq!(batches[1].phase, BatchPhase::Live);
    }
}
