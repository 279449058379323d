//! Source-chain watchers.
//!
//! Both chains share one polling state machine, parameterized over the
//! [`ChainWatcher`] capability set. The loop walks the finalized frontier
//! in bounded batches, emits events in `(block, index)` order, and only
//! advances the durable watermark after a batch has been fully handed to
//! the coordinator. Transient RPC failures back off exponentially and
//! surface as non-fatal faults after five attempts; the loop then retries
//! on the next poll tick.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chain::unit0::Unit0Client;
use crate::chain::waves::WavesClient;
use crate::coordinator::NodeEvent;
use crate::store::Store;
use crate::types::{ChainId, TransferEvent};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// Worth retrying with backoff: timeouts, resets, rate limits.
    #[error("transient: {0}")]
    Transient(String),
    /// Not worth retrying this round.
    #[error("{0}")]
    Permanent(String),
    #[error("watcher cancelled")]
    Cancelled,
}

/// What a source chain must offer to be watchable.
#[async_trait]
pub trait ChainWatcher: Send + Sync + 'static {
    fn chain(&self) -> ChainId;
    async fn height(&self) -> Result<u64, WatcherError>;
    /// Lock events for `[from, to]` inclusive, in `(block, index)` order.
    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, WatcherError>;
}

#[async_trait]
impl ChainWatcher for Unit0Client {
    fn chain(&self) -> ChainId {
        Unit0Client::chain(self)
    }

    async fn height(&self) -> Result<u64, WatcherError> {
        self.block_number().await.map_err(classify_unit0)
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, WatcherError> {
        self.lock_events(from, to).await.map_err(classify_unit0)
    }
}

fn classify_unit0(e: crate::chain::unit0::Unit0Error) -> WatcherError {
    if e.is_transient() {
        WatcherError::Transient(e.to_string())
    } else {
        WatcherError::Permanent(e.to_string())
    }
}

#[async_trait]
impl ChainWatcher for WavesClient {
    fn chain(&self) -> ChainId {
        WavesClient::chain(self)
    }

    async fn height(&self) -> Result<u64, WatcherError> {
        WavesClient::height(self).await.map_err(classify_waves)
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<TransferEvent>, WatcherError> {
        self.lock_events(from, to).await.map_err(classify_waves)
    }
}

fn classify_waves(e: crate::chain::waves::WavesError) -> WatcherError {
    if e.is_transient() {
        WatcherError::Transient(e.to_string())
    } else {
        WatcherError::Permanent(e.to_string())
    }
}

/// Per-chain polling parameters.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Blocks an event must be buried under before it is emitted.
    pub finality_depth: u64,
    /// Idle delay once the frontier is caught up.
    pub poll_interval: Duration,
    /// Largest block range fetched in one query.
    pub batch_cap: u64,
    /// Pause between consecutive batches while catching up.
    pub interbatch_delay: Duration,
    /// Blocks re-inspected when seeding a fresh watermark.
    pub lookback: u64,
}

impl WatcherConfig {
    pub fn for_waves(finality_depth: u64) -> Self {
        WatcherConfig {
            finality_depth,
            poll_interval: Duration::from_secs(5),
            batch_cap: 20,
            interbatch_delay: Duration::from_millis(200),
            lookback: 20,
        }
    }

    pub fn for_unit0(finality_depth: u64) -> Self {
        WatcherConfig {
            finality_depth,
            poll_interval: Duration::from_secs(5),
            batch_cap: 200,
            interbatch_delay: Duration::from_millis(200),
            lookback: 20,
        }
    }
}

/// Drive one chain's watcher until cancellation.
///
/// Every batch follows write-before-acknowledge: events reach the
/// coordinator queue first, then the watermark is persisted, so a crash
/// in between replays the batch and dedup absorbs it.
pub async fn run_watcher<W: ChainWatcher>(
    watcher: Arc<W>,
    config: WatcherConfig,
    store: Store,
    events: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    let chain = watcher.chain();
    tracing::info!(%chain, "Watcher starting");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match poll_round(watcher.as_ref(), &config, &store, &events, &cancel).await {
            Ok(()) => {}
            Err(RoundError::Cancelled) => break,
            Err(RoundError::Fault(detail)) => {
                tracing::warn!(%chain, %detail, "Watcher round failed; will retry next poll");
                let fault = NodeEvent::WatcherFault {
                    chain,
                    detail: detail.clone(),
                };
                if events.send(fault).await.is_err() {
                    break;
                }
            }
            Err(RoundError::Fatal(detail)) => {
                tracing::error!(%chain, %detail, "Watcher hit a fatal store failure");
                let _ = events.send(NodeEvent::Fatal(detail)).await;
                break;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
    tracing::info!(%chain, "Watcher stopped");
}

enum RoundError {
    Fault(String),
    Fatal(String),
    Cancelled,
}

async fn poll_round<W: ChainWatcher>(
    watcher: &W,
    config: &WatcherConfig,
    store: &Store,
    events: &mpsc::Sender<NodeEvent>,
    cancel: &CancellationToken,
) -> Result<(), RoundError> {
    let chain = watcher.chain();
    let namespace = chain.namespace();

    let head = retry(cancel, || watcher.height())
        .await
        .map_err(round_fault)?;
    let frontier = head.saturating_sub(config.finality_depth);

    let mut watermark = match store.get_watermark(namespace) {
        Ok(Some(height)) => height,
        Ok(None) => {
            // First start without an operator override: look back a little
            // behind the frontier so recent events are not missed.
            let seed = frontier.saturating_sub(config.lookback);
            store
                .force_watermark(namespace, seed)
                .map_err(|e| RoundError::Fatal(e.to_string()))?;
            seed
        }
        Err(e) => return Err(RoundError::Fatal(e.to_string())),
    };

    while watermark < frontier {
        if cancel.is_cancelled() {
            return Err(RoundError::Cancelled);
        }
        let batch_end = frontier.min(watermark + config.batch_cap);
        let batch = retry(cancel, || watcher.fetch_events(watermark + 1, batch_end))
            .await
            .map_err(round_fault)?;
        for event in batch {
            if events.send(NodeEvent::Observed(event)).await.is_err() {
                return Err(RoundError::Cancelled);
            }
        }
        store
            .advance_watermark(namespace, batch_end)
            .map_err(|e| RoundError::Fatal(e.to_string()))?;
        watermark = batch_end;
        tracing::debug!(%chain, watermark, frontier, "Watcher batch processed");
        if watermark < frontier {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RoundError::Cancelled),
                _ = tokio::time::sleep(config.interbatch_delay) => {}
            }
        }
    }
    Ok(())
}

fn round_fault(e: WatcherError) -> RoundError {
    match e {
        WatcherError::Cancelled => RoundError::Cancelled,
        other => RoundError::Fault(other.to_string()),
    }
}

/// Run `op`, backing off `RETRY_BASE * attempt` on transient failures, up
/// to `MAX_ATTEMPTS` tries.
async fn retry<T, F, Fut>(cancel: &CancellationToken, mut op: F) -> Result<T, WatcherError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WatcherError>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(WatcherError::Transient(reason)) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(WatcherError::Transient(reason));
                }
                let delay = RETRY_BASE * attempt;
                tracing::debug!(%reason, attempt, ?delay, "Transient chain error, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(WatcherError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TokenAmount, TokenKind, UnixMillis};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct MockChain {
        head: AtomicU64,
        blocks: Mutex<BTreeMap<u64, Vec<TransferEvent>>>,
        height_failures: AtomicU64,
    }

    impl MockChain {
        fn new(head: u64) -> Self {
            MockChain {
                head: AtomicU64::new(head),
                blocks: Mutex::new(BTreeMap::new()),
                height_failures: AtomicU64::new(0),
            }
        }

        fn put_event(&self, block: u64, id: &str) {
            let event = TransferEvent {
                transfer_id: id.to_string(),
                source: ChainId::Waves(b'W'),
                destination: ChainId::Unit0(88811),
                token: "WAVES".into(),
                amount: TokenAmount::from(1_000u64),
                sender: "3PSender".into(),
                recipient: "0xabcdabcdabcdabcdabcdabcdabcdabcdabcd0001".into(),
                kind: TokenKind::FungibleExternal,
                token_id: None,
                src_block: block,
                src_tx: id.to_string(),
                observed_at: UnixMillis(0),
            };
            self.blocks.lock().unwrap().entry(block).or_default().push(event);
        }
    }

    #[async_trait]
    impl ChainWatcher for MockChain {
        fn chain(&self) -> ChainId {
            ChainId::Waves(b'W')
        }

        async fn height(&self) -> Result<u64, WatcherError> {
            if self.height_failures.load(Ordering::SeqCst) > 0 {
                self.height_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(WatcherError::Transient("429 too many requests".into()));
            }
            Ok(self.head.load(Ordering::SeqCst))
        }

        async fn fetch_events(
            &self,
            from: u64,
            to: u64,
        ) -> Result<Vec<TransferEvent>, WatcherError> {
            let blocks = self.blocks.lock().unwrap();
            let mut out = Vec::new();
            for (_, events) in blocks.range(from..=to) {
                out.extend(events.iter().cloned());
            }
            Ok(out)
        }
    }

    fn fast_config(finality_depth: u64) -> WatcherConfig {
        WatcherConfig {
            finality_depth,
            poll_interval: Duration::from_millis(5),
            batch_cap: 10,
            interbatch_delay: Duration::from_millis(1),
            lookback: 5,
        }
    }

    async fn drain_observed(
        rx: &mut mpsc::Receiver<NodeEvent>,
        expected: usize,
    ) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while out.len() < expected {
            match tokio::time::timeout(Duration::from_secs(30), rx.recv()).await {
                Ok(Some(NodeEvent::Observed(event))) => out.push(event),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_watcher_emits_finalized_events_in_order() {
        let chain = Arc::new(MockChain::new(100));
        chain.put_event(92, "a");
        chain.put_event(93, "b");
        chain.put_event(93, "c");
        // Beyond the frontier at depth 5; must not be emitted.
        chain.put_event(98, "late");

        let store = Store::temporary();
        store.force_watermark("waves", 90).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            chain.clone(),
            fast_config(5),
            store.clone(),
            tx,
            cancel.clone(),
        ));

        let observed = drain_observed(&mut rx, 3).await;
        assert_eq!(
            observed.iter().map(|e| e.transfer_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_watermark("waves").unwrap(), Some(95));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_seeds_behind_frontier_on_first_start() {
        let chain = Arc::new(MockChain::new(1000));
        let store = Store::temporary();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            chain.clone(),
            fast_config(10),
            store.clone(),
            tx,
            cancel.clone(),
        ));

        // frontier = 990, seed = frontier - lookback = 985, catches up to 990.
        let _ = drain_observed(&mut rx, 0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_watermark("waves").unwrap(), Some(990));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_watcher_resumes_from_persisted_watermark() {
        let chain = Arc::new(MockChain::new(50));
        chain.put_event(10, "old");
        chain.put_event(42, "new");
        let store = Store::temporary();
        // Blocks up to 40 were handled in a previous life.
        store.force_watermark("waves", 40).unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            chain.clone(),
            fast_config(5),
            store.clone(),
            tx,
            cancel.clone(),
        ));

        let observed = drain_observed(&mut rx, 1).await;
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].transfer_id, "new");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_watermark("waves").unwrap(), Some(45));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let cancel = CancellationToken::new();
        let calls = AtomicU64::new(0);
        tokio::time::pause();
        let result: Result<(), WatcherError> = retry(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WatcherError::Transient("reset".into())) }
        })
        .await;
        assert!(matches!(result, Err(WatcherError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS as u64);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_permanent_errors() {
        let cancel = CancellationToken::new();
        let calls = AtomicU64::new(0);
        let result: Result<(), WatcherError> = retry(&cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WatcherError::Permanent("bad block".into())) }
        })
        .await;
        assert!(matches!(result, Err(WatcherError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_height_failures_recover_within_round() {
        let chain = Arc::new(MockChain::new(30));
        chain.put_event(20, "x");
        chain.height_failures.store(2, Ordering::SeqCst);
        let store = Store::temporary();
        store.force_watermark("waves", 19).unwrap();

        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(
            chain.clone(),
            fast_config(5),
            store.clone(),
            tx,
            cancel.clone(),
        ));

        let observed = drain_observed(&mut rx, 1).await;
        assert_eq!(observed.len(), 1);
        cancel.cancel();
        handle.await.unwrap();
    }
}
