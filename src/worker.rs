// =============================================================================
// Pair worker — one task per symbol driving its grid engine
// =============================================================================
//
// The worker loop is a single cooperative sequence: refresh market data,
// run one grid cycle with the latest coordinator action, report fills to the
// shared trade counter, persist the grid snapshot, then sleep until the next
// deadline. The stop signal is observed at the top of every cycle and during
// the sleep.
//
// Coordinator actions arrive through a single-slot watch mailbox: overwriting
// is allowed and only the latest unseen action is applied, so a slow worker
// never works through a backlog of stale actions.
//
// On ANY exit path the worker cancels its open orders.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::DataFeed;
use crate::grid::engine::{CycleInputs, GridEngine, GridState, TuneAction};
use crate::types::Position;

/// Snapshot of a worker's state, readable without blocking the worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub symbol: String,
    pub state: GridState,
    pub position: Position,
    pub grid_levels: usize,
    pub spacing_fraction: f64,
    pub direction_bias: i8,
    pub fills_total: u64,
    pub last_price: f64,
    pub realized_pnl: f64,
}

/// The supervisor's side of a running worker.
pub struct WorkerHandle {
    pub symbol: String,
    join: JoinHandle<()>,
    action_tx: watch::Sender<(u64, TuneAction)>,
    stop_tx: watch::Sender<bool>,
    stop_requested: Arc<AtomicBool>,
    flatten_requested: Arc<AtomicBool>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
}

impl WorkerHandle {
    /// Push the latest tuning action. Overwrites any unconsumed action.
    pub fn send_action(&self, action: TuneAction) {
        let seq = self.action_tx.borrow().0 + 1;
        let _ = self.action_tx.send((seq, action));
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(true);
    }

    /// Force the worker into flattening on its next cycle. The resulting
    /// exit is intentional, not a crash.
    pub fn request_flatten(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.flatten_requested.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.snapshot.read().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn stop_was_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.join.abort();
    }

    /// Await worker exit, bounded by `grace`. True when it exited in time.
    pub async fn join_within(&mut self, grace: Duration) -> bool {
        tokio::time::timeout(grace, &mut self.join).await.is_ok()
    }
}

pub struct PairWorker {
    engine: GridEngine,
    feed: Arc<DataFeed>,
    interval: Duration,
    state_dir: PathBuf,
    trade_counter: Arc<AtomicU64>,
    action_rx: watch::Receiver<(u64, TuneAction)>,
    stop_rx: watch::Receiver<bool>,
    flatten_requested: Arc<AtomicBool>,
    snapshot_out: Arc<RwLock<WorkerSnapshot>>,
    last_action_seq: u64,
    reported_fills: u64,
}

impl PairWorker {
    /// Spawn the worker task and hand back its handle.
    pub fn spawn(
        engine: GridEngine,
        feed: Arc<DataFeed>,
        interval: Duration,
        state_dir: PathBuf,
        trade_counter: Arc<AtomicU64>,
    ) -> WorkerHandle {
        let symbol = engine.symbol().to_string();
        let (action_tx, action_rx) = watch::channel((0u64, TuneAction::Hold));
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let flatten_requested = Arc::new(AtomicBool::new(false));

        let snapshot = Arc::new(RwLock::new(WorkerSnapshot {
            symbol: symbol.clone(),
            state: engine.state(),
            position: engine.position().clone(),
            grid_levels: engine.parameters().0,
            spacing_fraction: engine.parameters().1,
            direction_bias: engine.parameters().2,
            fills_total: engine.fills_total(),
            last_price: 0.0,
            realized_pnl: 0.0,
        }));

        let worker = PairWorker {
            engine,
            feed,
            interval,
            state_dir,
            trade_counter,
            action_rx,
            stop_rx,
            flatten_requested: flatten_requested.clone(),
            snapshot_out: snapshot.clone(),
            last_action_seq: 0,
            reported_fills: 0,
        };

        let join = tokio::spawn(worker.run());

        WorkerHandle {
            symbol,
            join,
            action_tx,
            stop_tx,
            stop_requested,
            flatten_requested,
            snapshot,
        }
    }

    async fn run(mut self) {
        let symbol = self.engine.symbol().to_string();
        info!(symbol = %symbol, interval = ?self.interval, "pair worker started");

        loop {
            if *self.stop_rx.borrow() {
                break;
            }
            if self.flatten_requested.swap(false, Ordering::SeqCst) {
                self.engine.request_flatten();
            }

            let deadline = tokio::time::Instant::now() + self.interval;

            match self.feed.refresh_symbol(&symbol).await {
                Ok(refresh) => {
                    let inputs = CycleInputs {
                        mark: refresh.ticker.last_price,
                        klines: refresh.klines,
                        timestamp_ms: chrono::Utc::now().timestamp_millis(),
                    };

                    let action = self.take_action();
                    match self.engine.run_cycle(&inputs, action).await {
                        Ok(report) => {
                            if report.fills > 0 || report.placed > 0 || report.cancelled > 0 {
                                debug!(
                                    symbol = %symbol,
                                    fills = report.fills,
                                    placed = report.placed,
                                    cancelled = report.cancelled,
                                    "worker cycle"
                                );
                            }
                        }
                        // The cycle aborts, the worker loop continues.
                        Err(e) => warn!(symbol = %symbol, error = %e, "worker cycle aborted"),
                    }

                    self.report_fills();
                    self.persist(inputs.timestamp_ms);
                    self.publish(inputs.mark);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "market refresh failed, skipping cycle");
                }
            }

            if self.engine.state() == GridState::Halted {
                warn!(symbol = %symbol, reason = ?self.engine.halt_reason(), "engine halted, worker exiting");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.stop_rx.changed() => {}
            }
        }

        self.shutdown().await;
        info!(symbol = %symbol, "pair worker stopped");
    }

    /// Consume the mailbox: only an action newer than the last seen one is
    /// applied, everything older was overwritten (latest wins).
    fn take_action(&mut self) -> TuneAction {
        let (seq, action) = *self.action_rx.borrow();
        if seq > self.last_action_seq {
            self.last_action_seq = seq;
            action
        } else {
            TuneAction::Hold
        }
    }

    /// Report newly observed fills into the shared retraining counter.
    fn report_fills(&mut self) {
        let fills = self.engine.fills_total();
        let delta = fills.saturating_sub(self.reported_fills);
        if delta > 0 {
            self.trade_counter.fetch_add(delta, Ordering::SeqCst);
            self.reported_fills = fills;
        }
    }

    fn persist(&self, timestamp_ms: i64) {
        if let Err(e) = self.engine.snapshot(timestamp_ms).save(&self.state_dir) {
            warn!(symbol = %self.engine.symbol(), error = %e, "failed to persist grid snapshot");
        }
    }

    fn publish(&self, mark: f64) {
        let (levels, spacing, bias) = self.engine.parameters();
        *self.snapshot_out.write() = WorkerSnapshot {
            symbol: self.engine.symbol().to_string(),
            state: self.engine.state(),
            position: self.engine.position().clone(),
            grid_levels: levels,
            spacing_fraction: spacing,
            direction_bias: bias,
            fills_total: self.engine.fills_total(),
            last_price: mark,
            realized_pnl: self.engine.journal().realized_pnl(),
        };
    }

    /// Exit path: cancel open orders regardless of how the loop ended.
    async fn shutdown(&mut self) {
        let last_price = self.snapshot_out.read().last_price;
        if self.engine.state() != GridState::Halted {
            let inputs = CycleInputs {
                mark: last_price,
                klines: Vec::new(),
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            };
            if let Err(e) = self.engine.flatten(false, &inputs).await {
                warn!(symbol = %self.engine.symbol(), error = %e, "order cancellation on exit failed");
            }
        } else if !self.engine.live_order_ids().is_empty() {
            // Halted with orders still resting (e.g. repeated cycle failure):
            // one last cancellation attempt.
            for _ in 0..3 {
                if self.engine.live_order_ids().is_empty() {
                    break;
                }
                let inputs = CycleInputs::default();
                if self.engine.flatten(false, &inputs).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        self.persist(chrono::Utc::now().timestamp_millis());
        self.publish(last_price);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::capital::manager::Allocation;
    use crate::config::{CacheTtls, GridConfig};
    use crate::data::MarketCache;
    use crate::exchange::{Exchange, PaperExchange, SymbolMeta};
    use crate::types::Venue;

    fn meta() -> SymbolMeta {
        SymbolMeta {
            symbol: "ETHUSDT".to_string(),
            venue: Venue::Derivatives,
            base_asset: "ETH".to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            max_qty: 10_000.0,
            min_notional: 5.0,
            price_precision: 2,
            qty_precision: 3,
            max_leverage: 20,
        }
    }

    fn allocation() -> Allocation {
        Allocation {
            symbol: "ETHUSDT".to_string(),
            venue: Venue::Derivatives,
            allocated_usd: 100.0,
            max_position_usd: 40.0,
            grid_levels: 4,
            spacing_fraction: 0.005,
            leverage: 10,
        }
    }

    fn cfg() -> GridConfig {
        let mut cfg = GridConfig::default();
        cfg.use_dynamic_spacing = false;
        cfg.min_levels = 2;
        cfg
    }

    struct Fixture {
        handle: WorkerHandle,
        exchange: Arc<Exchange>,
        counter: Arc<AtomicU64>,
        _dir: tempfile::TempDir,
    }

    async fn spawn_worker() -> Fixture {
        let paper = PaperExchange::new();
        paper.register_symbol(meta());
        paper.deposit(Venue::Derivatives, 1_000.0);
        paper.set_mark_price("ETHUSDT", 2_000.0);
        let exchange = Arc::new(Exchange::Paper(paper));

        let cache = Arc::new(MarketCache::new(CacheTtls {
            tickers_secs: 0, // always refetch so mark moves are visible
            klines_secs: 0,
            positions_secs: 0,
            balances_secs: 0,
        }));
        let feed = Arc::new(DataFeed::new(
            exchange.clone(),
            cache,
            Duration::from_millis(50),
        ));

        let engine = GridEngine::new(allocation(), meta(), cfg(), exchange.clone());
        let counter = Arc::new(AtomicU64::new(0));
        let dir = tempfile::tempdir().unwrap();

        let handle = PairWorker::spawn(
            engine,
            feed,
            Duration::from_millis(20),
            dir.path().to_path_buf(),
            counter.clone(),
        );

        Fixture {
            handle,
            exchange,
            counter,
            _dir: dir,
        }
    }

    fn paper(exchange: &Arc<Exchange>) -> &PaperExchange {
        match exchange.as_ref() {
            Exchange::Paper(p) => p,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn worker_places_ladder_and_reports_fills() {
        let fixture = spawn_worker().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Ladder resting on the sandbox.
        assert_eq!(paper(&fixture.exchange).open_orders("ETHUSDT").unwrap().len(), 4);

        // A fill bumps the shared trade counter.
        paper(&fixture.exchange).set_mark_price("ETHUSDT", 1_989.0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fixture.counter.load(Ordering::SeqCst) >= 1);

        let snapshot = fixture.handle.snapshot();
        assert_eq!(snapshot.state, GridState::Running);
        assert!(snapshot.fills_total >= 1);
    }

    #[tokio::test]
    async fn stop_cancels_orders_and_exits_within_grace() {
        let mut fixture = spawn_worker().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!paper(&fixture.exchange).open_orders("ETHUSDT").unwrap().is_empty());

        fixture.handle.request_stop();
        assert!(fixture.handle.join_within(Duration::from_secs(2)).await);
        assert!(fixture.handle.stop_was_requested());

        // No orphan orders on any exit path.
        assert!(paper(&fixture.exchange).open_orders("ETHUSDT").unwrap().is_empty());
    }

    #[tokio::test]
    async fn mailbox_latest_action_wins() {
        let mut fixture = spawn_worker().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Two actions before the next cycle: only the second may apply.
        fixture.handle.send_action(TuneAction::MoreLevels);
        fixture.handle.send_action(TuneAction::WiderSpacing);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snapshot = fixture.handle.snapshot();
        // Spacing widened by 25%, level count untouched by the overwritten
        // MoreLevels action.
        assert!((snapshot.spacing_fraction - 0.00625).abs() < 1e-9);
        assert_eq!(snapshot.grid_levels, 4);

        fixture.handle.request_stop();
        assert!(fixture.handle.join_within(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn flatten_request_halts_the_worker() {
        let mut fixture = spawn_worker().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        fixture.handle.request_flatten();
        assert!(fixture.handle.join_within(Duration::from_secs(2)).await);

        assert!(paper(&fixture.exchange).open_orders("ETHUSDT").unwrap().is_empty());
        assert_eq!(fixture.handle.snapshot().state, GridState::Halted);
        // A forced flatten is an intentional exit, never a crash.
        assert!(fixture.handle.stop_was_requested());
    }

    #[tokio::test]
    async fn snapshot_is_persisted_for_rehydration() {
        let fixture = spawn_worker().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stored =
            crate::grid::persistence::GridSnapshot::load(fixture._dir.path(), "ETHUSDT").unwrap();
        assert!(stored.is_some());
        assert_eq!(stored.unwrap().symbol, "ETHUSDT");
    }
}
