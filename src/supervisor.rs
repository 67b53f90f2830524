// =============================================================================
// Supervisor — owns the worker set, the retrain trigger, and shutdown
// =============================================================================
//
// Reconciles the running workers against the selected allocation set: stops
// deselected symbols gracefully, starts new ones under the concurrency cap.
// Crashed workers (exited without a stop request) restart after a bounded
// backoff with a critical alert; a second crash inside the ban window retires
// the symbol permanently.
//
// The retraining trigger watches the shared atomic trade counter: once the
// delta since the last baseline reaches the threshold and no job is in
// flight, one retrain job starts; its exit records the new baseline.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alert::Alerter;
use crate::capital::manager::Allocation;
use crate::config::EngineConfig;
use crate::data::DataFeed;
use crate::exchange::{Exchange, SymbolMeta};
use crate::grid::engine::{GridEngine, TuneAction};
use crate::grid::persistence::GridSnapshot;
use crate::risk::RiskMonitor;
use crate::types::Venue;
use crate::worker::{PairWorker, WorkerHandle, WorkerSnapshot};

/// A second crash inside this window bans the symbol.
const CRASH_BAN_WINDOW: Duration = Duration::from_secs(60);
/// Default restart backoff after a crash.
const DEFAULT_RESTART_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct CrashRecord {
    last_crash: Option<Instant>,
    restarts: u32,
    banned: bool,
}

pub struct Supervisor {
    cfg: EngineConfig,
    exchange: Arc<Exchange>,
    feed: Arc<DataFeed>,
    alerter: Arc<Alerter>,
    risk: Arc<RiskMonitor>,

    workers: Mutex<HashMap<String, WorkerHandle>>,
    allocations: Mutex<HashMap<String, Allocation>>,
    metas: RwLock<HashMap<Venue, HashMap<String, SymbolMeta>>>,
    crash_history: Mutex<HashMap<String, CrashRecord>>,

    trade_counter: Arc<AtomicU64>,
    retrain_baseline: AtomicU64,
    retrain_job: Mutex<Option<JoinHandle<()>>>,
    retrain_duration: Duration,

    restart_backoff: Duration,
}

impl Supervisor {
    pub fn new(
        cfg: EngineConfig,
        exchange: Arc<Exchange>,
        feed: Arc<DataFeed>,
        alerter: Arc<Alerter>,
        risk: Arc<RiskMonitor>,
    ) -> Self {
        Self {
            cfg,
            exchange,
            feed,
            alerter,
            risk,
            workers: Mutex::new(HashMap::new()),
            allocations: Mutex::new(HashMap::new()),
            metas: RwLock::new(HashMap::new()),
            crash_history: Mutex::new(HashMap::new()),
            trade_counter: Arc::new(AtomicU64::new(0)),
            retrain_baseline: AtomicU64::new(0),
            retrain_job: Mutex::new(None),
            retrain_duration: Duration::from_secs(2),
            restart_backoff: DEFAULT_RESTART_BACKOFF,
        }
    }

    /// Shrink the restart backoff (tests and fast environments).
    pub fn set_restart_backoff(&mut self, backoff: Duration) {
        self.restart_backoff = backoff;
    }

    /// Placeholder duration of the external retrain job.
    pub fn set_retrain_duration(&mut self, duration: Duration) {
        self.retrain_duration = duration;
    }

    pub fn trade_counter(&self) -> Arc<AtomicU64> {
        self.trade_counter.clone()
    }

    pub fn retrain_baseline(&self) -> u64 {
        self.retrain_baseline.load(Ordering::SeqCst)
    }

    pub fn retrain_in_flight(&self) -> bool {
        self.retrain_job.lock().is_some()
    }

    pub fn is_banned(&self, symbol: &str) -> bool {
        self.crash_history
            .lock()
            .get(symbol)
            .map(|r| r.banned)
            .unwrap_or(false)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    // -------------------------------------------------------------------------
    // Symbol metadata
    // -------------------------------------------------------------------------

    /// Fetch and cache symbol metadata for both venues.
    pub async fn load_symbol_metas(&self) -> anyhow::Result<()> {
        let mut metas = HashMap::new();
        for venue in [Venue::Spot, Venue::Derivatives] {
            match self.exchange.exchange_info(venue).await {
                Ok(list) => {
                    let map: HashMap<String, SymbolMeta> =
                        list.into_iter().map(|m| (m.symbol.clone(), m)).collect();
                    info!(venue = %venue, symbols = map.len(), "symbol metadata loaded");
                    metas.insert(venue, map);
                }
                Err(e) => warn!(venue = %venue, error = %e, "exchange info unavailable"),
            }
        }
        *self.metas.write() = metas;
        Ok(())
    }

    pub fn symbol_metas(&self) -> HashMap<Venue, HashMap<String, SymbolMeta>> {
        self.metas.read().clone()
    }

    fn meta_for(&self, symbol: &str, venue: Venue) -> Option<SymbolMeta> {
        self.metas.read().get(&venue)?.get(symbol).cloned()
    }

    // -------------------------------------------------------------------------
    // Worker-set reconciliation
    // -------------------------------------------------------------------------

    /// Bring the worker set in line with the allocation list: stop deselected
    /// workers gracefully, start newly selected ones under the cap.
    pub async fn reconcile_workers(&self, allocations: &[Allocation]) {
        let target: HashMap<&str, &Allocation> = allocations
            .iter()
            .filter(|a| !self.is_banned(&a.symbol))
            .map(|a| (a.symbol.as_str(), a))
            .collect();

        // Stop workers whose symbol fell out of the selection.
        let to_stop: Vec<String> = {
            let workers = self.workers.lock();
            workers
                .keys()
                .filter(|symbol| !target.contains_key(symbol.as_str()))
                .cloned()
                .collect()
        };
        for symbol in to_stop {
            self.stop_worker(&symbol).await;
        }

        // Record the allocation for every targeted symbol (restarts use it).
        {
            let mut stored = self.allocations.lock();
            stored.clear();
            for allocation in target.values() {
                stored.insert(allocation.symbol.clone(), (*allocation).clone());
            }
        }

        // Start missing workers.
        for allocation in target.values() {
            let running = self.workers.lock().contains_key(&allocation.symbol);
            if running {
                continue;
            }
            if self.worker_count() >= self.cfg.trading.max_concurrent_pairs {
                warn!(
                    symbol = %allocation.symbol,
                    cap = self.cfg.trading.max_concurrent_pairs,
                    "concurrency cap reached, worker not started"
                );
                continue;
            }
            self.start_worker(allocation);
        }
    }

    fn start_worker(&self, allocation: &Allocation) {
        let symbol = allocation.symbol.clone();
        let Some(meta) = self.meta_for(&symbol, allocation.venue) else {
            warn!(symbol = %symbol, venue = %allocation.venue, "no metadata, worker not started");
            return;
        };

        let state_dir = PathBuf::from(&self.cfg.trading.state_dir);
        // Only a snapshot with a usable ladder is a valid resume point.
        let engine = match GridSnapshot::load(&state_dir, &symbol) {
            Ok(Some(snapshot))
                if snapshot.venue == allocation.venue && !snapshot.ladder.levels.is_empty() =>
            {
                GridEngine::restore(
                    snapshot,
                    allocation.clone(),
                    meta,
                    self.cfg.grid.clone(),
                    self.exchange.clone(),
                )
            }
            _ => GridEngine::new(
                allocation.clone(),
                meta,
                self.cfg.grid.clone(),
                self.exchange.clone(),
            ),
        };

        self.feed.set_symbol_venue(&symbol, allocation.venue);
        let handle = PairWorker::spawn(
            engine,
            self.feed.clone(),
            Duration::from_secs(self.cfg.cycles.worker_interval_secs),
            state_dir,
            self.trade_counter.clone(),
        );

        self.risk.watch_symbol(&symbol);
        info!(symbol = %symbol, venue = %allocation.venue, "worker started");
        self.workers.lock().insert(symbol, handle);
    }

    async fn stop_worker(&self, symbol: &str) {
        let Some(mut handle) = self.workers.lock().remove(symbol) else {
            return;
        };
        info!(symbol, "stopping deselected worker");
        handle.request_stop();
        let grace = Duration::from_secs(self.cfg.cycles.shutdown_grace_secs);
        if !handle.join_within(grace).await {
            warn!(symbol, "worker did not stop inside the grace period, aborting");
            handle.abort();
        }
        self.risk.unwatch_symbol(symbol);
        self.feed.unsubscribe(symbol);
    }

    // -------------------------------------------------------------------------
    // Health check
    // -------------------------------------------------------------------------

    /// Detect crashed workers and restart or ban them.
    pub fn monitor_workers(self: &Arc<Self>) {
        let crashed: Vec<String> = {
            let mut workers = self.workers.lock();
            let finished: Vec<String> = workers
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(symbol, _)| symbol.clone())
                .collect();

            let mut crashed = Vec::new();
            for symbol in finished {
                if let Some(handle) = workers.remove(&symbol) {
                    if handle.stop_was_requested() {
                        info!(symbol = %symbol, "worker exited after stop request");
                    } else {
                        crashed.push(symbol);
                    }
                }
            }
            crashed
        };

        for symbol in crashed {
            self.handle_crash(&symbol);
        }
    }

    fn handle_crash(self: &Arc<Self>, symbol: &str) {
        self.risk.unwatch_symbol(symbol);

        let should_restart = {
            let mut history = self.crash_history.lock();
            let record = history.entry(symbol.to_string()).or_default();

            let repeat = record
                .last_crash
                .map(|at| at.elapsed() < CRASH_BAN_WINDOW)
                .unwrap_or(false);
            record.last_crash = Some(Instant::now());

            if repeat {
                record.banned = true;
                false
            } else {
                record.restarts += 1;
                true
            }
        };

        if should_restart {
            self.alerter.send_critical(
                &format!("worker_crash:{symbol}"),
                &format!("Worker for {symbol} exited unexpectedly, restarting in {:?}", self.restart_backoff),
            );

            let supervisor = self.clone();
            let symbol = symbol.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(supervisor.restart_backoff).await;
                let allocation = supervisor.allocations.lock().get(&symbol).cloned();
                match allocation {
                    Some(allocation) if !supervisor.is_banned(&symbol) => {
                        info!(symbol = %symbol, "restarting crashed worker");
                        supervisor.start_worker(&allocation);
                    }
                    _ => warn!(symbol = %symbol, "no allocation for crashed worker, not restarting"),
                }
            });
        } else {
            self.alerter.send_critical(
                &format!("worker_permanently_halted:{symbol}"),
                &format!("Worker for {symbol} crashed twice inside {CRASH_BAN_WINDOW:?}; symbol retired"),
            );
        }
    }

    // -------------------------------------------------------------------------
    // Retraining trigger
    // -------------------------------------------------------------------------

    /// Check the shared trade counter and manage the retrain job lifecycle.
    pub fn check_retraining(&self) {
        let threshold = self.cfg.retrain.trade_threshold;
        if threshold == 0 {
            return;
        }

        // Observe a finished job first: its exit records the new baseline.
        {
            let mut job = self.retrain_job.lock();
            match job.as_ref().map(|handle| handle.is_finished()) {
                Some(true) => {
                    *job = None;
                    let counter = self.trade_counter.load(Ordering::SeqCst);
                    self.retrain_baseline.store(counter, Ordering::SeqCst);
                    info!(baseline = counter, "retrain job finished, baseline recorded");
                }
                Some(false) => return, // mutually exclusive with itself
                None => {}
            }
        }

        let counter = self.trade_counter.load(Ordering::SeqCst);
        let baseline = self.retrain_baseline.load(Ordering::SeqCst);
        if counter.saturating_sub(baseline) < threshold {
            return;
        }

        info!(counter, baseline, threshold, "trade threshold reached, starting retrain job");
        let duration = self.retrain_duration;
        let handle = tokio::spawn(run_retrain_job(duration));
        *self.retrain_job.lock() = Some(handle);
    }

    // -------------------------------------------------------------------------
    // Coordinator surface
    // -------------------------------------------------------------------------

    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers.lock().values().map(|h| h.snapshot()).collect()
    }

    pub fn allocation_for(&self, symbol: &str) -> Option<Allocation> {
        self.allocations.lock().get(symbol).cloned()
    }

    pub fn send_action(&self, symbol: &str, action: TuneAction) {
        if let Some(handle) = self.workers.lock().get(symbol) {
            handle.send_action(action);
        }
    }

    pub fn force_flatten(&self, symbol: &str) {
        if let Some(handle) = self.workers.lock().get(symbol) {
            warn!(symbol, "forcing worker into flattening");
            handle.request_flatten();
        }
    }

    pub fn force_flatten_all(&self) {
        warn!("forcing ALL workers into flattening");
        for handle in self.workers.lock().values() {
            handle.request_flatten();
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Stop every worker and the retrain job. Workers get the configured
    /// grace period, then are aborted with a log of the stragglers.
    pub async fn shutdown(&self) {
        info!("supervisor shutdown: signalling all workers");

        let mut handles: Vec<(String, WorkerHandle)> =
            self.workers.lock().drain().collect();
        for (_, handle) in &handles {
            handle.request_stop();
        }

        let grace = Duration::from_secs(self.cfg.cycles.shutdown_grace_secs);
        let mut stragglers = Vec::new();
        for (symbol, handle) in &mut handles {
            if !handle.join_within(grace).await {
                stragglers.push(symbol.clone());
                handle.abort();
            }
        }
        if !stragglers.is_empty() {
            error!(stragglers = ?stragglers, "workers force-terminated after grace period");
        }

        if let Some(job) = self.retrain_job.lock().take() {
            job.abort();
            info!("retrain job aborted on shutdown");
        }

        info!("supervisor shutdown complete");
    }

    /// Periodic service loop: health checks and the retrain trigger.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
            self.monitor_workers();
            self.check_retraining();
        }
        info!("supervisor service loop stopped");
    }
}

/// The external model-retraining job. The supervisor only starts it and
/// observes its exit; with no command configured it degrades to a timed
/// placeholder (shadow mode).
async fn run_retrain_job(placeholder_duration: Duration) {
    match std::env::var("MERIDIAN_RETRAIN_CMD") {
        Ok(cmd) if !cmd.is_empty() => {
            info!(cmd = %cmd, "retrain job launching external command");
            match tokio::process::Command::new("sh").arg("-c").arg(&cmd).status().await {
                Ok(status) => info!(code = status.code(), "retrain command exited"),
                Err(e) => error!(error = %e, "retrain command failed to launch"),
            }
        }
        _ => {
            info!("no retrain command configured, running placeholder job");
            tokio::time::sleep(placeholder_duration).await;
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.worker_count())
            .field("trade_counter", &self.trade_counter.load(Ordering::SeqCst))
            .field("retrain_in_flight", &self.retrain_in_flight())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheTtls;
    use crate::data::MarketCache;
    use crate::exchange::PaperExchange;
    use crate::risk::RiskMonitor;

    fn meta(symbol: &str) -> SymbolMeta {
        SymbolMeta {
            symbol: symbol.to_string(),
            venue: Venue::Derivatives,
            base_asset: symbol.trim_end_matches("USDT").to_string(),
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

    fn allocation(symbol: &str, capital: f64) -> Allocation {
        Allocation {
            symbol: symbol.to_string(),
            venue: Venue::Derivatives,
            allocated_usd: capital,
            max_position_usd: capital * 0.4,
            grid_levels: 4,
            spacing_fraction: 0.005,
            leverage: 10,
        }
    }

    struct Fixture {
        supervisor: Arc<Supervisor>,
        exchange: Arc<Exchange>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(symbols: &[&str]) -> Fixture {
        let paper = PaperExchange::new();
        for symbol in symbols {
            paper.register_symbol(meta(symbol));
            paper.set_mark_price(symbol, 2_000.0);
        }
        paper.deposit(Venue::Derivatives, 10_000.0);
        let exchange = Arc::new(Exchange::Paper(paper));

        let cache = Arc::new(MarketCache::new(CacheTtls {
            tickers_secs: 0,
            klines_secs: 0,
            positions_secs: 0,
            balances_secs: 0,
        }));
        let feed = Arc::new(DataFeed::new(
            exchange.clone(),
            cache,
            Duration::from_millis(50),
        ));

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.trading.state_dir = dir.path().to_string_lossy().into_owned();
        cfg.trading.max_concurrent_pairs = 3;
        cfg.cycles.worker_interval_secs = 1;
        cfg.cycles.shutdown_grace_secs = 2;
        cfg.grid.use_dynamic_spacing = false;
        cfg.grid.min_levels = 2;
        cfg.retrain.trade_threshold = 100;

        let alerter = Arc::new(Alerter::disabled());
        let risk = Arc::new(RiskMonitor::new(cfg.risk.clone(), alerter.clone()));

        let mut supervisor = Supervisor::new(cfg, exchange.clone(), feed, alerter, risk);
        supervisor.set_restart_backoff(Duration::from_millis(30));
        supervisor.set_retrain_duration(Duration::from_millis(50));
        let supervisor = Arc::new(supervisor);
        supervisor.load_symbol_metas().await.unwrap();

        Fixture {
            supervisor,
            exchange,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn reconcile_starts_and_stops_workers() {
        let fixture = fixture(&["AUSDT", "BUSDT"]).await;
        let supervisor = &fixture.supervisor;

        supervisor
            .reconcile_workers(&[allocation("AUSDT", 100.0), allocation("BUSDT", 100.0)])
            .await;
        assert_eq!(supervisor.worker_count(), 2);

        // One symbol per worker, never duplicated.
        supervisor
            .reconcile_workers(&[allocation("AUSDT", 100.0), allocation("BUSDT", 100.0)])
            .await;
        assert_eq!(supervisor.worker_count(), 2);

        // Deselect BUSDT.
        supervisor.reconcile_workers(&[allocation("AUSDT", 100.0)]).await;
        assert_eq!(supervisor.worker_count(), 1);
        assert!(supervisor.worker_snapshots()[0].symbol == "AUSDT");
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let fixture = fixture(&["AUSDT", "BUSDT", "CUSDT", "DUSDT"]).await;
        let allocations: Vec<Allocation> = ["AUSDT", "BUSDT", "CUSDT", "DUSDT"]
            .iter()
            .map(|s| allocation(s, 100.0))
            .collect();
        fixture.supervisor.reconcile_workers(&allocations).await;
        assert_eq!(fixture.supervisor.worker_count(), 3);
    }

    #[tokio::test]
    async fn empty_allocations_start_no_workers() {
        // The capital manager returned nothing, so no workers run.
        let fixture = fixture(&["BTCUSDT", "ETHUSDT"]).await;
        fixture.supervisor.reconcile_workers(&[]).await;
        assert_eq!(fixture.supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn crashed_worker_restarts_then_gets_banned() {
        // An allocation too small to build a ladder halts the engine
        // immediately, which the supervisor sees as an unexpected exit.
        let fixture = fixture(&["ADAUSDT"]).await;
        let supervisor = &fixture.supervisor;

        supervisor.reconcile_workers(&[allocation("ADAUSDT", 1.0)]).await;
        assert_eq!(supervisor.worker_count(), 1);

        // Let the worker halt and exit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.monitor_workers();
        assert_eq!(supervisor.worker_count(), 0);
        assert!(!supervisor.is_banned("ADAUSDT"));

        // Restart fires after the backoff, crashes again inside the window.
        tokio::time::sleep(Duration::from_millis(150)).await;
        supervisor.monitor_workers();
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.monitor_workers();

        assert!(supervisor.is_banned("ADAUSDT"));
        assert_eq!(supervisor.worker_count(), 0);

        // A banned symbol is filtered from future reconciles.
        supervisor.reconcile_workers(&[allocation("ADAUSDT", 100.0)]).await;
        assert_eq!(supervisor.worker_count(), 0);
    }

    #[tokio::test]
    async fn retrain_triggers_once_and_records_baseline_on_exit() {
        // Fills accumulate toward the 100-trade threshold.
        let fixture = fixture(&["AUSDT"]).await;
        let supervisor = &fixture.supervisor;
        let counter = supervisor.trade_counter();

        counter.fetch_add(120, Ordering::SeqCst);
        supervisor.check_retraining();
        assert!(supervisor.retrain_in_flight());

        // Further increments never start a second concurrent job.
        counter.fetch_add(50, Ordering::SeqCst);
        supervisor.check_retraining();
        assert!(supervisor.retrain_in_flight());

        // Job exits; the next check records the baseline at that moment.
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.check_retraining();
        assert!(!supervisor.retrain_in_flight());
        assert_eq!(supervisor.retrain_baseline(), 170);

        // Delta is now zero: no immediate retrigger.
        supervisor.check_retraining();
        assert!(!supervisor.retrain_in_flight());
    }

    #[tokio::test]
    async fn retrain_disabled_when_threshold_zero() {
        let fixture = fixture(&["AUSDT"]).await;
        let mut cfg = EngineConfig::default();
        cfg.retrain.trade_threshold = 0;
        // Rebuild a supervisor with retraining disabled.
        let alerter = Arc::new(Alerter::disabled());
        let risk = Arc::new(RiskMonitor::new(cfg.risk.clone(), alerter.clone()));
        let cache = Arc::new(MarketCache::new(CacheTtls::default()));
        let feed = Arc::new(DataFeed::new(
            fixture.exchange.clone(),
            cache,
            Duration::from_millis(50),
        ));
        let supervisor = Supervisor::new(cfg, fixture.exchange.clone(), feed, alerter, risk);

        supervisor.trade_counter().fetch_add(1_000, Ordering::SeqCst);
        supervisor.check_retraining();
        assert!(!supervisor.retrain_in_flight());
    }

    #[tokio::test]
    async fn shutdown_stops_everything_within_grace() {
        // Invariant: after the stop signal, workers exit within the grace
        // period and no orders remain.
        let fixture = fixture(&["AUSDT", "BUSDT"]).await;
        let supervisor = &fixture.supervisor;
        supervisor
            .reconcile_workers(&[allocation("AUSDT", 100.0), allocation("BUSDT", 100.0)])
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.shutdown().await;
        assert_eq!(supervisor.worker_count(), 0);

        match fixture.exchange.as_ref() {
            Exchange::Paper(paper) => {
                assert!(paper.open_orders("AUSDT").unwrap().is_empty());
                assert!(paper.open_orders("BUSDT").unwrap().is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn actions_reach_the_targeted_worker() {
        let fixture = fixture(&["AUSDT"]).await;
        let supervisor = &fixture.supervisor;
        supervisor.reconcile_workers(&[allocation("AUSDT", 100.0)]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        supervisor.send_action("AUSDT", TuneAction::WiderSpacing);
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        let snapshot = &supervisor.worker_snapshots()[0];
        assert!((snapshot.spacing_fraction - 0.00625).abs() < 1e-9);

        supervisor.shutdown().await;
    }
}
