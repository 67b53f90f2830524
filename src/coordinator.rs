// =============================================================================
// Coordinator — schedules cycles and fans decisions out to the workers
// =============================================================================
//
// One cycle: (re)select pairs and build the market overview -> allocate
// capital -> reconcile the worker set -> decide the overall strategy ->
// batch per-symbol decisions from non-blocking worker snapshots -> push
// actions into the worker mailboxes -> drain critical risk breaches and
// force the affected workers into flattening.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::capital::manager::{AllocationInputs, CapitalManager};
use crate::config::EngineConfig;
use crate::data::DataFeed;
use crate::decision::{DecisionEngine, SymbolContext};
use crate::exchange::{Exchange, SymbolMeta, Ticker24h};
use crate::grid::engine::GridState;
use crate::risk::monitor::ACCOUNT_SCOPE;
use crate::risk::RiskMonitor;
use crate::selector::{PairSelector, SelectionResult};
use crate::sentiment::SentimentAgent;
use crate::supervisor::Supervisor;
use crate::types::Venue;

const DECISION_KLINE_INTERVAL: &str = "1m";
const DECISION_KLINE_LIMIT: u32 = 120;

pub struct Coordinator {
    cfg: EngineConfig,
    exchange: Arc<Exchange>,
    feed: Arc<DataFeed>,
    selector: PairSelector,
    capital: CapitalManager,
    decision: DecisionEngine,
    sentiment: Arc<SentimentAgent>,
    risk: Arc<RiskMonitor>,
    supervisor: Arc<Supervisor>,

    last_selection: Mutex<Option<SelectionResult>>,
    last_reselect: Mutex<Option<Instant>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        exchange: Arc<Exchange>,
        feed: Arc<DataFeed>,
        sentiment: Arc<SentimentAgent>,
        risk: Arc<RiskMonitor>,
        supervisor: Arc<Supervisor>,
    ) -> Self {
        let selector = PairSelector::new(cfg.pair_selection.clone(), cfg.trading.clone());
        let capital = CapitalManager::new(
            cfg.capital.clone(),
            cfg.grid.clone(),
            cfg.trading.clone(),
        );
        let decision = DecisionEngine::new(cfg.grid.clone());
        Self {
            cfg,
            exchange,
            feed,
            selector,
            capital,
            decision,
            sentiment,
            risk,
            supervisor,
            last_selection: Mutex::new(None),
            last_reselect: Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&self) -> Result<()> {
        let sentiment = self.sentiment.latest(true);

        // --- 1. Pair selection (on its own, slower cadence) ------------------
        let selection = self.current_selection(sentiment).await;
        let Some(selection) = selection else {
            warn!("no pair selection available, skipping cycle");
            return Ok(());
        };

        // --- 2. Capital allocation -------------------------------------------
        let balances = self.feed.balances().await?;
        let tickers = self.collect_tickers().await;
        let metas = self.supervisor.symbol_metas();

        let outcome = self
            .capital
            .allocate(
                &self.exchange,
                AllocationInputs {
                    balances: &balances,
                    candidates: &selection.selected,
                    tickers: &tickers,
                    metas: &metas,
                },
            )
            .await;
        for warning in &outcome.warnings {
            warn!(warning = %warning, "allocation warning");
        }

        // --- 3. Worker-set reconciliation ------------------------------------
        self.supervisor.reconcile_workers(&outcome.allocations).await;

        // --- 4. Overview decision --------------------------------------------
        let overall = self.decision.overview(&selection.overview);
        info!(
            label = %overall.label,
            confidence = overall.confidence,
            pairs = outcome.allocations.len(),
            "coordinator cycle"
        );

        // --- 5. Per-symbol decisions into the mailboxes ----------------------
        let (contexts, flat_metas) = self.build_contexts(sentiment, &metas).await;
        if !contexts.is_empty() {
            let decisions = self
                .decision
                .decide_batch(contexts, overall, &flat_metas)
                .await;
            for decision in decisions {
                info!(
                    symbol = %decision.symbol,
                    action = ?decision.action,
                    confidence = decision.confidence,
                    reasoning = %decision.reasoning,
                    "tuning decision"
                );
                self.supervisor.send_action(&decision.symbol, decision.action);
            }
        }

        // --- 6. Critical risk breaches ---------------------------------------
        for scope in self.risk.take_criticals() {
            if scope == ACCOUNT_SCOPE {
                self.supervisor.force_flatten_all();
            } else {
                self.supervisor.force_flatten(&scope);
            }
        }

        Ok(())
    }

    /// Return the current selection, refreshing it on the reselect cadence.
    async fn current_selection(&self, sentiment: f64) -> Option<SelectionResult> {
        let reselect_due = {
            let last = self.last_reselect.lock();
            match *last {
                None => true,
                Some(at) => {
                    at.elapsed()
                        >= Duration::from_secs(
                            self.cfg.pair_selection.update_interval_hours * 3600,
                        )
                }
            }
        };

        if reselect_due {
            match self.selector.select(&self.exchange, sentiment).await {
                Ok(selection) => {
                    *self.last_selection.lock() = Some(selection);
                    *self.last_reselect.lock() = Some(Instant::now());
                }
                Err(e) => {
                    warn!(error = %e, "pair selection failed, keeping previous selection")
                }
            }
        }

        self.last_selection.lock().clone()
    }

    async fn collect_tickers(&self) -> HashMap<String, Ticker24h> {
        let mut tickers = HashMap::new();
        for venue in [Venue::Spot, Venue::Derivatives] {
            if let Ok(list) = self.exchange.tickers_24h(venue).await {
                for ticker in list {
                    tickers.insert(ticker.symbol.clone(), ticker);
                }
            }
        }
        tickers
    }

    /// Build decision contexts from non-blocking worker snapshots.
    async fn build_contexts(
        &self,
        sentiment: f64,
        metas: &HashMap<Venue, HashMap<String, SymbolMeta>>,
    ) -> (Vec<SymbolContext>, HashMap<String, SymbolMeta>) {
        let mut contexts = Vec::new();
        let mut flat_metas = HashMap::new();

        for snapshot in self.supervisor.worker_snapshots() {
            if snapshot.state != GridState::Running {
                continue;
            }
            let Some(allocation) = self.supervisor.allocation_for(&snapshot.symbol) else {
                continue;
            };
            let Some(meta) = metas
                .get(&allocation.venue)
                .and_then(|m| m.get(&snapshot.symbol))
            else {
                continue;
            };

            let klines = self
                .feed
                .klines(
                    &snapshot.symbol,
                    DECISION_KLINE_INTERVAL,
                    DECISION_KLINE_LIMIT,
                    allocation.venue,
                )
                .await
                .unwrap_or_default();

            let per_level_budget =
                allocation.allocated_usd / snapshot.grid_levels.max(1) as f64;

            flat_metas.insert(snapshot.symbol.clone(), meta.clone());
            contexts.push(SymbolContext {
                symbol: snapshot.symbol.clone(),
                price: snapshot.last_price,
                klines,
                current_levels: snapshot.grid_levels,
                current_spacing: snapshot.spacing_fraction,
                per_level_budget,
                target_fraction: allocation.position_cap_fraction(),
                sentiment,
            });
        }

        (contexts, flat_metas)
    }

    // -------------------------------------------------------------------------
    // Service loop
    // -------------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.cycles.coordinator_interval_secs);
        info!(interval = ?interval, "coordinator started");

        loop {
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "coordinator cycle failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        info!("coordinator stopped");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("has_selection", &self.last_selection.lock().is_some())
            .finish()
    }
}
