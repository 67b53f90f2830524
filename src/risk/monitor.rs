// =============================================================================
// Risk monitor — per-position, portfolio, and account checks with throttling
// =============================================================================
//
// Runs on its own cadence, independent of the trading cycle. Every check runs
// inside a panic isolation boundary: a failing check is logged and counted,
// never aborting the rest of the pass. Every alert key (context + message)
// carries a cooldown so identical alerts collapse.
//
// Critical breaches mark the affected symbols; the coordinator drains that
// set and forces the matching workers into flattening.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::Alerter;
use crate::config::RiskConfig;
use crate::data::DataFeed;
use crate::risk::metrics::RiskMetrics;
use crate::types::{Severity, Venue};

/// Rolling window length for the metrics store.
const METRICS_WINDOW: usize = 100;
/// Marker used for account-level criticals (not tied to one symbol).
pub const ACCOUNT_SCOPE: &str = "__account__";

/// One monitored position, snapshotted for a check pass.
#[derive(Debug, Clone)]
pub struct PositionView {
    pub symbol: String,
    pub price: f64,
    pub notional: f64,
    pub unrealized_pnl: f64,
}

/// Everything one check pass reads.
#[derive(Debug, Clone, Default)]
pub struct RiskInputs {
    pub positions: Vec<PositionView>,
    pub total_equity: f64,
    /// Available margin as a fraction of equity.
    pub margin_ratio: f64,
}

pub struct RiskMonitor {
    config: RiskConfig,
    alerter: Arc<Alerter>,
    metrics: Mutex<RiskMetrics>,
    monitored: RwLock<HashSet<String>>,
    cooldowns: Mutex<HashMap<String, Instant>>,
    /// Symbols (or ACCOUNT_SCOPE) with an outstanding critical breach.
    criticals: Mutex<HashSet<String>>,
    check_errors: AtomicU64,
}

impl RiskMonitor {
    pub fn new(config: RiskConfig, alerter: Arc<Alerter>) -> Self {
        Self {
            config,
            alerter,
            metrics: Mutex::new(RiskMetrics::new(METRICS_WINDOW)),
            monitored: RwLock::new(HashSet::new()),
            cooldowns: Mutex::new(HashMap::new()),
            criticals: Mutex::new(HashSet::new()),
            check_errors: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Symbol registry
    // -------------------------------------------------------------------------

    pub fn watch_symbol(&self, symbol: &str) {
        self.monitored.write().insert(symbol.to_string());
    }

    pub fn unwatch_symbol(&self, symbol: &str) {
        self.monitored.write().remove(symbol);
        self.metrics.lock().remove(symbol);
    }

    pub fn monitored_symbols(&self) -> Vec<String> {
        self.monitored.read().iter().cloned().collect()
    }

    /// Drain the outstanding critical breaches. The coordinator forces the
    /// returned symbols into flattening.
    pub fn take_criticals(&self) -> Vec<String> {
        self.criticals.lock().drain().collect()
    }

    pub fn check_error_count(&self) -> u64 {
        self.check_errors.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Check pass
    // -------------------------------------------------------------------------

    /// Run the full check suite over one snapshot.
    pub fn run_checks(&self, inputs: &RiskInputs) {
        // Feed the rolling windows first.
        {
            let mut metrics = self.metrics.lock();
            for position in &inputs.positions {
                metrics.update(
                    &position.symbol,
                    position.price,
                    position.unrealized_pnl,
                    position.notional,
                );
            }
        }

        self.isolated("position_checks", || self.check_positions(inputs));
        self.isolated("portfolio_checks", || self.check_portfolio(inputs));
        self.isolated("account_checks", || self.check_account(inputs));
    }

    /// Run `check` with panic isolation; a panicking check is logged and
    /// counted, the pass continues.
    fn isolated(&self, name: &str, check: impl FnOnce()) {
        if std::panic::catch_unwind(AssertUnwindSafe(check)).is_err() {
            self.check_errors.fetch_add(1, Ordering::Relaxed);
            warn!(check = name, "risk check panicked — isolated");
        }
    }

    fn check_positions(&self, inputs: &RiskInputs) {
        let metrics = self.metrics.lock();
        for position in &inputs.positions {
            let symbol = &position.symbol;

            if let Some(drawdown) = metrics.max_drawdown(symbol) {
                if drawdown >= self.config.max_drawdown {
                    self.raise(
                        symbol,
                        format!(
                            "drawdown {:.1}% breaches the {:.1}% limit",
                            drawdown * 100.0,
                            self.config.max_drawdown * 100.0
                        ),
                        Severity::Critical,
                    );
                }
            }

            if let Some(var) = metrics.value_at_risk(symbol) {
                if var >= self.config.max_portfolio_var {
                    self.raise(
                        symbol,
                        format!(
                            "position VaR {:.2}% above the {:.2}% cap",
                            var * 100.0,
                            self.config.max_portfolio_var * 100.0
                        ),
                        Severity::Warning,
                    );
                }
            }

            if let Some(sharpe) = metrics.sharpe(symbol) {
                debug!(symbol = %symbol, sharpe, "position sharpe");
            }

            if inputs.total_equity > 0.0 {
                let weight = position.notional / inputs.total_equity;
                if weight >= self.config.max_single_asset_weight {
                    self.raise(
                        symbol,
                        format!(
                            "position weight {:.1}% exceeds the {:.1}% single-asset cap",
                            weight * 100.0,
                            self.config.max_single_asset_weight * 100.0
                        ),
                        Severity::Warning,
                    );
                }
            }
        }
    }

    fn check_portfolio(&self, inputs: &RiskInputs) {
        if inputs.positions.len() < 2 {
            return;
        }

        let weights: HashMap<String, f64> = inputs
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), p.notional))
            .collect();

        let metrics = self.metrics.lock();

        // Pairwise correlation exposure.
        let symbols: Vec<&String> = weights.keys().collect();
        for i in 0..symbols.len() {
            for j in (i + 1)..symbols.len() {
                if let Some(rho) = metrics.correlation(symbols[i], symbols[j]) {
                    if rho >= self.config.max_correlation_exposure {
                        self.raise(
                            "portfolio",
                            format!(
                                "correlation {rho:.2} between {} and {} above the {:.2} cap",
                                symbols[i], symbols[j], self.config.max_correlation_exposure
                            ),
                            Severity::Warning,
                        );
                    }
                }
            }
        }

        // Portfolio VaR via the correlation matrix.
        if let Some(pvar) = metrics.portfolio_var(&weights) {
            if pvar >= self.config.max_portfolio_var {
                for symbol in weights.keys() {
                    self.criticals.lock().insert(symbol.clone());
                }
                self.raise(
                    "portfolio",
                    format!(
                        "portfolio VaR {:.2}% breaches the {:.2}% limit",
                        pvar * 100.0,
                        self.config.max_portfolio_var * 100.0
                    ),
                    Severity::Critical,
                );
            }
        }

        let diversification = RiskMetrics::diversification_score(&weights);
        debug!(diversification, "portfolio diversification score");
    }

    fn check_account(&self, inputs: &RiskInputs) {
        if inputs.total_equity <= 0.0 {
            return;
        }
        if inputs.margin_ratio < self.config.margin_ratio_floor {
            self.criticals.lock().insert(ACCOUNT_SCOPE.to_string());
            self.raise(
                "account",
                format!(
                    "available margin ratio {:.1}% below the {:.1}% floor",
                    inputs.margin_ratio * 100.0,
                    self.config.margin_ratio_floor * 100.0
                ),
                Severity::Critical,
            );
        }
    }

    // -------------------------------------------------------------------------
    // Alert throttling
    // -------------------------------------------------------------------------

    /// Emit an alert for `context` unless the identical (context, message)
    /// pair fired inside the cooldown window. Critical alerts additionally
    /// mark the context for the coordinator.
    fn raise(&self, context: &str, message: String, severity: Severity) -> bool {
        let key = format!("{context}:{message}");
        let cooldown = Duration::from_secs(self.config.alert_cooldown_minutes * 60);

        {
            let mut cooldowns = self.cooldowns.lock();
            if let Some(at) = cooldowns.get(&key) {
                if at.elapsed() < cooldown {
                    debug!(key, "risk alert suppressed inside cooldown");
                    return false;
                }
            }
            cooldowns.insert(key, Instant::now());
        }

        if severity == Severity::Critical && context != "portfolio" {
            self.criticals.lock().insert(context.to_string());
        }

        self.alerter.send(&format!("[{context}] {message}"), severity);
        true
    }

    // -------------------------------------------------------------------------
    // Service loop
    // -------------------------------------------------------------------------

    /// Gather a snapshot from the data cache and run the check suite, on the
    /// configured cadence, until `stop`.
    pub async fn run(self: Arc<Self>, feed: Arc<DataFeed>, interval: Duration, mut stop: watch::Receiver<bool>) {
        info!(interval = ?interval, "risk monitor started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }

            let inputs = self.gather(&feed).await;
            self.run_checks(&inputs);
        }
        info!("risk monitor stopped");
    }

    async fn gather(&self, feed: &Arc<DataFeed>) -> RiskInputs {
        let mut positions = Vec::new();
        for symbol in self.monitored_symbols() {
            let Ok(Some(position)) = feed.position(&symbol).await else {
                continue;
            };
            let price = feed
                .cache()
                .ticker(&symbol)
                .map(|t| t.last_price)
                .unwrap_or(position.entry_price);
            positions.push(PositionView {
                symbol: symbol.clone(),
                price,
                notional: position.size.abs() * price,
                unrealized_pnl: position.unrealized_pnl,
            });
        }

        let (total_equity, margin_ratio) = match feed.balances().await {
            Ok(snapshot) => {
                let equity = snapshot.total_equity();
                let derivatives = snapshot.venue(Venue::Derivatives);
                let ratio = if derivatives.equity > 0.0 {
                    (derivatives.free / derivatives.equity).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                (equity, ratio)
            }
            Err(e) => {
                warn!(error = %e, "risk monitor could not fetch balances");
                (0.0, 1.0)
            }
        };

        RiskInputs {
            positions,
            total_equity,
            margin_ratio,
        }
    }
}

impl std::fmt::Debug for RiskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskMonitor")
            .field("monitored", &self.monitored.read().len())
            .field("check_errors", &self.check_error_count())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> RiskMonitor {
        RiskMonitor::new(RiskConfig::default(), Arc::new(Alerter::disabled()))
    }

    fn view(symbol: &str, price: f64, notional: f64, pnl: f64) -> PositionView {
        PositionView {
            symbol: symbol.to_string(),
            price,
            notional,
            unrealized_pnl: pnl,
        }
    }

    #[test]
    fn drawdown_breach_marks_symbol_critical() {
        let monitor = monitor();
        // Build a PnL series that peaks and collapses: 200 of drawdown on a
        // 1000 notional = 20% > the 15% default limit.
        let pnls = [0.0, 100.0, 200.0, 50.0, 0.0];
        for (i, pnl) in pnls.iter().enumerate() {
            monitor.run_checks(&RiskInputs {
                positions: vec![view("ETHUSDT", 2_000.0 + i as f64, 1_000.0, *pnl)],
                total_equity: 10_000.0,
                margin_ratio: 1.0,
            });
        }
        let criticals = monitor.take_criticals();
        assert!(criticals.contains(&"ETHUSDT".to_string()));
    }

    #[test]
    fn identical_alert_suppressed_inside_cooldown() {
        let monitor = monitor();
        assert!(monitor.raise("ctx", "msg".to_string(), Severity::Warning));
        assert!(!monitor.raise("ctx", "msg".to_string(), Severity::Warning));
        // Different message under the same context is a different key.
        assert!(monitor.raise("ctx", "other".to_string(), Severity::Warning));
    }

    #[test]
    fn margin_floor_breach_is_account_critical() {
        let monitor = monitor();
        monitor.run_checks(&RiskInputs {
            positions: Vec::new(),
            total_equity: 1_000.0,
            margin_ratio: 0.05, // below the 0.15 default floor
        });
        let criticals = monitor.take_criticals();
        assert!(criticals.contains(&ACCOUNT_SCOPE.to_string()));
    }

    #[test]
    fn healthy_account_raises_nothing() {
        let monitor = monitor();
        monitor.run_checks(&RiskInputs {
            positions: vec![view("ETHUSDT", 2_000.0, 100.0, 5.0)],
            total_equity: 10_000.0,
            margin_ratio: 0.9,
        });
        assert!(monitor.take_criticals().is_empty());
    }

    #[test]
    fn take_criticals_drains() {
        let monitor = monitor();
        monitor.run_checks(&RiskInputs {
            positions: Vec::new(),
            total_equity: 1_000.0,
            margin_ratio: 0.0,
        });
        assert!(!monitor.take_criticals().is_empty());
        assert!(monitor.take_criticals().is_empty());
    }

    #[test]
    fn panicking_check_is_isolated_and_counted() {
        let monitor = monitor();
        monitor.isolated("boom", || panic!("synthetic failure"));
        assert_eq!(monitor.check_error_count(), 1);
    }

    #[test]
    fn watch_registry_roundtrip() {
        let monitor = monitor();
        monitor.watch_symbol("ETHUSDT");
        monitor.watch_symbol("BTCUSDT");
        assert_eq!(monitor.monitored_symbols().len(), 2);
        monitor.unwatch_symbol("ETHUSDT");
        assert_eq!(monitor.monitored_symbols(), vec!["BTCUSDT".to_string()]);
    }
}
