// =============================================================================
// Grid engine — per-symbol state machine around a resting-order ladder
// =============================================================================
//
// States: Initializing -> Running <-> Recentering, with Flattening on TP/SL
// or stop and Halted as the terminal state.
//
// One cycle, in order: refresh mark -> detect fills (user-trade stream first,
// open-order diff as fallback) -> fold fills into the position and schedule
// mirror levels -> TP/SL check -> recenter check -> apply the coordinator's
// tuning action -> reconcile live orders against the intended ladder, cancels
// before places, both bounded by the per-cycle budget.
//
// Transient exchange errors are already retried inside the adapter; a cycle
// that still fails counts toward the consecutive-failure escalation that
// halts the worker.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capital::manager::Allocation;
use crate::capital::sizer::size_order;
use crate::config::GridConfig;
use crate::exchange::{Exchange, ExchangeError, Kline, OrderSpec, SymbolMeta};
use crate::grid::ladder::{build_ladder, GridLevel, Ladder, LadderParams};
use crate::grid::persistence::GridSnapshot;
use crate::indicators::atr::latest_atr_fraction;
use crate::types::{OrderSide, Position, TradeJournal, TradeRecord, TradeSource};

/// Bound on the trade journal each worker keeps in memory.
const JOURNAL_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridState {
    Initializing,
    Running,
    Recentering,
    Flattening,
    Halted,
}

impl std::fmt::Display for GridState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::Recentering => write!(f, "Recentering"),
            Self::Flattening => write!(f, "Flattening"),
            Self::Halted => write!(f, "Halted"),
        }
    }
}

/// The bounded action set the coordinator nudges a worker with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuneAction {
    Hold,
    MoreLevels,
    FewerLevels,
    WiderSpacing,
    TighterSpacing,
    BiasBullish,
    BiasBearish,
    ResetDefaults,
    AggressiveBullish,
    AggressiveBearish,
}

impl TuneAction {
    pub fn from_index(index: u8) -> Option<Self> {
        Some(match index {
            0 => Self::Hold,
            1 => Self::MoreLevels,
            2 => Self::FewerLevels,
            3 => Self::WiderSpacing,
            4 => Self::TighterSpacing,
            5 => Self::BiasBullish,
            6 => Self::BiasBearish,
            7 => Self::ResetDefaults,
            8 => Self::AggressiveBullish,
            9 => Self::AggressiveBearish,
            _ => return None,
        })
    }

    pub fn index(self) -> u8 {
        match self {
            Self::Hold => 0,
            Self::MoreLevels => 1,
            Self::FewerLevels => 2,
            Self::WiderSpacing => 3,
            Self::TighterSpacing => 4,
            Self::BiasBullish => 5,
            Self::BiasBearish => 6,
            Self::ResetDefaults => 7,
            Self::AggressiveBullish => 8,
            Self::AggressiveBearish => 9,
        }
    }
}

/// Market snapshot one cycle runs against.
#[derive(Debug, Clone, Default)]
pub struct CycleInputs {
    pub mark: f64,
    pub klines: Vec<Kline>,
    pub timestamp_ms: i64,
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub fills: usize,
    pub placed: usize,
    pub cancelled: usize,
    pub recentered: bool,
    pub tp_sl_triggered: bool,
    pub action_applied: bool,
}

pub struct GridEngine {
    allocation: Allocation,
    meta: SymbolMeta,
    cfg: GridConfig,
    exchange: Arc<Exchange>,

    state: GridState,
    ladder: Ladder,
    position: Position,
    journal: TradeJournal,

    // Current tunable parameters (start at allocation defaults).
    levels: usize,
    spacing: f64,
    bias: i8,
    target_fraction: f64,

    consecutive_failures: u32,
    last_trade_id: u64,
    fills_total: u64,
    halt_reason: Option<String>,
}

impl GridEngine {
    pub fn new(
        allocation: Allocation,
        meta: SymbolMeta,
        cfg: GridConfig,
        exchange: Arc<Exchange>,
    ) -> Self {
        let spacing = allocation.spacing_fraction;
        let levels = allocation.grid_levels;
        let target_fraction = allocation.position_cap_fraction();
        Self {
            allocation,
            meta,
            cfg,
            exchange,
            state: GridState::Initializing,
            ladder: Ladder {
                center_price: 0.0,
                spacing_fraction: spacing,
                levels: Vec::new(),
            },
            position: Position::flat(),
            journal: TradeJournal::new(JOURNAL_CAP),
            levels,
            spacing,
            bias: 0,
            target_fraction,
            consecutive_failures: 0,
            last_trade_id: 0,
            fills_total: 0,
            halt_reason: None,
        }
    }

    /// Rebuild an engine from a persisted snapshot.
    pub fn restore(
        snapshot: GridSnapshot,
        allocation: Allocation,
        meta: SymbolMeta,
        cfg: GridConfig,
        exchange: Arc<Exchange>,
    ) -> Self {
        let mut engine = Self::new(allocation, meta, cfg, exchange);
        engine.spacing = snapshot.ladder.spacing_fraction;
        engine.levels = snapshot.ladder.levels.len().max(engine.cfg.min_levels);
        engine.ladder = snapshot.ladder;
        engine.position = snapshot.position;
        engine.last_trade_id = snapshot.last_trade_id;
        engine.state = GridState::Running;
        info!(symbol = %engine.meta.symbol, "grid engine restored from snapshot");
        engine
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> GridState {
        self.state
    }

    pub fn symbol(&self) -> &str {
        &self.meta.symbol
    }

    pub fn ladder(&self) -> &Ladder {
        &self.ladder
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn journal(&self) -> &TradeJournal {
        &self.journal
    }

    pub fn fills_total(&self) -> u64 {
        self.fills_total
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halt_reason.as_deref()
    }

    pub fn live_order_ids(&self) -> Vec<u64> {
        self.ladder.levels.iter().filter_map(|l| l.order_id).collect()
    }

    pub fn snapshot(&self, timestamp_ms: i64) -> GridSnapshot {
        GridSnapshot::new(
            &self.meta.symbol,
            self.meta.venue,
            self.ladder.clone(),
            self.position.clone(),
            self.last_trade_id,
            timestamp_ms,
        )
    }

    /// Current tunable parameters (levels, spacing, bias).
    pub fn parameters(&self) -> (usize, f64, i8) {
        (self.levels, self.spacing, self.bias)
    }

    // -------------------------------------------------------------------------
    // Initialization
    // -------------------------------------------------------------------------

    /// Build the first ladder around the current mark. Moves to Running, or
    /// Halted when no valid ladder exists for the allocation.
    pub async fn initialize(&mut self, inputs: &CycleInputs) -> Result<(), ExchangeError> {
        self.spacing = self.effective_spacing(inputs);

        // Skip fills that predate this engine.
        if let Ok(trades) = self
            .exchange
            .my_trades(&self.meta.symbol, self.meta.venue, None)
            .await
        {
            self.last_trade_id = trades.iter().map(|t| t.trade_id).max().unwrap_or(0);
        }

        match self.build_intended(inputs.mark) {
            Ok(ladder) => {
                self.ladder = ladder;
                self.transition(GridState::Running);
                Ok(())
            }
            Err(e) => {
                self.halt(format!("ladder construction failed: {e}"));
                Ok(())
            }
        }
    }

    /// ATR-derived spacing when enabled and ready, configured spacing
    /// otherwise.
    fn effective_spacing(&self, inputs: &CycleInputs) -> f64 {
        if !self.cfg.use_dynamic_spacing {
            return self.allocation.spacing_fraction;
        }
        match latest_atr_fraction(&inputs.klines, self.cfg.atr_period) {
            Some(atr_fraction) => {
                let dynamic = self.cfg.atr_multiplier * atr_fraction;
                dynamic.max(self.cfg.min_spacing_fraction)
            }
            // ATR not ready: fall back to the configured spacing.
            None => self.allocation.spacing_fraction,
        }
    }

    fn build_intended(&self, center: f64) -> Result<Ladder, crate::grid::ladder::LadderError> {
        build_ladder(&LadderParams {
            meta: &self.meta,
            center,
            spacing_fraction: self.spacing,
            grid_levels: self.levels,
            direction_bias: self.bias,
            capital: self.allocation.allocated_usd,
            target_fraction: self.target_fraction,
            min_levels: self.cfg.min_levels,
        })
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(
        &mut self,
        inputs: &CycleInputs,
        action: TuneAction,
    ) -> Result<CycleReport, ExchangeError> {
        let mut report = CycleReport::default();

        match self.state {
            GridState::Halted => return Ok(report),
            GridState::Initializing => {
                self.initialize(inputs).await?;
                if self.state != GridState::Running {
                    return Ok(report);
                }
            }
            GridState::Flattening => {
                self.flatten(true, inputs).await?;
                return Ok(report);
            }
            GridState::Running | GridState::Recentering => {}
        }

        match self.cycle_inner(inputs, action, &mut report).await {
            Ok(()) => {
                self.consecutive_failures = 0;
                Ok(report)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                warn!(
                    symbol = %self.meta.symbol,
                    failures = self.consecutive_failures,
                    error = %e,
                    "grid cycle failed"
                );
                if self.consecutive_failures >= self.cfg.max_failed_cycles {
                    self.halt(format!(
                        "{} consecutive failed cycles: {e}",
                        self.consecutive_failures
                    ));
                }
                Err(e)
            }
        }
    }

    async fn cycle_inner(
        &mut self,
        inputs: &CycleInputs,
        action: TuneAction,
        report: &mut CycleReport,
    ) -> Result<(), ExchangeError> {
        let mark = inputs.mark;
        self.position.update_mark(mark);

        let open_orders = self
            .exchange
            .open_orders(&self.meta.symbol, self.meta.venue)
            .await?;
        let open_ids: HashSet<u64> = open_orders.iter().map(|o| o.order_id).collect();

        // --- 1. Fill detection --------------------------------------------------
        report.fills = self.detect_and_apply_fills(&open_ids, inputs).await?;

        // --- 2. TP/SL -----------------------------------------------------------
        if self.check_tp_sl(mark) {
            report.tp_sl_triggered = true;
            self.transition(GridState::Flattening);
            self.close_position_market(mark, inputs.timestamp_ms).await?;
            self.cancel_all().await?;
            self.rebuild_around(mark)?;
            self.transition(GridState::Running);
        }
        // --- 3. Recenter --------------------------------------------------------
        else if self.needs_recenter(mark) {
            report.recentered = true;
            self.transition(GridState::Recentering);
            info!(
                symbol = %self.meta.symbol,
                old_center = self.ladder.center_price,
                new_center = mark,
                "recentering ladder"
            );
            self.rebuild_around(mark)?;
            self.transition(GridState::Running);
        }

        // --- 4. Tuning action ---------------------------------------------------
        report.action_applied = self.apply_action(action, mark);

        // --- 5. Reconcile -------------------------------------------------------
        let (cancelled, placed) = self.reconcile(mark).await?;
        report.cancelled = cancelled;
        report.placed = placed;

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fill handling
    // -------------------------------------------------------------------------

    /// Detect fills since the last cycle. The user-trade stream is the
    /// preferred source; when it is unavailable the open-order snapshot diff
    /// stands in.
    async fn detect_and_apply_fills(
        &mut self,
        open_ids: &HashSet<u64>,
        inputs: &CycleInputs,
    ) -> Result<usize, ExchangeError> {
        let mut fills: Vec<(u64, OrderSide, f64, f64)> = Vec::new(); // (order_id, side, qty, price)

        match self
            .exchange
            .my_trades(&self.meta.symbol, self.meta.venue, Some(self.last_trade_id))
            .await
        {
            Ok(trades) => {
                for trade in trades {
                    self.last_trade_id = self.last_trade_id.max(trade.trade_id);
                    // Only ladder orders count as grid fills here.
                    if self.ladder.level_by_order(trade.order_id).is_some() {
                        fills.push((trade.order_id, trade.side, trade.qty, trade.price));
                    }
                }
            }
            Err(e) if e.is_transient() => {
                // Fallback: a ladder order that vanished from the open set
                // was filled at its level price.
                debug!(symbol = %self.meta.symbol, error = %e, "trade stream unavailable, diffing open orders");
                for level in &self.ladder.levels {
                    if let Some(order_id) = level.order_id {
                        if !open_ids.contains(&order_id) {
                            fills.push((order_id, level.side, level.qty, level.price));
                        }
                    }
                }
            }
            Err(e) => return Err(e),
        }

        let count = fills.len();
        for (order_id, side, qty, price) in fills {
            self.apply_grid_fill(order_id, side, qty, price, inputs.timestamp_ms);
        }
        Ok(count)
    }

    /// Fold one grid fill into position/journal and schedule the mirror.
    fn apply_grid_fill(
        &mut self,
        order_id: u64,
        side: OrderSide,
        qty: f64,
        price: f64,
        timestamp_ms: i64,
    ) {
        let realized = self.position.apply_fill(side, qty, price);
        self.fills_total += 1;
        self.journal.push(TradeRecord {
            timestamp_ms,
            symbol: self.meta.symbol.clone(),
            side,
            price,
            qty,
            realized_pnl: realized,
            source: TradeSource::Grid,
        });

        info!(
            symbol = %self.meta.symbol,
            side = %side,
            price,
            qty,
            realized,
            position = %self.position.side,
            "grid fill"
        );

        // Drop the filled level.
        self.ladder.levels.retain(|l| l.order_id != Some(order_id));

        self.refresh_exit_marks();
        self.schedule_mirror(side.opposite());
    }

    /// Recompute TP/SL marks from the current weighted entry.
    fn refresh_exit_marks(&mut self) {
        if self.position.is_flat() {
            return;
        }
        let sign = self.position.side_sign();
        let entry = self.position.entry_price;
        self.position.tp_price = Some(
            self.meta
                .round_price_to_tick(entry * (1.0 + self.cfg.tp_fraction * sign)),
        );
        self.position.sl_price = Some(
            self.meta
                .round_price_to_tick(entry * (1.0 - self.cfg.sl_fraction * sign)),
        );
    }

    /// Add the mirror level on `side`, one spacing inside the innermost
    /// resting level of that side.
    fn schedule_mirror(&mut self, side: OrderSide) {
        let price = self.ladder.mirror_price(&self.meta, side);
        if price <= 0.0 {
            return;
        }
        // Never stack two levels on the same price.
        if self
            .ladder
            .levels
            .iter()
            .any(|l| (l.price - price).abs() < self.meta.tick_size / 2.0)
        {
            return;
        }

        let per_level = self.allocation.allocated_usd / self.levels.max(1) as f64;
        match size_order(&self.meta, per_level, price, self.target_fraction) {
            Ok(qty) => {
                self.ladder.levels.push(GridLevel {
                    price,
                    side,
                    qty,
                    order_id: None,
                });
                self.ladder
                    .levels
                    .sort_by(|a, b| a.price.total_cmp(&b.price));
                debug!(symbol = %self.meta.symbol, side = %side, price, qty, "mirror level scheduled");
            }
            Err(e) => {
                debug!(symbol = %self.meta.symbol, price, error = %e, "mirror level skipped by sizer")
            }
        }
    }

    // -------------------------------------------------------------------------
    // TP/SL and recentering
    // -------------------------------------------------------------------------

    fn check_tp_sl(&self, mark: f64) -> bool {
        if self.position.is_flat() {
            return false;
        }
        let long = self.position.side_sign() > 0.0;
        if let Some(tp) = self.position.tp_price {
            if (long && mark >= tp) || (!long && mark <= tp) {
                info!(symbol = %self.meta.symbol, mark, tp, "take-profit crossed");
                return true;
            }
        }
        if let Some(sl) = self.position.sl_price {
            if (long && mark <= sl) || (!long && mark >= sl) {
                info!(symbol = %self.meta.symbol, mark, sl, "stop-loss crossed");
                return true;
            }
        }
        false
    }

    fn needs_recenter(&self, mark: f64) -> bool {
        if self.ladder.levels.is_empty() {
            return false;
        }
        if self.ladder.drift_levels(mark) > self.cfg.recenter_threshold_levels {
            return true;
        }
        // One side swept bare while the other still rests.
        let buys = self.ladder.buys().count();
        let sells = self.ladder.sells().count();
        (buys == 0) != (sells == 0)
    }

    /// Close the full position with a market order and journal the exit.
    async fn close_position_market(
        &mut self,
        mark: f64,
        timestamp_ms: i64,
    ) -> Result<(), ExchangeError> {
        if self.position.is_flat() {
            return Ok(());
        }
        let side = match self.position.side_sign() > 0.0 {
            true => OrderSide::Sell,
            false => OrderSide::Buy,
        };
        let qty = self.position.size;
        let source = match self.position.tp_price {
            Some(tp)
                if (self.position.side_sign() > 0.0 && mark >= tp)
                    || (self.position.side_sign() < 0.0 && mark <= tp) =>
            {
                TradeSource::TakeProfit
            }
            _ => TradeSource::StopLoss,
        };

        let mut spec = OrderSpec::market(&self.meta.symbol, self.meta.venue, side, qty);
        spec.reduce_only = true;
        let ack = self.exchange.place_order(&spec).await?;
        let fill_price = if ack.price > 0.0 { ack.price } else { mark };

        // The close lands on the trade stream too; advance past it.
        if let Ok(trades) = self
            .exchange
            .my_trades(&self.meta.symbol, self.meta.venue, Some(self.last_trade_id))
            .await
        {
            self.last_trade_id = trades
                .iter()
                .map(|t| t.trade_id)
                .max()
                .unwrap_or(self.last_trade_id);
        }

        let realized = self.position.apply_fill(side, qty, fill_price);
        self.fills_total += 1;
        self.journal.push(TradeRecord {
            timestamp_ms,
            symbol: self.meta.symbol.clone(),
            side,
            price: fill_price,
            qty,
            realized_pnl: realized,
            source,
        });

        info!(
            symbol = %self.meta.symbol,
            side = %side,
            qty,
            price = fill_price,
            realized,
            source = %source,
            "position closed by exit rule"
        );
        Ok(())
    }

    /// Replace the intended ladder with a fresh one centered on `center`.
    /// Existing live orders are carried over where price and side survive.
    fn rebuild_around(&mut self, center: f64) -> Result<(), ExchangeError> {
        match self.build_intended(center) {
            Ok(mut fresh) => {
                Self::adopt_live_orders(&mut fresh, &self.ladder);
                self.ladder = fresh;
                Ok(())
            }
            Err(e) => {
                self.halt(format!("rebuild failed: {e}"));
                Ok(())
            }
        }
    }

    fn adopt_live_orders(fresh: &mut Ladder, old: &Ladder) {
        for level in &mut fresh.levels {
            if let Some(previous) = old.levels.iter().find(|l| {
                l.side == level.side && (l.price - level.price).abs() < 1e-9 && l.order_id.is_some()
            }) {
                level.order_id = previous.order_id;
                level.qty = previous.qty;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tuning actions
    // -------------------------------------------------------------------------

    /// Apply a coordinator action. Every candidate parameter set is validated
    /// by building the would-be ladder; an invalid action is ignored.
    fn apply_action(&mut self, action: TuneAction, mark: f64) -> bool {
        if action == TuneAction::Hold {
            return false;
        }

        let mut levels = self.levels;
        let mut spacing = self.spacing;
        let mut bias = self.bias;
        let mut fraction = self.target_fraction;
        let mut center = self.ladder.center_price;

        match action {
            TuneAction::Hold => unreachable!(),
            TuneAction::MoreLevels => {
                levels = ((levels as f64 * 1.2).round() as usize)
                    .clamp(self.cfg.min_levels, self.cfg.max_levels);
            }
            TuneAction::FewerLevels => {
                levels = ((levels as f64 * 0.8).round() as usize)
                    .clamp(self.cfg.min_levels, self.cfg.max_levels);
            }
            TuneAction::WiderSpacing => spacing *= 1.25,
            TuneAction::TighterSpacing => {
                spacing = (spacing * 0.75).max(self.cfg.min_spacing_fraction);
            }
            TuneAction::BiasBullish => {
                center *= 1.0 + spacing / 2.0;
                bias = 1;
            }
            TuneAction::BiasBearish => {
                center *= 1.0 - spacing / 2.0;
                bias = -1;
            }
            TuneAction::ResetDefaults => {
                levels = self.allocation.grid_levels;
                spacing = self.allocation.spacing_fraction;
                bias = 0;
                fraction = self.allocation.position_cap_fraction();
                center = mark;
            }
            TuneAction::AggressiveBullish => {
                levels = ((levels as f64 * 1.2).round() as usize)
                    .clamp(self.cfg.min_levels, self.cfg.max_levels);
                center *= 1.0 + spacing / 2.0;
                bias = 1;
                fraction = (fraction * 1.25).min(1.0);
            }
            TuneAction::AggressiveBearish => {
                levels = ((levels as f64 * 1.2).round() as usize)
                    .clamp(self.cfg.min_levels, self.cfg.max_levels);
                center *= 1.0 - spacing / 2.0;
                bias = -1;
                fraction = (fraction * 1.25).min(1.0);
            }
        }

        let candidate = build_ladder(&LadderParams {
            meta: &self.meta,
            center,
            spacing_fraction: spacing,
            grid_levels: levels,
            direction_bias: bias,
            capital: self.allocation.allocated_usd,
            target_fraction: fraction,
            min_levels: self.cfg.min_levels,
        });

        match candidate {
            Ok(mut fresh) => {
                Self::adopt_live_orders(&mut fresh, &self.ladder);
                self.levels = levels;
                self.spacing = spacing;
                self.bias = bias;
                self.target_fraction = fraction;
                self.ladder = fresh;
                info!(
                    symbol = %self.meta.symbol,
                    action = ?action,
                    levels,
                    spacing,
                    bias,
                    "tuning action applied"
                );
                true
            }
            Err(e) => {
                warn!(symbol = %self.meta.symbol, action = ?action, error = %e, "tuning action ignored (invalid)");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Bring live orders in line with the intended ladder: keep matches,
    /// cancel strays, place missing levels. Cancels run before places; both
    /// are bounded by the per-cycle budget, leftovers roll into the next
    /// cycle.
    async fn reconcile(&mut self, mark: f64) -> Result<(usize, usize), ExchangeError> {
        let open_orders = self
            .exchange
            .open_orders(&self.meta.symbol, self.meta.venue)
            .await?;

        // Adopt live orders that match an intended level.
        for order in &open_orders {
            let matched = self.ladder.levels.iter_mut().find(|l| {
                l.side == order.side
                    && (l.price - order.price).abs() < self.meta.tick_size / 2.0
            });
            if let Some(level) = matched {
                if level.order_id.is_none() {
                    level.order_id = Some(order.order_id);
                }
            }
        }

        let intended_ids: HashSet<u64> = self.live_order_ids().into_iter().collect();
        let budget = self.cfg.order_budget_per_cycle;

        // Cancels first so the invariant "two live levels one tick apart"
        // survives recenters.
        let mut cancelled = 0usize;
        for order in &open_orders {
            if cancelled >= budget {
                break;
            }
            if !intended_ids.contains(&order.order_id) {
                match self
                    .exchange
                    .cancel_order(&self.meta.symbol, self.meta.venue, order.order_id)
                    .await
                {
                    Ok(()) => cancelled += 1,
                    Err(e) if !e.is_transient() => {
                        // Already gone (e.g. filled in flight) — not fatal.
                        debug!(order_id = order.order_id, error = %e, "cancel rejected");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Position cap: stop adding exposure past max_position_usd.
        let exposure = self.position.size * mark;
        let exposure_capped = exposure >= self.allocation.max_position_usd;
        let growing_side = match self.position.side_sign() {
            s if s > 0.0 => Some(OrderSide::Buy),
            s if s < 0.0 => Some(OrderSide::Sell),
            _ => None,
        };

        let mut placed = 0usize;
        for idx in 0..self.ladder.levels.len() {
            if placed >= budget {
                break;
            }
            let level = self.ladder.levels[idx].clone();
            if level.order_id.is_some() {
                continue;
            }
            if exposure_capped && growing_side == Some(level.side) {
                continue;
            }
            // A resting limit must sit on the passive side of the mark.
            let crosses = match level.side {
                OrderSide::Buy => level.price >= mark,
                OrderSide::Sell => level.price <= mark,
            };
            if crosses {
                continue;
            }

            let spec = OrderSpec::limit(
                &self.meta.symbol,
                self.meta.venue,
                level.side,
                level.qty,
                level.price,
            );
            match self.exchange.place_order(&spec).await {
                Ok(ack) => {
                    self.ladder.levels[idx].order_id = Some(ack.order_id);
                    placed += 1;
                }
                Err(e) if !e.is_transient() => {
                    // Permanent rejection: drop the level and adapt.
                    warn!(
                        symbol = %self.meta.symbol,
                        price = level.price,
                        error = %e,
                        "level permanently rejected, dropping"
                    );
                    self.ladder.levels.remove(idx);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if cancelled > 0 || placed > 0 {
            info!(symbol = %self.meta.symbol, cancelled, placed, "reconcile pass");
        }
        Ok((cancelled, placed))
    }

    // -------------------------------------------------------------------------
    // Flattening and halting
    // -------------------------------------------------------------------------

    /// Cancel everything and optionally close the position. Terminal: the
    /// engine ends Halted.
    pub async fn flatten(
        &mut self,
        close_position: bool,
        inputs: &CycleInputs,
    ) -> Result<(), ExchangeError> {
        self.transition(GridState::Flattening);
        self.cancel_all().await?;
        if close_position && !self.position.is_flat() {
            self.close_position_market(inputs.mark, inputs.timestamp_ms)
                .await?;
        }
        self.halt("flattened".to_string());
        Ok(())
    }

    /// Request flattening from outside (critical risk breach). Takes effect
    /// at the top of the next cycle.
    pub fn request_flatten(&mut self) {
        if self.state != GridState::Halted {
            self.transition(GridState::Flattening);
        }
    }

    async fn cancel_all(&mut self) -> Result<(), ExchangeError> {
        for order_id in self.live_order_ids() {
            match self
                .exchange
                .cancel_order(&self.meta.symbol, self.meta.venue, order_id)
                .await
            {
                Ok(()) => {}
                Err(e) if !e.is_transient() => {
                    debug!(order_id, error = %e, "cancel-all: order already gone");
                }
                Err(e) => return Err(e),
            }
        }
        for level in &mut self.ladder.levels {
            level.order_id = None;
        }
        Ok(())
    }

    fn halt(&mut self, reason: String) {
        warn!(symbol = %self.meta.symbol, reason = %reason, "grid engine halted");
        self.halt_reason = Some(reason);
        self.transition(GridState::Halted);
    }

    fn transition(&mut self, next: GridState) {
        if self.state != next {
            info!(symbol = %self.meta.symbol, from = %self.state, to = %next, "grid state transition");
            self.state = next;
        }
    }
}

impl std::fmt::Debug for GridEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridEngine")
            .field("symbol", &self.meta.symbol)
            .field("state", &self.state)
            .field("levels", &self.ladder.levels.len())
            .field("position", &self.position.side)
            .finish()
    }
}
