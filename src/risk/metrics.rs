// =============================================================================
// Risk metrics — rolling windows and the portfolio math on top of them
// =============================================================================
//
// Per symbol: bounded windows of price, cumulative PnL, and notional. On top:
// parametric VaR (95% / 1-day), naive Sharpe, max drawdown from peak PnL,
// pairwise log-return correlation, correlation-matrix portfolio VaR, and a
// Herfindahl-based diversification score.
// =============================================================================

use std::collections::{HashMap, VecDeque};

/// z-score for one-sided 95% confidence.
const Z_95: f64 = 1.645;
/// Annualisation factor for the naive Sharpe (daily observations assumed).
const SHARPE_ANNUALISATION: f64 = 15.874; // sqrt(252)

#[derive(Debug, Clone, Default)]
struct SymbolWindow {
    prices: VecDeque<f64>,
    cumulative_pnl: VecDeque<f64>,
    notionals: VecDeque<f64>,
}

#[derive(Debug)]
pub struct RiskMetrics {
    windows: HashMap<String, SymbolWindow>,
    window_len: usize,
}

impl RiskMetrics {
    pub fn new(window_len: usize) -> Self {
        Self {
            windows: HashMap::new(),
            window_len: window_len.max(2),
        }
    }

    /// Push one observation for `symbol`.
    pub fn update(&mut self, symbol: &str, price: f64, cumulative_pnl: f64, notional: f64) {
        let window = self.windows.entry(symbol.to_string()).or_default();
        push_bounded(&mut window.prices, price, self.window_len);
        push_bounded(&mut window.cumulative_pnl, cumulative_pnl, self.window_len);
        push_bounded(&mut window.notionals, notional, self.window_len);
    }

    pub fn remove(&mut self, symbol: &str) {
        self.windows.remove(symbol);
    }

    pub fn observation_count(&self, symbol: &str) -> usize {
        self.windows.get(symbol).map_or(0, |w| w.prices.len())
    }

    // -------------------------------------------------------------------------
    // Per-symbol statistics
    // -------------------------------------------------------------------------

    fn log_returns(&self, symbol: &str) -> Vec<f64> {
        let Some(window) = self.windows.get(symbol) else {
            return Vec::new();
        };
        window
            .prices
            .iter()
            .zip(window.prices.iter().skip(1))
            .filter(|(prev, _)| **prev > 0.0)
            .map(|(prev, next)| (next / prev).ln())
            .collect()
    }

    /// Parametric VaR at 95%/1-day as a positive loss fraction of notional.
    /// `None` until at least 10 returns have accumulated.
    pub fn value_at_risk(&self, symbol: &str) -> Option<f64> {
        let returns = self.log_returns(symbol);
        if returns.len() < 10 {
            return None;
        }
        let (mean, std) = mean_std(&returns);
        Some((Z_95 * std - mean).max(0.0))
    }

    /// Naive annualised Sharpe over the return window.
    pub fn sharpe(&self, symbol: &str) -> Option<f64> {
        let returns = self.log_returns(symbol);
        if returns.len() < 10 {
            return None;
        }
        let (mean, std) = mean_std(&returns);
        if std <= 0.0 {
            return None;
        }
        Some(mean / std * SHARPE_ANNUALISATION)
    }

    /// Max drawdown from peak cumulative PnL, normalised by the peak notional.
    /// Returned as a positive fraction; 0.0 when PnL never retreated.
    pub fn max_drawdown(&self, symbol: &str) -> Option<f64> {
        let window = self.windows.get(symbol)?;
        if window.cumulative_pnl.len() < 2 {
            return None;
        }

        let base = window
            .notionals
            .iter()
            .copied()
            .fold(f64::MIN, f64::max)
            .max(1e-9);

        let mut peak = f64::MIN;
        let mut worst = 0.0_f64;
        for &pnl in &window.cumulative_pnl {
            peak = peak.max(pnl);
            worst = worst.max(peak - pnl);
        }
        Some(worst / base)
    }

    /// Pearson correlation of log returns between two symbols over the
    /// overlapping window.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let ra = self.log_returns(a);
        let rb = self.log_returns(b);
        let n = ra.len().min(rb.len());
        if n < 10 {
            return None;
        }
        let ra = &ra[ra.len() - n..];
        let rb = &rb[rb.len() - n..];

        let (mean_a, std_a) = mean_std(ra);
        let (mean_b, std_b) = mean_std(rb);
        if std_a <= 0.0 || std_b <= 0.0 {
            return None;
        }

        let cov = ra
            .iter()
            .zip(rb.iter())
            .map(|(x, y)| (x - mean_a) * (y - mean_b))
            .sum::<f64>()
            / n as f64;

        Some((cov / (std_a * std_b)).clamp(-1.0, 1.0))
    }

    // -------------------------------------------------------------------------
    // Portfolio statistics
    // -------------------------------------------------------------------------

    /// Portfolio VaR via the correlation matrix:
    ///   1.645 * sqrt( Σ_ij w_i w_j σ_i σ_j ρ_ij )
    /// Weights are normalised internally. Pairs lacking history fall back to
    /// full correlation (the conservative assumption).
    pub fn portfolio_var(&self, weights: &HashMap<String, f64>) -> Option<f64> {
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return None;
        }

        let symbols: Vec<&String> = weights.keys().collect();
        let mut sigmas = HashMap::new();
        for symbol in &symbols {
            let returns = self.log_returns(symbol);
            if returns.len() < 10 {
                return None;
            }
            let (_, std) = mean_std(&returns);
            sigmas.insert((*symbol).clone(), std);
        }

        let mut variance = 0.0;
        for a in &symbols {
            for b in &symbols {
                let wa = weights[*a] / total;
                let wb = weights[*b] / total;
                let rho = if a == b {
                    1.0
                } else {
                    self.correlation(a, b).unwrap_or(1.0)
                };
                variance += wa * wb * sigmas[*a] * sigmas[*b] * rho;
            }
        }

        Some(Z_95 * variance.max(0.0).sqrt())
    }

    /// Herfindahl-based diversification score: 1 - Σ w_i², in [0, 1).
    /// 0 means everything in one symbol.
    pub fn diversification_score(weights: &HashMap<String, f64>) -> f64 {
        let total: f64 = weights.values().sum();
        if total <= 0.0 {
            return 0.0;
        }
        let herfindahl: f64 = weights.values().map(|w| (w / total).powi(2)).sum();
        (1.0 - herfindahl).max(0.0)
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, cap: usize) {
    window.push_back(value);
    while window.len() > cap {
        window.pop_front();
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill_prices(metrics: &mut RiskMetrics, symbol: &str, prices: &[f64]) {
        for (i, &p) in prices.iter().enumerate() {
            metrics.update(symbol, p, i as f64, 1_000.0);
        }
    }

    #[test]
    fn windows_are_bounded() {
        let mut metrics = RiskMetrics::new(5);
        for i in 0..20 {
            metrics.update("BTCUSDT", 100.0 + i as f64, 0.0, 0.0);
        }
        assert_eq!(metrics.observation_count("BTCUSDT"), 5);
    }

    #[test]
    fn var_requires_history() {
        let mut metrics = RiskMetrics::new(100);
        fill_prices(&mut metrics, "BTCUSDT", &[100.0, 101.0, 102.0]);
        assert!(metrics.value_at_risk("BTCUSDT").is_none());
    }

    #[test]
    fn var_grows_with_volatility() {
        let mut calm = RiskMetrics::new(100);
        let mut wild = RiskMetrics::new(100);

        let calm_prices: Vec<f64> = (0..50).map(|i| 100.0 + (i % 2) as f64 * 0.1).collect();
        let wild_prices: Vec<f64> = (0..50).map(|i| 100.0 + (i % 2) as f64 * 10.0).collect();
        fill_prices(&mut calm, "X", &calm_prices);
        fill_prices(&mut wild, "X", &wild_prices);

        let calm_var = calm.value_at_risk("X").unwrap();
        let wild_var = wild.value_at_risk("X").unwrap();
        assert!(wild_var > calm_var);
        assert!(calm_var >= 0.0);
    }

    #[test]
    fn drawdown_tracks_peak_retreat() {
        let mut metrics = RiskMetrics::new(100);
        // Cumulative PnL: climbs to 100, falls back to 40 — drawdown 60.
        let pnls = [0.0, 50.0, 100.0, 70.0, 40.0];
        for (i, &pnl) in pnls.iter().enumerate() {
            metrics.update("X", 100.0 + i as f64, pnl, 1_000.0);
        }
        let dd = metrics.max_drawdown("X").unwrap();
        assert!((dd - 0.06).abs() < 1e-9); // 60 / 1000
    }

    #[test]
    fn monotone_pnl_has_zero_drawdown() {
        let mut metrics = RiskMetrics::new(100);
        for i in 0..10 {
            metrics.update("X", 100.0, i as f64 * 10.0, 1_000.0);
        }
        assert_eq!(metrics.max_drawdown("X").unwrap(), 0.0);
    }

    #[test]
    fn identical_series_fully_correlated() {
        let mut metrics = RiskMetrics::new(100);
        let prices: Vec<f64> = (0..30).map(|i| 100.0 * (1.0 + (i as f64 * 0.7).sin() * 0.01)).collect();
        fill_prices(&mut metrics, "A", &prices);
        fill_prices(&mut metrics, "B", &prices);
        let rho = metrics.correlation("A", "B").unwrap();
        assert!((rho - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mirrored_series_anticorrelated() {
        let mut metrics = RiskMetrics::new(100);
        let up: Vec<f64> = (0..30).map(|i| 100.0 * (1.0 + (i as f64 * 0.7).sin() * 0.01)).collect();
        let down: Vec<f64> = up.iter().map(|p| 200.0 - p).collect();
        fill_prices(&mut metrics, "A", &up);
        fill_prices(&mut metrics, "B", &down);
        let rho = metrics.correlation("A", "B").unwrap();
        assert!(rho < -0.9);
    }

    #[test]
    fn portfolio_var_between_bounds() {
        let mut metrics = RiskMetrics::new(100);
        let a: Vec<f64> = (0..40).map(|i| 100.0 * (1.0 + (i as f64 * 0.9).sin() * 0.02)).collect();
        let b: Vec<f64> = (0..40).map(|i| 50.0 * (1.0 + (i as f64 * 0.4).cos() * 0.02)).collect();
        fill_prices(&mut metrics, "A", &a);
        fill_prices(&mut metrics, "B", &b);

        let mut weights = HashMap::new();
        weights.insert("A".to_string(), 500.0);
        weights.insert("B".to_string(), 500.0);
        let pvar = metrics.portfolio_var(&weights).unwrap();

        let var_a = metrics.value_at_risk("A").unwrap();
        let var_b = metrics.value_at_risk("B").unwrap();
        // Diversified VaR cannot exceed the sum of standalone VaRs by much
        // (mean terms aside), and must be positive for volatile inputs.
        assert!(pvar > 0.0);
        assert!(pvar <= var_a + var_b + 0.05);
    }

    #[test]
    fn diversification_score_shapes() {
        let mut concentrated = HashMap::new();
        concentrated.insert("A".to_string(), 1_000.0);
        assert_eq!(RiskMetrics::diversification_score(&concentrated), 0.0);

        let mut spread = HashMap::new();
        for s in ["A", "B", "C", "D"] {
            spread.insert(s.to_string(), 250.0);
        }
        let score = RiskMetrics::diversification_score(&spread);
        assert!((score - 0.75).abs() < 1e-9);

        assert_eq!(RiskMetrics::diversification_score(&HashMap::new()), 0.0);
    }
}
