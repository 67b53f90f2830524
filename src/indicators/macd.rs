// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow)
// Signal    = EMA(MACD line, signal_period)
// Histogram = MACD line - Signal
//
// Standard parameters 12/26/9 via `latest_macd_standard`.
// =============================================================================

use crate::indicators::ema::ema_series;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdValue {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Latest MACD value for the given periods, or `None` when the input cannot
/// cover `slow + signal` bars.
pub fn latest_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal_period: usize,
) -> Option<MacdValue> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }
    if closes.len() < slow + signal_period {
        return None;
    }

    let fast_series = ema_series(closes, fast);
    let slow_series = ema_series(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align: the slow series starts `slow - fast` elements later.
    let offset = slow - fast;
    let macd_line: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .filter_map(|(i, &s)| fast_series.get(i + offset).map(|&f| f - s))
        .collect();

    let signal_series = ema_series(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    (macd.is_finite() && signal.is_finite()).then_some(MacdValue {
        macd,
        signal,
        histogram,
    })
}

/// MACD with the conventional 12/26/9 parameters.
pub fn latest_macd_standard(closes: &[f64]) -> Option<MacdValue> {
    latest_macd(closes, 12, 26, 9)
}
