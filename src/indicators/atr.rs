// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR_0 = SMA of the first `period` TR values
// ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::exchange::Kline;

/// Most recent ATR value over `klines` (oldest first).
///
/// `None` when the period is zero, there are fewer than `period + 1` bars, or
/// any intermediate value is non-finite.
pub fn latest_atr(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(klines.len() - 1);
    for window in klines.windows(2) {
        let prev_close = window[0].close;
        let bar = &window[1];
        let tr = (bar.high - bar.low)
            .max((bar.high - prev_close).abs())
            .max((bar.low - prev_close).abs());
        tr_values.push(tr);
    }

    if tr_values.len() < period {
        return None;
    }

    let period_f = period as f64;
    let mut atr: f64 = tr_values[..period].iter().sum::<f64>() / period_f;

    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    atr.is_finite().then_some(atr)
}

/// ATR expressed as a fraction of the latest close. Handy for comparing
/// volatility across symbols with different price scales.
pub fn latest_atr_fraction(klines: &[Kline], period: usize) -> Option<f64> {
    let atr = latest_atr(klines, period)?;
    let close = klines.last()?.close;
    (close > 0.0).then(|| atr / close)
}
