// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// Quantifies trend strength regardless of direction:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing over `period` of all three.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100, likewise -DI.
//   4. DX = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder's smoothed average of DX.
//
// ADX > 25 reads as trending, < 20 as ranging.
// =============================================================================

use crate::exchange::Kline;

/// Most recent ADX value over `klines` (oldest first).
///
/// Needs at least `2 * period + 1` bars: `period` for the initial smoothing
/// and another `period` DX values to seed the ADX average.
pub fn latest_adx(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < 2 * period + 1 {
        return None;
    }

    let n = klines.len();
    let bar_count = n - 1;

    let mut plus_dm = Vec::with_capacity(bar_count);
    let mut minus_dm = Vec::with_capacity(bar_count);
    let mut tr_vals = Vec::with_capacity(bar_count);

    for i in 1..n {
        let bar = &klines[i];
        let prev = &klines[i - 1];

        let tr = (bar.high - bar.low)
            .max((bar.high - prev.close).abs())
            .max((bar.low - prev.close).abs());

        let up_move = bar.high - prev.high;
        let down_move = prev.low - bar.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
        tr_vals.push(tr);
    }

    let period_f = period as f64;
    let mut smooth_plus: f64 = plus_dm[..period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[..period].iter().sum();
    let mut smooth_tr: f64 = tr_vals[..period].iter().sum();

    let mut dx_values = Vec::with_capacity(bar_count - period + 1);
    dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);

    for i in period..bar_count {
        smooth_plus = smooth_plus - smooth_plus / period_f + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period_f + minus_dm[i];
        smooth_tr = smooth_tr - smooth_tr / period_f + tr_vals[i];
        dx_values.push(compute_dx(smooth_plus, smooth_minus, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: Wilder's smoothed average of DX.
    let mut adx: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
    }

    adx.is_finite().then_some(adx)
}

fn compute_dx(smooth_plus: f64, smooth_minus: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr <= 0.0 {
        return Some(0.0); // no range at all — flat market
    }
    let plus_di = smooth_plus / smooth_tr * 100.0;
    let minus_di = smooth_minus / smooth_tr * 100.0;
    let di_sum = plus_di + minus_di;
    let dx = if di_sum > 0.0 {
        (plus_di - minus_di).abs() / di_sum * 100.0
    } else {
        0.0
    };
    dx.is_finite().then_some(dx)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::atr::tests::kline;

    #[test]
    fn not_ready_cases() {
        let bars = vec![kline(100.0, 101.0, 99.0, 100.0); 20];
        assert!(latest_adx(&bars, 0).is_none());
        assert!(latest_adx(&bars, 14).is_none()); // needs 29 bars
    }

    #[test]
    fn strong_trend_scores_high() {
        // Steady uptrend: every bar makes a higher high and higher low.
        let bars: Vec<Kline> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                kline(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();
        let adx = latest_adx(&bars, 14).unwrap();
        assert!(adx > 25.0, "expected trending ADX, got {adx}");
    }

    #[test]
    fn choppy_market_scores_low() {
        // Alternating up/down bars with no net direction.
        let bars: Vec<Kline> = (0..60)
            .map(|i| {
                let offset = if i % 2 == 0 { 1.0 } else { -1.0 };
                let base = 100.0 + offset;
                kline(base, base + 1.0, base - 1.0, base)
            })
            .collect();
        let adx = latest_adx(&bars, 14).unwrap();
        assert!(adx < 25.0, "expected ranging ADX, got {adx}");
    }

    #[test]
    fn flat_market_is_zero() {
        let bars = vec![kline(100.0, 100.0, 100.0, 100.0); 60];
        let adx = latest_adx(&bars, 14).unwrap();
        assert!(adx.abs() < 1e-9);
    }

    #[test]
    fn value_is_bounded() {
        let bars: Vec<Kline> = (0..80)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 15.0;
                kline(base, base + 2.0, base - 2.0, base + 0.5)
            })
            .collect();
        let adx = latest_adx(&bars, 14).unwrap();
        assert!((0.0..=100.0).contains(&adx));
    }
}
