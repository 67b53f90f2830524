// =============================================================================
// Candlestick pattern scores
// =============================================================================
//
// Hand-rolled detection of the classic reversal patterns, reduced to a single
// signed score: each detected bullish pattern contributes positively, each
// bearish one negatively, high-confidence patterns count double. The final
// score is clamped to [-1, 1].
// =============================================================================

use crate::exchange::Kline;

#[derive(Debug, Clone, PartialEq)]
pub struct PatternScore {
    /// Net signal in [-1, 1]: positive bullish, negative bearish.
    pub score: f64,
    /// Names of the patterns detected on the latest bars.
    pub detected: Vec<&'static str>,
}

/// Body length of a bar.
fn body(k: &Kline) -> f64 {
    (k.close - k.open).abs()
}

fn is_bull(k: &Kline) -> bool {
    k.close > k.open
}

fn is_bear(k: &Kline) -> bool {
    k.close < k.open
}

fn upper_wick(k: &Kline) -> f64 {
    k.high - k.close.max(k.open)
}

fn lower_wick(k: &Kline) -> f64 {
    k.close.min(k.open) - k.low
}

fn range(k: &Kline) -> f64 {
    k.high - k.low
}

/// Score the candlestick patterns visible at the end of `klines`.
///
/// Needs at least 3 bars; fewer returns `None` (not ready).
pub fn latest_pattern_score(klines: &[Kline]) -> Option<PatternScore> {
    if klines.len() < 3 {
        return None;
    }

    let c = &klines[klines.len() - 1];
    let b = &klines[klines.len() - 2];
    let a = &klines[klines.len() - 3];

    let mut detected: Vec<&'static str> = Vec::new();
    let mut raw: f64 = 0.0;

    // --- Doji: tiny body relative to range -----------------------------------
    if range(c) > 0.0 && body(c) / range(c) < 0.1 {
        detected.push("doji");
        // Neutral on its own; no score contribution.
    }

    // --- Hammer: long lower wick, small upper wick, small body ---------------
    if range(c) > 0.0 && lower_wick(c) > 2.0 * body(c) && upper_wick(c) < body(c) {
        detected.push("hammer");
        raw += 1.0;
    }

    // --- Shooting star: mirror of the hammer ---------------------------------
    if range(c) > 0.0 && upper_wick(c) > 2.0 * body(c) && lower_wick(c) < body(c) {
        detected.push("shooting_star");
        raw -= 1.0;
    }

    // --- Engulfing: current body swallows the previous opposite body ---------
    if is_bull(c) && is_bear(b) && c.close > b.open && c.open < b.close && body(c) > body(b) {
        detected.push("bullish_engulfing");
        raw += 2.0; // high-confidence
    }
    if is_bear(c) && is_bull(b) && c.close < b.open && c.open > b.close && body(c) > body(b) {
        detected.push("bearish_engulfing");
        raw -= 2.0;
    }

    // --- Three white soldiers / three black crows ----------------------------
    if is_bull(a) && is_bull(b) && is_bull(c) && b.close > a.close && c.close > b.close {
        detected.push("three_white_soldiers");
        raw += 2.0;
    }
    if is_bear(a) && is_bear(b) && is_bear(c) && b.close < a.close && c.close < b.close {
        detected.push("three_black_crows");
        raw -= 2.0;
    }

    // --- Morning / evening star ----------------------------------------------
    let b_small = range(b) > 0.0 && body(b) / range(b) < 0.3;
    if is_bear(a) && b_small && is_bull(c) && c.close > (a.open + a.close) / 2.0 {
        detected.push("morning_star");
        raw += 2.0;
    }
    if is_bull(a) && b_small && is_bear(c) && c.close < (a.open + a.close) / 2.0 {
        detected.push("evening_star");
        raw -= 2.0;
    }

    Some(PatternScore {
        score: (raw / 4.0).clamp(-1.0, 1.0),
        detected,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kline(open: f64, high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn not_ready_under_three_bars() {
        let bars = vec![kline(1.0, 2.0, 0.5, 1.5); 2];
        assert!(latest_pattern_score(&bars).is_none());
    }

    #[test]
    fn hammer_is_bullish() {
        let bars = vec![
            kline(100.0, 101.0, 99.0, 100.5),
            kline(100.5, 101.0, 100.0, 100.2),
            // Long lower wick, close near the high.
            kline(100.0, 100.6, 96.0, 100.5),
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.detected.contains(&"hammer"));
        assert!(result.score > 0.0);
    }

    #[test]
    fn shooting_star_is_bearish() {
        let bars = vec![
            kline(100.0, 101.0, 99.0, 100.5),
            kline(100.5, 101.0, 100.0, 100.3),
            // Long upper wick, close near the low.
            kline(100.8, 105.0, 100.78, 100.9),
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.detected.contains(&"shooting_star"));
        assert!(result.score < 0.0);
    }

    #[test]
    fn three_white_soldiers_detected() {
        let bars = vec![
            kline(100.0, 102.0, 99.5, 101.5),
            kline(101.0, 103.5, 100.5, 103.0),
            kline(102.5, 105.0, 102.0, 104.5),
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.detected.contains(&"three_white_soldiers"));
        assert!(result.score > 0.0);
    }

    #[test]
    fn bearish_engulfing_detected() {
        let bars = vec![
            kline(100.0, 101.0, 99.0, 100.5),
            kline(100.0, 101.5, 99.8, 101.0), // bull bar
            kline(101.2, 101.4, 98.5, 99.0),  // bear bar engulfing it
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.detected.contains(&"bearish_engulfing"));
        assert!(result.score < 0.0);
    }

    #[test]
    fn score_is_clamped() {
        // Stacked bullish patterns cannot exceed 1.0.
        let bars = vec![
            kline(100.0, 102.0, 95.0, 101.5),
            kline(101.0, 103.5, 100.5, 103.0),
            kline(102.5, 105.0, 97.0, 104.8),
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.score <= 1.0);
        assert!(result.score >= -1.0);
    }

    #[test]
    fn doji_alone_is_neutral() {
        let bars = vec![
            kline(100.0, 101.0, 99.0, 100.2),
            kline(100.2, 101.0, 99.5, 100.4),
            // Open == close with symmetric wicks: doji without hammer shape.
            kline(100.0, 100.5, 99.5, 100.0),
        ];
        let result = latest_pattern_score(&bars).unwrap();
        assert!(result.detected.contains(&"doji"));
        assert_eq!(result.score, 0.0);
    }
}
