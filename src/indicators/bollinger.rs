// =============================================================================
// Bollinger Bands and %B
// =============================================================================
//
// middle = SMA(period), upper/lower = middle ± k·σ.
// %B = (price - lower) / (upper - lower): 0 at the lower band, 1 at the upper,
// outside [0, 1] when price escapes the bands.
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// (upper - lower) / middle — normalised band width.
    pub width: f64,
    /// %B of the latest close.
    pub percent_b: f64,
}

/// Bollinger bands over the trailing `period` closes with `num_std` sigmas.
///
/// `None` when fewer than `period` closes are available or the window is
/// degenerate (zero middle band).
pub fn latest_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle;

    let last = *window.last()?;
    let band_span = upper - lower;
    let percent_b = if band_span > 0.0 {
        (last - lower) / band_span
    } else {
        0.5 // zero-width bands: price sits on the middle by definition
    };

    (width.is_finite() && percent_b.is_finite()).then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
        percent_b,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_on_short_input() {
        assert!(latest_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
        assert!(latest_bollinger(&[1.0; 30], 0, 2.0).is_none());
    }

    #[test]
    fn bands_bracket_the_mean() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = latest_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn flat_window_has_neutral_percent_b() {
        let closes = vec![50.0; 25];
        let bb = latest_bollinger(&closes, 20, 2.0).unwrap();
        assert!((bb.percent_b - 0.5).abs() < 1e-9);
        assert!(bb.width.abs() < 1e-12);
    }

    #[test]
    fn close_at_upper_band_reads_one() {
        // Rising series: last close sits near the top of the window.
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = latest_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b > 0.5);
        assert!(bb.percent_b <= 1.5);
    }

    #[test]
    fn falling_close_reads_below_half() {
        let closes: Vec<f64> = (1..=20).rev().map(|x| x as f64).collect();
        let bb = latest_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.percent_b < 0.5);
    }
}
