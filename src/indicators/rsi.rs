// =============================================================================
// Relative Strength Index (RSI) — Wilder's smoothing
// =============================================================================
//
// Averages are seeded with the SMA of the first `period` gains / losses,
// then smoothed:
//   avg = (prev_avg * (period - 1) + current) / period
//   RSI = 100 - 100 / (1 + avg_gain / avg_loss)
// =============================================================================

/// Most recent RSI value for `closes` over `period`.
///
/// Returns `None` when `period` is zero, fewer than `period + 1` closes are
/// available, or the computation turns non-finite.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0f64, 0.0f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;
    }

    let value = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_period_zero_or_short_input() {
        assert!(rsi(&[], 14).is_none());
        assert!(rsi(&[1.0, 2.0, 3.0], 0).is_none());
        let short: Vec<f64> = (1..=14).map(|x| x as f64).collect();
        assert!(rsi(&short, 14).is_none());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!((value - 100.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        let value = rsi(&closes, 14).unwrap();
        assert!(value.abs() < 1e-10);
    }

    #[test]
    fn rsi_flat_market_is_50() {
        let closes = vec![100.0; 30];
        let value = rsi(&closes, 14).unwrap();
        assert!((value - 50.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        let value = rsi(&closes, 14).unwrap();
        assert!((0.0..=100.0).contains(&value));
    }
}
