// =============================================================================
// Moving averages — SMA and EMA
// =============================================================================

/// Simple moving average over the trailing `period` closes.
pub fn sma(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let value = window.iter().sum::<f64>() / period as f64;
    value.is_finite().then_some(value)
}

/// Exponential moving average over the full series, seeded with the SMA of
/// the first `period` closes. Smoothing factor `k = 2 / (period + 1)`.
pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    let k = 2.0 / (period as f64 + 1.0);

    let mut value = seed;
    for &close in &closes[period..] {
        value = close * k + value * (1.0 - k);
    }

    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_of_constant_series() {
        let closes = vec![42.0; 10];
        assert!((sma(&closes, 5).unwrap() - 42.0).abs() < 1e-12);
    }

    #[test]
    fn sma_uses_trailing_window() {
        let closes = vec![1.0, 1.0, 1.0, 10.0, 10.0];
        assert!((sma(&closes, 2).unwrap() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn sma_insufficient_data() {
        assert!(sma(&[1.0, 2.0], 5).is_none());
        assert!(sma(&[1.0, 2.0], 0).is_none());
    }

    #[test]
    fn ema_tracks_recent_prices_harder_than_sma() {
        // Flat history then a jump: EMA should sit above SMA-of-all.
        let mut closes = vec![100.0; 20];
        closes.extend([120.0, 120.0, 120.0]);
        let e = ema(&closes, 10).unwrap();
        assert!(e > 100.0);
        assert!(e < 120.0);
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let closes = vec![7.5; 30];
        assert!((ema(&closes, 9).unwrap() - 7.5).abs() < 1e-12);
    }
}
