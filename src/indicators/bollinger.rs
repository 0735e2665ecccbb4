// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band is the SMA; upper/lower sit `k` standard deviations away.
// Width = (upper - lower) / middle * 100.
// =============================================================================

#[derive(Debug, Clone)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bollinger bands over the trailing `period` closes with `k` standard
/// deviations. Returns `None` on short input or a zero middle band.
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    if middle == 0.0 {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + k * std_dev;
    let lower = middle - k * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerBands {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_order_correctly() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!(bands.upper > bands.middle);
        assert!(bands.lower < bands.middle);
        assert!(bands.width > 0.0);
    }

    #[test]
    fn flat_series_collapses_bands() {
        let closes = vec![100.0; 20];
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert!(bands.width.abs() < 1e-10);
        assert!((bands.upper - bands.lower).abs() < 1e-10);
    }

    #[test]
    fn short_input_is_none() {
        assert!(bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }
}
