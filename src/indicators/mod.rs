// =============================================================================
// Technical indicators over OHLCV history
// =============================================================================
//
// All functions take oldest-first slices and return `None` on insufficient
// or degenerate input rather than guessing.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod rsi;

pub use atr::atr;
pub use bollinger::{bollinger, BollingerBands};
pub use ema::{ema, sma};
pub use rsi::rsi;

/// Simple return over the last `lookback` closes:
/// `(last - close[len-1-lookback]) / close[len-1-lookback]`.
pub fn simple_return(closes: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || closes.len() <= lookback {
        return None;
    }
    let base = closes[closes.len() - 1 - lookback];
    let last = *closes.last()?;
    if base == 0.0 {
        return None;
    }
    let ret = (last - base) / base;
    ret.is_finite().then_some(ret)
}

/// Annualised volatility of close-to-close returns over the trailing
/// `window` bars, assuming daily bars (252 trading days).
pub fn annualized_volatility(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 || closes.len() < window + 1 {
        return None;
    }

    let tail = &closes[closes.len() - window - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let vol = variance.sqrt() * (252.0f64).sqrt();
    vol.is_finite().then_some(vol)
}
