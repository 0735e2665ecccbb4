// =============================================================================
// Average True Range (ATR) — Wilder's smoothing
// =============================================================================
//
// True Range per bar: TR = max(H - L, |H - prevClose|, |L - prevClose|).
// ATR seeds with the SMA of the first `period` TR values, then smooths:
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
// =============================================================================

use crate::types::Bar;

/// Most recent ATR over `period`. Needs `period + 1` bars (each TR uses the
/// previous close). Returns `None` on short or non-finite input.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for pair in bars.windows(2) {
        let prev_close = pair[0].close;
        let high = pair[1].high;
        let low = pair[1].low;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();
        tr_values.push(hl.max(hc).max(lc));
    }

    let seed = tr_values[..period].iter().sum::<f64>() / period as f64;
    let period_f = period as f64;

    let mut value = seed;
    for &tr in &tr_values[period..] {
        value = (value * (period_f - 1.0) + tr) / period_f;
    }

    value.is_finite().then_some(value)
}
