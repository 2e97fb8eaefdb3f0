/// Ratio of total margin balance to total maintenance margin.
///
/// None means the ratio is undefined (no open position, or account data
/// missing), which callers must treat as "no margin pressure" rather than a
/// breach.
pub fn safety_multiple(margin_balance: Option<f64>, maint_margin: Option<f64>) -> Option<f64> {
    let mb = margin_balance?;
    let mm = maint_margin?;
    if mb <= 0.0 || mm <= 0.0 {
        return None;
    }
    Some(mb / mm)
}

/// True when the account is close enough to liquidation that positions must
/// be flattened. The configured minimum itself counts as breached.
pub fn is_breached(multiple: Option<f64>, min_multiple: f64) -> bool {
    matches!(multiple, Some(m) if m <= min_multiple)
}
