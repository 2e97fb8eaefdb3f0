use std::collections::HashMap;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::api::{ExchangeInfo, SymbolInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    Up,
    Down,
}

/// Snap a value to an exchange step using decimal arithmetic, so repeated
/// rounding is exact and idempotent. A non-positive step passes the value
/// through unchanged.
pub fn round_to_step(value: f64, step: f64, mode: RoundMode) -> f64 {
    if step <= 0.0 || !value.is_finite() {
        return value;
    }
    let (Some(v), Some(s)) = (Decimal::from_f64(value), Decimal::from_f64(step)) else {
        return value;
    };
    if s.is_zero() {
        return value;
    }
    let steps = match mode {
        RoundMode::Up => (v / s).ceil(),
        RoundMode::Down => (v / s).floor(),
    };
    (steps * s).normalize().to_f64().unwrap_or(value)
}

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),
    #[error("quantity {qty} exceeds exchange maximum {max_qty}")]
    ExceedsMaxQty { qty: f64, max_qty: f64 },
}

/// Per-symbol trading constraints from exchangeInfo
#[derive(Debug, Clone, Default)]
pub struct SymbolFilters {
    pub tick_size: Option<f64>,
    pub step_size: Option<f64>,
    pub min_qty: Option<f64>,
    pub max_qty: Option<f64>,
    pub min_notional: Option<f64>,
}

impl SymbolFilters {
    pub fn from_symbol_info(info: &SymbolInfo) -> Self {
        let mut filters = SymbolFilters::default();
        for f in &info.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => filters.tick_size = f.tick_size,
                "LOT_SIZE" => {
                    filters.step_size = f.step_size;
                    filters.min_qty = f.min_qty;
                    filters.max_qty = f.max_qty;
                }
                "MIN_NOTIONAL" => {
                    filters.min_notional = f.min_notional.or(f.notional);
                }
                _ => {}
            }
        }
        filters
    }

    pub fn round_price(&self, price: f64, mode: RoundMode) -> f64 {
        round_to_step(price, self.tick_size.unwrap_or(0.0), mode)
    }

    pub fn round_qty(&self, qty: f64, mode: RoundMode) -> f64 {
        round_to_step(qty, self.step_size.unwrap_or(0.0), mode)
    }

    /// Size an order to reach at least the target notional at the given
    /// price, honoring step, minimum quantity, and minimum notional.
    /// Rounds up throughout so the target is never undershot.
    pub fn qty_for_notional(&self, notional: f64, price: f64) -> Result<f64, SizingError> {
        if price <= 0.0 {
            return Err(SizingError::NonPositivePrice(price));
        }
        let mut qty = self.round_qty(notional / price, RoundMode::Up);

        if let Some(min_qty) = self.min_qty {
            if qty < min_qty {
                qty = self.round_qty(min_qty, RoundMode::Up);
            }
        }
        if let Some(min_notional) = self.min_notional {
            if qty * price < min_notional {
                qty = self.round_qty(min_notional / price, RoundMode::Up);
            }
        }
        if let Some(max_qty) = self.max_qty {
            if qty > max_qty {
                return Err(SizingError::ExceedsMaxQty { qty, max_qty });
            }
        }
        Ok(qty)
    }
}

/// Lazily-populated map of symbol filters keyed by symbol
#[derive(Debug, Default)]
pub struct FilterBook {
    filters: HashMap<String, SymbolFilters>,
}

impl FilterBook {
    pub fn populate(&mut self, info: &ExchangeInfo) {
        for sym in &info.symbols {
            self.filters
                .insert(sym.symbol.clone(), SymbolFilters::from_symbol_info(sym));
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolFilters> {
        self.filters.get(symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
