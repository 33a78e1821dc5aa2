//! Symbol classification: equities, OCC option symbols and futures.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolClass {
    Equity,
    /// OCC option symbol, e.g. `AAPL240119C00150000`
    Option { underlying: String },
    /// Futures contract, e.g. `/ESZ4`
    Future { root: String },
}

const FUTURES_MONTH_CODES: &str = "FGHJKMNQUVXZ";

pub fn classify(symbol: &str) -> SymbolClass {
    let symbol = symbol.trim();
    if let Some(contract) = symbol.strip_prefix('/') {
        return SymbolClass::Future {
            root: futures_root(contract),
        };
    }
    match occ_underlying(symbol) {
        Some(underlying) => SymbolClass::Option { underlying },
        None => SymbolClass::Equity,
    }
}

/// Symbol whose price and volatility drive a derivative position.
///
/// Options resolve to their root ticker and futures to their contract root.
pub fn underlying_symbol(symbol: &str) -> Option<String> {
    match classify(symbol) {
        SymbolClass::Option { underlying } => Some(underlying),
        SymbolClass::Future { root } => Some(root),
        SymbolClass::Equity => None,
    }
}

/// Parse an OCC symbol from the right: 8-digit strike, C/P, 6-digit expiry, root.
fn occ_underlying(symbol: &str) -> Option<String> {
    let bytes = symbol.as_bytes();
    if bytes.len() < 16 || !symbol.is_ascii() {
        return None;
    }
    let strike_start = bytes.len() - 8;
    let right = strike_start - 1;
    let expiry_start = right - 6;

    let all_digits = |range: &[u8]| range.iter().all(u8::is_ascii_digit);
    if !all_digits(&bytes[strike_start..]) || !all_digits(&bytes[expiry_start..right]) {
        return None;
    }
    if !matches!(bytes[right], b'C' | b'P') {
        return None;
    }

    let root = symbol[..expiry_start].trim_end();
    if root.is_empty() || root.len() > 6 || !root.chars().all(|c| c.is_ascii_alphabetic() || c == '.')
    {
        return None;
    }
    Some(root.to_string())
}

fn futures_root(contract: &str) -> String {
    let without_year = contract.trim_end_matches(|c: char| c.is_ascii_digit());
    let mut chars = without_year.chars();
    match chars.next_back() {
        Some(month) if FUTURES_MONTH_CODES.contains(month) && without_year.len() > 1 => {
            chars.as_str().to_string()
        }
        _ => without_year.to_string(),
    }
}
