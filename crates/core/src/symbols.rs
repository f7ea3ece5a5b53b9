//! Trading-pair symbols and plugin notations
//!
//! The node tracks symbols in the canonical form published by the oracle
//! contract. Plugins may speak either a separated notation (`BTC/USD`,
//! `BTC-USD`) or a concatenated one (`BTCUSD`).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Separators recognised between base and quote
pub const SEPARATORS: [char; 2] = ['/', '-'];

/// Canonical trading-pair identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Parse a symbol, rejecting blanks and malformed pairs
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidSymbol(raw.to_string()));
        }
        let symbol = Self(trimmed.to_string());
        if symbol.separator().is_some() && symbol.parts().is_none() {
            return Err(CoreError::InvalidSymbol(raw.to_string()));
        }
        Ok(symbol)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn separator(&self) -> Option<char> {
        self.0.chars().find(|c| SEPARATORS.contains(c))
    }

    /// Base and quote, when the symbol is written with a separator
    pub fn parts(&self) -> Option<(&str, &str)> {
        let sep = self.separator()?;
        let (base, quote) = self.0.split_once(sep)?;
        if base.is_empty() || quote.is_empty() || quote.contains(SEPARATORS) {
            return None;
        }
        Some((base, quote))
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

/// Symbol style a plugin uses natively
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolNotation {
    Separated(char),
    Concatenated,
}

impl SymbolNotation {
    /// Infer the style from the symbols a plugin reported.
    ///
    /// Returns `None` for an empty set: nothing can be resolved yet.
    pub fn infer<'a>(known: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut seen_any = false;
        for symbol in known {
            seen_any = true;
            if let Some(sep) = symbol.chars().find(|c| SEPARATORS.contains(c)) {
                return Some(SymbolNotation::Separated(sep));
            }
        }
        seen_any.then_some(SymbolNotation::Concatenated)
    }

    /// Render a canonical symbol in this notation
    pub fn render(&self, symbol: &Symbol) -> Option<String> {
        match (self, symbol.parts()) {
            (SymbolNotation::Separated(sep), Some((base, quote))) => {
                Some(format!("{base}{sep}{quote}"))
            }
            (SymbolNotation::Separated(_), None) => None,
            (SymbolNotation::Concatenated, Some((base, quote))) => Some(format!("{base}{quote}")),
            (SymbolNotation::Concatenated, None) => Some(symbol.as_str().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts() {
        assert_eq!(Symbol::new("BTC-USD").parts(), Some(("BTC", "USD")));
        assert_eq!(Symbol::new("NTN/AUD").parts(), Some(("NTN", "AUD")));
        assert_eq!(Symbol::new("BTCUSD").parts(), None);
        assert_eq!(Symbol::new("BTC/").parts(), None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Symbol::parse("  ").is_err());
        assert!(Symbol::parse("/USD").is_err());
        assert!(Symbol::parse("A/B/C").is_err());
        assert_eq!(Symbol::parse(" ETH-USD ").unwrap().as_str(), "ETH-USD");
    }

    #[test]
    fn test_infer_notation() {
        assert_eq!(SymbolNotation::infer(Vec::<&str>::new()), None);
        assert_eq!(
            SymbolNotation::infer(["BTCUSDT", "ETHUSDT"]),
            Some(SymbolNotation::Concatenated)
        );
        assert_eq!(
            SymbolNotation::infer(["EUR/USD"]),
            Some(SymbolNotation::Separated('/'))
        );
    }

    #[test]
    fn test_render() {
        let symbol = Symbol::new("BTC-USD");
        assert_eq!(SymbolNotation::Concatenated.render(&symbol).as_deref(), Some("BTCUSD"));
        assert_eq!(SymbolNotation::Separated('/').render(&symbol).as_deref(), Some("BTC/USD"));

        let bare = Symbol::new("BTCUSD");
        assert_eq!(SymbolNotation::Concatenated.render(&bare).as_deref(), Some("BTCUSD"));
        assert_eq!(SymbolNotation::Separated('/').render(&bare), None);
    }
}
