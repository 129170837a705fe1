use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Exchanges whose bar series the pipeline knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Shfe,
    Cffex,
    Dce,
    Czce,
    Ine,
    Gfex,
    Sse,
    Szse,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Shfe => "SHFE",
            Exchange::Cffex => "CFFEX",
            Exchange::Dce => "DCE",
            Exchange::Czce => "CZCE",
            Exchange::Ine => "INE",
            Exchange::Gfex => "GFEX",
            Exchange::Sse => "SSE",
            Exchange::Szse => "SZSE",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SHFE" => Ok(Exchange::Shfe),
            "CFFEX" => Ok(Exchange::Cffex),
            "DCE" => Ok(Exchange::Dce),
            "CZCE" => Ok(Exchange::Czce),
            "INE" => Ok(Exchange::Ine),
            "GFEX" => Ok(Exchange::Gfex),
            "SSE" => Ok(Exchange::Sse),
            "SZSE" => Ok(Exchange::Szse),
            _ => Err(SyncError::InvalidInstrument {
                code: s.to_string(),
                reason: "unknown exchange".into(),
            }),
        }
    }
}

/// A tradable series: either the rolling continuous ("HOT") reference for a
/// product, or one fixed-delivery contract.
///
/// Standard code form is `EXCHANGE.product.HOT` or `EXCHANGE.product.YYMM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub product: String,
    pub continuous: bool,
    /// Delivery month (`2501`) for fixed contracts, `None` when continuous.
    pub delivery: Option<String>,
}

impl Instrument {
    pub fn continuous(exchange: Exchange, product: impl Into<String>) -> Self {
        Self {
            exchange,
            product: product.into(),
            continuous: true,
            delivery: None,
        }
    }

    pub fn contract(
        exchange: Exchange,
        product: impl Into<String>,
        delivery: impl Into<String>,
    ) -> Self {
        Self {
            exchange,
            product: product.into(),
            continuous: false,
            delivery: Some(delivery.into()),
        }
    }

    /// File-system code of the series: `rb_HOT`, `rb2501`, or `SR501` on CZCE
    /// (which drops the leading year digit of the delivery month).
    pub fn file_code(&self) -> String {
        match (&self.delivery, self.continuous) {
            (_, true) | (None, _) => format!("{}_HOT", self.product),
            (Some(month), false) => {
                if self.exchange == Exchange::Czce && month.len() == 4 {
                    format!("{}{}", self.product, &month[1..])
                } else {
                    format!("{}{}", self.product, month)
                }
            }
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.delivery, self.continuous) {
            (Some(month), false) => write!(f, "{}.{}.{}", self.exchange, self.product, month),
            _ => write!(f, "{}.{}.HOT", self.exchange, self.product),
        }
    }
}

impl FromStr for Instrument {
    type Err = SyncError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SyncError::InvalidInstrument {
            code: code.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = code.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(invalid("expected EXCHANGE.product.HOT or EXCHANGE.product.YYMM"));
        }
        let exchange: Exchange = parts[0].parse()?;
        let product = parts[1];
        if product.is_empty() || !product.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid("product must be non-empty and alphanumeric"));
        }

        let suffix = parts[2];
        if suffix.eq_ignore_ascii_case("HOT") {
            return Ok(Instrument::continuous(exchange, product));
        }
        if !(3..=4).contains(&suffix.len()) || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("delivery month must be 3 or 4 digits"));
        }
        Ok(Instrument::contract(exchange, product, suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_continuous_code() {
        let inst: Instrument = "SHFE.rb.HOT".parse().unwrap();
        assert_eq!(inst.exchange, Exchange::Shfe);
        assert_eq!(inst.product, "rb");
        assert!(inst.continuous);
        assert_eq!(inst.to_string(), "SHFE.rb.HOT");
    }

    #[test]
    fn parses_fixed_contract_code() {
        let inst: Instrument = "dce.jm.2505".parse().unwrap();
        assert_eq!(inst.exchange, Exchange::Dce);
        assert!(!inst.continuous);
        assert_eq!(inst.delivery.as_deref(), Some("2505"));
        assert_eq!(inst.to_string(), "DCE.jm.2505");
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!("SHFE.rb".parse::<Instrument>().is_err());
        assert!("NYSE.ibm.HOT".parse::<Instrument>().is_err());
        assert!("SHFE.rb.25X1".parse::<Instrument>().is_err());
        assert!("SHFE..HOT".parse::<Instrument>().is_err());
    }

    #[test]
    fn file_codes() {
        assert_eq!(Instrument::continuous(Exchange::Shfe, "rb").file_code(), "rb_HOT");
        assert_eq!(
            Instrument::contract(Exchange::Shfe, "rb", "2501").file_code(),
            "rb2501"
        );
        assert_eq!(
            Instrument::contract(Exchange::Czce, "SR", "2501").file_code(),
            "SR501"
        );
    }
}
