//! Payload parsing and price derivation for the item reconciler.
//!
//! Remote item files are JSON. Prices can appear in three places; the first
//! one that carries at least one price wins:
//!
//! 1. `cheapest.combined.{inside,outside,balcony,suite}`
//! 2. `prices.{interior,oceanview,balcony,suite}` (`inside`/`outside` accepted)
//! 3. top-level `cheapestinside`, `cheapestoutside`, `cheapestbalcony`, `cheapestsuite`
//!
//! Values may be numbers or numeric strings. Missing, empty and non-positive
//! values mean the tier is not offered.

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::types::{CheapestPrice, PriceFacets};

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceValue {
    Number(f64),
    Text(String),
}

impl PriceValue {
    fn amount(&self) -> Result<Option<f64>, String> {
        let value = match self {
            PriceValue::Number(n) => *n,
            PriceValue::Text(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(None);
                }
                s.parse::<f64>()
                    .map_err(|_| format!("price '{s}' is not a number"))?
            }
        };
        if !value.is_finite() {
            return Err(format!("price {value} is not finite"));
        }
        Ok((value > 0.0).then_some(value))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CabinPrices {
    #[serde(default, alias = "inside")]
    interior: Option<PriceValue>,
    #[serde(default, alias = "outside")]
    oceanview: Option<PriceValue>,
    #[serde(default)]
    balcony: Option<PriceValue>,
    #[serde(default)]
    suite: Option<PriceValue>,
}

impl CabinPrices {
    fn facets(&self) -> Result<PriceFacets, String> {
        let amount = |v: &Option<PriceValue>| match v {
            Some(v) => v.amount(),
            None => Ok(None),
        };
        Ok(PriceFacets {
            interior: amount(&self.interior)?,
            oceanview: amount(&self.oceanview)?,
            balcony: amount(&self.balcony)?,
            suite: amount(&self.suite)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Cheapest {
    #[serde(default)]
    combined: Option<CabinPrices>,
}

#[derive(Debug, Deserialize)]
struct ItemPayload {
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    cheapest: Option<Cheapest>,
    #[serde(default)]
    prices: Option<CabinPrices>,
    #[serde(default)]
    cheapestinside: Option<PriceValue>,
    #[serde(default)]
    cheapestoutside: Option<PriceValue>,
    #[serde(default)]
    cheapestbalcony: Option<PriceValue>,
    #[serde(default)]
    cheapestsuite: Option<PriceValue>,
}

// ---------------------------------------------------------------------------
// PricingUpdate
// ---------------------------------------------------------------------------

/// Normalised pricing extracted from one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingUpdate {
    pub prices: PriceFacets,
    pub cheapest: Option<CheapestPrice>,
    pub currency: Option<String>,
}

impl PricingUpdate {
    pub fn has_prices(&self) -> bool {
        !self.prices.is_empty()
    }
}

/// Parse a raw payload. The error string describes what was wrong with it;
/// callers add the item context.
pub fn parse_payload(raw: &[u8]) -> Result<PricingUpdate, String> {
    let payload: ItemPayload =
        serde_json::from_slice(raw).map_err(|e| format!("invalid JSON: {e}"))?;

    let flat = CabinPrices {
        interior: payload.cheapestinside,
        oceanview: payload.cheapestoutside,
        balcony: payload.cheapestbalcony,
        suite: payload.cheapestsuite,
    };
    let sources = [
        payload.cheapest.and_then(|c| c.combined),
        payload.prices,
        Some(flat),
    ];

    let mut prices = PriceFacets::default();
    for source in sources.iter().flatten() {
        let facets = source.facets()?;
        if !facets.is_empty() {
            prices = facets;
            break;
        }
    }

    let currency = payload
        .currency
        .map(|c| c.trim().to_ascii_uppercase())
        .filter(|c| !c.is_empty());

    Ok(PricingUpdate {
        cheapest: prices.cheapest(),
        prices,
        currency,
    })
}

/// Hex SHA-256 of the raw payload, stored on the snapshot.
pub fn payload_digest(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let mut out = String::with_capacity(64);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CabinClass;

    #[test]
    fn prices_block_yields_cheapest_interior() {
        let raw = br#"{"prices":{"interior":100,"oceanview":150,"balcony":200,"suite":400}}"#;
        let update = parse_payload(raw).unwrap();
        let cheapest = update.cheapest.unwrap();
        assert_eq!(cheapest.price, 100.0);
        assert_eq!(cheapest.class, CabinClass::Interior);
        assert_eq!(update.prices.suite, Some(400.0));
    }

    #[test]
    fn combined_block_wins_over_flat_fields() {
        let raw = br#"{
            "currency": "gbp",
            "cheapest": {"combined": {"inside": "899.00", "outside": "", "balcony": 1200, "suite": null}},
            "cheapestinside": "1.00"
        }"#;
        let update = parse_payload(raw).unwrap();
        assert_eq!(update.prices.interior, Some(899.0));
        assert_eq!(update.prices.oceanview, None);
        assert_eq!(update.prices.suite, None);
        assert_eq!(update.currency.as_deref(), Some("GBP"));
    }

    #[test]
    fn flat_fields_are_the_fallback() {
        let raw = br#"{"cheapestinside":"0","cheapestoutside":"450.5","cheapestsuite":"2000"}"#;
        let update = parse_payload(raw).unwrap();
        assert_eq!(update.prices.interior, None, "zero means not offered");
        let cheapest = update.cheapest.unwrap();
        assert_eq!(cheapest.class, CabinClass::Oceanview);
        assert_eq!(cheapest.price, 450.5);
    }

    #[test]
    fn empty_combined_block_falls_through() {
        let raw = br#"{"cheapest":{"combined":{}},"prices":{"suite":700}}"#;
        let update = parse_payload(raw).unwrap();
        assert_eq!(update.cheapest.unwrap().class, CabinClass::Suite);
    }

    #[test]
    fn payload_without_prices_is_not_an_error() {
        let update = parse_payload(br#"{"codetocruiseid": 12345}"#).unwrap();
        assert!(!update.has_prices());
        assert!(update.cheapest.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        let err = parse_payload(b"<html>not json</html>").unwrap_err();
        assert!(err.starts_with("invalid JSON"));
    }

    #[test]
    fn non_numeric_price_is_an_error() {
        let err = parse_payload(br#"{"prices":{"interior":"call us"}}"#).unwrap_err();
        assert!(err.contains("call us"));
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = payload_digest(b"abc");
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
