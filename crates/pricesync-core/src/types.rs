use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// SupplierLine
// ---------------------------------------------------------------------------

/// A partition of the remote catalog owned by one supplier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierLine {
    pub id: i64,
    pub name: String,
    /// Identifier used for this line in the remote path scheme.
    pub remote_code: String,
}

// ---------------------------------------------------------------------------
// CabinClass
// ---------------------------------------------------------------------------

/// Price tiers, declared in tie-break priority order (lowest class wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CabinClass {
    Interior,
    Oceanview,
    Balcony,
    Suite,
}

impl CabinClass {
    pub fn all() -> &'static [CabinClass] {
        &[
            CabinClass::Interior,
            CabinClass::Oceanview,
            CabinClass::Balcony,
            CabinClass::Suite,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CabinClass::Interior => "interior",
            CabinClass::Oceanview => "oceanview",
            CabinClass::Balcony => "balcony",
            CabinClass::Suite => "suite",
        }
    }
}

impl fmt::Display for CabinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CabinClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interior" => Ok(CabinClass::Interior),
            "oceanview" => Ok(CabinClass::Oceanview),
            "balcony" => Ok(CabinClass::Balcony),
            "suite" => Ok(CabinClass::Suite),
            other => Err(format!("unknown cabin class '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// PriceFacets
// ---------------------------------------------------------------------------

/// The four cabin prices of an item. `None` means the tier is not offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceFacets {
    pub interior: Option<f64>,
    pub oceanview: Option<f64>,
    pub balcony: Option<f64>,
    pub suite: Option<f64>,
}

impl PriceFacets {
    pub fn get(&self, class: CabinClass) -> Option<f64> {
        match class {
            CabinClass::Interior => self.interior,
            CabinClass::Oceanview => self.oceanview,
            CabinClass::Balcony => self.balcony,
            CabinClass::Suite => self.suite,
        }
    }

    pub fn is_empty(&self) -> bool {
        CabinClass::all().iter().all(|c| self.get(*c).is_none())
    }

    /// Minimum across the present tiers. Ties go to the lower class because
    /// classes are visited in priority order and only a strictly lower price
    /// replaces the current pick.
    pub fn cheapest(&self) -> Option<CheapestPrice> {
        let mut best: Option<CheapestPrice> = None;
        for class in CabinClass::all() {
            if let Some(price) = self.get(*class) {
                match best {
                    Some(ref b) if price >= b.price => {}
                    _ => {
                        best = Some(CheapestPrice {
                            price,
                            class: *class,
                        })
                    }
                }
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheapestPrice {
    pub price: f64,
    pub class: CabinClass,
}

// ---------------------------------------------------------------------------
// CatalogItem
// ---------------------------------------------------------------------------

/// One priced, bookable unit of inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: i64,
    /// Business key; also the remote file stem.
    pub code: String,
    pub line_id: i64,
    pub ship_code: String,
    pub sailing_date: NaiveDate,
    pub prices: PriceFacets,
    pub cheapest: Option<CheapestPrice>,
    pub currency: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Fields needed to create a catalog item. Creation belongs to the catalog
/// ingestion process; the pipeline only reads and re-prices items.
#[derive(Debug, Clone)]
pub struct NewCatalogItem {
    pub code: String,
    pub line_id: i64,
    pub ship_code: String,
    pub sailing_date: NaiveDate,
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Lock purpose for the pricing pipeline.
pub const PRICING_SYNC: &str = "pricing_sync";

/// Composite lock key: supplier line plus a purpose qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub line_id: i64,
    pub purpose: String,
}

impl LockKey {
    pub fn new(line_id: i64, purpose: impl Into<String>) -> Self {
        Self {
            line_id,
            purpose: purpose.into(),
        }
    }

    pub fn pricing(line_id: i64) -> Self {
        Self::new(line_id, PRICING_SYNC)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.purpose, self.line_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Idle,
    Processing,
    Completed,
    Failed,
}

impl LockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LockStatus::Idle => "idle",
            LockStatus::Processing => "processing",
            LockStatus::Completed => "completed",
            LockStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(LockStatus::Idle),
            "processing" => Ok(LockStatus::Processing),
            "completed" => Ok(LockStatus::Completed),
            "failed" => Ok(LockStatus::Failed),
            other => Err(format!("unknown lock status '{other}'")),
        }
    }
}

/// Persisted lock row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLock {
    pub key: LockKey,
    pub status: LockStatus,
    pub owner_token: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
