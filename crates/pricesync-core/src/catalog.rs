//! Catalog repository: supplier lines, catalog items and pricing snapshots.
//!
//! All functions are synchronous and take a borrowed connection; async code
//! reaches them through [`crate::db::Db::call`].

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::db::{from_millis, to_millis};
use crate::error::{Result, SyncError};
use crate::pricing::PricingUpdate;
use crate::types::{CatalogItem, CheapestPrice, NewCatalogItem, PriceFacets, SupplierLine};

const DATE_FORMAT: &str = "%Y-%m-%d";

const ITEM_COLUMNS: &str = "id, code, line_id, ship_code, sailing_date, \
     price_interior, price_oceanview, price_balcony, price_suite, \
     cheapest_price, cheapest_class, currency, last_synced_at, last_attempted_at, active";

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(msg),
    )
}

fn cheapest_from_columns(
    price: Option<f64>,
    class: Option<String>,
    idx: usize,
) -> rusqlite::Result<Option<CheapestPrice>> {
    match (price, class) {
        (Some(price), Some(class)) => {
            let class = class.parse().map_err(|e| conversion_error(idx, e))?;
            Ok(Some(CheapestPrice { price, class }))
        }
        _ => Ok(None),
    }
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogItem> {
    let sailing: String = row.get(4)?;
    let sailing_date = NaiveDate::parse_from_str(&sailing, DATE_FORMAT)
        .map_err(|e| conversion_error(4, format!("bad sailing_date '{sailing}': {e}")))?;
    Ok(CatalogItem {
        id: row.get(0)?,
        code: row.get(1)?,
        line_id: row.get(2)?,
        ship_code: row.get(3)?,
        sailing_date,
        prices: PriceFacets {
            interior: row.get(5)?,
            oceanview: row.get(6)?,
            balcony: row.get(7)?,
            suite: row.get(8)?,
        },
        cheapest: cheapest_from_columns(row.get(9)?, row.get(10)?, 10)?,
        currency: row.get(11)?,
        last_synced_at: from_millis(row.get(12)?),
        last_attempted_at: from_millis(row.get(13)?),
        active: row.get(14)?,
    })
}

// ---------------------------------------------------------------------------
// Supplier lines
// ---------------------------------------------------------------------------

/// Insert or replace a supplier line's reference data.
pub fn upsert_line(conn: &Connection, line: &SupplierLine) -> Result<()> {
    conn.execute(
        "INSERT INTO supplier_lines (id, name, remote_code) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, remote_code = excluded.remote_code",
        params![line.id, line.name, line.remote_code],
    )?;
    Ok(())
}

pub fn get_line(conn: &Connection, id: i64) -> Result<Option<SupplierLine>> {
    let line = conn
        .query_row(
            "SELECT id, name, remote_code FROM supplier_lines WHERE id = ?1",
            params![id],
            |row| {
                Ok(SupplierLine {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    remote_code: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(line)
}

pub fn list_lines(conn: &Connection) -> Result<Vec<SupplierLine>> {
    let mut stmt = conn.prepare("SELECT id, name, remote_code FROM supplier_lines ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(SupplierLine {
            id: row.get(0)?,
            name: row.get(1)?,
            remote_code: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Catalog items
// ---------------------------------------------------------------------------

/// Create an item without pricing. Returns the new row id.
pub fn insert_item(conn: &Connection, item: &NewCatalogItem) -> Result<i64> {
    conn.execute(
        "INSERT INTO catalog_items (code, line_id, ship_code, sailing_date) VALUES (?1, ?2, ?3, ?4)",
        params![
            item.code,
            item.line_id,
            item.ship_code,
            item.sailing_date.format(DATE_FORMAT).to_string()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_item(conn: &Connection, id: i64) -> Result<Option<CatalogItem>> {
    let sql = format!("SELECT {ITEM_COLUMNS} FROM catalog_items WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], item_from_row).optional()?)
}

/// Items are never deleted; this is the only way out of the eligible set.
pub fn set_active(conn: &Connection, id: i64, active: bool) -> Result<()> {
    let changed = conn.execute(
        "UPDATE catalog_items SET active = ?2 WHERE id = ?1",
        params![id, active],
    )?;
    if changed == 0 {
        return Err(SyncError::ItemNotFound(id));
    }
    Ok(())
}

/// Active items of `line_id` sailing on or after `today`, at most `cap`.
///
/// Never-attempted items come first, then the least recently attempted, so
/// the items a capped run leaves behind are the first ones the next run takes.
pub fn eligible_items(
    conn: &Connection,
    line_id: i64,
    today: NaiveDate,
    cap: usize,
) -> Result<Vec<CatalogItem>> {
    let sql = format!(
        "SELECT {ITEM_COLUMNS} FROM catalog_items
         WHERE line_id = ?1 AND active = 1 AND sailing_date >= ?2
         ORDER BY last_attempted_at IS NOT NULL, last_attempted_at, sailing_date, id
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            line_id,
            today.format(DATE_FORMAT).to_string(),
            sql_limit(cap)
        ],
        item_from_row,
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// `LIMIT` value for a cap. SQLite reads a negative limit as "no limit", so
/// oversized caps saturate instead of wrapping.
fn sql_limit(cap: usize) -> i64 {
    i64::try_from(cap).unwrap_or(i64::MAX)
}

/// Total number of eligible items, ignoring the cap.
pub fn count_eligible(conn: &Connection, line_id: i64, today: NaiveDate) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM catalog_items WHERE line_id = ?1 AND active = 1 AND sailing_date >= ?2",
        params![line_id, today.format(DATE_FORMAT).to_string()],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

/// Stamp an attempt regardless of its outcome. Not a pricing field.
pub fn record_attempt(conn: &Connection, item_id: i64, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE catalog_items SET last_attempted_at = ?2 WHERE id = ?1",
        params![item_id, to_millis(at)],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Pricing
// ---------------------------------------------------------------------------

/// The per-item pricing record written alongside the denormalised columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub item_id: i64,
    pub prices: PriceFacets,
    pub cheapest: Option<CheapestPrice>,
    pub currency: Option<String>,
    pub payload_sha256: String,
    pub updated_at: DateTime<Utc>,
}

/// Write the item's price columns and its snapshot in one transaction.
///
/// Either both rows reflect `update` afterwards or neither changed.
pub fn apply_pricing(
    conn: &mut Connection,
    item_id: i64,
    update: &PricingUpdate,
    payload_sha256: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let tx = conn.transaction()?;
    let cheapest_price = update.cheapest.map(|c| c.price);
    let cheapest_class = update.cheapest.map(|c| c.class.as_str());
    let now_ms = to_millis(now);

    let changed = tx.execute(
        "UPDATE catalog_items SET
             price_interior = ?2, price_oceanview = ?3, price_balcony = ?4, price_suite = ?5,
             cheapest_price = ?6, cheapest_class = ?7,
             currency = COALESCE(?8, currency),
             last_synced_at = ?9
         WHERE id = ?1",
        params![
            item_id,
            update.prices.interior,
            update.prices.oceanview,
            update.prices.balcony,
            update.prices.suite,
            cheapest_price,
            cheapest_class,
            update.currency,
            now_ms
        ],
    )?;
    if changed == 0 {
        // Dropping `tx` rolls back.
        return Err(SyncError::ItemNotFound(item_id));
    }

    tx.execute(
        "INSERT INTO item_pricing (
             item_id, price_interior, price_oceanview, price_balcony, price_suite,
             cheapest_price, cheapest_class, currency, payload_sha256, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(item_id) DO UPDATE SET
             price_interior = excluded.price_interior,
             price_oceanview = excluded.price_oceanview,
             price_balcony = excluded.price_balcony,
             price_suite = excluded.price_suite,
             cheapest_price = excluded.cheapest_price,
             cheapest_class = excluded.cheapest_class,
             currency = COALESCE(excluded.currency, item_pricing.currency),
             payload_sha256 = excluded.payload_sha256,
             updated_at = excluded.updated_at",
        params![
            item_id,
            update.prices.interior,
            update.prices.oceanview,
            update.prices.balcony,
            update.prices.suite,
            cheapest_price,
            cheapest_class,
            update.currency,
            payload_sha256,
            now_ms
        ],
    )?;

    tx.commit()?;
    Ok(())
}

pub fn get_snapshot(conn: &Connection, item_id: i64) -> Result<Option<PricingSnapshot>> {
    let snapshot = conn
        .query_row(
            "SELECT item_id, price_interior, price_oceanview, price_balcony, price_suite,
                    cheapest_price, cheapest_class, currency, payload_sha256, updated_at
             FROM item_pricing WHERE item_id = ?1",
            params![item_id],
            |row| {
                Ok(PricingSnapshot {
                    item_id: row.get(0)?,
                    prices: PriceFacets {
                        interior: row.get(1)?,
                        oceanview: row.get(2)?,
                        balcony: row.get(3)?,
                        suite: row.get(4)?,
                    },
                    cheapest: cheapest_from_columns(row.get(5)?, row.get(6)?, 6)?,
                    currency: row.get(7)?,
                    payload_sha256: row.get(8)?,
                    updated_at: from_millis(Some(row.get(9)?)).unwrap_or_default(),
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}

pub fn count_snapshots(conn: &Connection, item_id: i64) -> Result<usize> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM item_pricing WHERE item_id = ?1",
        params![item_id],
        |row| row.get(0),
    )?;
    Ok(n.max(0) as usize)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::types::CabinClass;
    use chrono::Duration;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn seed_line(conn: &Connection, id: i64) {
        upsert_line(
            conn,
            &SupplierLine {
                id,
                name: format!("Line {id}"),
                remote_code: format!("{id}"),
            },
        )
        .unwrap();
    }

    fn seed_item(conn: &Connection, line_id: i64, code: &str, sailing: &str) -> i64 {
        insert_item(
            conn,
            &NewCatalogItem {
                code: code.to_string(),
                line_id,
                ship_code: "S1".to_string(),
                sailing_date: date(sailing),
            },
        )
        .unwrap()
    }

    fn update(interior: f64) -> PricingUpdate {
        let prices = PriceFacets {
            interior: Some(interior),
            oceanview: Some(interior + 50.0),
            balcony: None,
            suite: Some(interior * 4.0),
        };
        PricingUpdate {
            cheapest: prices.cheapest(),
            prices,
            currency: Some("USD".into()),
        }
    }

    #[test]
    fn upsert_line_replaces_reference_data() {
        let conn = open_in_memory().unwrap();
        seed_line(&conn, 22);
        upsert_line(
            &conn,
            &SupplierLine {
                id: 22,
                name: "Renamed".into(),
                remote_code: "RC".into(),
            },
        )
        .unwrap();
        let line = get_line(&conn, 22).unwrap().unwrap();
        assert_eq!(line.name, "Renamed");
        assert_eq!(list_lines(&conn).unwrap().len(), 1);
        assert!(get_line(&conn, 99).unwrap().is_none());
    }

    #[test]
    fn eligible_items_filters_past_inactive_and_other_lines() {
        let conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        seed_line(&conn, 2);
        seed_item(&conn, 1, "past", "2026-01-01");
        let inactive = seed_item(&conn, 1, "inactive", "2027-01-01");
        set_active(&conn, inactive, false).unwrap();
        seed_item(&conn, 2, "other-line", "2027-01-01");
        seed_item(&conn, 1, "today", "2026-10-19");
        seed_item(&conn, 1, "future", "2027-03-01");

        let items = eligible_items(&conn, 1, date("2026-10-19"), 20).unwrap();
        let codes: Vec<_> = items.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["today", "future"]);
        assert_eq!(count_eligible(&conn, 1, date("2026-10-19")).unwrap(), 2);
    }

    #[test]
    fn eligible_items_respects_cap_but_count_does_not() {
        let conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        for i in 0..7 {
            seed_item(&conn, 1, &format!("c{i}"), "2027-01-01");
        }
        let today = date("2026-10-19");
        assert_eq!(eligible_items(&conn, 1, today, 3).unwrap().len(), 3);
        assert_eq!(count_eligible(&conn, 1, today).unwrap(), 7);
    }

    #[test]
    fn oversized_cap_saturates_instead_of_wrapping() {
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
        assert_eq!(sql_limit(20), 20);

        let conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        seed_item(&conn, 1, "a", "2027-01-01");
        seed_item(&conn, 1, "b", "2027-01-02");
        let today = date("2026-10-19");
        assert_eq!(eligible_items(&conn, 1, today, usize::MAX).unwrap().len(), 2);
        assert!(eligible_items(&conn, 1, today, 0).unwrap().is_empty());
    }

    #[test]
    fn attempted_items_move_to_the_back() {
        let conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        let a = seed_item(&conn, 1, "a", "2027-01-01");
        let b = seed_item(&conn, 1, "b", "2027-02-01");
        seed_item(&conn, 1, "c", "2027-03-01");

        let now = Utc::now();
        record_attempt(&conn, a, now).unwrap();
        record_attempt(&conn, b, now - Duration::minutes(5)).unwrap();

        let items = eligible_items(&conn, 1, date("2026-10-19"), 10).unwrap();
        let codes: Vec<_> = items.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["c", "b", "a"]);
    }

    #[test]
    fn apply_pricing_writes_item_and_snapshot() {
        let mut conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        let id = seed_item(&conn, 1, "a", "2027-01-01");

        apply_pricing(&mut conn, id, &update(100.0), "abc", Utc::now()).unwrap();

        let item = get_item(&conn, id).unwrap().unwrap();
        assert_eq!(item.prices.interior, Some(100.0));
        assert_eq!(item.prices.balcony, None);
        assert_eq!(item.cheapest.unwrap().class, CabinClass::Interior);
        assert_eq!(item.currency.as_deref(), Some("USD"));
        assert!(item.last_synced_at.is_some());

        let snap = get_snapshot(&conn, id).unwrap().unwrap();
        assert_eq!(snap.prices, item.prices);
        assert_eq!(snap.payload_sha256, "abc");
    }

    #[test]
    fn apply_pricing_twice_keeps_one_snapshot() {
        let mut conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        let id = seed_item(&conn, 1, "a", "2027-01-01");

        apply_pricing(&mut conn, id, &update(100.0), "one", Utc::now()).unwrap();
        apply_pricing(&mut conn, id, &update(90.0), "two", Utc::now()).unwrap();

        assert_eq!(count_snapshots(&conn, id).unwrap(), 1);
        let snap = get_snapshot(&conn, id).unwrap().unwrap();
        assert_eq!(snap.prices.interior, Some(90.0));
        assert_eq!(snap.payload_sha256, "two");
    }

    #[test]
    fn apply_pricing_for_missing_item_writes_nothing() {
        let mut conn = open_in_memory().unwrap();
        let err = apply_pricing(&mut conn, 404, &update(1.0), "x", Utc::now()).unwrap_err();
        assert!(matches!(err, SyncError::ItemNotFound(404)));
        assert_eq!(count_snapshots(&conn, 404).unwrap(), 0);
    }

    #[test]
    fn snapshot_failure_rolls_back_item_columns() {
        let mut conn = open_in_memory().unwrap();
        seed_line(&conn, 1);
        let id = seed_item(&conn, 1, "a", "2027-01-01");
        conn.execute_batch(
            "CREATE TRIGGER reject_snapshot BEFORE INSERT ON item_pricing
             BEGIN SELECT RAISE(ABORT, 'snapshot rejected'); END;",
        )
        .unwrap();

        assert!(apply_pricing(&mut conn, id, &update(100.0), "x", Utc::now()).is_err());

        let item = get_item(&conn, id).unwrap().unwrap();
        assert_eq!(item.prices.interior, None);
        assert!(item.last_synced_at.is_none());
    }
}
