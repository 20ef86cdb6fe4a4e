// crates/dossier-server/src/db/counters.rs
// Per-IP rate counters and the global daily budget counter.
//
// Both are increment-and-read under SQLite's row lock: a single upsert
// statement with RETURNING, never an application-side compare-and-set.

use rusqlite::{Connection, OptionalExtension, params};

/// Increment the per-IP counter for `day` and return the new count.
///
/// The caller compares the returned count against the cap; the increment
/// itself is unconditional so concurrent requests cannot slip through a
/// read-check-write gap.
pub fn increment_rate_counter_sync(
    conn: &Connection,
    ip_hash: &str,
    day: &str,
) -> rusqlite::Result<u32> {
    conn.query_row(
        "INSERT INTO rate_counters (ip_hash, day, count) VALUES (?1, ?2, 1)
         ON CONFLICT(ip_hash, day) DO UPDATE SET count = count + 1
         RETURNING count",
        params![ip_hash, day],
        |row| row.get::<_, i64>(0).map(|c| c as u32),
    )
}

/// Read the per-IP counter without incrementing (stats only).
pub fn rate_count_sync(conn: &Connection, ip_hash: &str, day: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT count FROM rate_counters WHERE ip_hash = ?1 AND day = ?2",
        params![ip_hash, day],
        |row| row.get::<_, i64>(0).map(|c| c as u32),
    )
    .optional()
    .map(|c| c.unwrap_or(0))
}

/// Sum of all admissions for a day (stats only).
pub fn total_admissions_sync(conn: &Connection, day: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(SUM(count), 0) FROM rate_counters WHERE day = ?1",
        [day],
        |row| row.get::<_, i64>(0).map(|c| c as u32),
    )
}

/// Today's budget counter state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetState {
    pub external_calls: u32,
    pub cost_micro_usd: u64,
}

/// Read the budget counter for a day. Missing row means nothing spent.
pub fn read_budget_sync(conn: &Connection, day: &str) -> rusqlite::Result<BudgetState> {
    conn.query_row(
        "SELECT external_calls, cost_micro_usd FROM budget_counters WHERE day = ?1",
        [day],
        |row| {
            Ok(BudgetState {
                external_calls: row.get::<_, i64>(0)? as u32,
                cost_micro_usd: row.get::<_, i64>(1)? as u64,
            })
        },
    )
    .optional()
    .map(|b| b.unwrap_or_default())
}

/// Add one external call and its cost to the day's budget counter.
/// Called inside the same transaction as the audit row insert so the
/// counter always equals the audit row count.
pub fn charge_budget_sync(
    conn: &Connection,
    day: &str,
    cost_micro_usd: u64,
) -> rusqlite::Result<BudgetState> {
    conn.query_row(
        "INSERT INTO budget_counters (day, external_calls, cost_micro_usd)
         VALUES (?1, 1, ?2)
         ON CONFLICT(day) DO UPDATE SET
             external_calls = external_calls + 1,
             cost_micro_usd = cost_micro_usd + excluded.cost_micro_usd
         RETURNING external_calls, cost_micro_usd",
        params![day, cost_micro_usd as i64],
        |row| {
            Ok(BudgetState {
                external_calls: row.get::<_, i64>(0)? as u32,
                cost_micro_usd: row.get::<_, i64>(1)? as u64,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::run_all_migrations;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_rate_counter_increments_from_one() {
        let conn = open();
        assert_eq!(increment_rate_counter_sync(&conn, "h1", "2026-08-01").unwrap(), 1);
        assert_eq!(increment_rate_counter_sync(&conn, "h1", "2026-08-01").unwrap(), 2);
        // Different hash and different day are independent
        assert_eq!(increment_rate_counter_sync(&conn, "h2", "2026-08-01").unwrap(), 1);
        assert_eq!(increment_rate_counter_sync(&conn, "h1", "2026-08-02").unwrap(), 1);
    }

    #[test]
    fn test_rate_count_read_only() {
        let conn = open();
        assert_eq!(rate_count_sync(&conn, "h1", "2026-08-01").unwrap(), 0);
        increment_rate_counter_sync(&conn, "h1", "2026-08-01").unwrap();
        assert_eq!(rate_count_sync(&conn, "h1", "2026-08-01").unwrap(), 1);
    }

    #[test]
    fn test_budget_missing_row_is_zero() {
        let conn = open();
        let b = read_budget_sync(&conn, "2026-08-01").unwrap();
        assert_eq!(b.external_calls, 0);
        assert_eq!(b.cost_micro_usd, 0);
    }

    #[test]
    fn test_budget_charge_accumulates() {
        let conn = open();
        let b = charge_budget_sync(&conn, "2026-08-01", 1200).unwrap();
        assert_eq!(b.external_calls, 1);
        assert_eq!(b.cost_micro_usd, 1200);

        let b = charge_budget_sync(&conn, "2026-08-01", 800).unwrap();
        assert_eq!(b.external_calls, 2);
        assert_eq!(b.cost_micro_usd, 2000);

        let read = read_budget_sync(&conn, "2026-08-01").unwrap();
        assert_eq!(read.external_calls, 2);
        assert_eq!(read.cost_micro_usd, 2000);
    }
}
