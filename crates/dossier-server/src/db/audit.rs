// crates/dossier-server/src/db/audit.rs
// Persistent audit log of calls that reached the paid external endpoint

use rusqlite::{Connection, params};

use super::counters::{BudgetState, charge_budget_sync};

/// One call to the external model, as persisted for audit.
#[derive(Debug, Clone)]
pub struct ExternalCallRecord {
    pub request_id: String,
    pub day: String,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_micro_usd: u64,
    pub duration_ms: Option<u64>,
}

/// Insert an audit row.
fn insert_external_call_sync(
    conn: &Connection,
    record: &ExternalCallRecord,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO audit_external_calls (
            request_id, day, model, tokens_in, tokens_out, cost_micro_usd, duration_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.request_id,
            record.day,
            record.model,
            record.tokens_in as i64,
            record.tokens_out as i64,
            record.cost_micro_usd as i64,
            record.duration_ms.map(|d| d as i64),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record an external call: audit row plus budget counter increment in
/// one transaction, so `BudgetCounter[day].external_calls` always equals
/// the audit row count for that day.
pub fn record_external_call_sync(
    conn: &Connection,
    record: &ExternalCallRecord,
) -> anyhow::Result<BudgetState> {
    let tx = conn.unchecked_transaction()?;
    insert_external_call_sync(&tx, record)?;
    let state = charge_budget_sync(&tx, &record.day, record.cost_micro_usd)?;
    tx.commit()?;
    Ok(state)
}

/// Number of audit rows for a day.
pub fn count_external_calls_sync(conn: &Connection, day: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM audit_external_calls WHERE day = ?1",
        [day],
        |row| row.get::<_, i64>(0).map(|c| c as u32),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::counters::read_budget_sync;
    use crate::db::schema::run_all_migrations;

    fn open() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn
    }

    fn record(day: &str, cost: u64) -> ExternalCallRecord {
        ExternalCallRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            day: day.to_string(),
            model: "deepseek-chat".to_string(),
            tokens_in: 1400,
            tokens_out: 300,
            cost_micro_usd: cost,
            duration_ms: Some(2100),
        }
    }

    #[test]
    fn test_record_keeps_counter_equal_to_audit_rows() {
        let conn = open();
        for _ in 0..3 {
            record_external_call_sync(&conn, &record("2026-08-01", 500)).unwrap();
        }

        let budget = read_budget_sync(&conn, "2026-08-01").unwrap();
        let rows = count_external_calls_sync(&conn, "2026-08-01").unwrap();
        assert_eq!(budget.external_calls, 3);
        assert_eq!(rows, 3);
        assert_eq!(budget.cost_micro_usd, 1500);
    }

    #[test]
    fn test_count_scoped_by_day() {
        let conn = open();
        record_external_call_sync(&conn, &record("2026-08-01", 500)).unwrap();
        record_external_call_sync(&conn, &record("2026-08-02", 500)).unwrap();
        assert_eq!(count_external_calls_sync(&conn, "2026-08-01").unwrap(), 1);
        assert_eq!(count_external_calls_sync(&conn, "2026-08-02").unwrap(), 1);
    }
}
