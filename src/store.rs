// =============================================================================
// Persistent Store - SQLite rows behind every stateful manager
// =============================================================================
//
// One bundled-SQLite database holds everything that must survive a restart:
// daily P&L, lockouts, timers, trade counts, position extremes, the audit
// log, and a small meta table (last reset instant, session starts).
//
// Writes are atomic per row, which is all the managers need: each one keeps
// single-row state per (account, scope). Timestamps are stored as RFC 3339
// UTC text with a fixed precision so that lexicographic order equals
// chronological order; decimals are stored as text to keep them exact.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use tracing::debug;

use crate::audit::AuditRecord;
use crate::types::{AccountId, LockScope, Lockout, ReleaseSpec, RuleId};

/// SQLite busy timeout. Covers writer contention between account workers.
const BUSY_TIMEOUT_MS: u64 = 5_000;

const META_LAST_RESET: &str = "last_reset_at";

/// Durable storage shared by all managers. The connection is serialized
/// behind a mutex; every call is a short single-row operation.
pub struct Store {
    conn: Mutex<Connection>,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    // Fixed-width fractional seconds keep lexicographic order chronological
    // and make round-trips exact.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("bad timestamp in store: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_decimal(raw: &str) -> Result<Decimal> {
    raw.parse::<Decimal>().with_context(|| format!("bad decimal in store: {raw}"))
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("open store {}", path.as_ref().display()))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory store")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS daily_pnl (
                account_id   TEXT NOT NULL,
                trading_day  TEXT NOT NULL,
                realized_pnl TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                PRIMARY KEY (account_id, trading_day)
            );
            CREATE TABLE IF NOT EXISTS lockouts (
                account_id   TEXT NOT NULL,
                rule_id      TEXT NOT NULL,
                scope        TEXT NOT NULL,
                reason       TEXT NOT NULL,
                locked_at    TEXT NOT NULL,
                release_kind TEXT NOT NULL,
                release_at   TEXT,
                PRIMARY KEY (account_id, rule_id, scope)
            );
            CREATE TABLE IF NOT EXISTS timers (
                account_id TEXT NOT NULL,
                tag        TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (account_id, tag)
            );
            CREATE TABLE IF NOT EXISTS trade_counts (
                trade_id   TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                ts         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_counts_account_ts
                ON trade_counts(account_id, ts);
            CREATE TABLE IF NOT EXISTS position_extremes (
                account_id TEXT NOT NULL,
                symbol     TEXT NOT NULL,
                high       TEXT NOT NULL,
                low        TEXT NOT NULL,
                PRIMARY KEY (account_id, symbol)
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                id         TEXT PRIMARY KEY,
                at         TEXT NOT NULL,
                account_id TEXT NOT NULL,
                rule_id    TEXT,
                symbol     TEXT,
                kind       TEXT NOT NULL,
                detail     TEXT NOT NULL,
                snapshot   TEXT,
                outcome    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_log_at ON audit_log(at DESC);
            CREATE TABLE IF NOT EXISTS engine_meta (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        debug!("store schema ready");
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -------------------------------------------------------------------------
    // Daily P&L
    // -------------------------------------------------------------------------

    pub fn daily_pnl(&self, account: &str, day: NaiveDate) -> Result<Option<Decimal>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT realized_pnl FROM daily_pnl WHERE account_id = ?1 AND trading_day = ?2",
                params![account, day.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|r| parse_decimal(&r)).transpose()
    }

    pub fn set_daily_pnl(
        &self,
        account: &str,
        day: NaiveDate,
        total: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO daily_pnl (account_id, trading_day, realized_pnl, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id, trading_day)
             DO UPDATE SET realized_pnl = excluded.realized_pnl,
                           updated_at = excluded.updated_at",
            params![account, day.to_string(), total.to_string(), fmt_ts(now)],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Lockouts
    // -------------------------------------------------------------------------

    pub fn upsert_lockout(&self, lockout: &Lockout) -> Result<()> {
        let (kind, at): (&str, Option<String>) = match &lockout.release {
            ReleaseSpec::UntilInstant(t) => ("until_instant", Some(fmt_ts(*t))),
            ReleaseSpec::UntilFlag => ("until_flag", None),
            ReleaseSpec::Manual => ("manual", None),
            ReleaseSpec::Permanent => ("permanent", None),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO lockouts
                 (account_id, rule_id, scope, reason, locked_at, release_kind, release_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(account_id, rule_id, scope)
             DO UPDATE SET reason = excluded.reason,
                           locked_at = excluded.locked_at,
                           release_kind = excluded.release_kind,
                           release_at = excluded.release_at",
            params![
                lockout.account_id,
                lockout.rule_id.code(),
                lockout.scope.to_string(),
                lockout.reason,
                fmt_ts(lockout.locked_at),
                kind,
                at,
            ],
        )?;
        Ok(())
    }

    pub fn delete_lockout(&self, account: &str, rule_id: RuleId, scope: &LockScope) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM lockouts WHERE account_id = ?1 AND rule_id = ?2 AND scope = ?3",
            params![account, rule_id.code(), scope.to_string()],
        )?;
        Ok(())
    }

    pub fn load_lockouts(&self) -> Result<Vec<Lockout>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT account_id, rule_id, scope, reason, locked_at, release_kind, release_at
             FROM lockouts",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (account_id, rule_raw, scope_raw, reason, locked_raw, kind, at) = row?;
            let rule_id = RuleId::from_code(&rule_raw)
                .with_context(|| format!("unknown rule id in store: {rule_raw}"))?;
            let scope = LockScope::parse(&scope_raw)
                .with_context(|| format!("unknown lock scope in store: {scope_raw}"))?;
            let release = match kind.as_str() {
                "until_instant" => ReleaseSpec::UntilInstant(parse_ts(
                    at.as_deref().context("until_instant lockout missing release_at")?,
                )?),
                "until_flag" => ReleaseSpec::UntilFlag,
                "manual" => ReleaseSpec::Manual,
                "permanent" => ReleaseSpec::Permanent,
                other => anyhow::bail!("unknown release kind in store: {other}"),
            };
            out.push(Lockout {
                account_id,
                rule_id,
                scope,
                reason,
                locked_at: parse_ts(&locked_raw)?,
                release,
            });
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    pub fn upsert_timer(&self, account: &str, tag: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO timers (account_id, tag, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(account_id, tag) DO UPDATE SET expires_at = excluded.expires_at",
            params![account, tag, fmt_ts(expires_at)],
        )?;
        Ok(())
    }

    pub fn delete_timer(&self, account: &str, tag: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM timers WHERE account_id = ?1 AND tag = ?2",
            params![account, tag],
        )?;
        Ok(())
    }

    pub fn load_timers(&self) -> Result<Vec<(AccountId, String, DateTime<Utc>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT account_id, tag, expires_at FROM timers")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (account, tag, raw) = row?;
            out.push((account, tag, parse_ts(&raw)?));
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Trade counts
    // -------------------------------------------------------------------------

    /// Record one trade. Returns false when this trade id was already seen,
    /// which is how re-delivered events are deduplicated.
    pub fn insert_trade_count(
        &self,
        trade_id: &str,
        account: &str,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO trade_counts (trade_id, account_id, ts) VALUES (?1, ?2, ?3)",
            params![trade_id, account, fmt_ts(ts)],
        )?;
        Ok(inserted > 0)
    }

    pub fn count_trades_since(&self, account: &str, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM trade_counts WHERE account_id = ?1 AND ts >= ?2",
            params![account, fmt_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn prune_trade_counts(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn
            .execute("DELETE FROM trade_counts WHERE ts < ?1", params![fmt_ts(before)])?;
        Ok(removed)
    }

    // -------------------------------------------------------------------------
    // Position extremes
    // -------------------------------------------------------------------------

    pub fn upsert_extremes(
        &self,
        account: &str,
        symbol: &str,
        high: Decimal,
        low: Decimal,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO position_extremes (account_id, symbol, high, low)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account_id, symbol)
             DO UPDATE SET high = excluded.high, low = excluded.low",
            params![account, symbol, high.to_string(), low.to_string()],
        )?;
        Ok(())
    }

    pub fn delete_extremes(&self, account: &str, symbol: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM position_extremes WHERE account_id = ?1 AND symbol = ?2",
            params![account, symbol],
        )?;
        Ok(())
    }

    pub fn load_extremes(&self) -> Result<Vec<(AccountId, String, Decimal, Decimal)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT account_id, symbol, high, low FROM position_extremes")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (account, symbol, high, low) = row?;
            out.push((account, symbol, parse_decimal(&high)?, parse_decimal(&low)?));
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Audit log
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn insert_audit(
        &self,
        id: &str,
        at: DateTime<Utc>,
        account: &str,
        rule_id: Option<RuleId>,
        symbol: Option<&str>,
        kind: &str,
        detail: &str,
        snapshot: Option<&str>,
        outcome: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log
                 (id, at, account_id, rule_id, symbol, kind, detail, snapshot, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                fmt_ts(at),
                account,
                rule_id.map(|r| r.code()),
                symbol,
                kind,
                detail,
                snapshot,
                outcome,
            ],
        )?;
        Ok(())
    }

    /// Most recent audit rows, newest first.
    pub fn recent_audit(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, at, account_id, rule_id, symbol, kind, detail, snapshot, outcome
             FROM audit_log ORDER BY at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                at: row.get(1)?,
                account_id: row.get(2)?,
                rule_id: row.get(3)?,
                symbol: row.get(4)?,
                kind: row.get(5)?,
                detail: row.get(6)?,
                snapshot: row.get(7)?,
                outcome: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Engine meta
    // -------------------------------------------------------------------------

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row("SELECT value FROM engine_meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO engine_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn last_reset_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_meta(META_LAST_RESET)?.as_deref().map(parse_ts).transpose()
    }

    pub fn set_last_reset_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(META_LAST_RESET, &fmt_ts(at))
    }

    pub fn session_start(&self, account: &str) -> Result<Option<DateTime<Utc>>> {
        self.get_meta(&format!("session_start:{account}"))?.as_deref().map(parse_ts).transpose()
    }

    pub fn set_session_start(&self, account: &str, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(&format!("session_start:{account}"), &fmt_ts(at))
    }
}

// =============================================================================
// Tests
// =============================================================================
