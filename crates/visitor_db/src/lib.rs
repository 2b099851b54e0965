//! SQLite-backed store for visitors, fingerprints, sessions and the daily
//! rollup.
//!
//! This is the single source of truth the matching engine addresses through
//! a narrow interface: indexed most-recent lookups on the three hash
//! columns, bounded recency scans feeding the fuzzy layers, transactional
//! visit terminals (fingerprint + session all-or-nothing), an atomic
//! daily-stats upsert, and the derived trust-cache update on the visitor
//! row.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use uuid::Uuid;

use visit_models::{
    DailyStatsRow, FingerprintRecord, MatchType, NewFingerprint, RequestMeta, SessionLite,
    TrustLevel, VisitorRecord,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown visitor {0}")]
    UnknownVisitor(Uuid),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// One candidate from a bounded recency scan.
#[derive(Debug, Clone)]
pub struct HashCandidate {
    pub fp_id: Uuid,
    pub visitor_id: Uuid,
    pub hash: String,
}

/// Derived trust attributes cached on the visitor row. Last-writer-wins
/// under concurrency; the crowd scorer is the authority.
#[derive(Debug, Clone)]
pub struct TrustCacheUpdate {
    pub trust_level: TrustLevel,
    pub crowd_score: f64,
    pub unique_ips: u32,
    pub visit_count: u32,
    pub last_score_update: i64,
}

/// Read-back view for the response payload: the visitor row plus its most
/// recent sessions and aggregate counts.
#[derive(Debug, Clone)]
pub struct VisitorView {
    pub visitor: VisitorRecord,
    pub visit_count: u64,
    pub last_visit: Option<i64>,
    pub recent: Vec<RecentSessionRow>,
}

#[derive(Debug, Clone)]
pub struct RecentSessionRow {
    pub first_seen: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn uuid_col(r: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = r.get(idx)?;
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn fp_from_row(r: &Row<'_>) -> rusqlite::Result<FingerprintRecord> {
    let components_raw: String = r.get(6)?;
    Ok(FingerprintRecord {
        id: uuid_col(r, 0)?,
        visitor_id: uuid_col(r, 1)?,
        fingerprint_hash: r.get(2)?,
        fuzzy_hash: r.get(3)?,
        stable_hash: r.get(4)?,
        gpu_timing_hash: r.get(5)?,
        components: serde_json::from_str(&components_raw).unwrap_or(serde_json::Value::Null),
        entropy: r.get(7)?,
        confidence: r.get(8)?,
        is_farbled: r.get::<_, i64>(9)? != 0,
        created_at: r.get(10)?,
    })
}

const FP_COLUMNS: &str = "id, visitor_id, fingerprint_hash, fuzzy_hash, stable_hash, \
     gpu_timing_hash, components, entropy, confidence, is_farbled, created_at";

fn visitor_from_row(r: &Row<'_>) -> rusqlite::Result<VisitorRecord> {
    let level: String = r.get(3)?;
    Ok(VisitorRecord {
        id: uuid_col(r, 0)?,
        created_at: r.get(1)?,
        updated_at: r.get(2)?,
        trust_level: TrustLevel::parse(&level),
        crowd_score: r.get(4)?,
        unique_ips: r.get::<_, i64>(5)? as u32,
        visit_count: r.get::<_, i64>(6)? as u32,
        last_score_update: r.get(7)?,
    })
}

pub struct VisitorDb {
    conn: Mutex<Connection>,
}

impl VisitorDb {
    /// Open or create the store at the given path and run migrations.
    pub fn open(path: &str) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store, used by tests and ephemeral setups.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement cannot leave a half-applied write behind
        // (sqlite statements are atomic), so a poisoned lock is recoverable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS visitors (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                trust_level TEXT NOT NULL DEFAULT 'NEW',
                crowd_score REAL NOT NULL DEFAULT 0,
                unique_ips INTEGER NOT NULL DEFAULT 0,
                visit_count INTEGER NOT NULL DEFAULT 0,
                last_score_update INTEGER
            );

            CREATE TABLE IF NOT EXISTS fingerprints (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL REFERENCES visitors(id),
                fingerprint_hash TEXT NOT NULL,
                fuzzy_hash TEXT NOT NULL,
                stable_hash TEXT,
                gpu_timing_hash TEXT,
                components JSON NOT NULL,
                entropy REAL,
                confidence REAL NOT NULL,
                is_farbled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            -- fingerprint_hash is indexed but NOT unique: two visitors may
            -- collide and each retain their rows; retrieval is most-recent.
            CREATE INDEX IF NOT EXISTS idx_fp_exact ON fingerprints(fingerprint_hash, created_at);
            CREATE INDEX IF NOT EXISTS idx_fp_stable ON fingerprints(stable_hash, created_at);
            CREATE INDEX IF NOT EXISTS idx_fp_gpu ON fingerprints(gpu_timing_hash, created_at);
            CREATE INDEX IF NOT EXISTS idx_fp_created ON fingerprints(created_at);

            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL REFERENCES visitors(id),
                fingerprint_id TEXT NOT NULL REFERENCES fingerprints(id),
                ip_address TEXT,
                user_agent TEXT,
                referer TEXT,
                tls_ja4 TEXT,
                tls_ja3 TEXT,
                header_order_hash TEXT,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_visitor_ts ON sessions(visitor_id, first_seen);

            CREATE TABLE IF NOT EXISTS daily_stats (
                date TEXT NOT NULL UNIQUE,
                total INTEGER NOT NULL DEFAULT 0,
                unique_visitors INTEGER NOT NULL DEFAULT 0,
                exact_hits INTEGER NOT NULL DEFAULT 0,
                stable_hits INTEGER NOT NULL DEFAULT 0,
                gpu_hits INTEGER NOT NULL DEFAULT 0,
                fuzzy_stable_hits INTEGER NOT NULL DEFAULT 0,
                fuzzy_hits INTEGER NOT NULL DEFAULT 0,
                new_visitors INTEGER NOT NULL DEFAULT 0,
                avg_entropy REAL NOT NULL DEFAULT 0,
                entropy_samples INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    // ===== Indexed lookups =====

    /// Most recently created row carrying this exact hash, if any.
    pub fn find_fp_by_exact_hash(&self, hash: &str) -> Result<Option<FingerprintRecord>> {
        self.find_fp_by("fingerprint_hash", hash)
    }

    pub fn find_fp_by_stable_hash(&self, hash: &str) -> Result<Option<FingerprintRecord>> {
        self.find_fp_by("stable_hash", hash)
    }

    pub fn find_fp_by_gpu_timing_hash(&self, hash: &str) -> Result<Option<FingerprintRecord>> {
        self.find_fp_by("gpu_timing_hash", hash)
    }

    fn find_fp_by(&self, column: &str, hash: &str) -> Result<Option<FingerprintRecord>> {
        // `column` is one of three fixed identifiers above, never user input.
        let sql = format!(
            "SELECT {FP_COLUMNS} FROM fingerprints
             WHERE {column} = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        );
        let conn = self.conn();
        let row = conn.query_row(&sql, params![hash], fp_from_row).optional()?;
        Ok(row)
    }

    pub fn get_fingerprint(&self, id: &Uuid) -> Result<Option<FingerprintRecord>> {
        let sql = format!("SELECT {FP_COLUMNS} FROM fingerprints WHERE id = ?1");
        let conn = self.conn();
        let row = conn
            .query_row(&sql, params![id.to_string()], fp_from_row)
            .optional()?;
        Ok(row)
    }

    // ===== Bounded recency scans =====

    /// Most-recent-first window of rows with a usable stable hash.
    ///
    /// The limit is a policy constant sized for response time, not recall:
    /// a candidate that fell out of the window is accepted as a miss.
    pub fn scan_recent_stable_hashes(&self, limit: usize) -> Result<Vec<HashCandidate>> {
        self.scan_recent("stable_hash", limit)
    }

    /// Most-recent-first window of fuzzy hashes.
    pub fn scan_recent_fuzzy_hashes(&self, limit: usize) -> Result<Vec<HashCandidate>> {
        self.scan_recent("fuzzy_hash", limit)
    }

    fn scan_recent(&self, column: &str, limit: usize) -> Result<Vec<HashCandidate>> {
        let sql = format!(
            "SELECT id, visitor_id, {column} FROM fingerprints
             WHERE {column} IS NOT NULL AND {column} != ''
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], |r| {
            Ok(HashCandidate {
                fp_id: uuid_col(r, 0)?,
                visitor_id: uuid_col(r, 1)?,
                hash: r.get(2)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ===== Visit terminals (transactional) =====

    /// Layer-1 terminal: the submission matched an existing row exactly, so
    /// only a session is written.
    pub fn record_visit_existing_fp(
        &self,
        visitor_id: &Uuid,
        fp_id: &Uuid,
        meta: &RequestMeta,
    ) -> Result<Uuid> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let session_id = insert_session(&tx, visitor_id, fp_id, meta)?;
        touch_visitor(&tx, visitor_id)?;
        tx.commit()?;
        Ok(session_id)
    }

    /// Layer 2-5 terminal: new fingerprint row under a matched visitor plus
    /// the session, in one transaction.
    pub fn record_visit_new_fp(
        &self,
        visitor_id: &Uuid,
        record: &NewFingerprint,
        meta: &RequestMeta,
    ) -> Result<(Uuid, Uuid)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM visitors WHERE id = ?1",
                params![visitor_id.to_string()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(DbError::UnknownVisitor(*visitor_id));
        }
        let fp_id = insert_fingerprint(&tx, visitor_id, record)?;
        let session_id = insert_session(&tx, visitor_id, &fp_id, meta)?;
        touch_visitor(&tx, visitor_id)?;
        tx.commit()?;
        Ok((fp_id, session_id))
    }

    /// Layer-6 terminal: visitor, first fingerprint and session, atomically.
    ///
    /// `preset_id` re-introduces a prior visitor id carried by a valid
    /// signed token; when the row already exists it is reused as-is.
    pub fn record_visit_new_visitor(
        &self,
        preset_id: Option<Uuid>,
        record: &NewFingerprint,
        meta: &RequestMeta,
    ) -> Result<(Uuid, Uuid, Uuid)> {
        let visitor_id = preset_id.unwrap_or_else(Uuid::new_v4);
        let ts = now_ms();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO visitors (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![visitor_id.to_string(), ts],
        )?;
        let fp_id = insert_fingerprint(&tx, &visitor_id, record)?;
        let session_id = insert_session(&tx, &visitor_id, &fp_id, meta)?;
        tx.commit()?;
        Ok((visitor_id, fp_id, session_id))
    }

    // ===== Rollup and trust cache =====

    /// Atomic upsert of the daily counters; `date` is a UTC calendar date
    /// (`YYYY-MM-DD`). Increments happen inside the statement so concurrent
    /// writers cannot lose updates; the running entropy average folds the
    /// new sample in the same statement.
    pub fn upsert_daily_stats(
        &self,
        date: &str,
        match_type: MatchType,
        entropy: Option<f64>,
    ) -> Result<()> {
        let f = |t: MatchType| i64::from(match_type == t);
        let is_new = f(MatchType::New);
        self.conn().execute(
            "INSERT INTO daily_stats (date, total, unique_visitors, exact_hits, stable_hits, \
                 gpu_hits, fuzzy_stable_hits, fuzzy_hits, new_visitors, avg_entropy, entropy_samples)
             VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7, ?2, COALESCE(?8, 0),
                     CASE WHEN ?8 IS NULL THEN 0 ELSE 1 END)
             ON CONFLICT(date) DO UPDATE SET
                 total = total + 1,
                 unique_visitors = unique_visitors + ?2,
                 exact_hits = exact_hits + ?3,
                 stable_hits = stable_hits + ?4,
                 gpu_hits = gpu_hits + ?5,
                 fuzzy_stable_hits = fuzzy_stable_hits + ?6,
                 fuzzy_hits = fuzzy_hits + ?7,
                 new_visitors = new_visitors + ?2,
                 avg_entropy = CASE WHEN ?8 IS NULL THEN avg_entropy
                     ELSE (avg_entropy * entropy_samples + ?8) / (entropy_samples + 1) END,
                 entropy_samples = entropy_samples + (CASE WHEN ?8 IS NULL THEN 0 ELSE 1 END)",
            params![
                date,
                is_new,
                f(MatchType::Exact),
                f(MatchType::Stable),
                f(MatchType::Gpu),
                f(MatchType::FuzzyStable),
                f(MatchType::Fuzzy),
                entropy,
            ],
        )?;
        Ok(())
    }

    /// Rollup read-back, newest first.
    pub fn daily_stats(&self, days: usize) -> Result<Vec<DailyStatsRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT date, total, unique_visitors, exact_hits, stable_hits, gpu_hits, \
                 fuzzy_stable_hits, fuzzy_hits, new_visitors, avg_entropy
             FROM daily_stats ORDER BY date DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![days as i64], |r| {
            Ok(DailyStatsRow {
                date: r.get(0)?,
                total: r.get::<_, i64>(1)? as u64,
                unique_visitors: r.get::<_, i64>(2)? as u64,
                exact: r.get::<_, i64>(3)? as u64,
                stable: r.get::<_, i64>(4)? as u64,
                gpu: r.get::<_, i64>(5)? as u64,
                fuzzy_stable: r.get::<_, i64>(6)? as u64,
                fuzzy: r.get::<_, i64>(7)? as u64,
                new: r.get::<_, i64>(8)? as u64,
                avg_entropy: r.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Last-writer-wins refresh of the derived trust attributes.
    pub fn update_visitor_trust(&self, visitor_id: &Uuid, cache: &TrustCacheUpdate) -> Result<()> {
        self.conn().execute(
            "UPDATE visitors SET trust_level = ?2, crowd_score = ?3, unique_ips = ?4, \
                 visit_count = ?5, last_score_update = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                visitor_id.to_string(),
                cache.trust_level.as_str(),
                cache.crowd_score,
                cache.unique_ips as i64,
                cache.visit_count as i64,
                cache.last_score_update,
                now_ms(),
            ],
        )?;
        Ok(())
    }

    // ===== Reads for the scorer and the response =====

    pub fn get_visitor(&self, id: &Uuid) -> Result<Option<VisitorRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, created_at, updated_at, trust_level, crowd_score, unique_ips, \
                     visit_count, last_score_update
                 FROM visitors WHERE id = ?1",
                params![id.to_string()],
                visitor_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Sessions of one visitor since `since_ms`, newest first. Only the
    /// fields the crowd scorer consumes.
    pub fn recent_sessions(&self, visitor_id: &Uuid, since_ms: i64) -> Result<Vec<SessionLite>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ip_address, first_seen FROM sessions
             WHERE visitor_id = ?1 AND first_seen >= ?2
             ORDER BY first_seen DESC",
        )?;
        let rows = stmt.query_map(params![visitor_id.to_string(), since_ms], |r| {
            Ok(SessionLite {
                ip_address: r.get(0)?,
                first_seen: r.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Visitor row plus its latest `n` sessions and aggregate counts, for
    /// the response payload.
    pub fn visitor_with_recent(&self, visitor_id: &Uuid, n: usize) -> Result<Option<VisitorView>> {
        let visitor = match self.get_visitor(visitor_id)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let conn = self.conn();
        let (visit_count, last_visit): (i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MAX(first_seen) FROM sessions WHERE visitor_id = ?1",
            params![visitor_id.to_string()],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let mut stmt = conn.prepare(
            "SELECT first_seen, ip_address, user_agent FROM sessions
             WHERE visitor_id = ?1 ORDER BY first_seen DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![visitor_id.to_string(), n as i64], |r| {
            Ok(RecentSessionRow {
                first_seen: r.get(0)?,
                ip_address: r.get(1)?,
                user_agent: r.get(2)?,
            })
        })?;
        let mut recent = Vec::new();
        for row in rows {
            recent.push(row?);
        }
        Ok(Some(VisitorView {
            visitor,
            visit_count: visit_count as u64,
            last_visit,
            recent,
        }))
    }
}

fn insert_fingerprint(
    tx: &rusqlite::Transaction<'_>,
    visitor_id: &Uuid,
    record: &NewFingerprint,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    // Normalize the empty-string sentinel to NULL at the write boundary so
    // the scans never see it.
    let stable = record.stable_hash.as_deref().filter(|s| !s.is_empty());
    let gpu = record.gpu_timing_hash.as_deref().filter(|s| !s.is_empty());
    tx.execute(
        "INSERT INTO fingerprints (id, visitor_id, fingerprint_hash, fuzzy_hash, stable_hash, \
             gpu_timing_hash, components, entropy, confidence, is_farbled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            id.to_string(),
            visitor_id.to_string(),
            record.fingerprint_hash,
            record.fuzzy_hash,
            stable,
            gpu,
            record.components.to_string(),
            record.entropy,
            record.confidence,
            record.is_farbled as i64,
            now_ms(),
        ],
    )?;
    Ok(id)
}

fn insert_session(
    tx: &rusqlite::Transaction<'_>,
    visitor_id: &Uuid,
    fp_id: &Uuid,
    meta: &RequestMeta,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let ts = now_ms();
    tx.execute(
        "INSERT INTO sessions (id, visitor_id, fingerprint_id, ip_address, user_agent, referer, \
             tls_ja4, tls_ja3, header_order_hash, first_seen, last_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id.to_string(),
            visitor_id.to_string(),
            fp_id.to_string(),
            meta.ip_address,
            meta.user_agent,
            meta.referer,
            meta.tls_ja4,
            meta.tls_ja3,
            meta.header_order_hash,
            ts,
        ],
    )?;
    Ok(id)
}

fn touch_visitor(tx: &rusqlite::Transaction<'_>, visitor_id: &Uuid) -> Result<()> {
    tx.execute(
        "UPDATE visitors SET updated_at = ?2 WHERE id = ?1",
        params![visitor_id.to_string(), now_ms()],
    )?;
    Ok(())
}
