//! Job persistence on SQLite. Every worker checks its connection out of
//! the pool, so no handle is ever shared across workers; a 30 s busy
//! timeout guards concurrent writers. Writes touching a single row are
//! atomic; there are no cross-row transactions.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    Candidate, DecisionType, InputRow, InputRowCreate, Job, JobCounters, JobMode, JobStatus,
    ResolvedComponent, RowResult, RowStatus,
};
use crate::normalize::NormalizedRow;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    mode        TEXT NOT NULL CHECK(mode IN ('auto', 'review')),
    status      TEXT NOT NULL DEFAULT 'created',
    created_at  TEXT NOT NULL,
    total_rows  INTEGER NOT NULL DEFAULT 0,
    done_rows   INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS input_rows (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id               TEXT NOT NULL REFERENCES jobs(id),
    row_index            INTEGER NOT NULL,
    bezeichnung          TEXT NOT NULL,
    referenzeinheit      TEXT NOT NULL,
    produktinformationen TEXT,
    scope                TEXT,
    kategorie            TEXT,
    unterkategorie       TEXT,
    region               TEXT,
    referenzjahr         TEXT,
    bezeichnung_norm     TEXT,
    produktinfo_norm     TEXT,
    region_norm          TEXT NOT NULL DEFAULT 'GLO',
    status               TEXT NOT NULL DEFAULT 'pending',
    error_message        TEXT
);

CREATE INDEX IF NOT EXISTS idx_input_rows_job ON input_rows(job_id, row_index);
CREATE INDEX IF NOT EXISTS idx_input_rows_status ON input_rows(job_id, status);

CREATE TABLE IF NOT EXISTS row_results (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    input_row_id    INTEGER NOT NULL REFERENCES input_rows(id),
    decision_type   TEXT NOT NULL,
    selected_uuid   TEXT,
    biogenic_t      TEXT,
    common_t        TEXT,
    beschreibung    TEXT,
    quelle          TEXT,
    detailed_calc   TEXT,
    provenance_json TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_row_results_row ON row_results(input_row_id);

CREATE TABLE IF NOT EXISTS row_candidates (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    input_row_id  INTEGER NOT NULL REFERENCES input_rows(id),
    uuid          TEXT NOT NULL,
    activity_name TEXT NOT NULL,
    product_name  TEXT NOT NULL,
    geography     TEXT NOT NULL,
    unit          TEXT NOT NULL,
    rank          INTEGER NOT NULL,
    rationale     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_row_candidates_row ON row_candidates(input_row_id);

CREATE TABLE IF NOT EXISTS row_components (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    input_row_id      INTEGER NOT NULL REFERENCES input_rows(id),
    name              TEXT NOT NULL,
    quantity          REAL NOT NULL,
    category          TEXT NOT NULL,
    matched_uuid      TEXT NOT NULL,
    matched_activity  TEXT NOT NULL,
    matched_geography TEXT NOT NULL,
    conversion_json   TEXT,
    biogenic_kg       REAL NOT NULL,
    common_kg         REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_row_components_row ON row_components(input_row_id);
"#;

/// Outcome of the resolution guard in [`JobStore::resolve_row`].
#[derive(Debug)]
pub enum ResolveGuard {
    /// Row is ambiguous and the uuid is among its saved candidates.
    Ready(InputRow),
    /// Row already calculated with this very uuid.
    AlreadyResolved,
    NotFound,
    NotAmbiguous(RowStatus),
    UnknownCandidate,
}

pub struct JobStore {
    pool: Pool<Sqlite>,
}

impl JobStore {
    /// Open (or create) the job database. `max_connections` should be
    /// the worker count plus one for the scheduler itself.
    pub async fn open(db_path: &Path, max_connections: u32) -> sqlx::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }

        Ok(Self { pool })
    }

    // ── jobs ────────────────────────────────────────────

    pub async fn create_job(&self, mode: JobMode) -> sqlx::Result<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            mode,
            status: JobStatus::Created,
            created_at: Utc::now(),
            total_rows: 0,
            done_rows: 0,
        };
        sqlx::query(
            "INSERT INTO jobs (id, mode, status, created_at, total_rows, done_rows)
             VALUES (?, ?, ?, ?, 0, 0)",
        )
        .bind(&job.id)
        .bind(job.mode.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> sqlx::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Job {
            id: r.get("id"),
            mode: JobMode::parse(&r.get::<String, _>("mode")).unwrap_or(JobMode::Auto),
            status: JobStatus::parse(&r.get::<String, _>("status")).unwrap_or(JobStatus::Error),
            created_at: r
                .get::<String, _>("created_at")
                .parse()
                .unwrap_or_else(|_| Utc::now()),
            total_rows: r.get("total_rows"),
            done_rows: r.get("done_rows"),
        }))
    }

    pub async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        done_rows: Option<i64>,
    ) -> sqlx::Result<()> {
        match done_rows {
            Some(done) => {
                sqlx::query("UPDATE jobs SET status = ?, done_rows = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(done)
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("UPDATE jobs SET status = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    // ── input rows ──────────────────────────────────────

    /// Append rows to a job in input order. Returns the new row ids.
    pub async fn add_input_rows(
        &self,
        job_id: &str,
        rows: &[InputRowCreate],
    ) -> sqlx::Result<Vec<i64>> {
        let offset: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM input_rows WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(&self.pool)
                .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let result = sqlx::query(
                "INSERT INTO input_rows
                 (job_id, row_index, bezeichnung, referenzeinheit, produktinformationen,
                  scope, kategorie, unterkategorie, region, referenzjahr)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(job_id)
            .bind(offset + i as i64)
            .bind(&row.bezeichnung)
            .bind(&row.referenzeinheit)
            .bind(&row.produktinformationen)
            .bind(&row.scope)
            .bind(&row.kategorie)
            .bind(&row.unterkategorie)
            .bind(&row.region)
            .bind(&row.referenzjahr)
            .execute(&self.pool)
            .await?;
            ids.push(result.last_insert_rowid());
        }

        sqlx::query(
            "UPDATE jobs SET total_rows = (SELECT COUNT(*) FROM input_rows WHERE job_id = ?)
             WHERE id = ?",
        )
        .bind(job_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(ids)
    }

    fn row_from_record(r: &sqlx::sqlite::SqliteRow) -> InputRow {
        InputRow {
            id: r.get("id"),
            job_id: r.get("job_id"),
            row_index: r.get("row_index"),
            bezeichnung: r.get("bezeichnung"),
            referenzeinheit: r.get("referenzeinheit"),
            produktinformationen: r.get("produktinformationen"),
            scope: r.get("scope"),
            kategorie: r.get("kategorie"),
            unterkategorie: r.get("unterkategorie"),
            region: r.get("region"),
            referenzjahr: r.get("referenzjahr"),
            bezeichnung_norm: r.get("bezeichnung_norm"),
            produktinfo_norm: r.get("produktinfo_norm"),
            region_norm: r.get("region_norm"),
            status: RowStatus::parse(&r.get::<String, _>("status")).unwrap_or(RowStatus::Error),
            error_message: r.get("error_message"),
        }
    }

    pub async fn load_row(&self, row_id: i64) -> sqlx::Result<Option<InputRow>> {
        let record = sqlx::query("SELECT * FROM input_rows WHERE id = ?")
            .bind(row_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(|r| Self::row_from_record(&r)))
    }

    pub async fn load_rows(&self, job_id: &str) -> sqlx::Result<Vec<InputRow>> {
        let records = sqlx::query("SELECT * FROM input_rows WHERE job_id = ? ORDER BY row_index")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(records.iter().map(Self::row_from_record).collect())
    }

    pub async fn update_row_status(
        &self,
        row_id: i64,
        status: RowStatus,
        error_message: Option<&str>,
    ) -> sqlx::Result<()> {
        sqlx::query("UPDATE input_rows SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(row_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist the normalised shadow fields once the normaliser ran.
    pub async fn update_row_norms(&self, row_id: i64, norms: &NormalizedRow) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE input_rows SET bezeichnung_norm = ?, produktinfo_norm = ?, region_norm = ?
             WHERE id = ?",
        )
        .bind(&norms.bezeichnung_norm)
        .bind(&norms.produktinfo_norm)
        .bind(&norms.region_norm)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── candidates ──────────────────────────────────────

    /// Replace the stored candidate set for a row.
    pub async fn save_candidates(&self, row_id: i64, candidates: &[Candidate]) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM row_candidates WHERE input_row_id = ?")
            .bind(row_id)
            .execute(&mut *tx)
            .await?;
        for c in candidates {
            sqlx::query(
                "INSERT INTO row_candidates
                 (input_row_id, uuid, activity_name, product_name, geography, unit, rank, rationale)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row_id)
            .bind(&c.uuid)
            .bind(&c.activity_name)
            .bind(&c.product_name)
            .bind(&c.geography)
            .bind(&c.unit)
            .bind(c.rank as i64)
            .bind(&c.rationale)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_candidates(&self, row_id: i64) -> sqlx::Result<Vec<Candidate>> {
        let records = sqlx::query(
            "SELECT * FROM row_candidates WHERE input_row_id = ? ORDER BY rank",
        )
        .bind(row_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records
            .iter()
            .map(|r| Candidate {
                uuid: r.get("uuid"),
                activity_name: r.get("activity_name"),
                product_name: r.get("product_name"),
                geography: r.get("geography"),
                unit: r.get("unit"),
                rank: r.get::<i64, _>("rank") as usize,
                rationale: r.get("rationale"),
            })
            .collect())
    }

    // ── results ─────────────────────────────────────────

    /// Persist a result. Replaces any earlier result for the row (the
    /// ambiguous placeholder is superseded by the resolved one).
    pub async fn save_result(&self, result: &RowResult) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM row_results WHERE input_row_id = ?")
            .bind(result.input_row_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM row_components WHERE input_row_id = ?")
            .bind(result.input_row_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO row_results
             (input_row_id, decision_type, selected_uuid, biogenic_t, common_t,
              beschreibung, quelle, detailed_calc, provenance_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(result.input_row_id)
        .bind(result.decision_type.as_str())
        .bind(&result.selected_uuid)
        .bind(&result.biogenic_t)
        .bind(&result.common_t)
        .bind(&result.beschreibung)
        .bind(&result.quelle)
        .bind(&result.detailed_calc)
        .bind(&result.provenance_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if let Some(components) = &result.components {
            for c in components {
                let conversion_json = c
                    .conversion
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .unwrap_or(None);
                sqlx::query(
                    "INSERT INTO row_components
                     (input_row_id, name, quantity, category, matched_uuid, matched_activity,
                      matched_geography, conversion_json, biogenic_kg, common_kg)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(result.input_row_id)
                .bind(&c.name)
                .bind(c.quantity)
                .bind(c.category.as_str())
                .bind(&c.matched_uuid)
                .bind(&c.matched_activity)
                .bind(&c.matched_geography)
                .bind(conversion_json)
                .bind(c.biogenic_kg)
                .bind(c.common_kg)
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(candidates) = &result.candidates {
            sqlx::query("DELETE FROM row_candidates WHERE input_row_id = ?")
                .bind(result.input_row_id)
                .execute(&mut *tx)
                .await?;
            for c in candidates {
                sqlx::query(
                    "INSERT INTO row_candidates
                     (input_row_id, uuid, activity_name, product_name, geography, unit, rank, rationale)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(result.input_row_id)
                .bind(&c.uuid)
                .bind(&c.activity_name)
                .bind(&c.product_name)
                .bind(&c.geography)
                .bind(&c.unit)
                .bind(c.rank as i64)
                .bind(&c.rationale)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_result(&self, input_row_id: i64) -> sqlx::Result<Option<RowResult>> {
        let record = sqlx::query(
            "SELECT * FROM row_results WHERE input_row_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(input_row_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = record else {
            return Ok(None);
        };

        let components = self.load_components(input_row_id).await?;
        let candidates = self.load_candidates(input_row_id).await?;

        Ok(Some(RowResult {
            input_row_id,
            decision_type: DecisionType::parse(&r.get::<String, _>("decision_type"))
                .unwrap_or(DecisionType::Match),
            selected_uuid: r.get("selected_uuid"),
            candidates: (!candidates.is_empty()).then_some(candidates),
            components: (!components.is_empty()).then_some(components),
            biogenic_t: r.get("biogenic_t"),
            common_t: r.get("common_t"),
            beschreibung: r.get("beschreibung"),
            quelle: r.get("quelle"),
            detailed_calc: r.get("detailed_calc"),
            provenance_json: r.get("provenance_json"),
        }))
    }

    async fn load_components(&self, input_row_id: i64) -> sqlx::Result<Vec<ResolvedComponent>> {
        let records = sqlx::query(
            "SELECT * FROM row_components WHERE input_row_id = ? ORDER BY id",
        )
        .bind(input_row_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records
            .iter()
            .map(|r| ResolvedComponent {
                name: r.get("name"),
                quantity: r.get("quantity"),
                category: match r.get::<String, _>("category").as_str() {
                    "energy" => crate::models::ComponentCategory::Energy,
                    "packaging" => crate::models::ComponentCategory::Packaging,
                    "transport" => crate::models::ComponentCategory::Transport,
                    "processes" => crate::models::ComponentCategory::Processes,
                    _ => crate::models::ComponentCategory::Materials,
                },
                matched_uuid: r.get("matched_uuid"),
                matched_activity: r.get("matched_activity"),
                matched_geography: r.get("matched_geography"),
                conversion: r
                    .get::<Option<String>, _>("conversion_json")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                biogenic_kg: r.get("biogenic_kg"),
                common_kg: r.get("common_kg"),
            })
            .collect())
    }

    // ── ambiguity resolution ────────────────────────────

    /// Guard an external resolution: the row must belong to the job, be
    /// suspended as ambiguous and carry the uuid among its saved
    /// candidates. A row already calculated with the same uuid passes as
    /// idempotent.
    pub async fn resolve_row(
        &self,
        job_id: &str,
        row_id: i64,
        selected_uuid: &str,
    ) -> sqlx::Result<ResolveGuard> {
        let Some(row) = self.load_row(row_id).await? else {
            return Ok(ResolveGuard::NotFound);
        };
        if row.job_id != job_id {
            return Ok(ResolveGuard::NotFound);
        }

        if row.status == RowStatus::Calculated {
            let result = self.load_result(row_id).await?;
            let same = result.and_then(|r| r.selected_uuid).as_deref() == Some(selected_uuid);
            return Ok(if same {
                ResolveGuard::AlreadyResolved
            } else {
                ResolveGuard::NotAmbiguous(row.status)
            });
        }

        if row.status != RowStatus::Ambiguous {
            return Ok(ResolveGuard::NotAmbiguous(row.status));
        }

        let candidates = self.load_candidates(row_id).await?;
        if !candidates.iter().any(|c| c.uuid == selected_uuid) {
            return Ok(ResolveGuard::UnknownCandidate);
        }

        Ok(ResolveGuard::Ready(row))
    }

    pub async fn list_ambiguous(&self, job_id: &str) -> sqlx::Result<Vec<InputRow>> {
        let records = sqlx::query(
            "SELECT * FROM input_rows WHERE job_id = ? AND status = 'ambiguous' ORDER BY row_index",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records.iter().map(Self::row_from_record).collect())
    }

    // ── counters ────────────────────────────────────────

    pub async fn counters(&self, job_id: &str) -> sqlx::Result<JobCounters> {
        let records = sqlx::query(
            "SELECT status, COUNT(*) as n FROM input_rows WHERE job_id = ? GROUP BY status",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counters = JobCounters::default();
        for r in records {
            let n: i64 = r.get("n");
            counters.total += n;
            match RowStatus::parse(&r.get::<String, _>("status")) {
                Some(RowStatus::Pending) => counters.pending += n,
                Some(RowStatus::Calculated) => counters.calculated += n,
                Some(RowStatus::Ambiguous) => counters.ambiguous += n,
                Some(RowStatus::Error) => counters.errors += n,
                Some(
                    RowStatus::Searching
                    | RowStatus::LlmDeciding
                    | RowStatus::Decomposing
                    | RowStatus::Matched,
                ) => counters.processing += n,
                None => counters.errors += n,
            }
        }
        Ok(counters)
    }
}
