//! SQLite persistence: the zone mirror and the append-only run history.
//!
//! `History` is the single writer and is owned by the scheduler. It keeps an
//! in-memory index of the open (still running) record per zone so closing a
//! run never scans the table. `HistoryReader` is the read-only handle given
//! to the web layer.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::adjust::Adjustment;
use crate::schedule::Zone;

const RUN_COLUMNS: &str = "id, zone_id, started_at, stopped_at, programmed_sec, baseline_sec, \
                           adjustment_kind, adjustment_factor, trigger_key, outcome";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// How a run ended (or that it has not ended yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Completed,
    Stopped,
    Skipped,
    Failed,
    Interrupted,
    Shutdown,
    Missed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Running => "running",
            Outcome::Completed => "completed",
            Outcome::Stopped => "stopped",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
            Outcome::Interrupted => "interrupted",
            Outcome::Shutdown => "shutdown",
            Outcome::Missed => "missed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Outcome::Running,
            "completed" => Outcome::Completed,
            "stopped" => Outcome::Stopped,
            "skipped" => Outcome::Skipped,
            "failed" => Outcome::Failed,
            "interrupted" => Outcome::Interrupted,
            "shutdown" => Outcome::Shutdown,
            "missed" => Outcome::Missed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub zone_id: u8,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
    pub programmed_sec: i64,
    pub baseline_sec: i64,
    pub adjustment: Adjustment,
    pub trigger: Option<String>,
    pub outcome: Outcome,
}

/// A record about to be appended. Any outcome other than `Running` is
/// written already closed, with stop = start.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub zone_id: u8,
    pub started_at: i64,
    pub programmed_sec: i64,
    pub baseline_sec: i64,
    pub adjustment: Adjustment,
    pub trigger: Option<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub zone_id: Option<u8>,
    pub since: Option<i64>,
    pub limit: Option<i64>,
}

pub fn unix(t: OffsetDateTime) -> i64 {
    t.unix_timestamp()
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/sprinkler/history.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Zone mirror
    // ----------------------------

    pub async fn upsert_zone(&self, z: &Zone) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO zones (zone_id, name, enabled, baseline_sec, gpio_pin)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(zone_id) DO UPDATE SET
              name=excluded.name,
              enabled=excluded.enabled,
              baseline_sec=excluded.baseline_sec,
              gpio_pin=excluded.gpio_pin
            "#,
        )
        .bind(z.id as i64)
        .bind(&z.name)
        .bind(z.enabled)
        .bind(z.baseline_sec)
        .bind(z.gpio_pin as i64)
        .execute(&self.pool)
        .await
        .context("upsert_zone failed")?;
        Ok(())
    }

    pub async fn load_zones(&self) -> Result<Vec<Zone>> {
        let rows = sqlx::query(
            "SELECT zone_id, name, enabled, baseline_sec, gpio_pin FROM zones ORDER BY zone_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("load_zones failed")?;

        rows.iter()
            .map(|r| {
                Ok(Zone {
                    id: r.try_get::<i64, _>("zone_id")? as u8,
                    name: r.try_get("name")?,
                    enabled: r.try_get("enabled")?,
                    baseline_sec: r.try_get("baseline_sec")?,
                    gpio_pin: r.try_get::<i64, _>("gpio_pin")? as u8,
                })
            })
            .collect()
    }

    // ----------------------------
    // Run history (shared by writer and reader)
    // ----------------------------

    async fn query_runs(&self, f: &HistoryFilter) -> Result<Vec<RunRecord>> {
        let zone = f.zone_id.map(|z| z as i64);
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE (? IS NULL OR zone_id = ?)
              AND (? IS NULL OR started_at >= ?)
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(zone)
            .bind(zone)
            .bind(f.since)
            .bind(f.since)
            .bind(f.limit.unwrap_or(50))
            .fetch_all(&self.pool)
            .await
            .context("query runs failed")?;

        rows.iter().map(row_to_record).collect()
    }

    async fn latest_runs_per_zone(&self) -> Result<Vec<RunRecord>> {
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs r
            WHERE r.id = (
              SELECT id FROM runs
              WHERE zone_id = r.zone_id
              ORDER BY started_at DESC, id DESC
              LIMIT 1
            )
            ORDER BY zone_id
            "#
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("latest_runs_per_zone failed")?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(r: &SqliteRow) -> Result<RunRecord> {
    let kind: String = r.try_get("adjustment_kind")?;
    let factor: Option<f64> = r.try_get("adjustment_factor")?;
    let adjustment = Adjustment::from_parts(&kind, factor)
        .with_context(|| format!("bad adjustment_kind '{kind}'"))?;

    let outcome: String = r.try_get("outcome")?;
    let outcome =
        Outcome::parse(&outcome).with_context(|| format!("bad run outcome '{outcome}'"))?;

    Ok(RunRecord {
        id: r.try_get("id")?,
        zone_id: r.try_get::<i64, _>("zone_id")? as u8,
        started_at: r.try_get("started_at")?,
        stopped_at: r.try_get("stopped_at")?,
        programmed_sec: r.try_get("programmed_sec")?,
        baseline_sec: r.try_get("baseline_sec")?,
        adjustment,
        trigger: r.try_get("trigger_key")?,
        outcome,
    })
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

pub struct History {
    db: Db,
    open: HashMap<u8, i64>, // zone_id -> id of its open record
}

impl History {
    /// Load the open-record index from disk. Records left open by a crash
    /// show up here until `reconcile_interrupted` closes them.
    pub async fn open(db: Db) -> Result<Self> {
        let rows = sqlx::query("SELECT id, zone_id FROM runs WHERE stopped_at IS NULL")
            .fetch_all(&db.pool)
            .await
            .context("load open runs failed")?;

        let mut open = HashMap::new();
        for r in &rows {
            let id: i64 = r.try_get("id")?;
            let zone: i64 = r.try_get("zone_id")?;
            open.insert(zone as u8, id);
        }

        Ok(Self { db, open })
    }

    pub fn reader(&self) -> HistoryReader {
        HistoryReader {
            db: self.db.clone(),
        }
    }

    pub fn open_run(&self, zone_id: u8) -> Option<i64> {
        self.open.get(&zone_id).copied()
    }

    pub async fn append(&mut self, run: NewRun) -> Result<RunRecord> {
        let is_open = run.outcome == Outcome::Running;
        if is_open && self.open.contains_key(&run.zone_id) {
            bail!("zone {} already has an open run", run.zone_id);
        }

        let stopped_at = if is_open { None } else { Some(run.started_at) };
        let (kind, factor) = run.adjustment.to_parts();

        let sql = format!(
            r#"
            INSERT INTO runs (
              zone_id, started_at, stopped_at, programmed_sec, baseline_sec,
              adjustment_kind, adjustment_factor, trigger_key, outcome
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(run.zone_id as i64)
            .bind(run.started_at)
            .bind(stopped_at)
            .bind(run.programmed_sec)
            .bind(run.baseline_sec)
            .bind(kind)
            .bind(factor)
            .bind(&run.trigger)
            .bind(run.outcome.as_str())
            .fetch_one(&self.db.pool)
            .await
            .with_context(|| format!("append run failed zone={}", run.zone_id))?;

        let record = row_to_record(&row)?;
        if is_open {
            self.open.insert(record.zone_id, record.id);
        }
        Ok(record)
    }

    /// Close the zone's open record. Returns `None` if the zone had none.
    /// A stop time earlier than the start is raised to the start.
    pub async fn update_open_record(
        &mut self,
        zone_id: u8,
        stopped_at: i64,
        outcome: Outcome,
    ) -> Result<Option<RunRecord>> {
        let Some(&id) = self.open.get(&zone_id) else {
            return Ok(None);
        };

        let sql = format!(
            r#"
            UPDATE runs
            SET stopped_at = MAX(?, started_at), outcome = ?
            WHERE id = ? AND stopped_at IS NULL
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(stopped_at)
            .bind(outcome.as_str())
            .bind(id)
            .fetch_optional(&self.db.pool)
            .await
            .with_context(|| format!("close run failed zone={zone_id} id={id}"))?;

        self.open.remove(&zone_id);
        row.as_ref().map(row_to_record).transpose()
    }

    /// Close every record left open by a previous process, flagged
    /// `interrupted`, with stop = `now`.
    pub async fn reconcile_interrupted(&mut self, now: i64) -> Result<Vec<RunRecord>> {
        let mut zones: Vec<u8> = self.open.keys().copied().collect();
        zones.sort_unstable();

        let mut closed = Vec::with_capacity(zones.len());
        for zone in zones {
            if let Some(r) = self
                .update_open_record(zone, now, Outcome::Interrupted)
                .await?
            {
                closed.push(r);
            }
        }
        Ok(closed)
    }

    /// Latest start time recorded under each trigger key.
    pub async fn last_trigger_starts(&self) -> Result<HashMap<String, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_key, MAX(started_at) AS last_start
            FROM runs
            WHERE trigger_key IS NOT NULL
            GROUP BY trigger_key
            "#,
        )
        .fetch_all(&self.db.pool)
        .await
        .context("last_trigger_starts failed")?;

        rows.iter()
            .map(|r| Ok((r.try_get("trigger_key")?, r.try_get("last_start")?)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only view of the run history.
#[derive(Clone)]
pub struct HistoryReader {
    db: Db,
}

impl HistoryReader {
    pub async fn query(&self, f: &HistoryFilter) -> Result<Vec<RunRecord>> {
        self.db.query_runs(f).await
    }

    /// Most recent record per zone, ascending zone id.
    pub async fn latest_per_zone(&self) -> Result<Vec<RunRecord>> {
        self.db.latest_runs_per_zone().await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        for id in 1..=3u8 {
            db.upsert_zone(&Zone {
                id,
                name: format!("Zone {id}"),
                enabled: true,
                baseline_sec: 600,
                gpio_pin: 16 + id,
            })
            .await
            .unwrap();
        }
        db
    }

    fn new_run(zone_id: u8, started_at: i64, outcome: Outcome) -> NewRun {
        NewRun {
            zone_id,
            started_at,
            programmed_sec: 300,
            baseline_sec: 600,
            adjustment: Adjustment::Weather(0.5),
            trigger: Some(format!("{zone_id}@06:00")),
            outcome,
        }
    }

    #[tokio::test]
    async fn append_then_close() {
        let mut h = History::open(seeded_db().await).await.unwrap();

        let rec = h.append(new_run(1, 1_000, Outcome::Running)).await.unwrap();
        assert!(rec.stopped_at.is_none());
        assert_eq!(h.open_run(1), Some(rec.id));

        let closed = h
            .update_open_record(1, 1_300, Outcome::Completed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.stopped_at, Some(1_300));
        assert_eq!(closed.outcome, Outcome::Completed);
        assert_eq!(closed.adjustment, Adjustment::Weather(0.5));
        assert_eq!(h.open_run(1), None);
    }

    #[tokio::test]
    async fn second_open_record_for_zone_rejected() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        h.append(new_run(1, 1_000, Outcome::Running)).await.unwrap();

        let err = h.append(new_run(1, 1_010, Outcome::Running)).await;
        assert!(err.is_err());

        // Another zone is unaffected.
        h.append(new_run(2, 1_010, Outcome::Running)).await.unwrap();
    }

    #[tokio::test]
    async fn closed_outcomes_are_written_closed() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        let rec = h.append(new_run(1, 1_000, Outcome::Skipped)).await.unwrap();
        assert_eq!(rec.stopped_at, Some(1_000));
        assert_eq!(h.open_run(1), None);

        // A skipped record does not block a later real run.
        h.append(new_run(1, 1_001, Outcome::Running)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_is_raised_to_start() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        h.append(new_run(1, 1_000, Outcome::Running)).await.unwrap();
        let closed = h
            .update_open_record(1, 900, Outcome::Stopped)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed.stopped_at, Some(1_000));
    }

    #[tokio::test]
    async fn closing_zone_without_open_record_is_none() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        let r = h.update_open_record(2, 1_000, Outcome::Stopped).await.unwrap();
        assert!(r.is_none());
    }

    #[tokio::test]
    async fn restart_reconciles_open_record_as_interrupted() {
        let db = seeded_db().await;
        {
            let mut h = History::open(db.clone()).await.unwrap();
            h.append(new_run(3, 1_000, Outcome::Running)).await.unwrap();
            // Process "crashes" here without closing the record.
        }

        let mut h = History::open(db).await.unwrap();
        assert!(h.open_run(3).is_some());

        let closed = h.reconcile_interrupted(5_000).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].zone_id, 3);
        assert_eq!(closed[0].stopped_at, Some(5_000));
        assert_eq!(closed[0].outcome, Outcome::Interrupted);
        assert_eq!(h.open_run(3), None);
    }

    #[tokio::test]
    async fn query_filters_and_orders_newest_first() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        for (zone, t) in [(1u8, 100i64), (2, 200), (1, 300), (1, 400)] {
            h.append(new_run(zone, t, Outcome::Skipped)).await.unwrap();
        }

        let reader = h.reader();
        let all = reader.query(&HistoryFilter::default()).await.unwrap();
        let starts: Vec<i64> = all.iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![400, 300, 200, 100]);

        let zone1 = reader
            .query(&HistoryFilter {
                zone_id: Some(1),
                since: Some(200),
                limit: None,
            })
            .await
            .unwrap();
        let starts: Vec<i64> = zone1.iter().map(|r| r.started_at).collect();
        assert_eq!(starts, vec![400, 300]);

        let limited = reader
            .query(&HistoryFilter {
                limit: Some(1),
                ..HistoryFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn latest_per_zone_and_trigger_starts() {
        let mut h = History::open(seeded_db().await).await.unwrap();
        h.append(new_run(1, 100, Outcome::Skipped)).await.unwrap();
        h.append(new_run(1, 500, Outcome::Skipped)).await.unwrap();
        h.append(NewRun {
            trigger: None,
            adjustment: Adjustment::Manual,
            ..new_run(2, 300, Outcome::Running)
        })
        .await
        .unwrap();

        let latest = h.reader().latest_per_zone().await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].started_at, 500);
        assert_eq!(latest[1].adjustment, Adjustment::Manual);

        let triggers = h.last_trigger_starts().await.unwrap();
        assert_eq!(triggers.get("1@06:00"), Some(&500));
        assert_eq!(triggers.len(), 1);
    }
}
