#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use automation_center_domain::{
    compute_log_entry_hash, format_rfc3339, now_utc, parse_rfc3339, ActorId, ChangeEvent,
    LogEntry, LogLevel, RunId, RunRecord, RunSnapshot, RunStatus, StepId, StepRecord, StepStatus,
};
use automation_center_store_core::{AuditNote, ChangeSink, NoopChangeSink, RunStore};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use ulid::Ulid;

const STORE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  owner TEXT NOT NULL,
  definition_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','stopped')),
  created_at TEXT NOT NULL,
  finished_at TEXT,
  CHECK ((status IN ('completed','failed','stopped')) = (finished_at IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS steps (
  step_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  ordinal INTEGER NOT NULL,
  step_key TEXT NOT NULL,
  kind TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending','running','succeeded','failed','cancelled')),
  input_json TEXT NOT NULL,
  result_json TEXT,
  error_json TEXT,
  started_at TEXT,
  finished_at TEXT,
  UNIQUE(run_id, ordinal),
  UNIQUE(run_id, step_key),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TABLE IF NOT EXISTS log_entries (
  log_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  counter INTEGER NOT NULL CHECK (counter >= 1),
  level TEXT NOT NULL CHECK (level IN ('INFO','WARN','ERROR')),
  message TEXT NOT NULL,
  timestamp TEXT NOT NULL,
  prev_entry_hash TEXT,
  entry_hash TEXT NOT NULL,
  UNIQUE(run_id, counter),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_steps_run_status ON steps(run_id, status, ordinal);
CREATE INDEX IF NOT EXISTS idx_log_entries_run_counter ON log_entries(run_id, counter);

CREATE TRIGGER IF NOT EXISTS trg_log_entries_no_update
BEFORE UPDATE ON log_entries
BEGIN
  SELECT RAISE(FAIL, 'log_entries is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_log_entries_no_delete
BEFORE DELETE ON log_entries
BEGIN
  SELECT RAISE(FAIL, 'log_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs are never deleted');
END;
CREATE TRIGGER IF NOT EXISTS trg_runs_terminal_is_final
BEFORE UPDATE OF status ON runs
WHEN OLD.status IN ('completed','failed','stopped')
BEGIN
  SELECT RAISE(FAIL, 'terminal run status is final');
END;
";

const RUN_COLUMNS: &str = "run_id, owner, definition_hash, status, created_at, finished_at";

const STEP_COLUMNS: &str = "step_id, run_id, ordinal, step_key, kind, status, input_json, \
                            result_json, error_json, started_at, finished_at";

const LOG_COLUMNS: &str =
    "entry_id, run_id, counter, level, message, timestamp, prev_entry_hash, entry_hash";

/// `SQLite`-backed run store.
///
/// All access goes through one connection behind a mutex. Change events are
/// published after commit while the mutex is still held, so sink order equals
/// commit order.
pub struct SqliteRunStore {
    conn: Mutex<Connection>,
    sink: Arc<dyn ChangeSink>,
}

impl SqliteRunStore {
    /// Open or create a `SQLite` run database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
            sink: Arc::new(NoopChangeSink),
        })
    }

    #[must_use]
    pub fn with_change_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.sink.publish(event);
        }
    }
}

impl RunStore for SqliteRunStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply run store schema")?;

        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![STORE_SCHEMA_VERSION, format_rfc3339(now_utc())?],
        )
        .context("failed to record run store migration")?;
        Ok(())
    }

    fn create_run(&self, run: &RunRecord, steps: &[StepRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to begin run creation")?;

        tx.execute(
            "INSERT INTO runs(run_id, owner, definition_hash, status, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.run_id.to_string(),
                run.owner.as_str(),
                run.definition_hash,
                run.status.as_str(),
                format_rfc3339(run.created_at)?,
                run.finished_at.map(format_rfc3339).transpose()?,
            ],
        )
        .context("failed to insert run")?;

        let mut events = Vec::with_capacity(steps.len() + 1);
        events.push(ChangeEvent::Run {
            run_id: run.run_id,
            status: run.status,
        });

        for step in steps {
            if step.run_id != run.run_id {
                return Err(anyhow!(
                    "step {} belongs to run {}, not {}",
                    step.step_key,
                    step.run_id,
                    run.run_id
                ));
            }
            tx.execute(
                "INSERT INTO steps(
                    step_id, run_id, ordinal, step_key, kind, status, input_json,
                    result_json, error_json, started_at, finished_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    step.step_id.to_string(),
                    step.run_id.to_string(),
                    ordinal_to_sql(step.ordinal)?,
                    step.step_key,
                    step.kind,
                    step.status.as_str(),
                    serde_json::to_string(&step.input_json)?,
                    step.result_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    step.error_json
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    step.started_at.map(format_rfc3339).transpose()?,
                    step.finished_at.map(format_rfc3339).transpose()?,
                ],
            )
            .with_context(|| format!("failed to insert step {}", step.step_key))?;
            events.push(ChangeEvent::Step {
                run_id: step.run_id,
                step_id: step.step_id,
                ordinal: step.ordinal,
                status: step.status,
            });
        }

        tx.commit().context("failed to commit run creation")?;
        self.publish(events);
        Ok(())
    }

    fn transition_run(
        &self,
        run_id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        note: Option<AuditNote<'_>>,
    ) -> Result<bool> {
        if next.is_terminal() {
            return Ok(self.finish_run(run_id, expected, next, note)?.is_some());
        }
        if expected.is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin run transition")?;
        let changed = tx
            .execute(
                &format!(
                    "UPDATE runs SET status = ?2 WHERE run_id = ?1 AND status IN ({})",
                    sql_status_list(expected.iter().map(|status| status.as_str()))
                ),
                params![run_id.to_string(), next.as_str()],
            )
            .context("failed to transition run")?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(note) = note {
            insert_log_entry(&tx, run_id, note.level, note.message)?;
        }

        tx.commit().context("failed to commit run transition")?;
        self.sink.publish(ChangeEvent::Run {
            run_id,
            status: next,
        });
        Ok(true)
    }

    fn transition_step(
        &self,
        step_id: StepId,
        expected: StepStatus,
        next: StepStatus,
        result_json: Option<&serde_json::Value>,
        error_json: Option<&serde_json::Value>,
        note: Option<AuditNote<'_>>,
    ) -> Result<bool> {
        let now = format_rfc3339(now_utc())?;
        let started_at = (next == StepStatus::Running).then(|| now.clone());
        let finished_at = next.is_terminal().then_some(now);

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .context("failed to begin step transition")?;

        let changed = tx
            .execute(
                "UPDATE steps SET
                    status = ?3,
                    result_json = COALESCE(?4, result_json),
                    error_json = COALESCE(?5, error_json),
                    started_at = COALESCE(?6, started_at),
                    finished_at = COALESCE(?7, finished_at)
                 WHERE step_id = ?1 AND status = ?2",
                params![
                    step_id.to_string(),
                    expected.as_str(),
                    next.as_str(),
                    result_json.map(serde_json::to_string).transpose()?,
                    error_json.map(serde_json::to_string).transpose()?,
                    started_at,
                    finished_at,
                ],
            )
            .context("failed to transition step")?;
        if changed == 0 {
            return Ok(false);
        }

        let (run_id_raw, ordinal): (String, i64) = tx
            .query_row(
                "SELECT run_id, ordinal FROM steps WHERE step_id = ?1",
                params![step_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to read transitioned step")?;
        let run_id = parse_run_id(&run_id_raw)?;
        if let Some(note) = note {
            insert_log_entry(&tx, run_id, note.level, note.message)?;
        }
        let event = ChangeEvent::Step {
            run_id,
            step_id,
            ordinal: ordinal_from_sql(ordinal)?,
            status: next,
        };

        tx.commit().context("failed to commit step transition")?;
        self.sink.publish(event);
        Ok(true)
    }

    fn finish_run(
        &self,
        run_id: RunId,
        expected: &[RunStatus],
        next: RunStatus,
        note: Option<AuditNote<'_>>,
    ) -> Result<Option<Vec<StepId>>> {
        if !next.is_terminal() {
            return Err(anyhow!("finish_run requires a terminal status, got {next}"));
        }
        if expected.is_empty() {
            return Ok(None);
        }

        let now = format_rfc3339(now_utc())?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin run finish")?;

        let changed = tx
            .execute(
                &format!(
                    "UPDATE runs SET status = ?2, finished_at = ?3
                     WHERE run_id = ?1 AND status IN ({})",
                    sql_status_list(expected.iter().map(|status| status.as_str()))
                ),
                params![run_id.to_string(), next.as_str(), now],
            )
            .context("failed to finish run")?;
        if changed == 0 {
            return Ok(None);
        }

        let open_steps = {
            let mut stmt = tx.prepare(&format!(
                "SELECT step_id, ordinal FROM steps
                 WHERE run_id = ?1 AND status IN ({})
                 ORDER BY ordinal ASC",
                sql_status_list(StepStatus::OPEN.iter().map(|status| status.as_str()))
            ))?;
            let mut rows = stmt.query(params![run_id.to_string()])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let step_id_raw: String = row.get(0)?;
                out.push((parse_step_id(&step_id_raw)?, ordinal_from_sql(row.get(1)?)?));
            }
            out
        };

        tx.execute(
            &format!(
                "UPDATE steps SET status = ?2, finished_at = ?3
                 WHERE run_id = ?1 AND status IN ({})",
                sql_status_list(StepStatus::OPEN.iter().map(|status| status.as_str()))
            ),
            params![run_id.to_string(), StepStatus::Cancelled.as_str(), now],
        )
        .context("failed to cancel open steps")?;
        if let Some(note) = note {
            insert_log_entry(&tx, run_id, note.level, note.message)?;
        }

        tx.commit().context("failed to commit run finish")?;

        let mut events: Vec<ChangeEvent> = open_steps
            .iter()
            .map(|(step_id, ordinal)| ChangeEvent::Step {
                run_id,
                step_id: *step_id,
                ordinal: *ordinal,
                status: StepStatus::Cancelled,
            })
            .collect();
        events.push(ChangeEvent::Run {
            run_id,
            status: next,
        });
        self.publish(events);

        Ok(Some(open_steps.into_iter().map(|(step_id, _)| step_id).collect()))
    }

    fn append_log(
        &self,
        run_id: RunId,
        level: LogLevel,
        message: &str,
    ) -> Result<Option<LogEntry>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to begin log append")?;

        let run_exists = tx
            .query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !run_exists {
            return Ok(None);
        }

        let entry = insert_log_entry(&tx, run_id, level, message)?;
        tx.commit().context("failed to commit log entry")?;
        Ok(Some(entry))
    }

    fn get_run(&self, run_id: RunId) -> Result<Option<RunRecord>> {
        let conn = self.conn.lock();
        let mut runs = query_runs(
            &conn,
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id.to_string()],
        )?;
        Ok(runs.pop())
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();
        query_runs(
            &conn,
            &format!("SELECT {RUN_COLUMNS} FROM runs ORDER BY run_id ASC"),
            [],
        )
    }

    fn list_runs_with_status(&self, statuses: &[RunStatus]) -> Result<Vec<RunRecord>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        query_runs(
            &conn,
            &format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status IN ({}) ORDER BY run_id ASC",
                sql_status_list(statuses.iter().map(|status| status.as_str()))
            ),
            [],
        )
    }

    fn snapshot(&self, run_id: RunId) -> Result<Option<RunSnapshot>> {
        let conn = self.conn.lock();
        let Some(run) = query_runs(
            &conn,
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id.to_string()],
        )?
        .pop() else {
            return Ok(None);
        };
        let steps = query_steps(
            &conn,
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY ordinal ASC"),
            params![run_id.to_string()],
        )?;
        Ok(Some(RunSnapshot { run, steps }))
    }

    fn get_steps(&self, run_id: RunId) -> Result<Vec<StepRecord>> {
        let conn = self.conn.lock();
        query_steps(
            &conn,
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY ordinal ASC"),
            params![run_id.to_string()],
        )
    }

    fn next_pending_step(&self, run_id: RunId) -> Result<Option<StepRecord>> {
        let conn = self.conn.lock();
        let mut steps = query_steps(
            &conn,
            &format!(
                "SELECT {STEP_COLUMNS} FROM steps
                 WHERE run_id = ?1 AND status = 'pending'
                 ORDER BY ordinal ASC LIMIT 1"
            ),
            params![run_id.to_string()],
        )?;
        Ok(steps.pop())
    }

    fn list_logs(&self, run_id: RunId, after_counter: u64, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM log_entries
             WHERE run_id = ?1 AND counter > ?2
             ORDER BY counter ASC LIMIT ?3"
        ))?;
        let mut rows = stmt.query(params![
            run_id.to_string(),
            counter_to_sql(after_counter)?,
            i64::try_from(limit).unwrap_or(i64::MAX),
        ])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(log_entry_from_row(row)?);
        }
        Ok(out)
    }
}

/// Append the next entry of a run's hash chain inside an open transaction.
fn insert_log_entry(
    conn: &Connection,
    run_id: RunId,
    level: LogLevel,
    message: &str,
) -> Result<LogEntry> {
    let last: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT counter, timestamp, entry_hash FROM log_entries
             WHERE run_id = ?1 ORDER BY counter DESC LIMIT 1",
            params![run_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .context("failed to read log tail")?;

    let now = now_utc();
    let (counter, timestamp, prev_entry_hash) = match last {
        Some((counter, timestamp, entry_hash)) => (
            counter_from_sql(counter)? + 1,
            now.max(parse_rfc3339(&timestamp)?),
            Some(entry_hash),
        ),
        None => (1, now, None),
    };

    let entry_id = Ulid::new();
    let entry_hash = compute_log_entry_hash(
        entry_id,
        run_id,
        counter,
        level,
        message,
        timestamp,
        prev_entry_hash.as_deref(),
    )?;

    conn.execute(
        "INSERT INTO log_entries(
            entry_id, run_id, counter, level, message, timestamp, prev_entry_hash, entry_hash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry_id.to_string(),
            run_id.to_string(),
            counter_to_sql(counter)?,
            level.as_str(),
            message,
            format_rfc3339(timestamp)?,
            prev_entry_hash,
            entry_hash,
        ],
    )
    .context("failed to append log entry")?;

    Ok(LogEntry {
        entry_id,
        run_id,
        counter,
        level,
        message: message.to_string(),
        timestamp,
        prev_entry_hash,
        entry_hash,
    })
}

fn query_runs(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(run_from_row(row)?);
    }
    Ok(out)
}

fn query_steps(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<StepRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(step_from_row(row)?);
    }
    Ok(out)
}

fn run_from_row(row: &Row<'_>) -> Result<RunRecord> {
    Ok(RunRecord {
        run_id: parse_run_id(&row.get::<_, String>(0)?)?,
        owner: ActorId::new(row.get::<_, String>(1)?),
        definition_hash: row.get(2)?,
        status: parse_run_status(&row.get::<_, String>(3)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
        finished_at: row
            .get::<_, Option<String>>(5)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn step_from_row(row: &Row<'_>) -> Result<StepRecord> {
    let input_json: String = row.get(6)?;
    let result_json: Option<String> = row.get(7)?;
    let error_json: Option<String> = row.get(8)?;
    Ok(StepRecord {
        step_id: parse_step_id(&row.get::<_, String>(0)?)?,
        run_id: parse_run_id(&row.get::<_, String>(1)?)?,
        ordinal: ordinal_from_sql(row.get(2)?)?,
        step_key: row.get(3)?,
        kind: row.get(4)?,
        status: parse_step_status(&row.get::<_, String>(5)?)?,
        input_json: serde_json::from_str(&input_json).context("invalid input_json")?,
        result_json: result_json
            .map(|value| serde_json::from_str(&value).context("invalid result_json"))
            .transpose()?,
        error_json: error_json
            .map(|value| serde_json::from_str(&value).context("invalid error_json"))
            .transpose()?,
        started_at: row
            .get::<_, Option<String>>(9)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
        finished_at: row
            .get::<_, Option<String>>(10)?
            .map(|value| parse_rfc3339(&value))
            .transpose()?,
    })
}

fn log_entry_from_row(row: &Row<'_>) -> Result<LogEntry> {
    let entry_id_raw: String = row.get(0)?;
    let level_raw: String = row.get(3)?;
    Ok(LogEntry {
        entry_id: Ulid::from_str(&entry_id_raw)
            .map_err(|err| anyhow!("invalid entry_id ULID: {err}"))?,
        run_id: parse_run_id(&row.get::<_, String>(1)?)?,
        counter: counter_from_sql(row.get(2)?)?,
        level: LogLevel::parse(&level_raw)
            .ok_or_else(|| anyhow!("unknown log level: {level_raw}"))?,
        message: row.get(4)?,
        timestamp: parse_rfc3339(&row.get::<_, String>(5)?)?,
        prev_entry_hash: row.get(6)?,
        entry_hash: row.get(7)?,
    })
}

fn sql_status_list<'a>(statuses: impl Iterator<Item = &'a str>) -> String {
    statuses
        .map(|status| format!("'{status}'"))
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_run_status(value: &str) -> Result<RunStatus> {
    RunStatus::parse(value).ok_or_else(|| anyhow!("unknown run status: {value}"))
}

fn parse_step_status(value: &str) -> Result<StepStatus> {
    StepStatus::parse(value).ok_or_else(|| anyhow!("unknown step status: {value}"))
}

fn parse_run_id(value: &str) -> Result<RunId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(ulid))
}

fn parse_step_id(value: &str) -> Result<StepId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid step_id ULID: {err}"))?;
    Ok(StepId(ulid))
}

fn ordinal_to_sql(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("ordinal too large for sqlite"))
}

fn ordinal_from_sql(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("invalid ordinal: {value}"))
}

fn counter_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("log counter too large for sqlite"))
}

fn counter_from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("invalid log counter: {value}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteRunStore;
    use anyhow::Result;
    use automation_center_domain::{
        now_utc, recompute_log_entry_hash, ActorId, ChangeEvent, LogLevel, RunId, RunRecord,
        RunSnapshot, RunStatus, StepId, StepRecord, StepStatus,
    };
    use automation_center_store_core::{AuditNote, ChangeSink, RunStore};
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "automation-center-store-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn fixture_store() -> SqliteRunStore {
        let store = must(SqliteRunStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_run(run_id: RunId) -> RunRecord {
        RunRecord {
            run_id,
            owner: ActorId::new("alice"),
            definition_hash: "hash".to_string(),
            status: RunStatus::Pending,
            created_at: now_utc(),
            finished_at: None,
        }
    }

    fn fixture_steps(run_id: RunId, keys: &[&str]) -> Vec<StepRecord> {
        keys.iter()
            .enumerate()
            .map(|(ordinal, key)| StepRecord {
                step_id: StepId::new(),
                run_id,
                ordinal,
                step_key: (*key).to_string(),
                kind: "mock".to_string(),
                status: StepStatus::Pending,
                input_json: json!({"n": ordinal}),
                result_json: None,
                error_json: None,
                started_at: None,
                finished_at: None,
            })
            .collect()
    }

    fn seeded_run(store: &SqliteRunStore, keys: &[&str]) -> (RunId, Vec<StepRecord>) {
        let run_id = RunId::new();
        let steps = fixture_steps(run_id, keys);
        must(store.create_run(&fixture_run(run_id), &steps));
        (run_id, steps)
    }

    fn snapshot(store: &SqliteRunStore, run_id: RunId) -> RunSnapshot {
        match must(store.snapshot(run_id)) {
            Some(snapshot) => snapshot,
            None => panic!("missing run {run_id}"),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl ChangeSink for RecordingSink {
        fn publish(&self, event: ChangeEvent) {
            self.events.lock().push(event);
        }
    }

    #[test]
    fn migrate_is_idempotent_and_records_version() {
        let path = temp_db_path("migrate");
        let store = must(SqliteRunStore::open(&path));
        must(store.migrate());
        must(store.migrate());

        let versions: i64 = store
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(versions, 1);
    }

    #[test]
    fn log_entries_are_append_only() {
        let store = fixture_store();
        let (run_id, _) = seeded_run(&store, &["a"]);
        assert!(must(store.append_log(run_id, LogLevel::Info, "run started")).is_some());

        let conn = store.conn.lock();
        let mutated = conn.execute("UPDATE log_entries SET message = 'mutated'", []);
        assert!(mutated.is_err());
        let deleted = conn.execute("DELETE FROM log_entries", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn create_run_is_atomic_when_a_step_insert_fails() {
        let store = fixture_store();
        let run_id = RunId::new();
        let steps = fixture_steps(run_id, &["a", "a"]);
        assert!(store.create_run(&fixture_run(run_id), &steps).is_err());
        assert!(must(store.get_run(run_id)).is_none());
        assert!(must(store.get_steps(run_id)).is_empty());
    }

    #[test]
    fn run_transitions_are_compare_and_swap() {
        let store = fixture_store();
        let (run_id, _) = seeded_run(&store, &["a"]);

        assert!(must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            None
        )));
        assert!(!must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            None
        )));
        assert!(!must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Completed,
            None
        )));
        assert_eq!(snapshot(&store, run_id).run.status, RunStatus::Running);
        assert!(snapshot(&store, run_id).run.finished_at.is_none());
    }

    #[test]
    fn finish_run_cancels_open_steps_in_the_same_commit() {
        let store = fixture_store();
        let (run_id, steps) = seeded_run(&store, &["a", "b", "c"]);
        assert!(must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            None
        )));
        assert!(must(store.transition_step(
            steps[0].step_id,
            StepStatus::Pending,
            StepStatus::Running,
            None,
            None,
            None
        )));
        assert!(must(store.transition_step(
            steps[0].step_id,
            StepStatus::Running,
            StepStatus::Succeeded,
            Some(&json!({"ok": true})),
            None,
            None
        )));
        assert!(must(store.transition_step(
            steps[1].step_id,
            StepStatus::Pending,
            StepStatus::Running,
            None,
            None,
            None
        )));

        let cancelled = must(store.finish_run(run_id, &RunStatus::OPEN, RunStatus::Stopped, None));
        assert_eq!(cancelled, Some(vec![steps[1].step_id, steps[2].step_id]));
        assert_eq!(
            must(store.finish_run(run_id, &RunStatus::OPEN, RunStatus::Stopped, None)),
            None
        );

        // A late completion loses against the cancellation.
        assert!(!must(store.transition_step(
            steps[1].step_id,
            StepStatus::Running,
            StepStatus::Succeeded,
            Some(&json!({"late": true})),
            None,
            None
        )));

        let snap = snapshot(&store, run_id);
        assert!(snap.invariant_violations().is_empty());
        assert_eq!(snap.run.status, RunStatus::Stopped);
        assert_eq!(snap.steps[0].status, StepStatus::Succeeded);
        assert_eq!(snap.steps[0].result_json, Some(json!({"ok": true})));
        assert!(snap.steps[0].started_at.is_some());
        assert_eq!(snap.steps[1].status, StepStatus::Cancelled);
        assert_eq!(snap.steps[1].result_json, None);
        assert_eq!(snap.count_steps(StepStatus::Cancelled), 2);
    }

    #[test]
    fn terminal_run_status_is_final_even_for_raw_updates() {
        let store = fixture_store();
        let (run_id, _) = seeded_run(&store, &["a"]);
        let finished = must(store.finish_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Failed,
            None,
        ));
        assert!(finished.is_some());
        let raw = store.conn.lock().execute(
            "UPDATE runs SET status = 'running', finished_at = NULL WHERE run_id = ?1",
            [run_id.to_string()],
        );
        assert!(raw.is_err());
    }

    #[test]
    fn append_log_for_unknown_run_returns_none() {
        let store = fixture_store();
        assert!(must(store.append_log(RunId::new(), LogLevel::Warn, "orphan")).is_none());
    }

    #[test]
    fn log_entries_form_a_counter_ordered_hash_chain() {
        let store = fixture_store();
        let (run_id, _) = seeded_run(&store, &["a"]);
        for message in ["run started", "step a started", "run completed"] {
            assert!(must(store.append_log(run_id, LogLevel::Info, message)).is_some());
        }

        let entries = must(store.list_logs(run_id, 0, 10));
        assert_eq!(
            entries.iter().map(|entry| entry.counter).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(entries[0].prev_entry_hash.is_none());
        for pair in entries.windows(2) {
            assert_eq!(pair[1].prev_entry_hash.as_deref(), Some(pair[0].entry_hash.as_str()));
        }
        for entry in &entries {
            assert_eq!(must(recompute_log_entry_hash(entry)), entry.entry_hash);
        }

        let page = must(store.list_logs(run_id, 1, 1));
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].counter, 2);
    }

    #[test]
    fn sink_observes_transitions_in_commit_order() {
        let sink = Arc::new(RecordingSink::default());
        let store = must(SqliteRunStore::open(Path::new(":memory:")))
            .with_change_sink(sink.clone());
        must(store.migrate());

        let (run_id, steps) = seeded_run(&store, &["a", "b"]);
        assert!(must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            None
        )));
        assert!(must(store.transition_step(
            steps[0].step_id,
            StepStatus::Pending,
            StepStatus::Running,
            None,
            None,
            None
        )));
        assert!(must(store.transition_step(
            steps[0].step_id,
            StepStatus::Running,
            StepStatus::Failed,
            None,
            Some(&json!({"code": "boom", "message": "boom"})),
            None
        )));
        assert!(must(store.finish_run(
            run_id,
            &[RunStatus::Running],
            RunStatus::Failed,
            None
        ))
        .is_some());
        // Losing CAS writes publish nothing.
        assert!(!must(store.transition_run(
            run_id,
            &[RunStatus::Running],
            RunStatus::Running,
            None
        )));

        let statuses: Vec<(String, &'static str)> = sink
            .events
            .lock()
            .iter()
            .map(|event| (format!("{:?}", event.entity_kind()), event.status_text()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("Run".to_string(), "pending"),
                ("Step".to_string(), "pending"),
                ("Step".to_string(), "pending"),
                ("Run".to_string(), "running"),
                ("Step".to_string(), "running"),
                ("Step".to_string(), "failed"),
                ("Step".to_string(), "cancelled"),
                ("Run".to_string(), "failed"),
            ]
        );
    }

    #[test]
    fn audit_notes_commit_with_their_transition() {
        let store = fixture_store();
        let (run_id, steps) = seeded_run(&store, &["a", "b"]);

        assert!(must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            Some(AuditNote::info("run started"))
        )));
        // Losing writers leave no trace in the log.
        assert!(!must(store.transition_run(
            run_id,
            &[RunStatus::Pending],
            RunStatus::Running,
            Some(AuditNote::info("run started"))
        )));
        assert!(must(store.transition_step(
            steps[0].step_id,
            StepStatus::Pending,
            StepStatus::Running,
            None,
            None,
            Some(AuditNote::info("step 0 (a) started"))
        )));
        let stopped = must(store.finish_run(
            run_id,
            &RunStatus::OPEN,
            RunStatus::Stopped,
            Some(AuditNote::warn("run stopped by user")),
        ));
        assert_eq!(stopped.map(|cancelled| cancelled.len()), Some(2));
        assert_eq!(
            must(store.finish_run(
                run_id,
                &RunStatus::OPEN,
                RunStatus::Stopped,
                Some(AuditNote::warn("run stopped by user")),
            )),
            None
        );
        assert!(!must(store.transition_step(
            steps[0].step_id,
            StepStatus::Running,
            StepStatus::Succeeded,
            Some(&json!({"late": true})),
            None,
            Some(AuditNote::info("step 0 (a) succeeded"))
        )));

        let entries = must(store.list_logs(run_id, 0, 10));
        let trail: Vec<(LogLevel, &str)> = entries
            .iter()
            .map(|entry| (entry.level, entry.message.as_str()))
            .collect();
        assert_eq!(
            trail,
            vec![
                (LogLevel::Info, "run started"),
                (LogLevel::Info, "step 0 (a) started"),
                (LogLevel::Warn, "run stopped by user"),
            ]
        );
        assert_eq!(entries[2].prev_entry_hash.as_deref(), Some(entries[1].entry_hash.as_str()));
    }

    #[test]
    fn failed_note_insert_rolls_back_the_transition() {
        let store = fixture_store();
        let (run_id, _) = seeded_run(&store, &["a"]);
        store
            .conn
            .lock()
            .execute_batch(
                "CREATE TRIGGER trg_test_reject_logs BEFORE INSERT ON log_entries
                 BEGIN SELECT RAISE(FAIL, 'disk full'); END;",
            )
            .unwrap_or_else(|_| unreachable!());

        let finished = store.finish_run(
            run_id,
            &RunStatus::OPEN,
            RunStatus::Stopped,
            Some(AuditNote::warn("run stopped by user")),
        );
        assert!(finished.is_err());
        let snap = snapshot(&store, run_id);
        assert_eq!(snap.run.status, RunStatus::Pending);
        assert!(snap.run.finished_at.is_none());
        assert_eq!(snap.steps[0].status, StepStatus::Pending);
    }

    #[test]
    fn open_runs_are_listed_by_status() {
        let store = fixture_store();
        let (open_run, _) = seeded_run(&store, &["a"]);
        let (done_run, _) = seeded_run(&store, &["a"]);
        assert!(must(store.finish_run(
            done_run,
            &[RunStatus::Pending],
            RunStatus::Stopped,
            None
        ))
        .is_some());

        let open = must(store.list_runs_with_status(&RunStatus::OPEN));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].run_id, open_run);
        assert_eq!(must(store.list_runs()).len(), 2);
        assert!(must(store.list_runs_with_status(&[])).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_log_order_is_dense_and_non_decreasing(level_codes in prop::collection::vec(0u8..3, 1..40)) {
            let store = fixture_store();
            let (run_id, _) = seeded_run(&store, &["a"]);
            for (index, code) in level_codes.iter().copied().enumerate() {
                let level = match code {
                    0 => LogLevel::Info,
                    1 => LogLevel::Warn,
                    _ => LogLevel::Error,
                };
                let appended = must(store.append_log(run_id, level, &format!("entry {index}")));
                prop_assert!(appended.is_some());
            }

            let mut entries = Vec::new();
            let mut after = 0;
            loop {
                let page = must(store.list_logs(run_id, after, 7));
                let Some(last) = page.last() else { break };
                after = last.counter;
                entries.extend(page);
            }

            prop_assert_eq!(entries.len(), level_codes.len());
            let mut expected_counter = 0u64;
            for entry in &entries {
                expected_counter += 1;
                prop_assert_eq!(entry.counter, expected_counter);
            }
            for pair in entries.windows(2) {
                prop_assert!(pair[0].order_key() < pair[1].order_key());
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
        }
    }
}
