use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExperimentRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: RunStatus,
    pub begin: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunGroupRecord {
    pub id: String,
    pub experiment_id: String,
    pub project: String,
    pub project_group: String,
    pub status: RunStatus,
    pub begin: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_group_id: String,
    pub experiment_name: String,
    pub project: String,
    pub command: String,
    pub status: RunStatus,
    pub begin: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunLogRecord {
    pub run_id: i64,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub begin: String,
    pub end: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    db_path: PathBuf,
}

impl RunStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub fn initialize(&self) -> Result<(), DbError> {
        self.with_connection(|_| Ok(()))
    }

    fn with_connection<T, F>(&self, func: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(self.db_path.as_path())?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&conn)
    }

    fn with_connection_mut<T, F>(&self, func: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut Connection) -> Result<T, DbError>,
    {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(self.db_path.as_path())?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        ensure_schema(&conn)?;
        func(&mut conn)
    }
}

impl RunStore {
    pub fn persist_experiment(
        &self,
        name: &str,
        description: &str,
    ) -> Result<ExperimentRecord, DbError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DbError::Validation(String::from(
                "experiment name is required",
            )));
        }
        self.with_connection(|conn| {
            let record = ExperimentRecord {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
                description: description.to_string(),
                status: RunStatus::Running,
                begin: now_rfc3339(),
                end: None,
            };
            conn.execute(
                "INSERT INTO experiments (id, name, description, status, begin_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id,
                    record.name,
                    record.description,
                    record.status.as_str(),
                    record.begin
                ],
            )?;
            Ok(record)
        })
    }

    pub fn finish_experiment(&self, experiment_id: &str, status: RunStatus) -> Result<(), DbError> {
        self.with_connection(|conn| {
            let updated = conn.execute(
                "UPDATE experiments SET status = ?2, end_at = ?3 WHERE id = ?1",
                params![experiment_id, status.as_str(), now_rfc3339()],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("experiment {experiment_id}")));
            }
            Ok(())
        })
    }

    pub fn experiment(&self, experiment_id: &str) -> Result<ExperimentRecord, DbError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM experiments WHERE id = ?1",
                [experiment_id],
                row_to_experiment,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("experiment {experiment_id}")))
        })
    }

    pub fn create_run_group(
        &self,
        project: &str,
        project_group: &str,
        experiment_id: &str,
    ) -> Result<RunGroupRecord, DbError> {
        self.with_connection(|conn| {
            let record = RunGroupRecord {
                id: Uuid::new_v4().to_string(),
                experiment_id: experiment_id.to_string(),
                project: project.to_string(),
                project_group: project_group.to_string(),
                status: RunStatus::Running,
                begin: now_rfc3339(),
                end: None,
            };
            conn.execute(
                "INSERT INTO run_groups (id, experiment_id, project, project_group, status, begin_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.experiment_id,
                    record.project,
                    record.project_group,
                    record.status.as_str(),
                    record.begin
                ],
            )?;
            Ok(record)
        })
    }

    pub fn end_run_group(&self, group_id: &str) -> Result<(), DbError> {
        self.finish_run_group(group_id, RunStatus::Completed)
    }

    pub fn fail_run_group(&self, group_id: &str) -> Result<(), DbError> {
        self.finish_run_group(group_id, RunStatus::Failed)
    }

    fn finish_run_group(&self, group_id: &str, status: RunStatus) -> Result<(), DbError> {
        self.with_connection_mut(|conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE run_groups SET status = ?2, end_at = ?3 WHERE id = ?1",
                params![group_id, status.as_str(), now_rfc3339()],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("run group {group_id}")));
            }
            if status == RunStatus::Failed {
                // Runs still in flight when the group fails never reported back.
                tx.execute(
                    "UPDATE runs SET status = 'failed', end_at = ?2
                     WHERE run_group_id = ?1 AND status = 'running'",
                    params![group_id, now_rfc3339()],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn run_group(&self, group_id: &str) -> Result<RunGroupRecord, DbError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM run_groups WHERE id = ?1",
                [group_id],
                row_to_run_group,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("run group {group_id}")))
        })
    }

    pub fn create_run(
        &self,
        command: &str,
        project: &str,
        experiment_name: &str,
        group_id: &str,
    ) -> Result<RunRecord, DbError> {
        self.with_connection_mut(|conn| {
            let begin = now_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO runs (run_group_id, experiment_name, project, command, status, begin_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![group_id, experiment_name, project, command, begin],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO run_logs (run_id, status, stdout, stderr, begin_at)
                 VALUES (?1, 'running', '', '', ?2)",
                params![id, begin],
            )?;
            tx.commit()?;
            debug!(run_id = id, command, "run created");
            Ok(RunRecord {
                id,
                run_group_id: group_id.to_string(),
                experiment_name: experiment_name.to_string(),
                project: project.to_string(),
                command: command.to_string(),
                status: RunStatus::Running,
                begin,
                end: None,
            })
        })
    }

    pub fn finish_run(
        &self,
        run_id: i64,
        exit_code: Option<i32>,
        stdout: &str,
        stderr: &str,
    ) -> Result<RunStatus, DbError> {
        let status = match exit_code {
            Some(0) => RunStatus::Completed,
            _ => RunStatus::Failed,
        };
        self.with_connection_mut(|conn| {
            let end = now_rfc3339();
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE runs SET status = ?2, end_at = ?3 WHERE id = ?1",
                params![run_id, status.as_str(), end],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound(format!("run {run_id}")));
            }
            tx.execute(
                "UPDATE run_logs SET status = ?2, exit_code = ?3, stdout = ?4, stderr = ?5, end_at = ?6
                 WHERE run_id = ?1",
                params![run_id, status.as_str(), exit_code, stdout, stderr, end],
            )?;
            tx.commit()?;
            Ok(status)
        })
    }

    pub fn run_log(&self, run_id: i64) -> Result<RunLogRecord, DbError> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT * FROM run_logs WHERE run_id = ?1",
                [run_id],
                row_to_run_log,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("run log {run_id}")))
        })
    }

    pub fn runs_for_group(&self, group_id: &str) -> Result<Vec<RunRecord>, DbError> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM runs WHERE run_group_id = ?1 ORDER BY id ASC")?;
            let rows = stmt.query_map([group_id], row_to_run)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn run_groups_for_experiment(
        &self,
        experiment_id: &str,
    ) -> Result<Vec<RunGroupRecord>, DbError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM run_groups WHERE experiment_id = ?1 ORDER BY begin_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([experiment_id], row_to_run_group)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

/// Keeps a run group open for the lifetime of one project run.
///
/// Dropping the guard without calling [`RunGroupGuard::complete`] marks the
/// group as failed, which covers early returns, propagated errors and
/// interruption alike.
pub struct RunGroupGuard {
    store: RunStore,
    group: RunGroupRecord,
    finished: bool,
}

impl RunGroupGuard {
    pub fn begin(
        store: &RunStore,
        project: &str,
        project_group: &str,
        experiment_id: &str,
    ) -> Result<Self, DbError> {
        let group = store.create_run_group(project, project_group, experiment_id)?;
        Ok(Self {
            store: store.clone(),
            group,
            finished: false,
        })
    }

    pub fn id(&self) -> &str {
        self.group.id.as_str()
    }

    pub fn record(&self) -> &RunGroupRecord {
        &self.group
    }

    pub fn complete(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.store.end_run_group(self.group.id.as_str())
    }

    pub fn fail(mut self) -> Result<(), DbError> {
        self.finished = true;
        self.store.fail_run_group(self.group.id.as_str())
    }
}

impl Drop for RunGroupGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(error) = self.store.fail_run_group(self.group.id.as_str()) {
            warn!(group = %self.group.id, %error, "failed to mark abandoned run group as failed");
        }
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS experiments (
          id TEXT PRIMARY KEY,
          name TEXT NOT NULL,
          description TEXT NOT NULL DEFAULT '',
          status TEXT NOT NULL DEFAULT 'running',
          begin_at TEXT NOT NULL,
          end_at TEXT
        );

        CREATE TABLE IF NOT EXISTS run_groups (
          id TEXT PRIMARY KEY,
          experiment_id TEXT NOT NULL,
          project TEXT NOT NULL,
          project_group TEXT NOT NULL DEFAULT '',
          status TEXT NOT NULL DEFAULT 'running',
          begin_at TEXT NOT NULL,
          end_at TEXT,
          FOREIGN KEY(experiment_id) REFERENCES experiments(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS runs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          run_group_id TEXT NOT NULL,
          experiment_name TEXT NOT NULL,
          project TEXT NOT NULL,
          command TEXT NOT NULL,
          status TEXT NOT NULL DEFAULT 'running',
          begin_at TEXT NOT NULL,
          end_at TEXT,
          FOREIGN KEY(run_group_id) REFERENCES run_groups(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS run_logs (
          run_id INTEGER PRIMARY KEY,
          status TEXT NOT NULL DEFAULT 'running',
          exit_code INTEGER,
          stdout TEXT NOT NULL DEFAULT '',
          stderr TEXT NOT NULL DEFAULT '',
          begin_at TEXT NOT NULL,
          end_at TEXT,
          FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_runs_group ON runs(run_group_id);
        CREATE INDEX IF NOT EXISTS idx_run_groups_experiment ON run_groups(experiment_id);
    ",
    )?;
    Ok(())
}

fn row_to_experiment(row: &Row<'_>) -> rusqlite::Result<ExperimentRecord> {
    Ok(ExperimentRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        status: RunStatus::parse(row.get::<_, String>("status")?.as_str()),
        begin: row.get("begin_at")?,
        end: row.get("end_at")?,
    })
}

fn row_to_run_group(row: &Row<'_>) -> rusqlite::Result<RunGroupRecord> {
    Ok(RunGroupRecord {
        id: row.get("id")?,
        experiment_id: row.get("experiment_id")?,
        project: row.get("project")?,
        project_group: row.get("project_group")?,
        status: RunStatus::parse(row.get::<_, String>("status")?.as_str()),
        begin: row.get("begin_at")?,
        end: row.get("end_at")?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get("id")?,
        run_group_id: row.get("run_group_id")?,
        experiment_name: row.get("experiment_name")?,
        project: row.get("project")?,
        command: row.get("command")?,
        status: RunStatus::parse(row.get::<_, String>("status")?.as_str()),
        begin: row.get("begin_at")?,
        end: row.get("end_at")?,
    })
}

fn row_to_run_log(row: &Row<'_>) -> rusqlite::Result<RunLogRecord> {
    Ok(RunLogRecord {
        run_id: row.get("run_id")?,
        status: RunStatus::parse(row.get::<_, String>("status")?.as_str()),
        exit_code: row.get("exit_code")?,
        stdout: row.get("stdout")?,
        stderr: row.get("stderr")?,
        begin: row.get("begin_at")?,
        end: row.get("end_at")?,
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let store = RunStore::new(dir.path().join("db").join("bb.db"));
        store.initialize().expect("store should initialize");
        (dir, store)
    }

    #[test]
    fn experiment_lifecycle_records_status_and_end() {
        let (_dir, store) = temp_store();
        let exp = store
            .persist_experiment("raw", "plain runtime")
            .expect("experiment should persist");
        assert_eq!(exp.status, RunStatus::Running);

        store
            .finish_experiment(exp.id.as_str(), RunStatus::Completed)
            .expect("experiment should finish");
        let loaded = store.experiment(exp.id.as_str()).expect("experiment exists");
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.end.is_some());
    }

    #[test]
    fn empty_experiment_name_is_rejected() {
        let (_dir, store) = temp_store();
        let err = store
            .persist_experiment("  ", "")
            .expect_err("name should be required");
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn run_log_captures_exit_code_and_output() {
        let (_dir, store) = temp_store();
        let exp = store.persist_experiment("raw", "").expect("experiment");
        let group = store
            .create_run_group("gzip", "compression", exp.id.as_str())
            .expect("group");
        let run = store
            .create_run("gzip -9 input", "gzip", "raw", group.id.as_str())
            .expect("run");

        let status = store
            .finish_run(run.id, Some(0), "ok\n", "")
            .expect("run should finish");
        assert_eq!(status, RunStatus::Completed);

        let log = store.run_log(run.id).expect("run log exists");
        assert_eq!(log.exit_code, Some(0));
        assert_eq!(log.stdout, "ok\n");
        assert_eq!(log.status, RunStatus::Completed);
    }

    #[test]
    fn failing_group_closes_runs_still_in_flight() {
        let (_dir, store) = temp_store();
        let exp = store.persist_experiment("raw", "").expect("experiment");
        let group = store
            .create_run_group("bzip2", "compression", exp.id.as_str())
            .expect("group");
        let run = store
            .create_run("bzip2 input", "bzip2", "raw", group.id.as_str())
            .expect("run");

        store
            .fail_run_group(group.id.as_str())
            .expect("group should fail");
        store
            .fail_run_group(group.id.as_str())
            .expect("failing twice is harmless");

        let runs = store.runs_for_group(group.id.as_str()).expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, run.id);
        assert_eq!(runs[0].status, RunStatus::Failed);
    }

    #[test]
    fn dropped_guard_marks_group_failed() {
        let (_dir, store) = temp_store();
        let exp = store.persist_experiment("raw", "").expect("experiment");
        let group_id = {
            let guard =
                RunGroupGuard::begin(&store, "xz", "compression", exp.id.as_str()).expect("guard");
            guard.id().to_string()
        };
        let group = store.run_group(group_id.as_str()).expect("group exists");
        assert_eq!(group.status, RunStatus::Failed);
    }

    #[test]
    fn completed_guard_marks_group_completed() {
        let (_dir, store) = temp_store();
        let exp = store.persist_experiment("raw", "").expect("experiment");
        let guard =
            RunGroupGuard::begin(&store, "xz", "compression", exp.id.as_str()).expect("guard");
        let group_id = guard.id().to_string();
        guard.complete().expect("guard should complete");

        let group = store.run_group(group_id.as_str()).expect("group exists");
        assert_eq!(group.status, RunStatus::Completed);
        assert_eq!(
            store
                .run_groups_for_experiment(exp.id.as_str())
                .expect("groups")
                .len(),
            1
        );
    }
}
