//! SQLite persistence gateway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{ControlRequest, PersistenceError, PersistenceGateway};
use crate::domain::{Build, ControlAction, LogDocument, Stage};

const MIG_0001: &str = include_str!("migrations/0001_init.sql");

const NON_TERMINAL: &str = "('pending', 'running')";

/// Durable gateway backed by a single SQLite connection
#[derive(Clone)]
pub struct SqliteGateway {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGateway {
    /// Open (creating if needed) a database file and apply migrations
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let this = Self {
            path: Some(path),
            conn: Arc::new(Mutex::new(conn)),
        };
        this.migrate()?;
        Ok(this)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let this = Self {
            path: None,
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        this.migrate()?;
        Ok(this)
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute_batch(MIG_0001)?;
        let v: i64 = conn.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
        if v < 1 {
            conn.execute_batch("PRAGMA user_version = 1;")?;
        }
        Ok(())
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PersistenceError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistenceError::Unavailable(e.to_string()))?
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    raw.as_deref().map(parse_ts).transpose()
}

const BUILD_COLUMNS: &str = "build_id, config_name, status, start_time, end_time, \
                             duration_seconds, total_stages, completed_stages";

fn read_build(row: &Row<'_>) -> Result<Build, PersistenceError> {
    let status: String = row.get(2)?;
    let start_time: String = row.get(3)?;
    Ok(Build {
        build_id: row.get(0)?,
        config_name: row.get(1)?,
        status: status.parse()?,
        start_time: parse_ts(&start_time)?,
        end_time: parse_opt_ts(row.get(4)?)?,
        duration_seconds: row.get(5)?,
        total_stages: row.get(6)?,
        completed_stages: row.get(7)?,
    })
}

fn read_stage(row: &Row<'_>) -> Result<Stage, PersistenceError> {
    let status: String = row.get(2)?;
    Ok(Stage {
        name: row.get(0)?,
        stage_order: row.get(1)?,
        status: status.parse()?,
        start_time: parse_opt_ts(row.get(3)?)?,
        end_time: parse_opt_ts(row.get(4)?)?,
        output_log: row.get(5)?,
        error_log: row.get(6)?,
    })
}

fn read_document(row: &Row<'_>) -> Result<LogDocument, PersistenceError> {
    let document_type: String = row.get(3)?;
    let metadata: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(LogDocument {
        id: row.get(0)?,
        build_id: row.get(1)?,
        stage: row.get(2)?,
        document_type: document_type.parse()?,
        title: row.get(4)?,
        content: row.get(5)?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn create_build(&self, build: &Build) -> Result<(), PersistenceError> {
        let build = build.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO builds({}, updated_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    BUILD_COLUMNS
                ),
                params![
                    build.build_id,
                    build.config_name,
                    build.status.as_str(),
                    ts(build.start_time),
                    opt_ts(build.end_time),
                    build.duration_seconds,
                    build.total_stages,
                    build.completed_stages,
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_build(&self, build: &Build) -> Result<bool, PersistenceError> {
        let build = build.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE builds SET status = ?2, end_time = ?3, duration_seconds = ?4, \
                     total_stages = ?5, completed_stages = ?6, updated_at = ?7 \
                     WHERE build_id = ?1 AND status IN {}",
                    NON_TERMINAL
                ),
                params![
                    build.build_id,
                    build.status.as_str(),
                    opt_ts(build.end_time),
                    build.duration_seconds,
                    build.total_stages,
                    build.completed_stages,
                    ts(Utc::now()),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn archive_build(&self, build_id: &str) -> Result<bool, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE builds SET status = 'archived', updated_at = ?2 \
                 WHERE build_id = ?1 AND status IN ('success', 'failed', 'cancelled')",
                params![build_id, ts(Utc::now())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn insert_stages(&self, build_id: &str, stages: &[Stage]) -> Result<(), PersistenceError> {
        let build_id = build_id.to_string();
        let stages = stages.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO build_stages(build_id, stage_name, stage_order, status, \
                     start_time, end_time, output_log, error_log, updated_at) \
                     VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                let now = ts(Utc::now());
                for stage in &stages {
                    stmt.execute(params![
                        build_id,
                        stage.name,
                        stage.stage_order,
                        stage.status.as_str(),
                        opt_ts(stage.start_time),
                        opt_ts(stage.end_time),
                        stage.output_log,
                        stage.error_log,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_stage(&self, build_id: &str, stage: &Stage) -> Result<bool, PersistenceError> {
        let build_id = build_id.to_string();
        let stage = stage.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE build_stages SET status = ?3, start_time = ?4, end_time = ?5, \
                     output_log = ?6, error_log = ?7, updated_at = ?8 \
                     WHERE build_id = ?1 AND stage_name = ?2 AND status IN {}",
                    NON_TERMINAL
                ),
                params![
                    build_id,
                    stage.name,
                    stage.status.as_str(),
                    opt_ts(stage.start_time),
                    opt_ts(stage.end_time),
                    stage.output_log,
                    stage.error_log,
                    ts(Utc::now()),
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn cancel_build_rows(
        &self,
        build_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let start: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT start_time FROM builds WHERE build_id = ?1 AND status IN {}",
                        NON_TERMINAL
                    ),
                    params![build_id],
                    |r| r.get(0),
                )
                .optional()?;

            let Some(start) = start else {
                return Ok(false);
            };
            let duration = (at - parse_ts(&start)?).num_seconds().max(0);
            let now = ts(Utc::now());

            tx.execute(
                "UPDATE builds SET status = 'cancelled', end_time = ?2, duration_seconds = ?3, \
                 updated_at = ?4 WHERE build_id = ?1",
                params![build_id, ts(at), duration, now],
            )?;
            tx.execute(
                "UPDATE build_stages SET status = 'cancelled', end_time = ?2, updated_at = ?3 \
                 WHERE build_id = ?1 AND status = 'running'",
                params![build_id, ts(at), now],
            )?;
            tx.execute(
                "UPDATE build_stages SET status = 'skipped', updated_at = ?2 \
                 WHERE build_id = ?1 AND status = 'pending'",
                params![build_id, now],
            )?;
            tx.commit()?;

            debug!(build_id = %build_id, "Marked build rows cancelled");
            Ok(true)
        })
        .await
    }

    async fn append_document(&self, document: &LogDocument) -> Result<i64, PersistenceError> {
        let document = document.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO build_documents(build_id, stage_name, document_type, title, \
                 content, metadata, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    document.build_id,
                    document.stage,
                    document.document_type.as_str(),
                    document.title,
                    document.content,
                    serde_json::to_string(&document.metadata)?,
                    ts(document.created_at),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_build(&self, build_id: &str) -> Result<Option<Build>, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM builds WHERE build_id = ?1",
                BUILD_COLUMNS
            ))?;
            let mut rows = stmt.query(params![build_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(read_build(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_stages(&self, build_id: &str) -> Result<Vec<Stage>, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT stage_name, stage_order, status, start_time, end_time, output_log, \
                 error_log FROM build_stages WHERE build_id = ?1 ORDER BY stage_order, id",
            )?;
            let mut rows = stmt.query(params![build_id])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_stage(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_documents(
        &self,
        build_id: &str,
        stage: Option<&str>,
    ) -> Result<Vec<LogDocument>, PersistenceError> {
        let build_id = build_id.to_string();
        let stage = stage.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, build_id, stage_name, document_type, title, content, metadata, \
                 created_at FROM build_documents \
                 WHERE build_id = ?1 AND (?2 IS NULL OR stage_name = ?2) ORDER BY id",
            )?;
            let mut rows = stmt.query(params![build_id, stage])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_document(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn list_builds(
        &self,
        limit: usize,
        include_archived: bool,
    ) -> Result<Vec<Build>, PersistenceError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM builds WHERE (?1 OR status != 'archived') \
                 ORDER BY start_time DESC, build_id DESC LIMIT ?2",
                BUILD_COLUMNS
            ))?;
            let mut rows = stmt.query(params![include_archived, limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(read_build(row)?);
            }
            Ok(out)
        })
        .await
    }

    async fn last_activity(
        &self,
        build_id: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let latest: Option<String> = conn.query_row(
                "SELECT MAX(ts) FROM ( \
                     SELECT updated_at AS ts FROM builds WHERE build_id = ?1 \
                     UNION ALL SELECT updated_at FROM build_stages WHERE build_id = ?1 \
                     UNION ALL SELECT created_at FROM build_documents WHERE build_id = ?1)",
                params![build_id],
                |r| r.get(0),
            )?;
            parse_opt_ts(latest)
        })
        .await
    }

    async fn request_control(
        &self,
        build_id: &str,
        action: ControlAction,
    ) -> Result<i64, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO build_controls(build_id, action, requested_at) VALUES(?1, ?2, ?3)",
                params![build_id, action.as_str(), ts(Utc::now())],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn take_controls(&self, build_id: &str) -> Result<Vec<ControlRequest>, PersistenceError> {
        let build_id = build_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut out = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT id, action, requested_at FROM build_controls \
                     WHERE build_id = ?1 AND handled_at IS NULL ORDER BY id",
                )?;
                let mut rows = stmt.query(params![build_id])?;
                while let Some(row) = rows.next()? {
                    let action: String = row.get(1)?;
                    let requested_at: String = row.get(2)?;
                    out.push(ControlRequest {
                        id: row.get(0)?,
                        build_id: build_id.clone(),
                        action: action.parse()?,
                        requested_at: parse_ts(&requested_at)?,
                    });
                }
            }
            let now = ts(Utc::now());
            for request in &out {
                tx.execute(
                    "UPDATE build_controls SET handled_at = ?2 WHERE id = ?1",
                    params![request.id, now],
                )?;
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }
}
