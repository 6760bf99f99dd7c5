// This file is part of Reelcut, a short-form clip rendering service.
// Copyright (C) 2025 The Reelcut Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Database access logic for the Reelcut SQLite schema.
//!
//! The `jobs` table doubles as the work queue: the row is the lock. A claim
//! is a single conditional `UPDATE`, so no two workers ever observe the same
//! job in `running`. `updated_at` doubles as the heartbeat; rows whose
//! heartbeat lapses are put back to `queued` by [`Database::reclaim_stale`].
//! See `schema.sql` for a more detailed description.

use std::path::Path;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use base::clock::Clocks;
use base::{bail, err, Error, ErrorKind, ResultExt as _};
use regex::Regex;
use rusqlite::{named_params, params, Connection, OptionalExtension as _};
use tracing::{debug, info};

pub mod testutil;

/// Expected schema version, as stored in SQLite's `user_version` pragma.
pub const EXPECTED_SCHEMA_VERSION: i32 = 1;

static UPLOAD_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^users/\d+/videos/.+$").unwrap());
static CLIP_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^users/\d+/clips/\d+/.+\.mp4$").unwrap());

const CLAIM_NEXT_SQL: &str = r#"
    update jobs
    set
      status = 'running',
      error = null,
      updated_at = :now
    where
      id = (select id from jobs where status = 'queued' order by id asc limit 1) and
      status = 'queued'
    returning id
"#;

const SELECT_NEXT_QUEUED_SQL: &str = r#"
    select id from jobs where status = 'queued' order by id asc limit 1
"#;

const CLAIM_BY_ID_SQL: &str = r#"
    update jobs
    set
      status = 'running',
      error = null,
      updated_at = :now
    where
      id = :id and
      status = 'queued'
"#;

const HEARTBEAT_SQL: &str = r#"
    update jobs set updated_at = max(updated_at, :now) where id = :id
"#;

const SET_STATUS_SQL: &str = r#"
    update jobs
    set
      status = :status,
      error = :error,
      updated_at = :now
    where
      id = :id and
      status not in ('done', 'failed')
"#;

const RECLAIM_STALE_SQL: &str = r#"
    update jobs
    set
      status = 'queued',
      error = 'reclaimed',
      updated_at = :now
    where
      (status = 'running' or status like 'running:%') and
      updated_at <= :cutoff
"#;

const GET_JOB_SQL: &str = r#"
    select
      id,
      upload_id,
      status,
      error,
      aspect_ratio,
      captions_enabled,
      watermark_enabled,
      caption_style_json,
      created_at,
      updated_at
    from
      jobs
    where
      id = :id
"#;

const GET_UPLOAD_SQL: &str = r#"
    select
      id,
      user_id,
      original_filename,
      storage_key
    from
      uploads
    where
      id = :id
"#;

const GET_USER_SQL: &str = r#"
    select id, plan, credits from users where id = :id
"#;

const CHARGE_CREDITS_SQL: &str = r#"
    update users
    set credits = credits - :amount
    where id = :id and credits >= :amount
"#;

const REFUND_CREDITS_SQL: &str = r#"
    update users set credits = credits + :amount where id = :id
"#;

const DELETE_CLIPS_FOR_JOB_SQL: &str = r#"
    delete from clips where job_id = :job_id
"#;

const INSERT_CLIP_SQL: &str = r#"
    insert into clips (upload_id, job_id, storage_key, start_time, end_time, duration, title)
    values (:upload_id, :job_id, :storage_key, :start_time, :end_time, :duration, :title)
"#;

const LIST_CLIPS_FOR_JOB_SQL: &str = r#"
    select
      id,
      upload_id,
      job_id,
      storage_key,
      start_time,
      end_time,
      duration,
      title
    from
      clips
    where
      job_id = :job_id
    order by id asc
"#;

/// One stage of the processing pipeline, as surfaced in `running:<stage>`
/// status strings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    Download,
    Preflight,
    Billing,
    Audio,
    Transcribe,
    Segment,
    Reframe,
    Score,
    Render,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Download,
        Stage::Preflight,
        Stage::Billing,
        Stage::Audio,
        Stage::Transcribe,
        Stage::Segment,
        Stage::Reframe,
        Stage::Score,
        Stage::Render,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Preflight => "preflight",
            Stage::Billing => "billing",
            Stage::Audio => "audio",
            Stage::Transcribe => "transcribe",
            Stage::Segment => "segment",
            Stage::Reframe => "reframe",
            Stage::Score => "score",
            Stage::Render => "render",
        }
    }

    fn parse(s: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status as stored in the `status` column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobStatus {
    Queued,
    Running(Option<Stage>),
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    pub fn parse(s: &str) -> Result<JobStatus, Error> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running(None)),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            _ => match s.strip_prefix("running:").and_then(Stage::parse) {
                Some(stage) => Ok(JobStatus::Running(Some(stage))),
                None => Err(err!(DbFailure, msg("unknown job status {s:?}"))),
            },
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => f.write_str("queued"),
            JobStatus::Running(None) => f.write_str("running"),
            JobStatus::Running(Some(stage)) => write!(f, "running:{stage}"),
            JobStatus::Done => f.write_str("done"),
            JobStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Output frame shape. Unrecognized labels normalize to 9:16, matching what
/// the upload surface has historically accepted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum AspectRatio {
    #[default]
    R9x16,
    R1x1,
    R4x5,
    R16x9,
    R4x3,
}

impl AspectRatio {
    pub fn from_label(s: &str) -> AspectRatio {
        match s.trim() {
            "1:1" => AspectRatio::R1x1,
            "4:5" => AspectRatio::R4x5,
            "16:9" => AspectRatio::R16x9,
            "4:3" => AspectRatio::R4x3,
            _ => AspectRatio::R9x16,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            AspectRatio::R9x16 => "9:16",
            AspectRatio::R1x1 => "1:1",
            AspectRatio::R4x5 => "4:5",
            AspectRatio::R16x9 => "16:9",
            AspectRatio::R4x3 => "4:3",
        }
    }

    /// Output dimensions for this shape. Always even.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            AspectRatio::R9x16 => (1080, 1920),
            AspectRatio::R1x1 => (1080, 1080),
            AspectRatio::R4x5 => (1080, 1350),
            AspectRatio::R16x9 => (1920, 1080),
            AspectRatio::R4x3 => (1440, 1080),
        }
    }
}

/// Render settings carried on the job row.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSettings {
    pub aspect: AspectRatio,
    pub captions_enabled: bool,
    pub watermark_enabled: bool,

    /// Raw caption-style document; the worker parses and validates it.
    pub caption_style: Option<String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        RenderSettings {
            aspect: AspectRatio::R9x16,
            captions_enabled: true,
            watermark_enabled: true,
            caption_style: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobRow {
    pub id: i64,
    pub upload_id: i64,
    pub status: JobStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub settings: RenderSettings,
}

#[derive(Clone, Debug)]
pub struct UploadRow {
    pub id: i64,
    pub user_id: i64,
    pub original_filename: String,
    pub storage_key: String,
}

#[derive(Clone, Debug)]
pub struct UserRow {
    pub id: i64,
    pub plan: String,
    pub credits: i64,
}

impl UserRow {
    pub fn is_free_plan(&self) -> bool {
        self.plan.eq_ignore_ascii_case("free")
    }
}

#[derive(Clone, Debug)]
pub struct ClipRow {
    pub id: i64,
    pub upload_id: i64,
    pub job_id: i64,
    pub storage_key: String,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub title: Option<String>,
}

/// A clip about to be persisted.
#[derive(Clone, Debug)]
pub struct NewClip {
    pub storage_key: String,
    pub start_time: f64,
    pub end_time: f64,
    pub title: Option<String>,
}

/// Initializes the schema on a fresh connection.
pub fn init(conn: &mut Connection) -> Result<(), Error> {
    conn.execute_batch(include_str!("schema.sql"))
        .err_kind(ErrorKind::DbFailure)
}

/// Returns the schema version, or `None` if the database is uninitialized.
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>, Error> {
    let ver: i32 = conn
        .query_row("pragma user_version", [], |row| row.get(0))
        .err_kind(ErrorKind::DbFailure)?;
    Ok(if ver == 0 { None } else { Some(ver) })
}

/// Handle to the shared job store.
///
/// Holds one SQLite connection behind a mutex; the worker pipeline is
/// sequential, so contention is limited to the heartbeat thread's brief
/// `updated_at` bumps.
pub struct Database<C: Clocks> {
    conn: Mutex<Connection>,
    clocks: C,
}

impl<C: Clocks> Database<C> {
    /// Opens an existing database file, creating WAL journaling and a busy
    /// timeout suitable for multiple worker processes.
    pub fn open(path: &Path, clocks: C) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| err!(DbFailure, msg("unable to open {}", path.display()), source(e)))?;
        conn.busy_timeout(Duration::from_secs(5))
            .err_kind(ErrorKind::DbFailure)?;
        conn.pragma_update(None, "journal_mode", "wal")
            .err_kind(ErrorKind::DbFailure)?;
        conn.pragma_update(None, "foreign_keys", "on")
            .err_kind(ErrorKind::DbFailure)?;
        let db = Database::from_conn(conn, clocks)?;
        Ok(db)
    }

    /// Wraps an already-open connection (used by tests with in-memory
    /// databases).
    pub fn from_conn(conn: Connection, clocks: C) -> Result<Self, Error> {
        match get_schema_version(&conn)? {
            None => bail!(
                DbFailure,
                msg("no schema present; run the init subcommand first")
            ),
            Some(EXPECTED_SCHEMA_VERSION) => {}
            Some(v) => bail!(
                DbFailure,
                msg("unexpected schema version {v}, want {EXPECTED_SCHEMA_VERSION}")
            ),
        }
        Ok(Database {
            conn: Mutex::new(conn),
            clocks,
        })
    }

    pub fn clocks(&self) -> &C {
        &self.clocks
    }

    fn now(&self) -> i64 {
        self.clocks.realtime().as_second()
    }

    /// Atomically transitions the oldest queued job to `running` and returns
    /// its id, or `None` when the queue is empty or another worker won the
    /// race.
    pub fn claim_next(&self) -> Result<Option<i64>, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let result = match conn.prepare_cached(CLAIM_NEXT_SQL) {
            Ok(mut stmt) => stmt
                .query_row(named_params! {":now": now}, |row| row.get(0))
                .optional()
                .err_kind(ErrorKind::DbFailure),
            Err(e) => {
                // SQLite predating RETURNING; select-then-conditional-update.
                // A lost race shows up as rowcount 0 and reads as "queue
                // empty" to the caller.
                debug!(err = %e, "claim via returning unavailable, using portable path");
                claim_next_portable(&conn, now)
            }
        };
        result
    }

    /// Best-effort liveness bump of `updated_at`. Callers treat failure as
    /// non-fatal and retry on the next tick.
    pub fn heartbeat(&self, job_id: i64) -> Result<(), Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.prepare_cached(HEARTBEAT_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {":id": job_id, ":now": now})
            .err_kind(ErrorKind::DbFailure)?;
        Ok(())
    }

    /// Sets the job's status and error text. Terminal rows are left alone;
    /// returns whether a row was actually updated.
    pub fn set_status(
        &self,
        job_id: i64,
        status: &JobStatus,
        error: Option<&str>,
    ) -> Result<bool, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        let n = conn
            .prepare_cached(SET_STATUS_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {
                ":id": job_id,
                ":status": status.to_string(),
                ":error": error,
                ":now": now,
            })
            .err_kind(ErrorKind::DbFailure)?;
        Ok(n == 1)
    }

    /// Requeues running jobs whose heartbeat is at least `older_than` old.
    /// Returns the number of requeued rows.
    pub fn reclaim_stale(&self, older_than: Duration) -> Result<usize, Error> {
        let now = self.now();
        let cutoff = now - older_than.as_secs() as i64;
        let conn = self.conn.lock().unwrap();
        let n = conn
            .prepare_cached(RECLAIM_STALE_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {":cutoff": cutoff, ":now": now})
            .err_kind(ErrorKind::DbFailure)?;
        if n > 0 {
            info!("requeued {n} stale running job(s)");
        }
        Ok(n)
    }

    pub fn job(&self, job_id: i64) -> Result<JobRow, Error> {
        let conn = self.conn.lock().unwrap();
        get_job(&conn, job_id)
    }

    /// Loads the claimed job together with its upload row.
    pub fn job_with_upload(&self, job_id: i64) -> Result<(JobRow, UploadRow), Error> {
        let conn = self.conn.lock().unwrap();
        let job = get_job(&conn, job_id)?;
        let upload = conn
            .prepare_cached(GET_UPLOAD_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .query_row(named_params! {":id": job.upload_id}, |row| {
                Ok(UploadRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    original_filename: row.get(2)?,
                    storage_key: row.get(3)?,
                })
            })
            .optional()
            .err_kind(ErrorKind::DbFailure)?
            .ok_or_else(|| err!(NotFound, msg("no upload {} for job {job_id}", job.upload_id)))?;
        Ok((job, upload))
    }

    pub fn user(&self, user_id: i64) -> Result<UserRow, Error> {
        let conn = self.conn.lock().unwrap();
        get_user(&conn, user_id)?.ok_or_else(|| err!(NotFound, msg("no such user {user_id}")))
    }

    /// Deducts `amount` credits atomically; fails without mutating anything
    /// when the balance is short.
    pub fn charge_credits(&self, user_id: i64, amount: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .prepare_cached(CHARGE_CREDITS_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {":id": user_id, ":amount": amount})
            .err_kind(ErrorKind::DbFailure)?;
        if n == 1 {
            return Ok(());
        }
        match get_user(&conn, user_id)? {
            None => bail!(NotFound, msg("no such user {user_id}")),
            Some(u) => bail!(
                InsufficientCredits,
                msg(
                    "insufficient credits: need {amount}, have {} (deficit {})",
                    u.credits,
                    amount - u.credits
                )
            ),
        }
    }

    /// Returns `amount` credits. A refund is its own transaction so a failed
    /// job can still be marked failed when the refund itself fails.
    pub fn refund_credits(&self, user_id: i64, amount: i64) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn
            .prepare_cached(REFUND_CREDITS_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {":id": user_id, ":amount": amount})
            .err_kind(ErrorKind::DbFailure)?;
        if n != 1 {
            bail!(NotFound, msg("no such user {user_id}"));
        }
        Ok(())
    }

    /// Replaces the job's clip rows in one transaction: any rows from a
    /// previous render of the same job are deleted first, so re-running a job
    /// is idempotent. Returns the number of inserted rows.
    pub fn replace_clips(
        &self,
        job_id: i64,
        upload_id: i64,
        clips: &[NewClip],
    ) -> Result<usize, Error> {
        for c in clips {
            if !CLIP_KEY_RE.is_match(&c.storage_key) {
                bail!(DbFailure, msg("malformed clip storage key {:?}", c.storage_key));
            }
            if !(c.start_time >= 0.0 && c.start_time < c.end_time) {
                bail!(
                    DbFailure,
                    msg("bad clip bounds [{}, {}]", c.start_time, c.end_time)
                );
            }
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().err_kind(ErrorKind::DbFailure)?;
        tx.prepare_cached(DELETE_CLIPS_FOR_JOB_SQL)
            .err_kind(ErrorKind::DbFailure)?
            .execute(named_params! {":job_id": job_id})
            .err_kind(ErrorKind::DbFailure)?;
        let mut inserted = 0;
        for c in clips {
            tx.prepare_cached(INSERT_CLIP_SQL)
                .err_kind(ErrorKind::DbFailure)?
                .execute(named_params! {
                    ":upload_id": upload_id,
                    ":job_id": job_id,
                    ":storage_key": c.storage_key,
                    ":start_time": c.start_time,
                    ":end_time": c.end_time,
                    ":duration": c.end_time - c.start_time,
                    ":title": c.title,
                })
                .err_kind(ErrorKind::DbFailure)?;
            inserted += 1;
        }
        tx.commit().err_kind(ErrorKind::DbFailure)?;
        Ok(inserted)
    }

    pub fn clips_for_job(&self, job_id: i64) -> Result<Vec<ClipRow>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare_cached(LIST_CLIPS_FOR_JOB_SQL)
            .err_kind(ErrorKind::DbFailure)?;
        let rows = stmt
            .query_map(named_params! {":job_id": job_id}, |row| {
                Ok(ClipRow {
                    id: row.get(0)?,
                    upload_id: row.get(1)?,
                    job_id: row.get(2)?,
                    storage_key: row.get(3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    duration: row.get(6)?,
                    title: row.get(7)?,
                })
            })
            .err_kind(ErrorKind::DbFailure)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.err_kind(ErrorKind::DbFailure)?);
        }
        Ok(out)
    }

    /// Registration surface used by the API plane (and tests).
    pub fn insert_user(&self, plan: &str, credits: i64) -> Result<i64, Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into users (plan, credits) values (?1, ?2)",
            params![plan, credits],
        )
        .err_kind(ErrorKind::DbFailure)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_upload(
        &self,
        user_id: i64,
        storage_key: &str,
        original_filename: &str,
    ) -> Result<i64, Error> {
        if !UPLOAD_KEY_RE.is_match(storage_key) {
            bail!(DbFailure, msg("malformed upload storage key {storage_key:?}"));
        }
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into uploads (user_id, original_filename, storage_key, created_at) \
             values (?1, ?2, ?3, ?4)",
            params![user_id, original_filename, storage_key, now],
        )
        .err_kind(ErrorKind::DbFailure)?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_job(&self, upload_id: i64, settings: &RenderSettings) -> Result<i64, Error> {
        let now = self.now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "insert into jobs (upload_id, status, aspect_ratio, captions_enabled, \
             watermark_enabled, caption_style_json, created_at, updated_at) \
             values (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                upload_id,
                settings.aspect.as_label(),
                settings.captions_enabled,
                settings.watermark_enabled,
                settings.caption_style,
                now,
            ],
        )
        .err_kind(ErrorKind::DbFailure)?;
        Ok(conn.last_insert_rowid())
    }
}

fn claim_next_portable(conn: &Connection, now: i64) -> Result<Option<i64>, Error> {
    let id: Option<i64> = conn
        .query_row(SELECT_NEXT_QUEUED_SQL, [], |row| row.get(0))
        .optional()
        .err_kind(ErrorKind::DbFailure)?;
    let Some(id) = id else {
        return Ok(None);
    };
    let n = conn
        .execute(CLAIM_BY_ID_SQL, named_params! {":id": id, ":now": now})
        .err_kind(ErrorKind::DbFailure)?;
    Ok((n == 1).then_some(id))
}

fn get_job(conn: &Connection, job_id: i64) -> Result<JobRow, Error> {
    let raw = conn
        .prepare_cached(GET_JOB_SQL)
        .err_kind(ErrorKind::DbFailure)?
        .query_row(named_params! {":id": job_id}, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, bool>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })
        .optional()
        .err_kind(ErrorKind::DbFailure)?
        .ok_or_else(|| err!(NotFound, msg("no such job {job_id}")))?;
    Ok(JobRow {
        id: raw.0,
        upload_id: raw.1,
        status: JobStatus::parse(&raw.2)?,
        error: raw.3,
        created_at: raw.8,
        updated_at: raw.9,
        settings: RenderSettings {
            aspect: AspectRatio::from_label(&raw.4),
            captions_enabled: raw.5,
            watermark_enabled: raw.6,
            caption_style: raw.7,
        },
    })
}

fn get_user(conn: &Connection, user_id: i64) -> Result<Option<UserRow>, Error> {
    conn.prepare_cached(GET_USER_SQL)
        .err_kind(ErrorKind::DbFailure)?
        .query_row(named_params! {":id": user_id}, |row| {
            Ok(UserRow {
                id: row.get(0)?,
                plan: row.get(1)?,
                credits: row.get(2)?,
            })
        })
        .optional()
        .err_kind(ErrorKind::DbFailure)
}

#[cfg(test)]
mod tests {
    use super::testutil::TestDb;
    use super::*;
    use base::clock::SimulatedClocks;
    use jiff::Timestamp;

    #[test]
    fn claim_is_fifo_and_exhausts() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let j1 = t.add_job(upload);
        let j2 = t.add_job(upload);
        assert_eq!(t.db.claim_next().unwrap(), Some(j1));
        assert_eq!(t.db.claim_next().unwrap(), Some(j2));
        assert_eq!(t.db.claim_next().unwrap(), None);
        assert_eq!(t.db.job(j1).unwrap().status, JobStatus::Running(None));
    }

    #[test]
    fn claim_race_yields_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let clocks = SimulatedClocks::new(Timestamp::from_second(1_700_000_000).unwrap());
        {
            let mut conn = Connection::open(&path).unwrap();
            init(&mut conn).unwrap();
        }
        let a = Database::open(&path, clocks.clone()).unwrap();
        let b = Database::open(&path, clocks).unwrap();

        let user = a.insert_user("free", 10).unwrap();
        let upload = a
            .insert_upload(user, &format!("users/{user}/videos/in.mp4"), "in.mp4")
            .unwrap();
        a.insert_job(upload, &RenderSettings::default()).unwrap();

        let ra = a.claim_next().unwrap();
        let rb = b.claim_next().unwrap();
        assert!(ra.is_some() ^ rb.is_some(), "{ra:?} vs {rb:?}");
    }

    #[test]
    fn portable_claim_matches_returning_claim() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let j1 = t.add_job(upload);
        {
            let conn = t.db.conn.lock().unwrap();
            assert_eq!(claim_next_portable(&conn, 1).unwrap(), Some(j1));
            assert_eq!(claim_next_portable(&conn, 2).unwrap(), None);
        }
        assert_eq!(t.db.job(j1).unwrap().status, JobStatus::Running(None));
    }

    #[test]
    fn heartbeat_bumps_updated_at_monotonically() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        t.db.claim_next().unwrap();
        let before = t.db.job(job).unwrap().updated_at;
        t.clocks.sleep(std::time::Duration::from_secs(10));
        t.db.heartbeat(job).unwrap();
        let after = t.db.job(job).unwrap().updated_at;
        assert_eq!(after, before + 10);
    }

    #[test]
    fn reclaim_requeues_iff_stale() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        t.db.claim_next().unwrap();

        // 29 s since claim: a 30 s cutoff must leave the job alone.
        t.clocks.sleep(std::time::Duration::from_secs(29));
        assert_eq!(t.db.reclaim_stale(Duration::from_secs(30)).unwrap(), 0);
        assert_eq!(t.db.job(job).unwrap().status, JobStatus::Running(None));

        // Exactly 30 s: requeue.
        t.clocks.sleep(std::time::Duration::from_secs(1));
        assert_eq!(t.db.reclaim_stale(Duration::from_secs(30)).unwrap(), 1);
        let row = t.db.job(job).unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.error.as_deref(), Some("reclaimed"));
    }

    #[test]
    fn heartbeat_prevents_reclaim() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        t.db.claim_next().unwrap();

        // Beat every 10 s for a minute; a 30 s cutoff never fires.
        for _ in 0..6 {
            t.clocks.sleep(std::time::Duration::from_secs(10));
            t.db.heartbeat(job).unwrap();
            assert_eq!(t.db.reclaim_stale(Duration::from_secs(30)).unwrap(), 0);
        }
        assert_eq!(t.db.job(job).unwrap().status, JobStatus::Running(None));
    }

    #[test]
    fn terminal_status_never_transitions() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        t.db.claim_next().unwrap();
        assert!(t.db.set_status(job, &JobStatus::Done, None).unwrap());
        assert!(!t
            .db
            .set_status(job, &JobStatus::Running(Some(Stage::Render)), None)
            .unwrap());
        assert!(!t.db.set_status(job, &JobStatus::Failed, Some("x")).unwrap());
        assert_eq!(t.db.job(job).unwrap().status, JobStatus::Done);
    }

    #[test]
    fn stage_statuses_round_trip() {
        for stage in Stage::ALL {
            let s = JobStatus::Running(Some(stage)).to_string();
            assert_eq!(JobStatus::parse(&s).unwrap(), JobStatus::Running(Some(stage)));
        }
        assert!(JobStatus::parse("running:mystery").is_err());
    }

    #[test]
    fn charge_and_refund() {
        let t = TestDb::new();
        let user = t.add_user("creator", 5);
        t.db.charge_credits(user, 3).unwrap();
        assert_eq!(t.db.user(user).unwrap().credits, 2);

        let e = t.db.charge_credits(user, 3).unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InsufficientCredits);
        assert!(e.to_string().contains("deficit 1"), "{e}");
        // A failed charge must not mutate the balance.
        assert_eq!(t.db.user(user).unwrap().credits, 2);

        t.db.refund_credits(user, 3).unwrap();
        assert_eq!(t.db.user(user).unwrap().credits, 5);
    }

    #[test]
    fn replace_clips_is_idempotent() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        let key = |i: u32| format!("users/{user}/clips/{job}/{i:02}_abc.mp4");
        let clip = |i: u32, s: f64, e: f64| NewClip {
            storage_key: key(i),
            start_time: s,
            end_time: e,
            title: Some("A title".to_owned()),
        };
        assert_eq!(
            t.db.replace_clips(job, upload, &[clip(0, 0.0, 30.0), clip(1, 40.0, 70.0)])
                .unwrap(),
            2
        );
        // Re-render: old rows go away, no unique-key conflicts.
        assert_eq!(
            t.db.replace_clips(job, upload, &[clip(0, 5.0, 35.0)]).unwrap(),
            1
        );
        let rows = t.db.clips_for_job(job).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_time, 5.0);
        assert!((rows[0].duration - 30.0).abs() < 1e-9);
    }

    #[test]
    fn key_shapes_are_enforced() {
        let t = TestDb::new();
        let user = t.add_user("free", 10);
        let e = t
            .db
            .insert_upload(user, "videos/loose.mp4", "loose.mp4")
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DbFailure);

        let upload = t.add_upload(user);
        let job = t.add_job(upload);
        let e = t
            .db
            .replace_clips(
                job,
                upload,
                &[NewClip {
                    storage_key: format!("users/{user}/clips/{job}/clip.webm"),
                    start_time: 0.0,
                    end_time: 1.0,
                    title: None,
                }],
            )
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DbFailure);
    }
}
