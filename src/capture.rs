use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use rusqlite::{params, Connection, OpenFlags};

use crate::record::CommandRecord;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    app_name TEXT NOT NULL DEFAULT '',
    database_name TEXT NOT NULL DEFAULT '',
    command_text TEXT NOT NULL,
    event_sequence INTEGER NOT NULL,
    replay_offset_ms INTEGER,
    start_time_unix_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_commands_replay_order
    ON commands(start_time_unix_ms, event_sequence);
";

/// A captured workload stored as a SQLite file.
///
/// Listeners write commands as they observe them; the replay host reads the
/// whole capture back in original start order and feeds it to the
/// dispatcher. All SQLite work happens on the blocking pool.
#[derive(Debug, Clone)]
pub struct CaptureFile {
    db_path: PathBuf,
}

impl CaptureFile {
    /// Creates (or opens) a capture file and ensures its schema exists.
    pub fn create(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create capture dir {}", parent.display()))?;
            }
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("open capture {}", db_path.display()))?;
        conn.execute_batch(SCHEMA).context("initialize capture schema")?;
        Ok(Self { db_path })
    }

    /// Opens an existing capture file read-only.
    pub fn open(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("open capture {}", db_path.display()))?;
        Ok(Self { db_path })
    }

    pub async fn append_command(&self, record: CommandRecord) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || append_command_blocking(&db_path, &record))
            .await
            .context("join append_command task")?
    }

    /// Reads the whole capture in original start order.
    pub async fn read_all(&self) -> anyhow::Result<Vec<CommandRecord>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || read_all_blocking(&db_path))
            .await
            .context("join read_all task")?
    }

    pub async fn command_count(&self) -> anyhow::Result<usize> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || count_blocking(&db_path))
            .await
            .context("join command_count task")?
    }
}

fn append_command_blocking(db_path: &Path, record: &CommandRecord) -> anyhow::Result<()> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("open capture {}", db_path.display()))?;
    conn.execute(
        "INSERT INTO commands
            (session_id, app_name, database_name, command_text,
             event_sequence, replay_offset_ms, start_time_unix_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.session_id,
            record.app_name,
            record.database,
            record.text,
            record.event_sequence,
            record.replay_offset_ms.map(|ms| ms as i64),
            record.original_start_time.map(unix_ms),
        ],
    )
    .context("insert command")?;
    Ok(())
}

fn read_all_blocking(db_path: &Path) -> anyhow::Result<Vec<CommandRecord>> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open capture {}", db_path.display()))?;
    let mut stmt = conn
        .prepare(
            "SELECT session_id, app_name, database_name, command_text,
                    event_sequence, replay_offset_ms, start_time_unix_ms
             FROM commands
             ORDER BY start_time_unix_ms ASC, event_sequence ASC, id ASC",
        )
        .context("prepare capture query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok(CommandRecord {
                session_id: row.get(0)?,
                app_name: row.get(1)?,
                database: row.get(2)?,
                text: row.get(3)?,
                event_sequence: row.get(4)?,
                replay_offset_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms.max(0) as u64),
                original_start_time: row
                    .get::<_, Option<i64>>(6)?
                    .map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)),
            })
        })
        .context("query capture rows")?;

    let mut commands = Vec::new();
    for row in rows {
        commands.push(row.context("read capture row")?);
    }
    Ok(commands)
}

fn count_blocking(db_path: &Path) -> anyhow::Result<usize> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("open capture {}", db_path.display()))?;
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM commands", [], |row| row.get(0))
        .context("count capture rows")?;
    Ok(count.max(0) as usize)
}

fn unix_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}
