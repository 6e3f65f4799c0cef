//! Transition journal - SQLite-backed history of head changes and reconciles
//!
//! Every classified transition and every reconcile outcome is appended here
//! so `headwatch history` can show what the watcher saw and did. The
//! database is stored in XDG_DATA_HOME/headwatch/events.db by default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info};

use crate::classify::Transition;

/// Kinds of journal entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    BranchSwitch,
    RevisionAdvance,
    DetachedEntered,
    DetachedRecovered,
    ScanCompleted,
    ScanFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BranchSwitch => "branch_switch",
            EventType::RevisionAdvance => "revision_advance",
            EventType::DetachedEntered => "detached_entered",
            EventType::DetachedRecovered => "detached_recovered",
            EventType::ScanCompleted => "scan_completed",
            EventType::ScanFailed => "scan_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "branch_switch" => Some(EventType::BranchSwitch),
            "revision_advance" => Some(EventType::RevisionAdvance),
            "detached_entered" => Some(EventType::DetachedEntered),
            "detached_recovered" => Some(EventType::DetachedRecovered),
            "scan_completed" => Some(EventType::ScanCompleted),
            "scan_failed" => Some(EventType::ScanFailed),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            EventType::BranchSwitch => Severity::Info,
            EventType::RevisionAdvance => Severity::Info,
            EventType::DetachedEntered => Severity::Warning,
            EventType::DetachedRecovered => Severity::Info,
            EventType::ScanCompleted => Severity::Info,
            EventType::ScanFailed => Severity::Error,
        }
    }

    /// Journal kind for a transition; `NoChange` is never journaled
    pub fn for_transition(transition: &Transition) -> Option<Self> {
        match transition {
            Transition::NoChange => None,
            Transition::BranchSwitch { .. } => Some(EventType::BranchSwitch),
            Transition::RevisionAdvance { .. } => Some(EventType::RevisionAdvance),
            Transition::DetachedEntered => Some(EventType::DetachedEntered),
            Transition::DetachedRecovered { .. } => Some(EventType::DetachedRecovered),
        }
    }
}

/// Severity levels for events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            _ => None,
        }
    }
}

/// A journal record
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub severity: Severity,
    pub branch: Option<String>,
    pub revision: Option<String>,
    pub summary: String,
    pub details: Option<String>,
}

/// Builder for new journal entries
#[derive(Debug)]
pub struct JournalEntryBuilder {
    event_type: EventType,
    summary: String,
    branch: Option<String>,
    revision: Option<String>,
    details: Option<String>,
}

impl JournalEntryBuilder {
    pub fn new(event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            event_type,
            summary: summary.into(),
            branch: None,
            revision: None,
            details: None,
        }
    }

    pub fn branch(mut self, branch: Option<&str>) -> Self {
        self.branch = branch.map(str::to_string);
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn details_json<T: serde::Serialize>(mut self, details: &T) -> Self {
        if let Ok(json) = serde_json::to_string(details) {
            self.details = Some(json);
        }
        self
    }
}

/// Journal database
pub struct EventJournal {
    conn: Connection,
}

impl EventJournal {
    /// Open or create the journal at a specific path
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create journal directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open journal at {}", path.display()))?;

        let journal = Self { conn };
        journal.initialize()?;

        info!("Transition journal opened at {}", path.display());
        Ok(journal)
    }

    /// Open an in-memory journal (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory journal")?;
        let journal = Self { conn };
        journal.initialize()?;
        Ok(journal)
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    branch TEXT,
                    revision TEXT,
                    summary TEXT NOT NULL,
                    details TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_events_time ON events(timestamp);
                CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, timestamp);
                "#,
            )
            .context("Failed to initialize journal schema")?;

        debug!("Journal schema initialized");
        Ok(())
    }

    /// Append an entry, returning its id
    pub fn record(&self, builder: JournalEntryBuilder) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let severity = builder.event_type.severity();

        self.conn
            .execute(
                r#"
                INSERT INTO events (timestamp, event_type, severity, branch, revision, summary, details)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    now,
                    builder.event_type.as_str(),
                    severity.as_str(),
                    builder.branch,
                    builder.revision,
                    builder.summary,
                    builder.details,
                ],
            )
            .context("Failed to record journal entry")?;

        let id = self.conn.last_insert_rowid();
        debug!(
            "Journaled {} - {}",
            builder.event_type.as_str(),
            builder.summary
        );
        Ok(id)
    }

    /// Most recent entries first, optionally filtered by kind
    pub fn recent(&self, event_type: Option<EventType>, limit: u32) -> Result<Vec<JournalEntry>> {
        let (where_clause, filter) = match event_type {
            Some(et) => ("WHERE event_type = ?1", Some(et.as_str())),
            None => ("", None),
        };

        let sql = format!(
            r#"
            SELECT id, timestamp, event_type, severity, branch, revision, summary, details
            FROM events
            {}
            ORDER BY id DESC
            LIMIT {}
            "#,
            where_clause, limit
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<JournalEntry> {
            Ok(JournalEntry {
                id: row.get(0)?,
                timestamp: row
                    .get::<_, String>(1)
                    .ok()
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                event_type: EventType::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(EventType::ScanFailed),
                severity: Severity::parse(&row.get::<_, String>(3)?).unwrap_or(Severity::Info),
                branch: row.get(4)?,
                revision: row.get(5)?,
                summary: row.get(6)?,
                details: row.get(7)?,
            })
        };

        let entries = match filter {
            Some(value) => stmt.query_map(params![value], map_row),
            None => stmt.query_map([], map_row),
        }
        .context("Failed to query journal")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect journal entries")?;

        Ok(entries)
    }

    /// Delete entries older than `days`
    pub fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(days as i64);
        let count = self
            .conn
            .execute(
                "DELETE FROM events WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .context("Failed to prune journal")?;
        Ok(count as u64)
    }
}
