//! Typed access to the document queue, stage results, safety flags,
//! heartbeat and activity log.
//!
//! The store is the single source of truth shared by the intake handlers and
//! the agent thread. Components never hold rows in memory across operations —
//! documents are referenced by id everywhere. A stage advance (status update
//! + result insert) is applied as one transaction so a concurrent reader
//! never observes a torn state.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{now_iso, DatabaseError};

// ═══════════════════════════════════════════
// Enums
// ═══════════════════════════════════════════

/// Lifecycle stage of a queued document.
///
/// Transitions are monotonic: pending → extracting → standardizing →
/// building → validating → completed, with `failed` reachable from any
/// intermediate stage. The only backward move is startup crash recovery
/// (intermediate → pending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Pending,
    Extracting,
    Standardizing,
    Building,
    Validating,
    Completed,
    Failed,
}

impl DocumentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Standardizing => "standardizing",
            Self::Building => "building",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "extracting" => Some(Self::Extracting),
            "standardizing" => Some(Self::Standardizing),
            "building" => Some(Self::Building),
            "validating" => Some(Self::Validating),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal stages are never re-picked by the agent.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// In-flight stages reset to pending by crash recovery.
    pub fn is_intermediate(&self) -> bool {
        matches!(
            self,
            Self::Extracting | Self::Standardizing | Self::Building | Self::Validating
        )
    }
}

impl std::fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Label under which a stage output is snapshotted in pipeline_results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Extraction,
    Standardization,
    Fhir,
    Validation,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Standardization => "standardization",
            Self::Fhir => "fhir",
            Self::Validation => "validation",
        }
    }
}

/// Severity of a safety flag. Fixed per check kind, never escalated by count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// The five deterministic safety check identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    PiiLeak,
    CodingError,
    DoseVariance,
    SchemaError,
    AmbiguousName,
}

impl FlagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PiiLeak => "pii_leak",
            Self::CodingError => "coding_error",
            Self::DoseVariance => "dose_variance",
            Self::SchemaError => "schema_error",
            Self::AmbiguousName => "ambiguous_name",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pii_leak" => Some(Self::PiiLeak),
            "coding_error" => Some(Self::CodingError),
            "dose_variance" => Some(Self::DoseVariance),
            "schema_error" => Some(Self::SchemaError),
            "ambiguous_name" => Some(Self::AmbiguousName),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════
// Row types
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_path: String,
    pub stage: DocumentStage,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub patient_ref: Option<String>,
    pub critical_flags: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineResultRow {
    pub id: i64,
    pub document_id: String,
    pub stage: String,
    pub attempt: i64,
    pub output_json: String,
    pub confidence: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafetyFlag {
    pub id: i64,
    pub document_id: String,
    pub filename: Option<String>,
    pub kind: FlagKind,
    pub severity: Severity,
    pub detail: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub last_seen: String,
    pub cycle_count: i64,
    pub current_document_id: Option<String>,
    pub documents_processed_total: i64,
    pub flags_raised_total: i64,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub unresolved_flags: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub event: String,
    pub message: String,
    pub document_id: Option<String>,
    pub stage: Option<String>,
    pub level: String,
    pub created_at: String,
}

// ═══════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════

/// Insert a new pending document and return it.
pub fn insert_document(
    conn: &Connection,
    filename: &str,
    file_path: &str,
) -> Result<Document, DatabaseError> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO documents (id, filename, file_path, stage, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
        params![id, filename, file_path, now],
    )?;
    get_document(conn, &id)
}

pub fn get_document(conn: &Connection, id: &str) -> Result<Document, DatabaseError> {
    conn.query_row(
        "SELECT id, filename, file_path, stage, attempts, last_error, patient_ref,
                critical_flags, created_at, updated_at
         FROM documents WHERE id = ?1",
        params![id],
        document_from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound {
        entity_type: "document".to_string(),
        id: id.to_string(),
    })
}

/// The oldest pending document (FIFO by creation time), if any. Timestamp
/// ties break on rowid, the table's insertion order, never on the random id.
pub fn next_pending(conn: &Connection) -> Result<Option<Document>, DatabaseError> {
    let doc = conn
        .query_row(
            "SELECT id, filename, file_path, stage, attempts, last_error, patient_ref,
                    critical_flags, created_at, updated_at
             FROM documents
             WHERE stage = 'pending'
             ORDER BY created_at ASC, rowid ASC
             LIMIT 1",
            [],
            document_from_row,
        )
        .optional()?;
    Ok(doc)
}

/// Move a document to a new stage. Callers own the monotonicity invariant;
/// the store only refuses to touch terminal documents.
pub fn set_stage(
    conn: &Connection,
    id: &str,
    stage: DocumentStage,
) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE documents SET stage = ?1, updated_at = ?2
         WHERE id = ?3 AND stage NOT IN ('completed', 'failed')",
        params![stage.as_str(), now_iso(), id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "document".to_string(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Snapshot a stage output and advance the document in one transaction.
///
/// The UNIQUE (document_id, stage, attempt) constraint means a stage writes
/// at most once per attempt; earlier attempts' rows survive as audit records.
pub fn advance_with_result(
    conn: &Connection,
    doc: &Document,
    stage: PipelineStage,
    output: &serde_json::Value,
    confidence: Option<f64>,
    next_stage: DocumentStage,
) -> Result<(), DatabaseError> {
    let now = now_iso();
    let output_json = serde_json::to_string(output)
        .map_err(|e| DatabaseError::BadPayload(e.to_string()))?;

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO pipeline_results (document_id, stage, attempt, output_json, confidence, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![doc.id, stage.as_str(), doc.attempts, output_json, confidence, now],
    )?;
    tx.execute(
        "UPDATE documents SET stage = ?1, updated_at = ?2 WHERE id = ?3",
        params![next_stage.as_str(), now, doc.id],
    )?;
    tx.commit()?;
    Ok(())
}

/// Mark a document permanently failed, recording the error text.
pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE documents SET stage = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
        params![error, now_iso(), id],
    )?;
    Ok(())
}

/// Requeue a document after a transient stage failure. Increments the attempt
/// counter and returns the new count so the caller can enforce the ceiling.
pub fn requeue_document(
    conn: &Connection,
    id: &str,
    error: &str,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "UPDATE documents
         SET stage = 'pending', attempts = attempts + 1, last_error = ?1, updated_at = ?2
         WHERE id = ?3",
        params![error, now_iso(), id],
    )?;
    conn.query_row(
        "SELECT attempts FROM documents WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
    .map_err(DatabaseError::Sqlite)
}

pub fn mark_completed(conn: &Connection, id: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE documents SET stage = 'completed', updated_at = ?1 WHERE id = ?2",
        params![now_iso(), id],
    )?;
    Ok(())
}

/// Attach the de-identified patient reference produced by standardization.
pub fn set_patient_ref(
    conn: &Connection,
    id: &str,
    patient_ref: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE documents SET patient_ref = ?1, updated_at = ?2 WHERE id = ?3",
        params![patient_ref, now_iso(), id],
    )?;
    Ok(())
}

pub fn increment_critical_flags(
    conn: &Connection,
    id: &str,
    count: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE documents SET critical_flags = critical_flags + ?1, updated_at = ?2
         WHERE id = ?3",
        params![count, now_iso(), id],
    )?;
    Ok(())
}

/// Reset any document caught mid-pipeline back to pending. Runs once at
/// process start, before the first cycle. Prior pipeline_results are
/// retained; the attempt bump keeps the rerun's snapshots from colliding
/// with them.
pub fn recover_stalled_documents(conn: &Connection) -> Result<usize, DatabaseError> {
    let count = conn.execute(
        "UPDATE documents SET stage = 'pending', attempts = attempts + 1, updated_at = ?1
         WHERE stage IN ('extracting', 'standardizing', 'building', 'validating')",
        params![now_iso()],
    )?;
    Ok(count)
}

pub fn recent_documents(
    conn: &Connection,
    limit: i64,
) -> Result<Vec<Document>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, filename, file_path, stage, attempts, last_error, patient_ref,
                critical_flags, created_at, updated_at
         FROM documents
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], document_from_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn queue_stats(conn: &Connection) -> Result<QueueStats, DatabaseError> {
    let count = |sql: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(sql, [], |row| row.get(0))
    };
    Ok(QueueStats {
        total: count("SELECT COUNT(*) FROM documents")?,
        pending: count("SELECT COUNT(*) FROM documents WHERE stage = 'pending'")?,
        processing: count(
            "SELECT COUNT(*) FROM documents
             WHERE stage IN ('extracting', 'standardizing', 'building', 'validating')",
        )?,
        completed: count("SELECT COUNT(*) FROM documents WHERE stage = 'completed'")?,
        failed: count("SELECT COUNT(*) FROM documents WHERE stage = 'failed'")?,
        unresolved_flags: count("SELECT COUNT(*) FROM safety_flags WHERE resolved = 0")?,
    })
}

// ═══════════════════════════════════════════
// Pipeline results
// ═══════════════════════════════════════════

pub fn results_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<PipelineResultRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, document_id, stage, attempt, output_json, confidence, created_at
         FROM pipeline_results
         WHERE document_id = ?1
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![document_id], |row| {
        Ok(PipelineResultRow {
            id: row.get(0)?,
            document_id: row.get(1)?,
            stage: row.get(2)?,
            attempt: row.get(3)?,
            output_json: row.get(4)?,
            confidence: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// The standardized output of the most recent *completed* prior document for
/// the same patient, used as the dose baseline. Returns (document_id,
/// output_json); the caller deserializes — the store treats snapshots as
/// opaque blobs.
pub fn prior_standardization(
    conn: &Connection,
    patient_ref: &str,
    exclude_document_id: &str,
) -> Result<Option<(String, String)>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT d.id, pr.output_json
             FROM documents d
             JOIN pipeline_results pr ON pr.document_id = d.id
             WHERE d.patient_ref = ?1
               AND d.id != ?2
               AND d.stage = 'completed'
               AND pr.stage = 'standardization'
             ORDER BY d.updated_at DESC, pr.id DESC
             LIMIT 1",
            params![patient_ref, exclude_document_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    Ok(row)
}

// ═══════════════════════════════════════════
// Safety flags
// ═══════════════════════════════════════════

/// Insert a flag raised by the validating pass. Returns the flag id.
pub fn insert_safety_flag(
    conn: &Connection,
    document_id: &str,
    kind: FlagKind,
    severity: Severity,
    detail: &str,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO safety_flags (document_id, kind, severity, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![document_id, kind.as_str(), severity.as_str(), detail, now_iso()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Mark a flag resolved. Resolving a missing or already-resolved flag is an
/// error, not a no-op — the `resolved = 0` guard makes both cases NotFound.
pub fn resolve_safety_flag(conn: &Connection, flag_id: i64) -> Result<(), DatabaseError> {
    let changed = conn.execute(
        "UPDATE safety_flags SET resolved = 1, resolved_at = ?1
         WHERE id = ?2 AND resolved = 0",
        params![now_iso(), flag_id],
    )?;
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "safety_flag".to_string(),
            id: flag_id.to_string(),
        });
    }
    Ok(())
}

pub fn unresolved_flags(conn: &Connection) -> Result<Vec<SafetyFlag>, DatabaseError> {
    query_flags(
        conn,
        "SELECT sf.id, sf.document_id, d.filename, sf.kind, sf.severity, sf.detail,
                sf.resolved, sf.resolved_at, sf.created_at
         FROM safety_flags sf
         JOIN documents d ON d.id = sf.document_id
         WHERE sf.resolved = 0
         ORDER BY sf.created_at DESC, sf.id DESC",
        [],
    )
}

pub fn all_flags(conn: &Connection, limit: i64) -> Result<Vec<SafetyFlag>, DatabaseError> {
    query_flags(
        conn,
        "SELECT sf.id, sf.document_id, d.filename, sf.kind, sf.severity, sf.detail,
                sf.resolved, sf.resolved_at, sf.created_at
         FROM safety_flags sf
         JOIN documents d ON d.id = sf.document_id
         ORDER BY sf.created_at DESC, sf.id DESC
         LIMIT ?1",
        params![limit],
    )
}

pub fn flags_for_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Vec<SafetyFlag>, DatabaseError> {
    query_flags(
        conn,
        "SELECT sf.id, sf.document_id, d.filename, sf.kind, sf.severity, sf.detail,
                sf.resolved, sf.resolved_at, sf.created_at
         FROM safety_flags sf
         JOIN documents d ON d.id = sf.document_id
         WHERE sf.document_id = ?1
         ORDER BY sf.id ASC",
        params![document_id],
    )
}

fn query_flags<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<SafetyFlag>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(FlagRow {
            id: row.get(0)?,
            document_id: row.get(1)?,
            filename: row.get(2)?,
            kind: row.get(3)?,
            severity: row.get(4)?,
            detail: row.get(5)?,
            resolved: row.get(6)?,
            resolved_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;

    let mut flags = Vec::new();
    for row in rows {
        flags.push(flag_from_row(row?)?);
    }
    Ok(flags)
}

// ═══════════════════════════════════════════
// Heartbeat
// ═══════════════════════════════════════════

/// Re-initialize the single heartbeat row at process start.
pub fn init_heartbeat(conn: &Connection) -> Result<(), DatabaseError> {
    let now = now_iso();
    conn.execute(
        "INSERT INTO agent_heartbeat (id, last_seen, cycle_count, started_at)
         VALUES (1, ?1, 0, ?1)
         ON CONFLICT(id) DO UPDATE SET
             last_seen = ?1, cycle_count = 0, current_document_id = NULL, started_at = ?1",
        params![now],
    )?;
    Ok(())
}

/// Record the start of a polling cycle: bump the cycle counter and note the
/// document in flight (if any).
pub fn heartbeat_cycle(
    conn: &Connection,
    current_document_id: Option<&str>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE agent_heartbeat
         SET last_seen = ?1, cycle_count = cycle_count + 1, current_document_id = ?2
         WHERE id = 1",
        params![now_iso(), current_document_id],
    )?;
    Ok(())
}

/// Fold processed-document / raised-flag totals into the heartbeat row and
/// clear the in-flight document marker.
pub fn heartbeat_totals(
    conn: &Connection,
    docs_delta: i64,
    flags_delta: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE agent_heartbeat
         SET last_seen = ?1,
             current_document_id = NULL,
             documents_processed_total = documents_processed_total + ?2,
             flags_raised_total = flags_raised_total + ?3
         WHERE id = 1",
        params![now_iso(), docs_delta, flags_delta],
    )?;
    Ok(())
}

pub fn get_heartbeat(conn: &Connection) -> Result<Option<Heartbeat>, DatabaseError> {
    let hb = conn
        .query_row(
            "SELECT last_seen, cycle_count, current_document_id,
                    documents_processed_total, flags_raised_total, started_at
             FROM agent_heartbeat WHERE id = 1",
            [],
            |row| {
                Ok(Heartbeat {
                    last_seen: row.get(0)?,
                    cycle_count: row.get(1)?,
                    current_document_id: row.get(2)?,
                    documents_processed_total: row.get(3)?,
                    flags_raised_total: row.get(4)?,
                    started_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(hb)
}

// ═══════════════════════════════════════════
// Activity log
// ═══════════════════════════════════════════

/// Number of activity rows retained.
const ACTIVITY_LOG_CAP: i64 = 500;

/// Write a timestamped agent activity entry, keeping the most recent rows.
pub fn write_activity(
    conn: &Connection,
    event: &str,
    message: &str,
    document_id: Option<&str>,
    stage: Option<&str>,
    level: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO agent_log (event, message, document_id, stage, level, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![event, message, document_id, stage, level, now_iso()],
    )?;
    conn.execute(
        "DELETE FROM agent_log WHERE id NOT IN (
             SELECT id FROM agent_log ORDER BY id DESC LIMIT ?1
         )",
        params![ACTIVITY_LOG_CAP],
    )?;
    Ok(())
}

/// Recent activity entries, oldest first.
pub fn recent_activity(
    conn: &Connection,
    limit: i64,
) -> Result<Vec<ActivityEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, event, message, document_id, stage, level, created_at
         FROM agent_log ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(ActivityEntry {
            id: row.get(0)?,
            event: row.get(1)?,
            message: row.get(2)?,
            document_id: row.get(3)?,
            stage: row.get(4)?,
            level: row.get(5)?,
            created_at: row.get(6)?,
        })
    })?;
    let mut entries = rows.collect::<Result<Vec<_>, _>>()?;
    entries.reverse();
    Ok(entries)
}

// ═══════════════════════════════════════════
// Internal row mapping
// ═══════════════════════════════════════════

fn document_from_row(row: &rusqlite::Row<'_>) -> Result<Document, rusqlite::Error> {
    let stage_raw: String = row.get(3)?;
    let stage = DocumentStage::from_str(&stage_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown stage: {stage_raw}").into(),
        )
    })?;
    Ok(Document {
        id: row.get(0)?,
        filename: row.get(1)?,
        file_path: row.get(2)?,
        stage,
        attempts: row.get(4)?,
        last_error: row.get(5)?,
        patient_ref: row.get(6)?,
        critical_flags: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

struct FlagRow {
    id: i64,
    document_id: String,
    filename: Option<String>,
    kind: String,
    severity: String,
    detail: String,
    resolved: bool,
    resolved_at: Option<String>,
    created_at: String,
}

fn flag_from_row(row: FlagRow) -> Result<SafetyFlag, DatabaseError> {
    let kind = FlagKind::from_str(&row.kind).ok_or_else(|| DatabaseError::InvalidEnum {
        field: "kind".to_string(),
        value: row.kind.clone(),
    })?;
    let severity =
        Severity::from_str(&row.severity).ok_or_else(|| DatabaseError::InvalidEnum {
            field: "severity".to_string(),
            value: row.severity.clone(),
        })?;
    Ok(SafetyFlag {
        id: row.id,
        document_id: row.document_id,
        filename: row.filename,
        kind,
        severity,
        detail: row.detail,
        resolved: row.resolved,
        resolved_at: row.resolved_at,
        created_at: row.created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn setup() -> Connection {
        open_memory_database().expect("in-memory DB")
    }

    fn queue_doc(conn: &Connection, name: &str) -> Document {
        insert_document(conn, name, &format!("/data/uploads/{name}")).unwrap()
    }

    #[test]
    fn insert_document_starts_pending() {
        let conn = setup();
        let doc = queue_doc(&conn, "chart.jpeg");
        assert_eq!(doc.stage, DocumentStage::Pending);
        assert_eq!(doc.attempts, 0);
        assert!(doc.last_error.is_none());
    }

    #[test]
    fn next_pending_is_fifo() {
        let conn = setup();
        let first = queue_doc(&conn, "a.jpeg");
        queue_doc(&conn, "b.jpeg");
        let picked = next_pending(&conn).unwrap().unwrap();
        assert_eq!(picked.id, first.id);
    }

    #[test]
    fn same_timestamp_enqueues_drain_in_insert_order() {
        let conn = setup();
        let names = ["march.jpeg", "b.jpeg", "c.jpeg", "april_revised.jpeg"];
        let ids: Vec<String> = names.iter().map(|n| queue_doc(&conn, n).id).collect();

        // Collapse every created_at onto one instant so only the tie-break
        // decides pick order.
        conn.execute(
            "UPDATE documents SET created_at = '2026-03-01T09:00:00.000000Z'",
            [],
        )
        .unwrap();

        let mut drained = Vec::new();
        while let Some(doc) = next_pending(&conn).unwrap() {
            drained.push(doc.id.clone());
            mark_completed(&conn, &doc.id).unwrap();
        }
        assert_eq!(drained, ids);
    }

    #[test]
    fn next_pending_skips_terminal_documents() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        mark_completed(&conn, &doc.id).unwrap();
        assert!(next_pending(&conn).unwrap().is_none());

        let doc2 = queue_doc(&conn, "b.jpeg");
        mark_failed(&conn, &doc2.id, "image unreadable").unwrap();
        assert!(next_pending(&conn).unwrap().is_none());
    }

    #[test]
    fn set_stage_refuses_terminal_documents() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        mark_completed(&conn, &doc.id).unwrap();
        let err = set_stage(&conn, &doc.id, DocumentStage::Extracting);
        assert!(matches!(err, Err(DatabaseError::NotFound { .. })));
        assert_eq!(
            get_document(&conn, &doc.id).unwrap().stage,
            DocumentStage::Completed
        );
    }

    #[test]
    fn advance_with_result_is_atomic_pair() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        set_stage(&conn, &doc.id, DocumentStage::Extracting).unwrap();
        let doc = get_document(&conn, &doc.id).unwrap();

        advance_with_result(
            &conn,
            &doc,
            PipelineStage::Extraction,
            &serde_json::json!({"cycles": []}),
            Some(0.93),
            DocumentStage::Standardizing,
        )
        .unwrap();

        let doc = get_document(&conn, &doc.id).unwrap();
        assert_eq!(doc.stage, DocumentStage::Standardizing);
        let results = results_for_document(&conn, &doc.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stage, "extraction");
        assert_eq!(results[0].confidence, Some(0.93));
    }

    #[test]
    fn duplicate_stage_result_for_same_attempt_rejected() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        let output = serde_json::json!({});
        advance_with_result(
            &conn,
            &doc,
            PipelineStage::Extraction,
            &output,
            None,
            DocumentStage::Standardizing,
        )
        .unwrap();
        let doc = get_document(&conn, &doc.id).unwrap();
        let err = advance_with_result(
            &conn,
            &doc,
            PipelineStage::Extraction,
            &output,
            None,
            DocumentStage::Standardizing,
        );
        assert!(err.is_err());
    }

    #[test]
    fn requeue_after_recovery_keeps_prior_results() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        advance_with_result(
            &conn,
            &doc,
            PipelineStage::Extraction,
            &serde_json::json!({}),
            None,
            DocumentStage::Standardizing,
        )
        .unwrap();

        // Simulate an uncontrolled restart mid-standardization
        let recovered = recover_stalled_documents(&conn).unwrap();
        assert_eq!(recovered, 1);
        let doc2 = get_document(&conn, &doc.id).unwrap();
        assert_eq!(doc2.stage, DocumentStage::Pending);
        assert_eq!(doc2.attempts, 1);
        assert_eq!(results_for_document(&conn, &doc.id).unwrap().len(), 1);
    }

    #[test]
    fn recovery_does_not_touch_terminal_or_pending() {
        let conn = setup();
        let done = queue_doc(&conn, "done.jpeg");
        mark_completed(&conn, &done.id).unwrap();
        let waiting = queue_doc(&conn, "waiting.jpeg");

        assert_eq!(recover_stalled_documents(&conn).unwrap(), 0);
        assert_eq!(
            get_document(&conn, &done.id).unwrap().stage,
            DocumentStage::Completed
        );
        assert_eq!(
            get_document(&conn, &waiting.id).unwrap().stage,
            DocumentStage::Pending
        );
    }

    #[test]
    fn requeue_increments_attempts() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        set_stage(&conn, &doc.id, DocumentStage::Extracting).unwrap();
        let attempts = requeue_document(&conn, &doc.id, "adapter timeout").unwrap();
        assert_eq!(attempts, 1);
        let doc = get_document(&conn, &doc.id).unwrap();
        assert_eq!(doc.stage, DocumentStage::Pending);
        assert_eq!(doc.last_error.as_deref(), Some("adapter timeout"));
    }

    #[test]
    fn queue_stats_buckets() {
        let conn = setup();
        queue_doc(&conn, "p.jpeg");
        let doc = queue_doc(&conn, "x.jpeg");
        set_stage(&conn, &doc.id, DocumentStage::Validating).unwrap();
        let done = queue_doc(&conn, "c.jpeg");
        mark_completed(&conn, &done.id).unwrap();
        let bad = queue_doc(&conn, "f.jpeg");
        mark_failed(&conn, &bad.id, "boom").unwrap();

        let stats = queue_stats(&conn).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn flag_roundtrip_and_resolve_once() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        let id = insert_safety_flag(
            &conn,
            &doc.id,
            FlagKind::DoseVariance,
            Severity::Critical,
            "Daunorubicin 90mg -> 80mg (11.1% variance)",
        )
        .unwrap();

        let open = unresolved_flags(&conn).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, FlagKind::DoseVariance);
        assert_eq!(open[0].severity, Severity::Critical);
        assert_eq!(open[0].filename.as_deref(), Some("a.jpeg"));

        resolve_safety_flag(&conn, id).unwrap();
        assert!(unresolved_flags(&conn).unwrap().is_empty());

        // Second resolve is an error, not a no-op
        let err = resolve_safety_flag(&conn, id);
        assert!(matches!(err, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn resolve_missing_flag_is_not_found() {
        let conn = setup();
        let err = resolve_safety_flag(&conn, 9999);
        assert!(matches!(err, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn all_flags_respects_limit() {
        let conn = setup();
        let doc = queue_doc(&conn, "a.jpeg");
        for _ in 0..3 {
            insert_safety_flag(&conn, &doc.id, FlagKind::CodingError, Severity::Warning, "x")
                .unwrap();
        }
        assert_eq!(all_flags(&conn, 2).unwrap().len(), 2);
        assert_eq!(all_flags(&conn, 50).unwrap().len(), 3);
    }

    #[test]
    fn heartbeat_lifecycle() {
        let conn = setup();
        init_heartbeat(&conn).unwrap();
        heartbeat_cycle(&conn, Some("doc-1")).unwrap();
        heartbeat_cycle(&conn, None).unwrap();
        heartbeat_totals(&conn, 1, 2).unwrap();

        let hb = get_heartbeat(&conn).unwrap().unwrap();
        assert_eq!(hb.cycle_count, 2);
        assert_eq!(hb.current_document_id, None);
        assert_eq!(hb.documents_processed_total, 1);
        assert_eq!(hb.flags_raised_total, 2);
    }

    #[test]
    fn heartbeat_reinit_resets_cycles_but_not_identity() {
        let conn = setup();
        init_heartbeat(&conn).unwrap();
        heartbeat_cycle(&conn, None).unwrap();
        init_heartbeat(&conn).unwrap();
        let hb = get_heartbeat(&conn).unwrap().unwrap();
        assert_eq!(hb.cycle_count, 0);
    }

    #[test]
    fn activity_log_caps_rows() {
        let conn = setup();
        for i in 0..510 {
            write_activity(&conn, "tick", &format!("cycle {i}"), None, None, "info").unwrap();
        }
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM agent_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(total, 500);

        let recent = recent_activity(&conn, 10).unwrap();
        assert_eq!(recent.len(), 10);
        // Oldest first
        assert!(recent[0].id < recent[9].id);
    }

    #[test]
    fn prior_standardization_finds_latest_completed_for_patient() {
        let conn = setup();
        let older = queue_doc(&conn, "march.jpeg");
        set_patient_ref(&conn, &older.id, "PAT-AAA").unwrap();
        let older = get_document(&conn, &older.id).unwrap();
        advance_with_result(
            &conn,
            &older,
            PipelineStage::Standardization,
            &serde_json::json!({"standardized_drugs": [{"drug_standard": "Daunorubicin", "dose_mg": 90.0}]}),
            None,
            DocumentStage::Building,
        )
        .unwrap();
        mark_completed(&conn, &older.id).unwrap();

        let current = queue_doc(&conn, "april.jpeg");
        set_patient_ref(&conn, &current.id, "PAT-AAA").unwrap();

        let (doc_id, json) = prior_standardization(&conn, "PAT-AAA", &current.id)
            .unwrap()
            .unwrap();
        assert_eq!(doc_id, older.id);
        assert!(json.contains("Daunorubicin"));

        // A different patient has no baseline
        assert!(prior_standardization(&conn, "PAT-BBB", &current.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn prior_standardization_ignores_unfinished_documents() {
        let conn = setup();
        let doc = queue_doc(&conn, "march.jpeg");
        set_patient_ref(&conn, &doc.id, "PAT-AAA").unwrap();
        let doc = get_document(&conn, &doc.id).unwrap();
        advance_with_result(
            &conn,
            &doc,
            PipelineStage::Standardization,
            &serde_json::json!({}),
            None,
            DocumentStage::Building,
        )
        .unwrap();
        // Still mid-pipeline, so it must not serve as a baseline
        assert!(prior_standardization(&conn, "PAT-AAA", "other")
            .unwrap()
            .is_none());
    }
}
