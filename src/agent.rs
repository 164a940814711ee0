//! The autonomous processing agent.
//!
//! A background thread polls the document queue on a fixed cadence, runs each
//! pending document through extraction → standardization → bundle building →
//! validation, and escalates critical flags. One document at a time; the loop
//! drains the queue before sleeping again.
//!
//! Failure policy: a transient stage error requeues the document until the
//! attempt ceiling, a permanent error fails it immediately. Crash recovery
//! runs once before the first cycle and resets anything caught mid-stage back
//! to pending, keeping earlier stage snapshots as audit records.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::alerts::AlertDispatcher;
use crate::config::Settings;
use crate::db::{
    self, now_iso, repository, DatabaseError, Document, DocumentStage, PipelineStage, SafetyFlag,
    Severity,
};
use crate::pipeline::adapter::{ExtractionAdapter, StandardizationAdapter};
use crate::pipeline::fhir::{build_bundle, hash_patient_id};
use crate::pipeline::types::StandardizedOutput;
use crate::pipeline::validator::{run_validation, DoseBaseline};
use crate::pipeline::StageError;

/// Sleep granularity for shutdown and wake responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_secs(1);

pub struct Agent {
    settings: Settings,
    extraction: Box<dyn ExtractionAdapter>,
    standardization: Box<dyn StandardizationAdapter>,
    dispatcher: AlertDispatcher,
}

/// What one polling cycle did, for the heartbeat and the logs.
#[derive(Debug)]
pub struct TickOutcome {
    pub document_id: String,
    pub completed: bool,
    pub flags_raised: i64,
}

impl Agent {
    pub fn new(
        settings: Settings,
        extraction: Box<dyn ExtractionAdapter>,
        standardization: Box<dyn StandardizationAdapter>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            settings,
            extraction,
            standardization,
            dispatcher,
        }
    }

    /// Startup crash recovery: anything caught mid-stage goes back to pending.
    pub fn recover(&self, conn: &Connection) -> Result<usize, DatabaseError> {
        let recovered = repository::recover_stalled_documents(conn)?;
        if recovered > 0 {
            warn!(recovered, "reset stalled documents to pending");
            repository::write_activity(
                conn,
                "recovery",
                &format!("Reset {recovered} stalled document(s) to pending after restart"),
                None,
                None,
                "warning",
            )?;
        }
        Ok(recovered)
    }

    /// One polling cycle: pick the oldest pending document and run it through
    /// the pipeline. Returns None when the queue is empty.
    pub fn tick(&self, conn: &Connection) -> Result<Option<TickOutcome>, DatabaseError> {
        let Some(doc) = repository::next_pending(conn)? else {
            repository::heartbeat_cycle(conn, None)?;
            return Ok(None);
        };
        repository::heartbeat_cycle(conn, Some(&doc.id))?;

        info!(document_id = %doc.id, filename = %doc.filename, attempt = doc.attempts, "processing document");
        repository::write_activity(
            conn,
            "processing_started",
            &format!("Processing '{}' (attempt {})", doc.filename, doc.attempts + 1),
            Some(&doc.id),
            Some(DocumentStage::Extracting.as_str()),
            "info",
        )?;

        let outcome = match self.process_document(conn, &doc) {
            Ok(flags_raised) => {
                repository::write_activity(
                    conn,
                    "completed",
                    &format!("Completed '{}' with {flags_raised} safety flag(s)", doc.filename),
                    Some(&doc.id),
                    Some(DocumentStage::Completed.as_str()),
                    "info",
                )?;
                repository::heartbeat_totals(conn, 1, flags_raised)?;
                TickOutcome {
                    document_id: doc.id.clone(),
                    completed: true,
                    flags_raised,
                }
            }
            Err(stage_err) => {
                self.handle_stage_failure(conn, &doc, &stage_err)?;
                repository::heartbeat_totals(conn, 0, 0)?;
                TickOutcome {
                    document_id: doc.id.clone(),
                    completed: false,
                    flags_raised: 0,
                }
            }
        };
        Ok(Some(outcome))
    }

    fn handle_stage_failure(
        &self,
        conn: &Connection,
        doc: &Document,
        err: &StageError,
    ) -> Result<(), DatabaseError> {
        if err.is_transient() {
            let attempts = repository::requeue_document(conn, &doc.id, &err.to_string())?;
            if attempts >= self.settings.max_stage_attempts {
                error!(document_id = %doc.id, attempts, "retry ceiling reached, failing document");
                repository::mark_failed(
                    conn,
                    &doc.id,
                    &format!("{err} (after {attempts} attempts)"),
                )?;
                repository::write_activity(
                    conn,
                    "failed",
                    &format!("'{}' failed after {attempts} attempts: {err}", doc.filename),
                    Some(&doc.id),
                    None,
                    "error",
                )?;
            } else {
                warn!(document_id = %doc.id, attempts, error = %err, "transient failure, requeued");
                repository::write_activity(
                    conn,
                    "requeued",
                    &format!("'{}' requeued (attempt {attempts}): {err}", doc.filename),
                    Some(&doc.id),
                    None,
                    "warning",
                )?;
            }
        } else {
            error!(document_id = %doc.id, error = %err, "permanent failure");
            repository::mark_failed(conn, &doc.id, &err.to_string())?;
            repository::write_activity(
                conn,
                "failed",
                &format!("'{}' failed permanently: {err}", doc.filename),
                Some(&doc.id),
                None,
                "error",
            )?;
        }
        Ok(())
    }

    /// Run the four stages for one document. Store errors surface as
    /// transient: SQLITE_BUSY and friends deserve a retry, not a verdict on
    /// the document.
    fn process_document(&self, conn: &Connection, doc: &Document) -> Result<i64, StageError> {
        let store = |e: DatabaseError| StageError::Transient(format!("store: {e}"));

        // Stage 1: vision extraction
        repository::set_stage(conn, &doc.id, DocumentStage::Extracting).map_err(store)?;
        let doc = repository::get_document(conn, &doc.id).map_err(store)?;
        let extracted = self.extraction.extract(Path::new(&doc.file_path))?;
        let extraction = extracted.output;
        let extraction_json = serde_json::to_value(&extraction)
            .map_err(|e| StageError::Permanent(format!("serialize extraction: {e}")))?;
        repository::advance_with_result(
            conn,
            &doc,
            PipelineStage::Extraction,
            &extraction_json,
            extracted.confidence,
            DocumentStage::Standardizing,
        )
        .map_err(store)?;
        self.stage_activity(conn, &doc, PipelineStage::Extraction, extracted.latency_ms)?;

        // Stage 2: standardization
        let standardized = self.standardization.standardize(&extraction)?;
        let standardized_out = standardized.output;
        let standardized_json = serde_json::to_value(&standardized_out)
            .map_err(|e| StageError::Permanent(format!("serialize standardization: {e}")))?;
        let doc = repository::get_document(conn, &doc.id).map_err(store)?;
        repository::advance_with_result(
            conn,
            &doc,
            PipelineStage::Standardization,
            &standardized_json,
            standardized.confidence,
            DocumentStage::Building,
        )
        .map_err(store)?;

        // The de-identified patient key links this document to prior charts.
        let patient_ref = hash_patient_id(
            extraction.patient.name_raw.as_deref().unwrap_or("UNKNOWN"),
            extraction
                .patient
                .registration_number
                .as_deref()
                .unwrap_or("UNKNOWN"),
        );
        repository::set_patient_ref(conn, &doc.id, &patient_ref).map_err(store)?;
        self.stage_activity(conn, &doc, PipelineStage::Standardization, standardized.latency_ms)?;

        // Stage 3: FHIR bundle
        let bundle = build_bundle(&extraction, &standardized_out);
        let doc = repository::get_document(conn, &doc.id).map_err(store)?;
        repository::advance_with_result(
            conn,
            &doc,
            PipelineStage::Fhir,
            &bundle,
            None,
            DocumentStage::Validating,
        )
        .map_err(store)?;
        self.stage_activity(conn, &doc, PipelineStage::Fhir, 0)?;

        // Stage 4: safety validation
        let baseline = self
            .dose_baseline(conn, &patient_ref, &doc.id)
            .map_err(store)?;
        let report = run_validation(
            &extraction,
            &standardized_out,
            &bundle,
            baseline.as_ref(),
            self.settings.dose_variance_threshold,
        );
        let report_json = serde_json::to_value(&report)
            .map_err(|e| StageError::Permanent(format!("serialize report: {e}")))?;
        let doc = repository::get_document(conn, &doc.id).map_err(store)?;
        repository::advance_with_result(
            conn,
            &doc,
            PipelineStage::Validation,
            &report_json,
            None,
            DocumentStage::Completed,
        )
        .map_err(store)?;

        let flags_raised = self.persist_and_escalate(conn, &doc, &report).map_err(store)?;
        info!(
            document_id = %doc.id,
            checks_passed = report.passed_count,
            flags = flags_raised,
            "document completed"
        );
        Ok(flags_raised)
    }

    fn stage_activity(
        &self,
        conn: &Connection,
        doc: &Document,
        stage: PipelineStage,
        latency_ms: u64,
    ) -> Result<(), StageError> {
        repository::write_activity(
            conn,
            "stage_completed",
            &format!("{} finished for '{}' ({latency_ms}ms)", stage.as_str(), doc.filename),
            Some(&doc.id),
            Some(stage.as_str()),
            "info",
        )
        .map_err(|e| StageError::Transient(format!("store: {e}")))
    }

    fn dose_baseline(
        &self,
        conn: &Connection,
        patient_ref: &str,
        document_id: &str,
    ) -> Result<Option<DoseBaseline>, DatabaseError> {
        let Some((prior_id, output_json)) =
            repository::prior_standardization(conn, patient_ref, document_id)?
        else {
            return Ok(None);
        };
        match serde_json::from_str::<StandardizedOutput>(&output_json) {
            Ok(prior) => Ok(Some(DoseBaseline::from_standardized(&prior_id, &prior))),
            Err(e) => {
                // An unreadable old snapshot must not block the current chart.
                warn!(prior_id = %prior_id, error = %e, "skipping unreadable baseline snapshot");
                Ok(None)
            }
        }
    }

    fn persist_and_escalate(
        &self,
        conn: &Connection,
        doc: &Document,
        report: &crate::pipeline::validator::ValidationReport,
    ) -> Result<i64, DatabaseError> {
        let mut critical = 0;
        for draft in &report.flags {
            let flag_id = repository::insert_safety_flag(
                conn,
                &doc.id,
                draft.kind,
                draft.severity,
                &draft.detail,
            )?;
            let flag = SafetyFlag {
                id: flag_id,
                document_id: doc.id.clone(),
                filename: Some(doc.filename.clone()),
                kind: draft.kind,
                severity: draft.severity,
                detail: draft.detail.clone(),
                resolved: false,
                resolved_at: None,
                created_at: now_iso(),
            };
            if self.dispatcher.dispatch(&flag) {
                repository::write_activity(
                    conn,
                    "alert_escalated",
                    &format!("Escalated {} flag #{flag_id}: {}", flag.kind, flag.detail),
                    Some(&doc.id),
                    Some(PipelineStage::Validation.as_str()),
                    "warning",
                )?;
            }
            if draft.severity == Severity::Critical {
                critical += 1;
            }
        }
        if critical > 0 {
            repository::increment_critical_flags(conn, &doc.id, critical)?;
        }
        Ok(report.flags.len() as i64)
    }
}

// ═══════════════════════════════════════════
// Background thread
// ═══════════════════════════════════════════

/// Handle for the agent thread. Supports graceful shutdown via `shutdown()`
/// or automatic cleanup on `Drop`.
pub struct AgentHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AgentHandle {
    /// Request graceful shutdown. The in-flight document (if any) completes,
    /// but no new one is started.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Start the agent on a separate thread. `wake` (shared with the API) cuts
/// the current sleep short so "process now" does not wait out the cadence.
pub fn start_agent(agent: Agent, wake: Arc<AtomicBool>) -> AgentHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    let handle = std::thread::spawn(move || {
        info!(
            poll_interval_secs = agent.settings.poll_interval.as_secs(),
            "agent thread started"
        );
        agent_loop(&agent, &flag, &wake);
        info!("agent thread shutting down");
    });

    AgentHandle {
        shutdown,
        handle: Some(handle),
    }
}

fn agent_loop(agent: &Agent, shutdown: &AtomicBool, wake: &AtomicBool) {
    match db::open_database(&agent.settings.db_path) {
        Ok(conn) => {
            if let Err(e) = agent.recover(&conn) {
                error!(error = %e, "startup recovery failed");
            }
        }
        Err(e) => error!(error = %e, "cannot open database for recovery"),
    }

    while !shutdown.load(Ordering::Relaxed) {
        let processed = match db::open_database(&agent.settings.db_path) {
            Ok(conn) => match agent.tick(&conn) {
                Ok(outcome) => outcome.is_some(),
                Err(e) => {
                    error!(error = %e, "polling cycle failed");
                    false
                }
            },
            Err(e) => {
                error!(error = %e, "cannot open database");
                false
            }
        };

        // Drain the queue before sleeping again.
        if processed {
            continue;
        }

        let ticks = agent.settings.poll_interval.as_secs().max(1);
        for _ in 0..ticks {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            if wake.swap(false, Ordering::Relaxed) {
                break;
            }
            std::thread::sleep(SLEEP_GRANULARITY);
        }
    }
}
