//! Structured clinical data shapes flowing between pipeline stages.
//!
//! The extraction service returns a `ChartExtraction`; the standardization
//! service turns it into a `StandardizedOutput`; the bundle builder and the
//! safety validator consume both. All shapes are plain serde types so stage
//! snapshots round-trip through the store as JSON blobs.

use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════
// Vision extraction output
// ═══════════════════════════════════════════

/// Raw structured extraction from a scanned chart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartExtraction {
    #[serde(default)]
    pub patient: PatientFields,
    #[serde(default)]
    pub hospital: HospitalFields,
    #[serde(default)]
    pub diagnosis: DiagnosisFields,
    #[serde(default)]
    pub regimen: RegimenFields,
    #[serde(default)]
    pub cycles: Vec<CycleEntry>,
    /// Free-text notes on anything ambiguous, crossed out, or notable.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub overall_confidence: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatientFields {
    /// Exact name as written on the chart. Must never reach the bundle.
    #[serde(default)]
    pub name_raw: Option<String>,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub sex: Option<String>,
    #[serde(default)]
    pub registration_number: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HospitalFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosisFields {
    #[serde(default)]
    pub text_raw: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegimenFields {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// One treatment cycle row (e.g. C1D1) with its administered drugs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleEntry {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub cycle_id: Option<String>,
    #[serde(default)]
    pub drugs: Vec<DrugEntry>,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(default)]
    pub has_correction: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrugEntry {
    /// Drug name exactly as written (may be a misspelling).
    #[serde(default)]
    pub name_raw: Option<String>,
    /// Dose exactly as written, e.g. "90mg".
    #[serde(default)]
    pub dose_raw: Option<String>,
    #[serde(default)]
    pub dose_value: Option<f64>,
    #[serde(default)]
    pub dose_unit: Option<String>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub ambiguous: bool,
}

// ═══════════════════════════════════════════
// Standardization output
// ═══════════════════════════════════════════

/// Normalized, coded output from the standardization service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardizedOutput {
    #[serde(default)]
    pub icd10: Icd10Coding,
    #[serde(default)]
    pub standardized_drugs: Vec<StandardizedDrug>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Icd10Coding {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One drug administration, normalized to a canonical name and mg dose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StandardizedDrug {
    /// Canonical WHO INN name, e.g. "Daunorubicin".
    #[serde(default)]
    pub drug_standard: String,
    /// The handwritten form this was normalized from.
    #[serde(default)]
    pub drug_raw: Option<String>,
    #[serde(default)]
    pub dose_mg: Option<f64>,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub cycle_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub name_was_corrected: bool,
}

/// Adapter response wrapper: structured output plus call metadata.
#[derive(Debug, Clone)]
pub struct AdapterResponse<T> {
    pub output: T,
    pub latency_ms: u64,
    /// Overall confidence reported by the service, when available.
    pub confidence: Option<f64>,
}
