//! Deterministic safety validation — five checks, no I/O, no model calls.
//!
//! Check order is fixed (PII, ICD-10, dose consistency, FHIR schema, drug
//! names) and every applicable flag is emitted; a failing check never
//! short-circuits the ones after it. Severity is fixed per check kind.
//!
//! The dose-consistency check compares against the most recent prior
//! document for the same patient. The caller resolves that baseline from the
//! store and passes it in, so this module stays a pure function of its
//! arguments.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::{FlagKind, Severity};
use crate::pipeline::types::{ChartExtraction, DrugEntry, StandardizedOutput};

/// Canonical WHO INN names the standardization stage must land on.
const STANDARD_DRUG_NAMES: &[&str] = &[
    "daunorubicin",
    "cytarabine",
    "idarubicin",
    "mitoxantrone",
    "etoposide",
    "fludarabine",
    "cladribine",
    "azacitidine",
    "decitabine",
    "gemtuzumab",
    "venetoclax",
];

/// Handwriting misspellings that must not survive standardization.
const KNOWN_MISSPELLINGS: &[&str] = &[
    "cytosare",
    "cytbrar",
    "cytbror",
    "cytarabinr",
    "cytosar-u",
    "dauno",
    "daunorubicn",
    "daunorobicin",
    "daunoribicin",
    "daunorubicine",
];

fn icd10_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z][0-9]{2}(\.[0-9A-Z]{1,4})?$").expect("valid ICD-10 regex")
    })
}

// ═══════════════════════════════════════════
// Report types
// ═══════════════════════════════════════════

/// Per-drug mg doses from the newest prior completed document for the same
/// patient. Keys are lowercased canonical drug names.
#[derive(Debug, Clone, Default)]
pub struct DoseBaseline {
    pub source_document_id: String,
    pub doses: BTreeMap<String, f64>,
}

impl DoseBaseline {
    /// Build a baseline from a prior document's standardized output, keeping
    /// the first reading per drug.
    pub fn from_standardized(document_id: &str, prior: &StandardizedOutput) -> Self {
        let mut doses = BTreeMap::new();
        for drug in &prior.standardized_drugs {
            let name = drug.drug_standard.trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            if let Some(mg) = drug.dose_mg {
                doses.entry(name).or_insert(mg);
            }
        }
        Self {
            source_document_id: document_id.to_string(),
            doses,
        }
    }
}

/// Outcome of one check: pass/fail plus the flags it raised.
///
/// Serialize-only: reports are snapshotted as JSON and read back as untyped
/// values, and the static check names cannot be borrowed out of a document.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub kind: FlagKind,
    pub passed: bool,
    pub detail: String,
}

/// A flag to be persisted for a failed check condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDraft {
    pub kind: FlagKind,
    pub severity: Severity,
    pub detail: String,
}

/// Full validation report: the five check results in evaluation order, plus
/// every flag raised. Snapshotted as the validating stage's pipeline result.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub flags: Vec<FlagDraft>,
    pub passed_count: usize,
    pub total_count: usize,
}

impl ValidationReport {
    pub fn overall_passed(&self) -> bool {
        self.passed_count == self.total_count
    }
}

/// Severity is a property of the check, never of how often it fired.
pub fn severity_for(kind: FlagKind) -> Severity {
    match kind {
        FlagKind::PiiLeak => Severity::Critical,
        FlagKind::CodingError => Severity::Warning,
        FlagKind::DoseVariance => Severity::Critical,
        FlagKind::SchemaError => Severity::Critical,
        FlagKind::AmbiguousName => Severity::Warning,
    }
}

// ═══════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════

/// Run all five safety checks in fixed order.
pub fn run_validation(
    extraction: &ChartExtraction,
    standardized: &StandardizedOutput,
    bundle: &serde_json::Value,
    baseline: Option<&DoseBaseline>,
    variance_threshold: f64,
) -> ValidationReport {
    let mut checks = Vec::with_capacity(5);
    let mut flags = Vec::new();

    for check in [
        check_pii(extraction, bundle),
        check_icd10(standardized),
        check_dose_consistency(extraction, standardized, baseline, variance_threshold),
        check_fhir_schema(bundle),
        check_drug_standardization(standardized),
    ] {
        flags.extend(check.flags.clone());
        checks.push(check.result);
    }

    let passed_count = checks.iter().filter(|c| c.passed).count();
    let total_count = checks.len();
    ValidationReport {
        checks,
        flags,
        passed_count,
        total_count,
    }
}

struct Check {
    result: CheckResult,
    flags: Vec<FlagDraft>,
}

fn check(
    name: &'static str,
    kind: FlagKind,
    violations: Vec<String>,
    pass_detail: String,
) -> Check {
    if violations.is_empty() {
        Check {
            result: CheckResult {
                name,
                kind,
                passed: true,
                detail: pass_detail,
            },
            flags: Vec::new(),
        }
    } else {
        let severity = severity_for(kind);
        Check {
            result: CheckResult {
                name,
                kind,
                passed: false,
                detail: violations.join("; "),
            },
            flags: violations
                .into_iter()
                .map(|detail| FlagDraft {
                    kind,
                    severity,
                    detail,
                })
                .collect(),
        }
    }
}

// ═══════════════════════════════════════════
// Check 1: PII leakage
// ═══════════════════════════════════════════

/// Residual identifying patterns in the de-identified bundle: any part of the
/// raw patient name, or the raw registration number (MRN). Each match is a
/// leak. A bundle without a hashed patient id fails too — absence of the
/// pseudonym means de-identification never ran.
fn check_pii(extraction: &ChartExtraction, bundle: &serde_json::Value) -> Check {
    let bundle_text = bundle.to_string().to_lowercase();
    let mut violations = Vec::new();

    if !bundle_text.contains("pat-") {
        violations.push("No de-identified patient id in bundle output".to_string());
    }

    if let Some(name_raw) = &extraction.patient.name_raw {
        let name = name_raw.trim().to_lowercase();
        if name.len() > 3 {
            for part in name.split_whitespace() {
                if part.len() > 3 && bundle_text.contains(part) {
                    violations.push(format!(
                        "Patient name fragment '{part}' present in bundle output"
                    ));
                }
            }
        }
    }

    if let Some(reg) = &extraction.patient.registration_number {
        let reg = reg.trim().to_lowercase();
        if reg.len() > 3 && bundle_text.contains(&reg) {
            violations.push(format!(
                "Registration number '{reg}' present in bundle output"
            ));
        }
    }

    check(
        "PII De-identification",
        FlagKind::PiiLeak,
        violations,
        "No identifying patterns found in bundle output".to_string(),
    )
}

// ═══════════════════════════════════════════
// Check 2: ICD-10 validity
// ═══════════════════════════════════════════

fn check_icd10(standardized: &StandardizedOutput) -> Check {
    let mut violations = Vec::new();
    let pass_detail;

    match standardized.icd10.code.as_deref() {
        None | Some("") => {
            violations.push("No ICD-10 code in standardized output".to_string());
            pass_detail = String::new();
        }
        Some(code) => {
            if icd10_pattern().is_match(code) {
                pass_detail = format!(
                    "Code '{code}' is valid — {}",
                    standardized.icd10.description.as_deref().unwrap_or("")
                );
            } else {
                violations.push(format!(
                    "Code '{code}' does not match ICD-10 pattern [A-Z][0-9]{{2}}(.subcode)"
                ));
                pass_detail = String::new();
            }
        }
    }

    check("ICD-10 Code Validity", FlagKind::CodingError, violations, pass_detail)
}

// ═══════════════════════════════════════════
// Check 3: Dose consistency
// ═══════════════════════════════════════════

/// Extract a numeric mg value from a drug entry. Tries the numeric field
/// first, then parses the handwritten string ("90mg" → 90.0).
fn parse_dose_mg(drug: &DrugEntry) -> Option<f64> {
    if let Some(value) = drug.dose_value {
        return Some(value);
    }
    let raw = drug.dose_raw.as_deref()?.trim().replace(',', ".");
    let numeric: String = raw
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric.parse().ok()
}

/// Per-drug dose readings for the current document, in reading order.
/// Prefers the standardized list; falls back to raw cycle entries when the
/// standardization produced no numeric doses.
fn collect_doses(
    extraction: &ChartExtraction,
    standardized: &StandardizedOutput,
) -> BTreeMap<String, Vec<(String, f64)>> {
    let mut doses: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();

    for drug in &standardized.standardized_drugs {
        let name = drug.drug_standard.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        if let Some(mg) = drug.dose_mg {
            let cycle = drug.cycle_id.clone().unwrap_or_else(|| "?".to_string());
            doses.entry(name).or_default().push((cycle, mg));
        }
    }
    if !doses.is_empty() {
        return doses;
    }

    for cycle in &extraction.cycles {
        let cycle_id = cycle.cycle_id.clone().unwrap_or_else(|| "?".to_string());
        for drug in &cycle.drugs {
            let Some(mg) = parse_dose_mg(drug) else { continue };
            let name = drug
                .name_raw
                .as_deref()
                .unwrap_or("unknown")
                .trim()
                .to_lowercase();
            doses.entry(name).or_default().push((cycle_id.clone(), mg));
        }
    }
    doses
}

fn variance_detail(
    drug: &str,
    old_label: &str,
    old_mg: f64,
    new_label: &str,
    new_mg: f64,
    pct: f64,
) -> String {
    let mut name = drug.to_string();
    if let Some(first) = name.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!(
        "{name}: {old_label} {old_mg:.0}mg -> {new_label} {new_mg:.0}mg ({pct:.1}% variance — verify intent)"
    )
}

/// Compares each drug's doses against the prior-document baseline (when one
/// exists) and against the first reading within the current chart. Relative
/// variance at or above the threshold is a critical anomaly. No prior
/// document and a single reading per drug means nothing to compare — no flag.
fn check_dose_consistency(
    extraction: &ChartExtraction,
    standardized: &StandardizedOutput,
    baseline: Option<&DoseBaseline>,
    threshold: f64,
) -> Check {
    let current = collect_doses(extraction, standardized);
    let mut violations = Vec::new();

    for (drug, readings) in &current {
        // Cross-revision comparison: newest prior document for this patient.
        if let Some(baseline) = baseline {
            if let Some(&old_mg) = baseline.doses.get(drug) {
                if old_mg > 0.0 {
                    for (cycle, new_mg) in readings {
                        let pct = (new_mg - old_mg).abs() / old_mg;
                        if pct >= threshold {
                            violations.push(variance_detail(
                                drug, "prior", old_mg, cycle, *new_mg, pct * 100.0,
                            ));
                        }
                    }
                }
            }
        }

        // Within-chart comparison: first reading is the baseline.
        if readings.len() >= 2 {
            let (first_cycle, first_mg) = &readings[0];
            if *first_mg > 0.0 {
                for (cycle, mg) in &readings[1..] {
                    let pct = (mg - first_mg).abs() / first_mg;
                    if pct >= threshold {
                        violations.push(variance_detail(
                            drug, first_cycle, *first_mg, cycle, *mg, pct * 100.0,
                        ));
                    }
                }
            }
        }
    }

    let pass_detail = if current.is_empty() {
        "No numeric dose data to compare".to_string()
    } else {
        format!(
            "All doses within {:.0}% across {}",
            threshold * 100.0,
            current.keys().cloned().collect::<Vec<_>>().join(", ")
        )
    };

    check("Dose Consistency", FlagKind::DoseVariance, violations, pass_detail)
}

// ═══════════════════════════════════════════
// Check 4: FHIR schema
// ═══════════════════════════════════════════

fn check_fhir_schema(bundle: &serde_json::Value) -> Check {
    let mut issues = Vec::new();

    if bundle.get("resourceType").and_then(|v| v.as_str()) != Some("Bundle") {
        issues.push("resourceType is not 'Bundle'".to_string());
    }

    let entries = bundle
        .get("entry")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if entries.is_empty() {
        issues.push("Bundle has no entries".to_string());
    } else {
        let resources: Vec<&serde_json::Value> = entries
            .iter()
            .filter_map(|e| e.get("resource"))
            .collect();
        let type_of = |r: &serde_json::Value| {
            r.get("resourceType")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };

        if !resources.iter().any(|r| type_of(r) == "Patient") {
            issues.push("No Patient resource in bundle".to_string());
        }
        if !resources
            .iter()
            .any(|r| matches!(type_of(r).as_str(), "MedicationAdministration" | "MedicationRequest"))
        {
            issues.push("No Medication resource in bundle".to_string());
        }

        for resource in &resources {
            let rt = type_of(resource);
            let has_id = resource
                .get("id")
                .and_then(|v| v.as_str())
                .is_some_and(|s| !s.is_empty());
            match rt.as_str() {
                "Patient" if !has_id => {
                    issues.push("Patient resource missing 'id'".to_string());
                }
                "MedicationAdministration" | "MedicationRequest" => {
                    if !has_id {
                        issues.push(format!("{rt} missing 'id'"));
                    }
                    if resource.get("status").and_then(|v| v.as_str()).is_none() {
                        issues.push(format!("{rt} missing 'status'"));
                    }
                }
                _ => {}
            }
        }
    }

    // Structural violations corrupt downstream consumers, so they collapse
    // into a single flag describing everything wrong at once.
    let violations = if issues.is_empty() {
        Vec::new()
    } else {
        vec![issues.join("; ")]
    };

    check(
        "FHIR R4 Schema",
        FlagKind::SchemaError,
        violations,
        format!("Valid Bundle with {} resources", entries.len()),
    )
}

// ═══════════════════════════════════════════
// Check 5: Drug-name standardization
// ═══════════════════════════════════════════

fn check_drug_standardization(standardized: &StandardizedOutput) -> Check {
    let mut violations = Vec::new();

    if standardized.standardized_drugs.is_empty() {
        violations.push("No standardized drug entries found".to_string());
    }

    for entry in &standardized.standardized_drugs {
        let name = entry.drug_standard.trim().to_lowercase();
        let cycle = entry.cycle_id.as_deref().unwrap_or("?");
        if name.is_empty() {
            violations.push(format!("Empty drug name in {cycle}"));
        } else if KNOWN_MISSPELLINGS.contains(&name.as_str()) {
            violations.push(format!("Misspelling persists: '{name}' in {cycle}"));
        } else if !STANDARD_DRUG_NAMES.contains(&name.as_str()) {
            violations.push(format!("Unrecognized drug name: '{name}' in {cycle}"));
        }
    }

    check(
        "Drug Name Standardization",
        FlagKind::AmbiguousName,
        violations,
        format!(
            "All {} drug entries use canonical WHO INN names",
            standardized.standardized_drugs.len()
        ),
    )
}

// ═══════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fhir::build_bundle;
    use crate::pipeline::types::*;

    const THRESHOLD: f64 = 0.10;

    fn extraction_with_patient() -> ChartExtraction {
        ChartExtraction {
            patient: PatientFields {
                name_raw: Some("Muzaffar Ahmed".into()),
                age: Some(54),
                sex: Some("M".into()),
                registration_number: Some("2408022051".into()),
                confidence: Some(0.9),
            },
            diagnosis: DiagnosisFields {
                text_raw: Some("AML".into()),
                confidence: Some(0.92),
            },
            overall_confidence: 0.9,
            ..Default::default()
        }
    }

    fn standardized(doses: &[(&str, f64)]) -> StandardizedOutput {
        StandardizedOutput {
            icd10: Icd10Coding {
                code: Some("C92.00".into()),
                description: Some("Acute myeloblastic leukemia".into()),
            },
            standardized_drugs: doses
                .iter()
                .enumerate()
                .map(|(i, (name, mg))| StandardizedDrug {
                    drug_standard: (*name).into(),
                    drug_raw: Some((*name).into()),
                    dose_mg: Some(*mg),
                    route: Some("IV".into()),
                    cycle_id: Some(format!("C1D{}", i + 1)),
                    date: None,
                    name_was_corrected: false,
                })
                .collect(),
            notes: None,
        }
    }

    fn validate(
        extraction: &ChartExtraction,
        std_out: &StandardizedOutput,
        baseline: Option<&DoseBaseline>,
    ) -> ValidationReport {
        let bundle = build_bundle(extraction, std_out);
        run_validation(extraction, std_out, &bundle, baseline, THRESHOLD)
    }

    fn baseline_of(doses: &[(&str, f64)]) -> DoseBaseline {
        DoseBaseline::from_standardized("prior-doc", &standardized(doses))
    }

    fn dose_flags(report: &ValidationReport) -> Vec<&FlagDraft> {
        report
            .flags
            .iter()
            .filter(|f| f.kind == FlagKind::DoseVariance)
            .collect()
    }

    #[test]
    fn clean_document_raises_no_flags() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let report = validate(&extraction, &std_out, None);
        assert!(report.overall_passed(), "flags: {:?}", report.flags);
        assert!(report.flags.is_empty());
        assert_eq!(report.total_count, 5);
    }

    #[test]
    fn checks_run_in_fixed_order() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let report = validate(&extraction, &std_out, None);
        let kinds: Vec<FlagKind> = report.checks.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FlagKind::PiiLeak,
                FlagKind::CodingError,
                FlagKind::DoseVariance,
                FlagKind::SchemaError,
                FlagKind::AmbiguousName,
            ]
        );
    }

    #[test]
    fn report_serializes_for_stage_snapshot() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let report = validate(&extraction, &std_out, None);

        let snapshot = serde_json::to_value(&report).unwrap();
        assert_eq!(snapshot["checks"][0]["name"], "PII De-identification");
        assert_eq!(snapshot["passed_count"], 5);
        assert_eq!(snapshot["total_count"], 5);
        assert!(snapshot["flags"].as_array().unwrap().is_empty());
    }

    #[test]
    fn dose_drop_90_to_80_across_revisions_is_critical() {
        // (90-80)/90 = 11.1% >= 10%
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 80.0)]);
        let baseline = baseline_of(&[("Daunorubicin", 90.0)]);
        let report = validate(&extraction, &std_out, Some(&baseline));

        let flags = dose_flags(&report);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].severity, Severity::Critical);
        assert!(flags[0].detail.contains("11.1%"), "{}", flags[0].detail);
    }

    #[test]
    fn dose_drift_90_to_88_is_within_tolerance() {
        // (90-88)/90 = 2.2% < 10%
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 88.0)]);
        let baseline = baseline_of(&[("Daunorubicin", 90.0)]);
        let report = validate(&extraction, &std_out, Some(&baseline));
        assert!(dose_flags(&report).is_empty());
    }

    #[test]
    fn no_prior_document_means_no_dose_flag() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 80.0)]);
        let report = validate(&extraction, &std_out, None);
        assert!(dose_flags(&report).is_empty());
    }

    #[test]
    fn within_chart_drop_is_flagged() {
        // C1D1 90mg, C1D2 80mg on the same chart
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0), ("Daunorubicin", 80.0)]);
        let report = validate(&extraction, &std_out, None);
        let flags = dose_flags(&report);
        assert_eq!(flags.len(), 1);
        assert!(flags[0].detail.contains("C1D1"));
        assert!(flags[0].detail.contains("C1D2"));
    }

    #[test]
    fn dose_check_falls_back_to_raw_cycle_entries() {
        let mut extraction = extraction_with_patient();
        extraction.cycles = vec![
            CycleEntry {
                cycle_id: Some("C1D1".into()),
                drugs: vec![DrugEntry {
                    name_raw: Some("Daunorubicin".into()),
                    dose_raw: Some("90mg".into()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            CycleEntry {
                cycle_id: Some("C1D2".into()),
                drugs: vec![DrugEntry {
                    name_raw: Some("Daunorubicin".into()),
                    dose_raw: Some("80mg".into()),
                    ..Default::default()
                }],
                ..Default::default()
            },
        ];
        // Standardization produced no numeric doses
        let mut std_out = standardized(&[]);
        std_out.standardized_drugs.clear();
        let bundle = build_bundle(&extraction, &standardized(&[("Daunorubicin", 90.0)]));
        let report = run_validation(&extraction, &std_out, &bundle, None, THRESHOLD);
        assert_eq!(dose_flags(&report).len(), 1);
    }

    #[test]
    fn pii_leak_in_bundle_is_critical() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let mut bundle = build_bundle(&extraction, &std_out);
        bundle["entry"][0]["resource"]["note"] =
            serde_json::json!("Patient Muzaffar Ahmed, bed 12");

        let report = run_validation(&extraction, &std_out, &bundle, None, THRESHOLD);
        let pii: Vec<_> = report
            .flags
            .iter()
            .filter(|f| f.kind == FlagKind::PiiLeak)
            .collect();
        assert_eq!(pii.len(), 2, "both name fragments leak");
        assert!(pii.iter().all(|f| f.severity == Severity::Critical));
    }

    #[test]
    fn missing_pseudonym_is_a_pii_failure() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let bundle = serde_json::json!({"resourceType": "Bundle", "entry": []});
        let report = run_validation(&extraction, &std_out, &bundle, None, THRESHOLD);
        assert!(report
            .flags
            .iter()
            .any(|f| f.kind == FlagKind::PiiLeak && f.detail.contains("de-identified")));
    }

    #[test]
    fn registration_number_leak_is_flagged() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let mut bundle = build_bundle(&extraction, &std_out);
        bundle["entry"][0]["resource"]["note"] = serde_json::json!("reg 2408022051");

        let report = run_validation(&extraction, &std_out, &bundle, None, THRESHOLD);
        assert!(report
            .flags
            .iter()
            .any(|f| f.kind == FlagKind::PiiLeak && f.detail.contains("2408022051")));
    }

    #[test]
    fn invalid_icd10_code_is_warning() {
        let extraction = extraction_with_patient();
        let mut std_out = standardized(&[("Daunorubicin", 90.0)]);
        std_out.icd10.code = Some("92C.00".into());
        let report = validate(&extraction, &std_out, None);
        let coding: Vec<_> = report
            .flags
            .iter()
            .filter(|f| f.kind == FlagKind::CodingError)
            .collect();
        assert_eq!(coding.len(), 1);
        assert_eq!(coding[0].severity, Severity::Warning);
    }

    #[test]
    fn icd10_accepts_subcoded_forms() {
        for code in ["C92.00", "C92", "J45.909", "A00"] {
            assert!(icd10_pattern().is_match(code), "{code} should be valid");
        }
        for code in ["c92.00", "C9", "C92.", "C92.00000", ""] {
            assert!(!icd10_pattern().is_match(code), "{code} should be invalid");
        }
    }

    #[test]
    fn broken_bundle_is_single_schema_flag() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Daunorubicin", 90.0)]);
        let bundle = serde_json::json!({"resourceType": "Observation", "entry": []});
        let report = run_validation(&extraction, &std_out, &bundle, None, THRESHOLD);
        let schema: Vec<_> = report
            .flags
            .iter()
            .filter(|f| f.kind == FlagKind::SchemaError)
            .collect();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema[0].severity, Severity::Critical);
        assert!(schema[0].detail.contains("resourceType"));
        assert!(schema[0].detail.contains("no entries"));
    }

    #[test]
    fn surviving_misspelling_is_flagged_per_entry() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Dauno", 90.0), ("Cytosare", 100.0)]);
        let report = validate(&extraction, &std_out, None);
        let names: Vec<_> = report
            .flags
            .iter()
            .filter(|f| f.kind == FlagKind::AmbiguousName)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|f| f.severity == Severity::Warning));
    }

    #[test]
    fn unrecognized_name_is_flagged() {
        let extraction = extraction_with_patient();
        let std_out = standardized(&[("Notadrugatol", 90.0)]);
        let report = validate(&extraction, &std_out, None);
        assert!(report
            .flags
            .iter()
            .any(|f| f.kind == FlagKind::AmbiguousName && f.detail.contains("notadrugatol")));
    }

    #[test]
    fn failing_check_does_not_short_circuit_later_checks() {
        let extraction = extraction_with_patient();
        let mut std_out = standardized(&[("Dauno", 80.0)]);
        std_out.icd10.code = Some("bogus".into());
        let baseline = baseline_of(&[("Dauno", 90.0)]);
        let report = validate(&extraction, &std_out, Some(&baseline));

        // Checks 2, 3 and 5 all fired despite each other
        assert!(report.flags.iter().any(|f| f.kind == FlagKind::CodingError));
        assert!(report.flags.iter().any(|f| f.kind == FlagKind::DoseVariance));
        assert!(report.flags.iter().any(|f| f.kind == FlagKind::AmbiguousName));
        assert_eq!(report.passed_count, 2);
    }

    #[test]
    fn parse_dose_handles_raw_strings() {
        let entry = DrugEntry {
            dose_raw: Some("90mg".into()),
            ..Default::default()
        };
        assert_eq!(parse_dose_mg(&entry), Some(90.0));

        let entry = DrugEntry {
            dose_raw: Some("12,5 mg".into()),
            ..Default::default()
        };
        assert_eq!(parse_dose_mg(&entry), Some(12.5));

        let entry = DrugEntry {
            dose_raw: Some("illegible".into()),
            ..Default::default()
        };
        assert_eq!(parse_dose_mg(&entry), None);
    }
}
