//! FHIR R4 bundle assembly from extraction + standardization output.
//!
//! The bundle is de-identified at construction: the patient is keyed by a
//! SHA-256 derived pseudonym and neither the raw name nor the raw
//! registration number is ever written into it. The PII check downstream
//! verifies that property rather than trusting it.
//!
//! Resources: Bundle (collection), Patient, Condition (ICD-10 coded), and one
//! MedicationAdministration per drug per cycle.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::now_iso;
use crate::pipeline::types::{ChartExtraction, StandardizedOutput};

/// Deterministic pseudonym for a patient: "PAT-" plus the first 12 hex
/// characters of sha256("name::registration"), lowercased input, uppercased
/// digest. Same patient, same id, across every document.
pub fn hash_patient_id(name_raw: &str, registration_number: &str) -> String {
    let seed = format!(
        "{}::{}",
        name_raw.trim().to_lowercase(),
        registration_number.trim().to_lowercase()
    );
    let digest = Sha256::digest(seed.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("PAT-{}", hex[..12].to_uppercase())
}

/// Build the de-identified FHIR R4 bundle.
pub fn build_bundle(
    extraction: &ChartExtraction,
    standardized: &StandardizedOutput,
) -> serde_json::Value {
    let name_raw = extraction.patient.name_raw.as_deref().unwrap_or("UNKNOWN");
    let reg_number = extraction
        .patient
        .registration_number
        .as_deref()
        .unwrap_or("UNKNOWN");
    let patient_id = hash_patient_id(name_raw, reg_number);
    let now = now_iso();

    let patient = build_patient(&patient_id, extraction.patient.age, extraction.patient.sex.as_deref());

    let condition_id = format!("condition-{}", short_uuid());
    let condition = build_condition(
        &condition_id,
        &patient_id,
        standardized.icd10.code.as_deref().unwrap_or("UNKNOWN"),
        standardized.icd10.description.as_deref().unwrap_or(""),
        extraction.diagnosis.text_raw.as_deref().unwrap_or(""),
    );

    let mut entries = vec![
        serde_json::json!({"fullUrl": format!("urn:uuid:{patient_id}"), "resource": patient}),
        serde_json::json!({"fullUrl": format!("urn:uuid:{condition_id}"), "resource": condition}),
    ];
    for drug in &standardized.standardized_drugs {
        let med_id = format!("medadmin-{}", short_uuid());
        let resource = build_medication_administration(&med_id, &patient_id, &condition_id, drug);
        entries.push(serde_json::json!({
            "fullUrl": format!("urn:uuid:{med_id}"),
            "resource": resource,
        }));
    }

    serde_json::json!({
        "resourceType": "Bundle",
        "id": Uuid::new_v4().to_string(),
        "meta": {
            "lastUpdated": now,
            "tag": [{
                "system": "http://biovault.io/tags",
                "code": "ai-generated",
                "display": "AI-extracted from handwritten chart",
            }],
        },
        "type": "collection",
        "timestamp": now,
        "entry": entries,
        "extension": [{
            "url": "http://biovault.io/fhir/StructureDefinition/extraction-metadata",
            "extension": [
                {"url": "sourceDocument", "valueString": "handwritten-chemotherapy-chart"},
                {"url": "hospital", "valueString": extraction.hospital.name.as_deref().unwrap_or("")},
                {"url": "unit", "valueString": extraction.hospital.unit.as_deref().unwrap_or("")},
                {"url": "regimen", "valueString": extraction.regimen.name.as_deref().unwrap_or("")},
                {"url": "overallConfidence", "valueDecimal": extraction.overall_confidence},
            ],
        }],
    })
}

fn short_uuid() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

fn build_patient(patient_id: &str, age: Option<u32>, sex: Option<&str>) -> serde_json::Value {
    let gender = match sex.map(|s| s.trim().to_uppercase()) {
        Some(s) if s == "M" => "male",
        Some(s) if s == "F" => "female",
        _ => "unknown",
    };

    let mut resource = serde_json::json!({
        "resourceType": "Patient",
        "id": patient_id,
        "meta": {
            "profile": ["http://hl7.org/fhir/StructureDefinition/Patient"],
            "security": [{
                "system": "http://terminology.hl7.org/CodeSystem/v3-Confidentiality",
                "code": "R",
                "display": "Restricted",
            }],
        },
        "text": {
            "status": "generated",
            "div": format!(
                "<div xmlns=\"http://www.w3.org/1999/xhtml\">De-identified Patient: {patient_id}</div>"
            ),
        },
        "identifier": [{
            "use": "official",
            "system": "http://biovault.io/patient-id",
            "value": patient_id,
        }],
        "active": true,
        "gender": gender,
        "extension": [],
    });

    if let Some(age) = age {
        resource["extension"]
            .as_array_mut()
            .expect("extension is an array")
            .push(serde_json::json!({
                "url": "http://hl7.org/fhir/StructureDefinition/patient-age",
                "valueAge": {
                    "value": age,
                    "unit": "years",
                    "system": "http://unitsofmeasure.org",
                    "code": "a",
                },
            }));
    }
    resource
}

fn build_condition(
    condition_id: &str,
    patient_id: &str,
    icd10_code: &str,
    icd10_description: &str,
    diagnosis_raw: &str,
) -> serde_json::Value {
    serde_json::json!({
        "resourceType": "Condition",
        "id": condition_id,
        "meta": {"profile": ["http://hl7.org/fhir/StructureDefinition/Condition"]},
        "clinicalStatus": {
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/condition-clinical",
                "code": "active",
                "display": "Active",
            }],
        },
        "verificationStatus": {
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/condition-ver-status",
                "code": "confirmed",
                "display": "Confirmed",
            }],
        },
        "category": [{
            "coding": [{
                "system": "http://terminology.hl7.org/CodeSystem/condition-category",
                "code": "encounter-diagnosis",
                "display": "Encounter Diagnosis",
            }],
        }],
        "code": {
            "coding": [{
                "system": "http://hl7.org/fhir/sid/icd-10-cm",
                "code": icd10_code,
                "display": icd10_description,
            }],
            "text": diagnosis_raw,
        },
        "subject": {"reference": format!("Patient/{patient_id}")},
        "recordedDate": now_iso(),
    })
}

fn build_medication_administration(
    med_id: &str,
    patient_id: &str,
    condition_id: &str,
    drug: &crate::pipeline::types::StandardizedDrug,
) -> serde_json::Value {
    let route_coding = match drug
        .route
        .as_deref()
        .map(|r| r.trim().to_uppercase())
        .as_deref()
    {
        Some("PO") => serde_json::json!({
            "system": "http://snomed.info/sct",
            "code": "26643006",
            "display": "Oral route",
        }),
        Some("IM") => serde_json::json!({
            "system": "http://snomed.info/sct",
            "code": "78421000",
            "display": "Intramuscular route",
        }),
        _ => serde_json::json!({
            "system": "http://snomed.info/sct",
            "code": "47625008",
            "display": "Intravenous route",
        }),
    };

    let cycle_id = drug.cycle_id.as_deref().unwrap_or("");
    let mut resource = serde_json::json!({
        "resourceType": "MedicationAdministration",
        "id": med_id,
        "meta": {"profile": ["http://hl7.org/fhir/StructureDefinition/MedicationAdministration"]},
        "status": "completed",
        "medicationCodeableConcept": {
            "coding": [{
                "system": "http://www.nlm.nih.gov/research/umls/rxnorm",
                "display": drug.drug_standard,
            }],
            "text": drug.drug_standard,
        },
        "subject": {"reference": format!("Patient/{patient_id}")},
        "context": {"reference": format!("Condition/{condition_id}")},
        "effectiveDateTime": drug.date.clone().unwrap_or_else(now_iso),
        "note": [
            {"text": format!("Cycle: {cycle_id}")},
            {"text": format!("Handwritten name: '{}'", drug.drug_raw.as_deref().unwrap_or(""))},
        ],
        "dosage": {"route": route_coding},
        "extension": [
            {
                "url": "http://biovault.io/fhir/StructureDefinition/cycle-id",
                "valueString": cycle_id,
            },
            {
                "url": "http://biovault.io/fhir/StructureDefinition/drug-name-corrected",
                "valueBoolean": drug.name_was_corrected,
            },
        ],
    });

    if let Some(mg) = drug.dose_mg {
        resource["dosage"]["dose"] = serde_json::json!({
            "value": mg,
            "unit": "mg",
            "system": "http://unitsofmeasure.org",
            "code": "mg",
        });
    }
    resource
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::*;

    fn sample_extraction() -> ChartExtraction {
        ChartExtraction {
            patient: PatientFields {
                name_raw: Some("Muzaffar Ahmed".into()),
                age: Some(54),
                sex: Some("M".into()),
                registration_number: Some("2408022051".into()),
                confidence: Some(0.9),
            },
            hospital: HospitalFields {
                name: Some("Delta Hospital".into()),
                unit: Some("Oncology".into()),
            },
            diagnosis: DiagnosisFields {
                text_raw: Some("AML".into()),
                confidence: Some(0.92),
            },
            overall_confidence: 0.88,
            ..Default::default()
        }
    }

    fn sample_standardized() -> StandardizedOutput {
        StandardizedOutput {
            icd10: Icd10Coding {
                code: Some("C92.00".into()),
                description: Some("Acute myeloblastic leukemia".into()),
            },
            standardized_drugs: vec![
                StandardizedDrug {
                    drug_standard: "Daunorubicin".into(),
                    drug_raw: Some("Dauno".into()),
                    dose_mg: Some(90.0),
                    route: Some("IV".into()),
                    cycle_id: Some("C1D1".into()),
                    date: Some("2024-03-07".into()),
                    name_was_corrected: true,
                },
                StandardizedDrug {
                    drug_standard: "Cytarabine".into(),
                    drug_raw: Some("Cytosar-U".into()),
                    dose_mg: Some(100.0),
                    route: Some("IV".into()),
                    cycle_id: Some("C1D1".into()),
                    date: Some("2024-03-07".into()),
                    name_was_corrected: true,
                },
            ],
            notes: None,
        }
    }

    #[test]
    fn patient_id_is_deterministic_and_case_insensitive() {
        let a = hash_patient_id("Muzaffar Ahmed", "2408022051");
        let b = hash_patient_id("muzaffar ahmed", "2408022051");
        assert_eq!(a, b);
        assert!(a.starts_with("PAT-"));
        assert_eq!(a.len(), 16);
        assert!(a[4..].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn different_patients_get_different_ids() {
        assert_ne!(
            hash_patient_id("Muzaffar Ahmed", "2408022051"),
            hash_patient_id("Muzaffar Ahmed", "2408022052")
        );
    }

    #[test]
    fn bundle_has_patient_condition_and_one_medadmin_per_drug() {
        let bundle = build_bundle(&sample_extraction(), &sample_standardized());
        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "collection");

        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0]["resource"]["resourceType"], "Patient");
        assert_eq!(entries[1]["resource"]["resourceType"], "Condition");
        assert_eq!(entries[2]["resource"]["resourceType"], "MedicationAdministration");
        assert_eq!(entries[3]["resource"]["resourceType"], "MedicationAdministration");
    }

    #[test]
    fn bundle_contains_no_raw_identifiers() {
        let bundle = build_bundle(&sample_extraction(), &sample_standardized());
        let text = bundle.to_string().to_lowercase();
        assert!(!text.contains("muzaffar"));
        assert!(!text.contains("ahmed"));
        assert!(!text.contains("2408022051"));
    }

    #[test]
    fn condition_carries_icd10_coding() {
        let bundle = build_bundle(&sample_extraction(), &sample_standardized());
        let condition = &bundle["entry"][1]["resource"];
        assert_eq!(condition["code"]["coding"][0]["code"], "C92.00");
        assert_eq!(
            condition["code"]["coding"][0]["system"],
            "http://hl7.org/fhir/sid/icd-10-cm"
        );
        assert_eq!(condition["code"]["text"], "AML");
    }

    #[test]
    fn medication_resources_reference_patient_and_condition() {
        let bundle = build_bundle(&sample_extraction(), &sample_standardized());
        let patient_id = bundle["entry"][0]["resource"]["id"].as_str().unwrap();
        let condition_id = bundle["entry"][1]["resource"]["id"].as_str().unwrap();
        let med = &bundle["entry"][2]["resource"];

        assert_eq!(
            med["subject"]["reference"],
            format!("Patient/{patient_id}")
        );
        assert_eq!(
            med["context"]["reference"],
            format!("Condition/{condition_id}")
        );
        assert_eq!(med["status"], "completed");
        assert_eq!(med["dosage"]["dose"]["value"], 90.0);
        assert_eq!(med["dosage"]["route"]["code"], "47625008");
    }

    #[test]
    fn oral_route_maps_to_snomed_po() {
        let mut standardized = sample_standardized();
        standardized.standardized_drugs[0].route = Some("po".into());
        let bundle = build_bundle(&sample_extraction(), &standardized);
        assert_eq!(
            bundle["entry"][2]["resource"]["dosage"]["route"]["code"],
            "26643006"
        );
    }

    #[test]
    fn missing_dose_omits_dose_field() {
        let mut standardized = sample_standardized();
        standardized.standardized_drugs[0].dose_mg = None;
        let bundle = build_bundle(&sample_extraction(), &standardized);
        assert!(bundle["entry"][2]["resource"]["dosage"]["dose"].is_null());
    }
}
