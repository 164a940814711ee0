//! Model-service adapters for the extraction and standardization stages.
//!
//! Both stages sit behind object-safe traits so the agent loop and the tests
//! never depend on a live endpoint. The HTTP implementations classify every
//! failure as transient (timeout, connect, 429, 5xx) or permanent (other 4xx,
//! unparseable output) — the retry policy upstream keys off nothing else.

use std::path::Path;
use std::time::Instant;

use base64::Engine as _;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::pipeline::types::{AdapterResponse, ChartExtraction, StandardizedOutput};
use crate::pipeline::StageError;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a clinical document digitization specialist. \
Your task is to extract ALL information from handwritten chemotherapy charts with \
extreme precision. Patient safety depends on accuracy — a misread dose can be fatal.\n\n\
Return ONLY valid JSON. No markdown, no explanation.";

const EXTRACTION_USER_PROMPT: &str = r#"Extract every piece of information from this chemotherapy
chart image. Return a JSON object with EXACTLY this structure:

{
  "patient": {
    "name_raw": "<exact name as written>",
    "age": <integer or null>,
    "sex": "<M/F/Other or null>",
    "registration_number": "<exact as written>",
    "confidence": <0.0-1.0>
  },
  "hospital": {"name": "<hospital name>", "unit": "<unit/department name>"},
  "diagnosis": {"text_raw": "<exact diagnosis text as written>", "confidence": <0.0-1.0>},
  "regimen": {"name": "<chemotherapy regimen name>", "confidence": <0.0-1.0>},
  "cycles": [
    {
      "date": "<date as written, e.g. 07/03/24>",
      "cycle_id": "<e.g. C1D1, C1D2>",
      "drugs": [
        {
          "name_raw": "<drug name exactly as written>",
          "dose_raw": "<dose exactly as written, e.g. 90mg>",
          "dose_value": <numeric value or null>,
          "dose_unit": "<mg/mcg/g or null>",
          "route": "<IV/IM/PO or null>",
          "confidence": <0.0-1.0>,
          "ambiguous": <true if hard to read>
        }
      ],
      "remarks": "<any remarks column text>",
      "has_correction": <true if crossed-out or corrected values visible>
    }
  ],
  "flags": ["<any field or value that is ambiguous, crossed out, or clinically notable>"],
  "overall_confidence": <0.0-1.0>
}

Be especially careful with:
- Drug name spelling variants (OCR artifacts from handwriting)
- Dose values: distinguish between 80mg vs 90mg precisely
- Crossed-out or corrected entries
- Cycle numbering (C1D1 = Cycle 1 Day 1)"#;

const STANDARDIZATION_SYSTEM_PROMPT: &str = "You are a clinical pharmacist and medical coder \
specializing in oncology. You receive raw extracted data from a handwritten chemotherapy \
chart and must standardize it for electronic health records. \
Return ONLY valid JSON — no markdown fences, no explanation, no preamble.";

fn standardization_user_prompt(extraction_json: &str) -> String {
    format!(
        r#"INPUT DATA:
{extraction_json}

Perform these tasks:

1. ICD-10 CODING: Map the diagnosis to the correct ICD-10-CM code.
   - Acute Myeloid Leukemia (AML) -> C92.00 (Acute myeloblastic leukemia, without maturation)
   - Include full description.

2. DRUG STANDARDIZATION: Normalize all drug name variants to standard WHO INN names.
   Known variants:
   - "Dauno", "DAUNORUBICIN", "Daunorubicn", "Daunorubicine" -> "Daunorubicin"
   - "Cytosare", "Cytbrar", "cytbror", "Cytarabinr", "Cytosar" -> "Cytarabine"

Return EXACTLY this JSON structure (no extra keys, no markdown):
{{
  "icd10": {{"code": "<e.g. C92.00>", "description": "<full ICD-10 description>"}},
  "standardized_drugs": [
    {{
      "cycle_id": "<e.g. C1D1>",
      "date": "<YYYY-MM-DD if inferable, else raw>",
      "drug_standard": "<WHO INN name>",
      "drug_raw": "<as written in chart>",
      "dose_mg": <numeric value or null>,
      "route": "<IV/IM/PO>",
      "name_was_corrected": <true/false>
    }}
  ],
  "notes": "<any additional clinical observations>"
}}"#
    )
}

// ═══════════════════════════════════════════
// Traits
// ═══════════════════════════════════════════

/// Vision extraction: chart image bytes in, structured extraction out.
pub trait ExtractionAdapter: Send + Sync {
    fn extract(&self, image_path: &Path) -> Result<AdapterResponse<ChartExtraction>, StageError>;
}

/// Text standardization: structured extraction in, coded output out.
pub trait StandardizationAdapter: Send + Sync {
    fn standardize(
        &self,
        extraction: &ChartExtraction,
    ) -> Result<AdapterResponse<StandardizedOutput>, StageError>;
}

// ═══════════════════════════════════════════
// HTTP implementations
// ═══════════════════════════════════════════

/// Calls the vision service's native chat-completion endpoint with a
/// base64 data-URL image. The OpenAI-compatible endpoint does not accept
/// images, hence the native path.
pub struct HttpExtractionAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpExtractionAdapter {
    pub fn new(settings: &Settings) -> Result<Self, StageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.adapter_timeout)
            .build()
            .map_err(|e| StageError::Permanent(format!("http client init: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.extraction_base_url.clone(),
            api_key: settings.extraction_api_key.clone(),
            model: settings.extraction_model.clone(),
        })
    }
}

impl ExtractionAdapter for HttpExtractionAdapter {
    fn extract(&self, image_path: &Path) -> Result<AdapterResponse<ChartExtraction>, StageError> {
        if self.api_key.is_empty() {
            return Err(StageError::Permanent(
                "extraction API key not configured".to_string(),
            ));
        }

        let bytes = std::fs::read(image_path).map_err(|e| {
            StageError::Permanent(format!("cannot read {}: {e}", image_path.display()))
        })?;
        let mime = mime_guess::from_path(image_path)
            .first_or_octet_stream()
            .to_string();
        let data_url = format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&bytes)
        );

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "name": "BioVault", "content": EXTRACTION_SYSTEM_PROMPT},
                {"role": "user", "name": "User", "content": [
                    {"type": "image_url", "image_url": {"url": data_url}},
                    {"type": "text", "text": EXTRACTION_USER_PROMPT},
                ]},
            ],
            "temperature": 0.1,
            "max_tokens": 4096,
        });

        let started = Instant::now();
        let url = format!("{}/text/chatcompletion_v2", self.base_url);
        let body = post_json(&self.client, &url, &self.api_key, &payload)?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(latency_ms, "extraction service responded");

        let content = completion_content(&body)?;
        let output: ChartExtraction = parse_model_json(&content)?;
        let confidence = Some(output.overall_confidence).filter(|c| *c > 0.0);
        Ok(AdapterResponse {
            output,
            latency_ms,
            confidence,
        })
    }
}

/// Calls the standardization service's OpenAI-compatible chat endpoint.
pub struct HttpStandardizationAdapter {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpStandardizationAdapter {
    pub fn new(settings: &Settings) -> Result<Self, StageError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.adapter_timeout)
            .build()
            .map_err(|e| StageError::Permanent(format!("http client init: {e}")))?;
        Ok(Self {
            client,
            base_url: settings.standardization_base_url.clone(),
            api_key: settings.standardization_api_key.clone(),
            model: settings.standardization_model.clone(),
        })
    }
}

impl StandardizationAdapter for HttpStandardizationAdapter {
    fn standardize(
        &self,
        extraction: &ChartExtraction,
    ) -> Result<AdapterResponse<StandardizedOutput>, StageError> {
        if self.api_key.is_empty() {
            return Err(StageError::Permanent(
                "standardization API key not configured".to_string(),
            ));
        }

        let extraction_json = serde_json::to_string_pretty(extraction)
            .map_err(|e| StageError::Permanent(format!("serialize extraction: {e}")))?;
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": STANDARDIZATION_SYSTEM_PROMPT},
                {"role": "user", "content": standardization_user_prompt(&extraction_json)},
            ],
            "temperature": 0.1,
            "max_tokens": 4096,
        });

        let started = Instant::now();
        let url = format!("{}/chat/completions", self.base_url);
        let body = post_json(&self.client, &url, &self.api_key, &payload)?;
        let latency_ms = started.elapsed().as_millis() as u64;
        debug!(latency_ms, "standardization service responded");

        let content = completion_content(&body)?;
        let output: StandardizedOutput = parse_model_json(&content)?;
        Ok(AdapterResponse {
            output,
            latency_ms,
            confidence: None,
        })
    }
}

// ═══════════════════════════════════════════
// Shared plumbing
// ═══════════════════════════════════════════

fn post_json(
    client: &reqwest::blocking::Client,
    url: &str,
    api_key: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value, StageError> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(payload)
        .send()
        .map_err(|e| {
            // Connect errors and timeouts are worth retrying; anything the
            // client refuses to even send is not.
            if e.is_timeout() || e.is_connect() || e.is_request() {
                StageError::Transient(format!("request failed: {e}"))
            } else {
                StageError::Permanent(format!("request failed: {e}"))
            }
        })?;

    let status = response.status();
    if status.is_server_error() || status.as_u16() == 429 {
        let text = response.text().unwrap_or_default();
        warn!(%status, "service returned retryable error");
        return Err(StageError::Transient(format!("HTTP {status}: {text}")));
    }
    if !status.is_success() {
        let text = response.text().unwrap_or_default();
        return Err(StageError::Permanent(format!("HTTP {status}: {text}")));
    }

    response
        .json()
        .map_err(|e| StageError::Permanent(format!("response is not JSON: {e}")))
}

fn completion_content(body: &serde_json::Value) -> Result<String, StageError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            StageError::Permanent("response has no choices[0].message.content".to_string())
        })
}

/// Strip markdown code fences the model may wrap its JSON in, then parse.
fn parse_model_json<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, StageError> {
    let stripped = strip_code_fences(content);
    serde_json::from_str(stripped).map_err(|e| {
        let preview: String = stripped.chars().take(200).collect();
        StageError::Permanent(format!("model returned invalid JSON: {e} (got: {preview})"))
    })
}

fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the fence line (which may carry a language tag), then the closing fence.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    let rest = rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest);
    rest.trim()
}
