//! Code Resolver: orchestrates inference stages until a validated error
//! code emerges (or provably cannot).
//!
//! Image artifacts get up to `passes` independent full passes. Each pass:
//!
//! 1. **Structured extraction** — the model returns a JSON object with a
//!    fixed key set; a missing key fails the pass.
//! 2. **OCR fallback** — entered only when the pass found a product and a
//!    crash key but no code: transcribe the visible text, reject
//!    refusals/noise, feed the transcription to the suggestion stage.
//! 3. **Suggestion** — pick exactly one code from the known list (also the
//!    direct entry point for text artifacts that carry a panic string).
//!
//! A pass that trips a critical inference failure aborts everything and
//! surfaces it; any other stage failure just moves on. Whatever code
//! survives is validated against the known-code list at the end — an
//! unknown code (and its panic-string echo) is nulled, never returned.

use tracing::{debug, info, warn};

use crate::inference::{ChatRequest, InferenceClient, InferenceError};
use crate::kb::KnownCodes;
use crate::models::{ExtractedRecord, ResolvedSignature};

/// Transcriptions shorter than this are OCR noise, not a panic text.
const MIN_TRANSCRIPTION_CHARS: usize = 25;

/// Model refusals come back as prose; none of these prefixes ever starts a
/// real panic transcription.
const REFUSAL_PREFIXES: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "i cannot",
    "i can't assist",
    "as an ai",
    "sorry,",
];

const STRUCTURED_SYSTEM_PROMPT: &str = "You read photographs of device panic screens. \
Extract the visible fields and answer with ONLY a JSON object containing exactly these keys: \
product, os_version, timestamp, error_code, crash_reporter_key, panic_string. \
Use null for any field that is not visible. \
panic_string is the panic text up to, but not including, the word \"slide\". \
error_code must be one of the known codes listed below, or null when none of them is visible.\n\n\
Known codes:\n";

const STRUCTURED_USER_PROMPT: &str = "Analyze the panic text in this crash screen photograph \
and return ONLY the JSON object with the required keys.";

const OCR_SYSTEM_PROMPT: &str = "Transcribe all text visible in this image, from the start of \
the panic text up to the word \"slide\" when it appears. Answer with the transcription only, \
no analysis or commentary.";

const SUGGESTION_SYSTEM_PROMPT: &str = "You match crash panic text to a known error code. \
Below is the complete list of known codes. Answer with exactly one code from the list, \
spelled verbatim, or the word null when none of them fits.\n\n\
Known codes:\n";

/// Keys the structured stage must return; a response missing any of them
/// is a hard failure for that pass.
const REQUIRED_KEYS: &[&str] = &[
    "product",
    "os_version",
    "timestamp",
    "error_code",
    "crash_reporter_key",
    "panic_string",
];

/// Result of resolving an image artifact: the record the model extracted
/// plus the validated signature.
#[derive(Debug, Default)]
pub struct ImageAnalysis {
    pub record: ExtractedRecord,
    pub signature: ResolvedSignature,
}

enum StageFailure {
    /// Abort all remaining passes and surface the error.
    Critical(InferenceError),
    /// This stage produced nothing; the pass may continue or be retried.
    Soft(String),
}

fn classify(error: InferenceError) -> StageFailure {
    if error.is_critical() {
        StageFailure::Critical(error)
    } else {
        StageFailure::Soft(error.to_string())
    }
}

fn codes_list(codes: &[String]) -> String {
    codes
        .iter()
        .map(|c| format!("- `{}`", c))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct CodeResolver {
    client: InferenceClient,
    passes: u32,
}

impl CodeResolver {
    pub fn new(client: InferenceClient, passes: u32) -> Self {
        Self { client, passes }
    }

    pub fn is_enabled(&self) -> bool {
        self.client.is_enabled()
    }

    /// Run up to `passes` full analysis passes over an image artifact.
    pub async fn resolve_image(
        &self,
        image: &[u8],
        known: &KnownCodes,
    ) -> Result<ImageAnalysis, InferenceError> {
        let suggestion_codes = known.suggestion_codes();
        let mut last: Option<(ExtractedRecord, Option<String>)> = None;

        for pass in 1..=self.passes {
            let (record, mut code) = match self.structured_pass(image, &suggestion_codes).await {
                Ok(result) => result,
                Err(StageFailure::Critical(e)) => {
                    warn!(pass, error = %e, "critical inference failure, aborting passes");
                    return Err(e);
                }
                Err(StageFailure::Soft(msg)) => {
                    warn!(pass, error = %msg, "structured extraction pass failed");
                    continue;
                }
            };

            if code.is_none() && record.product.is_some() && record.crash_key.is_some() {
                info!(pass, "no code from structured extraction, trying OCR fallback");
                match self.ocr_fallback(image, known).await {
                    Ok(found) => code = found,
                    Err(StageFailure::Critical(e)) => return Err(e),
                    Err(StageFailure::Soft(msg)) => {
                        warn!(pass, error = %msg, "OCR fallback failed, continuing without it");
                    }
                }
            }

            let found = code.is_some();
            last = Some((record, code));
            if found {
                info!(pass, "error code found, stopping passes");
                break;
            }
        }

        let Some((mut record, code)) = last else {
            return Ok(ImageAnalysis::default());
        };

        // Final validation: an unvalidated code never leaves the resolver.
        let signature = validate_code(code.as_deref(), known);
        match &signature.error_code {
            Some(canonical) => record.panic_string = Some(canonical.clone()),
            None => record.panic_string = None,
        }

        Ok(ImageAnalysis { record, signature })
    }

    /// Stage 1: image → fixed-key JSON object.
    async fn structured_pass(
        &self,
        image: &[u8],
        suggestion_codes: &[String],
    ) -> Result<(ExtractedRecord, Option<String>), StageFailure> {
        let system = format!(
            "{}{}",
            STRUCTURED_SYSTEM_PROMPT,
            codes_list(suggestion_codes)
        );
        let request = ChatRequest::image(system, STRUCTURED_USER_PROMPT, image).expect_json();
        let raw = self
            .client
            .call("image structured extraction", &request)
            .await
            .map_err(classify)?;

        let value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| StageFailure::Soft(format!("response is not JSON: {}", e)))?;
        let Some(map) = value.as_object() else {
            return Err(StageFailure::Soft("response is not a JSON object".to_string()));
        };
        for key in REQUIRED_KEYS {
            if !map.contains_key(*key) {
                return Err(StageFailure::Soft(format!(
                    "response is missing required key '{}'",
                    key
                )));
            }
        }

        let text = |key: &str| -> Option<String> {
            map.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let record = ExtractedRecord {
            product: text("product"),
            os_version: text("os_version"),
            crash_key: text("crash_reporter_key").map(|k| k.to_lowercase()),
            panic_string: text("panic_string"),
            timestamp: text("timestamp"),
        };
        Ok((record, text("error_code")))
    }

    /// Stage 2: transcribe the image and run the suggestion stage on the
    /// transcription when it looks usable.
    async fn ocr_fallback(
        &self,
        image: &[u8],
        known: &KnownCodes,
    ) -> Result<Option<String>, StageFailure> {
        let request = ChatRequest::image(OCR_SYSTEM_PROMPT, STRUCTURED_USER_PROMPT, image);
        let transcription = self
            .client
            .call("image text transcription", &request)
            .await
            .map_err(classify)?;

        if !transcription_usable(&transcription) {
            debug!(
                chars = transcription.len(),
                "transcription rejected as unusable"
            );
            return Ok(None);
        }

        self.suggest_from_text(&transcription, known)
            .await
            .map_err(|e| classify(e))
    }

    /// Stage 3: pick exactly one code from the known list, or "null".
    ///
    /// Also the direct entry point for text artifacts. Non-critical
    /// inference failures collapse to `Ok(None)` — only terminal
    /// rate-limit/timeout/client failures surface.
    pub async fn suggest_from_text(
        &self,
        error_text: &str,
        known: &KnownCodes,
    ) -> Result<Option<String>, InferenceError> {
        let error_text = error_text.trim();
        let codes = known.suggestion_codes();
        if error_text.is_empty() || codes.is_empty() {
            return Ok(None);
        }

        let system = format!("{}{}", SUGGESTION_SYSTEM_PROMPT, codes_list(&codes));
        let user = format!(
            "{}\n\nChoose exactly ONE code from the list above, or answer null:",
            error_text
        );
        let raw = match self.client.call("code suggestion", &ChatRequest::text(system, user)).await
        {
            Ok(raw) => raw,
            Err(e) if e.is_critical() => return Err(e),
            Err(e) => {
                warn!(error = %e, "suggestion stage failed, treating as no code");
                return Ok(None);
            }
        };

        let answer = raw.trim();
        if answer.eq_ignore_ascii_case("null") {
            debug!("suggestion stage answered null");
            return Ok(None);
        }

        // Accept only an exact or case-insensitive member of the offered
        // list; anything else collapses to "no code found".
        let matched = codes
            .iter()
            .find(|c| c.as_str() == answer)
            .or_else(|| codes.iter().find(|c| c.eq_ignore_ascii_case(answer)));
        match matched {
            Some(code) => {
                info!(%code, "suggestion stage picked a known code");
                Ok(Some(code.clone()))
            }
            None => {
                warn!(answer, "suggested code is not in the known list, dropping");
                Ok(None)
            }
        }
    }
}

/// Final cross-check against the known-code list. `validated` is true only
/// when the candidate canonicalizes to a list member.
pub fn validate_code(candidate: Option<&str>, known: &KnownCodes) -> ResolvedSignature {
    match candidate {
        None => ResolvedSignature::default(),
        Some(candidate) => match known.canonical_match(candidate) {
            Some(code) => ResolvedSignature {
                error_code: Some(code),
                validated: true,
            },
            None => {
                warn!(candidate, "resolved code failed known-list validation");
                ResolvedSignature {
                    error_code: None,
                    validated: false,
                }
            }
        },
    }
}

fn transcription_usable(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < MIN_TRANSCRIPTION_CHARS {
        return false;
    }
    let lower = trimmed.to_lowercase();
    !REFUSAL_PREFIXES.iter().any(|p| lower.starts_with(p))
}
