//! Signature Extractor: raw artifact bytes → [`ExtractedRecord`].
//!
//! Extraction never fails. Malformed input degrades to an empty record
//! plus a logged diagnostic; the pipeline treats an all-empty record as
//! "no signature found".
//!
//! Text dumps go through an ordered list of recovery strategies, from the
//! cheapest (the whole dump is one JSON object after normalization) to the
//! most forgiving (regex field scraping), stopping at the first that
//! yields anything.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::models::{Artifact, ArtifactKind, ExtractedRecord};

/// Extract a record from an artifact. Image artifacts carry no locally
/// parseable signature; their record is produced by the inference stage.
pub fn extract_record(artifact: &Artifact) -> ExtractedRecord {
    match artifact.kind {
        ArtifactKind::StructuredLog => extract_structured_log(&artifact.bytes),
        ArtifactKind::TextDump => extract_text_dump(&artifact.bytes),
        ArtifactKind::Image => ExtractedRecord::default(),
    }
}

/// Structured logs: the first line is a header artifact of the source
/// format; the remainder is one JSON object.
fn extract_structured_log(bytes: &[u8]) -> ExtractedRecord {
    let Ok(text) = std::str::from_utf8(bytes) else {
        warn!("structured log is not valid UTF-8");
        return ExtractedRecord::default();
    };
    let body: String = text.split('\n').skip(1).collect();
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(map)) => record_from_map(&map),
        Ok(_) => {
            warn!("structured log body is not a JSON object");
            ExtractedRecord::default()
        }
        Err(e) => {
            warn!(error = %e, "failed to parse structured log body");
            ExtractedRecord::default()
        }
    }
}

/// Text dumps: decode, clean, then walk the recovery strategies.
fn extract_text_dump(bytes: &[u8]) -> ExtractedRecord {
    let content = clean_content(&decode_text(bytes));
    if content.is_empty() {
        return ExtractedRecord::default();
    }

    let strategies: &[(&str, fn(&str) -> Option<Map<String, Value>>)] = &[
        ("normalized-json", parse_normalized),
        ("concatenated-objects", parse_concatenated),
        ("line-merge", parse_line_wise),
    ];

    let mut record = ExtractedRecord::default();
    for (name, strategy) in strategies {
        if let Some(map) = strategy(&content) {
            debug!(strategy = name, "text dump parsed");
            record = record_from_map(&map);
            break;
        }
    }

    // Last resort, and also a patch for JSON that parsed but carried no
    // usable signature fields.
    if record.panic_string.is_none() && record.product.is_none() {
        let scraped = scrape_fields(&content);
        if record.panic_string.is_none() {
            record.panic_string = scraped.panic_string;
        }
        if record.product.is_none() {
            record.product = scraped.product;
        }
    }

    record
}

/// Try a fixed list of encodings until one decodes. UTF-8 first (with or
/// without BOM); Latin-1 is total, so it always succeeds.
fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Normalize line endings, strip NULs and BOM characters, and drop stray
/// whitespace inserted between adjacent word characters by some export
/// tools (a single whitespace flanked by word characters on both sides).
fn clean_content(content: &str) -> String {
    let content = content
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(['\0', '\u{feff}'], "");

    let chars: Vec<char> = content.chars().collect();
    let mut out = String::with_capacity(content.len());
    for (i, &c) in chars.iter().enumerate() {
        if c.is_whitespace() && i > 0 && i + 1 < chars.len() {
            let word = |ch: char| ch.is_alphanumeric() || ch == '_';
            if word(chars[i - 1]) && word(chars[i + 1]) {
                continue;
            }
        }
        out.push(c);
    }
    out.trim().to_string()
}

/// Tighten whitespace around `:` and `,` and merge quoted keys broken by
/// stray spaces, so near-JSON survives `serde_json`.
fn normalize_json(content: &str) -> String {
    static KEY: OnceLock<Regex> = OnceLock::new();
    static PUNCT: OnceLock<Regex> = OnceLock::new();
    static QUOTE: OnceLock<Regex> = OnceLock::new();
    let key = KEY.get_or_init(|| Regex::new(r"\s*(\w+)\s*:").unwrap());
    let punct = PUNCT.get_or_init(|| Regex::new(r"\s*([:,])\s*").unwrap());
    let quote = QUOTE.get_or_init(|| Regex::new(r#"("\s+)|(\s+")"#).unwrap());

    let content = key.replace_all(content, "$1:");
    let content = punct.replace_all(&content, "$1");
    quote.replace_all(&content, "\"").into_owned()
}

fn parse_object(content: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn parse_normalized(content: &str) -> Option<Map<String, Value>> {
    parse_object(&normalize_json(content))
}

/// Two JSON objects glued together (`…}{…`) — parse both halves and merge.
fn parse_concatenated(content: &str) -> Option<Map<String, Value>> {
    let (first, second) = content.split_once("}{")?;
    let first = parse_object(&normalize_json(&format!("{}}}", first)))?;
    let second = parse_object(&normalize_json(&format!("{{{}", second)))?;
    let mut merged = first;
    merged.extend(second);
    Some(merged)
}

/// Merge every line that independently parses as a JSON object.
fn parse_line_wise(content: &str) -> Option<Map<String, Value>> {
    let mut merged = Map::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(map) = parse_object(&normalize_json(line)) {
            merged.extend(map);
        }
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Fixed regular-expression fallback: pull panic/product substrings
/// straight out of free text.
fn scrape_fields(content: &str) -> ExtractedRecord {
    static PANIC: OnceLock<Vec<Regex>> = OnceLock::new();
    static PRODUCT: OnceLock<Vec<Regex>> = OnceLock::new();
    let panic_patterns = PANIC.get_or_init(|| {
        [
            r"(?i)panic\(.*?\):\s*(.*?)(?:\n|$)",
            r#"(?i)panicString["\s:]+([^"\n]+)"#,
            r#"(?i)Panic\s+occurred["\s:]+([^"\n]+)"#,
            r#"(?i)error["\s:]+([^"\n]+)"#,
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });
    let product_patterns = PRODUCT.get_or_init(|| {
        [
            r#"[Pp]roduct["\s:]+([^"\n]+)"#,
            r#"[Dd]evice["\s:]+([^"\n]+)"#,
            r#"[Mm]odel["\s:]+([^"\n]+)"#,
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    });

    let mut record = ExtractedRecord::default();
    for pattern in panic_patterns {
        if let Some(caps) = pattern.captures(content) {
            record.panic_string = Some(caps[1].trim().to_string());
            break;
        }
    }
    for pattern in product_patterns {
        if let Some(caps) = pattern.captures(content) {
            record.product = Some(caps[1].trim().to_string());
            break;
        }
    }
    record
}

fn field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match map.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => return Some(s.trim().to_string()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Map parsed JSON onto the canonical record. Both snake_case and
/// camelCase spellings occur in the wild; crash reporter keys are
/// lowercased here.
fn record_from_map(map: &Map<String, Value>) -> ExtractedRecord {
    ExtractedRecord {
        product: field(map, &["product", "productVersion"]),
        os_version: field(map, &["build", "os_version", "osVersion"]),
        crash_key: field(map, &["crash_reporter_key", "crashReporterKey"])
            .map(|k| k.to_lowercase()),
        panic_string: field(map, &["panicString", "panic_string"]),
        timestamp: field(map, &["date", "timestamp"]),
    }
}
