//! Core data types used throughout panic-triage.
//!
//! These types represent the artifacts, extracted signatures, and repair
//! solutions that flow through the resolution pipeline.

use sha2::{Digest, Sha256};

/// Declared kind of a submitted crash artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A structured crash log (first line is a transport header, the rest JSON).
    StructuredLog,
    /// A loosely-structured text dump (export-tool output, pasted text).
    TextDump,
    /// A photograph of a device panic screen.
    Image,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::StructuredLog => "structured_log",
            ArtifactKind::TextDump => "text_dump",
            ArtifactKind::Image => "image",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-submitted crash artifact: raw bytes, declared kind, and a stable
/// content digest used as the dedup/rate-limit key.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub kind: ArtifactKind,
    pub content_hash: String,
}

impl Artifact {
    pub fn new(bytes: Vec<u8>, kind: ArtifactKind) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let content_hash = format!("{:x}", hasher.finalize());
        Self {
            bytes,
            kind,
            content_hash,
        }
    }
}

/// Canonical record extracted from an artifact. All fields optional: an
/// all-empty record means "no signature found", which is not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedRecord {
    pub product: Option<String>,
    pub os_version: Option<String>,
    pub crash_key: Option<String>,
    pub panic_string: Option<String>,
    pub timestamp: Option<String>,
}

impl ExtractedRecord {
    pub fn is_empty(&self) -> bool {
        self.product.is_none()
            && self.os_version.is_none()
            && self.crash_key.is_none()
            && self.panic_string.is_none()
            && self.timestamp.is_none()
    }
}

/// Device identity shown to the user, resolved against the Knowledge Base
/// header rows where possible.
#[derive(Debug, Clone, Default)]
pub struct DeviceModel {
    /// Human-readable name ("iPhone X"), or the raw identifier when the
    /// Knowledge Base has no display name for it.
    pub model: Option<String>,
    /// Raw product identifier ("iPhone10,1").
    pub version: Option<String>,
    pub os_version: Option<String>,
    pub crash_reporter_key: Option<String>,
}

/// Output of the Code Resolver. `validated` is true only when `error_code`
/// is present in the known-code list; callers must treat an unvalidated
/// code as absent.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSignature {
    pub error_code: Option<String>,
    pub validated: bool,
}

/// Tier of a Knowledge Base entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionTier {
    Mini,
    Full,
}

/// A single Knowledge Base row/column hit: repair descriptions, links, and
/// an optional image anchored to the matched cell.
#[derive(Debug, Clone)]
pub struct KnowledgeEntry {
    pub error_code: String,
    pub solutions: Vec<String>,
    pub links: Vec<String>,
    pub image: Option<Vec<u8>>,
    pub tier: SolutionTier,
}

impl KnowledgeEntry {
    pub fn has_content(&self) -> bool {
        !self.solutions.is_empty() || !self.links.is_empty()
    }
}

/// The tiered answer returned to the caller. When a mini entry exists its
/// content is primary and the full entry (if any) is carried alongside,
/// behind `has_full_available`.
#[derive(Debug, Clone, Default)]
pub struct Solution {
    pub descriptions: Vec<String>,
    pub links: Vec<String>,
    pub error_code: Option<String>,
    pub is_mini_shown: bool,
    pub has_full_available: bool,
    pub full_descriptions: Option<Vec<String>>,
    pub full_links: Option<Vec<String>>,
    pub image: Option<Vec<u8>>,
}

impl Solution {
    /// Whether there is anything user-facing to show.
    pub fn has_content(&self) -> bool {
        !self.descriptions.is_empty() || !self.links.is_empty()
    }
}

/// One inbound analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub bytes: Vec<u8>,
    pub kind: ArtifactKind,
    /// Language tag selecting the Knowledge Base sheet; the configured
    /// default applies when absent.
    pub language: Option<String>,
    pub user_id: i64,
    /// Device/product identifier supplied by the caller when the artifact
    /// itself does not carry one.
    pub product_hint: Option<String>,
}

/// A completed pipeline run: what the caller renders, plus the
/// `solution_found` flag the billing side keys off.
#[derive(Debug)]
pub struct Analysis {
    pub solution: Solution,
    pub record: ExtractedRecord,
    pub device: DeviceModel,
    pub solution_found: bool,
}

/// A completed analysis, as persisted to the history table.
#[derive(Debug, Clone)]
pub struct AnalysisRecord {
    pub id: String,
    pub user_id: i64,
    pub file_hash: Option<String>,
    pub crash_key: Option<String>,
    pub kind: String,
    pub device_model: Option<String>,
    pub os_version: Option<String>,
    pub error_code: Option<String>,
    pub solution_found: bool,
    pub created_at: i64,
}
