//! Per-request orchestration: artifact → extraction → code resolution →
//! solution lookup, gated on entry and exit by the Attempt Limiter.
//!
//! Each request runs as an independent sequential task. The only shared
//! mutable state is the limiter's keyed records (transactional per key)
//! and the known-code snapshot (atomic swap); the inference gate bounds
//! concurrent provider calls process-wide.
//!
//! Error discipline: malformed input and lookup misses degrade to
//! well-formed empty values, limiter rejections are an expected reply
//! variant, and only terminal inference failures surface as errors.

use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::extract::extract_record;
use crate::history::HistoryRepo;
use crate::inference::{InferenceClient, InferenceError};
use crate::kb::{KnowledgeBase, KnownCodes};
use crate::limiter::{AttemptStore, Gate, Limits, LimiterKey};
use crate::models::{Analysis, AnalysisRequest, Artifact, ArtifactKind};
use crate::resolver::{validate_code, CodeResolver};
use crate::solution::{resolve_solution, truncate_at_slide};

/// Outcome of one analysis request.
#[derive(Debug)]
pub enum AnalysisReply {
    /// The limiter refused the request; nothing ran and nothing was
    /// charged. The message carries the remaining wait.
    Rejected { message: String },
    /// The pipeline ran to completion (solution content not guaranteed).
    Completed(Box<Analysis>),
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub struct Analyzer {
    config: Config,
    known: KnownCodes,
    resolver: CodeResolver,
    store: AttemptStore,
    history: HistoryRepo,
}

impl Analyzer {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = db::connect(&config).await?;
        let known = KnownCodes::load(&config.kb.workbook, &config.kb.language);
        let client = InferenceClient::from_config(&config.inference);
        let resolver = CodeResolver::new(client, config.inference.passes);
        let limits = Limits::new(config.limiter.max_attempts, config.limiter.cooldown_hours);
        Ok(Self {
            known,
            resolver,
            store: AttemptStore::new(pool.clone(), limits),
            history: HistoryRepo::new(pool),
            config,
        })
    }

    pub fn known_codes(&self) -> &KnownCodes {
        &self.known
    }

    pub fn history(&self) -> &HistoryRepo {
        &self.history
    }

    /// Re-read the workbook and swap the known-code snapshot. Invoked
    /// after the workbook file is replaced.
    pub fn reload_known_codes(&self) -> usize {
        self.known
            .reload(&self.config.kb.workbook, &self.config.kb.language)
    }

    /// Load the Knowledge Base sheet for a request's language tag.
    pub fn knowledge_base(&self, language: Option<&str>) -> KnowledgeBase {
        let language = language.unwrap_or(&self.config.kb.language);
        KnowledgeBase::load(&self.config.kb.workbook, language)
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReply, AnalysisError> {
        let artifact = Artifact::new(request.bytes, request.kind);
        let user_id = request.user_id;
        info!(
            user_id,
            kind = %artifact.kind,
            hash = %artifact.content_hash,
            "analysis request"
        );

        // Entry gate on the content hash, before any work happens.
        let file_key = LimiterKey::FileHash(&artifact.content_hash);
        if let Gate::Reject { message, .. } = self.store.check(user_id, &file_key).await? {
            info!(user_id, "request rejected by attempt limiter (file hash)");
            return Ok(AnalysisReply::Rejected { message });
        }

        let mut record = extract_record(&artifact);

        // Second gate on the crash key, when extraction surfaced one.
        if let Some(crash_key) = record.crash_key.clone() {
            let crash = LimiterKey::CrashKey(&crash_key);
            if let Gate::Reject { message, .. } = self.store.check(user_id, &crash).await? {
                info!(user_id, "request rejected by attempt limiter (crash key)");
                return Ok(AnalysisReply::Rejected { message });
            }
        }

        let kb = self.knowledge_base(request.language.as_deref());
        if !kb.is_loaded() {
            warn!("no Knowledge Base available for this request");
        }

        // Resolve the error code.
        let signature = match artifact.kind {
            ArtifactKind::Image => {
                let analysis = self.resolver.resolve_image(&artifact.bytes, &self.known).await?;
                record = analysis.record;
                analysis.signature
            }
            ArtifactKind::StructuredLog | ArtifactKind::TextDump => {
                let panic_text = record
                    .panic_string
                    .as_deref()
                    .map(truncate_at_slide)
                    .unwrap_or("");

                // A code visible in the signature text skips inference.
                let candidate = match self.known.find_in_text(panic_text) {
                    Some(direct) => {
                        info!(code = %direct, "known code present in signature text, skipping inference");
                        Some(direct)
                    }
                    None if !panic_text.is_empty() => {
                        self.resolver.suggest_from_text(panic_text, &self.known).await?
                    }
                    None => None,
                };
                validate_code(candidate.as_deref(), &self.known)
            }
        };

        let product = record
            .product
            .clone()
            .or_else(|| request.product_hint.clone());
        let device = kb.device_model(
            product.as_deref(),
            record.os_version.as_deref(),
            record.crash_key.as_deref(),
        );

        let solution = match signature.error_code.as_deref() {
            Some(code) => resolve_solution(&kb, code, product.as_deref()),
            None => Default::default(),
        };
        let solution_found = solution.has_content();

        self.history
            .record(
                user_id,
                Some(&artifact.content_hash),
                record.crash_key.as_deref(),
                artifact.kind.as_str(),
                device.model.as_deref(),
                device.os_version.as_deref(),
                solution.error_code.as_deref(),
                solution_found,
            )
            .await?;

        // Exit gate bookkeeping on both key spaces.
        if solution_found {
            self.store.record_success(user_id, &file_key).await?;
        } else {
            self.store.record_failure(user_id, &file_key).await?;
        }
        if let Some(crash_key) = record.crash_key.clone() {
            let crash = LimiterKey::CrashKey(&crash_key);
            if solution_found {
                self.store.record_success(user_id, &crash).await?;
            } else {
                self.store.record_failure(user_id, &crash).await?;
            }
        }

        info!(
            user_id,
            solution_found,
            error_code = solution.error_code.as_deref().unwrap_or("-"),
            "analysis complete"
        );
        Ok(AnalysisReply::Completed(Box::new(Analysis {
            solution,
            record,
            device,
            solution_found,
        })))
    }
}
