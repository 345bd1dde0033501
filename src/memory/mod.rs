//! Fix Memory: a similarity-searchable store of past error/fix outcomes.
//!
//! Records are immutable once stored. When opened on a file, every stored
//! record is appended to it as one JSON line, so a restarted process
//! reconstructs the store by reading the file back.

mod persistence;
pub mod similarity;


use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::constants::{DEFAULT_MIN_SIMILARITY, DEFAULT_RECALL_LIMIT};
use crate::models::{FixRecord, FixType};

pub use persistence::{append_record, load_records};

/// A fix record with its store-assigned id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFix {
    pub error_id: String,
    #[serde(flatten)]
    pub record: FixRecord,
    pub stored_at: DateTime<Utc>,
}

/// Parameters for `recall_fixes`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallQuery {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Maximum matches returned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Overrides the store's threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f64>,
}

impl RecallQuery {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One recalled record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixMatch {
    pub error_id: String,
    /// Raw text similarity in `[0, 1]`
    pub similarity: f64,
    /// Similarity weighted by outcome and recency; matches are sorted by this
    pub score: f64,
    #[serde(flatten)]
    pub record: FixRecord,
}

/// Remediation suggested by recall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestedFix {
    pub error_id: String,
    pub fix_type: FixType,
    pub fix_target: String,
    pub fix_description: String,
}

/// Result of `recall_fixes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallResult {
    /// Matches above threshold, before `limit` is applied
    pub match_count: usize,
    pub matches: Vec<FixMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<SuggestedFix>,
    /// Score of the suggested fix; 0 without a suggestion
    pub confidence: f64,
}

/// Acknowledgement returned by `store_fix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreAck {
    pub error_id: String,
}

/// In-process fix store, optionally backed by a JSON-lines file
#[derive(Debug)]
pub struct FixMemory {
    records: Vec<StoredFix>,
    path: Option<PathBuf>,
    min_similarity: f64,
}

impl Default for FixMemory {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl FixMemory {
    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            records: Vec::new(),
            path: None,
            min_similarity: DEFAULT_MIN_SIMILARITY,
        }
    }

    /// Open a file-backed store, loading any records already on disk
    pub fn open(path: &Path) -> Result<Self> {
        let records = load_records(path)?;
        info!(path = %path.display(), records = records.len(), "fix memory opened");
        Ok(Self {
            records,
            path: Some(path.to_path_buf()),
            min_similarity: DEFAULT_MIN_SIMILARITY,
        })
    }

    pub fn with_min_similarity(mut self, min_similarity: f64) -> Self {
        self.min_similarity = min_similarity.clamp(0.0, 1.0);
        self
    }

    pub fn min_similarity(&self) -> f64 {
        self.min_similarity
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in insertion order
    pub fn records(&self) -> &[StoredFix] {
        &self.records
    }

    /// Store a record and return its id
    pub fn store(&mut self, record: FixRecord) -> Result<String> {
        let stored = StoredFix {
            error_id: uuid::Uuid::new_v4().to_string(),
            record,
            stored_at: Utc::now(),
        };
        if let Some(path) = &self.path {
            append_record(path, &stored)?;
        }
        debug!(
            error_id = %stored.error_id,
            error_type = %stored.record.error_type,
            success = stored.record.success,
            "fix recorded"
        );
        let id = stored.error_id.clone();
        self.records.push(stored);
        Ok(id)
    }

    /// Records similar to the query, best first.
    ///
    /// Only records at or above the similarity threshold are returned. The
    /// suggestion is the best-ranked record whose fix worked.
    pub fn recall(&self, query: &RecallQuery) -> RecallResult {
        let threshold = query
            .min_similarity
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(self.min_similarity);
        let query_tokens =
            similarity::error_tokens(&query.error_type, &query.error_message, &query.tags);

        let total = self.records.len();
        let mut ranked: Vec<(usize, FixMatch)> = self
            .records
            .iter()
            .enumerate()
            .filter_map(|(position, stored)| {
                let record = &stored.record;
                let record_tokens = similarity::error_tokens(
                    &record.error_type,
                    &record.error_message,
                    &record.tags,
                );
                let sim = similarity::similarity(
                    &query.error_type,
                    &query_tokens,
                    &record.error_type,
                    &record_tokens,
                );
                if sim < threshold || sim <= 0.0 {
                    return None;
                }
                let score = similarity::rank_score(sim, record.success, position, total);
                Some((
                    position,
                    FixMatch {
                        error_id: stored.error_id.clone(),
                        similarity: sim,
                        score,
                        record: record.clone(),
                    },
                ))
            })
            .collect();

        // Best score first; newer records win ties
        ranked.sort_by(|(pa, a), (pb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| pb.cmp(pa))
        });

        let mut matches: Vec<FixMatch> = ranked.into_iter().map(|(_, m)| m).collect();
        let best = matches.iter().find(|m| m.record.success);
        let suggested_fix = best.map(|m| SuggestedFix {
            error_id: m.error_id.clone(),
            fix_type: m.record.fix_type,
            fix_target: m.record.fix_target.clone(),
            fix_description: m.record.fix_description.clone(),
        });
        let confidence = best.map(|m| m.score).unwrap_or(0.0);

        let match_count = matches.len();
        matches.truncate(query.limit.unwrap_or(DEFAULT_RECALL_LIMIT).max(1));
        RecallResult {
            match_count,
            matches,
            suggested_fix,
            confidence,
        }
    }

    /// Successful candidates in rank order, for the fix loop
    pub fn candidates(&self, query: &RecallQuery) -> Vec<FixMatch> {
        let query = RecallQuery {
            limit: Some(usize::MAX),
            ..query.clone()
        };
        self.recall(&query)
            .matches
            .into_iter()
            .filter(|m| m.record.success)
            .collect()
    }
}
