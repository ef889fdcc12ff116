//! Network-coverage classification: does the user's own corpus cover the
//! question, or must the answer lean on general knowledge?

use serde::{Deserialize, Serialize};

use crate::epistemic::{AnnotatedChunk, EpistemicLevel, Feature};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    InNetwork,
    OutOfNetwork,
    Hybrid,
}

impl NetworkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InNetwork => "IN_NETWORK",
            Self::OutOfNetwork => "OUT_OF_NETWORK",
            Self::Hybrid => "HYBRID",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub reason: String,
}

pub trait NetworkClassifier: Send + Sync {
    fn classify(&self, question: &str, chunks: &[AnnotatedChunk]) -> NetworkInfo;
}

/// Keyword-coverage heuristic: enough keyword-bearing evidence means the
/// corpus can ground the answer on its own.
pub struct KeywordCoverageClassifier;

impl NetworkClassifier for KeywordCoverageClassifier {
    fn classify(&self, _question: &str, chunks: &[AnnotatedChunk]) -> NetworkInfo {
        if chunks.is_empty() {
            return NetworkInfo {
                status: NetworkStatus::OutOfNetwork,
                reason: "no evidence retrieved".to_string(),
            };
        }

        let keyword_hits = chunks
            .iter()
            .filter(|c| c.annotation.features.contains(&Feature::KeywordMatch))
            .count();
        let strong_hits = chunks
            .iter()
            .filter(|c| c.annotation.level == EpistemicLevel::A)
            .count();

        if keyword_hits >= 2 || strong_hits >= 1 {
            NetworkInfo {
                status: NetworkStatus::InNetwork,
                reason: format!("{keyword_hits} keyword hits, {strong_hits} level-A chunks"),
            }
        } else if keyword_hits == 1 {
            NetworkInfo {
                status: NetworkStatus::Hybrid,
                reason: "single keyword hit".to_string(),
            }
        } else {
            NetworkInfo {
                status: NetworkStatus::Hybrid,
                reason: "conceptual evidence only".to_string(),
            }
        }
    }
}
