use crate::config::SimilarityScale;
use crate::index::{ChunkMetadata, RetrievalMatch};
use tracing::debug;

/// 归一化后的检索匹配
#[derive(Debug, Clone)]
pub struct ScoredMatch {
    /// 向量索引返回的原始名次，0 起
    pub rank: usize,
    pub chunk_id: String,
    pub similarity: f32,
    /// 归一化置信度 [0,1]
    pub confidence: f32,
    /// 是否达到本轮阈值
    pub accepted: bool,
    pub metadata: Option<ChunkMetadata>,
}

/// 一轮检索的打分结果
#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub matches: Vec<ScoredMatch>,
    /// 实际返回匹配的归一化均值；空集为 0.0
    pub overall_confidence: f32,
}

impl ScoreOutcome {
    pub fn accepted(&self) -> Vec<ScoredMatch> {
        self.matches.iter().filter(|m| m.accepted).cloned().collect()
    }

    pub fn accepted_count(&self) -> usize {
        self.matches.iter().filter(|m| m.accepted).count()
    }
}

/// 置信度打分器：按提供商标度归一化原始相似度并做阈值过滤
pub struct ConfidenceScorer {
    scale: SimilarityScale,
}

impl ConfidenceScorer {
    pub fn new(scale: SimilarityScale) -> Self {
        Self { scale }
    }

    pub fn normalize(&self, raw: f32) -> f32 {
        let normalized = match self.scale {
            SimilarityScale::Cosine => (raw + 1.0) / 2.0,
            SimilarityScale::Normalized => raw,
        };
        normalized.clamp(0.0, 1.0)
    }

    pub fn score(&self, matches: &[RetrievalMatch], threshold: f32) -> ScoreOutcome {
        let scored: Vec<ScoredMatch> = matches
            .iter()
            .enumerate()
            .map(|(rank, m)| {
                let confidence = self.normalize(m.similarity);
                ScoredMatch {
                    rank,
                    chunk_id: m.chunk_id.clone(),
                    similarity: m.similarity,
                    confidence,
                    accepted: confidence >= threshold,
                    metadata: m.metadata.clone(),
                }
            })
            .collect();

        let overall_confidence = if scored.is_empty() {
            0.0
        } else {
            scored.iter().map(|m| m.confidence).sum::<f32>() / scored.len() as f32
        };

        debug!(
            total = scored.len(),
            accepted = scored.iter().filter(|m| m.accepted).count(),
            overall_confidence,
            threshold,
            "scored retrieval matches"
        );

        ScoreOutcome {
            matches: scored,
            overall_confidence,
        }
    }
}
