use dqa_error::{DqaError, Result};
use serde::{Deserialize, Serialize};

/// 相似度原始分值的标度，决定归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityScale {
    /// 余弦相似度 [-1,1]，线性映射到 [0,1]
    #[default]
    Cosine,
    /// 提供商已归一化到 [0,1]，仅做夹取
    Normalized,
}

/// 检索与自校正配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_top_k: usize,
    pub confidence_threshold: f32,
    pub max_retries: u32,
    pub embedding_dimension: usize,
    pub retry_topk_multiplier: usize,
    pub retry_topk_ceiling: usize,
    pub retry_threshold_decrement: f32,
    pub min_confidence_floor: f32,
    /// 最少引用数验收策略：None 表示仅按整体置信度验收
    pub min_citations: Option<usize>,
    pub similarity_scale: SimilarityScale,
    pub max_context_chars: usize,
    pub embed_concurrency: usize,
    pub embed_batch_size: usize,
    pub per_attempt_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub query_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_top_k: 5,
            confidence_threshold: 0.7,
            max_retries: 3,
            embedding_dimension: 1536,
            retry_topk_multiplier: 2,
            retry_topk_ceiling: 50,
            retry_threshold_decrement: 0.05,
            min_confidence_floor: 0.3,
            min_citations: None,
            similarity_scale: SimilarityScale::Cosine,
            max_context_chars: 8000,
            embed_concurrency: 4,
            embed_batch_size: 32,
            per_attempt_timeout_ms: 10_000,
            generation_timeout_ms: 30_000,
            query_timeout_ms: 60_000,
        }
    }
}

impl RetrievalConfig {
    /// 参数组合校验，非法组合在任何处理开始前拒绝
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(DqaError::Configuration {
                key: "chunk_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(DqaError::Configuration {
                key: "chunk_overlap".to_string(),
                reason: format!(
                    "overlap {} must be smaller than chunk_size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }
        if self.retrieval_top_k == 0 {
            return Err(DqaError::Configuration {
                key: "retrieval_top_k".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(DqaError::Configuration {
                key: "confidence_threshold".to_string(),
                reason: "must be within [0,1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence_floor) {
            return Err(DqaError::Configuration {
                key: "min_confidence_floor".to_string(),
                reason: "must be within [0,1]".to_string(),
            });
        }
        if self.retry_threshold_decrement < 0.0 {
            return Err(DqaError::Configuration {
                key: "retry_threshold_decrement".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        if self.retry_topk_multiplier < 1 {
            return Err(DqaError::Configuration {
                key: "retry_topk_multiplier".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry_topk_ceiling < self.retrieval_top_k {
            return Err(DqaError::Configuration {
                key: "retry_topk_ceiling".to_string(),
                reason: "must not be below retrieval_top_k".to_string(),
            });
        }
        if self.max_retries == 0 {
            return Err(DqaError::Configuration {
                key: "max_retries".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.embedding_dimension == 0 {
            return Err(DqaError::Configuration {
                key: "embedding_dimension".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.embed_concurrency == 0 || self.embed_batch_size == 0 {
            return Err(DqaError::Configuration {
                key: "embed_concurrency".to_string(),
                reason: "concurrency and batch size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RetrievalConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_below_chunk_size() {
        let cfg = RetrievalConfig {
            chunk_size: 200,
            chunk_overlap: 200,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, DqaError::Configuration { ref key, .. } if key == "chunk_overlap"));
    }

    #[test]
    fn test_topk_ceiling_must_cover_initial_topk() {
        let cfg = RetrievalConfig {
            retrieval_top_k: 20,
            retry_topk_ceiling: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
