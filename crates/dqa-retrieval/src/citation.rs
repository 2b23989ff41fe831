use crate::scorer::ScoredMatch;
use dqa_core::Citation;
use dqa_error::{DqaError, Result};

// 片段截断长度，与响应体大小保持可控
const SNIPPET_MAX_CHARS: usize = 240;

/// 引用装配器：将验收后的匹配转换为带来源与置信度的引用记录
pub struct CitationAssembler;

impl CitationAssembler {
    pub fn new() -> Self {
        Self
    }

    /// 按归一化置信度降序装配引用；同分保持向量索引的原始名次
    pub fn assemble(&self, accepted: &[ScoredMatch]) -> Result<Vec<Citation>> {
        let mut ordered: Vec<&ScoredMatch> = accepted.iter().collect();
        ordered.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.rank.cmp(&b.rank))
        });

        let mut citations = Vec::with_capacity(ordered.len());
        for (position, m) in ordered.into_iter().enumerate() {
            // 元数据缺失意味着索引与元数据脱节，必须上报而非静默丢弃
            let meta = m.metadata.as_ref().ok_or_else(|| DqaError::Assembly {
                chunk_id: m.chunk_id.clone(),
                reason: "no resolvable chunk metadata for match".to_string(),
            })?;

            citations.push(Citation {
                document_id: meta.document_id.clone(),
                chunk_id: meta.chunk_id.clone(),
                chunk_index: meta.chunk_index,
                position,
                filename: meta.filename.clone(),
                page: meta.page,
                score: m.confidence,
                snippet: snippet_of(&meta.text),
            });
        }

        Ok(citations)
    }
}

impl Default for CitationAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn snippet_of(text: &str) -> String {
    if text.chars().count() > SNIPPET_MAX_CHARS {
        text.chars().take(SNIPPET_MAX_CHARS).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkMetadata;

    fn scored(rank: usize, chunk_id: &str, confidence: f32, with_meta: bool) -> ScoredMatch {
        ScoredMatch {
            rank,
            chunk_id: chunk_id.to_string(),
            similarity: confidence,
            confidence,
            accepted: true,
            metadata: with_meta.then(|| ChunkMetadata {
                document_id: "doc1".to_string(),
                chunk_id: chunk_id.to_string(),
                chunk_index: rank as i32,
                text: format!("chunk text for {}", chunk_id),
                filename: Some("report.txt".to_string()),
                page: None,
                start_offset: 0,
                end_offset: 0,
            }),
        }
    }

    #[test]
    fn test_citations_sorted_by_descending_confidence() {
        let assembler = CitationAssembler::new();
        let matches = vec![
            scored(0, "a", 0.72, true),
            scored(1, "b", 0.91, true),
            scored(2, "c", 0.85, true),
        ];
        let citations = assembler.assemble(&matches).unwrap();
        assert_eq!(citations.len(), 3);
        assert_eq!(citations[0].chunk_id, "b");
        assert_eq!(citations[1].chunk_id, "c");
        assert_eq!(citations[2].chunk_id, "a");
        for (i, c) in citations.iter().enumerate() {
            assert_eq!(c.position, i);
        }
    }

    #[test]
    fn test_ties_preserve_original_rank_order() {
        let assembler = CitationAssembler::new();
        let matches = vec![
            scored(0, "first", 0.8, true),
            scored(1, "second", 0.8, true),
            scored(2, "third", 0.8, true),
        ];
        let citations = assembler.assemble(&matches).unwrap();
        assert_eq!(citations[0].chunk_id, "first");
        assert_eq!(citations[1].chunk_id, "second");
        assert_eq!(citations[2].chunk_id, "third");
    }

    #[test]
    fn test_missing_metadata_fails_assembly() {
        let assembler = CitationAssembler::new();
        let matches = vec![scored(0, "ok", 0.9, true), scored(1, "orphan", 0.8, false)];
        let err = assembler.assemble(&matches).unwrap_err();
        assert!(matches!(err, DqaError::Assembly { ref chunk_id, .. } if chunk_id == "orphan"));
    }

    #[test]
    fn test_snippet_truncation() {
        let long = "x".repeat(500);
        let s = snippet_of(&long);
        assert_eq!(s.chars().count(), 243);
        assert!(s.ends_with("..."));

        let short = "short text";
        assert_eq!(snippet_of(short), short);
    }

    #[test]
    fn test_citation_confidence_is_per_match_score() {
        let assembler = CitationAssembler::new();
        let citations = assembler.assemble(&[scored(0, "a", 0.73, true)]).unwrap();
        assert!((citations[0].score - 0.73).abs() < 1e-6);
        assert_eq!(citations[0].filename.as_deref(), Some("report.txt"));
    }
}
