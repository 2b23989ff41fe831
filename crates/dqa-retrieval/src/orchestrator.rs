use crate::citation::CitationAssembler;
use crate::config::RetrievalConfig;
use crate::controller::{Decision, EscalationPolicy, RetrievalParams, SelfCorrectionController};
use crate::index::VectorIndex;
use crate::scorer::{ConfidenceScorer, ScoredMatch};
use chrono::Utc;
use dqa_core::{QueryRequest, QueryResponse, RetrievalMetadata};
use dqa_error::{DqaError, Result};
use dqa_llm::{ChatModel, EmbedModel};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the user's question based on the provided context. If the context doesn't contain enough information to answer the question, say so clearly. Always cite your sources using [1], [2], etc. when referencing information from the context.";

const NO_ANSWER_MESSAGE: &str = "抱歉，我在知识库中没有找到足够可信的信息来回答您的问题。";
const ANSWER_UNAVAILABLE_MESSAGE: &str = "检索结果已返回，但答案生成未能在时限内完成。";

/// 查询编排器
///
/// 组合嵌入、向量检索、置信度打分、自校正重试、引用装配与答案生成，
/// 并独占端到端超时预算。生成服务只能由编排器调用。
pub struct QueryOrchestrator {
    embed_model: Arc<dyn EmbedModel>,
    chat_model: Arc<dyn ChatModel>,
    index: Arc<dyn VectorIndex>,
    scorer: ConfidenceScorer,
    assembler: CitationAssembler,
    config: RetrievalConfig,
}

impl QueryOrchestrator {
    pub fn new(
        embed_model: Arc<dyn EmbedModel>,
        chat_model: Arc<dyn ChatModel>,
        index: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let scorer = ConfidenceScorer::new(config.similarity_scale);
        Ok(Self {
            embed_model,
            chat_model,
            index,
            scorer,
            assembler: CitationAssembler::new(),
            config,
        })
    }

    /// 端到端查询流程
    #[instrument(skip(self, req), fields(query = %req.query))]
    pub async fn query(&self, req: QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.query_timeout_ms);

        if req.query.trim().is_empty() {
            return Err(DqaError::InvalidRequest {
                reason: "query text must not be empty".to_string(),
            });
        }
        let top_k = req.top_k.unwrap_or(self.config.retrieval_top_k);
        if top_k == 0 {
            return Err(DqaError::InvalidRequest {
                reason: "top_k must be at least 1".to_string(),
            });
        }
        let threshold = req
            .confidence_threshold
            .unwrap_or(self.config.confidence_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(DqaError::InvalidRequest {
                reason: "confidence_threshold must be within [0,1]".to_string(),
            });
        }
        let max_retries = req.max_retries.unwrap_or(self.config.max_retries).max(1);
        let include_citations = req.include_citations.unwrap_or(true);

        // 查询向量
        let query_vector = self.embed_query(&req.query).await?;

        // 自校正检索循环，重试严格串行
        let mut controller = SelfCorrectionController::new(
            RetrievalParams { top_k, threshold },
            EscalationPolicy {
                topk_multiplier: self.config.retry_topk_multiplier,
                topk_ceiling: self.config.retry_topk_ceiling.max(top_k),
                threshold_decrement: self.config.retry_threshold_decrement,
                confidence_floor: self.config.min_confidence_floor,
            },
            max_retries,
            self.config.min_citations,
        );

        let per_attempt = Duration::from_millis(self.config.per_attempt_timeout_ms);
        let (final_matches, final_confidence, low_confidence) = loop {
            let params = controller.begin_attempt();

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                warn!("query deadline elapsed during search, settling on best attempt");
                let (matches, confidence) = controller.abort_on_deadline();
                break (matches, confidence, true);
            };
            let clamped = remaining < per_attempt;
            let attempt_timeout = if clamped { remaining } else { per_attempt };

            let search = tokio::time::timeout(
                attempt_timeout,
                self.index
                    .query(&query_vector, params.top_k, req.filters.as_ref()),
            )
            .await;

            let matches = match search {
                Ok(result) => result?,
                Err(_) if clamped => {
                    warn!("query deadline elapsed during search, settling on best attempt");
                    let (matches, confidence) = controller.abort_on_deadline();
                    break (matches, confidence, true);
                }
                Err(_) => {
                    return Err(DqaError::Timeout {
                        operation: "vector_search".to_string(),
                        timeout_ms: self.config.per_attempt_timeout_ms,
                    })
                }
            };

            let outcome = self.scorer.score(&matches, params.threshold);
            match controller.observe(&outcome) {
                Decision::Accept(accepted) => {
                    break (accepted, outcome.overall_confidence, false)
                }
                Decision::Retry(_) => continue,
                Decision::Exhausted {
                    matches,
                    confidence,
                } => break (matches, confidence, true),
            }
        };

        let attempts = controller.attempts().to_vec();
        let (final_top_k, final_threshold, total_retrieved) = attempts
            .last()
            .map(|a| (a.top_k_used, a.threshold_used, a.total_returned))
            .unwrap_or((top_k, threshold, 0));

        let mut metadata = RetrievalMetadata {
            attempts,
            final_top_k,
            final_threshold,
            total_retrieved,
            accepted_count: final_matches.len(),
            low_confidence,
            answer_unavailable: false,
            context_citations_dropped: 0,
        };

        // 无任何验收匹配：显式返回无法作答，绝不调用生成服务
        if final_matches.is_empty() {
            info!(
                attempts = metadata.attempts.len(),
                "no accepted matches after exhaustion, generation skipped"
            );
            return Ok(QueryResponse {
                query: req.query,
                answer: NO_ANSWER_MESSAGE.to_string(),
                citations: Vec::new(),
                confidence_score: final_confidence,
                retrieval_metadata: metadata,
                latency_ms: started.elapsed().as_millis() as i64,
                timestamp: Utc::now(),
            });
        }

        // 引用装配先于生成：元数据脱节在此上报
        let citations = self.assembler.assemble(&final_matches)?;

        let (context, dropped) = build_context(&final_matches, self.config.max_context_chars);
        metadata.context_citations_dropped = dropped;
        if dropped > 0 {
            warn!(
                dropped,
                max_context_chars = self.config.max_context_chars,
                "context exceeded generation input limit, dropped lowest-confidence citations"
            );
        }

        let answer = self
            .generate_with_budget(&req.query, &context, deadline)
            .await?;
        let (answer, unavailable) = match answer {
            Some(text) => (text, false),
            None => (ANSWER_UNAVAILABLE_MESSAGE.to_string(), true),
        };
        metadata.answer_unavailable = unavailable;

        let latency_ms = started.elapsed().as_millis() as i64;
        info!(
            attempts = metadata.attempts.len(),
            confidence = final_confidence,
            citations = citations.len(),
            low_confidence,
            latency_ms,
            "query completed"
        );

        Ok(QueryResponse {
            query: req.query,
            answer,
            citations: if include_citations {
                citations
            } else {
                Vec::new()
            },
            confidence_score: final_confidence,
            retrieval_metadata: metadata,
            latency_ms,
            timestamp: Utc::now(),
        })
    }

    /// 嵌入查询文本并校验维度
    async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let per_attempt = Duration::from_millis(self.config.per_attempt_timeout_ms);
        let embedded = tokio::time::timeout(
            per_attempt,
            self.embed_model.embed(&[query.to_string()]),
        )
        .await
        .map_err(|_| DqaError::Timeout {
            operation: "embed_query".to_string(),
            timeout_ms: self.config.per_attempt_timeout_ms,
        })??;

        let vector = embedded
            .into_iter()
            .next()
            .ok_or_else(|| DqaError::EmbeddingService {
                provider: "embed".to_string(),
                message: "provider returned no vector for query".to_string(),
                retry_after: None,
            })?;

        if vector.len() != self.config.embedding_dimension {
            return Err(DqaError::DimensionMismatch {
                expected: self.config.embedding_dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// 生成答案：限流恰好退避重试一次（独立于自校正预算），超时回退为仅检索结果
    async fn generate_with_budget(
        &self,
        query: &str,
        context: &str,
        deadline: Instant,
    ) -> Result<Option<String>> {
        let gen_timeout = Duration::from_millis(self.config.generation_timeout_ms);

        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Ok(None);
        };
        let budget = if remaining < gen_timeout { remaining } else { gen_timeout };

        let first = tokio::time::timeout(
            budget,
            self.chat_model.chat(SYSTEM_PROMPT, context, query),
        )
        .await;

        match first {
            Ok(Ok(text)) => Ok(Some(text)),
            Ok(Err(err @ DqaError::RateLimited { .. })) => {
                let backoff = err
                    .retry_after()
                    .unwrap_or(Duration::from_millis(500))
                    .min(Duration::from_secs(5));
                warn!(backoff_ms = backoff.as_millis() as u64, "generation rate limited, retrying once");
                tokio::time::sleep(backoff).await;

                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Ok(None);
                };
                match tokio::time::timeout(
                    remaining.min(gen_timeout),
                    self.chat_model.chat(SYSTEM_PROMPT, context, query),
                )
                .await
                {
                    Ok(Ok(text)) => Ok(Some(text)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Ok(None),
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// 组件健康检查
    pub async fn health_check(&self) -> Result<()> {
        self.index.health_check().await
    }
}

/// 以置信度降序拼装生成上下文；超出预算时先丢弃置信度最低的引用
fn build_context(matches: &[ScoredMatch], max_context_chars: usize) -> (String, usize) {
    let mut ordered: Vec<&ScoredMatch> = matches.iter().filter(|m| m.metadata.is_some()).collect();
    ordered.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.rank.cmp(&b.rank))
    });

    let mut total: usize = ordered
        .iter()
        .filter_map(|m| m.metadata.as_ref())
        .map(|meta| meta.text.chars().count())
        .sum();

    let mut dropped = 0usize;
    while total > max_context_chars && ordered.len() > 1 {
        if let Some(removed) = ordered.pop() {
            if let Some(meta) = &removed.metadata {
                total -= meta.text.chars().count();
            }
            dropped += 1;
        }
    }

    let mut parts = Vec::with_capacity(ordered.len());
    for (i, m) in ordered.iter().enumerate() {
        if let Some(meta) = &m.metadata {
            parts.push(format!(
                "[{}] (doc={} chunk={} score={:.3})\n{}",
                i + 1,
                meta.document_id,
                meta.chunk_index,
                m.confidence,
                meta.text
            ));
        }
    }
    let mut context = parts.join("\n\n");

    // 仅剩单条仍超预算时在字符边界截断
    if context.chars().count() > max_context_chars {
        context = context.chars().take(max_context_chars).collect();
    }
    (context, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityScale;
    use crate::index::{ChunkMetadata, IndexPoint, RetrievalMatch};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct MockEmbedModel {
        dimension: usize,
    }

    #[async_trait]
    impl EmbedModel for MockEmbedModel {
        async fn embed(&self, texts: &[String]) -> dqa_llm::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1; self.dimension]).collect())
        }
    }

    struct MockChatModel {
        calls: AtomicUsize,
        rate_limit_first: bool,
        contexts: Mutex<Vec<String>>,
    }

    impl MockChatModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                rate_limit_first: false,
                contexts: Mutex::new(Vec::new()),
            }
        }

        fn rate_limited_once() -> Self {
            Self {
                rate_limit_first: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ChatModel for MockChatModel {
        async fn chat(&self, _system: &str, context: &str, _user: &str) -> dqa_llm::Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().await.push(context.to_string());
            if self.rate_limit_first && call == 0 {
                return Err(DqaError::RateLimited {
                    provider: "mock".to_string(),
                    retry_after: Some(Duration::from_millis(10)),
                });
            }
            Ok("Grounded answer [1]".to_string())
        }
    }

    struct SeqIndex {
        responses: Mutex<VecDeque<Vec<RetrievalMatch>>>,
        top_ks: Mutex<Vec<usize>>,
    }

    impl SeqIndex {
        fn new(responses: Vec<Vec<RetrievalMatch>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                top_ks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for SeqIndex {
        async fn upsert(&self, _points: Vec<IndexPoint>) -> Result<()> {
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            top_k: usize,
            _filter: Option<&serde_json::Value>,
        ) -> Result<Vec<RetrievalMatch>> {
            self.top_ks.lock().await.push(top_k);
            Ok(self.responses.lock().await.pop_front().unwrap_or_default())
        }

        async fn delete_document(&self, _document_id: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn matches_with_scores(scores: &[f32]) -> Vec<RetrievalMatch> {
        matches_with_texts(&scores.iter().map(|s| (*s, "chunk text")).collect::<Vec<_>>())
    }

    fn matches_with_texts(entries: &[(f32, &str)]) -> Vec<RetrievalMatch> {
        entries
            .iter()
            .enumerate()
            .map(|(i, (score, text))| RetrievalMatch {
                chunk_id: format!("doc1_{}", i),
                similarity: *score,
                metadata: Some(ChunkMetadata {
                    document_id: "doc1".to_string(),
                    chunk_id: format!("doc1_{}", i),
                    chunk_index: i as i32,
                    text: text.to_string(),
                    filename: Some("notes.txt".to_string()),
                    page: None,
                    start_offset: 0,
                    end_offset: text.len() as i32,
                }),
            })
            .collect()
    }

    fn test_config() -> RetrievalConfig {
        RetrievalConfig {
            embedding_dimension: 4,
            similarity_scale: SimilarityScale::Normalized,
            ..Default::default()
        }
    }

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            top_k: None,
            confidence_threshold: None,
            include_citations: None,
            max_retries: None,
            filters: None,
        }
    }

    fn orchestrator(
        index: Arc<SeqIndex>,
        chat: Arc<MockChatModel>,
        config: RetrievalConfig,
    ) -> QueryOrchestrator {
        QueryOrchestrator::new(
            Arc::new(MockEmbedModel {
                dimension: config.embedding_dimension,
            }),
            chat,
            index,
            config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_confident_first_attempt_answers_with_citations() {
        let index = Arc::new(SeqIndex::new(vec![matches_with_scores(&[0.9, 0.85, 0.8])]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index.clone(), chat.clone(), test_config());

        let resp = orch.query(request("what is the report about?")).await.unwrap();

        assert_eq!(resp.answer, "Grounded answer [1]");
        assert_eq!(resp.citations.len(), 3);
        assert!(resp.citations.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(resp.retrieval_metadata.attempts.len(), 1);
        assert!(!resp.retrieval_metadata.low_confidence);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_retries_with_escalated_params() {
        let index = Arc::new(SeqIndex::new(vec![
            matches_with_scores(&[0.9, 0.6, 0.5]),
            matches_with_scores(&[0.9, 0.85, 0.8]),
        ]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index.clone(), chat.clone(), test_config());

        let resp = orch.query(request("escalation question")).await.unwrap();

        let attempts = &resp.retrieval_metadata.attempts;
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].top_k_used, 5);
        assert!((attempts[0].threshold_used - 0.7).abs() < 1e-6);
        assert_eq!(attempts[1].top_k_used, 10);
        assert!((attempts[1].threshold_used - 0.65).abs() < 1e-6);
        assert_eq!(*index.top_ks.lock().await, vec![5, 10]);
        assert!(!resp.retrieval_metadata.low_confidence);
    }

    #[tokio::test]
    async fn test_exhaustion_with_no_accepted_matches_skips_generation() {
        let index = Arc::new(SeqIndex::new(vec![
            matches_with_scores(&[0.4, 0.3]),
            matches_with_scores(&[0.45, 0.35]),
            matches_with_scores(&[0.42, 0.30]),
        ]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index.clone(), chat.clone(), test_config());

        let resp = orch.query(request("unanswerable question")).await.unwrap();

        assert!(resp.citations.is_empty());
        assert!(resp.retrieval_metadata.low_confidence);
        assert_eq!(resp.retrieval_metadata.attempts.len(), 3);
        // 最优一轮为第二轮均值 0.4
        assert!((resp.confidence_score - 0.4).abs() < 1e-6);
        assert_eq!(chat.calls.load(Ordering::SeqCst), 0);
        assert_eq!(resp.answer, NO_ANSWER_MESSAGE);
    }

    #[tokio::test]
    async fn test_exhaustion_with_partial_matches_still_answers() {
        // 每轮均有个别匹配过阈但整体置信度不足：耗尽后用最优一轮作答并标记低置信度
        let index = Arc::new(SeqIndex::new(vec![
            matches_with_scores(&[0.75, 0.2, 0.1]),
            matches_with_scores(&[0.8, 0.25, 0.1]),
            matches_with_scores(&[0.72, 0.2, 0.1]),
        ]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index.clone(), chat.clone(), test_config());

        let resp = orch.query(request("partially answerable")).await.unwrap();

        assert!(resp.retrieval_metadata.low_confidence);
        assert!(!resp.citations.is_empty());
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resp.retrieval_metadata.attempts.len(), 3);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_rejected() {
        let index = Arc::new(SeqIndex::new(vec![matches_with_scores(&[0.9])]));
        let chat = Arc::new(MockChatModel::new());
        let mut config = test_config();
        config.embedding_dimension = 8;
        let orch = QueryOrchestrator::new(
            Arc::new(MockEmbedModel { dimension: 4 }),
            chat,
            index,
            config,
        )
        .unwrap();

        let err = orch.query(request("any")).await.unwrap_err();
        assert!(matches!(
            err,
            DqaError::DimensionMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_generation_retried_exactly_once() {
        let index = Arc::new(SeqIndex::new(vec![matches_with_scores(&[0.9, 0.8])]));
        let chat = Arc::new(MockChatModel::rate_limited_once());
        let orch = orchestrator(index, chat.clone(), test_config());

        let resp = orch.query(request("rate limited question")).await.unwrap();

        assert_eq!(resp.answer, "Grounded answer [1]");
        assert_eq!(chat.calls.load(Ordering::SeqCst), 2);
        assert!(!resp.retrieval_metadata.answer_unavailable);
    }

    #[tokio::test]
    async fn test_include_citations_false_omits_citations() {
        let index = Arc::new(SeqIndex::new(vec![matches_with_scores(&[0.9, 0.8])]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index, chat.clone(), test_config());

        let mut req = request("no citations please");
        req.include_citations = Some(false);
        let resp = orch.query(req).await.unwrap();

        assert!(resp.citations.is_empty());
        assert_eq!(resp.answer, "Grounded answer [1]");
        assert_eq!(chat.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let index = Arc::new(SeqIndex::new(vec![]));
        let chat = Arc::new(MockChatModel::new());
        let orch = orchestrator(index, chat, test_config());

        let err = orch.query(request("   ")).await.unwrap_err();
        assert!(matches!(err, DqaError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_context_budget_drops_lowest_confidence_first() {
        let long_a = "a".repeat(600);
        let long_b = "b".repeat(600);
        let long_c = "c".repeat(600);
        let index = Arc::new(SeqIndex::new(vec![matches_with_texts(&[
            (0.95, long_a.as_str()),
            (0.9, long_b.as_str()),
            (0.85, long_c.as_str()),
        ])]));
        let chat = Arc::new(MockChatModel::new());
        let mut config = test_config();
        config.max_context_chars = 1400;
        let orch = orchestrator(index, chat.clone(), config);

        let resp = orch.query(request("budget question")).await.unwrap();

        assert_eq!(resp.retrieval_metadata.context_citations_dropped, 1);
        // 响应中的引用不受上下文裁剪影响
        assert_eq!(resp.citations.len(), 3);
        let contexts = chat.contexts.lock().await;
        assert!(contexts[0].contains(&long_a));
        assert!(!contexts[0].contains(&long_c));
    }

    #[test]
    fn test_build_context_keeps_single_oversized_entry_truncated() {
        let matches = matches_with_texts(&[(0.9, "x")]);
        let scorer = ConfidenceScorer::new(SimilarityScale::Normalized);
        let outcome = scorer.score(&matches, 0.5);
        let huge: Vec<ScoredMatch> = outcome
            .matches
            .into_iter()
            .map(|mut m| {
                if let Some(meta) = m.metadata.as_mut() {
                    meta.text = "y".repeat(5000);
                }
                m
            })
            .collect();
        let (context, dropped) = build_context(&huge, 1000);
        assert_eq!(dropped, 0);
        assert_eq!(context.chars().count(), 1000);
    }
}
