use crate::chunker::Chunker;
use crate::config::RetrievalConfig;
use crate::index::{ChunkMetadata, IndexPoint, VectorIndex};
use chrono::Utc;
use dqa_core::{Chunk, Document, DocumentStatus, IngestReport};
use dqa_error::{DqaError, Result};
use dqa_llm::EmbedModel;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, instrument};

/// 文档注册表（内存实现），负责状态流转 pending → processing → processed|failed
pub struct DocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, document_id: &str, filename: &str, byte_size: u64) {
        let mut documents = self.documents.write().await;
        documents.insert(
            document_id.to_string(),
            Document {
                id: document_id.to_string(),
                filename: filename.to_string(),
                byte_size,
                status: DocumentStatus::Pending,
                chunk_count: 0,
                ingested_at: Utc::now(),
                error: None,
            },
        );
    }

    pub async fn set_processing(&self, document_id: &str) {
        let mut documents = self.documents.write().await;
        if let Some(doc) = documents.get_mut(document_id) {
            doc.status = DocumentStatus::Processing;
        }
    }

    pub async fn set_processed(&self, document_id: &str, chunk_count: usize) {
        let mut documents = self.documents.write().await;
        if let Some(doc) = documents.get_mut(document_id) {
            doc.status = DocumentStatus::Processed;
            doc.chunk_count = chunk_count;
            doc.error = None;
        }
    }

    pub async fn set_failed(&self, document_id: &str, error: String) {
        let mut documents = self.documents.write().await;
        if let Some(doc) = documents.get_mut(document_id) {
            doc.status = DocumentStatus::Failed;
            doc.error = Some(error);
        }
    }

    pub async fn get(&self, document_id: &str) -> Option<Document> {
        self.documents.read().await.get(document_id).cloned()
    }

    pub async fn remove(&self, document_id: &str) -> Option<Document> {
        self.documents.write().await.remove(document_id)
    }

    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// 摄取流水线：切分 → 并发嵌入（按序重组）→ 索引写入
pub struct IngestionPipeline {
    chunker: Chunker,
    embed_model: Arc<dyn EmbedModel>,
    index: Arc<dyn VectorIndex>,
    store: Arc<DocumentStore>,
    config: RetrievalConfig,
}

impl IngestionPipeline {
    pub fn new(
        embed_model: Arc<dyn EmbedModel>,
        index: Arc<dyn VectorIndex>,
        store: Arc<DocumentStore>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        config.validate()?;
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)?;
        Ok(Self {
            chunker,
            embed_model,
            index,
            store,
            config,
        })
    }

    /// 摄取一份原始文本文档
    #[instrument(skip(self, raw_text), fields(document_id = %document_id))]
    pub async fn ingest(
        &self,
        document_id: &str,
        filename: &str,
        raw_text: &str,
    ) -> Result<IngestReport> {
        self.store
            .register(document_id, filename, raw_text.len() as u64)
            .await;
        self.store.set_processing(document_id).await;

        let chunks = self.chunker.chunk(document_id, raw_text);
        if chunks.is_empty() {
            let reason = "no chunks created from document text".to_string();
            self.store.set_failed(document_id, reason.clone()).await;
            return Err(DqaError::InvalidRequest { reason });
        }

        match self.embed_and_upsert(filename, &chunks).await {
            Ok(()) => {
                self.store.set_processed(document_id, chunks.len()).await;
                info!(chunks = chunks.len(), "document ingested");
                Ok(IngestReport {
                    document_id: document_id.to_string(),
                    status: DocumentStatus::Processed,
                    chunks_created: chunks.len(),
                    message: format!("document ingested with {} chunks", chunks.len()),
                })
            }
            Err(e) => {
                self.store.set_failed(document_id, e.to_string()).await;
                Err(e)
            }
        }
    }

    /// 并发嵌入各批次，按原始批次序重组后写入索引
    async fn embed_and_upsert(&self, filename: &str, chunks: &[Chunk]) -> Result<()> {
        let batches: Vec<Vec<String>> = chunks
            .chunks(self.config.embed_batch_size)
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();
        let batch_count = batches.len();

        let semaphore = Arc::new(Semaphore::new(self.config.embed_concurrency));
        let mut join_set = JoinSet::new();
        for (batch_index, batch) in batches.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let embed_model = self.embed_model.clone();
            join_set.spawn(async move {
                let _permit =
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| DqaError::Concurrency {
                            operation: "embed_semaphore".to_string(),
                            message: e.to_string(),
                        })?;
                let vectors = embed_model.embed(&batch).await?;
                Ok::<(usize, Vec<Vec<f32>>), DqaError>((batch_index, vectors))
            });
        }

        // 完成序不可依赖：结果按批次序落槽
        let mut slots: Vec<Option<Vec<Vec<f32>>>> = vec![None; batch_count];
        while let Some(joined) = join_set.join_next().await {
            let (batch_index, vectors) = joined??;
            slots[batch_index] = Some(vectors);
        }

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for slot in slots {
            let vectors = slot.ok_or_else(|| DqaError::Internal {
                message: "embedding batch produced no result".to_string(),
                details: None,
            })?;
            embeddings.extend(vectors);
        }

        if embeddings.len() != chunks.len() {
            return Err(DqaError::EmbeddingService {
                provider: "embed".to_string(),
                message: format!(
                    "expected {} vectors, provider returned {}",
                    chunks.len(),
                    embeddings.len()
                ),
                retry_after: None,
            });
        }

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(embeddings) {
            if vector.len() != self.config.embedding_dimension {
                return Err(DqaError::DimensionMismatch {
                    expected: self.config.embedding_dimension,
                    actual: vector.len(),
                });
            }
            points.push(IndexPoint {
                id: chunk.chunk_id.clone(),
                vector,
                metadata: ChunkMetadata {
                    document_id: chunk.document_id.clone(),
                    chunk_id: chunk.chunk_id.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    filename: Some(filename.to_string()),
                    page: chunk.page,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                },
            });
        }

        self.index.upsert(points).await
    }

    /// 查询文档状态
    pub async fn get_document_status(&self, document_id: &str) -> Result<Document> {
        self.store
            .get(document_id)
            .await
            .ok_or_else(|| DqaError::NotFound {
                resource: format!("document {}", document_id),
            })
    }

    /// 删除文档并级联移除其全部块
    #[instrument(skip(self))]
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        if self.store.remove(document_id).await.is_none() {
            return Err(DqaError::NotFound {
                resource: format!("document {}", document_id),
            });
        }
        let removed = self.index.delete_document(document_id).await?;
        info!(removed, "document deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityScale;
    use crate::index::MemoryVectorIndex;
    use async_trait::async_trait;
    use std::time::Duration;

    // 数字越小休眠越久：后面的批次先完成，校验按序重组
    struct SlowFirstEmbedModel {
        dimension: usize,
    }

    #[async_trait]
    impl EmbedModel for SlowFirstEmbedModel {
        async fn embed(&self, texts: &[String]) -> dqa_llm::Result<Vec<Vec<f32>>> {
            let ordinal = texts
                .first()
                .and_then(|t| {
                    t.chars()
                        .filter(|c| c.is_ascii_digit())
                        .collect::<String>()
                        .parse::<u64>()
                        .ok()
                })
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(40u64.saturating_sub(ordinal * 10))).await;

            // 独热编码批次序号，余弦相似度可区分
            Ok(texts
                .iter()
                .map(|_| {
                    let mut v = vec![0.0; self.dimension];
                    v[ordinal as usize % self.dimension] = 1.0;
                    v
                })
                .collect())
        }
    }

    struct FixedEmbedModel {
        dimension: usize,
    }

    #[async_trait]
    impl EmbedModel for FixedEmbedModel {
        async fn embed(&self, texts: &[String]) -> dqa_llm::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }
    }

    fn test_config() -> RetrievalConfig {
        RetrievalConfig {
            chunk_size: 60,
            chunk_overlap: 10,
            embedding_dimension: 4,
            embed_batch_size: 1,
            embed_concurrency: 4,
            similarity_scale: SimilarityScale::Normalized,
            ..Default::default()
        }
    }

    fn pipeline_with(
        embed: Arc<dyn EmbedModel>,
        index: Arc<MemoryVectorIndex>,
        config: RetrievalConfig,
    ) -> (IngestionPipeline, Arc<DocumentStore>) {
        let store = Arc::new(DocumentStore::new());
        let pipeline = IngestionPipeline::new(embed, index, store.clone(), config).unwrap();
        (pipeline, store)
    }

    #[tokio::test]
    async fn test_ingest_chunks_embeds_and_upserts() {
        let index = Arc::new(MemoryVectorIndex::new());
        let (pipeline, store) = pipeline_with(
            Arc::new(FixedEmbedModel { dimension: 4 }),
            index.clone(),
            test_config(),
        );

        let text = "The ledger was reconciled in March. The audit found no issues. \
                    Budget planning resumed in April. Forecasts improved steadily.";
        let report = pipeline.ingest("doc1", "ledger.txt", text).await.unwrap();

        assert_eq!(report.status, DocumentStatus::Processed);
        assert!(report.chunks_created > 1);
        assert_eq!(index.len().await, report.chunks_created);

        let doc = store.get("doc1").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.chunk_count, report.chunks_created);
        assert_eq!(doc.filename, "ledger.txt");
    }

    #[tokio::test]
    async fn test_ingest_empty_text_marks_failed() {
        let index = Arc::new(MemoryVectorIndex::new());
        let (pipeline, store) = pipeline_with(
            Arc::new(FixedEmbedModel { dimension: 4 }),
            index,
            test_config(),
        );

        let err = pipeline.ingest("doc1", "empty.txt", "   ").await.unwrap_err();
        assert!(matches!(err, DqaError::InvalidRequest { .. }));
        assert_eq!(
            store.get("doc1").await.unwrap().status,
            DocumentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_embeddings_reassembled_by_chunk_ordinal() {
        let index = Arc::new(MemoryVectorIndex::new());
        let (pipeline, _store) = pipeline_with(
            Arc::new(SlowFirstEmbedModel { dimension: 4 }),
            index.clone(),
            test_config(),
        );

        // 每句一块一批；批 0 最慢，完成序与批次序相反
        let text = "Sentence number 0 closes here. Sentence number 1 closes here. \
                    Sentence number 2 closes here. Sentence number 3 closes here.";
        let report = pipeline.ingest("doc1", "ordered.txt", text).await.unwrap();
        assert_eq!(report.chunks_created, 4);

        // 向量独热分量编码批次序，查询命中应与块序号一致
        for ordinal in 0..4usize {
            let mut probe = vec![0.0; 4];
            probe[ordinal] = 1.0;
            let matches = index.query(&probe, 1, None).await.unwrap();
            assert_eq!(matches[0].metadata.as_ref().unwrap().chunk_index, ordinal as i32);
        }
    }

    #[tokio::test]
    async fn test_dimension_mismatch_marks_document_failed() {
        let index = Arc::new(MemoryVectorIndex::new());
        let mut config = test_config();
        config.embedding_dimension = 16;
        let (pipeline, store) = pipeline_with(
            Arc::new(FixedEmbedModel { dimension: 4 }),
            index,
            config,
        );

        let err = pipeline
            .ingest("doc1", "bad.txt", "A sentence to embed.")
            .await
            .unwrap_err();
        assert!(matches!(err, DqaError::DimensionMismatch { expected: 16, actual: 4 }));
        assert_eq!(
            store.get("doc1").await.unwrap().status,
            DocumentStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_document_status_lookup() {
        let index = Arc::new(MemoryVectorIndex::new());
        let (pipeline, _store) = pipeline_with(
            Arc::new(FixedEmbedModel { dimension: 4 }),
            index,
            test_config(),
        );

        pipeline
            .ingest("doc1", "a.txt", "One sentence of content here.")
            .await
            .unwrap();

        let doc = pipeline.get_document_status("doc1").await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);

        let err = pipeline.get_document_status("missing").await.unwrap_err();
        assert!(matches!(err, DqaError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_document_cascades_to_index() {
        let index = Arc::new(MemoryVectorIndex::new());
        let (pipeline, store) = pipeline_with(
            Arc::new(FixedEmbedModel { dimension: 4 }),
            index.clone(),
            test_config(),
        );

        pipeline
            .ingest("doc1", "a.txt", "First sentence here. Second sentence follows here.")
            .await
            .unwrap();
        let chunk_count = index.len().await;
        assert!(chunk_count > 0);

        let removed = pipeline.delete_document("doc1").await.unwrap();
        assert_eq!(removed, chunk_count);
        assert_eq!(index.len().await, 0);
        assert!(store.get("doc1").await.is_none());

        let err = pipeline.delete_document("doc1").await.unwrap_err();
        assert!(matches!(err, DqaError::NotFound { .. }));
    }
}
