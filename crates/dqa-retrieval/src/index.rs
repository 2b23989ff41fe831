use async_trait::async_trait;
use dqa_error::{DqaError, Result};
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointStruct, QueryPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 块元数据快照，随向量一同写入索引
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i32,
    pub text: String,
    pub filename: Option<String>,
    pub page: Option<i32>,
    pub start_offset: i32,
    pub end_offset: i32,
}

/// 待写入索引的向量点
#[derive(Debug, Clone)]
pub struct IndexPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// 相似度检索的临时结果，查询结束即丢弃
#[derive(Debug, Clone)]
pub struct RetrievalMatch {
    pub chunk_id: String,
    /// 提供商标度下的原始相似度
    pub similarity: f32,
    /// 元数据快照；缺失说明索引与元数据脱节，由装配器上报
    pub metadata: Option<ChunkMetadata>,
}

/// 向量索引能力抽象，后端由配置选择
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()>;

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<RetrievalMatch>>;

    /// 级联删除：移除某文档的全部块，返回移除数量
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn qdrant_string(value: &QdrantValue) -> Option<String> {
    match &value.kind {
        Some(qdrant_client::qdrant::value::Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn filter_document_id(filter: Option<&serde_json::Value>) -> Option<String> {
    filter
        .and_then(|f| f.get("document_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

// ========== 内存后端 ==========

/// 进程内余弦相似度索引
pub struct MemoryVectorIndex {
    points: RwLock<Vec<IndexPoint>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(Vec::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.points.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.points.read().await.is_empty()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let mut dot_product = 0.0;
        let mut norm_a = 0.0;
        let mut norm_b = 0.0;

        let len = a.len().min(b.len());
        for i in 0..len {
            dot_product += a[i] * b[i];
            norm_a += a[i] * a[i];
            norm_b += b[i] * b[i];
        }

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a.sqrt() * norm_b.sqrt())
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, new_points: Vec<IndexPoint>) -> Result<()> {
        let mut points = self.points.write().await;
        for incoming in new_points {
            points.retain(|p| p.id != incoming.id);
            points.push(incoming);
        }
        Ok(())
    }

    #[instrument(skip(self, vector))]
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<RetrievalMatch>> {
        let points = self.points.read().await;
        let document_filter = filter_document_id(filter);

        let mut scored: Vec<(f32, &IndexPoint)> = points
            .iter()
            .filter(|p| {
                document_filter
                    .as_deref()
                    .map(|d| p.metadata.document_id == d)
                    .unwrap_or(true)
            })
            .map(|p| (Self::cosine_similarity(vector, &p.vector), p))
            .collect();

        // 相似度降序排序后截取 top-k
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(similarity, p)| RetrievalMatch {
                chunk_id: p.metadata.chunk_id.clone(),
                similarity,
                metadata: Some(p.metadata.clone()),
            })
            .collect())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut points = self.points.write().await;
        let before = points.len();
        points.retain(|p| p.metadata.document_id != document_id);
        let removed = before - points.len();
        info!(document_id = %document_id, removed, "removed document chunks from memory index");
        Ok(removed)
    }
}

// ========== Qdrant 后端 ==========

/// Qdrant 向量索引
pub struct QdrantVectorIndex {
    client: Qdrant,
    collection_name: String,
}

impl QdrantVectorIndex {
    /// 连接 Qdrant 并确保 collection 以配置维度与余弦距离存在
    pub async fn connect(url: &str, collection_name: String, dimension: usize) -> Result<Self> {
        let client = Qdrant::from_url(url).build()?;

        if !client.collection_exists(&collection_name).await? {
            client
                .create_collection(
                    CreateCollectionBuilder::new(&collection_name).vectors_config(
                        VectorParamsBuilder::new(dimension as u64, Distance::Cosine).build(),
                    ),
                )
                .await?;
            info!(collection = %collection_name, dimension, "created qdrant collection");
        }

        Ok(Self {
            client,
            collection_name,
        })
    }

    // chunk_id 不是合法的 point id，稳定映射到 UUIDv5 使重复写入幂等
    fn point_id(chunk_id: &str) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, chunk_id.as_bytes()).to_string()
    }

    fn payload_of(metadata: &ChunkMetadata) -> Result<HashMap<String, QdrantValue>> {
        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert(
            "document_id".to_string(),
            QdrantValue::from(metadata.document_id.clone()),
        );
        payload.insert(
            "chunk_id".to_string(),
            QdrantValue::from(metadata.chunk_id.clone()),
        );
        payload.insert(
            "metadata".to_string(),
            QdrantValue::from(serde_json::to_string(metadata)?),
        );
        Ok(payload)
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    #[instrument(skip(self, points))]
    async fn upsert(&self, points: Vec<IndexPoint>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let mut qdrant_points = Vec::with_capacity(points.len());
        for point in &points {
            qdrant_points.push(PointStruct::new(
                Self::point_id(&point.id),
                point.vector.clone(),
                Self::payload_of(&point.metadata)?,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, qdrant_points).wait(true))
            .await?;

        info!(
            collection = %self.collection_name,
            count = points.len(),
            "upserted vectors"
        );
        Ok(())
    }

    #[instrument(skip(self, vector))]
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&serde_json::Value>,
    ) -> Result<Vec<RetrievalMatch>> {
        let mut builder = QueryPointsBuilder::new(&self.collection_name)
            .query(vector.to_vec())
            .limit(top_k as u64)
            .with_payload(true);

        if let Some(document_id) = filter_document_id(filter) {
            builder = builder.filter(Filter::must([Condition::matches(
                "document_id",
                document_id,
            )]));
        }

        let response = self.client.query(builder).await?;

        let matches = response
            .result
            .into_iter()
            .map(|point| {
                let chunk_id = point
                    .payload
                    .get("chunk_id")
                    .and_then(qdrant_string)
                    .unwrap_or_default();
                let metadata = point
                    .payload
                    .get("metadata")
                    .and_then(qdrant_string)
                    .and_then(|raw| serde_json::from_str::<ChunkMetadata>(&raw).ok());
                if metadata.is_none() {
                    warn!(chunk_id = %chunk_id, "retrieval match carries no resolvable metadata");
                }
                RetrievalMatch {
                    chunk_id,
                    similarity: point.score,
                    metadata,
                }
            })
            .collect();

        Ok(matches)
    }

    #[instrument(skip(self))]
    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let filter = Filter::must([Condition::matches(
            "document_id",
            document_id.to_string(),
        )]);

        let count = self
            .client
            .count(
                CountPointsBuilder::new(&self.collection_name)
                    .filter(filter.clone())
                    .exact(true),
            )
            .await?
            .result
            .map(|r| r.count as usize)
            .unwrap_or(0);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await?;

        info!(document_id = %document_id, removed = count, "removed document chunks from qdrant");
        Ok(count)
    }

    async fn health_check(&self) -> Result<()> {
        let exists = self.client.collection_exists(&self.collection_name).await?;
        if exists {
            Ok(())
        } else {
            Err(DqaError::IndexService {
                operation: "collection_exists".to_string(),
                message: format!("collection {} is missing", self.collection_name),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(document_id: &str, chunk_id: &str, text: &str) -> ChunkMetadata {
        ChunkMetadata {
            document_id: document_id.to_string(),
            chunk_id: chunk_id.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            filename: None,
            page: None,
            start_offset: 0,
            end_offset: text.len() as i32,
        }
    }

    fn point(document_id: &str, chunk_id: &str, vector: Vec<f32>) -> IndexPoint {
        IndexPoint {
            id: chunk_id.to_string(),
            vector,
            metadata: meta(document_id, chunk_id, "text"),
        }
    }

    #[tokio::test]
    async fn test_memory_query_ranks_by_similarity() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                point("doc1", "doc1_0", vec![1.0, 0.0, 0.0]),
                point("doc1", "doc1_1", vec![0.0, 1.0, 0.0]),
                point("doc2", "doc2_0", vec![0.9, 0.1, 0.0]),
            ])
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0, 0.0], 2, None).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].chunk_id, "doc1_0");
        assert!(matches[0].similarity >= matches[1].similarity);
    }

    #[tokio::test]
    async fn test_memory_document_filter() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                point("doc1", "doc1_0", vec![1.0, 0.0]),
                point("doc2", "doc2_0", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let filter = serde_json::json!({ "document_id": "doc2" });
        let matches = index.query(&[1.0, 0.0], 10, Some(&filter)).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk_id, "doc2_0");
    }

    #[tokio::test]
    async fn test_memory_upsert_replaces_existing_id() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![point("doc1", "doc1_0", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(vec![point("doc1", "doc1_0", vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(index.len().await, 1);
        let matches = index.query(&[0.0, 1.0], 1, None).await.unwrap();
        assert!(matches[0].similarity > 0.99);
    }

    #[tokio::test]
    async fn test_memory_delete_document_cascades() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                point("doc1", "doc1_0", vec![1.0, 0.0]),
                point("doc1", "doc1_1", vec![0.0, 1.0]),
                point("doc2", "doc2_0", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let removed = index.delete_document("doc1").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.len().await, 1);
    }

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(
            QdrantVectorIndex::point_id("doc1_0"),
            QdrantVectorIndex::point_id("doc1_0")
        );
        assert_ne!(
            QdrantVectorIndex::point_id("doc1_0"),
            QdrantVectorIndex::point_id("doc1_1")
        );
    }
}
