use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub byte_size: u64,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    pub ingested_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i32,
    pub text: String,
    pub start_offset: i32,
    pub end_offset: i32,
    pub page: Option<i32>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub confidence_threshold: Option<f32>,
    pub include_citations: Option<bool>,
    pub max_retries: Option<u32>,
    pub filters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i32,
    pub position: usize,
    pub filename: Option<String>,
    pub page: Option<i32>,
    pub score: f32,
    pub snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub top_k_used: usize,
    pub threshold_used: f32,
    pub overall_confidence: f32,
    pub accepted_count: usize,
    pub total_returned: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub attempts: Vec<AttemptRecord>,
    pub final_top_k: usize,
    pub final_threshold: f32,
    pub total_retrieved: usize,
    pub accepted_count: usize,
    pub low_confidence: bool,
    pub answer_unavailable: bool,
    pub context_citations_dropped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence_score: f32,
    pub retrieval_metadata: RetrievalMetadata,
    pub latency_ms: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub document_id: String,
    pub status: DocumentStatus,
    pub chunks_created: usize,
    pub message: String,
}

pub use dqa_error::{DqaError as Error, Result};
