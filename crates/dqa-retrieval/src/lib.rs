pub mod chunker;
pub mod citation;
pub mod config;
pub mod controller;
pub mod index;
pub mod ingest;
pub mod orchestrator;
pub mod scorer;

// 重新导出核心构件
pub use chunker::Chunker;
pub use citation::CitationAssembler;
pub use config::{RetrievalConfig, SimilarityScale};
pub use controller::{
    Decision, EscalationPolicy, RetrievalParams, RetryState, SelfCorrectionController,
};
pub use index::{ChunkMetadata, IndexPoint, MemoryVectorIndex, QdrantVectorIndex, RetrievalMatch, VectorIndex};
pub use ingest::{DocumentStore, IngestionPipeline};
pub use orchestrator::QueryOrchestrator;
pub use scorer::{ConfidenceScorer, ScoreOutcome, ScoredMatch};

// 重新导出共享类型
pub use dqa_core::{Citation, Document, DocumentStatus, IngestReport, QueryRequest, QueryResponse};
pub use dqa_error::{DqaError, Result};
