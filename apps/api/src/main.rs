use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use dotenv::dotenv;
use dqa_core::{IngestReport, QueryRequest, QueryResponse};
use dqa_error::DqaError;
use dqa_llm::{make_providers, ChatProviderConfig, EmbedProviderConfig};
use dqa_retrieval::{
    DocumentStore, IngestionPipeline, MemoryVectorIndex, QdrantVectorIndex, QueryOrchestrator,
    RetrievalConfig, VectorIndex,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<QueryOrchestrator>,
    pipeline: Arc<IngestionPipeline>,
}

#[derive(Debug, Deserialize)]
struct AppConfig {
    server: ServerCfg,
    chat_provider: ChatCfgYaml,
    embedding_provider: EmbedCfgYaml,
    vector_store: VectorStoreCfg,
    #[serde(default)]
    retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize)]
struct ServerCfg {
    host: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct ChatCfgYaml {
    kind: String,
    base_url: Option<String>,
    api_key_env: Option<String>,
    api_url: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbedCfgYaml {
    kind: String,
    base_url: Option<String>,
    api_key_env: Option<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct VectorStoreCfg {
    kind: String,
    url: Option<String>,
    collection: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg = load_config()?;
    cfg.retrieval
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid retrieval config: {}", e))?;

    // Build providers
    let chat_cfg = match cfg.chat_provider.kind.as_str() {
        "openai_compat" => ChatProviderConfig::OpenAiCompat {
            base_url: cfg
                .chat_provider
                .base_url
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(
                &cfg.chat_provider
                    .api_key_env
                    .unwrap_or_else(|| "OPENAI_API_KEY".into()),
            )?,
            model: cfg.chat_provider.model,
        },
        "anthropic" => ChatProviderConfig::Anthropic {
            api_url: cfg.chat_provider.api_url,
            api_key: read_env(
                &cfg.chat_provider
                    .api_key_env
                    .unwrap_or_else(|| "ANTHROPIC_API_KEY".into()),
            )?,
            model: cfg.chat_provider.model,
        },
        other => anyhow::bail!("unsupported chat provider kind={}", other),
    };

    let embed_cfg = match cfg.embedding_provider.kind.as_str() {
        "openai_compat" => EmbedProviderConfig::OpenAiCompat {
            base_url: cfg
                .embedding_provider
                .base_url
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(
                &cfg.embedding_provider
                    .api_key_env
                    .unwrap_or_else(|| "OPENAI_API_KEY".into()),
            )?,
            model: cfg.embedding_provider.model,
        },
        other => anyhow::bail!("unsupported embedding provider kind={}", other),
    };

    let providers = make_providers(chat_cfg, embed_cfg)?;
    let chat_model: Arc<dyn dqa_llm::ChatModel> = Arc::from(providers.chat);
    let embed_model: Arc<dyn dqa_llm::EmbedModel> = Arc::from(providers.embed);

    // 按配置选择索引后端，核心逻辑对后端无感知
    let index: Arc<dyn VectorIndex> = match cfg.vector_store.kind.as_str() {
        "memory" => Arc::new(MemoryVectorIndex::new()),
        "qdrant" => {
            let url = cfg
                .vector_store
                .url
                .ok_or_else(|| anyhow::anyhow!("vector_store.url required for qdrant"))?;
            let collection = cfg
                .vector_store
                .collection
                .unwrap_or_else(|| "dqa-chunks".into());
            Arc::new(
                QdrantVectorIndex::connect(&url, collection, cfg.retrieval.embedding_dimension)
                    .await?,
            )
        }
        other => anyhow::bail!("unsupported vector store kind={}", other),
    };

    let store = Arc::new(DocumentStore::new());
    let orchestrator = Arc::new(QueryOrchestrator::new(
        embed_model.clone(),
        chat_model,
        index.clone(),
        cfg.retrieval.clone(),
    )?);
    let pipeline = Arc::new(IngestionPipeline::new(
        embed_model,
        index,
        store,
        cfg.retrieval,
    )?);

    let state = AppState {
        orchestrator,
        pipeline,
    };

    let app = Router::new()
        .route("/api/v1/query", post(query))
        .route("/api/v1/documents/text", post(ingest_text))
        .route(
            "/api/v1/documents/:document_id",
            get(document_status).delete(delete_document),
        )
        .route("/api/v1/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "dqa-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config() -> anyhow::Result<AppConfig> {
    let path =
        std::env::var("DQA_CONFIG").unwrap_or_else(|_| "configs/default.yaml".to_string());
    let s = std::fs::read_to_string(&path)?;
    let cfg: AppConfig = serde_yaml::from_str(&s)?;
    info!(config = %path, "loaded configuration");
    Ok(cfg)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}

async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, DqaError> {
    let resp = state.orchestrator.query(req).await.map_err(|e| {
        match e.severity() {
            dqa_error::ErrorSeverity::Low => tracing::warn!(error = %e, "query rejected"),
            _ => tracing::error!(error = %e, stage = ?e.stage(), "query failed"),
        }
        e
    })?;
    Ok(Json(resp))
}

#[derive(Deserialize)]
struct IngestTextReq {
    document_id: Option<String>,
    filename: Option<String>,
    text: String,
}

async fn ingest_text(
    State(state): State<AppState>,
    Json(req): Json<IngestTextReq>,
) -> Result<Json<IngestReport>, DqaError> {
    let document_id = req
        .document_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let filename = req.filename.unwrap_or_else(|| "raw.txt".to_string());
    let report = state
        .pipeline
        .ingest(&document_id, &filename, &req.text)
        .await?;
    Ok(Json(report))
}

async fn document_status(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>, DqaError> {
    let doc = state.pipeline.get_document_status(&document_id).await?;
    Ok(Json(serde_json::json!({
        "document_id": doc.id,
        "status": doc.status,
        "chunks_count": doc.chunk_count,
        "filename": doc.filename,
        "ingested_at": doc.ingested_at,
        "error": doc.error,
    })))
}

async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>, DqaError> {
    let removed = state.pipeline.delete_document(&document_id).await?;
    Ok(Json(serde_json::json!({
        "document_id": document_id,
        "chunks_removed": removed,
    })))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let index_status = match state.orchestrator.health_check().await {
        Ok(()) => "healthy",
        Err(_) => "unhealthy",
    };
    Json(serde_json::json!({
        "status": if index_status == "healthy" { "ok" } else { "degraded" },
        "services": {
            "vector_index": index_status,
        }
    }))
}
