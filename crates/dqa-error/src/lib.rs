use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum DqaError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    // === 外部服务错误 ===
    #[error("嵌入服务错误 ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("向量索引错误: {operation} 失败")]
    IndexService { operation: String, message: String },

    #[error("生成服务错误 ({provider})")]
    GenerationService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("生成服务限流 ({provider})")]
    RateLimited {
        provider: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    // === 数据完整性错误 ===
    #[error("向量维度不匹配: 期望 {expected}, 实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("引用装配失败: chunk {chunk_id}")]
    Assembly { chunk_id: String, reason: String },

    // === 系统错误 ===
    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },

    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 外部服务波动，可恢复
    High,     // 数据完整性问题
    Critical, // 配置或系统级错误
}

impl DqaError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DqaError::NotFound { .. } | DqaError::InvalidRequest { .. } => ErrorSeverity::Low,
            DqaError::EmbeddingService { .. }
            | DqaError::IndexService { .. }
            | DqaError::GenerationService { .. }
            | DqaError::RateLimited { .. }
            | DqaError::Network { .. }
            | DqaError::Timeout { .. } => ErrorSeverity::Medium,
            DqaError::DimensionMismatch { .. }
            | DqaError::Assembly { .. }
            | DqaError::Serialization { .. }
            | DqaError::Concurrency { .. } => ErrorSeverity::High,
            DqaError::Configuration { .. } | DqaError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            DqaError::Network { .. } | DqaError::Timeout { .. } => true,
            DqaError::RateLimited { .. } => true,
            DqaError::EmbeddingService { retry_after, .. }
            | DqaError::GenerationService { retry_after, .. } => retry_after.is_some(),
            DqaError::Concurrency { .. } => true,
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            DqaError::EmbeddingService { retry_after, .. }
            | DqaError::GenerationService { retry_after, .. }
            | DqaError::RateLimited { retry_after, .. } => *retry_after,
            DqaError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            DqaError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            DqaError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 标识失败发生在哪个外部阶段
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            DqaError::EmbeddingService { .. } | DqaError::DimensionMismatch { .. } => {
                Some("embedding")
            }
            DqaError::IndexService { .. } => Some("vector_index"),
            DqaError::GenerationService { .. } | DqaError::RateLimited { .. } => Some("generation"),
            DqaError::Assembly { .. } => Some("citation_assembly"),
            _ => None,
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            DqaError::NotFound { .. } => 404,
            DqaError::InvalidRequest { .. } => 400,
            DqaError::Configuration { .. } => 500,
            DqaError::RateLimited { .. } => 429,
            DqaError::Timeout { .. } => 408,
            DqaError::EmbeddingService { .. }
            | DqaError::IndexService { .. }
            | DqaError::GenerationService { .. } => 502,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            DqaError::NotFound { .. } => "请求的资源不存在".to_string(),
            DqaError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            DqaError::RateLimited { .. } => "服务繁忙，请稍后重试".to_string(),
            DqaError::Timeout { .. } => "请求超时，请重试".to_string(),
            DqaError::EmbeddingService { .. }
            | DqaError::IndexService { .. }
            | DqaError::GenerationService { .. } => "外部服务暂时不可用，请稍后重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DqaError>;

// === 转换实现 ===

impl From<serde_json::Error> for DqaError {
    fn from(err: serde_json::Error) -> Self {
        DqaError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DqaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DqaError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000,
            }
        } else if err.is_connect() {
            DqaError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            DqaError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<tokio::task::JoinError> for DqaError {
    fn from(err: tokio::task::JoinError) -> Self {
        DqaError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<qdrant_client::QdrantError> for DqaError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        DqaError::IndexService {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for DqaError {
    fn into_response(self) -> axum::response::Response {
        let status_code = match self {
            DqaError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            DqaError::NotFound { .. } => StatusCode::NOT_FOUND,
            DqaError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            DqaError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            DqaError::EmbeddingService { .. }
            | DqaError::IndexService { .. }
            | DqaError::GenerationService { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "stage": self.stage(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        let err = DqaError::Configuration {
            key: "chunk_overlap".into(),
            reason: "overlap >= chunk_size".into(),
        };
        assert!(matches!(err.severity(), ErrorSeverity::Critical));

        let err = DqaError::DimensionMismatch {
            expected: 1536,
            actual: 768,
        };
        assert!(matches!(err.severity(), ErrorSeverity::High));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limited_is_retryable() {
        let err = DqaError::RateLimited {
            provider: "openai_compat".into(),
            retry_after: Some(std::time::Duration::from_secs(1)),
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_http_status(), 429);
        assert_eq!(err.stage(), Some("generation"));
    }
}
