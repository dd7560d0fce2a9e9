use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Store error: {0}")]
    Store(#[from] vital_store::StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] vital_provider::ProviderError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::tools::ToolError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] vital_analysis::AnalysisError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
