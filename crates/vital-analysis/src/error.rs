use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Store error: {0}")]
    Store(#[from] vital_store::StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] vital_provider::ProviderError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
