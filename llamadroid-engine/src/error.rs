//! Error types for the generation engine

/// Which handle table a lookup went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Model,
    Context,
    Sampler,
}

impl std::fmt::Display for HandleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleKind::Model => f.write_str("model"),
            HandleKind::Context => f.write_str("context"),
            HandleKind::Sampler => f.write_str("sampler"),
        }
    }
}

/// Errors that can occur while driving the inference engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid {kind} handle: {handle:#x}")]
    InvalidHandle { kind: HandleKind, handle: u64 },

    #[error("backend initialization failed")]
    BackendInit(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("model load failed")]
    ModelLoad(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("context creation failed")]
    ContextCreate(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sampler creation failed")]
    SamplerCreate(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("tokenization failed")]
    Tokenize(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("token to piece conversion failed")]
    Detokenize(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("decode failed at position {pos}")]
    Decode {
        pos: i32,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("kv cache update failed")]
    KvCache(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("chat template failed")]
    ChatTemplate(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn invalid_handle(kind: HandleKind, handle: u64) -> Self {
        EngineError::InvalidHandle { kind, handle }
    }

    /// True for the error class that ends a generation without losing text
    pub fn is_decode(&self) -> bool {
        matches!(self, EngineError::Decode { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
