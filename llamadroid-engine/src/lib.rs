pub mod backend;
pub mod error;
pub mod generation;
pub mod handle;
pub mod registry;
pub mod sampling;
pub mod settings;
pub mod utf8;
pub mod window;
pub mod worker;

pub use backend::{Backend, ContextParams, InferenceContext, ModelOps, TokenId, TokenSampler};
pub use error::{EngineError, HandleKind, Result};
pub use generation::{Generation, GenerationConfig, Session, StepOutcome, StopReason};
pub use handle::{Handle, HandleTable};
pub use registry::Registry;
pub use sampling::{SamplerDefaults, SamplerParams, SamplerStage};
pub use settings::Settings;
pub use utf8::{FragmentAssembler, is_valid_utf8};
pub use window::{CursorPolicy, SelfExtend, SelfExtendConfig};
pub use worker::{FinishReason, GenerationLimits, GenerationWorker, StreamToken};

#[cfg(feature = "llamacpp")]
pub use backend::llamacpp::LlamaCppBackend;
