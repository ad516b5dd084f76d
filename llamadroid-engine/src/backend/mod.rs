//! Boundary with the external inference engine
//!
//! The generation core only sequences calls; tokenization, attention and
//! sampling math live behind these traits. `llamacpp` binds them to
//! llama.cpp, `scripted` (feature `scripted`) is a deterministic stand-in
//! for tests.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::sampling::SamplerParams;

#[cfg(feature = "llamacpp")]
pub mod llamacpp;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

/// Vocabulary id of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub i32);

/// Model-level operations that do not touch the KV cache.
pub trait ModelOps {
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of one token; may be a fragment of a UTF-8 code point.
    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>>;

    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Apply the model's chat template to a single message, with the
    /// assistant prefix appended.
    fn format_chat(&self, role: &str, content: &str) -> Result<String>;
}

/// A context: KV cache plus decode entry point for one model.
///
/// Position ranges are half-open `[p0, p1)`.
pub trait InferenceContext {
    type Model: ModelOps;

    fn model(&self) -> &Self::Model;

    /// Submit `tokens` at positions `start_pos..start_pos + tokens.len()`.
    /// Logits are requested for the last token only.
    fn decode(&mut self, tokens: &[TokenId], start_pos: i32) -> Result<()>;

    fn n_ctx(&self) -> u32;

    fn clear_kv_cache(&mut self);

    fn shift_positions(&mut self, seq_id: i32, p0: i32, p1: i32, delta: i32) -> Result<()>;

    fn divide_positions(&mut self, seq_id: i32, p0: i32, p1: i32, divisor: i32) -> Result<()>;

    fn remove_positions(&mut self, seq_id: i32, p0: i32, p1: i32) -> Result<()>;
}

/// Sampler chain state (RNG, penalty history).
pub trait TokenSampler<C: ?Sized> {
    /// Sample from the logits at batch index `idx` (-1 = last).
    fn sample(&mut self, ctx: &C, idx: i32) -> Result<TokenId>;

    /// Record `token` in the penalty history.
    fn accept(&mut self, token: TokenId);
}

/// Factory for engine objects.
pub trait Backend {
    type Model: ModelOps;
    type Context: InferenceContext<Model = Self::Model>;
    type Sampler: TokenSampler<Self::Context>;

    fn load_model(&self, path: &Path) -> Result<Self::Model>;

    fn new_context(&self, model: &Arc<Self::Model>, params: &ContextParams)
    -> Result<Self::Context>;

    fn new_sampler(&self, model: &Self::Model, params: &SamplerParams) -> Result<Self::Sampler>;
}

/// llama.cpp's default logical batch size
pub const DEFAULT_N_BATCH: u32 = 2048;

/// Parameters for context creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens (0 = model default)
    pub n_ctx: u32,
    /// Most tokens a single decode call may carry
    pub n_batch: u32,
    pub n_threads: i32,
    pub n_threads_batch: i32,
}

impl Default for ContextParams {
    fn default() -> Self {
        let n_threads = default_threads();
        Self {
            n_ctx: 2048,
            n_batch: DEFAULT_N_BATCH,
            n_threads,
            n_threads_batch: n_threads,
        }
    }
}

impl ContextParams {
    /// Build params from settings values; `n_threads == 0` picks [`default_threads`].
    pub fn new(n_ctx: u32, n_threads: u32) -> Self {
        let n_threads = if n_threads > 0 {
            n_threads as i32
        } else {
            default_threads()
        };
        Self {
            n_ctx,
            n_batch: DEFAULT_N_BATCH,
            n_threads,
            n_threads_batch: n_threads,
        }
    }

    pub fn with_n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch.max(1);
        self
    }
}

/// Leave two cores for the UI and the rest of the system, between 1 and 8.
pub fn default_threads() -> i32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(1);
    (cpus - 2).clamp(1, 8)
}
