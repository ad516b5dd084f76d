//! llama.cpp binding of the backend traits via the llama-cpp-2 crate
//!
//! Enable with the `llamacpp` feature flag (on by default).

use std::num::{NonZeroU8, NonZeroU32};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use llama_cpp_2::TokenToStringError;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::token::data_array::LlamaTokenDataArray;
use tracing::{debug, info};

use super::{Backend, ContextParams, InferenceContext, ModelOps, TokenId, TokenSampler};
use crate::error::{EngineError, Result};
use crate::sampling::{SamplerParams, SamplerStage};

/// Initial piece buffer; longer pieces are retried with the reported size.
const PIECE_BUFFER: usize = 64;

const DRY_SEQUENCE_BREAKERS: [&str; 4] = ["\n", ":", "\"", "*"];

/// Global llama.cpp backend (can only be initialized once)
static LLAMA_BACKEND: OnceLock<std::result::Result<LlamaBackend, String>> = OnceLock::new();

/// Get or initialize the global llama.cpp backend
pub fn get_backend() -> Result<&'static LlamaBackend> {
    let result = LLAMA_BACKEND.get_or_init(|| {
        let backend = LlamaBackend::init().map_err(|e| e.to_string())?;
        info!("llama.cpp backend initialized");
        Ok(backend)
    });
    match result {
        Ok(backend) => Ok(backend),
        Err(e) => Err(EngineError::BackendInit(
            format!("failed to initialize llama.cpp backend: {e}").into(),
        )),
    }
}

/// Route llama.cpp and ggml log output into `tracing`.
pub fn route_logs_to_tracing() {
    llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default());
}

/// Stateless factory over the process-wide llama.cpp backend
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaCppBackend;

impl LlamaCppBackend {
    /// Initialize llama.cpp if needed.
    pub fn new() -> Result<Self> {
        get_backend()?;
        Ok(Self)
    }
}

impl Backend for LlamaCppBackend {
    type Model = LlamaCppModel;
    type Context = LlamaCppContext;
    type Sampler = LlamaCppSampler;

    fn load_model(&self, path: &Path) -> Result<LlamaCppModel> {
        let backend = get_backend()?;
        let model = LlamaModel::load_from_file(backend, path, &LlamaModelParams::default())
            .map_err(|e| EngineError::ModelLoad(e.into()))?;
        info!(path = %path.display(), n_vocab = model.n_vocab(), "model loaded");
        Ok(LlamaCppModel { model })
    }

    fn new_context(
        &self,
        model: &Arc<LlamaCppModel>,
        params: &ContextParams,
    ) -> Result<LlamaCppContext> {
        let backend = get_backend()?;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_threads(params.n_threads)
            .with_n_threads_batch(params.n_threads_batch);

        // SAFETY: the model lives in an Arc that the returned context holds,
        // and `ctx` is declared before `model` so it is dropped first.
        let model_ref: &'static LlamaModel = unsafe { &*(&model.model as *const LlamaModel) };
        let ctx = model_ref
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.into()))?;

        info!(
            n_ctx = ctx.n_ctx(),
            n_batch = params.n_batch,
            n_threads = params.n_threads,
            "context created"
        );
        Ok(LlamaCppContext {
            ctx,
            model: Arc::clone(model),
            logits_idx: None,
        })
    }

    fn new_sampler(&self, model: &LlamaCppModel, params: &SamplerParams) -> Result<LlamaCppSampler> {
        let seed = params.resolve_seed();
        debug!(?params, seed, "building sampler chain");
        Ok(LlamaCppSampler {
            sampler: build_chain(&model.model, params, seed),
        })
    }
}

/// Build the chain: repetition penalties, the configured stages, then the
/// final pick (mirostat, greedy at temperature 0, or seeded distribution).
fn build_chain(model: &LlamaModel, params: &SamplerParams, seed: u32) -> LlamaSampler {
    let mut chain = vec![LlamaSampler::penalties(
        params.penalty_last_n,
        params.repeat_penalty,
        params.frequency_penalty,
        params.presence_penalty,
    )];

    match params.mirostat {
        1 => {
            chain.push(LlamaSampler::temp(params.temperature));
            chain.push(LlamaSampler::mirostat(
                model.n_vocab(),
                seed,
                params.mirostat_tau,
                params.mirostat_eta,
                100,
            ));
        }
        2 => {
            chain.push(LlamaSampler::temp(params.temperature));
            chain.push(LlamaSampler::mirostat_v2(
                seed,
                params.mirostat_tau,
                params.mirostat_eta,
            ));
        }
        _ => {
            for stage in &params.stages {
                chain.push(match stage {
                    SamplerStage::Dry => LlamaSampler::dry(
                        model,
                        params.dry_multiplier,
                        params.dry_base,
                        params.dry_allowed_length,
                        params.dry_penalty_last_n,
                        DRY_SEQUENCE_BREAKERS,
                    ),
                    SamplerStage::TopK => LlamaSampler::top_k(params.top_k),
                    SamplerStage::TypicalP => LlamaSampler::typical(params.typical_p, 1),
                    SamplerStage::TopP => LlamaSampler::top_p(params.top_p, 1),
                    SamplerStage::MinP => LlamaSampler::min_p(params.min_p, 1),
                    SamplerStage::Xtc => LlamaSampler::xtc(
                        params.xtc_probability,
                        params.xtc_threshold,
                        1,
                        seed,
                    ),
                    SamplerStage::Temperature => LlamaSampler::temp(params.temperature),
                });
            }
            if params.temperature <= 0.0 {
                chain.push(LlamaSampler::greedy());
            } else {
                chain.push(LlamaSampler::dist(seed));
            }
        }
    }

    LlamaSampler::chain_simple(chain)
}

/// A loaded GGUF model
pub struct LlamaCppModel {
    model: LlamaModel,
}

impl LlamaCppModel {
    pub fn n_vocab(&self) -> i32 {
        self.model.n_vocab()
    }
}

impl ModelOps for LlamaCppModel {
    // llama-cpp-2 always parses special tokens in the input text.
    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        let add_bos = if add_special {
            AddBos::Always
        } else {
            AddBos::Never
        };
        let tokens = self
            .model
            .str_to_token(text, add_bos)
            .map_err(|e| EngineError::Tokenize(e.into()))?;
        Ok(tokens.into_iter().map(|t| TokenId(t.0)).collect())
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        let token = LlamaToken(token.0);
        match self
            .model
            .token_to_piece_bytes(token, PIECE_BUFFER, true, None)
        {
            Ok(bytes) => Ok(bytes),
            Err(TokenToStringError::InsufficientBufferSpace(needed)) => self
                .model
                .token_to_piece_bytes(token, needed.unsigned_abs() as usize, true, None)
                .map_err(|e| EngineError::Detokenize(e.into())),
            Err(e) => Err(EngineError::Detokenize(e.into())),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token.0))
    }

    fn format_chat(&self, role: &str, content: &str) -> Result<String> {
        let template = self
            .model
            .chat_template(None)
            .map_err(|e| EngineError::ChatTemplate(e.into()))?;
        let message = LlamaChatMessage::new(role.to_string(), content.to_string())
            .map_err(|e| EngineError::ChatTemplate(e.into()))?;
        self.model
            .apply_chat_template(&template, &[message], true)
            .map_err(|e| EngineError::ChatTemplate(e.into()))
    }
}

/// A llama.cpp context bound to a shared model
pub struct LlamaCppContext {
    ctx: LlamaContext<'static>,
    model: Arc<LlamaCppModel>,
    /// Batch index of the last decoded token, the only one with logits
    logits_idx: Option<i32>,
}

impl LlamaCppContext {
    /// Resolve `-1` to the batch index holding logits.
    fn logits_index(&self, idx: i32) -> Result<i32> {
        if idx >= 0 {
            return Ok(idx);
        }
        self.logits_idx
            .ok_or_else(|| EngineError::Sample("no logits: nothing decoded yet".into()))
    }
}

fn position(p: i32) -> Result<Option<u32>> {
    u32::try_from(p)
        .map(Some)
        .map_err(|e| EngineError::KvCache(e.into()))
}

impl InferenceContext for LlamaCppContext {
    type Model = LlamaCppModel;

    fn model(&self) -> &LlamaCppModel {
        &self.model
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: i32) -> Result<()> {
        let mut batch = LlamaBatch::new(tokens.len().max(1), 1);
        let last = tokens.len().saturating_sub(1);
        self.logits_idx = None;
        for (i, token) in tokens.iter().enumerate() {
            let pos = start_pos + i as i32;
            batch
                .add(LlamaToken(token.0), pos, &[0], i == last)
                .map_err(|e| EngineError::Decode {
                    pos,
                    source: e.into(),
                })?;
        }
        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Decode {
                pos: start_pos,
                source: e.into(),
            })?;
        if !tokens.is_empty() {
            self.logits_idx = Some(last as i32);
        }
        Ok(())
    }

    fn n_ctx(&self) -> u32 {
        self.ctx.n_ctx()
    }

    fn clear_kv_cache(&mut self) {
        self.ctx.clear_kv_cache();
        self.logits_idx = None;
    }

    fn shift_positions(&mut self, seq_id: i32, p0: i32, p1: i32, delta: i32) -> Result<()> {
        self.ctx
            .kv_cache_seq_add(seq_id, position(p0)?, position(p1)?, delta)
            .map_err(|e| EngineError::KvCache(e.into()))
    }

    fn divide_positions(&mut self, seq_id: i32, p0: i32, p1: i32, divisor: i32) -> Result<()> {
        let d = u8::try_from(divisor)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| EngineError::Config(format!("position divisor out of range: {divisor}")))?;
        self.ctx
            .kv_cache_seq_div(seq_id, position(p0)?, position(p1)?, d)
            .map_err(|e| EngineError::KvCache(e.into()))
    }

    fn remove_positions(&mut self, seq_id: i32, p0: i32, p1: i32) -> Result<()> {
        let seq = u32::try_from(seq_id).map_err(|e| EngineError::KvCache(e.into()))?;
        self.ctx
            .clear_kv_cache_seq(Some(seq), position(p0)?, position(p1)?)
            .map(|_| ())
            .map_err(|e| EngineError::KvCache(e.into()))
    }
}

/// Sampler chain built from [`SamplerParams`]
pub struct LlamaCppSampler {
    sampler: LlamaSampler,
}

impl TokenSampler<LlamaCppContext> for LlamaCppSampler {
    /// Runs the chain over the candidates without accepting the pick;
    /// `LlamaSampler::sample` would accept it into the penalty history.
    fn sample(&mut self, ctx: &LlamaCppContext, idx: i32) -> Result<TokenId> {
        let idx = ctx.logits_index(idx)?;
        let mut candidates = LlamaTokenDataArray::from_iter(ctx.ctx.candidates_ith(idx), false);
        candidates.apply_sampler(&self.sampler);
        let token = candidates
            .selected_token()
            .ok_or_else(|| EngineError::Sample("sampler chain selected no token".into()))?;
        if token.0 < 0 {
            return Err(EngineError::Sample(format!("negative token id {}", token.0)));
        }
        Ok(TokenId(token.0))
    }

    fn accept(&mut self, token: TokenId) {
        self.sampler.accept(LlamaToken(token.0));
    }
}
