//! Deterministic in-process backend
//!
//! Tokens `0..=255` are raw bytes, [`SCRIPTED_EOG`] ends generation, and
//! higher ids can be mapped to arbitrary pieces. Contexts record every
//! decode and KV cache edit so callers can assert on the exact sequence.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use super::{Backend, ContextParams, InferenceContext, ModelOps, TokenId, TokenSampler};
use crate::error::{EngineError, Result};
use crate::sampling::SamplerParams;

pub const SCRIPTED_EOG: TokenId = TokenId(256);
pub const SCRIPTED_BOS: TokenId = TokenId(257);

/// Vocabulary of the scripted model
#[derive(Debug, Clone, Default)]
pub struct ScriptedModel {
    pieces: HashMap<i32, Vec<u8>>,
    add_bos: bool,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend [`SCRIPTED_BOS`] when tokenizing with special tokens.
    pub fn with_bos(mut self) -> Self {
        self.add_bos = true;
        self
    }

    /// Map `token` to a multi-byte piece.
    pub fn with_piece(mut self, token: TokenId, piece: impl Into<Vec<u8>>) -> Self {
        self.pieces.insert(token.0, piece.into());
        self
    }
}

impl ModelOps for ScriptedModel {
    fn tokenize(&self, text: &str, add_special: bool, _parse_special: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special && self.add_bos {
            tokens.push(SCRIPTED_BOS);
        }
        tokens.extend(text.bytes().map(|b| TokenId(b as i32)));
        Ok(tokens)
    }

    fn token_to_piece(&self, token: TokenId) -> Result<Vec<u8>> {
        if let Some(piece) = self.pieces.get(&token.0) {
            return Ok(piece.clone());
        }
        match u8::try_from(token.0) {
            Ok(b) => Ok(vec![b]),
            Err(_) if token == SCRIPTED_BOS => Ok(Vec::new()),
            Err(_) => Err(EngineError::Detokenize(
                format!("unknown token {}", token.0).into(),
            )),
        }
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == SCRIPTED_EOG
    }

    fn format_chat(&self, role: &str, content: &str) -> Result<String> {
        Ok(format!("<|{role}|>\n{content}\n<|assistant|>\n"))
    }
}

/// One KV cache edit, as recorded by [`ScriptedContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp {
    Shift { seq: i32, p0: i32, p1: i32, delta: i32 },
    Divide { seq: i32, p0: i32, p1: i32, divisor: i32 },
    Remove { seq: i32, p0: i32, p1: i32 },
    Clear,
}

/// One submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeCall {
    pub tokens: Vec<TokenId>,
    pub start_pos: i32,
}

#[derive(Debug)]
pub struct ScriptedContext {
    model: Arc<ScriptedModel>,
    n_ctx: u32,
    n_batch: u32,
    failing_calls: Vec<usize>,
    decodes: Vec<DecodeCall>,
    kv_ops: Vec<KvOp>,
}

impl ScriptedContext {
    pub fn decodes(&self) -> &[DecodeCall] {
        &self.decodes
    }

    pub fn kv_ops(&self) -> &[KvOp] {
        &self.kv_ops
    }

    /// Make decode call number `call` (0-based, counted over the context's
    /// lifetime) fail.
    pub fn fail_decode_call(&mut self, call: usize) {
        self.failing_calls.push(call);
    }
}

impl InferenceContext for ScriptedContext {
    type Model = ScriptedModel;

    fn model(&self) -> &ScriptedModel {
        &self.model
    }

    fn decode(&mut self, tokens: &[TokenId], start_pos: i32) -> Result<()> {
        let call = self.decodes.len();
        self.decodes.push(DecodeCall {
            tokens: tokens.to_vec(),
            start_pos,
        });
        if self.failing_calls.contains(&call) {
            return Err(EngineError::Decode {
                pos: start_pos,
                source: format!("scripted failure on decode call {call}").into(),
            });
        }
        // llama.cpp rejects batches larger than n_batch the same way
        if tokens.len() > self.n_batch as usize {
            return Err(EngineError::Decode {
                pos: start_pos,
                source: format!("{} tokens exceed n_batch {}", tokens.len(), self.n_batch)
                    .into(),
            });
        }
        Ok(())
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn clear_kv_cache(&mut self) {
        self.kv_ops.push(KvOp::Clear);
    }

    fn shift_positions(&mut self, seq: i32, p0: i32, p1: i32, delta: i32) -> Result<()> {
        self.kv_ops.push(KvOp::Shift { seq, p0, p1, delta });
        Ok(())
    }

    fn divide_positions(&mut self, seq: i32, p0: i32, p1: i32, divisor: i32) -> Result<()> {
        if divisor <= 0 {
            return Err(EngineError::KvCache(
                format!("divisor must be positive: {divisor}").into(),
            ));
        }
        self.kv_ops.push(KvOp::Divide {
            seq,
            p0,
            p1,
            divisor,
        });
        Ok(())
    }

    fn remove_positions(&mut self, seq: i32, p0: i32, p1: i32) -> Result<()> {
        self.kv_ops.push(KvOp::Remove { seq, p0, p1 });
        Ok(())
    }
}

/// Replays a fixed token sequence, then [`SCRIPTED_EOG`] forever.
#[derive(Debug)]
pub struct ScriptedSampler {
    queue: VecDeque<TokenId>,
    accepted: Vec<TokenId>,
    params: SamplerParams,
}

impl ScriptedSampler {
    pub fn new(tokens: impl IntoIterator<Item = TokenId>, params: SamplerParams) -> Self {
        Self {
            queue: tokens.into_iter().collect(),
            accepted: Vec::new(),
            params,
        }
    }

    pub fn accepted(&self) -> &[TokenId] {
        &self.accepted
    }

    pub fn params(&self) -> &SamplerParams {
        &self.params
    }
}

impl TokenSampler<ScriptedContext> for ScriptedSampler {
    fn sample(&mut self, _ctx: &ScriptedContext, _idx: i32) -> Result<TokenId> {
        let token = self.queue.pop_front().unwrap_or(SCRIPTED_EOG);
        if token.0 < 0 {
            return Err(EngineError::Sample(format!("negative token id {}", token.0)));
        }
        Ok(token)
    }

    fn accept(&mut self, token: TokenId) {
        self.accepted.push(token);
    }
}

/// Factory for scripted models, contexts and samplers
#[derive(Debug, Clone, Default)]
pub struct ScriptedBackend {
    model: ScriptedModel,
    samples: Vec<TokenId>,
    failing_calls: Vec<usize>,
    fail_load: bool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samplers emit one token per byte of `text`, so multi-byte
    /// characters arrive split across steps.
    pub fn speaking(text: &str) -> Self {
        Self::new().with_samples(text.bytes().map(|b| TokenId(b as i32)))
    }

    pub fn with_model(mut self, model: ScriptedModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_samples(mut self, tokens: impl IntoIterator<Item = TokenId>) -> Self {
        self.samples = tokens.into_iter().collect();
        self
    }

    /// Every new context fails decode call number `call`.
    pub fn failing_decode_call(mut self, call: usize) -> Self {
        self.failing_calls.push(call);
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }
}

impl Backend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;
    type Sampler = ScriptedSampler;

    fn load_model(&self, path: &Path) -> Result<ScriptedModel> {
        if self.fail_load {
            return Err(EngineError::ModelLoad(
                format!("cannot load {}", path.display()).into(),
            ));
        }
        Ok(self.model.clone())
    }

    fn new_context(
        &self,
        model: &Arc<ScriptedModel>,
        params: &ContextParams,
    ) -> Result<ScriptedContext> {
        if params.n_ctx == 0 {
            return Err(EngineError::ContextCreate(
                "scripted contexts need an explicit n_ctx".into(),
            ));
        }
        Ok(ScriptedContext {
            model: Arc::clone(model),
            n_ctx: params.n_ctx,
            n_batch: params.n_batch,
            failing_calls: self.failing_calls.clone(),
            decodes: Vec::new(),
            kv_ops: Vec::new(),
        })
    }

    fn new_sampler(&self, _model: &ScriptedModel, params: &SamplerParams) -> Result<ScriptedSampler> {
        Ok(ScriptedSampler::new(self.samples.iter().copied(), params.clone()))
    }
}
