//! Incremental generation: prefill a prompt, then produce one token per step
//!
//! A step never returns an error to the caller. Faults become
//! [`StepOutcome::Stop`]; a failed decode after the token was already turned
//! into text returns that text as [`StepOutcome::Final`] and halts the
//! generation until the next prefill or clear.

use tracing::{debug, error, info, trace};

use crate::backend::{InferenceContext, ModelOps, TokenSampler};
use crate::error::Result;
use crate::utf8::FragmentAssembler;
use crate::window::{SelfExtend, SelfExtendConfig, shift_context};

pub const DEFAULT_PREFILL_BATCH: usize = 1024;

/// Per-context generation configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub window: SelfExtendConfig,
    pub prefill_batch: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            window: SelfExtendConfig::default(),
            prefill_batch: DEFAULT_PREFILL_BATCH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The sampler produced an end-of-generation token
    EndOfGeneration,
    /// An earlier step could not decode its token
    DecodeFailed,
    /// Sampling, detokenization or a KV cache edit failed
    Fault,
}

/// Result of one [`Generation::step`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Newly completed text; empty while a code point is still partial.
    Text(String),
    /// Last text of this generation; the token could not be decoded.
    Final(String),
    Stop(StopReason),
}

impl StepOutcome {
    pub fn text(&self) -> Option<&str> {
        match self {
            StepOutcome::Text(t) | StepOutcome::Final(t) => Some(t),
            StepOutcome::Stop(_) => None,
        }
    }

    /// True when no further step should be requested.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepOutcome::Text(_))
    }
}

/// Generation state of one context
#[derive(Debug, Clone)]
pub struct Generation {
    n_past: i32,
    assembler: FragmentAssembler,
    window: SelfExtend,
    prefill_batch: usize,
    halted: bool,
}

impl Generation {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            n_past: 0,
            assembler: FragmentAssembler::new(),
            window: SelfExtend::new(config.window)?,
            prefill_batch: config.prefill_batch.max(1),
            halted: false,
        })
    }

    /// Positions currently occupied in the KV cache
    pub fn n_past(&self) -> i32 {
        self.n_past
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn window(&self) -> &SelfExtend {
        &self.window
    }

    /// Bytes of a partial code point held back from the last step
    pub fn pending_bytes(&self) -> usize {
        self.assembler.pending_len()
    }

    /// Tokenize `prompt` and decode it in batches, continuing from the
    /// current position. Returns the new `n_past`.
    pub fn prefill<C>(&mut self, ctx: &mut C, prompt: &str) -> Result<i32>
    where
        C: InferenceContext + ?Sized,
    {
        self.assembler.reset();
        self.window.reset();
        self.halted = false;

        let tokens = ctx.model().tokenize(prompt, true, true)?;
        info!(
            tokens = tokens.len(),
            n_past = self.n_past,
            n_ctx = ctx.n_ctx(),
            "prefill"
        );

        for chunk in tokens.chunks(self.prefill_batch) {
            ctx.decode(chunk, self.n_past)?;
            self.n_past += chunk.len() as i32;
        }
        debug!(n_past = self.n_past, "prefill done");
        Ok(self.n_past)
    }

    /// Sample, convert and decode one token.
    pub fn step<C, S>(&mut self, ctx: &mut C, sampler: &mut S) -> StepOutcome
    where
        C: InferenceContext + ?Sized,
        S: TokenSampler<C> + ?Sized,
    {
        if self.halted {
            return StepOutcome::Stop(StopReason::DecodeFailed);
        }
        match self.try_step(ctx, sampler) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("generation step failed: {e}");
                StepOutcome::Stop(StopReason::Fault)
            }
        }
    }

    fn try_step<C, S>(&mut self, ctx: &mut C, sampler: &mut S) -> Result<StepOutcome>
    where
        C: InferenceContext + ?Sized,
        S: TokenSampler<C> + ?Sized,
    {
        let token = sampler.sample(ctx, -1)?;
        if ctx.model().is_end_of_generation(token) {
            debug!(
                token = token.0,
                n_past = self.n_past,
                pending = self.assembler.pending_len(),
                "end of generation"
            );
            return Ok(StepOutcome::Stop(StopReason::EndOfGeneration));
        }
        sampler.accept(token);

        let piece = ctx.model().token_to_piece(token)?;
        let text = self.assembler.absorb(&piece);
        trace!(token = token.0, piece_len = piece.len(), emitted = %text, "step");

        self.window.apply(ctx, &mut self.n_past)?;
        shift_context(ctx, &mut self.n_past, self.window.config().keep)?;

        if let Err(e) = ctx.decode(&[token], self.n_past) {
            error!(n_past = self.n_past, "decode failed, ending generation: {e}");
            self.halted = true;
            return Ok(StepOutcome::Final(text));
        }
        self.n_past += 1;
        Ok(StepOutcome::Text(text))
    }

    /// Empty the KV cache and forget all position state.
    pub fn clear<C>(&mut self, ctx: &mut C)
    where
        C: InferenceContext + ?Sized,
    {
        ctx.clear_kv_cache();
        self.n_past = 0;
        self.assembler.reset();
        self.window.reset();
        self.halted = false;
        debug!("kv cache cleared");
    }
}

/// A context and sampler driven together
pub struct Session<C, S> {
    context: C,
    sampler: S,
    generation: Generation,
}

impl<C, S> Session<C, S>
where
    C: InferenceContext,
    S: TokenSampler<C>,
{
    pub fn new(context: C, sampler: S, config: &GenerationConfig) -> Result<Self> {
        Ok(Self {
            context,
            sampler,
            generation: Generation::new(config)?,
        })
    }

    pub fn prefill(&mut self, prompt: &str) -> Result<i32> {
        self.generation.prefill(&mut self.context, prompt)
    }

    pub fn step(&mut self) -> StepOutcome {
        self.generation.step(&mut self.context, &mut self.sampler)
    }

    pub fn clear(&mut self) {
        self.generation.clear(&mut self.context);
    }

    pub fn n_past(&self) -> i32 {
        self.generation.n_past()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{
        KvOp, ScriptedBackend, ScriptedContext, ScriptedModel, ScriptedSampler,
    };
    use crate::backend::{Backend, ContextParams, TokenId};
    use crate::sampling::SamplerParams;
    use std::path::Path;
    use std::sync::Arc;

    type ScriptedSession = Session<ScriptedContext, ScriptedSampler>;

    fn session(backend: &ScriptedBackend, n_ctx: u32) -> ScriptedSession {
        let model = Arc::new(backend.load_model(Path::new("test.gguf")).unwrap());
        let ctx = backend
            .new_context(&model, &ContextParams::new(n_ctx, 1))
            .unwrap();
        let sampler = backend
            .new_sampler(&model, &SamplerParams::default())
            .unwrap();
        Session::new(ctx, sampler, &GenerationConfig::default()).unwrap()
    }

    #[test]
    fn test_prefill_batches() {
        let backend = ScriptedBackend::new();
        let mut s = session(&backend, 4096);
        let prompt = "x".repeat(2500);
        assert_eq!(s.prefill(&prompt).unwrap(), 2500);

        let sizes: Vec<(usize, i32)> = s
            .context()
            .decodes()
            .iter()
            .map(|d| (d.tokens.len(), d.start_pos))
            .collect();
        assert_eq!(sizes, vec![(1024, 0), (1024, 1024), (452, 2048)]);
    }

    #[test]
    fn test_prefill_batch_fits_context_batch() {
        let mut settings = crate::settings::Settings::default();
        settings.context.n_ctx = 8192;
        settings.generation.prefill_batch = 4096;
        let backend = ScriptedBackend::new();
        let model = Arc::new(backend.load_model(Path::new("test.gguf")).unwrap());
        let prompt = "x".repeat(2500);

        // A context left at the default n_batch cannot take the chunk
        let ctx = backend
            .new_context(&model, &ContextParams::new(8192, 1))
            .unwrap();
        let sampler = backend.new_sampler(&model, &SamplerParams::default()).unwrap();
        let mut s = Session::new(ctx, sampler, &settings.generation_config()).unwrap();
        assert!(s.prefill(&prompt).unwrap_err().is_decode());

        let params = settings.context_params();
        assert_eq!(params.n_batch, 4096);
        let ctx = backend.new_context(&model, &params).unwrap();
        let sampler = backend.new_sampler(&model, &SamplerParams::default()).unwrap();
        let mut s = Session::new(ctx, sampler, &settings.generation_config()).unwrap();
        assert_eq!(s.prefill(&prompt).unwrap(), 2500);
        assert_eq!(s.context().decodes().len(), 1);
    }

    #[test]
    fn test_prefill_continues_from_n_past() {
        let backend = ScriptedBackend::new();
        let mut s = session(&backend, 4096);
        s.prefill("abc").unwrap();
        assert_eq!(s.prefill("de").unwrap(), 5);
        assert_eq!(s.context().decodes()[1].start_pos, 3);
    }

    #[test]
    fn test_prefill_drops_partial_code_point() {
        let backend = ScriptedBackend::new().with_samples([TokenId(0xE3), TokenId(b'z' as i32)]);
        let mut s = session(&backend, 4096);
        s.prefill("q").unwrap();
        assert_eq!(s.step(), StepOutcome::Text(String::new()));
        assert_eq!(s.generation().pending_bytes(), 1);

        // No clear: the new prompt alone discards the orphaned lead byte
        s.prefill("again").unwrap();
        assert_eq!(s.generation().pending_bytes(), 0);
        assert_eq!(s.step(), StepOutcome::Text("z".into()));
    }

    #[test]
    fn test_prefill_adds_bos() {
        let backend = ScriptedBackend::new().with_model(ScriptedModel::new().with_bos());
        let mut s = session(&backend, 4096);
        assert_eq!(s.prefill("hi").unwrap(), 3);
    }

    #[test]
    fn test_immediate_eog() {
        let backend = ScriptedBackend::new();
        let mut s = session(&backend, 2048);
        s.prefill("hello").unwrap();
        assert_eq!(s.step(), StepOutcome::Stop(StopReason::EndOfGeneration));
        assert_eq!(s.n_past(), 5);
        assert!(s.sampler().accepted().is_empty());
    }

    #[test]
    fn test_steps_stream_complete_text() {
        let backend = ScriptedBackend::speaking("aあ");
        let mut s = session(&backend, 2048);
        s.prefill("q").unwrap();

        assert_eq!(s.step(), StepOutcome::Text("a".into()));
        assert_eq!(s.step(), StepOutcome::Text(String::new()));
        assert_eq!(s.step(), StepOutcome::Text(String::new()));
        assert_eq!(s.step(), StepOutcome::Text("あ".into()));
        assert_eq!(s.step(), StepOutcome::Stop(StopReason::EndOfGeneration));

        assert_eq!(s.n_past(), 5);
        assert_eq!(s.sampler().accepted().len(), 4);
        // Each token is decoded at the position after the previous one
        let positions: Vec<i32> = s.context().decodes()[1..]
            .iter()
            .map(|d| d.start_pos)
            .collect();
        assert_eq!(positions, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_failure_returns_final_text() {
        // Call 0 is the prefill, call 2 the second generated token
        let backend = ScriptedBackend::speaking("ok!").failing_decode_call(2);
        let mut s = session(&backend, 2048);
        s.prefill("q").unwrap();

        assert_eq!(s.step(), StepOutcome::Text("o".into()));
        assert_eq!(s.step(), StepOutcome::Final("k".into()));
        assert!(s.generation().is_halted());
        assert_eq!(s.n_past(), 2);
        assert_eq!(s.step(), StepOutcome::Stop(StopReason::DecodeFailed));
    }

    #[test]
    fn test_prefill_failure_propagates() {
        let backend = ScriptedBackend::new().failing_decode_call(0);
        let mut s = session(&backend, 2048);
        assert!(s.prefill("q").unwrap_err().is_decode());
    }

    #[test]
    fn test_detokenize_fault_stops() {
        let backend = ScriptedBackend::new().with_samples([TokenId(9999)]);
        let mut s = session(&backend, 2048);
        s.prefill("q").unwrap();
        assert_eq!(s.step(), StepOutcome::Stop(StopReason::Fault));
    }

    #[test]
    fn test_negative_sample_is_fault() {
        let backend = ScriptedBackend::new().with_samples([TokenId(-1)]);
        let mut s = session(&backend, 2048);
        s.prefill("q").unwrap();
        assert_eq!(s.step(), StepOutcome::Stop(StopReason::Fault));
    }

    #[test]
    fn test_self_extend_during_steps() {
        let backend = ScriptedBackend::speaking("zz");
        let mut s = session(&backend, 2048);
        s.prefill(&"p".repeat(511)).unwrap();

        // n_past 511: no compression, decoded at 511
        assert_eq!(s.step(), StepOutcome::Text("z".into()));
        assert_eq!(s.n_past(), 512);
        assert!(s.context().kv_ops().is_empty());

        // n_past 512: one pass, back to 256 before decoding
        assert_eq!(s.step(), StepOutcome::Text("z".into()));
        assert_eq!(s.n_past(), 257);
        assert_eq!(s.context().kv_ops().len(), 3);
        assert_eq!(s.context().decodes().last().unwrap().start_pos, 256);
    }

    #[test]
    fn test_clear_resets_state() {
        let backend = ScriptedBackend::speaking("ab");
        let mut s = session(&backend, 2048);
        s.prefill("hello").unwrap();
        s.step();
        s.clear();
        assert_eq!(s.n_past(), 0);
        assert_eq!(s.context().kv_ops().last(), Some(&KvOp::Clear));

        s.prefill("x").unwrap();
        assert_eq!(s.context().decodes().last().unwrap().start_pos, 0);
    }

    #[test]
    fn test_clear_unhalts() {
        let backend = ScriptedBackend::speaking("ab").failing_decode_call(1);
        let mut s = session(&backend, 2048);
        s.prefill("q").unwrap();
        assert!(matches!(s.step(), StepOutcome::Final(_)));
        s.clear();
        assert!(!s.generation().is_halted());
        assert_eq!(s.step(), StepOutcome::Text("b".into()));
    }

    #[test]
    fn test_outcome_helpers() {
        assert_eq!(StepOutcome::Text("a".into()).text(), Some("a"));
        assert!(!StepOutcome::Text(String::new()).is_terminal());
        assert!(StepOutcome::Final("b".into()).is_terminal());
        assert_eq!(StepOutcome::Stop(StopReason::Fault).text(), None);
        assert!(StepOutcome::Stop(StopReason::EndOfGeneration).is_terminal());
    }
}
