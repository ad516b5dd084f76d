//! Background generation with streamed output
//!
//! Engine objects are not `Send`, so the worker thread builds its own
//! session from a factory closure and only text crosses the channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::backend::{InferenceContext, TokenSampler};
use crate::error::Result;
use crate::generation::{Session, StepOutcome, StopReason};

/// Why a streamed generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    EndOfGeneration,
    MaxTokens,
    /// Generated as many tokens as the context had room for after prefill
    ContextFull,
    Cancelled,
    DecodeFailed,
    Fault,
}

impl From<StopReason> for FinishReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::EndOfGeneration => FinishReason::EndOfGeneration,
            StopReason::DecodeFailed => FinishReason::DecodeFailed,
            StopReason::Fault => FinishReason::Fault,
        }
    }
}

/// Represents a token emitted during streaming inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    /// Complete UTF-8 text
    Token(String),
    Done(FinishReason),
    /// Session creation or prefill failed
    Error(String),
}

impl StreamToken {
    pub fn as_token(&self) -> Option<&str> {
        match self {
            StreamToken::Token(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamToken::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamToken::Error(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_tokens: u32,
}

/// Handle to a generation running on its own thread.
///
/// Dropping it cancels the generation and waits for the thread.
pub struct GenerationWorker {
    tokens: Receiver<StreamToken>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GenerationWorker {
    pub fn spawn<F, C, S>(
        factory: F,
        prompt: String,
        limits: GenerationLimits,
    ) -> std::io::Result<Self>
    where
        F: FnOnce() -> Result<Session<C, S>> + Send + 'static,
        C: InferenceContext + 'static,
        S: TokenSampler<C> + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_signal = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("llamadroid-generation".into())
            .spawn(move || {
                let mut session = match factory() {
                    Ok(session) => session,
                    Err(e) => {
                        warn!("failed to create session: {e}");
                        let _ = tx.send(StreamToken::Error(e.to_string()));
                        return;
                    }
                };
                match run(&mut session, &prompt, limits, &tx, &stop_signal) {
                    Ok(reason) => {
                        debug!(?reason, n_past = session.n_past(), "generation finished");
                        let _ = tx.send(StreamToken::Done(reason));
                    }
                    Err(e) => {
                        warn!("generation failed: {e}");
                        let _ = tx.send(StreamToken::Error(e.to_string()));
                    }
                }
            })?;

        Ok(Self {
            tokens: rx,
            stop,
            handle: Some(handle),
        })
    }

    /// Request cancellation; takes effect before the next step.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Block for the next item; `None` once the worker has exited.
    pub fn recv(&self) -> Option<StreamToken> {
        self.tokens.recv().ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = StreamToken> + '_ {
        self.tokens.iter()
    }

    /// Collect every item until the worker exits.
    pub fn collect_all(self) -> Vec<StreamToken> {
        self.tokens.iter().collect()
    }
}

impl Drop for GenerationWorker {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<C, S>(
    session: &mut Session<C, S>,
    prompt: &str,
    limits: GenerationLimits,
    tx: &Sender<StreamToken>,
    stop: &AtomicBool,
) -> Result<FinishReason>
where
    C: InferenceContext,
    S: TokenSampler<C>,
{
    let n_past = session.prefill(prompt)?;
    let n_ctx = session.context().n_ctx();
    let remaining = if n_ctx == 0 {
        u32::MAX
    } else {
        n_ctx.saturating_sub(n_past.max(0) as u32)
    };
    let budget = remaining.min(limits.max_tokens);

    for _ in 0..budget {
        if stop.load(Ordering::Relaxed) {
            return Ok(FinishReason::Cancelled);
        }
        match session.step() {
            StepOutcome::Text(text) => {
                if !text.is_empty() && tx.send(StreamToken::Token(text)).is_err() {
                    debug!("receiver dropped, stopping generation");
                    return Ok(FinishReason::Cancelled);
                }
            }
            StepOutcome::Final(text) => {
                if !text.is_empty() {
                    let _ = tx.send(StreamToken::Token(text));
                }
                return Ok(FinishReason::DecodeFailed);
            }
            StepOutcome::Stop(reason) => return Ok(reason.into()),
        }
    }

    if budget < limits.max_tokens {
        Ok(FinishReason::ContextFull)
    } else {
        Ok(FinishReason::MaxTokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::{ScriptedBackend, ScriptedContext, ScriptedSampler};
    use crate::backend::{Backend, ContextParams};
    use crate::generation::GenerationConfig;
    use crate::sampling::SamplerParams;
    use std::path::Path;

    fn factory(
        backend: ScriptedBackend,
        n_ctx: u32,
    ) -> impl FnOnce() -> Result<Session<ScriptedContext, ScriptedSampler>> + Send + 'static {
        move || {
            let model = Arc::new(backend.load_model(Path::new("m.gguf"))?);
            let ctx = backend.new_context(&model, &ContextParams::new(n_ctx, 1))?;
            let sampler = backend.new_sampler(&model, &SamplerParams::default())?;
            Session::new(ctx, sampler, &GenerationConfig::default())
        }
    }

    fn text_of(items: &[StreamToken]) -> String {
        items.iter().filter_map(|t| t.as_token()).collect()
    }

    const UNLIMITED: GenerationLimits = GenerationLimits { max_tokens: 4096 };

    #[test]
    fn test_streams_until_eog() {
        let worker = GenerationWorker::spawn(
            factory(ScriptedBackend::speaking("héllo"), 2048),
            "q".into(),
            UNLIMITED,
        )
        .unwrap();
        let items = worker.collect_all();
        assert_eq!(text_of(&items), "héllo");
        assert_eq!(
            items.last(),
            Some(&StreamToken::Done(FinishReason::EndOfGeneration))
        );
        // The split "é" arrives as a single item
        assert!(items.iter().all(|t| t.as_token() != Some("")));
    }

    #[test]
    fn test_max_tokens_limit() {
        let worker = GenerationWorker::spawn(
            factory(ScriptedBackend::speaking("hello"), 2048),
            "q".into(),
            GenerationLimits { max_tokens: 3 },
        )
        .unwrap();
        let items = worker.collect_all();
        assert_eq!(text_of(&items), "hel");
        assert_eq!(items.last(), Some(&StreamToken::Done(FinishReason::MaxTokens)));
    }

    #[test]
    fn test_context_limit() {
        let worker = GenerationWorker::spawn(
            factory(ScriptedBackend::speaking("hello"), 8),
            "abcde".into(),
            UNLIMITED,
        )
        .unwrap();
        let items = worker.collect_all();
        assert_eq!(text_of(&items), "hel");
        assert_eq!(
            items.last(),
            Some(&StreamToken::Done(FinishReason::ContextFull))
        );
    }

    #[test]
    fn test_decode_failure_keeps_text() {
        let backend = ScriptedBackend::speaking("abc").failing_decode_call(2);
        let worker = GenerationWorker::spawn(factory(backend, 2048), "q".into(), UNLIMITED).unwrap();
        let items = worker.collect_all();
        assert_eq!(text_of(&items), "ab");
        assert_eq!(
            items.last(),
            Some(&StreamToken::Done(FinishReason::DecodeFailed))
        );
    }

    #[test]
    fn test_session_error_reported() {
        let backend = ScriptedBackend::new().failing_load();
        let worker = GenerationWorker::spawn(factory(backend, 2048), "q".into(), UNLIMITED).unwrap();
        let items = worker.collect_all();
        assert_eq!(items.len(), 1);
        assert!(items[0].is_error());
    }

    #[test]
    fn test_cancel_before_first_step() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let inner = factory(ScriptedBackend::speaking("hello"), 2048);
        let worker = GenerationWorker::spawn(
            move || {
                let _ = gate_rx.recv();
                inner()
            },
            "q".into(),
            UNLIMITED,
        )
        .unwrap();
        worker.stop();
        gate_tx.send(()).unwrap();

        let items = worker.collect_all();
        assert_eq!(items, vec![StreamToken::Done(FinishReason::Cancelled)]);
    }
}
