//! Handle-level operations behind the JNI exports
//!
//! Everything here works on plain integers and strings so it can be tested
//! without a JVM; `exports` only converts JNI values and raises exceptions.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use llamadroid_engine::{
    Backend, EngineError, Handle, Registry, SamplerDefaults, SelfExtendConfig, Settings,
    StepOutcome,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};


pub const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";
pub const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";

fn handle(raw: i64) -> Handle {
    Handle::from_raw(raw as u64)
}

fn raw(handle: Handle) -> i64 {
    handle.as_raw() as i64
}

/// Exception class the managed side should see for `e`.
pub fn exception_class(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidHandle { .. } => ILLEGAL_ARGUMENT,
        _ => ILLEGAL_STATE,
    }
}

/// Run `f`, turning a panic into `fallback`.
pub fn catch_panic<T>(label: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("panic in {label}: {msg}");
            fallback
        }
    }
}

#[derive(Serialize)]
struct SystemInfo<'a> {
    version: &'static str,
    n_ctx: u32,
    n_threads: i32,
    prefill_batch: usize,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    self_extend: &'a SelfExtendConfig,
}

/// Models, contexts and samplers owned on behalf of one managed thread
pub struct Bridge<B: Backend> {
    registry: Registry<B>,
    settings: Settings,
    /// Tokens each context may still produce before `completion_loop` stops
    budgets: HashMap<Handle, u32>,
}

impl<B: Backend> Bridge<B> {
    pub fn new(backend: B) -> Self {
        Self::with_settings(backend, Settings::default())
    }

    pub fn with_settings(backend: B, settings: Settings) -> Self {
        Self {
            registry: Registry::new(backend),
            settings,
            budgets: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry<B> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the settings used by contexts and samplers created from now on.
    pub fn load_settings(&mut self, path: &Path) -> anyhow::Result<()> {
        self.settings = Settings::load_from(path)?;
        info!(path = %path.display(), "settings loaded");
        Ok(())
    }

    pub fn system_info(&self, defaults: &SamplerDefaults) -> String {
        let params = self.settings.context_params();
        let info = SystemInfo {
            version: env!("CARGO_PKG_VERSION"),
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
            prefill_batch: self.settings.generation.prefill_batch,
            temperature: defaults.temperature,
            top_p: defaults.top_p,
            max_tokens: defaults.max_tokens,
            self_extend: &self.settings.self_extend,
        };
        serde_json::to_string(&info).unwrap_or_default()
    }

    pub fn load_model(&mut self, path: &str) -> Result<i64, EngineError> {
        self.registry.load_model(Path::new(path)).map(raw)
    }

    pub fn free_model(&mut self, model: i64) {
        if !self.registry.free_model(handle(model)) {
            debug!(model, "free_model: unknown handle");
        }
    }

    pub fn new_context(&mut self, model: i64) -> Result<i64, EngineError> {
        let params = self.settings.context_params();
        let config = self.settings.generation_config();
        self.registry
            .new_context(handle(model), &params, &config)
            .map(raw)
    }

    pub fn free_context(&mut self, ctx: i64) {
        self.budgets.remove(&handle(ctx));
        if !self.registry.free_context(handle(ctx)) {
            debug!(ctx, "free_context: unknown handle");
        }
    }

    /// The chain takes temperature and top-p from `defaults` as they are now.
    pub fn new_sampler(
        &mut self,
        model: i64,
        defaults: &SamplerDefaults,
    ) -> Result<i64, EngineError> {
        let params = self.settings.sampling.with_defaults(defaults);
        info!(
            temperature = params.temperature,
            top_p = params.top_p,
            "creating sampler"
        );
        self.registry.new_sampler(handle(model), &params).map(raw)
    }

    pub fn free_sampler(&mut self, sampler: i64) {
        if !self.registry.free_sampler(handle(sampler)) {
            debug!(sampler, "free_sampler: unknown handle");
        }
    }

    pub fn chat_format_single(
        &self,
        model: i64,
        role: &str,
        content: &str,
    ) -> Result<String, EngineError> {
        self.registry.format_chat(handle(model), role, content)
    }

    /// 0 for an invalid handle.
    pub fn context_size(&self, ctx: i64) -> i32 {
        self.registry
            .context_size(handle(ctx))
            .map(|n| n as i32)
            .unwrap_or(0)
    }

    /// Prefill `text`; returns the new position count. Starts a budget of
    /// `max_tokens` steps (capped by `[generation] max_tokens`) for the
    /// following `completion_loop` calls.
    pub fn completion_init(
        &mut self,
        ctx: i64,
        sampler: i64,
        text: &str,
        max_tokens: u32,
    ) -> Result<i64, EngineError> {
        let n_past = self.registry.prefill(handle(ctx), handle(sampler), text)?;
        let budget = max_tokens.min(self.settings.generation.max_tokens);
        self.budgets.insert(handle(ctx), budget);
        Ok(n_past as i64)
    }

    /// One generation step. `None` means stop.
    pub fn completion_loop(&mut self, ctx: i64, sampler: i64) -> Option<String> {
        let ctx = handle(ctx);
        if self.budgets.get(&ctx) == Some(&0) {
            info!("max generated tokens reached");
            return None;
        }

        let outcome = match self.registry.step(ctx, handle(sampler)) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("completion_loop rejected: {e}");
                return None;
            }
        };

        match outcome {
            StepOutcome::Text(text) | StepOutcome::Final(text) => {
                if let Some(budget) = self.budgets.get_mut(&ctx) {
                    *budget = budget.saturating_sub(1);
                }
                Some(text)
            }
            StepOutcome::Stop(reason) => {
                debug!(?reason, "generation stopped");
                None
            }
        }
    }

    pub fn kv_cache_clear(&mut self, ctx: i64) -> Result<(), EngineError> {
        self.budgets.remove(&handle(ctx));
        self.registry.clear(handle(ctx))
    }
}
