//! Owner of every model, context and sampler handed out to a caller

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{Backend, ContextParams, InferenceContext, ModelOps};
use crate::error::{HandleKind, Result};
use crate::generation::{Generation, GenerationConfig, StepOutcome};
use crate::handle::{Handle, HandleTable};
use crate::sampling::SamplerParams;

/// A context together with its generation state
pub struct ContextEntry<C> {
    context: C,
    generation: Generation,
}

impl<C> ContextEntry<C> {
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }
}

pub struct Registry<B: Backend> {
    backend: B,
    models: HandleTable<Arc<B::Model>>,
    contexts: HandleTable<ContextEntry<B::Context>>,
    samplers: HandleTable<B::Sampler>,
}

impl<B: Backend> Registry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            models: HandleTable::new(HandleKind::Model),
            contexts: HandleTable::new(HandleKind::Context),
            samplers: HandleTable::new(HandleKind::Sampler),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn load_model(&mut self, path: &Path) -> Result<Handle> {
        let model = self.backend.load_model(path)?;
        let handle = self.models.insert(Arc::new(model));
        info!(handle = handle.as_raw(), path = %path.display(), "model registered");
        Ok(handle)
    }

    /// Returns false for unknown handles.
    pub fn free_model(&mut self, model: Handle) -> bool {
        let freed = self.models.remove(model).is_some();
        debug!(handle = model.as_raw(), freed, "free model");
        freed
    }

    pub fn new_context(
        &mut self,
        model: Handle,
        params: &ContextParams,
        config: &GenerationConfig,
    ) -> Result<Handle> {
        let model = self.models.get(model)?;
        let generation = Generation::new(config)?;
        let context = self.backend.new_context(model, params)?;
        let handle = self.contexts.insert(ContextEntry {
            context,
            generation,
        });
        info!(handle = handle.as_raw(), "context registered");
        Ok(handle)
    }

    pub fn free_context(&mut self, ctx: Handle) -> bool {
        let freed = self.contexts.remove(ctx).is_some();
        debug!(handle = ctx.as_raw(), freed, "free context");
        freed
    }

    pub fn new_sampler(&mut self, model: Handle, params: &SamplerParams) -> Result<Handle> {
        let model = self.models.get(model)?;
        let sampler = self.backend.new_sampler(model, params)?;
        let handle = self.samplers.insert(sampler);
        debug!(handle = handle.as_raw(), "sampler registered");
        Ok(handle)
    }

    pub fn free_sampler(&mut self, sampler: Handle) -> bool {
        let freed = self.samplers.remove(sampler).is_some();
        debug!(handle = sampler.as_raw(), freed, "free sampler");
        freed
    }

    /// Both handles are checked before the context is touched.
    pub fn prefill(&mut self, ctx: Handle, sampler: Handle, prompt: &str) -> Result<i32> {
        self.samplers.get(sampler)?;
        let entry = self.contexts.get_mut(ctx)?;
        entry.generation.prefill(&mut entry.context, prompt)
    }

    /// `Err` only for invalid handles; engine failures come back as
    /// [`StepOutcome::Final`] or [`StepOutcome::Stop`].
    pub fn step(&mut self, ctx: Handle, sampler: Handle) -> Result<StepOutcome> {
        let sampler = self.samplers.get_mut(sampler)?;
        let entry = self.contexts.get_mut(ctx)?;
        Ok(entry.generation.step(&mut entry.context, sampler))
    }

    pub fn clear(&mut self, ctx: Handle) -> Result<()> {
        let entry = self.contexts.get_mut(ctx)?;
        entry.generation.clear(&mut entry.context);
        Ok(())
    }

    pub fn context_size(&self, ctx: Handle) -> Result<u32> {
        Ok(self.contexts.get(ctx)?.context.n_ctx())
    }

    pub fn n_past(&self, ctx: Handle) -> Result<i32> {
        Ok(self.contexts.get(ctx)?.generation.n_past())
    }

    pub fn format_chat(&self, model: Handle, role: &str, content: &str) -> Result<String> {
        self.models.get(model)?.format_chat(role, content)
    }

    pub fn context(&self, ctx: Handle) -> Result<&ContextEntry<B::Context>> {
        self.contexts.get(ctx)
    }

    pub fn sampler(&self, sampler: Handle) -> Result<&B::Sampler> {
        self.samplers.get(sampler)
    }

    /// Live (models, contexts, samplers)
    pub fn counts(&self) -> (usize, usize, usize) {
        (self.models.len(), self.contexts.len(), self.samplers.len())
    }
}
