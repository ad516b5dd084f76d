//! KV cache window management
//!
//! Self-extend (grouped attention) keeps generation going past the trained
//! window by compressing older positions: each pass divides a `width`-sized
//! block of positions by `group` and slides everything after it left, so
//! `n_past` shrinks by `width / group * (group - 1)`.
//!
//! [`shift_context`] is the fallback when positions still would not fit in
//! the context: half of everything after the first `keep` positions is
//! dropped.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::InferenceContext;
use crate::error::{EngineError, Result};

/// Sequence id used for every KV cache edit; generation is single-sequence.
pub const KV_SEQ_ID: i32 = 0;

/// When the compression cursor returns to zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorPolicy {
    /// Every step starts from position 0; at most one pass fires per
    /// `width / group` tokens of growth.
    #[default]
    PerStep,
    /// The cursor survives across steps and is reset by prefill and clear.
    PerGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfExtendConfig {
    /// Group factor `ga_n`
    pub group: i32,
    /// Group width `ga_w`
    pub width: i32,
    /// Leading positions preserved by [`shift_context`]
    pub keep: i32,
    #[serde(default)]
    pub cursor: CursorPolicy,
}

impl Default for SelfExtendConfig {
    fn default() -> Self {
        Self {
            group: 2,
            width: 512,
            keep: 64,
            cursor: CursorPolicy::PerStep,
        }
    }
}

impl SelfExtendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.group < 1 {
            return Err(EngineError::Config(format!(
                "self_extend.group must be >= 1, got {}",
                self.group
            )));
        }
        if self.width < self.group {
            return Err(EngineError::Config(format!(
                "self_extend.width ({}) must be >= group ({})",
                self.width, self.group
            )));
        }
        if self.keep < 0 {
            return Err(EngineError::Config(format!(
                "self_extend.keep must be >= 0, got {}",
                self.keep
            )));
        }
        Ok(())
    }

    /// Positions removed from `n_past` by one pass
    pub fn block_delta(&self) -> i32 {
        (self.width / self.group) * (self.group - 1)
    }
}

/// Self-extend state for one context
#[derive(Debug, Clone)]
pub struct SelfExtend {
    config: SelfExtendConfig,
    cursor: i32,
}

impl SelfExtend {
    pub fn new(config: SelfExtendConfig) -> Result<Self> {
        config.validate()?;
        if config.width % config.group != 0 {
            warn!(
                width = config.width,
                group = config.group,
                "self-extend width is not a multiple of group"
            );
        }
        Ok(Self { config, cursor: 0 })
    }

    pub fn config(&self) -> &SelfExtendConfig {
        &self.config
    }

    /// Current compression cursor `ga_i`
    pub fn cursor(&self) -> i32 {
        self.cursor
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Compress positions of sequence 0 while `n_past` has reached
    /// `cursor + width`. Returns the number of passes applied.
    pub fn apply<C>(&mut self, ctx: &mut C, n_past: &mut i32) -> Result<u32>
    where
        C: InferenceContext + ?Sized,
    {
        if self.config.cursor == CursorPolicy::PerStep {
            self.cursor = 0;
        }

        let ga_n = self.config.group;
        let ga_w = self.config.width;
        let mut passes = 0;

        while *n_past >= self.cursor + ga_w {
            let ga_i = self.cursor;
            let ib = (ga_n * ga_i) / ga_w;
            let bd = (ga_w / ga_n) * (ga_n - 1);
            let dd = (ga_w / ga_n) - ib * bd - ga_w;

            debug!(
                ga_i,
                n_past = *n_past,
                ib,
                bd,
                dd,
                "self-extend pass"
            );

            ctx.shift_positions(KV_SEQ_ID, ga_i, *n_past, ib * bd)?;
            ctx.divide_positions(KV_SEQ_ID, ga_i + ib * bd, ga_i + ib * bd + ga_w, ga_n)?;
            ctx.shift_positions(KV_SEQ_ID, ga_i + ib * bd + ga_w, *n_past + ib * bd, dd)?;

            *n_past -= bd;
            self.cursor += ga_w / ga_n;
            passes += 1;
        }

        Ok(passes)
    }
}

/// Make room for one more token when `n_past` has reached `n_ctx`.
///
/// Drops half of the positions after `keep` and slides the rest down.
/// Returns the number of positions discarded.
pub fn shift_context<C>(ctx: &mut C, n_past: &mut i32, keep: i32) -> Result<i32>
where
    C: InferenceContext + ?Sized,
{
    let n_ctx = ctx.n_ctx() as i32;
    if n_ctx == 0 || *n_past < n_ctx || keep >= *n_past {
        return Ok(0);
    }

    let n_discard = (*n_past - keep) / 2;
    if n_discard == 0 {
        return Ok(0);
    }

    warn!(n_past = *n_past, n_ctx, keep, n_discard, "context full, shifting");
    ctx.remove_positions(KV_SEQ_ID, keep, keep + n_discard)?;
    ctx.shift_positions(KV_SEQ_ID, keep + n_discard, *n_past, -n_discard)?;
    *n_past -= n_discard;
    Ok(n_discard)
}
