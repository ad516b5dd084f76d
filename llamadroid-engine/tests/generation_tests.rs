use std::path::Path;

use llamadroid_engine::backend::scripted::{KvOp, ScriptedBackend, ScriptedModel};
use llamadroid_engine::{
    ContextParams, CursorPolicy, GenerationConfig, Handle, Registry, SamplerParams,
    SelfExtendConfig, StepOutcome, StopReason, TokenId,
};

struct Open {
    reg: Registry<ScriptedBackend>,
    ctx: Handle,
    sampler: Handle,
}

fn open(backend: ScriptedBackend, n_ctx: u32, config: GenerationConfig) -> Open {
    let mut reg = Registry::new(backend);
    let model = reg.load_model(Path::new("model.gguf")).unwrap();
    let ctx = reg
        .new_context(model, &ContextParams::new(n_ctx, 2), &config)
        .unwrap();
    let sampler = reg.new_sampler(model, &SamplerParams::default()).unwrap();
    Open { reg, ctx, sampler }
}

/// Drive steps the way the managed caller does: until a stop or until the
/// context has no room left.
fn generate(o: &mut Open) -> (String, StepOutcome) {
    let mut out = String::new();
    loop {
        let outcome = o.reg.step(o.ctx, o.sampler).unwrap();
        if let Some(text) = outcome.text() {
            out.push_str(text);
        }
        if outcome.is_terminal() {
            return (out, outcome);
        }
    }
}

#[test]
fn test_prefill_2500_tokens() {
    let mut o = open(ScriptedBackend::new(), 4096, GenerationConfig::default());
    let prompt = "t".repeat(2500);
    assert_eq!(o.reg.prefill(o.ctx, o.sampler, &prompt).unwrap(), 2500);

    let entry = o.reg.context(o.ctx).unwrap();
    let batches: Vec<usize> = entry
        .context()
        .decodes()
        .iter()
        .map(|d| d.tokens.len())
        .collect();
    assert_eq!(batches, vec![1024, 1024, 452]);
    assert_eq!(o.reg.n_past(o.ctx).unwrap(), 2500);
}

#[test]
fn test_immediate_end_of_generation() {
    let mut o = open(ScriptedBackend::new(), 2048, GenerationConfig::default());
    o.reg.prefill(o.ctx, o.sampler, "Hello").unwrap();
    let (text, outcome) = generate(&mut o);
    assert_eq!(text, "");
    assert_eq!(outcome, StepOutcome::Stop(StopReason::EndOfGeneration));
    assert!(o.reg.sampler(o.sampler).unwrap().accepted().is_empty());
}

#[test]
fn test_multibyte_round_trip() {
    let reply = "Grüße, 世界! 🦀";
    let mut o = open(
        ScriptedBackend::speaking(reply),
        2048,
        GenerationConfig::default(),
    );
    o.reg.prefill(o.ctx, o.sampler, "say hi").unwrap();

    let mut fragments = Vec::new();
    loop {
        match o.reg.step(o.ctx, o.sampler).unwrap() {
            StepOutcome::Text(t) => fragments.push(t),
            other => {
                assert_eq!(other, StepOutcome::Stop(StopReason::EndOfGeneration));
                break;
            }
        }
    }
    // One step per byte, and every fragment is whole text
    assert_eq!(fragments.len(), reply.len());
    assert_eq!(fragments.concat(), reply);
}

#[test]
fn test_multi_byte_pieces() {
    // A piece that ends mid-character followed by one that completes it
    let a = "あい".as_bytes();
    let model = ScriptedModel::new()
        .with_piece(TokenId(300), a[..4].to_vec())
        .with_piece(TokenId(301), a[4..].to_vec());
    let backend = ScriptedBackend::new()
        .with_model(model)
        .with_samples([TokenId(300), TokenId(301)]);
    let mut o = open(backend, 2048, GenerationConfig::default());
    o.reg.prefill(o.ctx, o.sampler, "q").unwrap();

    assert_eq!(o.reg.step(o.ctx, o.sampler).unwrap(), StepOutcome::Text(String::new()));
    assert_eq!(o.reg.step(o.ctx, o.sampler).unwrap(), StepOutcome::Text("あい".into()));
}

#[test]
fn test_decode_failure_mid_generation() {
    // decode calls: 0 = prefill, 1..=3 = "abc", 4 fails on "d"
    let backend = ScriptedBackend::speaking("abcdef").failing_decode_call(4);
    let mut o = open(backend, 2048, GenerationConfig::default());
    o.reg.prefill(o.ctx, o.sampler, "q").unwrap();

    let (text, outcome) = generate(&mut o);
    assert_eq!(text, "abcd");
    assert_eq!(outcome, StepOutcome::Final("d".into()));
    assert_eq!(
        o.reg.step(o.ctx, o.sampler).unwrap(),
        StepOutcome::Stop(StopReason::DecodeFailed)
    );
}

#[test]
fn test_long_generation_stays_inside_window() {
    let reply = "x".repeat(3000);
    let mut o = open(
        ScriptedBackend::speaking(&reply),
        2048,
        GenerationConfig::default(),
    );
    o.reg.prefill(o.ctx, o.sampler, "start").unwrap();
    let (text, _) = generate(&mut o);
    assert_eq!(text.len(), 3000);

    let entry = o.reg.context(o.ctx).unwrap();
    // Every decode stays below the compression width
    assert!(entry.context().decodes().iter().all(|d| d.start_pos < 512));
    let divides = entry
        .context()
        .kv_ops()
        .iter()
        .filter(|op| matches!(op, KvOp::Divide { .. }))
        .count();
    // 5 + 3000 positions, first pass at 512, then one per 256 tokens
    assert_eq!(divides, (3005 - 512) / 256 + 1);
}

#[test]
fn test_per_generation_cursor_resets_on_clear() {
    let config = GenerationConfig {
        window: SelfExtendConfig {
            cursor: CursorPolicy::PerGeneration,
            ..SelfExtendConfig::default()
        },
        ..GenerationConfig::default()
    };
    let mut o = open(ScriptedBackend::speaking("ab"), 4096, config);
    o.reg.prefill(o.ctx, o.sampler, &"p".repeat(512)).unwrap();
    o.reg.step(o.ctx, o.sampler).unwrap();
    let cursor = o.reg.context(o.ctx).unwrap().generation().window().cursor();
    assert_eq!(cursor, 256);

    o.reg.clear(o.ctx).unwrap();
    let entry = o.reg.context(o.ctx).unwrap();
    assert_eq!(entry.generation().window().cursor(), 0);
    assert_eq!(entry.generation().n_past(), 0);
}

#[test]
fn test_clear_drops_partial_code_point() {
    let backend = ScriptedBackend::new().with_samples([TokenId(0xE3), TokenId(b'z' as i32)]);
    let mut o = open(backend, 2048, GenerationConfig::default());
    o.reg.prefill(o.ctx, o.sampler, "q").unwrap();
    assert_eq!(o.reg.step(o.ctx, o.sampler).unwrap(), StepOutcome::Text(String::new()));

    o.reg.clear(o.ctx).unwrap();
    assert_eq!(o.reg.n_past(o.ctx).unwrap(), 0);
    o.reg.prefill(o.ctx, o.sampler, "q").unwrap();
    // Without the clear, 'z' would be held behind the orphaned lead byte
    assert_eq!(o.reg.step(o.ctx, o.sampler).unwrap(), StepOutcome::Text("z".into()));
}

#[test]
fn test_stale_handles_rejected() {
    let mut o = open(ScriptedBackend::new(), 2048, GenerationConfig::default());
    assert!(o.reg.free_sampler(o.sampler));
    assert!(o.reg.step(o.ctx, o.sampler).is_err());
    assert!(!o.reg.free_sampler(o.sampler));

    assert!(o.reg.free_context(o.ctx));
    assert!(o.reg.context_size(o.ctx).is_err());
    assert!(o.reg.clear(o.ctx).is_err());
}
