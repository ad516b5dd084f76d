//! Benchmarks for the per-token hot path
//!
//! Run with: cargo bench
//!
//! Uses the scripted backend, so the numbers cover the engine's own
//! bookkeeping (assembler, window, registry) without llama.cpp.

use std::path::Path;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use llamadroid_engine::backend::scripted::ScriptedBackend;
use llamadroid_engine::{
    ContextParams, FragmentAssembler, GenerationConfig, Registry, SamplerParams, StepOutcome,
    is_valid_utf8,
};

const MIXED_TEXT: &str = "The quick brown fox 素早い茶色の狐 🦊 jumps over ✓ the lazy dog. ";

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");
    let text = MIXED_TEXT.repeat(64);

    group.bench_function("validate", |b| {
        b.iter(|| is_valid_utf8(black_box(text.as_bytes())))
    });

    // One byte per piece is the worst case for the assembler
    group.bench_function("absorb_bytewise", |b| {
        b.iter(|| {
            let mut assembler = FragmentAssembler::new();
            let mut out = 0;
            for byte in text.as_bytes() {
                out += assembler.absorb(black_box(std::slice::from_ref(byte))).len();
            }
            out
        })
    });

    group.finish();
}

fn bench_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation");
    group.sample_size(20);

    // Long enough to cross the self-extend width several times
    let reply = MIXED_TEXT.repeat(32);
    group.bench_function("scripted_long_reply", |b| {
        b.iter(|| {
            let mut reg = Registry::new(ScriptedBackend::speaking(&reply));
            let model = reg.load_model(Path::new("bench.gguf")).unwrap();
            let ctx = reg
                .new_context(model, &ContextParams::new(4096, 1), &GenerationConfig::default())
                .unwrap();
            let sampler = reg.new_sampler(model, &SamplerParams::default()).unwrap();
            reg.prefill(ctx, sampler, "prompt").unwrap();
            let mut steps = 0;
            while let StepOutcome::Text(_) = reg.step(ctx, sampler).unwrap() {
                steps += 1;
            }
            steps
        })
    });

    group.finish();
}

criterion_group!(benches, bench_utf8, bench_generation);
criterion_main!(benches);
