//! Benchmarks for stage digests.

use clusterprep::core::{Instruction, StageDigest};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn digest_benchmark(c: &mut Criterion) {
    let instructions: Vec<Instruction> = (0..64)
        .map(|i| {
            Instruction::new(format!("pip install package-{i}"))
                .with_env("PIP_NO_CACHE_DIR", "1")
                .with_workdir("~/.clusterprep")
        })
        .collect();

    c.bench_function("digest_64_instructions", |b| {
        b.iter(|| StageDigest::of_instructions(black_box(&instructions)));
    });

    c.bench_function("digest_parts", |b| {
        b.iter(|| {
            StageDigest::from_parts(black_box([
                ("content_hash", "0f3c9a"),
                ("~/.clusterprep/wheels", "/opt/wheels"),
            ]))
        });
    });
}

criterion_group!(benches, digest_benchmark);
criterion_main!(benches);
