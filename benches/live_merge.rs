//! Criterion benchmarks for the live-mode hot paths.
//!
//! Run with:
//!   cargo bench
//!
//! Results are saved to target/criterion/

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use serde_json::{json, Value};

use latent_live::params::{extract_model_parameters, TransformOptions};
use latent_live::results::{
    DimRedResult, IoParameters, LatentMatrix, ModelParameters, ResultKey, ResultMetadata,
};
use latent_live::scatter::{generate_scatter_figure, ScatterMerger, ScatterState};

fn make_result(rows: usize, n_components: u32) -> DimRedResult {
    let cols = n_components as usize;
    let content = (0..rows)
        .map(|r| (0..cols).map(|c| (r * cols + c) as f64 * 0.01).collect())
        .collect();
    DimRedResult {
        metadata: ResultMetadata {
            io_parameters: IoParameters {
                root_uri: Some("root".to_string()),
                data_uris: vec!["raw/scan".to_string()],
            },
            model_parameters: ModelParameters {
                n_components: Some(n_components),
            },
        },
        content: LatentMatrix::from_rows(content).unwrap_or_default(),
    }
}

fn make_tree(rows: usize) -> Value {
    let rows: Vec<Value> = (0..rows)
        .map(|i| {
            json!({ "props": { "children": [
                { "props": { "children": format!("param {i}") } },
                { "props": { "children": {
                    "props": { "id": { "param_key": format!("p{i}") }, "value": i }
                } } }
            ] } })
        })
        .collect();
    json!({ "props": { "children": rows } })
}

/// Append one result into plots of growing size.
fn bench_scatter_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("scatter_append");
    let key = ResultKey::new("u", "p", "f");
    let merger = ScatterMerger::default();
    let incoming = make_result(1, 2);

    for size in [1_000usize, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(1));
        let base = match generate_scatter_figure(&make_result(*size, 2).content, 2) {
            Ok(fig) => ScatterState::Initialized(fig),
            Err(_) => ScatterState::Uninitialized,
        };

        group.bench_with_input(BenchmarkId::new("points", size), size, |b, _| {
            b.iter_batched(
                || base.clone(),
                |mut state| {
                    let out = merger.merge(&mut state, &key, &incoming);
                    black_box((out.is_ok(), state.point_count()))
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Regenerate a plot from a full result.
fn bench_scatter_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("scatter_generate");

    for n in [2u32, 3].iter() {
        let result = make_result(10_000, *n);
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(BenchmarkId::new("components", n), n, |b, &n| {
            b.iter(|| black_box(generate_scatter_figure(&result.content, n).map(|f| f.point_count())));
        });
    }

    group.finish();
}

fn bench_extract_parameters(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_parameters");
    let transform = TransformOptions {
        log: true,
        percentiles: Some(vec![1.0, 99.0]),
        mask: None,
    };

    for rows in [8usize, 64, 512].iter() {
        let tree = make_tree(*rows);
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::new("rows", rows), rows, |b, _| {
            b.iter(|| black_box(extract_model_parameters(&tree, &transform).len()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_scatter_append,
    bench_scatter_generate,
    bench_extract_parameters
);
criterion_main!(benches);
