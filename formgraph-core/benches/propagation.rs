//! Benchmarks for value propagation through computed fields.
//!
//! Run with: cargo bench -p formgraph-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use formgraph_core::{FormOptions, FormTree};
use serde_json::{json, Value};

/// An order form with `rows` line items and a derived grand total.
fn order_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "lines": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "price": { "type": "number", "default": 1 },
                        "quantity": { "type": "integer", "default": 1 },
                        "subtotal": { "type": "number", "&value": "../price * ../quantity" }
                    }
                }
            },
            "total": { "type": "number", "&value": "sum(#/lines/*/subtotal)" }
        }
    })
}

fn build_tree(rows: usize) -> FormTree {
    let options = FormOptions {
        validate_on_init: false,
        validate_on_change: false,
        ..FormOptions::default()
    };
    let lines: Vec<Value> = (0..rows).map(|i| json!({ "price": i, "quantity": 2 })).collect();
    FormTree::new(&order_schema(), Some(json!({ "lines": lines })), options)
        .expect("benchmark schema is valid")
}

fn bench_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation");

    for rows in [10, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("build", rows), &rows, |b, &rows| {
            b.iter(|| black_box(build_tree(rows)));
        });

        let mut tree = build_tree(rows);
        let mut price = 0;
        group.bench_with_input(BenchmarkId::new("leaf_write", rows), &rows, |b, _| {
            b.iter(|| {
                price += 1;
                tree.set_value_at("/lines/0/price", Some(json!(price)))
                    .expect("path exists");
                black_box(tree.value());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_propagation);
criterion_main!(benches);
