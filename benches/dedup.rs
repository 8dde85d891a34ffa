//! Performance benchmarks for duplicate matching

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use syncwright::config::DedupConfig;
use syncwright::dedup::{normalize_title, title_similarity, DeduplicationEngine};
use syncwright::types::{Entity, Product};

const TITLES: [&str; 8] = [
    "Trail Running Sock",
    "Wool Beanie Hat",
    "Canvas Tote Bag",
    "Walnut Cutting Board",
    "Blue Ceramic Mug",
    "Linen Apron Natural",
    "Cast Iron Teapot",
    "Espresso Cup Set of 2",
];

/// `n` products where roughly one in four shares a SKU with another and
/// keyless records repeat titles
fn batch(n: usize, prefix: &str) -> Vec<Entity> {
    (0..n)
        .map(|i| {
            Entity::Product(Product {
                id: format!("{}-{}", prefix, i),
                sku: (i % 5 != 0).then(|| format!("SKU-{}", i - i % 4)),
                title: format!("{} {}", TITLES[i % TITLES.len()], i / TITLES.len()),
                price: Some(10.0 + i as f64),
                stock: Some((i % 30) as i64),
                ..Default::default()
            })
        })
        .collect()
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    group.throughput(Throughput::Elements(1));

    group.bench_function("title", |b| {
        b.iter(|| normalize_title(black_box("NEW: The Red Running-Shoe, Size 9 (Pack of 2)!!")))
    });
    group.bench_function("similarity", |b| {
        b.iter(|| {
            title_similarity(
                black_box("Red Running Shoe Size 9"),
                black_box("red running shoe, size 9 kids"),
            )
        })
    });

    group.finish();
}

fn bench_deduplicate(c: &mut Criterion) {
    let engine = DeduplicationEngine::new(DedupConfig::default());
    let mut group = c.benchmark_group("deduplicate");

    for size in [50, 200, 500] {
        let incoming = batch(size, "in");
        let existing = batch(size / 2, "db");
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("batch", size), &size, |b, _| {
            b.iter(|| engine.deduplicate(black_box(incoming.clone()), black_box(&existing)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_normalize, bench_deduplicate);
criterion_main!(benches);
