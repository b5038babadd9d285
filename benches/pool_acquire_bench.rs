// Connection Pool Performance Benchmarks
// Tests the acquire/release hot path, statement-cache hits, and the
// fingerprint normalizer.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rusty_mysql::driver::mock::MockDriver;
use rusty_mysql::slowlog::normalize;
use rusty_mysql::{ConnectionPool, Context, DbConfig, NormalizationMode, Value};

fn build_pool(runtime: &tokio::runtime::Runtime, cache_size: usize) -> ConnectionPool {
    runtime.block_on(async {
        let driver = Arc::new(MockDriver::new());
        let mut config = DbConfig::for_driver("mock");
        config.endpoint.database = "bench".into();
        config.pool.max_open = 8;
        config.pool.max_idle = 8;
        config.pool.statement_cache_size = cache_size;
        ConnectionPool::connect_with_driver(config, driver)
            .await
            .unwrap()
    })
}

fn bench_acquire_release(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool(&runtime, 0);
    let ctx = Context::background();

    c.bench_function("acquire_release", |b| {
        b.to_async(&runtime).iter(|| {
            let pool = pool.clone();
            let ctx = ctx.clone();
            async move {
                let mut conn = pool.acquire(&ctx).await.unwrap();
                conn.release().await.unwrap();
            }
        });
    });
}

fn bench_exec_roundtrip(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool(&runtime, 0);
    let ctx = Context::background();

    c.bench_function("exec_roundtrip", |b| {
        b.to_async(&runtime).iter(|| {
            let pool = pool.clone();
            let ctx = ctx.clone();
            async move {
                let mut conn = pool.acquire(&ctx).await.unwrap();
                let outcome = conn
                    .exec(&ctx, "UPDATE t SET a = ? WHERE id = ?", &[
                        Value::Int(1),
                        Value::Int(2),
                    ])
                    .await
                    .unwrap();
                black_box(outcome);
                conn.release().await.unwrap();
            }
        });
    });
}

fn bench_cached_exec(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool(&runtime, 64);
    let ctx = Context::background();

    c.bench_function("exec_cached_hit", |b| {
        b.to_async(&runtime).iter(|| {
            let pool = pool.clone();
            let ctx = ctx.clone();
            async move {
                let mut conn = pool.acquire(&ctx).await.unwrap();
                for _ in 0..8 {
                    let outcome = conn
                        .exec_cached(&ctx, "UPDATE t SET a = ? WHERE id = ?", &[
                            Value::Int(1),
                            Value::Int(2),
                        ])
                        .await
                        .unwrap();
                    black_box(outcome);
                }
                conn.release().await.unwrap();
            }
        });
    });
}

fn bench_normalize(c: &mut Criterion) {
    let query = "SELECT u.id, u.name FROM users u WHERE u.email = 'someone@example.com' \
                 AND u.created_at > '2024-01-01' AND u.status IN (1, 2, 3) LIMIT 50";
    c.bench_function("fingerprint_basic", |b| {
        b.iter(|| black_box(normalize(black_box(query), NormalizationMode::Basic)));
    });
}

fn bench_saturated_acquire(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let pool = build_pool(&runtime, 0);

    c.bench_function("acquire_contended_8_tasks", |b| {
        b.to_async(&runtime).iter(|| {
            let pool = pool.clone();
            async move {
                let mut tasks = Vec::with_capacity(16);
                for _ in 0..16 {
                    let pool = pool.clone();
                    tasks.push(tokio::spawn(async move {
                        let ctx = Context::with_timeout(Duration::from_secs(5));
                        let mut conn = pool.acquire(&ctx).await.unwrap();
                        conn.release().await.unwrap();
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_exec_roundtrip,
    bench_cached_exec,
    bench_normalize,
    bench_saturated_acquire
);
criterion_main!(benches);
