use criterion::{black_box, criterion_group, criterion_main, Criterion};

use taskforge_core::EntityKind;
use taskforge_storage::statements::{StatementCache, StatementKind};

/// Statement templates on the sweep hot path: one select + one delete per
/// TTL-bearing entity kind.
fn sweep_templates(cache: &StatementCache) {
    for kind in EntityKind::SWEEP_ORDER {
        black_box(cache.sql(kind, StatementKind::SelectExpiredIds));
        black_box(cache.sql(kind, StatementKind::DeleteByIdSet));
    }
}

fn bench_statement_cache(c: &mut Criterion) {
    let warm = StatementCache::new();
    sweep_templates(&warm);

    c.bench_function("sweep_templates_memoized", |b| {
        b.iter(|| sweep_templates(&warm));
    });

    c.bench_function("sweep_templates_rebuilt", |b| {
        b.iter(|| {
            let cold = StatementCache::new();
            sweep_templates(&cold);
        });
    });
}

criterion_group!(benches, bench_statement_cache);
criterion_main!(benches);
