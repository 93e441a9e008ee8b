use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::Map;
use sirius::accounts::{Account, AccountKind, AccountStatus, Platform};
use sirius::config::{LimiterConfig, SchedulingConfig, SessionConfig};
use sirius::limiter::ConcurrencyLimiter;
use sirius::scheduler::{RequestContext, Scheduler};
use sirius::session::SessionService;
use std::collections::HashSet;
use std::hint::black_box;
use std::sync::Arc;

fn account(priority: i32) -> Account {
    Account {
        id: 0,
        name: "bench".to_string(),
        platform: Platform::Anthropic,
        kind: AccountKind::ApiKey,
        priority,
        schedulable: true,
        status: AccountStatus::Active,
        error_message: None,
        concurrency: 32,
        credentials: Map::new(),
        credential_generation: 0,
        last_used_at: None,
        rate_limit_reset_at: None,
        overload_until: None,
        temp_unschedulable_until: None,
        scoped_rate_limits: Default::default(),
        group_ids: Vec::new(),
        extra: Map::new(),
    }
}

fn bench_select(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let scheduler = rt.block_on(async {
        let store = sirius::accounts::store::spawn_in_memory().await;
        for i in 0..64 {
            store.insert_account(account(i % 8)).await.expect("insert");
        }
        Scheduler::new(
            store,
            Arc::new(SessionService::new(&SessionConfig::default())),
            Arc::new(ConcurrencyLimiter::new(&LimiterConfig::default())),
            SchedulingConfig::default(),
        )
    });

    let excluded = HashSet::new();
    let mut n = 0u64;
    c.bench_function("select_64_accounts", |b| {
        b.iter(|| {
            n += 1;
            let ctx = RequestContext {
                request_id: format!("bench-{n}"),
                ..Default::default()
            };
            let outcome = rt.block_on(scheduler.select(
                &ctx,
                None,
                "claude-3-5-sonnet-20241022",
                &excluded,
            ));
            let outcome = outcome.expect("select");
            if let sirius::scheduler::SelectOutcome::Ready(s) = &outcome {
                scheduler.limiter().release(s.account.id, &ctx.request_id);
            }
            black_box(outcome);
        });
    });
}

criterion_group!(benches, bench_select);
criterion_main!(benches);
