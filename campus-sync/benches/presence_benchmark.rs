use std::collections::BTreeMap;
use std::hint::black_box;
use std::time::Duration;

use campus_sync::{
    Activity, AggregatePresence, Direction, FilterOp, PresenceRecord, QueryConstraints, Record,
};
use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn sessions(n: usize) -> Vec<PresenceRecord> {
    (0..n)
        .map(|i| PresenceRecord {
            online: i % 4 != 0,
            last_seen: Utc.timestamp_millis_opt(1_700_000_000_000 + i as i64).unwrap(),
            activity: Activity::ALL[i % Activity::ALL.len()],
            session_id: format!("s{i}"),
            user_id: format!("u{}", i / 2),
        })
        .collect()
}

fn inbox(n: usize) -> BTreeMap<String, Record> {
    (0..n)
        .map(|i| {
            let record = json!({
                "recipient": format!("u{}", i % 20),
                "kind": "grade",
                "read": i % 3 == 0,
                "createdAt": 1_700_000_000_000i64 + i as i64,
            });
            (format!("n{i}"), record.as_object().cloned().unwrap())
        })
        .collect()
}

fn bench_presence_fold(c: &mut Criterion) {
    let now = Utc.timestamp_millis_opt(1_700_000_100_000).unwrap();
    let mut group = c.benchmark_group("presence_fold");
    for n in [100usize, 1_000, 5_000] {
        let records = sessions(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &records, |b, records| {
            b.iter(|| black_box(AggregatePresence::fold(black_box(records), now, None)));
        });
    }
    group.finish();
}

fn bench_presence_fold_stale_window(c: &mut Criterion) {
    let now = Utc.timestamp_millis_opt(1_700_000_100_000).unwrap();
    let records = sessions(1_000);
    c.bench_function("presence_fold_stale_1000", |b| {
        b.iter(|| {
            black_box(AggregatePresence::fold(
                black_box(&records),
                now,
                Some(Duration::from_secs(60)),
            ))
        })
    });
}

fn bench_notification_query(c: &mut Criterion) {
    let query = QueryConstraints::new()
        .filter("recipient", FilterOp::Eq, "u7")
        .order_by("createdAt", Direction::Desc)
        .limit(50);
    let mut group = c.benchmark_group("notification_query");
    for n in [1_000usize, 10_000] {
        let docs = inbox(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &docs, |b, docs| {
            b.iter(|| black_box(query.execute(black_box(docs).iter())));
        });
    }
    group.finish();
}

fn bench_constraint_equality(c: &mut Criterion) {
    let build = || {
        QueryConstraints::new()
            .filter("recipient", FilterOp::Eq, "u1")
            .filter("read", FilterOp::Eq, false)
            .order_by("createdAt", Direction::Desc)
            .limit(50)
    };
    let a = build();
    let b_ = build();
    c.bench_function("constraints_eq", |b| {
        b.iter(|| black_box(black_box(&a) == black_box(&b_)))
    });
}

criterion_group!(
    benches,
    bench_presence_fold,
    bench_presence_fold_stale_window,
    bench_notification_query,
    bench_constraint_equality,
);
criterion_main!(benches);
