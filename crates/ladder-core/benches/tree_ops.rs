use chrono::{TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ladder_core::drag;
use ladder_core::model::{Forest, Level, Task, codec};
use ladder_core::tree;

struct Tier {
    name: &'static str,
    goals: usize,
    fanout: usize,
}

const TIERS: [Tier; 3] = [
    Tier {
        name: "small",
        goals: 5,
        fanout: 3,
    },
    Tier {
        name: "medium",
        goals: 20,
        fanout: 6,
    },
    Tier {
        name: "large",
        goals: 60,
        fanout: 10,
    },
];

fn ladder(tier: &Tier) -> Forest {
    let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let node = |id: String, level: Level, parent: Option<&str>, children: Forest| Task {
        title: format!("{level} {id}"),
        id,
        description: None,
        completed: false,
        level,
        parent_id: parent.map(str::to_string),
        children,
        order: 0,
        created_at: at,
        updated_at: None,
    };

    let goals: Forest = (0..tier.goals)
        .map(|g| {
            let gid = format!("g{g}");
            let metrics = (0..tier.fanout)
                .map(|m| {
                    let mid = format!("{gid}-m{m}");
                    let actions = (0..tier.fanout)
                        .map(|a| node(format!("{mid}-a{a}"), Level::Action, Some(&mid), Forest::new()))
                        .collect();
                    node(mid.clone(), Level::Metric, Some(&gid), actions)
                })
                .collect();
            node(gid.clone(), Level::Goal, None, metrics)
        })
        .collect();
    tree::reorder(&goals)
}

fn bench_tree_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree_ops");
    let now = Utc.timestamp_opt(1_700_000_100, 0).unwrap();

    for tier in &TIERS {
        let forest = ladder(tier);
        let last_goal = format!("g{}", tier.goals - 1);
        let deep_action = format!("{last_goal}-m{}-a0", tier.fanout - 1);
        let blob = codec::encode_tree(&forest).unwrap();
        group.throughput(Throughput::Elements(tree::count(&forest) as u64));

        group.bench_with_input(BenchmarkId::new("toggle_goal", tier.name), &forest, |b, forest| {
            b.iter(|| black_box(tree::toggle_completion(forest, &last_goal, now)))
        });

        group.bench_with_input(BenchmarkId::new("toggle_leaf", tier.name), &forest, |b, forest| {
            b.iter(|| black_box(tree::toggle_completion(forest, &deep_action, now)))
        });

        group.bench_with_input(BenchmarkId::new("drop_action", tier.name), &forest, |b, forest| {
            b.iter(|| black_box(drag::resolve_drop(forest, &deep_action, "g0-m0", now)))
        });

        group.bench_with_input(BenchmarkId::new("flatten_rebuild", tier.name), &forest, |b, forest| {
            b.iter(|| black_box(tree::build_forest(tree::to_records(forest), now)))
        });

        group.bench_with_input(BenchmarkId::new("decode_blob", tier.name), &blob, |b, blob| {
            b.iter(|| black_box(codec::decode_tree(blob, now)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tree_ops);
criterion_main!(benches);
