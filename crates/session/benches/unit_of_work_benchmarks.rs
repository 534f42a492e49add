use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use docunit_core::{EntityDefinition, EntityId, FieldType, SequentialIdGenerator};
use docunit_session::{EntityRef, GraphBuilder, NodeDefinition, PersistenceCoordinator, RelationshipGraph};
use docunit_store::InMemoryDocumentStore;
use std::sync::Arc;

type Units = PersistenceCoordinator<InMemoryDocumentStore, SequentialIdGenerator>;

fn graph() -> Arc<RelationshipGraph> {
    let mut builder = GraphBuilder::new();
    builder
        .define(
            EntityDefinition::new("Employee")
                .field("name", FieldType::String)
                .field("wage", FieldType::Integer),
        )
        .unwrap()
        .define(EntityDefinition::new("Team").field("name", FieldType::String))
        .unwrap()
        .parent_node("Employee", NodeDefinition::new("team"))
        .unwrap()
        .child_nodes(
            "Team",
            NodeDefinition::new("members").target("Employee").cascade(true),
        )
        .unwrap();
    builder.build()
}

fn units() -> Units {
    PersistenceCoordinator::with_ids(
        InMemoryDocumentStore::new(),
        SequentialIdGenerator::new(),
        graph(),
    )
}

/// Coordinator with `size` committed employees, all tracked as clean.
fn populated(size: usize) -> (Units, Vec<EntityRef>) {
    let mut units = units();
    let mut employees = Vec::with_capacity(size);
    for i in 0..size {
        let employee = units.new_entity("Employee").unwrap();
        units.set_field(&employee, "name", format!("employee-{i}")).unwrap();
        units.set_field(&employee, "wage", i as i64).unwrap();
        units.persist(&employee).unwrap();
        employees.push(employee);
    }
    units.commit().unwrap();
    (units, employees)
}

fn bench_identity_map_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity_map_lookup");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("find_tracked", size), size, |b, &size| {
            let (mut units, employees) = populated(size);
            let ids: Vec<EntityId> = employees.iter().filter_map(EntityRef::id).collect();
            let mut next = 0;
            b.iter(|| {
                let id = &ids[next % ids.len()];
                next += 1;
                black_box(units.find("Employee", id).unwrap());
            });
        });
    }

    // Cold lookups go to the store and hydrate a fresh instance.
    group.bench_function("find_from_store", |b| {
        let (mut units, employees) = populated(100);
        let id = employees[0].id().unwrap();
        b.iter(|| {
            units.clear();
            black_box(units.find("Employee", &id).unwrap());
        });
    });

    group.finish();
}

fn bench_change_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_detection");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("detect_changes", size), size, |b, &size| {
            let (mut units, employees) = populated(size);
            // Every tenth entity differs from its baseline.
            for employee in employees.iter().step_by(10) {
                employee.set("wage", -1).unwrap();
            }
            b.iter(|| {
                units.session_mut().detect_changes();
                black_box(units.session().changed_entities().len());
            });
        });
    }

    group.finish();
}

fn bench_commit_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("insert_batch", batch_size),
            batch_size,
            |b, &size| {
                b.iter_batched(
                    || {
                        let mut units = units();
                        for i in 0..size {
                            let employee = units.new_entity("Employee").unwrap();
                            employee.set("wage", i as i64).unwrap();
                            units.persist(&employee).unwrap();
                        }
                        units
                    },
                    |mut units| black_box(units.commit().unwrap()),
                    BatchSize::SmallInput,
                );
            },
        );

        group.bench_with_input(
            BenchmarkId::new("cascade_insert", batch_size),
            batch_size,
            |b, &size| {
                b.iter_batched(
                    || {
                        let mut units = units();
                        let team = units.new_entity("Team").unwrap();
                        for _ in 0..size {
                            let employee = units.new_entity("Employee").unwrap();
                            units.collection(&team, "members").unwrap().push(&employee).unwrap();
                        }
                        (units, team)
                    },
                    |(mut units, team)| {
                        units.persist(&team).unwrap();
                        black_box(units.commit().unwrap())
                    },
                    BatchSize::SmallInput,
                );
            },
        );

        group.bench_with_input(
            BenchmarkId::new("update_batch", batch_size),
            batch_size,
            |b, &size| {
                b.iter_batched(
                    || {
                        let (mut units, employees) = populated(size);
                        for employee in &employees {
                            units.set_field(employee, "wage", 1_000_000).unwrap();
                        }
                        units
                    },
                    |mut units| black_box(units.commit().unwrap()),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_identity_map_lookup,
    bench_change_detection,
    bench_commit_throughput
);
criterion_main!(benches);
