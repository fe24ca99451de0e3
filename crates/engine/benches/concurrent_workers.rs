//! Concurrent dispatch benchmark
//!
//! Several tokio tasks drive independent workflow executions against one
//! shared `InMemoryExecutionStore`, measuring how dispatch throughput holds
//! up under lock contention on the store as worker count grows.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

use workflow_engine::prelude::*;

fn fanout_spec() -> WorkflowSpec {
    parse_workflow_spec(
        r#"
version: "1.0"
name: bench-fanout
type: direct
start-task: t1
tasks:
  t1:
    action: bench.noop
    on-success:
      - task: t2
      - task: t3
  t2:
    action: bench.noop
    on-success:
      - task: join
  t3:
    action: bench.noop
    on-success:
      - task: join
  join:
    action: bench.noop
    join: all
"#,
    )
    .unwrap()
}

async fn drive_workflow(
    store: &Arc<InMemoryExecutionStore>,
    dispatcher: &Dispatcher<InMemoryExecutionStore>,
    spec: &WorkflowSpec,
) {
    let workflow_id = dispatcher.start(spec, json!({}), "bench").await.unwrap();

    // t1 completes, fanning out to t2 and t3.
    complete_next_running(store, dispatcher, workflow_id).await;
    complete_next_running(store, dispatcher, workflow_id).await;
    complete_next_running(store, dispatcher, workflow_id).await;
    // join fires once both branches report in.
    complete_next_running(store, dispatcher, workflow_id).await;
}

async fn complete_next_running(
    store: &Arc<InMemoryExecutionStore>,
    dispatcher: &Dispatcher<InMemoryExecutionStore>,
    workflow_id: uuid::Uuid,
) {
    let tasks = store.list_task_executions(workflow_id).await.unwrap();
    let task = tasks
        .into_iter()
        .find(|t| t.state == ExecutionState::Running)
        .expect("a task should be running");
    let action = store
        .list_action_executions(task.id)
        .await
        .unwrap()
        .into_iter()
        .max_by_key(|a| a.attempt)
        .expect("running task has an action execution");

    dispatcher
        .dispatch(DispatchEvent::new(
            workflow_id,
            DispatchEventKind::ActionDone {
                task_execution_id: task.id,
                action_execution_id: action.id,
                success: true,
                result: Some(json!("ok")),
                error: None,
            },
        ))
        .await
        .unwrap();
}

fn bench_concurrent_workers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let spec = Arc::new(fanout_spec());

    let mut group = c.benchmark_group("concurrent_workers");

    for worker_count in [1, 4, 16] {
        group.throughput(Throughput::Elements(worker_count as u64));
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter(|| {
                    let spec = spec.clone();
                    async move {
                        let store = Arc::new(InMemoryExecutionStore::new());
                        let mut tx = store.begin().await.unwrap();
                        store
                            .put_workflow_definition(&mut tx, "bench", (*spec).clone())
                            .await
                            .unwrap();
                        store.commit(tx).await.unwrap();

                        let dispatcher = Arc::new(Dispatcher::new(store.clone()));

                        let mut handles = Vec::with_capacity(worker_count);
                        for _ in 0..worker_count {
                            let store = store.clone();
                            let dispatcher = dispatcher.clone();
                            let spec = spec.clone();
                            handles.push(tokio::spawn(async move {
                                drive_workflow(&store, &dispatcher, &spec).await;
                            }));
                        }
                        for handle in handles {
                            handle.await.unwrap();
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_workers);
criterion_main!(benches);
