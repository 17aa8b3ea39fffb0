//! Gateway batches and workflow drivers, end to end.

mod common;

use common::{MockTransport, Step};
use convoy::hooks;
use convoy::prelude::*;
use convoy::{AttemptRunner, WaitStrategy};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn op(id: &str, path: &str) -> Operation {
    Operation::request(id, HttpCall::get("api.example.com", path).unwrap())
}

fn fast(attempts: u32) -> CommonConfig {
    CommonConfig::new()
        .with_attempts(attempts)
        .with_backoff(WaitStrategy::Fixed, Duration::ZERO)
}

#[tokio::test]
async fn grouped_gateway_mixes_critical_and_optional_leaves() {
    let transport = Arc::new(
        MockTransport::new()
            .script("/critical", vec![Step::status(500, json!(null))])
            .script("/optional", vec![Step::status(500, json!(null))]),
    );
    let executor = GatewayExecutor::new(AttemptRunner::new().with_transport(transport.clone()));

    let mut optional_config = fast(1);
    optional_config.final_error_analyzer = Some(hooks::suppress_final_error());
    let groups = vec![
        Group::new("critical", fast(3)),
        Group::new("optional", optional_config),
    ];
    let ops = vec![
        op("a", "/critical").in_group("critical"),
        op("b", "/optional").in_group("optional"),
    ];

    let report = executor
        .run(&ops, &groups, &GatewayOptions::default(), &[], &CancellationToken::new())
        .await;

    // A retried three times and failed; B tried once and was suppressed.
    assert_eq!(transport.calls_to("/critical"), 3);
    assert_eq!(transport.calls_to("/optional"), 1);
    assert_eq!(report.entries.len(), 2);
    assert_eq!(report.entries[0].request_id, "a");
    assert!(!report.entries[0].success);
    assert!(report.entries[0].error.is_some());
    let optional = &report.entries[1];
    assert!(!optional.success);
    assert!(optional.error.is_none());
    assert_eq!(optional.data, Some(json!(false)));
    // Nothing threw; both outcomes are structured results.
    assert_eq!(report.metrics.total_requests, 2);
    assert_eq!(report.metrics.failed_requests, 2);
}

#[tokio::test]
async fn mixed_workflow_interleaves_concurrent_groups() {
    let transport = Arc::new(
        MockTransport::new()
            .script("/p1", vec![Step::status(200, json!(1))])
            .script("/p2", vec![Step::delayed(200, json!(2), Duration::from_millis(30))])
            .script("/p3", vec![Step::delayed(200, json!(3), Duration::from_millis(30))])
            .script("/p4", vec![Step::status(200, json!(4))]),
    );
    let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport.clone()),
    )));

    let phases = vec![
        Phase::new("p1", vec![op("p1", "/p1")]),
        Phase::new("p2", vec![op("p2", "/p2")]).marked_concurrent(),
        Phase::new("p3", vec![op("p3", "/p3")]).marked_concurrent(),
        Phase::new("p4", vec![op("p4", "/p4")]),
    ];
    let options = WorkflowOptions::new().with_global(fast(1)).mixed();
    let report = engine.run(phases, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success);
    let index = |e: &str| transport.event_index(e).unwrap();
    // P1 before the group; both group members in flight together; P4 after.
    assert!(index("end /p1") < index("start /p2"));
    assert!(index("end /p1") < index("start /p3"));
    assert!(index("start /p2") < index("end /p3"));
    assert!(index("start /p3") < index("end /p2"));
    assert!(index("end /p2") < index("start /p4"));
    assert!(index("end /p3") < index("start /p4"));

    // Aggregate counters equal the sum over phases.
    let total: u64 = report.phases.iter().map(|p| p.total_requests).sum();
    assert_eq!(report.metrics.total_requests, total);
    assert_eq!(report.metrics.successful_requests, 4);
    assert_eq!(report.metrics.executed_phases, 4);
}

#[tokio::test]
async fn workflow_guardrails_flag_failures_without_halting() {
    let transport = Arc::new(
        MockTransport::new()
            .script("/bad", vec![Step::status(500, json!(null))])
            .script("/good", vec![Step::status(200, json!(1))]),
    );
    let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport),
    )));

    let mut guardrails = MetricsGuardrails::new();
    guardrails.workflow.insert("failed_requests".into(), Guardrail::max(0.0));
    let mut global = fast(1);
    global.guardrails = Some(Arc::new(guardrails));

    let phases = vec![
        Phase::new("bad", vec![op("bad", "/bad")]),
        Phase::new("good", vec![op("good", "/good")]),
    ];
    let options = WorkflowOptions::new().with_global(global);
    let report = engine.run(phases, &options, &CancellationToken::new()).await.unwrap();

    // Both phases executed; validation reports the violation alongside.
    assert_eq!(report.phases.len(), 2);
    assert!(!report.success);
    let validation = report.validation.unwrap();
    assert_eq!(validation.anomalies.len(), 1);
    assert_eq!(validation.anomalies[0].name, "failed_requests");
}

#[tokio::test]
async fn shared_buffer_serializes_hook_writes_across_a_phase() {
    let transport =
        Arc::new(MockTransport::new().script("/ok", vec![Step::status(200, json!("ok"))]));
    let buffer = SharedBuffer::new();
    let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport),
    )));

    let hook_buffer = buffer.clone();
    let mut global = fast(1);
    global.buffer = Some(buffer.clone());
    global.on_success = Some(hooks::success_hook(move |outcome| {
        let buffer = hook_buffer.clone();
        async move {
            buffer
                .run(TxOptions::new("record", "count_success"), |state| {
                    let n = state.get("successes").and_then(|v| v.as_i64()).unwrap_or(0);
                    state.insert("successes".into(), json!(n + 1));
                    state.insert("last".into(), json!(outcome.operation_id));
                    Ok::<_, std::convert::Infallible>(())
                })
                .await
                .ok();
            Ok(())
        }
    }));

    let ops: Vec<Operation> = (0..6).map(|i| op(&format!("op{}", i), "/ok")).collect();
    let phases = vec![Phase::new("batch", ops).concurrent()];
    let options = WorkflowOptions::new().with_global(global);
    let report = engine.run(phases, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success);
    // No lost updates under concurrency.
    assert_eq!(buffer.read("successes").await, Some(json!(6)));
    let successes = buffer.log().iter().filter(|r| r.success).count() as u64;
    assert_eq!(successes, buffer.metrics().transactions - buffer.metrics().failed_transactions);
    assert_eq!(buffer.metrics().transactions, 6);
}
