//! Non-linear workflows and graph traversal, end to end.

mod common;

use common::{MockTransport, Step};
use convoy::hooks;
use convoy::prelude::*;
use convoy::{AttemptRunner, WaitStrategy, RACE_LOSER_ERROR};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn op(id: &str, path: &str) -> Operation {
    Operation::request(id, HttpCall::get("api.example.com", path).unwrap())
}

fn fast() -> CommonConfig {
    CommonConfig::new().with_attempts(1).with_backoff(WaitStrategy::Fixed, Duration::ZERO)
}

fn phase(id: &str) -> Phase {
    Phase::new(id, vec![op(&format!("{}-op", id), &format!("/{}", id))])
}

fn ok(path: &str) -> (String, Vec<Step>) {
    (path.to_string(), vec![Step::status(200, json!({}))])
}

fn transport_for(paths: &[&str]) -> Arc<MockTransport> {
    let mut transport = MockTransport::new();
    for path in paths {
        let (p, steps) = ok(path);
        transport = transport.script(&p, steps);
    }
    Arc::new(transport)
}

#[tokio::test]
async fn jump_decision_skips_the_middle_phase() {
    let transport = transport_for(&["/check", "/skipme", "/target"]);
    let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport.clone()),
    )));

    let check = phase("check").with_decision_hook(hooks::phase_decision(|_| async {
        Ok(Decision::jump_to("target"))
    }));
    let phases = vec![check, phase("skipme"), phase("target")];
    let options = WorkflowOptions::new().with_global(fast()).non_linear();
    let report = engine.run(phases, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success);
    let visited: Vec<&str> = report.history.iter().map(|h| h.phase_id.as_str()).collect();
    assert_eq!(visited, vec!["check", "target"]);
    // The skipped phase never ran: zero counters, zero transport calls.
    assert_eq!(transport.calls_to("/skipme"), 0);
    assert!(report.phases.iter().all(|p| p.phase_id != "skipme"));
    assert_eq!(report.metrics.total_requests, 2);
}

#[tokio::test]
async fn replay_loops_consume_execution_numbers() {
    let transport = Arc::new(MockTransport::new().script(
        "/poll",
        vec![
            Step::status(200, json!({"done": false})),
            Step::status(200, json!({"done": false})),
            Step::status(200, json!({"done": true})),
        ],
    ));
    let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport.clone()),
    )));

    let poll = Phase::new("poll", vec![op("poll", "/poll")])
        .with_max_replay_count(5)
        .with_decision_hook(hooks::phase_decision(|input| async move {
            let done = input
                .phase
                .responses
                .first()
                .and_then(|r| r.data.as_ref())
                .and_then(|d| d.get("done"))
                .and_then(|d| d.as_bool())
                .unwrap_or(false);
            Ok(if done { Decision::proceed() } else { Decision::replay() })
        }));
    let phases = vec![poll, phase("after")];
    let options = WorkflowOptions::new().with_global(fast()).non_linear();
    let report = engine.run(phases, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(transport.calls_to("/poll"), 3);
    let polls: Vec<u32> = report
        .history
        .iter()
        .filter(|h| h.phase_id == "poll")
        .map(|h| h.execution_number)
        .collect();
    assert_eq!(polls, vec![1, 2, 3]);
    assert_eq!(report.history.last().unwrap().phase_id, "after");
}

#[tokio::test]
async fn graph_merges_after_racing_branches() {
    let transport = Arc::new(
        MockTransport::new()
            .script("/start", vec![Step::status(200, json!({}))])
            .script("/slow", vec![Step::delayed(200, json!({}), Duration::from_millis(400))])
            .script("/quick", vec![Step::delayed(200, json!({}), Duration::from_millis(10))])
            .script("/end", vec![Step::status(200, json!({}))]),
    );
    let engine = GraphEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport.clone()),
    )));

    let branch_a = Branch::new("a", vec![phase("slow")]);
    let branch_b = Branch::new("b", vec![phase("quick")]);
    let graph = Graph::new("start")
        .add_node(Node::phase(phase("start")))
        .add_node(Node::parallel("race", vec!["a".into(), "b".into()]))
        .add_node(Node::branch(branch_a))
        .add_node(Node::branch(branch_b))
        .add_node(Node::merge("join", vec!["a".into(), "b".into()]))
        .add_node(Node::phase(phase("end")))
        .add_edge("start", Edge::on_success("race"))
        .add_edge("race", Edge::always("join"))
        .add_edge("join", Edge::always("end"));

    let options = GraphOptions { global: fast(), enable_racing: true, ..GraphOptions::default() };
    let report = engine.run(&graph, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success, "reason: {:?}", report.termination_reason);
    // B's phase completed; A was cancelled and reported skipped.
    let winner = report.branches.iter().find(|b| b.branch_id == "b").unwrap();
    assert!(winner.success);
    assert!(winner.phases.iter().all(|p| p.success));
    let loser = report.branches.iter().find(|b| b.branch_id == "a").unwrap();
    assert!(loser.skipped);
    assert_eq!(loser.error.as_deref(), Some(RACE_LOSER_ERROR));
    // The merge fired only after both children were visited (the cancelled
    // one counts), and the exit node ran exactly once.
    let pos = |id: &str| report.node_order.iter().position(|n| n == id).unwrap();
    assert!(pos("a") < pos("join"));
    assert!(pos("b") < pos("join"));
    assert!(pos("join") < pos("end"));
    assert_eq!(report.node_order.iter().filter(|n| *n == "end").count(), 1);
    assert_eq!(transport.calls_to("/end"), 1);
}

#[tokio::test]
async fn conditional_routes_on_buffer_state() {
    let transport = transport_for(&["/seed", "/left", "/right"]);
    let buffer = SharedBuffer::new();
    buffer
        .run(TxOptions::new("seed", "route"), |state| {
            state.insert("route".into(), json!("right"));
            Ok::<_, std::convert::Infallible>(())
        })
        .await
        .unwrap();

    let engine = GraphEngine::new(PhaseEngine::new(GatewayExecutor::new(
        AttemptRunner::new().with_transport(transport.clone()),
    )));
    let mut global = fast();
    global.buffer = Some(buffer);

    let graph = Graph::new("seed")
        .add_node(Node::phase(phase("seed")))
        .add_node(Node::conditional(
            "route",
            Arc::new(|ctx: convoy::EdgeContext| {
                Box::pin(async move {
                    let buffer = ctx.buffer.ok_or("no buffer")?;
                    let route = buffer.read("route").await.ok_or("no route key")?;
                    route.as_str().map(|s| s.to_string()).ok_or_else(|| "bad route".to_string())
                })
            }),
        ))
        .add_node(Node::phase(phase("left")))
        .add_node(Node::phase(phase("right")))
        .add_edge("seed", Edge::on_success("route"));

    let options = GraphOptions { global, ..GraphOptions::default() };
    let report = engine.run(&graph, &options, &CancellationToken::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(transport.calls_to("/right"), 1);
    assert_eq!(transport.calls_to("/left"), 0);
}
