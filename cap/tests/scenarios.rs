//! End-to-end scenario tests for the cascade engine
//!
//! Every scenario drives a full cascade through the public `run_cascade`
//! entry point against the mock agent and in-memory stores, then checks the
//! durable artifacts: session status, unified log rows, lineage and state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capstan::agent::{Agent, AgentError, AgentRequest, AgentResponse, MockAgent, text_response};
use capstan::cascade::config::{
    CascadeConfig, ContextConfig, ContextSource, EvaluatorKind, Handoff, ModelAssignment, ModelEntry, MutationMode,
    ParetoConfig, ParetoPolicy, PhaseConfig, RulesConfig, SoundingsConfig, TimeoutFallback,
};
use capstan::cascade::{CascadeRunner, RunOptions, run_cascade};
use capstan::runtime::Harness;
use serde_json::json;
use unilog::{LogFilter, SessionStatus};

fn phase(name: &str, instructions: &str) -> PhaseConfig {
    PhaseConfig {
        name: name.to_string(),
        instructions: instructions.to_string(),
        ..Default::default()
    }
}

fn cascade(id: &str, phases: Vec<PhaseConfig>) -> CascadeConfig {
    CascadeConfig {
        cascade_id: id.to_string(),
        phases,
        ..Default::default()
    }
}

fn harness(agent: MockAgent) -> Arc<Harness> {
    Harness::builder(Arc::new(agent)).build().unwrap()
}

// =============================================================================
// S1 - Two-phase linear with declared context
// =============================================================================

#[tokio::test]
async fn s1_two_phase_linear_with_context() {
    let agent = Arc::new(MockAgent::from_texts(vec!["hello", "A said: hello"]));
    let harness = Harness::builder(Arc::clone(&agent) as Arc<dyn Agent>).build().unwrap();

    let mut a = phase("a", "Produce a greeting for {{input}}");
    a.handoffs = vec![Handoff::Name("b".to_string())];
    let mut b = phase("b", "Echo what A said");
    b.context = Some(ContextConfig {
        from: vec![ContextSource::Name("a".to_string())],
        ..Default::default()
    });

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("linear", vec![a, b]),
        "the user",
        Some("s1".to_string()),
    )
    .await
    .unwrap();

    // Final output flows from the last phase
    assert!(snapshot.final_output.as_deref().unwrap().contains("hello"));
    assert_eq!(snapshot.lineage[1].output, "A said: hello");

    // Phase b actually saw a's output as injected context
    let requests = agent.requests();
    assert_eq!(requests.len(), 2);
    let injected: Vec<String> = requests[1]
        .context
        .iter()
        .map(|m| m.content.text_lossy())
        .collect();
    assert!(injected.iter().any(|m| m.contains("[Output from a]") && m.contains("hello")));

    // Log holds two phase groups
    harness.log.flush().await;
    let mut filter = LogFilter::session("s1");
    filter.node_type = Some("phase".to_string());
    assert_eq!(harness.log.query(&filter).unwrap().len(), 2);

    // Session durability: terminal status after run_cascade returns
    assert_eq!(harness.sessions.get("s1").unwrap().status, SessionStatus::Completed);
}

// =============================================================================
// S2 - Soundings, quality-only evaluation
// =============================================================================

#[tokio::test]
async fn s2_soundings_quality_only() {
    // Three serialized attempts of lengths 10, 30, 20, then the evaluator
    let outputs = ["aaaaaaaaaa", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbb", "cccccccccccccccccccc"];
    let mut responses: Vec<AgentResponse> = outputs.iter().map(|o| text_response(o)).collect();
    responses.push(text_response("2"));
    let harness = harness(MockAgent::new(responses));

    let mut p = phase("draft", "Write something");
    p.soundings = Some(SoundingsConfig {
        factor: 3,
        max_parallel: 1,
        mutation_mode: MutationMode::Approach,
        evaluator: EvaluatorKind::Llm,
        evaluator_instructions: Some("pick the longest".to_string()),
        ..Default::default()
    });

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("soundings", vec![p]),
        "go",
        Some("s2".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(snapshot.final_output.as_deref(), Some(outputs[1]));

    harness.log.flush().await;

    // Exactly three sounding attempts were logged
    let analysis = harness.log.soundings_analysis("s2", "draft").unwrap();
    assert_eq!(analysis.len(), 3);

    // Winner uniqueness: a single winning index, the 30-char attempt
    let winners: Vec<i64> = analysis
        .iter()
        .filter(|(_, is_winner, ..)| *is_winner == Some(true))
        .map(|(index, ..)| *index)
        .collect();
    assert_eq!(winners, vec![1]);

    // Idempotent winner marking: repeating the mark changes nothing
    harness.log.mark_winners("s2", "draft", &[1]).unwrap();
    let again = harness.log.soundings_analysis("s2", "draft").unwrap();
    let winners_again: Vec<i64> = again
        .iter()
        .filter(|(_, is_winner, ..)| *is_winner == Some(true))
        .map(|(index, ..)| *index)
        .collect();
    assert_eq!(winners_again, vec![1]);
}

// =============================================================================
// S3 - Pareto selection, balanced policy
// =============================================================================

#[tokio::test]
async fn s3_pareto_balanced_selection() {
    // Three attempts with explicit provider costs, then the scorer
    let mut responses = Vec::new();
    for (text, cost) in [("attempt zero", 0.01), ("attempt one", 0.05), ("attempt two", 0.02)] {
        let mut response = text_response(text);
        response.cost = Some(cost);
        response.model = "m".to_string();
        responses.push(response);
    }
    responses.push(text_response(r#"{"scores": [70, 90, 85]}"#));
    let harness = harness(MockAgent::new(responses));

    let mut models = std::collections::BTreeMap::new();
    models.insert("m1".to_string(), ModelEntry { factor: 1 });
    models.insert("m2".to_string(), ModelEntry { factor: 2 });

    let mut p = phase("draft", "Write something");
    p.soundings = Some(SoundingsConfig {
        factor: 3,
        max_parallel: 1,
        mutate: false,
        models: Some(ModelAssignment::Map(models)),
        pareto_frontier: Some(ParetoConfig {
            enabled: true,
            policy: ParetoPolicy::Balanced,
        }),
        ..Default::default()
    });

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("pareto", vec![p]),
        "go",
        Some("s3".to_string()),
    )
    .await
    .unwrap();

    // Balanced winner: 85/0.02 = 4250 beats 90/0.05 above the median
    assert_eq!(snapshot.final_output.as_deref(), Some("attempt two"));

    harness.log.flush().await;

    // All three are on the frontier: pareto_rank 1 everywhere
    let mut filter = LogFilter::session("s3");
    filter.node_type = Some("pareto_candidate".to_string());
    let rows = harness.log.query(&filter).unwrap();
    assert_eq!(rows.len(), 3);
    for row in &rows {
        let metadata: serde_json::Value = serde_json::from_str(row.metadata_json.as_deref().unwrap()).unwrap();
        assert_eq!(metadata["pareto_rank"], 1);
    }

    // Winner marked on sounding index 2
    let analysis = harness.log.soundings_analysis("s3", "draft").unwrap();
    let winners: Vec<i64> = analysis
        .iter()
        .filter(|(_, is_winner, ..)| *is_winner == Some(true))
        .map(|(index, ..)| *index)
        .collect();
    assert_eq!(winners, vec![2]);
}

// =============================================================================
// S4 - loop_until satisfied on the second turn
// =============================================================================

#[tokio::test]
async fn s4_loop_until_with_retry_budget() {
    let agent = Arc::new(MockAgent::from_texts(vec!["plain text", r#"{"x": 1}"#]));
    let harness = Harness::builder(Arc::clone(&agent) as Arc<dyn Agent>).build().unwrap();

    let mut p = phase("until", "Produce JSON");
    p.rules = RulesConfig {
        max_turns: 2,
        max_attempts: 3,
        loop_until: Some("has_json".to_string()),
        ..Default::default()
    };

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("looping", vec![p]),
        "go",
        Some("s4".to_string()),
    )
    .await
    .unwrap();

    // One attempt, two turns, validation passed
    assert_eq!(agent.call_count(), 2);
    assert_eq!(snapshot.final_output.as_deref(), Some(r#"{"x": 1}"#));
    assert!(!snapshot.state.contains_key("last_validation_error"));
    assert_eq!(harness.sessions.get("s4").unwrap().status, SessionStatus::Completed);

    harness.log.flush().await;
    let mut filter = LogFilter::session("s4");
    filter.role = Some("assistant".to_string());
    let rows = harness.log.query(&filter).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.attempt_number == Some(0)));
}

// =============================================================================
// S5 - Decision routing with self-retry feedback
// =============================================================================

#[tokio::test]
async fn s5_decision_routing_self_then_next() {
    let decision_output = r#"Draft ready.
<decision>{"question": "proceed?", "options": [{"id": "yes", "action": "next"}, {"id": "no", "action": "self"}]}</decision>"#;
    let harness = harness(MockAgent::from_texts(vec![decision_output, decision_output]));

    let p = phase("gate", "Draft and ask");
    let runner = CascadeRunner::new(Arc::clone(&harness));
    let run = runner.run(
        Arc::new(cascade("decisions", vec![p])),
        "go".to_string(),
        RunOptions {
            session_id: Some("s5".to_string()),
            ..Default::default()
        },
    );
    let task = tokio::spawn(run);

    // First decision: the human says "no, try again"
    let first = wait_for_checkpoint(&harness, "s5").await;
    harness
        .checkpoints
        .post_response(&first, json!({"decision_choice": "no", "decision_custom": "try again"}));

    // Second pass: the human approves
    let second = wait_for_checkpoint(&harness, "s5").await;
    assert_ne!(first, second);
    harness
        .checkpoints
        .post_response(&second, json!({"decision_choice": "yes"}));

    let snapshot = task.await.unwrap().unwrap();
    assert_eq!(
        snapshot.state.get("_decision_feedback").and_then(|v| v.as_str()),
        Some("try again")
    );
    assert_eq!(harness.sessions.get("s5").unwrap().status, SessionStatus::Completed);
}

async fn wait_for_checkpoint(harness: &Arc<Harness>, session_id: &str) -> String {
    for _ in 0..200 {
        let pending = harness.checkpoints.pending(Some(session_id));
        if let Some(record) = pending.first() {
            return record.id.clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("No checkpoint appeared for session {}", session_id);
}

// =============================================================================
// S6 - Human sounding eval timeout falls back to the LLM
// =============================================================================

#[tokio::test]
async fn s6_human_eval_timeout_llm_fallback() {
    // Two attempts, then the fallback evaluator picks attempt 1
    let harness = harness(MockAgent::from_texts(vec!["attempt zero", "attempt one", "1"]));

    let mut p = phase("judged", "Write something");
    p.soundings = Some(SoundingsConfig {
        factor: 2,
        max_parallel: 1,
        mutate: false,
        evaluator: EvaluatorKind::Human,
        timeout_seconds: Some(1),
        on_timeout: TimeoutFallback::LlmFallback,
        ..Default::default()
    });

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("timeout", vec![p]),
        "go",
        Some("s6".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(snapshot.final_output.as_deref(), Some("attempt zero"));
    assert_eq!(harness.sessions.get("s6").unwrap().status, SessionStatus::Completed);

    harness.log.flush().await;

    // One checkpoint_timeout row
    let mut filter = LogFilter::session("s6");
    filter.node_type = Some("checkpoint_timeout".to_string());
    assert_eq!(harness.log.query(&filter).unwrap().len(), 1);

    // The winner selection row records the fallback mode
    let mut filter = LogFilter::session("s6");
    filter.node_type = Some("winner_selection".to_string());
    let rows = harness.log.query(&filter).unwrap();
    assert_eq!(rows.len(), 1);
    let metadata: serde_json::Value = serde_json::from_str(rows[0].metadata_json.as_deref().unwrap()).unwrap();
    assert_eq!(metadata["evaluation_mode"], "llm_fallback");
}

// =============================================================================
// Universal properties
// =============================================================================

#[tokio::test]
async fn universal_context_selectivity_clean_slate() {
    // Phase b declares no context: it must not see a's messages
    let agent = Arc::new(MockAgent::from_texts(vec!["from a", "from b"]));
    let harness = Harness::builder(Arc::clone(&agent) as Arc<dyn Agent>).build().unwrap();

    let mut a = phase("a", "First");
    a.handoffs = vec![Handoff::Name("b".to_string())];
    let b = phase("b", "Second");

    run_cascade(harness, cascade("clean", vec![a, b]), "go", None)
        .await
        .unwrap();

    let requests = agent.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].context.is_empty());
}

#[tokio::test]
async fn universal_log_completeness_for_tools() {
    // Every agent message and tool invocation shows up as a linked log row
    let mut registry = capstan::ToolRegistry::new();
    registry.register_fn("probe", "A probe", json!({"type": "object"}), |_| Ok(json!("ok")));

    let agent = MockAgent::from_texts(vec![
        "```json\n{\"tool\": \"probe\", \"arguments\": {}}\n```",
        "finished",
    ]);
    let harness = Harness::builder(Arc::new(agent)).registry(registry).build().unwrap();

    let mut p = phase("tools", "Probe it");
    p.tackle = capstan::cascade::config::TackleSpec::Names(vec!["probe".to_string()]);

    run_cascade(Arc::clone(&harness), cascade("complete", vec![p]), "go", Some("ulog".to_string()))
        .await
        .unwrap();

    harness.log.flush().await;
    let rows = harness.log.query(&LogFilter::session("ulog")).unwrap();

    let assistant_count = rows.iter().filter(|r| r.role.as_deref() == Some("assistant")).count();
    assert_eq!(assistant_count, 2);
    assert!(rows.iter().any(|r| r.node_type == "tool_call"));
    assert!(rows.iter().any(|r| r.node_type == "tool_result"));

    // Tool rows link into the trace tree
    let call_row = rows.iter().find(|r| r.node_type == "tool_call").unwrap();
    assert!(call_row.parent_id.is_some());
    let result_row = rows.iter().find(|r| r.node_type == "tool_result").unwrap();
    assert_eq!(result_row.parent_id.as_deref(), Some(call_row.trace_id.as_str()));
}

#[tokio::test]
async fn universal_cancellation_monotonicity() {
    /// Agent that cancels its own session during the first call
    struct CancellingAgent {
        harness: std::sync::OnceLock<Arc<Harness>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Agent for CancellingAgent {
        async fn run(&self, _request: AgentRequest) -> Result<AgentResponse, AgentError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(harness) = self.harness.get() {
                harness.sessions.request_cancel("cancel-me", None).ok();
            }
            Ok(text_response("output"))
        }
    }

    let agent = Arc::new(CancellingAgent {
        harness: std::sync::OnceLock::new(),
        calls: std::sync::atomic::AtomicUsize::new(0),
    });
    let harness = Harness::builder(Arc::clone(&agent) as Arc<dyn Agent>).build().unwrap();
    agent.harness.set(Arc::clone(&harness)).ok();

    let mut a = phase("a", "First");
    a.handoffs = vec![Handoff::Name("b".to_string())];
    let b = phase("b", "Second");

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("cancellable", vec![a, b]),
        "go",
        Some("cancel-me".to_string()),
    )
    .await
    .unwrap();

    // Phase b never executed and the final status is cancelled
    assert_eq!(agent.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        harness.sessions.get("cancel-me").unwrap().status,
        SessionStatus::Cancelled
    );
    assert!(snapshot.lineage.len() <= 1);
}

#[tokio::test]
async fn universal_aggregate_inclusion() {
    // Aggregate mode: every surviving sounding is a winner
    let harness = harness(MockAgent::from_texts(vec!["part one", "part two"]));

    let mut p = phase("gather", "Collect views");
    p.soundings = Some(SoundingsConfig {
        factor: 2,
        max_parallel: 1,
        mutate: false,
        mode: capstan::cascade::config::SoundingMode::Aggregate,
        ..Default::default()
    });

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("agg", vec![p]),
        "go",
        Some("agg-1".to_string()),
    )
    .await
    .unwrap();

    // Concatenation carries both attempts
    let output = snapshot.final_output.unwrap();
    assert!(output.contains("part one"));
    assert!(output.contains("part two"));

    harness.log.flush().await;
    let analysis = harness.log.soundings_analysis("agg-1", "gather").unwrap();
    let winners: Vec<i64> = analysis
        .iter()
        .filter(|(_, is_winner, ..)| *is_winner == Some(true))
        .map(|(index, ..)| *index)
        .collect();
    assert_eq!(winners, vec![0, 1]);
}

#[tokio::test]
async fn universal_sub_cascade_runs_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let child_path = dir.path().join("child.json");
    std::fs::write(
        &child_path,
        r#"{"cascade_id": "child", "phases": [{"name": "only", "instructions": "Handle {{input}}"}]}"#,
    )
    .unwrap();

    // Parent phase, then the child's phase
    let harness = harness(MockAgent::from_texts(vec!["parent done", "child done"]));

    let mut p = phase("parent", "Do parent work");
    p.sub_cascades = vec![capstan::cascade::config::SubCascadeRef {
        path: child_path.display().to_string(),
        ..Default::default()
    }];

    let snapshot = run_cascade(
        Arc::clone(&harness),
        cascade("with-child", vec![p]),
        "go",
        Some("parent-1".to_string()),
    )
    .await
    .unwrap();

    // The child's final output merged into parent state
    assert_eq!(
        snapshot.state.get("output_child").and_then(|v| v.as_str()),
        Some("child done")
    );

    // The child session references its parent
    let children = harness
        .sessions
        .list(&unilog::SessionFilter {
            cascade_id: Some("child".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].parent_session_id.as_deref(), Some("parent-1"));
    assert_eq!(children[0].depth, 1);
    assert_eq!(children[0].status, SessionStatus::Completed);
}

#[tokio::test]
async fn universal_species_hash_survives_model_and_values() {
    let mut a = phase("p", "Write about {{topic}}");
    a.model = Some("model-one".to_string());
    let mut b = phase("p", "Write about {{topic}}");
    b.model = Some("model-two".to_string());
    assert_eq!(capstan::species_hash(&a), capstan::species_hash(&b));

    let c = phase("p", "Write about {{topic}} differently");
    assert_ne!(capstan::species_hash(&a), capstan::species_hash(&c));
}
