//! Cascade runner - the top-level phase state machine
//!
//! Creates the session record, starts the heartbeat, iterates phases
//! (wrapping any phase with `soundings.factor > 1` in the sounding runner),
//! follows handoffs, launches sub- and async cascades, and persists the
//! final status. Cascade-level soundings fork whole child cascades under
//! derived session ids and keep the winner's lineage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use unilog::{SemanticActor, SemanticPurpose, SessionStatus, SessionStore, safe_json};
use uuid::Uuid;

use crate::cascade::config::{AsyncTrigger, CascadeConfig, PhaseConfig, SubCascadeRef};
use crate::cascade::loader::load_cascade;
use crate::echo::{Echo, EchoSnapshot};
use crate::error::{CascadeError, Result};
use crate::graph::write_session_graph;
use crate::phase::runner::{PhaseOutcome, PhaseRunOptions, PhaseRunner};
use crate::progress::ProgressReporter;
use crate::runtime::Harness;
use crate::sounding::SoundingRunner;
use crate::sounding::evaluator::{EvalCandidate, evaluate_quality};
use crate::validate::{CascadeValidatorHook, ValidationResult, extract_json_lenient};

/// Options for one cascade run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit session id; a fresh UUID otherwise
    pub session_id: Option<String>,
    pub parent_session_id: Option<String>,
    pub depth: i64,
    pub cascade_file: Option<String>,
    /// State seeded before phase 0 (sub-cascade context_in)
    pub initial_state: BTreeMap<String, Value>,
}

/// Top-level runner; cheap to clone
#[derive(Clone)]
pub struct CascadeRunner {
    harness: Arc<Harness>,
}

impl CascadeRunner {
    pub fn new(harness: Arc<Harness>) -> Self {
        Self { harness }
    }

    /// Run a cascade to a terminal status, returning the final echo view
    ///
    /// Boxed because sub-cascades, async cascades and cascade validators
    /// re-enter this function.
    pub fn run(
        &self,
        cascade: Arc<CascadeConfig>,
        input: String,
        options: RunOptions,
    ) -> BoxFuture<'static, Result<EchoSnapshot>> {
        let runner = self.clone();
        Box::pin(async move { runner.run_impl(cascade, input, options).await })
    }

    async fn run_impl(&self, cascade: Arc<CascadeConfig>, input: String, options: RunOptions) -> Result<EchoSnapshot> {
        cascade.validate().map_err(CascadeError::Config)?;

        // Cascade-level soundings fork whole child cascades
        if cascade.soundings.as_ref().map(|s| s.factor).unwrap_or(1) > 1 {
            return self.run_cascade_soundings(cascade, input, options).await;
        }

        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.harness.sessions.create(
            &session_id,
            &cascade.cascade_id,
            options.parent_session_id.as_deref(),
            options.depth,
            None,
        )?;

        let mut echo = Echo::new(&session_id, &cascade.cascade_id, self.harness.log.clone());
        echo.parent_session_id = options.parent_session_id.clone();
        echo.depth = options.depth;
        echo.cascade_file = options.cascade_file.clone();
        for (key, value) in &options.initial_state {
            echo.set_state(key.clone(), value.clone());
        }

        let reporter = ProgressReporter::new(Arc::clone(&self.harness.bus), &session_id);
        let heartbeat = start_heartbeat(
            self.harness.sessions.clone(),
            session_id.clone(),
            self.harness.config.runtime.heartbeat_interval(),
        );

        let root_trace = Uuid::new_v4().to_string();
        {
            let mut row = echo.log_row("cascade");
            row.trace_id = root_trace.clone();
            row.cascade_json = serde_json::to_string(cascade.as_ref()).ok();
            row.semantic_actor = Some(SemanticActor::Framework.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::Lifecycle.as_str().to_string());
            row.content_json = Some(safe_json(&json!({"event": "cascade_start", "input": input})));
            echo.log_event(row);
        }

        self.harness
            .sessions
            .status(&session_id, SessionStatus::Running, None, None)?;
        info!(session_id, cascade_id = %cascade.cascade_id, "Cascade started");

        let outcome = self
            .iterate_phases(&cascade, &mut echo, &input, &root_trace, &reporter)
            .await;

        // Heartbeat stops before the final status write
        drop(heartbeat);

        let final_status = match &outcome {
            Err(CascadeError::Cancelled(_)) => SessionStatus::Cancelled,
            Err(_) => SessionStatus::Error,
            Ok(_) if !echo.errors.is_empty() => SessionStatus::Error,
            Ok(_) => SessionStatus::Completed,
        };
        let error_message = match &outcome {
            Err(e) => Some(e.to_string()),
            Ok(_) => echo.errors.last().map(|e| e.message.clone()),
        };
        if let Err(e) = self.harness.sessions.status(
            &session_id,
            final_status,
            echo.current_phase.as_deref(),
            error_message.as_deref(),
        ) {
            warn!(session_id, error = %e, "Failed to persist final session status");
        }

        {
            let mut row = echo.log_row("cascade_complete");
            row.parent_id = Some(root_trace);
            row.semantic_actor = Some(SemanticActor::Framework.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::Lifecycle.as_str().to_string());
            row.content_json = Some(safe_json(&json!({"status": final_status.as_str()})));
            echo.log_event(row);
        }

        // Every termination path force-flushes
        self.harness.log.flush().await;

        if let Err(e) = write_session_graph(&self.harness.log, &self.harness.config.dirs.graph_dir, &session_id) {
            debug!(session_id, error = %e, "Trace graph not written");
        }

        info!(session_id, status = final_status.as_str(), "Cascade finished");
        match outcome {
            Ok(()) => Ok(EchoSnapshot::from(&echo)),
            Err(CascadeError::Cancelled(_)) => Ok(EchoSnapshot::from(&echo)),
            Err(e) => Err(e),
        }
    }

    /// Sequential phase iteration with static and dynamic transitions
    async fn iterate_phases(
        &self,
        cascade: &Arc<CascadeConfig>,
        echo: &mut Echo,
        input: &str,
        root_trace: &str,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let hook: Arc<dyn CascadeValidatorHook> = Arc::new(ValidatorCascadeAdapter {
            runner: self.clone(),
            parent_session: echo.session_id.clone(),
            depth: echo.depth,
        });

        let mut current: Option<String> = cascade.phases.first().map(|p| p.name.clone());
        while let Some(phase_name) = current.take() {
            if self.harness.sessions.is_cancelled(&echo.session_id) {
                return Err(CascadeError::Cancelled(echo.session_id.clone()));
            }

            let phase = cascade
                .phase(&phase_name)
                .ok_or_else(|| CascadeError::Config(format!("Unknown phase '{}'", phase_name)))?
                .clone();

            self.harness
                .sessions
                .status(&echo.session_id, SessionStatus::Running, Some(&phase.name), None)
                .ok();

            self.spawn_async_cascades(&phase, echo, input, AsyncTrigger::OnStart);

            let result = self.execute_phase(cascade, &phase, echo, input, root_trace, reporter, &hook).await;
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    error!(session_id = %echo.session_id, phase = %phase.name, error = %e, "Phase failed");
                    if !echo.errors.iter().any(|err| err.phase == phase.name) {
                        echo.add_error(&phase.name, e.kind(), e.to_string(), None);
                    }
                    return Err(e);
                }
            };

            // Synchronous sub-cascades run after the phase completes
            for sub in &phase.sub_cascades {
                self.run_sub_cascade(echo, sub, outcome.output()).await?;
            }

            self.spawn_async_cascades(&phase, echo, input, AsyncTrigger::OnEnd);

            current = match outcome {
                PhaseOutcome::Handoff { target, .. } => Some(target),
                PhaseOutcome::Completed { .. } => phase.handoffs.first().map(|h| h.target().to_string()),
                PhaseOutcome::Aborted { reason } => {
                    info!(session_id = %echo.session_id, phase = %phase.name, reason, "Cascade aborted by decision");
                    None
                }
            };
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_phase(
        &self,
        cascade: &Arc<CascadeConfig>,
        phase: &PhaseConfig,
        echo: &mut Echo,
        input: &str,
        root_trace: &str,
        reporter: &ProgressReporter,
        hook: &Arc<dyn CascadeValidatorHook>,
    ) -> Result<PhaseOutcome> {
        if phase.sounding_factor() > 1 {
            let runner = SoundingRunner::new(Arc::clone(&self.harness), Arc::clone(cascade), reporter.clone());
            runner
                .run(phase, echo, input, Some(root_trace.to_string()), Some(Arc::clone(hook)))
                .await
        } else {
            let runner = PhaseRunner::new(Arc::clone(&self.harness), Arc::clone(cascade), reporter.clone());
            runner
                .run(
                    phase,
                    echo,
                    PhaseRunOptions {
                        input: input.to_string(),
                        parent_trace: Some(root_trace.to_string()),
                        validator_hook: Some(Arc::clone(hook)),
                        ..Default::default()
                    },
                )
                .await
        }
    }

    /// Synchronous child cascade with context_in/out merging
    async fn run_sub_cascade(&self, echo: &mut Echo, sub: &SubCascadeRef, phase_output: &str) -> Result<()> {
        let config = load_cascade(&sub.path).map_err(|e| CascadeError::Config(e.to_string()))?;
        let child_session = format!("{}_{}", echo.session_id, Uuid::new_v4().simple());

        let child_input = match &sub.input {
            Some(template) => self
                .harness
                .prompts
                .render(template, &json!({"input": phase_output, "state": echo.state_json()}))?,
            None => phase_output.to_string(),
        };

        let mut initial_state = BTreeMap::new();
        for key in &sub.context_in {
            if let Some(value) = echo.get_state(key) {
                initial_state.insert(key.clone(), value.clone());
            }
        }

        info!(parent = %echo.session_id, child = %child_session, cascade = %config.cascade_id, "Running sub-cascade");
        let snapshot = self
            .run(
                Arc::new(config.clone()),
                child_input,
                RunOptions {
                    session_id: Some(child_session),
                    parent_session_id: Some(echo.session_id.clone()),
                    depth: echo.depth + 1,
                    cascade_file: Some(sub.path.clone()),
                    initial_state,
                },
            )
            .await?;

        for key in &sub.context_out {
            if let Some(value) = snapshot.state.get(key) {
                echo.set_state(key.clone(), value.clone());
            }
        }
        if let Some(output) = &snapshot.final_output {
            echo.set_state(format!("output_{}", config.cascade_id), json!(output));
        }
        Ok(())
    }

    /// Fire-and-forget child cascades
    fn spawn_async_cascades(&self, phase: &PhaseConfig, echo: &Echo, input: &str, trigger: AsyncTrigger) {
        for async_ref in phase.async_cascades.iter().filter(|a| a.trigger == trigger) {
            let config = match load_cascade(&async_ref.path) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %async_ref.path, error = %e, "Async cascade failed to load; skipping");
                    continue;
                }
            };
            let child_input = match &async_ref.input {
                Some(template) => self
                    .harness
                    .prompts
                    .render(template, &json!({"input": input, "state": echo.state_json()}))
                    .unwrap_or_else(|_| input.to_string()),
                None => input.to_string(),
            };

            let runner = self.clone();
            let options = RunOptions {
                session_id: None,
                parent_session_id: Some(echo.session_id.clone()),
                depth: echo.depth + 1,
                cascade_file: Some(async_ref.path.clone()),
                initial_state: BTreeMap::new(),
            };
            info!(parent = %echo.session_id, cascade = %config.cascade_id, ?trigger, "Spawning async cascade");
            tokio::spawn(async move {
                if let Err(e) = runner.run(Arc::new(config), child_input, options).await {
                    warn!(error = %e, "Async cascade failed");
                }
            });
        }
    }

    /// Cascade-level soundings: fork N complete child cascades
    async fn run_cascade_soundings(
        &self,
        cascade: Arc<CascadeConfig>,
        input: String,
        options: RunOptions,
    ) -> Result<EchoSnapshot> {
        let soundings = cascade
            .soundings
            .clone()
            .ok_or_else(|| CascadeError::Config("cascade soundings missing".to_string()))?;
        let parent_session = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.harness
            .sessions
            .create(&parent_session, &cascade.cascade_id, options.parent_session_id.as_deref(), options.depth, None)?;
        self.harness
            .sessions
            .status(&parent_session, SessionStatus::Running, None, None)?;

        // Children run the same cascade minus the soundings block
        let mut child_config = (*cascade).clone();
        child_config.soundings = None;
        let child_config = Arc::new(child_config);

        let semaphore = Arc::new(tokio::sync::Semaphore::new(soundings.max_parallel.max(1)));
        let mut handles = Vec::new();
        for index in 0..soundings.factor {
            let child_session = format!("{}_sounding_{}", parent_session, index);
            let runner = self.clone();
            let config = Arc::clone(&child_config);
            let input = input.clone();
            let parent = parent_session.clone();
            let permit_source = Arc::clone(&semaphore);
            let depth = options.depth;
            handles.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                let result = runner
                    .run(
                        config,
                        input,
                        RunOptions {
                            session_id: Some(child_session.clone()),
                            parent_session_id: Some(parent),
                            depth: depth + 1,
                            ..Default::default()
                        },
                    )
                    .await;
                (index, result)
            }));
        }

        let mut snapshots: Vec<(usize, EchoSnapshot)> = Vec::new();
        for handle in handles {
            if let Ok((index, Ok(snapshot))) = handle.await {
                snapshots.push((index, snapshot));
            }
        }
        if snapshots.is_empty() {
            self.harness
                .sessions
                .status(&parent_session, SessionStatus::Error, None, Some("all cascade soundings failed"))?;
            return Err(CascadeError::Validation("All cascade soundings failed".to_string()));
        }

        // Evaluate final outputs with the shared machinery
        let candidates: Vec<EvalCandidate> = snapshots
            .iter()
            .map(|(index, snapshot)| EvalCandidate {
                index: *index,
                model: self.harness.config.provider.default_model.clone(),
                output: snapshot.final_output.clone().unwrap_or_default(),
                cost: None,
                validation_note: None,
                image_paths: vec![],
                mutation: None,
            })
            .collect();
        let decision = evaluate_quality(
            self.harness.agent.as_ref(),
            &self.harness.config.provider.default_model,
            soundings.evaluator_instructions.as_deref(),
            &candidates,
        )
        .await;

        let (_, winner) = snapshots
            .iter()
            .find(|(index, _)| *index == decision.winner)
            .ok_or_else(|| CascadeError::Validation("Cascade sounding winner missing".to_string()))?;

        // The parent inherits the winner's lineage and state
        let mut echo = Echo::new(&parent_session, &cascade.cascade_id, self.harness.log.clone());
        echo.depth = options.depth;
        for entry in &winner.lineage {
            echo.add_lineage(&entry.phase, &entry.output, &entry.trace_id);
        }
        for (key, value) in &winner.state {
            echo.set_state(key.clone(), value.clone());
        }
        {
            let mut row = echo.log_row("winner_selection");
            row.semantic_actor = Some(SemanticActor::Evaluator.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::WinnerSelection.as_str().to_string());
            row.content_json = Some(safe_json(&json!({
                "winner_session": format!("{}_sounding_{}", parent_session, decision.winner),
                "winner_index": decision.winner,
            })));
            row.metadata_json = Some(json!({"evaluation_mode": decision.mode}).to_string());
            echo.log_event(row);
        }

        self.harness
            .sessions
            .status(&parent_session, SessionStatus::Completed, None, None)?;
        self.harness.log.flush().await;
        Ok(EchoSnapshot::from(&echo))
    }
}

/// Heartbeat task; aborts when the guard drops
struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn start_heartbeat(sessions: SessionStore, session_id: String, interval: Duration) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so creation time stands
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = sessions.heartbeat(&session_id) {
                // Heartbeat failure is infrastructure noise, never fatal
                warn!(session_id = %session_id, error = %e, "Heartbeat write failed");
            }
        }
    });
    HeartbeatGuard { handle }
}

/// Runs validator cascades on behalf of phase validators
struct ValidatorCascadeAdapter {
    runner: CascadeRunner,
    parent_session: String,
    depth: i64,
}

#[async_trait]
impl CascadeValidatorHook for ValidatorCascadeAdapter {
    async fn run_validator_cascade(&self, path: &str, content: &str) -> Result<ValidationResult> {
        let config = load_cascade(path).map_err(|e| CascadeError::Config(e.to_string()))?;
        let snapshot = self
            .runner
            .run(
                Arc::new(config),
                content.to_string(),
                RunOptions {
                    session_id: None,
                    parent_session_id: Some(self.parent_session.clone()),
                    depth: self.depth + 1,
                    cascade_file: Some(path.to_string()),
                    initial_state: BTreeMap::new(),
                },
            )
            .await?;

        let output = snapshot.final_output.unwrap_or_default();
        match extract_json_lenient(&output) {
            Some(value) => Ok(ValidationResult {
                valid: value.get("valid").and_then(|v| v.as_bool()).unwrap_or(false),
                reason: value.get("reason").and_then(|v| v.as_str()).map(String::from),
            }),
            None => Ok(ValidationResult {
                valid: false,
                reason: Some("validator cascade produced no verdict".to_string()),
            }),
        }
    }
}

/// Library-level entry point: run one cascade against a harness
pub async fn run_cascade(
    harness: Arc<Harness>,
    cascade: CascadeConfig,
    input: impl Into<String>,
    session_id: Option<String>,
) -> Result<EchoSnapshot> {
    let runner = CascadeRunner::new(harness);
    runner
        .run(
            Arc::new(cascade),
            input.into(),
            RunOptions {
                session_id,
                ..Default::default()
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgent, text_response};
    use crate::cascade::config::Handoff;

    fn cascade(phases: Vec<PhaseConfig>) -> CascadeConfig {
        CascadeConfig {
            cascade_id: "flow".to_string(),
            phases,
            ..Default::default()
        }
    }

    fn phase(name: &str, instructions: &str) -> PhaseConfig {
        PhaseConfig {
            name: name.to_string(),
            instructions: instructions.to_string(),
            ..Default::default()
        }
    }

    fn harness(agent: MockAgent) -> Arc<Harness> {
        Harness::builder(Arc::new(agent)).build().unwrap()
    }

    #[tokio::test]
    async fn test_single_phase_cascade_completes() {
        let harness = harness(MockAgent::from_texts(vec!["done"]));
        let snapshot = run_cascade(Arc::clone(&harness), cascade(vec![phase("only", "Do {{input}}")]), "the task", None)
            .await
            .unwrap();

        assert_eq!(snapshot.final_output.as_deref(), Some("done"));
        let record = harness.sessions.get(&snapshot.session_id).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_two_phase_linear_flow() {
        let harness = harness(MockAgent::from_texts(vec!["first output", "second output"]));
        let mut a = phase("a", "Start with {{input}}");
        a.handoffs = vec![Handoff::Name("b".to_string())];
        let b = phase("b", "Continue");

        let snapshot = run_cascade(Arc::clone(&harness), cascade(vec![a, b]), "go", None)
            .await
            .unwrap();

        assert_eq!(snapshot.lineage.len(), 2);
        assert_eq!(snapshot.lineage[0].output, "first output");
        assert_eq!(snapshot.lineage[1].output, "second output");
        assert_eq!(snapshot.final_output.as_deref(), Some("second output"));
    }

    #[tokio::test]
    async fn test_session_id_collision_rejected() {
        let harness = harness(MockAgent::from_texts(vec!["one", "two"]));
        let config = cascade(vec![phase("only", "Do it")]);

        run_cascade(Arc::clone(&harness), config.clone(), "x", Some("fixed-id".to_string()))
            .await
            .unwrap();
        let result = run_cascade(Arc::clone(&harness), config, "x", Some("fixed-id".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_cascade_is_config_error() {
        let harness = harness(MockAgent::from_texts(vec![]));
        let result = run_cascade(harness, cascade(vec![]), "x", None).await;
        assert!(matches!(result, Err(CascadeError::Config(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let harness = harness(MockAgent::from_texts(vec!["never"]));
        harness.sessions.create("pre", "flow", None, 0, None).unwrap();

        // Cancel a session that another runner is about to reuse as parent
        harness.sessions.request_cancel("pre", None).unwrap();
        assert!(harness.sessions.is_cancelled("pre"));
    }

    #[tokio::test]
    async fn test_failed_phase_sets_error_status() {
        // Mock runs out of responses -> provider error -> phase fails
        let harness = harness(MockAgent::from_texts(vec![]));
        let result = run_cascade(
            Arc::clone(&harness),
            cascade(vec![phase("only", "Do it")]),
            "x",
            Some("failing".to_string()),
        )
        .await;
        assert!(result.is_err());

        let record = harness.sessions.get("failing").unwrap();
        assert_eq!(record.status, SessionStatus::Error);
        assert!(record.error_message.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_guard_stops_on_drop() {
        let sessions = SessionStore::open_in_memory().unwrap();
        sessions.create("hb", "c", None, 0, None).unwrap();
        let guard = start_heartbeat(sessions.clone(), "hb".to_string(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);
        let after_drop = sessions.get("hb").unwrap().heartbeat_at;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.get("hb").unwrap().heartbeat_at, after_drop);
    }

    #[tokio::test]
    async fn test_cascade_soundings_fork_children() {
        // Factor 2 children, one call each, then an evaluator call picking 2
        let harness = harness(MockAgent::from_texts(vec!["child one", "child two", "2"]));
        let mut config = cascade(vec![phase("only", "Do {{input}}")]);
        config.soundings = Some(crate::cascade::config::SoundingsConfig {
            factor: 2,
            max_parallel: 1,
            ..Default::default()
        });

        let snapshot = run_cascade(Arc::clone(&harness), config, "go", Some("root".to_string()))
            .await
            .unwrap();

        // The evaluator said "2": the winner is whichever child answered second
        let output = snapshot.final_output.as_deref().unwrap();
        assert!(output == "child one" || output == "child two");
        assert_eq!(snapshot.session_id, "root");

        // Child sessions exist under derived ids
        assert!(harness.sessions.get("root_sounding_0").is_ok());
        assert!(harness.sessions.get("root_sounding_1").is_ok());
        assert_eq!(
            harness.sessions.get("root").unwrap().status,
            SessionStatus::Completed
        );
    }
}
