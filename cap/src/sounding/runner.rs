//! Sounding runner - parallel N-way phase execution
//!
//! Forks a phase into `factor` isolated attempts that share the session id
//! (all rows land in one session) but each run on a cloned Echo snapshot.
//! Mutations are resolved sequentially before the fan-out, workers are
//! bounded by a semaphore, and a winner is chosen by the configured
//! evaluator (or all survivors are aggregated). Only the winner's context
//! merges back into the parent. Reforge then refines the winner through
//! further rounds of mini-soundings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use unilog::{SemanticActor, SemanticPurpose, safe_json};

use crate::budget::TokenBudget;
use crate::cascade::config::{
    CascadeConfig, EvaluatorKind, ModelAssignment, ModelStrategy, MutationMode, PhaseConfig, SoundingMode,
    SoundingsConfig,
};
use crate::cascade::species::species_hash;
use crate::context::ContextBuilder;
use crate::echo::Echo;
use crate::error::{CascadeError, Result};
use crate::phase::mutation::{AppliedMutation, rewrite_prompt, select_template};
use crate::phase::runner::{PhaseOutcome, PhaseRunOptions, PhaseRunner};
use crate::progress::ProgressReporter;
use crate::runtime::Harness;
use crate::sounding::evaluator::{
    EvalCandidate, EvalDecision, HumanVerdict, aggregate_outputs, evaluate_cost_aware, evaluate_human,
    evaluate_pareto, evaluate_quality, prefilter_top_n, resolve_timeout,
};
use crate::validate::CascadeValidatorHook;

/// Context-window filter keeps a 15% buffer under each model's limit
const CONTEXT_BUFFER: f64 = 0.85;
/// Rough output-token price used when a sounding has no recorded cost
const FALLBACK_COST_PER_TOKEN: f64 = 15e-6;

/// One finished sounding attempt
struct SoundingResult {
    index: usize,
    model: String,
    outcome: Option<PhaseOutcome>,
    error: Option<String>,
    echo: Echo,
    snapshot_len: usize,
    mutation: Option<String>,
}

impl SoundingResult {
    fn output(&self) -> &str {
        self.outcome.as_ref().map(|o| o.output()).unwrap_or("")
    }

    fn succeeded(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Wraps the phase runner with sounding fan-out and evaluation
pub struct SoundingRunner {
    harness: Arc<Harness>,
    cascade: Arc<CascadeConfig>,
    reporter: ProgressReporter,
}

impl SoundingRunner {
    pub fn new(harness: Arc<Harness>, cascade: Arc<CascadeConfig>, reporter: ProgressReporter) -> Self {
        Self {
            harness,
            cascade,
            reporter,
        }
    }

    /// Run the phase with soundings, returning the winner's outcome
    pub async fn run(
        &self,
        phase: &PhaseConfig,
        echo: &mut Echo,
        input: &str,
        parent_trace: Option<String>,
        hook: Option<Arc<dyn CascadeValidatorHook>>,
    ) -> Result<PhaseOutcome> {
        let config = phase
            .soundings
            .clone()
            .ok_or_else(|| CascadeError::Config(format!("Phase '{}' has no soundings config", phase.name)))?;

        // Rows the parent emits (mutations, winner selection) carry the
        // phase context even though the attempts run on clones
        echo.current_phase = Some(phase.name.clone());
        echo.current_phase_json = serde_json::to_string(phase).ok();
        echo.current_species_hash = Some(species_hash(phase));

        // 1. Model assignment
        let mut models = assign_models(&config, &self.harness.config.provider.default_model, phase);

        // 2. Context-window filter
        let prebuilt = match &phase.context {
            Some(context_config) => ContextBuilder::new(echo, &self.harness.config.dirs.image_dir).build(
                context_config,
                &phase.name,
                input,
            ),
            None => Vec::new(),
        };
        let estimate = TokenBudget::new(Default::default()).estimate(&prebuilt, &[], &phase.instructions);
        let (surviving, removed): (Vec<String>, Vec<String>) = models.iter().cloned().partition(|model| {
            let limit = self.harness.agent.context_limit(model);
            (limit as f64 * CONTEXT_BUFFER) as usize >= estimate
        });
        if !removed.is_empty() {
            self.reporter.models_filtered(&phase.name, removed.clone(), estimate);
            if surviving.is_empty() {
                warn!(phase = %phase.name, "Every assigned model failed the context filter; keeping original assignment");
            } else {
                models = surviving;
            }
        }
        let factor = models.len();

        // 3. Mutation precompute, sequential so rewrites resolve before fan-out
        let rendered = self.render_instructions(phase, echo, input)?;
        let mutations = self.precompute_mutations(&config, phase, echo, &rendered).await;

        // 4-5. Snapshot and parallel execution
        let results = self
            .fan_out(
                phase,
                echo,
                &models,
                mutations,
                prebuilt.clone(),
                input,
                &config,
                None,
                parent_trace.clone(),
                hook.clone(),
            )
            .await;

        let succeeded: Vec<&SoundingResult> = results.iter().filter(|r| r.succeeded()).collect();
        if succeeded.is_empty() {
            let detail = results
                .iter()
                .filter_map(|r| r.error.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CascadeError::Validation(format!(
                "All {} soundings failed for phase '{}': {}",
                factor, phase.name, detail
            )));
        }

        // 6. Pre-eval validation
        let (mut surviving_indices, validation_notes) = self
            .pre_eval_validation(&config, &results, hook.as_deref())
            .await?;
        if surviving_indices.is_empty() {
            // Everyone failed validation: evaluate all, but show the notes
            surviving_indices = results.iter().filter(|r| r.succeeded()).map(|r| r.index).collect();
        }

        let candidates = self.build_candidates(phase, &results, &surviving_indices, &validation_notes).await;

        // 7. Aggregate mode
        if config.mode == SoundingMode::Aggregate {
            return self.aggregate(phase, echo, &config, &candidates, &results).await;
        }

        // 8. Evaluate mode
        let decision = self.evaluate(phase, echo, &config, &candidates).await?;

        // 9. Winner propagation
        let winner = results
            .iter()
            .find(|r| r.index == decision.winner)
            .ok_or_else(|| CascadeError::Validation("Winner index not among results".to_string()))?;
        echo.merge_winner(&winner.echo, winner.snapshot_len);
        self.harness
            .log
            .mark_winners(&echo.session_id, &phase.name, &[decision.winner as i64])?;
        self.reporter
            .sounding_winner(&phase.name, vec![decision.winner], &decision.mode);
        self.log_winner_selection(echo, phase, &decision);

        let mut outcome = winner
            .outcome
            .clone()
            .unwrap_or(PhaseOutcome::Completed { output: String::new() });

        // 10. Reforge
        if let Some(reforge) = &config.reforge
            && reforge.steps > 0
        {
            let best = self
                .reforge(phase, echo, &config, &rendered, outcome.output().to_string(), &models, hook)
                .await?;
            outcome = PhaseOutcome::Completed { output: best };
        }

        Ok(outcome)
    }

    fn render_instructions(&self, phase: &PhaseConfig, echo: &Echo, input: &str) -> Result<String> {
        let context = crate::prompts::PromptContext {
            input: json!(input),
            state: echo.state_json(),
            outputs: echo.outputs_json(),
            lineage: json!([]),
            history: json!(echo.history.len()),
            turn: 0,
            sounding_index: 0,
            is_sounding: true,
            sounding_factor: phase.sounding_factor(),
        };
        self.harness.prompts.render(&phase.instructions, &context)
    }

    /// Resolve the mutation for every index before any worker starts
    async fn precompute_mutations(
        &self,
        config: &SoundingsConfig,
        phase: &PhaseConfig,
        echo: &Echo,
        rendered_instructions: &str,
    ) -> Vec<Option<AppliedMutation>> {
        let factor = phase.soundings.as_ref().map(|s| s.factor).unwrap_or(1).max(1);
        let mut mutations: Vec<Option<AppliedMutation>> = Vec::new();

        for index in 0..factor {
            if !config.mutate {
                mutations.push(None);
                continue;
            }
            let Some(template) = select_template(config.mutation_mode, &config.mutations, index) else {
                mutations.push(None);
                continue;
            };

            let rewritten = match config.mutation_mode {
                MutationMode::Rewrite | MutationMode::RewriteFree => {
                    let prior_winners = if config.mutation_mode == MutationMode::Rewrite {
                        let species = species_hash(phase);
                        let max_examples = self
                            .cascade
                            .memory
                            .as_ref()
                            .map(|m| m.max_examples)
                            .filter(|n| *n > 0)
                            .unwrap_or(3);
                        self.harness
                            .log
                            .winning_rewrites(&species, max_examples)
                            .unwrap_or_default()
                    } else {
                        Vec::new()
                    };
                    let rewritten = rewrite_prompt(
                        self.harness.agent.as_ref(),
                        self.harness.config.provider.rewrite_model(),
                        rendered_instructions,
                        &template,
                        &prior_winners,
                    )
                    .await;

                    let mut row = echo.log_row("mutation");
                    row.semantic_actor = Some(SemanticActor::Mutator.as_str().to_string());
                    row.semantic_purpose = Some(SemanticPurpose::Refinement.as_str().to_string());
                    row.mutation_type = Some(
                        if config.mutation_mode == MutationMode::Rewrite {
                            "rewrite"
                        } else {
                            "rewrite_free"
                        }
                        .to_string(),
                    );
                    row.mutation_template = Some(template.clone());
                    row.content_json = Some(safe_json(&json!({"index": index, "rewritten": rewritten})));
                    echo.log_event(row);

                    Some(rewritten)
                }
                MutationMode::Augment | MutationMode::Approach => None,
            };

            mutations.push(Some(AppliedMutation {
                mode: config.mutation_mode,
                template,
                rewritten,
            }));
        }
        mutations
    }

    /// Fork isolated workers and collect their results
    #[allow(clippy::too_many_arguments)]
    async fn fan_out(
        &self,
        phase: &PhaseConfig,
        parent: &Echo,
        models: &[String],
        mutations: Vec<Option<AppliedMutation>>,
        prebuilt: Vec<crate::agent::ChatMessage>,
        input: &str,
        config: &SoundingsConfig,
        reforge_step: Option<i64>,
        parent_trace: Option<String>,
        hook: Option<Arc<dyn CascadeValidatorHook>>,
    ) -> Vec<SoundingResult> {
        let max_parallel = config.max_parallel.max(1).min(models.len().max(1));
        let semaphore = Arc::new(Semaphore::new(max_parallel));

        // Workers run the phase without its soundings block
        let mut inner_phase = phase.clone();
        inner_phase.soundings = None;

        let mut futures = Vec::new();
        for (index, model) in models.iter().enumerate() {
            let permit_source = Arc::clone(&semaphore);
            let harness = Arc::clone(&self.harness);
            let cascade = Arc::clone(&self.cascade);
            let reporter = self.reporter.clone();
            let inner_phase = inner_phase.clone();
            let model = model.clone();
            let mutation = mutations.get(index).cloned().flatten();
            let prebuilt = prebuilt.clone();
            let input = input.to_string();
            let hook = hook.clone();
            let parent_trace = parent_trace.clone();
            let phase_name = phase.name.clone();

            let mut clone = parent.snapshot();
            clone.sounding_index = Some(index as i64);
            clone.reforge_step = reforge_step;
            let snapshot_len = clone.history.len();

            futures.push(tokio::spawn(async move {
                let _permit = permit_source.acquire_owned().await;
                reporter.sounding_start(
                    &phase_name,
                    index,
                    &model,
                    mutation.as_ref().map(|m| m.mode_str().to_string()),
                );

                let runner = PhaseRunner::new(harness, cascade, reporter.clone());
                let mutation_text = mutation.as_ref().map(|m| m.applied_text().to_string());
                let options = PhaseRunOptions {
                    input,
                    parent_trace,
                    model_override: Some(model.clone()),
                    prebuilt_context: Some(prebuilt),
                    mutation,
                    validator_hook: hook,
                };

                let result = runner.run(&inner_phase, &mut clone, options).await;
                let (outcome, error) = match result {
                    Ok(outcome) => (Some(outcome), None),
                    Err(e) => {
                        warn!(sounding_index = index, error = %e, "Sounding attempt failed");
                        (None, Some(e.to_string()))
                    }
                };

                let preview = outcome.as_ref().map(|o| o.output().to_string()).unwrap_or_default();
                reporter.sounding_complete(&phase_name, index, outcome.is_some(), &preview);

                SoundingResult {
                    index,
                    model,
                    outcome,
                    error,
                    echo: clone,
                    snapshot_len,
                    mutation: mutation_text,
                }
            }));
        }

        let mut results: Vec<SoundingResult> = join_all(futures)
            .await
            .into_iter()
            .filter_map(|joined| joined.ok())
            .collect();
        results.sort_by_key(|r| r.index);
        results
    }

    /// Run the pre-eval validator over every successful attempt
    async fn pre_eval_validation(
        &self,
        config: &SoundingsConfig,
        results: &[SoundingResult],
        hook: Option<&dyn CascadeValidatorHook>,
    ) -> Result<(Vec<usize>, BTreeMap<usize, String>)> {
        let mut notes = BTreeMap::new();
        let Some(validator_name) = &config.validator else {
            let all = results.iter().filter(|r| r.succeeded()).map(|r| r.index).collect();
            return Ok((all, notes));
        };

        let validator = crate::validate::Validator::new(self.cascade.validators.clone());
        let mut surviving = Vec::new();
        for result in results.iter().filter(|r| r.succeeded()) {
            let verdict = validator.run(validator_name, result.output(), hook).await?;
            if verdict.valid {
                surviving.push(result.index);
            } else {
                notes.insert(
                    result.index,
                    verdict.reason.unwrap_or_else(|| "failed validation".to_string()),
                );
            }
        }
        Ok((surviving, notes))
    }

    async fn build_candidates(
        &self,
        phase: &PhaseConfig,
        results: &[SoundingResult],
        surviving: &[usize],
        notes: &BTreeMap<usize, String>,
    ) -> Vec<EvalCandidate> {
        // Costs come from the log; flush so the analysis sees this phase
        self.harness.log.flush().await;
        let costs: BTreeMap<i64, f64> = self
            .harness
            .log
            .soundings_analysis(&results[0].echo.session_id, &phase.name)
            .unwrap_or_default()
            .into_iter()
            .map(|(index, _, cost, _, _)| (index, cost))
            .collect();

        results
            .iter()
            .filter(|r| surviving.contains(&r.index))
            .map(|result| {
                let recorded = costs.get(&(result.index as i64)).copied().unwrap_or(0.0);
                let cost = if recorded > 0.0 {
                    recorded
                } else {
                    // No provider cost yet: rough output-token estimate
                    (result.output().len() / 4) as f64 * FALLBACK_COST_PER_TOKEN
                };
                EvalCandidate {
                    index: result.index,
                    model: result.model.clone(),
                    output: result.output().to_string(),
                    cost: Some(cost),
                    validation_note: notes.get(&result.index).cloned(),
                    image_paths: self.sounding_images(&result.echo.session_id, &phase.name, result.index),
                    mutation: result.mutation.clone(),
                }
            })
            .collect()
    }

    fn sounding_images(&self, session_id: &str, phase_name: &str, index: usize) -> Vec<PathBuf> {
        let dir = self.harness.config.dirs.image_dir.join(session_id).join(phase_name);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let prefix = format!("sounding_{}_image_", index);
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        paths
    }

    // === Aggregate mode ===

    async fn aggregate(
        &self,
        phase: &PhaseConfig,
        echo: &mut Echo,
        config: &SoundingsConfig,
        candidates: &[EvalCandidate],
        _results: &[SoundingResult],
    ) -> Result<PhaseOutcome> {
        let output = aggregate_outputs(
            self.harness.agent.as_ref(),
            &self.harness.config.provider.default_model,
            config.aggregator_instructions.as_deref(),
            candidates,
        )
        .await;

        // Every contributing sounding is a winner
        let winner_indices: Vec<i64> = candidates.iter().map(|c| c.index as i64).collect();
        self.harness
            .log
            .mark_winners(&echo.session_id, &phase.name, &winner_indices)?;
        self.reporter.sounding_winner(
            &phase.name,
            candidates.iter().map(|c| c.index).collect(),
            "aggregate",
        );

        {
            let mut row = echo.log_row("aggregation");
            row.semantic_actor = Some(SemanticActor::Aggregator.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::EvaluationOutput.as_str().to_string());
            row.content_json = Some(safe_json(&output));
            row.metadata_json = Some(json!({"contributors": winner_indices}).to_string());
            echo.log_event(row);
        }

        echo.set_state(format!("output_{}", phase.name), json!(output));
        echo.add_lineage(&phase.name, output.clone(), uuid::Uuid::new_v4().to_string());
        self.harness.log.flush().await;

        Ok(PhaseOutcome::Completed { output })
    }

    // === Evaluate mode ===

    async fn evaluate(
        &self,
        phase: &PhaseConfig,
        echo: &mut Echo,
        config: &SoundingsConfig,
        candidates: &[EvalCandidate],
    ) -> Result<EvalDecision> {
        let model = &self.harness.config.provider.default_model;
        let instructions = config.evaluator_instructions.as_deref();

        match config.evaluator {
            EvaluatorKind::Human => {
                self.human_evaluation(phase, echo, config, candidates, candidates.to_vec())
                    .await
            }
            EvaluatorKind::Hybrid => {
                let shortlist = prefilter_top_n(
                    self.harness.agent.as_ref(),
                    model,
                    instructions,
                    candidates,
                    config.hybrid_top_n.max(1),
                )
                .await;
                self.human_evaluation(phase, echo, config, candidates, shortlist).await
            }
            EvaluatorKind::Llm => {
                if config.pareto_frontier.as_ref().map(|p| p.enabled).unwrap_or(false) {
                    let policy = config
                        .pareto_frontier
                        .as_ref()
                        .map(|p| p.policy)
                        .unwrap_or_default();
                    let (decision, detail) =
                        evaluate_pareto(self.harness.agent.as_ref(), model, instructions, candidates, policy).await;
                    self.log_pareto_detail(echo, &detail);
                    Ok(decision)
                } else if config.cost_aware_evaluation {
                    Ok(evaluate_cost_aware(self.harness.agent.as_ref(), model, instructions, candidates).await)
                } else {
                    Ok(evaluate_quality(self.harness.agent.as_ref(), model, instructions, candidates).await)
                }
            }
        }
    }

    async fn human_evaluation(
        &self,
        phase: &PhaseConfig,
        echo: &mut Echo,
        config: &SoundingsConfig,
        all_candidates: &[EvalCandidate],
        shortlist: Vec<EvalCandidate>,
    ) -> Result<EvalDecision> {
        let (verdict, checkpoint_id) = evaluate_human(
            &self.harness.checkpoints,
            &echo.session_id,
            &echo.cascade_id,
            &phase.name,
            &shortlist,
            config,
        )
        .await;

        match verdict {
            HumanVerdict::Selected(index) => Ok(EvalDecision {
                winner: index,
                mode: "human".to_string(),
            }),
            HumanVerdict::RejectAll => Err(CascadeError::Validation(format!(
                "Human rejected all soundings for phase '{}'",
                phase.name
            ))),
            HumanVerdict::TimedOut => {
                {
                    let mut row = echo.log_row("checkpoint_timeout");
                    row.semantic_actor = Some(SemanticActor::Framework.as_str().to_string());
                    row.semantic_purpose = Some(SemanticPurpose::Error.as_str().to_string());
                    row.content_json = Some(safe_json(&json!({"checkpoint_id": checkpoint_id})));
                    echo.log_event(row);
                }
                info!(phase = %phase.name, fallback = ?config.on_timeout, "Sounding eval timed out; applying fallback");
                resolve_timeout(
                    self.harness.agent.as_ref(),
                    &self.harness.config.provider.default_model,
                    all_candidates,
                    config,
                )
                .await
                .ok_or_else(|| CascadeError::CheckpointTimeout(checkpoint_id))
            }
        }
    }

    fn log_winner_selection(&self, echo: &Echo, phase: &PhaseConfig, decision: &EvalDecision) {
        let mut row = echo.log_row("winner_selection");
        row.sounding_index = Some(decision.winner as i64);
        row.is_winner = Some(true);
        row.semantic_actor = Some(SemanticActor::Evaluator.as_str().to_string());
        row.semantic_purpose = Some(SemanticPurpose::WinnerSelection.as_str().to_string());
        row.content_json = Some(safe_json(&json!({
            "phase": phase.name,
            "winner_index": decision.winner,
        })));
        row.metadata_json = Some(json!({"evaluation_mode": decision.mode}).to_string());
        echo.log_event(row);
    }

    fn log_pareto_detail(&self, echo: &Echo, detail: &crate::sounding::evaluator::ParetoDetail) {
        for candidate in &detail.frontier {
            let mut row = echo.log_row("pareto_candidate");
            row.sounding_index = Some(candidate.index as i64);
            row.semantic_actor = Some(SemanticActor::Evaluator.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::EvaluationOutput.as_str().to_string());
            row.content_json = Some(safe_json(&json!({"quality": candidate.quality, "cost": candidate.cost})));
            row.metadata_json = Some(json!({"pareto_rank": 1}).to_string());
            echo.log_event(row);
        }
        for candidate in &detail.dominated {
            let mut row = echo.log_row("pareto_candidate");
            row.sounding_index = Some(candidate.index as i64);
            row.semantic_actor = Some(SemanticActor::Evaluator.as_str().to_string());
            row.semantic_purpose = Some(SemanticPurpose::EvaluationOutput.as_str().to_string());
            row.content_json = Some(safe_json(&json!({"quality": candidate.quality, "cost": candidate.cost})));
            row.metadata_json = Some(json!({"pareto_rank": 2, "dominated": true}).to_string());
            echo.log_event(row);
        }
    }

    // === Reforge ===

    /// Iterative refinement of the winning output
    #[allow(clippy::too_many_arguments)]
    async fn reforge(
        &self,
        phase: &PhaseConfig,
        echo: &mut Echo,
        config: &SoundingsConfig,
        original_instructions: &str,
        mut current_best: String,
        models: &[String],
        hook: Option<Arc<dyn CascadeValidatorHook>>,
    ) -> Result<String> {
        let reforge = config
            .reforge
            .clone()
            .ok_or_else(|| CascadeError::Config("reforge called without config".to_string()))?;
        let validator = crate::validate::Validator::new(self.cascade.validators.clone());

        for step in 1..=reforge.steps {
            debug!(phase = %phase.name, step, "Reforge step starting");

            let honing = reforge
                .honing_prompt
                .as_deref()
                .unwrap_or("Improve the result: sharpen weak points, fix errors, raise overall quality.");
            let refinement_instructions = format!(
                "You are refining the winning result of a previous attempt.\n\n\
                 Original mission:\n{}\n\nCurrent best result:\n{}\n\n{}",
                original_instructions, current_best, honing
            );

            let mut refinement_phase = phase.clone();
            refinement_phase.soundings = None;
            refinement_phase.context = None;
            refinement_phase.instructions = refinement_instructions;
            refinement_phase.output_schema = None;
            refinement_phase.output_extraction = None;
            refinement_phase.human_input = None;
            refinement_phase.handoffs = Vec::new();

            let mini_models: Vec<String> = (0..reforge.factor_per_step.max(1))
                .map(|i| models[i % models.len()].clone())
                .collect();
            let mutations: Vec<Option<AppliedMutation>> = (0..mini_models.len())
                .map(|i| {
                    if reforge.mutate {
                        select_template(MutationMode::Approach, &[], i).map(|template| AppliedMutation {
                            mode: MutationMode::Approach,
                            template,
                            rewritten: None,
                        })
                    } else {
                        None
                    }
                })
                .collect();

            let results = self
                .fan_out(
                    &refinement_phase,
                    echo,
                    &mini_models,
                    mutations,
                    Vec::new(),
                    "",
                    config,
                    Some(step as i64),
                    None,
                    hook.clone(),
                )
                .await;

            let succeeded: Vec<&SoundingResult> = results.iter().filter(|r| r.succeeded()).collect();
            if succeeded.is_empty() {
                warn!(phase = %phase.name, step, "Reforge step produced nothing; keeping current best");
                continue;
            }

            // The current best competes against the refinements
            let mut candidates = vec![EvalCandidate {
                index: usize::MAX,
                model: "current_best".to_string(),
                output: current_best.clone(),
                cost: Some(0.0),
                validation_note: None,
                image_paths: vec![],
                mutation: None,
            }];
            for result in &succeeded {
                candidates.push(EvalCandidate {
                    index: result.index,
                    model: result.model.clone(),
                    output: result.output().to_string(),
                    cost: Some((result.output().len() / 4) as f64 * FALLBACK_COST_PER_TOKEN),
                    validation_note: None,
                    image_paths: vec![],
                    mutation: result.mutation.clone(),
                });
            }

            let decision = evaluate_quality(
                self.harness.agent.as_ref(),
                &self.harness.config.provider.default_model,
                config.evaluator_instructions.as_deref(),
                &candidates,
            )
            .await;

            if decision.winner != usize::MAX
                && let Some(result) = succeeded.iter().find(|r| r.index == decision.winner)
            {
                current_best = result.output().to_string();
                echo.merge_winner(&result.echo, result.snapshot_len);
                echo.set_state(format!("output_{}", phase.name), json!(current_best));
            }

            {
                let mut row = echo.log_row("reforge_step");
                row.reforge_step = Some(step as i64);
                row.semantic_actor = Some(SemanticActor::ReforgeAgent.as_str().to_string());
                row.semantic_purpose = Some(SemanticPurpose::Refinement.as_str().to_string());
                row.content_json = Some(safe_json(&json!({"step": step, "winner": decision.winner})));
                echo.log_event(row);
            }

            // Threshold validator exits reforge early once satisfied
            if let Some(threshold) = &reforge.threshold {
                let verdict = validator.run(threshold, &current_best, hook.as_deref()).await?;
                if verdict.valid {
                    debug!(phase = %phase.name, step, "Reforge threshold met; stopping early");
                    break;
                }
            }
        }

        Ok(current_best)
    }
}

/// Expand the model assignment into one model per sounding index
fn assign_models(config: &SoundingsConfig, default_model: &str, phase: &PhaseConfig) -> Vec<String> {
    let factor = config.factor.max(1);
    let base_model = phase.model.clone().unwrap_or_else(|| default_model.to_string());

    match &config.models {
        None => vec![base_model; factor],
        Some(ModelAssignment::List(list)) if list.is_empty() => vec![base_model; factor],
        Some(ModelAssignment::List(list)) => match config.model_strategy {
            ModelStrategy::RoundRobin => (0..factor).map(|i| list[i % list.len()].clone()).collect(),
            ModelStrategy::Random => {
                use rand::Rng;
                let mut rng = rand::rng();
                (0..factor)
                    .map(|_| list[rng.random_range(0..list.len())].clone())
                    .collect()
            }
        },
        Some(ModelAssignment::Map(map)) => {
            let mut assignment = Vec::new();
            for (model, entry) in map {
                for _ in 0..entry.factor.max(1) {
                    assignment.push(model.clone());
                }
            }
            if assignment.len() != factor {
                info!(
                    declared_factor = factor,
                    expanded = assignment.len(),
                    "Per-model factors override the top-level sounding factor"
                );
            }
            assignment
        }
    }
}
