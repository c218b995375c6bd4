//! Sounding evaluators - winner selection over parallel attempts
//!
//! Five selection modes: quality-only LLM judgment, cost-aware judgment,
//! Pareto frontier over (quality, cost), human checkpoint, and an LLM
//! prefilter feeding a human pick (hybrid). Aggregate mode synthesizes one
//! output instead of choosing.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::agent::{Agent, AgentRequest, ChatMessage, ContentPart, ImageUrl};
use crate::cascade::config::{ParetoPolicy, SoundingsConfig, TimeoutFallback};
use crate::checkpoint::{CheckpointManager, CheckpointRecord, CheckpointType, UiOption, UiSection};
use crate::images::encode_image_base64;
use crate::sounding::pareto::{ParetoCandidate, pareto_frontier, select_from_frontier};

/// One attempt as seen by an evaluator
#[derive(Debug, Clone)]
pub struct EvalCandidate {
    /// Original sounding index
    pub index: usize,
    pub model: String,
    pub output: String,
    pub cost: Option<f64>,
    /// Pre-eval validation note shown to the evaluator, if validation ran
    pub validation_note: Option<String>,
    pub image_paths: Vec<PathBuf>,
    pub mutation: Option<String>,
}

/// Which sounding won and how the decision was made
#[derive(Debug, Clone)]
pub struct EvalDecision {
    pub winner: usize,
    pub mode: String,
}

/// Outcome of a human evaluation checkpoint
pub enum HumanVerdict {
    Selected(usize),
    RejectAll,
    TimedOut,
}

/// Detail logged alongside a Pareto decision
#[derive(Debug, Clone)]
pub struct ParetoDetail {
    pub scores: Vec<(usize, f64)>,
    pub frontier: Vec<ParetoCandidate>,
    pub dominated: Vec<ParetoCandidate>,
}

const DEFAULT_EVALUATOR_INSTRUCTIONS: &str =
    "Judge the attempts on correctness, completeness and quality of execution.";

/// Quality-only LLM evaluation
///
/// Ambiguous replies fall back to the first candidate.
pub async fn evaluate_quality(
    agent: &dyn Agent,
    model: &str,
    instructions: Option<&str>,
    candidates: &[EvalCandidate],
) -> EvalDecision {
    let system = format!(
        "You are evaluating {} parallel attempts at the same task. {}\n\
         Respond with ONLY the number of the best attempt (1-{}).",
        candidates.len(),
        instructions.unwrap_or(DEFAULT_EVALUATOR_INSTRUCTIONS),
        candidates.len()
    );

    let request = AgentRequest {
        system,
        user: None,
        context: vec![candidates_message(candidates)],
        tools: vec![],
        model: model.to_string(),
    };

    let winner_position = match agent.run(request).await {
        Ok(response) => parse_selection(&response.content, candidates.len()),
        Err(e) => {
            warn!(error = %e, "Quality evaluator failed; defaulting to attempt 1");
            None
        }
    };

    let position = winner_position.unwrap_or(1);
    EvalDecision {
        winner: candidates[position - 1].index,
        mode: "llm".to_string(),
    }
}

/// Cost-aware LLM evaluation
///
/// Shows per-attempt cost (normalized against the priciest) and asks for
/// the best quality-to-cost trade.
pub async fn evaluate_cost_aware(
    agent: &dyn Agent,
    model: &str,
    instructions: Option<&str>,
    candidates: &[EvalCandidate],
) -> EvalDecision {
    let max_cost = candidates
        .iter()
        .filter_map(|c| c.cost)
        .fold(f64::EPSILON, f64::max);

    let mut body = String::new();
    for (position, candidate) in candidates.iter().enumerate() {
        let cost = candidate.cost.unwrap_or(0.0);
        body.push_str(&format!(
            "ATTEMPT {} (model: {}, cost: ${:.6}, relative cost: {:.0}%):\n{}\n\n",
            position + 1,
            candidate.model,
            cost,
            cost / max_cost * 100.0,
            candidate.output
        ));
    }

    let system = format!(
        "You are evaluating {} parallel attempts with their dollar costs. {}\n\
         Weigh quality against cost: a slightly weaker attempt at a fraction of \
         the cost can be the better choice. Respond with ONLY the number of the \
         winning attempt (1-{}).",
        candidates.len(),
        instructions.unwrap_or(DEFAULT_EVALUATOR_INSTRUCTIONS),
        candidates.len()
    );

    let request = AgentRequest {
        system,
        user: Some(body),
        context: vec![],
        tools: vec![],
        model: model.to_string(),
    };

    let position = match agent.run(request).await {
        Ok(response) => parse_selection(&response.content, candidates.len()).unwrap_or(1),
        Err(e) => {
            warn!(error = %e, "Cost-aware evaluator failed; defaulting to attempt 1");
            1
        }
    };

    EvalDecision {
        winner: candidates[position - 1].index,
        mode: "cost_aware".to_string(),
    }
}

/// Pareto evaluation: LLM quality scores, then frontier selection by policy
pub async fn evaluate_pareto(
    agent: &dyn Agent,
    model: &str,
    instructions: Option<&str>,
    candidates: &[EvalCandidate],
    policy: ParetoPolicy,
) -> (EvalDecision, ParetoDetail) {
    let system = format!(
        "You are scoring {} parallel attempts at the same task. {}\n\
         Assign each attempt a quality score from 0 to 100. Respond with ONLY \
         a JSON object: {{\"scores\": [s1, s2, ...]}} in attempt order.",
        candidates.len(),
        instructions.unwrap_or(DEFAULT_EVALUATOR_INSTRUCTIONS),
    );

    let request = AgentRequest {
        system,
        user: None,
        context: vec![candidates_message(candidates)],
        tools: vec![],
        model: model.to_string(),
    };

    let scores: Vec<f64> = match agent.run(request).await {
        Ok(response) => crate::validate::extract_json_lenient(&response.content)
            .and_then(|value| {
                value.get("scores").and_then(|s| {
                    s.as_array()
                        .map(|items| items.iter().filter_map(|v| v.as_f64()).collect::<Vec<_>>())
                })
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Pareto scorer failed; scoring all attempts equal");
            Vec::new()
        }
    };

    let scores: Vec<f64> = if scores.len() == candidates.len() {
        scores
    } else {
        vec![50.0; candidates.len()]
    };

    let pareto_candidates: Vec<ParetoCandidate> = candidates
        .iter()
        .zip(scores.iter())
        .map(|(candidate, score)| ParetoCandidate {
            index: candidate.index,
            quality: *score,
            cost: candidate.cost.unwrap_or(0.0),
        })
        .collect();

    let (frontier, dominated) = pareto_frontier(&pareto_candidates);
    let winner = select_from_frontier(&frontier, policy)
        .unwrap_or_else(|| candidates.first().map(|c| c.index).unwrap_or(0));

    debug!(?policy, winner, frontier = frontier.len(), "Pareto selection complete");
    (
        EvalDecision {
            winner,
            mode: "pareto".to_string(),
        },
        ParetoDetail {
            scores: candidates.iter().map(|c| c.index).zip(scores).collect(),
            frontier,
            dominated,
        },
    )
}

/// Human evaluation through a SOUNDING_EVAL checkpoint
pub async fn evaluate_human(
    checkpoints: &CheckpointManager,
    session_id: &str,
    cascade_id: &str,
    phase_name: &str,
    candidates: &[EvalCandidate],
    config: &SoundingsConfig,
) -> (HumanVerdict, String) {
    let mut record = CheckpointRecord::new(session_id, cascade_id, phase_name, CheckpointType::SoundingEval);
    record.sounding_outputs = Some(candidates.iter().map(|c| c.output.clone()).collect());
    record.sounding_metadata = Some(json!(
        candidates
            .iter()
            .map(|c| {
                json!({
                    "sounding_index": c.index,
                    "model": c.model,
                    "cost": c.cost,
                    "mutation": c.mutation,
                    "validation": c.validation_note,
                    "images": c.image_paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>()
    ));
    record.timeout_seconds = config.timeout_seconds;
    record.ui_spec = vec![UiSection {
        kind: "card_grid".to_string(),
        input_name: Some("selected_index".to_string()),
        label: Some("Pick the winning attempt".to_string()),
        options: candidates
            .iter()
            .enumerate()
            .map(|(position, c)| UiOption {
                id: position.to_string(),
                label: format!("Attempt {} ({})", position + 1, c.model),
                description: Some(c.output.chars().take(200).collect()),
            })
            .chain(std::iter::once(UiOption {
                id: "reject_all".to_string(),
                label: "Reject all attempts".to_string(),
                description: None,
            }))
            .collect(),
        required: true,
        selection_mode: Some("single".to_string()),
        ..Default::default()
    }];

    let id = checkpoints.create(record);
    let timeout = config.timeout_seconds.map(Duration::from_secs);
    let response = checkpoints.wait_for_response(&id, timeout, None).await;

    let verdict = match response {
        None => HumanVerdict::TimedOut,
        Some(value) => {
            let selected = value.get("selected_index").and_then(|v| v.as_str()).unwrap_or("");
            if selected == "reject_all" {
                HumanVerdict::RejectAll
            } else {
                match selected.parse::<usize>() {
                    Ok(position) if position < candidates.len() => {
                        HumanVerdict::Selected(candidates[position].index)
                    }
                    _ => {
                        warn!(selected, "Unparseable human selection; treating as timeout");
                        HumanVerdict::TimedOut
                    }
                }
            }
        }
    };
    (verdict, id)
}

/// Resolve a human-eval timeout per the configured fallback
pub async fn resolve_timeout(
    agent: &dyn Agent,
    model: &str,
    candidates: &[EvalCandidate],
    config: &SoundingsConfig,
) -> Option<EvalDecision> {
    match config.on_timeout {
        TimeoutFallback::Abort => None,
        TimeoutFallback::First => Some(EvalDecision {
            winner: candidates[0].index,
            mode: "first".to_string(),
        }),
        TimeoutFallback::Random => {
            use rand::Rng;
            let position = rand::rng().random_range(0..candidates.len());
            Some(EvalDecision {
                winner: candidates[position].index,
                mode: "random".to_string(),
            })
        }
        TimeoutFallback::LlmFallback => {
            let mut decision =
                evaluate_quality(agent, model, config.evaluator_instructions.as_deref(), candidates).await;
            decision.mode = "llm_fallback".to_string();
            Some(decision)
        }
    }
}

/// Hybrid: LLM prefilter to top-N, then the human picks among those
pub async fn prefilter_top_n(
    agent: &dyn Agent,
    model: &str,
    instructions: Option<&str>,
    candidates: &[EvalCandidate],
    top_n: usize,
) -> Vec<EvalCandidate> {
    if candidates.len() <= top_n {
        return candidates.to_vec();
    }

    let system = format!(
        "You are prefiltering {} parallel attempts for human review. {}\n\
         Respond with ONLY a JSON array of the {} best attempt numbers (1-{}), best first.",
        candidates.len(),
        instructions.unwrap_or(DEFAULT_EVALUATOR_INSTRUCTIONS),
        top_n,
        candidates.len()
    );

    let request = AgentRequest {
        system,
        user: None,
        context: vec![candidates_message(candidates)],
        tools: vec![],
        model: model.to_string(),
    };

    let positions: Vec<usize> = match agent.run(request).await {
        Ok(response) => crate::validate::extract_json_lenient(&response.content)
            .and_then(|value| {
                value.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_u64().map(|n| n as usize))
                        .filter(|n| (1..=candidates.len()).contains(n))
                        .collect()
                })
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Hybrid prefilter failed; passing all candidates to the human");
            Vec::new()
        }
    };

    if positions.is_empty() {
        return candidates.to_vec();
    }
    positions
        .into_iter()
        .take(top_n)
        .map(|position| candidates[position - 1].clone())
        .collect()
}

/// Aggregate mode: synthesize one output from all surviving attempts
pub async fn aggregate_outputs(
    agent: &dyn Agent,
    model: &str,
    aggregator_instructions: Option<&str>,
    candidates: &[EvalCandidate],
) -> String {
    match aggregator_instructions {
        Some(instructions) => {
            let system = format!(
                "You are synthesizing {} parallel attempts into a single result.\n{}",
                candidates.len(),
                instructions
            );
            let request = AgentRequest {
                system,
                user: None,
                context: vec![candidates_message(candidates)],
                tools: vec![],
                model: model.to_string(),
            };
            match agent.run(request).await {
                Ok(response) if !response.content.trim().is_empty() => response.content,
                Ok(_) | Err(_) => {
                    warn!("Aggregator failed or was empty; concatenating outputs");
                    concatenate(candidates)
                }
            }
        }
        None => concatenate(candidates),
    }
}

fn concatenate(candidates: &[EvalCandidate]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(position, c)| format!("=== Attempt {} ({}) ===\n{}", position + 1, c.model, c.output))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// One multi-modal message presenting every attempt with labeled images
fn candidates_message(candidates: &[EvalCandidate]) -> ChatMessage {
    let mut parts = Vec::new();
    for (position, candidate) in candidates.iter().enumerate() {
        let mut header = format!("ATTEMPT {}:\n{}", position + 1, candidate.output);
        if let Some(note) = &candidate.validation_note {
            header.push_str(&format!("\n[validation: {}]", note));
        }
        parts.push(ContentPart::Text { text: header });

        let total = candidate.image_paths.len();
        for (image_position, path) in candidate.image_paths.iter().enumerate() {
            match encode_image_base64(path) {
                Ok(url) => {
                    parts.push(ContentPart::Text {
                        text: format!("ATTEMPT {} / IMAGE {}/{}", position + 1, image_position + 1, total),
                    });
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl { url },
                    });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable evaluation image"),
            }
        }
    }
    ChatMessage::user_parts(parts)
}

/// First integer in the reply, clamped to the candidate range
fn parse_selection(content: &str, max: usize) -> Option<usize> {
    let mut current = String::new();
    for ch in content.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    current
        .parse::<usize>()
        .ok()
        .filter(|n| (1..=max).contains(n))
}
