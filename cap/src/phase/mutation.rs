//! Sounding mutations - per-attempt prompt variation
//!
//! The first sounding always runs the baseline prompt. Later indices vary
//! it: `augment` prepends a directive, `approach` appends a strategy hint,
//! and the rewrite modes hand the whole prompt to a rewriter model. The
//! `rewrite` mode (but not `rewrite_free`) shows the rewriter prior winning
//! rewrites of the same species as examples.

use tracing::{debug, warn};

use crate::agent::{Agent, AgentRequest};
use crate::cascade::config::MutationMode;

/// Built-in augment directives, used when a phase declares no mutations
const AUGMENT_BANK: &[&str] = &[
    "Be maximally thorough; cover edge cases the obvious answer misses.",
    "Be ruthlessly concise; every sentence must earn its place.",
    "Favor concrete examples over abstract description.",
    "Challenge the premise before answering; state any assumption you reject.",
];

/// Built-in approach hints
const APPROACH_BANK: &[&str] = &[
    "Approach: work backwards from the desired end state.",
    "Approach: enumerate candidate solutions first, then commit to the best.",
    "Approach: reason step by step out loud before the final answer.",
    "Approach: consider how an expert reviewer would critique the result, then pre-empt that critique.",
];

/// Built-in rewrite directives for the rewriter model
const REWRITE_BANK: &[&str] = &[
    "Rewrite this prompt to be more specific and demanding.",
    "Rewrite this prompt to emphasize creative, unexpected results.",
    "Rewrite this prompt to focus on rigor and verifiability.",
];

/// A mutation resolved for one sounding index
#[derive(Debug, Clone)]
pub struct AppliedMutation {
    pub mode: MutationMode,
    /// The mutation template that was selected
    pub template: String,
    /// For rewrite modes: the rewriter's full output, which replaces the
    /// instructions. Empty for augment/approach.
    pub rewritten: Option<String>,
}

impl AppliedMutation {
    /// Apply this mutation to rendered instructions
    pub fn apply(&self, instructions: &str) -> String {
        match self.mode {
            MutationMode::Augment => format!("{}\n\n{}", self.template, instructions),
            MutationMode::Approach => format!("{}\n\n{}", instructions, self.template),
            MutationMode::Rewrite | MutationMode::RewriteFree => self
                .rewritten
                .clone()
                .unwrap_or_else(|| instructions.to_string()),
        }
    }

    /// Value recorded in the `mutation_applied` log column
    pub fn applied_text(&self) -> &str {
        self.rewritten.as_deref().unwrap_or(&self.template)
    }

    pub fn mode_str(&self) -> &'static str {
        match self.mode {
            MutationMode::Rewrite => "rewrite",
            MutationMode::RewriteFree => "rewrite_free",
            MutationMode::Augment => "augment",
            MutationMode::Approach => "approach",
        }
    }
}

/// Select the mutation template for a sounding index
///
/// Index 0 is the baseline and gets none. Index i > 0 takes
/// `mutations[(i-1) mod len]` from the declared list, or from the built-in
/// bank matching the mode.
pub fn select_template(mode: MutationMode, declared: &[String], index: usize) -> Option<String> {
    if index == 0 {
        return None;
    }
    let bank: Vec<String> = if declared.is_empty() {
        let builtin = match mode {
            MutationMode::Augment => AUGMENT_BANK,
            MutationMode::Approach => APPROACH_BANK,
            MutationMode::Rewrite | MutationMode::RewriteFree => REWRITE_BANK,
        };
        builtin.iter().map(|s| s.to_string()).collect()
    } else {
        declared.to_vec()
    };
    Some(bank[(index - 1) % bank.len()].clone())
}

/// Run the rewriter model for a rewrite-mode mutation
///
/// `prior_winners` holds winning rewrites with the same species hash;
/// they are injected as examples only in `rewrite` mode (learning from
/// winners). Failure falls back to the original prompt.
pub async fn rewrite_prompt(
    agent: &dyn Agent,
    model: &str,
    original: &str,
    mutation_instruction: &str,
    prior_winners: &[String],
) -> String {
    let mut user = format!(
        "Original prompt:\n---\n{}\n---\n\nRewrite directive: {}\n\n",
        original, mutation_instruction
    );
    if !prior_winners.is_empty() {
        user.push_str("These rewrites of the same prompt template won previous evaluations:\n\n");
        for (i, winner) in prior_winners.iter().enumerate() {
            user.push_str(&format!("Winning rewrite {}:\n{}\n\n", i + 1, winner));
        }
    }
    user.push_str("Respond with ONLY the rewritten prompt, no commentary.");

    let request = AgentRequest {
        system: "You rewrite prompts for language models. Keep the intent and every hard \
                 requirement of the original; change framing, emphasis and structure per \
                 the directive."
            .to_string(),
        user: Some(user),
        context: vec![],
        tools: vec![],
        model: model.to_string(),
    };

    match agent.run(request).await {
        Ok(response) if !response.content.trim().is_empty() => {
            debug!(model, "Rewriter produced mutated prompt");
            response.content.trim().to_string()
        }
        Ok(_) => {
            warn!("Rewriter returned empty output; using original prompt");
            original.to_string()
        }
        Err(e) => {
            warn!(error = %e, "Rewriter failed; using original prompt");
            original.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{MockAgent, text_response};

    #[test]
    fn test_baseline_gets_no_mutation() {
        assert!(select_template(MutationMode::Approach, &[], 0).is_none());
    }

    #[test]
    fn test_declared_mutations_cycle() {
        let declared = vec!["a".to_string(), "b".to_string()];
        assert_eq!(select_template(MutationMode::Augment, &declared, 1).unwrap(), "a");
        assert_eq!(select_template(MutationMode::Augment, &declared, 2).unwrap(), "b");
        assert_eq!(select_template(MutationMode::Augment, &declared, 3).unwrap(), "a");
    }

    #[test]
    fn test_builtin_bank_used_when_empty() {
        let template = select_template(MutationMode::Approach, &[], 1).unwrap();
        assert!(template.starts_with("Approach:"));
    }

    #[test]
    fn test_augment_prepends_approach_appends() {
        let augment = AppliedMutation {
            mode: MutationMode::Augment,
            template: "BE BOLD".to_string(),
            rewritten: None,
        };
        assert!(augment.apply("write a poem").starts_with("BE BOLD"));

        let approach = AppliedMutation {
            mode: MutationMode::Approach,
            template: "Approach: backwards".to_string(),
            rewritten: None,
        };
        assert!(approach.apply("write a poem").ends_with("Approach: backwards"));
    }

    #[test]
    fn test_rewrite_replaces_instructions() {
        let mutation = AppliedMutation {
            mode: MutationMode::Rewrite,
            template: "make it specific".to_string(),
            rewritten: Some("Write a 14-line sonnet about tides".to_string()),
        };
        assert_eq!(mutation.apply("write a poem"), "Write a 14-line sonnet about tides");
        assert_eq!(mutation.applied_text(), "Write a 14-line sonnet about tides");
    }

    #[tokio::test]
    async fn test_rewrite_prompt_uses_agent() {
        let agent = MockAgent::new(vec![text_response("REWRITTEN PROMPT")]);
        let result = rewrite_prompt(&agent, "m", "original", "directive", &[]).await;
        assert_eq!(result, "REWRITTEN PROMPT");
    }

    #[tokio::test]
    async fn test_rewrite_prompt_includes_prior_winners() {
        let agent = MockAgent::new(vec![text_response("ok")]);
        let winners = vec!["previous winning rewrite".to_string()];
        rewrite_prompt(&agent, "m", "original", "directive", &winners).await;

        let requests = agent.requests();
        assert!(requests[0].user.as_ref().unwrap().contains("previous winning rewrite"));
    }

    #[tokio::test]
    async fn test_rewrite_failure_falls_back() {
        let agent = MockAgent::new(vec![]);
        let result = rewrite_prompt(&agent, "m", "the original", "directive", &[]).await;
        assert_eq!(result, "the original");
    }
}
