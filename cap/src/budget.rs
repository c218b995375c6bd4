//! Context token budget estimation and enforcement
//!
//! Provider-agnostic approximation: four characters per token plus fixed
//! overhead per message and per tool schema. Enforcement strategies trade
//! context for headroom; every enforcement is logged by the caller.

use serde_json::Value;

use crate::agent::{Agent, AgentRequest, ChatMessage, MessageContent, Role};
use crate::cascade::config::{BudgetStrategy, TokenBudgetConfig};
use crate::error::{CascadeError, Result};

/// Chars-per-token approximation
const CHARS_PER_TOKEN: usize = 4;
/// Fixed token overhead per message (role, framing)
const TOKENS_PER_MESSAGE: usize = 4;
/// Fixed token overhead per tool schema beyond its JSON body
const TOKENS_PER_TOOL: usize = 8;

/// Result of a budget check
#[derive(Debug, Clone)]
pub struct BudgetCheck {
    pub current: usize,
    pub limit: usize,
    pub over_budget: bool,
    pub warning: bool,
    pub percentage: f64,
}

/// Outcome of enforcement
#[derive(Debug)]
pub struct EnforceOutcome {
    pub messages: Vec<ChatMessage>,
    pub dropped: usize,
    pub summarized: bool,
}

/// Token budget for one phase's context
pub struct TokenBudget {
    config: TokenBudgetConfig,
}

impl TokenBudget {
    pub fn new(config: TokenBudgetConfig) -> Self {
        Self { config }
    }

    /// Usable context limit after reserving output headroom
    pub fn limit(&self) -> usize {
        self.config.max_total.saturating_sub(self.config.reserve_for_output)
    }

    /// Approximate token count for a full request
    pub fn estimate(&self, messages: &[ChatMessage], tools: &[Value], system: &str) -> usize {
        let mut total = system.len() / CHARS_PER_TOKEN + TOKENS_PER_MESSAGE;
        for message in messages {
            total += estimate_message(message);
        }
        for tool in tools {
            total += tool.to_string().len() / CHARS_PER_TOKEN + TOKENS_PER_TOOL;
        }
        total
    }

    /// Check the current context against the budget
    pub fn check(&self, messages: &[ChatMessage], tools: &[Value], system: &str) -> BudgetCheck {
        let current = self.estimate(messages, tools, system);
        let limit = self.limit();
        let percentage = if limit > 0 {
            current as f64 / limit as f64
        } else {
            1.0
        };
        BudgetCheck {
            current,
            limit,
            over_budget: current > limit,
            warning: percentage >= self.config.warning_threshold,
            percentage,
        }
    }

    /// Bring the context under budget according to the strategy
    ///
    /// `summarize` needs an agent to write the summary; when none is
    /// available it degrades to `sliding_window`.
    pub async fn enforce(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[Value],
        system: &str,
        agent: Option<&dyn Agent>,
        model: &str,
    ) -> Result<EnforceOutcome> {
        let check = self.check(&messages, tools, system);
        if !check.over_budget {
            return Ok(EnforceOutcome {
                messages,
                dropped: 0,
                summarized: false,
            });
        }

        match self.config.strategy {
            BudgetStrategy::Fail => Err(CascadeError::BudgetExceeded {
                current: check.current,
                limit: check.limit,
            }),
            BudgetStrategy::SlidingWindow => Ok(self.drop_until_fit(messages, tools, system, true)),
            BudgetStrategy::PruneOldest => Ok(self.drop_until_fit(messages, tools, system, false)),
            BudgetStrategy::Summarize => match agent {
                Some(agent) => self.summarize(messages, tools, system, agent, model).await,
                None => Ok(self.drop_until_fit(messages, tools, system, true)),
            },
        }
    }

    /// Drop oldest messages until the estimate fits
    ///
    /// `spare_system` keeps system messages in place (sliding window);
    /// prune_oldest drops regardless of role.
    fn drop_until_fit(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[Value],
        system: &str,
        spare_system: bool,
    ) -> EnforceOutcome {
        let mut kept = messages;
        let mut dropped = 0;

        while self.check(&kept, tools, system).over_budget {
            let victim = kept
                .iter()
                .position(|m| !spare_system || m.role != Role::System);
            match victim {
                Some(idx) => {
                    kept.remove(idx);
                    dropped += 1;
                }
                None => break,
            }
        }

        EnforceOutcome {
            messages: kept,
            dropped,
            summarized: false,
        }
    }

    /// Replace the dropped prefix with one model-written summary message
    async fn summarize(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[Value],
        system: &str,
        agent: &dyn Agent,
        model: &str,
    ) -> Result<EnforceOutcome> {
        // Decide the prefix to fold: keep dropping until the remainder plus a
        // summary placeholder fits.
        let mut keep_from = 0;
        while keep_from < messages.len()
            && self.check(&messages[keep_from..].to_vec(), tools, system).over_budget
        {
            keep_from += 1;
        }
        if keep_from == 0 {
            return Ok(EnforceOutcome {
                messages,
                dropped: 0,
                summarized: false,
            });
        }

        let prefix_text: String = messages[..keep_from]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content.text_lossy()))
            .collect::<Vec<_>>()
            .join("\n");

        let request = AgentRequest {
            system: "Summarize the following conversation so an agent can continue it. \
                     Preserve decisions, facts, names and open questions. Be concise."
                .to_string(),
            user: Some(prefix_text),
            context: vec![],
            tools: vec![],
            model: model.to_string(),
        };

        let summary = agent.run(request).await.map_err(|e| CascadeError::Provider {
            phase: "budget_summarize".to_string(),
            message: e.to_string(),
        })?;

        let mut result = vec![ChatMessage::system(format!(
            "[Summary of earlier conversation]\n{}",
            summary.content
        ))];
        result.extend_from_slice(&messages[keep_from..]);

        Ok(EnforceOutcome {
            messages: result,
            dropped: keep_from,
            summarized: true,
        })
    }
}

fn estimate_message(message: &ChatMessage) -> usize {
    let content_len = match &message.content {
        MessageContent::Text(text) => text.len(),
        MessageContent::Parts(parts) => parts
            .iter()
            .map(|p| match p {
                crate::agent::ContentPart::Text { text } => text.len(),
                // Images count by their encoded payload
                crate::agent::ContentPart::ImageUrl { image_url } => image_url.url.len(),
            })
            .sum(),
    };
    content_len / CHARS_PER_TOKEN + TOKENS_PER_MESSAGE
}
