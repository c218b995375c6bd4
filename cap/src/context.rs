//! Context builder - declared context propagation between phases
//!
//! The default is a clean slate: a phase sees nothing from earlier phases
//! unless its `context` block names a source. Sources resolve to synthetic
//! messages injected ahead of the phase's own task: prior outputs, replayed
//! messages, stored images, or the current state map.

use std::path::Path;

use tracing::debug;

use crate::agent::{ChatMessage, ContentPart, ImageUrl};
use crate::cascade::config::{
    ContextConfig, ContextInclude, ContextSource, ContextSourceConfig, ImageFilter, MessagesFilter,
};
use crate::echo::Echo;
use crate::images::{encode_image_base64, list_phase_images};

/// Builds injected context messages for one phase
pub struct ContextBuilder<'a> {
    echo: &'a Echo,
    images_root: &'a Path,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(echo: &'a Echo, images_root: &'a Path) -> Self {
        Self { echo, images_root }
    }

    /// Resolve the declared context into an ordered message list
    ///
    /// `current_phase` anchors the "previous" keyword; `input` is the
    /// original cascade input for `include_input`.
    pub fn build(&self, config: &ContextConfig, current_phase: &str, input: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if config.include_input && !input.is_empty() {
            messages.push(ChatMessage::user(format!("[Original input]:\n{}", input)));
        }

        for source in &config.from {
            let resolved = self.resolve_source(source, current_phase, &config.exclude);
            for source_config in resolved {
                self.emit_source(&source_config, &mut messages);
            }
        }

        debug!(
            phase = current_phase,
            injected = messages.len(),
            "Context assembled"
        );
        messages
    }

    /// Expand keywords into concrete per-phase source configs
    fn resolve_source(
        &self,
        source: &ContextSource,
        current_phase: &str,
        exclude: &[String],
    ) -> Vec<ContextSourceConfig> {
        let completed: Vec<&str> = self
            .echo
            .lineage
            .iter()
            .map(|entry| entry.phase.as_str())
            .filter(|phase| *phase != current_phase)
            .collect();

        let template = match source {
            ContextSource::Config(config) => config.clone(),
            ContextSource::Name(_) => ContextSourceConfig::default(),
        };

        let phases: Vec<String> = match source.phase() {
            "all" => completed
                .iter()
                .filter(|phase| !exclude.iter().any(|e| e == *phase))
                .map(|phase| phase.to_string())
                .collect(),
            "first" => completed.first().map(|phase| phase.to_string()).into_iter().collect(),
            "previous" => completed.last().map(|phase| phase.to_string()).into_iter().collect(),
            name => vec![name.to_string()],
        };

        phases
            .into_iter()
            .map(|phase| {
                let mut config = template.clone();
                config.phase = phase;
                config
            })
            .collect()
    }

    /// Emit zero or more messages for one resolved source
    fn emit_source(&self, source: &ContextSourceConfig, messages: &mut Vec<ChatMessage>) {
        for include in &source.include {
            match include {
                ContextInclude::Output => {
                    if let Some(output) = self.echo.output_of(&source.phase) {
                        messages.push(ChatMessage::user(format!(
                            "[Output from {}]:\n{}",
                            source.phase, output
                        )));
                    }
                }
                ContextInclude::Messages => {
                    self.emit_messages(source, messages);
                }
                ContextInclude::Images => {
                    self.emit_images(source, messages);
                }
                ContextInclude::State => {
                    let state = self.echo.state_json();
                    if state.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                        messages.push(ChatMessage::user(format!("[Current state]:\n{}", state)));
                    }
                }
            }
        }
    }

    fn emit_messages(&self, source: &ContextSourceConfig, messages: &mut Vec<ChatMessage>) {
        let phase_messages: Vec<_> = self
            .echo
            .history
            .iter()
            .filter(|msg| msg.phase.as_deref() == Some(source.phase.as_str()))
            .collect();
        if phase_messages.is_empty() {
            return;
        }

        let selected: Vec<_> = match source.messages {
            MessagesFilter::All => phase_messages,
            MessagesFilter::AssistantOnly => phase_messages
                .into_iter()
                .filter(|msg| msg.role == "assistant")
                .collect(),
            MessagesFilter::LastTurn => {
                let last_turn = phase_messages.iter().filter_map(|msg| msg.turn).max();
                phase_messages
                    .into_iter()
                    .filter(|msg| msg.turn == last_turn)
                    .collect()
            }
        };

        for msg in selected {
            messages.push(ChatMessage::user(format!(
                "[{} from {}]:\n{}",
                msg.role,
                source.phase,
                msg.content.text_lossy()
            )));
        }
    }

    fn emit_images(&self, source: &ContextSourceConfig, messages: &mut Vec<ChatMessage>) {
        let all_paths = list_phase_images(self.images_root, &self.echo.session_id, &source.phase);
        if all_paths.is_empty() {
            return;
        }

        let selected: Vec<_> = match source.images {
            ImageFilter::All => all_paths,
            ImageFilter::Last => all_paths.into_iter().rev().take(1).rev().collect(),
            ImageFilter::LastN => {
                let n = source.last_n.max(1);
                let skip = all_paths.len().saturating_sub(n);
                all_paths.into_iter().skip(skip).collect()
            }
        };

        let mut parts = vec![ContentPart::Text {
            text: format!("[Images from {}]", source.phase),
        }];
        for path in selected {
            match encode_image_base64(&path) {
                Ok(url) => parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl { url },
                }),
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable image"),
            }
        }
        if parts.len() > 1 {
            messages.push(ChatMessage::user_parts(parts));
        }
    }
}
