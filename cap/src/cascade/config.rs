//! Cascade and phase configuration types
//!
//! A cascade is declared in JSON or YAML; phases are listed in order but may
//! be entered out-of-order via handoffs. Everything here is plain data; the
//! runners interpret it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Top-level cascade definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub cascade_id: String,
    pub description: Option<String>,
    /// Parameter name -> human description; presence makes the cascade
    /// callable as a tool
    pub inputs_schema: BTreeMap<String, String>,
    pub phases: Vec<PhaseConfig>,
    /// Named validators shared by wards, loop_until and sounding pre-eval
    pub validators: BTreeMap<String, ValidatorConfig>,
    /// Cascade-level soundings: fork whole child cascades and evaluate
    pub soundings: Option<SoundingsConfig>,
    pub memory: Option<MemoryConfig>,
    pub token_budget: Option<TokenBudgetConfig>,
    pub tool_caching: Option<ToolCachingConfig>,
}

impl CascadeConfig {
    /// Find a phase by name
    pub fn phase(&self, name: &str) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Basic structural validation, run before execution
    pub fn validate(&self) -> Result<(), String> {
        if self.cascade_id.is_empty() {
            return Err("cascade_id is required".to_string());
        }
        if self.phases.is_empty() {
            return Err(format!("Cascade '{}' declares no phases", self.cascade_id));
        }
        for phase in &self.phases {
            if phase.name.is_empty() {
                return Err(format!("Cascade '{}' has a phase with no name", self.cascade_id));
            }
            for handoff in &phase.handoffs {
                let target = handoff.target();
                if self.phase(target).is_none() {
                    return Err(format!(
                        "Phase '{}' hands off to unknown phase '{}'",
                        phase.name, target
                    ));
                }
            }
            if phase.instructions.is_empty() && phase.tool.is_none() {
                return Err(format!(
                    "Phase '{}' has neither instructions nor a deterministic tool",
                    phase.name
                ));
            }
        }
        Ok(())
    }
}

/// One phase of a cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub name: String,
    /// Instruction template; `@path` loads from file
    pub instructions: String,
    /// Tools available to this phase
    pub tackle: TackleSpec,
    /// Model override; the configured default applies when absent
    pub model: Option<String>,
    /// Native provider tool-calling vs the prompt-form code-fence protocol
    pub use_native_tools: bool,
    pub rules: RulesConfig,
    pub handoffs: Vec<Handoff>,
    pub sub_cascades: Vec<SubCascadeRef>,
    pub async_cascades: Vec<AsyncCascadeRef>,
    pub soundings: Option<SoundingsConfig>,
    pub wards: WardsConfig,
    pub rag: Option<RagConfig>,
    /// Declared context dependencies; absent means clean slate
    pub context: Option<ContextConfig>,
    pub output_schema: Option<Value>,
    pub output_extraction: Option<OutputExtractionConfig>,
    pub human_input: Option<HumanInputConfig>,
    pub audibles: Option<AudibleConfig>,
    pub callouts: Option<CalloutConfig>,
    pub decision_points: Option<DecisionConfig>,
    /// Deterministic phase: run this tool directly, no model involved
    pub tool: Option<String>,
    pub tool_inputs: Option<Value>,
}

impl PhaseConfig {
    /// A deterministic phase declares a tool and no model instructions
    pub fn is_deterministic(&self) -> bool {
        self.tool.is_some() && self.instructions.is_empty()
    }

    pub fn sounding_factor(&self) -> usize {
        self.soundings.as_ref().map(|s| s.factor).unwrap_or(1)
    }
}

/// Tools for a phase: an explicit list or quartermaster selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TackleSpec {
    /// The literal string "manifest" asks the quartermaster to pick
    Keyword(String),
    Names(Vec<String>),
}

impl TackleSpec {
    pub fn is_manifest(&self) -> bool {
        matches!(self, TackleSpec::Keyword(k) if k == "manifest")
    }

    pub fn names(&self) -> &[String] {
        match self {
            TackleSpec::Names(names) => names,
            TackleSpec::Keyword(_) => &[],
        }
    }
}

impl Default for TackleSpec {
    fn default() -> Self {
        TackleSpec::Names(Vec::new())
    }
}

/// Per-phase execution rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub max_turns: usize,
    pub max_attempts: usize,
    /// Named validator that must pass before the phase can complete
    pub loop_until: Option<String>,
    /// Message injected when loop_until fails and turns remain
    pub loop_until_prompt: Option<String>,
    /// Template injected on retry attempts; a default carries the last error
    pub retry_instructions: Option<String>,
    /// User content for turns after the first
    pub turn_prompt: Option<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_turns: 1,
            max_attempts: 1,
            loop_until: None,
            loop_until_prompt: None,
            retry_instructions: None,
            turn_prompt: None,
        }
    }
}

/// Transition to a successor phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Handoff {
    Name(String),
    Described { target: String, description: Option<String> },
}

impl Handoff {
    pub fn target(&self) -> &str {
        match self {
            Handoff::Name(name) => name,
            Handoff::Described { target, .. } => target,
        }
    }
}

/// Synchronous child cascade launched from a phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubCascadeRef {
    pub path: String,
    /// Input template for the child; defaults to the parent phase output
    pub input: Option<String>,
    /// State keys copied into the child before it runs
    pub context_in: Vec<String>,
    /// State keys merged back into the parent after completion
    pub context_out: Vec<String>,
}

/// Detached child cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncCascadeRef {
    pub path: String,
    pub input: Option<String>,
    /// "on_start" fires before the phase runs, "on_end" after
    pub trigger: AsyncTrigger,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTrigger {
    OnStart,
    #[default]
    OnEnd,
}

/// Parallel attempt configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundingsConfig {
    pub factor: usize,
    pub max_parallel: usize,
    /// Whether non-baseline attempts mutate the prompt at all
    pub mutate: bool,
    pub mutation_mode: MutationMode,
    /// Explicit mutation templates; a built-in bank applies when empty
    pub mutations: Vec<String>,
    /// Named validator run against each attempt before evaluation
    pub validator: Option<String>,
    pub models: Option<ModelAssignment>,
    pub model_strategy: ModelStrategy,
    pub evaluator: EvaluatorKind,
    pub evaluator_instructions: Option<String>,
    pub mode: SoundingMode,
    pub aggregator_instructions: Option<String>,
    pub cost_aware_evaluation: bool,
    pub pareto_frontier: Option<ParetoConfig>,
    pub reforge: Option<ReforgeConfig>,
    /// Human evaluation timeout and fallback
    pub timeout_seconds: Option<u64>,
    pub on_timeout: TimeoutFallback,
    /// Candidates the LLM prefilter keeps in hybrid evaluation
    pub hybrid_top_n: usize,
}

impl Default for SoundingsConfig {
    fn default() -> Self {
        Self {
            factor: 1,
            max_parallel: 3,
            mutate: true,
            mutation_mode: MutationMode::Approach,
            mutations: Vec::new(),
            validator: None,
            models: None,
            model_strategy: ModelStrategy::RoundRobin,
            evaluator: EvaluatorKind::Llm,
            evaluator_instructions: None,
            mode: SoundingMode::Evaluate,
            aggregator_instructions: None,
            cost_aware_evaluation: false,
            pareto_frontier: None,
            reforge: None,
            timeout_seconds: None,
            on_timeout: TimeoutFallback::LlmFallback,
            hybrid_top_n: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationMode {
    Rewrite,
    RewriteFree,
    Augment,
    Approach,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStrategy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    #[default]
    Llm,
    Human,
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoundingMode {
    #[default]
    Evaluate,
    Aggregate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutFallback {
    #[default]
    LlmFallback,
    Random,
    First,
    Abort,
}

/// Per-model attempt counts, or a plain list spread by strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelAssignment {
    List(Vec<String>),
    Map(BTreeMap<String, ModelEntry>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    pub factor: usize,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self { factor: 1 }
    }
}

/// Pareto frontier selection over (quality up, cost down)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParetoConfig {
    pub enabled: bool,
    pub policy: ParetoPolicy,
}

impl Default for ParetoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: ParetoPolicy::Balanced,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParetoPolicy {
    PreferCheap,
    PreferQuality,
    #[default]
    Balanced,
    Interactive,
}

/// Iterative refinement of the winning sounding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReforgeConfig {
    pub steps: usize,
    pub honing_prompt: Option<String>,
    pub factor_per_step: usize,
    pub mutate: bool,
    /// Named validator; passing it after a step exits reforge early
    pub threshold: Option<String>,
}

impl Default for ReforgeConfig {
    fn default() -> Self {
        Self {
            steps: 1,
            honing_prompt: None,
            factor_per_step: 2,
            mutate: false,
            threshold: None,
        }
    }
}

/// Validators attached to phase input, output and turns
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardsConfig {
    pub pre: Vec<WardConfig>,
    pub post: Vec<WardConfig>,
    pub turn: Vec<WardConfig>,
}

impl WardsConfig {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty() && self.turn.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WardConfig {
    pub validator: String,
    pub mode: WardMode,
}

impl Default for WardConfig {
    fn default() -> Self {
        Self {
            validator: String::new(),
            mode: WardMode::Advisory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WardMode {
    Blocking,
    Advisory,
    Retry,
}

/// A named validator: a builtin function or a sub-cascade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Builtin function name (has_json, non_empty, contains, matches, ...)
    pub function: Option<String>,
    /// Path to a cascade whose final output is `{"valid": bool, "reason": str}`
    pub cascade: Option<String>,
    /// Arguments for the builtin (pattern, substring, min length, ...)
    pub args: Option<Value>,
}

/// Context sources injected into a phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Phase names or the keywords "all" | "first" | "previous"
    pub from: Vec<ContextSource>,
    /// Phases removed from an "all" expansion
    pub exclude: Vec<String>,
    /// Also inject the original cascade input message
    pub include_input: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextSource {
    Name(String),
    Config(ContextSourceConfig),
}

impl ContextSource {
    pub fn phase(&self) -> &str {
        match self {
            ContextSource::Name(name) => name,
            ContextSource::Config(config) => &config.phase,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSourceConfig {
    pub phase: String,
    /// Subset of {images, output, messages, state}
    pub include: Vec<ContextInclude>,
    pub images: ImageFilter,
    /// For last_n image selection
    pub last_n: usize,
    pub messages: MessagesFilter,
}

impl Default for ContextSourceConfig {
    fn default() -> Self {
        Self {
            phase: String::new(),
            include: vec![ContextInclude::Output],
            images: ImageFilter::All,
            last_n: 1,
            messages: MessagesFilter::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextInclude {
    Images,
    Output,
    Messages,
    State,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFilter {
    #[default]
    All,
    Last,
    LastN,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagesFilter {
    #[default]
    All,
    AssistantOnly,
    LastTurn,
}

/// Structured output capture into echo state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputExtractionConfig {
    pub pattern: String,
    pub store_as: String,
    pub format: ExtractionFormat,
    pub required: bool,
}

impl Default for OutputExtractionConfig {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            store_as: "extracted".to_string(),
            format: ExtractionFormat::Text,
            required: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionFormat {
    #[default]
    Text,
    Json,
    Code,
}

/// Human-in-the-loop gate on phase output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanInputConfig {
    /// Template; the checkpoint is created only when it renders truthy
    /// (non-empty, not "false"/"0"). Absent means always.
    pub condition: Option<String>,
    pub title: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub on_timeout: HumanTimeoutBehavior,
}

impl Default for HumanInputConfig {
    fn default() -> Self {
        Self {
            condition: None,
            title: None,
            timeout_seconds: None,
            on_timeout: HumanTimeoutBehavior::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanTimeoutBehavior {
    Abort,
    #[default]
    Continue,
    Default,
    Escalate,
}

/// Mid-phase user interjection channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudibleConfig {
    pub enabled: bool,
    /// Maximum audibles honored within one phase
    pub budget: usize,
    pub timeout_seconds: u64,
}

impl Default for AudibleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget: 3,
            timeout_seconds: 300,
        }
    }
}

/// Tag the final assistant message for easy retrieval
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalloutConfig {
    /// Rendered name template
    pub name: String,
}

/// Model-driven decision blocks in phase output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub enabled: bool,
    pub timeout_seconds: Option<u64>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: None,
        }
    }
}

/// RAG retrieval routed through a registered tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub tool: String,
    /// Query template; defaults to the rendered phase input
    pub query: Option<String>,
    pub top_k: Option<usize>,
}

/// Prior-winner memory (learning from winners is keyed by species hash)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Winning rewrites injected as examples into the rewrite mutator
    pub max_examples: usize,
}

/// Context token budget enforcement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    pub max_total: usize,
    pub reserve_for_output: usize,
    pub strategy: BudgetStrategy,
    /// Fraction of budget that triggers a warning
    pub warning_threshold: f64,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            max_total: 100_000,
            reserve_for_output: 8_000,
            strategy: BudgetStrategy::SlidingWindow,
            warning_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStrategy {
    #[default]
    SlidingWindow,
    PruneOldest,
    Summarize,
    Fail,
}

/// Deterministic tool result caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCachingConfig {
    pub enabled: bool,
    pub max_cache_size: usize,
    pub tools: BTreeMap<String, ToolCachePolicy>,
}

impl Default for ToolCachingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_cache_size: 256,
            tools: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCachePolicy {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub key: CacheKeyKind,
    /// Events that drop entries cached under this policy
    pub invalidate_on: Vec<String>,
}

impl Default for ToolCachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            key: CacheKeyKind::ArgsHash,
            invalidate_on: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKeyKind {
    #[default]
    ArgsHash,
    Query,
    SqlHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_cascade_parses() {
        let json = r#"{
            "cascade_id": "hello",
            "phases": [
                { "name": "greet", "instructions": "Say hello to {{input}}" }
            ]
        }"#;
        let config: CascadeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.cascade_id, "hello");
        assert_eq!(config.phases.len(), 1);
        assert_eq!(config.phases[0].rules.max_turns, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tackle_spec_forms() {
        let keyword: TackleSpec = serde_json::from_str(r#""manifest""#).unwrap();
        assert!(keyword.is_manifest());

        let names: TackleSpec = serde_json::from_str(r#"["search", "run_sql"]"#).unwrap();
        assert!(!names.is_manifest());
        assert_eq!(names.names(), ["search", "run_sql"]);
    }

    #[test]
    fn test_handoff_forms() {
        let plain: Handoff = serde_json::from_str(r#""review""#).unwrap();
        assert_eq!(plain.target(), "review");

        let described: Handoff =
            serde_json::from_str(r#"{"target": "review", "description": "send for review"}"#).unwrap();
        assert_eq!(described.target(), "review");
    }

    #[test]
    fn test_model_assignment_forms() {
        let list: ModelAssignment = serde_json::from_str(r#"["m1", "m2"]"#).unwrap();
        assert!(matches!(list, ModelAssignment::List(ref v) if v.len() == 2));

        let map: ModelAssignment = serde_json::from_str(r#"{"m1": {"factor": 2}, "m2": {}}"#).unwrap();
        match map {
            ModelAssignment::Map(m) => {
                assert_eq!(m["m1"].factor, 2);
                assert_eq!(m["m2"].factor, 1);
            }
            ModelAssignment::List(_) => panic!("expected map"),
        }
    }

    #[test]
    fn test_context_source_forms() {
        let name: ContextSource = serde_json::from_str(r#""draft""#).unwrap();
        assert_eq!(name.phase(), "draft");

        let config: ContextSource = serde_json::from_str(
            r#"{"phase": "draft", "include": ["output", "images"], "images": "last"}"#,
        )
        .unwrap();
        match config {
            ContextSource::Config(c) => {
                assert_eq!(c.phase, "draft");
                assert_eq!(c.include.len(), 2);
                assert_eq!(c.images, ImageFilter::Last);
            }
            ContextSource::Name(_) => panic!("expected config"),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_handoff() {
        let config = CascadeConfig {
            cascade_id: "broken".to_string(),
            phases: vec![PhaseConfig {
                name: "a".to_string(),
                instructions: "do".to_string(),
                handoffs: vec![Handoff::Name("missing".to_string())],
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("unknown phase"));
    }

    #[test]
    fn test_validate_rejects_empty_phase() {
        let config = CascadeConfig {
            cascade_id: "broken".to_string(),
            phases: vec![PhaseConfig {
                name: "a".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deterministic_phase() {
        let phase = PhaseConfig {
            name: "fetch".to_string(),
            tool: Some("http_get".to_string()),
            tool_inputs: Some(serde_json::json!({"url": "https://example.com"})),
            ..Default::default()
        };
        assert!(phase.is_deterministic());
    }

    #[test]
    fn test_soundings_defaults() {
        let soundings: SoundingsConfig = serde_json::from_str(r#"{"factor": 3}"#).unwrap();
        assert_eq!(soundings.factor, 3);
        assert_eq!(soundings.max_parallel, 3);
        assert_eq!(soundings.mode, SoundingMode::Evaluate);
        assert_eq!(soundings.evaluator, EvaluatorKind::Llm);
        assert_eq!(soundings.on_timeout, TimeoutFallback::LlmFallback);
    }
}
