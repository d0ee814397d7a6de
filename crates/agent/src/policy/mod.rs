//! Rule-based gating of agent tool invocations.
//!
//! A [`PolicyConfig`] is an ordered set of [`PolicyRule`]s plus global
//! [`PolicySettings`]. Rules are authored in YAML and validated up front; every
//! condition and transform is compiled into an [`expr::Expression`] before the
//! config is accepted, so evaluation itself never fails loudly.

pub mod engine;
pub mod expr;

use std::path::PathBuf;

use blueprint_core::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

pub use engine::{PolicyEngine, PolicyMetricsSnapshot};
pub use expr::{Bindings, CompileError, EvalError, Expression};

pub const DEFAULT_RULE_PRIORITY: i64 = 100;
pub const DEFAULT_MAX_SESSION_COST: f64 = 1.0;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy document is not valid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read policy file {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("rule #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("rule `{rule}` has unknown action `{action}`")]
    UnknownAction { rule: String, action: String },
    #[error("rule `{rule}` has an invalid {field} expression: {source}")]
    Expression { rule: String, field: &'static str, source: CompileError },
    #[error("transform rule `{0}` has no transform expression")]
    MissingTransform(String),
    #[error("duplicate rule name `{0}`")]
    DuplicateRule(String),
    #[error("settings.maxSessionCost must be a finite, non-negative number (got {0})")]
    InvalidMaxSessionCost(f64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Block,
    RequireConfirmation,
    Transform,
    Warn,
}

impl PolicyAction {
    /// Resolution order, strongest first.
    pub const PRECEDENCE: [PolicyAction; 4] =
        [Self::Block, Self::RequireConfirmation, Self::Transform, Self::Warn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::RequireConfirmation => "require_confirmation",
            Self::Transform => "transform",
            Self::Warn => "warn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "require_confirmation" => Some(Self::RequireConfirmation),
            "transform" => Some(Self::Transform),
            "warn" => Some(Self::Warn),
            _ => None,
        }
    }

    fn rank(&self) -> usize {
        match self {
            Self::Block => 0,
            Self::RequireConfirmation => 1,
            Self::Transform => 2,
            Self::Warn => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Allow,
    Block,
    RequireConfirmation,
    Transform,
    Warn,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Block => "block",
            Self::RequireConfirmation => "require_confirmation",
            Self::Transform => "transform",
            Self::Warn => "warn",
        }
    }
}

impl From<PolicyAction> for DecisionAction {
    fn from(action: PolicyAction) -> Self {
        match action {
            PolicyAction::Block => Self::Block,
            PolicyAction::RequireConfirmation => Self::RequireConfirmation,
            PolicyAction::Transform => Self::Transform,
            PolicyAction::Warn => Self::Warn,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyRule {
    pub name: String,
    pub condition: Expression,
    pub action: PolicyAction,
    pub message: String,
    pub priority: i64,
    pub enabled: bool,
    pub transform: Option<Expression>,
}

impl PolicyRule {
    pub fn new(
        name: impl Into<String>,
        condition: &str,
        action: PolicyAction,
        message: impl Into<String>,
    ) -> Result<Self, PolicyError> {
        let name = name.into();
        let condition = Expression::compile(condition).map_err(|source| {
            PolicyError::Expression { rule: name.clone(), field: "condition", source }
        })?;
        Ok(Self {
            name,
            condition,
            action,
            message: message.into(),
            priority: DEFAULT_RULE_PRIORITY,
            enabled: true,
            transform: None,
        })
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_transform(mut self, transform: &str) -> Result<Self, PolicyError> {
        let expression = Expression::compile(transform).map_err(|source| {
            PolicyError::Expression { rule: self.name.clone(), field: "transform", source }
        })?;
        self.transform = Some(expression);
        Ok(self)
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn from_definition(index: usize, definition: RuleDefinition) -> Result<Self, PolicyError> {
        let name = required(definition.name, index, "name")?;
        let condition = required(definition.condition, index, "condition")?;
        let action_raw = required(definition.action, index, "action")?;
        let message = required(definition.message, index, "message")?;

        let action = PolicyAction::parse(action_raw.trim())
            .ok_or_else(|| PolicyError::UnknownAction { rule: name.clone(), action: action_raw })?;

        let mut rule = Self::new(name, &condition, action, message)?;
        rule.priority = definition.priority.unwrap_or(DEFAULT_RULE_PRIORITY);
        rule.enabled = definition.enabled.unwrap_or(true);
        if let Some(transform) = definition.transform.as_deref() {
            rule = rule.with_transform(transform)?;
        }
        if rule.action == PolicyAction::Transform && rule.transform.is_none() {
            return Err(PolicyError::MissingTransform(rule.name));
        }

        Ok(rule)
    }
}

fn required(
    value: Option<String>,
    index: usize,
    field: &'static str,
) -> Result<String, PolicyError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PolicyError::MissingField { index, field }),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySettings {
    pub confirmations_enabled: bool,
    pub max_session_cost: f64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self { confirmations_enabled: true, max_session_cost: DEFAULT_MAX_SESSION_COST }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PolicyConfig {
    pub version: String,
    pub rules: Vec<PolicyRule>,
    pub settings: PolicySettings,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { version: "1.0".to_owned(), rules: Vec::new(), settings: PolicySettings::default() }
    }
}

impl PolicyConfig {
    pub fn from_yaml(source: &str) -> Result<Self, PolicyError> {
        let document: PolicyDocument = serde_yaml::from_str(source)?;
        Self::from_document(document)
    }

    pub fn from_document(document: PolicyDocument) -> Result<Self, PolicyError> {
        let mut rules: Vec<PolicyRule> = Vec::with_capacity(document.rules.len());
        for (index, definition) in document.rules.into_iter().enumerate() {
            let rule = PolicyRule::from_definition(index, definition)?;
            if rules.iter().any(|existing| existing.name == rule.name) {
                return Err(PolicyError::DuplicateRule(rule.name));
            }
            rules.push(rule);
        }

        let defaults = PolicySettings::default();
        let max_session_cost =
            document.settings.max_session_cost.unwrap_or(defaults.max_session_cost);
        if !max_session_cost.is_finite() || max_session_cost < 0.0 {
            return Err(PolicyError::InvalidMaxSessionCost(max_session_cost));
        }

        Ok(Self {
            version: document.version.map(version_text).unwrap_or_else(|| "1.0".to_owned()),
            rules,
            settings: PolicySettings {
                confirmations_enabled: document
                    .settings
                    .confirmations_enabled
                    .unwrap_or(defaults.confirmations_enabled),
                max_session_cost,
            },
        })
    }
}

fn version_text(value: serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(text) => text,
        serde_yaml::Value::Number(number) => number.to_string(),
        other => {
            serde_yaml::to_string(&other).map(|text| text.trim().to_owned()).unwrap_or_default()
        }
    }
}

/// Policy document as authored, before validation.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    pub version: Option<serde_yaml::Value>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
    #[serde(default)]
    pub settings: SettingsDefinition,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleDefinition {
    pub name: Option<String>,
    pub condition: Option<String>,
    pub action: Option<String>,
    pub message: Option<String>,
    pub priority: Option<i64>,
    pub enabled: Option<bool>,
    pub transform: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDefinition {
    pub confirmations_enabled: Option<bool>,
    pub max_session_cost: Option<f64>,
}

/// Session-level facts exposed to conditions as `context`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub session_cost: f64,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionContext {
    pub fn for_service(service_id: impl Into<String>) -> Self {
        Self { service_id: Some(service_id.into()), ..Self::default() }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_cost(mut self, session_cost: f64) -> Self {
        self.session_cost = session_cost;
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationContext {
    pub tool: ToolDescriptor,
    pub session: SessionContext,
    pub args: Value,
    pub correlation_id: String,
}

impl EvaluationContext {
    pub fn new(tool: ToolDescriptor, session: SessionContext, args: Value) -> Self {
        Self { tool, session, args, correlation_id: Uuid::new_v4().to_string() }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub action: DecisionAction,
    /// Rule that determined `action`; `None` for `allow`.
    pub rule: Option<String>,
    pub message: Option<String>,
    pub transformed_args: Option<Value>,
    /// Messages of every matching `warn` rule, in evaluation order.
    pub warnings: Vec<String>,
    pub matched_rules: Vec<String>,
    /// Rules whose condition failed to evaluate and were treated as non-matching.
    pub fail_open_rules: Vec<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            action: DecisionAction::Allow,
            rule: None,
            message: None,
            transformed_args: None,
            warnings: Vec::new(),
            matched_rules: Vec::new(),
            fail_open_rules: Vec::new(),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.action == DecisionAction::Block
    }

    pub fn requires_confirmation(&self) -> bool {
        self.action == DecisionAction::RequireConfirmation
    }

    /// Arguments the tool should actually be called with.
    pub fn effective_args(&self, original: &Value) -> Value {
        self.transformed_args.clone().unwrap_or_else(|| original.clone())
    }
}
