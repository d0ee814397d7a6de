use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blueprint_core::audit::NoopAuditSink;
use blueprint_core::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::expr::{Bindings, Expression};
use super::{
    DecisionAction, EvaluationContext, PolicyAction, PolicyConfig, PolicyDecision, PolicyError,
    PolicyRule, PolicySettings,
};

const DEFAULT_POLICY: &str = include_str!("default_policy.yaml");

#[derive(Default)]
struct PolicyMetrics {
    evaluations: AtomicU64,
    blocks: AtomicU64,
    confirmations: AtomicU64,
    transforms: AtomicU64,
    warnings: AtomicU64,
    fail_open_conditions: AtomicU64,
    failed_transforms: AtomicU64,
}

impl PolicyMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PolicyMetricsSnapshot {
        PolicyMetricsSnapshot {
            evaluations: self.evaluations.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            confirmations: self.confirmations.load(Ordering::Relaxed),
            transforms: self.transforms.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            fail_open_conditions: self.fail_open_conditions.load(Ordering::Relaxed),
            failed_transforms: self.failed_transforms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetricsSnapshot {
    pub evaluations: u64,
    pub blocks: u64,
    pub confirmations: u64,
    pub transforms: u64,
    pub warnings: u64,
    pub fail_open_conditions: u64,
    pub failed_transforms: u64,
}

/// Evaluates tool invocations against the active rule set.
///
/// Configuration errors surface from the load operations; `evaluate` itself
/// never fails. A condition that cannot be evaluated is treated as
/// non-matching and a transform that cannot be evaluated leaves the arguments
/// untouched. Both cases are logged at `warn` and counted in [`Self::metrics`].
pub struct PolicyEngine {
    config: PolicyConfig,
    metrics: PolicyMetrics,
    audit: Arc<dyn AuditSink>,
}

impl PolicyEngine {
    /// Builds an engine from the embedded default policy.
    pub fn new() -> Result<Self, PolicyError> {
        Ok(Self::from_config(PolicyConfig::from_yaml(DEFAULT_POLICY)?))
    }

    pub fn from_config(config: PolicyConfig) -> Self {
        Self { config, metrics: PolicyMetrics::default(), audit: Arc::new(NoopAuditSink) }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the active config with the parsed YAML document. The current
    /// config stays in place when the document is invalid.
    pub fn load_rules(&mut self, source: &str) -> Result<(), PolicyError> {
        let config = PolicyConfig::from_yaml(source)?;
        self.load_config(config);
        Ok(())
    }

    pub fn load_rules_from_path(&mut self, path: &Path) -> Result<(), PolicyError> {
        let source = std::fs::read_to_string(path)
            .map_err(|source| PolicyError::Io { path: path.to_path_buf(), source })?;
        self.load_rules(&source)
    }

    pub fn load_config(&mut self, config: PolicyConfig) {
        info!(
            event_name = "policy.config.loaded",
            version = %config.version,
            rule_count = config.rules.len(),
            confirmations_enabled = config.settings.confirmations_enabled,
            max_session_cost = config.settings.max_session_cost,
            "policy configuration loaded"
        );
        self.config = config;
    }

    /// Adds a rule, replacing any existing rule with the same name.
    pub fn add_rule(&mut self, rule: PolicyRule) {
        info!(event_name = "policy.rule.added", rule = %rule.name, "policy rule added");
        match self.config.rules.iter_mut().find(|existing| existing.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.config.rules.push(rule),
        }
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.config.rules.len();
        self.config.rules.retain(|rule| rule.name != name);
        let removed = self.config.rules.len() != before;
        if removed {
            info!(event_name = "policy.rule.removed", rule = %name, "policy rule removed");
        }
        removed
    }

    pub fn set_rule_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let Some(rule) = self.config.rules.iter_mut().find(|rule| rule.name == name) else {
            return false;
        };
        rule.enabled = enabled;
        info!(event_name = "policy.rule.toggled", rule = %name, enabled, "policy rule toggled");
        true
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.config.rules
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.config.settings
    }

    pub fn are_confirmations_enabled(&self) -> bool {
        self.config.settings.confirmations_enabled
    }

    pub fn max_session_cost(&self) -> f64 {
        self.config.settings.max_session_cost
    }

    pub fn metrics(&self) -> PolicyMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn evaluate(&self, context: &EvaluationContext) -> PolicyDecision {
        PolicyMetrics::bump(&self.metrics.evaluations);

        let tool = serde_json::to_value(&context.tool).unwrap_or(Value::Null);
        let session = self.session_bindings(context);
        let bindings = Bindings { tool: &tool, context: &session, args: &context.args };

        let mut active: Vec<&PolicyRule> =
            self.config.rules.iter().filter(|rule| rule.enabled).collect();
        active.sort_by_key(|rule| rule.priority);

        let mut first_by_action: [Option<&PolicyRule>; 4] = [None; 4];
        let mut decision = PolicyDecision::allow();

        for rule in active {
            match rule.condition.is_satisfied(&bindings) {
                Ok(true) => {
                    decision.matched_rules.push(rule.name.clone());
                    if rule.action == PolicyAction::Warn {
                        decision.warnings.push(rule.message.clone());
                    }
                    let slot = &mut first_by_action[rule.action.rank()];
                    if slot.is_none() {
                        *slot = Some(rule);
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    PolicyMetrics::bump(&self.metrics.fail_open_conditions);
                    warn!(
                        event_name = "policy.condition.fail_open",
                        rule = %rule.name,
                        tool = %context.tool.name,
                        correlation_id = %context.correlation_id,
                        condition = %rule.condition.source(),
                        error = %error,
                        "policy condition failed to evaluate; treating rule as non-matching"
                    );
                    decision.fail_open_rules.push(rule.name.clone());
                }
            }
        }

        let winner = PolicyAction::PRECEDENCE
            .iter()
            .find_map(|action| first_by_action[action.rank()]);

        if let Some(rule) = winner {
            decision.action = DecisionAction::from(rule.action);
            decision.rule = Some(rule.name.clone());
            decision.message = Some(rule.message.clone());
            if rule.action == PolicyAction::Transform {
                decision.transformed_args =
                    Some(self.apply_transform(rule, &bindings, context));
            }
        }

        self.record(context, &decision);
        decision
    }

    fn session_bindings(&self, context: &EvaluationContext) -> Value {
        let mut session = serde_json::to_value(&context.session).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut session {
            fields
                .entry("maxSessionCost")
                .or_insert_with(|| Value::from(self.config.settings.max_session_cost));
            fields
                .entry("confirmationsEnabled")
                .or_insert_with(|| Value::Bool(self.config.settings.confirmations_enabled));
        }
        session
    }

    fn apply_transform(
        &self,
        rule: &PolicyRule,
        bindings: &Bindings<'_>,
        context: &EvaluationContext,
    ) -> Value {
        let Some(transform) = rule.transform.as_ref() else {
            return context.args.clone();
        };

        match transform_args(transform, bindings) {
            Ok(args) => args,
            Err(reason) => {
                PolicyMetrics::bump(&self.metrics.failed_transforms);
                warn!(
                    event_name = "policy.transform.failed",
                    rule = %rule.name,
                    tool = %context.tool.name,
                    correlation_id = %context.correlation_id,
                    transform = %transform.source(),
                    error = %reason,
                    "policy transform failed; passing arguments through unchanged"
                );
                context.args.clone()
            }
        }
    }

    fn record(&self, context: &EvaluationContext, decision: &PolicyDecision) {
        let counter = match decision.action {
            DecisionAction::Allow => {
                debug!(
                    event_name = "policy.decision",
                    tool = %context.tool.name,
                    correlation_id = %context.correlation_id,
                    action = decision.action.as_str(),
                    "tool invocation allowed"
                );
                return;
            }
            DecisionAction::Block => &self.metrics.blocks,
            DecisionAction::RequireConfirmation => &self.metrics.confirmations,
            DecisionAction::Transform => &self.metrics.transforms,
            DecisionAction::Warn => &self.metrics.warnings,
        };
        PolicyMetrics::bump(counter);

        let rule = decision.rule.as_deref().unwrap_or("unknown");
        info!(
            event_name = "policy.decision",
            tool = %context.tool.name,
            correlation_id = %context.correlation_id,
            action = decision.action.as_str(),
            rule = %rule,
            matched = decision.matched_rules.len(),
            "tool invocation gated by policy"
        );

        let outcome = if decision.is_blocked() {
            AuditOutcome::Rejected
        } else {
            AuditOutcome::Flagged
        };
        let audit_context = AuditContext::new(
            context.session.service_id.clone(),
            context.session.user_id.clone(),
            context.correlation_id.clone(),
            "policy-engine",
        );
        self.audit.emit(
            AuditEvent::new(&audit_context, "policy.decision", AuditCategory::Policy, outcome)
                .with_metadata("action", decision.action.as_str())
                .with_metadata("rule", rule)
                .with_metadata("tool", context.tool.name.clone())
                .with_metadata("matched_rules", decision.matched_rules.join(",")),
        );
    }
}

fn transform_args(transform: &Expression, bindings: &Bindings<'_>) -> Result<Value, String> {
    match transform.evaluate(bindings) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(other) => Err(format!("transform produced {other} instead of an object")),
        Err(error) => Err(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use blueprint_core::audit::InMemoryAuditSink;
    use blueprint_core::{AuditOutcome, HttpMethod, ToolDescriptor};
    use serde_json::json;

    use crate::policy::{
        DecisionAction, EvaluationContext, PolicyAction, PolicyEngine, PolicyError, PolicyRule,
        SessionContext,
    };

    fn delete_service() -> ToolDescriptor {
        ToolDescriptor::new("deleteService", HttpMethod::Delete, "/services/{serviceId}", true)
    }

    fn list_forms() -> ToolDescriptor {
        ToolDescriptor::read("listForms", "/services/{serviceId}/forms")
    }

    fn context(tool: ToolDescriptor, args: serde_json::Value) -> EvaluationContext {
        EvaluationContext::new(tool, SessionContext::for_service("svc-1").with_user("u-1"), args)
    }

    fn engine_from(yaml: &str) -> PolicyEngine {
        let mut engine = PolicyEngine::new().expect("default policy should load");
        engine.load_rules(yaml).expect("test policy should load");
        engine
    }

    #[test]
    fn block_outranks_confirmation_and_both_are_reported() {
        let engine = engine_from(
            r#"
rules:
  - name: confirm-deletes
    condition: "tool.name.match(/delete/i)"
    action: require_confirmation
    message: confirm
    priority: 10
  - name: block-service-deletes
    condition: "tool.name == 'deleteService'"
    action: block
    message: blocked
    priority: 1
"#,
        );

        let decision = engine.evaluate(&context(delete_service(), json!({})));

        assert_eq!(decision.action, DecisionAction::Block);
        assert_eq!(decision.rule.as_deref(), Some("block-service-deletes"));
        assert_eq!(decision.message.as_deref(), Some("blocked"));
        assert_eq!(decision.matched_rules, vec!["block-service-deletes", "confirm-deletes"]);
    }

    #[test]
    fn regex_condition_requires_confirmation() {
        let engine = engine_from(
            r#"
rules:
  - name: confirm-destructive
    condition: "tool.name.match(/delete|remove/i)"
    action: require_confirmation
    message: Please confirm.
"#,
        );

        let decision = engine.evaluate(&context(delete_service(), json!({})));
        assert_eq!(decision.action, DecisionAction::RequireConfirmation);
        assert!(decision.requires_confirmation());

        let decision = engine.evaluate(&context(list_forms(), json!({})));
        assert_eq!(decision.action, DecisionAction::Allow);
        assert!(decision.matched_rules.is_empty());
    }

    #[test]
    fn invalid_document_fails_and_keeps_previous_rules() {
        let mut engine = PolicyEngine::new().expect("default policy should load");
        let before = engine.rules().len();

        let error = engine
            .load_rules("rules:\n  - name: broken\n    condition: \"true\"\n    action: block\n")
            .expect_err("missing message must fail");

        assert!(matches!(error, PolicyError::MissingField { field: "message", .. }));
        assert_eq!(engine.rules().len(), before);
    }

    #[test]
    fn session_cost_guard_blocks_every_tool() {
        let engine = PolicyEngine::new().expect("default policy should load");
        assert_eq!(engine.max_session_cost(), 1.0);
        assert!(engine.are_confirmations_enabled());

        for tool in [list_forms(), delete_service()] {
            let session = SessionContext::for_service("svc-1").with_cost(1.0);
            let decision = engine.evaluate(&EvaluationContext::new(tool, session, json!({})));
            assert_eq!(decision.action, DecisionAction::Block);
            assert_eq!(decision.rule.as_deref(), Some("session-cost-limit"));
        }

        let session = SessionContext::for_service("svc-1").with_cost(0.99);
        let decision = engine.evaluate(&EvaluationContext::new(list_forms(), session, json!({})));
        assert_eq!(decision.action, DecisionAction::Allow);
    }

    #[test]
    fn caller_supplied_max_session_cost_wins() {
        let engine = PolicyEngine::new().expect("default policy should load");
        let session = SessionContext::for_service("svc-1")
            .with_cost(1.5)
            .with_value("maxSessionCost", json!(5.0));

        let decision = engine.evaluate(&EvaluationContext::new(list_forms(), session, json!({})));
        assert_eq!(decision.action, DecisionAction::Allow);
    }

    #[test]
    fn failing_condition_is_fail_open_and_metered() {
        let engine = engine_from(
            r#"
rules:
  - name: role-check
    condition: "context.user.role == 'viewer'"
    action: block
    message: viewers cannot write
"#,
        );

        let decision = engine.evaluate(&context(delete_service(), json!({})));

        assert_eq!(decision.action, DecisionAction::Allow);
        assert_eq!(decision.fail_open_rules, vec!["role-check"]);
        let metrics = engine.metrics();
        assert_eq!(metrics.evaluations, 1);
        assert_eq!(metrics.fail_open_conditions, 1);
        assert_eq!(metrics.blocks, 0);
    }

    #[test]
    fn transform_replaces_args_and_failures_pass_through() {
        let engine = engine_from(
            r#"
rules:
  - name: cap-limit
    condition: "args.limit > 100"
    action: transform
    transform: "{ ...args, limit: 100 }"
    message: capped
  - name: tag-source
    condition: "args.tag"
    action: transform
    transform: "{ ...args, tag: args.tag.toUpperCase() }"
    message: tagged
    priority: 200
"#,
        );

        let decision =
            engine.evaluate(&context(list_forms(), json!({ "limit": 500, "name": "intake" })));
        assert_eq!(decision.action, DecisionAction::Transform);
        assert_eq!(decision.transformed_args, Some(json!({ "limit": 100, "name": "intake" })));

        // `toUpperCase` on a number fails; the original arguments survive.
        let args = json!({ "tag": 7 });
        let decision = engine.evaluate(&context(list_forms(), args.clone()));
        assert_eq!(decision.action, DecisionAction::Transform);
        assert_eq!(decision.effective_args(&args), args);
        assert_eq!(engine.metrics().failed_transforms, 1);
    }

    #[test]
    fn warnings_collect_every_matching_warn_rule() {
        let engine = engine_from(
            r#"
rules:
  - { name: w1, condition: "tool.mutates", action: warn, message: first, priority: 5 }
  - { name: w2, condition: "true", action: warn, message: second, priority: 6 }
"#,
        );

        let decision = engine.evaluate(&context(delete_service(), json!({})));
        assert_eq!(decision.action, DecisionAction::Warn);
        assert_eq!(decision.rule.as_deref(), Some("w1"));
        assert_eq!(decision.warnings, vec!["first", "second"]);
    }

    #[test]
    fn admin_operations_mutate_live_rules() {
        let mut engine = engine_from("rules: []\n");
        let rule =
            PolicyRule::new("no-deletes", "tool.method == 'DELETE'", PolicyAction::Block, "no")
                .expect("rule should compile")
                .with_priority(1);
        engine.add_rule(rule);
        assert!(engine.evaluate(&context(delete_service(), json!({}))).is_blocked());

        assert!(engine.set_rule_enabled("no-deletes", false));
        assert_eq!(
            engine.evaluate(&context(delete_service(), json!({}))).action,
            DecisionAction::Allow
        );
        assert!(!engine.set_rule_enabled("missing", true));

        let replacement = PolicyRule::new("no-deletes", "true", PolicyAction::Warn, "careful")
            .expect("rule should compile");
        engine.add_rule(replacement);
        assert_eq!(engine.rules().len(), 1);
        assert_eq!(engine.rules()[0].action, PolicyAction::Warn);

        assert!(engine.remove_rule("no-deletes"));
        assert!(!engine.remove_rule("no-deletes"));
        assert!(engine.rules().is_empty());
    }

    #[test]
    fn non_allow_decisions_are_audited() {
        let sink = InMemoryAuditSink::default();
        let mut engine = PolicyEngine::new()
            .expect("default policy should load")
            .with_audit_sink(Arc::new(sink.clone()));
        engine
            .load_rules(
                r#"
rules:
  - { name: stop, condition: "tool.mutates", action: block, message: no }
"#,
            )
            .expect("policy should load");

        engine.evaluate(&context(list_forms(), json!({})));
        engine.evaluate(&context(delete_service(), json!({})).with_correlation_id("req-9"));

        let events = sink.events_of_type("policy.decision");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Rejected);
        assert_eq!(events[0].correlation_id, "req-9");
        assert_eq!(events[0].metadata.get("rule").map(String::as_str), Some("stop"));
    }

    #[test]
    fn rules_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            "version: \"3.1\"\nrules:\n  - {{ name: a, condition: \"true\", action: warn, message: m }}\n"
        )
        .expect("write policy");

        let mut engine = PolicyEngine::new().expect("default policy should load");
        engine.load_rules_from_path(file.path()).expect("policy file should load");
        assert_eq!(engine.version(), "3.1");
        assert_eq!(engine.rules().len(), 1);

        let missing = engine.load_rules_from_path(std::path::Path::new("/nonexistent/policy.yaml"));
        assert!(matches!(missing, Err(PolicyError::Io { .. })));
    }
}
