use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blueprint_core::{AuditContext, ContextRefresh};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::policy::{
    EvaluationContext, PolicyDecision, PolicyEngine, PolicyError, PolicyMetricsSnapshot,
    PolicyRule, SessionContext,
};
use crate::recovery::{ClassifiedError, HealingAttempt, RecoveryHandler};
use crate::tools::{ExecutionContext, ToolExecutor, ToolRegistry};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum InvocationOutcome {
    Blocked { message: String },
    NeedsConfirmation { message: String },
    Completed { data: Value },
    Failed { error: ClassifiedError },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToolInvocation {
    pub decision: PolicyDecision,
    pub outcome: InvocationOutcome,
    pub attempts: Vec<HealingAttempt>,
    pub total_time_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicySummary {
    pub version: String,
    pub rule_count: usize,
    pub enabled_rule_count: usize,
    pub metrics: PolicyMetricsSnapshot,
}

/// Runs agent tool calls through the policy gate and the recovery handler.
///
/// The runtime owns its policy engine; rule administration goes through the
/// runtime so every caller observes the same live rule set.
pub struct AgentRuntime {
    policy: RwLock<PolicyEngine>,
    recovery: RecoveryHandler,
    tools: ToolRegistry,
    executor: Arc<dyn ToolExecutor>,
    execution: ExecutionContext,
    refresh: Option<Arc<dyn ContextRefresh>>,
}

impl AgentRuntime {
    pub fn new(
        policy: PolicyEngine,
        recovery: RecoveryHandler,
        tools: ToolRegistry,
        executor: Arc<dyn ToolExecutor>,
        execution: ExecutionContext,
    ) -> Self {
        Self {
            policy: RwLock::new(policy),
            recovery,
            tools,
            executor,
            execution,
            refresh: None,
        }
    }

    /// Context refresh run before retrying a conflicting call.
    pub fn with_context_refresh(mut self, refresh: Arc<dyn ContextRefresh>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn invoke_tool(
        &self,
        name: &str,
        args: Value,
        session: SessionContext,
        confirmed: bool,
    ) -> Result<ToolInvocation, RuntimeError> {
        let tool = self.tools.get(name).ok_or_else(|| RuntimeError::UnknownTool(name.to_owned()))?;

        let context = EvaluationContext::new(tool.clone(), session, args);
        let (decision, confirmations_enabled) = {
            let policy = self.policy_read();
            (policy.evaluate(&context), policy.are_confirmations_enabled())
        };

        if decision.is_blocked() {
            return Ok(gated(decision, |message| InvocationOutcome::Blocked { message }));
        }
        if decision.requires_confirmation() && confirmations_enabled && !confirmed {
            return Ok(gated(decision, |message| InvocationOutcome::NeedsConfirmation { message }));
        }

        let args = decision.effective_args(&context.args);
        let mut execution = self.execution.clone();
        execution.service_id = context.session.service_id.clone().or(execution.service_id);
        execution.user_id = context.session.user_id.clone().or(execution.user_id);

        let audit = AuditContext::new(
            execution.service_id.clone(),
            execution.user_id.clone(),
            context.correlation_id.clone(),
            "agent-runtime",
        );
        info!(
            event_name = "agent.tool.invoking",
            tool = %tool.name,
            correlation_id = %context.correlation_id,
            action = decision.action.as_str(),
            "invoking tool"
        );

        let executor = self.executor.as_ref();
        let (args, execution) = (&args, &execution);
        let healed = self
            .recovery
            .heal_with_context(
                &audit,
                || async move { executor.execute(tool, args, execution).await.into_outcome() },
                self.refresh.as_deref(),
            )
            .await;

        let outcome = match (healed.data, healed.error) {
            (Some(data), _) => InvocationOutcome::Completed { data },
            (None, Some(error)) => InvocationOutcome::Failed { error },
            (None, None) => InvocationOutcome::Completed { data: Value::Null },
        };

        Ok(ToolInvocation {
            decision,
            outcome,
            attempts: healed.attempts,
            total_time_ms: healed.total_time_ms,
        })
    }

    pub fn load_rules(&self, source: &str) -> Result<(), RuntimeError> {
        self.policy_write().load_rules(source)?;
        Ok(())
    }

    pub fn add_rule(&self, rule: PolicyRule) {
        self.policy_write().add_rule(rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.policy_write().remove_rule(name)
    }

    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        self.policy_write().set_rule_enabled(name, enabled)
    }

    pub fn policy_summary(&self) -> PolicySummary {
        let policy = self.policy_read();
        PolicySummary {
            version: policy.version().to_owned(),
            rule_count: policy.rules().len(),
            enabled_rule_count: policy.rules().iter().filter(|rule| rule.enabled).count(),
            metrics: policy.metrics(),
        }
    }

    fn policy_read(&self) -> RwLockReadGuard<'_, PolicyEngine> {
        match self.policy.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn policy_write(&self) -> RwLockWriteGuard<'_, PolicyEngine> {
        match self.policy.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn gated(
    decision: PolicyDecision,
    outcome: impl FnOnce(String) -> InvocationOutcome,
) -> ToolInvocation {
    let message = decision.message.clone().unwrap_or_default();
    ToolInvocation { decision, outcome: outcome(message), attempts: Vec::new(), total_time_ms: 0 }
}
