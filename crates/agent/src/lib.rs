//! Agent-side resilience layer.
//!
//! Every tool call the assistant makes passes through two gates:
//! 1. **Policy** (`policy`) - YAML-authored rules decide whether the call is
//!    blocked, needs confirmation, has its arguments rewritten, or carries a warning
//! 2. **Recovery** (`recovery`) - failures are classified and, where safe, healed
//!    by retrying with backoff or refreshing stale context first
//!
//! `tools` maps tool descriptors onto REST calls; `runtime` composes the pieces.
//!
//! The LLM never decides whether a tool call is permitted. Rules do.

pub mod policy;
pub mod recovery;
pub mod runtime;
pub mod tools;

pub use policy::{
    DecisionAction, EvaluationContext, PolicyAction, PolicyConfig, PolicyDecision, PolicyEngine,
    PolicyError, PolicyRule, SessionContext,
};
pub use recovery::{
    classify_error, ClassifiedError, ErrorCategory, FailureSignal, HealingAttempt, HealingConfig,
    HealingResult, HealingStrategy, RecoveryHandler,
};
pub use runtime::{AgentRuntime, InvocationOutcome, PolicySummary, RuntimeError, ToolInvocation};
pub use tools::{
    ExecutionContext, HttpToolExecutor, ToolExecutionResult, ToolExecutor, ToolFailure,
    ToolRegistry,
};
