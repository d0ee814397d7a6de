//! Failure classification and automatic healing of fallible operations.
//!
//! [`classify_error`] maps a raw [`FailureSignal`] onto the recovery taxonomy;
//! [`RecoveryHandler::heal`] drives an operation through retries according to
//! the classified strategy. Classification is returned, never thrown.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blueprint_core::audit::NoopAuditSink;
use blueprint_core::config::RecoveryConfig;
use blueprint_core::{
    AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink, ContextRefresh,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JITTER_RATIO: f64 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Retryable,
    Conflict,
    UserFixable,
    Fatal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retryable => "retryable",
            Self::Conflict => "conflict",
            Self::UserFixable => "user_fixable",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategy {
    ExponentialBackoff,
    RefreshAndRetry,
    PromptUser,
    Abort,
}

impl HealingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExponentialBackoff => "exponential_backoff",
            Self::RefreshAndRetry => "refresh_and_retry",
            Self::PromptUser => "prompt_user",
            Self::Abort => "abort",
        }
    }
}

/// What a failed operation reported, reduced to the facts classification needs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FailureSignal {
    pub status_code: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl FailureSignal {
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self { status_code: Some(status_code), message: message.into(), ..Self::default() }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<anyhow::Error> for FailureSignal {
    fn from(error: anyhow::Error) -> Self {
        Self::message(format!("{error:#}"))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub strategy: HealingStrategy,
    pub user_message: String,
    pub can_auto_heal: bool,
    pub suggested_action: Option<String>,
    pub technical_details: Option<String>,
    pub status_code: Option<u16>,
}

impl ClassifiedError {
    fn new(
        category: ErrorCategory,
        strategy: HealingStrategy,
        user_message: impl Into<String>,
        signal: &FailureSignal,
    ) -> Self {
        Self {
            category,
            strategy,
            user_message: user_message.into(),
            can_auto_heal: matches!(category, ErrorCategory::Retryable | ErrorCategory::Conflict),
            suggested_action: None,
            technical_details: technical_details(signal),
            status_code: signal.status_code,
        }
    }

    fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = Some(action.into());
        self
    }

    /// Whether the end user should see this classification as an actionable message.
    pub fn is_user_facing(&self) -> bool {
        matches!(self.category, ErrorCategory::UserFixable | ErrorCategory::Fatal)
    }
}

fn technical_details(signal: &FailureSignal) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(status) = signal.status_code {
        parts.push(format!("status={status}"));
    }
    if let Some(code) = signal.code.as_deref() {
        parts.push(format!("code={code}"));
    }
    if !signal.message.is_empty() {
        parts.push(signal.message.clone());
    }
    if let Some(details) = signal.details.as_ref() {
        parts.push(details.to_string());
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

const NETWORK_MARKERS: &[&str] =
    &["econnrefused", "connection refused", "fetch failed", "network", "connection reset"];
const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "abort", "etimedout"];
/// Codes for calls rejected before reaching the service because of their arguments.
const ARGUMENT_ERROR_CODES: &[&str] = &["invalid_arguments", "missing_path_parameter"];

pub fn classify_error(signal: &FailureSignal) -> ClassifiedError {
    use ErrorCategory::{Conflict, Fatal, Retryable, UserFixable};
    use HealingStrategy::{Abort, ExponentialBackoff, PromptUser, RefreshAndRetry};

    match signal.status_code {
        Some(429) => {
            return ClassifiedError::new(
                Retryable,
                ExponentialBackoff,
                "The service is receiving too many requests. Retrying shortly.",
                signal,
            )
        }
        Some(503 | 504) => {
            return ClassifiedError::new(
                Retryable,
                ExponentialBackoff,
                "The service is temporarily unavailable. Retrying shortly.",
                signal,
            )
        }
        Some(409) => {
            return ClassifiedError::new(
                Conflict,
                RefreshAndRetry,
                "The data changed while you were working. Refreshing and trying again.",
                signal,
            )
        }
        Some(400 | 422) => {
            let message = if signal.message.is_empty() {
                "The request contained invalid values.".to_owned()
            } else {
                format!("The request was rejected: {}", signal.message)
            };
            return ClassifiedError::new(UserFixable, PromptUser, message, signal)
                .with_suggested_action(suggested_fix(signal));
        }
        Some(401) => {
            return ClassifiedError::new(
                Fatal,
                Abort,
                "Your session is no longer authorized. Please sign in again.",
                signal,
            )
        }
        Some(403) => {
            return ClassifiedError::new(
                Fatal,
                Abort,
                "You do not have permission to perform this action.",
                signal,
            )
        }
        Some(500) => {
            return ClassifiedError::new(
                Fatal,
                Abort,
                "The service hit an internal error. Please try again later.",
                signal,
            )
        }
        Some(_) | None => {}
    }

    let code = signal.code.as_deref().unwrap_or_default().to_ascii_lowercase();
    if ARGUMENT_ERROR_CODES.contains(&code.as_str()) {
        let message = format!("The tool arguments were invalid: {}", signal.message);
        return ClassifiedError::new(UserFixable, PromptUser, message, signal)
            .with_suggested_action(suggested_fix(signal));
    }

    let message = signal.message.to_ascii_lowercase();
    let mentions = |markers: &[&str]| {
        markers.iter().any(|marker| message.contains(marker) || code.contains(marker))
    };

    if mentions(NETWORK_MARKERS) {
        return ClassifiedError::new(
            Retryable,
            ExponentialBackoff,
            "Could not reach the service. Retrying shortly.",
            signal,
        );
    }
    if mentions(TIMEOUT_MARKERS) {
        return ClassifiedError::new(
            Retryable,
            ExponentialBackoff,
            "The service took too long to respond. Retrying shortly.",
            signal,
        );
    }

    ClassifiedError::new(Fatal, Abort, "An unexpected error occurred.", signal)
}

fn suggested_fix(signal: &FailureSignal) -> String {
    let fields: Vec<String> = signal
        .details
        .as_ref()
        .and_then(Value::as_object)
        .map(|details| details.keys().cloned().collect())
        .unwrap_or_default();

    if fields.is_empty() {
        "Review the values you provided and try again.".to_owned()
    } else {
        format!("Correct the following fields and try again: {}.", fields.join(", "))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealingConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&RecoveryConfig> for HealingConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_retries: config.max_retries,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAttempt {
    pub timestamp: DateTime<Utc>,
    pub strategy: HealingStrategy,
    /// Set once the retry scheduled by this attempt went on to succeed.
    pub success: bool,
    pub attempt_number: u32,
    pub delay_ms: u64,
    pub result: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HealingResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ClassifiedError>,
    pub attempts: Vec<HealingAttempt>,
    pub total_time_ms: u64,
}

impl<T> HealingResult<T> {
    pub fn into_result(self) -> Result<T, ClassifiedError> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(error)) => Err(error),
            (None, None) => {
                Err(classify_error(&FailureSignal::message("operation produced no result")))
            }
        }
    }
}

pub type AttemptObserver = Arc<dyn Fn(&HealingAttempt) + Send + Sync>;

pub struct RecoveryHandler {
    config: HealingConfig,
    observer: Option<AttemptObserver>,
    audit: Arc<dyn AuditSink>,
}

impl RecoveryHandler {
    pub fn new(config: HealingConfig) -> Self {
        Self { config, observer: None, audit: Arc::new(NoopAuditSink) }
    }

    /// Registers a callback invoked synchronously each time an attempt is recorded.
    pub fn with_attempt_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &HealingConfig {
        &self.config
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.config.max_delay_ms as f64;
        let base = (self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(exponent))
        .min(max);

        let delay = if self.config.jitter && base > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=base * JITTER_RATIO);
            (base + extra).min(max)
        } else {
            base
        };

        Duration::from_millis(delay.max(0.0) as u64)
    }

    pub async fn heal<T, E, F, Fut>(
        &self,
        operation: F,
        refresh: Option<&dyn ContextRefresh>,
    ) -> HealingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FailureSignal>,
    {
        let context =
            AuditContext::new(None, None, Uuid::new_v4().to_string(), "recovery-handler");
        self.heal_with_context(&context, operation, refresh).await
    }

    pub async fn heal_with_context<T, E, F, Fut>(
        &self,
        context: &AuditContext,
        mut operation: F,
        refresh: Option<&dyn ContextRefresh>,
    ) -> HealingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FailureSignal>,
    {
        let started = Instant::now();
        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts: Vec<HealingAttempt> = Vec::new();
        let mut attempt = 1;

        loop {
            let signal: FailureSignal = match operation().await {
                Ok(data) => {
                    if let Some(last) = attempts.last_mut() {
                        last.success = true;
                    }
                    let result = HealingResult {
                        success: true,
                        data: Some(data),
                        error: None,
                        attempts,
                        total_time_ms: elapsed_ms(started),
                    };
                    self.finish(context, &result);
                    return result;
                }
                Err(error) => error.into(),
            };

            let classified = classify_error(&signal);
            let exhausted = attempt >= max_attempts;
            if !self.config.enabled || !classified.can_auto_heal || exhausted {
                let reason = if !self.config.enabled {
                    "healing disabled"
                } else if !classified.can_auto_heal {
                    "not auto-healable"
                } else {
                    "retries exhausted"
                };
                self.record(
                    &mut attempts,
                    context,
                    HealingAttempt {
                        timestamp: Utc::now(),
                        strategy: classified.strategy,
                        success: false,
                        attempt_number: attempt,
                        delay_ms: 0,
                        result: format!("{reason}: {}", signal.message),
                    },
                );
                let result = HealingResult {
                    success: false,
                    data: None,
                    error: Some(classified),
                    attempts,
                    total_time_ms: elapsed_ms(started),
                };
                self.finish(context, &result);
                return result;
            }

            let delay = match classified.strategy {
                HealingStrategy::RefreshAndRetry => {
                    if let Some(refresh) = refresh {
                        if let Err(error) = refresh.refresh().await {
                            warn!(
                                event_name = "recovery.refresh.failed",
                                correlation_id = %context.correlation_id,
                                attempt,
                                error = %error,
                                "context refresh failed; retrying against current state"
                            );
                        }
                    }
                    Duration::from_millis(self.config.initial_delay_ms)
                }
                _ => self.backoff_delay(attempt),
            };
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

            self.record(
                &mut attempts,
                context,
                HealingAttempt {
                    timestamp: Utc::now(),
                    strategy: classified.strategy,
                    success: false,
                    attempt_number: attempt,
                    delay_ms,
                    result: format!("retrying in {delay_ms}ms after: {}", signal.message),
                },
            );
            info!(
                event_name = "recovery.attempt.scheduled",
                correlation_id = %context.correlation_id,
                attempt,
                category = classified.category.as_str(),
                strategy = classified.strategy.as_str(),
                delay_ms,
                "scheduling recovery retry"
            );

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn record(
        &self,
        attempts: &mut Vec<HealingAttempt>,
        context: &AuditContext,
        attempt: HealingAttempt,
    ) {
        if let Some(observer) = self.observer.as_ref() {
            observer(&attempt);
        }
        debug!(
            event_name = "recovery.attempt.recorded",
            correlation_id = %context.correlation_id,
            attempt = attempt.attempt_number,
            strategy = attempt.strategy.as_str(),
            "recovery attempt recorded"
        );
        attempts.push(attempt);
    }

    fn finish<T>(&self, context: &AuditContext, result: &HealingResult<T>) {
        if result.attempts.is_empty() {
            return;
        }

        let (outcome, category) = match result.error.as_ref() {
            None => (AuditOutcome::Success, "healed"),
            Some(error) => (AuditOutcome::Failed, error.category.as_str()),
        };
        if result.success {
            info!(
                event_name = "recovery.outcome",
                correlation_id = %context.correlation_id,
                attempts = result.attempts.len(),
                total_time_ms = result.total_time_ms,
                "operation recovered after retries"
            );
        } else {
            warn!(
                event_name = "recovery.outcome",
                correlation_id = %context.correlation_id,
                attempts = result.attempts.len(),
                category,
                total_time_ms = result.total_time_ms,
                "operation failed after recovery"
            );
        }

        self.audit.emit(
            AuditEvent::new(context, "recovery.outcome", AuditCategory::Recovery, outcome)
                .with_metadata("attempts", result.attempts.len().to_string())
                .with_metadata("category", category)
                .with_metadata("total_time_ms", result.total_time_ms.to_string()),
        );
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use blueprint_core::audit::InMemoryAuditSink;
    use blueprint_core::{AuditOutcome, ContextRefresh};
    use serde_json::json;

    use super::{
        classify_error, ErrorCategory, FailureSignal, HealingAttempt, HealingConfig,
        HealingStrategy, RecoveryHandler,
    };

    fn fast_config(max_retries: u32) -> HealingConfig {
        HealingConfig {
            enabled: true,
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn classification_follows_status_table() {
        let cases = [
            (429, ErrorCategory::Retryable, HealingStrategy::ExponentialBackoff, true),
            (503, ErrorCategory::Retryable, HealingStrategy::ExponentialBackoff, true),
            (504, ErrorCategory::Retryable, HealingStrategy::ExponentialBackoff, true),
            (409, ErrorCategory::Conflict, HealingStrategy::RefreshAndRetry, true),
            (400, ErrorCategory::UserFixable, HealingStrategy::PromptUser, false),
            (422, ErrorCategory::UserFixable, HealingStrategy::PromptUser, false),
            (401, ErrorCategory::Fatal, HealingStrategy::Abort, false),
            (403, ErrorCategory::Fatal, HealingStrategy::Abort, false),
            (500, ErrorCategory::Fatal, HealingStrategy::Abort, false),
            (418, ErrorCategory::Fatal, HealingStrategy::Abort, false),
        ];

        for (status, category, strategy, can_auto_heal) in cases {
            let classified = classify_error(&FailureSignal::http(status, "boom"));
            assert_eq!(classified.category, category, "status {status}");
            assert_eq!(classified.strategy, strategy, "status {status}");
            assert_eq!(classified.can_auto_heal, can_auto_heal, "status {status}");
            assert_eq!(classified.status_code, Some(status));
        }
    }

    #[test]
    fn network_and_timeout_messages_are_retryable() {
        for message in ["connect ECONNREFUSED 127.0.0.1:8000", "TypeError: fetch failed"] {
            let classified = classify_error(&FailureSignal::message(message));
            assert_eq!(classified.category, ErrorCategory::Retryable, "{message}");
        }
        let timeout =
            classify_error(&FailureSignal::message("request aborted").with_code("timeout"));
        assert_eq!(timeout.strategy, HealingStrategy::ExponentialBackoff);

        let unknown = classify_error(&FailureSignal::message("something odd"));
        assert_eq!(unknown.category, ErrorCategory::Fatal);
        assert!(unknown.is_user_facing());
    }

    #[test]
    fn validation_errors_suggest_fields_to_fix() {
        let signal = FailureSignal::http(422, "validation failed")
            .with_details(json!({ "name": "required", "slug": "taken" }));
        let classified = classify_error(&signal);

        assert_eq!(classified.category, ErrorCategory::UserFixable);
        let suggestion = classified.suggested_action.expect("suggested action");
        assert!(suggestion.contains("name"));
        assert!(suggestion.contains("slug"));
        assert!(classified.technical_details.expect("details").contains("status=422"));
    }

    #[test]
    fn argument_errors_are_user_fixable() {
        let signal = FailureSignal::message("tool `deleteForm` requires argument `formId`")
            .with_code("missing_path_parameter")
            .with_details(json!({ "formId": "required" }));
        let classified = classify_error(&signal);

        assert_eq!(classified.category, ErrorCategory::UserFixable);
        assert_eq!(classified.strategy, HealingStrategy::PromptUser);
        assert!(!classified.can_auto_heal);
        assert!(classified.suggested_action.expect("suggested action").contains("formId"));

        let invalid = FailureSignal::message("tool arguments must be an object, got 3")
            .with_code("invalid_arguments");
        assert_eq!(classify_error(&invalid).category, ErrorCategory::UserFixable);
    }

    #[test]
    fn backoff_doubles_and_caps_without_jitter() {
        let handler = RecoveryHandler::new(HealingConfig {
            initial_delay_ms: 100,
            max_delay_ms: 300,
            backoff_multiplier: 2.0,
            jitter: false,
            ..HealingConfig::default()
        });

        assert_eq!(handler.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(handler.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(handler.backoff_delay(3), Duration::from_millis(300));
        assert_eq!(handler.backoff_delay(30), Duration::from_millis(300));

        let uncapped = RecoveryHandler::new(HealingConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: false,
            ..HealingConfig::default()
        });
        assert_eq!(uncapped.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_a_quarter_and_under_the_cap() {
        let handler = RecoveryHandler::new(HealingConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: true,
            ..HealingConfig::default()
        });

        for _ in 0..50 {
            let delay = handler.backoff_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(250));
            assert!(handler.backoff_delay(10) <= Duration::from_millis(1_000));
        }
    }

    #[tokio::test]
    async fn rate_limited_twice_then_succeeds() {
        let calls = AtomicU32::new(0);
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let handler = RecoveryHandler::new(fast_config(2)).with_attempt_observer(Arc::new(
            move |attempt: &HealingAttempt| match sink.lock() {
                Ok(mut seen) => seen.push(attempt.attempt_number),
                Err(poisoned) => poisoned.into_inner().push(attempt.attempt_number),
            },
        ));

        let result = handler
            .heal(
                || {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call < 2 {
                            Err(FailureSignal::http(429, "slow down"))
                        } else {
                            Ok("created")
                        }
                    }
                },
                None,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.data, Some("created"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts.len(), 2);
        assert!(result
            .attempts
            .iter()
            .all(|attempt| attempt.strategy == HealingStrategy::ExponentialBackoff));
        assert_eq!(result.attempts[0].delay_ms, 1);
        assert_eq!(result.attempts[1].delay_ms, 2);
        assert!(result.attempts[1].success);
        assert_eq!(*observed.lock().expect("observer lock"), vec![1, 2]);
    }

    #[tokio::test]
    async fn unauthorized_fails_after_one_call() {
        let calls = AtomicU32::new(0);
        let handler = RecoveryHandler::new(fast_config(3));

        let result = handler
            .heal(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(FailureSignal::http(401, "unauthorized")) }
                },
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempts.len(), 1);
        let error = result.error.expect("classified error");
        assert_eq!(error.category, ErrorCategory::Fatal);
    }

    #[tokio::test]
    async fn retries_never_exceed_max() {
        let calls = AtomicU32::new(0);
        let sink = InMemoryAuditSink::default();
        let handler =
            RecoveryHandler::new(fast_config(2)).with_audit_sink(Arc::new(sink.clone()));

        let result = handler
            .heal(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(anyhow!("fetch failed")) }
                },
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts.len(), 3);
        assert!(result.attempts.iter().all(|attempt| !attempt.success));
        assert_eq!(result.error.map(|error| error.category), Some(ErrorCategory::Retryable));

        let events = sink.events_of_type("recovery.outcome");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Failed);
    }

    #[tokio::test]
    async fn disabled_healing_returns_first_failure() {
        let calls = AtomicU32::new(0);
        let handler =
            RecoveryHandler::new(HealingConfig { enabled: false, ..fast_config(3) });

        let result = handler
            .heal(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(FailureSignal::http(503, "unavailable")) }
                },
                None,
            )
            .await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.attempts[0].result.starts_with("healing disabled"));
    }

    struct CountingRefresh {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ContextRefresh for CountingRefresh {
        async fn refresh(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("snapshot endpoint unavailable"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn conflict_refreshes_context_before_retrying() {
        for fail in [false, true] {
            let refresh = CountingRefresh { calls: AtomicU32::new(0), fail };
            let calls = AtomicU32::new(0);
            let handler = RecoveryHandler::new(fast_config(3));

            let result = handler
                .heal(
                    || {
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if call == 0 {
                                Err(FailureSignal::http(409, "version mismatch"))
                            } else {
                                Ok(call)
                            }
                        }
                    },
                    Some(&refresh as &dyn ContextRefresh),
                )
                .await;

            assert!(result.success, "refresh failure must not stop the retry");
            assert_eq!(refresh.calls.load(Ordering::SeqCst), 1);
            assert_eq!(result.attempts.len(), 1);
            assert_eq!(result.attempts[0].strategy, HealingStrategy::RefreshAndRetry);
            assert_eq!(result.attempts[0].delay_ms, 1);
        }
    }

    #[tokio::test]
    async fn into_result_exposes_classification() {
        let handler = RecoveryHandler::new(fast_config(0));
        let result = handler
            .heal(|| async { Err::<(), _>(FailureSignal::http(400, "bad slug")) }, None)
            .await
            .into_result();

        let error = result.expect_err("user fixable error should surface");
        assert_eq!(error.category, ErrorCategory::UserFixable);
        assert!(error.user_message.contains("bad slug"));
    }
}
