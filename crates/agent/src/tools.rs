use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use blueprint_core::config::BackendConfig;
use blueprint_core::{HttpMethod, ToolDescriptor};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::recovery::FailureSignal;

#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ToolDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.register(descriptor);
        }
        registry
    }

    /// Registers a tool, replacing any previous descriptor with the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.tools.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Per-call facts the executor needs to reach the backend.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub auth_token: Option<SecretString>,
    pub api_base_url: String,
    pub timeout: Duration,
}

impl ExecutionContext {
    pub fn from_backend(backend: &BackendConfig) -> Self {
        Self {
            service_id: None,
            user_id: None,
            auth_token: backend.auth_token.clone(),
            api_base_url: backend.api_base_url.clone(),
            timeout: Duration::from_secs(backend.timeout_secs),
        }
    }

    pub fn for_service(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Clone, Debug, Error, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct ToolFailure {
    pub status_code: Option<u16>,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl ToolFailure {
    pub fn local(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status_code: None, code: code.into(), message: message.into(), details: None }
    }

    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code: Some(status_code),
            code: format!("http_{status_code}"),
            message: message.into(),
            details: None,
        }
    }
}

impl From<ToolFailure> for FailureSignal {
    fn from(failure: ToolFailure) -> Self {
        Self {
            status_code: failure.status_code,
            code: Some(failure.code),
            message: failure.message,
            details: failure.details,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ToolFailure>,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
}

impl ToolExecutionResult {
    pub fn succeeded(data: Value, status_code: Option<u16>, duration_ms: u64) -> Self {
        Self { success: true, data: Some(data), error: None, status_code, duration_ms }
    }

    pub fn failed(failure: ToolFailure, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            status_code: failure.status_code,
            error: Some(failure),
            duration_ms,
        }
    }

    pub fn into_outcome(self) -> Result<Value, ToolFailure> {
        match (self.success, self.data, self.error) {
            (true, data, _) => Ok(data.unwrap_or(Value::Null)),
            (false, _, Some(failure)) => Err(failure),
            (false, _, None) => Err(ToolFailure::local("unknown", "tool failed without detail")),
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        context: &ExecutionContext,
    ) -> ToolExecutionResult;
}

/// Executes tools as REST calls against the configured backend.
#[derive(Clone, Debug, Default)]
pub struct HttpToolExecutor {
    client: reqwest::Client,
}

impl HttpToolExecutor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        context: &ExecutionContext,
    ) -> Result<(Value, u16), ToolFailure> {
        let prepared = prepare_request(tool, args, context)?;

        let mut request = self
            .client
            .request(reqwest_method(tool.method), &prepared.url)
            .timeout(context.timeout)
            .header("Accept", "application/json");
        if let Some(token) = context.auth_token.as_ref() {
            request = request.bearer_auth(token.expose_secret());
        }
        if !prepared.query.is_empty() {
            request = request.query(&prepared.query);
        }
        if let Some(body) = prepared.body.as_ref() {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|error| transport_failure(&error, context))?;
        let status = response.status();
        let text = response.text().await.map_err(|error| transport_failure(&error, context))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            Ok((body, status.as_u16()))
        } else {
            Err(http_failure(status, body))
        }
    }
}

#[async_trait]
impl ToolExecutor for HttpToolExecutor {
    async fn execute(
        &self,
        tool: &ToolDescriptor,
        args: &Value,
        context: &ExecutionContext,
    ) -> ToolExecutionResult {
        let started = Instant::now();
        let outcome = self.send(tool, args, context).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok((data, status)) => {
                debug!(
                    event_name = "agent.tool.executed",
                    tool = %tool.name,
                    service_id = context.service_id.as_deref().unwrap_or("unknown"),
                    status,
                    duration_ms,
                    "tool call succeeded"
                );
                ToolExecutionResult::succeeded(data, Some(status), duration_ms)
            }
            Err(failure) => {
                warn!(
                    event_name = "agent.tool.failed",
                    tool = %tool.name,
                    service_id = context.service_id.as_deref().unwrap_or("unknown"),
                    status = failure.status_code,
                    code = %failure.code,
                    duration_ms,
                    "tool call failed"
                );
                ToolExecutionResult::failed(failure, duration_ms)
            }
        }
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

fn transport_failure(error: &reqwest::Error, context: &ExecutionContext) -> ToolFailure {
    if error.is_timeout() {
        ToolFailure::local(
            "timeout",
            format!("request timed out after {}s", context.timeout.as_secs()),
        )
    } else if error.is_connect() {
        ToolFailure::local("network", format!("connection refused: {error}"))
    } else {
        ToolFailure::local("network", format!("fetch failed: {error}"))
    }
}

fn http_failure(status: reqwest::StatusCode, body: Value) -> ToolFailure {
    let reason = status.canonical_reason().unwrap_or("request failed");
    let mut failure = ToolFailure::http(status.as_u16(), reason);

    match body {
        Value::Object(mut fields) => {
            if let Some(code) = fields.get("code").and_then(Value::as_str) {
                failure.code = code.to_owned();
            }
            if let Some(message) = ["message", "detail", "error"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(Value::as_str))
            {
                failure.message = message.to_owned();
            }
            failure.details = fields.remove("details").or(Some(Value::Object(fields)));
        }
        Value::String(text) if !text.is_empty() => failure.message = text,
        _ => {}
    }

    failure
}

#[derive(Clone, Debug, PartialEq)]
struct PreparedRequest {
    url: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

/// Fills `{param}` placeholders from `args` (falling back to the context's
/// service id for `{serviceId}`) and routes the remaining arguments into the
/// query string or JSON body depending on the method.
fn prepare_request(
    tool: &ToolDescriptor,
    args: &Value,
    context: &ExecutionContext,
) -> Result<PreparedRequest, ToolFailure> {
    let mut remaining = match args {
        Value::Object(fields) => fields.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(ToolFailure::local(
                "invalid_arguments",
                format!("tool arguments must be an object, got {other}"),
            ))
        }
    };

    let mut path = String::with_capacity(tool.path.len());
    let mut rest = tool.path.as_str();
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|offset| open + offset) else {
            break;
        };
        path.push_str(&rest[..open]);
        let name = &rest[open + 1..close];

        let value = match remaining.remove(name) {
            Some(value) => scalar_text(&value),
            None if name == "serviceId" => context.service_id.clone(),
            None => None,
        };
        let Some(value) = value else {
            let mut failure = ToolFailure::local(
                "missing_path_parameter",
                format!("tool `{}` requires argument `{name}`", tool.name),
            );
            failure.details = Some(json!({ (name): "required" }));
            return Err(failure);
        };
        path.push_str(&encode_segment(&value));
        rest = &rest[close + 1..];
    }
    path.push_str(rest);

    let base = context.api_base_url.trim_end_matches('/');
    let url =
        if path.starts_with('/') { format!("{base}{path}") } else { format!("{base}/{path}") };

    if tool.method.uses_query() {
        let query = remaining
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let text = scalar_text(&value).unwrap_or_else(|| value.to_string());
                (key, text)
            })
            .collect();
        Ok(PreparedRequest { url, query, body: None })
    } else {
        Ok(PreparedRequest { url, query: Vec::new(), body: Some(Value::Object(remaining)) })
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "%{byte:02X}");
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use blueprint_core::{HttpMethod, ToolDescriptor};
    use serde_json::json;

    use super::{
        http_failure, prepare_request, ExecutionContext, ToolExecutionResult, ToolFailure,
        ToolRegistry,
    };
    use crate::recovery::{classify_error, ErrorCategory, FailureSignal};

    fn context() -> ExecutionContext {
        ExecutionContext {
            service_id: Some("svc-1".to_owned()),
            user_id: Some("u-1".to_owned()),
            auth_token: None,
            api_base_url: "http://backend.test/api/v1/".to_owned(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn registry_replaces_by_name_and_lists_sorted() {
        let mut registry = ToolRegistry::from_descriptors([
            ToolDescriptor::read("listForms", "/services/{serviceId}/forms"),
            ToolDescriptor::new("createRole", HttpMethod::Post, "/services/{id}/roles", true),
        ]);
        registry.register(ToolDescriptor::read("createRole", "/replaced"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["createRole", "listForms"]);
        assert_eq!(registry.get("createRole").map(|tool| tool.path.as_str()), Some("/replaced"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn get_requests_fill_path_and_move_rest_to_query() {
        let tool =
            ToolDescriptor::read("listFields", "/services/{serviceId}/forms/{formId}/fields");
        let prepared = prepare_request(
            &tool,
            &json!({ "formId": "form 1", "limit": 20, "archived": false, "cursor": null }),
            &context(),
        )
        .expect("request should prepare");

        assert_eq!(prepared.url, "http://backend.test/api/v1/services/svc-1/forms/form%201/fields");
        let mut query = prepared.query.clone();
        query.sort();
        assert_eq!(
            query,
            vec![
                ("archived".to_owned(), "false".to_owned()),
                ("limit".to_owned(), "20".to_owned())
            ]
        );
        assert!(prepared.body.is_none());
    }

    #[test]
    fn write_requests_send_remaining_args_as_json() {
        let tool = ToolDescriptor::new(
            "updateRole",
            HttpMethod::Patch,
            "/services/{serviceId}/roles/{id}",
            true,
        );
        let prepared = prepare_request(
            &tool,
            &json!({ "serviceId": "svc-9", "id": 42, "name": "Reviewer" }),
            &context(),
        )
        .expect("request should prepare");

        assert_eq!(prepared.url, "http://backend.test/api/v1/services/svc-9/roles/42");
        assert_eq!(prepared.body, Some(json!({ "name": "Reviewer" })));
    }

    #[test]
    fn missing_path_parameter_asks_the_caller_for_the_argument() {
        let tool = ToolDescriptor::read("getForm", "/forms/{formId}");
        let failure = prepare_request(&tool, &json!({}), &context()).expect_err("formId missing");

        assert_eq!(failure.code, "missing_path_parameter");
        assert_eq!(failure.status_code, None);
        assert_eq!(failure.details, Some(json!({ "formId": "required" })));
        let classified = classify_error(&FailureSignal::from(failure));
        assert_eq!(classified.category, ErrorCategory::UserFixable);
        assert!(classified.suggested_action.unwrap_or_default().contains("formId"));
    }

    #[test]
    fn error_bodies_feed_the_classifier() {
        let failure = http_failure(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            json!({
                "code": "validation_error",
                "message": "name is required",
                "details": { "name": "required" }
            }),
        );
        assert_eq!(failure.code, "validation_error");
        assert_eq!(failure.message, "name is required");
        assert_eq!(failure.details, Some(json!({ "name": "required" })));

        let classified = classify_error(&FailureSignal::from(failure));
        assert_eq!(classified.category, ErrorCategory::UserFixable);
        assert!(classified.suggested_action.unwrap_or_default().contains("name"));

        let conflict = http_failure(reqwest::StatusCode::CONFLICT, json!("stale version"));
        assert_eq!(conflict.message, "stale version");
        let classified = classify_error(&FailureSignal::from(conflict));
        assert_eq!(classified.category, ErrorCategory::Conflict);
    }

    #[test]
    fn timeouts_and_network_failures_are_retryable() {
        for failure in [
            ToolFailure::local("timeout", "request timed out after 30s"),
            ToolFailure::local("network", "connection refused: tcp connect error"),
        ] {
            let classified = classify_error(&FailureSignal::from(failure));
            assert_eq!(classified.category, ErrorCategory::Retryable);
        }
    }

    #[test]
    fn execution_result_converts_to_outcome() {
        let ok = ToolExecutionResult::succeeded(json!({ "id": 1 }), Some(200), 12);
        assert_eq!(ok.into_outcome(), Ok(json!({ "id": 1 })));

        let failed = ToolExecutionResult::failed(ToolFailure::http(503, "unavailable"), 40);
        assert_eq!(failed.status_code, Some(503));
        let outcome = failed.into_outcome().map_err(|failure| failure.code);
        assert_eq!(outcome, Err("http_503".to_owned()));
    }
}
