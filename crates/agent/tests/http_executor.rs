use std::time::Duration;

use blueprint_agent::{
    classify_error, ErrorCategory, ExecutionContext, FailureSignal, HttpToolExecutor,
    ToolExecutor,
};
use blueprint_core::{HttpMethod, ToolDescriptor};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn context(server: &MockServer) -> ExecutionContext {
    ExecutionContext {
        service_id: Some("svc-1".to_owned()),
        user_id: Some("u-1".to_owned()),
        auth_token: Some(SecretString::from("test-token".to_owned())),
        api_base_url: format!("{}/api/v1", server.uri()),
        timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn get_tool_sends_query_and_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/services/svc-1/forms"))
        .and(query_param("limit", "10"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "form-1" }])))
        .expect(1)
        .mount(&server)
        .await;

    let tool = ToolDescriptor::read("listForms", "/services/{serviceId}/forms");
    let result = HttpToolExecutor::default()
        .execute(&tool, &json!({ "limit": 10 }), &context(&server))
        .await;

    assert!(result.success);
    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.data, Some(json!([{ "id": "form-1" }])));
}

#[tokio::test]
async fn post_tool_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/services/svc-1/roles"))
        .and(body_json(json!({ "name": "Reviewer" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "role-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let tool =
        ToolDescriptor::new("createRole", HttpMethod::Post, "/services/{serviceId}/roles", true);
    let result = HttpToolExecutor::default()
        .execute(&tool, &json!({ "name": "Reviewer" }), &context(&server))
        .await;

    assert!(result.success);
    assert_eq!(result.status_code, Some(201));
}

#[tokio::test]
async fn conflict_response_classifies_as_refreshable() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/forms/form-1"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "version_conflict",
            "message": "form was modified by another user"
        })))
        .mount(&server)
        .await;

    let tool = ToolDescriptor::new("updateForm", HttpMethod::Put, "/forms/{formId}", true);
    let result = HttpToolExecutor::default()
        .execute(&tool, &json!({ "formId": "form-1", "name": "Intake" }), &context(&server))
        .await;

    assert!(!result.success);
    let failure = result.error.expect("failure detail");
    assert_eq!(failure.code, "version_conflict");
    assert_eq!(failure.message, "form was modified by another user");
    assert_eq!(
        classify_error(&FailureSignal::from(failure)).category,
        ErrorCategory::Conflict
    );
}

#[tokio::test]
async fn unreachable_backend_is_retryable() {
    let tool = ToolDescriptor::read("listForms", "/forms");
    let context = ExecutionContext {
        service_id: None,
        user_id: None,
        auth_token: None,
        api_base_url: "http://127.0.0.1:9".to_owned(),
        timeout: Duration::from_secs(2),
    };

    let result = HttpToolExecutor::default().execute(&tool, &json!({}), &context).await;

    assert!(!result.success);
    let failure = result.error.expect("failure detail");
    assert_eq!(failure.status_code, None);
    assert_eq!(
        classify_error(&FailureSignal::from(failure)).category,
        ErrorCategory::Retryable
    );
}
