use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use blueprint_agent::AgentRuntime;
use blueprint_realtime::TransportClient;
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::bootstrap::Application;

#[derive(Clone)]
pub struct HealthState {
    runtime: Arc<AgentRuntime>,
    realtime: Option<Arc<TransportClient>>,
}

impl HealthState {
    pub fn new(runtime: Arc<AgentRuntime>, realtime: Option<Arc<TransportClient>>) -> Self {
        Self { runtime, realtime }
    }

    pub fn from_app(app: &Application) -> Self {
        Self::new(
            app.agent_runtime.clone(),
            app.realtime.as_ref().map(|parts| parts.client.clone()),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PolicyHealth {
    pub version: String,
    pub rules: usize,
    pub enabled_rules: usize,
    pub fail_open_conditions: u64,
    pub failed_transforms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RealtimeHealth {
    pub status: &'static str,
    pub state: &'static str,
    pub snapshot_version: u64,
    pub reconnect_attempts: u32,
    pub resync_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub policy: PolicyHealth,
    pub realtime: RealtimeHealth,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let summary = state.runtime.policy_summary();
    let policy = PolicyHealth {
        version: summary.version,
        rules: summary.rule_count,
        enabled_rules: summary.enabled_rule_count,
        fail_open_conditions: summary.metrics.fail_open_conditions,
        failed_transforms: summary.metrics.failed_transforms,
    };

    let realtime = state.realtime.as_deref().map(realtime_check).unwrap_or(RealtimeHealth {
        status: "disabled",
        state: "disconnected",
        snapshot_version: 0,
        reconnect_attempts: 0,
        resync_required: false,
        detail: None,
    });
    let ready = realtime.status != "degraded";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: "blueprint-server",
        policy,
        realtime,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn realtime_check(client: &TransportClient) -> RealtimeHealth {
    let status = client.status();
    let (snapshot_version, resync_required) =
        client.store().with(|store| (store.version(), store.resync_required()));

    RealtimeHealth {
        status: if status.is_terminal_error() { "degraded" } else { "ready" },
        state: status.state.as_str(),
        snapshot_version,
        reconnect_attempts: status.reconnect_attempts,
        resync_required,
        detail: status.error,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{extract::State, http::StatusCode, Json};
    use blueprint_core::config::AppConfig;
    use blueprint_realtime::{
        loopback, DisconnectReason, Handshake, LoopbackTransport, ReconnectPolicy, SharedSyncStore,
        TransportClient,
    };

    use crate::bootstrap::bootstrap_with_config;
    use crate::health::{health, HealthState};

    fn client(transport: LoopbackTransport) -> Arc<TransportClient> {
        Arc::new(TransportClient::new(
            Arc::new(transport),
            Handshake::new("memory://health"),
            SharedSyncStore::for_service("svc-1"),
            ReconnectPolicy { max_reconnect_attempts: 0, initial_delay_ms: 1, max_delay_ms: 1 },
        ))
    }

    #[tokio::test]
    async fn health_is_ready_with_realtime_disabled() {
        let app = bootstrap_with_config(AppConfig::default()).expect("bootstrap");

        let (status, Json(payload)) = health(State(HealthState::from_app(&app))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.realtime.status, "disabled");
        assert_eq!(payload.policy.version, "1.0");
        assert_eq!(payload.policy.rules, 5);
    }

    #[tokio::test]
    async fn health_is_ready_before_the_first_connection() {
        let app = bootstrap_with_config(AppConfig::default()).expect("bootstrap");
        let (transport, _peer) = loopback();
        let state = HealthState::new(app.agent_runtime.clone(), Some(client(transport)));

        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.realtime.status, "ready");
        assert_eq!(payload.realtime.state, "disconnected");
        assert_eq!(payload.realtime.detail, None);
    }

    #[tokio::test]
    async fn health_degrades_after_a_server_disconnect() {
        let app = bootstrap_with_config(AppConfig::default()).expect("bootstrap");
        let (transport, peer) = loopback();
        let client = client(transport);
        peer.disconnect(DisconnectReason::ServerInitiated);

        let final_status = client.run().await;
        assert!(final_status.is_terminal_error());

        let state = HealthState::new(app.agent_runtime.clone(), Some(client));
        let (status, Json(payload)) = health(State(state)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.realtime.status, "degraded");
        assert_eq!(payload.realtime.detail.as_deref(), Some("server disconnected"));
    }
}
