use std::sync::Arc;

use blueprint_agent::{
    policy::PolicyEngine, AgentRuntime, ExecutionContext, HealingConfig, HttpToolExecutor,
    PolicyError, RecoveryHandler, ToolRegistry,
};
use blueprint_core::{
    audit::InMemoryAuditSink,
    config::{AppConfig, ConfigError, LoadOptions},
    AuditSink, EntityEvent,
};
use blueprint_realtime::{
    listener_fn, Handshake, HttpSnapshotLoader, ListenerRegistry, NoopRealtimeTransport,
    RealtimeTransport, ReconnectPolicy, SharedSyncStore, SnapshotLoader, StoreResync,
    TabCoordinator, TabHub, TabTarget, TransportClient, WebSocketTransport,
};
use thiserror::Error;
use tracing::info;

use crate::catalog::default_tools;

pub struct Application {
    pub config: AppConfig,
    pub audit: InMemoryAuditSink,
    pub agent_runtime: Arc<AgentRuntime>,
    pub realtime: Option<RealtimeParts>,
}

/// Realtime pieces built when `realtime.enabled` is set.
pub struct RealtimeParts {
    pub store: SharedSyncStore,
    pub client: Arc<TransportClient>,
    pub tabs: Arc<TabCoordinator>,
    pub loader: Arc<dyn SnapshotLoader>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("policy configuration failed: {0}")]
    Policy(#[from] PolicyError),
}

pub fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config)
}

pub fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );
    config.validate()?;

    let audit = InMemoryAuditSink::default();
    let audit_sink: Arc<dyn AuditSink> = Arc::new(audit.clone());

    let mut policy = PolicyEngine::new()?.with_audit_sink(audit_sink.clone());
    if let Some(path) = &config.policy.path {
        policy.load_rules_from_path(path)?;
    }
    info!(
        event_name = "system.bootstrap.policy_loaded",
        correlation_id = "bootstrap",
        policy_version = %policy.version(),
        rules = policy.rules().len(),
        source = config
            .policy
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "embedded".to_owned()),
        "policy rules loaded"
    );

    let recovery =
        RecoveryHandler::new(HealingConfig::from(&config.recovery)).with_audit_sink(audit_sink);
    let tools = ToolRegistry::from_descriptors(default_tools());
    let mut execution = ExecutionContext::from_backend(&config.backend);

    let realtime = if config.realtime.enabled {
        let service_id = config.realtime.service_id.clone().ok_or_else(|| {
            ConfigError::Validation(
                "realtime.service_id is required when realtime.enabled is true".to_owned(),
            )
        })?;
        execution = execution.for_service(service_id.clone());
        Some(build_realtime(&config, &service_id))
    } else {
        None
    };

    let executor = Arc::new(HttpToolExecutor::default());
    let mut runtime = AgentRuntime::new(policy, recovery, tools, executor, execution);
    if let Some(parts) = &realtime {
        let refresh = StoreResync::new(parts.loader.clone(), parts.store.clone());
        runtime = runtime.with_context_refresh(Arc::new(refresh));
    }

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        tools = runtime.tools().len(),
        realtime_enabled = realtime.is_some(),
        "application bootstrap complete"
    );

    Ok(Application { config, audit, agent_runtime: Arc::new(runtime), realtime })
}

fn build_realtime(config: &AppConfig, service_id: &str) -> RealtimeParts {
    let store = SharedSyncStore::for_service(service_id);
    let target = if config.realtime.multi_tab {
        TabTarget::Shared(TabHub::default())
    } else {
        TabTarget::Isolated
    };
    let tabs = Arc::new(TabCoordinator::for_target(service_id, &target));

    let transport: Arc<dyn RealtimeTransport> = if config.realtime.url.starts_with("memory://") {
        Arc::new(NoopRealtimeTransport)
    } else {
        Arc::new(WebSocketTransport::new())
    };

    let listeners = ListenerRegistry::default();
    listeners.add(listener_fn("change-log", |event: &EntityEvent| {
        info!(
            event_name = "sync.entity.changed",
            event_id = %event.id,
            service_id = %event.service_id,
            entity_type = event.entity_type.as_str(),
            entity_id = %event.entity_id,
            action = event.action.as_str(),
            user_id = %event.user_id,
            "configuration entity changed"
        );
        Ok(())
    }));

    let loader: Arc<dyn SnapshotLoader> =
        Arc::new(HttpSnapshotLoader::from_backend(&config.backend));
    let client = TransportClient::new(
        transport,
        Handshake::from_config(&config.realtime),
        store.clone(),
        ReconnectPolicy::from(&config.realtime),
    )
    .with_listeners(listeners)
    .with_tabs(tabs.clone())
    .with_snapshot_loader(loader.clone());

    RealtimeParts { store, client: Arc::new(client), tabs, loader }
}
