use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use blueprint_core::{config::BackendConfig, ContextRefresh, ContextSnapshot};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::store::SharedSyncStore;

/// Fetches a full snapshot of a service's configuration.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    async fn load(&self, service_id: &str) -> Result<ContextSnapshot>;
}

/// Loads `GET {api_base_url}/services/{service_id}/context`.
pub struct HttpSnapshotLoader {
    client: reqwest::Client,
    api_base_url: String,
    auth_token: Option<SecretString>,
    timeout: Duration,
}

impl HttpSnapshotLoader {
    pub fn new(api_base_url: impl Into<String>, auth_token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url: api_base_url.into(),
            auth_token,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_backend(config: &BackendConfig) -> Self {
        Self::new(config.api_base_url.clone(), config.auth_token.clone())
            .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl SnapshotLoader for HttpSnapshotLoader {
    async fn load(&self, service_id: &str) -> Result<ContextSnapshot> {
        let url = format!(
            "{}/services/{}/context",
            self.api_base_url.trim_end_matches('/'),
            service_id
        );
        let mut request = self.client.get(&url).timeout(self.timeout);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to fetch context snapshot from {url}"))?
            .error_for_status()
            .with_context(|| format!("context snapshot request for `{service_id}` failed"))?;

        response
            .json::<ContextSnapshot>()
            .await
            .with_context(|| format!("context snapshot for `{service_id}` is malformed"))
    }
}

/// Replaces the store's snapshot with a freshly loaded one and returns the new
/// version.
pub async fn resync_store(loader: &dyn SnapshotLoader, store: &SharedSyncStore) -> Result<u64> {
    let service_id = store.service_id();
    let snapshot = loader.load(&service_id).await?;
    let version = snapshot.version;
    store.set_context(snapshot);

    info!(
        event_name = "sync.resync.completed",
        service_id = %service_id,
        version,
        "context snapshot resynchronised"
    );
    Ok(version)
}

/// Refresh hook that resynchronises a store, for conflict recovery.
pub struct StoreResync<L> {
    loader: L,
    store: SharedSyncStore,
}

impl<L: SnapshotLoader> StoreResync<L> {
    pub fn new(loader: L, store: SharedSyncStore) -> Self {
        Self { loader, store }
    }
}

#[async_trait]
impl<L: SnapshotLoader> ContextRefresh for StoreResync<L> {
    async fn refresh(&self) -> Result<()> {
        resync_store(&self.loader, &self.store).await.map(|_| ())
    }
}

#[async_trait]
impl<T: SnapshotLoader + ?Sized> SnapshotLoader for Arc<T> {
    async fn load(&self, service_id: &str) -> Result<ContextSnapshot> {
        (**self).load(service_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use blueprint_core::{ContextRefresh, ContextSnapshot, Entity};
    use secrecy::SecretString;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{HttpSnapshotLoader, SnapshotLoader, StoreResync};
    use crate::store::SharedSyncStore;

    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotLoader for CountingLoader {
        async fn load(&self, service_id: &str) -> Result<ContextSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("backend unavailable"));
            }
            let mut snapshot = ContextSnapshot::empty(service_id);
            snapshot.version = 12;
            snapshot.forms.push(Entity::new("form-1"));
            Ok(snapshot)
        }
    }

    #[tokio::test]
    async fn store_resync_replaces_snapshot_on_refresh() {
        let store = SharedSyncStore::for_service("svc-1");
        store.with(|store| store.set_error(Some("stale".to_owned())));
        let refresh = StoreResync::new(
            CountingLoader { calls: AtomicUsize::new(0), fail: false },
            store.clone(),
        );

        refresh.refresh().await.expect("refresh should succeed");

        assert_eq!(store.version(), 12);
        assert_eq!(store.snapshot().forms.len(), 1);
        assert_eq!(store.error(), None);
        assert_eq!(refresh.loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_load_leaves_store_untouched() {
        let store = SharedSyncStore::for_service("svc-1");
        let refresh = StoreResync::new(
            CountingLoader { calls: AtomicUsize::new(0), fail: true },
            store.clone(),
        );

        assert!(refresh.refresh().await.is_err());
        assert_eq!(store.version(), 0);
    }

    #[tokio::test]
    async fn http_loader_fetches_service_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/services/svc-1/context"))
            .and(header("Authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "serviceId": "svc-1",
                "serviceName": "Business licence",
                "roles": [{ "id": "role-1", "name": "Reviewer" }],
                "version": 3,
                "timestamp": "2026-03-01T10:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let loader = HttpSnapshotLoader::new(
            format!("{}/api/v1/", server.uri()),
            Some(SecretString::from("token-1".to_owned())),
        );
        let snapshot = loader.load("svc-1").await.expect("snapshot should load");

        assert_eq!(snapshot.service_name, "Business licence");
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.roles.len(), 1);
    }

    #[tokio::test]
    async fn http_loader_reports_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loader = HttpSnapshotLoader::new(server.uri(), None);
        assert!(loader.load("missing").await.is_err());
    }
}
