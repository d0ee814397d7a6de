use anyhow::Result;
use async_trait::async_trait;

/// Re-fetches whatever remote state an operation depends on so that a retry
/// after a conflict runs against fresh data.
#[async_trait]
pub trait ContextRefresh: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// Refresh that does nothing; conflicts are then retried against unchanged state.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopContextRefresh;

#[async_trait]
impl ContextRefresh for NoopContextRefresh {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}
