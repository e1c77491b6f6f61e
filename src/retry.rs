//! Retry-with-relogin strategies wrapped around resource lookups.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::document::ClusterUri;
use crate::error::LookupError;
use crate::services::Server;

pub type LookupResult = Result<Option<Server>, LookupError>;

/// A lookup that can be issued more than once.
pub type LookupCall<'a> = dyn Fn() -> BoxFuture<'a, LookupResult> + Send + Sync + 'a;

#[async_trait]
pub trait RetryWithRelogin: Send + Sync {
    async fn run<'a>(&self, cluster_uri: &ClusterUri, call: &LookupCall<'a>) -> LookupResult;
}

/// Issues the call once.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetry;

#[async_trait]
impl RetryWithRelogin for NoRetry {
    async fn run<'a>(&self, _cluster_uri: &ClusterUri, call: &LookupCall<'a>) -> LookupResult {
        call().await
    }
}

/// Refreshes cluster credentials, typically by prompting the user to log in.
#[async_trait]
pub trait Relogin: Send + Sync {
    async fn relogin(&self, cluster_uri: &ClusterUri) -> Result<(), LookupError>;
}

/// Retries once, after a relogin, when the first call fails on expired credentials.
pub struct ReloginOnExpiry<R> {
    relogin: R,
}

impl<R: Relogin> ReloginOnExpiry<R> {
    pub fn new(relogin: R) -> Self {
        Self { relogin }
    }
}

#[async_trait]
impl<R: Relogin> RetryWithRelogin for ReloginOnExpiry<R> {
    async fn run<'a>(&self, cluster_uri: &ClusterUri, call: &LookupCall<'a>) -> LookupResult {
        match call().await {
            Err(LookupError::CredentialsExpired) => {
                info!(cluster = %cluster_uri, "credentials expired, retrying lookup after relogin");
                self.relogin.relogin(cluster_uri).await?;
                call().await
            }
            other => other,
        }
    }
}
