//! Resolves a typed `login@host` into a concrete server target.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::document::{DocumentPatch, LoginHostDocument, SessionDocument, SshDocument};
use crate::error::LookupError;
use crate::retry::RetryWithRelogin;
use crate::services::ResourceLookup;

/// Splits `login@host` on its last `@`, so logins that contain `@` survive.
///
/// An empty login (`"@host"`) counts as no login.
pub fn parse_login_host(raw: &str) -> (Option<String>, &str) {
    match raw.rsplit_once('@') {
        Some((login, host)) if !login.is_empty() => (Some(login.to_string()), host),
        Some((_, host)) => (None, host),
        None => (None, raw),
    }
}

pub struct HostResolver {
    lookup: Arc<dyn ResourceLookup>,
    retry: Arc<dyn RetryWithRelogin>,
}

impl HostResolver {
    pub fn new(lookup: Arc<dyn ResourceLookup>, retry: Arc<dyn RetryWithRelogin>) -> Self {
        Self { lookup, retry }
    }

    /// Resolves `doc` and records the result on `document` with a single update.
    ///
    /// Hosts that match no server, or more than one, are used verbatim as the server id.
    /// Any other lookup failure is returned.
    pub async fn resolve(
        &self,
        document: &SessionDocument,
        doc: LoginHostDocument,
    ) -> Result<SshDocument, LookupError> {
        let (login, host) = parse_login_host(&doc.login_host);
        let cluster_uri = doc.cluster_uri();

        let lookup = self.lookup.as_ref();
        let cluster = &cluster_uri;
        let call = move || lookup.get_server_by_hostname(cluster, host);

        let server = match self.retry.run(&cluster_uri, &call).await {
            Ok(server) => server,
            Err(LookupError::AmbiguousHostname { hostname }) => {
                warn!(
                    uri = %doc.uri,
                    %hostname,
                    "hostname matches several servers, connecting by literal server id"
                );
                None
            }
            Err(err) => return Err(err),
        };

        let (server_id, server_uri) = match server {
            Some(server) => (server.name, server.uri),
            None => {
                debug!(uri = %doc.uri, host, "no server found by hostname, using host as server id");
                (host.to_string(), cluster_uri.server_uri(host))
            }
        };

        let title = match &login {
            Some(login) => format!("{login}@{host}"),
            None => host.to_string(),
        };

        let resolved = SshDocument {
            uri: doc.uri,
            login,
            server_id,
            server_uri,
            root_cluster_id: doc.root_cluster_id,
            leaf_cluster_id: doc.leaf_cluster_id,
            title,
            status: doc.status,
        };

        info!(uri = %resolved.uri, server_uri = %resolved.server_uri, "resolved ssh target");
        document.update(DocumentPatch::resolved(&resolved));
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::document::{ClusterUri, Document, DocumentStatus, DocumentUri};
    use crate::retry::NoRetry;
    use crate::services::{DocumentStore, InMemoryDocumentStore, Server};

    struct StaticLookup {
        result: Result<Option<Server>, LookupError>,
        queries: Mutex<Vec<(String, String)>>,
    }

    impl StaticLookup {
        fn new(result: Result<Option<Server>, LookupError>) -> Self {
            Self {
                result,
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceLookup for StaticLookup {
        async fn get_server_by_hostname(
            &self,
            cluster_uri: &ClusterUri,
            hostname: &str,
        ) -> Result<Option<Server>, LookupError> {
            self.queries
                .lock()
                .unwrap()
                .push((cluster_uri.to_string(), hostname.to_string()));
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryDocumentStore,
        updates: Mutex<usize>,
    }

    impl DocumentStore for CountingStore {
        fn update(&self, uri: &DocumentUri, patch: DocumentPatch) {
            *self.updates.lock().unwrap() += 1;
            self.inner.update(uri, patch);
        }

        fn close(&self, uri: &DocumentUri) {
            self.inner.close(uri);
        }
    }

    fn login_host_doc(login_host: &str) -> LoginHostDocument {
        LoginHostDocument {
            uri: DocumentUri::from("/docs/ssh"),
            login_host: login_host.to_string(),
            root_cluster_id: "prod".to_string(),
            leaf_cluster_id: None,
            status: DocumentStatus::Connecting,
            title: String::new(),
        }
    }

    fn webserver() -> Server {
        Server {
            uri: "/clusters/prod/servers/4f1c".to_string(),
            name: "4f1c".to_string(),
            hostname: "webserver1".to_string(),
        }
    }

    async fn resolve_with(
        lookup: StaticLookup,
        login_host: &str,
    ) -> (Result<SshDocument, LookupError>, Arc<CountingStore>, Arc<StaticLookup>) {
        let store = Arc::new(CountingStore::default());
        let doc = login_host_doc(login_host);
        store.inner.add(Document::SshLoginHost(doc.clone()));
        let document = SessionDocument::new(Document::SshLoginHost(doc.clone()), store.clone());
        let lookup = Arc::new(lookup);
        let resolver = HostResolver::new(lookup.clone(), Arc::new(NoRetry));
        let result = resolver.resolve(&document, doc).await;
        (result, store, lookup)
    }

    #[test]
    fn last_at_separates_host_from_login() {
        assert_eq!(parse_login_host("a@b@c"), (Some("a@b".to_string()), "c"));
        assert_eq!(parse_login_host("root@webserver1"), (Some("root".to_string()), "webserver1"));
    }

    #[test]
    fn bare_host_has_no_login() {
        assert_eq!(parse_login_host("host"), (None, "host"));
        assert_eq!(parse_login_host("@host"), (None, "host"));
    }

    #[tokio::test]
    async fn found_server_supplies_id_and_uri() {
        let (result, store, lookup) =
            resolve_with(StaticLookup::new(Ok(Some(webserver()))), "root@webserver1").await;

        let resolved = result.unwrap();
        assert_eq!(resolved.login.as_deref(), Some("root"));
        assert_eq!(resolved.server_id, "4f1c");
        assert_eq!(resolved.server_uri, "/clusters/prod/servers/4f1c");
        assert_eq!(resolved.title, "root@webserver1");
        assert_eq!(
            lookup.queries.lock().unwrap().as_slice(),
            [("/clusters/prod".to_string(), "webserver1".to_string())]
        );

        assert_eq!(*store.updates.lock().unwrap(), 1);
        let stored = store.inner.get(&DocumentUri::from("/docs/ssh")).unwrap();
        assert_eq!(stored, Document::Ssh(resolved));
        assert!(!serde_json::to_value(&stored).unwrap().as_object().unwrap().contains_key("loginHost"));
    }

    #[tokio::test]
    async fn ambiguous_hostname_falls_back_to_literal_id() {
        let ambiguous = Err(LookupError::AmbiguousHostname {
            hostname: "webserver1".to_string(),
        });
        let (result, store, _) = resolve_with(StaticLookup::new(ambiguous), "root@webserver1").await;

        let resolved = result.unwrap();
        assert_eq!(resolved.login.as_deref(), Some("root"));
        assert_eq!(resolved.server_id, "webserver1");
        assert_eq!(resolved.server_uri, "/clusters/prod/servers/webserver1");
        assert_eq!(resolved.title, "root@webserver1");
        assert_eq!(*store.updates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn missing_server_falls_back_to_literal_id() {
        let (result, _, _) = resolve_with(StaticLookup::new(Ok(None)), "db-7").await;

        let resolved = result.unwrap();
        assert_eq!(resolved.login, None);
        assert_eq!(resolved.server_id, "db-7");
        assert_eq!(resolved.title, "db-7");
    }

    #[tokio::test]
    async fn other_lookup_errors_propagate_without_updating() {
        let failure = Err(LookupError::Service("connection refused".to_string()));
        let (result, store, _) = resolve_with(StaticLookup::new(failure), "root@webserver1").await;

        assert_eq!(result, Err(LookupError::Service("connection refused".to_string())));
        assert_eq!(*store.updates.lock().unwrap(), 0);
        let stored = store.inner.get(&DocumentUri::from("/docs/ssh")).unwrap();
        assert!(matches!(stored, Document::SshLoginHost(_)));
    }
}
