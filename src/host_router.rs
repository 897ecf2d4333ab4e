//! Host Router — host-to-root resolution and the lifecycle of cached
//! `Application` instances, one per root directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::application::Application;
use crate::config::Config;
use crate::errors::{HandlerName, PowError};
use crate::static_files::StaticFileHandler;

/// External host resolver: a pluggable lookup service the router depends
/// on as a trait object so the lookup itself can be swapped without
/// touching the lifecycle manager.
#[async_trait::async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Option<PathBuf>, PowError>;
    fn apps_root(&self) -> &Path;
}

/// Result of [`HostRouter::route_for_host`]: either a resolved root or the
/// "domain not configured" 503 the pipeline should render directly.
pub enum RouteOutcome {
    Root(PathBuf),
    NotConfigured { suggested_symlink: String },
}

/// Root-to-`Application` and root-to-static-handler caches, backed by
/// `DashMap` for lock-free concurrent access across the many in-flight
/// requests a multi-threaded runtime schedules concurrently.
pub struct HostRouter {
    resolver: Arc<dyn HostResolver>,
    config: Arc<Config>,
    applications_by_root: DashMap<PathBuf, Arc<Application>>,
    static_handlers_by_root: DashMap<PathBuf, Arc<StaticFileHandler>>,
}

impl HostRouter {
    pub fn new(resolver: Arc<dyn HostResolver>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            config,
            applications_by_root: DashMap::new(),
            static_handlers_by_root: DashMap::new(),
        })
    }

    /// Strips any `:port` suffix, asks the resolver for the root, and
    /// reports whether the domain is configured.
    pub async fn route_for_host(&self, host: &str) -> Result<RouteOutcome, PowError> {
        let host = host.split(':').next().unwrap_or(host);
        match self.resolver.resolve(host).await? {
            Some(root) => Ok(RouteOutcome::Root(root)),
            None => {
                let host_prefix = host.split('.').next().unwrap_or(host);
                Ok(RouteOutcome::NotConfigured {
                    suggested_symlink: format!(
                        "{}/{}",
                        self.resolver.apps_root().display(),
                        host_prefix
                    ),
                })
            }
        }
    }

    /// Lazily creates (or returns the cached) `Application` when
    /// `config.ru` exists; evicts and quits the cached `Application`
    /// (fire-and-forget) when it no longer does.
    pub async fn application_for_root(&self, root: &Path) -> Option<Arc<Application>> {
        let config_ru = root.join("config.ru");
        let has_config_ru = tokio::fs::try_exists(&config_ru).await.unwrap_or(false);

        if !has_config_ru {
            if let Some((_, stale)) = self.applications_by_root.remove(root) {
                info!(root = %root.display(), "config.ru disappeared, quitting cached application");
                tokio::spawn(async move { stale.quit().await });
            }
            return None;
        }

        if let Some(existing) = self.applications_by_root.get(root) {
            return Some(existing.clone());
        }

        let app = Application::new(root.to_path_buf(), self.config.clone());
        // Racy insert: keep whichever copy got cached first.
        let app = self
            .applications_by_root
            .entry(root.to_path_buf())
            .or_insert(app)
            .clone();
        Some(app)
    }

    pub fn static_handler_for_root(&self, root: &Path) -> Arc<StaticFileHandler> {
        self.static_handlers_by_root
            .entry(root.to_path_buf())
            .or_insert_with(|| Arc::new(StaticFileHandler::new(root.join("public"))))
            .clone()
    }

    /// Invoked when the listener closes.
    pub async fn close_all(&self) {
        let roots: Vec<PathBuf> = self
            .applications_by_root
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for root in roots {
            if let Some((_, app)) = self.applications_by_root.remove(&root) {
                app.quit().await;
            }
        }
        warn!("host router closed, all applications quit");
    }
}

/// Default filesystem-symlink host resolver: resolves
/// `<apps_root>/<host-prefix>` where `host-prefix` has the configured TLD
/// stripped, following one symlink hop when present.
pub struct SymlinkHostResolver {
    apps_root: PathBuf,
    domain: String,
}

impl SymlinkHostResolver {
    pub fn new(apps_root: PathBuf, domain: String) -> Self {
        Self { apps_root, domain }
    }

    fn host_prefix<'a>(&self, host: &'a str) -> &'a str {
        host.strip_suffix(&format!(".{}", self.domain)).unwrap_or(host)
    }
}

#[async_trait::async_trait]
impl HostResolver for SymlinkHostResolver {
    async fn resolve(&self, host: &str) -> Result<Option<PathBuf>, PowError> {
        let prefix = self.host_prefix(host);
        let candidate = self.apps_root.join(prefix);

        match tokio::fs::symlink_metadata(&candidate).await {
            Ok(meta) if meta.is_symlink() => match tokio::fs::read_link(&candidate).await {
                Ok(target) => {
                    let resolved = if target.is_absolute() {
                        target
                    } else {
                        self.apps_root.join(target)
                    };
                    Ok(Some(resolved))
                }
                Err(e) => Err(PowError::ResolverError(format!(
                    "failed to read symlink {}: {e}",
                    candidate.display()
                ))),
            },
            Ok(_) => Ok(Some(candidate)),
            Err(_) => Ok(None),
        }
    }

    fn apps_root(&self) -> &Path {
        &self.apps_root
    }
}

/// `X-Pow-Handler: NonexistentDomain` body text. Kept alongside the router
/// since it's only ever produced from `RouteOutcome::NotConfigured`.
pub fn not_configured_body(suggested_symlink: &str) -> String {
    format!(
        "<html><body><h1>Domain not configured</h1><p>Create a symlink at <code>{}</code> pointing at your application.</p></body></html>",
        crate::errors::html_escape(suggested_symlink)
    )
}

pub const NOT_CONFIGURED_HANDLER: HandlerName = HandlerName::NonexistentDomain;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn symlink_resolver_returns_none_for_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = SymlinkHostResolver::new(dir.path().to_path_buf(), "dev".to_string());
        let result = resolver.resolve("bogus.dev").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn symlink_resolver_follows_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let app_dir = dir.path().join("foo");
        tokio::fs::create_dir(&app_dir).await.unwrap();

        let resolver = SymlinkHostResolver::new(dir.path().to_path_buf(), "dev".to_string());
        let result = resolver.resolve("foo.dev").await.unwrap();
        assert_eq!(result, Some(app_dir));
    }

    #[tokio::test]
    async fn application_for_root_is_none_without_config_ru() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(SymlinkHostResolver::new(dir.path().to_path_buf(), "dev".to_string()));
        let router = HostRouter::new(resolver, Arc::new(Config::default()));
        assert!(router.application_for_root(dir.path()).await.is_none());
    }

    #[tokio::test]
    async fn application_for_root_caches_the_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("config.ru"), "run MyApp\n")
            .await
            .unwrap();

        let resolver = Arc::new(SymlinkHostResolver::new(dir.path().to_path_buf(), "dev".to_string()));
        let router = HostRouter::new(resolver, Arc::new(Config::default()));

        let first = router.application_for_root(dir.path()).await.unwrap();
        let second = router.application_for_root(dir.path()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
