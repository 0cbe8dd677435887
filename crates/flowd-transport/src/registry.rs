//! Backend registry: maps configured backend names to async constructors.

use crate::backend::{Backend, BackendError, BackendResult};
use crate::config::{LOG, TransportConfig, UDP_FIREFLY};
use crate::log_backend::LogBackend;
use crate::udp_firefly::UdpFireflyBackend;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by backend constructors
pub type BackendFuture = Pin<Box<dyn Future<Output = BackendResult<Arc<dyn Backend>>> + Send>>;

type Constructor = Arc<dyn Fn(TransportConfig) -> BackendFuture + Send + Sync>;

/// Name → constructor table
///
/// # Examples
///
/// ```no_run
/// use flowd_transport::{BackendRegistry, TransportConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = BackendRegistry::with_builtins();
/// let backends = registry.build(&TransportConfig::default()).await?;
/// println!("{} backend(s) ready", backends.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `udp_firefly` and `log`
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(UDP_FIREFLY, |config: TransportConfig| async move {
            let backend = UdpFireflyBackend::connect(&config.firefly).await?;
            Ok(Arc::new(backend) as Arc<dyn Backend>)
        });
        registry.register(LOG, |_config: TransportConfig| async move {
            Ok(Arc::new(LogBackend::new()) as Arc<dyn Backend>)
        });
        registry
    }

    /// Register (or replace) a constructor
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(TransportConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BackendResult<Arc<dyn Backend>>> + Send + 'static,
    {
        let constructor: Constructor =
            Arc::new(move |config| -> BackendFuture { Box::pin(constructor(config)) });
        self.constructors.insert(name.into(), constructor);
    }

    /// Whether `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Check that every configured backend is registered
    ///
    /// # Errors
    /// Returns `BackendError::UnknownBackend` for the first unknown name
    pub fn check(&self, config: &TransportConfig) -> BackendResult<()> {
        match config.backends.iter().find(|name| !self.contains(name)) {
            Some(name) => Err(BackendError::UnknownBackend(name.clone())),
            None => Ok(()),
        }
    }

    /// Construct every configured backend, in configuration order
    ///
    /// # Errors
    /// Returns `BackendError::UnknownBackend` for unregistered names, or the
    /// first constructor error
    pub async fn build(&self, config: &TransportConfig) -> BackendResult<Vec<Arc<dyn Backend>>> {
        self.check(config)?;

        let mut backends = Vec::with_capacity(config.backends.len());
        for name in &config.backends {
            let constructor = self
                .constructors
                .get(name)
                .ok_or_else(|| BackendError::UnknownBackend(name.clone()))?;
            let backend = constructor(config.clone()).await?;
            tracing::debug!(backend = %name, "backend constructed");
            backends.push(backend);
        }
        Ok(backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["log", "udp_firefly"]);
        assert!(registry.contains("udp_firefly"));
        assert!(!registry.contains("kafka"));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_fatal() {
        let registry = BackendRegistry::with_builtins();
        let config = TransportConfig {
            backends: vec!["log".into(), "kafka".into()],
            ..TransportConfig::default()
        };
        match registry.build(&config).await {
            Err(BackendError::UnknownBackend(name)) => assert_eq!(name, "kafka"),
            other => panic!("expected UnknownBackend, got {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn test_build_in_order() {
        let registry = BackendRegistry::with_builtins();
        let config = TransportConfig {
            backends: vec!["log".into(), "log".into()],
            ..TransportConfig::default()
        };
        let backends = registry.build(&config).await.unwrap();
        assert_eq!(backends.len(), 2);
        assert!(backends.iter().all(|b| b.name() == "log"));
    }

    #[tokio::test]
    async fn test_custom_registration() {
        let mut registry = BackendRegistry::new();
        registry.register("quiet", |_| async {
            Ok(Arc::new(LogBackend::new()) as Arc<dyn Backend>)
        });
        let config = TransportConfig {
            backends: vec!["quiet".into()],
            ..TransportConfig::default()
        };
        assert_eq!(registry.build(&config).await.unwrap().len(), 1);
    }
}
