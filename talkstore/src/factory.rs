//! StorageFactory - Backend Construction and Ownership
//!
//! `TigerStyle`: Explicit ownership, validated configuration, close before
//! replace.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        StorageHandle                         │
//! │  config ──(changed?)──► close old ──► create + initialize    │
//! │                                             │                │
//! │                              StorageFactory ▼                │
//! │        ┌──────────────┬──────────────────┬─────────────────┐ │
//! │        │EmbeddedStore │ RelationalStore  │DistributedStore │ │
//! │        └──────────────┴──────────────────┴─────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The handle is built once at startup and passed to whoever needs storage;
//! there is no process-wide instance.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::backend::{BackendKind, StorageBackend};
use crate::collection::Collection;
use crate::config::StorageConfig;
use crate::constants::{DISTRIBUTED_BATCH_ITEMS_COUNT_MAX, RELATIONAL_POOL_CONNECTIONS_MAX};
use crate::distributed::{DistributedStore, KeyValueClient};
use crate::dst::FaultInjector;
use crate::embedded::EmbeddedStore;
use crate::error::StorageResult;
use crate::retry::RetryExecutor;

// =============================================================================
// Reports
// =============================================================================

/// Outcome of [`StorageFactory::validate_configuration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Backend validated, `None` if the type was not recognized
    pub backend: Option<BackendKind>,
    /// True if there are no errors
    pub valid: bool,
    /// Problems that prevent startup
    pub errors: Vec<String>,
    /// Problems worth knowing about
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn new(backend: Option<BackendKind>) -> Self {
        Self {
            backend,
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Description of a supported backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    /// Backend kind
    pub kind: BackendKind,
    /// Configuration value selecting it
    pub name: &'static str,
    /// What it is
    pub description: &'static str,
    /// Where it belongs
    pub recommended_for: &'static str,
}

/// Every backend this build knows about.
#[must_use]
pub fn supported_types() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor {
            kind: BackendKind::Embedded,
            name: "file",
            description: "File-based JSON storage",
            recommended_for: "development",
        },
        BackendDescriptor {
            kind: BackendKind::Relational,
            name: "postgresql",
            description: "PostgreSQL database",
            recommended_for: "production",
        },
        BackendDescriptor {
            kind: BackendKind::Distributed,
            name: "dynamodb",
            description: "Managed key-value service",
            recommended_for: "serverless production",
        },
    ]
}

// =============================================================================
// StorageFactory
// =============================================================================

/// Builds backends from a [`StorageConfig`].
///
/// # Example
///
/// ```rust,no_run
/// use talkstore::{StorageConfig, StorageFactory};
///
/// # async fn run() -> talkstore::StorageResult<()> {
/// let factory = StorageFactory::new();
/// let backend = factory.create_and_initialize(&StorageConfig::default()).await?;
/// backend.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StorageFactory {
    kv_client: Option<Arc<dyn KeyValueClient>>,
    faults: Option<Arc<FaultInjector>>,
}

impl StorageFactory {
    /// Factory with no injected client or faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `client` for the distributed backend instead of DynamoDB.
    #[must_use]
    pub fn with_kv_client(mut self, client: Arc<dyn KeyValueClient>) -> Self {
        self.kv_client = Some(client);
        self
    }

    /// Inject faults into embedded disk I/O.
    #[must_use]
    pub fn with_fault_injector(mut self, faults: Arc<FaultInjector>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Construct the configured backend, uninitialized.
    ///
    /// # Errors
    /// `Validation` for an invalid retry policy, for the relational backend
    /// in a build without the `postgres` feature, or for the distributed
    /// backend with no injected client in a build without `dynamodb`.
    #[tracing::instrument(skip(self, config), fields(backend = %config.backend))]
    pub fn create(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        config.retry.validate()?;

        let backend: Arc<dyn StorageBackend> = match config.backend {
            BackendKind::Embedded => {
                let mut store = EmbeddedStore::new(config.embedded.clone())
                    .with_site_defaults(config.site.clone());
                if let Some(faults) = &self.faults {
                    store = store.with_fault_injector(Arc::clone(faults));
                }
                Arc::new(store)
            }
            BackendKind::Relational => self.create_relational(config)?,
            BackendKind::Distributed => {
                let client = self.kv_client_for(config)?;
                let executor = Arc::new(RetryExecutor::new(config.retry));
                Arc::new(DistributedStore::new(
                    config.distributed.clone(),
                    client,
                    executor,
                ))
            }
        };
        tracing::debug!("backend created");
        Ok(backend)
    }

    /// [`create`](Self::create) then `initialize()`.
    ///
    /// # Errors
    /// Construction or initialization errors.
    pub async fn create_and_initialize(
        &self,
        config: &StorageConfig,
    ) -> StorageResult<Arc<dyn StorageBackend>> {
        let backend = self.create(config)?;
        backend.initialize().await?;
        Ok(backend)
    }

    /// Check `config` for the backend named by `backend` (or the configured
    /// one). Never fails; problems are reported.
    #[must_use]
    pub fn validate_configuration(
        &self,
        config: &StorageConfig,
        backend: Option<&str>,
    ) -> ValidationReport {
        let kind = match backend {
            None => config.backend,
            Some(name) => match name.parse::<BackendKind>() {
                Ok(kind) => kind,
                Err(e) => {
                    let mut report = ValidationReport::new(None);
                    report.error(e.to_string());
                    return report;
                }
            },
        };

        let mut report = ValidationReport::new(Some(kind));
        if let Err(e) = config.retry.validate() {
            report.error(e.to_string());
        }

        match kind {
            BackendKind::Embedded => {
                report.warning("file storage is not recommended for production");
                if config.embedded.data_dir.as_os_str().is_empty() {
                    report.error("DATABASE_FILE_DIR must not be empty");
                }
            }
            BackendKind::Relational => {
                match config.relational.url.as_deref() {
                    None | Some("") => report.error("DATABASE_URL is required"),
                    Some(url)
                        if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) =>
                    {
                        report.error("DATABASE_URL must start with postgres:// or postgresql://");
                    }
                    Some(_) => {}
                }
                let pool_max = config.relational.pool_max;
                if pool_max == 0 || pool_max > RELATIONAL_POOL_CONNECTIONS_MAX {
                    report.warning(format!(
                        "DB_POOL_SIZE {pool_max} is outside 1..={RELATIONAL_POOL_CONNECTIONS_MAX}"
                    ));
                }
                if !cfg!(feature = "postgres") {
                    report.error("built without the postgres feature");
                }
            }
            BackendKind::Distributed => {
                if config.distributed.region.trim().is_empty() {
                    report.error("AWS_REGION is required");
                }
                for collection in Collection::all() {
                    if config.distributed.table_name(*collection).trim().is_empty() {
                        report.error(format!(
                            "{} must not be empty",
                            collection.table_env_var()
                        ));
                    }
                }
                let chunk = config.distributed.batch_chunk_size;
                if chunk == 0 || chunk > DISTRIBUTED_BATCH_ITEMS_COUNT_MAX {
                    report.error(format!(
                        "batch chunk size {chunk} is outside 1..={DISTRIBUTED_BATCH_ITEMS_COUNT_MAX}"
                    ));
                }
                report.warning("tables and indexes must be provisioned outside this process");
                if self.kv_client.is_none() && !cfg!(feature = "dynamodb") {
                    report.error("built without the dynamodb feature and no key-value client injected");
                }
            }
        }
        report
    }

    #[cfg(feature = "postgres")]
    fn create_relational(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        Ok(Arc::new(crate::relational::RelationalStore::new(
            config.relational.clone(),
        )))
    }

    #[cfg(not(feature = "postgres"))]
    fn create_relational(&self, _config: &StorageConfig) -> StorageResult<Arc<dyn StorageBackend>> {
        Err(crate::error::StorageError::validation(
            "relational backend requires the postgres feature",
        ))
    }

    #[cfg(feature = "dynamodb")]
    fn kv_client_for(&self, config: &StorageConfig) -> StorageResult<Arc<dyn KeyValueClient>> {
        if let Some(client) = &self.kv_client {
            return Ok(Arc::clone(client));
        }
        Ok(Arc::new(crate::distributed::DynamoDbClient::new(
            &config.distributed,
        )))
    }

    #[cfg(not(feature = "dynamodb"))]
    fn kv_client_for(&self, _config: &StorageConfig) -> StorageResult<Arc<dyn KeyValueClient>> {
        match &self.kv_client {
            Some(client) => Ok(Arc::clone(client)),
            None => Err(crate::error::StorageError::validation(
                "distributed backend requires the dynamodb feature or an injected key-value client",
            )),
        }
    }
}

// =============================================================================
// StorageHandle
// =============================================================================

/// Owned access to the active backend.
///
/// `reconfigure` replaces the backend when the configuration changes. The
/// old backend is closed before the new one is created, so the two never
/// hold the same resources at once.
#[derive(Debug)]
pub struct StorageHandle {
    factory: StorageFactory,
    config: tokio::sync::Mutex<StorageConfig>,
    backend: RwLock<Arc<dyn StorageBackend>>,
}

impl StorageHandle {
    /// Create and initialize the configured backend.
    ///
    /// # Errors
    /// Construction or initialization errors.
    pub async fn open(factory: StorageFactory, config: StorageConfig) -> StorageResult<Self> {
        let backend = factory.create_and_initialize(&config).await?;
        tracing::info!(backend = %config.backend, "storage opened");
        Ok(Self {
            factory,
            config: tokio::sync::Mutex::new(config),
            backend: RwLock::new(backend),
        })
    }

    /// The active backend.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.read().clone()
    }

    /// The active configuration.
    pub async fn config(&self) -> StorageConfig {
        self.config.lock().await.clone()
    }

    /// Switch to `config`. Returns `false` if it equals the active one.
    ///
    /// If the new backend fails to initialize the error is returned and the
    /// handle keeps the closed old backend; calls then fail with
    /// `NotInitialized`.
    ///
    /// # Errors
    /// Construction or initialization errors of the new backend.
    #[tracing::instrument(skip(self, config), fields(backend = %config.backend))]
    pub async fn reconfigure(&self, config: StorageConfig) -> StorageResult<bool> {
        let mut current = self.config.lock().await;
        if *current == config {
            tracing::debug!("configuration unchanged");
            return Ok(false);
        }

        let old = self.backend();
        if let Err(e) = old.close().await {
            tracing::error!(error = %e, "closing previous backend failed");
        }

        let backend = self.factory.create_and_initialize(&config).await?;
        *self.backend.write() = backend;
        *current = config;
        tracing::info!("storage reconfigured");
        Ok(true)
    }

    /// Close the active backend.
    ///
    /// # Errors
    /// The backend's close error.
    pub async fn close(&self) -> StorageResult<()> {
        self.backend().close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StoreState;
    use crate::config::{DistributedConfig, EmbeddedConfig, RelationalConfig};
    use crate::distributed::SimKeyValueClient;
    use crate::error::StorageError;

    #[test]
    fn test_embedded_warns() {
        let report = StorageFactory::new().validate_configuration(&StorageConfig::default(), None);
        assert_eq!(report.backend, Some(BackendKind::Embedded));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);

        let config = StorageConfig::default().with_embedded(EmbeddedConfig::new(""));
        let report = StorageFactory::new().validate_configuration(&config, None);
        assert!(!report.valid);
    }

    #[test]
    fn test_relational_requires_url() {
        let factory = StorageFactory::new();
        let report = factory.validate_configuration(&StorageConfig::default(), Some("postgres"));
        assert_eq!(report.backend, Some(BackendKind::Relational));
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("DATABASE_URL is required")));

        let config = StorageConfig::default()
            .with_relational(RelationalConfig::new("mysql://db").with_pool_max(500));
        let report = factory.validate_configuration(&config, Some("pg"));
        assert!(report.errors.iter().any(|e| e.contains("must start with")));
        assert!(report.warnings.iter().any(|w| w.contains("DB_POOL_SIZE 500")));
    }

    #[test]
    fn test_distributed_rules() {
        let factory = StorageFactory::new();
        let config = StorageConfig::default().with_distributed(
            DistributedConfig::default()
                .with_region("")
                .with_table(Collection::Talks, "")
                .with_batch_chunk_size(30),
        );
        let report = factory.validate_configuration(&config, Some("dynamodb"));
        assert!(!report.valid);
        let missing_client = usize::from(!cfg!(feature = "dynamodb"));
        assert_eq!(report.errors.len(), 3 + missing_client);
        assert_eq!(report.warnings.len(), 1);

        let injected = factory.with_kv_client(Arc::new(SimKeyValueClient::new()));
        let report = injected.validate_configuration(&StorageConfig::default(), Some("distributed"));
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_unknown_type() {
        let report =
            StorageFactory::new().validate_configuration(&StorageConfig::default(), Some("mongo"));
        assert_eq!(report.backend, None);
        assert!(!report.valid);
        assert!(report.errors[0].contains("mongo"));
    }

    #[test]
    fn test_supported_types() {
        let types = supported_types();
        assert_eq!(types.len(), 3);
        for descriptor in &types {
            assert_eq!(descriptor.name.parse::<BackendKind>().unwrap(), descriptor.kind);
        }
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn test_relational_needs_feature() {
        let config = StorageConfig::default().with_backend(BackendKind::Relational);
        let err = StorageFactory::new().create(&config).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));
    }

    #[cfg(not(feature = "dynamodb"))]
    #[test]
    fn test_distributed_without_client_is_rejected() {
        let config = StorageConfig::default().with_backend(BackendKind::Distributed);
        let err = StorageFactory::new().create(&config).unwrap_err();
        assert!(matches!(err, StorageError::Validation { .. }));

        let report = StorageFactory::new().validate_configuration(&config, None);
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("dynamodb feature")));
    }

    #[cfg(feature = "dynamodb")]
    #[test]
    fn test_distributed_defaults_to_dynamodb_client() {
        let config = StorageConfig::default().with_backend(BackendKind::Distributed);
        let backend = StorageFactory::new().create(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Distributed);
        assert!(format!("{backend:?}").contains("DynamoDbClient"));
    }

    #[tokio::test]
    async fn test_distributed_uses_injected_client() {
        let config = StorageConfig::default().with_backend(BackendKind::Distributed);
        let sim = Arc::new(SimKeyValueClient::new());
        sim.provision(|c| config.distributed.table_name(c));

        let factory = StorageFactory::new().with_kv_client(sim.clone());
        let backend = factory.create_and_initialize(&config).await.unwrap();
        assert_eq!(backend.kind(), BackendKind::Distributed);
        assert_eq!(backend.health().await.unwrap().state, StoreState::Ready);
        assert!(sim.call_count("describe_table") >= 1);
    }

    #[tokio::test]
    async fn test_reconfigure_unchanged_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::default().with_embedded(EmbeddedConfig::new(dir.path()));
        let handle = StorageHandle::open(StorageFactory::new(), config.clone())
            .await
            .unwrap();
        let before = handle.backend();

        assert!(!handle.reconfigure(config).await.unwrap());
        assert!(Arc::ptr_eq(&before, &handle.backend()));
        handle.close().await.unwrap();
    }
}
