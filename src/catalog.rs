use crate::config;
use crate::db::{self, ConnectionPool};
use crate::error::Result;
use crate::plugin::registry::PluginRegistry;
use crate::registry::MetadataRegistry;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The engine's runtime context: the connection pool, the synced metadata
/// registry and the plugin registry. Cloning is cheap; all clones share the
/// same state.
#[derive(Clone)]
pub struct Catalog {
    pool: ConnectionPool,
    registry: Arc<MetadataRegistry>,
    plugins: Arc<PluginRegistry>,
}

impl Catalog {
    /// Opens the catalog database, applies pending migrations and syncs the
    /// metadata registry so every declared key has a stable id.
    pub fn open(database_url: &str, mut registry: MetadataRegistry, plugins: PluginRegistry) -> Result<Catalog> {
        let pool = db::create_pool(database_url)?;
        let mut conn = pool.get()?;
        db::run_migrations(&mut conn)?;
        registry.sync(&mut conn)?;
        Ok(Catalog {
            pool,
            registry: Arc::new(registry),
            plugins: Arc::new(plugins),
        })
    }

    /// Opens the catalog at the environment-configured database path with
    /// the built-in keys.
    pub fn open_default(plugins: PluginRegistry) -> Result<Catalog> {
        Self::open(&config::database_url(), MetadataRegistry::with_builtin_keys(), plugins)
    }

    pub fn connection(&self) -> Result<db::Connection> {
        self.pool.get().map_err(Into::into)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn registry_arc(&self) -> Arc<MetadataRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// The source plugin instance for an actor, cached per identity.
    pub fn source_instance(&self, actor: &crate::model::actor::Actor) -> Result<Arc<dyn crate::plugin::SourcePlugin>> {
        self.plugins.source_instance(actor, &self.registry)
    }

    /// The processor plugin instance for an actor, cached per identity.
    pub fn processor_instance(
        &self,
        actor: &crate::model::actor::Actor,
    ) -> Result<Arc<dyn crate::plugin::Processor>> {
        self.plugins.processor_instance(actor, &self.registry)
    }
}

/// Initializes logging using [`tracing_subscriber`], honoring `RUST_LOG`.
pub fn enable_tracing(default_filter: &str) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(err) => {
            if std::env::var("RUST_LOG").is_ok() {
                warn!("Log filter is invalid. Some or all directives may be ignored. Details:\n{err}");
            }
            EnvFilter::new(default_filter)
        }
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}
