use crate::{
    app::service::{IndexService, ServiceOptions},
    catalog::CsvCatalog,
    config::Config,
    listing::FsListing,
    semantic::{model_slug, ClipEmbedder, EmbeddingProvider, Reconciler, SnapshotStore},
};
use anyhow::{Context, Result};
use homedir::my_home;
use std::path::PathBuf;
use std::sync::Arc;

/// Application factory for creating and configuring application components
pub struct AppFactory;

impl AppFactory {
    /// Load the model, catalog and listing described by `config` and wire
    /// them into an [`IndexService`]. The stored index is not loaded yet;
    /// see [`IndexService::open`].
    pub fn create_service(paths: &AppPaths, config: &Config) -> Result<IndexService> {
        let embedder = ClipEmbedder::new(&config.model, paths.base_path.clone())
            .context("Failed to load embedding model")?;
        Self::create_service_with(paths, config, Arc::new(embedder))
    }

    /// Same as [`create_service`](Self::create_service) with a given
    /// embedding provider.
    pub fn create_service_with(
        paths: &AppPaths,
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<IndexService> {
        let slug = model_slug(embedder.model_name());

        let catalog_path = paths.base_path.join(format!("catalog_{slug}.csv"));
        let catalog = CsvCatalog::load(&catalog_path)
            .with_context(|| format!("Failed to load catalog {}", catalog_path.display()))?;

        let images_root = config.images_root();
        log::info!("Indexing images under {}", images_root.display());
        let listing = FsListing::new(images_root);

        let snapshots = SnapshotStore::new(&paths.index_path, embedder.model_name());

        let reconciler = Reconciler::new(
            Arc::new(catalog),
            Arc::new(listing),
            embedder,
            snapshots,
        );

        Ok(IndexService::new(
            Arc::new(reconciler),
            ServiceOptions::from(config),
        ))
    }

    /// Get application paths with validation
    pub fn get_paths() -> Result<AppPaths> {
        let base_path = Self::get_base_path()?;
        let paths = AppPaths::new(base_path);

        // Ensure base directory exists
        std::fs::create_dir_all(&paths.index_path)
            .context("Failed to create application base directory")?;

        Ok(paths)
    }

    /// Load configuration from the base directory
    pub fn create_config(paths: &AppPaths) -> Result<Config> {
        Config::load_with(&paths.base_path).context("Failed to load config.yaml")
    }

    /// Get the base path for the application
    fn get_base_path() -> Result<PathBuf> {
        if let Ok(base_path) = std::env::var("IMGDEX_BASE_PATH") {
            return Ok(PathBuf::from(base_path));
        }

        let home = my_home()
            .context("Could not determine home directory")?
            .context("Home directory path is empty")?;
        Ok(home.join(".local/share/imgdex"))
    }
}

/// Application paths structure
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
    pub index_path: PathBuf,
}

impl AppPaths {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Self {
            index_path: base_path.join("index"),
            base_path,
        }
    }
}
