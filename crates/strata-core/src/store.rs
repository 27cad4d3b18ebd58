use crate::cleaner::Cleaner;
use crate::creator::Creator;
use crate::deleter::Deleter;
use crate::fetcher::{Fetcher, SchemeFetcher};
use crate::gc::GarbageCollector;
use crate::measurer::StoreMeasurer;
use crate::metrics::{MetricsEmitter, TracingEmitter};
use crate::puller::BaseImagePuller;
use crate::CoreError;
use std::path::PathBuf;
use std::sync::Arc;
use strata_driver::{select_driver, FilesystemDriver};
use strata_store::{DependencyManager, Locksmith, StoreLayout, StoreOwner};
use tracing::debug;

/// Wiring for one store root: hands out the orchestrators, all sharing the
/// same driver, fetcher and metrics sink.
///
/// Nothing here caches store state. Every operation re-reads the
/// filesystem, so independent processes opening the same root stay
/// consistent.
#[derive(Clone)]
pub struct Store {
    layout: StoreLayout,
    driver: Arc<dyn FilesystemDriver>,
    fetcher: Arc<dyn Fetcher>,
    metrics: Arc<dyn MetricsEmitter>,
}

impl Store {
    pub fn new(layout: StoreLayout, driver: Arc<dyn FilesystemDriver>) -> Self {
        Self {
            layout,
            driver,
            fetcher: Arc::new(SchemeFetcher::new()),
            metrics: Arc::new(TracingEmitter),
        }
    }

    /// Open `root` with the driver registered under `driver_name`.
    pub fn open(root: impl Into<PathBuf>, driver_name: &str) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(root);
        let driver: Arc<dyn FilesystemDriver> = Arc::from(select_driver(driver_name, &layout)?);
        debug!(
            "opened store {} with {} driver",
            layout.root().display(),
            driver.name()
        );
        Ok(Self::new(layout, driver))
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn driver(&self) -> &Arc<dyn FilesystemDriver> {
        &self.driver
    }

    pub fn initialize(&self, owner: Option<StoreOwner>) -> Result<(), CoreError> {
        self.layout.initialize(owner)?;
        Ok(())
    }

    pub fn locksmith(&self) -> Locksmith {
        Locksmith::new(&self.layout)
    }

    pub fn dependencies(&self) -> DependencyManager {
        DependencyManager::new(&self.layout)
    }

    pub fn measurer(&self) -> StoreMeasurer {
        StoreMeasurer::new(Arc::clone(&self.driver))
    }

    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.layout.clone(), Arc::clone(&self.driver))
    }

    pub fn puller(&self) -> BaseImagePuller {
        BaseImagePuller::new(
            self.layout.clone(),
            Arc::clone(&self.driver),
            Arc::clone(&self.fetcher),
        )
    }

    pub fn cleaner(&self) -> Cleaner {
        Cleaner::new(
            self.locksmith(),
            self.measurer(),
            self.garbage_collector(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn creator(&self) -> Creator {
        Creator::new(
            self.layout.clone(),
            Arc::clone(&self.driver),
            self.puller(),
            self.cleaner(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn deleter(&self) -> Deleter {
        Deleter::new(
            self.layout.clone(),
            Arc::clone(&self.driver),
            Arc::clone(&self.metrics),
        )
    }
}
