use crate::CoreError;
use std::sync::Arc;
use strata_driver::FilesystemDriver;
use tracing::debug;

/// Reports how many bytes the store currently occupies on disk.
#[derive(Clone)]
pub struct StoreMeasurer {
    driver: Arc<dyn FilesystemDriver>,
}

impl StoreMeasurer {
    pub fn new(driver: Arc<dyn FilesystemDriver>) -> Self {
        Self { driver }
    }

    pub fn measure_store(&self) -> Result<u64, CoreError> {
        let usage = self.driver.measure_store_usage()?;
        debug!("store usage is {usage} bytes ({} driver)", self.driver.name());
        Ok(usage)
    }
}
