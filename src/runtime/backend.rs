//! Accelerator backend bundle

use super::traits::{BlasLibrary, DeviceDriver, DnnLibrary, NoDnn};
use std::fmt;
use std::sync::Arc;

/// The vendor capabilities an accelerator context is built from
///
/// Cloning is cheap; every accelerator context keeps its own clone so the
/// libraries outlive all handles created through them.
#[derive(Clone)]
pub struct AcceleratorBackend {
    driver: Arc<dyn DeviceDriver>,
    blas: Arc<dyn BlasLibrary>,
    dnn: Arc<dyn DnnLibrary>,
}

impl AcceleratorBackend {
    /// Bundle a driver with its linear-algebra and convolution libraries
    pub fn new(
        driver: Arc<dyn DeviceDriver>,
        blas: Arc<dyn BlasLibrary>,
        dnn: Arc<dyn DnnLibrary>,
    ) -> Self {
        Self { driver, blas, dnn }
    }

    /// Bundle a driver and linear-algebra library with no convolution library
    pub fn without_dnn(driver: Arc<dyn DeviceDriver>, blas: Arc<dyn BlasLibrary>) -> Self {
        Self::new(driver, blas, Arc::new(NoDnn))
    }

    /// Device driver
    #[inline]
    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.driver
    }

    /// Linear-algebra library
    #[inline]
    pub fn blas(&self) -> &Arc<dyn BlasLibrary> {
        &self.blas
    }

    /// Convolution/primitives library
    #[inline]
    pub fn dnn(&self) -> &Arc<dyn DnnLibrary> {
        &self.dnn
    }
}

impl fmt::Debug for AcceleratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorBackend")
            .field("driver", &self.driver.name())
            .field("dnn_available", &self.dnn.is_available())
            .finish()
    }
}
