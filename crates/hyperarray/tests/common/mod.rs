//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use hyperarray::prelude::*;

/// Module image declaring the element-wise kernels.
pub const ARITH_PTX: &str = "\
.version 8.0
.target sm_80
.visible .entry add_f32(
.visible .entry scale_f32(
";

/// Manifest binding logical names to the symbols in `ARITH_PTX`.
pub const ARITH_LUT: &str = "\
arith 2
add:add_f32
scale:scale_f32
";

/// Simulated driver with `add_f32` and `scale_f32` bodies registered.
pub fn sim_driver() -> Arc<SimDriver> {
    let driver = Arc::new(SimDriver::new());
    driver.register_kernel("add_f32", |launch| {
        // SAFETY: launched with bounds followed by three views.
        let (bounds, a, b, out) = unsafe {
            (
                launch.param::<LaunchBounds>(0)?,
                launch.param::<ArrayView>(1)?,
                launch.param::<ArrayView>(2)?,
                launch.param::<ArrayView>(3)?,
            )
        };
        let n = bounds.size as usize;
        let a: Vec<f32> = launch.memory.read(DevicePtr(a.data), n)?;
        let b: Vec<f32> = launch.memory.read(DevicePtr(b.data), n)?;
        let sum: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        launch.memory.write(DevicePtr(out.data), &sum)
    });
    driver.register_kernel("scale_f32", |launch| {
        // SAFETY: launched with bounds followed by one view.
        let (bounds, view) = unsafe {
            (
                launch.param::<LaunchBounds>(0)?,
                launch.param::<ArrayView>(1)?,
            )
        };
        let n = bounds.size as usize;
        let values: Vec<f32> = launch.memory.read(DevicePtr(view.data), n)?;
        let scaled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
        launch.memory.write(DevicePtr(view.data), &scaled)
    });
    driver
}

/// Lays out `<root>/hyperarray_data/kernels/arith/{kernels.lut,arith.ptx}`.
pub fn write_kernel_tree(root: &Path) {
    let dir = root.join("hyperarray_data").join("kernels").join("arith");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("kernels.lut"), ARITH_LUT).unwrap();
    fs::write(dir.join("arith.ptx"), ARITH_PTX).unwrap();
}

/// Manager whose kernels were discovered from a temporary data root.
pub fn manager_with_kernels(driver: Arc<SimDriver>, root: &Path) -> ResourceManager {
    write_kernel_tree(root);
    let config = ComputeConfig::builder().with_data_root(root).build();
    ResourceManager::new(driver, config).unwrap()
}

/// Manager without kernel discovery.
pub fn bare_manager(driver: Arc<SimDriver>) -> ResourceManager {
    let config = ComputeConfig::builder().with_kernel_loading(false).build();
    ResourceManager::new(driver, config).unwrap()
}

/// Installs a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
