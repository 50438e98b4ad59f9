//! Domain module: device liveness state, independent of any I/O.

pub mod clock;
pub mod registry;

pub use clock::now_ms;
pub use registry::{DeviceRecord, DeviceRegistry, DeviceState, RegistrySnapshot};
