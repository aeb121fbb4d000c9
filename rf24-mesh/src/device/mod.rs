//! Everything needed to establish communication between peers using the physical
//! radio module.

pub mod device;
pub mod frame;
pub mod radio;
pub mod sim;

pub use device::*;
