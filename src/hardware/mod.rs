//! 硬件驱动边界
//!
//! 运动核心只依赖 HardwareDriver trait；具体舵机 SDK 在外部实现。
//! SimulatedDriver 为内存实现，用于无硬件运行与测试。

pub mod driver;
pub mod simulated;

pub use driver::{HardwareDriver, HardwareError};
pub use simulated::{DriverProbe, SimulatedDriver};
