//! 核心层：错误与处置策略、状态投影、优雅关闭、命令编排

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::MotionError;
pub use orchestrator::{create_robot, create_robot_with_source, spawn_command_loop, Command, Robot};
pub use recovery::{Disposition, ErrorPolicy};
pub use shutdown::{RobotCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{RobotPhase, StatusSnapshot};
