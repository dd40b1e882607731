//! 运动核心：通道 PID 平滑、姿态向量、固定频率调度器与通道所有权

pub mod channel;
pub mod pose;
pub mod scheduler;

pub use channel::{Bounds, Calibration, ChannelId, ChannelSet, MotorChannel, PidGains};
pub use pose::PoseVector;
pub use scheduler::{
    AnimationHandle, ClaimGuard, ClaimId, Message, MotionScheduler, Priority, SchedulerHandle,
    Submission,
};
