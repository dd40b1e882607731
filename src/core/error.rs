//! 运动核心错误类型
//!
//! 与 ErrorPolicy 配合：启动期标定/配置错误致命，其余降级为日志跳过或返回给调用方。

use std::time::Duration;

use thiserror::Error;

use crate::hardware::HardwareError;
use crate::motion::{ChannelId, ChannelSet};

/// 运动核心可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MotionError {
    /// 标定范围缺失或非法，拒绝启动
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// 单次硬件写入失败，本 tick 跳过
    #[error("Hardware write failed on {channel}: {reason}")]
    HardwareWrite { channel: ChannelId, reason: String },

    #[error("Gesture not found: {0}")]
    GestureNotFound(String),

    /// 通道已被进行中的手势/语音占用
    #[error("Scheduler busy: channels {channels} already owned")]
    SchedulerBusy { channels: ChannelSet },

    /// 口型事件到达过晚，丢弃
    #[error("Speech event {late_ms}ms late, dropped")]
    StreamDesync { late_ms: u64 },

    #[error("Wait timed out after {0:?}")]
    Timeout(Duration),

    #[error("Motion scheduler is not running")]
    SchedulerClosed,

    #[error("Config error: {0}")]
    Config(String),
}

impl From<HardwareError> for MotionError {
    fn from(err: HardwareError) -> Self {
        match err {
            HardwareError::Write { channel, reason } => {
                MotionError::HardwareWrite { channel, reason }
            }
            HardwareError::Unavailable(reason) => MotionError::Calibration(reason),
        }
    }
}

impl From<config::ConfigError> for MotionError {
    fn from(err: config::ConfigError) -> Self {
        MotionError::Config(err.to_string())
    }
}
