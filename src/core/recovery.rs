//! 错误处置策略
//!
//! 根据 MotionError 类型给出 Disposition：任何会阻塞或击穿固定频率控制环的错误都降级为日志跳过，
//! 只有启动期配置/标定错误是致命的。

use crate::core::MotionError;

/// 错误处置动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 拒绝启动 / 终止进程
    Fatal,
    /// 记录日志，跳过本 tick，通道保持上次有效输出
    SkipTick,
    /// 返回给调用方，无运动副作用
    Surface,
    /// 丢弃该事件，仅记录日志
    Drop,
}

#[derive(Debug, Default)]
pub struct ErrorPolicy;

impl ErrorPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &MotionError) -> Disposition {
        match err {
            MotionError::Calibration(_) | MotionError::Config(_) => Disposition::Fatal,
            MotionError::HardwareWrite { .. } => Disposition::SkipTick,
            MotionError::StreamDesync { .. } => Disposition::Drop,
            MotionError::GestureNotFound(_)
            | MotionError::SchedulerBusy { .. }
            | MotionError::Timeout(_)
            | MotionError::SchedulerClosed => Disposition::Surface,
        }
    }

    /// 记录错误并返回处置；控制环与语音动画统一走这里
    pub fn report(&self, err: &MotionError) -> Disposition {
        let disposition = self.handle(err);
        match disposition {
            Disposition::Fatal => tracing::error!("{err}"),
            Disposition::SkipTick | Disposition::Drop => tracing::warn!("{err}"),
            Disposition::Surface => tracing::debug!("{err}"),
        }
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{ChannelId, ChannelSet};

    #[test]
    fn test_startup_errors_are_fatal() {
        let policy = ErrorPolicy::new();
        assert_eq!(
            policy.handle(&MotionError::Calibration("missing".into())),
            Disposition::Fatal
        );
        assert_eq!(
            policy.handle(&MotionError::Config("bad toml".into())),
            Disposition::Fatal
        );
    }

    #[test]
    fn test_hardware_write_skips_tick() {
        let err = MotionError::HardwareWrite {
            channel: ChannelId::HeadNod,
            reason: "i2c nack".into(),
        };
        assert_eq!(ErrorPolicy::new().handle(&err), Disposition::SkipTick);
    }

    #[test]
    fn test_caller_errors_surface() {
        let policy = ErrorPolicy::new();
        assert_eq!(
            policy.handle(&MotionError::GestureNotFound("wave".into())),
            Disposition::Surface
        );
        assert_eq!(
            policy.handle(&MotionError::SchedulerBusy {
                channels: ChannelSet::HEAD
            }),
            Disposition::Surface
        );
    }

    #[test]
    fn test_desync_is_dropped() {
        assert_eq!(
            ErrorPolicy::new().report(&MotionError::StreamDesync { late_ms: 80 }),
            Disposition::Drop
        );
    }
}
