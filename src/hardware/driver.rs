//! 舵机驱动 trait：同步、快速、有副作用

use thiserror::Error;

use crate::motion::{Bounds, ChannelId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HardwareError {
    #[error("write to {channel} failed: {reason}")]
    Write { channel: ChannelId, reason: String },

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// 硬件驱动能力接口
///
/// 控制环每个 tick 调用一次 write_batch；写失败的通道保持上一次成功的输出。
pub trait HardwareDriver: Send {
    /// 写单个通道位置（度）
    fn write(&mut self, channel: ChannelId, position: f64) -> Result<(), HardwareError>;

    /// 批量写入；默认逐个写，某通道失败后仍写完其余通道
    ///
    /// 返回写入失败的通道及其错误，空表示整批成功。
    fn write_batch(&mut self, outputs: &[(ChannelId, f64)]) -> Vec<(ChannelId, HardwareError)> {
        outputs
            .iter()
            .filter_map(|&(channel, position)| {
                self.write(channel, position).err().map(|e| (channel, e))
            })
            .collect()
    }

    /// 设备自带的标定范围（可以只覆盖部分通道）
    fn read_calibration(&self) -> Result<Vec<(ChannelId, Bounds)>, HardwareError>;

    /// 释放硬件句柄
    fn close(&mut self) {}
}
