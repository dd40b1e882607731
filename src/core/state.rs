//! 状态投影：调度器每个 tick 发布一次 StatusSnapshot
//!
//! 生产者（待机行为、关闭流程、测试）只读快照，不接触通道内部状态。

use serde::Serialize;

use crate::motion::{ChannelId, ChannelSet};

/// 机器人当前阶段（由所有权推导）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RobotPhase {
    Idle,
    Gesturing,
    Speaking,
    /// 手势与语音在不相交通道上同时进行
    GesturingAndSpeaking,
}

impl RobotPhase {
    pub fn from_flags(gesturing: bool, speaking: bool) -> Self {
        match (gesturing, speaking) {
            (false, false) => RobotPhase::Idle,
            (true, false) => RobotPhase::Gesturing,
            (false, true) => RobotPhase::Speaking,
            (true, true) => RobotPhase::GesturingAndSpeaking,
        }
    }
}

/// 调度器状态快照
#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    /// 已执行的 tick 数
    pub tick: u64,
    pub phase: RobotPhase,
    /// 每个通道的输出位置（按 ChannelId::index 排列）
    pub positions: [f64; ChannelId::COUNT],
    pub targets: [f64; ChannelId::COUNT],
    /// 被手势/语音占用的通道
    pub claimed: ChannelSet,
    /// 所有通道都停在安全姿态
    pub at_rest: bool,
    /// stop_all 已被执行的次数
    pub stop_epoch: u64,
}

impl StatusSnapshot {
    pub fn position(&self, channel: ChannelId) -> f64 {
        self.positions[channel.index()]
    }

    pub fn target(&self, channel: ChannelId) -> f64 {
        self.targets[channel.index()]
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            tick: 0,
            phase: RobotPhase::Idle,
            positions: [0.0; ChannelId::COUNT],
            targets: [0.0; ChannelId::COUNT],
            claimed: ChannelSet::empty(),
            at_rest: false,
            stop_epoch: 0,
        }
    }
}
