//! Pose Vector：部分通道的目标位置快照 + 可选过渡时长
//!
//! 未指定的通道保持上一目标；提交后不可变（构建器按值消费）。

use std::time::Duration;

use crate::motion::channel::{ChannelId, ChannelSet};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseVector {
    targets: [Option<f64>; ChannelId::COUNT],
    duration: Option<Duration>,
}

impl PoseVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置某通道目标（度）
    pub fn with(mut self, channel: ChannelId, position: f64) -> Self {
        self.targets[channel.index()] = Some(position);
        self
    }

    /// 设置过渡时长；零时长等价于立即
    pub fn over(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn get(&self, channel: ChannelId) -> Option<f64> {
        self.targets[channel.index()]
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn channels(&self) -> ChannelSet {
        let mut set = ChannelSet::empty();
        for (channel, _) in self.iter() {
            set.insert(channel);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.targets.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, f64)> + '_ {
        ChannelId::ALL
            .into_iter()
            .filter_map(move |c| self.targets[c.index()].map(|p| (c, p)))
    }

    /// 只保留给定集合中的通道（手势在部分通道上回放时使用）
    pub fn restricted_to(&self, channels: ChannelSet) -> Self {
        let mut out = Self {
            targets: [None; ChannelId::COUNT],
            duration: self.duration,
        };
        for (channel, position) in self.iter() {
            if channels.contains(channel) {
                out.targets[channel.index()] = Some(position);
            }
        }
        out
    }
}
