//! 手势定义与回放
//!
//! Gesture 是 (PoseVector, hold) 的有序序列，纯数据、无硬件访问；
//! play 每次调用持有自己的进度游标，同一个 Gesture 可被多个调用方并发回放。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::MotionError;
use crate::motion::{
    Calibration, ChannelId, ChannelSet, ClaimId, PoseVector, Priority, SchedulerHandle,
};

/// 手势中的一步：提交姿态后保持 hold 再进入下一步
#[derive(Debug, Clone)]
pub struct GestureStep {
    pub pose: PoseVector,
    pub hold: Duration,
}

impl GestureStep {
    pub fn new(pose: PoseVector, hold: Duration) -> Self {
        Self { pose, hold }
    }
}

#[derive(Debug, Clone)]
pub struct Gesture {
    name: String,
    steps: Vec<GestureStep>,
}

impl Gesture {
    pub fn new(name: impl Into<String>, steps: Vec<GestureStep>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[GestureStep] {
        &self.steps
    }

    /// 手势涉及的全部通道
    pub fn channels(&self) -> ChannelSet {
        self.steps
            .iter()
            .fold(ChannelSet::empty(), |acc, s| acc.union(s.pose.channels()))
    }

    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.hold).sum()
    }

    /// 依次提交每一步并等待 hold；被取消（stop_all）时提前返回 Ok
    pub async fn play(
        &self,
        scheduler: &SchedulerHandle,
        priority: Priority,
        claim: Option<ClaimId>,
        channels: ChannelSet,
        cancel: &CancellationToken,
    ) -> Result<(), MotionError> {
        for (i, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            scheduler.submit(priority, claim, step.pose.restricted_to(channels))?;
            tokio::select! {
                _ = tokio::time::sleep(step.hold) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("Gesture '{}' cancelled at step {}", self.name, i);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// 按名称注册与查找手势
#[derive(Debug, Default)]
pub struct GestureLibrary {
    gestures: HashMap<String, Arc<Gesture>>,
}

impl GestureLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置手势：偏移以通道半量程为单位（0.4 ≈ 原 0..10 刻度上的 2 格）
    pub fn builtin(calibration: &Calibration) -> Self {
        let at = |channel: ChannelId, fraction: f64| calibration.offset(channel, fraction);
        let ms = Duration::from_millis;

        let mut lib = Self::new();

        lib.register(Gesture::new(
            "nod",
            vec![
                GestureStep::new(PoseVector::new().with(ChannelId::HeadNod, at(ChannelId::HeadNod, 0.4)).over(ms(150)), ms(300)),
                GestureStep::new(PoseVector::new().with(ChannelId::HeadNod, at(ChannelId::HeadNod, -0.4)).over(ms(150)), ms(300)),
                GestureStep::new(PoseVector::new().with(ChannelId::HeadNod, at(ChannelId::HeadNod, 0.0)).over(ms(150)), ms(300)),
            ],
        ));

        lib.register(Gesture::new(
            "shake",
            vec![
                GestureStep::new(PoseVector::new().with(ChannelId::HeadTurn, at(ChannelId::HeadTurn, 0.4)).over(ms(150)), ms(300)),
                GestureStep::new(PoseVector::new().with(ChannelId::HeadTurn, at(ChannelId::HeadTurn, -0.4)).over(ms(150)), ms(300)),
                GestureStep::new(PoseVector::new().with(ChannelId::HeadTurn, at(ChannelId::HeadTurn, 0.0)).over(ms(150)), ms(300)),
            ],
        ));

        // 侧头并抬眼
        lib.register(Gesture::new(
            "think",
            vec![
                GestureStep::new(
                    PoseVector::new()
                        .with(ChannelId::HeadTurn, at(ChannelId::HeadTurn, 0.2))
                        .with(ChannelId::EyeTilt, at(ChannelId::EyeTilt, 0.4))
                        .over(ms(250)),
                    ms(500),
                ),
                GestureStep::new(
                    PoseVector::new()
                        .with(ChannelId::HeadTurn, at(ChannelId::HeadTurn, 0.0))
                        .with(ChannelId::EyeTilt, at(ChannelId::EyeTilt, 0.0))
                        .over(ms(250)),
                    ms(300),
                ),
            ],
        ));

        lib.register(Gesture::new(
            "excite",
            vec![
                GestureStep::new(
                    PoseVector::new()
                        .with(ChannelId::HeadNod, at(ChannelId::HeadNod, 0.4))
                        .with(ChannelId::EyeTilt, at(ChannelId::EyeTilt, -0.4))
                        .over(ms(100)),
                    ms(200),
                ),
                GestureStep::new(
                    PoseVector::new()
                        .with(ChannelId::HeadNod, at(ChannelId::HeadNod, -0.2))
                        .with(ChannelId::EyeTilt, at(ChannelId::EyeTilt, 0.4))
                        .over(ms(100)),
                    ms(200),
                ),
                GestureStep::new(
                    PoseVector::new()
                        .with(ChannelId::HeadNod, at(ChannelId::HeadNod, 0.0))
                        .with(ChannelId::EyeTilt, at(ChannelId::EyeTilt, 0.0))
                        .over(ms(100)),
                    ms(200),
                ),
            ],
        ));

        let lid = calibration.bounds(ChannelId::LidBlink);
        lib.register(Gesture::new(
            "blink",
            vec![
                GestureStep::new(PoseVector::new().with(ChannelId::LidBlink, lid.max).over(ms(40)), ms(100)),
                GestureStep::new(PoseVector::new().with(ChannelId::LidBlink, lid.neutral).over(ms(40)), ms(100)),
            ],
        ));

        lib
    }

    pub fn register(&mut self, gesture: Gesture) {
        self.gestures
            .insert(gesture.name().to_string(), Arc::new(gesture));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Gesture>, MotionError> {
        self.gestures
            .get(name)
            .cloned()
            .ok_or_else(|| MotionError::GestureNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gestures.keys().cloned().collect();
        names.sort();
        names
    }
}
