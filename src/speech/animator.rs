//! Speech Animator
//!
//! 按事件时间戳把 viseme 转换为上下唇目标：提前 lookahead 提交、过渡时长恰好落在事件时刻；
//! 到达时已晚于容差的事件记为 StreamDesync 并丢弃，不追赶、不阻塞其他通道。
//! 结束（或被取消）时提交闭嘴姿态，之后才释放嘴唇所有权。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SpeechSection;
use crate::core::recovery::ErrorPolicy;
use crate::core::MotionError;
use crate::motion::{Calibration, ChannelId, ClaimId, PoseVector, Priority, SchedulerHandle};
use crate::speech::{Viseme, VisemeStream};

const CLOSE_TRANSITION: Duration = Duration::from_millis(100);
const MAX_AMPLITUDE: f64 = 1.6;

/// 一次播放的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechReport {
    pub played: usize,
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct SpeechAnimator {
    calibration: Arc<Calibration>,
    lookahead: Duration,
    tolerance: Duration,
}

impl SpeechAnimator {
    pub fn new(calibration: Arc<Calibration>, settings: &SpeechSection) -> Self {
        Self {
            calibration,
            lookahead: settings.lookahead(),
            tolerance: settings.desync_tolerance(),
        }
    }

    /// viseme + 振幅 -> 嘴唇姿态（不含过渡时长）
    pub fn lip_pose(&self, viseme: Viseme, amplitude: f64) -> PoseVector {
        let amplitude = if amplitude.is_finite() {
            amplitude.clamp(0.0, MAX_AMPLITUDE)
        } else {
            1.0
        };
        let (top, bottom) = viseme.lip_openness();
        PoseVector::new()
            .with(
                ChannelId::TopLip,
                self.calibration.offset(ChannelId::TopLip, top * amplitude),
            )
            .with(
                ChannelId::BottomLip,
                self.calibration.offset(ChannelId::BottomLip, bottom * amplitude),
            )
    }

    pub fn closed_pose(&self) -> PoseVector {
        PoseVector::new()
            .with(ChannelId::TopLip, self.calibration.neutral(ChannelId::TopLip))
            .with(ChannelId::BottomLip, self.calibration.neutral(ChannelId::BottomLip))
            .over(CLOSE_TRANSITION)
    }

    /// 播放事件流直到结束或取消；时间轴以调用时刻为零点
    pub async fn run(
        &self,
        mut events: VisemeStream,
        scheduler: &SchedulerHandle,
        claim: ClaimId,
        cancel: &CancellationToken,
    ) -> Result<SpeechReport, MotionError> {
        let start = Instant::now();
        let policy = ErrorPolicy::new();
        let mut report = SpeechReport::default();

        loop {
            let next = tokio::select! {
                event = events.next() => event,
                _ = cancel.cancelled() => None,
            };
            let Some(event) = next else { break };

            let due = start + event.at();
            let now = Instant::now();
            if now > due + self.tolerance {
                let late = now.duration_since(due);
                policy.report(&MotionError::StreamDesync {
                    late_ms: late.as_millis() as u64,
                });
                report.dropped += 1;
                continue;
            }

            let send_at = due.checked_sub(self.lookahead).unwrap_or(start).max(start);
            if send_at > now {
                tokio::select! {
                    _ = tokio::time::sleep_until(send_at) => {}
                    _ = cancel.cancelled() => break,
                }
            }

            let transition = due.saturating_duration_since(Instant::now());
            scheduler.submit(
                Priority::Speech,
                Some(claim),
                self.lip_pose(event.viseme, event.amplitude).over(transition),
            )?;
            report.played += 1;
        }

        // stop_all 之后租约已失效，这次提交会被调度器忽略
        scheduler.submit(Priority::Speech, Some(claim), self.closed_pose())?;
        Ok(report)
    }
}
