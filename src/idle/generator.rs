//! 待机行为生成器
//!
//! 状态机 {Dormant, Active}：调度器报告有手势/语音在进行时休眠，否则每个待机 tick
//! 抽取一种行为并合成头部+眼睛的小幅姿态，独立抽取是否眨眼；间隔在配置区间内随机，
//! 避免机械的周期感。所有提交都使用 Priority::Idle，随时可被抢占。

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::config::{IdleSection, PauseRange};
use crate::core::MotionError;
use crate::idle::{BehaviorWeights, IdleBehavior};
use crate::motion::{Calibration, ChannelId, ChannelSet, PoseVector, Priority, SchedulerHandle};

const HEAD_TRANSITION: Duration = Duration::from_millis(800);
const EYE_TRANSITION: Duration = Duration::from_millis(500);
const FAST_EYE_TRANSITION: Duration = Duration::from_millis(150);
/// 专注注视时眼睛先动，头部在此之后跟上
const FOCUS_LEAD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Dormant,
    Active,
}

/// 一次待机 tick 的动作计划
#[derive(Debug, Clone)]
pub struct IdlePlan {
    pub behavior: IdleBehavior,
    /// (姿态, 提交后等待)
    pub steps: Vec<(PoseVector, Duration)>,
    pub blink: bool,
    /// 本 tick 结束后的停顿
    pub pause: Duration,
}

pub struct IdleGenerator {
    weights: BehaviorWeights,
    calibration: Arc<Calibration>,
    settings: IdleSection,
    state: IdleState,
    seed: Option<u64>,
}

impl IdleGenerator {
    pub fn new(weights: BehaviorWeights, calibration: Arc<Calibration>, settings: IdleSection) -> Self {
        Self {
            weights,
            calibration,
            settings,
            state: IdleState::Dormant,
            seed: None,
        }
    }

    /// 固定随机种子（测试用）
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn state(&self) -> IdleState {
        self.state
    }

    pub fn weights(&self) -> &BehaviorWeights {
        &self.weights
    }

    /// 合成一次待机动作（纯函数，便于测试）
    pub fn plan<R: Rng + ?Sized>(&self, rng: &mut R) -> IdlePlan {
        let behavior = self.weights.sample(rng);
        let blink = self.weights.should_blink(rng);
        let cal = &self.calibration;

        let head = |turn: f64, nod: f64| {
            PoseVector::new()
                .with(ChannelId::HeadTurn, cal.offset(ChannelId::HeadTurn, turn))
                .with(ChannelId::HeadNod, cal.offset(ChannelId::HeadNod, nod))
                .over(HEAD_TRANSITION)
        };
        let eyes = |turn: f64, tilt: f64, over: Duration| {
            PoseVector::new()
                .with(ChannelId::EyeTurn, cal.offset(ChannelId::EyeTurn, turn))
                .with(ChannelId::EyeTilt, cal.offset(ChannelId::EyeTilt, tilt))
                .over(over)
        };

        let (steps, pause) = match behavior {
            IdleBehavior::Subtle => {
                let steps = vec![
                    (head(rng.gen_range(-0.2..=0.2), rng.gen_range(-0.2..=0.2)), Duration::ZERO),
                    (
                        eyes(rng.gen_range(-0.2..=0.2), rng.gen_range(-0.2..=0.2), EYE_TRANSITION),
                        Duration::ZERO,
                    ),
                ];
                (steps, self.settings.subtle_pause)
            }
            IdleBehavior::LookAround => {
                let turn = rng.gen_range(-0.4..=0.4);
                let nod = rng.gen_range(-0.4..=0.4);
                // 眼睛跟随头部
                let eye_turn = turn + rng.gen_range(-0.2..=0.2);
                let eye_tilt = nod + rng.gen_range(-0.2..=0.2);
                let steps = vec![
                    (head(turn, nod), Duration::ZERO),
                    (eyes(eye_turn, eye_tilt, EYE_TRANSITION), Duration::ZERO),
                ];
                (steps, self.settings.look_around_pause)
            }
            IdleBehavior::Focused => {
                let eye_turn = rng.gen_range(-0.6..=0.6);
                let eye_tilt = rng.gen_range(-0.6..=0.6);
                let turn = eye_turn + rng.gen_range(-0.1..=0.1);
                let nod = eye_tilt + rng.gen_range(-0.1..=0.1);
                let steps = vec![
                    (eyes(eye_turn, eye_tilt, FAST_EYE_TRANSITION), FOCUS_LEAD),
                    (head(turn, nod), Duration::ZERO),
                ];
                (steps, self.settings.focused_pause)
            }
        };

        IdlePlan {
            behavior,
            steps,
            blink,
            pause: pick_pause(rng, pause),
        }
    }

    fn set_state(&mut self, state: IdleState) {
        if self.state != state {
            tracing::debug!("Idle generator {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// 后台循环，直到 cancel 或调度器关闭
    pub async fn run(mut self, scheduler: SchedulerHandle, cancel: CancellationToken) {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let blink = scheduler.library().get("blink").ok();
        let poll = Duration::from_millis(self.settings.dormant_poll_ms.max(1));

        tracing::info!("Idle behavior generator started");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if scheduler.is_animating() {
                self.set_state(IdleState::Dormant);
                tokio::select! {
                    _ = tokio::time::sleep(poll) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
            self.set_state(IdleState::Active);

            let plan = self.plan(&mut rng);
            tracing::debug!(
                "Idle {:?} (blink: {}, pause: {:?})",
                plan.behavior,
                plan.blink,
                plan.pause
            );

            if let Err(e) = self.execute(&plan, &scheduler, blink.as_deref(), &cancel).await {
                tracing::info!("Idle generator stopping: {}", e);
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(plan.pause) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.set_state(IdleState::Dormant);
        tracing::info!("Idle behavior generator stopped");
    }

    async fn execute(
        &self,
        plan: &IdlePlan,
        scheduler: &SchedulerHandle,
        blink: Option<&crate::gesture::Gesture>,
        cancel: &CancellationToken,
    ) -> Result<(), MotionError> {
        for (pose, delay) in &plan.steps {
            if scheduler.is_animating() || cancel.is_cancelled() {
                return Ok(());
            }
            scheduler.submit_idle(pose.clone())?;
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => {}
                    _ = cancel.cancelled() => return Ok(()),
                }
            }
        }
        if let Some(blink) = blink.filter(|_| plan.blink) {
            blink
                .play(scheduler, Priority::Idle, None, ChannelSet::LID, cancel)
                .await?;
        }
        Ok(())
    }
}

fn pick_pause<R: Rng + ?Sized>(rng: &mut R, range: PauseRange) -> Duration {
    let ms = if range.min_ms >= range.max_ms {
        range.min_ms
    } else {
        rng.gen_range(range.min_ms..=range.max_ms)
    };
    Duration::from_millis(ms)
}
