//! 运动调度器：固定频率控制环，硬件状态的唯一写入者
//!
//! 每个 tick：
//! 1. 取出队列中的姿态提交与释放消息（按到达顺序），按通道所有权决定是否生效；
//! 2. 对每个 MotorChannel 调用 tick；
//! 3. 一次性批量写入硬件驱动，并通过 watch 发布 StatusSnapshot。
//!
//! 所有权：手势/语音先在 ClaimTable 上同步声明通道集合（通道冲突或已有手势在播放时立即返回 SchedulerBusy），
//! 未被声明的通道由待机行为驱动；已声明通道上的 idle 提交被直接忽略，因此高优先级总是抢占低优先级。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{calibration_from_specs, ChannelSpec, SchedulerSection};
use crate::core::{ErrorPolicy, MotionError, RobotPhase, StatusSnapshot};
use crate::gesture::GestureLibrary;
use crate::hardware::HardwareDriver;
use crate::motion::{Calibration, ChannelId, ChannelSet, MotorChannel, PoseVector};
use crate::speech::{SpeechAnimator, VisemeStream};

/// 动画优先级：speech / gesture 抢占 idle
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
pub enum Priority {
    Idle,
    Gesture,
    Speech,
}

/// 通道所有权租约 ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ClaimId(u64);

static NEXT_CLAIM_ID: AtomicU64 = AtomicU64::new(1);

impl ClaimId {
    fn next() -> Self {
        Self(NEXT_CLAIM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// 一次姿态提交（优先级 + 可选租约 + 姿态）
#[derive(Clone, Debug)]
pub struct Submission {
    pub priority: Priority,
    pub claim: Option<ClaimId>,
    pub pose: PoseVector,
}

/// 生产者 -> 调度器 的消息
#[derive(Debug)]
pub enum Message {
    Pose(Submission),
    /// 释放租约；走同一队列，保证之前提交的姿态先生效
    Release(ClaimId),
}

#[derive(Debug)]
struct Claim {
    id: ClaimId,
    priority: Priority,
    channels: ChannelSet,
    cancel: CancellationToken,
}

/// 当前所有 gesture/speech 租约
#[derive(Debug, Default)]
pub struct ClaimTable {
    claims: Vec<Claim>,
}

impl ClaimTable {
    fn acquire(
        &mut self,
        priority: Priority,
        channels: ChannelSet,
    ) -> Result<(ClaimId, CancellationToken), MotionError> {
        let mut busy = self.claimed().intersection(channels);
        // 同一时刻只允许一个手势在播放，即使通道不重叠
        if priority == Priority::Gesture {
            busy = self
                .claims
                .iter()
                .filter(|c| c.priority == Priority::Gesture)
                .fold(busy, |acc, c| acc.union(c.channels));
        }
        if !busy.is_empty() {
            return Err(MotionError::SchedulerBusy { channels: busy });
        }
        let claim = Claim {
            id: ClaimId::next(),
            priority,
            channels,
            cancel: CancellationToken::new(),
        };
        let out = (claim.id, claim.cancel.clone());
        self.claims.push(claim);
        Ok(out)
    }

    fn release(&mut self, id: ClaimId) -> bool {
        let before = self.claims.len();
        self.claims.retain(|c| c.id != id);
        self.claims.len() != before
    }

    fn owner_of(&self, channel: ChannelId) -> Option<ClaimId> {
        self.claims
            .iter()
            .find(|c| c.channels.contains(channel))
            .map(|c| c.id)
    }

    fn claimed(&self) -> ChannelSet {
        self.claims
            .iter()
            .fold(ChannelSet::empty(), |acc, c| acc.union(c.channels))
    }

    fn has_priority(&self, priority: Priority) -> bool {
        self.claims.iter().any(|c| c.priority == priority)
    }

    fn cancel_all(&mut self) -> usize {
        let n = self.claims.len();
        for claim in self.claims.drain(..) {
            claim.cancel.cancel();
        }
        n
    }
}

fn lock(table: &Mutex<ClaimTable>) -> MutexGuard<'_, ClaimTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// 所有权租约守卫：Drop 时通过调度队列释放
#[derive(Debug)]
pub struct ClaimGuard {
    id: ClaimId,
    channels: ChannelSet,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    claims: Arc<Mutex<ClaimTable>>,
}

impl ClaimGuard {
    pub fn id(&self) -> ClaimId {
        self.id
    }

    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    /// stop_all 时被取消
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if self.tx.send(Message::Release(self.id)).is_err() {
            lock(&self.claims).release(self.id);
        }
    }
}

/// 调度器核心（同步部分），由控制环任务独占
pub struct MotionScheduler {
    channels: Vec<MotorChannel>,
    calibration: Arc<Calibration>,
    claims: Arc<Mutex<ClaimTable>>,
    /// 每个通道最近一次生效提交的优先级，用于 idle -> gesture/speech 时重置 PID
    last_priority: [Priority; ChannelId::COUNT],
    settings: SchedulerSection,
    ticks: u64,
    stop_epoch: u64,
}

impl MotionScheduler {
    pub fn new(specs: &[ChannelSpec], settings: SchedulerSection) -> Result<Self, MotionError> {
        settings.validate()?;
        let calibration = calibration_from_specs(specs)?;
        let mut channels: Vec<MotorChannel> = ChannelId::ALL
            .into_iter()
            .map(|id| {
                MotorChannel::new(id, *calibration.bounds(id), Default::default())
            })
            .collect();
        for spec in specs {
            channels[spec.id.index()] = MotorChannel::new(spec.id, spec.bounds, spec.gains);
        }
        Ok(Self {
            channels,
            calibration: Arc::new(calibration),
            claims: Arc::new(Mutex::new(ClaimTable::default())),
            last_priority: [Priority::Idle; ChannelId::COUNT],
            settings,
            ticks: 0,
            stop_epoch: 0,
        })
    }

    pub fn calibration(&self) -> &Arc<Calibration> {
        &self.calibration
    }

    pub fn channel(&self, id: ChannelId) -> &MotorChannel {
        &self.channels[id.index()]
    }

    pub fn period(&self) -> Duration {
        self.settings.period()
    }

    /// 同步声明通道（handle 侧的 claim 也走这里）
    pub fn claim(
        &self,
        priority: Priority,
        channels: ChannelSet,
    ) -> Result<(ClaimId, CancellationToken), MotionError> {
        lock(&self.claims).acquire(priority, channels)
    }

    /// 按到达顺序应用一批消息
    pub fn apply(&mut self, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let claims = Arc::clone(&self.claims);
        let mut table = lock(&claims);
        for msg in batch {
            match msg {
                Message::Pose(sub) => self.apply_submission(&table, &sub),
                Message::Release(id) => {
                    if table.release(id) {
                        tracing::debug!("Released claim {:?}", id);
                    }
                }
            }
        }
    }

    fn apply_submission(&mut self, table: &ClaimTable, sub: &Submission) {
        for (channel, position) in sub.pose.iter() {
            let allowed = match (sub.priority, table.owner_of(channel)) {
                (Priority::Idle, owner) => owner.is_none(),
                (_, Some(owner)) => sub.claim == Some(owner),
                (_, None) => false,
            };
            if !allowed {
                tracing::trace!("{:?} submission for {} ignored", sub.priority, channel);
                continue;
            }
            let idx = channel.index();
            if sub.priority > Priority::Idle && self.last_priority[idx] == Priority::Idle {
                self.channels[idx].reset_pid();
            }
            self.last_priority[idx] = sub.priority;
            self.channels[idx].set_target(position, sub.pose.duration());
        }
    }

    /// 推进所有通道一步，返回本 tick 的输出
    pub fn tick(&mut self, dt: Duration) -> [(ChannelId, f64); ChannelId::COUNT] {
        self.ticks += 1;
        let mut out = [(ChannelId::HeadNod, 0.0); ChannelId::COUNT];
        for (slot, channel) in out.iter_mut().zip(self.channels.iter_mut()) {
            *slot = (channel.id(), channel.tick(dt));
        }
        out
    }

    /// 硬件没有接受本 tick 输出时，把通道退回到上一次写成功的位置
    pub fn hold(&mut self, channel: ChannelId, position: f64) {
        self.channels[channel.index()].hold(position);
    }

    /// 所有通道立即置于安全姿态，清除 PID 状态
    pub fn stop(&mut self) {
        for channel in &mut self.channels {
            let neutral = channel.bounds().neutral;
            channel.hard_set(neutral);
        }
        self.last_priority = [Priority::Idle; ChannelId::COUNT];
        self.stop_epoch += 1;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (claimed, gesturing, speaking) = {
            let table = lock(&self.claims);
            (
                table.claimed(),
                table.has_priority(Priority::Gesture),
                table.has_priority(Priority::Speech),
            )
        };
        let eps = self.settings.settle_epsilon;
        let mut positions = [0.0; ChannelId::COUNT];
        let mut targets = [0.0; ChannelId::COUNT];
        for channel in &self.channels {
            positions[channel.id().index()] = channel.position();
            targets[channel.id().index()] = channel.target();
        }
        let at_rest = self.channels.iter().all(|c| {
            c.ramp_finished() && (c.position() - c.bounds().neutral).abs() <= eps
        });
        StatusSnapshot {
            tick: self.ticks,
            phase: RobotPhase::from_flags(gesturing, speaking),
            positions,
            targets,
            claimed,
            at_rest,
            stop_epoch: self.stop_epoch,
        }
    }

    /// 启动控制环任务，返回生产者句柄与任务句柄
    ///
    /// `exit` 取消后控制环写入安全姿态、关闭驱动并退出；
    /// `terminating` 表示进程正在退出，此时同步等待超时会退化为 stop_all。
    pub fn spawn(
        self,
        driver: Box<dyn HardwareDriver>,
        library: Arc<GestureLibrary>,
        animator: SpeechAnimator,
        exit: CancellationToken,
        terminating: CancellationToken,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(self.snapshot());
        let shared = Arc::new(Shared {
            tx,
            claims: Arc::clone(&self.claims),
            stop_requested: AtomicBool::new(false),
            status: status_rx,
            calibration: Arc::clone(&self.calibration),
            library,
            animator,
            settings: self.settings.clone(),
            terminating,
        });
        let handle = SchedulerHandle {
            shared: Arc::clone(&shared),
        };
        let join = tokio::spawn(run_loop(self, driver, rx, shared, status_tx, exit));
        (handle, join)
    }
}

async fn run_loop(
    mut core: MotionScheduler,
    mut driver: Box<dyn HardwareDriver>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    status_tx: watch::Sender<StatusSnapshot>,
    exit: CancellationToken,
) {
    let period = core.period();
    let policy = ErrorPolicy::new();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();
    let mut last_good = [0.0; ChannelId::COUNT];
    for channel in &core.channels {
        last_good[channel.id().index()] = channel.position();
    }

    tracing::info!("Motion scheduler running at {} Hz", core.settings.tick_hz);

    loop {
        tokio::select! {
            biased;
            _ = exit.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let dt = now.saturating_duration_since(last).min(period * 3);
        last = now;

        if shared.stop_requested.swap(false, Ordering::AcqRel) {
            let mut discarded = 0usize;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            core.stop();
            tracing::info!("Safe pose commanded ({} pending submissions discarded)", discarded);
        } else {
            let mut batch = Vec::new();
            while let Ok(msg) = rx.try_recv() {
                batch.push(msg);
            }
            core.apply(batch);
        }

        let outputs = core.tick(dt);
        let failed = driver.write_batch(&outputs);
        for &(channel, position) in &outputs {
            if !failed.iter().any(|(c, _)| *c == channel) {
                last_good[channel.index()] = position;
            }
        }
        // 失败的通道保持上一次成功输出，下一 tick 从那里重试
        for (channel, e) in failed {
            core.hold(channel, last_good[channel.index()]);
            policy.report(&MotionError::from(e));
        }
        status_tx.send_replace(core.snapshot());
    }

    core.stop();
    let outputs = core.tick(Duration::ZERO);
    for (_, e) in driver.write_batch(&outputs) {
        policy.report(&MotionError::from(e));
    }
    status_tx.send_replace(core.snapshot());
    driver.close();
    tracing::info!("Motion scheduler stopped after {} ticks", core.ticks);
}

struct Shared {
    tx: mpsc::UnboundedSender<Message>,
    claims: Arc<Mutex<ClaimTable>>,
    stop_requested: AtomicBool,
    status: watch::Receiver<StatusSnapshot>,
    calibration: Arc<Calibration>,
    library: Arc<GestureLibrary>,
    animator: SpeechAnimator,
    settings: SchedulerSection,
    terminating: CancellationToken,
}

/// 调度器句柄：可克隆，交给所有生产者任务
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    pub fn submit(
        &self,
        priority: Priority,
        claim: Option<ClaimId>,
        pose: PoseVector,
    ) -> Result<(), MotionError> {
        if pose.is_empty() {
            return Ok(());
        }
        self.shared
            .tx
            .send(Message::Pose(Submission {
                priority,
                claim,
                pose,
            }))
            .map_err(|_| MotionError::SchedulerClosed)
    }

    pub fn submit_idle(&self, pose: PoseVector) -> Result<(), MotionError> {
        self.submit(Priority::Idle, None, pose)
    }

    /// 声明通道所有权；与任何进行中的租约有交集时返回 SchedulerBusy
    pub fn claim(&self, priority: Priority, channels: ChannelSet) -> Result<ClaimGuard, MotionError> {
        let (id, cancel) = lock(&self.shared.claims).acquire(priority, channels)?;
        Ok(ClaimGuard {
            id,
            channels,
            cancel,
            tx: self.shared.tx.clone(),
            claims: Arc::clone(&self.shared.claims),
        })
    }

    /// 是否有手势或语音在进行
    pub fn is_animating(&self) -> bool {
        !lock(&self.shared.claims).claimed().is_empty()
    }

    pub fn claimed(&self) -> ChannelSet {
        lock(&self.shared.claims).claimed()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.status.clone()
    }

    pub fn calibration(&self) -> &Arc<Calibration> {
        &self.shared.calibration
    }

    pub fn library(&self) -> &Arc<GestureLibrary> {
        &self.shared.library
    }

    pub fn period(&self) -> Duration {
        self.shared.settings.period()
    }

    pub fn is_terminating(&self) -> bool {
        self.shared.terminating.is_cancelled()
    }

    /// 异步播放手势，立即返回；完成情况通过 AnimationHandle 观察
    pub fn play_gesture(&self, name: &str) -> Result<AnimationHandle, MotionError> {
        self.play_gesture_on(name, ChannelSet::all())
    }

    /// 只在给定通道集合上播放手势
    pub fn play_gesture_on(
        &self,
        name: &str,
        on: ChannelSet,
    ) -> Result<AnimationHandle, MotionError> {
        let gesture = self.shared.library.get(name)?;
        let channels = gesture.channels().intersection(on);
        let guard = self.claim(Priority::Gesture, channels)?;
        let cancel = guard.token();
        let scheduler = self.clone();
        let task_cancel = cancel.clone();
        tracing::debug!("Playing gesture '{}' on {}", gesture.name(), channels);
        let join = tokio::spawn(async move {
            let result = gesture
                .play(&scheduler, Priority::Gesture, Some(guard.id()), channels, &task_cancel)
                .await;
            drop(guard);
            result
        });
        Ok(AnimationHandle {
            channels,
            cancel,
            join,
            scheduler: self.clone(),
        })
    }

    /// 同步播放：阻塞直到完成或超时（配置的 wait_timeout）
    pub async fn play_gesture_sync(&self, name: &str) -> Result<(), MotionError> {
        self.play_gesture(name)?
            .wait_timeout(self.shared.settings.wait_timeout())
            .await
    }

    /// 以手势优先级占用姿态涉及的通道并移动，到位（过渡结束且误差小于 settle_epsilon）后释放
    pub fn move_to(&self, pose: PoseVector) -> Result<AnimationHandle, MotionError> {
        let channels = pose.channels();
        let guard = self.claim(Priority::Gesture, channels)?;
        let cancel = guard.token();
        let task_cancel = cancel.clone();
        let scheduler = self.clone();
        let join = tokio::spawn(async move {
            let mut rx = scheduler.subscribe();
            let ramp = pose.duration().unwrap_or_default();
            let eps = scheduler.shared.settings.settle_epsilon;
            // 提交之后的第二个 tick 一定已经取走这次提交
            let applied_at = rx.borrow_and_update().tick + 2;
            scheduler.submit(Priority::Gesture, Some(guard.id()), pose)?;
            let started = Instant::now();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(MotionError::SchedulerClosed);
                        }
                    }
                    _ = task_cancel.cancelled() => break,
                }
                let status = rx.borrow_and_update().clone();
                let settled = channels
                    .iter()
                    .all(|c| (status.position(c) - status.target(c)).abs() <= eps);
                if status.tick >= applied_at && started.elapsed() >= ramp && settled {
                    break;
                }
            }
            drop(guard);
            Ok(())
        });
        Ok(AnimationHandle {
            channels,
            cancel,
            join,
            scheduler: self.clone(),
        })
    }

    /// 同步移动：阻塞直到到位或超时
    pub async fn move_to_sync(&self, pose: PoseVector) -> Result<(), MotionError> {
        self.move_to(pose)?
            .wait_timeout(self.shared.settings.wait_timeout())
            .await
    }

    /// 播放口型事件流；语音只占用嘴唇通道
    pub fn speak(&self, events: VisemeStream) -> Result<AnimationHandle, MotionError> {
        let guard = self.claim(Priority::Speech, ChannelSet::LIPS)?;
        let cancel = guard.token();
        let task_cancel = cancel.clone();
        let scheduler = self.clone();
        let animator = self.shared.animator.clone();
        let join = tokio::spawn(async move {
            let report = animator
                .run(events, &scheduler, guard.id(), &task_cancel)
                .await;
            drop(guard);
            report.map(|r| {
                tracing::debug!("Speech finished: {} played, {} dropped", r.played, r.dropped);
            })
        });
        Ok(AnimationHandle {
            channels: ChannelSet::LIPS,
            cancel,
            join,
            scheduler: self.clone(),
        })
    }

    /// 唯一的取消点：取消所有手势/语音，下一 tick 所有通道回到安全姿态。
    /// 不阻塞、不等待，可在信号处理路径中调用。
    pub fn stop_all(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        let cancelled = lock(&self.shared.claims).cancel_all();
        tracing::info!("stop_all requested ({} animations cancelled)", cancelled);
    }

    /// stop_all 并等待调度器确认已执行（上限 stop_timeout）
    pub async fn stop_all_and_wait(&self) -> Result<(), MotionError> {
        let mut rx = self.subscribe();
        let epoch = rx.borrow().stop_epoch;
        self.stop_all();
        let timeout = self.shared.settings.stop_timeout();
        let wait = async {
            loop {
                if rx.borrow_and_update().stop_epoch > epoch {
                    return Ok(());
                }
                rx.changed()
                    .await
                    .map_err(|_| MotionError::SchedulerClosed)?;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MotionError::Timeout(timeout))?
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("claimed", &self.claimed())
            .finish()
    }
}

/// 进行中的手势/语音
#[derive(Debug)]
pub struct AnimationHandle {
    channels: ChannelSet,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), MotionError>>,
    scheduler: SchedulerHandle,
}

impl AnimationHandle {
    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<(), MotionError> {
        self.join.await.map_err(|_| MotionError::SchedulerClosed)?
    }

    /// 限时等待；超时则取消该动画，若进程正在退出则退化为 stop_all
    pub async fn wait_timeout(mut self, timeout: Duration) -> Result<(), MotionError> {
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(joined) => joined.map_err(|_| MotionError::SchedulerClosed)?,
            Err(_) => {
                self.cancel.cancel();
                if self.scheduler.is_terminating() {
                    self.scheduler.stop_all();
                }
                Err(MotionError::Timeout(timeout))
            }
        }
    }
}
