//! 运动核心集成测试：调度器 + 模拟驱动 + 手势/口型/待机，全部在暂停的 tokio 时钟下运行

use std::sync::Arc;
use std::time::Duration;

use blinkalot::config::{AppConfig, SchedulerSection, SpeechSection};
use blinkalot::core::{
    create_robot, create_robot_with_source, MotionError, RobotCleanup, RobotPhase,
    ShutdownCoordinator,
};
use blinkalot::gesture::GestureLibrary;
use blinkalot::hardware::simulated::default_calibration;
use blinkalot::hardware::{DriverProbe, SimulatedDriver};
use blinkalot::idle::{BehaviorWeights, IdleGenerator};
use blinkalot::motion::{
    ChannelId, ChannelSet, MotionScheduler, PidGains, PoseVector, Priority, SchedulerHandle,
};
use blinkalot::speech::{
    timeline_stream, SpeechAnimator, SpeechError, SpeechReport, SpeechSource, Viseme,
    VisemeEvent, VisemeStream,
};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

struct Rig {
    handle: SchedulerHandle,
    probe: DriverProbe,
    exit: CancellationToken,
    join: JoinHandle<()>,
}

fn rig_with(settings: SchedulerSection) -> Rig {
    let cfg = AppConfig::default();
    let driver = SimulatedDriver::new();
    let probe = driver.probe();
    let specs = cfg.resolve_channels(&default_calibration()).unwrap();
    let core = MotionScheduler::new(&specs, settings).unwrap();
    let calibration = Arc::clone(core.calibration());
    let library = Arc::new(GestureLibrary::builtin(&calibration));
    let animator = SpeechAnimator::new(calibration, &cfg.speech);
    let exit = CancellationToken::new();
    let (handle, join) = core.spawn(
        Box::new(driver),
        library,
        animator,
        exit.clone(),
        CancellationToken::new(),
    );
    Rig {
        handle,
        probe,
        exit,
        join,
    }
}

fn rig() -> Rig {
    rig_with(SchedulerSection::default())
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn speech(events: &[(u64, Viseme)]) -> VisemeStream {
    timeline_stream(
        events
            .iter()
            .map(|&(at, v)| VisemeEvent::new(ms(at), v, 1.0))
            .collect(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_gestures_are_rejected() {
    let rig = rig();
    let h = &rig.handle;

    let nod = h.play_gesture("nod").unwrap();
    let err = h.play_gesture("nod").unwrap_err();
    assert!(matches!(err, MotionError::SchedulerBusy { channels } if channels.contains(ChannelId::HeadNod)));
    // excite 也用 head_nod
    assert!(matches!(
        h.play_gesture("excite"),
        Err(MotionError::SchedulerBusy { .. })
    ));

    nod.wait().await.unwrap();
    sleep(h.period() * 2).await;
    assert!(h.claimed().is_empty());
    h.play_gesture("nod").unwrap().wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_gesture_and_speech_share_the_head() {
    let rig = rig();
    let h = &rig.handle;

    let shake = h.play_gesture("shake").unwrap();
    let talk = h
        .speak(speech(&[(0, Viseme::Open), (200, Viseme::Round), (600, Viseme::Rest)]))
        .unwrap();
    assert_eq!(h.claimed(), ChannelSet::of(&[ChannelId::HeadTurn]).union(ChannelSet::LIPS));

    sleep(ms(100)).await;
    let status = h.status();
    assert_eq!(status.phase, RobotPhase::GesturingAndSpeaking);
    assert!(status.position(ChannelId::HeadTurn) > 1.0);
    assert!(status.position(ChannelId::TopLip) > 1.0);

    // 语音进行中再开口被拒绝
    assert!(matches!(
        h.speak(speech(&[(0, Viseme::Open)])),
        Err(MotionError::SchedulerBusy { .. })
    ));

    shake.wait().await.unwrap();
    talk.wait().await.unwrap();
    sleep(ms(500)).await;
    let status = h.status();
    assert_eq!(status.phase, RobotPhase::Idle);
    // 说完闭嘴
    assert!(status.position(ChannelId::TopLip).abs() < 0.5);
    assert!(status.position(ChannelId::BottomLip).abs() < 0.5);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_gesture_has_no_side_effects() {
    let rig = rig();
    let h = &rig.handle;

    let err = h.play_gesture("wave").unwrap_err();
    assert_eq!(err, MotionError::GestureNotFound("wave".into()));
    assert!(h.claimed().is_empty());

    sleep(ms(200)).await;
    for channel in ChannelId::ALL {
        assert_eq!(rig.probe.position(channel), Some(0.0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_reaches_safe_pose_within_one_tick() {
    let rig = rig();
    let h = &rig.handle;

    let nod = h.play_gesture("nod").unwrap();
    let talk = h.speak(speech(&[(0, Viseme::Open), (2000, Viseme::Rest)])).unwrap();
    h.submit_idle(PoseVector::new().with(ChannelId::EyeTurn, 10.0)).unwrap();
    sleep(ms(200)).await;
    assert!(h.status().position(ChannelId::HeadNod) > 5.0);

    let started = Instant::now();
    h.stop_all_and_wait().await.unwrap();
    assert!(started.elapsed() <= h.period());
    assert!(h.claimed().is_empty());

    let status = h.status();
    assert!(status.at_rest);
    assert_eq!(status.phase, RobotPhase::Idle);
    for channel in ChannelId::ALL {
        assert_eq!(rig.probe.position(channel), Some(0.0), "{channel}");
    }

    // 被取消的动画正常结束，之后不再移动嘴唇
    nod.wait().await.unwrap();
    talk.wait().await.unwrap();
    sleep(ms(300)).await;
    assert_eq!(rig.probe.position(ChannelId::TopLip), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_hardware_faults_only_skip_ticks() {
    let rig = rig();
    let h = &rig.handle;

    sleep(ms(40)).await;
    let before = rig.probe.batches();
    // 三个 tick 的全部写入失败
    rig.probe.fail_next_writes(3 * ChannelId::COUNT as u32);
    h.submit_idle(PoseVector::new().with(ChannelId::HeadTurn, 20.0)).unwrap();

    sleep(ms(1000)).await;
    assert!(rig.probe.batches() >= before + 40);
    let turn = rig.probe.position(ChannelId::HeadTurn).unwrap();
    assert!((turn - 20.0).abs() < 1.0, "head_turn at {turn}");
    assert!(!rig.join.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_idle_is_dormant_while_animating() {
    let rig = rig();
    let h = &rig.handle;

    let settings = blinkalot::config::IdleSection::default();
    let generator = IdleGenerator::new(
        BehaviorWeights::default(),
        Arc::clone(h.calibration()),
        settings,
    )
    .with_seed(11);

    let guard = h.claim(Priority::Gesture, ChannelSet::all()).unwrap();
    let cancel = CancellationToken::new();
    let idle = tokio::spawn(generator.run(h.clone(), cancel.clone()));

    sleep(ms(5000)).await;
    for channel in ChannelId::ALL {
        assert_eq!(h.status().position(channel), 0.0, "{channel}");
    }

    drop(guard);
    sleep(ms(10_000)).await;
    let status = h.status();
    let moved = [ChannelId::HeadNod, ChannelId::HeadTurn, ChannelId::EyeTurn, ChannelId::EyeTilt]
        .into_iter()
        .any(|c| status.position(c).abs() > 1e-6);
    assert!(moved);
    // 待机从不碰嘴唇
    assert_eq!(status.position(ChannelId::TopLip), 0.0);

    cancel.cancel();
    idle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_late_viseme_events_are_dropped() {
    let rig = rig();
    let h = &rig.handle;
    let animator = SpeechAnimator::new(Arc::clone(h.calibration()), &SpeechSection::default());

    // 第二个事件在 300ms 才到达，而它的时间戳是 100ms
    let events = vec![
        (0u64, VisemeEvent::new(ms(0), Viseme::Open, 1.0)),
        (300, VisemeEvent::new(ms(100), Viseme::Wide, 1.0)),
        (0, VisemeEvent::new(ms(400), Viseme::Round, 1.0)),
    ];
    let stream: VisemeStream = Box::pin(futures_util::stream::iter(events).then(
        |(delay, event)| async move {
            sleep(ms(delay)).await;
            event
        },
    ));

    let guard = h.claim(Priority::Speech, ChannelSet::LIPS).unwrap();
    let report = animator
        .run(stream, h, guard.id(), &guard.token())
        .await
        .unwrap();
    assert_eq!(
        report,
        SpeechReport {
            played: 2,
            dropped: 1
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_sync_gesture_times_out_and_cancels() {
    let rig = rig_with(SchedulerSection {
        wait_timeout_ms: 100,
        ..SchedulerSection::default()
    });
    let h = &rig.handle;

    let err = h.play_gesture_sync("nod").await.unwrap_err();
    assert_eq!(err, MotionError::Timeout(ms(100)));

    sleep(h.period() * 3).await;
    assert!(h.claimed().is_empty());
    // 超时不是 stop_all
    assert!(!h.is_terminating());
}

#[tokio::test(start_paused = true)]
async fn test_quick_reversal_has_no_overshoot() {
    let rig = rig();
    let h = &rig.handle;
    let mut rx = h.subscribe();

    h.submit_idle(PoseVector::new().with(ChannelId::HeadNod, 10.0).over(ms(300)))
        .unwrap();
    let reverse_at = Instant::now() + ms(150);
    let mut reversed = false;
    let mut highest = f64::MIN;
    let mut lowest = f64::MAX;
    let deadline = Instant::now() + ms(1500);

    while Instant::now() < deadline {
        rx.changed().await.unwrap();
        let nod = rx.borrow_and_update().position(ChannelId::HeadNod);
        highest = highest.max(nod);
        lowest = lowest.min(nod);
        if !reversed && Instant::now() >= reverse_at {
            h.submit_idle(PoseVector::new().with(ChannelId::HeadNod, -10.0).over(ms(300)))
                .unwrap();
            reversed = true;
        }
    }

    assert!(highest < 10.0);
    assert!(lowest >= -10.25, "undershoot to {lowest}");
    assert!((h.status().position(ChannelId::HeadNod) + 10.0).abs() < 0.25);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_exit_closes_driver_at_safe_pose() {
    let rig = rig();
    rig.handle
        .submit_idle(PoseVector::new().with(ChannelId::EyeTilt, -12.0))
        .unwrap();
    sleep(ms(500)).await;
    assert!(rig.probe.position(ChannelId::EyeTilt).unwrap() < -10.0);

    rig.exit.cancel();
    rig.join.await.unwrap();
    assert!(rig.probe.is_closed());
    assert_eq!(rig.probe.position(ChannelId::EyeTilt), Some(0.0));
}

#[tokio::test(start_paused = true)]
async fn test_robot_say_with_intent_then_shutdown() {
    let driver = SimulatedDriver::new();
    let probe = driver.probe();
    let robot = create_robot(&AppConfig::default(), Box::new(driver), CancellationToken::new())
        .unwrap();

    assert!(robot.say("Yes, absolutely!", None, None).await.unwrap());
    let claimed = robot.handle().claimed();
    assert!(claimed.contains(ChannelId::HeadNod));
    assert!(claimed.intersects(ChannelSet::LIPS));

    // 打断：新的一句话替换旧的口型
    assert!(robot.say("hmm", None, None).await.unwrap());
    sleep(ms(50)).await;
    assert!(robot.handle().claimed().intersects(ChannelSet::LIPS));

    robot.shutdown().await;
    assert!(probe.is_closed());
    for channel in ChannelId::ALL {
        assert_eq!(probe.position(channel), Some(0.0), "{channel}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_robot_rejects_missing_calibration() {
    let driver = SimulatedDriver::new().with_calibration(
        default_calibration()
            .into_iter()
            .filter(|(c, _)| *c != ChannelId::EyeTilt)
            .collect(),
    );
    let err = create_robot(&AppConfig::default(), Box::new(driver), CancellationToken::new())
        .err()
        .unwrap();
    assert!(matches!(err, MotionError::Calibration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_blocking_move_returns_when_settled() {
    let rig = rig();
    let h = &rig.handle;

    let started = Instant::now();
    h.move_to_sync(PoseVector::new().with(ChannelId::EyeTurn, 15.0).over(ms(200)))
        .await
        .unwrap();
    assert!(started.elapsed() >= ms(200));
    assert!((h.status().position(ChannelId::EyeTurn) - 15.0).abs() <= 0.25);

    // 非阻塞版本立即返回，移动期间占用通道
    let moving = h
        .move_to(PoseVector::new().with(ChannelId::EyeTurn, -15.0).over(ms(300)))
        .unwrap();
    assert!(matches!(
        h.move_to(PoseVector::new().with(ChannelId::EyeTurn, 0.0)),
        Err(MotionError::SchedulerBusy { .. })
    ));
    moving.wait().await.unwrap();
    sleep(h.period() * 2).await;
    assert!(h.claimed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_gesture_waits_for_the_first() {
    let rig = rig();
    let h = &rig.handle;

    let nod = h.play_gesture("nod").unwrap();
    // shake 只用 head_turn，与 nod 不重叠，仍然被拒绝
    assert!(matches!(
        h.play_gesture("shake"),
        Err(MotionError::SchedulerBusy { .. })
    ));
    let talk = h.speak(speech(&[(0, Viseme::Open), (300, Viseme::Rest)])).unwrap();

    nod.wait().await.unwrap();
    sleep(h.period() * 2).await;
    h.play_gesture("shake").unwrap().wait().await.unwrap();
    talk.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_write_fault_holds_last_output() {
    let rig = rig();
    let h = &rig.handle;
    let max_step = PidGains::default().max_rate * h.period().as_secs_f64() + 1e-6;
    let mut status = h.subscribe();

    h.submit_idle(PoseVector::new().with(ChannelId::HeadTurn, 40.0)).unwrap();
    sleep(ms(60)).await;
    // 移动途中连续 5 个 tick 的全部写入失败
    rig.probe.fail_next_writes(5 * ChannelId::COUNT as u32);

    let mut prev = rig.probe.position(ChannelId::HeadTurn).unwrap();
    assert!(prev > 0.0 && prev < 40.0);
    for _ in 0..100 {
        status.changed().await.unwrap();
        let now = rig.probe.position(ChannelId::HeadTurn).unwrap();
        assert!((now - prev).abs() <= max_step, "servo jumped {prev} -> {now}");
        prev = now;
    }
    assert!((prev - 40.0).abs() < 1.0, "head_turn at {prev}");
}

#[tokio::test(start_paused = true)]
async fn test_robot_rejects_invalid_tick_rate() {
    for tick_hz in [0, 5, 100_000] {
        let mut cfg = AppConfig::default();
        cfg.scheduler.tick_hz = tick_hz;
        let driver = SimulatedDriver::new();
        let probe = driver.probe();
        let err = create_robot(&cfg, Box::new(driver), CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, MotionError::Config(_)), "tick_hz {tick_hz}: {err}");
        assert_eq!(probe.batches(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_robot_cleanup_parks_head_and_stays_put() {
    let driver = SimulatedDriver::new();
    let probe = driver.probe();
    let robot = Arc::new(
        create_robot(&AppConfig::default(), Box::new(driver), CancellationToken::new()).unwrap(),
    );
    // 让待机行为先动起来
    sleep(ms(4000)).await;
    robot.handle().play_gesture("nod").unwrap();
    sleep(ms(100)).await;

    let mut coordinator = ShutdownCoordinator::new().with_timeout(2);
    coordinator.register(RobotCleanup::new(Arc::clone(&robot)));
    coordinator.run_cleanup().await;

    assert!(probe.is_closed());
    for channel in ChannelId::ALL {
        assert_eq!(probe.position(channel), Some(0.0), "{channel}");
    }
    let writes = probe.writes();
    sleep(ms(3000)).await;
    assert_eq!(probe.writes(), writes);
}

struct OfflineSource;

#[async_trait::async_trait]
impl SpeechSource for OfflineSource {
    async fn timeline(&self, _text: &str) -> Result<VisemeStream, SpeechError> {
        Err(SpeechError::Unavailable("tts offline".into()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_speech_source_failure_skips_lips() {
    let robot = create_robot_with_source(
        &AppConfig::default(),
        Box::new(SimulatedDriver::new()),
        Arc::new(OfflineSource),
        CancellationToken::new(),
    )
    .unwrap();

    assert!(!robot.say("hello there", None, None).await.unwrap());
    assert!(!robot.handle().claimed().intersects(ChannelSet::LIPS));

    // 外部给出的时间线不经过语音源
    let events = vec![VisemeEvent::new(ms(0), Viseme::Open, 1.0)];
    assert!(robot.say("hello", None, Some(events)).await.unwrap());
    robot.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_same_gesture_plays_from_two_tasks() {
    let rig = rig();
    let nod = rig.handle.library().get("nod").unwrap();
    let total = nod.total_duration();

    let run = |delay: Duration| {
        let h = rig.handle.clone();
        let nod = Arc::clone(&nod);
        tokio::spawn(async move {
            sleep(delay).await;
            let started = Instant::now();
            nod.play(&h, Priority::Idle, None, nod.channels(), &CancellationToken::new())
                .await
                .map(|_| started.elapsed())
        })
    };
    let first = run(Duration::ZERO);
    let second = run(ms(300));

    // 各自从第一步播放到最后一步，互不推进对方的进度
    for elapsed in [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()] {
        assert!(elapsed >= total && elapsed < total + ms(20), "{elapsed:?}");
    }
    assert_eq!(nod.steps().len(), 3);
    assert_eq!(nod.total_duration(), total);
}
