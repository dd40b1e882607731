//! 机器人编排器：主控循环
//!
//! 负责：读取驱动标定、创建调度器/手势库/口型动画/待机行为，
//! 并在后台任务中消费外部命令（Say/Gesture/Intent/Stop/Quit）。

use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{MotionError, ShutdownManager, ShutdownReason, StatusSnapshot};
use crate::gesture::{GestureLibrary, Intent};
use crate::hardware::HardwareDriver;
use crate::idle::IdleGenerator;
use crate::motion::{AnimationHandle, ChannelSet, MotionScheduler, SchedulerHandle};
use crate::speech::{
    timeline_stream, BabbleSource, SpeechAnimator, SpeechSource, TextVisemeSource, VisemeEvent,
};

/// 外部（对话层 / 标准输入）发往编排器的命令
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// 说一句话：可选情绪意图，可选外部 TTS 给出的口型时间线
    Say {
        text: String,
        #[serde(default)]
        intent: Option<Intent>,
        #[serde(default)]
        visemes: Option<Vec<VisemeEvent>>,
    },
    Gesture {
        name: String,
    },
    Intent {
        intent: Intent,
    },
    /// 立即停止所有动画
    Stop,
    Quit,
}

impl Command {
    /// 解析一行输入：JSON 命令、`/名称` 快捷命令，其余视为要说的话
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.starts_with('{') {
            return match serde_json::from_str(line) {
                Ok(cmd) => Some(cmd),
                Err(e) => {
                    tracing::warn!("Invalid command JSON: {}", e);
                    None
                }
            };
        }
        if let Some(name) = line.strip_prefix('/') {
            return Some(match name.trim() {
                "stop" => Command::Stop,
                "quit" | "exit" => Command::Quit,
                other => Command::Gesture {
                    name: other.to_string(),
                },
            });
        }
        Some(Command::Say {
            text: line.to_string(),
            intent: None,
            visemes: None,
        })
    }
}

/// 运行中的机器人：调度器句柄 + 后台任务
pub struct Robot {
    config: AppConfig,
    scheduler: SchedulerHandle,
    source: Arc<dyn SpeechSource>,
    current_speech: Mutex<Option<AnimationHandle>>,
    idle_cancel: CancellationToken,
    exit: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// 创建机器人运行时：读取标定并启动控制环与待机行为
///
/// 配置非法时返回 Config，标定缺失或非法时返回 CalibrationError，此时不会启动任何任务。
pub fn create_robot(
    cfg: &AppConfig,
    driver: Box<dyn HardwareDriver>,
    terminating: CancellationToken,
) -> Result<Robot, MotionError> {
    let cps = cfg.speech.chars_per_second;
    let source: Arc<dyn SpeechSource> = if cfg.speech.babble {
        Arc::new(BabbleSource::new(cps))
    } else {
        Arc::new(TextVisemeSource::new(cps))
    };
    create_robot_with_source(cfg, driver, source, terminating)
}

/// 同 create_robot，但使用外部提供的口型时间线来源（例如接入 TTS）
pub fn create_robot_with_source(
    cfg: &AppConfig,
    driver: Box<dyn HardwareDriver>,
    source: Arc<dyn SpeechSource>,
    terminating: CancellationToken,
) -> Result<Robot, MotionError> {
    cfg.validate()?;
    let report = driver
        .read_calibration()
        .map_err(|e| MotionError::Calibration(e.to_string()))?;
    let specs = cfg.resolve_channels(&report)?;
    let weights = cfg.idle.weights()?;

    let mut core = MotionScheduler::new(&specs, cfg.scheduler.clone())?;
    // 启动时先回到安全姿态：第一个 tick 就写出中位
    core.stop();
    let calibration = Arc::clone(core.calibration());
    let library = Arc::new(GestureLibrary::builtin(&calibration));
    let animator = SpeechAnimator::new(Arc::clone(&calibration), &cfg.speech);
    tracing::info!("Gestures loaded: {}", library.names().join(", "));

    let exit = CancellationToken::new();
    let (scheduler, loop_task) = core.spawn(driver, library, animator, exit.clone(), terminating);

    let idle_cancel = CancellationToken::new();
    let generator = IdleGenerator::new(weights, calibration, cfg.idle.clone());
    let idle_task = tokio::spawn(generator.run(scheduler.clone(), idle_cancel.clone()));

    Ok(Robot {
        config: cfg.clone(),
        scheduler,
        source,
        current_speech: Mutex::new(None),
        idle_cancel,
        exit,
        tasks: Mutex::new(vec![loop_task, idle_task]),
    })
}

impl Robot {
    pub fn handle(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn status(&self) -> StatusSnapshot {
        self.scheduler.status()
    }

    pub async fn handle_command(&self, cmd: Command) -> Result<(), MotionError> {
        match cmd {
            Command::Say {
                text,
                intent,
                visemes,
            } => self.say(&text, intent, visemes).await.map(|_| ()),
            Command::Gesture { name } => self.scheduler.play_gesture(&name).map(|_| ()),
            Command::Intent { intent } => {
                self.scheduler.play_gesture(intent.gesture_name()).map(|_| ())
            }
            Command::Stop => {
                self.take_speech();
                self.scheduler.stop_all();
                Ok(())
            }
            Command::Quit => Ok(()),
        }
    }

    /// 说话：先按意图播放手势（嘴唇以外的通道），再播放口型
    ///
    /// 新的语音会打断正在进行的语音。返回是否开始了口型播放（语音源失败时只记录日志）。
    pub async fn say(
        &self,
        text: &str,
        intent: Option<Intent>,
        visemes: Option<Vec<VisemeEvent>>,
    ) -> Result<bool, MotionError> {
        if let Some(intent) = intent.or_else(|| Intent::detect(text)) {
            match self.scheduler.play_gesture(intent.gesture_name()) {
                Ok(_) => tracing::info!("Intent {:?} -> gesture '{}'", intent, intent.gesture_name()),
                Err(e @ MotionError::SchedulerBusy { .. }) => {
                    tracing::warn!("Skipping {:?} gesture: {}", intent, e)
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(previous) = self.take_speech() {
            previous.cancel();
            let _ = previous.wait().await;
            self.wait_lips_free().await;
        }

        let stream = match visemes {
            Some(events) => timeline_stream(events),
            None => match self.source.timeline(text).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Speech source failed: {}", e);
                    return Ok(false);
                }
            },
        };

        let handle = self.scheduler.speak(stream)?;
        *self.current_speech.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(true)
    }

    fn take_speech(&self) -> Option<AnimationHandle> {
        self.current_speech
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// 旧语音的释放消息要等下一 tick 才生效
    async fn wait_lips_free(&self) {
        let mut rx = self.scheduler.subscribe();
        let wait = async {
            loop {
                if !rx.borrow_and_update().claimed.intersects(ChannelSet::LIPS) {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(self.config.scheduler.stop_timeout(), wait).await;
    }

    /// 停止待机、回到安全姿态、关闭控制环与驱动
    pub async fn shutdown(&self) {
        self.idle_cancel.cancel();
        if let Some(speech) = self.take_speech() {
            speech.cancel();
        }
        if let Err(e) = self.scheduler.stop_all_and_wait().await {
            tracing::warn!("Safe pose not confirmed before exit: {}", e);
        }
        self.exit.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        tracing::info!("Robot stopped");
    }
}

/// 启动命令消费循环；Quit 或发送端关闭时触发关闭
pub fn spawn_command_loop(
    robot: Arc<Robot>,
    shutdown: Arc<ShutdownManager>,
) -> mpsc::UnboundedSender<Command> {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Quit) | None => {
                            shutdown.shutdown(ShutdownReason::UserInitiated);
                            break;
                        }
                        Some(cmd) => {
                            tracing::debug!("Command: {:?}", cmd);
                            if let Err(e) = robot.handle_command(cmd).await {
                                tracing::warn!("Command failed: {}", e);
                            }
                        }
                    }
                }
                _ = shutdown.wait_for_shutdown() => break,
            }
        }
    });

    cmd_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::Viseme;

    #[test]
    fn test_parse_plain_text_is_say() {
        assert_eq!(
            Command::parse("  hello there "),
            Some(Command::Say {
                text: "hello there".into(),
                intent: None,
                visemes: None,
            })
        );
        assert_eq!(Command::parse("   "), None);
    }

    #[test]
    fn test_parse_shortcuts() {
        assert_eq!(Command::parse("/stop"), Some(Command::Stop));
        assert_eq!(Command::parse("/quit"), Some(Command::Quit));
        assert_eq!(
            Command::parse("/nod"),
            Some(Command::Gesture { name: "nod".into() })
        );
    }

    #[test]
    fn test_parse_json() {
        let cmd = Command::parse(
            r#"{"type": "say", "text": "hi", "intent": "excite", "visemes": [{"at_ms": 0, "viseme": "open", "amplitude": 0.8}]}"#,
        )
        .unwrap();
        match cmd {
            Command::Say {
                text,
                intent,
                visemes,
            } => {
                assert_eq!(text, "hi");
                assert_eq!(intent, Some(Intent::Excite));
                let visemes = visemes.unwrap();
                assert_eq!(visemes[0].viseme, Viseme::Open);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            Command::parse(r#"{"type": "intent", "intent": "think"}"#),
            Some(Command::Intent {
                intent: Intent::Think
            })
        );
        assert_eq!(Command::parse(r#"{"type": "dance"}"#), None);
    }
}
