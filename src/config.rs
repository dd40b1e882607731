//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BLINK__*` 覆盖（双下划线表示嵌套，如 `BLINK__IDLE__BLINK_PROBABILITY=0.5`）。
//! 启动时加载一次，之后不可变。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::MotionError;
use crate::idle::BehaviorWeights;
use crate::motion::{Bounds, Calibration, ChannelId, PidGains};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerSection,
    /// 所有通道共享的默认 PID 增益
    pub pid: PidGains,
    /// [channels.<name>]：标定范围、引脚与增益覆盖
    pub channels: BTreeMap<String, ChannelEntry>,
    pub idle: IdleSection,
    pub speech: SpeechSection,
}

/// [scheduler] 段：控制环频率与各类等待超时
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// 同步手势等待上限（毫秒）
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// stop_all 后等待安全姿态的上限（毫秒）
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// 判定「已到位」的误差（度）
    #[serde(default = "default_settle_epsilon")]
    pub settle_epsilon: f64,
}

fn default_tick_hz() -> u32 {
    50
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_stop_timeout_ms() -> u64 {
    500
}

fn default_settle_epsilon() -> f64 {
    0.25
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            wait_timeout_ms: default_wait_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            settle_epsilon: default_settle_epsilon(),
        }
    }
}

impl SchedulerSection {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// 控制频率必须在 10..=200 Hz；30-60 Hz 以外只告警
    pub fn validate(&self) -> Result<(), MotionError> {
        if !(10..=200).contains(&self.tick_hz) {
            return Err(MotionError::Config(format!(
                "scheduler.tick_hz {} outside 10..=200",
                self.tick_hz
            )));
        }
        if self.tick_hz < 30 || self.tick_hz > 60 {
            tracing::warn!(
                "scheduler.tick_hz {} outside the recommended 30-60 Hz",
                self.tick_hz
            );
        }
        Ok(())
    }
}

/// 单通道配置；未给出的范围从驱动标定补齐
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChannelEntry {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub neutral: Option<f64>,
    pub pin: Option<u8>,
    pub kp: Option<f64>,
    pub ki: Option<f64>,
    pub kd: Option<f64>,
    pub max_rate: Option<f64>,
}

/// [idle] 段：行为权重、眨眼概率、各行为的停顿区间
#[derive(Debug, Clone, Deserialize)]
pub struct IdleSection {
    #[serde(default = "default_subtle")]
    pub subtle: f64,
    #[serde(default = "default_look_around")]
    pub look_around: f64,
    #[serde(default = "default_focused")]
    pub focused: f64,
    #[serde(default = "default_blink_probability")]
    pub blink_probability: f64,
    #[serde(default = "default_subtle_pause")]
    pub subtle_pause: PauseRange,
    #[serde(default = "default_look_around_pause")]
    pub look_around_pause: PauseRange,
    #[serde(default = "default_focused_pause")]
    pub focused_pause: PauseRange,
    /// 休眠状态下轮询调度器的间隔（毫秒）
    #[serde(default = "default_dormant_poll_ms")]
    pub dormant_poll_ms: u64,
}

/// 停顿区间（毫秒，闭区间）
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct PauseRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl PauseRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

fn default_subtle() -> f64 {
    0.70
}

fn default_look_around() -> f64 {
    0.20
}

fn default_focused() -> f64 {
    0.10
}

fn default_blink_probability() -> f64 {
    0.30
}

fn default_subtle_pause() -> PauseRange {
    PauseRange::new(1000, 3000)
}

fn default_look_around_pause() -> PauseRange {
    PauseRange::new(500, 1500)
}

fn default_focused_pause() -> PauseRange {
    PauseRange::new(2000, 4000)
}

fn default_dormant_poll_ms() -> u64 {
    100
}

impl Default for IdleSection {
    fn default() -> Self {
        Self {
            subtle: default_subtle(),
            look_around: default_look_around(),
            focused: default_focused(),
            blink_probability: default_blink_probability(),
            subtle_pause: default_subtle_pause(),
            look_around_pause: default_look_around_pause(),
            focused_pause: default_focused_pause(),
            dormant_poll_ms: default_dormant_poll_ms(),
        }
    }
}

impl IdleSection {
    pub fn weights(&self) -> Result<BehaviorWeights, MotionError> {
        BehaviorWeights::new(
            self.subtle,
            self.look_around,
            self.focused,
            self.blink_probability,
        )
    }
}

/// [speech] 段：口型同步参数
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechSection {
    /// 提前提交口型的时间（毫秒），用于吸收调度抖动
    #[serde(default = "default_lookahead_ms")]
    pub lookahead_ms: u64,
    /// 超过该延迟的事件丢弃（约一个控制周期）
    #[serde(default = "default_desync_tolerance_ms")]
    pub desync_tolerance_ms: u64,
    /// 无口型时间线时随机开合嘴唇
    #[serde(default = "default_babble")]
    pub babble: bool,
    /// 文本转口型的语速（字符/秒）
    #[serde(default = "default_chars_per_second")]
    pub chars_per_second: f64,
}

fn default_lookahead_ms() -> u64 {
    40
}

fn default_desync_tolerance_ms() -> u64 {
    33
}

fn default_babble() -> bool {
    false
}

fn default_chars_per_second() -> f64 {
    14.0
}

impl Default for SpeechSection {
    fn default() -> Self {
        Self {
            lookahead_ms: default_lookahead_ms(),
            desync_tolerance_ms: default_desync_tolerance_ms(),
            babble: default_babble(),
            chars_per_second: default_chars_per_second(),
        }
    }
}

impl SpeechSection {
    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn desync_tolerance(&self) -> Duration {
        Duration::from_millis(self.desync_tolerance_ms)
    }
}

/// 标定合并后的单通道规格
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub bounds: Bounds,
    pub gains: PidGains,
    pub pin: u8,
}

impl AppConfig {
    /// 启动期校验（除通道标定外的部分）
    pub fn validate(&self) -> Result<(), MotionError> {
        self.scheduler.validate()?;
        self.idle.weights()?;
        for (name, range) in [
            ("subtle_pause", self.idle.subtle_pause),
            ("look_around_pause", self.idle.look_around_pause),
            ("focused_pause", self.idle.focused_pause),
        ] {
            if range.min_ms > range.max_ms {
                return Err(MotionError::Config(format!(
                    "idle.{name}: min_ms exceeds max_ms"
                )));
            }
        }
        if !(self.speech.chars_per_second > 0.0) {
            return Err(MotionError::Config(
                "speech.chars_per_second must be positive".into(),
            ));
        }
        Ok(())
    }

    /// 合并配置与驱动报告的标定，得到全部 7 个通道的规格
    ///
    /// 配置优先；缺失的 min/max/neutral 用驱动报告补齐；两者都没有则为 CalibrationError。
    pub fn resolve_channels(
        &self,
        report: &[(ChannelId, Bounds)],
    ) -> Result<Vec<ChannelSpec>, MotionError> {
        let mut entries: HashMap<ChannelId, &ChannelEntry> = HashMap::new();
        for (name, entry) in &self.channels {
            entries.insert(name.parse()?, entry);
        }

        ChannelId::ALL
            .into_iter()
            .map(|id| {
                let entry = entries.get(&id).copied();
                let reported = report.iter().find(|(c, _)| *c == id).map(|(_, b)| *b);

                let min = entry.and_then(|e| e.min).or(reported.map(|b| b.min));
                let max = entry.and_then(|e| e.max).or(reported.map(|b| b.max));
                let (min, max) = match (min, max) {
                    (Some(min), Some(max)) => (min, max),
                    _ => {
                        return Err(MotionError::Calibration(format!(
                            "{id}: bounds missing from config and device"
                        )))
                    }
                };
                let neutral = entry
                    .and_then(|e| e.neutral)
                    .or(reported.map(|b| b.neutral))
                    .unwrap_or((min + max) / 2.0);
                let bounds = Bounds::new(min, max, neutral);
                bounds.validate(id)?;

                let mut gains = self.pid;
                if let Some(e) = entry {
                    gains.kp = e.kp.unwrap_or(gains.kp);
                    gains.ki = e.ki.unwrap_or(gains.ki);
                    gains.kd = e.kd.unwrap_or(gains.kd);
                    gains.max_rate = e.max_rate.unwrap_or(gains.max_rate);
                }
                gains.validate(id)?;

                Ok(ChannelSpec {
                    id,
                    bounds,
                    gains,
                    pin: entry.and_then(|e| e.pin).unwrap_or(id.index() as u8),
                })
            })
            .collect()
    }
}

/// 由通道规格构建不可变标定
pub fn calibration_from_specs(specs: &[ChannelSpec]) -> Result<Calibration, MotionError> {
    let mut bounds = [Bounds::new(0.0, 1.0, 0.0); ChannelId::COUNT];
    for spec in specs {
        bounds[spec.id.index()] = spec.bounds;
    }
    Calibration::new(bounds)
}

/// 从 config 目录加载配置，环境变量 BLINK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 BLINK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, MotionError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BLINK")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
