//! 单自由度电机通道：标定范围、PID 增益与平滑控制环
//!
//! MotorChannel 记录目标位置，并把 PID 设定点沿最小加加速度曲线（quintic）从当前估计位置
//! 斜坡过渡到目标；tick(dt) 推进一步控制环并返回新的输出（由调用方写入硬件）。
//! 舵机无位置反馈，估计位置即上一次输出。

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::MotionError;

/// 机器人头部的 7 个自由度
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    HeadNod,
    HeadTurn,
    EyeTurn,
    EyeTilt,
    TopLip,
    BottomLip,
    LidBlink,
}

impl ChannelId {
    pub const COUNT: usize = 7;

    pub const ALL: [ChannelId; Self::COUNT] = [
        ChannelId::HeadNod,
        ChannelId::HeadTurn,
        ChannelId::EyeTurn,
        ChannelId::EyeTilt,
        ChannelId::TopLip,
        ChannelId::BottomLip,
        ChannelId::LidBlink,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// 配置文件中使用的名称（snake_case）
    pub fn name(self) -> &'static str {
        match self {
            ChannelId::HeadNod => "head_nod",
            ChannelId::HeadTurn => "head_turn",
            ChannelId::EyeTurn => "eye_turn",
            ChannelId::EyeTilt => "eye_tilt",
            ChannelId::TopLip => "top_lip",
            ChannelId::BottomLip => "bottom_lip",
            ChannelId::LidBlink => "lid_blink",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChannelId {
    type Err = MotionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ChannelId::ALL
            .into_iter()
            .find(|c| c.name() == normalized)
            .ok_or_else(|| MotionError::Calibration(format!("unknown channel '{s}'")))
    }
}

/// 通道集合（位掩码），用于所有权声明与冲突检测
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub const HEAD: ChannelSet = ChannelSet::of(&[ChannelId::HeadNod, ChannelId::HeadTurn]);
    pub const EYES: ChannelSet = ChannelSet::of(&[ChannelId::EyeTurn, ChannelId::EyeTilt]);
    /// 语音只拥有嘴唇通道
    pub const LIPS: ChannelSet = ChannelSet::of(&[ChannelId::TopLip, ChannelId::BottomLip]);
    pub const LID: ChannelSet = ChannelSet::of(&[ChannelId::LidBlink]);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self((1 << ChannelId::COUNT) - 1)
    }

    pub const fn of(channels: &[ChannelId]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < channels.len() {
            bits |= 1 << (channels[i] as u8);
            i += 1;
        }
        Self(bits)
    }

    pub fn insert(&mut self, channel: ChannelId) {
        self.0 |= 1 << channel.index();
    }

    pub fn contains(self, channel: ChannelId) -> bool {
        self.0 & (1 << channel.index()) != 0
    }

    pub fn intersects(self, other: ChannelSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: ChannelSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: ChannelSet) -> Self {
        Self(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ChannelId> {
        ChannelId::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(ChannelId::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// 标定范围（度）与安全中位
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
    /// 安全/中立位置，stop_all 时回到这里
    pub neutral: f64,
}

impl Bounds {
    pub fn new(min: f64, max: f64, neutral: f64) -> Self {
        Self { min, max, neutral }
    }

    /// 启动时校验：有限值、min < max、中位在范围内
    pub fn validate(&self, channel: ChannelId) -> Result<(), MotionError> {
        if !(self.min.is_finite() && self.max.is_finite() && self.neutral.is_finite()) {
            return Err(MotionError::Calibration(format!(
                "{channel}: bounds must be finite"
            )));
        }
        if self.min >= self.max {
            return Err(MotionError::Calibration(format!(
                "{channel}: min {} must be below max {}",
                self.min, self.max
            )));
        }
        if self.neutral < self.min || self.neutral > self.max {
            return Err(MotionError::Calibration(format!(
                "{channel}: neutral {} outside [{}, {}]",
                self.neutral, self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn clamp(&self, position: f64) -> f64 {
        if position.is_nan() {
            return self.neutral;
        }
        position.clamp(self.min, self.max)
    }

    pub fn half_range(&self) -> f64 {
        (self.max - self.min) / 2.0
    }

    /// 以半量程为单位相对中位的偏移（1.0 = 半量程），结果已夹紧
    pub fn offset(&self, fraction: f64) -> f64 {
        self.clamp(self.neutral + fraction * self.half_range())
    }
}

/// PID 增益；输出单位为 度/秒（速度形式）
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct PidGains {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    /// 积分项绝对值上限（度·秒）
    #[serde(default = "default_integral_limit")]
    pub integral_limit: f64,
    /// 只有误差小于该值时才积分（度）
    #[serde(default = "default_integral_band")]
    pub integral_band: f64,
    /// 最大转速（度/秒）
    #[serde(default = "default_max_rate")]
    pub max_rate: f64,
}

fn default_kp() -> f64 {
    10.0
}

fn default_ki() -> f64 {
    0.4
}

fn default_kd() -> f64 {
    0.05
}

fn default_integral_limit() -> f64 {
    1.0
}

fn default_integral_band() -> f64 {
    2.0
}

fn default_max_rate() -> f64 {
    180.0
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            integral_limit: default_integral_limit(),
            integral_band: default_integral_band(),
            max_rate: default_max_rate(),
        }
    }
}

impl PidGains {
    pub fn validate(&self, channel: ChannelId) -> Result<(), MotionError> {
        let values = [
            self.kp,
            self.ki,
            self.kd,
            self.integral_limit,
            self.integral_band,
            self.max_rate,
        ];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(MotionError::Calibration(format!(
                "{channel}: PID gains must be finite and non-negative"
            )));
        }
        if self.kp == 0.0 || self.max_rate == 0.0 {
            return Err(MotionError::Calibration(format!(
                "{channel}: kp and max_rate must be positive"
            )));
        }
        Ok(())
    }
}

/// 全部 7 个通道的标定结果，启动后不可变
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    bounds: [Bounds; ChannelId::COUNT],
}

impl Calibration {
    pub fn new(bounds: [Bounds; ChannelId::COUNT]) -> Result<Self, MotionError> {
        for channel in ChannelId::ALL {
            bounds[channel.index()].validate(channel)?;
        }
        Ok(Self { bounds })
    }

    pub fn bounds(&self, channel: ChannelId) -> &Bounds {
        &self.bounds[channel.index()]
    }

    pub fn offset(&self, channel: ChannelId, fraction: f64) -> f64 {
        self.bounds(channel).offset(fraction)
    }

    pub fn neutral(&self, channel: ChannelId) -> f64 {
        self.bounds(channel).neutral
    }
}

/// 单通道 PID 平滑控制环
#[derive(Debug, Clone)]
pub struct MotorChannel {
    id: ChannelId,
    bounds: Bounds,
    gains: PidGains,
    /// 估计位置（= 最近一次输出）
    position: f64,
    /// 最终目标
    target: f64,
    /// 当前 PID 设定点（沿斜坡移动）
    setpoint: f64,
    ramp_from: f64,
    ramp_total: f64,
    ramp_elapsed: f64,
    integral: f64,
    prev_error: Option<f64>,
}

impl MotorChannel {
    /// 以中位为初始位置创建通道
    pub fn new(id: ChannelId, bounds: Bounds, gains: PidGains) -> Self {
        let start = bounds.neutral;
        Self {
            id,
            bounds,
            gains,
            position: start,
            target: start,
            setpoint: start,
            ramp_from: start,
            ramp_total: 0.0,
            ramp_elapsed: 0.0,
            integral: 0.0,
            prev_error: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn gains(&self) -> &PidGains {
        &self.gains
    }

    pub fn position(&self) -> f64 {
        self.position
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// 设置新目标：越界值被夹紧而非拒绝；设定点从当前估计位置开始斜坡，
    /// duration 为空或为零时立即跳到目标。返回实际采用的（夹紧后）目标。
    pub fn set_target(&mut self, position: f64, duration: Option<Duration>) -> f64 {
        let target = self.bounds.clamp(position);
        self.target = target;
        self.ramp_from = self.position;
        self.ramp_elapsed = 0.0;
        self.ramp_total = duration.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        if self.ramp_total <= 0.0 {
            self.setpoint = target;
        } else {
            self.setpoint = self.ramp_from;
        }
        self.prev_error = None;
        target
    }

    /// 清除积分与微分历史（所有权从 idle 转为 gesture/speech 时调用）
    pub fn reset_pid(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
    }

    /// 直接把通道置于某位置（stop_all 的安全姿态），不经过限速
    pub fn hard_set(&mut self, position: f64) {
        let p = self.bounds.clamp(position);
        self.position = p;
        self.target = p;
        self.setpoint = p;
        self.ramp_from = p;
        self.ramp_total = 0.0;
        self.ramp_elapsed = 0.0;
        self.reset_pid();
    }

    /// 写入失败后退回到舵机实际所在位置；目标与斜坡不变，之后照常限速追赶
    pub fn hold(&mut self, position: f64) {
        self.position = self.bounds.clamp(position);
        self.prev_error = None;
    }

    pub fn ramp_finished(&self) -> bool {
        self.ramp_elapsed >= self.ramp_total
    }

    pub fn is_settled(&self, epsilon: f64) -> bool {
        self.ramp_finished() && (self.target - self.position).abs() <= epsilon
    }

    /// 推进一步控制环，返回新的输出位置
    pub fn tick(&mut self, dt: Duration) -> f64 {
        let dt = dt.as_secs_f64();
        if dt <= 0.0 {
            return self.position;
        }

        self.advance_ramp(dt);

        let error = self.setpoint - self.position;
        let derivative = self.prev_error.map(|p| (error - p) / dt).unwrap_or(0.0);

        // 斜坡未结束或误差较大时不积分，避免 windup
        if self.ramp_finished() && error.abs() < self.gains.integral_band {
            let limit = self.gains.integral_limit;
            self.integral = (self.integral + error * dt).clamp(-limit, limit);
        }

        let velocity = (self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * derivative)
            .clamp(-self.gains.max_rate, self.gains.max_rate);

        self.position = self.bounds.clamp(self.position + velocity * dt);
        self.prev_error = Some(error);
        self.position
    }

    fn advance_ramp(&mut self, dt: f64) {
        if self.ramp_finished() {
            self.setpoint = self.target;
            return;
        }
        self.ramp_elapsed = (self.ramp_elapsed + dt).min(self.ramp_total);
        let u = self.ramp_elapsed / self.ramp_total;
        self.setpoint = self.ramp_from + (self.target - self.ramp_from) * min_jerk(u);
    }
}

/// 最小加加速度插值：s(u) = 10u³ - 15u⁴ + 6u⁵，两端速度与加速度为零
fn min_jerk(u: f64) -> f64 {
    let u = u.clamp(0.0, 1.0);
    let u3 = u * u * u;
    u3 * (10.0 - 15.0 * u + 6.0 * u * u)
}
