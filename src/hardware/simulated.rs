//! 内存舵机驱动（无需硬件）
//!
//! 记录每个通道的最后写入值与写入次数；可注入写入失败，DriverProbe 供外部观察。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::hardware::{HardwareDriver, HardwareError};
use crate::motion::{Bounds, ChannelId};

#[derive(Debug, Default)]
struct SimState {
    positions: HashMap<ChannelId, f64>,
    writes: u64,
    batches: u64,
    /// 接下来这么多次 write 返回错误
    fail_writes: u32,
    closed: bool,
}

/// 模拟驱动
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
    pins: HashMap<ChannelId, u8>,
    calibration: Vec<(ChannelId, Bounds)>,
}

impl SimulatedDriver {
    /// 以内置默认标定创建（所有 7 个通道）
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            pins: ChannelId::ALL
                .into_iter()
                .map(|c| (c, c.index() as u8))
                .collect(),
            calibration: default_calibration(),
        }
    }

    /// 通道到引脚映射（来自配置），仅用于日志
    pub fn with_pins(mut self, pins: HashMap<ChannelId, u8>) -> Self {
        self.pins.extend(pins);
        self
    }

    /// 覆盖设备报告的标定（测试缺失/非法标定）
    pub fn with_calibration(mut self, calibration: Vec<(ChannelId, Bounds)>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn probe(&self) -> DriverProbe {
        DriverProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// 内置默认标定（度）
pub fn default_calibration() -> Vec<(ChannelId, Bounds)> {
    vec![
        (ChannelId::HeadNod, Bounds::new(-30.0, 30.0, 0.0)),
        (ChannelId::HeadTurn, Bounds::new(-45.0, 45.0, 0.0)),
        (ChannelId::EyeTurn, Bounds::new(-30.0, 30.0, 0.0)),
        (ChannelId::EyeTilt, Bounds::new(-25.0, 25.0, 0.0)),
        (ChannelId::TopLip, Bounds::new(-20.0, 20.0, 0.0)),
        (ChannelId::BottomLip, Bounds::new(-20.0, 20.0, 0.0)),
        // 0 = 睁眼，40 = 闭眼
        (ChannelId::LidBlink, Bounds::new(0.0, 40.0, 0.0)),
    ]
}

impl HardwareDriver for SimulatedDriver {
    fn write(&mut self, channel: ChannelId, position: f64) -> Result<(), HardwareError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(HardwareError::Unavailable("driver closed".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(HardwareError::Write {
                channel,
                reason: "simulated fault".into(),
            });
        }
        state.writes += 1;
        state.positions.insert(channel, position);
        tracing::trace!(
            "pin {} <- {:.2}",
            self.pins.get(&channel).copied().unwrap_or_default(),
            position
        );
        Ok(())
    }

    fn write_batch(&mut self, outputs: &[(ChannelId, f64)]) -> Vec<(ChannelId, HardwareError)> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.batches += 1;
        }
        outputs
            .iter()
            .filter_map(|&(channel, position)| {
                self.write(channel, position).err().map(|e| (channel, e))
            })
            .collect()
    }

    fn read_calibration(&self) -> Result<Vec<(ChannelId, Bounds)>, HardwareError> {
        Ok(self.calibration.clone())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        tracing::info!("Simulated driver closed after {} writes", state.writes);
    }
}

/// 观察/操控 SimulatedDriver 的句柄
#[derive(Debug, Clone)]
pub struct DriverProbe {
    state: Arc<Mutex<SimState>>,
}

impl DriverProbe {
    pub fn position(&self, channel: ChannelId) -> Option<f64> {
        self.lock().positions.get(&channel).copied()
    }

    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    pub fn batches(&self) -> u64 {
        self.lock().batches
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 让接下来 n 次单通道写入失败
    pub fn fail_next_writes(&self, n: u32) {
        self.lock().fail_writes = n;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
