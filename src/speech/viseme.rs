//! Viseme 事件与语音源
//!
//! SpeechSource 是外部 TTS 的能力接口：给定文本返回口型事件流。
//! TextVisemeSource 按字符生成确定性时间线；BabbleSource 在没有时间线时随机开合嘴唇。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 口型单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Viseme {
    Rest,
    /// a
    Open,
    /// e / i
    Wide,
    /// o / u
    Round,
    /// m / b / p
    Closed,
    /// f / v
    Teeth,
}

impl Viseme {
    /// (上唇, 下唇) 张开程度，以半量程为单位
    pub fn lip_openness(self) -> (f64, f64) {
        match self {
            Viseme::Rest => (0.0, 0.0),
            Viseme::Open => (0.6, 0.6),
            Viseme::Wide => (0.3, 0.35),
            Viseme::Round => (0.45, 0.4),
            Viseme::Closed => (-0.1, -0.1),
            Viseme::Teeth => (0.1, 0.3),
        }
    }

    pub fn from_char(c: char) -> Viseme {
        match c.to_ascii_lowercase() {
            'a' => Viseme::Open,
            'e' | 'i' | 'y' => Viseme::Wide,
            'o' | 'u' | 'w' => Viseme::Round,
            'm' | 'b' | 'p' => Viseme::Closed,
            'f' | 'v' => Viseme::Teeth,
            c if c.is_alphanumeric() => Viseme::Open,
            _ => Viseme::Rest,
        }
    }
}

/// 相对播放开始的口型事件
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VisemeEvent {
    pub at_ms: u64,
    pub viseme: Viseme,
    /// 张开幅度系数（1.0 = 标准）
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,
}

fn default_amplitude() -> f64 {
    1.0
}

impl VisemeEvent {
    pub fn new(at: Duration, viseme: Viseme, amplitude: f64) -> Self {
        Self {
            at_ms: at.as_millis() as u64,
            viseme,
            amplitude,
        }
    }

    pub fn at(&self) -> Duration {
        Duration::from_millis(self.at_ms)
    }
}

pub type VisemeStream = Pin<Box<dyn Stream<Item = VisemeEvent> + Send>>;

pub fn timeline_stream(events: Vec<VisemeEvent>) -> VisemeStream {
    Box::pin(stream::iter(events))
}

/// 语音源错误；编排器只记录日志，不影响运动核心
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("Speech source unavailable: {0}")]
    Unavailable(String),
}

/// TTS 能力接口
#[async_trait]
pub trait SpeechSource: Send + Sync {
    async fn timeline(&self, text: &str) -> Result<VisemeStream, SpeechError>;
}

/// 文本 -> 确定性口型时间线
#[derive(Debug, Clone)]
pub struct TextVisemeSource {
    chars_per_second: f64,
}

impl TextVisemeSource {
    pub fn new(chars_per_second: f64) -> Self {
        Self {
            chars_per_second: chars_per_second.max(1.0),
        }
    }

    pub fn events(&self, text: &str) -> Vec<VisemeEvent> {
        let step = Duration::from_secs_f64(1.0 / self.chars_per_second);
        let mut events: Vec<VisemeEvent> = Vec::new();
        let mut count = 0u32;
        for (i, c) in text.chars().enumerate() {
            count = i as u32 + 1;
            let viseme = Viseme::from_char(c);
            if events.last().map(|e| e.viseme) == Some(viseme) {
                continue;
            }
            // 辅音张口幅度较小
            let amplitude = if c.is_alphabetic() && !"aeiouy".contains(c.to_ascii_lowercase()) {
                0.5
            } else {
                1.0
            };
            events.push(VisemeEvent::new(step * i as u32, viseme, amplitude));
        }
        if count > 0 && events.last().map(|e| e.viseme) != Some(Viseme::Rest) {
            events.push(VisemeEvent::new(step * count, Viseme::Rest, 1.0));
        }
        events
    }
}

#[async_trait]
impl SpeechSource for TextVisemeSource {
    async fn timeline(&self, text: &str) -> Result<VisemeStream, SpeechError> {
        Ok(timeline_stream(self.events(text)))
    }
}

/// 随机开合嘴唇，时长按文本长度估算
#[derive(Debug, Clone)]
pub struct BabbleSource {
    chars_per_second: f64,
    seed: Option<u64>,
}

impl BabbleSource {
    pub fn new(chars_per_second: f64) -> Self {
        Self {
            chars_per_second: chars_per_second.max(1.0),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn events<R: Rng + ?Sized>(&self, text: &str, rng: &mut R) -> Vec<VisemeEvent> {
        let total = Duration::from_secs_f64(text.chars().count() as f64 / self.chars_per_second);
        let mut t = Duration::ZERO;
        let mut events = Vec::new();
        while t < total {
            // 张开 0.4..0.8 半量程
            let amplitude = rng.gen_range(0.4..=0.8) / Viseme::Open.lip_openness().0;
            events.push(VisemeEvent::new(t, Viseme::Open, amplitude));
            t += Duration::from_millis(rng.gen_range(100..=300));
            events.push(VisemeEvent::new(t, Viseme::Rest, 1.0));
            t += Duration::from_millis(rng.gen_range(100..=250));
        }
        events
    }
}

#[async_trait]
impl SpeechSource for BabbleSource {
    async fn timeline(&self, text: &str) -> Result<VisemeStream, SpeechError> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(timeline_stream(self.events(text, &mut rng)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_text_timeline() {
        let source = TextVisemeSource::new(10.0);
        let events = source.events("mama");
        let visemes: Vec<Viseme> = events.iter().map(|e| e.viseme).collect();
        assert_eq!(
            visemes,
            vec![Viseme::Closed, Viseme::Open, Viseme::Closed, Viseme::Open, Viseme::Rest]
        );
        assert_eq!(events[1].at(), Duration::from_millis(100));
        assert_eq!(events.last().unwrap().at(), Duration::from_millis(400));
    }

    #[test]
    fn test_text_timeline_collapses_repeats_and_empty() {
        let source = TextVisemeSource::new(10.0);
        assert!(source.events("").is_empty());
        let events = source.events("ee  !");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].viseme, Viseme::Wide);
        assert_eq!(events[1].viseme, Viseme::Rest);
    }

    #[test]
    fn test_babble_alternates_and_is_monotonic() {
        let source = BabbleSource::new(10.0);
        let mut rng = StdRng::seed_from_u64(9);
        let events = source.events("hello there", &mut rng);
        assert!(!events.is_empty());
        for pair in events.windows(2) {
            assert!(pair[0].at_ms < pair[1].at_ms);
            assert_ne!(pair[0].viseme, pair[1].viseme);
        }
        for e in events.iter().filter(|e| e.viseme == Viseme::Open) {
            let open = e.amplitude * Viseme::Open.lip_openness().0;
            assert!((0.4 - 1e-9..=0.8 + 1e-9).contains(&open));
        }
    }

    #[tokio::test]
    async fn test_source_stream() {
        let stream = TextVisemeSource::new(20.0).timeline("ok").await.unwrap();
        let events: Vec<VisemeEvent> = stream.collect().await;
        assert_eq!(events.first().unwrap().viseme, Viseme::Round);
        assert_eq!(events.last().unwrap().viseme, Viseme::Rest);
    }

    #[test]
    fn test_event_json() {
        let e: VisemeEvent = serde_json::from_str(r#"{"at_ms": 120, "viseme": "round"}"#).unwrap();
        assert_eq!(e.at(), Duration::from_millis(120));
        assert_eq!(e.amplitude, 1.0);
    }
}
