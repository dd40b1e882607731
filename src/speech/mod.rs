//! 口型同步：把 TTS 给出的带时间戳的 viseme/振幅事件流转换为嘴唇通道姿态

pub mod animator;
pub mod viseme;

pub use animator::{SpeechAnimator, SpeechReport};
pub use viseme::{
    timeline_stream, BabbleSource, SpeechError, SpeechSource, TextVisemeSource, Viseme, VisemeEvent,
    VisemeStream,
};
