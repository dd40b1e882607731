//! 待机行为：没有手势/语音时注入细微动作、环顾、专注注视与随机眨眼，避免机器人看起来静止

pub mod generator;
pub mod weights;

pub use generator::{IdleGenerator, IdlePlan, IdleState};
pub use weights::{BehaviorWeights, IdleBehavior};
