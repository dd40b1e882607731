//! 手势库：命名的复合动画（点头、摇头、思考、兴奋、眨眼）与情绪意图映射

pub mod intent;
pub mod library;

pub use intent::Intent;
pub use library::{Gesture, GestureLibrary, GestureStep};
