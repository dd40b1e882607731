//! 行为权重：subtle / look-around / focused 三选一的概率分布 + 独立的眨眼概率

use rand::Rng;
use serde::Serialize;

use crate::core::MotionError;

const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IdleBehavior {
    /// 围绕中位的细微动作
    Subtle,
    /// 幅度更大的环顾，眼睛跟随头部
    LookAround,
    /// 眼睛先动，头部随后跟上
    Focused,
}

/// 静态配置，运行期不修改
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BehaviorWeights {
    subtle: f64,
    look_around: f64,
    focused: f64,
    blink_probability: f64,
}

impl Default for BehaviorWeights {
    fn default() -> Self {
        Self {
            subtle: 0.70,
            look_around: 0.20,
            focused: 0.10,
            blink_probability: 0.30,
        }
    }
}

impl BehaviorWeights {
    /// 三个权重必须非负且和为 1，眨眼概率在 [0, 1]
    pub fn new(
        subtle: f64,
        look_around: f64,
        focused: f64,
        blink_probability: f64,
    ) -> Result<Self, MotionError> {
        let weights = [subtle, look_around, focused];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(MotionError::Config(
                "idle weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(MotionError::Config(format!(
                "idle weights must sum to 1.0, got {sum}"
            )));
        }
        if !(0.0..=1.0).contains(&blink_probability) {
            return Err(MotionError::Config(format!(
                "idle.blink_probability {blink_probability} outside [0, 1]"
            )));
        }
        Ok(Self {
            subtle,
            look_around,
            focused,
            blink_probability,
        })
    }

    pub fn sum(&self) -> f64 {
        self.subtle + self.look_around + self.focused
    }

    pub fn weight(&self, behavior: IdleBehavior) -> f64 {
        match behavior {
            IdleBehavior::Subtle => self.subtle,
            IdleBehavior::LookAround => self.look_around,
            IdleBehavior::Focused => self.focused,
        }
    }

    pub fn blink_probability(&self) -> f64 {
        self.blink_probability
    }

    /// 按权重抽取一种行为
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> IdleBehavior {
        let roll: f64 = rng.gen::<f64>() * self.sum();
        if roll < self.subtle {
            IdleBehavior::Subtle
        } else if roll < self.subtle + self.look_around {
            IdleBehavior::LookAround
        } else {
            IdleBehavior::Focused
        }
    }

    /// 独立于行为抽取，每个待机 tick 一次
    pub fn should_blink<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        rng.gen_bool(self.blink_probability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_weights_sum_to_one() {
        let w = BehaviorWeights::default();
        assert!((w.sum() - 1.0).abs() <= WEIGHT_TOLERANCE);
        assert!(BehaviorWeights::new(0.70, 0.20, 0.10, 0.30).is_ok());
    }

    #[test]
    fn test_rejects_bad_weights() {
        assert!(BehaviorWeights::new(0.7, 0.2, 0.2, 0.3).is_err());
        assert!(BehaviorWeights::new(1.2, -0.1, -0.1, 0.3).is_err());
        assert!(BehaviorWeights::new(0.7, 0.2, 0.1, 1.5).is_err());
        assert!(BehaviorWeights::new(f64::NAN, 0.2, 0.1, 0.3).is_err());
    }

    #[test]
    fn test_sampled_frequencies_match_weights() {
        const N: usize = 100_000;
        let w = BehaviorWeights::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let (mut subtle, mut look, mut focused, mut blinks) = (0usize, 0usize, 0usize, 0usize);
        for _ in 0..N {
            match w.sample(&mut rng) {
                IdleBehavior::Subtle => subtle += 1,
                IdleBehavior::LookAround => look += 1,
                IdleBehavior::Focused => focused += 1,
            }
            if w.should_blink(&mut rng) {
                blinks += 1;
            }
        }
        let freq = |n: usize| n as f64 / N as f64;
        // 约 5 个标准差（p=0.7 时 σ≈0.00145）
        assert!((freq(subtle) - 0.70).abs() < 0.01, "subtle {}", freq(subtle));
        assert!((freq(look) - 0.20).abs() < 0.01, "look-around {}", freq(look));
        assert!((freq(focused) - 0.10).abs() < 0.01, "focused {}", freq(focused));
        assert!((freq(blinks) - 0.30).abs() < 0.01, "blink {}", freq(blinks));
    }

    #[test]
    fn test_degenerate_distribution() {
        let w = BehaviorWeights::new(0.0, 0.0, 1.0, 0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert_eq!(w.sample(&mut rng), IdleBehavior::Focused);
            assert!(!w.should_blink(&mut rng));
        }
    }
}
