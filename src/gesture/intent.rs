//! 情绪意图：对话后端给出的 agree / disagree / think / excite 标签，1:1 映射到手势名
//!
//! 后端未给出标签时，可从回复文本中按关键词推断（按 agree > disagree > think > excite 的顺序匹配）。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Agree,
    Disagree,
    Think,
    Excite,
}

impl Intent {
    pub fn gesture_name(self) -> &'static str {
        match self {
            Intent::Agree => "nod",
            Intent::Disagree => "shake",
            Intent::Think => "think",
            Intent::Excite => "excite",
        }
    }

    /// 从文本推断意图；空文本或无匹配返回 None
    pub fn detect(text: &str) -> Option<Intent> {
        if text.trim().is_empty() {
            return None;
        }
        let text = text.to_lowercase();
        keyword_patterns()
            .iter()
            .find(|(_, re)| re.is_match(&text))
            .map(|(intent, _)| *intent)
    }
}

fn keyword_patterns() -> &'static [(Intent, Regex)] {
    static PATTERNS: OnceLock<Vec<(Intent, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (Intent::Agree, &["yes", "agree", "correct", "right", "absolutely"][..]),
            (Intent::Disagree, &["no", "disagree", "incorrect", "wrong"][..]),
            (Intent::Think, &["hmm", "well", "let me think", "perhaps", "maybe"][..]),
            (Intent::Excite, &["wow", "amazing", "awesome", "excellent", "fantastic"][..]),
        ]
        .into_iter()
        .filter_map(|(intent, words)| {
            let alternation = words
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"\b(?:{alternation})\b"))
                .ok()
                .map(|re| (intent, re))
        })
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_each_intent() {
        assert_eq!(Intent::detect("Yes, that's it"), Some(Intent::Agree));
        assert_eq!(Intent::detect("That is WRONG"), Some(Intent::Disagree));
        assert_eq!(Intent::detect("Hmm, let me think"), Some(Intent::Think));
        assert_eq!(Intent::detect("Wow!"), Some(Intent::Excite));
    }

    #[test]
    fn test_agree_wins_over_later_intents() {
        assert_eq!(Intent::detect("wow, you are right"), Some(Intent::Agree));
    }

    #[test]
    fn test_word_boundaries() {
        // "know" 不应命中 "no"，"bright" 不应命中 "right"
        assert_eq!(Intent::detect("I know the bright answer"), None);
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(Intent::detect("   "), None);
    }

    #[test]
    fn test_gesture_names() {
        assert_eq!(Intent::Agree.gesture_name(), "nod");
        assert_eq!(Intent::Disagree.gesture_name(), "shake");
        assert_eq!(Intent::Think.gesture_name(), "think");
        assert_eq!(Intent::Excite.gesture_name(), "excite");
    }
}
