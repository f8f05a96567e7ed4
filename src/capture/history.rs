use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::pose::{LandmarkFrame, PoseFrame};

/// 録画中に追記されるフレーム列
///
/// 追記のみ。タイムスタンプは単調増加に補正する（逆行・重複は直前 + 1ms）。
#[derive(Debug, Default)]
pub struct History {
    frames: Vec<PoseFrame>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追記して実際に記録したタイムスタンプを返す
    pub fn push(&mut self, landmarks: LandmarkFrame, timestamp_ms: f64) -> f64 {
        let timestamp_ms = match self.frames.last() {
            Some(last) if !(timestamp_ms.is_finite() && timestamp_ms > last.timestamp_ms) => {
                last.timestamp_ms + 1.0
            }
            None if !timestamp_ms.is_finite() => 0.0,
            _ => timestamp_ms,
        };
        self.frames.push(PoseFrame { landmarks, timestamp_ms });
        timestamp_ms
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 録画停止。以降は読み取り専用
    pub fn freeze(self) -> FrozenHistory {
        FrozenHistory {
            frames: self.frames.into(),
        }
    }
}

/// 録画済みテイク（レビュー・ベイク・保存用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<PoseFrame>", into = "Vec<PoseFrame>")]
pub struct FrozenHistory {
    frames: Arc<[PoseFrame]>,
}

impl FrozenHistory {
    pub fn frames(&self) -> &[PoseFrame] {
        &self.frames
    }

    pub fn get(&self, index: usize) -> Option<&PoseFrame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// レビュー時のタイムライン長（フレーム数 - 1、先頭フレームが 0）
    pub fn playback_duration(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }
}

impl From<Vec<PoseFrame>> for FrozenHistory {
    fn from(frames: Vec<PoseFrame>) -> Self {
        let mut history = History::new();
        for frame in frames {
            history.push(frame.landmarks, frame.timestamp_ms);
        }
        history.freeze()
    }
}

impl From<FrozenHistory> for Vec<PoseFrame> {
    fn from(history: FrozenHistory) -> Self {
        history.frames.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::tpose::tests::tpose_landmarks;

    fn frame() -> LandmarkFrame {
        LandmarkFrame::from_slice(&tpose_landmarks()).unwrap()
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut history = History::new();
        assert_eq!(history.push(frame(), 100.0), 100.0);
        assert_eq!(history.push(frame(), 90.0), 101.0);
        assert_eq!(history.push(frame(), 101.0), 102.0);
        assert_eq!(history.push(frame(), f64::NAN), 103.0);
        assert_eq!(history.push(frame(), 140.0), 140.0);
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_playback_duration() {
        assert_eq!(History::new().freeze().playback_duration(), 0);
        let mut history = History::new();
        for i in 0..4 {
            history.push(frame(), i as f64 * 33.0);
        }
        let frozen = history.freeze();
        assert_eq!(frozen.len(), 4);
        assert_eq!(frozen.playback_duration(), 3);
        assert_eq!(frozen.get(0).unwrap().timestamp_ms, 0.0);
        assert!(frozen.get(4).is_none());
    }

    #[test]
    fn test_load_take_normalizes_timestamps() {
        let mut history = History::new();
        history.push(frame(), 0.0);
        history.push(frame(), 40.0);
        let mut frames: Vec<PoseFrame> = history.freeze().into();
        frames[1].timestamp_ms = -5.0;
        let json = serde_json::to_string(&frames).unwrap();
        let loaded: FrozenHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.frames()[1].timestamp_ms, 1.0);
    }
}
