use crate::config::CalibrationConfig;
use crate::pose::{LandmarkFrame, LandmarkIndex};

/// Tポーズ検出（画像座標のフレームを入力）
///
/// 両手首が肩の高さにあり、かつ体の外側へ伸びている状態が
/// `hold_frames` フレーム続いたら成立。
pub struct TPoseDetector {
    min_confidence: f32,
    wrist_tolerance: f32,
    arm_extension: f32,
    hold_frames: u32,
    held: u32,
}

impl TPoseDetector {
    pub fn new(wrist_tolerance: f32, arm_extension: f32, hold_frames: u32) -> Self {
        Self {
            min_confidence: 0.5,
            wrist_tolerance,
            arm_extension,
            hold_frames: hold_frames.max(1),
            held: 0,
        }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        let mut detector = Self::new(config.wrist_tolerance, config.arm_extension, config.hold_frames);
        detector.min_confidence = config.min_confidence;
        detector
    }

    /// 単一フレームがTポーズか
    pub fn is_tpose(&self, frame: &LandmarkFrame) -> bool {
        use LandmarkIndex::*;
        let ls = frame.get(LeftShoulder);
        let rs = frame.get(RightShoulder);
        let lw = frame.get(LeftWrist);
        let rw = frame.get(RightWrist);
        if [ls, rs, lw, rw].iter().any(|l| !l.is_valid(self.min_confidence)) {
            return false;
        }

        let y_aligned = (lw.y - ls.y).abs() < self.wrist_tolerance
            && (rw.y - rs.y).abs() < self.wrist_tolerance;

        // カメラのミラー有無に依存しないよう、肩中点から外向きの距離で判定
        let center_x = (ls.x + rs.x) / 2.0;
        let outward = |shoulder_x: f32, wrist_x: f32| {
            let side = (shoulder_x - center_x).signum();
            (wrist_x - shoulder_x) * side
        };
        let arms_out = outward(ls.x, lw.x) > self.arm_extension
            && outward(rs.x, rw.x) > self.arm_extension;

        y_aligned && arms_out
    }

    /// フレームを与えて保持カウンタを進める。保持完了で true
    pub fn update(&mut self, frame: &LandmarkFrame) -> bool {
        if self.is_tpose(frame) {
            self.held = self.held.saturating_add(1);
        } else {
            self.held = 0;
        }
        self.held >= self.hold_frames
    }

    pub fn held_frames(&self) -> u32 {
        self.held
    }

    pub fn reset(&mut self) {
        self.held = 0;
    }
}
