use crate::config::SmoothConfig;
use crate::error::ValidationError;
use crate::pose::{Landmark, LandmarkFrame, LandmarkIndex};

/// 速度・信頼度適応型のEMAランドマーク平滑化フィルタ
///
/// ランドマークごとに前回の生値との距離を速度とみなし、
/// 速ければ追従重視 (alpha_fast)、遅ければ平滑重視 (alpha_slow)。
/// alpha はさらに信頼度 (min_confidence_scale〜1.0 にクランプ) で減衰させる。
pub struct PoseSmoother {
    velocity_threshold: f32,
    alpha_slow: f32,
    alpha_fast: f32,
    min_confidence_scale: f32,
    smoothed: Option<[Landmark; LandmarkIndex::COUNT]>,
    prev_raw: Option<[Landmark; LandmarkIndex::COUNT]>,
}

impl PoseSmoother {
    pub fn new(velocity_threshold: f32, alpha_slow: f32, alpha_fast: f32) -> Self {
        Self {
            velocity_threshold,
            alpha_slow,
            alpha_fast,
            min_confidence_scale: 0.2,
            smoothed: None,
            prev_raw: None,
        }
    }

    pub fn from_config(config: &SmoothConfig) -> Self {
        let mut smoother = Self::new(config.velocity_threshold, config.alpha_slow, config.alpha_fast);
        smoother.min_confidence_scale = config.min_confidence_scale.clamp(0.0, 1.0);
        smoother
    }

    /// 上流の生データを検証してから平滑化する。
    /// 不正なフレームは内部状態に触れずにエラーを返す。
    pub fn smooth(&mut self, raw: &[Landmark]) -> Result<LandmarkFrame, ValidationError> {
        let frame = LandmarkFrame::from_slice(raw)?;
        Ok(self.apply(&frame))
    }

    pub fn apply(&mut self, current: &LandmarkFrame) -> LandmarkFrame {
        let (mut smoothed, prev) = match (self.smoothed, self.prev_raw) {
            (Some(s), Some(p)) => (s, p),
            _ => {
                self.smoothed = Some(*current.landmarks());
                self.prev_raw = Some(*current.landmarks());
                return current.clone();
            }
        };

        for (i, p) in current.landmarks().iter().enumerate() {
            let velocity = p.distance(&prev[i]);
            let base = if velocity >= self.velocity_threshold {
                self.alpha_fast
            } else {
                self.alpha_slow
            };
            let alpha = base * p.confidence.clamp(self.min_confidence_scale, 1.0);

            let s = &mut smoothed[i];
            s.x += alpha * (p.x - s.x);
            s.y += alpha * (p.y - s.y);
            s.z += alpha * (p.z - s.z);
            s.confidence = p.confidence;
        }

        self.smoothed = Some(smoothed);
        self.prev_raw = Some(*current.landmarks());
        LandmarkFrame::from_array(smoothed)
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
        self.prev_raw = None;
    }
}

impl Default for PoseSmoother {
    fn default() -> Self {
        Self::from_config(&SmoothConfig::default())
    }
}
