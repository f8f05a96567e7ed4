use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::CalibrationConfig;
use crate::error::CalibrationError;
use crate::pose::{LandmarkFrame, LandmarkIndex};

// --- データ構造 ---

/// Tポーズから求めた床・スケール基準
///
/// 次のキャリブレーションで丸ごと置き換わる。部分的な更新はしない。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPose {
    pub(crate) landmarks: LandmarkFrame,
    pub(crate) floor_y: f32,
    pub(crate) scale: f32,
}

impl CalibrationPose {
    pub fn landmarks(&self) -> &LandmarkFrame {
        &self.landmarks
    }

    /// 左右足首の低い方の高さ
    pub fn floor_y(&self) -> f32 {
        self.floor_y
    }

    /// 1 / (頭の高さ - 床)
    pub fn scale(&self) -> f32 {
        self.scale
    }
}

/// キャリブレーションに必須のランドマーク
const REQUIRED: [LandmarkIndex; 3] = [
    LandmarkIndex::Nose,
    LandmarkIndex::LeftAnkle,
    LandmarkIndex::RightAnkle,
];

pub struct Calibrator {
    min_confidence: f32,
}

impl Calibrator {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn from_config(config: &CalibrationConfig) -> Self {
        Self::new(config.min_confidence)
    }

    /// 直立座標 (Y上向き) のフレームから基準を求める
    ///
    /// 画像座標のフレームは `LandmarkFrame::to_upright` で変換してから渡す。
    pub fn calibrate(&self, frame: &LandmarkFrame) -> Result<CalibrationPose, CalibrationError> {
        for idx in REQUIRED {
            let lm = frame.get(idx);
            if !lm.is_valid(self.min_confidence) {
                return Err(CalibrationError::LowConfidence {
                    landmark: idx,
                    confidence: lm.confidence,
                });
            }
        }

        let floor_y = frame
            .get(LandmarkIndex::LeftAnkle)
            .y
            .min(frame.get(LandmarkIndex::RightAnkle).y);
        let height = frame.get(LandmarkIndex::Nose).y - floor_y;
        if height <= 0.0 || !height.is_finite() {
            return Err(CalibrationError::InvalidStance { height });
        }

        Ok(CalibrationPose {
            landmarks: frame.clone(),
            floor_y,
            scale: 1.0 / height,
        })
    }
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::from_config(&CalibrationConfig::default())
    }
}

// --- Save / Load ---

pub fn save_calibration<P: AsRef<Path>>(path: P, calibration: &CalibrationPose) -> Result<()> {
    let json = serde_json::to_string_pretty(calibration)?;
    fs::write(path, json).context("Failed to write calibration file")?;
    Ok(())
}

pub fn load_calibration<P: AsRef<Path>>(path: P) -> Result<CalibrationPose> {
    let content = fs::read_to_string(path).context("Failed to read calibration file")?;
    let calibration: CalibrationPose =
        serde_json::from_str(&content).context("Malformed calibration file")?;
    Ok(calibration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::tpose::tests::tpose_landmarks;
    use crate::pose::Landmark;

    fn approx_eq_f32(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    /// 直立座標のTポーズ: 頭 y=1.7, 足首 y=0.05 / 0.1
    fn upright_fixture() -> Vec<Landmark> {
        let mut raw = tpose_landmarks();
        for lm in raw.iter_mut() {
            lm.y = 1.0 - lm.y;
        }
        raw[LandmarkIndex::Nose as usize].y = 1.7;
        raw[LandmarkIndex::LeftAnkle as usize].y = 0.1;
        raw[LandmarkIndex::RightAnkle as usize].y = 0.05;
        raw
    }

    #[test]
    fn test_repeated_tpose_frames_calibrate() {
        let calibrator = Calibrator::default();
        let frame = LandmarkFrame::from_slice(&upright_fixture()).unwrap();
        for _ in 0..5 {
            let cal = calibrator.calibrate(&frame).unwrap();
            assert!(approx_eq_f32(cal.floor_y(), 0.05, 1e-6));
            assert!(approx_eq_f32(cal.scale(), 1.0 / (1.7 - 0.05), 1e-6));
        }
    }

    #[test]
    fn test_scale_invariance() {
        let calibrator = Calibrator::default();
        let a = upright_fixture();
        for &k in &[0.5f32, 2.0, 3.5] {
            let b: Vec<Landmark> = a
                .iter()
                .map(|l| Landmark::new(l.x * k, l.y * k, l.z * k, l.confidence))
                .collect();
            let ca = calibrator.calibrate(&LandmarkFrame::from_slice(&a).unwrap()).unwrap();
            let cb = calibrator.calibrate(&LandmarkFrame::from_slice(&b).unwrap()).unwrap();
            assert!(approx_eq_f32(ca.scale() / cb.scale(), k, 1e-4));
        }
    }

    #[test]
    fn test_low_confidence_ankle_fails() {
        let mut raw = upright_fixture();
        raw[LandmarkIndex::RightAnkle as usize].confidence = 0.1;
        let result = Calibrator::default().calibrate(&LandmarkFrame::from_slice(&raw).unwrap());
        assert!(matches!(
            result,
            Err(CalibrationError::LowConfidence { landmark: LandmarkIndex::RightAnkle, .. })
        ));
    }

    #[test]
    fn test_image_space_frame_is_invalid_stance() {
        // Y下向きのまま渡すと頭が床より下になる
        let frame = LandmarkFrame::from_slice(&tpose_landmarks()).unwrap();
        let result = Calibrator::default().calibrate(&frame);
        assert!(matches!(result, Err(CalibrationError::InvalidStance { .. })));
        assert!(Calibrator::default().calibrate(&frame.to_upright()).is_ok());
    }

    #[test]
    fn test_load_calibration_file() {
        let cal = Calibrator::default()
            .calibrate(&LandmarkFrame::from_slice(&upright_fixture()).unwrap())
            .unwrap();
        let path = std::env::temp_dir().join(format!("deadshot_cal_{}.json", std::process::id()));
        save_calibration(&path, &cal).unwrap();
        let loaded = load_calibration(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, cal);
    }

    #[test]
    fn test_load_rejects_truncated_landmarks() {
        let path = std::env::temp_dir().join(format!("deadshot_bad_cal_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"landmarks":[{"x":0,"y":0,"z":0,"confidence":1}],"floor_y":0,"scale":1}"#)
            .unwrap();
        let result = load_calibration(&path);
        let _ = std::fs::remove_file(&path);
        assert!(result.is_err());
    }
}
