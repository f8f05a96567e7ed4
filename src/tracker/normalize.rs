use crate::calibration::CalibrationPose;
use crate::pose::{Landmark, LandmarkFrame, LandmarkIndex};

/// これ未満の肩幅は計測不能として扱う
const MIN_SHOULDER_WIDTH: f32 = 1e-6;

/// 画像座標のランドマークをスケルトン基準の座標へ変換する（状態を持たない）
///
/// - 肩幅が `reference_scale` になるようにスケール
/// - X: 肩中点を原点
/// - Y: 最も低いランドマークを 0 とし上向き正
/// - Z: 符号反転（カメラ奥 → スケルトン前方）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseNormalizer {
    reference_scale: f32,
}

impl PoseNormalizer {
    pub fn new(reference_scale: f32) -> Self {
        Self { reference_scale }
    }

    /// 演者の肩幅/身長比をスケルトンの身長に当てはめた基準スケール
    pub fn from_calibration(calibration: &CalibrationPose, skeleton_height: f32) -> Self {
        let frame = &calibration.landmarks;
        let width = frame
            .get(LandmarkIndex::LeftShoulder)
            .distance(frame.get(LandmarkIndex::RightShoulder));
        Self::new(width * calibration.scale * skeleton_height)
    }

    pub fn reference_scale(&self) -> f32 {
        self.reference_scale
    }

    pub fn normalize(&self, frame: &LandmarkFrame) -> LandmarkFrame {
        normalize(frame, self.reference_scale)
    }
}

pub fn normalize(frame: &LandmarkFrame, reference_scale: f32) -> LandmarkFrame {
    let ls = frame.get(LandmarkIndex::LeftShoulder);
    let rs = frame.get(LandmarkIndex::RightShoulder);
    let width = ls.distance(rs);
    let scale = if width > MIN_SHOULDER_WIDTH {
        reference_scale / width
    } else {
        reference_scale
    };

    let offset_x = -(ls.x + rs.x) / 2.0;
    let offset_y = frame
        .landmarks()
        .iter()
        .map(|l| l.y)
        .fold(f32::NEG_INFINITY, f32::max);

    let mut out = [Landmark::default(); LandmarkIndex::COUNT];
    for (dst, src) in out.iter_mut().zip(frame.landmarks().iter()) {
        *dst = Landmark::new(
            (src.x + offset_x) * scale,
            (-src.y + offset_y) * scale,
            -src.z * scale,
            src.confidence,
        );
    }
    LandmarkFrame::from_array(out)
}
