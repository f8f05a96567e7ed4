use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// BlazePose の 33 ランドマークインデックス
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(usize)]
pub enum LandmarkIndex {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl LandmarkIndex {
    pub const COUNT: usize = 33;

    pub fn from_index(index: usize) -> Option<Self> {
        use LandmarkIndex::*;
        const ALL: [LandmarkIndex; LandmarkIndex::COUNT] = [
            Nose, LeftEyeInner, LeftEye, LeftEyeOuter, RightEyeInner, RightEye, RightEyeOuter,
            LeftEar, RightEar, MouthLeft, MouthRight, LeftShoulder, RightShoulder, LeftElbow,
            RightElbow, LeftWrist, RightWrist, LeftPinky, RightPinky, LeftIndex, RightIndex,
            LeftThumb, RightThumb, LeftHip, RightHip, LeftKnee, RightKnee, LeftAnkle, RightAnkle,
            LeftHeel, RightHeel, LeftFootIndex, RightFootIndex,
        ];
        ALL.get(index).copied()
    }
}

/// 単一ランドマーク
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Landmark {
    /// 正規化されたX座標 (0.0〜1.0, 画像右向き)
    pub x: f32,
    /// 正規化されたY座標 (0.0〜1.0, 画像下向き)
    pub y: f32,
    /// 腰中心基準の相対奥行き
    pub z: f32,
    /// 信頼度スコア (0.0〜1.0)
    #[serde(alias = "visibility")]
    pub confidence: f32,
}

impl Landmark {
    pub fn new(x: f32, y: f32, z: f32, confidence: f32) -> Self {
        Self { x, y, z, confidence }
    }

    /// 信頼度が閾値以上か
    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }

    pub fn position(&self) -> Vector3<f32> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn distance(&self, other: &Landmark) -> f32 {
        (self.position() - other.position()).norm()
    }
}

/// 検証済みの 33 ランドマーク
///
/// 長さと有限性は構築時に保証されるので、以降はインデックスで安全に参照できる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Landmark>", into = "Vec<Landmark>")]
pub struct LandmarkFrame {
    landmarks: [Landmark; LandmarkIndex::COUNT],
}

impl LandmarkFrame {
    /// 上流の生データを検証して取り込む
    pub fn from_slice(raw: &[Landmark]) -> Result<Self, ValidationError> {
        if raw.len() != LandmarkIndex::COUNT {
            return Err(ValidationError::WrongLength {
                expected: LandmarkIndex::COUNT,
                actual: raw.len(),
            });
        }
        for (index, lm) in raw.iter().enumerate() {
            if !(lm.x.is_finite() && lm.y.is_finite() && lm.z.is_finite() && lm.confidence.is_finite()) {
                return Err(ValidationError::NonFinite { index });
            }
            if !(0.0..=1.0).contains(&lm.confidence) {
                return Err(ValidationError::ConfidenceOutOfRange {
                    index,
                    value: lm.confidence,
                });
            }
        }
        let mut landmarks = [Landmark::default(); LandmarkIndex::COUNT];
        landmarks.copy_from_slice(raw);
        Ok(Self { landmarks })
    }

    /// 内部で計算済みの値から作る（検証は呼び出し側の責任）
    pub(crate) fn from_array(landmarks: [Landmark; LandmarkIndex::COUNT]) -> Self {
        Self { landmarks }
    }

    pub fn get(&self, index: LandmarkIndex) -> &Landmark {
        &self.landmarks[index as usize]
    }

    pub fn landmarks(&self) -> &[Landmark; LandmarkIndex::COUNT] {
        &self.landmarks
    }

    /// 2点の中点（信頼度は低い方）
    pub fn midpoint(&self, a: LandmarkIndex, b: LandmarkIndex) -> Landmark {
        let la = self.get(a);
        let lb = self.get(b);
        Landmark::new(
            (la.x + lb.x) / 2.0,
            (la.y + lb.y) / 2.0,
            (la.z + lb.z) / 2.0,
            la.confidence.min(lb.confidence),
        )
    }

    /// 画像座標 (Y下向き) → 直立座標 (Y上向き, 0〜1)
    pub fn to_upright(&self) -> Self {
        let mut landmarks = self.landmarks;
        for lm in landmarks.iter_mut() {
            lm.y = 1.0 - lm.y;
        }
        Self { landmarks }
    }
}

impl TryFrom<Vec<Landmark>> for LandmarkFrame {
    type Error = ValidationError;

    fn try_from(raw: Vec<Landmark>) -> Result<Self, Self::Error> {
        Self::from_slice(&raw)
    }
}

impl From<LandmarkFrame> for Vec<Landmark> {
    fn from(frame: LandmarkFrame) -> Self {
        frame.landmarks.to_vec()
    }
}

/// 録画された1フレーム
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseFrame {
    pub landmarks: LandmarkFrame,
    pub timestamp_ms: f64,
}
