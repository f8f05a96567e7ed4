//! ライブラリ全体のエラー型

use thiserror::Error;

use crate::pose::LandmarkIndex;

/// 入力フレームの検証エラー（そのtickのみ破棄）
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("landmark frame must contain {expected} landmarks (got {actual})")]
    WrongLength { expected: usize, actual: usize },
    #[error("landmark {index} has a non-finite component")]
    NonFinite { index: usize },
    #[error("landmark {index} confidence {value} is outside [0, 1]")]
    ConfidenceOutOfRange { index: usize, value: f32 },
}

/// キャリブレーション失敗（再試行可能）
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalibrationError {
    #[error("landmark {landmark:?} is not visible enough (confidence {confidence:.2})")]
    LowConfidence { landmark: LandmarkIndex, confidence: f32 },
    #[error("invalid stance: head-to-floor height {height} is not positive")]
    InvalidStance { height: f32 },
    #[error("no T-pose detected before the calibration timer expired")]
    Timeout,
    #[error("calibration cancelled")]
    Cancelled,
}

/// マッピングが参照するボーンがスケルトンに存在しない
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mapped bone '{bone}' does not exist in the loaded skeleton")]
pub struct MissingBoneError {
    pub bone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkeletonError {
    #[error("skeleton has no bones")]
    Empty,
    #[error("bone '{0}' is defined more than once")]
    DuplicateBone(String),
    #[error("bone '{bone}' references unknown parent '{parent}'")]
    UnknownParent { bone: String, parent: String },
    #[error("skeleton must have exactly one root bone (found {0})")]
    RootCount(usize),
    #[error("bone hierarchy contains a cycle through '{0}'")]
    Cycle(String),
    #[error("bone '{bone}' has a non-finite or zero-length bind transform")]
    InvalidTransform { bone: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BakeError {
    #[error("history is empty, nothing to bake")]
    EmptyHistory,
    #[error("fps must be positive and finite (got {0})")]
    InvalidFps(f32),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write animation: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode animation: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("clip has no keyframes")]
    EmptyClip,
    #[error("animation of {0} bytes exceeds the GLB size limit")]
    TooLarge(usize),
}

/// レビュー中の保存失敗。セッションはレビューに留まる
#[derive(Debug, Error)]
pub enum SaveError {
    #[error(transparent)]
    Bake(#[from] BakeError),
    #[error(transparent)]
    Export(#[from] ExportError),
}
