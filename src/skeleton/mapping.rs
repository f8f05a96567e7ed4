use nalgebra::Vector3;
use tracing::warn;

use crate::error::MissingBoneError;
use crate::pose::{LandmarkFrame, LandmarkIndex};
use crate::skeleton::Skeleton;

/// ボーン方向の端点。単一ランドマークか2点の中点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandmarkRef {
    Single(LandmarkIndex),
    Midpoint(LandmarkIndex, LandmarkIndex),
}

impl LandmarkRef {
    /// 信頼度が足りなければ None
    pub fn resolve(&self, frame: &LandmarkFrame, min_confidence: f32) -> Option<Vector3<f32>> {
        let lm = match *self {
            LandmarkRef::Single(i) => *frame.get(i),
            LandmarkRef::Midpoint(a, b) => frame.midpoint(a, b),
        };
        lm.is_valid(min_confidence).then(|| lm.position())
    }
}

/// slerp重みの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoneRole {
    /// 腕・脚など2点で決まるボーン
    Limb,
    /// 腰・首など中点から作る胴体の基準ボーン
    Anchor,
}

/// ボーンの左右軸を合わせる向き (`from` → `to` が本人の左)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LateralRef {
    pub from: LandmarkRef,
    pub to: LandmarkRef,
}

impl LateralRef {
    pub fn resolve(&self, frame: &LandmarkFrame, min_confidence: f32) -> Option<Vector3<f32>> {
        let from = self.from.resolve(frame, min_confidence)?;
        let to = self.to.resolve(frame, min_confidence)?;
        Some(to - from)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneTarget {
    pub bone: String,
    pub origin: LandmarkRef,
    pub target: LandmarkRef,
    pub role: BoneRole,
    /// 軸まわりのひねり。なければ最短回転のみ
    pub lateral: Option<LateralRef>,
}

impl BoneTarget {
    pub fn limb(bone: &str, origin: LandmarkIndex, target: LandmarkRef) -> Self {
        Self {
            bone: bone.to_string(),
            origin: LandmarkRef::Single(origin),
            target,
            role: BoneRole::Limb,
            lateral: None,
        }
    }

    pub fn anchor(bone: &str, origin: LandmarkRef, target: LandmarkRef) -> Self {
        Self {
            bone: bone.to_string(),
            origin,
            target,
            role: BoneRole::Anchor,
            lateral: None,
        }
    }

    pub fn with_lateral(mut self, from: LandmarkRef, to: LandmarkRef) -> Self {
        self.lateral = Some(LateralRef { from, to });
        self
    }
}

/// ボーン名 → ランドマーク対応表
#[derive(Debug, Clone, PartialEq)]
pub struct BoneMapping {
    targets: Vec<BoneTarget>,
}

impl BoneMapping {
    pub fn new(targets: Vec<BoneTarget>) -> Self {
        Self { targets }
    }

    pub fn targets(&self) -> &[BoneTarget] {
        &self.targets
    }

    /// `*_JNT` 命名の人型リグ用
    pub fn default_rig() -> Self {
        use LandmarkIndex::*;
        use LandmarkRef::{Midpoint, Single};
        Self::new(vec![
            // 胴体の向き: 腰中点→肩中点を上、右腰→左腰で体の回りを決める
            BoneTarget::anchor(
                "C_hips_JNT",
                Midpoint(LeftHip, RightHip),
                Midpoint(LeftShoulder, RightShoulder),
            )
            .with_lateral(Single(RightHip), Single(LeftHip)),
            BoneTarget::anchor("C_neck_JNT", Midpoint(LeftShoulder, RightShoulder), Single(Nose)),
            // 頭: 鼻→両目中点を上、右目→左目で顔の向き
            BoneTarget::anchor("C_head_JNT", Single(Nose), Midpoint(LeftEye, RightEye))
                .with_lateral(Single(RightEye), Single(LeftEye)),
            // 腕
            BoneTarget::limb("L_arm_JNT", LeftShoulder, Single(LeftElbow)),
            BoneTarget::limb("L_forearm_JNT", LeftElbow, Single(LeftWrist)),
            BoneTarget::limb("L_hand_JNT", LeftWrist, Midpoint(LeftPinky, LeftIndex)),
            BoneTarget::limb("R_arm_JNT", RightShoulder, Single(RightElbow)),
            BoneTarget::limb("R_forearm_JNT", RightElbow, Single(RightWrist)),
            BoneTarget::limb("R_hand_JNT", RightWrist, Midpoint(RightPinky, RightIndex)),
            // 脚
            BoneTarget::limb("L_thigh_JNT", LeftHip, Single(LeftKnee)),
            BoneTarget::limb("L_knee_JNT", LeftKnee, Single(LeftAnkle)),
            BoneTarget::limb("L_foot_JNT", LeftAnkle, Single(LeftFootIndex)),
            BoneTarget::limb("R_thigh_JNT", RightHip, Single(RightKnee)),
            BoneTarget::limb("R_knee_JNT", RightKnee, Single(RightAnkle)),
            BoneTarget::limb("R_foot_JNT", RightAnkle, Single(RightFootIndex)),
        ])
    }
}

impl Default for BoneMapping {
    fn default() -> Self {
        Self::default_rig()
    }
}

/// スケルトンのインデックスに解決済みの対応
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedBone {
    pub bone: usize,
    pub origin: LandmarkRef,
    pub target: LandmarkRef,
    pub role: BoneRole,
    pub lateral: Option<LateralRef>,
}

/// 親→子の順に並んだ解決済みマッピング
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMapping {
    bones: Vec<ResolvedBone>,
    missing: Vec<MissingBoneError>,
}

impl ResolvedMapping {
    /// スケルトンにないボーンは読み込み時に一度だけ警告して除外する
    pub fn resolve(mapping: &BoneMapping, skeleton: &Skeleton) -> Self {
        let mut bones = Vec::with_capacity(mapping.targets().len());
        let mut missing = Vec::new();
        for target in mapping.targets() {
            match skeleton.index_of(&target.bone) {
                Some(bone) => bones.push(ResolvedBone {
                    bone,
                    origin: target.origin,
                    target: target.target,
                    role: target.role,
                    lateral: target.lateral,
                }),
                None => {
                    let err = MissingBoneError { bone: target.bone.clone() };
                    warn!("{}", err);
                    missing.push(err);
                }
            }
        }
        // 親の回転が先に確定するように
        bones.sort_by_key(|b| b.bone);
        Self { bones, missing }
    }

    pub fn bones(&self) -> &[ResolvedBone] {
        &self.bones
    }

    pub fn missing(&self) -> &[MissingBoneError] {
        &self.missing
    }
}
