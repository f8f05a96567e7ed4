use nalgebra::{Isometry3, Unit, UnitQuaternion, Vector3};
use std::f32::consts::PI;
use std::sync::Arc;

use crate::config::RetargetConfig;
use crate::error::MissingBoneError;
use crate::pose::{LandmarkFrame, LandmarkIndex};
use crate::skeleton::{BoneMapping, BoneRole, ResolvedBone, ResolvedMapping, Skeleton, SkeletonPose};

/// これより短い方向ベクトルは向きを決められない
const MIN_DIRECTION: f32 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetargetStats {
    pub applied: usize,
    /// ランドマーク欠損で前回の回転を維持したボーン数
    pub skipped: usize,
}

/// 正規化済みランドマークをスケルトンのローカル回転へ写す
///
/// ボーンの「前方」(最初の子への方向、子がなければ `default_forward`) を
/// ランドマーク方向へ最短回転で合わせ、役割ごとの重みで slerp する。
/// 左右の参照を持つアンカー (腰・頭) は、合わせた軸まわりに `lateral_axis`
/// を参照方向へひねってから slerp する。
#[derive(Debug, Clone)]
pub struct Retargeter {
    skeleton: Arc<Skeleton>,
    mapping: ResolvedMapping,
    pose: SkeletonPose,
    world: Vec<Isometry3<f32>>,
    limb_weight: f32,
    anchor_weight: f32,
    default_forward: Unit<Vector3<f32>>,
    lateral_axis: Unit<Vector3<f32>>,
    min_confidence: f32,
    track_root: bool,
}

impl Retargeter {
    pub fn new(skeleton: Arc<Skeleton>, mapping: &BoneMapping, config: &RetargetConfig) -> Self {
        let mapping = ResolvedMapping::resolve(mapping, &skeleton);
        let pose = skeleton.bind_pose();
        let world = pose.world_transforms(&skeleton);
        let default_forward = Unit::try_new(Vector3::from(config.default_forward), MIN_DIRECTION)
            .unwrap_or_else(Vector3::y_axis);
        let lateral_axis = Unit::try_new(Vector3::from(config.lateral_axis), MIN_DIRECTION)
            .unwrap_or_else(Vector3::x_axis);
        Self {
            skeleton,
            mapping,
            pose,
            world,
            limb_weight: config.limb_weight.clamp(0.0, 1.0),
            anchor_weight: config.anchor_weight.clamp(0.0, 1.0),
            default_forward,
            lateral_axis,
            min_confidence: config.min_confidence,
            track_root: config.track_root,
        }
    }

    pub fn with_weights(mut self, limb: f32, anchor: f32) -> Self {
        self.limb_weight = limb.clamp(0.0, 1.0);
        self.anchor_weight = anchor.clamp(0.0, 1.0);
        self
    }

    pub fn skeleton(&self) -> &Arc<Skeleton> {
        &self.skeleton
    }

    pub fn pose(&self) -> &SkeletonPose {
        &self.pose
    }

    pub fn missing_bones(&self) -> &[MissingBoneError] {
        self.mapping.missing()
    }

    /// バインド姿勢へ戻す
    pub fn reset(&mut self) {
        self.pose = self.skeleton.bind_pose();
        self.world = self.pose.world_transforms(&self.skeleton);
    }

    pub fn retarget(&mut self, frame: &LandmarkFrame) -> RetargetStats {
        self.world = self.pose.world_transforms(&self.skeleton);

        let mut stats = RetargetStats::default();
        for i in 0..self.mapping.bones().len() {
            let entry = self.mapping.bones()[i];
            if self.align_bone(&entry, frame) {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }

        // 回転が全部決まってから位置を合わせる
        if self.track_root {
            self.place_root(frame);
        }
        stats
    }

    fn align_bone(&mut self, entry: &ResolvedBone, frame: &LandmarkFrame) -> bool {
        let (Some(origin), Some(target)) = (
            entry.origin.resolve(frame, self.min_confidence),
            entry.target.resolve(frame, self.min_confidence),
        ) else {
            return false;
        };
        let Some(direction) = Unit::try_new(target - origin, MIN_DIRECTION) else {
            return false;
        };

        let bone = entry.bone;
        let bone_rotation = self.world[bone].rotation;
        let forward = self
            .skeleton
            .first_child(bone)
            .and_then(|c| Unit::try_new(bone_rotation * self.skeleton.bind_translation(c), MIN_DIRECTION))
            .unwrap_or_else(|| bone_rotation * self.default_forward);

        // 親空間で比較する
        let parent_rotation = self
            .skeleton
            .parent(bone)
            .map(|p| self.world[p].rotation)
            .unwrap_or_else(UnitQuaternion::identity);
        let to_parent = parent_rotation.inverse();
        let axis = to_parent * direction;
        let arc = shortest_arc(&(to_parent * forward), &axis);

        let current = *self.pose.rotation(bone);
        let mut aligned = arc * current;
        if let Some(lateral) = entry
            .lateral
            .and_then(|l| l.resolve(frame, self.min_confidence))
        {
            let current_lateral = aligned * self.lateral_axis.into_inner();
            let twist = twist_about(&axis, &current_lateral, &(to_parent * lateral));
            aligned = twist * aligned;
        }
        let weight = match entry.role {
            BoneRole::Limb => self.limb_weight,
            BoneRole::Anchor => self.anchor_weight,
        };
        self.pose.set_rotation(bone, slerp(&current, &aligned, weight));

        // 後続 (子孫はすべてインデックスが大きい) のワールド変換を更新
        self.refresh_world_from(bone);
        true
    }

    fn refresh_world_from(&mut self, start: usize) {
        let root = self.skeleton.root();
        for bone in start..self.skeleton.len() {
            let translation = if bone == root {
                *self.pose.root_translation()
            } else {
                *self.skeleton.bind_translation(bone)
            };
            let local = Isometry3::from_parts(translation.into(), *self.pose.rotation(bone));
            self.world[bone] = match self.skeleton.parent(bone) {
                Some(p) => self.world[p] * local,
                None => local,
            };
        }
    }

    /// ルートの水平位置を腰中点に合わせ、最も低いボーンを y = 0 に接地させる
    fn place_root(&mut self, frame: &LandmarkFrame) {
        let mut translation = *self.pose.root_translation();
        let hips = frame.midpoint(LandmarkIndex::LeftHip, LandmarkIndex::RightHip);
        // 腰が見えなければ前回の水平位置のまま
        if hips.is_valid(self.min_confidence) {
            translation.x = hips.x;
            translation.z = hips.z;
        }
        self.pose.set_root_translation(translation);
        self.refresh_world_from(self.skeleton.root());

        let lowest = self
            .world
            .iter()
            .map(|w| w.translation.vector.y)
            .fold(f32::INFINITY, f32::min);
        if lowest.is_finite() {
            translation.y -= lowest;
            self.pose.set_root_translation(translation);
            self.refresh_world_from(self.skeleton.root());
        }
    }
}

/// `from` を `to` に重ねる最短回転。真逆なら直交軸まわりに 180°
pub fn shortest_arc(from: &Unit<Vector3<f32>>, to: &Unit<Vector3<f32>>) -> UnitQuaternion<f32> {
    UnitQuaternion::rotation_between_axis(from, to).unwrap_or_else(|| {
        let helper = if from.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
        let axis = Unit::new_normalize(from.cross(&helper));
        UnitQuaternion::from_axis_angle(&axis, PI)
    })
}

/// `axis` まわりの回転で `current` を `target` に重ねる。軸に直交する成分だけを見る
fn twist_about(axis: &Unit<Vector3<f32>>, current: &Vector3<f32>, target: &Vector3<f32>) -> UnitQuaternion<f32> {
    let n = axis.into_inner();
    let project = |v: &Vector3<f32>| Unit::try_new(v - n * v.dot(&n), MIN_DIRECTION).map(Unit::into_inner);
    let (Some(c), Some(t)) = (project(current), project(target)) else {
        // 参照が軸とほぼ平行ならひねらない
        return UnitQuaternion::identity();
    };
    let angle = c.cross(&t).dot(&n).atan2(c.dot(&t));
    UnitQuaternion::from_axis_angle(axis, angle)
}

/// ほぼ同じ回転同士は補間できないので到達先をそのまま返す
fn slerp(from: &UnitQuaternion<f32>, to: &UnitQuaternion<f32>, t: f32) -> UnitQuaternion<f32> {
    if t >= 1.0 {
        return *to;
    }
    from.try_slerp(to, t, 1e-6).unwrap_or(*to)
}
