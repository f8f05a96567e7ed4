pub mod mapping;

pub use mapping::{BoneMapping, BoneRole, BoneTarget, LandmarkRef, LateralRef, ResolvedBone, ResolvedMapping};

use anyhow::{Context, Result};
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::SkeletonError;

// --- 定義ファイル ---

/// ボーン1本の定義（親ローカルのバインド姿勢）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoneDef {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub translation: [f32; 3],
    /// クォータニオン [x, y, z, w]
    #[serde(default = "identity_rotation")]
    pub rotation: [f32; 4],
}

fn identity_rotation() -> [f32; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

/// 正規化できない回転とみなすノルム
const MIN_ROTATION_NORM: f32 = 1e-6;

impl BoneDef {
    fn bind_transform(&self) -> Result<(Vector3<f32>, UnitQuaternion<f32>), SkeletonError> {
        let invalid = || SkeletonError::InvalidTransform { bone: self.name.clone() };
        if !self.translation.iter().chain(self.rotation.iter()).all(|v| v.is_finite()) {
            return Err(invalid());
        }
        let [x, y, z, w] = self.rotation;
        let rotation =
            UnitQuaternion::try_new(Quaternion::new(w, x, y, z), MIN_ROTATION_NORM).ok_or_else(invalid)?;
        Ok((Vector3::from(self.translation), rotation))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonDef {
    pub bones: Vec<BoneDef>,
}

impl SkeletonDef {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read skeleton {}", path.display()))?;
        let def = serde_json::from_str(&content)
            .with_context(|| format!("Malformed skeleton {}", path.display()))?;
        Ok(def)
    }
}

// --- 階層 ---

/// 読み込み後は不変のボーン階層
///
/// インデックスは親が必ず子より小さくなるよう並べ替えてあり、
/// ルートは常に 0。
#[derive(Debug, Clone)]
pub struct Skeleton {
    names: Vec<String>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    bind_translations: Vec<Vector3<f32>>,
    bind_rotations: Vec<UnitQuaternion<f32>>,
    index: HashMap<String, usize>,
}

impl Skeleton {
    pub fn from_def(def: &SkeletonDef) -> Result<Self, SkeletonError> {
        if def.bones.is_empty() {
            return Err(SkeletonError::Empty);
        }

        let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(def.bones.len());
        for (i, bone) in def.bones.iter().enumerate() {
            if by_name.insert(bone.name.as_str(), i).is_some() {
                return Err(SkeletonError::DuplicateBone(bone.name.clone()));
            }
        }

        // 定義順のまま子リストを作る
        let mut def_children: Vec<Vec<usize>> = vec![Vec::new(); def.bones.len()];
        let mut roots = Vec::new();
        for (i, bone) in def.bones.iter().enumerate() {
            match &bone.parent {
                None => roots.push(i),
                Some(parent) => match by_name.get(parent.as_str()) {
                    Some(&p) => def_children[p].push(i),
                    None => {
                        return Err(SkeletonError::UnknownParent {
                            bone: bone.name.clone(),
                            parent: parent.clone(),
                        })
                    }
                },
            }
        }
        if roots.len() != 1 {
            return Err(SkeletonError::RootCount(roots.len()));
        }

        // ルートからの深さ優先順。到達できないボーンは循環の一部
        let mut order = Vec::with_capacity(def.bones.len());
        let mut stack = vec![roots[0]];
        while let Some(i) = stack.pop() {
            order.push(i);
            stack.extend(def_children[i].iter().rev());
        }
        if order.len() != def.bones.len() {
            let mut visited = vec![false; def.bones.len()];
            for &i in &order {
                visited[i] = true;
            }
            let stray = visited.iter().position(|v| !v).unwrap_or(0);
            return Err(SkeletonError::Cycle(def.bones[stray].name.clone()));
        }

        let mut remap = vec![0usize; def.bones.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = new;
        }

        let mut skeleton = Skeleton {
            names: Vec::with_capacity(order.len()),
            parents: Vec::with_capacity(order.len()),
            children: vec![Vec::new(); order.len()],
            bind_translations: Vec::with_capacity(order.len()),
            bind_rotations: Vec::with_capacity(order.len()),
            index: HashMap::with_capacity(order.len()),
        };
        for (new, &old) in order.iter().enumerate() {
            let bone = &def.bones[old];
            let parent = bone
                .parent
                .as_deref()
                .and_then(|p| by_name.get(p))
                .map(|&p| remap[p]);
            if let Some(p) = parent {
                skeleton.children[p].push(new);
            }
            let (translation, rotation) = bone.bind_transform()?;
            skeleton.names.push(bone.name.clone());
            skeleton.parents.push(parent);
            skeleton.bind_translations.push(translation);
            skeleton.bind_rotations.push(rotation);
            skeleton.index.insert(bone.name.clone(), new);
        }
        Ok(skeleton)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let def = SkeletonDef::load(&path)?;
        let skeleton = Self::from_def(&def)
            .with_context(|| format!("Invalid skeleton {}", path.as_ref().display()))?;
        Ok(skeleton)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn root(&self) -> usize {
        0
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn name(&self, bone: usize) -> &str {
        &self.names[bone]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn parent(&self, bone: usize) -> Option<usize> {
        self.parents[bone]
    }

    pub fn children(&self, bone: usize) -> &[usize] {
        &self.children[bone]
    }

    /// 定義順で最初の子
    pub fn first_child(&self, bone: usize) -> Option<usize> {
        self.children[bone].first().copied()
    }

    pub fn bind_translation(&self, bone: usize) -> &Vector3<f32> {
        &self.bind_translations[bone]
    }

    pub fn bind_rotation(&self, bone: usize) -> &UnitQuaternion<f32> {
        &self.bind_rotations[bone]
    }

    pub fn bind_pose(&self) -> SkeletonPose {
        SkeletonPose {
            rotations: self.bind_rotations.clone(),
            root_translation: self.bind_translations[self.root()],
        }
    }

    /// バインド姿勢での上下の広がり
    pub fn bind_height(&self) -> f32 {
        let world = self.bind_pose().world_transforms(self);
        let (lo, hi) = world.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), w| {
            let y = w.translation.vector.y;
            (lo.min(y), hi.max(y))
        });
        hi - lo
    }
}

// --- 姿勢 ---

/// ボーンごとのローカル回転とルート位置
#[derive(Debug, Clone, PartialEq)]
pub struct SkeletonPose {
    rotations: Vec<UnitQuaternion<f32>>,
    root_translation: Vector3<f32>,
}

impl SkeletonPose {
    pub fn rotations(&self) -> &[UnitQuaternion<f32>] {
        &self.rotations
    }

    pub fn rotation(&self, bone: usize) -> &UnitQuaternion<f32> {
        &self.rotations[bone]
    }

    pub(crate) fn set_rotation(&mut self, bone: usize, rotation: UnitQuaternion<f32>) {
        self.rotations[bone] = rotation;
    }

    pub fn root_translation(&self) -> &Vector3<f32> {
        &self.root_translation
    }

    pub(crate) fn set_root_translation(&mut self, translation: Vector3<f32>) {
        self.root_translation = translation;
    }

    /// 各ボーンのワールド変換（親→子の順に合成）
    pub fn world_transforms(&self, skeleton: &Skeleton) -> Vec<Isometry3<f32>> {
        let mut world: Vec<Isometry3<f32>> = Vec::with_capacity(skeleton.len());
        for bone in 0..skeleton.len() {
            let translation = if bone == skeleton.root() {
                self.root_translation
            } else {
                *skeleton.bind_translation(bone)
            };
            let local = Isometry3::from_parts(Translation3::from(translation), self.rotations[bone]);
            let transform = match skeleton.parent(bone) {
                Some(p) => world[p] * local,
                None => local,
            };
            world.push(transform);
        }
        world
    }

    /// (ボーン名, ローカル回転) の組で走査する
    pub fn named_rotations<'a>(
        &'a self,
        skeleton: &'a Skeleton,
    ) -> impl Iterator<Item = (&'a str, &'a UnitQuaternion<f32>)> + 'a {
        skeleton.names().iter().map(String::as_str).zip(self.rotations.iter())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn bone(name: &str, parent: Option<&str>, translation: [f32; 3]) -> BoneDef {
        BoneDef {
            name: name.to_string(),
            parent: parent.map(str::to_string),
            translation,
            rotation: identity_rotation(),
        }
    }

    /// 腕を下ろしたバインド姿勢の人型リグ（腰の高さ 1.0）
    pub(crate) fn humanoid_def() -> SkeletonDef {
        SkeletonDef {
            bones: vec![
                bone("C_hips_JNT", None, [0.0, 1.0, 0.0]),
                bone("C_spine_JNT", Some("C_hips_JNT"), [0.0, 0.25, 0.0]),
                bone("C_neck_JNT", Some("C_spine_JNT"), [0.0, 0.3, 0.0]),
                bone("C_head_JNT", Some("C_neck_JNT"), [0.0, 0.15, 0.0]),
                bone("L_arm_JNT", Some("C_spine_JNT"), [0.2, 0.25, 0.0]),
                bone("L_forearm_JNT", Some("L_arm_JNT"), [0.0, -0.3, 0.0]),
                bone("L_hand_JNT", Some("L_forearm_JNT"), [0.0, -0.25, 0.0]),
                bone("R_arm_JNT", Some("C_spine_JNT"), [-0.2, 0.25, 0.0]),
                bone("R_forearm_JNT", Some("R_arm_JNT"), [0.0, -0.3, 0.0]),
                bone("R_hand_JNT", Some("R_forearm_JNT"), [0.0, -0.25, 0.0]),
                bone("L_thigh_JNT", Some("C_hips_JNT"), [0.1, -0.05, 0.0]),
                bone("L_knee_JNT", Some("L_thigh_JNT"), [0.0, -0.45, 0.0]),
                bone("L_foot_JNT", Some("L_knee_JNT"), [0.0, -0.45, 0.0]),
                bone("L_toe_JNT", Some("L_foot_JNT"), [0.0, -0.05, 0.12]),
                bone("R_thigh_JNT", Some("C_hips_JNT"), [-0.1, -0.05, 0.0]),
                bone("R_knee_JNT", Some("R_thigh_JNT"), [0.0, -0.45, 0.0]),
                bone("R_foot_JNT", Some("R_knee_JNT"), [0.0, -0.45, 0.0]),
                bone("R_toe_JNT", Some("R_foot_JNT"), [0.0, -0.05, 0.12]),
            ],
        }
    }

    pub(crate) fn humanoid() -> Skeleton {
        Skeleton::from_def(&humanoid_def()).unwrap()
    }

    #[test]
    fn test_parents_precede_children() {
        // 子を先に書いても並べ替えられる
        let mut def = humanoid_def();
        def.bones.reverse();
        let skeleton = Skeleton::from_def(&def).unwrap();
        assert_eq!(skeleton.name(skeleton.root()), "C_hips_JNT");
        for bone in 0..skeleton.len() {
            if let Some(p) = skeleton.parent(bone) {
                assert!(p < bone, "{} before its parent", skeleton.name(bone));
            }
        }
        assert_eq!(skeleton.len(), 18);
    }

    #[test]
    fn test_first_child_follows_definition_order() {
        let skeleton = humanoid();
        let hips = skeleton.index_of("C_hips_JNT").unwrap();
        let spine = skeleton.index_of("C_spine_JNT").unwrap();
        assert_eq!(skeleton.first_child(hips), Some(spine));
        let hand = skeleton.index_of("L_hand_JNT").unwrap();
        assert_eq!(skeleton.first_child(hand), None);
    }

    #[test]
    fn test_rejects_invalid_hierarchy() {
        let mut def = humanoid_def();
        def.bones.push(bone("C_hips_JNT", None, [0.0; 3]));
        assert_eq!(
            Skeleton::from_def(&def).unwrap_err(),
            SkeletonError::DuplicateBone("C_hips_JNT".to_string())
        );

        let mut def = humanoid_def();
        def.bones.push(bone("X_JNT", Some("missing"), [0.0; 3]));
        assert!(matches!(
            Skeleton::from_def(&def),
            Err(SkeletonError::UnknownParent { .. })
        ));

        let mut def = humanoid_def();
        def.bones.push(bone("Other_root", None, [0.0; 3]));
        assert_eq!(Skeleton::from_def(&def).unwrap_err(), SkeletonError::RootCount(2));

        let mut def = humanoid_def();
        def.bones.push(bone("A_JNT", Some("B_JNT"), [0.0; 3]));
        def.bones.push(bone("B_JNT", Some("A_JNT"), [0.0; 3]));
        assert!(matches!(Skeleton::from_def(&def), Err(SkeletonError::Cycle(_))));

        assert_eq!(
            Skeleton::from_def(&SkeletonDef { bones: vec![] }).unwrap_err(),
            SkeletonError::Empty
        );
    }

    #[test]
    fn test_rejects_degenerate_bind_transform() {
        let mut def = humanoid_def();
        def.bones[4].rotation = [0.0; 4];
        assert_eq!(
            Skeleton::from_def(&def).unwrap_err(),
            SkeletonError::InvalidTransform { bone: "L_arm_JNT".to_string() }
        );

        let mut def = humanoid_def();
        def.bones[2].rotation = [0.0, f32::INFINITY, 0.0, 1.0];
        assert!(matches!(
            Skeleton::from_def(&def),
            Err(SkeletonError::InvalidTransform { .. })
        ));

        let mut def = humanoid_def();
        def.bones[7].translation = [0.0, f32::NAN, 0.0];
        assert_eq!(
            Skeleton::from_def(&def).unwrap_err(),
            SkeletonError::InvalidTransform { bone: "R_arm_JNT".to_string() }
        );

        // 非正規化でも向きがあれば正規化して受け付ける
        let mut def = humanoid_def();
        def.bones[4].rotation = [0.0, 0.0, 0.0, 2.0];
        let skeleton = Skeleton::from_def(&def).unwrap();
        let arm = skeleton.index_of("L_arm_JNT").unwrap();
        assert!(skeleton.bind_rotation(arm).angle() < 1e-6);
    }

    #[test]
    fn test_bind_world_transforms() {
        let skeleton = humanoid();
        let world = skeleton.bind_pose().world_transforms(&skeleton);
        let hand = skeleton.index_of("L_hand_JNT").unwrap();
        let p = world[hand].translation.vector;
        assert!((p - Vector3::new(0.2, 1.0 + 0.25 + 0.25 - 0.55, 0.0)).norm() < 1e-5);
        // 頭 1.7, つま先 0.0
        assert!((skeleton.bind_height() - 1.7).abs() < 1e-5);
    }

    #[test]
    fn test_named_rotations_cover_every_bone() {
        let skeleton = humanoid();
        let pose = skeleton.bind_pose();
        let names: Vec<&str> = pose.named_rotations(&skeleton).map(|(name, _)| name).collect();
        assert_eq!(names.len(), skeleton.len());
        assert_eq!(names[0], "C_hips_JNT");
        assert!(pose
            .named_rotations(&skeleton)
            .all(|(_, q)| *q == UnitQuaternion::identity()));
        let spine = skeleton.index_of("C_spine_JNT").unwrap();
        assert_eq!(skeleton.children(spine).len(), 3);
    }

    #[test]
    fn test_parse_definition_json() {
        let json = r#"{"bones":[
            {"name":"root"},
            {"name":"child","parent":"root","translation":[0,1,0],"rotation":[0,0,0.7071068,0.7071068]}
        ]}"#;
        let def: SkeletonDef = serde_json::from_str(json).unwrap();
        let skeleton = Skeleton::from_def(&def).unwrap();
        let child = skeleton.index_of("child").unwrap();
        assert!((skeleton.bind_rotation(child).angle() - std::f32::consts::FRAC_PI_2).abs() < 1e-4);
        assert_eq!(skeleton.bind_translation(skeleton.root()), &Vector3::zeros());
    }
}
