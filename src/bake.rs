use nalgebra::UnitQuaternion;
use serde::Serialize;

use crate::capture::history::FrozenHistory;
use crate::error::BakeError;
use crate::retarget::Retargeter;
use crate::tracker::PoseNormalizer;

/// ボーン1本分の回転キー列
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoneTrack {
    bone: String,
    /// [x, y, z, w]
    rotations: Vec<[f32; 4]>,
}

impl BoneTrack {
    pub fn bone(&self) -> &str {
        &self.bone
    }

    pub fn rotations(&self) -> &[[f32; 4]] {
        &self.rotations
    }

    pub fn rotation(&self, key: usize) -> Option<UnitQuaternion<f32>> {
        self.rotations.get(key).map(|&[x, y, z, w]| {
            UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(w, x, y, z))
        })
    }
}

/// ベイク済みアニメーション。全トラックが同じ時刻列を共有する
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Clip {
    name: String,
    fps: f32,
    /// 秒。i 番目のキーは i / fps
    times: Vec<f32>,
    tracks: Vec<BoneTrack>,
    /// ルートボーンの位置キー
    root_translations: Vec<[f32; 3]>,
}

impl Clip {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn times(&self) -> &[f32] {
        &self.times
    }

    pub fn tracks(&self) -> &[BoneTrack] {
        &self.tracks
    }

    pub fn track(&self, bone: &str) -> Option<&BoneTrack> {
        self.tracks.iter().find(|t| t.bone == bone)
    }

    pub fn root_translations(&self) -> &[[f32; 3]] {
        &self.root_translations
    }

    pub fn keyframe_count(&self) -> usize {
        self.times.len()
    }

    /// 秒
    pub fn duration(&self) -> f32 {
        self.times.len() as f32 / self.fps
    }
}

/// 録画済みテイクをクリップへ焼き込む
///
/// 各フレームをバインド姿勢から重み 1.0 でリターゲットするので、
/// フレーム間の平滑化は入らず、同じ入力からは常に同じクリップになる。
#[derive(Debug, Clone)]
pub struct AnimationBaker {
    template: Retargeter,
    normalizer: PoseNormalizer,
    clip_name: String,
}

impl AnimationBaker {
    pub fn new(retargeter: &Retargeter, normalizer: PoseNormalizer, clip_name: &str) -> Self {
        let mut template = retargeter.clone().with_weights(1.0, 1.0);
        template.reset();
        Self {
            template,
            normalizer,
            clip_name: clip_name.to_string(),
        }
    }

    pub fn set_normalizer(&mut self, normalizer: PoseNormalizer) {
        self.normalizer = normalizer;
    }

    pub fn bake(&self, history: &FrozenHistory, fps: f32) -> Result<Clip, BakeError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(BakeError::InvalidFps(fps));
        }
        if history.is_empty() {
            return Err(BakeError::EmptyHistory);
        }

        let skeleton = self.template.skeleton().clone();
        let mut retargeter = self.template.clone();
        let mut times = Vec::with_capacity(history.len());
        let mut rotations: Vec<Vec<[f32; 4]>> = vec![Vec::with_capacity(history.len()); skeleton.len()];
        let mut root_translations = Vec::with_capacity(history.len());

        for (i, frame) in history.frames().iter().enumerate() {
            times.push(i as f32 / fps);
            retargeter.reset();
            retargeter.retarget(&self.normalizer.normalize(&frame.landmarks));

            let pose = retargeter.pose();
            for (keys, q) in rotations.iter_mut().zip(pose.rotations()) {
                keys.push([q.i, q.j, q.k, q.w]);
            }
            root_translations.push((*pose.root_translation()).into());
        }

        let tracks = skeleton
            .names()
            .iter()
            .zip(rotations)
            .map(|(bone, rotations)| BoneTrack {
                bone: bone.clone(),
                rotations,
            })
            .collect();

        Ok(Clip {
            name: self.clip_name.clone(),
            fps,
            times,
            tracks,
            root_translations,
        })
    }
}
