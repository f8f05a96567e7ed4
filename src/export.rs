use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::warn;

use crate::bake::Clip;
use crate::error::ExportError;
use crate::skeleton::Skeleton;

/// ベイク済みクリップの書き出し先
pub trait ClipExporter {
    fn export(&mut self, skeleton: &Skeleton, clip: &Clip) -> Result<(), ExportError>;
}

const GENERATOR: &str = concat!("deadshot_mocap ", env!("GIT_VERSION"));

// --- glTF 2.0 ---

/// glTF 2.0 バイナリ (GLB) として書き出す
///
/// ボーンはスケルトンと同じ順のノードになり (ルートがノード 0)、
/// スキンの joints に並ぶ。アニメーションは共有の時刻アクセサ1本に、
/// ルートの translation と各ボーンの rotation のサンプラーをぶら下げる。
pub struct GltfExporter<W: Write> {
    writer: W,
}

impl GltfExporter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ExportError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> GltfExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ClipExporter for GltfExporter<W> {
    fn export(&mut self, skeleton: &Skeleton, clip: &Clip) -> Result<(), ExportError> {
        let (document, bin) = build_gltf(skeleton, clip)?;
        let json = serde_json::to_vec(&document)?;
        write_glb(&mut self.writer, &json, &bin)?;
        self.writer.flush()?;
        Ok(())
    }
}

const GLB_MAGIC: u32 = 0x4654_6C67;
const GLB_VERSION: u32 = 2;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;
const COMPONENT_FLOAT: u32 = 5126;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GltfDocument<'a> {
    asset: GltfAsset,
    scene: usize,
    scenes: Vec<GltfScene>,
    nodes: Vec<GltfNode<'a>>,
    skins: Vec<GltfSkin>,
    animations: Vec<GltfAnimation<'a>>,
    buffers: Vec<GltfBuffer>,
    buffer_views: Vec<GltfBufferView>,
    accessors: Vec<GltfAccessor>,
}

#[derive(Serialize)]
struct GltfAsset {
    version: &'static str,
    generator: &'static str,
}

#[derive(Serialize)]
struct GltfScene {
    nodes: Vec<usize>,
}

#[derive(Serialize)]
struct GltfNode<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<usize>,
    translation: [f32; 3],
    /// [x, y, z, w]
    rotation: [f32; 4],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GltfSkin {
    inverse_bind_matrices: usize,
    joints: Vec<usize>,
    skeleton: usize,
}

#[derive(Serialize)]
struct GltfAnimation<'a> {
    name: &'a str,
    channels: Vec<GltfChannel>,
    samplers: Vec<GltfSampler>,
}

#[derive(Serialize)]
struct GltfChannel {
    sampler: usize,
    target: GltfTarget,
}

#[derive(Serialize)]
struct GltfTarget {
    node: usize,
    path: &'static str,
}

#[derive(Serialize)]
struct GltfSampler {
    input: usize,
    output: usize,
    interpolation: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GltfBuffer {
    byte_length: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GltfBufferView {
    buffer: usize,
    byte_offset: usize,
    byte_length: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GltfAccessor {
    buffer_view: usize,
    component_type: u32,
    count: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<Vec<f32>>,
}

/// 1本のバイナリバッファに float アクセサを積んでいく
#[derive(Default)]
struct BinaryBuilder {
    data: Vec<u8>,
    views: Vec<GltfBufferView>,
    accessors: Vec<GltfAccessor>,
}

impl BinaryBuilder {
    fn push(&mut self, kind: &'static str, count: usize, values: impl IntoIterator<Item = f32>) -> usize {
        let offset = self.data.len();
        for v in values {
            self.data.extend_from_slice(&v.to_le_bytes());
        }
        self.views.push(GltfBufferView {
            buffer: 0,
            byte_offset: offset,
            byte_length: self.data.len() - offset,
        });
        self.accessors.push(GltfAccessor {
            buffer_view: self.views.len() - 1,
            component_type: COMPONENT_FLOAT,
            count,
            kind,
            min: None,
            max: None,
        });
        self.accessors.len() - 1
    }
}

fn build_gltf<'a>(skeleton: &'a Skeleton, clip: &'a Clip) -> Result<(GltfDocument<'a>, Vec<u8>), ExportError> {
    if clip.keyframe_count() == 0 {
        return Err(ExportError::EmptyClip);
    }
    let mut bin = BinaryBuilder::default();

    let nodes = (0..skeleton.len())
        .map(|i| {
            let r = skeleton.bind_rotation(i);
            GltfNode {
                name: skeleton.name(i),
                children: skeleton.children(i).to_vec(),
                translation: (*skeleton.bind_translation(i)).into(),
                rotation: [r.i, r.j, r.k, r.w],
            }
        })
        .collect();

    // 列優先の 4x4
    let world = skeleton.bind_pose().world_transforms(skeleton);
    let inverse_bind = bin.push(
        "MAT4",
        world.len(),
        world
            .iter()
            .flat_map(|w| w.inverse().to_homogeneous().as_slice().to_vec()),
    );
    let skin = GltfSkin {
        inverse_bind_matrices: inverse_bind,
        joints: (0..skeleton.len()).collect(),
        skeleton: skeleton.root(),
    };

    let times = clip.times();
    let input = bin.push("SCALAR", times.len(), times.iter().copied());
    // サンプラー入力は min/max 必須
    bin.accessors[input].min = Some(vec![times[0]]);
    bin.accessors[input].max = Some(vec![times[times.len() - 1]]);

    let mut channels = Vec::with_capacity(clip.tracks().len() + 1);
    let mut samplers = Vec::with_capacity(clip.tracks().len() + 1);
    let mut add_channel = |node: usize, path: &'static str, output: usize| {
        samplers.push(GltfSampler {
            input,
            output,
            interpolation: "LINEAR",
        });
        channels.push(GltfChannel {
            sampler: samplers.len() - 1,
            target: GltfTarget { node, path },
        });
    };

    let roots = clip.root_translations();
    let output = bin.push("VEC3", roots.len(), roots.iter().flatten().copied());
    add_channel(skeleton.root(), "translation", output);

    for track in clip.tracks() {
        let Some(node) = skeleton.index_of(track.bone()) else {
            warn!("track '{}' has no bone in the skeleton, skipped", track.bone());
            continue;
        };
        let keys = track.rotations();
        let output = bin.push("VEC4", keys.len(), keys.iter().flatten().copied());
        add_channel(node, "rotation", output);
    }

    let document = GltfDocument {
        asset: GltfAsset {
            version: "2.0",
            generator: GENERATOR,
        },
        scene: 0,
        scenes: vec![GltfScene {
            nodes: vec![skeleton.root()],
        }],
        nodes,
        skins: vec![skin],
        animations: vec![GltfAnimation {
            name: clip.name(),
            channels,
            samplers,
        }],
        buffers: vec![GltfBuffer {
            byte_length: bin.data.len(),
        }],
        buffer_views: bin.views,
        accessors: bin.accessors,
    };
    Ok((document, bin.data))
}

/// ヘッダ + JSON チャンク + BIN チャンク。各チャンクは4バイト境界に揃える
fn write_glb<W: Write>(writer: &mut W, json: &[u8], bin: &[u8]) -> Result<(), ExportError> {
    let json_padded = json.len().next_multiple_of(4);
    let bin_padded = bin.len().next_multiple_of(4);
    let total = 12 + 8 + json_padded + 8 + bin_padded;
    let total = u32::try_from(total).map_err(|_| ExportError::TooLarge(total))?;

    writer.write_all(&GLB_MAGIC.to_le_bytes())?;
    writer.write_all(&GLB_VERSION.to_le_bytes())?;
    writer.write_all(&total.to_le_bytes())?;

    writer.write_all(&(json_padded as u32).to_le_bytes())?;
    writer.write_all(&CHUNK_JSON.to_le_bytes())?;
    writer.write_all(json)?;
    writer.write_all(&vec![b' '; json_padded - json.len()])?;

    writer.write_all(&(bin_padded as u32).to_le_bytes())?;
    writer.write_all(&CHUNK_BIN.to_le_bytes())?;
    writer.write_all(bin)?;
    writer.write_all(&vec![0u8; bin_padded - bin.len()])?;
    Ok(())
}

// --- デバッグ用JSON ---

#[derive(Serialize)]
struct BoneRecord<'a> {
    name: &'a str,
    parent: Option<&'a str>,
    translation: [f32; 3],
    rotation: [f32; 4],
}

#[derive(Serialize)]
struct AnimationDocument<'a> {
    generator: &'a str,
    skeleton: Vec<BoneRecord<'a>>,
    clip: &'a Clip,
}

/// スケルトン + クリップをそのまま1つのJSON文書にする（確認用）
pub struct JsonExporter<W: Write> {
    writer: W,
}

impl JsonExporter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, ExportError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> JsonExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ClipExporter for JsonExporter<W> {
    fn export(&mut self, skeleton: &Skeleton, clip: &Clip) -> Result<(), ExportError> {
        let bones = (0..skeleton.len())
            .map(|i| {
                let r = skeleton.bind_rotation(i);
                BoneRecord {
                    name: skeleton.name(i),
                    parent: skeleton.parent(i).map(|p| skeleton.name(p)),
                    translation: (*skeleton.bind_translation(i)).into(),
                    rotation: [r.i, r.j, r.k, r.w],
                }
            })
            .collect();
        let doc = AnimationDocument {
            generator: GENERATOR,
            skeleton: bones,
            clip,
        };
        serde_json::to_writer_pretty(&mut self.writer, &doc)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::AnimationBaker;
    use crate::capture::history::History;
    use crate::config::RetargetConfig;
    use crate::pose::tpose::tests::tpose_landmarks;
    use crate::pose::LandmarkFrame;
    use crate::retarget::Retargeter;
    use crate::skeleton::tests::humanoid;
    use crate::skeleton::BoneMapping;
    use crate::tracker::PoseNormalizer;
    use std::sync::Arc;

    fn baked(skeleton: &Arc<Skeleton>, frames: usize) -> Clip {
        let retargeter = Retargeter::new(skeleton.clone(), &BoneMapping::default_rig(), &RetargetConfig::default());
        let baker = AnimationBaker::new(&retargeter, PoseNormalizer::new(0.3), "Take");
        let mut history = History::new();
        for i in 0..frames {
            history.push(LandmarkFrame::from_slice(&tpose_landmarks()).unwrap(), i as f64 * 40.0);
        }
        baker.bake(&history.freeze(), 25.0).unwrap()
    }

    /// GLB を JSON とバイナリに分ける
    fn split_glb(bytes: &[u8]) -> (serde_json::Value, Vec<u8>) {
        let word = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
        assert_eq!(word(0), GLB_MAGIC as usize);
        assert_eq!(word(4), 2);
        assert_eq!(word(8), bytes.len());
        let json_len = word(12);
        assert_eq!(word(16), CHUNK_JSON as usize);
        let json = serde_json::from_slice(&bytes[20..20 + json_len]).unwrap();
        let bin_at = 20 + json_len;
        let bin_len = word(bin_at);
        assert_eq!(word(bin_at + 4), CHUNK_BIN as usize);
        (json, bytes[bin_at + 8..bin_at + 8 + bin_len].to_vec())
    }

    fn read_floats(doc: &serde_json::Value, bin: &[u8], accessor: usize) -> Vec<f32> {
        let view = &doc["bufferViews"][doc["accessors"][accessor]["bufferView"].as_u64().unwrap() as usize];
        let offset = view["byteOffset"].as_u64().unwrap() as usize;
        let len = view["byteLength"].as_u64().unwrap() as usize;
        bin[offset..offset + len]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes(b.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn test_gltf_skeleton_and_animation() {
        let skeleton = Arc::new(humanoid());
        let clip = baked(&skeleton, 3);

        let mut exporter = GltfExporter::new(Vec::new());
        exporter.export(&skeleton, &clip).unwrap();
        let bytes = exporter.into_inner();
        assert_eq!(bytes.len() % 4, 0);
        let (doc, bin) = split_glb(&bytes);

        assert_eq!(doc["asset"]["version"], "2.0");
        assert_eq!(doc["buffers"][0]["byteLength"].as_u64().unwrap() as usize, bin.len());
        let nodes = doc["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), skeleton.len());
        assert_eq!(nodes[0]["name"], "C_hips_JNT");
        assert_eq!(doc["scenes"][0]["nodes"][0], 0);
        let spine = skeleton.index_of("C_spine_JNT").unwrap();
        assert_eq!(nodes[spine]["children"].as_array().unwrap().len(), 3);
        assert_eq!(doc["skins"][0]["joints"].as_array().unwrap().len(), skeleton.len());

        // ルートの逆バインド行列は y = -1 の平行移動
        let accessor = doc["skins"][0]["inverseBindMatrices"].as_u64().unwrap() as usize;
        let inverse_bind = read_floats(&doc, &bin, accessor);
        assert_eq!(inverse_bind.len(), 16 * skeleton.len());
        assert!((inverse_bind[13] + 1.0).abs() < 1e-6);

        let animation = &doc["animations"][0];
        assert_eq!(animation["name"], "Take");
        let channels = animation["channels"].as_array().unwrap();
        assert_eq!(channels.len(), skeleton.len() + 1);
        assert_eq!(channels[0]["target"]["path"], "translation");
        assert_eq!(channels[0]["target"]["node"], 0);

        // 全サンプラーが同じ時刻列を共有する
        let samplers = animation["samplers"].as_array().unwrap();
        let input = samplers[0]["input"].as_u64().unwrap() as usize;
        assert!(samplers.iter().all(|s| s["input"].as_u64().unwrap() as usize == input));
        assert_eq!(doc["accessors"][input]["count"], 3);
        assert_eq!(read_floats(&doc, &bin, input), clip.times());
        assert!((doc["accessors"][input]["max"][0].as_f64().unwrap() as f32 - clip.times()[2]).abs() < 1e-6);

        let arm = skeleton.index_of("L_arm_JNT").unwrap();
        let channel = channels
            .iter()
            .find(|c| c["target"]["node"] == arm && c["target"]["path"] == "rotation")
            .unwrap();
        let output = samplers[channel["sampler"].as_u64().unwrap() as usize]["output"].as_u64().unwrap() as usize;
        assert_eq!(doc["accessors"][output]["type"], "VEC4");
        let keys: Vec<f32> = clip.track("L_arm_JNT").unwrap().rotations().iter().flatten().copied().collect();
        assert_eq!(read_floats(&doc, &bin, output), keys);
    }

    #[test]
    fn test_gltf_write_failure_is_reported() {
        let skeleton = Arc::new(humanoid());
        let clip = baked(&skeleton, 1);
        assert!(matches!(
            GltfExporter::new(FailingWriter).export(&skeleton, &clip),
            Err(ExportError::Io(_))
        ));
    }

    #[test]
    fn test_json_document_layout() {
        let skeleton = Arc::new(humanoid());
        let retargeter = Retargeter::new(skeleton.clone(), &BoneMapping::default_rig(), &RetargetConfig::default());
        let baker = AnimationBaker::new(&retargeter, PoseNormalizer::new(0.3), "Take");
        let mut history = History::new();
        for i in 0..3 {
            history.push(LandmarkFrame::from_slice(&tpose_landmarks()).unwrap(), i as f64 * 40.0);
        }
        let clip = baker.bake(&history.freeze(), 25.0).unwrap();

        let mut exporter = JsonExporter::new(Vec::new());
        exporter.export(&skeleton, &clip).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&exporter.into_inner()).unwrap();

        assert!(value["generator"].as_str().unwrap().starts_with("deadshot_mocap"));
        let bones = value["skeleton"].as_array().unwrap();
        assert_eq!(bones.len(), skeleton.len());
        assert_eq!(bones[0]["name"], "C_hips_JNT");
        assert!(bones[0]["parent"].is_null());
        assert_eq!(value["clip"]["name"], "Take");
        assert_eq!(value["clip"]["fps"], 25.0);
        assert_eq!(value["clip"]["times"].as_array().unwrap().len(), 3);
        assert_eq!(value["clip"]["tracks"].as_array().unwrap().len(), skeleton.len());
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_is_reported() {
        let skeleton = Arc::new(humanoid());
        let retargeter = Retargeter::new(skeleton.clone(), &BoneMapping::default_rig(), &RetargetConfig::default());
        let baker = AnimationBaker::new(&retargeter, PoseNormalizer::new(0.3), "Take");
        let mut history = History::new();
        history.push(LandmarkFrame::from_slice(&tpose_landmarks()).unwrap(), 0.0);
        let clip = baker.bake(&history.freeze(), 24.0).unwrap();
        assert!(JsonExporter::new(FailingWriter).export(&skeleton, &clip).is_err());
    }
}
