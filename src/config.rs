use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub smooth: SmoothConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub retarget: RetargetConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub bake: BakeConfig,
}

/// 適応EMA平滑化パラメータ
#[derive(Debug, Deserialize, Clone)]
pub struct SmoothConfig {
    /// この速度（正規化単位/フレーム）以上で高速側のalphaを使う
    #[serde(default = "default_velocity_threshold")]
    pub velocity_threshold: f32,
    #[serde(default = "default_alpha_slow")]
    pub alpha_slow: f32,
    #[serde(default = "default_alpha_fast")]
    pub alpha_fast: f32,
    /// 信頼度によるalpha倍率の下限
    #[serde(default = "default_min_confidence_scale")]
    pub min_confidence_scale: f32,
}

fn default_velocity_threshold() -> f32 { 0.03 }
fn default_alpha_slow() -> f32 { 0.3 }
fn default_alpha_fast() -> f32 { 0.8 }
fn default_min_confidence_scale() -> f32 { 0.2 }

impl Default for SmoothConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: default_velocity_threshold(),
            alpha_slow: default_alpha_slow(),
            alpha_fast: default_alpha_fast(),
            min_confidence_scale: default_min_confidence_scale(),
        }
    }
}

/// Tポーズキャリブレーション
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// 頭・足首に要求する信頼度
    #[serde(default = "default_calibration_confidence")]
    pub min_confidence: f32,
    /// 手首と肩の高さの許容差（画像正規化座標）
    #[serde(default = "default_wrist_tolerance")]
    pub wrist_tolerance: f32,
    /// 手首が肩より外側に出ているべき距離
    #[serde(default = "default_arm_extension")]
    pub arm_extension: f32,
    /// Tポーズを保持すべき連続フレーム数
    #[serde(default = "default_hold_frames")]
    pub hold_frames: u32,
    /// 保存先パス
    #[serde(default = "default_calibration_output")]
    pub output_path: String,
}

fn default_calibration_confidence() -> f32 { 0.5 }
fn default_wrist_tolerance() -> f32 { 0.1 }
fn default_arm_extension() -> f32 { 0.1 }
fn default_hold_frames() -> u32 { 24 }
fn default_calibration_output() -> String { "calibration.json".to_string() }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_calibration_confidence(),
            wrist_tolerance: default_wrist_tolerance(),
            arm_extension: default_arm_extension(),
            hold_frames: default_hold_frames(),
            output_path: default_calibration_output(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetargetConfig {
    /// 四肢ボーンのslerp重み
    #[serde(default = "default_limb_weight")]
    pub limb_weight: f32,
    /// 腰・首（複合アンカー）のslerp重み
    #[serde(default = "default_anchor_weight")]
    pub anchor_weight: f32,
    /// 子ボーンを持たないボーンの前方軸（ボーンローカル）
    #[serde(default = "default_forward")]
    pub default_forward: [f32; 3],
    /// 腰・頭のひねり合わせに使う左右軸（ボーンローカル、本人の左向き）
    #[serde(default = "default_lateral_axis")]
    pub lateral_axis: [f32; 3],
    /// これ未満の信頼度のランドマークは欠損扱い
    #[serde(default = "default_retarget_confidence")]
    pub min_confidence: f32,
    /// 正規化後の肩幅
    #[serde(default = "default_reference_scale")]
    pub reference_scale: f32,
    /// ルートを接地させ腰中点に追従させる
    #[serde(default = "default_track_root")]
    pub track_root: bool,
}

fn default_limb_weight() -> f32 { 0.5 }
fn default_anchor_weight() -> f32 { 0.8 }
fn default_forward() -> [f32; 3] { [0.0, 1.0, 0.0] }
fn default_lateral_axis() -> [f32; 3] { [1.0, 0.0, 0.0] }
fn default_retarget_confidence() -> f32 { 0.3 }
fn default_reference_scale() -> f32 { 0.3 }
fn default_track_root() -> bool { true }

impl Default for RetargetConfig {
    fn default() -> Self {
        Self {
            limb_weight: default_limb_weight(),
            anchor_weight: default_anchor_weight(),
            default_forward: default_forward(),
            lateral_axis: default_lateral_axis(),
            min_confidence: default_retarget_confidence(),
            reference_scale: default_reference_scale(),
            track_root: default_track_root(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// 録画開始までのカウントダウン回数
    #[serde(default = "default_countdown_ticks")]
    pub countdown_ticks: u32,
    #[serde(default = "default_countdown_interval_ms")]
    pub countdown_interval_ms: u64,
    #[serde(default = "default_calibration_timeout_ms")]
    pub calibration_timeout_ms: u64,
}

fn default_countdown_ticks() -> u32 { 5 }
fn default_countdown_interval_ms() -> u64 { 1000 }
fn default_calibration_timeout_ms() -> u64 { 10_000 }

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            countdown_ticks: default_countdown_ticks(),
            countdown_interval_ms: default_countdown_interval_ms(),
            calibration_timeout_ms: default_calibration_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BakeConfig {
    #[serde(default = "default_fps")]
    pub fps: f32,
    #[serde(default = "default_clip_name")]
    pub clip_name: String,
}

fn default_fps() -> f32 { 24.0 }
fn default_clip_name() -> String { "Animation".to_string() }

impl Default for BakeConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            clip_name: default_clip_name(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// 読めなければデフォルト設定を使う
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("using default config: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.smooth.alpha_fast, 0.8);
        assert_eq!(config.smooth.alpha_slow, 0.3);
        assert_eq!(config.capture.countdown_ticks, 5);
        assert_eq!(config.retarget.anchor_weight, 0.8);
        assert_eq!(config.bake.fps, 24.0);
    }

    #[test]
    fn test_partial_section_override() {
        let config: Config = toml::from_str(
            "[smooth]\nvelocity_threshold = 0.05\n\n[capture]\ncountdown_ticks = 3\n",
        )
        .unwrap();
        assert_eq!(config.smooth.velocity_threshold, 0.05);
        // 指定していないフィールドはデフォルト
        assert_eq!(config.smooth.alpha_fast, 0.8);
        assert_eq!(config.capture.countdown_ticks, 3);
        assert_eq!(config.capture.countdown_interval_ms, 1000);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("does/not/exist.toml");
        assert_eq!(config.calibration.hold_frames, 24);
    }
}
