use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use deadshot_mocap::bake::AnimationBaker;
use deadshot_mocap::calibration::{load_calibration, save_calibration};
use deadshot_mocap::capture::handoff::{self, RawFrame};
use deadshot_mocap::capture::{CapturePhase, CaptureSession, FrozenHistory, SaveOutcome};
use deadshot_mocap::config::Config;
use deadshot_mocap::export::{ClipExporter, GltfExporter, JsonExporter};
use deadshot_mocap::pose::Landmark;
use deadshot_mocap::retarget::Retargeter;
use deadshot_mocap::skeleton::{BoneMapping, Skeleton};
use deadshot_mocap::tracker::PoseNormalizer;

#[derive(Parser, Debug)]
#[command(name = "mocap", version = env!("GIT_VERSION"), about = "Landmark motion capture to skeletal animation")]
struct Cli {
    /// 設定ファイル (なければデフォルト)
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

/// 書き出し形式
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum Format {
    /// glTF 2.0 バイナリ
    #[default]
    Glb,
    /// 確認用のJSONダンプ
    Json,
}

impl Format {
    fn extension(self) -> &'static str {
        match self {
            Format::Glb => "glb",
            Format::Json => "json",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bake a recorded take into an animation clip
    Bake {
        #[arg(long)]
        take: PathBuf,
        #[arg(long)]
        skeleton: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        fps: Option<f32>,
        #[arg(long)]
        calibration: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = Format::Glb)]
        format: Format,
    },
    /// Record a raw landmark stream (JSON lines) through a capture session and save it
    Replay {
        #[arg(long)]
        stream: PathBuf,
        #[arg(long)]
        skeleton: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        /// 録画したテイクも保存する
        #[arg(long)]
        take_out: Option<PathBuf>,
        #[arg(long)]
        calibration: Option<PathBuf>,
        /// タイムスタンプ通りに別スレッドから流し、最新フレームだけを処理する
        #[arg(long)]
        paced: bool,
        #[arg(long, value_enum, default_value_t = Format::Glb)]
        format: Format,
    },
    /// Run T-pose calibration over a raw landmark stream and save the result
    Calibrate {
        #[arg(long)]
        stream: PathBuf,
        #[arg(long)]
        skeleton: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// ストリームファイルの1行
#[derive(Debug, Deserialize)]
struct StreamRecord {
    landmarks: Vec<Landmark>,
    #[serde(default)]
    timestamp_ms: f64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load_or_default(&cli.config);
    match cli.cmd {
        Command::Bake {
            take,
            skeleton,
            out,
            fps,
            calibration,
            format,
        } => run_bake(&config, &take, &skeleton, out, fps, calibration.as_deref(), format),
        Command::Replay {
            stream,
            skeleton,
            out,
            take_out,
            calibration,
            paced,
            format,
        } => run_replay(
            &config,
            &stream,
            &skeleton,
            out,
            take_out.as_deref(),
            calibration.as_deref(),
            paced,
            format,
        ),
        Command::Calibrate { stream, skeleton, out } => run_calibrate(&config, &stream, &skeleton, out),
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_output(format: Format) -> PathBuf {
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(format!("clip_{}.{}", ts, format.extension()))
}

fn create_exporter(format: Format, path: &Path) -> Result<Box<dyn ClipExporter>> {
    let exporter: Box<dyn ClipExporter> = match format {
        Format::Glb => Box::new(GltfExporter::create(path)?),
        Format::Json => Box::new(JsonExporter::create(path)?),
    };
    Ok(exporter)
}

fn read_stream(path: &Path) -> Result<Vec<StreamRecord>> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open stream {}", path.display()))?;
    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: StreamRecord = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: malformed landmark record", path.display(), n + 1))?;
        records.push(record);
    }
    info!("{} landmark records from {}", records.len(), path.display());
    Ok(records)
}

fn open_session(config: &Config, skeleton: &Path) -> Result<CaptureSession> {
    let skeleton = Arc::new(Skeleton::load(skeleton)?);
    info!("skeleton: {} bones", skeleton.len());
    Ok(CaptureSession::new(skeleton, &BoneMapping::default_rig(), config))
}

// --- bake ---

fn run_bake(
    config: &Config,
    take: &Path,
    skeleton_path: &Path,
    out: Option<PathBuf>,
    fps: Option<f32>,
    calibration: Option<&Path>,
    format: Format,
) -> Result<()> {
    let content = fs::read_to_string(take).with_context(|| format!("Failed to read take {}", take.display()))?;
    let history: FrozenHistory =
        serde_json::from_str(&content).with_context(|| format!("Malformed take {}", take.display()))?;
    let skeleton = Arc::new(Skeleton::load(skeleton_path)?);

    let mut normalizer = PoseNormalizer::new(config.retarget.reference_scale);
    if let Some(path) = calibration {
        let cal = load_calibration(path)?;
        normalizer = PoseNormalizer::from_calibration(&cal, skeleton.bind_height());
    }
    let retargeter = Retargeter::new(skeleton.clone(), &BoneMapping::default_rig(), &config.retarget);
    let baker = AnimationBaker::new(&retargeter, normalizer, &config.bake.clip_name);

    let fps = fps.unwrap_or(config.bake.fps);
    let clip = baker.bake(&history, fps)?;
    let out = out.unwrap_or_else(|| default_output(format));
    create_exporter(format, &out)?.export(&skeleton, &clip)?;
    info!(
        "baked {} keyframes ({:.2}s @ {} fps) -> {}",
        clip.keyframe_count(),
        clip.duration(),
        fps,
        out.display()
    );
    Ok(())
}

// --- replay ---

fn run_replay(
    config: &Config,
    stream: &Path,
    skeleton: &Path,
    out: Option<PathBuf>,
    take_out: Option<&Path>,
    calibration: Option<&Path>,
    paced: bool,
    format: Format,
) -> Result<()> {
    let records = read_stream(stream)?;
    let mut session = open_session(config, skeleton)?;
    if let Some(path) = calibration {
        session.set_calibration(load_calibration(path)?);
    }

    // オフライン再生なのでカウントダウンは即時に進める
    if let Some(req) = session.start_capture() {
        for _ in 0..config.capture.countdown_ticks {
            session.timer_fired(req.token);
        }
    }
    if session.phase() != CapturePhase::Recording {
        bail!("capture did not start (phase {:?})", session.phase());
    }

    let rejected = if paced {
        feed_paced(&mut session, records, config.bake.fps)
    } else {
        feed_all(&mut session, records)
    };
    if rejected > 0 {
        warn!("{} frames rejected", rejected);
    }

    session.stop();
    if let (Some(path), Some(history)) = (take_out, session.review_history()) {
        let json = serde_json::to_string(history)?;
        fs::write(path, json).with_context(|| format!("Failed to write take {}", path.display()))?;
        info!("take saved to {}", path.display());
    }

    if session.history_len() == 0 {
        warn!("no frames recorded");
        session.trash();
        return Ok(());
    }

    let out = out.unwrap_or_else(|| default_output(format));
    let mut exporter = create_exporter(format, &out)?;
    match session.save(exporter.as_mut())? {
        SaveOutcome::Saved { frames, duration } => {
            info!("saved {} frames ({:.2}s) -> {}", frames, duration, out.display())
        }
        SaveOutcome::NoData => warn!("nothing to save"),
    }
    Ok(())
}

fn feed_all(session: &mut CaptureSession, records: Vec<StreamRecord>) -> usize {
    records
        .iter()
        .filter(|r| session.tick(&r.landmarks, r.timestamp_ms).is_err())
        .count()
}

/// 推定スレッドを模して記録時刻どおりに publish し、描画ループ側は最新だけを取る
fn feed_paced(session: &mut CaptureSession, records: Vec<StreamRecord>, loop_fps: f32) -> usize {
    let (tx, rx) = handoff::latest_frame();
    let producer = thread::spawn(move || {
        let start = Instant::now();
        let origin = records.first().map(|r| r.timestamp_ms).unwrap_or(0.0);
        for record in records {
            let due = Duration::from_secs_f64(((record.timestamp_ms - origin) / 1000.0).max(0.0));
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                thread::sleep(wait);
            }
            tx.publish(RawFrame {
                landmarks: record.landmarks,
                timestamp_ms: record.timestamp_ms,
            });
        }
    });

    let interval = Duration::from_secs_f32(1.0 / loop_fps.max(1.0));
    let mut rejected = 0;
    loop {
        let finished = producer.is_finished();
        match rx.take() {
            Some(frame) => {
                if session.tick(&frame.landmarks, frame.timestamp_ms).is_err() {
                    rejected += 1;
                }
            }
            None if finished => break,
            None => {}
        }
        thread::sleep(interval);
    }
    if producer.join().is_err() {
        warn!("stream producer panicked");
    }
    debug!(
        "published {}, dropped {} stale frames",
        rx.published_frames(),
        rx.dropped_frames()
    );
    rejected
}

// --- calibrate ---

/// キャリブレーションが終わるまでフレームを流し、棄却数を返す
fn feed_calibration(session: &mut CaptureSession, records: &[StreamRecord]) -> usize {
    let mut rejected = 0;
    for record in records {
        if session.phase() != CapturePhase::Calibrating {
            break;
        }
        if session.tick(&record.landmarks, record.timestamp_ms).is_err() {
            rejected += 1;
        }
    }
    rejected
}

fn run_calibrate(config: &Config, stream: &Path, skeleton: &Path, out: Option<PathBuf>) -> Result<()> {
    let records = read_stream(stream)?;
    let mut session = open_session(config, skeleton)?;
    let Some(req) = session.start_calibration() else {
        bail!("calibration could not start");
    };

    let rejected = feed_calibration(&mut session, &records);
    if rejected > 0 {
        warn!("{} frames rejected", rejected);
    }
    // ストリームの終わりを制限時間切れとして扱う
    session.timer_fired(req.token);

    let Some(calibration) = session.calibration() else {
        bail!("no calibration: T-pose was not held for {} frames", config.calibration.hold_frames);
    };
    let out = out.unwrap_or_else(|| PathBuf::from(&config.calibration.output_path));
    save_calibration(&out, calibration)?;
    info!(
        "calibration saved to {} (scale {:.3}, floor {:.3})",
        out.display(),
        calibration.scale(),
        calibration.floor_y()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadshot_mocap::skeleton::SkeletonDef;

    fn session() -> CaptureSession {
        let def: SkeletonDef = serde_json::from_str(
            r#"{"bones":[{"name":"C_hips_JNT","translation":[0,1,0]},
                {"name":"C_spine_JNT","parent":"C_hips_JNT","translation":[0,0.5,0]}]}"#,
        )
        .unwrap();
        let skeleton = Arc::new(Skeleton::from_def(&def).unwrap());
        CaptureSession::new(skeleton, &BoneMapping::default_rig(), &Config::default())
    }

    fn record(count: usize, timestamp_ms: f64) -> StreamRecord {
        StreamRecord {
            landmarks: vec![Landmark::new(0.5, 0.5, 0.0, 0.9); count],
            timestamp_ms,
        }
    }

    #[test]
    fn test_calibration_feed_counts_rejected_frames() {
        let mut session = session();
        session.start_calibration().unwrap();
        let records = vec![record(33, 0.0), record(10, 33.0), record(33, 66.0), record(0, 99.0)];
        assert_eq!(feed_calibration(&mut session, &records), 2);
        assert_eq!(session.phase(), CapturePhase::Calibrating);
    }
}
