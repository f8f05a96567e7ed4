pub mod handoff;
pub mod history;
pub mod timer;

pub use history::{FrozenHistory, History};
pub use timer::{TimerKind, TimerRequest, TimerToken};

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bake::AnimationBaker;
use crate::calibration::{CalibrationPose, Calibrator};
use crate::config::{BakeConfig, CaptureConfig, Config};
use crate::error::{CalibrationError, SaveError, ValidationError};
use crate::export::ClipExporter;
use crate::pose::{Landmark, LandmarkFrame, TPoseDetector};
use crate::retarget::Retargeter;
use crate::skeleton::{BoneMapping, Skeleton, SkeletonPose};
use crate::tracker::{PoseNormalizer, PoseSmoother};
use timer::TimerSlot;

/// UIへ公開するフェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Idle,
    Calibrating,
    Countdown,
    Recording,
    Review,
}

/// フェーズごとのデータはその variant だけが持つ
#[derive(Debug)]
enum Phase {
    Idle,
    Calibrating,
    Countdown { remaining: u32 },
    Recording(History),
    Review { history: FrozenHistory, cursor: usize },
}

impl Phase {
    fn kind(&self) -> CapturePhase {
        match self {
            Phase::Idle => CapturePhase::Idle,
            Phase::Calibrating => CapturePhase::Calibrating,
            Phase::Countdown { .. } => CapturePhase::Countdown,
            Phase::Recording(_) => CapturePhase::Recording,
            Phase::Review { .. } => CapturePhase::Review,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged { from: CapturePhase, to: CapturePhase },
    CountdownTick { remaining: u32 },
    Calibrated { scale: f32, floor_y: f32 },
    CalibrationFailed(CalibrationError),
    FrameRejected(ValidationError),
    Saved { frames: usize, duration: f32 },
    Discarded { frames: usize },
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SaveOutcome {
    Saved { frames: usize, duration: f32 },
    /// 保存するフレームがなかった（エラーではない）
    NoData,
}

/// 録画・レビュー・キャリブレーションの状態機械
///
/// ホストは毎フレーム `tick` を呼び、返された姿勢を描画する。
/// タイマーは `TimerRequest` としてホストへ渡し、発火は `timer_fired` で受け取る。
pub struct CaptureSession {
    capture: CaptureConfig,
    bake: BakeConfig,
    smoother: PoseSmoother,
    normalizer: PoseNormalizer,
    retargeter: Retargeter,
    baker: AnimationBaker,
    calibrator: Calibrator,
    tpose: TPoseDetector,
    calibration: Option<CalibrationPose>,
    phase: Phase,
    timer: TimerSlot,
    events: Vec<SessionEvent>,
}

impl CaptureSession {
    pub fn new(skeleton: Arc<Skeleton>, mapping: &BoneMapping, config: &Config) -> Self {
        let retargeter = Retargeter::new(skeleton, mapping, &config.retarget);
        let normalizer = PoseNormalizer::new(config.retarget.reference_scale);
        let baker = AnimationBaker::new(&retargeter, normalizer, &config.bake.clip_name);
        Self {
            capture: config.capture.clone(),
            bake: config.bake.clone(),
            smoother: PoseSmoother::from_config(&config.smooth),
            normalizer,
            retargeter,
            baker,
            calibrator: Calibrator::from_config(&config.calibration),
            tpose: TPoseDetector::from_config(&config.calibration),
            calibration: None,
            phase: Phase::Idle,
            timer: TimerSlot::default(),
            events: Vec::new(),
        }
    }

    // --- 状態参照 ---

    pub fn phase(&self) -> CapturePhase {
        self.phase.kind()
    }

    pub fn pose(&self) -> &SkeletonPose {
        self.retargeter.pose()
    }

    pub fn skeleton(&self) -> &Arc<Skeleton> {
        self.retargeter.skeleton()
    }

    /// 録画中・レビュー中のフレーム数。それ以外は 0
    pub fn history_len(&self) -> usize {
        match &self.phase {
            Phase::Recording(history) => history.len(),
            Phase::Review { history, .. } => history.len(),
            _ => 0,
        }
    }

    pub fn review_history(&self) -> Option<&FrozenHistory> {
        match &self.phase {
            Phase::Review { history, .. } => Some(history),
            _ => None,
        }
    }

    pub fn review_cursor(&self) -> Option<usize> {
        match &self.phase {
            Phase::Review { cursor, .. } => Some(*cursor),
            _ => None,
        }
    }

    pub fn playback_duration(&self) -> Option<usize> {
        self.review_history().map(FrozenHistory::playback_duration)
    }

    pub fn calibration(&self) -> Option<&CalibrationPose> {
        self.calibration.as_ref()
    }

    /// 保存済みのキャリブレーションを適用する
    pub fn set_calibration(&mut self, calibration: CalibrationPose) {
        let height = self.retargeter.skeleton().bind_height();
        if height > f32::EPSILON {
            self.normalizer = PoseNormalizer::from_calibration(&calibration, height);
            self.baker.set_normalizer(self.normalizer);
        }
        self.calibration = Some(calibration);
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // --- フレーム処理 ---

    /// 1フレーム分の処理。不正なフレームは破棄し、前回の姿勢を維持する
    pub fn tick(&mut self, raw: &[Landmark], timestamp_ms: f64) -> Result<&SkeletonPose, ValidationError> {
        let smoothed = match self.smoother.smooth(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("rejected landmark frame: {}", e);
                self.events.push(SessionEvent::FrameRejected(e.clone()));
                return Err(e);
            }
        };

        match &mut self.phase {
            Phase::Recording(history) => {
                history.push(smoothed.clone(), timestamp_ms);
            }
            // レビュー中の姿勢は録画データから作る
            Phase::Review { .. } => return Ok(self.retargeter.pose()),
            Phase::Calibrating => self.feed_calibration(&smoothed),
            Phase::Idle | Phase::Countdown { .. } => {}
        }

        Ok(self.preview(&smoothed))
    }

    fn preview(&mut self, frame: &LandmarkFrame) -> &SkeletonPose {
        let normalized = self.normalizer.normalize(frame);
        self.retargeter.retarget(&normalized);
        self.retargeter.pose()
    }

    fn feed_calibration(&mut self, frame: &LandmarkFrame) {
        if !self.tpose.update(frame) {
            return;
        }
        match self.calibrator.calibrate(&frame.to_upright()) {
            Ok(calibration) => {
                info!(
                    "calibrated: scale {:.3}, floor {:.3}",
                    calibration.scale(),
                    calibration.floor_y()
                );
                self.events.push(SessionEvent::Calibrated {
                    scale: calibration.scale(),
                    floor_y: calibration.floor_y(),
                });
                self.set_calibration(calibration);
                self.set_phase(Phase::Idle);
            }
            Err(e) => self.fail_calibration(e),
        }
    }

    fn fail_calibration(&mut self, error: CalibrationError) {
        warn!("calibration failed: {}", error);
        self.events.push(SessionEvent::CalibrationFailed(error));
        self.set_phase(Phase::Idle);
    }

    // --- コマンド ---

    /// Idle → Countdown。カウントダウン用の繰り返しタイマーを返す
    pub fn start_capture(&mut self) -> Option<TimerRequest> {
        if !matches!(self.phase, Phase::Idle) {
            debug!("start_capture ignored in {:?}", self.phase());
            return None;
        }
        let ticks = self.capture.countdown_ticks;
        if ticks == 0 {
            self.set_phase(Phase::Recording(History::new()));
            return None;
        }
        self.set_phase(Phase::Countdown { remaining: ticks });
        self.events.push(SessionEvent::CountdownTick { remaining: ticks });
        Some(
            self.timer
                .arm(TimerKind::Countdown, self.capture.countdown_interval_ms, true),
        )
    }

    /// Idle → Calibrating。タイムアウト用の単発タイマーを返す
    pub fn start_calibration(&mut self) -> Option<TimerRequest> {
        if !matches!(self.phase, Phase::Idle) {
            debug!("start_calibration ignored in {:?}", self.phase());
            return None;
        }
        self.tpose.reset();
        self.set_phase(Phase::Calibrating);
        Some(self.timer.arm(
            TimerKind::CalibrationTimeout,
            self.capture.calibration_timeout_ms,
            false,
        ))
    }

    /// ホストのタイマー発火。無効なトークンなら何もせず false
    pub fn timer_fired(&mut self, token: TimerToken) -> bool {
        let Some(kind) = self.timer.check(token) else {
            debug!("ignoring stale timer {}", token.id());
            return false;
        };

        match (kind, &mut self.phase) {
            (TimerKind::Countdown, Phase::Countdown { remaining }) => {
                *remaining = remaining.saturating_sub(1);
                let left = *remaining;
                if left == 0 {
                    self.set_phase(Phase::Recording(History::new()));
                } else {
                    self.events.push(SessionEvent::CountdownTick { remaining: left });
                }
                true
            }
            (TimerKind::CalibrationTimeout, Phase::Calibrating) => {
                self.fail_calibration(CalibrationError::Timeout);
                true
            }
            _ => {
                self.timer.cancel();
                false
            }
        }
    }

    /// Recording → Review。Countdown 中なら中止。Idle では何もしない
    pub fn stop(&mut self) -> bool {
        match &mut self.phase {
            Phase::Recording(history) => {
                let frozen = std::mem::take(history).freeze();
                info!("recording stopped: {} frames", frozen.len());
                self.set_phase(Phase::Review {
                    history: frozen,
                    cursor: 0,
                });
                self.seek(0);
                true
            }
            Phase::Countdown { .. } => self.cancel(),
            _ => false,
        }
    }

    /// 保留中のカウントダウン・キャリブレーションを中止する
    pub fn cancel(&mut self) -> bool {
        match self.phase {
            Phase::Countdown { .. } => {
                info!("countdown cancelled");
                self.set_phase(Phase::Idle);
                true
            }
            Phase::Calibrating => {
                self.fail_calibration(CalibrationError::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Review → Idle。録画を破棄する
    pub fn trash(&mut self) -> bool {
        let frames = match &self.phase {
            Phase::Review { history, .. } => history.len(),
            _ => return false,
        };
        info!("take discarded: {} frames", frames);
        self.set_phase(Phase::Idle);
        self.events.push(SessionEvent::Discarded { frames });
        true
    }

    /// Review → Idle。ベイクして書き出す
    ///
    /// 失敗した場合はレビューに留まり、テイクは失われない。
    pub fn save(&mut self, exporter: &mut dyn ClipExporter) -> Result<SaveOutcome, SaveError> {
        let history = match &self.phase {
            Phase::Review { history, .. } => history.clone(),
            _ => {
                debug!("save ignored in {:?}", self.phase());
                self.events.push(SessionEvent::NoData);
                return Ok(SaveOutcome::NoData);
            }
        };
        if history.is_empty() {
            info!("nothing recorded");
            self.set_phase(Phase::Idle);
            self.events.push(SessionEvent::NoData);
            return Ok(SaveOutcome::NoData);
        }

        let clip = self.baker.bake(&history, self.bake.fps)?;
        if let Err(e) = exporter.export(self.retargeter.skeleton(), &clip) {
            warn!("export failed: {}", e);
            return Err(e.into());
        }

        let frames = history.len();
        let duration = clip.duration();
        info!("saved '{}': {} frames, {:.2}s", clip.name(), frames, duration);
        self.set_phase(Phase::Idle);
        self.events.push(SessionEvent::Saved { frames, duration });
        Ok(SaveOutcome::Saved { frames, duration })
    }

    // --- レビュー再生 ---

    pub fn seek(&mut self, index: usize) -> Option<&SkeletonPose> {
        let Phase::Review { history, cursor } = &mut self.phase else {
            return None;
        };
        let landmarks = history.get(index)?.landmarks.clone();
        *cursor = index;
        Some(self.preview(&landmarks))
    }

    /// 次のフレームへ。末尾の次は先頭に戻る
    pub fn advance_playback(&mut self) -> Option<&SkeletonPose> {
        let Phase::Review { history, cursor } = &mut self.phase else {
            return None;
        };
        if history.is_empty() {
            return None;
        }
        *cursor = if *cursor >= history.playback_duration() {
            0
        } else {
            *cursor + 1
        };
        let landmarks = history.get(*cursor)?.landmarks.clone();
        Some(self.preview(&landmarks))
    }

    fn set_phase(&mut self, next: Phase) {
        let from = self.phase.kind();
        // 発行済みのタイマーはフェーズと共に無効
        self.timer.cancel();
        self.phase = next;
        let to = self.phase.kind();
        if from != to {
            info!("capture phase {:?} -> {:?}", from, to);
            self.events.push(SessionEvent::PhaseChanged { from, to });
        }
    }
}
