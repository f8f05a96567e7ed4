use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::pose::Landmark;

/// 推定スレッドから届く未検証のランドマーク
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub landmarks: Vec<Landmark>,
    pub timestamp_ms: f64,
}

struct Shared {
    latest: Mutex<Option<RawFrame>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// 最新フレームだけを保持する受け渡し口を作る
///
/// 推定側は `publish` で上書きし、メインループ側は `take` で最新の1枚を取る。
/// 読まれずに上書きされたフレームは破棄され `dropped_frames` に数えられる。
pub fn latest_frame() -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        latest: Mutex::new(None),
        published: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        FrameReceiver { shared },
    )
}

pub struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// 未読フレームを上書きしたら true
    pub fn publish(&self, frame: RawFrame) -> bool {
        let replaced = self
            .shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame)
            .is_some();
        if replaced {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.published.fetch_add(1, Ordering::Release);
        replaced
    }
}

pub struct FrameReceiver {
    shared: Arc<Shared>,
}

impl FrameReceiver {
    /// 最新の未読フレーム。読んだら空になる
    pub fn take(&self) -> Option<RawFrame> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// これまでに publish されたフレーム数
    pub fn published_frames(&self) -> u64 {
        self.shared.published.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
