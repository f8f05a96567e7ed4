//! ホスト側タイマーとの受け渡し
//!
//! セッションはタイマーを自分で回さない。要求 (`TimerRequest`) を返し、
//! ホストが発火ごとにトークンを返してくる。フェーズが変わると
//! 発行済みトークンは無効になり、遅れて届いた発火は無視される。

/// 発行ごとに一意なタイマー識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

impl TimerToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// 録画前カウントダウン（繰り返し）
    Countdown,
    /// Tポーズ待ちの制限時間（単発）
    CalibrationTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    pub token: TimerToken,
    pub kind: TimerKind,
    pub interval_ms: u64,
    pub repeating: bool,
}

/// 同時に有効なタイマーは最大1つ
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    next_id: u64,
    active: Option<(TimerToken, TimerKind)>,
}

impl TimerSlot {
    /// 新しいタイマーを発行する（既存のものは無効化）
    pub fn arm(&mut self, kind: TimerKind, interval_ms: u64, repeating: bool) -> TimerRequest {
        self.next_id += 1;
        let token = TimerToken(self.next_id);
        self.active = Some((token, kind));
        TimerRequest {
            token,
            kind,
            interval_ms,
            repeating,
        }
    }

    pub fn cancel(&mut self) -> Option<TimerToken> {
        self.active.take().map(|(token, _)| token)
    }

    /// 有効なトークンなら種別を返す
    pub fn check(&self, token: TimerToken) -> Option<TimerKind> {
        match self.active {
            Some((active, kind)) if active == token => Some(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rearm_invalidates_previous_token() {
        let mut slot = TimerSlot::default();
        let first = slot.arm(TimerKind::Countdown, 1000, true);
        let second = slot.arm(TimerKind::CalibrationTimeout, 10_000, false);
        assert_ne!(first.token, second.token);
        assert_eq!(slot.check(first.token), None);
        assert_eq!(slot.check(second.token), Some(TimerKind::CalibrationTimeout));
    }

    #[test]
    fn test_cancel() {
        let mut slot = TimerSlot::default();
        let req = slot.arm(TimerKind::Countdown, 1000, true);
        assert_eq!(slot.cancel(), Some(req.token));
        assert_eq!(slot.check(req.token), None);
        assert_eq!(slot.cancel(), None);
    }
}
