use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One-shot boolean notification: set at most once, never cleared.
#[derive(Debug, Default)]
pub struct OnceFlag(AtomicBool);

impl OnceFlag {
    /// Returns `true` only for the call that actually set the flag.
    pub fn set(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-task pair of access notifications for the served asset.
///
/// タスク開始時にコントローラが新しく作り、サーバ（書き手）と
/// コントローラ（読み手）で共有する。リセットは「作り直す」ことで行う。
#[derive(Debug, Clone, Default)]
pub struct CompletionSignals {
    header: Arc<OnceFlag>,
    body: Arc<OnceFlag>,
}

impl CompletionSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> &OnceFlag {
        &self.header
    }

    pub fn body(&self) -> &OnceFlag {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_reports_first_set_only() {
        let flag = OnceFlag::default();
        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }

    #[test]
    fn signals_are_independent_and_shared_by_clones() {
        let signals = CompletionSignals::new();
        let writer = signals.clone();
        writer.header().set();
        assert!(signals.header().is_set());
        assert!(!signals.body().is_set());
    }
}
