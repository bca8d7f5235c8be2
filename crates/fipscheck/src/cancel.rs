use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation shared by every stage of a scan.
///
/// A token is cancelled either explicitly or once its optional deadline passes.
/// Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token sharing this one's flag that also trips after `timeout`.
    /// An earlier deadline already set on `self` wins.
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let new = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, new) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        CancelToken {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }

    #[test]
    fn deadline_trips_and_keeps_the_earliest() {
        let base = CancelToken::new();
        let t = base.with_deadline(Duration::ZERO);
        assert!(t.is_cancelled());
        assert!(!base.is_cancelled());

        let long = base.with_deadline(Duration::from_secs(3600));
        let short = long.with_deadline(Duration::from_secs(1));
        let later = short.with_deadline(Duration::from_secs(7200));
        assert_eq!(short.deadline(), later.deadline());
        assert!(later.remaining().expect("deadline") <= Duration::from_secs(1));
        assert_eq!(base.remaining(), None);
    }
}
