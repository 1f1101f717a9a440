use cachenotify_core::{CutoffWindow, NotifyError, ResyncOrigin, Result};
use chrono::{DateTime, Duration, Utc};

/// Computes the `[prior_cutoff, cutoff]` bound for each poll cycle.
///
/// The processing delay is fixed at construction; every method is a pure function
/// of its arguments.
#[derive(Debug, Clone)]
pub struct CutoffWindowManager {
    processing_delay: Duration,
    origin: ResyncOrigin,
    started_at: DateTime<Utc>,
}

impl CutoffWindowManager {
    pub fn new(
        processing_delay: std::time::Duration,
        origin: ResyncOrigin,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let processing_delay = Duration::from_std(processing_delay).map_err(|_| {
            NotifyError::Config(format!(
                "processing delay {processing_delay:?} is out of range"
            ))
        })?;
        Ok(Self {
            processing_delay,
            origin,
            started_at,
        })
    }

    pub fn processing_delay(&self) -> Duration {
        self.processing_delay
    }

    /// First window for a source, starting from a persisted cutoff if there is one.
    pub fn initial_window(
        &self,
        start_from: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CutoffWindow {
        let cutoff = now - self.processing_delay;
        let start = start_from.unwrap_or_else(|| self.origin_instant(None));
        CutoffWindow {
            prior_cutoff: (start - self.processing_delay).min(cutoff),
            cutoff,
            processing_delay: self.processing_delay,
        }
    }

    pub fn next_window(
        &self,
        previous: &CutoffWindow,
        resync: bool,
        now: DateTime<Utc>,
    ) -> CutoffWindow {
        let cutoff = previous.cutoff.max(now - self.processing_delay);
        let prior_cutoff = if resync {
            self.origin_instant(Some(previous)) - self.processing_delay
        } else {
            previous.cutoff
        };
        CutoffWindow {
            prior_cutoff: prior_cutoff.min(cutoff),
            cutoff,
            processing_delay: self.processing_delay,
        }
    }

    fn origin_instant(&self, previous: Option<&CutoffWindow>) -> DateTime<Utc> {
        match self.origin {
            ResyncOrigin::At(at) => at,
            ResyncOrigin::Startup => self.started_at,
            ResyncOrigin::LastCheckpoint => previous
                .map(|w| w.prior_cutoff)
                .unwrap_or(self.started_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn manager(origin: ResyncOrigin, started_at: DateTime<Utc>) -> CutoffWindowManager {
        CutoffWindowManager::new(StdDuration::from_secs(120), origin, started_at).unwrap()
    }

    #[test]
    fn cutoff_trails_now_by_processing_delay() {
        let now = Utc::now();
        let mgr = manager(ResyncOrigin::Startup, now);
        let window = mgr.initial_window(None, now);
        assert_eq!(window.cutoff, now - Duration::seconds(120));
        assert_eq!(window.prior_cutoff, window.cutoff);
        assert_eq!(window.processing_delay, Duration::seconds(120));
    }

    #[test]
    fn normal_advance_rolls_prior_cutoff() {
        let start = Utc::now();
        let mgr = manager(ResyncOrigin::Startup, start);
        let first = mgr.initial_window(None, start);
        let second = mgr.next_window(&first, false, start + Duration::seconds(60));
        assert_eq!(second.prior_cutoff, first.cutoff);
        assert_eq!(second.cutoff, first.cutoff + Duration::seconds(60));
    }

    #[test]
    fn cutoff_never_moves_backwards_without_resync() {
        let start = Utc::now();
        let mgr = manager(ResyncOrigin::Startup, start);
        let mut window = mgr.initial_window(None, start);
        let offsets = [60, 30, -300, 0, 600, 599, -86_400, 1];
        for offset in offsets {
            let next = mgr.next_window(&window, false, start + Duration::seconds(offset));
            assert!(next.cutoff >= window.cutoff);
            assert!(next.prior_cutoff <= next.cutoff);
            window = next;
        }
    }

    #[test]
    fn resync_from_explicit_timestamp() {
        let start = Utc::now();
        let at = start - Duration::hours(3);
        let mgr = manager(ResyncOrigin::At(at), start);
        let first = mgr.initial_window(None, start);
        assert_eq!(first.prior_cutoff, at - Duration::seconds(120));

        let now = start + Duration::seconds(60);
        let resynced = mgr.next_window(&first, true, now);
        assert_eq!(resynced.prior_cutoff, at - Duration::seconds(120));
        assert_eq!(resynced.cutoff, now - Duration::seconds(120));
    }

    #[test]
    fn resync_from_last_checkpoint_reaches_back_one_delay() {
        let start = Utc::now();
        let mgr = manager(ResyncOrigin::LastCheckpoint, start);
        let committed = CutoffWindow {
            prior_cutoff: start - Duration::minutes(10),
            cutoff: start - Duration::minutes(5),
            processing_delay: Duration::seconds(120),
        };
        let resynced = mgr.next_window(&committed, true, start);
        assert_eq!(
            resynced.prior_cutoff,
            committed.prior_cutoff - Duration::seconds(120)
        );
        assert!(resynced.cutoff >= committed.cutoff);
    }

    #[test]
    fn persisted_start_overrides_origin() {
        let start = Utc::now();
        let mgr = manager(ResyncOrigin::Startup, start);
        let persisted = start - Duration::minutes(30);
        let window = mgr.initial_window(Some(persisted), start);
        assert_eq!(window.prior_cutoff, persisted - Duration::seconds(120));
    }
}
