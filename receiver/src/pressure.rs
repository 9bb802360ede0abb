//! Memory pressure signals used to pause buffer reads

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::unistd::{sysconf, SysconfVar};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often [`RssLimit::run`] re-reads the resident set size
pub const RSS_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// Process-wide "memory limit reached" signal
pub trait MemoryPressure: Send + Sync {
    fn is_limit_reached(&self) -> bool;
}

/// Never reports pressure
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMemoryLimit;

impl MemoryPressure for NoMemoryLimit {
    fn is_limit_reached(&self) -> bool {
        false
    }
}

/// Soft limit on the resident set size of this process.
///
/// The read path only loads a flag. [`RssLimit::run`] keeps that flag
/// current by sampling `/proc/self/statm` on an interval.
#[derive(Debug)]
pub struct RssLimit {
    limit_bytes: u64,
    page_size: u64,
    reached: AtomicBool,
}

impl RssLimit {
    pub fn new(limit_bytes: u64) -> Self {
        let page_size = match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as u64,
            _ => 4096,
        };
        Self {
            limit_bytes,
            page_size,
            reached: AtomicBool::new(false),
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    /// Current resident set size in bytes, from `/proc/self/statm`
    pub fn resident_bytes(&self) -> io::Result<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm")?;
        let pages = parse_statm_resident(&statm)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed statm"))?;
        Ok(pages.saturating_mul(self.page_size))
    }

    /// Read the resident set size once and update the flag. A failed read
    /// leaves the flag as it was.
    pub fn sample(&self) {
        match self.resident_bytes() {
            Ok(resident) => self.record(resident),
            Err(e) => debug!("Could not read resident memory: {}", e),
        }
    }

    fn record(&self, resident: u64) {
        let reached = resident >= self.limit_bytes;
        if self.reached.swap(reached, Ordering::Relaxed) != reached {
            if reached {
                warn!(
                    "Resident memory {} bytes reached limit of {} bytes, pausing buffer reads",
                    resident, self.limit_bytes
                );
            } else {
                info!("Resident memory back under limit, resuming buffer reads");
            }
        }
    }

    /// Sample every `every` until `cancel` fires.
    pub async fn run(&self, every: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sample(),
            }
        }
    }
}

impl MemoryPressure for RssLimit {
    fn is_limit_reached(&self) -> bool {
        self.reached.load(Ordering::Relaxed)
    }
}

/// Resident page count, the second field of `statm`
fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm_resident("5120 1024 300 10 0 900 0\n"), Some(1024));
        assert_eq!(parse_statm_resident("5120"), None);
        assert_eq!(parse_statm_resident("5120 abc"), None);
    }

    #[test]
    fn test_no_limit_never_reached() {
        assert!(!NoMemoryLimit.is_limit_reached());
    }

    #[test]
    fn test_flag_follows_recorded_samples() {
        let limit = RssLimit::new(1000);
        assert!(!limit.is_limit_reached());

        limit.record(999);
        assert!(!limit.is_limit_reached());
        limit.record(1000);
        assert!(limit.is_limit_reached());
        limit.record(4000);
        assert!(limit.is_limit_reached());
        limit.record(10);
        assert!(!limit.is_limit_reached());
    }

    #[test]
    fn test_check_does_not_sample() {
        let limit = RssLimit::new(1);
        assert!(limit.resident_bytes().unwrap() > 0);

        // nothing sampled yet, so the check still reads the initial flag
        assert!(!limit.is_limit_reached());
        limit.sample();
        assert!(limit.is_limit_reached());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_updates_flag_until_cancelled() {
        let tight = Arc::new(RssLimit::new(1));
        let loose = Arc::new(RssLimit::new(u64::MAX));
        let cancel = CancellationToken::new();

        let tasks = [tight.clone(), loose.clone()].map(|limit| {
            let cancel = cancel.clone();
            tokio::spawn(async move { limit.run(RSS_SAMPLE_INTERVAL, cancel).await })
        });

        tokio::time::sleep(RSS_SAMPLE_INTERVAL * 2).await;
        assert!(tight.is_limit_reached());
        assert!(!loose.is_limit_reached());

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
