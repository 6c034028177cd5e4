//! Process governor
//!
//! A single background task periodically hints the allocator to return
//! freed pages to the OS and samples the process RSS. Crossing the
//! configured memory limit at a new high-water mark emits a warning and a
//! counter, giving operators a signal before the OOM killer does.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics::Statser;

/// Settings for the background governor task.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// How often to run; 60s is plenty.
    pub interval: Duration,

    /// RSS threshold for "memory above limit" events; 0 disables them.
    pub memory_limit_bytes: u64,
}

/// Spawn the governor loop.
pub fn spawn(config: GovernorConfig, statser: Arc<dyn Statser>) -> JoinHandle<()> {
    info!(
        "governor running every {:?}, memory limit {} bytes",
        config.interval, config.memory_limit_bytes
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut high_water: u64 = 0;

        loop {
            ticker.tick().await;
            malloc_trim_hint();

            if let Some(rss) = rss_bytes() {
                statser.gauge("memory.rss", rss);
                debug!("sampled rss: {rss} bytes");

                if above_limit(rss, config.memory_limit_bytes, high_water) {
                    high_water = rss;
                    statser.increment("memory.above_limit");
                    warn!(
                        "memory above limit: rss {} bytes exceeds limit {} bytes",
                        rss, config.memory_limit_bytes
                    );
                } else if rss > high_water {
                    high_water = rss;
                }
            }
        }
    })
}

/// An event fires only when RSS is over the limit and past the previous
/// high-water mark, so a process hovering above the limit warns once per
/// growth step instead of every tick.
fn above_limit(rss: u64, limit: u64, high_water: u64) -> bool {
    limit > 0 && rss > limit && rss > high_water
}

/// Ask the allocator to return free memory to the OS. Only glibc exposes
/// this; elsewhere the hint is a no-op.
fn malloc_trim_hint() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}

/// Resident set size of this process in bytes.
#[cfg(target_os = "linux")]
pub fn rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn rss_bytes() -> Option<u64> {
    None
}
