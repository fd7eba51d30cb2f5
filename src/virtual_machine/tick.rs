//! Periodic tick source driving the VM clock.

use crate::virtual_machine::vm::VmCore;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background thread calling [`VmCore::tick`] once per period.
///
/// Ticks are dropped, not queued, while the core masks them.
pub struct TickSource {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TickSource {
    pub fn start(core: Arc<VmCore>, period: Duration) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("vm-tick".into())
            .spawn(move || {
                while flag.load(Ordering::Acquire) {
                    thread::sleep(period);
                    core.tick();
                }
            })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_for_ticks(core: &VmCore, ticks: u64) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if core.now() >= ticks {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn advances_the_clock_until_stopped() {
        let core = Arc::new(VmCore::new());
        let mut ticks = TickSource::start(Arc::clone(&core), Duration::from_millis(1)).unwrap();
        assert!(wait_for_ticks(&core, 5));

        ticks.stop();
        assert!(!ticks.is_running());
        let stopped_at = core.now();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(core.now(), stopped_at);
    }

    #[test]
    fn begin_boot_rewinds_the_clock() {
        let core = Arc::new(VmCore::new());
        for _ in 0..3 {
            assert!(core.tick());
        }
        assert_eq!(core.now(), 3);
        core.begin_boot();
        assert_eq!(core.now(), 0);
    }
}
