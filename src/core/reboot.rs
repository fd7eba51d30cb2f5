//! Reboot procedure.
//!
//! A warm reboot is only requested while the storage lock is held, so no
//! slot write can be cut in half. If the platform keeps returning (or the
//! lock stays busy), a cold reboot is forced after the last attempt.

use crate::config::{REBOOT_ATTEMPTS, REBOOT_LOCK_TIMEOUT, REBOOT_SETTLE};
use crate::storage::shared::SharedStore;
use crate::{error, info, warn};
use std::process;
use std::thread;
use std::time::Duration;

/// Exit code of the device process for a warm reboot request.
pub const WARM_EXIT_CODE: i32 = 3;
/// Exit code of the device process for a cold reboot request.
pub const COLD_EXIT_CODE: i32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebootKind {
    Warm,
    Cold,
}

/// Performs the actual reset. Returning means the reset did not happen.
pub trait RebootPlatform: Send + Sync {
    fn request(&self, kind: RebootKind);
}

/// Ends the device process; a supervisor restarts it based on the exit code.
pub struct ProcessReboot;

impl RebootPlatform for ProcessReboot {
    fn request(&self, kind: RebootKind) {
        let code = match kind {
            RebootKind::Warm => WARM_EXIT_CODE,
            RebootKind::Cold => COLD_EXIT_CODE,
        };
        info!("{kind:?} reboot, exiting with code {code}");
        process::exit(code);
    }
}

#[derive(Clone, Debug)]
pub struct RebootPolicy {
    pub attempts: u32,
    pub lock_timeout: Duration,
    pub settle: Duration,
}

impl Default for RebootPolicy {
    fn default() -> Self {
        Self {
            attempts: REBOOT_ATTEMPTS,
            lock_timeout: REBOOT_LOCK_TIMEOUT,
            settle: REBOOT_SETTLE,
        }
    }
}

/// What happened when the platform kept returning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebootOutcome {
    pub attempts: u32,
    pub warm_requests: u32,
    pub forced_cold: bool,
}

/// Reboots the device.
pub fn reboot(store: &SharedStore, platform: &dyn RebootPlatform, policy: &RebootPolicy) -> RebootOutcome {
    let mut outcome = RebootOutcome {
        attempts: 0,
        warm_requests: 0,
        forced_cold: false,
    };

    for attempt in 1..=policy.attempts {
        outcome.attempts = attempt;
        match store.try_lock_for(policy.lock_timeout) {
            Some(guard) => {
                info!("Requesting warm reboot (attempt {attempt}/{})", policy.attempts);
                platform.request(RebootKind::Warm);
                outcome.warm_requests += 1;
                thread::sleep(policy.settle);
                drop(guard);
            }
            None => error!(
                "Storage busy, cannot reboot (attempt {attempt}/{})",
                policy.attempts
            ),
        }
        thread::yield_now();
    }

    warn!("Warm reboot did not happen, forcing cold reboot");
    platform.request(RebootKind::Cold);
    outcome.forced_cold = true;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_store::MemoryStore;
    use crate::utils::test_utils::utils::RecordingReboot;

    fn quick_policy() -> RebootPolicy {
        RebootPolicy {
            attempts: 3,
            lock_timeout: Duration::from_millis(5),
            settle: Duration::from_millis(1),
        }
    }

    #[test]
    fn warm_requests_then_forced_cold() {
        let store = SharedStore::new(MemoryStore::new(1024, 512));
        let platform = RecordingReboot::default();
        let outcome = reboot(&store, &platform, &quick_policy());

        assert_eq!(
            outcome,
            RebootOutcome {
                attempts: 3,
                warm_requests: 3,
                forced_cold: true
            }
        );
        assert_eq!(
            platform.requests(),
            vec![RebootKind::Warm, RebootKind::Warm, RebootKind::Warm, RebootKind::Cold]
        );
    }

    #[test]
    fn busy_storage_skips_warm_requests() {
        let store = SharedStore::new(MemoryStore::new(1024, 512));
        let platform = RecordingReboot::default();

        let writer = store.clone();
        let held = writer.try_lock_for(Duration::from_millis(5)).unwrap();
        let outcome = thread::scope(|scope| {
            scope
                .spawn(|| reboot(&store, &platform, &quick_policy()))
                .join()
                .unwrap()
        });
        drop(held);

        assert_eq!(outcome.warm_requests, 0);
        assert!(outcome.forced_cold);
        assert_eq!(platform.requests(), vec![RebootKind::Cold]);
    }

    #[test]
    fn storage_lock_is_released_after_reboot() {
        let store = SharedStore::new(MemoryStore::new(1024, 512));
        reboot(&store, &RecordingReboot::default(), &quick_policy());
        assert!(store.lock().is_ok());
    }
}
