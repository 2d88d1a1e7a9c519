//! # Lockup Monitor
//!
//! A wedged controller stops answering without ever signalling an error;
//! the only tell is a hardware heartbeat counter that stops moving. One
//! process-wide registry watches every attached controller from a single
//! periodic callback, deliberately one task for all instances, keeping
//! thread count bounded and lock ordering trivial (registry lock strictly
//! before any per-controller lock).
//!
//! ## Per-controller state machine
//!
//! ```text
//! ACTIVE ──(heartbeat unchanged across a full interval,
//!            no interrupts serviced)──► LOCKUP_DECLARED ──► DISABLED
//! ```
//!
//! Terminal: a locked-up controller is never recovered in place. It is
//! removed from the registry exactly once; every outstanding command is
//! force-failed so no caller waits forever; only a fresh attach cycle can
//! bring the hardware back.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use ciss_hal::Nanoseconds;

/// What the monitor needs from a controller. Implemented by the controller
/// context; every method is safe to call with the registry lock held
/// (registry lock is acquired first by construction).
pub trait MonitoredController: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &str;

    /// Current hardware heartbeat counter
    fn heartbeat(&self) -> u32;

    /// Monotonic count of interrupts this controller has serviced
    fn interrupts_serviced(&self) -> u64;

    /// Whether lockup has already been declared
    fn lockup_declared(&self) -> bool;

    /// Declare lockup; returns true if this call did the declaring.
    /// Test-and-set so double declaration is impossible.
    fn mark_lockup(&self) -> bool;

    /// Mask interrupt delivery from the hardware
    fn disable_interrupt_delivery(&self);

    /// Disable the underlying bus device
    fn disable_device(&self);

    /// Fail every outstanding command with a synthetic hardware error;
    /// returns how many were failed
    fn force_fail_outstanding(&self) -> usize;
}

/// Monitor cadence policy
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// Minimum age of a heartbeat sample before it is compared again
    pub check_interval: Nanoseconds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { check_interval: Nanoseconds::from_secs(10) }
    }
}

/// Last heartbeat observation for one controller
#[derive(Debug, Clone, Copy)]
struct Sample {
    heartbeat: u32,
    taken_at: Nanoseconds,
    interrupts: u64,
}

struct Entry {
    ctrl: Arc<dyn MonitoredController>,
    sample: Option<Sample>,
}

/// Result of one monitor pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Controllers whose heartbeat was actually compared
    pub checked: usize,
    /// Lockups declared in this pass
    pub lockups: usize,
    /// Controllers still monitored after the pass; when this reaches zero
    /// the host should stop the periodic callback
    pub remaining: usize,
}

/// Process-wide list of monitored controllers.
///
/// Explicitly owned by the host environment: created once, controllers
/// registered on attach and unregistered on detach, and [`tick`] wired to
/// a single periodic callback for the whole process.
///
/// [`tick`]: ControllerRegistry::tick
pub struct ControllerRegistry {
    entries: Mutex<Vec<Entry>>,
    config: MonitorConfig,
}

impl ControllerRegistry {
    /// Empty registry with the given cadence policy
    pub fn new(config: MonitorConfig) -> Self {
        Self { entries: Mutex::new(Vec::new()), config }
    }

    /// Start monitoring a controller
    pub fn register(&self, ctrl: Arc<dyn MonitoredController>) {
        log::info!("monitor: watching controller {}", ctrl.name());
        self.entries.lock().push(Entry { ctrl, sample: None });
    }

    /// Stop monitoring a controller (normal detach). Returns whether it
    /// was present.
    pub fn unregister(&self, ctrl: &Arc<dyn MonitoredController>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| !Arc::ptr_eq(&e.ctrl, ctrl));
        let removed = entries.len() != before;
        if removed {
            log::info!("monitor: released controller {}", ctrl.name());
        }
        removed
    }

    /// Controllers currently monitored
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is monitored
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// One monitor pass over every registered controller.
    ///
    /// A controller is skipped (sample refreshed, no comparison) when it
    /// serviced interrupts since the last look or its sample is younger
    /// than the check interval; a quiet but healthy controller must not
    /// be declared dead. A heartbeat unchanged across a full interval with
    /// no interrupt activity is a lockup: delivery and device are
    /// disabled, outstanding work is force-failed, and the controller
    /// leaves the registry for good.
    pub fn tick(&self, now: Nanoseconds) -> TickReport {
        let mut report = TickReport::default();
        let mut entries = self.entries.lock();

        entries.retain_mut(|entry| {
            if entry.ctrl.lockup_declared() {
                // Already handled elsewhere; drop it without reprocessing.
                log::warn!(
                    "monitor: controller {} already marked locked up, dropping",
                    entry.ctrl.name()
                );
                return false;
            }

            let interrupts = entry.ctrl.interrupts_serviced();
            let Some(sample) = entry.sample else {
                entry.sample = Some(Sample {
                    heartbeat: entry.ctrl.heartbeat(),
                    taken_at: now,
                    interrupts,
                });
                return true;
            };

            if interrupts != sample.interrupts {
                // Interrupt traffic proves life; restart the window.
                entry.sample = Some(Sample {
                    heartbeat: entry.ctrl.heartbeat(),
                    taken_at: now,
                    interrupts,
                });
                return true;
            }

            if now - sample.taken_at < self.config.check_interval {
                return true;
            }

            report.checked += 1;
            let heartbeat = entry.ctrl.heartbeat();
            if heartbeat != sample.heartbeat {
                entry.sample = Some(Sample { heartbeat, taken_at: now, interrupts });
                return true;
            }

            // Stalled across a full interval: terminal.
            if entry.ctrl.mark_lockup() {
                report.lockups += 1;
                log::error!(
                    "monitor: controller {} heartbeat stalled at {:#x}, declaring lockup",
                    entry.ctrl.name(),
                    heartbeat
                );
                entry.ctrl.disable_interrupt_delivery();
                entry.ctrl.disable_device();
                let failed = entry.ctrl.force_fail_outstanding();
                log::error!(
                    "monitor: controller {} disabled, {} outstanding commands failed",
                    entry.ctrl.name(),
                    failed
                );
            }
            false
        });

        report.remaining = entries.len();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeController {
        heartbeat: AtomicU32,
        interrupts: AtomicU64,
        locked: AtomicBool,
        delivery_disabled: AtomicBool,
        device_disabled: AtomicBool,
        force_fails: AtomicUsize,
        outstanding: AtomicUsize,
    }

    impl MonitoredController for FakeController {
        fn name(&self) -> &str {
            "fake0"
        }
        fn heartbeat(&self) -> u32 {
            self.heartbeat.load(Ordering::SeqCst)
        }
        fn interrupts_serviced(&self) -> u64 {
            self.interrupts.load(Ordering::SeqCst)
        }
        fn lockup_declared(&self) -> bool {
            self.locked.load(Ordering::SeqCst)
        }
        fn mark_lockup(&self) -> bool {
            !self.locked.swap(true, Ordering::SeqCst)
        }
        fn disable_interrupt_delivery(&self) {
            self.delivery_disabled.store(true, Ordering::SeqCst);
        }
        fn disable_device(&self) {
            self.device_disabled.store(true, Ordering::SeqCst);
        }
        fn force_fail_outstanding(&self) -> usize {
            self.force_fails.fetch_add(1, Ordering::SeqCst);
            self.outstanding.swap(0, Ordering::SeqCst)
        }
    }

    fn interval() -> Nanoseconds {
        MonitorConfig::default().check_interval
    }

    fn registry() -> ControllerRegistry {
        ControllerRegistry::new(MonitorConfig::default())
    }

    #[test]
    fn test_advancing_heartbeat_is_healthy() {
        let reg = registry();
        let ctrl = Arc::new(FakeController::default());
        reg.register(ctrl.clone());

        let mut now = Nanoseconds::ZERO;
        for beat in 1..5u32 {
            ctrl.heartbeat.store(beat, Ordering::SeqCst);
            now = now + interval() + Nanoseconds::from_secs(1);
            let report = reg.tick(now);
            assert_eq!(report.lockups, 0);
            assert_eq!(report.remaining, 1);
        }
        assert!(!ctrl.lockup_declared());
    }

    #[test]
    fn test_stalled_heartbeat_declares_lockup() {
        let reg = registry();
        let ctrl = Arc::new(FakeController::default());
        ctrl.heartbeat.store(7, Ordering::SeqCst);
        ctrl.outstanding.store(3, Ordering::SeqCst);
        reg.register(ctrl.clone());

        // First pass only samples.
        assert_eq!(reg.tick(Nanoseconds::ZERO).lockups, 0);
        // Within the interval: no comparison yet.
        let early = reg.tick(Nanoseconds::from_secs(1));
        assert_eq!(early.checked, 0);
        // Full interval later, heartbeat unmoved: lockup.
        let report = reg.tick(interval() + Nanoseconds::from_secs(1));
        assert_eq!(report.lockups, 1);
        assert_eq!(report.remaining, 0);
        assert!(ctrl.lockup_declared());
        assert!(ctrl.delivery_disabled.load(Ordering::SeqCst));
        assert!(ctrl.device_disabled.load(Ordering::SeqCst));
        assert_eq!(ctrl.force_fails.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_activity_suppresses_declaration() {
        let reg = registry();
        let ctrl = Arc::new(FakeController::default());
        ctrl.heartbeat.store(7, Ordering::SeqCst);
        reg.register(ctrl.clone());

        reg.tick(Nanoseconds::ZERO);
        // Heartbeat frozen, but interrupts keep arriving.
        ctrl.interrupts.store(10, Ordering::SeqCst);
        let report = reg.tick(interval() + Nanoseconds::from_secs(1));
        assert_eq!(report.lockups, 0);
        assert_eq!(report.remaining, 1);

        // Interrupts stop too; the next full window is fatal.
        let report = reg.tick(interval() + interval() + Nanoseconds::from_secs(2));
        assert_eq!(report.lockups, 1);
    }

    #[test]
    fn test_already_marked_controller_dropped_once_without_reprocessing() {
        let reg = registry();
        let ctrl = Arc::new(FakeController::default());
        reg.register(ctrl.clone());

        // Declared through some other path (administrative reset gone bad).
        assert!(ctrl.mark_lockup());
        let report = reg.tick(Nanoseconds::ZERO);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.lockups, 0);
        // Force-fail was NOT run a second time by the monitor.
        assert_eq!(ctrl.force_fails.load(Ordering::SeqCst), 0);
        // Declaring again reports "already done".
        assert!(!ctrl.mark_lockup());
    }

    #[test]
    fn test_registry_drains_to_empty() {
        let reg = registry();
        let a: Arc<dyn MonitoredController> = Arc::new(FakeController::default());
        let b: Arc<dyn MonitoredController> = Arc::new(FakeController::default());
        reg.register(a.clone());
        reg.register(b.clone());
        assert_eq!(reg.len(), 2);
        assert!(reg.unregister(&a));
        assert!(!reg.unregister(&a));
        assert_eq!(reg.tick(Nanoseconds::ZERO).remaining, 1);
        assert!(reg.unregister(&b));
        assert!(reg.is_empty());
        assert_eq!(reg.tick(Nanoseconds::ZERO).remaining, 0);
    }
}
