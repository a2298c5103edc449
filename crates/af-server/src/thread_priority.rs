//! Scheduling priority for mixing and callback threads
//!
//! # Platform Support
//!
//! - **Linux**: SCHED_FIFO for mixing threads (needs CAP_SYS_NICE), a
//!   negative nice value for callback threads
//! - **macOS**: pthread QoS class USER_INTERACTIVE
//! - others: unsupported, threads keep the default policy
//!
//! Priority is per OS thread. Each thread calls [`set_thread_priority`] once
//! when it starts.

use std::cell::Cell;

thread_local! {
    static PRIORITY_SET: Cell<bool> = const { Cell::new(false) };
}

/// Requested scheduling class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    /// Playback thread: must meet every sink period.
    Mixer,
    /// Client callback thread: latency-sensitive but not hard real time.
    Callback,
}

/// Result of priority elevation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Success,
    AlreadySet,
    /// Not permitted; the thread runs at default priority.
    Failed,
    Unsupported,
}

/// Raise the calling thread's priority. Repeat calls on the same thread
/// return `AlreadySet` after a success.
pub fn set_thread_priority(priority: ThreadPriority) -> PriorityResult {
    if PRIORITY_SET.with(Cell::get) {
        return PriorityResult::AlreadySet;
    }

    let result = platform_set_priority(priority);
    match result {
        PriorityResult::Success => {
            PRIORITY_SET.with(|p| p.set(true));
            log::debug!("{priority:?} thread priority raised");
        }
        PriorityResult::Failed => {
            log::warn!("could not raise {priority:?} thread priority, continuing at default");
        }
        PriorityResult::Unsupported | PriorityResult::AlreadySet => {}
    }
    result
}

// ═══════════════════════════════════════════════════════════════════════════════
// Linux
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "linux")]
fn platform_set_priority(priority: ThreadPriority) -> PriorityResult {
    match priority {
        ThreadPriority::Mixer => {
            let param = libc::sched_param { sched_priority: 2 };
            // SAFETY: plain syscall on the calling thread with a valid param.
            let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
            if rc == 0 {
                PriorityResult::Success
            } else {
                log::debug!("pthread_setschedparam(SCHED_FIFO) failed: {rc}");
                PriorityResult::Failed
            }
        }
        ThreadPriority::Callback => {
            // SAFETY: on Linux PRIO_PROCESS with who=0 applies to the calling thread.
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -16) };
            if rc == 0 {
                PriorityResult::Success
            } else {
                PriorityResult::Failed
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// macOS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(target_os = "macos")]
fn platform_set_priority(_priority: ThreadPriority) -> PriorityResult {
    const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;

    unsafe extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
    }

    // SAFETY: affects only the calling thread.
    let rc = unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0) };
    if rc == 0 {
        PriorityResult::Success
    } else {
        PriorityResult::Failed
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_set_priority(_priority: ThreadPriority) -> PriorityResult {
    PriorityResult::Unsupported
}
