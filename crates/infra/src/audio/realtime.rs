//! Best-effort realtime scheduling for render threads
//!
//! Raises the calling thread to the MMCSS "Pro Audio" task on Windows and to
//! `SCHED_FIFO` on Unix. Failure leaves the thread at normal priority.

#[cfg(windows)]
use windows::Win32::System::Threading::{
    AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW, AvSetMmThreadPriority,
    AVRT_PRIORITY_HIGH,
};

use tracing::debug;

/// Best-effort realtime hint for render pump threads.
///
/// On Windows this enables MMCSS "Pro Audio" for the current thread; on Unix
/// it switches the thread to `SCHED_FIFO`. The previous scheduling is restored
/// when the guard drops. Failing to raise the priority only risks glitches.
pub struct RealtimeThreadGuard {
    #[cfg(windows)]
    _mmcss: Option<MmcssGuard>,
    #[cfg(unix)]
    _sched: Option<SchedGuard>,
}

impl RealtimeThreadGuard {
    pub fn is_active(&self) -> bool {
        #[cfg(windows)]
        {
            self._mmcss.is_some()
        }
        #[cfg(unix)]
        {
            self._sched.is_some()
        }
        #[cfg(not(any(windows, unix)))]
        {
            false
        }
    }
}

pub fn enable_realtime_audio_thread() -> RealtimeThreadGuard {
    let guard = RealtimeThreadGuard {
        #[cfg(windows)]
        _mmcss: enable_mmcss_pro_audio(),
        #[cfg(unix)]
        _sched: enable_sched_fifo(),
    };
    if !guard.is_active() {
        debug!("realtime scheduling unavailable for this thread; continuing at normal priority");
    }
    guard
}

#[cfg(windows)]
struct MmcssGuard(windows::Win32::Foundation::HANDLE);

#[cfg(windows)]
impl Drop for MmcssGuard {
    fn drop(&mut self) {
        // Best-effort revert. Nothing we can do if it fails.
        let _ = unsafe { AvRevertMmThreadCharacteristics(self.0) };
    }
}

#[cfg(windows)]
fn enable_mmcss_pro_audio() -> Option<MmcssGuard> {
    let mut task_index = 0u32;
    let task = windows::core::HSTRING::from("Pro Audio");
    let handle = unsafe { AvSetMmThreadCharacteristicsW(&task, &mut task_index) }.ok()?;
    let _ = unsafe { AvSetMmThreadPriority(handle, AVRT_PRIORITY_HIGH) };
    Some(MmcssGuard(handle))
}

#[cfg(unix)]
struct SchedGuard {
    policy: libc::c_int,
    param: libc::sched_param,
}

#[cfg(unix)]
impl Drop for SchedGuard {
    fn drop(&mut self) {
        let _ = unsafe { libc::pthread_setschedparam(libc::pthread_self(), self.policy, &self.param) };
    }
}

#[cfg(unix)]
fn enable_sched_fifo() -> Option<SchedGuard> {
    unsafe {
        let thread = libc::pthread_self();
        let mut policy: libc::c_int = 0;
        let mut previous: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(thread, &mut policy, &mut previous) != 0 {
            return None;
        }

        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            return None;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = (max - 10).max(1);

        // Usually EPERM without CAP_SYS_NICE or an rtprio limit
        if libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) != 0 {
            return None;
        }

        Some(SchedGuard {
            policy,
            param: previous,
        })
    }
}
