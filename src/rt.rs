use std::io;
#[cfg(unix)]
use nix::libc;
use tracing::debug;

/// Scheduling identity of the stream thread: realtime class, fixed
/// priority, and the name that shows up in thread listings.
#[derive(Debug, Clone, Copy)]
pub struct ThreadProfile {
    pub name: &'static str,
    pub priority: i32,
}

pub const STREAM_PROFILE: ThreadProfile = ThreadProfile { name: "qa40x-stream", priority: 18 };

#[cfg(unix)]
fn pthread_result(rc: libc::c_int) -> io::Result<()> {
    // pthread calls hand the error back as the return value, not in errno.
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

impl ThreadProfile {
    /// Promote the calling thread to SCHED_FIFO at this profile's priority.
    /// The device reset sequences run on the stream thread and their
    /// internal timing matters, so this happens before the first register
    /// write. The parameters are read back afterwards; a kernel may accept
    /// the call yet keep the thread in its old class.
    pub fn apply(self) -> io::Result<()> {
        #[cfg(unix)]
        {
            let handle = unsafe { libc::pthread_self() };

            if let Ok(name) = std::ffi::CString::new(self.name) {
                #[cfg(target_os = "linux")]
                unsafe {
                    libc::pthread_setname_np(handle, name.as_ptr());
                }
                #[cfg(target_os = "freebsd")]
                unsafe {
                    libc::pthread_set_name_np(handle, name.as_ptr());
                }
                #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
                let _ = name;
            }

            let mut wanted: libc::sched_param = unsafe { std::mem::zeroed() };
            wanted.sched_priority = self.priority;
            pthread_result(unsafe {
                libc::pthread_setschedparam(handle, libc::SCHED_FIFO, &wanted)
            })?;

            let mut policy = 0_i32;
            let mut applied: libc::sched_param = unsafe { std::mem::zeroed() };
            pthread_result(unsafe {
                libc::pthread_getschedparam(handle, &mut policy, &mut applied)
            })?;
            if policy != libc::SCHED_FIFO || applied.sched_priority != self.priority {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!(
                        "scheduler kept policy {policy} priority {} for {}",
                        applied.sched_priority, self.name
                    ),
                ));
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "realtime scheduling is not available on this platform",
            ))
        }
    }
}

/// Pin the process pages so the stream thread never takes a page fault
/// mid-cycle.
pub fn pin_memory() -> io::Result<()> {
    #[cfg(unix)]
    {
        match unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(io::ErrorKind::Unsupported, "mlockall is not available"))
    }
}

/// Monotonic wall clock in nanoseconds; the source for every timestamp the
/// host sees.
pub fn wall_clock_ns() -> i64 {
    #[cfg(unix)]
    {
        let mut now = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let ok = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) == 0 };
        if !ok {
            return 0;
        }
        (now.tv_sec as i64).saturating_mul(1_000_000_000) + now.tv_nsec as i64
    }
    #[cfg(not(unix))]
    {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
    }
}

/// Scoped millisecond-tick acquisition held for the stream's lifetime and
/// released on every exit path. CLOCK_MONOTONIC already ticks well below
/// 1 ms here, so acquisition is only bracketed in the log.
#[derive(Debug)]
pub struct TimerResolution(());

impl TimerResolution {
    pub fn acquire() -> Self {
        debug!("acquiring high resolution timer");
        Self(())
    }
}

impl Drop for TimerResolution {
    fn drop(&mut self) {
        debug!("releasing high resolution timer");
    }
}
