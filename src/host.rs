//! The host-facing callback record and the small pieces of state shared
//! between the host's threads and the stream thread.

use crate::buffer::HostBuffers;
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    ResetRequest,
    SupportsTimeInfo,
    EngineVersion,
}

/// Messages sent to the host through its message callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMessage {
    SelectorSupported(Selector),
    ResetRequest,
    SupportsTimeInfo,
    EngineVersion,
}

pub type MessageHandler = Box<dyn FnMut(HostMessage) -> i64 + Send>;

/// Time info handed to the time-aware switch callback. Sample rate, sample
/// position and system time are all valid when this is delivered.
#[derive(Debug, Clone, Copy)]
pub struct StreamTime {
    pub frames: i64,
    pub system_time_ns: i64,
    pub sample_rate: f64,
}

pub struct HostCallbacks {
    pub buffer_switch: Box<dyn FnMut(&mut HostBuffers, usize) + Send>,
    pub buffer_switch_time_info: Option<Box<dyn FnMut(&mut HostBuffers, usize, StreamTime) + Send>>,
    pub message: Option<MessageHandler>,
}

impl std::fmt::Debug for HostCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCallbacks")
            .field("time_info", &self.buffer_switch_time_info.is_some())
            .field("message", &self.message.is_some())
            .finish()
    }
}

/// Shared holder for the host's message callback, so the session can ask for
/// a reset while the stream thread holds everything else.
#[derive(Clone, Default)]
pub struct Messenger {
    handler: Arc<Mutex<Option<MessageHandler>>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, handler: Option<MessageHandler>) {
        *self.handler.lock().expect("messenger poisoned") = handler;
    }

    pub fn call(&self, message: HostMessage) -> i64 {
        let mut guard = self.handler.lock().expect("messenger poisoned");
        let result = match guard.as_mut() {
            Some(handler) => handler(message),
            None => 0,
        };
        debug!("host message {:?} -> {}", message, result);
        result
    }

    pub fn supports(&self, selector: Selector) -> bool {
        self.call(HostMessage::SelectorSupported(selector)) == 1
    }

    pub fn supports_time_info(&self) -> bool {
        self.supports(Selector::SupportsTimeInfo) && self.call(HostMessage::SupportsTimeInfo) == 1
    }

    /// Ask the host to tear the session down and rebuild it.
    pub fn request_reset(&self) -> Result<()> {
        if !self.supports(Selector::ResetRequest) {
            return Err(Error::InvalidMode("reset requests are not supported".into()));
        }
        self.call(HostMessage::ResetRequest);
        Ok(())
    }

    /// Instrumentation only: record the host's capabilities in the log.
    pub(crate) fn probe(&self) {
        for selector in
            [Selector::ResetRequest, Selector::SupportsTimeInfo, Selector::EngineVersion]
        {
            if !self.supports(selector) {
                continue;
            }
            if selector == Selector::EngineVersion {
                self.call(HostMessage::EngineVersion);
            }
        }
    }
}

/// OutputReady handshake. `signal` latches host support; the stream thread
/// clears before firing a callback and waits before consuming the filled
/// half, so a signal raised from inside the callback is never lost.
#[derive(Debug, Default)]
pub struct OutputReadyState {
    supported: AtomicBool,
    ready: Mutex<ReadyFlags>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct ReadyFlags {
    ready: bool,
    released: bool,
}

impl OutputReadyState {
    pub fn supported(&self) -> bool {
        self.supported.load(Ordering::Acquire)
    }

    pub fn signal(&self) {
        if !self.supported.swap(true, Ordering::AcqRel) {
            debug!("host supports OutputReady");
        }
        self.ready.lock().expect("output ready gate poisoned").ready = true;
        self.cond.notify_all();
    }

    /// Re-arm at stream start.
    pub(crate) fn arm(&self) {
        let mut flags = self.ready.lock().expect("output ready gate poisoned");
        flags.ready = false;
        flags.released = false;
    }

    pub(crate) fn clear(&self) {
        self.ready.lock().expect("output ready gate poisoned").ready = false;
    }

    /// Blocks until the host signals; `false` means the gate was released by
    /// a stop request instead.
    pub(crate) fn wait(&self) -> bool {
        let mut flags = self.ready.lock().expect("output ready gate poisoned");
        while !flags.ready && !flags.released {
            flags = self.cond.wait(flags).expect("output ready gate poisoned");
        }
        flags.ready
    }

    /// Wake the stream thread out of the gate during stop or fault.
    pub(crate) fn release(&self) {
        self.ready.lock().expect("output ready gate poisoned").released = true;
        self.cond.notify_all();
    }
}

/// Host-visible OutputReady handle; cheap to clone into callback closures.
#[derive(Debug, Clone)]
pub struct OutputReadySignal(pub(crate) Arc<OutputReadyState>);

impl OutputReadySignal {
    pub fn signal(&self) {
        self.0.signal();
    }
}

/// Single-writer position snapshot readable from any thread without locks.
#[derive(Debug, Default)]
pub struct SharedPosition {
    seq: AtomicU64,
    frames: AtomicI64,
    wall_clock_ns: AtomicI64,
}

impl SharedPosition {
    pub(crate) fn publish(&self, frames: i64, wall_clock_ns: i64) {
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
        self.frames.store(frames, Ordering::Relaxed);
        self.wall_clock_ns.store(wall_clock_ns, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// `(frames, wall_clock_ns)` as last published by the stream thread.
    pub fn snapshot(&self) -> (i64, i64) {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let frames = self.frames.load(Ordering::Relaxed);
            let wall_clock_ns = self.wall_clock_ns.load(Ordering::Relaxed);
            if self.seq.load(Ordering::Acquire) == before {
                return (frames, wall_clock_ns);
            }
        }
    }
}
