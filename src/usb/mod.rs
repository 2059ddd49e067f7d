//! Thin async bulk-transfer primitive. Each pipe supports two slots so two
//! transfers can be on the wire at once; the kernel serializes submissions
//! onto the endpoint, and completions are observed in submission order.

pub mod rusb;

use crate::error::Result;

/// Slots per pipe. One staging buffer may be in flight per slot.
pub const SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { bytes: usize },
    Aborted,
}

/// Idempotent cancel callable from any thread while the owning worker is
/// blocked in `wait`.
pub type AbortHandle = Box<dyn Fn() + Send + Sync>;

/// One bulk endpoint. Buffers travel: ownership moves in on `start` and
/// comes back out of `wait` together with the transfer outcome. Starting a
/// slot that is already pending is a caller bug and fails with
/// `InvalidMode`; a partial `Completed` is the caller's problem to reject.
pub trait BulkPipe: Send {
    fn start(&mut self, slot: usize, buffer: Vec<u8>) -> Result<()>;
    fn pending(&self, slot: usize) -> bool;
    fn wait(&mut self, slot: usize) -> Result<(Vec<u8>, Outcome)>;
    fn abort_handle(&self) -> AbortHandle;
}
