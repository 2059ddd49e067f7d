//! The streaming worker: one realtime thread per running stream, driving USB
//! reads and writes in lock-step with the host callback. Two transfers stay
//! on the wire per direction to hide the kernel round-trip; the first two
//! host buffers are withheld so the hardware never starts with an empty
//! queue behind the playing buffer.

use crate::buffer::HostBuffers;
use crate::config;
use crate::convert::{self, WireQuirks};
use crate::device::{Device, Profile, Settings};
use crate::error::{Error, Result};
use crate::host::{HostCallbacks, Messenger, OutputReadyState, SharedPosition, StreamTime};
use crate::rt;
use crate::usb::{Outcome, SLOTS};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const STREAM_THREAD_NAME: &str = rt::STREAM_PROFILE.name;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Priming,
    SteadyState,
    Draining,
    Stopped,
    Faulted,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StreamState::Priming,
            1 => StreamState::SteadyState,
            2 => StreamState::Draining,
            3 => StreamState::Stopped,
            _ => StreamState::Faulted,
        }
    }
}

/// State shared between the stream thread and the session's threads.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub stop: AtomicBool,
    state: AtomicU8,
    pub position: SharedPosition,
    pub output_ready: Arc<OutputReadyState>,
}

impl StreamShared {
    pub fn new(output_ready: Arc<OutputReadyState>) -> Self {
        Self {
            stop: AtomicBool::new(false),
            state: AtomicU8::new(StreamState::Priming as u8),
            position: SharedPosition::default(),
            output_ready,
        }
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Transfer sizing derived once at stream start.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamPlan {
    pub buffer_frames: usize,
    pub sample_rate: f64,
    pub must_play: bool,
    pub must_record: bool,
    pub must_read: bool,
    pub steady_write_frames: usize,
    pub steady_read_frames: usize,
    pub first_write_frames: usize,
    pub first_read_frames: usize,
    pub write_frame_bytes: usize,
    pub read_frame_bytes: usize,
}

impl StreamPlan {
    pub fn derive(
        profile: &Profile,
        buffers: &HostBuffers,
        force_read: bool,
        sample_rate: f64,
    ) -> Result<Self> {
        let buffer_frames = buffers.frames();
        let outputs = buffers.bindings().iter().filter(|b| !b.is_input).count();
        let inputs = buffers.bindings().iter().filter(|b| b.is_input).count();

        let must_play = outputs > 0;
        let must_record = inputs > 0;
        let must_read = must_record || force_read;
        let must_sync = must_play && must_read;

        if must_play && buffer_frames % profile.write_granularity_frames != 0 {
            return Err(Error::InvalidParameter(format!(
                "buffer size {} is not a multiple of the device write granularity {}",
                buffer_frames, profile.write_granularity_frames
            )));
        }

        let initial_garbage =
            if must_record { profile.initial_input_garbage_frames } else { 0 };
        let steady_write_frames = if must_play { buffer_frames } else { 0 };
        let steady_read_frames = if must_read { buffer_frames } else { 0 };

        // The hardware only starts once the start threshold is queued, and
        // the second buffer must already be queued behind the first by then.
        let mut first_write_frames =
            (if must_sync { initial_garbage } else { 0 }) + steady_write_frames;
        if first_write_frames + steady_write_frames < profile.start_threshold_frames {
            first_write_frames = profile.start_threshold_frames;
        }
        first_write_frames = first_write_frames.next_multiple_of(profile.write_granularity_frames);

        let first_read_frames = if must_read {
            (initial_garbage + steady_read_frames)
                .max(if must_sync { first_write_frames } else { 0 })
        } else {
            0
        };

        Ok(Self {
            buffer_frames,
            sample_rate,
            must_play,
            must_record,
            must_read,
            steady_write_frames,
            steady_read_frames,
            first_write_frames,
            first_read_frames,
            write_frame_bytes: profile.write_frame_bytes(),
            read_frame_bytes: profile.read_frame_bytes(),
        })
    }

    fn steady_write_bytes(&self) -> usize {
        self.steady_write_frames * self.write_frame_bytes
    }

    fn steady_read_bytes(&self) -> usize {
        self.steady_read_frames * self.read_frame_bytes
    }
}

/// Everything the stream thread owns while running; handed back to the
/// session when the thread joins.
#[derive(Debug)]
pub(crate) struct StreamArtifacts {
    pub device: Device,
    pub buffers: HostBuffers,
    pub callbacks: HostCallbacks,
}

pub(crate) struct StreamWorker {
    pub device: Device,
    pub buffers: HostBuffers,
    pub callbacks: HostCallbacks,
    pub messenger: Messenger,
    pub plan: StreamPlan,
    pub quirks: WireQuirks,
    pub settings: Settings,
    pub safe_settings: Settings,
    pub shared: Arc<StreamShared>,
    pub use_time_info: bool,
    pub use_output_ready: bool,
    pub frames: i64,
    pub half: usize,
    pub write_slot: usize,
    pub pending_half: Option<usize>,
}

impl StreamWorker {
    pub fn run(mut self) -> StreamArtifacts {
        let _timer = rt::TimerResolution::acquire();
        if let Err(err) = rt::pin_memory() {
            debug!("stream memory lock not enabled: {}", err);
        }
        if let Err(err) = rt::STREAM_PROFILE.apply() {
            warn!("stream realtime priority not enabled: {}", err);
        }

        let outcome = self.stream();
        let stop_requested = self.shared.stop.load(Ordering::Acquire);
        match outcome {
            Ok(()) => {}
            Err(Error::Aborted) if stop_requested => {
                debug!("stream unwound by stop request");
            }
            Err(err) => {
                error!("fatal error in streaming thread: {}", err);
                self.shared.set_state(StreamState::Faulted);
                self.request_reset();
            }
        }

        self.drain();

        StreamArtifacts { device: self.device, buffers: self.buffers, callbacks: self.callbacks }
    }

    fn stream(&mut self) -> Result<()> {
        self.shared.set_state(StreamState::Priming);
        self.device.reset(&self.settings)?;
        self.device.start()?;
        self.prime()?;
        self.shared.set_state(StreamState::SteadyState);
        while !self.shared.stop.load(Ordering::Acquire) {
            self.iterate()?;
        }
        Ok(())
    }

    /// Queue the initial transfers. Reads go first: they cannot complete
    /// until the device starts, and the device does not start until the
    /// writes below push it past its start threshold.
    fn prime(&mut self) -> Result<()> {
        let plan = self.plan;
        if plan.must_read {
            self.device
                .start_read(0, vec![0; plan.first_read_frames * plan.read_frame_bytes])?;
            self.device.start_read(1, vec![0; plan.steady_read_bytes()])?;
        }

        if plan.must_play {
            let first_bytes = plan.first_write_frames * plan.write_frame_bytes;
            let mut first = vec![0_u8; first_bytes];
            let mut second = vec![0_u8; plan.steady_write_bytes()];

            // Withhold the first two host buffers: the front of the first
            // transfer is silence, the valid audio sits in its tail.
            self.fire_callback(0);
            self.await_output_ready()?;
            let audio_offset = first_bytes - plan.steady_write_bytes();
            self.convert_output(0, &mut first[audio_offset..]);

            self.fire_callback(1);
            self.await_output_ready()?;
            self.convert_output(1, &mut second);

            self.device.start_write(0, first)?;
            self.device.start_write(1, second)?;
        } else if plan.must_read {
            // Read-only: a single silent write cranks the hardware past its
            // start threshold; nothing is ever written again.
            let dummy_bytes = plan.first_write_frames * plan.write_frame_bytes;
            self.device.start_write(0, vec![0_u8; dummy_bytes])?;
            let (buffer, outcome) = self.device.wait_write(0)?;
            expect_complete(outcome, buffer.len(), "priming write")?;
        }
        Ok(())
    }

    fn iterate(&mut self) -> Result<()> {
        let plan = self.plan;
        let half = self.half;

        self.device.finish_ping()?;

        if plan.must_play {
            // One buffer is always queued behind the one the hardware is
            // consuming; reuse the slot whose transfer drained first.
            if let Some(filled) = self.pending_half.take() {
                self.await_output_ready()?;
                let slot = self.write_slot;
                let (mut staging, outcome) = self.device.wait_write(slot)?;
                expect_complete(outcome, staging.len(), "write")?;
                staging.resize(plan.steady_write_bytes(), 0);
                if config::hot_log_enabled() {
                    debug!("sending host buffer half {} to the device", filled);
                }
                self.convert_output(filled, &mut staging);
                self.device.start_write(slot, staging)?;
                self.write_slot ^= 1;
            }
        }

        if plan.must_record {
            let (buffer, outcome) = self.device.wait_read(half)?;
            expect_complete(outcome, buffer.len(), "read")?;
            if config::hot_log_enabled() {
                debug!("received device data for host buffer half {}", half);
            }
            let audio_offset = buffer.len() - plan.steady_read_bytes();
            self.convert_input(half, &buffer[audio_offset..]);
            let mut buffer = buffer;
            buffer.resize(plan.steady_read_bytes(), 0);
            self.device.start_read(half, buffer)?;
        } else if plan.must_read {
            // Timing beacon only; the data is discarded.
            let (mut buffer, outcome) = self.device.wait_read(half)?;
            expect_complete(outcome, buffer.len(), "read")?;
            buffer.resize(plan.steady_read_bytes(), 0);
            self.device.start_read(half, buffer)?;
        }

        self.fire_callback(half);
        if plan.must_play {
            self.pending_half = Some(half);
        }
        self.half ^= 1;
        self.device.start_ping()?;
        Ok(())
    }

    /// Publish the position, clear the OutputReady flag and hand the half to
    /// the host. Clearing happens before the callback so a signal raised
    /// from inside it is not lost.
    fn fire_callback(&mut self, half: usize) {
        let now = rt::wall_clock_ns();
        self.shared.position.publish(self.frames, now);
        self.shared.output_ready.clear();
        if config::hot_log_enabled() {
            debug!("firing buffer switch for half {} at frame {}", half, self.frames);
        }
        let time = StreamTime {
            frames: self.frames,
            system_time_ns: now,
            sample_rate: self.plan.sample_rate,
        };
        match (self.use_time_info, self.callbacks.buffer_switch_time_info.as_mut()) {
            (true, Some(switch)) => switch(&mut self.buffers, half, time),
            _ => (self.callbacks.buffer_switch)(&mut self.buffers, half),
        }
        self.frames += self.plan.buffer_frames as i64;
    }

    fn await_output_ready(&mut self) -> Result<()> {
        if self.use_output_ready && !self.shared.output_ready.wait() {
            return Err(Error::Aborted);
        }
        Ok(())
    }

    fn convert_output(&mut self, half: usize, device: &mut [u8]) {
        for (index, binding) in self.buffers.bindings().iter().enumerate() {
            if binding.is_input {
                continue;
            }
            let plane = self.buffers.plane(index, half);
            convert::host_to_device(plane, device, binding.channel, &self.quirks);
        }
    }

    fn convert_input(&mut self, half: usize, device: &[u8]) {
        let quirks = self.quirks;
        for (binding, plane) in self.buffers.planes_mut(half) {
            if !binding.is_input {
                continue;
            }
            convert::device_to_host(device, plane, binding.channel, &quirks);
        }
    }

    fn request_reset(&self) {
        if let Err(err) = self.messenger.request_reset() {
            error!("could not request a reset from the host: {}", err);
        }
    }

    /// Cancel anything still on the wire, collect every slot, and quiesce
    /// the hardware. The QA401 keeps a lingering DC offset on its outputs
    /// unless it is reset, so the safe-defaults reset always runs.
    fn drain(&mut self) {
        self.shared.set_state(StreamState::Draining);
        let (abort_write, abort_read) = self.device.abort_handles();
        abort_write();
        abort_read();
        for slot in 0..SLOTS {
            if self.device.write_pending(slot) {
                if let Err(err) = self.device.wait_write(slot) {
                    debug!("draining write slot {}: {}", slot, err);
                }
            }
            if self.device.read_pending(slot) {
                if let Err(err) = self.device.wait_read(slot) {
                    debug!("draining read slot {}: {}", slot, err);
                }
            }
        }
        match self.device.finish_ping() {
            Ok(()) | Err(Error::Aborted) => {}
            Err(err) => debug!("draining ping: {}", err),
        }
        if let Err(err) = self.device.reset(&self.safe_settings) {
            error!("could not quiesce the device: {}", err);
            self.shared.set_state(StreamState::Faulted);
            self.request_reset();
        }
        self.shared.set_state(StreamState::Stopped);
    }
}

fn expect_complete(outcome: Outcome, requested: usize, what: &str) -> Result<()> {
    match outcome {
        Outcome::Completed { bytes } if bytes == requested => Ok(()),
        Outcome::Completed { bytes } => {
            Err(Error::HwMalfunction(format!("short {what}: {bytes} of {requested} bytes")))
        }
        Outcome::Aborted => Err(Error::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Binding;
    use crate::device::Variant;

    fn buffers(bindings: &[Binding], frames: usize) -> HostBuffers {
        HostBuffers::new(bindings, frames)
    }

    #[test]
    fn full_duplex_qa401_sizing() {
        let profile = Variant::Qa401.profile();
        let buffers =
            buffers(&[Binding::output(0), Binding::input(0), Binding::input(1)], 1024);
        let plan = StreamPlan::derive(&profile, &buffers, false, 48000.0).unwrap();
        assert!(plan.must_play && plan.must_record && plan.must_read);
        // The garbage period pads the first write so playback and capture
        // stay in lock-step.
        assert_eq!(plan.first_write_frames, 2048);
        assert_eq!(plan.first_read_frames, 2048);
        assert_eq!(plan.steady_write_frames, 1024);
        assert_eq!(plan.steady_read_frames, 1024);
    }

    #[test]
    fn output_only_qa40x_pads_to_the_start_threshold() {
        let profile = Variant::Qa40x.profile();
        let buffers = buffers(&[Binding::output(0), Binding::output(1)], 512);
        let plan = StreamPlan::derive(&profile, &buffers, false, 96000.0).unwrap();
        assert!(!plan.must_read);
        assert_eq!(plan.first_write_frames, profile.start_threshold_frames);
        assert_eq!(plan.first_read_frames, 0);
        assert_eq!(plan.first_write_frames % profile.write_granularity_frames, 0);
    }

    #[test]
    fn record_only_qa401_uses_a_one_frame_crank() {
        let profile = Variant::Qa401.profile();
        let buffers = buffers(&[Binding::input(0)], 1024);
        let plan = StreamPlan::derive(&profile, &buffers, false, 48000.0).unwrap();
        assert!(!plan.must_play && plan.must_read);
        assert_eq!(plan.first_write_frames, 1);
        assert_eq!(plan.steady_write_frames, 0);
        assert_eq!(plan.first_read_frames, 2048);
    }

    #[test]
    fn force_read_builds_the_read_pipeline_without_inputs() {
        let profile = Variant::Qa40x.profile();
        let buffers = buffers(&[Binding::output(0)], 512);
        let plan = StreamPlan::derive(&profile, &buffers, true, 48000.0).unwrap();
        assert!(plan.must_read && !plan.must_record);
        assert_eq!(plan.steady_read_frames, 512);
        // Synchronized start: the first read covers the padded first write.
        assert_eq!(plan.first_read_frames, plan.first_write_frames);
    }

    #[test]
    fn rejects_buffers_off_the_write_granularity() {
        let profile = Variant::Qa40x.profile();
        let buffers = buffers(&[Binding::output(0)], 500);
        assert!(StreamPlan::derive(&profile, &buffers, false, 48000.0).is_err());
    }
}
