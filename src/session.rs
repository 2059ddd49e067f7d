//! The prepared session: validates the host's requests, owns the buffers and
//! the device between runs, and drives the stream worker's lifetime. This is
//! the contract the outer API dispatch object talks to.

use crate::buffer::{Binding, HostBuffers};
use crate::config::Config;
use crate::device::{Device, Profile, Settings, Variant};
use crate::error::{Error, Result};
use crate::host::{HostCallbacks, Messenger, OutputReadySignal, OutputReadyState};
use crate::rate;
use crate::usb::AbortHandle;
use crate::worker::{
    StreamArtifacts, StreamShared, StreamPlan, StreamState, StreamWorker, STREAM_THREAD_NAME,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SAMPLE_RATE: f64 = 48000.0;

// Buffer size bounds offered to the host; the floor and the step match a
// single USB bulk packet, the ceiling keeps transfers reasonable.
const MIN_BUFFER_FRAMES: usize = 64;
const MAX_BUFFER_FRAMES: usize = 32768;
const BUFFER_STEP_FRAMES: usize = 64;

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
    pub active: bool,
}

/// Buffer sizing advertised to the host. `granularity` is zero when the
/// configuration pins the size.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizeHints {
    pub min: usize,
    pub max: usize,
    pub preferred: usize,
    pub granularity: usize,
}

struct Running {
    shared: Arc<StreamShared>,
    abort_write: AbortHandle,
    abort_read: AbortHandle,
    handle: JoinHandle<StreamArtifacts>,
}

struct Prepared {
    bindings: Vec<Binding>,
    buffer_frames: usize,
    idle: Option<(HostBuffers, HostCallbacks)>,
    running: Option<Running>,
}

pub struct Session {
    variant: Variant,
    profile: Profile,
    config: Config,
    device: Option<Device>,
    sample_rate: f64,
    rate_accessed: bool,
    messenger: Messenger,
    output_ready: Arc<OutputReadyState>,
    prepared: Option<Prepared>,
}

impl Session {
    /// Build a session around an already-opened device. Invalid
    /// configuration surfaces here, before any device I/O.
    pub fn new(device: Device, config: Config) -> Result<Self> {
        config.validate()?;
        let variant = device.variant();
        let profile = *device.profile();
        let sample_rate = rate::recall()
            .filter(|rate| variant.supports_rate(*rate))
            .unwrap_or(DEFAULT_SAMPLE_RATE);
        Settings::build(variant, &config, sample_rate)?;
        Ok(Self {
            variant,
            profile,
            config,
            device: Some(device),
            sample_rate,
            rate_accessed: false,
            messenger: Messenger::new(),
            output_ready: Arc::new(OutputReadyState::default()),
            prepared: None,
        })
    }

    /// Open the single attached analyzer and build a session on it.
    pub fn open(config: Config) -> Result<Self> {
        Self::new(Device::open()?, config)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn channels(&self) -> (usize, usize) {
        (self.profile.input_channels, self.profile.output_channels)
    }

    pub fn channel_info(&self, is_input: bool, channel: usize) -> Result<ChannelInfo> {
        let count =
            if is_input { self.profile.input_channels } else { self.profile.output_channels };
        if channel >= count {
            return Err(Error::InvalidParameter(format!(
                "no such {} channel {channel}",
                if is_input { "input" } else { "output" }
            )));
        }
        let side = match channel {
            0 => " Left",
            1 => " Right",
            _ => "",
        };
        let name = format!("{} {channel}{side}", if is_input { "IN" } else { "OUT" });
        let active = self
            .prepared
            .as_ref()
            .is_some_and(|p| p.bindings.iter().any(|b| b.is_input == is_input && b.channel == channel));
        Ok(ChannelInfo { name, active })
    }

    pub fn buffer_size_hints(&self) -> BufferSizeHints {
        if let Some(frames) = self.config.buffer_size_samples {
            let frames = frames as usize;
            return BufferSizeHints { min: frames, max: frames, preferred: frames, granularity: 0 };
        }
        // Keep the hardware queue filled at 48 kHz; scale up with the rate to
        // relax the scheduling deadlines.
        let scale = (self.sample_rate / DEFAULT_SAMPLE_RATE).max(1.0);
        BufferSizeHints {
            min: MIN_BUFFER_FRAMES,
            max: MAX_BUFFER_FRAMES,
            preferred: (self.profile.hw_queue_frames as f64 * scale) as usize,
            granularity: BUFFER_STEP_FRAMES,
        }
    }

    pub fn can_sample_rate(&self, rate: f64) -> bool {
        self.variant.supports_rate(rate)
    }

    pub fn get_sample_rate(&mut self) -> f64 {
        self.rate_accessed = true;
        rate::remember(self.sample_rate);
        self.sample_rate
    }

    /// Rate changes are refused in place while streaming: the session asks
    /// the host for a full teardown instead, and touches no device register.
    pub fn set_sample_rate(&mut self, rate: f64) -> Result<()> {
        if !self.can_sample_rate(rate) {
            return Err(Error::NoClock(format!("cannot do sample rate {rate} Hz")));
        }
        self.rate_accessed = true;
        rate::remember(rate);
        if rate == self.sample_rate {
            return Ok(());
        }
        self.sample_rate = rate;
        if self.is_running() {
            debug!("sample rate changed while streaming; requesting a reset from the host");
            self.messenger.request_reset()?;
        }
        Ok(())
    }

    pub fn create_buffers(
        &mut self,
        bindings: &[Binding],
        buffer_frames: usize,
        mut callbacks: HostCallbacks,
    ) -> Result<()> {
        if bindings.is_empty() || buffer_frames == 0 {
            return Err(Error::InvalidParameter("invalid createBuffers() parameters".into()));
        }
        if self.prepared.is_some() {
            return Err(Error::InvalidMode("createBuffers() called multiple times".into()));
        }
        for (index, binding) in bindings.iter().enumerate() {
            let count = if binding.is_input {
                self.profile.input_channels
            } else {
                self.profile.output_channels
            };
            if binding.channel >= count {
                return Err(Error::InvalidParameter(format!(
                    "out of bounds {} channel in createBuffers() buffer info",
                    if binding.is_input { "input" } else { "output" }
                )));
            }
            if bindings[..index].contains(binding) {
                return Err(Error::InvalidParameter(format!(
                    "duplicate {} channel {} in createBuffers() buffer info",
                    if binding.is_input { "input" } else { "output" },
                    binding.channel
                )));
            }
        }
        let any_output = bindings.iter().any(|b| !b.is_input);
        if any_output && buffer_frames % self.profile.write_granularity_frames != 0 {
            return Err(Error::InvalidParameter(format!(
                "buffer size {} is not a multiple of the device write granularity {}",
                buffer_frames, self.profile.write_granularity_frames
            )));
        }

        if !self.rate_accessed {
            warn!(
                "host application never enquired about the sample rate and cannot know we \
                 are running at {} Hz",
                self.sample_rate
            );
        }

        self.messenger.set(callbacks.message.take());
        self.messenger.probe();

        let buffers = HostBuffers::new(bindings, buffer_frames);
        self.prepared = Some(Prepared {
            bindings: bindings.to_vec(),
            buffer_frames,
            idle: Some((buffers, callbacks)),
            running: None,
        });
        debug!("created buffers for {} channels, {} frames", bindings.len(), buffer_frames);
        Ok(())
    }

    /// Stops the stream first if needed; the worker is always joined before
    /// the buffers go away.
    pub fn dispose_buffers(&mut self) -> Result<()> {
        if self.prepared.is_none() {
            return Err(Error::InvalidMode("disposeBuffers() called before createBuffers()".into()));
        }
        if self.is_running() {
            self.stop()?;
        }
        self.prepared = None;
        self.messenger.set(None);
        Ok(())
    }

    /// `(input, output)` latency in frames.
    pub fn latencies(&self) -> Result<(usize, usize)> {
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| Error::InvalidMode("getLatencies() called before createBuffers()".into()))?;
        let frames = prepared.buffer_frames;
        let mut output = frames;
        if !self.output_ready.supported() {
            debug!("{} frames added to output latency: host does not support OutputReady", frames);
            output += frames;
        }
        let has_input = prepared.bindings.iter().any(|b| b.is_input);
        let has_output = prepared.bindings.iter().any(|b| !b.is_input);
        if has_output && !has_input && !self.config.force_read {
            // No read pipeline rate-limits the writes, so the hardware queue
            // depth shows up as extra output latency.
            debug!(
                "{} frames added to output latency: write-only mode",
                self.profile.hw_queue_frames
            );
            output += self.profile.hw_queue_frames;
        }
        Ok((frames, output))
    }

    pub fn start(&mut self) -> Result<()> {
        let prepared = self
            .prepared
            .as_mut()
            .ok_or_else(|| Error::InvalidMode("start() called before createBuffers()".into()))?;
        if prepared.running.is_some() {
            return Err(Error::InvalidMode("start() called twice".into()));
        }

        let settings = Settings::build(self.variant, &self.config, self.sample_rate)?;
        let safe_settings = Settings::safe_defaults(self.variant, self.sample_rate);
        let (plan, use_time_info) = {
            let (buffers, callbacks) = prepared
                .idle
                .as_ref()
                .ok_or_else(|| Error::HwMalfunction("buffers lost by an earlier fault".into()))?;
            let plan = StreamPlan::derive(
                &self.profile,
                buffers,
                self.config.force_read,
                self.sample_rate,
            )?;
            let use_time_info =
                callbacks.buffer_switch_time_info.is_some() && self.messenger.supports_time_info();
            (plan, use_time_info)
        };
        let device = self
            .device
            .take()
            .ok_or_else(|| Error::HwMalfunction("device lost by an earlier fault".into()))?;
        let (buffers, callbacks) = prepared.idle.take().expect("checked above");

        let use_output_ready = plan.must_play && self.output_ready.supported();
        self.output_ready.arm();
        let shared = Arc::new(StreamShared::new(self.output_ready.clone()));
        let (abort_write, abort_read) = device.abort_handles();

        info!("starting stream: {:?}", plan);
        let worker = StreamWorker {
            device,
            buffers,
            callbacks,
            messenger: self.messenger.clone(),
            plan,
            quirks: self.profile.wire_quirks(),
            settings,
            safe_settings,
            shared: shared.clone(),
            use_time_info,
            use_output_ready,
            frames: 0,
            half: 0,
            write_slot: 0,
            pending_half: None,
        };
        let handle = std::thread::Builder::new()
            .name(STREAM_THREAD_NAME.into())
            .spawn(move || worker.run())
            .map_err(|err| Error::HwMalfunction(format!("cannot spawn streaming thread: {err}")))?;
        prepared.running = Some(Running { shared, abort_write, abort_read, handle });
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let prepared = self
            .prepared
            .as_mut()
            .ok_or_else(|| Error::InvalidMode("stop() called before createBuffers()".into()))?;
        let running = prepared
            .running
            .take()
            .ok_or_else(|| Error::InvalidMode("stop() called before start()".into()))?;

        running.shared.stop.store(true, Ordering::Release);
        self.output_ready.release();
        (running.abort_write)();
        (running.abort_read)();

        match running.handle.join() {
            Ok(artifacts) => {
                self.device = Some(artifacts.device);
                prepared.idle = Some((artifacts.buffers, artifacts.callbacks));
                Ok(())
            }
            Err(_) => Err(Error::HwMalfunction("streaming thread panicked".into())),
        }
    }

    /// `(frames, wall_clock_ns)` as last published by the stream thread.
    pub fn sample_position(&self) -> Result<(i64, i64)> {
        let prepared = self.prepared.as_ref().ok_or_else(|| {
            Error::InvalidMode("getSamplePosition() called before createBuffers()".into())
        })?;
        let running = prepared
            .running
            .as_ref()
            .ok_or_else(|| Error::InvalidMode("getSamplePosition() called before start()".into()))?;
        Ok(running.shared.position.snapshot())
    }

    /// The host's OutputReady notification; the first call latches support.
    pub fn output_ready(&self) {
        self.output_ready.signal();
    }

    /// Cheap handle for hosts that signal OutputReady from callback context.
    pub fn output_ready_signal(&self) -> OutputReadySignal {
        OutputReadySignal(self.output_ready.clone())
    }

    pub fn is_running(&self) -> bool {
        self.prepared.as_ref().is_some_and(|p| p.running.is_some())
    }

    pub fn stream_state(&self) -> Option<StreamState> {
        Some(self.prepared.as_ref()?.running.as_ref()?.shared.state())
    }

    /// Ask the host to tear the session down and rebuild it.
    pub fn request_reset(&self) -> Result<()> {
        self.messenger.request_reset()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("variant", &self.variant)
            .field("sample_rate", &self.sample_rate)
            .field("prepared", &self.prepared.is_some())
            .field("running", &self.is_running())
            .finish()
    }
}
