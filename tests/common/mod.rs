//! Shared test harness: a scriptable mock transport standing in for the USB
//! stack, a wire-level analyzer model that reproduces the hardware quirks,
//! and a recording host.

#![allow(dead_code)]

use qa40x_engine::error::Error;
use qa40x_engine::usb::AbortHandle;
use qa40x_engine::{
    Binding, BulkPipe, Config, Device, HostCallbacks, HostMessage, Outcome, OutputReadySignal,
    Selector, Session, Variant,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Marker value for input frames recorded before the device clock started;
/// it must never reach a host buffer.
pub const GARBAGE_SAMPLE: i32 = 0x7f7f_7f7f;

const SAMPLE_BYTES: usize = 4;
const CHANNELS: usize = 2;
const FRAME_BYTES: usize = CHANNELS * SAMPLE_BYTES;

/// Wire-level model of one analyzer. Writes append to the OUT stream; reads
/// serve the IN stream: garbage first, then an analog loopback of whatever
/// has been played, then silence (the ADC free-runs).
///
/// The hardware quirks reproduced here, per variant:
///   QA401: output lanes swapped and inverted by the DAC, right ADC channel
///          inverted, big-endian samples.
///   QA40x: straight lanes, right ADC channel inverted, little-endian.
pub struct AnalyzerModel {
    variant: Variant,
    garbage_frames: usize,
    out_bytes: Vec<u8>,
    served_in_frames: usize,
}

impl AnalyzerModel {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            garbage_frames: variant.profile().initial_input_garbage_frames,
            out_bytes: Vec::new(),
            served_in_frames: 0,
        }
    }

    pub fn out_frame_count(&self) -> usize {
        self.out_bytes.len() / FRAME_BYTES
    }

    /// Decode one OUT wire frame as `[lane0, lane1]`.
    pub fn out_frame(&self, index: usize) -> [i32; 2] {
        let offset = index * FRAME_BYTES;
        if offset + FRAME_BYTES > self.out_bytes.len() {
            return [0; 2];
        }
        let mut lanes = [0; 2];
        for (lane, value) in lanes.iter_mut().enumerate() {
            let start = offset + lane * SAMPLE_BYTES;
            let bytes: [u8; 4] = self.out_bytes[start..start + SAMPLE_BYTES].try_into().unwrap();
            *value = if self.variant.profile().big_endian {
                i32::from_be_bytes(bytes)
            } else {
                i32::from_le_bytes(bytes)
            };
        }
        lanes
    }

    /// One IN wire frame, after the loopback path through the analog side.
    fn in_frame(&self, index: usize) -> [i32; 2] {
        if index < self.garbage_frames {
            return [GARBAGE_SAMPLE; 2];
        }
        let profile = self.variant.profile();
        let out = self.out_frame(index - self.garbage_frames);
        let mut wire_in = [0; 2];
        for channel in 0..CHANNELS {
            let lane_out = if profile.swap_out { (channel + 1) % CHANNELS } else { channel };
            let lane_in = if profile.swap_in { (channel + 1) % CHANNELS } else { channel };
            // The DAC inverts on the older variant; the right ADC channel
            // inverts on both.
            let mut analog = out[lane_out];
            if profile.invert_out {
                analog = analog.wrapping_neg();
            }
            wire_in[lane_in] = if channel == 1 { analog.wrapping_neg() } else { analog };
        }
        wire_in
    }

    fn push_out(&mut self, bytes: &[u8]) {
        self.out_bytes.extend_from_slice(bytes);
    }

    pub fn push_out_for_test(&mut self, bytes: &[u8]) {
        self.push_out(bytes);
    }

    pub fn serve_in_for_test(&mut self, buffer: &mut [u8]) {
        self.serve_in(buffer);
    }

    fn serve_in(&mut self, buffer: &mut [u8]) {
        let profile = self.variant.profile();
        let frames = buffer.len() / FRAME_BYTES;
        for frame in 0..frames {
            let wire = self.in_frame(self.served_in_frames + frame);
            for (lane, value) in wire.iter().enumerate() {
                let bytes = if profile.big_endian { value.to_be_bytes() } else { value.to_le_bytes() };
                let start = frame * FRAME_BYTES + lane * SAMPLE_BYTES;
                buffer[start..start + SAMPLE_BYTES].copy_from_slice(&bytes);
            }
        }
        self.served_in_frames += frames;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeKind {
    Register,
    DataOut,
    DataIn,
}

struct PipeState {
    kind: PipeKind,
    submissions: [Option<Vec<u8>>; 2],
    /// Submissions already cancelled by an abort, waiting to be collected.
    aborted_slots: [Option<Vec<u8>>; 2],
    submit_count: usize,
    abort_calls: usize,
    outstanding: usize,
    max_outstanding: usize,
    reached_two: bool,
    zero_before_abort: bool,
    /// `(submission index, missing bytes)`: that transfer completes short.
    short_at: Option<(usize, usize)>,
    register_log: Vec<(u8, u32)>,
    transfer_lens: Vec<usize>,
}

impl PipeState {
    fn new(kind: PipeKind) -> Self {
        Self {
            kind,
            submissions: [None, None],
            aborted_slots: [None, None],
            submit_count: 0,
            abort_calls: 0,
            outstanding: 0,
            max_outstanding: 0,
            reached_two: false,
            zero_before_abort: false,
            short_at: None,
            register_log: Vec::new(),
            transfer_lens: Vec::new(),
        }
    }
}

/// A mock bulk pipe. Transfers "complete" lazily at `wait` time, so a stop
/// request that lands first turns them into `Aborted`, as the real kernel
/// would after an abort.
#[derive(Clone)]
pub struct MockPipe {
    state: Arc<Mutex<PipeState>>,
    model: Option<Arc<Mutex<AnalyzerModel>>>,
}

impl MockPipe {
    fn new(kind: PipeKind, model: Option<Arc<Mutex<AnalyzerModel>>>) -> Self {
        Self { state: Arc::new(Mutex::new(PipeState::new(kind))), model }
    }
}

impl BulkPipe for MockPipe {
    fn start(&mut self, slot: usize, buffer: Vec<u8>) -> qa40x_engine::Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.submissions[slot].is_some() || st.aborted_slots[slot].is_some() {
            return Err(Error::InvalidMode(format!("transfer already pending on slot {slot}")));
        }
        st.submit_count += 1;
        st.outstanding += 1;
        st.max_outstanding = st.max_outstanding.max(st.outstanding);
        if st.outstanding == 2 {
            st.reached_two = true;
        }
        st.transfer_lens.push(buffer.len());
        match st.kind {
            PipeKind::Register => {
                assert_eq!(buffer.len(), 5, "register writes are always 5 bytes");
                let value = u32::from_be_bytes(buffer[1..5].try_into().unwrap());
                st.register_log.push((buffer[0], value));
            }
            PipeKind::DataOut => {
                // The kernel has accepted the transfer; the device consumes
                // it from here on, so reads may observe it immediately.
                self.model.as_ref().unwrap().lock().unwrap().push_out(&buffer);
            }
            PipeKind::DataIn => {}
        }
        st.submissions[slot] = Some(buffer);
        Ok(())
    }

    fn pending(&self, slot: usize) -> bool {
        let st = self.state.lock().unwrap();
        st.submissions[slot].is_some() || st.aborted_slots[slot].is_some()
    }

    fn wait(&mut self, slot: usize) -> qa40x_engine::Result<(Vec<u8>, Outcome)> {
        let mut st = self.state.lock().unwrap();
        if let Some(buffer) = st.aborted_slots[slot].take() {
            st.outstanding -= 1;
            return Ok((buffer, Outcome::Aborted));
        }
        let mut buffer = st.submissions[slot]
            .take()
            .ok_or_else(|| Error::InvalidMode(format!("wait on idle slot {slot}")))?;
        st.outstanding -= 1;
        if st.outstanding == 0 && st.reached_two && st.abort_calls == 0 {
            st.zero_before_abort = true;
        }
        let submission = st.submit_count - st.outstanding - 1;
        let requested = buffer.len();
        let bytes = match st.short_at {
            Some((index, missing)) if index == submission => requested.saturating_sub(missing),
            _ => requested,
        };
        if st.kind == PipeKind::DataIn {
            let model = self.model.as_ref().unwrap();
            model.lock().unwrap().serve_in(&mut buffer);
        }
        Ok((buffer, Outcome::Completed { bytes }))
    }

    /// Cancels what is pending at the moment of the call; later submissions
    /// run normally, as with the real pipes.
    fn abort_handle(&self) -> AbortHandle {
        let state = self.state.clone();
        Box::new(move || {
            let mut st = state.lock().unwrap();
            st.abort_calls += 1;
            for slot in 0..2 {
                if let Some(buffer) = st.submissions[slot].take() {
                    st.aborted_slots[slot] = Some(buffer);
                }
            }
        })
    }
}

/// One mock analyzer: three pipes sharing a wire model.
pub struct Rig {
    pub variant: Variant,
    pub model: Arc<Mutex<AnalyzerModel>>,
    register: MockPipe,
    write: MockPipe,
    read: MockPipe,
}

impl Rig {
    pub fn new(variant: Variant) -> Self {
        let model = Arc::new(Mutex::new(AnalyzerModel::new(variant)));
        Self {
            variant,
            register: MockPipe::new(PipeKind::Register, None),
            write: MockPipe::new(PipeKind::DataOut, Some(model.clone())),
            read: MockPipe::new(PipeKind::DataIn, Some(model.clone())),
            model,
        }
    }

    pub fn device(&self) -> Device {
        Device::new(
            self.variant,
            Box::new(self.register.clone()),
            Box::new(self.write.clone()),
            Box::new(self.read.clone()),
        )
    }

    /// Make the `index`-th read submission complete `missing` bytes short.
    pub fn script_short_read(&self, index: usize, missing: usize) {
        self.read.state.lock().unwrap().short_at = Some((index, missing));
    }

    pub fn register_log(&self) -> Vec<(u8, u32)> {
        self.register.state.lock().unwrap().register_log.clone()
    }

    pub fn write_lens(&self) -> Vec<usize> {
        self.write.state.lock().unwrap().transfer_lens.clone()
    }

    pub fn read_lens(&self) -> Vec<usize> {
        self.read.state.lock().unwrap().transfer_lens.clone()
    }

    pub fn write_stats(&self) -> PipeStats {
        pipe_stats(&self.write)
    }

    pub fn read_stats(&self) -> PipeStats {
        pipe_stats(&self.read)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipeStats {
    pub submit_count: usize,
    pub max_outstanding: usize,
    pub reached_two: bool,
    pub zero_before_abort: bool,
    pub abort_calls: usize,
    pub outstanding: usize,
}

fn pipe_stats(pipe: &MockPipe) -> PipeStats {
    let st = pipe.state.lock().unwrap();
    PipeStats {
        submit_count: st.submit_count,
        max_outstanding: st.max_outstanding,
        reached_two: st.reached_two,
        zero_before_abort: st.zero_before_abort,
        abort_calls: st.abort_calls,
        outstanding: st.outstanding,
    }
}

/// What the recording host saw, callback by callback.
#[derive(Debug, Default)]
pub struct HostLog {
    pub switches: Vec<SwitchRecord>,
    pub messages: Vec<HostMessage>,
}

#[derive(Debug, Clone)]
pub struct SwitchRecord {
    pub half: usize,
    pub frames: Option<i64>,
    pub system_time_ns: Option<i64>,
    pub input_left: Vec<i32>,
    pub input_right: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostOptions {
    pub time_info: bool,
    pub reset_request: bool,
    pub output_ready: bool,
    pub feed_ramp: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self { time_info: true, reset_request: true, output_ready: false, feed_ramp: false }
    }
}

pub struct MockHost {
    pub log: Arc<Mutex<HostLog>>,
    pub options: HostOptions,
}

impl MockHost {
    pub fn new(options: HostOptions) -> Self {
        Self { log: Arc::new(Mutex::new(HostLog::default())), options }
    }

    /// Build the callback record. `signal` is wired into the switch callback
    /// the way a host raising OutputReady from callback context would.
    pub fn callbacks(&self, signal: Option<OutputReadySignal>) -> HostCallbacks {
        let options = self.options;
        let ramp = Arc::new(Mutex::new(0_i32));

        let record =
            move |log: &Arc<Mutex<HostLog>>,
                  buffers: &mut qa40x_engine::HostBuffers,
                  half: usize,
                  frames: Option<i64>,
                  system_time_ns: Option<i64>,
                  ramp: &Arc<Mutex<i32>>,
                  signal: &Option<OutputReadySignal>| {
                let input_left =
                    buffers.input_plane(0, half).map(<[i32]>::to_vec).unwrap_or_default();
                let input_right =
                    buffers.input_plane(1, half).map(<[i32]>::to_vec).unwrap_or_default();
                if options.feed_ramp {
                    if let Ok(plane) = buffers.output_plane_mut(0, half) {
                        let mut next = ramp.lock().unwrap();
                        for sample in plane {
                            *sample = *next;
                            *next += 1;
                        }
                    }
                }
                log.lock().unwrap().switches.push(SwitchRecord {
                    half,
                    frames,
                    system_time_ns,
                    input_left,
                    input_right,
                });
                if let Some(signal) = signal {
                    signal.signal();
                }
            };

        let switch_log = self.log.clone();
        let switch_ramp = ramp.clone();
        let switch_signal = signal.clone();
        let time_log = self.log.clone();
        let time_signal = signal;

        let message_log = self.log.clone();
        HostCallbacks {
            buffer_switch: Box::new(move |buffers, half| {
                record(&switch_log, buffers, half, None, None, &switch_ramp, &switch_signal);
            }),
            buffer_switch_time_info: if options.time_info {
                Some(Box::new(move |buffers, half, time| {
                    record(
                        &time_log,
                        buffers,
                        half,
                        Some(time.frames),
                        Some(time.system_time_ns),
                        &ramp,
                        &time_signal,
                    );
                }))
            } else {
                None
            },
            message: Some(Box::new(move |message| {
                message_log.lock().unwrap().messages.push(message);
                match message {
                    HostMessage::SelectorSupported(Selector::ResetRequest) => {
                        i64::from(options.reset_request)
                    }
                    HostMessage::SelectorSupported(Selector::SupportsTimeInfo) => {
                        i64::from(options.time_info)
                    }
                    HostMessage::SupportsTimeInfo => i64::from(options.time_info),
                    HostMessage::ResetRequest => 1,
                    _ => 0,
                }
            })),
        }
    }

    pub fn switch_count(&self) -> usize {
        self.log.lock().unwrap().switches.len()
    }

    pub fn wait_for_switches(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.switch_count() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} buffer switches");
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    pub fn wait_for_message(&self, message: HostMessage) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.log.lock().unwrap().messages.contains(&message) {
            assert!(Instant::now() < deadline, "timed out waiting for host message {message:?}");
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}

/// Convenience: session over a mock rig with the given bindings, started or
/// not as the test needs.
pub fn session_on(rig: &Rig, config: Config) -> Session {
    Session::new(rig.device(), config).expect("session construction failed")
}

pub fn duplex_bindings() -> Vec<Binding> {
    vec![Binding::output(0), Binding::input(0), Binding::input(1)]
}

pub fn no_marker_leaked(log: &HostLog) -> bool {
    log.switches.iter().all(|record| {
        !record.input_left.contains(&GARBAGE_SAMPLE) && !record.input_right.contains(&GARBAGE_SAMPLE)
    })
}
