//! rusb-backed bulk pipes. Each pipe owns a helper thread that drains a
//! two-deep submission queue with sliced blocking transfers, checking a
//! cancel flag between slices; completions are handed back through a condvar
//! in submission order. An abort cancels what is queued or on the wire at
//! that moment; later submissions run normally, so a stopped stream can be
//! started again on the same pipes.

use super::{AbortHandle, BulkPipe, Outcome, SLOTS};
use crate::device::{Variant, USB_IDS};
use crate::error::{Error, Result};
use rusb::UsbContext;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const TRANSFER_SLICE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct PipeState {
    queue: VecDeque<usize>,
    submitted: [Option<Vec<u8>>; SLOTS],
    finished: [Option<(Vec<u8>, Result<Outcome>)>; SLOTS],
    in_flight: Option<usize>,
    cancel_current: bool,
    shutdown: bool,
}

struct PipeShared {
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    endpoint: u8,
    state: Mutex<PipeState>,
    cond: Condvar,
}

pub struct RusbPipe {
    shared: Arc<PipeShared>,
    worker: Option<JoinHandle<()>>,
}

impl RusbPipe {
    pub fn new(handle: Arc<rusb::DeviceHandle<rusb::Context>>, endpoint: u8) -> Self {
        let shared = Arc::new(PipeShared {
            handle,
            endpoint,
            state: Mutex::new(PipeState::default()),
            cond: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("usb-pipe-{:02x}", endpoint))
            .spawn(move || pipe_thread(worker_shared))
            .expect("failed to spawn USB pipe thread");
        Self { shared, worker: Some(worker) }
    }
}

impl BulkPipe for RusbPipe {
    fn start(&mut self, slot: usize, buffer: Vec<u8>) -> Result<()> {
        let mut st = self.shared.state.lock().expect("pipe state poisoned");
        if st.submitted[slot].is_some()
            || st.finished[slot].is_some()
            || st.in_flight == Some(slot)
        {
            return Err(Error::InvalidMode(format!(
                "transfer already pending on endpoint {:#04x} slot {}",
                self.shared.endpoint, slot
            )));
        }
        st.submitted[slot] = Some(buffer);
        st.queue.push_back(slot);
        self.shared.cond.notify_all();
        Ok(())
    }

    fn pending(&self, slot: usize) -> bool {
        let st = self.shared.state.lock().expect("pipe state poisoned");
        st.submitted[slot].is_some() || st.finished[slot].is_some() || st.in_flight == Some(slot)
    }

    fn wait(&mut self, slot: usize) -> Result<(Vec<u8>, Outcome)> {
        let mut st = self.shared.state.lock().expect("pipe state poisoned");
        loop {
            if let Some((buffer, outcome)) = st.finished[slot].take() {
                return outcome.map(|outcome| (buffer, outcome));
            }
            if st.submitted[slot].is_none() && st.in_flight != Some(slot) {
                return Err(Error::InvalidMode(format!(
                    "wait on idle endpoint {:#04x} slot {}",
                    self.shared.endpoint, slot
                )));
            }
            st = self.shared.cond.wait(st).expect("pipe state poisoned");
        }
    }

    fn abort_handle(&self) -> AbortHandle {
        let shared = self.shared.clone();
        Box::new(move || {
            let mut st = shared.state.lock().expect("pipe state poisoned");
            debug!("aborting pending operations on endpoint {:#04x}", shared.endpoint);
            while let Some(slot) = st.queue.pop_front() {
                if let Some(buffer) = st.submitted[slot].take() {
                    st.finished[slot] = Some((buffer, Ok(Outcome::Aborted)));
                }
            }
            if st.in_flight.is_some() {
                st.cancel_current = true;
            }
            shared.cond.notify_all();
        })
    }
}

impl Drop for RusbPipe {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().expect("pipe state poisoned");
            debug_assert!(
                st.queue.is_empty() && st.in_flight.is_none(),
                "pipe dropped with transfers still pending"
            );
            st.shutdown = true;
            st.cancel_current = true;
        }
        self.shared.cond.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn pipe_thread(shared: Arc<PipeShared>) {
    loop {
        let (slot, mut buffer) = {
            let mut st = shared.state.lock().expect("pipe state poisoned");
            loop {
                if st.shutdown && st.queue.is_empty() {
                    return;
                }
                if let Some(slot) = st.queue.pop_front() {
                    let buffer = st.submitted[slot].take().expect("queued slot without buffer");
                    st.in_flight = Some(slot);
                    break (slot, buffer);
                }
                st = shared.cond.wait(st).expect("pipe state poisoned");
            }
        };

        let outcome = if shared.endpoint & 0x80 != 0 {
            run_read(&shared, &mut buffer)
        } else {
            run_write(&shared, &buffer)
        };

        let mut st = shared.state.lock().expect("pipe state poisoned");
        st.in_flight = None;
        st.cancel_current = false;
        st.finished[slot] = Some((buffer, outcome));
        shared.cond.notify_all();
    }
}

fn cancelled(shared: &PipeShared) -> bool {
    let st = shared.state.lock().expect("pipe state poisoned");
    st.cancel_current || st.shutdown
}

fn run_write(shared: &PipeShared, buffer: &[u8]) -> Result<Outcome> {
    let mut written = 0;
    while written < buffer.len() {
        if cancelled(shared) {
            return Ok(Outcome::Aborted);
        }
        match shared.handle.write_bulk(shared.endpoint, &buffer[written..], TRANSFER_SLICE) {
            Ok(n) => written += n,
            Err(rusb::Error::Timeout) => continue,
            Err(err) => return Err(map_rusb_error(err)),
        }
    }
    Ok(Outcome::Completed { bytes: written })
}

fn run_read(shared: &PipeShared, buffer: &mut [u8]) -> Result<Outcome> {
    let mut filled = 0;
    while filled < buffer.len() {
        if cancelled(shared) {
            return Ok(Outcome::Aborted);
        }
        match shared.handle.read_bulk(shared.endpoint, &mut buffer[filled..], TRANSFER_SLICE) {
            Ok(n) => filled += n,
            Err(rusb::Error::Timeout) => continue,
            Err(err) => return Err(map_rusb_error(err)),
        }
    }
    Ok(Outcome::Completed { bytes: filled })
}

fn map_rusb_error(err: rusb::Error) -> Error {
    match err {
        rusb::Error::NoDevice => Error::NotPresent("USB device disappeared".into()),
        err => Error::HwMalfunction(format!("USB transfer failed: {err}")),
    }
}

pub struct DevicePipes {
    pub register: RusbPipe,
    pub write: RusbPipe,
    pub read: RusbPipe,
}

/// Find the single attached analyzer, claim its interface and verify the
/// variant's endpoints. More than one attached device is rejected; two
/// devices of these families must never be streamed concurrently.
pub fn open_unique() -> Result<(Variant, DevicePipes)> {
    let context = rusb::Context::new()
        .map_err(|err| Error::HwMalfunction(format!("cannot create USB context: {err}")))?;
    let devices = context
        .devices()
        .map_err(|err| Error::HwMalfunction(format!("cannot enumerate USB devices: {err}")))?;

    let mut matches = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!("skipping USB device without descriptor: {}", err);
                continue;
            }
        };
        for &(variant, vid, pid) in USB_IDS {
            if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
                matches.push((variant, device.clone()));
            }
        }
    }

    let (variant, device) = match matches.len() {
        0 => {
            return Err(Error::NotPresent(
                "no QuantAsylum analyzer found. Is it connected?".into(),
            ))
        }
        1 => matches.remove(0),
        n => {
            return Err(Error::NotPresent(format!(
                "{n} QuantAsylum analyzers found; only one device may be attached"
            )))
        }
    };

    debug!("opening {:?} at bus {} address {}", variant, device.bus_number(), device.address());
    let handle = device
        .open()
        .map_err(|err| Error::NotPresent(format!("cannot open USB device: {err}")))?;
    handle
        .claim_interface(0)
        .map_err(|err| Error::NotPresent(format!("cannot claim USB interface: {err}")))?;

    verify_endpoints(&device, variant)?;

    let handle = Arc::new(handle);
    let profile = variant.profile();
    let pipes = DevicePipes {
        register: RusbPipe::new(handle.clone(), profile.register_pipe),
        write: RusbPipe::new(handle.clone(), profile.write_pipe),
        read: RusbPipe::new(handle, profile.read_pipe),
    };
    Ok((variant, pipes))
}

fn verify_endpoints(device: &rusb::Device<rusb::Context>, variant: Variant) -> Result<()> {
    let config = device
        .active_config_descriptor()
        .map_err(|err| Error::NotPresent(format!("cannot read USB configuration: {err}")))?;
    let mut present = Vec::new();
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                present.push(endpoint.address());
            }
        }
    }
    debug!("device endpoints: {:02x?}", present);

    let profile = variant.profile();
    let required = [profile.register_pipe, profile.write_pipe, profile.read_pipe];
    let missing: Vec<u8> =
        required.iter().copied().filter(|address| !present.contains(address)).collect();
    if missing.is_empty() {
        return Ok(());
    }
    let hint = if variant == Variant::Qa401 {
        " - did you run the QuantAsylum Analyzer app first to configure the hardware?"
    } else {
        ""
    };
    Err(Error::NotPresent(format!("missing USB endpoints {missing:02x?}{hint}")))
}
