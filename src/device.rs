//! Device variants, wire constants and the register protocol. The QA402 and
//! QA403 speak one protocol; everything written for `Qa40x` applies to both.

use crate::convert::WireQuirks;
use crate::error::{Error, Result};
use crate::usb::{AbortHandle, BulkPipe, Outcome};
use std::time::Duration;
use tracing::{debug, info};

/// Supported device families. Closed on purpose: the streaming loop matches
/// on this, and a new family means revisiting the quirks table anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Qa401,
    Qa40x,
}

/// USB identity of each supported product.
// TODO: confirm the QA402 product id against a real unit; only the QA401 and
// QA403 figures have been read off actual hardware.
pub const USB_IDS: &[(Variant, u16, u16)] = &[
    (Variant::Qa401, 0x16c0, 0x4e27),
    (Variant::Qa40x, 0x16c0, 0x4e2d), // QA402
    (Variant::Qa40x, 0x16c0, 0x4e2e), // QA403
];

#[derive(Debug, Clone, Copy)]
pub struct Profile {
    pub input_channels: usize,
    pub output_channels: usize,
    pub sample_bytes: usize,
    pub big_endian: bool,
    pub hw_queue_frames: usize,
    pub write_granularity_frames: usize,
    pub start_threshold_frames: usize,
    pub initial_input_garbage_frames: usize,
    pub needs_ping: bool,
    pub invert_out: bool,
    pub swap_out: bool,
    pub swap_in: bool,
    pub register_pipe: u8,
    pub write_pipe: u8,
    pub read_pipe: u8,
}

const QA401_PROFILE: Profile = Profile {
    input_channels: 2,
    output_channels: 2,
    sample_bytes: 4,
    big_endian: true,
    hw_queue_frames: 1024, // measured empirically
    write_granularity_frames: 1,
    start_threshold_frames: 1, // streams as soon as any write lands
    initial_input_garbage_frames: 1024,
    needs_ping: true,
    invert_out: true,
    swap_out: true,
    swap_in: true,
    register_pipe: 0x02,
    write_pipe: 0x04,
    read_pipe: 0x86,
};

const QA40X_PROFILE: Profile = Profile {
    input_channels: 2,
    output_channels: 2,
    sample_bytes: 4,
    big_endian: false,
    hw_queue_frames: 1024,      // measured empirically on a QA403
    write_granularity_frames: 64,
    start_threshold_frames: 1536,
    initial_input_garbage_frames: 0,
    needs_ping: false,
    invert_out: false,
    swap_out: false,
    swap_in: false,
    register_pipe: 0x01,
    write_pipe: 0x02,
    read_pipe: 0x82,
};

const QA401_RATES: [f64; 2] = [48000.0, 192000.0];
const QA40X_RATES: [f64; 4] = [48000.0, 96000.0, 192000.0, 384000.0];

impl Variant {
    pub const fn profile(self) -> Profile {
        match self {
            Variant::Qa401 => QA401_PROFILE,
            Variant::Qa40x => QA40X_PROFILE,
        }
    }

    pub fn supported_rates(self) -> &'static [f64] {
        match self {
            Variant::Qa401 => &QA401_RATES,
            Variant::Qa40x => &QA40X_RATES,
        }
    }

    pub fn supports_rate(self, rate: f64) -> bool {
        self.supported_rates().contains(&rate)
    }
}

impl Profile {
    pub fn wire_quirks(&self) -> WireQuirks {
        WireQuirks {
            out_channels: self.output_channels,
            in_channels: self.input_channels,
            big_endian: self.big_endian,
            invert_out: self.invert_out,
            swap_out: self.swap_out,
            swap_in: self.swap_in,
        }
    }

    pub fn write_frame_bytes(&self) -> usize {
        self.output_channels * self.sample_bytes
    }

    pub fn read_frame_bytes(&self) -> usize {
        self.input_channels * self.sample_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullScaleInput {
    Dbv0,
    Dbv6,
    Dbv12,
    Dbv18,
    Dbv24,
    Dbv30,
    Dbv36,
    Dbv42,
}

const FULL_SCALE_INPUTS: [(f64, FullScaleInput); 8] = [
    (0.0, FullScaleInput::Dbv0),
    (6.0, FullScaleInput::Dbv6),
    (12.0, FullScaleInput::Dbv12),
    (18.0, FullScaleInput::Dbv18),
    (24.0, FullScaleInput::Dbv24),
    (30.0, FullScaleInput::Dbv30),
    (36.0, FullScaleInput::Dbv36),
    (42.0, FullScaleInput::Dbv42),
];

impl FullScaleInput {
    pub fn from_dbv(dbv: f64) -> Result<Self> {
        FULL_SCALE_INPUTS
            .iter()
            .find(|(value, _)| *value == dbv)
            .map(|(_, level)| *level)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("unsupported full scale input level {dbv} dBV"))
            })
    }

    pub fn code(self) -> u32 {
        match self {
            FullScaleInput::Dbv0 => 0,
            FullScaleInput::Dbv6 => 1,
            FullScaleInput::Dbv12 => 2,
            FullScaleInput::Dbv18 => 3,
            FullScaleInput::Dbv24 => 4,
            FullScaleInput::Dbv30 => 5,
            FullScaleInput::Dbv36 => 6,
            FullScaleInput::Dbv42 => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullScaleOutput {
    DbvMinus12,
    DbvMinus2,
    Dbv8,
    Dbv18,
}

const FULL_SCALE_OUTPUTS: [(f64, FullScaleOutput); 4] = [
    (-12.0, FullScaleOutput::DbvMinus12),
    (-2.0, FullScaleOutput::DbvMinus2),
    (8.0, FullScaleOutput::Dbv8),
    (18.0, FullScaleOutput::Dbv18),
];

impl FullScaleOutput {
    pub fn from_dbv(dbv: f64) -> Result<Self> {
        FULL_SCALE_OUTPUTS
            .iter()
            .find(|(value, _)| *value == dbv)
            .map(|(_, level)| *level)
            .ok_or_else(|| {
                Error::InvalidParameter(format!("unsupported full scale output level {dbv} dBV"))
            })
    }

    pub fn code(self) -> u32 {
        match self {
            FullScaleOutput::DbvMinus12 => 0,
            FullScaleOutput::DbvMinus2 => 1,
            FullScaleOutput::Dbv8 => 2,
            FullScaleOutput::Dbv18 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qa40xRate {
    Khz48,
    Khz96,
    Khz192,
    Khz384,
}

impl Qa40xRate {
    pub fn from_hz(rate: f64) -> Result<Self> {
        match rate as u32 {
            48000 => Ok(Qa40xRate::Khz48),
            96000 => Ok(Qa40xRate::Khz96),
            192000 => Ok(Qa40xRate::Khz192),
            384000 => Ok(Qa40xRate::Khz384),
            _ => Err(Error::NoClock(format!("cannot do sample rate {rate} Hz"))),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Qa40xRate::Khz48 => 0,
            Qa40xRate::Khz96 => 1,
            Qa40xRate::Khz192 => 2,
            Qa40xRate::Khz384 => 3,
        }
    }
}

/// Per-session device settings, validated against the variant's enumerated
/// register codes before any device I/O happens.
#[derive(Debug, Clone, Copy)]
pub enum Settings {
    Qa401 { hpf: bool, attenuator: bool, high_rate: bool },
    Qa40x { input: FullScaleInput, output: FullScaleOutput, rate: Qa40xRate },
}

impl Settings {
    pub fn build(
        variant: Variant,
        config: &crate::config::Config,
        sample_rate: f64,
    ) -> Result<Self> {
        if !variant.supports_rate(sample_rate) {
            return Err(Error::NoClock(format!("cannot do sample rate {sample_rate} Hz")));
        }
        match variant {
            Variant::Qa401 => {
                if config.full_scale_input_level_dbv.is_some()
                    || config.full_scale_output_level_dbv.is_some()
                {
                    return Err(Error::InvalidParameter(
                        "full scale levels are not configurable on the QA401; \
                         use the attenuator option instead"
                            .into(),
                    ));
                }
                // The input high pass filter is not configurable; no clear
                // use case for disabling it has surfaced.
                Ok(Settings::Qa401 {
                    hpf: true,
                    attenuator: config.attenuator,
                    high_rate: sample_rate as u32 == 192000,
                })
            }
            Variant::Qa40x => Ok(Settings::Qa40x {
                input: match config.full_scale_input_level_dbv {
                    Some(dbv) => FullScaleInput::from_dbv(dbv)?,
                    None => FullScaleInput::Dbv0,
                },
                output: match config.full_scale_output_level_dbv {
                    Some(dbv) => FullScaleOutput::from_dbv(dbv)?,
                    None => FullScaleOutput::DbvMinus12,
                },
                rate: Qa40xRate::from_hz(sample_rate)?,
            }),
        }
    }

    /// Quiesce values used after a stream ends: attenuator engaged, least
    /// sensitive input range, quietest output range.
    pub fn safe_defaults(variant: Variant, sample_rate: f64) -> Self {
        match variant {
            Variant::Qa401 => Settings::Qa401 {
                hpf: true,
                attenuator: true,
                high_rate: sample_rate as u32 == 192000,
            },
            Variant::Qa40x => Settings::Qa40x {
                input: FullScaleInput::Dbv42,
                output: FullScaleOutput::DbvMinus12,
                rate: Qa40xRate::from_hz(sample_rate).unwrap_or(Qa40xRate::Khz48),
            },
        }
    }
}

// QA401 register 5 control bits.
const QA401_HPF_BIT: u32 = 0x01;
const QA401_ATTENUATOR_BIT: u32 = 0x02;
const QA401_HIGH_RATE_BIT: u32 = 0x04;

// QA40x register map, per the vendor's bare-metal protocol description.
const QA40X_REG_INPUT_LEVEL: u8 = 5;
const QA40X_REG_OUTPUT_LEVEL: u8 = 6;
const QA40X_REG_STREAM: u8 = 8;
const QA40X_REG_SAMPLE_RATE: u8 = 9;
const QA40X_STREAM_GO: u32 = 5;
const QA40X_SETTLE: Duration = Duration::from_millis(50);

const QA401_BRINGUP_SETTLE: Duration = Duration::from_millis(10);

const REGISTER_WRITE_BYTES: usize = 5;
const REGISTER_SLOT: usize = 0;

/// One opened analyzer: the three bulk pipes plus the variant's constants.
pub struct Device {
    variant: Variant,
    profile: Profile,
    register: Box<dyn BulkPipe>,
    write: Box<dyn BulkPipe>,
    read: Box<dyn BulkPipe>,
    ping_in_flight: bool,
}

impl Device {
    pub fn new(
        variant: Variant,
        register: Box<dyn BulkPipe>,
        write: Box<dyn BulkPipe>,
        read: Box<dyn BulkPipe>,
    ) -> Self {
        Self { variant, profile: variant.profile(), register, write, read, ping_in_flight: false }
    }

    /// Open the single attached analyzer over rusb.
    pub fn open() -> Result<Self> {
        let (variant, pipes) = crate::usb::rusb::open_unique()?;
        info!("opened {:?}", variant);
        Ok(Self::new(
            variant,
            Box::new(pipes.register),
            Box::new(pipes.write),
            Box::new(pipes.read),
        ))
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Synchronous 5-byte register write: `[reg, b24, b16, b8, b0]`.
    pub fn write_register(&mut self, register: u8, value: u32) -> Result<()> {
        self.finish_ping()?;
        debug!("writing {value} to register #{register}");
        let bytes = value.to_be_bytes();
        let frame = vec![register, bytes[0], bytes[1], bytes[2], bytes[3]];
        self.register.start(REGISTER_SLOT, frame)?;
        match self.register.wait(REGISTER_SLOT)? {
            (_, Outcome::Completed { bytes }) if bytes == REGISTER_WRITE_BYTES => Ok(()),
            (_, Outcome::Completed { bytes }) => Err(Error::HwMalfunction(format!(
                "short register write: {bytes} of {REGISTER_WRITE_BYTES} bytes"
            ))),
            (_, Outcome::Aborted) => Err(Error::Aborted),
        }
    }

    /// Model-specific bring-up. Runs on the stream thread under elevated
    /// priority; the settle times between writes matter to the hardware.
    pub fn reset(&mut self, settings: &Settings) -> Result<()> {
        debug!("resetting {:?}", self.variant);
        match *settings {
            Settings::Qa401 { hpf, attenuator, high_rate } => {
                self.write_register(4, 1)?;
                std::thread::sleep(QA401_BRINGUP_SETTLE);
                self.write_register(4, 0)?;
                std::thread::sleep(QA401_BRINGUP_SETTLE);
                let mut control = 0;
                if hpf {
                    control |= QA401_HPF_BIT;
                }
                if attenuator {
                    control |= QA401_ATTENUATOR_BIT;
                }
                if high_rate {
                    control |= QA401_HIGH_RATE_BIT;
                }
                self.write_register(5, control)?;
                self.write_register(6, 4)?;
                std::thread::sleep(QA401_BRINGUP_SETTLE);
            }
            Settings::Qa40x { input, output, rate } => {
                self.write_register(QA40X_REG_STREAM, 0)?;
                self.write_register(QA40X_REG_INPUT_LEVEL, input.code())?;
                self.write_register(QA40X_REG_OUTPUT_LEVEL, output.code())?;
                self.write_register(QA40X_REG_SAMPLE_RATE, rate.code())?;
                std::thread::sleep(QA40X_SETTLE);
            }
        }
        debug!("{:?} is reset", self.variant);
        Ok(())
    }

    /// QA40x "go". The QA401 has no start register: writing register 4 has
    /// nasty side effects, and the hardware starts streaming on the first
    /// data write anyway.
    pub fn start(&mut self) -> Result<()> {
        match self.variant {
            Variant::Qa401 => Ok(()),
            Variant::Qa40x => self.write_register(QA40X_REG_STREAM, QA40X_STREAM_GO),
        }
    }

    /// QA401 keep-alive; keeps the front-panel link LED lit. Started here,
    /// completion collected by `finish_ping` on the next iteration.
    pub fn start_ping(&mut self) -> Result<()> {
        if !self.profile.needs_ping {
            return Ok(());
        }
        self.finish_ping()?;
        self.register.start(REGISTER_SLOT, vec![7, 0, 0, 0, 3])?;
        self.ping_in_flight = true;
        Ok(())
    }

    pub fn finish_ping(&mut self) -> Result<()> {
        if !self.ping_in_flight {
            return Ok(());
        }
        self.ping_in_flight = false;
        match self.register.wait(REGISTER_SLOT)? {
            (_, Outcome::Completed { bytes }) if bytes == REGISTER_WRITE_BYTES => Ok(()),
            (_, Outcome::Completed { bytes }) => {
                Err(Error::HwMalfunction(format!("short ping write: {bytes} bytes")))
            }
            (_, Outcome::Aborted) => Err(Error::Aborted),
        }
    }

    pub fn start_write(&mut self, slot: usize, buffer: Vec<u8>) -> Result<()> {
        self.write.start(slot, buffer)
    }

    pub fn wait_write(&mut self, slot: usize) -> Result<(Vec<u8>, Outcome)> {
        self.write.wait(slot)
    }

    pub fn write_pending(&self, slot: usize) -> bool {
        self.write.pending(slot)
    }

    pub fn start_read(&mut self, slot: usize, buffer: Vec<u8>) -> Result<()> {
        self.read.start(slot, buffer)
    }

    pub fn wait_read(&mut self, slot: usize) -> Result<(Vec<u8>, Outcome)> {
        self.read.wait(slot)
    }

    pub fn read_pending(&self, slot: usize) -> bool {
        self.read.pending(slot)
    }

    /// Cancel handles for both data pipes, callable from any thread while
    /// the stream thread is blocked in a wait.
    pub fn abort_handles(&self) -> (AbortHandle, AbortHandle) {
        (self.write.abort_handle(), self.read.abort_handle())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("variant", &self.variant)
            .field("ping_in_flight", &self.ping_in_flight)
            .finish()
    }
}
