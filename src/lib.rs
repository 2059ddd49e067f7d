pub mod buffer;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod host;
pub mod rate;
pub mod rt;
pub mod session;
pub mod usb;
mod worker;

pub use buffer::{Binding, HostBuffers};
pub use config::Config;
pub use device::{Device, FullScaleInput, FullScaleOutput, Profile, Settings, Variant};
pub use error::{Error, Result};
pub use host::{HostCallbacks, HostMessage, OutputReadySignal, Selector, StreamTime};
pub use session::{BufferSizeHints, ChannelInfo, Session};
pub use usb::{BulkPipe, Outcome};
pub use worker::StreamState;
