//! # zio-rs
//!
//! A driver framework for data-acquisition hardware: ADCs, DACs, digital
//! I/O, time-to-digital converters.
//!
//! A driver describes its device as a hierarchy of channel sets and
//! channels and implements one hook, [`DeviceOperations::raw_io`]. The
//! framework does the rest: triggers decide when an acquisition cycle
//! starts, buffers queue blocks of samples between the hardware and the
//! user, and every channel exposes a control stream and a data stream.
//!
//! ## Features
//!
//! - **Trigger engine**: a per-set state machine (disabled, idle, armed)
//!   with synchronous or asynchronous completion and safe aborts
//! - **Block buffers**: bounded FIFO queues of blocks, pluggable by name
//! - **Channel streams**: fixed 512-byte [`Control`] records plus raw data,
//!   with blocking, non-blocking, timed and interruptible waits
//! - **Attributes**: named device, set, channel, trigger and buffer
//!   settings, mirrored into every control and reconfigurable by writing
//!   a control
//! - **DataFrame output** (feature `dataframe`): decode a block with `polars`
//!
//! ## Example
//!
//! ```rust
//! use zio_rs::{
//!     CsetBuilder, DeviceBuilder, DeviceOperations, IoStatus, OpenFlags, RawIo, Registry, Stream,
//! };
//!
//! /// Fills every block with a ramp.
//! struct Ramp;
//!
//! impl DeviceOperations for Ramp {
//!     fn raw_io(&self, io: &mut RawIo<'_>) -> IoStatus {
//!         for (_, block) in io.blocks() {
//!             for (i, byte) in block.data_mut().iter_mut().enumerate() {
//!                 *byte = i as u8;
//!             }
//!         }
//!         IoStatus::Done
//!     }
//! }
//!
//! let reg = Registry::default();
//! let dev = reg.register_device(DeviceBuilder::new("ramp", Ramp).cset(CsetBuilder::input(2, 1)))?;
//! let chan = dev.channel(0, 1).ok_or("no such channel")?;
//! let mut ctrl = chan.open(Stream::Control, OpenFlags::default())?;
//! let mut data = chan.open(Stream::Data, OpenFlags::default())?;
//!
//! // The default trigger arms when a reader finds nothing queued.
//! let control = ctrl.read_control()?;
//! assert_eq!(control.seq_num, 1);
//! assert_eq!(control.nsamples, 16);
//!
//! let mut samples = vec![0; control.datalen()];
//! let n = data.read(&mut samples)?;
//! assert_eq!(n, 16);
//! assert_eq!(samples[3], 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Reconfiguring through a control
//!
//! ```rust
//! use zio_rs::{CsetBuilder, DeviceBuilder, DeviceOperations, IoStatus, RawIo, Registry, TriggerAttr};
//!
//! struct Idle;
//!
//! impl DeviceOperations for Idle {
//!     fn raw_io(&self, _io: &mut RawIo<'_>) -> IoStatus {
//!         IoStatus::Done
//!     }
//! }
//!
//! let reg = Registry::default();
//! let dev = reg.register_device(DeviceBuilder::new("idle", Idle).cset(CsetBuilder::input(1, 2)))?;
//! let cset = dev.cset(0).ok_or("no such set")?;
//! let chan = dev.channel(0, 0).ok_or("no such channel")?;
//!
//! let mut request = chan.current_control();
//! request.attr_trigger.set_std(TriggerAttr::PostSamples.index(), 100);
//! request.nsamples = 100;
//! cset.configure(0, &request)?;
//! assert_eq!(cset.nsamples(), 100);
//! assert_eq!(cset.trigger_attribute("post-samples")?, 100);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod attribute;
pub mod block;
pub mod buffer;
pub mod channel;
pub mod chardev;
pub mod config;
pub mod control;
pub mod cset;
pub mod device;
pub mod reading;
pub mod registry;
pub mod trigger;

#[cfg(test)]
mod test_support;

// Re-export the main types for convenience
pub use attribute::{
    AttrKind, AttrMode, Attribute, AttributeError, AttributeHost, AttributeSet, BufferAttr,
    DeviceAttr, ObjectKind, TriggerAttr, VERSION_ATTR,
};

pub use block::{Block, BlockSlot};

pub use buffer::{
    BufferInstance, BufferType, ChannelInfo, HeapBuffer, HeapInstance, NoSpace, PushAccepted,
    PushTarget, Stored, Wakeup, HEAP_BUFFER,
};

pub use channel::Channel;

pub use chardev::{ChannelFile, Interrupter, IoError, OpenFlags, PollFlags, Stream};

pub use config::ConfigError;

pub use control::{Address, Alarms, Control, ControlError, CtrlAttr, Timestamp, CONTROL_SIZE};

pub use cset::{ChannelSet, Direction, Interleave};

pub use device::{
    AttrTarget, CsetBuilder, Device, DeviceBuilder, DeviceOperations, DriverError, IoStatus,
};

pub use reading::BlockReading;

pub use registry::{FrameworkConfig, Registry, RegistryError};

pub use trigger::{
    Completion, RawIo, TimerTrigger, TriggerOperations, TriggerSnapshot, TriggerState,
    TriggerType, UserTrigger, TIMER_PERIOD_ATTR, TIMER_TRIGGER, USER_TRIGGER,
};
