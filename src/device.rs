use crate::attribute::{Attribute, AttributeError, AttributeHost, AttributeSet, ObjectKind};
use crate::channel::Channel;
use crate::cset::{ChannelSet, Direction, Interleave};
use crate::trigger::{RawIo, TriggerCatalog};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock, Weak};

/// What `raw_io` tells the trigger engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Transfer finished before returning.
    Done,
    /// Hardware finishes later through [`Completion`](crate::Completion).
    Pending,
}

/// The object an attribute callback is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrTarget {
    Device,
    Cset(usize),
    Channel { cset: usize, chan: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Unsupported value {value} for '{name}'")]
    Unsupported { name: String, value: u32 },

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hardware-specific half of a device.
///
/// `raw_io` runs with the channel set lock held: it must not call back into
/// the same channel set. Drivers that complete later return
/// [`IoStatus::Pending`] and use the cycle's completion from another thread.
pub trait DeviceOperations: Send + Sync {
    fn raw_io(&self, io: &mut RawIo<'_>) -> IoStatus;

    /// Read the live value of an attribute.
    fn info_get(&self, target: AttrTarget, attr: &Attribute) -> Result<u32, DriverError> {
        let _ = target;
        Ok(attr.value())
    }

    /// Program a new attribute value into the hardware.
    fn conf_set(&self, target: AttrTarget, attr: &Attribute, value: u32) -> Result<(), DriverError> {
        let _ = (target, attr, value);
        Ok(())
    }
}

pub(crate) struct DeviceAttrs(pub(crate) AttributeSet);

impl AttributeHost for DeviceAttrs {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Device
    }

    fn attributes(&self) -> &AttributeSet {
        &self.0
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.0
    }
}

/// Device data every channel set refers to.
pub(crate) struct DeviceShared {
    pub(crate) name: String,
    pub(crate) dev_id: u32,
    pub(crate) ops: Arc<dyn DeviceOperations>,
    /// Taken after a cset lock, never before one.
    pub(crate) attrs: Mutex<DeviceAttrs>,
    /// Trigger types a control may name.
    pub(crate) triggers: TriggerCatalog,
    /// Set once, right after the channel sets are built.
    pub(crate) csets: OnceLock<Vec<Weak<ChannelSet>>>,
}

impl DeviceShared {
    pub(crate) fn full_name(&self) -> String {
        format!("{}-{:04x}", self.name, self.dev_id)
    }
}

/// A registered device: its channel sets and device-wide attributes.
pub struct Device {
    shared: Arc<DeviceShared>,
    csets: Vec<Arc<ChannelSet>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.full_name())
            .field("csets", &self.csets)
            .finish()
    }
}

impl Device {
    pub(crate) fn new(shared: Arc<DeviceShared>, csets: Vec<Arc<ChannelSet>>) -> Self {
        Self { shared, csets }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Instance number among devices with the same name.
    pub fn dev_id(&self) -> u32 {
        self.shared.dev_id
    }

    /// `<name>-<dev_id>` in hex, as used in stream names.
    pub fn full_name(&self) -> String {
        self.shared.full_name()
    }

    pub fn csets(&self) -> &[Arc<ChannelSet>] {
        &self.csets
    }

    pub fn cset(&self, index: usize) -> Option<&Arc<ChannelSet>> {
        self.csets.get(index)
    }

    pub fn channel(&self, cset: usize, chan: usize) -> Option<Channel> {
        self.csets.get(cset)?.channel(chan)
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        self.shared.attrs.lock().0.iter().cloned().collect()
    }

    pub fn attribute(&self, name: &str) -> Result<u32, AttributeError> {
        let mut attrs = self.shared.attrs.lock();
        let attr = attrs
            .0
            .get(name)
            .cloned()
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))?;
        let value = self
            .shared
            .ops
            .info_get(AttrTarget::Device, &attr)
            .map_err(|source| AttributeError::Driver {
                name: name.to_string(),
                source,
            })?;
        attrs.commit_store(name, value);
        Ok(value)
    }

    /// Store a device attribute and mirror it into every channel control.
    pub fn set_attribute(&self, name: &str, value: u32) -> Result<(), AttributeError> {
        let stored = {
            let mut attrs = self.shared.attrs.lock();
            let attr = attrs.prepare_store(name, value)?;
            self.shared
                .ops
                .conf_set(AttrTarget::Device, &attr, value)
                .map_err(|source| AttributeError::Driver {
                    name: name.to_string(),
                    source,
                })?;
            attrs.commit_store(name, value)
        };
        if let Some(attr) = stored.filter(Attribute::is_control) {
            for cset in &self.csets {
                let mut inner = cset.inner.lock();
                cset.propagate_channel_attr(&mut inner, &attr, None);
            }
        }
        Ok(())
    }

    pub fn set_enabled(&self, enable: bool) {
        for cset in &self.csets {
            cset.set_enabled(enable);
        }
    }

    /// One line per channel set: name, direction, channel count and
    /// whether an interleaved channel exists.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for cset in &self.csets {
            let ileave = match cset.interleave() {
                Interleave::None => "",
                Interleave::Optional => "+i",
                Interleave::Only => "i",
            };
            let _ = writeln!(
                out,
                "{}-{}: {} {}{} ({} bytes/sample, trigger {}, buffer {})",
                self.full_name(),
                cset.index(),
                cset.direction(),
                cset.n_physical(),
                ileave,
                cset.ssize(),
                cset.trigger_name(),
                cset.buffer_name(),
            );
        }
        out
    }
}

/// Registration-time description of a channel set.
#[derive(Debug, Clone)]
pub struct CsetBuilder {
    pub(crate) name: Option<String>,
    pub(crate) direction: Direction,
    pub(crate) ssize: usize,
    pub(crate) n_chan: usize,
    pub(crate) interleave: Interleave,
    pub(crate) attrs: AttributeSet,
    pub(crate) chan_attrs: AttributeSet,
    pub(crate) trigger: Option<String>,
    pub(crate) buffer: Option<String>,
}

impl CsetBuilder {
    pub fn new(direction: Direction, n_chan: usize, ssize: usize) -> Self {
        Self {
            name: None,
            direction,
            ssize,
            n_chan,
            interleave: Interleave::None,
            attrs: AttributeSet::new(),
            chan_attrs: AttributeSet::new(),
            trigger: None,
            buffer: None,
        }
    }

    pub fn input(n_chan: usize, ssize: usize) -> Self {
        Self::new(Direction::Input, n_chan, ssize)
    }

    pub fn output(n_chan: usize, ssize: usize) -> Self {
        Self::new(Direction::Output, n_chan, ssize)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn interleave(mut self, interleave: Interleave) -> Self {
        self.interleave = interleave;
        self
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Attribute given to every channel of the set.
    pub fn channel_attribute(mut self, attr: Attribute) -> Self {
        self.chan_attrs.push(attr);
        self
    }

    /// Preferred trigger type, instead of the device's or the default one.
    pub fn trigger(mut self, name: impl Into<String>) -> Self {
        self.trigger = Some(name.into());
        self
    }

    pub fn buffer(mut self, name: impl Into<String>) -> Self {
        self.buffer = Some(name.into());
        self
    }
}

/// Registration-time description of a device.
pub struct DeviceBuilder {
    pub(crate) name: String,
    pub(crate) ops: Arc<dyn DeviceOperations>,
    pub(crate) attrs: AttributeSet,
    pub(crate) csets: Vec<CsetBuilder>,
    pub(crate) trigger: Option<String>,
    pub(crate) buffer: Option<String>,
}

impl DeviceBuilder {
    pub fn new(name: impl Into<String>, ops: impl DeviceOperations + 'static) -> Self {
        Self::with_ops(name, Arc::new(ops))
    }

    pub fn with_ops(name: impl Into<String>, ops: Arc<dyn DeviceOperations>) -> Self {
        Self {
            name: name.into(),
            ops,
            attrs: AttributeSet::new(),
            csets: Vec::new(),
            trigger: None,
            buffer: None,
        }
    }

    pub fn attribute(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn cset(mut self, cset: CsetBuilder) -> Self {
        self.csets.push(cset);
        self
    }

    pub fn trigger(mut self, name: impl Into<String>) -> Self {
        self.trigger = Some(name.into());
        self
    }

    pub fn buffer(mut self, name: impl Into<String>) -> Self {
        self.buffer = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{input_device, MockDriver};

    #[test]
    fn test_device_attribute_reaches_every_channel() {
        let (_reg, dev) = input_device(MockDriver::new(), 3, 4);
        dev.set_attribute("max-sample-rate", 250_000).unwrap();
        for chan in dev.cset(0).unwrap().channels() {
            assert_eq!(chan.current_control().attr_channel.std(3), Some(250_000));
        }
        assert_eq!(dev.attribute("max-sample-rate").unwrap(), 250_000);
    }

    #[test]
    fn test_driver_rejection_keeps_old_value() {
        let driver = MockDriver::new();
        let (_reg, dev) = input_device(driver.clone(), 1, 4);
        driver.reject_config(true);
        assert!(matches!(
            dev.set_attribute("max-sample-rate", 1),
            Err(AttributeError::Driver { .. })
        ));
        driver.reject_config(false);
        assert_eq!(dev.attribute("max-sample-rate").unwrap(), 1_000_000);
    }

    #[test]
    fn test_version_is_read_only() {
        let (_reg, dev) = input_device(MockDriver::new(), 1, 4);
        assert!(matches!(
            dev.set_attribute("version", 2),
            Err(AttributeError::ReadOnly(_))
        ));
        assert!(dev.attributes().iter().any(|a| a.name() == "version"));
    }

    #[test]
    fn test_describe_lists_csets() {
        let (_reg, dev) = input_device(MockDriver::new(), 2, 4);
        let text = dev.describe();
        assert!(text.starts_with("mock-0000-0: input 2 "));
        assert!(text.contains("trigger user"));
        assert!(text.contains("buffer heap"));
    }
}
