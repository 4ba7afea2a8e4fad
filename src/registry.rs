//! Registered trigger types, buffer types and devices, plus the minor
//! numbers that address their character streams.

use crate::attribute::{Attribute, AttributeError, AttributeSet};
use crate::buffer::{BufferType, ChannelInfo, HeapBuffer, HEAP_BUFFER};
use crate::channel::ChannelState;
use crate::chardev::{ChannelFile, IoError, OpenFlags, Stream};
use crate::cset::{ChannelSet, CsetParts, Interleave, Wakeups, MAX_CHANNELS, MAX_CSETS};
use crate::device::{Device, DeviceAttrs, DeviceBuilder, DeviceShared};
use crate::trigger::{
    trigger_template, TimerTrigger, TriggerCatalog, TriggerInstance, TriggerSnapshot, TriggerType,
    UserTrigger, USER_TRIGGER,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// Framework-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkConfig {
    /// Trigger type used when neither the cset nor the device asks for one.
    pub default_trigger: String,
    pub default_buffer: String,
    /// Initial `max-buffer-len` of every buffer instance.
    pub buffer_capacity: u32,
    /// Minor numbers available for character streams.
    pub minors: usize,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            default_trigger: USER_TRIGGER.to_string(),
            default_buffer: HEAP_BUFFER.to_string(),
            buffer_capacity: 16,
            minors: 256,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0} is already registered")]
    DuplicateName(String),

    #[error("Unknown trigger type '{0}'")]
    UnknownTrigger(String),

    #[error("Unknown buffer type '{0}'")]
    UnknownBuffer(String),

    #[error("Device declares no channel sets")]
    NoCsets,

    #[error("Too many channel sets: {0}")]
    TooManyCsets(usize),

    #[error("Channel set {cset} declares {count} channels")]
    BadChannelCount { cset: usize, count: usize },

    #[error("Not enough free minors for {0} streams")]
    NoMinors(usize),

    #[error("{0} is in use")]
    Busy(String),

    #[error("Device is not registered")]
    NotRegistered,

    #[error("No stream at minor {0}")]
    NoSuchMinor(usize),

    #[error("Attribute error: {0}")]
    Attribute(#[from] AttributeError),

    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

/// First-fit allocator of contiguous minor ranges.
#[derive(Debug)]
struct MinorAllocator {
    used: Vec<bool>,
}

impl MinorAllocator {
    fn new(count: usize) -> Self {
        Self {
            used: vec![false; count],
        }
    }

    fn alloc(&mut self, count: usize) -> Option<usize> {
        if count == 0 || count > self.used.len() {
            return None;
        }
        let base = (0..=self.used.len() - count)
            .find(|base| self.used[*base..*base + count].iter().all(|u| !u))?;
        self.used[base..base + count].fill(true);
        Some(base)
    }

    fn free(&mut self, base: usize, count: usize) {
        if let Some(range) = self.used.get_mut(base..base + count) {
            range.fill(false);
        }
    }
}

struct RegistryInner {
    buffers: Vec<Arc<dyn BufferType>>,
    devices: Vec<Arc<Device>>,
    minors: MinorAllocator,
}

/// Everything needed to build one channel set, resolved before any side
/// effect of registration.
struct CsetPlan {
    name: String,
    builder_index: usize,
    attrs: AttributeSet,
    chan_attrs: AttributeSet,
    trigger: Arc<dyn TriggerType>,
    trigger_attrs: AttributeSet,
    buffer: Arc<dyn BufferType>,
    n_total: usize,
}

/// The framework: trigger and buffer types, devices and their streams.
///
/// ```
/// use zio_rs::Registry;
///
/// let reg = Registry::default();
/// assert!(reg.trigger_type("user").is_some());
/// assert!(reg.trigger_type("timer").is_some());
/// assert!(reg.buffer_type("heap").is_some());
/// assert!(reg.devices().is_empty());
/// ```
pub struct Registry {
    config: FrameworkConfig,
    triggers: TriggerCatalog,
    inner: Mutex<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(FrameworkConfig::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("devices", &self.inner.lock().devices)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// A registry holding the `user` and `timer` triggers and the `heap`
    /// buffer.
    pub fn new(config: FrameworkConfig) -> Self {
        let minors = MinorAllocator::new(config.minors);
        Self {
            config,
            triggers: TriggerCatalog::new(vec![Arc::new(UserTrigger), Arc::new(TimerTrigger)]),
            inner: Mutex::new(RegistryInner {
                buffers: vec![Arc::new(HeapBuffer)],
                devices: Vec::new(),
                minors,
            }),
        }
    }

    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    pub fn register_trigger(&self, ttype: Arc<dyn TriggerType>) -> Result<(), RegistryError> {
        let name = ttype.name().to_string();
        if !self.triggers.insert(ttype) {
            return Err(RegistryError::DuplicateName(format!("trigger {name}")));
        }
        log::debug!("registered trigger type {name}");
        Ok(())
    }

    pub fn register_buffer(&self, btype: Arc<dyn BufferType>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.buffers.iter().any(|b| b.name() == btype.name()) {
            return Err(RegistryError::DuplicateName(format!("buffer {}", btype.name())));
        }
        log::debug!("registered buffer type {}", btype.name());
        inner.buffers.push(btype);
        Ok(())
    }

    /// Fails with [`RegistryError::Busy`] while a channel set uses it.
    pub fn unregister_trigger(&self, name: &str) -> Result<(), RegistryError> {
        let inner = self.inner.lock();
        // Taken out first: a control naming it can no longer pick it up
        // while the sets are checked.
        let ttype = self
            .triggers
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownTrigger(name.to_string()))?;
        let in_use = all_csets(&inner.devices).any(|cset| cset.trigger_name() == name);
        if in_use {
            let _ = self.triggers.insert(ttype);
            return Err(RegistryError::Busy(format!("trigger {name}")));
        }
        Ok(())
    }

    pub fn unregister_buffer(&self, name: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let pos = inner
            .buffers
            .iter()
            .position(|b| b.name() == name)
            .ok_or_else(|| RegistryError::UnknownBuffer(name.to_string()))?;
        let in_use = all_csets(&inner.devices).any(|cset| cset.buffer_name() == name);
        if in_use {
            return Err(RegistryError::Busy(format!("buffer {name}")));
        }
        inner.buffers.remove(pos);
        Ok(())
    }

    pub fn trigger_type(&self, name: &str) -> Option<Arc<dyn TriggerType>> {
        self.triggers.find(name)
    }

    pub fn buffer_type(&self, name: &str) -> Option<Arc<dyn BufferType>> {
        self.inner
            .lock()
            .buffers
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.inner.lock().devices.clone()
    }

    /// Bind a device to the framework.
    ///
    /// Resolves trigger and buffer types (cset preference, then device
    /// preference, then the framework default), numbers extended
    /// attributes along the device, cset, channel chain, allocates two
    /// minors per channel and initialises every channel's control.
    pub fn register_device(&self, builder: DeviceBuilder) -> Result<Arc<Device>, RegistryError> {
        if builder.csets.is_empty() {
            return Err(RegistryError::NoCsets);
        }
        if builder.csets.len() > MAX_CSETS {
            return Err(RegistryError::TooManyCsets(builder.csets.len()));
        }
        let mut inner = self.inner.lock();

        let dev_id = (0..)
            .find(|id| {
                !inner
                    .devices
                    .iter()
                    .any(|d| d.name() == builder.name && d.dev_id() == *id)
            })
            .unwrap_or_default();

        let mut dev_attrs = builder.attrs.clone();
        dev_attrs.push(Attribute::version(1));
        let dev_next = dev_attrs.number_extended(0)?;

        let shared = Arc::new(DeviceShared {
            name: builder.name.clone(),
            dev_id,
            ops: builder.ops.clone(),
            attrs: Mutex::new(DeviceAttrs(dev_attrs)),
            triggers: self.triggers.clone(),
            csets: OnceLock::new(),
        });
        let full_name = shared.full_name();

        let mut plans = Vec::with_capacity(builder.csets.len());
        for (index, cb) in builder.csets.iter().enumerate() {
            if cb.n_chan == 0 || cb.n_chan > MAX_CHANNELS {
                return Err(RegistryError::BadChannelCount {
                    cset: index,
                    count: cb.n_chan,
                });
            }
            let trigger_name = cb
                .trigger
                .as_deref()
                .or(builder.trigger.as_deref())
                .unwrap_or(&self.config.default_trigger);
            let trigger = self
                .triggers
                .find(trigger_name)
                .ok_or_else(|| RegistryError::UnknownTrigger(trigger_name.to_string()))?;
            let buffer_name = cb
                .buffer
                .as_deref()
                .or(builder.buffer.as_deref())
                .unwrap_or(&self.config.default_buffer);
            let buffer = find_named(&inner.buffers, buffer_name, |b| b.name())
                .ok_or_else(|| RegistryError::UnknownBuffer(buffer_name.to_string()))?;

            let mut attrs = cb.attrs.clone();
            attrs.push(Attribute::version(1));
            let cset_next = attrs.number_extended(dev_next)?;
            let mut chan_attrs = cb.chan_attrs.clone();
            chan_attrs.push(Attribute::version(1));
            chan_attrs.number_extended(cset_next)?;

            let trigger_attrs = trigger_template(&*trigger)?;

            plans.push(CsetPlan {
                name: cb.name.clone().unwrap_or_else(|| format!("{full_name}-{index}")),
                builder_index: index,
                attrs,
                chan_attrs,
                trigger,
                trigger_attrs,
                buffer,
                n_total: cb.n_chan + usize::from(cb.interleave != Interleave::None),
            });
        }

        let mut bases = Vec::with_capacity(plans.len());
        for plan in &plans {
            match inner.minors.alloc(2 * plan.n_total) {
                Some(base) => bases.push(base),
                None => {
                    for (base, plan) in bases.iter().zip(&plans) {
                        inner.minors.free(*base, 2 * plan.n_total);
                    }
                    return Err(RegistryError::NoMinors(2 * plan.n_total));
                }
            }
        }

        let csets = plans
            .into_iter()
            .zip(bases)
            .map(|(plan, minor_base)| {
                let cb = &builder.csets[plan.builder_index];
                let index = plan.builder_index;
                let channels = (0..plan.n_total)
                    .map(|chan| {
                        let info = ChannelInfo {
                            direction: cb.direction,
                            cset: index,
                            chan,
                            ssize: cb.ssize,
                            capacity: self.config.buffer_capacity,
                        };
                        ChannelState::new(
                            chan,
                            chan == cb.n_chan,
                            plan.chan_attrs.clone(),
                            plan.buffer.create(&info),
                        )
                    })
                    .collect();
                let parts = CsetParts {
                    index,
                    name: plan.name,
                    direction: cb.direction,
                    ssize: cb.ssize,
                    interleave: cb.interleave,
                    n_physical: cb.n_chan,
                    minor_base,
                    device: shared.clone(),
                    attrs: plan.attrs,
                    buffer_type: plan.buffer,
                    channels,
                };
                let (ttype, tattrs) = (plan.trigger, plan.trigger_attrs);
                ChannelSet::new(parts, move |weak| {
                    let ops = ttype.create(weak, &tattrs);
                    TriggerInstance::new(ttype.name(), tattrs, ops)
                })
            })
            .collect::<Vec<_>>();

        let _ = shared.csets.set(csets.iter().map(Arc::downgrade).collect());
        let device = Arc::new(Device::new(shared, csets));
        log::info!(
            "registered {} with {} channel sets",
            device.full_name(),
            device.csets().len()
        );
        inner.devices.push(device.clone());
        Ok(device)
    }

    /// Stop and drain every channel set of `device` and release its minors.
    pub fn unregister_device(&self, device: &Arc<Device>) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let pos = inner
            .devices
            .iter()
            .position(|d| Arc::ptr_eq(d, device))
            .ok_or(RegistryError::NotRegistered)?;
        if device.csets().iter().any(|cset| cset.open_files() > 0) {
            return Err(RegistryError::Busy(device.full_name()));
        }
        for cset in device.csets() {
            cset.teardown();
            inner.minors.free(cset.minor_base(), cset.minor_count());
        }
        inner.devices.remove(pos);
        log::info!("unregistered {}", device.full_name());
        Ok(())
    }

    /// Replace the trigger of `cset`. The new instance starts from its
    /// type's default attributes and keeps the old enabled state.
    pub fn change_trigger(&self, cset: &ChannelSet, name: &str) -> Result<(), RegistryError> {
        let ttype = self
            .trigger_type(name)
            .ok_or_else(|| RegistryError::UnknownTrigger(name.to_string()))?;
        let attrs = trigger_template(&*ttype)?;

        let mut w = Wakeups::default();
        {
            let mut inner = cset.inner.lock();
            let snapshot = cset.abort_locked(&mut inner, true, &mut w);
            cset.install_trigger_locked(&mut inner, &ttype, attrs, &mut w);
            let restore = TriggerSnapshot {
                armed: false,
                ..snapshot
            };
            cset.restore_locked(&mut inner, restore, &mut w);
        }
        cset.wake_all();
        Ok(())
    }

    /// Replace the buffer type of `cset`, draining the old instances.
    pub fn change_buffer(&self, cset: &ChannelSet, name: &str) -> Result<(), RegistryError> {
        let btype = self
            .buffer_type(name)
            .ok_or_else(|| RegistryError::UnknownBuffer(name.to_string()))?;
        if cset.open_files() > 0 {
            return Err(RegistryError::Busy(cset.name().to_string()));
        }

        let mut w = Wakeups::default();
        {
            let mut inner = cset.inner.lock();
            let snapshot = cset.abort_locked(&mut inner, true, &mut w);
            for ch in &mut inner.channels {
                ch.drain(&mut w);
                let info = ChannelInfo {
                    direction: cset.direction(),
                    cset: cset.index(),
                    chan: ch.index,
                    ssize: cset.ssize(),
                    capacity: self.config.buffer_capacity,
                };
                ch.bi = btype.create(&info);
            }
            inner.buffer_type = btype;
            cset.restore_locked(&mut inner, snapshot, &mut w);
        }
        cset.wake(w);
        log::debug!("{}: buffer changed to {name}", cset.name());
        Ok(())
    }

    /// Open a stream by minor number: even minors are control streams,
    /// odd ones data streams.
    pub fn open_minor(&self, minor: usize, flags: OpenFlags) -> Result<ChannelFile, RegistryError> {
        let cset = {
            let inner = self.inner.lock();
            let found = all_csets(&inner.devices)
                .find(|cset| (cset.minor_base()..cset.minor_base() + cset.minor_count()).contains(&minor))
                .cloned()
                .ok_or(RegistryError::NoSuchMinor(minor))?;
            found
        };
        let offset = minor - cset.minor_base();
        let stream = if offset % 2 == 0 {
            Stream::Control
        } else {
            Stream::Data
        };
        Ok(ChannelFile::open(cset, offset / 2, stream, flags)?)
    }

    /// Every stream with its minor, in minor order.
    pub fn node_names(&self) -> Vec<(usize, String)> {
        let inner = self.inner.lock();
        let mut names: Vec<_> = all_csets(&inner.devices)
            .flat_map(|cset| {
                (0..cset.n_channels()).flat_map(move |chan| {
                    let base = cset.minor_base() + 2 * chan;
                    [
                        (base, cset.node_name(chan, true)),
                        (base + 1, cset.node_name(chan, false)),
                    ]
                })
            })
            .collect();
        names.sort_by_key(|(minor, _)| *minor);
        names
    }
}

fn all_csets(devices: &[Arc<Device>]) -> impl Iterator<Item = &Arc<ChannelSet>> {
    devices.iter().flat_map(|d| d.csets().iter())
}

fn find_named<T: ?Sized>(list: &[Arc<T>], name: &str, name_of: impl Fn(&T) -> &str) -> Option<Arc<T>> {
    list.iter().find(|item| name_of(&***item) == name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CsetBuilder;
    use crate::test_support::{input_device, MockDriver};
    use crate::trigger::TIMER_TRIGGER;

    fn two_set_builder(driver: MockDriver) -> DeviceBuilder {
        DeviceBuilder::new("adc", driver)
            .cset(CsetBuilder::input(4, 2))
            .cset(CsetBuilder::output(2, 4).interleave(Interleave::Optional))
    }

    #[test]
    fn test_minor_allocation_and_names() {
        let reg = Registry::default();
        let dev = reg.register_device(two_set_builder(MockDriver::new())).unwrap();
        assert_eq!(dev.cset(0).unwrap().minor_base(), 0);
        assert_eq!(dev.cset(1).unwrap().minor_base(), 8);

        let names = reg.node_names();
        assert_eq!(names.len(), 8 + 6);
        assert_eq!(names[0], (0, "adc-0000-0-0-ctrl".to_string()));
        assert_eq!(names[1], (1, "adc-0000-0-0-data".to_string()));
        assert_eq!(names[13], (13, "adc-0000-1-i-data".to_string()));

        let second = reg.register_device(two_set_builder(MockDriver::new())).unwrap();
        assert_eq!(second.dev_id(), 1);
        assert_eq!(second.cset(0).unwrap().minor_base(), 14);

        reg.unregister_device(&dev).unwrap();
        let third = reg.register_device(two_set_builder(MockDriver::new())).unwrap();
        assert_eq!(third.dev_id(), 0);
        assert_eq!(third.cset(0).unwrap().minor_base(), 0);
    }

    #[test]
    fn test_open_minor_picks_stream() {
        let reg = Registry::default();
        let _dev = reg.register_device(two_set_builder(MockDriver::new())).unwrap();
        let f = reg.open_minor(3, OpenFlags::default()).unwrap();
        assert_eq!(f.channel(), 1);
        assert_eq!(f.stream(), Stream::Data);
        let f = reg.open_minor(12, OpenFlags::default()).unwrap();
        assert_eq!(f.channel(), 2);
        assert_eq!(f.stream(), Stream::Control);
        assert!(matches!(
            reg.open_minor(200, OpenFlags::default()),
            Err(RegistryError::NoSuchMinor(200))
        ));
    }

    #[test]
    fn test_registration_limits() {
        let reg = Registry::new(FrameworkConfig {
            minors: 10,
            ..Default::default()
        });
        assert!(matches!(
            reg.register_device(DeviceBuilder::new("empty", MockDriver::new())),
            Err(RegistryError::NoCsets)
        ));

        let too_wide = DeviceBuilder::new("wide", MockDriver::new()).cset(CsetBuilder::input(17, 2));
        assert!(matches!(
            reg.register_device(too_wide),
            Err(RegistryError::BadChannelCount { count: 17, .. })
        ));

        let unknown = DeviceBuilder::new("odd", MockDriver::new())
            .cset(CsetBuilder::input(1, 2).trigger("missing"));
        assert!(matches!(
            reg.register_device(unknown),
            Err(RegistryError::UnknownTrigger(_))
        ));

        // 8 + 6 minors do not fit in 10; nothing stays allocated.
        assert!(matches!(
            reg.register_device(two_set_builder(MockDriver::new())),
            Err(RegistryError::NoMinors(6))
        ));
        let small = DeviceBuilder::new("small", MockDriver::new()).cset(CsetBuilder::input(5, 2));
        assert_eq!(reg.register_device(small).unwrap().cset(0).unwrap().minor_base(), 0);
    }

    #[test]
    fn test_extended_attributes_numbered_along_chain() {
        let reg = Registry::default();
        let builder = DeviceBuilder::new("ext", MockDriver::new())
            .attribute(Attribute::extended("dev-ext", 1))
            .cset(
                CsetBuilder::input(1, 2)
                    .attribute(Attribute::extended("cset-ext", 2))
                    .channel_attribute(Attribute::extended("chan-ext", 3)),
            );
        let dev = reg.register_device(builder).unwrap();
        let ctrl = dev.channel(0, 0).unwrap().current_control();
        assert_eq!(ctrl.attr_channel.ext(0), Some(1));
        assert_eq!(ctrl.attr_channel.ext(1), Some(2));
        assert_eq!(ctrl.attr_channel.ext(2), Some(3));
        assert_eq!(ctrl.addr.devname(), "ext");
    }

    #[test]
    fn test_unregister_busy_while_open() {
        let (reg, dev) = input_device(MockDriver::new(), 1, 4);
        let chan = dev.channel(0, 0).unwrap();
        let file = chan.open(Stream::Data, OpenFlags::default()).unwrap();
        assert!(matches!(reg.unregister_device(&dev), Err(RegistryError::Busy(_))));
        assert!(matches!(
            reg.change_buffer(dev.cset(0).unwrap(), HEAP_BUFFER),
            Err(RegistryError::Busy(_))
        ));
        drop(file);

        let cset = dev.cset(0).unwrap().clone();
        reg.unregister_device(&dev).unwrap();
        assert!(reg.devices().is_empty());
        assert!(matches!(
            chan.open(Stream::Data, OpenFlags::default()),
            Err(IoError::NoDevice)
        ));
        assert_eq!(cset.trigger_state(), crate::TriggerState::Disabled);
    }

    #[test]
    fn test_change_trigger_keeps_disabled_state() {
        let (reg, dev) = input_device(MockDriver::new(), 2, 4);
        let cset = dev.cset(0).unwrap();
        cset.set_trigger_enabled(false);
        reg.change_trigger(cset, TIMER_TRIGGER).unwrap();
        assert_eq!(cset.trigger_name(), TIMER_TRIGGER);
        assert_eq!(cset.trigger_state(), crate::TriggerState::Disabled);
        assert!(cset.trigger_attribute("ms-period").is_ok());
        assert!(matches!(
            reg.unregister_trigger(TIMER_TRIGGER),
            Err(RegistryError::Busy(_))
        ));
        reg.unregister_device(&dev).unwrap();
        reg.unregister_trigger(TIMER_TRIGGER).unwrap();
        assert!(reg.trigger_type(TIMER_TRIGGER).is_none());
    }

    #[test]
    fn test_change_buffer_drains_old_blocks() {
        let (reg, dev) = input_device(MockDriver::new(), 1, 4);
        let cset = dev.cset(0).unwrap();
        cset.arm();
        let chan = dev.channel(0, 0).unwrap();
        assert_eq!(chan.queued_blocks(), 1);
        reg.change_buffer(cset, HEAP_BUFFER).unwrap();
        assert_eq!(chan.queued_blocks(), 0);
        assert_eq!(chan.blocks_in_flight(), 0);
        assert_eq!(cset.trigger_state(), crate::TriggerState::Idle);
    }

    #[test]
    fn test_duplicate_type_names() {
        let reg = Registry::default();
        assert!(matches!(
            reg.register_buffer(Arc::new(HeapBuffer)),
            Err(RegistryError::DuplicateName(_))
        ));
        assert!(matches!(
            reg.register_trigger(Arc::new(UserTrigger)),
            Err(RegistryError::DuplicateName(_))
        ));
    }
}
