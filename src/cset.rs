use crate::attribute::{
    AttrKind, Attribute, AttributeError, AttributeHost, AttributeSet, DeviceAttr, ObjectKind,
    TriggerAttr,
};
use crate::buffer::{BufferType, Wakeup};
use crate::channel::{Channel, ChannelState};
use crate::control::Control;
use crate::device::{AttrTarget, DeviceShared};
use crate::trigger::{TriggerInstance, TriggerState};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Most channel sets a device may declare.
pub const MAX_CSETS: usize = 16;
/// Most channels a channel set may declare, not counting the interleaved one.
pub const MAX_CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        self == Direction::Input
    }

    pub fn is_output(self) -> bool {
        self == Direction::Output
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("input"),
            Direction::Output => f.write_str("output"),
        }
    }
}

/// Whether a channel set exposes an interleaved pseudo-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interleave {
    #[default]
    None,
    /// The interleaved channel exists next to the normal ones.
    Optional,
    /// Only the interleaved channel may be used.
    Only,
}

/// Per-channel wake-up mask collected under the lock.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Wakeups(u32);

impl Wakeups {
    pub(crate) fn add(&mut self, chan: usize, wake: Wakeup) {
        if wake.is_needed() {
            self.0 |= 1 << chan;
        }
    }

    pub(crate) fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn contains(self, chan: usize) -> bool {
        self.0 & (1 << chan) != 0
    }

    fn iter(self) -> impl Iterator<Item = usize> {
        (0..32).filter(move |chan| self.contains(*chan))
    }
}

/// State guarded by the channel set lock.
pub(crate) struct CsetInner {
    pub(crate) enabled: bool,
    pub(crate) attrs: AttributeSet,
    pub(crate) trigger: TriggerInstance,
    pub(crate) buffer_type: Arc<dyn BufferType>,
    pub(crate) channels: Vec<ChannelState>,
}

impl AttributeHost for CsetInner {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Cset
    }

    fn attributes(&self) -> &AttributeSet {
        &self.attrs
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.attrs
    }
}

/// Everything registration computed for a channel set.
pub(crate) struct CsetParts {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) direction: Direction,
    pub(crate) ssize: usize,
    pub(crate) interleave: Interleave,
    pub(crate) n_physical: usize,
    pub(crate) minor_base: usize,
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) attrs: AttributeSet,
    pub(crate) buffer_type: Arc<dyn BufferType>,
    pub(crate) channels: Vec<ChannelState>,
}

/// A group of channels that share a direction, a sample size, one trigger
/// and one buffer type.
///
/// One mutex guards trigger transitions, buffer queues and
/// reconfiguration for the whole set. Each channel has its own condition
/// variable on that mutex.
pub struct ChannelSet {
    index: usize,
    name: String,
    direction: Direction,
    ssize: usize,
    interleave: Interleave,
    n_physical: usize,
    minor_base: usize,
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) self_ref: Weak<ChannelSet>,
    pub(crate) inner: Mutex<CsetInner>,
    waiters: Vec<Condvar>,
    open_files: AtomicUsize,
    dying: AtomicBool,
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSet")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("ssize", &self.ssize)
            .field("interleave", &self.interleave)
            .finish_non_exhaustive()
    }
}

impl ChannelSet {
    /// Build the set around its trigger, which may keep a weak reference
    /// back to it.
    pub(crate) fn new(
        parts: CsetParts,
        make_trigger: impl FnOnce(Weak<ChannelSet>) -> TriggerInstance,
    ) -> Arc<Self> {
        let n_chan = parts.channels.len();
        let cset = Arc::new_cyclic(|weak: &Weak<ChannelSet>| Self {
            index: parts.index,
            name: parts.name,
            direction: parts.direction,
            ssize: parts.ssize,
            interleave: parts.interleave,
            n_physical: parts.n_physical,
            minor_base: parts.minor_base,
            device: parts.device,
            self_ref: weak.clone(),
            inner: Mutex::new(CsetInner {
                enabled: true,
                attrs: parts.attrs,
                trigger: make_trigger(weak.clone()),
                buffer_type: parts.buffer_type,
                channels: parts.channels,
            }),
            waiters: (0..n_chan).map(|_| Condvar::new()).collect(),
            open_files: AtomicUsize::new(0),
            dying: AtomicBool::new(false),
        });

        {
            let mut inner = cset.inner.lock();
            if cset.interleave_index().is_some() {
                let only = cset.interleave == Interleave::Only;
                for ch in &mut inner.channels {
                    ch.enabled = if ch.interleave { only } else { !only };
                }
            }
            cset.update_nsamples(&mut inner);
            cset.init_controls(&mut inner);
        }
        cset
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Bytes per sample.
    pub fn ssize(&self) -> usize {
        self.ssize
    }

    pub fn interleave(&self) -> Interleave {
        self.interleave
    }

    /// Channels including the interleaved one.
    pub fn n_channels(&self) -> usize {
        self.waiters.len()
    }

    /// Channels excluding the interleaved one.
    pub fn n_physical(&self) -> usize {
        self.n_physical
    }

    pub fn interleave_index(&self) -> Option<usize> {
        (self.interleave != Interleave::None).then_some(self.n_physical)
    }

    pub fn device_name(&self) -> String {
        self.device.full_name()
    }

    pub fn channel(&self, index: usize) -> Option<Channel> {
        let cset = self.self_ref.upgrade()?;
        (index < self.n_channels()).then(|| Channel::new(cset, index))
    }

    pub fn channels(&self) -> Vec<Channel> {
        (0..self.n_channels())
            .filter_map(|i| self.channel(i))
            .collect()
    }

    pub fn minor_base(&self) -> usize {
        self.minor_base
    }

    pub fn minor_count(&self) -> usize {
        2 * self.n_channels()
    }

    /// Stream name of channel `chan`, e.g. `adc-0000-0-3-ctrl`.
    pub fn node_name(&self, chan: usize, control: bool) -> String {
        let chan_name = if Some(chan) == self.interleave_index() {
            "i".to_string()
        } else {
            chan.to_string()
        };
        let stream = if control { "ctrl" } else { "data" };
        format!("{}-{}-{}-{}", self.device.full_name(), self.index, chan_name, stream)
    }

    pub fn trigger_state(&self) -> TriggerState {
        self.inner.lock().trigger.state()
    }

    pub fn trigger_name(&self) -> String {
        self.inner.lock().trigger.type_name().to_string()
    }

    pub fn buffer_name(&self) -> String {
        self.inner.lock().buffer_type.name().to_string()
    }

    /// Samples per block, as the trigger currently computes it.
    pub fn nsamples(&self) -> u32 {
        self.inner.lock().trigger.nsamples()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Enable or disable the set: its trigger follows, channels keep their
    /// own state.
    pub fn set_enabled(&self, enable: bool) {
        self.inner.lock().enabled = enable;
        self.set_trigger_enabled(enable);
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    pub(crate) fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn file_closed(&self) {
        self.open_files.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    pub(crate) fn waiter(&self, chan: usize) -> Option<&Condvar> {
        self.waiters.get(chan)
    }

    /// Deliver wake-ups. Call without holding the lock.
    pub(crate) fn wake(&self, wakeups: Wakeups) {
        for chan in wakeups.iter() {
            if let Some(waiter) = self.waiters.get(chan) {
                waiter.notify_all();
            }
        }
    }

    pub(crate) fn wake_all(&self) {
        for waiter in &self.waiters {
            waiter.notify_all();
        }
    }

    /// Stop the trigger and drain every channel. The set is unusable after.
    pub(crate) fn teardown(&self) {
        self.dying.store(true, Ordering::Release);
        let mut w = Wakeups::default();
        {
            let mut inner = self.inner.lock();
            let _ = self.abort_locked(&mut inner, true, &mut w);
            inner.trigger.destroy();
            for ch in &mut inner.channels {
                ch.drain(&mut w);
            }
        }
        self.wake_all();
        log::debug!("{}: channel set {} torn down", self.device.full_name(), self.index);
    }

    pub(crate) fn interleave_active(&self, inner: &CsetInner) -> bool {
        self.interleave_index()
            .and_then(|i| inner.channels.get(i))
            .is_some_and(|ch| ch.enabled)
    }

    /// Pre plus post samples, times the physical channel count while the
    /// interleaved channel is in use.
    pub(crate) fn update_nsamples(&self, inner: &mut CsetInner) {
        let attrs = inner.trigger.attributes();
        let pre = attrs
            .standard(TriggerAttr::PreSamples.index())
            .map_or(0, Attribute::value);
        let post = attrs
            .standard(TriggerAttr::PostSamples.index())
            .map_or(0, Attribute::value);
        let mut nsamples = pre.saturating_add(post);
        if self.interleave_active(inner) {
            nsamples = nsamples.saturating_mul(self.n_physical as u32);
        }
        inner.trigger.set_nsamples(nsamples);
        for ch in &mut inner.channels {
            ch.ctrl.nsamples = nsamples;
        }
    }

    /// Fill every channel's current control from the attribute chain.
    pub(crate) fn init_controls(&self, inner: &mut CsetInner) {
        let dev_attrs = self.device.attrs.lock();
        let CsetInner {
            attrs,
            trigger,
            channels,
            ..
        } = inner;
        for ch in channels.iter_mut() {
            let mut ctrl = Control::new();
            ctrl.ssize = self.ssize as u16;
            ctrl.nsamples = trigger.nsamples();
            ctrl.addr.dev_id = self.device.dev_id;
            ctrl.addr.cset = self.index as u16;
            ctrl.addr.chan = ch.index as u16;
            ctrl.addr.set_devname(&self.device.name);
            ctrl.set_trigger_name(trigger.type_name());

            dev_attrs.attributes().write_into(&mut ctrl.attr_channel);
            attrs.write_into(&mut ctrl.attr_channel);
            ch.attrs.write_into(&mut ctrl.attr_channel);
            trigger.attributes().write_into(&mut ctrl.attr_trigger);

            let bits = [&ch.attrs, &*attrs, dev_attrs.attributes()]
                .iter()
                .find_map(|set| set.standard(DeviceAttr::ResolutionBits.index()))
                .map_or(0, Attribute::value);
            ctrl.nbits = bits as u16;
            ch.ctrl = ctrl;
        }
    }

    /// Apply the interleave policy while changing one channel's state.
    ///
    /// While armed, channels that end up disabled give their active block
    /// back: the cycle no longer completes them.
    pub(crate) fn set_channel_enabled_locked(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        enable: bool,
        w: &mut Wakeups,
    ) {
        let Some(is_interleave) = inner.channels.get(chan).map(|ch| ch.interleave) else {
            return;
        };
        let was_enabled: Vec<bool> = inner.channels.iter().map(|ch| ch.enabled).collect();
        if is_interleave {
            inner.channels[chan].enabled = enable;
            if self.interleave == Interleave::Optional {
                for ch in inner.channels.iter_mut().filter(|ch| !ch.interleave) {
                    ch.enabled = !enable;
                }
            }
        } else {
            let blocked = self.interleave == Interleave::Only || self.interleave_active(inner);
            if enable && blocked {
                log::debug!(
                    "{}: channel {chan} stays disabled while interleaved",
                    self.name
                );
            }
            inner.channels[chan].enabled = enable && !blocked;
        }
        if inner.trigger.state() == TriggerState::Armed {
            for (ch, was) in inner.channels.iter_mut().zip(was_enabled) {
                if was && !ch.enabled {
                    if let Some(block) = ch.active.take() {
                        log::debug!("{}: channel {} disabled mid-cycle", self.name, ch.index);
                        w.add(ch.index, ch.bi.free_block(block));
                    }
                }
            }
        }
        self.update_nsamples(inner);
    }

    /// Mirror a channel-group attribute into the controls of `chans`.
    pub(crate) fn propagate_channel_attr(&self, inner: &mut CsetInner, attr: &Attribute, chan: Option<usize>) {
        for ch in inner
            .channels
            .iter_mut()
            .filter(|ch| chan.is_none_or(|c| c == ch.index))
        {
            attr.write_into(&mut ch.ctrl.attr_channel);
            if attr.kind() == AttrKind::Standard(DeviceAttr::ResolutionBits.index()) {
                ch.ctrl.nbits = attr.value() as u16;
            }
        }
    }

    pub(crate) fn propagate_trigger_attrs(&self, inner: &mut CsetInner) {
        let CsetInner {
            trigger, channels, ..
        } = inner;
        for ch in channels.iter_mut() {
            trigger.attributes().write_into(&mut ch.ctrl.attr_trigger);
        }
        self.update_nsamples(inner);
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        self.inner.lock().attrs.iter().cloned().collect()
    }

    /// Read an attribute, refreshing it from the driver.
    pub fn attribute(&self, name: &str) -> Result<u32, AttributeError> {
        let mut inner = self.inner.lock();
        let attr = inner
            .attrs
            .get(name)
            .cloned()
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))?;
        let value = self
            .device
            .ops
            .info_get(AttrTarget::Cset(self.index), &attr)
            .map_err(|source| AttributeError::Driver {
                name: name.to_string(),
                source,
            })?;
        inner.commit_store(name, value);
        Ok(value)
    }

    pub fn set_attribute(&self, name: &str, value: u32) -> Result<(), AttributeError> {
        let mut inner = self.inner.lock();
        let attr = inner.prepare_store(name, value)?;
        self.device
            .ops
            .conf_set(AttrTarget::Cset(self.index), &attr, value)
            .map_err(|source| AttributeError::Driver {
                name: name.to_string(),
                source,
            })?;
        if let Some(attr) = inner.commit_store(name, value) {
            self.propagate_channel_attr(&mut inner, &attr, None);
        }
        Ok(())
    }

    pub fn trigger_attributes(&self) -> Vec<Attribute> {
        self.inner.lock().trigger.attributes().iter().cloned().collect()
    }

    pub fn trigger_attribute(&self, name: &str) -> Result<u32, AttributeError> {
        self.inner
            .lock()
            .trigger
            .attributes()
            .value(name)
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))
    }

    /// Store a trigger attribute. The trigger is stopped around the change
    /// and re-armed afterwards if it was armed.
    pub fn set_trigger_attribute(&self, name: &str, value: u32) -> Result<(), AttributeError> {
        let mut w = Wakeups::default();
        let result = {
            let mut inner = self.inner.lock();
            let attr = inner.trigger.prepare_store(name, value)?;
            let snapshot = self.abort_locked(&mut inner, true, &mut w);
            let result = inner
                .trigger
                .config(&attr, value)
                .map_err(|source| AttributeError::Driver {
                    name: name.to_string(),
                    source,
                });
            if result.is_ok() {
                inner.trigger.commit_store(name, value);
                self.propagate_trigger_attrs(&mut inner);
            }
            self.restore_locked(&mut inner, snapshot, &mut w);
            result
        };
        self.wake(w);
        result
    }

    /// Copy device attributes changed through this set into the controls
    /// of the other sets of the device. Called without any cset lock held.
    pub(crate) fn mirror_device_attrs(&self, attrs: &[Attribute]) {
        if attrs.is_empty() {
            return;
        }
        let Some(csets) = self.device.csets.get() else {
            return;
        };
        for sibling in csets.iter().filter_map(Weak::upgrade) {
            if sibling.index == self.index {
                continue;
            }
            let mut inner = sibling.inner.lock();
            for attr in attrs {
                sibling.propagate_channel_attr(&mut inner, attr, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{interleaved_device, MockDriver};

    fn enabled(cset: &ChannelSet) -> Vec<bool> {
        cset.inner.lock().channels.iter().map(|c| c.enabled).collect()
    }

    #[test]
    fn test_interleave_optional_matrix() {
        let (_reg, dev) = interleaved_device(MockDriver::new(), Interleave::Optional, 3);
        let cset = dev.cset(0).unwrap();
        assert_eq!(cset.n_channels(), 4);
        assert_eq!(enabled(cset), [true, true, true, false]);
        assert_eq!(cset.nsamples(), 16);

        // Enabling the interleaved channel disables the normal ones.
        cset.channel(3).unwrap().set_enabled(true);
        assert_eq!(enabled(cset), [false, false, false, true]);
        assert_eq!(cset.nsamples(), 48);

        // A normal channel cannot come back while interleaved.
        cset.channel(1).unwrap().set_enabled(true);
        assert_eq!(enabled(cset), [false, false, false, true]);

        // Disabling the interleaved channel re-enables the normal ones.
        cset.channel(3).unwrap().set_enabled(false);
        assert_eq!(enabled(cset), [true, true, true, false]);
        assert_eq!(cset.nsamples(), 16);

        cset.channel(0).unwrap().set_enabled(false);
        assert_eq!(enabled(cset), [false, true, true, false]);
    }

    #[test]
    fn test_interleave_only_keeps_normals_disabled() {
        let (_reg, dev) = interleaved_device(MockDriver::new(), Interleave::Only, 2);
        let cset = dev.cset(0).unwrap();
        assert_eq!(enabled(cset), [false, false, true]);
        assert_eq!(cset.nsamples(), 32);

        cset.channel(0).unwrap().set_enabled(true);
        assert_eq!(enabled(cset), [false, false, true]);

        cset.channel(2).unwrap().set_enabled(false);
        assert_eq!(enabled(cset), [false, false, false]);
        assert_eq!(cset.nsamples(), 16);
    }

    #[test]
    fn test_node_names() {
        let (_reg, dev) = interleaved_device(MockDriver::new(), Interleave::Optional, 2);
        let cset = dev.cset(0).unwrap();
        assert_eq!(cset.node_name(0, true), "ileave-0000-0-0-ctrl");
        assert_eq!(cset.node_name(2, false), "ileave-0000-0-i-data");
        assert_eq!(cset.minor_count(), 6);
    }

    #[test]
    fn test_wakeups_mask() {
        let mut w = Wakeups::default();
        assert!(w.is_empty());
        w.add(2, Wakeup::NONE);
        assert!(w.is_empty());
        w.add(2, Wakeup::WAKE);
        w.add(5, Wakeup::WAKE);
        assert!(w.contains(5) && !w.contains(3));
        assert_eq!(w.iter().collect::<Vec<_>>(), [2, 5]);
    }

    #[test]
    fn test_cset_attribute_propagates() {
        let (_reg, dev) = interleaved_device(MockDriver::new(), Interleave::None, 2);
        let cset = dev.cset(0).unwrap();
        cset.set_attribute("gain_factor", 4).unwrap();
        for chan in cset.channels() {
            assert_eq!(chan.current_control().attr_channel.std(1), Some(4));
        }
        assert!(matches!(
            cset.set_attribute("gain_factor", 100),
            Err(AttributeError::OutOfRange { .. })
        ));
        assert_eq!(cset.attribute("gain_factor").unwrap(), 4);
    }
}
