use crate::attribute::{Attribute, AttributeError, AttributeHost, AttributeSet, ObjectKind};
use crate::block::BlockSlot;
use crate::buffer::BufferInstance;
use crate::chardev::{ChannelFile, IoError, OpenFlags, Stream};
use crate::control::{Alarms, Control};
use crate::cset::{ChannelSet, Wakeups};
use crate::device::AttrTarget;
use std::sync::Arc;

/// Per-channel state, guarded by the channel set lock.
pub(crate) struct ChannelState {
    pub(crate) index: usize,
    pub(crate) interleave: bool,
    pub(crate) enabled: bool,
    pub(crate) attrs: AttributeSet,
    pub(crate) ctrl: Control,
    /// Block owned by the hardware during a cycle.
    pub(crate) active: BlockSlot,
    /// Block being transferred to or from the user.
    pub(crate) user: BlockSlot,
    pub(crate) bi: Box<dyn BufferInstance>,
}

impl ChannelState {
    pub(crate) fn new(
        index: usize,
        interleave: bool,
        attrs: AttributeSet,
        bi: Box<dyn BufferInstance>,
    ) -> Self {
        Self {
            index,
            interleave,
            enabled: !interleave,
            attrs,
            ctrl: Control::new(),
            active: BlockSlot::empty(),
            user: BlockSlot::empty(),
            bi,
        }
    }

    /// Free both slots and everything queued.
    pub(crate) fn drain(&mut self, w: &mut Wakeups) {
        if let Some(block) = self.active.take() {
            w.add(self.index, self.bi.free_block(block));
        }
        if let Some(block) = self.user.take() {
            w.add(self.index, self.bi.free_block(block));
        }
        let (_, wake) = self.bi.flush();
        w.add(self.index, wake);
    }
}

impl AttributeHost for ChannelState {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Channel
    }

    fn attributes(&self) -> &AttributeSet {
        &self.attrs
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.attrs
    }
}

/// Handle to one channel of a registered channel set.
#[derive(Debug, Clone)]
pub struct Channel {
    cset: Arc<ChannelSet>,
    index: usize,
}

impl Channel {
    pub(crate) fn new(cset: Arc<ChannelSet>, index: usize) -> Self {
        Self { cset, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cset(&self) -> &Arc<ChannelSet> {
        &self.cset
    }

    pub fn is_interleave(&self) -> bool {
        self.cset.interleave_index() == Some(self.index)
    }

    pub fn is_enabled(&self) -> bool {
        self.cset.inner.lock().channels[self.index].enabled
    }

    /// Enabling the interleaved channel disables the others, and a normal
    /// channel stays disabled while the interleaved one is enabled.
    pub fn set_enabled(&self, enable: bool) {
        let mut w = Wakeups::default();
        {
            let mut inner = self.cset.inner.lock();
            self.cset
                .set_channel_enabled_locked(&mut inner, self.index, enable, &mut w);
        }
        self.cset.wake(w);
    }

    pub fn open(&self, stream: Stream, flags: OpenFlags) -> Result<ChannelFile, IoError> {
        ChannelFile::open(self.cset.clone(), self.index, stream, flags)
    }

    /// The control the next block of this channel will carry.
    pub fn current_control(&self) -> Control {
        self.cset.inner.lock().channels[self.index].ctrl.clone()
    }

    /// Framework and driver alarms recorded in the current control.
    pub fn alarms(&self) -> (Alarms, u8) {
        let inner = self.cset.inner.lock();
        let ctrl = &inner.channels[self.index].ctrl;
        (ctrl.alarms, ctrl.drv_alarms)
    }

    pub fn clear_alarms(&self, alarms: Alarms, drv_alarms: u8) {
        let mut inner = self.cset.inner.lock();
        let ctrl = &mut inner.channels[self.index].ctrl;
        ctrl.alarms.remove(alarms);
        ctrl.drv_alarms &= !drv_alarms;
    }

    pub fn attributes(&self) -> Vec<Attribute> {
        self.cset.inner.lock().channels[self.index]
            .attrs
            .iter()
            .cloned()
            .collect()
    }

    pub fn attribute(&self, name: &str) -> Result<u32, AttributeError> {
        let mut inner = self.cset.inner.lock();
        let ch = &mut inner.channels[self.index];
        let attr = ch
            .attrs
            .get(name)
            .cloned()
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))?;
        let value = self
            .cset
            .device
            .ops
            .info_get(self.target(), &attr)
            .map_err(|source| AttributeError::Driver {
                name: name.to_string(),
                source,
            })?;
        ch.commit_store(name, value);
        Ok(value)
    }

    pub fn set_attribute(&self, name: &str, value: u32) -> Result<(), AttributeError> {
        let mut inner = self.cset.inner.lock();
        let attr = inner.channels[self.index].prepare_store(name, value)?;
        self.cset
            .device
            .ops
            .conf_set(self.target(), &attr, value)
            .map_err(|source| AttributeError::Driver {
                name: name.to_string(),
                source,
            })?;
        if let Some(attr) = inner.channels[self.index].commit_store(name, value) {
            self.cset
                .propagate_channel_attr(&mut inner, &attr, Some(self.index));
        }
        Ok(())
    }

    pub fn buffer_attributes(&self) -> Vec<Attribute> {
        self.cset.inner.lock().channels[self.index]
            .bi
            .attributes()
            .iter()
            .cloned()
            .collect()
    }

    pub fn buffer_attribute(&self, name: &str) -> Result<u32, AttributeError> {
        let inner = self.cset.inner.lock();
        let bi = &inner.channels[self.index].bi;
        let attr = bi
            .attributes()
            .get(name)
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))?;
        Ok(bi.info_get(attr))
    }

    /// Store a buffer attribute and wake writers that may now fit.
    pub fn set_buffer_attribute(&self, name: &str, value: u32) -> Result<(), AttributeError> {
        let wake = {
            let mut inner = self.cset.inner.lock();
            let bi = &mut inner.channels[self.index].bi;
            let attr = bi.prepare_store(name, value)?;
            let wake = bi.conf_set(&attr, value)?;
            bi.commit_store(name, value);
            wake
        };
        let mut w = Wakeups::default();
        w.add(self.index, wake);
        self.cset.wake(w);
        Ok(())
    }

    /// Free every queued block. Returns how many were dropped.
    pub fn flush_buffer(&self) -> usize {
        let (count, w) = {
            let mut inner = self.cset.inner.lock();
            if inner.trigger.is_enabled() {
                log::warn!(
                    "{}: flushing channel {} while the trigger is enabled",
                    self.cset.device_name(),
                    self.index
                );
            }
            let ch = &mut inner.channels[self.index];
            let (count, wake) = ch.bi.flush();
            let mut w = Wakeups::default();
            w.add(self.index, wake);
            (count, w)
        };
        self.cset.wake(w);
        count
    }

    pub fn queued_blocks(&self) -> usize {
        self.cset.inner.lock().channels[self.index].bi.queued()
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.cset.inner.lock().channels[self.index].bi.in_flight()
    }

    pub fn has_active_block(&self) -> bool {
        !self.cset.inner.lock().channels[self.index].active.is_empty()
    }

    pub fn has_user_block(&self) -> bool {
        !self.cset.inner.lock().channels[self.index].user.is_empty()
    }

    pub fn node_name(&self, stream: Stream) -> String {
        self.cset
            .node_name(self.index, stream == Stream::Control)
    }

    fn target(&self) -> AttrTarget {
        AttrTarget::Channel {
            cset: self.cset.index(),
            chan: self.index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{input_device, MockDriver};
    use crate::trigger::TriggerState;

    #[test]
    fn test_channel_attribute_only_touches_own_control() {
        let (_reg, dev) = input_device(MockDriver::new(), 2, 4);
        let chan0 = dev.channel(0, 0).unwrap();
        let chan1 = dev.channel(0, 1).unwrap();

        chan0.set_attribute("offset", 17).unwrap();
        assert_eq!(chan0.current_control().attr_channel.std(2), Some(17));
        assert_eq!(chan1.current_control().attr_channel.std(2), Some(0));
        assert_eq!(chan0.attribute("offset").unwrap(), 17);
    }

    #[test]
    fn test_disable_while_armed_releases_block() {
        let driver = MockDriver::new().pending();
        let (_reg, dev) = input_device(driver.clone(), 2, 4);
        let cset = dev.cset(0).unwrap();
        let chan1 = dev.channel(0, 1).unwrap();
        cset.arm();
        assert_eq!(chan1.blocks_in_flight(), 1);

        chan1.set_enabled(false);
        assert!(!chan1.has_active_block());
        assert_eq!(chan1.blocks_in_flight(), 0);

        assert!(driver.complete_last());
        assert_eq!(cset.trigger_state(), TriggerState::Idle);
        assert_eq!(chan1.queued_blocks(), 0);
        assert_eq!(chan1.blocks_in_flight(), 0);
        assert_eq!(dev.channel(0, 0).unwrap().queued_blocks(), 1);
    }

    #[test]
    fn test_buffer_attributes() {
        let (_reg, dev) = input_device(MockDriver::new(), 1, 4);
        let chan = dev.channel(0, 0).unwrap();
        assert_eq!(chan.buffer_attribute("max-buffer-len").unwrap(), 4);
        chan.set_buffer_attribute("max-buffer-len", 8).unwrap();
        assert_eq!(chan.buffer_attribute("max-buffer-len").unwrap(), 8);
        assert!(matches!(
            chan.set_buffer_attribute("allocated-buffer-len", 3),
            Err(AttributeError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_alarm_clear() {
        let (_reg, dev) = input_device(MockDriver::new(), 1, 4);
        let chan = dev.channel(0, 0).unwrap();
        {
            let mut inner = chan.cset.inner.lock();
            inner.channels[0].ctrl.alarms = Alarms::LOST_BLOCK | Alarms::BAD_CONFIG;
            inner.channels[0].ctrl.drv_alarms = 0x3;
        }
        chan.clear_alarms(Alarms::LOST_BLOCK, 0x1);
        assert_eq!(chan.alarms(), (Alarms::BAD_CONFIG, 0x2));
    }
}
