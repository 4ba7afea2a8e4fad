//! Trigger engine: arming, completion and abort of acquisition cycles, plus
//! the built-in `user` and `timer` trigger types.

use crate::attribute::{
    Attribute, AttributeError, AttributeHost, AttributeSet, ObjectKind, TriggerAttr,
};
use crate::block::{Block, BlockSlot};
use crate::buffer::{NoPush, PushAccepted, PushTarget, Stored};
use crate::channel::ChannelState;
use crate::control::{Alarms, CtrlAttr, Timestamp};
use crate::cset::{ChannelSet, CsetInner, Direction, Wakeups};
use crate::device::{DriverError, IoStatus};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

pub const USER_TRIGGER: &str = "user";
pub const TIMER_TRIGGER: &str = "timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Disabled,
    Idle,
    Armed,
}

/// Trigger state observed by [`ChannelSet::abort`] before it acted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSnapshot {
    pub enabled: bool,
    pub armed: bool,
}

/// Behaviour of one trigger instance. Every hook runs with the channel set
/// lock held and must not call back into the same set.
pub trait TriggerOperations: Send {
    /// A block was installed as the active block of `chan` on an output
    /// set. Return `true` to arm now.
    fn push_block(&mut self, chan: usize) -> bool {
        let _ = chan;
        false
    }

    /// A reader of `chan` found its queue empty. Return `true` to arm now.
    fn pull_block(&mut self, chan: usize) -> bool {
        let _ = chan;
        false
    }

    /// Validate and apply a new attribute value before it is stored.
    fn config(&mut self, attr: &Attribute, value: u32) -> Result<(), DriverError> {
        let _ = (attr, value);
        Ok(())
    }

    fn change_status(&mut self, enabled: bool) {
        let _ = enabled;
    }

    /// A cycle completed. `pending` tells whether an output set already has
    /// the next blocks in place. Return `true` to re-arm immediately.
    fn data_done(&mut self, direction: Direction, pending: bool) -> bool {
        let _ = (direction, pending);
        false
    }

    fn destroy(&mut self) {}
}

/// Factory for trigger instances, registered by name.
pub trait TriggerType: Send + Sync {
    fn name(&self) -> &str;

    /// Attribute template copied into every instance.
    fn attributes(&self) -> AttributeSet;

    fn create(&self, cset: Weak<ChannelSet>, attrs: &AttributeSet) -> Box<dyn TriggerOperations>;
}

/// Trigger types known to a registry, shared with its devices so a
/// control can name the trigger it wants.
#[derive(Clone)]
pub(crate) struct TriggerCatalog(Arc<RwLock<Vec<Arc<dyn TriggerType>>>>);

impl TriggerCatalog {
    pub(crate) fn new(types: Vec<Arc<dyn TriggerType>>) -> Self {
        Self(Arc::new(RwLock::new(types)))
    }

    pub(crate) fn find(&self, name: &str) -> Option<Arc<dyn TriggerType>> {
        self.0.read().iter().find(|t| t.name() == name).cloned()
    }

    /// Returns `false` if the name is taken.
    pub(crate) fn insert(&self, ttype: Arc<dyn TriggerType>) -> bool {
        let mut types = self.0.write();
        if types.iter().any(|t| t.name() == ttype.name()) {
            return false;
        }
        types.push(ttype);
        true
    }

    pub(crate) fn remove(&self, name: &str) -> Option<Arc<dyn TriggerType>> {
        let mut types = self.0.write();
        let pos = types.iter().position(|t| t.name() == name)?;
        Some(types.remove(pos))
    }
}

/// A trigger type with its attribute template numbered for the control.
pub(crate) fn trigger_template(ttype: &dyn TriggerType) -> Result<AttributeSet, AttributeError> {
    let mut attrs = ttype.attributes();
    attrs.number_extended(0)?;
    Ok(attrs)
}

pub struct TriggerInstance {
    type_name: String,
    state: TriggerState,
    tstamp: Timestamp,
    generation: u64,
    nsamples: u32,
    attrs: AttributeSet,
    ops: Box<dyn TriggerOperations>,
}

impl TriggerInstance {
    pub(crate) fn new(type_name: &str, attrs: AttributeSet, ops: Box<dyn TriggerOperations>) -> Self {
        Self {
            type_name: type_name.to_string(),
            state: TriggerState::Idle,
            tstamp: Timestamp::default(),
            generation: 0,
            nsamples: 0,
            attrs,
            ops,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn state(&self) -> TriggerState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state != TriggerState::Disabled
    }

    pub fn nsamples(&self) -> u32 {
        self.nsamples
    }

    pub(crate) fn set_nsamples(&mut self, nsamples: u32) {
        self.nsamples = nsamples;
    }

    pub(crate) fn config(&mut self, attr: &Attribute, value: u32) -> Result<(), DriverError> {
        self.ops.config(attr, value)
    }

    pub(crate) fn pull_block(&mut self, chan: usize) -> bool {
        self.ops.pull_block(chan)
    }

    pub(crate) fn destroy(&mut self) {
        self.ops.destroy();
    }
}

impl AttributeHost for TriggerInstance {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Trigger
    }

    fn attributes(&self) -> &AttributeSet {
        &self.attrs
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.attrs
    }
}

/// Output push path: a stored block goes straight to the active slot when
/// the trigger is idle and the slot is free.
pub(crate) struct TriggerPush<'a> {
    pub(crate) trigger: &'a mut TriggerInstance,
    pub(crate) slot: &'a mut BlockSlot,
    pub(crate) chan: usize,
}

impl PushTarget for TriggerPush<'_> {
    fn try_push(&mut self, block: Block) -> Result<PushAccepted, Block> {
        if self.trigger.state != TriggerState::Idle {
            return Err(block);
        }
        self.slot.install(block)?;
        Ok(PushAccepted {
            arm: self.trigger.ops.push_block(self.chan),
        })
    }
}

/// The hardware's view of one acquisition cycle.
pub struct RawIo<'a> {
    cset: &'a ChannelSet,
    channels: &'a mut [ChannelState],
    tstamp: &'a mut Timestamp,
    nsamples: u32,
    completion: Completion,
}

impl RawIo<'_> {
    pub fn cset_index(&self) -> usize {
        self.cset.index()
    }

    pub fn direction(&self) -> Direction {
        self.cset.direction()
    }

    pub fn ssize(&self) -> usize {
        self.cset.ssize()
    }

    pub fn nsamples(&self) -> u32 {
        self.nsamples
    }

    /// Active blocks of the enabled channels, with their channel index.
    pub fn blocks(&mut self) -> impl Iterator<Item = (usize, &mut Block)> + '_ {
        self.channels
            .iter_mut()
            .filter(|ch| ch.enabled)
            .filter_map(|ch| {
                let index = ch.index;
                ch.active.get_mut().map(|block| (index, block))
            })
    }

    pub fn block_mut(&mut self, chan: usize) -> Option<&mut Block> {
        self.channels
            .get_mut(chan)
            .filter(|ch| ch.enabled)
            .and_then(|ch| ch.active.get_mut())
    }

    pub fn timestamp(&self) -> Timestamp {
        *self.tstamp
    }

    /// Override the fire time recorded when the trigger armed.
    pub fn set_timestamp(&mut self, tstamp: Timestamp) {
        *self.tstamp = tstamp;
    }

    /// Record driver alarm bits on a channel.
    pub fn raise_alarm(&mut self, chan: usize, drv_alarms: u8) {
        if let Some(ch) = self.channels.get_mut(chan) {
            ch.ctrl.drv_alarms |= drv_alarms;
            if let Some(block) = ch.active.get_mut() {
                block.control_mut().drv_alarms |= drv_alarms;
            }
        }
    }

    /// Token to finish a [`IoStatus::Pending`] cycle from another thread.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }
}

/// Completes an asynchronous acquisition cycle.
///
/// A completion only acts on the cycle it was issued for; once that cycle
/// was aborted or finished, calls are ignored.
#[derive(Debug, Clone)]
pub struct Completion {
    cset: Weak<ChannelSet>,
    generation: u64,
}

impl Completion {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Finish the cycle. Returns `false` for a stale completion.
    pub fn data_done(&self) -> bool {
        match self.cset.upgrade() {
            Some(cset) => cset.complete(self.generation),
            None => {
                log::debug!("completion for a removed channel set");
                false
            }
        }
    }

    /// Access the cycle's blocks, e.g. to fill them from a DMA callback.
    pub fn with_blocks<R>(&self, f: impl FnOnce(&mut RawIo<'_>) -> R) -> Option<R> {
        let cset = self.cset.upgrade()?;
        let mut guard = cset.inner.lock();
        let inner = &mut *guard;
        if !is_current(inner, self.generation) {
            return None;
        }
        let mut io = RawIo {
            cset: &cset,
            channels: &mut inner.channels,
            tstamp: &mut inner.trigger.tstamp,
            nsamples: inner.trigger.nsamples,
            completion: self.clone(),
        };
        Some(f(&mut io))
    }
}

fn is_current(inner: &CsetInner, generation: u64) -> bool {
    inner.trigger.state == TriggerState::Armed && inner.trigger.generation == generation
}

impl ChannelSet {
    /// Start an acquisition cycle. Does nothing unless the trigger is idle.
    pub fn arm(&self) {
        let mut w = Wakeups::default();
        {
            let mut inner = self.inner.lock();
            self.arm_locked(&mut inner, &mut w);
        }
        self.wake(w);
    }

    /// Stop the current cycle, freeing its active blocks, and optionally
    /// disable the trigger.
    pub fn abort(&self, disable: bool) -> TriggerSnapshot {
        let mut w = Wakeups::default();
        let snapshot = {
            let mut inner = self.inner.lock();
            self.abort_locked(&mut inner, disable, &mut w)
        };
        self.wake(w);
        snapshot
    }

    pub fn set_trigger_enabled(&self, enable: bool) {
        {
            let mut inner = self.inner.lock();
            let mut w = Wakeups::default();
            if enable {
                enable_locked(&mut inner);
            } else {
                let _ = self.abort_locked(&mut inner, true, &mut w);
            }
        }
        // Waiters re-check their condition.
        self.wake_all();
    }

    pub(crate) fn arm_locked(&self, inner: &mut CsetInner, w: &mut Wakeups) {
        loop {
            match inner.trigger.state {
                TriggerState::Idle => {}
                TriggerState::Armed => {
                    log::debug!("{}: already armed", self.name());
                    return;
                }
                TriggerState::Disabled => {
                    log::debug!("{}: arm ignored while disabled", self.name());
                    return;
                }
            }
            inner.trigger.state = TriggerState::Armed;
            inner.trigger.generation += 1;
            inner.trigger.tstamp = Timestamp::now();
            let generation = inner.trigger.generation;

            let span = tracing::debug_span!("acquisition", cset = %self.name(), generation);
            let _enter = span.enter();

            if self.direction().is_input() {
                self.alloc_active_blocks(inner);
            }

            let status = {
                let mut io = RawIo {
                    cset: self,
                    channels: &mut inner.channels,
                    tstamp: &mut inner.trigger.tstamp,
                    nsamples: inner.trigger.nsamples,
                    completion: Completion {
                        cset: self.self_ref.clone(),
                        generation,
                    },
                };
                self.device.ops.raw_io(&mut io)
            };
            log::debug!("{}: armed, raw_io returned {status:?}", self.name());

            match status {
                IoStatus::Pending => return,
                IoStatus::Done => {
                    if !self.data_done_locked(inner, w) {
                        return;
                    }
                }
            }
        }
    }

    fn alloc_active_blocks(&self, inner: &mut CsetInner) {
        let nsamples = inner.trigger.nsamples;
        let datalen = self.ssize() * nsamples as usize;
        for ch in inner.channels.iter_mut().filter(|ch| ch.enabled) {
            ch.ctrl.seq_num = ch.ctrl.seq_num.wrapping_add(1);
            ch.ctrl.nsamples = nsamples;
            match ch.bi.alloc_block(datalen) {
                Ok(mut block) => {
                    *block.control_mut() = ch.ctrl.clone();
                    if let Err(block) = ch.active.install(block) {
                        log::warn!("{}: channel {} still had an active block", self.name(), ch.index);
                        let _ = ch.bi.free_block(block);
                    }
                }
                Err(_) => {
                    log::debug!(
                        "{}: no space for channel {} (seq {})",
                        self.name(),
                        ch.index,
                        ch.ctrl.seq_num
                    );
                    ch.ctrl.alarms |= Alarms::LOST_BLOCK;
                }
            }
        }
    }

    /// Close the current cycle. Returns whether the trigger asked to be
    /// armed again.
    pub(crate) fn data_done_locked(&self, inner: &mut CsetInner, w: &mut Wakeups) -> bool {
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("data_done"), 0));

        let direction = self.direction();
        let tstamp = inner.trigger.tstamp;
        let mut pending = false;

        for ch in inner.channels.iter_mut().filter(|ch| ch.enabled) {
            let Some(mut block) = ch.active.take() else {
                if direction.is_output() {
                    pending |= prefetch(ch);
                }
                continue;
            };
            if direction.is_output() {
                w.add(ch.index, ch.bi.free_block(block));
                pending |= prefetch(ch);
                continue;
            }

            ch.ctrl.tstamp = tstamp;
            block.control_mut().tstamp = tstamp;
            match ch.bi.store_block(block, &mut NoPush) {
                Ok(Stored::Queued(wake)) => w.add(ch.index, wake),
                Ok(Stored::Pushed(_)) => {}
                Err(block) => {
                    log::debug!("{}: channel {} dropped a block", self.name(), ch.index);
                    ch.ctrl.alarms |= Alarms::LOST_BLOCK;
                    w.add(ch.index, ch.bi.free_block(block));
                }
            }
        }

        inner.trigger.state = TriggerState::Idle;
        log::debug!(
            "{}: data done (generation {})",
            self.name(),
            inner.trigger.generation
        );
        inner.trigger.ops.data_done(direction, pending)
    }

    /// Entry point for [`Completion::data_done`].
    fn complete(&self, generation: u64) -> bool {
        let mut w = Wakeups::default();
        let accepted = {
            let mut inner = self.inner.lock();
            if is_current(&inner, generation) {
                if self.data_done_locked(&mut inner, &mut w) {
                    self.arm_locked(&mut inner, &mut w);
                }
                true
            } else {
                log::warn!(
                    "{}: stale completion for generation {generation} ignored",
                    self.name()
                );
                false
            }
        };
        self.wake(w);
        accepted
    }

    pub(crate) fn abort_locked(
        &self,
        inner: &mut CsetInner,
        disable: bool,
        w: &mut Wakeups,
    ) -> TriggerSnapshot {
        let snapshot = TriggerSnapshot {
            enabled: inner.trigger.state != TriggerState::Disabled,
            armed: inner.trigger.state == TriggerState::Armed,
        };

        if snapshot.armed {
            for ch in &mut inner.channels {
                if let Some(block) = ch.active.take() {
                    w.add(ch.index, ch.bi.free_block(block));
                }
            }
            inner.trigger.state = TriggerState::Idle;
            log::debug!("{}: cycle aborted", self.name());
        }

        if disable && inner.trigger.state != TriggerState::Disabled {
            inner.trigger.state = TriggerState::Disabled;
            inner.trigger.ops.change_status(false);
        }
        snapshot
    }

    /// Replace the trigger instance with a new one of `ttype`, built from
    /// `attrs`. The new instance is left disabled and every channel control
    /// switches to its name and attributes.
    pub(crate) fn install_trigger_locked(
        &self,
        inner: &mut CsetInner,
        ttype: &Arc<dyn TriggerType>,
        attrs: AttributeSet,
        w: &mut Wakeups,
    ) {
        let _ = self.abort_locked(inner, true, w);
        inner.trigger.destroy();
        let ops = ttype.create(self.self_ref.clone(), &attrs);
        inner.trigger = TriggerInstance::new(ttype.name(), attrs, ops);
        let _ = self.abort_locked(inner, true, w);

        let CsetInner {
            trigger, channels, ..
        } = &mut *inner;
        for ch in channels.iter_mut() {
            ch.ctrl.attr_trigger = CtrlAttr::default();
            trigger.attributes().write_into(&mut ch.ctrl.attr_trigger);
            ch.ctrl.set_trigger_name(trigger.type_name());
        }
        self.update_nsamples(inner);
        log::debug!("{}: trigger is now {}", self.name(), ttype.name());
    }

    /// Undo an abort: re-enable if it was enabled, re-arm if it was armed.
    pub(crate) fn restore_locked(&self, inner: &mut CsetInner, snapshot: TriggerSnapshot, w: &mut Wakeups) {
        if !snapshot.enabled {
            return;
        }
        enable_locked(inner);
        if snapshot.armed {
            self.arm_locked(inner, w);
        }
    }
}

fn enable_locked(inner: &mut CsetInner) {
    if inner.trigger.state == TriggerState::Disabled {
        inner.trigger.state = TriggerState::Idle;
        inner.trigger.ops.change_status(true);
    }
}

/// Move the next queued output block into the active slot.
fn prefetch(ch: &mut ChannelState) -> bool {
    if !ch.active.is_empty() {
        return true;
    }
    match ch.bi.retr_block() {
        Some(block) => ch.active.install(block).is_ok(),
        None => false,
    }
}

/// Arms on demand: when a reader finds no data, or when a block is written.
#[derive(Debug, Default)]
pub struct UserTrigger;

struct UserOps;

impl TriggerOperations for UserOps {
    fn push_block(&mut self, _chan: usize) -> bool {
        true
    }

    fn pull_block(&mut self, _chan: usize) -> bool {
        true
    }

    fn data_done(&mut self, direction: Direction, pending: bool) -> bool {
        direction.is_output() && pending
    }
}

fn standard_trigger_attrs() -> AttributeSet {
    AttributeSet::new()
        .with(Attribute::trigger(TriggerAttr::NShots, 0))
        .with(Attribute::trigger(TriggerAttr::PreSamples, 0))
        .with(Attribute::trigger(TriggerAttr::PostSamples, 16))
        .with(Attribute::version(1))
}

impl TriggerType for UserTrigger {
    fn name(&self) -> &str {
        USER_TRIGGER
    }

    fn attributes(&self) -> AttributeSet {
        standard_trigger_attrs()
    }

    fn create(&self, _cset: Weak<ChannelSet>, _attrs: &AttributeSet) -> Box<dyn TriggerOperations> {
        Box::new(UserOps)
    }
}

/// Arms its channel set periodically from a background thread.
#[derive(Debug, Default)]
pub struct TimerTrigger;

pub const TIMER_PERIOD_ATTR: &str = "ms-period";
const DEFAULT_PERIOD_MS: u32 = 100;

struct TimerOps {
    period_ms: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
}

impl TriggerOperations for TimerOps {
    fn config(&mut self, attr: &Attribute, value: u32) -> Result<(), DriverError> {
        if attr.name() == TIMER_PERIOD_ATTR {
            self.period_ms.store(value, Ordering::Relaxed);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for TimerOps {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl TriggerType for TimerTrigger {
    fn name(&self) -> &str {
        TIMER_TRIGGER
    }

    fn attributes(&self) -> AttributeSet {
        standard_trigger_attrs()
            .with(Attribute::extended(TIMER_PERIOD_ATTR, DEFAULT_PERIOD_MS).range(1, 3_600_000))
    }

    fn create(&self, cset: Weak<ChannelSet>, attrs: &AttributeSet) -> Box<dyn TriggerOperations> {
        let period_ms = Arc::new(AtomicU32::new(
            attrs.value(TIMER_PERIOD_ATTR).unwrap_or(DEFAULT_PERIOD_MS),
        ));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_period = period_ms.clone();
        let thread_stop = stop.clone();
        let spawned = thread::Builder::new()
            .name("zio-timer".to_string())
            .spawn(move || loop {
                let period = u64::from(thread_period.load(Ordering::Relaxed).max(1));
                thread::sleep(Duration::from_millis(period));
                if thread_stop.load(Ordering::Relaxed) {
                    break;
                }
                // Not yet reachable while the set is being built.
                if let Some(cset) = cset.upgrade() {
                    cset.arm();
                }
            });
        if let Err(e) = spawned {
            log::error!("timer trigger thread failed to start: {e}");
        }

        Box::new(TimerOps { period_ms, stop })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{input_device, output_device, MockDriver};
    use std::time::Instant;

    #[test]
    fn test_arm_is_idempotent_while_armed() {
        let driver = MockDriver::new().pending();
        let (_reg, dev) = input_device(driver.clone(), 2, 4);
        let cset = dev.cset(0).unwrap();

        cset.arm();
        assert_eq!(cset.trigger_state(), TriggerState::Armed);
        cset.arm();
        assert_eq!(driver.raw_io_calls(), 1);
        assert_eq!(dev.channel(0, 0).unwrap().blocks_in_flight(), 1);
        assert!(dev.channel(0, 0).unwrap().alarms().0.is_empty());

        assert!(driver.complete_last());
        assert_eq!(cset.trigger_state(), TriggerState::Idle);
        assert_eq!(dev.channel(0, 0).unwrap().queued_blocks(), 1);
        assert_eq!(dev.channel(0, 1).unwrap().queued_blocks(), 1);
    }

    #[test]
    fn test_input_cycle_stamps_and_sequences() {
        let driver = MockDriver::new();
        let (_reg, dev) = input_device(driver.clone(), 1, 4);
        let cset = dev.cset(0).unwrap();
        cset.arm();
        cset.arm();

        let chan = dev.channel(0, 0).unwrap();
        assert_eq!(chan.queued_blocks(), 2);
        let mut inner = cset.inner.lock();
        let first = inner.channels[0].bi.retr_block().unwrap();
        let second = inner.channels[0].bi.retr_block().unwrap();
        assert_eq!(first.control().seq_num + 1, second.control().seq_num);
        assert_ne!(first.control().tstamp, Timestamp::default());
        assert_eq!(first.datalen(), 16 * 2);
        // The mock driver fills each block with its sequence number.
        assert!(first.data().iter().all(|b| *b == first.control().seq_num as u8));
    }

    #[test]
    fn test_abort_disable_frees_active_blocks() {
        let driver = MockDriver::new().pending();
        let (_reg, dev) = input_device(driver.clone(), 2, 4);
        let cset = dev.cset(0).unwrap();
        cset.arm();
        assert_eq!(dev.channel(0, 1).unwrap().blocks_in_flight(), 1);

        let snapshot = cset.abort(true);
        assert_eq!(
            snapshot,
            TriggerSnapshot {
                enabled: true,
                armed: true
            }
        );
        assert_eq!(cset.trigger_state(), TriggerState::Disabled);
        assert_eq!(dev.channel(0, 0).unwrap().blocks_in_flight(), 0);
        assert_eq!(dev.channel(0, 1).unwrap().blocks_in_flight(), 0);

        cset.arm();
        assert_eq!(cset.trigger_state(), TriggerState::Disabled);
        assert_eq!(driver.raw_io_calls(), 1);

        cset.set_trigger_enabled(true);
        cset.arm();
        assert_eq!(driver.raw_io_calls(), 2);
    }

    #[test]
    fn test_stale_completion_ignored() {
        let driver = MockDriver::new().pending();
        let (_reg, dev) = input_device(driver.clone(), 1, 4);
        let cset = dev.cset(0).unwrap();
        cset.arm();
        let old = driver.take_completion().unwrap();

        let _ = cset.abort(false);
        cset.arm();
        assert!(!old.data_done());
        assert_eq!(cset.trigger_state(), TriggerState::Armed);
        assert!(old.with_blocks(|_| ()).is_none());

        assert!(driver.complete_last());
        assert!(!driver.complete_last());
        assert_eq!(dev.channel(0, 0).unwrap().queued_blocks(), 1);
    }

    #[test]
    fn test_allocation_failure_sets_lost_block() {
        let (_reg, dev) = input_device(MockDriver::new(), 1, 2);
        let cset = dev.cset(0).unwrap();
        for _ in 0..3 {
            cset.arm();
        }
        let chan = dev.channel(0, 0).unwrap();
        assert_eq!(chan.queued_blocks(), 2);
        assert!(chan.alarms().0.contains(Alarms::LOST_BLOCK));
        assert_eq!(chan.current_control().seq_num, 3);
    }

    #[test]
    fn test_pending_completion_fills_through_with_blocks() {
        let driver = MockDriver::new().pending().no_fill();
        let (_reg, dev) = input_device(driver.clone(), 1, 4);
        let cset = dev.cset(0).unwrap();
        cset.arm();

        let completion = driver.take_completion().unwrap();
        let filled = completion.with_blocks(|io| {
            io.raise_alarm(0, 0x10);
            let mut count = 0;
            for (_, block) in io.blocks() {
                block.data_mut().fill(0xab);
                count += 1;
            }
            count
        });
        assert_eq!(filled, Some(1));
        assert!(completion.data_done());

        let mut inner = cset.inner.lock();
        let block = inner.channels[0].bi.retr_block().unwrap();
        assert!(block.data().iter().all(|b| *b == 0xab));
        assert_eq!(block.control().drv_alarms, 0x10);
    }

    #[test]
    fn test_output_user_trigger_drains_queue_iteratively() {
        let driver = MockDriver::new();
        let (_reg, dev) = output_device(driver.clone(), 1, 8);
        let cset = dev.cset(0).unwrap();
        {
            let mut inner = cset.inner.lock();
            inner.trigger.state = TriggerState::Disabled;
            for _ in 0..5 {
                let block = inner.channels[0].bi.alloc_block(4).unwrap();
                let CsetInner {
                    trigger, channels, ..
                } = &mut *inner;
                let ch = &mut channels[0];
                let mut push = TriggerPush {
                    trigger,
                    slot: &mut ch.active,
                    chan: 0,
                };
                assert!(matches!(
                    ch.bi.store_block(block, &mut push),
                    Ok(Stored::Queued(_))
                ));
            }
        }
        cset.set_trigger_enabled(true);
        cset.arm();
        // One arm, then a re-arm for each prefetched block.
        assert_eq!(driver.raw_io_calls(), 6);
        assert_eq!(dev.channel(0, 0).unwrap().blocks_in_flight(), 0);
        assert_eq!(driver.output_blocks().len(), 5);
    }

    #[test]
    fn test_timer_trigger_produces_blocks() {
        let driver = MockDriver::new();
        let (reg, dev) = input_device(driver.clone(), 1, 4);
        let cset = dev.cset(0).unwrap();
        reg.change_trigger(cset, TIMER_TRIGGER).unwrap();
        cset.set_trigger_attribute(TIMER_PERIOD_ATTR, 5).unwrap();
        assert_eq!(cset.trigger_name(), TIMER_TRIGGER);

        let chan = dev.channel(0, 0).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while chan.queued_blocks() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(chan.queued_blocks() >= 2);
        assert_eq!(
            chan.current_control().trigger_name(),
            TIMER_TRIGGER
        );
        reg.unregister_device(&dev).unwrap();
    }
}
