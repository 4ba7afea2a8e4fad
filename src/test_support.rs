//! Scriptable driver and ready-made devices for the unit tests.

use crate::attribute::{Attribute, AttributeHost, AttributeSet, DeviceAttr, ObjectKind};
use crate::block::Block;
use crate::buffer::{
    BufferInstance, BufferType, ChannelInfo, HeapInstance, NoSpace, PushTarget, Stored, Wakeup,
};
use crate::cset::Interleave;
use crate::device::{AttrTarget, CsetBuilder, Device, DeviceBuilder, DeviceOperations, DriverError, IoStatus};
use crate::registry::{FrameworkConfig, Registry};
use crate::trigger::{Completion, RawIo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Default)]
struct MockState {
    pending: bool,
    no_fill: bool,
    reject: bool,
    raw_io_calls: usize,
    completions: Vec<Completion>,
    output_blocks: Vec<Vec<u8>>,
    conf_calls: Vec<(AttrTarget, String, u32)>,
}

/// Records every call. Input blocks are filled with their sequence number
/// unless `no_fill` is set; output blocks are copied out.
#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer `Pending` and keep the completion.
    pub(crate) fn pending(self) -> Self {
        self.state.lock().pending = true;
        self
    }

    pub(crate) fn no_fill(self) -> Self {
        self.state.lock().no_fill = true;
        self
    }

    pub(crate) fn reject_config(&self, reject: bool) {
        self.state.lock().reject = reject;
    }

    pub(crate) fn raw_io_calls(&self) -> usize {
        self.state.lock().raw_io_calls
    }

    pub(crate) fn pending_completions(&self) -> usize {
        self.state.lock().completions.len()
    }

    pub(crate) fn take_completion(&self) -> Option<Completion> {
        self.state.lock().completions.pop()
    }

    /// Finish the most recent pending cycle.
    pub(crate) fn complete_last(&self) -> bool {
        // Not under our lock: data_done takes the cset lock, and raw_io
        // takes ours under it.
        let completion = self.take_completion();
        completion.is_some_and(|c| c.data_done())
    }

    pub(crate) fn output_blocks(&self) -> Vec<Vec<u8>> {
        self.state.lock().output_blocks.clone()
    }

    /// Accepted `conf_set` calls.
    pub(crate) fn conf_calls(&self) -> Vec<(AttrTarget, String, u32)> {
        self.state.lock().conf_calls.clone()
    }
}

impl DeviceOperations for MockDriver {
    fn raw_io(&self, io: &mut RawIo<'_>) -> IoStatus {
        let mut state = self.state.lock();
        state.raw_io_calls += 1;
        if io.direction().is_output() {
            for (_, block) in io.blocks() {
                state.output_blocks.push(block.data().to_vec());
            }
        } else if !state.no_fill {
            for (_, block) in io.blocks() {
                let seq = block.control().seq_num as u8;
                block.data_mut().fill(seq);
            }
        }
        if state.pending {
            state.completions.push(io.completion());
            IoStatus::Pending
        } else {
            IoStatus::Done
        }
    }

    fn conf_set(&self, target: AttrTarget, attr: &Attribute, value: u32) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.reject {
            return Err(DriverError::Hardware(format!("{} rejected", attr.name())));
        }
        state.conf_calls.push((target, attr.name().to_string(), value));
        Ok(())
    }
}

fn registry(capacity: u32) -> Registry {
    Registry::new(FrameworkConfig {
        buffer_capacity: capacity,
        ..Default::default()
    })
}

/// Attributes shared by the test devices: sample rate on the device, gain
/// on the set, resolution and offset on every channel.
fn with_test_attributes(name: &str, driver: MockDriver, cset: CsetBuilder) -> DeviceBuilder {
    DeviceBuilder::new(name, driver)
        .attribute(Attribute::device(DeviceAttr::MaxSampleRate, 1_000_000))
        .cset(
            cset.attribute(Attribute::device(DeviceAttr::GainFactor, 1).range(1, 16))
                .channel_attribute(Attribute::device(DeviceAttr::ResolutionBits, 12))
                .channel_attribute(Attribute::device(DeviceAttr::Offset, 0)),
        )
}

fn register(reg: Registry, builder: DeviceBuilder) -> (Registry, Arc<Device>) {
    let dev = reg.register_device(builder).unwrap();
    (reg, dev)
}

/// A "mock" device with one input set of `n_chan` 16-bit channels.
pub(crate) fn input_device(driver: MockDriver, n_chan: usize, capacity: u32) -> (Registry, Arc<Device>) {
    let builder = with_test_attributes("mock", driver, CsetBuilder::input(n_chan, 2));
    register(registry(capacity), builder)
}

pub(crate) fn output_device(driver: MockDriver, n_chan: usize, capacity: u32) -> (Registry, Arc<Device>) {
    let builder = with_test_attributes("mock", driver, CsetBuilder::output(n_chan, 2));
    register(registry(capacity), builder)
}

/// Two input sets of `n_chan` channels each.
pub(crate) fn two_set_device(driver: MockDriver, n_chan: usize) -> (Registry, Arc<Device>) {
    let builder = with_test_attributes("mock", driver, CsetBuilder::input(n_chan, 2)).cset(
        CsetBuilder::input(n_chan, 2)
            .attribute(Attribute::device(DeviceAttr::GainFactor, 1).range(1, 16))
            .channel_attribute(Attribute::device(DeviceAttr::Offset, 0)),
    );
    register(registry(4), builder)
}

pub(crate) fn interleaved_device(
    driver: MockDriver,
    interleave: Interleave,
    n_chan: usize,
) -> (Registry, Arc<Device>) {
    let cset = CsetBuilder::input(n_chan, 2).interleave(interleave);
    register(registry(16), with_test_attributes("ileave", driver, cset))
}

#[derive(Clone, Default)]
pub(crate) struct StoreCounter(Arc<AtomicUsize>);

impl StoreCounter {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Heap buffer that counts `store_block` calls.
struct CountingBuffer(StoreCounter);

struct CountingInstance {
    heap: HeapInstance,
    stores: StoreCounter,
}

impl BufferType for CountingBuffer {
    fn name(&self) -> &str {
        "counting"
    }

    fn create(&self, info: &ChannelInfo) -> Box<dyn BufferInstance> {
        Box::new(CountingInstance {
            heap: HeapInstance::new(info),
            stores: self.0.clone(),
        })
    }
}

impl AttributeHost for CountingInstance {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Buffer
    }

    fn attributes(&self) -> &AttributeSet {
        self.heap.attributes()
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        self.heap.attributes_mut()
    }
}

impl BufferInstance for CountingInstance {
    fn alloc_block(&mut self, datalen: usize) -> Result<Block, NoSpace> {
        self.heap.alloc_block(datalen)
    }

    fn free_block(&mut self, block: Block) -> Wakeup {
        self.heap.free_block(block)
    }

    fn store_block(&mut self, block: Block, push: &mut dyn PushTarget) -> Result<Stored, Block> {
        self.stores.0.fetch_add(1, Ordering::SeqCst);
        self.heap.store_block(block, push)
    }

    fn retr_block(&mut self) -> Option<Block> {
        self.heap.retr_block()
    }

    fn queued(&self) -> usize {
        self.heap.queued()
    }

    fn in_flight(&self) -> usize {
        self.heap.in_flight()
    }

    fn capacity(&self) -> usize {
        self.heap.capacity()
    }
}

/// An output "mock" device whose single channel counts stores.
pub(crate) fn counting_output_device(
    driver: MockDriver,
    capacity: u32,
) -> (Registry, Arc<Device>, StoreCounter) {
    let reg = registry(capacity);
    let counter = StoreCounter::default();
    reg.register_buffer(Arc::new(CountingBuffer(counter.clone())))
        .unwrap();
    let builder = with_test_attributes(
        "mock",
        driver,
        CsetBuilder::output(1, 2).buffer("counting"),
    );
    let (reg, dev) = register(reg, builder);
    (reg, dev, counter)
}

/// Poll `cond` until it holds; fail the test after five seconds.
pub(crate) fn wait_for(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
