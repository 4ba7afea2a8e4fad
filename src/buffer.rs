use crate::attribute::{
    Attribute, AttributeError, AttributeHost, AttributeSet, BufferAttr, ObjectKind,
};
use crate::block::Block;
use crate::cset::Direction;
use std::collections::VecDeque;

pub const HEAP_BUFFER: &str = "heap";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("No space left in buffer")]
pub struct NoSpace;

/// Whether waiters on a channel must be woken. Returned by buffer methods
/// and applied by the caller once the cset lock is released.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Wakeup(bool);

impl Wakeup {
    pub const NONE: Self = Self(false);
    pub const WAKE: Self = Self(true);

    pub fn is_needed(self) -> bool {
        self.0
    }
}

impl From<bool> for Wakeup {
    fn from(wake: bool) -> Self {
        Self(wake)
    }
}

/// Outcome of handing a block to the trigger's push path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushAccepted {
    /// The trigger asks to be armed now.
    pub arm: bool,
}

/// The trigger side of an output store: the buffer offers the block it
/// would otherwise queue.
pub trait PushTarget {
    fn try_push(&mut self, block: Block) -> Result<PushAccepted, Block>;
}

/// Push target for input channels, where nothing is ever pushed.
pub(crate) struct NoPush;

impl PushTarget for NoPush {
    fn try_push(&mut self, block: Block) -> Result<PushAccepted, Block> {
        Err(block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stored {
    /// The block sits in the ready queue.
    Queued(Wakeup),
    /// The block went straight to the trigger.
    Pushed(PushAccepted),
}

/// What a buffer type learns about the channel it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub direction: Direction,
    pub cset: usize,
    pub chan: usize,
    pub ssize: usize,
    /// Initial `max-buffer-len`.
    pub capacity: u32,
}

/// A bounded producer/consumer queue of blocks for one channel.
///
/// Every method is called with the channel set lock held.
pub trait BufferInstance: AttributeHost + Send {
    /// Fails once the number of blocks in flight reached the capacity.
    fn alloc_block(&mut self, datalen: usize) -> Result<Block, NoSpace>;

    fn free_block(&mut self, block: Block) -> Wakeup;

    /// Enqueue at the tail. An output buffer whose queue was empty first
    /// offers the block to `push`. A block the buffer cannot take is
    /// handed back.
    fn store_block(&mut self, block: Block, push: &mut dyn PushTarget) -> Result<Stored, Block>;

    /// Dequeue the head. Never blocks.
    fn retr_block(&mut self) -> Option<Block>;

    /// Blocks waiting in the ready queue.
    fn queued(&self) -> usize;

    /// Blocks allocated and not yet freed.
    fn in_flight(&self) -> usize;

    fn capacity(&self) -> usize;

    /// Called after an attribute store was validated. The default accepts
    /// the value and wakes writers, since the capacity may have grown.
    fn conf_set(&mut self, attr: &Attribute, value: u32) -> Result<Wakeup, AttributeError> {
        let _ = (attr, value);
        Ok(Wakeup::WAKE)
    }

    /// Live value of an attribute.
    fn info_get(&self, attr: &Attribute) -> u32 {
        attr.value()
    }

    /// Drop every queued block. Returns how many were freed.
    fn flush(&mut self) -> (usize, Wakeup) {
        let mut count = 0;
        let mut wake = false;
        while let Some(block) = self.retr_block() {
            wake |= self.free_block(block).is_needed();
            count += 1;
        }
        (count, wake.into())
    }
}

/// Factory for buffer instances, registered by name.
pub trait BufferType: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, info: &ChannelInfo) -> Box<dyn BufferInstance>;
}

/// Blocks live on the heap and are queued in a `VecDeque`.
#[derive(Debug, Default)]
pub struct HeapBuffer;

impl BufferType for HeapBuffer {
    fn name(&self) -> &str {
        HEAP_BUFFER
    }

    fn create(&self, info: &ChannelInfo) -> Box<dyn BufferInstance> {
        Box::new(HeapInstance::new(info))
    }
}

#[derive(Debug)]
pub struct HeapInstance {
    direction: Direction,
    queue: VecDeque<Block>,
    in_flight: usize,
    bytes_in_flight: usize,
    attrs: AttributeSet,
}

impl HeapInstance {
    pub fn new(info: &ChannelInfo) -> Self {
        let attrs = AttributeSet::new()
            .with(Attribute::buffer(BufferAttr::MaxLen, info.capacity).range(1, 65536))
            .with(Attribute::buffer(BufferAttr::MaxKb, 0))
            .with(Attribute::buffer(BufferAttr::AllocatedLen, 0).read_only())
            .with(Attribute::version(1));
        Self {
            direction: info.direction,
            queue: VecDeque::new(),
            in_flight: 0,
            bytes_in_flight: 0,
            attrs,
        }
    }

    fn max_bytes(&self) -> Option<usize> {
        match self.attrs.value(BufferAttr::MaxKb.as_str()) {
            Some(0) | None => None,
            Some(kb) => Some(kb as usize * 1024),
        }
    }
}

impl AttributeHost for HeapInstance {
    fn object_kind(&self) -> ObjectKind {
        ObjectKind::Buffer
    }

    fn attributes(&self) -> &AttributeSet {
        &self.attrs
    }

    fn attributes_mut(&mut self) -> &mut AttributeSet {
        &mut self.attrs
    }
}

impl BufferInstance for HeapInstance {
    fn alloc_block(&mut self, datalen: usize) -> Result<Block, NoSpace> {
        if self.in_flight >= self.capacity() {
            log::debug!("heap buffer full: {} blocks in flight", self.in_flight);
            return Err(NoSpace);
        }
        if let Some(max) = self.max_bytes() {
            if self.bytes_in_flight + datalen > max {
                log::debug!("heap buffer over {max} bytes");
                return Err(NoSpace);
            }
        }
        self.in_flight += 1;
        self.bytes_in_flight += datalen;
        Ok(Block::new(datalen))
    }

    fn free_block(&mut self, block: Block) -> Wakeup {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(block.datalen());
        drop(block);
        // A slot opened up for writers.
        self.direction.is_output().into()
    }

    fn store_block(&mut self, block: Block, push: &mut dyn PushTarget) -> Result<Stored, Block> {
        let was_empty = self.queue.is_empty();
        if was_empty && self.direction.is_output() {
            match push.try_push(block) {
                Ok(accepted) => return Ok(Stored::Pushed(accepted)),
                Err(block) => self.queue.push_back(block),
            }
            return Ok(Stored::Queued(Wakeup::NONE));
        }
        self.queue.push_back(block);
        Ok(Stored::Queued(
            (was_empty && self.direction.is_input()).into(),
        ))
    }

    fn retr_block(&mut self) -> Option<Block> {
        self.queue.pop_front()
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn capacity(&self) -> usize {
        self.attrs
            .value(BufferAttr::MaxLen.as_str())
            .map_or(0, |v| v as usize)
    }

    fn info_get(&self, attr: &Attribute) -> u32 {
        if attr.name() == BufferAttr::AllocatedLen.as_str() {
            return self.in_flight as u32;
        }
        attr.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(direction: Direction, capacity: u32) -> ChannelInfo {
        ChannelInfo {
            direction,
            cset: 0,
            chan: 0,
            ssize: 2,
            capacity,
        }
    }

    struct Refuse;

    impl PushTarget for Refuse {
        fn try_push(&mut self, block: Block) -> Result<PushAccepted, Block> {
            Err(block)
        }
    }

    struct Accept(usize);

    impl PushTarget for Accept {
        fn try_push(&mut self, _block: Block) -> Result<PushAccepted, Block> {
            self.0 += 1;
            Ok(PushAccepted { arm: true })
        }
    }

    #[test]
    fn test_capacity_two() {
        let mut bi = HeapInstance::new(&info(Direction::Input, 2));
        let a = bi.alloc_block(8).unwrap();
        let _b = bi.alloc_block(8).unwrap();
        assert_eq!(bi.alloc_block(8).unwrap_err(), NoSpace);
        assert_eq!(bi.in_flight(), 2);

        let _ = bi.free_block(a);
        assert_eq!(bi.in_flight(), 1);
        assert!(bi.alloc_block(8).is_ok());
    }

    #[test]
    fn test_in_flight_never_negative() {
        let mut bi = HeapInstance::new(&info(Direction::Input, 4));
        let stray = Block::new(4);
        let _ = bi.free_block(stray);
        assert_eq!(bi.in_flight(), 0);
    }

    #[test]
    fn test_fifo_and_payload() {
        let mut bi = HeapInstance::new(&info(Direction::Input, 4));
        for i in 0..3u8 {
            let mut block = bi.alloc_block(4).unwrap();
            block.data_mut().copy_from_slice(&[i, i + 1, i + 2, 0xff]);
            block.control_mut().seq_num = u32::from(i);
            let stored = bi.store_block(block, &mut NoPush).unwrap();
            // Only the first store into an empty queue wakes readers.
            assert_eq!(stored, Stored::Queued((i == 0).into()));
        }
        for i in 0..3u8 {
            let block = bi.retr_block().unwrap();
            assert_eq!(block.control().seq_num, u32::from(i));
            assert_eq!(block.data(), &[i, i + 1, i + 2, 0xff]);
            let _ = bi.free_block(block);
        }
        assert!(bi.retr_block().is_none());
        assert_eq!(bi.in_flight(), 0);
    }

    #[test]
    fn test_output_store_pushes_when_empty() {
        let mut bi = HeapInstance::new(&info(Direction::Output, 4));
        let mut trigger = Accept(0);
        let block = bi.alloc_block(4).unwrap();
        let stored = bi.store_block(block, &mut trigger).unwrap();
        assert_eq!(stored, Stored::Pushed(PushAccepted { arm: true }));
        assert_eq!(trigger.0, 1);
        assert_eq!(bi.queued(), 0);

        let block = bi.alloc_block(4).unwrap();
        let stored = bi.store_block(block, &mut Refuse).unwrap();
        assert_eq!(stored, Stored::Queued(Wakeup::NONE));
        assert_eq!(bi.queued(), 1);

        // Non-empty queue: no push attempt.
        let block = bi.alloc_block(4).unwrap();
        let _ = bi.store_block(block, &mut trigger).unwrap();
        assert_eq!(trigger.0, 1);
        assert_eq!(bi.queued(), 2);

        let block = bi.retr_block().unwrap();
        assert!(bi.free_block(block).is_needed());
    }

    #[test]
    fn test_byte_limit_and_flush() {
        let mut bi = HeapInstance::new(&info(Direction::Input, 16));
        bi.commit_store(BufferAttr::MaxKb.as_str(), 1);
        let first = bi.alloc_block(600).unwrap();
        assert!(bi.alloc_block(600).is_err());
        let _ = bi.store_block(first, &mut NoPush).unwrap();
        let second = bi.alloc_block(400).unwrap();
        let _ = bi.store_block(second, &mut NoPush).unwrap();

        let alloc_len = bi.attributes().get("allocated-buffer-len").unwrap().clone();
        assert_eq!(bi.info_get(&alloc_len), 2);

        let (count, _) = bi.flush();
        assert_eq!(count, 2);
        assert_eq!(bi.in_flight(), 0);
        assert_eq!(bi.queued(), 0);
    }
}
