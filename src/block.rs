use crate::control::Control;

/// A unit of acquired (or to-be-output) data: one control record plus the
/// sample payload.
///
/// A block has exactly one owner at any time: the buffer queue, a channel's
/// active slot, a channel's user slot, or the buffer that frees it.
#[derive(Debug)]
pub struct Block {
    control: Control,
    data: Vec<u8>,
    offset: usize,
    control_done: bool,
}

impl Block {
    pub fn new(datalen: usize) -> Self {
        Self {
            control: Control::new(),
            data: vec![0; datalen],
            offset: 0,
            control_done: false,
        }
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut Control {
        &mut self.control
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn datalen(&self) -> usize {
        self.data.len()
    }

    /// Bytes already moved to or from the user.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn unread(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    pub(crate) fn unwritten_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..]
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    pub fn is_control_done(&self) -> bool {
        self.control_done
    }

    pub(crate) fn set_control_done(&mut self) {
        self.control_done = true;
    }
}

/// Owned-or-empty holder for a channel's active or user block.
#[derive(Debug, Default)]
pub struct BlockSlot(Option<Block>);

impl BlockSlot {
    pub const fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn get(&self) -> Option<&Block> {
        self.0.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Block> {
        self.0.as_mut()
    }

    /// Put a block in an empty slot. An occupied slot hands the block back.
    pub fn install(&mut self, block: Block) -> Result<(), Block> {
        if self.0.is_some() {
            return Err(block);
        }
        self.0 = Some(block);
        Ok(())
    }

    pub fn take(&mut self) -> Option<Block> {
        self.0.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_single_owner() {
        let mut slot = BlockSlot::empty();
        assert!(slot.install(Block::new(4)).is_ok());
        let rejected = slot.install(Block::new(8));
        assert_eq!(rejected.map_err(|b| b.datalen()), Err(8));
        assert_eq!(slot.get().map(Block::datalen), Some(4));
        assert_eq!(slot.take().map(|b| b.datalen()), Some(4));
        assert!(slot.is_empty());
    }

    #[test]
    fn test_offset_is_clamped() {
        let mut block = Block::new(10);
        block.advance(6);
        assert_eq!(block.remaining(), 4);
        assert_eq!(block.unread().len(), 4);
        block.advance(100);
        assert_eq!(block.remaining(), 0);
        assert_eq!(block.offset(), 10);
    }
}
