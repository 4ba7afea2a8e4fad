//! Control and data streams of a channel.
//!
//! Input channels are read, output channels written. The control stream
//! moves one [`CONTROL_SIZE`] record at a time, the data stream moves
//! payload bytes of the block the control belongs to.

use crate::attribute::Attribute;
use crate::block::Block;
use crate::buffer::{NoSpace, Stored};
use crate::config::ConfigError;
use crate::control::{Alarms, Control, ControlError, CONTROL_SIZE};
use crate::cset::{ChannelSet, CsetInner, Direction, Wakeups};
use crate::trigger::{TriggerPush, TriggerState};
use bitflags::bitflags;
use parking_lot::MutexGuard;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Control,
    Data,
}

/// How a [`ChannelFile`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub nonblocking: bool,
    pub timeout: Option<Duration>,
}

impl OpenFlags {
    pub fn non_blocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollFlags: u8 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
        /// The channel is being unregistered.
        const HANGUP = 0b100;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("Operation not valid on an {0} channel")]
    WrongDirection(Direction),

    #[error("Operation not valid on the {0:?} stream")]
    WrongStream(Stream),

    #[error("Control transfers need {CONTROL_SIZE} bytes, got {0}")]
    ControlSize(usize),

    #[error("Operation would block")]
    WouldBlock,

    #[error("Interrupted while waiting")]
    Interrupted,

    #[error("Timed out while waiting")]
    TimedOut,

    #[error(transparent)]
    NoSpace(#[from] NoSpace),

    #[error("Channel is not available")]
    NoDevice,

    #[error("Malformed control: {0}")]
    Control(#[from] ControlError),

    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        let kind = match &e {
            IoError::WouldBlock => io::ErrorKind::WouldBlock,
            IoError::Interrupted => io::ErrorKind::Interrupted,
            IoError::TimedOut => io::ErrorKind::TimedOut,
            IoError::NoSpace(_) => io::ErrorKind::OutOfMemory,
            IoError::NoDevice => io::ErrorKind::NotConnected,
            IoError::WrongDirection(_)
            | IoError::WrongStream(_)
            | IoError::ControlSize(_)
            | IoError::Control(_)
            | IoError::Config(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}

/// Wakes a [`ChannelFile`] blocked in `read` or `write` from another
/// thread; the call returns [`IoError::Interrupted`].
#[derive(Debug, Clone)]
pub struct Interrupter {
    cset: Arc<ChannelSet>,
    chan: usize,
    flag: Arc<AtomicBool>,
}

impl Interrupter {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        // Holding the lock orders this against the waiter's check.
        let _guard = self.cset.inner.lock();
        if let Some(waiter) = self.cset.waiter(self.chan) {
            waiter.notify_all();
        }
    }
}

/// An open control or data stream of one channel.
#[derive(Debug)]
pub struct ChannelFile {
    cset: Arc<ChannelSet>,
    chan: usize,
    stream: Stream,
    flags: OpenFlags,
    interrupted: Arc<AtomicBool>,
}

impl ChannelFile {
    pub(crate) fn open(
        cset: Arc<ChannelSet>,
        chan: usize,
        stream: Stream,
        flags: OpenFlags,
    ) -> Result<Self, IoError> {
        if cset.is_dying() || chan >= cset.n_channels() {
            return Err(IoError::NoDevice);
        }
        cset.file_opened();
        log::debug!("opened {}", cset.node_name(chan, stream == Stream::Control));
        Ok(Self {
            cset,
            chan,
            stream,
            flags,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn channel(&self) -> usize {
        self.chan
    }

    pub fn cset(&self) -> &Arc<ChannelSet> {
        &self.cset
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            cset: self.cset.clone(),
            chan: self.chan,
            flag: self.interrupted.clone(),
        }
    }

    /// Read from an input channel. A control read needs a buffer of at
    /// least [`CONTROL_SIZE`] bytes and returns exactly that many.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.cset.direction().is_output() {
            return Err(IoError::WrongDirection(Direction::Output));
        }
        if self.stream == Stream::Control && buf.len() < CONTROL_SIZE {
            return Err(IoError::ControlSize(buf.len()));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut w = Wakeups::default();
        let result = {
            let mut guard = self.cset.inner.lock();
            self.read_locked(&mut guard, buf, &mut w)
        };
        self.cset.wake(w);
        result
    }

    /// Write to an output channel. A control write is validated (and
    /// applied, if its attributes differ) before any block is touched.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        if self.cset.direction().is_input() {
            return Err(IoError::WrongDirection(Direction::Input));
        }
        let control = match self.stream {
            Stream::Control => {
                if buf.len() < CONTROL_SIZE {
                    return Err(IoError::ControlSize(buf.len()));
                }
                Some(Control::from_bytes(buf)?)
            }
            Stream::Data if buf.is_empty() => return Ok(0),
            Stream::Data => None,
        };

        let mut w = Wakeups::default();
        let mut mirrored = Vec::new();
        let result = {
            let mut guard = self.cset.inner.lock();
            match &control {
                Some(control) => self
                    .write_control_locked(&mut guard, control, &mut w, &mut mirrored)
                    .map(|()| CONTROL_SIZE),
                None => self.write_data_locked(&mut guard, buf, &mut w),
            }
        };
        self.cset.wake(w);
        self.cset.mirror_device_attrs(&mirrored);
        result.map_err(|e| match e {
            IoError::WouldBlock => IoError::NoSpace(NoSpace),
            e => e,
        })
    }

    pub fn read_control(&mut self) -> Result<Control, IoError> {
        if self.stream != Stream::Control {
            return Err(IoError::WrongStream(self.stream));
        }
        let mut buf = [0; CONTROL_SIZE];
        self.read(&mut buf)?;
        Ok(Control::from_bytes(&buf)?)
    }

    pub fn write_control(&mut self, control: &Control) -> Result<(), IoError> {
        if self.stream != Stream::Control {
            return Err(IoError::WrongStream(self.stream));
        }
        self.write(&control.to_bytes()).map(|_| ())
    }

    /// Readiness without waiting. An output channel allocates the block it
    /// reports as writable and keeps it for the next write.
    pub fn poll(&self) -> PollFlags {
        let mut w = Wakeups::default();
        let flags = {
            let mut guard = self.cset.inner.lock();
            let inner = &mut *guard;
            if self.cset.is_dying() {
                PollFlags::HANGUP
            } else if self.cset.direction().is_input() {
                if self.cset.read_ready(inner, self.chan, self.stream, &mut w) {
                    PollFlags::READABLE
                } else {
                    PollFlags::empty()
                }
            } else if self.cset.write_ready(inner, self.chan, self.stream, &mut w) {
                PollFlags::WRITABLE
            } else {
                PollFlags::empty()
            }
        };
        self.cset.wake(w);
        flags
    }

    /// Block until `ready` holds, re-checking after every wake-up.
    fn wait_until<F>(
        &self,
        guard: &mut MutexGuard<'_, CsetInner>,
        w: &mut Wakeups,
        mut ready: F,
    ) -> Result<(), IoError>
    where
        F: FnMut(&ChannelSet, &mut CsetInner, &mut Wakeups) -> bool,
    {
        let deadline = self.flags.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        loop {
            if self.cset.is_dying() {
                return Err(IoError::NoDevice);
            }
            if ready(&*self.cset, &mut **guard, w) {
                return Ok(());
            }
            if self.flags.nonblocking {
                return Err(IoError::WouldBlock);
            }
            if timed_out {
                return Err(IoError::TimedOut);
            }
            if !w.is_empty() {
                // Deliver what we owe other waiters before sleeping.
                let pending = std::mem::take(w);
                MutexGuard::unlocked(guard, || self.cset.wake(pending));
                continue;
            }
            if self.interrupted.swap(false, Ordering::AcqRel) {
                return Err(IoError::Interrupted);
            }
            let Some(waiter) = self.cset.waiter(self.chan) else {
                return Err(IoError::NoDevice);
            };
            match deadline {
                Some(deadline) => timed_out = waiter.wait_until(guard, deadline).timed_out(),
                None => waiter.wait(guard),
            }
        }
    }

    fn read_locked(
        &self,
        guard: &mut MutexGuard<'_, CsetInner>,
        buf: &mut [u8],
        w: &mut Wakeups,
    ) -> Result<usize, IoError> {
        let (chan, stream) = (self.chan, self.stream);
        self.wait_until(guard, w, |cset, inner, w| {
            cset.read_ready(inner, chan, stream, w)
        })?;

        let ch = &mut guard.channels[chan];
        let Some(block) = ch.user.get_mut() else {
            return Ok(0);
        };
        let (n, drained) = match stream {
            Stream::Control => {
                let mut out = &mut buf[..CONTROL_SIZE];
                block.control().write_to(&mut out);
                block.set_control_done();
                (CONTROL_SIZE, block.datalen() == 0)
            }
            Stream::Data => {
                let n = buf.len().min(block.remaining());
                buf[..n].copy_from_slice(&block.unread()[..n]);
                block.advance(n);
                (n, block.remaining() == 0)
            }
        };
        if drained {
            if let Some(block) = ch.user.take() {
                w.add(chan, ch.bi.free_block(block));
            }
        }
        Ok(n)
    }

    /// The block for the written control is reserved before anything is
    /// configured: a write that cannot get one changes nothing.
    fn write_control_locked(
        &self,
        guard: &mut MutexGuard<'_, CsetInner>,
        control: &Control,
        w: &mut Wakeups,
        mirrored: &mut Vec<Attribute>,
    ) -> Result<(), IoError> {
        let chan = self.chan;
        self.cset.plan_configure(&**guard, chan, control)?;

        let datalen = control.datalen();
        let mut reserved = None;
        self.wait_until(guard, w, |cset, inner, w| {
            reserved = cset.reserve_block(inner, chan, datalen, w);
            reserved.is_some()
        })?;
        let Some(mut block) = reserved else {
            return Err(IoError::NoSpace(NoSpace));
        };

        let inner = &mut **guard;
        // Waiting may have let another writer reconfigure the set.
        let configured = self
            .cset
            .plan_configure(inner, chan, control)
            .and_then(|plan| {
                if plan.is_empty() {
                    Ok(())
                } else {
                    self.cset.configure_locked(inner, chan, control, w, mirrored)
                }
            });
        if let Err(e) = configured {
            w.add(chan, inner.channels[chan].bi.free_block(block));
            return Err(e.into());
        }

        *block.control_mut() = control.clone();
        block.set_control_done();
        let ch = &mut inner.channels[chan];
        if let Some(old) = ch.user.take() {
            w.add(chan, ch.bi.free_block(old));
        }
        if block.datalen() == 0 {
            self.cset.store_user_block(inner, chan, block, w);
        } else if let Err(block) = ch.user.install(block) {
            w.add(chan, ch.bi.free_block(block));
        }
        Ok(())
    }

    fn write_data_locked(
        &self,
        guard: &mut MutexGuard<'_, CsetInner>,
        buf: &[u8],
        w: &mut Wakeups,
    ) -> Result<usize, IoError> {
        let chan = self.chan;
        self.wait_until(guard, w, |cset, inner, w| {
            cset.write_ready(inner, chan, Stream::Data, w)
        })?;

        let inner = &mut **guard;
        let ch = &mut inner.channels[chan];
        let Some(block) = ch.user.get_mut() else {
            return Ok(0);
        };
        let n = buf.len().min(block.remaining());
        block.unwritten_mut()[..n].copy_from_slice(&buf[..n]);
        block.advance(n);

        if block.remaining() == 0 {
            if let Some(block) = ch.user.take() {
                self.cset.store_user_block(inner, chan, block, w);
            }
        }
        Ok(n)
    }
}

impl Drop for ChannelFile {
    fn drop(&mut self) {
        let mut w = Wakeups::default();
        {
            let mut inner = self.cset.inner.lock();
            if let Some(ch) = inner.channels.get_mut(self.chan) {
                if let Some(block) = ch.user.take() {
                    w.add(self.chan, ch.bi.free_block(block));
                }
            }
        }
        self.cset.wake(w);
        self.cset.file_closed();
    }
}

impl io::Read for ChannelFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(ChannelFile::read(self, buf)?)
    }
}

impl io::Write for ChannelFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(ChannelFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ChannelSet {
    /// Whether a read on `stream` of input channel `chan` can proceed.
    /// May pull a block from the buffer, or ask the trigger for one.
    pub(crate) fn read_ready(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        stream: Stream,
        w: &mut Wakeups,
    ) -> bool {
        let Some(ch) = inner.channels.get_mut(chan) else {
            return false;
        };
        // A block whose control was already read is stale for the control
        // stream: move on to the next one.
        if stream == Stream::Control && ch.user.get().is_some_and(Block::is_control_done) {
            if let Some(block) = ch.user.take() {
                w.add(chan, ch.bi.free_block(block));
            }
        }
        if ch.user.is_empty() {
            self.fetch_input_block(inner, chan, w);
        }
        match inner.channels[chan].user.get() {
            None => false,
            Some(_) if stream == Stream::Control => true,
            Some(block) => block.remaining() > 0,
        }
    }

    fn fetch_input_block(&self, inner: &mut CsetInner, chan: usize, w: &mut Wakeups) {
        let mut block = inner.channels[chan].bi.retr_block();
        if block.is_none()
            && inner.trigger.state() == TriggerState::Idle
            && inner.trigger.pull_block(chan)
        {
            self.arm_locked(inner, w);
            block = inner.channels[chan].bi.retr_block();
        }
        if let Some(block) = block {
            let ch = &mut inner.channels[chan];
            if let Err(block) = ch.user.install(block) {
                w.add(chan, ch.bi.free_block(block));
            }
        }
    }

    /// Whether a write on output channel `chan` can proceed. Makes sure a
    /// user block is in place.
    pub(crate) fn write_ready(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        stream: Stream,
        w: &mut Wakeups,
    ) -> bool {
        let datalen = self.ssize() * inner.trigger.nsamples() as usize;
        let Some(ch) = inner.channels.get_mut(chan) else {
            return false;
        };
        if stream == Stream::Data && datalen == 0 {
            return false;
        }
        if !ch.user.is_empty() {
            return true;
        }
        let Ok(mut block) = ch.bi.alloc_block(datalen) else {
            return false;
        };
        *block.control_mut() = ch.ctrl.clone();
        if let Err(block) = ch.user.install(block) {
            w.add(chan, ch.bi.free_block(block));
        }
        true
    }

    /// Allocate a block of `datalen` bytes for output channel `chan`. When
    /// the buffer is full, a held user block is given up to make room.
    pub(crate) fn reserve_block(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        datalen: usize,
        w: &mut Wakeups,
    ) -> Option<Block> {
        let ch = inner.channels.get_mut(chan)?;
        if let Ok(block) = ch.bi.alloc_block(datalen) {
            return Some(block);
        }
        let old = ch.user.take()?;
        w.add(chan, ch.bi.free_block(old));
        ch.bi.alloc_block(datalen).ok()
    }

    /// Hand a finished output block to the buffer, which may push it
    /// straight to the trigger.
    pub(crate) fn store_user_block(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        block: Block,
        w: &mut Wakeups,
    ) {
        let outcome = {
            let CsetInner {
                trigger, channels, ..
            } = &mut *inner;
            let ch = &mut channels[chan];
            let mut push = TriggerPush {
                trigger,
                slot: &mut ch.active,
                chan,
            };
            ch.bi.store_block(block, &mut push)
        };
        match outcome {
            Ok(Stored::Queued(wake)) => w.add(chan, wake),
            Ok(Stored::Pushed(accepted)) => {
                if accepted.arm {
                    self.arm_locked(inner, w);
                }
            }
            Err(block) => {
                log::warn!("{}: channel {chan} could not store a block", self.name());
                let ch = &mut inner.channels[chan];
                ch.ctrl.alarms |= Alarms::LOST_BLOCK;
                w.add(chan, ch.bi.free_block(block));
            }
        }
    }
}
