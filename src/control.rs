use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of one control record on the control stream.
pub const CONTROL_SIZE: usize = 512;
pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

pub const MAX_STD_ATTR: usize = 16;
pub const MAX_EXT_ATTR: usize = 32;
pub const OBJ_NAME_LEN: usize = 12;
pub const HOST_ID_LEN: usize = 8;

const ATTR_GROUP_SIZE: usize = 8 + 4 * MAX_STD_ATTR + 4 * MAX_EXT_ATTR;
const FILL_SIZE: usize = 16;

bitflags! {
    /// Framework alarms carried in every control record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Alarms: u8 {
        /// A block could not be allocated or stored.
        const LOST_BLOCK = 0x01;
        /// The trigger fired while the previous cycle was still running.
        const LOST_TRIGGER = 0x02;
        const LOST_SNIPPET = 0x04;
        /// The last configuration request was rejected.
        const BAD_CONFIG = 0x08;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control record needs {CONTROL_SIZE} bytes, got {0}")]
    TooShort(usize),
}

/// Address of a channel: which host, device, channel set and channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Address {
    pub family: u16,
    pub host_type: u8,
    pub hostid: [u8; HOST_ID_LEN],
    pub dev_id: u32,
    pub cset: u16,
    pub chan: u16,
    pub devname: [u8; OBJ_NAME_LEN],
}

impl Address {
    pub fn devname(&self) -> String {
        name_from_bytes(&self.devname)
    }

    pub fn set_devname(&mut self, name: &str) {
        self.devname = name_to_bytes(name);
    }
}

/// Time of a trigger event: seconds, sub-second ticks (nanoseconds here)
/// and a driver-defined fine field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u64,
    pub ticks: u64,
    pub bins: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            ticks: u64::from(elapsed.subsec_nanos()),
            bins: 0,
        }
    }
}

/// One attribute group of a control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtrlAttr {
    pub std_mask: u16,
    pub ext_mask: u32,
    pub std_val: [u32; MAX_STD_ATTR],
    pub ext_val: [u32; MAX_EXT_ATTR],
}

impl CtrlAttr {
    pub fn set_std(&mut self, index: usize, value: u32) {
        if index < MAX_STD_ATTR {
            self.std_mask |= 1 << index;
            self.std_val[index] = value;
        }
    }

    pub fn set_ext(&mut self, index: usize, value: u32) {
        if index < MAX_EXT_ATTR {
            self.ext_mask |= 1 << index;
            self.ext_val[index] = value;
        }
    }

    pub fn std(&self, index: usize) -> Option<u32> {
        (index < MAX_STD_ATTR && self.std_mask & (1 << index) != 0).then(|| self.std_val[index])
    }

    pub fn ext(&self, index: usize) -> Option<u32> {
        (index < MAX_EXT_ATTR && self.ext_mask & (1 << index) != 0).then(|| self.ext_val[index])
    }

    fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.std_mask);
        buf.put_u16_le(0);
        buf.put_u32_le(self.ext_mask);
        for v in &self.std_val {
            buf.put_u32_le(*v);
        }
        for v in &self.ext_val {
            buf.put_u32_le(*v);
        }
    }

    fn get(buf: &mut impl Buf) -> Self {
        let mut attr = Self {
            std_mask: buf.get_u16_le(),
            ..Self::default()
        };
        buf.advance(2);
        attr.ext_mask = buf.get_u32_le();
        for v in &mut attr.std_val {
            *v = buf.get_u32_le();
        }
        for v in &mut attr.ext_val {
            *v = buf.get_u32_le();
        }
        attr
    }
}

/// The metadata record that travels with every block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub major_version: u8,
    pub minor_version: u8,
    pub alarms: Alarms,
    pub drv_alarms: u8,
    pub seq_num: u32,
    pub nsamples: u32,
    pub ssize: u16,
    pub nbits: u16,
    pub addr: Address,
    pub tstamp: Timestamp,
    pub mem_offset: u32,
    pub flags: u32,
    pub trigger_name: [u8; OBJ_NAME_LEN],
    pub attr_channel: CtrlAttr,
    pub attr_trigger: CtrlAttr,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            alarms: Alarms::empty(),
            drv_alarms: 0,
            seq_num: 0,
            nsamples: 0,
            ssize: 0,
            nbits: 0,
            addr: Address::default(),
            tstamp: Timestamp::default(),
            mem_offset: 0,
            flags: 0,
            trigger_name: [0; OBJ_NAME_LEN],
            attr_channel: CtrlAttr::default(),
            attr_trigger: CtrlAttr::default(),
        }
    }

    /// Payload length described by this control.
    pub fn datalen(&self) -> usize {
        self.nsamples as usize * usize::from(self.ssize)
    }

    pub fn trigger_name(&self) -> String {
        name_from_bytes(&self.trigger_name)
    }

    pub fn set_trigger_name(&mut self, name: &str) {
        self.trigger_name = name_to_bytes(name);
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.major_version);
        buf.put_u8(self.minor_version);
        buf.put_u8(self.alarms.bits());
        buf.put_u8(self.drv_alarms);
        buf.put_u32_le(self.seq_num);
        buf.put_u32_le(self.nsamples);
        buf.put_u16_le(self.ssize);
        buf.put_u16_le(self.nbits);

        buf.put_u16_le(self.addr.family);
        buf.put_u8(self.addr.host_type);
        buf.put_u8(0);
        buf.put_slice(&self.addr.hostid);
        buf.put_u32_le(self.addr.dev_id);
        buf.put_u16_le(self.addr.cset);
        buf.put_u16_le(self.addr.chan);
        buf.put_slice(&self.addr.devname);

        buf.put_u64_le(self.tstamp.secs);
        buf.put_u64_le(self.tstamp.ticks);
        buf.put_u64_le(self.tstamp.bins);

        buf.put_u32_le(self.mem_offset);
        buf.put_u32_le(0);
        buf.put_u32_le(self.flags);
        buf.put_slice(&self.trigger_name);

        self.attr_channel.put(buf);
        self.attr_trigger.put(buf);
        buf.put_bytes(0, FILL_SIZE);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_SIZE);
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Decode a record. Only the first [`CONTROL_SIZE`] bytes are used.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ControlError> {
        if bytes.len() < CONTROL_SIZE {
            return Err(ControlError::TooShort(bytes.len()));
        }
        let mut buf = &bytes[..CONTROL_SIZE];

        let major_version = buf.get_u8();
        let minor_version = buf.get_u8();
        let alarms = Alarms::from_bits_retain(buf.get_u8());
        let drv_alarms = buf.get_u8();
        let seq_num = buf.get_u32_le();
        let nsamples = buf.get_u32_le();
        let ssize = buf.get_u16_le();
        let nbits = buf.get_u16_le();

        let mut addr = Address {
            family: buf.get_u16_le(),
            host_type: buf.get_u8(),
            ..Address::default()
        };
        buf.advance(1);
        buf.copy_to_slice(&mut addr.hostid);
        addr.dev_id = buf.get_u32_le();
        addr.cset = buf.get_u16_le();
        addr.chan = buf.get_u16_le();
        buf.copy_to_slice(&mut addr.devname);

        let tstamp = Timestamp {
            secs: buf.get_u64_le(),
            ticks: buf.get_u64_le(),
            bins: buf.get_u64_le(),
        };

        let mem_offset = buf.get_u32_le();
        buf.advance(4);
        let flags = buf.get_u32_le();
        let mut trigger_name = [0; OBJ_NAME_LEN];
        buf.copy_to_slice(&mut trigger_name);

        let attr_channel = CtrlAttr::get(&mut buf);
        let attr_trigger = CtrlAttr::get(&mut buf);
        debug_assert_eq!(buf.remaining(), FILL_SIZE);

        Ok(Self {
            major_version,
            minor_version,
            alarms,
            drv_alarms,
            seq_num,
            nsamples,
            ssize,
            nbits,
            addr,
            tstamp,
            mem_offset,
            flags,
            trigger_name,
            attr_channel,
            attr_trigger,
        })
    }
}

fn name_to_bytes(name: &str) -> [u8; OBJ_NAME_LEN] {
    let mut out = [0; OBJ_NAME_LEN];
    let len = name.len().min(OBJ_NAME_LEN);
    out[..len].copy_from_slice(&name.as_bytes()[..len]);
    out
}

fn name_from_bytes(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// Layout is fixed by the wire format.
const _: () = assert!(ATTR_GROUP_SIZE == 200);
const _: () = assert!(96 + 2 * ATTR_GROUP_SIZE + FILL_SIZE == CONTROL_SIZE);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_control() -> Control {
        let mut ctrl = Control::new();
        ctrl.alarms = Alarms::LOST_BLOCK | Alarms::BAD_CONFIG;
        ctrl.drv_alarms = 0x40;
        ctrl.seq_num = 0xdead_beef;
        ctrl.nsamples = 1024;
        ctrl.ssize = 2;
        ctrl.nbits = 12;
        ctrl.addr.dev_id = 0x0102_0304;
        ctrl.addr.cset = 3;
        ctrl.addr.chan = 7;
        ctrl.addr.set_devname("adc-1x4");
        ctrl.tstamp = Timestamp {
            secs: 1_700_000_000,
            ticks: 999,
            bins: 5,
        };
        ctrl.set_trigger_name("timer");
        ctrl.attr_channel.set_std(0, 12);
        ctrl.attr_channel.set_ext(31, 77);
        ctrl.attr_trigger.set_std(2, 1024);
        ctrl
    }

    #[test]
    fn test_encoded_size_and_offsets() {
        let bytes = sample_control().to_bytes();
        assert_eq!(bytes.len(), CONTROL_SIZE);

        assert_eq!(bytes[0], MAJOR_VERSION);
        assert_eq!(bytes[2], 0x09);
        assert_eq!(&bytes[4..8], &0xdead_beef_u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1024_u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &2_u16.to_le_bytes());
        // address: dev_id after family, host type, filler and host id
        assert_eq!(&bytes[28..32], &0x0102_0304_u32.to_le_bytes());
        assert_eq!(&bytes[36..43], b"adc-1x4");
        assert_eq!(&bytes[48..56], &1_700_000_000_u64.to_le_bytes());
        assert_eq!(&bytes[84..89], b"timer");
        // channel group std mask, then trigger group
        assert_eq!(&bytes[96..98], &1_u16.to_le_bytes());
        assert_eq!(&bytes[296..298], &(1_u16 << 2).to_le_bytes());
        assert!(bytes[496..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_decode_matches_encode() {
        let ctrl = sample_control();
        let decoded = Control::from_bytes(&ctrl.to_bytes()).unwrap();
        assert_eq!(decoded, ctrl);
        assert_eq!(decoded.addr.devname(), "adc-1x4");
        assert_eq!(decoded.trigger_name(), "timer");
        assert_eq!(decoded.attr_channel.ext(31), Some(77));
        assert_eq!(decoded.attr_channel.ext(30), None);
        assert_eq!(decoded.datalen(), 2048);
    }

    #[test]
    fn test_short_record_rejected() {
        let bytes = sample_control().to_bytes();
        assert!(matches!(
            Control::from_bytes(&bytes[..100]),
            Err(ControlError::TooShort(100))
        ));
    }

    #[test]
    fn test_long_names_truncated() {
        let mut addr = Address::default();
        addr.set_devname("a-very-long-device-name");
        assert_eq!(addr.devname(), "a-very-long-");
    }
}
