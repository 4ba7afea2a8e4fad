use crate::control::{CtrlAttr, MAX_EXT_ATTR};
use crate::device::DriverError;
use bitflags::bitflags;

bitflags! {
    /// Access rights of an attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrMode: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// Standard attributes of devices, channel sets and channels.
///
/// The discriminant is the slot in the `std_val` array of the channel
/// attribute group of a [`Control`](crate::Control).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttr {
    ResolutionBits = 0,
    GainFactor = 1,
    Offset = 2,
    MaxSampleRate = 3,
    VrefSrc = 4,
}

impl DeviceAttr {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAttr::ResolutionBits => "resolution-bits",
            DeviceAttr::GainFactor => "gain_factor",
            DeviceAttr::Offset => "offset",
            DeviceAttr::MaxSampleRate => "max-sample-rate",
            DeviceAttr::VrefSrc => "vref-src",
        }
    }
}

/// Standard trigger attributes, stored in the trigger attribute group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAttr {
    NShots = 0,
    PreSamples = 1,
    PostSamples = 2,
}

impl TriggerAttr {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerAttr::NShots => "nshots",
            TriggerAttr::PreSamples => "pre-samples",
            TriggerAttr::PostSamples => "post-samples",
        }
    }
}

/// Standard buffer attributes. Buffers never appear in the control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAttr {
    MaxLen = 0,
    MaxKb = 1,
    AllocatedLen = 2,
}

impl BufferAttr {
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferAttr::MaxLen => "max-buffer-len",
            BufferAttr::MaxKb => "max-buffer-kb",
            BufferAttr::AllocatedLen => "allocated-buffer-len",
        }
    }
}

pub const VERSION_ATTR: &str = "version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Standard(usize),
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Device,
    Cset,
    Channel,
    Trigger,
    Buffer,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Device => "device",
            ObjectKind::Cset => "cset",
            ObjectKind::Channel => "channel",
            ObjectKind::Trigger => "trigger",
            ObjectKind::Buffer => "buffer",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    #[error("No attribute named '{0}'")]
    NotFound(String),

    #[error("Attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("Value {value} for '{name}' outside of [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Too many extended control attributes ({count}, max {MAX_EXT_ATTR})")]
    TooManyExtended { count: usize },

    #[error("Driver rejected attribute '{name}': {source}")]
    Driver {
        name: String,
        #[source]
        source: DriverError,
    },
}

/// A named integer setting of a device, channel set, channel, trigger or buffer.
///
/// Control attributes are mirrored into every affected channel's current
/// [`Control`](crate::Control); parameters are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    kind: AttrKind,
    mode: AttrMode,
    control: bool,
    index: Option<usize>,
    id: u64,
    value: u32,
    min: u32,
    max: u32,
}

impl Attribute {
    /// A standard device/cset/channel attribute with its well-known name.
    pub fn device(which: DeviceAttr, value: u32) -> Self {
        Self::standard(which.index(), which.as_str(), value)
    }

    pub fn trigger(which: TriggerAttr, value: u32) -> Self {
        Self::standard(which.index(), which.as_str(), value)
    }

    pub fn buffer(which: BufferAttr, value: u32) -> Self {
        // Buffer attributes never reach the control record.
        Self::standard(which.index(), which.as_str(), value).parameter()
    }

    pub fn standard(index: usize, name: impl Into<String>, value: u32) -> Self {
        Self {
            name: name.into(),
            kind: AttrKind::Standard(index),
            mode: AttrMode::READ_WRITE,
            control: true,
            index: Some(index),
            id: 0,
            value,
            min: 0,
            max: 0,
        }
    }

    /// An extended control attribute. Its control index is assigned at
    /// registration time.
    pub fn extended(name: impl Into<String>, value: u32) -> Self {
        Self {
            name: name.into(),
            kind: AttrKind::Extended,
            mode: AttrMode::READ_WRITE,
            control: true,
            index: None,
            id: 0,
            value,
            min: 0,
            max: 0,
        }
    }

    /// The read-only `version` attribute every object carries.
    pub fn version(value: u32) -> Self {
        Self::extended(VERSION_ATTR, value).parameter().read_only()
    }

    /// Keep the attribute out of the control record.
    pub fn parameter(mut self) -> Self {
        self.control = false;
        self.index = None;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.mode = AttrMode::READ;
        self
    }

    pub fn range(mut self, min: u32, max: u32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Driver-private identifier, usually a register address.
    pub fn id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AttrKind {
        self.kind
    }

    pub fn mode(&self) -> AttrMode {
        self.mode
    }

    pub fn is_control(&self) -> bool {
        self.control
    }

    pub fn is_extended(&self) -> bool {
        self.kind == AttrKind::Extended
    }

    /// Slot in the control arrays, if this attribute is mirrored there.
    pub fn control_index(&self) -> Option<usize> {
        if self.control {
            self.index
        } else {
            None
        }
    }

    pub fn driver_id(&self) -> u64 {
        self.id
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// `min == max` means the attribute accepts any value.
    pub fn has_range(&self) -> bool {
        self.min != self.max
    }

    pub fn check_value(&self, value: u32) -> Result<(), AttributeError> {
        if !self.mode.contains(AttrMode::WRITE) {
            return Err(AttributeError::ReadOnly(self.name.clone()));
        }
        if self.has_range() && (value < self.min || value > self.max) {
            return Err(AttributeError::OutOfRange {
                name: self.name.clone(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }

    pub(crate) fn set_value(&mut self, value: u32) {
        self.value = value;
    }

    /// Mirror this attribute into a control attribute group.
    pub(crate) fn write_into(&self, group: &mut CtrlAttr) {
        match (self.kind, self.control_index()) {
            (AttrKind::Standard(_), Some(i)) => group.set_std(i, self.value),
            (AttrKind::Extended, Some(i)) => group.set_ext(i, self.value),
            _ => {}
        }
    }
}

/// One entry of a control attribute diff, as handed to trigger and device
/// configuration callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrChange {
    pub extended: bool,
    pub index: usize,
    pub value: u32,
}

/// Standard and extended attributes of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    standard: Vec<Attribute>,
    extended: Vec<Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attr: Attribute) -> Self {
        self.push(attr);
        self
    }

    /// Add an attribute. A standard attribute replaces any previous one
    /// with the same index; any attribute replaces one with the same name.
    pub fn push(&mut self, attr: Attribute) {
        self.standard.retain(|a| a.name != attr.name);
        self.extended.retain(|a| a.name != attr.name);
        match attr.kind {
            AttrKind::Standard(i) => {
                self.standard.retain(|a| a.kind != AttrKind::Standard(i));
                self.standard.push(attr);
            }
            AttrKind::Extended => self.extended.push(attr),
        }
    }

    pub fn len(&self) -> usize {
        self.standard.len() + self.extended.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.standard.iter().chain(self.extended.iter())
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.iter().find(|a| a.name == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.standard
            .iter_mut()
            .chain(self.extended.iter_mut())
            .find(|a| a.name == name)
    }

    pub fn value(&self, name: &str) -> Option<u32> {
        self.get(name).map(Attribute::value)
    }

    pub fn standard(&self, index: usize) -> Option<&Attribute> {
        self.standard
            .iter()
            .find(|a| a.kind == AttrKind::Standard(index))
    }

    /// Look an attribute up by its place in the control arrays.
    pub fn find(&self, extended: bool, index: usize) -> Option<&Attribute> {
        let list = if extended {
            &self.extended
        } else {
            &self.standard
        };
        list.iter().find(|a| a.control_index() == Some(index))
    }

    /// Assign control indices to extended control attributes, starting at
    /// `start`. Returns the next free index.
    pub(crate) fn number_extended(&mut self, start: usize) -> Result<usize, AttributeError> {
        let mut next = start;
        for attr in self.extended.iter_mut().filter(|a| a.control) {
            attr.index = Some(next);
            next += 1;
        }
        if next > MAX_EXT_ATTR {
            return Err(AttributeError::TooManyExtended { count: next });
        }
        Ok(next)
    }

    /// Copy every control attribute into `group`, setting the masks.
    pub(crate) fn write_into(&self, group: &mut CtrlAttr) {
        for attr in self.iter() {
            attr.write_into(group);
        }
    }
}

/// Anything that owns an [`AttributeSet`]: devices, channel sets,
/// channels, trigger instances and buffer instances.
pub trait AttributeHost {
    fn object_kind(&self) -> ObjectKind;
    fn attributes(&self) -> &AttributeSet;
    fn attributes_mut(&mut self) -> &mut AttributeSet;

    /// Validate a store by name and hand back a copy of the attribute.
    fn prepare_store(&self, name: &str, value: u32) -> Result<Attribute, AttributeError> {
        let attr = self
            .attributes()
            .get(name)
            .ok_or_else(|| AttributeError::NotFound(name.to_string()))?;
        attr.check_value(value)?;
        Ok(attr.clone())
    }

    /// Record a value that the driver has already accepted.
    fn commit_store(&mut self, name: &str, value: u32) -> Option<Attribute> {
        let kind = self.object_kind();
        let attr = self.attributes_mut().get_mut(name)?;
        attr.set_value(value);
        log::trace!("{} attribute '{name}' = {value}", kind.as_str());
        Some(attr.clone())
    }
}

/// Where a control attribute lives along a channel's lookup chain.
pub(crate) fn locate(hosts: &[&dyn AttributeHost], extended: bool, index: usize) -> Option<usize> {
    hosts
        .iter()
        .position(|h| h.attributes().find(extended, index).is_some())
}
