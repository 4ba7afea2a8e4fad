//! Reconfiguration from a control record.
//!
//! A requested control is validated against the channel's current one and
//! its attribute groups are diffed into a plan. Every check runs while
//! building the plan, so a failing request leaves everything untouched. The
//! plan is then applied with the trigger stopped.

use crate::attribute::{
    locate, AttrChange, Attribute, AttributeError, AttributeHost, AttributeSet, DeviceAttr,
    TriggerAttr,
};
use crate::control::{Alarms, Control, CtrlAttr, MAX_EXT_ATTR, MAX_STD_ATTR};
use crate::cset::{ChannelSet, CsetInner, Wakeups};
use crate::device::{AttrTarget, DriverError};
use crate::trigger::{trigger_template, TriggerType};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Control version {requested} does not match {current}")]
    VersionMismatch { current: u8, requested: u8 },

    #[error("Sample size {requested} does not match {current}")]
    SampleSizeMismatch { current: u16, requested: u16 },

    #[error("Control addresses a different channel")]
    AddressMismatch,

    #[error("Sample count {requested} does not match {expected}")]
    SampleCountMismatch { expected: u32, requested: u32 },

    #[error("Bit width {requested} does not match resolution {resolution}")]
    BitWidthMismatch { resolution: u32, requested: u16 },

    #[error("Unknown trigger type '{0}'")]
    UnknownTrigger(String),

    #[error("No attribute at control index {index} (extended: {extended})")]
    UnknownAttribute { extended: bool, index: usize },

    #[error("Invalid attribute value: {0}")]
    Attribute(#[from] AttributeError),

    #[error("Trigger rejected configuration: {0}")]
    TriggerRejected(#[source] DriverError),

    #[error("Device rejected configuration: {0}")]
    DeviceRejected(#[source] DriverError),
}

/// Check that `requested` may be applied over `current`.
///
/// `multiplier` is the factor the trigger applies to pre plus post samples
/// (the physical channel count on an active interleaved channel).
pub(crate) fn validate(
    current: &Control,
    requested: &Control,
    multiplier: u32,
) -> Result<(), ConfigError> {
    if requested.major_version != current.major_version {
        return Err(ConfigError::VersionMismatch {
            current: current.major_version,
            requested: requested.major_version,
        });
    }
    if requested.minor_version != current.minor_version {
        log::warn!(
            "control minor version {} differs from {}",
            requested.minor_version,
            current.minor_version
        );
    }
    if requested.ssize != current.ssize {
        return Err(ConfigError::SampleSizeMismatch {
            current: current.ssize,
            requested: requested.ssize,
        });
    }
    let (a, b) = (&requested.addr, &current.addr);
    if a.dev_id != b.dev_id || a.cset != b.cset || a.chan != b.chan || a.devname != b.devname {
        return Err(ConfigError::AddressMismatch);
    }

    let trig = &requested.attr_trigger;
    let pre = trig.std(TriggerAttr::PreSamples.index());
    let post = trig.std(TriggerAttr::PostSamples.index());
    let expected = if pre.is_some() || post.is_some() {
        pre.unwrap_or(0)
            .saturating_add(post.unwrap_or(0))
            .saturating_mul(multiplier)
    } else {
        current.nsamples
    };
    if requested.nsamples != expected {
        return Err(ConfigError::SampleCountMismatch {
            expected,
            requested: requested.nsamples,
        });
    }

    if let Some(resolution) = requested
        .attr_channel
        .std(DeviceAttr::ResolutionBits.index())
    {
        if u32::from(requested.nbits) != resolution {
            return Err(ConfigError::BitWidthMismatch {
                resolution,
                requested: requested.nbits,
            });
        }
    }
    Ok(())
}

/// Entries present in both masks whose values differ.
pub(crate) fn diff(old: &CtrlAttr, new: &CtrlAttr) -> Vec<AttrChange> {
    let std_mask = old.std_mask & new.std_mask;
    let ext_mask = old.ext_mask & new.ext_mask;
    let standard = (0..MAX_STD_ATTR)
        .filter(|i| std_mask & (1 << i) != 0 && old.std_val[*i] != new.std_val[*i])
        .map(|index| AttrChange {
            extended: false,
            index,
            value: new.std_val[index],
        });
    let extended = (0..MAX_EXT_ATTR)
        .filter(|i| ext_mask & (1 << i) != 0 && old.ext_val[*i] != new.ext_val[*i])
        .map(|index| AttrChange {
            extended: true,
            index,
            value: new.ext_val[index],
        });
    standard.chain(extended).collect()
}

/// Object that owns a device-group attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Channel,
    Cset,
    Device,
}

/// A checked request: everything that will change, and nothing else.
pub(crate) struct ConfigPlan {
    trigger: Option<(Arc<dyn TriggerType>, AttributeSet)>,
    trigger_changes: Vec<(Attribute, u32)>,
    device_changes: Vec<(Owner, Attribute, u32)>,
}

impl ConfigPlan {
    pub(crate) fn is_empty(&self) -> bool {
        self.trigger.is_none() && self.trigger_changes.is_empty() && self.device_changes.is_empty()
    }
}

impl ChannelSet {
    /// Apply the attributes of `requested` to channel `chan` and its set.
    ///
    /// A trigger name different from the current one swaps the trigger
    /// first. On rejection by the trigger or the driver,
    /// [`Alarms::BAD_CONFIG`] is raised in the channel's current control.
    /// In every case the trigger comes back to the enabled state it had,
    /// and is re-armed if it was armed.
    pub fn configure(&self, chan: usize, requested: &Control) -> Result<(), ConfigError> {
        let mut w = Wakeups::default();
        let mut mirrored = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            self.configure_locked(&mut inner, chan, requested, &mut w, &mut mirrored)
        };
        self.wake(w);
        self.mirror_device_attrs(&mirrored);
        result
    }

    pub(crate) fn validate_locked(
        &self,
        inner: &CsetInner,
        chan: usize,
        requested: &Control,
    ) -> Result<(), ConfigError> {
        let current = &inner
            .channels
            .get(chan)
            .ok_or(ConfigError::AddressMismatch)?
            .ctrl;
        let multiplier = if self.interleave_active(inner) && self.interleave_index() == Some(chan) {
            self.n_physical() as u32
        } else {
            1
        };
        validate(current, requested, multiplier)
    }

    /// Validate `requested` and resolve every change it carries.
    pub(crate) fn plan_configure(
        &self,
        inner: &CsetInner,
        chan: usize,
        requested: &Control,
    ) -> Result<ConfigPlan, ConfigError> {
        self.validate_locked(inner, chan, requested)?;
        let current = &inner.channels[chan].ctrl;

        let name = requested.trigger_name();
        let trigger = if !name.is_empty() && name != inner.trigger.type_name() {
            let ttype = self
                .device
                .triggers
                .find(&name)
                .ok_or(ConfigError::UnknownTrigger(name))?;
            let attrs = trigger_template(&*ttype)?;
            Some((ttype, attrs))
        } else {
            None
        };

        let (trigger_attrs, trigger_base) = match &trigger {
            Some((_, attrs)) => {
                let mut base = CtrlAttr::default();
                attrs.write_into(&mut base);
                (attrs, base)
            }
            None => (inner.trigger.attributes(), current.attr_trigger.clone()),
        };
        let trigger_changes = diff(&trigger_base, &requested.attr_trigger)
            .into_iter()
            .map(|change| {
                let attr = trigger_attrs
                    .find(change.extended, change.index)
                    .cloned()
                    .ok_or(ConfigError::UnknownAttribute {
                        extended: change.extended,
                        index: change.index,
                    })?;
                attr.check_value(change.value)?;
                Ok((attr, change.value))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let changes = diff(&current.attr_channel, &requested.attr_channel);
        let device_changes = if changes.is_empty() {
            Vec::new()
        } else {
            let dev_attrs = self.device.attrs.lock();
            let hosts: [&dyn AttributeHost; 3] = [&inner.channels[chan], inner, &*dev_attrs];
            changes
                .into_iter()
                .map(|change| {
                    let unknown = || ConfigError::UnknownAttribute {
                        extended: change.extended,
                        index: change.index,
                    };
                    let host = locate(&hosts, change.extended, change.index).ok_or_else(unknown)?;
                    let owner = [Owner::Channel, Owner::Cset, Owner::Device][host];
                    let attr = hosts[host]
                        .attributes()
                        .find(change.extended, change.index)
                        .cloned()
                        .ok_or_else(unknown)?;
                    attr.check_value(change.value)?;
                    Ok((owner, attr, change.value))
                })
                .collect::<Result<Vec<_>, ConfigError>>()?
        };

        Ok(ConfigPlan {
            trigger,
            trigger_changes,
            device_changes,
        })
    }

    /// Device attributes changed here are pushed to `mirrored`; the caller
    /// hands them to [`ChannelSet::mirror_device_attrs`] once unlocked.
    pub(crate) fn configure_locked(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        requested: &Control,
        w: &mut Wakeups,
        mirrored: &mut Vec<Attribute>,
    ) -> Result<(), ConfigError> {
        let plan = self.plan_configure(inner, chan, requested)?;

        let snapshot = self.abort_locked(inner, true, w);
        if let Some((ttype, attrs)) = &plan.trigger {
            self.install_trigger_locked(inner, ttype, attrs.clone(), w);
        }
        let result = self
            .apply_trigger_changes(inner, &plan.trigger_changes)
            .and_then(|()| self.apply_device_changes(inner, chan, &plan.device_changes, mirrored));

        match &result {
            Ok(()) => {
                let ctrl = &mut inner.channels[chan].ctrl;
                if requested.seq_num != 0 {
                    ctrl.seq_num = requested.seq_num;
                }
                if self.direction().is_output() {
                    ctrl.tstamp = requested.tstamp;
                }
                log::debug!(
                    "{}: configured {} trigger and {} channel attributes",
                    self.name(),
                    plan.trigger_changes.len(),
                    plan.device_changes.len()
                );
            }
            Err(e) => {
                log::error!("{}: configuration of channel {chan} failed: {e}", self.name());
                inner.channels[chan].ctrl.alarms |= Alarms::BAD_CONFIG;
            }
        }

        self.restore_locked(inner, snapshot, w);
        result
    }

    fn apply_trigger_changes(
        &self,
        inner: &mut CsetInner,
        changes: &[(Attribute, u32)],
    ) -> Result<(), ConfigError> {
        if changes.is_empty() {
            return Ok(());
        }
        for (attr, value) in changes {
            inner
                .trigger
                .config(attr, *value)
                .map_err(ConfigError::TriggerRejected)?;
            inner.trigger.commit_store(attr.name(), *value);
        }
        self.propagate_trigger_attrs(inner);
        Ok(())
    }

    /// Device-group changes, each sent to the object that owns it and
    /// mirrored into the controls that object covers.
    fn apply_device_changes(
        &self,
        inner: &mut CsetInner,
        chan: usize,
        changes: &[(Owner, Attribute, u32)],
        mirrored: &mut Vec<Attribute>,
    ) -> Result<(), ConfigError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut dev_attrs = self.device.attrs.lock();

        for (owner, attr, value) in changes {
            let (target, host, scope): (AttrTarget, &mut dyn AttributeHost, _) = match owner {
                Owner::Channel => (
                    AttrTarget::Channel {
                        cset: self.index(),
                        chan,
                    },
                    &mut inner.channels[chan] as &mut dyn AttributeHost,
                    Some(chan),
                ),
                Owner::Cset => (
                    AttrTarget::Cset(self.index()),
                    &mut *inner as &mut dyn AttributeHost,
                    None,
                ),
                Owner::Device => (
                    AttrTarget::Device,
                    &mut *dev_attrs as &mut dyn AttributeHost,
                    None,
                ),
            };
            self.device
                .ops
                .conf_set(target, attr, *value)
                .map_err(ConfigError::DeviceRejected)?;
            let Some(stored) = host.commit_store(attr.name(), *value) else {
                continue;
            };
            if *owner == Owner::Device {
                mirrored.push(stored.clone());
            }
            self.propagate_channel_attr(inner, &stored, scope);
        }
        Ok(())
    }
}
