// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! All channel groups of one device.

use std::collections::BTreeSet;
use std::sync::Arc;

use awg_program::device_traits::HDAWG_TRAITS;

use crate::channel_group::ChannelGroup;
use crate::nodes::DeviceNode;
use crate::session::DeviceSession;
use crate::settings::AwgSettings;
use crate::{Error, Result};

/// How the outputs of the device are bundled into channel groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelGrouping {
    /// Four groups of two channels.
    #[default]
    FourByTwo,
    /// Two groups of four channels.
    TwoByFour,
    /// One group of all eight channels.
    OneByEight,
}

impl ChannelGrouping {
    pub fn node_value(self) -> i64 {
        match self {
            ChannelGrouping::FourByTwo => 0,
            ChannelGrouping::TwoByFour => 1,
            ChannelGrouping::OneByEight => 2,
        }
    }

    pub fn group_size(self) -> usize {
        match self {
            ChannelGrouping::FourByTwo => 2,
            ChannelGrouping::TwoByFour => 4,
            ChannelGrouping::OneByEight => 8,
        }
    }

    pub fn group_count(self) -> usize {
        usize::from(HDAWG_TRAITS.channel_count) / self.group_size()
    }

    /// Sequencer core that drives `group`. Every core drives two channels.
    pub fn awg_index(self, group: usize) -> Result<u16> {
        u16::try_from(group * self.group_size() / 2)
            .map_err(|_| Error::configuration(format!("Channel group {group} out of range")))
    }
}

impl TryFrom<i64> for ChannelGrouping {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ChannelGrouping::FourByTwo),
            1 => Ok(ChannelGrouping::TwoByFour),
            2 => Ok(ChannelGrouping::OneByEight),
            _ => Err(Error::communication(format!(
                "Unknown channel grouping {value}"
            ))),
        }
    }
}

pub struct Instrument {
    session: Arc<dyn DeviceSession>,
    serial: String,
    grouping: ChannelGrouping,
    groups: Vec<ChannelGroup>,
}

impl Instrument {
    /// Set the channel grouping of `serial` and create its channel groups.
    pub fn new(
        session: Arc<dyn DeviceSession>,
        serial: &str,
        grouping: ChannelGrouping,
        settings: &AwgSettings,
    ) -> Result<Self> {
        let serial = serial.to_lowercase();
        session.set_node(
            &DeviceNode::ChannelGrouping.path(&serial),
            grouping.node_value().into(),
        )?;
        session.sync()?;
        let groups = (0..grouping.group_count())
            .map(|group| {
                ChannelGroup::new(
                    Arc::clone(&session),
                    &serial,
                    grouping.awg_index(group)?,
                    grouping.group_size(),
                    settings.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        awg_log::info!(
            "{}: {} channel groups of {} channels",
            serial,
            groups.len(),
            grouping.group_size()
        );
        Ok(Self {
            session,
            serial,
            grouping,
            groups,
        })
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn grouping(&self) -> ChannelGrouping {
        self.grouping
    }

    /// The channel grouping as currently set on the device.
    pub fn device_grouping(&self) -> Result<ChannelGrouping> {
        self.session
            .get_node(&DeviceNode::ChannelGrouping.path(&self.serial))?
            .as_int()?
            .try_into()
    }

    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }

    pub fn group(&self, group: usize) -> Result<&ChannelGroup> {
        self.groups.get(group).ok_or_else(|| unknown_group(group))
    }

    pub fn group_mut(&mut self, group: usize) -> Result<&mut ChannelGroup> {
        self.groups.get_mut(group).ok_or_else(|| unknown_group(group))
    }

    /// Arm `name` on `group` once every other group finished its upload.
    pub fn arm(&mut self, group: usize, name: Option<&str>) -> Result<()> {
        let len = self.groups.len();
        let (before, rest) = self.groups.split_at_mut(group.min(len));
        let Some((target, after)) = rest.split_first_mut() else {
            return Err(unknown_group(group));
        };
        let mut siblings = before
            .iter_mut()
            .chain(after.iter_mut())
            .collect::<Vec<_>>();
        target.arm_with_siblings(name, &mut siblings)
    }

    /// Delete the cached sources and binaries of all groups.
    pub fn clear_artifacts(&self) -> Result<usize> {
        let mut cleared = BTreeSet::new();
        let mut deleted = 0;
        for group in &self.groups {
            let elf_manager = group.elf_manager();
            if cleared.insert(elf_manager.store().src_dir()) {
                deleted += elf_manager.clear()?;
            }
        }
        Ok(deleted)
    }
}

fn unknown_group(group: usize) -> Error {
    Error::configuration(format!("Unknown channel group {group}"))
}
