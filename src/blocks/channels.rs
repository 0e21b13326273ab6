use super::base::{
    check_finite, check_index, query, query_label, query_range, slot_mut, warn_if_outside, BlockCore,
    BlockState,
};
use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_bool, value_as_f64, value_as_list, value_as_u32};
use crate::subscription::Publication;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Where channel labels come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Labels {
    /// Queried per channel from this attribute
    Attribute(&'static str),
    /// `<block id>_<index>`, for blocks that carry no labels
    Generated,
}

/// Which per-channel attributes a channel block carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Capabilities {
    pub labels: Labels,
    /// Per-channel level with limits
    pub level: bool,
    /// Per-channel polarity `invert`
    pub invert: bool,
    /// Dante `faultOnInactive`
    pub fault_on_inactive: bool,
    /// Live values follow publishes; otherwise only `refresh` and setters update them
    pub subscribed: bool,
}

pub(crate) const LEVEL: Capabilities = Capabilities {
    labels: Labels::Attribute("label"),
    level: true,
    invert: false,
    fault_on_inactive: false,
    subscribed: true,
};

pub(crate) const MUTE: Capabilities = Capabilities {
    labels: Labels::Attribute("label"),
    level: false,
    invert: false,
    fault_on_inactive: false,
    subscribed: true,
};

pub(crate) const DANTE: Capabilities = Capabilities {
    labels: Labels::Attribute("channelName"),
    level: true,
    invert: true,
    fault_on_inactive: true,
    subscribed: true,
};

pub(crate) const AUDIO_OUTPUT: Capabilities = Capabilities {
    labels: Labels::Generated,
    level: true,
    invert: true,
    fault_on_inactive: false,
    subscribed: false,
};

pub(crate) const NOISE_GENERATOR: Capabilities = Capabilities {
    labels: Labels::Generated,
    level: true,
    invert: false,
    fault_on_inactive: false,
    subscribed: false,
};

pub(crate) struct ChannelState {
    caps: Capabilities,
    ganged: bool,
    channels: Vec<Channel>,
}

impl ChannelState {
    pub(crate) fn new(caps: Capabilities, ganged: bool, channels: &[ChannelInfo]) -> Self {
        Self {
            caps,
            ganged,
            channels: channels.iter().map(Channel::from_info).collect(),
        }
    }

    fn channel(&self, index: u32) -> Option<&Channel> {
        index
            .checked_sub(1)
            .and_then(|i| self.channels.get(i as usize))
    }

    fn channel_mut(&mut self, index: u32) -> Option<&mut Channel> {
        index
            .checked_sub(1)
            .and_then(|i| self.channels.get_mut(i as usize))
    }

    /// Apply a whole-block array publish, element `i` going to channel `i + 1`
    fn apply_array<T>(
        &mut self,
        values: Vec<T>,
        mut assign: impl FnMut(&mut Channel, T),
    ) {
        if values.len() != self.channels.len() {
            tracing::warn!(
                "Publish carries {} values for {} channels",
                values.len(),
                self.channels.len()
            );
        }
        for (channel, value) in self.channels.iter_mut().zip(values) {
            assign(channel, value);
        }
    }
}

impl BlockState for ChannelState {
    fn apply(&mut self, publication: &Publication) -> Result<()> {
        match publication.attribute.as_str() {
            "levels" if self.caps.level => {
                let levels = value_as_list(&publication.value)?
                    .iter()
                    .map(value_as_f64)
                    .collect::<Result<Vec<_>>>()?;
                self.apply_array(levels, |channel, level| channel.level = Some(level));
            }
            "mutes" => {
                let mutes = value_as_list(&publication.value)?
                    .iter()
                    .map(value_as_bool)
                    .collect::<Result<Vec<_>>>()?;
                self.apply_array(mutes, |channel, muted| channel.muted = muted);
            }
            "faultOnInactive" if self.caps.fault_on_inactive => {
                let enabled = value_as_bool(&publication.value)?;
                slot_mut(&mut self.channels, publication.index)?.fault_on_inactive = Some(enabled);
            }
            other => {
                return Err(TesiraError::protocol(format!("unexpected publish attribute '{other}'")))
            }
        }
        Ok(())
    }
}

/// Channel-oriented block: shared by level, mute, Dante, output and noise blocks
#[derive(Clone)]
pub(crate) struct ChannelBlock {
    core: BlockCore<ChannelState>,
}

impl ChannelBlock {
    /// Query channel count, labels and (if applicable) level limits
    pub(crate) async fn query_channels(
        session: &Session,
        id: &str,
        caps: Capabilities,
    ) -> Result<Vec<ChannelInfo>> {
        let count = value_as_u32(&query(session, id, "numChannels", None).await?)?;
        let mut channels = Vec::with_capacity(count as usize);
        for index in 1..=count {
            let label = match caps.labels {
                Labels::Attribute(attribute) => query_label(session, id, attribute, index).await?,
                Labels::Generated => format!("{id}_{index}"),
            };
            let range = if caps.level {
                Some(query_range(session, id, "minLevel", "maxLevel", Some(index)).await?)
            } else {
                None
            };
            channels.push(ChannelInfo { index, label, range });
        }
        Ok(channels)
    }

    /// Build the block from its layout, poll live values and subscribe
    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        caps: Capabilities,
        ganged: bool,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        let block = Self {
            core: BlockCore::new(session, id, ChannelState::new(caps, ganged, channels)),
        };
        block.refresh().await?;
        if !caps.subscribed {
            return Ok(block);
        }

        let mut subscriptions = vec![("mutes", None)];
        if caps.level {
            subscriptions.insert(0, ("levels", None));
        }
        if caps.fault_on_inactive {
            subscriptions.extend((1..=channels.len() as u32).map(|i| ("faultOnInactive", Some(i))));
        }
        block.core.subscribe(&subscriptions).await?;
        Ok(block)
    }

    pub(crate) fn id(&self) -> &str {
        self.core.id()
    }

    pub(crate) fn ganged(&self) -> bool {
        self.core.read(|s| s.ganged)
    }

    pub(crate) fn channels(&self) -> Vec<Channel> {
        self.core.read(|s| s.channels.clone())
    }

    pub(crate) fn channel(&self, index: u32) -> Option<Channel> {
        self.core.read(|s| s.channel(index).cloned())
    }

    /// Re-poll every live per-channel value
    ///
    /// Each value is cached as soon as its reply arrives.
    pub(crate) async fn refresh(&self) -> Result<()> {
        let (caps, count) = self.core.read(|s| (s.caps, s.channels.len() as u32));

        for index in 1..=count {
            if caps.level {
                self.poll_channel("level", index, value_as_f64, |c, level| c.level = Some(level))
                    .await?;
            }
            self.poll_channel("mute", index, value_as_bool, |c, muted| c.muted = muted)
                .await?;
            if caps.invert {
                self.poll_channel("invert", index, value_as_bool, |c, inverted| {
                    c.inverted = Some(inverted)
                })
                .await?;
            }
            if caps.fault_on_inactive {
                self.poll_channel("faultOnInactive", index, value_as_bool, |c, enabled| {
                    c.fault_on_inactive = Some(enabled)
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn poll_channel<T>(
        &self,
        attribute: &str,
        index: u32,
        parse: impl FnOnce(&serde_json::Value) -> Result<T>,
        assign: impl FnOnce(&mut Channel, T),
    ) -> Result<()> {
        self.core
            .poll(attribute, Some(index), parse, |s, value| {
                if let Some(c) = s.channel_mut(index) {
                    assign(c, value);
                }
            })
            .await
    }

    fn check_channel(&self, channel: u32) -> Result<()> {
        let count = self.core.read(|s| s.channels.len());
        check_index(self.id(), "channel", channel, count)
    }

    pub(crate) async fn set_level(&self, channel: u32, level: f64) -> Result<()> {
        self.check_channel(channel)?;
        check_finite(self.id(), "level", level)?;
        let range = self.core.read(|s| s.channel(channel).and_then(|c| c.range));
        warn_if_outside(self.id(), "level", level, range);
        self.core.set("level", Some(channel), level).await?;
        self.core.update(|s| {
            if let Some(c) = s.channel_mut(channel) {
                c.level = Some(level);
            }
        });
        Ok(())
    }

    pub(crate) async fn set_mute(&self, channel: u32, muted: bool) -> Result<()> {
        self.check_channel(channel)?;
        self.core.set("mute", Some(channel), muted).await?;
        self.core.update(|s| {
            if let Some(c) = s.channel_mut(channel) {
                c.muted = muted;
            }
        });
        Ok(())
    }

    pub(crate) async fn set_invert(&self, channel: u32, inverted: bool) -> Result<()> {
        self.check_channel(channel)?;
        self.core.set("invert", Some(channel), inverted).await?;
        self.core.update(|s| {
            if let Some(c) = s.channel_mut(channel) {
                c.inverted = Some(inverted);
            }
        });
        Ok(())
    }

    pub(crate) async fn set_fault_on_inactive(&self, channel: u32, enabled: bool) -> Result<()> {
        self.check_channel(channel)?;
        self.core.set("faultOnInactive", Some(channel), enabled).await?;
        self.core.update(|s| {
            if let Some(c) = s.channel_mut(channel) {
                c.fault_on_inactive = Some(enabled);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn infos(n: u32) -> Vec<ChannelInfo> {
        (1..=n)
            .map(|index| ChannelInfo {
                index,
                label: format!("Ch {index}"),
                range: None,
            })
            .collect()
    }

    fn publication(attribute: &str, index: Option<u32>, value: serde_json::Value) -> Publication {
        Publication {
            token: format!("{attribute}-token"),
            attribute: attribute.to_string(),
            index,
            value,
        }
    }

    #[test]
    fn array_publishes_update_every_channel() {
        let mut state = ChannelState::new(LEVEL, false, &infos(2));
        state
            .apply(&publication("levels", None, json!([-20.0, -6.5])))
            .unwrap();
        state
            .apply(&publication("mutes", None, json!([true, false])))
            .unwrap();

        assert_eq!(state.channels[0].level, Some(-20.0));
        assert_eq!(state.channels[1].level, Some(-6.5));
        assert!(state.channels[0].muted);
        assert!(!state.channels[1].muted);
    }

    #[test]
    fn malformed_publish_leaves_state_untouched() {
        let mut state = ChannelState::new(LEVEL, false, &infos(2));
        let err = state.apply(&publication("levels", None, json!([-20.0, "loud"])));
        assert!(err.is_err());
        assert!(state.channels.iter().all(|c| c.level.is_none()));
    }

    #[test]
    fn mute_block_ignores_level_publishes() {
        let mut state = ChannelState::new(MUTE, true, &infos(1));
        assert!(state.apply(&publication("levels", None, json!([0.0]))).is_err());
    }

    #[test]
    fn dante_fault_on_inactive_is_indexed() {
        let mut state = ChannelState::new(DANTE, false, &infos(2));
        state
            .apply(&publication("faultOnInactive", Some(2), json!(true)))
            .unwrap();
        assert_eq!(state.channels[0].fault_on_inactive, None);
        assert_eq!(state.channels[1].fault_on_inactive, Some(true));
        assert!(state
            .apply(&publication("faultOnInactive", Some(3), json!(true)))
            .is_err());
    }
}
