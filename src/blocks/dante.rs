use super::channels::{ChannelBlock, DANTE};
use super::{BlockLayout, BlockType};
use crate::connection::Session;
use crate::error::Result;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Dante input or output block
///
/// Channels are labelled by their Dante channel name. Besides level and
/// mute, each channel carries polarity invert and fault-on-inactive flags.
/// Invert has no subscription and is only updated by `refresh` and by
/// `set_invert`.
#[derive(Clone)]
pub struct DanteBlock {
    block_type: BlockType,
    inner: ChannelBlock,
}

impl DanteBlock {
    pub(crate) async fn query_layout(
        session: &Session,
        id: &str,
        block_type: BlockType,
    ) -> Result<BlockLayout> {
        let channels = ChannelBlock::query_channels(session, id, DANTE).await?;
        Ok(match block_type {
            BlockType::DanteOutput => BlockLayout::DanteOutput { channels },
            _ => BlockLayout::DanteInput { channels },
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        block_type: BlockType,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        Ok(Self {
            block_type,
            inner: ChannelBlock::open(session, id, DANTE, false, channels).await?,
        })
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// `DanteInput` or `DanteOutput`
    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels()
    }

    pub fn channel(&self, index: u32) -> Option<Channel> {
        self.inner.channel(index)
    }

    pub fn level(&self, channel: u32) -> Option<f64> {
        self.inner.channel(channel).and_then(|c| c.level)
    }

    pub fn muted(&self, channel: u32) -> Option<bool> {
        self.inner.channel(channel).map(|c| c.muted)
    }

    pub fn inverted(&self, channel: u32) -> Option<bool> {
        self.inner.channel(channel).and_then(|c| c.inverted)
    }

    pub fn fault_on_inactive(&self, channel: u32) -> Option<bool> {
        self.inner.channel(channel).and_then(|c| c.fault_on_inactive)
    }

    pub async fn set_level(&self, channel: u32, level: f64) -> Result<()> {
        self.inner.set_level(channel, level).await
    }

    pub async fn set_mute(&self, channel: u32, muted: bool) -> Result<()> {
        self.inner.set_mute(channel, muted).await
    }

    /// Invert channel polarity
    pub async fn set_invert(&self, channel: u32, inverted: bool) -> Result<()> {
        self.inner.set_invert(channel, inverted).await
    }

    /// Raise a device fault when the channel's Dante flow goes inactive
    pub async fn set_fault_on_inactive(&self, channel: u32, enabled: bool) -> Result<()> {
        self.inner.set_fault_on_inactive(channel, enabled).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
