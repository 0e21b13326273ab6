use super::channels::{ChannelBlock, MUTE};
use super::base::query;
use super::BlockLayout;
use crate::connection::Session;
use crate::error::Result;
use crate::protocol::value_as_bool;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Multi-channel mute control
#[derive(Clone)]
pub struct MuteControl {
    inner: ChannelBlock,
}

impl MuteControl {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        let ganged = value_as_bool(&query(session, id, "ganged", None).await?)?;
        Ok(BlockLayout::MuteControl {
            ganged,
            channels: ChannelBlock::query_channels(session, id, MUTE).await?,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        ganged: bool,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        Ok(Self {
            inner: ChannelBlock::open(session, id, MUTE, ganged, channels).await?,
        })
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// True if all channels follow a single mute
    pub fn ganged(&self) -> bool {
        self.inner.ganged()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels()
    }

    pub fn channel(&self, index: u32) -> Option<Channel> {
        self.inner.channel(index)
    }

    pub fn muted(&self, channel: u32) -> Option<bool> {
        self.inner.channel(channel).map(|c| c.muted)
    }

    /// Mute or unmute a channel; repeating the same value is harmless
    pub async fn set_mute(&self, channel: u32, muted: bool) -> Result<()> {
        self.inner.set_mute(channel, muted).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
