use super::channels::{ChannelBlock, AUDIO_OUTPUT};
use super::BlockLayout;
use crate::connection::Session;
use crate::error::Result;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Physical audio output card block
///
/// Channels carry no labels on the device and are named `<id>_<index>`.
/// Nothing is published for outputs, so cached values only change through
/// `refresh` and the setters.
#[derive(Clone)]
pub struct AudioOutput {
    inner: ChannelBlock,
}

impl AudioOutput {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        Ok(BlockLayout::AudioOutput {
            channels: ChannelBlock::query_channels(session, id, AUDIO_OUTPUT).await?,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        Ok(Self {
            inner: ChannelBlock::open(session, id, AUDIO_OUTPUT, false, channels).await?,
        })
    }

    pub fn id(&self) -> &str {
        self.inner.id()
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

    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
