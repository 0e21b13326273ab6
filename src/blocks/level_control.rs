use super::channels::{ChannelBlock, LEVEL};
use super::BlockLayout;
use crate::connection::Session;
use crate::error::Result;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Multi-channel level control with per-channel mute
#[derive(Clone)]
pub struct LevelControl {
    inner: ChannelBlock,
}

impl LevelControl {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        Ok(BlockLayout::LevelControl {
            channels: ChannelBlock::query_channels(session, id, LEVEL).await?,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        Ok(Self {
            inner: ChannelBlock::open(session, id, LEVEL, false, channels).await?,
        })
    }

    /// Block instance tag
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    /// Snapshot of every channel
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels()
    }

    /// Get a channel by 1-based index
    pub fn channel(&self, index: u32) -> Option<Channel> {
        self.inner.channel(index)
    }

    /// Cached level of a channel in dB
    pub fn level(&self, channel: u32) -> Option<f64> {
        self.inner.channel(channel).and_then(|c| c.level)
    }

    /// Cached mute state of a channel
    pub fn muted(&self, channel: u32) -> Option<bool> {
        self.inner.channel(channel).map(|c| c.muted)
    }

    /// Set a channel level in dB
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(dsp: tesira_ttp::TesiraDsp) -> tesira_ttp::Result<()> {
    /// let level = dsp.level_control("LevelTest")?;
    /// level.set_level(1, -20.0).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn set_level(&self, channel: u32, level: f64) -> Result<()> {
        self.inner.set_level(channel, level).await
    }

    pub async fn set_mute(&self, channel: u32, muted: bool) -> Result<()> {
        self.inner.set_mute(channel, muted).await
    }

    /// Re-poll live values from the device
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
