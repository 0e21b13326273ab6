use super::channels::{ChannelBlock, NOISE_GENERATOR};
use super::BlockLayout;
use crate::connection::Session;
use crate::error::Result;
use crate::types::{Channel, ChannelInfo};
use std::sync::Arc;

/// Noise generator with per-channel level and mute, polled only
#[derive(Clone)]
pub struct NoiseGenerator {
    inner: ChannelBlock,
}

impl NoiseGenerator {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        Ok(BlockLayout::NoiseGenerator {
            channels: ChannelBlock::query_channels(session, id, NOISE_GENERATOR).await?,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        channels: &[ChannelInfo],
    ) -> Result<Self> {
        Ok(Self {
            inner: ChannelBlock::open(session, id, NOISE_GENERATOR, false, channels).await?,
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

    pub async fn set_level(&self, channel: u32, level: f64) -> Result<()> {
        self.inner.set_level(channel, level).await
    }

    pub async fn set_mute(&self, channel: u32, muted: bool) -> Result<()> {
        self.inner.set_mute(channel, muted).await
    }

    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
