use super::base::{
    check_finite, check_index, query, query_range, slot_mut, warn_if_outside, BlockCore, BlockState,
};
use super::BlockLayout;
use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_bool, value_as_f64, value_as_u32};
use crate::subscription::Publication;
use crate::types::{Band, LevelRange};
use std::sync::Arc;

struct EqualizerState {
    gain_range: LevelRange,
    bypass_all: bool,
    bands: Vec<Band>,
}

impl BlockState for EqualizerState {
    fn apply(&mut self, publication: &Publication) -> Result<()> {
        match publication.attribute.as_str() {
            "bypassAll" => self.bypass_all = value_as_bool(&publication.value)?,
            "bypass" => {
                let bypassed = value_as_bool(&publication.value)?;
                slot_mut(&mut self.bands, publication.index)?.bypassed = bypassed;
            }
            "gain" => {
                let gain = value_as_f64(&publication.value)?;
                slot_mut(&mut self.bands, publication.index)?.gain = gain;
            }
            other => {
                return Err(TesiraError::protocol(format!("unexpected publish attribute '{other}'")))
            }
        }
        Ok(())
    }
}

/// Graphic equalizer with per-band gain and bypass
///
/// The global bypass is independent of the per-band bypass flags.
#[derive(Clone)]
pub struct GraphicEqualizer {
    core: BlockCore<EqualizerState>,
}

impl GraphicEqualizer {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        let num_bands = value_as_u32(&query(session, id, "numBands", None).await?)?;
        let gain_range = query_range(session, id, "minGain", "maxGain", None).await?;
        Ok(BlockLayout::GraphicEqualizer {
            num_bands,
            gain_range,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        num_bands: u32,
        gain_range: LevelRange,
    ) -> Result<Self> {
        let state = EqualizerState {
            gain_range,
            bypass_all: false,
            bands: (1..=num_bands)
                .map(|index| Band {
                    index,
                    gain: 0.0,
                    bypassed: false,
                })
                .collect(),
        };
        let block = Self {
            core: BlockCore::new(session, id, state),
        };
        block.refresh().await?;

        let mut subscriptions = vec![("bypassAll", None)];
        for band in 1..=num_bands {
            subscriptions.push(("bypass", Some(band)));
            subscriptions.push(("gain", Some(band)));
        }
        block.core.subscribe(&subscriptions).await?;
        Ok(block)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn bands(&self) -> Vec<Band> {
        self.core.read(|s| s.bands.clone())
    }

    pub fn band(&self, index: u32) -> Option<Band> {
        self.core.read(|s| {
            index
                .checked_sub(1)
                .and_then(|i| s.bands.get(i as usize))
                .cloned()
        })
    }

    pub fn gain_range(&self) -> LevelRange {
        self.core.read(|s| s.gain_range)
    }

    /// Global bypass state
    pub fn bypassed(&self) -> bool {
        self.core.read(|s| s.bypass_all)
    }

    /// Re-poll live values; each is cached as soon as its reply arrives
    pub async fn refresh(&self) -> Result<()> {
        let count = self.core.read(|s| s.bands.len() as u32);

        self.core
            .poll("bypassAll", None, value_as_bool, |s, bypassed| s.bypass_all = bypassed)
            .await?;
        for band in 1..=count {
            let slot = band as usize - 1;
            self.core
                .poll("bypass", Some(band), value_as_bool, |s, bypassed| {
                    if let Some(entry) = s.bands.get_mut(slot) {
                        entry.bypassed = bypassed;
                    }
                })
                .await?;
            self.core
                .poll("gain", Some(band), value_as_f64, |s, gain| {
                    if let Some(entry) = s.bands.get_mut(slot) {
                        entry.gain = gain;
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Bypass the whole equalizer; band settings are kept
    pub async fn set_bypass(&self, bypassed: bool) -> Result<()> {
        self.core.set("bypassAll", None, bypassed).await?;
        self.core.update(|s| s.bypass_all = bypassed);
        Ok(())
    }

    pub async fn set_band_bypass(&self, band: u32, bypassed: bool) -> Result<()> {
        self.check_band(band)?;
        self.core.set("bypass", Some(band), bypassed).await?;
        self.core.update(|s| {
            if let Some(entry) = s.bands.get_mut(band as usize - 1) {
                entry.bypassed = bypassed;
            }
        });
        Ok(())
    }

    /// Set a band gain in dB
    pub async fn set_band_gain(&self, band: u32, gain: f64) -> Result<()> {
        self.check_band(band)?;
        check_finite(self.id(), "gain", gain)?;
        warn_if_outside(self.id(), "gain", gain, Some(self.gain_range()));
        self.core.set("gain", Some(band), gain).await?;
        self.core.update(|s| {
            if let Some(entry) = s.bands.get_mut(band as usize - 1) {
                entry.gain = gain;
            }
        });
        Ok(())
    }

    fn check_band(&self, band: u32) -> Result<()> {
        let count = self.core.read(|s| s.bands.len());
        check_index(self.id(), "band", band, count)
    }
}
