use super::base::{check_finite, warn_if_outside, BlockCore};
use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_bool, value_as_f64};
use crate::types::{DuckerSettings, LevelRange};
use std::sync::Arc;

/// Ducker: attenuates its input while the sense signal is above threshold
///
/// A ducker has no structural attributes. The device publishes nothing for
/// it, so cached settings only change through `refresh` and the setters.
#[derive(Clone)]
pub struct Ducker {
    core: BlockCore<DuckerSettings>,
}

impl Ducker {
    pub(crate) async fn open(session: Arc<Session>, id: &str) -> Result<Self> {
        let settings = DuckerSettings {
            bypassed: false,
            mix_sense: false,
            sense_level: 0.0,
            sense_muted: false,
            threshold: 0.0,
            ducking_level: 0.0,
            attack_time: 0.0,
            release_time: 0.0,
            input_muted: false,
            input_level: 0.0,
            input_range: LevelRange::new(0.0, 0.0),
        };
        let block = Self {
            core: BlockCore::new(session, id, settings),
        };
        block.refresh().await?;
        Ok(block)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    /// Snapshot of every cached setting
    pub fn settings(&self) -> DuckerSettings {
        self.core.read(|s| s.clone())
    }

    pub fn bypassed(&self) -> bool {
        self.core.read(|s| s.bypassed)
    }

    pub fn input_level(&self) -> f64 {
        self.core.read(|s| s.input_level)
    }

    /// Re-poll every setting; each is cached as soon as its reply arrives
    pub async fn refresh(&self) -> Result<()> {
        let core = &self.core;
        core.poll("bypass", None, value_as_bool, |s, v| s.bypassed = v).await?;
        core.poll("mixSense", None, value_as_bool, |s, v| s.mix_sense = v).await?;
        core.poll("senseLevel", None, value_as_f64, |s, v| s.sense_level = v).await?;
        core.poll("senseMute", None, value_as_bool, |s, v| s.sense_muted = v).await?;
        core.poll("threshold", None, value_as_f64, |s, v| s.threshold = v).await?;
        core.poll("duckingLevel", None, value_as_f64, |s, v| s.ducking_level = v).await?;
        core.poll("attackTime", None, value_as_f64, |s, v| s.attack_time = v).await?;
        core.poll("releaseTime", None, value_as_f64, |s, v| s.release_time = v).await?;
        core.poll("inputMute", None, value_as_bool, |s, v| s.input_muted = v).await?;
        core.poll("inputLevel", None, value_as_f64, |s, v| s.input_level = v).await?;
        core.poll("minInputLevel", None, value_as_f64, |s, v| s.input_range.min = v).await?;
        core.poll("maxInputLevel", None, value_as_f64, |s, v| s.input_range.max = v).await?;
        Ok(())
    }

    pub async fn set_bypass(&self, bypassed: bool) -> Result<()> {
        self.set_flag("bypass", bypassed, |s, v| s.bypassed = v).await
    }

    /// Mix the sense input into the output
    pub async fn set_mix_sense(&self, enabled: bool) -> Result<()> {
        self.set_flag("mixSense", enabled, |s, v| s.mix_sense = v).await
    }

    pub async fn set_sense_level(&self, level: f64) -> Result<()> {
        self.set_number("senseLevel", level, |s, v| s.sense_level = v).await
    }

    pub async fn set_sense_mute(&self, muted: bool) -> Result<()> {
        self.set_flag("senseMute", muted, |s, v| s.sense_muted = v).await
    }

    /// Sense level in dB above which ducking starts
    pub async fn set_threshold(&self, threshold: f64) -> Result<()> {
        self.set_number("threshold", threshold, |s, v| s.threshold = v).await
    }

    /// Attenuation in dB applied while ducking
    pub async fn set_ducking_level(&self, level: f64) -> Result<()> {
        self.set_number("duckingLevel", level, |s, v| s.ducking_level = v).await
    }

    /// Attack time in milliseconds
    pub async fn set_attack_time(&self, millis: f64) -> Result<()> {
        check_time(self.id(), "attackTime", millis)?;
        self.set_number("attackTime", millis, |s, v| s.attack_time = v).await
    }

    /// Release time in milliseconds
    pub async fn set_release_time(&self, millis: f64) -> Result<()> {
        check_time(self.id(), "releaseTime", millis)?;
        self.set_number("releaseTime", millis, |s, v| s.release_time = v).await
    }

    pub async fn set_input_mute(&self, muted: bool) -> Result<()> {
        self.set_flag("inputMute", muted, |s, v| s.input_muted = v).await
    }

    pub async fn set_input_level(&self, level: f64) -> Result<()> {
        let range = self.core.read(|s| s.input_range);
        if level.is_finite() {
            warn_if_outside(self.id(), "input level", level, Some(range));
        }
        self.set_number("inputLevel", level, |s, v| s.input_level = v).await
    }

    pub async fn set_min_input_level(&self, level: f64) -> Result<()> {
        self.set_number("minInputLevel", level, |s, v| s.input_range.min = v).await
    }

    pub async fn set_max_input_level(&self, level: f64) -> Result<()> {
        self.set_number("maxInputLevel", level, |s, v| s.input_range.max = v).await
    }

    async fn set_flag(
        &self,
        attribute: &str,
        value: bool,
        store: impl FnOnce(&mut DuckerSettings, bool),
    ) -> Result<()> {
        self.core.set(attribute, None, value).await?;
        self.core.update(|s| store(s, value));
        Ok(())
    }

    async fn set_number(
        &self,
        attribute: &str,
        value: f64,
        store: impl FnOnce(&mut DuckerSettings, f64),
    ) -> Result<()> {
        check_finite(self.id(), attribute, value)?;
        self.core.set(attribute, None, value).await?;
        self.core.update(|s| store(s, value));
        Ok(())
    }
}

fn check_time(block: &str, what: &str, millis: f64) -> Result<()> {
    if millis < 0.0 {
        return Err(TesiraError::validation(format!(
            "{what} must not be negative on '{block}', got {millis}"
        )));
    }
    Ok(())
}
