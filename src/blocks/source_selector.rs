use super::base::{
    check_finite, check_index, query, query_label, query_range, slot_mut, warn_if_outside, BlockCore,
    BlockState,
};
use super::BlockLayout;
use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_bool, value_as_f64, value_as_u32};
use crate::subscription::Publication;
use crate::types::{LevelRange, Source, SourceInfo};
use std::sync::Arc;

struct SelectorState {
    stereo: bool,
    num_outputs: u32,
    sources: Vec<Source>,
    output_range: LevelRange,
    output_level: f64,
    output_muted: bool,
    /// Selected source, 0 when nothing is selected
    selected: u32,
}

impl SelectorState {
    fn select(&mut self, source: u32) {
        self.selected = source;
        for s in &mut self.sources {
            s.selected = s.index == source;
        }
    }
}

impl BlockState for SelectorState {
    fn apply(&mut self, publication: &Publication) -> Result<()> {
        match publication.attribute.as_str() {
            "outputMute" => self.output_muted = value_as_bool(&publication.value)?,
            "outputLevel" => self.output_level = value_as_f64(&publication.value)?,
            "sourceSelection" => {
                let source = value_as_u32(&publication.value)?;
                if source as usize > self.sources.len() {
                    tracing::warn!("Selected source {} is not in the block map", source);
                }
                self.select(source);
            }
            "sourceLevel" => {
                let level = value_as_f64(&publication.value)?;
                slot_mut(&mut self.sources, publication.index)?.level = level;
            }
            other => {
                return Err(TesiraError::protocol(format!("unexpected publish attribute '{other}'")))
            }
        }
        Ok(())
    }
}

/// Source selector: picks one of N sources, with per-source and output level
///
/// In stereo mode the device reports twice as many inputs and outputs; they
/// are counted here as stereo pairs.
#[derive(Clone)]
pub struct SourceSelector {
    core: BlockCore<SelectorState>,
}

impl SourceSelector {
    pub(crate) async fn query_layout(session: &Session, id: &str) -> Result<BlockLayout> {
        let stereo = value_as_bool(&query(session, id, "stereoEnable", None).await?)?;
        let mut num_inputs = value_as_u32(&query(session, id, "numInputs", None).await?)?;
        let mut num_outputs = value_as_u32(&query(session, id, "numOutputs", None).await?)?;
        if stereo {
            num_inputs /= 2;
            num_outputs /= 2;
        }

        let mut sources = Vec::with_capacity(num_inputs as usize);
        for index in 1..=num_inputs {
            sources.push(SourceInfo {
                index,
                label: query_label(session, id, "label", index).await?,
                range: query_range(session, id, "sourceMinLevel", "sourceMaxLevel", Some(index))
                    .await?,
            });
        }
        let output_range = query_range(session, id, "outputMinLevel", "outputMaxLevel", None).await?;

        Ok(BlockLayout::SourceSelector {
            stereo,
            num_outputs,
            sources,
            output_range,
        })
    }

    pub(crate) async fn open(
        session: Arc<Session>,
        id: &str,
        stereo: bool,
        num_outputs: u32,
        sources: &[SourceInfo],
        output_range: LevelRange,
    ) -> Result<Self> {
        let state = SelectorState {
            stereo,
            num_outputs,
            sources: sources
                .iter()
                .map(|info| Source {
                    index: info.index,
                    label: info.label.clone(),
                    range: info.range,
                    level: 0.0,
                    selected: false,
                })
                .collect(),
            output_range,
            output_level: 0.0,
            output_muted: false,
            selected: 0,
        };
        let block = Self {
            core: BlockCore::new(session, id, state),
        };
        block.refresh().await?;

        let mut subscriptions = vec![
            ("outputMute", None),
            ("outputLevel", None),
            ("sourceSelection", None),
        ];
        subscriptions.extend((1..=sources.len() as u32).map(|i| ("sourceLevel", Some(i))));
        block.core.subscribe(&subscriptions).await?;
        Ok(block)
    }

    pub fn id(&self) -> &str {
        self.core.id()
    }

    pub fn stereo(&self) -> bool {
        self.core.read(|s| s.stereo)
    }

    /// Output count (stereo pairs when in stereo mode)
    pub fn num_outputs(&self) -> u32 {
        self.core.read(|s| s.num_outputs)
    }

    pub fn sources(&self) -> Vec<Source> {
        self.core.read(|s| s.sources.clone())
    }

    pub fn source(&self, index: u32) -> Option<Source> {
        self.core.read(|s| {
            index
                .checked_sub(1)
                .and_then(|i| s.sources.get(i as usize))
                .cloned()
        })
    }

    /// Currently selected source, or `None` if nothing is selected
    pub fn selected_source(&self) -> Option<u32> {
        self.core.read(|s| (s.selected != 0).then_some(s.selected))
    }

    pub fn output_level(&self) -> f64 {
        self.core.read(|s| s.output_level)
    }

    pub fn output_range(&self) -> LevelRange {
        self.core.read(|s| s.output_range)
    }

    pub fn output_muted(&self) -> bool {
        self.core.read(|s| s.output_muted)
    }

    /// Re-poll live values from the device
    ///
    /// Each value is cached as soon as its reply arrives.
    pub async fn refresh(&self) -> Result<()> {
        let count = self.core.read(|s| s.sources.len() as u32);

        self.core
            .poll("outputMute", None, value_as_bool, |s, muted| s.output_muted = muted)
            .await?;
        self.core
            .poll("outputLevel", None, value_as_f64, |s, level| s.output_level = level)
            .await?;
        self.core
            .poll("sourceSelection", None, value_as_u32, SelectorState::select)
            .await?;
        for index in 1..=count {
            self.core
                .poll("sourceLevel", Some(index), value_as_f64, |s, level| {
                    if let Some(source) = s.sources.get_mut(index as usize - 1) {
                        source.level = level;
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Select a source by 1-based index; 0 selects nothing
    ///
    /// Source levels are left as they are.
    pub async fn select_source(&self, source: u32) -> Result<()> {
        let count = self.core.read(|s| s.sources.len());
        if source != 0 {
            check_index(self.id(), "source", source, count)?;
        }
        self.core.set("sourceSelection", None, source).await?;
        self.core.update(|s| s.select(source));
        Ok(())
    }

    pub async fn set_source_level(&self, source: u32, level: f64) -> Result<()> {
        let count = self.core.read(|s| s.sources.len());
        check_index(self.id(), "source", source, count)?;
        check_finite(self.id(), "level", level)?;
        let range = self.core.read(|s| s.sources.get(source as usize - 1).map(|e| e.range));
        warn_if_outside(self.id(), "source level", level, range);
        self.core.set("sourceLevel", Some(source), level).await?;
        self.core.update(|s| {
            if let Some(entry) = s.sources.get_mut(source as usize - 1) {
                entry.level = level;
            }
        });
        Ok(())
    }

    pub async fn set_output_level(&self, level: f64) -> Result<()> {
        check_finite(self.id(), "level", level)?;
        warn_if_outside(self.id(), "output level", level, Some(self.output_range()));
        self.core.set("outputLevel", None, level).await?;
        self.core.update(|s| s.output_level = level);
        Ok(())
    }

    pub async fn set_output_mute(&self, muted: bool) -> Result<()> {
        self.core.set("outputMute", None, muted).await?;
        self.core.update(|s| s.output_muted = muted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> SelectorState {
        SelectorState {
            stereo: false,
            num_outputs: 1,
            sources: (1..=3)
                .map(|index| Source {
                    index,
                    label: format!("Input {index}"),
                    range: LevelRange::new(-100.0, 12.0),
                    level: -10.0,
                    selected: false,
                })
                .collect(),
            output_range: LevelRange::new(-100.0, 12.0),
            output_level: 0.0,
            output_muted: false,
            selected: 0,
        }
    }

    fn publication(attribute: &str, index: Option<u32>, value: serde_json::Value) -> Publication {
        Publication {
            token: "t".into(),
            attribute: attribute.into(),
            index,
            value,
        }
    }

    #[test]
    fn selection_publish_marks_one_source() {
        let mut state = state();
        state
            .apply(&publication("sourceSelection", None, json!(2)))
            .unwrap();
        let selected: Vec<_> = state.sources.iter().map(|s| s.selected).collect();
        assert_eq!(selected, vec![false, true, false]);
        assert!(state.sources.iter().all(|s| s.level == -10.0));

        state
            .apply(&publication("sourceSelection", None, json!(0)))
            .unwrap();
        assert!(state.sources.iter().all(|s| !s.selected));
    }

    #[test]
    fn source_level_publish_is_indexed() {
        let mut state = state();
        state
            .apply(&publication("sourceLevel", Some(3), json!(-3.5)))
            .unwrap();
        assert_eq!(state.sources[2].level, -3.5);
        assert!(state
            .apply(&publication("sourceLevel", Some(4), json!(0.0)))
            .is_err());
    }
}
