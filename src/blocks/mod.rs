//! Typed DSP blocks.
//!
//! Each supported block type has a structural layout (queried once during
//! discovery and stored in the block map) and a live handle that caches
//! parameter values and turns setter calls into TTP commands. Most handles
//! stay current through subscriptions; audio outputs, noise generators and
//! duckers are only updated by `refresh` and their own setters.

mod audio_output;
mod base;
mod channels;
mod dante;
mod ducker;
mod graphic_equalizer;
mod level_control;
mod mute_control;
mod noise_generator;
mod source_selector;

pub use audio_output::AudioOutput;
pub use dante::DanteBlock;
pub use ducker::Ducker;
pub use graphic_equalizer::GraphicEqualizer;
pub use level_control::LevelControl;
pub use mute_control::MuteControl;
pub use noise_generator::NoiseGenerator;
pub use source_selector::SourceSelector;

use crate::connection::Session;
use crate::error::Result;
use crate::types::{ChannelInfo, LevelRange, SourceInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Block types this crate knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    LevelControl,
    MuteControl,
    SourceSelector,
    DanteInput,
    DanteOutput,
    GraphicEqualizer,
    AudioOutput,
    NoiseGenerator,
    Ducker,
}

impl BlockType {
    pub const ALL: [BlockType; 9] = [
        BlockType::LevelControl,
        BlockType::MuteControl,
        BlockType::SourceSelector,
        BlockType::DanteInput,
        BlockType::DanteOutput,
        BlockType::GraphicEqualizer,
        BlockType::AudioOutput,
        BlockType::NoiseGenerator,
        BlockType::Ducker,
    ];

    /// Look up a type by the tag the device reports (`LevelControl`, ...)
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn tag(self) -> &'static str {
        match self {
            BlockType::LevelControl => "LevelControl",
            BlockType::MuteControl => "MuteControl",
            BlockType::SourceSelector => "SourceSelector",
            BlockType::DanteInput => "DanteInput",
            BlockType::DanteOutput => "DanteOutput",
            BlockType::GraphicEqualizer => "GraphicEqualizer",
            BlockType::AudioOutput => "AudioOutput",
            BlockType::NoiseGenerator => "NoiseGenerator",
            BlockType::Ducker => "Ducker",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Structural attributes of a block, fixed for a given device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "attributes")]
pub enum BlockLayout {
    LevelControl {
        channels: Vec<ChannelInfo>,
    },
    MuteControl {
        ganged: bool,
        channels: Vec<ChannelInfo>,
    },
    SourceSelector {
        stereo: bool,
        num_outputs: u32,
        sources: Vec<SourceInfo>,
        output_range: LevelRange,
    },
    DanteInput {
        channels: Vec<ChannelInfo>,
    },
    DanteOutput {
        channels: Vec<ChannelInfo>,
    },
    GraphicEqualizer {
        num_bands: u32,
        gain_range: LevelRange,
    },
    AudioOutput {
        channels: Vec<ChannelInfo>,
    },
    NoiseGenerator {
        channels: Vec<ChannelInfo>,
    },
    /// Duckers have no structural attributes
    Ducker,
    /// Block of a type that is recorded but never instantiated
    Unsupported {
        type_tag: String,
    },
}

impl BlockLayout {
    /// Query the structural attributes of a block of a known type
    pub(crate) async fn query(session: &Session, id: &str, block_type: BlockType) -> Result<Self> {
        match block_type {
            BlockType::LevelControl => LevelControl::query_layout(session, id).await,
            BlockType::MuteControl => MuteControl::query_layout(session, id).await,
            BlockType::SourceSelector => SourceSelector::query_layout(session, id).await,
            BlockType::DanteInput | BlockType::DanteOutput => {
                DanteBlock::query_layout(session, id, block_type).await
            }
            BlockType::GraphicEqualizer => GraphicEqualizer::query_layout(session, id).await,
            BlockType::AudioOutput => AudioOutput::query_layout(session, id).await,
            BlockType::NoiseGenerator => NoiseGenerator::query_layout(session, id).await,
            BlockType::Ducker => Ok(BlockLayout::Ducker),
        }
    }

    /// Type of the block, `None` for unsupported blocks
    pub fn block_type(&self) -> Option<BlockType> {
        match self {
            BlockLayout::LevelControl { .. } => Some(BlockType::LevelControl),
            BlockLayout::MuteControl { .. } => Some(BlockType::MuteControl),
            BlockLayout::SourceSelector { .. } => Some(BlockType::SourceSelector),
            BlockLayout::DanteInput { .. } => Some(BlockType::DanteInput),
            BlockLayout::DanteOutput { .. } => Some(BlockType::DanteOutput),
            BlockLayout::GraphicEqualizer { .. } => Some(BlockType::GraphicEqualizer),
            BlockLayout::AudioOutput { .. } => Some(BlockType::AudioOutput),
            BlockLayout::NoiseGenerator { .. } => Some(BlockType::NoiseGenerator),
            BlockLayout::Ducker => Some(BlockType::Ducker),
            BlockLayout::Unsupported { .. } => None,
        }
    }

    /// Type tag as reported by the device
    pub fn type_tag(&self) -> &str {
        match self {
            BlockLayout::Unsupported { type_tag } => type_tag,
            supported => supported.block_type().map(BlockType::tag).unwrap_or_default(),
        }
    }
}

/// A discovered block: identifier plus structural layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    /// Instance tag (alias) of the block
    pub id: String,
    pub layout: BlockLayout,
}

impl BlockDescriptor {
    pub fn block_type(&self) -> Option<BlockType> {
        self.layout.block_type()
    }

    pub fn type_tag(&self) -> &str {
        self.layout.type_tag()
    }
}

/// A live block handle
///
/// Handles are cheap to clone; clones share the same cached state.
#[derive(Clone)]
pub enum Block {
    LevelControl(LevelControl),
    MuteControl(MuteControl),
    SourceSelector(SourceSelector),
    DanteInput(DanteBlock),
    DanteOutput(DanteBlock),
    GraphicEqualizer(GraphicEqualizer),
    AudioOutput(AudioOutput),
    NoiseGenerator(NoiseGenerator),
    Ducker(Ducker),
}

impl Block {
    /// Instantiate a block: poll its live values and subscribe to changes
    ///
    /// Returns `None` for unsupported layouts.
    pub(crate) async fn open(session: Arc<Session>, descriptor: &BlockDescriptor) -> Result<Option<Self>> {
        let id = descriptor.id.as_str();
        let block = match &descriptor.layout {
            BlockLayout::LevelControl { channels } => {
                Block::LevelControl(LevelControl::open(session, id, channels).await?)
            }
            BlockLayout::MuteControl { ganged, channels } => {
                Block::MuteControl(MuteControl::open(session, id, *ganged, channels).await?)
            }
            BlockLayout::SourceSelector {
                stereo,
                num_outputs,
                sources,
                output_range,
            } => Block::SourceSelector(
                SourceSelector::open(session, id, *stereo, *num_outputs, sources, *output_range)
                    .await?,
            ),
            BlockLayout::DanteInput { channels } => Block::DanteInput(
                DanteBlock::open(session, id, BlockType::DanteInput, channels).await?,
            ),
            BlockLayout::DanteOutput { channels } => Block::DanteOutput(
                DanteBlock::open(session, id, BlockType::DanteOutput, channels).await?,
            ),
            BlockLayout::GraphicEqualizer {
                num_bands,
                gain_range,
            } => Block::GraphicEqualizer(
                GraphicEqualizer::open(session, id, *num_bands, *gain_range).await?,
            ),
            BlockLayout::AudioOutput { channels } => {
                Block::AudioOutput(AudioOutput::open(session, id, channels).await?)
            }
            BlockLayout::NoiseGenerator { channels } => {
                Block::NoiseGenerator(NoiseGenerator::open(session, id, channels).await?)
            }
            BlockLayout::Ducker => Block::Ducker(Ducker::open(session, id).await?),
            BlockLayout::Unsupported { .. } => return Ok(None),
        };
        Ok(Some(block))
    }

    pub fn id(&self) -> &str {
        match self {
            Block::LevelControl(b) => b.id(),
            Block::MuteControl(b) => b.id(),
            Block::SourceSelector(b) => b.id(),
            Block::DanteInput(b) | Block::DanteOutput(b) => b.id(),
            Block::GraphicEqualizer(b) => b.id(),
            Block::AudioOutput(b) => b.id(),
            Block::NoiseGenerator(b) => b.id(),
            Block::Ducker(b) => b.id(),
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Block::LevelControl(_) => BlockType::LevelControl,
            Block::MuteControl(_) => BlockType::MuteControl,
            Block::SourceSelector(_) => BlockType::SourceSelector,
            Block::DanteInput(_) => BlockType::DanteInput,
            Block::DanteOutput(_) => BlockType::DanteOutput,
            Block::GraphicEqualizer(_) => BlockType::GraphicEqualizer,
            Block::AudioOutput(_) => BlockType::AudioOutput,
            Block::NoiseGenerator(_) => BlockType::NoiseGenerator,
            Block::Ducker(_) => BlockType::Ducker,
        }
    }

    /// Re-poll live values from the device
    pub async fn refresh(&self) -> Result<()> {
        match self {
            Block::LevelControl(b) => b.refresh().await,
            Block::MuteControl(b) => b.refresh().await,
            Block::SourceSelector(b) => b.refresh().await,
            Block::DanteInput(b) | Block::DanteOutput(b) => b.refresh().await,
            Block::GraphicEqualizer(b) => b.refresh().await,
            Block::AudioOutput(b) => b.refresh().await,
            Block::NoiseGenerator(b) => b.refresh().await,
            Block::Ducker(b) => b.refresh().await,
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id())
            .field("type", &self.block_type())
            .finish()
    }
}
