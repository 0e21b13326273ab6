use crate::blocks::{Block, BlockDescriptor, BlockLayout, BlockType};
use crate::connection::Session;
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_list, value_as_string, Command, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Current block map file format
pub const SNAPSHOT_FORMAT: u32 = 1;

/// Extension enforced on saved block map files
pub const SNAPSHOT_EXTENSION: &str = "bmap";

/// Alias the device reports for itself; it is not a DSP block
const DEVICE_ALIAS: &str = "device";

/// Suffix of the interface name the device reports for a block
const INTERFACE_SUFFIX: &str = "Interface::Attributes";

/// List every alias (instance tag) configured on the device
pub async fn query_aliases(session: &Session) -> Result<Vec<String>> {
    let value = session.send(&Command::get(Target::Session, "aliases")).await?;
    value_as_list(&value)?.iter().map(value_as_string).collect()
}

/// Discover blocks by probing every alias for its type and layout
///
/// Every known type has its layout recorded, so the result does not depend
/// on which types a caller later chooses to load. Types this crate does not
/// drive are recorded as `Unsupported` without querying their attributes.
pub async fn discover(session: &Session, aliases: &[String]) -> Result<Vec<BlockDescriptor>> {
    tracing::info!("Starting block discovery over {} aliases", aliases.len());

    let mut descriptors = Vec::new();
    for (i, alias) in aliases.iter().enumerate() {
        if alias == DEVICE_ALIAS {
            continue;
        }

        let Some(type_tag) = query_block_type(session, alias).await? else {
            tracing::debug!(block = %alias, "No interface reported, skipping");
            continue;
        };
        tracing::debug!("(discovery {}/{}) {} -> {}", i + 1, aliases.len(), alias, type_tag);

        let layout = match BlockType::from_tag(&type_tag) {
            Some(block_type) => BlockLayout::query(session, alias, block_type).await?,
            None => BlockLayout::Unsupported { type_tag },
        };
        descriptors.push(BlockDescriptor {
            id: alias.clone(),
            layout,
        });
    }

    tracing::info!("Found {} DSP blocks", descriptors.len());
    Ok(descriptors)
}

/// Ask a block for a nonexistent attribute; the error names its interface
async fn query_block_type(session: &Session, alias: &str) -> Result<Option<String>> {
    let command = Command::get(Target::block(alias), "BLOCKTYPE");
    let message = match session.send(&command).await {
        Err(TesiraError::Device { message, .. }) => message,
        Ok(value) => value_as_string(&value).unwrap_or_default(),
        Err(e) => return Err(e),
    };
    Ok(parse_block_type(&message))
}

/// Extract `LevelControl` from `... LevelControlInterface::Attributes`
fn parse_block_type(message: &str) -> Option<String> {
    let last = message.split_whitespace().last()?.trim_matches('"');
    let tag = last.strip_suffix(INTERFACE_SUFFIX)?;
    (!tag.is_empty()).then(|| tag.to_string())
}

/// Discovered descriptors and the live blocks built from them
#[derive(Debug, Default)]
pub struct BlockMap {
    descriptors: Vec<BlockDescriptor>,
    blocks: BTreeMap<String, Block>,
}

impl BlockMap {
    pub fn new(descriptors: Vec<BlockDescriptor>) -> Self {
        Self {
            descriptors,
            blocks: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, block: Block) {
        self.blocks.insert(block.id().to_string(), block);
    }

    /// Every descriptor, including inert ones, in discovery order
    pub fn descriptors(&self) -> &[BlockDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: &str) -> Option<&BlockDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Get a live block by id
    pub fn get(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Live blocks ordered by id
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    /// Number of live blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.blocks.clear();
    }
}

/// Exported block map, used to skip discovery on the next connection
///
/// # Example
///
/// ```no_run
/// # async fn example(dsp: tesira_ttp::TesiraDsp) -> tesira_ttp::Result<()> {
/// let path = dsp.save_block_map("lobby").await?; // written to lobby.bmap
/// let snapshot = tesira_ttp::BlockMapSnapshot::load(&path).await?;
/// println!("{} blocks", snapshot.blocks.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMapSnapshot {
    pub format: u32,

    /// Version of this crate that wrote the snapshot
    pub library_version: String,

    pub hostname: String,

    /// Sorted alias list of the device at export time
    pub aliases: Vec<String>,

    pub blocks: Vec<BlockDescriptor>,
}

impl BlockMapSnapshot {
    pub fn new(hostname: impl Into<String>, aliases: &[String], blocks: Vec<BlockDescriptor>) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            library_version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname.into(),
            aliases: sorted(aliases),
            blocks,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the snapshot, forcing the `.bmap` extension; returns the path written
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let path = path.as_ref();
        let path = if path.extension().is_some_and(|ext| ext == SNAPSHOT_EXTENSION) {
            path.to_path_buf()
        } else {
            let mut name = path.as_os_str().to_owned();
            name.push(".");
            name.push(SNAPSHOT_EXTENSION);
            PathBuf::from(name)
        };
        tokio::fs::write(&path, self.to_json()?).await?;
        tracing::info!("Saved block map to {}", path.display());
        Ok(path)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    /// Check that the snapshot describes the connected device
    pub fn validate(&self, hostname: &str, aliases: &[String]) -> Result<()> {
        if self.format != SNAPSHOT_FORMAT {
            return Err(TesiraError::SnapshotRejected(format!(
                "format {} (expected {})",
                self.format, SNAPSHOT_FORMAT
            )));
        }
        if self.hostname != hostname {
            return Err(TesiraError::SnapshotRejected(format!(
                "hostname '{}' (device is '{}')",
                self.hostname, hostname
            )));
        }
        if sorted(&self.aliases) != sorted(aliases) {
            return Err(TesiraError::SnapshotRejected("alias list changed".to_string()));
        }
        if let Some(stray) = self.blocks.iter().find(|b| !aliases.contains(&b.id)) {
            return Err(TesiraError::SnapshotRejected(format!(
                "block '{}' is not an alias on the device",
                stray.id
            )));
        }
        // Discovery records a layout for every known type
        let stale = self.blocks.iter().find(|b| match &b.layout {
            BlockLayout::Unsupported { type_tag } => BlockType::from_tag(type_tag).is_some(),
            _ => false,
        });
        if let Some(stale) = stale {
            return Err(TesiraError::SnapshotRejected(format!(
                "block '{}' has no recorded {} layout",
                stale.id,
                stale.type_tag()
            )));
        }
        Ok(())
    }
}

fn sorted(aliases: &[String]) -> Vec<String> {
    let mut aliases = aliases.to_vec();
    aliases.sort();
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelInfo;

    fn aliases() -> Vec<String> {
        ["device", "Mute1", "Level1"].iter().map(|s| s.to_string()).collect()
    }

    fn snapshot() -> BlockMapSnapshot {
        BlockMapSnapshot::new(
            "TesiraServer91",
            &aliases(),
            vec![BlockDescriptor {
                id: "Level1".into(),
                layout: BlockLayout::LevelControl {
                    channels: vec![ChannelInfo {
                        index: 1,
                        label: "Mic".into(),
                        range: Some(crate::types::LevelRange::new(-100.0, 12.0)),
                    }],
                },
            }],
        )
    }

    #[test]
    fn parses_interface_name_from_error() {
        assert_eq!(
            parse_block_type("Unknown attribute BLOCKTYPE in LevelControlInterface::Attributes"),
            Some("LevelControl".to_string())
        );
        assert_eq!(
            parse_block_type(r#"address not found "DanteInputInterface::Attributes""#),
            Some("DanteInput".to_string())
        );
        assert_eq!(parse_block_type("address not found"), None);
        assert_eq!(parse_block_type("Interface::Attributes"), None);
    }

    #[test]
    fn aliases_are_stored_sorted() {
        assert_eq!(snapshot().aliases, vec!["Level1", "Mute1", "device"]);
    }

    #[test]
    fn json_round_trip() {
        let snapshot = snapshot();
        let parsed = BlockMapSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn validation_accepts_same_device_in_any_alias_order() {
        let mut reordered = aliases();
        reordered.reverse();
        assert!(snapshot().validate("TesiraServer91", &reordered).is_ok());
    }

    #[test]
    fn validation_rejects_mismatches() {
        let snapshot = snapshot();
        assert!(matches!(
            snapshot.validate("OtherServer", &aliases()),
            Err(TesiraError::SnapshotRejected(_))
        ));

        let mut more = aliases();
        more.push("Level2".into());
        assert!(snapshot.validate("TesiraServer91", &more).is_err());

        let mut old = snapshot.clone();
        old.format = 0;
        assert!(old.validate("TesiraServer91", &aliases()).is_err());
    }

    #[test]
    fn validation_rejects_known_type_without_layout() {
        let mut snapshot = snapshot();
        snapshot.blocks.push(BlockDescriptor {
            id: "Mute1".into(),
            layout: BlockLayout::Unsupported {
                type_tag: "MuteControl".into(),
            },
        });
        assert!(matches!(
            snapshot.validate("TesiraServer91", &aliases()),
            Err(TesiraError::SnapshotRejected(_))
        ));

        snapshot.blocks[1].layout = BlockLayout::Unsupported {
            type_tag: "RoomCombiner".into(),
        };
        assert!(snapshot.validate("TesiraServer91", &aliases()).is_ok());
    }

    #[tokio::test]
    async fn save_enforces_extension() {
        let dir = tempfile::tempdir().unwrap();
        let written = snapshot().save(dir.path().join("lobby")).await.unwrap();
        assert_eq!(written, dir.path().join("lobby.bmap"));

        let loaded = BlockMapSnapshot::load(&written).await.unwrap();
        assert_eq!(loaded, snapshot());

        let kept = snapshot().save(dir.path().join("hall.bmap")).await.unwrap();
        assert_eq!(kept, dir.path().join("hall.bmap"));
    }
}
