use crate::blocks::{
    AudioOutput, Block, BlockDescriptor, BlockType, DanteBlock, Ducker, GraphicEqualizer,
    LevelControl, MuteControl, NoiseGenerator, SourceSelector,
};
use crate::config::{BlockMapSource, DspConfig};
use crate::connection::{Session, SessionState};
use crate::discovery::{discover, query_aliases, BlockMap, BlockMapSnapshot};
use crate::error::{Result, TesiraError};
use crate::protocol::{value_as_string, Command, Target};
use crate::subscription::{SubscriptionRouter, UpdateReceiver};
use crate::sync::lock;
use crate::transport::{Connector, TcpConnector};
use crate::types::{parse_faults, DeviceInfo, Fault};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default TTP port (telnet)
pub const DEFAULT_PORT: u16 = 23;

/// Client for a Biamp Tesira DSP
///
/// `TesiraDsp` connects a session, identifies the device, builds the block
/// map (from a saved snapshot or by discovery) and keeps every supported
/// block subscribed to live changes.
pub struct TesiraDsp {
    session: Arc<Session>,
    router: Arc<SubscriptionRouter>,
    block_map: Mutex<BlockMap>,
    hostname: String,
    serial_number: String,
    software_version: String,
    aliases: Vec<String>,
    ready: AtomicBool,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl TesiraDsp {
    /// Connect to the TTP port of a device over plain TCP with default settings
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tesira_ttp::TesiraDsp;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let dsp = TesiraDsp::connect_tcp("192.168.1.50", 23).await?;
    ///     println!("{} runs {}", dsp.hostname(), dsp.software_version());
    ///
    ///     let level = dsp.level_control("LevelTest")?;
    ///     level.set_level(1, -20.0).await?;
    ///
    ///     dsp.disconnect().await;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect_tcp(host: impl Into<String>, port: u16) -> Result<Self> {
        Self::connect(TcpConnector::new(host, port), DspConfig::default()).await
    }

    /// Connect through any transport connector
    ///
    /// Returns once the block map is built and every block has been
    /// refreshed and subscribed.
    pub async fn connect(connector: impl Connector, config: DspConfig) -> Result<Self> {
        let router = Arc::new(SubscriptionRouter::new(config.session.publish_interval));
        let session = Arc::new(Session::new(
            connector,
            Arc::clone(&router),
            config.session.clone(),
        ));
        session.connect().await?;

        match Self::initialize(Arc::clone(&session), Arc::clone(&router), &config).await {
            Ok(dsp) => Ok(dsp),
            Err(e) => {
                tracing::error!("DSP initialization failed: {}", e);
                session.disconnect().await;
                router.clear();
                Err(e)
            }
        }
    }

    async fn initialize(
        session: Arc<Session>,
        router: Arc<SubscriptionRouter>,
        config: &DspConfig,
    ) -> Result<Self> {
        let hostname = device_string(&session, "hostname").await?;
        let software_version = device_string(&session, "version").await?;
        let serial_number = device_string(&session, "serialNumber").await?;
        let aliases = query_aliases(&session).await?;
        tracing::info!(
            "Connected to '{}' (S/N {}; software version {}; {} aliases)",
            hostname,
            serial_number,
            software_version,
            aliases.len()
        );

        let descriptors = match load_snapshot(config.block_map.as_ref(), &hostname, &aliases).await {
            Some(snapshot) => snapshot.blocks,
            None => discover(&session, &aliases).await?,
        };

        let mut block_map = BlockMap::new(descriptors.clone());
        for descriptor in &descriptors {
            if let Some(block_type) = descriptor.block_type() {
                if config.skip_block_types.contains(&block_type) {
                    tracing::info!(block = %descriptor.id, "Load skipped ({} excluded)", block_type);
                    continue;
                }
            }

            match Block::open(Arc::clone(&session), descriptor).await {
                Ok(Some(block)) => {
                    tracing::debug!(block = %descriptor.id, "Loaded {}", descriptor.type_tag());
                    block_map.insert(block);
                }
                Ok(None) => {
                    tracing::debug!(block = %descriptor.id, "Unsupported type {}", descriptor.type_tag());
                }
                Err(e @ TesiraError::Device { .. }) => {
                    tracing::warn!(block = %descriptor.id, error = %e, "Block failed to load");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "Block map ready: {} live blocks, {} descriptors",
            block_map.len(),
            descriptors.len()
        );

        let dsp = Self {
            session,
            router,
            block_map: Mutex::new(block_map),
            hostname,
            serial_number,
            software_version,
            aliases,
            ready: AtomicBool::new(true),
            refresh_task: Mutex::new(None),
        };
        if let Some(interval) = config.subscription_refresh_interval {
            dsp.start_subscription_refresh(interval);
        }
        Ok(dsp)
    }

    /// Periodically re-issue every subscription so they survive device
    /// configuration changes
    fn start_subscription_refresh(&self, interval: Duration) {
        let session = Arc::downgrade(&self.session);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                if !session.is_ready() {
                    continue;
                }
                if let Err(e) = session.resubscribe().await {
                    tracing::warn!("Subscription refresh failed: {}", e);
                }
            }
        });
        *lock(&self.refresh_task) = Some(handle);
    }

    /// True once the block map is built and the session is connected
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && self.session.is_ready()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Watch session state transitions (e.g. to notice reconnects)
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    // ========== Device ==========

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn software_version(&self) -> &str {
        &self.software_version
    }

    /// Aliases reported by the device at connection time
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Active faults, queried fresh
    pub async fn faults(&self) -> Result<Vec<Fault>> {
        let value = self.device_get("activeFaultList").await?;
        Ok(parse_faults(&value))
    }

    pub async fn network_status(&self) -> Result<Value> {
        self.device_get("networkStatus").await
    }

    /// Other Tesira servers seen on the network
    pub async fn discovered_servers(&self) -> Result<Value> {
        self.device_get("discoveredServers").await
    }

    /// Identity plus freshly queried faults and network status
    pub async fn device_info(&self) -> Result<DeviceInfo> {
        Ok(DeviceInfo {
            hostname: self.hostname.clone(),
            serial_number: self.serial_number.clone(),
            software_version: self.software_version.clone(),
            faults: self.faults().await?,
            network_status: self.network_status().await?,
        })
    }

    pub async fn start_system_audio(&self) -> Result<()> {
        self.device_service("startAudio").await
    }

    pub async fn stop_system_audio(&self) -> Result<()> {
        self.device_service("stopAudio").await
    }

    /// Reboot the device. The session will degrade and try to reconnect.
    pub async fn reboot(&self) -> Result<()> {
        self.device_service("reboot").await
    }

    /// Send a raw TTP line and return the reply value
    pub async fn device_command(&self, line: &str) -> Result<Value> {
        self.session.send_line(line).await
    }

    async fn device_get(&self, attribute: &str) -> Result<Value> {
        self.session
            .send(&Command::get(Target::Device, attribute))
            .await
    }

    async fn device_service(&self, service: &str) -> Result<()> {
        tracing::info!("Device service: {}", service);
        self.session
            .send(&Command::invoke(Target::Device, service))
            .await?;
        Ok(())
    }

    // ========== Blocks ==========

    /// All live blocks, ordered by id
    pub fn blocks(&self) -> Vec<Block> {
        lock(&self.block_map).blocks().cloned().collect()
    }

    /// Get a live block by id
    pub fn block(&self, id: &str) -> Result<Block> {
        lock(&self.block_map)
            .get(id)
            .cloned()
            .ok_or_else(|| TesiraError::BlockNotFound(id.to_string()))
    }

    /// Every discovered block, including unsupported and skipped ones
    pub fn descriptors(&self) -> Vec<BlockDescriptor> {
        lock(&self.block_map).descriptors().to_vec()
    }

    pub fn level_control(&self, id: &str) -> Result<LevelControl> {
        match self.block(id)? {
            Block::LevelControl(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::LevelControl)),
        }
    }

    pub fn mute_control(&self, id: &str) -> Result<MuteControl> {
        match self.block(id)? {
            Block::MuteControl(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::MuteControl)),
        }
    }

    pub fn source_selector(&self, id: &str) -> Result<SourceSelector> {
        match self.block(id)? {
            Block::SourceSelector(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::SourceSelector)),
        }
    }

    pub fn dante_input(&self, id: &str) -> Result<DanteBlock> {
        match self.block(id)? {
            Block::DanteInput(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::DanteInput)),
        }
    }

    pub fn dante_output(&self, id: &str) -> Result<DanteBlock> {
        match self.block(id)? {
            Block::DanteOutput(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::DanteOutput)),
        }
    }

    pub fn graphic_equalizer(&self, id: &str) -> Result<GraphicEqualizer> {
        match self.block(id)? {
            Block::GraphicEqualizer(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::GraphicEqualizer)),
        }
    }

    pub fn audio_output(&self, id: &str) -> Result<AudioOutput> {
        match self.block(id)? {
            Block::AudioOutput(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::AudioOutput)),
        }
    }

    pub fn noise_generator(&self, id: &str) -> Result<NoiseGenerator> {
        match self.block(id)? {
            Block::NoiseGenerator(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::NoiseGenerator)),
        }
    }

    pub fn ducker(&self, id: &str) -> Result<Ducker> {
        match self.block(id)? {
            Block::Ducker(b) => Ok(b),
            other => Err(wrong_type(&other, BlockType::Ducker)),
        }
    }

    // ========== Block map ==========

    /// Export the block map for a faster next connection
    pub fn export_block_map(&self) -> BlockMapSnapshot {
        BlockMapSnapshot::new(&self.hostname, &self.aliases, self.descriptors())
    }

    /// Save the block map; a `.bmap` extension is enforced
    pub async fn save_block_map(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        self.export_block_map().save(path).await
    }

    // ========== Updates ==========

    /// Subscribe to block updates caused by device publishes
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(dsp: tesira_ttp::TesiraDsp) -> tesira_ttp::Result<()> {
    /// let mut updates = dsp.subscribe_updates();
    /// while let Ok(update) = updates.recv().await {
    ///     println!("{} {} {:?} = {}", update.block_id, update.attribute, update.index, update.value);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn subscribe_updates(&self) -> UpdateReceiver {
        self.router.subscribe_updates()
    }

    /// Cancel subscriptions on the device, then close the session and drop every block
    pub async fn disconnect(&self) {
        self.ready.store(false, Ordering::Release);
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
        if self.session.is_ready() {
            self.unsubscribe_all().await;
        }
        self.session.disconnect().await;
        self.router.clear();
        lock(&self.block_map).clear();
    }

    /// Best effort: stops at the first failure that is not a device error
    async fn unsubscribe_all(&self) {
        let commands = self.router.unsubscribe_commands();
        tracing::debug!("Cancelling {} subscriptions", commands.len());
        for command in commands {
            match self.session.send(&command).await {
                Ok(_) => {}
                Err(e @ TesiraError::Device { .. }) => {
                    tracing::debug!(command = %command.encode(), error = %e, "Unsubscribe rejected");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Unsubscribe failed, closing anyway");
                    break;
                }
            }
        }
    }
}

impl Drop for TesiraDsp {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.refresh_task).take() {
            task.abort();
        }
        self.router.clear();
    }
}

async fn device_string(session: &Session, attribute: &str) -> Result<String> {
    let value = session
        .send(&Command::get(Target::Device, attribute))
        .await?;
    value_as_string(&value)
}

/// Resolve the configured block map, or `None` to run discovery
async fn load_snapshot(
    source: Option<&BlockMapSource>,
    hostname: &str,
    aliases: &[String],
) -> Option<BlockMapSnapshot> {
    let snapshot = match source? {
        BlockMapSource::Snapshot(snapshot) => snapshot.clone(),
        BlockMapSource::File(path) => match BlockMapSnapshot::load(path).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Cannot use block map {}: {}", path.display(), e);
                return None;
            }
        },
    };

    match snapshot.validate(hostname, aliases) {
        Ok(()) => {
            tracing::info!("Using saved block map ({} blocks)", snapshot.blocks.len());
            Some(snapshot)
        }
        Err(e) => {
            tracing::warn!("Saved block map ignored: {}", e);
            None
        }
    }
}

fn wrong_type(block: &Block, expected: BlockType) -> TesiraError {
    TesiraError::validation(format!(
        "'{}' is a {}, not a {}",
        block.id(),
        block.block_type(),
        expected
    ))
}
