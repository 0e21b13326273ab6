//! Async client for the Biamp Tesira Text Protocol (TTP)
//!
//! This library talks to Tesira DSP servers over a single persistent
//! connection. It supports:
//!
//! - Command/reply correlation with FIFO queueing (one request in flight)
//! - Subscription publishes delivered to the owning block
//! - Block discovery with a typed block map, exportable to skip discovery later
//! - Level, mute, source selector, Dante, graphic EQ, audio output, noise
//!   generator and ducker blocks
//! - Device identity, faults, network status and service commands
//! - Automatic reconnection with re-subscription
//!
//! # Quick Start
//!
//! ```no_run
//! use tesira_ttp::TesiraDsp;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dsp = TesiraDsp::connect_tcp("192.168.1.50", 23).await?;
//!
//!     // Control blocks
//!     let level = dsp.level_control("LevelTest")?;
//!     level.set_level(1, -20.0).await?;
//!     dsp.source_selector("SourceTest")?.select_source(2).await?;
//!
//!     // Watch live changes made on the device
//!     let mut updates = dsp.subscribe_updates();
//!     while let Ok(update) = updates.recv().await {
//!         println!("{}: {} = {}", update.block_id, update.attribute, update.value);
//!         break;
//!     }
//!
//!     // Skip discovery on the next start
//!     dsp.save_block_map("server").await?;
//!     dsp.disconnect().await;
//!     Ok(())
//! }
//! ```
//!
//! # Custom Transports
//!
//! The device is usually reached over SSH or telnet. Any
//! `AsyncRead + AsyncWrite` stream works; pass a closure that opens one:
//!
//! ```no_run
//! use tesira_ttp::{DspConfig, TesiraDsp};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connector = || TcpStream::connect("192.168.1.50:23");
//!     let config = DspConfig::default().with_block_map_file("server.bmap");
//!     let dsp = TesiraDsp::connect(connector, config).await?;
//!     println!("{} blocks", dsp.blocks().len());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Client**: `TesiraDsp`, the composition root
//! - **Blocks**: typed block handles over a shared channel model
//! - **Discovery**: alias probing, `BlockMap` and snapshots
//! - **Subscription**: token routing and update broadcast
//! - **Connection**: session state machine, read loop, reconnect
//! - **Protocol**: TTP command encoding and reply decoding
//! - **Transport**: byte stream boundary

mod blocks;
mod client;
mod config;
mod connection;
mod discovery;
mod error;
mod protocol;
mod subscription;
mod sync;
mod transport;
mod types;

// Public exports
pub use blocks::{
    AudioOutput, Block, BlockDescriptor, BlockLayout, BlockType, DanteBlock, Ducker,
    GraphicEqualizer, LevelControl, MuteControl, NoiseGenerator, SourceSelector,
};
pub use client::{TesiraDsp, DEFAULT_PORT};
pub use config::{BlockMapSource, DspConfig, ReconnectConfig, SessionConfig};
pub use connection::{Session, SessionState};
pub use discovery::{
    discover, query_aliases, BlockMap, BlockMapSnapshot, SNAPSHOT_EXTENSION, SNAPSHOT_FORMAT,
};
pub use error::{Result, TesiraError};
pub use protocol::{
    value_as_bool, value_as_f64, value_as_list, value_as_string, value_as_u32, Argument, Command,
    Reply, Target, Verb, DEVICE_TAG, SESSION_TAG,
};
pub use subscription::{BlockUpdate, Publication, PublicationSink, SubscriptionRouter, UpdateReceiver};
pub use transport::{BoxedTransport, Connector, TcpConnector, TransportStream};
pub use types::{
    Band, Channel, ChannelInfo, DeviceInfo, DuckerSettings, Fault, LevelRange, Source, SourceInfo,
    NO_FAULT_ID,
};
