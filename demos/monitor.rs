//! Connect to a Tesira server, list its blocks and print live changes.
//!
//! ```text
//! cargo run --example monitor -- <host> [port] [block-map-file]
//! ```
//!
//! When a block map file is given it is used to skip discovery, and is
//! (re)written after connecting.

use std::time::Duration;
use tesira_ttp::{Block, DspConfig, TcpConnector, TesiraDsp, DEFAULT_PORT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().ok_or("usage: monitor <host> [port] [block-map-file]")?;
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => DEFAULT_PORT,
    };
    let block_map = args.next();

    let mut config = DspConfig::default().with_subscription_refresh(Duration::from_secs(300));
    if let Some(path) = &block_map {
        config = config.with_block_map_file(path);
    }

    let dsp = TesiraDsp::connect(TcpConnector::new(host, port), config).await?;
    println!(
        "{} (S/N {}, firmware {})",
        dsp.hostname(),
        dsp.serial_number(),
        dsp.software_version()
    );

    for fault in dsp.faults().await? {
        println!("  fault: {} ({})", fault.name, fault.id);
    }

    for block in dsp.blocks() {
        print_block(&block);
    }
    for descriptor in dsp.descriptors() {
        if descriptor.block_type().is_none() {
            println!("{:<24} {} (not supported)", descriptor.id, descriptor.type_tag());
        }
    }

    if let Some(path) = &block_map {
        let written = dsp.save_block_map(path).await?;
        println!("Block map saved to {}", written.display());
    }

    println!("Watching for changes, Ctrl-C to quit");
    let mut updates = dsp.subscribe_updates();
    let mut state = dsp.watch_state();
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let index = update.index.map(|i| format!(" {i}")).unwrap_or_default();
                    println!("{} {}{} = {}", update.block_id, update.attribute, index, update.value);
                }
                Err(e) => {
                    eprintln!("Update stream: {e}");
                    if !matches!(e, tesira_ttp::TesiraError::Lagged(_)) {
                        break;
                    }
                }
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("Session {}", *state.borrow());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    dsp.disconnect().await;
    Ok(())
}

fn print_block(block: &Block) {
    match block {
        Block::LevelControl(level) => {
            println!("{:<24} LevelControl", level.id());
            for ch in level.channels() {
                println!(
                    "    {:>2} {:<20} {:>8.2} dB {}",
                    ch.index,
                    ch.label,
                    ch.level.unwrap_or_default(),
                    if ch.muted { "muted" } else { "" }
                );
            }
        }
        Block::MuteControl(mute) => {
            let ganged = if mute.ganged() { " (ganged)" } else { "" };
            println!("{:<24} MuteControl{}", mute.id(), ganged);
            for ch in mute.channels() {
                println!("    {:>2} {:<20} {}", ch.index, ch.label, if ch.muted { "muted" } else { "on" });
            }
        }
        Block::SourceSelector(selector) => {
            println!("{:<24} SourceSelector", selector.id());
            for source in selector.sources() {
                let marker = if source.selected { "*" } else { " " };
                println!("  {} {:>2} {:<20} {:>8.2} dB", marker, source.index, source.label, source.level);
            }
        }
        Block::DanteInput(dante) | Block::DanteOutput(dante) => {
            println!("{:<24} {}", dante.id(), dante.block_type());
            for ch in dante.channels() {
                println!(
                    "    {:>2} {:<20} {:>8.2} dB{}{}",
                    ch.index,
                    ch.label,
                    ch.level.unwrap_or_default(),
                    if ch.muted { " muted" } else { "" },
                    if ch.inverted == Some(true) { " inverted" } else { "" }
                );
            }
        }
        Block::GraphicEqualizer(geq) => {
            let bypassed = if geq.bypassed() { " (bypassed)" } else { "" };
            println!("{:<24} GraphicEqualizer{}", geq.id(), bypassed);
            let gains: Vec<String> = geq.bands().iter().map(|b| format!("{:+.1}", b.gain)).collect();
            println!("    {}", gains.join(" "));
        }
        Block::AudioOutput(output) => {
            println!("{:<24} AudioOutput (polled)", output.id());
            for ch in output.channels() {
                println!(
                    "    {:>2} {:<20} {:>8.2} dB{}{}",
                    ch.index,
                    ch.label,
                    ch.level.unwrap_or_default(),
                    if ch.muted { " muted" } else { "" },
                    if ch.inverted == Some(true) { " inverted" } else { "" }
                );
            }
        }
        Block::NoiseGenerator(noise) => {
            println!("{:<24} NoiseGenerator (polled)", noise.id());
            for ch in noise.channels() {
                let muted = if ch.muted { " muted" } else { "" };
                println!("    {:>2} {:>8.2} dB{}", ch.index, ch.level.unwrap_or_default(), muted);
            }
        }
        Block::Ducker(ducker) => {
            let s = ducker.settings();
            let bypassed = if s.bypassed { " (bypassed)" } else { "" };
            println!("{:<24} Ducker{} (polled)", ducker.id(), bypassed);
            println!(
                "    threshold {:.1} dB, ducking {:.1} dB, attack {:.0} ms, release {:.0} ms",
                s.threshold, s.ducking_level, s.attack_time, s.release_time
            );
        }
    }
}
