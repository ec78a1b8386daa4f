// src/main.rs
use clap::Parser;
use std::io::BufRead;
use std::sync::Arc;

use stepflow::mcu::{Mcu, SerialTransport};
use stepflow::{CommandDispatcher, EventBus, GCodeCommand, Reactor, ShutdownState, VirtualMcu};

#[derive(Parser)]
#[command(name = "stepflow", about = "Host-side motion core")]
struct Args {
    /// Printer configuration (TOML)
    #[arg(short, long)]
    config: String,

    /// G-code file to execute; reads stdin when omitted
    #[arg(short, long)]
    gcode: Option<String>,

    /// Log filter (e.g. "debug", "stepflow=trace")
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = args
        .log
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = stepflow::load_config(&args.config)?;
    let reactor = Reactor::new();
    let events = EventBus::default();
    let shutdown = ShutdownState::new();

    let transport: Arc<dyn stepflow::mcu::McuTransport> = match &config.mcu.serial {
        Some(device) => {
            tracing::info!("connecting to MCU on {device}");
            SerialTransport::open(device, config.mcu.baud)?
        }
        None => {
            tracing::info!("no serial device configured; using virtual MCU");
            Arc::new(VirtualMcu::new(config.mcu.frequency, reactor.clone()))
        }
    };
    let mcu = Arc::new(Mcu::new(
        config.mcu.frequency,
        reactor.clone(),
        transport,
        shutdown.clone(),
    ));
    let mut dispatcher = CommandDispatcher::build(&config, mcu, reactor, events, shutdown)?;

    let reader: Box<dyn BufRead> = match &args.gcode {
        Some(path) => Box::new(std::io::BufReader::new(std::fs::File::open(path)?)),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };
    for line in reader.lines() {
        let line = line?;
        let Some(cmd) = GCodeCommand::parse(&line) else {
            continue;
        };
        match dispatcher.execute(&cmd).await {
            Ok(msg) if msg.is_empty() => println!("ok"),
            Ok(msg) => {
                println!("{msg}");
                println!("ok");
            }
            Err(e) => println!("!! {e}"),
        }
    }
    dispatcher.toolhead_mut().wait_moves().await?;
    Ok(())
}
