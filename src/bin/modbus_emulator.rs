use clap::{Parser, Subcommand};
use log::{error, info};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use modbus_emulator::{logging, Emulator, EmulatorConfig, History, ModbusResult, SocketConfig};

/// Replay captured Modbus devices as live servers
#[derive(Parser)]
#[command(name = "modbus_emulator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every configured server and replay the capture
    Run {
        /// Configuration file path
        #[arg(short, long, default_value = "emulator.toml")]
        config: PathBuf,

        /// Stop each server after one pass, overriding the file
        #[arg(long)]
        one_shot: bool,

        /// Hold every server until any of them gets a client, overriding the file
        #[arg(long)]
        simultaneous: bool,
    },

    /// Write a configuration template
    GenConfig {
        /// Output file path (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Correlate the capture and print every history as JSON
    Parse {
        /// Configuration file path
        #[arg(short, long, default_value = "emulator.toml")]
        config: PathBuf,
    },
}

#[derive(Serialize)]
struct ParsedSocket {
    socket: SocketConfig,
    history: History,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Commands) -> ModbusResult<()> {
    match command {
        Commands::Run { config, one_shot, simultaneous } => {
            let mut config = EmulatorConfig::from_file(&config)?;
            config.one_shot |= one_shot;
            config.simultaneous |= simultaneous;
            logging::init(&config.log_level);
            info!("🚀 {}", modbus_emulator::info());
            Emulator::run(config).await
        }
        Commands::GenConfig { output } => {
            let text = EmulatorConfig::template().to_toml_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    println!("✅ Configuration template written to {}", path.display());
                }
                None => print!("{}", text),
            }
            Ok(())
        }
        Commands::Parse { config } => {
            let config = EmulatorConfig::from_file(&config)?;
            logging::init(&config.log_level);
            let parsed: Vec<ParsedSocket> = Emulator::parse_histories(&config)
                .await?
                .into_iter()
                .map(|(socket, history)| ParsedSocket { socket, history })
                .collect();
            println!("{}", serde_json::to_string_pretty(&parsed)?);
            Ok(())
        }
    }
}
