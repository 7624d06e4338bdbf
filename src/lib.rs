//! # Modbus Emulator - Replay Captured Modbus Devices
//!
//! Replays the register state of real Modbus devices from a packet capture.
//! For every configured device the emulator correlates the recorded requests
//! and responses into a history, binds a live Modbus server and plays the
//! history back at its original pace once the first client connects.
//!
//! ## Features
//!
//! - **📼 Capture Replay**: pcap / pcapng input filtered per device socket
//! - **🔧 Two Wire Variants**: Modbus TCP (MBAP) and Modbus RTU carried over TCP
//! - **⏱️ Faithful Timing**: events applied with the gaps recorded in the capture
//! - **⏪ Rewind**: jump any running server to an earlier event or point in time
//! - **🔄 One-Shot or Looping**: stop after one pass or restart from the beginning
//! - **🚦 Simultaneous Start**: hold every server until any of them gets a client
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Replayed | Served |
//! |------|----------|----------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_emulator::{Emulator, EmulatorConfig, ModbusResult};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = EmulatorConfig::from_file("emulator.toml")?;
//!     Emulator::run(config).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Capture File   │    │  Modbus Client  │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Correlator    │    │    Listener     │
//! │   (History)     │    │   (TCP/RTU)     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │  Replay Engine  │───►│ Register Banks  │
//! └─────────────────┘    └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Server Registry │
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus frame layouts for both wire variants
pub mod protocol;

/// Packet capture reading
pub mod capture;

/// Request/response correlation into replayable histories
pub mod history;

/// Thread-safe register storage shared by replay and listener
pub mod register_bank;

/// Process-wide table of emulated servers
pub mod registry;

/// Per-server history playback
pub mod replay;

/// Modbus listener answering from the register banks
pub mod server;

/// TOML configuration
pub mod config;

/// Process-level orchestration
pub mod emulator;

/// Logging setup and frame tracing
pub mod logging;

// Re-export main types for convenience
pub use capture::{CapturedFrame, Direction, PacketSource, PcapFile, VecSource};
pub use config::{EmulatorConfig, SocketConfig};
pub use emulator::{build_history, Emulator};
pub use error::{ModbusError, ModbusResult};
pub use history::{correlate, EmulationData, Handshake, History, HistoryEvent};
pub use protocol::{ModbusFunction, Request, Response, WireMode};
pub use register_bank::{RegisterBank, SlaveBanks};
pub use registry::{ServerDescriptor, ServerRegistry, StartBarrier};
pub use replay::{ReplayEngine, ReplayState};
pub use server::{EmulationServer, EmulationServerConfig, ModbusServer, ServerStats};

use std::time::Duration;

/// Entries per register table (full 16-bit address space)
pub const REGISTER_BANK_SIZE: usize = 65536;

/// Pause after the last history event (3 seconds)
pub const DEFAULT_FINISH_DELAY: Duration = Duration::from_secs(3);

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Emulator v{} - capture replay for Modbus TCP and RTU-over-TCP devices", VERSION)
}
