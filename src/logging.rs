//! Logging setup and frame formatting helpers
//!
//! The library logs through the `log` facade only. Binaries call [`init`]
//! once; tests call [`init_test_logger`].

use log::{debug, log_enabled, Level, LevelFilter};

use crate::capture::{CapturedFrame, Direction};
use crate::history::EmulationData;
use crate::protocol::ModbusFunction;

/// Install `env_logger` with `default_level`, unless `RUST_LOG` overrides it
pub fn init(default_level: &str) {
    let level = default_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Initialize simple logger for testing
pub fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Space separated upper-case hex, e.g. `00 01 00 00`
pub fn hex_dump(bytes: &[u8]) -> String {
    let encoded = hex::encode_upper(bytes);
    encoded
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Debug-log one captured frame
pub fn log_frame(direction: Direction, frame: &CapturedFrame) {
    if log_enabled!(Level::Debug) {
        let arrow = match direction {
            Direction::Destined => "->",
            Direction::Sourced => "<-",
        };
        debug!(
            "{} {} ({} bytes) @ {}: {}",
            arrow,
            direction,
            frame.payload.len(),
            frame.timestamp.format("%H:%M:%S%.6f"),
            hex_dump(&frame.payload)
        );
    }
}

/// One-line description of a normalized transaction
pub fn describe(data: &EmulationData) -> String {
    let function = ModbusFunction::from_u8(data.function_id)
        .map(|function| function.to_string())
        .unwrap_or_else(|_| format!("Unknown (0x{:02X})", data.function_id));
    format!(
        "{} @ {} x{}: {:?}",
        function, data.address, data.quantity, data.payload
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0x03, 0x10, 0xFF]), "01 03 10 FF");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_describe() {
        let data = EmulationData {
            function_id: 6,
            is_read_operation: true,
            address: 8,
            quantity: 1,
            payload: vec![39],
        };
        assert_eq!(describe(&data), "Write Single Register (0x06) @ 8 x1: [39]");
    }
}
