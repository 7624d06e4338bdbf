//! Integration Tests for the Modbus Emulator
//!
//! Each test builds a history from in-memory captured frames, starts a real
//! listener on an ephemeral port and talks to it over TCP like a Modbus
//! client would.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use crc::{Crc, CRC_16_MODBUS};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use modbus_emulator::*;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

fn t(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::milliseconds(ms)
}

fn socket(protocol: WireMode) -> SocketConfig {
    SocketConfig {
        emulate: SocketAddr::from(([127, 0, 0, 1], 0)),
        dump: SocketAddr::from(([192, 168, 1, 10], 502)),
        protocol,
    }
}

fn config(one_shot: bool, finish_delay: Duration) -> EmulatorConfig {
    EmulatorConfig {
        one_shot,
        finish_delay,
        sockets: vec![socket(WireMode::Tcp)],
        ..EmulatorConfig::default()
    }
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Captured TCP write of `value` to holding register 0 of unit 1
fn tcp_write(source: VecSource, tid: u8, ms: i64, value: u16) -> VecSource {
    let [hi, lo] = value.to_be_bytes();
    let frame = vec![0, tid, 0, 0, 0, 6, 1, 6, 0, 0, hi, lo];
    source.request(t(ms), frame.clone()).response(t(ms), frame)
}

async fn read_holding(stream: &mut TcpStream, address: u16, quantity: u16) -> Vec<u16> {
    let [ahi, alo] = address.to_be_bytes();
    let [qhi, qlo] = quantity.to_be_bytes();
    stream
        .write_all(&[0x12, 0x34, 0, 0, 0, 6, 1, 3, ahi, alo, qhi, qlo])
        .await
        .unwrap();

    let mut response = vec![0u8; 9 + quantity as usize * 2];
    timeout(Duration::from_secs(1), stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&response[..2], &[0x12, 0x34]);
    assert_eq!(response[7], 3);
    assert_eq!(response[8] as usize, quantity as usize * 2);
    response[9..]
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

#[tokio::test]
async fn test_tcp_client_sees_replayed_registers() {
    logging::init_test_logger();

    // read of HR0..2 answered with [100, 200], then a write of 300 to HR0
    let source = VecSource::new()
        .request(t(0), vec![0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 2])
        .response(t(0), vec![0, 1, 0, 0, 0, 7, 1, 3, 4, 0, 100, 0, 200]);
    let source = tcp_write(source, 2, 200, 300);

    let cfg = config(true, Duration::from_millis(100));
    let history = build_history(source, &cfg.sockets[0]).await.unwrap();
    assert_eq!(history.len(), 2);

    let mut emulator = Emulator::new(cfg.clone());
    let id = emulator.start_socket(&cfg.sockets[0], history).await.unwrap();
    let registry = emulator.registry();
    assert!(!registry.descriptor(id).unwrap().working);

    let mut client = TcpStream::connect(emulator.local_addr(id).unwrap()).await.unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(read_holding(&mut client, 0, 2).await, vec![100, 200]);
    assert!(registry.descriptor(id).unwrap().working);
    assert_eq!(registry.descriptor(id).unwrap().current_time, Some(t(0)));

    sleep(Duration::from_millis(220)).await;
    assert_eq!(read_holding(&mut client, 0, 2).await, vec![300, 200]);

    timeout(Duration::from_secs(2), emulator.wait()).await.unwrap().unwrap();
    assert!(!registry.descriptor(id).unwrap().working);
}

#[tokio::test]
async fn test_rtu_over_tcp_coils_and_exceptions() {
    logging::init_test_logger();

    let source = VecSource::new()
        .request(t(0), with_crc(vec![1, 1, 0, 0, 0, 8]))
        .response(t(0), with_crc(vec![1, 1, 1, 0b0000_0101]));

    let mut cfg = config(true, Duration::from_millis(500));
    cfg.sockets = vec![socket(WireMode::RtuOverTcp)];
    let history = build_history(source, &cfg.sockets[0]).await.unwrap();

    let mut emulator = Emulator::new(cfg.clone());
    let id = emulator.start_socket(&cfg.sockets[0], history).await.unwrap();
    let mut client = TcpStream::connect(emulator.local_addr(id).unwrap()).await.unwrap();
    sleep(Duration::from_millis(80)).await;

    client.write_all(&with_crc(vec![1, 1, 0, 0, 0, 8])).await.unwrap();
    let mut response = [0u8; 6];
    timeout(Duration::from_secs(1), client.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(&response[..4], &[1, 1, 1, 0b0000_0101]);
    assert_eq!(response.to_vec(), with_crc(response[..4].to_vec()));

    // slave 9 never appeared in the capture
    client.write_all(&with_crc(vec![9, 3, 0, 0, 0, 1])).await.unwrap();
    let mut exception = [0u8; 5];
    timeout(Duration::from_secs(1), client.read_exact(&mut exception)).await.unwrap().unwrap();
    assert_eq!(&exception[..3], &[9, 0x83, 0x0B]);

    // 0x2B is not served
    client.write_all(&with_crc(vec![1, 0x2B, 0, 0, 0, 1])).await.unwrap();
    timeout(Duration::from_secs(1), client.read_exact(&mut exception)).await.unwrap().unwrap();
    assert_eq!(&exception[..3], &[1, 0xAB, 0x01]);

    emulator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rewind_to_time_replays_earlier_event() {
    logging::init_test_logger();

    let source = tcp_write(VecSource::new(), 1, 0, 10);
    let source = tcp_write(source, 2, 200, 20);
    let source = tcp_write(source, 3, 400, 30);

    let cfg = config(true, Duration::from_millis(600));
    let history = build_history(source, &cfg.sockets[0]).await.unwrap();
    let mut emulator = Emulator::new(cfg.clone());
    let id = emulator.start_socket(&cfg.sockets[0], history).await.unwrap();
    let registry = emulator.registry();

    // not playing yet
    assert!(registry.rewind_to_time(id, t(300)).is_err());

    let mut client = TcpStream::connect(emulator.local_addr(id).unwrap()).await.unwrap();
    sleep(Duration::from_millis(480)).await;
    assert_eq!(read_holding(&mut client, 0, 1).await, vec![30]);

    assert!(registry.rewind_to_time(id, t(400)).is_err());
    assert!(registry.rewind_to_time(id, t(0)).is_err());
    assert_eq!(registry.rewind_to_time(id, t(300)).unwrap(), 1);

    // picked up once the finish delay ends (~1000ms), next event at ~1200ms
    sleep(Duration::from_millis(620)).await;
    assert_eq!(read_holding(&mut client, 0, 1).await, vec![20]);
    assert_eq!(registry.descriptor(id).unwrap().current_time, Some(t(200)));

    timeout(Duration::from_secs(3), emulator.wait()).await.unwrap().unwrap();
    let banks = registry.slave_banks(id).unwrap();
    assert_eq!(banks.get(1).unwrap().read_holding_registers(0, 1).unwrap(), vec![30]);
}

#[tokio::test]
async fn test_continuous_mode_switched_to_one_shot() {
    logging::init_test_logger();

    let source = tcp_write(VecSource::new(), 1, 0, 1);
    let source = tcp_write(source, 2, 50, 2);

    let cfg = config(false, Duration::from_millis(50));
    let history = build_history(source, &cfg.sockets[0]).await.unwrap();
    let mut emulator = Emulator::new(cfg.clone());
    let id = emulator.start_socket(&cfg.sockets[0], history).await.unwrap();
    let registry = emulator.registry();
    assert!(!registry.is_one_shot(id).unwrap());

    let _client = TcpStream::connect(emulator.local_addr(id).unwrap()).await.unwrap();

    // several loops go by without the server stopping
    sleep(Duration::from_millis(350)).await;
    assert!(registry.descriptor(id).unwrap().working);

    registry.set_one_shot(None, true).unwrap();
    timeout(Duration::from_secs(2), emulator.wait()).await.unwrap().unwrap();
    assert!(!registry.descriptor(id).unwrap().working);
}

#[tokio::test]
async fn test_stop_all_ends_continuous_replay() {
    logging::init_test_logger();

    let mut emulator = Emulator::new(config(false, Duration::from_millis(50)));
    let mut ids = Vec::new();
    for value in [5u16, 6] {
        let socket = socket(WireMode::Tcp);
        let source = tcp_write(VecSource::new(), 1, 0, value);
        let history = build_history(source, &socket).await.unwrap();
        ids.push(emulator.start_socket(&socket, history).await.unwrap());
    }
    let registry = emulator.registry();
    assert_eq!(registry.len(), 2);

    let mut client = TcpStream::connect(emulator.local_addr(ids[1]).unwrap()).await.unwrap();
    sleep(Duration::from_millis(80)).await;
    assert_eq!(read_holding(&mut client, 0, 1).await, vec![6]);

    registry.stop_all().unwrap();
    assert!(registry.descriptors().unwrap().iter().all(|descriptor| !descriptor.working));
    assert!(registry.rewind(ids[1], 0).is_err());
    emulator.shutdown().await.unwrap();

    // the listener is gone with its server
    sleep(Duration::from_millis(50)).await;
    let mut buf = [0u8; 1];
    let closed = timeout(Duration::from_secs(1), client.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
}
