/// Emulated Modbus listener
///
/// An `EmulationServer` exposes the register banks of one replayed device
/// over Modbus-TCP or Modbus-RTU-over-TCP. Client requests read and write
/// the same banks the replay engine drives. Every accepted client bumps a
/// connection counter that the replay engine waits on before it starts.

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;

use crate::error::{ModbusError, ModbusResult};
use crate::logging::hex_dump;
use crate::protocol::{
    data_utils, FrameHeader, MbapHeader, ModbusException, ModbusFunction, Request, RequestBody,
    RtuHeader, WireMode, COIL_ON, MBAP_HEADER_LEN, RTU_CHECK_FIELD_LEN,
};
use crate::register_bank::{RegisterBank, SlaveBanks};

/// Maximum frame size for Modbus TCP
const MAX_TCP_FRAME_SIZE: usize = 260;

/// Maximum frame size for Modbus RTU
const MAX_RTU_FRAME_SIZE: usize = 256;

/// Largest quantity of bits a read may request
const MAX_READ_BITS: u16 = 2000;

/// Largest quantity of registers a read may request
const MAX_READ_REGISTERS: u16 = 125;

pub(crate) const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus server trait
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Bind and start accepting clients
    async fn start(&mut self) -> ModbusResult<()>;

    /// Stop accepting and disconnect every client
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Check if server is running
    fn is_running(&self) -> bool;

    /// Get server statistics
    fn get_stats(&self) -> ServerStats;
}

/// Server statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub connections_count: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// Emulation listener configuration
#[derive(Debug, Clone)]
pub struct EmulationServerConfig {
    pub bind_address: SocketAddr,
    pub mode: WireMode,
    /// Clients silent for this long are disconnected
    pub idle_timeout: Duration,
}

impl EmulationServerConfig {
    pub fn new(bind_address: SocketAddr, mode: WireMode) -> Self {
        Self {
            bind_address,
            mode,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Listener serving the banks of one emulated device
pub struct EmulationServer {
    config: EmulationServerConfig,
    banks: SlaveBanks,
    stats: Arc<Mutex<ServerStats>>,
    shutdown_tx: broadcast::Sender<()>,
    external_stop: Option<broadcast::Receiver<()>>,
    connections_tx: Arc<watch::Sender<usize>>,
    is_running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl EmulationServer {
    pub fn new(config: EmulationServerConfig, banks: SlaveBanks) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (connections_tx, _) = watch::channel(0usize);
        Self {
            config,
            banks,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            shutdown_tx,
            external_stop: None,
            connections_tx: Arc::new(connections_tx),
            is_running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            start_time: None,
        }
    }

    /// Also shut down when `stop` fires (the registry's per-server stop channel)
    pub fn with_stop_signal(mut self, stop: broadcast::Receiver<()>) -> Self {
        self.external_stop = Some(stop);
        self
    }

    /// Counter of accepted client connections
    pub fn connections(&self) -> watch::Receiver<usize> {
        self.connections_tx.subscribe()
    }

    /// Bound address, available once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn mode(&self) -> WireMode {
        self.config.mode
    }

    /// Handle client connection
    async fn handle_client(
        stream: TcpStream,
        peer_addr: SocketAddr,
        mode: WireMode,
        banks: SlaveBanks,
        stats: Arc<Mutex<ServerStats>>,
        mut shutdown_rx: broadcast::Receiver<()>,
        idle_timeout: Duration,
    ) {
        info!("📡 New client connected: {}", peer_addr);

        let mut stream = stream;
        let mut buffer = vec![0u8; MAX_TCP_FRAME_SIZE];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Shutdown signal received for client {}", peer_addr);
                    break;
                }

                result = timeout(idle_timeout, stream.read(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => break,
                        Ok(Ok(bytes_read)) => {
                            update_stats(&stats, |stats| stats.bytes_received += bytes_read as u64);
                            pending.extend_from_slice(&buffer[..bytes_read]);

                            while let Some(len) = frame_len(mode, &pending) {
                                let frame: Vec<u8> = pending.drain(..len).collect();
                                let served = Self::serve_frame(
                                    &mut stream, mode, &frame, &banks, &stats,
                                )
                                .await;
                                if let Err(e) = served {
                                    error!("Failed to send response to {}: {}", peer_addr, e);
                                    return;
                                }
                            }

                            if pending.len() > MAX_TCP_FRAME_SIZE {
                                warn!(
                                    "Discarding {} unframed bytes from {}",
                                    pending.len(),
                                    peer_addr
                                );
                                pending.clear();
                            }
                        }
                        Ok(Err(e)) => {
                            error!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("Idle timeout from {}", peer_addr);
                            break;
                        }
                    }
                }
            }
        }

        info!("🔌 Client {} disconnected", peer_addr);
    }

    async fn serve_frame(
        stream: &mut TcpStream,
        mode: WireMode,
        frame: &[u8],
        banks: &SlaveBanks,
        stats: &Arc<Mutex<ServerStats>>,
    ) -> ModbusResult<()> {
        debug!("-> request: {}", hex_dump(frame));
        update_stats(stats, |stats| stats.total_requests += 1);

        let Some((response, ok)) = process_request(mode, frame, banks) else {
            update_stats(stats, |stats| stats.failed_requests += 1);
            return Ok(());
        };

        debug!("<- response: {}", hex_dump(&response));
        stream.write_all(&response).await?;
        update_stats(stats, |stats| {
            if ok {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
            stats.bytes_sent += response.len() as u64;
        });
        Ok(())
    }
}

fn update_stats(stats: &Arc<Mutex<ServerStats>>, f: impl FnOnce(&mut ServerStats)) {
    if let Ok(mut stats) = stats.lock() {
        f(&mut stats);
    }
}

/// Length of the first complete frame in `buf`, if one is complete
fn frame_len(mode: WireMode, buf: &[u8]) -> Option<usize> {
    match mode {
        WireMode::Tcp => {
            if buf.len() < MBAP_HEADER_LEN - 1 {
                return None;
            }
            let len = MBAP_HEADER_LEN - 1 + u16::from_be_bytes([buf[4], buf[5]]) as usize;
            (buf.len() >= len).then_some(len)
        }
        WireMode::RtuOverTcp => {
            let function = *buf.get(1)?;
            let len = match ModbusFunction::from_u8(function) {
                Ok(ModbusFunction::WriteMultipleCoils | ModbusFunction::WriteMultipleRegisters) => {
                    7 + *buf.get(6)? as usize + RTU_CHECK_FIELD_LEN
                }
                Ok(_) => 6 + RTU_CHECK_FIELD_LEN,
                // no way to size an unknown function; take what arrived
                Err(_) => buf.len().min(MAX_RTU_FRAME_SIZE),
            };
            (buf.len() >= len).then_some(len)
        }
    }
}

/// Build the response to one request frame
///
/// Returns the encoded response and whether it is a normal (non-exception)
/// answer; `None` when the frame is too damaged to address a reply.
pub fn process_request(
    mode: WireMode,
    frame: &[u8],
    banks: &SlaveBanks,
) -> Option<(Vec<u8>, bool)> {
    let request = match Request::decode(mode, frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting request {}: {}", hex_dump(frame), e);
            let header = request_header(mode, frame)?;
            return Some((encode_exception(&header, exception_for(&e)), false));
        }
    };

    let Some(bank) = banks.get(request.slave_id()) else {
        debug!("No bank for slave {}", request.slave_id());
        return Some((
            encode_exception(&request.header, ModbusException::GatewayTargetDeviceFailedToRespond),
            false,
        ));
    };

    match execute(&request, bank) {
        Ok(data) => Some((encode_response(&request.header, request.function_code(), &data), true)),
        Err(e) => {
            debug!("Request from slave {} failed: {}", request.slave_id(), e);
            Some((encode_exception(&request.header, exception_for(&e)), false))
        }
    }
}

/// Header of a request whose body could not be decoded
fn request_header(mode: WireMode, frame: &[u8]) -> Option<FrameHeader> {
    match mode {
        WireMode::Tcp => MbapHeader::decode(frame).ok().map(FrameHeader::Tcp),
        WireMode::RtuOverTcp => RtuHeader::decode(frame).ok().map(FrameHeader::RtuOverTcp),
    }
}

fn exception_for(error: &ModbusError) -> ModbusException {
    match error {
        ModbusError::InvalidFunction { .. } => ModbusException::IllegalFunction,
        ModbusError::InvalidAddress { .. } => ModbusException::IllegalDataAddress,
        ModbusError::Frame { .. } | ModbusError::InvalidData { .. } => {
            ModbusException::IllegalDataValue
        }
        _ => ModbusException::ServerDeviceFailure,
    }
}

/// Run a decoded request against `bank`, returning the response data after
/// the function code
fn execute(request: &Request, bank: &RegisterBank) -> ModbusResult<Vec<u8>> {
    let function = ModbusFunction::from_u8(request.function_code())?;

    match (&request.body, function) {
        (
            RequestBody::Read { address, quantity },
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs,
        ) => {
            if *quantity == 0 || *quantity > MAX_READ_BITS {
                return Err(ModbusError::invalid_data("Invalid quantity"));
            }
            let bits = if function == ModbusFunction::ReadCoils {
                bank.read_coils(*address, *quantity)?
            } else {
                bank.read_discrete_inputs(*address, *quantity)?
            };
            let packed = data_utils::pack_bits(&bits);
            let mut data = vec![packed.len() as u8];
            data.extend_from_slice(&packed);
            Ok(data)
        }
        (RequestBody::Read { address, quantity }, _) => {
            if *quantity == 0 || *quantity > MAX_READ_REGISTERS {
                return Err(ModbusError::invalid_data("Invalid quantity"));
            }
            let registers = if function == ModbusFunction::ReadHoldingRegisters {
                bank.read_holding_registers(*address, *quantity)?
            } else {
                bank.read_input_registers(*address, *quantity)?
            };
            let bytes = data_utils::registers_to_bytes(&registers);
            let mut data = vec![bytes.len() as u8];
            data.extend_from_slice(&bytes);
            Ok(data)
        }
        (RequestBody::WriteSingle { address, value }, ModbusFunction::WriteSingleCoil) => {
            let coil = match *value {
                0x0000 => false,
                COIL_ON => true,
                _ => return Err(ModbusError::invalid_data("Invalid coil value")),
            };
            bank.write_coil(*address, coil)?;
            Ok(echo(*address, *value))
        }
        (RequestBody::WriteSingle { address, value }, _) => {
            bank.write_register(*address, *value)?;
            Ok(echo(*address, *value))
        }
        (
            RequestBody::WriteMultiple { address, quantity, data, .. },
            ModbusFunction::WriteMultipleCoils,
        ) => {
            if *quantity == 0 || data.len() * 8 < *quantity as usize {
                return Err(ModbusError::invalid_data("Incomplete write multiple coils request"));
            }
            bank.write_coils(*address, &data_utils::unpack_bits(data, *quantity as usize))?;
            Ok(echo(*address, *quantity))
        }
        (RequestBody::WriteMultiple { address, quantity, data, .. }, _) => {
            if *quantity == 0 || data.len() != *quantity as usize * 2 {
                return Err(ModbusError::invalid_data(
                    "Incomplete write multiple registers request",
                ));
            }
            bank.write_registers(*address, &data_utils::bytes_to_registers(data)?)?;
            Ok(echo(*address, *quantity))
        }
    }
}

fn echo(address: u16, value: u16) -> Vec<u8> {
    let mut data = address.to_be_bytes().to_vec();
    data.extend_from_slice(&value.to_be_bytes());
    data
}

/// Frame `function` and `data` for the request's wire mode
fn encode_response(header: &FrameHeader, function: u8, data: &[u8]) -> Vec<u8> {
    match header {
        FrameHeader::Tcp(mbap) => {
            // unit id + function code + data
            let length = (data.len() + 2) as u16;
            let mut response = Vec::with_capacity(MBAP_HEADER_LEN + 1 + data.len());
            response.extend_from_slice(&mbap.transaction_id.to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&length.to_be_bytes());
            response.push(mbap.unit_id);
            response.push(function);
            response.extend_from_slice(data);
            response
        }
        FrameHeader::RtuOverTcp(rtu) => {
            let mut response = Vec::with_capacity(2 + data.len() + RTU_CHECK_FIELD_LEN);
            response.push(rtu.slave_address);
            response.push(function);
            response.extend_from_slice(data);
            let crc = CRC_MODBUS.checksum(&response);
            response.extend_from_slice(&crc.to_le_bytes());
            response
        }
    }
}

fn encode_exception(header: &FrameHeader, exception: ModbusException) -> Vec<u8> {
    debug!("Answering slave {} with exception 0x{:02X}: {}",
           header.slave_id(), exception.to_u8(), exception.description());
    encode_response(header, header.function_code() | 0x80, &[exception.to_u8()])
}

#[async_trait]
impl ModbusServer for EmulationServer {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(ModbusError::connection("Listener is already running"));
        }

        let bind_address = self.config.bind_address;
        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            ModbusError::connection(format!("Failed to bind to {}: {}", bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());
        self.is_running.store(true, Ordering::SeqCst);

        info!("🚀 Emulating {} device on {} ({} slaves)",
              self.config.mode, local_addr, self.banks.len());

        let mode = self.config.mode;
        let idle_timeout = self.config.idle_timeout;
        let banks = self.banks.clone();
        let stats = Arc::clone(&self.stats);
        let connections_tx = Arc::clone(&self.connections_tx);
        let is_running = Arc::clone(&self.is_running);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut external_stop = self.external_stop.take();

        tokio::spawn(async move {
            let external = async {
                match external_stop.as_mut() {
                    Some(stop) => {
                        let _ = stop.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(external);

            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                update_stats(&stats, |stats| stats.connections_count += 1);
                                connections_tx.send_modify(|count| *count += 1);

                                let banks = banks.clone();
                                let stats = Arc::clone(&stats);
                                let shutdown_rx = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    EmulationServer::handle_client(
                                        stream,
                                        peer_addr,
                                        mode,
                                        banks,
                                        stats,
                                        shutdown_rx,
                                        idle_timeout,
                                    )
                                    .await;
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                    _ = &mut external => {
                        let _ = shutdown_tx.send(());
                        break;
                    }
                }
            }

            is_running.store(false, Ordering::SeqCst);
            info!("⏹️ Listener on {} stopped", local_addr);
        });

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        let _ = self.shutdown_tx.send(());
        self.is_running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().map(|stats| stats.clone()).unwrap_or_default();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }
}
