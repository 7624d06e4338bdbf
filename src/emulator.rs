//! Process-level orchestration
//!
//! For every configured socket the emulator builds the history from the
//! capture, registers the server, binds its listener and spawns its replay
//! engine. Any setup failure aborts start-up.

use futures::future::join_all;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::capture::{PacketSource, PcapFile};
use crate::config::{EmulatorConfig, SocketConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::history::{correlate, History};
use crate::register_bank::SlaveBanks;
use crate::registry::{ServerDescriptor, ServerRegistry, StartBarrier};
use crate::replay::ReplayEngine;
use crate::server::{EmulationServer, EmulationServerConfig, ModbusServer};

struct RunningServer {
    id: usize,
    listener: EmulationServer,
    replay: JoinHandle<ModbusResult<()>>,
    close: oneshot::Receiver<()>,
}

/// All emulated servers of one process
pub struct Emulator {
    config: EmulatorConfig,
    registry: Arc<ServerRegistry>,
    barrier: Option<StartBarrier>,
    servers: Vec<RunningServer>,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let barrier = config.simultaneous.then(StartBarrier::new);
        Self {
            config,
            registry: Arc::new(ServerRegistry::new()),
            barrier,
            servers: Vec::new(),
        }
    }

    /// Validate `config`, start every socket and wait for them to finish
    pub async fn run(config: EmulatorConfig) -> ModbusResult<()> {
        config.validate()?;
        let mut emulator = Self::new(config);
        if let Err(e) = emulator.start().await {
            error!("❌ Start-up failed: {}", e);
            emulator.shutdown().await?;
            return Err(e);
        }
        emulator.wait().await
    }

    /// Registry shared with every server; the control surface of the process
    pub fn registry(&self) -> Arc<ServerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bound listener address of server `id`
    pub fn local_addr(&self, id: usize) -> Option<SocketAddr> {
        self.servers
            .iter()
            .find(|server| server.id == id)
            .and_then(|server| server.listener.local_addr())
    }

    /// Correlate the capture of every configured socket
    pub async fn parse_histories(
        config: &EmulatorConfig,
    ) -> ModbusResult<Vec<(SocketConfig, History)>> {
        let mut histories = Vec::with_capacity(config.sockets.len());
        for socket in &config.sockets {
            let source = PcapFile::new(&config.dump_file, socket.dump);
            let history = build_history(source, socket).await?;
            histories.push((socket.clone(), history));
        }
        Ok(histories)
    }

    /// Start every configured socket from the capture file
    pub async fn start(&mut self) -> ModbusResult<()> {
        for (socket, history) in Self::parse_histories(&self.config).await? {
            self.start_socket(&socket, history).await?;
        }
        info!("✅ {} servers emulating {}", self.servers.len(), self.config.dump_file.display());
        Ok(())
    }

    /// Register, bind and spawn one server; returns its id
    pub async fn start_socket(
        &mut self,
        socket: &SocketConfig,
        history: History,
    ) -> ModbusResult<usize> {
        if history.is_empty() {
            return Err(ModbusError::capture(format!(
                "no complete transactions for {} in {}",
                socket.dump,
                self.config.dump_file.display()
            )));
        }

        let banks = SlaveBanks::for_slaves(&history.slaves());
        let descriptor = ServerDescriptor::new(
            socket.emulate,
            socket.dump,
            socket.protocol,
            self.config.one_shot,
            &history,
        );
        let control = self.registry.register(descriptor, Arc::new(history), banks.clone())?;
        let id = control.id;

        let server_config = EmulationServerConfig::new(socket.emulate, socket.protocol);
        let mut listener = EmulationServer::new(server_config, banks)
            .with_stop_signal(self.registry.subscribe_stop(id)?);
        if let Err(e) = listener.start().await {
            self.registry.stop(id)?;
            return Err(e);
        }

        let mut engine = ReplayEngine::new(
            Arc::clone(&self.registry),
            control,
            listener.connections(),
            self.config.finish_delay,
        )?;
        if let Some(barrier) = &self.barrier {
            engine = engine.with_barrier(barrier.clone());
        }
        let close = engine.close_signal();
        let replay = tokio::spawn(engine.run());

        self.servers.push(RunningServer { id, listener, replay, close });
        Ok(id)
    }

    /// Wait until every server closes (one-shot) or ctrl-c, then stop all
    pub async fn wait(&mut self) -> ModbusResult<()> {
        let closes = join_all(self.servers.iter_mut().map(|server| &mut server.close));
        tokio::select! {
            _ = closes => info!("🏁 Every server finished its history"),
            _ = tokio::signal::ctrl_c() => info!("🛑 Interrupt received"),
        }
        self.shutdown().await
    }

    /// Stop each server and its listener individually
    pub async fn shutdown(&mut self) -> ModbusResult<()> {
        for server in &mut self.servers {
            self.registry.stop(server.id)?;
            server.listener.stop().await?;
        }

        for server in self.servers.drain(..) {
            match server.replay.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("⚠️ Server {} ended with error: {}", server.id, e),
                Err(e) => error!("❌ Server {} replay task failed: {}", server.id, e),
            }
        }
        Ok(())
    }
}

/// Correlate one socket's traffic off the async runtime
pub async fn build_history<S>(source: S, socket: &SocketConfig) -> ModbusResult<History>
where
    S: PacketSource + Send + 'static,
{
    let mode = socket.protocol;
    let dump = socket.dump;
    let history = tokio::task::spawn_blocking(move || correlate(&source, mode))
        .await
        .map_err(|e| {
            ModbusError::internal(format!("history build for {} panicked: {}", dump, e))
        })??;
    info!("📜 {} events for {} ({})", history.len(), dump, mode);
    Ok(history)
}
