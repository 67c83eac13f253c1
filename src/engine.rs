//! The polling worker and the handle consumers talk to.
//!
//! A [`PollingEngine`] owns the transport and the [`StateStore`]. Once
//! [started](PollingEngine::start) it runs as a single task that
//!
//! * reads every due [`Block`] in planned order,
//! * pauses for the quiet period after every frame,
//! * reconnects with a fixed backoff when the transport drops,
//! * executes writes queued through the [`EngineHandle`].
//!
//! Consumers only ever see immutable [`Snapshot`]s published after each
//! successful block and at the end of every scan.
//!
//! ```no_run
//! # async fn run(transport: impl volt_hub_lib::transport::Transport + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! use volt_hub_lib::{engine::{EngineConfig, PollingEngine}, model::Model};
//!
//! let catalog = Model::VoltSinusProUltra6000.catalog()?;
//! let handle = PollingEngine::new(catalog, transport, EngineConfig::default())?.start();
//! handle.write("volt_inverter_output_voltage_set", 230.0).await?;
//! println!("{:?}", handle.get("volt_battery_voltage"));
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::catalog::{Catalog, Primitive, RegisterDef};
use crate::composite;
use crate::error::{ConfigError, WriteError};
use crate::model::Model;
use crate::planner::{plan, Block};
use crate::protocol::{
    self, DecodeError, DEFAULT_OPERATION_TIMEOUT, DEFAULT_QUIET_PERIOD,
    DEFAULT_RECONNECT_BACKOFF, MAX_READ_SPAN,
};
use crate::store::{Snapshot, StateStore};
use crate::transport::{Transport, TransportError};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Tuning of the polling worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Modbus unit id of the device.
    pub unit_id: u8,
    /// Largest block the planner may build, in registers.
    pub max_span: u16,
    /// Pause after each frame for line turnaround.
    #[serde(with = "humantime_serde")]
    pub quiet_period: Duration,
    /// Pause after a failed reconnect.
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,
    /// Bound of a single connect, read or write.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unit_id: Model::default().default_unit_id(),
            max_span: MAX_READ_SPAN,
            quiet_period: DEFAULT_QUIET_PERIOD,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=MAX_READ_SPAN).contains(&self.max_span) {
            return Err(ConfigError::MaxSpan(self.max_span));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Outcome of one pass over all blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Every block was visited.
    Completed,
    /// The transport could not be connected; the pass was abandoned.
    Reconnecting,
    /// Cancellation was observed between two blocks.
    Cancelled,
}

#[derive(Debug)]
enum Command {
    Write {
        index: usize,
        address: u16,
        raw: u16,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// Single-writer polling worker for one device connection.
pub struct PollingEngine<T: Transport> {
    catalog: Arc<Catalog>,
    blocks: Vec<Block>,
    /// Owning block of every catalog entry; `None` for composites.
    block_of: Vec<Option<usize>>,
    /// Time of the last failed attempt per block, cleared by a successful read.
    failed_at: Vec<Option<Instant>>,
    store: StateStore,
    transport: T,
    config: EngineConfig,
    last_update_succeeded: bool,
    updated_at: Option<Instant>,
    snapshot_tx: watch::Sender<Arc<Snapshot>>,
    cancel: CancellationToken,
}

impl<T: Transport + 'static> PollingEngine<T> {
    /// Plans the blocks of `catalog` and prepares an idle engine.
    pub fn new(catalog: Catalog, transport: T, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let blocks = plan(&catalog, config.max_span);
        let mut block_of = vec![None; catalog.len()];
        for (position, block) in blocks.iter().enumerate() {
            for member in &block.members {
                block_of[member.index] = Some(position);
            }
        }
        let store = StateStore::new(&catalog);
        let (snapshot_tx, _) = watch::channel(Arc::new(store.snapshot(&catalog, false, None)));
        debug!(
            "Planned {} blocks for {} registers",
            blocks.len(),
            catalog.len()
        );
        Ok(Self {
            catalog: Arc::new(catalog),
            failed_at: vec![None; blocks.len()],
            blocks,
            block_of,
            store,
            transport,
            config,
            last_update_succeeded: false,
            updated_at: None,
            snapshot_tx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store
            .snapshot(&self.catalog, self.last_update_succeeded, self.updated_at)
    }

    /// Runs a single pass over the due blocks without spawning the worker.
    pub async fn poll_once(&mut self) -> Pass {
        self.scan(None).await
    }

    /// Spawns the worker on the current runtime.
    pub fn start(self) -> EngineHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let handle_parts = (
            self.catalog.clone(),
            Arc::new(self.blocks.clone()),
            self.snapshot_tx.subscribe(),
            self.cancel.clone(),
        );
        let worker = tokio::spawn(self.run(command_rx));
        let (catalog, blocks, snapshot, cancel) = handle_parts;
        EngineHandle {
            catalog,
            blocks,
            commands: command_tx,
            snapshot,
            cancel,
            worker,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Polling started with {} blocks", self.blocks.len());
        let cancel = self.cancel.clone();
        let mut commands_open = true;
        loop {
            match self.scan(Some(&mut commands)).await {
                Pass::Cancelled => break,
                Pass::Reconnecting => {
                    pause(&self.cancel, self.config.reconnect_backoff).await;
                    continue;
                }
                Pass::Completed => {}
            }

            let next_due = self.next_due();
            let idle = async move {
                match next_due {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = idle => {}
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle(command).await,
                    None => commands_open = false,
                },
            }
        }
        self.transport.close().await;
        info!("Polling stopped");
    }

    /// Visits every block in planned order and reads the due ones. Queued
    /// commands are executed before each block.
    async fn scan(&mut self, mut commands: Option<&mut mpsc::Receiver<Command>>) -> Pass {
        let mut attempted = false;
        let mut succeeded = true;
        for position in 0..self.blocks.len() {
            if self.cancel.is_cancelled() {
                return Pass::Cancelled;
            }
            if let Some(commands) = commands.as_deref_mut() {
                while let Ok(command) = commands.try_recv() {
                    self.handle(command).await;
                }
            }
            if self.due_at(position).is_some_and(|at| at > Instant::now()) {
                continue;
            }
            if self.ensure_connected().await.is_err() {
                self.last_update_succeeded = false;
                self.publish();
                return Pass::Reconnecting;
            }
            attempted = true;
            succeeded &= self.read_block(position).await;
            pause(&self.cancel, self.config.quiet_period).await;
        }
        if attempted {
            self.last_update_succeeded = succeeded;
            self.publish();
        }
        Pass::Completed
    }

    /// When the block becomes due; `None` means it is due now.
    ///
    /// A block is due one interval after its oldest member read, or after its
    /// last failed attempt if that is more recent. A member that was never
    /// read, or was written since, makes the whole block due.
    fn due_at(&self, position: usize) -> Option<Instant> {
        let block = &self.blocks[position];
        let last_read = block
            .members
            .iter()
            .map(|member| self.store.last_read(member.index))
            .min()
            .flatten();
        let reference = match (last_read, self.failed_at[position]) {
            (Some(read), Some(failed)) => Some(read.max(failed)),
            (read, failed) => read.or(failed),
        };
        reference.map(|at| at + block.interval)
    }

    fn next_due(&self) -> Option<Instant> {
        let now = Instant::now();
        (0..self.blocks.len())
            .map(|position| self.due_at(position).unwrap_or(now))
            .min()
    }

    async fn ensure_connected(&mut self) -> Result<(), TransportError> {
        if self.transport.is_connected() {
            return Ok(());
        }
        info!("Connecting to device");
        match with_timeout(self.config.operation_timeout, self.transport.connect()).await {
            Ok(()) => {
                info!("Connected to device");
                Ok(())
            }
            Err(error) => {
                warn!("Cannot connect to device: {error}");
                Err(error)
            }
        }
    }

    /// Reads, decodes and stores one block. Returns whether it succeeded.
    async fn read_block(&mut self, position: usize) -> bool {
        let block = &self.blocks[position];
        let (kind, start, length) = (block.kind, block.start, block.length);
        debug!("Reading {length} {kind} registers at {start}");
        let response = with_timeout(
            self.config.operation_timeout,
            self.transport
                .read_block(kind, start, length, self.config.unit_id),
        )
        .await;
        let now = Instant::now();

        let words = match response {
            Ok(words) => words,
            Err(error) => {
                self.block_failed(position, now, &error);
                return false;
            }
        };
        trace!("Block at {start}: {words:?}");
        let values = match self.decode_block(position, &words) {
            Ok(values) => values,
            Err(error) => {
                self.block_failed(position, now, &error);
                return false;
            }
        };

        for (index, value) in values {
            self.store.record_read(index, value, now);
        }
        self.failed_at[position] = None;
        composite::resolve(&mut self.store, &self.catalog);
        self.updated_at = Some(now);
        self.publish();
        true
    }

    /// Decodes every member before anything is stored, so a bad block never
    /// leaves a partial update behind.
    fn decode_block(&self, position: usize, words: &[u16]) -> Result<Vec<(usize, f64)>, DecodeError> {
        let block = &self.blocks[position];
        if words.len() != usize::from(block.length) {
            return Err(DecodeError::ShortResponse {
                start: block.start,
                expected: usize::from(block.length),
                actual: words.len(),
            });
        }
        let mut values = Vec::with_capacity(block.members.len());
        for member in &block.members {
            let Some(def) = self.catalog.def(member.index).and_then(RegisterDef::as_primitive) else {
                continue;
            };
            let value = protocol::decode(block.words(member, words).unwrap_or_default(), def)?;
            trace!("{} = {value}", member.key);
            values.push((member.index, value));
        }
        Ok(values)
    }

    fn block_failed(&mut self, position: usize, at: Instant, error: &dyn std::fmt::Display) {
        let block = &self.blocks[position];
        warn!(
            "Reading {} registers at {} failed: {error}",
            block.kind, block.start
        );
        self.failed_at[position] = Some(at);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Write {
                index,
                address,
                raw,
                reply,
            } => {
                let result = self.write_register(index, address, raw).await;
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
        }
    }

    async fn write_register(&mut self, index: usize, address: u16, raw: u16) -> Result<(), TransportError> {
        self.ensure_connected().await?;
        info!("Writing {raw:#06x} to register {address}");
        let result = with_timeout(
            self.config.operation_timeout,
            self.transport
                .write_register(address, raw, self.config.unit_id),
        )
        .await;
        pause(&self.cancel, self.config.quiet_period).await;
        if let Err(error) = &result {
            warn!("Writing register {address} failed: {error}");
        }
        result?;

        self.store.invalidate_last_read(index);
        if let Some(position) = self.block_of.get(index).copied().flatten() {
            self.failed_at[position] = None;
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.snapshot()));
    }
}

/// Sleeps for `duration` unless cancelled first.
async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

/// Bounds a transport operation by `limit`.
async fn with_timeout<F, R>(limit: Duration, operation: F) -> Result<R, TransportError>
where
    F: Future<Output = Result<R, TransportError>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Consumer side of a running engine.
pub struct EngineHandle {
    catalog: Arc<Catalog>,
    blocks: Arc<Vec<Block>>,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Arc<Snapshot>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl EngineHandle {
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The planned read blocks, in scan order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.snapshot.borrow().get(key)
    }

    pub fn last_update_succeeded(&self) -> bool {
        self.snapshot.borrow().last_update_succeeded()
    }

    /// Waits until `key` has been read and returns its value.
    ///
    /// A write clears the read time of its register before it is
    /// acknowledged, so after [`EngineHandle::write`] this resolves with the
    /// value read back from the device. Resolves to `None` once the engine
    /// stopped. Never resolves for composites and unknown keys.
    pub async fn wait_for_read(&self, key: &str) -> Option<f64> {
        let mut updates = self.snapshot.clone();
        let snapshot = updates
            .wait_for(|snapshot| snapshot.last_read(key).is_some())
            .await
            .ok()?;
        snapshot.get(key)
    }

    /// A receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    /// Writes a physical value to a writable register.
    ///
    /// Returns once the device acknowledged the write. The register's block
    /// is re-read on the next scan; the new value shows up in a later
    /// snapshot.
    pub async fn write(&self, key: &str, value: f64) -> Result<(), WriteError> {
        let (index, def) = self.writable(key)?;
        let raw = protocol::encode(value, def)?;
        self.send_write(index, def.address, raw).await
    }

    /// Writes the raw value behind an option label of an enumerated register.
    pub async fn write_option(&self, key: &str, label: &str) -> Result<(), WriteError> {
        let (_, def) = self.writable(key)?;
        let raw = def
            .options
            .iter()
            .find(|(_, option)| option.as_str() == label)
            .map(|(raw, _)| *raw)
            .ok_or_else(|| WriteError::UnknownOption {
                key: key.to_string(),
                option: label.to_string(),
            })?;
        self.write(key, raw as f64 * def.scale).await
    }

    fn writable(&self, key: &str) -> Result<(usize, &Primitive), WriteError> {
        let index = self
            .catalog
            .index_of(key)
            .ok_or_else(|| WriteError::UnknownKey(key.to_string()))?;
        match self.catalog.def(index) {
            Some(RegisterDef::Primitive(def)) if def.writable => Ok((index, def)),
            _ => Err(WriteError::NotWritable(key.to_string())),
        }
    }

    async fn send_write(&self, index: usize, address: u16, raw: u16) -> Result<(), WriteError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Write {
                index,
                address,
                raw,
                reply,
            })
            .await
            .map_err(|_| WriteError::EngineStopped)?;
        response
            .await
            .map_err(|_| WriteError::EngineStopped)?
            .map_err(WriteError::from)
    }

    /// Cancels the worker, waits for it to finish and closes the transport.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(error) = self.worker.await {
            warn!("Polling worker ended abnormally: {error}");
        }
    }
}
