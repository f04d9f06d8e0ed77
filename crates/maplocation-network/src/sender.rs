//! Periodic transmitter for map snapshots
//!
//! On every tick the transmitter samples its [`DataSource`], encodes the player
//! position and sends it as one datagram. The loot layout is static for a
//! session, so it goes out once: the first tick that finds loot sends it as a
//! second datagram and sets the loot flag for the lifetime of the transmitter.
//! A layout too large for one datagram is reported once and never sent.

use crate::protocol::{Protocol, MAX_DATAGRAM_SIZE};
use crate::source::DataSource;
use crate::types::LootBatchRecord;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur while transmitting
#[derive(Error, Debug)]
pub enum TransmitError {
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Tick interval must be greater than zero")]
    InvalidInterval,

    #[error("Transmitter is running")]
    AlreadyRunning,

    #[error("Transmitter tick thread panicked")]
    TickThreadPanicked,
}

/// Configuration for the transmitter
#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// Local address of the outbound socket
    pub bind_addr: SocketAddr,
    /// Time between ticks
    pub interval: Duration,
    /// Codec limits
    pub protocol: Protocol,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            interval: Duration::from_millis(1000),
            protocol: Protocol::default(),
        }
    }
}

/// What a single tick put on the wire
#[derive(Debug, Default)]
pub struct TickReport {
    /// A position datagram was sent
    pub position_sent: bool,
    /// The loot datagram was sent on this tick
    pub loot_sent: bool,
    /// Send failures on this tick; the next tick retries independently
    pub failures: Vec<TransmitError>,
}

/// Statistics about sent data
#[derive(Debug, Clone, Copy)]
pub struct TransmitterStats {
    /// Datagrams handed to the socket
    pub packets_sent: u64,
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Sends the socket rejected
    pub send_failures: u64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Everything a tick touches. Owned by exactly one thread at a time.
struct TickState<S> {
    socket: UdpSocket,
    destination: SocketAddr,
    protocol: Protocol,
    source: S,
    loot_sent: bool,
    loot_oversize: bool,
    counters: Arc<Counters>,
}

impl<S: DataSource> TickState<S> {
    fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        match self.source.current_position() {
            Some(position) if position.is_transmittable() => {
                let packet = self.protocol.encode_position(&position);
                match self.send(&packet) {
                    Ok(()) => report.position_sent = true,
                    Err(e) => report.failures.push(e),
                }
            }
            Some(position) => {
                warn!(
                    "Map name '{}' is the reserved loot tag, position not sent",
                    position.map_name
                );
            }
            None => trace!("No position available"),
        }

        if !self.loot_sent && !self.loot_oversize {
            match self.source.current_loot() {
                Some(items) if !items.is_empty() => {
                    let count = items.len();
                    let packet = self
                        .protocol
                        .encode_loot_batch(&LootBatchRecord::new(items));
                    if packet.len() > MAX_DATAGRAM_SIZE {
                        error!(
                            "Loot layout too large for one datagram ({} items, {} bytes), not sent",
                            count,
                            packet.len()
                        );
                        self.loot_oversize = true;
                        return report;
                    }
                    match self.send(&packet) {
                        Ok(()) => {
                            info!("Sent loot layout: {} items, {} bytes", count, packet.len());
                            self.loot_sent = true;
                            report.loot_sent = true;
                        }
                        Err(e) => report.failures.push(e),
                    }
                }
                _ => debug!("Loot not available yet"),
            }
        }

        report
    }

    fn send(&self, packet: &[u8]) -> Result<(), TransmitError> {
        match self.socket.send_to(packet, self.destination) {
            Ok(sent) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                trace!("Sent {} bytes to {}", sent, self.destination);
                Ok(())
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to send to {}: {}", self.destination, e);
                Err(e.into())
            }
        }
    }
}

struct TickLoop<S> {
    stop_tx: Sender<()>,
    handle: JoinHandle<TickState<S>>,
}

/// UDP transmitter sampling a [`DataSource`] on a fixed interval
pub struct MapDataTransmitter<S: DataSource> {
    interval: Duration,
    idle: Option<TickState<S>>,
    running: Option<TickLoop<S>>,
    counters: Arc<Counters>,
    local_addr: SocketAddr,
    destination: SocketAddr,
}

impl<S: DataSource> MapDataTransmitter<S> {
    /// Create a stopped transmitter sending to `destination`
    pub fn new<A: ToSocketAddrs>(destination: A, source: S) -> Result<Self, TransmitError> {
        Self::with_config(destination, TransmitterConfig::default(), source)
    }

    /// Create a stopped transmitter with custom configuration
    pub fn with_config<A: ToSocketAddrs>(
        destination: A,
        config: TransmitterConfig,
        source: S,
    ) -> Result<Self, TransmitError> {
        if config.interval.is_zero() {
            return Err(TransmitError::InvalidInterval);
        }

        let destination = destination
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransmitError::InvalidAddress("No valid address".to_string()))?;

        let socket = UdpSocket::bind(config.bind_addr)?;
        let local_addr = socket.local_addr()?;
        info!("Map transmitter on {} sending to {}", local_addr, destination);

        let counters = Arc::new(Counters::default());

        Ok(Self {
            interval: config.interval,
            idle: Some(TickState {
                socket,
                destination,
                protocol: config.protocol,
                source,
                loot_sent: false,
                loot_oversize: false,
                counters: Arc::clone(&counters),
            }),
            running: None,
            counters,
            local_addr,
            destination,
        })
    }

    /// Start ticking with the stored interval. No-op if already running.
    pub fn start(&mut self) -> Result<(), TransmitError> {
        if self.running.is_some() {
            debug!("Transmitter already running");
            return Ok(());
        }

        let mut state = self.idle.take().ok_or(TransmitError::TickThreadPanicked)?;
        let interval = self.interval;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        // A panicking source costs one tick, not the thread
                        if panic::catch_unwind(AssertUnwindSafe(|| state.tick())).is_err() {
                            error!("Tick panicked, continuing with the next one");
                        }
                    }
                }
            }
            state
        });

        info!("Broadcasting every {:?}", interval);
        self.running = Some(TickLoop { stop_tx, handle });
        Ok(())
    }

    /// Set the interval, then start (or restart) ticking
    pub fn start_with_interval(&mut self, interval: Duration) -> Result<(), TransmitError> {
        self.change_interval(interval)?;
        self.start()
    }

    /// Stop ticking. Returns once the tick thread has exited.
    pub fn stop(&mut self) -> Result<(), TransmitError> {
        let Some(tick_loop) = self.running.take() else {
            return Ok(());
        };

        // Disconnecting the stop channel wakes the select
        drop(tick_loop.stop_tx);
        let state = tick_loop
            .handle
            .join()
            .map_err(|_| TransmitError::TickThreadPanicked)?;
        self.idle = Some(state);

        info!("Stopped broadcasting");
        Ok(())
    }

    /// Change the tick interval.
    ///
    /// A running transmitter is stopped and restarted, so once this returns
    /// every further tick is spaced by `interval`.
    pub fn change_interval(&mut self, interval: Duration) -> Result<(), TransmitError> {
        if interval.is_zero() {
            return Err(TransmitError::InvalidInterval);
        }

        if self.running.is_some() {
            self.stop()?;
            self.interval = interval;
            self.start()
        } else {
            self.interval = interval;
            Ok(())
        }
    }

    /// Run one tick on the calling thread. Only valid while stopped.
    pub fn broadcast_once(&mut self) -> Result<TickReport, TransmitError> {
        if self.running.is_some() {
            return Err(TransmitError::AlreadyRunning);
        }
        let state = self.idle.as_mut().ok_or(TransmitError::TickThreadPanicked)?;
        Ok(state.tick())
    }

    /// Whether the tick thread is active
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Current tick interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the loot layout has gone out. Only known while stopped.
    pub fn loot_sent(&self) -> Option<bool> {
        self.idle.as_ref().map(|state| state.loot_sent)
    }

    /// Local address of the outbound socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Where datagrams are sent
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Get statistics about sent data
    pub fn stats(&self) -> TransmitterStats {
        TransmitterStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

impl<S: DataSource> Drop for MapDataTransmitter<S> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
