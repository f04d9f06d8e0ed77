//! Receive loop for map snapshots
//!
//! A bound UDP socket is drained on a dedicated thread: every datagram is
//! decoded and the resulting record is published on the receiver's
//! [`EventBus`]. Malformed packets are dropped and the loop carries on. A
//! socket failure ends the loop and is kept for the host to collect through
//! [`MapDataReceiver::take_fault`].

use crate::events::EventBus;
use crate::protocol::Protocol;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur during receive operations
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("The receive loop is already running")]
    AlreadyRunning,

    #[error("Transport failure, receiving stopped: {0}")]
    Transport(std::io::Error),

    #[error("Receive loop panicked")]
    LoopPanicked,
}

/// Configuration for the receiver
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Socket read timeout. Bounds how long a stop request waits for a
    /// blocked receive to return.
    pub poll_interval: Duration,
    /// Receive buffer size; longer datagrams are cut short and dropped
    pub max_datagram_size: usize,
    /// Codec limits
    pub protocol: Protocol,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_datagram_size: 64 * 1024,
            protocol: Protocol::default(),
        }
    }
}

/// Statistics about received data
#[derive(Debug, Clone, Copy)]
pub struct ReceiverStats {
    /// Datagrams read from the socket
    pub packets_received: u64,
    /// Total datagram bytes read
    pub bytes_received: u64,
    /// Records decoded and published
    pub records_dispatched: u64,
    /// Datagrams that failed to decode
    pub packets_dropped: u64,
}

#[derive(Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    records_dispatched: AtomicU64,
    packets_dropped: AtomicU64,
}

/// State moved onto the receive thread
struct ReceiveContext {
    socket: UdpSocket,
    cancel: Arc<AtomicBool>,
    protocol: Protocol,
    events: EventBus,
    counters: Arc<Counters>,
    max_datagram_size: usize,
}

impl ReceiveContext {
    fn run(self) -> (UdpSocket, Result<(), ReceiveError>) {
        let result = self.receive_loop();
        (self.socket, result)
    }

    fn receive_loop(&self) -> Result<(), ReceiveError> {
        info!("Map receiver loop started");
        let mut buf = vec![0u8; self.max_datagram_size];

        while !self.cancel.load(Ordering::Acquire) {
            let (len, source) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    error!("Receive failed, map updates stopped: {}", e);
                    return Err(ReceiveError::Transport(e));
                }
            };

            if self.cancel.load(Ordering::Acquire) {
                break;
            }

            self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_received
                .fetch_add(len as u64, Ordering::Relaxed);

            match self.protocol.decode(&buf[..len]) {
                Ok(record) => {
                    trace!("Received '{}' from {}", record.channel_tag(), source);
                    self.events.publish(&record);
                    self.counters
                        .records_dispatched
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropped {} byte packet from {}: {}", len, source, e);
                }
            }
        }

        info!("Map receiver loop stopped");
        Ok(())
    }
}

struct ReceiveLoop {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<(UdpSocket, Result<(), ReceiveError>)>,
}

/// UDP receiver decoding map records and publishing them as events
pub struct MapDataReceiver {
    idle: Option<UdpSocket>,
    running: Option<ReceiveLoop>,
    fault: Option<ReceiveError>,
    local_addr: SocketAddr,
    config: ReceiverConfig,
    events: EventBus,
    counters: Arc<Counters>,
}

impl MapDataReceiver {
    /// Bind a receiver to the specified address
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ReceiveError> {
        Self::bind_with_config(addr, ReceiverConfig::default())
    }

    /// Bind a receiver with custom configuration
    pub fn bind_with_config<A: ToSocketAddrs>(
        addr: A,
        config: ReceiverConfig,
    ) -> Result<Self, ReceiveError> {
        let socket =
            UdpSocket::bind(addr).map_err(|e| ReceiveError::Bind(format!("Failed to bind: {e}")))?;
        socket.set_read_timeout(Some(config.poll_interval))?;

        let local_addr = socket.local_addr()?;
        info!("Map receiver bound to {}", local_addr);

        Ok(Self {
            idle: Some(socket),
            running: None,
            fault: None,
            local_addr,
            config,
            events: EventBus::new(),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Get the local address the receiver is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribers for decoded records
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start the receive loop on its own thread.
    ///
    /// Fails with [`ReceiveError::AlreadyRunning`] while a loop is active. A
    /// loop that ended on a transport failure may be restarted.
    pub fn start_receiving_data(&mut self) -> Result<(), ReceiveError> {
        self.reap_finished();
        if self.running.is_some() {
            return Err(ReceiveError::AlreadyRunning);
        }

        let socket = self.idle.take().ok_or(ReceiveError::LoopPanicked)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let context = ReceiveContext {
            socket,
            cancel: Arc::clone(&cancel),
            protocol: self.config.protocol,
            events: self.events.clone(),
            counters: Arc::clone(&self.counters),
            max_datagram_size: self.config.max_datagram_size,
        };

        let handle = thread::spawn(move || context.run());
        self.running = Some(ReceiveLoop { cancel, handle });
        Ok(())
    }

    /// Stop the receive loop and wait for its thread.
    ///
    /// Safe to call when not running and safe to call repeatedly. Returns
    /// within about one poll interval; no record is published afterwards.
    pub fn stop_receiving_data(&mut self) {
        let Some(receive_loop) = self.running.take() else {
            return;
        };

        receive_loop.cancel.store(true, Ordering::Release);
        self.join(receive_loop);
        debug!("Map receiver stopped on request");
    }

    /// Whether the receive loop is active
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|receive_loop| !receive_loop.handle.is_finished())
    }

    /// Take the error that ended the receive loop, if any. Each failure is
    /// handed out once.
    pub fn take_fault(&mut self) -> Option<ReceiveError> {
        self.reap_finished();
        self.fault.take()
    }

    /// Get statistics about received data
    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.counters.packets_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            records_dispatched: self.counters.records_dispatched.load(Ordering::Relaxed),
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
        }
    }

    fn reap_finished(&mut self) {
        let finished = self
            .running
            .as_ref()
            .is_some_and(|receive_loop| receive_loop.handle.is_finished());
        if finished {
            if let Some(receive_loop) = self.running.take() {
                self.join(receive_loop);
            }
        }
    }

    fn join(&mut self, receive_loop: ReceiveLoop) {
        match receive_loop.handle.join() {
            Ok((socket, result)) => {
                self.idle = Some(socket);
                if let Err(e) = result {
                    self.fault = Some(e);
                }
            }
            Err(_) => {
                error!("Map receiver loop panicked");
                self.fault = Some(ReceiveError::LoopPanicked);
            }
        }
    }
}

impl Drop for MapDataReceiver {
    fn drop(&mut self) {
        self.stop_receiving_data();
    }
}
