use crate::clock::Clock;
use crate::connection::{Connection, ConnectionState};
use crate::connection_packet_handler::ConnectionPacketHandler;
use crate::destination::Destination;
use crate::error::StreamError;
use crate::options::{ConnectionOptions, ManagerConfig};
use crate::packet::{Packet, PacketFlags, PacketOptions};
use crate::packet_queue::{run_packet_queue, OutboundPacket, PacketQueue};
use crate::send_buffer::deadline_after;
use crate::session::Session;
use crate::signature::PacketSigner;
use crate::stream_map::StreamMap;
use crate::timer::{run_timer, TimerService};
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, info, span, trace, warn, Level};
use uuid::Uuid;

/// Entry point of the streaming library: opens outbound connections, accepts inbound ones,
///  answers and sends pings, and routes every inbound packet to the connection it belongs to.
///
/// Inbound packets are pushed in by the session through [ConnectionManager::on_packet_received].
///  Outbound packets go through a packet queue task, and timeouts of all connections are
///  driven by a shared timer task. Both tasks are spawned by [ConnectionManager::new], so it
///  must be called from within a tokio runtime.
pub struct ConnectionManager {
    config: ManagerConfig,
    myself: Destination,
    clock: Arc<dyn Clock>,
    packet_queue: Arc<PacketQueue>,
    outbound: mpsc::UnboundedSender<OutboundPacket>,
    /// by receive stream id, i.e. our id for the stream
    connections: Arc<StreamMap<u32, Arc<Connection>>>,
    pending_pings: Mutex<FxHashMap<u32, oneshot::Sender<()>>>,
    accept_send: mpsc::UnboundedSender<Arc<Connection>>,
    accept_recv: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Connection>>>,
    shutdown: watch::Sender<bool>,
    task_handles: Vec<JoinHandle<()>>,
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for handle in &self.task_handles {
            handle.abort();
        }
    }
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig, session: Arc<dyn Session>, signer: Arc<dyn PacketSigner>, clock: Arc<dyn Clock>) -> anyhow::Result<ConnectionManager> {
        config.validate()?;

        let myself = session.my_destination();
        info!("starting connection manager for {}", myself);

        let packet_queue = Arc::new(PacketQueue::new(session, signer));
        let connections = Arc::new(StreamMap::new());
        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        let (accept_send, accept_recv) = mpsc::unbounded_channel();
        let (shutdown, shutdown_recv) = watch::channel(false);

        let timer = Arc::new(TimerService::new(connections.clone(), clock.clone()));
        let task_handles = vec![
            tokio::spawn(run_packet_queue(packet_queue.clone(), outbound_recv)),
            tokio::spawn(run_timer(timer, config.timer_tick, shutdown_recv)),
        ];

        Ok(ConnectionManager {
            config,
            myself,
            clock,
            packet_queue,
            outbound,
            connections,
            pending_pings: Default::default(),
            accept_send,
            accept_recv: tokio::sync::Mutex::new(accept_recv),
            shutdown,
            task_handles,
        })
    }

    pub fn my_destination(&self) -> &Destination {
        &self.myself
    }

    /// number of connections that were not finalized yet, including dead ones in their grace
    ///  period
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn lock_pings(&self) -> MutexGuard<'_, FxHashMap<u32, oneshot::Sender<()>>> {
        self.pending_pings.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a connection and waits until the handshake completed or the connect timeout
    ///  expired. `options == None` uses the manager's default options.
    pub async fn connect(&self, to: Destination, options: Option<ConnectionOptions>) -> Result<Arc<Connection>, StreamError> {
        if self.is_shut_down() {
            return Err(StreamError::Closed);
        }
        let options = options.unwrap_or_else(|| self.config.default_options.clone());
        options.validate()
            .map_err(|e| StreamError::InvalidOptions(e.to_string()))?;
        let connect_timeout = options.connect_timeout;

        let connection = self.register(|receive_stream_id| {
            Connection::new(receive_stream_id, 0, to.clone(), self.myself.clone(), options, self.clock.clone(), self.outbound.clone())
        })?;
        debug!("connecting to {} as stream {}", to, connection.receive_stream_id());

        connection.send_syn()?;
        match connection.wait_for_open(Some(connect_timeout)).await {
            Ok(()) => Ok(connection),
            Err(StreamError::Timeout) => {
                connection.fail_connect(self.clock.now_millis());
                Err(StreamError::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for the next inbound connection. `timeout == None` waits indefinitely.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<Arc<Connection>, StreamError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Err(StreamError::Closed);
        }

        let deadline = deadline_after(timeout);
        let mut accept_recv = self.accept_recv.lock().await;

        let accepted = async {
            select! {
                connection = accept_recv.recv() => connection.ok_or(StreamError::Closed),
                _ = shutdown.wait_for(|&is_shut_down| is_shut_down) => Err(StreamError::Closed),
            }
        };

        match deadline {
            None => accepted.await,
            Some(deadline) => time::timeout_at(deadline, accepted).await
                .unwrap_or(Err(StreamError::Timeout)),
        }
    }

    /// Sends an ECHO packet to `to` and waits for the reply. The timeout is capped at the
    ///  configured maximum ping timeout.
    pub async fn ping(&self, to: &Destination, timeout: Duration) -> bool {
        if self.is_shut_down() {
            return false;
        }
        let timeout = timeout.min(self.config.max_ping_timeout);

        let (send, recv) = oneshot::channel();
        let ping_id = {
            let mut pings = self.lock_pings();
            let ping_id = Self::unused_id(|id| pings.contains_key(&id));
            pings.insert(ping_id, send);
            ping_id
        };

        let packet = Packet {
            send_stream_id: ping_id,
            flags: PacketFlags::ECHO | PacketFlags::SIGNATURE_INCLUDED,
            options: PacketOptions {
                from: Some(self.myself.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        debug!("sending ping {} to {}", ping_id, to);

        let answered = if self.outbound.send(OutboundPacket { to: to.clone(), packet }).is_ok() {
            matches!(time::timeout(timeout, recv).await, Ok(Ok(())))
        }
        else {
            false
        };

        self.lock_pings().remove(&ping_id);
        debug!("ping {} to {}: {}", ping_id, to, if answered { "answered" } else { "no reply" });
        answered
    }

    /// Disconnects all connections, fails pending pings and stops accepting. Further calls
    ///  have no effect.
    ///
    /// RESETs sent to peers are still delivered: the packet queue keeps running until the
    ///  manager is dropped.
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("shutting down connection manager for {}", self.myself);

        let now = self.clock.now_millis();
        for connection in self.connections.load().values() {
            connection.disconnect(false, now);
        }
        self.lock_pings().clear();
    }

    /// Entry point for packets received by the session
    pub fn on_packet_received(&self, raw: Bytes) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "packet_received", ?correlation_id);
        let _entered = span.enter();

        let packet = match self.packet_queue.decode(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping packet: {}", e);
                return;
            }
        };
        trace!("received {}", packet);

        if packet.is_flag_set(PacketFlags::ECHO) {
            self.echo_received(packet);
            return;
        }

        if packet.send_stream_id == 0 {
            if packet.is_flag_set(PacketFlags::SYN) {
                self.syn_received(packet);
            }
            else {
                debug!("dropping non-SYN packet without stream id: {}", packet);
            }
            return;
        }

        match self.connections.get(&packet.send_stream_id) {
            Some(connection) => Self::dispatch(&connection, packet),
            None => debug!("dropping packet for unknown stream {}", packet.send_stream_id),
        }
    }

    fn dispatch(connection: &Connection, packet: Packet) {
        if let Err(e) = ConnectionPacketHandler::receive_packet(connection, packet) {
            debug!("stream {}: packet dropped: {}", connection.receive_stream_id(), e);
        }
    }

    /// A SYN that opens a new stream. Filtered SYNs are dropped without a reply so that
    ///  scanning peers learn nothing.
    fn syn_received(&self, packet: Packet) {
        let Some(from) = packet.options.from.clone() else {
            debug!("dropping SYN without FROM option");
            return;
        };
        if packet.receive_stream_id == 0 {
            debug!("dropping SYN from {} without sender stream id", from);
            return;
        }

        // a resent SYN of a stream we already know
        let existing = self.connections.load()
            .values()
            .find(|c| c.is_inbound() && c.remote() == &from && c.send_stream_id() == packet.receive_stream_id)
            .cloned();
        if let Some(connection) = existing {
            trace!("duplicate SYN for stream {}", connection.receive_stream_id());
            Self::dispatch(&connection, packet);
            return;
        }

        if self.is_shut_down() {
            debug!("shut down, dropping SYN from {}", from);
            return;
        }
        if !self.config.admission_filter.admits(&from) {
            info!("admission filter rejects SYN from {}", from);
            return;
        }

        let options = self.config.default_options.clone();
        let connection = match self.register(|receive_stream_id| {
            Connection::new(receive_stream_id, packet.receive_stream_id, from.clone(), self.myself.clone(), options, self.clock.clone(), self.outbound.clone())
        }) {
            Ok(connection) => connection,
            Err(e) => {
                info!("dropping SYN from {}: {}", from, e);
                return;
            }
        };
        info!("inbound stream {} from {}", connection.receive_stream_id(), from);

        let accepted = ConnectionPacketHandler::receive_packet(&connection, packet)
            .and_then(|_| connection.send_syn());
        if let Err(e) = accepted {
            warn!("failed to set up inbound stream {}: {}", connection.receive_stream_id(), e);
            self.connections.remove(&connection.receive_stream_id());
            return;
        }

        if self.accept_send.send(connection).is_err() {
            debug!("accept queue is closed");
        }
    }

    /// ECHO packets are pings (`send_stream_id` is the ping id) or replies to our pings
    ///  (`receive_stream_id` is the ping id)
    fn echo_received(&self, packet: Packet) {
        if packet.send_stream_id != 0 {
            if !self.config.answer_pings {
                debug!("not answering ping {}", packet.send_stream_id);
                return;
            }
            let Some(from) = packet.options.from else {
                debug!("dropping ping without FROM option");
                return;
            };
            if !self.config.admission_filter.admits(&from) {
                debug!("admission filter rejects ping from {}", from);
                return;
            }

            let mut payload = packet.payload;
            payload.truncate(self.config.max_pong_payload);
            let pong = Packet {
                receive_stream_id: packet.send_stream_id,
                flags: PacketFlags::ECHO | PacketFlags::SIGNATURE_INCLUDED,
                payload,
                ..Default::default()
            };
            trace!("answering ping {} from {}", packet.send_stream_id, from);
            if self.outbound.send(OutboundPacket { to: from, packet: pong }).is_err() {
                debug!("outbound queue is closed");
            }
        }
        else if packet.receive_stream_id != 0 {
            match self.lock_pings().remove(&packet.receive_stream_id) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => debug!("reply to unknown ping {}", packet.receive_stream_id),
            }
        }
        else {
            debug!("dropping ECHO packet without ping id");
        }
    }

    /// Adds a new connection under a fresh random stream id, enforcing the limit on
    ///  concurrent streams
    fn register(&self, create: impl FnOnce(u32) -> Connection) -> Result<Arc<Connection>, StreamError> {
        let limit = self.config.max_concurrent_streams;
        self.connections.update(|connections| {
            if let Some(limit) = limit {
                let active = connections.values()
                    .filter(|c| !matches!(c.state(), ConnectionState::Dead | ConnectionState::Reset))
                    .count();
                if active >= limit {
                    return Err(StreamError::ConnectionLimit);
                }
            }

            let receive_stream_id = Self::unused_id(|id| connections.contains_key(&id));
            let connection = Arc::new(create(receive_stream_id));
            connections.insert(receive_stream_id, connection.clone());
            Ok(connection)
        })
    }

    fn unused_id(is_used: impl Fn(u32) -> bool) -> u32 {
        let mut rng = rand::rng();
        loop {
            let id = rng.random_range(1..=u32::MAX);
            if !is_used(id) {
                return id;
            }
        }
    }
}
