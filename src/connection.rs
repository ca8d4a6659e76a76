use crate::block_id::BlockId;
use crate::clock::Clock;
use crate::destination::Destination;
use crate::error::StreamError;
use crate::options::{millis, ConnectionOptions};
use crate::packet::{Packet, PacketFlags, PacketOptions};
use crate::packet_queue::OutboundPacket;
use crate::receive_buffer::ReceiveBuffer;
use crate::rtt::RttEstimator;
use crate::scheduler::ScheduledConnection;
use crate::send_buffer::{AckOutcome, BlockSink, SendBuffer};
use bytes::Bytes;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, trace, warn};
use crate::send_buffer::{deadline_after, wait_with_deadline};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// SYN sent, waiting for the peer to acknowledge it
    Connecting,
    Open,
    /// the application closed the connection, and outstanding data is drained before CLOSE
    ///  is sent
    LocalClosePending,
    /// CLOSE was sent
    LocalClosed,
    RemoteCloseReceived,
    Reset,
    Dead,
}

impl ConnectionState {
    /// states in which the handshake is complete and data blocks may be sent
    fn is_established(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::LocalClosePending | ConnectionState::LocalClosed | ConnectionState::RemoteCloseReceived)
    }
}

struct ConnectionInner {
    state: ConnectionState,
    /// the peer's id for this stream, 0 until it is known
    send_stream_id: u32,
    remote_close_received: bool,
    close_block_id: Option<BlockId>,
    close_sent_on: Option<u64>,
    disconnect_scheduled_on: Option<u64>,
    finalized: bool,
    connect_timed_out: bool,
    last_send_on: u64,
    last_receive_on: u64,
    ack_due_on: Option<u64>,
    rtt: RttEstimator,
    protocol_violations: u32,
    /// we asked the peer to stop sending because our receive buffer is full
    choking: bool,
    /// packets that still announce the end of a choke, in case some of them get lost
    unchokes_to_send: u32,
}

impl ConnectionInner {
    /// The DELAY_REQUESTED option for the next outgoing packet
    fn choke_announcement(&mut self) -> Option<u16> {
        if self.choking {
            Some(Packet::SEND_DELAY_CHOKE)
        }
        else if self.unchokes_to_send > 0 {
            self.unchokes_to_send -= 1;
            Some(0)
        }
        else {
            None
        }
    }
}

/// One end of a bidirectional byte stream to a peer. A connection owns its buffers and all
///  per-stream protocol state; timeouts are driven from the outside by the timer service via
///  [ScheduledConnection], and inbound packets are applied by the
///  [ConnectionPacketHandler](crate::connection_packet_handler::ConnectionPacketHandler).
pub struct Connection {
    /// our id for this stream, i.e. the id the peer addresses its packets to
    receive_stream_id: u32,
    remote: Destination,
    local: Destination,
    inbound: bool,
    options: ConnectionOptions,
    clock: Arc<dyn Clock>,
    lifetime_start: u64,
    receive_buffer: ReceiveBuffer,
    send_buffer: SendBuffer,
    inner: Mutex<ConnectionInner>,
    state_changed: Notify,
    outbound: mpsc::UnboundedSender<OutboundPacket>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        write!(f, "CONN{{{}->{} {:?} {}}}", self.receive_stream_id, inner.send_stream_id, inner.state, self.remote)
    }
}

impl Connection {
    const UNCHOKES_TO_SEND: u32 = 8;

    /// `send_stream_id` is 0 for outbound connections: we learn the peer's id from its SYN.
    ///  Inbound connections are created from the peer's SYN and know it from the start.
    pub(crate) fn new(
        receive_stream_id: u32,
        send_stream_id: u32,
        remote: Destination,
        local: Destination,
        options: ConnectionOptions,
        clock: Arc<dyn Clock>,
        outbound: mpsc::UnboundedSender<OutboundPacket>,
    ) -> Connection {
        let now = clock.now_millis();
        Connection {
            receive_stream_id,
            remote,
            local,
            inbound: send_stream_id != 0,
            receive_buffer: ReceiveBuffer::new(&options),
            send_buffer: SendBuffer::new(&options, clock.clone()),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Connecting,
                send_stream_id,
                remote_close_received: false,
                close_block_id: None,
                close_sent_on: None,
                disconnect_scheduled_on: None,
                finalized: false,
                connect_timed_out: false,
                last_send_on: now,
                last_receive_on: now,
                ack_due_on: None,
                rtt: RttEstimator::new(&options),
                protocol_violations: 0,
                choking: false,
                unchokes_to_send: 0,
            }),
            options,
            clock,
            lifetime_start: now,
            state_changed: Notify::new(),
            outbound,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn receive_stream_id(&self) -> u32 {
        self.receive_stream_id
    }

    pub fn send_stream_id(&self) -> u32 {
        self.lock().send_stream_id
    }

    pub fn remote(&self) -> &Destination {
        &self.remote
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn lifetime_start(&self) -> u64 {
        self.lifetime_start
    }

    pub fn rtt(&self) -> u64 {
        self.lock().rtt.rtt()
    }

    pub fn window_size(&self) -> usize {
        self.send_buffer.window_size()
    }

    /// number of bytes that can be read without blocking
    pub fn available(&self) -> usize {
        self.receive_buffer.ready_bytes()
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    pub(crate) fn receive_buffer(&self) -> &ReceiveBuffer {
        &self.receive_buffer
    }

    pub(crate) fn send_buffer(&self) -> &SendBuffer {
        &self.send_buffer
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Reads stream data in order. Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StreamError> {
        let n = self.receive_buffer.read(buf, timeout.or(self.options.read_timeout)).await?;
        if n > 0 {
            self.update_choking(self.now());
        }
        Ok(n)
    }

    /// Writes stream data, blocking while the send window is full. Data is sent in blocks of
    ///  at most `max_message_size` bytes; a trailing partial block is sent on flush, on close
    ///  or after the passive flush delay.
    pub async fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        self.send_buffer.write(data, self).await
    }

    /// Sends all buffered data and waits until the peer acknowledged it
    pub async fn flush(&self) -> Result<(), StreamError> {
        self.send_buffer.flush(self).await
    }

    /// Closes both directions: buffered data is still delivered before CLOSE is sent, but no
    ///  more data can be written, and unread inbound data is discarded once it is out of order.
    ///
    /// CLOSE itself is sent by the timer once all data was acknowledged.
    pub async fn close(&self) -> Result<(), StreamError> {
        match self.state() {
            ConnectionState::Connecting => {
                debug!("closing {:?} before the handshake completed", self);
                self.disconnect(false, self.now());
                return Ok(());
            }
            ConnectionState::Open | ConnectionState::RemoteCloseReceived => {}
            ConnectionState::LocalClosePending | ConnectionState::LocalClosed | ConnectionState::Dead => return Ok(()),
            ConnectionState::Reset => return Err(StreamError::Reset),
        }

        self.receive_buffer.close();
        self.send_buffer.flush_pending(self).await?;
        self.send_buffer.close();

        let mut inner = self.lock();
        if matches!(inner.state, ConnectionState::Open | ConnectionState::RemoteCloseReceived) {
            debug!("{:?}: local close, draining {} outstanding blocks", self.receive_stream_id, self.send_buffer.outstanding_count());
            inner.state = ConnectionState::LocalClosePending;
            self.state_changed.notify_waiters();
        }
        Ok(())
    }

    /// Waits until the handshake completed. Fails with `Timeout` if the connect timeout expired
    ///  first, with `Reset` if the peer reset the connection.
    pub async fn wait_for_open(&self, timeout: Option<Duration>) -> Result<(), StreamError> {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.lock();
                match inner.state {
                    state if state.is_established() => return Ok(()),
                    ConnectionState::Reset => return Err(StreamError::Reset),
                    ConnectionState::Dead if inner.connect_timed_out => return Err(StreamError::Timeout),
                    ConnectionState::Dead => return Err(StreamError::Closed),
                    _ => {}
                }
            }
            wait_with_deadline(notified, deadline).await?;
        }
    }

    /// Sends our SYN, which is always block 0
    pub(crate) fn send_syn(&self) -> Result<(), StreamError> {
        let (block_id, _) = self.send_buffer.send_control(PacketFlags::SYN, self)?;
        debug_assert_eq!(block_id, BlockId::ZERO);
        Ok(())
    }

    /// Adopts the peer's stream id from the first packet that carries one
    pub(crate) fn set_send_stream_id(&self, send_stream_id: u32) -> bool {
        let mut inner = self.lock();
        if inner.send_stream_id == 0 {
            debug!("stream {}: peer stream id is {}", self.receive_stream_id, send_stream_id);
            inner.send_stream_id = send_stream_id;
            true
        }
        else {
            inner.send_stream_id == send_stream_id
        }
    }

    pub(crate) fn packet_received(&self, now: u64) {
        self.lock().last_receive_on = now;
    }

    /// The peer announced the largest block it accepts
    pub(crate) fn limit_message_size(&self, peer_max: usize) {
        if self.send_buffer.limit_message_size(peer_max) {
            info!("stream {}: peer accepts blocks of at most {} bytes", self.receive_stream_id, peer_max);
        }
    }

    /// The peer asked us to stop sending new blocks until further notice, or lifted that
    ///  request
    pub(crate) fn set_choked(&self, choked: bool) {
        if self.send_buffer.set_choked(choked) {
            info!("stream {}: {} by {}", self.receive_stream_id, if choked { "choked" } else { "unchoked" }, self.remote);
        }
        if choked {
            self.send_buffer.set_window_size(1);
        }
    }

    /// Our receive buffer had no room for a block: the peer is asked to stop sending, right
    ///  away and on every packet until [Connection::update_choking] lifts the request
    pub(crate) fn start_choking(&self, now: u64) {
        let was_choking = std::mem::replace(&mut self.lock().choking, true);
        if !was_choking {
            info!("stream {}: receive buffer is full, choking {}", self.receive_stream_id, self.remote);
        }
        self.send_ack_packet(now, true);
    }

    /// Lifts a choke once the application read enough to make room in the receive buffer
    pub(crate) fn update_choking(&self, now: u64) {
        let has_room = self.receive_buffer.has_room_to_unchoke();
        {
            let mut inner = self.lock();
            if !inner.choking || !has_room {
                return;
            }
            inner.choking = false;
            inner.unchokes_to_send = Self::UNCHOKES_TO_SEND;
        }
        info!("stream {}: receive buffer has room again, unchoking {}", self.receive_stream_id, self.remote);
        self.send_ack_packet(now, true);
    }

    pub fn is_choking(&self) -> bool {
        self.lock().choking
    }

    /// Schedules an ack, either right away or after the ack delay in the hope that it can be
    ///  piggybacked on a data packet
    pub(crate) fn schedule_ack(&self, now: u64, immediate: bool) {
        let mut inner = self.lock();
        let delay = if immediate {
            0
        }
        else {
            millis(self.options.initial_ack_delay).min(inner.rtt.rtt() / 2)
        };
        let due = now.saturating_add(delay);
        inner.ack_due_on = Some(inner.ack_due_on.map_or(due, |prev| prev.min(due)));
    }

    /// Applies the outcome of processing a packet's ack fields: round trip samples, window
    ///  growth, fast retransmits and state transitions that depend on our SYN or CLOSE being
    ///  acked
    pub(crate) fn blocks_acked(&self, outcome: AckOutcome, now: u64) {
        if !outcome.acked.is_empty() {
            self.send_buffer.set_window_size(self.send_buffer.window_size() + outcome.acked.len());
        }

        let mut disconnect = false;
        {
            let mut inner = self.lock();
            for sample in &outcome.rtt_samples {
                inner.rtt.on_sample(*sample);
            }

            if inner.state == ConnectionState::Connecting
                && inner.send_stream_id != 0
                && !self.send_buffer.is_outstanding(BlockId::ZERO)
            {
                info!("stream {} to {} is open", self.receive_stream_id, self.remote);
                inner.state = ConnectionState::Open;
                self.state_changed.notify_waiters();
                self.send_buffer.wake_writers();
            }

            if inner.state == ConnectionState::LocalClosed
                && inner.remote_close_received
                && inner.close_block_id.is_some_and(|id| !self.send_buffer.is_outstanding(id))
            {
                disconnect = true;
            }
        }

        if !outcome.fast_retransmit.is_empty() {
            self.send_buffer.retransmit_now(&outcome.fast_retransmit, now, self);
        }
        if disconnect {
            debug!("stream {}: both sides closed", self.receive_stream_id);
            self.disconnect(true, now);
        }
    }

    /// The peer's CLOSE was received
    pub(crate) fn close_received(&self, now: u64) {
        let disconnect = {
            let mut inner = self.lock();
            inner.remote_close_received = true;
            match inner.state {
                ConnectionState::Connecting | ConnectionState::Open => {
                    debug!("stream {}: remote close received", self.receive_stream_id);
                    inner.state = ConnectionState::RemoteCloseReceived;
                    self.state_changed.notify_waiters();
                    false
                }
                ConnectionState::LocalClosed => inner.close_block_id.is_some_and(|id| !self.send_buffer.is_outstanding(id)),
                _ => false,
            }
        };
        if disconnect {
            self.disconnect(true, now);
        }
    }

    /// The peer reset the connection
    pub(crate) fn reset_received(&self, now: u64) {
        info!("stream {} was reset by {}", self.receive_stream_id, self.remote);
        self.apply_reset(now);
    }

    fn apply_reset(&self, now: u64) {
        {
            let mut inner = self.lock();
            if matches!(inner.state, ConnectionState::Reset | ConnectionState::Dead) {
                return;
            }
            inner.state = ConnectionState::Reset;
            inner.disconnect_scheduled_on.get_or_insert(now);
        }
        self.send_buffer.fail_all(true);
        self.receive_buffer.reset();
        self.state_changed.notify_waiters();
    }

    /// Counts a protocol violation by the peer, resetting the connection once there were too
    ///  many
    pub(crate) fn protocol_violation(&self, reason: &StreamError, now: u64) {
        let violations = {
            let mut inner = self.lock();
            inner.protocol_violations += 1;
            inner.protocol_violations
        };
        warn!("stream {}: {} ({} of {} tolerated)", self.receive_stream_id, reason, violations, self.options.max_protocol_violations);
        if violations >= self.options.max_protocol_violations {
            self.send_reset(now);
        }
    }

    /// Sends a RESET to the peer and resets the connection locally
    pub(crate) fn send_reset(&self, now: u64) {
        let send_stream_id = self.send_stream_id();
        if send_stream_id != 0 {
            let packet = Packet {
                send_stream_id,
                receive_stream_id: self.receive_stream_id,
                flags: PacketFlags::RESET | PacketFlags::SIGNATURE_INCLUDED,
                ..Default::default()
            };
            warn!("stream {}: sending RESET", self.receive_stream_id);
            self.enqueue(packet);
        }
        self.apply_reset(now);
    }

    /// Tears the connection down. A clean disconnect follows a completed CLOSE handshake, any
    ///  other disconnect abandons outstanding data and tells the peer with a RESET.
    pub(crate) fn disconnect(&self, clean: bool, now: u64) {
        let send_reset = {
            let mut inner = self.lock();
            if matches!(inner.state, ConnectionState::Dead | ConnectionState::Reset) {
                return;
            }
            let send_reset = !clean && inner.state != ConnectionState::Connecting && inner.send_stream_id != 0;
            inner.state = ConnectionState::Dead;
            inner.disconnect_scheduled_on.get_or_insert(now);
            send_reset
        };
        info!("stream {} to {} disconnected ({})", self.receive_stream_id, self.remote, if clean { "clean" } else { "hard" });

        if send_reset {
            let packet = Packet {
                send_stream_id: self.send_stream_id(),
                receive_stream_id: self.receive_stream_id,
                flags: PacketFlags::RESET | PacketFlags::SIGNATURE_INCLUDED,
                ..Default::default()
            };
            self.enqueue(packet);
        }

        if clean {
            self.send_buffer.close();
        }
        else {
            self.send_buffer.fail_all(false);
        }
        self.receive_buffer.close();
        self.state_changed.notify_waiters();
    }

    /// Releases all resources after the grace period. Only the first call has an effect.
    pub(crate) fn disconnect_complete(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.finalized {
                return false;
            }
            inner.finalized = true;
            inner.state = ConnectionState::Dead;
            inner.ack_due_on = None;
        }
        debug!("stream {}: resources released", self.receive_stream_id);
        self.send_buffer.fail_all(false);
        self.receive_buffer.release();
        self.state_changed.notify_waiters();
        true
    }

    /// Fails a connect that took longer than the connect timeout
    pub(crate) fn fail_connect(&self, now: u64) {
        {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connecting {
                return;
            }
            inner.connect_timed_out = true;
        }
        info!("connecting stream {} to {} timed out", self.receive_stream_id, self.remote);
        self.disconnect(false, now);
    }

    /// Sends an ack-only packet with the current ack state. `keepalive` sends it even if there
    ///  is nothing to ack.
    pub(crate) fn send_ack_packet(&self, now: u64, keepalive: bool) {
        let mut packet = {
            let mut inner = self.lock();
            inner.ack_due_on = None;
            inner.last_send_on = now;
            if inner.send_stream_id == 0 {
                trace!("stream {}: peer stream id unknown, not sending ack", self.receive_stream_id);
                return;
            }

            Packet {
                send_stream_id: inner.send_stream_id,
                receive_stream_id: self.receive_stream_id,
                options: PacketOptions {
                    delay_requested_millis: inner.choke_announcement(),
                    ..Default::default()
                },
                ..Default::default()
            }
        };
        self.receive_buffer.update_acks(&mut packet);
        if packet.ack_through.is_none() && !keepalive {
            return;
        }
        trace!("sending {}", packet);
        self.enqueue(packet);
    }

    fn enqueue(&self, packet: Packet) -> bool {
        let to = self.remote.clone();
        if self.outbound.send(OutboundPacket { to, packet }).is_err() {
            debug!("stream {}: outbound queue is closed", self.receive_stream_id);
            return false;
        }
        true
    }

    fn resend_delay_secs(rtt: &RttEstimator) -> u8 {
        (rtt.rto() / 1000).min(u8::MAX as u64) as u8
    }
}

impl BlockSink for Connection {
    fn write_data(&self, block_id: BlockId, flags: PacketFlags, payload: &Bytes) -> bool {
        let now = self.now();
        let mut packet = {
            let mut inner = self.lock();
            if matches!(inner.state, ConnectionState::Dead | ConnectionState::Reset) {
                return false;
            }
            inner.last_send_on = now;
            inner.ack_due_on = None;

            Packet {
                send_stream_id: inner.send_stream_id,
                receive_stream_id: self.receive_stream_id,
                block_id,
                resend_delay: Self::resend_delay_secs(&inner.rtt),
                flags,
                options: PacketOptions {
                    delay_requested_millis: inner.choke_announcement(),
                    ..Default::default()
                },
                payload: payload.clone(),
                ..Default::default()
            }
        };

        if flags.contains(PacketFlags::SYN) {
            packet.options.from = Some(self.local.clone());
            packet.options.max_packet_size = Some(self.options.max_message_size.min(u16::MAX as usize) as u16);
        }
        if flags.intersects(Packet::FLAGS_REQUIRING_SIGNATURE) {
            packet.flags |= PacketFlags::SIGNATURE_INCLUDED;
        }
        self.receive_buffer.update_acks(&mut packet);

        trace!("sending {}", packet);
        self.enqueue(packet)
    }

    fn write_in_process(&self) -> bool {
        !self.lock().state.is_established()
    }
}

impl ScheduledConnection for Connection {
    fn state(&self) -> ConnectionState {
        Connection::state(self)
    }

    fn send_stream_id(&self) -> u32 {
        Connection::send_stream_id(self)
    }

    fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn lifetime(&self, now: u64) -> u64 {
        now.saturating_sub(self.lifetime_start)
    }

    fn disconnect_scheduled_on(&self) -> Option<u64> {
        self.lock().disconnect_scheduled_on
    }

    fn close_sent_on(&self) -> Option<u64> {
        self.lock().close_sent_on
    }

    fn last_activity_on(&self) -> u64 {
        let inner = self.lock();
        inner.last_send_on.max(inner.last_receive_on)
    }

    fn outstanding_count(&self) -> usize {
        self.send_buffer.outstanding_count()
    }

    fn retransmit_due(&self, now: u64) -> bool {
        let rtt = self.lock().rtt.clone();
        self.send_buffer.has_retransmit_due(now, &rtt)
    }

    fn ack_due(&self, now: u64) -> bool {
        self.lock().ack_due_on.is_some_and(|due| now >= due)
    }

    fn passive_flush_due(&self, now: u64) -> bool {
        self.send_buffer.passive_flush_due(now, millis(self.options.passive_flush_delay))
    }

    fn close_ready(&self) -> bool {
        self.state() == ConnectionState::LocalClosePending && self.send_buffer.is_drained()
    }

    fn retransmit(&self, now: u64) {
        let rtt = self.lock().rtt.clone();
        let outcome = self.send_buffer.retransmit_due(now, &rtt, self.options.max_resends, self);

        if !outcome.retransmitted.is_empty() {
            let window_size = self.send_buffer.window_size();
            self.send_buffer.set_window_size(window_size / 2);
            debug!("stream {}: retransmitted {:?}, window {} -> {}", self.receive_stream_id, outcome.retransmitted, window_size, self.send_buffer.window_size());
        }
        if let Some(block_id) = outcome.exhausted {
            warn!("stream {}: block {} exceeded {} sends, disconnecting", self.receive_stream_id, block_id, self.options.max_resends);
            self.disconnect(false, now);
        }
    }

    fn send_ack(&self, now: u64) {
        self.send_ack_packet(now, false);
    }

    fn passive_flush(&self) {
        if self.send_buffer.try_flush_pending(self) {
            trace!("stream {}: passive flush", self.receive_stream_id);
        }
    }

    fn send_close(&self, now: u64) {
        match self.send_buffer.send_control(PacketFlags::CLOSE, self) {
            Ok((block_id, _)) => {
                let mut inner = self.lock();
                debug!("stream {}: CLOSE sent as block {}", self.receive_stream_id, block_id);
                inner.close_block_id = Some(block_id);
                inner.close_sent_on = Some(now);
                if inner.state == ConnectionState::LocalClosePending {
                    inner.state = ConnectionState::LocalClosed;
                    self.state_changed.notify_waiters();
                }
            }
            Err(e) => {
                debug!("stream {}: sending CLOSE failed: {}", self.receive_stream_id, e);
                self.disconnect(false, now);
            }
        }
    }

    fn send_keepalive(&self, now: u64) {
        trace!("stream {}: keepalive", self.receive_stream_id);
        self.send_ack_packet(now, true);
    }

    fn fail_connect(&self, now: u64) {
        Connection::fail_connect(self, now);
    }

    fn disconnect(&self, clean: bool, now: u64) {
        Connection::disconnect(self, clean, now);
    }

    fn disconnect_complete(&self) {
        Connection::disconnect_complete(self);
    }
}
