use crate::block_id::BlockId;
use crate::clock::Clock;
use crate::error::StreamError;
use crate::options::ConnectionOptions;
use crate::packet::PacketFlags;
use crate::rtt::RttEstimator;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use std::cmp::min;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    /// handed to the transport, not acknowledged yet
    Accepted,
    Succeeded,
    Failed,
}

impl WriteState {
    fn is_complete(&self) -> bool {
        matches!(self, WriteState::Succeeded | WriteState::Failed)
    }
}

/// Delivery status of a single block, shared between the send buffer and whoever waits for
///  the block to be accepted or acknowledged
pub struct WriteStatus {
    state: Mutex<WriteState>,
    changed: Notify,
}

impl Default for WriteStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteStatus {
    pub fn new() -> WriteStatus {
        WriteStatus {
            state: Mutex::new(WriteState::Pending),
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> WriteState {
        *self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write_accepted(&self) -> bool {
        matches!(self.state(), WriteState::Accepted | WriteState::Succeeded)
    }

    pub fn write_failed(&self) -> bool {
        self.state() == WriteState::Failed
    }

    pub fn write_successful(&self) -> bool {
        self.state() == WriteState::Succeeded
    }

    fn transition(&self, to: WriteState) {
        let mut state = self.state.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let allowed = match (*state, to) {
            (WriteState::Pending, _) => true,
            (WriteState::Accepted, WriteState::Succeeded | WriteState::Failed) => true,
            _ => false,
        };
        if allowed {
            *state = to;
            self.changed.notify_waiters();
        }
    }

    pub(crate) fn mark_accepted(&self) {
        self.transition(WriteState::Accepted);
    }

    pub(crate) fn mark_succeeded(&self) {
        self.transition(WriteState::Succeeded);
    }

    pub(crate) fn mark_failed(&self) {
        self.transition(WriteState::Failed);
    }

    /// Waits until the block was handed to the transport. Fails with `WriteFailure` if the
    ///  block failed before that.
    pub async fn wait_for_accept(&self, timeout: Option<Duration>) -> Result<(), StreamError> {
        match self.wait_until(timeout, |state| state != WriteState::Pending).await? {
            WriteState::Failed => Err(StreamError::WriteFailure),
            _ => Ok(()),
        }
    }

    /// Waits until the block was acknowledged, failing with `WriteFailure` if it was abandoned
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> Result<(), StreamError> {
        match self.wait_until(timeout, |state| state.is_complete()).await? {
            WriteState::Failed => Err(StreamError::WriteFailure),
            _ => Ok(()),
        }
    }

    async fn wait_until(&self, timeout: Option<Duration>, done: impl Fn(WriteState) -> bool) -> Result<WriteState, StreamError> {
        let deadline = deadline_after(timeout);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.state();
            if done(state) {
                return Ok(state);
            }
            wait_with_deadline(notified, deadline).await?;
        }
    }
}

pub(crate) fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

pub(crate) async fn wait_with_deadline(notified: impl Future<Output = ()>, deadline: Option<Instant>) -> Result<(), StreamError> {
    match deadline {
        None => {
            notified.await;
            Ok(())
        }
        Some(deadline) => time::timeout_at(deadline, notified).await
            .map_err(|_| StreamError::Timeout),
    }
}

/// The transport side of a send buffer: it turns blocks into packets and sends them
#[cfg_attr(test, automock)]
pub trait BlockSink: Send + Sync {
    /// Transmits a block. A retransmission calls this again with the same id, flags and
    ///  payload. Returns `false` if the block can not be sent, e.g. because the connection is
    ///  gone.
    fn write_data(&self, block_id: BlockId, flags: PacketFlags, payload: &Bytes) -> bool;

    /// `true` while the sink can not take new data blocks yet, e.g. during the handshake
    fn write_in_process(&self) -> bool;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Failure {
    Abandoned,
    Reset,
}

impl Failure {
    fn to_error(self) -> StreamError {
        match self {
            Failure::Abandoned => StreamError::WriteFailure,
            Failure::Reset => StreamError::Reset,
        }
    }
}

struct OutstandingBlock {
    flags: PacketFlags,
    payload: Bytes,
    status: Arc<WriteStatus>,
    first_sent_on: u64,
    last_sent_on: u64,
    num_sends: u32,
    nack_count: u32,
    /// resent while choked, so the round trip time is meaningless
    resent_while_choked: bool,
}

impl OutstandingBlock {
    fn is_due(&self, now: u64, rtt: &RttEstimator) -> bool {
        now >= self.last_sent_on.saturating_add(rtt.resend_delay(self.num_sends))
    }
}

struct SendBufferInner {
    /// our own limit, lowered to the peer's if that is smaller
    max_message_size: usize,
    next_block_id: BlockId,
    outstanding: BTreeMap<BlockId, OutstandingBlock>,
    /// bytes that do not fill a block yet
    pending: BytesMut,
    pending_since: Option<u64>,
    window_size: usize,
    /// the peer asked us to stop sending new blocks
    choked: bool,
    /// resends of the lowest block since the peer choked us
    choked_resends: u32,
    closed: bool,
    failure: Option<Failure>,
}

impl SendBufferInner {
    fn check_failure(&self) -> Result<(), StreamError> {
        match self.failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn check_writable(&self) -> Result<(), StreamError> {
        self.check_failure()?;
        if self.closed {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn has_window_space(&self) -> bool {
        !self.choked && self.outstanding.len() < self.window_size
    }

    /// While choked, only the lowest outstanding block is resent, with its own backoff and
    ///  without counting against the resend limit, until the peer lifts the choke
    fn choked_resend_due(&self, now: u64, rtt: &RttEstimator) -> Option<BlockId> {
        let (&id, block) = self.outstanding.iter().next()?;
        (now >= block.last_sent_on.saturating_add(rtt.resend_delay(self.choked_resends + 1)))
            .then_some(id)
    }

    /// Turns up to one block's worth of pending bytes into an outstanding block
    fn take_pending_block(&mut self, now: u64) -> (BlockId, Bytes, Arc<WriteStatus>) {
        let len = min(self.pending.len(), self.max_message_size);
        let payload = self.pending.split_to(len).freeze();
        if self.pending.is_empty() {
            self.pending_since = None;
        }
        let (block_id, status) = self.register(PacketFlags::empty(), payload.clone(), now);
        (block_id, payload, status)
    }

    fn register(&mut self, flags: PacketFlags, payload: Bytes, now: u64) -> (BlockId, Arc<WriteStatus>) {
        let block_id = self.next_block_id;
        self.next_block_id = block_id.next();

        let status = Arc::new(WriteStatus::new());
        self.outstanding.insert(block_id, OutstandingBlock {
            flags,
            payload,
            status: status.clone(),
            first_sent_on: now,
            last_sent_on: now,
            num_sends: 1,
            nack_count: 0,
            resent_while_choked: false,
        });
        (block_id, status)
    }
}

/// Result of processing the ack fields of an inbound packet
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    pub acked: Vec<BlockId>,
    /// round trip times of acked blocks that were sent exactly once
    pub rtt_samples: Vec<u64>,
    /// blocks that were NACKed often enough to be resent right away
    pub fast_retransmit: Vec<BlockId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetransmitOutcome {
    pub retransmitted: Vec<BlockId>,
    /// a block that is due for retransmission but was already sent the maximum number of times
    pub exhausted: Option<BlockId>,
}

/// Splits the application's byte stream into blocks, assigns them consecutive ids and keeps
///  them until they are acknowledged, so they can be retransmitted. The number of outstanding
///  blocks is limited by the current window, and writers are blocked while it is full.
pub struct SendBuffer {
    max_window_size: usize,
    write_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    inner: Mutex<SendBufferInner>,
    window_space: Notify,
}

impl SendBuffer {
    pub fn new(options: &ConnectionOptions, clock: Arc<dyn Clock>) -> SendBuffer {
        SendBuffer {
            max_window_size: options.max_window_size,
            write_timeout: options.write_timeout,
            clock,
            inner: Mutex::new(SendBufferInner {
                max_message_size: options.max_message_size,
                next_block_id: BlockId::ZERO,
                outstanding: BTreeMap::new(),
                pending: BytesMut::new(),
                pending_since: None,
                window_size: min(options.initial_window_size, options.max_window_size).max(1),
                choked: false,
                choked_resends: 0,
                closed: false,
                failure: None,
            }),
            window_space: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SendBufferInner> {
        self.inner.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `data` for sending. Full blocks are handed to the sink right away, a trailing
    ///  partial block waits for more data, a flush or the passive flush delay.
    ///
    /// Blocks while the window is full. If that takes longer than the write timeout, this
    ///  fails with `Timeout`; bytes that were accepted before remain queued.
    pub async fn write(&self, data: &[u8], sink: &dyn BlockSink) -> Result<usize, StreamError> {
        let mut remaining = data;
        loop {
            {
                let mut inner = self.lock();
                inner.check_writable()?;

                let take = min(remaining.len(), inner.max_message_size.saturating_sub(inner.pending.len()));
                if take > 0 {
                    inner.pending.extend_from_slice(&remaining[..take]);
                    remaining = &remaining[take..];
                    if inner.pending_since.is_none() {
                        inner.pending_since = Some(self.clock.now_millis());
                    }
                }
            }

            while self.send_pending(sink, false).await?.is_some() {}
            if remaining.is_empty() {
                return Ok(data.len());
            }
        }
    }

    /// Sends the pending partial block (if any) and waits until all outstanding blocks are
    ///  acknowledged or the write timeout elapses. The first failed block fails the flush.
    pub async fn flush(&self, sink: &dyn BlockSink) -> Result<(), StreamError> {
        let deadline = deadline_after(self.write_timeout);
        self.flush_pending(sink).await?;

        let statuses: Vec<Arc<WriteStatus>> = self.lock().outstanding
            .values()
            .map(|block| block.status.clone())
            .collect();

        debug!("flushing: waiting for {} outstanding blocks", statuses.len());
        for status in statuses {
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            if let Err(e) = status.wait_for_completion(remaining).await {
                return Err(match (e, self.lock().failure) {
                    (StreamError::WriteFailure, Some(failure)) => failure.to_error(),
                    (e, _) => e,
                });
            }
        }
        Ok(())
    }

    /// Sends all pending data, waiting for window space
    pub async fn flush_pending(&self, sink: &dyn BlockSink) -> Result<(), StreamError> {
        while self.send_pending(sink, true).await?.is_some() {}
        Ok(())
    }

    /// Sends one block of pending data if there is a full block (or if `force` is set and
    ///  there is any), waiting for window space
    async fn send_pending(&self, sink: &dyn BlockSink, force: bool) -> Result<Option<Arc<WriteStatus>>, StreamError> {
        let deadline = deadline_after(self.write_timeout);
        loop {
            let notified = self.window_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_process = sink.write_in_process();
            let registered = {
                let mut inner = self.lock();
                inner.check_failure()?;

                let should_send = inner.pending.len() >= inner.max_message_size
                    || (force && !inner.pending.is_empty());
                if !should_send {
                    return Ok(None);
                }

                if !in_process && inner.has_window_space() {
                    Some(inner.take_pending_block(self.clock.now_millis()))
                }
                else {
                    trace!("waiting for window space: {} blocks outstanding, choked: {}", inner.outstanding.len(), inner.choked);
                    None
                }
            };

            if let Some((block_id, payload, status)) = registered {
                return self.hand_to_sink(block_id, PacketFlags::empty(), &payload, status, sink)
                    .map(Some);
            }
            wait_with_deadline(notified, deadline).await?;
        }
    }

    /// Non-blocking variant of [SendBuffer::flush_pending] for the timer: sends the pending
    ///  partial block only if there is window space right now
    pub fn try_flush_pending(&self, sink: &dyn BlockSink) -> bool {
        if sink.write_in_process() {
            return false;
        }

        let (block_id, payload, status) = {
            let mut inner = self.lock();
            if inner.failure.is_some() || inner.pending.is_empty() || !inner.has_window_space() {
                return false;
            }
            inner.take_pending_block(self.clock.now_millis())
        };
        self.hand_to_sink(block_id, PacketFlags::empty(), &payload, status, sink).is_ok()
    }

    /// `true` if there is a partial block that waited for at least `delay_millis` and could be
    ///  sent now
    pub fn passive_flush_due(&self, now: u64, delay_millis: u64) -> bool {
        let inner = self.lock();
        inner.failure.is_none()
            && !inner.pending.is_empty()
            && inner.has_window_space()
            && inner.pending_since.is_some_and(|since| now >= since.saturating_add(delay_millis))
    }

    /// Sends a sequenced control block (SYN, CLOSE) without payload. Control blocks do not wait
    ///  for window space, so this never blocks.
    pub fn send_control(&self, flags: PacketFlags, sink: &dyn BlockSink) -> Result<(BlockId, Arc<WriteStatus>), StreamError> {
        let (block_id, status) = {
            let mut inner = self.lock();
            inner.check_failure()?;
            inner.register(flags, Bytes::new(), self.clock.now_millis())
        };
        debug!("sending control block {} {:?}", block_id, flags);
        self.hand_to_sink(block_id, flags, &Bytes::new(), status.clone(), sink)?;
        Ok((block_id, status))
    }

    fn hand_to_sink(&self, block_id: BlockId, flags: PacketFlags, payload: &Bytes, status: Arc<WriteStatus>, sink: &dyn BlockSink) -> Result<Arc<WriteStatus>, StreamError> {
        if sink.write_data(block_id, flags, payload) {
            status.mark_accepted();
            Ok(status)
        }
        else {
            debug!("block {} was rejected by the transport", block_id);
            self.lock().outstanding.remove(&block_id);
            status.mark_failed();
            Err(StreamError::WriteFailure)
        }
    }

    /// Processes the ack fields of an inbound packet: blocks through `ack_through` that are
    ///  not NACKed are acknowledged and released.
    pub fn acknowledge(&self, ack_through: BlockId, nacks: &[BlockId], now: u64, fast_retransmit_threshold: u32) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        let mut inner = self.lock();
        outcome.acked = inner.outstanding
            .range(..=ack_through)
            .map(|(&id, _)| id)
            .filter(|id| nacks.binary_search(id).is_err())
            .collect();

        for id in &outcome.acked {
            if let Some(block) = inner.outstanding.remove(id) {
                if block.num_sends == 1 && !block.resent_while_choked {
                    outcome.rtt_samples.push(now.saturating_sub(block.first_sent_on));
                }
                block.status.mark_succeeded();
            }
        }

        for nack in nacks {
            if let Some(block) = inner.outstanding.get_mut(nack) {
                block.nack_count += 1;
                if block.nack_count >= fast_retransmit_threshold && block.num_sends == 1 {
                    outcome.fast_retransmit.push(*nack);
                }
            }
        }

        if !outcome.acked.is_empty() {
            trace!("acked blocks {:?}, {} still outstanding", outcome.acked, inner.outstanding.len());
            self.window_space.notify_waiters();
        }
        outcome
    }

    /// `true` if some outstanding block waited longer than its retransmission timeout, or if
    ///  the lowest block is due for a resend while choked
    pub fn has_retransmit_due(&self, now: u64, rtt: &RttEstimator) -> bool {
        let inner = self.lock();
        if inner.choked {
            return inner.choked_resend_due(now, rtt).is_some();
        }
        inner.outstanding
            .values()
            .any(|block| block.is_due(now, rtt))
    }

    /// Resends all blocks whose retransmission timeout elapsed, unchanged. Stops at the first
    ///  block that was already sent `max_resends` times.
    ///
    /// While choked, this only resends the lowest outstanding block, if that is due.
    pub fn retransmit_due(&self, now: u64, rtt: &RttEstimator, max_resends: u32, sink: &dyn BlockSink) -> RetransmitOutcome {
        let mut outcome = RetransmitOutcome::default();
        let mut due = Vec::new();
        {
            let mut inner = self.lock();
            if inner.choked {
                if let Some(id) = inner.choked_resend_due(now, rtt) {
                    inner.choked_resends += 1;
                    if let Some(block) = inner.outstanding.get_mut(&id) {
                        trace!("choked, resending lowest block {}", id);
                        block.last_sent_on = now;
                        block.resent_while_choked = true;
                        due.push((id, block.flags, block.payload.clone()));
                    }
                }
            }
            else {
                for (&id, block) in inner.outstanding.iter_mut() {
                    if !block.is_due(now, rtt) {
                        continue;
                    }
                    if block.num_sends >= max_resends {
                        warn!("block {} was sent {} times without being acked", id, block.num_sends);
                        outcome.exhausted = Some(id);
                        break;
                    }
                    block.num_sends += 1;
                    block.last_sent_on = now;
                    due.push((id, block.flags, block.payload.clone()));
                }
            }
        }

        for (id, flags, payload) in due {
            debug!("retransmitting block {}", id);
            sink.write_data(id, flags, &payload);
            outcome.retransmitted.push(id);
        }
        outcome
    }

    /// Resends the given blocks right away, e.g. because they were NACKed repeatedly. Nothing
    ///  is resent while choked.
    pub fn retransmit_now(&self, block_ids: &[BlockId], now: u64, sink: &dyn BlockSink) {
        let due: Vec<_> = {
            let mut inner = self.lock();
            if inner.choked {
                return;
            }
            block_ids.iter()
                .filter_map(|id| {
                    let block = inner.outstanding.get_mut(id)?;
                    block.num_sends += 1;
                    block.last_sent_on = now;
                    Some((*id, block.flags, block.payload.clone()))
                })
                .collect()
        };

        for (id, flags, payload) in due {
            debug!("fast retransmit of block {}", id);
            sink.write_data(id, flags, &payload);
        }
    }

    /// No further data can be written. Outstanding blocks are still retransmitted, and control
    ///  blocks can still be sent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.window_space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Abandons all outstanding and pending data, failing waiting writers and flushes
    pub fn fail_all(&self, reset: bool) {
        let mut inner = self.lock();
        if inner.failure.is_none() {
            inner.failure = Some(if reset { Failure::Reset } else { Failure::Abandoned });
        }
        inner.closed = true;
        for block in inner.outstanding.values() {
            block.status.mark_failed();
        }
        if !inner.outstanding.is_empty() {
            debug!("abandoned {} outstanding blocks", inner.outstanding.len());
        }
        inner.outstanding.clear();
        inner.pending.clear();
        inner.pending_since = None;
        self.window_space.notify_waiters();
    }

    pub fn set_window_size(&self, window_size: usize) {
        let mut inner = self.lock();
        let window_size = window_size.clamp(1, self.max_window_size);
        if window_size > inner.window_size {
            self.window_space.notify_waiters();
        }
        inner.window_size = window_size;
    }

    pub fn window_size(&self) -> usize {
        self.lock().window_size
    }

    /// The peer asks us to stop sending new blocks (or allows it again). Returns `true` if
    ///  that changed anything.
    pub fn set_choked(&self, choked: bool) -> bool {
        let mut inner = self.lock();
        if inner.choked == choked {
            return false;
        }
        inner.choked = choked;
        inner.choked_resends = 0;
        if !choked {
            self.window_space.notify_waiters();
        }
        true
    }

    pub fn is_choked(&self) -> bool {
        self.lock().choked
    }

    /// Lowers the block size to what the peer accepts. Returns `true` if it was lowered.
    pub fn limit_message_size(&self, peer_max: usize) -> bool {
        let mut inner = self.lock();
        if peer_max == 0 || peer_max >= inner.max_message_size {
            return false;
        }
        inner.max_message_size = peer_max;
        true
    }

    pub fn max_message_size(&self) -> usize {
        self.lock().max_message_size
    }

    /// Re-evaluates blocked writers, e.g. after the sink's `write_in_process()` changed
    pub fn wake_writers(&self) {
        self.window_space.notify_waiters();
    }

    pub fn next_block_id(&self) -> BlockId {
        self.lock().next_block_id
    }

    pub fn outstanding_count(&self) -> usize {
        self.lock().outstanding.len()
    }

    pub fn is_outstanding(&self, block_id: BlockId) -> bool {
        self.lock().outstanding.contains_key(&block_id)
    }

    pub fn pending_bytes(&self) -> usize {
        self.lock().pending.len()
    }

    /// `true` if everything that was written is acknowledged
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.outstanding.is_empty() && inner.pending.is_empty()
    }
}
