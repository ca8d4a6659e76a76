use crate::block_id::BlockId;
use crate::error::StreamError;
use crate::options::ConnectionOptions;
use crate::packet::Packet;
use bytes::Bytes;
use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

struct ReceiveBufferInner {
    /// Blocks that are part of the contiguous prefix but were not (fully) read yet, in block
    ///  order. Empty blocks (SYN, CLOSE) advance the prefix without being stored here.
    ready: VecDeque<Bytes>,
    /// offset of the next unread byte in `ready.front()`
    read_cursor: usize,
    /// unread bytes in `ready`
    ready_bytes: usize,

    /// Blocks above a gap, waiting for the gap to be filled
    not_ready: BTreeMap<BlockId, Bytes>,
    not_ready_bytes: usize,

    /// all blocks up to and including this id were received. `None` if block 0 is still missing
    highest_ready_block_id: Option<BlockId>,
    /// the highest id received at all, possibly with gaps below it
    highest_block_id: Option<BlockId>,

    locally_closed: bool,
    /// id of the peer's CLOSE block, if one was received: the stream ends once this block is
    ///  ready and all data before it was read
    close_block_id: Option<BlockId>,
    reset: bool,
}

impl ReceiveBufferInner {
    fn buffered_bytes(&self) -> usize {
        self.ready_bytes + self.not_ready_bytes
    }

    fn is_ready_dup(&self, block_id: BlockId) -> bool {
        self.highest_ready_block_id
            .is_some_and(|highest_ready| block_id <= highest_ready)
    }

    fn next_ready_id(&self) -> BlockId {
        BlockId::after(self.highest_ready_block_id)
    }

    fn push_ready(&mut self, block_id: BlockId, payload: Bytes) {
        self.highest_ready_block_id = Some(block_id);
        if !self.locally_closed && !payload.is_empty() {
            self.ready_bytes += payload.len();
            self.ready.push_back(payload);
        }
    }

    fn copy_ready(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.ready.front() else {
                break;
            };
            let available = &front[self.read_cursor..];
            let n = min(available.len(), buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            self.read_cursor += n;

            if self.read_cursor == front.len() {
                self.ready.pop_front();
                self.read_cursor = 0;
            }
        }
        self.ready_bytes -= copied;
        copied
    }

    /// Only meaningful when there are no unread ready bytes
    fn is_end_of_stream(&self) -> bool {
        if self.locally_closed {
            return true;
        }
        match (self.close_block_id, self.highest_ready_block_id) {
            (Some(close), Some(highest_ready)) => highest_ready >= close,
            _ => false,
        }
    }

    fn missing_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        let start = self.next_ready_id().to_raw();
        let end = self.highest_block_id
            .map(|id| id.to_raw())
            .unwrap_or(0);

        (start..end)
            .map(BlockId::from_raw)
            .filter(|id| !self.not_ready.contains_key(id))
    }
}

/// Reassembles blocks that arrive in arbitrary order (and possibly duplicated) into the
///  in-order byte stream that is exposed to the application, and keeps track of what needs to
///  be acknowledged.
///
/// Memory is bounded: [ReceiveBuffer::can_accept] is consulted before a block is added, and it
///  limits both the number of buffered bytes and the number of blocks waiting for a gap.
pub struct ReceiveBuffer {
    inbound_buffer_size: usize,
    /// a choked peer is unchoked once no more than this many bytes are buffered
    unchoke_threshold: usize,
    min_ready_buffers: u64,
    out_of_order_limit: usize,
    inner: Mutex<ReceiveBufferInner>,
    data_available: Notify,
}

impl ReceiveBuffer {
    pub fn new(options: &ConnectionOptions) -> ReceiveBuffer {
        ReceiveBuffer {
            inbound_buffer_size: options.inbound_buffer_size,
            unchoke_threshold: options.inbound_buffer_size
                .saturating_sub(options.max_message_size.max(options.inbound_buffer_size / 2)),
            min_ready_buffers: options.min_ready_buffers,
            out_of_order_limit: options.out_of_order_block_limit(),
            inner: Mutex::new(ReceiveBufferInner {
                ready: VecDeque::new(),
                read_cursor: 0,
                ready_bytes: 0,
                not_ready: BTreeMap::new(),
                not_ready_bytes: 0,
                highest_ready_block_id: None,
                highest_block_id: None,
                locally_closed: false,
                close_block_id: None,
                reset: false,
            }),
            data_available: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReceiveBufferInner> {
        self.inner.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a block. Duplicates (of both ready and waiting blocks) are ignored.
    ///
    /// Returns `true` if the block was new.
    pub fn message_received(&self, block_id: BlockId, payload: Bytes) -> bool {
        let mut inner = self.lock();

        if inner.is_ready_dup(block_id) || inner.not_ready.contains_key(&block_id) {
            trace!("ignoring duplicate block {}", block_id);
            return false;
        }

        inner.highest_block_id = inner.highest_block_id.max(Some(block_id));

        if block_id == inner.next_ready_id() {
            inner.push_ready(block_id, payload);

            loop {
                let next = inner.next_ready_id();
                let Some(payload) = inner.not_ready.remove(&next) else {
                    break;
                };
                inner.not_ready_bytes -= payload.len();
                inner.push_ready(next, payload);
            }

            trace!("block {} received, ready through {:?}", block_id, inner.highest_ready_block_id);
            self.data_available.notify_waiters();
        }
        else {
            trace!("block {} received out of order, ready through {:?}", block_id, inner.highest_ready_block_id);
            let payload = if inner.locally_closed { Bytes::new() } else { payload };
            inner.not_ready_bytes += payload.len();
            inner.not_ready.insert(block_id, payload);
        }
        true
    }

    /// Admission test for an arriving block, run before [ReceiveBuffer::message_received].
    ///
    /// Blocks below `min_ready_buffers` are always accepted so that the handshake can not be
    ///  starved, and duplicates of blocks that are already waiting cost nothing. Apart from
    ///  that, a block must fit into the byte budget, and blocks that do not extend the ready
    ///  prefix are limited in number and in their distance from it.
    pub fn can_accept(&self, block_id: BlockId, size: usize) -> bool {
        if size == 0 {
            return true;
        }

        let inner = self.lock();
        if inner.locally_closed || inner.reset {
            debug!("rejecting block {} with {} bytes: receive buffer is closed", block_id, size);
            return false;
        }
        if block_id.to_raw() < self.min_ready_buffers {
            return true;
        }
        if inner.not_ready.contains_key(&block_id) {
            return true;
        }

        let is_ready_dup = inner.is_ready_dup(block_id);
        let next_ready_id = inner.next_ready_id();
        if !is_ready_dup && block_id != next_ready_id {
            if inner.not_ready.len() >= self.out_of_order_limit {
                warn!("rejecting block {}: {} out-of-order blocks are already waiting", block_id, inner.not_ready.len());
                return false;
            }
            if block_id.to_raw() - next_ready_id.to_raw() > self.out_of_order_limit as u64 {
                warn!("rejecting block {}: too far ahead of the ready prefix {:?}", block_id, inner.highest_ready_block_id);
                return false;
            }
        }

        if inner.buffered_bytes() + size <= self.inbound_buffer_size {
            return true;
        }

        debug!("rejecting block {} with {} bytes: inbound buffer exceeded ({} of {} bytes used)", block_id, size, inner.buffered_bytes(), self.inbound_buffer_size);
        false
    }

    pub fn highest_ready_block_id(&self) -> Option<BlockId> {
        self.lock().highest_ready_block_id
    }

    pub fn highest_block_id(&self) -> Option<BlockId> {
        self.lock().highest_block_id
    }

    /// The ids of all blocks that are missing below the highest received block, or `None` if
    ///  there is no gap
    pub fn get_nacks(&self) -> Option<Vec<BlockId>> {
        let inner = self.lock();
        if inner.highest_ready_block_id == inner.highest_block_id {
            return None;
        }
        Some(inner.missing_ids().collect())
    }

    /// Fills in the ack fields of a packet that is about to be sent: everything through the
    ///  highest received block is acknowledged, except the gaps which are NACKed.
    ///
    /// If there are more gaps than fit into a single packet, the acknowledgement is cut back to
    ///  the highest received block below the first gap that does not fit.
    pub fn update_acks(&self, packet: &mut Packet) {
        let inner = self.lock();

        let mut nacks: Vec<BlockId> = inner.missing_ids()
            .take(Packet::MAX_NACKS + 1)
            .collect();

        let ack_through = if nacks.len() > Packet::MAX_NACKS {
            let first_omitted = nacks[Packet::MAX_NACKS];
            let ack_through = inner.not_ready
                .range(..first_omitted)
                .next_back()
                .map(|(&id, _)| id)
                .or(inner.highest_ready_block_id);
            nacks.retain(|&nack| ack_through.is_some_and(|ack| nack < ack));
            ack_through
        }
        else {
            inner.highest_block_id
        };

        packet.ack_through = ack_through;
        packet.nacks = nacks;
    }

    /// Reads bytes in block order, waiting for at least one byte to become available.
    ///
    /// Returns `Ok(0)` at end of stream, i.e. after the buffer was closed locally or after the
    ///  peer's CLOSE, once all data before it was read. `timeout == None` waits indefinitely.
    pub async fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            let notified = self.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.reset {
                    return Err(StreamError::Reset);
                }
                if inner.ready_bytes > 0 {
                    return Ok(inner.copy_ready(buf));
                }
                if inner.is_end_of_stream() {
                    return Ok(0);
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return Err(StreamError::Timeout);
                    }
                }
            }
        }
    }

    /// Closes the stream for reading. Data that is already ready can still be read, everything
    ///  else is discarded, and blocked readers see end of stream.
    pub fn close(&self) {
        let mut inner = self.lock();
        if !inner.locally_closed {
            debug!("closing receive buffer with {} unread bytes", inner.ready_bytes);
        }
        inner.locally_closed = true;
        for payload in inner.not_ready.values_mut() {
            *payload = Bytes::new();
        }
        inner.not_ready_bytes = 0;
        self.data_available.notify_waiters();
    }

    /// Records the peer's CLOSE block: reads return end of stream once it is ready
    pub fn close_received(&self, block_id: BlockId) {
        let mut inner = self.lock();
        inner.close_block_id = Some(inner.close_block_id.map_or(block_id, |prev| prev.min(block_id)));
        self.data_available.notify_waiters();
    }

    pub fn close_block_id(&self) -> Option<BlockId> {
        self.lock().close_block_id
    }

    /// Aborts the stream: all buffered data is discarded and readers fail
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.reset = true;
        Self::discard(&mut inner);
        self.data_available.notify_waiters();
    }

    /// Releases all buffered data when the connection is torn down
    pub fn release(&self) {
        let mut inner = self.lock();
        inner.locally_closed = true;
        Self::discard(&mut inner);
        self.data_available.notify_waiters();
    }

    fn discard(inner: &mut ReceiveBufferInner) {
        inner.ready.clear();
        inner.read_cursor = 0;
        inner.ready_bytes = 0;
        inner.not_ready.clear();
        inner.not_ready_bytes = 0;
    }

    pub fn is_locally_closed(&self) -> bool {
        self.lock().locally_closed
    }

    /// bytes of received data that were not read yet, whether ready or waiting for a gap
    pub fn total_buffered_bytes(&self) -> usize {
        self.lock().buffered_bytes()
    }

    pub fn ready_bytes(&self) -> usize {
        self.lock().ready_bytes
    }

    /// `true` if the block was received before, whether it is still buffered or not
    pub fn is_duplicate(&self, block_id: BlockId) -> bool {
        let inner = self.lock();
        inner.is_ready_dup(block_id) || inner.not_ready.contains_key(&block_id)
    }

    /// `true` once the application read enough that a peer we choked may resume sending
    pub fn has_room_to_unchoke(&self) -> bool {
        self.lock().buffered_bytes() <= self.unchoke_threshold
    }

    pub fn out_of_order_count(&self) -> usize {
        self.lock().not_ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn id(raw: u64) -> BlockId {
        BlockId::from_raw(raw)
    }

    fn ids(raw: &[u64]) -> Vec<BlockId> {
        raw.iter().copied().map(BlockId::from_raw).collect()
    }

    fn buffer(inbound_buffer_size: usize) -> ReceiveBuffer {
        ReceiveBuffer::new(&ConnectionOptions {
            max_message_size: 1024,
            inbound_buffer_size,
            max_window_size: 8,
            ..Default::default()
        })
    }

    fn block(id: u64, len: usize) -> Bytes {
        Bytes::from(vec![(id % 251) as u8; len])
    }

    /// deterministic permutation of 0..n for n a power of two
    fn shuffled(n: u64) -> Vec<u64> {
        (0..n).map(|i| (i * 37 + 11) % n).collect()
    }

    #[rstest]
    #[case::in_order(vec![0,1,2,3,4])]
    #[case::reversed(vec![4,3,2,1,0])]
    #[case::interleaved(vec![1,3,0,4,2])]
    #[case::single(vec![0])]
    #[case::permutation(shuffled(64))]
    fn test_all_received_is_all_ready(#[case] order: Vec<u64>) {
        let buffer = buffer(1_000_000);
        for &i in &order {
            assert!(buffer.message_received(id(i), block(i, 10)));
        }

        let n = order.len() as u64;
        assert_eq!(buffer.highest_ready_block_id(), Some(id(n - 1)));
        assert_eq!(buffer.highest_block_id(), Some(id(n - 1)));
        assert_eq!(buffer.get_nacks(), None);
    }

    #[test]
    fn test_empty() {
        let buffer = buffer(10_000);
        assert_eq!(buffer.highest_ready_block_id(), None);
        assert_eq!(buffer.highest_block_id(), None);
        assert_eq!(buffer.get_nacks(), None);
    }

    #[test]
    fn test_gap_is_nacked_until_filled() {
        let buffer = buffer(10_000);
        buffer.message_received(id(0), block(0, 10));
        buffer.message_received(id(2), block(2, 10));
        assert_eq!(buffer.get_nacks(), Some(ids(&[1])));
        assert_eq!(buffer.highest_ready_block_id(), Some(id(0)));
        assert_eq!(buffer.highest_block_id(), Some(id(2)));

        buffer.message_received(id(1), block(1, 10));
        assert_eq!(buffer.get_nacks(), None);
        assert_eq!(buffer.highest_ready_block_id(), Some(id(2)));
    }

    #[rstest]
    #[case::missing_start(vec![3], vec![0,1,2])]
    #[case::two_gaps(vec![0,2,5], vec![1,3,4])]
    #[case::filled_gap(vec![0,2,5,3], vec![1,4])]
    fn test_nacks(#[case] received: Vec<u64>, #[case] expected: Vec<u64>) {
        let buffer = buffer(10_000);
        for i in received {
            buffer.message_received(id(i), block(i, 1));
        }
        assert_eq!(buffer.get_nacks(), Some(ids(&expected)));
    }

    #[rstest]
    #[case::dup_ready(vec![0,1], 1)]
    #[case::dup_not_ready(vec![0,2], 2)]
    fn test_duplicate_is_ignored(#[case] received: Vec<u64>, #[case] dup: u64) {
        let buffer = buffer(10_000);
        for i in received {
            buffer.message_received(id(i), block(i, 10));
        }
        let before = buffer.total_buffered_bytes();
        assert!(!buffer.message_received(id(dup), block(dup, 10)));
        assert_eq!(buffer.total_buffered_bytes(), before);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(15)]
    fn test_can_accept_handshake_blocks(#[case] block_id: u64) {
        let buffer = buffer(1024);
        assert!(buffer.can_accept(id(block_id), 1024));

        // even with a full buffer
        for i in 20..30 {
            buffer.message_received(id(i), block(i, 1024));
        }
        assert!(buffer.can_accept(id(block_id), 1024));
    }

    #[test]
    fn test_can_accept_empty_always() {
        let buffer = buffer(1024);
        buffer.close();
        assert!(buffer.can_accept(id(1000), 0));
    }

    #[test]
    fn test_can_accept_full_buffer_not_ready() {
        let buffer = buffer(4 * 1024);
        for i in 20..24 {
            assert!(buffer.can_accept(id(i), 1024));
            buffer.message_received(id(i), block(i, 1024));
        }
        assert_eq!(buffer.total_buffered_bytes(), 4 * 1024);

        assert!(!buffer.can_accept(id(24), 1024));
        assert!(!buffer.can_accept(id(19), 1024));
        // a not-ready duplicate needs no additional space
        assert!(buffer.can_accept(id(21), 1024));
    }

    #[test]
    fn test_can_accept_full_buffer_ready() {
        let buffer = buffer(4 * 1024);
        for i in 0..20 {
            buffer.message_received(id(i), Bytes::new());
        }
        for i in 20..24 {
            buffer.message_received(id(i), block(i, 1024));
        }
        assert_eq!(buffer.highest_ready_block_id(), Some(id(23)));
        assert_eq!(buffer.ready_bytes(), 4 * 1024);

        assert!(!buffer.can_accept(id(24), 1024));
        // ready blocks can not make room twice
        assert!(!buffer.can_accept(id(21), 1024));
        assert!(buffer.is_duplicate(id(21)));
        assert!(!buffer.is_duplicate(id(24)));
    }

    #[tokio::test]
    async fn test_unchoke_threshold() {
        // 4 KiB buffer and 1 KiB blocks: unchoke once at most half of it is used
        let buffer = buffer(4 * 1024);
        for i in 0..4 {
            buffer.message_received(id(i), block(i, 1024));
        }
        assert!(!buffer.has_room_to_unchoke());

        let mut buf = vec![0u8; 1024];
        buffer.read(&mut buf, Some(Duration::ZERO)).await.unwrap();
        assert!(!buffer.has_room_to_unchoke());
        buffer.read(&mut buf, Some(Duration::ZERO)).await.unwrap();
        assert!(buffer.has_room_to_unchoke());
    }

    #[tokio::test]
    async fn test_reading_makes_room() {
        let buffer = buffer(2 * 1024);
        for i in 0..20 {
            buffer.message_received(id(i), block(i, 100));
        }
        assert!(!buffer.can_accept(id(20), 1024));

        let mut buf = vec![0u8; 1500];
        assert_eq!(buffer.read(&mut buf, Some(Duration::ZERO)).await.unwrap(), 1500);
        assert!(buffer.can_accept(id(20), 1024));
    }

    #[test]
    fn test_can_accept_out_of_order_limit() {
        // max window 8 -> at most 32 blocks may wait for a gap
        let buffer = buffer(1_000_000);
        for i in 0..16 {
            buffer.message_received(id(i), block(i, 10));
        }
        for i in 17..49 {
            assert!(buffer.can_accept(id(i), 10), "block {}", i);
            buffer.message_received(id(i), block(i, 10));
        }
        assert_eq!(buffer.out_of_order_count(), 32);

        assert!(!buffer.can_accept(id(49), 10));
        // the contiguous block is still welcome, as are not-ready duplicates
        assert!(buffer.can_accept(id(16), 10));
        assert!(buffer.can_accept(id(30), 10));
    }

    #[test]
    fn test_can_accept_far_ahead() {
        let buffer = buffer(1_000_000);
        buffer.message_received(id(0), block(0, 10));
        assert!(buffer.can_accept(id(33), 10));
        assert!(!buffer.can_accept(id(34), 10));
        assert!(!buffer.can_accept(id(1 << 40), 10));
    }

    #[test]
    fn test_update_acks_empty() {
        let buffer = buffer(1024);
        let mut packet = Packet {
            ack_through: Some(id(99)),
            nacks: ids(&[5]),
            ..Default::default()
        };
        buffer.update_acks(&mut packet);
        assert_eq!(packet.ack_through, None);
        assert!(packet.nacks.is_empty());
    }

    #[rstest]
    #[case::contiguous(vec![0,1,2], Some(2), vec![])]
    #[case::gap(vec![0,2,3], Some(3), vec![1])]
    #[case::missing_start(vec![2], Some(2), vec![0,1])]
    fn test_update_acks(#[case] received: Vec<u64>, #[case] expected_ack: Option<u64>, #[case] expected_nacks: Vec<u64>) {
        let buffer = buffer(1_000_000);
        for i in received {
            buffer.message_received(id(i), block(i, 1));
        }
        let mut packet = Packet::default();
        buffer.update_acks(&mut packet);
        assert_eq!(packet.ack_through, expected_ack.map(id));
        assert_eq!(packet.nacks, ids(&expected_nacks));
    }

    #[test]
    fn test_update_acks_truncates_nacks() {
        let buffer = ReceiveBuffer::new(&ConnectionOptions {
            max_window_size: 1024,
            inbound_buffer_size: 1_000_000,
            ..Default::default()
        });
        buffer.message_received(id(0), block(0, 1));
        // every other block is missing: 1, 3, 5, ...
        for i in (2..=600).step_by(2) {
            buffer.message_received(id(i), block(i, 1));
        }

        let mut packet = Packet::default();
        buffer.update_acks(&mut packet);

        // the 256th gap is block 511, the highest received block below it is 510
        assert_eq!(packet.ack_through, Some(id(510)));
        assert_eq!(packet.nacks.len(), Packet::MAX_NACKS);
        assert_eq!(packet.nacks.first(), Some(&id(1)));
        assert_eq!(packet.nacks.last(), Some(&id(509)));
    }

    #[tokio::test]
    async fn test_shuffled_round_trip_with_duplicates() {
        let n = 64u64;
        let buffer = buffer(1_000_000);

        let original: Vec<u8> = (0..n)
            .flat_map(|i| (0..1024).map(move |j| ((i * 7 + j) % 256) as u8))
            .collect();
        let chunk = |i: u64| Bytes::copy_from_slice(&original[i as usize * 1024..(i as usize + 1) * 1024]);

        for round in 0..3 {
            for i in shuffled(n) {
                let is_new = buffer.message_received(id(i), chunk(i));
                assert_eq!(is_new, round == 0);
            }
        }

        let mut result = Vec::new();
        let mut buf = vec![0u8; 1000];
        while result.len() < original.len() {
            let n = buffer.read(&mut buf, Some(Duration::ZERO)).await.unwrap();
            result.extend_from_slice(&buf[..n]);
        }
        assert_eq!(result, original);
        assert!(buffer.read(&mut buf, Some(Duration::ZERO)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_waits_for_data() {
        let buffer = Arc::new(buffer(10_000));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 10];
                let n = buffer.read(&mut buf, None).await.unwrap();
                buf[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        buffer.message_received(id(1), Bytes::from_static(b"world"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());

        buffer.message_received(id(0), Bytes::from_static(b"hello "));
        assert_eq!(reader.await.unwrap(), b"hello worl".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let buffer = buffer(10_000);
        let start = Instant::now();

        let mut buf = vec![0u8; 10];
        let result = buffer.read(&mut buf, Some(Duration::from_secs(3))).await;
        assert!(matches!(result, Err(StreamError::Timeout)));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_unblocks_reader() {
        let buffer = Arc::new(buffer(10_000));

        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 10];
                buffer.read(&mut buf, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        buffer.close();
        assert_eq!(reader.await.unwrap().unwrap(), 0);
        assert!(!buffer.can_accept(id(100), 1));
        assert!(!buffer.can_accept(id(3), 1));
    }

    #[rstest]
    #[case::ready(0, true)]
    #[case::gap(1, false)]
    #[case::waiting(2, true)]
    #[case::ahead(3, false)]
    fn test_is_duplicate_after_close(#[case] block_id: u64, #[case] expected: bool) {
        let buffer = buffer(10_000);
        buffer.message_received(id(0), block(0, 10));
        buffer.message_received(id(2), block(2, 10));
        buffer.close();

        assert_eq!(buffer.is_duplicate(id(block_id)), expected);
    }

    #[tokio::test]
    async fn test_close_keeps_ready_data() {
        let buffer = buffer(10_000);
        buffer.message_received(id(0), Bytes::from_static(b"abc"));
        buffer.message_received(id(2), Bytes::from_static(b"xyz"));
        buffer.close();

        assert_eq!(buffer.total_buffered_bytes(), 3);
        let mut buf = vec![0u8; 10];
        assert_eq!(buffer.read(&mut buf, None).await.unwrap(), 3);
        assert_eq!(buffer.read(&mut buf, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_after_close_block() {
        let buffer = buffer(10_000);
        buffer.message_received(id(0), Bytes::new());
        buffer.message_received(id(3), Bytes::new());
        buffer.close_received(id(3));
        buffer.message_received(id(2), Bytes::from_static(b"cd"));

        let mut buf = vec![0u8; 10];
        // block 1 is still missing
        assert!(matches!(buffer.read(&mut buf, Some(Duration::ZERO)).await, Err(StreamError::Timeout)));

        buffer.message_received(id(1), Bytes::from_static(b"ab"));
        assert_eq!(buffer.read(&mut buf, None).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(buffer.read(&mut buf, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_fails_reader() {
        let buffer = buffer(10_000);
        buffer.message_received(id(0), Bytes::from_static(b"abc"));
        buffer.reset();

        let mut buf = vec![0u8; 10];
        assert!(matches!(buffer.read(&mut buf, None).await, Err(StreamError::Reset)));
        assert_eq!(buffer.total_buffered_bytes(), 0);
        assert!(!buffer.can_accept(id(1), 1));
    }
}
