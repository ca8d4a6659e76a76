use crate::clock::{Clock, MockClock};
use crate::connection::Connection;
use crate::destination::Destination;
use crate::options::ConnectionOptions;
use crate::packet::Packet;
use crate::packet_queue::OutboundPacket;
use crate::session::Session;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// convenience method for unit test code: create a [Destination] based on a number, the same
///  number generating the same destination and different numbers different destinations
pub fn test_destination(number: u8) -> Destination {
    Destination::new(vec![number; 16])
}

/// A clock that only moves when the test says so
#[derive(Clone, Default)]
pub struct TestClock {
    now: Arc<AtomicU64>,
}

impl TestClock {
    pub fn new(now: u64) -> TestClock {
        TestClock {
            now: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Release);
    }

    pub fn advance(&self, millis: u64) -> u64 {
        self.now.fetch_add(millis, Ordering::AcqRel) + millis
    }

    pub fn as_clock(&self) -> Arc<dyn Clock> {
        let now = self.now.clone();
        let mut clock = MockClock::new();
        clock.expect_now_millis()
            .returning(move || now.load(Ordering::Acquire));
        Arc::new(clock)
    }
}

/// Creates a connection whose outbound packets end up in the returned receiver
pub fn test_connection(send_stream_id: u32, options: ConnectionOptions, clock: &TestClock) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundPacket>) {
    let (send, recv) = mpsc::unbounded_channel();
    let connection = Connection::new(
        7,
        send_stream_id,
        test_destination(2),
        test_destination(1),
        options,
        clock.as_clock(),
        send,
    );
    (Arc::new(connection), recv)
}

/// returns all packets sent so far
pub fn drain_outbound(recv: &mut mpsc::UnboundedReceiver<OutboundPacket>) -> Vec<Packet> {
    let mut result = Vec::new();
    while let Ok(outbound) = recv.try_recv() {
        result.push(outbound.packet);
    }
    result
}

#[derive(Debug)]
pub struct TrackingSession {
    myself: Destination,
    tracker: Mutex<Vec<(Destination, Bytes)>>,
}

impl TrackingSession {
    pub fn new(myself: Destination) -> Self {
        TrackingSession {
            myself,
            tracker: Default::default(),
        }
    }

    /// returns sent packets, clearing the internal buffer
    pub fn sent_packets(&self) -> Vec<(Destination, Bytes)> {
        let mut lock = self.tracker.lock().unwrap();
        std::mem::take(&mut *lock)
    }
}

#[async_trait]
impl Session for TrackingSession {
    async fn send_packet(&self, to: &Destination, packet_buf: &[u8]) -> anyhow::Result<()> {
        self.tracker.lock().unwrap().push((to.clone(), Bytes::copy_from_slice(packet_buf)));
        Ok(())
    }

    fn my_destination(&self) -> Destination {
        self.myself.clone()
    }
}
