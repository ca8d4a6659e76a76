use crate::destination::Destination;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

/// The lower-layer message session that the streaming protocol runs on: it delivers single
///  packets to a destination, unreliably and possibly out of order, and takes care of
///  encryption and routing.
///
/// Inbound packets are pushed into
///  [ConnectionManager::on_packet_received](crate::connection_manager::ConnectionManager::on_packet_received).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn send_packet(&self, to: &Destination, packet_buf: &[u8]) -> anyhow::Result<()>;

    fn my_destination(&self) -> Destination;
}
