use crate::destination::Destination;
use crate::packet::{Packet, PacketFlags};
use crate::session::Session;
use crate::signature::PacketSigner;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// A packet on its way to the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPacket {
    pub to: Destination,
    pub packet: Packet,
}

/// The last step on the way out: serializes packets, signs them where required and hands them
///  to the session. The matching inbound step ([PacketQueue::decode]) verifies signatures.
pub struct PacketQueue {
    session: Arc<dyn Session>,
    signer: Arc<dyn PacketSigner>,
}

impl PacketQueue {
    pub fn new(session: Arc<dyn Session>, signer: Arc<dyn PacketSigner>) -> PacketQueue {
        PacketQueue { session, signer }
    }

    pub fn encode(&self, packet: &Packet) -> anyhow::Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(packet.serialized_len() + self.signer.signature_len());
        packet.ser(&mut buf)?;
        if packet.is_signed() {
            let signature = self.signer.sign(&buf);
            buf.put_slice(&signature);
        }
        Ok(buf)
    }

    /// Parses an inbound packet and checks its signature. Packets with flags that require a
    ///  signature are rejected without one.
    pub fn decode(&self, raw: &Bytes) -> anyhow::Result<Packet> {
        let packet = Packet::deser(raw)?;

        if packet.flags.intersects(Packet::FLAGS_REQUIRING_SIGNATURE) && !packet.is_signed() {
            bail!("unsigned packet with flags {:?}", packet.flags - PacketFlags::SIGNATURE_INCLUDED);
        }
        if packet.is_signed() {
            let signed_len = raw.len() - packet.signature.len();
            if !self.signer.verify(&raw[..signed_len], &packet.signature) {
                bail!("invalid signature");
            }
        }
        Ok(packet)
    }

    pub async fn send(&self, outbound: OutboundPacket) {
        let buf = match self.encode(&outbound.packet) {
            Ok(buf) => buf,
            Err(e) => {
                error!("error serializing {}: {}", outbound.packet, e);
                return;
            }
        };

        trace!("sending {} to {}", outbound.packet, outbound.to);
        if let Err(e) = self.session.send_packet(&outbound.to, &buf).await {
            // packets get lost anyway, retransmission takes care of this
            warn!("error sending packet to {}: {}", outbound.to, e);
        }
    }
}

/// Drains the outbound queue until all senders are gone
pub async fn run_packet_queue(queue: Arc<PacketQueue>, mut recv: mpsc::UnboundedReceiver<OutboundPacket>) {
    while let Some(outbound) = recv.recv().await {
        queue.send(outbound).await;
    }
    debug!("outbound packet queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_id::BlockId;
    use crate::session::MockSession;
    use crate::signature::{HmacSha256Signature, NoSignature};
    use crate::test_util::{test_destination, TrackingSession};
    use rstest::rstest;

    fn syn() -> Packet {
        Packet {
            receive_stream_id: 17,
            flags: PacketFlags::SYN | PacketFlags::SIGNATURE_INCLUDED,
            ..Default::default()
        }
    }

    fn data() -> Packet {
        Packet {
            send_stream_id: 3,
            receive_stream_id: 17,
            block_id: BlockId::from_raw(4),
            ack_through: Some(BlockId::from_raw(2)),
            payload: Bytes::from_static(b"abc"),
            ..Default::default()
        }
    }

    fn queue(session: Arc<dyn Session>) -> PacketQueue {
        PacketQueue::new(session, Arc::new(HmacSha256Signature::new(b"secret").unwrap()))
    }

    #[rstest]
    #[case::signed(syn(), HmacSha256Signature::SIGNATURE_LEN)]
    #[case::unsigned(data(), 0)]
    fn test_encode_decode(#[case] packet: Packet, #[case] signature_len: usize) {
        let queue = queue(Arc::new(TrackingSession::new(test_destination(1))));

        let buf = queue.encode(&packet).unwrap();
        assert_eq!(buf.len(), packet.serialized_len() + signature_len);

        let decoded = queue.decode(&buf.freeze()).unwrap();
        assert_eq!(decoded.signature.len(), signature_len);
        assert_eq!(Packet { signature: Bytes::new(), ..decoded }, packet);
    }

    #[test]
    fn test_decode_rejects_foreign_signature() {
        let other = PacketQueue::new(Arc::new(TrackingSession::new(test_destination(1))), Arc::new(HmacSha256Signature::new(b"other").unwrap()));
        let buf = other.encode(&syn()).unwrap().freeze();

        let queue = queue(Arc::new(TrackingSession::new(test_destination(1))));
        assert!(queue.decode(&buf).is_err());
    }

    #[rstest]
    #[case::syn(PacketFlags::SYN)]
    #[case::close(PacketFlags::CLOSE)]
    #[case::reset(PacketFlags::RESET)]
    #[case::echo(PacketFlags::ECHO)]
    fn test_decode_requires_signature(#[case] flags: PacketFlags) {
        let queue = PacketQueue::new(Arc::new(TrackingSession::new(test_destination(1))), Arc::new(NoSignature));
        let packet = Packet {
            send_stream_id: 1,
            receive_stream_id: 2,
            flags,
            ..Default::default()
        };
        let buf = queue.encode(&packet).unwrap().freeze();
        assert!(queue.decode(&buf).is_err());

        let signed = Packet { flags: flags | PacketFlags::SIGNATURE_INCLUDED, ..packet };
        let buf = queue.encode(&signed).unwrap().freeze();
        assert!(queue.decode(&buf).is_ok());
    }

    #[tokio::test]
    async fn test_send() {
        let session = Arc::new(TrackingSession::new(test_destination(1)));
        let queue = queue(session.clone());

        queue.send(OutboundPacket { to: test_destination(2), packet: data() }).await;

        let sent = session.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, test_destination(2));
        assert_eq!(Packet::deser(&sent[0].1).unwrap(), data());
    }

    #[tokio::test]
    async fn test_session_errors_are_swallowed() {
        let mut session = MockSession::new();
        session.expect_send_packet()
            .times(2)
            .returning(|_, _| Err(anyhow::anyhow!("no tunnel")));

        let queue = Arc::new(queue(Arc::new(session)));
        let (send, recv) = mpsc::unbounded_channel();
        send.send(OutboundPacket { to: test_destination(2), packet: data() }).unwrap();
        send.send(OutboundPacket { to: test_destination(2), packet: syn() }).unwrap();
        drop(send);

        run_packet_queue(queue, recv).await;
    }
}
