use crate::connection::{Connection, ConnectionState};
use crate::error::StreamError;
use crate::packet::{Packet, PacketFlags};
use tracing::{debug, trace, warn};

/// Applies inbound packets to the connection they belong to: ack processing on the send side,
///  block reassembly on the receive side, and the state transitions that packets trigger.
///
/// Signatures are checked before a packet gets here.
pub struct ConnectionPacketHandler;

impl ConnectionPacketHandler {
    /// Returns an error if the packet was dropped. Protocol violations are counted against the
    ///  connection. A block that does not fit into the receive buffer is dropped, and the peer
    ///  is choked right away until the application reads; data arriving after the application
    ///  closed its end resets the connection.
    pub fn receive_packet(connection: &Connection, packet: Packet) -> Result<(), StreamError> {
        let now = connection.now();
        trace!("stream {}: received {}", connection.receive_stream_id(), packet);

        if let Err(e) = Self::verify(connection, &packet) {
            connection.protocol_violation(&e, now);
            return Err(e);
        }

        if packet.is_flag_set(PacketFlags::RESET) {
            connection.reset_received(now);
            return Ok(());
        }

        connection.packet_received(now);

        if let Some(peer_max) = packet.options.max_packet_size {
            connection.limit_message_size(peer_max as usize);
        }

        if let Some(ack_through) = packet.ack_through {
            let outcome = connection.send_buffer().acknowledge(ack_through, &packet.nacks, now, connection.options().fast_retransmit_threshold);
            connection.blocks_acked(outcome, now);
        }

        // a choking peer requests the delay on every packet it sends
        if packet.ack_through.is_some() || packet.options.delay_requested_millis.is_some() {
            let choked = packet.options.delay_requested_millis.is_some_and(|delay| delay >= Packet::MIN_DELAY_CHOKE);
            connection.set_choked(choked);
        }

        if !packet.carries_block() {
            return Ok(());
        }

        match connection.state() {
            ConnectionState::Reset => {
                trace!("stream {}: ignoring block {} after reset", connection.receive_stream_id(), packet.block_id);
                return Ok(());
            }
            ConnectionState::Dead => {
                // the peer may not have seen our ack before we disconnected
                if packet.payload.is_empty() {
                    connection.receive_buffer().message_received(packet.block_id, packet.payload);
                }
                connection.send_ack_packet(now, false);
                return Ok(());
            }
            _ => {}
        }

        let block_id = packet.block_id;
        if connection.receive_buffer().is_duplicate(block_id) {
            // our ack got lost, so there is no point in waiting
            trace!("stream {}: duplicate block {}", connection.receive_stream_id(), block_id);
            connection.schedule_ack(now, true);
            return Ok(());
        }

        if !connection.receive_buffer().can_accept(block_id, packet.payload.len()) {
            if connection.receive_buffer().is_locally_closed() {
                warn!("stream {}: received block {} after local close", connection.receive_stream_id(), block_id);
                connection.disconnect(false, now);
                return Err(StreamError::Closed);
            }
            debug!("stream {}: dropping block {} with {} bytes", connection.receive_stream_id(), block_id, packet.payload.len());
            // out-of-order limits alone do not choke, the gap is filled by a resend
            if !connection.receive_buffer().has_room_to_unchoke() {
                connection.start_choking(now);
            }
            return Err(StreamError::CapacityExceeded);
        }

        let is_close = packet.is_flag_set(PacketFlags::CLOSE);
        let is_syn = packet.is_flag_set(PacketFlags::SYN);
        let is_new = connection.receive_buffer().message_received(block_id, packet.payload);
        if is_close {
            connection.receive_buffer().close_received(block_id);
            connection.close_received(now);
        }

        if connection.state() == ConnectionState::Dead {
            // the peer's CLOSE completed the close handshake, and nobody schedules acks any more
            connection.send_ack_packet(now, false);
            return Ok(());
        }

        connection.schedule_ack(now, !is_new || is_close || is_syn);
        Ok(())
    }

    fn verify(connection: &Connection, packet: &Packet) -> Result<(), StreamError> {
        if packet.receive_stream_id == 0 {
            return Err(StreamError::ProtocolViolation("packet without sender stream id".to_string()));
        }
        if !connection.set_send_stream_id(packet.receive_stream_id) {
            return Err(StreamError::ProtocolViolation(format!("sender stream id changed to {}", packet.receive_stream_id)));
        }
        if let Some(ack_through) = packet.ack_through {
            if ack_through >= connection.send_buffer().next_block_id() {
                return Err(StreamError::ProtocolViolation(format!("ack for block {} that was never sent", ack_through)));
            }
        }
        if packet.payload.len() > connection.options().max_message_size {
            return Err(StreamError::ProtocolViolation(format!("block of {} bytes exceeds the maximum message size", packet.payload.len())));
        }
        Ok(())
    }
}
