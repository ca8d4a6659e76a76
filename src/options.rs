use crate::destination::Destination;
use crate::packet::Packet;
use anyhow::bail;
use rustc_hash::FxHashSet;
use std::time::Duration;

/// What a connection does after it was idle for `inactivity_timeout`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InactivityAction {
    Noop,
    /// send an ack-only packet to keep intermediate state alive and detect a dead peer
    SendKeepalive,
    Disconnect,
}

/// Per-connection settings. Each connection gets its own copy, initialized from the
///  [ManagerConfig] template or passed explicitly to `connect()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Upper bound for the payload of a single block. Writes are split into chunks of this
    ///  size.
    pub max_message_size: usize,

    /// Maximum number of blocks that may be outstanding (sent but not acked) at any time. This
    ///  also scales the receiver's protection against floods of out-of-order blocks.
    pub max_window_size: usize,
    /// The number of outstanding blocks allowed right after the handshake. The effective
    ///  window grows by one per acked block up to `max_window_size` and is halved on
    ///  retransmission.
    pub initial_window_size: usize,

    /// Byte budget for received but not yet read data
    pub inbound_buffer_size: usize,
    /// Blocks with an id below this are always accepted regardless of buffer pressure, so that
    ///  the handshake can not be starved
    pub min_ready_buffers: u64,
    /// The receiver rejects new out-of-order blocks once this many times `max_window_size`
    ///  blocks are waiting for a gap to be filled
    pub out_of_order_limit_factor: usize,

    pub connect_timeout: Duration,
    /// Grace period after a disconnect before the connection's resources are released, and
    ///  the time a locally closed connection waits for the peer's CLOSE
    pub disconnect_timeout: Duration,

    /// Upper bound for delaying the ack of a received block in the hope that it can be
    ///  piggybacked on outgoing data
    pub initial_ack_delay: Duration,
    pub max_resends: u32,
    pub initial_rtt: Duration,
    pub initial_rto: Duration,
    pub min_resend_delay: Duration,
    pub max_resend_delay: Duration,
    /// Number of NACKs after which a block that was sent only once is resent without waiting
    ///  for its retransmission timeout
    pub fast_retransmit_threshold: u32,

    pub inactivity_timeout: Duration,
    pub inactivity_action: InactivityAction,
    /// A partially filled block is sent after this delay even if the application neither
    ///  writes more data nor flushes
    pub passive_flush_delay: Duration,

    /// `None` blocks indefinitely
    pub write_timeout: Option<Duration>,
    /// `None` blocks indefinitely
    pub read_timeout: Option<Duration>,

    /// Number of protocol violations by the peer after which the connection is reset
    pub max_protocol_violations: u32,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let max_message_size = Self::DEFAULT_MAX_MESSAGE_SIZE;
        let max_window_size = 128;

        ConnectionOptions {
            max_message_size,
            max_window_size,
            initial_window_size: 6,
            inbound_buffer_size: max_message_size * (max_window_size + 2),
            min_ready_buffers: 16,
            out_of_order_limit_factor: 4,
            connect_timeout: Duration::from_secs(60),
            disconnect_timeout: Duration::from_secs(5 * 60),
            initial_ack_delay: Duration::from_millis(750),
            max_resends: 8,
            initial_rtt: Duration::from_secs(8),
            initial_rto: Duration::from_secs(9),
            min_resend_delay: Duration::from_millis(100),
            max_resend_delay: Duration::from_secs(45),
            fast_retransmit_threshold: 3,
            inactivity_timeout: Duration::from_secs(90),
            inactivity_action: InactivityAction::SendKeepalive,
            passive_flush_delay: Duration::from_millis(175),
            write_timeout: None,
            read_timeout: None,
            max_protocol_violations: 5,
        }
    }
}

impl ConnectionOptions {
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1730;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_message_size == 0 || self.max_message_size > Packet::MAX_PAYLOAD_SIZE {
            bail!("max message size must be between 1 and {}, was {}", Packet::MAX_PAYLOAD_SIZE, self.max_message_size);
        }
        if self.max_window_size == 0 {
            bail!("max window size must be positive");
        }
        if self.initial_window_size == 0 || self.initial_window_size > self.max_window_size {
            bail!("initial window size must be between 1 and max window size {}, was {}", self.max_window_size, self.initial_window_size);
        }
        if self.inbound_buffer_size < self.max_message_size {
            bail!("inbound buffer size {} can not hold a single block of {} bytes", self.inbound_buffer_size, self.max_message_size);
        }
        if self.out_of_order_limit_factor == 0 {
            bail!("out-of-order limit factor must be positive");
        }
        if self.connect_timeout > self.disconnect_timeout {
            bail!("connect timeout {:?} must not exceed disconnect timeout {:?}", self.connect_timeout, self.disconnect_timeout);
        }
        if self.min_resend_delay > self.max_resend_delay {
            bail!("min resend delay {:?} exceeds max resend delay {:?}", self.min_resend_delay, self.max_resend_delay);
        }
        if self.max_resends == 0 {
            bail!("max resends must be positive");
        }
        Ok(())
    }

    /// The maximum number of blocks that may wait for a gap before further out-of-order
    ///  blocks are rejected
    pub fn out_of_order_block_limit(&self) -> usize {
        self.out_of_order_limit_factor.saturating_mul(self.max_window_size)
    }
}

/// Decides which peers may open inbound connections (and get their pings answered)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AdmissionFilter {
    #[default]
    AcceptAll,
    DenyAll,
    AllowList(FxHashSet<Destination>),
    DenyList(FxHashSet<Destination>),
}

impl AdmissionFilter {
    pub fn admits(&self, peer: &Destination) -> bool {
        match self {
            AdmissionFilter::AcceptAll => true,
            AdmissionFilter::DenyAll => false,
            AdmissionFilter::AllowList(allowed) => allowed.contains(peer),
            AdmissionFilter::DenyList(denied) => !denied.contains(peer),
        }
    }
}

pub struct ManagerConfig {
    /// template for connections that do not get explicit options
    pub default_options: ConnectionOptions,
    pub admission_filter: AdmissionFilter,
    pub answer_pings: bool,
    /// `None` for no limit
    pub max_concurrent_streams: Option<usize>,
    /// interval at which the timer service runs the scheduler strategies of all connections
    pub timer_tick: Duration,
    pub max_ping_timeout: Duration,
    /// pong replies echo at most this many bytes of the ping's payload
    pub max_pong_payload: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            default_options: ConnectionOptions::default(),
            admission_filter: AdmissionFilter::AcceptAll,
            answer_pings: true,
            max_concurrent_streams: None,
            timer_tick: Duration::from_millis(100),
            max_ping_timeout: Duration::from_secs(5 * 60),
            max_pong_payload: 32,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.default_options.validate()?;

        if self.timer_tick.is_zero() {
            bail!("timer tick must be positive");
        }
        if self.max_concurrent_streams == Some(0) {
            bail!("max concurrent streams must be positive if it is set");
        }
        Ok(())
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        ConnectionOptions::default().validate().unwrap();
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_default_dos_limit() {
        assert_eq!(ConnectionOptions::default().out_of_order_block_limit(), 4 * 128);
    }

    #[rstest]
    #[case::zero_message_size(ConnectionOptions { max_message_size: 0, ..Default::default() })]
    #[case::huge_message_size(ConnectionOptions { max_message_size: Packet::MAX_PAYLOAD_SIZE + 1, ..Default::default() })]
    #[case::zero_window(ConnectionOptions { max_window_size: 0, ..Default::default() })]
    #[case::initial_window_too_big(ConnectionOptions { max_window_size: 4, initial_window_size: 5, ..Default::default() })]
    #[case::small_inbound_buffer(ConnectionOptions { inbound_buffer_size: 100, ..Default::default() })]
    #[case::no_out_of_order(ConnectionOptions { out_of_order_limit_factor: 0, ..Default::default() })]
    #[case::connect_after_disconnect(ConnectionOptions { connect_timeout: Duration::from_secs(10), disconnect_timeout: Duration::from_secs(5), ..Default::default() })]
    #[case::resend_delays_swapped(ConnectionOptions { min_resend_delay: Duration::from_secs(2), max_resend_delay: Duration::from_secs(1), ..Default::default() })]
    #[case::no_resends(ConnectionOptions { max_resends: 0, ..Default::default() })]
    fn test_validate_rejects(#[case] options: ConnectionOptions) {
        assert!(options.validate().is_err());
    }

    #[rstest]
    #[case::zero_tick(ManagerConfig { timer_tick: Duration::ZERO, ..Default::default() })]
    #[case::zero_streams(ManagerConfig { max_concurrent_streams: Some(0), ..Default::default() })]
    #[case::invalid_template(ManagerConfig { default_options: ConnectionOptions { max_window_size: 0, ..Default::default() }, ..Default::default() })]
    fn test_manager_config_rejects(#[case] config: ManagerConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::accept_all(AdmissionFilter::AcceptAll, true)]
    #[case::deny_all(AdmissionFilter::DenyAll, false)]
    #[case::allow_listed(AdmissionFilter::AllowList([Destination::new(vec![1])].into_iter().collect()), true)]
    #[case::not_allow_listed(AdmissionFilter::AllowList([Destination::new(vec![2])].into_iter().collect()), false)]
    #[case::deny_listed(AdmissionFilter::DenyList([Destination::new(vec![1])].into_iter().collect()), false)]
    #[case::not_deny_listed(AdmissionFilter::DenyList([Destination::new(vec![2])].into_iter().collect()), true)]
    fn test_admission_filter(#[case] filter: AdmissionFilter, #[case] expected: bool) {
        assert_eq!(filter.admits(&Destination::new(vec![1])), expected);
    }

    #[rstest]
    #[case(Duration::ZERO, 0)]
    #[case(Duration::from_millis(1500), 1500)]
    #[case(Duration::MAX, u64::MAX)]
    fn test_millis(#[case] duration: Duration, #[case] expected: u64) {
        assert_eq!(millis(duration), expected);
    }
}
