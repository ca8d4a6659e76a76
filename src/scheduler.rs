use crate::connection::ConnectionState;
use crate::options::{millis, ConnectionOptions, InactivityAction};
#[cfg(test)] use mockall::automock;
use tracing::{debug, trace};

/// The view of a connection that scheduler strategies work with. Queries are cheap and
///  non-blocking, and so are the actions: they enqueue packets or change state, and never wait.
///
/// All times are in milliseconds of the connection's clock.
#[cfg_attr(test, automock)]
pub trait ScheduledConnection {
    fn state(&self) -> ConnectionState;
    /// the peer's stream id, 0 if the handshake never got far enough to learn it
    fn send_stream_id(&self) -> u32;
    fn options(&self) -> &ConnectionOptions;
    /// time since the connection was created
    fn lifetime(&self, now: u64) -> u64;
    fn disconnect_scheduled_on(&self) -> Option<u64>;
    fn close_sent_on(&self) -> Option<u64>;
    /// the latest time a packet was sent or received
    fn last_activity_on(&self) -> u64;
    fn outstanding_count(&self) -> usize;

    fn retransmit_due(&self, now: u64) -> bool;
    fn ack_due(&self, now: u64) -> bool;
    fn passive_flush_due(&self, now: u64) -> bool;
    /// `true` if a local close is pending and all data was acknowledged
    fn close_ready(&self) -> bool;

    fn retransmit(&self, now: u64);
    fn send_ack(&self, now: u64);
    fn passive_flush(&self);
    fn send_close(&self, now: u64);
    fn send_keepalive(&self, now: u64);
    fn fail_connect(&self, now: u64);
    fn disconnect(&self, clean: bool, now: u64);
    fn disconnect_complete(&self);
}

/// The timeout policy of a connection, one strategy per lifecycle state.
///
/// [TaskScheduler::accept] checks whether some timeout driven action is due, and
///  [TaskScheduler::event_occurred] performs it. Strategies are stateless, everything they
///  decide on is read from the connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskScheduler {
    Connecting,
    Open,
    LocalClosePending,
    LocalClosed,
    RemoteCloseReceived,
    Reset,
    Dead,
}

impl TaskScheduler {
    pub fn accept(&self, con: &impl ScheduledConnection, now: u64) -> bool {
        match self {
            TaskScheduler::Connecting => {
                Self::connect_timed_out(con, now)
                    || con.retransmit_due(now)
                    || con.ack_due(now)
            }
            TaskScheduler::Open => {
                Self::transfer_due(con, now)
                    || Self::inactivity_due(con, now)
            }
            TaskScheduler::RemoteCloseReceived => Self::transfer_due(con, now),
            TaskScheduler::LocalClosePending => {
                Self::transfer_due(con, now)
                    || con.close_ready()
            }
            TaskScheduler::LocalClosed => {
                con.retransmit_due(now)
                    || con.ack_due(now)
                    || Self::close_timed_out(con, now)
            }
            TaskScheduler::Reset => true,
            TaskScheduler::Dead => Self::dead_accept(con, now),
        }
    }

    pub fn event_occurred(&self, con: &impl ScheduledConnection, now: u64) {
        match self {
            TaskScheduler::Connecting => {
                if Self::connect_timed_out(con, now) {
                    con.fail_connect(now);
                    return;
                }
                Self::do_retransmit_and_ack(con, now);
            }
            TaskScheduler::Open => {
                Self::do_transfer(con, now);
                if Self::inactivity_due(con, now) {
                    match con.options().inactivity_action {
                        InactivityAction::Noop => {}
                        InactivityAction::SendKeepalive => con.send_keepalive(now),
                        InactivityAction::Disconnect => {
                            debug!("disconnecting idle connection");
                            con.disconnect(true, now);
                        }
                    }
                }
            }
            TaskScheduler::RemoteCloseReceived => Self::do_transfer(con, now),
            TaskScheduler::LocalClosePending => {
                Self::do_transfer(con, now);
                if con.close_ready() {
                    con.send_close(now);
                }
            }
            TaskScheduler::LocalClosed => {
                if Self::close_timed_out(con, now) {
                    debug!("peer did not close within the disconnect timeout");
                    con.disconnect(false, now);
                    return;
                }
                Self::do_retransmit_and_ack(con, now);
            }
            TaskScheduler::Reset => con.disconnect_complete(),
            TaskScheduler::Dead => con.disconnect_complete(),
        }
    }

    fn connect_timed_out(con: &impl ScheduledConnection, now: u64) -> bool {
        con.lifetime(now) >= millis(con.options().connect_timeout)
    }

    fn close_timed_out(con: &impl ScheduledConnection, now: u64) -> bool {
        con.close_sent_on()
            .is_some_and(|sent_on| now.saturating_sub(sent_on) >= millis(con.options().disconnect_timeout))
    }

    fn transfer_due(con: &impl ScheduledConnection, now: u64) -> bool {
        con.retransmit_due(now)
            || con.ack_due(now)
            || con.passive_flush_due(now)
    }

    fn inactivity_due(con: &impl ScheduledConnection, now: u64) -> bool {
        let options = con.options();
        options.inactivity_action != InactivityAction::Noop
            && con.outstanding_count() == 0
            && now.saturating_sub(con.last_activity_on()) >= millis(options.inactivity_timeout)
    }

    fn do_retransmit_and_ack(con: &impl ScheduledConnection, now: u64) {
        if con.retransmit_due(now) {
            con.retransmit(now);
        }
        if con.ack_due(now) {
            con.send_ack(now);
        }
    }

    fn do_transfer(con: &impl ScheduledConnection, now: u64) {
        Self::do_retransmit_and_ack(con, now);
        if con.passive_flush_due(now) {
            con.passive_flush();
        }
    }

    /// A dead connection is finalized once its grace period is over. Connections that never
    ///  completed the handshake have nothing to wait for and only keep the part of the grace
    ///  period that exceeds the connect timeout.
    fn dead_accept(con: &impl ScheduledConnection, now: u64) -> bool {
        let Some(scheduled_on) = con.disconnect_scheduled_on() else {
            return false;
        };

        let options = con.options();
        let disconnect_timeout = millis(options.disconnect_timeout);
        let since_disconnect = now.saturating_sub(scheduled_on);

        if con.send_stream_id() == 0 && since_disconnect > disconnect_timeout.saturating_sub(millis(options.connect_timeout)) {
            return true;
        }
        since_disconnect >= disconnect_timeout
            || con.lifetime(now) >= disconnect_timeout
    }
}

/// Maps a connection's state to the strategy that governs it
pub struct SchedulerChooser;

impl SchedulerChooser {
    pub fn select(state: ConnectionState) -> TaskScheduler {
        match state {
            ConnectionState::Connecting => TaskScheduler::Connecting,
            ConnectionState::Open => TaskScheduler::Open,
            ConnectionState::LocalClosePending => TaskScheduler::LocalClosePending,
            ConnectionState::LocalClosed => TaskScheduler::LocalClosed,
            ConnectionState::RemoteCloseReceived => TaskScheduler::RemoteCloseReceived,
            ConnectionState::Reset => TaskScheduler::Reset,
            ConnectionState::Dead => TaskScheduler::Dead,
        }
    }

    /// Runs the active strategy once. Returns `true` if an action was performed.
    pub fn run(con: &impl ScheduledConnection, now: u64) -> bool {
        let scheduler = Self::select(con.state());
        if scheduler.accept(con, now) {
            trace!("{:?} scheduler: event due", scheduler);
            scheduler.event_occurred(con, now);
            true
        }
        else {
            false
        }
    }
}
