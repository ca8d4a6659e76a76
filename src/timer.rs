use crate::clock::Clock;
use crate::connection::Connection;
use crate::scheduler::SchedulerChooser;
use crate::stream_map::StreamMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, info};

/// The shared timer: runs the scheduler strategy of every connection once per tick, and
///  removes connections whose resources were released
pub struct TimerService {
    connections: Arc<StreamMap<u32, Arc<Connection>>>,
    clock: Arc<dyn Clock>,
}

impl TimerService {
    pub fn new(connections: Arc<StreamMap<u32, Arc<Connection>>>, clock: Arc<dyn Clock>) -> TimerService {
        TimerService { connections, clock }
    }

    /// Returns the number of connections that were finalized and removed
    pub fn run_once(&self) -> usize {
        let now = self.clock.now_millis();

        let mut finalized = Vec::new();
        for (&stream_id, connection) in self.connections.load().iter() {
            SchedulerChooser::run(connection.as_ref(), now);
            if connection.is_finalized() {
                finalized.push(stream_id);
            }
        }

        if !finalized.is_empty() {
            debug!("removing finalized streams {:?}", finalized);
            self.connections.update(|m| {
                for stream_id in &finalized {
                    m.remove(stream_id);
                }
            });
        }
        finalized.len()
    }
}

pub async fn run_timer(timer: Arc<TimerService>, tick: Duration, mut shutdown: watch::Receiver<bool>) {
    info!("starting timer service with a tick of {:?}", tick);

    let mut ticks = time::interval(tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = ticks.tick() => {
                timer.run_once();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("stopping timer service");
                    return;
                }
            }
        }
    }
}
