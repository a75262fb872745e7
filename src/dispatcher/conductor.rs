//! Dispatcher conductor task.
//!
//! Runs dispatcher commands one at a time and keeps the publisher limit
//! moving: after every command, subscriber progress signal or tick it cleans
//! fully consumed partitions and proposes a new limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::subscription::SubscriptionState;
use super::{Result, Shared};

pub(crate) enum ConductorCommand {
    CloseSubscription {
        state: Arc<SubscriptionState>,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub(crate) fn spawn(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<ConductorCommand>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ConductorCommand::CloseSubscription { state, reply }) => {
                        let result = shared.do_close_subscription(&state);
                        let _ = reply.send(result);
                    }
                    Some(ConductorCommand::Shutdown) | None => break,
                },
                _ = shared.conductor_signal.notified() => {}
                _ = ticker.tick() => {}
            }

            shared.update_publisher_limit();
        }

        debug!(dispatcher = %shared.name, "Dispatcher conductor stopped");
    })
}
