//! Event pump: drains the wire library's event queue and dispatches into
//! session state. Runs as one dedicated task; cancellation is by queue
//! deactivation (channel close) or the shutdown signal.

use std::sync::Arc;

use tokio::select;
use tokio::sync::watch;
use tracing::info;

use crate::provider::Provider;
use crate::wire::EventReceiver;

pub struct EventPump {
    rx: EventReceiver,
    provider: Arc<Provider>,
}

impl EventPump {
    pub fn new(rx: EventReceiver, provider: Arc<Provider>) -> Self {
        Self { rx, provider }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event pump interrupted");
                        break;
                    }
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.provider.process_event(event),
                        None => {
                            info!("event queue deactivated");
                            break;
                        }
                    }
                }
            }
        }
    }
}
