//! Periodic driver
//!
//! Background task that ticks keepalive, retry and expiry work across every
//! registered session and fans the resulting session events out to
//! subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::registry::{ClientEvent, SessionRegistry};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub tick_interval: Duration,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            event_capacity: 1024,
        }
    }
}

pub struct Driver {
    config: DriverConfig,
    registry: Arc<SessionRegistry>,
    /// Shutdown signal
    shutdown: broadcast::Sender<()>,
    /// Event channel
    events: broadcast::Sender<ClientEvent>,
}

impl Driver {
    pub fn new(registry: Arc<SessionRegistry>, config: DriverConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            registry,
            shutdown,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Subscribe to session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Tick every session once and publish the events it produced
    pub fn run_once(&self) -> usize {
        run_once(&self.registry, &self.events)
    }

    /// Spawn the tick loop on the current runtime
    pub fn spawn(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let events = self.events.clone();
        let interval = self.config.tick_interval;
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            info!("Session driver started (tick {:?})", interval);
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        run_once(&registry, &events);
                    }
                }
            }
            // Events raised by the last disconnects still reach subscribers
            run_once(&registry, &events);
            info!("Session driver stopped");
        })
    }

    /// Stop the tick loop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

fn run_once(registry: &SessionRegistry, events: &broadcast::Sender<ClientEvent>) -> usize {
    let failures = registry.tick_all(std::time::Instant::now());
    if failures > 0 {
        debug!("{} sessions failed their tick", failures);
    }

    let drained = registry.drain_events();
    let count = drained.len();
    for event in drained {
        // No subscribers is not an error
        let _ = events.send(event);
    }
    if count > 0 {
        trace!("Published {} session events", count);
    }
    count
}
