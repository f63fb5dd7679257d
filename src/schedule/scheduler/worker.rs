use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{error, info};

/// A periodic entry point driven by a [`TickWorker`].
#[async_trait]
pub trait Tick: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run once. `Ok(true)` means work was done and the next tick should follow immediately.
    async fn tick(&self) -> Result<bool>;
}

pub struct TickWorker {
    tick: Arc<dyn Tick>,
    // pause between idle ticks. e.g. 60 seconds for the scheduler
    interval: Duration,
    // pause after a failed tick
    error_backoff: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TickWorker {
    pub fn new(tick: Arc<dyn Tick>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            tick,
            interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    /// Loop until the shutdown channel flips to true or its sender goes away.
    pub async fn run(mut self) {
        info!("Starting {} worker every {:?}", self.tick.name(), self.interval);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let pause = match self.tick.tick().await {
                Ok(true) => continue,
                Ok(false) => self.interval,
                Err(e) => {
                    error!("{} tick failed: {:#}", self.tick.name(), e);
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = sleep(pause) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("{} worker stopped", self.tick.name());
    }
}
