//! Wall-clock ceremony lifecycle.
//!
//! Periodic sweeps transitioning SCHEDULED → OPENED once the start date
//! passes and OPENED → CLOSED once the end date passes. Runs beside the
//! TimeoutSweeper with the same shutdown discipline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::CoordinatorError;
use crate::store::{CeremonyStore, WriteBatch, WriteOp};
use crate::types::CeremonyState;

pub struct CeremonyCron {
    store: Arc<dyn CeremonyStore>,
    clock: Arc<dyn Clock>,
}

impl CeremonyCron {
    pub fn new(store: Arc<dyn CeremonyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// SCHEDULED → OPENED where the start date has passed. Returns the
    /// number of ceremonies opened.
    pub async fn open_due(&self) -> Result<usize, CoordinatorError> {
        let now = self.clock.now_ms();
        let mut opened = 0;
        for mut ceremony in self
            .store
            .ceremonies_in_state(CeremonyState::Scheduled)
            .await?
        {
            if ceremony.start_date > now {
                continue;
            }
            let guard = ceremony.last_updated;
            ceremony.state = CeremonyState::Opened;
            let id = ceremony.id.clone();
            match self
                .store
                .commit(WriteBatch::new().with(WriteOp::UpdateCeremony {
                    ceremony,
                    expected_last_updated: Some(guard),
                }))
                .await
            {
                Ok(()) => {
                    info!(ceremony_id = %id, "ceremony opened");
                    opened += 1;
                }
                Err(e) => warn!(ceremony_id = %id, error = %e, "failed to open ceremony"),
            }
        }
        Ok(opened)
    }

    /// OPENED → CLOSED where the end date has passed. Returns the number of
    /// ceremonies closed.
    pub async fn close_due(&self) -> Result<usize, CoordinatorError> {
        let now = self.clock.now_ms();
        let mut closed = 0;
        for mut ceremony in self.store.ceremonies_in_state(CeremonyState::Opened).await? {
            if ceremony.end_date > now {
                continue;
            }
            let guard = ceremony.last_updated;
            ceremony.state = CeremonyState::Closed;
            let id = ceremony.id.clone();
            match self
                .store
                .commit(WriteBatch::new().with(WriteOp::UpdateCeremony {
                    ceremony,
                    expected_last_updated: Some(guard),
                }))
                .await
            {
                Ok(()) => {
                    info!(ceremony_id = %id, "ceremony closed");
                    closed += 1;
                }
                Err(e) => warn!(ceremony_id = %id, error = %e, "failed to close ceremony"),
            }
        }
        Ok(closed)
    }

    /// Run both sweeps on a fixed cadence until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, interval: Duration) {
        info!("ceremony cron started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.clock.sleep(interval) => {
                    if let Err(e) = self.open_due().await {
                        warn!(error = %e, "open sweep failed");
                    }
                    if let Err(e) = self.close_due().await {
                        warn!(error = %e, "close sweep failed");
                    }
                }
            }
        }
        info!("ceremony cron shut down");
    }
}
