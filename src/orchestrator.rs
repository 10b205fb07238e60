//! Periodic push cycle
//!
//! One cycle: sync config → connect → wake → backlight → (skip if unchanged)
//! → upload → refresh → report. Any failing step closes the session, reports
//! `connected = false` and waits for the next tick. Cycles are awaited inline
//! in the timer loop, so two never overlap; ticks missed by a slow cycle are
//! skipped rather than queued.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::change::{self, Fingerprint};
use crate::config::{DeviceEndpoint, PushSettings};
use crate::coordinator::{ConfigSync, StatusReporter};
use crate::device::DeviceController;
use crate::error::PushError;
use crate::raster;
use crate::session::{RemoteSession, Transport};

/// Where the orchestrator is within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    Idle,
    Connecting,
    Waking,
    SyncingBacklight,
    Transferring,
    Refreshing,
    Reporting,
    ErrorRecovery,
}

/// Result of a cycle, forwarded to the coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub success: bool,
    pub message: String,
}

impl PushOutcome {
    fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Drives the push cycle for the lifetime of the process
pub struct PushOrchestrator {
    transport: Arc<dyn Transport>,
    config_sync: Arc<dyn ConfigSync>,
    reporter: Arc<dyn StatusReporter>,
    device: DeviceController,
    endpoint: DeviceEndpoint,
    settings: PushSettings,
    state: PushState,
    /// Fingerprint of the image currently on the screen
    last_pushed: Option<Fingerprint>,
    last_full_refresh: Option<Instant>,
}

impl PushOrchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        config_sync: Arc<dyn ConfigSync>,
        reporter: Arc<dyn StatusReporter>,
        endpoint: DeviceEndpoint,
        settings: PushSettings,
    ) -> Self {
        Self {
            transport,
            config_sync,
            reporter,
            device: DeviceController::new(),
            endpoint,
            settings,
            state: PushState::Idle,
            last_pushed: None,
            last_full_refresh: None,
        }
    }

    /// Self-test, then push on every tick until `shutdown` resolves
    ///
    /// The first tick fires immediately. A cycle in flight when `shutdown`
    /// resolves runs to completion first.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.self_test().await;

        let mut period = self.settings.push_interval;
        let mut ticker = ticker(time::interval(period));
        tracing::info!("Pushing every {}ms", period.as_millis());

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutting down push loop");
                    break;
                }
                _ = ticker.tick() => {}
            }

            self.run_cycle().await;

            if self.settings.push_interval != period {
                period = self.settings.push_interval;
                ticker = ticker_at(Instant::now() + period, period);
                tracing::info!("Push interval changed to {}ms", period.as_millis());
            }
        }
    }

    /// Check the device is reachable before entering the loop
    ///
    /// Failure is reported but never stops the loop from starting.
    pub async fn self_test(&mut self) -> PushOutcome {
        self.sync_device_config().await;
        self.transition(PushState::Connecting);

        let remote_dir = self.settings.remote_dir().to_string();
        let connected = self.transport.connect(&self.endpoint).await;
        let result = match connected {
            Ok(mut session) => {
                let listed = self
                    .device
                    .list_directory(session.as_mut(), &remote_dir)
                    .await;
                session.close().await;
                listed
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(listing) => {
                tracing::info!(
                    "Self-test passed: {} reachable, {} entries in {}",
                    self.endpoint.address,
                    listing.stdout.lines().count(),
                    remote_dir
                );
                PushOutcome::success(format!("Connected to {}", self.endpoint.address))
            }
            Err(e) => {
                self.transition(PushState::ErrorRecovery);
                tracing::error!("Self-test failed: {}", e);
                PushOutcome::failure(format!("Self-test failed: {}", e))
            }
        };

        self.report(&outcome).await;
        outcome
    }

    /// Run one push cycle
    ///
    /// Returns `None` when the cycle was skipped because there is no usable
    /// local image; nothing is reported in that case.
    pub async fn run_cycle(&mut self) -> Option<PushOutcome> {
        self.sync_device_config().await;

        let image_path = self.settings.local_image_path.clone();
        let Some(fingerprint) = change::fingerprint(&image_path).await else {
            tracing::debug!("No image at {}, skipping cycle", image_path.display());
            return None;
        };

        match raster::validate(&image_path).await {
            Ok((width, height)) => {
                tracing::debug!("Local image is {}x{}", width, height);
            }
            Err(e) => {
                tracing::warn!("Skipping {}: {}", image_path.display(), e);
                return None;
            }
        }

        self.transition(PushState::Connecting);
        let connected = self.transport.connect(&self.endpoint).await;
        let result = match connected {
            Ok(mut session) => {
                tracing::debug!("Cycle running on session {}", session.id());
                let result = self.push(session.as_mut(), fingerprint).await;
                session.close().await;
                result
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(outcome) => {
                tracing::info!("{}", outcome.message);
                outcome
            }
            Err(e) => {
                self.transition(PushState::ErrorRecovery);
                tracing::error!("Push failed: {}", e);
                PushOutcome::failure(e.to_string())
            }
        };

        self.report(&outcome).await;
        Some(outcome)
    }

    /// Device steps of a cycle, run on an open session
    async fn push(
        &mut self,
        session: &mut dyn RemoteSession,
        fingerprint: Fingerprint,
    ) -> Result<PushOutcome, PushError> {
        self.transition(PushState::Waking);
        if let Err(e) = self.device.wake(session).await {
            tracing::warn!("Wake failed, continuing: {}", e);
        }

        self.transition(PushState::SyncingBacklight);
        let backlight = self.config_sync.fetch_backlight_config().await;
        match self
            .device
            .set_backlight(session, backlight.effective_level() as i64)
            .await
        {
            Ok(level) => tracing::debug!("Backlight set to {}", level),
            Err(e) => tracing::warn!("Backlight sync failed, continuing: {}", e),
        }

        let full_refresh = self.full_refresh_due();
        if !full_refresh && change::unchanged(self.last_pushed.as_ref(), &fingerprint) {
            return Ok(PushOutcome::success("Image unchanged, display not refreshed"));
        }

        self.transition(PushState::Transferring);
        let bytes = session
            .upload(&self.settings.local_image_path, &self.settings.remote_path)
            .await?;

        self.transition(PushState::Refreshing);
        if full_refresh {
            self.device.clear_display(session).await?;
        }
        self.device
            .refresh_display(session, &self.settings.remote_path)
            .await?;

        self.last_pushed = Some(fingerprint);
        if full_refresh {
            self.last_full_refresh = Some(Instant::now());
        }

        Ok(PushOutcome::success(format!(
            "Pushed {} bytes to {}:{}{}",
            bytes,
            self.endpoint.address,
            self.settings.remote_path,
            if full_refresh { " (full refresh)" } else { "" }
        )))
    }

    fn full_refresh_due(&self) -> bool {
        match self.last_full_refresh {
            Some(at) => at.elapsed() >= self.settings.full_refresh_interval,
            None => true,
        }
    }

    /// Apply coordinator overrides; a failed fetch leaves everything as is
    async fn sync_device_config(&mut self) {
        let update = self.config_sync.fetch_device_config().await;

        if let Some(address) = update.address {
            if address != self.endpoint.address {
                tracing::info!(
                    "Device address changed: {} -> {}",
                    self.endpoint.address,
                    address
                );
                self.endpoint.address = address;
            }
        }

        if let Some(interval) = update.push_interval {
            self.settings.push_interval = interval;
        }
    }

    async fn report(&mut self, outcome: &PushOutcome) {
        if self.state != PushState::ErrorRecovery {
            self.transition(PushState::Reporting);
        }
        self.reporter.report(outcome.success, &outcome.message).await;
        self.transition(PushState::Idle);
    }

    fn transition(&mut self, next: PushState) {
        tracing::debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

fn ticker(mut interval: Interval) -> Interval {
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

fn ticker_at(start: Instant, period: Duration) -> Interval {
    ticker(time::interval_at(start, period))
}
