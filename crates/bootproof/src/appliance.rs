//! Wiring of stores, adapters and services from [`Settings`].

use std::sync::Arc;
use std::time::Duration;

use crate::assets::{AssetRepository, FileAssetRepository};
use crate::broker::{self, ConnectionBroker};
use crate::cancel::CancelFlags;
use crate::clock::{Clock, SystemClock};
use crate::config::{DriverKind, Settings};
use crate::driver::{HookDriver, HypervisorDriver, SimulatedDriver};
use crate::error::Result;
use crate::features::FeatureFlags;
use crate::notify::{self, EvidenceUploader, Notifier};
use crate::queue::{QueueLimits, VerificationQueue};
use crate::runner::{InProgressRepository, VerificationRunner};
use crate::scheduler::{Calendar, VerificationScheduler};
use crate::status::StatusBoard;
use crate::store::{FileStore, KeyValueStore};
use crate::transaction::{TracingSink, TransactionSink};
use crate::verification::{PipelineOptions, PipelineServices, VerificationPipeline};

#[derive(Clone)]
pub struct Appliance {
    pub settings: Settings,
    pub device: Arc<dyn KeyValueStore>,
    pub ephemeral: Arc<dyn KeyValueStore>,
    pub locks: Arc<dyn KeyValueStore>,
    pub assets: Arc<dyn AssetRepository>,
    pub driver: Arc<dyn HypervisorDriver>,
    pub broker: Arc<dyn ConnectionBroker>,
    pub notifier: Arc<dyn Notifier>,
    pub uploader: Arc<dyn EvidenceUploader>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn TransactionSink>,
}

impl Appliance {
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let paths = &settings.paths;
        let driver: Arc<dyn HypervisorDriver> = match settings.driver.kind {
            DriverKind::Hook => Arc::new(HookDriver::new(
                settings.driver.hooks.clone(),
                Duration::from_secs(settings.driver.hook_timeout_secs),
            )),
            DriverKind::Simulated => Arc::new(SimulatedDriver::default()),
        };
        let broker = broker::from_config(&settings.hypervisor, &settings.broker)?;
        let (notifier, uploader) = notify::from_config(&settings.notify)?;
        tracing::debug!(
            device = %paths.device_dir.display(),
            ephemeral = %paths.ephemeral_dir.display(),
            driver = ?settings.driver.kind,
            offload = settings.hypervisor.offload,
            "appliance configured"
        );
        Ok(Self {
            device: Arc::new(FileStore::new(&paths.device_dir)),
            ephemeral: Arc::new(FileStore::new(&paths.ephemeral_dir)),
            locks: Arc::new(FileStore::new(&paths.locks_dir)),
            assets: Arc::new(FileAssetRepository::new(&paths.assets_dir)),
            driver,
            broker,
            notifier,
            uploader,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            settings,
        })
    }

    pub fn queue(&self) -> VerificationQueue {
        VerificationQueue::new(
            self.device.clone(),
            self.ephemeral.clone(),
            self.clock.clone(),
            QueueLimits::from(&self.settings.queue),
        )
    }

    pub fn features(&self) -> FeatureFlags {
        FeatureFlags::new(self.device.clone())
    }

    pub fn cancel_flags(&self) -> CancelFlags {
        CancelFlags::new(self.ephemeral.clone())
    }

    pub fn status(&self) -> StatusBoard {
        StatusBoard::new(self.device.clone())
    }

    pub fn in_progress(&self) -> InProgressRepository {
        InProgressRepository::new(self.ephemeral.clone(), self.settings.queue.lock_timeout())
    }

    pub fn calendar(&self) -> Calendar {
        let cfg = &self.settings.scheduler;
        Calendar::new(cfg.utc_offset_minutes, cfg.backup_offset_minutes)
    }

    pub fn scheduler(&self) -> VerificationScheduler {
        VerificationScheduler::new(
            self.assets.clone(),
            self.queue(),
            self.features(),
            self.clock.clone(),
            self.calendar(),
        )
    }

    pub fn pipeline(&self) -> Result<VerificationPipeline> {
        let services = PipelineServices {
            driver: self.driver.clone(),
            assets: self.assets.clone(),
            queue: self.queue(),
            features: self.features(),
            cancel: self.cancel_flags(),
            status: self.status(),
            locks: self.locks.clone(),
            notifier: self.notifier.clone(),
            uploader: self.uploader.clone(),
            clock: self.clock.clone(),
            sink: self.sink.clone(),
        };
        let options = PipelineOptions {
            runner: self.settings.runner.clone(),
            screenshots_dir: self.settings.paths.screenshots_dir.clone(),
            notify_success: self.settings.notify.notify_success,
            asset_lock_timeout: self.settings.queue.lock_timeout(),
        };
        VerificationPipeline::new(services, options)
    }

    pub fn runner(&self) -> Result<VerificationRunner> {
        Ok(VerificationRunner::new(
            self.pipeline()?,
            self.in_progress(),
            self.broker.clone(),
            self.settings.hypervisor.connection.clone(),
            self.settings.runner.clone(),
        ))
    }
}
