//! Per-asset policy engine deciding which recovery points are due for
//! verification and feeding them to the queue.

mod calendar;

use std::fmt;
use std::sync::Arc;

use crate::assets::{Asset, AssetRepository, OffsiteState, Origin};
use crate::clock::Clock;
use crate::error::Result;
use crate::features::FeatureFlags;
use crate::model::ScheduleOption;
use crate::queue::{VerificationAsset, VerificationQueue};

pub use calendar::{Calendar, WeekHour};

/// Points older than this are never scheduled.
pub const MAX_POINT_AGE_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    Replicated,
    Removing,
    Archived,
    FeatureDisabled,
    Unsupported(&'static str),
    ScheduleNever,
}

impl fmt::Display for Ineligible {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replicated => f.write_str("replicated asset"),
            Self::Removing => f.write_str("asset is being removed"),
            Self::Archived => f.write_str("asset is archived"),
            Self::FeatureDisabled => f.write_str("verification is disabled"),
            Self::Unsupported(why) => write!(f, "unsupported: {why}"),
            Self::ScheduleNever => f.write_str("verification schedule is 'never'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    Skipped(Ineligible),
    Considered {
        queued: Vec<i64>,
        /// Due but refused by the queue (retry budget spent).
        rejected: Vec<i64>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub assets: usize,
    pub queued: usize,
    pub rejected: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct VerificationScheduler {
    assets: Arc<dyn AssetRepository>,
    queue: VerificationQueue,
    features: FeatureFlags,
    clock: Arc<dyn Clock>,
    calendar: Calendar,
}

impl VerificationScheduler {
    pub fn new(
        assets: Arc<dyn AssetRepository>,
        queue: VerificationQueue,
        features: FeatureFlags,
        clock: Arc<dyn Clock>,
        calendar: Calendar,
    ) -> Self {
        Self {
            assets,
            queue,
            features,
            clock,
            calendar,
        }
    }

    /// Sweep every asset, least recently verified first. A failing asset is
    /// logged and counted; the sweep continues.
    pub fn schedule_for_all_assets(&self) -> Result<ScheduleSummary> {
        let mut summary = ScheduleSummary::default();
        let mut ordered = Vec::new();
        for key in self.assets.keys()? {
            match self.assets.get(&key) {
                Ok(a) => ordered.push((a.most_recent_verified_epoch(), key)),
                Err(e) => {
                    tracing::warn!(asset = %key, error = %e, "failed to load asset for scheduling");
                    summary.failed += 1;
                }
            }
        }
        ordered.sort();
        summary.assets = ordered.len() + summary.failed;

        for (_, key) in ordered {
            match self.schedule_for_asset(&key) {
                Ok(AssetOutcome::Skipped(why)) => {
                    tracing::debug!(asset = %key, reason = %why, "not scheduling");
                    summary.skipped += 1;
                }
                Ok(AssetOutcome::Considered { queued, rejected }) => {
                    summary.queued += queued.len();
                    summary.rejected += rejected.len();
                }
                Err(e) => {
                    tracing::warn!(asset = %key, error = %e, "scheduling failed");
                    summary.failed += 1;
                }
            }
        }
        tracing::info!(
            assets = summary.assets,
            queued = summary.queued,
            rejected = summary.rejected,
            skipped = summary.skipped,
            failed = summary.failed,
            "verification scheduling sweep finished"
        );
        Ok(summary)
    }

    pub fn schedule_for_asset(&self, asset_key: &str) -> Result<AssetOutcome> {
        let asset = self.assets.get(asset_key)?;
        if let Some(why) = self.ineligibility(&asset)? {
            return Ok(AssetOutcome::Skipped(why));
        }

        let now = self.clock.now();
        let asset = if asset.remote_scheduled {
            asset
        } else {
            self.assets.refresh(asset_key)?;
            self.assets.get(asset_key)?
        };
        let candidates: Vec<i64> = asset
            .local_epochs()
            .filter(|&e| !asset.remote_scheduled || e > now - MAX_POINT_AGE_SECS)
            .collect();

        let mrve = asset.most_recent_verified_epoch();
        let mut queued = Vec::new();
        let mut rejected = Vec::new();
        for epoch in candidates {
            if !self.needs_verification(&asset, epoch)? {
                continue;
            }
            let item = VerificationAsset::new(&asset.key_name, epoch, now, mrve);
            if self.queue.add(item)? {
                queued.push(epoch);
            } else {
                rejected.push(epoch);
            }
        }
        Ok(AssetOutcome::Considered { queued, rejected })
    }

    pub fn ineligibility(&self, asset: &Asset) -> Result<Option<Ineligible>> {
        let why = if asset.origin == Origin::Replicated {
            Some(Ineligible::Replicated)
        } else if asset.removing {
            Some(Ineligible::Removing)
        } else if asset.archived {
            Some(Ineligible::Archived)
        } else if !self.features.verification_enabled()? {
            Some(Ineligible::FeatureDisabled)
        } else if let Some(reason) = asset.unsupported_reason() {
            Some(Ineligible::Unsupported(reason))
        } else if asset.verification.schedule == ScheduleOption::Never {
            Some(Ineligible::ScheduleNever)
        } else {
            None
        };
        Ok(why)
    }

    /// Local calendars group points by backup day, so every branch here
    /// shifts by the backup offset.
    pub fn needs_verification(&self, asset: &Asset, epoch: i64) -> Result<bool> {
        let Some(point) = asset.recovery_point(epoch) else {
            return Ok(false);
        };
        let now = self.clock.now();
        if !point.exists_locally()
            || point.screenshot.is_some()
            || now - epoch > MAX_POINT_AGE_SECS
        {
            return Ok(false);
        }

        let option = asset.verification.schedule;
        if option == ScheduleOption::Offsite {
            return Ok(matches!(
                point.offsite,
                OffsiteState::InProgress | OffsiteState::Complete
            ));
        }
        if option == ScheduleOption::Never {
            return Ok(false);
        }
        if asset.remote_scheduled {
            return self.remote_needs_verification(asset, epoch, now);
        }

        let slot = self.calendar.backup_week_hour(epoch);
        if asset.backup.schedule.hours_on(slot.day) == 0 {
            tracing::debug!(asset = %asset.key_name, epoch, "manual backup day; not scheduling");
            return Ok(false);
        }

        let cal = &self.calendar;
        let due = match option {
            ScheduleOption::FirstPoint => !asset
                .local_epochs()
                .any(|e| e < epoch && cal.same_backup_day(e, epoch)),
            ScheduleOption::LastPoint => {
                let later_today = asset
                    .local_epochs()
                    .any(|e| e > epoch && cal.same_backup_day(e, epoch));
                let next = cal.next_scheduled_backup(
                    &asset.backup.schedule,
                    asset.backup.interval_minutes,
                    epoch,
                );
                !later_today && !next.is_some_and(|n| cal.same_backup_day(n, epoch))
            }
            ScheduleOption::CustomSchedule => {
                if !asset.verification.custom_schedule.is_set(slot.day, slot.hour)
                    || !asset.backup.schedule.is_set(slot.day, slot.hour)
                {
                    return Ok(false);
                }
                let first_in_window = !asset
                    .local_epochs()
                    .any(|e| e < epoch && cal.same_backup_window(e, epoch));
                first_in_window || !self.window_represented(asset, epoch)?
            }
            ScheduleOption::Offsite | ScheduleOption::Never => false,
        };
        Ok(due)
    }

    /// Some other point in the same backup hour that day is already verified
    /// or waiting in the queue.
    fn window_represented(&self, asset: &Asset, epoch: i64) -> Result<bool> {
        for p in asset.recovery_points.values() {
            if p.epoch == epoch || !self.calendar.same_backup_window(p.epoch, epoch) {
                continue;
            }
            if p.screenshot.is_some() || self.queue.contains(&asset.key_name, p.epoch)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Continuously reporting assets have no local calendar: decide from the
    /// wall clock and the trailing day of points.
    fn remote_needs_verification(&self, asset: &Asset, epoch: i64, now: i64) -> Result<bool> {
        let window_start = now - MAX_POINT_AGE_SECS;
        let verified_recently = asset
            .recovery_points
            .values()
            .any(|p| p.epoch > window_start && p.screenshot.is_some());
        let newest = asset.local_epochs().filter(|&e| e > window_start).max();

        let due = match asset.verification.schedule {
            ScheduleOption::FirstPoint => !asset
                .local_epochs()
                .any(|e| e < epoch && self.calendar.same_day(e, epoch)),
            ScheduleOption::LastPoint => !verified_recently && newest == Some(epoch),
            ScheduleOption::CustomSchedule => {
                let wh = self.calendar.week_hour(now);
                asset.verification.custom_schedule.is_set(wh.day, wh.hour)
                    && !verified_recently
                    && newest == Some(epoch)
            }
            ScheduleOption::Offsite | ScheduleOption::Never => false,
        };
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetKind, MemoryAssetRepository, OsFamily, RecoveryPoint};
    use crate::clock::ManualClock;
    use crate::model::{ScreenshotResult, VerificationResultType, WeeklySchedule};
    use crate::queue::QueueLimits;
    use crate::store::MemoryStore;

    // 2023-11-14 22:13:20 UTC, a Tuesday.
    const T: i64 = 1_700_000_000;
    const TUE_MIDNIGHT: i64 = 1_699_920_000;
    const HOUR: i64 = 3600;

    struct Fixture {
        repo: Arc<MemoryAssetRepository>,
        queue: VerificationQueue,
        features: FeatureFlags,
        clock: Arc<ManualClock>,
        scheduler: VerificationScheduler,
    }

    fn fixture(now: i64, assets: Vec<Asset>) -> Fixture {
        let repo = Arc::new(MemoryAssetRepository::with_assets(assets));
        let clock = Arc::new(ManualClock::new(now));
        let device = Arc::new(MemoryStore::new());
        let queue = VerificationQueue::new(
            device.clone(),
            Arc::new(MemoryStore::new()),
            clock.clone(),
            QueueLimits::default(),
        );
        let features = FeatureFlags::new(device);
        let scheduler = VerificationScheduler::new(
            repo.clone(),
            queue.clone(),
            features.clone(),
            clock.clone(),
            Calendar::utc(),
        );
        Fixture {
            repo,
            queue,
            features,
            clock,
            scheduler,
        }
    }

    fn agent(key: &str, option: ScheduleOption, epochs: &[i64]) -> Asset {
        let mut a = Asset::new(key, OsFamily::Windows);
        a.backup.schedule = WeeklySchedule::with_hours(&[1, 2, 3, 4, 5], 8..19);
        a.backup.interval_minutes = 60;
        a.verification.schedule = option;
        for &e in epochs {
            a.add_point(RecoveryPoint::local(e));
        }
        a
    }

    fn verified(epoch: i64) -> ScreenshotResult {
        ScreenshotResult {
            result: VerificationResultType::Success,
            snapshot_epoch: epoch,
            captured_at: epoch + 600,
            screenshot_path: None,
            screenshot_sha256: None,
            agent_responded: true,
            pending_reboot: false,
            screenshot_failed: false,
            missing_services: Vec::new(),
            missing_applications: Vec::new(),
            scripts: Vec::new(),
            message: None,
            elapsed_secs: 60,
        }
    }

    fn queued_epochs(f: &Fixture) -> Vec<i64> {
        f.queue
            .list()
            .expect("list")
            .into_iter()
            .map(|e| e.snapshot_epoch)
            .collect()
    }

    #[test]
    fn last_point_of_the_day_is_queued() {
        let f = fixture(T + HOUR, vec![agent("agent-1", ScheduleOption::LastPoint, &[T])]);
        let out = f.scheduler.schedule_for_asset("agent-1").expect("schedule");
        assert_eq!(
            out,
            AssetOutcome::Considered {
                queued: vec![T],
                rejected: vec![]
            }
        );
        let item = f.queue.next().expect("next").expect("queued");
        assert_eq!(item.most_recent_verification_epoch, 0);
        assert_eq!(item.queued_time, T + HOUR);
        assert_eq!(f.repo.refreshed(), vec!["agent-1".to_string()]);
    }

    #[test]
    fn last_point_skips_points_with_a_later_sibling() {
        let f = fixture(
            T + HOUR,
            vec![agent("agent-1", ScheduleOption::LastPoint, &[T - HOUR, T])],
        );
        f.scheduler.schedule_for_asset("agent-1").expect("schedule");
        assert_eq!(queued_epochs(&f), vec![T]);
    }

    #[test]
    fn last_point_waits_for_later_backups_scheduled_today() {
        let morning = TUE_MIDNIGHT + 10 * HOUR + 13 * 60;
        let f = fixture(
            morning + 600,
            vec![agent("agent-1", ScheduleOption::LastPoint, &[morning])],
        );
        f.scheduler.schedule_for_asset("agent-1").expect("schedule");
        assert!(queued_epochs(&f).is_empty());
    }

    #[test]
    fn first_point_only_takes_the_earliest_of_the_day() {
        let a = TUE_MIDNIGHT + 10 * HOUR;
        let b = TUE_MIDNIGHT + 11 * HOUR;
        let f = fixture(b + 600, vec![agent("agent-1", ScheduleOption::FirstPoint, &[a, b])]);
        f.scheduler.schedule_for_asset("agent-1").expect("schedule");
        assert_eq!(queued_epochs(&f), vec![a]);
    }

    #[test]
    fn first_and_last_point_group_by_backup_day() {
        let wed = TUE_MIDNIGHT + 86_400;
        // With a 30 minute backup offset, 00:10 still belongs to Tuesday.
        let tue_late = wed + 10 * 60;
        let wed_early = wed + 50 * 60;
        let shifted = |option| {
            let mut a = agent("agent-1", option, &[tue_late, wed_early]);
            a.backup.schedule = WeeklySchedule::all();
            let f = fixture(wed_early + 600, vec![a]);
            let scheduler = VerificationScheduler::new(
                f.repo.clone(),
                f.queue.clone(),
                f.features.clone(),
                f.clock.clone(),
                Calendar::new(Some(0), 30),
            );
            scheduler.schedule_for_asset("agent-1").expect("schedule");
            let mut epochs = queued_epochs(&f);
            epochs.sort();
            epochs
        };
        assert_eq!(shifted(ScheduleOption::FirstPoint), vec![tue_late, wed_early]);
        assert_eq!(shifted(ScheduleOption::LastPoint), vec![tue_late]);
    }

    #[test]
    fn manual_backup_days_are_not_scheduled() {
        let sunday_noon = TUE_MIDNIGHT - 2 * 86_400 + 12 * HOUR;
        let f = fixture(
            sunday_noon + 600,
            vec![agent("agent-1", ScheduleOption::LastPoint, &[sunday_noon])],
        );
        let asset = f.repo.get("agent-1").expect("get");
        assert!(!f.scheduler.needs_verification(&asset, sunday_noon).expect("needs"));
    }

    #[test]
    fn offsite_option_follows_replication_state() {
        let sunday_noon = TUE_MIDNIGHT - 2 * 86_400 + 12 * HOUR;
        let mut a = agent("agent-1", ScheduleOption::Offsite, &[T, sunday_noon]);
        a.recovery_point_mut(sunday_noon).expect("point").offsite = OffsiteState::Complete;
        let f = fixture(T + HOUR, vec![a]);
        let asset = f.repo.get("agent-1").expect("get");
        assert!(!f.scheduler.needs_verification(&asset, T).expect("needs"));
        // Old point, outside the one-day window.
        assert!(!f.scheduler.needs_verification(&asset, sunday_noon).expect("needs"));

        let mut a = asset.clone();
        a.recovery_point_mut(T).expect("point").offsite = OffsiteState::InProgress;
        assert!(f.scheduler.needs_verification(&a, T).expect("needs"));
    }

    #[test]
    fn stale_or_verified_points_are_never_due() {
        let mut a = agent("agent-1", ScheduleOption::LastPoint, &[T]);
        let f = fixture(T + MAX_POINT_AGE_SECS + 1, vec![a.clone()]);
        assert!(!f.scheduler.needs_verification(&a, T).expect("needs"));

        f.clock.set(T + HOUR);
        a.recovery_point_mut(T).expect("point").screenshot = Some(verified(T));
        assert!(!f.scheduler.needs_verification(&a, T).expect("needs"));
        assert!(!f.scheduler.needs_verification(&a, T + 1).expect("needs"));
    }

    #[test]
    fn custom_schedule_takes_one_point_per_selected_hour() {
        let at_1005 = TUE_MIDNIGHT + 10 * HOUR + 5 * 60;
        let at_1035 = TUE_MIDNIGHT + 10 * HOUR + 35 * 60;
        let at_1105 = TUE_MIDNIGHT + 11 * HOUR + 5 * 60;
        let mut a = agent(
            "agent-1",
            ScheduleOption::CustomSchedule,
            &[at_1005, at_1035, at_1105],
        );
        a.verification.custom_schedule = WeeklySchedule::with_hours(&[2], 10..11);
        let f = fixture(at_1105 + 600, vec![a]);

        f.scheduler.schedule_for_asset("agent-1").expect("schedule");
        assert_eq!(queued_epochs(&f), vec![at_1005]);
    }

    #[test]
    fn custom_schedule_retries_an_unrepresented_window() {
        let at_1005 = TUE_MIDNIGHT + 10 * HOUR + 5 * 60;
        let at_1035 = TUE_MIDNIGHT + 10 * HOUR + 35 * 60;
        let mut a = agent("agent-1", ScheduleOption::CustomSchedule, &[at_1005, at_1035]);
        a.verification.custom_schedule = WeeklySchedule::with_hours(&[2], 10..11);
        let f = fixture(at_1035 + 600, vec![a.clone()]);
        // Neither verified nor queued: the later point may stand in.
        assert!(f.scheduler.needs_verification(&a, at_1035).expect("needs"));

        a.recovery_point_mut(at_1005).expect("point").screenshot = Some(verified(at_1005));
        assert!(!f.scheduler.needs_verification(&a, at_1035).expect("needs"));
    }

    #[test]
    fn remote_scheduled_assets_take_only_the_newest_recent_point() {
        let now = T;
        let mut a = agent(
            "remote-1",
            ScheduleOption::LastPoint,
            &[now - 2 * 86_400, now - 2 * HOUR, now - HOUR],
        );
        a.remote_scheduled = true;
        a.backup.schedule = WeeklySchedule::empty();
        let f = fixture(now, vec![a.clone()]);
        f.scheduler.schedule_for_asset("remote-1").expect("schedule");
        assert_eq!(queued_epochs(&f), vec![now - HOUR]);
        assert!(f.repo.refreshed().is_empty());

        a.recovery_point_mut(now - 2 * HOUR).expect("point").screenshot =
            Some(verified(now - 2 * HOUR));
        assert!(!f.scheduler.needs_verification(&a, now - HOUR).expect("needs"));
    }

    #[test]
    fn remote_custom_schedule_uses_the_wall_clock_hour() {
        let mut a = agent("remote-1", ScheduleOption::CustomSchedule, &[T - 600]);
        a.remote_scheduled = true;
        a.verification.custom_schedule = WeeklySchedule::with_hours(&[2], 22..23);
        let f = fixture(T, vec![a.clone()]);
        assert!(f.scheduler.needs_verification(&a, T - 600).expect("needs"));
        f.clock.set(T + HOUR);
        assert!(!f.scheduler.needs_verification(&a, T - 600).expect("needs"));
    }

    #[test]
    fn ineligible_assets_are_skipped_in_gate_order() {
        let mut replicated = agent("r", ScheduleOption::LastPoint, &[T]);
        replicated.origin = Origin::Replicated;
        replicated.archived = true;
        let mut share = agent("s", ScheduleOption::LastPoint, &[T]);
        share.kind = AssetKind::Share;
        let never = agent("n", ScheduleOption::Never, &[T]);
        let f = fixture(T + HOUR, vec![replicated, share, never]);

        assert_eq!(
            f.scheduler.schedule_for_asset("r").expect("r"),
            AssetOutcome::Skipped(Ineligible::Replicated)
        );
        assert!(matches!(
            f.scheduler.schedule_for_asset("s").expect("s"),
            AssetOutcome::Skipped(Ineligible::Unsupported(_))
        ));
        assert_eq!(
            f.scheduler.schedule_for_asset("n").expect("n"),
            AssetOutcome::Skipped(Ineligible::ScheduleNever)
        );

        f.features.set_verification_enabled(false).expect("disable");
        assert_eq!(
            f.scheduler.schedule_for_asset("n").expect("n"),
            AssetOutcome::Skipped(Ineligible::FeatureDisabled)
        );
    }

    #[test]
    fn sweep_survives_a_failing_asset() {
        let good = agent("good", ScheduleOption::LastPoint, &[T]);
        // Store keys cannot contain '/', so queueing this asset errors.
        let bad = agent("bad/key", ScheduleOption::LastPoint, &[T]);
        let f = fixture(T + HOUR, vec![bad, good]);
        let summary = f.scheduler.schedule_for_all_assets().expect("sweep");
        assert_eq!(summary.assets, 2);
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(f.queue.next().expect("next").expect("some").asset_key, "good");
    }
}
