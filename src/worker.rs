use crate::catalog::Catalog;
use crate::error::{DubError, DubResult};
use crate::{dubbed_name_for, Progress, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;
use uuid::Uuid;

/// Progress added on every tick of a dubbing job.
pub const PROGRESS_STEP: u8 = 10;

const TICKS_PER_JOB: u32 = (100 / PROGRESS_STEP) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Advanced(u8),
    Completed,
    Stopped,
}

/// Drives simulated dubbing jobs, at most one per video.
///
/// Each job is a tokio task holding a child of the runner's shutdown token.
/// Deleting a video cancels its token; the task re-checks the token inside
/// the catalog's write lock before every mutation, so a cancelled job can
/// never touch the catalog again.
#[derive(Clone)]
pub struct JobRunner {
    catalog: Catalog,
    tick: Duration,
    jobs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl JobRunner {
    /// Jobs are also cancelled when `parent` is.
    pub fn new(catalog: Catalog, tick: Duration, parent: &CancellationToken) -> Self {
        JobRunner {
            catalog,
            tick,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            shutdown: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Moves an uploaded video to processing and spawns its job.
    pub fn start(&self, id: Uuid) -> DubResult<()> {
        let token = {
            let mut jobs = self.jobs.lock();
            if jobs.contains_key(&id) {
                return Err(DubError::AlreadyInProgress(id));
            }

            self.catalog.update(id, |video| match video.status {
                Status::Uploaded => {
                    video.status = Status::Processing;
                    video.progress = 0;
                    Ok(())
                }
                Status::Processing => Err(DubError::AlreadyInProgress(id)),
                status => Err(DubError::InvalidState { id, status }),
            })??;

            let token = self.shutdown.child_token();
            jobs.insert(id, token.clone());
            token
        };

        info!(message = "Dubbing started", video_id = %id);
        let runner = self.clone();
        self.tracker.spawn(
            async move {
                runner.run(id, token).await;
            }
            .instrument(info_span!("dubbing", video_id = %id)),
        );
        Ok(())
    }

    /// Cancels the job for `id`, if any. Returns whether one was running.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs.lock().remove(&id) {
            Some(token) => {
                token.cancel();
                debug!(message = "Dubbing cancelled", video_id = %id);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.jobs.lock().contains_key(&id)
    }

    pub fn snapshot(&self, id: Uuid) -> DubResult<Progress> {
        self.catalog.get(id).map(|video| Progress::from(&video))
    }

    /// Wall-clock time a job needs from start to completion.
    pub fn estimated_duration(&self) -> Duration {
        self.tick * TICKS_PER_JOB
    }

    /// Cancels every running job and waits for their tasks to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.jobs.lock().clear();
        info!("Job runner stopped.");
    }

    async fn run(&self, id: Uuid, token: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Job cancelled");
                    break;
                },
                _ = ticker.tick() => {
                    match self.advance(id, &token) {
                        Ok(Tick::Advanced(progress)) => {
                            trace!(message = "Dubbing progress", progress = progress);
                        },
                        Ok(Tick::Completed) => {
                            info!("Dubbing completed");
                            break;
                        },
                        Ok(Tick::Stopped) => {
                            debug!("Job no longer active, stopping");
                            break;
                        },
                        Err(DubError::NotFound(_)) => {
                            debug!("Video removed, stopping");
                            break;
                        },
                        Err(err) => {
                            error!(message = "Dubbing tick failed", error = ?err);
                            break;
                        },
                    }
                }
            }
        }

        if !token.is_cancelled() {
            self.jobs.lock().remove(&id);
        }
    }

    fn advance(&self, id: Uuid, token: &CancellationToken) -> DubResult<Tick> {
        self.catalog.update(id, |video| {
            if token.is_cancelled() || video.status != Status::Processing {
                return Tick::Stopped;
            }

            video.progress = video.progress.saturating_add(PROGRESS_STEP).min(100);
            if video.progress < 100 {
                return Tick::Advanced(video.progress);
            }

            video.status = Status::Completed;
            video.dub_available = true;
            video.dubbed_name = Some(dubbed_name_for(&video.stored_name));
            Tick::Completed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewVideo;

    const TICK: Duration = Duration::from_millis(100);

    fn setup() -> (Catalog, JobRunner, Uuid) {
        let catalog = Catalog::new();
        let id = catalog
            .create(NewVideo {
                stored_name: "abc.mp4".into(),
                original_name: "sample.mp4".into(),
                title: None,
                url: "/uploads/abc.mp4".into(),
                size_bytes: 500_000,
                mime_type: "video/mp4".into(),
            })
            .id;
        let runner = JobRunner::new(catalog.clone(), TICK, &CancellationToken::new());
        (catalog, runner, id)
    }

    #[tokio::test(start_paused = true)]
    async fn job_advances_in_steps_until_completed() {
        let (catalog, runner, id) = setup();

        runner.start(id).unwrap();
        let started = runner.snapshot(id).unwrap();
        assert_eq!(started.status, Status::Processing);
        assert_eq!(started.progress, 0);

        tokio::time::sleep(TICK / 2).await;
        let mut seen = vec![];
        for _ in 0..=10 {
            let progress = runner.snapshot(id).unwrap();
            assert_eq!(progress.dub_available, progress.progress == 100);
            seen.push((progress.progress, progress.status));
            tokio::time::sleep(TICK).await;
        }

        let expected: Vec<_> = (0..=10)
            .map(|step| {
                let status = if step == 10 { Status::Completed } else { Status::Processing };
                (step * PROGRESS_STEP, status)
            })
            .collect();
        assert_eq!(seen, expected);

        let video = catalog.get(id).unwrap();
        assert_eq!(video.dubbed_name.as_deref(), Some("hindi-dub-abc.mp4"));
        assert!(!runner.is_running(id));

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(catalog.get(id).unwrap(), video);
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_side_effects() {
        let (catalog, runner, id) = setup();

        runner.start(id).unwrap();
        tokio::time::sleep(TICK * 3 + TICK / 2).await;
        let before = catalog.get(id).unwrap();

        assert!(matches!(runner.start(id), Err(DubError::AlreadyInProgress(_))));
        assert_eq!(catalog.get(id).unwrap(), before);
        assert_eq!(before.progress, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_spawn_a_single_job() {
        for _ in 0..50 {
            let (catalog, runner, id) = setup();
            let barrier = Arc::new(tokio::sync::Barrier::new(8));

            let attempts: Vec<_> = (0..8)
                .map(|_| {
                    let runner = runner.clone();
                    let barrier = barrier.clone();
                    tokio::spawn(async move {
                        barrier.wait().await;
                        runner.start(id)
                    })
                })
                .collect();

            let mut started = 0;
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(()) => started += 1,
                    Err(err) => assert!(matches!(err, DubError::AlreadyInProgress(_))),
                }
            }

            assert_eq!(started, 1);
            assert!(runner.is_running(id));
            assert_eq!(catalog.get(id).unwrap().status, Status::Processing);
            runner.shutdown().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_on_completed_or_unknown_video_fails() {
        let (_catalog, runner, id) = setup();

        assert!(matches!(runner.start(Uuid::new_v4()), Err(DubError::NotFound(_))));

        runner.start(id).unwrap();
        tokio::time::sleep(runner.estimated_duration() + TICK).await;

        assert!(matches!(
            runner.start(id),
            Err(DubError::InvalidState { status: Status::Completed, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_touches_a_deleted_record() {
        let (catalog, runner, id) = setup();

        runner.start(id).unwrap();
        tokio::time::sleep(TICK * 4 + TICK / 2).await;

        assert!(runner.cancel(id));
        let removed = catalog.delete(id).unwrap();
        assert_eq!(removed.progress, 40);

        tokio::time::sleep(TICK * 10).await;
        assert!(matches!(runner.snapshot(id), Err(DubError::NotFound(_))));
        assert!(catalog.is_empty());
        assert!(!runner.cancel(id));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_for_removed_record_is_a_no_op() {
        let (catalog, runner, id) = setup();

        runner.start(id).unwrap();
        catalog.delete(id).unwrap();
        tokio::time::sleep(TICK * 2).await;

        assert!(catalog.get(id).is_err());
        assert!(!runner.is_running(id));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_running_jobs() {
        let (catalog, runner, id) = setup();

        runner.start(id).unwrap();
        tokio::time::sleep(TICK + TICK / 2).await;
        runner.shutdown().await;
        tokio::time::sleep(TICK * 10).await;

        let video = catalog.get(id).unwrap();
        assert_eq!(video.status, Status::Processing);
        assert_eq!(video.progress, 10);
    }

    #[test]
    fn estimate_covers_all_ticks() {
        let (_catalog, runner, _id) = setup();
        assert_eq!(runner.estimated_duration(), TICK * 10);
    }
}
