//! Bounded job pool: launches tool processes in keyspace order, replenishes
//! as they exit, and drives teardown on success or a save request.
//!
//! Only the thread calling [`Scheduler::run`] touches the pool. Monitors and
//! the command listener talk to it through the [`Coordinator`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::SweepConfig;
use crate::error::{SweepError, SweepResult};
use crate::fsutil::atomic_write_bytes;
use crate::job::{Job, JobSettings};
use crate::keyspace::Keyspace;
use crate::signal::{Coordinator, Observation, SuccessHit, WakeReceiver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Stop every active job; the hit is what the run will report.
    TerminateActive(SuccessHit),
    DrainNaturally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Filling,
    Running,
    Draining(DrainPolicy),
    Terminated(Settled),
}

/// How the run ended, carrying what `finish` has to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Found(SuccessHit),
    Saved,
    Exhausted,
}

impl Settled {
    pub fn outcome(&self) -> Outcome {
        match self {
            Settled::Found(_) => Outcome::Found,
            Settled::Saved => Outcome::Saved,
            Settled::Exhausted => Outcome::Exhausted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Found,
    Saved,
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub outcome: Outcome,
    pub success_line: Option<String>,
    pub success_index: Option<u64>,
    pub success_candidate: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub checkpoint: Option<u64>,
    pub total: u64,
    pub start_index: u64,
    pub next_index: u64,
    pub launched: u64,
    pub launch_failures: u64,
    pub first_launched: Option<u64>,
    pub peak_active: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tally {
    launched: u64,
    launch_failures: u64,
    first_launched: Option<u64>,
    peak_active: usize,
}

#[derive(Debug)]
pub struct Scheduler {
    settings: JobSettings,
    keyspace: Keyspace,
    max_instances: usize,
    poll_interval: Duration,
    grace_period: Duration,
    join_timeout: Duration,
    artifact_path: PathBuf,
    checkpoint: CheckpointStore,
    coordinator: Coordinator,
    wake: WakeReceiver,
    pool: Vec<Job>,
    start_index: u64,
    next_index: u64,
    phase: Phase,
    tally: Tally,
}

impl Scheduler {
    pub fn new(config: &SweepConfig, start_index: u64) -> Result<Self> {
        config.validate()?;
        let keyspace = config.keyspace()?;
        if start_index > keyspace.total() {
            warn!(
                start_index,
                total = keyspace.total(),
                "start index is past the end of the keyspace"
            );
        }
        let (coordinator, wake) = Coordinator::new();
        Ok(Self {
            settings: config.job_settings(),
            max_instances: config.max_instances,
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
            join_timeout: config.monitor_join_timeout(),
            artifact_path: config.result_artifact_path(),
            checkpoint: config.checkpoint_store(),
            coordinator,
            wake,
            pool: Vec::new(),
            start_index,
            next_index: start_index,
            phase: Phase::Filling,
            tally: Tally::default(),
            keyspace,
        })
    }

    /// Handle for the command listener and anything else that raises signals.
    pub fn coordinator(&self) -> Coordinator {
        self.coordinator.clone()
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    pub fn run(mut self) -> SweepResult<SweepReport> {
        let started_at = Utc::now();
        info!(
            total = self.keyspace.total(),
            start_index = self.start_index,
            max_instances = self.max_instances,
            "sweep started"
        );
        let settled = loop {
            let next = match self.phase.clone() {
                Phase::Filling => {
                    if self.coordinator.save_requested() {
                        debug!("save already requested; skipping initial fill");
                    } else {
                        self.fill();
                    }
                    Phase::Running
                }
                Phase::Running => self.running_step(),
                Phase::Draining(DrainPolicy::DrainNaturally) => self.natural_drain_step(),
                Phase::Draining(DrainPolicy::TerminateActive(hit)) => {
                    self.terminate_all();
                    Phase::Terminated(Settled::Found(hit))
                }
                Phase::Terminated(settled) => break settled,
            };
            if next != self.phase {
                debug!(from = ?self.phase, to = ?next, "phase change");
            }
            self.phase = next;
        };
        self.finish(settled, started_at)
    }

    fn running_step(&mut self) -> Phase {
        self.reap_exited();
        match self.coordinator.observe() {
            Observation::Success(hit) => return self.begin_success_drain(hit),
            Observation::Save => {
                info!(
                    active = self.pool.len(),
                    next_index = self.next_index,
                    "save requested; draining active jobs"
                );
                return Phase::Draining(DrainPolicy::DrainNaturally);
            }
            Observation::Quiet => {}
        }
        self.fill();
        if self.pool.is_empty() && self.next_index >= self.keyspace.total() {
            if let Some(hit) = self.coordinator.success() {
                return self.begin_success_drain(hit);
            }
            return Phase::Terminated(Settled::Exhausted);
        }
        self.wake.wait(self.poll_interval);
        Phase::Running
    }

    fn natural_drain_step(&mut self) -> Phase {
        self.reap_exited();
        if let Some(hit) = self.coordinator.success() {
            info!("success recorded while draining; terminating remaining jobs");
            return self.begin_success_drain(hit);
        }
        if self.pool.is_empty() {
            return Phase::Terminated(Settled::Saved);
        }
        self.wake.wait(self.poll_interval);
        Phase::Draining(DrainPolicy::DrainNaturally)
    }

    fn begin_success_drain(&self, hit: SuccessHit) -> Phase {
        info!(
            index = hit.index,
            line = %hit.line,
            active = self.pool.len(),
            "success observed; terminating active jobs"
        );
        Phase::Draining(DrainPolicy::TerminateActive(hit))
    }

    fn capacity_left(&self) -> bool {
        self.pool.len() < self.max_instances
    }

    fn fill(&mut self) {
        while self.capacity_left()
            && self.next_index < self.keyspace.total()
            && matches!(self.coordinator.observe(), Observation::Quiet)
        {
            self.launch_next();
        }
    }

    fn launch_next(&mut self) {
        let index = self.next_index;
        let Some(candidate) = self.keyspace.nth(index) else {
            return;
        };
        self.next_index += 1;
        match Job::launch(&self.settings, index, &candidate, &self.coordinator) {
            Ok(job) => {
                self.pool.push(job);
                self.tally.launched += 1;
                self.tally.first_launched.get_or_insert(index);
                self.tally.peak_active = self.tally.peak_active.max(self.pool.len());
            }
            Err(e) => {
                error!("{}; skipping", e);
                self.tally.launch_failures += 1;
            }
        }
    }

    fn reap_exited(&mut self) -> usize {
        let join_deadline = Instant::now() + self.join_timeout;
        let mut reaped = 0;
        let mut i = 0;
        while i < self.pool.len() {
            let check = self.pool[i].try_exit();
            if self.settle_job(i, check, join_deadline) {
                reaped += 1;
            } else {
                i += 1;
            }
        }
        reaped
    }

    /// Acts on one liveness check of `pool[i]`. Returns true when the job was
    /// removed from the pool. A failed check is treated as an exit: the job
    /// is killed and reaped so one bad child cannot stall or abort the run.
    fn settle_job(
        &mut self,
        i: usize,
        check: std::io::Result<Option<ExitStatus>>,
        join_deadline: Instant,
    ) -> bool {
        match check {
            Ok(None) => return false,
            Ok(Some(_)) => {}
            Err(e) => {
                let job = &mut self.pool[i];
                warn!(
                    index = job.index(),
                    candidate = %job.candidate(),
                    error = %e,
                    "exit status check failed; treating job as exited"
                );
                if let Err(e) = job.kill() {
                    debug!(index = job.index(), error = %e, "kill after failed check");
                }
            }
        }
        let job = self.pool.remove(i);
        let record = job.reap_by(join_deadline);
        info!(
            index = record.index,
            candidate = %record.candidate,
            status = ?record.status,
            elapsed_ms = record.elapsed.as_millis() as u64,
            "job finished"
        );
        true
    }

    fn terminate_all(&mut self) {
        for job in self.pool.iter_mut() {
            if let Err(e) = job.request_stop() {
                warn!(index = job.index(), error = %e, "failed to request termination");
            }
        }
        let deadline = Instant::now() + self.grace_period;
        let mut stopped = Vec::with_capacity(self.pool.len());
        for mut job in std::mem::take(&mut self.pool) {
            match job.await_stop(deadline) {
                Ok(kind) => debug!(index = job.index(), ?kind, "job stopped"),
                Err(e) => warn!(index = job.index(), error = %e, "failed to stop job"),
            }
            stopped.push(job);
        }
        let join_deadline = Instant::now() + self.join_timeout;
        for job in stopped {
            let record = job.reap_by(join_deadline);
            debug!(index = record.index, status = ?record.status, "terminated job reaped");
        }
    }

    fn finish(self, settled: Settled, started_at: DateTime<Utc>) -> SweepResult<SweepReport> {
        let outcome = settled.outcome();
        let mut artifact_path = None;
        let mut checkpoint = None;
        let hit = match settled {
            Settled::Found(hit) => {
                if let Err(source) = atomic_write_bytes(&self.artifact_path, hit.line.as_bytes()) {
                    error!(line = %hit.line, "result artifact could not be written");
                    return Err(SweepError::ResultWrite {
                        path: self.artifact_path.clone(),
                        source,
                    });
                }
                info!(path = %self.artifact_path.display(), line = %hit.line, "result artifact written");
                artifact_path = Some(self.artifact_path.clone());
                Some(hit)
            }
            Settled::Saved => {
                self.checkpoint.save(self.next_index)?;
                checkpoint = Some(self.next_index);
                None
            }
            Settled::Exhausted => {
                info!(
                    launched = self.tally.launched,
                    launch_failures = self.tally.launch_failures,
                    "keyspace exhausted without success"
                );
                None
            }
        };
        Ok(SweepReport {
            outcome,
            success_line: hit.as_ref().map(|h| h.line.clone()),
            success_index: hit.as_ref().map(|h| h.index),
            success_candidate: hit.as_ref().and_then(|h| self.keyspace.nth(h.index)),
            artifact_path,
            checkpoint,
            total: self.keyspace.total(),
            start_index: self.start_index,
            next_index: self.next_index,
            launched: self.tally.launched,
            launch_failures: self.tally.launch_failures,
            first_launched: self.tally.first_launched,
            peak_active: self.tally.peak_active,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::thread;

    struct Fixture {
        dir: tempfile::TempDir,
        config: SweepConfig,
    }

    impl Fixture {
        /// `cases` is the body of a shell `case "$c" in ... esac` keyed on the
        /// candidate read from the constraint file.
        fn new(max_instances: usize, cases: &str) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let log = dir.path().join("launches.log");
            let tool = dir.path().join("tool.sh");
            let body = format!(
                "#!/bin/sh\nf=${{1#-p}}\nc=$(sed -n 2p \"$f\" | cut -d'[' -f1)\necho \"$c\" >> '{}'\ncase \"$c\" in\n{}\n*) exit 0 ;;\nesac\n",
                log.display(),
                cases
            );
            fs::write(&tool, body).expect("write tool");
            let mut perms = fs::metadata(&tool).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&tool, perms).expect("chmod");
            let config = SweepConfig {
                tool,
                archive: PathBuf::from("Addon.rar"),
                alphabet: "ab".to_string(),
                combination_length: 2,
                max_instances,
                checkpoint_path: dir.path().join("save_progress.txt"),
                work_dir: dir.path().join("work"),
                output_dir: dir.path().join("out"),
                poll_interval_ms: 10,
                grace_period_ms: 500,
                monitor_join_timeout_ms: 2000,
                ..SweepConfig::default()
            };
            Self { dir, config }
        }

        fn launches(&self) -> Vec<String> {
            let mut lines: Vec<String> = fs::read_to_string(self.dir.path().join("launches.log"))
                .unwrap_or_default()
                .lines()
                .map(|l| l.to_string())
                .collect();
            lines.sort();
            lines
        }

        fn wait_for_launches(&self, n: usize) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.launches().len() < n {
                assert!(Instant::now() < deadline, "timed out waiting for launches");
                thread::sleep(Duration::from_millis(5));
            }
        }

        fn leftover_constraint_files(&self) -> Vec<PathBuf> {
            list_dir(&self.config.work_dir)
                .into_iter()
                .filter(|p| p.extension().map(|e| e == "def").unwrap_or(false))
                .collect()
        }
    }

    fn list_dir(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn success_terminates_active_jobs_and_writes_artifact() {
        let fx = Fixture::new(
            2,
            "aa) exec sleep 30 ;;\nba) echo 'CRC OK: ba found' ;;\nab) exit 3 ;;",
        );
        let started = Instant::now();
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(20), "aa was not terminated");
        assert_eq!(report.outcome, Outcome::Found);
        assert_eq!(report.success_line.as_deref(), Some("CRC OK: ba found"));
        assert_eq!(report.success_candidate.as_deref(), Some("ba"));
        assert_eq!(report.first_launched, Some(0));
        assert!(report.peak_active <= 2);
        assert_eq!(fx.launches(), vec!["aa", "ab", "ba"]);
        let artifact = fx.config.output_dir.join("pass_Addon.rar.txt");
        assert_eq!(report.artifact_path.as_deref(), Some(artifact.as_path()));
        assert_eq!(fs::read_to_string(&artifact).expect("artifact"), "CRC OK: ba found");
        assert!(fx.leftover_constraint_files().is_empty());
        assert!(!fx.config.checkpoint_path.exists());
    }

    #[test]
    fn save_request_drains_naturally_and_checkpoints_next_index() {
        let fx = Fixture::new(2, "aa|ab) sleep 1 ;;");
        let scheduler = Scheduler::new(&fx.config, 0).expect("scheduler");
        let coordinator = scheduler.coordinator();
        let run = thread::spawn(move || scheduler.run());
        fx.wait_for_launches(2);
        coordinator.request_save();
        let report = run.join().expect("join").expect("run");
        assert_eq!(report.outcome, Outcome::Saved);
        assert_eq!(report.checkpoint, Some(2));
        assert_eq!(fs::read_to_string(&fx.config.checkpoint_path).expect("checkpoint"), "2");
        assert_eq!(fx.launches(), vec!["aa", "ab"]);
        assert!(report.artifact_path.is_none());
        assert!(list_dir(&fx.config.output_dir).is_empty());
        assert!(fx.leftover_constraint_files().is_empty());
    }

    #[test]
    fn resume_starts_exactly_at_checkpoint() {
        let fx = Fixture::new(2, "");
        let store = fx.config.checkpoint_store();
        store.save(2).expect("seed checkpoint");
        let start = store.load().expect("checkpoint");
        let report = Scheduler::new(&fx.config, start)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.first_launched, Some(2));
        assert_eq!(report.launched, 2);
        assert_eq!(fx.launches(), vec!["ba", "bb"]);
        assert_eq!(store.load(), Some(2), "exhaustion must not touch the checkpoint");
    }

    #[test]
    fn exhausted_keyspace_leaves_no_artifact_or_checkpoint() {
        let fx = Fixture::new(2, "");
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.launched, 4);
        assert_eq!(report.next_index, 4);
        assert!(report.success_line.is_none());
        assert_eq!(fx.launches(), vec!["aa", "ab", "ba", "bb"]);
        assert!(!fx.config.checkpoint_path.exists());
        assert!(list_dir(&fx.config.output_dir).is_empty());
        assert!(fx.leftover_constraint_files().is_empty());
    }

    #[test]
    fn save_before_start_launches_nothing() {
        let fx = Fixture::new(2, "");
        let scheduler = Scheduler::new(&fx.config, 1).expect("scheduler");
        scheduler.coordinator().request_save();
        let report = scheduler.run().expect("run");
        assert_eq!(report.outcome, Outcome::Saved);
        assert_eq!(report.launched, 0);
        assert_eq!(report.checkpoint, Some(1));
        assert!(fx.launches().is_empty());
    }

    #[test]
    fn launch_failures_are_skipped_without_aborting() {
        let mut fx = Fixture::new(2, "");
        fx.config.tool = fx.dir.path().join("missing-tool");
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.launched, 0);
        assert_eq!(report.launch_failures, 4);
        assert_eq!(report.next_index, 4);
        assert!(fx.leftover_constraint_files().is_empty());
    }

    #[test]
    fn pool_never_exceeds_capacity() {
        let mut fx = Fixture::new(3, "*) sleep 1 ;;");
        fx.config.combination_length = 3;
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.launched, 8);
        assert_eq!(report.peak_active, 3);
    }

    #[test]
    fn simultaneous_successes_record_a_single_line() {
        let fx = Fixture::new(4, "*) echo \"CRC OK $c\" ;;");
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Found);
        let candidate = report.success_candidate.clone().expect("candidate");
        let expected = format!("CRC OK {}", candidate);
        assert_eq!(report.success_line.as_deref(), Some(expected.as_str()));
        let artifact = report.artifact_path.expect("artifact");
        assert_eq!(fs::read_to_string(artifact).expect("read"), expected);
        assert!(fx.leftover_constraint_files().is_empty());
    }

    #[test]
    fn success_during_natural_drain_still_wins() {
        let fx = Fixture::new(2, "aa) sleep 1; echo 'CRC OK late' ;;\nab) sleep 1 ;;");
        let scheduler = Scheduler::new(&fx.config, 0).expect("scheduler");
        let coordinator = scheduler.coordinator();
        let run = thread::spawn(move || scheduler.run());
        fx.wait_for_launches(2);
        coordinator.request_save();
        let report = run.join().expect("join").expect("run");
        assert_eq!(report.outcome, Outcome::Found);
        assert_eq!(report.success_line.as_deref(), Some("CRC OK late"));
        assert!(!fx.config.checkpoint_path.exists());
        assert_eq!(fx.launches(), vec!["aa", "ab"]);
    }

    #[test]
    fn teardown_shares_one_join_bound_across_stragglers() {
        // Each straggler leaves a background sleep holding its output pipe.
        let fx = Fixture::new(
            4,
            "aa|ab|ba) sleep 5 &\nexec sleep 5 ;;\nbb) echo 'CRC OK bb' ;;",
        );
        let started = Instant::now();
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        let elapsed = started.elapsed();
        assert_eq!(report.outcome, Outcome::Found);
        assert_eq!(report.success_candidate.as_deref(), Some("bb"));
        assert!(
            elapsed < Duration::from_millis(4000),
            "teardown joined monitors one after another: {:?}",
            elapsed
        );
        assert!(fx.leftover_constraint_files().is_empty());
    }

    #[test]
    fn failed_exit_check_drops_the_job_and_the_run_still_checkpoints() {
        let fx = Fixture::new(1, "aa) exec sleep 30 ;;");
        let mut scheduler = Scheduler::new(&fx.config, 0).expect("scheduler");
        scheduler.fill();
        assert_eq!(scheduler.pool.len(), 1);
        let path = scheduler.pool[0].constraint_path().to_path_buf();
        assert!(path.exists());
        let removed = scheduler.settle_job(
            0,
            Err(io::Error::other("try_wait failed")),
            Instant::now() + Duration::from_secs(2),
        );
        assert!(removed);
        assert!(scheduler.pool.is_empty());
        assert!(!path.exists());
        scheduler.coordinator().request_save();
        let report = scheduler.run().expect("run");
        assert_eq!(report.outcome, Outcome::Saved);
        assert_eq!(report.checkpoint, Some(1));
        assert_eq!(fs::read_to_string(&fx.config.checkpoint_path).expect("checkpoint"), "1");
    }

    #[test]
    fn undeletable_constraint_file_is_logged_and_the_run_continues() {
        // Swapping the file for a directory defeats removal even for root.
        let fx = Fixture::new(1, "aa) rm \"$f\"; mkdir \"$f\" ;;");
        let report = Scheduler::new(&fx.config, 0)
            .expect("scheduler")
            .run()
            .expect("run");
        assert_eq!(report.outcome, Outcome::Exhausted);
        assert_eq!(report.launched, 4);
        assert_eq!(fx.launches(), vec!["aa", "ab", "ba", "bb"]);
        let leftover = fx.leftover_constraint_files();
        assert_eq!(leftover, vec![fx.config.work_dir.join("aa.def")]);
        assert!(leftover[0].is_dir());
    }

    #[test]
    fn result_write_failure_is_fatal() {
        let mut fx = Fixture::new(1, "aa) echo 'CRC OK aa' ;;");
        let blocker = fx.dir.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write blocker");
        fx.config.output_dir = blocker.clone();
        let result = Scheduler::new(&fx.config, 0).expect("scheduler").run();
        match result {
            Err(SweepError::ResultWrite { path, .. }) => {
                assert_eq!(path, blocker.join("pass_Addon.rar.txt"));
            }
            other => panic!("expected result write failure, got {:?}", other),
        }
        assert!(!fx.config.checkpoint_path.exists());
        assert!(fx.leftover_constraint_files().is_empty());
    }
}
