//! Runs every plugin on its own fixed-rate schedule.
//!
//! Each plugin gets a task that ticks at `start + k * interval`. A plugin is never run twice at the same time:
//! ticks that come due while a run is still in flight are dropped and counted, and so are refresh requests.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use crossbar_shared_util::PluginId;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    app::DaemonCommand,
    cache::{ResultCache, RunOutcome},
    config::{PartialOutputPolicy, PluginDescriptor},
    sandbox::PluginRunner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerOptions {
    /// Run each plugin right when it is started, instead of one interval later.
    pub run_on_start: bool,
    pub partial_output: PartialOutputPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RefreshOutcome {
    Triggered,
    /// The plugin is running right now. The request was dropped.
    AlreadyRunning,
    Unknown,
}

/// Scheduling state of a single plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub plugin: PluginId,
    pub interval: Duration,
    pub next_fire_time: Instant,
    pub running: bool,
    /// Number of completed runs.
    pub runs: u64,
    pub dropped_ticks: u64,
    pub last_outcome: Option<RunOutcome>,
}

#[derive(Debug, Default)]
struct ScheduleState {
    running: bool,
    runs: u64,
    dropped_ticks: u64,
    last_outcome: Option<RunOutcome>,
}

struct PluginHandle {
    descriptor: Arc<PluginDescriptor>,
    first_tick: Instant,
    cancellation_token: CancellationToken,
    refresh_send: mpsc::Sender<()>,
    state: Arc<Mutex<ScheduleState>>,
}

impl PluginHandle {
    fn entry(&self, now: Instant) -> ScheduleEntry {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        ScheduleEntry {
            plugin: self.descriptor.id.clone(),
            interval: self.descriptor.interval,
            next_fire_time: next_tick_after(self.first_tick, self.descriptor.interval, now),
            running: state.running,
            runs: state.runs,
            dropped_ticks: state.dropped_ticks,
            last_outcome: state.last_outcome,
        }
    }
}

/// The first tick of a schedule starting at `first_tick` that lies strictly after `now`.
fn next_tick_after(first_tick: Instant, interval: Duration, now: Instant) -> Instant {
    if now < first_tick {
        return first_tick;
    }
    let elapsed_ticks = (now - first_tick).as_nanos() / interval.as_nanos().max(1);
    first_tick + interval * (elapsed_ticks as u32 + 1)
}

pub struct Scheduler {
    runner: Arc<dyn PluginRunner>,
    cache: ResultCache,
    evt_send: UnboundedSender<DaemonCommand>,
    options: SchedulerOptions,
    handles: HashMap<PluginId, PluginHandle>,
}

impl Scheduler {
    pub fn new(
        runner: Arc<dyn PluginRunner>,
        cache: ResultCache,
        evt_send: UnboundedSender<DaemonCommand>,
        options: SchedulerOptions,
    ) -> Self {
        Scheduler { runner, cache, evt_send, options, handles: HashMap::new() }
    }

    /// Start running a plugin on its schedule.
    /// This is idempotent: starting a plugin that is already scheduled does nothing.
    pub fn start(&mut self, descriptor: Arc<PluginDescriptor>) {
        if self.handles.contains_key(&descriptor.id) {
            return;
        }
        log::debug!("Scheduling plugin {} every {:?}", descriptor.id, descriptor.interval);

        let first_tick = if self.options.run_on_start { Instant::now() } else { Instant::now() + descriptor.interval };
        let cancellation_token = CancellationToken::new();
        let (refresh_send, refresh_recv) = mpsc::channel(1);
        let state = Arc::new(Mutex::new(ScheduleState::default()));
        self.cache.register(&descriptor.id, descriptor.interval);

        let task = PluginTask {
            descriptor: descriptor.clone(),
            runner: self.runner.clone(),
            cache: self.cache.clone(),
            evt_send: self.evt_send.clone(),
            partial_output: self.options.partial_output,
            state: state.clone(),
        };
        tokio::spawn(task.run_schedule(first_tick, cancellation_token.clone(), refresh_recv));

        self.handles.insert(
            descriptor.id.clone(),
            PluginHandle { descriptor, first_tick, cancellation_token, refresh_send, state },
        );
    }

    /// Stop scheduling a plugin, killing it if it is running right now.
    pub fn stop(&mut self, id: &PluginId) -> bool {
        match self.handles.remove(id) {
            Some(handle) => {
                log::debug!("Stopped scheduling plugin {}", id);
                handle.cancellation_token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&mut self) {
        log::debug!("Stopping all plugin schedules");
        self.handles.drain().for_each(|(_, handle)| handle.cancellation_token.cancel());
    }

    /// Change the options for plugins started from now on.
    pub fn set_options(&mut self, options: SchedulerOptions) {
        self.options = options;
    }

    /// Run a plugin now, outside of its schedule.
    pub fn refresh(&self, id: &PluginId) -> RefreshOutcome {
        let Some(handle) = self.handles.get(id) else { return RefreshOutcome::Unknown };
        let state = handle.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.running {
            log::debug!("Ignoring refresh of {}, it is already running", id);
            return RefreshOutcome::AlreadyRunning;
        }
        match handle.refresh_send.try_send(()) {
            // A full channel means a refresh is already pending, which serves this request as well.
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => RefreshOutcome::Triggered,
            Err(mpsc::error::TrySendError::Closed(())) => RefreshOutcome::Unknown,
        }
    }

    pub fn entry(&self, id: &PluginId) -> Option<ScheduleEntry> {
        self.handles.get(id).map(|handle| handle.entry(Instant::now()))
    }

    /// The state of all scheduled plugins, sorted by identifier.
    pub fn entries(&self) -> Vec<ScheduleEntry> {
        let now = Instant::now();
        let mut entries: Vec<_> = self.handles.values().map(|handle| handle.entry(now)).collect();
        entries.sort_by(|a, b| a.plugin.cmp(&b.plugin));
        entries
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// Everything the task of a single plugin needs.
struct PluginTask {
    descriptor: Arc<PluginDescriptor>,
    runner: Arc<dyn PluginRunner>,
    cache: ResultCache,
    evt_send: UnboundedSender<DaemonCommand>,
    partial_output: PartialOutputPolicy,
    state: Arc<Mutex<ScheduleState>>,
}

impl PluginTask {
    async fn run_schedule(self, first_tick: Instant, cancellation_token: CancellationToken, mut refresh_recv: mpsc::Receiver<()>) {
        let mut next_tick = first_tick;

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep_until(next_tick) => {
                    match self.run_once(&cancellation_token).await {
                        Some(finished) => next_tick = self.drop_ticks(next_tick + self.descriptor.interval, finished),
                        None => break,
                    }
                }
                Some(()) = refresh_recv.recv() => {
                    log::debug!("Refreshing plugin {}", self.descriptor.id);
                    match self.run_once(&cancellation_token).await {
                        Some(finished) => next_tick = self.drop_ticks(next_tick, finished),
                        None => break,
                    }
                    // requests that arrived during the run were already answered with AlreadyRunning
                    while refresh_recv.try_recv().is_ok() {}
                }
            }
        }
        log::debug!("Schedule of plugin {} ended", self.descriptor.id);
    }

    /// Count the ticks from `next_tick` up to (excluding) `finished` as dropped, and return the first tick that is left.
    /// A tick falling exactly on the end of a run is not dropped.
    fn drop_ticks(&self, next_tick: Instant, finished: Instant) -> Instant {
        if finished <= next_tick {
            return next_tick;
        }
        let interval = self.descriptor.interval.as_nanos().max(1);
        let missed = (finished - next_tick).as_nanos().saturating_sub(1) / interval + 1;
        log::debug!("Plugin {} was still running, dropping {} tick(s)", self.descriptor.id, missed);
        self.state.lock().unwrap_or_else(PoisonError::into_inner).dropped_ticks += missed as u64;
        next_tick + Duration::from_nanos((missed * interval) as u64)
    }

    /// Run the plugin once and store the result. Returns when the run finished, or `None` if it was cancelled.
    async fn run_once(&self, cancellation_token: &CancellationToken) -> Option<Instant> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).running = true;

        let result = tokio::select! {
            _ = cancellation_token.cancelled() => None,
            result = self.runner.run(self.descriptor.clone()) => Some(result),
        };
        let Some(result) = result else {
            log::debug!("Run of plugin {} was cancelled", self.descriptor.id);
            self.state.lock().unwrap_or_else(PoisonError::into_inner).running = false;
            return None;
        };

        let outcome = self.cache.record(&result, self.partial_output);
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = false;
            state.runs += 1;
            state.last_outcome = Some(outcome);
        }
        crate::print_result_err!(
            "while notifying the app about a plugin update",
            self.evt_send.send(DaemonCommand::PluginUpdated(self.descriptor.id.clone()))
        );
        Some(Instant::now())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cache::FailureKind,
        config::plugin_descriptor::test::write_script,
        sandbox::{self, ExecutionResult, Sandbox, SandboxLimits},
    };
    use crossbar_protocol::Status;
    use futures::future::{BoxFuture, FutureExt};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pretends to run plugins, taking a fixed amount of (simulated) time per run.
    #[derive(Clone, Default)]
    struct FakeRunner {
        run_time: Duration,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
        starts: Arc<Mutex<Vec<(PluginId, Instant)>>>,
    }

    impl FakeRunner {
        fn taking(run_time: Duration) -> Self {
            FakeRunner { run_time, ..Default::default() }
        }

        fn starts_of(&self, id: &str) -> usize {
            self.starts.lock().unwrap().iter().filter(|(plugin, _)| plugin.as_str() == id).count()
        }
    }

    impl PluginRunner for FakeRunner {
        fn run(&self, descriptor: Arc<PluginDescriptor>) -> BoxFuture<'static, ExecutionResult> {
            let this = self.clone();
            async move {
                this.starts.lock().unwrap().push((descriptor.id.clone(), Instant::now()));
                let active = this.active.fetch_add(1, Ordering::SeqCst) + 1;
                this.max_active.fetch_max(active, Ordering::SeqCst);
                let _active = ActiveGuard(this.active.clone());
                tokio::time::sleep(this.run_time).await;
                ExecutionResult {
                    plugin: descriptor.id.clone(),
                    exit_code: 0,
                    stdout: format!("{} | color=green", descriptor.name).into_bytes(),
                    stderr: Vec::new(),
                    stdout_truncated: false,
                    stderr_truncated: false,
                    duration: this.run_time,
                    timestamp: chrono::Utc::now(),
                    timed_out: false,
                }
            }
            .boxed()
        }
    }

    /// Marks a fake run as finished, even when it gets cancelled.
    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn descriptor(id: &str, interval: Duration) -> Arc<PluginDescriptor> {
        let path = std::path::PathBuf::from("/plugins").join(id);
        Arc::new(PluginDescriptor {
            id: PluginId::from(id),
            name: id.split('.').next().unwrap().to_string(),
            interval,
            working_dir: path.parent().unwrap().to_path_buf(),
            path,
            timeout: Duration::from_secs(10),
            env: Default::default(),
        })
    }

    fn scheduler(runner: impl PluginRunner + 'static, options: SchedulerOptions) -> (Scheduler, ResultCache, mpsc::UnboundedReceiver<DaemonCommand>) {
        let cache = ResultCache::new();
        let (evt_send, evt_recv) = mpsc::unbounded_channel();
        (Scheduler::new(Arc::new(runner), cache.clone(), evt_send, options), cache, evt_recv)
    }

    #[tokio::test(start_paused = true)]
    async fn test_plugins_run_on_their_own_intervals() {
        let runner = FakeRunner::taking(Duration::ZERO);
        let (mut scheduler, cache, _evt_recv) = scheduler(runner.clone(), SchedulerOptions::default());
        scheduler.start(descriptor("clock.1s.sh", Duration::from_secs(1)));
        scheduler.start(descriptor("weather.5m.sh", Duration::from_secs(300)));

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(5, runner.starts_of("clock.1s.sh"));
        assert_eq!(0, runner.starts_of("weather.5m.sh"));
        assert_eq!("clock", cache.get(&PluginId::from("clock.1s.sh")).unwrap().model.unwrap().title.text);
        assert!(cache.get(&PluginId::from("weather.5m.sh")).unwrap().is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_on_start() {
        let runner = FakeRunner::taking(Duration::ZERO);
        let options = SchedulerOptions { run_on_start: true, ..Default::default() };
        let (mut scheduler, _cache, _evt_recv) = scheduler(runner.clone(), options);
        scheduler.start(descriptor("weather.5m.sh", Duration::from_secs(300)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(1, runner.starts_of("weather.5m.sh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_during_a_run_are_dropped() {
        let runner = FakeRunner::taking(Duration::from_millis(2500));
        let (mut scheduler, _cache, _evt_recv) = scheduler(runner.clone(), SchedulerOptions::default());
        let start = Instant::now();
        scheduler.start(descriptor("slow.1s.sh", Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(10500)).await;
        let starts: Vec<Duration> = runner.starts.lock().unwrap().iter().map(|(_, at)| *at - start).collect();
        assert_eq!(vec![1, 4, 7, 10], starts.iter().map(|d| d.as_secs()).collect::<Vec<_>>());
        assert_eq!(1, runner.max_active.load(Ordering::SeqCst));

        let entry = scheduler.entry(&PluginId::from("slow.1s.sh")).unwrap();
        assert!(entry.running);
        assert_eq!(3, entry.runs);
        assert_eq!(6, entry.dropped_ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_at_the_end_of_a_run_is_kept() {
        let runner = FakeRunner::taking(Duration::from_secs(3));
        let (mut scheduler, _cache, _evt_recv) = scheduler(runner.clone(), SchedulerOptions::default());
        let start = Instant::now();
        scheduler.start(descriptor("slow.1s.sh", Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(8500)).await;
        let starts: Vec<u64> = runner.starts.lock().unwrap().iter().map(|(_, at)| (*at - start).as_secs()).collect();
        assert_eq!(vec![1, 4, 7], starts);

        let entry = scheduler.entry(&PluginId::from("slow.1s.sh")).unwrap();
        assert_eq!(2, entry.runs);
        assert_eq!(4, entry.dropped_ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_never_overlaps() {
        let runner = FakeRunner::taking(Duration::from_secs(2));
        let (mut scheduler, _cache, _evt_recv) = scheduler(runner.clone(), SchedulerOptions::default());
        let id = PluginId::from("slow.10s.sh");
        scheduler.start(descriptor("slow.10s.sh", Duration::from_secs(10)));

        assert_eq!(RefreshOutcome::Triggered, scheduler.refresh(&id));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(scheduler.entry(&id).unwrap().running);
        for _ in 0..5 {
            assert_eq!(RefreshOutcome::AlreadyRunning, scheduler.refresh(&id));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(RefreshOutcome::Triggered, scheduler.refresh(&id));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(2, runner.starts_of("slow.10s.sh"));
        assert_eq!(1, runner.max_active.load(Ordering::SeqCst));
        assert_eq!(RefreshOutcome::Unknown, scheduler.refresh(&PluginId::from("missing.1s.sh")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let runner = FakeRunner::taking(Duration::from_secs(5));
        let (mut scheduler, _cache, _evt_recv) = scheduler(runner.clone(), SchedulerOptions::default());
        let id = PluginId::from("twice.1s.sh");
        scheduler.start(descriptor("twice.1s.sh", Duration::from_secs(1)));
        scheduler.start(descriptor("twice.1s.sh", Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(1, runner.starts_of("twice.1s.sh"));
        assert_eq!(1, runner.active.load(Ordering::SeqCst));

        assert!(scheduler.stop(&id));
        assert!(!scheduler.stop(&id));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(0, runner.active.load(Ordering::SeqCst));
        assert_eq!(1, runner.starts_of("twice.1s.sh"));
        assert!(scheduler.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_runs_notify_the_app() {
        let runner = FakeRunner::taking(Duration::from_millis(10));
        let (mut scheduler, _cache, mut evt_recv) = scheduler(runner, SchedulerOptions::default());
        scheduler.start(descriptor("clock.1s.sh", Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let mut updated = Vec::new();
        while let Ok(DaemonCommand::PluginUpdated(id)) = evt_recv.try_recv() {
            updated.push(id);
        }
        assert_eq!(vec![PluginId::from("clock.1s.sh"), PluginId::from("clock.1s.sh")], updated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_fire_time() {
        let (mut scheduler, _cache, _evt_recv) = scheduler(FakeRunner::taking(Duration::ZERO), SchedulerOptions::default());
        let start = Instant::now();
        scheduler.start(descriptor("clock.2s.sh", Duration::from_secs(2)));
        assert_eq!(start + Duration::from_secs(2), scheduler.entries()[0].next_fire_time);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let entry = &scheduler.entries()[0];
        assert_eq!(start + Duration::from_secs(6), entry.next_fire_time);
        assert_eq!(2, entry.runs);
        assert_eq!(Some(RunOutcome::Success), entry.last_outcome);
    }

    #[tokio::test]
    async fn test_timed_out_plugin_is_killed_and_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "hang.1s.sh", "echo started\nsleep 30");
        let mut descriptor = sandbox::test::descriptor(&path, Duration::from_millis(300));
        descriptor.interval = Duration::from_secs(60);
        let id = descriptor.id.clone();

        let options = SchedulerOptions { run_on_start: true, partial_output: PartialOutputPolicy::Keep };
        let (mut scheduler, cache, mut evt_recv) = scheduler(Sandbox::new(SandboxLimits { max_output_bytes: 1024 }), options);
        scheduler.start(Arc::new(descriptor));

        let update = tokio::time::timeout(Duration::from_secs(5), evt_recv.recv()).await.unwrap();
        assert!(matches!(update, Some(DaemonCommand::PluginUpdated(updated)) if updated == id));
        let entry = cache.get(&id).unwrap();
        assert_eq!(Status::Failed, entry.status);
        assert_eq!(FailureKind::Timeout, entry.failure.unwrap().kind);
        assert_eq!(None, entry.model);
        assert_eq!(Some(RunOutcome::Failed), scheduler.entry(&id).unwrap().last_outcome);
    }
}
