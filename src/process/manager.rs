//! Bounded-concurrency process supervisor.
//!
//! `update()` starts pending processes in insertion order while fewer than
//! `max_concurrency` are running. Apart from a failed start, every query
//! derives its answer from each process's own status. A process whose
//! `start()` errors without ever reporting itself started is settled by the
//! manager and never retried.
//! `wait()` is a cooperative poll loop, and `then()` turns the group into a
//! [`ProcessPromise`] whose reducers run left to right once all have exited.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Process, ProcessError, ProcessOutput};

pub const DEFAULT_MAX_CONCURRENCY: usize = 7;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A process and the name it was registered under.
#[derive(Debug)]
pub struct ManagedProcess<P> {
    pub name: String,
    pub process: P,
    /// Set when `start()` failed and the process never reported itself started
    pub start_error: Option<String>,
}

impl<P: Process> ManagedProcess<P> {
    fn is_pending(&self) -> bool {
        self.start_error.is_none() && !self.process.is_started()
    }

    /// Exited, or settled because it could not be started.
    pub fn has_exited(&self) -> bool {
        self.start_error.is_some() || (self.process.is_started() && self.process.is_terminated())
    }

    /// The process output, or a failure carrying the start error.
    pub fn output(&self) -> Option<ProcessOutput> {
        self.process
            .output()
            .or_else(|| self.start_error.clone().map(ProcessOutput::failed))
    }
}

#[derive(Debug)]
pub struct ProcessManager<P> {
    processes: Vec<ManagedProcess<P>>,
    max_concurrency: usize,
    poll_interval: Duration,
    started_at: Option<DateTime<Utc>>,
}

impl<P: Process> Default for ProcessManager<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Process> ProcessManager<P> {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            started_at: None,
        }
    }

    /// Values below 1 are treated as 1.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Register a process. Unnamed processes are named by their index.
    pub fn add(&mut self, process: P, name: Option<String>) -> Result<(), ProcessError> {
        let name = name.unwrap_or_else(|| self.processes.len().to_string());
        if self.get(&name).is_some() {
            return Err(ProcessError::DuplicateName(name));
        }
        self.processes.push(ManagedProcess {
            name,
            process,
            start_error: None,
        });
        Ok(())
    }

    /// Start pending processes until the concurrency ceiling is reached.
    pub fn update(&mut self) {
        let mut running = self.running().count();

        for managed in self.processes.iter_mut() {
            if running >= self.max_concurrency {
                break;
            }
            if !managed.is_pending() {
                continue;
            }

            self.started_at.get_or_insert_with(Utc::now);

            match managed.process.start() {
                Ok(()) => debug!(process = %managed.name, "process started"),
                Err(e) => {
                    warn!(process = %managed.name, error = %e, "process failed to start");
                    if !managed.process.is_started() {
                        managed.start_error = Some(e.to_string());
                    }
                }
            }
            if managed.process.is_running() {
                running += 1;
            }
        }
    }

    /// Poll until every process has terminated.
    pub async fn wait(&mut self) {
        loop {
            self.update();
            if self.has_finished() {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// True once every registered process has exited or failed to start.
    pub fn has_finished(&self) -> bool {
        self.processes.iter().all(ManagedProcess::has_exited)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ManagedProcess<P>> {
        self.processes.iter().filter(|m| m.is_pending())
    }

    pub fn running(&self) -> impl Iterator<Item = &ManagedProcess<P>> {
        self.processes.iter().filter(|m| m.process.is_running())
    }

    pub fn terminated(&self) -> impl Iterator<Item = &ManagedProcess<P>> {
        self.processes.iter().filter(|m| m.has_exited())
    }

    /// Number of processes currently running.
    pub fn active(&self) -> usize {
        self.running().count()
    }

    /// Number of processes that have terminated.
    pub fn completed(&self) -> usize {
        self.terminated().count()
    }

    pub fn get(&self, name: &str) -> Option<&ManagedProcess<P>> {
        self.processes.iter().find(|m| m.name == name)
    }

    pub fn processes(&self) -> &[ManagedProcess<P>] {
        &self.processes
    }

    /// When the first process of the group was started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Register the first reducer; it receives the whole group.
    pub fn then<T, F>(self, reducer: F) -> ProcessPromise<P, T>
    where
        F: FnOnce(Vec<ManagedProcess<P>>) -> T + Send + 'static,
    {
        ProcessPromise {
            manager: self,
            reducer: Box::new(reducer),
        }
    }
}

/// A process group plus the reducer chain to apply once it has finished.
pub struct ProcessPromise<P, T> {
    manager: ProcessManager<P>,
    reducer: Box<dyn FnOnce(Vec<ManagedProcess<P>>) -> T + Send>,
}

impl<P: Process + 'static, T: 'static> ProcessPromise<P, T> {
    /// Chain a reducer fed with the previous reducer's output.
    pub fn then<U, F>(self, reducer: F) -> ProcessPromise<P, U>
    where
        F: FnOnce(T) -> U + Send + 'static,
    {
        let previous = self.reducer;
        ProcessPromise {
            manager: self.manager,
            reducer: Box::new(move |group| reducer(previous(group))),
        }
    }

    pub fn manager(&self) -> &ProcessManager<P> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ProcessManager<P> {
        &mut self.manager
    }

    /// Wait for the group, then fold it through the reducers.
    pub async fn resolve(mut self) -> T {
        self.manager.wait().await;
        (self.reducer)(self.manager.processes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::process::ProcessOutput;

    /// Runs from `start` until its flag is raised.
    struct FakeProcess {
        started: bool,
        done: Arc<AtomicBool>,
    }

    impl FakeProcess {
        fn new() -> (Self, Arc<AtomicBool>) {
            let done = Arc::new(AtomicBool::new(false));
            (
                Self {
                    started: false,
                    done: Arc::clone(&done),
                },
                done,
            )
        }

        fn instant() -> Self {
            Self {
                started: false,
                done: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl Process for FakeProcess {
        fn start(&mut self) -> Result<(), ProcessError> {
            self.started = true;
            Ok(())
        }
        fn is_started(&self) -> bool {
            self.started
        }
        fn is_terminated(&self) -> bool {
            self.started && self.done.load(Ordering::SeqCst)
        }
        fn output(&self) -> Option<ProcessOutput> {
            self.is_terminated().then(ProcessOutput::default)
        }
        fn pid(&self) -> Option<u32> {
            None
        }
    }

    #[test]
    fn test_update_respects_concurrency_ceiling() {
        let mut manager = ProcessManager::new().with_max_concurrency(3);
        let mut flags = Vec::new();
        for _ in 0..10 {
            let (process, done) = FakeProcess::new();
            manager.add(process, None).unwrap();
            flags.push(done);
        }

        manager.update();
        assert_eq!(manager.active(), 3);
        assert_eq!(manager.pending().count(), 7);
        assert!(manager.started_at().is_some());
        let first_start = manager.started_at();

        manager.update();
        assert_eq!(manager.active(), 3);

        flags[0].store(true, Ordering::SeqCst);
        flags[2].store(true, Ordering::SeqCst);
        manager.update();
        assert_eq!(manager.active(), 3);
        assert_eq!(manager.completed(), 2);
        assert_eq!(manager.pending().count(), 5);
        assert_eq!(manager.started_at(), first_start);

        // Insertion order: indexes 3 and 4 were started next.
        let running: Vec<&str> = manager.running().map(|m| m.name.as_str()).collect();
        assert_eq!(running, vec!["1", "3", "4"]);
    }

    #[test]
    fn test_has_finished_only_when_all_terminated() {
        let mut manager = ProcessManager::new().with_max_concurrency(1);
        let (a, done_a) = FakeProcess::new();
        let (b, done_b) = FakeProcess::new();
        manager.add(a, Some("a".to_string())).unwrap();
        manager.add(b, Some("b".to_string())).unwrap();

        assert!(!manager.has_finished());
        done_a.store(true, Ordering::SeqCst);
        done_b.store(true, Ordering::SeqCst);
        // b has not been started yet, so it is still pending.
        assert!(!manager.has_finished());

        manager.update();
        manager.update();
        assert!(manager.has_finished());
        assert_eq!(manager.completed(), 2);
    }

    /// Fails every start without ever reporting itself started.
    struct NeverStarts;

    impl Process for NeverStarts {
        fn start(&mut self) -> Result<(), ProcessError> {
            Err(ProcessError::NoRuntime)
        }
        fn is_started(&self) -> bool {
            false
        }
        fn is_terminated(&self) -> bool {
            false
        }
        fn output(&self) -> Option<ProcessOutput> {
            None
        }
        fn pid(&self) -> Option<u32> {
            None
        }
    }

    #[tokio::test]
    async fn test_failed_start_is_settled_not_retried() {
        let mut manager: ProcessManager<Box<dyn Process>> = ProcessManager::new()
            .with_poll_interval(Duration::from_millis(1));
        manager.add(Box::new(NeverStarts), Some("broken".to_string())).unwrap();
        manager.add(Box::new(FakeProcess::instant()), Some("ok".to_string())).unwrap();

        tokio::time::timeout(Duration::from_millis(300), manager.wait())
            .await
            .unwrap();

        assert!(manager.has_finished());
        assert_eq!(manager.pending().count(), 0);
        assert_eq!(manager.completed(), 2);

        let broken = manager.get("broken").unwrap();
        assert!(broken.start_error.as_deref().unwrap().contains("tokio runtime"));
        let output = broken.output().unwrap();
        assert!(!output.success());
        assert_eq!(output.failure, broken.start_error);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut manager = ProcessManager::new();
        manager.add(FakeProcess::instant(), Some("x".to_string())).unwrap();
        assert!(matches!(
            manager.add(FakeProcess::instant(), Some("x".to_string())),
            Err(ProcessError::DuplicateName(ref name)) if name == "x"
        ));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_empty_group_has_finished() {
        let manager: ProcessManager<FakeProcess> = ProcessManager::new();
        assert!(manager.has_finished());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_folds_reducers_left_to_right() {
        let mut manager = ProcessManager::new()
            .with_max_concurrency(2)
            .with_poll_interval(Duration::from_millis(1));
        for _ in 0..5 {
            manager.add(FakeProcess::instant(), None).unwrap();
        }

        let result = manager
            .then(|group| group.iter().map(|m| m.name.clone()).collect::<Vec<_>>())
            .then(|names| names.join(","))
            .then(|joined| format!("[{}]", joined))
            .resolve()
            .await;

        assert_eq!(result, "[0,1,2,3,4]");
    }

    #[tokio::test]
    async fn test_wait_drives_processes_to_completion() {
        let mut manager = ProcessManager::new()
            .with_max_concurrency(1)
            .with_poll_interval(Duration::from_millis(1));
        let (slow, done) = FakeProcess::new();
        manager.add(slow, None).unwrap();
        manager.add(FakeProcess::instant(), None).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.store(true, Ordering::SeqCst);
        });

        manager.wait().await;
        assert!(manager.has_finished());
        assert_eq!(manager.pending().count(), 0);
    }
}
