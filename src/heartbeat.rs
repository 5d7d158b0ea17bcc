//! Heartbeat: the self-initiated invocation subsystem.
//!
//! Two cooperating pieces: [`HeartbeatWake`] coalesces wake requests into
//! single executions (double-buffering requests that arrive mid-run), and
//! [`HeartbeatRunner`] owns the interval schedule, the active-hours gate,
//! the task-file parser, and duplicate-output suppression. The runner's
//! timer only ever issues a wake request, so every execution flows through
//! the coalescer.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Local, Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Why a wake was requested. Later variants outrank earlier ones when
/// requests merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WakeReason {
    Requested,
    Retry,
    Interval,
    #[allow(dead_code)]
    Cron,
    Exec,
}

impl WakeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WakeReason::Requested => "requested",
            WakeReason::Retry => "retry",
            WakeReason::Interval => "interval",
            WakeReason::Cron => "cron",
            WakeReason::Exec => "exec",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WakeRequest {
    pub reason: WakeReason,
    pub source: Option<String>,
}

/// What one heartbeat execution reported back.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatStatus {
    Ran { text: Option<String> },
    Skipped { reason: String },
}

pub const SKIP_REQUESTS_IN_FLIGHT: &str = "requests-in-flight";
pub const SKIP_OUTSIDE_ACTIVE_HOURS: &str = "outside-active-hours";
pub const SKIP_NO_PENDING_TASKS: &str = "no-pending-tasks";
pub const SKIP_DUPLICATE_OUTPUT: &str = "duplicate-output";

pub type WakeHandler =
    Arc<dyn Fn(WakeRequest) -> Pin<Box<dyn Future<Output = HeartbeatStatus> + Send>> + Send + Sync>;

const DEFAULT_COALESCE_MS: u64 = 250;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Default)]
struct WakeState {
    running: bool,
    scheduled: bool,
    timer: Option<JoinHandle<()>>,
    pending_reason: Option<WakeReason>,
    pending_source: Option<String>,
}

/// Coalesces wake requests: bursts within `coalesce_ms` collapse into one
/// execution; a request arriving during an execution buys exactly one
/// follow-up execution, never N.
pub struct HeartbeatWake {
    coalesce_ms: u64,
    retry_delay_ms: u64,
    handler: WakeHandler,
    state: Mutex<WakeState>,
}

impl HeartbeatWake {
    #[allow(dead_code)]
    pub fn new(handler: WakeHandler) -> Arc<Self> {
        Self::with_delays(DEFAULT_COALESCE_MS, DEFAULT_RETRY_DELAY_MS, handler)
    }

    pub fn with_delays(coalesce_ms: u64, retry_delay_ms: u64, handler: WakeHandler) -> Arc<Self> {
        Arc::new(Self {
            coalesce_ms,
            retry_delay_ms,
            handler,
            state: Mutex::new(WakeState::default()),
        })
    }

    /// Record a wake request. Reasons merge by priority; the source follows
    /// the winning reason.
    pub fn request(self: &Arc<Self>, reason: WakeReason, source: Option<&str>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let merged = state.pending_reason.map_or(reason, |r| r.max(reason));
        if state.pending_source.is_none() || reason >= merged {
            state.pending_source = source.map(str::to_string);
        }
        state.pending_reason = Some(merged);

        if state.running {
            state.scheduled = true;
            return;
        }
        if state.timer.is_some() {
            return; // coalesced into the armed timer
        }
        state.timer = Some(self.arm(self.coalesce_ms));
    }

    fn arm(self: &Arc<Self>, delay_ms: u64) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            this.fire().await;
        })
    }

    async fn fire(self: Arc<Self>) {
        let request = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.timer = None;
            let reason = state.pending_reason.take().unwrap_or(WakeReason::Requested);
            let source = state.pending_source.take();
            state.running = true;
            WakeRequest { reason, source }
        };

        debug!(reason = request.reason.as_str(), "Heartbeat wake firing");
        let status = (self.handler)(request).await;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running = false;
        if state.scheduled {
            state.scheduled = false;
            state.timer = Some(self.arm(0));
        } else if matches!(&status, HeartbeatStatus::Skipped { reason } if reason == SKIP_REQUESTS_IN_FLIGHT)
        {
            let merged = state
                .pending_reason
                .map_or(WakeReason::Retry, |r| r.max(WakeReason::Retry));
            state.pending_reason = Some(merged);
            state.timer = Some(self.arm(self.retry_delay_ms));
        }
    }

    /// Clear any armed timer and the follow-up flag. Pending reasons survive
    /// so a later request still carries the merged priority.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.scheduled = false;
    }
}

/// Daily activity window in local-time minutes, `[start, end)`.
/// `end <= start` wraps past midnight (22:00–06:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub start_minutes: u32,
    pub end_minutes: u32,
}

impl ActiveHours {
    pub fn contains(&self, minutes_of_day: u32) -> bool {
        if self.end_minutes <= self.start_minutes {
            minutes_of_day >= self.start_minutes || minutes_of_day < self.end_minutes
        } else {
            minutes_of_day >= self.start_minutes && minutes_of_day < self.end_minutes
        }
    }
}

/// Parse `"HH:MM-HH:MM"`.
pub fn parse_active_hours(spec: &str) -> Option<ActiveHours> {
    let (start, end) = spec.split_once('-')?;
    Some(ActiveHours {
        start_minutes: parse_hhmm(start.trim())?,
        end_minutes: parse_hhmm(end.trim())?,
    })
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// One line of the heartbeat task file.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatTask {
    pub description: String,
    pub completed: bool,
    /// Original line text, kept for rewriting the file.
    #[allow(dead_code)]
    pub raw: String,
    /// 1-based line number in the file.
    pub line: usize,
}

/// Parse the markdown task list. Checkbox items carry their completed flag;
/// bare list items count as incomplete; headings and blanks are skipped.
pub fn parse_heartbeat_tasks(text: &str) -> Vec<HeartbeatTask> {
    let mut tasks = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw_line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(item) = trimmed.strip_prefix("- ") else {
            continue;
        };
        let bytes = item.as_bytes();
        let (completed, description) =
            if bytes.len() >= 3 && bytes[0] == b'[' && bytes[2] == b']' {
                let flag = bytes[1].eq_ignore_ascii_case(&b'x');
                (flag, item[3..].trim().to_string())
            } else {
                (false, item.trim().to_string())
            };
        tasks.push(HeartbeatTask {
            description,
            completed,
            raw: raw_line.to_string(),
            line,
        });
    }
    tasks
}

/// Mark the task at the given 1-based line as done by replacing the first
/// `[ ]` on that line with `[x]`. Returns the rewritten file content, or
/// `None` when the line has no open checkbox.
pub fn mark_task_done(content: &str, line: usize) -> Option<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let target = lines.get_mut(line.checked_sub(1)?)?;
    let pos = target.find("[ ]")?;
    target.replace_range(pos..pos + 3, "[x]");
    let mut out = lines.join("\n");
    if content.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

pub type TaskHandler = Arc<
    dyn Fn(Vec<HeartbeatTask>, WakeRequest) -> Pin<Box<dyn Future<Output = Option<String>> + Send>>
        + Send
        + Sync,
>;
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;
pub type BusyGate = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct HeartbeatRunnerConfig {
    pub tasks_path: PathBuf,
    pub interval: Duration,
    pub coalesce_ms: u64,
    pub active_hours: Option<ActiveHours>,
    pub duplicate_window: Duration,
}

impl HeartbeatRunnerConfig {
    pub fn new(tasks_path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            tasks_path: tasks_path.into(),
            interval,
            coalesce_ms: DEFAULT_COALESCE_MS,
            active_hours: None,
            duplicate_window: Duration::from_secs(24 * 3600),
        }
    }
}

struct RunnerState {
    last_run_at_ms: Option<i64>,
    next_due_ms: Option<i64>,
    last_text: Option<String>,
    last_text_at_ms: Option<i64>,
    timer: Option<JoinHandle<()>>,
}

/// Interval scheduler for heartbeat runs. Uses single-shot timers recomputed
/// from `last_run_at` so drift in one cycle does not accumulate.
pub struct HeartbeatRunner {
    config: HeartbeatRunnerConfig,
    handlers: Vec<TaskHandler>,
    sink: Option<OutputSink>,
    busy_gate: Option<BusyGate>,
    state: Mutex<RunnerState>,
    wake: Mutex<Option<Arc<HeartbeatWake>>>,
}

impl HeartbeatRunner {
    pub fn new(config: HeartbeatRunnerConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            sink: None,
            busy_gate: None,
            state: Mutex::new(RunnerState {
                last_run_at_ms: None,
                next_due_ms: None,
                last_text: None,
                last_text_at_ms: None,
                timer: None,
            }),
            wake: Mutex::new(None),
        }
    }

    /// Register a task handler. Handlers run sequentially on each beat.
    pub fn add_handler<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Vec<HeartbeatTask>, WakeRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.handlers
            .push(Arc::new(move |tasks, req| Box::pin(handler(tasks, req))));
    }

    /// Where non-duplicate output goes (a session log, a channel).
    pub fn set_output_sink(&mut self, sink: OutputSink) {
        self.sink = Some(sink);
    }

    /// When the gate reports busy, the beat skips with
    /// `requests-in-flight` and the wake retries shortly.
    pub fn set_busy_gate(&mut self, gate: BusyGate) {
        self.busy_gate = Some(gate);
    }

    /// Arm the coalescer and schedule the first run.
    pub fn start(self: &Arc<Self>) {
        let runner = self.clone();
        let wake = HeartbeatWake::with_delays(
            self.config.coalesce_ms,
            DEFAULT_RETRY_DELAY_MS,
            Arc::new(move |req| {
                let runner = runner.clone();
                Box::pin(async move { runner.run_once(req).await })
            }),
        );
        *self.wake.lock().unwrap_or_else(|e| e.into_inner()) = Some(wake);
        self.schedule_next();
        info!(
            interval_secs = self.config.interval.as_secs(),
            tasks_file = %self.config.tasks_path.display(),
            "Heartbeat runner started"
        );
    }

    /// Ask for an immediate beat (subject to coalescing).
    #[allow(dead_code)]
    pub fn request_now(&self, reason: WakeReason, source: Option<&str>) {
        let wake = self.wake.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match wake {
            Some(wake) => wake.request(reason, source),
            None => warn!("Heartbeat request before start; ignored"),
        }
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        drop(state);
        if let Some(wake) = self.wake.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            wake.stop();
        }
    }

    /// Arm the single-shot timer for `last_run_at + interval` (or now on the
    /// first run). The timer issues a wake request rather than executing.
    fn schedule_next(&self) {
        let now = Utc::now().timestamp_millis();
        let interval_ms = self.config.interval.as_millis() as i64;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let due = match state.last_run_at_ms {
            Some(last) => last + interval_ms,
            None => now,
        };
        let delay = (due - now).max(0) as u64;
        state.next_due_ms = Some(due);
        if let Some(old) = state.timer.take() {
            old.abort();
        }
        let wake = self.wake.lock().unwrap_or_else(|e| e.into_inner()).clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(wake) = wake {
                wake.request(WakeReason::Interval, Some("timer"));
            }
        }));
    }

    /// Push the next beat `interval` from now without touching
    /// `last_run_at`; used when a beat is gated out.
    fn schedule_backoff(&self) {
        let now = Utc::now().timestamp_millis();
        let interval_ms = self.config.interval.as_millis() as i64;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_due_ms = Some(now + interval_ms);
        if let Some(old) = state.timer.take() {
            old.abort();
        }
        let wake = self.wake.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let delay = interval_ms.max(0) as u64;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(wake) = wake {
                wake.request(WakeReason::Interval, Some("timer"));
            }
        }));
    }

    /// Execute one beat. Runs inside the coalescer's handler.
    pub async fn run_once(&self, request: WakeRequest) -> HeartbeatStatus {
        debug!(
            reason = request.reason.as_str(),
            source = request.source.as_deref().unwrap_or("-"),
            "Heartbeat beat"
        );

        // 1. Active-hours gate. last_run_at stays untouched.
        if let Some(hours) = self.config.active_hours {
            let now_local = Local::now();
            let minutes = now_local.hour() * 60 + now_local.minute();
            if !hours.contains(minutes) {
                debug!(minutes, "Heartbeat outside active hours");
                self.schedule_backoff();
                return HeartbeatStatus::Skipped {
                    reason: SKIP_OUTSIDE_ACTIVE_HOURS.to_string(),
                };
            }
        }

        // User work in flight wins over the heartbeat.
        if let Some(gate) = &self.busy_gate {
            if gate() {
                return HeartbeatStatus::Skipped {
                    reason: SKIP_REQUESTS_IN_FLIGHT.to_string(),
                };
            }
        }

        // 2. Parse the task file.
        let content = std::fs::read_to_string(&self.config.tasks_path).unwrap_or_default();
        let tasks = parse_heartbeat_tasks(&content);
        let pending: Vec<HeartbeatTask> =
            tasks.into_iter().filter(|t| !t.completed).collect();

        // 3. Nothing to do and nobody forced it.
        if pending.is_empty() && request.reason != WakeReason::Exec {
            self.commit_run(None);
            return HeartbeatStatus::Skipped {
                reason: SKIP_NO_PENDING_TASKS.to_string(),
            };
        }

        // 4. Dispatch.
        let mut texts = Vec::new();
        for handler in &self.handlers {
            if let Some(text) = handler(pending.clone(), request.clone()).await {
                if !text.trim().is_empty() {
                    texts.push(text);
                }
            }
        }
        let text = (!texts.is_empty()).then(|| texts.join("\n\n"));

        // 5. Duplicate suppression.
        if let Some(ref t) = text {
            let now = Utc::now().timestamp_millis();
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let duplicate = state
                .last_text
                .as_ref()
                .is_some_and(|last| last.trim() == t.trim())
                && state.last_text_at_ms.is_some_and(|at| {
                    now - at < self.config.duplicate_window.as_millis() as i64
                });
            drop(state);
            if duplicate {
                info!("Suppressing duplicate heartbeat output");
                self.commit_run(None);
                return HeartbeatStatus::Skipped {
                    reason: SKIP_DUPLICATE_OUTPUT.to_string(),
                };
            }
        }

        // 6. Commit and forward.
        if let (Some(t), Some(sink)) = (&text, &self.sink) {
            sink(t);
        }
        self.commit_run(text.clone());
        HeartbeatStatus::Ran { text }
    }

    fn commit_run(&self, text: Option<String>) {
        let now = Utc::now().timestamp_millis();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.last_run_at_ms = Some(now);
            if let Some(t) = text {
                state.last_text = Some(t);
                state.last_text_at_ms = Some(now);
            }
        }
        self.schedule_next();
    }

    pub fn last_run_at_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_run_at_ms
    }

    #[allow(dead_code)]
    pub fn next_due_ms(&self) -> Option<i64> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_due_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wake_reason_priority() {
        assert!(WakeReason::Exec > WakeReason::Cron);
        assert!(WakeReason::Cron > WakeReason::Interval);
        assert!(WakeReason::Interval > WakeReason::Retry);
        assert!(WakeReason::Retry > WakeReason::Requested);
    }

    #[test]
    fn test_active_hours_plain_window() {
        let hours = parse_active_hours("08:00-22:00").unwrap();
        assert!(!hours.contains(7 * 60 + 59));
        assert!(hours.contains(8 * 60));
        assert!(hours.contains(21 * 60 + 59));
        assert!(!hours.contains(22 * 60));
    }

    #[test]
    fn test_active_hours_wraps_midnight() {
        let hours = parse_active_hours("22:00-06:00").unwrap();
        assert!(hours.contains(23 * 60));
        assert!(hours.contains(0));
        assert!(hours.contains(5 * 60 + 59));
        assert!(!hours.contains(6 * 60));
        assert!(!hours.contains(12 * 60));
    }

    #[test]
    fn test_parse_active_hours_rejects_garbage() {
        assert!(parse_active_hours("8-22").is_none());
        assert!(parse_active_hours("25:00-26:00").is_none());
        assert!(parse_active_hours("nope").is_none());
    }

    #[test]
    fn test_parse_heartbeat_tasks() {
        let text = "# Tasks\n\n- [ ] water the plants\n- [x] take out trash\n- [X] call mom\n- loose item\nnot a task\n";
        let tasks = parse_heartbeat_tasks(text);
        assert_eq!(tasks.len(), 4);
        assert_eq!(tasks[0].description, "water the plants");
        assert!(!tasks[0].completed);
        assert_eq!(tasks[0].line, 3);
        assert!(tasks[1].completed);
        assert!(tasks[2].completed);
        assert_eq!(tasks[3].description, "loose item");
        assert!(!tasks[3].completed);
        assert_eq!(tasks[3].line, 6);
    }

    #[test]
    fn test_mark_task_done() {
        let text = "# Tasks\n- [ ] one\n- [ ] two\n";
        let updated = mark_task_done(text, 3).unwrap();
        assert_eq!(updated, "# Tasks\n- [ ] one\n- [x] two\n");
        // Already-done line has no open checkbox.
        assert!(mark_task_done(&updated, 3).is_none());
        assert!(mark_task_done(text, 99).is_none());
    }

    fn counting_handler(
        counter: Arc<AtomicUsize>,
        status: HeartbeatStatus,
    ) -> WakeHandler {
        Arc::new(move |_req| {
            let counter = counter.clone();
            let status = status.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status
            })
        })
    }

    #[tokio::test]
    async fn test_wake_coalesces_burst_into_one() {
        let count = Arc::new(AtomicUsize::new(0));
        let wake = HeartbeatWake::with_delays(
            30,
            1000,
            counting_handler(count.clone(), HeartbeatStatus::Ran { text: None }),
        );
        wake.request(WakeReason::Requested, Some("a"));
        wake.request(WakeReason::Interval, Some("b"));
        wake.request(WakeReason::Requested, Some("c"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wake_merges_reason_by_priority() {
        let seen: Arc<Mutex<Vec<WakeReason>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let wake = HeartbeatWake::with_delays(
            30,
            1000,
            Arc::new(move |req| {
                let seen = seen_clone.clone();
                Box::pin(async move {
                    seen.lock().unwrap().push(req.reason);
                    HeartbeatStatus::Ran { text: None }
                })
            }),
        );
        wake.request(WakeReason::Requested, None);
        wake.request(WakeReason::Exec, Some("manual"));
        wake.request(WakeReason::Interval, None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec![WakeReason::Exec]);
    }

    #[tokio::test]
    async fn test_wake_request_during_run_buys_one_follow_up() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let wake = HeartbeatWake::with_delays(
            10,
            1000,
            Arc::new(move |_req| {
                let count = count_clone.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    HeartbeatStatus::Ran { text: None }
                })
            }),
        );
        wake.request(WakeReason::Requested, None);
        tokio::time::sleep(Duration::from_millis(30)).await; // handler now running
        wake.request(WakeReason::Requested, None);
        wake.request(WakeReason::Requested, None);
        wake.request(WakeReason::Requested, None);
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Exactly one additional execution, not three.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wake_retries_after_requests_in_flight() {
        let reasons: Arc<Mutex<Vec<WakeReason>>> = Arc::new(Mutex::new(Vec::new()));
        let reasons_clone = reasons.clone();
        let wake = HeartbeatWake::with_delays(
            10,
            40,
            Arc::new(move |req| {
                let reasons = reasons_clone.clone();
                Box::pin(async move {
                    let mut lock = reasons.lock().unwrap();
                    lock.push(req.reason);
                    if lock.len() == 1 {
                        HeartbeatStatus::Skipped {
                            reason: SKIP_REQUESTS_IN_FLIGHT.to_string(),
                        }
                    } else {
                        HeartbeatStatus::Ran { text: None }
                    }
                })
            }),
        );
        wake.request(WakeReason::Requested, None);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = reasons.lock().unwrap().clone();
        assert_eq!(seen, vec![WakeReason::Requested, WakeReason::Retry]);
    }

    #[tokio::test]
    async fn test_wake_stop_clears_timer() {
        let count = Arc::new(AtomicUsize::new(0));
        let wake = HeartbeatWake::with_delays(
            50,
            1000,
            counting_handler(count.clone(), HeartbeatStatus::Ran { text: None }),
        );
        wake.request(WakeReason::Requested, None);
        wake.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    fn runner_with_tasks(
        dir: &tempfile::TempDir,
        tasks: &str,
        active_hours: Option<ActiveHours>,
    ) -> HeartbeatRunner {
        let path = dir.path().join("HEARTBEAT.md");
        std::fs::write(&path, tasks).unwrap();
        let mut config = HeartbeatRunnerConfig::new(path, Duration::from_secs(3600));
        config.active_hours = active_hours;
        HeartbeatRunner::new(config)
    }

    #[tokio::test]
    async fn test_runner_skips_empty_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner = runner_with_tasks(&dir, "- [x] done already\n", None);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        runner.add_handler(move |_tasks, _req| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Some("output".to_string())
            }
        });
        let runner = Arc::new(runner);

        let status = runner
            .run_once(WakeRequest {
                reason: WakeReason::Interval,
                source: None,
            })
            .await;
        assert_eq!(
            status,
            HeartbeatStatus::Skipped {
                reason: SKIP_NO_PENDING_TASKS.to_string()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(runner.last_run_at_ms().is_some());
    }

    #[tokio::test]
    async fn test_runner_exec_reason_overrides_empty_pending() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner = runner_with_tasks(&dir, "- [x] done already\n", None);
        runner.add_handler(|_tasks, _req| async move { Some("forced run".to_string()) });
        let runner = Arc::new(runner);

        let status = runner
            .run_once(WakeRequest {
                reason: WakeReason::Exec,
                source: Some("manual".into()),
            })
            .await;
        assert_eq!(
            status,
            HeartbeatStatus::Ran {
                text: Some("forced run".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_runner_passes_pending_tasks() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner =
            runner_with_tasks(&dir, "- [ ] water plants\n- [x] done\n- [ ] stretch\n", None);
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        runner.add_handler(move |tasks, _req| {
            let seen = seen_clone.clone();
            async move {
                let mut lock = seen.lock().unwrap();
                *lock = tasks.iter().map(|t| t.description.clone()).collect();
                None
            }
        });
        let runner = Arc::new(runner);

        let status = runner
            .run_once(WakeRequest {
                reason: WakeReason::Interval,
                source: None,
            })
            .await;
        assert_eq!(status, HeartbeatStatus::Ran { text: None });
        assert_eq!(*seen.lock().unwrap(), vec!["water plants", "stretch"]);
    }

    #[tokio::test]
    async fn test_runner_duplicate_suppression() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner = runner_with_tasks(&dir, "- [ ] repeat task\n", None);
        runner.add_handler(|_tasks, _req| async move { Some("same text  ".to_string()) });
        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_clone = delivered.clone();
        runner.set_output_sink(Arc::new(move |_text| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let runner = Arc::new(runner);

        let req = WakeRequest {
            reason: WakeReason::Interval,
            source: None,
        };
        let first = runner.run_once(req.clone()).await;
        assert!(matches!(first, HeartbeatStatus::Ran { text: Some(_) }));
        let second = runner.run_once(req).await;
        assert_eq!(
            second,
            HeartbeatStatus::Skipped {
                reason: SKIP_DUPLICATE_OUTPUT.to_string()
            }
        );
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        // last_run_at still advanced on the suppressed run.
        assert!(runner.last_run_at_ms().is_some());
    }

    #[tokio::test]
    async fn test_runner_busy_gate_reports_in_flight() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut runner = runner_with_tasks(&dir, "- [ ] pending\n", None);
        runner.add_handler(|_tasks, _req| async move { Some("should not run".to_string()) });
        runner.set_busy_gate(Arc::new(|| true));
        let runner = Arc::new(runner);

        let status = runner
            .run_once(WakeRequest {
                reason: WakeReason::Interval,
                source: None,
            })
            .await;
        assert_eq!(
            status,
            HeartbeatStatus::Skipped {
                reason: SKIP_REQUESTS_IN_FLIGHT.to_string()
            }
        );
        assert!(runner.last_run_at_ms().is_none());
    }
}
