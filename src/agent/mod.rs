//! The orchestrator: composes lanes, log, skills, memory, tools, events and
//! the loop; owns per-run cancellation handles, steering queues, and
//! subagent spawning.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::compaction::{compact_history, estimate_history_tokens};
use crate::context::{default_layers, load_context_section};
use crate::events::{EventBus, EventStream};
use crate::heartbeat::{HeartbeatRunner, HeartbeatRunnerConfig, HeartbeatTask, WakeRequest};
use crate::lanes::LaneScheduler;
use crate::memory::MemoryStore;
use crate::providers::ModelProvider;
use crate::session::{
    is_subagent_key, normalize_agent_id, resolve_session_key, subagent_key, SessionLog,
};
use crate::skills::{load_skills, rewrite_input, SkillSet};
use crate::tool_policy::{SandboxFlags, ToolPolicy};
use crate::tools::{Tool, ToolRegistry};
use crate::types::{Message, RunOutcome};

mod main_loop;
mod system_prompt;

pub use main_loop::{run_agent_loop, LoopDeps};
pub use system_prompt::build_system_prompt;

/// Runs refuse below this estimated-token budget.
pub const HARD_TOKEN_FLOOR: usize = 4096;
/// Below this the agent warns but proceeds.
pub const SOFT_TOKEN_FLOOR: usize = 16384;

const SUBAGENT_SUMMARY_MAX_CHARS: usize = 600;

/// Per-session queues of steering messages, drained by the loop between
/// tool executions. Owned by session key, not by run.
#[derive(Default)]
pub struct SteeringQueues {
    inner: Mutex<HashMap<String, Vec<String>>>,
}

impl SteeringQueues {
    pub fn push(&self, session_key: &str, text: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(session_key.to_string())
            .or_default()
            .push(text.to_string());
    }

    pub fn has_pending(&self, session_key: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(session_key).is_some_and(|q| !q.is_empty())
    }

    pub fn drain(&self, session_key: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(session_key).unwrap_or_default()
    }
}

/// Live run handles, keyed by run id. Mirrors a token registry: cancelling a
/// run cascades into its stream and tools.
#[derive(Default)]
struct RunRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl RunRegistry {
    fn register(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_string(), token.clone());
        token
    }

    fn remove(&self, run_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
    }

    fn cancel(&self, run_id: Option<&str>) -> usize {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        match run_id {
            Some(id) => tokens.get(id).map_or(0, |t| {
                t.cancel();
                1
            }),
            None => {
                for token in tokens.values() {
                    token.cancel();
                }
                tokens.len()
            }
        }
    }

    fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct AgentOptions {
    pub agent_id: String,
    pub workspace: PathBuf,
    pub model: String,
    /// Identity fragment of the system prompt.
    pub system_prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub max_turns: u32,
    pub max_concurrent_runs: usize,
    /// Soft target for the working message list, in estimated tokens.
    pub token_budget: usize,
    pub tool_policy: ToolPolicy,
    pub sandbox: SandboxFlags,
    pub global_lane: String,
}

impl AgentOptions {
    pub fn new(agent_id: &str, workspace: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            workspace: workspace.into(),
            model: "claude-sonnet-4-5".to_string(),
            system_prompt: "You are a capable personal agent. Be direct and concise.".to_string(),
            max_tokens: 4096,
            temperature: None,
            max_turns: 24,
            max_concurrent_runs: 2,
            token_budget: 120_000,
            tool_policy: ToolPolicy::allow_all(),
            sandbox: SandboxFlags::default(),
            global_lane: "main".to_string(),
        }
    }
}

pub struct Agent {
    opts: AgentOptions,
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    skills: SkillSet,
    log: SessionLog,
    memory: MemoryStore,
    lanes: Arc<LaneScheduler>,
    events: Arc<EventBus>,
    runs: RunRegistry,
    steering: SteeringQueues,
}

impl Agent {
    /// Construct with an explicit tool set (filtered by the policy). Most
    /// callers start from [`crate::tools::builtin_tools`] and append extras.
    pub fn new(
        mut opts: AgentOptions,
        provider: Arc<dyn ModelProvider>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> anyhow::Result<Self> {
        opts.agent_id = normalize_agent_id(&opts.agent_id);
        if opts.token_budget < SOFT_TOKEN_FLOOR {
            warn!(
                budget = opts.token_budget,
                soft_floor = SOFT_TOKEN_FLOOR,
                "Token budget below the soft floor; expect aggressive pruning"
            );
        }

        let registry = ToolRegistry::new(tools, &opts.tool_policy);
        let skills = load_skills(dirs::home_dir().as_deref(), &opts.workspace);
        let log = SessionLog::in_workspace(&opts.workspace);
        let memory = MemoryStore::in_workspace(&opts.workspace)?;

        info!(
            agent_id = %opts.agent_id,
            model = %opts.model,
            tools = registry.names().len(),
            skills = skills.entries.len(),
            "Agent initialized"
        );

        Ok(Self {
            opts,
            provider,
            tools: registry,
            skills,
            log,
            memory,
            lanes: LaneScheduler::new(),
            events: EventBus::new(),
            runs: RunRegistry::default(),
            steering: SteeringQueues::default(),
        })
    }

    #[allow(dead_code)]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn session_log(&self) -> &SessionLog {
        &self.log
    }

    pub fn agent_id(&self) -> &str {
        &self.opts.agent_id
    }

    /// Number of live (registered) runs.
    pub fn live_runs(&self) -> usize {
        self.runs.len()
    }

    /// Queue a steering message for a session; the loop picks it up between
    /// tool executions.
    #[allow(dead_code)]
    pub fn steer(&self, session: &str, text: &str) {
        let key = resolve_session_key(&self.opts.agent_id, session);
        info!(session_key = %key, "Steering message queued");
        self.steering.push(&key, text);
    }

    /// Cancel one run, or all of them. Returns how many were signalled.
    #[allow(dead_code)]
    pub fn abort(&self, run_id: Option<&str>) -> usize {
        let count = self.runs.cancel(run_id);
        info!(count, "Abort signalled");
        count
    }

    /// One user-initiated invocation: session lane → global lane → loop.
    pub async fn run(&self, session: &str, input: &str) -> anyhow::Result<RunOutcome> {
        self.run_with_preamble(session, input, None).await
    }

    async fn run_with_preamble(
        &self,
        session: &str,
        input: &str,
        preamble: Option<&str>,
    ) -> anyhow::Result<RunOutcome> {
        if self.opts.token_budget < HARD_TOKEN_FLOOR {
            anyhow::bail!(
                "token budget {} is below the hard floor {}",
                self.opts.token_budget,
                HARD_TOKEN_FLOOR
            );
        }

        let key = resolve_session_key(&self.opts.agent_id, session);
        let session_lane = format!("session:{key}");
        self.lanes
            .enqueue(&session_lane, 1, || async {
                self.lanes
                    .enqueue(&self.opts.global_lane, self.opts.max_concurrent_runs, || async {
                        self.execute(&key, input, preamble).await
                    })
                    .await
            })
            .await
    }

    /// The admitted run body: lifecycle events bracket the loop, the
    /// cancellation handle lives exactly as long as the run.
    async fn execute(
        &self,
        session_key: &str,
        input: &str,
        preamble: Option<&str>,
    ) -> anyhow::Result<RunOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let cancel = self.runs.register(&run_id);

        self.events.emit(
            &run_id,
            EventStream::Lifecycle,
            Some(session_key),
            Some(&self.opts.agent_id),
            json!({"phase": "start", "input_chars": input.len()}),
        );

        let result = self
            .execute_steps(session_key, &run_id, input, preamble, &cancel)
            .await;

        match &result {
            Ok(outcome) => {
                self.events.emit(
                    &run_id,
                    EventStream::Lifecycle,
                    Some(session_key),
                    Some(&self.opts.agent_id),
                    json!({
                        "phase": "end",
                        "turns": outcome.turns,
                        "tool_calls": outcome.tool_calls,
                    }),
                );
            }
            Err(e) => {
                self.events.emit(
                    &run_id,
                    EventStream::Lifecycle,
                    Some(session_key),
                    Some(&self.opts.agent_id),
                    json!({"phase": "error", "error": e.to_string()}),
                );
            }
        }

        self.runs.remove(&run_id);
        result
    }

    async fn execute_steps(
        &self,
        session_key: &str,
        run_id: &str,
        input: &str,
        preamble: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RunOutcome> {
        // History, then the (possibly rewritten) user message.
        let mut messages = self.log.load(session_key)?;

        let mut text = match self.skills.resolve_input(input) {
            Some(invocation) => {
                info!(session_key, skill = %invocation.skill_name, "Slash command matched");
                rewrite_input(&invocation)
            }
            None => input.to_string(),
        };
        if let Some(preamble) = preamble {
            text = format!("{preamble}\n\n{text}");
        }

        let user_msg = Message::user_text(text);
        self.log.append(session_key, &user_msg)?;
        messages.push(user_msg);

        // Whole-history compaction when the estimate exceeds the budget.
        if estimate_history_tokens(&messages) > self.opts.token_budget {
            let outcome = compact_history(
                &self.provider,
                &self.opts.model,
                &messages,
                self.opts.token_budget,
                cancel,
            )
            .await;
            messages = outcome.messages;
        }

        // System prompt: identity + context files + skills + memory.
        let context_section = load_context_section(&default_layers(&self.opts.workspace));
        let memories = {
            let hits = self.memory.search(input, 5);
            if hits.is_empty() {
                self.memory.recent(3)
            } else {
                hits
            }
        };
        let system_prompt = build_system_prompt(
            &self.opts.system_prompt,
            &context_section,
            &self.skills.render_prompt_fragment(),
            &memories,
        );

        let deps = LoopDeps {
            provider: &self.provider,
            tools: &self.tools,
            events: &self.events,
            log: &self.log,
            steering: &self.steering,
            session_key,
            agent_id: &self.opts.agent_id,
            run_id,
            system_prompt: &system_prompt,
            model: &self.opts.model,
            max_tokens: self.opts.max_tokens,
            temperature: self.opts.temperature,
            max_turns: self.opts.max_turns,
            token_budget: self.opts.token_budget,
            cancel,
        };

        run_agent_loop(&deps, messages).await
    }

    /// Launch a child run on a derived session key without awaiting it; the
    /// child's summary lands in the parent's log when it completes.
    /// Subagents cannot themselves spawn subagents.
    #[allow(dead_code)]
    pub fn spawn_subagent(
        self: &Arc<Self>,
        parent_session: &str,
        task: &str,
    ) -> anyhow::Result<String> {
        let parent_key = resolve_session_key(&self.opts.agent_id, parent_session);
        if is_subagent_key(&parent_key) {
            anyhow::bail!("subagents cannot spawn subagents");
        }
        let child_key = subagent_key(&self.opts.agent_id);

        self.events.emit(
            &child_key,
            EventStream::Subagent,
            Some(&parent_key),
            Some(&self.opts.agent_id),
            json!({"phase": "spawned", "child": child_key, "task_chars": task.len()}),
        );

        let agent = self.clone();
        let task = task.to_string();
        let parent = parent_key.clone();
        let child = child_key.clone();
        tokio::spawn(async move {
            let result = agent.run(&child, &task).await;
            let summary = match &result {
                Ok(outcome) if !outcome.text.trim().is_empty() => outcome.text.clone(),
                Ok(_) => "(no output)".to_string(),
                Err(e) => format!("(subagent failed: {e})"),
            };
            let truncated: String = summary.chars().take(SUBAGENT_SUMMARY_MAX_CHARS).collect();
            let message = Message::user_text(format!("[subagent summary]\n{truncated}"));

            // The parent write goes through the parent's session lane.
            let lane = format!("session:{parent}");
            let append = agent
                .lanes
                .enqueue(&lane, 1, || async { agent.log.append(&parent, &message) })
                .await;
            if let Err(e) = append {
                warn!(parent_key = %parent, error = %e, "Failed to write subagent summary");
            }
            agent.events.emit(
                &child,
                EventStream::Subagent,
                Some(&parent),
                Some(&agent.opts.agent_id),
                json!({"phase": "completed", "child": child, "ok": result.is_ok()}),
            );
        });

        Ok(child_key)
    }

    /// Heartbeat entry point: decorate the run input with the pending task
    /// list and execute on the dedicated heartbeat session.
    pub async fn run_heartbeat(
        &self,
        tasks: Vec<HeartbeatTask>,
        request: WakeRequest,
    ) -> Option<String> {
        let mut preamble = format!("Heartbeat check (reason: {}).", request.reason.as_str());
        if !tasks.is_empty() {
            preamble.push_str("\nPending tasks:\n");
            for task in &tasks {
                preamble.push_str(&format!("{}. {}\n", task.line, task.description));
            }
        }
        let input = "Work through the pending heartbeat tasks. When one is finished, check it \
                     off with the complete_task tool, passing its line number.";

        match self
            .run_with_preamble("heartbeat", input, Some(&preamble))
            .await
        {
            Ok(outcome) if !outcome.text.trim().is_empty() => Some(outcome.text),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Heartbeat run failed");
                None
            }
        }
    }
}

/// Wire a heartbeat runner to an agent: the beat handler drives
/// [`Agent::run_heartbeat`], output lands in the heartbeat session log, and
/// user runs in flight defer the beat.
pub fn build_heartbeat_runner(
    agent: &Arc<Agent>,
    config: HeartbeatRunnerConfig,
) -> Arc<HeartbeatRunner> {
    let mut runner = HeartbeatRunner::new(config);

    let handler_agent = agent.clone();
    runner.add_handler(move |tasks, request| {
        let agent = handler_agent.clone();
        async move { agent.run_heartbeat(tasks, request).await }
    });

    let gate_agent = agent.clone();
    runner.set_busy_gate(Arc::new(move || gate_agent.live_runs() > 0));

    Arc::new(runner)
}
