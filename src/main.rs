mod agent;
mod compaction;
mod config;
mod context;
mod errors;
mod events;
mod heartbeat;
mod lanes;
mod memory;
mod providers;
mod session;
mod skills;
mod tool_policy;
mod tools;
mod types;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use agent::{build_heartbeat_runner, Agent, AgentOptions};
use config::{load_config, AppConfig};
use heartbeat::{parse_active_hours, HeartbeatRunnerConfig};
use providers::AnthropicProvider;
use types::ContentBlock;

fn print_help() {
    println!("mini-agent {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: mini-agent [chat] [--agent <id>] [session-id]\n");
    println!("Environment:");
    println!("  ANTHROPIC_API_KEY        API key for the default provider (required)");
    println!("  OPENCLAW_MINI_AGENT_ID   Fallback agent id\n");
    println!("Interactive commands:");
    println!("  /help /reset /history /sessions /quit /exit");
}

struct CliArgs {
    agent_id: Option<String>,
    session_id: Option<String>,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut agent_id = None;
    let mut session_id = None;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "chat" => {}
            "--agent" => {
                agent_id = Some(
                    iter.next()
                        .ok_or_else(|| "--agent requires a value".to_string())?
                        .clone(),
                );
            }
            flag if flag.starts_with('-') => {
                return Err(format!("unknown flag: {flag}"));
            }
            positional => {
                if session_id.is_none() {
                    session_id = Some(positional.to_string());
                } else {
                    return Err(format!("unexpected argument: {positional}"));
                }
            }
        }
    }
    Ok(CliArgs {
        agent_id,
        session_id,
    })
}

fn agent_options(config: &AppConfig, agent_id: &str, workspace: PathBuf) -> AgentOptions {
    let mut opts = AgentOptions::new(agent_id, workspace);
    opts.model = config.agent.model.clone();
    opts.max_turns = config.agent.max_turns;
    opts.max_concurrent_runs = config.agent.max_concurrent_runs;
    opts.token_budget = config.agent.token_budget;
    opts.max_tokens = config.agent.max_tokens;
    opts.temperature = config.agent.temperature;
    opts.tool_policy = config.tools.clone();
    opts.sandbox = config.sandbox;
    opts
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    if raw_args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    if raw_args.iter().any(|a| a == "--version" || a == "-V") {
        println!("mini-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let cli = match parse_args(&raw_args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}\n");
            print_help();
            std::process::exit(2);
        }
    };

    let workspace = std::env::current_dir()?;
    let config = load_config(&workspace.join("config.toml"))?;

    let agent_id = cli
        .agent_id
        .or_else(|| config.agent.id.clone())
        .or_else(|| std::env::var("OPENCLAW_MINI_AGENT_ID").ok())
        .unwrap_or_else(|| "agent".to_string());
    let session_id = cli.session_id.unwrap_or_else(|| "main".to_string());

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY is required"))?;
    let provider = Arc::new(AnthropicProvider::new(&api_key));

    let opts = agent_options(&config, &agent_id, workspace.clone());
    let mut agent_tools = tools::builtin_tools(&workspace, config.sandbox);
    if config.heartbeat.enabled {
        agent_tools.push(Arc::new(tools::CompleteTaskTool::new(
            workspace.join(&config.heartbeat.tasks_file),
        )));
    }
    let agent = Arc::new(Agent::new(opts, provider, agent_tools)?);

    let heartbeat_runner = if config.heartbeat.enabled {
        let mut hb = HeartbeatRunnerConfig::new(
            workspace.join(&config.heartbeat.tasks_file),
            Duration::from_secs(config.heartbeat.interval_secs),
        );
        hb.coalesce_ms = config.heartbeat.coalesce_ms;
        hb.duplicate_window = Duration::from_secs(config.heartbeat.duplicate_window_hours * 3600);
        hb.active_hours = config
            .heartbeat
            .active_hours
            .as_deref()
            .and_then(parse_active_hours);
        let runner = build_heartbeat_runner(&agent, hb);
        runner.start();
        Some(runner)
    } else {
        None
    };

    println!(
        "mini-agent {} — agent '{}', session '{}'. /help for commands.",
        env!("CARGO_PKG_VERSION"),
        agent.agent_id(),
        session_id
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        match input {
            "/quit" | "/exit" => break,
            "/help" => {
                print_help();
                continue;
            }
            "/reset" => {
                let key = session::resolve_session_key(agent.agent_id(), &session_id);
                agent.session_log().clear(&key)?;
                println!("session cleared");
                continue;
            }
            "/history" => {
                let key = session::resolve_session_key(agent.agent_id(), &session_id);
                for message in agent.session_log().load(&key)? {
                    let role = match message.role {
                        types::Role::User => "user",
                        types::Role::Assistant => "assistant",
                    };
                    let text = message.text();
                    if !text.is_empty() {
                        println!("[{role}] {text}");
                    }
                    for block in &message.blocks {
                        if let ContentBlock::ToolUse { name, .. } = block {
                            println!("[{role}] -> tool: {name}");
                        }
                    }
                }
                continue;
            }
            "/sessions" => {
                for (key, count) in agent.session_log().list()? {
                    println!("{key}  ({count} messages)");
                }
                continue;
            }
            _ => {}
        }

        match agent.run(&session_id, input).await {
            Ok(outcome) => {
                println!("{}", outcome.text);
            }
            Err(e) => {
                eprintln!("error: {e}");
            }
        }
    }

    if let Some(runner) = heartbeat_runner {
        runner.stop();
    }
    Ok(())
}
