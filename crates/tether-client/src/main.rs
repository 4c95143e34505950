use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::{process::ExitCode, time::Duration};
use tether_client::{new_request_id, resolve_hub_url, ClientOptions, HubClient};
use tether_core::{
    agent_execute_prompt, agent_stop_execution, aituber_text, execute_js, AgentExecutePromptPayload,
    AgentStopExecutionPayload, AituberTextPayload, Envelope, Role,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tether", about = "Talk to a tether hub as a hook, command or avatar client")]
struct Args {
    #[arg(long, default_value = "")]
    url: String,
    /// Client id to register as; derived per subcommand when empty.
    #[arg(long, default_value = "")]
    id: String,
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward a hook notification to the avatar.
    Hook {
        #[arg(long)]
        event: String,
        /// Falls back to `TETHER_CONVERSATION_ID`.
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long)]
        emotion: Option<String>,
        text: Vec<String>,
    },
    /// Send a prompt to the editor's agent.
    Prompt {
        #[arg(long, default_value = "")]
        agent_id: String,
        #[arg(long, default_value = "editor")]
        to: String,
        /// Wait for the editor's result and print it.
        #[arg(long, default_value_t = false)]
        wait: bool,
        prompt: Vec<String>,
    },
    /// Stop the editor agent's current run.
    Stop {
        #[arg(long, default_value = "")]
        agent_id: String,
        #[arg(long, default_value = "editor")]
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Run a script in an editor client and print its result.
    Exec {
        #[arg(long, default_value = "editor")]
        to: String,
        #[arg(long)]
        conversation_id: Option<String>,
        code: String,
    },
    /// Register and print every envelope received, one JSON object per line.
    Listen {
        #[arg(long, value_delimiter = ',', default_value = "aituber_client,command_client")]
        roles: Vec<String>,
        #[arg(long, default_value_t = 15)]
        heartbeat_seconds: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    match run(Args::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("tether: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let level = std::env::var("TETHER_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(args: Args) -> Result<ExitCode> {
    let url = resolve_hub_url(&args.url)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let options = |default_id: String, roles: Vec<Role>| {
        let id = if args.id.trim().is_empty() {
            default_id
        } else {
            args.id.clone()
        };
        let mut options = ClientOptions::new(url.clone(), id, roles);
        options.timeout = timeout;
        options
    };

    match &args.command {
        Command::Hook {
            event,
            conversation_id,
            emotion,
            text,
        } => {
            let conversation_id = conversation_id.clone().or_else(|| {
                std::env::var("TETHER_CONVERSATION_ID")
                    .ok()
                    .filter(|value| !value.trim().is_empty())
            });
            let default_id = match &conversation_id {
                Some(conversation) => format!("hook-{conversation}"),
                None => format!("hook-{}", std::process::id()),
            };
            let mut opts = options(default_id, vec![Role::AgentHook]);
            opts.conversation_id.clone_from(&conversation_id);
            let mut client = HubClient::connect(opts).await.context("connect to hub")?;
            let payload = AituberTextPayload {
                text: text.join(" "),
                emotion: emotion.clone(),
                event_type: Some(event.clone()),
                conversation_id,
                ..AituberTextPayload::default()
            };
            let id = client.id().to_string();
            client.send(&aituber_text(&id, &payload)).await?;
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Prompt {
            agent_id,
            to,
            wait,
            prompt,
        } => {
            let client = command_client(options(default_command_id(), vec![Role::CommandClient]))
                .await?;
            let payload = AgentExecutePromptPayload {
                agent_id: agent_id.clone(),
                prompt: prompt.join(" "),
                options: None,
                request_id: (*wait).then(new_request_id),
                extra: Default::default(),
            };
            let id = client.id().to_string();
            let envelope = agent_execute_prompt(&id, to, &payload);
            finish(client, envelope, *wait).await
        }
        Command::Stop {
            agent_id,
            to,
            reason,
        } => {
            let client = command_client(options(default_command_id(), vec![Role::CommandClient]))
                .await?;
            let payload = AgentStopExecutionPayload {
                agent_id: agent_id.clone(),
                reason: reason.clone(),
                request_id: Some(new_request_id()),
                extra: Default::default(),
            };
            let id = client.id().to_string();
            let envelope = agent_stop_execution(&id, to, &payload);
            finish(client, envelope, true).await
        }
        Command::Exec {
            to,
            conversation_id,
            code,
        } => {
            let client = command_client(options(default_command_id(), vec![Role::CommandClient]))
                .await?;
            let id = client.id().to_string();
            let mut envelope = execute_js(&id, to, code, &new_request_id());
            if let Some(conversation_id) = conversation_id {
                envelope
                    .set_payload_field("conversation_id", Value::from(conversation_id.as_str()));
            }
            finish(client, envelope, true).await
        }
        Command::Listen {
            roles,
            heartbeat_seconds,
        } => {
            let roles = roles
                .iter()
                .map(|label| label.parse::<Role>())
                .collect::<Result<Vec<_>, _>>()
                .context("parse --roles")?;
            if roles.is_empty() {
                bail!("--roles must name at least one role");
            }
            let opts = options(format!("listen-{}", std::process::id()), roles);
            listen(opts, Duration::from_secs((*heartbeat_seconds).max(1))).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn default_command_id() -> String {
    format!("cli-{}", std::process::id())
}

async fn command_client(options: ClientOptions) -> Result<HubClient> {
    HubClient::connect(options).await.context("connect to hub")
}

/// Sends `envelope`; with `wait`, prints the correlated reply and maps its
/// `success` flag to the exit code.
async fn finish(mut client: HubClient, envelope: Envelope, wait: bool) -> Result<ExitCode> {
    if !wait {
        client.send(&envelope).await?;
        client.close().await;
        return Ok(ExitCode::SUCCESS);
    }
    let reply = client.request(&envelope).await.context("wait for reply")?;
    client.close().await;
    println!("{}", serde_json::to_string(&reply.payload)?);
    let success = reply.payload.get("success").and_then(Value::as_bool) == Some(true);
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn listen(options: ClientOptions, heartbeat: Duration) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        // Retries until the hub answers; only a rejected registration ends the loop.
        let mut client = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            connected = HubClient::connect_with_retry(options.clone(), 0) => {
                connected.context("register with hub")?
            }
        };
        info!(event = "listening", client_id = %client.id());

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    client.close().await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Err(err) = client.heartbeat().await {
                        warn!(event = "heartbeat_failed", error = %err);
                        break;
                    }
                }
                received = client.recv() => match received {
                    Ok(envelope) => println!("{}", serde_json::to_string(&envelope)?),
                    Err(err) => {
                        warn!(event = "hub_disconnected", error = %err);
                        break;
                    }
                },
            }
        }
    }
}
