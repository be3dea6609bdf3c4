use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use apiguard::config::ProtectionConfig;
use apiguard::context::RequestContext;
use apiguard::idempotency::Admission;
use apiguard::key::ProtectionKey;
use apiguard::{Protection, ProtectionError};

#[derive(Parser, Debug)]
#[command(name = "apiguard", version, about = "Operate API protection state on a configured store")]
struct Cli {
    /// YAML configuration file; APIGUARD__* environment variables override it
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// Who is making the simulated request.
#[derive(Args, Debug, Clone)]
struct Caller {
    /// Authenticated user id
    #[arg(long)]
    user: Option<String>,

    /// Client address
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Call arguments as a JSON array
    #[arg(long, default_value = "[]")]
    args: String,
}

impl Caller {
    fn context(&self) -> RequestContext {
        let mut ctx = RequestContext::new();
        if let Some(user) = &self.user {
            ctx = ctx.with_attribute("user", user);
        }
        if let Some(ip) = self.ip {
            ctx = ctx.with_peer(ip);
        }
        ctx
    }

    fn arguments(&self) -> anyhow::Result<Vec<Value>> {
        serde_json::from_str(&self.args).context("--args must be a JSON array")
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take rate limit permits for an operation
    Check {
        operation: String,
        #[command(flatten)]
        caller: Caller,
        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        times: u32,
    },
    /// Start an idempotent call and print its key
    Begin {
        operation: String,
        #[command(flatten)]
        caller: Caller,
    },
    /// Mark an idempotent call successful
    Complete {
        key: String,
        /// Result to replay to later callers
        #[arg(long)]
        payload: Option<String>,
    },
    /// Mark an idempotent call failed
    Fail {
        key: String,
        #[arg(long)]
        error: String,
    },
    /// Record a submission, rejecting duplicates
    Submit {
        operation: String,
        #[command(flatten)]
        caller: Caller,
    },
    /// Count live entries under a key prefix
    Count {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Drop an idempotency record
    Invalidate { key: String },
    /// Print the effective policy of an operation
    Policy { operation: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = ProtectionConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;
    debug!(backend = ?config.store.backend, "Configuration loaded");

    let protection = Protection::from_config(&config).await?;

    match run(&protection, cli.command).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => match e.downcast_ref::<ProtectionError>() {
            Some(rejection) if rejection.is_rejection() => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "rejected": rejection.to_string(),
                        "retry_after_ms": rejection.retry_after_ms(),
                    }))?
                );
                std::process::exit(2);
            }
            _ => Err(e),
        },
    }
}

async fn run(protection: &Protection, command: Command) -> anyhow::Result<Value> {
    let output = match command {
        Command::Check {
            operation,
            caller,
            times,
        } => {
            let ctx = caller.context();
            let mut decisions = Vec::with_capacity(times as usize);
            for _ in 0..times {
                decisions.push(protection.check_rate_limit(&operation, &ctx).await?);
            }
            serde_json::to_value(decisions)?
        }
        Command::Begin { operation, caller } => {
            let args = caller.arguments()?;
            let (key, admission) = protection
                .begin_idempotent(&operation, &caller.context(), &args)
                .await?;
            match admission {
                Admission::Execute => json!({ "key": key, "admission": "execute" }),
                Admission::Replay(payload) => {
                    json!({ "key": key, "admission": "replay", "payload": payload })
                }
            }
        }
        Command::Complete { key, payload } => {
            let settled = protection.complete(&ProtectionKey::new(key), payload).await?;
            json!({ "settled": settled })
        }
        Command::Fail { key, error } => {
            let settled = protection.fail(&ProtectionKey::new(key), &error).await?;
            json!({ "settled": settled })
        }
        Command::Submit { operation, caller } => {
            let args = caller.arguments()?;
            let key = protection.submit(&operation, &caller.context(), &args).await?;
            json!({ "key": key, "accepted": true })
        }
        Command::Count { pattern } => {
            json!({ "pattern": pattern, "count": protection.count(&pattern).await? })
        }
        Command::Invalidate { key } => {
            let removed = protection.invalidate(&ProtectionKey::new(key)).await?;
            json!({ "removed": removed })
        }
        Command::Policy { operation } => {
            let policy = protection.resolver().resolve(&operation).await?;
            info!(operation = %operation, source = ?policy.source, "Resolved policy");
            serde_json::to_value(policy)?
        }
    };
    Ok(output)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
