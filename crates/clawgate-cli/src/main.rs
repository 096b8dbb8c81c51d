use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use clawgate_core::logging::{self, LogConfig, LogFormat};
use clawgate_core::{ClientConfig, ConnectionState, GatewayClient, RetryPolicy, Subscription};
use colored::Colorize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

// ── Global flags ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    /// Path to a config.toml file (default: ~/.clawgate/config.toml)
    #[arg(short = 'c', long, value_name = "PATH", env = "CLAWGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Gateway WebSocket URL (ws://…)
    #[arg(long, value_name = "WS_URL", global = true)]
    url: Option<String>,

    /// Gateway auth token
    #[arg(long, value_name = "TOKEN", global = true)]
    token: Option<String>,

    /// Seconds to wait for each response (0 waits forever)
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    /// More log output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable coloured terminal output (also when NO_COLOR is set)
    #[arg(long = "no-color", action = ArgAction::SetTrue, global = true)]
    no_color: bool,
}

impl CommonArgs {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::resolve(self.config.clone())
            .context("failed to load gateway configuration")?;
        if let Some(url) = &self.url {
            config.url = url.clone();
        }
        if let Some(token) = &self.token {
            config.auth_token = token.clone();
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        Ok(config)
    }

    fn color_disabled(&self, no_color_env: Option<OsString>) -> bool {
        self.no_color || no_color_env.is_some_and(|value| !value.is_empty())
    }

    fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::from_env().verbosity(self.verbose);
        if let Some(format) = self.log_format {
            config.format = format.into();
        }
        config
    }
}

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "clawgate",
    version,
    about = "clawgate: talk to an OpenClaw gateway from the terminal"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect, complete the handshake and report the result
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },
    /// Send one request and print the response body
    Call {
        /// Method name; `folder:function` is accepted for `folder.function`
        method: String,
        /// Request params as a JSON document
        #[arg(long, short, value_name = "JSON", default_value = "{}")]
        params: String,
    },
    /// Print events as JSON lines until interrupted, reconnecting as needed
    Watch {
        /// Event names to subscribe to
        #[arg(required = true, value_name = "EVENT")]
        events: Vec<String>,
        /// Give up after this many failed connects in a row (0 = never)
        #[arg(long, value_name = "N", default_value_t = 0)]
        max_attempts: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.common.color_disabled(std::env::var_os("NO_COLOR")) {
        colored::control::set_override(false);
    }
    logging::init(cli.common.log_config());

    let config = cli.common.client_config()?;
    let client = GatewayClient::new(config).context("invalid gateway configuration")?;

    let outcome = match cli.command {
        Command::Status { json } => status(&client, json).await,
        Command::Call { method, params } => call(&client, &method, &params).await,
        Command::Watch {
            events,
            max_attempts,
        } => watch(&client, &events, RetryPolicy::bounded(max_attempts)).await,
    };
    client.close();
    outcome
}

// ── Commands ────────────────────────────────────────────────────────────────

async fn status(client: &GatewayClient, json: bool) -> Result<()> {
    let config = client.config();
    let result = client.connect().await;
    if json {
        let report = serde_json::json!({
            "url": config.url,
            "connected": result.is_ok(),
            "protocol": { "min": config.protocol.min, "max": config.protocol.max },
            "role": config.role,
            "hello": client.hello(),
            "error": result.as_ref().err().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{:>10} {}", "Gateway".bold(), config.url);
        println!(
            "{:>10} {}..={}",
            "Protocol".bold(),
            config.protocol.min,
            config.protocol.max
        );
        println!("{:>10} {}", "Role".bold(), config.role);
        match &result {
            Ok(()) => println!("{:>10} {}", "Status".bold(), "connected".green()),
            Err(err) => println!("{:>10} {} ({err})", "Status".bold(), "unreachable".red()),
        }
    }
    result.with_context(|| format!("handshake with {} failed", config.url))
}

async fn call(client: &GatewayClient, method: &str, params: &str) -> Result<()> {
    let params: Value = serde_json::from_str(params).context("--params is not valid JSON")?;
    let method = normalize_method(method);
    let body = client
        .request(&method, params)
        .await
        .with_context(|| format!("{method} failed"))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

async fn watch(client: &GatewayClient, events: &[String], policy: RetryPolicy) -> Result<()> {
    let subscriptions: Vec<Subscription> = events
        .iter()
        .map(|event| {
            let name = event.clone();
            client.subscribe(event.as_str(), move |payload: &Value| {
                let line = serde_json::json!({ "event": name, "payload": payload });
                println!("{line}");
            })
        })
        .collect();

    let outcome = tokio::select! {
        outcome = stay_connected(client, &policy) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };
    for subscription in subscriptions {
        let _ = subscription.unsubscribe();
    }
    outcome
}

/// Keep the client connected, backing off between failed connects and
/// before every reconnect that follows a drop.
async fn stay_connected(client: &GatewayClient, policy: &RetryPolicy) -> Result<()> {
    let mut states = client.state_changes();
    let mut failures = 0u32;
    // Drops of connections that did not stay up for `policy.stable_after`.
    let mut flaps = 0u32;
    loop {
        match client.connect().await {
            Ok(()) => {
                if failures > 0 {
                    info!(failures, "reconnected to gateway");
                }
                failures = 0;
                let opened_at = Instant::now();
                eprintln!("{} {}", "connected".green(), client.config().url);
                states
                    .wait_for(|state| *state != ConnectionState::Open)
                    .await
                    .context("client state channel closed")?;

                let uptime = opened_at.elapsed();
                flaps = if policy.is_stable(uptime) { 0 } else { flaps + 1 };
                let delay = policy.delay_for(flaps.max(1));
                eprintln!("{}", "connection lost".yellow());
                warn!(?uptime, flaps, ?delay, "connection lost, reconnecting");
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                failures += 1;
                if !policy.should_retry(failures) {
                    bail!("giving up after {failures} failed connects: {err}");
                }
                let delay = policy.delay_for(failures + flaps);
                warn!(error = %err, attempt = failures, ?delay, "connect failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `folder:function` → `folder.function`.
fn normalize_method(method: &str) -> String {
    method.replace(':', ".")
}
