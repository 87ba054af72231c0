//! Connection probe for a Confab deployment.
//!
//! Operator tool: opens the realtime channel the way the full client does,
//! optionally sends one message, and prints what comes back. Useful to
//! verify a server's WebSocket endpoint and history surface without a
//! frontend in the loop.

use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use confab::protocol::{ChatMessage, MessageStatus};
use confab::{ChatClient, ClientConfig, HttpHistory};

const APP_NAME: &str = "confab";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_send(ctx: ProbeContext, cmd: SendCommand) -> Result<()> {
    handle_send(&ctx, cmd).await
}

#[tokio::main]
async fn async_watch(ctx: ProbeContext, cmd: WatchCommand) -> Result<()> {
    handle_watch(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = ProbeContext::new(cli.common.clone())?;
    ctx.init_logging();

    match cli.command {
        Command::Send(cmd) => async_send(ctx, cmd),
        Command::Watch(cmd) => async_watch(ctx, cmd),
        Command::Config => handle_config(&ctx),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Confab - realtime chat connection probe.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Override the WebSocket endpoint
    #[arg(long, value_name = "URL", global = true)]
    url: Option<String>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one message and print the streamed response
    Send(SendCommand),
    /// Tail connection state and incoming messages
    Watch(WatchCommand),
    /// Output the effective configuration
    Config,
}

#[derive(Debug, Clone, Args)]
struct SendCommand {
    /// Message text
    #[arg(value_name = "TEXT")]
    message: String,
    /// Conversation to attach to
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,
    /// Seconds to wait for the response to finish
    #[arg(long, default_value = "60")]
    timeout: u64,
}

#[derive(Debug, Clone, Args)]
struct WatchCommand {
    /// Conversation to attach to
    #[arg(long, value_name = "ID")]
    conversation: Option<String>,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ProbeConfig {
    server: ServerConfig,
    channel: ChannelTuning,
    logging: LoggingConfig,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            channel: ChannelTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    /// WebSocket endpoint for the realtime channel.
    chat_url: String,
    /// Base URL of the history REST surface.
    history_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chat_url: "ws://127.0.0.1:4100/chat".to_string(),
            history_url: "http://127.0.0.1:4100/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ChannelTuning {
    max_reconnect_attempts: u32,
    ack_timeout_secs: u64,
    connect_timeout_secs: u64,
}

impl Default for ChannelTuning {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            ack_timeout_secs: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ProbeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: ProbeConfig,
}

impl ProbeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match &common.config {
            Some(path) => path.clone(),
            None => default_config_file()?,
        };
        let config = load_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) {
        let level = if self.common.quiet {
            LevelFilter::Error
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        };

        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();
    }

    fn chat_url(&self) -> String {
        self.common
            .url
            .clone()
            .unwrap_or_else(|| self.config.server.chat_url.clone())
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.chat_url());
        config.channel.max_reconnect_attempts = self.config.channel.max_reconnect_attempts;
        config.channel.ack_timeout = Duration::from_secs(self.config.channel.ack_timeout_secs);
        config.channel.connect_timeout =
            Duration::from_secs(self.config.channel.connect_timeout_secs);
        config
    }

    fn build_client(&self) -> ChatClient {
        let history = Arc::new(HttpHistory::new(self.config.server.history_url.clone()));
        ChatClient::new(self.client_config(), history)
    }
}

fn load_config(config_file: &std::path::Path) -> Result<ProbeConfig> {
    let built = Config::builder()
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("CONFAB").separator("__"))
        .build()
        .context("assembling configuration")?;
    built.try_deserialize().context("parsing configuration")
}

fn default_config_file() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME).join("config.toml"));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir.join("config.toml"));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME).join("config.toml"))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

// ============================================================================
// Commands
// ============================================================================

async fn handle_send(ctx: &ProbeContext, cmd: SendCommand) -> Result<()> {
    let client = ctx.build_client();
    client.connect().await;
    client
        .wait_until_connected(Duration::from_secs(
            ctx.config.channel.connect_timeout_secs,
        ))
        .await
        .context("waiting for connection")?;
    info!("connected to {}", ctx.chat_url());

    if let Some(conversation) = &cmd.conversation {
        client.select_conversation(conversation.clone()).await;
    }

    let receipt = client
        .send_message(&cmd.message)
        .await
        .context("sending message")?;
    info!(
        "message {} accepted, response {}",
        receipt.request_id, receipt.response_id
    );

    let store = client.store().clone();
    let mut revisions = store.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cmd.timeout);
    let mut printed = 0usize;

    loop {
        if let Some(message) = store.message(&receipt.response_id) {
            let content = &message.content;
            if content.len() > printed && content.is_char_boundary(printed) {
                print!("{}", &content[printed..]);
                io::stdout().flush().ok();
                printed = content.len();
            }
            if message.status.is_settled() {
                println!();
                if message.status == MessageStatus::Error {
                    let reason = message
                        .meta_str("error")
                        .unwrap_or("unknown error")
                        .to_string();
                    client.shutdown().await;
                    return Err(anyhow!("response failed: {reason}"));
                }
                info!("response complete ({printed} chars)");
                break;
            }
        }

        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                client.shutdown().await;
                return Err(anyhow!("response did not finish within {}s", cmd.timeout));
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn handle_watch(ctx: &ProbeContext, cmd: WatchCommand) -> Result<()> {
    let client = ctx.build_client();
    client.connect().await;

    if let Some(conversation) = &cmd.conversation {
        client.select_conversation(conversation.clone()).await;
    }

    let store = client.store().clone();
    let mut states = WatchStream::new(client.state_changes());
    let mut revisions = WatchStream::new(store.subscribe());
    let mut seen = 0usize;

    println!("watching {} (ctrl-c to stop)", ctx.chat_url());
    loop {
        tokio::select! {
            Some(state) = states.next() => {
                println!("-- connection {state}");
            }
            Some(_) = revisions.next() => {
                let snapshot = store.snapshot();
                if snapshot.messages.len() < seen {
                    println!("-- history replaced ({} messages)", snapshot.messages.len());
                    seen = 0;
                }
                for message in snapshot.messages.iter().skip(seen) {
                    print_message(message);
                }
                seen = snapshot.messages.len();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.shutdown().await;
    Ok(())
}

fn handle_config(ctx: &ProbeContext) -> Result<()> {
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
        );
    } else {
        println!("# config file: {}", ctx.config_file.display());
        println!("{:#?}", ctx.config);
    }
    Ok(())
}

fn print_message(message: &ChatMessage) {
    let time = message.created_at.format("%H:%M:%S");
    println!(
        "[{time}] {} ({}): {}",
        message.role, message.status, message.content
    );
}
