//! # Queue Bridge CLI
//!
//! Operator tool for Service Bus queues reached through queue-bridge.
//!
//! This module provides CLI commands for:
//! - Inspecting a connection string
//! - Showing and validating the resolved settings
//! - Sending a message
//! - Receiving messages with a pull-style receiver
//! - Running a listener until interrupted

use bytes::Bytes;
use clap::{CommandFactory, Parser, Subcommand};
use queue_bridge::config::redact_connection_string;
use queue_bridge::transport::http::rest_base_url;
use queue_bridge::{
    message_handler, BridgeSettings, CommunicationListener, ConfigurationError, HandlerError,
    HttpTransportConnector, Message, MessageActions, QueueClientFactory, QueueError, QueueListener, ReceiveMode,
    ReceivedMessage, ServiceBusConnection, TransportConnector,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// queue-bridge CLI - Service Bus queue client and listener
#[derive(Parser)]
#[command(name = "queue-bridge")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send, receive and listen on Service Bus queues")]
pub struct Cli {
    /// Settings file path
    #[arg(short, long, env = "QUEUE_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Parse a connection string and show what it resolves to
    Inspect {
        /// Connection string to inspect; defaults to the configured one
        #[arg(long)]
        connection_string: Option<String>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Send one message
    Send {
        /// Queue name; defaults to the configured queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Message body
        body: String,

        /// Content type of the body
        #[arg(long)]
        content_type: Option<String>,

        /// Application label
        #[arg(long)]
        label: Option<String>,

        /// Correlation identifier
        #[arg(long)]
        correlation_id: Option<String>,

        /// Custom property as key=value; may be repeated
        #[arg(short, long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Receive messages with a pull-style receiver
    Receive {
        /// Queue name; defaults to the configured queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Maximum number of messages
        #[arg(short, long, default_value = "1")]
        max_messages: usize,

        /// Seconds to wait for the first message
        #[arg(short, long, default_value = "5")]
        timeout: u64,

        /// Receive mode; defaults to the configured mode
        #[arg(long)]
        mode: Option<ReceiveModeArg>,

        /// Complete peek-locked messages after printing them
        #[arg(long)]
        complete: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Run a listener and print every delivered message
    Listen {
        /// Queue name; defaults to the configured queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Override the configured concurrency limit
        #[arg(long)]
        max_concurrent_calls: Option<usize>,

        /// Leave messages locked instead of completing them once printed
        #[arg(long)]
        no_complete: bool,

        /// Stop after this many messages
        #[arg(long)]
        max_messages: Option<usize>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Settings commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Settings subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the resolved settings with the key masked
    Show {
        /// Output format for settings
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Validate the resolved settings
    Validate,
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// One JSON document per line
    Json,
}

/// Settings format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

/// Receive mode as accepted on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ReceiveModeArg {
    PeekLock,
    ReceiveAndDelete,
}

impl From<ReceiveModeArg> for ReceiveMode {
    fn from(value: ReceiveModeArg) -> Self {
        match value {
            ReceiveModeArg::PeekLock => ReceiveMode::PeekLock,
            ReceiveModeArg::ReceiveAndDelete => ReceiveMode::ReceiveAndDelete,
        }
    }
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Output failed: {message}")]
    Output { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Queue(QueueError::Configuration(_)) => 1,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Output { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::Output {
            message: e.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for CliError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Output {
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Output Types
// ============================================================================

/// What a connection string resolves to
#[derive(Debug, Serialize)]
pub struct ConnectionSummary {
    pub endpoint: String,
    pub namespace: String,
    pub rest_endpoint: Option<String>,
    pub shared_access_key_name: String,
    pub entity_path: Option<String>,
    pub connection_string: String,
}

impl ConnectionSummary {
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigurationError> {
        let connection = ServiceBusConnection::parse(connection_string)?;
        Ok(Self {
            endpoint: connection.endpoint().to_string(),
            namespace: connection.namespace_host().to_string(),
            rest_endpoint: rest_base_url(connection.endpoint())
                .ok()
                .map(|url| url.to_string()),
            shared_access_key_name: connection.shared_access_key_name().to_string(),
            entity_path: connection.entity_path().map(str::to_string),
            connection_string: redact_connection_string(connection_string),
        })
    }
}

/// Printable view of a received message
#[derive(Debug, Serialize)]
pub struct MessageSummary {
    pub message_id: String,
    pub sequence_number: i64,
    pub delivery_count: u32,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub label: Option<String>,
    pub enqueued_at: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub body: String,
}

impl From<&ReceivedMessage> for MessageSummary {
    fn from(message: &ReceivedMessage) -> Self {
        Self {
            message_id: message.message_id.to_string(),
            sequence_number: message.sequence_number,
            delivery_count: message.delivery_count,
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            label: message.label.clone(),
            enqueued_at: message.enqueued_at.map(|at| at.to_string()),
            properties: message
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: String::from_utf8_lossy(&message.body).into_owned(),
        }
    }
}

impl MessageSummary {
    pub fn render(&self, format: OutputFormat) -> Result<String, CliError> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
            OutputFormat::Text => {
                let mut line = format!(
                    "#{} id={} delivery={}",
                    self.sequence_number, self.message_id, self.delivery_count
                );
                if let Some(label) = &self.label {
                    line.push_str(&format!(" label={}", label));
                }
                for (key, value) in &self.properties {
                    line.push_str(&format!(" {}={}", key, value));
                }
                line.push_str(&format!(" body={}", self.body));
                Ok(line)
            }
        }
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Everything a command needs besides its arguments
pub struct CommandContext {
    pub settings: BridgeSettings,
    pub connector: Arc<dyn TransportConnector>,
}

impl CommandContext {
    fn factory(&self) -> QueueClientFactory {
        self.settings.factory(Arc::clone(&self.connector))
    }

    fn queue_name<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str, CliError> {
        Ok(self.settings.resolve_queue_name(requested)?)
    }
}

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let settings = BridgeSettings::load(cli.config.as_deref())?;
    let context = CommandContext {
        settings,
        connector: Arc::new(HttpTransportConnector::new()),
    };

    let mut stdout = std::io::stdout();
    execute(cli.command, &context, &mut stdout).await
}

/// Run one command, writing its output to `out`
pub async fn execute(
    command: Commands,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match command {
        Commands::Inspect {
            connection_string,
            format,
        } => execute_inspect_command(connection_string, format, context, out),
        Commands::Send {
            queue,
            body,
            content_type,
            label,
            correlation_id,
            properties,
        } => {
            let mut message = Message::new(Bytes::from(body));
            if let Some(content_type) = content_type {
                message = message.with_content_type(content_type);
            }
            if let Some(label) = label {
                message = message.with_label(label);
            }
            if let Some(correlation_id) = correlation_id {
                message = message.with_correlation_id(correlation_id);
            }
            for (key, value) in properties {
                message = message.with_property(key, value);
            }
            execute_send_command(queue.as_deref(), message, context, out).await
        }
        Commands::Receive {
            queue,
            max_messages,
            timeout,
            mode,
            complete,
            format,
        } => {
            let request = ReceiveRequest {
                max_messages,
                timeout: Duration::from_secs(timeout),
                mode: mode.map(ReceiveMode::from),
                complete,
                format,
            };
            execute_receive_command(queue.as_deref(), request, context, out).await
        }
        Commands::Listen {
            queue,
            max_concurrent_calls,
            no_complete,
            max_messages,
            duration,
            format,
        } => {
            let request = ListenRequest {
                max_concurrent_calls,
                complete: !no_complete,
                max_messages,
                duration: duration.map(Duration::from_secs),
                format,
            };
            execute_listen_command(queue.as_deref(), request, context, out).await
        }
        Commands::Config { action } => execute_config_command(action, context, out),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "queue-bridge", out);
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging based on CLI arguments
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    // Logs go to stderr so command output stays machine readable
    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Output {
        message: format!("failed to initialize logging: {}", e),
    })
}

fn execute_inspect_command(
    connection_string: Option<String>,
    format: OutputFormat,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let connection_string =
        connection_string.unwrap_or_else(|| context.settings.connection_string.clone());
    if connection_string.trim().is_empty() {
        return Err(CliError::InvalidArgument {
            arg: "connection-string".to_string(),
            message: "no connection string given or configured".to_string(),
        });
    }

    let summary = ConnectionSummary::from_connection_string(&connection_string)?;
    match format {
        OutputFormat::Json => writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?,
        OutputFormat::Text => {
            writeln!(out, "endpoint:               {}", summary.endpoint)?;
            writeln!(out, "namespace:              {}", summary.namespace)?;
            if let Some(rest) = &summary.rest_endpoint {
                writeln!(out, "rest endpoint:          {}", rest)?;
            }
            writeln!(out, "shared access key name: {}", summary.shared_access_key_name)?;
            writeln!(
                out,
                "entity path:            {}",
                summary.entity_path.as_deref().unwrap_or("-")
            )?;
        }
    }
    Ok(())
}

async fn execute_send_command(
    queue: Option<&str>,
    message: Message,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let queue_name = context.queue_name(queue)?;
    let retry_policy = context.settings.retry_policy()?;
    let client = context.factory().get_queue_client_with_retry(
        queue_name,
        context.settings.receive_mode,
        retry_policy,
    )?;

    let message_id = message.message_id.clone();
    let result = client.send(message).await;
    if let Err(e) = client.close().await {
        warn!(queue_name = %queue_name, error = %e, "Failed to close client after send");
    }
    result?;

    info!(queue_name = %queue_name, message_id = %message_id, "Message sent");
    writeln!(out, "{}", message_id)?;
    Ok(())
}

/// Arguments of the receive command
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    pub timeout: Duration,
    pub mode: Option<ReceiveMode>,
    pub complete: bool,
    pub format: OutputFormat,
}

async fn execute_receive_command(
    queue: Option<&str>,
    request: ReceiveRequest,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    if request.max_messages == 0 {
        return Err(CliError::InvalidArgument {
            arg: "max-messages".to_string(),
            message: "must be at least 1".to_string(),
        });
    }

    let queue_name = context.queue_name(queue)?;
    let mode = request.mode.unwrap_or(context.settings.receive_mode);
    let receiver = context.factory().get_message_receiver(queue_name, mode)?;

    let messages = receiver
        .receive_batch(request.max_messages, request.timeout)
        .await?;
    for message in &messages {
        writeln!(out, "{}", MessageSummary::from(message).render(request.format)?)?;
        if request.complete {
            if let Some(lock_token) = &message.lock_token {
                receiver.complete(lock_token).await?;
            }
        }
    }

    info!(queue_name = %queue_name, count = messages.len(), "Receive finished");
    receiver.close().await?;
    Ok(())
}

/// Arguments of the listen command
#[derive(Debug, Clone)]
pub struct ListenRequest {
    pub max_concurrent_calls: Option<usize>,
    /// Complete each peek-locked message after it is written
    pub complete: bool,
    pub max_messages: Option<usize>,
    pub duration: Option<Duration>,
    pub format: OutputFormat,
}

async fn execute_listen_command(
    queue: Option<&str>,
    request: ListenRequest,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    let queue_name = context.queue_name(queue)?;
    let retry_policy = context.settings.retry_policy()?;
    let client = context.factory().get_queue_client_with_retry(
        queue_name,
        context.settings.receive_mode,
        retry_policy,
    )?;

    // Settlement follows the output, so the pump never settles on its own
    let mut options = context.settings.handler_options().with_auto_complete(false);
    if let Some(max_concurrent_calls) = request.max_concurrent_calls {
        options = options.with_max_concurrent_calls(max_concurrent_calls);
    }

    // Callbacks run on pump tasks; output is written here
    let complete = request.complete;
    let (tx, mut rx) = mpsc::unbounded_channel::<(MessageSummary, Option<MessageActions>)>();
    let handler = message_handler(move |message, actions, _cancel| {
        let tx = tx.clone();
        async move {
            let settle = (complete && message.lock_token.is_some()).then_some(actions);
            tx.send((MessageSummary::from(&message), settle))
                .map_err(|_| "output closed")?;
            Ok::<(), HandlerError>(())
        }
    });

    let listener = QueueListener::new(client, handler, options);
    let address = listener.open().await?;
    info!(queue_name = %address, "Listening; press Ctrl-C to stop");

    let deadline = async {
        match request.duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut delivered = 0usize;
    let outcome: Result<(), CliError> = loop {
        tokio::select! {
            received = rx.recv() => {
                let Some((summary, settle)) = received else { break Ok(()) };
                let line = match summary.render(request.format) {
                    Ok(line) => line,
                    Err(e) => break Err(e),
                };
                if let Err(e) = writeln!(out, "{}", line) {
                    break Err(e.into());
                }
                if let Some(actions) = settle {
                    if let Err(e) = actions.complete().await {
                        warn!(message_id = %summary.message_id, error = %e, "Failed to complete message");
                    }
                }
                delivered += 1;
                if request.max_messages.is_some_and(|max| delivered >= max) {
                    break Ok(());
                }
            }
            _ = &mut deadline => break Ok(()),
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break Ok(());
            }
        }
    };

    let closed = listener.close().await;
    info!(queue_name = %address, delivered = delivered, "Listener stopped");
    outcome?;
    closed?;
    Ok(())
}

fn execute_config_command(
    action: ConfigCommands,
    context: &CommandContext,
    out: &mut dyn Write,
) -> Result<(), CliError> {
    match action {
        ConfigCommands::Show { format } => {
            let redacted = context.settings.redacted();
            match format {
                ConfigFormat::Yaml => write!(out, "{}", serde_yaml::to_string(&redacted)?)?,
                ConfigFormat::Json => {
                    writeln!(out, "{}", serde_json::to_string_pretty(&redacted)?)?
                }
            }
            Ok(())
        }
        ConfigCommands::Validate => {
            context.settings.validate()?;
            writeln!(out, "Settings are valid")?;
            Ok(())
        }
    }
}
