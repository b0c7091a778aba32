//! `workflow trigger <subcommand>` (spec.md §4.7, §6): load a trigger
//! rule file, validate or test it offline, or run the listener ingress
//! service against it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tabled::{settings::Style, Table, Tabled};

use workflow_triggers::dispatcher::WorkflowDispatcher;
use workflow_triggers::listener::Listener;
use workflow_triggers::listeners::{DiscordListener, FileWatchListener, HttpWebhookListener, TelegramListener};
use workflow_triggers::{IncomingMessage, MatchKind, Matcher, Source, TriggerEvent, TriggerFile, TriggerRule, TriggerService};

use super::utils;

#[derive(Args)]
pub struct TriggerArgs {
    #[command(subcommand)]
    pub command: TriggerCommand,
}

#[derive(Subcommand)]
pub enum TriggerCommand {
    /// Validate a trigger rule file without starting any listener
    Validate(FileArgs),
    /// List the rules in a trigger rule file
    List(FileArgs),
    /// Test a rule file against a single line of text, offline
    Test(TestArgs),
    /// Start the listener ingress service for a rule file
    Run(RunArgs),
}

#[derive(Args)]
pub struct FileArgs {
    /// Trigger rule YAML file
    pub rules: PathBuf,
}

#[derive(Args)]
pub struct TestArgs {
    /// Trigger rule YAML file
    pub rules: PathBuf,
    /// Text to match, as if received from `source`
    pub text: String,
    /// Source to pretend the text arrived from
    #[arg(long, value_enum, default_value = "telegram")]
    pub source: CliSource,
}

#[derive(Args)]
pub struct RunArgs {
    /// Trigger rule YAML file
    pub rules: PathBuf,
    /// Telegram bot token (enables the Telegram listener)
    #[arg(long, env = "WORKFLOW_TELEGRAM_TOKEN")]
    pub telegram_token: Option<String>,
    /// Discord bot token (enables the Discord listener)
    #[arg(long, env = "WORKFLOW_DISCORD_TOKEN")]
    pub discord_token: Option<String>,
    /// Bind address for the HTTP webhook listener (also serves Slack events)
    #[arg(long, default_value = "0.0.0.0:8787")]
    pub http_addr: SocketAddr,
    /// Slack request-signing secret, required to accept `/slack/events`
    #[arg(long, env = "WORKFLOW_SLACK_SIGNING_SECRET")]
    pub slack_signing_secret: Option<String>,
    /// Directory to watch for file-change triggers
    #[arg(long)]
    pub watch_path: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum CliSource {
    Telegram,
    Discord,
    Slack,
    Http,
    Filewatch,
}

impl From<CliSource> for Source {
    fn from(value: CliSource) -> Self {
        match value {
            CliSource::Telegram => Source::Telegram,
            CliSource::Discord => Source::Discord,
            CliSource::Slack => Source::Slack,
            CliSource::Http => Source::HttpWebhook,
            CliSource::Filewatch => Source::FileWatch,
        }
    }
}

async fn load_rules(path: &PathBuf) -> Result<Vec<TriggerRule>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading trigger file {}", path.display()))?;
    let file: TriggerFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing trigger file {}", path.display()))?;
    let rules = file
        .triggers
        .into_iter()
        .map(|mut rule| {
            if rule.id.is_empty() {
                rule.id = rule.name.clone();
            }
            rule
        })
        .collect();
    Ok(rules)
}

pub async fn execute(args: TriggerArgs) -> Result<ExitCode> {
    match args.command {
        TriggerCommand::Validate(file_args) => validate(file_args).await,
        TriggerCommand::List(file_args) => list(file_args).await,
        TriggerCommand::Test(test_args) => test(test_args).await,
        TriggerCommand::Run(run_args) => run(run_args).await,
    }
}

async fn validate(args: FileArgs) -> Result<ExitCode> {
    let rules = match load_rules(&args.rules).await {
        Ok(rules) => rules,
        Err(e) => {
            utils::error(&format!("{e:#}"));
            return Ok(ExitCode::from(1));
        }
    };
    match Matcher::new(rules.clone()) {
        Ok(_) => {
            utils::success(&format!("{} rule(s) are valid", rules.len()));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            utils::error(&e.to_string());
            Ok(ExitCode::from(1))
        }
    }
}

#[derive(Tabled)]
struct RuleRow {
    id: String,
    sources: String,
    kind: String,
    enabled: bool,
    workflow: String,
}

async fn list(args: FileArgs) -> Result<ExitCode> {
    let rules = match load_rules(&args.rules).await {
        Ok(rules) => rules,
        Err(e) => {
            utils::error(&format!("{e:#}"));
            return Ok(ExitCode::from(1));
        }
    };
    let rows: Vec<RuleRow> = rules
        .iter()
        .map(|r| RuleRow {
            id: r.id.clone(),
            sources: r.sources.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(","),
            kind: match &r.matcher {
                MatchKind::Keyword { keywords } => format!("keyword({})", keywords.join("|")),
                MatchKind::Pattern { pattern } => format!("pattern({pattern})"),
            },
            enabled: r.enabled,
            workflow: r.workflow_path.clone(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(ExitCode::SUCCESS)
}

async fn test(args: TestArgs) -> Result<ExitCode> {
    let rules = match load_rules(&args.rules).await {
        Ok(rules) => rules,
        Err(e) => {
            utils::error(&format!("{e:#}"));
            return Ok(ExitCode::from(1));
        }
    };
    let matcher = Matcher::new(rules)?;
    let message = IncomingMessage::new(args.source.into(), args.text, serde_json::json!({}));

    match matcher.matches(&message) {
        Some(matched) => {
            utils::success(&format!("matched rule '{}'", matched.rule.id));
            if !matched.captures.is_empty() {
                println!("captures: {:?}", matched.captures);
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            utils::warning("no rule matched");
            Ok(ExitCode::from(1))
        }
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    let rules = load_rules(&args.rules).await?;
    let matcher = Matcher::new(rules)?;

    let mut listeners: Vec<Arc<dyn Listener>> = Vec::new();
    if let Some(token) = args.telegram_token {
        listeners.push(Arc::new(TelegramListener::new(token)));
    }
    if let Some(token) = args.discord_token {
        listeners.push(Arc::new(DiscordListener::new(token)));
    }
    listeners.push(Arc::new(HttpWebhookListener::new(args.http_addr, args.slack_signing_secret)));
    if let Some(watch_path) = args.watch_path {
        listeners.push(Arc::new(FileWatchListener::new(
            watch_path,
            &[],
            &[],
            std::time::Duration::from_millis(500),
        )));
    }

    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let service = Arc::new(TriggerService::new(listeners, matcher, Arc::new(WorkflowDispatcher), Some(events_tx)));

    let print_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(event);
        }
    });

    utils::info(&format!("trigger ingress listening on {}", args.http_addr));
    let run_service = service.clone();
    let run_handle = tokio::spawn(async move { run_service.run().await });

    tokio::signal::ctrl_c().await?;
    utils::info("shutting down trigger ingress");
    service.shutdown(std::time::Duration::from_secs(10)).await;
    run_handle.abort();
    print_task.abort();

    Ok(ExitCode::from(130))
}

fn print_event(event: TriggerEvent) {
    match event {
        TriggerEvent::MessageReceived { message_id, source } => {
            utils::info(&format!("received {message_id} from {source}"));
        }
        TriggerEvent::TriggerMatched { message_id, rule_id } => {
            utils::info(&format!("{message_id} matched rule {rule_id}"));
        }
        TriggerEvent::TriggerDispatched { message_id, rule_id, run_id } => {
            utils::success(&format!("{message_id} dispatched rule {rule_id}, run {run_id}"));
        }
        TriggerEvent::TriggerDispatchFailed { message_id, rule_id, error } => {
            utils::error(&format!("{message_id} rule {rule_id} failed to dispatch: {error}"));
        }
        TriggerEvent::TriggerError { component, message } => {
            utils::error(&format!("{component}: {message}"));
        }
    }
}
