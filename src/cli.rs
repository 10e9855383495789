use std::path::PathBuf;

use crate::{
    AssistantClient,
    capture::FileCapture,
    config::{ClientSettings, Platform, default_config_path},
    error::DispatchError,
    http::BlockingBackendHttp,
    services::{self, SpeechOutcome},
    telemetry,
};
use anyhow::{Result, anyhow};
use clap::{ArgAction, CommandFactory, Parser};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "agrilink", version, about = "Resilient client for the AgriLink farming assistant", long_about = None)]
pub struct Cli {
    /// Send a chat prompt to the assistant and print the reply.
    #[arg(long, value_name = "PROMPT")]
    pub chat: Option<String>,

    /// Attach an image to --chat.
    #[arg(long = "attach", value_name = "IMAGE", requires = "chat")]
    pub attach: Option<PathBuf>,

    /// Advice category for --chat (defaults to the configured one).
    #[arg(long, value_name = "TYPE")]
    pub advice_type: Option<String>,

    /// Transcribe a recorded audio file.
    #[arg(long, value_name = "AUDIO_FILE")]
    pub transcribe: Option<PathBuf>,

    /// Send the transcript from --transcribe as a chat prompt.
    #[arg(long, action = ArgAction::SetTrue, requires = "transcribe")]
    pub ask: bool,

    /// Synthesize speech for TEXT and print the audio location.
    #[arg(long, value_name = "TEXT")]
    pub speak: Option<String>,

    /// Probe candidates in order and report the first reachable one.
    #[arg(long, action = ArgAction::SetTrue)]
    pub probe: bool,

    /// Call the backend's test-connection endpoint.
    #[arg(long, action = ArgAction::SetTrue)]
    pub test_connection: bool,

    /// Emit diagnostics about candidates, configuration and trace export.
    #[arg(long, action = ArgAction::SetTrue)]
    pub diagnostics: bool,

    /// Show recent dispatch history (optionally specify COUNT entries).
    #[arg(long, value_name = "COUNT", num_args = 0..=1, default_missing_value = "10")]
    pub history: Option<usize>,

    /// Use the candidate ordering of another platform.
    #[arg(long, value_enum)]
    pub platform: Option<Platform>,

    /// Custom config path.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

type Client = AssistantClient<BlockingBackendHttp>;

fn surface(error: DispatchError) -> anyhow::Error {
    anyhow!(error.user_message())
}

fn print_history(client: &Client, limit: usize) -> Result<()> {
    let path = client.settings().resolve_journal_path()?;
    let entries = client.recent_dispatches(limit)?;

    if entries.is_empty() {
        println!("No dispatches recorded yet. Journal: {}", path.display());
        if !client.settings().journal.enabled {
            println!("  (journal is disabled; set journal.enabled in the config)");
        }
        return Ok(());
    }

    println!(
        "Recent {} dispatch(es) (showing up to {} requested) from {}",
        entries.len(),
        limit,
        path.display()
    );
    for entry in entries.iter().rev() {
        let status = if entry.succeeded { "ok" } else { "fail" };
        let route = match (&entry.candidate, entry.encoding) {
            (Some(candidate), Some(encoding)) => format!("{candidate} ({encoding})"),
            _ => "-".into(),
        };
        println!(
            "  {} [{}] {status} via {route} attempts={}",
            entry.timestamp.to_rfc3339(),
            entry.request,
            entry.attempts.len()
        );
        for attempt in &entry.attempts {
            println!(
                "      {} {} => {:?} ({} ms)",
                attempt.candidate, attempt.encoding, attempt.outcome, attempt.latency_ms
            );
        }
        if let Some(error) = &entry.error {
            println!("      error: {error}");
        }
    }
    Ok(())
}

fn print_diagnostics(client: &Client) -> Result<()> {
    let report = client.diagnostics()?;

    println!("AgriLink diagnostics");
    println!("  Platform    : {}", report.platform);
    println!("  Candidates  :");
    for candidate in &report.candidate_order {
        let sticky = report
            .sticky
            .as_ref()
            .is_some_and(|known| known.same_location(candidate));
        println!(
            "    {}. {}{}",
            candidate.priority,
            candidate,
            if sticky { " (last known good)" } else { "" }
        );
    }
    if report.metrics.is_empty() {
        println!("  Metrics     : (no dispatches yet)");
    } else {
        println!("  Metrics     :");
        for entry in &report.metrics {
            let latency = entry
                .last_latency_ms
                .map(|ms| format!("{ms} ms"))
                .unwrap_or_else(|| "-".into());
            println!(
                "    - {:<32} ok={} fail={} last={}",
                entry.address, entry.successes, entry.failures, latency
            );
            if let Some(error) = &entry.last_error {
                println!("        last error: {error}");
            }
        }
    }
    let settings = client.settings();
    println!(
        "  Timeouts    : probe {} ms, request {} ms",
        settings.discovery.probe_timeout_ms, settings.transport.request_timeout_ms
    );
    println!(
        "  Inline cap  : {} chars",
        settings.transport.inline_max_chars
    );
    println!(
        "  History     : {} of {} turns, context {}",
        report.conversation_turns,
        settings.conversation.max_turns,
        settings.conversation.context_turns
    );
    println!("  Capture     : {}", report.capture);
    match &report.journal {
        Some(path) => println!("  Journal     : {}", path.display()),
        None => println!("  Journal     : disabled"),
    }
    println!(
        "  Traces      : {}",
        if report.trace.enabled { "enabled" } else { "disabled" }
    );
    if let Some(dir) = &report.trace.directory {
        println!("    directory : {}", dir.display());
    }
    if let Some(active) = &report.trace.active_file {
        println!("    active    : {}", active.display());
    }
    for file in &report.trace.recent_files {
        println!("    - {}", file.display());
    }
    if report.issues.is_empty() {
        println!("  Config      : ok");
    } else {
        println!("  Config issues:");
        for issue in &report.issues {
            println!("    - {issue}");
        }
    }
    Ok(())
}

fn print_probe(client: &Client) {
    let discovery = client.discover();
    for probe in &discovery.probes {
        let state = if probe.reachable { "up" } else { "down" };
        let detail = probe
            .error
            .map(|kind| format!(" ({kind})"))
            .unwrap_or_default();
        println!(
            "  {:<32} {state:<4} {} ms{detail}",
            probe.candidate, probe.latency_ms
        );
    }
    match discovery.selected {
        Some(candidate) => println!("Selected {candidate}"),
        None => println!("No candidate answered its health probe"),
    }
}

fn run_chat(client: &mut Client, cli: &Cli, prompt: &str) -> Result<()> {
    let image = match &cli.attach {
        Some(path) => Some(services::load_image_attachment(
            path,
            &client.settings().capture.audio_source,
        )?),
        None => None,
    };
    let exchange = client
        .chat(prompt, image, cli.advice_type.as_deref())
        .map_err(surface)?;
    info!(
        candidate = %exchange.candidate,
        encoding = %exchange.encoding,
        model = exchange.reply.model_used.as_deref().unwrap_or("-"),
        "chat reply received"
    );
    println!("{}", exchange.reply.response);
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut settings = ClientSettings::load_or_default(&config_path)?;
    if let Some(platform) = cli.platform {
        settings.platform = Some(platform);
    }
    telemetry::init_tracing("agrilink", cli.verbose, &settings.telemetry)?;
    info!(path = %config_path.display(), "using client config");

    let mut client = AssistantClient::connect(settings)?;

    if cli.diagnostics {
        return print_diagnostics(&client);
    }

    if let Some(limit) = cli.history {
        return print_history(&client, limit);
    }

    if cli.probe {
        print_probe(&client);
        return Ok(());
    }

    if cli.test_connection {
        let report = client.test_connection();
        match (&report.url, &report.error) {
            (Some(url), _) => println!("Connected to {url}"),
            (None, Some(error)) => println!("{error}"),
            (None, None) => println!("Backend unreachable"),
        }
        if let Some(detail) = &report.detail {
            println!("{}", serde_json::to_string_pretty(detail)?);
        }
        return Ok(());
    }

    let mut acted = false;

    if let Some(path) = &cli.transcribe {
        client.attach_capture(Box::new(FileCapture::new(path.clone())));
        client.start_capture()?;
        let transcript = client.stop_and_transcribe();
        println!("Transcript: {transcript}");
        if cli.ask {
            run_chat(&mut client, &cli, &transcript)?;
        }
        acted = true;
    }

    if let Some(prompt) = &cli.chat {
        run_chat(&mut client, &cli, prompt)?;
        acted = true;
    }

    if let Some(text) = &cli.speak {
        match client.speak(text) {
            SpeechOutcome::Audio { url, filename } => {
                println!("Audio: {url}");
                if let Some(filename) = filename {
                    println!("File : {filename}");
                }
            }
            SpeechOutcome::NoAudio { reason } => println!("No audio produced: {reason}"),
        }
        acted = true;
    }

    if !acted {
        Cli::command().print_help()?;
        println!();
    }
    Ok(())
}
