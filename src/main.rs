use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use vocalis_gateway::Config;
use vocalis_gateway::api::ApiServer;
use vocalis_gateway::voice::{
    ChatSession, OpenAiGenerator, Synthesizer, TextGenerator, TextToSpeech, VoiceServices,
    collect_audio,
};

/// Vocalis - real-time voice conversation gateway
#[derive(Parser)]
#[command(name = "vocalis", version, about)]
struct Cli {
    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice gateway (default)
    Serve,
    /// Synthesize one utterance to a file
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
        /// Output file
        #[arg(short, long, default_value = "vocalis-test.mp3")]
        out: PathBuf,
    },
    /// Stream one reply to stdout
    TestLlm {
        /// Prompt to answer
        prompt: String,
    },
    /// Print the effective configuration with secrets redacted
    ShowConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose, rust_log.as_deref()))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins when set and valid, otherwise verbosity picks the level
fn log_filter(verbose: u8, rust_log: Option<&str>) -> EnvFilter {
    let by_verbosity = match verbose {
        0 => "info,vocalis_gateway=info",
        1 => "info,vocalis_gateway=debug",
        2 => "debug",
        _ => "trace",
    };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(by_verbosity))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config).await,
        Command::TestTts { text, out } => test_tts(&config, &text, &out).await,
        Command::TestLlm { prompt } => test_llm(&config, &prompt).await,
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

async fn serve(config: &Config) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        stt_model = %config.stt.model,
        llm_model = %config.llm.model,
        tts_provider = config.tts.provider.as_str(),
        "starting vocalis gateway"
    );

    let services = VoiceServices::from_config(config).context("voice services are not configured")?;
    let server = ApiServer::new(config, services);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}

async fn test_tts(config: &Config, text: &str, out: &Path) -> anyhow::Result<()> {
    let tts = TextToSpeech::new(&config.tts)?;
    tracing::info!(provider = config.tts.provider.as_str(), voice = %config.tts.voice, "synthesizing");

    let audio = collect_audio(tts.synthesize(text).await?).await?;
    std::fs::write(out, &audio).with_context(|| format!("failed to write {}", out.display()))?;

    println!("wrote {} bytes of {} to {}", audio.len(), tts.content_type(), out.display());
    Ok(())
}

async fn test_llm(config: &Config, prompt: &str) -> anyhow::Result<()> {
    let generator = OpenAiGenerator::new(&config.llm)?;
    let session = ChatSession::new("cli");

    let mut fragments = generator.stream_reply(prompt, &session).await?;
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        write!(stdout, "{}", fragment?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}
