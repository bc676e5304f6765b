//! web-attest CLI: entry point.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use web_attest::extract::undeclared_placeholders;
use web_attest::host::chromium::{ChromiumConfig, ChromiumHost};
use web_attest::host::scripted::ScriptedHost;
use web_attest::{
    AttestResult, BrowserHost, EventBus, Manifest, ManifestSource, PipelineConfig, RawCapture,
    RedeliveryPolicy, RequestBuilder,
};

#[derive(Parser)]
#[command(
    name = "web-attest",
    about = "Resolve request manifests against an authenticated browser session",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a session and print the resolved manifest as JSON.
    Resolve(ResolveArgs),

    /// Validate a manifest file.
    Validate {
        /// Path to the manifest JSON.
        file: PathBuf,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   web-attest completions bash > ~/.local/share/bash-completion/completions/web-attest
    ///   web-attest completions zsh > ~/.zfunc/_web-attest
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Args)]
#[command(group(ArgGroup::new("input").required(true).args(["manifest_url", "manifest"])))]
struct ResolveArgs {
    /// Fetch the manifest (and its prepare.js) from this URL.
    #[arg(long)]
    manifest_url: Option<String>,

    /// Read the manifest from a local file.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Preparation script to run instead of the companion script.
    #[arg(long)]
    prepare_js: Option<PathBuf>,

    /// Overall bound in milliseconds (default 60000, or WEB_ATTEST_TIMEOUT_MS).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run Chromium without a window.
    #[arg(long)]
    headless: bool,

    /// Keep extracting on later navigations, up to N captures.
    #[arg(long, value_name = "N")]
    retry_on_update: Option<u32>,

    /// Replay a recorded capture (JSON: {"cookies": [...], "dom": "..."})
    /// instead of launching a browser.
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Print pipeline events to stderr as JSON lines.
    #[arg(long)]
    events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    match cli.command {
        Commands::Resolve(args) => {
            let manifest = resolve(args).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }

        Commands::Validate { file } => match load_manifest(&file) {
            Ok(manifest) => {
                println!("Valid manifest: {}", file.display());
                println!("  Id: {}", manifest.id);
                println!("  Title: {}", manifest.title);
                println!("  Request: {} {}", manifest.request.method, manifest.request.url);
                match &manifest.prepare_url {
                    Some(url) => println!("  Capture: required ({url})"),
                    None => println!("  Capture: not required"),
                }
                let placeholders: Vec<String> = manifest.placeholders().into_iter().collect();
                if !placeholders.is_empty() {
                    println!("  Placeholders: {}", placeholders.join(", "));
                }
                for name in undeclared_placeholders(&manifest) {
                    println!("  Warning: `{{{{{name}}}}}` has no variable rule");
                }
            }
            Err(e) => {
                eprintln!("Invalid manifest: {e:#}");
                std::process::exit(1);
            }
        },

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "web-attest", &mut std::io::stdout());
        }
    }

    Ok(())
}

async fn resolve(args: ResolveArgs) -> anyhow::Result<Manifest> {
    let mut config = PipelineConfig::from_env();
    if let Some(ms) = args.timeout_ms {
        config.timeout_ms = ms;
    }
    if let Some(max_attempts) = args.retry_on_update {
        config.redelivery = if max_attempts == 0 {
            RedeliveryPolicy::Terminal
        } else {
            RedeliveryPolicy::RetryOnUpdate { max_attempts }
        };
    }

    let source = match (args.manifest_url, &args.manifest) {
        (Some(url), _) => ManifestSource::Url(url),
        (None, Some(path)) => ManifestSource::Inline(load_manifest(path)?),
        (None, None) => anyhow::bail!("either --manifest-url or --manifest is required"),
    };
    let prepare_js = args.prepare_js.as_deref().map(read_file).transpose()?;

    let bus = EventBus::default();
    if args.events {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&envelope) {
                    eprintln!("{line}");
                }
            }
        });
    }

    if let Some(path) = &args.capture {
        let host = ScriptedHost::replay(load_capture(path)?);
        return Ok(build(&host, config, source, prepare_js, &bus).await?);
    }

    let host = ChromiumHost::launch(ChromiumConfig {
        headless: args.headless,
        ..Default::default()
    })
    .await?;
    let resolved = build(&host, config, source, prepare_js, &bus).await;
    if let Err(e) = host.shutdown().await {
        tracing::warn!("failed to shut down Chromium: {e}");
    }
    Ok(resolved?)
}

async fn build(
    host: &dyn BrowserHost,
    config: PipelineConfig,
    source: ManifestSource,
    prepare_js: Option<String>,
    bus: &EventBus,
) -> AttestResult<Manifest> {
    let mut builder = RequestBuilder::new(host)
        .with_config(config)
        .source(source)
        .events(bus);
    if let Some(script) = prepare_js {
        builder = builder.prepare_js(script);
    }
    builder.build().await
}

fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let raw = read_file(path)?;
    Manifest::parse(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_capture(path: &Path) -> anyhow::Result<RawCapture> {
    let raw = read_file(path)?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse capture {}", path.display()))
}
