//! WeightLink - Main Entry Point
//!
//! Uploads quantized model artifacts to the ledger program and chats with
//! the uploaded model from the terminal.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weightlink_client::{
    Artifact, LedgerClient, LedgerContext, RpcLedgerClient, SessionController, SimulatedLedger, UploadCoordinator,
    UploadJournal,
};
use weightlink_common::{WeightLinkConfig, METRICS};
use weightlink_protocol::{Address, AddressDeriver, Keypair, ModelShape, SectionType};

const DEFAULT_CONFIG_PATH: &str = "configs/weightlink.yaml";
const JOURNAL_FILE: &str = "upload_journal.jsonl";

#[derive(Parser, Debug)]
#[command(name = "weightlink")]
#[command(about = "Upload quantized models to a ledger program and chat with them")]
struct Cli {
    /// Configuration file (defaults to $WEIGHTLINK_CONFIG, then configs/weightlink.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against an in-process simulated ledger
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload an artifact directory (model_registry.json + chunk_<type>.bin)
    Upload {
        #[arg(long)]
        artifact_dir: PathBuf,

        /// Resume into an existing registry instead of creating one
        #[arg(long)]
        registry: Option<Address>,

        /// Progress journal (defaults to <artifact-dir>/upload_journal.jsonl)
        #[arg(long)]
        journal: Option<PathBuf>,
    },

    /// Chat with an uploaded model
    Chat {
        /// Model registry address
        #[arg(long)]
        model: Option<Address>,

        /// Session address, or "new" to find or create the derived session
        #[arg(long)]
        session: Option<String>,
    },

    /// Print derived addresses without touching the ledger
    Derive {
        #[arg(long)]
        owner: Address,

        /// Also print the chunk-set anchors of this registry
        #[arg(long)]
        registry: Option<Address>,
    },

    /// Reclaim the storage of a record
    Close { account: Address },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("weightlink={level},weightlink_client={level},weightlink_protocol={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var_os("WEIGHTLINK_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn load_payer(config: &WeightLinkConfig, dry_run: bool) -> anyhow::Result<Keypair> {
    let path = config.keypair_path();
    match Keypair::read_from_file(&path) {
        Ok(keypair) => Ok(keypair),
        Err(e) if dry_run => {
            warn!(path = %path.display(), error = %e, "Using an ephemeral keypair for the dry run");
            Ok(Keypair::generate())
        }
        Err(e) => Err(e).with_context(|| format!("loading keypair {}", path.display())),
    }
}

fn connect(config: &WeightLinkConfig, dry_run: bool) -> anyhow::Result<Arc<dyn LedgerClient>> {
    if dry_run {
        let program_id: Address = config.ledger.program_id.parse()?;
        info!(%program_id, "Dry run: using the simulated ledger");
        return Ok(Arc::new(SimulatedLedger::new(program_id)));
    }
    let client = RpcLedgerClient::new(&config.ledger)?;
    info!(endpoint = client.endpoint(), "Connected to ledger node");
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = config_path(&cli);
    let config = WeightLinkConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
    init_tracing(&config.observability.log_level);
    info!(config = %path.display(), "Starting WeightLink");

    let metrics_path = config.observability.metrics_path.clone();
    let result = run(cli, config).await;

    if let Some(metrics_path) = metrics_path {
        if let Err(e) = std::fs::write(&metrics_path, METRICS.gather()) {
            warn!(path = %metrics_path.display(), error = %e, "Failed to write metrics");
        }
    }
    result
}

async fn run(cli: Cli, config: WeightLinkConfig) -> anyhow::Result<()> {
    if let Command::Derive { owner, registry } = &cli.command {
        let program_id: Address = config.ledger.program_id.parse()?;
        return derive(&AddressDeriver::new(program_id), &config.session.seed, owner, registry.as_ref());
    }

    let payer = load_payer(&config, cli.dry_run)?;
    info!(payer = %payer.pubkey(), "Signing identity loaded");
    let ledger = connect(&config, cli.dry_run)?;
    let ctx = LedgerContext::new(ledger, payer, config)?;

    match cli.command {
        Command::Upload {
            artifact_dir,
            registry,
            journal,
        } => upload(ctx, &artifact_dir, registry, journal).await,
        Command::Chat { model, session } => chat(ctx, model, session, cli.dry_run).await,
        Command::Close { account } => close(ctx, &account).await,
        Command::Derive { .. } => Ok(()),
    }
}

fn derive(deriver: &AddressDeriver, seed: &str, owner: &Address, registry: Option<&Address>) -> anyhow::Result<()> {
    let session = deriver.session(seed, owner)?;
    println!("session   {} (bump {})", session.address, session.bump);
    if let Some(registry) = registry {
        for section in SectionType::ALL {
            let anchor = deriver.chunk_anchor(registry, section.index())?;
            println!("{:<9} {} (bump {})", section.name(), anchor.address, anchor.bump);
        }
    }
    Ok(())
}

async fn upload(
    ctx: LedgerContext,
    artifact_dir: &Path,
    registry: Option<Address>,
    journal: Option<PathBuf>,
) -> anyhow::Result<()> {
    let artifact = Artifact::load(artifact_dir, ctx.config().upload.element_format)
        .with_context(|| format!("loading artifact {}", artifact_dir.display()))?;
    info!(values = artifact.total_values(), shape = ?artifact.shape(), "Artifact loaded");

    let journal_path = journal
        .or_else(|| ctx.config().upload.journal_path.clone())
        .unwrap_or_else(|| artifact_dir.join(JOURNAL_FILE));

    let coordinator = UploadCoordinator::new(ctx)?;
    let registry = match registry {
        Some(registry) => registry,
        None => coordinator.create_registry(artifact.shape()).await?,
    };
    println!("Model registry: {}", registry);

    let mut journal = UploadJournal::open(&journal_path, registry)
        .with_context(|| format!("opening journal {}", journal_path.display()))?;
    let summary = coordinator.upload(&artifact, &registry, &mut journal).await?;

    for section in &summary.sections {
        println!(
            "{:<9} {} chunks ({} uploaded, {} already present)",
            section.section.name(),
            section.chunk_count,
            section.uploaded,
            section.resumed
        );
    }
    for (section, reason) in &summary.skipped {
        println!("{:<9} skipped ({:?})", section.name(), reason);
    }
    println!("Upload complete: {} chunks in {}", summary.total_chunks(), registry);
    Ok(())
}

async fn prompt(lines: &mut Lines<BufReader<Stdin>>, text: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}

async fn chat(
    ctx: LedgerContext,
    model: Option<Address>,
    session: Option<String>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let model = match model {
        Some(model) => model,
        None => {
            let Some(text) = prompt(&mut lines, "Model address: ").await? else {
                return Ok(());
            };
            text.parse().context("invalid model address")?
        }
    };

    if dry_run && ctx.ledger().get_account(&model).await?.is_none() {
        // The simulated ledger starts empty; give the session a model to bind to.
        let shape = ModelShape {
            vocab_size: 256,
            embedding_dim: 16,
            hidden_dim: 16,
            context_length: 128,
            layer_count: 1,
        };
        let created = UploadCoordinator::new(ctx.clone())?.create_registry(&shape).await?;
        warn!(requested = %model, %created, "Dry run: chatting against a fresh empty registry");
        return chat_loop(ctx, created, session, &mut lines).await;
    }
    chat_loop(ctx, model, session, &mut lines).await
}

async fn chat_loop(
    ctx: LedgerContext,
    model: Address,
    session: Option<String>,
    lines: &mut Lines<BufReader<Stdin>>,
) -> anyhow::Result<()> {
    let session_arg = match session {
        Some(session) => session,
        None => match prompt(lines, "Chat address (or \"new\"): ").await? {
            Some(text) => text,
            None => return Ok(()),
        },
    };

    let controller = SessionController::new(ctx);
    let session = if session_arg.eq_ignore_ascii_case("new") || session_arg.is_empty() {
        controller.ensure_session(&model).await?
    } else {
        session_arg.parse().context("invalid chat address")?
    };
    println!("Chat session: {}", session);
    println!("Type a message, or \"exit\" to quit.");

    loop {
        let Some(text) = prompt(lines, "You: ").await? else {
            break;
        };
        if text == "exit" {
            break;
        }
        if text.is_empty() {
            continue;
        }

        match controller.send_turn(&session, &text).await {
            Ok(outcome) => match outcome.response {
                Some(response) => println!("Model: {}", response),
                None => println!("(no response found in logs of {})", outcome.signature),
            },
            Err(e) => {
                println!("Turn failed: {}", e);
                for line in e.logs() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn close(ctx: LedgerContext, account: &Address) -> anyhow::Result<()> {
    let payer = ctx.payer();
    if ctx.ledger().get_account(account).await?.is_none() {
        bail!("no record at {}", account);
    }
    let instruction = ctx.program().close_given_account(&payer.pubkey(), account);
    let receipt = ctx
        .submitter()
        .submit("close_given_account", &[instruction], payer, &[])
        .await?;
    println!("Closed {} ({})", account, receipt.signature);
    Ok(())
}
