use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use governor::app::ApplicationBuilder;
use governor::config::policy::load_policy;
use governor::config::policy::policy_schema;
use governor::config::policy::validate_offline;
use governor::config::Cli;
use governor::config::Commands;
use governor::config::DaemonArgs;
use governor::config::ValidatePolicyArgs;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ValidatePolicy(args) => run_validate_policy(args).await,
        Commands::PolicySchema => run_policy_schema(),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = match &daemon_args.audit_log_file {
        Some(path) => Some(
            logging::init_with_audit(path)
                .with_context(|| format!("open audit log {}", path.display()))?,
        ),
        None => {
            logging::init();
            None
        }
    };

    tracing::info!("Starting governor daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

async fn run_validate_policy(args: ValidatePolicyArgs) -> Result<()> {
    logging::init();

    let policy = load_policy(&args.file)
        .await
        .map_err(|e| anyhow!("{e:?}"))?;
    let outcome = validate_offline(&policy, args.headroom_mib)
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    if outcome.is_clean() {
        println!("{}: ok", args.file.display());
        return Ok(());
    }
    for rejected in &outcome.rejected {
        println!("{}: {rejected}", args.file.display());
    }
    for pending in &outcome.pending {
        println!("{}: waiting for a suitable device, {pending}", args.file.display());
    }
    Err(anyhow!(
        "{} declaration(s) would be skipped, {} would wait for devices",
        outcome.rejected.len(),
        outcome.pending.len()
    ))
}

fn run_policy_schema() -> Result<()> {
    let schema = policy_schema().map_err(|e| anyhow!("{e:?}"))?;
    println!("{schema}");
    Ok(())
}
