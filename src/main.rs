mod config;
mod debounce;
mod scene;
mod supervisor;
mod watcher;

use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::RenderSupervisor;
use tracing_subscriber::EnvFilter;

/// Watches a directory tree for changes to manim scene files and re-runs
/// the renderer on the first scene class of whichever file changed.
/// Stray GPU-mode renders from earlier runs are swept on startup.
#[derive(Parser, Debug)]
#[command(name = "manim-watch", version, about)]
struct Cli {
    /// Directory tree to watch
    #[arg(value_name = "DIR", default_value = ".")]
    root: PathBuf,

    /// Renderer binary (default: manim)
    #[arg(long, value_name = "BIN")]
    renderer_bin: Option<String>,

    /// Skip the startup sweep of stray GPU renderer processes
    #[arg(long)]
    no_sweep: bool,

    /// Print resolved settings, don't watch
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (debounce decisions, process lifecycle)
    #[arg(short, long)]
    verbose: bool,

    /// Suppress everything but errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = Config::resolve(&cli.root, cli.renderer_bin, cli.no_sweep);
    tracing::debug!(?config, "resolved settings");

    if cli.dry_run {
        println!("manim-watch v{}", env!("CARGO_PKG_VERSION"));
        println!("Watch root:   {}", config.watch.root.display());
        println!(
            "Renderer:     {} {}",
            config.renderer.program,
            config.renderer.args.join(" ")
        );
        println!("PYTHONPATH:   {}", config.renderer.python_path());
        println!("Debounce:     {:?}", config.watch.debounce_window);
        println!("Settle delay: {:?}", config.watch.settle_delay);
        println!("Stop timeout: {:?}", config.renderer.stop_timeout);
        println!("Dry run mode — settings resolved, not watching.");
        return;
    }

    let supervisor = Arc::new(RenderSupervisor::new(
        config.renderer.clone(),
        config.sweep.clone(),
    ));

    let interrupt = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(e) = watcher::run(config.watch, supervisor, interrupt).await {
        tracing::error!(error = %e, "watcher failed");
        std::process::exit(1);
    }
}
