// CLI module - command-line argument parsing and handlers
//
// The worker is a long-running process; the only subcommands are
// configuration introspection:
// - config --show: Display effective configuration
// - config --path: Show the settings file path

use crate::config::{Settings, VERSION};
use clap::{Parser, Subcommand};

/// mnemo - local memory worker for developer-assistant sessions
#[derive(Parser)]
#[command(name = "mnemo")]
#[command(version = VERSION)]
#[command(about = "Local memory worker for developer-assistant sessions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show settings file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else {
                println!("Usage: mnemo config [--show|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration");
                println!("  --path    Show settings file path");
            }
            true
        }
        None => false, // No subcommand, run the worker
    }
}

fn handle_config_path() {
    let data_dir = Settings::resolve_data_dir();
    println!("{}", Settings::settings_path(&data_dir).display());
}

fn handle_config_show() {
    let settings = Settings::resolve();

    println!("# Effective configuration (env > settings.json > defaults)");
    println!();
    println!("data_dir = {:?}", settings.data_dir.display().to_string());
    println!("provider = {:?}", settings.provider.as_str());
    println!("worker = {}:{}", settings.worker_host, settings.worker_port);
    println!("mode = {:?}", settings.mode);
    println!("max_concurrent_agents = {}", settings.max_concurrent_agents);
    println!("idle_timeout_secs = {}", settings.idle_timeout_secs);
    println!("queue_retry_limit = {}", settings.queue_retry_limit);
    println!("queue_stale_secs = {}", settings.queue_stale_secs);
    println!("gemini_model = {:?}", settings.gemini_model);
    println!("gemini_rate_limiting = {}", settings.gemini_rate_limiting);
    println!("openrouter_model = {:?}", settings.openrouter_model);
    if !settings.skip_tools.is_empty() {
        println!("skip_tools = {:?}", settings.skip_tools);
    }
    if !settings.excluded_projects.is_empty() {
        println!("excluded_projects = {:?}", settings.excluded_projects);
    }

    println!();
    let path = Settings::settings_path(&settings.data_dir);
    if path.exists() {
        println!("# Source: {}", path.display());
    } else {
        println!("# Source: defaults (no settings file)");
    }
}
