use std::path::{Path, PathBuf};
use std::sync::Arc;

use accrual_rules::{Combine, ConditionEngine, ConfigTree};
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "accrual-rules")]
#[command(about = "Inspect accrual status rule configurations", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a rule section in application order and report problems
    Rules {
        /// Path to the TOML, YAML or JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Rule section to inspect
        #[arg(short, long, default_value = "erm_status_rules")]
        section: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &args.command {
        Commands::Rules { config, section } => print_rules(config, section),
    }
}

fn print_rules(path: &Path, section: &str) -> Result<()> {
    let config = Arc::new(ConfigTree::from_file(path)?);
    let engine = ConditionEngine::new(Arc::clone(&config), section);

    println!("Section '{}': {} rules", section, engine.rules().len());
    for rule in engine.rules() {
        let checks: Vec<&str> = rule.checks.iter().map(|c| c.name()).collect();
        let kinds = match &rule.apply_to {
            Some(kinds) => kinds
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(","),
            None => "PO,PR".to_string(),
        };
        println!(
            "  {:>5}  {:<24} [{}] {} {} ({})",
            rule.priority,
            rule.status.as_deref().unwrap_or("<unresolved>"),
            kinds,
            match rule.combine {
                Combine::And => "and",
                Combine::Or => "or",
            },
            checks.join(", "),
            rule.note,
        );
    }

    let issues = config.validate_rule_section(section);
    if issues.is_empty() {
        println!("No configuration issues");
    } else {
        println!("{} configuration issues:", issues.len());
        for issue in &issues {
            println!("  {issue}");
        }
    }
    Ok(())
}
