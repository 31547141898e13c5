//! Oracle-driven exploratory testing harness CLI.
//!
//! `harness explore` discovers every testable sandbox under a scope
//! directory, drives each one through an oracle-guided exploration run and
//! writes the finalized regression proposals (JSON plus a rendered test
//! script) to the output directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use harness::core::decision::TestResult;
use harness::exit_codes;
use harness::explore::{ExploreConfig, run_exploration};
use harness::io::config::{HarnessConfig, load_config, write_config};
use harness::io::oracle::CommandOracle;
use harness::logging;
use harness::scope::{RuleDocument, discover_sandboxes, load_rule_documents};

#[derive(Parser)]
#[command(
    name = "harness",
    version,
    about = "Oracle-driven exploratory testing harness"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default `harness.toml` in the current directory.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// List every valid testable sandbox under a scope directory.
    List { scope_dir: PathBuf },
    /// Run one oracle-guided exploration per discovered sandbox.
    Explore {
        scope_dir: PathBuf,
        /// Directory of rule documents handed to the oracle.
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Only explore the sandbox with this name.
        #[arg(long)]
        sandbox: Option<String>,
        /// Directory for proposal artifacts (JSON + rendered test).
        #[arg(long, default_value = "proposals")]
        out: PathBuf,
        /// Path to `harness.toml`.
        #[arg(long, default_value = "harness.toml")]
        config: PathBuf,
    },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::List { scope_dir } => cmd_list(&scope_dir),
        Command::Explore {
            scope_dir,
            rules,
            sandbox,
            out,
            config,
        } => cmd_explore(&scope_dir, rules.as_deref(), sandbox.as_deref(), &out, &config),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let path = Path::new("harness.toml");
    if path.exists() && !force {
        return Err(anyhow!(
            "harness.toml already exists (use --force to overwrite)"
        ));
    }
    write_config(path, &HarnessConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_list(scope_dir: &Path) -> Result<i32> {
    let sandboxes = discover_sandboxes(scope_dir, &HarnessConfig::default())?;
    for sandbox in &sandboxes {
        println!("{}", sandbox.name());
    }
    Ok(exit_codes::OK)
}

fn cmd_explore(
    scope_dir: &Path,
    rules_dir: Option<&Path>,
    only: Option<&str>,
    out_dir: &Path,
    config_path: &Path,
) -> Result<i32> {
    let config = load_config(config_path)?;
    let rules: Vec<RuleDocument> = match rules_dir {
        Some(dir) => load_rule_documents(dir)?,
        None => Vec::new(),
    };

    let mut sandboxes = discover_sandboxes(scope_dir, &config)?;
    if let Some(name) = only {
        sandboxes.retain(|s| s.name() == name);
        if sandboxes.is_empty() {
            return Err(anyhow!("no sandbox named '{name}' under {}", scope_dir.display()));
        }
    }
    if sandboxes.is_empty() {
        return Err(anyhow!(
            "no testable sandboxes under {}",
            scope_dir.display()
        ));
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("create output directory {}", out_dir.display()))?;

    let explore_config = ExploreConfig {
        step_limit: config.step_limit,
    };
    let mut any_failed = false;
    for mut sandbox in sandboxes {
        let mut oracle = CommandOracle::new(
            config.oracle.command.clone(),
            rules.clone(),
            config.oracle_timeout(),
        )?;
        let name = sandbox.name().to_string();
        let outcome = run_exploration(&mut sandbox, &mut oracle, &explore_config)
            .with_context(|| format!("explore sandbox '{name}'"))?;

        let json_path = out_dir.join(format!("{name}.json"));
        let mut payload = serde_json::to_string_pretty(&outcome.proposal)?;
        payload.push('\n');
        fs::write(&json_path, payload)
            .with_context(|| format!("write {}", json_path.display()))?;

        let script_path = out_dir.join(format!("{name}.rs"));
        outcome
            .proposal
            .write_to_file(&script_path, &scope_dir.join(&name))?;

        println!(
            "{name}: {} after {} steps ({})",
            outcome.result.as_str(),
            outcome.steps_executed,
            outcome.conclusion
        );
        if outcome.result == TestResult::Failed {
            any_failed = true;
        }
    }

    Ok(if any_failed {
        exit_codes::FAILED
    } else {
        exit_codes::OK
    })
}
