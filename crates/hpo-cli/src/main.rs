use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use hpo_core::{ClientDataclass, HpoError, LocationParts, RoundDataclass, ScopedLocation};
use hpo_runner::{HpoConfig, HyperparamsRepository, OnDiskHyperparamsRepository, RepositoryExt};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hpo", version = "0.3.0", about = "Inspect hyperparameter-optimization repositories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the node at a location with its whole subtree.
    Show {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long, default_value = "/")]
        location: String,
        #[arg(long)]
        json: bool,
    },
    /// Rank the successful trials of a round.
    Summary {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long, default_value = hpo_core::DEFAULT_PROJECT)]
        project: String,
        #[arg(long, default_value = hpo_core::DEFAULT_CLIENT)]
        client: String,
        #[arg(long)]
        round: Option<usize>,
        #[arg(long)]
        metric: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Per-trial status table of a round.
    Status {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long, default_value = hpo_core::DEFAULT_PROJECT)]
        project: String,
        #[arg(long, default_value = hpo_core::DEFAULT_CLIENT)]
        client: String,
        #[arg(long)]
        round: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print the scoped log captured at a location.
    Log {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        location: String,
        #[arg(long)]
        json: bool,
    },
    ValidateConfig {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(
                    error_code(&err),
                    format!("{err:#}"),
                    json!({}),
                ));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Show {
            repo,
            location,
            json,
        } => {
            let loc = parse_location(&location)?;
            let node = open_repo(&repo)?.load(&loc)?.to_dict()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "location": loc.to_string(),
                    "node": node
                })));
            }
            println!("{}", serde_json::to_string_pretty(&node)?);
        }
        Commands::Summary {
            repo,
            project,
            client,
            round,
            metric,
            json,
        } => {
            let repo = open_repo(&repo)?;
            let client = load_client(&repo, &project, &client)?;
            let round = pick_round(&client, round)?;
            let metric = match metric.or_else(|| client.main_metric_name.clone()) {
                Some(metric) => metric,
                None => {
                    return Err(anyhow!(
                        "client `{}` has no main metric; pass --metric",
                        client.client_name
                    ))
                }
            };
            let ranked = round.summary(&metric);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summary",
                    "round": round.round_number,
                    "metric": metric,
                    "trials": ranked
                })));
            }
            println!("round: {}", round.round_number);
            println!("metric: {}", metric);
            if ranked.is_empty() {
                println!("no successful trial reported {}", metric);
            }
            for (rank, row) in ranked.iter().enumerate() {
                println!(
                    "{:>3}. trial {:<4} {:<12} {}",
                    rank + 1,
                    row.trial_number,
                    row.score,
                    serde_json::to_string(&row.hyperparams)?
                );
            }
        }
        Commands::Status {
            repo,
            project,
            client,
            round,
            json,
        } => {
            let repo = open_repo(&repo)?;
            let client = load_client(&repo, &project, &client)?;
            let round = pick_round(&client, round)?;
            let rows = status_rows(&round, client.main_metric_name.as_deref());
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "round": round.round_number,
                    "trials": rows
                })));
            }
            println!("round: {}", round.round_number);
            for row in &rows {
                println!(
                    "trial {:<4} {:<8} splits={:<3} score={}{}",
                    row["trial_number"],
                    row["status"].as_str().unwrap_or_default(),
                    row["splits"],
                    row["score"],
                    row["error"]
                        .as_str()
                        .map(|e| format!(" error={}", e))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Log {
            repo,
            location,
            json,
        } => {
            let loc = parse_location(&location)?;
            let text = open_repo(&repo)?.read_log(&loc)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "log",
                    "location": loc.to_string(),
                    "lines": text.lines().collect::<Vec<_>>()
                })));
            }
            print!("{}", text);
        }
        Commands::ValidateConfig { config, json } => {
            let loaded = HpoConfig::load(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate-config",
                    "config": loaded
                })));
            }
            println!("config: {}", config.display());
            println!(
                "campaign: {} trial(s) x {} split(s) on {} worker(s)",
                loaded.campaign.n_trials, loaded.campaign.n_splits, loaded.campaign.n_jobs
            );
            println!("client: {}", loaded.campaign.client_location()?);
            println!("main_metric: {}", loaded.campaign.main_metric_name);
        }
    }
    Ok(None)
}

fn open_repo(dir: &Path) -> Result<OnDiskHyperparamsRepository> {
    if !dir.is_dir() {
        return Err(anyhow!("repository {} is not a directory", dir.display()));
    }
    tracing::debug!(repo = %dir.display(), "opening repository");
    Ok(OnDiskHyperparamsRepository::new(dir))
}

fn parse_location(text: &str) -> Result<ScopedLocation> {
    text.parse::<ScopedLocation>()
        .with_context(|| format!("invalid --location `{}`", text))
}

fn load_client(
    repo: &OnDiskHyperparamsRepository,
    project: &str,
    client: &str,
) -> Result<ClientDataclass> {
    let loc = ScopedLocation::try_from(LocationParts {
        project_name: Some(project.to_string()),
        client_name: Some(client.to_string()),
        ..LocationParts::default()
    })?;
    Ok(repo.load_as::<ClientDataclass>(&loc)?)
}

/// Round `requested`, or the last one when none was asked for.
fn pick_round(client: &ClientDataclass, requested: Option<usize>) -> Result<RoundDataclass> {
    let round = match requested {
        Some(n) => client.rounds.get(&n),
        None => client.last_round(),
    };
    round.cloned().ok_or_else(|| {
        let what = requested.map_or_else(|| "any round".to_string(), |n| format!("round {}", n));
        anyhow::Error::new(HpoError::NotFound(format!(
            "client `{}` has no {}",
            client.client_name, what
        )))
    })
}

fn status_rows(round: &RoundDataclass, metric: Option<&str>) -> Vec<Value> {
    round
        .trials
        .iter()
        .map(|trial| {
            json!({
                "trial_number": trial.trial_number,
                "status": trial.status().as_str(),
                "splits": trial.validation_splits.len(),
                "score": metric.and_then(|m| trial.validation_score(m)),
                "error": trial.lifecycle.error
            })
        })
        .collect()
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<HpoError>() {
        Some(e) => e.code(),
        None => "command_failed",
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Show { json, .. }
        | Commands::Summary { json, .. }
        | Commands::Status { json, .. }
        | Commands::Log { json, .. }
        | Commands::ValidateConfig { json, .. } => *json,
    }
}
