//! `rnx` — the CLI client. Every subcommand prints one JSON
//! object to stdout and maps `JobletError::kind` to the process exit
//! code (the 0/1/2/3/4 table), keeping JSON-only stdout separate from
//! tracing-only stderr.
//!
//! `rnx` constructs its own in-process `Engine` per invocation for now;
//! no RPC transport to a long-running daemon has been wired yet.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use joblet::config::JobletConfig;
use joblet::engine::Engine;
use joblet::errors::JobletError;
use joblet::model::{JobEnvironment, JobSpec, Network, ResourceLimits, Volume, VolumeKind};
use joblet::rpc::JobletApi;
use joblet::workflow::WorkflowYaml;

#[derive(Debug, Parser)]
#[command(name = "rnx")]
#[command(about = "Joblet CLI client", long_about = None)]
struct Cli {
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job and return immediately.
    Run {
        #[arg(long)]
        name: Option<String>,

        #[arg(long = "env", value_name = "KEY=VALUE", action = clap::ArgAction::Append)]
        env_vars: Vec<String>,

        #[arg(long)]
        cpu_percent: Option<u32>,

        #[arg(long)]
        memory_mb: Option<u64>,

        #[arg(long)]
        network: Option<String>,

        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Get a job's current record.
    Status { job_id: String },

    /// List all jobs.
    List,

    /// Stop a running job (SIGTERM, then SIGKILL after 10s).
    Stop { job_id: String },

    /// Delete a terminal job's record.
    Delete { job_id: String },

    /// Create a named volume.
    VolumeCreate {
        name: String,
        #[arg(long, default_value = "filesystem")]
        kind: String,
        #[arg(long)]
        host_path: String,
        #[arg(long, default_value = "0")]
        size_mb: u64,
    },

    /// List volumes.
    VolumeList,

    /// Create a named network.
    NetworkCreate {
        name: String,
        #[arg(long)]
        cidr: String,
        #[arg(long)]
        bridge_name: String,
        #[arg(long)]
        gateway: String,
    },

    /// Submit a workflow from a YAML file.
    WorkflowSubmit { path: String },

    /// Get a workflow's current record.
    WorkflowStatus { workflow_id: String },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let config = match JobletConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            print_error(&JobletError::validation(format!("load config: {e}")));
            std::process::exit(1);
        }
    };
    let self_exe = std::env::current_exe().unwrap_or_else(|_| "joblet".into());
    let engine = Engine::new(&config, self_exe);

    let result = dispatch(&engine, cli.command);
    match result {
        Ok(json) => {
            println!("{json}");
            std::process::exit(0);
        }
        Err(e) => {
            let code = e.kind.exit_code();
            print_error(&e);
            std::process::exit(code);
        }
    }
}

fn dispatch(engine: &Engine, command: Command) -> Result<String, JobletError> {
    match command {
        Command::Run { name, env_vars, cpu_percent, memory_mb, network, command } => {
            let mut environment = JobEnvironment::default();
            for kv in env_vars {
                if let Some((k, v)) = kv.split_once('=') {
                    environment.vars.insert(k.to_string(), v.to_string());
                }
            }
            let spec = JobSpec {
                name,
                command: command[0].clone(),
                args: command[1..].to_vec(),
                environment,
                network,
                limits: ResourceLimits {
                    cpu_percent: cpu_percent.unwrap_or(0),
                    memory_mb: memory_mb.unwrap_or(0),
                    ..Default::default()
                },
                ..Default::default()
            };
            let id = engine.submit_job(spec)?;
            to_json(&IdResponse { id: id.to_string() })
        }
        Command::Status { job_id } => to_json(&engine.get_job(&job_id)?),
        Command::List => to_json(&engine.list_jobs()?),
        Command::Stop { job_id } => {
            let id = resolve_uuid(engine, &job_id)?;
            engine.stop_job(id)?;
            to_json(&OkResponse { ok: true })
        }
        Command::Delete { job_id } => {
            let id = resolve_uuid(engine, &job_id)?;
            engine.delete_job(id)?;
            to_json(&OkResponse { ok: true })
        }
        Command::VolumeCreate { name, kind, host_path, size_mb } => {
            let kind = match kind.as_str() {
                "tmpfs" => VolumeKind::Tmpfs,
                _ => VolumeKind::Filesystem,
            };
            let volume = Volume::new(name, kind, host_path, size_mb);
            to_json(&engine.create_volume(volume)?)
        }
        Command::VolumeList => to_json(&engine.list_volumes()?),
        Command::NetworkCreate { name, cidr, bridge_name, gateway } => {
            let network = Network { name, cidr, bridge_name, gateway };
            to_json(&engine.create_network(network)?)
        }
        Command::WorkflowSubmit { path } => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| JobletError::validation(format!("read workflow file {path}: {e}")))?;
            let definition = WorkflowYaml::parse(&text)?;
            let id = engine.submit_workflow(definition)?;
            to_json(&IdResponse { id: id.to_string() })
        }
        Command::WorkflowStatus { workflow_id } => {
            let id = uuid::Uuid::parse_str(&workflow_id)
                .map_err(|e| JobletError::validation(format!("invalid workflow id: {e}")))?;
            to_json(&engine.get_workflow(id)?)
        }
    }
}

fn resolve_uuid(engine: &Engine, id_or_prefix: &str) -> Result<uuid::Uuid, JobletError> {
    if let Ok(id) = uuid::Uuid::parse_str(id_or_prefix) {
        return Ok(id);
    }
    Ok(engine.get_job(id_or_prefix)?.id)
}

#[derive(Serialize)]
struct IdResponse {
    id: String,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Serialize)]
struct ErrorResponseJson {
    error: String,
    kind: String,
    message: String,
}

fn print_error(e: &JobletError) {
    let body = ErrorResponseJson {
        error: e.kind.as_str().to_string(),
        kind: e.kind.as_str().to_string(),
        message: e.message.clone(),
    };
    if let Ok(json) = serde_json::to_string(&body) {
        println!("{json}");
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, JobletError> {
    serde_json::to_string(value).map_err(|e| JobletError::internal(format!("serialize response: {e}")))
}
