//! homebox - main entry point

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use homebox::cli::{Cli, Commands};
use homebox::config_file::{self, StepsFile};
use homebox::error::{EXIT_INTERNAL, EXIT_OK, HomeboxError};
use homebox::orchestrator::{Orchestrator, SessionOptions};
use homebox::process_guard::{self, AbortFlag, ProcessGuard};
use homebox::registry::StepGraph;
use homebox::report;
use homebox::state_store::StateStore;

/// Initialize logging to stderr; `RUST_LOG` overrides the default level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Main application entry point
fn main() {
    init_tracing();
    let cli = Cli::parse_args();
    debug!("CLI arguments parsed: {:?}", cli);

    let code = {
        // Kills any step process group still tracked when we leave this scope
        let _guard = ProcessGuard::new();
        let abort = AbortFlag::new();
        if let Err(e) = process_guard::init_signal_handlers(abort.clone()) {
            warn!("Failed to initialize signal handlers: {}", e);
        }

        match dispatch(cli, abort) {
            Ok(code) => code,
            Err(e) => {
                let code = exit_code_for(&e);
                error!("{:#}", e);
                eprintln!("✗ {:#}", e);
                code
            }
        }
    };
    std::process::exit(code);
}

fn exit_code_for(e: &anyhow::Error) -> i32 {
    e.downcast_ref::<HomeboxError>()
        .map(HomeboxError::exit_code)
        .unwrap_or(EXIT_INTERNAL)
}

fn dispatch(cli: Cli, abort: AbortFlag) -> Result<i32> {
    let steps_path = config_file::resolve_steps_path(cli.steps);
    info!("Loading steps from {}", steps_path.display());
    let steps_file = load_steps_file(&steps_path)?;
    let graph = StepGraph::load(steps_file.to_steps())?;
    debug!("Step graph loaded with {} step(s)", graph.len());

    if let Commands::Validate = cli.command {
        print!("{}", report::render_order(&graph));
        println!("✓ {} steps, no cycles", graph.len());
        return Ok(EXIT_OK);
    }

    let state_dir = config_file::resolve_state_dir(cli.state_dir);
    let store = StateStore::open(&state_dir)?;
    let orchestrator = Orchestrator::new(graph, store, abort);

    match cli.command {
        Commands::Run {
            host,
            only,
            retry_failed,
            jobs,
            dry_run,
        } => {
            let host = config_file::resolve_host(host)?;
            let roles = host_roles(&steps_file, &host)?;
            let options = SessionOptions {
                only,
                retry_failed,
                jobs,
                backoff: steps_file.backoff(),
            };

            if dry_run {
                let preview = orchestrator.preview(&host, &roles, &options)?;
                print!("{}", report::render_preview(&preview));
                return Ok(EXIT_OK);
            }

            info!("Starting session for host {} (jobs: {})", host, options.jobs);
            let session = orchestrator.run_session(&host, &roles, &options)?;
            print!("{}", report::render_session(&session));
            Ok(session.exit_code())
        }
        Commands::Status { host } => {
            let host = config_file::resolve_host(host)?;
            host_roles(&steps_file, &host)?;
            let rows = orchestrator.status(&host)?;
            print!("{}", report::render_status(&host, &rows));
            Ok(EXIT_OK)
        }
        Commands::Reset { host, steps } => {
            let host = config_file::resolve_host(host)?;
            host_roles(&steps_file, &host)?;
            orchestrator.reset(&host, &steps)?;
            println!("✓ Reset to pending: {}", steps.join(", "));
            Ok(EXIT_OK)
        }
        Commands::Validate => Ok(EXIT_OK),
    }
}

/// Read and field-check the steps file; any problem is a configuration error
fn load_steps_file(path: &std::path::Path) -> Result<StepsFile> {
    let file = StepsFile::load_from_file(path)
        .and_then(|file| file.validate().map(|()| file))
        .map_err(|e| HomeboxError::config(format!("{:#}", e)))?;
    Ok(file)
}

fn host_roles(steps_file: &StepsFile, host: &str) -> Result<BTreeSet<String>> {
    Ok(steps_file.host_roles(host)?)
}
