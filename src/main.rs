//! piprun - launch programs as PiP tasks

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pip_runtime::runtime::loader::check_pie;
use pip_runtime::runtime::spawn::SpawnRequest;
use pip_runtime::runtime::RuntimeBuilder;
use pip_runtime::util::config::RuntimeConfig;
use pip_runtime::util::logger;
use pip_runtime::{NAME, VERSION};

/// Run position-independent programs as tasks sharing one address space
#[derive(Parser, Debug)]
#[command(name = "piprun")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Spawn copies of a program and wait for all of them
    Exec {
        /// Number of tasks to spawn
        #[arg(short = 'n', long, default_value_t = 1)]
        ntasks: usize,

        /// Pin task i to core (CORE + i)
        #[arg(short, long)]
        core: Option<usize>,

        /// Execution mode, overriding PIP_MODE
        #[arg(short, long)]
        mode: Option<String>,

        /// Program to run; must be a PIE
        #[arg(value_name = "PROGRAM")]
        program: String,

        /// Arguments passed to every task
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the execution mode this environment negotiates
    Mode {
        /// Mode to request instead of PIP_MODE
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Print the effective configuration as JSON
    Config,

    /// Check whether a file can be loaded as a task
    Check {
        #[arg(value_name = "PROGRAM")]
        program: String,
    },
}

fn config_with_mode(mode: Option<String>) -> RuntimeConfig {
    let config = RuntimeConfig::from_env();
    match mode {
        Some(mode) => config.with_mode(mode),
        None => config,
    }
}

fn exec(
    ntasks: usize,
    core: Option<usize>,
    mode: Option<String>,
    program: String,
    args: Vec<String>,
) -> Result<i32> {
    let mut rt = RuntimeBuilder::new()
        .ntasks(ntasks)
        .config(config_with_mode(mode))
        .create_root()
        .context("Failed to initialize the runtime")?;

    let argv: Vec<String> = std::iter::once(program.clone()).chain(args).collect();
    let mut spawned = 0;
    for i in 0..ntasks {
        let mut request = SpawnRequest::new(program.as_str()).args(argv.iter().cloned());
        if let Some(core) = core {
            request = request.core(core + i);
        }
        match rt.spawn(request) {
            Ok(_) => spawned += 1,
            Err(e) => {
                eprintln!("piprun: task {} of '{}' failed to start: {}", i, program, e);
                break;
            }
        }
    }

    let mut status = 0;
    for _ in 0..spawned {
        let (id, code) = rt.wait_any().context("Failed to wait for tasks")?;
        if code != 0 {
            eprintln!("piprun: task {} exited with {}", id, code);
            status = status.max(code);
        }
    }
    rt.fin().context("Failed to finalize the runtime")?;
    if spawned < ntasks {
        bail!("only {} of {} tasks were started", spawned, ntasks);
    }
    Ok(status)
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        logger::init_debug();
        eprintln!("{} version: {}", NAME, VERSION);
    } else {
        logger::init();
    }

    match args.command {
        Commands::Exec {
            ntasks,
            core,
            mode,
            program,
            args,
        } => {
            let status = exec(ntasks, core, mode, program.clone(), args)
                .with_context(|| format!("Failed to run: {}", program))?;
            std::process::exit(status);
        }
        Commands::Mode { mode } => {
            let mut rt = RuntimeBuilder::new()
                .ntasks(1)
                .config(config_with_mode(mode))
                .create_root()
                .context("Failed to negotiate an execution mode")?;
            println!("{}", rt.mode_str()?);
            rt.fin()?;
        }
        Commands::Config => {
            let config = RuntimeConfig::from_env();
            let json = serde_json::to_string_pretty(&config).context("Failed to encode configuration")?;
            println!("{}", json);
        }
        Commands::Check { program } => {
            check_pie(Path::new(&program)).with_context(|| format!("Failed to check: {}", program))?;
            println!("{}: ok", program);
        }
    }

    Ok(())
}
