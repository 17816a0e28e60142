use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use strand::config::EngineConfig;
use strand::vm::dump::{self, hex};
use strand::vm::{Engine, HostError, Module, OpContext, OpHandler, Operation};

/// Bytes shown per parameter in the operation trace.
const TRACE_PARAM_BYTES: usize = 8;

#[derive(Parser)]
#[command(name = "strand")]
#[command(about = "Resumable bytecode VM with host-dispatched operations", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a bytecode file, printing every operation it dispatches
    Run {
        /// The bytecode file to run
        file: PathBuf,

        /// Exported function to start at
        #[arg(long, default_value = "main")]
        entry: String,

        /// Heap segment size in bytes (overrides the config file)
        #[arg(long)]
        memory: Option<usize>,

        /// Stack segment size in bytes (overrides the config file)
        #[arg(long)]
        stack: Option<usize>,

        /// Engine configuration file (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Pause the run after every N operations
        #[arg(long, value_name = "N")]
        pause_every: Option<u64>,
    },
    /// Print a disassembly of a bytecode file
    Dump {
        /// The bytecode file to dump
        file: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            file,
            entry,
            memory,
            stack,
            config,
            pause_every,
        } => run_file(&file, &entry, memory, stack, config.as_deref(), pause_every),
        Commands::Dump { file, json } => dump_file(&file, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Install a stderr subscriber. `RUST_LOG` wins unless `-v` is given.
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn read_file(path: &Path) -> Result<Vec<u8>, String> {
    std::fs::read(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))
}

fn run_file(
    path: &Path,
    entry: &str,
    memory: Option<usize>,
    stack: Option<usize>,
    config: Option<&Path>,
    pause_every: Option<u64>,
) -> Result<(), String> {
    let config = match config {
        Some(path) => EngineConfig::from_file(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    let memory_size = memory.unwrap_or(config.memory_size);
    let stack_size = stack.unwrap_or(config.stack_size);

    let bytecode = read_file(path)?;
    let engine = Engine::new(config);
    let handle = engine
        .start(&bytecode, entry, memory_size, stack_size)
        .map_err(|e| e.to_string())?;

    let mut tracer = TraceHandler {
        count: 0,
        pause_every: pause_every.filter(|&n| n > 0),
    };
    while engine.consume(handle, &mut tracer).map_err(|e| e.to_string())? {
        println!("-- paused after {} operations --", tracer.count);
    }
    println!("-- finished after {} operations --", tracer.count);
    Ok(())
}

fn dump_file(path: &Path, json: bool) -> Result<(), String> {
    let bytecode = read_file(path)?;
    let module = Module::from_bytes(&bytecode).map_err(|e| e.to_string())?;
    if json {
        let text = dump::to_json(&module).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        print!("{}", dump::disassemble(&module));
    }
    Ok(())
}

/// Prints each operation with the leading bytes of its parameters.
struct TraceHandler {
    count: u64,
    pause_every: Option<u64>,
}

impl OpHandler for TraceHandler {
    fn handle(&mut self, ctx: &mut OpContext<'_>, op: &Operation<'_>) -> Result<(), HostError> {
        self.count += 1;
        let capacity = ctx.state_size()?;

        let params: Vec<String> = op
            .params
            .iter()
            .map(|&address| {
                let len = TRACE_PARAM_BYTES.min(capacity.saturating_sub(address));
                match ctx.load_bytes(address, len) {
                    Ok(bytes) => format!("@{}: {}", address, hex(bytes)),
                    Err(_) => format!("@{}: <out of bounds>", address),
                }
            })
            .collect();
        let targets: Vec<String> = op.targets.iter().map(|address| format!("@{}", address)).collect();

        println!(
            "{} params=[{}] targets=[{}]",
            op.name,
            params.join(", "),
            targets.join(", ")
        );

        if let Some(every) = self.pause_every {
            if self.count % every == 0 {
                ctx.pause();
            }
        }
        Ok(())
    }
}
