use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};

use zen::bytecode::{self, Bytecode};
use zen::diagnostic::{Diagnostic, ansi::AnsiRenderer, json};
use zen::optimizer::{self, DEFAULT_ROUNDS};
use zen::vm::Vm;

#[derive(Parser)]
#[command(name = "zen", version, about = "Compile, optimize and run zen programs")]
struct Cli {
    /// Report errors as JSON lines on stderr
    #[arg(long, global = true)]
    json: bool,

    /// Disable ANSI colors in error output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile and run a source file
    Run {
        file: PathBuf,
        #[command(flatten)]
        opt: OptArgs,
    },
    /// Print the (optimized) bytecode of a source file
    Disasm {
        file: PathBuf,
        #[command(flatten)]
        opt: OptArgs,
    },
    /// Compile a source file to a .zenb bytecode file
    Compile {
        file: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        opt: OptArgs,
    },
    /// Run a compiled .zenb bytecode file
    Exec { file: PathBuf },
    /// Print the parsed program as JSON
    Ast { file: PathBuf },
}

#[derive(Args)]
struct OptArgs {
    /// Maximum optimizer rounds
    #[arg(long, default_value_t = DEFAULT_ROUNDS)]
    opt_rounds: usize,

    /// Skip the optimizer entirely
    #[arg(long, conflicts_with = "opt_rounds")]
    no_opt: bool,
}

impl OptArgs {
    fn rounds(&self) -> usize {
        if self.no_opt { 0 } else { self.opt_rounds }
    }
}

/// A failure plus whatever is needed to render it.
struct Failure {
    diagnostic: Diagnostic,
}

impl Failure {
    fn io(path: &Path, e: std::io::Error) -> Self {
        Failure { diagnostic: Diagnostic::error(format!("{}: {}", path.display(), e)) }
    }

    fn pipeline(e: zen::Error, source: Option<&str>) -> Self {
        let mut diagnostic = Diagnostic::from(&e);
        if let Some(source) = source {
            diagnostic = diagnostic.with_source(source);
        }
        Failure { diagnostic }
    }
}

fn read_source(path: &Path) -> Result<String, Failure> {
    std::fs::read_to_string(path).map_err(|e| Failure::io(path, e))
}

fn compile_file(path: &Path, rounds: usize) -> Result<Bytecode, Failure> {
    let source = read_source(path)?;
    let name = path.display().to_string();
    let bytecode = zen::compile_source(&name, &source).map_err(|e| Failure::pipeline(e, Some(&source)))?;
    Ok(optimizer::optimize_with_rounds(&bytecode, rounds))
}

fn execute(bytecode: &Bytecode) -> Result<(), Failure> {
    Vm::new(bytecode)
        .run()
        .map_err(|e| Failure::pipeline(e.into(), None))
}

fn dispatch(command: Command) -> Result<(), Failure> {
    match command {
        Command::Run { file, opt } => execute(&compile_file(&file, opt.rounds())?),
        Command::Disasm { file, opt } => {
            print!("{}", compile_file(&file, opt.rounds())?.disassemble());
            Ok(())
        }
        Command::Compile { file, output, opt } => {
            let bytecode = compile_file(&file, opt.rounds())?;
            let bytes = bytecode::serialize(&bytecode).map_err(|e| Failure::pipeline(e.into(), None))?;
            std::fs::write(&output, bytes).map_err(|e| Failure::io(&output, e))
        }
        Command::Exec { file } => {
            let bytes = std::fs::read(&file).map_err(|e| Failure::io(&file, e))?;
            let bytecode = bytecode::deserialize(&bytes).map_err(|e| Failure::pipeline(e.into(), None))?;
            execute(&bytecode)
        }
        Command::Ast { file } => {
            let source = read_source(&file)?;
            let program = zen::parse_source(&source).map_err(|e| Failure::pipeline(e, Some(&source)))?;
            match serde_json::to_string_pretty(&program) {
                Ok(text) => {
                    println!("{}", text);
                    Ok(())
                }
                Err(e) => Err(Failure { diagnostic: Diagnostic::error(format!("serialization error: {}", e)) }),
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let use_color = !cli.no_color && std::io::stderr().is_terminal();
    match dispatch(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            if cli.json {
                eprintln!("{}", json::render(&failure.diagnostic));
            } else {
                eprint!("{}", AnsiRenderer { use_color }.render(&failure.diagnostic));
            }
            ExitCode::FAILURE
        }
    }
}
