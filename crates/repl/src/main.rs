//! Lyra CLI
//!
//! Surface: run a script file, evaluate `-e` expressions, an interactive
//! REPL, `build` for standalone binaries (runtime executable with the source
//! appended as a trailer), and shell completions. Exit code 0 on success,
//! nonzero on an uncaught exception.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};

use lyra_runtime::Value;
use lyra_runtime::env::Env;
use lyrac::EvalError;

mod pack;
mod repl;

#[derive(ClapParser)]
#[command(name = "lyra")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lyra - a Clojure-dialect language runtime", long_about = None)]
struct Cli {
    /// Script file to run
    script: Option<PathBuf>,

    /// Evaluate an expression and print its result
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a standalone binary: this executable with the source embedded
    Build {
        /// Input source file
        input: PathBuf,

        /// Output executable path (defaults to the input stem)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // A packed binary runs its embedded source regardless of arguments.
    if let Some(source) = pack::embedded_source() {
        return run_source(&source, "<embedded>");
    }

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Build { input, output }) => return build_binary(&input, output),
        Some(Commands::Completions { shell }) => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "lyra", &mut std::io::stdout());
            return ExitCode::SUCCESS;
        }
        None => {}
    }

    if let Some(expr) = cli.eval {
        return eval_and_print(&expr);
    }
    if let Some(script) = cli.script {
        let source = match std::fs::read_to_string(&script) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("lyra: cannot read {}: {e}", script.display());
                return ExitCode::FAILURE;
            }
        };
        return run_source(&source, &script.to_string_lossy());
    }

    repl::run()
}

fn bootstrapped_env() -> std::sync::Arc<Env> {
    lyrac::bootstrap::new_env()
}

fn run_source(source: &str, file: &str) -> ExitCode {
    let env = bootstrapped_env();
    let _mutator = env.gc.register_mutator();
    let outcome = lyrac::eval_str(&env, source);
    let code = match outcome {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&env, &e, file, source);
            ExitCode::FAILURE
        }
    };
    run_shutdown_hooks(&env);
    code
}

fn eval_and_print(expr: &str) -> ExitCode {
    let env = bootstrapped_env();
    let _mutator = env.gc.register_mutator();
    let code = match lyrac::eval_str(&env, expr) {
        Ok(v) => {
            let scope = env.roots();
            scope.keep(v);
            match lyra_runtime::printer::pr_str(&env, v) {
                Ok(text) => {
                    println!("{text}");
                    ExitCode::SUCCESS
                }
                Err(exc) => {
                    report_error(&env, &EvalError::Thrown(exc), "<eval>", expr);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            report_error(&env, &e, "<eval>", expr);
            ExitCode::FAILURE
        }
    };
    run_shutdown_hooks(&env);
    code
}

/// Render the uncaught failure box to stderr.
pub fn report_error(env: &Env, e: &EvalError, file: &str, source: &str) {
    match e {
        EvalError::Compile(ce) => {
            eprint!("{}", ce.diagnostic(file, source));
        }
        EvalError::Thrown(exc) => {
            let scope = env.roots();
            scope.keep(*exc);
            let kind = lyra_runtime::error::ex_type(env, *exc)
                .and_then(|t| {
                    if t.heap_tag() == Some(lyra_runtime::HeapTag::Keyword) {
                        Some(lyra_runtime::heap::ObjKeyword::of(t).qualified())
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| "thrown".to_string());
            let message = lyra_runtime::error::ex_message_str(env, *exc).unwrap_or_else(|| {
                lyra_runtime::printer::pr_str(env, *exc)
                    .unwrap_or_else(|_| "unprintable exception".to_string())
            });
            eprint!(
                "{}",
                lyra_runtime::error::format_diagnostic(
                    &kind,
                    &message,
                    lyra_runtime::Phase::Eval,
                    None,
                    None,
                )
            );
        }
    }
}

/// Shutdown hooks run last, in registration order; their failures go to
/// stderr but do not change the exit code.
fn run_shutdown_hooks(env: &Env) {
    for hook in env.take_shutdown_hooks() {
        if let Err(exc) = lyra_runtime::bridge::call_fn(env, hook, &[]) {
            let msg = lyra_runtime::error::ex_message_str(env, exc)
                .unwrap_or_else(|| "unprintable exception".to_string());
            eprintln!("shutdown hook failed: {msg}");
        }
    }
    env.output.flush();
}

fn build_binary(input: &Path, output: Option<PathBuf>) -> ExitCode {
    let source = match std::fs::read_to_string(input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("lyra: cannot read {}: {e}", input.display());
            return ExitCode::FAILURE;
        }
    };
    // Refuse to embed source that does not even read.
    if let Err(e) = lyrac::reader::read_all(&source) {
        eprint!("{}", e.diagnostic(&input.to_string_lossy(), &source));
        return ExitCode::FAILURE;
    }
    let output = output.unwrap_or_else(|| {
        input.with_extension(if cfg!(windows) { "exe" } else { "" })
    });
    match pack::write_packed(&source, &output) {
        Ok(()) => {
            if std::io::stdout().is_terminal() {
                println!("built {}", output.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("lyra: build failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Used by the REPL module as well.
pub(crate) fn print_value(env: &Env, v: Value) {
    let scope = env.roots();
    scope.keep(v);
    match lyra_runtime::printer::pr_str(env, v) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("#<unprintable>"),
    }
}
