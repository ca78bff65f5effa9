//! Cove CLI - run JavaScript snippets in an isolated context
//!
//! Usage:
//!   cove -c "code"           Run a code string (repeat to run several)
//!   cove -e "expr"           Evaluate an expression
//!   cove script.js           Run a script file
//!   cove                     Read a script from stdin
//!
//! Every snippet of one invocation runs in the same context, so state
//! carries over from one `-c` to the next.

use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Args as ClapArgs, Parser};
use cove::{
    ContextOptions, Cove, EngineConfig, EvaluateOptions, ExecutionResult, GlobalTemplate,
    RunOptions,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Context every snippet of an invocation shares.
const CLI_CONTEXT: &str = "cli";

/// Cove - isolated script contexts with time-bounded execution
#[derive(Parser, Debug)]
#[command(name = "cove", version, about = "Run JavaScript snippets in an isolated context")]
struct Args {
    /// Code to run; repeat to run several snippets in order
    #[arg(short = 'c', long = "code", value_name = "CODE", conflicts_with = "file")]
    code: Vec<String>,

    /// Expression to evaluate after any code has run
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    eval: Option<String>,

    /// Script file; stdin is read when no code, expression or file is given
    file: Option<PathBuf>,

    /// Global template to install (repeatable); defaults to console only
    #[arg(short = 't', long = "template", value_name = "NAME")]
    templates: Vec<GlobalTemplate>,

    /// Custom global as NAME=JSON; values that are not JSON bind as strings
    #[arg(short = 'g', long = "global", value_name = "NAME=VALUE", value_parser = parse_global)]
    globals: Vec<(String, serde_json::Value)>,

    /// Timeout for each snippet, in milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Allow eval and new Function inside the context
    #[arg(long)]
    allow_eval: bool,

    /// Print each result as JSON
    #[arg(long)]
    json: bool,

    /// List the available templates and exit
    #[arg(long)]
    list_templates: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

/// Engine settings, also read from `COVE_*` environment variables.
#[derive(ClapArgs, Debug)]
struct ConfigArgs {
    /// Timeout when none is requested, in milliseconds
    #[arg(long, env = "COVE_DEFAULT_TIMEOUT_MS", default_value_t = 5_000)]
    default_timeout_ms: u64,

    /// Upper bound for any timeout, in milliseconds
    #[arg(long, env = "COVE_MAX_TIMEOUT_MS", default_value_t = 30_000)]
    max_timeout_ms: u64,

    /// Maximum number of live contexts
    #[arg(long, env = "COVE_MAX_CONTEXTS", default_value_t = 100)]
    max_contexts: usize,

    /// Heap ceiling in megabytes
    #[arg(long, env = "COVE_MEMORY_LIMIT_MB", default_value_t = 128)]
    memory_limit_mb: u64,

    /// Skip heap sampling and the memory ceiling check
    #[arg(long, env = "COVE_NO_MEMORY_MONITORING")]
    no_memory_monitoring: bool,

    /// Evict contexts unused for this long, in milliseconds
    #[arg(long, env = "COVE_IDLE_TIMEOUT_MS", default_value_t = 30 * 60 * 1000)]
    idle_timeout_ms: u64,

    /// Period of the idle sweep, in milliseconds
    #[arg(long, env = "COVE_SWEEP_INTERVAL_MS", default_value_t = 60_000)]
    sweep_interval_ms: u64,

    /// Maximum captured console output per run, in bytes
    #[arg(long, env = "COVE_MAX_CONSOLE_BYTES", default_value_t = 1024 * 1024)]
    max_console_bytes: usize,

    /// Reject code matching denied capability patterns before running it
    #[arg(long, env = "COVE_SECURITY_SCAN")]
    scan: bool,

    /// Do not capture console output
    #[arg(long, env = "COVE_NO_CONSOLE")]
    no_console: bool,
}

impl ConfigArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms),
            max_contexts: self.max_contexts,
            console_capture: !self.no_console,
            memory_monitoring: !self.no_memory_monitoring,
            memory_limit_mb: self.memory_limit_mb,
            max_console_bytes: self.max_console_bytes,
            security_scan: self.scan,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

fn parse_global(s: &str) -> Result<(String, serde_json::Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if name.is_empty() {
        return Err("global name must not be empty".to_string());
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// One unit of work for the shared context.
#[derive(Debug)]
enum Snippet {
    Code(String),
    Expression(String),
}

impl Args {
    fn context_options(&self) -> ContextOptions {
        let mut options = ContextOptions::default();
        if !self.templates.is_empty() {
            options = options.with_templates(self.templates.iter().copied());
        }
        for (name, value) in &self.globals {
            options = options.with_global(name.clone(), value.clone());
        }
        if self.allow_eval {
            options = options.with_code_generation(true);
        }
        options
    }

    fn snippets(&self) -> Result<Vec<Snippet>> {
        let mut snippets: Vec<Snippet> = self.code.iter().cloned().map(Snippet::Code).collect();
        if let Some(path) = &self.file {
            let script = std::fs::read_to_string(path)
                .with_context(|| format!("{}: failed to read", path.display()))?;
            snippets.push(Snippet::Code(script));
        } else if snippets.is_empty() && self.eval.is_none() {
            let mut script = String::new();
            io::stdin()
                .read_to_string(&mut script)
                .context("failed to read stdin")?;
            snippets.push(Snippet::Code(script));
        }
        if let Some(expr) = &self.eval {
            snippets.push(Snippet::Expression(expr.clone()));
        }
        Ok(snippets)
    }
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }
    for line in &result.console_output {
        println!("{}", line);
    }
    match (&result.result, &result.error) {
        (_, Some(err)) => {
            eprintln!("cove: {}: {}", err.code(), err.message);
            if let Some(stack) = &err.stack {
                eprintln!("{}", stack.trim_end());
            }
        }
        (Some(serde_json::Value::String(s)), None) => println!("{}", s),
        (Some(value), None) => println!("{}", value),
        (None, None) => {}
    }
    Ok(())
}

async fn run(args: Args) -> Result<bool> {
    let cove = Cove::start(args.config.engine_config()).await?;
    cove.create(CLI_CONTEXT, args.context_options()).await?;

    let mut ok = true;
    for snippet in args.snippets()? {
        let result = match snippet {
            Snippet::Code(code) => {
                let mut options = RunOptions::in_context(CLI_CONTEXT);
                options.timeout_ms = args.timeout;
                if let Some(path) = &args.file {
                    options = options.with_filename(path.display().to_string());
                }
                cove.run(code, options).await?
            }
            Snippet::Expression(expr) => {
                let options = EvaluateOptions {
                    context_id: Some(CLI_CONTEXT.to_string()),
                    timeout_ms: args.timeout,
                };
                cove.evaluate(expr, options).await?
            }
        };
        print_result(&result, args.json)?;
        if !result.success {
            ok = false;
            break;
        }
    }

    cove.shutdown().await?;
    Ok(ok)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()))
        .init();

    let args = Args::parse();

    if args.list_templates {
        for template in GlobalTemplate::ALL {
            println!(
                "{:<10} {:<40} {}",
                template.name(),
                template.bindings().join(", "),
                template.description()
            );
        }
        return;
    }

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("cove: {:#}", e);
            std::process::exit(1);
        }
    }
}
