mod serve;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

/// Accord coordination run engine.
#[derive(Parser)]
#[command(name = "accord", version, about = "Accord coordination run engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a template JSON document and report validation issues
    Compile {
        /// Path to the template JSON file
        file: PathBuf,
    },

    /// Start the HTTP/WebSocket API server
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
        /// API key required on non-participant requests
        #[arg(long, env = "ACCORD_API_KEY")]
        api_key: Option<String>,
        /// Per-IP request limit per minute
        #[arg(long, env = "ACCORD_RATE_LIMIT", default_value_t = 60)]
        rate_limit: u64,
        /// Template JSON files to publish at startup
        templates: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compile { file } => {
            if let Err(code) = compile_file(&file) {
                process::exit(code);
            }
        }
        Commands::Serve {
            port,
            api_key,
            rate_limit,
            templates,
        } => {
            if let Err(e) = serve::start_server(port, api_key, rate_limit, templates).await {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    }
}

fn compile_file(path: &PathBuf) -> Result<(), i32> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        eprintln!("Error: cannot read {}: {e}", path.display());
        1
    })?;
    let doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        eprintln!("Error: {} is not valid JSON: {e}", path.display());
        1
    })?;
    match accord_core::compile(&doc) {
        Ok(template) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&template).unwrap_or_default()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} validation issue(s):", e.issues.len());
            for issue in &e.issues {
                eprintln!("  {}: {}", issue.field, issue.message);
            }
            Err(1)
        }
    }
}
