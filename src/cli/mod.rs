//! CLI module for cloudflow
//!
//! Subcommands:
//! - `cloudflow deploy` - Run a deployment pipeline (or print its plan)
//! - `cloudflow serve` - Run the chat relay and key management server
//! - `cloudflow validate` - Check a pipeline file

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "cloudflow")]
#[command(about = "Cloud Run deployment pipelines and an OpenAI-compatible chat relay")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to a .env file overlaid on the process environment
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deployment pipeline
    Deploy(DeployArgs),

    /// Run the chat relay HTTP server
    Serve(ServeArgs),

    /// Validate a pipeline file
    Validate(ValidateArgs),
}

/// Arguments for the deploy command
#[derive(Parser, Debug)]
pub struct DeployArgs {
    /// Pipeline file (JSON, JSONC or YAML); the standard pipeline when omitted
    #[arg(long, value_name = "FILE")]
    pub pipeline: Option<PathBuf>,

    /// Seed a configuration value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Print the commands each step would issue without running them
    #[arg(long)]
    pub dry_run: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Bind address for the server
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Persist the in-memory key store under the user data directory
    #[arg(long)]
    pub persist_store: bool,
}

/// Arguments for the validate command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline file
    pub file: PathBuf,
}

/// Parse `KEY=VALUE`; the value may itself contain `=`
pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", input))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", input));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("projectId=demo").unwrap(),
            ("projectId".to_string(), "demo".to_string())
        );
        assert_eq!(
            parse_key_value("url=https://x?a=b").unwrap(),
            ("url".to_string(), "https://x?a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=v").is_err());
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::parse_from([
            "cloudflow",
            "deploy",
            "--pipeline",
            "flow.yaml",
            "--set",
            "projectId=demo",
            "--set",
            "region=europe-west1",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.pipeline, Some(PathBuf::from("flow.yaml")));
                assert_eq!(args.set.len(), 2);
                assert_eq!(args.set[1].1, "europe-west1");
                assert!(args.dry_run);
                assert!(!args.json);
            }
            _ => panic!("Expected Deploy command"),
        }
    }

    #[test]
    fn test_parse_serve_defaults() {
        let cli = Cli::parse_from(["cloudflow", "serve"]);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.bind_addr, "0.0.0.0");
                assert_eq!(args.port, 8080);
                assert!(!args.persist_store);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_parse_validate() {
        let cli = Cli::parse_from(["cloudflow", "validate", "pipeline.json"]);
        match cli.command {
            Commands::Validate(args) => {
                assert_eq!(args.file, PathBuf::from("pipeline.json"));
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["cloudflow", "serve", "-vv", "--env-file", ".env.local"]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.env_file, Some(PathBuf::from(".env.local")));
    }
}
