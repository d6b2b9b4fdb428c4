use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use cloudflow::cli::{self, Cli, Commands};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

/// Returns whether the command succeeded
async fn run(args: Cli) -> anyhow::Result<bool> {
    let env = cli::load_environment(args.env_file.as_deref())
        .context("Failed to load environment")?;

    match args.command {
        Commands::Deploy(deploy) => {
            let output = cli::deploy(&deploy, &env)
                .await
                .context("Deployment pipeline could not start")?;
            println!("{}", output.text);
            Ok(output.succeeded)
        }
        Commands::Serve(serve) => {
            cli::serve(&serve, &env).await.context("Server error")?;
            Ok(true)
        }
        Commands::Validate(validate) => {
            let result = cli::validate_pipeline_file(&validate.file);
            print!(
                "{}",
                cli::format_validation_result(&result, &validate.file.display().to_string())
            );
            Ok(result.valid)
        }
    }
}
