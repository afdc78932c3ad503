//! colab CLI entry point.

use std::process::ExitCode;

use clap::Parser;
use colab_core::{TracingConfig, init_tracing};

use colab_client::cli::{Cli, Command, ConfigAction};
use colab_client::commands;
use colab_client::config::ClientConfig;
use colab_client::error::{ClientError, ClientResult};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing_config = match cli.command {
        Command::KeepAlive { json_logs: true } => TracingConfig::daemon(),
        _ if cli.debug => TracingConfig::cli_debug(),
        _ => TracingConfig::default(),
    };
    if let Err(e) = init_tracing(tracing_config) {
        eprintln!("warning: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config_path = cli.config.clone().unwrap_or_else(ClientConfig::default_path);
    let config = if cli.config.is_some() {
        ClientConfig::load_from(&config_path).map_err(ClientError::Config)?
    } else {
        ClientConfig::load().map_err(ClientError::Config)?
    };

    match cli.command {
        Command::Login {
            client_id,
            client_secret,
            credentials_file,
            force,
        } => {
            commands::auth::login(
                client_id,
                client_secret,
                credentials_file,
                force,
                &config,
                &config_path,
            )
            .await
        }
        Command::Logout => commands::auth::logout(&config),
        Command::Status => commands::auth::status(&config).await,
        Command::Servers { action } => commands::servers::run(action, &config).await,
        Command::KeepAlive { .. } => commands::keep_alive::run(&config).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => commands::config::dump(&config, &config_path),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(&config_path),
        },
    }
}
