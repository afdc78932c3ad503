//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colab_core::Variant;
use uuid::Uuid;

/// colab - Sign in to Google Colab and manage runtime assignments
#[derive(Debug, Parser)]
#[command(name = "colab")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "COLAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in with Google
    Login {
        /// OAuth client ID
        #[arg(long, env = "COLAB_CLIENT_ID")]
        client_id: Option<String>,

        /// OAuth client secret
        #[arg(long, env = "COLAB_CLIENT_SECRET")]
        client_secret: Option<String>,

        /// Path to a Google Cloud Console OAuth client JSON file
        #[arg(long)]
        credentials_file: Option<PathBuf>,

        /// Sign in again even if already signed in
        #[arg(long, short)]
        force: bool,
    },

    /// Forget stored credentials
    Logout,

    /// Show sign-in and assignment status
    Status,

    /// Manage assigned servers
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },

    /// Keep assigned servers alive until interrupted
    KeepAlive {
        /// Log JSON lines instead of human-readable output
        #[arg(long)]
        json_logs: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Server actions.
#[derive(Debug, Subcommand)]
pub enum ServersAction {
    /// List assigned servers
    List {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// List server shapes you can assign right now
    Available,

    /// Assign a new server
    Assign {
        /// Machine family: cpu, gpu or tpu
        #[arg(long, default_value = "cpu")]
        variant: Variant,

        /// Accelerator model, e.g. T4 or V5E1
        #[arg(long)]
        accelerator: Option<String>,
    },

    /// Release a server
    Unassign { id: Uuid },

    /// Fetch a fresh proxy token for a server
    Refresh { id: Uuid },

    /// Drop servers the backend no longer knows about
    Reconcile,

    /// Print the most recent server, assigning one if there is none
    Latest,
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_assign() {
        let cli = Cli::try_parse_from([
            "colab", "servers", "assign", "--variant", "gpu", "--accelerator", "T4",
        ])
        .unwrap();
        match cli.command {
            Command::Servers {
                action: ServersAction::Assign { variant, accelerator },
            } => {
                assert_eq!(variant, Variant::Gpu);
                assert_eq!(accelerator.as_deref(), Some("T4"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_ids_and_variants() {
        assert!(Cli::try_parse_from(["colab", "servers", "unassign", "nope"]).is_err());
        assert!(
            Cli::try_parse_from(["colab", "servers", "assign", "--variant", "quantum"]).is_err()
        );
    }

    #[test]
    fn keep_alive_json_logs_flag() {
        let cli = Cli::try_parse_from(["colab", "keep-alive", "--json-logs"]).unwrap();
        assert!(matches!(cli.command, Command::KeepAlive { json_logs: true }));
    }
}
