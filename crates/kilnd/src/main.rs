//! kilnd — the Kiln daemon.
//!
//! Single binary that assembles the Kiln subsystems:
//! - Cluster orchestrator (Kubernetes or simulated)
//! - Audit backend (Elasticsearch, local redb, or disabled)
//! - Deployment pipeline
//! - HTTP API + WebSocket endpoint + GitLab webhook
//!
//! # Usage
//!
//! ```text
//! kilnd serve --config /etc/kiln/kiln.toml --port 8000
//! kilnd config --config /etc/kiln/kiln.toml
//! ```

mod serve;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::KilnConfig;

#[derive(Parser)]
#[command(name = "kilnd", about = "Kiln deployment pipeline daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the pipeline over HTTP and WebSocket.
    Serve {
        /// Path to kiln.toml. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides server.port).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print the resolved configuration with secrets redacted.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve { config, port } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            serve::run(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&redacted(config))?);
            Ok(())
        }
    }
}

/// Used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str =
    "info,kilnd=debug,kiln_pipeline=debug,kiln_cluster=debug,kiln_audit=debug,kiln_api=debug";

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// File (or defaults), then environment overrides, then validation.
fn load_config(path: Option<&Path>) -> anyhow::Result<KilnConfig> {
    let mut config = match path {
        Some(path) => KilnConfig::from_file(path)?,
        None => KilnConfig::default(),
    };
    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn redacted(mut config: KilnConfig) -> KilnConfig {
    const HIDDEN: &str = "<redacted>";
    let hide = |value: &mut String| {
        if !value.is_empty() {
            *value = HIDDEN.to_string();
        }
    };
    hide(&mut config.server.api_key);
    hide(&mut config.server.secret_salt);
    hide(&mut config.cluster.store_password);
    if let Some(secret) = config.server.webhook_secret.as_mut() {
        hide(secret);
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve() {
        let cli = Cli::try_parse_from([
            "kilnd",
            "serve",
            "--config",
            "/etc/kiln/kiln.toml",
            "--port",
            "9000",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Command::Serve { config, port } => {
                assert_eq!(config, Some(PathBuf::from("/etc/kiln/kiln.toml")));
                assert_eq!(port, Some(9000));
            }
            Command::Config { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn redaction_hides_secrets_only() {
        let mut config = KilnConfig::default();
        config.server.api_key = "key".to_string();
        config.server.webhook_secret = Some("hook".to_string());
        let shown = redacted(config);
        assert_eq!(shown.server.api_key, "<redacted>");
        assert_eq!(shown.server.webhook_secret.as_deref(), Some("<redacted>"));
        assert_eq!(shown.cluster.store_password, "<redacted>");
        // Empty values stay empty so a missing secret is visible.
        assert_eq!(shown.server.secret_salt, "");
        assert_eq!(shown.server.port, 8000);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            "[cluster]\nbackend = \"simulated\"\n[audit]\nbackend = \"disabled\"\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.cluster.backend, kiln_core::ClusterBackend::Simulated);
        assert_eq!(config.audit.backend, kiln_core::AuditBackend::Disabled);
    }

    #[test]
    fn default_filter_names_crate_targets() {
        // Tracing targets use the library name, with underscores.
        for target in ["kiln_pipeline", "kiln_cluster", "kiln_audit", "kiln_api"] {
            assert!(DEFAULT_LOG_FILTER.contains(&format!("{target}=debug")));
        }
        assert!(!DEFAULT_LOG_FILTER.contains("kiln="));
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn load_config_missing_file_fails() {
        assert!(load_config(Some(Path::new("/nonexistent/kiln.toml"))).is_err());
    }
}
