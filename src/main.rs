//! Sheets API server - delegated extension API server for the Google Sheets datasource

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use sheets_apiserver::AuthorizationPolicy;
use sheets_common::telemetry::{init_telemetry, TelemetryConfig};
use sheets_common::{DEFAULT_BIND_ADDRESS, DEFAULT_BIND_PORT, DEFAULT_DATA_ROOT};
use sheets_ext::{start, StartupSettings};

/// Sheets API server - serves the googlesheets.ext.grafana.com API group
#[derive(Parser, Debug)]
#[command(name = "sheets-apiserver", version, about, long_about = None)]
struct Cli {
    /// Directory holding PKI material and the generated kubeconfig
    #[arg(long, env = "SHEETS_DATA_ROOT", default_value = DEFAULT_DATA_ROOT)]
    data_root: PathBuf,

    /// Address to listen on; also placed in the serving certificate
    #[arg(long, env = "SHEETS_BIND_ADDRESS", default_value = DEFAULT_BIND_ADDRESS)]
    bind_address: IpAddr,

    /// HTTPS port
    #[arg(long, env = "SHEETS_BIND_PORT", default_value_t = DEFAULT_BIND_PORT)]
    bind_port: u16,

    /// Kubeconfig of the cluster that authenticates and authorizes requests
    #[arg(long, env = "SHEETS_REMOTE_KUBECONFIG")]
    remote_kubeconfig: Option<PathBuf>,

    /// always-allow, delegated or always-deny
    ///
    /// always-allow admits every request and is meant for development only.
    #[arg(
        long,
        env = "SHEETS_AUTHORIZATION_POLICY",
        default_value_t = AuthorizationPolicy::AlwaysAllow
    )]
    authorization_policy: AuthorizationPolicy,

    /// Treat requests without credentials as system:anonymous
    #[arg(
        long,
        env = "SHEETS_ANONYMOUS_AUTH",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    anonymous_auth: bool,

    /// Extra DNS name for the self-signed fallback certificate (repeatable)
    #[arg(long)]
    alternate_dns: Vec<String>,

    /// Resync period of the shared informer factory
    #[arg(long, default_value = "600")]
    informer_resync_seconds: u64,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "SHEETS_LOG_PRETTY")]
    log_pretty: bool,
}

impl Cli {
    fn settings(&self) -> StartupSettings {
        StartupSettings {
            data_root: self.data_root.clone(),
            bind_address: self.bind_address,
            bind_port: self.bind_port,
            remote_kubeconfig: self.remote_kubeconfig.clone(),
            authorization_policy: self.authorization_policy,
            anonymous_auth: self.anonymous_auth,
            alternate_dns: self.alternate_dns.clone(),
            informer_resync: Duration::from_secs(self.informer_resync_seconds),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sheets_common::install_crypto_provider();

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        pretty: cli.log_pretty,
        ..Default::default()
    })?;

    let settings = cli.settings();
    info!(
        data_root = %settings.data_root.display(),
        policy = %settings.authorization_policy,
        "starting"
    );

    let server = match start(&settings).await {
        Ok(server) => server,
        Err(e) => {
            error!(stage = e.stage(), error = %e, "startup failed");
            return Err(e.into());
        }
    };

    let stopped = server.cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            server.shutdown();
        }
        _ = stopped.cancelled() => {
            info!("server stopped");
        }
    }

    server.wait().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_produce_default_settings() {
        let cli = Cli::parse_from(["sheets-apiserver"]);
        assert_eq!(cli.settings(), StartupSettings::default());
    }

    #[test]
    fn cli_flags_populate_settings() {
        let cli = Cli::parse_from([
            "sheets-apiserver",
            "--data-root",
            "/var/lib/sheets",
            "--bind-address",
            "10.0.0.5",
            "--bind-port",
            "8443",
            "--authorization-policy",
            "delegated",
            "--remote-kubeconfig",
            "/etc/sheets/remote.kubeconfig",
            "--anonymous-auth",
            "false",
            "--alternate-dns",
            "sheets.local",
            "--alternate-dns",
            "sheets.svc",
            "--informer-resync-seconds",
            "60",
        ]);
        let settings = cli.settings();

        assert_eq!(settings.data_root, PathBuf::from("/var/lib/sheets"));
        assert_eq!(settings.bind_address.to_string(), "10.0.0.5");
        assert_eq!(settings.bind_port, 8443);
        assert_eq!(settings.authorization_policy, AuthorizationPolicy::Delegated);
        assert!(!settings.anonymous_auth);
        assert_eq!(settings.alternate_dns, vec!["sheets.local", "sheets.svc"]);
        assert_eq!(settings.informer_resync, Duration::from_secs(60));
    }
}
