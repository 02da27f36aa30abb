//! Command-line / environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::orchestrator::OrchestratorConfig;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "VoiceDock realtime voice agent server")]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "VOICEDOCK_BIND", default_value = "0.0.0.0:3000")]
    pub bind: String,

    /// Media provider application id
    #[arg(long, env = "AGORA_APP_ID")]
    pub app_id: Option<String>,

    /// Media provider application certificate. Enables welcome credentials.
    #[arg(long, env = "AGORA_APP_CERT")]
    pub app_cert: Option<String>,

    /// Program run once per session as the agent worker
    #[arg(long, env = "VOICEDOCK_WORKER_COMMAND")]
    pub worker_command: Option<PathBuf>,

    /// Extra argument for the worker program (repeatable)
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Seconds a stopped worker gets before it is reclaimed
    #[arg(long, default_value_t = 5)]
    pub stop_timeout_secs: u64,

    /// Seconds between the stop line and killing the worker process
    #[arg(long, default_value_t = 3)]
    pub worker_stop_grace_secs: u64,

    /// Lifetime of issued channel tokens
    #[arg(long, default_value_t = 3600)]
    pub token_ttl_secs: u64,

    /// Leave a client's sessions running after its connection drops
    #[arg(long)]
    pub keep_sessions_on_disconnect: bool,

    /// Write logs to <dir>/server.log instead of stderr
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid --bind {}", self.bind))
    }

    pub fn orchestrator_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let app_id = self.app_id.as_deref().map(str::trim).unwrap_or_default();
        if app_id.is_empty() {
            bail!("--app-id (or AGORA_APP_ID) is required");
        }
        if self.stop_timeout_secs == 0 {
            bail!("--stop-timeout-secs must be at least 1");
        }
        Ok(OrchestratorConfig {
            app_id: app_id.to_string(),
            app_cert: self.app_cert().map(str::to_string),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
        })
    }

    pub fn worker_command(&self) -> anyhow::Result<PathBuf> {
        match &self.worker_command {
            Some(path) if !path.as_os_str().is_empty() => Ok(path.clone()),
            _ => bail!("--worker-command (or VOICEDOCK_WORKER_COMMAND) is required"),
        }
    }

    /// The certificate, if one was given and is not blank
    pub fn app_cert(&self) -> Option<&str> {
        self.app_cert
            .as_deref()
            .map(str::trim)
            .filter(|cert| !cert.is_empty())
    }

    pub fn worker_stop_grace(&self) -> Duration {
        Duration::from_secs(self.worker_stop_grace_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["voicedock"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_apply() {
        let cli = parse(&["--app-id", "app-123", "--worker-command", "/usr/bin/agent"]);

        assert_eq!(cli.bind, "0.0.0.0:3000");
        assert_eq!(cli.stop_timeout_secs, 5);
        assert_eq!(cli.worker_stop_grace(), Duration::from_secs(3));
        assert_eq!(cli.token_ttl(), Duration::from_secs(3600));
        assert!(!cli.keep_sessions_on_disconnect);
        assert!(cli.log_dir.is_none());
    }

    #[test]
    fn orchestrator_config_carries_app_settings() {
        let cli = parse(&[
            "--app-id",
            " app-123 ",
            "--app-cert",
            "cert-abc",
            "--stop-timeout-secs",
            "9",
        ]);

        let config = cli.orchestrator_config().unwrap();
        assert_eq!(config.app_id, "app-123");
        assert_eq!(config.app_cert.as_deref(), Some("cert-abc"));
        assert_eq!(config.stop_timeout, Duration::from_secs(9));
    }

    #[test]
    fn missing_app_id_is_rejected() {
        let cli = Cli {
            app_id: Some("   ".into()),
            ..parse(&[])
        };
        assert!(cli.orchestrator_config().is_err());
    }

    #[test]
    fn blank_certificate_counts_as_absent() {
        let cli = parse(&["--app-id", "a", "--app-cert", " "]);
        assert!(cli.app_cert().is_none());
        assert!(cli.orchestrator_config().unwrap().app_cert.is_none());
    }

    #[test]
    fn worker_args_are_repeatable() {
        let cli = parse(&[
            "--worker-command",
            "python3",
            "--worker-arg",
            "agent.py",
            "--worker-arg",
            "--verbose",
        ]);

        assert_eq!(cli.worker_command().unwrap(), PathBuf::from("python3"));
        assert_eq!(cli.worker_args, vec!["agent.py", "--verbose"]);
    }

    #[test]
    fn bad_bind_address_is_an_error() {
        let cli = parse(&["--bind", "nowhere"]);
        assert!(cli.bind_addr().is_err());
    }
}
