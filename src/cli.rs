use clap::Parser;
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "gtalk-sync")]
#[command(version)]
#[command(about = "Terminal client for a gTalk chat channel")]
pub struct Args {
    /// Session token presented to the chat server
    #[arg(long, env = "GTALK_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Channel to join
    #[arg(long, short)]
    pub channel: String,

    /// Server (guild) the channel belongs to
    #[arg(long, short)]
    pub guild: Option<String>,

    /// TOML config file; flags below override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Websocket endpoint (e.g. ws://localhost:8080/ws)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Base URL for the HTTP history fallback; empty string disables it
    #[arg(long)]
    pub http_base: Option<String>,

    /// Your user id, used to reconcile echoes of your own messages
    #[arg(long, default_value = "0")]
    pub user_id: String,

    /// Display name shown on your own messages
    #[arg(long, default_value = "me")]
    pub username: String,
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(base) = &self.http_base {
            config.http_base_url = base.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["gtalk-sync", "--token", "t1", "--channel", "c1"]);
        assert_eq!(args.token, "t1");
        assert_eq!(args.channel, "c1");
        assert!(args.guild.is_none());
        assert!(args.config.is_none());
        assert_eq!(args.user_id, "0");
        assert_eq!(args.username, "me");
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "gtalk-sync",
            "--token",
            "t1",
            "-c",
            "c9",
            "-g",
            "g2",
            "--endpoint",
            "ws://chat.test/ws",
            "--http-base",
            "",
            "--user-id",
            "7",
            "--username",
            "amy",
        ]);
        assert_eq!(args.guild.as_deref(), Some("g2"));
        assert_eq!(args.endpoint.as_deref(), Some("ws://chat.test/ws"));
        assert_eq!(args.http_base.as_deref(), Some(""));
        assert_eq!(args.user_id, "7");
        assert_eq!(args.username, "amy");
    }

    #[test]
    fn test_args_missing_channel_is_error() {
        assert!(Args::try_parse_from(["gtalk-sync", "--token", "t"]).is_err());
    }

    #[test]
    fn test_resolve_config_defaults() {
        let args = Args::parse_from(["gtalk-sync", "--token", "t", "--channel", "c"]);
        assert_eq!(args.resolve_config().unwrap(), ClientConfig::default());
    }

    #[test]
    fn test_resolve_config_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint = \"ws://file/ws\"\nmax_retries = 2").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let args = Args::parse_from([
            "gtalk-sync",
            "--token",
            "t",
            "--channel",
            "c",
            "--config",
            &path,
            "--http-base",
            "",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.endpoint, "ws://file/ws");
        assert_eq!(config.max_retries, 2);
        assert!(!config.http_fallback_enabled());

        let args = Args::parse_from([
            "gtalk-sync", "--token", "t", "--channel", "c", "--config", &path, "--endpoint",
            "ws://flag/ws",
        ]);
        assert_eq!(args.resolve_config().unwrap().endpoint, "ws://flag/ws");
    }
}
