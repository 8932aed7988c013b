use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// etcd v3 cluster (requires the `etcd` feature)
    Etcd,
    /// In-process service, useful for trying the election locally
    Memory,
}

#[derive(Debug, Parser)]
#[command(name = "leaderd", version, about, long_about = None)]
pub struct Cli {
    /// Identity of this participant; must be unique within the group
    #[arg(required = true)]
    pub id: String,

    /// JSON settings file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub backend: Option<Backend>,

    /// Comma separated coordination service endpoints
    #[arg(long, value_delimiter = ',')]
    pub endpoints: Option<Vec<String>>,

    /// Election key shared by the group
    #[arg(long)]
    pub key: Option<String>,

    #[arg(long)]
    pub lease_ttl_ms: Option<u64>,

    /// Seconds to stay in the election before leaving
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "election=debug,leaderd=debug,info",
            2 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_command_line() {
        let cli = Cli::try_parse_from([
            "leaderd",
            "node-a",
            "--backend",
            "memory",
            "--endpoints",
            "10.0.0.1:2379,10.0.0.2:2379",
            "--key",
            "jobs/leader",
            "-vv",
        ])
        .unwrap();

        assert_eq!(cli.id, "node-a");
        assert_eq!(cli.backend, Some(Backend::Memory));
        assert_eq!(
            cli.endpoints,
            Some(vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()])
        );
        assert_eq!(cli.key.as_deref(), Some("jobs/leader"));
        assert_eq!(cli.log_filter(), "debug");
    }

    #[test]
    fn test_identity_is_required() {
        assert!(Cli::try_parse_from(["leaderd"]).is_err());
    }
}
