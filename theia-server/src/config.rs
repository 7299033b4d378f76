use std::net::{IpAddr, SocketAddr};

use clap::{Parser, ValueEnum};

/// Relational vs. file-backed event storage (spec §4.3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum StoreKind {
    File,
    Rdbs,
}

/// Collector CLI surface. Every flag falls back to an environment variable,
/// then to a default, matching `oxidb-cli`'s `Cli` struct.
#[derive(Debug, Parser)]
#[command(name = "theia-collector", about = "Theia log-event collector server")]
pub struct Cli {
    #[arg(long, env = "THEIA_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "THEIA_PORT", default_value_t = 6433)]
    pub port: u16,

    #[arg(long, env = "THEIA_DATA", default_value = "./theia_data")]
    pub data_dir: String,

    #[arg(long, env = "THEIA_STORE", value_enum, default_value_t = StoreKind::File)]
    pub store: StoreKind,

    #[arg(long, env = "THEIA_DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "THEIA_BUCKET_WIDTH", default_value_t = 60)]
    pub bucket_width: i64,

    #[arg(long, env = "THEIA_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    #[arg(long, env = "THEIA_VERBOSE", default_value_t = false)]
    pub verbose: bool,

    #[arg(long, env = "THEIA_GELF_ADDR")]
    pub gelf_addr: Option<String>,
}

impl Cli {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cli = Cli::parse_from(["theia-collector"]);
        assert_eq!(cli.host, IpAddr::from([127, 0, 0, 1]));
        assert_eq!(cli.port, 6433);
        assert_eq!(cli.data_dir, "./theia_data");
        assert_eq!(cli.store, StoreKind::File);
        assert_eq!(cli.bucket_width, 60);
        assert_eq!(cli.write_timeout_ms, 5000);
        assert!(!cli.verbose);
        assert!(cli.gelf_addr.is_none());
    }

    #[test]
    fn store_flag_parses_rdbs() {
        let cli = Cli::parse_from(["theia-collector", "--store", "rdbs", "--database-url", "db.sqlite"]);
        assert_eq!(cli.store, StoreKind::Rdbs);
        assert_eq!(cli.database_url.as_deref(), Some("db.sqlite"));
    }
}
