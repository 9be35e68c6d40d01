//! Process configuration, from flags or environment.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "eventodb", about = "Multi-tenant append-only message store")]
pub struct Config {
    /// Port for the HTTP listener.
    #[arg(long, env = "EVENTODB_PORT", default_value_t = 7717)]
    pub port: u16,

    /// Directory holding per-namespace database files and the registry.
    #[arg(long, env = "EVENTODB_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Postgres URL. When set, namespaces live in schemas of this database
    /// instead of files under the data directory.
    #[arg(long, env = "EVENTODB_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Accept any or missing credentials and map them to the `default`
    /// namespace, auto-creating it on first use.
    #[arg(long, env = "EVENTODB_TEST_MODE")]
    pub test_mode: bool,

    /// Pre-seeded token for the auto-created `default` namespace.
    #[arg(long, env = "EVENTODB_DEFAULT_TOKEN")]
    pub default_token: Option<String>,

    /// Log filter, e.g. `info` or `eventodb=debug`.
    #[arg(long, env = "EVENTODB_LOG", default_value = "info")]
    pub log: String,
}
