//! Env-based secret/endpoint resolution.
//!
//! Config YAML carries tuning knobs; connection strings and credentials are
//! resolved once at startup from the environment, never scattered as
//! `std::env::var` calls across the codebase. `Debug` redacts the DB URL's
//! userinfo so credentials never leak into a stray log line.

use anyhow::{Context, Result};

pub const ENV_DB_URL: &str = "TCI_DATABASE_URL";
pub const ENV_KAFKA_BOOTSTRAP: &str = "TCI_KAFKA_BOOTSTRAP_SERVERS";
pub const ENV_ADMIN_BIND_ADDR: &str = "TCI_ADMIN_BIND_ADDR";

/// All runtime-resolved environment values for one daemon instantiation.
/// Built once at startup via [`ResolvedEnv::from_env`].
#[derive(Clone)]
pub struct ResolvedEnv {
    pub database_url: String,
    pub kafka_bootstrap_servers: String,
    /// `None` uses the daemon's built-in default bind address.
    pub admin_bind_addr: Option<String>,
}

impl std::fmt::Debug for ResolvedEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEnv")
            .field("database_url", &"<REDACTED>")
            .field("kafka_bootstrap_servers", &self.kafka_bootstrap_servers)
            .field("admin_bind_addr", &self.admin_bind_addr)
            .finish()
    }
}

impl ResolvedEnv {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var(ENV_DB_URL)
            .with_context(|| format!("missing env var {ENV_DB_URL}"))?;
        let kafka_bootstrap_servers = std::env::var(ENV_KAFKA_BOOTSTRAP)
            .with_context(|| format!("missing env var {ENV_KAFKA_BOOTSTRAP}"))?;
        let admin_bind_addr = std::env::var(ENV_ADMIN_BIND_ADDR).ok();

        Ok(Self {
            database_url,
            kafka_bootstrap_servers,
            admin_bind_addr,
        })
    }
}
