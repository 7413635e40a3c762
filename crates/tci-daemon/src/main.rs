//! tci-daemon entry point.
//!
//! Intentionally thin: all construction lives in `wiring::run`, in
//! dependency order. Startup is fatal on any wiring error.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tci_daemon::wiring::run().await
}
