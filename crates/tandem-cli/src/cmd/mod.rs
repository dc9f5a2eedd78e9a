pub mod audit;
pub mod commit;
pub mod config;
pub mod init;
pub mod lock;
pub mod queue;
pub mod watch;

use anyhow::Context;
use std::sync::Arc;
use tandem_core::config::Config;
use tandem_core::engine::{CliEngine, VcsEngine};

/// The configured VCS program, resolved on `PATH`.
pub fn engine(config: &Config) -> anyhow::Result<Arc<dyn VcsEngine>> {
    let engine = CliEngine::locate(&config.engine.program, &config.engine.remote)
        .with_context(|| format!("cannot use VCS program '{}'", config.engine.program))?;
    Ok(Arc::new(engine))
}

/// Current-thread runtime for one-shot commands.
pub fn block_on<F: std::future::Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(rt.block_on(fut))
}
