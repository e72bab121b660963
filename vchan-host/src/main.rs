#[macro_use]
extern crate tracing;

use anyhow::Context;
use tokio::sync::mpsc;
use vchan_host::{get_data_dir, init_log, ConfHandle, Host};

fn main() -> anyhow::Result<()> {
    std::fs::create_dir_all(get_data_dir()).context("failed to create data directory")?;

    let conf = ConfHandle::init()
        .context("failed to initialize configuration")?
        .get_conf();

    let _logger_guard = init_log(&conf).context("failed to initialize log")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting vchan host");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

    ctrlc::set_handler(move || {
        info!("Ctrl-C received, exiting");
        let _ = shutdown_tx.send(());
    })
    .context("failed to set Ctrl-C handler")?;

    rt.block_on(async move {
        let mut host = Host::new(&conf)?;

        if let Err(error) = host.connect(&conf.static_channels) {
            error!(error = format!("{error:#}"), "Connection sequence failed");
            host.shutdown().await;
            return Err(error);
        }

        info!("Waiting for shutdown signal");
        shutdown_rx.recv().await;

        host.shutdown().await;

        anyhow::Ok(())
    })?;

    info!("Exiting vchan host");

    Ok(())
}
