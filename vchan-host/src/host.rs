use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vchan_manager::{ChannelManager, DispatchTask, JoinedChannel, QueuedTransport, SendRequest};

use crate::config::Conf;
use crate::loader::{self, PluginLibrary};
use crate::loopback::Loopback;

/// Channel manager wired to a loopback peer, with its plugin libraries
pub struct Host {
    manager: ChannelManager,
    request_rx: Option<mpsc::UnboundedReceiver<SendRequest>>,
    dispatch: Option<DispatchTask>,
    loopback: Option<JoinHandle<()>>,
    // Dropped last: registered entry points point into these libraries.
    libraries: Vec<PluginLibrary>,
}

impl Host {
    /// Creates the manager and registers every configured plugin library.
    pub fn new(conf: &Conf) -> anyhow::Result<Self> {
        let libraries = loader::load_all(&conf.plugins)?;

        let (transport, request_rx) = QueuedTransport::new();
        let manager =
            ChannelManager::new(conf.manager.clone(), Arc::new(transport)).context("failed to create channel manager")?;

        for library in &libraries {
            library.register(&manager)?;
        }

        Ok(Self {
            manager,
            request_rx: Some(request_rx),
            dispatch: None,
            loopback: None,
            libraries,
        })
    }

    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    /// Runs the connection sequence against the loopback peer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self, joined: &[JoinedChannel]) -> anyhow::Result<()> {
        let request_rx = self.request_rx.take().context("already connected")?;

        self.manager.pre_connect().context("pre-connect failed")?;

        for def in self.manager.declared_channels() {
            debug!(name = %def.name, options = %def.options, "Static channel declared");
        }

        self.dispatch = Some(self.manager.spawn_dispatch_loop().context("failed to start dispatch loop")?);

        let loopback = Loopback::new(self.manager.clone(), joined);
        self.loopback = Some(tokio::spawn(loopback.run(request_rx)));

        self.manager.post_connect(joined).context("post-connect failed")?;

        info!(
            plugins = self.libraries.len(),
            channels = joined.len(),
            "Connected to loopback peer"
        );

        Ok(())
    }

    /// Disconnects, waits for the dispatch loop to drain, then tears the manager down.
    pub async fn shutdown(mut self) {
        self.manager.disconnect();
        self.manager.close();

        if let Some(dispatch) = self.dispatch.take() {
            if let Err(error) = dispatch.join().await {
                error!(%error, "Dispatch loop failed");
            }
        }

        if let Some(loopback) = self.loopback.take() {
            loopback.abort();
            let _ = loopback.await;
        }

        self.manager.destroy();

        for library in &self.libraries {
            debug!(path = %library.path(), "Unloading plugin library");
        }

        info!("Host terminated");
    }
}
