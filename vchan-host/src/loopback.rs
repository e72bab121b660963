//! In-process stand-in for the remote peer.
//!
//! Every write is acknowledged. Writes on echoed channels are reassembled and sent back
//! to the manager as received data, so a plugin talks to itself.

use std::collections::{HashMap, HashSet};

use bytes::BytesMut;
use tokio::sync::mpsc;
use vchan_manager::{ChannelManager, ChunkFlags, JoinedChannel, RemoteChannelId, SendRequest};

pub struct Loopback {
    manager: ChannelManager,
    echoed: HashSet<RemoteChannelId>,
    partial: HashMap<RemoteChannelId, BytesMut>,
}

impl Loopback {
    /// Echoes every joined channel except the dynamic channel carrier.
    ///
    /// The dynamic channel bridge would otherwise read its own responses as server requests.
    pub fn new(manager: ChannelManager, joined: &[JoinedChannel]) -> Self {
        let echoed = joined
            .iter()
            .filter(|channel| {
                let carrier = channel.name.eq_ignore_ascii_case(vchan_proto::DRDYNVC_CHANNEL_NAME);
                if carrier {
                    warn!(id = %channel.id, "Writes on the dynamic channel carrier are not echoed");
                }
                !carrier
            })
            .map(|channel| channel.id)
            .collect();

        Self {
            manager,
            echoed,
            partial: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut request_rx: mpsc::UnboundedReceiver<SendRequest>) {
        debug!("Task started");

        while let Some(request) = request_rx.recv().await {
            self.handle(request);
        }

        debug!("Task terminated");
    }

    fn handle(&mut self, request: SendRequest) {
        trace!(channel_id = %request.channel_id, len = request.data.len(), flags = %request.flags, "Chunk sent");

        if self.echoed.contains(&request.channel_id) {
            self.echo(request.channel_id, &request.data, request.flags);
        }

        if let Some(token) = request.completion {
            if let Err(error) = self.manager.on_write_complete(token) {
                debug!(%error, "Write completion not reported");
            }
        }
    }

    fn echo(&mut self, channel_id: RemoteChannelId, chunk: &[u8], flags: ChunkFlags) {
        let buffer = self.partial.entry(channel_id).or_default();

        if flags.is_first() {
            buffer.clear();
        }

        buffer.extend_from_slice(chunk);

        if !flags.is_last() {
            return;
        }

        let message = buffer.split().freeze();

        let Ok(total_length) = u32::try_from(message.len()) else {
            warn!(%channel_id, len = message.len(), "Message too large to echo");
            return;
        };

        if let Err(error) = self
            .manager
            .on_data_received(channel_id, message, total_length, ChunkFlags::ONLY)
        {
            debug!(%error, %channel_id, "Echo dropped");
        }
    }
}
