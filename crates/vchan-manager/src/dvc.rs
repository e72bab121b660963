//! Dynamic channel bridge.
//!
//! Built-in plugin owning the `drdynvc` static channel. It speaks the dynamic channel
//! sub-protocol with the peer and surfaces every dynamic channel as a regular record of
//! the open channel table, so plugins see no difference with static channels.

use core::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use vchan_proto::svc::ChunkFlags;
use vchan_proto::{
    CapabilitiesRequest, CapabilitiesResponse, ClientPdu, Close, CreateRequest, CreateResponse, CreationStatus,
    DynamicChannelId, ServerPdu, DRDYNVC_CHANNEL_NAME,
};

use crate::error::{ChannelError, Lookup};
use crate::event::ChannelEvent;
use crate::handle::{ChannelOptions, OpenHandle, UserTag};
use crate::plugin::{ChannelEventHandler, Delivery, InitContext, VirtualChannelEntry};
use crate::ChannelManager;

/// Highest protocol version answered to the peer. Version 3 requires compression.
const MAX_VERSION: u16 = 2;

pub(crate) struct DynamicChannelBridge {
    handler: Arc<BridgeHandler>,
}

impl DynamicChannelBridge {
    pub(crate) fn new() -> Self {
        Self {
            handler: Arc::new(BridgeHandler::default()),
        }
    }
}

impl VirtualChannelEntry for DynamicChannelBridge {
    fn name(&self) -> &str {
        DRDYNVC_CHANNEL_NAME
    }

    fn entry(&self, ctx: &mut InitContext<'_>) -> Result<(), ChannelError> {
        let options = ChannelOptions::INITIALIZED | ChannelOptions::ENCRYPT_RDP;

        ctx.declare_channel(DRDYNVC_CHANNEL_NAME, options)?;
        let handler: Arc<dyn ChannelEventHandler> = Arc::clone(&self.handler) as _;
        let handle = ctx.open(DRDYNVC_CHANNEL_NAME, options, Delivery::Callback(handler))?;
        ctx.manager().set_bridge_channel(handle);

        Ok(())
    }
}

#[derive(Default)]
struct BridgeHandler {
    state: Mutex<BridgeState>,
}

#[derive(Default)]
struct BridgeState {
    svc: SvcReassembly,
    version: Option<u16>,
    channels: HashMap<DynamicChannelId, CompleteData>,
}

impl ChannelEventHandler for BridgeHandler {
    fn on_event(&self, manager: &ChannelManager, handle: OpenHandle, event: ChannelEvent) {
        match event {
            ChannelEvent::DataReceived {
                data,
                total_length,
                flags,
            } => {
                let Some(message) = self.state.lock().svc.push(data, total_length, flags) else {
                    return;
                };

                match ServerPdu::decode(message) {
                    Ok(pdu) => self.process(manager, handle, pdu),
                    Err(error) => warn!(%error, "Malformed dynamic channel PDU"),
                }
            }
            ChannelEvent::Closed => {
                debug!("Dynamic channel bridge closed");
                *self.state.lock() = BridgeState::default();
            }
            ChannelEvent::Created { .. } | ChannelEvent::WriteComplete { .. } => {}
        }
    }
}

impl BridgeHandler {
    fn process(&self, manager: &ChannelManager, handle: OpenHandle, pdu: ServerPdu) {
        match pdu {
            ServerPdu::CapabilitiesRequest(request) => self.handle_capabilities(manager, handle, &request),
            ServerPdu::CreateRequest(request) => self.handle_create_request(manager, handle, &request),
            ServerPdu::DataFirst(pdu) => {
                let total_length = pdu.total_length as usize;
                let complete = self
                    .state
                    .lock()
                    .channels
                    .get_mut(&pdu.channel_id)
                    .and_then(|channel| channel.process_data_first(total_length, pdu.data));

                if let Some(data) = complete {
                    deliver(manager, pdu.channel_id, data);
                }
            }
            ServerPdu::Data(pdu) => {
                let complete = self
                    .state
                    .lock()
                    .channels
                    .get_mut(&pdu.channel_id)
                    .and_then(|channel| channel.process_data(pdu.data));

                if let Some(data) = complete {
                    deliver(manager, pdu.channel_id, data);
                }
            }
            ServerPdu::CloseRequest(pdu) => {
                self.state.lock().channels.remove(&pdu.channel_id);

                send(manager, handle, &ClientPdu::Close(Close {
                    channel_id: pdu.channel_id,
                }));

                if let Err(error) = manager.close_dynamic_channel(pdu.channel_id) {
                    debug!(dynamic_id = %pdu.channel_id, %error, "Close request for an unknown channel");
                }
            }
        }
    }

    fn handle_capabilities(&self, manager: &ChannelManager, handle: OpenHandle, request: &CapabilitiesRequest) {
        let version = request.version.min(MAX_VERSION);
        self.state.lock().version = Some(version);

        info!(requested = request.version, version, "Dynamic channel capabilities negotiated");

        send(
            manager,
            handle,
            &ClientPdu::CapabilitiesResponse(CapabilitiesResponse { version }),
        );
    }

    fn handle_create_request(&self, manager: &ChannelManager, handle: OpenHandle, request: &CreateRequest) {
        let channel_id = request.channel_id;

        if self.state.lock().version.is_none() {
            warn!(dynamic_id = %channel_id, "Create request received before capabilities");
        }

        let creation_status = match manager.create_dynamic_channel(channel_id, &request.channel_name) {
            Ok(_) => {
                self.state.lock().channels.insert(channel_id, CompleteData::default());
                CreationStatus::OK
            }
            Err(ChannelError::NotFound(Lookup::Listener(name))) => {
                info!(dynamic_id = %channel_id, %name, "No listener for dynamic channel");
                CreationStatus::NO_LISTENER
            }
            Err(error) => {
                warn!(
                    dynamic_id = %channel_id,
                    name = %request.channel_name,
                    %error,
                    "Failed to create dynamic channel"
                );
                CreationStatus::NO_LISTENER
            }
        };

        send(
            manager,
            handle,
            &ClientPdu::CreateResponse(CreateResponse {
                channel_id,
                creation_status,
            }),
        );
    }
}

fn deliver(manager: &ChannelManager, channel_id: DynamicChannelId, data: Bytes) {
    if let Err(error) = manager.deliver_dynamic_data(channel_id, data) {
        warn!(dynamic_id = %channel_id, %error, "Failed to deliver dynamic channel data");
    }
}

fn send(manager: &ChannelManager, handle: OpenHandle, pdu: &ClientPdu) {
    let result = pdu
        .to_bytes()
        .map_err(ChannelError::from)
        .and_then(|bytes| manager.write(handle, bytes, UserTag::new(0)));

    if let Err(error) = result {
        warn!(%error, ?pdu, "Failed to send dynamic channel PDU");
    }
}

/// Joins the static channel chunks of one message.
#[derive(Debug, Default)]
struct SvcReassembly {
    buf: BytesMut,
}

impl SvcReassembly {
    fn push(&mut self, data: Bytes, total_length: u32, flags: ChunkFlags) -> Option<Bytes> {
        if flags.is_first() {
            if !self.buf.is_empty() {
                warn!(dropped = self.buf.len(), "Incomplete static channel message, it will be skipped");
                self.buf.clear();
            }

            if flags.is_last() {
                return Some(data);
            }
        } else if self.buf.is_empty() {
            warn!("Static channel chunk without a first chunk, it will be skipped");
            return None;
        }

        self.buf.extend_from_slice(&data);

        if !flags.is_last() {
            return None;
        }

        if self.buf.len() != total_length as usize {
            warn!(
                expected = total_length,
                actual = self.buf.len(),
                "Static channel message length mismatch"
            );
        }

        Some(self.buf.split().freeze())
    }
}

/// Reassembles fragmented dynamic channel messages.
#[derive(Debug, Default, PartialEq)]
struct CompleteData {
    total_length: usize,
    data: Option<BytesMut>,
}

impl CompleteData {
    fn process_data_first(&mut self, total_length: usize, data_first: Bytes) -> Option<Bytes> {
        if self.total_length != 0 || self.data.is_some() {
            error!("Incomplete DVC message, it will be skipped");

            self.data = None;
        }

        if total_length == data_first.len() {
            self.total_length = 0;
            Some(data_first)
        } else {
            self.total_length = total_length;
            self.data = Some(BytesMut::from(data_first.as_ref()));

            None
        }
    }

    fn process_data(&mut self, data: Bytes) -> Option<Bytes> {
        let Some(buf) = self.data.as_mut() else {
            // not fragmented
            return Some(data);
        };

        match (buf.len() + data.len()).cmp(&self.total_length) {
            Ordering::Less => {
                buf.extend_from_slice(&data);

                None
            }
            Ordering::Equal => {
                buf.extend_from_slice(&data);
                self.total_length = 0;

                self.data.take().map(BytesMut::freeze)
            }
            Ordering::Greater => {
                error!("Actual DVC message size is greater than expected total DVC message size");
                self.total_length = 0;
                self.data = None;

                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfragmented_data_is_returned_as_is() {
        let mut complete = CompleteData::default();
        let data = Bytes::from_static(&[0x71; 46]);

        assert_eq!(Some(data.clone()), complete.process_data(data));
        assert_eq!(CompleteData::default(), complete);
    }

    #[test]
    fn fragmented_data_is_joined() {
        let mut complete = CompleteData::default();

        assert_eq!(None, complete.process_data_first(92, Bytes::from_static(&[0x71; 46])));
        let joined = complete.process_data(Bytes::from_static(&[0x71; 46])).unwrap();

        assert_eq!(&[0x71; 92][..], &joined[..]);
        assert_eq!(CompleteData::default(), complete);
    }

    #[test]
    fn overflowing_fragment_is_dropped() {
        let mut complete = CompleteData::default();

        assert_eq!(None, complete.process_data_first(50, Bytes::from_static(&[0x71; 46])));
        assert_eq!(None, complete.process_data(Bytes::from_static(&[0x71; 46])));
        assert_eq!(CompleteData::default(), complete);
    }

    #[test]
    fn new_data_first_discards_incomplete_message() {
        let mut complete = CompleteData::default();

        complete.process_data_first(92, Bytes::from_static(&[0x71; 46]));
        assert_eq!(None, complete.process_data_first(60, Bytes::from_static(&[0x42; 30])));

        let joined = complete.process_data(Bytes::from_static(&[0x42; 30])).unwrap();
        assert_eq!(&[0x42; 60][..], &joined[..]);
    }

    #[test]
    fn svc_chunks_are_joined() {
        let mut svc = SvcReassembly::default();

        assert_eq!(None, svc.push(Bytes::from_static(b"hel"), 5, ChunkFlags::FIRST));
        assert_eq!(
            Some(Bytes::from_static(b"hello")),
            svc.push(Bytes::from_static(b"lo"), 5, ChunkFlags::LAST)
        );
        assert_eq!(
            Some(Bytes::from_static(b"bye")),
            svc.push(Bytes::from_static(b"bye"), 3, ChunkFlags::ONLY)
        );
    }

    #[test]
    fn svc_chunk_without_first_is_skipped() {
        let mut svc = SvcReassembly::default();
        assert_eq!(None, svc.push(Bytes::from_static(b"lo"), 5, ChunkFlags::LAST));
    }
}
