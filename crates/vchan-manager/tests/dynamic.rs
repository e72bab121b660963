#![expect(clippy::unwrap_used, reason = "test code can panic on errors")]

mod common;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use common::*;
use vchan_manager::*;
use vchan_proto::{CreateRequest, ServerPdu};

const DRDYNVC_ID: RemoteChannelId = RemoteChannelId::new(1005);

const CAPS_REQUEST: [u8; 12] = [0x58, 0x00, 0x02, 0x00, 0x33, 0x33, 0x11, 0x11, 0x3d, 0x0a, 0xa7, 0x04];
const CAPS_RESPONSE: [u8; 4] = [0x50, 0x00, 0x02, 0x00];
const CREATE_REQUEST: [u8; 11] = [0x10, 0x03, 0x74, 0x65, 0x73, 0x74, 0x64, 0x76, 0x63, 0x31, 0x00];
const CREATE_RESPONSE: [u8; 6] = [0x10, 0x03, 0x00, 0x00, 0x00, 0x00];
const CLOSE: [u8; 2] = [0x40, 0x03];

fn data_first_packet() -> Vec<u8> {
    let mut packet = vec![0x20, 0x03, 0x5C];
    packet.extend_from_slice(&[0x71; 46]);
    packet
}

fn data_packet() -> Vec<u8> {
    let mut packet = vec![0x34, 0x03];
    packet.extend_from_slice(&[0x71; 46]);
    packet
}

struct Session {
    manager: ChannelManager,
    transport: Arc<RecordingTransport>,
    collector: Arc<Collector>,
}

impl Session {
    fn connect(config: ManagerConfig) -> Self {
        let (manager, transport) = manager_with(config);
        let collector = Arc::new(Collector::default());

        let (init, _) = register(&manager, TestPlugin::new("echo"));
        manager.pre_connect().unwrap();
        manager
            .register_listener(init, "testdvc1", collector.delivery())
            .unwrap();

        assert!(manager
            .declared_channels()
            .iter()
            .any(|def| def.name == vchan_proto::DRDYNVC_CHANNEL_NAME));

        manager
            .post_connect(&[JoinedChannel::new("drdynvc", DRDYNVC_ID)])
            .unwrap();

        Self {
            manager,
            transport,
            collector,
        }
    }

    /// Feeds a server PDU on the drdynvc channel and delivers everything it causes.
    fn server(&self, packet: &[u8]) {
        let total_length = u32::try_from(packet.len()).unwrap();
        self.manager
            .on_data_received(DRDYNVC_ID, Bytes::copy_from_slice(packet), total_length, ChunkFlags::ONLY)
            .unwrap();
        self.pump();
    }

    fn pump(&self) {
        while self.manager.dispatch_pending().unwrap() > 0 {}
    }

    /// Payloads the client sent on the drdynvc channel.
    fn sent(&self) -> Vec<Vec<u8>> {
        self.transport
            .take()
            .into_iter()
            .inspect(|request| assert_eq!(DRDYNVC_ID, request.channel_id))
            .map(|request| request.data.to_vec())
            .collect()
    }

    fn create_testdvc1(&self) -> OpenHandle {
        self.server(&CAPS_REQUEST);
        self.server(&CREATE_REQUEST);
        assert_eq!(vec![CAPS_RESPONSE.to_vec(), CREATE_RESPONSE.to_vec()], self.sent());

        self.manager.find("testdvc1").unwrap().handle
    }
}

#[test]
fn capabilities_are_answered() {
    let session = Session::connect(ManagerConfig::new());

    session.server(&CAPS_REQUEST);

    assert_eq!(vec![CAPS_RESPONSE.to_vec()], session.sent());
}

#[test]
fn remote_create_then_data() {
    let session = Session::connect(ManagerConfig::new());
    let handle = session.create_testdvc1();

    let info = session.manager.find(handle).unwrap();
    assert_eq!(Some(DynamicChannelId::from(3)), info.dynamic_id);
    assert_eq!(None, info.remote_id);
    assert!(info.options.contains(ChannelOptions::DYNAMIC));

    session.server(&data_first_packet());
    session.server(&data_packet());

    assert_eq!(
        vec![
            (
                handle,
                ChannelEvent::Created {
                    name: "testdvc1".into()
                }
            ),
            (
                handle,
                ChannelEvent::DataReceived {
                    data: Bytes::from_static(&[0x71; 92]),
                    total_length: 92,
                    flags: ChunkFlags::ONLY,
                }
            ),
        ],
        session.collector.take()
    );
}

#[test]
fn dynamic_channel_is_writable_and_closable() {
    let session = Session::connect(ManagerConfig::new());
    let handle = session.create_testdvc1();
    session.collector.take();

    session
        .manager
        .write(handle, Bytes::from_static(b"hi"), UserTag::new(7))
        .unwrap();

    let requests = session.transport.take();
    assert_eq!(1, requests.len());
    assert_eq!(DRDYNVC_ID, requests[0].channel_id);
    assert_eq!(ChunkFlags::ONLY, requests[0].flags);
    assert_eq!(&[0x30, 0x03, b'h', b'i'][..], &requests[0].data[..]);

    session
        .manager
        .on_write_complete(requests[0].completion.unwrap())
        .unwrap();
    session.pump();

    assert_eq!(
        vec![(handle, ChannelEvent::WriteComplete { tag: UserTag::new(7) })],
        session.collector.take()
    );

    session.manager.close_channel(handle).unwrap();

    assert_eq!(vec![CLOSE.to_vec()], session.sent());
    assert!(session.manager.find("testdvc1").is_err());
    assert!(session.collector.take().is_empty());
}

#[test]
fn large_dynamic_write_is_fragmented() {
    let config = ManagerConfig {
        dynamic_chunk_size: 10,
        ..ManagerConfig::new()
    };
    let session = Session::connect(config);
    let handle = session.create_testdvc1();

    session
        .manager
        .write(handle, Bytes::from(vec![0x42; 25]), UserTag::new(1))
        .unwrap();

    let requests = session.transport.take();
    assert_eq!(
        vec![0x2, 0x3, 0x3],
        requests.iter().map(|request| request.data[0] >> 4).collect::<Vec<_>>()
    );
    assert_eq!(
        vec![false, false, true],
        requests
            .iter()
            .map(|request| request.completion.is_some())
            .collect::<Vec<_>>()
    );
}

#[test]
fn remote_close_delivers_closed() {
    let session = Session::connect(ManagerConfig::new());
    let handle = session.create_testdvc1();
    session.collector.take();

    session.server(&CLOSE);

    assert_eq!(vec![CLOSE.to_vec()], session.sent());
    assert_eq!(vec![(handle, ChannelEvent::Closed)], session.collector.take());
    assert!(matches!(
        session.manager.write(handle, Bytes::from_static(b"x"), UserTag::new(1)),
        Err(ChannelError::NotOpen(_))
    ));
}

#[test]
fn create_without_listener_is_refused() {
    let session = Session::connect(ManagerConfig::new());
    session.server(&CAPS_REQUEST);
    session.sent();

    let mut request = BytesMut::new();
    ServerPdu::CreateRequest(CreateRequest::new(DynamicChannelId::from(5), "unknown"))
        .encode(&mut request)
        .unwrap();
    session.server(&request);

    assert_eq!(vec![vec![0x10, 0x05, 0x01, 0x00, 0x00, 0xC0]], session.sent());
    assert!(session.manager.find("unknown").is_err());
    assert!(session.collector.take().is_empty());
}

#[test]
fn disconnect_closes_dynamic_channels() {
    let session = Session::connect(ManagerConfig::new());
    let handle = session.create_testdvc1();
    session.collector.take();

    session.manager.disconnect();
    session.pump();

    assert_eq!(vec![(handle, ChannelEvent::Closed)], session.collector.take());
}

#[test]
fn bridge_is_not_registered_when_disabled() {
    let (manager, _) = manager_with(static_config());
    manager.pre_connect().unwrap();

    assert!(manager.declared_channels().is_empty());
}
