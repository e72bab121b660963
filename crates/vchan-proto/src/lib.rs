//! Dynamic virtual channel (DRDYNVC) PDUs and static virtual channel constants.
//!
//! [Specification document][source]
//!
//! [source]: https://learn.microsoft.com/en-us/openspecs/windows_protocols/ms-rdpedyc

use core::fmt;

use bytes::{Buf as _, BufMut as _};
use smol_str::SmolStr;

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

pub mod svc;

/// Name of the static channel carrying the dynamic channel sub-protocol.
pub const DRDYNVC_CHANNEL_NAME: &str = "drdynvc";

/// Identifier of a dynamic channel, assigned by the server in a create request
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct DynamicChannelId(u32);

impl From<u32> for DynamicChannelId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<DynamicChannelId> for u32 {
    fn from(id: DynamicChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for DynamicChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dvc#{}", self.0)
    }
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    PacketOversized {
        packet_size: usize,
        max: usize,
    },
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PacketOversized { packet_size, max } => {
                write!(f, "packet oversized: max is {max}, got {packet_size}")
            }
            Error::NotEnoughBytes {
                name,
                received,
                expected,
            } => write!(
                f,
                "not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes"
            ),
            Error::InvalidPacket { name, field, reason } => {
                write!(f, "invalid `{field}` in {name}: {reason}")
            }
        }
    }
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
    (plain $packet_struct:ident in $buf:ident) => {{
        ensure_size!($buf[$packet_struct::SIZE] for $packet_struct::NAME)
    }};
}

/// Encoded width of a variable-length integer field (`cbId` and `Sp`/`Len` fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSize {
    U8 = 0,
    U16 = 1,
    U32 = 2,
}

impl FieldSize {
    pub fn for_value(value: u32) -> Self {
        if value <= u32::from(u8::MAX) {
            FieldSize::U8
        } else if value <= u32::from(u16::MAX) {
            FieldSize::U16
        } else {
            FieldSize::U32
        }
    }

    pub fn width(self) -> usize {
        match self {
            FieldSize::U8 => 1,
            FieldSize::U16 => 2,
            FieldSize::U32 => 4,
        }
    }

    fn from_bits(bits: u8, name: &'static str, field: &'static str) -> Result<Self, Error> {
        match bits {
            0 => Ok(FieldSize::U8),
            1 => Ok(FieldSize::U16),
            2 => Ok(FieldSize::U32),
            _ => Err(Error::InvalidPacket {
                name,
                field,
                reason: "reserved field size",
            }),
        }
    }

    fn read(self, buf: &mut Bytes, name: &'static str) -> Result<u32, Error> {
        ensure_size!(buf[self.width()] for name);
        let value = match self {
            FieldSize::U8 => u32::from(buf.get_u8()),
            FieldSize::U16 => u32::from(buf.get_u16_le()),
            FieldSize::U32 => buf.get_u32_le(),
        };
        Ok(value)
    }

    #[expect(clippy::cast_possible_truncation, reason = "the size was selected from the value")]
    fn write(self, buf: &mut BytesMut, value: u32) {
        match self {
            FieldSize::U8 => buf.put_u8(value as u8),
            FieldSize::U16 => buf.put_u16_le(value as u16),
            FieldSize::U32 => buf.put_u32_le(value),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    Create = 0x01,
    DataFirst = 0x02,
    Data = 0x03,
    Close = 0x04,
    Capability = 0x05,
    DataFirstCompressed = 0x06,
    DataCompressed = 0x07,
    SoftSyncRequest = 0x08,
    SoftSyncResponse = 0x09,
}

impl TryFrom<u8> for Cmd {
    type Error = Error;

    fn try_from(v: u8) -> Result<Cmd, Error> {
        match v {
            0x01 => Ok(Cmd::Create),
            0x02 => Ok(Cmd::DataFirst),
            0x03 => Ok(Cmd::Data),
            0x04 => Ok(Cmd::Close),
            0x05 => Ok(Cmd::Capability),
            0x06 => Ok(Cmd::DataFirstCompressed),
            0x07 => Ok(Cmd::DataCompressed),
            0x08 => Ok(Cmd::SoftSyncRequest),
            0x09 => Ok(Cmd::SoftSyncResponse),
            _ => Err(Error::InvalidPacket {
                name: Header::NAME,
                field: "Cmd",
                reason: "unknown value",
            }),
        }
    }
}

/// The one-byte header shared by every DRDYNVC PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub cmd: Cmd,
    /// Meaning depends on `cmd`: length field size, priority, or unused.
    pub sp: u8,
    pub cb_id: u8,
}

impl Header {
    pub const NAME: &'static str = "DYNVC HEADER";
    pub const SIZE: usize = 1;

    pub fn new(cmd: Cmd, sp: u8, cb_id: FieldSize) -> Self {
        Self {
            cmd,
            sp: sp & 0b11,
            cb_id: cb_id as u8,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(((self.cmd as u8) << 4) | ((self.sp & 0b11) << 2) | (self.cb_id & 0b11));
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        let byte = buf.get_u8();
        Ok(Self {
            cmd: Cmd::try_from(byte >> 4)?,
            sp: (byte >> 2) & 0b11,
            cb_id: byte & 0b11,
        })
    }

    fn channel_id_size(&self) -> Result<FieldSize, Error> {
        FieldSize::from_bits(self.cb_id, Self::NAME, "cbId")
    }
}

/// Status returned by the client in a create response
///
/// Negative values (as HRESULT) indicate failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreationStatus(pub u32);

impl CreationStatus {
    pub const OK: Self = CreationStatus(0);

    /// No listener is registered for the requested channel name
    pub const NO_LISTENER: Self = CreationStatus(0xC000_0001);

    pub fn is_success(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }
}

impl fmt::Display for CreationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitiesRequest {
    pub version: u16,
    /// Present for version 2 and above.
    pub priority_charges: Option<[u16; 4]>,
}

impl CapabilitiesRequest {
    pub const NAME: &'static str = "DYNVC_CAPS_REQ";
    pub const FIXED_PART_SIZE: usize = 1 /* Pad */ + 2 /* Version */;

    pub fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + if self.priority_charges.is_some() { 8 } else { 0 }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u16_le(self.version);
        if let Some(charges) = self.priority_charges {
            for charge in charges {
                buf.put_u16_le(charge);
            }
        }
    }

    fn decode_body(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::FIXED_PART_SIZE] for Self::NAME);
        buf.advance(1);
        let version = buf.get_u16_le();

        let priority_charges = if version >= 2 {
            ensure_size!(buf[8] for Self::NAME);
            Some([buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le(), buf.get_u16_le()])
        } else {
            None
        };

        Ok(Self {
            version,
            priority_charges,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    pub version: u16,
}

impl CapabilitiesResponse {
    pub const NAME: &'static str = "DYNVC_CAPS_RSP";
    pub const SIZE: usize = 1 /* Pad */ + 2 /* Version */;

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_u8(0);
        buf.put_u16_le(self.version);
    }

    fn decode_body(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(plain Self in buf);
        buf.advance(1);
        Ok(Self {
            version: buf.get_u16_le(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub channel_id: DynamicChannelId,
    pub priority: u8,
    pub channel_name: SmolStr,
}

impl CreateRequest {
    pub const NAME: &'static str = "DYNVC_CREATE_REQ";

    pub fn new(channel_id: DynamicChannelId, channel_name: impl Into<SmolStr>) -> Self {
        Self {
            channel_id,
            priority: 0,
            channel_name: channel_name.into(),
        }
    }

    fn decode_body(header: Header, mut buf: Bytes) -> Result<Self, Error> {
        let channel_id = header.channel_id_size()?.read(&mut buf, Self::NAME)?;

        let nul_idx = buf.iter().position(|b| *b == 0).ok_or(Error::InvalidPacket {
            name: Self::NAME,
            field: "ChannelName",
            reason: "missing null terminator",
        })?;

        let channel_name = std::str::from_utf8(&buf[..nul_idx]).map_err(|_| Error::InvalidPacket {
            name: Self::NAME,
            field: "ChannelName",
            reason: "not valid UTF-8",
        })?;

        Ok(Self {
            channel_id: DynamicChannelId::from(channel_id),
            priority: header.sp,
            channel_name: SmolStr::new(channel_name),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateResponse {
    pub channel_id: DynamicChannelId,
    pub creation_status: CreationStatus,
}

impl CreateResponse {
    pub const NAME: &'static str = "DYNVC_CREATE_RSP";

    fn decode_body(header: Header, mut buf: Bytes) -> Result<Self, Error> {
        let channel_id = header.channel_id_size()?.read(&mut buf, Self::NAME)?;
        ensure_size!(buf[4] for Self::NAME);
        Ok(Self {
            channel_id: DynamicChannelId::from(channel_id),
            creation_status: CreationStatus(buf.get_u32_le()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFirst {
    pub channel_id: DynamicChannelId,
    /// Total length of the message this fragment starts.
    pub total_length: u32,
    pub data: Bytes,
}

impl DataFirst {
    pub const NAME: &'static str = "DYNVC_DATA_FIRST";

    fn decode_body(header: Header, mut buf: Bytes) -> Result<Self, Error> {
        let channel_id = header.channel_id_size()?.read(&mut buf, Self::NAME)?;
        let total_length = FieldSize::from_bits(header.sp, Self::NAME, "Len")?.read(&mut buf, Self::NAME)?;

        if buf.len() > total_length as usize {
            return Err(Error::InvalidPacket {
                name: Self::NAME,
                field: "Length",
                reason: "first fragment is larger than the whole message",
            });
        }

        Ok(Self {
            channel_id: DynamicChannelId::from(channel_id),
            total_length,
            data: buf,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub channel_id: DynamicChannelId,
    pub data: Bytes,
}

impl Data {
    pub const NAME: &'static str = "DYNVC_DATA";

    fn decode_body(header: Header, mut buf: Bytes) -> Result<Self, Error> {
        let channel_id = header.channel_id_size()?.read(&mut buf, Self::NAME)?;
        Ok(Self {
            channel_id: DynamicChannelId::from(channel_id),
            data: buf,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Close {
    pub channel_id: DynamicChannelId,
}

impl Close {
    pub const NAME: &'static str = "DYNVC_CLOSE";

    fn decode_body(header: Header, mut buf: Bytes) -> Result<Self, Error> {
        let channel_id = header.channel_id_size()?.read(&mut buf, Self::NAME)?;
        Ok(Self {
            channel_id: DynamicChannelId::from(channel_id),
        })
    }
}

/// PDUs sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPdu {
    CapabilitiesRequest(CapabilitiesRequest),
    CreateRequest(CreateRequest),
    DataFirst(DataFirst),
    Data(Data),
    CloseRequest(Close),
}

/// PDUs sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPdu {
    CapabilitiesResponse(CapabilitiesResponse),
    CreateResponse(CreateResponse),
    DataFirst(DataFirst),
    Data(Data),
    /// Answers a close request, or closes a channel from the client side.
    Close(Close),
}

impl ServerPdu {
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let header = Header::decode(&mut buf)?;

        let pdu = match header.cmd {
            Cmd::Capability => Self::CapabilitiesRequest(CapabilitiesRequest::decode_body(buf)?),
            Cmd::Create => Self::CreateRequest(CreateRequest::decode_body(header, buf)?),
            Cmd::DataFirst => Self::DataFirst(DataFirst::decode_body(header, buf)?),
            Cmd::Data => Self::Data(Data::decode_body(header, buf)?),
            Cmd::Close => Self::CloseRequest(Close::decode_body(header, buf)?),
            Cmd::DataFirstCompressed | Cmd::DataCompressed | Cmd::SoftSyncRequest | Cmd::SoftSyncResponse => {
                return Err(Error::InvalidPacket {
                    name: Header::NAME,
                    field: "Cmd",
                    reason: "not negotiated",
                });
            }
        };

        Ok(pdu)
    }

    pub fn size(&self) -> usize {
        match self {
            ServerPdu::CapabilitiesRequest(pdu) => Header::SIZE + pdu.size(),
            ServerPdu::CreateRequest(pdu) => {
                Header::SIZE
                    + FieldSize::for_value(u32::from(pdu.channel_id)).width()
                    + pdu.channel_name.len()
                    + 1 /* null terminator */
            }
            ServerPdu::DataFirst(pdu) => data_first_size(pdu),
            ServerPdu::Data(pdu) => data_size(pdu),
            ServerPdu::CloseRequest(pdu) => close_size(pdu),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(self.size());

        match self {
            ServerPdu::CapabilitiesRequest(pdu) => {
                let sp = if pdu.priority_charges.is_some() { 2 } else { 0 };
                Header::new(Cmd::Capability, sp, FieldSize::U8).encode(buf);
                pdu.encode_body(buf);
            }
            ServerPdu::CreateRequest(pdu) => {
                let id_size = FieldSize::for_value(u32::from(pdu.channel_id));
                Header::new(Cmd::Create, pdu.priority, id_size).encode(buf);
                id_size.write(buf, u32::from(pdu.channel_id));
                buf.put(pdu.channel_name.as_bytes());
                buf.put_u8(0);
            }
            ServerPdu::DataFirst(pdu) => encode_data_first(pdu, buf)?,
            ServerPdu::Data(pdu) => encode_data(pdu, buf),
            ServerPdu::CloseRequest(pdu) => encode_close(pdu, buf),
        }

        Ok(())
    }
}

impl ClientPdu {
    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        let header = Header::decode(&mut buf)?;

        let pdu = match header.cmd {
            Cmd::Capability => Self::CapabilitiesResponse(CapabilitiesResponse::decode_body(buf)?),
            Cmd::Create => Self::CreateResponse(CreateResponse::decode_body(header, buf)?),
            Cmd::DataFirst => Self::DataFirst(DataFirst::decode_body(header, buf)?),
            Cmd::Data => Self::Data(Data::decode_body(header, buf)?),
            Cmd::Close => Self::Close(Close::decode_body(header, buf)?),
            Cmd::DataFirstCompressed | Cmd::DataCompressed | Cmd::SoftSyncRequest | Cmd::SoftSyncResponse => {
                return Err(Error::InvalidPacket {
                    name: Header::NAME,
                    field: "Cmd",
                    reason: "not negotiated",
                });
            }
        };

        Ok(pdu)
    }

    pub fn size(&self) -> usize {
        match self {
            ClientPdu::CapabilitiesResponse(_) => Header::SIZE + CapabilitiesResponse::SIZE,
            ClientPdu::CreateResponse(pdu) => {
                Header::SIZE + FieldSize::for_value(u32::from(pdu.channel_id)).width() + 4 /* CreationStatus */
            }
            ClientPdu::DataFirst(pdu) => data_first_size(pdu),
            ClientPdu::Data(pdu) => data_size(pdu),
            ClientPdu::Close(pdu) => close_size(pdu),
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(self.size());

        match self {
            ClientPdu::CapabilitiesResponse(pdu) => {
                Header::new(Cmd::Capability, 0, FieldSize::U8).encode(buf);
                pdu.encode_body(buf);
            }
            ClientPdu::CreateResponse(pdu) => {
                let id_size = FieldSize::for_value(u32::from(pdu.channel_id));
                Header::new(Cmd::Create, 0, id_size).encode(buf);
                id_size.write(buf, u32::from(pdu.channel_id));
                buf.put_u32_le(pdu.creation_status.0);
            }
            ClientPdu::DataFirst(pdu) => encode_data_first(pdu, buf)?,
            ClientPdu::Data(pdu) => encode_data(pdu, buf),
            ClientPdu::Close(pdu) => encode_close(pdu, buf),
        }

        Ok(())
    }

    /// Encodes into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn data_first_size(pdu: &DataFirst) -> usize {
    Header::SIZE
        + FieldSize::for_value(u32::from(pdu.channel_id)).width()
        + FieldSize::for_value(pdu.total_length).width()
        + pdu.data.len()
}

fn data_size(pdu: &Data) -> usize {
    Header::SIZE + FieldSize::for_value(u32::from(pdu.channel_id)).width() + pdu.data.len()
}

fn close_size(pdu: &Close) -> usize {
    Header::SIZE + FieldSize::for_value(u32::from(pdu.channel_id)).width()
}

fn encode_data_first(pdu: &DataFirst, buf: &mut BytesMut) -> Result<(), Error> {
    if pdu.data.len() > pdu.total_length as usize {
        return Err(Error::InvalidPacket {
            name: DataFirst::NAME,
            field: "Length",
            reason: "first fragment is larger than the whole message",
        });
    }

    let id_size = FieldSize::for_value(u32::from(pdu.channel_id));
    let len_size = FieldSize::for_value(pdu.total_length);
    Header::new(Cmd::DataFirst, len_size as u8, id_size).encode(buf);
    id_size.write(buf, u32::from(pdu.channel_id));
    len_size.write(buf, pdu.total_length);
    buf.put(pdu.data.clone());

    Ok(())
}

fn encode_data(pdu: &Data, buf: &mut BytesMut) {
    let id_size = FieldSize::for_value(u32::from(pdu.channel_id));
    Header::new(Cmd::Data, 0, id_size).encode(buf);
    id_size.write(buf, u32::from(pdu.channel_id));
    buf.put(pdu.data.clone());
}

fn encode_close(pdu: &Close, buf: &mut BytesMut) {
    let id_size = FieldSize::for_value(u32::from(pdu.channel_id));
    Header::new(Cmd::Close, 0, id_size).encode(buf);
    id_size.write(buf, u32::from(pdu.channel_id));
}

/// Splits a message into DRDYNVC data PDUs carrying at most `max_chunk_size` payload bytes each.
///
/// A message fitting into a single chunk is sent as one `Data` PDU, otherwise
/// a `DataFirst` PDU announcing the total length is followed by `Data` PDUs.
pub fn fragment(channel_id: DynamicChannelId, mut data: Bytes, max_chunk_size: usize) -> Result<Vec<ClientPdu>, Error> {
    if max_chunk_size == 0 {
        return Err(Error::InvalidPacket {
            name: Data::NAME,
            field: "Data",
            reason: "chunk size must not be zero",
        });
    }

    if data.len() <= max_chunk_size {
        return Ok(vec![ClientPdu::Data(Data { channel_id, data })]);
    }

    let total_length = u32::try_from(data.len()).map_err(|_| Error::PacketOversized {
        packet_size: data.len(),
        max: u32::MAX as usize,
    })?;

    let mut pdus = Vec::with_capacity(data.len().div_ceil(max_chunk_size));

    pdus.push(ClientPdu::DataFirst(DataFirst {
        channel_id,
        total_length,
        data: data.split_to(max_chunk_size),
    }));

    while !data.is_empty() {
        let split_at = core::cmp::min(max_chunk_size, data.len());
        pdus.push(ClientPdu::Data(Data {
            channel_id,
            data: data.split_to(split_at),
        }));
    }

    Ok(pdus)
}
