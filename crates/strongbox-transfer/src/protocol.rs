/// TCP wire format for the backup protocol (version 3).
///
/// ```text
/// Request:  [0..16]  client id
///           [16]     version (u8)
///           [17..19] request code (u16 LE)
///           [19..23] payload size (u32 LE)
///           [23..]   payload
///
/// Response: [0]      version (u8)
///           [1..3]   response code (u16 LE)
///           [3..7]   payload size (u32 LE)
///           [7..]    payload
/// ```
///
/// Name fields are fixed 255-byte slots, NUL-padded when shorter.

use std::fmt;
use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strongbox_types::models::ClientId;

use crate::error::{ProtocolError, Result, TransferError};

/// Protocol version written on every request.
pub const VERSION: u8 = 3;

/// Versions accepted on incoming frames.
pub const SUPPORTED_VERSIONS: &[u8] = &[VERSION];

pub const REQUEST_HEADER_SIZE: usize = 23;
pub const RESPONSE_HEADER_SIZE: usize = 7;

/// Maximum payload carried by a single physical packet (1 MiB).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

pub const CLIENT_ID_SIZE: usize = ClientId::LEN;

/// Fixed slot for usernames and file names.
pub const NAME_SIZE: usize = 255;

/// SEND_FILE metadata ahead of the encrypted content:
/// content size, original size, packet number, total packets, file name.
pub const FILE_PACKET_HEADER: usize = 4 * 4 + NAME_SIZE;

/// FILE_CRC payload: client id, content size, file name, checksum.
pub const CRC_REPORT_SIZE: usize = CLIENT_ID_SIZE + 4 + NAME_SIZE + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestCode {
    Register = 1025,
    SendPublicKey = 1026,
    Reconnect = 1027,
    SendFile = 1028,
    CrcOk = 1029,
    CrcInvalidRetry = 1030,
    CrcFailedAbort = 1031,
}

impl TryFrom<u16> for RequestCode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        Ok(match code {
            1025 => Self::Register,
            1026 => Self::SendPublicKey,
            1027 => Self::Reconnect,
            1028 => Self::SendFile,
            1029 => Self::CrcOk,
            1030 => Self::CrcInvalidRetry,
            1031 => Self::CrcFailedAbort,
            _ => return Err(ProtocolError::UnknownCode { kind: "request", code }),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseCode {
    RegisterOk = 1600,
    RegisterFail = 1601,
    PublicKeyAck = 1602,
    FileCrc = 1603,
    GenericAck = 1604,
    ReconnectAck = 1605,
    ReconnectFail = 1606,
    GenericServerError = 1607,
}

impl TryFrom<u16> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, ProtocolError> {
        Ok(match code {
            1600 => Self::RegisterOk,
            1601 => Self::RegisterFail,
            1602 => Self::PublicKeyAck,
            1603 => Self::FileCrc,
            1604 => Self::GenericAck,
            1605 => Self::ReconnectAck,
            1606 => Self::ReconnectFail,
            1607 => Self::GenericServerError,
            _ => return Err(ProtocolError::UnknownCode { kind: "response", code }),
        })
    }
}

impl fmt::Display for RequestCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

/// Parsed request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: ClientId,
    pub version: u8,
    pub code: RequestCode,
    pub payload_size: u32,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u8(self.version);
        buf.put_u16_le(self.code as u16);
        buf.put_u32_le(self.payload_size);
    }

    /// Decode and validate the version, code and size limit.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len("request header", data, REQUEST_HEADER_SIZE)?;
        let mut buf = &data[..REQUEST_HEADER_SIZE];
        let mut id = [0u8; CLIENT_ID_SIZE];
        buf.copy_to_slice(&mut id);
        let version = check_version(buf.get_u8())?;
        let code = RequestCode::try_from(buf.get_u16_le())?;
        let payload_size = check_size(buf.get_u32_le())?;
        Ok(Self {
            client_id: ClientId::from_bytes(id),
            version,
            code,
            payload_size,
        })
    }
}

/// Parsed response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: ResponseCode,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u16_le(self.code as u16);
        buf.put_u32_le(self.payload_size);
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        check_len("response header", data, RESPONSE_HEADER_SIZE)?;
        let mut buf = &data[..RESPONSE_HEADER_SIZE];
        let version = check_version(buf.get_u8())?;
        let code = ResponseCode::try_from(buf.get_u16_le())?;
        let payload_size = check_size(buf.get_u32_le())?;
        Ok(Self {
            version,
            code,
            payload_size,
        })
    }
}

/// A complete client → server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub client_id: ClientId,
    pub code: RequestCode,
    pub payload: Bytes,
}

impl Request {
    pub fn new(code: RequestCode, client_id: ClientId, payload: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            code,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_request(self.code, self.client_id, &self.payload)
    }
}

/// A complete server → client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub code: ResponseCode,
    pub payload: Bytes,
}

impl Response {
    pub fn new(code: ResponseCode, payload: impl Into<Bytes>) -> Self {
        Self {
            version: VERSION,
            code,
            payload: payload.into(),
        }
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let size = check_size_usize(self.payload.len())?;
        let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + self.payload.len());
        ResponseHeader {
            version: self.version,
            code: self.code,
            payload_size: size,
        }
        .encode(&mut buf);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Encode a request frame. Fails if the payload exceeds [`MAX_PACKET_SIZE`].
pub fn encode_request(code: RequestCode, client_id: ClientId, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let size = check_size_usize(payload.len())?;
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    RequestHeader {
        client_id,
        version: VERSION,
        code,
        payload_size: size,
    }
    .encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode one complete request frame. The buffer must hold exactly the
/// declared payload.
pub fn decode_request(data: &[u8]) -> Result<Request, ProtocolError> {
    let header = RequestHeader::decode(data)?;
    let payload = exact_payload(&data[REQUEST_HEADER_SIZE..], header.payload_size)?;
    Ok(Request {
        client_id: header.client_id,
        code: header.code,
        payload,
    })
}

/// Decode one complete response frame into (version, code, payload).
pub fn decode_response(data: &[u8]) -> Result<Response, ProtocolError> {
    let header = ResponseHeader::decode(data)?;
    let payload = exact_payload(&data[RESPONSE_HEADER_SIZE..], header.payload_size)?;
    Ok(Response {
        version: header.version,
        code: header.code,
        payload,
    })
}

/// Read one response frame from a blocking stream.
pub fn read_response<R: Read + ?Sized>(reader: &mut R) -> Result<Response> {
    let mut head = [0u8; RESPONSE_HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .map_err(|e| TransferError::network("reading response header", e))?;
    let header = ResponseHeader::decode(&head)?;
    let payload = read_payload(reader, header.payload_size)?;
    Ok(Response {
        version: header.version,
        code: header.code,
        payload,
    })
}

/// Read one request frame from a blocking stream (server side, tooling).
pub fn read_request<R: Read + ?Sized>(reader: &mut R) -> Result<Request> {
    let mut head = [0u8; REQUEST_HEADER_SIZE];
    reader
        .read_exact(&mut head)
        .map_err(|e| TransferError::network("reading request header", e))?;
    let header = RequestHeader::decode(&head)?;
    let payload = read_payload(reader, header.payload_size)?;
    Ok(Request {
        client_id: header.client_id,
        code: header.code,
        payload,
    })
}

fn read_payload<R: Read + ?Sized>(reader: &mut R, size: u32) -> Result<Bytes> {
    let mut payload = vec![0u8; size as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| TransferError::network("reading payload", e))?;
    Ok(Bytes::from(payload))
}

fn check_len(what: &'static str, data: &[u8], need: usize) -> Result<(), ProtocolError> {
    if data.len() < need {
        return Err(ProtocolError::Truncated {
            what,
            need,
            have: data.len(),
        });
    }
    Ok(())
}

fn check_version(version: u8) -> Result<u8, ProtocolError> {
    if SUPPORTED_VERSIONS.contains(&version) {
        Ok(version)
    } else {
        Err(ProtocolError::UnsupportedVersion(version))
    }
}

fn check_size(size: u32) -> Result<u32, ProtocolError> {
    if size as usize > MAX_PACKET_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            declared: size as usize,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(size)
}

fn check_size_usize(size: usize) -> Result<u32, ProtocolError> {
    if size > MAX_PACKET_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            declared: size,
            max: MAX_PACKET_SIZE,
        });
    }
    Ok(size as u32)
}

fn exact_payload(rest: &[u8], declared: u32) -> Result<Bytes, ProtocolError> {
    if rest.len() != declared as usize {
        return Err(ProtocolError::SizeMismatch {
            declared: declared as usize,
            available: rest.len(),
        });
    }
    Ok(Bytes::copy_from_slice(rest))
}

// ── Name slots ─────────────────────────────────────────────────────────

/// Write `name` into a 255-byte NUL-padded slot.
pub fn put_name(buf: &mut BytesMut, field: &'static str, name: &str) -> Result<(), ProtocolError> {
    let raw = name.as_bytes();
    if raw.len() > NAME_SIZE {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: raw.len(),
            max: NAME_SIZE,
        });
    }
    if raw.contains(&0) {
        return Err(ProtocolError::BadPayload(format!("{} contains a NUL byte", field)));
    }
    buf.put_slice(raw);
    buf.put_bytes(0, NAME_SIZE - raw.len());
    Ok(())
}

/// Read a name slot, stopping at the first NUL.
pub fn get_name(slot: &[u8], field: &'static str) -> Result<String, ProtocolError> {
    check_len(field, slot, NAME_SIZE)?;
    let slot = &slot[..NAME_SIZE];
    let end = slot.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
    String::from_utf8(slot[..end].to_vec())
        .map_err(|_| ProtocolError::BadPayload(format!("{} is not valid UTF-8", field)))
}

fn get_client_id(buf: &mut &[u8]) -> ClientId {
    let mut id = [0u8; CLIENT_ID_SIZE];
    buf.copy_to_slice(&mut id);
    ClientId::from_bytes(id)
}

// ── Request payloads ───────────────────────────────────────────────────

/// REGISTER and RECONNECT carry only the username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePayload {
    pub name: String,
}

impl NamePayload {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(NAME_SIZE);
        put_name(&mut buf, "name", &self.name)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_exact("name payload", payload, NAME_SIZE)?;
        Ok(Self {
            name: get_name(payload, "name")?,
        })
    }
}

/// SEND_PUBLIC_KEY: username followed by the DER public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPayload {
    pub name: String,
    pub public_key: Vec<u8>,
}

impl PublicKeyPayload {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.public_key.len() != strongbox_crypto::PUBLIC_KEY_SIZE {
            return Err(ProtocolError::BadPayload(format!(
                "public key is {} bytes, expected {}",
                self.public_key.len(),
                strongbox_crypto::PUBLIC_KEY_SIZE
            )));
        }
        let mut buf = BytesMut::with_capacity(NAME_SIZE + self.public_key.len());
        put_name(&mut buf, "name", &self.name)?;
        buf.put_slice(&self.public_key);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_exact(
            "public key payload",
            payload,
            NAME_SIZE + strongbox_crypto::PUBLIC_KEY_SIZE,
        )?;
        Ok(Self {
            name: get_name(payload, "name")?,
            public_key: payload[NAME_SIZE..].to_vec(),
        })
    }
}

/// One physical SEND_FILE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    pub original_size: u32,
    /// 1-based.
    pub packet_number: u32,
    pub total_packets: u32,
    pub file_name: String,
    /// Encrypted chunk.
    pub content: Bytes,
}

impl FilePacket {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        validate_sequence(self.packet_number, self.total_packets)?;
        let mut buf = BytesMut::with_capacity(FILE_PACKET_HEADER + self.content.len());
        buf.put_u32_le(self.content.len() as u32);
        buf.put_u32_le(self.original_size);
        buf.put_u32_le(self.packet_number);
        buf.put_u32_le(self.total_packets);
        put_name(&mut buf, "file name", &self.file_name)?;
        buf.put_slice(&self.content);
        if buf.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                declared: buf.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        check_len("file packet", payload, FILE_PACKET_HEADER)?;
        let mut buf = payload;
        let content_size = buf.get_u32_le() as usize;
        let original_size = buf.get_u32_le();
        let packet_number = buf.get_u32_le();
        let total_packets = buf.get_u32_le();
        validate_sequence(packet_number, total_packets)?;
        let file_name = get_name(buf, "file name")?;
        let content = &buf[NAME_SIZE..];
        if content.len() != content_size {
            return Err(ProtocolError::SizeMismatch {
                declared: content_size,
                available: content.len(),
            });
        }
        Ok(Self {
            original_size,
            packet_number,
            total_packets,
            file_name,
            content: Bytes::copy_from_slice(content),
        })
    }

    pub fn is_last(&self) -> bool {
        self.packet_number == self.total_packets
    }
}

/// Packet numbers are 1-based and never exceed the total.
pub fn validate_sequence(packet_number: u32, total_packets: u32) -> Result<(), ProtocolError> {
    if packet_number == 0 || total_packets == 0 || packet_number > total_packets {
        return Err(ProtocolError::BadPayload(format!(
            "packet {} of {} is out of range",
            packet_number, total_packets
        )));
    }
    Ok(())
}

/// CRC_OK, CRC_INVALID_RETRY and CRC_FAILED_ABORT carry only the file name.
pub fn file_name_payload(file_name: &str) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(NAME_SIZE);
    put_name(&mut buf, "file name", file_name)?;
    Ok(buf.freeze())
}

// ── Response payloads ──────────────────────────────────────────────────

/// REGISTER_OK payload.
pub fn decode_client_id(payload: &[u8]) -> Result<ClientId, ProtocolError> {
    expect_exact("client id", payload, CLIENT_ID_SIZE)?;
    let mut buf = payload;
    Ok(get_client_id(&mut buf))
}

/// PUBLIC_KEY_ACK and RECONNECT_ACK: client id followed by the RSA-wrapped
/// session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyGrant {
    pub client_id: ClientId,
    pub encrypted_key: Vec<u8>,
}

impl SessionKeyGrant {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CLIENT_ID_SIZE + self.encrypted_key.len());
        buf.put_slice(self.client_id.as_bytes());
        buf.put_slice(&self.encrypted_key);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() <= CLIENT_ID_SIZE {
            return Err(ProtocolError::Truncated {
                what: "session key grant",
                need: CLIENT_ID_SIZE + 1,
                have: payload.len(),
            });
        }
        let mut buf = payload;
        let client_id = get_client_id(&mut buf);
        Ok(Self {
            client_id,
            encrypted_key: buf.to_vec(),
        })
    }
}

/// FILE_CRC: the server's checksum over the reassembled plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcReport {
    pub client_id: ClientId,
    /// Encrypted bytes the server received.
    pub content_size: u32,
    pub file_name: String,
    pub cksum: u32,
}

impl CrcReport {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(CRC_REPORT_SIZE);
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u32_le(self.content_size);
        put_name(&mut buf, "file name", &self.file_name)?;
        buf.put_u32_le(self.cksum);
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        expect_exact("crc report", payload, CRC_REPORT_SIZE)?;
        let mut buf = payload;
        let client_id = get_client_id(&mut buf);
        let content_size = buf.get_u32_le();
        let file_name = get_name(buf, "file name")?;
        buf.advance(NAME_SIZE);
        let cksum = buf.get_u32_le();
        Ok(Self {
            client_id,
            content_size,
            file_name,
            cksum,
        })
    }
}

fn expect_exact(what: &'static str, payload: &[u8], size: usize) -> Result<(), ProtocolError> {
    if payload.len() < size {
        return Err(ProtocolError::Truncated {
            what,
            need: size,
            have: payload.len(),
        });
    }
    if payload.len() != size {
        return Err(ProtocolError::SizeMismatch {
            declared: size,
            available: payload.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> ClientId {
        ClientId::from_bytes(*b"0123456789abcdef")
    }

    #[test]
    fn header_sizes_are_fixed() {
        for len in [0usize, 1, 255, 4096, MAX_PACKET_SIZE] {
            let payload = vec![0xEE; len];
            let req = encode_request(RequestCode::SendFile, id(), &payload).unwrap();
            assert_eq!(req.len() - len, REQUEST_HEADER_SIZE);
            let resp = Response::new(ResponseCode::GenericAck, payload).encode().unwrap();
            assert_eq!(resp.len() - len, RESPONSE_HEADER_SIZE);
        }
    }

    #[test]
    fn request_layout_is_little_endian() {
        let req = encode_request(RequestCode::Register, id(), &[1, 2, 3]).unwrap();
        assert_eq!(&req[..16], id().as_bytes());
        assert_eq!(req[16], VERSION);
        assert_eq!(&req[17..19], &1025u16.to_le_bytes());
        assert_eq!(&req[19..23], &3u32.to_le_bytes());
        assert_eq!(&req[23..], &[1, 2, 3]);
    }

    #[test]
    fn request_roundtrip() {
        let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let encoded = encode_request(RequestCode::CrcInvalidRetry, id(), &payload).unwrap();
        let decoded = decode_request(&encoded).unwrap();
        assert_eq!(decoded, Request::new(RequestCode::CrcInvalidRetry, id(), payload));
    }

    #[test]
    fn response_roundtrip() {
        let resp = Response::new(ResponseCode::FileCrc, vec![9u8; 279]);
        let decoded = decode_response(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.version, VERSION);
        assert_eq!(decoded.payload_size(), 279);
        assert_eq!(decoded, resp);
    }

    #[test]
    fn unknown_version_rejected() {
        let mut raw = Response::new(ResponseCode::GenericAck, Bytes::new())
            .encode()
            .unwrap()
            .to_vec();
        raw[0] = 2;
        assert_eq!(
            decode_response(&raw).unwrap_err(),
            ProtocolError::UnsupportedVersion(2)
        );
    }

    #[test]
    fn size_disagreement_rejected() {
        let mut raw = Response::new(ResponseCode::RegisterOk, vec![0u8; 16])
            .encode()
            .unwrap()
            .to_vec();
        raw.truncate(raw.len() - 1);
        assert!(matches!(
            decode_response(&raw),
            Err(ProtocolError::SizeMismatch { declared: 16, available: 15 })
        ));
    }

    #[test]
    fn oversized_declaration_rejected() {
        let mut raw = vec![VERSION];
        raw.extend_from_slice(&1604u16.to_le_bytes());
        raw.extend_from_slice(&((MAX_PACKET_SIZE as u32) + 1).to_le_bytes());
        assert!(matches!(
            decode_response(&raw),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
        assert!(encode_request(RequestCode::SendFile, id(), &vec![0u8; MAX_PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn unknown_code_rejected() {
        let mut raw = vec![VERSION];
        raw.extend_from_slice(&1700u16.to_le_bytes());
        raw.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            decode_response(&raw),
            Err(ProtocolError::UnknownCode { code: 1700, .. })
        ));
    }

    #[test]
    fn read_response_from_stream() {
        let resp = Response::new(ResponseCode::RegisterOk, id().as_bytes().to_vec());
        let wire = resp.encode().unwrap();
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        assert_eq!(read_response(&mut cursor).unwrap(), resp);
        // Stream exhausted: the next read is a network-level failure.
        assert!(read_response(&mut cursor).unwrap_err().is_network());
    }

    #[test]
    fn names_pad_and_trim() {
        let p = NamePayload { name: "alice".into() };
        let raw = p.encode().unwrap();
        assert_eq!(raw.len(), NAME_SIZE);
        assert!(raw[5..].iter().all(|&b| b == 0));
        assert_eq!(NamePayload::decode(&raw).unwrap(), p);

        let full = NamePayload { name: "x".repeat(NAME_SIZE) };
        assert_eq!(NamePayload::decode(&full.encode().unwrap()).unwrap(), full);

        let long = NamePayload { name: "x".repeat(NAME_SIZE + 1) };
        assert!(matches!(long.encode(), Err(ProtocolError::FieldTooLong { .. })));
    }

    #[test]
    fn file_packet_roundtrip() {
        let pkt = FilePacket {
            original_size: 100_000,
            packet_number: 2,
            total_packets: 7,
            file_name: "notes.txt".into(),
            content: Bytes::from(vec![0xAB; 2064]),
        };
        let raw = pkt.encode().unwrap();
        assert_eq!(raw.len(), FILE_PACKET_HEADER + 2064);
        assert_eq!(FilePacket::decode(&raw).unwrap(), pkt);
        assert!(!pkt.is_last());
    }

    #[test]
    fn file_packet_sequence_checked() {
        let mut pkt = FilePacket {
            original_size: 1,
            packet_number: 0,
            total_packets: 1,
            file_name: "a".into(),
            content: Bytes::from_static(&[0u8; 16]),
        };
        assert!(pkt.encode().is_err());
        pkt.packet_number = 2;
        assert!(pkt.encode().is_err());
        pkt.packet_number = 1;
        assert!(pkt.encode().unwrap().len() > FILE_PACKET_HEADER);
    }

    #[test]
    fn crc_report_roundtrip() {
        let report = CrcReport {
            client_id: id(),
            content_size: 4096,
            file_name: "db.sqlite".into(),
            cksum: 0xDEAD_BEEF,
        };
        let raw = report.encode().unwrap();
        assert_eq!(raw.len(), CRC_REPORT_SIZE);
        assert_eq!(CrcReport::decode(&raw).unwrap(), report);
        assert!(CrcReport::decode(&raw[..CRC_REPORT_SIZE - 1]).is_err());
    }

    #[test]
    fn session_key_grant_requires_key_bytes() {
        assert!(SessionKeyGrant::decode(id().as_bytes()).is_err());
        let grant = SessionKeyGrant {
            client_id: id(),
            encrypted_key: vec![1u8; 128],
        };
        assert_eq!(SessionKeyGrant::decode(&grant.encode()).unwrap(), grant);
    }

    #[test]
    fn public_key_payload_size_enforced() {
        let ok = PublicKeyPayload {
            name: "alice".into(),
            public_key: vec![0x30; strongbox_crypto::PUBLIC_KEY_SIZE],
        };
        assert_eq!(PublicKeyPayload::decode(&ok.encode().unwrap()).unwrap(), ok);
        let bad = PublicKeyPayload {
            name: "alice".into(),
            public_key: vec![0x30; 140],
        };
        assert!(bad.encode().is_err());
    }
}
