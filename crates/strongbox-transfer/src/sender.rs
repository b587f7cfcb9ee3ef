/// Adaptive file sender: read → encrypt → SEND_FILE → ack, one packet at a
/// time.
///
/// ```text
/// [ChunkSource] --plaintext--> [AES-256-CBC] --FilePacket--> [Exchanger]
///   stream ≤ 1 MiB                 zero IV                  GENERIC_ACK
///   mmap   > 1 MiB                 PKCS#7                   FILE_CRC (last)
/// ```
///
/// Packet numbers are 1-based and contiguous. Because the chunk size moves
/// between packets, `total_packets` is a projection: the packets sent so far
/// plus the rest of the file at the current size. The final packet always
/// carries `packet_number == total_packets`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use strongbox_crypto::{Cksum, SessionKey, encrypt_chunk, encrypted_len};
use strongbox_types::events::{Phase, StatusEvent};
use strongbox_types::models::ClientId;
use tracing::{debug, info, warn};

use crate::buffer::BufferState;
use crate::config::{TransferConfig, TransferContext};
use crate::connection::Exchanger;
use crate::error::{ProtocolError, Result, TransferError};
use crate::integrity::BoundedCounter;
use crate::protocol::{CrcReport, FilePacket, NAME_SIZE, Request, RequestCode, ResponseCode};
use crate::stats::ThroughputMeter;

/// Block size for the checksum pre-pass.
const CKSUM_BLOCK: usize = 64 * 1024;

/// Random access to the plaintext being backed up.
pub trait ChunkSource: Send {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` starting at `offset`. Short only at end of file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Plain buffered reads with a seek per chunk.
pub struct StreamSource {
    file: File,
    len: u64,
}

impl StreamSource {
    pub fn new(file: File, len: u64) -> Self {
        Self { file, len }
    }
}

impl ChunkSource for StreamSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

/// Whole file mapped read-only.
pub struct MappedSource {
    map: Mmap,
}

impl MappedSource {
    pub fn new(file: &File) -> io::Result<Self> {
        // SAFETY: the mapping is read-only and lives no longer than the
        // session. A file truncated underneath us is caught by the CRC.
        let map = unsafe { Mmap::map(file)? };
        Ok(Self { map })
    }
}

impl ChunkSource for MappedSource {
    fn len(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.map.len());
        let n = buf.len().min(self.map.len() - start);
        buf[..n].copy_from_slice(&self.map[start..start + n]);
        Ok(n)
    }
}

/// Open `path` with the read strategy its size calls for.
pub fn open_source(path: &Path, mmap_threshold: u64) -> Result<Box<dyn ChunkSource>> {
    let file = File::open(path).map_err(|e| TransferError::file(path, e))?;
    let len = file.metadata().map_err(|e| TransferError::file(path, e))?.len();
    if len > mmap_threshold && len > 0 {
        debug!(path = %path.display(), len, "memory-mapping file");
        Ok(Box::new(MappedSource::new(&file).map_err(|e| TransferError::file(path, e))?))
    } else {
        Ok(Box::new(StreamSource::new(file, len)))
    }
}

/// One attempt at sending one file.
pub struct TransferSession {
    pub path: PathBuf,
    /// Base name, as sent in every packet.
    pub file_name: String,
    pub original_size: u32,
    /// POSIX cksum of the plaintext, computed before the first packet.
    pub crc: u32,
    source: Box<dyn ChunkSource>,
}

impl TransferSession {
    pub fn open(path: &Path, config: &TransferConfig) -> Result<Self> {
        let file_name = file_name_of(path)?;
        let mut source = open_source(path, config.mmap_threshold)?;
        let original_size = u32::try_from(source.len()).map_err(|_| {
            TransferError::Config(format!(
                "{} is {} bytes; the protocol carries sizes as u32",
                path.display(),
                source.len()
            ))
        })?;
        let crc = checksum(source.as_mut()).map_err(|e| TransferError::file(path, e))?;
        debug!(file = %file_name, size = original_size, crc, "file prepared");
        Ok(Self {
            path: path.to_path_buf(),
            file_name,
            original_size,
            crc,
            source,
        })
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TransferError::Config(format!("{} has no UTF-8 file name", path.display())))?;
    if name.len() > NAME_SIZE || name.as_bytes().contains(&0) {
        return Err(TransferError::Config(format!(
            "file name {:?} does not fit the {}-byte name field",
            name, NAME_SIZE
        )));
    }
    Ok(name.to_string())
}

fn checksum(source: &mut dyn ChunkSource) -> io::Result<u32> {
    let mut crc = Cksum::new();
    let mut block = vec![0u8; CKSUM_BLOCK];
    let mut offset = 0u64;
    while offset < source.len() {
        let n = source.read_at(offset, &mut block)?;
        if n == 0 {
            break;
        }
        crc.update(&block[..n]);
        offset += n as u64;
    }
    Ok(crc.finalize())
}

/// Result of streaming every packet of one attempt.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// The server's FILE_CRC answer to the final packet.
    pub report: CrcReport,
    pub packets: u32,
    /// Ciphertext bytes across accepted packets.
    pub bytes_sent: u64,
    /// Packets resent after GENERIC_SERVER_ERROR.
    pub packet_retries: u32,
    /// Packets that went through connection recovery.
    pub recovered: u32,
}

pub struct TransferEngine<'a> {
    ctx: &'a TransferContext,
    buffer: BufferState,
    file_retries: BoundedCounter,
}

impl<'a> TransferEngine<'a> {
    pub fn new(ctx: &'a TransferContext) -> Self {
        Self {
            ctx,
            buffer: BufferState::new(ctx.config.buffer.clone(), 0),
            file_retries: BoundedCounter::new(ctx.config.max_file_retries),
        }
    }

    /// Current chunk size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.current()
    }

    /// Resend budget of the current or most recent attempt.
    pub fn file_retries(&self) -> BoundedCounter {
        self.file_retries
    }

    /// Send every packet of `session`. Starts from the initial bucket for the
    /// file size regardless of earlier attempts.
    pub fn send(&mut self, session: &mut TransferSession, link: &mut dyn Exchanger) -> Result<TransferOutcome> {
        let ctx = self.ctx;
        let config = &ctx.config;
        let total = u64::from(session.original_size);
        self.buffer.reset(total);
        self.file_retries.reset();
        ctx.emit(StatusEvent::Phase(Phase::Transferring));
        info!(
            file = %session.file_name,
            size = total,
            buffer = self.buffer.current(),
            "sending file"
        );

        let mut meter = ThroughputMeter::new(total);
        let mut chunk = vec![0u8; config.buffer.max_size];
        let mut offset = 0u64;
        let mut sent = 0u32;
        let mut bytes_sent = 0u64;
        let mut recovered = 0u32;

        loop {
            ctx.cancel.check()?;

            let size = self.buffer.current();
            let remaining = total - offset;
            let take = remaining.min(size as u64) as usize;
            let n = session
                .source
                .read_at(offset, &mut chunk[..take])
                .map_err(|e| TransferError::file(&session.path, e))?;
            if n != take {
                return Err(TransferError::file(
                    &session.path,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "file shrank during transfer"),
                ));
            }

            let packet_number = sent + 1;
            let rest = (remaining - take as u64).div_ceil(size as u64) as u32;
            let total_packets = packet_number + rest;
            let plaintext = &chunk[..take];
            let file_name = &session.file_name;
            let original_size = session.original_size;

            let mut build = |client_id: ClientId, key: &SessionKey| -> Result<Request> {
                let packet = FilePacket {
                    original_size,
                    packet_number,
                    total_packets,
                    file_name: file_name.clone(),
                    content: Bytes::from(encrypt_chunk(key, plaintext)?),
                };
                Ok(Request::new(RequestCode::SendFile, client_id, packet.encode()?))
            };
            let exchange = link.exchange_with(&mut build)?;
            let is_last = packet_number == total_packets;

            match exchange.response.code {
                ResponseCode::GenericServerError => {
                    if !self.file_retries.try_increment() {
                        return Err(ProtocolError::ServerRejected {
                            packet: packet_number,
                            attempts: self.file_retries.count() + 1,
                        }
                        .into());
                    }
                    if self.buffer.on_failure().is_none() {
                        debug!("buffer already at minimum");
                    }
                    warn!(
                        packet = packet_number,
                        retry = %self.file_retries,
                        buffer = self.buffer.current(),
                        "server rejected packet, resending"
                    );
                    ctx.emit(StatusEvent::error(
                        format!(
                            "server rejected packet {}, resending ({})",
                            packet_number, self.file_retries
                        ),
                        false,
                    ));
                    continue;
                }
                ResponseCode::GenericAck if !is_last => {}
                ResponseCode::FileCrc if is_last => {}
                other => {
                    return Err(ProtocolError::UnexpectedResponse {
                        expected: if is_last { "FILE_CRC" } else { "GENERIC_ACK" },
                        got: other as u16,
                    }
                    .into());
                }
            }

            let adjusted = if exchange.recovered {
                recovered += 1;
                self.buffer.on_failure()
            } else {
                self.buffer.on_success()
            };
            if let Some(new_size) = adjusted {
                debug!(from = size, to = new_size, "buffer resized");
            }

            sent = packet_number;
            offset += take as u64;
            bytes_sent += encrypted_len(take) as u64;
            debug!(packet = packet_number, total = total_packets, bytes = take, "packet acknowledged");
            ctx.emit(meter.record(take as u64).to_event());

            if is_last {
                let report = CrcReport::decode(&exchange.response.payload)?;
                check_report(&report, link.client_id(), session)?;
                if u64::from(report.content_size) != bytes_sent {
                    // Resent packets can be double-counted by the server.
                    warn!(
                        server = report.content_size,
                        local = bytes_sent,
                        "server content size differs from what was sent"
                    );
                }
                info!(
                    packets = sent,
                    bytes = bytes_sent,
                    avg_bps = meter.average_bps(),
                    elapsed_ms = meter.elapsed().as_millis() as u64,
                    "file sent"
                );
                return Ok(TransferOutcome {
                    report,
                    packets: sent,
                    bytes_sent,
                    packet_retries: self.file_retries.count(),
                    recovered,
                });
            }
        }
    }
}

fn check_report(report: &CrcReport, client_id: ClientId, session: &TransferSession) -> Result<()> {
    if report.file_name != session.file_name {
        return Err(ProtocolError::BadPayload(format!(
            "FILE_CRC names {:?}, sent {:?}",
            report.file_name, session.file_name
        ))
        .into());
    }
    if report.client_id != client_id {
        return Err(ProtocolError::BadPayload(format!(
            "FILE_CRC addressed to {}, we are {}",
            report.client_id, client_id
        ))
        .into());
    }
    Ok(())
}
