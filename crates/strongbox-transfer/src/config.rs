use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Result, TransferError};
use crate::protocol::{FILE_PACKET_HEADER, MAX_PACKET_SIZE, NAME_SIZE};
use crate::status::StatusSink;

/// AES block size; every buffer size is a multiple of it.
pub const BLOCK: usize = 16;

/// Adaptive buffer tuning. The factors have no derivation beyond
/// "works well on residential uplinks" and are meant to be tuned.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Multiplier after `grow_after` consecutive successes.
    pub growth_factor: f64,
    /// Multiplier after any failure.
    pub shrink_factor: f64,
    pub grow_after: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_size: 1024,
            max_size: 32 * 1024,
            growth_factor: 1.5,
            shrink_factor: 0.75,
            grow_after: 3,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_size < BLOCK || self.min_size % BLOCK != 0 || self.max_size % BLOCK != 0 {
            return Err(config_err(format!(
                "buffer bounds [{}, {}] must be positive multiples of {}",
                self.min_size, self.max_size, BLOCK
            )));
        }
        if self.min_size > self.max_size {
            return Err(config_err(format!(
                "buffer min {} exceeds max {}",
                self.min_size, self.max_size
            )));
        }
        if !(self.growth_factor > 1.0 && self.growth_factor.is_finite()) {
            return Err(config_err(format!("growth factor {} must be > 1", self.growth_factor)));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(config_err(format!(
                "shrink factor {} must be in (0, 1)",
                self.shrink_factor
            )));
        }
        if self.grow_after == 0 {
            return Err(config_err("grow_after must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything a backup session can be tuned with. Produced by whatever
/// front end embeds the engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// `host:port`.
    pub server_addr: String,
    pub username: String,
    pub connect_timeout: Duration,
    /// Per send/receive timeout on the socket.
    pub io_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
    pub max_crc_retries: u32,
    /// Resends of a packet the server answered with a generic error.
    pub max_file_retries: u32,
    /// Files larger than this are memory-mapped instead of streamed.
    pub mmap_threshold: u64,
    pub buffer: BufferConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:1357".into(),
            username: String::new(),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
            max_reconnects: 3,
            max_crc_retries: 3,
            max_file_retries: 3,
            mmap_threshold: 1024 * 1024,
            buffer: BufferConfig::default(),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.username.is_empty() {
            return Err(config_err("username is empty".into()));
        }
        if self.username.len() > NAME_SIZE {
            return Err(config_err(format!(
                "username is {} bytes, limit is {}",
                self.username.len(),
                NAME_SIZE
            )));
        }
        if self.username.as_bytes().contains(&0) {
            return Err(config_err("username contains a NUL byte".into()));
        }
        if self.server_addr.is_empty() {
            return Err(config_err("server address is empty".into()));
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(config_err("timeouts must be non-zero".into()));
        }
        if self.keepalive_interval.is_zero() {
            return Err(config_err("keepalive interval must be non-zero".into()));
        }
        self.buffer.validate()?;
        let largest = FILE_PACKET_HEADER + strongbox_crypto::encrypted_len(self.buffer.max_size);
        if largest > MAX_PACKET_SIZE {
            return Err(config_err(format!(
                "buffer max {} would produce {}-byte packets (limit {})",
                self.buffer.max_size, largest, MAX_PACKET_SIZE
            )));
        }
        Ok(())
    }
}

fn config_err(msg: String) -> TransferError {
    TransferError::Config(msg)
}

/// Cooperative cancellation flag, honoured at packet boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Shared per-session context handed to every component at construction.
#[derive(Clone)]
pub struct TransferContext {
    pub config: Arc<TransferConfig>,
    pub sink: Arc<dyn StatusSink>,
    pub cancel: CancelToken,
}

impl TransferContext {
    pub fn new(config: TransferConfig, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            config: Arc::new(config),
            sink,
            cancel: CancelToken::new(),
        }
    }

    pub fn emit(&self, event: strongbox_types::events::StatusEvent) {
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TransferConfig {
        TransferConfig {
            username: "alice".into(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate() {
        valid().validate().unwrap();
    }

    #[test]
    fn empty_or_long_username_rejected() {
        let mut cfg = valid();
        cfg.username.clear();
        assert!(matches!(cfg.validate(), Err(TransferError::Config(_))));
        cfg.username = "a".repeat(256);
        assert!(matches!(cfg.validate(), Err(TransferError::Config(_))));
        cfg.username = "a".repeat(255);
        cfg.validate().unwrap();
    }

    #[test]
    fn buffer_bounds_checked() {
        let mut cfg = valid();
        cfg.buffer.min_size = 1000;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.buffer.min_size = 4096;
        cfg.buffer.max_size = 2048;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.buffer.shrink_factor = 1.2;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.buffer.max_size = 2 * 1024 * 1024;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(TransferError::Cancelled)));
    }
}
