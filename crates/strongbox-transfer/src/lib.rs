/// Strongbox backup transfer engine.
///
/// Ships one file to the backup server over the framed TCP protocol:
///
/// ```text
/// BackupSession
///   ├── ConnectionSupervisor ── Link (TCP) ── Handshake (register / reconnect)
///   ├── TransferEngine ── ChunkSource → AES-256-CBC → SEND_FILE
///   └── IntegrityController ── FILE_CRC vs local cksum → OK / retry / abort
/// ```
///
/// Progress and lifecycle events go to a [`status::StatusSink`]; the engine
/// never blocks on its consumer.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod integrity;
pub mod protocol;
pub mod sender;
pub mod session;
pub mod stats;
pub mod status;

pub use config::{BufferConfig, CancelToken, TransferConfig, TransferContext};
pub use connection::{ConnectionSupervisor, Exchanger, Link, RequestChannel};
pub use error::{ProtocolError, Result, TransferError};
pub use identity::{ClientIdentity, FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use session::{BackupSession, BackupSummary};
pub use status::{ChannelSink, NullSink, StatusSink, Tee, TracingSink};
