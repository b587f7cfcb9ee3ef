/// One backup, start to finish: connect, handshake, send, verify, report.
///
/// [`BackupSession::run`] emits exactly one terminal status event, either
/// `Operation { name: "backup", .. }` or a fatal `Error`, before it returns.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strongbox_types::events::{Phase, StatusEvent};
use strongbox_types::models::ClientId;
use tracing::{error, info};

use crate::config::TransferContext;
use crate::connection::{ConnectionSupervisor, Exchanger};
use crate::error::{Result, TransferError};
use crate::identity::IdentityStore;
use crate::integrity::{BoundedCounter, IntegrityController, RetryState, Verdict};
use crate::sender::{TransferEngine, TransferSession};

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub client_id: ClientId,
    pub file_name: String,
    pub size: u64,
    pub crc: u32,
    /// Packets of the successful attempt.
    pub packets: u32,
    pub bytes_sent: u64,
    /// Whole-file attempts, including the successful one.
    pub attempts: u32,
    pub retries: RetryState,
    pub reconnects: u32,
    pub elapsed: Duration,
}

impl BackupSummary {
    fn details(&self) -> String {
        format!(
            "{} ({} bytes, crc {}) in {} packets over {} attempt(s); {}",
            self.file_name, self.size, self.crc, self.packets, self.attempts, self.retries
        )
    }
}

pub struct BackupSession {
    ctx: TransferContext,
    store: Arc<dyn IdentityStore>,
}

impl BackupSession {
    pub fn new(ctx: TransferContext, store: Arc<dyn IdentityStore>) -> Self {
        Self { ctx, store }
    }

    /// Back up `path`. Never returns without reporting the outcome to the
    /// status sink.
    pub fn run(&self, path: &Path) -> Result<BackupSummary> {
        let result = self.execute(path);
        match &result {
            Ok(summary) => {
                info!(
                    file = %summary.file_name,
                    client_id = %summary.client_id,
                    attempts = summary.attempts,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "backup complete"
                );
                self.ctx.emit(StatusEvent::Phase(Phase::Done));
                self.ctx
                    .emit(StatusEvent::operation("backup", true, summary.details()));
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "backup failed");
                if !matches!(e, TransferError::Integrity { .. }) {
                    self.ctx.emit(StatusEvent::Phase(Phase::Aborted));
                }
                self.ctx.emit(StatusEvent::error(format!("{}: {}", e.kind(), e), true));
            }
        }
        result
    }

    fn execute(&self, path: &Path) -> Result<BackupSummary> {
        self.ctx.config.validate()?;
        std::fs::metadata(path).map_err(|e| TransferError::file(path, e))?;
        let started = Instant::now();

        let mut supervisor = ConnectionSupervisor::new(self.ctx.clone(), self.store.clone());
        supervisor.open()?;
        let mut summary = transfer_verified(&self.ctx, path, &mut supervisor)?;
        summary.retries.reconnect = supervisor.reconnect_budget();
        summary.reconnects = supervisor.reconnects();
        summary.elapsed = started.elapsed();
        supervisor.close();
        Ok(summary)
    }
}

/// Send `path` until the server's checksum matches or the CRC retry budget
/// runs out. Each attempt starts from a fresh [`TransferSession`].
pub fn transfer_verified(
    ctx: &TransferContext,
    path: &Path,
    link: &mut dyn Exchanger,
) -> Result<BackupSummary> {
    let started = Instant::now();
    let mut engine = TransferEngine::new(ctx);
    let mut integrity = IntegrityController::new(ctx);
    let mut attempts = 0;

    loop {
        integrity.begin_attempt()?;
        attempts += 1;
        let mut session = TransferSession::open(path, &ctx.config)?;
        let outcome = engine.send(&mut session, link)?;
        integrity.transfer_complete()?;

        if integrity.verify(link, session.crc, &outcome.report)? == Verdict::Accept {
            return Ok(BackupSummary {
                client_id: link.client_id(),
                file_name: session.file_name,
                size: u64::from(session.original_size),
                crc: session.crc,
                packets: outcome.packets,
                bytes_sent: outcome.bytes_sent,
                attempts,
                retries: RetryState {
                    file: engine.file_retries(),
                    crc: integrity.crc_retries(),
                    reconnect: BoundedCounter::new(ctx.config.max_reconnects),
                },
                reconnects: 0,
                elapsed: started.elapsed(),
            });
        }
        info!(attempt = attempts, "restarting file from the beginning");
    }
}
