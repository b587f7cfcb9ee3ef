/// End-to-end CRC verification and the whole-file retry policy.
///
/// ```text
/// Transferring ──last packet──▶ AwaitingCrc ──match──────────────▶ Done
///      ▲                            │
///      └──mismatch, retries left────┤
///                                   └──mismatch, exhausted──▶ Aborted
/// ```
///
/// `Done` and `Aborted` are terminal; every transition out of them is refused.

use std::fmt;

use strongbox_types::events::{Phase, StatusEvent};
use tracing::{info, warn};

use crate::config::TransferContext;
use crate::connection::Exchanger;
use crate::error::{ProtocolError, Result, TransferError};
use crate::protocol::{CrcReport, Request, RequestCode, ResponseCode, file_name_payload};

/// A counter that refuses to pass its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedCounter {
    count: u32,
    max: u32,
}

impl BoundedCounter {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.max
    }

    /// Take one retry if any are left.
    pub fn try_increment(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.count += 1;
        true
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

impl fmt::Display for BoundedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.count, self.max)
    }
}

/// Snapshot of the three retry budgets of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Packet resends after GENERIC_SERVER_ERROR.
    pub file: BoundedCounter,
    /// Whole-file restarts after a CRC mismatch.
    pub crc: BoundedCounter,
    /// Reconnect cycles in the most recent failure episode.
    pub reconnect: BoundedCounter,
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file retries {}, crc retries {}, reconnects {}",
            self.file, self.crc, self.reconnect
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityState {
    Transferring,
    AwaitingCrc,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Retry,
    Abort,
}

pub struct IntegrityController<'a> {
    ctx: &'a TransferContext,
    state: IntegrityState,
    crc: BoundedCounter,
    aborts: u32,
}

impl<'a> IntegrityController<'a> {
    pub fn new(ctx: &'a TransferContext) -> Self {
        Self {
            ctx,
            state: IntegrityState::Transferring,
            crc: BoundedCounter::new(ctx.config.max_crc_retries),
            aborts: 0,
        }
    }

    pub fn state(&self) -> IntegrityState {
        self.state
    }

    pub fn crc_retries(&self) -> BoundedCounter {
        self.crc
    }

    /// Times the controller entered `Aborted`. Never more than one.
    pub fn aborts(&self) -> u32 {
        self.aborts
    }

    fn refuse(&self, what: &str) -> TransferError {
        TransferError::Config(format!("cannot {} while {:?}", what, self.state))
    }

    /// Enter (or re-enter) `Transferring` for a fresh attempt.
    pub fn begin_attempt(&mut self) -> Result<()> {
        match self.state {
            IntegrityState::Transferring => Ok(()),
            _ => Err(self.refuse("start a transfer")),
        }
    }

    /// The final packet went out; wait for the server's checksum.
    pub fn transfer_complete(&mut self) -> Result<()> {
        if self.state != IntegrityState::Transferring {
            return Err(self.refuse("finish a transfer"));
        }
        self.state = IntegrityState::AwaitingCrc;
        Ok(())
    }

    /// Compare checksums and move to the next state.
    pub fn evaluate(&mut self, local: u32, remote: u32) -> Result<Verdict> {
        if self.state != IntegrityState::AwaitingCrc {
            return Err(self.refuse("evaluate a checksum"));
        }
        let verdict = if local == remote {
            self.state = IntegrityState::Done;
            Verdict::Accept
        } else if self.crc.try_increment() {
            self.state = IntegrityState::Transferring;
            Verdict::Retry
        } else {
            self.state = IntegrityState::Aborted;
            self.aborts += 1;
            Verdict::Abort
        };
        Ok(verdict)
    }

    /// Evaluate the server's report and tell the server the outcome.
    ///
    /// Returns [`Verdict::Accept`] or [`Verdict::Retry`]; an abort is
    /// reported as [`TransferError::Integrity`] after CRC_FAILED_ABORT.
    pub fn verify(&mut self, link: &mut dyn Exchanger, local: u32, report: &CrcReport) -> Result<Verdict> {
        self.ctx.emit(StatusEvent::Phase(Phase::Verifying));
        let file_name = report.file_name.as_str();
        let verdict = self.evaluate(local, report.cksum)?;
        match verdict {
            Verdict::Accept => {
                let exchange = link.exchange_with(&mut |id, _| {
                    Ok(Request::new(RequestCode::CrcOk, id, file_name_payload(file_name)?))
                })?;
                if exchange.response.code != ResponseCode::GenericAck {
                    return Err(ProtocolError::UnexpectedResponse {
                        expected: "GENERIC_ACK",
                        got: exchange.response.code as u16,
                    }
                    .into());
                }
                info!(file = file_name, crc = local, "checksum verified");
                self.ctx.emit(StatusEvent::operation("verify", true, format!("crc {}", local)));
            }
            Verdict::Retry => {
                warn!(
                    file = file_name,
                    local,
                    remote = report.cksum,
                    retry = %self.crc,
                    "checksum mismatch, restarting file"
                );
                self.ctx.emit(StatusEvent::operation(
                    "verify",
                    false,
                    format!("crc mismatch (local {}, server {}), retry {}", local, report.cksum, self.crc),
                ));
                link.send_with(&mut |id, _| {
                    Ok(Request::new(RequestCode::CrcInvalidRetry, id, file_name_payload(file_name)?))
                })?;
            }
            Verdict::Abort => {
                let attempts = self.crc.count() + 1;
                warn!(file = file_name, attempts, "checksum retries exhausted, aborting");
                self.ctx.emit(StatusEvent::Phase(Phase::Aborted));
                let ack = link.exchange_with(&mut |id, _| {
                    Ok(Request::new(RequestCode::CrcFailedAbort, id, file_name_payload(file_name)?))
                });
                match ack {
                    Ok(ex) if ex.response.code == ResponseCode::GenericAck => {}
                    Ok(ex) => warn!(code = %ex.response.code, "abort not acknowledged"),
                    Err(e) => warn!(error = %e, "abort notification failed"),
                }
                return Err(TransferError::Integrity {
                    attempts,
                    local,
                    remote: report.cksum,
                });
            }
        }
        Ok(verdict)
    }
}
