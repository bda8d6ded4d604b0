// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core target-side SCSI traits and types: the accepted [`Command`], the
//! transport port a task moves data through, and the result a task produces.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use scsi_defs::cdb::Cdb;
use scsi_defs::cdb::CdbError;
use scsi_defs::ScsiStatus;
use scsi_defs::SenseData;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// The SCSI task attribute carried by a command.
///
/// Ordering between tasks is enforced by the layer that queues commands into
/// the dispatcher; the task bodies themselves assume they run at the chosen
/// ordering.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TaskAttribute {
    /// No ordering constraint relative to other SIMPLE tasks.
    #[default]
    Simple,
    /// Runs after every previously accepted task completes.
    Ordered,
    /// Runs before any queued task.
    HeadOfQueue,
}

/// An accepted SCSI command: a decoded CDB paired with the initiator task
/// tag. Immutable after acceptance.
#[derive(Debug, Clone)]
pub struct Command {
    /// The decoded command descriptor block.
    pub cdb: Cdb,
    /// The initiator-side task tag.
    pub tag: u64,
    /// The task attribute the initiator requested.
    pub attribute: TaskAttribute,
}

impl Command {
    /// Accepts a raw CDB, decoding it. Decode failures are reported to the
    /// initiator as ILLEGAL REQUEST sense by the dispatcher; no command is
    /// created for them.
    pub fn parse(cdb: &[u8], tag: u64, attribute: TaskAttribute) -> Result<Self, CdbError> {
        Ok(Self {
            cdb: Cdb::decode(cdb)?,
            tag,
            attribute,
        })
    }
}

/// A transport-layer failure moving data or a response between the target
/// and the initiator.
#[derive(Debug, Error)]
pub enum PortError {
    /// The transport moved fewer bytes than negotiated.
    #[error("short transfer: moved {transferred} of {expected} bytes")]
    ShortTransfer {
        /// Bytes the task asked for.
        expected: usize,
        /// Bytes the transport actually moved.
        transferred: usize,
    },
    /// The transport connection failed.
    #[error("transport i/o error")]
    Io(#[from] std::io::Error),
    /// The initiator connection is gone.
    #[error("transport disconnected")]
    Disconnected,
}

/// The transport port a task uses to move bulk data and the final response.
///
/// Implemented by the (out of scope) iSCSI PDU layer; tasks treat each call
/// as an uninterruptible synchronous phase. Timeouts are the transport's
/// responsibility.
pub trait TargetTransportPort: Send + Sync {
    /// Pulls exactly `sink.len()` bytes from the initiator (data-out).
    fn read_data(&self, sink: &mut [u8]) -> Result<(), PortError>;

    /// Pushes `source` to the initiator (data-in).
    fn write_data(&self, source: &[u8]) -> Result<(), PortError>;

    /// Emits the final response. `sense` is present exactly when `status`
    /// reports a check condition or an abort.
    fn write_response(&self, status: ScsiStatus, sense: Option<&SenseData>)
        -> Result<(), PortError>;
}

/// The completion record of one task.
#[derive(Debug)]
pub struct ScsiResult {
    /// The SCSI status for the response.
    pub scsi_status: ScsiStatus,
    /// The number of data bytes that were transferred.
    pub tx: usize,
    /// The sense data for a failed request.
    pub sense_data: Option<SenseData>,
}

/// A per-task cancellation flag.
///
/// Aborting is asynchronous: the task observes the flag only between phases,
/// never mid-transfer, and completes as TASK ABORTED.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    aborted: Arc<AtomicBool>,
}

impl CancelToken {
    /// Returns a fresh, un-aborted token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the associated task abort at its next phase boundary.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// True once an abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed_cdb() {
        Command::parse(&[0x28, 0, 0], 1, TaskAttribute::Simple).unwrap_err();
        let command = Command::parse(
            &[0x0A, 0x00, 0x00, 0x10, 0x01, 0x00],
            7,
            TaskAttribute::Ordered,
        )
        .unwrap();
        assert_eq!(command.tag, 7);
        assert_eq!(command.attribute, TaskAttribute::Ordered);
    }

    #[test]
    fn cancel_token_flags_all_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_aborted());
        token.abort();
        assert!(clone.is_aborted());
    }
}
