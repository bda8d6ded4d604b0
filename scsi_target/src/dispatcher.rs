// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Maps incoming commands to tasks: one task per command, run on the
//! caller's thread, with an abort flag registered for the task's lifetime.
//!
//! Ordering between tasks (SIMPLE/ORDERED/HEAD OF QUEUE) is the queueing
//! layer's job; the task set only tracks which tags are live so they can be
//! aborted.

use crate::SimpleScsiLun;
use parking_lot::Mutex;
use scsi_core::CancelToken;
use scsi_core::Command;
use scsi_core::ScsiResult;
use scsi_core::TargetTransportPort;
use scsi_core::TaskAttribute;
use scsi_defs::ScsiOp;
use std::collections::HashMap;
use std::sync::Arc;

/// The set of live tasks for one logical unit.
pub struct TaskSet {
    lun: Arc<SimpleScsiLun>,
    tasks: Mutex<HashMap<u64, CancelToken>>,
}

impl TaskSet {
    pub fn new(lun: Arc<SimpleScsiLun>) -> Self {
        Self {
            lun,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Accepts a raw CDB, runs the command to completion and emits the
    /// response through `port`.
    ///
    /// A CDB that fails to decode produces a CHECK CONDITION response
    /// without creating a task. A transport failure while emitting the
    /// response is logged and abandoned; responding to a failed response
    /// would recurse.
    pub fn submit(
        &self,
        port: &dyn TargetTransportPort,
        cdb: &[u8],
        tag: u64,
        attribute: TaskAttribute,
    ) -> ScsiResult {
        let result = match Command::parse(cdb, tag, attribute) {
            Ok(command) => {
                let cancel = CancelToken::new();
                self.tasks.lock().insert(tag, cancel.clone());
                let result = self.lun.execute(port, &command, &cancel);
                self.tasks.lock().remove(&tag);
                result
            }
            Err(err) => {
                tracing::debug!(error = %err, tag, "rejecting undecodable cdb");
                let op = ScsiOp(cdb.first().copied().unwrap_or(0));
                self.lun.reject(op, err)
            }
        };

        if let Err(error) = port.write_response(result.scsi_status, result.sense_data.as_ref()) {
            tracing::error!(%error, tag, "failed to emit response");
        }
        result
    }

    /// Requests the task with `tag` to abort at its next phase boundary.
    /// Returns false if no such task is live.
    pub fn abort(&self, tag: u64) -> bool {
        match self.tasks.lock().get(&tag) {
            Some(cancel) => {
                cancel.abort();
                true
            }
            None => false,
        }
    }

    /// The number of tasks currently live.
    pub fn live_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}
