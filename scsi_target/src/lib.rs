// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The buffered SCSI task engine: executes accepted commands against a
//! backing [`BlockDevice`], moving bulk data through the target transport
//! port and rendering every failure as a response with sense data. The
//! [`dispatcher`] module maps incoming commands to tasks and manages their
//! lifetime.

#![forbid(unsafe_code)]

pub mod dispatcher;
mod inquiry;

#[cfg(test)]
mod tests;

pub use inquiry::InquiryDataRegistry;
pub use inquiry::TemplateInquiryRegistry;
pub use inquiry::INQUIRY_DATA_TEMPLATE;

use disk_backend::BlockDevice;
use disk_backend::DiskError;
use parking_lot::Mutex;
use scsi::cdb::Cdb;
use scsi::cdb::CdbError;
use scsi::cdb::TransferCdb;
use scsi::cdb::TransferForm;
use scsi::cdb::TransferParams;
use scsi::AdditionalSenseCode;
use scsi::ScsiOp;
use scsi::ScsiStatus;
use scsi::SenseKey;
use scsi_core::CancelToken;
use scsi_core::Command;
use scsi_core::PortError;
use scsi_core::ScsiResult;
use scsi_core::TargetTransportPort;
use scsi_defs as scsi;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Tunable parameters of a logical unit.
#[derive(Debug, Clone)]
pub struct LunParameters {
    /// Upper bound on a single data transfer, in bytes.
    pub maximum_transfer_length: usize,
}

impl Default for LunParameters {
    fn default() -> Self {
        Self {
            maximum_transfer_length: 8 * 1024 * 1024,
        }
    }
}

/// The direction bulk data moves for a transfer command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataDirection {
    /// Data-in: target to initiator (READ).
    DataIn,
    /// Data-out: initiator to target (WRITE).
    DataOut,
}

/// A task failure, carrying everything the sense encoder needs.
#[derive(Debug, Error)]
pub enum ScsiError {
    #[error("logical block address out of range: lba {lba}, {blocks} blocks, capacity {capacity}")]
    LbaOutOfRange {
        form: TransferForm,
        lba: u64,
        blocks: u64,
        capacity: u64,
    },
    #[error("invalid field in cdb at byte {byte}")]
    InvalidFieldInCdb { byte: u16, bit: Option<u8> },
    #[error("unsupported operation code {0:?}")]
    UnsupportedOpcode(ScsiOp),
    #[error("transfer of {blocks} blocks exceeds the maximum of {maximum} bytes")]
    TransferTooLarge { blocks: u64, maximum: usize },
    #[error("synchronous data transfer error ({direction:?})")]
    DataTransfer {
        direction: DataDirection,
        #[source]
        source: PortError,
    },
    #[error("task aborted")]
    TaskAborted,
    #[error("device not ready")]
    NotReady,
    #[error("internal target failure in leaf device {index}")]
    InternalTargetFailure {
        index: usize,
        #[source]
        source: DiskError,
    },
    #[error("disk i/o error")]
    Disk(#[source] DiskError),
}

impl From<DiskError> for ScsiError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::NotOpen => ScsiError::NotReady,
            DiskError::Leaf { index, source } => ScsiError::InternalTargetFailure {
                index,
                source: *source,
            },
            err => ScsiError::Disk(err),
        }
    }
}

impl From<CdbError> for ScsiError {
    fn from(err: CdbError) -> Self {
        match err {
            CdbError::Empty | CdbError::Truncated { .. } => {
                ScsiError::InvalidFieldInCdb { byte: 0, bit: None }
            }
            CdbError::UnsupportedOpcode(op) => ScsiError::UnsupportedOpcode(op),
            CdbError::UnsupportedServiceAction(_) => {
                ScsiError::InvalidFieldInCdb { byte: 1, bit: None }
            }
            CdbError::InvalidField { byte, bit } => ScsiError::InvalidFieldInCdb { byte, bit },
        }
    }
}

/// A logical unit executing buffered READ/WRITE tasks against one backing
/// block device.
///
/// One instance serves many concurrent tasks; each task allocates a private
/// staging buffer for its data phase, so no cursor is shared through the
/// backing store.
pub struct SimpleScsiLun {
    device: Arc<dyn BlockDevice>,
    inquiry: Arc<dyn InquiryDataRegistry>,
    params: LunParameters,
    sense_data: SenseDataSlot,
}

impl SimpleScsiLun {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        inquiry: Arc<dyn InquiryDataRegistry>,
        params: LunParameters,
    ) -> Self {
        Self {
            device,
            inquiry,
            params,
            sense_data: Default::default(),
        }
    }

    /// Executes one accepted command, returning its completion record. The
    /// caller (normally the dispatcher) emits the response.
    pub fn execute(
        &self,
        port: &dyn TargetTransportPort,
        command: &Command,
        cancel: &CancelToken,
    ) -> ScsiResult {
        let op = command.cdb.operation_code();
        let result = self.run(port, command, cancel);
        self.process_result(result, op)
    }

    fn run(
        &self,
        port: &dyn TargetTransportPort,
        command: &Command,
        cancel: &CancelToken,
    ) -> Result<usize, ScsiError> {
        if cancel.is_aborted() {
            return Err(ScsiError::TaskAborted);
        }
        match command.cdb {
            Cdb::TestUnitReady { .. } => {
                self.capacity()?;
                Ok(0)
            }
            Cdb::RequestSense {
                descriptor_format,
                allocation_length,
                ..
            } => self.handle_request_sense(port, descriptor_format, allocation_length),
            Cdb::Inquiry {
                vpd,
                page_code,
                allocation_length,
                ..
            } => self.handle_inquiry(port, vpd, page_code, allocation_length),
            Cdb::ReadCapacity { .. } => self.handle_read_capacity(port),
            Cdb::ReadCapacity16 {
                allocation_length, ..
            } => self.handle_read_capacity16(port, allocation_length),
            Cdb::ReportLuns {
                allocation_length, ..
            } => self.handle_report_luns(port, allocation_length),
            Cdb::Read(ref transfer) => self.handle_read(port, transfer, cancel),
            Cdb::Write(ref transfer) => self.handle_write(port, transfer, cancel),
        }
    }

    fn capacity(&self) -> Result<u64, ScsiError> {
        Ok(self.device.block_count()?)
    }

    /// Range-checks a transfer CDB against the device capacity, returning
    /// the starting block and the transfer size in bytes.
    ///
    /// A zero-length transfer is legal and produces no data phase. Until
    /// the check passes, no byte moves in either direction.
    fn validate_transfer(&self, transfer: &TransferParams) -> Result<(u64, usize), ScsiError> {
        let capacity = self.capacity()?;
        let lba = transfer.logical_block_address();
        let blocks = transfer.transfer_length();
        if lba > capacity
            || lba
                .checked_add(blocks)
                .map_or(true, |end| end > capacity)
        {
            return Err(ScsiError::LbaOutOfRange {
                form: transfer.form,
                lba,
                blocks,
                capacity,
            });
        }
        if blocks == 0 {
            return Ok((lba, 0));
        }
        let block_size = self.device.block_size()? as u64;
        let tx = blocks
            .checked_mul(block_size)
            .filter(|&tx| tx <= self.params.maximum_transfer_length as u64)
            .ok_or(ScsiError::TransferTooLarge {
                blocks,
                maximum: self.params.maximum_transfer_length,
            })?;
        Ok((lba, tx as usize))
    }

    fn handle_read(
        &self,
        port: &dyn TargetTransportPort,
        transfer: &TransferParams,
        cancel: &CancelToken,
    ) -> Result<usize, ScsiError> {
        let (lba, tx) = self.validate_transfer(transfer)?;
        if tx == 0 {
            return Ok(0);
        }
        if cancel.is_aborted() {
            return Err(ScsiError::TaskAborted);
        }
        let mut staging = vec![0; tx];
        self.device.read(lba, &mut staging)?;
        port.write_data(&staging).map_err(|source| ScsiError::DataTransfer {
            direction: DataDirection::DataIn,
            source,
        })?;
        if cancel.is_aborted() {
            return Err(ScsiError::TaskAborted);
        }
        Ok(tx)
    }

    fn handle_write(
        &self,
        port: &dyn TargetTransportPort,
        transfer: &TransferParams,
        cancel: &CancelToken,
    ) -> Result<usize, ScsiError> {
        let (lba, tx) = self.validate_transfer(transfer)?;
        if tx == 0 {
            return Ok(0);
        }
        if cancel.is_aborted() {
            return Err(ScsiError::TaskAborted);
        }
        // Pull into a private staging buffer first; the store is only
        // touched once the whole transfer arrived.
        let mut staging = vec![0; tx];
        port.read_data(&mut staging)
            .map_err(|source| ScsiError::DataTransfer {
                direction: DataDirection::DataOut,
                source,
            })?;
        self.device.write(lba, &staging)?;
        if cancel.is_aborted() {
            return Err(ScsiError::TaskAborted);
        }
        Ok(tx)
    }

    fn handle_request_sense(
        &self,
        port: &dyn TargetTransportPort,
        descriptor_format: bool,
        allocation_length: u8,
    ) -> Result<usize, ScsiError> {
        let sense = self.sense_data.take().unwrap_or_else(|| {
            scsi::SenseData::new(SenseKey::NO_SENSE, AdditionalSenseCode::NO_SENSE, 0x00)
        });

        let descriptor;
        let data: &[u8] = if descriptor_format {
            descriptor = sense.descriptor_header();
            descriptor.as_bytes()
        } else {
            sense.as_bytes()
        };

        let tx = std::cmp::min(allocation_length as usize, data.len());
        if tx == 0 {
            return Ok(0);
        }
        port.write_data(&data[..tx]).map_err(|source| ScsiError::DataTransfer {
            direction: DataDirection::DataIn,
            source,
        })?;
        Ok(tx)
    }

    fn handle_inquiry(
        &self,
        port: &dyn TargetTransportPort,
        vpd: bool,
        page_code: u8,
        allocation_length: u16,
    ) -> Result<usize, ScsiError> {
        // Vital product data pages live in the (external) inquiry registry;
        // this unit serves the standard data only.
        if vpd {
            return Err(ScsiError::InvalidFieldInCdb {
                byte: 1,
                bit: Some(0),
            });
        }
        if page_code != 0 {
            return Err(ScsiError::InvalidFieldInCdb { byte: 2, bit: None });
        }
        let data = self.inquiry.inquiry_data();
        let tx = std::cmp::min(allocation_length as usize, size_of::<scsi::InquiryData>());
        if tx == 0 {
            return Ok(0);
        }
        port.write_data(&data.as_bytes()[..tx])
            .map_err(|source| ScsiError::DataTransfer {
                direction: DataDirection::DataIn,
                source,
            })?;
        Ok(tx)
    }

    fn handle_read_capacity(&self, port: &dyn TargetTransportPort) -> Result<usize, ScsiError> {
        let capacity = self.capacity()?;
        // The response carries the LBA of the last block, not the count,
        // saturated to what the 32-bit structure can express.
        let last_lba = std::cmp::min(capacity.saturating_sub(1), u32::MAX.into());
        let data = scsi::ReadCapacityData {
            logical_block_address: (last_lba as u32).into(),
            bytes_per_block: self.device.block_size()?.into(),
        };
        port.write_data(data.as_bytes())
            .map_err(|source| ScsiError::DataTransfer {
                direction: DataDirection::DataIn,
                source,
            })?;
        Ok(size_of::<scsi::ReadCapacityData>())
    }

    fn handle_read_capacity16(
        &self,
        port: &dyn TargetTransportPort,
        allocation_length: u32,
    ) -> Result<usize, ScsiError> {
        let capacity = self.capacity()?;
        let data = scsi::ReadCapacity16Data {
            ex: scsi::ReadCapacityDataEx {
                logical_block_address: capacity.saturating_sub(1).into(),
                bytes_per_block: self.device.block_size()?.into(),
            },
            exponents: 0,
            lowest_aligned_block_msb: 0,
            lowest_aligned_block_lsb: 0,
            reserved: [0; 17],
        };
        let tx = std::cmp::min(allocation_length as usize, size_of::<scsi::ReadCapacity16Data>());
        if tx == 0 {
            return Ok(0);
        }
        port.write_data(&data.as_bytes()[..tx])
            .map_err(|source| ScsiError::DataTransfer {
                direction: DataDirection::DataIn,
                source,
            })?;
        Ok(tx)
    }

    fn handle_report_luns(
        &self,
        port: &dyn TargetTransportPort,
        allocation_length: u32,
    ) -> Result<usize, ScsiError> {
        // A single LUN 0.
        let header = scsi::LunListHeader {
            length: (size_of::<scsi::LunListEntry>() as u32).into(),
            reserved: [0; 4],
        };
        let mut data = [0u8; size_of::<scsi::LunListHeader>() + size_of::<scsi::LunListEntry>()];
        data[..size_of::<scsi::LunListHeader>()].copy_from_slice(header.as_bytes());

        let tx = std::cmp::min(allocation_length as usize, data.len());
        if tx == 0 {
            return Ok(0);
        }
        port.write_data(&data[..tx])
            .map_err(|source| ScsiError::DataTransfer {
                direction: DataDirection::DataIn,
                source,
            })?;
        Ok(tx)
    }

    /// Converts a decode failure into the response the initiator sees. No
    /// task exists for such a command.
    pub(crate) fn reject(&self, op: ScsiOp, err: CdbError) -> ScsiResult {
        self.process_result(Err(err.into()), op)
    }

    fn process_result(&self, result: Result<usize, ScsiError>, op: ScsiOp) -> ScsiResult {
        let result = match result {
            Ok(tx) => ScsiResult {
                scsi_status: ScsiStatus::GOOD,
                tx,
                sense_data: None,
            },
            Err(err) => {
                match err {
                    ScsiError::LbaOutOfRange { .. }
                    | ScsiError::InvalidFieldInCdb { .. }
                    | ScsiError::UnsupportedOpcode(_)
                    | ScsiError::TransferTooLarge { .. } => {
                        tracing::debug!(error = %err, ?op, "scsi error")
                    }
                    _ => tracing::warn!(error = %err, ?op, "scsi error"),
                }
                let (scsi_status, sense_data) = sense_for(&err);
                ScsiResult {
                    scsi_status,
                    tx: 0,
                    sense_data: Some(sense_data),
                }
            }
        };

        self.sense_data.set(result.sense_data.as_ref());
        tracing::trace!(?op, status = ?result.scsi_status, tx = result.tx, "command complete");
        result
    }
}

/// Renders a task failure as a status code plus fixed-format sense data.
fn sense_for(err: &ScsiError) -> (ScsiStatus, scsi::SenseData) {
    match *err {
        ScsiError::LbaOutOfRange { form, .. } => {
            // The field pointer names the LBA field of the CDB form that
            // carried the request; the 6-byte form packs it differently.
            let (byte, bit) = form.lba_field_pointer();
            (
                ScsiStatus::CHECK_CONDITION,
                scsi::SenseData::new(
                    SenseKey::ILLEGAL_REQUEST,
                    AdditionalSenseCode::ILLEGAL_BLOCK,
                    0,
                )
                .with_field_pointer(byte, bit),
            )
        }
        ScsiError::InvalidFieldInCdb { byte, bit } => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::INVALID_CDB, 0)
                .with_field_pointer(byte, bit),
        ),
        ScsiError::UnsupportedOpcode(_) => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(
                SenseKey::ILLEGAL_REQUEST,
                AdditionalSenseCode::ILLEGAL_COMMAND,
                0,
            ),
        ),
        ScsiError::TransferTooLarge { .. } => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(
                SenseKey::ILLEGAL_REQUEST,
                AdditionalSenseCode::ILLEGAL_BLOCK,
                0,
            ),
        ),
        ScsiError::DataTransfer { .. } => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(
                SenseKey::MEDIUM_ERROR,
                AdditionalSenseCode::UNRECOVERED_ERROR,
                0,
            ),
        ),
        ScsiError::TaskAborted => (
            ScsiStatus::TASK_ABORTED,
            scsi::SenseData::new(SenseKey::ABORTED_COMMAND, AdditionalSenseCode::NO_SENSE, 0),
        ),
        ScsiError::NotReady => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(SenseKey::NOT_READY, AdditionalSenseCode::LUN_NOT_READY, 0),
        ),
        ScsiError::InternalTargetFailure { index, .. } => (
            ScsiStatus::CHECK_CONDITION,
            scsi::SenseData::new(
                SenseKey::HARDWARE_ERROR,
                AdditionalSenseCode::INTERNAL_TARGET_FAILURE,
                0,
            )
            .with_information(index as u32),
        ),
        ScsiError::Disk(ref err) => match err {
            DiskError::IllegalBlock { .. } => (
                ScsiStatus::CHECK_CONDITION,
                scsi::SenseData::new(
                    SenseKey::ILLEGAL_REQUEST,
                    AdditionalSenseCode::ILLEGAL_BLOCK,
                    0,
                ),
            ),
            DiskError::NotUnitMultiple { .. } | DiskError::UnalignedAddress { .. } => (
                ScsiStatus::CHECK_CONDITION,
                scsi::SenseData::new(
                    SenseKey::ILLEGAL_REQUEST,
                    AdditionalSenseCode::INVALID_CDB,
                    0,
                ),
            ),
            DiskError::Io(_) => (
                ScsiStatus::CHECK_CONDITION,
                scsi::SenseData::new(SenseKey::MEDIUM_ERROR, AdditionalSenseCode::NO_SENSE, 0),
            ),
            DiskError::NotOpen
            | DiskError::AlreadyOpen
            | DiskError::Closed
            | DiskError::Leaf { .. } => (
                ScsiStatus::CHECK_CONDITION,
                scsi::SenseData::new(SenseKey::HARDWARE_ERROR, AdditionalSenseCode::NO_SENSE, 0),
            ),
        },
    }
}

/// Retains the most recent sense data for REQUEST SENSE (autosense).
///
/// The atomic flag tracks whether the slot is armed so the common
/// GOOD-status path stays lock-free. Concurrent tasks racing on the slot
/// leave its contents unspecified (task-set ordering is the initiator's
/// problem), which is why the clear path and the flag reads get away with
/// relaxed ordering.
#[derive(Default, Debug)]
struct SenseDataSlot {
    armed: AtomicBool,
    sense: Mutex<Option<scsi::SenseData>>,
}

impl SenseDataSlot {
    /// Replaces the held sense data, or clears the slot on `None`.
    fn set(&self, sense: Option<&scsi::SenseData>) {
        match sense {
            Some(sense) => {
                *self.sense.lock() = Some(*sense);
                self.armed.store(true, Ordering::Release);
            }
            None => {
                // Skip the store entirely when nothing is armed; most
                // commands complete GOOD and never touch the slot.
                if self.armed.load(Ordering::Relaxed) {
                    self.armed.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    /// Hands out the held sense data, disarming the slot.
    fn take(&self) -> Option<scsi::SenseData> {
        self.armed
            .swap(false, Ordering::Acquire)
            .then(|| self.sense.lock().take())
            .flatten()
    }
}
