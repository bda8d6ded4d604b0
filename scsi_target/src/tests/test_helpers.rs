// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Task engine test helpers.

use crate::LunParameters;
use crate::SimpleScsiLun;
use crate::TemplateInquiryRegistry;
use disk_backend::BlockDevice;
use disk_backend::DiskError;
use disk_ram::RamDevice;
use parking_lot::Mutex;
use scsi_core::PortError;
use scsi_core::TargetTransportPort;
use scsi_defs as scsi;
use scsi_defs::ScsiOp;
use scsi_defs::ScsiStatus;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use zerocopy::IntoBytes;

/// A transport port fake: data-out pulls are served from a supplied buffer,
/// data-in pushes and responses are captured for assertions.
#[derive(Default)]
pub struct FakeTransportPort {
    pull: Mutex<Option<Vec<u8>>>,
    fail_pull: AtomicBool,
    fail_push: AtomicBool,
    pub pushed: Mutex<Vec<Vec<u8>>>,
    pub responses: Mutex<Vec<(ScsiStatus, Option<scsi::SenseData>)>>,
}

impl FakeTransportPort {
    pub fn new() -> Self {
        Default::default()
    }

    /// Queues the bytes the initiator will supply on the next data-out
    /// phase.
    pub fn supply(&self, data: Vec<u8>) {
        *self.pull.lock() = Some(data);
    }

    /// Makes the next data-out pull fail short.
    pub fn fail_next_pull(&self) {
        self.fail_pull.store(true, Ordering::Relaxed);
    }

    /// Makes the next data-in push fail.
    pub fn fail_next_push(&self) {
        self.fail_push.store(true, Ordering::Relaxed);
    }

    /// True while supplied data-out bytes have not been pulled.
    pub fn pull_pending(&self) -> bool {
        self.pull.lock().is_some()
    }

    pub fn last_push(&self) -> Vec<u8> {
        self.pushed.lock().last().cloned().expect("no data pushed")
    }

    pub fn last_response(&self) -> (ScsiStatus, Option<scsi::SenseData>) {
        *self.responses.lock().last().expect("no response emitted")
    }
}

impl TargetTransportPort for FakeTransportPort {
    fn read_data(&self, sink: &mut [u8]) -> Result<(), PortError> {
        if self.fail_pull.swap(false, Ordering::Relaxed) {
            return Err(PortError::ShortTransfer {
                expected: sink.len(),
                transferred: 0,
            });
        }
        let data = self.pull.lock().take().ok_or(PortError::Disconnected)?;
        if data.len() < sink.len() {
            return Err(PortError::ShortTransfer {
                expected: sink.len(),
                transferred: data.len(),
            });
        }
        sink.copy_from_slice(&data[..sink.len()]);
        Ok(())
    }

    fn write_data(&self, source: &[u8]) -> Result<(), PortError> {
        if self.fail_push.swap(false, Ordering::Relaxed) {
            return Err(PortError::Io(io::Error::other("push failed")));
        }
        self.pushed.lock().push(source.to_vec());
        Ok(())
    }

    fn write_response(
        &self,
        status: ScsiStatus,
        sense: Option<&scsi::SenseData>,
    ) -> Result<(), PortError> {
        self.responses.lock().push((status, sense.copied()));
        Ok(())
    }
}

/// A leaf whose I/O fails once opened, for driving the composite error
/// surface.
pub struct FailingLeaf {
    inner: RamDevice,
}

impl FailingLeaf {
    pub fn new(size: u64, block_size: u32) -> Self {
        Self {
            inner: RamDevice::new("failing", size, block_size).unwrap(),
        }
    }
}

impl BlockDevice for FailingLeaf {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn open(&self) -> Result<(), DiskError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), DiskError> {
        self.inner.close()
    }

    fn block_size(&self) -> Result<u32, DiskError> {
        self.inner.block_size()
    }

    fn block_count(&self) -> Result<u64, DiskError> {
        self.inner.block_count()
    }

    fn read(&self, _address: u64, _data: &mut [u8]) -> Result<(), DiskError> {
        Err(DiskError::Io(io::Error::other("unrecovered read error")))
    }

    fn write(&self, _address: u64, _data: &[u8]) -> Result<(), DiskError> {
        Err(DiskError::Io(io::Error::other("write fault")))
    }
}

/// A logical unit over an opened RAM store.
pub fn new_lun(size: u64, block_size: u32) -> (Arc<SimpleScsiLun>, Arc<RamDevice>) {
    let device = Arc::new(RamDevice::new("store", size, block_size).unwrap());
    device.open().unwrap();
    let lun = Arc::new(SimpleScsiLun::new(
        device.clone(),
        Arc::new(TemplateInquiryRegistry),
        LunParameters::default(),
    ));
    (lun, device)
}

pub fn make_cdb6(op: ScsiOp, lba: u32, blocks: u8) -> Vec<u8> {
    vec![
        op.0,
        ((lba >> 16) & 0x1F) as u8,
        (lba >> 8) as u8,
        lba as u8,
        blocks,
        0,
    ]
}

pub fn make_cdb10(op: ScsiOp, lba: u32, blocks: u16) -> Vec<u8> {
    let cdb = scsi::Cdb10 {
        operation_code: op,
        flags: scsi::CdbFlags::new(),
        logical_block: lba.into(),
        reserved2: 0,
        transfer_blocks: blocks.into(),
        control: 0,
    };
    cdb.as_bytes().to_vec()
}

pub fn make_cdb16(op: ScsiOp, lba: u64, blocks: u32) -> Vec<u8> {
    let cdb = scsi::Cdb16 {
        operation_code: op,
        flags: scsi::Cdb16Flags::new(),
        logical_block: lba.into(),
        transfer_blocks: blocks.into(),
        reserved2: 0,
        control: 0,
    };
    cdb.as_bytes().to_vec()
}

/// Fills `count` units of `unit` bytes with one random pattern repeated.
pub fn make_repeat_data_buffer(count: usize, unit: usize) -> Vec<u8> {
    let mut pattern = vec![0u8; unit];
    getrandom::getrandom(&mut pattern).unwrap();
    let mut buf = Vec::with_capacity(count * unit);
    for _ in 0..count {
        buf.extend_from_slice(&pattern);
    }
    buf
}

pub fn check_sense(
    sense: &scsi::SenseData,
    sense_key: scsi::SenseKey,
    additional_sense_code: scsi::AdditionalSenseCode,
) {
    assert_eq!(scsi::SenseKey(sense.header.sense_key.0 & 0x0F), sense_key);
    assert_eq!(sense.additional_sense_code, additional_sense_code);
}
