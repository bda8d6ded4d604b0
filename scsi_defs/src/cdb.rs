// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Typed CDB codec: decodes raw command descriptor blocks into a tagged
//! [`Cdb`] and serializes them back. Decoding is total; every malformed
//! input maps to a [`CdbError`] that the task layer renders as ILLEGAL
//! REQUEST sense data.

use crate::Cdb10;
use crate::Cdb12;
use crate::Cdb16;
use crate::Cdb16Flags;
use crate::Cdb6ReadWrite;
use crate::CdbFlags;
use crate::CdbInquiry;
use crate::CdbReadCapacity;
use crate::CdbReportLuns;
use crate::CdbRequestSense;
use crate::ControlByte;
use crate::InquiryFlags;
use crate::ScsiOp;
use crate::ServiceActionIn16;
use crate::SERVICE_ACTION_READ_CAPACITY16;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// A CDB decoding or encoding failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CdbError {
    #[error("empty cdb")]
    Empty,
    #[error("truncated cdb for {op:?}: got {len} bytes, need {expected}")]
    Truncated {
        op: ScsiOp,
        len: usize,
        expected: usize,
    },
    #[error("unsupported operation code {0:?}")]
    UnsupportedOpcode(ScsiOp),
    #[error("unsupported service action {0:#04x}")]
    UnsupportedServiceAction(u8),
    #[error("invalid field in cdb at byte {byte}")]
    InvalidField { byte: u16, bit: Option<u8> },
}

/// The wire form a transfer CDB was (or will be) carried in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferForm {
    Cdb6,
    Cdb10,
    Cdb12,
    Cdb16,
}

impl TransferForm {
    pub const fn cdb_length(&self) -> usize {
        match self {
            TransferForm::Cdb6 => 6,
            TransferForm::Cdb10 => 10,
            TransferForm::Cdb12 => 12,
            TransferForm::Cdb16 => 16,
        }
    }

    /// The CDB field pointer naming the logical block address field of this
    /// form, as `(byte, bit)`.
    ///
    /// The 6-byte form addresses the low bits of byte 1; the wider forms
    /// start the LBA at byte 2.
    pub const fn lba_field_pointer(&self) -> (u16, Option<u8>) {
        match self {
            TransferForm::Cdb6 => (1, Some(4)),
            _ => (2, None),
        }
    }
}

/// Decoded parameters common to every READ/WRITE variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferParams {
    pub op: ScsiOp,
    pub form: TransferForm,
    pub logical_block_address: u64,
    pub transfer_blocks: u64,
    pub fua: bool,
    pub control: ControlByte,
}

/// Access to the addressing fields shared by all transfer CDBs.
pub trait TransferCdb {
    fn operation_code(&self) -> ScsiOp;
    fn logical_block_address(&self) -> u64;
    /// Transfer length in blocks; zero means no data is transferred.
    fn transfer_length(&self) -> u64;
}

impl TransferCdb for TransferParams {
    fn operation_code(&self) -> ScsiOp {
        self.op
    }

    fn logical_block_address(&self) -> u64 {
        self.logical_block_address
    }

    fn transfer_length(&self) -> u64 {
        self.transfer_blocks
    }
}

/// A decoded command descriptor block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cdb {
    TestUnitReady {
        control: ControlByte,
    },
    RequestSense {
        descriptor_format: bool,
        allocation_length: u8,
        control: ControlByte,
    },
    Inquiry {
        vpd: bool,
        page_code: u8,
        allocation_length: u16,
        control: ControlByte,
    },
    ReadCapacity {
        control: ControlByte,
    },
    ReadCapacity16 {
        allocation_length: u32,
        control: ControlByte,
    },
    ReportLuns {
        select_report: u8,
        allocation_length: u32,
        control: ControlByte,
    },
    Read(TransferParams),
    Write(TransferParams),
}

fn need(bytes: &[u8], expected: usize, op: ScsiOp) -> Result<(), CdbError> {
    if bytes.len() < expected {
        return Err(CdbError::Truncated {
            op,
            len: bytes.len(),
            expected,
        });
    }
    Ok(())
}

fn check_wide_flags(flags: CdbFlags) -> Result<(), CdbError> {
    // Relative addressing is long obsolete; reject it outright.
    if flags.relative_address() {
        return Err(CdbError::InvalidField {
            byte: 1,
            bit: Some(0),
        });
    }
    Ok(())
}

impl Cdb {
    /// Decodes a raw CDB.
    pub fn decode(bytes: &[u8]) -> Result<Cdb, CdbError> {
        let op = ScsiOp(*bytes.first().ok_or(CdbError::Empty)?);
        match op {
            ScsiOp::TEST_UNIT_READY => {
                need(bytes, 6, op)?;
                Ok(Cdb::TestUnitReady {
                    control: ControlByte::from_bits(bytes[5]),
                })
            }
            ScsiOp::REQUEST_SENSE => {
                need(bytes, 6, op)?;
                let cdb = CdbRequestSense::read_from_prefix(bytes).unwrap().0;
                Ok(Cdb::RequestSense {
                    descriptor_format: cdb.desc & 0x01 != 0,
                    allocation_length: cdb.allocation_length,
                    control: ControlByte::from_bits(cdb.control),
                })
            }
            ScsiOp::INQUIRY => {
                need(bytes, 6, op)?;
                let cdb = CdbInquiry::read_from_prefix(bytes).unwrap().0;
                Ok(Cdb::Inquiry {
                    vpd: cdb.flags.vpd(),
                    page_code: cdb.page_code,
                    allocation_length: cdb.allocation_length.get(),
                    control: ControlByte::from_bits(cdb.control),
                })
            }
            ScsiOp::READ_CAPACITY => {
                need(bytes, 10, op)?;
                let cdb = CdbReadCapacity::read_from_prefix(bytes).unwrap().0;
                Ok(Cdb::ReadCapacity {
                    control: ControlByte::from_bits(cdb.control),
                })
            }
            ScsiOp::SERVICE_ACTION_IN16 => {
                need(bytes, 16, op)?;
                let cdb = ServiceActionIn16::read_from_prefix(bytes).unwrap().0;
                match cdb.service_action & 0x1F {
                    SERVICE_ACTION_READ_CAPACITY16 => Ok(Cdb::ReadCapacity16 {
                        allocation_length: cdb.allocation_length.get(),
                        control: ControlByte::from_bits(cdb.control),
                    }),
                    action => Err(CdbError::UnsupportedServiceAction(action)),
                }
            }
            ScsiOp::REPORT_LUNS => {
                need(bytes, 12, op)?;
                let cdb = CdbReportLuns::read_from_prefix(bytes).unwrap().0;
                Ok(Cdb::ReportLuns {
                    select_report: cdb.select_report,
                    allocation_length: cdb.allocation_length.get(),
                    control: ControlByte::from_bits(cdb.control),
                })
            }
            ScsiOp::READ6 | ScsiOp::WRITE6 => {
                need(bytes, 6, op)?;
                let cdb = Cdb6ReadWrite::read_from_prefix(bytes).unwrap().0;
                if cdb.logical_block[0] & 0xE0 != 0 {
                    return Err(CdbError::InvalidField {
                        byte: 1,
                        bit: Some(5),
                    });
                }
                let logical_block_address = u32::from_be_bytes([
                    0,
                    cdb.logical_block[0] & 0x1F,
                    cdb.logical_block[1],
                    cdb.logical_block[2],
                ]) as u64;
                // A zero transfer length means 256 blocks for the 6-byte form.
                let transfer_blocks = if cdb.transfer_blocks == 0 {
                    256
                } else {
                    cdb.transfer_blocks as u64
                };
                let params = TransferParams {
                    op,
                    form: TransferForm::Cdb6,
                    logical_block_address,
                    transfer_blocks,
                    fua: false,
                    control: ControlByte::from_bits(cdb.control),
                };
                Ok(if op == ScsiOp::READ6 {
                    Cdb::Read(params)
                } else {
                    Cdb::Write(params)
                })
            }
            ScsiOp::READ10 | ScsiOp::WRITE10 => {
                need(bytes, 10, op)?;
                let cdb = Cdb10::read_from_prefix(bytes).unwrap().0;
                check_wide_flags(cdb.flags)?;
                let params = TransferParams {
                    op,
                    form: TransferForm::Cdb10,
                    logical_block_address: cdb.logical_block.get() as u64,
                    transfer_blocks: cdb.transfer_blocks.get() as u64,
                    fua: cdb.flags.fua(),
                    control: ControlByte::from_bits(cdb.control),
                };
                Ok(if op == ScsiOp::READ10 {
                    Cdb::Read(params)
                } else {
                    Cdb::Write(params)
                })
            }
            ScsiOp::READ12 | ScsiOp::WRITE12 => {
                need(bytes, 12, op)?;
                let cdb = Cdb12::read_from_prefix(bytes).unwrap().0;
                check_wide_flags(cdb.flags)?;
                let params = TransferParams {
                    op,
                    form: TransferForm::Cdb12,
                    logical_block_address: cdb.logical_block.get() as u64,
                    transfer_blocks: cdb.transfer_blocks.get() as u64,
                    fua: cdb.flags.fua(),
                    control: ControlByte::from_bits(cdb.control),
                };
                Ok(if op == ScsiOp::READ12 {
                    Cdb::Read(params)
                } else {
                    Cdb::Write(params)
                })
            }
            ScsiOp::READ16 | ScsiOp::WRITE16 => {
                need(bytes, 16, op)?;
                let cdb = Cdb16::read_from_prefix(bytes).unwrap().0;
                let params = TransferParams {
                    op,
                    form: TransferForm::Cdb16,
                    logical_block_address: cdb.logical_block.get(),
                    transfer_blocks: cdb.transfer_blocks.get() as u64,
                    fua: cdb.flags.fua(),
                    control: ControlByte::from_bits(cdb.control),
                };
                Ok(if op == ScsiOp::READ16 {
                    Cdb::Read(params)
                } else {
                    Cdb::Write(params)
                })
            }
            op => Err(CdbError::UnsupportedOpcode(op)),
        }
    }

    /// Serializes the CDB into `out`, returning the number of bytes used.
    pub fn encode(&self, out: &mut [u8; 16]) -> Result<usize, CdbError> {
        out.fill(0);
        match *self {
            Cdb::TestUnitReady { control } => {
                out[0] = ScsiOp::TEST_UNIT_READY.0;
                out[5] = control.into_bits();
                Ok(6)
            }
            Cdb::RequestSense {
                descriptor_format,
                allocation_length,
                control,
            } => {
                let cdb = CdbRequestSense {
                    operation_code: ScsiOp::REQUEST_SENSE,
                    desc: descriptor_format as u8,
                    reserved: [0; 2],
                    allocation_length,
                    control: control.into_bits(),
                };
                out[..6].copy_from_slice(cdb.as_bytes());
                Ok(6)
            }
            Cdb::Inquiry {
                vpd,
                page_code,
                allocation_length,
                control,
            } => {
                let cdb = CdbInquiry {
                    operation_code: ScsiOp::INQUIRY,
                    flags: InquiryFlags::new().with_vpd(vpd),
                    page_code,
                    allocation_length: allocation_length.into(),
                    control: control.into_bits(),
                };
                out[..6].copy_from_slice(cdb.as_bytes());
                Ok(6)
            }
            Cdb::ReadCapacity { control } => {
                out[0] = ScsiOp::READ_CAPACITY.0;
                out[9] = control.into_bits();
                Ok(10)
            }
            Cdb::ReadCapacity16 {
                allocation_length,
                control,
            } => {
                let cdb = ServiceActionIn16 {
                    operation_code: ScsiOp::SERVICE_ACTION_IN16,
                    service_action: SERVICE_ACTION_READ_CAPACITY16,
                    logical_block: [0; 8],
                    allocation_length: allocation_length.into(),
                    flags: 0,
                    control: control.into_bits(),
                };
                out.copy_from_slice(cdb.as_bytes());
                Ok(16)
            }
            Cdb::ReportLuns {
                select_report,
                allocation_length,
                control,
            } => {
                let cdb = CdbReportLuns {
                    operation_code: ScsiOp::REPORT_LUNS,
                    reserved1: 0,
                    select_report,
                    reserved2: [0; 3],
                    allocation_length: allocation_length.into(),
                    reserved3: 0,
                    control: control.into_bits(),
                };
                out[..12].copy_from_slice(cdb.as_bytes());
                Ok(12)
            }
            Cdb::Read(ref params) | Cdb::Write(ref params) => params.encode(out),
        }
    }

    /// The operation code this CDB decodes from or encodes to.
    pub fn operation_code(&self) -> ScsiOp {
        match *self {
            Cdb::TestUnitReady { .. } => ScsiOp::TEST_UNIT_READY,
            Cdb::RequestSense { .. } => ScsiOp::REQUEST_SENSE,
            Cdb::Inquiry { .. } => ScsiOp::INQUIRY,
            Cdb::ReadCapacity { .. } => ScsiOp::READ_CAPACITY,
            Cdb::ReadCapacity16 { .. } => ScsiOp::SERVICE_ACTION_IN16,
            Cdb::ReportLuns { .. } => ScsiOp::REPORT_LUNS,
            Cdb::Read(ref params) | Cdb::Write(ref params) => params.op,
        }
    }

    /// The control byte, exposing the `linked` and `normal_aca` bits.
    pub fn control(&self) -> ControlByte {
        match *self {
            Cdb::TestUnitReady { control }
            | Cdb::RequestSense { control, .. }
            | Cdb::Inquiry { control, .. }
            | Cdb::ReadCapacity { control }
            | Cdb::ReadCapacity16 { control, .. }
            | Cdb::ReportLuns { control, .. } => control,
            Cdb::Read(ref params) | Cdb::Write(ref params) => params.control,
        }
    }
}

impl TransferParams {
    fn encode(&self, out: &mut [u8; 16]) -> Result<usize, CdbError> {
        match self.form {
            TransferForm::Cdb6 => {
                if self.logical_block_address >= 1 << 21 {
                    return Err(CdbError::InvalidField {
                        byte: 1,
                        bit: Some(4),
                    });
                }
                if self.transfer_blocks == 0 || self.transfer_blocks > 256 {
                    return Err(CdbError::InvalidField { byte: 4, bit: None });
                }
                if self.fua {
                    // The 6-byte form has no FUA bit.
                    return Err(CdbError::InvalidField {
                        byte: 1,
                        bit: Some(3),
                    });
                }
                let lba = (self.logical_block_address as u32).to_be_bytes();
                let cdb = Cdb6ReadWrite {
                    operation_code: self.op,
                    logical_block: [lba[1], lba[2], lba[3]],
                    transfer_blocks: (self.transfer_blocks & 0xFF) as u8,
                    control: self.control.into_bits(),
                };
                out[..6].copy_from_slice(cdb.as_bytes());
                Ok(6)
            }
            TransferForm::Cdb10 => {
                let logical_block = u32::try_from(self.logical_block_address)
                    .map_err(|_| CdbError::InvalidField { byte: 2, bit: None })?;
                let transfer_blocks = u16::try_from(self.transfer_blocks)
                    .map_err(|_| CdbError::InvalidField { byte: 7, bit: None })?;
                let cdb = Cdb10 {
                    operation_code: self.op,
                    flags: CdbFlags::new().with_fua(self.fua),
                    logical_block: logical_block.into(),
                    reserved2: 0,
                    transfer_blocks: transfer_blocks.into(),
                    control: self.control.into_bits(),
                };
                out[..10].copy_from_slice(cdb.as_bytes());
                Ok(10)
            }
            TransferForm::Cdb12 => {
                let logical_block = u32::try_from(self.logical_block_address)
                    .map_err(|_| CdbError::InvalidField { byte: 2, bit: None })?;
                let transfer_blocks = u32::try_from(self.transfer_blocks)
                    .map_err(|_| CdbError::InvalidField { byte: 6, bit: None })?;
                let cdb = Cdb12 {
                    operation_code: self.op,
                    flags: CdbFlags::new().with_fua(self.fua),
                    logical_block: logical_block.into(),
                    transfer_blocks: transfer_blocks.into(),
                    reserved2: 0,
                    control: self.control.into_bits(),
                };
                out[..12].copy_from_slice(cdb.as_bytes());
                Ok(12)
            }
            TransferForm::Cdb16 => {
                let transfer_blocks = u32::try_from(self.transfer_blocks)
                    .map_err(|_| CdbError::InvalidField { byte: 10, bit: None })?;
                let cdb = Cdb16 {
                    operation_code: self.op,
                    flags: Cdb16Flags::new().with_fua(self.fua),
                    logical_block: self.logical_block_address.into(),
                    transfer_blocks: transfer_blocks.into(),
                    reserved2: 0,
                    control: self.control.into_bits(),
                };
                out.copy_from_slice(cdb.as_bytes());
                Ok(16)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(bytes: &[u8]) -> Cdb {
        let cdb = Cdb::decode(bytes).unwrap();
        let mut out = [0u8; 16];
        let len = cdb.encode(&mut out).unwrap();
        assert_eq!(&out[..len], bytes, "{cdb:?}");
        assert_eq!(Cdb::decode(&out[..len]).unwrap(), cdb);
        cdb
    }

    #[test]
    fn decode_write6() {
        // WRITE6 at LBA 0x1001, one block.
        let cdb = roundtrip(&[0x0A, 0x00, 0x10, 0x01, 0x01, 0x00]);
        let Cdb::Write(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.op, ScsiOp::WRITE6);
        assert_eq!(params.form, TransferForm::Cdb6);
        assert_eq!(params.logical_block_address, 0x1001);
        assert_eq!(params.transfer_blocks, 1);
        assert!(!params.fua);
    }

    #[test]
    fn decode_read6_zero_blocks_means_256() {
        let cdb = Cdb::decode(&[0x08, 0x1F, 0xFF, 0xFF, 0x00, 0x00]).unwrap();
        let Cdb::Read(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.logical_block_address, 0x1FFFFF);
        assert_eq!(params.transfer_blocks, 256);
        // 256 encodes back as 0.
        let mut out = [0u8; 16];
        assert_eq!(cdb.encode(&mut out).unwrap(), 6);
        assert_eq!(out[4], 0);
    }

    #[test]
    fn decode_read10() {
        let mut bytes = [0u8; 10];
        bytes[0] = 0x28;
        bytes[2..6].copy_from_slice(&1020u32.to_be_bytes());
        bytes[7..9].copy_from_slice(&10u16.to_be_bytes());
        let cdb = roundtrip(&bytes);
        let Cdb::Read(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.form, TransferForm::Cdb10);
        assert_eq!(params.logical_block_address, 1020);
        assert_eq!(params.transfer_blocks, 10);
    }

    #[test]
    fn decode_write12_with_fua() {
        let mut bytes = [0u8; 12];
        bytes[0] = 0xAA;
        bytes[1] = 0x08; // FUA
        bytes[2..6].copy_from_slice(&7u32.to_be_bytes());
        bytes[6..10].copy_from_slice(&0x10000u32.to_be_bytes());
        let cdb = roundtrip(&bytes);
        let Cdb::Write(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.form, TransferForm::Cdb12);
        assert_eq!(params.transfer_blocks, 0x10000);
        assert!(params.fua);
    }

    #[test]
    fn decode_read16_full_lba() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x88;
        bytes[2..10].copy_from_slice(&0x0001_0000_0000u64.to_be_bytes());
        bytes[10..14].copy_from_slice(&2u32.to_be_bytes());
        let cdb = roundtrip(&bytes);
        let Cdb::Read(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.form, TransferForm::Cdb16);
        assert_eq!(params.logical_block_address, 0x0001_0000_0000);
        assert_eq!(params.transfer_blocks, 2);
    }

    #[test]
    fn decode_zero_length_transfer_is_legal() {
        let mut bytes = [0u8; 10];
        bytes[0] = 0x2A;
        let cdb = roundtrip(&bytes);
        let Cdb::Write(params) = cdb else {
            panic!("{cdb:?}")
        };
        assert_eq!(params.transfer_blocks, 0);
    }

    #[test]
    fn decode_control_byte_bits() {
        let cdb = roundtrip(&[0x0A, 0x00, 0x00, 0x01, 0x01, 0x05]);
        assert!(cdb.control().link());
        assert!(cdb.control().normal_aca());
    }

    #[test]
    fn decode_truncated() {
        assert_eq!(Cdb::decode(&[]), Err(CdbError::Empty));
        assert_eq!(
            Cdb::decode(&[0x28, 0, 0, 0]),
            Err(CdbError::Truncated {
                op: ScsiOp::READ10,
                len: 4,
                expected: 10,
            })
        );
    }

    #[test]
    fn decode_unsupported_opcode() {
        assert_eq!(
            Cdb::decode(&[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(CdbError::UnsupportedOpcode(ScsiOp::SYNCHRONIZE_CACHE))
        );
    }

    #[test]
    fn decode_relative_address_rejected() {
        let mut bytes = [0u8; 10];
        bytes[0] = 0x28;
        bytes[1] = 0x01;
        assert_eq!(
            Cdb::decode(&bytes),
            Err(CdbError::InvalidField {
                byte: 1,
                bit: Some(0),
            })
        );
    }

    #[test]
    fn decode_cdb6_reserved_bits_rejected() {
        assert_eq!(
            Cdb::decode(&[0x08, 0x20, 0x00, 0x00, 0x01, 0x00]),
            Err(CdbError::InvalidField {
                byte: 1,
                bit: Some(5),
            })
        );
    }

    #[test]
    fn decode_control_cdbs() {
        roundtrip(&[0x00, 0, 0, 0, 0, 0]);
        roundtrip(&[0x03, 0x01, 0, 0, 0xFC, 0]);
        roundtrip(&[0x12, 0, 0, 0, 0x24, 0]);
        let mut report_luns = [0u8; 12];
        report_luns[0] = 0xA0;
        report_luns[6..10].copy_from_slice(&256u32.to_be_bytes());
        roundtrip(&report_luns);
        let mut read_capacity16 = [0u8; 16];
        read_capacity16[0] = 0x9E;
        read_capacity16[1] = 0x10;
        read_capacity16[10..14].copy_from_slice(&32u32.to_be_bytes());
        roundtrip(&read_capacity16);
    }

    #[test]
    fn encode_cdb6_overflow() {
        let params = TransferParams {
            op: ScsiOp::READ6,
            form: TransferForm::Cdb6,
            logical_block_address: 1 << 21,
            transfer_blocks: 1,
            fua: false,
            control: ControlByte::new(),
        };
        let mut out = [0u8; 16];
        assert_eq!(
            Cdb::Read(params).encode(&mut out),
            Err(CdbError::InvalidField {
                byte: 1,
                bit: Some(4),
            })
        );
    }
}
