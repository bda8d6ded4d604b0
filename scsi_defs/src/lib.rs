// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI wire definitions shared by the target stack: operation codes, CDB
//! layouts, status codes and sense data formats (T10 SPC-4/SBC-3 subsets).

pub mod cdb;

use bitfield_struct::bitfield;
use core::fmt::Debug;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

type U16BE = zerocopy::byteorder::U16<zerocopy::byteorder::BigEndian>;
type U32BE = zerocopy::byteorder::U32<zerocopy::byteorder::BigEndian>;
type U64BE = zerocopy::byteorder::U64<zerocopy::byteorder::BigEndian>;

/// A SCSI operation code (CDB byte 0).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiOp(pub u8);

impl ScsiOp {
    pub const TEST_UNIT_READY: Self = Self(0x00);
    pub const REQUEST_SENSE: Self = Self(0x03);
    pub const READ6: Self = Self(0x08);
    pub const WRITE6: Self = Self(0x0A);
    pub const INQUIRY: Self = Self(0x12);
    pub const MODE_SELECT: Self = Self(0x15);
    pub const MODE_SENSE: Self = Self(0x1A);
    pub const READ_CAPACITY: Self = Self(0x25);
    pub const READ10: Self = Self(0x28);
    pub const WRITE10: Self = Self(0x2A);
    pub const SYNCHRONIZE_CACHE: Self = Self(0x35);
    pub const READ16: Self = Self(0x88);
    pub const WRITE16: Self = Self(0x8A);
    pub const SERVICE_ACTION_IN16: Self = Self(0x9E);
    pub const REPORT_LUNS: Self = Self(0xA0);
    pub const READ12: Self = Self(0xA8);
    pub const WRITE12: Self = Self(0xAA);
}

impl Debug for ScsiOp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::TEST_UNIT_READY => "TEST_UNIT_READY",
            Self::REQUEST_SENSE => "REQUEST_SENSE",
            Self::READ6 => "READ6",
            Self::WRITE6 => "WRITE6",
            Self::INQUIRY => "INQUIRY",
            Self::MODE_SELECT => "MODE_SELECT",
            Self::MODE_SENSE => "MODE_SENSE",
            Self::READ_CAPACITY => "READ_CAPACITY",
            Self::READ10 => "READ10",
            Self::WRITE10 => "WRITE10",
            Self::SYNCHRONIZE_CACHE => "SYNCHRONIZE_CACHE",
            Self::READ16 => "READ16",
            Self::WRITE16 => "WRITE16",
            Self::SERVICE_ACTION_IN16 => "SERVICE_ACTION_IN16",
            Self::REPORT_LUNS => "REPORT_LUNS",
            Self::READ12 => "READ12",
            Self::WRITE12 => "WRITE12",
            _ => return write!(f, "ScsiOp({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// A SCSI status code as carried in the response.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ScsiStatus(pub u8);

impl ScsiStatus {
    pub const GOOD: Self = Self(0x00);
    pub const CHECK_CONDITION: Self = Self(0x02);
    pub const CONDITION_MET: Self = Self(0x04);
    pub const BUSY: Self = Self(0x08);
    pub const RESERVATION_CONFLICT: Self = Self(0x18);
    pub const TASK_SET_FULL: Self = Self(0x28);
    pub const TASK_ABORTED: Self = Self(0x40);
}

impl Debug for ScsiStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::GOOD => "GOOD",
            Self::CHECK_CONDITION => "CHECK_CONDITION",
            Self::CONDITION_MET => "CONDITION_MET",
            Self::BUSY => "BUSY",
            Self::RESERVATION_CONFLICT => "RESERVATION_CONFLICT",
            Self::TASK_SET_FULL => "TASK_SET_FULL",
            Self::TASK_ABORTED => "TASK_ABORTED",
            _ => return write!(f, "ScsiStatus({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// The CDB control byte (last byte of every CDB).
#[bitfield(u8)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ControlByte {
    pub link: bool,
    pub flag: bool,
    pub normal_aca: bool,
    #[bits(3)]
    pub reserved: u8,
    #[bits(2)]
    pub vendor_specific: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbFlags {
    pub relative_address: bool,
    #[bits(2)]
    pub reserved1: u8,
    pub fua: bool,
    pub disable_page_out: bool,
    #[bits(3)]
    pub protection: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb16Flags {
    #[bits(3)]
    pub reserved1: u8,
    pub fua: bool,
    pub disable_page_out: bool,
    #[bits(3)]
    pub protection: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb6ReadWrite {
    pub operation_code: ScsiOp, // 0x08, 0x0A - READ6, WRITE6
    pub logical_block: [u8; 3],
    pub transfer_blocks: u8,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb10 {
    pub operation_code: ScsiOp,
    pub flags: CdbFlags,
    pub logical_block: U32BE,
    pub reserved2: u8,
    pub transfer_blocks: U16BE,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb12 {
    pub operation_code: ScsiOp,
    pub flags: CdbFlags,
    pub logical_block: U32BE,
    pub transfer_blocks: U32BE,
    pub reserved2: u8,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb16 {
    pub operation_code: ScsiOp,
    pub flags: Cdb16Flags,
    pub logical_block: U64BE,
    pub transfer_blocks: U32BE,
    pub reserved2: u8,
    pub control: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryFlags {
    pub vpd: bool,
    pub csd: bool,
    #[bits(6)]
    pub reserved: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbInquiry {
    pub operation_code: ScsiOp, // 0x12 - INQUIRY
    pub flags: InquiryFlags,
    pub page_code: u8,
    pub allocation_length: U16BE,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbRequestSense {
    pub operation_code: ScsiOp, // 0x03 - REQUEST_SENSE
    pub desc: u8,               // bit 0: descriptor format requested
    pub reserved: [u8; 2],
    pub allocation_length: u8,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbReadCapacity {
    pub operation_code: ScsiOp, // 0x25 - READ_CAPACITY
    pub reserved1: u8,
    pub obsolete_lba: U32BE,
    pub reserved2: [u8; 3],
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbReportLuns {
    pub operation_code: ScsiOp, // 0xA0 - REPORT_LUNS
    pub reserved1: u8,
    pub select_report: u8,
    pub reserved2: [u8; 3],
    pub allocation_length: U32BE,
    pub reserved3: u8,
    pub control: u8,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ServiceActionIn16 {
    pub operation_code: ScsiOp, // 0x9E - SERVICE_ACTION_IN16
    pub service_action: u8,
    pub logical_block: [u8; 8],
    pub allocation_length: U32BE,
    pub flags: u8,
    pub control: u8,
}

pub const SERVICE_ACTION_READ_CAPACITY16: u8 = 0x10;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReadCapacityData {
    pub logical_block_address: U32BE,
    pub bytes_per_block: U32BE,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReadCapacityDataEx {
    pub logical_block_address: U64BE,
    pub bytes_per_block: U32BE,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReadCapacity16Data {
    pub ex: ReadCapacityDataEx,
    pub exponents: u8,
    pub lowest_aligned_block_msb: u8,
    pub lowest_aligned_block_lsb: u8,
    pub reserved: [u8; 17],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LunListHeader {
    pub length: U32BE,
    pub reserved: [u8; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct LunListEntry(pub [u8; 8]);

pub const INQUIRY_DATA_BUFFER_SIZE: u8 = 36;

pub const T10_VERSION_SPC3: u8 = 0x05;
pub const T10_RESPONSE_DATA_SPC3: u8 = 0x02;

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryDataHeader {
    /*
    UCHAR DeviceType : 5;
    UCHAR DeviceTypeQualifier : 3;
    */
    pub device_type: u8,
    pub flags2: InquiryDataFlag2,
    pub versions: u8,
    pub flags3: InquiryDataFlag3,
    pub additional_length: u8,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryDataFlag2 {
    #[bits(7)]
    pub device_type_modifier: u8,
    pub removable_media: bool,
}

#[bitfield(u8)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryDataFlag3 {
    #[bits(4)]
    pub response_data_format: u8,
    pub hi_support: bool,
    pub norm_aca: bool,
    pub reserved_bit: bool,
    pub aerc: bool,
}

/// Standard 36-byte INQUIRY data.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryData {
    pub header: InquiryDataHeader,
    pub reserved: [u8; 2],
    pub misc: u8,
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision_level: [u8; 4],
}

/// A sense key (fixed-format sense data byte 2, low nibble).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseKey(pub u8);

impl SenseKey {
    pub const NO_SENSE: Self = Self(0x00);
    pub const RECOVERED_ERROR: Self = Self(0x01);
    pub const NOT_READY: Self = Self(0x02);
    pub const MEDIUM_ERROR: Self = Self(0x03);
    pub const HARDWARE_ERROR: Self = Self(0x04);
    pub const ILLEGAL_REQUEST: Self = Self(0x05);
    pub const UNIT_ATTENTION: Self = Self(0x06);
    pub const DATA_PROTECT: Self = Self(0x07);
    pub const ABORTED_COMMAND: Self = Self(0x0B);
}

impl Debug for SenseKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::NO_SENSE => "NO_SENSE",
            Self::RECOVERED_ERROR => "RECOVERED_ERROR",
            Self::NOT_READY => "NOT_READY",
            Self::MEDIUM_ERROR => "MEDIUM_ERROR",
            Self::HARDWARE_ERROR => "HARDWARE_ERROR",
            Self::ILLEGAL_REQUEST => "ILLEGAL_REQUEST",
            Self::UNIT_ATTENTION => "UNIT_ATTENTION",
            Self::DATA_PROTECT => "DATA_PROTECT",
            Self::ABORTED_COMMAND => "ABORTED_COMMAND",
            _ => return write!(f, "SenseKey({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// An additional sense code (ASC).
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AdditionalSenseCode(pub u8);

impl AdditionalSenseCode {
    pub const NO_SENSE: Self = Self(0x00);
    pub const LUN_NOT_READY: Self = Self(0x04);
    pub const WRITE_ERROR: Self = Self(0x0C);
    pub const UNRECOVERED_ERROR: Self = Self(0x11);
    pub const ILLEGAL_COMMAND: Self = Self(0x20);
    pub const ILLEGAL_BLOCK: Self = Self(0x21);
    pub const INVALID_CDB: Self = Self(0x24);
    pub const INVALID_LUN: Self = Self(0x25);
    pub const WRITE_PROTECT: Self = Self(0x27);
    pub const INTERNAL_TARGET_FAILURE: Self = Self(0x44);
}

impl Debug for AdditionalSenseCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Self::NO_SENSE => "NO_SENSE",
            Self::LUN_NOT_READY => "LUN_NOT_READY",
            Self::WRITE_ERROR => "WRITE_ERROR",
            Self::UNRECOVERED_ERROR => "UNRECOVERED_ERROR",
            Self::ILLEGAL_COMMAND => "ILLEGAL_COMMAND",
            Self::ILLEGAL_BLOCK => "ILLEGAL_BLOCK",
            Self::INVALID_CDB => "INVALID_CDB",
            Self::INVALID_LUN => "INVALID_LUN",
            Self::WRITE_PROTECT => "WRITE_PROTECT",
            Self::INTERNAL_TARGET_FAILURE => "INTERNAL_TARGET_FAILURE",
            _ => return write!(f, "AdditionalSenseCode({:#04x})", self.0),
        };
        f.write_str(name)
    }
}

/// Sense data response codes (fixed-format byte 0, descriptor-format byte 0).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseDataErrorCode(pub u8);

impl SenseDataErrorCode {
    pub const FIXED_CURRENT: Self = Self(0x70);
    pub const FIXED_DEFERRED: Self = Self(0x71);
    pub const DESCRIPTOR_CURRENT: Self = Self(0x72);
    pub const DESCRIPTOR_DEFERRED: Self = Self(0x73);
}

/// VALID bit of the fixed-format response code byte (information field set).
pub const SENSE_DATA_VALID: u8 = 0x80;

const SKS_VALID: u8 = 0x80;
const SKS_CDB: u8 = 0x40;
const SKS_BIT_POINTER_VALID: u8 = 0x08;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseDataHeader {
    /*
    UCHAR ErrorCode:7;
    UCHAR Valid:1;
     */
    pub error_code: SenseDataErrorCode,
    pub segment_number: u8,
    /*
    UCHAR SenseKey:4;
    UCHAR Reserved:1;
    UCHAR IncorrectLength:1;
    UCHAR EndOfMedia:1;
    UCHAR FileMark:1;
     */
    pub sense_key: SenseKey,
    pub information: [u8; 4],
    pub additional_sense_length: u8,
}

/// Fixed-format sense data, 18 bytes (SPC-4 §4.5.3).
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseData {
    pub header: SenseDataHeader,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: AdditionalSenseCode,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    pub const fn new(
        sense_key: SenseKey,
        additional_sense_code: AdditionalSenseCode,
        additional_sense_code_qualifier: u8,
    ) -> Self {
        SenseData {
            header: SenseDataHeader {
                error_code: SenseDataErrorCode::FIXED_CURRENT,
                segment_number: 0,
                sense_key,
                information: [0; 4],
                additional_sense_length: (size_of::<SenseData>() - size_of::<SenseDataHeader>())
                    as u8,
            },
            command_specific_information: [0; 4],
            additional_sense_code,
            additional_sense_code_qualifier,
            field_replaceable_unit_code: 0,
            sense_key_specific: [0; 3],
        }
    }

    /// Sets the information field and the VALID bit.
    pub fn with_information(mut self, information: u32) -> Self {
        self.header.information = information.to_be_bytes();
        self.header.error_code = SenseDataErrorCode(self.header.error_code.0 | SENSE_DATA_VALID);
        self
    }

    /// Sets the sense-key-specific bytes to a CDB field pointer, optionally
    /// down to the bit.
    pub fn with_field_pointer(mut self, byte: u16, bit: Option<u8>) -> Self {
        let mut flags = SKS_VALID | SKS_CDB;
        if let Some(bit) = bit {
            flags |= SKS_BIT_POINTER_VALID | (bit & 0x07);
        }
        let pointer = byte.to_be_bytes();
        self.sense_key_specific = [flags, pointer[0], pointer[1]];
        self
    }

    /// Returns the descriptor-format rendering of this sense data (SPC-4
    /// §4.5.2, header only; no descriptors follow).
    pub fn descriptor_header(&self) -> DescriptorSenseHeader {
        let error_code = if (self.header.error_code.0 & !SENSE_DATA_VALID)
            == SenseDataErrorCode::FIXED_DEFERRED.0
        {
            SenseDataErrorCode::DESCRIPTOR_DEFERRED
        } else {
            SenseDataErrorCode::DESCRIPTOR_CURRENT
        };
        DescriptorSenseHeader {
            error_code,
            sense_key: SenseKey(self.header.sense_key.0 & 0x0F),
            additional_sense_code: self.additional_sense_code,
            additional_sense_code_qualifier: self.additional_sense_code_qualifier,
            reserved: [0; 3],
            additional_sense_length: 0,
        }
    }
}

/// Descriptor-format sense data header, 8 bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct DescriptorSenseHeader {
    pub error_code: SenseDataErrorCode,
    pub sense_key: SenseKey,
    pub additional_sense_code: AdditionalSenseCode,
    pub additional_sense_code_qualifier: u8,
    pub reserved: [u8; 3],
    pub additional_sense_length: u8,
}
