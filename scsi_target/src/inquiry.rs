// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The inquiry data registry interface and a template standard-inquiry
//! block for a direct-access device.

use scsi_defs as scsi;

/// Supplies INQUIRY data for a logical unit.
///
/// Mode pages and vital product data pages live behind this seam too, but
/// the buffered unit only consumes the standard data block.
pub trait InquiryDataRegistry: Send + Sync {
    /// The standard 36-byte INQUIRY data for the unit.
    fn inquiry_data(&self) -> scsi::InquiryData;
}

/// Standard inquiry data for a direct-access block device, SPC-3 level.
pub const INQUIRY_DATA_TEMPLATE: scsi::InquiryData = scsi::InquiryData {
    header: scsi::InquiryDataHeader {
        device_type: 0, // direct-access block device
        flags2: scsi::InquiryDataFlag2::new(),
        versions: scsi::T10_VERSION_SPC3,
        flags3: scsi::InquiryDataFlag3::new()
            .with_response_data_format(scsi::T10_RESPONSE_DATA_SPC3),
        additional_length: scsi::INQUIRY_DATA_BUFFER_SIZE - 5,
    },
    reserved: [0; 2],
    misc: 0x02, // command queuing
    vendor_id: *b"STRIPED ",
    product_id: *b"BLOCK DEVICE    ",
    product_revision_level: *b"v1.0",
};

/// A registry handing out [`INQUIRY_DATA_TEMPLATE`] unchanged.
pub struct TemplateInquiryRegistry;

impl InquiryDataRegistry for TemplateInquiryRegistry {
    fn inquiry_data(&self) -> scsi::InquiryData {
        INQUIRY_DATA_TEMPLATE
    }
}
