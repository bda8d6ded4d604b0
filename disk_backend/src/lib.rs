// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Defines the [`BlockDevice`] trait, the uniform contract every backing
//! device satisfies: leaf stores (RAM, file), composed devices (striping)
//! and whatever the task engine is pointed at. Specific backends live in
//! their own crates.
//!
//! A device moves through one CLOSED → OPEN → CLOSED cycle. Geometry
//! (`block_size`, `block_count`) is undefined while CLOSED, and every
//! accessor or I/O call in that state fails with [`DiskError::NotOpen`].
//! Once closed, a device has released its resources for good and cannot be
//! reopened.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use thiserror::Error;

/// A block-device operation error.
#[derive(Debug, Error)]
pub enum DiskError {
    /// The device has not been opened.
    #[error("device has not been opened")]
    NotOpen,
    /// The device is already open.
    #[error("device is already open")]
    AlreadyOpen,
    /// The device was closed and cannot be reopened.
    #[error("device has already been closed")]
    Closed,
    /// The addressed block range is outside the device.
    #[error("block range [{address}, {address}+{blocks}) out of range, device has {block_count} blocks")]
    IllegalBlock {
        /// First logical block of the failed request.
        address: u64,
        /// Number of blocks in the failed request.
        blocks: u64,
        /// The device block count.
        block_count: u64,
    },
    /// The buffer length is not a whole number of the required unit.
    #[error("buffer length {len} is not a multiple of {unit}")]
    NotUnitMultiple {
        /// The offending buffer length in bytes.
        len: usize,
        /// The required unit in bytes (block or stripe extent).
        unit: u64,
    },
    /// The address is not aligned to the required unit.
    #[error("address {address} is not aligned to {unit} blocks")]
    UnalignedAddress {
        /// The offending logical block address.
        address: u64,
        /// The required alignment in blocks.
        unit: u64,
    },
    /// The request failed due to an unrecovered I/O error.
    #[error("io error")]
    Io(#[source] std::io::Error),
    /// A leaf of a composed device failed; the composite surfaces the first
    /// failing leaf.
    #[error("error in leaf device {index}")]
    Leaf {
        /// Index of the failing leaf within the composition.
        index: usize,
        /// The leaf's own failure.
        #[source]
        source: Box<DiskError>,
    },
}

/// Metadata and I/O operations of a block device.
///
/// Devices are shared as `Arc<dyn BlockDevice>`; all methods take `&self`
/// and implementations use interior mutability for their lifecycle state.
pub trait BlockDevice: Send + Sync {
    /// Returns a human-readable device name, usable in any state.
    fn name(&self) -> String;

    /// Transitions CLOSED → OPEN, establishing `block_size` and
    /// `block_count`. Opening an already-open device fails with
    /// [`DiskError::AlreadyOpen`]; opening one that was closed fails with
    /// [`DiskError::Closed`].
    fn open(&self) -> Result<(), DiskError>;

    /// Transitions OPEN → CLOSED, releasing resources. Closing a device
    /// that was never opened fails with [`DiskError::NotOpen`].
    fn close(&self) -> Result<(), DiskError>;

    /// Returns the logical block size in bytes, a power of two. Fails while
    /// CLOSED.
    fn block_size(&self) -> Result<u32, DiskError>;

    /// Returns the number of logical blocks. Fails while CLOSED.
    fn block_count(&self) -> Result<u64, DiskError>;

    /// Fills `data` starting at logical block `address`. `data.len()` must
    /// be a multiple of the block size.
    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), DiskError>;

    /// Writes `data` starting at logical block `address`. `data.len()` must
    /// be a multiple of the block size.
    fn write(&self, address: u64, data: &[u8]) -> Result<(), DiskError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn open(&self) -> Result<(), DiskError> {
        (**self).open()
    }

    fn close(&self) -> Result<(), DiskError> {
        (**self).close()
    }

    fn block_size(&self) -> Result<u32, DiskError> {
        (**self).block_size()
    }

    fn block_count(&self) -> Result<u64, DiskError> {
        (**self).block_count()
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), DiskError> {
        (**self).read(address, data)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), DiskError> {
        (**self).write(address, data)
    }
}
