// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! RAM-backed block device: a linear byte store addressed at
//! `address * block_size`, used as the buffered task engine's in-memory
//! backing store and as the standard leaf device in tests.

#![forbid(unsafe_code)]

use disk_backend::BlockDevice;
use disk_backend::DiskError;
use parking_lot::RwLock;
use std::fmt;
use std::fmt::Debug;
use thiserror::Error;

/// An error creating a RAM device.
#[derive(Error, Debug)]
pub enum Error {
    /// The device size is not a multiple of the block size.
    #[error("device size {size:#x} is not a multiple of the block size {block_size}")]
    NotBlockMultiple {
        /// The device size.
        size: u64,
        /// The block size.
        block_size: u32,
    },
    /// The block size is not a power of two.
    #[error("invalid block size: {0}")]
    InvalidBlockSize(u32),
    /// The device has no blocks.
    #[error("device has no blocks")]
    EmptyDevice,
}

/// A block device backed entirely by RAM.
///
/// The store is allocated zeroed on `open` and released for good on
/// `close`. Reads and writes index the store positionally; no cursor is
/// retained between operations, so concurrent tasks never interfere
/// through this type.
pub struct RamDevice {
    name: String,
    block_size: u32,
    block_count: u64,
    store: RwLock<Store>,
}

enum Store {
    New,
    Open(Vec<u8>),
    Closed,
}

impl Debug for RamDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamDevice")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl RamDevice {
    /// Makes a new RAM device of `size` bytes in `block_size` blocks. The
    /// device starts CLOSED.
    pub fn new(name: impl Into<String>, size: u64, block_size: u32) -> Result<Self, Error> {
        if !block_size.is_power_of_two() {
            return Err(Error::InvalidBlockSize(block_size));
        }
        if size == 0 {
            return Err(Error::EmptyDevice);
        }
        if size % block_size as u64 != 0 {
            return Err(Error::NotBlockMultiple { size, block_size });
        }
        Ok(Self {
            name: name.into(),
            block_size,
            block_count: size / block_size as u64,
            store: RwLock::new(Store::New),
        })
    }

    fn range(&self, address: u64, len: usize) -> Result<(usize, usize), DiskError> {
        if len % self.block_size as usize != 0 {
            return Err(DiskError::NotUnitMultiple {
                len,
                unit: self.block_size as u64,
            });
        }
        let blocks = (len / self.block_size as usize) as u64;
        if address
            .checked_add(blocks)
            .map_or(true, |end| end > self.block_count)
        {
            return Err(DiskError::IllegalBlock {
                address,
                blocks,
                block_count: self.block_count,
            });
        }
        let offset = (address * self.block_size as u64) as usize;
        Ok((offset, offset + len))
    }
}

impl BlockDevice for RamDevice {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn open(&self) -> Result<(), DiskError> {
        let mut store = self.store.write();
        match *store {
            Store::New => {}
            Store::Open(_) => return Err(DiskError::AlreadyOpen),
            Store::Closed => return Err(DiskError::Closed),
        }
        *store = Store::Open(vec![0; (self.block_count * self.block_size as u64) as usize]);
        tracing::info!(name = %self.name, "opened ram device");
        Ok(())
    }

    fn close(&self) -> Result<(), DiskError> {
        let mut store = self.store.write();
        if !matches!(*store, Store::Open(_)) {
            return Err(DiskError::NotOpen);
        }
        *store = Store::Closed;
        tracing::info!(name = %self.name, "closed ram device");
        Ok(())
    }

    fn block_size(&self) -> Result<u32, DiskError> {
        match *self.store.read() {
            Store::Open(_) => Ok(self.block_size),
            _ => Err(DiskError::NotOpen),
        }
    }

    fn block_count(&self) -> Result<u64, DiskError> {
        match *self.store.read() {
            Store::Open(_) => Ok(self.block_count),
            _ => Err(DiskError::NotOpen),
        }
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), DiskError> {
        let store = self.store.read();
        let Store::Open(store) = &*store else {
            return Err(DiskError::NotOpen);
        };
        let (start, end) = self.range(address, data.len())?;
        tracing::trace!(name = %self.name, address, len = data.len(), "read");
        data.copy_from_slice(&store[start..end]);
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), DiskError> {
        let mut store = self.store.write();
        let Store::Open(store) = &mut *store else {
            return Err(DiskError::NotOpen);
        };
        let (start, end) = self.range(address, data.len())?;
        tracing::trace!(name = %self.name, address, len = data.len(), "write");
        store[start..end].copy_from_slice(data);
        Ok(())
    }
}
