// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implements the [`BlockDevice`] trait for a RAID-0 virtual device backed
//! by multiple leaf block devices.
//!
//! Data is distributed in fixed-size extents, round-robin across the
//! leaves: extent `i` of a request starting at extent index `A/F` lands on
//! leaf `(A/F + i) % N`, and each leaf sees a dense sub-sequence of the
//! address space. The device owns one worker thread per leaf; a request
//! issues at most one I/O per participating leaf and joins the workers
//! through a per-operation reply channel, so a failing leaf still reports
//! and the caller never hangs.

#![forbid(unsafe_code)]

use disk_backend::BlockDevice;
use disk_backend::DiskError;
use std::fmt;
use std::fmt::Debug;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Default size of the extents distributed between the leaves. Must be a
/// multiple of the leaf block size.
const EXTENT_SIZE_8K: u32 = 8 * 1024;

/// A RAID-0 striped block device.
pub struct StripedDevice {
    leaves: Vec<Arc<dyn BlockDevice>>,
    extent_size: u32,
    state: parking_lot::Mutex<Lifecycle>,
}

enum Lifecycle {
    New,
    Open(OpenState),
    Closed,
}

struct OpenState {
    block_size: u32,
    block_count: u64,
    blocks_per_extent: u64,
    workers: Vec<Worker>,
}

struct Worker {
    jobs: mpsc::Sender<IoJob>,
    thread: thread::JoinHandle<()>,
}

enum IoKind {
    Read { len: usize },
    Write { data: Vec<u8> },
}

struct IoJob {
    kind: IoKind,
    /// Leaf-local starting block.
    address: u64,
    slot: usize,
    reply: mpsc::Sender<IoReply>,
}

struct IoReply {
    slot: usize,
    result: Result<Vec<u8>, DiskError>,
}

/// An error creating a striped device.
#[derive(Error, Debug)]
pub enum NewDeviceError {
    #[error("can't create a striped device from an empty leaf list")]
    EmptyDeviceList,
    #[error("invalid extent size: {0}")]
    InvalidExtentSize(u32),
}

#[derive(Debug, Error)]
enum OpenError {
    #[error("all leaves must share one block size: leaf {index} has {block_size}, expected {expected}")]
    MismatchedBlockSize {
        index: usize,
        block_size: u32,
        expected: u32,
    },
    #[error("extent size {extent_size} is not a multiple of the block size {block_size}")]
    ExtentNotBlockMultiple { extent_size: u32, block_size: u32 },
}

impl From<OpenError> for DiskError {
    fn from(err: OpenError) -> Self {
        DiskError::Io(io::Error::other(err))
    }
}

impl Debug for StripedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StripedDevice")
            .field("leaves", &self.leaves.len())
            .field("extent_size", &self.extent_size)
            .finish()
    }
}

impl StripedDevice {
    /// Constructs a new `StripedDevice` over `leaves`.
    ///
    /// `extent_size` is the stripe unit in bytes and defaults to 8K. The
    /// device starts CLOSED; geometry is validated against the leaves on
    /// [`BlockDevice::open`].
    pub fn new(
        leaves: Vec<Arc<dyn BlockDevice>>,
        extent_size: Option<u32>,
    ) -> Result<Self, NewDeviceError> {
        if leaves.is_empty() {
            return Err(NewDeviceError::EmptyDeviceList);
        }
        let extent_size = extent_size.unwrap_or(EXTENT_SIZE_8K);
        if extent_size == 0 {
            return Err(NewDeviceError::InvalidExtentSize(extent_size));
        }
        Ok(StripedDevice {
            leaves,
            extent_size,
            state: parking_lot::Mutex::new(Lifecycle::New),
        })
    }

    fn close_leaves(&self, upto: usize) {
        for (index, leaf) in self.leaves.iter().enumerate().take(upto) {
            if let Err(error) = leaf.close() {
                tracing::warn!(index, %error, "failed to close leaf device");
            }
        }
    }

    /// Snapshots the open geometry and job channels without holding the
    /// state lock across the I/O.
    fn geometry(&self) -> Result<(u32, u64, u64, Vec<mpsc::Sender<IoJob>>), DiskError> {
        let state = self.state.lock();
        let Lifecycle::Open(open) = &*state else {
            return Err(DiskError::NotOpen);
        };
        Ok((
            open.block_size,
            open.block_count,
            open.blocks_per_extent,
            open.workers.iter().map(|w| w.jobs.clone()).collect(),
        ))
    }

    /// Validates a request and computes its stripe mapping.
    fn plan(
        &self,
        address: u64,
        len: usize,
        block_count: u64,
        block_size: u32,
        blocks_per_extent: u64,
    ) -> Result<StripePlan, DiskError> {
        let extent = self.extent_size as usize;
        if len % extent != 0 {
            return Err(DiskError::NotUnitMultiple {
                len,
                unit: extent as u64,
            });
        }
        if address % blocks_per_extent != 0 {
            return Err(DiskError::UnalignedAddress {
                address,
                unit: blocks_per_extent,
            });
        }
        let blocks = (len / block_size as usize) as u64;
        if address
            .checked_add(blocks)
            .map_or(true, |end| end > block_count)
        {
            return Err(DiskError::IllegalBlock {
                address,
                blocks,
                block_count,
            });
        }
        let n = self.leaves.len();
        let fragments = len / extent;
        let start_extent = address / blocks_per_extent;
        Ok(StripePlan {
            fragments,
            parts: fragments.min(n),
            start_leaf: (start_extent % n as u64) as usize,
            base: start_extent / n as u64 * blocks_per_extent,
        })
    }

    /// Sends one job per participating leaf and joins all replies. The
    /// reply channel is the join barrier: every worker reports exactly
    /// once, failures included, and the first failing leaf's error wins.
    fn fan_out<F>(
        &self,
        plan: &StripePlan,
        blocks_per_extent: u64,
        senders: &[mpsc::Sender<IoJob>],
        mut make_kind: F,
    ) -> Result<Vec<Vec<u8>>, DiskError>
    where
        F: FnMut(usize) -> IoKind,
    {
        let n = self.leaves.len();
        let extent = self.extent_size as usize;
        let (reply_tx, reply_rx) = mpsc::channel();
        for slot in 0..plan.parts {
            let leaf_index = (plan.start_leaf + slot) % n;
            let slot_extents = plan.fragments / n + usize::from(slot < plan.fragments % n);
            // A participating leaf past the wrap point starts one extent
            // round further in.
            let address = plan.base
                + if plan.start_leaf + slot >= n {
                    blocks_per_extent
                } else {
                    0
                };
            let job = IoJob {
                kind: make_kind(slot_extents * extent),
                address,
                slot,
                reply: reply_tx.clone(),
            };
            if senders[leaf_index].send(job).is_err() {
                // The worker is gone (device closing); synthesize its reply
                // so the join below still completes.
                let _ = reply_tx.send(IoReply {
                    slot,
                    result: Err(DiskError::Leaf {
                        index: leaf_index,
                        source: Box::new(DiskError::Io(io::Error::other("worker stopped"))),
                    }),
                });
            }
        }
        drop(reply_tx);

        let mut slots: Vec<Option<Vec<u8>>> = (0..plan.parts).map(|_| None).collect();
        let mut first_error = None;
        for _ in 0..plan.parts {
            match reply_rx.recv() {
                Ok(reply) => match reply.result {
                    Ok(data) => slots[reply.slot] = Some(data),
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                },
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(DiskError::Io(io::Error::other(
                            "striped worker exited during i/o",
                        )));
                    }
                    break;
                }
            }
        }
        if let Some(err) = first_error {
            tracing::error!(error = %err, "leaf i/o failed");
            return Err(err);
        }
        Ok(slots.into_iter().map(|s| s.unwrap()).collect())
    }
}

struct StripePlan {
    fragments: usize,
    parts: usize,
    start_leaf: usize,
    /// Leaf-local block address of the first extent round.
    base: u64,
}

fn run_worker(index: usize, leaf: Arc<dyn BlockDevice>, jobs: mpsc::Receiver<IoJob>) {
    while let Ok(job) = jobs.recv() {
        let result = match job.kind {
            IoKind::Read { len } => {
                let mut data = vec![0; len];
                leaf.read(job.address, &mut data).map(|()| data)
            }
            IoKind::Write { data } => leaf.write(job.address, &data).map(|()| Vec::new()),
        };
        let result = result.map_err(|err| DiskError::Leaf {
            index,
            source: Box::new(err),
        });
        // The reply must go out even on failure, or the joining request
        // would wait forever.
        let _ = job.reply.send(IoReply {
            slot: job.slot,
            result,
        });
    }
}

impl BlockDevice for StripedDevice {
    fn name(&self) -> String {
        let leaves = self
            .leaves
            .iter()
            .map(|leaf| leaf.name())
            .collect::<Vec<_>>()
            .join("+");
        format!("striped({leaves})")
    }

    fn open(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::New => {}
            Lifecycle::Open(_) => return Err(DiskError::AlreadyOpen),
            Lifecycle::Closed => return Err(DiskError::Closed),
        }

        for (index, leaf) in self.leaves.iter().enumerate() {
            if let Err(err) = leaf.open() {
                tracing::error!(index, error = %err, "failed to open leaf device");
                self.close_leaves(index);
                return Err(DiskError::Leaf {
                    index,
                    source: Box::new(err),
                });
            }
        }

        let result = (|| {
            // All leaves must agree on the block size, and an extent must
            // hold a whole number of blocks.
            let block_size = self.leaves[0].block_size()?;
            for (index, leaf) in self.leaves.iter().enumerate().skip(1) {
                let leaf_block_size = leaf.block_size()?;
                if leaf_block_size != block_size {
                    return Err(OpenError::MismatchedBlockSize {
                        index,
                        block_size: leaf_block_size,
                        expected: block_size,
                    }
                    .into());
                }
            }
            if self.extent_size % block_size != 0 {
                return Err(OpenError::ExtentNotBlockMultiple {
                    extent_size: self.extent_size,
                    block_size,
                }
                .into());
            }

            // Available space is the smallest leaf trimmed to whole
            // extents, times the leaf count.
            let blocks_per_extent = (self.extent_size / block_size) as u64;
            let mut min_blocks = u64::MAX;
            for leaf in &self.leaves {
                min_blocks = min_blocks.min(leaf.block_count()?);
            }
            let block_count =
                min_blocks / blocks_per_extent * blocks_per_extent * self.leaves.len() as u64;

            let workers = self
                .leaves
                .iter()
                .enumerate()
                .map(|(index, leaf)| {
                    let (jobs, rx) = mpsc::channel();
                    let leaf = leaf.clone();
                    let thread = thread::Builder::new()
                        .name(format!("stripe-{index}"))
                        .spawn(move || run_worker(index, leaf, rx))
                        .map_err(DiskError::Io)?;
                    Ok(Worker { jobs, thread })
                })
                .collect::<Result<Vec<_>, DiskError>>()?;

            Ok(OpenState {
                block_size,
                block_count,
                blocks_per_extent,
                workers,
            })
        })();

        match result {
            Ok(open) => {
                *state = Lifecycle::Open(open);
                tracing::info!(name = %self.name(), "opened striped device");
                Ok(())
            }
            Err(err) => {
                self.close_leaves(self.leaves.len());
                Err(err)
            }
        }
    }

    fn close(&self) -> Result<(), DiskError> {
        let mut state = self.state.lock();
        if !matches!(*state, Lifecycle::Open(_)) {
            return Err(DiskError::NotOpen);
        }
        let Lifecycle::Open(open) = std::mem::replace(&mut *state, Lifecycle::Closed) else {
            unreachable!()
        };

        // Disconnect the job channels and wait the workers out.
        for worker in open.workers {
            drop(worker.jobs);
            let _ = worker.thread.join();
        }

        // Close propagates to every leaf regardless of individual failures;
        // the first failure is reported.
        let mut result = Ok(());
        for (index, leaf) in self.leaves.iter().enumerate() {
            if let Err(err) = leaf.close() {
                tracing::warn!(index, error = %err, "failed to close leaf device");
                if result.is_ok() {
                    result = Err(DiskError::Leaf {
                        index,
                        source: Box::new(err),
                    });
                }
            }
        }
        tracing::info!(name = %self.name(), "closed striped device");
        result
    }

    fn block_size(&self) -> Result<u32, DiskError> {
        match &*self.state.lock() {
            Lifecycle::Open(open) => Ok(open.block_size),
            _ => Err(DiskError::NotOpen),
        }
    }

    fn block_count(&self) -> Result<u64, DiskError> {
        match &*self.state.lock() {
            Lifecycle::Open(open) => Ok(open.block_count),
            _ => Err(DiskError::NotOpen),
        }
    }

    fn read(&self, address: u64, data: &mut [u8]) -> Result<(), DiskError> {
        let (block_size, block_count, blocks_per_extent, senders) = self.geometry()?;
        let plan = self.plan(address, data.len(), block_count, block_size, blocks_per_extent)?;
        if plan.fragments == 0 {
            return Ok(());
        }
        tracing::trace!(address, len = data.len(), parts = plan.parts, "striped read");

        let slots = self.fan_out(&plan, blocks_per_extent, &senders, |len| IoKind::Read { len })?;

        // Merge the per-leaf results back in stripe order.
        let n = self.leaves.len();
        let extent = self.extent_size as usize;
        for fragment in 0..plan.fragments {
            let offset = fragment / n * extent;
            data[fragment * extent..(fragment + 1) * extent]
                .copy_from_slice(&slots[fragment % plan.parts][offset..offset + extent]);
        }
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), DiskError> {
        let (block_size, block_count, blocks_per_extent, senders) = self.geometry()?;
        let plan = self.plan(address, data.len(), block_count, block_size, blocks_per_extent)?;
        if plan.fragments == 0 {
            return Ok(());
        }
        tracing::trace!(address, len = data.len(), parts = plan.parts, "striped write");

        // Gather the host buffer into per-leaf staging buffers in stripe
        // order, then issue one write per participating leaf.
        let n = self.leaves.len();
        let extent = self.extent_size as usize;
        let mut staging: Vec<Vec<u8>> = (0..plan.parts).map(|_| Vec::new()).collect();
        for fragment in 0..plan.fragments {
            staging[fragment % plan.parts]
                .extend_from_slice(&data[fragment * extent..(fragment + 1) * extent]);
        }
        let mut staging = staging.into_iter();

        self.fan_out(&plan, blocks_per_extent, &senders, |len| {
            let data = staging.next().unwrap();
            debug_assert_eq!(data.len(), len);
            IoKind::Write { data }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk_ram::RamDevice;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    const EXTENT: usize = 8192;
    const BLOCK: u32 = 512;

    fn ram_leaves(count: usize, size: u64) -> Vec<Arc<dyn BlockDevice>> {
        (0..count)
            .map(|i| {
                Arc::new(RamDevice::new(format!("ram{i}"), size, BLOCK).unwrap())
                    as Arc<dyn BlockDevice>
            })
            .collect()
    }

    fn new_striped(count: usize, size: u64) -> StripedDevice {
        let device = StripedDevice::new(ram_leaves(count, size), None).unwrap();
        device.open().unwrap();
        device
    }

    /// A leaf whose I/O always fails once opened.
    struct BrokenDevice {
        inner: RamDevice,
    }

    impl BrokenDevice {
        fn new(size: u64) -> Self {
            Self {
                inner: RamDevice::new("broken", size, BLOCK).unwrap(),
            }
        }
    }

    impl BlockDevice for BrokenDevice {
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
            Err(DiskError::Io(io::Error::other("bad medium")))
        }

        fn write(&self, _address: u64, _data: &[u8]) -> Result<(), DiskError> {
            Err(DiskError::Io(io::Error::other("bad medium")))
        }
    }

    /// Counts I/O operations reaching a leaf.
    struct CountingDevice {
        inner: RamDevice,
        ios: AtomicUsize,
    }

    impl BlockDevice for CountingDevice {
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

        fn read(&self, address: u64, data: &mut [u8]) -> Result<(), DiskError> {
            self.ios.fetch_add(1, Ordering::Relaxed);
            self.inner.read(address, data)
        }

        fn write(&self, address: u64, data: &[u8]) -> Result<(), DiskError> {
            self.ios.fetch_add(1, Ordering::Relaxed);
            self.inner.write(address, data)
        }
    }

    #[test]
    fn lifecycle() {
        let device = StripedDevice::new(ram_leaves(2, 64 * 1024), None).unwrap();
        assert!(matches!(device.block_count(), Err(DiskError::NotOpen)));
        assert!(matches!(device.close(), Err(DiskError::NotOpen)));
        device.open().unwrap();
        assert!(matches!(device.open(), Err(DiskError::AlreadyOpen)));
        device.close().unwrap();
        assert!(matches!(device.close(), Err(DiskError::NotOpen)));
        // One-shot lifecycle: the worker pool is gone after close.
        assert!(matches!(device.open(), Err(DiskError::Closed)));
    }

    #[test]
    fn empty_leaf_list() {
        assert!(matches!(
            StripedDevice::new(Vec::new(), None),
            Err(NewDeviceError::EmptyDeviceList)
        ));
    }

    #[test]
    fn name_composes_leaves() {
        let device = StripedDevice::new(ram_leaves(2, 64 * 1024), None).unwrap();
        assert_eq!(device.name(), "striped(ram0+ram1)");
    }

    #[test]
    fn block_count_trims_to_whole_extents() {
        // 25 blocks per leaf; an extent holds 16 blocks, so each leaf
        // contributes 16.
        let device = new_striped(3, 25 * BLOCK as u64);
        assert_eq!(device.block_size().unwrap(), BLOCK);
        assert_eq!(device.block_count().unwrap(), 16 * 3);

        // The exposed capacity never exceeds N * the smallest leaf, and the
        // trimming loss stays under one extent per leaf.
        let exposed = device.block_count().unwrap() * BLOCK as u64;
        let smallest = 25 * BLOCK as u64;
        assert!(exposed <= 3 * smallest);
        assert!(3 * smallest - exposed < 3 * EXTENT as u64);
    }

    #[test]
    fn read_merges_stripe_order() {
        // Leaf 0 holds 'A' then 'C'; leaf 1 holds 'B' then 'D'. A 4-extent
        // read from address 0 returns A||B||C||D.
        let leaves = ram_leaves(2, 32 * 1024);
        let device = StripedDevice::new(leaves.clone(), None).unwrap();
        device.open().unwrap();

        let blocks_per_extent = (EXTENT / BLOCK as usize) as u64;
        leaves[0].write(0, &[b'A'; EXTENT]).unwrap();
        leaves[0].write(blocks_per_extent, &[b'C'; EXTENT]).unwrap();
        leaves[1].write(0, &[b'B'; EXTENT]).unwrap();
        leaves[1].write(blocks_per_extent, &[b'D'; EXTENT]).unwrap();

        let mut data = vec![0u8; 4 * EXTENT];
        device.read(0, &mut data).unwrap();
        assert_eq!(&data[..EXTENT], &[b'A'; EXTENT][..]);
        assert_eq!(&data[EXTENT..2 * EXTENT], &[b'B'; EXTENT][..]);
        assert_eq!(&data[2 * EXTENT..3 * EXTENT], &[b'C'; EXTENT][..]);
        assert_eq!(&data[3 * EXTENT..], &[b'D'; EXTENT][..]);
    }

    #[test]
    fn write_scatters_stripe_order() {
        let leaves = ram_leaves(2, 32 * 1024);
        let device = StripedDevice::new(leaves.clone(), None).unwrap();
        device.open().unwrap();

        let mut data = vec![0u8; 4 * EXTENT];
        for (i, chunk) in data.chunks_mut(EXTENT).enumerate() {
            chunk.fill(b'A' + i as u8);
        }
        device.write(0, &data).unwrap();

        let blocks_per_extent = (EXTENT / BLOCK as usize) as u64;
        let mut leaf_data = vec![0u8; EXTENT];
        leaves[0].read(0, &mut leaf_data).unwrap();
        assert_eq!(&leaf_data, &[b'A'; EXTENT][..]);
        leaves[0].read(blocks_per_extent, &mut leaf_data).unwrap();
        assert_eq!(&leaf_data, &[b'C'; EXTENT][..]);
        leaves[1].read(0, &mut leaf_data).unwrap();
        assert_eq!(&leaf_data, &[b'B'; EXTENT][..]);
        leaves[1].read(blocks_per_extent, &mut leaf_data).unwrap();
        assert_eq!(&leaf_data, &[b'D'; EXTENT][..]);
    }

    #[test]
    fn read_your_writes() {
        let device = new_striped(3, 64 * 1024);
        let data: Vec<u8> = (0..6 * EXTENT).map(|i| (i % 251) as u8).collect();
        device.write(16, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        device.read(16, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn more_fragments_than_leaves() {
        let device = new_striped(2, 128 * 1024);
        let data: Vec<u8> = (0..10 * EXTENT).map(|i| (i % 239) as u8).collect();
        device.write(0, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        device.read(0, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn request_at_wrapped_start_leaf() {
        // Start mid-stripe so the first participating leaf is not leaf 0.
        let device = new_striped(2, 128 * 1024);
        let blocks_per_extent = (EXTENT / BLOCK as usize) as u64;
        let data: Vec<u8> = (0..4 * EXTENT).map(|i| (i % 233) as u8).collect();
        device.write(blocks_per_extent, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        device.read(blocks_per_extent, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn non_extent_multiple_rejected() {
        let device = new_striped(2, 64 * 1024);
        let mut data = vec![0u8; EXTENT - 1];
        assert!(matches!(
            device.read(0, &mut data),
            Err(DiskError::NotUnitMultiple { .. })
        ));
        assert!(matches!(
            device.write(0, &data),
            Err(DiskError::NotUnitMultiple { .. })
        ));
    }

    #[test]
    fn unaligned_address_rejected() {
        let device = new_striped(2, 64 * 1024);
        let mut data = vec![0u8; EXTENT];
        assert!(matches!(
            device.read(1, &mut data),
            Err(DiskError::UnalignedAddress { .. })
        ));
    }

    #[test]
    fn out_of_range_rejected() {
        let device = new_striped(2, 64 * 1024);
        let block_count = device.block_count().unwrap();
        let mut data = vec![0u8; EXTENT];
        assert!(matches!(
            device.read(block_count, &mut data),
            Err(DiskError::IllegalBlock { .. })
        ));
    }

    #[test]
    fn zero_length_request() {
        let device = new_striped(2, 64 * 1024);
        device.write(0, &[]).unwrap();
        let mut empty = [0u8; 0];
        device.read(0, &mut empty).unwrap();
    }

    #[test]
    fn mismatched_block_sizes_fail_open() {
        let leaves: Vec<Arc<dyn BlockDevice>> = vec![
            Arc::new(RamDevice::new("a", 64 * 1024, 512).unwrap()),
            Arc::new(RamDevice::new("b", 64 * 1024, 4096).unwrap()),
        ];
        let device = StripedDevice::new(leaves.clone(), None).unwrap();
        device.open().unwrap_err();
        // No partial state: every leaf was rolled back to CLOSED.
        for leaf in &leaves {
            assert!(matches!(leaf.block_size(), Err(DiskError::NotOpen)));
        }
        assert!(matches!(device.close(), Err(DiskError::NotOpen)));
    }

    #[test]
    fn failing_leaf_reports_and_joins() {
        let leaves: Vec<Arc<dyn BlockDevice>> = vec![
            Arc::new(RamDevice::new("good", 64 * 1024, BLOCK).unwrap()),
            Arc::new(BrokenDevice::new(64 * 1024)),
        ];
        let device = StripedDevice::new(leaves, None).unwrap();
        device.open().unwrap();

        let mut data = vec![0u8; 4 * EXTENT];
        let err = device.read(0, &mut data).unwrap_err();
        let DiskError::Leaf { index, .. } = err else {
            panic!("{err:?}")
        };
        assert_eq!(index, 1);

        let err = device.write(0, &data).unwrap_err();
        assert!(matches!(err, DiskError::Leaf { index: 1, .. }));

        // The device stays usable for the leaves that work.
        device.close().unwrap();
    }

    #[test]
    fn issues_one_io_per_participating_leaf() {
        let leaves: Vec<Arc<CountingDevice>> = (0..4)
            .map(|i| {
                Arc::new(CountingDevice {
                    inner: RamDevice::new(format!("c{i}"), 128 * 1024, BLOCK).unwrap(),
                    ios: AtomicUsize::new(0),
                })
            })
            .collect();
        let device = StripedDevice::new(
            leaves
                .iter()
                .map(|l| l.clone() as Arc<dyn BlockDevice>)
                .collect(),
            None,
        )
        .unwrap();
        device.open().unwrap();

        let total = |leaves: &[Arc<CountingDevice>]| {
            leaves
                .iter()
                .map(|l| l.ios.load(Ordering::Relaxed))
                .sum::<usize>()
        };

        // Two fragments over four leaves: two I/Os.
        let mut data = vec![0u8; 2 * EXTENT];
        device.read(0, &mut data).unwrap();
        assert_eq!(total(&leaves), 2);

        // Ten fragments over four leaves: one I/O per leaf.
        let mut data = vec![0u8; 10 * EXTENT];
        device.read(0, &mut data).unwrap();
        assert_eq!(total(&leaves), 2 + 4);
    }
}
