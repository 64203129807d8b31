//! Source datasets the populator reads from.
//!
//! Regions are given as `start` and `count` per dimension, in the storage order of the dataset.
//! Read buffers hold native-endian elements of [`SourceDataset::dtype`] laid out row-major.

use itertools::izip;

use crate::indexer::advance;
use crate::kernel::BlockView;
use crate::types::Datatype;

pub mod memory;
#[cfg(feature = "netcdf")]
pub mod netcdf;

pub use memory::MemorySource;
#[cfg(feature = "netcdf")]
pub use self::netcdf::NetcdfSource;

/// Default upper size of a block delivered by [`SourceDataset::read_stream`].
pub const STREAM_BLOCK_BYTES: usize = 8 * 1024 * 1024;

/// Read-only access to an N-dimensional dataset. Implementations must tolerate concurrent
/// reads.
pub trait SourceDataset: Send + Sync {
    fn dtype(&self) -> Datatype;

    fn shape(&self) -> &[u64];

    fn dsize(&self) -> usize {
        self.dtype().dsize()
    }

    /// Read the region into `dst`, returning the number of bytes written.
    fn read_to(&self, start: &[u64], count: &[u64], dst: &mut [u8])
        -> Result<usize, anyhow::Error>;

    fn read(&self, start: &[u64], count: &[u64]) -> Result<Vec<u8>, anyhow::Error> {
        let n = region_len(self.shape(), start, count)?;
        let mut dst = vec![0u8; n as usize * self.dsize()];
        self.read_to(start, count, &mut dst)?;
        Ok(dst)
    }

    /// Largest sub-block delivered by [`SourceDataset::read_stream`].
    fn stream_block_bytes(&self) -> usize {
        STREAM_BLOCK_BYTES
    }

    /// Deliver the region to `on_block` as consecutive row-major sub-blocks.
    ///
    /// The region is split along the outermost dimension for which a single slab of the inner
    /// dimensions fits in [`SourceDataset::stream_block_bytes`]. Each block is passed with its
    /// element offset into the region.
    fn read_stream(
        &self,
        start: &[u64],
        count: &[u64],
        on_block: &mut dyn FnMut(BlockView, &[u8]) -> Result<(), anyhow::Error>,
    ) -> Result<(), anyhow::Error> {
        let total = region_len(self.shape(), start, count)? as usize;
        let dsz = self.dsize();
        let max_elements = (self.stream_block_bytes() / dsz).max(1);

        if total <= max_elements || count.is_empty() {
            let buf = self.read(start, count)?;
            return on_block(
                BlockView {
                    offset: 0,
                    len: total,
                },
                &buf,
            );
        }

        // split dimension and the number of its indices per block
        let inner = |d: usize| count[d + 1..].iter().product::<u64>() as usize;
        let split = (0..count.len())
            .find(|&d| inner(d) <= max_elements)
            .unwrap_or(count.len() - 1);
        let slab = inner(split);
        let step = (max_elements / slab).max(1) as u64;

        let outer = count[..split].iter().map(|&c| c as i64).collect::<Vec<_>>();
        let mut coords = vec![0i64; split];
        let mut buf = Vec::with_capacity(step as usize * slab * dsz);
        let mut offset = 0;

        loop {
            let mut s = 0;
            while s < count[split] {
                let n = step.min(count[split] - s);

                let mut bstart = start.to_vec();
                let mut bcount = count.to_vec();
                for (bs, bc, &c) in izip!(&mut bstart, &mut bcount, &coords) {
                    *bs += c as u64;
                    *bc = 1;
                }
                bstart[split] += s;
                bcount[split] = n;

                let len = n as usize * slab;
                buf.resize(len * dsz, 0);
                self.read_to(&bstart, &bcount, &mut buf)?;
                on_block(BlockView { offset, len }, &buf)?;

                offset += len;
                s += n;
            }

            if outer.is_empty() || advance(&mut coords, &outer) {
                break;
            }
        }

        debug_assert_eq!(offset, total);
        Ok(())
    }
}

/// Number of elements in a region, checking it against `shape`.
pub fn region_len(shape: &[u64], start: &[u64], count: &[u64]) -> Result<u64, anyhow::Error> {
    ensure!(
        start.len() == shape.len() && count.len() == shape.len(),
        "region has {} start and {} count indices for {} dimensions",
        start.len(),
        count.len(),
        shape.len()
    );

    for (d, (&s, &c, &l)) in izip!(start, count, shape).enumerate() {
        ensure!(
            s + c <= l,
            "region {}..{} out of bounds for dimension {} of length {}",
            s,
            s + c,
            d,
            l
        );
    }

    Ok(count.iter().product())
}
