use std::sync::atomic::{AtomicUsize, Ordering};

use byte_slice_cast::AsByteSlice;
use itertools::izip;

use super::{region_len, SourceDataset, STREAM_BLOCK_BYTES};
use crate::indexer::{advance, strides};
use crate::types::{Datatype, Element};

/// A dataset held in memory as row-major native-endian bytes.
#[derive(Debug)]
pub struct MemorySource {
    dtype: Datatype,
    shape: Vec<u64>,
    data: Vec<u8>,
    block_bytes: usize,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new(dtype: Datatype, shape: &[u64], data: Vec<u8>) -> Result<MemorySource, anyhow::Error> {
        let n = shape.iter().product::<u64>() as usize;
        ensure!(
            data.len() == n * dtype.dsize(),
            "{} bytes do not make up a {:?} array of {:?}",
            data.len(),
            shape,
            dtype
        );

        Ok(MemorySource {
            dtype,
            shape: shape.to_vec(),
            data,
            block_bytes: STREAM_BLOCK_BYTES,
            reads: AtomicUsize::new(0),
        })
    }

    /// Copy an array in logical order.
    pub fn from_array<T, D>(a: ndarray::ArrayView<'_, T, D>) -> MemorySource
    where
        T: Element,
        D: ndarray::Dimension,
    {
        let shape = a.shape().iter().map(|&s| s as u64).collect();
        let values = a.iter().copied().collect::<Vec<T>>();

        MemorySource {
            dtype: T::DTYPE,
            shape,
            data: values.as_byte_slice().to_vec(),
            block_bytes: STREAM_BLOCK_BYTES,
            reads: AtomicUsize::new(0),
        }
    }

    pub fn with_stream_block_bytes(mut self, block_bytes: usize) -> MemorySource {
        self.block_bytes = block_bytes;
        self
    }

    /// Number of `read_to` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl SourceDataset for MemorySource {
    fn dtype(&self) -> Datatype {
        self.dtype
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }

    fn stream_block_bytes(&self) -> usize {
        self.block_bytes
    }

    fn read_to(
        &self,
        start: &[u64],
        count: &[u64],
        dst: &mut [u8],
    ) -> Result<usize, anyhow::Error> {
        let n = region_len(&self.shape, start, count)? as usize;
        let dsz = self.dtype.dsize();
        let vsz = n * dsz;

        ensure!(
            dst.len() >= vsz,
            "destination buffer has insufficient capacity"
        );

        self.reads.fetch_add(1, Ordering::Relaxed);

        if n == 0 {
            return Ok(0);
        }

        if self.shape.is_empty() {
            dst[..dsz].copy_from_slice(&self.data[..dsz]);
            return Ok(dsz);
        }

        // copy runs along the innermost dimension
        let d = self.shape.len() - 1;
        let run = count[d] as usize * dsz;
        let st = strides(&self.shape);
        let outer = count[..d].iter().map(|&c| c as i64).collect::<Vec<_>>();
        let mut coords = vec![0i64; d];

        for chunk in dst[..vsz].chunks_exact_mut(run) {
            let offset = izip!(start, &coords, &st)
                .map(|(&s, &c, &t)| (s + c as u64) * t)
                .sum::<u64>()
                + start[d];
            let offset = offset as usize * dsz;

            chunk.copy_from_slice(&self.data[offset..offset + run]);

            advance(&mut coords, &outer);
        }

        Ok(vsz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::typed;
    use ndarray::{s, Array};

    #[test]
    fn read_matches_slice() {
        let a = Array::from_shape_fn((4, 3, 5), |(i, j, k)| (i * 100 + j * 10 + k) as i64);
        let src = MemorySource::from_array(a.view());
        assert_eq!(src.shape(), [4, 3, 5]);
        assert_eq!(src.dtype(), Datatype::Int(8));

        let b = src.read(&[1, 1, 2], &[2, 2, 3]).unwrap();
        let v = typed::<i64>(&b).unwrap();
        let expected = a.slice(s![1..3, 1..3, 2..5]).iter().copied().collect::<Vec<_>>();
        assert_eq!(&*v, &expected[..]);
        assert_eq!(src.reads(), 1);
    }

    #[test]
    fn read_from_non_standard_layout() {
        let a = Array::from_shape_fn((3, 2), |(i, j)| (i * 2 + j) as f32);
        let t = a.t();
        let src = MemorySource::from_array(t);
        assert_eq!(src.shape(), [2, 3]);

        let b = src.read(&[0, 0], &[2, 3]).unwrap();
        assert_eq!(&*typed::<f32>(&b).unwrap(), &[0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
    }

    #[test]
    fn bad_regions() {
        let src = MemorySource::new(Datatype::Int(2), &[2, 2], vec![0u8; 8]).unwrap();
        assert!(src.read(&[1, 0], &[2, 1]).is_err());

        let mut small = [0u8; 2];
        assert!(src.read_to(&[0, 0], &[1, 2], &mut small).is_err());

        assert!(MemorySource::new(Datatype::Int(2), &[2, 2], vec![0u8; 7]).is_err());
    }
}
