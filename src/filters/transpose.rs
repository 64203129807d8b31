//! Reorder element buffers from source storage order into canonical order.

use itertools::izip;

use crate::indexer::advance;

/// Gather elements of `source` into `dest` by visiting the Cartesian product of
/// `0..limits[d]` with the first dimension varying slowest.
///
/// For every combination the source offset is `sum(counter[d] * products[d])` (in elements), so
/// `products` are the source-buffer strides of each dimension in the order the output should
/// have. Elements are written to `dest` in visitation order.
///
/// A 2x3 row-major source read column-major:
///
/// ```
/// # use fragpop::filters::transpose::cache_to_buffer;
/// let src: Vec<u8> = vec![1, 2, 3, 4, 5, 6];
/// let mut dst = vec![0u8; 6];
/// cache_to_buffer(&[3, 2], &[1, 3], &src, &mut dst, 1);
/// assert_eq!(dst, [1, 4, 2, 5, 3, 6]);
/// ```
pub fn cache_to_buffer(
    limits: &[u32],
    products: &[u32],
    source: &[u8],
    dest: &mut [u8],
    element_size: usize,
) {
    assert_eq!(limits.len(), products.len());

    let n = limits.iter().map(|&l| l as usize).product::<usize>();
    assert_eq!(
        dest.len(),
        n * element_size,
        "destination buffer must hold the full product of limits"
    );

    if n == 0 {
        return;
    }

    debug_assert!(
        izip!(limits, products)
            .map(|(&l, &p)| (l as usize - 1) * p as usize)
            .sum::<usize>()
            < source.len() / element_size
    );

    if limits.is_empty() {
        dest.copy_from_slice(&source[..element_size]);
        return;
    }

    let extents = limits.iter().map(|&l| l as i64).collect::<Vec<_>>();
    let mut counter = vec![0i64; limits.len()];

    for dst in dest.chunks_exact_mut(element_size) {
        let offset = izip!(&counter, products)
            .map(|(&c, &p)| c as usize * p as usize)
            .sum::<usize>()
            * element_size;

        dst.copy_from_slice(&source[offset..offset + element_size]);

        advance(&mut counter, &extents);
    }
}

/// Source strides (in elements) of a buffer laid out row-major with `counts`, permuted into
/// `order`.
///
/// `order[i]` is the source dimension that should become output dimension `i`.
pub fn permuted_products(counts: &[u64], order: &[usize]) -> Vec<u32> {
    let strides = crate::indexer::strides(counts);
    order.iter().map(|&d| strides[d] as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
    use ndarray::{Array, IxDyn};

    #[test]
    fn column_major_fixture() {
        let src: [i32; 6] = [1, 2, 3, 4, 5, 6];
        let mut dst = [0i32; 6];

        cache_to_buffer(
            &[3, 2],
            &[1, 3],
            src.as_byte_slice(),
            dst.as_mut_byte_slice(),
            4,
        );

        assert_eq!(dst, [1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn identity() {
        let src: Vec<f64> = (0..24).map(|v| v as f64).collect();
        let mut dst = vec![0f64; 24];

        cache_to_buffer(
            &[2, 3, 4],
            &permuted_products(&[2, 3, 4], &[0, 1, 2]),
            src.as_byte_slice(),
            dst.as_mut_byte_slice(),
            8,
        );

        assert_eq!(src, dst);
    }

    #[test]
    fn matches_ndarray_permutation() {
        let shape = [3usize, 4, 5];
        let src: Vec<i16> = (0..60).collect();
        let a = Array::from_shape_vec(IxDyn(&shape), src.clone()).unwrap();

        for order in [
            [0usize, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ] {
            let expected = a
                .clone()
                .permuted_axes(IxDyn(&order))
                .iter()
                .copied()
                .collect::<Vec<i16>>();

            let limits = order.iter().map(|&d| shape[d] as u32).collect::<Vec<_>>();
            let counts = shape.iter().map(|&s| s as u64).collect::<Vec<_>>();
            let mut dst = vec![0i16; 60];

            cache_to_buffer(
                &limits,
                &permuted_products(&counts, &order),
                src.as_byte_slice(),
                dst.as_mut_byte_slice(),
                2,
            );

            assert_eq!(dst, expected, "order: {order:?}");
        }
    }

    #[test]
    fn random_4d_and_back() {
        use rand::distributions::Standard;
        use rand::{thread_rng, Rng};

        let counts = [2u64, 5, 3, 7];
        let order = [3usize, 1, 0, 2];
        let inverse = [2usize, 1, 3, 0];

        let src: Vec<f32> = thread_rng().sample_iter(Standard).take(210).collect();
        let mut permuted = vec![0f32; 210];
        let mut back = vec![0f32; 210];

        let limits = order.iter().map(|&d| counts[d] as u32).collect::<Vec<_>>();
        cache_to_buffer(
            &limits,
            &permuted_products(&counts, &order),
            src.as_byte_slice(),
            permuted.as_mut_byte_slice(),
            4,
        );

        let pcounts = order.iter().map(|&d| counts[d]).collect::<Vec<_>>();
        let limits = inverse.iter().map(|&d| pcounts[d] as u32).collect::<Vec<_>>();
        cache_to_buffer(
            &limits,
            &permuted_products(&pcounts, &inverse),
            permuted.as_byte_slice(),
            back.as_mut_byte_slice(),
            4,
        );

        assert_eq!(src, back);
    }

    #[test]
    fn subset_of_source() {
        // Only the first row and every column of a 2x3 source.
        let src: Vec<u8> = vec![1, 2, 3, 4, 5, 6];
        let mut dst = vec![0u8; 3];
        cache_to_buffer(&[3], &[1], &src, &mut dst, 1);
        assert_eq!(dst, [1, 2, 3]);
    }

    #[test]
    #[should_panic]
    fn short_destination() {
        let src: Vec<u8> = vec![1, 2, 3, 4];
        let mut dst = vec![0u8; 3];
        cache_to_buffer(&[2, 2], &[2, 1], &src, &mut dst, 1);
    }
}
