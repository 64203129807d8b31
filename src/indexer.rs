//! Multidimensional index arithmetic.
//!
//! Extents are always ordered from the outermost (slowest varying) to the innermost (fastest
//! varying) dimension. For explicit dimensions this is `oph_level` order, which is not
//! necessarily the storage order of the source dataset.

use itertools::izip;
use strength_reduce::StrengthReducedU64;

use crate::error::{Error, Result};

/// Row-major strides of `extents`: the innermost dimension has stride 1.
pub fn strides<E>(extents: &[E]) -> Vec<u64>
where
    E: Copy + Into<u64>,
{
    let mut d = Vec::with_capacity(extents.len());
    let mut p = 1u64;

    for (i, &c) in extents.iter().enumerate().rev() {
        d.push(p);
        // the outermost extent does not contribute to any stride
        if i > 0 {
            p *= c.into();
        }
    }

    d.reverse();
    d
}

/// Map a 1-based linear id to 1-based coordinates.
pub fn coordinates_from_linear_id(id: u64, extents: &[u32]) -> Result<Vec<i64>> {
    let total = extents.iter().map(|&e| e as u64).product::<u64>();

    if extents.is_empty() {
        return Err(Error::Invariant("no extents to index".into()));
    }

    if id < 1 || id > total {
        return Err(Error::Invariant(format!(
            "linear id {id} is outside of [1, {total}]"
        )));
    }

    let mut residual = id - 1;
    let mut coords = Vec::with_capacity(extents.len());

    for stride in strides(extents) {
        coords.push((residual / stride) as i64 + 1);
        residual %= stride;
    }

    Ok(coords)
}

/// Inverse of [`coordinates_from_linear_id`].
pub fn linear_id_from_coordinates(coords: &[i64], extents: &[u32]) -> u64 {
    debug_assert_eq!(coords.len(), extents.len());

    izip!(coords, strides(extents))
        .map(|(&c, s)| (c as u64 - 1) * s)
        .sum::<u64>()
        + 1
}

/// Odometer increment of 0-based `coords`, last index fastest.
///
/// Returns `true` when the carry propagates past the first dimension, in which case `coords` has
/// wrapped around to all zeros.
pub fn advance(coords: &mut [i64], extents: &[i64]) -> bool {
    debug_assert_eq!(coords.len(), extents.len());

    for (c, &e) in coords.iter_mut().zip(extents).rev() {
        *c += 1;
        if *c >= e {
            *c = 0;
        } else {
            return false;
        }
    }

    true
}

/// Precomputed divisors for mapping row keys to explicit coordinates.
///
/// This is the per-row version of [`coordinates_from_linear_id`], returning 0-based coordinates
/// without allocating.
pub struct RowIndexer {
    extents: Vec<u64>,
    strides: Vec<StrengthReducedU64>,
    total: u64,
}

impl RowIndexer {
    pub fn new(extents: &[u64]) -> Result<RowIndexer> {
        if extents.iter().any(|&e| e == 0) {
            return Err(Error::Invariant(format!(
                "zero sized explicit extent in {extents:?}"
            )));
        }

        Ok(RowIndexer {
            extents: extents.to_vec(),
            strides: strides(extents)
                .into_iter()
                .map(StrengthReducedU64::new)
                .collect(),
            total: extents.iter().product(),
        })
    }

    /// Number of rows in the explicit space.
    pub fn rows(&self) -> u64 {
        self.total
    }

    pub fn extents(&self) -> &[u64] {
        &self.extents
    }

    /// Write the 0-based coordinates of 1-based `key` to `coords`.
    pub fn coords_to(&self, key: u64, coords: &mut [u64]) -> Result<()> {
        debug_assert_eq!(coords.len(), self.strides.len());

        if key < 1 || key > self.total {
            return Err(Error::Invariant(format!(
                "row key {key} is outside of [1, {}]",
                self.total
            )));
        }

        let mut residual = key - 1;
        for (c, s) in izip!(coords.iter_mut(), &self.strides) {
            *c = residual / *s;
            residual = residual % *s;
        }

        Ok(())
    }
}

/// The hyper-rectangle `(start, count)` of 0-based explicit coordinates covered by the keys
/// `key_start..=key_end`, if those keys form one.
pub fn fragment_box(
    key_start: u64,
    key_end: u64,
    extents: &[u64],
) -> Result<Option<(Vec<u64>, Vec<u64>)>> {
    if key_end < key_start {
        return Err(Error::Invariant(format!(
            "empty key range {key_start}..={key_end}"
        )));
    }

    let indexer = RowIndexer::new(extents)?;
    let n = extents.len();

    let mut first = vec![0; n];
    let mut last = vec![0; n];
    indexer.coords_to(key_start, &mut first)?;
    indexer.coords_to(key_end, &mut last)?;

    // First dimension where the range is not pinned to a single coordinate.
    let k = match izip!(&first, &last).position(|(f, l)| f != l) {
        Some(k) => k,
        None => return Ok(Some((first, vec![1; n]))),
    };

    let inner_full = izip!(&first[k + 1..], &last[k + 1..], &extents[k + 1..])
        .all(|(&f, &l, &e)| f == 0 && l == e - 1);

    if !inner_full {
        return Ok(None);
    }

    let mut start = first.clone();
    let mut count = vec![1; n];
    count[k] = last[k] - first[k] + 1;
    for d in k + 1..n {
        start[d] = 0;
        count[d] = extents[d];
    }

    Ok(Some((start, count)))
}
