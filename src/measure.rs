//! Measure, dimension and fragment descriptors.
//!
//! The dimensions of a [`Measure`] are listed in the storage order of the source dataset. The
//! canonical order used for rows is derived from the explicit flag and `oph_level` of each
//! dimension.

use byte_slice_cast::AsByteSlice;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::filters::transpose::permuted_products;
use crate::kernel::Operation;
use crate::search::{resolve_filter, value_lookup, Policy};
use crate::types::{Datatype, Element};

/// Separator between the start and end token of a subset filter.
pub const SUBSET_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,

    /// Element type of the coordinate variable.
    pub dtype: Datatype,

    /// Full length in the source dataset.
    pub length: u64,

    /// 1-based rank within the explicit or implicit group.
    pub oph_level: u32,
    pub explicit: bool,

    /// Inclusive, 0-based subset.
    pub start_index: u64,
    pub end_index: u64,
}

impl Dimension {
    /// An explicit dimension covering its full length.
    pub fn explicit(name: &str, length: u64, oph_level: u32) -> Dimension {
        Dimension {
            name: name.to_string(),
            dtype: Datatype::Float(8),
            length,
            oph_level,
            explicit: true,
            start_index: 0,
            end_index: length.saturating_sub(1),
        }
    }

    /// An implicit dimension covering its full length.
    pub fn implicit(name: &str, length: u64, oph_level: u32) -> Dimension {
        Dimension {
            explicit: false,
            ..Dimension::explicit(name, length, oph_level)
        }
    }

    pub fn with_subset(mut self, start_index: u64, end_index: u64) -> Dimension {
        self.start_index = start_index;
        self.end_index = end_index;
        self
    }

    pub fn with_dtype(mut self, dtype: Datatype) -> Dimension {
        self.dtype = dtype;
        self
    }

    /// Number of elements in the subset.
    pub fn count(&self) -> u64 {
        self.end_index - self.start_index + 1
    }

    /// Resolve a filter of raw indices, e.g. `"2:10"` or `"4"`.
    pub fn apply_index_filter(&mut self, filter: &str) -> Result<()> {
        let never = |_: &str, _: Policy| -> Result<usize> {
            Err(Error::Param("index filter needs no lookup".into()))
        };
        let (s, e) = resolve_filter(filter, SUBSET_SEPARATOR, never, true)?;
        self.set_subset(s as u64, e as u64)
    }

    /// Resolve a filter of coordinate values against the coordinate variable of the dimension.
    pub fn apply_filter<T: Element>(&mut self, filter: &str, coordinates: &[T]) -> Result<()> {
        if coordinates.len() as u64 != self.length {
            return Err(Error::Invariant(format!(
                "dimension {} has length {} but {} coordinates",
                self.name,
                self.length,
                coordinates.len()
            )));
        }

        let lookup = value_lookup(coordinates, T::zero(), false);
        let (s, e) = resolve_filter(filter, SUBSET_SEPARATOR, lookup, false).map_err(|e| match e {
            Error::Bound {
                value, min, max, ..
            } => Error::Bound {
                dimension: self.name.clone(),
                value,
                min,
                max,
            },
            e => e,
        })?;

        self.set_subset(s as u64, e as u64)
    }

    fn set_subset(&mut self, start: u64, end: u64) -> Result<()> {
        if end >= self.length {
            return Err(Error::bound(
                &self.name,
                end,
                0,
                self.length.saturating_sub(1),
            ));
        }

        self.start_index = start;
        self.end_index = end;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    /// Variable name in the source dataset.
    pub name: String,
    pub dtype: Datatype,

    /// Dimensions in source storage order.
    pub dimensions: Vec<Dimension>,

    pub operation: Option<String>,
    pub args: Vec<f64>,

    /// Native-endian bytes of the fill value.
    #[serde(default, with = "serde_bytes")]
    pub fill: Option<Vec<u8>>,
}

impl Measure {
    pub fn new(name: &str, dtype: Datatype, dimensions: Vec<Dimension>) -> Measure {
        Measure {
            name: name.to_string(),
            dtype,
            dimensions,
            operation: None,
            args: Vec::new(),
            fill: None,
        }
    }

    pub fn with_operation(mut self, operation: &str, args: &[f64]) -> Measure {
        self.operation = Some(operation.to_string());
        self.args = args.to_vec();
        self
    }

    pub fn with_fill<T: Element>(mut self, fill: T) -> Measure {
        self.fill = Some(std::slice::from_ref(&fill).as_byte_slice().to_vec());
        self
    }

    /// Decode the fill value as `T`, which must match the declared element type.
    pub fn fill_value<T: Element>(&self) -> Result<Option<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::Type(format!(
                "measure {} is {:?}, fill value requested as {:?}",
                self.name,
                self.dtype,
                T::DTYPE
            )));
        }

        self.fill.as_deref().map(T::from_ne_slice).transpose()
    }

    /// Resolve the operation name and arguments.
    pub fn operation(&self) -> Result<Operation> {
        Operation::parse(self.operation.as_deref(), &self.args)
    }

    pub fn ndims(&self) -> usize {
        self.dimensions.len()
    }

    pub fn nexp(&self) -> usize {
        self.dimensions.iter().filter(|d| d.explicit).count()
    }

    pub fn nimp(&self) -> usize {
        self.ndims() - self.nexp()
    }

    /// Check the level, count and subset invariants of the dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.nexp() == 0 {
            return Err(Error::Invariant(format!(
                "measure {} has no explicit dimension",
                self.name
            )));
        }

        for explicit in [true, false] {
            let group = self
                .dimensions
                .iter()
                .filter(|d| d.explicit == explicit)
                .collect::<Vec<_>>();

            for level in 1..=group.len() as u32 {
                let n = group.iter().filter(|d| d.oph_level == level).count();
                if n != 1 {
                    return Err(Error::Invariant(format!(
                        "{} {} dimensions of measure {} have oph_level {level}",
                        n,
                        if explicit { "explicit" } else { "implicit" },
                        self.name
                    )));
                }
            }
        }

        for d in &self.dimensions {
            if d.length == 0 {
                return Err(Error::Invariant(format!("dimension {} is empty", d.name)));
            }

            if d.start_index > d.end_index || d.end_index >= d.length {
                return Err(Error::bound(
                    &d.name,
                    format!("{}..={}", d.start_index, d.end_index),
                    0,
                    d.length - 1,
                ));
            }
        }

        Ok(())
    }

    /// Storage positions of the explicit dimensions in `oph_level` order.
    pub fn explicit_order(&self) -> Vec<usize> {
        self.group_order(true)
    }

    /// Storage positions of the implicit dimensions in `oph_level` order.
    pub fn implicit_order(&self) -> Vec<usize> {
        self.group_order(false)
    }

    fn group_order(&self, explicit: bool) -> Vec<usize> {
        let mut order = (0..self.ndims())
            .filter(|&i| self.dimensions[i].explicit == explicit)
            .collect::<Vec<_>>();
        order.sort_by_key(|&i| self.dimensions[i].oph_level);
        order
    }

    /// Explicit dimensions first, then implicit dimensions, each group by `oph_level`.
    pub fn canonical_order(&self) -> Vec<usize> {
        let mut order = self.explicit_order();
        order.extend(self.implicit_order());
        order
    }

    /// Subset counts of the explicit dimensions in `oph_level` order.
    pub fn explicit_extents(&self) -> Vec<u64> {
        self.explicit_order()
            .into_iter()
            .map(|i| self.dimensions[i].count())
            .collect()
    }

    /// Subset counts of the implicit dimensions in `oph_level` order.
    pub fn implicit_extents(&self) -> Vec<u64> {
        self.implicit_order()
            .into_iter()
            .map(|i| self.dimensions[i].count())
            .collect()
    }

    /// Number of rows in the subsetted explicit space.
    pub fn rows(&self) -> u64 {
        self.explicit_extents().iter().product()
    }

    /// Elements per stored row under `op`.
    pub fn array_length(&self, op: &Operation) -> u64 {
        if op.is_reduction() {
            1
        } else {
            self.implicit_extents().iter().product()
        }
    }

    /// Arguments of [`crate::filters::transpose::cache_to_buffer`] that bring a region read
    /// from the source with `counts` (storage order) into canonical order, or `None` if the
    /// region already is in canonical order.
    pub fn transpose_layout(&self, counts: &[u64]) -> Option<(Vec<u32>, Vec<u32>)> {
        debug_assert_eq!(counts.len(), self.ndims());

        let order = self.canonical_order();

        // singleton dimensions do not affect the element order.
        let canonical = order
            .iter()
            .filter(|&&i| counts[i] > 1)
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| w[0] < w[1]);

        if canonical {
            return None;
        }

        let limits = order.iter().map(|&i| counts[i] as u32).collect();
        let products = permuted_products(counts, &order);

        Some((limits, products))
    }
}

/// Destination of one populate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// First row key, 1-based.
    pub key_start: u64,

    /// Last row key, inclusive.
    pub key_end: u64,

    pub name: String,

    /// Opaque handle of the owning storage unit.
    pub storage_unit: u64,
}

impl Fragment {
    pub fn new(name: &str, key_start: u64, key_end: u64) -> Fragment {
        Fragment {
            key_start,
            key_end,
            name: name.to_string(),
            storage_unit: 0,
        }
    }

    /// Number of rows in the fragment.
    pub fn tuplexfrag(&self) -> u64 {
        (self.key_end + 1).saturating_sub(self.key_start)
    }

    /// Split `rows` keys into consecutive fragments of at most `per_fragment` rows.
    pub fn split(prefix: &str, rows: u64, per_fragment: u64) -> Vec<Fragment> {
        let per_fragment = per_fragment.max(1);

        (0..rows.div_ceil(per_fragment))
            .map(|i| {
                let key_start = i * per_fragment + 1;
                let key_end = (key_start + per_fragment - 1).min(rows);
                Fragment::new(&format!("{prefix}{i}"), key_start, key_end)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Reduction;

    /// time x lat x lon stored, with lat and lon explicit (lon outer) and time implicit.
    fn climate() -> Measure {
        Measure::new(
            "tas",
            Datatype::Float(4),
            vec![
                Dimension::implicit("time", 12, 1),
                Dimension::explicit("lat", 4, 2),
                Dimension::explicit("lon", 5, 1),
            ],
        )
    }

    #[test]
    fn levels_and_extents() {
        let m = climate().with_fill(-999.0f32);
        m.validate().unwrap();

        assert_eq!(m.nexp(), 2);
        assert_eq!(m.nimp(), 1);
        assert_eq!(m.explicit_order(), [2, 1]);
        assert_eq!(m.canonical_order(), [2, 1, 0]);
        assert_eq!(m.explicit_extents(), [5, 4]);
        assert_eq!(m.implicit_extents(), [12]);
        assert_eq!(m.rows(), 20);
        assert_eq!(m.array_length(&Operation::Copy), 12);
        assert_eq!(
            m.array_length(&Operation::Reduce(Reduction::Avg)),
            1
        );
    }

    #[test]
    fn invalid_levels() {
        let mut m = climate();
        m.dimensions[1].oph_level = 1;
        assert!(matches!(m.validate(), Err(Error::Invariant(_))));

        let mut m = climate();
        m.dimensions[0].oph_level = 2;
        assert!(matches!(m.validate(), Err(Error::Invariant(_))));

        let mut m = climate();
        for d in &mut m.dimensions {
            d.explicit = false;
        }
        assert!(matches!(m.validate(), Err(Error::Invariant(_))));
    }

    #[test]
    fn invalid_subset() {
        let mut m = climate();
        m.dimensions[0] = m.dimensions[0].clone().with_subset(3, 12);
        assert!(matches!(
            m.validate(),
            Err(Error::Bound { dimension, .. }) if dimension == "time"
        ));

        let mut m = climate();
        m.dimensions[2] = m.dimensions[2].clone().with_subset(3, 2);
        assert!(m.validate().is_err());
    }

    #[test]
    fn fill_value_typed() {
        let m = climate().with_fill(-999.0f32);
        assert_eq!(m.fill_value::<f32>().unwrap(), Some(-999.0));
        assert!(matches!(m.fill_value::<f64>(), Err(Error::Type(_))));
        assert_eq!(climate().fill_value::<f32>().unwrap(), None);
    }

    #[test]
    fn serde_round_trip() {
        let m = climate()
            .with_fill(-999.0f32)
            .with_operation("mul_scalar", &[2.0]);
        let b = bincode::serialize(&m).unwrap();
        let d: Measure = bincode::deserialize(&b).unwrap();
        assert_eq!(d, m);
        assert_eq!(d.fill_value::<f32>().unwrap(), Some(-999.0));
    }

    #[test]
    fn filters() {
        let lat = [-60.0f64, -30.0, 0.0, 30.0, 60.0];
        let mut d = Dimension::explicit("lat", 5, 1);

        d.apply_filter("-40:10", &lat).unwrap();
        assert_eq!((d.start_index, d.end_index), (0, 3));
        assert_eq!(d.count(), 4);

        d.apply_index_filter("1:2").unwrap();
        assert_eq!((d.start_index, d.end_index), (1, 2));

        assert!(matches!(
            d.apply_index_filter("2:5"),
            Err(Error::Bound { dimension, .. }) if dimension == "lat"
        ));
        assert!(matches!(
            d.apply_filter("70", &lat),
            Err(Error::Bound { dimension, .. }) if dimension == "lat"
        ));
        assert!(matches!(
            d.apply_filter("0", &lat[..3]),
            Err(Error::Invariant(_))
        ));
        // unchanged by failed filters
        assert_eq!((d.start_index, d.end_index), (1, 2));
    }

    #[test]
    fn layout_for_row_and_region() {
        let m = climate();

        // one row: only time varies
        assert_eq!(m.transpose_layout(&[12, 1, 1]), None);

        // a region spanning lon and lat needs lon outermost
        let (limits, products) = m.transpose_layout(&[12, 4, 5]).unwrap();
        assert_eq!(limits, [5, 4, 12]);
        assert_eq!(products, [1, 5, 20]);

        // lon is outside of time in canonical order, inside of it in storage
        assert!(m.transpose_layout(&[12, 1, 5]).is_some());
    }

    #[test]
    fn layout_canonical_storage() {
        let m = Measure::new(
            "v",
            Datatype::Int(4),
            vec![
                Dimension::explicit("x", 3, 1),
                Dimension::implicit("z", 2, 2),
                Dimension::implicit("y", 4, 1),
            ],
        );
        m.validate().unwrap();

        assert_eq!(m.implicit_order(), [2, 1]);
        assert!(m.transpose_layout(&[1, 2, 4]).is_some());
        assert_eq!(m.transpose_layout(&[1, 1, 4]), None);
    }

    #[test]
    fn fragments() {
        let f = Fragment::new("f0", 11, 20);
        assert_eq!(f.tuplexfrag(), 10);

        let fs = Fragment::split("frag", 23, 10);
        assert_eq!(fs.len(), 3);
        assert_eq!((fs[0].key_start, fs[0].key_end), (1, 10));
        assert_eq!((fs[2].key_start, fs[2].key_end), (21, 23));
        assert_eq!(fs[2].name, "frag2");
    }
}
