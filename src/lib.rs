//! # FRAGPOP
//!
//! Memory-bounded import of N-dimensional array datasets (e.g. NetCDF climate model output)
//! into horizontally partitioned fragments.
//!
//! The dimensions of a [measure](measure::Measure) are split in *explicit* dimensions, which
//! make up the row keys, and *implicit* dimensions, which make up the array stored in every row.
//! A [fragment](measure::Fragment) is a contiguous range of row keys. Populating a fragment reads
//! the rows from a [source dataset](reader::SourceDataset), brings them into canonical order,
//! optionally applies a map or reduce [kernel](kernel::Operation) and hands them to a
//! [sink](sink::RowSink) in batches that fit in a memory budget.
//!
//! ## Usage
//!
//! ```
//! use fragpop::prelude::*;
//!
//! // 2 x 3 x 4 (time, lat, lon), lat and lon are explicit, time is stored in each row.
//! let values = (0..24).map(|v| v as f32).collect::<Vec<_>>();
//! let source = MemorySource::from_array(
//!     ndarray::ArrayView::from_shape((2, 3, 4), &values).unwrap(),
//! );
//!
//! let measure = Measure::new(
//!     "tas",
//!     Datatype::Float(4),
//!     vec![
//!         Dimension::implicit("time", 2, 1),
//!         Dimension::explicit("lat", 3, 1),
//!         Dimension::explicit("lon", 4, 2),
//!     ],
//! )
//! .with_operation("max", &[]);
//!
//! let mut sink = MemorySink::new(false);
//! populate(&Fragment::new("f0", 1, 12), &measure, &source, &mut sink, 1 << 20).unwrap();
//!
//! assert_eq!(sink.keys(), (1..=12).collect::<Vec<_>>());
//! assert_eq!(&sink.rows[0].1[..], &12.0f32.to_ne_bytes());
//! ```
//!
//! Independent fragments can be populated in parallel with
//! [`FragmentPopulator::populate_many`](populate::FragmentPopulator::populate_many).

#[macro_use]
extern crate anyhow;

pub mod error;
pub mod filters;
pub mod indexer;
pub mod kernel;
pub mod measure;
pub mod populate;
pub mod reader;
pub mod search;
pub mod sink;
pub mod types;

pub use error::{Error, Result};
pub use populate::{populate, FragmentPopulator, PopulateConfig};

pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::kernel::Operation;
    pub use crate::measure::{Dimension, Fragment, Measure};
    pub use crate::populate::{populate, FragmentPopulator, PopulateConfig};
    pub use crate::reader::{MemorySource, SourceDataset};
    pub use crate::sink::{MemorySink, RowFileReader, RowFileSink, RowSink};
    pub use crate::types::{Datatype, Element};

    #[cfg(feature = "netcdf")]
    pub use crate::reader::NetcdfSource;
}
