//! Memory-bounded population of fragments.
//!
//! A fragment is a contiguous range of row keys in the explicit space of a measure. Every row
//! holds the implicit dimensions of one explicit coordinate in canonical order, optionally
//! transformed or reduced by the measure operation. Rows are handed to a [`RowSink`] in
//! batches with increasing keys.
//!
//! Two strategies are used:
//!
//!  * **whole fragment**: when the raw data of the fragment is a single hyperslab of the source
//!    and fits in half of the memory budget, it is read in one go, transposed to canonical
//!    order and then cut into rows.
//!  * **blocked**: rows are read (or streamed, for reductions) one by one into a batch buffer,
//!    sized by the memory budget and [`PopulateConfig`].

use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dispatch;
use crate::error::{Error, Result};
use crate::filters::transpose::cache_to_buffer;
use crate::indexer::{fragment_box, RowIndexer};
use crate::kernel::{Kernel, Operation, StreamContext};
use crate::measure::{Fragment, Measure};
use crate::reader::SourceDataset;
use crate::sink::{BatchEnd, RowBatch, RowSink};
use crate::types::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulateConfig {
    /// Upper size of one batch handed to the sink.
    pub max_block_bytes: u64,

    /// Upper number of rows in one batch.
    pub max_block_rows: u64,

    /// Allow reading a whole fragment at once.
    pub whole_fragment: bool,
}

impl Default for PopulateConfig {
    fn default() -> Self {
        PopulateConfig {
            max_block_bytes: 64 * 1024 * 1024,
            max_block_rows: 10_000,
            whole_fragment: true,
        }
    }
}

impl PopulateConfig {
    pub fn with_max_block_bytes(mut self, max_block_bytes: u64) -> Self {
        self.max_block_bytes = max_block_bytes;
        self
    }

    pub fn with_max_block_rows(mut self, max_block_rows: u64) -> Self {
        self.max_block_rows = max_block_rows;
        self
    }

    pub fn with_whole_fragment(mut self, whole_fragment: bool) -> Self {
        self.whole_fragment = whole_fragment;
        self
    }
}

/// Split of a fragment into `regular_times` batches of `regular_rows` rows and a last batch
/// of `remainder_rows` rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub regular_rows: u64,
    pub regular_times: u64,
    pub remainder_rows: u64,
}

impl BatchPlan {
    pub fn new(
        tuplexfrag: u64,
        row_bytes: u64,
        memory_budget: u64,
        config: &PopulateConfig,
    ) -> Result<BatchPlan> {
        if row_bytes > memory_budget {
            return Err(Error::Memory {
                context: "single row".into(),
                required: row_bytes,
                budget: memory_budget,
            });
        }

        let row_bytes = row_bytes.max(1);
        let regular_rows = (memory_budget / row_bytes)
            .min(config.max_block_bytes / row_bytes)
            .min(config.max_block_rows)
            .min(tuplexfrag)
            .max(1);

        Ok(BatchPlan {
            regular_rows,
            regular_times: tuplexfrag / regular_rows,
            remainder_rows: tuplexfrag % regular_rows,
        })
    }

    /// Row offset and row count of every batch.
    pub fn batches(&self) -> impl Iterator<Item = (u64, u64)> {
        let BatchPlan {
            regular_rows,
            regular_times,
            remainder_rows,
        } = *self;

        (0..regular_times)
            .map(move |i| (i * regular_rows, regular_rows))
            .chain((remainder_rows > 0).then_some((regular_times * regular_rows, remainder_rows)))
    }
}

/// Source region of one row and the derived sizes.
struct RowLayout {
    /// Storage positions of the explicit dimensions in `oph_level` order.
    explicit: Vec<usize>,
    indexer: RowIndexer,
    start: Vec<u64>,
    count: Vec<u64>,

    /// Elements read per row.
    raw_len: usize,
    array_length: usize,
    transpose: Option<(Vec<u32>, Vec<u32>)>,
}

impl RowLayout {
    fn new(measure: &Measure, op: &Operation) -> Result<RowLayout> {
        let start = measure
            .dimensions
            .iter()
            .map(|d| d.start_index)
            .collect();
        let count = measure
            .dimensions
            .iter()
            .map(|d| if d.explicit { 1 } else { d.count() })
            .collect::<Vec<_>>();

        let transpose = if op.is_reduction() {
            None
        } else {
            measure.transpose_layout(&count)
        };

        Ok(RowLayout {
            explicit: measure.explicit_order(),
            indexer: RowIndexer::new(&measure.explicit_extents())?,
            start,
            count,
            raw_len: measure.implicit_extents().iter().product::<u64>() as usize,
            array_length: measure.array_length(op) as usize,
            transpose,
        })
    }

    /// Set the explicit entries of `start` to the coordinates of row `key`.
    fn row_start(
        &self,
        measure: &Measure,
        key: u64,
        coords: &mut [u64],
        start: &mut [u64],
    ) -> Result<()> {
        self.indexer.coords_to(key, coords)?;
        for (&c, &p) in coords.iter().zip(&self.explicit) {
            start[p] = measure.dimensions[p].start_index + c;
        }
        Ok(())
    }
}

fn alloc<T: Clone + Default>(len: usize, context: &str, budget: u64) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::Memory {
        context: context.to_string(),
        required: (len * std::mem::size_of::<T>()) as u64,
        budget,
    })?;
    v.resize(len, T::default());
    Ok(v)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FragmentPopulator {
    config: PopulateConfig,
}

impl FragmentPopulator {
    pub fn new(config: PopulateConfig) -> FragmentPopulator {
        FragmentPopulator { config }
    }

    pub fn config(&self) -> &PopulateConfig {
        &self.config
    }

    /// Populate `fragment` with rows of `measure` read from `source`.
    ///
    /// Every row key of the fragment is handed to `sink` exactly once, in increasing order. On
    /// failure rows already handed to the sink are left there.
    pub fn populate<S, K>(
        &self,
        fragment: &Fragment,
        measure: &Measure,
        source: &S,
        sink: &mut K,
        memory_budget: u64,
    ) -> Result<()>
    where
        S: SourceDataset + ?Sized,
        K: RowSink + ?Sized,
    {
        let op = check(fragment, measure, source)?;

        dispatch!(measure.dtype, T => {
            self.populate_as::<T, S, K>(fragment, measure, op, source, sink, memory_budget)
        })?
    }

    /// Populate independent fragments in parallel, each into its own sink from `make_sink`.
    ///
    /// The memory budget applies to each fragment. Results are returned in the order of
    /// `fragments`.
    pub fn populate_many<S, K, F>(
        &self,
        fragments: &[Fragment],
        measure: &Measure,
        source: &S,
        make_sink: F,
        memory_budget: u64,
    ) -> Vec<Result<K>>
    where
        S: SourceDataset + ?Sized,
        K: RowSink + Send,
        F: Fn(&Fragment) -> Result<K, anyhow::Error> + Sync,
    {
        fragments
            .par_iter()
            .map(|fragment| {
                let mut sink = make_sink(fragment)
                    .map_err(Error::io(format!("fragment {}: open sink", fragment.name)))?;
                self.populate(fragment, measure, source, &mut sink, memory_budget)?;
                Ok(sink)
            })
            .collect()
    }

    fn populate_as<T, S, K>(
        &self,
        fragment: &Fragment,
        measure: &Measure,
        op: Operation,
        source: &S,
        sink: &mut K,
        memory_budget: u64,
    ) -> Result<()>
    where
        T: Element,
        S: SourceDataset + ?Sized,
        K: RowSink + ?Sized,
    {
        let kernel = Kernel::new(op, measure.fill_value::<T>()?);
        let layout = RowLayout::new(measure, &op)?;

        let dsz = std::mem::size_of::<T>() as u64;
        let tuplexfrag = fragment.tuplexfrag();
        let raw_row_bytes = layout.raw_len as u64 * dsz;

        let whole = if self.config.whole_fragment
            && tuplexfrag > 1
            && tuplexfrag * raw_row_bytes <= memory_budget / 2
        {
            fragment_box(
                fragment.key_start,
                fragment.key_end,
                layout.indexer.extents(),
            )?
        } else {
            None
        };

        match whole {
            Some(region) => {
                log::debug!(
                    "{}: caching whole fragment of {} rows ({} bytes)",
                    fragment.name,
                    tuplexfrag,
                    tuplexfrag * raw_row_bytes
                );
                self.whole::<T, S, K>(
                    fragment,
                    measure,
                    &kernel,
                    &layout,
                    region,
                    source,
                    sink,
                    memory_budget,
                )
            }
            None => self.blocked::<T, S, K>(
                fragment,
                measure,
                &kernel,
                &layout,
                source,
                sink,
                memory_budget,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn whole<T, S, K>(
        &self,
        fragment: &Fragment,
        measure: &Measure,
        kernel: &Kernel<T>,
        layout: &RowLayout,
        (bstart, bcount): (Vec<u64>, Vec<u64>),
        source: &S,
        sink: &mut K,
        memory_budget: u64,
    ) -> Result<()>
    where
        T: Element,
        S: SourceDataset + ?Sized,
        K: RowSink + ?Sized,
    {
        let dsz = std::mem::size_of::<T>();
        let tuplexfrag = fragment.tuplexfrag();
        let raw_row_bytes = layout.raw_len * dsz;
        let cached = tuplexfrag as usize * raw_row_bytes;

        let mut start = layout.start.clone();
        let mut count = layout.count.clone();
        for (k, &p) in layout.explicit.iter().enumerate() {
            start[p] = measure.dimensions[p].start_index + bstart[k];
            count[p] = bcount[k];
        }

        let mut raw = alloc::<u8>(cached, &fragment.name, memory_budget)?;
        source
            .read_to(&start, &count, &mut raw)
            .map_err(|source| Error::Io {
                context: format!(
                    "fragment {}: read keys {}..={}",
                    fragment.name, fragment.key_start, fragment.key_end
                ),
                source,
            })?;

        let cache = match measure.transpose_layout(&count) {
            Some((limits, products)) => {
                let mut c = alloc::<u8>(cached, &fragment.name, memory_budget)?;
                cache_to_buffer(&limits, &products, &raw, &mut c, dsz);
                drop(raw);
                c
            }
            None => raw,
        };

        let row_bytes = layout.array_length * dsz;
        let al = layout.array_length;

        if kernel.operation() == Operation::Copy {
            let plan = BatchPlan::new(tuplexfrag, row_bytes as u64, memory_budget, &self.config)?;
            for (offset, rows) in plan.batches() {
                let o = offset as usize * row_bytes;
                let data = &cache[o..o + rows as usize * row_bytes];
                emit(fragment, sink, offset, rows, row_bytes, data)?;
            }
            return Ok(());
        }

        let plan = BatchPlan::new(
            tuplexfrag,
            row_bytes as u64,
            memory_budget.saturating_sub(cached as u64),
            &self.config,
        )?;
        let mut batch = alloc::<T>(plan.regular_rows as usize * al, &fragment.name, memory_budget)?;

        for (offset, rows) in plan.batches() {
            for r in 0..rows as usize {
                let o = (offset as usize + r) * raw_row_bytes;
                kernel.apply(&cache[o..o + raw_row_bytes], &mut batch[r * al..(r + 1) * al])?;
            }

            let data = batch[..rows as usize * al].as_byte_slice();
            emit(fragment, sink, offset, rows, row_bytes, data)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn blocked<T, S, K>(
        &self,
        fragment: &Fragment,
        measure: &Measure,
        kernel: &Kernel<T>,
        layout: &RowLayout,
        source: &S,
        sink: &mut K,
        memory_budget: u64,
    ) -> Result<()>
    where
        T: Element,
        S: SourceDataset + ?Sized,
        K: RowSink + ?Sized,
    {
        let dsz = std::mem::size_of::<T>();
        let al = layout.array_length;
        let row_bytes = al * dsz;
        let raw_row_bytes = layout.raw_len * dsz;

        let plan = BatchPlan::new(
            fragment.tuplexfrag(),
            row_bytes as u64,
            memory_budget,
            &self.config,
        )
        .map_err(|e| match e {
            Error::Memory {
                context,
                required,
                budget,
            } => Error::Memory {
                context: format!("fragment {}: {context}", fragment.name),
                required,
                budget,
            },
            e => e,
        })?;

        log::debug!(
            "{}: blocked, {} x {} rows + {} rows of {} bytes",
            fragment.name,
            plan.regular_times,
            plan.regular_rows,
            plan.remainder_rows,
            row_bytes
        );

        let op = kernel.operation();
        let reduce = op.is_reduction();
        let direct = op == Operation::Copy && layout.transpose.is_none();

        let mut batch = alloc::<T>(plan.regular_rows as usize * al, &fragment.name, memory_budget)?;
        let mut raw = if reduce || direct {
            Vec::new()
        } else {
            alloc::<u8>(raw_row_bytes, &fragment.name, memory_budget)?
        };
        let mut canonical = if !reduce && op != Operation::Copy && layout.transpose.is_some() {
            alloc::<u8>(raw_row_bytes, &fragment.name, memory_budget)?
        } else {
            Vec::new()
        };

        let mut coords = vec![0u64; layout.explicit.len()];
        let mut start = layout.start.clone();

        for (offset, rows) in plan.batches() {
            for r in 0..rows as usize {
                let key = fragment.key_start + offset + r as u64;
                layout.row_start(measure, key, &mut coords, &mut start)?;

                let out = &mut batch[r * al..(r + 1) * al];
                let read_err = |e| Error::Io {
                    context: format!("fragment {}: read row {key}", fragment.name),
                    source: e,
                };

                if reduce {
                    let mut ctx = StreamContext::new(out);
                    source
                        .read_stream(&start, &layout.count, &mut |view, block| {
                            let p = kernel.stream_step(view, block, &mut ctx)?;
                            kernel.stream_finish(&mut ctx, p);
                            Ok(())
                        })
                        .map_err(read_err)?;
                } else if direct {
                    source
                        .read_to(&start, &layout.count, out.as_mut_byte_slice())
                        .map_err(read_err)?;
                } else {
                    source
                        .read_to(&start, &layout.count, &mut raw)
                        .map_err(read_err)?;

                    match (&layout.transpose, op) {
                        (Some((limits, products)), Operation::Copy) => {
                            cache_to_buffer(limits, products, &raw, out.as_mut_byte_slice(), dsz)
                        }
                        (Some((limits, products)), _) => {
                            cache_to_buffer(limits, products, &raw, &mut canonical, dsz);
                            kernel.apply(&canonical, out)?;
                        }
                        (None, _) => kernel.apply(&raw, out)?,
                    }
                }
            }

            let data = batch[..rows as usize * al].as_byte_slice();
            emit(fragment, sink, offset, rows, row_bytes, data)?;
        }

        Ok(())
    }
}

/// Hand the rows `offset..offset + rows` of the fragment to the sink.
fn emit<K: RowSink + ?Sized>(
    fragment: &Fragment,
    sink: &mut K,
    offset: u64,
    rows: u64,
    row_bytes: usize,
    data: &[u8],
) -> Result<()> {
    let first_key = fragment.key_start + offset;
    let end = if offset + rows == fragment.tuplexfrag() {
        BatchEnd::Last
    } else {
        BatchEnd::More
    };

    log::trace!(
        "{}: rows {}..={} ({:?})",
        fragment.name,
        first_key,
        first_key + rows - 1,
        end
    );

    sink.write_batch(
        fragment,
        &RowBatch {
            first_key,
            row_bytes,
            data,
        },
        end,
    )
    .map_err(|source| Error::Io {
        context: format!(
            "fragment {}: write rows {}..={}",
            fragment.name,
            first_key,
            first_key + rows - 1
        ),
        source,
    })
}

/// Resolve the operation and check the measure against the source and fragment, before
/// anything is read.
fn check<S: SourceDataset + ?Sized>(
    fragment: &Fragment,
    measure: &Measure,
    source: &S,
) -> Result<Operation> {
    measure.validate()?;
    let op = measure.operation()?;
    measure.dtype.ensure_supported()?;

    if source.dtype() != measure.dtype {
        return Err(Error::Type(format!(
            "measure {} is {:?}, source is {:?}",
            measure.name,
            measure.dtype,
            source.dtype()
        )));
    }

    let lengths = measure
        .dimensions
        .iter()
        .map(|d| d.length)
        .collect::<Vec<_>>();
    if source.shape() != lengths.as_slice() {
        return Err(Error::Invariant(format!(
            "measure {} has dimensions {:?}, source has {:?}",
            measure.name,
            lengths,
            source.shape()
        )));
    }

    let rows = measure.rows();
    if fragment.key_start < 1 || fragment.key_end < fragment.key_start || fragment.key_end > rows
    {
        return Err(Error::Invariant(format!(
            "fragment {} keys {}..={} outside of [1, {}]",
            fragment.name, fragment.key_start, fragment.key_end, rows
        )));
    }

    Ok(op)
}

/// Populate `fragment` with the default configuration.
pub fn populate<S, K>(
    fragment: &Fragment,
    measure: &Measure,
    source: &S,
    sink: &mut K,
    memory_budget: u64,
) -> Result<()>
where
    S: SourceDataset + ?Sized,
    K: RowSink + ?Sized,
{
    FragmentPopulator::default().populate(fragment, measure, source, sink, memory_budget)
}
