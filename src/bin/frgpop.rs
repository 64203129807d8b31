//! Populate fragments from a NetCDF variable into a row file.
//!
//! ```bash
//! frgpop tas.nc tas tas.rows --explicit lat,lon --implicit time \
//!     --subset lat=-30:30 --subset-type coord --operation avg --fragment-rows 1000
//! ```
//!
//! The descriptor of the rows is written as bincode next to the output, with the extension
//! replaced by `idx`.
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[macro_use]
extern crate anyhow;

use fragpop::measure::Dimension;
use fragpop::prelude::*;
use fragpop::sink::RowFileDescriptor;

#[derive(Parser, Debug)]
#[command(about = "Populate fragments from a NetCDF variable")]
struct Args {
    input: PathBuf,

    variable: String,

    output: PathBuf,

    /// Element type of the rows
    #[arg(long, value_enum, default_value = "f32")]
    dtype: ElementType,

    /// Explicit dimensions, outermost first
    #[arg(long, value_delimiter = ',', required = true)]
    explicit: Vec<String>,

    /// Implicit dimensions, outermost first [default: the remaining dimensions in storage order]
    #[arg(long, value_delimiter = ',')]
    implicit: Vec<String>,

    /// Subset of a dimension, e.g. `lat=-30:30` (repeatable)
    #[arg(long)]
    subset: Vec<String>,

    #[arg(long, value_enum, default_value = "index")]
    subset_type: SubsetType,

    /// Operation applied to every row
    #[arg(long)]
    operation: Option<String>,

    /// Scalar arguments of the operation
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true)]
    args: Vec<f64>,

    /// Fill value excluded from reductions
    #[arg(long, allow_negative_numbers = true)]
    fill: Option<f64>,

    /// Rows per fragment [default: all rows in one fragment]
    #[arg(long)]
    fragment_rows: Option<u64>,

    /// Memory budget in MiB
    #[arg(long, default_value_t = 256)]
    memory: u64,

    /// Compress every row
    #[arg(long)]
    compress: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ElementType {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl From<ElementType> for Datatype {
    fn from(t: ElementType) -> Datatype {
        match t {
            ElementType::I8 => Datatype::Int(1),
            ElementType::I16 => Datatype::Int(2),
            ElementType::I32 => Datatype::Int(4),
            ElementType::I64 => Datatype::Int(8),
            ElementType::F32 => Datatype::Float(4),
            ElementType::F64 => Datatype::Float(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SubsetType {
    Index,
    Coord,
}

fn measure(args: &Args, source: &NetcdfSource) -> Result<Measure, anyhow::Error> {
    let names = source.dimensions();

    for d in args.explicit.iter().chain(&args.implicit) {
        ensure!(names.contains(d), "variable has no dimension {d}");
    }

    let mut next_implicit = 1;
    let mut dimensions = Vec::with_capacity(names.len());

    for (name, &length) in names.iter().zip(source.shape()) {
        let dim = if let Some(i) = args.explicit.iter().position(|d| d == name) {
            Dimension::explicit(name, length, i as u32 + 1)
        } else if let Some(i) = args.implicit.iter().position(|d| d == name) {
            Dimension::implicit(name, length, i as u32 + 1)
        } else if args.implicit.is_empty() {
            next_implicit += 1;
            Dimension::implicit(name, length, next_implicit - 1)
        } else {
            bail!("dimension {name} is neither explicit nor implicit");
        };

        dimensions.push(dim);
    }

    for s in &args.subset {
        let (name, filter) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("subset {s} is not of the form name=filter"))?;
        let dim = dimensions
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| anyhow!("no dimension {name} to subset"))?;

        match args.subset_type {
            SubsetType::Index => dim.apply_index_filter(filter)?,
            SubsetType::Coord => dim.apply_filter(filter, &source.coordinates(name)?)?,
        }
    }

    let dtype = args.dtype.into();
    let mut m = Measure::new(&args.variable, dtype, dimensions);

    if let Some(op) = &args.operation {
        m = m.with_operation(op, &args.args);
    }

    if let Some(fill) = args.fill {
        m = fragpop::dispatch!(dtype, T => m.with_fill(T::narrow(fill)))?;
    }

    m.validate()?;
    Ok(m)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    println!("Opening {}:{}..", args.input.display(), args.variable);
    let source = NetcdfSource::open(&args.input, &args.variable, args.dtype.into())?;

    let measure = measure(&args, &source)?;
    let rows = measure.rows();
    let fragments = Fragment::split("frag", rows, args.fragment_rows.unwrap_or(rows));

    println!(
        "Populating {} rows of {} elements in {} fragments..",
        rows,
        measure.array_length(&measure.operation()?),
        fragments.len()
    );

    let f = File::create(&args.output)?;
    let mut sink = RowFileSink::new(BufWriter::new(f), args.compress);
    let populator = FragmentPopulator::default();

    for fragment in &fragments {
        populator.populate(fragment, &measure, &source, &mut sink, args.memory << 20)?;
        println!("{:4}{}: {}..={}", "", fragment.name, fragment.key_start, fragment.key_end);
    }
    sink.into_inner()?;

    let fidx = args.output.with_extension("idx");
    println!("Writing descriptor to {} (as bincode)..", fidx.display());
    let descriptor = RowFileDescriptor {
        measure,
        fragments,
        compressed: args.compress,
    };
    bincode::serialize_into(BufWriter::new(File::create(fidx)?), &descriptor)?;

    println!("Done.");

    Ok(())
}
