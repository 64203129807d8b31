//! List a summary of a row file and its descriptor to stdout.
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use clap::Parser;

use fragpop::sink::{RowFileDescriptor, RowFileReader};

#[derive(Parser, Debug)]
#[command(about = "List the rows of a row file")]
struct Args {
    input: PathBuf,

    /// Print every row
    #[arg(long)]
    rows: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let fidx = args.input.with_extension("idx");
    println!("Loading descriptor from {}..", fidx.display());

    let descriptor: RowFileDescriptor =
        bincode::deserialize_from(BufReader::new(File::open(&fidx)?))?;
    let m = &descriptor.measure;

    println!(
        "Measure {} ({:?}), operation: {}, compressed: {}\n",
        m.name,
        m.dtype,
        m.operation.as_deref().unwrap_or("none"),
        descriptor.compressed
    );
    println!("{:4}{:20} {:>10} {:>8} {:>8} level:", "", "dimension:", "length:", "start:", "end:");
    for d in &m.dimensions {
        println!(
            "{:4}{:20} {:>10} {:>8} {:>8} {}{}",
            "",
            d.name,
            d.length,
            d.start_index,
            d.end_index,
            if d.explicit { "exp " } else { "imp " },
            d.oph_level
        );
    }

    println!("\nFragments:");
    for f in &descriptor.fragments {
        println!("{:4}{:20} {}..={}", "", f.name, f.key_start, f.key_end);
    }

    let mut n = 0u64;
    let mut bytes = 0u64;
    let mut keys: Option<(u64, u64)> = None;

    for row in RowFileReader::new(BufReader::new(File::open(&args.input)?)) {
        let (key, blob) = row?;

        if args.rows {
            println!("{:4}{:>10}: {} bytes", "", key, blob.len());
        }

        n += 1;
        bytes += blob.len() as u64;
        keys = Some(keys.map_or((key, key), |(lo, hi)| (lo.min(key), hi.max(key))));
    }

    println!("\nRows: {n}, blob bytes: {bytes}");
    if let Some((lo, hi)) = keys {
        println!("Keys: {lo}..={hi}");
    }

    Ok(())
}
