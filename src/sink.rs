//! Destinations for populated rows.
//!
//! A sink receives the rows of a fragment in batches of consecutive keys. The last batch of a
//! fragment is flagged with [`BatchEnd::Last`].

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;

use serde::{Deserialize, Serialize};

use crate::filters::gzip;
use crate::measure::{Fragment, Measure};

/// Rows with consecutive keys starting at `first_key`, each `row_bytes` long.
#[derive(Debug, Clone, Copy)]
pub struct RowBatch<'a> {
    pub first_key: u64,
    pub row_bytes: usize,
    pub data: &'a [u8],
}

impl<'a> RowBatch<'a> {
    pub fn rows(&self) -> usize {
        if self.row_bytes == 0 {
            0
        } else {
            self.data.len() / self.row_bytes
        }
    }

    /// Iterate over `(key, row)`.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &'a [u8])> + 'a {
        let first = self.first_key;
        let data = self.data;
        data.chunks_exact(self.row_bytes.max(1))
            .enumerate()
            .map(move |(i, r)| (first + i as u64, r))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEnd {
    /// More batches follow for this fragment.
    More,
    /// Final batch of the fragment.
    Last,
}

pub trait RowSink {
    fn write_batch(
        &mut self,
        fragment: &Fragment,
        batch: &RowBatch<'_>,
        end: BatchEnd,
    ) -> Result<(), anyhow::Error>;
}

impl<S: RowSink + ?Sized> RowSink for &mut S {
    fn write_batch(
        &mut self,
        fragment: &Fragment,
        batch: &RowBatch<'_>,
        end: BatchEnd,
    ) -> Result<(), anyhow::Error> {
        (**self).write_batch(fragment, batch, end)
    }
}

fn encode(row: &[u8], compressed: bool) -> Result<Bytes, anyhow::Error> {
    if compressed {
        Ok(Bytes::from(gzip::compress(row)?))
    } else {
        Ok(Bytes::copy_from_slice(row))
    }
}

/// Collects rows in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    compressed: bool,
    pub rows: Vec<(u64, Bytes)>,

    /// Number of rows and end marker of every batch.
    pub batches: Vec<(usize, BatchEnd)>,
}

impl MemorySink {
    pub fn new(compressed: bool) -> MemorySink {
        MemorySink {
            compressed,
            ..Default::default()
        }
    }

    pub fn keys(&self) -> Vec<u64> {
        self.rows.iter().map(|(k, _)| *k).collect()
    }

    /// Row blobs, decompressed if the sink compresses.
    pub fn decoded(&self, row_bytes: usize) -> Result<Vec<(u64, Vec<u8>)>, anyhow::Error> {
        self.rows
            .iter()
            .map(|(k, b)| Ok((*k, decode(b, self.compressed, row_bytes)?)))
            .collect()
    }
}

impl RowSink for MemorySink {
    fn write_batch(
        &mut self,
        _fragment: &Fragment,
        batch: &RowBatch<'_>,
        end: BatchEnd,
    ) -> Result<(), anyhow::Error> {
        for (key, row) in batch.iter() {
            self.rows.push((key, encode(row, self.compressed)?));
        }
        self.batches.push((batch.rows(), end));
        Ok(())
    }
}

fn decode(blob: &[u8], compressed: bool, row_bytes: usize) -> Result<Vec<u8>, anyhow::Error> {
    if compressed {
        let mut out = vec![0u8; row_bytes];
        let n = gzip::decompress(blob, &mut out)?;
        ensure!(n == row_bytes, "row decompressed to {n} bytes, expected {row_bytes}");
        Ok(out)
    } else {
        Ok(blob.to_vec())
    }
}

/// Writes rows as little-endian `(u64 key, u32 length, blob)` records.
pub struct RowFileSink<W: Write> {
    w: W,
    compressed: bool,
    rows: u64,
}

impl<W: Write> RowFileSink<W> {
    pub fn new(w: W, compressed: bool) -> RowFileSink<W> {
        RowFileSink {
            w,
            compressed,
            rows: 0,
        }
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(mut self) -> Result<W, anyhow::Error> {
        self.w.flush()?;
        Ok(self.w)
    }
}

impl<W: Write> RowSink for RowFileSink<W> {
    fn write_batch(
        &mut self,
        fragment: &Fragment,
        batch: &RowBatch<'_>,
        end: BatchEnd,
    ) -> Result<(), anyhow::Error> {
        for (key, row) in batch.iter() {
            let blob = encode(row, self.compressed)?;
            self.w.write_u64::<LittleEndian>(key)?;
            self.w.write_u32::<LittleEndian>(blob.len().try_into()?)?;
            self.w.write_all(&blob)?;
            self.rows += 1;
        }

        if end == BatchEnd::Last {
            log::debug!("{}: {} rows written", fragment.name, self.rows);
            self.w.flush()?;
        }

        Ok(())
    }
}

/// Describes the rows of a row file, stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFileDescriptor {
    pub measure: Measure,
    pub fragments: Vec<Fragment>,
    pub compressed: bool,
}

/// Reads records written by [`RowFileSink`].
pub struct RowFileReader<R: Read> {
    r: R,
}

impl<R: Read> RowFileReader<R> {
    pub fn new(r: R) -> RowFileReader<R> {
        RowFileReader { r }
    }
}

impl<R: Read> Iterator for RowFileReader<R> {
    type Item = Result<(u64, Vec<u8>), anyhow::Error>;

    fn next(&mut self) -> Option<Self::Item> {
        // only a clean end between records ends the stream
        let mut head = [0u8; 8];
        loop {
            match self.r.read(&mut head[..1]) {
                Ok(0) => return None,
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }

        let mut record = || -> Result<(u64, Vec<u8>), anyhow::Error> {
            self.r
                .read_exact(&mut head[1..])
                .map_err(|e| anyhow!("truncated row key: {e}"))?;
            let key = u64::from_le_bytes(head);
            let len = self.r.read_u32::<LittleEndian>()? as usize;
            let mut blob = vec![0u8; len];
            self.r.read_exact(&mut blob)?;
            Ok((key, blob))
        };

        Some(record())
    }
}
