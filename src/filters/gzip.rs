use libdeflater::{CompressionLvl, Compressor, Decompressor};

/// Helper to compress a slice of `u8`s with zlib framing.
pub fn compress(raw: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let mut co = Compressor::new(CompressionLvl::default());
    let mut out = vec![0; co.zlib_compress_bound(raw.len())];
    let sz = co
        .zlib_compress(raw, &mut out)
        .map_err(|_| anyhow::anyhow!("Could not compress row"))?;
    out.truncate(sz);
    Ok(out)
}

/// Helper to decompress a gzipped slice of `u8`s to another buffer of `u8`s.
pub fn decompress(compressed: &[u8], out: &mut [u8]) -> Result<usize, anyhow::Error> {
    let mut de = Decompressor::new();
    de.zlib_decompress(compressed, out)
        .map_err(|_| anyhow::anyhow!("Could not decompress row"))
}
