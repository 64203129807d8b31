//! NetCDF variables as source datasets.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use byte_slice_cast::AsByteSlice;
use itertools::izip;

use super::{region_len, SourceDataset};
use crate::dispatch;
use crate::types::Datatype;

/// A variable of a NetCDF file, read as `dtype` regardless of how it is stored.
///
/// The file is opened once and its handle shared between readers, one read at a time.
pub struct NetcdfSource {
    file: Mutex<::netcdf::File>,
    variable: String,
    dtype: Datatype,
    shape: Vec<u64>,
    dimensions: Vec<String>,
}

impl NetcdfSource {
    pub fn open<P: AsRef<Path>>(
        path: P,
        variable: &str,
        dtype: Datatype,
    ) -> Result<NetcdfSource, anyhow::Error> {
        dtype.ensure_supported()?;

        let file = ::netcdf::open(path.as_ref())?;
        let (shape, dimensions) = {
            let var = file
                .variable(variable)
                .ok_or_else(|| anyhow!("no variable {variable} in {:?}", path.as_ref()))?;

            let shape: Vec<u64> = var.dimensions().iter().map(|d| d.len() as u64).collect();
            let dimensions: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
            (shape, dimensions)
        };

        log::debug!("opened {:?}: {variable} {:?}", path.as_ref(), shape);

        Ok(NetcdfSource {
            file: Mutex::new(file),
            variable: variable.to_string(),
            dtype,
            shape,
            dimensions,
        })
    }

    /// Names of the variable dimensions in storage order.
    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    fn file(&self) -> Result<MutexGuard<'_, ::netcdf::File>, anyhow::Error> {
        self.file
            .lock()
            .map_err(|_| anyhow!("netcdf file handle poisoned by a failed read"))
    }

    /// Values of the coordinate variable of `dimension`.
    pub fn coordinates(&self, dimension: &str) -> Result<Vec<f64>, anyhow::Error> {
        let file = self.file()?;
        let var = file
            .variable(dimension)
            .ok_or_else(|| anyhow!("no coordinate variable for dimension {dimension}"))?;

        Ok(var.get_values::<f64, _>(..)?)
    }
}

impl SourceDataset for NetcdfSource {
    fn dtype(&self) -> Datatype {
        self.dtype
    }

    fn shape(&self) -> &[u64] {
        &self.shape
    }

    fn read_to(
        &self,
        start: &[u64],
        count: &[u64],
        dst: &mut [u8],
    ) -> Result<usize, anyhow::Error> {
        let n = region_len(&self.shape, start, count)? as usize;
        let vsz = n * self.dtype.dsize();

        ensure!(
            dst.len() >= vsz,
            "destination buffer has insufficient capacity"
        );

        let file = self.file()?;
        let var = file
            .variable(&self.variable)
            .ok_or_else(|| anyhow!("variable {} disappeared", self.variable))?;

        let extents = izip!(start, count)
            .map(|(&s, &c)| (s as usize..(s + c) as usize).into())
            .collect::<Vec<::netcdf::Extent>>();

        dispatch!(self.dtype, T => {
            let values = var.get_values::<T, _>(extents)?;
            dst[..vsz].copy_from_slice(values.as_byte_slice());
        })?;

        Ok(vsz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::typed;
    use std::path::PathBuf;

    fn fixture(dir: &Path) -> PathBuf {
        let path = dir.join("tas.nc");
        let mut file = ::netcdf::create(&path).unwrap();
        file.add_dimension("time", 3).unwrap();
        file.add_dimension("lat", 2).unwrap();

        let mut lat = file.add_variable::<f64>("lat", &["lat"]).unwrap();
        lat.put_values(&[-45.0, 45.0], ..).unwrap();

        let mut tas = file.add_variable::<f32>("tas", &["time", "lat"]).unwrap();
        tas.put_values(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], ..)
            .unwrap();
        path
    }

    #[test]
    fn read_hyperslab() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());

        let src = NetcdfSource::open(&path, "tas", Datatype::Float(4)).unwrap();
        assert_eq!(src.shape(), [3, 2]);
        assert_eq!(src.dimensions(), ["time", "lat"]);
        assert_eq!(src.coordinates("lat").unwrap(), [-45.0, 45.0]);

        let b = src.read(&[1, 1], &[2, 1]).unwrap();
        assert_eq!(&*typed::<f32>(&b).unwrap(), &[4.0, 6.0]);

        // converted on read
        let src = NetcdfSource::open(&path, "tas", Datatype::Float(8)).unwrap();
        let b = src.read(&[0, 0], &[1, 2]).unwrap();
        assert_eq!(&*typed::<f64>(&b).unwrap(), &[1.0, 2.0]);

        assert!(NetcdfSource::open(&path, "pr", Datatype::Float(4)).is_err());
        assert!(NetcdfSource::open(&path, "tas", Datatype::UInt(4)).is_err());
    }

    #[test]
    fn handle_outlives_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());

        let src = NetcdfSource::open(&path, "tas", Datatype::Float(4)).unwrap();
        std::fs::rename(&path, dir.path().join("moved.nc")).unwrap();
        assert!(!path.exists());

        let b = src.read(&[0, 0], &[3, 2]).unwrap();
        assert_eq!(
            &*typed::<f32>(&b).unwrap(),
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        assert_eq!(src.coordinates("lat").unwrap(), [-45.0, 45.0]);
        assert!(src.coordinates("lon").is_err());
    }
}
