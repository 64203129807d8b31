pub mod gzip;
pub mod transpose;
