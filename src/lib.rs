pub mod checkpoint;
pub mod config;
pub mod ellipsoid;
pub mod error;
pub mod estimate;
pub mod executor;
#[cfg(feature = "csv")]
pub mod io;
pub mod neural;
pub mod points;
pub mod sampler;
pub mod shell;
pub mod union;
