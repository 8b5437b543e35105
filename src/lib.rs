//! Search a seed-derived pseudorandom boolean field for cells whose
//! annular neighborhood crosses a density threshold.
//!
//! The field assigns every integer grid cell a deterministic boolean
//! (about one cell in ten is positive). A search walks a square around
//! the origin and reports each cell whose surrounding annulus, between an
//! inner and an outer radius, contains enough (or few enough) positive
//! cells. Two backends produce identical result sets:
//!
//! * [`search::CpuSearcher`] partitions the square into column strips,
//!   one worker thread each, and slides a ring-buffered window down every
//!   column.
//! * [`gpu::GpuSearcher`] tiles the square into device dispatches and
//!   counts on the GPU, reading matches back between tiles.
//!
//! [`search::run_search`] picks a backend and streams matches into a
//! [`search::ClusterSink`].

pub mod error;
pub mod field;
pub mod geometry;
pub mod gpu;
pub mod search;
pub mod util;

pub use error::SearchError;
pub use field::Field;
pub use geometry::{isqrt, AnnulusMask};
pub use gpu::{CountStrategy, GpuContext, GpuSearcher};
pub use search::{
    run_search, Backend, Cluster, ClusterSink, CollectingSink, CpuSearcher, SearchParams, WorkerId,
};
