/* ------------------------------------------------------------------ */
/* semantic-embeddings: image → class-embedding training on candle    */
/* ------------------------------------------------------------------ */
//
// embedding file ─► dataset ─► network / ensemble ─► Trainer ─► output
//
// The two drivers in src/bin wire these together from the command line.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod device;
pub mod embedding;
pub mod ensemble;
pub mod error;
pub mod logging;
pub mod loss;
pub mod model;
pub mod network;
pub mod ops;
pub mod optimizer;
pub mod output;
pub mod parallel;
pub mod prefetch;
pub mod schedule;
pub mod train;

pub use error::{Error, Result};
