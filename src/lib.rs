//! Metabolite QTL scan: metabolite cleaning, Bonferroni variant selection from a first-pass
//! genome-wide test, an exhaustive variant x metabolite regression scan, and preparation of
//! the significant pairs for a Manhattan plot.

pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod manhattan;
pub mod matrix;
pub mod pipeline;
pub mod preprocess;
pub mod results;
pub mod selector;

pub use error::{MqtlError, Result};
