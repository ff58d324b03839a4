//! Output module for reporting on the crawl database
//!
//! This module handles:
//! - Printing repository and partition statistics
//! - Exporting the repository table as CSV

mod export;
pub mod stats;

pub use export::export_csv;
pub use stats::{load_statistics, print_statistics, CrawlStatistics};
