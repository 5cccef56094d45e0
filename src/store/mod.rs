//! Analytical store - the `sales` table and its generations
//!
//! SQLite file under the data directory. A run writes into a staging
//! table and swaps it in on commit; readers query the live table.

pub mod export;
pub mod loader;
pub mod query;

pub use export::{export_records, ExportFormat};
pub use loader::{GenerationReport, LoadReport, Loader, SALES_TABLE};
pub use query::{BoroughStats, GenerationInfo};
