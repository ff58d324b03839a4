//! CSV export of the repository table

use crate::storage::{RepositoryRow, SqliteStorage};
use crate::StarlingError;
use serde::Serialize;
use std::path::Path;

/// One exported line; field order is the column order
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    github_id: &'a str,
    owner: &'a str,
    name: &'a str,
    star_count: u64,
    crawled_at: &'a str,
    updated_at: &'a str,
}

impl<'a> From<&'a RepositoryRow> for ExportRow<'a> {
    fn from(row: &'a RepositoryRow) -> Self {
        Self {
            github_id: &row.stable_id,
            owner: &row.owner,
            name: &row.name,
            star_count: row.stargazer_count,
            crawled_at: &row.crawled_at,
            updated_at: &row.updated_at,
        }
    }
}

/// Writes every stored repository to `path`, most starred first
///
/// # Returns
///
/// * `Ok(count)` - Number of data rows written (the header is not counted)
/// * `Err(StarlingError)` - The query or the file write failed
pub fn export_csv(storage: &SqliteStorage, path: &Path) -> Result<u64, StarlingError> {
    let mut writer = csv::Writer::from_path(path)?;

    // serde only emits the header with the first row
    if storage.count_repositories()? == 0 {
        writer.write_record([
            "github_id",
            "owner",
            "name",
            "star_count",
            "crawled_at",
            "updated_at",
        ])?;
    }

    let count = storage.for_each_repository(|row| -> Result<(), StarlingError> {
        writer.serialize(ExportRow::from(&row))?;
        Ok(())
    })?;

    writer.flush()?;
    tracing::info!("Exported {} repositories to {}", count, path.display());

    Ok(count)
}
