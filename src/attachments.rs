use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::StoreError;

/// File-side collaborator for row attachments and table-level CSV assets.
///
/// The store never reads attachment contents; it only asks for directory
/// deletion when rows or tables disappear, and for the CSV files that
/// belong to a table when the table is dropped.
pub trait AttachmentStore {
    /// Recursively delete every attachment directory for the table.
    fn delete_table_attachments(&self, table_id: &str) -> Result<(), StoreError>;

    /// Recursively delete the attachment directory for one row instance.
    fn delete_instance_attachments(&self, table_id: &str, row_id: &str)
        -> Result<(), StoreError>;

    /// Files named `<table_id>.*.csv` or `<table_id>.properties.csv`.
    fn table_csv_files(&self, table_id: &str) -> Result<Vec<PathBuf>, StoreError>;
}

/// Filesystem-backed attachments rooted at an application data directory.
///
/// Layout: `<root>/tables/<table_id>/instances/<row_id>/` for row
/// attachments and `<root>/assets/csv/` for table CSVs.
pub struct FsAttachments {
    root: PathBuf,
}

impl FsAttachments {
    pub fn new(root: PathBuf) -> Self {
        FsAttachments { root }
    }

    fn table_dir(&self, table_id: &str) -> PathBuf {
        self.root.join("tables").join(table_id)
    }

    // Row ids may contain characters that are not legal in directory
    // names (uuid prefixes with ':', etc.).
    fn safe_instance_dir_name(row_id: &str) -> String {
        row_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

impl AttachmentStore for FsAttachments {
    fn delete_table_attachments(&self, table_id: &str) -> Result<(), StoreError> {
        let dir = self.table_dir(table_id);
        if dir.is_dir() {
            debug!("Deleting attachment tree: {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        for csv in self.table_csv_files(table_id)? {
            debug!("Deleting table asset: {}", csv.display());
            fs::remove_file(&csv)?;
        }
        Ok(())
    }

    fn delete_instance_attachments(
        &self,
        table_id: &str,
        row_id: &str,
    ) -> Result<(), StoreError> {
        let dir = self
            .table_dir(table_id)
            .join("instances")
            .join(Self::safe_instance_dir_name(row_id));
        if dir.is_dir() {
            debug!("Deleting attachment dir: {}", dir.display());
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn table_csv_files(&self, table_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        let csv_dir = self.root.join("assets").join("csv");
        let mut matches = Vec::new();
        if !csv_dir.is_dir() {
            return Ok(matches);
        }
        let dotted_prefix = format!("{table_id}.");
        let properties_name = format!("{table_id}.properties.csv");
        for entry in fs::read_dir(&csv_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name == properties_name {
                matches.push(entry.path());
            } else if let Some(rest) = name.strip_prefix(dotted_prefix.as_str()) {
                // `survey.csv` itself is table data, not a table asset
                if rest.ends_with(".csv") {
                    matches.push(entry.path());
                }
            }
        }
        Ok(matches)
    }
}

/// Discards every request. Used when no attachment root is configured and
/// by tests that only exercise the database.
pub struct NoopAttachments;

impl AttachmentStore for NoopAttachments {
    fn delete_table_attachments(&self, _table_id: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn delete_instance_attachments(
        &self,
        _table_id: &str,
        _row_id: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    fn table_csv_files(&self, _table_id: &str) -> Result<Vec<PathBuf>, StoreError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn csv_enumeration_matches_table_patterns() {
        let tmp = TempDir::new().unwrap();
        let csv_dir = tmp.path().join("assets").join("csv");
        fs::create_dir_all(&csv_dir).unwrap();
        for name in [
            "survey.csv",
            "survey.properties.csv",
            "survey.instances.csv",
            "surveyor.csv",
            "other.csv",
        ] {
            fs::write(csv_dir.join(name), "x").unwrap();
        }

        let atts = FsAttachments::new(tmp.path().to_path_buf());
        let mut names: Vec<String> = atts
            .table_csv_files("survey")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["survey.instances.csv", "survey.properties.csv"]
        );
    }

    #[test]
    fn instance_delete_tolerates_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let atts = FsAttachments::new(tmp.path().to_path_buf());
        atts.delete_instance_attachments("survey", "no-such-row").unwrap();

        let dir = tmp
            .path()
            .join("tables")
            .join("survey")
            .join("instances")
            .join("r1_x");
        fs::create_dir_all(&dir).unwrap();
        atts.delete_instance_attachments("survey", "r1:x").unwrap();
        assert!(!dir.exists());
    }
}
