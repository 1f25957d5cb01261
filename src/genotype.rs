use std::path::Path;

use csv::ReaderBuilder;
use rusqlite::types::Value as SqlValue;

use crate::error::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    fn infer(cell: &str) -> Self {
        let cell = cell.trim();
        if cell.parse::<i64>().is_ok() {
            ColumnKind::Integer
        } else if cell.parse::<f64>().is_ok() {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text => "TEXT",
        }
    }

    fn convert(self, cell: &str) -> SqlValue {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            return SqlValue::Null;
        }
        match self {
            ColumnKind::Integer => trimmed
                .parse()
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(cell.to_string())),
            ColumnKind::Real => trimmed
                .parse()
                .map(SqlValue::Real)
                .unwrap_or_else(|_| SqlValue::Text(cell.to_string())),
            ColumnKind::Text => SqlValue::Text(cell.to_string()),
        }
    }
}

/// A CSV file loaded for import, with column names and types taken from its
/// header and first data row.
#[derive(Debug, Clone)]
pub struct CsvTable {
    pub columns: Vec<String>,
    pub kinds: Vec<ColumnKind>,
    pub key_column: usize,
    pub rows: Vec<Vec<SqlValue>>,
}

impl CsvTable {
    pub fn key_name(&self) -> &str {
        &self.columns[self.key_column]
    }
}

pub fn read_csv_table(
    path: &Path,
    key_column: usize,
) -> Result<CsvTable, CatalogError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|err| CatalogError::Csv(format!("{}: {err}", path.display())))?;

    let headers = reader
        .headers()
        .map_err(|err| CatalogError::Csv(format!("{}: {err}", path.display())))?
        .clone();
    let mut columns: Vec<String> = Vec::with_capacity(headers.len());
    for (idx, header) in headers.iter().enumerate() {
        let column = column_name(header, idx);
        if let Some(first) = columns.iter().position(|existing| *existing == column) {
            return Err(CatalogError::Csv(format!(
                "{}: headers '{}' and '{header}' both become column '{column}'",
                path.display(),
                headers.get(first).unwrap_or_default()
            )));
        }
        columns.push(column);
    }
    if key_column >= columns.len() {
        return Err(CatalogError::Csv(format!(
            "{}: key column {key_column} is out of range for {} columns",
            path.display(),
            columns.len()
        )));
    }

    let mut kinds: Option<Vec<ColumnKind>> = None;
    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record
            .map_err(|err| CatalogError::Csv(format!("{} row {}: {err}", path.display(), line + 2)))?;
        let row_kinds = kinds.get_or_insert_with(|| {
            (0..columns.len())
                .map(|idx| ColumnKind::infer(record.get(idx).unwrap_or("")))
                .collect()
        });
        rows.push(
            row_kinds
                .iter()
                .enumerate()
                .map(|(idx, kind)| kind.convert(record.get(idx).unwrap_or("")))
                .collect(),
        );
    }

    Ok(CsvTable {
        kinds: kinds.unwrap_or_else(|| vec![ColumnKind::Text; columns.len()]),
        columns,
        key_column,
        rows,
    })
}

/// Header text as a column name: lower-cased, spaces and dots turned into underscores.
pub fn column_name(header: &str, idx: usize) -> String {
    let name = header
        .trim()
        .to_lowercase()
        .replace([' ', '.'], "_");
    if name.is_empty() {
        format!("column_{idx}")
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn column_names_are_normalised() {
        assert_eq!(column_name("Marker Name", 0), "marker_name");
        assert_eq!(column_name("Chr.Pos", 1), "chr_pos");
        assert_eq!(column_name("  ", 4), "column_4");
    }

    #[test]
    fn types_follow_first_data_row() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("genes.csv");
        fs::write(&path, "Cultivar,Gene Count,Score.Mean\nPI 1,3,0.5\nPI 2,n/a,\n").unwrap();

        let table = read_csv_table(&path, 0).unwrap();
        assert_eq!(table.columns, vec!["cultivar", "gene_count", "score_mean"]);
        assert_eq!(
            table.kinds,
            vec![ColumnKind::Text, ColumnKind::Integer, ColumnKind::Real]
        );
        assert_eq!(table.rows[0][1], SqlValue::Integer(3));
        assert_eq!(table.rows[1][1], SqlValue::Text("n/a".to_string()));
        assert_eq!(table.rows[1][2], SqlValue::Null);
        assert_eq!(table.key_name(), "cultivar");
    }

    #[test]
    fn key_column_must_exist() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("markers.csv");
        fs::write(&path, "a,b\n1,2\n").unwrap();
        assert_matches!(read_csv_table(&path, 5), Err(CatalogError::Csv(_)));
    }

    #[test]
    fn colliding_headers_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("markers.csv");
        fs::write(&path, "Marker,Chr Pos,Chr.Pos\nm1,1,2\n").unwrap();
        assert_matches!(read_csv_table(&path, 0), Err(CatalogError::Csv(message)) => {
            assert!(message.contains("'Chr Pos' and 'Chr.Pos'"));
            assert!(message.contains("chr_pos"));
        });
    }
}
