//! Tabular input model: data files, sheets, per-cell annotations, and the
//! views derived from them for the reasoning service and the sandbox.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// One spreadsheet row keyed by column header.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Number of sample rows included in a sheet preview.
pub const PREVIEW_SAMPLE_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    Comment,
    Note,
}

/// A comment or note attached to a single cell, e.g. `B7`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellAnnotation {
    pub cell: String,
    pub kind: AnnotationKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Sheet {
    pub name: String,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default)]
    pub annotations: Vec<CellAnnotation>,
}

impl Sheet {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self {
            name: name.into(),
            rows,
            annotations: Vec::new(),
        }
    }

    pub fn with_annotation(
        mut self,
        cell: impl Into<String>,
        kind: AnnotationKind,
        text: impl Into<String>,
    ) -> Self {
        self.annotations.push(CellAnnotation {
            cell: cell.into(),
            kind,
            text: text.into(),
        });
        self
    }

    /// Column headers, taken from the first row.
    pub fn headers(&self) -> Vec<String> {
        self.rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataFile {
    pub id: Uuid,
    pub file_name: String,
    #[serde(default)]
    pub sheets: Vec<Sheet>,
    #[serde(default)]
    pub current_sheet: Option<String>,
}

impl DataFile {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            sheets: Vec::new(),
            current_sheet: None,
        }
    }

    pub fn with_sheet(mut self, sheet: Sheet) -> Self {
        if self.current_sheet.is_none() {
            self.current_sheet = Some(sheet.name.clone());
        }
        self.sheets.push(sheet);
        self
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    /// Rejects structurally malformed files: unnamed or duplicate sheets.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for sheet in &self.sheets {
            if sheet.name.trim().is_empty() {
                return Err(CoreError::MalformedDataFile {
                    file: self.file_name.clone(),
                    reason: "sheet with empty name".to_string(),
                });
            }
            if !seen.insert(sheet.name.as_str()) {
                return Err(CoreError::MalformedDataFile {
                    file: self.file_name.clone(),
                    reason: format!("duplicate sheet name '{}'", sheet.name),
                });
            }
        }
        Ok(())
    }

    /// Builds the reasoning-service preview, or `None` when every sheet is empty.
    pub fn preview(&self) -> Option<FilePreview> {
        let sheets: Vec<SheetPreview> = self
            .sheets
            .iter()
            .filter(|sheet| !sheet.is_empty())
            .map(|sheet| SheetPreview {
                name: sheet.name.clone(),
                headers: sheet.headers(),
                sample_rows: sheet.rows.iter().take(PREVIEW_SAMPLE_ROWS).cloned().collect(),
                row_count: sheet.rows.len(),
                annotations: sheet.annotations.clone(),
            })
            .collect();

        if sheets.is_empty() {
            return None;
        }

        Some(FilePreview {
            file_name: self.file_name.clone(),
            current_sheet: self.current_sheet.clone(),
            sheets,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SheetPreview {
    pub name: String,
    pub headers: Vec<String>,
    pub sample_rows: Vec<Row>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<CellAnnotation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilePreview {
    pub file_name: String,
    pub current_sheet: Option<String>,
    pub sheets: Vec<SheetPreview>,
}

/// The shape a file takes when handed to the execution sandbox.
///
/// Single-sheet files travel as a bare row array, multi-sheet files as a map
/// keyed by sheet name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Dataset {
    SingleSheet(Vec<Row>),
    MultiSheet(BTreeMap<String, Vec<Row>>),
}

impl Dataset {
    /// Picks the shape from the number of sheets; `None` for a file without sheets.
    pub fn from_file(file: &DataFile) -> Option<Self> {
        match file.sheets.len() {
            0 => None,
            1 => Some(Self::SingleSheet(file.sheets[0].rows.clone())),
            _ => Some(Self::MultiSheet(
                file.sheets
                    .iter()
                    .map(|sheet| (sheet.name.clone(), sheet.rows.clone()))
                    .collect(),
            )),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            Self::SingleSheet(rows) => rows.len(),
            Self::MultiSheet(sheets) => sheets.values().map(Vec::len).sum(),
        }
    }
}

/// Datasets keyed by file name, as passed to the sandbox.
pub type Datasets = BTreeMap<String, Dataset>;

pub fn materialize_datasets(files: &[DataFile]) -> Datasets {
    files
        .iter()
        .filter_map(|file| Dataset::from_file(file).map(|ds| (file.file_name.clone(), ds)))
        .collect()
}
