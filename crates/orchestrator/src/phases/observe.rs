use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sheetflow_core::{codes, AnnotationKind, DataFile, ErrorCategory, Row, Sheet, TaskError};

/// Rows per sheet inspected for value-level statistics.
pub const OBSERVE_SAMPLE_ROWS: usize = 100;

fn iso_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}").expect("Invalid date regex pattern"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetSummary {
    pub file_name: String,
    pub sheet_name: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub missing_values: usize,
    pub duplicate_rows: usize,
    pub numeric_columns: Vec<String>,
    pub date_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub sheets: Vec<SheetSummary>,
    pub total_rows: usize,
    pub warnings: Vec<String>,
    pub patterns: Vec<String>,
}

impl Observation {
    /// Distinct column names across all sheets, sorted.
    pub fn available_columns(&self) -> Vec<String> {
        self.sheets
            .iter()
            .flat_map(|sheet| sheet.columns.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Compact text rendering for reasoning prompts.
    pub fn summary(&self) -> String {
        let mut lines: Vec<String> = self
            .sheets
            .iter()
            .map(|s| {
                format!(
                    "- {} / {}: {} rows, {} columns ({})",
                    s.file_name,
                    s.sheet_name,
                    s.row_count,
                    s.columns.len(),
                    s.columns.join(", ")
                )
            })
            .collect();
        lines.extend(self.patterns.iter().map(|p| format!("- {p}")));
        lines.extend(self.warnings.iter().map(|w| format!("- warning: {w}")));
        lines.join("\n")
    }
}

/// Inspects the input files. Fails only on structurally malformed input.
pub fn observe(files: &[DataFile]) -> Result<Observation, TaskError> {
    let mut observation = Observation::default();

    for file in files {
        file.validate().map_err(|err| {
            TaskError::new(
                ErrorCategory::Validation,
                codes::MALFORMED_INPUT,
                err.to_string(),
            )
        })?;

        for sheet in &file.sheets {
            let summary = summarize_sheet(&file.file_name, sheet);
            observation.total_rows += summary.row_count;

            if summary.row_count == 0 {
                observation
                    .warnings
                    .push(format!("{}/{} has no rows", file.file_name, sheet.name));
            }
            if summary.missing_values > 0 {
                observation.warnings.push(format!(
                    "{}/{} has {} missing values",
                    file.file_name, sheet.name, summary.missing_values
                ));
            }
            if summary.duplicate_rows > 0 {
                observation.warnings.push(format!(
                    "{}/{} has {} duplicate rows",
                    file.file_name, sheet.name, summary.duplicate_rows
                ));
            }
            for annotation in &sheet.annotations {
                let label = match annotation.kind {
                    AnnotationKind::Comment => "comment",
                    AnnotationKind::Note => "note",
                };
                observation.warnings.push(format!(
                    "{}/{}!{} {}: {}",
                    file.file_name, sheet.name, annotation.cell, label, annotation.text
                ));
            }

            observation.sheets.push(summary);
        }
    }

    let numeric: usize = observation.sheets.iter().map(|s| s.numeric_columns.len()).sum();
    let dates: usize = observation.sheets.iter().map(|s| s.date_columns.len()).sum();
    if numeric > 0 {
        observation
            .patterns
            .push(format!("Found {numeric} numeric columns"));
    }
    if dates > 0 {
        observation.patterns.push(format!("Found {dates} date columns"));
    }

    Ok(observation)
}

fn summarize_sheet(file_name: &str, sheet: &Sheet) -> SheetSummary {
    let columns = sheet.headers();
    let sample: Vec<&Row> = sheet.rows.iter().take(OBSERVE_SAMPLE_ROWS).collect();

    let missing_values = sample
        .iter()
        .map(|row| {
            columns
                .iter()
                .filter(|column| row.get(column.as_str()).map_or(true, is_blank))
                .count()
        })
        .sum();

    let mut seen: HashMap<String, usize> = HashMap::new();
    for row in &sample {
        let key = serde_json::to_string(row).unwrap_or_default();
        *seen.entry(key).or_default() += 1;
    }
    let duplicate_rows = seen.values().map(|n| n - 1).sum();

    let numeric_columns = columns
        .iter()
        .filter(|column| column_matches(&sample, column, is_numeric))
        .cloned()
        .collect();
    let date_columns = columns
        .iter()
        .filter(|column| column_matches(&sample, column, is_date))
        .cloned()
        .collect();

    SheetSummary {
        file_name: file_name.to_string(),
        sheet_name: sheet.name.clone(),
        row_count: sheet.rows.len(),
        columns,
        missing_values,
        duplicate_rows,
        numeric_columns,
        date_columns,
    }
}

/// True when the column has at least one value and every non-blank value passes.
fn column_matches(sample: &[&Row], column: &str, test: fn(&Value) -> bool) -> bool {
    let mut values = sample
        .iter()
        .filter_map(|row| row.get(column))
        .filter(|value| !is_blank(value))
        .peekable();
    values.peek().is_some() && values.all(test)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn is_numeric(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_date(value: &Value) -> bool {
    matches!(value, Value::String(s) if iso_date().is_match(s.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn sales() -> DataFile {
        DataFile::new("sales.xlsx").with_sheet(
            Sheet::new(
                "Q1",
                vec![
                    row(json!({"X": 1, "date": "2024-01-01", "name": "a"})),
                    row(json!({"X": "2.5", "date": "2024-01-02", "name": null})),
                    row(json!({"X": 1, "date": "2024-01-01", "name": "a"})),
                ],
            )
            .with_annotation("B2", AnnotationKind::Comment, "Prices exclude VAT"),
        )
    }

    #[test]
    fn test_counts_and_patterns() {
        let observation = observe(&[sales()]).unwrap();
        let sheet = &observation.sheets[0];

        assert_eq!(observation.total_rows, 3);
        assert_eq!(sheet.columns, vec!["X", "date", "name"]);
        assert_eq!(sheet.missing_values, 1);
        assert_eq!(sheet.duplicate_rows, 1);
        assert_eq!(sheet.numeric_columns, vec!["X"]);
        assert_eq!(sheet.date_columns, vec!["date"]);
        assert!(observation.patterns.contains(&"Found 1 numeric columns".to_string()));
        assert!(observation.patterns.contains(&"Found 1 date columns".to_string()));
    }

    #[test]
    fn test_annotations_surface_as_warnings() {
        let observation = observe(&[sales()]).unwrap();
        assert!(observation
            .warnings
            .iter()
            .any(|w| w.contains("B2 comment: Prices exclude VAT")));
        assert!(observation.summary().contains("Prices exclude VAT"));
    }

    #[test]
    fn test_malformed_file_is_validation_error() {
        let file = DataFile::new("dup.xlsx")
            .with_sheet(Sheet::new("S", Vec::new()))
            .with_sheet(Sheet::new("S", Vec::new()));
        let error = observe(&[file]).unwrap_err();
        assert_eq!(error.category, ErrorCategory::Validation);
        assert!(error.is(codes::MALFORMED_INPUT));
    }

    #[test]
    fn test_empty_sheet_is_a_warning() {
        let file = DataFile::new("e.xlsx").with_sheet(Sheet::new("S", Vec::new()));
        let observation = observe(&[file]).unwrap();
        assert_eq!(observation.total_rows, 0);
        assert!(observation.warnings[0].contains("no rows"));
    }

    #[test]
    fn test_available_columns_are_distinct() {
        let other = DataFile::new("b.xlsx")
            .with_sheet(Sheet::new("S", vec![row(json!({"X": 1, "Y": 2}))]));
        let observation = observe(&[sales(), other]).unwrap();
        assert_eq!(observation.available_columns(), vec!["X", "Y", "date", "name"]);
    }
}
