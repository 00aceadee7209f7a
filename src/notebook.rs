use regex::Regex;
use serde::Deserialize;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Jupyter stores cell sources as either one string or a list of lines.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceText {
    Text(String),
    Lines(Vec<String>),
}

impl Default for SourceText {
    fn default() -> SourceText {
        SourceText::Text(String::new())
    }
}

impl SourceText {
    fn into_text(self) -> String {
        match self {
            SourceText::Text(text) => text,
            SourceText::Lines(lines) => lines.concat(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawNotebook {
    #[serde(default)]
    cells: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    cell_type: String,
    #[serde(default)]
    source: SourceText,
    #[serde(default)]
    outputs: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    output_type: String,
    #[serde(default)]
    ename: Option<String>,
    #[serde(default)]
    evalue: Option<String>,
    #[serde(default)]
    traceback: Vec<String>,
}

/// Resolves the "current" notebook: an explicit path wins; otherwise the most
/// recently modified `.ipynb` in the working directory.
pub fn find_notebook(path_override: &Option<String>) -> Result<PathBuf, Box<dyn Error>> {
    if let Some(path) = path_override {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(format!("notebook not found: {}", path.display()).into());
        }
        return Ok(path);
    }
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in fs::read_dir(".")? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ipynb") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().map(|(m, _)| modified > *m).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    newest
        .map(|(_, path)| path)
        .ok_or_else(|| "no .ipynb notebook found in the current directory (use --notebook)".into())
}

/// Joins the source of every code cell, in notebook order.
pub fn extract_code(path: &PathBuf) -> Result<String, Box<dyn Error>> {
    let notebook: RawNotebook = serde_json::from_str(&fs::read_to_string(path)?)?;
    let code: Vec<String> = notebook
        .cells
        .into_iter()
        .filter(|cell| cell.cell_type == "code")
        .map(|cell| cell.source.into_text())
        .filter(|source| !source.trim().is_empty())
        .collect();
    Ok(code.join("\n\n"))
}

/// Returns the most recent error output recorded in the notebook, or `None`
/// if no cell has errored.
pub fn last_error(path: &PathBuf) -> Result<Option<String>, Box<dyn Error>> {
    let notebook: RawNotebook = serde_json::from_str(&fs::read_to_string(path)?)?;
    let mut last: Option<String> = None;
    for cell in notebook.cells {
        for output in cell.outputs {
            if output.output_type != "error" {
                continue;
            }
            let text = if output.traceback.is_empty() {
                format!(
                    "{}: {}",
                    output.ename.unwrap_or_default(),
                    output.evalue.unwrap_or_default()
                )
            } else {
                strip_ansi(&output.traceback.join("\n"))
            };
            last = Some(text);
        }
    }
    Ok(last)
}

/// IPython tracebacks embed terminal color codes.
fn strip_ansi(text: &str) -> String {
    static ANSI_RE: OnceLock<Regex> = OnceLock::new();
    let re = ANSI_RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
    re.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE_NOTEBOOK: &str = r##"{
        "cells": [
            {"cell_type": "markdown", "source": "# Title", "metadata": {}},
            {"cell_type": "code", "source": ["import os\n", "print(os.getcwd())"],
             "outputs": [], "metadata": {}},
            {"cell_type": "code", "source": "x = 1 / 0",
             "outputs": [
                {"output_type": "stream", "text": "..."},
                {"output_type": "error", "ename": "ZeroDivisionError",
                 "evalue": "division by zero",
                 "traceback": ["\u001b[0;31mZeroDivisionError\u001b[0m", "division by zero"]}
             ], "metadata": {}}
        ],
        "metadata": {}, "nbformat": 4, "nbformat_minor": 5
    }"##;

    #[test]
    fn test_extract_code_handles_both_source_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.ipynb");
        fs::write(&path, SAMPLE_NOTEBOOK).unwrap();
        let code = extract_code(&path).unwrap();
        assert_eq!(code, "import os\nprint(os.getcwd())\n\nx = 1 / 0");
    }

    #[test]
    fn test_last_error_strips_ansi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.ipynb");
        fs::write(&path, SAMPLE_NOTEBOOK).unwrap();
        let error = last_error(&path).unwrap().unwrap();
        assert_eq!(error, "ZeroDivisionError\ndivision by zero");
    }

    #[test]
    fn test_last_error_none_when_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.ipynb");
        fs::write(
            &path,
            r#"{"cells": [{"cell_type": "code", "source": "x = 1", "outputs": []}]}"#,
        )
        .unwrap();
        assert!(last_error(&path).unwrap().is_none());
    }

    #[test]
    fn test_find_notebook_prefers_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.ipynb");
        fs::write(&path, "{}").unwrap();
        let found = find_notebook(&Some(path.to_str().unwrap().to_string())).unwrap();
        assert_eq!(found, path);
    }

    #[test]
    fn test_find_notebook_missing_override_errors() {
        assert!(find_notebook(&Some("/definitely/not/here.ipynb".to_string())).is_err());
    }
}
