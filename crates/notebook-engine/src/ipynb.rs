//! Jupyter notebook (nbformat 4.5) export and import.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::cell::{Cell, CellId, CellKind, Notebook};
use crate::error::ImportError;

#[derive(Debug, Serialize)]
struct NotebookFile<'a> {
    metadata: Value,
    nbformat: u32,
    nbformat_minor: u32,
    cells: Vec<ExportedCell<'a>>,
}

#[derive(Debug, Serialize)]
struct ExportedCell<'a> {
    cell_type: CellKind,
    id: &'a str,
    metadata: Value,
    source: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_count: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<Vec<Value>>,
}

fn file_metadata() -> Value {
    json!({
        "kernelspec": {
            "display_name": "Python 3",
            "language": "python",
            "name": "python3"
        },
        "language_info": {
            "codemirror_mode": { "name": "ipython", "version": 3 },
            "file_extension": ".py",
            "mimetype": "text/x-python",
            "name": "python",
            "nbconvert_exporter": "python",
            "pygments_lexer": "ipython3",
            "version": "3.11"
        }
    })
}

/// Serialize the notebook as pretty-printed `.ipynb` JSON. Outputs are not exported.
pub fn export(notebook: &Notebook) -> Result<String, serde_json::Error> {
    let cells = notebook
        .cells()
        .iter()
        .map(|cell| {
            let is_code = cell.kind == CellKind::Code;
            let metadata = if cell.code_hidden {
                json!({ "jupyter": { "source_hidden": true } })
            } else {
                json!({})
            };
            ExportedCell {
                cell_type: cell.kind,
                id: cell.id.as_str(),
                metadata,
                source: cell.source.split_inclusive('\n').collect(),
                execution_count: is_code.then_some(Value::Null),
                outputs: is_code.then(Vec::new),
            }
        })
        .collect();
    serde_json::to_string_pretty(&NotebookFile {
        metadata: file_metadata(),
        nbformat: 4,
        nbformat_minor: 5,
        cells,
    })
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Source {
    Text(String),
    Lines(Vec<String>),
}

impl Default for Source {
    fn default() -> Self {
        Source::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
struct ImportedCell {
    #[serde(default)]
    cell_type: String,
    #[serde(default)]
    source: Source,
    #[serde(default)]
    metadata: Value,
}

/// Parse `.ipynb` JSON into fresh cells. Anything that is not markdown
/// becomes a code cell; outputs are dropped.
pub fn import(json: &str) -> Result<Vec<Cell>, ImportError> {
    let mut file: Value = serde_json::from_str(json)?;
    let cells = match file.get_mut("cells").map(Value::take) {
        Some(cells @ Value::Array(_)) => cells,
        _ => return Err(ImportError::MissingCells),
    };
    let cells: Vec<ImportedCell> = serde_json::from_value(cells)?;
    Ok(cells
        .into_iter()
        .map(|imported| {
            let kind = match imported.cell_type.as_str() {
                "markdown" => CellKind::Markdown,
                _ => CellKind::Code,
            };
            let source = match imported.source {
                Source::Text(text) => text,
                Source::Lines(lines) => lines.concat(),
            };
            let mut cell = Cell::with_id(CellId::generate(), kind, source);
            cell.code_hidden = imported
                .metadata
                .pointer("/jupyter/source_hidden")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            cell
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_and_sources(cells: &[Cell]) -> Vec<(CellKind, String)> {
        cells.iter().map(|c| (c.kind, c.source.clone())).collect()
    }

    #[test]
    fn test_export_shape() {
        let mut hidden = Cell::with_id(CellId::from("c1"), CellKind::Code, "x = 1\nprint(x)\n");
        hidden.code_hidden = true;
        hidden.output.text = "1\n".into();
        let notebook = Notebook::from_cells(vec![
            hidden,
            Cell::with_id(CellId::from("m1"), CellKind::Markdown, "# Title"),
        ]);
        let value: Value = serde_json::from_str(&export(&notebook).unwrap()).unwrap();

        assert_eq!(value["nbformat"], 4);
        assert_eq!(value["nbformat_minor"], 5);
        assert_eq!(value["metadata"]["kernelspec"]["name"], "python3");

        let code = &value["cells"][0];
        assert_eq!(code["cell_type"], "code");
        assert_eq!(code["id"], "c1");
        assert_eq!(code["source"], json!(["x = 1\n", "print(x)\n"]));
        assert_eq!(code["execution_count"], Value::Null);
        assert_eq!(code["outputs"], json!([]));
        assert_eq!(code["metadata"]["jupyter"]["source_hidden"], true);

        let markdown = &value["cells"][1];
        assert_eq!(markdown["cell_type"], "markdown");
        assert!(markdown.get("outputs").is_none());
        assert!(markdown.get("execution_count").is_none());
    }

    #[test]
    fn test_export_then_import_preserves_cells() {
        let notebook = Notebook::from_cells(vec![
            Cell::new(CellKind::Code, "for i in range(3):\n    print(i)"),
            Cell::new(CellKind::Markdown, "## Notes\n\n- one\n"),
            Cell::new(CellKind::Code, ""),
        ]);
        let cells = import(&export(&notebook).unwrap()).unwrap();
        assert_eq!(kinds_and_sources(&cells), kinds_and_sources(notebook.cells()));
    }

    #[test]
    fn test_import_string_source_and_unknown_kind() {
        let json = r#"{"cells": [
            {"cell_type": "raw", "source": "plain"},
            {"cell_type": "markdown", "source": ["a\n", "b"], "metadata": {"jupyter": {"source_hidden": true}}}
        ]}"#;
        let cells = import(json).unwrap();
        assert_eq!(
            kinds_and_sources(&cells),
            vec![(CellKind::Code, "plain".into()), (CellKind::Markdown, "a\nb".into())]
        );
        assert!(!cells[0].code_hidden);
        assert!(cells[1].code_hidden);
        assert_ne!(cells[0].id, cells[1].id);
    }

    #[test]
    fn test_import_missing_cells() {
        match import(r#"{"metadata": {}}"#) {
            Err(ImportError::MissingCells) => {}
            other => panic!("Expected MissingCells, got {other:?}"),
        }
        match import(r#"{"cells": "nope"}"#) {
            Err(ImportError::MissingCells) => {}
            other => panic!("Expected MissingCells, got {other:?}"),
        }
    }

    #[test]
    fn test_import_not_json() {
        match import("not a notebook") {
            Err(ImportError::Json(_)) => {}
            other => panic!("Expected Json error, got {other:?}"),
        }
    }
}
