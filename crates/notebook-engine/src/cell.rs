use std::cell::Cell as Counter;
use std::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Opaque, stable cell identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(String);

thread_local! {
    static FALLBACK_IDS: Counter<u64> = const { Counter::new(0) };
}

impl CellId {
    /// A fresh random id: 16 hex characters.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            // No entropy source; fall back to a process-local sequence.
            let n = FALLBACK_IDS.with(|c| {
                c.set(c.get() + 1);
                c.get()
            });
            bytes = n.to_be_bytes();
        }
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CellId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CellId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Cell
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// Everything the last run of a cell produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    /// Streamed stdout and stderr, interleaved as they arrived, plus the echoed result.
    pub text: String,
    /// The stderr stream on its own.
    pub stderr: String,
    pub error: Option<String>,
    /// Base64-encoded PNG figures.
    pub images: Vec<String>,
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub source: String,
    pub state: RunState,
    pub output: CellOutput,
    pub code_hidden: bool,
    pub output_hidden: bool,
    /// Number of the last run in this session, if any.
    pub execution_count: Option<u32>,
}

impl RunState {
    pub fn name(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
            RunState::Stopped => "stopped",
        }
    }
}

impl Cell {
    pub fn new(kind: CellKind, source: impl Into<String>) -> Self {
        Self::with_id(CellId::generate(), kind, source)
    }

    pub fn with_id(id: CellId, kind: CellKind, source: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            source: source.into(),
            state: RunState::Idle,
            output: CellOutput::default(),
            code_hidden: false,
            output_hidden: false,
            execution_count: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn clear_output(&mut self) {
        self.output = CellOutput::default();
    }
}

// ----------------------------------------------------------------------------
// Notebook
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveDirection {
    Up,
    Down,
}

/// The ordered cell list.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Notebook {
    cells: Vec<Cell>,
}

impl Notebook {
    /// A notebook holding one empty code cell.
    pub fn new() -> Self {
        Self {
            cells: vec![Cell::new(CellKind::Code, "")],
        }
    }

    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, id: &CellId) -> Option<&Cell> {
        self.cells.iter().find(|c| &c.id == id)
    }

    pub fn get_mut(&mut self, id: &CellId) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| &c.id == id)
    }

    pub fn position(&self, id: &CellId) -> Option<usize> {
        self.cells.iter().position(|c| &c.id == id)
    }

    /// Insert at `index` (clamped to the end). Returns the new cell's id.
    pub fn insert(&mut self, index: usize, cell: Cell) -> CellId {
        let id = cell.id.clone();
        let index = index.min(self.cells.len());
        self.cells.insert(index, cell);
        id
    }

    pub fn append(&mut self, cell: Cell) -> CellId {
        self.insert(self.cells.len(), cell)
    }

    pub fn remove(&mut self, id: &CellId) -> Option<Cell> {
        let index = self.position(id)?;
        Some(self.cells.remove(index))
    }

    /// Swap a cell with its neighbour. Returns false at either end.
    pub fn move_cell(&mut self, id: &CellId, direction: MoveDirection) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        let target = match direction {
            MoveDirection::Up if index > 0 => index - 1,
            MoveDirection::Down if index + 1 < self.cells.len() => index + 1,
            _ => return false,
        };
        self.cells.swap(index, target);
        true
    }

    /// Change a cell's kind; its previous output no longer applies.
    pub fn convert(&mut self, id: &CellId, kind: CellKind) -> bool {
        match self.get_mut(id) {
            Some(cell) => {
                if cell.kind != kind {
                    cell.kind = kind;
                    cell.clear_output();
                    cell.state = RunState::Idle;
                }
                true
            }
            None => false,
        }
    }

    pub fn update_source(&mut self, id: &CellId, source: &str) -> bool {
        match self.get_mut(id) {
            Some(cell) => {
                cell.source = source.to_string();
                true
            }
            None => false,
        }
    }

    pub fn toggle_code(&mut self, id: &CellId) -> Option<bool> {
        let cell = self.get_mut(id)?;
        cell.code_hidden = !cell.code_hidden;
        Some(cell.code_hidden)
    }

    pub fn toggle_output(&mut self, id: &CellId) -> Option<bool> {
        let cell = self.get_mut(id)?;
        cell.output_hidden = !cell.output_hidden;
        Some(cell.output_hidden)
    }

    /// Hide or show the source of every code cell.
    pub fn set_all_code_hidden(&mut self, hidden: bool) {
        for cell in self.cells.iter_mut().filter(|c| c.kind == CellKind::Code) {
            cell.code_hidden = hidden;
        }
    }

    pub fn clear_all_outputs(&mut self) {
        for cell in &mut self.cells {
            cell.clear_output();
            if !cell.is_running() {
                cell.state = RunState::Idle;
            }
        }
    }

    /// Discard everything, leaving one empty code cell.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Replace the list wholesale (import/restore). An empty list is ignored.
    pub fn replace_cells(&mut self, cells: Vec<Cell>) -> bool {
        if cells.is_empty() {
            return false;
        }
        self.cells = cells;
        true
    }

    pub fn code_cell_ids(&self) -> Vec<CellId> {
        self.cells
            .iter()
            .filter(|c| c.kind == CellKind::Code)
            .map(|c| c.id.clone())
            .collect()
    }

    pub fn running(&self) -> Option<&Cell> {
        self.cells.iter().find(|c| c.is_running())
    }
}
