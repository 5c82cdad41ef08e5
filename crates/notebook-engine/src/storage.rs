//! Compressed persistence of the cell list.
//!
//! Only identity, kind, source and the code-hidden flag are stored; outputs
//! are transient. The JSON payload is LZ-string compressed to base64 so it
//! fits the backend's size ceiling.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cell::{Cell, CellId, CellKind};
use crate::config::NotebookConfig;
use crate::error::StorageError;

/// The stored shape of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCell {
    pub id: CellId,
    #[serde(rename = "type")]
    pub kind: CellKind,
    pub content: String,
    #[serde(rename = "codeCollapsed", default)]
    pub code_collapsed: bool,
}

impl From<&Cell> for PersistedCell {
    fn from(cell: &Cell) -> Self {
        Self {
            id: cell.id.clone(),
            kind: cell.kind,
            content: cell.source.clone(),
            code_collapsed: cell.code_hidden,
        }
    }
}

impl From<PersistedCell> for Cell {
    fn from(stored: PersistedCell) -> Self {
        let mut cell = Cell::with_id(stored.id, stored.kind, stored.content);
        cell.code_hidden = stored.code_collapsed;
        cell
    }
}

pub fn serialize(cells: &[Cell]) -> Result<String, StorageError> {
    let persisted: Vec<PersistedCell> = cells.iter().map(PersistedCell::from).collect();
    serde_json::to_string(&persisted).map_err(|e| StorageError::Corrupt(e.to_string()))
}

pub fn compress(json: &str) -> String {
    lz_str::compress_to_base64(json)
}

/// Inverse of [`compress`]. `None` if `data` is not a compressed payload.
pub fn decompress(data: &str) -> Option<String> {
    let wide = lz_str::decompress_from_base64(data)?;
    String::from_utf16(&wide).ok().filter(|s| !s.is_empty())
}

/// Parse a stored record: compressed first, then plain JSON as written
/// before compression was introduced.
pub fn decode(raw: &str) -> Result<Vec<Cell>, StorageError> {
    if let Some(json) = decompress(raw) {
        if let Ok(cells) = serde_json::from_str::<Vec<PersistedCell>>(&json) {
            return Ok(cells.into_iter().map(Cell::from).collect());
        }
    }
    let cells: Vec<PersistedCell> =
        serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    Ok(cells.into_iter().map(Cell::from).collect())
}

/// Where records live: localStorage in the browser, memory in tests.
pub trait StorageBackend {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn store(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

/// When the next save should happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTiming {
    Immediate,
    Debounced { delay_ms: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReport {
    /// Characters of JSON before compression.
    pub raw_size: usize,
    pub compressed_size: usize,
    /// Percentage saved by compression.
    pub ratio: f64,
}

/// Told whenever a background save could not be written, so the page can
/// warn the user.
pub type WarningListener = Rc<dyn Fn(&StorageError)>;

/// Save policy for one notebook: size ceiling and scheduling.
#[derive(Clone)]
pub struct Autosave {
    key: String,
    limit: usize,
    debounce_ms: u32,
    last_count: Option<usize>,
    listener: Option<WarningListener>,
}

impl Autosave {
    pub fn new(config: &NotebookConfig) -> Self {
        Self {
            key: config.storage_key.clone(),
            limit: config.storage_limit,
            debounce_ms: config.autosave_debounce_ms,
            last_count: None,
            listener: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn set_warning_listener(&mut self, listener: Option<WarningListener>) {
        self.listener = listener;
    }

    /// Report a save that did not happen.
    pub fn warn(&self, error: &StorageError) {
        log::warn!("autosave failed: {error}");
        if let Some(listener) = &self.listener {
            listener(error);
        }
    }

    /// [`save`](Self::save) for saves nobody awaits: a failure goes to the
    /// warning listener instead of the caller.
    pub fn autosave(&self, backend: &impl StorageBackend, cells: &[Cell]) -> Option<SaveReport> {
        match self.save(backend, cells) {
            Ok(report) => Some(report),
            Err(e) => {
                self.warn(&e);
                None
            }
        }
    }

    /// Structural edits (the cell count changed) save at once; content
    /// edits wait for the debounce interval.
    pub fn timing(&mut self, cell_count: usize) -> SaveTiming {
        let structural = self.last_count != Some(cell_count);
        self.last_count = Some(cell_count);
        if structural {
            SaveTiming::Immediate
        } else {
            SaveTiming::Debounced {
                delay_ms: self.debounce_ms,
            }
        }
    }

    /// Compress and store. A payload above the limit is refused and the
    /// previous record stays as it was.
    pub fn save(&self, backend: &impl StorageBackend, cells: &[Cell]) -> Result<SaveReport, StorageError> {
        let json = serialize(cells)?;
        let compressed = compress(&json);
        let raw_size = json.encode_utf16().count();
        let compressed_size = compressed.len();
        let ratio = if raw_size > 0 {
            (1.0 - compressed_size as f64 / raw_size as f64) * 100.0
        } else {
            0.0
        };
        log::info!(
            "autosave: compressed {raw_size} chars to {compressed_size} chars ({ratio:.1}% saved)"
        );
        if compressed_size > self.limit {
            log::warn!("autosave aborted: {compressed_size} chars exceeds {}", self.limit);
            return Err(StorageError::TooLarge {
                size: compressed_size,
                limit: self.limit,
            });
        }
        backend.store(&self.key, &compressed)?;
        Ok(SaveReport {
            raw_size,
            compressed_size,
            ratio,
        })
    }

    /// The stored cells, or `None` if nothing usable is stored.
    pub fn restore(&mut self, backend: &impl StorageBackend) -> Result<Option<Vec<Cell>>, StorageError> {
        let Some(raw) = backend.load(&self.key)? else {
            return Ok(None);
        };
        let cells = decode(&raw)?;
        if cells.is_empty() {
            return Ok(None);
        }
        self.last_count = Some(cells.len());
        Ok(Some(cells))
    }
}
