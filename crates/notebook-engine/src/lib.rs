pub mod cell;
pub mod command_log;
pub mod config;
pub mod controller;
pub mod error;
pub mod input;
pub mod ipynb;
pub mod magic;
pub mod player;
pub mod render;
pub mod rewriter;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod turtle;
pub mod web;

pub use cell::{Cell, CellId, CellKind, Notebook, RunState};
pub use config::NotebookConfig;
pub use controller::ExecutionController;
pub use render::RenderSpec;

use std::cell::RefCell;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

use cell::MoveDirection;
use error::InputError;
use input::InputRequest;
use player::Player;
use runtime::INPUT_FUNCTION;
use storage::{Autosave, SaveReport, SaveTiming};
use turtle::bridge::{self, BRIDGE_FUNCTION};
use web::{
    CanvasSurface, LocalStorageBackend, PlaybackHandle, PyodideHost, Pyodide, Timeout, js_error,
    set_global,
};

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| RenderSpec::error(format!("Serialization error: {e}")).to_json())
}

/// Parse a bare wire name such as `"code"` or `"up"`.
fn from_name<T: DeserializeOwned>(name: &str) -> Result<T, JsValue> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| js_error(format!("unknown value '{name}'")))
}

fn save_now(notebook: &Rc<RefCell<Notebook>>, autosave: &Rc<RefCell<Autosave>>) -> Result<SaveReport, JsValue> {
    let backend = LocalStorageBackend::new().map_err(js_error)?;
    let cells = notebook.borrow().cells().to_vec();
    autosave.borrow().save(&backend, &cells).map_err(js_error)
}

/// Background save. The policy is copied out so the warning listener runs
/// with nothing borrowed.
fn autosave_now(notebook: &Rc<RefCell<Notebook>>, autosave: &Rc<RefCell<Autosave>>) {
    let policy = autosave.borrow().clone();
    match LocalStorageBackend::new() {
        Ok(backend) => {
            let cells = notebook.borrow().cells().to_vec();
            policy.autosave(&backend, &cells);
        }
        Err(e) => policy.warn(&e),
    }
}

/// One notebook session in the page.
/// JavaScript creates this once Pyodide has loaded and drives it from the UI.
#[wasm_bindgen]
pub struct WasmNotebook {
    controller: ExecutionController<PyodideHost>,
    autosave: Rc<RefCell<Autosave>>,
    save_timer: RefCell<Option<Timeout>>,
    playback: RefCell<Option<PlaybackHandle>>,
    _bridge: Closure<dyn FnMut(String) -> String>,
    _input: Closure<dyn FnMut(f64, String, String, Option<String>) -> js_sys::Promise>,
}

#[wasm_bindgen]
impl WasmNotebook {
    /// Wrap a loaded Pyodide instance. `config` is a JSON `NotebookConfig`
    /// (empty string for defaults).
    #[wasm_bindgen(constructor)]
    pub fn new(pyodide: Pyodide, config: &str) -> Result<WasmNotebook, JsValue> {
        web::init_logging(log::LevelFilter::Info);
        let config = NotebookConfig::from_json(config).map_err(js_error)?;
        let host = PyodideHost::new(pyodide)?;
        let notebook = Rc::new(RefCell::new(Notebook::new()));
        let autosave = Rc::new(RefCell::new(Autosave::new(&config)));
        let controller = ExecutionController::new(host, notebook, config);

        let shim = controller.context().shim();
        let bridge = Closure::<dyn FnMut(String) -> String>::new(move |payload: String| {
            bridge::handle(&mut shim.borrow_mut(), &payload)
        });
        set_global(BRIDGE_FUNCTION, bridge.as_ref())?;

        let runs = controller.clone();
        let input = Closure::<dyn FnMut(f64, String, String, Option<String>) -> js_sys::Promise>::new(
            move |run: f64, cell: String, prompt: String, title: Option<String>| {
                let context = runs.context();
                if !context.is_live(run as u64) {
                    log::debug!("refusing input for cell {cell} from stopped run {run}");
                    return js_sys::Promise::reject(&js_error(InputError::Cancelled));
                }
                match context.input().request(CellId::from(cell), &prompt, title.as_deref()) {
                    Ok(pending) => future_to_promise(async move {
                        pending.await.map(|text| JsValue::from_str(&text)).map_err(js_error)
                    }),
                    Err(e) => js_sys::Promise::reject(&js_error(e)),
                }
            },
        );
        set_global(INPUT_FUNCTION, input.as_ref())?;

        Ok(Self {
            controller,
            autosave,
            save_timer: RefCell::new(None),
            playback: RefCell::new(None),
            _bridge: bridge,
            _input: input,
        })
    }

    fn notebook(&self) -> Rc<RefCell<Notebook>> {
        self.controller.notebook()
    }

    /// Save now or later depending on what kind of edit just happened.
    fn edited(&self) {
        let count = self.notebook().borrow().len();
        let timing = self.autosave.borrow_mut().timing(count);
        match timing {
            SaveTiming::Immediate => {
                self.save_timer.borrow_mut().take();
                autosave_now(&self.notebook(), &self.autosave);
            }
            SaveTiming::Debounced { delay_ms } => {
                let (notebook, autosave) = (self.notebook(), self.autosave.clone());
                let timer = Timeout::new(delay_ms, move || autosave_now(&notebook, &autosave));
                match timer {
                    // replacing the old timer clears it
                    Ok(timer) => *self.save_timer.borrow_mut() = Some(timer),
                    Err(e) => log::warn!("could not schedule autosave: {e:?}"),
                }
            }
        }
    }

    /// Write the turtle and support modules into Pyodide. Call once before running cells.
    #[wasm_bindgen(js_name = installSupport)]
    pub fn install_support(&self) -> js_sys::Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            controller.install_support().await.map_err(js_error)?;
            Ok(JsValue::UNDEFINED)
        })
    }

    /// Set the buffer Pyodide watches for interrupts (`pyodide.setInterruptBuffer`).
    #[wasm_bindgen(js_name = setInterruptBuffer)]
    pub fn set_interrupt_buffer(&self, buffer: Option<js_sys::Int32Array>) {
        self.controller.runtime().set_interrupt_buffer(buffer);
    }

    // ------------------------------------------------------------------------
    // Cells
    // ------------------------------------------------------------------------

    /// All cells as a JSON array.
    pub fn cells(&self) -> String {
        to_json(&self.notebook().borrow().cells())
    }

    /// The output area of one cell as a JSON render spec.
    #[wasm_bindgen(js_name = cellOutput)]
    pub fn cell_output(&self, id: &str) -> String {
        let pending = self.controller.context().input().pending();
        let notebook = self.notebook();
        let notebook = notebook.borrow();
        match notebook.get(&CellId::from(id)) {
            Some(cell) => render::render_cell(cell, pending.as_ref()).to_json(),
            None => RenderSpec::error(format!("no cell with id {id}")).to_json(),
        }
    }

    /// Insert a cell at `index`, or append. Returns the new id.
    #[wasm_bindgen(js_name = addCell)]
    pub fn add_cell(&self, kind: &str, source: &str, index: Option<usize>) -> Result<String, JsValue> {
        let cell = Cell::new(from_name(kind)?, source);
        let id = {
            let notebook = self.notebook();
            let mut notebook = notebook.borrow_mut();
            match index {
                Some(index) => notebook.insert(index, cell),
                None => notebook.append(cell),
            }
        };
        self.edited();
        Ok(id.to_string())
    }

    #[wasm_bindgen(js_name = removeCell)]
    pub fn remove_cell(&self, id: &str) -> bool {
        let id = CellId::from(id);
        self.controller.stop(&id);
        let removed = self.notebook().borrow_mut().remove(&id).is_some();
        if removed {
            self.edited();
        }
        removed
    }

    #[wasm_bindgen(js_name = moveCell)]
    pub fn move_cell(&self, id: &str, direction: &str) -> Result<bool, JsValue> {
        let direction: MoveDirection = from_name(direction)?;
        let moved = self.notebook().borrow_mut().move_cell(&CellId::from(id), direction);
        if moved {
            self.edited();
        }
        Ok(moved)
    }

    #[wasm_bindgen(js_name = convertCell)]
    pub fn convert_cell(&self, id: &str, kind: &str) -> Result<bool, JsValue> {
        let converted = self.notebook().borrow_mut().convert(&CellId::from(id), from_name(kind)?);
        if converted {
            self.edited();
        }
        Ok(converted)
    }

    #[wasm_bindgen(js_name = updateSource)]
    pub fn update_source(&self, id: &str, source: &str) -> bool {
        let updated = self.notebook().borrow_mut().update_source(&CellId::from(id), source);
        if updated {
            self.edited();
        }
        updated
    }

    #[wasm_bindgen(js_name = toggleCode)]
    pub fn toggle_code(&self, id: &str) -> Option<bool> {
        let hidden = self.notebook().borrow_mut().toggle_code(&CellId::from(id));
        self.edited();
        hidden
    }

    #[wasm_bindgen(js_name = toggleOutput)]
    pub fn toggle_output(&self, id: &str) -> Option<bool> {
        self.notebook().borrow_mut().toggle_output(&CellId::from(id))
    }

    #[wasm_bindgen(js_name = setAllCodeHidden)]
    pub fn set_all_code_hidden(&self, hidden: bool) {
        self.notebook().borrow_mut().set_all_code_hidden(hidden);
        self.edited();
    }

    #[wasm_bindgen(js_name = clearAllOutputs)]
    pub fn clear_all_outputs(&self) {
        self.notebook().borrow_mut().clear_all_outputs();
    }

    /// Drop every cell, leaving one empty code cell.
    #[wasm_bindgen(js_name = clearNotebook)]
    pub fn clear_notebook(&self) {
        let running = self.notebook().borrow().running().map(|c| c.id.clone());
        if let Some(running) = running {
            self.controller.stop(&running);
        }
        self.notebook().borrow_mut().clear();
        self.edited();
    }

    /// Called with a cell id whenever that cell's visible state changes.
    #[wasm_bindgen(js_name = setChangeListener)]
    pub fn set_change_listener(&self, listener: Option<js_sys::Function>) {
        self.controller.set_change_listener(listener.map(|f| {
            Rc::new(move |id: &CellId| {
                if let Err(e) = f.call1(&JsValue::NULL, &JsValue::from_str(id.as_str())) {
                    log::warn!("change listener threw: {e:?}");
                }
            }) as session::ChangeListener
        }));
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Resolves to the final state name (`succeeded`, `failed`, `stopped`).
    #[wasm_bindgen(js_name = runCell)]
    pub fn run_cell(&self, id: String) -> js_sys::Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            let state = controller.run_cell(&CellId::from(id)).await.map_err(js_error)?;
            Ok(JsValue::from_str(state.name()))
        })
    }

    /// Resolves to a JSON report of the cells that ran and where it stopped.
    #[wasm_bindgen(js_name = runAll)]
    pub fn run_all(&self) -> js_sys::Promise {
        let controller = self.controller.clone();
        future_to_promise(async move {
            let report = controller.run_all().await.map_err(js_error)?;
            Ok(JsValue::from_str(&to_json(&report)))
        })
    }

    #[wasm_bindgen(js_name = stopCell)]
    pub fn stop_cell(&self, id: &str) -> bool {
        self.controller.stop(&CellId::from(id))
    }

    /// Replace the cell's source with starter code for an uploaded file.
    #[wasm_bindgen(js_name = uploadFile)]
    pub fn upload_file(&self, id: &str, name: &str, contents: &[u8]) -> Result<(), JsValue> {
        self.controller
            .upload_file(&CellId::from(id), name, contents)
            .map_err(js_error)?;
        self.edited();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    /// The open input request as JSON, if any.
    #[wasm_bindgen(js_name = pendingInput)]
    pub fn pending_input(&self) -> Option<String> {
        self.controller.context().input().pending().map(|r| to_json(&r))
    }

    #[wasm_bindgen(js_name = submitInput)]
    pub fn submit_input(&self, text: &str) -> Result<(), JsValue> {
        self.controller.context().input().submit(text).map_err(js_error)
    }

    /// Called with the request JSON when input is needed, and with `null` once answered.
    #[wasm_bindgen(js_name = setInputListener)]
    pub fn set_input_listener(&self, listener: Option<js_sys::Function>) {
        self.controller.context().input().set_listener(listener.map(|f| {
            Rc::new(move |request: Option<&InputRequest>| {
                let arg = match request {
                    Some(request) => JsValue::from_str(&to_json(request)),
                    None => JsValue::NULL,
                };
                if let Err(e) = f.call1(&JsValue::NULL, &arg) {
                    log::warn!("input listener threw: {e:?}");
                }
            }) as input::InputListener
        }));
    }

    // ------------------------------------------------------------------------
    // Turtle graphics
    // ------------------------------------------------------------------------

    /// Entry point for the Python turtle module; also installed as a global.
    #[wasm_bindgen(js_name = turtleCall)]
    pub fn turtle_call(&self, payload: &str) -> String {
        bridge::handle(&mut self.controller.context().shim().borrow_mut(), payload)
    }

    /// Whether the last run left anything to replay.
    #[wasm_bindgen(js_name = hasGraphics)]
    pub fn has_graphics(&self) -> bool {
        !self.controller.context().log().is_empty()
    }

    /// The command log of the last run as JSON.
    #[wasm_bindgen(js_name = graphicsLog)]
    pub fn graphics_log(&self) -> String {
        to_json(&self.controller.context().log().snapshot())
    }

    /// Replay the last run's drawing onto `canvas`. Replaces any running replay.
    #[wasm_bindgen(js_name = playGraphics)]
    pub fn play_graphics(
        &self,
        canvas: web_sys::HtmlCanvasElement,
        on_finish: Option<js_sys::Function>,
    ) -> Result<(), JsValue> {
        self.playback.borrow_mut().take();
        let config = self.controller.config();
        if canvas.width() == 0 || canvas.height() == 0 {
            canvas.set_width(config.canvas_width);
            canvas.set_height(config.canvas_height);
        }
        let entries = self.controller.context().log().snapshot();
        log::debug!("replaying {} turtle commands", entries.len());
        let player = Player::new(entries, config.default_turtle_speed);
        let surface = CanvasSurface::new(&canvas)?;
        *self.playback.borrow_mut() = Some(PlaybackHandle::start(player, surface, on_finish)?);
        Ok(())
    }

    /// Finish the running replay at once.
    #[wasm_bindgen(js_name = skipGraphics)]
    pub fn skip_graphics(&self) {
        if let Some(playback) = self.playback.borrow().as_ref() {
            playback.skip();
        }
    }

    /// Stop replaying; the pending frame is withdrawn.
    #[wasm_bindgen(js_name = closeGraphics)]
    pub fn close_graphics(&self) {
        self.playback.borrow_mut().take();
    }

    // ------------------------------------------------------------------------
    // Files and persistence
    // ------------------------------------------------------------------------

    #[wasm_bindgen(js_name = exportIpynb)]
    pub fn export_ipynb(&self) -> Result<String, JsValue> {
        ipynb::export(&self.notebook().borrow()).map_err(js_error)
    }

    /// Replace the cells with those of an `.ipynb` file. Returns how many
    /// were loaded; on error or an empty file nothing changes.
    #[wasm_bindgen(js_name = importIpynb)]
    pub fn import_ipynb(&self, json: &str) -> Result<usize, JsValue> {
        let cells = ipynb::import(json).map_err(js_error)?;
        let count = cells.len();
        if self.notebook().borrow_mut().replace_cells(cells) {
            self.edited();
        }
        Ok(count)
    }

    /// Called with a message whenever an automatic save is refused (too
    /// large, storage unavailable). The previous saved copy is kept.
    #[wasm_bindgen(js_name = setStorageWarningListener)]
    pub fn set_storage_warning_listener(&self, listener: Option<js_sys::Function>) {
        self.autosave.borrow_mut().set_warning_listener(listener.map(|f| {
            Rc::new(move |error: &error::StorageError| {
                if let Err(e) = f.call1(&JsValue::NULL, &JsValue::from_str(&error.to_string())) {
                    log::warn!("storage warning listener threw: {e:?}");
                }
            }) as storage::WarningListener
        }));
    }

    /// Save immediately; returns the size report as JSON.
    pub fn save(&self) -> Result<String, JsValue> {
        self.save_timer.borrow_mut().take();
        save_now(&self.notebook(), &self.autosave).map(|report| to_json(&report))
    }

    /// Load the saved notebook, if any. Returns whether cells were replaced.
    pub fn restore(&self) -> Result<bool, JsValue> {
        let backend = LocalStorageBackend::new().map_err(js_error)?;
        let restored = self.autosave.borrow_mut().restore(&backend).map_err(js_error)?;
        Ok(match restored {
            Some(cells) => self.notebook().borrow_mut().replace_cells(cells),
            None => false,
        })
    }

    /// Tear down the session: pending input is rejected, replay and autosave timers stop.
    pub fn close(&self) {
        self.playback.borrow_mut().take();
        self.save_timer.borrow_mut().take();
        self.controller.context().close();
    }
}
