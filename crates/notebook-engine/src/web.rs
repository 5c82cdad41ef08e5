//! Browser bindings: console logging, the Pyodide host, canvas playback
//! and localStorage.

use std::cell::RefCell;
use std::fmt::Display;
use std::rc::{Rc, Weak};

use js_sys::{Array, Int32Array, Promise, Uint8Array};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::JsFuture;
use web_sys::{CanvasRenderingContext2d, HtmlCanvasElement};

use crate::error::{ExecError, StorageError};
use crate::player::{Avatar, Playback, Player, Surface};
use crate::runtime::{
    HostRuntime, RunScope, RunValue, STREAM_FUNCTION, SUPPORT_MODULE_NAME, input_prelude, run_marker,
};
use crate::session::SinkSlot;
use crate::storage::StorageBackend;

pub fn js_error(message: impl Display) -> JsValue {
    JsValue::from_str(&message.to_string())
}

/// Install `f` as a global function callable from Python via `from js import ...`.
pub fn set_global(name: &str, f: &JsValue) -> Result<(), JsValue> {
    js_sys::Reflect::set(&js_sys::global(), &JsValue::from_str(name), f)?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Logging
// ----------------------------------------------------------------------------

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = JsValue::from_str(&format!("[{}] {}", record.target(), record.args()));
        match record.level() {
            log::Level::Error => web_sys::console::error_1(&line),
            log::Level::Warn => web_sys::console::warn_1(&line),
            log::Level::Info => web_sys::console::info_1(&line),
            log::Level::Debug | log::Level::Trace => web_sys::console::debug_1(&line),
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

/// Route the `log` facade to the browser console. Later calls only adjust the level.
pub fn init_logging(level: log::LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

// ----------------------------------------------------------------------------
// Pyodide
// ----------------------------------------------------------------------------

#[wasm_bindgen]
extern "C" {
    /// The object `loadPyodide()` resolves to.
    pub type Pyodide;

    #[wasm_bindgen(method, catch, js_name = runPythonAsync)]
    fn run_python_async(this: &Pyodide, code: &str) -> Result<Promise, JsValue>;

    #[wasm_bindgen(method, catch, js_name = runPython)]
    fn run_python(this: &Pyodide, code: &str) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = loadPackage)]
    fn load_package(this: &Pyodide, name: &str) -> Result<Promise, JsValue>;

    #[wasm_bindgen(method, getter)]
    fn globals(this: &Pyodide) -> PyProxy;

    #[wasm_bindgen(method, getter, js_name = FS)]
    fn fs(this: &Pyodide) -> PyodideFs;

    type PyProxy;

    #[wasm_bindgen(method, catch)]
    fn set(this: &PyProxy, name: &str, value: &JsValue) -> Result<(), JsValue>;

    #[wasm_bindgen(method, catch, js_name = toJs)]
    fn to_js(this: &PyProxy) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method)]
    fn destroy(this: &PyProxy);

    type PyodideFs;

    #[wasm_bindgen(method, catch, js_name = writeFile)]
    fn write_file(this: &PyodideFs, path: &str, data: &Uint8Array) -> Result<(), JsValue>;
}

const RESULT_GLOBAL: &str = "_pynotebook_result";

fn runtime_error(error: JsValue) -> ExecError {
    let text = match error.dyn_ref::<js_sys::Error>() {
        Some(e) => String::from(e.to_string()),
        None => error.as_string().unwrap_or_else(|| format!("{error:?}")),
    };
    ExecError::Runtime(text)
}

/// Drop the JS side of a Python object handed back to us.
fn release(value: &JsValue) {
    if js_sys::Reflect::has(value, &JsValue::from_str("destroy")).unwrap_or(false) {
        value.unchecked_ref::<PyProxy>().destroy();
    }
}

/// [`HostRuntime`] over a Pyodide instance. Output arrives through the
/// global [`STREAM_FUNCTION`] installed by [`PyodideHost::new`], tagged with
/// the run that produced it.
pub struct PyodideHost {
    pyodide: Pyodide,
    sink: SinkSlot,
    _stream: Closure<dyn Fn(f64, String, String)>,
    /// Pyodide's interrupt buffer, when running with one.
    interrupt_buffer: RefCell<Option<Int32Array>>,
}

impl PyodideHost {
    pub fn new(pyodide: Pyodide) -> Result<Self, JsValue> {
        let sink = SinkSlot::default();
        let target = sink.clone();
        let stream = Closure::<dyn Fn(f64, String, String)>::new(move |run: f64, name: String, text: String| {
            target.stream(run as u64, &name, &text);
        });
        set_global(STREAM_FUNCTION, stream.as_ref())?;
        Ok(Self {
            pyodide,
            sink,
            _stream: stream,
            interrupt_buffer: RefCell::new(None),
        })
    }

    pub fn set_interrupt_buffer(&self, buffer: Option<Int32Array>) {
        *self.interrupt_buffer.borrow_mut() = buffer;
    }

    fn run_sync(&self, code: &str) -> Result<JsValue, ExecError> {
        self.pyodide.run_python(code).map_err(runtime_error)
    }

    fn describe(&self, value: &JsValue) -> Result<RunValue, ExecError> {
        let globals = self.pyodide.globals();
        globals.set(RESULT_GLOBAL, value).map_err(runtime_error)?;
        let described = self.run_sync(&format!(
            "import {SUPPORT_MODULE_NAME}\n{SUPPORT_MODULE_NAME}.describe({RESULT_GLOBAL})"
        ));
        globals.set(RESULT_GLOBAL, &JsValue::UNDEFINED).map_err(runtime_error)?;
        let described = described?
            .as_string()
            .ok_or_else(|| ExecError::Runtime("result description is not a string".into()))?;
        serde_json::from_str(&described).map_err(|e| ExecError::Runtime(e.to_string()))
    }
}

impl HostRuntime for PyodideHost {
    async fn begin_run(&self, scope: RunScope) -> Result<(), ExecError> {
        let run = scope.sink.run();
        self.sink.install(scope.sink);
        self.run_sync(&format!("{}{}", run_marker(run), input_prelude(&scope.cell)))?;
        Ok(())
    }

    async fn run(&self, code: &str) -> Result<RunValue, ExecError> {
        let promise = self.pyodide.run_python_async(code).map_err(runtime_error)?;
        let value = JsFuture::from(promise).await.map_err(runtime_error)?;
        let described = self.describe(&value);
        release(&value);
        described
    }

    async fn install_packages(&self, packages: &[String]) -> Result<(), ExecError> {
        let loading = self.pyodide.load_package("micropip").map_err(runtime_error)?;
        JsFuture::from(loading).await.map_err(runtime_error)?;
        // A JSON string list is also a Python list literal.
        let list = serde_json::to_string(packages).map_err(|e| ExecError::Runtime(e.to_string()))?;
        let install = self
            .pyodide
            .run_python_async(&format!("import micropip\nawait micropip.install({list})"))
            .map_err(runtime_error)?;
        JsFuture::from(install).await.map_err(runtime_error)?;
        Ok(())
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecError> {
        self.pyodide
            .fs()
            .write_file(path, &Uint8Array::from(contents))
            .map_err(runtime_error)
    }

    fn capture_figures(&self) -> Result<Vec<Vec<u8>>, ExecError> {
        let figures =
            self.run_sync(&format!("import {SUPPORT_MODULE_NAME}\n{SUPPORT_MODULE_NAME}.capture_figures()"))?;
        let converted = figures.unchecked_ref::<PyProxy>().to_js();
        release(&figures);
        let list: Array = converted
            .map_err(runtime_error)?
            .dyn_into()
            .map_err(|_| ExecError::Runtime("figure capture did not return a list".into()))?;
        Ok(list.iter().map(|png| Uint8Array::new(&png).to_vec()).collect())
    }

    fn close_figures(&self) -> Result<(), ExecError> {
        self.run_sync(&format!("import {SUPPORT_MODULE_NAME}\n{SUPPORT_MODULE_NAME}.close_figures()"))?;
        Ok(())
    }

    fn interrupt(&self) -> bool {
        match self.interrupt_buffer.borrow().as_ref() {
            Some(buffer) => {
                // SIGINT
                buffer.set_index(0, 2);
                true
            }
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Canvas
// ----------------------------------------------------------------------------

fn context_2d(canvas: &HtmlCanvasElement) -> Result<CanvasRenderingContext2d, JsValue> {
    canvas
        .get_context("2d")?
        .ok_or_else(|| js_error("canvas has no 2d context"))?
        .dyn_into::<CanvasRenderingContext2d>()
        .map_err(|_| js_error("unexpected canvas context type"))
}

/// Draws onto a visible canvas, keeping the ink in an offscreen canvas of
/// the same size.
pub struct CanvasSurface {
    view: CanvasRenderingContext2d,
    ink_canvas: HtmlCanvasElement,
    ink: CanvasRenderingContext2d,
    width: f64,
    height: f64,
}

impl CanvasSurface {
    pub fn new(canvas: &HtmlCanvasElement) -> Result<Self, JsValue> {
        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| js_error("no document"))?;
        let ink_canvas: HtmlCanvasElement = document
            .create_element("canvas")?
            .dyn_into()
            .map_err(|_| js_error("could not create an offscreen canvas"))?;
        ink_canvas.set_width(canvas.width());
        ink_canvas.set_height(canvas.height());
        Ok(Self {
            view: context_2d(canvas)?,
            ink: context_2d(&ink_canvas)?,
            ink_canvas,
            width: canvas.width() as f64,
            height: canvas.height() as f64,
        })
    }

    fn trace(context: &CanvasRenderingContext2d, points: &[(f64, f64)]) {
        context.begin_path();
        let mut points = points.iter();
        if let Some(&(x, y)) = points.next() {
            context.move_to(x, y);
        }
        for &(x, y) in points {
            context.line_to(x, y);
        }
        context.close_path();
    }
}

impl Surface for CanvasSurface {
    fn size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    fn paint_background(&mut self, color: &str) {
        self.ink.set_fill_style_str(color);
        self.ink.fill_rect(0.0, 0.0, self.width, self.height);
    }

    fn stroke(&mut self, from: (f64, f64), to: (f64, f64), color: &str, width: f64) {
        self.ink.begin_path();
        self.ink.move_to(from.0, from.1);
        self.ink.line_to(to.0, to.1);
        self.ink.set_stroke_style_str(color);
        self.ink.set_line_width(width);
        self.ink.set_line_cap("round");
        self.ink.stroke();
    }

    fn fill(&mut self, polygon: &[(f64, f64)], color: &str) {
        Self::trace(&self.ink, polygon);
        self.ink.set_fill_style_str(color);
        self.ink.fill();
    }

    fn text(&mut self, at: (f64, f64), text: &str, align: &str, font: &str, color: &str) {
        self.ink.set_font(font);
        self.ink.set_text_align(align);
        self.ink.set_fill_style_str(color);
        if let Err(e) = self.ink.fill_text(text, at.0, at.1) {
            log::warn!("turtle write failed: {e:?}");
        }
    }

    fn compose(&mut self, avatars: &[Avatar]) {
        self.view.clear_rect(0.0, 0.0, self.width, self.height);
        if let Err(e) = self
            .view
            .draw_image_with_html_canvas_element(&self.ink_canvas, 0.0, 0.0)
        {
            log::warn!("compositing ink failed: {e:?}");
        }
        for avatar in avatars {
            Self::trace(&self.view, &avatar.outline);
            self.view.set_fill_style_str(&avatar.fill_color);
            self.view.fill();
            self.view.set_stroke_style_str(&avatar.pen_color);
            self.view.set_line_width(1.0);
            self.view.stroke();
        }
    }
}

// ----------------------------------------------------------------------------
// Playback loop
// ----------------------------------------------------------------------------

struct PlaybackLoop {
    player: Player,
    surface: CanvasSurface,
    frame: Option<i32>,
    on_finish: Option<js_sys::Function>,
}

type FrameCallback = Rc<RefCell<Option<Closure<dyn FnMut()>>>>;

/// A running replay. Dropping it withdraws the pending animation frame.
pub struct PlaybackHandle {
    state: Rc<RefCell<PlaybackLoop>>,
    callback: FrameCallback,
}

impl PlaybackHandle {
    pub fn start(
        player: Player,
        surface: CanvasSurface,
        on_finish: Option<js_sys::Function>,
    ) -> Result<Self, JsValue> {
        let state = Rc::new(RefCell::new(PlaybackLoop {
            player,
            surface,
            frame: None,
            on_finish,
        }));
        let callback: FrameCallback = Rc::new(RefCell::new(None));
        let (weak_state, weak_callback) = (Rc::downgrade(&state), Rc::downgrade(&callback));
        *callback.borrow_mut() = Some(Closure::new(move || {
            on_frame(&weak_state, &weak_callback);
        }));
        request_frame(&state, &callback)?;
        Ok(Self { state, callback })
    }

    pub fn is_finished(&self) -> bool {
        self.state.borrow().player.is_finished()
    }

    /// Draw everything that is left in one go.
    pub fn skip(&self) {
        self.cancel_frame();
        let finished = {
            let mut state = self.state.borrow_mut();
            let PlaybackLoop { player, surface, .. } = &mut *state;
            player.finish(surface);
            state.on_finish.take()
        };
        notify_finished(finished);
    }

    fn cancel_frame(&self) {
        let frame = self.state.borrow_mut().frame.take();
        if let (Some(id), Some(window)) = (frame, web_sys::window()) {
            if let Err(e) = window.cancel_animation_frame(id) {
                log::warn!("cancel_animation_frame failed: {e:?}");
            }
        }
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.cancel_frame();
        self.callback.borrow_mut().take();
    }
}

fn request_frame(state: &Rc<RefCell<PlaybackLoop>>, callback: &FrameCallback) -> Result<(), JsValue> {
    let window = web_sys::window().ok_or_else(|| js_error("no window"))?;
    let callback = callback.borrow();
    let Some(closure) = callback.as_ref() else {
        return Ok(());
    };
    let id = window.request_animation_frame(closure.as_ref().unchecked_ref())?;
    state.borrow_mut().frame = Some(id);
    Ok(())
}

fn on_frame(state: &Weak<RefCell<PlaybackLoop>>, callback: &Weak<RefCell<Option<Closure<dyn FnMut()>>>>) {
    let (Some(state), Some(callback)) = (state.upgrade(), callback.upgrade()) else {
        return;
    };
    let finished = {
        let mut playback = state.borrow_mut();
        playback.frame = None;
        let PlaybackLoop { player, surface, .. } = &mut *playback;
        match player.frame(surface) {
            Playback::Playing => None,
            Playback::Finished => Some(playback.on_finish.take()),
        }
    };
    match finished {
        Some(on_finish) => {
            log::debug!("turtle playback finished");
            notify_finished(on_finish);
        }
        None => {
            if let Err(e) = request_frame(&state, &callback) {
                log::warn!("could not schedule the next frame: {e:?}");
            }
        }
    }
}

fn notify_finished(on_finish: Option<js_sys::Function>) {
    if let Some(f) = on_finish {
        if let Err(e) = f.call0(&JsValue::NULL) {
            log::warn!("playback finish callback threw: {e:?}");
        }
    }
}

// ----------------------------------------------------------------------------
// Timers and storage
// ----------------------------------------------------------------------------

/// A pending `setTimeout`, cleared when dropped.
pub struct Timeout {
    id: i32,
    _callback: Closure<dyn FnMut()>,
}

impl Timeout {
    pub fn new(delay_ms: u32, f: impl FnOnce() + 'static) -> Result<Self, JsValue> {
        let window = web_sys::window().ok_or_else(|| js_error("no window"))?;
        let callback = Closure::once(f);
        let id = window.set_timeout_with_callback_and_timeout_and_arguments_0(
            callback.as_ref().unchecked_ref(),
            delay_ms as i32,
        )?;
        Ok(Self {
            id,
            _callback: callback,
        })
    }
}

impl Drop for Timeout {
    fn drop(&mut self) {
        if let Some(window) = web_sys::window() {
            window.clear_timeout_with_handle(self.id);
        }
    }
}

pub struct LocalStorageBackend {
    storage: web_sys::Storage,
}

impl LocalStorageBackend {
    pub fn new() -> Result<Self, StorageError> {
        let storage = web_sys::window()
            .ok_or_else(|| StorageError::Backend("no window".into()))?
            .local_storage()
            .map_err(|e| StorageError::Backend(format!("{e:?}")))?
            .ok_or_else(|| StorageError::Backend("localStorage is unavailable".into()))?;
        Ok(Self { storage })
    }
}

impl StorageBackend for LocalStorageBackend {
    fn load(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get_item(key)
            .map_err(|e| StorageError::Backend(format!("{e:?}")))
    }

    fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage
            .set_item(key, value)
            .map_err(|e| StorageError::Backend(format!("{e:?}")))
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use wasm_bindgen_test::*;

    wasm_bindgen_test_configure!(run_in_browser);

    #[wasm_bindgen_test]
    fn test_js_error_message() {
        assert_eq!(js_error("boom").as_string().as_deref(), Some("boom"));
    }

    #[wasm_bindgen_test]
    fn test_local_storage_roundtrip() {
        let backend = LocalStorageBackend::new().unwrap();
        backend.store("pynotebook-test", "payload").unwrap();
        assert_eq!(backend.load("pynotebook-test").unwrap().as_deref(), Some("payload"));
    }

    #[wasm_bindgen_test]
    fn test_canvas_surface_size() {
        let document = web_sys::window().unwrap().document().unwrap();
        let canvas: HtmlCanvasElement = document.create_element("canvas").unwrap().dyn_into().unwrap();
        canvas.set_width(320);
        canvas.set_height(200);
        let surface = CanvasSurface::new(&canvas).unwrap();
        assert_eq!(surface.size(), (320.0, 200.0));
    }
}
