//! Runs one cell end to end: directives, rewrite, execution, harvest.

use std::cell::RefCell;
use std::rc::Rc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::cell::{CellId, CellKind, CellOutput, Notebook, RunState};
use crate::config::NotebookConfig;
use crate::error::{ExecError, RewriteError};
use crate::magic::{self, CellDirective, PIP_UNSUPPORTED, PIP_USAGE, PipCommand};
use crate::rewriter;
use crate::runtime::{HostRuntime, RunScope, RunValue, SUPPORT_MODULE, SUPPORT_MODULE_NAME};
use crate::session::{ChangeListener, ExecutionContext, OutputSink, RunTicket};
use crate::turtle::bridge;

/// Result of "run all".
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAllReport {
    /// Cells that were started, in order.
    pub ran: Vec<CellId>,
    /// The cell that did not succeed, if the run stopped early.
    pub stopped_at: Option<CellId>,
}

/// Everything a run produced besides streamed text.
#[derive(Debug, Default)]
struct Harvest {
    echo: Option<String>,
    html: Option<String>,
    images: Vec<String>,
}

impl Harvest {
    fn html(markup: String) -> Self {
        Self {
            html: Some(markup),
            ..Self::default()
        }
    }

    fn apply(self, output: &mut CellOutput) {
        if let Some(repr) = self.echo {
            echo(&mut output.text, &repr);
        }
        if self.html.is_some() {
            output.html = self.html;
        }
        output.images = self.images;
    }
}

/// Append a result the way an interactive top level would print it.
pub fn echo(output: &mut String, repr: &str) {
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(repr);
}

struct Inner<R> {
    runtime: R,
    notebook: Rc<RefCell<Notebook>>,
    context: ExecutionContext,
    config: NotebookConfig,
    listener: RefCell<Option<ChangeListener>>,
    rewrite: fn(&str) -> Result<rewriter::Rewrite, RewriteError>,
}

/// Single-flight cell execution over a [`HostRuntime`]. Cheap to clone.
pub struct ExecutionController<R> {
    inner: Rc<Inner<R>>,
}

impl<R> Clone for ExecutionController<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: HostRuntime> ExecutionController<R> {
    pub fn new(runtime: R, notebook: Rc<RefCell<Notebook>>, config: NotebookConfig) -> Self {
        Self::with_rewriter(runtime, notebook, config, rewriter::rewrite)
    }

    /// Like [`new`](Self::new) with a different source rewriter.
    pub fn with_rewriter(
        runtime: R,
        notebook: Rc<RefCell<Notebook>>,
        config: NotebookConfig,
        rewrite: fn(&str) -> Result<rewriter::Rewrite, RewriteError>,
    ) -> Self {
        let context = ExecutionContext::new(config.default_turtle_speed);
        Self {
            inner: Rc::new(Inner {
                runtime,
                notebook,
                context,
                config,
                listener: RefCell::new(None),
                rewrite,
            }),
        }
    }

    pub fn notebook(&self) -> Rc<RefCell<Notebook>> {
        self.inner.notebook.clone()
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    pub fn runtime(&self) -> &R {
        &self.inner.runtime
    }

    pub fn config(&self) -> &NotebookConfig {
        &self.inner.config
    }

    pub fn set_change_listener(&self, listener: Option<ChangeListener>) {
        *self.inner.listener.borrow_mut() = listener;
    }

    fn notify(&self, id: &CellId) {
        let listener = self.inner.listener.borrow().clone();
        if let Some(listener) = listener {
            listener(id);
        }
    }

    /// Write the turtle and support modules into the runtime and import them.
    pub async fn install_support(&self) -> Result<(), ExecError> {
        let runtime = &self.inner.runtime;
        let module = &self.inner.config.turtle_module;
        runtime.write_file(&format!("{module}.py"), bridge::TURTLE_MODULE.as_bytes())?;
        runtime.write_file(&format!("{SUPPORT_MODULE_NAME}.py"), SUPPORT_MODULE.as_bytes())?;
        let setup = format!(
            "import sys\nif '.' not in sys.path:\n    sys.path.insert(0, '.')\nimport {SUPPORT_MODULE_NAME}\n{}",
            bridge::install_snippet(module)
        );
        runtime.run(&setup).await?;
        // Importing may have created turtles.
        self.inner.context.log().clear();
        log::info!("runtime support installed ({module}, {SUPPORT_MODULE_NAME})");
        Ok(())
    }

    /// Run one cell. Errors raised by the code are stored on the cell and
    /// reported as [`RunState::Failed`]; `Err` means the run never started.
    pub async fn run_cell(&self, id: &CellId) -> Result<RunState, ExecError> {
        let inner = &self.inner;
        let source = {
            let notebook = inner.notebook.borrow();
            let cell = notebook
                .get(id)
                .ok_or_else(|| ExecError::UnknownCell(id.to_string()))?;
            if cell.kind == CellKind::Markdown {
                return Ok(RunState::Succeeded);
            }
            if let Some(running) = notebook.running() {
                return Err(ExecError::Busy {
                    running: running.id.to_string(),
                });
            }
            cell.source.clone()
        };

        let ticket = inner.context.begin_run();
        if let Some(cell) = inner.notebook.borrow_mut().get_mut(id) {
            cell.clear_output();
            cell.state = RunState::Running;
            cell.execution_count = Some(ticket.count);
        }
        self.notify(id);
        log::info!("cell {id} started (run {})", ticket.count);

        let listener = inner.listener.borrow().clone();
        let sink = inner
            .context
            .sink(inner.notebook.clone(), id.clone(), ticket, listener);
        let outcome = match magic::parse_directive(&source) {
            Some(CellDirective::Html(markup)) => Ok(Harvest::html(markup)),
            Some(CellDirective::Pip(command)) => self.pip(command, &sink).await,
            None => self.execute(id, &source, sink).await,
        };
        Ok(self.finish(id, ticket, outcome))
    }

    async fn pip(&self, command: PipCommand, sink: &OutputSink) -> Result<Harvest, ExecError> {
        match command {
            PipCommand::Install(packages) => {
                let list = packages.join(", ");
                sink.stdout(&format!("Installing {list}...\n"));
                self.inner.runtime.install_packages(&packages).await?;
                sink.stdout(&format!("Successfully installed: {list}\n"));
            }
            PipCommand::Usage => sink.stdout(PIP_USAGE),
            PipCommand::Unsupported => sink.stdout(PIP_UNSUPPORTED),
        }
        Ok(Harvest::default())
    }

    async fn execute(&self, id: &CellId, source: &str, sink: OutputSink) -> Result<Harvest, ExecError> {
        let runtime = &self.inner.runtime;
        runtime
            .begin_run(RunScope {
                cell: id.clone(),
                sink: sink.clone(),
                input: self.inner.context.input().clone(),
            })
            .await?;
        runtime.close_figures()?;

        let code = match (self.inner.rewrite)(source) {
            Ok(rewrite) => {
                if rewrite.changed {
                    log::debug!(
                        "cell {id}: {} suspending definitions after {} rounds",
                        rewrite.suspending.len(),
                        rewrite.rounds
                    );
                }
                rewrite.code
            }
            Err(e) => {
                log::warn!("cell {id}: rewrite abandoned: {e}");
                sink.stderr(&format!("Transformation skipped: {e}\n"));
                source.to_string()
            }
        };
        if code.trim().is_empty() && !source.trim().is_empty() {
            return Err(ExecError::EmptyRewrite);
        }

        let value = match runtime.run(&code).await {
            Ok(value) => value,
            Err(e) => {
                if let Err(close) = runtime.close_figures() {
                    log::warn!("cell {id}: closing figures failed: {close}");
                }
                return Err(e);
            }
        };
        let images = runtime
            .capture_figures()?
            .iter()
            .map(|png| STANDARD.encode(png))
            .collect();
        runtime.close_figures()?;

        let mut harvest = Harvest {
            images,
            ..Harvest::default()
        };
        match value {
            RunValue::None => {}
            RunValue::Text { text } => harvest.echo = Some(text),
            RunValue::Table { html } => harvest.html = Some(html),
        }
        Ok(harvest)
    }

    fn finish(&self, id: &CellId, ticket: RunTicket, outcome: Result<Harvest, ExecError>) -> RunState {
        let context = &self.inner.context;
        if !context.is_current(ticket) {
            log::warn!("cell {id}: discarding result of stopped run {}", ticket.count);
            return RunState::Stopped;
        }
        context.invalidate();
        let state = {
            let mut notebook = self.inner.notebook.borrow_mut();
            let Some(cell) = notebook.get_mut(id) else {
                log::warn!("cell {id} was removed while running");
                return RunState::Stopped;
            };
            match outcome {
                Ok(harvest) => {
                    harvest.apply(&mut cell.output);
                    cell.state = RunState::Succeeded;
                }
                Err(e) => {
                    cell.output.error = Some(e.to_string());
                    cell.state = RunState::Failed;
                }
            }
            cell.state
        };
        log::info!("cell {id} finished: {state:?}");
        self.notify(id);
        state
    }

    /// Stop a running cell. Takes effect immediately; whatever the runtime
    /// still produces for that run is discarded.
    pub fn stop(&self, id: &CellId) -> bool {
        let inner = &self.inner;
        {
            let mut notebook = inner.notebook.borrow_mut();
            let Some(cell) = notebook.get_mut(id).filter(|c| c.is_running()) else {
                return false;
            };
            cell.state = RunState::Stopped;
            cell.output.error = Some(ExecError::Cancelled.to_string());
        }
        inner.context.invalidate();
        inner.context.input().cancel(id);
        if !inner.runtime.interrupt() {
            log::info!("cell {id} stopped; runtime keeps going in the background");
        }
        self.notify(id);
        true
    }

    /// Run every code cell in order, stopping at the first that does not succeed.
    pub async fn run_all(&self) -> Result<RunAllReport, ExecError> {
        let ids = self.inner.notebook.borrow().code_cell_ids();
        let mut report = RunAllReport::default();
        for id in ids {
            let state = match self.run_cell(&id).await {
                Ok(state) => state,
                // removed by an earlier cell's listener
                Err(ExecError::UnknownCell(_)) => continue,
                Err(e) => return Err(e),
            };
            report.ran.push(id.clone());
            if state != RunState::Succeeded {
                report.stopped_at = Some(id);
                break;
            }
        }
        Ok(report)
    }

    /// Store an uploaded file and replace the cell's source with code that loads it.
    pub fn upload_file(&self, cell: &CellId, name: &str, contents: &[u8]) -> Result<(), ExecError> {
        if self.inner.notebook.borrow().get(cell).is_none() {
            return Err(ExecError::UnknownCell(cell.to_string()));
        }
        let upload = plan_upload(name, contents);
        if upload.stored {
            self.inner.runtime.write_file(name, contents)?;
            log::info!("uploaded {name} ({} bytes)", contents.len());
        }
        self.inner
            .notebook
            .borrow_mut()
            .update_source(cell, &upload.source);
        self.notify(cell);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Uploads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub source: String,
    /// Whether the file goes into the runtime filesystem.
    pub stored: bool,
}

const TEXT_EXTENSIONS: &[&str] = &["py", "txt", "md", "js", "html", "css"];

/// Starter source for an uploaded file, chosen by extension.
pub fn plan_upload(name: &str, contents: &[u8]) -> Upload {
    let extension = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    let path = py_string(name);
    let reader = match extension.as_str() {
        "csv" => Some(format!("# Read {name}\ndf = pd.read_csv({path})")),
        "json" => Some(format!("# Read {name}\ndf = pd.read_json({path})")),
        "parquet" => Some(format!("# Read {name}\ndf = pd.read_parquet({path})")),
        "xlsx" | "xls" => Some(format!(
            "# Read {name} (requires openpyxl)\n# !pip install openpyxl\ndf = pd.read_excel({path})"
        )),
        _ => None,
    };
    if let Some(reader) = reader {
        return Upload {
            source: format!("import pandas as pd\n\n{reader}\ndf"),
            stored: true,
        };
    }
    if TEXT_EXTENSIONS.contains(&extension.as_str()) {
        return Upload {
            source: String::from_utf8_lossy(contents).into_owned(),
            stored: false,
        };
    }
    Upload {
        source: format!(
            "# File uploaded: {name}\nwith open({path}, 'rb') as f:\n    data = f.read()\n    print(f\"Loaded {{len(data)}} bytes\")"
        ),
        stored: true,
    }
}

fn py_string(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}
