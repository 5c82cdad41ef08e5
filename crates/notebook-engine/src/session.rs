use std::cell::{Cell as Flag, RefCell};
use std::rc::Rc;

use crate::cell::{CellId, Notebook};
use crate::command_log::CommandLog;
use crate::input::InputChannel;
use crate::turtle::TurtleShim;

/// Called with the id of a cell whose visible state changed.
pub type ChangeListener = Rc<dyn Fn(&CellId)>;

/// Identifies one run. Output and results carrying a stale ticket are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket {
    pub id: u64,
    /// Execution count shown next to the cell.
    pub count: u32,
}

/// State shared by every run of a notebook session: the command log, the
/// turtle shim writing into it, and the input mailbox.
/// Created once per session and closed explicitly.
pub struct ExecutionContext {
    log: CommandLog,
    shim: Rc<RefCell<TurtleShim>>,
    input: InputChannel,

    /// Number of code runs so far.
    counter: Flag<u32>,

    /// Ticket of the run allowed to write results. Bumped on every start and stop.
    current: Rc<Flag<u64>>,

    closed: Flag<bool>,
}

impl ExecutionContext {
    pub fn new(default_turtle_speed: u8) -> Self {
        let log = CommandLog::new();
        let shim = TurtleShim::new(log.clone(), default_turtle_speed);
        Self {
            log,
            shim: Rc::new(RefCell::new(shim)),
            input: InputChannel::new(),
            counter: Flag::new(0),
            current: Rc::new(Flag::new(0)),
            closed: Flag::new(false),
        }
    }

    pub fn log(&self) -> &CommandLog {
        &self.log
    }

    pub fn shim(&self) -> Rc<RefCell<TurtleShim>> {
        self.shim.clone()
    }

    pub fn input(&self) -> &InputChannel {
        &self.input
    }

    pub fn execution_count(&self) -> u32 {
        self.counter.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Start a run: fresh command log and turtle screen, new ticket.
    pub fn begin_run(&self) -> RunTicket {
        self.log.clear();
        self.shim.borrow_mut().begin_run();
        let count = self.counter.get() + 1;
        self.counter.set(count);
        let id = self.current.get() + 1;
        self.current.set(id);
        RunTicket { id, count }
    }

    pub fn is_current(&self, ticket: RunTicket) -> bool {
        self.is_live(ticket.id)
    }

    /// Whether the run numbered `run` may still produce output or ask for input.
    pub fn is_live(&self, run: u64) -> bool {
        self.current.get() == run
    }

    /// Make the running ticket stale so nothing it produces lands anywhere.
    pub fn invalidate(&self) {
        self.current.set(self.current.get() + 1);
    }

    /// A sink appending to `cell` for as long as `ticket` is current.
    pub fn sink(
        &self,
        notebook: Rc<RefCell<Notebook>>,
        cell: CellId,
        ticket: RunTicket,
        listener: Option<ChangeListener>,
    ) -> OutputSink {
        OutputSink {
            notebook,
            cell,
            ticket: ticket.id,
            current: self.current.clone(),
            listener,
        }
    }

    /// Reject pending input, drop the log and refuse further output.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        self.input.cancel_any();
        self.invalidate();
        self.log.clear();
        log::info!("execution context closed after {} runs", self.counter.get());
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// Streaming output
// ----------------------------------------------------------------------------

/// Appends streamed text to a cell's output as it arrives.
#[derive(Clone)]
pub struct OutputSink {
    notebook: Rc<RefCell<Notebook>>,
    cell: CellId,
    ticket: u64,
    current: Rc<Flag<u64>>,
    listener: Option<ChangeListener>,
}

impl OutputSink {
    pub fn cell(&self) -> &CellId {
        &self.cell
    }

    /// Number of the run this sink writes for.
    pub fn run(&self) -> u64 {
        self.ticket
    }

    pub fn is_live(&self) -> bool {
        self.current.get() == self.ticket
    }

    pub fn stdout(&self, text: &str) {
        self.write(text, false);
    }

    /// Stderr goes into the output alongside stdout and is also kept apart.
    pub fn stderr(&self, text: &str) {
        self.write(text, true);
    }

    /// Dispatch on the stream name used by the Python side.
    pub fn stream(&self, stream: &str, text: &str) {
        self.write(text, stream == "stderr");
    }

    fn write(&self, text: &str, is_err: bool) {
        if text.is_empty() || !self.is_live() {
            return;
        }
        {
            let mut notebook = self.notebook.borrow_mut();
            let Some(cell) = notebook.get_mut(&self.cell) else {
                return;
            };
            cell.output.text.push_str(text);
            if is_err {
                cell.output.stderr.push_str(text);
            }
        }
        if let Some(listener) = &self.listener {
            listener(&self.cell);
        }
    }
}

/// The sink of the run most recently started, shared with the interpreter's
/// stream callback. Writes name the run that produced them and land only if
/// that run is the installed one.
#[derive(Clone, Default)]
pub struct SinkSlot {
    sink: Rc<RefCell<Option<OutputSink>>>,
}

impl SinkSlot {
    pub fn install(&self, sink: OutputSink) {
        *self.sink.borrow_mut() = Some(sink);
    }

    pub fn stream(&self, run: u64, stream: &str, text: &str) {
        let sink = self.sink.borrow().clone();
        match sink {
            Some(sink) if sink.run() == run => sink.stream(stream, text),
            _ => log::debug!("dropped {} bytes of {stream} from run {run}", text.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, CellKind};

    fn notebook_with(id: &str) -> Rc<RefCell<Notebook>> {
        let cell = Cell::with_id(CellId::from(id), CellKind::Code, "print(1)");
        Rc::new(RefCell::new(Notebook::from_cells(vec![cell])))
    }

    #[test]
    fn test_begin_run_resets_log_and_counts() {
        let context = ExecutionContext::new(6);
        let shim = context.shim();
        let id = shim.borrow_mut().default_turtle();
        shim.borrow_mut().forward(id, 10.0);
        assert!(!context.log().is_empty());

        let first = context.begin_run();
        assert!(context.log().is_empty());
        let second = context.begin_run();
        assert_eq!((first.count, second.count), (1, 2));
        assert!(!context.is_current(first));
        assert!(context.is_current(second));
    }

    #[test]
    fn test_sink_appends_streams() {
        let context = ExecutionContext::new(6);
        let notebook = notebook_with("a");
        let ticket = context.begin_run();
        let sink = context.sink(notebook.clone(), CellId::from("a"), ticket, None);
        sink.stdout("hello\n");
        sink.stream("stderr", "warn\n");
        sink.stream("stdout", "done");
        let notebook = notebook.borrow();
        let output = &notebook.get(&CellId::from("a")).unwrap().output;
        assert_eq!(output.text, "hello\nwarn\ndone");
        assert_eq!(output.stderr, "warn\n");
    }

    #[test]
    fn test_stale_sink_is_silent() {
        let context = ExecutionContext::new(6);
        let notebook = notebook_with("a");
        let ticket = context.begin_run();
        let sink = context.sink(notebook.clone(), CellId::from("a"), ticket, None);
        context.invalidate();
        sink.stdout("late");
        assert!(!sink.is_live());
        assert_eq!(notebook.borrow().cells()[0].output.text, "");
    }

    #[test]
    fn test_slot_drops_writes_from_stopped_run() {
        let context = ExecutionContext::new(6);
        let notebook = Rc::new(RefCell::new(Notebook::from_cells(vec![
            Cell::with_id(CellId::from("a"), CellKind::Code, "input()"),
            Cell::with_id(CellId::from("b"), CellKind::Code, "print(2)"),
        ])));
        let slot = SinkSlot::default();

        let first = context.begin_run();
        slot.install(context.sink(notebook.clone(), CellId::from("a"), first, None));
        slot.stream(first.id, "stdout", "one\n");
        context.invalidate();

        let second = context.begin_run();
        slot.install(context.sink(notebook.clone(), CellId::from("b"), second, None));
        assert!(!context.is_live(first.id));
        assert!(context.is_live(second.id));
        // the stopped run's coroutine resumes and prints
        slot.stream(first.id, "stdout", "late\n");
        slot.stream(second.id, "stdout", "two\n");

        let notebook = notebook.borrow();
        assert_eq!(notebook.get(&CellId::from("a")).unwrap().output.text, "one\n");
        assert_eq!(notebook.get(&CellId::from("b")).unwrap().output.text, "two\n");
    }

    #[test]
    fn test_sink_notifies_listener() {
        let context = ExecutionContext::new(6);
        let notebook = notebook_with("a");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let record = seen.clone();
        let reader = notebook.clone();
        let listener: ChangeListener = Rc::new(move |id: &CellId| {
            // listeners may read the notebook
            let _ = reader.borrow().len();
            record.borrow_mut().push(id.to_string());
        });
        let ticket = context.begin_run();
        let sink = context.sink(notebook, CellId::from("a"), ticket, Some(listener));
        sink.stdout("x");
        sink.stdout("");
        assert_eq!(*seen.borrow(), vec!["a".to_string()]);
    }

    #[test]
    fn test_close_cancels_pending_input() {
        let context = ExecutionContext::new(6);
        let pending = context.input().request(CellId::from("a"), "?", None).unwrap();
        context.close();
        assert!(context.is_closed());
        assert_eq!(
            futures::executor::block_on(pending),
            Err(crate::error::InputError::Cancelled)
        );
    }
}
