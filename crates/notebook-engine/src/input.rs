use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use serde::Serialize;

use crate::cell::CellId;
use crate::error::InputError;

/// A running cell waiting for one line of text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub cell_id: CellId,
    pub prompt: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    Empty,
    Pending,
    Fulfilled,
    Rejected,
}

type Reply = Result<String, InputError>;

enum Slot {
    Empty,
    Pending {
        request: InputRequest,
        reply: oneshot::Sender<Reply>,
    },
    Fulfilled,
    Rejected,
}

/// Called with the new request, or `None` once it has been consumed.
pub type InputListener = Rc<dyn Fn(Option<&InputRequest>)>;

struct Mailbox {
    slot: Slot,
    listener: Option<InputListener>,
}

/// Single-slot mailbox for input requests. Cheap to clone; all clones share
/// the slot. At most one request is outstanding at a time.
#[derive(Clone)]
pub struct InputChannel {
    inner: Rc<RefCell<Mailbox>>,
}

impl Default for InputChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputChannel")
            .field("state", &self.state())
            .finish()
    }
}

impl InputChannel {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Mailbox {
                slot: Slot::Empty,
                listener: None,
            })),
        }
    }

    pub fn set_listener(&self, listener: Option<InputListener>) {
        self.inner.borrow_mut().listener = listener;
    }

    pub fn state(&self) -> MailboxState {
        match self.inner.borrow().slot {
            Slot::Empty => MailboxState::Empty,
            Slot::Pending { .. } => MailboxState::Pending,
            Slot::Fulfilled => MailboxState::Fulfilled,
            Slot::Rejected => MailboxState::Rejected,
        }
    }

    pub fn pending(&self) -> Option<InputRequest> {
        match &self.inner.borrow().slot {
            Slot::Pending { request, .. } => Some(request.clone()),
            _ => None,
        }
    }

    /// Open a request. Fails if another one is still pending.
    pub fn request(
        &self,
        cell_id: CellId,
        prompt: &str,
        title: Option<&str>,
    ) -> Result<PendingInput, InputError> {
        let request = InputRequest {
            cell_id,
            prompt: prompt.to_string(),
            title: title.map(str::to_string),
        };
        let (tx, rx) = oneshot::channel();
        {
            let mut mailbox = self.inner.borrow_mut();
            if let Slot::Pending { request, .. } = &mailbox.slot {
                return Err(InputError::AlreadyPending {
                    cell: request.cell_id.to_string(),
                });
            }
            mailbox.slot = Slot::Pending {
                request: request.clone(),
                reply: tx,
            };
        }
        log::debug!("input requested by cell {}", request.cell_id);
        self.notify(Some(&request));
        Ok(PendingInput { reply: rx })
    }

    /// Fulfil the pending request with the user's text.
    pub fn submit(&self, text: &str) -> Result<(), InputError> {
        let reply = self.take(MailboxState::Fulfilled, |_| true)?;
        // The waiting side may have gone away; nothing to deliver then.
        let _ = reply.send(Ok(text.to_string()));
        self.notify(None);
        Ok(())
    }

    /// Reject the pending request if it belongs to `cell_id`.
    pub fn cancel(&self, cell_id: &CellId) -> bool {
        self.reject(|request| &request.cell_id == cell_id)
    }

    /// Reject whatever is pending.
    pub fn cancel_any(&self) -> bool {
        self.reject(|_| true)
    }

    fn reject(&self, matches: impl Fn(&InputRequest) -> bool) -> bool {
        match self.take(MailboxState::Rejected, matches) {
            Ok(reply) => {
                let _ = reply.send(Err(InputError::Cancelled));
                self.notify(None);
                true
            }
            Err(_) => false,
        }
    }

    /// Move a matching pending request to `next`, handing back its reply sender.
    fn take(
        &self,
        next: MailboxState,
        matches: impl Fn(&InputRequest) -> bool,
    ) -> Result<oneshot::Sender<Reply>, InputError> {
        let mut mailbox = self.inner.borrow_mut();
        match &mailbox.slot {
            Slot::Pending { request, .. } if matches(request) => {}
            _ => return Err(InputError::NoPendingRequest),
        }
        let terminal = match next {
            MailboxState::Rejected => Slot::Rejected,
            _ => Slot::Fulfilled,
        };
        match std::mem::replace(&mut mailbox.slot, terminal) {
            Slot::Pending { reply, .. } => Ok(reply),
            _ => Err(InputError::NoPendingRequest),
        }
    }

    fn notify(&self, request: Option<&InputRequest>) {
        let listener = self.inner.borrow().listener.clone();
        if let Some(listener) = listener {
            listener(request);
        }
    }
}

/// Resolves to the submitted text, or `InputError::Cancelled` on stop.
pub struct PendingInput {
    reply: oneshot::Receiver<Reply>,
}

impl Future for PendingInput {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(InputError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::cell::Cell as Counter;

    fn cell(id: &str) -> CellId {
        CellId::from(id)
    }

    #[test]
    fn test_request_then_submit() {
        let channel = InputChannel::new();
        assert_eq!(channel.state(), MailboxState::Empty);
        let pending = channel.request(cell("a"), "name? ", None).unwrap();
        assert_eq!(channel.state(), MailboxState::Pending);
        assert_eq!(channel.pending().unwrap().prompt, "name? ");
        channel.submit("Ada").unwrap();
        assert_eq!(channel.state(), MailboxState::Fulfilled);
        assert_eq!(block_on(pending), Ok("Ada".to_string()));
    }

    #[test]
    fn test_second_request_rejected_while_pending() {
        let channel = InputChannel::new();
        let _first = channel.request(cell("a"), "1", None).unwrap();
        let second = channel.request(cell("b"), "2", None);
        assert!(matches!(second, Err(InputError::AlreadyPending { cell }) if cell == "a"));
    }

    #[test]
    fn test_request_after_consumption() {
        let channel = InputChannel::new();
        let first = channel.request(cell("a"), "1", None).unwrap();
        channel.submit("x").unwrap();
        assert_eq!(block_on(first), Ok("x".into()));
        let second = channel.request(cell("a"), "2", Some("Title")).unwrap();
        assert_eq!(channel.pending().unwrap().title.as_deref(), Some("Title"));
        channel.submit("y").unwrap();
        assert_eq!(block_on(second), Ok("y".into()));
    }

    #[test]
    fn test_cancel_only_matching_cell() {
        let channel = InputChannel::new();
        let pending = channel.request(cell("a"), "?", None).unwrap();
        assert!(!channel.cancel(&cell("b")));
        assert_eq!(channel.state(), MailboxState::Pending);
        assert!(channel.cancel(&cell("a")));
        assert_eq!(channel.state(), MailboxState::Rejected);
        assert_eq!(block_on(pending), Err(InputError::Cancelled));
    }

    #[test]
    fn test_submit_without_request() {
        let channel = InputChannel::new();
        assert_eq!(channel.submit("x"), Err(InputError::NoPendingRequest));
        assert!(!channel.cancel_any());
    }

    #[test]
    fn test_consumed_exactly_once() {
        let channel = InputChannel::new();
        let _pending = channel.request(cell("a"), "?", None).unwrap();
        channel.submit("1").unwrap();
        assert_eq!(channel.submit("2"), Err(InputError::NoPendingRequest));
        assert!(!channel.cancel(&cell("a")));
    }

    #[test]
    fn test_listener_sees_open_and_close() {
        let channel = InputChannel::new();
        let opened = Rc::new(Counter::new(0));
        let closed = Rc::new(Counter::new(0));
        let (o, c) = (opened.clone(), closed.clone());
        // the listener may read the channel; no borrow is held while it runs
        let observer = channel.clone();
        channel.set_listener(Some(Rc::new(move |request: Option<&InputRequest>| {
            let _ = observer.state();
            match request {
                Some(_) => o.set(o.get() + 1),
                None => c.set(c.get() + 1),
            }
        })));
        let _pending = channel.request(cell("a"), "?", None).unwrap();
        channel.cancel_any();
        assert_eq!((opened.get(), closed.get()), (1, 1));
    }

    #[test]
    fn test_dropped_channel_cancels() {
        let pending = {
            let channel = InputChannel::new();
            let pending = channel.request(cell("a"), "?", None).unwrap();
            channel.set_listener(None);
            pending
        };
        assert_eq!(block_on(pending), Err(InputError::Cancelled));
    }
}
