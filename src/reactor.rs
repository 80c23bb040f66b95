//! The single-threaded readiness loop.
//!
//! One `Reactor` owns the selector, a token to handler table, and a
//! thread-safe task queue. Everything a connection touches lives on the
//! reactor thread; the task queue (plus its waker) is the only way work
//! crosses threads back into the core.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Instant;

use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Token reserved for the cross-thread waker.
pub const WAKER: Token = Token(usize::MAX);

/// Work posted onto the reactor thread from anywhere.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

type Handler = Rc<RefCell<Box<dyn FnMut(&mut Reactor, Ready)>>>;

/// What a dispatched handler is being told about.
#[derive(Clone, Copy, Debug)]
pub struct Ready {
    readable: bool,
    writable: bool,
    task: bool,
}

impl Ready {
    pub fn readable() -> Ready {
        Ready {
            readable: true,
            writable: false,
            task: false,
        }
    }

    pub fn writable() -> Ready {
        Ready {
            readable: false,
            writable: true,
            task: false,
        }
    }

    /// A completion notice for off-thread work, not a socket event.
    pub fn task() -> Ready {
        Ready {
            readable: false,
            writable: false,
            task: true,
        }
    }

    fn from_event(event: &Event) -> Ready {
        // read/write-closed and error states surface through the normal
        // read/write paths as EOF or an io::Error
        Ready {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
            task: false,
        }
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[inline]
    pub fn is_task(&self) -> bool {
        self.task
    }
}

/// The event loop: multiplexes every connection on one thread.
pub struct Reactor {
    poll: Poll,
    handlers: HashMap<Token, Handler>,
    tasks: Option<Receiver<Task>>,
    tx: Sender<Task>,
    waker: Arc<Waker>,
    done: Arc<AtomicBool>,
    next_token: usize,
    deadline: Option<Instant>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = mpsc::channel();
        Ok(Reactor {
            poll,
            handlers: HashMap::new(),
            tasks: Some(rx),
            tx,
            waker,
            done: Arc::new(AtomicBool::new(false)),
            next_token: 0,
            deadline: None,
        })
    }

    /// A thread-safe handle for `post` and `stop`.
    pub fn handle(&self) -> Handle {
        Handle {
            tx: self.tx.clone(),
            waker: self.waker.clone(),
            done: self.done.clone(),
        }
    }

    /// An owned registry clone, for sources that manage their own
    /// interest.
    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers a source and attaches its handler in one step.
    pub fn register<S, H>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
        handler: H,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
        H: FnMut(&mut Reactor, Ready) + 'static,
    {
        self.poll.registry().register(source, token, interest)?;
        self.insert_handler(token, handler);
        Ok(())
    }

    /// Attaches a handler for a token whose source registers itself.
    pub fn insert_handler<H>(&mut self, token: Token, handler: H)
    where
        H: FnMut(&mut Reactor, Ready) + 'static,
    {
        let handler: Box<dyn FnMut(&mut Reactor, Ready)> = Box::new(handler);
        self.handlers.insert(token, Rc::new(RefCell::new(handler)));
    }

    pub fn remove_handler(&mut self, token: Token) {
        if self.handlers.remove(&token).is_some() {
            trace!("removed handler {:?}", token);
        }
    }

    /// Dispatches a readiness (or task) notice to a token's handler.
    ///
    /// Handlers are free to cancel interest mid-pass; a token without a
    /// handler, or one already running, is skipped rather than re-entered.
    pub fn notify(&mut self, token: Token, ready: Ready) {
        let handler = match self.handlers.get(&token) {
            Some(h) => h.clone(),
            None => {
                trace!("{:?} ready with no handler", token);
                return;
            }
        };
        let borrow_result = handler.try_borrow_mut();
        match borrow_result {
            Ok(mut h) => (&mut **h)(self, ready),
            Err(_) => warn!("{:?} re-entrant dispatch skipped", token),
        }
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Blocks in the selector until stopped (or past the deadline).
    ///
    /// Each pass drains the task queue first, then dispatches the ready
    /// set. The ready set is drained per pass and never carried over, so a
    /// one-shot callback that cancelled itself cannot be re-invoked by a
    /// stale bit.
    pub fn run(&mut self) -> io::Result<()> {
        debug!("reactor running");
        let mut events = Events::with_capacity(256);
        while !self.is_done() {
            let timeout = match self.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("reactor deadline reached");
                        break;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.run_tasks();
            if self.is_done() {
                break;
            }
            for event in events.iter() {
                let token = event.token();
                if token == WAKER {
                    continue;
                }
                self.notify(token, Ready::from_event(event));
            }
        }
        debug!("reactor done");
        Ok(())
    }

    fn run_tasks(&mut self) {
        let rx = match self.tasks.take() {
            Some(rx) => rx,
            None => return,
        };
        while let Ok(task) = rx.try_recv() {
            task(self);
        }
        self.tasks = Some(rx);
    }
}

/// Thread-safe entry points into a running reactor.
#[derive(Clone)]
pub struct Handle {
    tx: Sender<Task>,
    waker: Arc<Waker>,
    done: Arc<AtomicBool>,
}

impl Handle {
    /// Enqueues work for the reactor thread and wakes the selector.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Flags the loop to terminate and wakes the selector.
    pub fn stop(&self) {
        self.done.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}
