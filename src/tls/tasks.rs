//! The shared worker pool for delegated engine work.
//!
//! Process-wide and lazily started: the first connection that delegates
//! work brings the pool up, `shutdown` tears it down (the next delegation
//! would bring it back). Completions never touch connection state; the
//! submitted closure is expected to finish by posting a task back onto the
//! connection's reactor.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

pub type Work = Box<dyn FnOnce() + Send + 'static>;

enum Msg {
    Run(Work),
    Shutdown,
}

struct Pool {
    tx: Sender<Msg>,
    threads: Vec<thread::JoinHandle<()>>,
}

const WORKERS: usize = 2;

static POOL: OnceLock<Mutex<Option<Pool>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Pool>> {
    POOL.get_or_init(|| Mutex::new(None))
}

fn start() -> Pool {
    debug!("starting {} tls workers", WORKERS);
    let (tx, rx) = mpsc::channel::<Msg>();
    let rx = Arc::new(Mutex::new(rx));
    let threads = (0..WORKERS)
        .map(|i| {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("wick-tls-{}", i))
                .spawn(move || loop {
                    let msg = {
                        let rx = rx.lock().unwrap();
                        rx.recv()
                    };
                    match msg {
                        Ok(Msg::Run(work)) => work(),
                        Ok(Msg::Shutdown) | Err(_) => return,
                    }
                })
                .expect("spawn tls worker")
        })
        .collect();
    Pool { tx, threads }
}

/// Runs `work` on the pool, starting it on first use.
pub fn execute(work: Work) {
    let mut pool = slot().lock().unwrap();
    if pool.is_none() {
        *pool = Some(start());
    }
    let msg = match pool.as_ref().expect("pool just started").tx.send(Msg::Run(work)) {
        Ok(()) => return,
        Err(err) => err.0,
    };
    // the workers can only be gone if a shutdown raced us; restart
    *pool = Some(start());
    let _ = pool.as_ref().expect("pool just restarted").tx.send(msg);
}

/// Stops the workers and joins them. Idempotent.
pub fn shutdown() {
    let pool = slot().lock().unwrap().take();
    if let Some(pool) = pool {
        debug!("shutting down tls workers");
        for _ in &pool.threads {
            let _ = pool.tx.send(Msg::Shutdown);
        }
        for thread in pool.threads {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::{execute, shutdown};

    #[test]
    fn test_execute_and_shutdown() {
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let mut got: Vec<i32> = (0..4).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2, 3]);
        shutdown();
        shutdown();
    }
}
