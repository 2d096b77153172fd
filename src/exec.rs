//! Scoped, thread-local batching of deferred callbacks.
//!
//! Completions produced while endpoint locks are held must not run until
//! those locks are released. An [`ExecCtx`] is a thread-local scope that
//! collects such closures; the outermost scope drains them on exit. Threads
//! that invoke callbacks without an inherited context (worker threads
//! completing wrapped I/O) establish a temporary one for the duration of
//! the invocation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;

type Deferred = Box<dyn FnOnce()>;

thread_local! {
    static STATE: RefCell<CtxState> = RefCell::new(CtxState {
        depth: 0,
        queue: VecDeque::new(),
    });
}

struct CtxState {
    depth: usize,
    queue: VecDeque<Deferred>,
}

/// Guard for an execution-context scope on the current thread.
///
/// Dropping the outermost guard runs every deferred closure, including any
/// enqueued by closures already running.
pub struct ExecCtx {
    // Scopes are per-thread; keep the guard on the thread that opened it.
    _not_send: PhantomData<*mut ()>,
}

impl ExecCtx {
    /// Open a scope on the current thread. Scopes nest; only the outermost
    /// drains the queue.
    pub fn enter() -> ExecCtx {
        STATE.with(|s| s.borrow_mut().depth += 1);
        ExecCtx {
            _not_send: PhantomData,
        }
    }

    /// Whether a scope is active on the current thread.
    pub fn active() -> bool {
        STATE.with(|s| s.borrow().depth > 0)
    }

    /// Run `f` through the ambient context.
    ///
    /// If a scope is active, `f` is deferred until the outermost scope
    /// exits. Otherwise a temporary scope is established and `f` runs
    /// before this call returns.
    pub fn run(f: impl FnOnce() + 'static) {
        let mut f = Some(f);
        STATE.with(|s| {
            let mut state = s.borrow_mut();
            if state.depth > 0 {
                state.queue.push_back(Box::new(f.take().unwrap()));
            }
        });
        if let Some(f) = f {
            let _ctx = ExecCtx::enter();
            f();
            // Anything f deferred drains when _ctx drops.
        }
    }
}

impl Drop for ExecCtx {
    fn drop(&mut self) {
        let outermost = STATE.with(|s| s.borrow().depth == 1);
        if outermost {
            // Pop one closure at a time so running closures can enqueue more.
            loop {
                let next = STATE.with(|s| s.borrow_mut().queue.pop_front());
                match next {
                    Some(f) => f(),
                    None => break,
                }
            }
        }
        STATE.with(|s| s.borrow_mut().depth -= 1);
    }
}
