//! Thread-local scopes that restrict what the current thread may do.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static NO_SAFEPOINT_DEPTH: Cell<u32> = const { Cell::new(0) };
    static IN_ASYNC_STACK_WALK: Cell<bool> = const { Cell::new(false) };
}

/// Forbids reaching a safepoint while alive.
///
/// Held by everyone who takes the exception-cache or inline-cache lock and
/// by `make_not_entrant`: none of them may block for a collection while
/// their critical section is open. Scopes nest.
#[derive(Debug)]
pub struct NoSafepointVerifier {
    // Tied to the creating thread.
    _not_send: PhantomData<*const ()>,
}

impl NoSafepointVerifier {
    /// Opens a scope on the current thread.
    pub fn new() -> NoSafepointVerifier {
        NO_SAFEPOINT_DEPTH.with(|d| d.set(d.get() + 1));
        NoSafepointVerifier {
            _not_send: PhantomData,
        }
    }
}

impl Default for NoSafepointVerifier {
    fn default() -> NoSafepointVerifier {
        NoSafepointVerifier::new()
    }
}

impl Drop for NoSafepointVerifier {
    fn drop(&mut self) {
        NO_SAFEPOINT_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Whether the current thread is inside a [`NoSafepointVerifier`] scope.
pub fn is_in_no_safepoint_scope() -> bool {
    NO_SAFEPOINT_DEPTH.with(|d| d.get() > 0)
}

/// Called where the current thread could block for a safepoint.
///
/// # Panics
///
/// Panics inside a [`NoSafepointVerifier`] scope.
pub fn check_safepoint_allowed() {
    assert!(
        !is_in_no_safepoint_scope(),
        "safepoint check inside a no-safepoint scope"
    );
}

/// Marks the current thread as walking a stack from an asynchronous
/// context such as a profiling signal handler.
///
/// Lookups performed inside leave every shared cache untouched.
#[derive(Debug)]
pub struct AsyncStackWalkScope {
    previous: bool,
    _not_send: PhantomData<*const ()>,
}

impl AsyncStackWalkScope {
    /// Enters the scope on the current thread.
    pub fn enter() -> AsyncStackWalkScope {
        let previous = IN_ASYNC_STACK_WALK.with(|w| w.replace(true));
        AsyncStackWalkScope {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for AsyncStackWalkScope {
    fn drop(&mut self) {
        IN_ASYNC_STACK_WALK.with(|w| w.set(self.previous));
    }
}

/// Whether the current thread is inside an [`AsyncStackWalkScope`].
pub fn is_in_async_stack_walk() -> bool {
    IN_ASYNC_STACK_WALK.with(|w| w.get())
}
