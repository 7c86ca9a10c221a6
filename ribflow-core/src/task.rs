//! Named logical task scopes.
//!
//! The control plane is built around named logical tasks ("membership",
//! "send-update", ...) with the rule that state owned by a task is only
//! mutated while running on that task. The scheduler that provides this
//! exclusion lives outside this crate; what lives here is the bookkeeping
//! that lets debug builds verify the rule:
//!
//! - A loop (or a test) enters a scope with [`TaskScope::enter`].
//! - Mutation entry points call [`check`] with the task names allowed to
//!   run them.
//!
//! Checks are `debug_assert!`-grade: they vanish in release builds. Code
//! running outside any scope is not checked, so embedders that do not use
//! scopes are unaffected.

use std::cell::RefCell;
use std::marker::PhantomData;

thread_local! {
    static TASK_STACK: RefCell<Vec<&'static str>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard marking the current thread as running the named task.
///
/// Scopes nest; the innermost one is the current task. The guard is not
/// `Send`, so a scope cannot outlive its thread.
pub struct TaskScope {
    _not_send: PhantomData<*const ()>,
}

impl TaskScope {
    #[must_use]
    pub fn enter(name: &'static str) -> Self {
        TASK_STACK.with(|stack| stack.borrow_mut().push(name));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for TaskScope {
    fn drop(&mut self) {
        TASK_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The innermost task scope on this thread, if any.
#[must_use]
pub fn current() -> Option<&'static str> {
    TASK_STACK.with(|stack| stack.borrow().last().copied())
}

/// Debug-assert that the current thread runs one of the named tasks.
///
/// No-op when no scope has been entered, and in release builds.
#[inline]
pub fn check(allowed: &[&str]) {
    #[cfg(debug_assertions)]
    {
        if let Some(name) = current() {
            assert!(
                allowed.contains(&name),
                "task affinity violation: running on {name:?}, allowed {allowed:?}"
            );
        }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = allowed;
    }
}
