//! Deferred teardown stack.
//!
//! Every construction-pipeline step that succeeds pushes its stop action here
//! before the next step begins. Unwinding pops and runs actions in strict
//! reverse order of construction, so a component may safely hold references
//! into anything constructed before it. A failure mid-pipeline unwinds
//! everything built so far before the error propagates.
//!
//! Stop actions are not expected to fail under correct usage; an action that
//! does fail is logged and the remaining actions still run.

use tracing::{debug, error};

use crate::error::NodeError;

type Action = Box<dyn FnOnce() -> Result<(), NodeError> + Send>;

/// Ordered record of shutdown actions, unwound LIFO.
#[derive(Default)]
pub struct DeferredStack {
    actions: Vec<(&'static str, Action)>,
}

impl DeferredStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a labelled stop action. The label names the construction step
    /// the action belongs to and shows up in shutdown logs.
    pub fn push<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> Result<(), NodeError> + Send + 'static,
    {
        self.actions.push((label, Box::new(action)));
    }

    /// Append an infallible stop action.
    pub fn push_ok<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(label, move || {
            action();
            Ok(())
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pop and run every action, newest first. Each action runs exactly once.
    ///
    /// Returns the labels in the order they were executed.
    pub fn unwind(&mut self) -> Vec<&'static str> {
        let mut executed = Vec::with_capacity(self.actions.len());
        while let Some((label, action)) = self.actions.pop() {
            debug!(step = label, "Running teardown action");
            if let Err(e) = action() {
                error!(step = label, error = %e, "Teardown action failed; continuing unwind");
            }
            executed.push(label);
        }
        executed
    }
}

impl Drop for DeferredStack {
    fn drop(&mut self) {
        if !self.is_empty() {
            self.unwind();
        }
    }
}
