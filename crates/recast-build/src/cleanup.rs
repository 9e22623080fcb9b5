//! Scoped cleanup of build resources.

use std::fmt;

use recast_common::error::Result;

type Action<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Cleanup actions run in reverse registration order.
///
/// Actions run on [`CleanupStack::run`] or, failing that, on drop, so they
/// also fire when a build bails out early or unwinds. A failing action is
/// logged and never stops the remaining ones.
#[derive(Default)]
pub struct CleanupStack<'a> {
    actions: Vec<(&'static str, Action<'a>)>,
}

impl<'a> CleanupStack<'a> {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under a short label used in logs.
    pub fn push(&mut self, label: &'static str, action: impl FnOnce() -> Result<()> + 'a) {
        self.actions.push((label, Box::new(action)));
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns `true` if no action is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every pending action and returns how many failed.
    pub fn run(&mut self) -> usize {
        let mut failures = 0;
        while let Some((label, action)) = self.actions.pop() {
            match action() {
                Ok(()) => tracing::debug!(action = label, "cleanup done"),
                Err(e) => {
                    failures += 1;
                    tracing::warn!(action = label, error = %e, "cleanup failed");
                }
            }
        }
        failures
    }
}

impl fmt::Debug for CleanupStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.actions.iter().map(|(label, _)| label))
            .finish()
    }
}

impl Drop for CleanupStack<'_> {
    fn drop(&mut self) {
        let _ = self.run();
    }
}
