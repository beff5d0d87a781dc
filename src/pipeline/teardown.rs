use color_eyre::Result;
use tracing::{debug, warn};

type ReleaseAction = Box<dyn FnOnce() -> Result<()> + Send>;

/// Release actions accumulated as resources are acquired, run last-in first-out.
#[derive(Default)]
pub(crate) struct Teardown {
    actions: Vec<(&'static str, ReleaseAction)>,
}

impl Teardown {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, name: &'static str, action: impl FnOnce() -> Result<()> + Send + 'static) {
        self.actions.push((name, Box::new(action)));
    }

    /// Run every action, newest first. Failures are logged and do not stop the
    /// remaining actions. Returns the number of failures.
    pub(crate) fn run(self) -> usize {
        let mut failures = 0;
        for (name, action) in self.actions.into_iter().rev() {
            match action() {
                Ok(()) => debug!(resource = name, "released"),
                Err(err) => {
                    failures += 1;
                    warn!(resource = name, "release failed: {err:#}");
                }
            }
        }
        failures
    }
}
