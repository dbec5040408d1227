//! Capability interfaces.
//!
//! Per §9's design note, the restore core threads a `Capabilities` record
//! through construction rather than reaching for package-level mutable
//! slots. All side effects — filesystem, process execution, clock,
//! operator prompts, host identity — pass through here; there is no direct
//! syscall anywhere else in the crate.

pub mod clock;
pub mod fs;
pub mod process;
pub mod prompt;
pub mod system;

use std::sync::Arc;

pub use clock::Clock;
pub use fs::Fs;
pub use process::Runner;
pub use prompt::Prompter;

#[derive(Clone)]
pub struct Capabilities {
    pub fs: Arc<dyn Fs>,
    pub runner: Arc<dyn Runner>,
    pub clock: Arc<dyn Clock>,
    pub prompt: Arc<dyn Prompter>,
}

impl Capabilities {
    pub fn real() -> Self {
        Self {
            fs: Arc::new(fs::RealFs),
            runner: Arc::new(process::ProcessRunner::new()),
            clock: Arc::new(clock::RealClock),
            prompt: Arc::new(prompt::StdinPrompter),
        }
    }

    pub fn system(&self) -> system::RealSystemInfo<'_> {
        system::RealSystemInfo::new(self.runner.as_ref())
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::capability::clock::FakeClock;
    use crate::capability::prompt::CannedPrompter;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A `Runner` double driven entirely by canned outputs keyed on the
    /// rendered command line, so staged-apply / service-controller /
    /// fstab-merger tests never shell out.
    #[derive(Default)]
    pub struct FakeRunner {
        pub captures: RefCell<HashMap<String, String>>,
        pub statuses: RefCell<HashMap<String, i32>>,
        pub calls: RefCell<Vec<String>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_capture(self, cmdline: &str, out: &str) -> Self {
            self.captures
                .borrow_mut()
                .insert(cmdline.to_string(), out.to_string());
            self
        }

        pub fn with_status(self, cmdline: &str, code: i32) -> Self {
            self.statuses
                .borrow_mut()
                .insert(cmdline.to_string(), code);
            self
        }
    }

    impl Runner for FakeRunner {
        fn run(&self, pipeline: &process::Pipeline) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(pipeline.render());
            Ok(())
        }

        fn run_capture(&self, pipeline: &process::Pipeline) -> anyhow::Result<String> {
            let key = pipeline.render();
            self.calls.borrow_mut().push(key.clone());
            Ok(self
                .captures
                .borrow()
                .get(&key)
                .cloned()
                .unwrap_or_default())
        }

        fn run_status(&self, cmd: &process::CmdSpec) -> anyhow::Result<i32> {
            let key = cmd.render();
            self.calls.borrow_mut().push(key.clone());
            Ok(*self.statuses.borrow().get(&key).unwrap_or(&0))
        }

        fn run_with_deadline(
            &self,
            cmd: &process::CmdSpec,
            _deadline: Option<std::time::Instant>,
        ) -> anyhow::Result<process::RunOutcome> {
            let code = self.run_status(cmd)?;
            Ok(process::RunOutcome::Exited(code))
        }
    }

    pub fn fake_caps(runner: FakeRunner) -> Capabilities {
        fake_caps_with_runner(Arc::new(runner))
    }

    /// Like `fake_caps`, but the caller keeps its own `Arc<FakeRunner>` so
    /// it can inspect `.calls` after the capability under test runs.
    pub fn fake_caps_with_runner(runner: Arc<FakeRunner>) -> Capabilities {
        Capabilities {
            fs: Arc::new(fs::RealFs),
            runner,
            clock: Arc::new(FakeClock::new(1_700_000_000)),
            prompt: Arc::new(CannedPrompter { canned: None }),
        }
    }
}
