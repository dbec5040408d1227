//! Operator input capability.
//!
//! The countdown prompts (fstab merge confirmation, transactional-apply
//! commit protocol) need both a 1 Hz ticker and a cancellable line read.
//! Modeled as `PromptWithDeadline(deadline) -> (answer, err)`; the core
//! never special-cases terminal-vs-pipe, it just calls this trait.

use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("input aborted")]
    Aborted,
    #[error("deadline elapsed before operator responded")]
    DeadlineElapsed,
}

pub trait Prompter: Send + Sync {
    /// Print `label` and a 1 Hz countdown against `deadline`, returning the
    /// trimmed line the operator typed, or `Err(PromptError::DeadlineElapsed)`
    /// if nothing arrived in time.
    fn prompt_with_deadline(&self, label: &str, deadline: Instant) -> Result<String, PromptError>;
}

pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn prompt_with_deadline(&self, label: &str, deadline: Instant) -> Result<String, PromptError> {
        let (tx, rx) = mpsc::channel::<io::Result<Option<String>>>();
        std::thread::spawn(move || {
            let stdin = io::stdin();
            let mut line = String::new();
            let res = stdin.lock().read_line(&mut line);
            let _ = tx.send(res.map(|n| if n == 0 { None } else { Some(line) }));
        });

        println!("{label}");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PromptError::DeadlineElapsed);
            }

            print!("\r  {:>3}s remaining... ", remaining.as_secs());
            let _ = io::stdout().flush();

            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(Ok(Some(line))) => {
                    println!();
                    return Ok(line.trim().to_string());
                }
                Ok(Ok(None)) => return Err(PromptError::Aborted),
                Ok(Err(_)) => return Err(PromptError::Aborted),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(PromptError::Aborted),
            }
        }
    }
}

/// Test/non-interactive double: returns a fixed canned answer immediately,
/// or simulates a deadline elapsing if `canned` is `None`.
pub struct CannedPrompter {
    pub canned: Option<String>,
}

impl Prompter for CannedPrompter {
    fn prompt_with_deadline(&self, _label: &str, _deadline: Instant) -> Result<String, PromptError> {
        match &self.canned {
            Some(s) => Ok(s.clone()),
            None => Err(PromptError::DeadlineElapsed),
        }
    }
}
