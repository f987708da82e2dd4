//! Retry with a fixed wait schedule
//!
//! `Retryer` is an optional wrapper for callers that want to retry individual
//! store calls. The migration path does not use it: a failed store call there
//! surfaces immediately.
//!
//! # Example
//!
//! ```rust
//! use harbormaster::retry::Retryer;
//! use std::time::Duration;
//!
//! let mut attempts = 0;
//! let result: Result<&str, String> = Retryer::new()
//!     .with_waits([Duration::from_millis(1), Duration::from_millis(2)])
//!     .on_error(|attempt, err| log::warn!("attempt {attempt} failed: {err}"))
//!     .run(|| {
//!         attempts += 1;
//!         if attempts < 3 { Err("not yet".to_string()) } else { Ok("done") }
//!     });
//! assert_eq!(result.unwrap(), "done");
//! ```

use std::fmt::Display;
use std::time::Duration;

type Notifier = Box<dyn FnMut(usize, &dyn Display) + Send>;
type WaitFn = Box<dyn FnMut(Duration) + Send>;

pub struct Retryer {
    /// Wait before each attempt; the first entry is the initial, immediate attempt
    waits: Vec<Duration>,
    notifier: Notifier,
    wait_fn: WaitFn,
}

impl Default for Retryer {
    fn default() -> Self {
        Self::new()
    }
}

impl Retryer {
    /// A retryer that makes a single attempt
    pub fn new() -> Self {
        Self {
            waits: vec![Duration::ZERO],
            notifier: Box::new(|_, _| {}),
            // Yields the coroutine when called inside one, sleeps the thread otherwise
            wait_fn: Box::new(may::coroutine::sleep),
        }
    }

    /// Append one retry per wait, each attempted after sleeping for that wait
    #[must_use]
    pub fn with_waits(mut self, waits: impl IntoIterator<Item = Duration>) -> Self {
        self.waits.extend(waits);
        self
    }

    /// Called with the 1-based attempt number after every failed attempt
    #[must_use]
    pub fn on_error(mut self, notifier: impl FnMut(usize, &dyn Display) + Send + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    /// Replace the sleep between attempts
    #[must_use]
    pub fn with_wait_fn(mut self, wait_fn: impl FnMut(Duration) + Send + 'static) -> Self {
        self.wait_fn = Box::new(wait_fn);
        self
    }

    /// Number of attempts `run` makes before giving up
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.waits.len()
    }

    /// Run `op` until it succeeds or the wait schedule is exhausted
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub fn run<T, E: Display>(&mut self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            (self.wait_fn)(self.waits[attempt]);
            attempt += 1;

            match op() {
                Ok(value) => return Ok(value),
                Err(err) => {
                    (self.notifier)(attempt, &err);
                    if attempt == self.waits.len() {
                        return Err(err);
                    }
                }
            }
        }
    }
}
