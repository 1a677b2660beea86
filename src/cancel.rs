use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cancellation is a cloneable stop flag shared between the Ctrl-C handler
/// and the (single) worker loop. Sleeping via Cancellation::sleep returns
/// early as soon as cancel() is called, which keeps shutdown prompt even
/// while we're waiting for a device to show up.
#[derive(Clone, Default)]
pub struct Cancellation {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Cancellation {
    pub fn new() -> Cancellation {
        Cancellation::default()
    }

    pub fn cancel(&self) {
        let (cancelled, condvar) = &*self.state;
        // A poisoned lock can only result from a panic while holding it, at
        // which point nobody is left to wake.
        if let Ok(mut cancelled) = cancelled.lock() {
            *cancelled = true;
            condvar.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let (cancelled, _) = &*self.state;
        cancelled.lock().map(|c| *c).unwrap_or(true)
    }

    /// Sleeps for up to `duration`. Returns true if cancelled (either before
    /// or during the sleep), false if the full duration elapsed. A duration
    /// too large to represent as a deadline sleeps until cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let (cancelled, condvar) = &*self.state;
        let Ok(mut guard) = cancelled.lock() else {
            return true;
        };
        loop {
            if *guard {
                return true;
            }
            // Spurious wakeups are possible, hence the loop.
            let woken = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    condvar
                        .wait_timeout(guard, deadline - now)
                        .map(|(guard, _)| guard)
                        .map_err(drop)
                }
                None => condvar.wait(guard).map_err(drop),
            };
            guard = match woken {
                Ok(guard) => guard,
                Err(_) => return true,
            };
        }
    }
}
