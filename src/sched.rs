//! Scheduler substrate (component C).
//!
//! Every PCB (UDP or TCP) embeds a [`SchedState`] and a [`SchedCtx`], but
//! all PCBs in a table share the *same* mutex (`spec.md` §5: "one mutex per
//! protocol module guards its PCB table"). So `sleep`/`interrupt` take an
//! accessor closure that picks the right PCB's [`SchedState`] out of
//! whatever the guard protects, rather than assuming the guarded value
//! directly embeds one. `sleep` mirrors the reference `sched_sleep`: it
//! atomically releases the caller's mutex guard, waits on the condition
//! variable, and reacquires the guard before returning — exactly what
//! [`Condvar::wait`] already does, so there is no need to hand-roll the
//! release/reacquire dance the C original gets via `pthread_cond_wait`.

use std::sync::{Condvar, MutexGuard};
use std::time::{Duration, Instant};

/// The portion of a mutex-protected PCB that the scheduler substrate reads
/// and mutates. Embedded by value in `UdpPcb`/`TcpPcb`.
#[derive(Debug, Default)]
pub struct SchedState {
    pub interrupted: bool,
    pub waiters: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Woken,
    Interrupted,
    TimedOut,
}

/// Returned by [`destroy`] when waiters remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("scheduler context has waiters")]
pub struct Busy;

/// A per-PCB condition variable. `ctx_init`/`ctx_destroy` in the reference
/// implementation correspond to `SchedCtx::new` and [`destroy`]; Rust's
/// `Drop` makes an explicit teardown call unnecessary once no waiters
/// remain.
#[derive(Debug, Default)]
pub struct SchedCtx {
    cond: Condvar,
}

impl SchedCtx {
    pub fn new() -> Self {
        SchedCtx { cond: Condvar::new() }
    }

    /// Wakes every thread currently sleeping on this context.
    pub fn wakeup(&self) {
        self.cond.notify_all();
    }

    /// Sets the interrupted flag (located via `state_of`) and wakes every
    /// waiter. Mirrors `sched_interrupt`; called from the global event
    /// handler on `net_raise_event` (component M).
    pub fn interrupt<T>(&self, guarded: &mut T, state_of: impl FnOnce(&mut T) -> &mut SchedState) {
        state_of(guarded).interrupted = true;
        self.cond.notify_all();
    }

    /// Atomically releases `guard`, blocks until woken or `deadline`
    /// elapses, then reacquires it. If the context was already interrupted
    /// on entry, returns immediately without sleeping. `state_of` locates
    /// this context's [`SchedState`] inside the guarded table on each
    /// access, since one mutex may protect many PCBs' contexts.
    pub fn sleep<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
        state_of: impl Fn(&mut T) -> &mut SchedState,
    ) -> (MutexGuard<'a, T>, SleepOutcome) {
        let mut guard = guard;
        {
            let state = state_of(&mut guard);
            if state.interrupted {
                if state.waiters == 0 {
                    state.interrupted = false;
                }
                return (guard, SleepOutcome::Interrupted);
            }
            state.waiters += 1;
        }

        let (mut guard, timed_out) = match deadline {
            None => (self.cond.wait(guard).expect("protocol mutex poisoned"), false),
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let (guard, result) = self
                    .cond
                    .wait_timeout(guard, timeout)
                    .expect("protocol mutex poisoned");
                (guard, result.timed_out())
            }
        };

        let state = state_of(&mut guard);
        state.waiters -= 1;
        let interrupted = state.interrupted;
        if interrupted && state.waiters == 0 {
            state.interrupted = false;
        }

        let outcome = if interrupted {
            SleepOutcome::Interrupted
        } else if timed_out {
            SleepOutcome::TimedOut
        } else {
            SleepOutcome::Woken
        };
        (guard, outcome)
    }
}

/// Mirrors `sched_ctx_destroy`: fails while any waiter remains so the
/// caller can wake them and retry from a later context instead of freeing
/// state someone is still blocked on.
pub fn destroy(state: &SchedState) -> Result<(), Busy> {
    if state.waiters > 0 { Err(Busy) } else { Ok(()) }
}

/// Convenience: an absolute deadline `timeout` from now, or `None` for "no
/// timeout" when `timeout` is `None`.
pub fn deadline_from(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|d| Instant::now() + d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    struct Pcb {
        sched: SchedState,
        ready: bool,
    }

    #[test]
    fn wakeup_releases_a_sleeping_waiter() {
        let mutex = Arc::new(Mutex::new(Pcb { sched: SchedState::default(), ready: false }));
        let ctx = Arc::new(SchedCtx::new());

        let (m2, c2) = (mutex.clone(), ctx.clone());
        let worker = thread::spawn(move || {
            let mut guard = m2.lock().unwrap();
            while !guard.ready {
                let (g, outcome) = c2.sleep(guard, None, |pcb| &mut pcb.sched);
                guard = g;
                assert_eq!(outcome, SleepOutcome::Woken);
            }
        });

        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = mutex.lock().unwrap();
            guard.ready = true;
        }
        ctx.wakeup();
        worker.join().unwrap();
    }

    #[test]
    fn interrupt_wakes_with_interrupted_outcome() {
        let mutex = Arc::new(Mutex::new(Pcb { sched: SchedState::default(), ready: false }));
        let ctx = Arc::new(SchedCtx::new());

        let (m2, c2) = (mutex.clone(), ctx.clone());
        let worker = thread::spawn(move || {
            let guard = m2.lock().unwrap();
            let (_guard, outcome) = c2.sleep(guard, None, |pcb| &mut pcb.sched);
            outcome
        });

        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = mutex.lock().unwrap();
            ctx.interrupt(&mut *guard, |pcb| &mut pcb.sched);
        }
        assert_eq!(worker.join().unwrap(), SleepOutcome::Interrupted);
    }

    #[test]
    fn destroy_fails_while_waiters_present() {
        let state = SchedState { interrupted: false, waiters: 1 };
        assert!(destroy(&state).is_err());
        let state = SchedState { interrupted: false, waiters: 0 };
        assert!(destroy(&state).is_ok());
    }
}
