use crate::signal::{self, SignalSet};

use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex};

/// Emulated per-task signal state for thread mode.
///
/// Pending signals are a set, so a signal that is already pending is
/// coalesced with the new one.
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    arrived: Condvar,
}

#[derive(Default)]
struct MailboxState {
    mask: SignalSet,
    pending: SignalSet,
    /// Set while the owner is blocked in `sigwait`.
    waiting: Option<SignalSet>,
    /// A signal that reached the task unblocked and unwaited.
    fatal: Option<Signal>,
}

/// What happened to a posted signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    Discarded,
    Fatal,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            arrived: Condvar::new(),
        }
    }

    /// Clears the mailbox for a fresh task starting with `mask`.
    pub(crate) fn reset(&self, mask: SignalSet) {
        *self.state.lock() = MailboxState {
            mask: mask.difference(signal::unblockable()),
            ..MailboxState::default()
        };
    }

    pub(crate) fn mask(&self) -> SignalSet {
        self.state.lock().mask
    }

    pub(crate) fn fatal(&self) -> Option<Signal> {
        self.state.lock().fatal
    }

    /// Delivers `signal` to the owner.
    ///
    /// A blocked or awaited signal is queued. Otherwise the default action
    /// applies: discarded for default-ignored signals, fatal for the rest.
    pub(crate) fn post(&self, signal: Signal) -> Delivery {
        let mut state = self.state.lock();

        let awaited = state
            .waiting
            .is_some_and(|set| set.difference(signal::unblockable()).contains(signal));

        let delivery = if state.mask.contains(signal) || awaited {
            state.pending.add(signal);
            Delivery::Queued
        } else if signal::ignored_by_default(signal) {
            Delivery::Discarded
        } else {
            state.fatal.get_or_insert(signal);
            Delivery::Fatal
        };

        if delivery != Delivery::Discarded {
            self.arrived.notify_all();
        }

        delivery
    }

    /// Applies a mask change. `SIGKILL` and `SIGSTOP` are silently left out,
    /// as the OS does.
    ///
    /// Returns the previous mask, plus the fatal signal if unblocking released
    /// one that was pending.
    pub(crate) fn update_mask(
        &self,
        how: signal::MaskHow,
        set: SignalSet,
    ) -> (SignalSet, Option<Signal>) {
        let mut state = self.state.lock();

        let previous = state.mask;
        state.mask = previous
            .apply(how, set)
            .difference(signal::unblockable());

        let released = state.pending.difference(state.mask);
        state.pending = state.pending.intersection(state.mask);

        if state.fatal.is_none() {
            state.fatal = released
                .iter()
                .find(|signal| !signal::ignored_by_default(*signal));
        }

        (previous, state.fatal)
    }

    /// Blocks until a member of `set` is pending and consumes it.
    ///
    /// Returns `Err` with the fatal signal if the owner is killed while
    /// waiting. Signals outside `set` stay pending.
    pub(crate) fn wait(&self, set: SignalSet) -> Result<Signal, Signal> {
        let mut state = self.state.lock();

        let outcome = loop {
            if let Some(fatal) = state.fatal {
                break Err(fatal);
            }

            if let Some(signal) = state.pending.intersection(set).first() {
                state.pending.remove(signal);
                break Ok(signal);
            }

            state.waiting = Some(set);
            self.arrived.wait(&mut state);
        };

        state.waiting = None;
        outcome
    }

    /// Forgets a fatal signal that was already acted upon elsewhere.
    pub(crate) fn clear_fatal(&self) {
        self.state.lock().fatal = None;
    }
}
