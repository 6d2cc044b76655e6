//! Two-phase inactivity countdown.
//!
//! The timer itself never sleeps. Arming hands out a [`TimerTicket`] plus the
//! delay after which the owner should feed the ticket back through
//! [`InactivityTimer::accept`]. Every arm and cancel bumps a generation
//! counter, so a ticket from an earlier arming is rejected even if its
//! scheduled callback could not be cancelled in time.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Counting down to the WARNING frame
    Warning,
    /// Counting down to SESSION_TIMEOUT
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTicket {
    pub phase: TimerPhase,
    generation: u64,
}

#[derive(Debug)]
pub struct InactivityTimer {
    warning: Duration,
    timeout: Duration,
    generation: u64,
    armed: Option<TimerPhase>,
}

impl InactivityTimer {
    pub fn new(warning: Duration, timeout: Duration) -> Self {
        Self {
            warning,
            timeout,
            generation: 0,
            armed: None,
        }
    }

    pub fn arm_warning(&mut self) -> (TimerTicket, Duration) {
        (self.arm(TimerPhase::Warning), self.warning)
    }

    pub fn arm_timeout(&mut self) -> (TimerTicket, Duration) {
        (self.arm(TimerPhase::Timeout), self.timeout)
    }

    fn arm(&mut self, phase: TimerPhase) -> TimerTicket {
        self.generation += 1;
        self.armed = Some(phase);
        TimerTicket {
            phase,
            generation: self.generation,
        }
    }

    /// Disarm both phases. Outstanding tickets become stale.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.armed = None;
    }

    /// Consume a fired ticket; returns false for stale tickets.
    pub fn accept(&mut self, ticket: TimerTicket) -> bool {
        if ticket.generation != self.generation || self.armed != Some(ticket.phase) {
            return false;
        }
        self.armed = None;
        true
    }

    pub fn armed(&self) -> Option<TimerPhase> {
        self.armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> InactivityTimer {
        InactivityTimer::new(Duration::from_secs(60), Duration::from_secs(30))
    }

    #[test]
    fn test_phases_in_order() {
        let mut timer = timer();
        let (warning, after) = timer.arm_warning();
        assert_eq!(after, Duration::from_secs(60));
        assert!(timer.accept(warning));
        assert_eq!(timer.armed(), None);

        let (timeout, after) = timer.arm_timeout();
        assert_eq!(after, Duration::from_secs(30));
        assert!(timer.accept(timeout));
        // A ticket fires at most once
        assert!(!timer.accept(timeout));
    }

    #[test]
    fn test_cancel_invalidates_tickets() {
        let mut timer = timer();
        let (ticket, _) = timer.arm_warning();
        timer.cancel();
        assert!(!timer.accept(ticket));
    }

    #[test]
    fn test_rearm_invalidates_previous_ticket() {
        let mut timer = timer();
        let (first, _) = timer.arm_warning();
        let (second, _) = timer.arm_warning();
        assert!(!timer.accept(first));
        assert!(timer.accept(second));
    }
}
