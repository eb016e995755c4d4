//! Clock abstraction and per-conversation protocol timers.

use core::fmt::Debug;
use core::time::Duration;
use std::collections::HashMap;

use crate::address::ConversationKey;
use crate::errors::TimeoutKind;

/// Abstraction over a monotonic clock.
///
/// ISO-TP needs a monotonically increasing time source to implement deadlines (N_As, N_Bs, …) and
/// pacing (STmin).
pub trait Clock {
    /// Instant type produced by the clock.
    type Instant: Copy + Ord + Debug;

    /// Current instant.
    fn now(&self) -> Self::Instant;
    /// Add a duration to an instant (saturating if needed).
    fn add(&self, instant: Self::Instant, dur: Duration) -> Self::Instant;
}

/// Standard library clock wrapper.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    /// Add with `checked_add`, saturating on overflow.
    fn add(&self, instant: Self::Instant, dur: Duration) -> Self::Instant {
        instant.checked_add(dur).unwrap_or(instant)
    }
}

/// Tokio clock; follows paused/advanced time in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn add(&self, instant: Self::Instant, dur: Duration) -> Self::Instant {
        instant.checked_add(dur).unwrap_or(instant)
    }
}

/// A timer that fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    /// Conversation the timer belonged to.
    pub key: ConversationKey,
    /// Which protocol timer fired.
    pub kind: TimeoutKind,
}

#[derive(Debug, Clone, Copy)]
struct Armed<I> {
    kind: TimeoutKind,
    deadline: I,
}

/// One cancellable deadline per conversation.
///
/// Arming a conversation again replaces its previous deadline; a conversation is only ever waiting
/// for one thing at a time.
#[derive(Debug, Clone)]
pub struct TimerService<I> {
    timers: HashMap<ConversationKey, Armed<I>>,
}

impl<I> Default for TimerService<I> {
    fn default() -> Self {
        Self {
            timers: HashMap::new(),
        }
    }
}

impl<I: Copy + Ord> TimerService<I> {
    /// Empty timer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `key`.
    pub fn arm(&mut self, key: ConversationKey, kind: TimeoutKind, deadline: I) {
        self.timers.insert(key, Armed { kind, deadline });
    }

    /// Cancel the timer of `key`, returning its kind if one was armed.
    pub fn cancel(&mut self, key: &ConversationKey) -> Option<TimeoutKind> {
        self.timers.remove(key).map(|armed| armed.kind)
    }

    /// Kind and deadline armed for `key`.
    pub fn armed(&self, key: &ConversationKey) -> Option<(TimeoutKind, I)> {
        self.timers
            .get(key)
            .map(|armed| (armed.kind, armed.deadline))
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<I> {
        self.timers.values().map(|armed| armed.deadline).min()
    }

    /// Remove and return every timer whose deadline is at or before `now`, earliest first.
    pub fn poll_expired(&mut self, now: I) -> Vec<Expiry> {
        let mut expired: Vec<(I, Expiry)> = self
            .timers
            .iter()
            .filter(|(_, armed)| armed.deadline <= now)
            .map(|(key, armed)| {
                (
                    armed.deadline,
                    Expiry {
                        key: *key,
                        kind: armed.kind,
                    },
                )
            })
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, expiry) in &expired {
            self.timers.remove(&expiry.key);
        }
        expired.into_iter().map(|(_, expiry)| expiry).collect()
    }

    /// Drop every timer.
    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// `true` when nothing is armed.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressingFormat;

    fn key(target: u8) -> ConversationKey {
        ConversationKey::physical(AddressingFormat::FixedNormal, 0xF1, target)
    }

    #[test]
    fn rearming_replaces_previous_deadline() {
        let mut timers = TimerService::new();
        timers.arm(key(1), TimeoutKind::NAs, 10u64);
        timers.arm(key(1), TimeoutKind::NBs, 50u64);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.armed(&key(1)), Some((TimeoutKind::NBs, 50)));
        assert!(timers.poll_expired(20).is_empty());
    }

    #[test]
    fn expired_timers_are_returned_in_deadline_order() {
        let mut timers = TimerService::new();
        timers.arm(key(1), TimeoutKind::NCr, 30u64);
        timers.arm(key(2), TimeoutKind::NBs, 10u64);
        timers.arm(key(3), TimeoutKind::NAs, 99u64);
        assert_eq!(timers.next_deadline(), Some(10));

        let expired = timers.poll_expired(30);
        assert_eq!(
            expired,
            vec![
                Expiry {
                    key: key(2),
                    kind: TimeoutKind::NBs
                },
                Expiry {
                    key: key(1),
                    kind: TimeoutKind::NCr
                },
            ]
        );
        assert_eq!(timers.next_deadline(), Some(99));
        assert_eq!(timers.cancel(&key(3)), Some(TimeoutKind::NAs));
        assert!(timers.is_empty());
    }
}
