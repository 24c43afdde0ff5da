//! Server-side transmission sequencer with total ordering.
//!
//! Assigns a monotonic sequence number to every accepted transmission,
//! enforcing one total order across all clients. Clients observe that order
//! through `header.number` and use it to skip queued transmissions already
//! contained in a fetched scenario image.
//!
//! Flow: validate header fields a client may not set, assign the next number,
//! stamp instigator and server time.

use plansync_proto::{Target, Transmission, UserId};
use thiserror::Error;

/// Errors that can occur during sequencing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// Transmission validation failed
    #[error("validation error: {0}")]
    Validation(String),

    /// Sequence space exhausted
    #[error("sequence overflow after {0}")]
    Overflow(u64),
}

/// Validate the header at the API boundary, before stamping.
///
/// Checks:
/// - Replay flag is unset (replays only happen inside undo)
/// - Internal flag is unset (only the server originates internal work)
/// - Explicit scenario targets are not the null scenario
/// - Sequence fields are still zero
fn validate_transmission(transmission: &Transmission) -> Result<(), SequencerError> {
    let header = &transmission.header;

    if header.replay {
        return Err(SequencerError::Validation(
            "replay flag set on submitted transmission".to_string(),
        ));
    }

    if header.internal {
        return Err(SequencerError::Validation(
            "internal flag set on submitted transmission".to_string(),
        ));
    }

    if header.target == Target::Scenario(plansync_proto::ScenarioId::NULL) {
        return Err(SequencerError::Validation("target is the null scenario".to_string()));
    }

    if header.number != 0 {
        return Err(SequencerError::Validation(format!(
            "transmission {} already carries number {}",
            header.id, header.number
        )));
    }

    Ok(())
}

/// Server-side transmission sequencer.
///
/// Holds the next number to assign. Numbers start at 1; 0 means unstamped.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next_number: u64,
}

impl Sequencer {
    /// Create a new sequencer (first number is 1)
    pub fn new() -> Self {
        Self { next_number: 1 }
    }

    /// Resume after `last` was the highest number already handed out.
    pub fn resume_after(last: u64) -> Self {
        Self { next_number: last.saturating_add(1).max(1) }
    }

    /// Next number that will be assigned.
    pub fn next_number(&self) -> u64 {
        self.next_number
    }

    /// Stamp a submitted transmission in place and return its number.
    ///
    /// # Invariants
    ///
    /// - Post: `header.number` is strictly greater than every number returned
    ///   before
    /// - Post: `header.original_number` is set on first issue and preserved
    ///   otherwise
    /// - Post: the instigator is the session's user, whatever the client sent
    pub fn stamp(
        &mut self,
        transmission: &mut Transmission,
        user: UserId,
        now_ms: u64,
    ) -> Result<u64, SequencerError> {
        validate_transmission(transmission)?;

        let number = self.next_number;
        self.next_number = number.checked_add(1).ok_or(SequencerError::Overflow(number))?;

        let header = &mut transmission.header;
        header.number = number;
        if header.original_number == 0 {
            header.original_number = number;
        }
        header.timestamp_ms = now_ms;
        header.instigator = user;

        debug_assert!(self.next_number > number);
        Ok(number)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use plansync_proto::{ScenarioId, TransmissionBody, TransmissionHeader, TransmissionId};
    use proptest::prelude::*;

    use super::*;

    fn submitted(id: u128) -> Transmission {
        let header = TransmissionHeader::new(TransmissionId(id), UserId(99), Target::Live);
        Transmission::new(header, TransmissionBody::KpiUpdate)
    }

    #[test]
    fn single_transmission_sequencing() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);

        let number = sequencer.stamp(&mut t, UserId(7), 1_000).expect("stamp failed");

        assert_eq!(number, 1);
        assert_eq!(t.header.number, 1);
        assert_eq!(t.header.original_number, 1);
        assert_eq!(t.header.timestamp_ms, 1_000);
        assert_eq!(t.header.instigator, UserId(7));
        assert_eq!(sequencer.next_number(), 2);
    }

    #[test]
    fn original_number_survives_reissue() {
        let mut sequencer = Sequencer::resume_after(40);
        let mut t = submitted(1);
        t.header.original_number = 12;

        sequencer.stamp(&mut t, UserId(7), 0).expect("stamp failed");

        assert_eq!(t.header.number, 41);
        assert_eq!(t.header.original_number, 12);
    }

    #[test]
    fn submitted_instigator_is_overwritten() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);
        t.header.instigator = UserId::SYSTEM;

        sequencer.stamp(&mut t, UserId(7), 0).expect("stamp failed");

        assert_eq!(t.header.instigator, UserId(7));
    }

    #[test]
    fn internal_flag_rejected() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);
        t.header.internal = true;

        let result = sequencer.stamp(&mut t, UserId(7), 0);

        assert!(matches!(result, Err(SequencerError::Validation(_))));
        assert_eq!(sequencer.next_number(), 1);
    }

    #[test]
    fn replay_flag_rejected() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);
        t.header.replay = true;

        let result = sequencer.stamp(&mut t, UserId(7), 0);

        assert!(matches!(result, Err(SequencerError::Validation(_))));
        assert_eq!(sequencer.next_number(), 1, "rejected transmissions consume no number");
    }

    #[test]
    fn null_scenario_target_rejected() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);
        t.header.target = Target::Scenario(ScenarioId::NULL);

        assert!(sequencer.stamp(&mut t, UserId(7), 0).is_err());
    }

    #[test]
    fn prestamped_transmission_rejected() {
        let mut sequencer = Sequencer::new();
        let mut t = submitted(1);
        sequencer.stamp(&mut t, UserId(7), 0).expect("stamp failed");

        assert!(sequencer.stamp(&mut t, UserId(7), 0).is_err());
    }

    #[test]
    fn overflow_is_an_error() {
        let mut sequencer = Sequencer { next_number: u64::MAX };
        let mut t = submitted(1);

        assert_eq!(sequencer.stamp(&mut t, UserId(7), 0), Err(SequencerError::Overflow(u64::MAX)));
    }

    #[test]
    fn prop_numbers_strictly_increase() {
        proptest!(|(count in 1usize..200, start in 0u64..1_000_000)| {
            let mut sequencer = Sequencer::resume_after(start);
            let mut last = start;

            for i in 0..count {
                let mut t = submitted(i as u128);
                let number = sequencer.stamp(&mut t, UserId(1), 0).expect("stamp failed");
                prop_assert!(number > last);
                prop_assert_eq!(number, last + 1);
                last = number;
            }
        });
    }
}
