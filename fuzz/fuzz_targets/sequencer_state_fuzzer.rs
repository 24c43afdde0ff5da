//! Fuzz target for the Sequencer
//!
//! Ensure sequence numbers form one strictly increasing total order and that
//! headers a client may not set are refused.
//!
//! # Strategy
//!
//! - Header fields: replay flag, preset number, null scenario target
//! - Internal flag and instigator: clients may not claim either
//! - Resume: restart after an arbitrary last number
//!
//! # Invariants
//!
//! - Accepted numbers strictly increase and have no gaps
//! - Rejected transmissions consume no number
//! - `original_number` is set on first issue only

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use plansync_proto::{
    ScenarioId, Target, Transmission, TransmissionBody, TransmissionHeader, TransmissionId, UserId,
};
use plansync_server::Sequencer;

#[derive(Debug, Clone, Arbitrary)]
struct Run {
    resume_after: Option<u32>,
    submissions: Vec<Submission>,
}

#[derive(Debug, Clone, Arbitrary)]
struct Submission {
    user: u8,
    target: TargetChoice,
    replay: bool,
    preset_number: u8,
    original_number: u8,
    internal: bool,
}

#[derive(Debug, Clone, Arbitrary)]
enum TargetChoice {
    Live,
    Broadcast,
    Scenario(u8),
}

fuzz_target!(|run: Run| {
    let mut sequencer = match run.resume_after {
        Some(last) => Sequencer::resume_after(u64::from(last)),
        None => Sequencer::new(),
    };
    let mut expected = sequencer.next_number();
    assert!(expected >= 1);

    for (index, submission) in run.submissions.into_iter().enumerate() {
        let target = match submission.target {
            TargetChoice::Live => Target::Live,
            TargetChoice::Broadcast => Target::Broadcast,
            TargetChoice::Scenario(id) => Target::Scenario(ScenarioId(u64::from(id))),
        };
        let mut header = TransmissionHeader::new(TransmissionId(index as u128), UserId(999), target);
        header.replay = submission.replay;
        header.number = u64::from(submission.preset_number);
        header.original_number = u64::from(submission.original_number);
        header.internal = submission.internal;
        let mut transmission = Transmission::new(header, TransmissionBody::KpiUpdate);

        let invalid = submission.replay
            || submission.internal
            || submission.preset_number != 0
            || target == Target::Scenario(ScenarioId::NULL);
        let user = UserId(u64::from(submission.user));

        match sequencer.stamp(&mut transmission, user, 1_000) {
            Ok(number) => {
                assert!(!invalid, "accepted an invalid header: {:?}", transmission.header);
                assert_eq!(number, expected);
                assert_eq!(transmission.header.number, number);
                if submission.original_number == 0 {
                    assert_eq!(transmission.header.original_number, number);
                } else {
                    assert_eq!(transmission.header.original_number, u64::from(submission.original_number));
                }
                assert_eq!(transmission.header.instigator, user);
                expected += 1;
            },
            Err(_) => {
                assert!(invalid, "refused a valid header: {:?}", transmission.header);
                assert_eq!(sequencer.next_number(), expected, "rejection consumed a number");
            },
        }
    }
});
