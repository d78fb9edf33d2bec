//! Deterministic attribution of a protocol violation to one participant.
//!
//! Resolution is a pure function of data already committed to the chain plus
//! the key seeds revealed during the blame window: no voting, no external
//! judge, no clocks. Any two verifiers holding the same inputs name the same
//! participant.

use crate::onion::{open_layer, KeySeed};
use obscura_types::error::ProtocolViolation;
use obscura_types::shuffling::{Participant, Shuffling, RECIPIENT_LEN};

/// Replay the recorded submissions against the revealed seeds and name the
/// participant at fault. Returns `None` only when no one opened the blame
/// path (a pure timeout carries no blame).
///
/// `payloads[k]` holds the recorded blobs of the processing submission at
/// index `k`; the final slot holds the plaintext recipient list as 32-byte
/// entries. Slots are `None` where no submission was accepted.
pub fn resolve(
    shuffling: &Shuffling,
    participants: &[Participant],
    payloads: &[Option<Vec<Vec<u8>>>],
) -> Option<ProtocolViolation> {
    let id = shuffling.id;
    let cancelling = shuffling.cancelling?;
    let last = shuffling.last_index();

    // Processing submissions are accepted strictly in turn order, so the
    // recorded prefix is contiguous.
    let last_processing = (0..last)
        .take_while(|k| payloads[*k as usize].is_some())
        .last();

    // Every seed needed to strip a recorded layer must have been revealed:
    // withholding one is refusing the audit.
    let last_step = match last_processing {
        Some(k) => (k + 1).min(last),
        None => 0,
    };
    for index in 1..=last_step {
        if participants[index as usize].revealed_seed.is_none() {
            return Some(ProtocolViolation::MissingReveal { id, index });
        }
    }

    // A revealed seed must derive the shuffle key registered on-chain,
    // whoever revealed it.
    for participant in participants {
        if let Some(seed) = participant.revealed_seed {
            if KeySeed::from_bytes(seed).public() != participant.shuffle_key {
                return Some(ProtocolViolation::KeyRevealMismatch {
                    id,
                    index: participant.index,
                });
            }
        }
    }

    // Strip each recorded submission with the next participant's seed and
    // compare against what that participant actually published. The first
    // diverging layer identifies its submitter.
    let Some(last_processing) = last_processing else {
        return Some(ProtocolViolation::FalseAccusation {
            id,
            index: cancelling,
        });
    };
    for k in 0..=last_processing {
        let step = k + 1;
        if step > last {
            break;
        }
        let seed = KeySeed::from_bytes(
            participants[step as usize]
                .revealed_seed
                .expect("required seeds checked above"),
        );
        let recorded = payloads[k as usize]
            .as_ref()
            .expect("contiguous processing prefix");

        let mut stripped = Vec::with_capacity(recorded.len());
        for blob in recorded {
            match open_layer(&seed, id, step, blob) {
                Ok(plaintext) => stripped.push(plaintext),
                Err(_) => {
                    return Some(ProtocolViolation::UndecipherableLayer { id, index: k })
                }
            }
        }

        if k < last_processing {
            // The next submission must be the stripped set minus exactly the
            // one entry its submitter withdrew.
            let next = payloads[(k + 1) as usize]
                .as_ref()
                .expect("contiguous processing prefix");
            let mut remaining = stripped;
            let mut matched = true;
            for blob in next {
                match remaining.iter().position(|candidate| candidate == blob) {
                    Some(at) => {
                        remaining.swap_remove(at);
                    }
                    None => {
                        matched = false;
                        break;
                    }
                }
            }
            if !matched || remaining.len() != 1 {
                return Some(ProtocolViolation::LayerDivergence { id, index: k + 1 });
            }
        } else if step == last {
            // Fully unwrapped: the surviving entry must surface in the
            // recorded plaintext recipient list.
            let Some(recipients) = payloads[last as usize].as_ref() else {
                break;
            };
            for entry in &stripped {
                if entry.len() != RECIPIENT_LEN {
                    return Some(ProtocolViolation::UndecipherableLayer { id, index: k });
                }
                if !recipients.contains(entry) {
                    return Some(ProtocolViolation::LayerDivergence { id, index: last });
                }
            }
        }
    }

    // Replay matched everywhere: the accusation itself was the violation.
    Some(ProtocolViolation::FalseAccusation {
        id,
        index: cancelling,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{create_account_keypair, HonestShuffle};
    use commonware_cryptography::{Hasher as _, Sha256};
    use obscura_types::shuffling::{ParticipantStatus, Phase, ProcessingData, Shuffling};

    const ID: u64 = 42;

    struct Replay {
        shuffling: Shuffling,
        participants: Vec<Participant>,
        payloads: Vec<Option<Vec<Vec<u8>>>>,
    }

    /// Chain data as committed by a run that reached verification before
    /// `cancelling` opened the blame path, with every seed revealed.
    fn committed_run(run: &HonestShuffle, cancelling: u8) -> Replay {
        let count = run.members.len();
        let submissions = run.submissions();

        let mut participants = Vec::with_capacity(count);
        let mut payloads: Vec<Option<Vec<Vec<u8>>>> = Vec::with_capacity(count);
        for (index, member) in run.members.iter().enumerate() {
            let mut participant =
                Participant::new(member.public.clone(), member.seed.public(), index as u8);
            participant.status = ParticipantStatus::Processed;
            participant.revealed_seed = Some(member.seed.reveal());
            if index < count - 1 {
                participant.payload_digest =
                    Some(ProcessingData::Present(submissions[index].clone()).digest());
                payloads.push(Some(submissions[index].clone()));
            } else {
                payloads.push(Some(
                    run.recipients
                        .iter()
                        .map(|recipient| recipient.as_ref().to_vec())
                        .collect(),
                ));
            }
            participants.push(participant);
        }

        let shuffling = Shuffling {
            id: ID,
            holding_id: 0,
            amount: 1_000,
            participant_count: count as u8,
            registration_deadline: 100,
            phase_deadline: 900,
            phase: Phase::Blame,
            state_hash: Sha256::hash(b"chain"),
            participants: run.members.iter().map(|m| m.public.clone()).collect(),
            assignee: count as u8 - 1,
            recipients: run.recipients.clone(),
            recipients_digest: None,
            cancelling: Some(cancelling),
        };

        Replay {
            shuffling,
            participants,
            payloads,
        }
    }

    #[test]
    fn clean_replay_blames_the_canceller() {
        let run = HonestShuffle::new(ID, 4);
        let replay = committed_run(&run, 0);

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::FalseAccusation { id: ID, index: 0 })
        );
    }

    #[test]
    fn verdict_is_a_pure_function_of_its_inputs() {
        let run = HonestShuffle::new(ID, 4);
        let replay = committed_run(&run, 2);

        let first = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        let again = committed_run(&run, 2);
        let second = resolve(&again.shuffling, &again.participants, &again.payloads);
        assert_eq!(first, second);
    }

    #[test]
    fn substituted_submission_blames_its_submitter() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 2);

        // Member 1 published bytes that are not decryptions of member 0's
        // blobs.
        let len = replay.payloads[1].as_ref().unwrap()[0].len();
        replay.payloads[1] = Some(vec![vec![0xa5u8; len]]);

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::LayerDivergence { id: ID, index: 1 })
        );
    }

    #[test]
    fn undecipherable_blob_blames_its_publisher() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 2);

        // Flip ciphertext bits inside member 0's first blob: the layer no
        // longer authenticates under any seed.
        if let Some(blobs) = replay.payloads[0].as_mut() {
            let last = blobs[0].len() - 1;
            blobs[0][last] ^= 0xff;
        }

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::UndecipherableLayer { id: ID, index: 0 })
        );
    }

    #[test]
    fn fake_seed_reveal_blames_the_revealer() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 0);
        replay.participants[2].revealed_seed = Some([7u8; 32]);

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::KeyRevealMismatch { id: ID, index: 2 })
        );
    }

    #[test]
    fn withheld_seed_blames_the_silent_participant() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 0);
        replay.participants[1].revealed_seed = None;

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::MissingReveal { id: ID, index: 1 })
        );
    }

    #[test]
    fn recipient_list_missing_the_survivor_blames_the_distributor() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 0);

        // The distributor published a list that drops the recipient carried
        // by the last surviving onion.
        let fake: Vec<Vec<u8>> = (200..203)
            .map(|seed| create_account_keypair(seed).1.as_ref().to_vec())
            .collect();
        replay.payloads[2] = Some(fake);

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(
            verdict,
            Some(ProtocolViolation::LayerDivergence { id: ID, index: 2 })
        );
    }

    #[test]
    fn timeout_without_accusation_carries_no_blame() {
        let run = HonestShuffle::new(ID, 3);
        let mut replay = committed_run(&run, 0);
        replay.shuffling.cancelling = None;

        let verdict = resolve(&replay.shuffling, &replay.participants, &replay.payloads);
        assert_eq!(verdict, None);
    }
}
