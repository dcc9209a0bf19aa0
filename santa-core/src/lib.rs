use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type ParticipantId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Open,
    Drawn,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Open => "open",
            GroupStatus::Drawn => "drawn",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(GroupStatus::Open),
            "drawn" => Some(GroupStatus::Drawn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub giver: ParticipantId,
    pub receiver: ParticipantId,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("need at least two participants, found {found}")]
pub struct InsufficientParticipants {
    pub found: usize,
}

/// Draws giver/receiver pairs for a gift exchange.
///
/// Shuffles the participants and pairs each with the next one in shuffled
/// order, the last wrapping around to the first, so the result is always one
/// cycle across the whole group: nobody is paired with themselves and every
/// participant gives exactly once and receives exactly once. Ids are expected
/// to be unique.
pub fn draw_assignments(
    participants: &[ParticipantId],
    rng: &mut impl Rng,
) -> Result<Vec<Assignment>, InsufficientParticipants> {
    if participants.len() < 2 {
        return Err(InsufficientParticipants {
            found: participants.len(),
        });
    }

    let mut order = participants.to_vec();
    order.shuffle(rng);

    let assignments = order
        .iter()
        .enumerate()
        .map(|(i, &giver)| Assignment {
            giver,
            receiver: order[(i + 1) % order.len()],
        })
        .collect();

    Ok(assignments)
}

/// Checks that `assignments` form one unbroken cycle over every participant:
/// each id gives exactly once, receives exactly once, never to itself, and
/// following receiver after receiver visits the whole group.
pub fn is_single_cycle(participants: &[ParticipantId], assignments: &[Assignment]) -> bool {
    if participants.len() < 2 || assignments.len() != participants.len() {
        return false;
    }

    let expected: HashSet<ParticipantId> = participants.iter().copied().collect();
    if expected.len() != participants.len() {
        return false;
    }

    let mut next: HashMap<ParticipantId, ParticipantId> = HashMap::new();
    for assignment in assignments {
        if assignment.giver == assignment.receiver {
            return false;
        }
        if !expected.contains(&assignment.giver) || !expected.contains(&assignment.receiver) {
            return false;
        }
        if next.insert(assignment.giver, assignment.receiver).is_some() {
            return false;
        }
    }

    let receivers: HashSet<ParticipantId> = next.values().copied().collect();
    if receivers != expected {
        return false;
    }

    // A permutation walk always comes back to its start; only a single cycle
    // needs the full participant count to get there.
    let start = participants[0];
    let mut current = start;
    let mut visited = 0usize;
    for _ in 0..participants.len() {
        current = match next.get(&current) {
            Some(receiver) => *receiver,
            None => return false,
        };
        visited += 1;
        if current == start {
            break;
        }
    }

    current == start && visited == participants.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ids(n: i64) -> Vec<ParticipantId> {
        (1..=n).collect()
    }

    #[test]
    fn two_participants_swap() {
        let assignments = draw_assignments(&ids(2), &mut thread_rng()).unwrap();
        let pairs: HashSet<(ParticipantId, ParticipantId)> = assignments
            .iter()
            .map(|a| (a.giver, a.receiver))
            .collect();
        assert_eq!(pairs, HashSet::from([(1, 2), (2, 1)]));
    }

    #[test]
    fn every_size_yields_a_single_cycle() {
        let mut rng = thread_rng();
        for n in 2..=12 {
            let participants = ids(n);
            let assignments = draw_assignments(&participants, &mut rng).unwrap();
            assert_eq!(assignments.len(), participants.len());
            assert!(is_single_cycle(&participants, &assignments), "n = {n}");
        }
    }

    #[test]
    fn rejects_fewer_than_two() {
        assert_eq!(
            draw_assignments(&[], &mut thread_rng()),
            Err(InsufficientParticipants { found: 0 })
        );
        assert_eq!(
            draw_assignments(&ids(1), &mut thread_rng()),
            Err(InsufficientParticipants { found: 1 })
        );
    }

    #[test]
    fn seeded_draw_is_reproducible() {
        let participants = ids(6);
        let first =
            draw_assignments(&participants, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();
        let second =
            draw_assignments(&participants, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();

        assert_eq!(first, second);
        assert!(is_single_cycle(&participants, &first));
    }

    #[test]
    fn different_seeds_vary_the_pairing() {
        let participants = ids(5);
        let receivers_of_one: HashSet<ParticipantId> = (0..16)
            .map(|seed| {
                let assignments =
                    draw_assignments(&participants, &mut ChaCha8Rng::seed_from_u64(seed))
                        .unwrap();
                assignments
                    .iter()
                    .find(|a| a.giver == 1)
                    .map(|a| a.receiver)
                    .unwrap()
            })
            .collect();

        assert!(receivers_of_one.len() > 1);
    }

    #[test]
    fn checker_accepts_a_rotation() {
        let participants = ids(4);
        let rotation: Vec<Assignment> = (1..=4)
            .map(|giver| Assignment {
                giver,
                receiver: giver % 4 + 1,
            })
            .collect();

        assert!(is_single_cycle(&participants, &rotation));
    }

    #[test]
    fn checker_rejects_split_cycles() {
        let participants = ids(4);
        let split = vec![
            Assignment { giver: 1, receiver: 2 },
            Assignment { giver: 2, receiver: 1 },
            Assignment { giver: 3, receiver: 4 },
            Assignment { giver: 4, receiver: 3 },
        ];

        assert!(!is_single_cycle(&participants, &split));
    }

    #[test]
    fn checker_rejects_malformed_pairings() {
        let participants = ids(3);

        // Self-assignment.
        assert!(!is_single_cycle(
            &participants,
            &[
                Assignment { giver: 1, receiver: 1 },
                Assignment { giver: 2, receiver: 3 },
                Assignment { giver: 3, receiver: 2 },
            ],
        ));

        // Repeated receiver.
        assert!(!is_single_cycle(
            &participants,
            &[
                Assignment { giver: 1, receiver: 3 },
                Assignment { giver: 2, receiver: 3 },
                Assignment { giver: 3, receiver: 1 },
            ],
        ));

        // Missing giver.
        assert!(!is_single_cycle(
            &participants,
            &[
                Assignment { giver: 1, receiver: 2 },
                Assignment { giver: 2, receiver: 1 },
            ],
        ));

        // Receiver from outside the group.
        assert!(!is_single_cycle(
            &participants,
            &[
                Assignment { giver: 1, receiver: 2 },
                Assignment { giver: 2, receiver: 9 },
                Assignment { giver: 3, receiver: 1 },
            ],
        ));
    }

    #[test]
    fn status_text_round_trips() {
        assert_eq!(GroupStatus::Open.as_str(), "open");
        assert_eq!(GroupStatus::Drawn.as_str(), "drawn");
        assert_eq!(GroupStatus::parse("open"), Some(GroupStatus::Open));
        assert_eq!(GroupStatus::parse("drawn"), Some(GroupStatus::Drawn));
        assert_eq!(GroupStatus::parse("finished"), None);
    }
}
