//! Cross-sweep lattice reconciliation.
//!
//! Epistemic foundation:
//! - K_i: Every sweep of one crystal must share a single lattice
//! - B_i: Each sweep's own proposal may over-estimate symmetry
//! - I^B: Only the sweep's backend can judge whether a lattice fits its data,
//!   and it answers with a tri-state verdict

use super::symmetry::{Lattice, SymmetryOracle};
use crate::models::{ReductionError, Result, SweepKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Backend answer to "is lattice L consistent with your data?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LatticeVerdict {
    /// Already consistent, nothing to redo
    Correct,
    /// Acceptable, but upstream processing must be repeated in that lattice
    Possible,
    /// Fundamentally inconsistent with the data
    Impossible,
}

/// A sweep's own view of its lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatticeProposal {
    pub sweep: SweepKey,
    /// Best lattice found by the sweep's indexer
    pub lattice: Lattice,
    /// Lattices the sweep could accept, highest symmetry first
    pub candidates: Vec<Lattice>,
}

impl LatticeProposal {
    /// Build a proposal whose candidates come from the symmetry collaborator.
    pub fn from_spacegroup(
        sweep: SweepKey,
        spacegroup: &str,
        symmetry: &dyn SymmetryOracle,
    ) -> Result<Self> {
        let pointgroup = symmetry.pointgroup(spacegroup)?;
        let candidates = symmetry.acceptable_lattices(&pointgroup);
        Ok(Self {
            sweep,
            lattice: pointgroup.lattice,
            candidates,
        })
    }

    /// First lattice this sweep would accept on its own.
    pub fn first_acceptable(&self) -> Lattice {
        self.candidates.first().copied().unwrap_or(self.lattice)
    }

    /// Whether the sweep could in principle be lowered to `lattice`.
    pub fn admits(&self, lattice: Lattice) -> bool {
        self.candidates.is_empty() || self.candidates.contains(&lattice)
    }
}

/// Per-sweep participant in a reconciliation round.
pub trait LatticeParticipant {
    /// Current proposal, driving upstream processing if needed.
    fn propose(&mut self) -> Result<LatticeProposal>;

    /// Ask the sweep's backend to validate an asserted lattice.
    fn assert_lattice(&mut self, lattice: Lattice) -> Result<LatticeVerdict>;
}

/// Outcome of one reconciliation round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Lattice asserted for every sweep
    pub lattice: Lattice,
    /// Distinct first-acceptable lattices seen this round
    pub proposed: Vec<Lattice>,
    /// Verdict per sweep (CORRECT when no assertion was needed)
    pub verdicts: Vec<(SweepKey, LatticeVerdict)>,
}

impl Reconciliation {
    /// True when some sweep must redo upstream work before the lattice can be trusted.
    pub fn needs_retry(&self) -> bool {
        self.proposed.len() > 1
            || self
                .verdicts
                .iter()
                .any(|(_, v)| *v == LatticeVerdict::Possible)
    }

    /// Sweeps that answered POSSIBLE and must be reset.
    pub fn sweeps_to_reset(&self) -> Vec<SweepKey> {
        self.verdicts
            .iter()
            .filter(|(_, v)| *v == LatticeVerdict::Possible)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Run one reconciliation round over all sweeps.
///
/// Returns `IncompatibleLattice` naming the first sweep that answers IMPOSSIBLE.
pub fn reconcile_round<P: LatticeParticipant>(
    participants: &mut [P],
    symmetry: &dyn SymmetryOracle,
) -> Result<Reconciliation> {
    if participants.is_empty() {
        return Err(ReductionError::InsufficientData(
            "lattice reconciliation needs at least one sweep".to_string(),
        ));
    }

    let proposals = participants
        .iter_mut()
        .map(|p| p.propose())
        .collect::<Result<Vec<_>>>()?;

    let distinct: BTreeSet<Lattice> = proposals.iter().map(|p| p.first_acceptable()).collect();

    let asserted = distinct
        .iter()
        .copied()
        .min_by_key(|l| symmetry.symmetry_rank(*l))
        .ok_or_else(|| ReductionError::Internal("no lattice proposals".to_string()))?;

    let mut ordered: Vec<Lattice> = distinct.into_iter().collect();
    ordered.sort_by_key(|l| std::cmp::Reverse(symmetry.symmetry_rank(*l)));

    if ordered.len() == 1 {
        debug!(lattice = %asserted, sweeps = proposals.len(), "All sweeps agree on lattice");
        return Ok(Reconciliation {
            lattice: asserted,
            proposed: ordered,
            verdicts: proposals
                .into_iter()
                .map(|p| (p.sweep, LatticeVerdict::Correct))
                .collect(),
        });
    }

    info!(
        lattice = %asserted,
        proposed = ?ordered.iter().map(|l| l.symbol()).collect::<Vec<_>>(),
        "Sweeps disagree on lattice, asserting lowest symmetry"
    );

    let mut verdicts = Vec::with_capacity(proposals.len());
    for (participant, proposal) in participants.iter_mut().zip(proposals) {
        let verdict = if proposal.admits(asserted) {
            participant.assert_lattice(asserted)?
        } else {
            LatticeVerdict::Impossible
        };

        match verdict {
            LatticeVerdict::Impossible => {
                warn!(sweep = %proposal.sweep, lattice = %asserted, "Sweep rejects asserted lattice");
                return Err(ReductionError::IncompatibleLattice {
                    sweep: proposal.sweep,
                    lattice: asserted.symbol().to_string(),
                });
            }
            LatticeVerdict::Possible => {
                debug!(sweep = %proposal.sweep, lattice = %asserted, "Sweep must reprocess in asserted lattice");
            }
            LatticeVerdict::Correct => {}
        }
        verdicts.push((proposal.sweep, verdict));
    }

    Ok(Reconciliation {
        lattice: asserted,
        proposed: ordered,
        verdicts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::symmetry::BravaisTable;

    struct MockSweep {
        key: SweepKey,
        lattice: Lattice,
        verdict: LatticeVerdict,
        asserted: Vec<Lattice>,
    }

    impl MockSweep {
        fn new(name: &str, lattice: Lattice, verdict: LatticeVerdict) -> Self {
            Self {
                key: SweepKey::new("p", "x", "d", name),
                lattice,
                verdict,
                asserted: Vec::new(),
            }
        }
    }

    impl LatticeParticipant for MockSweep {
        fn propose(&mut self) -> Result<LatticeProposal> {
            Ok(LatticeProposal {
                sweep: self.key.clone(),
                lattice: self.lattice,
                candidates: self.lattice.sublattices(),
            })
        }

        fn assert_lattice(&mut self, lattice: Lattice) -> Result<LatticeVerdict> {
            self.asserted.push(lattice);
            if self.verdict != LatticeVerdict::Impossible {
                self.lattice = lattice;
            }
            Ok(self.verdict)
        }
    }

    #[test]
    fn test_disagreement_asserts_lowest_and_flags_all_possible() {
        let mut sweeps = vec![
            MockSweep::new("S1", Lattice::TetragonalP, LatticeVerdict::Possible),
            MockSweep::new("S2", Lattice::MonoclinicC, LatticeVerdict::Possible),
            MockSweep::new("S3", Lattice::TetragonalP, LatticeVerdict::Possible),
        ];

        let outcome = reconcile_round(&mut sweeps, &BravaisTable).unwrap();
        assert_eq!(outcome.lattice, Lattice::MonoclinicC);
        assert!(outcome.needs_retry());
        assert_eq!(outcome.sweeps_to_reset().len(), 3);
        assert!(sweeps.iter().all(|s| s.asserted == vec![Lattice::MonoclinicC]));
    }

    #[test]
    fn test_agreement_is_idempotent() {
        let mut sweeps = vec![
            MockSweep::new("S1", Lattice::TetragonalP, LatticeVerdict::Correct),
            MockSweep::new("S2", Lattice::TetragonalP, LatticeVerdict::Correct),
        ];

        let first = reconcile_round(&mut sweeps, &BravaisTable).unwrap();
        let second = reconcile_round(&mut sweeps, &BravaisTable).unwrap();
        assert_eq!(first.lattice, Lattice::TetragonalP);
        assert_eq!(first, second);
        assert!(!second.needs_retry());
        assert!(sweeps.iter().all(|s| s.asserted.is_empty()));
    }

    #[test]
    fn test_second_round_settles_after_possible() {
        let mut sweeps = vec![
            MockSweep::new("S1", Lattice::TetragonalP, LatticeVerdict::Possible),
            MockSweep::new("S2", Lattice::OrthorhombicP, LatticeVerdict::Correct),
        ];

        let first = reconcile_round(&mut sweeps, &BravaisTable).unwrap();
        assert_eq!(first.lattice, Lattice::OrthorhombicP);
        assert_eq!(first.sweeps_to_reset(), vec![sweeps[0].key.clone()]);

        let second = reconcile_round(&mut sweeps, &BravaisTable).unwrap();
        assert_eq!(second.lattice, Lattice::OrthorhombicP);
        assert!(!second.needs_retry());
    }

    #[test]
    fn test_impossible_names_offending_sweep() {
        let mut sweeps = vec![
            MockSweep::new("S1", Lattice::TetragonalP, LatticeVerdict::Impossible),
            MockSweep::new("S2", Lattice::OrthorhombicP, LatticeVerdict::Correct),
        ];

        let err = reconcile_round(&mut sweeps, &BravaisTable).unwrap_err();
        match err {
            ReductionError::IncompatibleLattice { sweep, lattice } => {
                assert_eq!(sweep.sweep, "S1");
                assert_eq!(lattice, "oP");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unreachable_lattice_is_impossible_without_asking() {
        // hP cannot be lowered to oP.
        let mut sweeps = vec![
            MockSweep::new("S1", Lattice::HexagonalP, LatticeVerdict::Possible),
            MockSweep::new("S2", Lattice::OrthorhombicP, LatticeVerdict::Correct),
        ];

        let err = reconcile_round(&mut sweeps, &BravaisTable).unwrap_err();
        assert!(matches!(err, ReductionError::IncompatibleLattice { .. }));
        assert!(sweeps[0].asserted.is_empty());
    }
}
