//! Crystal-symmetry queries needed by lattice reconciliation.
//!
//! K_i: The 14 Bravais lattices carry a fixed total order by symmetry.
//! I^R: A full symmetry library can be plugged in via `SymmetryOracle`;
//! `BravaisTable` covers the chiral space groups seen in macromolecular work.

use crate::models::{ReductionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bravais lattice class, declared lowest → highest symmetry.
///
/// K_i: The derived `Ord` is the fixed total order used to break disagreements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Lattice {
    #[serde(rename = "aP")]
    TriclinicP,
    #[serde(rename = "mP")]
    MonoclinicP,
    #[serde(rename = "mC")]
    MonoclinicC,
    #[serde(rename = "oP")]
    OrthorhombicP,
    #[serde(rename = "oC")]
    OrthorhombicC,
    #[serde(rename = "oI")]
    OrthorhombicI,
    #[serde(rename = "oF")]
    OrthorhombicF,
    #[serde(rename = "tP")]
    TetragonalP,
    #[serde(rename = "tI")]
    TetragonalI,
    #[serde(rename = "hR")]
    RhombohedralR,
    #[serde(rename = "hP")]
    HexagonalP,
    #[serde(rename = "cP")]
    CubicP,
    #[serde(rename = "cI")]
    CubicI,
    #[serde(rename = "cF")]
    CubicF,
}

impl Lattice {
    pub const ALL: [Lattice; 14] = [
        Self::TriclinicP,
        Self::MonoclinicP,
        Self::MonoclinicC,
        Self::OrthorhombicP,
        Self::OrthorhombicC,
        Self::OrthorhombicI,
        Self::OrthorhombicF,
        Self::TetragonalP,
        Self::TetragonalI,
        Self::RhombohedralR,
        Self::HexagonalP,
        Self::CubicP,
        Self::CubicI,
        Self::CubicF,
    ];

    /// Two-letter symbol, e.g. `tP`.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::TriclinicP => "aP",
            Self::MonoclinicP => "mP",
            Self::MonoclinicC => "mC",
            Self::OrthorhombicP => "oP",
            Self::OrthorhombicC => "oC",
            Self::OrthorhombicI => "oI",
            Self::OrthorhombicF => "oF",
            Self::TetragonalP => "tP",
            Self::TetragonalI => "tI",
            Self::RhombohedralR => "hR",
            Self::HexagonalP => "hP",
            Self::CubicP => "cP",
            Self::CubicI => "cI",
            Self::CubicF => "cF",
        }
    }

    /// Position in the symmetry order, 0 = lowest.
    pub fn rank(self) -> usize {
        self as usize
    }

    /// This lattice and every lattice it can be lowered to, highest symmetry first.
    pub fn sublattices(self) -> Vec<Lattice> {
        use Lattice::*;
        let mut lattices = match self {
            TriclinicP => vec![TriclinicP],
            MonoclinicP => vec![MonoclinicP, TriclinicP],
            MonoclinicC => vec![MonoclinicC, TriclinicP],
            OrthorhombicP => vec![OrthorhombicP, MonoclinicP, TriclinicP],
            OrthorhombicC => vec![OrthorhombicC, MonoclinicC, MonoclinicP, TriclinicP],
            OrthorhombicI => vec![OrthorhombicI, MonoclinicC, TriclinicP],
            OrthorhombicF => vec![OrthorhombicF, MonoclinicC, TriclinicP],
            TetragonalP => vec![
                TetragonalP,
                OrthorhombicP,
                OrthorhombicC,
                MonoclinicP,
                MonoclinicC,
                TriclinicP,
            ],
            TetragonalI => vec![TetragonalI, OrthorhombicI, OrthorhombicF, MonoclinicC, TriclinicP],
            RhombohedralR => vec![RhombohedralR, MonoclinicC, TriclinicP],
            HexagonalP => vec![HexagonalP, OrthorhombicC, MonoclinicP, MonoclinicC, TriclinicP],
            CubicP => vec![
                CubicP,
                TetragonalP,
                RhombohedralR,
                OrthorhombicP,
                OrthorhombicC,
                MonoclinicP,
                MonoclinicC,
                TriclinicP,
            ],
            CubicI | CubicF => vec![
                self,
                TetragonalI,
                RhombohedralR,
                OrthorhombicI,
                OrthorhombicF,
                MonoclinicC,
                TriclinicP,
            ],
        };
        lattices.sort_by(|a, b| b.cmp(a));
        lattices
    }
}

impl fmt::Display for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Lattice {
    type Err = ReductionError;

    fn from_str(s: &str) -> Result<Self> {
        Lattice::ALL
            .into_iter()
            .find(|l| l.symbol() == s.trim())
            .ok_or_else(|| ReductionError::ParseError(format!("unknown lattice '{s}'")))
    }
}

/// Rotational symmetry class of the diffraction pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointgroup {
    /// Space-group symbol with centring and screw components removed, e.g. `4 2 2`
    pub symbol: String,
    /// Bravais lattice implied by the original space group
    pub lattice: Lattice,
}

/// Symmetry collaborator consulted by lattice reconciliation.
pub trait SymmetryOracle {
    /// Pointgroup of a space group given as a Hermann–Mauguin symbol.
    fn pointgroup(&self, spacegroup: &str) -> Result<Pointgroup>;

    /// Lattices compatible with a pointgroup, highest symmetry first.
    fn acceptable_lattices(&self, pointgroup: &Pointgroup) -> Vec<Lattice>;

    /// Total order over lattice classes, lower = less symmetric.
    fn symmetry_rank(&self, lattice: Lattice) -> usize {
        lattice.rank()
    }
}

/// Built-in table of Bravais lattice relationships.
#[derive(Debug, Clone, Copy, Default)]
pub struct BravaisTable;

impl SymmetryOracle for BravaisTable {
    fn pointgroup(&self, spacegroup: &str) -> Result<Pointgroup> {
        let mut chars = spacegroup.trim().chars();
        let centring = chars
            .next()
            .ok_or_else(|| ReductionError::ParseError("empty space group".to_string()))?
            .to_ascii_uppercase();

        // Hermann–Mauguin symbols are expected with whitespace between axes.
        let axes: Vec<u8> = chars
            .as_str()
            .split_whitespace()
            .map(|token| {
                token
                    .trim_start_matches('-')
                    .chars()
                    .next()
                    .and_then(|c| match c {
                        'm' => Some(2),
                        c => c.to_digit(10).map(|d| d as u8),
                    })
                    .ok_or_else(|| {
                        ReductionError::ParseError(format!(
                            "bad axis '{token}' in space group '{spacegroup}'"
                        ))
                    })
            })
            .collect::<Result<_>>()?;

        let lattice = lattice_for(centring, &axes).ok_or_else(|| {
            ReductionError::ParseError(format!("unsupported space group '{spacegroup}'"))
        })?;

        let symbol = axes
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(Pointgroup { symbol, lattice })
    }

    fn acceptable_lattices(&self, pointgroup: &Pointgroup) -> Vec<Lattice> {
        pointgroup.lattice.sublattices()
    }
}

fn lattice_for(centring: char, axes: &[u8]) -> Option<Lattice> {
    use Lattice::*;
    let system = match axes {
        [1] | [1, 1, 1] => 'a',
        [2] | [1, 2, 1] | [2, 1, 1] | [1, 1, 2] => 'm',
        [2, 2, 2] => 'o',
        [_, 3] | [_, 3, _] => 'c',
        [4, ..] => 't',
        [3, ..] => 'r',
        [6, ..] => 'h',
        _ => return None,
    };

    let lattice = match (system, centring) {
        ('a', 'P') => TriclinicP,
        ('m', 'P') => MonoclinicP,
        ('m', 'C' | 'A' | 'I') => MonoclinicC,
        ('o', 'P') => OrthorhombicP,
        ('o', 'C' | 'A' | 'B') => OrthorhombicC,
        ('o', 'I') => OrthorhombicI,
        ('o', 'F') => OrthorhombicF,
        ('t', 'P') => TetragonalP,
        ('t', 'I') => TetragonalI,
        ('r', 'R' | 'H') => RhombohedralR,
        ('r' | 'h', 'P') => HexagonalP,
        ('c', 'P') => CubicP,
        ('c', 'I') => CubicI,
        ('c', 'F') => CubicF,
        _ => return None,
    };
    Some(lattice)
}
