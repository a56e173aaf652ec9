use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::vecmath::Vec2;

/// One particle as read from a dump frame.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub id: u64,
    pub atom_type: u32,
    pub pos: Vec2,
}

impl Atom {
    pub fn new(id: u64, atom_type: u32, x: f64, y: f64) -> Self {
        Atom { id, atom_type, pos: Vec2::new(x, y) }
    }
}

/// All particles of one timestep, held sorted by ascending particle ID.
///
/// The i-th atom of two snapshots built from the same system refers to the
/// same particle, so positional comparison between snapshots is valid once
/// `same_ids` holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// The simulation timestep the snapshot was recorded at.
    pub timestep: u64,
    atoms: Vec<Atom>,
}

impl Snapshot {
    /// Builds a snapshot, sorting atoms by ID. Duplicate IDs are rejected.
    pub fn from_atoms(timestep: u64, mut atoms: Vec<Atom>) -> Result<Self> {
        atoms.sort_unstable_by_key(|a| a.id);
        if let Some(pair) = atoms.windows(2).find(|w| w[0].id == w[1].id) {
            anyhow::bail!(
                "Duplicate particle id {} in snapshot at timestep {}.",
                pair[0].id,
                timestep
            );
        }
        Ok(Snapshot { timestep, atoms })
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.atoms.iter().map(|a| a.id)
    }

    /// True when both snapshots hold exactly the same ID sequence.
    pub fn same_ids(&self, other: &Snapshot) -> bool {
        self.len() == other.len() && self.ids().eq(other.ids())
    }

    /// Fails unless the snapshot holds exactly `expected` particles.
    pub fn ensure_count(&self, expected: usize) -> Result<()> {
        if self.len() != expected {
            anyhow::bail!(
                "Snapshot at timestep {} holds {} particles, expected {}.",
                self.timestep,
                self.len(),
                expected
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atoms_are_sorted_by_id() {
        let snap = Snapshot::from_atoms(
            10,
            vec![Atom::new(3, 1, 3.0, 0.0), Atom::new(1, 2, 1.0, 0.0), Atom::new(2, 1, 2.0, 0.0)],
        )
        .unwrap();
        assert_eq!(snap.ids().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(snap.atoms()[0].atom_type, 2);
        assert_eq!(snap.atoms()[2].pos, Vec2::new(3.0, 0.0));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = Snapshot::from_atoms(5, vec![Atom::new(7, 1, 0.0, 0.0), Atom::new(7, 1, 1.0, 1.0)])
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate particle id 7"));
    }

    #[test]
    fn id_sequences_and_counts_are_compared() {
        let a = Snapshot::from_atoms(0, vec![Atom::new(1, 1, 0.0, 0.0), Atom::new(2, 1, 0.0, 0.0)]).unwrap();
        let b = Snapshot::from_atoms(1, vec![Atom::new(2, 1, 5.0, 0.0), Atom::new(1, 1, 5.0, 0.0)]).unwrap();
        let c = Snapshot::from_atoms(2, vec![Atom::new(1, 1, 0.0, 0.0), Atom::new(3, 1, 0.0, 0.0)]).unwrap();
        assert!(a.same_ids(&b));
        assert!(!a.same_ids(&c));
        assert!(a.ensure_count(2).is_ok());
        assert!(a.ensure_count(3).is_err());
    }
}
