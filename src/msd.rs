use anyhow::Result;
use log::debug;
use rayon::prelude::*;
use trajectory_common::Snapshot;

/// Per-particle mean squared displacement, indexed like the sorted snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct MsdResult {
    pub ids: Vec<u64>,
    pub msd: Vec<f64>,
    pub intervals: u32,
}

/// Accumulates squared displacements over snapshot pairs.
///
/// Index `i` always refers to the i-th particle ID of the first interval;
/// every later pair must carry the same ID sequence.
#[derive(Debug)]
pub struct DisplacementAccumulator {
    num_particles: usize,
    ids: Option<Vec<u64>>,
    accum: Vec<f64>,
    intervals: u32,
}

impl DisplacementAccumulator {
    pub fn new(num_particles: usize) -> Self {
        DisplacementAccumulator {
            num_particles,
            ids: None,
            accum: vec![0.0; num_particles],
            intervals: 0,
        }
    }

    /// Adds `|to - from|^2` of every particle to its running total.
    pub fn add_interval(&mut self, from: &Snapshot, to: &Snapshot) -> Result<()> {
        from.ensure_count(self.num_particles)?;
        to.ensure_count(self.num_particles)?;
        if !from.same_ids(to) {
            anyhow::bail!(
                "Particle ids differ between timesteps {} and {}.",
                from.timestep,
                to.timestep
            );
        }
        match &self.ids {
            Some(ids) if !ids.iter().copied().eq(from.ids()) => anyhow::bail!(
                "Particle ids at timestep {} differ from the first interval.",
                from.timestep
            ),
            Some(_) => {}
            None => self.ids = Some(from.ids().collect()),
        }

        self.accum
            .par_iter_mut()
            .zip(from.atoms().par_iter())
            .zip(to.atoms().par_iter())
            .for_each(|((total, a), b)| {
                *total += b.pos.distance_squared(a.pos);
            });

        self.intervals += 1;
        debug!("Accumulated interval {} -> {} ({} so far).", from.timestep, to.timestep, self.intervals);
        Ok(())
    }

    /// Divides every total by the interval count.
    pub fn finish(self) -> Result<MsdResult> {
        let ids = match self.ids {
            Some(ids) if self.intervals > 0 => ids,
            _ => anyhow::bail!("No intervals were accumulated; cannot compute a mean."),
        };
        let n = self.intervals as f64;
        let msd = self.accum.into_iter().map(|total| total / n).collect();
        Ok(MsdResult { ids, msd, intervals: self.intervals })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use trajectory_common::Atom;

    fn snap(timestep: u64, positions: &[(f64, f64)]) -> Snapshot {
        let atoms = positions
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| Atom::new(i as u64 + 1, 1, x, y))
            .collect();
        Snapshot::from_atoms(timestep, atoms).unwrap()
    }

    #[test]
    fn static_particles_have_zero_msd() {
        let positions = [(1.0, 2.0), (3.5, -4.0), (0.0, 0.0)];
        let mut acc = DisplacementAccumulator::new(3);
        for k in 0..4 {
            acc.add_interval(&snap(k, &positions), &snap(k + 1, &positions)).unwrap();
        }
        let result = acc.finish().unwrap();
        assert_eq!(result.msd, vec![0.0; 3]);
        assert_eq!(result.intervals, 4);
        assert_eq!(result.ids, vec![1, 2, 3]);
    }

    #[test]
    fn single_pair_is_the_squared_displacement() {
        let a = snap(0, &[(0.0, 0.0), (1.0, 1.0)]);
        let b = snap(10, &[(3.0, 4.0), (1.5, 1.0)]);
        let mut acc = DisplacementAccumulator::new(2);
        acc.add_interval(&a, &b).unwrap();
        assert_eq!(acc.finish().unwrap().msd, vec![25.0, 0.25]);
    }

    #[test]
    fn mean_divides_by_interval_count() {
        let mut acc = DisplacementAccumulator::new(1);
        acc.add_interval(&snap(0, &[(0.0, 0.0)]), &snap(1, &[(1.0, 0.0)])).unwrap();
        acc.add_interval(&snap(1, &[(1.0, 0.0)]), &snap(2, &[(1.0, 3.0)])).unwrap();
        let result = acc.finish().unwrap();
        assert_eq!(result.intervals, 2);
        assert_eq!(result.msd, vec![5.0]);
    }

    #[test]
    fn pair_order_does_not_change_the_result() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 50;
        let frames: Vec<Snapshot> = (0..6)
            .map(|t| {
                let positions: Vec<(f64, f64)> = (0..n)
                    .map(|_| (rng.random_range(-20..20) as f64, rng.random_range(-20..20) as f64))
                    .collect();
                snap(t, &positions)
            })
            .collect();
        let mut pairs: Vec<(usize, usize)> = (0..5).map(|k| (k, k + 1)).collect();

        let run = |pairs: &[(usize, usize)]| {
            let mut acc = DisplacementAccumulator::new(n);
            for &(a, b) in pairs {
                acc.add_interval(&frames[a], &frames[b]).unwrap();
            }
            acc.finish().unwrap()
        };
        let forward = run(&pairs);
        pairs.shuffle(&mut rng);
        assert_eq!(run(&pairs), forward);
    }

    #[test]
    fn particle_count_mismatch_is_an_error() {
        let mut acc = DisplacementAccumulator::new(3);
        let err = acc
            .add_interval(&snap(0, &[(0.0, 0.0), (1.0, 1.0)]), &snap(1, &[(0.0, 0.0), (1.0, 1.0)]))
            .unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn id_mismatch_is_an_error() {
        let a = snap(0, &[(0.0, 0.0), (1.0, 1.0)]);
        let b = Snapshot::from_atoms(1, vec![Atom::new(1, 1, 0.0, 0.0), Atom::new(5, 1, 0.0, 0.0)]).unwrap();
        let mut acc = DisplacementAccumulator::new(2);
        assert!(acc.add_interval(&a, &b).is_err());
        assert!(acc.add_interval(&b, &b).is_ok());
        assert!(acc.add_interval(&a, &a).is_err());
    }

    #[test]
    fn finishing_without_intervals_fails() {
        assert!(DisplacementAccumulator::new(4).finish().is_err());
    }
}
