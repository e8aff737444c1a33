//! The DCOP instance model.
//!
//! N agents (ids `1..=N`), a value domain of size M, and a symmetric sparse
//! set of M×M cost matrices over unordered agent pairs. The accessors expose
//! a *full-mesh* view: unconstrained pairs answer with a shared all-zeros
//! matrix, so the privacy-preserving algorithms can treat every pair
//! uniformly without revealing which constraints are real.

use crate::error::ProtocolError;
use crate::runtime::AgentId;
use itertools::Itertools;
use rand::Rng;
use std::collections::HashMap;

/// An immutable DCOP instance.
pub struct Problem {
    num_agents: usize,
    domain_size: usize,
    matrices: HashMap<(AgentId, AgentId), Vec<Vec<u64>>>,
    zero: Vec<Vec<u64>>,
}

impl Problem {
    /// Build an instance from explicit constraints `(i, j, matrix)` with
    /// `matrix[vi][vj]` the cost of agent `i` picking `vi` while `j` picks
    /// `vj`. Each unordered pair may appear at most once; the transposed
    /// orientation is derived.
    pub fn new(
        num_agents: usize,
        domain_size: usize,
        constraints: Vec<(AgentId, AgentId, Vec<Vec<u64>>)>,
    ) -> Result<Self, ProtocolError> {
        if num_agents < 2 {
            return Err(ProtocolError::Config(format!(
                "a problem needs at least 2 agents, got {num_agents}"
            )));
        }
        if domain_size == 0 {
            return Err(ProtocolError::Config("empty value domain".into()));
        }

        let mut matrices = HashMap::new();
        for (i, j, matrix) in constraints {
            if i == j || i < 1 || j < 1 || i > num_agents || j > num_agents {
                return Err(ProtocolError::Config(format!(
                    "constraint over invalid agent pair ({i}, {j})"
                )));
            }
            if matrix.len() != domain_size || matrix.iter().any(|row| row.len() != domain_size) {
                return Err(ProtocolError::Config(format!(
                    "constraint ({i}, {j}) is not a {domain_size}x{domain_size} matrix"
                )));
            }
            let transposed: Vec<Vec<u64>> = (0..domain_size)
                .map(|vj| (0..domain_size).map(|vi| matrix[vi][vj]).collect())
                .collect();
            if matrices.insert((i, j), matrix).is_some() {
                return Err(ProtocolError::Config(format!(
                    "duplicate constraint over pair ({i}, {j})"
                )));
            }
            if matrices.insert((j, i), transposed).is_some() {
                return Err(ProtocolError::Config(format!(
                    "duplicate constraint over pair ({j}, {i})"
                )));
            }
        }

        let zero = vec![vec![0; domain_size]; domain_size];
        Ok(Self {
            num_agents,
            domain_size,
            matrices,
            zero,
        })
    }

    /// Erdős–Rényi random instance: each unordered pair is constrained
    /// independently with probability `density`, costs uniform in
    /// `[0, max_cost]`.
    pub fn random<R: Rng + ?Sized>(
        num_agents: usize,
        domain_size: usize,
        density: f64,
        max_cost: u64,
        rng: &mut R,
    ) -> Result<Self, ProtocolError> {
        let mut constraints = Vec::new();
        for i in 1..=num_agents {
            for j in i + 1..=num_agents {
                if rng.gen::<f64>() < density {
                    constraints.push((i, j, random_matrix(domain_size, max_cost, rng)));
                }
            }
        }
        Self::new(num_agents, domain_size, constraints)
    }

    /// Barabási–Albert random instance: a scale-free constraint graph grown
    /// by preferential attachment, `attach` edges per new agent, costs
    /// uniform in `[0, max_cost]`.
    pub fn random_scale_free<R: Rng + ?Sized>(
        num_agents: usize,
        domain_size: usize,
        attach: usize,
        max_cost: u64,
        rng: &mut R,
    ) -> Result<Self, ProtocolError> {
        if attach == 0 || attach >= num_agents {
            return Err(ProtocolError::Config(format!(
                "scale-free attachment {attach} out of range for {num_agents} agents"
            )));
        }

        // seed clique over the first attach+1 agents, then preferential
        // attachment weighted by degree
        let mut edges: Vec<(AgentId, AgentId)> = Vec::new();
        let mut degree = vec![0usize; num_agents + 1];
        for i in 1..=attach + 1 {
            for j in i + 1..=attach + 1 {
                edges.push((i, j));
                degree[i] += 1;
                degree[j] += 1;
            }
        }
        for new in attach + 2..=num_agents {
            let mut chosen: Vec<AgentId> = Vec::new();
            while chosen.len() < attach {
                let total: usize = (1..new).map(|a| degree[a]).sum();
                let mut ticket = rng.gen_range(0..total);
                let mut pick = 1;
                for a in 1..new {
                    if ticket < degree[a] {
                        pick = a;
                        break;
                    }
                    ticket -= degree[a];
                }
                if !chosen.contains(&pick) {
                    chosen.push(pick);
                }
            }
            for a in chosen {
                edges.push((a, new));
                degree[a] += 1;
                degree[new] += 1;
            }
        }

        let constraints = edges
            .into_iter()
            .map(|(i, j)| (i, j, random_matrix(domain_size, max_cost, rng)))
            .collect();
        Self::new(num_agents, domain_size, constraints)
    }

    /// Number of agents.
    pub fn num_agents(&self) -> usize {
        self.num_agents
    }

    /// Domain size M.
    pub fn domain_size(&self) -> usize {
        self.domain_size
    }

    /// Agent ids `1..=N`.
    pub fn agents(&self) -> impl Iterator<Item = AgentId> {
        1..=self.num_agents
    }

    /// Whether the pair `(i, j)` carries a real constraint.
    pub fn is_connected(&self, i: AgentId, j: AgentId) -> bool {
        self.matrices.contains_key(&(i, j))
    }

    /// Cost matrix of `(i, j)` oriented as `[vi][vj]`; the all-zeros matrix
    /// when the pair is unconstrained (full-mesh view).
    pub fn cost_matrix(&self, i: AgentId, j: AgentId) -> &Vec<Vec<u64>> {
        self.matrices.get(&(i, j)).unwrap_or(&self.zero)
    }

    /// Constraint-graph neighbors of `agent`, sorted.
    pub fn neighbors(&self, agent: AgentId) -> Vec<AgentId> {
        self.agents()
            .filter(|&j| j != agent && self.is_connected(agent, j))
            .sorted()
            .collect()
    }

    /// Total cost of a full assignment (`assignment[i - 1]` is agent `i`'s
    /// value).
    pub fn total_cost(&self, assignment: &[usize]) -> u64 {
        let mut total = 0;
        for i in 1..=self.num_agents {
            for j in i + 1..=self.num_agents {
                if let Some(matrix) = self.matrices.get(&(i, j)) {
                    total += matrix[assignment[i - 1]][assignment[j - 1]];
                }
            }
        }
        total
    }
}

fn random_matrix<R: Rng + ?Sized>(domain_size: usize, max_cost: u64, rng: &mut R) -> Vec<Vec<u64>> {
    (0..domain_size)
        .map(|_| (0..domain_size).map(|_| rng.gen_range(0..=max_cost)).collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_agent_problem() -> Problem {
        Problem::new(
            2,
            3,
            vec![(1, 2, vec![vec![5, 1, 4], vec![2, 0, 7], vec![3, 6, 8]])],
        )
        .unwrap()
    }

    #[test]
    fn test_orientations_are_transposes() {
        let p = two_agent_problem();
        assert_eq!(p.cost_matrix(1, 2)[0][1], 1);
        assert_eq!(p.cost_matrix(2, 1)[1][0], 1);
        assert_eq!(p.cost_matrix(1, 2)[2][0], 3);
        assert_eq!(p.cost_matrix(2, 1)[0][2], 3);
    }

    #[test]
    fn test_full_mesh_view() {
        let p = Problem::new(
            3,
            2,
            vec![(1, 2, vec![vec![1, 2], vec![3, 4]])],
        )
        .unwrap();
        assert!(p.is_connected(1, 2));
        assert!(!p.is_connected(1, 3));
        assert_eq!(p.cost_matrix(1, 3), &vec![vec![0, 0], vec![0, 0]]);
        assert_eq!(p.neighbors(1), vec![2]);
        assert_eq!(p.neighbors(3), Vec::<AgentId>::new());
    }

    #[test]
    fn test_total_cost() {
        let p = two_agent_problem();
        assert_eq!(p.total_cost(&[0, 0]), 5);
        assert_eq!(p.total_cost(&[1, 1]), 0);
        assert_eq!(p.total_cost(&[2, 1]), 6);
    }

    #[test]
    fn test_validation() {
        assert!(Problem::new(1, 3, vec![]).is_err());
        assert!(Problem::new(3, 0, vec![]).is_err());
        assert!(Problem::new(2, 2, vec![(1, 1, vec![vec![0, 0], vec![0, 0]])]).is_err());
        assert!(Problem::new(2, 2, vec![(1, 2, vec![vec![0, 0]])]).is_err());
        let dup = vec![
            (1, 2, vec![vec![0, 0], vec![0, 0]]),
            (2, 1, vec![vec![0, 0], vec![0, 0]]),
        ];
        assert!(Problem::new(2, 2, dup).is_err());
    }

    #[test]
    fn test_random_generators() {
        let mut rng = StdRng::seed_from_u64(9);
        let p = Problem::random(8, 4, 0.5, 100, &mut rng).unwrap();
        assert_eq!(p.num_agents(), 8);
        for i in p.agents() {
            for j in p.agents() {
                if i != j {
                    assert_eq!(p.is_connected(i, j), p.is_connected(j, i));
                }
            }
        }

        let sf = Problem::random_scale_free(10, 3, 2, 50, &mut rng).unwrap();
        // every late agent attaches to exactly `attach` earlier ones
        for agent in 4..=10 {
            let earlier = sf
                .neighbors(agent)
                .into_iter()
                .filter(|&j| j < agent)
                .count();
            assert_eq!(earlier, 2);
        }
    }
}
