//! Spatial indexing abstractions for agent neighborhood queries.
//!
//! The index is rebuilt from scratch every simulation step: positions are
//! binned into uniform cells, emitted as `(cell_id, agent_index)` pairs,
//! sorted into a deterministic total order, and scanned once into a per-cell
//! range table. Neighborhood queries then walk the 3×3×3 block of cells
//! around an agent and visit every candidate within the requested radius.

use glam::Vec3;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The population is larger than the pair table can address.
    #[error("agent count {0} exceeds index capacity")]
    TooManyAgents(usize),
}

/// Bits per packed axis in a scalar cell id.
const AXIS_BITS: u32 = 21;
/// Half the representable per-axis cell range; coordinates live in `[-AXIS_OFFSET, AXIS_OFFSET - 1]`.
const AXIS_OFFSET: i64 = 1 << (AXIS_BITS - 1);
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;

/// Rebuilds below this population use a serial sort; larger ones go parallel.
const PARALLEL_SORT_THRESHOLD: usize = 4096;

/// Integer coordinates of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    /// Construct a coordinate triple directly.
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Cell containing `position` for the given cell size (floor division per axis).
    #[must_use]
    pub fn from_position(position: Vec3, cell_size: f32) -> Self {
        Self {
            x: (position.x / cell_size).floor() as i32,
            y: (position.y / cell_size).floor() as i32,
            z: (position.z / cell_size).floor() as i32,
        }
    }

    /// Neighboring cell offset by one step per axis.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            z: self.z + dz,
        }
    }

    /// Pack the coordinate triple into a scalar cell id, 21 bits per axis.
    ///
    /// The packing is a bijection for coordinates in `[-2^20, 2^20 - 1]` per
    /// axis, so distinct cells inside that range can never share an id.
    /// Coordinates beyond the range are clamped onto the boundary cell:
    /// far-out positions alias into the outermost shell instead of colliding
    /// with interior cells.
    #[must_use]
    pub fn pack(self) -> u64 {
        fn lane(coord: i32) -> u64 {
            let clamped = (coord as i64).clamp(-AXIS_OFFSET, AXIS_OFFSET - 1);
            ((clamped + AXIS_OFFSET) as u64) & AXIS_MASK
        }
        (lane(self.x) << (2 * AXIS_BITS)) | (lane(self.y) << AXIS_BITS) | lane(self.z)
    }
}

/// One agent's cell membership for the current rebuild.
///
/// The derived ordering (cell id first, agent index second) is exactly the
/// sort order of the pair table; ties on cell id cannot occur between
/// distinct pairs because agent indices are unique within a rebuild.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CellAgentPair {
    pub cell_id: u64,
    pub agent_index: u32,
}

/// Contiguous span of the sorted pair table covering one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CellRange {
    start: u32,
    len: u32,
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from agent positions.
    fn rebuild(&mut self, positions: &[Vec3]) -> Result<(), IndexError>;

    /// Visit neighbors of `agent_idx` within the provided squared radius.
    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid index over 3D agent positions.
///
/// A query radius larger than `cell_size` can reach past the 3×3×3
/// neighborhood walked by [`NeighborhoodIndex::neighbors_within`]; size
/// cells at or above the largest perception radius in play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing agents.
    pub cell_size: f32,
    #[serde(skip)]
    pairs: Vec<CellAgentPair>,
    #[serde(skip)]
    ranges: HashMap<u64, CellRange>,
    #[serde(skip)]
    positions: Vec<Vec3>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            pairs: Vec::new(),
            ranges: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Scalar id of the cell containing `position`.
    #[must_use]
    pub fn cell_id_at(&self, position: Vec3) -> u64 {
        CellCoord::from_position(position, self.cell_size).pack()
    }

    /// Sorted `(cell_id, agent_index)` table from the last rebuild.
    #[must_use]
    pub fn pairs(&self) -> &[CellAgentPair] {
        &self.pairs
    }

    /// Number of agents covered by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when the last rebuild covered no agents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Pairs belonging to `cell_id`; empty for cells with no agents.
    #[must_use]
    pub fn cell_agents(&self, cell_id: u64) -> &[CellAgentPair] {
        match self.ranges.get(&cell_id) {
            Some(range) => {
                let start = range.start as usize;
                &self.pairs[start..start + range.len as usize]
            }
            None => &[],
        }
    }

    /// Visit every agent within `radius_sq` of an arbitrary point, walking
    /// the 3×3×3 cell block around it.
    pub fn neighbors_of_point(
        &self,
        origin: Vec3,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let home = CellCoord::from_position(origin, self.cell_size);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    let cell_id = home.offset(dx, dy, dz).pack();
                    for pair in self.cell_agents(cell_id) {
                        let other = pair.agent_index as usize;
                        let dist_sq = self.positions[other].distance_squared(origin);
                        if dist_sq <= radius_sq {
                            visitor(other, OrderedFloat(dist_sq));
                        }
                    }
                }
            }
        }
    }

    fn rebuild_ranges(&mut self) {
        self.ranges.clear();
        let mut run_start = 0usize;
        for offset in 1..=self.pairs.len() {
            let run_closed =
                offset == self.pairs.len() || self.pairs[offset].cell_id != self.pairs[run_start].cell_id;
            if run_closed {
                self.ranges.insert(
                    self.pairs[run_start].cell_id,
                    CellRange {
                        start: run_start as u32,
                        len: (offset - run_start) as u32,
                    },
                );
                run_start = offset;
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[Vec3]) -> Result<(), IndexError> {
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if positions.len() > u32::MAX as usize {
            return Err(IndexError::TooManyAgents(positions.len()));
        }

        self.positions.clear();
        self.positions.extend_from_slice(positions);

        let cell_size = self.cell_size;
        self.pairs.clear();
        self.pairs
            .extend(positions.iter().enumerate().map(|(idx, position)| CellAgentPair {
                cell_id: CellCoord::from_position(*position, cell_size).pack(),
                agent_index: idx as u32,
            }));

        // Pairs are distinct (unique agent indices), so an unstable sort
        // still yields the unique (cell_id, agent_index) ascending order.
        if self.pairs.len() >= PARALLEL_SORT_THRESHOLD {
            self.pairs.par_sort_unstable();
        } else {
            self.pairs.sort_unstable();
        }

        self.rebuild_ranges();
        Ok(())
    }

    fn neighbors_within(
        &self,
        agent_idx: usize,
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        let Some(origin) = self.positions.get(agent_idx).copied() else {
            return;
        };
        self.neighbors_of_point(origin, radius_sq, &mut |other, dist_sq| {
            if other != agent_idx {
                visitor(other, dist_sq);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuilt(positions: &[Vec3], cell_size: f32) -> UniformGridIndex {
        let mut index = UniformGridIndex::new(cell_size);
        index.rebuild(positions).expect("rebuild");
        index
    }

    fn scatter(count: usize) -> Vec<Vec3> {
        // Deterministic pseudo-scatter without pulling in an RNG.
        (0..count)
            .map(|i| {
                let f = i as f32;
                Vec3::new(
                    (f * 7.31).sin() * 90.0,
                    (f * 3.77).cos() * 90.0,
                    (f * 1.93).sin() * 90.0,
                )
            })
            .collect()
    }

    #[test]
    fn pack_is_injective_for_nearby_cells() {
        let mut seen = std::collections::HashSet::new();
        for x in -4..4 {
            for y in -4..4 {
                for z in -4..4 {
                    assert!(seen.insert(CellCoord::new(x, y, z).pack()));
                }
            }
        }
    }

    #[test]
    fn pack_clamps_out_of_range_coordinates() {
        let boundary = CellCoord::new(i32::MAX, 0, 0).pack();
        let edge = CellCoord::new((AXIS_OFFSET - 1) as i32, 0, 0).pack();
        assert_eq!(boundary, edge);
        assert_ne!(boundary, CellCoord::new(0, 0, 0).pack());
    }

    #[test]
    fn rebuild_sorts_pairs_and_is_idempotent() {
        let positions = scatter(200);
        let mut index = rebuilt(&positions, 10.0);
        let first: Vec<CellAgentPair> = index.pairs().to_vec();
        assert!(first.windows(2).all(|w| w[0] < w[1]));

        index.rebuild(&positions).expect("rebuild");
        assert_eq!(index.pairs(), first.as_slice());
    }

    #[test]
    fn ranges_cover_every_agent_exactly_once() {
        let positions = scatter(150);
        let index = rebuilt(&positions, 10.0);

        let mut covered = 0usize;
        let mut cell_ids: Vec<u64> = index.pairs().iter().map(|p| p.cell_id).collect();
        cell_ids.dedup();
        for cell_id in cell_ids {
            let slice = index.cell_agents(cell_id);
            assert!(!slice.is_empty());
            assert!(slice.iter().all(|pair| pair.cell_id == cell_id));
            covered += slice.len();
        }
        assert_eq!(covered, positions.len());
    }

    #[test]
    fn query_on_absent_cell_is_empty() {
        let index = rebuilt(&[Vec3::ZERO], 10.0);
        let far = CellCoord::new(500, 500, 500).pack();
        assert!(index.cell_agents(far).is_empty());
    }

    #[test]
    fn empty_rebuild_yields_empty_tables() {
        let index = rebuilt(&[], 10.0);
        assert!(index.is_empty());
        assert!(index.pairs().is_empty());
        assert!(index.cell_agents(CellCoord::new(0, 0, 0).pack()).is_empty());
    }

    #[test]
    fn duplicate_positions_share_a_cell() {
        let positions = vec![Vec3::new(1.0, 1.0, 1.0); 4];
        let index = rebuilt(&positions, 10.0);
        let cell_id = index.cell_id_at(positions[0]);
        assert_eq!(index.cell_agents(cell_id).len(), 4);
    }

    #[test]
    fn neighbors_within_crosses_cell_borders() {
        // Two agents 1.0 apart but straddling a cell boundary at x = 0.
        let positions = vec![Vec3::new(-0.5, 0.0, 0.0), Vec3::new(0.5, 0.0, 0.0)];
        let index = rebuilt(&positions, 10.0);

        let mut visited = Vec::new();
        index.neighbors_within(0, 4.0, &mut |idx, dist_sq| {
            visited.push((idx, dist_sq.into_inner()));
        });
        assert_eq!(visited.len(), 1);
        assert_eq!(visited[0].0, 1);
        assert!((visited[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn neighbors_within_respects_radius() {
        let positions = vec![
            Vec3::ZERO,
            Vec3::new(3.0, 0.0, 0.0),
            Vec3::new(9.0, 0.0, 0.0),
        ];
        let index = rebuilt(&positions, 10.0);

        let mut visited = Vec::new();
        index.neighbors_within(0, 16.0, &mut |idx, _| visited.push(idx));
        assert_eq!(visited, vec![1]);
    }

    #[test]
    fn neighbors_matches_brute_force() {
        let positions = scatter(120);
        let index = rebuilt(&positions, 25.0);
        let radius_sq = 20.0f32 * 20.0;

        for agent in 0..positions.len() {
            let mut from_index: Vec<usize> = Vec::new();
            index.neighbors_within(agent, radius_sq, &mut |idx, _| from_index.push(idx));
            from_index.sort_unstable();

            let mut brute: Vec<usize> = (0..positions.len())
                .filter(|&other| {
                    other != agent
                        && positions[other].distance_squared(positions[agent]) <= radius_sq
                })
                .collect();
            brute.sort_unstable();
            assert_eq!(from_index, brute, "agent {agent}");
        }
    }

    #[test]
    fn point_query_includes_all_agents_in_range() {
        let positions = vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(30.0, 0.0, 0.0),
        ];
        let index = rebuilt(&positions, 10.0);

        let mut visited = Vec::new();
        index.neighbors_of_point(Vec3::ZERO, 9.0, &mut |idx, _| visited.push(idx));
        visited.sort_unstable();
        assert_eq!(visited, vec![0, 1]);
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        let mut index = UniformGridIndex::new(0.0);
        assert_eq!(
            index.rebuild(&[Vec3::ZERO]),
            Err(IndexError::InvalidConfig("cell_size must be positive"))
        );
    }
}
