//! Core flocking state shared across the Shoal workspace.
//!
//! Holds the authoritative obstacle store, the pattern volume registry, and
//! the per-step influence evaluation pipeline. Agent columns (positions,
//! velocities, species) are owned by the embedding simulation loop and
//! borrowed into [`FlockState::step`] each tick; the step output is one
//! steering vector per agent, consumed by an external motion integrator.

use glam::{Quat, Vec3};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use shoal_index::{NeighborhoodIndex, UniformGridIndex};
use slotmap::{SlotMap, new_key_type};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

new_key_type! {
    /// Revocable handle for one active pattern volume, backed by a
    /// generational slot map so a reused slot never revalidates a stale copy.
    pub struct PatternVolumeToken;
}

/// Distances below this are treated as coincident when normalizing.
const DISTANCE_EPSILON: f32 = 1e-5;

/// High level simulation clock (steps processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Plain index identifying a species row in the preset and relation tables.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct SpeciesId(pub u32);

impl SpeciesId {
    /// Table index for this species.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Directed relationship weights from one species toward another.
///
/// `attraction` below zero reads as avoidance, zero as indifference, above
/// zero as attraction. `leadership` scales how strongly the observing
/// species aligns with the observed one's heading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub attraction: f32,
    pub leadership: f32,
}

impl Default for Relation {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

impl Relation {
    /// Indifferent pairing: no pull, ordinary alignment weight.
    pub const NEUTRAL: Self = Self {
        attraction: 0.0,
        leadership: 1.0,
    };

    /// Avoidance relation of the given strength.
    #[must_use]
    pub const fn avoid(strength: f32) -> Self {
        Self {
            attraction: -strength,
            leadership: 1.0,
        }
    }

    /// Attraction relation of the given strength.
    #[must_use]
    pub const fn attract(strength: f32) -> Self {
        Self {
            attraction: strength,
            leadership: 1.0,
        }
    }

    /// Replace the leadership weight.
    #[must_use]
    pub const fn with_leadership(mut self, leadership: f32) -> Self {
        self.leadership = leadership;
        self
    }
}

/// Square table of pairwise species relations, row = observer, column = observed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionMatrix {
    species_count: usize,
    relations: Vec<Relation>,
}

impl InteractionMatrix {
    /// All-neutral matrix for `species_count` species.
    #[must_use]
    pub fn neutral(species_count: usize) -> Self {
        Self {
            species_count,
            relations: vec![Relation::NEUTRAL; species_count * species_count],
        }
    }

    /// Neutral matrix with unit same-species attraction on the diagonal.
    #[must_use]
    pub fn flocking(species_count: usize) -> Self {
        let mut matrix = Self::neutral(species_count);
        for species in 0..species_count {
            let id = SpeciesId(species as u32);
            matrix.set_relation(id, id, Relation::attract(1.0));
        }
        matrix
    }

    /// Number of species rows covered by this matrix.
    #[must_use]
    pub const fn species_count(&self) -> usize {
        self.species_count
    }

    /// Relation from `observer` toward `observed`; neutral for ids outside the table.
    #[must_use]
    pub fn relation(&self, observer: SpeciesId, observed: SpeciesId) -> Relation {
        let (row, column) = (observer.index(), observed.index());
        if row >= self.species_count || column >= self.species_count {
            return Relation::NEUTRAL;
        }
        self.relations[row * self.species_count + column]
    }

    /// Overwrite one directed relation; returns false for ids outside the table.
    pub fn set_relation(&mut self, observer: SpeciesId, observed: SpeciesId, relation: Relation) -> bool {
        let (row, column) = (observer.index(), observed.index());
        if row >= self.species_count || column >= self.species_count {
            return false;
        }
        self.relations[row * self.species_count + column] = relation;
        true
    }
}

/// Per-species steering weights and perception radii.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpeciesPreset {
    /// Radius within which neighbors contribute to steering.
    pub perception_radius: f32,
    /// Radius within which neighbors always repel.
    pub separation_radius: f32,
    pub separation_weight: f32,
    pub alignment_weight: f32,
    pub cohesion_weight: f32,
    /// Distance from an obstacle surface at which avoidance engages.
    pub obstacle_range: f32,
    pub obstacle_weight: f32,
    /// Scale applied to pattern volume contributions.
    pub pattern_weight: f32,
    /// Upper bound on the steering magnitude produced for this species.
    pub max_steer: f32,
}

impl Default for SpeciesPreset {
    fn default() -> Self {
        Self {
            perception_radius: 10.0,
            separation_radius: 3.0,
            separation_weight: 1.5,
            alignment_weight: 1.0,
            cohesion_weight: 1.0,
            obstacle_range: 8.0,
            obstacle_weight: 2.5,
            pattern_weight: 1.0,
            max_steer: 25.0,
        }
    }
}

/// Errors raised when validating species configuration.
#[derive(Debug, Error, PartialEq)]
pub enum SetupError {
    /// The preset table is empty.
    #[error("setup requires at least one species preset")]
    MissingPresets,
    /// Preset table and relation matrix disagree on the species count.
    #[error("interaction matrix covers {matrix} species but {presets} presets were provided")]
    MatrixDimensionMismatch { matrix: usize, presets: usize },
    /// A preset field that must be positive and finite is not.
    #[error("species {species} preset field {field} must be positive and finite")]
    InvalidPreset {
        species: usize,
        field: &'static str,
    },
    /// A relation weight is NaN or infinite.
    #[error("relation from species {observer} toward {observed} is not finite")]
    InvalidRelation { observer: usize, observed: usize },
}

/// Immutable species configuration consulted during influence evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlockSetup {
    pub presets: Vec<SpeciesPreset>,
    pub matrix: InteractionMatrix,
}

impl FlockSetup {
    /// Bundle presets with their relation matrix.
    #[must_use]
    pub const fn new(presets: Vec<SpeciesPreset>, matrix: InteractionMatrix) -> Self {
        Self { presets, matrix }
    }

    /// Single-species setup with unit same-species attraction.
    #[must_use]
    pub fn single_species(preset: SpeciesPreset) -> Self {
        Self {
            presets: vec![preset],
            matrix: InteractionMatrix::flocking(1),
        }
    }

    /// `species_count` copies of `preset` with a flocking matrix.
    #[must_use]
    pub fn uniform(species_count: usize, preset: SpeciesPreset) -> Self {
        Self {
            presets: vec![preset; species_count],
            matrix: InteractionMatrix::flocking(species_count),
        }
    }

    /// Number of species described by this setup.
    #[must_use]
    pub fn species_count(&self) -> usize {
        self.presets.len()
    }

    /// Check table coherence and field ranges.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.presets.is_empty() {
            return Err(SetupError::MissingPresets);
        }
        if self.matrix.species_count() != self.presets.len() {
            return Err(SetupError::MatrixDimensionMismatch {
                matrix: self.matrix.species_count(),
                presets: self.presets.len(),
            });
        }
        for (species, preset) in self.presets.iter().enumerate() {
            let positive = [
                (preset.perception_radius, "perception_radius"),
                (preset.separation_radius, "separation_radius"),
                (preset.obstacle_range, "obstacle_range"),
                (preset.max_steer, "max_steer"),
            ];
            for (value, field) in positive {
                if !(value > 0.0) || !value.is_finite() {
                    return Err(SetupError::InvalidPreset { species, field });
                }
            }
            let finite = [
                (preset.separation_weight, "separation_weight"),
                (preset.alignment_weight, "alignment_weight"),
                (preset.cohesion_weight, "cohesion_weight"),
                (preset.obstacle_weight, "obstacle_weight"),
                (preset.pattern_weight, "pattern_weight"),
            ];
            for (value, field) in finite {
                if !value.is_finite() {
                    return Err(SetupError::InvalidPreset { species, field });
                }
            }
        }
        for observer in 0..self.presets.len() {
            for observed in 0..self.presets.len() {
                let relation = self
                    .matrix
                    .relation(SpeciesId(observer as u32), SpeciesId(observed as u32));
                if !relation.attraction.is_finite() || !relation.leadership.is_finite() {
                    return Err(SetupError::InvalidRelation { observer, observed });
                }
            }
        }
        Ok(())
    }
}

/// Geometry of one obstacle volume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ObstacleShape {
    Sphere {
        radius: f32,
    },
    Box {
        half_extents: Vec3,
        rotation: Quat,
    },
}

/// One obstacle in the authoritative store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ObstacleVolume {
    pub position: Vec3,
    pub shape: ObstacleShape,
}

impl Default for ObstacleVolume {
    fn default() -> Self {
        Self::inert()
    }
}

impl ObstacleVolume {
    /// Placeholder volume that exerts no influence; fills unused store slots.
    #[must_use]
    pub const fn inert() -> Self {
        Self {
            position: Vec3::ZERO,
            shape: ObstacleShape::Sphere { radius: 0.0 },
        }
    }

    /// Sphere obstacle at `position`.
    #[must_use]
    pub const fn sphere(position: Vec3, radius: f32) -> Self {
        Self {
            position,
            shape: ObstacleShape::Sphere { radius },
        }
    }

    /// Oriented box obstacle at `position`.
    #[must_use]
    pub const fn boxed(position: Vec3, half_extents: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            shape: ObstacleShape::Box {
                half_extents,
                rotation,
            },
        }
    }

    /// Whether this volume has no extent and is skipped by evaluation.
    #[must_use]
    pub fn is_inert(&self) -> bool {
        match self.shape {
            ObstacleShape::Sphere { radius } => radius <= 0.0,
            ObstacleShape::Box { half_extents, .. } => half_extents.min_element() <= 0.0,
        }
    }

    /// Outward direction and signed distance from `point` to this volume's
    /// surface (negative inside).
    #[must_use]
    pub fn surface_offset(&self, point: Vec3) -> (Vec3, f32) {
        match self.shape {
            ObstacleShape::Sphere { radius } => {
                let delta = point - self.position;
                let dist = delta.length();
                if dist > DISTANCE_EPSILON {
                    (delta / dist, dist - radius)
                } else {
                    (Vec3::X, -radius)
                }
            }
            ObstacleShape::Box {
                half_extents,
                rotation,
            } => {
                let local = rotation.inverse() * (point - self.position);
                let clamped = local.clamp(-half_extents, half_extents);
                let delta = local - clamped;
                let dist_sq = delta.length_squared();
                if dist_sq > DISTANCE_EPSILON * DISTANCE_EPSILON {
                    let dist = dist_sq.sqrt();
                    (rotation * (delta / dist), dist)
                } else {
                    // Interior point: exit through the nearest face.
                    let slack = half_extents - local.abs();
                    let mut axis = 0usize;
                    if slack.y < slack[axis] {
                        axis = 1;
                    }
                    if slack.z < slack[axis] {
                        axis = 2;
                    }
                    let mut direction = Vec3::ZERO;
                    direction[axis] = if local[axis] >= 0.0 { 1.0 } else { -1.0 };
                    (rotation * direction, -slack[axis])
                }
            }
        }
    }
}

/// Index-targeted overwrite of one obstacle slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IndexedObstacleChange {
    pub index: usize,
    pub data: ObstacleVolume,
}

/// Errors raised by the obstacle runtime store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObstacleStoreError {
    /// A change record targets a slot outside the store's capacity.
    #[error("obstacle index {index} out of range for capacity {capacity}")]
    IndexOutOfRange { index: usize, capacity: usize },
}

/// Fixed-capacity authoritative obstacle array, mutated only through
/// indexed change batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObstacleStore {
    slots: Vec<ObstacleVolume>,
}

impl ObstacleStore {
    /// Store with `capacity` slots, all initially inert.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![ObstacleVolume::inert(); capacity],
        }
    }

    /// Number of addressable slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The volume stored at `index`, if within capacity.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ObstacleVolume> {
        self.slots.get(index)
    }

    /// All slots, inert ones included.
    #[must_use]
    pub fn slots(&self) -> &[ObstacleVolume] {
        &self.slots
    }

    /// Apply a batch of indexed overwrites and return the record count.
    ///
    /// Every index is bounds-checked before anything is written, so a batch
    /// containing an out-of-range record fails without touching any slot.
    /// Records with distinct indices address disjoint slots and are applied
    /// in parallel with no ordering between them; a batch that targets the
    /// same index twice violates the producer contract and leaves that slot
    /// holding an unspecified record from the batch.
    pub fn apply_changes(
        &mut self,
        changes: &[IndexedObstacleChange],
    ) -> Result<usize, ObstacleStoreError> {
        let capacity = self.slots.len();
        for change in changes {
            if change.index >= capacity {
                return Err(ObstacleStoreError::IndexOutOfRange {
                    index: change.index,
                    capacity,
                });
            }
        }
        if changes.is_empty() {
            return Ok(0);
        }

        let lookup: HashMap<usize, ObstacleVolume> = changes
            .iter()
            .map(|change| (change.index, change.data))
            .collect();
        self.slots
            .par_iter_mut()
            .enumerate()
            .for_each(|(index, slot)| {
                if let Some(data) = lookup.get(&index) {
                    *slot = *data;
                }
            });
        Ok(changes.len())
    }
}

/// Radial attenuation applied to a pattern volume's strength.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Falloff {
    /// Full strength throughout the volume.
    #[default]
    Constant,
    /// Linear fade from center to boundary.
    Linear,
    /// Smoothstep fade from center to boundary.
    Smooth,
}

impl Falloff {
    /// Gain for a normalized distance `t` in `[0, 1]` from the center.
    #[must_use]
    pub fn gain(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Self::Constant => 1.0,
            Self::Linear => 1.0 - t,
            Self::Smooth => {
                let fade = t * t * (3.0 - 2.0 * t);
                1.0 - fade
            }
        }
    }
}

/// Steering effect a pattern volume exerts on agents inside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PatternKind {
    /// Pull toward the center, or toward a shell when `inner_radius` is set.
    Attraction,
    /// Push away from the center.
    Repulsion,
    /// Swirl around `axis` through the center.
    Vortex,
}

/// Static configuration of one pattern volume; read-only to the core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PatternVolumeProfile {
    pub kind: PatternKind,
    pub center: Vec3,
    /// Outer radius of effect; non-positive disables the volume.
    pub radius: f32,
    /// Shell radius for attraction volumes; zero pulls to the center point.
    pub inner_radius: f32,
    /// Swirl axis for vortex volumes.
    pub axis: Vec3,
    pub strength: f32,
    pub falloff: Falloff,
}

impl PatternVolumeProfile {
    /// Attraction volume pulling toward `center`.
    #[must_use]
    pub const fn attraction(center: Vec3, radius: f32, strength: f32) -> Self {
        Self {
            kind: PatternKind::Attraction,
            center,
            radius,
            inner_radius: 0.0,
            axis: Vec3::Z,
            strength,
            falloff: Falloff::Constant,
        }
    }

    /// Attraction shell holding agents near `inner_radius` from `center`.
    #[must_use]
    pub const fn shell(center: Vec3, inner_radius: f32, radius: f32, strength: f32) -> Self {
        Self {
            kind: PatternKind::Attraction,
            center,
            radius,
            inner_radius,
            axis: Vec3::Z,
            strength,
            falloff: Falloff::Constant,
        }
    }

    /// Repulsion volume pushing away from `center`.
    #[must_use]
    pub const fn repulsion(center: Vec3, radius: f32, strength: f32) -> Self {
        Self {
            kind: PatternKind::Repulsion,
            center,
            radius,
            inner_radius: 0.0,
            axis: Vec3::Z,
            strength,
            falloff: Falloff::Constant,
        }
    }

    /// Vortex swirling around `axis` through `center`.
    #[must_use]
    pub const fn vortex(center: Vec3, axis: Vec3, radius: f32, strength: f32) -> Self {
        Self {
            kind: PatternKind::Vortex,
            center,
            radius,
            inner_radius: 0.0,
            axis,
            strength,
            falloff: Falloff::Constant,
        }
    }

    /// Replace the falloff curve.
    #[must_use]
    pub const fn with_falloff(mut self, falloff: Falloff) -> Self {
        self.falloff = falloff;
        self
    }

    /// Steering contribution for an agent at `point`; zero outside the volume.
    #[must_use]
    pub fn influence(&self, point: Vec3) -> Vec3 {
        if self.radius <= 0.0 {
            return Vec3::ZERO;
        }
        let delta = point - self.center;
        let dist = delta.length();
        if dist > self.radius || dist <= DISTANCE_EPSILON {
            return Vec3::ZERO;
        }
        let gain = self.falloff.gain(dist / self.radius) * self.strength;
        let outward = delta / dist;
        match self.kind {
            PatternKind::Attraction => {
                if self.inner_radius > 0.0 && dist < self.inner_radius {
                    outward * gain
                } else {
                    -outward * gain
                }
            }
            PatternKind::Repulsion => outward * gain,
            PatternKind::Vortex => {
                let axis = self.axis.normalize_or_zero();
                axis.cross(delta).normalize_or_zero() * gain
            }
        }
    }
}

/// Errors raised by the pattern volume registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternVolumeError {
    /// The registry's hard instance ceiling is already reached.
    #[error("pattern volume capacity {capacity} exceeded")]
    CapacityExceeded { capacity: usize },
}

/// Lifecycle manager for active pattern volume instances.
///
/// Tokens are generational slot map keys: stopping an instance bumps the
/// slot's version, so stale copies of the token can never address whatever
/// instance later reuses the slot.
#[derive(Debug, Default)]
pub struct PatternVolumeRegistry {
    slots: SlotMap<PatternVolumeToken, PatternVolumeProfile>,
    limit: Option<usize>,
}

impl PatternVolumeRegistry {
    /// Registry with no instance ceiling.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry refusing to grow beyond `limit` live instances.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: SlotMap::with_key(),
            limit: Some(limit),
        }
    }

    /// Number of live instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true when no instance is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Activate a volume and return its token.
    pub fn start(
        &mut self,
        profile: PatternVolumeProfile,
    ) -> Result<PatternVolumeToken, PatternVolumeError> {
        if let Some(capacity) = self.limit {
            if self.slots.len() >= capacity {
                return Err(PatternVolumeError::CapacityExceeded { capacity });
            }
        }
        Ok(self.slots.insert(profile))
    }

    /// Deactivate the instance behind `token`; stale tokens are a no-op.
    ///
    /// Returns whether an instance was actually removed.
    pub fn stop(&mut self, token: PatternVolumeToken) -> bool {
        self.slots.remove(token).is_some()
    }

    /// Whether `token` still addresses a live instance.
    #[must_use]
    pub fn is_valid(&self, token: PatternVolumeToken) -> bool {
        self.slots.contains_key(token)
    }

    /// Profile behind `token` while it is live.
    #[must_use]
    pub fn get(&self, token: PatternVolumeToken) -> Option<&PatternVolumeProfile> {
        self.slots.get(token)
    }

    /// Restartable enumeration of all live instances.
    pub fn active(
        &self,
    ) -> impl Iterator<Item = (PatternVolumeToken, &PatternVolumeProfile)> + '_ {
        self.slots.iter()
    }
}

/// Deferred registry mutation, drained once per step.
#[derive(Debug, Clone)]
enum PatternCommand {
    Start(PatternVolumeProfile),
    Stop(PatternVolumeToken),
}

/// Errors that can occur when constructing or stepping flock state.
#[derive(Debug, Error)]
pub enum FlockStateError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The borrowed agent columns are incoherent.
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error(transparent)]
    Obstacle(#[from] ObstacleStoreError),
    #[error(transparent)]
    Pattern(#[from] PatternVolumeError),
    #[error(transparent)]
    Index(#[from] shoal_index::IndexError),
}

/// Static configuration for a flock core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlockConfig {
    /// Edge length of spatial grid cells; keep at or above the largest
    /// perception radius in the species presets.
    pub cell_size: f32,
    /// Number of obstacle slots in the authoritative store.
    pub obstacle_capacity: usize,
    /// Hard ceiling on live pattern volumes; `None` grows freely.
    pub pattern_volume_limit: Option<usize>,
    /// Step summaries retained in the history ring; 0 disables recording.
    pub history_capacity: usize,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            cell_size: 10.0,
            obstacle_capacity: 64,
            pattern_volume_limit: None,
            history_capacity: 256,
        }
    }
}

impl FlockConfig {
    fn validate(&self) -> Result<(), FlockStateError> {
        if !(self.cell_size > 0.0) || !self.cell_size.is_finite() {
            return Err(FlockStateError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        Ok(())
    }
}

/// Agent columns borrowed from the embedding simulation for one step.
#[derive(Debug, Clone, Copy)]
pub struct FlockFrame<'a> {
    pub positions: &'a [Vec3],
    pub velocities: &'a [Vec3],
    pub species: &'a [SpeciesId],
}

impl<'a> FlockFrame<'a> {
    /// Borrow the three agent columns.
    #[must_use]
    pub const fn new(
        positions: &'a [Vec3],
        velocities: &'a [Vec3],
        species: &'a [SpeciesId],
    ) -> Self {
        Self {
            positions,
            velocities,
            species,
        }
    }

    /// Number of agents in the frame.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when the frame carries no agents.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn validate(&self, species_count: usize) -> Result<(), FlockStateError> {
        if self.velocities.len() != self.positions.len()
            || self.species.len() != self.positions.len()
        {
            return Err(FlockStateError::InvalidFrame(
                "position, velocity, and species columns must have equal length",
            ));
        }
        if self
            .species
            .iter()
            .any(|species| species.index() >= species_count)
        {
            return Err(FlockStateError::InvalidFrame(
                "species id outside the preset table",
            ));
        }
        Ok(())
    }
}

/// Events emitted after processing one step.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepEvents {
    pub tick: Tick,
    /// Tokens minted by queued start requests drained this step.
    pub volumes_started: Vec<PatternVolumeToken>,
    /// Obstacle change records applied this step.
    pub obstacle_changes_applied: usize,
}

/// Per-step record retained in the bounded history ring.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub active_volumes: usize,
    pub obstacle_changes_applied: usize,
    pub mean_steering: f32,
}

/// Aggregate flock state driven once per simulation step.
///
/// Stages inside [`FlockState::step`] run strictly in sequence; each stage
/// parallelizes internally over disjoint work items. All shared-state
/// mutation (obstacle overwrites, pattern start/stop) happens in the drain
/// stages before the evaluator reads anything.
pub struct FlockState {
    config: FlockConfig,
    tick: Tick,
    index: UniformGridIndex,
    obstacles: ObstacleStore,
    patterns: PatternVolumeRegistry,
    pending_obstacles: Vec<IndexedObstacleChange>,
    pending_patterns: Vec<PatternCommand>,
    steering: Vec<Vec3>,
    history: VecDeque<StepSummary>,
}

impl fmt::Debug for FlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockState")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("active_volumes", &self.patterns.len())
            .field("obstacle_capacity", &self.obstacles.capacity())
            .finish()
    }
}

impl FlockState {
    /// Instantiate flock state from the supplied configuration.
    pub fn new(config: FlockConfig) -> Result<Self, FlockStateError> {
        config.validate()?;
        let patterns = match config.pattern_volume_limit {
            Some(limit) => PatternVolumeRegistry::with_limit(limit),
            None => PatternVolumeRegistry::new(),
        };
        Ok(Self {
            index: UniformGridIndex::new(config.cell_size),
            obstacles: ObstacleStore::with_capacity(config.obstacle_capacity),
            patterns,
            config,
            tick: Tick::zero(),
            pending_obstacles: Vec::new(),
            pending_patterns: Vec::new(),
            steering: Vec::new(),
            history: VecDeque::new(),
        })
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub const fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Steering vectors produced by the last step, one per agent.
    #[must_use]
    pub fn steering(&self) -> &[Vec3] {
        &self.steering
    }

    /// The authoritative obstacle store.
    #[must_use]
    pub const fn obstacles(&self) -> &ObstacleStore {
        &self.obstacles
    }

    /// The pattern volume registry.
    #[must_use]
    pub const fn patterns(&self) -> &PatternVolumeRegistry {
        &self.patterns
    }

    /// Retained step summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepSummary> + '_ {
        self.history.iter()
    }

    /// Queue an obstacle change batch for the next step's drain stage.
    pub fn queue_obstacle_changes(
        &mut self,
        changes: impl IntoIterator<Item = IndexedObstacleChange>,
    ) {
        self.pending_obstacles.extend(changes);
    }

    /// Queue a pattern volume activation; the token surfaces in the next
    /// step's [`StepEvents::volumes_started`].
    pub fn queue_pattern_start(&mut self, profile: PatternVolumeProfile) {
        self.pending_patterns.push(PatternCommand::Start(profile));
    }

    /// Queue a pattern volume deactivation; stale tokens drain as no-ops.
    pub fn queue_pattern_stop(&mut self, token: PatternVolumeToken) {
        self.pending_patterns.push(PatternCommand::Stop(token));
    }

    /// Activate a pattern volume immediately (between steps).
    pub fn start_pattern(
        &mut self,
        profile: PatternVolumeProfile,
    ) -> Result<PatternVolumeToken, PatternVolumeError> {
        self.patterns.start(profile)
    }

    /// Deactivate a pattern volume immediately; stale tokens are a no-op.
    pub fn stop_pattern(&mut self, token: PatternVolumeToken) -> bool {
        let removed = self.patterns.stop(token);
        if !removed {
            debug!("stop requested for a stale pattern token");
        }
        removed
    }

    /// Whether `token` still addresses a live pattern volume.
    #[must_use]
    pub fn pattern_is_valid(&self, token: PatternVolumeToken) -> bool {
        self.patterns.is_valid(token)
    }

    /// Live pattern volume instances.
    pub fn active_patterns(
        &self,
    ) -> impl Iterator<Item = (PatternVolumeToken, &PatternVolumeProfile)> + '_ {
        self.patterns.active()
    }

    fn stage_drain_patterns(&mut self) -> Vec<PatternVolumeToken> {
        let mut started = Vec::new();
        for command in std::mem::take(&mut self.pending_patterns) {
            match command {
                PatternCommand::Start(profile) => match self.patterns.start(profile) {
                    Ok(token) => started.push(token),
                    Err(err) => warn!("queued pattern start dropped: {err}"),
                },
                PatternCommand::Stop(token) => {
                    if !self.patterns.stop(token) {
                        debug!("queued stop drained against a stale pattern token");
                    }
                }
            }
        }
        started
    }

    fn stage_apply_obstacles(&mut self) -> Result<usize, ObstacleStoreError> {
        let changes = std::mem::take(&mut self.pending_obstacles);
        if changes.is_empty() {
            return Ok(0);
        }
        match self.obstacles.apply_changes(&changes) {
            Ok(applied) => Ok(applied),
            Err(err) => {
                // The offending batch is discarded; later batches still run.
                warn!("obstacle change batch rejected: {err}");
                Err(err)
            }
        }
    }

    fn stage_evaluate(&mut self, frame: &FlockFrame<'_>, setup: &FlockSetup) {
        let agent_count = frame.len();
        self.steering.clear();
        if agent_count == 0 {
            return;
        }

        let index = &self.index;
        let obstacles = self.obstacles.slots();
        let volumes: Vec<PatternVolumeProfile> =
            self.patterns.active().map(|(_, profile)| *profile).collect();

        let results: Vec<Vec3> = (0..agent_count)
            .into_par_iter()
            .map(|idx| {
                let species_id = frame.species[idx];
                let preset = &setup.presets[species_id.index()];
                let origin = frame.positions[idx];
                let radius_sq = preset.perception_radius * preset.perception_radius;

                let mut separation = Vec3::ZERO;
                let mut velocity_sum = Vec3::ZERO;
                let mut alignment_weight = 0.0f32;
                let mut center_sum = Vec3::ZERO;
                let mut cohesion_weight = 0.0f32;

                index.neighbors_within(idx, radius_sq, &mut |other, dist_sq: OrderedFloat<f32>| {
                    let relation = setup.matrix.relation(species_id, frame.species[other]);
                    let dist = dist_sq.into_inner().sqrt();
                    if dist > DISTANCE_EPSILON && dist < preset.separation_radius {
                        let press = 1.0 + relation.attraction.min(0.0).abs();
                        separation +=
                            (origin - frame.positions[other]) * (press / (dist * dist));
                    }
                    let lead = relation.leadership.max(0.0);
                    if lead > 0.0 {
                        velocity_sum += frame.velocities[other] * lead;
                        alignment_weight += lead;
                    }
                    let pull = relation.attraction.max(0.0);
                    if pull > 0.0 {
                        center_sum += frame.positions[other] * pull;
                        cohesion_weight += pull;
                    }
                });

                let mut steering = separation * preset.separation_weight;
                if alignment_weight > 0.0 {
                    let mean_velocity = velocity_sum / alignment_weight;
                    steering += (mean_velocity - frame.velocities[idx]) * preset.alignment_weight;
                }
                if cohesion_weight > 0.0 {
                    let center = center_sum / cohesion_weight;
                    steering += (center - origin) * preset.cohesion_weight;
                }

                for volume in obstacles {
                    if volume.is_inert() {
                        continue;
                    }
                    let (away, distance) = volume.surface_offset(origin);
                    if distance < preset.obstacle_range {
                        let urgency = 1.0 - (distance.max(0.0) / preset.obstacle_range);
                        steering += away * (urgency * preset.obstacle_weight);
                    }
                }

                for profile in &volumes {
                    steering += profile.influence(origin) * preset.pattern_weight;
                }

                steering.clamp_length_max(preset.max_steer)
            })
            .collect();

        self.steering = results;
    }

    fn stage_record(&mut self, tick: Tick, agent_count: usize, obstacle_changes_applied: usize) {
        if self.config.history_capacity == 0 {
            return;
        }
        let mean_steering = if agent_count > 0 {
            self.steering.iter().map(|s| s.length()).sum::<f32>() / agent_count as f32
        } else {
            0.0
        };
        self.history.push_back(StepSummary {
            tick,
            agent_count,
            active_volumes: self.patterns.len(),
            obstacle_changes_applied,
            mean_steering,
        });
        while self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
    }

    /// Execute one step pipeline: drain queued registry and obstacle
    /// mutations, rebuild the spatial index, evaluate per-agent influence,
    /// and record a summary.
    ///
    /// A rejected obstacle batch fails the step and is discarded; queued
    /// pattern commands drained before the failure remain applied.
    pub fn step(
        &mut self,
        frame: &FlockFrame<'_>,
        setup: &FlockSetup,
    ) -> Result<StepEvents, FlockStateError> {
        frame.validate(setup.species_count())?;
        let next_tick = self.tick.next();

        let volumes_started = self.stage_drain_patterns();
        let obstacle_changes_applied = self.stage_apply_obstacles()?;
        self.index.rebuild(frame.positions)?;
        self.stage_evaluate(frame, setup);
        self.stage_record(next_tick, frame.len(), obstacle_changes_applied);

        self.tick = next_tick;
        Ok(StepEvents {
            tick: self.tick,
            volumes_started,
            obstacle_changes_applied,
        })
    }
}
