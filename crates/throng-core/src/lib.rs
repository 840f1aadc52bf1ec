//! Core types and the per-tick crowd stepping engine for the Throng workspace.

use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use thiserror::Error;
use throng_index::{IndexError, SpatialIndex, UniformGridIndex};

new_key_type! {
    /// Handle for a navigation policy registered with the world.
    pub struct PolicyKey;
}

/// Reference agent radius; an agent's mass is `(radius / REFERENCE_RADIUS)^2`.
pub const REFERENCE_RADIUS: f32 = 0.24;

/// Floor applied to the relaxation window of goal-reaching accelerations.
const GOAL_REACH_RELAXATION: f32 = 0.5;
/// Density below which blended integration uses pure steering.
const BLEND_LOW_DENSITY: f32 = 2.0;
/// Density above which blended integration uses pure goal-reaching + fluid.
const BLEND_HIGH_DENSITY: f32 = 4.0;
/// Density mapped to the top of the visualization color ramp.
const COLOR_DENSITY_LIMIT: f32 = 10.0;
/// Squared-magnitude threshold below which the viewing direction is kept.
const VIEW_TURN_THRESHOLD: f32 = 0.01;

/// Two-dimensional vector used for positions, velocities, and forces.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y
    }

    #[must_use]
    pub fn length_sq(self) -> f32 {
        self.dot(self)
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.length_sq().sqrt()
    }

    #[must_use]
    pub fn distance_sq(self, other: Self) -> f32 {
        (self - other).length_sq()
    }

    /// Unit vector in the same direction, or zero when the length is
    /// too small to normalize safely.
    #[must_use]
    pub fn normalized_or_zero(self) -> Self {
        let len = self.length();
        if len > f32::EPSILON {
            self / len
        } else {
            Self::ZERO
        }
    }

    /// Scales the vector down to `max_length` when it is longer.
    #[must_use]
    pub fn clamped(self, max_length: f32) -> Self {
        let len_sq = self.length_sq();
        if len_sq > max_length * max_length {
            self * (max_length / len_sq.sqrt())
        } else {
            self
        }
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Vec2 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y)
    }
}

impl Mul<f32> for Vec2 {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<f32> for Vec2 {
    type Output = Self;
    fn div(self, rhs: f32) -> Self {
        Self::new(self.x / rhs, self.y / rhs)
    }
}

impl AddAssign for Vec2 {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl SubAssign for Vec2 {
    fn sub_assign(&mut self, rhs: Self) {
        self.x -= rhs.x;
        self.y -= rhs.y;
    }
}

/// Unsigned angle between two vectors in radians; zero if either is degenerate.
fn angle_between(a: Vec2, b: Vec2) -> f32 {
    let denom = a.length() * b.length();
    if denom <= f32::EPSILON {
        return 0.0;
    }
    (a.dot(b) / denom).clamp(-1.0, 1.0).acos()
}

/// One edge of an obstacle polygon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    pub start: Vec2,
    pub end: Vec2,
}

impl LineSegment {
    #[must_use]
    pub const fn new(start: Vec2, end: Vec2) -> Self {
        Self { start, end }
    }

    /// Closest point on the segment to `point`.
    #[must_use]
    pub fn nearest_point(&self, point: Vec2) -> Vec2 {
        let span = self.end - self.start;
        let len_sq = span.length_sq();
        if len_sq <= f32::EPSILON {
            return self.start;
        }
        let t = ((point - self.start).dot(span) / len_sq).clamp(0.0, 1.0);
        self.start + span * t
    }

    /// Squared distance from `point` to the segment.
    #[must_use]
    pub fn distance_sq(&self, point: Vec2) -> f32 {
        self.nearest_point(point).distance_sq(point)
    }
}

/// World topology: open plane, or a torus that wraps both axes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Topology {
    #[default]
    Unbounded,
    Periodic {
        width: f32,
        height: f32,
    },
}

impl Topology {
    /// Maps a position into the canonical box for periodic worlds.
    #[must_use]
    pub fn wrap(&self, position: Vec2) -> Vec2 {
        match *self {
            Topology::Unbounded => position,
            Topology::Periodic { width, height } => {
                Vec2::new(position.x.rem_euclid(width), position.y.rem_euclid(height))
            }
        }
    }

    /// Offsets of the periodic images to probe during a range query.
    /// The zero offset always comes first.
    fn image_offsets(&self) -> SmallVec<[Vec2; 9]> {
        match *self {
            Topology::Unbounded => {
                let mut offsets = SmallVec::new();
                offsets.push(Vec2::ZERO);
                offsets
            }
            Topology::Periodic { width, height } => {
                let mut offsets = SmallVec::new();
                offsets.push(Vec2::ZERO);
                for dy in [-1.0f32, 0.0, 1.0] {
                    for dx in [-1.0f32, 0.0, 1.0] {
                        if dx == 0.0 && dy == 0.0 {
                            continue;
                        }
                        offsets.push(Vec2::new(dx * width, dy * height));
                    }
                }
                offsets
            }
        }
    }
}

/// Numerical scheme used to advance agent velocities and positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationScheme {
    #[default]
    Euler,
    RungeKutta4,
    Verlet,
    Leapfrog,
}

/// Parameters of the fluid density model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphSettings {
    /// Whether the density/pressure/viscosity passes run at all.
    pub enabled: bool,
    /// Whether integration blends steering against goal-reaching + fluid
    /// acceleration as a function of local density.
    pub density_blending: bool,
    /// Gas constant of the pressure equation of state.
    pub gas_constant: f32,
    /// Viscosity constant; a value of zero skips the viscosity pass entirely.
    pub viscosity_constant: f32,
    /// Lower clamp for the personal rest density.
    pub min_rest_density: f32,
    /// Upper clamp for the personal rest density.
    pub max_rest_density: f32,
    /// Smoothing window for the personal rest density update.
    pub density_time_window: f32,
}

impl Default for SphSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            density_blending: false,
            gas_constant: 200.0,
            viscosity_constant: 0.0,
            min_rest_density: 0.0,
            max_rest_density: 5.0,
            density_time_window: 0.1,
        }
    }
}

/// Global navigation switches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NavSettings {
    /// Route preferred velocities through navigation-map direction fields.
    pub global_navigation: bool,
    /// Re-select the least-congested map (and adopt its goal) every tick.
    pub nearest_map_selection: bool,
    /// Feed congestion statistics back into map distance multipliers.
    pub dynamic_maps: bool,
    /// Smoothing window for the congestion distance multiplier.
    pub time_window: f32,
}

impl Default for NavSettings {
    fn default() -> Self {
        Self {
            global_navigation: false,
            nearest_map_selection: false,
            dynamic_maps: false,
            time_window: 5.0,
        }
    }
}

impl NavSettings {
    /// True when congestion statistics are accumulated and collated.
    #[must_use]
    pub fn congestion_active(&self) -> bool {
        self.global_navigation && self.nearest_map_selection && self.dynamic_maps
    }
}

/// Static configuration for a crowd world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrongConfig {
    /// Length of one physics tick in seconds.
    pub fine_delta_time: f32,
    /// Cadence at which the spatial index is rebuilt and coarse-only
    /// policies recompute, in seconds.
    pub coarse_delta_time: f32,
    /// World topology.
    pub topology: Topology,
    /// Integration scheme applied to every agent.
    pub integration: IntegrationScheme,
    /// Goal-arrival distance expressed as a multiple of the agent radius.
    pub goal_radius: f32,
    /// Fluid density model parameters.
    pub sph: SphSettings,
    /// Global navigation switches.
    pub navigation: NavSettings,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for ThrongConfig {
    fn default() -> Self {
        Self {
            fine_delta_time: 0.1,
            coarse_delta_time: 0.1,
            topology: Topology::Unbounded,
            integration: IntegrationScheme::Euler,
            goal_radius: 1.0,
            sph: SphSettings::default(),
            navigation: NavSettings::default(),
            history_capacity: 256,
        }
    }
}

impl ThrongConfig {
    fn validate(&self) -> Result<(), WorldError> {
        if !(self.fine_delta_time > 0.0) || !self.fine_delta_time.is_finite() {
            return Err(WorldError::InvalidConfig("fine_delta_time must be positive"));
        }
        if self.coarse_delta_time < self.fine_delta_time {
            return Err(WorldError::InvalidConfig(
                "coarse_delta_time must be at least fine_delta_time",
            ));
        }
        if !(self.goal_radius > 0.0) {
            return Err(WorldError::InvalidConfig("goal_radius must be positive"));
        }
        if let Topology::Periodic { width, height } = self.topology {
            if !(width > 0.0) || !(height > 0.0) {
                return Err(WorldError::InvalidConfig(
                    "periodic topology requires positive dimensions",
                ));
            }
        }
        if self.sph.enabled {
            if !(self.sph.density_time_window > 0.0) {
                return Err(WorldError::InvalidConfig(
                    "density_time_window must be positive",
                ));
            }
            if self.sph.min_rest_density > self.sph.max_rest_density {
                return Err(WorldError::InvalidConfig(
                    "min_rest_density must not exceed max_rest_density",
                ));
            }
        }
        if self.navigation.dynamic_maps && !(self.navigation.time_window > 0.0) {
            return Err(WorldError::InvalidConfig(
                "navigation time_window must be positive",
            ));
        }
        Ok(())
    }
}

/// Errors surfaced by world construction and stepping.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A lookup or removal referenced an agent that is not in the world.
    #[error("agent {0} is not in the world")]
    AgentNotFound(AgentId),
    /// The supplied policy handle does not refer to a registered policy.
    #[error("policy handle is stale or unregistered")]
    UnknownPolicy,
    /// The spatial index rejected the current agent positions.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    fn advance(&mut self) {
        self.0 += 1;
    }
}

/// Stable numeric identity of an agent, unique among live and pending agents.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AgentId(u64);

impl AgentId {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Initial attributes of an agent entering the world.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentSeed {
    pub position: Vec2,
    pub velocity: Vec2,
    pub goal: Vec2,
    pub radius: f32,
    pub preferred_speed: f32,
    pub max_speed: f32,
    pub max_acceleration: f32,
    pub color: [u8; 3],
    /// Remove the agent once it is within the goal-arrival radius.
    pub remove_at_goal: bool,
}

impl AgentSeed {
    /// Seed with default attributes, positioned (and goaled) at `position`.
    #[must_use]
    pub fn at(position: Vec2) -> Self {
        Self {
            position,
            velocity: Vec2::ZERO,
            goal: position,
            radius: REFERENCE_RADIUS,
            preferred_speed: 1.4,
            max_speed: 1.8,
            max_acceleration: 5.0,
            color: [0, 0, 0],
            remove_at_goal: false,
        }
    }

    /// Mass derived from the radius relative to the reference radius.
    #[must_use]
    pub fn mass(&self) -> f32 {
        (self.radius / REFERENCE_RADIUS).powi(2)
    }
}

/// Per-agent fluid model scratch state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphState {
    pub density: f32,
    pub rest_density: f32,
    pub pressure: f32,
    pub pressure_force: Vec2,
    pub viscosity_force: Vec2,
    pub acceleration: Vec2,
}

impl Default for SphState {
    fn default() -> Self {
        Self {
            density: 1.0,
            rest_density: 1.0,
            pressure: 0.0,
            pressure_force: Vec2::ZERO,
            viscosity_force: Vec2::ZERO,
            acceleration: Vec2::ZERO,
        }
    }
}

/// Read-only view of one live agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub viewing_direction: Vec2,
    pub color: [u8; 3],
    pub density: f32,
}

/// One agent's pose sample within a trajectory batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectorySample {
    pub id: AgentId,
    pub position: Vec2,
    pub orientation: Vec2,
    pub color: [u8; 3],
}

/// Per-tick payload handed to trajectory recorders.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryBatch {
    pub tick: Tick,
    pub time: f32,
    pub samples: Vec<TrajectorySample>,
}

/// Sink invoked with a trajectory batch after every tick.
pub trait TrajectoryRecorder: Send {
    fn on_tick(&mut self, batch: &TrajectoryBatch);
}

/// No-op trajectory sink.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl TrajectoryRecorder for NullRecorder {
    fn on_tick(&mut self, _batch: &TrajectoryBatch) {}
}

/// Aggregate statistics for one completed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    /// Simulated time after the tick completed.
    pub time: f32,
    pub agent_count: usize,
    /// Agents retired at their goal during this tick.
    pub arrivals: usize,
    pub mean_density: f32,
    pub max_speed: f32,
}

/// Grid of per-cell agent counts over unit cells, for heatmap export.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    pub width: usize,
    pub height: usize,
    pub counts: Vec<u32>,
}

impl OccupancyGrid {
    /// Count at cell `(x, y)`, or zero outside the grid.
    #[must_use]
    pub fn count(&self, x: usize, y: usize) -> u32 {
        if x < self.width && y < self.height {
            self.counts[y * self.width + x]
        } else {
            0
        }
    }
}

/// Column-oriented storage for live agents; one row per agent, dense and
/// swap-removable. All vectors share the same length.
#[derive(Debug, Default)]
struct AgentColumns {
    positions: Vec<Vec2>,
    velocities: Vec<Vec2>,
    /// Leapfrog's unshifted velocity; for RK4 the velocity at tick start.
    original_velocities: Vec<Vec2>,
    accelerations: Vec<Vec2>,
    next_accelerations: Vec<Vec2>,
    contact_forces: Vec<Vec2>,
    next_contact_forces: Vec<Vec2>,
    preferred_velocities: Vec<Vec2>,
    viewing_directions: Vec<Vec2>,
    goals: Vec<Vec2>,
    radii: Vec<f32>,
    masses: Vec<f32>,
    preferred_speeds: Vec<f32>,
    max_speeds: Vec<f32>,
    max_accelerations: Vec<f32>,
    colors: Vec<[u8; 3]>,
    remove_at_goal: Vec<bool>,
    policies: Vec<PolicyKey>,
    /// Index of the agent's active navigation map, when one is assigned.
    nav_maps: Vec<Option<usize>>,
    sph: Vec<SphState>,
}

impl AgentColumns {
    fn len(&self) -> usize {
        self.positions.len()
    }

    fn push(&mut self, seed: &AgentSeed, policy: PolicyKey, nav_map: Option<usize>) {
        self.positions.push(seed.position);
        self.velocities.push(seed.velocity);
        self.original_velocities.push(seed.velocity);
        self.accelerations.push(Vec2::ZERO);
        self.next_accelerations.push(Vec2::ZERO);
        self.contact_forces.push(Vec2::ZERO);
        self.next_contact_forces.push(Vec2::ZERO);
        self.preferred_velocities.push(Vec2::ZERO);
        self.viewing_directions
            .push((seed.goal - seed.position).normalized_or_zero());
        self.goals.push(seed.goal);
        self.radii.push(seed.radius);
        self.masses.push(seed.mass());
        self.preferred_speeds.push(seed.preferred_speed);
        self.max_speeds.push(seed.max_speed);
        self.max_accelerations.push(seed.max_acceleration);
        self.colors.push(seed.color);
        self.remove_at_goal.push(seed.remove_at_goal);
        self.policies.push(policy);
        self.nav_maps.push(nav_map);
        self.sph.push(SphState::default());
    }

    fn swap_remove(&mut self, row: usize) {
        self.positions.swap_remove(row);
        self.velocities.swap_remove(row);
        self.original_velocities.swap_remove(row);
        self.accelerations.swap_remove(row);
        self.next_accelerations.swap_remove(row);
        self.contact_forces.swap_remove(row);
        self.next_contact_forces.swap_remove(row);
        self.preferred_velocities.swap_remove(row);
        self.viewing_directions.swap_remove(row);
        self.goals.swap_remove(row);
        self.radii.swap_remove(row);
        self.masses.swap_remove(row);
        self.preferred_speeds.swap_remove(row);
        self.max_speeds.swap_remove(row);
        self.max_accelerations.swap_remove(row);
        self.colors.swap_remove(row);
        self.remove_at_goal.swap_remove(row);
        self.policies.swap_remove(row);
        self.nav_maps.swap_remove(row);
        self.sph.swap_remove(row);
    }
}

/// Dense agent array plus an id-to-row map, supporting O(1) swap-removal
/// while keeping iteration cache-friendly.
#[derive(Debug, Default)]
struct AgentArena {
    rows: HashMap<AgentId, usize>,
    ids: Vec<AgentId>,
    columns: AgentColumns,
    next_id: u64,
}

impl AgentArena {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn index_of(&self, id: AgentId) -> Option<usize> {
        self.rows.get(&id).copied()
    }

    fn contains(&self, id: AgentId) -> bool {
        self.rows.contains_key(&id)
    }

    /// Resolve a requested id against live and reserved ids, falling back to
    /// the allocation counter, which is bumped past any granted id.
    fn claim_id(&mut self, desired: Option<AgentId>, reserved: &HashSet<AgentId>) -> AgentId {
        let id = match desired {
            Some(id) if !self.rows.contains_key(&id) && !reserved.contains(&id) => id,
            _ => AgentId(self.next_id),
        };
        self.next_id = self.next_id.max(id.0 + 1);
        id
    }

    fn insert(&mut self, id: AgentId, seed: &AgentSeed, policy: PolicyKey, nav_map: Option<usize>) {
        let row = self.columns.len();
        self.columns.push(seed, policy, nav_map);
        self.ids.push(id);
        self.rows.insert(id, row);
    }

    /// Swap-remove the agent at `row`, fixing up the id of the agent that
    /// takes its place. Returns the removed id.
    fn swap_remove_row(&mut self, row: usize) -> AgentId {
        let id = self.ids.swap_remove(row);
        self.columns.swap_remove(row);
        self.rows.remove(&id);
        if row < self.ids.len() {
            let moved = self.ids[row];
            if let Some(slot) = self.rows.get_mut(&moved) {
                *slot = row;
            }
        }
        id
    }
}

/// Agent queued for insertion at a future simulation time.
#[derive(Debug, Clone)]
struct PendingAgent {
    start_time: OrderedFloat<f32>,
    id: AgentId,
    seed: AgentSeed,
    policy: PolicyKey,
}

impl PartialEq for PendingAgent {
    fn eq(&self, other: &Self) -> bool {
        self.start_time == other.start_time && self.id == other.id
    }
}

impl Eq for PendingAgent {}

impl PartialOrd for PendingAgent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingAgent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_time
            .cmp(&other.start_time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Ephemeral neighbor reference produced by a spatial query. The position
/// carries the periodic image offset; scalar state is read live from the
/// referenced agent's row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhantomNeighbor {
    pub id: AgentId,
    /// Periodic image offset; zero in unbounded worlds.
    pub offset: Vec2,
    /// Offset-corrected position of the neighbor.
    pub position: Vec2,
    /// Squared distance from the querying agent to `position`.
    pub distance_sq: f32,
}

/// Per-agent cache of nearby agents and obstacle edges. Fully repopulated at
/// coarse boundaries; phantom positions are cheaply refreshed in between.
#[derive(Debug, Clone, Default)]
struct NeighborCache {
    agents: Vec<PhantomNeighbor>,
    /// Indices into the world obstacle edge list.
    obstacles: SmallVec<[usize; 8]>,
    /// Interaction range the cache was built with.
    range: f32,
}

/// Zero-order smoothing kernel with unit support, used for mass accumulation.
#[must_use]
pub fn poly6_kernel(offset: Vec2) -> f32 {
    let r = offset.length();
    if r < 1.0 {
        4.0 * (1.0 - r * r).powi(3) / std::f32::consts::PI
    } else {
        0.0
    }
}

/// Gradient of the spiky kernel with unit support, used for pressure forces.
/// Zero at the origin; self-interaction is excluded by callers.
#[must_use]
pub fn spiky_gradient(offset: Vec2) -> Vec2 {
    let r = offset.length();
    if r > 0.0 && r < 1.0 {
        offset * (-30.0 * (1.0 - r).powi(2) / (std::f32::consts::PI * r))
    } else {
        Vec2::ZERO
    }
}

/// Laplacian-style kernel with unit support, used for viscosity.
#[must_use]
pub fn viscosity_kernel(offset: Vec2) -> f32 {
    let r = offset.length();
    if r < 1.0 {
        360.0 * (1.0 - r) / (29.0 * std::f32::consts::PI)
    } else {
        0.0
    }
}

/// Representative point of an obstacle edge for kernel evaluation: halfway
/// between the nearest point and the unit direction toward it.
#[must_use]
pub fn representative_point(position: Vec2, nearest: Vec2) -> Vec2 {
    ((nearest - position).normalized_or_zero() + nearest) * 0.5
}

/// Area of the part of an obstacle edge's half-plane visible within the unit
/// circle around `position`, via circle-segment intersection and a
/// sector-minus-triangle computation. Tangent or disjoint edges yield zero,
/// as do small negative results from floating-point cancellation.
#[must_use]
pub fn visible_obstacle_area(position: Vec2, segment: &LineSegment) -> f32 {
    let span = segment.end - segment.start;
    let rel = segment.start - position;
    let a = span.length_sq();
    let b = 2.0 * rel.dot(span);
    let c = rel.length_sq() - 1.0;
    let det = b * b - 4.0 * a * c;
    if det <= 0.0 {
        return 0.0;
    }
    let root = det.sqrt();
    let t1 = (-b - root) / (2.0 * a);
    let t2 = (-b + root) / (2.0 * a);
    let first = if (segment.start - position).length() < 1.0 {
        segment.start
    } else {
        segment.start + span * t1
    };
    let second = if (segment.end - position).length() <= 1.0 {
        segment.end
    } else {
        segment.start + span * t2
    };
    let sector = angle_between(first - position, second - position) / 2.0;
    let triangle = 0.5
        * (position.x * (first.y - second.y)
            + first.x * (second.y - position.y)
            + second.x * (position.y - first.y));
    let area = sector - triangle;
    if area < 0.0 { 0.0 } else { area }
}

/// Maps a local density to a blue-through-red visualization color.
#[must_use]
pub fn density_color(density: f32) -> [u8; 3] {
    let ratio = (density / COLOR_DENSITY_LIMIT).clamp(0.0, 1.0);
    let slider = |low: f32| (ratio - low) / 0.1;
    if ratio <= 0.1 {
        [0, 0, 255]
    } else if ratio <= 0.2 {
        [0, (128.0 * slider(0.1)) as u8, 255]
    } else if ratio <= 0.3 {
        [0, (128.0 + 127.0 * slider(0.2)) as u8, 255]
    } else if ratio <= 0.4 {
        [0, 255, (255.0 - 127.0 * slider(0.3)) as u8]
    } else if ratio <= 0.5 {
        [0, 255, (128.0 - 128.0 * slider(0.4)) as u8]
    } else if ratio <= 0.6 {
        [(255.0 * slider(0.5)) as u8, 255, 0]
    } else if ratio <= 0.7 {
        [255, (255.0 - 127.0 * slider(0.6)) as u8, 0]
    } else if ratio <= 0.8 {
        [255, (128.0 - 128.0 * slider(0.7)) as u8, 0]
    } else if ratio <= 0.9 {
        [(255.0 - 127.0 * slider(0.8)) as u8, 0, 0]
    } else if ratio <= 1.0 {
        [(128.0 - 64.0 * slider(0.9)) as u8, 0, 0]
    } else {
        [64, 0, 0]
    }
}

/// Short-circuits the fluid acceleration to zero at exactly zero density.
fn sph_acceleration_term(pressure_force: Vec2, viscosity_force: Vec2, density: f32) -> Vec2 {
    if density == 0.0 {
        Vec2::ZERO
    } else {
        (-pressure_force + viscosity_force) / density
    }
}

/// One map's congestion statistics for a slice of agents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavTally {
    /// Agent count weighted by heading alignment with the map goal.
    pub weighted_count: f32,
    /// Accumulated local density.
    pub congestion: f32,
    /// Raw agent count.
    pub agent_count: u32,
    /// Accumulated speeds.
    pub speed: f32,
}

impl NavTally {
    pub const ZERO: Self = Self {
        weighted_count: 0.0,
        congestion: 0.0,
        agent_count: 0,
        speed: 0.0,
    };

    /// Baseline the collated statistics are applied on top of each tick.
    pub const SEED: Self = Self {
        weighted_count: 1.0,
        congestion: 1.0,
        agent_count: 1,
        speed: 1.4,
    };

    pub fn merge(&mut self, other: Self) {
        self.weighted_count += other.weighted_count;
        self.congestion += other.congestion;
        self.agent_count += other.agent_count;
        self.speed += other.speed;
    }
}

/// Contention-free congestion accumulator: one tally slot per worker,
/// merged and reset by a single-threaded collation.
#[derive(Debug, Clone)]
pub struct NavAccumulator {
    slots: Vec<NavTally>,
}

impl NavAccumulator {
    #[must_use]
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![NavTally::ZERO; slots.max(1)],
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Merge a partial tally into one slot. Slot indices wrap.
    pub fn record(&mut self, slot: usize, tally: NavTally) {
        let len = self.slots.len();
        self.slots[slot % len].merge(tally);
    }

    /// Sum every slot, resetting each to zero.
    pub fn collate(&mut self) -> NavTally {
        let mut total = NavTally::ZERO;
        for slot in &mut self.slots {
            total.merge(*slot);
            *slot = NavTally::ZERO;
        }
        total
    }
}

/// Per-goal grid of direction and distance fields over unit cells, with a
/// congestion-derived distance multiplier smoothed across ticks.
#[derive(Debug, Clone)]
pub struct DynamicNavigationMap {
    goal: Vec2,
    width: usize,
    height: usize,
    directions: Vec<Vec2>,
    distances: Vec<f32>,
    multiplier: f32,
    accumulator: NavAccumulator,
}

impl DynamicNavigationMap {
    /// Build a map from explicit direction and distance fields, both laid out
    /// row-major over `width * height` unit cells.
    pub fn from_fields(
        goal: Vec2,
        width: usize,
        height: usize,
        directions: Vec<Vec2>,
        distances: Vec<f32>,
    ) -> Result<Self, WorldError> {
        let cells = width * height;
        if cells == 0 {
            return Err(WorldError::InvalidConfig(
                "navigation map dimensions must be positive",
            ));
        }
        if directions.len() != cells || distances.len() != cells {
            return Err(WorldError::InvalidConfig(
                "navigation map fields must cover width * height cells",
            ));
        }
        Ok(Self {
            goal,
            width,
            height,
            directions,
            distances,
            multiplier: 1.0,
            accumulator: NavAccumulator::new(rayon::current_num_threads()),
        })
    }

    /// Convenience map whose every cell points straight at the goal, with
    /// Euclidean distances measured from cell centers.
    pub fn uniform(goal: Vec2, width: usize, height: usize) -> Result<Self, WorldError> {
        let mut directions = Vec::with_capacity(width * height);
        let mut distances = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let center = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                directions.push((goal - center).normalized_or_zero());
                distances.push((goal - center).length());
            }
        }
        Self::from_fields(goal, width, height, directions, distances)
    }

    #[must_use]
    pub fn goal(&self) -> Vec2 {
        self.goal
    }

    #[must_use]
    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    fn cell_index(&self, position: Vec2) -> Option<usize> {
        let x = position.x.floor();
        let y = position.y.floor();
        if x >= 0.0 && y >= 0.0 && (x as usize) < self.width && (y as usize) < self.height {
            Some(y as usize * self.width + x as usize)
        } else {
            None
        }
    }

    /// Direction field at `position`, or `None` outside the grid.
    #[must_use]
    pub fn direction_at(&self, position: Vec2) -> Option<Vec2> {
        self.cell_index(position).map(|cell| self.directions[cell])
    }

    /// Congestion-adjusted distance to the goal from `position`. Outside the
    /// grid this falls back to the straight-line distance.
    #[must_use]
    pub fn congested_distance(&self, position: Vec2) -> f32 {
        let base = match self.cell_index(position) {
            Some(cell) => self.distances[cell],
            None => (self.goal - position).length(),
        };
        base * self.multiplier
    }

    /// Merge a partial tally into one accumulator slot.
    pub fn record(&mut self, slot: usize, tally: NavTally) {
        self.accumulator.record(slot, tally);
    }

    /// Collate accumulator slots on top of the seed values and fold the
    /// result into the smoothed distance multiplier.
    pub fn finish_tick(&mut self, ratio: f32) {
        let mut totals = NavTally::SEED;
        totals.merge(self.accumulator.collate());
        self.multiplier =
            (1.0 - ratio) * self.multiplier + ratio * (totals.agent_count as f32 / totals.speed);
    }
}

/// Converts a congestion value into a distance multiplier.
#[must_use]
pub fn multiplier_from_congestion(congestion: f32) -> f32 {
    if congestion <= 1.0 {
        1.0
    } else if congestion <= 2.0 {
        1.0 + (congestion - 1.0) * 0.75
    } else if congestion <= 3.0 {
        1.75 + (congestion - 2.0) * 0.55
    } else if congestion <= 4.0 {
        2.3 + (congestion - 3.0) * 0.5
    } else if congestion <= 5.0 {
        2.8 + (congestion - 4.0) * 0.4
    } else if congestion <= 6.0 {
        3.2 + (congestion - 5.0) * 0.3
    } else {
        7.0
    }
}

/// Converts a local density into a comfortable walking speed.
#[must_use]
pub fn walking_speed_from_density(density: f32) -> f32 {
    if density <= 1.0 {
        1.4
    } else if density <= 2.0 {
        1.4 - (density - 1.0) * 0.6
    } else if density <= 3.0 {
        0.8 - (density - 2.0) * 0.2
    } else if density <= 4.0 {
        0.6 - (density - 3.0) * 0.1
    } else if density <= 5.0 {
        0.5 - (density - 4.0) * 0.1
    } else if density <= 6.0 {
        0.4 - (density - 5.0) * 0.05
    } else {
        0.2
    }
}

/// Rescales a preferred velocity by a density-derived walking-speed factor.
#[must_use]
pub fn preferred_velocity_from_density(velocity: Vec2, density: f32) -> Vec2 {
    let scale = (density / REFERENCE_RADIUS / 1.72 * 0.3).powi(2).max(0.0);
    velocity * scale / 1.4
}

/// Neighbors visible to a policy, resolved live against agent rows so that
/// velocities reflect the current column values.
#[derive(Clone, Copy)]
pub struct Neighborhood<'a> {
    phantoms: &'a [PhantomNeighbor],
    rows: &'a HashMap<AgentId, usize>,
    velocities: &'a [Vec2],
    radii: &'a [f32],
}

/// Resolved neighbor with an offset-corrected position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborRef {
    pub id: AgentId,
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    pub distance_sq: f32,
}

impl<'a> Neighborhood<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.phantoms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phantoms.is_empty()
    }

    /// Iterate over cached neighbors, skipping any whose agent has since
    /// been removed from the world.
    pub fn iter(&self) -> impl Iterator<Item = NeighborRef> + 'a {
        let rows = self.rows;
        let velocities = self.velocities;
        let radii = self.radii;
        self.phantoms.iter().filter_map(move |phantom| {
            let row = *rows.get(&phantom.id)?;
            Some(NeighborRef {
                id: phantom.id,
                position: phantom.position,
                velocity: velocities[row],
                radius: radii[row],
                distance_sq: phantom.distance_sq,
            })
        })
    }
}

/// Obstacle edges within a policy's interaction range.
#[derive(Clone, Copy)]
pub struct ObstacleNeighbors<'a> {
    indices: &'a [usize],
    edges: &'a [LineSegment],
}

impl<'a> ObstacleNeighbors<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a LineSegment> + 'a {
        let edges = self.edges;
        self.indices.iter().filter_map(move |&index| edges.get(index))
    }
}

/// Everything a navigation policy may read about one agent. The velocity is
/// supplied by the caller so integrators can evaluate at staged velocities.
pub struct PolicyView<'a> {
    pub position: Vec2,
    pub velocity: Vec2,
    pub preferred_velocity: Vec2,
    pub goal: Vec2,
    pub radius: f32,
    pub mass: f32,
    pub max_acceleration: f32,
    pub delta_time: f32,
    pub neighbors: Neighborhood<'a>,
    pub obstacles: ObstacleNeighbors<'a>,
}

/// Local navigation behaviour attached to agents.
pub trait NavigationPolicy: Send + Sync {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Radius within which neighbors are cached for this policy's agents.
    fn interaction_range(&self) -> f32;

    /// When true, the steering acceleration is assumed fixed for a whole
    /// coarse tick and is not recomputed on intermediate fine ticks.
    fn coarse_only(&self) -> bool {
        false
    }

    /// Steering acceleration, evaluated at the view's velocity.
    fn acceleration(&self, view: &PolicyView<'_>) -> Vec2;

    /// Short-range contact force from touching neighbors and obstacles.
    fn contact_force(&self, view: &PolicyView<'_>) -> Vec2;
}

/// Relaxation-based policy steering toward the preferred velocity, with a
/// linear penetration spring for contacts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalReachingPolicy {
    /// Time over which the velocity relaxes toward the preferred velocity.
    pub relaxation_time: f32,
    /// Spring constant applied per meter of overlap.
    pub contact_stiffness: f32,
    /// Neighbor search radius.
    pub interaction_range: f32,
    /// Hold the steering acceleration fixed between coarse boundaries.
    pub coarse_only: bool,
}

impl Default for GoalReachingPolicy {
    fn default() -> Self {
        Self {
            relaxation_time: 0.5,
            contact_stiffness: 250.0,
            interaction_range: 5.0,
            coarse_only: false,
        }
    }
}

impl NavigationPolicy for GoalReachingPolicy {
    fn name(&self) -> &str {
        "goal-reaching"
    }

    fn interaction_range(&self) -> f32 {
        self.interaction_range
    }

    fn coarse_only(&self) -> bool {
        self.coarse_only
    }

    fn acceleration(&self, view: &PolicyView<'_>) -> Vec2 {
        ((view.preferred_velocity - view.velocity) / self.relaxation_time)
            .clamped(view.max_acceleration)
    }

    fn contact_force(&self, view: &PolicyView<'_>) -> Vec2 {
        let mut force = Vec2::ZERO;
        for neighbor in view.neighbors.iter() {
            let overlap = view.radius + neighbor.radius - neighbor.distance_sq.sqrt();
            if overlap > 0.0 {
                let away = (view.position - neighbor.position).normalized_or_zero();
                force += away * (self.contact_stiffness * overlap);
            }
        }
        for edge in view.obstacles.iter() {
            let nearest = edge.nearest_point(view.position);
            let offset = view.position - nearest;
            let overlap = view.radius - offset.length();
            if overlap > 0.0 {
                force += offset.normalized_or_zero() * (self.contact_stiffness * overlap);
            }
        }
        force
    }
}

/// Policies registered with a world, addressed by stable keys.
#[derive(Default)]
pub struct PolicyRegistry {
    entries: SlotMap<PolicyKey, Box<dyn NavigationPolicy>>,
}

impl PolicyRegistry {
    pub fn register(&mut self, policy: Box<dyn NavigationPolicy>) -> PolicyKey {
        self.entries.insert(policy)
    }

    #[must_use]
    pub fn get(&self, key: PolicyKey) -> Option<&dyn NavigationPolicy> {
        self.entries.get(key).map(Box::as_ref)
    }

    #[must_use]
    pub fn contains(&self, key: PolicyKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.entries.values().map(|policy| policy.name()).collect();
        f.debug_struct("PolicyRegistry")
            .field("policies", &names)
            .finish()
    }
}

/// Goal-reaching acceleration shared by the blended force composition.
fn goal_reach_acceleration(preferred: Vec2, velocity: Vec2, delta_time: f32, mass: f32) -> Vec2 {
    (preferred - velocity) / delta_time.max(GOAL_REACH_RELAXATION) / mass
}

/// Blend factor between steering and goal-reaching + fluid acceleration.
/// Callers branch on the density band first; the result is unclamped.
fn blend_factor(density: f32) -> f32 {
    (density - BLEND_LOW_DENSITY) / (BLEND_HIGH_DENSITY - BLEND_LOW_DENSITY)
}

/// Force composition shared by every integration scheme.
fn compose_row(
    config: &ThrongConfig,
    columns: &AgentColumns,
    row: usize,
    velocity: Vec2,
    goal_delta_time: f32,
) -> Vec2 {
    let steering = columns.next_accelerations[row];
    if !config.sph.enabled {
        return steering;
    }
    let sph = columns.sph[row];
    if !config.sph.density_blending {
        return steering + sph.acceleration;
    }
    if sph.density < BLEND_LOW_DENSITY {
        return steering;
    }
    let goal_reach = goal_reach_acceleration(
        columns.preferred_velocities[row],
        velocity,
        goal_delta_time,
        columns.masses[row],
    );
    if sph.density > BLEND_HIGH_DENSITY {
        return goal_reach + sph.acceleration;
    }
    let kappa = blend_factor(sph.density);
    steering * (1.0 - kappa) + (goal_reach + sph.acceleration) * kappa
}

/// Post-integration viewing-direction update: turn toward a mix of the
/// actual and preferred motion unless the mix is too small to be meaningful.
fn turn_towards_motion(columns: &mut AgentColumns, row: usize) {
    let direction = (columns.velocities[row] * 2.0 + columns.preferred_velocities[row]) / 3.0;
    if direction.length_sq() > VIEW_TURN_THRESHOLD {
        columns.viewing_directions[row] = direction.normalized_or_zero();
    }
}

/// Velocity/position update strategy chosen once at configuration time.
trait Integrator: Send + Sync {
    fn name(&self) -> &'static str;
    fn advance(&self, world: &mut WorldState);
}

struct EulerIntegrator;
struct RungeKutta4Integrator;
struct VerletIntegrator;
struct LeapfrogIntegrator;

static EULER_INTEGRATOR: EulerIntegrator = EulerIntegrator;
static RUNGE_KUTTA_4_INTEGRATOR: RungeKutta4Integrator = RungeKutta4Integrator;
static VERLET_INTEGRATOR: VerletIntegrator = VerletIntegrator;
static LEAPFROG_INTEGRATOR: LeapfrogIntegrator = LeapfrogIntegrator;

fn integrator_for(scheme: IntegrationScheme) -> &'static dyn Integrator {
    match scheme {
        IntegrationScheme::Euler => &EULER_INTEGRATOR,
        IntegrationScheme::RungeKutta4 => &RUNGE_KUTTA_4_INTEGRATOR,
        IntegrationScheme::Verlet => &VERLET_INTEGRATOR,
        IntegrationScheme::Leapfrog => &LEAPFROG_INTEGRATOR,
    }
}

impl Integrator for EulerIntegrator {
    fn name(&self) -> &'static str {
        "euler"
    }

    fn advance(&self, world: &mut WorldState) {
        let dt = world.config.fine_delta_time;
        let topology = world.config.topology;
        let accelerations = world.composed_accelerations();
        let columns = &mut world.agents.columns;
        for (row, accel) in accelerations.into_iter().enumerate() {
            columns.contact_forces[row] = columns.next_contact_forces[row];
            let velocity =
                (columns.velocities[row] + accel * dt).clamped(columns.max_speeds[row]);
            columns.velocities[row] = velocity;
            columns.positions[row] = topology.wrap(columns.positions[row] + velocity * dt);
            columns.accelerations[row] = accel;
            turn_towards_motion(columns, row);
        }
    }
}

impl Integrator for VerletIntegrator {
    fn name(&self) -> &'static str {
        "verlet"
    }

    fn advance(&self, world: &mut WorldState) {
        let dt = world.config.fine_delta_time;
        let topology = world.config.topology;

        // Half kick, then a full drift at the half-kicked velocity.
        let first = world.composed_accelerations();
        {
            let columns = &mut world.agents.columns;
            for (row, accel) in first.into_iter().enumerate() {
                columns.contact_forces[row] = columns.next_contact_forces[row];
                let velocity = (columns.velocities[row] + accel * (0.5 * dt))
                    .clamped(columns.max_speeds[row]);
                columns.velocities[row] = velocity;
                columns.positions[row] = topology.wrap(columns.positions[row] + velocity * dt);
                columns.accelerations[row] = accel;
            }
        }

        // Re-derive forces at the new positions for the second half kick.
        if world.config.sph.enabled {
            world.stage_density_base();
            world.stage_density_derived();
        }
        world.stage_preferred_velocity();
        world.stage_steering();
        world.stage_contact();

        let second = world.composed_accelerations();
        let columns = &mut world.agents.columns;
        for (row, accel) in second.into_iter().enumerate() {
            columns.contact_forces[row] = columns.next_contact_forces[row];
            columns.velocities[row] = (columns.velocities[row] + accel * (0.5 * dt))
                .clamped(columns.max_speeds[row]);
            columns.accelerations[row] = accel;
            turn_towards_motion(columns, row);
        }
    }
}

impl Integrator for LeapfrogIntegrator {
    fn name(&self) -> &'static str {
        "leapfrog"
    }

    fn advance(&self, world: &mut WorldState) {
        let dt = world.config.fine_delta_time;
        let topology = world.config.topology;
        // The half-step offset is seeded once, on the world's first tick.
        let first_tick = world.time == 0.0;
        let accelerations = world.composed_accelerations();
        let columns = &mut world.agents.columns;
        for (row, accel) in accelerations.into_iter().enumerate() {
            columns.contact_forces[row] = columns.next_contact_forces[row];
            let max_speed = columns.max_speeds[row];
            let velocity = (columns.original_velocities[row] + accel * dt).clamped(max_speed);
            columns.original_velocities[row] = if first_tick {
                (columns.original_velocities[row] + accel * (0.5 * dt)).clamped(max_speed)
            } else {
                velocity
            };
            columns.velocities[row] = velocity;
            columns.positions[row] = topology.wrap(columns.positions[row] + velocity * dt);
            columns.accelerations[row] = accel;
            turn_towards_motion(columns, row);
        }
    }
}

/// Per-agent output of the RK4 staging pass.
struct RkPlan {
    velocity: Vec2,
    position: Vec2,
    acceleration: Vec2,
    pending: Vec2,
    tick_start_velocity: Vec2,
}

impl Integrator for RungeKutta4Integrator {
    fn name(&self) -> &'static str {
        "runge_kutta_4"
    }

    fn advance(&self, world: &mut WorldState) {
        let dt = world.config.fine_delta_time;
        let topology = world.config.topology;
        let mid_window = world.elapsed_in_coarse != 0.0;
        let config = &world.config;
        let policies = &world.policies;
        let ctx = world.context();
        let columns = ctx.columns;

        let plans: Vec<RkPlan> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let policy = policies.get(columns.policies[row]);
                let coarse_only = policy.is_some_and(NavigationPolicy::coarse_only);
                let frozen = coarse_only && mid_window;
                let view_dt = if coarse_only {
                    config.coarse_delta_time
                } else {
                    config.fine_delta_time
                };
                let sph = columns.sph[row];
                let mass = columns.masses[row];
                let preferred = columns.preferred_velocities[row];
                let start = columns.velocities[row];
                let fluid_sixth = sph.acceleration / 6.0;

                // Which terms feed each stage, and whether the steering
                // policy is re-invoked at staged velocities in between.
                let (reinvoke, steering_weight, fluid_weight) = if !config.sph.enabled {
                    (true, 1.0, 0.0)
                } else if !config.sph.density_blending {
                    (true, 1.0, 1.0)
                } else if sph.density < BLEND_LOW_DENSITY {
                    (true, 1.0, 0.0)
                } else if sph.density > BLEND_HIGH_DENSITY {
                    (false, 0.0, 1.0)
                } else {
                    let kappa = blend_factor(sph.density);
                    (true, 1.0 - kappa, kappa)
                };

                let term = |pending: Vec2, velocity: Vec2| -> Vec2 {
                    let mut k = pending * steering_weight;
                    if fluid_weight > 0.0 {
                        k += (goal_reach_acceleration(preferred, velocity, dt, mass)
                            + fluid_sixth)
                            * fluid_weight;
                    }
                    k
                };

                let mut pending = columns.next_accelerations[row];
                let k1 = term(pending, start);
                let mut staged = start + k1 * (dt * 0.5);
                if reinvoke && !frozen {
                    if let Some(policy) = policy {
                        pending = policy.acceleration(&ctx.view(row, staged, view_dt));
                    }
                }
                let k2 = term(pending, staged);
                staged = start + k2 * (dt * 0.5);
                if reinvoke && !frozen {
                    if let Some(policy) = policy {
                        pending = policy.acceleration(&ctx.view(row, staged, view_dt));
                    }
                }
                let k3 = term(pending, staged);
                staged = start + k3 * dt;
                if reinvoke && !frozen {
                    if let Some(policy) = policy {
                        pending = policy.acceleration(&ctx.view(row, staged, view_dt));
                    }
                }
                let k4 = term(pending, staged);

                let mut acceleration = (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0;
                acceleration += columns.next_contact_forces[row] / mass;
                let velocity =
                    (start + acceleration * dt).clamped(columns.max_speeds[row]);
                RkPlan {
                    velocity,
                    position: columns.positions[row] + velocity * dt,
                    acceleration,
                    pending,
                    tick_start_velocity: start,
                }
            })
            .collect();

        let columns = &mut world.agents.columns;
        for (row, plan) in plans.into_iter().enumerate() {
            columns.contact_forces[row] = columns.next_contact_forces[row];
            columns.velocities[row] = plan.velocity;
            columns.original_velocities[row] = plan.tick_start_velocity;
            columns.positions[row] = topology.wrap(plan.position);
            columns.accelerations[row] = plan.acceleration;
            columns.next_accelerations[row] = plan.pending;
            turn_towards_motion(columns, row);
        }
    }
}

/// Tick length used when a policy evaluates its view: coarse-only policies
/// see the coarse tick length, everyone else the fine one.
fn policy_delta_time(config: &ThrongConfig, policy: &dyn NavigationPolicy) -> f32 {
    if policy.coarse_only() {
        config.coarse_delta_time
    } else {
        config.fine_delta_time
    }
}

/// Read-only bundle of the borrows a policy view needs, shared by the
/// steering, contact, and RK4 staging phases.
#[derive(Clone, Copy)]
struct StepContext<'a> {
    columns: &'a AgentColumns,
    caches: &'a [NeighborCache],
    rows: &'a HashMap<AgentId, usize>,
    edges: &'a [LineSegment],
}

impl<'a> StepContext<'a> {
    fn view(&self, row: usize, velocity: Vec2, delta_time: f32) -> PolicyView<'a> {
        let cache = &self.caches[row];
        PolicyView {
            position: self.columns.positions[row],
            velocity,
            preferred_velocity: self.columns.preferred_velocities[row],
            goal: self.columns.goals[row],
            radius: self.columns.radii[row],
            mass: self.columns.masses[row],
            max_acceleration: self.columns.max_accelerations[row],
            delta_time,
            neighbors: Neighborhood {
                phantoms: &cache.agents,
                rows: self.rows,
                velocities: &self.columns.velocities,
                radii: &self.columns.radii,
            },
            obstacles: ObstacleNeighbors {
                indices: &cache.obstacles,
                edges: self.edges,
            },
        }
    }
}

/// The simulation world: agents, obstacles, navigation maps, and the
/// per-tick stepping machinery.
///
/// Each call to [`WorldState::step`] advances simulated time by one fine
/// tick, running the phase sequence described on that method. Coarse ticks
/// group several fine ticks; the spatial index is rebuilt and neighbor
/// caches are repopulated only at coarse boundaries.
pub struct WorldState {
    config: ThrongConfig,
    time: f32,
    elapsed_in_coarse: f32,
    tick: Tick,
    agents: AgentArena,
    /// One cache per agent row, swap-removed in lockstep with the arena.
    caches: Vec<NeighborCache>,
    obstacles: Vec<LineSegment>,
    maps: Vec<DynamicNavigationMap>,
    index: UniformGridIndex,
    pending: BinaryHeap<Reverse<PendingAgent>>,
    /// Ids reserved by pending insertions, so they are not re-issued.
    pending_ids: HashSet<AgentId>,
    policies: PolicyRegistry,
    integrator: &'static dyn Integrator,
    recorder: Box<dyn TrajectoryRecorder>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("tick", &self.tick)
            .field("time", &self.time)
            .field("agents", &self.agents.len())
            .field("pending", &self.pending.len())
            .field("obstacles", &self.obstacles.len())
            .field("maps", &self.maps.len())
            .field("integrator", &self.integrator.name())
            .finish_non_exhaustive()
    }
}

impl WorldState {
    /// Create a world that discards trajectory batches.
    pub fn new(config: ThrongConfig) -> Result<Self, WorldError> {
        Self::with_recorder(config, Box::new(NullRecorder))
    }

    /// Create a world that forwards one trajectory batch per tick to
    /// `recorder`. The configuration is validated up front.
    pub fn with_recorder(
        config: ThrongConfig,
        recorder: Box<dyn TrajectoryRecorder>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let integrator = integrator_for(config.integration);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            time: 0.0,
            elapsed_in_coarse: 0.0,
            tick: Tick::zero(),
            agents: AgentArena::default(),
            caches: Vec::new(),
            obstacles: Vec::new(),
            maps: Vec::new(),
            index: UniformGridIndex::default(),
            pending: BinaryHeap::new(),
            pending_ids: HashSet::new(),
            policies: PolicyRegistry::default(),
            integrator,
            recorder,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ThrongConfig {
        &self.config
    }

    /// Simulated time elapsed so far.
    #[must_use]
    pub fn time(&self) -> f32 {
        self.time
    }

    #[must_use]
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Time elapsed inside the current coarse tick; zero exactly at coarse
    /// boundaries.
    #[must_use]
    pub fn elapsed_in_coarse(&self) -> f32 {
        self.elapsed_in_coarse
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn contains_agent(&self, id: AgentId) -> bool {
        self.agents.contains(id)
    }

    #[must_use]
    pub fn history(&self) -> &VecDeque<TickSummary> {
        &self.history
    }

    #[must_use]
    pub fn obstacle_edges(&self) -> &[LineSegment] {
        &self.obstacles
    }

    #[must_use]
    pub fn navigation_maps(&self) -> &[DynamicNavigationMap] {
        &self.maps
    }

    /// Register a navigation policy and return its key for agent insertion.
    pub fn register_policy(&mut self, policy: Box<dyn NavigationPolicy>) -> PolicyKey {
        self.policies.register(policy)
    }

    #[must_use]
    pub fn policy(&self, key: PolicyKey) -> Option<&dyn NavigationPolicy> {
        self.policies.get(key)
    }

    /// Insert an agent immediately. Returns the assigned id.
    pub fn add_agent(&mut self, seed: AgentSeed, policy: PolicyKey) -> Result<AgentId, WorldError> {
        self.schedule_agent(seed, policy, None, self.time)
    }

    /// Insert an agent now or at a future time. A desired id is honored
    /// unless a live or pending agent already holds it; the fallback id
    /// comes from a counter that never re-issues a smaller id.
    pub fn schedule_agent(
        &mut self,
        seed: AgentSeed,
        policy: PolicyKey,
        desired_id: Option<AgentId>,
        start_time: f32,
    ) -> Result<AgentId, WorldError> {
        if !self.policies.contains(policy) {
            return Err(WorldError::UnknownPolicy);
        }
        let id = self.agents.claim_id(desired_id, &self.pending_ids);
        if start_time <= self.time {
            self.activate(id, &seed, policy);
        } else {
            self.pending_ids.insert(id);
            self.pending.push(Reverse(PendingAgent {
                start_time: OrderedFloat(start_time),
                id,
                seed,
                policy,
            }));
        }
        Ok(id)
    }

    /// Remove a live agent, returning its final snapshot.
    pub fn remove_agent(&mut self, id: AgentId) -> Result<AgentSnapshot, WorldError> {
        let row = self
            .agents
            .index_of(id)
            .ok_or(WorldError::AgentNotFound(id))?;
        let snapshot = self.snapshot_row(row);
        self.agents.swap_remove_row(row);
        self.caches.swap_remove(row);
        Ok(snapshot)
    }

    /// Append an obstacle polyline; three or more points close into a
    /// polygon.
    pub fn add_obstacle(&mut self, points: &[Vec2]) -> Result<(), WorldError> {
        if points.len() < 2 {
            return Err(WorldError::InvalidConfig(
                "an obstacle needs at least two points",
            ));
        }
        for pair in points.windows(2) {
            self.obstacles.push(LineSegment::new(pair[0], pair[1]));
        }
        if points.len() > 2 {
            self.obstacles
                .push(LineSegment::new(points[points.len() - 1], points[0]));
        }
        Ok(())
    }

    /// Register a navigation map, returning its index.
    pub fn add_navigation_map(&mut self, map: DynamicNavigationMap) -> usize {
        self.maps.push(map);
        self.maps.len() - 1
    }

    /// Snapshot every live agent, in dense row order.
    #[must_use]
    pub fn agent_snapshots(&self) -> Vec<AgentSnapshot> {
        (0..self.agents.len())
            .map(|row| self.snapshot_row(row))
            .collect()
    }

    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentSnapshot> {
        self.agents.index_of(id).map(|row| self.snapshot_row(row))
    }

    #[must_use]
    pub fn agent_goal(&self, id: AgentId) -> Option<Vec2> {
        self.agents
            .index_of(id)
            .map(|row| self.agents.columns.goals[row])
    }

    /// Number of cached neighbors for an agent, as of the last rebuild or
    /// refresh.
    #[must_use]
    pub fn neighbor_count(&self, id: AgentId) -> Option<usize> {
        self.agents
            .index_of(id)
            .map(|row| self.caches[row].agents.len())
    }

    /// Per-cell agent counts over `width * height` unit cells anchored at
    /// the origin, for heatmap export.
    #[must_use]
    pub fn occupancy_counts(&self, width: usize, height: usize) -> OccupancyGrid {
        let mut counts = vec![0u32; width * height];
        for position in &self.agents.columns.positions {
            let x = position.x.floor();
            let y = position.y.floor();
            if x >= 0.0 && y >= 0.0 && (x as usize) < width && (y as usize) < height {
                counts[y as usize * width + x as usize] += 1;
            }
        }
        OccupancyGrid {
            width,
            height,
            counts,
        }
    }

    /// Advance the world by one fine tick.
    ///
    /// Phases, in order: pending-agent intake; neighbor maintenance (full
    /// index rebuild at coarse boundaries, cheap phantom refresh otherwise);
    /// the density model when SPH is enabled; preferred velocity; steering;
    /// contact forces; integration; congestion accumulation when dynamic
    /// navigation is fully enabled; time advance; goal retirement. Finally
    /// one trajectory batch is emitted and a summary is recorded.
    pub fn step(&mut self) -> Result<TickSummary, WorldError> {
        self.stage_intake();
        if self.elapsed_in_coarse == 0.0 {
            self.rebuild_neighborhoods()?;
        } else {
            self.refresh_phantoms();
        }
        if self.config.sph.enabled {
            self.stage_density_base();
            self.stage_density_derived();
        }
        self.stage_preferred_velocity();
        self.stage_steering();
        self.stage_contact();
        let integrator = self.integrator;
        integrator.advance(self);
        if self.config.navigation.congestion_active() && !self.maps.is_empty() {
            self.stage_congestion();
        }

        self.tick.advance();
        self.time += self.config.fine_delta_time;
        self.elapsed_in_coarse += self.config.fine_delta_time;
        if self.elapsed_in_coarse >= self.config.coarse_delta_time {
            self.elapsed_in_coarse = 0.0;
        }

        let arrivals = self.retire_arrived();
        let summary = self.summarize(arrivals);
        self.emit_batch();
        self.history.push_back(summary.clone());
        if self.history.len() > self.config.history_capacity {
            self.history.pop_front();
        }
        Ok(summary)
    }

    /// Advance the world by `ticks` fine ticks.
    pub fn step_many(&mut self, ticks: u64) -> Result<(), WorldError> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    fn context(&self) -> StepContext<'_> {
        StepContext {
            columns: &self.agents.columns,
            caches: &self.caches,
            rows: &self.agents.rows,
            edges: &self.obstacles,
        }
    }

    /// Composed acceleration for every agent at its current velocity,
    /// contact force included.
    fn composed_accelerations(&self) -> Vec<Vec2> {
        let config = &self.config;
        let policies = &self.policies;
        let columns = &self.agents.columns;
        (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let goal_dt = match policies.get(columns.policies[row]) {
                    Some(policy) => policy_delta_time(config, policy),
                    None => config.fine_delta_time,
                };
                compose_row(config, columns, row, columns.velocities[row], goal_dt)
                    + columns.next_contact_forces[row] / columns.masses[row]
            })
            .collect()
    }

    fn snapshot_row(&self, row: usize) -> AgentSnapshot {
        let columns = &self.agents.columns;
        AgentSnapshot {
            id: self.agents.ids[row],
            position: columns.positions[row],
            velocity: columns.velocities[row],
            viewing_direction: columns.viewing_directions[row],
            color: columns.colors[row],
            density: columns.sph[row].density,
        }
    }

    fn activate(&mut self, id: AgentId, seed: &AgentSeed, policy: PolicyKey) {
        let nav_map = self.nearest_map_by_goal(seed.goal);
        self.agents.insert(id, seed, policy, nav_map);
        self.caches.push(NeighborCache::default());
    }

    /// Map whose goal lies closest to `goal`, when global navigation is on.
    fn nearest_map_by_goal(&self, goal: Vec2) -> Option<usize> {
        if !self.config.navigation.global_navigation || self.maps.is_empty() {
            return None;
        }
        self.maps
            .iter()
            .enumerate()
            .min_by_key(|(_, map)| OrderedFloat(map.goal().distance_sq(goal)))
            .map(|(index, _)| index)
    }

    /// Pop every pending insertion whose start time has arrived.
    fn stage_intake(&mut self) {
        let now = OrderedFloat(self.time);
        while self
            .pending
            .peek()
            .is_some_and(|entry| entry.0.start_time <= now)
        {
            if let Some(Reverse(next)) = self.pending.pop() {
                self.pending_ids.remove(&next.id);
                self.activate(next.id, &next.seed, next.policy);
            }
        }
    }

    /// Coarse-boundary neighbor maintenance: rebuild the spatial index over
    /// all live agents and repopulate every cache with a fresh range query,
    /// including periodic images and nearby obstacle edges.
    fn rebuild_neighborhoods(&mut self) -> Result<(), WorldError> {
        let mut range: f32 = 1.0;
        for &key in &self.agents.columns.policies {
            if let Some(policy) = self.policies.get(key) {
                range = range.max(policy.interaction_range());
            }
        }
        self.index.cell_size = range;
        let points: Vec<(f32, f32)> = self
            .agents
            .columns
            .positions
            .iter()
            .map(|p| (p.x, p.y))
            .collect();
        self.index.rebuild(&points)?;

        let offsets = self.config.topology.image_offsets();
        let columns = &self.agents.columns;
        let ids = &self.agents.ids;
        let index = &self.index;
        let obstacles = &self.obstacles;
        let range_sq = range * range;
        self.caches
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, cache)| {
                cache.range = range;
                cache.agents.clear();
                let position = columns.positions[row];
                for (slot, &offset) in offsets.iter().enumerate() {
                    let center = position - offset;
                    // The zero offset is first; only there is the agent its
                    // own closest match and excluded.
                    let exclude = if slot == 0 { Some(row) } else { None };
                    index.visit_within(
                        (center.x, center.y),
                        range_sq,
                        exclude,
                        &mut |other, distance_sq| {
                            cache.agents.push(PhantomNeighbor {
                                id: ids[other],
                                offset,
                                position: columns.positions[other] + offset,
                                distance_sq: distance_sq.0,
                            });
                        },
                    );
                }
                cache
                    .agents
                    .sort_unstable_by_key(|phantom| (OrderedFloat(phantom.distance_sq), phantom.id));
                cache.obstacles.clear();
                for (edge_index, edge) in obstacles.iter().enumerate() {
                    if edge.distance_sq(position) <= range_sq {
                        cache.obstacles.push(edge_index);
                    }
                }
            });
        Ok(())
    }

    /// Mid-coarse neighbor maintenance: no new queries, just re-resolve each
    /// phantom by id, dropping the dead and refreshing positions and
    /// distances against the querying agent's current position.
    fn refresh_phantoms(&mut self) {
        let columns = &self.agents.columns;
        let rows = &self.agents.rows;
        self.caches
            .par_iter_mut()
            .enumerate()
            .for_each(|(row, cache)| {
                let position = columns.positions[row];
                cache.agents.retain_mut(|phantom| match rows.get(&phantom.id) {
                    Some(&other) => {
                        phantom.position = columns.positions[other] + phantom.offset;
                        phantom.distance_sq = position.distance_sq(phantom.position);
                        true
                    }
                    None => false,
                });
            });
    }

    /// First SPH pass: density, personal rest density, pressure, and the
    /// density-derived agent color.
    fn stage_density_base(&mut self) {
        let config = &self.config;
        let columns = &self.agents.columns;
        let caches = &self.caches;
        let rows = &self.agents.rows;
        let obstacles = &self.obstacles;
        let ratio = config.fine_delta_time / config.sph.density_time_window;
        let updates: Vec<(SphState, [u8; 3])> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let position = columns.positions[row];
                let mut agent_density = columns.masses[row] * poly6_kernel(Vec2::ZERO);
                for phantom in &caches[row].agents {
                    if let Some(&other) = rows.get(&phantom.id) {
                        agent_density +=
                            columns.masses[other] * poly6_kernel(position - phantom.position);
                    }
                }
                let color = density_color(agent_density);

                let mut state = columns.sph[row];
                let mut density = agent_density;
                for &edge_index in &caches[row].obstacles {
                    let edge = &obstacles[edge_index];
                    let nearest = edge.nearest_point(position);
                    if position.distance_sq(nearest) <= 1.0 {
                        let rep = representative_point(position, nearest);
                        density += state.rest_density
                            * visible_obstacle_area(position, edge)
                            * poly6_kernel(position - rep);
                    }
                }
                state.density = density;
                state.rest_density = ((1.0 - ratio) * state.rest_density + ratio * density)
                    .clamp(config.sph.min_rest_density, config.sph.max_rest_density);
                state.pressure = config.sph.gas_constant * (density - state.rest_density);
                (state, color)
            })
            .collect();
        let columns = &mut self.agents.columns;
        for (row, (state, color)) in updates.into_iter().enumerate() {
            columns.sph[row] = state;
            columns.colors[row] = color;
        }
    }

    /// Second SPH pass: pressure and viscosity forces plus the resulting
    /// acceleration. Reads every neighbor's density from the first pass.
    fn stage_density_derived(&mut self) {
        let config = &self.config;
        let columns = &self.agents.columns;
        let caches = &self.caches;
        let rows = &self.agents.rows;
        let obstacles = &self.obstacles;
        let updates: Vec<SphState> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let mut state = columns.sph[row];
                let position = columns.positions[row];

                // No repulsion below rest density.
                let mut pressure_force = Vec2::ZERO;
                if state.density >= state.rest_density {
                    for phantom in &caches[row].agents {
                        if let Some(&other) = rows.get(&phantom.id) {
                            let neighbor = columns.sph[other];
                            pressure_force += spiky_gradient(position - phantom.position)
                                * (columns.masses[other]
                                    * (state.pressure + neighbor.pressure)
                                    / (2.0 * neighbor.density));
                        }
                    }
                    for &edge_index in &caches[row].obstacles {
                        let edge = &obstacles[edge_index];
                        let nearest = edge.nearest_point(position);
                        let rep = representative_point(position, nearest);
                        pressure_force += spiky_gradient(position - rep)
                            * (state.pressure * visible_obstacle_area(position, edge));
                    }
                }
                state.pressure_force = pressure_force;

                // A zero viscosity constant leaves the stored force as-is.
                if config.sph.viscosity_constant != 0.0 {
                    let mut viscosity_force = Vec2::ZERO;
                    for phantom in &caches[row].agents {
                        if let Some(&other) = rows.get(&phantom.id) {
                            let neighbor = columns.sph[other];
                            viscosity_force += (columns.velocities[other]
                                - columns.velocities[row])
                                * (config.sph.viscosity_constant
                                    * columns.masses[other]
                                    * viscosity_kernel(position - phantom.position)
                                    / neighbor.density);
                        }
                    }
                    state.viscosity_force = viscosity_force;
                }

                state.acceleration = sph_acceleration_term(
                    state.pressure_force,
                    state.viscosity_force,
                    state.density,
                );
                state
            })
            .collect();
        let columns = &mut self.agents.columns;
        for (row, state) in updates.into_iter().enumerate() {
            columns.sph[row] = state;
        }
    }

    /// Preferred-velocity phase. With nearest-map selection active, each
    /// agent first adopts the map (and goal) minimizing congestion-adjusted
    /// distance from its position.
    fn stage_preferred_velocity(&mut self) {
        let config = &self.config;
        let columns = &self.agents.columns;
        let maps = &self.maps;
        let reselect = config.navigation.global_navigation
            && config.navigation.nearest_map_selection
            && !maps.is_empty();
        let updates: Vec<(Vec2, Option<usize>, Vec2)> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let position = columns.positions[row];
                let mut map_index = columns.nav_maps[row];
                let mut goal = columns.goals[row];
                if reselect {
                    let nearest = (0..maps.len()).min_by_key(|&candidate| {
                        OrderedFloat(maps[candidate].congested_distance(position))
                    });
                    if let Some(nearest) = nearest {
                        map_index = Some(nearest);
                        goal = maps[nearest].goal();
                    }
                }
                let arrival = columns.radii[row] * config.goal_radius;
                let preferred = if position.distance_sq(goal) <= arrival * arrival {
                    Vec2::ZERO
                } else {
                    let direction = map_index
                        .and_then(|index| maps.get(index))
                        .and_then(|map| map.direction_at(position))
                        .unwrap_or_else(|| (goal - position).normalized_or_zero());
                    direction * columns.preferred_speeds[row]
                };
                (preferred, map_index, goal)
            })
            .collect();
        let columns = &mut self.agents.columns;
        for (row, (preferred, map_index, goal)) in updates.into_iter().enumerate() {
            columns.preferred_velocities[row] = preferred;
            columns.nav_maps[row] = map_index;
            columns.goals[row] = goal;
        }
    }

    /// Steering phase. Coarse-only policies keep their pending acceleration
    /// on non-boundary fine ticks instead of recomputing.
    fn stage_steering(&mut self) {
        let mid_window = self.elapsed_in_coarse != 0.0;
        let config = &self.config;
        let policies = &self.policies;
        let ctx = self.context();
        let columns = ctx.columns;
        let updates: Vec<Option<Vec2>> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                let policy = policies.get(columns.policies[row])?;
                if policy.coarse_only() && mid_window {
                    return None;
                }
                let delta_time = policy_delta_time(config, policy);
                Some(policy.acceleration(&ctx.view(row, columns.velocities[row], delta_time)))
            })
            .collect();
        let columns = &mut self.agents.columns;
        for (row, update) in updates.into_iter().enumerate() {
            if let Some(acceleration) = update {
                columns.next_accelerations[row] = acceleration;
            }
        }
    }

    /// Contact-force phase, every fine tick.
    fn stage_contact(&mut self) {
        let config = &self.config;
        let policies = &self.policies;
        let ctx = self.context();
        let columns = ctx.columns;
        let forces: Vec<Vec2> = (0..columns.len())
            .into_par_iter()
            .map(|row| {
                policies
                    .get(columns.policies[row])
                    .map_or(Vec2::ZERO, |policy| {
                        let delta_time = policy_delta_time(config, policy);
                        policy.contact_force(&ctx.view(
                            row,
                            columns.velocities[row],
                            delta_time,
                        ))
                    })
            })
            .collect();
        let columns = &mut self.agents.columns;
        for (row, force) in forces.into_iter().enumerate() {
            columns.next_contact_forces[row] = force;
        }
    }

    /// Congestion accumulation: each parallel task fills a private per-map
    /// tally for its chunk of agents; the tallies are merged into worker
    /// slots after the join, then collated into each map's multiplier.
    fn stage_congestion(&mut self) {
        let columns = &self.agents.columns;
        let map_count = self.maps.len();
        let workers = rayon::current_num_threads().max(1);
        let chunk_size = columns.len().div_ceil(workers).max(1);
        let partials: Vec<Vec<NavTally>> = columns
            .nav_maps
            .par_chunks(chunk_size)
            .enumerate()
            .map(|(chunk_index, chunk)| {
                let mut tallies = vec![NavTally::ZERO; map_count];
                for (offset, nav_map) in chunk.iter().enumerate() {
                    let Some(map_index) = *nav_map else { continue };
                    let row = chunk_index * chunk_size + offset;
                    let tally = &mut tallies[map_index];
                    let to_goal =
                        (columns.goals[row] - columns.positions[row]).normalized_or_zero();
                    let heading = columns.velocities[row].normalized_or_zero();
                    tally.weighted_count += heading.dot(to_goal).max(0.0);
                    tally.congestion += columns.sph[row].density;
                    tally.agent_count += 1;
                    tally.speed += columns.velocities[row].length();
                }
                tallies
            })
            .collect();

        let ratio = self.config.fine_delta_time / self.config.navigation.time_window;
        for (slot, tallies) in partials.into_iter().enumerate() {
            for (map_index, tally) in tallies.into_iter().enumerate() {
                self.maps[map_index].record(slot, tally);
            }
        }
        for map in &mut self.maps {
            map.finish_tick(ratio);
        }
    }

    /// Reverse-order scan retiring agents flagged for removal that reached
    /// their goal. Sequential because it mutates the dense arena.
    fn retire_arrived(&mut self) -> usize {
        let mut removed = 0;
        let mut row = self.agents.len();
        while row > 0 {
            row -= 1;
            let columns = &self.agents.columns;
            if !columns.remove_at_goal[row] {
                continue;
            }
            let radius = columns.radii[row] * self.config.goal_radius;
            if columns.positions[row].distance_sq(columns.goals[row]) <= radius * radius {
                self.agents.swap_remove_row(row);
                self.caches.swap_remove(row);
                removed += 1;
            }
        }
        removed
    }

    fn summarize(&self, arrivals: usize) -> TickSummary {
        let columns = &self.agents.columns;
        let count = columns.len();
        let mut density_total = 0.0;
        let mut max_speed: f32 = 0.0;
        for row in 0..count {
            density_total += columns.sph[row].density;
            max_speed = max_speed.max(columns.velocities[row].length());
        }
        TickSummary {
            tick: self.tick,
            time: self.time,
            agent_count: count,
            arrivals,
            mean_density: if count == 0 {
                0.0
            } else {
                density_total / count as f32
            },
            max_speed,
        }
    }

    fn emit_batch(&mut self) {
        let columns = &self.agents.columns;
        let samples: Vec<TrajectorySample> = (0..columns.len())
            .map(|row| TrajectorySample {
                id: self.agents.ids[row],
                position: columns.positions[row],
                orientation: columns.viewing_directions[row],
                color: columns.colors[row],
            })
            .collect();
        let batch = TrajectoryBatch {
            tick: self.tick,
            time: self.time,
            samples,
        };
        self.recorder.on_tick(&batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::{Arc, Mutex};

    fn config_with(scheme: IntegrationScheme) -> ThrongConfig {
        ThrongConfig {
            integration: scheme,
            ..ThrongConfig::default()
        }
    }

    /// Seed whose goal equals its position, so the preferred velocity is
    /// zero and only explicit forces act.
    fn resting_seed(position: Vec2) -> AgentSeed {
        AgentSeed::at(position)
    }

    fn unclamped(mut seed: AgentSeed) -> AgentSeed {
        seed.max_speed = 1.0e6;
        seed.max_acceleration = 1.0e6;
        seed
    }

    fn assert_close(actual: Vec2, expected: Vec2, eps: f32) {
        assert!(
            (actual - expected).length() <= eps,
            "expected {expected:?}, got {actual:?}"
        );
    }

    struct ConstantForcePolicy {
        acceleration: Vec2,
    }

    impl NavigationPolicy for ConstantForcePolicy {
        fn name(&self) -> &str {
            "constant-force"
        }

        fn interaction_range(&self) -> f32 {
            1.0
        }

        fn acceleration(&self, _view: &PolicyView<'_>) -> Vec2 {
            self.acceleration
        }

        fn contact_force(&self, _view: &PolicyView<'_>) -> Vec2 {
            Vec2::ZERO
        }
    }

    struct DragPolicy {
        coefficient: f32,
    }

    impl NavigationPolicy for DragPolicy {
        fn name(&self) -> &str {
            "drag"
        }

        fn interaction_range(&self) -> f32 {
            1.0
        }

        fn acceleration(&self, view: &PolicyView<'_>) -> Vec2 {
            view.velocity * -self.coefficient
        }

        fn contact_force(&self, _view: &PolicyView<'_>) -> Vec2 {
            Vec2::ZERO
        }
    }

    struct CountingPolicy {
        calls: Arc<AtomicUsize>,
        coarse_only: bool,
    }

    impl NavigationPolicy for CountingPolicy {
        fn name(&self) -> &str {
            "counting"
        }

        fn interaction_range(&self) -> f32 {
            1.0
        }

        fn coarse_only(&self) -> bool {
            self.coarse_only
        }

        fn acceleration(&self, _view: &PolicyView<'_>) -> Vec2 {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Vec2::ZERO
        }

        fn contact_force(&self, _view: &PolicyView<'_>) -> Vec2 {
            Vec2::ZERO
        }
    }

    /// Records (own position, neighbor position) pairs seen during steering.
    struct ProbePolicy {
        seen: Arc<Mutex<Vec<(Vec2, Vec2)>>>,
    }

    impl NavigationPolicy for ProbePolicy {
        fn name(&self) -> &str {
            "probe"
        }

        fn interaction_range(&self) -> f32 {
            5.0
        }

        fn acceleration(&self, view: &PolicyView<'_>) -> Vec2 {
            let mut seen = self.seen.lock().expect("probe lock");
            for neighbor in view.neighbors.iter() {
                seen.push((view.position, neighbor.position));
            }
            Vec2::ZERO
        }

        fn contact_force(&self, _view: &PolicyView<'_>) -> Vec2 {
            Vec2::ZERO
        }
    }

    #[test]
    fn density_kernel_matches_reference_values() {
        assert!((poly6_kernel(Vec2::ZERO) - 4.0 / std::f32::consts::PI).abs() < 1.0e-6);
        assert_eq!(poly6_kernel(Vec2::new(1.0, 0.0)), 0.0);
        assert_eq!(poly6_kernel(Vec2::new(0.0, 2.5)), 0.0);
        let near = poly6_kernel(Vec2::new(0.5, 0.0));
        assert!(near > 0.0 && near < poly6_kernel(Vec2::ZERO));
    }

    #[test]
    fn gradient_kernel_is_zero_at_origin_and_support() {
        assert_eq!(spiky_gradient(Vec2::ZERO), Vec2::ZERO);
        assert_eq!(spiky_gradient(Vec2::new(1.0, 0.0)), Vec2::ZERO);
        let inside = spiky_gradient(Vec2::new(0.5, 0.0));
        assert!(inside.x < 0.0, "gradient points along the negative offset");
        assert_eq!(inside.y, 0.0);
    }

    #[test]
    fn viscosity_kernel_vanishes_at_support() {
        assert_eq!(viscosity_kernel(Vec2::new(1.0, 0.0)), 0.0);
        assert!((viscosity_kernel(Vec2::ZERO) - 360.0 / (29.0 * std::f32::consts::PI)).abs() < 1.0e-5);
    }

    #[test]
    fn obstacle_area_is_zero_for_disjoint_and_tangent_edges() {
        let position = Vec2::ZERO;
        let far = LineSegment::new(Vec2::new(-2.0, 3.0), Vec2::new(2.0, 3.0));
        assert_eq!(visible_obstacle_area(position, &far), 0.0);
        let tangent = LineSegment::new(Vec2::new(-2.0, 1.0), Vec2::new(2.0, 1.0));
        assert_eq!(visible_obstacle_area(position, &tangent), 0.0);
        let degenerate = LineSegment::new(Vec2::new(0.5, 0.0), Vec2::new(0.5, 0.0));
        assert_eq!(visible_obstacle_area(position, &degenerate), 0.0);
    }

    #[test]
    fn obstacle_area_is_positive_for_a_crossing_edge() {
        let position = Vec2::ZERO;
        let crossing = LineSegment::new(Vec2::new(-2.0, 0.5), Vec2::new(2.0, 0.5));
        let area = visible_obstacle_area(position, &crossing);
        assert!(area > 0.0);
        assert!(area < std::f32::consts::PI);
    }

    #[test]
    fn color_ramp_hits_the_documented_breakpoints() {
        assert_eq!(density_color(0.0), [0, 0, 255]);
        assert_eq!(density_color(2.5), [0, 191, 255]);
        assert_eq!(density_color(5.0), [0, 255, 0]);
        // The slider at the top band computes (1.0 - 0.9) / 0.1, which lands
        // a hair above one in f32, so the red channel truncates to 63.
        assert_eq!(density_color(10.0), [63, 0, 0]);
        assert_eq!(density_color(50.0), [63, 0, 0]);
    }

    #[test]
    fn sph_acceleration_short_circuits_at_zero_density() {
        assert_eq!(
            sph_acceleration_term(Vec2::new(3.0, -1.0), Vec2::new(0.5, 0.5), 0.0),
            Vec2::ZERO
        );
        let term = sph_acceleration_term(Vec2::new(2.0, 0.0), Vec2::new(0.0, 4.0), 2.0);
        assert_close(term, Vec2::new(-1.0, 2.0), 1.0e-6);
    }

    #[test]
    fn periodic_wrap_folds_positions_into_the_box() {
        let topology = Topology::Periodic {
            width: 10.0,
            height: 10.0,
        };
        assert_close(
            topology.wrap(Vec2::new(12.0, -3.0)),
            Vec2::new(2.0, 7.0),
            1.0e-6,
        );
        assert_close(topology.wrap(Vec2::new(4.0, 9.0)), Vec2::new(4.0, 9.0), 0.0);
        assert_eq!(
            Topology::Unbounded.wrap(Vec2::new(-40.0, 123.0)),
            Vec2::new(-40.0, 123.0)
        );
    }

    #[test]
    fn arena_remains_a_bijection_after_removals() {
        let mut arena = AgentArena::default();
        let reserved = HashSet::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            let id = arena.claim_id(None, &reserved);
            arena.insert(
                id,
                &AgentSeed::at(Vec2::new(n as f32, 0.0)),
                PolicyKey::default(),
                None,
            );
            ids.push(id);
        }
        arena.swap_remove_row(arena.index_of(ids[1]).expect("live row"));
        arena.swap_remove_row(arena.index_of(ids[3]).expect("live row"));
        assert_eq!(arena.len(), 3);
        for &id in [ids[0], ids[2], ids[4]].iter() {
            let row = arena.index_of(id).expect("remaining id resolves");
            assert!(row < arena.len());
            assert_eq!(arena.ids[row], id);
        }
        assert!(arena.index_of(ids[1]).is_none());
        assert!(arena.index_of(ids[3]).is_none());
    }

    #[test]
    fn desired_ids_fall_back_when_taken_and_the_counter_stays_monotone() {
        let mut world = WorldState::new(ThrongConfig::default()).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        let first = world
            .schedule_agent(resting_seed(Vec2::ZERO), key, Some(AgentId::new(5)), 10.0)
            .expect("scheduled");
        assert_eq!(first, AgentId::new(5));
        let second = world
            .schedule_agent(resting_seed(Vec2::ZERO), key, Some(AgentId::new(5)), 10.0)
            .expect("scheduled");
        assert_eq!(second, AgentId::new(6));
        let third = world
            .add_agent(resting_seed(Vec2::ZERO), key)
            .expect("added");
        assert_eq!(third, AgentId::new(7));
        assert_eq!(world.pending_count(), 2);
        assert_eq!(world.agent_count(), 1);
    }

    #[test]
    fn unknown_policies_and_missing_agents_are_typed_errors() {
        let mut world = WorldState::new(ThrongConfig::default()).expect("world");
        assert!(matches!(
            world.add_agent(resting_seed(Vec2::ZERO), PolicyKey::default()),
            Err(WorldError::UnknownPolicy)
        ));
        assert!(matches!(
            world.remove_agent(AgentId::new(3)),
            Err(WorldError::AgentNotFound(_))
        ));
    }

    #[test]
    fn configuration_validation_rejects_bad_values() {
        let cases = [
            ThrongConfig {
                fine_delta_time: 0.0,
                ..ThrongConfig::default()
            },
            ThrongConfig {
                fine_delta_time: 0.2,
                coarse_delta_time: 0.1,
                ..ThrongConfig::default()
            },
            ThrongConfig {
                goal_radius: 0.0,
                ..ThrongConfig::default()
            },
            ThrongConfig {
                topology: Topology::Periodic {
                    width: -1.0,
                    height: 10.0,
                },
                ..ThrongConfig::default()
            },
            ThrongConfig {
                sph: SphSettings {
                    enabled: true,
                    density_time_window: 0.0,
                    ..SphSettings::default()
                },
                ..ThrongConfig::default()
            },
            ThrongConfig {
                sph: SphSettings {
                    enabled: true,
                    min_rest_density: 3.0,
                    max_rest_density: 1.0,
                    ..SphSettings::default()
                },
                ..ThrongConfig::default()
            },
            ThrongConfig {
                navigation: NavSettings {
                    dynamic_maps: true,
                    time_window: 0.0,
                    ..NavSettings::default()
                },
                ..ThrongConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                WorldState::new(config),
                Err(WorldError::InvalidConfig(_))
            ));
        }
        assert!(WorldState::new(ThrongConfig::default()).is_ok());
    }

    #[test]
    fn resting_agents_stay_at_rest_under_every_scheme() {
        for scheme in [
            IntegrationScheme::Euler,
            IntegrationScheme::RungeKutta4,
            IntegrationScheme::Verlet,
            IntegrationScheme::Leapfrog,
        ] {
            let mut world = WorldState::new(config_with(scheme)).expect("world");
            let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
            let id = world
                .add_agent(resting_seed(Vec2::new(3.0, 4.0)), key)
                .expect("added");
            world.step_many(10).expect("steps");
            let snapshot = world.snapshot_agent(id).expect("snapshot");
            assert_eq!(snapshot.position, Vec2::new(3.0, 4.0), "{scheme:?}");
            assert_eq!(snapshot.velocity, Vec2::ZERO, "{scheme:?}");
        }
    }

    #[test]
    fn uniform_motion_is_identical_across_schemes() {
        let mut positions = Vec::new();
        for scheme in [
            IntegrationScheme::Euler,
            IntegrationScheme::RungeKutta4,
            IntegrationScheme::Verlet,
            IntegrationScheme::Leapfrog,
        ] {
            let mut world = WorldState::new(config_with(scheme)).expect("world");
            let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
            let seed = AgentSeed {
                velocity: Vec2::new(1.0, 0.0),
                goal: Vec2::new(100.0, 0.0),
                preferred_speed: 1.0,
                ..AgentSeed::at(Vec2::ZERO)
            };
            let id = world.add_agent(seed, key).expect("added");
            world.step_many(8).expect("steps");
            positions.push(world.snapshot_agent(id).expect("snapshot").position);
        }
        for position in &positions[1..] {
            assert_eq!(*position, positions[0]);
        }
        assert_close(positions[0], Vec2::new(0.8, 0.0), 1.0e-5);
    }

    #[test]
    fn euler_matches_the_constant_acceleration_closed_form() {
        let accel = Vec2::new(0.3, -0.2);
        let dt = 0.25;
        let config = ThrongConfig {
            fine_delta_time: dt,
            coarse_delta_time: dt,
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(ConstantForcePolicy { acceleration: accel }));
        let id = world
            .add_agent(unclamped(resting_seed(Vec2::ZERO)), key)
            .expect("added");
        let ticks = 8;
        world.step_many(ticks).expect("steps");
        let snapshot = world.snapshot_agent(id).expect("snapshot");
        let k = ticks as f32;
        assert_close(snapshot.velocity, accel * (k * dt), 1.0e-4);
        assert_close(
            snapshot.position,
            accel * (dt * dt * k * (k + 1.0) / 2.0),
            1.0e-4,
        );
    }

    #[test]
    fn verlet_takes_a_half_step_kick_from_rest() {
        let accel = Vec2::new(0.5, 0.0);
        let config = config_with(IntegrationScheme::Verlet);
        let dt = config.fine_delta_time;
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(ConstantForcePolicy { acceleration: accel }));
        let id = world
            .add_agent(unclamped(resting_seed(Vec2::ZERO)), key)
            .expect("added");
        world.step().expect("step");
        let snapshot = world.snapshot_agent(id).expect("snapshot");
        assert_close(snapshot.position, accel * (0.5 * dt * dt), 1.0e-6);
        assert_close(snapshot.velocity, accel * dt, 1.0e-6);
    }

    #[test]
    fn leapfrog_seeds_the_half_step_offset_on_the_first_tick() {
        let accel = Vec2::new(0.4, 0.0);
        let config = config_with(IntegrationScheme::Leapfrog);
        let dt = config.fine_delta_time;
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(ConstantForcePolicy { acceleration: accel }));
        let id = world
            .add_agent(unclamped(resting_seed(Vec2::ZERO)), key)
            .expect("added");
        world.step().expect("step");
        let first = world.snapshot_agent(id).expect("snapshot");
        assert_close(first.velocity, accel * dt, 1.0e-6);
        assert_close(first.position, accel * (dt * dt), 1.0e-6);
        world.step().expect("step");
        let second = world.snapshot_agent(id).expect("snapshot");
        // Published velocity now rides the half-shifted running velocity.
        assert_close(second.velocity, accel * (1.5 * dt), 1.0e-6);
        assert_close(
            second.position,
            accel * (dt * dt) + accel * (1.5 * dt * dt),
            1.0e-6,
        );
    }

    #[test]
    fn rk4_under_constant_acceleration_matches_euler() {
        let accel = Vec2::new(0.2, 0.1);
        let run = |scheme: IntegrationScheme| -> (Vec2, Vec2) {
            let mut world = WorldState::new(config_with(scheme)).expect("world");
            let key =
                world.register_policy(Box::new(ConstantForcePolicy { acceleration: accel }));
            let id = world
                .add_agent(unclamped(resting_seed(Vec2::ZERO)), key)
                .expect("added");
            world.step().expect("step");
            let snapshot = world.snapshot_agent(id).expect("snapshot");
            (snapshot.position, snapshot.velocity)
        };
        let (euler_pos, euler_vel) = run(IntegrationScheme::Euler);
        let (rk4_pos, rk4_vel) = run(IntegrationScheme::RungeKutta4);
        assert_close(rk4_vel, euler_vel, 1.0e-6);
        assert_close(rk4_pos, euler_pos, 1.0e-6);
    }

    #[test]
    fn rk4_stages_reevaluate_the_policy_at_staged_velocities() {
        let coefficient = 0.8;
        let v0 = Vec2::new(1.0, 0.5);
        let config = config_with(IntegrationScheme::RungeKutta4);
        let dt = config.fine_delta_time;
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(DragPolicy { coefficient }));
        let seed = AgentSeed {
            velocity: v0,
            ..unclamped(resting_seed(Vec2::ZERO))
        };
        let id = world.add_agent(seed, key).expect("added");
        world.step().expect("step");

        let k1 = v0 * -coefficient;
        let k2 = (v0 + k1 * (dt * 0.5)) * -coefficient;
        let k3 = (v0 + k2 * (dt * 0.5)) * -coefficient;
        let k4 = (v0 + k3 * dt) * -coefficient;
        let accel = (k1 + k2 * 2.0 + k3 * 2.0 + k4) / 6.0;
        let expected_velocity = v0 + accel * dt;

        let snapshot = world.snapshot_agent(id).expect("snapshot");
        assert_close(snapshot.velocity, expected_velocity, 1.0e-6);
        assert_close(snapshot.position, expected_velocity * dt, 1.0e-6);
    }

    #[test]
    fn coarse_only_policies_skip_midwindow_steering() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = ThrongConfig {
            fine_delta_time: 0.25,
            coarse_delta_time: 0.5,
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(CountingPolicy {
            calls: Arc::clone(&calls),
            coarse_only: true,
        }));
        world
            .add_agent(resting_seed(Vec2::ZERO), key)
            .expect("added");
        world.step_many(4).expect("steps");
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);

        let calls_every_tick = Arc::new(AtomicUsize::new(0));
        let config = ThrongConfig {
            fine_delta_time: 0.25,
            coarse_delta_time: 0.5,
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(CountingPolicy {
            calls: Arc::clone(&calls_every_tick),
            coarse_only: false,
        }));
        world
            .add_agent(resting_seed(Vec2::ZERO), key)
            .expect("added");
        world.step_many(4).expect("steps");
        assert_eq!(calls_every_tick.load(AtomicOrdering::SeqCst), 4);
    }

    #[test]
    fn scheduled_agents_appear_at_their_start_time() {
        let config = ThrongConfig {
            fine_delta_time: 0.25,
            coarse_delta_time: 0.25,
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        let id = world
            .schedule_agent(
                resting_seed(Vec2::new(1.0, 1.0)),
                key,
                Some(AgentId::new(9)),
                0.5,
            )
            .expect("scheduled");
        assert_eq!(id, AgentId::new(9));
        assert_eq!(world.pending_count(), 1);

        let first = world.step().expect("step");
        assert_eq!(first.agent_count, 0);
        let second = world.step().expect("step");
        assert_eq!(second.agent_count, 0);
        // The third tick starts at time 0.5, so the agent takes part in it.
        let third = world.step().expect("step");
        assert_eq!(third.agent_count, 1);
        assert_eq!(world.pending_count(), 0);
        assert!(world.contains_agent(id));
    }

    #[test]
    fn accumulator_collation_sums_and_resets_slots() {
        let mut accumulator = NavAccumulator::new(3);
        let one = NavTally {
            weighted_count: 1.0,
            congestion: 1.0,
            agent_count: 1,
            speed: 1.0,
        };
        for slot in 0..3 {
            accumulator.record(slot, one);
        }
        accumulator.record(5, one); // wraps onto slot 2
        let total = accumulator.collate();
        assert_eq!(total.agent_count, 4);
        assert!((total.speed - 4.0).abs() < 1.0e-6);
        let after = accumulator.collate();
        assert_eq!(after.agent_count, 0);
        assert_eq!(after.speed, 0.0);
    }

    #[test]
    fn map_multiplier_smooths_toward_count_over_speed() {
        let mut map = DynamicNavigationMap::uniform(Vec2::new(5.0, 5.0), 10, 10).expect("map");
        assert!((map.multiplier() - 1.0).abs() < 1.0e-6);
        map.record(
            0,
            NavTally {
                weighted_count: 0.0,
                congestion: 0.0,
                agent_count: 1,
                speed: 0.0,
            },
        );
        map.finish_tick(0.5);
        // Seeds contribute one agent at 1.4 m/s; the recorded tally adds one
        // more agent with no speed.
        let expected = 0.5 + 0.5 * (2.0 / 1.4);
        assert!((map.multiplier() - expected).abs() < 1.0e-6);
    }

    #[test]
    fn map_lookups_fall_back_outside_the_grid() {
        let map = DynamicNavigationMap::uniform(Vec2::new(5.0, 5.0), 10, 10).expect("map");
        assert!(map.direction_at(Vec2::new(-1.0, 4.0)).is_none());
        assert!(map.direction_at(Vec2::new(4.0, 4.0)).is_some());
        let outside = Vec2::new(15.0, 5.0);
        assert!((map.congested_distance(outside) - 10.0).abs() < 1.0e-5);
    }

    #[test]
    fn congestion_tables_match_their_breakpoints() {
        assert_eq!(multiplier_from_congestion(0.5), 1.0);
        assert!((multiplier_from_congestion(1.5) - 1.375).abs() < 1.0e-6);
        assert!((multiplier_from_congestion(3.5) - 2.55).abs() < 1.0e-6);
        assert_eq!(multiplier_from_congestion(9.0), 7.0);
        assert_eq!(walking_speed_from_density(0.5), 1.4);
        assert!((walking_speed_from_density(1.5) - 1.1).abs() < 1.0e-6);
        assert_eq!(walking_speed_from_density(8.0), 0.2);
    }

    #[test]
    fn density_scaled_preferred_velocity_follows_the_reference_curve() {
        assert_eq!(
            preferred_velocity_from_density(Vec2::new(1.0, -2.0), 0.0),
            Vec2::ZERO
        );
        let scaled = preferred_velocity_from_density(Vec2::new(1.0, 0.0), 2.0);
        assert!((scaled.x - 1.509).abs() < 1.0e-3);
        assert_eq!(scaled.y, 0.0);
    }

    #[test]
    fn nearest_map_selection_adopts_the_closer_goal() {
        let config = ThrongConfig {
            navigation: NavSettings {
                global_navigation: true,
                nearest_map_selection: true,
                dynamic_maps: false,
                ..NavSettings::default()
            },
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        world.add_navigation_map(
            DynamicNavigationMap::uniform(Vec2::new(1.0, 1.0), 32, 32).expect("map"),
        );
        world.add_navigation_map(
            DynamicNavigationMap::uniform(Vec2::new(20.0, 20.0), 32, 32).expect("map"),
        );
        let seed = AgentSeed {
            goal: Vec2::new(1.0, 1.0),
            ..AgentSeed::at(Vec2::new(18.0, 18.0))
        };
        let id = world.add_agent(seed, key).expect("added");
        world.step().expect("step");
        let goal = world.agent_goal(id).expect("goal");
        assert_close(goal, Vec2::new(20.0, 20.0), 1.0e-6);
    }

    #[test]
    fn periodic_neighbors_are_found_through_the_wrap() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let config = ThrongConfig {
            topology: Topology::Periodic {
                width: 10.0,
                height: 10.0,
            },
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(ProbePolicy {
            seen: Arc::clone(&seen),
        }));
        let left = world
            .add_agent(resting_seed(Vec2::new(0.5, 5.0)), key)
            .expect("added");
        let right = world
            .add_agent(resting_seed(Vec2::new(9.5, 5.0)), key)
            .expect("added");
        world.step().expect("step");

        assert_eq!(world.neighbor_count(left), Some(1));
        assert_eq!(world.neighbor_count(right), Some(1));
        let seen = seen.lock().expect("probe lock");
        assert_eq!(seen.len(), 2);
        for (own, neighbor) in seen.iter() {
            let distance = (*own - *neighbor).length();
            assert!(
                distance < 2.0,
                "offset-corrected neighbor should be near: {distance}"
            );
            // The raw stored positions are 9 apart; only the phantom is close.
            assert!(neighbor.x < 0.0 || neighbor.x > 10.0);
        }
    }

    #[test]
    fn overlapping_agents_push_apart_through_contact_forces() {
        let mut world = WorldState::new(ThrongConfig::default()).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        let left = world
            .add_agent(resting_seed(Vec2::ZERO), key)
            .expect("added");
        let right = world
            .add_agent(resting_seed(Vec2::new(0.3, 0.0)), key)
            .expect("added");
        world.step().expect("step");
        let left_snapshot = world.snapshot_agent(left).expect("snapshot");
        let right_snapshot = world.snapshot_agent(right).expect("snapshot");
        assert!(left_snapshot.velocity.x < 0.0);
        assert!(right_snapshot.velocity.x > 0.0);
        assert!(
            (left_snapshot.velocity.x + right_snapshot.velocity.x).abs() < 1.0e-5,
            "push-apart should be symmetric"
        );
        assert!(left_snapshot.position.x < 0.0);
        assert!(right_snapshot.position.x > 0.3);
    }

    #[test]
    fn agents_flagged_for_removal_retire_at_their_goal() {
        let mut world = WorldState::new(ThrongConfig::default()).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        let seed = AgentSeed {
            goal: Vec2::new(0.1, 0.0),
            remove_at_goal: true,
            ..AgentSeed::at(Vec2::ZERO)
        };
        let id = world.add_agent(seed, key).expect("added");
        let summary = world.step().expect("step");
        assert_eq!(summary.arrivals, 1);
        assert_eq!(summary.agent_count, 0);
        assert!(!world.contains_agent(id));
        assert!(world.snapshot_agent(id).is_none());
    }

    #[test]
    fn crossing_groups_evolve_deterministically() {
        let build = || {
            let config = ThrongConfig {
                sph: SphSettings {
                    enabled: true,
                    ..SphSettings::default()
                },
                ..ThrongConfig::default()
            };
            let mut world = WorldState::new(config).expect("world");
            let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
            for n in 0..6 {
                let y = n as f32 * 0.4;
                let eastbound = AgentSeed {
                    goal: Vec2::new(12.0, y),
                    ..AgentSeed::at(Vec2::new(0.0, y))
                };
                let westbound = AgentSeed {
                    goal: Vec2::new(0.0, y + 0.2),
                    ..AgentSeed::at(Vec2::new(12.0, y + 0.2))
                };
                world.add_agent(eastbound, key).expect("added");
                world.add_agent(westbound, key).expect("added");
            }
            world
        };
        let mut first = build();
        let mut second = build();
        first.step_many(10).expect("steps");
        second.step_many(10).expect("steps");
        let left = first.agent_snapshots();
        let right = second.agent_snapshots();
        assert_eq!(left, right);
        assert!(left.iter().all(|snapshot| snapshot.position.is_finite()));
    }

    #[test]
    fn occupancy_counts_bucket_positions_into_unit_cells() {
        let mut world = WorldState::new(ThrongConfig::default()).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        world
            .add_agent(resting_seed(Vec2::new(0.5, 0.5)), key)
            .expect("added");
        world
            .add_agent(resting_seed(Vec2::new(0.9, 0.1)), key)
            .expect("added");
        world
            .add_agent(resting_seed(Vec2::new(2.5, 1.5)), key)
            .expect("added");
        world
            .add_agent(resting_seed(Vec2::new(-1.0, 0.5)), key)
            .expect("added");
        let grid = world.occupancy_counts(4, 3);
        assert_eq!(grid.count(0, 0), 2);
        assert_eq!(grid.count(2, 1), 1);
        assert_eq!(grid.count(3, 2), 0);
        assert_eq!(grid.counts.iter().sum::<u32>(), 3);
    }

    #[test]
    fn history_is_bounded_and_summaries_carry_tick_time() {
        let config = ThrongConfig {
            history_capacity: 4,
            ..ThrongConfig::default()
        };
        let mut world = WorldState::new(config).expect("world");
        let key = world.register_policy(Box::new(GoalReachingPolicy::default()));
        world
            .add_agent(resting_seed(Vec2::ZERO), key)
            .expect("added");
        world.step_many(10).expect("steps");
        assert_eq!(world.history().len(), 4);
        let last = world.history().back().expect("summary");
        assert_eq!(last.tick, Tick(10));
        assert!((last.time - 1.0).abs() < 1.0e-5);
        assert_eq!(last.agent_count, 1);
    }
}
