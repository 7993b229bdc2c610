//! Core types and the synchronous tick pipeline for a Kilobot-style
//! self-assembly swarm.
//!
//! The swarm advances in discrete lock-step ticks: a sensing phase rebuilds
//! every bot's neighbor snapshot from frozen tick-start state, then each bot
//! runs gradient relaxation, self-localization, and its state-machine step
//! against that snapshot only. Rendering, plotting, and persistence live
//! behind thin interfaces ([`Swarm::render_view`], [`MetricsSink`]) and are
//! deliberately absent from this crate.

use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

const FULL_TURN: f64 = std::f64::consts::TAU;

/// Wrap an angle into `[0, 2π)`.
fn wrap_heading(mut angle: f64) -> f64 {
    if angle.is_nan() {
        return 0.0;
    }
    while angle < 0.0 {
        angle += FULL_TURN;
    }
    while angle >= FULL_TURN {
        angle -= FULL_TURN;
    }
    angle
}

/// Draw a relative error in `[-bound, bound)`, or zero when noise is disabled.
fn relative_error(enabled: bool, bound: f64, rng: &mut SmallRng) -> f64 {
    if enabled && bound > 0.0 {
        rng.random_range(-bound..bound)
    } else {
        0.0
    }
}

/// High level simulation clock (ticks processed since boot).
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

/// Continuous 2D position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Creation-order bot identifier, stable for the lifetime of a run.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct BotId(pub u32);

/// Lifecycle of a bot; the derived ordering is the only legal progression
/// (seeds jump straight from `Start` to `JoinedShape`).
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub enum BotState {
    #[default]
    Start,
    WaitToMove,
    MoveWhileOutside,
    MoveWhileInside,
    JoinedShape,
}

impl BotState {
    /// Whether the bot is edge-following this state.
    #[must_use]
    pub const fn is_moving(self) -> bool {
        matches!(self, Self::MoveWhileOutside | Self::MoveWhileInside)
    }

    /// Whether this state may anchor a neighbor's gradient relaxation.
    #[must_use]
    pub const fn anchors_gradient(self) -> bool {
        matches!(self, Self::JoinedShape | Self::WaitToMove)
    }
}

/// Hop-count distance from the seed set.
///
/// `Unreachable` orders above every finite hop count and compares equal to
/// itself, reproducing the infinity arithmetic the decision rules rely on: a
/// bot whose gradient never formed still wins the "highest gradient moves
/// first" comparison, and two unreachable gradients still satisfy the
/// join-on-equal-gradient rule.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub enum Gradient {
    Hop(u32),
    #[default]
    Unreachable,
}

impl Gradient {
    /// One hop further from the seed; unreachable stays unreachable.
    #[must_use]
    pub const fn successor(self) -> Self {
        match self {
            Self::Hop(hops) => Self::Hop(hops.saturating_add(1)),
            Self::Unreachable => Self::Unreachable,
        }
    }

    /// Finite hop count, if the gradient ever formed.
    #[must_use]
    pub const fn hops(self) -> Option<u32> {
        match self {
            Self::Hop(hops) => Some(hops),
            Self::Unreachable => None,
        }
    }
}

impl fmt::Display for Gradient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hop(hops) => write!(f, "{hops}"),
            Self::Unreachable => f.write_str("inf"),
        }
    }
}

/// Membership predicate over the target shape.
///
/// Implementations are read-only and side-effect free; the backing raster is
/// supplied by an external collaborator. Points outside the raster (or with
/// non-finite coordinates) are outside the shape.
pub trait ShapeOracle {
    fn inside(&self, point: Position) -> bool;
}

/// Boolean raster mask implementing [`ShapeOracle`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RasterShape {
    width: u32,
    height: u32,
    cells: Vec<bool>,
}

impl RasterShape {
    /// Construct an all-outside raster of the given dimensions.
    pub fn new(width: u32, height: u32) -> Result<Self, SwarmError> {
        if width == 0 || height == 0 {
            return Err(SwarmError::InvalidConfig(
                "raster dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![false; (width as usize) * (height as usize)],
        })
    }

    /// Construct a raster by evaluating `predicate` at every cell.
    pub fn from_fn(
        width: u32,
        height: u32,
        mut predicate: impl FnMut(u32, u32) -> bool,
    ) -> Result<Self, SwarmError> {
        let mut shape = Self::new(width, height)?;
        for y in 0..height {
            for x in 0..width {
                let idx = shape.offset(x, y);
                shape.cells[idx] = predicate(x, y);
            }
        }
        Ok(shape)
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + (x as usize)
    }

    /// Cell membership, `None` when out of bounds.
    #[must_use]
    pub fn get(&self, x: u32, y: u32) -> Option<bool> {
        if x < self.width && y < self.height {
            Some(self.cells[self.offset(x, y)])
        } else {
            None
        }
    }

    /// Mark a single cell.
    pub fn set(&mut self, x: u32, y: u32, inside: bool) {
        if x < self.width && y < self.height {
            let idx = self.offset(x, y);
            self.cells[idx] = inside;
        }
    }
}

impl ShapeOracle for RasterShape {
    fn inside(&self, point: Position) -> bool {
        if !point.x.is_finite() || !point.y.is_finite() {
            return false;
        }
        let x = point.x.floor();
        let y = point.y.floor();
        if x < 0.0 || y < 0.0 || x >= f64::from(self.width) || y >= f64::from(self.height) {
            return false;
        }
        self.cells[self.offset(x as u32, y as u32)]
    }
}

/// Monotonically increasing counter assigning a global order to bots as they
/// start moving. Owned by the [`Swarm`] so independent runs never share state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationRegistry {
    next: u32,
}

impl ActivationRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self { next: 0 }
    }

    /// Hand out the next activation index. Called at most once per bot.
    pub const fn claim(&mut self) -> u32 {
        let index = self.next;
        self.next += 1;
        index
    }

    /// Number of indices handed out so far.
    #[must_use]
    pub const fn issued(&self) -> u32 {
        self.next
    }
}

/// What one bot learned about a neighbor during the sensing phase.
///
/// Valid for exactly one tick and owned by the receiving bot. `position` is
/// the sender's true position captured when the snapshot was frozen; it feeds
/// the collision guard and is never read by the decision rules.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborObservation {
    pub sender: BotId,
    /// Noisy measured distance (true distance with multiplicative error).
    pub distance: f64,
    pub gradient: Gradient,
    pub state: BotState,
    pub activation: Option<u32>,
    /// Sender's self-estimate of its own position.
    pub perceived: Position,
    /// Sender's true position at tick start.
    pub position: Position,
}

/// Public fields a bot broadcasts, frozen once per tick.
#[derive(Debug, Clone, Copy)]
struct BotPublic {
    id: BotId,
    position: Position,
    perceived: Position,
    gradient: Gradient,
    state: BotState,
    activation: Option<u32>,
}

/// Nearest observation by measured distance; ties keep the earliest snapshot
/// entry, i.e. the lowest sender id.
fn nearest_observation(observations: &[NeighborObservation]) -> Option<&NeighborObservation> {
    let mut best: Option<(OrderedFloat<f64>, &NeighborObservation)> = None;
    for obs in observations {
        let key = OrderedFloat(obs.distance);
        if best.as_ref().is_none_or(|(current, _)| key < *current) {
            best = Some((key, obs));
        }
    }
    best.map(|(_, obs)| obs)
}

/// Self-localization strategy applied each tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LocalizationMode {
    /// Iterative trilateration against joined neighbors' self-estimates.
    #[default]
    Trilateration,
    /// Oracle mode: copy the true position while still moving.
    Perfect,
}

/// Errors raised when constructing swarm state.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a swarm run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwarmConfig {
    /// Physical bot radius in world units; collisions trigger below twice this.
    pub bot_radius: f64,
    /// Standoff distance the edge-follow controller tries to hold.
    pub desired_distance: f64,
    /// Maximum range of the simulated radio.
    pub broadcast_radius: f64,
    /// Range within which stationary neighbors anchor gradient relaxation.
    pub gradient_radius: f64,
    /// Simulated seconds a bot idles in `Start` before waiting to move.
    pub startup_delay: f64,
    /// Minimum separation from a prior mover below which a bot stays put.
    pub yield_distance: f64,
    /// Mean forward speed drawn at creation (world units per second).
    pub forward_speed_mean: f64,
    /// Standard deviation of the forward speed draw.
    pub forward_speed_std: f64,
    /// Mean turn speed drawn at creation (radians per second).
    pub turn_speed_mean: f64,
    /// Standard deviation of the turn speed draw.
    pub turn_speed_std: f64,
    /// Relative error bound on straight movement.
    pub forward_error: f64,
    /// Relative error bound on turns.
    pub turn_error: f64,
    /// Relative error bound on measured distances.
    pub distance_error: f64,
    /// Master switch for movement noise and per-bot speed variance.
    pub movement_noise: bool,
    /// Master switch for distance measurement noise.
    pub distance_noise: bool,
    /// Localization strategy.
    pub localization: LocalizationMode,
    /// Simulated seconds of continued localization after joining the shape.
    pub post_join_grace: f64,
    /// Consecutive perceived-inside ticks required before committing to
    /// `MoveWhileInside` (strictly exceeded).
    pub inside_shape_debounce: u32,
    /// Simulated seconds advanced per tick.
    pub tick_seconds: f64,
    /// Rows of the staggered start grid placed by [`Swarm::populate`].
    pub grid_rows: u32,
    /// Columns of the staggered start grid.
    pub grid_cols: u32,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Ticks between metrics flushes; 0 disables the sink entirely.
    pub metrics_interval: u32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            bot_radius: 10.0,
            desired_distance: 23.0,
            broadcast_radius: 100.0,
            gradient_radius: 30.0,
            startup_delay: 2.0,
            yield_distance: 35.0,
            forward_speed_mean: 10.0,
            forward_speed_std: 1.0,
            turn_speed_mean: 3.0,
            turn_speed_std: 0.5,
            forward_error: 0.01,
            turn_error: 0.01,
            distance_error: 0.01,
            movement_noise: true,
            distance_noise: true,
            localization: LocalizationMode::Trilateration,
            post_join_grace: 1.0,
            inside_shape_debounce: 10,
            tick_seconds: 0.1,
            grid_rows: 10,
            grid_cols: 20,
            rng_seed: None,
            metrics_interval: 1,
            history_capacity: 256,
        }
    }
}

impl SwarmConfig {
    /// Validate numeric parameters, failing fast on nonsense values.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if !(self.bot_radius > 0.0) {
            return Err(SwarmError::InvalidConfig("bot_radius must be positive"));
        }
        if !(self.desired_distance > 0.0) {
            return Err(SwarmError::InvalidConfig(
                "desired_distance must be positive",
            ));
        }
        if !(self.broadcast_radius > 0.0) {
            return Err(SwarmError::InvalidConfig(
                "broadcast_radius must be positive",
            ));
        }
        if !(self.gradient_radius > 0.0) || self.gradient_radius > self.broadcast_radius {
            return Err(SwarmError::InvalidConfig(
                "gradient_radius must be positive and within broadcast_radius",
            ));
        }
        if !(self.yield_distance > 0.0) {
            return Err(SwarmError::InvalidConfig("yield_distance must be positive"));
        }
        if !(self.forward_speed_mean > 0.0) || !(self.turn_speed_mean > 0.0) {
            return Err(SwarmError::InvalidConfig("speed means must be positive"));
        }
        if !(self.forward_speed_std >= 0.0)
            || !(self.turn_speed_std >= 0.0)
            || !self.forward_speed_std.is_finite()
            || !self.turn_speed_std.is_finite()
        {
            return Err(SwarmError::InvalidConfig(
                "speed deviations must be finite and non-negative",
            ));
        }
        if !(self.forward_error >= 0.0)
            || !(self.turn_error >= 0.0)
            || !(self.distance_error >= 0.0)
        {
            return Err(SwarmError::InvalidConfig(
                "error bounds must be non-negative",
            ));
        }
        if !(self.startup_delay >= 0.0) || !(self.post_join_grace >= 0.0) {
            return Err(SwarmError::InvalidConfig("timers must be non-negative"));
        }
        if !(self.tick_seconds > 0.0) {
            return Err(SwarmError::InvalidConfig("tick_seconds must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(SwarmError::InvalidConfig(
                "history_capacity must be non-zero",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Per-state presentation color (linear RGB).
#[must_use]
pub const fn state_color(state: BotState) -> [f32; 3] {
    match state {
        BotState::Start | BotState::MoveWhileOutside => [0.659, 0.855, 0.863],
        BotState::WaitToMove => [0.902, 0.224, 0.275],
        BotState::MoveWhileInside => [0.271, 0.482, 0.616],
        BotState::JoinedShape => [0.114, 0.208, 0.341],
    }
}

/// Fixed color marking seed bots regardless of state.
pub const SEED_COLOR: [f32; 3] = [0.0, 0.518, 0.561];

/// One simulated robot.
///
/// All fields are private; the swarm drives a bot exclusively through the
/// tick pipeline, and external collaborators read it through accessors or
/// [`Swarm::render_view`].
#[derive(Debug, Clone)]
pub struct Bot {
    id: BotId,
    position: Position,
    heading: f64,
    state: BotState,
    is_seed: bool,
    gradient: Gradient,
    perceived: Position,
    activation: Option<u32>,
    forward_speed: f64,
    turn_speed: f64,
    startup_timer: f64,
    inside_streak: u32,
    post_join_timer: f64,
    updates_gradient: bool,
    localizing: bool,
    prev_neighbor_distance: f64,
    neighbors: Vec<NeighborObservation>,
    color: [f32; 3],
    selected: bool,
}

impl Bot {
    fn new(
        id: BotId,
        position: Position,
        heading: f64,
        is_seed: bool,
        forward_speed: f64,
        turn_speed: f64,
    ) -> Self {
        let mut bot = Self {
            id,
            position,
            heading: wrap_heading(heading),
            state: BotState::Start,
            is_seed,
            gradient: if is_seed {
                Gradient::Hop(0)
            } else {
                Gradient::Unreachable
            },
            perceived: if is_seed { position } else { Position::default() },
            activation: None,
            forward_speed,
            turn_speed,
            startup_timer: 0.0,
            inside_streak: 0,
            post_join_timer: 0.0,
            updates_gradient: true,
            localizing: true,
            prev_neighbor_distance: f64::INFINITY,
            neighbors: Vec::new(),
            color: [0.0; 3],
            selected: false,
        };
        bot.update_color();
        bot
    }

    #[must_use]
    pub const fn id(&self) -> BotId {
        self.id
    }

    /// True position in world coordinates.
    #[must_use]
    pub const fn position(&self) -> Position {
        self.position
    }

    /// Heading in radians, always in `[0, 2π)`.
    #[must_use]
    pub const fn heading(&self) -> f64 {
        self.heading
    }

    #[must_use]
    pub const fn state(&self) -> BotState {
        self.state
    }

    #[must_use]
    pub const fn is_seed(&self) -> bool {
        self.is_seed
    }

    #[must_use]
    pub const fn gradient(&self) -> Gradient {
        self.gradient
    }

    /// The bot's noisy self-estimate of its own position.
    #[must_use]
    pub const fn perceived_position(&self) -> Position {
        self.perceived
    }

    /// Activation index, set once when the bot first starts moving.
    #[must_use]
    pub const fn activation_index(&self) -> Option<u32> {
        self.activation
    }

    /// Forward speed drawn at creation.
    #[must_use]
    pub const fn forward_speed(&self) -> f64 {
        self.forward_speed
    }

    /// Turn speed drawn at creation.
    #[must_use]
    pub const fn turn_speed(&self) -> f64 {
        self.turn_speed
    }

    /// This tick's frozen neighbor snapshot.
    #[must_use]
    pub fn neighbors(&self) -> &[NeighborObservation] {
        &self.neighbors
    }

    #[must_use]
    pub const fn color(&self) -> [f32; 3] {
        self.color
    }

    #[must_use]
    pub const fn selected(&self) -> bool {
        self.selected
    }

    /// Distance between the true position and the self-estimate.
    #[must_use]
    pub fn location_error(&self) -> f64 {
        self.position.distance_to(self.perceived)
    }

    fn public_state(&self) -> BotPublic {
        BotPublic {
            id: self.id,
            position: self.position,
            perceived: self.perceived,
            gradient: self.gradient,
            state: self.state,
            activation: self.activation,
        }
    }

    /// One relaxation step of the distributed hop-distance field.
    ///
    /// Seeds pin zero; joined bots have frozen their gradient. Everyone else
    /// takes the minimum over stationary neighbors within gradient range plus
    /// one, or falls back to unreachable when no anchor is in range.
    fn form_gradient(&mut self, config: &SwarmConfig) {
        if self.is_seed {
            self.gradient = Gradient::Hop(0);
            return;
        }
        if !self.updates_gradient {
            return;
        }
        let mut lowest_anchor_gradient: Option<Gradient> = None;
        for obs in &self.neighbors {
            if obs.distance >= config.gradient_radius || !obs.state.anchors_gradient() {
                continue;
            }
            lowest_anchor_gradient = Some(match lowest_anchor_gradient {
                Some(current) => current.min(obs.gradient),
                None => obs.gradient,
            });
        }
        self.gradient = match lowest_anchor_gradient {
            Some(minimum) => minimum.successor(),
            None => Gradient::Unreachable,
        };
    }

    /// Iterative trilateration against joined neighbors.
    ///
    /// Each reference in snapshot order overwrites the running estimate with
    /// `ref + measured * v̂`, where `v̂` points from the reference's perceived
    /// position toward the current estimate. The last reference therefore
    /// dominates; earlier ones only steer the direction vector. This matches
    /// the behavior the join rules were tuned against and is intentionally
    /// not a least-squares fix.
    fn localize(&mut self) {
        if self.is_seed {
            return;
        }
        if self.state == BotState::JoinedShape && !self.localizing {
            return;
        }
        let references = self
            .neighbors
            .iter()
            .filter(|obs| obs.state == BotState::JoinedShape)
            .count();
        if references < 3 {
            return;
        }
        for i in 0..self.neighbors.len() {
            let obs = &self.neighbors[i];
            if obs.state != BotState::JoinedShape {
                continue;
            }
            let anchor = obs.perceived;
            let measured = obs.distance;
            let dx = self.perceived.x - anchor.x;
            let dy = self.perceived.y - anchor.y;
            let length = (dx * dx + dy * dy).sqrt();
            if length <= f64::EPSILON {
                // Degenerate reference: estimate sits on top of the anchor.
                continue;
            }
            self.perceived = Position::new(
                anchor.x + measured * dx / length,
                anchor.y + measured * dy / length,
            );
        }
    }

    /// Oracle localization: copy the true position while still moving.
    fn perfect_localize(&mut self) {
        if self.is_seed || self.state == BotState::JoinedShape {
            return;
        }
        self.perceived = self.position;
    }

    /// Advance along the heading, rejecting the move entirely if the new
    /// position would overlap any sensed neighbor.
    fn move_straight(&mut self, config: &SwarmConfig, rng: &mut SmallRng, dt: f64) {
        let step_x = self.forward_speed * self.heading.cos() * dt;
        let step_y = self.forward_speed * self.heading.sin() * dt;
        let error = relative_error(config.movement_noise, config.forward_error, rng);
        let tentative = Position::new(
            self.position.x + step_x * (1.0 + error),
            self.position.y + step_y * (1.0 + error),
        );
        let clearance = 2.0 * config.bot_radius;
        for obs in &self.neighbors {
            if tentative.distance_to(obs.position) < clearance {
                return;
            }
        }
        self.position = tentative;
    }

    fn turn_left(&mut self, config: &SwarmConfig, rng: &mut SmallRng, dt: f64) {
        let delta = self.turn_speed * dt;
        let error = relative_error(config.movement_noise, config.turn_error, rng);
        self.heading = wrap_heading(self.heading - delta + error * delta);
    }

    fn turn_right(&mut self, config: &SwarmConfig, rng: &mut SmallRng, dt: f64) {
        let delta = self.turn_speed * dt;
        let error = relative_error(config.movement_noise, config.turn_error, rng);
        self.heading = wrap_heading(self.heading + delta + error * delta);
    }

    /// Bang-bang boundary tracer holding `desired_distance` from the nearest
    /// stationary neighbor, using last tick's distance as a derivative term.
    fn follow_edge(&mut self, config: &SwarmConfig, rng: &mut SmallRng, dt: f64) {
        let mut current = f64::INFINITY;
        for obs in &self.neighbors {
            if !obs.state.is_moving() && obs.distance < current {
                current = obs.distance;
            }
        }
        if current < config.desired_distance {
            if self.prev_neighbor_distance < current {
                self.move_straight(config, rng, dt);
            } else {
                self.move_straight(config, rng, dt);
                self.turn_left(config, rng, dt);
            }
        } else if self.prev_neighbor_distance > current {
            self.move_straight(config, rng, dt);
        } else {
            self.move_straight(config, rng, dt);
            self.turn_right(config, rng, dt);
        }
        self.prev_neighbor_distance = current;
    }

    /// Whether no higher-priority mover forces this bot to yield the tick.
    fn clear_to_move(&self, config: &SwarmConfig) -> bool {
        let Some(mine) = self.activation else {
            return true;
        };
        let mut nearest_prior = f64::INFINITY;
        let mut any_prior = false;
        for obs in &self.neighbors {
            if !obs.state.is_moving() {
                continue;
            }
            let Some(theirs) = obs.activation else {
                continue;
            };
            if theirs >= mine {
                continue;
            }
            any_prior = true;
            if obs.distance < nearest_prior {
                nearest_prior = obs.distance;
            }
        }
        !any_prior || nearest_prior > config.yield_distance
    }

    fn join_shape(&mut self) {
        self.state = BotState::JoinedShape;
        self.post_join_timer = 0.0;
    }

    fn step_start(&mut self, config: &SwarmConfig, dt: f64) {
        if self.is_seed {
            self.state = BotState::JoinedShape;
            return;
        }
        self.form_gradient(config);
        self.startup_timer += dt;
        if self.startup_timer > config.startup_delay {
            self.state = BotState::WaitToMove;
        }
    }

    /// Deterministic wake ordering: highest gradient moves first, ties broken
    /// by highest id; any already-moving neighbor freezes the whole wave.
    fn step_wait_to_move(&mut self) {
        if self.neighbors.is_empty() {
            self.state = BotState::MoveWhileOutside;
            return;
        }
        if self.neighbors.iter().any(|obs| obs.state.is_moving()) {
            return;
        }
        let mut highest: Option<Gradient> = None;
        for obs in &self.neighbors {
            if obs.state == BotState::WaitToMove {
                highest = Some(match highest {
                    Some(current) => current.max(obs.gradient),
                    None => obs.gradient,
                });
            }
        }
        let Some(highest) = highest else {
            self.state = BotState::MoveWhileOutside;
            return;
        };
        if self.gradient > highest {
            self.state = BotState::MoveWhileOutside;
        } else if self.gradient == highest {
            let top_tied_id = self
                .neighbors
                .iter()
                .filter(|obs| obs.state == BotState::WaitToMove && obs.gradient == highest)
                .map(|obs| obs.sender)
                .max();
            if top_tied_id.is_some_and(|top| self.id > top) {
                self.state = BotState::MoveWhileOutside;
            }
        }
    }

    fn step_move_outside(
        &mut self,
        config: &SwarmConfig,
        shape: &dyn ShapeOracle,
        rng: &mut SmallRng,
        registry: &mut ActivationRegistry,
        dt: f64,
    ) {
        if self.activation.is_none() {
            self.activation = Some(registry.claim());
        }
        if shape.inside(self.perceived) {
            self.inside_streak += 1;
            if self.inside_streak > config.inside_shape_debounce {
                self.state = BotState::MoveWhileInside;
                return;
            }
        } else {
            self.inside_streak = 0;
        }
        if self.clear_to_move(config) {
            self.follow_edge(config, rng, dt);
        }
    }

    fn step_move_inside(
        &mut self,
        config: &SwarmConfig,
        shape: &dyn ShapeOracle,
        rng: &mut SmallRng,
        dt: f64,
    ) {
        if !shape.inside(self.perceived) {
            self.join_shape();
            return;
        }
        if let Some(nearest) = nearest_observation(&self.neighbors)
            && self.gradient == nearest.gradient
        {
            self.join_shape();
            return;
        }
        if self.clear_to_move(config) {
            self.follow_edge(config, rng, dt);
        }
    }

    fn step_joined(&mut self, config: &SwarmConfig, dt: f64) {
        self.updates_gradient = false;
        if self.localizing {
            self.post_join_timer += dt;
            if self.post_join_timer > config.post_join_grace {
                self.localizing = false;
            }
        }
    }

    fn state_step(
        &mut self,
        config: &SwarmConfig,
        shape: &dyn ShapeOracle,
        rng: &mut SmallRng,
        registry: &mut ActivationRegistry,
        dt: f64,
    ) {
        match self.state {
            BotState::Start => self.step_start(config, dt),
            BotState::WaitToMove => self.step_wait_to_move(),
            BotState::MoveWhileOutside => self.step_move_outside(config, shape, rng, registry, dt),
            BotState::MoveWhileInside => self.step_move_inside(config, shape, rng, dt),
            BotState::JoinedShape => self.step_joined(config, dt),
        }
    }

    fn update_color(&mut self) {
        self.color = if self.is_seed {
            SEED_COLOR
        } else {
            state_color(self.state)
        };
    }
}

/// Read-only per-bot fields handed to a rendering collaborator each tick.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BotView {
    pub id: BotId,
    pub position: Position,
    pub heading: f64,
    pub color: [f32; 3],
    pub state: BotState,
    pub gradient: Gradient,
    pub is_seed: bool,
    pub perceived_position: Position,
    pub selected: bool,
}

/// A bot completing assembly, with its localization error at that moment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JoinEvent {
    pub bot: BotId,
    pub location_error: f64,
    pub elapsed: f64,
}

/// Aggregate metrics emitted to the sink on the configured interval.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TickSummary {
    pub tick: Tick,
    /// Simulated seconds elapsed including this tick.
    pub elapsed: f64,
    pub bot_count: usize,
    pub joined: usize,
    /// Mean location error over joined bots, when any have joined.
    pub average_location_error: Option<f64>,
    /// Joins recorded since the previous flush.
    pub join_events: Vec<JoinEvent>,
}

/// Metrics sink invoked on the configured tick interval.
pub trait MetricsSink: Send {
    fn on_tick(&mut self, summary: &TickSummary);
}

/// No-op metrics sink.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn on_tick(&mut self, _summary: &TickSummary) {}
}

/// Events emitted after processing a swarm tick.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct TickEvents {
    pub tick: Tick,
    pub newly_joined: usize,
    pub metrics_flushed: bool,
}

/// The full swarm: bot collection in creation order plus the tick protocol.
pub struct Swarm {
    config: SwarmConfig,
    tick: Tick,
    elapsed: f64,
    rng: SmallRng,
    bots: Vec<Bot>,
    next_bot_id: u32,
    registry: ActivationRegistry,
    forward_speeds: Normal<f64>,
    turn_speeds: Normal<f64>,
    metrics: Box<dyn MetricsSink>,
    pending_joins: Vec<JoinEvent>,
    noise_scratch: Vec<f64>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for Swarm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Swarm")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("elapsed", &self.elapsed)
            .field("bot_count", &self.bots.len())
            .field("activations_issued", &self.registry.issued())
            .finish()
    }
}

impl Swarm {
    /// Instantiate a swarm from the supplied configuration.
    pub fn new(config: SwarmConfig) -> Result<Self, SwarmError> {
        Self::with_metrics(config, Box::new(NullMetrics))
    }

    /// Instantiate a swarm with a metrics sink attached.
    pub fn with_metrics(
        config: SwarmConfig,
        metrics: Box<dyn MetricsSink>,
    ) -> Result<Self, SwarmError> {
        config.validate()?;
        let forward_speeds = Normal::new(config.forward_speed_mean, config.forward_speed_std)
            .map_err(|_| SwarmError::InvalidConfig("forward speed distribution is degenerate"))?;
        let turn_speeds = Normal::new(config.turn_speed_mean, config.turn_speed_std)
            .map_err(|_| SwarmError::InvalidConfig("turn speed distribution is degenerate"))?;
        let rng = config.seeded_rng();
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            tick: Tick::zero(),
            elapsed: 0.0,
            rng,
            bots: Vec::new(),
            next_bot_id: 0,
            registry: ActivationRegistry::new(),
            forward_speeds,
            turn_speeds,
            metrics,
            pending_joins: Vec::new(),
            noise_scratch: Vec::new(),
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Simulated seconds elapsed since the start of the run.
    #[must_use]
    pub const fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// All bots in creation order.
    #[must_use]
    pub fn bots(&self) -> &[Bot] {
        &self.bots
    }

    /// Borrow one bot by id. Ids stay valid across [`Swarm::retain_joined`],
    /// so the index fast path falls back to a scan once the vec has gaps.
    #[must_use]
    pub fn bot(&self, id: BotId) -> Option<&Bot> {
        match self.bots.get(id.0 as usize) {
            Some(bot) if bot.id == id => Some(bot),
            _ => self.bots.iter().find(|bot| bot.id == id),
        }
    }

    /// Number of live bots.
    #[must_use]
    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }

    /// Read-only view of the activation registry.
    #[must_use]
    pub const fn registry(&self) -> &ActivationRegistry {
        &self.registry
    }

    /// Replace the metrics sink.
    pub fn set_metrics(&mut self, metrics: Box<dyn MetricsSink>) {
        self.metrics = metrics;
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Toggle the presentation-only selection flag on a bot.
    pub fn set_selected(&mut self, id: BotId, selected: bool) {
        if let Some(bot) = self.bots.iter_mut().find(|bot| bot.id == id) {
            bot.selected = selected;
        }
    }

    /// Spawn one bot, drawing its per-unit speeds from the configured
    /// distributions (manufacturing variance; means exactly when movement
    /// noise is disabled).
    pub fn spawn_bot(&mut self, position: Position, heading: f64, is_seed: bool) -> BotId {
        let id = BotId(self.next_bot_id);
        self.next_bot_id += 1;
        let (forward_speed, turn_speed) = if self.config.movement_noise {
            (
                self.forward_speeds.sample(&mut self.rng),
                self.turn_speeds.sample(&mut self.rng),
            )
        } else {
            (self.config.forward_speed_mean, self.config.turn_speed_mean)
        };
        self.bots
            .push(Bot::new(id, position, heading, is_seed, forward_speed, turn_speed));
        id
    }

    /// Place the four stationary seeds in a cross around the shape origin.
    pub fn spawn_seed_cross(&mut self, origin: Position) {
        let offset = 1.5 * self.config.bot_radius;
        self.spawn_bot(Position::new(origin.x - offset, origin.y), 0.0, true);
        self.spawn_bot(
            Position::new(origin.x + offset, origin.y),
            std::f64::consts::PI,
            true,
        );
        self.spawn_bot(
            Position::new(origin.x, origin.y - offset),
            std::f64::consts::FRAC_PI_2,
            true,
        );
        self.spawn_bot(
            Position::new(origin.x, origin.y + offset),
            -std::f64::consts::FRAC_PI_2,
            true,
        );
    }

    /// Place a diagonally staggered grid of idle bots growing down-left from
    /// `start`, with random initial headings.
    pub fn spawn_staggered_grid(&mut self, rows: u32, cols: u32, start: Position) {
        let spacing = 2.5 * self.config.bot_radius;
        let stagger = 1.25 * self.config.bot_radius;
        for row in 0..rows {
            let offset = if row % 2 == 0 { 0.0 } else { stagger };
            for col in 0..cols {
                let position = Position::new(
                    start.x - f64::from(col) * spacing + offset,
                    start.y + f64::from(row) * spacing,
                );
                let heading = self.rng.random_range(0.0..FULL_TURN);
                self.spawn_bot(position, heading, false);
            }
        }
    }

    /// Standard experiment layout: seed cross at the shape origin plus the
    /// configured start grid below-left of it.
    pub fn populate(&mut self, shape_origin: Position) {
        self.spawn_seed_cross(shape_origin);
        let spacing = 2.5 * self.config.bot_radius;
        let grid_origin = Position::new(shape_origin.x - spacing, shape_origin.y + spacing);
        self.spawn_staggered_grid(self.config.grid_rows, self.config.grid_cols, grid_origin);
    }

    /// Drop every bot that has not joined the shape. Ids of the survivors are
    /// unchanged; intended for post-run analysis, not for use mid-assembly.
    pub fn retain_joined(&mut self) {
        self.bots.retain(|bot| bot.state == BotState::JoinedShape);
    }

    /// Number of bots currently in `JoinedShape`.
    #[must_use]
    pub fn joined_count(&self) -> usize {
        self.bots
            .iter()
            .filter(|bot| bot.state == BotState::JoinedShape)
            .count()
    }

    /// Mean location error over joined bots, `None` before the first join.
    #[must_use]
    pub fn average_location_error(&self) -> Option<f64> {
        let mut total = 0.0;
        let mut count = 0usize;
        for bot in &self.bots {
            if bot.state == BotState::JoinedShape {
                total += bot.location_error();
                count += 1;
            }
        }
        (count > 0).then(|| total / count as f64)
    }

    /// Snapshot the presentation-facing fields of every bot.
    #[must_use]
    pub fn render_view(&self) -> Vec<BotView> {
        self.bots
            .iter()
            .map(|bot| BotView {
                id: bot.id,
                position: bot.position,
                heading: bot.heading,
                color: bot.color,
                state: bot.state,
                gradient: bot.gradient,
                is_seed: bot.is_seed,
                perceived_position: bot.perceived,
                selected: bot.selected,
            })
            .collect()
    }

    /// Rebuild every bot's neighbor snapshot from tick-start state.
    ///
    /// Noise factors are drawn sequentially in sender-major order (one per
    /// ordered pair, drawn before the range test) so the RNG stream does not
    /// depend on geometry; the per-receiver assembly then runs in parallel
    /// over the frozen public state.
    fn stage_sense(&mut self) {
        for bot in &mut self.bots {
            bot.neighbors.clear();
        }
        let n = self.bots.len();
        if n < 2 {
            return;
        }

        let publics: Vec<BotPublic> = self.bots.iter().map(Bot::public_state).collect();

        self.noise_scratch.clear();
        self.noise_scratch.resize(n * n, 0.0);
        let bound = self.config.distance_error;
        if self.config.distance_noise && bound > 0.0 {
            for sender in 0..n {
                for receiver in 0..n {
                    if sender == receiver {
                        continue;
                    }
                    self.noise_scratch[sender * n + receiver] = self.rng.random_range(-bound..bound);
                }
            }
        }

        let broadcast = self.config.broadcast_radius;
        let noise = &self.noise_scratch;
        let snapshots: Vec<Vec<NeighborObservation>> = (0..n)
            .into_par_iter()
            .map(|receiver| {
                let here = publics[receiver].position;
                let mut observations = Vec::new();
                for (sender, public) in publics.iter().enumerate() {
                    if sender == receiver {
                        continue;
                    }
                    let true_distance = here.distance_to(public.position);
                    let measured = true_distance * (1.0 + noise[sender * n + receiver]);
                    if measured > broadcast {
                        continue;
                    }
                    observations.push(NeighborObservation {
                        sender: public.id,
                        distance: measured,
                        gradient: public.gradient,
                        state: public.state,
                        activation: public.activation,
                        perceived: public.perceived,
                        position: public.position,
                    });
                }
                observations
            })
            .collect();

        for (bot, observations) in self.bots.iter_mut().zip(snapshots) {
            bot.neighbors = observations;
        }
    }

    /// Run every bot's update against its frozen snapshot, in creation order.
    fn stage_update(&mut self, shape: &dyn ShapeOracle, dt: f64) -> usize {
        let Self {
            config,
            bots,
            rng,
            registry,
            pending_joins,
            elapsed,
            ..
        } = self;
        let now = *elapsed + dt;
        let mut newly_joined = 0usize;
        for bot in bots.iter_mut() {
            let before = bot.state;
            bot.form_gradient(config);
            match config.localization {
                LocalizationMode::Trilateration => bot.localize(),
                LocalizationMode::Perfect => bot.perfect_localize(),
            }
            bot.state_step(config, shape, rng, registry, dt);
            bot.update_color();
            if before != BotState::JoinedShape && bot.state == BotState::JoinedShape {
                pending_joins.push(JoinEvent {
                    bot: bot.id,
                    location_error: bot.location_error(),
                    elapsed: now,
                });
                newly_joined += 1;
            }
        }
        newly_joined
    }

    fn stage_metrics(&mut self, next_tick: Tick) -> bool {
        let interval = self.config.metrics_interval;
        if interval == 0 || !next_tick.0.is_multiple_of(u64::from(interval)) {
            return false;
        }
        let summary = TickSummary {
            tick: next_tick,
            elapsed: self.elapsed + self.config.tick_seconds,
            bot_count: self.bots.len(),
            joined: self.joined_count(),
            average_location_error: self.average_location_error(),
            join_events: std::mem::take(&mut self.pending_joins),
        };
        self.metrics.on_tick(&summary);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        true
    }

    /// Execute one synchronous tick: sense, update, metrics.
    pub fn step(&mut self, shape: &dyn ShapeOracle) -> TickEvents {
        let next_tick = self.tick.next();
        let dt = self.config.tick_seconds;
        self.stage_sense();
        let newly_joined = self.stage_update(shape, dt);
        let metrics_flushed = self.stage_metrics(next_tick);
        self.tick = next_tick;
        self.elapsed += dt;
        TickEvents {
            tick: next_tick,
            newly_joined,
            metrics_flushed,
        }
    }
}
