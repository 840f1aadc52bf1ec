//! Scenario driver: loads a JSON scenario, runs the simulation to its end
//! time and exports CSV trajectories and PNG heatmaps.

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use throng_core::{
    AgentId, AgentSeed, DynamicNavigationMap, GoalReachingPolicy, PolicyKey, ThrongConfig,
    Topology, TrajectoryBatch, TrajectoryRecorder, TrajectorySample, Vec2, WorldState,
};
use throng_output::{CsvLayout, CsvTrajectoryWriter, HeatmapWriter, ObstacleMask};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "throng",
    version,
    about = "Run a crowd-simulation scenario and export trajectories"
)]
struct Cli {
    /// JSON file describing the scenario to run.
    #[arg(short, long)]
    input: PathBuf,

    /// Folder for CSV trajectory output; omit to skip trajectory export.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write one CSV file per agent instead of one per sampled timestep.
    #[arg(long)]
    by_agent: bool,

    /// Flush by-agent rows to disk as soon as they are sampled.
    #[arg(long)]
    immediate_flush: bool,

    /// Folder for PNG heatmap output; omit to skip heatmaps.
    #[arg(long)]
    heatmap: Option<PathBuf>,

    /// Number of worker threads; zero keeps the rayon default.
    #[arg(short = 't', long, default_value_t = 0)]
    threads: usize,
}

/// A complete simulation scenario. `config` is a sparse patch applied
/// over the default world configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    /// Simulated seconds to run.
    end_time: f32,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    policies: Vec<PolicySpec>,
    #[serde(default)]
    maps: Vec<MapSpec>,
    #[serde(default)]
    obstacles: Vec<Vec<[f32; 2]>>,
    #[serde(default)]
    agents: Vec<AgentSpec>,
    /// Simulated seconds between CSV samples.
    #[serde(default = "default_write_interval")]
    write_interval: f32,
    /// Simulated seconds between heatmap frames.
    #[serde(default = "default_heatmap_interval")]
    heatmap_interval: f32,
    /// Heatmap cell grid, defaulting to the periodic world box.
    #[serde(default)]
    heatmap_size: Option<[usize; 2]>,
}

fn default_write_interval() -> f32 {
    throng_output::DEFAULT_WRITE_INTERVAL
}

fn default_heatmap_interval() -> f32 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PolicySpec {
    name: String,
    relaxation_time: f32,
    contact_stiffness: f32,
    interaction_range: f32,
    coarse_only: bool,
}

impl Default for PolicySpec {
    fn default() -> Self {
        let reference = GoalReachingPolicy::default();
        Self {
            name: "goal-reaching".to_owned(),
            relaxation_time: reference.relaxation_time,
            contact_stiffness: reference.contact_stiffness,
            interaction_range: reference.interaction_range,
            coarse_only: reference.coarse_only,
        }
    }
}

impl PolicySpec {
    fn build(&self) -> GoalReachingPolicy {
        GoalReachingPolicy {
            relaxation_time: self.relaxation_time,
            contact_stiffness: self.contact_stiffness,
            interaction_range: self.interaction_range,
            coarse_only: self.coarse_only,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MapSpec {
    goal: [f32; 2],
    width: usize,
    height: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentSpec {
    position: [f32; 2],
    #[serde(default)]
    velocity: [f32; 2],
    /// Defaults to the starting position (the agent stands still).
    #[serde(default)]
    goal: Option<[f32; 2]>,
    /// Name of a declared policy; defaults to the first declaration.
    #[serde(default)]
    policy: Option<String>,
    #[serde(default)]
    start_time: f32,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    radius: Option<f32>,
    #[serde(default)]
    preferred_speed: Option<f32>,
    #[serde(default)]
    max_speed: Option<f32>,
    #[serde(default)]
    max_acceleration: Option<f32>,
    #[serde(default)]
    color: Option<[u8; 3]>,
    #[serde(default)]
    remove_at_goal: bool,
}

impl AgentSpec {
    fn seed(&self) -> AgentSeed {
        let mut seed = AgentSeed::at(Vec2::new(self.position[0], self.position[1]));
        seed.velocity = Vec2::new(self.velocity[0], self.velocity[1]);
        if let Some([x, y]) = self.goal {
            seed.goal = Vec2::new(x, y);
        }
        if let Some(radius) = self.radius {
            seed.radius = radius;
        }
        if let Some(speed) = self.preferred_speed {
            seed.preferred_speed = speed;
        }
        if let Some(speed) = self.max_speed {
            seed.max_speed = speed;
        }
        if let Some(acceleration) = self.max_acceleration {
            seed.max_acceleration = acceleration;
        }
        if let Some(color) = self.color {
            seed.color = color;
        }
        seed.remove_at_goal = self.remove_at_goal;
        seed
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Cli::parse();
    if args.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(args.threads)
            .build_global()
            .context("failed to size the worker pool")?;
    }
    let raw = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read scenario {}", args.input.display()))?;
    let scenario: Scenario =
        serde_json::from_str(&raw).context("failed to parse the scenario file")?;
    if !(scenario.end_time > 0.0) {
        bail!("scenario end_time must be positive");
    }
    info!(
        scenario = %args.input.display(),
        end_time = scenario.end_time,
        "starting simulation"
    );
    run(&scenario, &args)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn run(scenario: &Scenario, args: &Cli) -> Result<()> {
    let mut world = build_world(scenario)?;
    let fine = world.config().fine_delta_time;
    let ticks = (scenario.end_time / fine).ceil() as u64;

    let mut csv = match &args.output {
        Some(directory) => {
            let layout = if args.by_agent {
                CsvLayout::ByAgent {
                    immediate_flush: args.immediate_flush,
                }
            } else {
                CsvLayout::ByTimestep
            };
            Some(CsvTrajectoryWriter::with_write_interval(
                directory,
                layout,
                scenario.write_interval,
            )?)
        }
        None => {
            warn!("no output folder specified; trajectories will not be written");
            None
        }
    };
    let mut heatmap = match &args.heatmap {
        Some(directory) => {
            let (width, height) = heatmap_dimensions(scenario, world.config());
            let mask = ObstacleMask::from_segments(width, height, world.obstacle_edges());
            Some((HeatmapWriter::create(directory)?, mask, width, height))
        }
        None => None,
    };

    // Initial poses and occupancy, before the first tick.
    if let Some(writer) = csv.as_mut() {
        writer.record(&pose_batch(&world))?;
    }
    if let Some((writer, mask, width, height)) = heatmap.as_mut() {
        writer.write(&world.occupancy_counts(*width, *height), mask)?;
    }

    let mut heat_time = 0.0f32;
    for _ in 0..ticks {
        let summary = world.step()?;
        if let Some(writer) = csv.as_mut() {
            writer.on_tick(&pose_batch(&world));
        }
        if let Some((writer, mask, width, height)) = heatmap.as_mut() {
            heat_time += fine;
            if heat_time >= scenario.heatmap_interval {
                heat_time = 0.0;
            }
            if heat_time == 0.0 {
                writer.write(&world.occupancy_counts(*width, *height), mask)?;
            }
        }
        if summary.tick.value() % 100 == 0 {
            info!(
                tick = summary.tick.value(),
                agents = summary.agent_count,
                mean_density = summary.mean_density,
                max_speed = summary.max_speed,
                "advanced"
            );
        }
    }

    if let Some(writer) = csv.as_mut() {
        writer.finish()?;
    }
    if let Some(summary) = world.history().back() {
        info!(
            tick = summary.tick.value(),
            time = summary.time,
            agents = summary.agent_count,
            "simulation finished"
        );
    }
    Ok(())
}

fn build_world(scenario: &Scenario) -> Result<WorldState> {
    let config = world_config(scenario)?;
    let mut world = WorldState::new(config)?;

    let mut keys: HashMap<&str, PolicyKey> = HashMap::new();
    let mut default_key: Option<PolicyKey> = None;
    for spec in &scenario.policies {
        let key = world.register_policy(Box::new(spec.build()));
        default_key.get_or_insert(key);
        keys.insert(spec.name.as_str(), key);
    }
    let default_key = default_key
        .unwrap_or_else(|| world.register_policy(Box::new(GoalReachingPolicy::default())));

    // Maps and obstacles go in before agents so that insertion-time
    // navigation-map assignment sees them.
    for spec in &scenario.maps {
        let map =
            DynamicNavigationMap::uniform(Vec2::new(spec.goal[0], spec.goal[1]), spec.width, spec.height)?;
        world.add_navigation_map(map);
    }
    for polyline in &scenario.obstacles {
        let points: Vec<Vec2> = polyline
            .iter()
            .map(|point| Vec2::new(point[0], point[1]))
            .collect();
        world.add_obstacle(&points)?;
    }
    for spec in &scenario.agents {
        let key = match &spec.policy {
            Some(name) => *keys
                .get(name.as_str())
                .with_context(|| format!("agent references unknown policy `{name}`"))?,
            None => default_key,
        };
        world.schedule_agent(spec.seed(), key, spec.id.map(AgentId::new), spec.start_time)?;
    }
    Ok(world)
}

/// Applies the scenario's sparse `config` patch over the defaults.
fn world_config(scenario: &Scenario) -> Result<ThrongConfig> {
    let mut value =
        serde_json::to_value(ThrongConfig::default()).context("failed to encode defaults")?;
    if !scenario.config.is_null() {
        let mut path = Vec::new();
        merge_value(&mut value, &scenario.config, &mut path)?;
    }
    serde_json::from_value(value).context("invalid scenario config")
}

/// Recursive merge of a patch object onto a target value. Scalars and
/// arrays replace; objects merge key by key, except that a tagged enum
/// switching variants (a differing `kind`) replaces wholesale. Unknown
/// keys are an error so typos don't silently fall back to defaults.
fn merge_value(target: &mut Value, patch: &Value, path: &mut Vec<String>) -> Result<()> {
    let same_shape = target.is_object()
        && patch.is_object()
        && match (target.get("kind"), patch.get("kind")) {
            (Some(current), Some(requested)) => current == requested,
            _ => true,
        };
    if !same_shape {
        *target = patch.clone();
        return Ok(());
    }
    if let Value::Object(patch_map) = patch {
        for (key, patch_value) in patch_map {
            path.push(key.clone());
            let Some(slot) = target.get_mut(key) else {
                bail!("unknown configuration field `{}`", path.join("."));
            };
            merge_value(slot, patch_value, path)?;
            path.pop();
        }
    }
    Ok(())
}

fn heatmap_dimensions(scenario: &Scenario, config: &ThrongConfig) -> (usize, usize) {
    if let Some([width, height]) = scenario.heatmap_size {
        return (width, height);
    }
    match config.topology {
        Topology::Periodic { width, height } => (width.ceil() as usize, height.ceil() as usize),
        Topology::Unbounded => (64, 64),
    }
}

fn pose_batch(world: &WorldState) -> TrajectoryBatch {
    let samples = world
        .agent_snapshots()
        .into_iter()
        .map(|snapshot| TrajectorySample {
            id: snapshot.id,
            position: snapshot.position,
            orientation: snapshot.viewing_direction,
            color: snapshot.color,
        })
        .collect();
    TrajectoryBatch {
        tick: world.tick(),
        time: world.time(),
        samples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_scenarios_parse_with_defaults() {
        let scenario: Scenario = serde_json::from_str(
            r#"{ "end_time": 10.0, "agents": [ { "position": [1.0, 2.0] } ] }"#,
        )
        .expect("scenario");
        assert_eq!(scenario.agents.len(), 1);
        assert_eq!(scenario.write_interval, 0.2);
        assert_eq!(scenario.heatmap_interval, 5.0);
        let seed = scenario.agents[0].seed();
        assert_eq!(seed.position, Vec2::new(1.0, 2.0));
        assert_eq!(seed.goal, seed.position, "goal defaults to the start");
    }

    #[test]
    fn config_patches_merge_and_reject_unknown_fields() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "end_time": 1.0,
                "config": {
                    "coarse_delta_time": 0.5,
                    "sph": { "enabled": true },
                    "topology": { "kind": "periodic", "width": 20.0, "height": 10.0 }
                }
            }"#,
        )
        .expect("scenario");
        let config = world_config(&scenario).expect("config");
        assert_eq!(config.coarse_delta_time, 0.5);
        assert_eq!(config.fine_delta_time, 0.1, "untouched fields keep defaults");
        assert!(config.sph.enabled);
        assert_eq!(config.sph.gas_constant, 200.0);
        assert_eq!(
            config.topology,
            Topology::Periodic {
                width: 20.0,
                height: 10.0
            }
        );

        let scenario: Scenario = serde_json::from_str(
            r#"{ "end_time": 1.0, "config": { "fine_dt": 0.05 } }"#,
        )
        .expect("scenario");
        let error = world_config(&scenario).expect_err("unknown field");
        assert!(error.to_string().contains("fine_dt"));
    }

    #[test]
    fn worlds_build_from_scenarios() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "end_time": 5.0,
                "policies": [ { "name": "calm", "relaxation_time": 1.0 } ],
                "maps": [ { "goal": [5.0, 5.0], "width": 10, "height": 10 } ],
                "obstacles": [ [ [0.0, 0.0], [4.0, 0.0], [4.0, 4.0] ] ],
                "agents": [
                    { "position": [1.0, 1.0], "goal": [5.0, 5.0], "policy": "calm" },
                    { "position": [2.0, 1.0], "start_time": 1.5 }
                ]
            }"#,
        )
        .expect("scenario");
        let world = build_world(&scenario).expect("world");
        assert_eq!(world.agent_count(), 1, "the scheduled agent is not live yet");
        assert_eq!(
            world.obstacle_edges().len(),
            3,
            "a three-point outline closes into a triangle"
        );
        assert_eq!(world.navigation_maps().len(), 1);
    }

    #[test]
    fn unknown_policy_references_are_rejected() {
        let scenario: Scenario = serde_json::from_str(
            r#"{
                "end_time": 5.0,
                "agents": [ { "position": [0.0, 0.0], "policy": "missing" } ]
            }"#,
        )
        .expect("scenario");
        let error = build_world(&scenario).expect_err("unknown policy");
        assert!(error.to_string().contains("missing"));
    }
}
