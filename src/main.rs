use warehouse_mapf::config::{Cli, Config};
use warehouse_mapf::map::WorldGraph;
use warehouse_mapf::render::TracingSink;
use warehouse_mapf::scenario::Scenario;
use warehouse_mapf::scheduler::Simulation;

use anyhow::{anyhow, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let config = if let Some(config_file) = cli.config.as_ref() {
        let config_str = std::fs::read_to_string(config_file)
            .with_context(|| format!("cannot read config file: {config_file}"))?;
        Config::from_yaml_str(&config_str)
            .with_context(|| format!("error with config file: {config_file}"))?
    } else {
        info!("No config file specified, using default config");
        Config::default()
    }
    .override_from_command_line(&cli)?;

    let graph = WorldGraph::from_file(&config.map_path)
        .with_context(|| format!("error loading map {}", config.map_path))?;
    let scenario = match &config.scenario_path {
        Some(path) => Scenario::load_from_file(path)?,
        None => Scenario::default(),
    };

    let mut simulation = Simulation::new(graph, &config).with_sink(Box::new(TracingSink));
    for agent in &scenario.agents {
        simulation
            .add_agent(agent.name.clone(), agent.start)
            .with_context(|| format!("cannot place agent {}", agent.name))?;
    }

    if config.num_agents > scenario.agents.len() {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let occupied: HashSet<_> = simulation.fleet().iter().map(|agent| agent.position).collect();
        let extra = Scenario::generate_agents_randomly(
            simulation.graph(),
            &occupied,
            config.num_agents - scenario.agents.len(),
            &mut rng,
        )
        .map_err(|err| anyhow!(err))?;
        for agent in extra {
            simulation.add_agent(agent.name, agent.start)?;
        }
    }

    for task in &scenario.tasks {
        simulation
            .add_task(task.name.clone(), task.pickup, task.dropoff, task.time_limit)
            .with_context(|| format!("cannot create task {}", task.name))?;
    }

    let stats = simulation.run(config.ticks)?;
    stats.print();
    stats.write_json(&config.output_path)?;

    Ok(())
}
