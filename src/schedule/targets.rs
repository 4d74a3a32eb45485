use std::collections::BTreeMap;

use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use super::options::ScheduleOptions;
use super::scheduler::{BufferScheduler, SubgraphSchedule};
use crate::error::{Error, Result};
use crate::memory::AllocatorRegistry;
use crate::model::{Graph, MemoryRegion};

/// Subgraphs assigned to one hardware target, with that target's registry
#[derive(Debug)]
pub struct TargetSubgraphs {
    pub target: String,
    pub registry: AllocatorRegistry,
    pub subgraphs: Vec<Graph>,
}

impl TargetSubgraphs {
    pub fn new(target: impl Into<String>, registry: AllocatorRegistry) -> Self {
        Self {
            target: target.into(),
            registry,
            subgraphs: Vec::new(),
        }
    }

    pub fn with_subgraph(mut self, graph: Graph) -> Self {
        self.subgraphs.push(graph);
        self
    }
}

/// Schedules of every subgraph of one target
#[derive(Debug, Serialize)]
pub struct TargetSchedule {
    pub target: String,
    pub subgraphs: Vec<SubgraphSchedule>,
    /// Arena sizes the target's runtime must preallocate
    pub peak_usage: BTreeMap<MemoryRegion, usize>,
    #[serde(skip)]
    pub registry: AllocatorRegistry,
}

/// Schedules of every target of a model
#[derive(Debug, Serialize)]
pub struct ModelSchedule {
    pub targets: Vec<TargetSchedule>,
    /// Per-region sum of the targets' peaks
    pub total_peak_usage: BTreeMap<MemoryRegion, usize>,
}

impl ModelSchedule {
    pub fn target(&self, name: &str) -> Option<&TargetSchedule> {
        self.targets.iter().find(|target| target.target == name)
    }
}

/// Schedule the subgraphs of one target in order, sharing its registry
pub fn schedule_target(target: TargetSubgraphs, options: &ScheduleOptions) -> Result<TargetSchedule> {
    let TargetSubgraphs {
        target,
        mut registry,
        subgraphs,
    } = target;

    let mut schedules = Vec::with_capacity(subgraphs.len());
    let mut peak_usage: BTreeMap<MemoryRegion, usize> = BTreeMap::new();
    {
        let mut scheduler = BufferScheduler::new(&mut registry, options.clone());
        for graph in &subgraphs {
            let schedule = scheduler.schedule(graph)?;
            for (region, usage) in schedule.total_peak_usage() {
                let peak = peak_usage.entry(region).or_insert(0);
                *peak = (*peak).max(usage);
            }
            schedules.push(schedule);
        }
    }

    debug!("target '{}': {} subgraphs, peaks {:?}", target, schedules.len(), peak_usage);
    Ok(TargetSchedule {
        target,
        subgraphs: schedules,
        peak_usage,
        registry,
    })
}

/// Schedule independent targets in parallel.
///
/// Every target owns its registry, so no allocator is touched by two threads.
/// Results keep the order of `targets`.
pub fn schedule_targets(targets: Vec<TargetSubgraphs>, options: &ScheduleOptions) -> Result<ModelSchedule> {
    let run = |targets: Vec<TargetSubgraphs>| -> Result<Vec<TargetSchedule>> {
        targets
            .into_par_iter()
            .map(|target| schedule_target(target, options))
            .collect()
    };

    let targets = if options.thread_count > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.thread_count)
            .build()
            .map_err(|err| Error::InvalidConfig(format!("Failed to build scheduling thread pool: {}", err)))?;
        pool.install(|| run(targets))?
    } else {
        run(targets)?
    };

    let mut total_peak_usage: BTreeMap<MemoryRegion, usize> = BTreeMap::new();
    for target in &targets {
        for (&region, &usage) in &target.peak_usage {
            *total_peak_usage.entry(region).or_insert(0) += usage;
        }
    }
    Ok(ModelSchedule {
        targets,
        total_peak_usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::model::DataType;

    fn chain(name: &str, width: usize) -> Graph {
        let mut builder = GraphBuilder::new(name);
        let x = builder.input("x", DataType::Float32, vec![width]);
        let a = builder.compute("a", "Relu", &[x], DataType::Float32, vec![width]).unwrap();
        builder.output("out", a).unwrap();
        builder.build()
    }

    #[test]
    fn test_peaks_sum_across_targets() {
        let targets = vec![
            TargetSubgraphs::new("cpu", AllocatorRegistry::new()).with_subgraph(chain("cpu_main", 4)),
            TargetSubgraphs::new("npu", AllocatorRegistry::new()).with_subgraph(chain("npu_main", 8)),
        ];
        let model = schedule_targets(targets, &ScheduleOptions::default()).unwrap();
        assert_eq!(model.targets[0].target, "cpu");
        assert_eq!(model.target("npu").unwrap().peak_usage[&MemoryRegion::Input], 32);
        assert_eq!(model.total_peak_usage[&MemoryRegion::Input], 48);
    }

    #[test]
    fn test_dedicated_thread_pool() {
        let targets = vec![TargetSubgraphs::new("cpu", AllocatorRegistry::new()).with_subgraph(chain("main", 2))];
        let options = ScheduleOptions::default().set_thread_count(2);
        let model = schedule_targets(targets, &options).unwrap();
        assert_eq!(model.total_peak_usage[&MemoryRegion::Output], 8);
    }
}
