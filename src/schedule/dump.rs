use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::scheduler::{BufferAssignment, SubgraphSchedule};
use crate::error::Result;
use crate::model::{MemoryRegion, OutputRef};

/// On-disk representation of a schedule dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpFormat {
    Text,
    Json,
}

/// Render `schedule` and its callees as a human-readable listing
pub fn to_text(schedule: &SubgraphSchedule) -> String {
    let mut out = String::new();
    write_subgraph(&mut out, schedule, 0);
    out
}

/// Render `schedule` as pretty-printed JSON
pub fn to_json(schedule: &SubgraphSchedule) -> Result<String> {
    Ok(serde_json::to_string_pretty(schedule)?)
}

/// Write a dump of `schedule` to `path`
pub fn write_dump(schedule: &SubgraphSchedule, path: impl AsRef<Path>, format: DumpFormat) -> Result<()> {
    let contents = match format {
        DumpFormat::Text => to_text(schedule),
        DumpFormat::Json => to_json(schedule)?,
    };
    fs::write(path, contents)?;
    Ok(())
}

fn operand(assignments: &HashMap<OutputRef, &BufferAssignment>, output: &OutputRef) -> String {
    match assignments.get(output) {
        Some(assignment) => format!("{}@{}+{:#x}", output, assignment.region, assignment.start),
        None => format!("{}@?", output),
    }
}

// Writing into a String cannot fail, so the fmt results are ignored
fn write_subgraph(out: &mut String, schedule: &SubgraphSchedule, depth: usize) {
    let pad = "  ".repeat(depth);
    let _ = writeln!(
        out,
        "{}subgraph {} ages [{}, {})",
        pad, schedule.name, schedule.start_age, schedule.end_age
    );

    let _ = writeln!(out, "{}peak usage:", pad);
    for region in MemoryRegion::iter() {
        if let Some(usage) = schedule.peak_usage.get(&region) {
            let _ = writeln!(out, "{}  {:<18}{}", pad, region.to_string(), usage);
        }
    }

    let _ = writeln!(out, "{}buffers:", pad);
    for assignment in &schedule.assignments {
        let lifetime = schedule
            .logical_buffers
            .get(assignment.logical)
            .map(|buffer| format!("[{}, {}]", buffer.lifetime.birth, buffer.lifetime.end()))
            .unwrap_or_default();
        let view = match assignment.view_of {
            Some(parent) => format!(" view of lb{}", parent),
            None => String::new(),
        };
        let _ = writeln!(
            out,
            "{}  lb{:<4}{} {:?} {} {} {}{:?} strides {:?} live {} pb{}{}",
            pad,
            assignment.logical,
            assignment.output,
            assignment.name,
            assignment.region,
            assignment.span(),
            assignment.data_type,
            assignment.shape,
            assignment.strides,
            lifetime,
            assignment.physical,
            view
        );
    }

    let by_output: HashMap<OutputRef, &BufferAssignment> = schedule
        .assignments
        .iter()
        .map(|assignment| (assignment.output, assignment))
        .collect();
    let _ = writeln!(out, "{}instructions:", pad);
    for instruction in &schedule.instructions {
        let inputs: Vec<String> = instruction.inputs.iter().map(|input| operand(&by_output, input)).collect();
        let outputs: Vec<String> = instruction
            .outputs
            .iter()
            .map(|output| operand(&by_output, output))
            .collect();
        let _ = writeln!(
            out,
            "{}  %{:<4}{:<10}({}) -> ({}){}",
            pad,
            instruction.node,
            instruction.op,
            inputs.join(", "),
            outputs.join(", "),
            if instruction.elided { " elided" } else { "" }
        );
    }

    for callee in &schedule.callees {
        let _ = writeln!(out, "{}callee of %{}:", pad, callee.call_node);
        write_subgraph(out, &callee.schedule, depth + 1);
    }
}
