//! JSON flow documents.
//!
//! A document is either a list of flows (`[{"id": .., "steps": [..]}, ..]`,
//! the first one being the entry point) or a bare list of steps.  Packets are
//! hex dumps; `port` and `delay_millis` may be left out.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::FlowError;
use crate::flow::{self, Flow, FlowDef, FlowStep, StepDef};

#[derive(Deserialize)]
#[serde(untagged)]
enum Document {
    Flows(Vec<FlowDef>),
    Steps(Vec<StepDef>),
}

/// Parse and resolve a flow document.  An empty document is an empty flow.
pub fn parse(text: &str) -> Result<Flow, FlowError> {
    let defs = match serde_json::from_str::<Document>(text)? {
        Document::Flows(defs) => defs,
        Document::Steps(steps) => vec![FlowDef { id: None, steps }],
    };
    if defs.is_empty() {
        return Ok(Flow::default());
    }
    flow::resolve(&defs)
}

pub fn load(path: impl AsRef<Path>) -> Result<Flow, FlowError> {
    let path = path.as_ref();
    log::debug!("loading flow from {}", path.display());
    parse(&fs::read_to_string(path)?)
}

/// Single-flow document for `flow`, leaving out ports that repeat the
/// inherited one and zero delays.
pub fn to_defs(flow: &Flow) -> Vec<FlowDef> {
    let mut port = 0;
    vec![FlowDef {
        id: flow.id.clone(),
        steps: unresolve(&flow.steps, &mut port),
    }]
}

fn unresolve(steps: &[FlowStep], port: &mut u16) -> Vec<StepDef> {
    steps
        .iter()
        .map(|step| match step {
            FlowStep::Send(send) => StepDef::Send {
                data: send.packet.clone(),
                delay_millis: send.delay_millis,
                port: explicit_port(send.port, port),
            },
            FlowStep::Receive(receive) => StepDef::Receive {
                data: receive.packet.clone(),
                port: explicit_port(receive.port, port),
            },
            FlowStep::Parallel(parallel) => StepDef::Parallel {
                forks: parallel
                    .forks
                    .iter()
                    .map(|fork| unresolve(fork, &mut port.clone()))
                    .collect(),
            },
        })
        .collect()
}

/// `Some(step_port)` when it differs from the inherited `port`, which then
/// becomes the new context.
fn explicit_port(step_port: u16, port: &mut u16) -> Option<u16> {
    if step_port == *port {
        None
    } else {
        *port = step_port;
        Some(step_port)
    }
}

pub fn to_string(flow: &Flow) -> Result<String, FlowError> {
    Ok(serde_json::to_string_pretty(&to_defs(flow))?)
}

pub fn save(flow: &Flow, path: impl AsRef<Path>) -> Result<(), FlowError> {
    let path = path.as_ref();
    fs::write(path, to_string(flow)?)?;
    log::info!("flow written to {}", path.display());
    Ok(())
}
