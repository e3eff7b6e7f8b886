//! Flow data model and load-time resolution.
//!
//! Two representations live here:
//!
//! - [`StepDef`] / [`FlowDef`]: what a flow document contains.  Ports are
//!   optional and a step may `include` another flow of the same document.
//! - [`FlowStep`] / [`Flow`]: what the driver executes.  Every send and
//!   receive carries a concrete logical port and no includes remain.
//!
//! [`resolve`] turns the former into the latter.  Port `0` on a resolved step
//! stands for the orchestrator's default port.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::packet::Packet;

// ---------------------------------------------------------------------------
// Resolved model
// ---------------------------------------------------------------------------

/// Write `packet` to the connection bound to `port` after `delay_millis`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendStep {
    pub packet: Packet,
    pub delay_millis: u64,
    pub port: u16,
}

/// Wait until `packet` shows up in the stream of the connection bound to `port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveStep {
    pub packet: Packet,
    pub port: u16,
}

/// Independent step sequences executed concurrently, joined before the
/// next step starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParallelStep {
    pub forks: Vec<Vec<FlowStep>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStep {
    Send(SendStep),
    Receive(ReceiveStep),
    Parallel(ParallelStep),
}

impl FlowStep {
    pub fn send(packet: impl Into<Packet>, delay_millis: u64, port: u16) -> Self {
        FlowStep::Send(SendStep {
            packet: packet.into(),
            delay_millis,
            port,
        })
    }

    pub fn receive(packet: impl Into<Packet>, port: u16) -> Self {
        FlowStep::Receive(ReceiveStep {
            packet: packet.into(),
            port,
        })
    }

    pub fn parallel(forks: Vec<Vec<FlowStep>>) -> Self {
        FlowStep::Parallel(ParallelStep { forks })
    }

    /// Port of a send/receive step; `None` for parallel steps.
    pub fn port(&self) -> Option<u16> {
        match self {
            FlowStep::Send(s) => Some(s.port),
            FlowStep::Receive(r) => Some(r.port),
            FlowStep::Parallel(_) => None,
        }
    }

    fn collect_ports(&self, seen: &mut HashSet<u16>, ports: &mut Vec<u16>) {
        match self {
            FlowStep::Send(SendStep { port, .. }) | FlowStep::Receive(ReceiveStep { port, .. }) => {
                if seen.insert(*port) {
                    ports.push(*port);
                }
            }
            FlowStep::Parallel(p) => {
                for step in p.forks.iter().flatten() {
                    step.collect_ports(seen, ports);
                }
            }
        }
    }

    fn reversed(&self) -> FlowStep {
        match self {
            FlowStep::Send(s) => FlowStep::receive(s.packet.clone(), s.port),
            FlowStep::Receive(r) => FlowStep::send(r.packet.clone(), 0, r.port),
            FlowStep::Parallel(p) => FlowStep::parallel(
                p.forks
                    .iter()
                    .map(|fork| fork.iter().map(FlowStep::reversed).collect())
                    .collect(),
            ),
        }
    }

    fn largest_receive(&self) -> Option<&Packet> {
        match self {
            FlowStep::Send(_) => None,
            FlowStep::Receive(r) => Some(&r.packet),
            FlowStep::Parallel(p) => p
                .forks
                .iter()
                .flatten()
                .filter_map(FlowStep::largest_receive)
                .max_by_key(|packet| packet.len()),
        }
    }
}

/// A named, fully resolved sequence of steps.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Flow {
    pub id: Option<String>,
    pub steps: Vec<FlowStep>,
}

impl Flow {
    pub fn new(steps: Vec<FlowStep>) -> Self {
        Self { id: None, steps }
    }

    pub fn with_id(steps: Vec<FlowStep>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            steps,
        }
    }

    /// Distinct logical ports in first-seen document order, forks included.
    pub fn ports(&self) -> Vec<u16> {
        let mut seen = HashSet::new();
        let mut ports = Vec::new();
        for step in &self.steps {
            step.collect_ports(&mut seen, &mut ports);
        }
        ports
    }

    pub fn port_count(&self) -> usize {
        self.ports().len()
    }

    /// The same conversation seen from the other side: sends become
    /// receives and vice versa.  Ports are kept, delays dropped.
    pub fn reversed(&self) -> Flow {
        Flow {
            id: self.id.clone(),
            steps: self.steps.iter().map(FlowStep::reversed).collect(),
        }
    }

    /// Size of the largest packet any receive step (forks included) waits for.
    pub fn max_receive_len(&self) -> usize {
        self.largest_receive().map_or(0, Packet::len)
    }

    /// Fails when some receive step could never match within a read buffer of
    /// `capacity` bytes.
    pub fn check_buffer(&self, capacity: usize) -> Result<(), FlowError> {
        match self.largest_receive() {
            Some(packet) if packet.len() > capacity => Err(FlowError::BufferTooSmall {
                capacity,
                packet: packet.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn largest_receive(&self) -> Option<&Packet> {
        self.steps
            .iter()
            .filter_map(FlowStep::largest_receive)
            .max_by_key(|packet| packet.len())
    }
}

// ---------------------------------------------------------------------------
// Load-time model
// ---------------------------------------------------------------------------

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// One step as written in a flow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDef {
    Send {
        data: Packet,
        #[serde(default, skip_serializing_if = "is_zero")]
        delay_millis: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Receive {
        data: Packet,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Include {
        id: String,
    },
    Parallel {
        forks: Vec<Vec<StepDef>>,
    },
}

/// One flow of a flow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub steps: Vec<StepDef>,
}

/// Expand the first flow of `defs` into a [`Flow`].
///
/// Includes are replaced by the steps of the referenced flow, looked up by
/// id and then, for numeric ids, by 1-based position.  Steps without a port
/// take the nearest preceding explicit port in expanded document order
/// (`0` if none).  Every fork of a parallel step starts from the port active
/// just before the parallel step and does not affect the steps after it.
pub fn resolve(defs: &[FlowDef]) -> Result<Flow, FlowError> {
    let first = defs
        .first()
        .ok_or_else(|| FlowError::InvalidFlow("document contains no flow".into()))?;
    let mut resolver = Resolver {
        defs,
        stack: vec![0],
    };
    let mut port = 0;
    let steps = resolver.expand(&first.steps, &mut port)?;
    Ok(Flow {
        id: first.id.clone(),
        steps,
    })
}

fn effective_id(def: &FlowDef, index: usize) -> String {
    def.id.clone().unwrap_or_else(|| (index + 1).to_string())
}

struct Resolver<'a> {
    defs: &'a [FlowDef],
    /// Indexes of the flows currently being expanded, for cycle detection.
    stack: Vec<usize>,
}

impl Resolver<'_> {
    fn expand(&mut self, steps: &[StepDef], port: &mut u16) -> Result<Vec<FlowStep>, FlowError> {
        let mut out = Vec::with_capacity(steps.len());
        for step in steps {
            match step {
                StepDef::Send {
                    data,
                    delay_millis,
                    port: explicit,
                } => {
                    *port = explicit.unwrap_or(*port);
                    out.push(FlowStep::send(data.clone(), *delay_millis, *port));
                }
                StepDef::Receive {
                    data,
                    port: explicit,
                } => {
                    *port = explicit.unwrap_or(*port);
                    out.push(FlowStep::receive(data.clone(), *port));
                }
                StepDef::Include { id } => {
                    let index = self.find(id)?;
                    if self.stack.contains(&index) {
                        return Err(FlowError::InvalidFlow(format!(
                            "include cycle through flow '{id}'"
                        )));
                    }
                    let defs = self.defs;
                    self.stack.push(index);
                    let included = self.expand(&defs[index].steps, port);
                    self.stack.pop();
                    out.extend(included?);
                }
                StepDef::Parallel { forks } => {
                    let mut resolved = Vec::with_capacity(forks.len());
                    for fork in forks {
                        let mut fork_port = *port;
                        resolved.push(self.expand(fork, &mut fork_port)?);
                    }
                    out.push(FlowStep::parallel(resolved));
                }
            }
        }
        Ok(out)
    }

    fn find(&self, id: &str) -> Result<usize, FlowError> {
        if let Some(index) = self
            .defs
            .iter()
            .enumerate()
            .position(|(i, def)| effective_id(def, i) == id)
        {
            return Ok(index);
        }
        id.parse::<usize>()
            .ok()
            .filter(|position| (1..=self.defs.len()).contains(position))
            .map(|position| position - 1)
            .ok_or_else(|| FlowError::InvalidFlow(format!("unknown included flow '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(text: &str, port: Option<u16>) -> StepDef {
        StepDef::Send {
            data: Packet::from(text),
            delay_millis: 0,
            port,
        }
    }

    fn receive(text: &str, port: Option<u16>) -> StepDef {
        StepDef::Receive {
            data: Packet::from(text),
            port,
        }
    }

    fn include(id: &str) -> StepDef {
        StepDef::Include { id: id.into() }
    }

    fn single(steps: Vec<StepDef>) -> Vec<FlowDef> {
        vec![FlowDef { id: None, steps }]
    }

    fn ports_of(flow: &Flow) -> Vec<Option<u16>> {
        flow.steps.iter().map(FlowStep::port).collect()
    }

    #[test]
    fn unspecified_ports_inherit_previous() {
        let flow = resolve(&single(vec![
            send("Hello", Some(23)),
            receive("Hi", None),
            send("Bye", None),
        ]))
        .unwrap();
        assert_eq!(ports_of(&flow), vec![Some(23), Some(23), Some(23)]);
    }

    #[test]
    fn explicit_port_changes_context() {
        let flow = resolve(&single(vec![
            send("A", Some(23)),
            send("B", Some(24)),
            receive("C", None),
        ]))
        .unwrap();
        assert_eq!(ports_of(&flow), vec![Some(23), Some(24), Some(24)]);
    }

    #[test]
    fn steps_before_any_port_get_default() {
        let flow = resolve(&single(vec![send("A", None), send("B", Some(7))])).unwrap();
        assert_eq!(ports_of(&flow), vec![Some(0), Some(7)]);
        assert_eq!(flow.ports(), vec![0, 7]);
    }

    #[test]
    fn forks_start_from_pre_parallel_port() {
        let flow = resolve(&single(vec![
            send("A", Some(23)),
            StepDef::Parallel {
                forks: vec![
                    vec![send("B", Some(24)), receive("C", None)],
                    vec![receive("D", None)],
                ],
            },
            send("E", None),
        ]))
        .unwrap();

        let FlowStep::Parallel(parallel) = &flow.steps[1] else {
            panic!("expected parallel step, got {:?}", flow.steps[1]);
        };
        assert_eq!(parallel.forks[0][1].port(), Some(24));
        assert_eq!(parallel.forks[1][0].port(), Some(23));
        assert_eq!(flow.steps[2].port(), Some(23));
        assert_eq!(flow.ports(), vec![23, 24]);
    }

    #[test]
    fn include_expands_by_id_and_position() {
        let defs = vec![
            FlowDef {
                id: Some("main".into()),
                steps: vec![send("Hello", Some(23)), include("bye"), include("3")],
            },
            FlowDef {
                id: Some("bye".into()),
                steps: vec![receive("Bye", None), send("Bye John", Some(25))],
            },
            FlowDef {
                id: None,
                steps: vec![send("Done", None)],
            },
        ];
        let flow = resolve(&defs).unwrap();
        assert_eq!(flow.id.as_deref(), Some("main"));
        assert_eq!(
            flow.steps,
            vec![
                FlowStep::send("Hello", 0, 23),
                FlowStep::receive("Bye", 23),
                FlowStep::send("Bye John", 0, 25),
                FlowStep::send("Done", 0, 25),
            ]
        );
    }

    #[test]
    fn include_cycle_is_rejected() {
        let defs = vec![
            FlowDef {
                id: Some("a".into()),
                steps: vec![include("b")],
            },
            FlowDef {
                id: Some("b".into()),
                steps: vec![include("a")],
            },
        ];
        assert!(matches!(resolve(&defs), Err(FlowError::InvalidFlow(_))));
    }

    #[test]
    fn unknown_include_is_rejected() {
        let err = resolve(&single(vec![include("missing")])).unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn empty_document_is_rejected() {
        assert!(resolve(&[]).is_err());
    }

    #[test]
    fn reversed_swaps_directions_recursively() {
        let flow = Flow::new(vec![
            FlowStep::send("Hello", 30, 23),
            FlowStep::receive("Hi", 23),
            FlowStep::parallel(vec![vec![FlowStep::send("X", 0, 24)]]),
        ]);
        assert_eq!(
            flow.reversed().steps,
            vec![
                FlowStep::receive("Hello", 23),
                FlowStep::send("Hi", 0, 23),
                FlowStep::parallel(vec![vec![FlowStep::receive("X", 24)]]),
            ]
        );
    }

    #[test]
    fn check_buffer_looks_inside_forks() {
        let flow = Flow::new(vec![
            FlowStep::receive("abc", 0),
            FlowStep::parallel(vec![vec![FlowStep::receive("abcdef", 0)]]),
            FlowStep::send("a much longer packet that is only sent", 0, 0),
        ]);
        assert_eq!(flow.max_receive_len(), 6);
        assert!(flow.check_buffer(6).is_ok());
        assert!(matches!(
            flow.check_buffer(5),
            Err(FlowError::BufferTooSmall { capacity: 5, .. })
        ));
    }
}
