//! Builds a flow from a Wireshark JSON export ("Export Packet Dissections →
//! As JSON").
//!
//! Only frames carrying a TCP payload are used.  Frames sent by the server
//! become sends (timed by the gap to the previous displayed frame); every
//! other frame becomes a receive.

use std::io::Read;

use serde_json::Value;

use crate::error::FlowError;
use crate::flow::{Flow, FlowStep};
use crate::packet::Packet;

/// `server_address` is either an IP (`10.0.0.5`) or `ip:port`.
pub fn from_wireshark_json<R: Read>(reader: R, server_address: &str) -> Result<Flow, FlowError> {
    let dump: Value = serde_json::from_reader(reader)?;
    let frames = dump.as_array().ok_or_else(|| {
        FlowError::InvalidFlow("Wireshark dump must be a JSON array of frames".into())
    })?;

    let mut steps = Vec::new();
    for frame in frames {
        let Some(layers) = frame.pointer("/_source/layers") else {
            continue;
        };
        let payload = field(layers, "/tcp/tcp.payload").unwrap_or_default();
        if payload.is_empty() {
            continue;
        }
        let packet = Packet::from_hex(&payload)?;
        let source_ip = field(layers, "/ip/ip.src")
            .or_else(|| field(layers, "/ipv6/ipv6.src"))
            .unwrap_or_default();
        let source_port = field(layers, "/tcp/tcp.srcport").unwrap_or_default();

        if is_server(&source_ip, &source_port, server_address) {
            steps.push(FlowStep::send(
                packet,
                delta_millis(layers)?,
                parse_port(&source_port)?,
            ));
        } else {
            let destination_port = field(layers, "/tcp/tcp.dstport").unwrap_or_default();
            steps.push(FlowStep::receive(packet, parse_port(&destination_port)?));
        }
    }
    log::debug!("converted {} payload frames into flow steps", steps.len());
    Ok(Flow::new(steps))
}

/// Wireshark exports every field as a string, but accept plain numbers too.
fn field(layers: &Value, pointer: &str) -> Option<String> {
    match layers.pointer(pointer)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn is_server(source_ip: &str, source_port: &str, server_address: &str) -> bool {
    server_address == source_ip || server_address == format!("{source_ip}:{source_port}")
}

fn parse_port(text: &str) -> Result<u16, FlowError> {
    text.parse()
        .map_err(|_| FlowError::InvalidFlow(format!("invalid TCP port '{text}' in capture")))
}

fn delta_millis(layers: &Value) -> Result<u64, FlowError> {
    let Some(delta) = field(layers, "/frame/frame.time_delta_displayed") else {
        return Ok(0);
    };
    parse_millis(&delta)
        .ok_or_else(|| FlowError::InvalidFlow(format!("invalid frame time delta '{delta}'")))
}

/// Decimal seconds to whole milliseconds, truncating below a millisecond.
/// Parsed digit by digit so `1.005` stays 1005.
fn parse_millis(seconds: &str) -> Option<u64> {
    let (whole, fraction) = seconds.split_once('.').unwrap_or((seconds, ""));
    let all_digits = |text: &str| text.bytes().all(|b| b.is_ascii_digit());
    if whole.len() + fraction.len() == 0 || !all_digits(whole) || !all_digits(fraction) {
        return None;
    }
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let millis = fraction
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(3)
        .fold(0, |acc, digit| acc * 10 + u64::from(digit - b'0'));
    whole.checked_mul(1000)?.checked_add(millis)
}
