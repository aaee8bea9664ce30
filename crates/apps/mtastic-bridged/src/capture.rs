//! Line-oriented capture files of MQTT traffic.
//!
//! ```text
//! # comment
//! msh/EU_868/2/e/LongFast/!0a1b2c3d 0a2c0d3d2c1b0a...
//! msh/EU_868/2/stat/!0a1b2c3d text:online
//! ```

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

const TEXT_PREFIX: &str = "text:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn parse(input: &str) -> Result<Vec<CapturedMessage>> {
    let mut messages = Vec::new();
    for (index, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let message = parse_line(line).with_context(|| format!("capture line {}", index + 1))?;
        messages.push(message);
    }
    Ok(messages)
}

pub fn load(path: &Path) -> Result<Vec<CapturedMessage>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading capture {}", path.display()))?;
    parse(&contents)
}

fn parse_line(line: &str) -> Result<CapturedMessage> {
    let (topic, body) =
        line.split_once(char::is_whitespace).ok_or_else(|| anyhow!("missing payload"))?;
    let body = body.trim();
    let payload = match body.strip_prefix(TEXT_PREFIX) {
        Some(text) => text.as_bytes().to_vec(),
        None => hex::decode(body).context("payload is not hex")?,
    };
    Ok(CapturedMessage { topic: topic.to_string(), payload })
}
