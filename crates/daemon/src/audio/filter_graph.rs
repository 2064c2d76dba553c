//! Typed FFmpeg audio filter graphs.
//!
//! Graphs are built from [`FilterNode`]s grouped into labelled [`FilterChain`]s and
//! only turned into `-filter_complex` syntax at the edge, so tests can assert on
//! structure instead of string fragments.

use std::fmt;

/// Lowest factor a single `atempo` stage accepts.
pub const MIN_TEMPO: f64 = 0.5;
/// Highest factor a single `atempo` stage accepts.
pub const MAX_TEMPO: f64 = 2.0;

/// A single filter with its options, e.g. `atrim=start=1.500`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    pub name: &'static str,
    pub args: Vec<(String, String)>,
}

impl FilterNode {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push((key.into(), value.into()));
        self
    }

    /// Value of a named option.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn trim(start: Option<f64>, end: Option<f64>) -> Self {
        let mut node = Self::new("atrim");
        if let Some(start) = start {
            node = node.arg("start", seconds(start));
        }
        if let Some(end) = end {
            node = node.arg("end", seconds(end));
        }
        node
    }

    pub fn reset_timestamps() -> Self {
        Self::new("asetpts").arg("expr", "PTS-STARTPTS")
    }

    /// Delay every channel by `ms`.
    pub fn delay(ms: u64) -> Self {
        Self::new("adelay").arg("delays", ms.to_string()).arg("all", "1")
    }

    pub fn tempo(factor: f64) -> Self {
        Self::new("atempo").arg("tempo", format!("{:.4}", factor))
    }

    pub fn volume(factor: f64) -> Self {
        Self::new("volume").arg("volume", format!("{:.3}", factor))
    }

    pub fn pad_to(total_secs: f64) -> Self {
        Self::new("apad").arg("whole_dur", seconds(total_secs))
    }

    /// Sum `inputs` streams at their own volume; amix scales each by 1/N otherwise.
    pub fn mix(inputs: usize) -> Self {
        Self::new("amix")
            .arg("inputs", inputs.to_string())
            .arg("duration", "longest")
            .arg("dropout_transition", "0")
            .arg("normalize", "0")
    }
}

impl fmt::Display for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for (i, (key, value)) in self.args.iter().enumerate() {
            let sep = if i == 0 { '=' } else { ':' };
            write!(f, "{}{}={}", sep, key, value)?;
        }
        Ok(())
    }
}

/// Input labels, a sequence of filters and one output label.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterChain {
    pub inputs: Vec<String>,
    pub nodes: Vec<FilterNode>,
    pub output: String,
}

impl FilterChain {
    pub fn has_filter(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    pub fn filters_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FilterNode> + 'a {
        self.nodes.iter().filter(move |n| n.name == name)
    }
}

impl fmt::Display for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            write!(f, "[{}]", input)?;
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", node)?;
        }
        write!(f, "[{}]", self.output)
    }
}

/// A complete `-filter_complex` graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterGraph {
    pub chains: Vec<FilterChain>,
}

impl FilterGraph {
    pub fn has_filter(&self, name: &str) -> bool {
        self.chains.iter().any(|c| c.has_filter(name))
    }

    pub fn find(&self, name: &str) -> Option<&FilterNode> {
        self.chains
            .iter()
            .flat_map(|c| c.nodes.iter())
            .find(|n| n.name == name)
    }

    /// Output label of the last chain, i.e. the stream the encoder maps.
    pub fn output_label(&self) -> Option<&str> {
        self.chains.last().map(|c| c.output.as_str())
    }
}

impl fmt::Display for FilterGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.chains.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}", chain)?;
        }
        Ok(())
    }
}

/// Split a playback rate into `atempo` stages that each stay within 0.5..=2.0.
pub fn tempo_stages(rate: f64) -> Vec<f64> {
    if !rate.is_finite() || rate <= 0.0 || (rate - 1.0).abs() < 1e-9 {
        return Vec::new();
    }
    let mut stages = Vec::new();
    let mut remaining = rate;
    while remaining > MAX_TEMPO {
        stages.push(MAX_TEMPO);
        remaining /= MAX_TEMPO;
    }
    while remaining < MIN_TEMPO {
        stages.push(MIN_TEMPO);
        remaining /= MIN_TEMPO;
    }
    if (remaining - 1.0).abs() > 1e-9 {
        stages.push(remaining);
    }
    stages
}

/// Seconds with millisecond precision.
pub fn seconds(secs: f64) -> String {
    format!("{:.3}", secs)
}
