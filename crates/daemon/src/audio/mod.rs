//! Audio mixing
//!
//! Derives track descriptors from the composition, fetches their sources into the
//! job's scratch directory and builds the encoder's audio inputs plus the mixing
//! filter graph.

pub mod fetch;
pub mod filter_graph;

pub use fetch::{AssetDownloadError, AssetFetcher, HttpAssetFetcher};
pub use filter_graph::{FilterChain, FilterGraph, FilterNode};

use crate::composition::{Composition, ItemKind};
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// Sample rate of the silent source used when a composition has no audio.
const SILENCE_SAMPLE_RATE: u32 = 48_000;

/// Label of the mixed stream the encoder maps.
pub const MIXED_OUTPUT_LABEL: &str = "aout";

/// One audio clip placed on the timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrackDescriptor {
    pub id: String,
    pub src: String,
    /// Timeline position the clip starts at.
    pub start_ms: u64,
    /// How long the clip plays on the timeline.
    pub duration_ms: u64,
    pub trim_start_ms: Option<u64>,
    pub trim_end_ms: Option<u64>,
    pub volume: f64,
    pub playback_rate: f64,
}

/// Collect audible tracks from the composition.
///
/// Items without a source or that would play for zero milliseconds are dropped.
pub fn derive_tracks(composition: &Composition, total_ms: u64) -> Vec<AudioTrackDescriptor> {
    composition
        .items
        .iter()
        .filter(|item| item.kind == ItemKind::Audio)
        .filter_map(|item| {
            let src = item.src.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
            let duration_ms = item
                .to_ms
                .map(|to| to.saturating_sub(item.from_ms))
                .or(item.duration_ms)
                .unwrap_or_else(|| total_ms.saturating_sub(item.from_ms));
            if duration_ms == 0 {
                tracing::debug!(item = %item.id, "skipping audio item with no playable duration");
                return None;
            }
            Some(AudioTrackDescriptor {
                id: item.id.clone(),
                src: src.to_string(),
                start_ms: item.from_ms,
                duration_ms,
                trim_start_ms: item.trim_start_ms.filter(|t| *t > 0),
                trim_end_ms: item.trim_end_ms,
                volume: item.volume.filter(|v| v.is_finite() && *v >= 0.0).unwrap_or(1.0),
                playback_rate: item
                    .playback_rate
                    .filter(|r| r.is_finite() && *r > 0.0)
                    .unwrap_or(1.0),
            })
        })
        .collect()
}

/// Encoder input arguments, e.g. `-i <path>`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInput {
    pub args: Vec<String>,
}

impl AudioInput {
    pub fn file(path: &Path) -> Self {
        Self {
            args: vec!["-i".to_string(), path.to_string_lossy().into_owned()],
        }
    }

    /// Silent stereo source lasting `total_secs`.
    pub fn silence(total_secs: f64) -> Self {
        Self {
            args: vec![
                "-f".to_string(),
                "lavfi".to_string(),
                "-t".to_string(),
                filter_graph::seconds(total_secs),
                "-i".to_string(),
                format!(
                    "anullsrc=channel_layout=stereo:sample_rate={}",
                    SILENCE_SAMPLE_RATE
                ),
            ],
        }
    }
}

/// Audio half of the encoder invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPlan {
    /// Inputs in encoder order, starting at `first_input_index`.
    pub inputs: Vec<AudioInput>,
    pub filter_graph: Option<FilterGraph>,
    /// Value passed to `-map`: `[aout]` for a graph, `<index>:a` for a plain input.
    pub output_label: String,
    pub first_input_index: usize,
    pub total_ms: u64,
}

impl AudioPlan {
    pub fn is_silent(&self) -> bool {
        self.filter_graph.is_none()
    }
}

/// Build the plan for already fetched tracks.
///
/// `first_input_index` is the encoder input number of the first audio input; the
/// frame sequence normally occupies index 0.
pub fn build_audio_plan(
    tracks: &[(AudioTrackDescriptor, PathBuf)],
    total_ms: u64,
    first_input_index: usize,
) -> AudioPlan {
    let total_secs = total_ms as f64 / 1000.0;

    if tracks.is_empty() {
        return AudioPlan {
            inputs: vec![AudioInput::silence(total_secs)],
            filter_graph: None,
            output_label: format!("{}:a", first_input_index),
            first_input_index,
            total_ms,
        };
    }

    let inputs = tracks.iter().map(|(_, path)| AudioInput::file(path)).collect();

    let graph = if tracks.len() == 1 {
        let (track, _) = &tracks[0];
        let mut chain = track_chain(track, first_input_index, MIXED_OUTPUT_LABEL);
        chain.nodes.push(FilterNode::pad_to(total_secs));
        FilterGraph {
            chains: vec![chain],
        }
    } else {
        let mut chains: Vec<FilterChain> = tracks
            .iter()
            .enumerate()
            .map(|(i, (track, _))| track_chain(track, first_input_index + i, &format!("a{}", i)))
            .collect();
        let mix_inputs = chains.iter().map(|c| c.output.clone()).collect();
        chains.push(FilterChain {
            inputs: mix_inputs,
            nodes: vec![FilterNode::mix(tracks.len()), FilterNode::pad_to(total_secs)],
            output: MIXED_OUTPUT_LABEL.to_string(),
        });
        FilterGraph { chains }
    };

    AudioPlan {
        inputs,
        filter_graph: Some(graph),
        output_label: format!("[{}]", MIXED_OUTPUT_LABEL),
        first_input_index,
        total_ms,
    }
}

/// Per-track chain: trim source, reset timestamps, stretch, scale volume, delay to
/// the clip's timeline position and cut at its end.
///
/// Tempo runs before the delay so the offset is not stretched with the clip.
fn track_chain(track: &AudioTrackDescriptor, input_index: usize, output: &str) -> FilterChain {
    let mut nodes = Vec::new();

    if track.trim_start_ms.is_some() || track.trim_end_ms.is_some() {
        nodes.push(FilterNode::trim(
            track.trim_start_ms.map(ms_to_secs),
            track.trim_end_ms.map(ms_to_secs),
        ));
    }
    nodes.push(FilterNode::reset_timestamps());
    nodes.extend(filter_graph::tempo_stages(track.playback_rate).into_iter().map(FilterNode::tempo));
    nodes.push(FilterNode::volume(track.volume));
    if track.start_ms > 0 {
        nodes.push(FilterNode::delay(track.start_ms));
    }
    nodes.push(FilterNode::trim(
        None,
        Some(ms_to_secs(track.start_ms + track.duration_ms)),
    ));

    FilterChain {
        inputs: vec![format!("{}:a", input_index)],
        nodes,
        output: output.to_string(),
    }
}

fn ms_to_secs(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// Scratch file name for a track, keeping the source extension when it has one.
fn local_file_name(index: usize, src: &str) -> String {
    let ext = src
        .split(['?', '#'])
        .next()
        .and_then(|path| Path::new(path).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("audio");
    format!("track-{}.{}", index, ext)
}

/// Resolves a composition's audio into an [`AudioPlan`].
#[derive(Clone)]
pub struct AudioProcessor {
    fetcher: Arc<dyn AssetFetcher>,
}

impl AudioProcessor {
    pub fn new(fetcher: Arc<dyn AssetFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch every track into `audio_dir` and build the mixing plan.
    ///
    /// Any failed fetch fails the whole preparation. Setting `cancel` abandons the
    /// outstanding fetches.
    pub async fn prepare(
        &self,
        composition: &Composition,
        total_ms: u64,
        audio_dir: &Path,
        first_input_index: usize,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<AudioPlan, AssetDownloadError> {
        let tracks = derive_tracks(composition, total_ms);
        if !tracks.is_empty() {
            tokio::fs::create_dir_all(audio_dir)
                .await
                .map_err(|source| AssetDownloadError::Io {
                    path: audio_dir.to_path_buf(),
                    source,
                })?;
        }

        let fetches = tracks.into_iter().enumerate().map(|(i, track)| {
            let dest = audio_dir.join(local_file_name(i, &track.src));
            async move {
                self.fetcher.fetch(&track.src, &dest).await?;
                Ok::<_, AssetDownloadError>((track, dest))
            }
        });
        let fetched = tokio::select! {
            fetched = try_join_all(fetches) => fetched?,
            _ = crate::subprocess::cancelled(&mut cancel) => {
                tracing::info!("audio preparation cancelled");
                return Err(AssetDownloadError::Cancelled);
            }
        };

        tracing::info!(tracks = fetched.len(), total_ms, "audio prepared");
        Ok(build_audio_plan(&fetched, total_ms, first_input_index))
    }
}
