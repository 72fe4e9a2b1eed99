//! # IsoKit Overlay
//!
//! Burns a timed text caption into a video clip.
//!
//! An [`OverlaySpec`] describes the caption; it renders to an ffmpeg
//! `drawtext` filter. An [`OverlayEngine`] runs the filter over a clip and
//! returns the encoded result. [`FfmpegEngine`] drives a local `ffmpeg`
//! binary.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod ffmpeg;

pub use ffmpeg::FfmpegEngine;

/// Errors that can occur while producing an overlay.
#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("No {0} provided")]
    EmptyInput(&'static str),

    #[error("Invalid overlay: {0}")]
    InvalidSpec(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg failed ({status}): {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Overlay timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A text caption shown for a window of the clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlaySpec {
    pub text: String,
    /// Left edge in pixels.
    pub x: u32,
    /// Top edge in pixels.
    pub y: u32,
    /// Seconds from the start of the clip.
    pub start_time: f64,
    /// Seconds the caption stays visible.
    pub duration: f64,
    pub font_size: u32,
}

impl Default for OverlaySpec {
    fn default() -> Self {
        Self {
            text: String::new(),
            x: 50,
            y: 50,
            start_time: 1.0,
            duration: 5.0,
            font_size: 20,
        }
    }
}

impl OverlaySpec {
    /// Caption `text` with default placement and timing.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.text.trim().is_empty() {
            return Err(OverlayError::InvalidSpec("text must not be empty".into()));
        }
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(OverlayError::InvalidSpec(format!(
                "start time must be a non-negative number, got {}",
                self.start_time
            )));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(OverlayError::InvalidSpec(format!(
                "duration must be positive, got {}",
                self.duration
            )));
        }
        if self.font_size == 0 {
            return Err(OverlayError::InvalidSpec("font size must be positive".into()));
        }
        Ok(())
    }

    /// Second at which the caption disappears.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }

    /// The `drawtext` filter for this caption, ready to pass as one `-vf`
    /// argument.
    pub fn drawtext_filter(&self, font_file: &str) -> String {
        format!(
            "drawtext=fontfile={font}:text={text}:x={x}:y={y}:fontsize={size}:fontcolor=white:enable='between(t,{start},{end})'",
            font = escape_graph(&escape_option(font_file)),
            text = escape_graph(&escape_option(&escape_expansion(&self.text))),
            x = self.x,
            y = self.y,
            size = self.font_size,
            start = self.start_time,
            end = self.end_time(),
        )
    }
}

// ffmpeg unescapes the filter argument three times: once when splitting the
// graph, once when splitting options, and once when expanding `%{...}` in
// the drawtext text. Each pass gets its own layer of backslashes.

fn escape_expansion(s: &str) -> String {
    escape(s, &['%'])
}

fn escape_option(s: &str) -> String {
    escape(s, &['\'', ':'])
}

fn escape_graph(s: &str) -> String {
    escape(s, &['\'', '[', ']', ',', ';'])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inputs for one overlay run.
#[derive(Debug, Clone)]
pub struct OverlayJob {
    pub video: Bytes,
    pub font: Bytes,
    pub spec: OverlaySpec,
}

impl OverlayJob {
    /// Check the inputs before any work is started.
    pub fn validate(&self) -> Result<(), OverlayError> {
        if self.video.is_empty() {
            return Err(OverlayError::EmptyInput("video"));
        }
        if self.font.is_empty() {
            return Err(OverlayError::EmptyInput("font"));
        }
        self.spec.validate()
    }
}

/// Something that can burn a caption into a clip.
#[async_trait::async_trait]
pub trait OverlayEngine: Send + Sync {
    /// Returns the encoded output clip.
    async fn overlay(&self, job: OverlayJob) -> Result<Bytes, OverlayError>;
}
