use anyhow::Result;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Per-task ring of recent frames, bounded by count and by age.
pub struct FrameRingBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
    max_age: chrono::Duration,
}

impl FrameRingBuffer {
    pub fn new(buffer_seconds: f64, fps: f64) -> Self {
        let capacity = (buffer_seconds * fps).ceil().max(1.0) as usize;
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            max_age: chrono::Duration::milliseconds((buffer_seconds * 1000.0) as i64),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        let cutoff = frame.timestamp - self.max_age;
        while self.frames.front().is_some_and(|f| f.timestamp < cutoff) {
            self.frames.pop_front();
        }
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Frame> {
        self.frames
            .iter()
            .filter(|f| f.timestamp >= start && f.timestamp <= end)
            .cloned()
            .collect()
    }
}

#[derive(Serialize)]
struct ClipManifest<'a> {
    task_id: i64,
    alert_id: &'a str,
    fps: f64,
    frame_count: usize,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    frames: Vec<ManifestFrame>,
}

#[derive(Serialize)]
struct ManifestFrame {
    file: String,
    timestamp: DateTime<Utc>,
    width: u32,
    height: u32,
}

/// Package frames as `tar.gz`: a `manifest.json` followed by
/// `frames/NNNNNN.jpg` in timestamp order.
pub fn package_clip(task_id: i64, alert_id: &str, fps: f64, frames: &[Frame]) -> Result<Vec<u8>> {
    let manifest = ClipManifest {
        task_id,
        alert_id,
        fps,
        frame_count: frames.len(),
        start: frames.first().map(|f| f.timestamp),
        end: frames.last().map(|f| f.timestamp),
        frames: frames
            .iter()
            .enumerate()
            .map(|(i, f)| ManifestFrame {
                file: format!("frames/{:06}.jpg", i),
                timestamp: f.timestamp,
                width: f.width,
                height: f.height,
            })
            .collect(),
    };
    let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append(&mut builder, "manifest.json", &manifest_bytes)?;
    for (i, frame) in frames.iter().enumerate() {
        append(&mut builder, &format!("frames/{:06}.jpg", i), &frame.bytes)?;
    }
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append<W: std::io::Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
