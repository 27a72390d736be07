//! Reference consumers: scratch-file video sink, audio/ancillary sinks.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use memmap2::MmapMut;
use tracing::{debug, info};

use crate::streaming::anc::{AncConsumer, AncMeta};
use crate::streaming::format::VideoFormat;
use crate::streaming::pack::{unpack_pg2be_be10, PIXEL_GROUP_SIZE};
use crate::streaming::{AudioConsumer, VideoConsumer};

/// Writes the latest delivered frame, unpacked back to planar
/// `.yuv422p10be`, into a memory-mapped scratch file under /tmp.
pub struct ScratchFileConsumer {
    map: MmapMut,
    fmt: VideoFormat,
    pub frames: Arc<AtomicU64>,
    path: PathBuf,
}

impl ScratchFileConsumer {
    /// Maps `/tmp/<name>.<WxH>.yuv422p10be.yuv` sized for one frame.
    pub fn create(name: &str, fmt: &VideoFormat) -> Result<ScratchFileConsumer> {
        let path = PathBuf::from(format!(
            "/tmp/{}.{}x{}.yuv422p10be.yuv",
            name, fmt.width, fmt.height
        ));
        let planar_size = fmt.width as u64 * fmt.height as u64 * 4; // Y + Cb + Cr u16
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("cannot open scratch file {}", path.display()))?;
        file.set_len(planar_size)
            .context("cannot size scratch file")?;
        let map = unsafe { MmapMut::map_mut(&file) }.context("cannot map scratch file")?;
        info!("consumer scratch file {}", path.display());
        Ok(ScratchFileConsumer {
            map,
            fmt: fmt.clone(),
            frames: Arc::new(AtomicU64::new(0)),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Unpack the packed frame into the planar mapping.
    fn write_frame(&mut self, frame: &[u8]) {
        let w = self.fmt.width as usize;
        let h = frame.len() / (w / 2 * PIXEL_GROUP_SIZE);
        let line_size = w / 2 * PIXEL_GROUP_SIZE;
        let y_size = w * self.fmt.height as usize * 2;
        let c_size = y_size / 2;

        for line in 0..h {
            for g in 0..w / 2 {
                let off = line * line_size + g * PIXEL_GROUP_SIZE;
                let pg: [u8; PIXEL_GROUP_SIZE] =
                    frame[off..off + PIXEL_GROUP_SIZE].try_into().unwrap();
                let (cb, y0, cr, y1) = unpack_pg2be_be10(&pg);
                let yi = (line * w + g * 2) * 2;
                self.map[yi..yi + 2].copy_from_slice(&y0.to_ne_bytes());
                self.map[yi + 2..yi + 4].copy_from_slice(&y1.to_ne_bytes());
                let ci = (line * w / 2 + g) * 2;
                self.map[y_size + ci..y_size + ci + 2].copy_from_slice(&cb.to_ne_bytes());
                self.map[y_size + c_size + ci..y_size + c_size + ci + 2]
                    .copy_from_slice(&cr.to_ne_bytes());
            }
        }
    }
}

impl VideoConsumer for ScratchFileConsumer {
    fn frame_recv(&mut self, frame: &[u8], tmstamp: u32, _field_id: u8) {
        self.write_frame(frame);
        let n = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 100 == 0 {
            info!("consumer: {} frames (last tmstamp {})", n, tmstamp);
        }
    }

    fn frame_done(&mut self, _tmstamp: u32) {}
}

/// Counts received audio without keeping it.
pub struct AudioSink {
    pub packets: Arc<AtomicU64>,
    pub buffers: Arc<AtomicU64>,
}

impl AudioSink {
    pub fn new() -> AudioSink {
        AudioSink {
            packets: Arc::new(AtomicU64::new(0)),
            buffers: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for AudioSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioConsumer for AudioSink {
    fn sample_recv(&mut self, _buf: &[u8], _buf_offset: u32, _tmstamp: u32) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    fn buffer_done(&mut self, _buf: &[u8]) {
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs ancillary packets as they arrive.
pub struct AncLogger {
    pub packets: Arc<AtomicU64>,
}

impl AncLogger {
    pub fn new() -> AncLogger {
        AncLogger {
            packets: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl Default for AncLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl AncConsumer for AncLogger {
    fn meta_recv(&mut self, metas: Vec<AncMeta>, tmstamp: u32) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        for m in &metas {
            debug!(
                "anc tmstamp {} did {:02x} sdid {:02x} udw {} bytes",
                tmstamp,
                m.did,
                m.sdid,
                m.udw.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::format::{FrameRate, PktFmt, Vscan};
    use crate::streaming::pack::pack_be10_pg2be;

    #[test]
    fn test_scratch_file_roundtrip() {
        let fmt =
            VideoFormat::new(Vscan::P720, PktFmt::IntelSingleLine, FrameRate::P50).unwrap();
        let mut cons = ScratchFileConsumer::create("test-session", &fmt).unwrap();

        // a packed frame with a known first group
        let mut frame = vec![0u8; fmt.frame_size() as usize];
        let mut pg = [0u8; PIXEL_GROUP_SIZE];
        pack_be10_pg2be(
            &mut pg,
            512u16.to_be(),
            100u16.to_be(),
            300u16.to_be(),
            200u16.to_be(),
        );
        frame[..PIXEL_GROUP_SIZE].copy_from_slice(&pg);
        cons.frame_recv(&frame, 3003, 2);

        assert_eq!(cons.frames.load(Ordering::Relaxed), 1);
        // planar mapping: first two luma samples then the chroma planes
        let y0 = u16::from_ne_bytes([cons.map[0], cons.map[1]]);
        let y1 = u16::from_ne_bytes([cons.map[2], cons.map[3]]);
        assert_eq!(u16::from_be(y0), 100);
        assert_eq!(u16::from_be(y1), 200);
        let y_size = fmt.width as usize * fmt.height as usize * 2;
        let cb = u16::from_ne_bytes([cons.map[y_size], cons.map[y_size + 1]]);
        assert_eq!(u16::from_be(cb), 512);
        let _ = std::fs::remove_file(cons.path());
    }

    #[test]
    fn test_audio_sink_counts() {
        let mut sink = AudioSink::new();
        sink.sample_recv(&[0; 8], 0, 48);
        sink.sample_recv(&[0; 8], 8, 96);
        sink.buffer_done(&[0; 8]);
        assert_eq!(sink.packets.load(Ordering::Relaxed), 2);
        assert_eq!(sink.buffers.load(Ordering::Relaxed), 1);
    }
}
