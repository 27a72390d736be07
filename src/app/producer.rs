//! File and test-pattern producers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::streaming::anc::{AncMeta, AncProducer};
use crate::streaming::format::VideoFormat;
use crate::streaming::pack::{
    pack_be10_pg2be, pack_rgb_line_pg2be, ColorMatrix, RgbOrder, PIXEL_GROUP_SIZE,
};
use crate::streaming::{AudioProducer, FrameBuf, VideoProducer};

/// Source pixel layout of the producer file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufFormat {
    /// Planar Y'CbCr 4:2:2, 16-bit big-endian samples with 10 used bits.
    Yuv422p10be,
    /// 8-bit interleaved RGBA.
    Rgba,
}

impl BufFormat {
    pub fn from_cli(s: &str) -> Result<BufFormat> {
        match s {
            "yuv10be" | "yuv422p10be" => Ok(BufFormat::Yuv422p10be),
            "rgba" => Ok(BufFormat::Rgba),
            other => bail!("unknown buffer format {other}"),
        }
    }
}

/// Feeds packed frames into a video TX session, cycling the source.
pub struct FileProducer {
    frames: Vec<Arc<FrameBuf>>,
    next: usize,
    /// Stop after this many frames; None = loop forever.
    frames_limit: Option<u64>,
    sent: u64,
}

impl FileProducer {
    /// Load and pack every frame of the source file.
    pub fn from_file(path: &Path, fmt: &VideoFormat, buf_format: BufFormat) -> Result<FileProducer> {
        let data = std::fs::read(path)
            .with_context(|| format!("cannot read source file {}", path.display()))?;
        let (w, h) = (fmt.width as usize, fmt.height as usize);
        let src_frame_size = match buf_format {
            BufFormat::Yuv422p10be => w * h * 2 + w * h * 2, // Y + Cb + Cr, u16 each
            BufFormat::Rgba => w * h * 4,
        };
        if data.len() < src_frame_size {
            bail!(
                "source file holds {} bytes, one {}x{} frame needs {}",
                data.len(),
                w,
                h,
                src_frame_size
            );
        }
        let n_frames = data.len() / src_frame_size;
        let mut frames = Vec::with_capacity(n_frames);
        for i in 0..n_frames {
            let src = &data[i * src_frame_size..(i + 1) * src_frame_size];
            let packed = match buf_format {
                BufFormat::Yuv422p10be => pack_planar_frame(src, w, h),
                BufFormat::Rgba => pack_rgba_frame(src, w, h),
            };
            frames.push(FrameBuf::from_vec(packed));
        }
        info!("producer: {} frame(s) from {}", n_frames, path.display());
        Ok(FileProducer {
            frames,
            next: 0,
            frames_limit: None,
            sent: 0,
        })
    }

    /// A moving-gradient test pattern, no file needed.
    pub fn test_pattern(fmt: &VideoFormat, count: usize) -> FileProducer {
        let (w, h) = (fmt.width as usize, fmt.height as usize);
        let line_size = w / 2 * PIXEL_GROUP_SIZE;
        let mut frames = Vec::with_capacity(count);
        for f in 0..count {
            let mut frame = vec![0u8; h * line_size];
            for (line, chunk) in frame.chunks_exact_mut(line_size).enumerate() {
                for (g, pg) in chunk.chunks_exact_mut(PIXEL_GROUP_SIZE).enumerate() {
                    let y = (((line + g + f * 4) % 877) + 64) as u16;
                    let mut packed = [0u8; PIXEL_GROUP_SIZE];
                    pack_be10_pg2be(&mut packed, 512u16.to_be(), y.to_be(), 512u16.to_be(), y.to_be());
                    pg.copy_from_slice(&packed);
                }
            }
            frames.push(FrameBuf::from_vec(frame));
        }
        FileProducer {
            frames,
            next: 0,
            frames_limit: None,
            sent: 0,
        }
    }

    pub fn with_limit(mut self, frames: Option<u64>) -> FileProducer {
        self.frames_limit = frames;
        self
    }
}

impl VideoProducer for FileProducer {
    fn next_frame(&mut self, _prev: Option<Arc<FrameBuf>>, _field_id: u8) -> Option<Arc<FrameBuf>> {
        if let Some(limit) = self.frames_limit {
            if self.sent >= limit {
                return None;
            }
        }
        let frame = self.frames[self.next].clone();
        self.next = (self.next + 1) % self.frames.len();
        self.sent += 1;
        Some(frame)
    }

    fn next_slice_offset(&mut self, frame: &FrameBuf, _prev_offset: u32, _field_id: u8) -> u32 {
        // frames are packed in full before hand-over
        frame.len() as u32
    }
}

/// Pack a planar big-endian 4:2:2 10-bit frame into pixel groups.
fn pack_planar_frame(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let y_plane = &src[..w * h * 2];
    let cb_plane = &src[w * h * 2..w * h * 2 + w * h];
    let cr_plane = &src[w * h * 2 + w * h..];
    let line_size = w / 2 * PIXEL_GROUP_SIZE;
    let mut out = vec![0u8; h * line_size];

    let sample = |plane: &[u8], idx: usize| -> u16 {
        // keep the file byte order; the packers expect big-endian
        u16::from_ne_bytes([plane[idx * 2], plane[idx * 2 + 1]])
    };

    for line in 0..h {
        for g in 0..w / 2 {
            let y0 = sample(y_plane, line * w + g * 2);
            let y1 = sample(y_plane, line * w + g * 2 + 1);
            let cb = sample(cb_plane, line * w / 2 + g);
            let cr = sample(cr_plane, line * w / 2 + g);
            let mut pg = [0u8; PIXEL_GROUP_SIZE];
            pack_be10_pg2be(&mut pg, cb, y0, cr, y1);
            let off = line * line_size + g * PIXEL_GROUP_SIZE;
            out[off..off + PIXEL_GROUP_SIZE].copy_from_slice(&pg);
        }
    }
    out
}

/// Convert an RGBA frame through the BT.709 matrix into pixel groups.
fn pack_rgba_frame(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let line_size = w / 2 * PIXEL_GROUP_SIZE;
    let mut out = vec![0u8; h * line_size];
    for line in 0..h {
        let src_line = &src[line * w * 4..(line + 1) * w * 4];
        let dst_line = &mut out[line * line_size..(line + 1) * line_size];
        pack_rgb_line_pg2be(src_line, RgbOrder::Rgba, ColorMatrix::Bt709, dst_line);
    }
    out
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// 1 kHz tone producer for audio sessions.
pub struct TestToneProducer {
    buffers: Vec<Arc<FrameBuf>>,
    next: usize,
}

impl TestToneProducer {
    /// Buffers hold whole packets; samples are 24-bit PCM of a 1 kHz sine.
    pub fn new(channels: u32, sample_size: u32, packets_per_buffer: u32) -> TestToneProducer {
        let grp = (channels * sample_size) as usize;
        let payload = grp * 48;
        let buf_len = payload * packets_per_buffer as usize;
        // one cycle of 1 kHz at 48 kHz is 48 samples: buffers tile cleanly
        let mut buffers = Vec::new();
        let mut data = vec![0u8; buf_len];
        for (i, group) in data.chunks_exact_mut(grp).enumerate() {
            let phase = (i % 48) as f32 / 48.0 * std::f32::consts::TAU;
            let sample = (phase.sin() * 0x60_0000 as f32) as i32;
            for ch in group.chunks_exact_mut(sample_size as usize) {
                match ch.len() {
                    3 => ch.copy_from_slice(&sample.to_be_bytes()[1..4]),
                    2 => ch.copy_from_slice(&(sample >> 8).to_be_bytes()[2..4]),
                    _ => {}
                }
            }
        }
        buffers.push(FrameBuf::from_vec(data));
        TestToneProducer { buffers, next: 0 }
    }
}

impl AudioProducer for TestToneProducer {
    fn next_buffer(&mut self, _prev: Option<Arc<FrameBuf>>) -> Option<Arc<FrameBuf>> {
        let buf = self.buffers[self.next].clone();
        self.next = (self.next + 1) % self.buffers.len();
        Some(buf)
    }
}

// ---------------------------------------------------------------------------
// Ancillary
// ---------------------------------------------------------------------------

/// Emits an ATC-style timecode ANC packet every frame.
pub struct TimecodeAncProducer {
    frame: u64,
    limit: Option<u64>,
}

impl TimecodeAncProducer {
    pub fn new(limit: Option<u64>) -> TimecodeAncProducer {
        TimecodeAncProducer { frame: 0, limit }
    }
}

impl AncProducer for TimecodeAncProducer {
    fn next_meta(&mut self) -> Option<Vec<AncMeta>> {
        if let Some(limit) = self.limit {
            if self.frame >= limit {
                return None;
            }
        }
        let f = self.frame;
        self.frame += 1;
        // DID 0x60 / SDID 0x60: ancillary timecode; 8 UDWs of BCD
        let units = [
            (f % 30) as u8,
            ((f / 30) % 60) as u8,
            ((f / 1800) % 60) as u8,
            ((f / 108_000) % 24) as u8,
        ];
        let mut udw = Vec::with_capacity(8);
        for u in units {
            udw.push(u % 10);
            udw.push(u / 10);
        }
        Some(vec![AncMeta {
            did: 0x60,
            sdid: 0x60,
            udw,
            line_number: 9,
            horizontal_offset: 0,
            stream_num: 0,
        }])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
