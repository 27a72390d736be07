//! Reference producer and consumer applications.
//!
//! The producer feeds frames from a `.yuv422p10be` or `.rgba` source
//! file (or a generated test pattern) into a TX session; the consumer
//! unpacks received frames into a memory-mapped scratch file under
//! /tmp. Both are deliberately simple - the interesting machinery
//! lives in `streaming`.

pub mod consumer;
pub mod producer;

pub use consumer::{AncLogger, AudioSink, ScratchFileConsumer};
pub use producer::{FileProducer, TestToneProducer, TimecodeAncProducer};
