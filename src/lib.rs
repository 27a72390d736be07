//! SMPTE ST 2110 media streaming engine.
//!
//! `streaming` holds the wire-level core: RTP packet building, the
//! TPRS pacing scheduler, receive-side reassembly and repair, the PTP
//! slave and the EBU compliance monitor. `app` carries the reference
//! producer/consumer pair and `config` the persisted parameters.

pub mod app;
pub mod config;
pub mod streaming;
