//! Stream configuration storage.
//!
//! The CLI flags cover everything, but recurring setups (lab rigs with
//! fixed addresses and formats) can live in a TOML file that the flags
//! then override.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted stream parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Destination IPv4 (multicast group or unicast receiver).
    pub dst_ip: Option<String>,
    /// Source IPv4 bound on the NIC.
    pub src_ip: Option<String>,
    /// Destination MAC for unicast flows.
    pub dst_mac: Option<String>,
    /// UDP base port; session i uses base + i.
    pub udp_port: Option<u16>,
    /// Format index 0..5 (720p/1080p/2160p x intel/other prefix).
    pub fmt_index: Option<u32>,
    pub interlaced: Option<bool>,
    /// Frame rate: 25, 29, 50 or 59.
    pub rate: Option<u32>,
    /// Video session count.
    pub sessions: Option<u32>,
    pub audio_sessions: Option<u32>,
    pub anc_sessions: Option<u32>,
    /// Pacer type: "tpn", "tpnl" or "tpw".
    pub pacer: Option<String>,
    /// Link speed in Gbps the pacing tables assume.
    pub nic_speed: Option<u32>,
    /// PTP master clock id, 8 hex bytes ("aa:bb:cc:ff:fe:01:02:03").
    pub ptp_clock_id: Option<String>,
    /// PTP address mode: "u" or "m".
    pub ptp_addr_mode: Option<String>,
    /// PTP step mode: "o" or "t".
    pub ptp_step_mode: Option<String>,
    pub ebu_check: Option<bool>,
    /// Source buffer format: "yuv10be" or "rgba".
    pub buf_format: Option<String>,
    /// Mark media flows DSCP expedited forwarding.
    pub dscp_expedited: Option<bool>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            dst_ip: None,
            src_ip: None,
            dst_mac: None,
            udp_port: None,
            fmt_index: None,
            interlaced: None,
            rate: None,
            sessions: None,
            audio_sessions: None,
            anc_sessions: None,
            pacer: None,
            nic_speed: None,
            ptp_clock_id: None,
            ptp_addr_mode: None,
            ptp_step_mode: None,
            ebu_check: None,
            buf_format: None,
            dscp_expedited: None,
        }
    }
}

impl StreamConfig {
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "st2110-cli", "st2110-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load from the default location, or an explicit file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Parse the "aa:bb:cc:dd:ee:ff" MAC form.
    pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            anyhow::bail!("MAC must be six colon-separated bytes: {s}");
        }
        let mut mac = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            mac[i] = u8::from_str_radix(p, 16).with_context(|| format!("bad MAC byte {p}"))?;
        }
        Ok(mac)
    }

    /// Parse an 8-byte PTP clock id in colon-hex form.
    pub fn parse_clock_id(s: &str) -> Result<[u8; 8]> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 8 {
            anyhow::bail!("clock id must be eight colon-separated bytes: {s}");
        }
        let mut id = [0u8; 8];
        for (i, p) in parts.iter().enumerate() {
            id[i] = u8::from_str_radix(p, 16).with_context(|| format!("bad clock id byte {p}"))?;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            StreamConfig::parse_mac("01:00:5e:01:02:03").unwrap(),
            [0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]
        );
        assert!(StreamConfig::parse_mac("01:00:5e").is_err());
        assert!(StreamConfig::parse_mac("zz:00:5e:01:02:03").is_err());
    }

    #[test]
    fn test_parse_clock_id() {
        assert_eq!(
            StreamConfig::parse_clock_id("aa:bb:cc:ff:fe:01:02:03").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xff, 0xfe, 0x01, 0x02, 0x03]
        );
        assert!(StreamConfig::parse_clock_id("aa:bb").is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let cfg = StreamConfig {
            dst_ip: Some("239.0.0.1".into()),
            rate: Some(29),
            sessions: Some(2),
            ..Default::default()
        };
        let s = toml::to_string(&cfg).unwrap();
        let back: StreamConfig = toml::from_str(&s).unwrap();
        assert_eq!(back.dst_ip.as_deref(), Some("239.0.0.1"));
        assert_eq!(back.rate, Some(29));
    }
}
