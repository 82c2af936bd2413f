//! Lab configuration injected into every program.
//!
//! An [`AwgConfig`] describes the instruments of a setup: which AWGs exist and which of their
//! channels are wired, which AWG is the trigger master, per-channel amplifier gains and RF
//! power ceilings, named marker aliases and the timing of the master/slave trigger handshake.
//! The configuration is immutable once built and is shared between programs through an
//! `Arc<AwgConfig>`.
//!
//! Channels are addressed by [`ChannelId`], written `"<awg>/ch<n>"`:
//!
//! ```
//! use awgcompiler_backend::config::*;
//!
//! let id: ChannelId = "128m/ch1".parse().unwrap();
//! assert_eq!(id.awg, "128m");
//! assert_eq!(id.ch, 1);
//! assert_eq!(id.to_string(), "128m/ch1");
//!
//! let config = AwgConfig::default();
//! assert_eq!(config.amplifier_gain(&id), Some(10.));
//! assert_eq!(config.max_sine_avg_power(&id), Some(1.));
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use indexmap::{indexmap, IndexMap};
use maplit::convert_args;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AwgError, Result};
use crate::utils::*;

/// AWG name to list of channel numbers.
pub type ChannelMap = IndexMap<String, Vec<u8>>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    pub awg: String,
    pub ch: u8,
}

impl ChannelId {
    pub fn new(awg: &str, ch: u8) -> Self {
        Self {
            awg: awg.to_string(),
            ch,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/ch{}", self.awg, self.ch)
    }
}

impl FromStr for ChannelId {
    type Err = AwgError;

    fn from_str(s: &str) -> Result<Self> {
        let re = Regex::new(r"^(?P<awg>[^/\s]+)/ch(?P<ch>\d+)$")
            .map_err(|e| AwgError::config(e.to_string()))?;
        let caps = re
            .captures(s.trim())
            .ok_or_else(|| AwgError::UnknownChannel(s.to_string()))?;
        let ch = caps["ch"]
            .parse::<u8>()
            .map_err(|_| AwgError::UnknownChannel(s.to_string()))?;
        Ok(ChannelId::new(&caps["awg"], ch))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = AwgError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(value: ChannelId) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Smpl,
    Sync,
}

/// A named digital marker line, e.g. the gate of a counter wired to the sync marker of `2g/ch2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerAlias {
    pub channel: ChannelId,
    pub marker: MarkerKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwgConfig {
    /// Every channel of every instrument in the setup, in connection order.
    pub channels: ChannelMap,
    /// Instrument addresses handed to the transport when connecting.
    pub addresses: IndexMap<String, String>,
    pub master_awg: Option<String>,
    pub master_trigger_channel: Option<u8>,
    pub marker_alias: IndexMap<String, MarkerAlias>,
    /// Ceiling on the average RF power in W. Channels not listed are unlimited.
    pub max_sine_avg_power: IndexMap<ChannelId, f64>,
    /// Gain in W at full DAC amplitude of the amplifier behind each channel.
    pub amplifier_power: IndexMap<ChannelId, f64>,
    pub trigger_delay_length_mus: f64,
    /// Must not be longer than `trigger_delay_length_mus`.
    pub trigger_length_mus: f64,
    /// Idle time on the master after its sequence ends, before it starts over and triggers again.
    pub slave_trigger_safety_length_mus: f64,
    pub restore_awg_settings: bool,
}

impl Default for AwgConfig {
    fn default() -> Self {
        let alias = |awg: &str, n: u8, marker| MarkerAlias {
            channel: ChannelId::new(awg, n),
            marker,
        };
        Self {
            channels: indexmap! {
                "2g".to_string() => vec![1, 2],
                "128m".to_string() => vec![1, 2],
            },
            addresses: convert_args!(indexmap!(
                "2g" => "TCPIP0::localhost::hislip1::INSTR",
                "128m" => "TCPIP0::localhost::hislip2::INSTR",
            )),
            master_awg: Some("2g".to_string()),
            master_trigger_channel: Some(1),
            marker_alias: indexmap! {
                "green".to_string() => alias("2g", 2, MarkerKind::Smpl),
                "gate".to_string() => alias("2g", 2, MarkerKind::Sync),
                "red".to_string() => alias("128m", 1, MarkerKind::Sync),
                "infrared".to_string() => alias("128m", 1, MarkerKind::Smpl),
            },
            max_sine_avg_power: indexmap! { ChannelId::new("128m", 1) => 1.0 },
            amplifier_power: indexmap! {
                ChannelId::new("2g", 1) => 5.0,
                ChannelId::new("2g", 2) => 5.0,
                ChannelId::new("128m", 1) => 10.0,
            },
            trigger_delay_length_mus: 27. * BLM,
            trigger_length_mus: 27. * BLM,
            slave_trigger_safety_length_mus: 5. * BLM,
            restore_awg_settings: true,
        }
    }
}

impl AwgConfig {
    /// A single AWG with the given channels and no power limits; handy for tests and demos.
    pub fn single(awg: &str, channels: &[u8]) -> Self {
        Self {
            channels: indexmap! { awg.to_string() => channels.to_vec() },
            addresses: IndexMap::new(),
            master_awg: None,
            master_trigger_channel: None,
            marker_alias: IndexMap::new(),
            max_sine_avg_power: IndexMap::new(),
            amplifier_power: IndexMap::new(),
            ..Default::default()
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: AwgConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// All channels of the setup, awg by awg.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .flat_map(|(awg, chs)| chs.iter().map(move |&ch| ChannelId::new(awg, ch)))
            .collect()
    }

    pub fn has_channel(&self, id: &ChannelId) -> bool {
        self.channels
            .get(&id.awg)
            .map_or(false, |chs| chs.contains(&id.ch))
    }

    pub fn is_master(&self, awg: &str) -> bool {
        self.master_awg.as_deref() == Some(awg)
    }

    pub fn master_trigger(&self) -> Option<ChannelId> {
        Some(ChannelId::new(
            self.master_awg.as_deref()?,
            self.master_trigger_channel?,
        ))
    }

    pub fn amplifier_gain(&self, id: &ChannelId) -> Option<f64> {
        self.amplifier_power.get(id).copied()
    }

    pub fn max_sine_avg_power(&self, id: &ChannelId) -> Option<f64> {
        self.max_sine_avg_power.get(id).copied()
    }

    pub fn marker(&self, alias: &str) -> Option<&MarkerAlias> {
        self.marker_alias.get(alias)
    }

    /// Checks that `ch_map` only names channels of this setup and, when several AWGs are
    /// involved, that the master AWG and its trigger channel are part of it.
    pub fn valid_ch_map(&self, ch_map: &ChannelMap) -> Result<()> {
        if ch_map.is_empty() {
            return Err(AwgError::config("a program needs at least one channel"));
        }
        for (awg, chs) in ch_map {
            if chs.is_empty() {
                return Err(AwgError::config(format!("awg '{}' is listed without channels", awg)));
            }
            for &ch in chs {
                let id = ChannelId::new(awg, ch);
                if !self.has_channel(&id) {
                    return Err(AwgError::UnknownChannel(id.to_string()));
                }
            }
        }
        if ch_map.len() > 1 {
            let trigger = self.master_trigger().ok_or_else(|| {
                AwgError::config("programs on multiple awgs need a master awg and trigger channel")
            })?;
            if !ch_map
                .get(&trigger.awg)
                .map_or(false, |chs| chs.contains(&trigger.ch))
            {
                return Err(AwgError::config(format!(
                    "programs on multiple awgs must include the master trigger channel {}",
                    trigger
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(AwgError::config("no awg channels configured"));
        }
        if let Some(master) = &self.master_awg {
            if !self.channels.contains_key(master) {
                return Err(AwgError::config(format!("master awg '{}' is not configured", master)));
            }
        }
        if let Some(trigger) = self.master_trigger() {
            if !self.has_channel(&trigger) {
                return Err(AwgError::config(format!(
                    "master trigger channel {} is not configured",
                    trigger
                )));
            }
        }
        for (name, alias) in &self.marker_alias {
            if !self.has_channel(&alias.channel) {
                return Err(AwgError::config(format!(
                    "marker alias '{}' points to unknown channel {}",
                    name, alias.channel
                )));
            }
        }
        for (id, max) in &self.max_sine_avg_power {
            if *max <= 0. {
                return Err(AwgError::config(format!("power ceiling of {} must be positive", id)));
            }
            if self.amplifier_gain(id).is_none() {
                return Err(AwgError::config(format!(
                    "{} has a power ceiling but no amplifier gain",
                    id
                )));
            }
        }
        for length in [
            self.trigger_delay_length_mus,
            self.trigger_length_mus,
            self.slave_trigger_safety_length_mus,
        ] {
            valid_length_mus(length)?;
        }
        if self.trigger_length_mus > self.trigger_delay_length_mus {
            return Err(AwgError::config(
                "trigger_length_mus must not be longer than trigger_delay_length_mus",
            ));
        }
        Ok(())
    }
}
