//! Daemon configuration.
//!
//! The configuration is built once at startup and shared immutably for the
//! lifetime of the process. Mutable per-stream state (volume, ABR) lives on
//! the transport, not here.

use serde::Deserialize;
use std::{collections::HashSet, sync::Arc};

use crate::codec::VendorCodecs;

/// Which Bluetooth audio profiles the daemon offers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Enable {
    /// A2DP source (we stream to the remote device).
    pub a2dp_source: bool,
    /// A2DP sink (the remote device streams to us).
    pub a2dp_sink: bool,
    /// HFP audio gateway.
    pub hfp_ag: bool,
    /// HFP hands-free.
    pub hfp_hf: bool,
    /// HSP audio gateway.
    pub hsp_ag: bool,
    /// HSP headset.
    pub hsp_hs: bool,
}

impl Default for Enable {
    fn default() -> Self {
        // output profiles are on by default
        Self { a2dp_source: true, a2dp_sink: false, hfp_ag: true, hfp_hf: false, hsp_ag: true, hsp_hs: false }
    }
}

/// A2DP streaming options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct A2dp {
    /// Forward volume to the peer instead of scaling samples locally.
    pub volume: bool,
    /// Advertise mono only.
    pub force_mono: bool,
    /// Advertise 44.1 kHz only.
    pub force_44100: bool,
    /// Seconds to keep the Bluetooth link open after the client closes the
    /// PCM; zero releases immediately.
    pub keep_alive: u32,
}

impl Default for A2dp {
    fn default() -> Self {
        Self { volume: false, force_mono: false, force_44100: false, keep_alive: 0 }
    }
}

/// AAC encoder options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Aac {
    /// Enable the encoder afterburner.
    ///
    /// Uses considerably more power and produces larger payloads, so it is
    /// off by default.
    pub afterburner: bool,
    /// VBR mode, 0 (off) to 5.
    pub vbr_mode: u8,
}

impl Default for Aac {
    fn default() -> Self {
        Self { afterburner: false, vbr_mode: 4 }
    }
}

/// MPEG-1 layer III encoder options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Mp3 {
    /// Encoder quality, 0 (best) to 9.
    pub quality: u8,
    /// VBR quality, 0 (best) to 9.
    pub vbr_quality: u8,
}

impl Default for Mp3 {
    fn default() -> Self {
        Self { quality: 5, vbr_quality: 2 }
    }
}

/// LDAC encoder options.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ldac {
    /// Enable adaptive bit rate.
    pub abr: bool,
    /// Encoder quality index, 0 (high) to 2 (mobile).
    pub eqmid: u8,
}

impl Default for Ldac {
    fn default() -> Self {
        Self { abr: false, eqmid: 1 }
    }
}

/// Process-wide daemon configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Profile enable switches.
    pub enable: Enable,
    /// A2DP options.
    pub a2dp: A2dp,
    /// AAC options.
    pub aac: Aac,
    /// MP3 options.
    pub mp3: Mp3,
    /// LDAC options.
    pub ldac: Ldac,
    /// Restrict the daemon to the named adapters (e.g. `hci0`); empty
    /// accepts all.
    pub hci_filter: HashSet<String>,
    /// Vendor codec handles injected by the embedding application.
    #[serde(skip)]
    pub codecs: VendorCodecs,
}

impl Config {
    /// Parses a configuration from YAML text.
    pub fn from_yaml(text: &str) -> crate::Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| crate::Error::with_message(crate::ErrorKind::InvalidArguments, err.to_string()))
    }

    /// True when the adapter with the given name should be served.
    pub fn adapter_enabled(&self, name: &str) -> bool {
        self.hci_filter.is_empty() || self.hci_filter.contains(name)
    }

    /// Wraps the configuration for concurrent sharing.
    pub fn into_shared(self) -> Arc<Config> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_output_profiles() {
        let config = Config::default();
        assert!(config.enable.a2dp_source);
        assert!(config.enable.hfp_ag);
        assert!(config.enable.hsp_ag);
        assert!(!config.enable.a2dp_sink);
        assert!(!config.enable.hfp_hf);
        assert_eq!(config.a2dp.keep_alive, 0);
        assert!(!config.a2dp.volume);
        assert_eq!(config.aac.vbr_mode, 4);
        assert!(!config.ldac.abr);
    }

    #[test]
    fn yaml_overrides() {
        let config = Config::from_yaml(
            "enable:\n  a2dp_sink: true\na2dp:\n  keep_alive: 5\nhci_filter: [hci1]\n",
        )
        .unwrap();
        assert!(config.enable.a2dp_sink);
        // untouched fields keep their defaults
        assert!(config.enable.a2dp_source);
        assert_eq!(config.a2dp.keep_alive, 5);
        assert!(config.adapter_enabled("hci1"));
        assert!(!config.adapter_enabled("hci0"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_yaml("bogus: 1\n").is_err());
    }

    #[test]
    fn empty_filter_accepts_all() {
        let config = Config::default();
        assert!(config.adapter_enabled("hci0"));
        assert!(config.adapter_enabled("hci7"));
    }
}
