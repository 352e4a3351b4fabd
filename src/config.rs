// vim: tw=80
//! Typed configuration, parsed from the host's name→value dictionary.
//!
//! The specification describes configuration as an untyped nvlist-style
//! dictionary (`children`, `nparity`, `type`). This crate parses that
//! dictionary into a `Config` with `serde` + `serde_yaml`, the same
//! combination the teacher uses for its on-disk/over-the-wire structured
//! records, rather than hand-rolling nvlist decoding.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    types::MAX_NPARITY,
};

/// One child vdev subtree. The specification leaves child vdevs opaque;
/// this crate only needs a path to a backing file or device.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChildSpec {
    pub path: PathBuf,
}

/// A parsed, validated RAID-Y vdev configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(rename = "type")]
    pub vdev_type: String,
    pub nparity: u8,
    pub children: Vec<ChildSpec>,
    /// Stripe size in bytes, overriding `DEFAULT_STRIPE_SIZE`. Must be a
    /// power of two when present.
    #[serde(default)]
    pub stripe_size: Option<u32>,
}

impl Config {
    /// Parse and validate a configuration from its YAML-encoded nvlist
    /// representation. A malformed or semantically invalid configuration is
    /// rejected here, before any child is opened.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(s)
            .map_err(|e| Error::ConfigurationInvalid(format!("malformed config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.vdev_type != "raidy" {
            return Err(Error::ConfigurationInvalid(format!(
                "unexpected vdev type {:?}, expected \"raidy\"",
                self.vdev_type
            )));
        }
        if self.nparity < 1 || self.nparity > MAX_NPARITY {
            return Err(Error::ConfigurationInvalid(format!(
                "nparity must be 1..={MAX_NPARITY}, got {}",
                self.nparity
            )));
        }
        if self.children.len() <= self.nparity as usize {
            return Err(Error::ConfigurationInvalid(format!(
                "need more than nparity={} children, got {}",
                self.nparity,
                self.children.len()
            )));
        }
        if let Some(s) = self.stripe_size {
            if !s.is_power_of_two() {
                return Err(Error::ConfigurationInvalid(format!(
                    "stripe_size {s} is not a power of two"
                )));
            }
        }
        Ok(())
    }

    /// Number of data columns: `children - nparity`.
    pub fn ndata(&self) -> u8 {
        self.children.len() as u8 - self.nparity
    }
}
