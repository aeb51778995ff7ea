// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for the clonemem capture/populate engine.
//!
//! Parsed from TOML, for example:
//!
//! ```toml
//! [engine]
//! id = "clonemem"
//! threads = 4
//!
//! [sections]
//! index0_size = 67108864
//! index1_size = 67108864
//! pin_size = 16777216
//!
//! [backend]
//! kind = "hypercall"
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: Engine,

    #[serde(default)]
    pub sections: Sections,

    #[serde(default)]
    pub backend: Backend,
}

impl Config {
    /// Load and validate the configuration stored at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.id.is_empty() || self.engine.id.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "engine id {:?} cannot name a shared object",
                self.engine.id
            )));
        }
        if self.engine.threads == 0 {
            return Err(ConfigError::Invalid(
                "at least one worker thread is required".to_string(),
            ));
        }
        for (name, size) in [
            ("index0_size", self.sections.index0_size),
            ("index1_size", self.sections.index1_size),
            ("pin_size", self.sections.pin_size),
        ] {
            if size == 0 || size % PAGE_SIZE != 0 {
                return Err(ConfigError::Invalid(format!(
                    "sections.{name} ({size}) must be a non-zero multiple \
                    of {PAGE_SIZE}"
                )));
            }
        }
        if self.backend.kind == BackendKind::Inproc
            && self.backend.inproc_pages == 0
        {
            return Err(ConfigError::Invalid(
                "backend.inproc_pages must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Engine {
    /// Prefix used when naming the engine's cross-process mutexes.
    #[serde(default = "Engine::default_id")]
    pub id: String,

    /// Number of worker threads, each of which gets its own context.
    #[serde(default = "Engine::default_threads")]
    pub threads: usize,

    /// Release VM-owned frames from the physmap once they are captured.
    #[serde(default = "Engine::default_remove_captured")]
    pub remove_captured: bool,
}
impl Engine {
    fn default_id() -> String {
        "clonemem".to_string()
    }
    fn default_threads() -> usize {
        4
    }
    fn default_remove_captured() -> bool {
        true
    }
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            id: Self::default_id(),
            threads: Self::default_threads(),
            remove_captured: Self::default_remove_captured(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Sections {
    #[serde(default = "Sections::default_index_size")]
    pub index0_size: u64,
    #[serde(default = "Sections::default_index_size")]
    pub index1_size: u64,
    #[serde(default = "Sections::default_pin_size")]
    pub pin_size: u64,

    /// Attempt to lock the pin section resident once it is opened.
    #[serde(default = "Sections::default_pin")]
    pub pin: bool,
}
impl Sections {
    fn default_index_size() -> u64 {
        64 * 1024 * 1024
    }
    fn default_pin_size() -> u64 {
        16 * 1024 * 1024
    }
    fn default_pin() -> bool {
        true
    }
}
impl Default for Sections {
    fn default() -> Self {
        Self {
            index0_size: Self::default_index_size(),
            index1_size: Self::default_index_size(),
            pin_size: Self::default_pin_size(),
            pin: Self::default_pin(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Hypercall,
    Inproc,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Backend {
    #[serde(default)]
    pub kind: BackendKind,

    /// Directory holding per-VM hypervisor memory devices.
    #[serde(default = "Backend::default_device")]
    pub device: String,

    /// Guest RAM size, in pages, for the in-process backend.
    #[serde(default = "Backend::default_inproc_pages")]
    pub inproc_pages: u64,

    /// Return LZ4 compressed pages from the in-process backend.
    #[serde(default)]
    pub inproc_compress: bool,
}
impl Backend {
    fn default_device() -> String {
        "/dev/hvmem".to_string()
    }
    fn default_inproc_pages() -> u64 {
        256 * 1024
    }
}
impl Default for Backend {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            device: Self::default_device(),
            inproc_pages: Self::default_inproc_pages(),
            inproc_compress: false,
        }
    }
}
