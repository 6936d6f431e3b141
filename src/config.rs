// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Allocator configuration.
//!
//! Every field has a default matching an NVIDIA device plugin on an hwloc-described node, so an empty
//! JSON object is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::hardware::ObjectKind;

pub const DEFAULT_RESOURCE_NAME: &str = "nvidia.com/gpu-topo";
pub const DEFAULT_IDENTIFIER_ATTRIBUTE: &str = "NVIDIAUUID";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Extended resource name the allocator serves.
    pub resource_name: String,
    /// Info attribute of a GPU object holding its stable identifier.
    pub identifier_attribute: String,
    /// Hardware level whose objects become the children of the tree root.
    pub top_level_kind: ObjectKind,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            identifier_attribute: DEFAULT_IDENTIFIER_ATTRIBUTE.to_string(),
            top_level_kind: ObjectKind::Package,
        }
    }
}

impl AllocatorConfig {
    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: AllocatorConfig = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource_name.trim().is_empty() {
            return Err(ConfigError::Invalid("resource_name must not be empty".to_string()));
        }
        if self.identifier_attribute.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "identifier_attribute must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
