// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Halo exchange configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from the `HALO_CONFIG_PATH` environment variable
//! 3. Environment variables (`HALO_PACKING_*`, `HALO_CUDA_*`)
//! 4. Whatever provider the caller merges on top via [`HaloConfig::extract_from`]

use figment::{
    Figment, Provider,
    providers::{Env, Format, Json, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct HaloConfig {
    #[validate(nested)]
    #[serde(default)]
    pub packing: PackingConfig,

    #[validate(nested)]
    #[serde(default)]
    pub cuda: CudaConfig,
}

/// Packing kernel parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PackingConfig {
    /// Alignment granularity in bytes. Part of the compiled kernel key and the
    /// padding unit for exchange matrix device allocations.
    #[validate(custom(function = "validate_alignment"))]
    pub alignment: usize,

    /// Threads per block when launching the gather kernel on a real device.
    #[validate(range(min = 1, max = 1024))]
    pub block_size: u32,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            alignment: 32,
            block_size: 128,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CudaConfig {
    pub device_id: usize,

    /// NVRTC `--gpu-architecture` override, e.g. `compute_90`.
    /// None = query the device's compute capability.
    #[serde(default)]
    pub arch: Option<String>,
}

fn validate_alignment(alignment: usize) -> Result<(), ValidationError> {
    if alignment == 0 || alignment > 4096 || !alignment.is_power_of_two() {
        return Err(ValidationError::new("alignment_power_of_two"));
    }
    Ok(())
}

impl HaloConfig {
    pub fn figment() -> Figment {
        let config_path = std::env::var("HALO_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(HaloConfig::default()))
            .merge(Toml::file(&config_path))
            // HALO_PACKING_ALIGNMENT, HALO_PACKING_BLOCK_SIZE
            .merge(
                Env::prefixed("HALO_PACKING_")
                    .map(|k| format!("packing.{}", k.as_str().to_lowercase()).into()),
            )
            // HALO_CUDA_DEVICE_ID, HALO_CUDA_ARCH
            .merge(
                Env::prefixed("HALO_CUDA_")
                    .map(|k| format!("cuda.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = HaloConfig::extract_from(
    ///     HaloConfig::figment().merge(("packing.alignment", 64usize)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with JSON overrides taking the highest priority.
    pub fn from_figment_with_json(json: &str) -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment().merge(Json::string(json)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = HaloConfig::default();
        assert_eq!(config.packing.alignment, 32);
        assert_eq!(config.packing.block_size, 128);
        assert_eq!(config.cuda.device_id, 0);
        assert!(config.cuda.arch.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("HALO_PACKING_ALIGNMENT", "64");
            jail.set_env("HALO_CUDA_DEVICE_ID", "3");

            let config = HaloConfig::from_env().expect("config loads");
            assert_eq!(config.packing.alignment, 64);
            assert_eq!(config.cuda.device_id, 3);
            Ok(())
        });
    }

    #[test]
    fn test_toml_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "halo.toml",
                r#"
                [packing]
                alignment = 128
                block_size = 256

                [cuda]
                arch = "compute_90"
                "#,
            )?;
            jail.set_env("HALO_CONFIG_PATH", "halo.toml");

            let config = HaloConfig::from_env().expect("config loads");
            assert_eq!(config.packing.alignment, 128);
            assert_eq!(config.packing.block_size, 256);
            assert_eq!(config.cuda.arch.as_deref(), Some("compute_90"));
            Ok(())
        });
    }

    #[test]
    fn test_rejects_non_power_of_two_alignment() {
        let result = HaloConfig::from_figment_with_json(r#"{"packing": {"alignment": 48}}"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_oversized_block() {
        let result = HaloConfig::from_figment_with_json(r#"{"packing": {"block_size": 4096}}"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
