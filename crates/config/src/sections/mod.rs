// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use serde::{Deserialize, Serialize};

mod listener;

pub use self::listener::{ListenerConfig, TlsConfig};
use crate::util::ConfigurationSection;

/// Application configuration root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    /// Configuration of the listener
    #[serde(default)]
    pub listener: ListenerConfig,
}

impl ConfigurationSection for RootConfig {
    fn validate(
        &self,
        figment: &figment::Figment,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.listener.validate(figment)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use figment::{
        Figment, Jail,
        providers::{Format, Yaml},
    };

    use super::*;

    #[test]
    fn load_root_config() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r"
                    listener:
                      port: 8080
                      tls:
                        certificate_file: cert.pem
                        key_file: key.pem
                ",
            )?;

            let figment = Figment::new().merge(Yaml::file("config.yaml"));
            let config = RootConfig::extract(&figment).unwrap();

            assert_eq!(config.listener.port, 8080);
            assert_eq!(
                config.listener.tls.key_file.as_deref(),
                Some(camino::Utf8Path::new("key.pem"))
            );

            Ok(())
        });
    }

    #[test]
    fn root_config_validates_its_sections() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r"
                    listener:
                      detection_timeout: 0
                ",
            )?;

            let figment = Figment::new().merge(Yaml::file("config.yaml"));
            assert!(RootConfig::extract(&figment).is_err());

            Ok(())
        });
    }
}
