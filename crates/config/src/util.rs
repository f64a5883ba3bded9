// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use figment::Figment;
use serde::de::DeserializeOwned;

/// A part of the configuration which can be loaded and validated on its own
pub trait ConfigurationSection: Sized + DeserializeOwned {
    /// Where this section lives relative to the root, [`None`] for the root
    /// itself
    const PATH: Option<&'static str> = None;

    /// Validate the configuration section
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid
    fn validate(
        &self,
        _figment: &Figment,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(())
    }

    /// Extract and validate the section from a [`Figment`]
    ///
    /// # Errors
    ///
    /// Returns an error if the section is missing, could not be deserialized,
    /// or is invalid
    fn extract(
        figment: &Figment,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let this: Self = if let Some(path) = Self::PATH {
            figment.extract_inner(path)?
        } else {
            figment.extract()?
        };

        this.validate(figment)?;
        Ok(this)
    }
}

/// Extension trait for sections which have a sensible default
pub trait ConfigurationSectionExt: ConfigurationSection + Default {
    /// Extract the section from the given [`Figment`], falling back to the
    /// default value if it is not present at all.
    ///
    /// # Errors
    ///
    /// Returns an error if the section is present but invalid
    fn extract_or_default(
        figment: &Figment,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let this: Self = if let Some(path) = Self::PATH {
            if !figment.contains(path) {
                return Ok(Self::default());
            }

            figment.extract_inner(path)?
        } else {
            figment.extract()?
        };

        this.validate(figment)?;
        Ok(this)
    }
}

impl<T: ConfigurationSection + Default> ConfigurationSectionExt for T {}

/// Build a validation error pointing at a field of a section, so that it is
/// reported with the file it comes from
pub(crate) fn field_error(
    figment: &Figment,
    section: &'static str,
    field: &'static str,
    message: impl Into<String>,
) -> figment::Error {
    let mut error = figment::Error::from(message.into());
    error.metadata = figment.find_metadata(section).cloned();
    error.profile = Some(figment::Profile::Default);
    error.path = section
        .split('.')
        .chain(std::iter::once(field))
        .map(ToOwned::to_owned)
        .collect();
    error
}
