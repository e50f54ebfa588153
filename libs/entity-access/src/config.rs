//! Configuration for the entity-access layer.

use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::error::AccessError;
use crate::rules::DefaultPolicy;
use crate::serializer::{NamingPolicy, TypeNames};

/// Prefix of environment overrides, e.g. `ENTITY_ACCESS__DEFAULT_SELECT=deny`.
pub const ENV_PREFIX: &str = "ENTITY_ACCESS__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EntityAccessConfig {
    /// Casing of every key written by the graph serializer.
    pub naming_policy: NamingPolicy,

    /// Select behaviour for entity types without a select rule.
    pub default_select: DefaultPolicy,

    /// Whether `$type` carries the declared entity name or the Rust type path.
    pub type_names: TypeNames,
}

impl EntityAccessConfig {
    /// Loads defaults, then the optional YAML file, then environment overrides.
    ///
    /// # Errors
    /// Returns [`AccessError::Config`] on unreadable files, unknown keys or
    /// invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self, AccessError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        tracing::debug!(
            naming_policy = ?config.naming_policy,
            default_select = ?config.default_select,
            type_names = ?config.type_names,
            "loaded entity access configuration"
        );
        Ok(config)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = EntityAccessConfig::default();
        assert_eq!(config.naming_policy, NamingPolicy::CamelCase);
        assert_eq!(config.default_select, DefaultPolicy::Allow);
        assert_eq!(config.type_names, TypeNames::Declared);
    }

    #[test]
    fn test_yaml_then_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "entity-access.yaml",
                "naming_policy: snake_case\ndefault_select: deny\n",
            )?;
            jail.set_env("ENTITY_ACCESS__TYPE_NAMES", "qualified");
            jail.set_env("ENTITY_ACCESS__DEFAULT_SELECT", "allow");

            let config = EntityAccessConfig::load(Some(Path::new("entity-access.yaml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.naming_policy, NamingPolicy::SnakeCase);
            assert_eq!(config.default_select, DefaultPolicy::Allow);
            assert_eq!(config.type_names, TypeNames::Qualified);
            Ok(())
        });
    }

    #[test]
    fn test_unknown_key_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.yaml", "default_selekt: deny\n")?;
            let err = EntityAccessConfig::load(Some(Path::new("bad.yaml"))).unwrap_err();
            assert!(matches!(err, AccessError::Config(_)));
            Ok(())
        });
    }
}
