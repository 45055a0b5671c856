//! Effective database user/group resolution.
//!
//! Precedence: explicit connection parameters > IdP-asserted values >
//! driver defaults. The one exception is the asserted
//! `allow_db_user_override` flag, which decides whether a connection-supplied
//! `db_user` may shadow the one the IdP asserted.

use crate::config::{PluginConfig, keys};
use crate::core::{FederationError, IamMetadata, Result};
use tracing::debug;

/// Merge IdP-asserted metadata with connection-supplied settings.
pub fn resolve(config: &PluginConfig, asserted: Option<&IamMetadata>) -> Result<IamMetadata> {
    let connection_user = config.get_non_empty(keys::DB_USER).map(str::to_string);
    let connection_groups: Option<Vec<String>> = config.get_non_empty(keys::DB_GROUPS).map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect()
    });

    let allow_override = asserted.is_none_or(|m| m.allow_db_user_override);
    let asserted_user = asserted.and_then(|m| m.db_user.clone());

    let db_user = if allow_override {
        connection_user.or(asserted_user)
    } else {
        asserted_user.or(connection_user)
    };

    let mut db_groups = connection_groups
        .or_else(|| asserted.map(|m| m.db_groups.clone()))
        .unwrap_or_default();

    if let Some(pattern) = config.get_non_empty(keys::DB_GROUPS_FILTER) {
        let filter = regex::Regex::new(pattern).map_err(|e| {
            FederationError::Unexpected(format!("invalid db_groups_filter regex: {e}"))
        })?;
        db_groups.retain(|group| !filter.is_match(group));
    }

    let force_lowercase = config.get_bool(keys::FORCE_LOWERCASE, false)
        || asserted.is_some_and(|m| m.force_lowercase);
    let auto_create = config.get_bool(keys::AUTO_CREATE, false)
        || asserted.is_some_and(|m| m.auto_create);

    let db_user = if force_lowercase {
        db_user.map(|u| u.to_lowercase())
    } else {
        db_user
    };
    if force_lowercase {
        for group in &mut db_groups {
            *group = group.to_lowercase();
        }
    }

    debug!(?db_user, groups = db_groups.len(), auto_create, "resolved effective metadata");

    Ok(IamMetadata {
        db_user,
        db_groups,
        auto_create,
        force_lowercase,
        allow_db_user_override: allow_override,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn asserted(user: &str, allow_override: bool) -> IamMetadata {
        IamMetadata {
            db_user: Some(user.to_string()),
            db_groups: vec!["admin".into(), "readonly".into(), "temp_x".into()],
            auto_create: false,
            force_lowercase: false,
            allow_db_user_override: allow_override,
        }
    }

    #[test]
    fn group_filter_drops_matching_entries() {
        let mut config = PluginConfig::new();
        config.set(keys::DB_GROUPS_FILTER, "temp_.*");

        let resolved = resolve(&config, Some(&asserted("alice", false))).unwrap();
        assert_eq!(resolved.db_groups, vec!["admin".to_string(), "readonly".to_string()]);
    }

    #[test]
    fn override_flag_lets_connection_user_win() {
        let mut config = PluginConfig::new();
        config.set(keys::DB_USER, "bob");

        let allowed = resolve(&config, Some(&asserted("alice", true))).unwrap();
        assert_eq!(allowed.db_user.as_deref(), Some("bob"));

        let denied = resolve(&config, Some(&asserted("alice", false))).unwrap();
        assert_eq!(denied.db_user.as_deref(), Some("alice"));
    }

    #[test]
    fn connection_user_used_when_nothing_asserted() {
        let mut config = PluginConfig::new();
        config.set(keys::DB_USER, "carol");
        let resolved = resolve(&config, None).unwrap();
        assert_eq!(resolved.db_user.as_deref(), Some("carol"));
    }

    #[test]
    fn force_lowercase_applies_to_user_and_groups() {
        let mut config = PluginConfig::new();
        config.set(keys::FORCE_LOWERCASE, "true");

        let mut meta = asserted("Alice", false);
        meta.db_groups = vec!["Admins".into()];
        let resolved = resolve(&config, Some(&meta)).unwrap();

        assert_eq!(resolved.db_user.as_deref(), Some("alice"));
        assert_eq!(resolved.db_groups, vec!["admins".to_string()]);
    }

    #[test]
    fn invalid_filter_regex_fails() {
        let mut config = PluginConfig::new();
        config.set(keys::DB_GROUPS_FILTER, "(unclosed");
        assert!(resolve(&config, None).is_err());
    }
}
