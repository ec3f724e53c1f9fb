//! Attribute access policy applied to peer requests.

use crate::config::Config;
use crate::error::{Result, TetherError};
use crate::object::Servant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Get,
    Set,
    Delete,
}

impl Access {
    fn allowed(self, config: &Config) -> bool {
        match self {
            Access::Get => config.allow_getattr,
            Access::Set => config.allow_setattr,
            Access::Delete => config.allow_delattr,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Access::Get => "get",
            Access::Set => "set",
            Access::Delete => "delete",
        }
    }
}

fn denied(name: &str, access: Access) -> TetherError {
    TetherError::attribute(format!("cannot {} attribute '{}'", access.verb(), name))
}

/// Decide which attribute name a peer request for `name` resolves to.
///
/// A name passes when any enabled rule admits it: all attributes, the
/// exposed prefix, the safe set, or public (no leading underscore) names.
/// A bare name whose prefixed form exists on the target resolves to the
/// prefixed form unless the bare name exists too.
pub(crate) fn check_attr(
    config: &Config,
    target: &dyn Servant,
    name: &str,
    access: Access,
) -> Result<String> {
    if !access.allowed(config) {
        return Err(denied(name, access));
    }
    let prefix = config
        .allow_exposed_attrs
        .then_some(config.exposed_prefix.as_str())
        .filter(|p| !p.is_empty());

    let plain = config.allow_all_attrs
        || prefix.is_some_and(|p| name.starts_with(p))
        || (config.allow_safe_attrs && config.is_safe_attr(name))
        || (config.allow_public_attrs && !name.starts_with('_'));
    let exposed = prefix
        .map(|p| format!("{}{}", p, name))
        .filter(|full| target.has_attr(full));

    match exposed {
        Some(full) if !(plain && target.has_attr(name)) => Ok(full),
        _ if plain => Ok(name.to_string()),
        _ => Err(denied(name, access)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposed::Exposed;
    use crate::object::Object;

    fn target() -> Exposed {
        Exposed::builder("tests", "Target")
            .exposed("echo", |args| Ok(args.get(0)?.clone()))
            .method("__len__", |_| Ok(Object::from(0)))
            .attr("public", 1)
            .attr("_private", 2)
            .build()
    }

    #[test]
    fn test_exposed_names_resolve_with_or_without_prefix() {
        let config = Config::default();
        let t = target();
        assert_eq!(check_attr(&config, &t, "echo", Access::Get).unwrap(), "exposed_echo");
        assert_eq!(
            check_attr(&config, &t, "exposed_echo", Access::Get).unwrap(),
            "exposed_echo"
        );
    }

    #[test]
    fn test_safe_and_public_rules() {
        let t = target();
        let config = Config::default();
        assert_eq!(check_attr(&config, &t, "__len__", Access::Get).unwrap(), "__len__");
        assert!(check_attr(&config, &t, "public", Access::Get).is_err());

        let public = Config {
            allow_public_attrs: true,
            ..Config::default()
        };
        assert_eq!(check_attr(&public, &t, "public", Access::Get).unwrap(), "public");
        assert!(check_attr(&public, &t, "_private", Access::Get).is_err());

        let all = Config {
            allow_all_attrs: true,
            ..Config::default()
        };
        assert_eq!(check_attr(&all, &t, "_private", Access::Get).unwrap(), "_private");
    }

    #[test]
    fn test_master_switches() {
        let t = target();
        let config = Config::default();
        let err = check_attr(&config, &t, "exposed_echo", Access::Set).unwrap_err();
        assert_eq!(
            err.exception().unwrap().message(),
            "cannot set attribute 'exposed_echo'"
        );
        assert!(check_attr(&config, &t, "exposed_echo", Access::Delete).is_err());

        let writable = Config {
            allow_setattr: true,
            ..Config::default()
        };
        assert!(check_attr(&writable, &t, "exposed_echo", Access::Set).is_ok());
    }

    #[test]
    fn test_denied_error_is_attribute_error() {
        let err = check_attr(&Config::default(), &target(), "secret", Access::Get).unwrap_err();
        let exc = err.exception().unwrap();
        assert!(exc.is_instance_of("AttributeError"));
        assert_eq!(exc.message(), "cannot get attribute 'secret'");
    }
}
