//! The in-memory trust store: every public key and role authorization currently trusted.
//!
//! A `KeyDb` is rebuilt from scratch whenever root metadata is accepted, then extended with
//! delegated roles as their parents' targets metadata is verified. Role names are
//! hierarchical; `targets/plugins/gui` is a descendant of `targets/plugins` and of
//! `targets`, and removal cascades downward along that hierarchy.

use crate::error::{self, Result};
use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use crate::schema::{PathPattern, RoleKeys, Root};
use snafu::ensure;
use std::collections::HashMap;
use std::num::NonZeroU64;

#[derive(Debug, Clone, Default)]
pub(crate) struct KeyDb {
    keys: HashMap<Decoded<Hex>, Key>,
    roles: HashMap<String, RoleKeys>,
}

impl KeyDb {
    /// Builds a trust store from verified root metadata. Every key ID referenced by a role
    /// must resolve to a key in the root's key map.
    pub(crate) fn from_root(root: &Root) -> Result<Self> {
        let mut db = Self {
            keys: root.keys.clone(),
            roles: HashMap::new(),
        };
        for (name, role_keys) in &root.roles {
            for keyid in &role_keys.keyids {
                ensure!(
                    db.keys.contains_key(keyid),
                    error::UnknownKeySnafu {
                        keyid: keyid.to_string()
                    }
                );
            }
            db.roles.insert(name.clone(), role_keys.clone());
        }
        Ok(db)
    }

    /// Registers a public key under its key ID.
    pub(crate) fn add_key(&mut self, keyid: Decoded<Hex>, key: Key) -> Result<()> {
        ensure!(
            !self.keys.contains_key(&keyid),
            error::KeyAlreadyExistsSnafu {
                keyid: keyid.to_string()
            }
        );
        self.keys.insert(keyid, key);
        Ok(())
    }

    /// Whether `keyid` is already registered.
    pub(crate) fn has_key(&self, keyid: &Decoded<Hex>) -> bool {
        self.keys.contains_key(keyid)
    }

    /// Registers a role authorization. All of the role's key IDs must already be registered.
    /// With `require_parent`, a hierarchical name must have at least one registered ancestor;
    /// this is how delegated roles are constrained to enter through their parents.
    pub(crate) fn add_role(
        &mut self,
        name: &str,
        role_keys: RoleKeys,
        require_parent: bool,
    ) -> Result<()> {
        ensure!(
            !self.roles.contains_key(name),
            error::RoleAlreadyExistsSnafu { name }
        );
        if require_parent {
            ensure!(
                self.ancestors(name).any(|a| self.roles.contains_key(a)),
                error::MissingParentRoleSnafu { name }
            );
        }
        for keyid in &role_keys.keyids {
            ensure!(
                self.keys.contains_key(keyid),
                error::UnknownKeySnafu {
                    keyid: keyid.to_string()
                }
            );
        }
        self.roles.insert(name.to_owned(), role_keys);
        Ok(())
    }

    /// Removes `name` and every role below it in the hierarchy. Keys stay registered; they
    /// are harmless without a role pointing at them and may be shared with live roles.
    pub(crate) fn remove_role(&mut self, name: &str) -> Result<()> {
        ensure!(
            self.roles.contains_key(name),
            error::UnknownRoleSnafu { name }
        );
        let prefix = format!("{name}/");
        self.roles
            .retain(|role, _| role != name && !role.starts_with(&prefix));
        Ok(())
    }

    /// Removes every role delegated (directly or transitively) by `name`, keeping `name`
    /// itself. Used when a role's metadata becomes unavailable: the last known good copy of
    /// the role stays trusted, but everything derived from the unavailable copy does not.
    pub(crate) fn remove_delegated_roles(&mut self, name: &str) -> Result<()> {
        ensure!(
            self.roles.contains_key(name),
            error::UnknownRoleSnafu { name }
        );
        let prefix = format!("{name}/");
        self.roles.retain(|role, _| !role.starts_with(&prefix));
        Ok(())
    }

    pub(crate) fn role_exists(&self, name: &str) -> bool {
        self.roles.contains_key(name)
    }

    pub(crate) fn key(&self, keyid: &Decoded<Hex>) -> Option<&Key> {
        self.keys.get(keyid)
    }

    pub(crate) fn role(&self, name: &str) -> Option<&RoleKeys> {
        self.roles.get(name)
    }

    pub(crate) fn role_threshold(&self, name: &str) -> Option<NonZeroU64> {
        self.roles.get(name).map(|r| r.threshold)
    }

    /// The path patterns constraining `name`, or `None` if the role is unrestricted or
    /// unknown.
    pub(crate) fn role_paths(&self, name: &str) -> Option<&[PathPattern]> {
        self.roles
            .get(name)
            .and_then(|r| r.paths.as_deref())
    }

    /// Direct children of `name` in the role hierarchy.
    pub(crate) fn delegated_role_names(&self, name: &str) -> Vec<String> {
        let prefix = format!("{name}/");
        self.roles
            .keys()
            .filter(|role| {
                role.strip_prefix(&prefix)
                    .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
            })
            .cloned()
            .collect()
    }

    /// The registered ancestors of `name`, outermost first, not including `name` itself.
    pub(crate) fn parent_roles<'a>(&self, name: &'a str) -> Vec<&'a str> {
        self.ancestors(name)
            .filter(|a| self.roles.contains_key(*a))
            .collect()
    }

    /// Iterates the proper prefixes of a hierarchical name, shortest first:
    /// `targets/a/b` yields `targets`, then `targets/a`.
    fn ancestors<'a>(&self, name: &'a str) -> impl Iterator<Item = &'a str> {
        name.match_indices('/').map(move |(i, _)| &name[..i])
    }
}
