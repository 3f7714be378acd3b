//! Password database lookups
//!
//! Lookups are memoized in a [`PasswdCache`] that the caller owns and passes
//! around, so the cache lives exactly as long as one command.

use crate::error::{StampError, StampResult};
use nix::unistd::{Uid, User};
use std::collections::HashMap;
use tracing::debug;

/// A user account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl From<User> for Account {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PasswdCache {
    by_name: HashMap<String, Account>,
    by_uid: HashMap<u32, Account>,
}

impl PasswdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_name(&mut self, name: &str) -> StampResult<Account> {
        if let Some(account) = self.by_name.get(name) {
            return Ok(account.clone());
        }
        if name.contains('\0') {
            return Err(StampError::UnknownUser(name.to_string()));
        }
        let account: Account = User::from_name(name)
            .map_err(|e| {
                debug!("passwd lookup of {} failed: {}", name, e);
                StampError::UnknownUser(name.to_string())
            })?
            .ok_or_else(|| StampError::UnknownUser(name.to_string()))?
            .into();
        self.remember(&account);
        Ok(account)
    }

    pub fn lookup_uid(&mut self, uid: u32) -> StampResult<Account> {
        if let Some(account) = self.by_uid.get(&uid) {
            return Ok(account.clone());
        }
        let account: Account = User::from_uid(Uid::from_raw(uid))
            .map_err(|e| {
                debug!("passwd lookup of uid {} failed: {}", uid, e);
                StampError::UnknownUid(uid)
            })?
            .ok_or(StampError::UnknownUid(uid))?
            .into();
        self.remember(&account);
        Ok(account)
    }

    fn remember(&mut self, account: &Account) {
        self.by_name.insert(account.name.clone(), account.clone());
        self.by_uid.insert(account.uid, account.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_both_ways() {
        let mut cache = PasswdCache::new();
        let by_uid = cache.lookup_uid(0).unwrap();
        assert_eq!(by_uid.uid, 0);
        let by_name = cache.lookup_name(&by_uid.name).unwrap();
        assert_eq!(by_name, by_uid);
    }

    #[test]
    fn lookups_are_memoized() {
        let mut cache = PasswdCache::new();
        let account = cache.lookup_uid(0).unwrap();
        assert!(cache.by_name.contains_key(&account.name));
        assert!(cache.by_uid.contains_key(&0));
    }

    #[test]
    fn unknown_user_is_error() {
        let mut cache = PasswdCache::new();
        let err = cache.lookup_name("no-such-user-credstamp").unwrap_err();
        assert!(matches!(err, StampError::UnknownUser(_)));
        let err = cache.lookup_name("bad\0name").unwrap_err();
        assert!(matches!(err, StampError::UnknownUser(_)));
    }
}
