//! In-memory identity directory.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use keyratchet_core::{CryptoIdentity, DirectoryError, IdentityDirectory};
use keyratchet_crypto::Uid;

#[derive(Debug, Clone)]
struct Contact {
    devices: Vec<Uid>,
    active: bool,
}

#[derive(Debug, Clone)]
struct OwnedIdentity {
    current_device: Uid,
    other_devices: Vec<Uid>,
    contacts: BTreeMap<CryptoIdentity, Contact>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    owned: BTreeMap<CryptoIdentity, OwnedIdentity>,
    unavailable: bool,
}

/// Identity directory backed by a map, editable while engines run.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    state: Arc<Mutex<DirectoryState>>,
}

impl StaticDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an owned identity with its current and other devices.
    pub fn add_owned_identity(
        &self,
        identity: CryptoIdentity,
        current_device: Uid,
        other_devices: Vec<Uid>,
    ) -> &Self {
        self.state().owned.insert(
            identity,
            OwnedIdentity { current_device, other_devices, contacts: BTreeMap::new() },
        );
        self
    }

    /// Register an active contact of an owned identity.
    ///
    /// Does nothing if `owned` was not registered.
    pub fn add_contact(&self, owned: &CryptoIdentity, contact: CryptoIdentity, devices: Vec<Uid>) -> &Self {
        if let Some(identity) = self.state().owned.get_mut(owned) {
            identity.contacts.insert(contact, Contact { devices, active: true });
        }
        self
    }

    /// Activate or deactivate a contact.
    pub fn set_contact_active(&self, owned: &CryptoIdentity, contact: &CryptoIdentity, active: bool) {
        if let Some(entry) =
            self.state().owned.get_mut(owned).and_then(|identity| identity.contacts.get_mut(contact))
        {
            entry.active = active;
        }
    }

    /// Make every lookup fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    fn with_owned<T>(
        &self,
        owned: &CryptoIdentity,
        f: impl FnOnce(&OwnedIdentity) -> Result<T, DirectoryError>,
    ) -> Result<T, DirectoryError> {
        let state = self.state();
        if state.unavailable {
            return Err(DirectoryError::Unavailable("directory switched off".to_string()));
        }
        let identity =
            state.owned.get(owned).ok_or_else(|| DirectoryError::UnknownOwnedIdentity(owned.clone()))?;
        f(identity)
    }
}

impl IdentityDirectory for StaticDirectory {
    fn current_device_uid(&self, owned: &CryptoIdentity) -> Result<Uid, DirectoryError> {
        self.with_owned(owned, |identity| Ok(identity.current_device))
    }

    fn is_owned(&self, identity: &CryptoIdentity) -> Result<bool, DirectoryError> {
        let state = self.state();
        if state.unavailable {
            return Err(DirectoryError::Unavailable("directory switched off".to_string()));
        }
        Ok(state.owned.contains_key(identity))
    }

    fn device_uids_of_owned_identity(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError> {
        self.with_owned(owned, |identity| {
            let mut devices = vec![identity.current_device];
            devices.extend_from_slice(&identity.other_devices);
            Ok(devices)
        })
    }

    fn other_device_uids_of_owned_identity(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError> {
        self.with_owned(owned, |identity| Ok(identity.other_devices.clone()))
    }

    fn device_uids_of_contact(
        &self,
        contact: &CryptoIdentity,
        owned: &CryptoIdentity,
    ) -> Result<Vec<Uid>, DirectoryError> {
        self.with_owned(owned, |identity| {
            identity
                .contacts
                .get(contact)
                .map(|entry| entry.devices.clone())
                .ok_or_else(|| DirectoryError::UnknownContact(contact.clone()))
        })
    }

    fn is_contact_of(
        &self,
        contact: &CryptoIdentity,
        owned: &CryptoIdentity,
    ) -> Result<bool, DirectoryError> {
        self.with_owned(owned, |identity| Ok(identity.contacts.contains_key(contact)))
    }

    fn is_contact_active(
        &self,
        owned: &CryptoIdentity,
        contact: &CryptoIdentity,
    ) -> Result<bool, DirectoryError> {
        self.with_owned(owned, |identity| {
            Ok(identity.contacts.get(contact).is_some_and(|entry| entry.active))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> CryptoIdentity {
        CryptoIdentity::new(b"alice".to_vec())
    }

    fn bob() -> CryptoIdentity {
        CryptoIdentity::new(b"bob".to_vec())
    }

    #[test]
    fn owned_devices_include_current_first() {
        let directory = StaticDirectory::new();
        directory.add_owned_identity(alice(), Uid::from_bytes([1; 32]), vec![Uid::from_bytes([2; 32])]);

        assert_eq!(
            directory.device_uids_of_owned_identity(&alice()).unwrap(),
            vec![Uid::from_bytes([1; 32]), Uid::from_bytes([2; 32])]
        );
        assert_eq!(
            directory.other_device_uids_of_owned_identity(&alice()).unwrap(),
            vec![Uid::from_bytes([2; 32])]
        );
    }

    #[test]
    fn unknown_contact_is_an_error() {
        let directory = StaticDirectory::new();
        directory.add_owned_identity(alice(), Uid::from_bytes([1; 32]), Vec::new());

        assert_eq!(
            directory.device_uids_of_contact(&bob(), &alice()),
            Err(DirectoryError::UnknownContact(bob()))
        );
        assert!(!directory.is_contact_of(&bob(), &alice()).unwrap());
    }

    #[test]
    fn contacts_can_be_deactivated() {
        let directory = StaticDirectory::new();
        directory
            .add_owned_identity(alice(), Uid::from_bytes([1; 32]), Vec::new())
            .add_contact(&alice(), bob(), vec![Uid::from_bytes([3; 32])]);
        assert!(directory.is_contact_active(&alice(), &bob()).unwrap());

        directory.set_contact_active(&alice(), &bob(), false);
        assert!(!directory.is_contact_active(&alice(), &bob()).unwrap());
    }

    #[test]
    fn unavailable_directory_fails_every_lookup() {
        let directory = StaticDirectory::new();
        directory.add_owned_identity(alice(), Uid::from_bytes([1; 32]), Vec::new());
        directory.set_unavailable(true);

        assert!(matches!(directory.current_device_uid(&alice()), Err(DirectoryError::Unavailable(_))));
        assert!(directory.is_owned(&alice()).is_err());
    }
}
