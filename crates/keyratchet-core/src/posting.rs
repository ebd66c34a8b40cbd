//! Channel selection for outgoing messages.
//!
//! The surrounding system knows several kinds of channels (oblivious
//! ratchet channels, asymmetric channels, the local loopback). A message to
//! send names the kind it wants through [`ChannelType`]; this engine only
//! serves the ratchet-backed kinds and rejects the rest.

use keyratchet_crypto::Uid;

use crate::{
    ChannelEngine, ChannelId, CryptoIdentity, EngineError, Environment, storage::Storage,
};

/// Kind of channel a message asks to be posted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Ratchet channels to selected devices of one identity
    Oblivious {
        /// Contact or owned identity to reach
        to: CryptoIdentity,
        /// Devices of `to` to reach
        remote_device_uids: Vec<Uid>,
        /// Owned identity sending the message
        from_owned: CryptoIdentity,
        /// Only confirmed channels qualify
        necessarily_confirmed: bool,
    },
    /// Every confirmed ratchet channel to every device of the contacts
    AllConfirmedWithContacts {
        /// Contacts to reach
        contacts: Vec<CryptoIdentity>,
        /// Owned identity sending the message
        from_owned: CryptoIdentity,
    },
    /// Every confirmed ratchet channel to the other devices of an owned
    /// identity
    AllConfirmedWithOtherOwnedDevices {
        /// Owned identity whose devices to reach
        owned: CryptoIdentity,
    },
    /// Public-key channel, served elsewhere
    Asymmetric,
    /// Loopback to the local device, served elsewhere
    Local,
}

/// What is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Protocol message
    Protocol {
        /// Part of the full ratchet of the send seed of the channels it goes
        /// out on
        part_of_full_ratchet_of_send_seed: bool,
    },
    /// Application message
    Application,
}

/// A message waiting for its channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessageToSend {
    /// Where it should go
    pub channel_type: ChannelType,
    /// What it is
    pub message_type: MessageType,
}

impl<E: Environment, S: Storage> ChannelEngine<E, S> {
    /// Channels the message may be posted on.
    ///
    /// Protocol messages flagged as part of a send-seed full ratchet mark
    /// every selected channel as having sent its full-ratchet message.
    ///
    /// # Errors
    ///
    /// - `WrongChannelType` for channel kinds this engine does not serve
    /// - `NotAllowed` if the sender is not an owned identity
    pub fn acceptable_channels_for_posting(
        &self,
        message: &ChannelMessageToSend,
    ) -> Result<Vec<ChannelId>, EngineError> {
        let selected = match &message.channel_type {
            ChannelType::Oblivious { to, remote_device_uids, from_owned, necessarily_confirmed } => {
                self.oblivious_channels(
                    to,
                    remote_device_uids,
                    from_owned,
                    *necessarily_confirmed,
                    message.message_type,
                )?
            },
            ChannelType::AllConfirmedWithContacts { contacts, from_owned } => {
                self.confirmed_channels_with_contacts(contacts, from_owned)?
            },
            ChannelType::AllConfirmedWithOtherOwnedDevices { owned } => {
                self.confirmed_channels_with_other_owned_devices(owned)?
            },
            ChannelType::Asymmetric | ChannelType::Local => {
                tracing::error!(
                    channel_type = ?message.channel_type,
                    "Channel engine asked to post on a channel kind it does not serve"
                );
                return Err(EngineError::WrongChannelType);
            },
        };

        if message.message_type
            == (MessageType::Protocol { part_of_full_ratchet_of_send_seed: true })
        {
            for id in &selected {
                self.notify_full_ratchet_message_sent(id)?;
            }
        }

        Ok(selected)
    }

    fn oblivious_channels(
        &self,
        to: &CryptoIdentity,
        remote_device_uids: &[Uid],
        from_owned: &CryptoIdentity,
        necessarily_confirmed: bool,
        message_type: MessageType,
    ) -> Result<Vec<ChannelId>, EngineError> {
        // Only protocol messages may go out on channels nobody confirmed
        if !necessarily_confirmed && message_type == MessageType::Application {
            tracing::warn!("Application message asked for unconfirmed channels");
            return Ok(Vec::new());
        }

        let directory = &self.collaborators.directory;
        if !directory.is_owned(from_owned)? {
            return Err(EngineError::NotAllowed {
                reason: "sender is not an owned identity".to_string(),
            });
        }
        let current_device_uid = directory.current_device_uid(from_owned)?;

        let known_devices = if directory.is_owned(to)? {
            directory.device_uids_of_owned_identity(to)?
        } else {
            directory.device_uids_of_contact(to, from_owned)?
        };

        let mut selected = Vec::new();
        for remote_device_uid in remote_device_uids {
            if !known_devices.contains(remote_device_uid) {
                tracing::debug!(
                    device = %hex::encode(remote_device_uid.as_bytes()),
                    "Skipping device unknown to the directory"
                );
                continue;
            }

            let id = ChannelId::new(current_device_uid, to.clone(), *remote_device_uid);
            if self.is_acceptable(&id, necessarily_confirmed)? {
                selected.push(id);
            }
        }
        Ok(selected)
    }

    fn confirmed_channels_with_contacts(
        &self,
        contacts: &[CryptoIdentity],
        from_owned: &CryptoIdentity,
    ) -> Result<Vec<ChannelId>, EngineError> {
        let directory = &self.collaborators.directory;
        let current_device_uid = directory.current_device_uid(from_owned)?;

        let mut selected = Vec::new();
        for contact in contacts {
            let devices = match directory.device_uids_of_contact(contact, from_owned) {
                Ok(devices) => devices,
                Err(e) => {
                    tracing::warn!(contact = ?contact, error = %e, "Skipping contact");
                    continue;
                },
            };
            for device in devices {
                let id = ChannelId::new(current_device_uid, contact.clone(), device);
                if self.is_acceptable(&id, true)? {
                    selected.push(id);
                }
            }
        }
        Ok(selected)
    }

    fn confirmed_channels_with_other_owned_devices(
        &self,
        owned: &CryptoIdentity,
    ) -> Result<Vec<ChannelId>, EngineError> {
        let directory = &self.collaborators.directory;
        if !directory.is_owned(owned)? {
            return Err(EngineError::NotAllowed {
                reason: "identity is not an owned identity".to_string(),
            });
        }
        let current_device_uid = directory.current_device_uid(owned)?;

        // Every owned device, the current one included: a channel of the
        // device to itself is selected like any other once confirmed
        let mut selected = Vec::new();
        for device in directory.device_uids_of_owned_identity(owned)? {
            let id = ChannelId::new(current_device_uid, owned.clone(), device);
            if self.is_acceptable(&id, true)? {
                selected.push(id);
            }
        }
        Ok(selected)
    }

    /// The channel exists, is confirmed if required, and runs a recent
    /// enough crypto suite.
    fn is_acceptable(&self, id: &ChannelId, must_be_confirmed: bool) -> Result<bool, EngineError> {
        let Some(channel) = self.storage.load_channel(id)? else {
            return Ok(false);
        };
        let record = &channel.record;
        if must_be_confirmed && !record.is_confirmed {
            return Ok(false);
        }
        if record.crypto_suite_version < self.config.min_acceptable_suite_version {
            tracing::debug!(
                channel = %id,
                suite = record.crypto_suite_version,
                "Skipping channel on an outdated crypto suite"
            );
            return Ok(false);
        }
        Ok(true)
    }
}
