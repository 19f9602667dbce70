//! Contact directory file: CRUD over `contacts.json`

use tracing::warn;

use super::MessageStore;
use crate::error::RelayError;
use crate::types::{Contact, ContactDirectory};

impl MessageStore {
    /// Read the whole contact directory.
    ///
    /// A missing or unparseable file yields an empty directory (and the
    /// file is recreated on the next write).
    pub async fn read_contacts(&self) -> Result<ContactDirectory, RelayError> {
        let lock = self.contacts_lock();
        let _guard = lock.lock().await;
        self.load_contacts_locked().await
    }

    /// Replace the whole contact directory.
    pub async fn write_contacts(&self, contacts: &ContactDirectory) -> Result<(), RelayError> {
        let lock = self.contacts_lock();
        let _guard = lock.lock().await;
        self.write_contacts_locked(contacts).await
    }

    /// Look up a single contact by uid.
    pub async fn get_contact(&self, uid: &str) -> Result<Contact, RelayError> {
        self.read_contacts()
            .await?
            .remove(uid)
            .ok_or_else(|| RelayError::ContactNotFound(uid.to_string()))
    }

    /// Insert or overwrite a contact, keyed by its uid.
    pub async fn upsert_contact(&self, contact: Contact) -> Result<(), RelayError> {
        let lock = self.contacts_lock();
        let _guard = lock.lock().await;

        let mut contacts = self.load_contacts_locked().await?;
        contacts.insert(contact.uid.clone(), contact);
        self.write_contacts_locked(&contacts).await
    }

    /// Update the mutable parts of an existing contact (remark and flags).
    ///
    /// Keys and passwords are immutable after creation; replacing a key
    /// means a new uid and therefore a new contact.
    pub async fn update_contact_meta(
        &self,
        uid: &str,
        remark: Option<String>,
        background: Option<bool>,
        pinned: Option<bool>,
    ) -> Result<(), RelayError> {
        let lock = self.contacts_lock();
        let _guard = lock.lock().await;

        let mut contacts = self.load_contacts_locked().await?;
        let contact = contacts
            .get_mut(uid)
            .ok_or_else(|| RelayError::ContactNotFound(uid.to_string()))?;
        if let Some(remark) = remark {
            contact.remark = remark;
        }
        if let Some(background) = background {
            contact.background = background;
        }
        if let Some(pinned) = pinned {
            contact.pinned = pinned;
        }
        self.write_contacts_locked(&contacts).await
    }

    /// Remove a contact from the directory.
    ///
    /// Returns `Ok(())` even if the contact doesn't exist. The history file
    /// is left on disk.
    pub async fn remove_contact(&self, uid: &str) -> Result<(), RelayError> {
        let lock = self.contacts_lock();
        let _guard = lock.lock().await;

        let mut contacts = self.load_contacts_locked().await?;
        contacts.remove(uid);
        self.write_contacts_locked(&contacts).await
    }

    async fn load_contacts_locked(&self) -> Result<ContactDirectory, RelayError> {
        match tokio::fs::read(self.contacts_path()).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(contacts) => Ok(contacts),
                Err(e) => {
                    warn!(error = %e, "Contacts file unparseable, starting empty");
                    Ok(ContactDirectory::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ContactDirectory::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_contacts_locked(&self, contacts: &ContactDirectory) -> Result<(), RelayError> {
        let json = serde_json::to_string_pretty(contacts)?;
        tokio::fs::write(self.contacts_path(), json).await?;
        Ok(())
    }
}
