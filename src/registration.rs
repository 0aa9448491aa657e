//! Registration messenger.
//!
//! Mints the per-contact account code and sends the deep link that lets a
//! contact claim their account page. The send always happens; only the
//! persistence step is conditional on the code being freshly minted.

use crate::address::BareAddress;
use crate::config::SiteConfig;
use crate::db::{AccountPatch, Database, MatchKey};
use crate::error::Error;
use crate::transport::Transport;
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::Arc;
use tracing::info;

/// Entropy behind each account code. 34 bytes render as 68 hex chars.
const ACCOUNT_CODE_BYTES: usize = 34;

/// Sends registration links and mints account codes.
pub struct RegistrationMessenger {
    db: Database,
    transport: Arc<dyn Transport>,
    site: SiteConfig,
}

impl RegistrationMessenger {
    pub fn new(db: Database, transport: Arc<dyn Transport>, site: SiteConfig) -> Self {
        Self {
            db,
            transport,
            site,
        }
    }

    /// Send the registration message to a contact.
    ///
    /// When `existing_code` is absent a fresh code is generated and persisted
    /// via reconcile matching on the address; the store's first-write-wins
    /// rule on `account_code` means a concurrent mint cannot overwrite an
    /// already-stored code. The stored code may therefore differ from the
    /// one sent in a mint race, but the link page resolves codes from the
    /// store, so the persisted one is authoritative.
    pub async fn send_registration_message(
        &self,
        address: &BareAddress,
        existing_code: Option<&str>,
    ) -> Result<(), Error> {
        let code = match existing_code {
            Some(code) => code.to_string(),
            None => {
                let code = generate_account_code();
                let patch = AccountPatch {
                    account_code: Some(code.clone()),
                    ..AccountPatch::for_address(address.as_str())
                };
                let account = self
                    .db
                    .accounts()
                    .reconcile(&[MatchKey::Address], &patch)
                    .await?;
                // Honor a code another caller persisted first.
                account.account_code.unwrap_or(code)
            }
        };

        info!(address = %address, "Sending registration message");
        let body = format!(
            "Please go to this URL to complete your MyStatus registration: {}",
            self.site.account_url(&code)
        );
        self.transport.send_message(address.as_str(), &body).await?;
        Ok(())
    }
}

/// Generate a fresh account code: 34 random bytes as 68 hex chars.
pub fn generate_account_code() -> String {
    let mut bytes = [0u8; ACCOUNT_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let mut code = String::with_capacity(ACCOUNT_CODE_BYTES * 2);
    for byte in bytes {
        code.push_str(&format!("{byte:02x}"));
    }
    code
}
