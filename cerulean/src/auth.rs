//! Shared-key request signing

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::TableError;

type HmacSha256 = Hmac<Sha256>;

/// The well-known local emulator account name.
pub const DEVELOPMENT_STORAGE_ACCOUNT: &str = "devstoreaccount1";

/// The well-known local emulator account key (public knowledge, not a secret).
pub const DEVELOPMENT_STORAGE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Storage account credentials and the shared-key signing scheme.
///
/// Each signing call builds a fresh MAC instance over the decoded key, so an
/// `Account` can be shared freely across concurrent requests.
#[derive(Clone)]
pub struct Account {
    name: String,
    key: Vec<u8>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the key
        f.debug_struct("Account").field("name", &self.name).finish()
    }
}

impl Account {
    /// Create an account from its name and base64-encoded secret key.
    pub fn new(name: impl Into<String>, secret: &str) -> Result<Self, TableError> {
        let key = BASE64
            .decode(secret)
            .map_err(|_| TableError::InvalidAccountKey)?;

        Ok(Self {
            name: name.into(),
            key,
        })
    }

    /// The account for the local storage emulator.
    pub fn development() -> Self {
        // the compiled-in key is valid base64
        Self::new(DEVELOPMENT_STORAGE_ACCOUNT, DEVELOPMENT_STORAGE_KEY).unwrap()
    }

    /// The account name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when these are the emulator's well-known credentials.
    pub fn is_development_storage(&self) -> bool {
        self.name == DEVELOPMENT_STORAGE_ACCOUNT
    }

    /// Compute the `Authorization` header value for a request.
    ///
    /// The canonical string is
    /// `method\ncontentMD5\ncontentType\ndate\n/{account}{path}`, HMAC-SHA256
    /// hashed with the decoded key and base64-encoded.
    pub fn sign(
        &self,
        method: &str,
        content_md5: &str,
        content_type: &str,
        date: &str,
        path: &str,
    ) -> String {
        let canonicalized_resource = format!("/{}{}", self.name, path);
        let canonical = [method, content_md5, content_type, date, &canonicalized_resource].join("\n");

        // new_from_slice accepts keys of any length for HMAC
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(canonical.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        format!("SharedKey {}:{}", self.name, signature)
    }
}
