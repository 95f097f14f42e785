use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::models::{GraphChatMessage, RemoteContainer, RemoteMessage};

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 12;

/// Body of a webhook delivery: a batch of change or lifecycle records.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationBatch {
    #[serde(default)]
    pub value: Vec<ChangeNotification>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    #[serde(default)]
    pub change_type: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub lifecycle_event: Option<String>,
    #[serde(default)]
    pub subscription_expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_data: Option<Value>,
    #[serde(default)]
    pub encrypted_content: Option<EncryptedContent>,
}

impl ChangeNotification {
    /// Version tag of the changed resource, when the delivery carries one.
    pub fn etag(&self) -> Option<&str> {
        self.resource_data.as_ref()?.get("@odata.etag")?.as_str()
    }

    /// Whether a new version of the resource always yields a new
    /// [`delivery_id`](Self::delivery_id). Updates that carry neither inline
    /// content nor an etag hash alike across edits and cannot be told apart
    /// from a redelivery.
    pub fn is_versioned(&self) -> bool {
        let is_update = self
            .change_type
            .as_deref()
            .is_some_and(|change_type| change_type.eq_ignore_ascii_case("updated"));
        !is_update || self.encrypted_content.is_some() || self.etag().is_some()
    }

    /// Stable identity of one delivered record. A redelivery of the same
    /// notification yields the same id.
    pub fn delivery_id(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.subscription_id.as_str(),
            self.change_type.as_deref().unwrap_or_default(),
            self.resource.as_deref().unwrap_or_default(),
            self.lifecycle_event.as_deref().unwrap_or_default(),
            self.etag().unwrap_or_default(),
            self.encrypted_content
                .as_ref()
                .map(|content| content.data.as_str())
                .unwrap_or_default(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedContent {
    pub data: String,
    pub data_signature: String,
    pub data_key: String,
    #[serde(default)]
    pub encryption_certificate_id: Option<String>,
    #[serde(default)]
    pub encryption_certificate_thumbprint: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("encrypted content is not valid base64: {0}")]
    Encoding(&'static str),

    #[error("data key could not be unwrapped")]
    DataKey,

    #[error("data signature does not match")]
    Signature,

    #[error("encrypted content could not be decrypted")]
    Cipher,

    #[error("decrypted content is not a chat message: {0}")]
    Payload(String),
}

/// Opens resource data delivered inline with a notification.
///
/// The data key travels wrapped under the service key; the payload is
/// signed with HMAC-SHA256 under the data key and sealed with AES-256-GCM,
/// nonce first.
pub struct ContentDecryptor {
    cipher: Aes256Gcm,
}

impl ContentDecryptor {
    pub fn new(service_key: &[u8]) -> Result<Self, DecryptError> {
        let cipher = Aes256Gcm::new_from_slice(service_key).map_err(|_| DecryptError::DataKey)?;
        Ok(Self { cipher })
    }

    pub fn decrypt(&self, content: &EncryptedContent) -> Result<Vec<u8>, DecryptError> {
        let wrapped_key = decode(&content.data_key, "dataKey")?;
        let data_key = open(&self.cipher, &wrapped_key).map_err(|_| DecryptError::DataKey)?;

        let data = decode(&content.data, "data")?;
        let signature = decode(&content.data_signature, "dataSignature")?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&data_key).map_err(|_| DecryptError::DataKey)?;
        mac.update(&data);
        mac.verify_slice(&signature)
            .map_err(|_| DecryptError::Signature)?;

        let cipher = Aes256Gcm::new_from_slice(&data_key).map_err(|_| DecryptError::DataKey)?;
        open(&cipher, &data)
    }

    /// Decrypts and decodes the inline chat message of a notification.
    pub fn decrypt_message(
        &self,
        content: &EncryptedContent,
        container: RemoteContainer,
    ) -> Result<RemoteMessage, DecryptError> {
        let plaintext = self.decrypt(content)?;
        let raw: GraphChatMessage = serde_json::from_slice(&plaintext)
            .map_err(|e| DecryptError::Payload(e.to_string()))?;
        Ok(RemoteMessage::from_graph(raw, container))
    }
}

fn decode(value: &str, field: &'static str) -> Result<Vec<u8>, DecryptError> {
    BASE64_STANDARD
        .decode(value.trim())
        .map_err(|_| DecryptError::Encoding(field))
}

fn open(cipher: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>, DecryptError> {
    if sealed.len() <= NONCE_BYTES {
        return Err(DecryptError::Cipher);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_BYTES);
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| DecryptError::Cipher)
}

/// Builds encrypted content the way the remote side would. Test support.
#[cfg(test)]
pub(crate) fn seal_for_tests(service_key: &[u8], data_key: &[u8; 32], plaintext: &[u8]) -> EncryptedContent {
    fn seal(key: &[u8], nonce: [u8; NONCE_BYTES], plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new_from_slice(key).expect("32 byte key");
        let mut sealed = nonce.to_vec();
        sealed.extend(cipher.encrypt((&nonce).into(), plaintext).expect("sealed"));
        sealed
    }

    let data = seal(data_key, [7u8; NONCE_BYTES], plaintext);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(data_key).expect("hmac key");
    mac.update(&data);
    EncryptedContent {
        data: BASE64_STANDARD.encode(&data),
        data_signature: BASE64_STANDARD.encode(mac.finalize().into_bytes()),
        data_key: BASE64_STANDARD.encode(seal(service_key, [3u8; NONCE_BYTES], data_key)),
        encryption_certificate_id: Some("cert-1".to_string()),
        encryption_certificate_thumbprint: None,
    }
}
