//! Upload credentials for stem audio.
//!
//! Bytes never pass through this crate. A client asks for a credential,
//! PUTs the file straight to object storage, then writes a [`Stem`] that
//! points at the public URL of the object key.

use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::TrackError;
use crate::{Identity, Stem};

type HmacSha256 = Hmac<Sha256>;

/// How long an issued credential stays valid.
pub const UPLOAD_CREDENTIAL_TTL: Duration = Duration::from_secs(3600);

pub const ALLOWED_AUDIO_TYPES: &[&str] = &[
    "audio/wav",
    "audio/mp3",
    "audio/mpeg",
    "audio/aiff",
    "audio/aif",
    "audio/webm",
];

pub const STEM_KEY_PREFIX: &str = "stems/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_name: String,
    pub file_type: String,
}

impl UploadRequest {
    pub fn new(file_name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            file_type: file_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCredential {
    pub upload_url: String,
    pub file_key: String,
    /// Unix milliseconds.
    #[serde(default)]
    pub issued_at: u64,
    /// Unix milliseconds.
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl UploadCredential {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

impl Stem {
    /// Build a stem for a finished upload.
    ///
    /// The display name is the original file name without the key prefix
    /// and without its extension.
    pub fn from_upload(credential: &UploadCredential, author: &Identity) -> Option<Self> {
        let url = credential.public_url.clone()?;
        let file_name = original_file_name(&credential.file_key);
        let display_name = match file_name.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem,
            _ => file_name,
        };
        Some(Stem::new(display_name, url).with_author(author))
    }
}

/// Recover the client's file name from an object key.
fn original_file_name(key: &str) -> &str {
    let name = key.strip_prefix(STEM_KEY_PREFIX).unwrap_or(key);
    // `{millis}-{random}-{name}`
    name.splitn(3, '-').nth(2).unwrap_or(name)
}

/// Object-storage collaborator that signs write URLs.
pub trait UploadSigner: Send + Sync {
    /// Produce a URL allowing one PUT of `key` until `now_secs + expires_in`.
    fn presign_put(&self, key: &str, expires_in: Duration, now_secs: u64)
        -> Result<String, TrackError>;
}

/// S3-style presigner: the query carries expiry, credential and an
/// HMAC-SHA256 over `PUT\n{bucket}/{key}\n{expires}`.
pub struct HmacUrlSigner {
    endpoint: String,
    bucket: String,
    access_key_id: String,
    secret: Vec<u8>,
}

impl HmacUrlSigner {
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            access_key_id: access_key_id.into(),
            secret: secret_access_key.as_ref().to_vec(),
        }
    }

    fn mac(&self, key: &str, expires: u64) -> Result<HmacSha256, TrackError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| TrackError::Internal(format!("upload signer key: {e}")))?;
        mac.update(format!("PUT\n{}/{}\n{}", self.bucket, key, expires).as_bytes());
        Ok(mac)
    }

    /// Check a presigned PUT for `key`, as the storage backend would.
    pub fn verify_put(&self, key: &str, expires: u64, signature_hex: &str, now_secs: u64) -> bool {
        if now_secs > expires {
            return false;
        }
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        match self.mac(key, expires) {
            Ok(mac) => mac.verify_slice(&signature).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for HmacUrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacUrlSigner")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

impl UploadSigner for HmacUrlSigner {
    fn presign_put(
        &self,
        key: &str,
        expires_in: Duration,
        now_secs: u64,
    ) -> Result<String, TrackError> {
        let expires = now_secs + expires_in.as_secs();
        let signature = hex::encode(self.mac(key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/{}/{}?X-Expires={}&X-Credential={}&X-Signature={}",
            self.endpoint, self.bucket, key, expires, self.access_key_id, signature
        ))
    }
}

/// Issues upload credentials for authenticated users.
pub struct UploadCoordinator {
    signer: Box<dyn UploadSigner>,
    public_base_url: Option<String>,
}

impl UploadCoordinator {
    pub fn new(signer: impl UploadSigner + 'static, public_base_url: Option<String>) -> Self {
        Self {
            signer: Box::new(signer),
            public_base_url: public_base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn request_upload_credential(
        &self,
        identity: Option<&Identity>,
        request: &UploadRequest,
    ) -> Result<UploadCredential, TrackError> {
        self.request_upload_credential_at(identity, request, crate::unix_millis())
    }

    /// Same as [`request_upload_credential`](Self::request_upload_credential)
    /// with an explicit clock in unix milliseconds.
    pub fn request_upload_credential_at(
        &self,
        identity: Option<&Identity>,
        request: &UploadRequest,
        now_ms: u64,
    ) -> Result<UploadCredential, TrackError> {
        let identity =
            identity.ok_or_else(|| TrackError::Unauthorized("missing session".into()))?;

        if request.file_name.trim().is_empty() || request.file_type.trim().is_empty() {
            return Err(TrackError::InvalidRequest(
                "fileName and fileType are required".into(),
            ));
        }
        if !ALLOWED_AUDIO_TYPES.contains(&request.file_type.as_str()) {
            return Err(TrackError::InvalidRequest(format!(
                "file type {} is not allowed",
                request.file_type
            )));
        }
        let file_key = object_key(&request.file_name, now_ms);
        let upload_url = self
            .signer
            .presign_put(&file_key, UPLOAD_CREDENTIAL_TTL, now_ms / 1000)?;
        let public_url = self
            .public_base_url
            .as_ref()
            .map(|base| format!("{base}/{file_key}"));

        log::info!(
            "Issued upload credential for {} ({}) to {}",
            file_key,
            request.file_type,
            identity.subject_id
        );

        Ok(UploadCredential {
            upload_url,
            file_key,
            issued_at: now_ms,
            expires_at: now_ms + UPLOAD_CREDENTIAL_TTL.as_millis() as u64,
            public_url,
        })
    }
}

/// `stems/{millis}-{random}-{name}` with path separators and whitespace
/// replaced so the name stays a single key segment.
fn object_key(file_name: &str, now_ms: u64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(7)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    let name: String = file_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '?' | '#' | '&' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    format!("{STEM_KEY_PREFIX}{now_ms}-{suffix}-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: u64 = 1_700_000_000_000;

    fn coordinator() -> UploadCoordinator {
        UploadCoordinator::new(
            HmacUrlSigner::new("https://storage.example.com/", "stems-bucket", "AKID", "s3cret"),
            Some("https://cdn.example.com".into()),
        )
    }

    fn user() -> Identity {
        Identity::new("7", "dana")
    }

    #[test]
    fn test_wav_upload_gets_one_hour_credential() {
        let cred = coordinator()
            .request_upload_credential_at(
                Some(&user()),
                &UploadRequest::new("Guitar Take.wav", "audio/wav"),
                NOW_MS,
            )
            .unwrap();

        assert_eq!(cred.issued_at, NOW_MS);
        assert_eq!(cred.expires_at, NOW_MS + 3_600_000);
        assert!(cred.file_key.starts_with(&format!("stems/{NOW_MS}-")));
        assert!(cred.file_key.ends_with("-Guitar_Take.wav"));
        assert!(cred
            .upload_url
            .starts_with("https://storage.example.com/stems-bucket/stems/"));
        assert_eq!(
            cred.public_url.as_deref(),
            Some(format!("https://cdn.example.com/{}", cred.file_key).as_str())
        );
    }

    #[test]
    fn test_video_is_rejected() {
        let err = coordinator()
            .request_upload_credential_at(
                Some(&user()),
                &UploadRequest::new("clip.mp4", "video/mp4"),
                NOW_MS,
            )
            .unwrap_err();
        assert!(matches!(err, TrackError::InvalidRequest(_)));
    }

    #[test]
    fn test_every_allowed_type_is_accepted() {
        let coordinator = coordinator();
        for mime in ALLOWED_AUDIO_TYPES {
            coordinator
                .request_upload_credential_at(Some(&user()), &UploadRequest::new("a", *mime), NOW_MS)
                .unwrap();
        }
    }

    #[test]
    fn test_missing_identity_is_unauthorized() {
        let err = coordinator()
            .request_upload_credential_at(None, &UploadRequest::new("a.wav", "audio/wav"), NOW_MS)
            .unwrap_err();
        assert!(matches!(err, TrackError::Unauthorized(_)));
    }

    #[test]
    fn test_empty_fields_are_invalid() {
        let coordinator = coordinator();
        for request in [
            UploadRequest::new("  ", "audio/wav"),
            UploadRequest::new("a.wav", ""),
        ] {
            assert!(matches!(
                coordinator.request_upload_credential_at(Some(&user()), &request, NOW_MS),
                Err(TrackError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn test_keys_are_unique() {
        let coordinator = coordinator();
        let req = UploadRequest::new("same.wav", "audio/wav");
        let a = coordinator
            .request_upload_credential_at(Some(&user()), &req, NOW_MS)
            .unwrap();
        let b = coordinator
            .request_upload_credential_at(Some(&user()), &req, NOW_MS)
            .unwrap();
        assert_ne!(a.file_key, b.file_key);
    }

    #[test]
    fn test_presigned_url_verifies_for_its_key_only() {
        let signer = HmacUrlSigner::new("https://s", "b", "AKID", "s3cret");
        let now = NOW_MS / 1000;
        let url = signer
            .presign_put("stems/1-abc-x.wav", UPLOAD_CREDENTIAL_TTL, now)
            .unwrap();
        let signature = url.rsplit("X-Signature=").next().unwrap();
        let expires = now + 3600;

        assert!(signer.verify_put("stems/1-abc-x.wav", expires, signature, now));
        assert!(!signer.verify_put("stems/other.wav", expires, signature, now));
        assert!(!signer.verify_put("stems/1-abc-x.wav", expires + 1, signature, now));
        assert!(!signer.verify_put("stems/1-abc-x.wav", expires, signature, expires + 1));
        assert!(!signer.verify_put("stems/1-abc-x.wav", expires, "zz", now));
    }

    #[test]
    fn test_debug_hides_secret() {
        let signer = HmacUrlSigner::new("https://s", "b", "AKID", "s3cret");
        assert!(!format!("{signer:?}").contains("s3cret"));
    }

    #[test]
    fn test_stem_from_upload() {
        let cred = coordinator()
            .request_upload_credential_at(
                Some(&user()),
                &UploadRequest::new("bass-line.final.wav", "audio/wav"),
                NOW_MS,
            )
            .unwrap();
        let stem = Stem::from_upload(&cred, &user()).unwrap();

        assert_eq!(stem.display_name, "bass-line.final");
        assert_eq!(Some(stem.storage_url.clone()), cred.public_url);
        assert_eq!(stem.author_id.as_deref(), Some("7"));
        assert_eq!(stem.duration_seconds, 0.0);
    }

    #[test]
    fn test_stem_from_upload_needs_public_url() {
        let coordinator = UploadCoordinator::new(HmacUrlSigner::new("https://s", "b", "k", "s"), None);
        let cred = coordinator
            .request_upload_credential_at(Some(&user()), &UploadRequest::new("a.wav", "audio/wav"), NOW_MS)
            .unwrap();
        assert!(Stem::from_upload(&cred, &user()).is_none());
    }

    #[test]
    fn test_credential_wire_names() {
        let cred = UploadCredential {
            upload_url: "u".into(),
            file_key: "k".into(),
            issued_at: 1,
            expires_at: 2,
            public_url: None,
        };
        let json = serde_json::to_value(&cred).unwrap();
        assert_eq!(json["uploadUrl"], "u");
        assert_eq!(json["fileKey"], "k");
        assert_eq!(json["expiresAt"], 2);
        assert!(cred.is_expired_at(2));
    }
}
