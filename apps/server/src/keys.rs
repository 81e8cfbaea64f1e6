//! Signing key management.
//!
//! One key set row lives in storage: the active signing keypair, the public
//! halves of former signing keys (still trusted until their expiry), and the
//! next rotation deadline. Rotation is driven through `update_keys`, so when
//! several instances race only one installs a fresh keypair; the losers
//! observe the winner's row on their next read. Tokens always carry the
//! signing key's `kid` in the JWS header and verify against any non-expired
//! published key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::storage::{retry_read, Storage, StorageError};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("no signing key installed")]
    NoSigningKey,

    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    #[error("key material invalid: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("token invalid: {0}")]
    InvalidToken(String),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Algorithms the provider can sign with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SigningAlgorithm {
    #[serde(rename = "RS256")]
    Rs256,
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::EdDsa => "EdDSA",
        }
    }

    pub fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::EdDsa => Algorithm::EdDSA,
        }
    }
}

impl std::str::FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "EdDSA" => Ok(SigningAlgorithm::EdDsa),
            other => Err(format!(
                "unsupported signing algorithm {other:?}, expected RS256 or EdDSA"
            )),
        }
    }
}

/// A public key as published in the JWKS document (RFC 7517).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub kid: String,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
}

impl JsonWebKey {
    pub fn decoding_key(&self) -> Result<DecodingKey, KeyError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_deref().ok_or_else(|| missing_param("n"))?;
                let e = self.e.as_deref().ok_or_else(|| missing_param("e"))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|err| KeyError::InvalidKey(err.to_string()))
            }
            "OKP" => {
                let x = self.x.as_deref().ok_or_else(|| missing_param("x"))?;
                DecodingKey::from_ed_components(x)
                    .map_err(|err| KeyError::InvalidKey(err.to_string()))
            }
            other => Err(KeyError::InvalidKey(format!("unsupported kty {other:?}"))),
        }
    }
}

fn missing_param(name: &str) -> KeyError {
    KeyError::InvalidKey(format!("JWK missing {name:?} parameter"))
}

/// The active signing keypair. The private half never leaves storage and is
/// wiped from memory on drop.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPair {
    pub kid: String,
    pub alg: SigningAlgorithm,
    pub private_key_pem: String,
    pub public_jwk: JsonWebKey,
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private_key_pem.zeroize();
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("alg", &self.alg)
            .field("private_key_pem", &"<redacted>")
            .field("public_jwk", &self.public_jwk)
            .finish()
    }
}

/// A former signing key, still accepted for verification until `expiry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub jwk: JsonWebKey,
    pub expiry: DateTime<Utc>,
}

/// The persisted key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keys {
    pub signing_key: Option<KeyPair>,
    pub verification_keys: Vec<VerificationKey>,
    pub next_rotation: DateTime<Utc>,
}

/// Sign a claim set with a specific keypair. Kept free of `KeyManager` so a
/// single fetched keypair can sign the id and access token of one response
/// with a consistent `kid`.
pub fn sign_with(key: &KeyPair, claims: &impl Serialize) -> Result<String, KeyError> {
    let encoding_key = match key.alg {
        SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(key.private_key_pem.as_bytes()),
        SigningAlgorithm::EdDsa => EncodingKey::from_ed_pem(key.private_key_pem.as_bytes()),
    }
    .map_err(|err| KeyError::InvalidKey(err.to_string()))?;

    let mut header = Header::new(key.alg.jwt_algorithm());
    header.kid = Some(key.kid.clone());
    jsonwebtoken::encode(&header, claims, &encoding_key)
        .map_err(|err| KeyError::Signing(err.to_string()))
}

fn generate_key_pair(alg: SigningAlgorithm) -> Result<KeyPair, KeyError> {
    let kid = crate::storage::new_id();
    match alg {
        SigningAlgorithm::Rs256 => {
            let private = RsaPrivateKey::new(&mut OsRng, 2048)
                .map_err(|err| KeyError::InvalidKey(err.to_string()))?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| KeyError::InvalidKey(err.to_string()))?
                .to_string();
            let public = private.to_public_key();
            Ok(KeyPair {
                public_jwk: JsonWebKey {
                    kty: "RSA".into(),
                    use_: "sig".into(),
                    kid: kid.clone(),
                    alg: alg.as_str().into(),
                    n: Some(URL_SAFE_NO_PAD.encode(public.n().to_bytes_be())),
                    e: Some(URL_SAFE_NO_PAD.encode(public.e().to_bytes_be())),
                    crv: None,
                    x: None,
                },
                kid,
                alg,
                private_key_pem: pem,
            })
        }
        SigningAlgorithm::EdDsa => {
            let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
            let pem = signing
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|err| KeyError::InvalidKey(err.to_string()))?
                .to_string();
            Ok(KeyPair {
                public_jwk: JsonWebKey {
                    kty: "OKP".into(),
                    use_: "sig".into(),
                    kid: kid.clone(),
                    alg: alg.as_str().into(),
                    n: None,
                    e: None,
                    crv: Some("Ed25519".into()),
                    x: Some(URL_SAFE_NO_PAD.encode(signing.verifying_key().to_bytes())),
                },
                kid,
                alg,
                private_key_pem: pem,
            })
        }
    }
}

pub struct KeyManager {
    storage: Arc<dyn Storage>,
    alg: SigningAlgorithm,
    rotation_period: Duration,
    verification_window: Duration,
}

impl KeyManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        alg: SigningAlgorithm,
        rotation_period: Duration,
        verification_window: Duration,
    ) -> Self {
        Self {
            storage,
            alg,
            rotation_period,
            verification_window,
        }
    }

    /// Install a fresh signing key if none exists or the rotation deadline
    /// has passed. Returns whether this instance performed the rotation;
    /// losers of the storage race return `false` and simply use the
    /// winner's key.
    pub async fn rotate_if_needed(&self, now: DateTime<Utc>) -> Result<bool, KeyError> {
        match self.storage.get_keys().await {
            Ok(keys) if keys.signing_key.is_some() && keys.next_rotation > now => {
                return Ok(false)
            }
            Ok(_) | Err(StorageError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }

        // Keygen happens outside the updater so the row lock is not held
        // during the expensive part. If we lose the race the pair is dropped.
        let fresh = generate_key_pair(self.alg)?;
        let rotation_period = self.rotation_period;
        let verification_window = self.verification_window;
        let rotated = Arc::new(AtomicBool::new(false));
        let rotated_in_updater = Arc::clone(&rotated);

        self.storage
            .update_keys(Box::new(move |current| {
                let mut keys = current.unwrap_or(Keys {
                    signing_key: None,
                    verification_keys: Vec::new(),
                    next_rotation: now,
                });

                // Someone else rotated between our read and this update.
                if keys.signing_key.is_some() && keys.next_rotation > now {
                    return Ok(keys);
                }

                if let Some(old) = keys.signing_key.take() {
                    keys.verification_keys.push(VerificationKey {
                        jwk: old.public_jwk.clone(),
                        expiry: now + verification_window,
                    });
                }
                keys.verification_keys.retain(|key| key.expiry > now);
                keys.signing_key = Some(fresh);
                keys.next_rotation = now + rotation_period;
                rotated_in_updater.store(true, Ordering::SeqCst);
                Ok(keys)
            }))
            .await?;

        Ok(rotated.load(Ordering::SeqCst))
    }

    /// The currently active signing keypair.
    pub async fn signing_key(&self) -> Result<KeyPair, KeyError> {
        let storage = Arc::clone(&self.storage);
        let keys = retry_read(|| {
            let storage = Arc::clone(&storage);
            async move { storage.get_keys().await }
        })
        .await
        .map_err(|err| match err {
            StorageError::NotFound => KeyError::NoSigningKey,
            other => KeyError::Storage(other),
        })?;
        keys.signing_key.ok_or(KeyError::NoSigningKey)
    }

    /// All public keys a verifier should trust right now: the signing key
    /// plus every verification key that has not expired.
    pub async fn jwks(&self) -> Result<Vec<JsonWebKey>, KeyError> {
        let keys = self.storage.get_keys().await.map_err(|err| match err {
            StorageError::NotFound => KeyError::NoSigningKey,
            other => KeyError::Storage(other),
        })?;

        let now = Utc::now();
        let mut jwks = Vec::new();
        if let Some(signing) = &keys.signing_key {
            jwks.push(signing.public_jwk.clone());
        }
        for key in &keys.verification_keys {
            if key.expiry > now {
                jwks.push(key.jwk.clone());
            }
        }
        if jwks.is_empty() {
            return Err(KeyError::NoSigningKey);
        }
        Ok(jwks)
    }

    /// Verify a JWS produced by this provider and deserialize its claims.
    /// The `kid` header selects the key; tokens signed by a key that has
    /// rotated out of the verification window fail here.
    pub async fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, KeyError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| KeyError::InvalidToken(err.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| KeyError::InvalidToken("missing kid header".into()))?;

        let jwks = self.jwks().await?;
        let jwk = jwks
            .into_iter()
            .find(|key| key.kid == kid)
            .ok_or(KeyError::UnknownKeyId(kid))?;

        let mut validation = Validation::new(
            jwk.alg
                .parse::<SigningAlgorithm>()
                .map_err(KeyError::InvalidKey)?
                .jwt_algorithm(),
        );
        // Audience semantics differ per caller; they are checked against the
        // claims after decoding.
        validation.validate_aud = false;

        jsonwebtoken::decode::<T>(token, &jwk.decoding_key()?, &validation)
            .map(|data| data.claims)
            .map_err(|err| KeyError::InvalidToken(err.to_string()))
    }
}
