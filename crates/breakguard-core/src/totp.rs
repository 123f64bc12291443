//! Time-based one-time passwords (RFC 6238)
//!
//! Codes are derived by dividing Unix time by the time-step, HMAC-ing the
//! resulting counter with the shared secret and dynamically truncating the
//! digest to the configured number of digits. Verification accepts the
//! previous, current and next window to absorb clock skew, and compares
//! codes in constant time.

use std::fmt;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{AuthError, ConfigError, CoreError};
use crate::secret_store::{SecretRecord, SecretStore};

/// Length of generated secrets (160 bits)
pub const SECRET_LENGTH: usize = 20;

/// Issuer shown in authenticator apps
pub const DEFAULT_ISSUER: &str = "BreakGuard";

/// Account label shown in authenticator apps
pub const DEFAULT_LABEL: &str = "user@breakguard.local";

/// Code lengths authenticator apps support
pub const DIGIT_RANGE: std::ops::RangeInclusive<u32> = 6..=8;

/// HMAC hash used for code derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HashAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "SHA1",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }
}

/// Code derivation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpParams {
    /// Digits per code (6-8)
    pub digits: u32,
    /// Seconds per time window
    pub step_secs: u64,
    pub algorithm: HashAlgorithm,
}

impl Default for TotpParams {
    fn default() -> Self {
        Self {
            digits: 6,
            step_secs: 30,
            algorithm: HashAlgorithm::Sha1,
        }
    }
}

impl TotpParams {
    /// Reject digit counts outside 6-8 and a zero time-step
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !DIGIT_RANGE.contains(&self.digits) {
            return Err(ConfigError::invalid(
                "totp_digits",
                format!("{} is not within 6-8", self.digits),
            ));
        }
        if self.step_secs == 0 {
            return Err(ConfigError::invalid("totp_step_secs", "must be at least 1"));
        }
        Ok(())
    }
}

/// The TOTP shared secret
///
/// The bytes are zeroized on drop and never appear in `Debug` output.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AuthSecret {
    #[serde(with = "hex_bytes")]
    bytes: Vec<u8>,
    #[zeroize(skip)]
    params: TotpParams,
}

impl AuthSecret {
    /// Generate a fresh random secret
    pub fn generate(params: TotpParams) -> Result<Self, ConfigError> {
        params.validate()?;
        let mut bytes = vec![0u8; SECRET_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Ok(Self { bytes, params })
    }

    /// Wrap existing secret bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, params: TotpParams) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            bytes: bytes.into(),
            params,
        })
    }

    /// Decode a base32 secret as typed into an authenticator app
    pub fn from_base32(encoded: &str, params: TotpParams) -> Result<Self, ConfigError> {
        let bytes = base32::decode(encoded)
            .ok_or_else(|| ConfigError::invalid("totp_secret", "not valid base32"))?;
        Self::from_bytes(bytes, params)
    }

    pub fn params(&self) -> &TotpParams {
        &self.params
    }
}

impl fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSecret")
            .field("bytes", &"[redacted]")
            .field("params", &self.params)
            .finish()
    }
}

/// Data an authenticator app needs to start producing codes
#[derive(Clone)]
pub struct Provisioning {
    pub issuer: String,
    pub label: String,
    /// Base32 secret for manual entry
    pub secret_base32: String,
    /// `otpauth://` URI for QR rendering
    pub uri: String,
}

impl Provisioning {
    /// Secret in groups of four for easier manual entry
    pub fn display_secret(&self) -> String {
        self.secret_base32
            .as_bytes()
            .chunks(4)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for Provisioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioning")
            .field("issuer", &self.issuer)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Drop for Provisioning {
    fn drop(&mut self) {
        self.secret_base32.zeroize();
        self.uri.zeroize();
    }
}

/// TOTP enrollment and verification
#[derive(Debug, Clone)]
pub struct TotpEngine {
    issuer: String,
    label: String,
    params: TotpParams,
}

impl Default for TotpEngine {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            label: DEFAULT_LABEL.to_string(),
            params: TotpParams::default(),
        }
    }
}

impl TotpEngine {
    pub fn new(
        issuer: impl Into<String>,
        label: impl Into<String>,
        params: TotpParams,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            issuer: issuer.into(),
            label: label.into(),
            params,
        })
    }

    /// Generate and store a new secret, replacing any previous enrollment
    pub fn enroll(&self, store: &SecretStore) -> Result<Provisioning, CoreError> {
        let secret = AuthSecret::generate(self.params)?;
        store.seal(SecretRecord::TotpSecret, &secret)?;
        info!("Enrolled new TOTP secret ({} digits, {}s step)", self.params.digits, self.params.step_secs);
        Ok(self.provisioning(&secret))
    }

    /// Check that the stored secret produces `code`, confirming the user's
    /// authenticator app was set up correctly
    pub fn confirm_enrollment(
        &self,
        store: &SecretStore,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let secret: AuthSecret = store
            .unseal(SecretRecord::TotpSecret)?
            .ok_or(AuthError::NotEnrolled("TOTP"))?;
        self.verify(&secret, code, now)?;
        Ok(())
    }

    /// Provisioning data for an existing secret
    pub fn provisioning(&self, secret: &AuthSecret) -> Provisioning {
        let secret_base32 = base32::encode(&secret.bytes);
        let params = secret.params;
        let uri = format!(
            "otpauth://totp/{issuer}:{label}?secret={secret}&issuer={issuer}&algorithm={alg}&digits={digits}&period={period}",
            issuer = percent_encode(&self.issuer),
            label = percent_encode(&self.label),
            secret = secret_base32,
            alg = params.algorithm.as_str(),
            digits = params.digits,
            period = params.step_secs,
        );
        Provisioning {
            issuer: self.issuer.clone(),
            label: self.label.clone(),
            secret_base32,
            uri,
        }
    }

    /// The code for the window containing `now`
    ///
    /// For enrollment helpers only; unlock always goes through [`verify`].
    ///
    /// [`verify`]: TotpEngine::verify
    pub fn current_code(&self, secret: &AuthSecret, now: DateTime<Utc>) -> Result<String, AuthError> {
        let params = checked_params(secret)?;
        let counter = counter_at(now, params.step_secs);
        let code = hotp(&secret.bytes, counter, &params)?;
        Ok(format_code(code, params.digits))
    }

    /// Verify a submitted code against the previous, current and next window
    pub fn verify(&self, secret: &AuthSecret, submitted: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
        let params = checked_params(secret)?;
        let normalized: String = submitted.chars().filter(|c| !c.is_whitespace()).collect();

        if normalized.len() != params.digits as usize || !normalized.bytes().all(|b| b.is_ascii_digit()) {
            debug!("Rejected malformed TOTP submission");
            return Err(AuthError::InvalidCode { attempts_remaining: 0 });
        }

        let counter = counter_at(now, params.step_secs);
        let mut matched = Choice::from(0u8);
        for candidate in [counter.checked_sub(1), Some(counter), counter.checked_add(1)]
            .into_iter()
            .flatten()
        {
            let expected = format_code(hotp(&secret.bytes, candidate, &params)?, params.digits);
            matched |= expected.as_bytes().ct_eq(normalized.as_bytes());
        }

        if bool::from(matched) {
            Ok(())
        } else {
            Err(AuthError::InvalidCode { attempts_remaining: 0 })
        }
    }

    /// Seconds until the code for `now` rolls over
    pub fn seconds_remaining(&self, now: DateTime<Utc>) -> u64 {
        let step = self.params.step_secs;
        let secs = u64::try_from(now.timestamp()).unwrap_or(0);
        step - secs % step
    }

    pub fn params(&self) -> &TotpParams {
        &self.params
    }
}

/// Parameters of a secret, which may have been read back from disk
fn checked_params(secret: &AuthSecret) -> Result<TotpParams, AuthError> {
    secret
        .params
        .validate()
        .map_err(|e| AuthError::Crypto(e.to_string()))?;
    Ok(secret.params)
}

fn counter_at(now: DateTime<Utc>, step_secs: u64) -> u64 {
    u64::try_from(now.timestamp()).unwrap_or(0) / step_secs
}

fn format_code(code: u32, digits: u32) -> String {
    format!("{:0width$}", code, width = digits as usize)
}

/// HOTP value (RFC 4226) for one counter
fn hotp(key: &[u8], counter: u64, params: &TotpParams) -> Result<u32, AuthError> {
    let message = counter.to_be_bytes();
    let digest = match params.algorithm {
        HashAlgorithm::Sha1 => mac::<Hmac<Sha1>>(key, &message)?,
        HashAlgorithm::Sha256 => mac::<Hmac<Sha256>>(key, &message)?,
        HashAlgorithm::Sha512 => mac::<Hmac<Sha512>>(key, &message)?,
    };

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);

    Ok(binary % 10u32.pow(params.digits))
}

fn mac<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|e| AuthError::Crypto(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Percent-encode everything outside the URI unreserved set
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// RFC 4648 base32 without padding, as used by authenticator apps
mod base32 {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    pub fn encode(data: &[u8]) -> String {
        let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
        let mut buffer: u32 = 0;
        let mut bits = 0;

        for &byte in data {
            buffer = (buffer << 8) | byte as u32;
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }

    /// Decode, ignoring case, spaces, dashes and trailing padding
    pub fn decode(encoded: &str) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(encoded.len() * 5 / 8);
        let mut buffer: u32 = 0;
        let mut bits = 0;

        for c in encoded.chars() {
            if c.is_whitespace() || c == '-' || c == '=' {
                continue;
            }
            let value = match c.to_ascii_uppercase() {
                upper @ 'A'..='Z' => upper as u32 - 'A' as u32,
                digit @ '2'..='7' => digit as u32 - '2' as u32 + 26,
                _ => return None,
            };
            buffer = (buffer << 5) | value;
            bits += 5;
            if bits >= 8 {
                bits -= 8;
                out.push((buffer >> bits) as u8);
            }
        }
        Some(out)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
