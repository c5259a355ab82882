use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The storage form of an encrypted secret: `hex(iv):hex(authTag):hex(ciphertext)`.
///
/// This type only knows the wire shape; the actual AEAD encrypt/decrypt
/// logic lives in `renderlite-core` (it needs the process's key material,
/// which this crate has no business holding). Keeping the envelope a
/// distinct type instead of a bare `String` means a call site can't hand a
/// plaintext value to something expecting ciphertext without at least
/// going through `Envelope::parse`.
///
/// `iv` is a 12-byte AES-256-GCM nonce, hex-encoded to 24 characters —
/// not the 16 bytes the informal description of this format elsewhere
/// calls an "IV". 12 bytes is the nonce size `Aes256Gcm` is built for and
/// what every mainstream AES-GCM implementation uses; the component name
/// is kept as `iv` only for continuity with that description, not because
/// the bytes are a 16-byte initialization vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(String);

pub struct Parts<'a> {
    pub iv: &'a str,
    pub auth_tag: &'a str,
    pub ciphertext: &'a str,
}

impl Envelope {
    /// Assembles an envelope from its three hex components. Does not
    /// validate that the components are actually hex; that's enforced at
    /// decrypt time, where a malformed value becomes an error rather than
    /// a panic.
    pub fn new(iv_hex: &str, auth_tag_hex: &str, ciphertext_hex: &str) -> Self {
        Self(format!("{iv_hex}:{auth_tag_hex}:{ciphertext_hex}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the envelope into its three colon-separated components,
    /// rejecting anything that doesn't have exactly three.
    pub fn parts(&self) -> Result<Parts<'_>, Error> {
        let mut iter = self.0.split(':');
        let (Some(iv), Some(auth_tag), Some(ciphertext), None) =
            (iter.next(), iter.next(), iter.next(), iter.next())
        else {
            return Err(Error::Envelope(
                "envelope must have exactly three colon-separated components".into(),
            ));
        };
        Ok(Parts {
            iv,
            auth_tag,
            ciphertext,
        })
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

impl FromStr for Envelope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let envelope = Envelope(s.to_string());
        envelope.parts()?;
        Ok(envelope)
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::Type<sqlx::Sqlite> for Envelope {
    fn type_info() -> <sqlx::Sqlite as sqlx::Database>::TypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::Encode<'_, sqlx::Sqlite> for Envelope {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'_>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <String as sqlx::Encode<sqlx::Sqlite>>::encode(self.0.clone(), buf)
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::Decode<'_, sqlx::Sqlite> for Envelope {
    fn decode(
        value: <sqlx::Sqlite as sqlx::database::HasValueRef<'_>>::ValueRef,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Envelope(s))
    }
}
