//! Deterministic addressing of the channel shared by exactly two participants

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Separator placed between the two sorted identity tokens of a [ChannelId], identity tokens
/// may never contain it
pub const RESERVED_DELIMITER: char = '\u{1F}';

/// Length of an SHA256 hash in bytes
pub const SHA256_HASH_LEN: usize = 32;

/// A user taking part in a channel
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Unique identity token of the user, e.g. their normalized email address
    pub identity: String,
    /// Name shown to the other side of a channel
    pub display_name: String,
}

/// Symmetric key of the channel between two participants, see [derive_channel_id]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

/// Why an identity token cannot be used to address a channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidIdentityReason {
    #[error("identity token is empty")]
    Empty,
    #[error("identity token contains the reserved channel delimiter")]
    ContainsDelimiter,
}

/// Any error that may occur when deriving or parsing a [ChannelId]
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid identity {token:?}: {reason}")]
    InvalidIdentity {
        token: String,
        reason: InvalidIdentityReason,
    },
    #[error("Malformed channel id {0:?}")]
    Malformed(String),
}

/// Derive the id of the channel between the two given identity tokens.
///
/// The tokens are sorted by byte order before being joined with [RESERVED_DELIMITER], so the
/// result does not depend on argument order. Both tokens may be equal, yielding the
/// participant's self-channel.
pub fn derive_channel_id(a: &str, b: &str) -> Result<ChannelId, AddressError> {
    validate_identity(a)?;
    validate_identity(b)?;

    let (low, high) = if a <= b { (a, b) } else { (b, a) };

    let mut id = String::with_capacity(low.len() + high.len() + RESERVED_DELIMITER.len_utf8());
    id.push_str(low);
    id.push(RESERVED_DELIMITER);
    id.push_str(high);

    Ok(ChannelId(id))
}

/// Check that the given identity token can be used to address a channel
pub fn validate_identity(token: &str) -> Result<(), AddressError> {
    let reason = if token.is_empty() {
        InvalidIdentityReason::Empty
    } else if token.contains(RESERVED_DELIMITER) {
        InvalidIdentityReason::ContainsDelimiter
    } else {
        return Ok(());
    };

    Err(AddressError::InvalidIdentity {
        token: token.to_owned(),
        reason,
    })
}

impl Participant {
    pub fn new(identity: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            display_name: display_name.into(),
        }
    }
}

impl ChannelId {
    /// Shortcut for [derive_channel_id] with the identities of both participants
    pub fn between(a: &Participant, b: &Participant) -> Result<Self, AddressError> {
        derive_channel_id(&a.identity, &b.identity)
    }

    /// Parse a channel id that was previously produced by [derive_channel_id], e.g. when read
    /// back from storage
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let (low, high) = raw
            .split_once(RESERVED_DELIMITER)
            .ok_or_else(|| AddressError::Malformed(raw.to_owned()))?;

        let id = derive_channel_id(low, high).map_err(|_| AddressError::Malformed(raw.to_owned()))?;
        match id.0 == raw {
            true => Ok(id),
            false => Err(AddressError::Malformed(raw.to_owned())),
        }
    }

    /// Get the raw key of this channel as it is used to scope storage
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the identity tokens of both participants, in sorted order
    pub fn participants(&self) -> (&str, &str) {
        // Constructed only by derive_channel_id, so the delimiter is always present
        self.0
            .split_once(RESERVED_DELIMITER)
            .unwrap_or((self.0.as_str(), ""))
    }

    /// Check if the given identity is one of the two participants of this channel
    pub fn involves(&self, identity: &str) -> bool {
        let (low, high) = self.participants();
        low == identity || high == identity
    }

    /// Get the identity on the other side of this channel from `identity`
    pub fn peer_of(&self, identity: &str) -> Option<&str> {
        match self.participants() {
            (low, high) if low == identity => Some(high),
            (low, high) if high == identity => Some(low),
            _ => None,
        }
    }

    /// Calculate the SHA256 fingerprint of this channel id, used to refer to the channel without
    /// revealing the identities of its participants
    pub fn fingerprint(&self) -> [u8; SHA256_HASH_LEN] {
        let mut hash = Sha256::new();
        hash.update(self.0.as_bytes());
        hash.finalize().into()
    }

    /// Get a short version (last 4 bytes of the fingerprint) of this channel ID to be used for
    /// display in log messages
    pub fn short(&self) -> impl fmt::Display {
        struct ShortId([u8; SHA256_HASH_LEN]);

        impl fmt::Display for ShortId {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0[SHA256_HASH_LEN - 4..] {
                    write!(f, "{:02x}", byte)?
                }

                Ok(())
            }
        }

        ShortId(self.fingerprint())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (low, high) = self.participants();
        f.debug_tuple("ChannelId").field(&low).field(&high).finish()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.short().fmt(f)
    }
}

impl fmt::LowerHex for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.fingerprint() {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl TryFrom<String> for ChannelId {
    type Error = AddressError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_symmetric_for_argument_order() {
        let ab = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();
        let ba = derive_channel_id("bob@u.edu", "alice@u.edu").unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.participants(), ("alice@u.edu", "bob@u.edu"));
    }

    #[test]
    fn test_sorts_by_byte_order() {
        // Uppercase sorts before lowercase in byte order, comparison is case-sensitive
        let id = derive_channel_id("bob", "Bob").unwrap();
        assert_eq!(id.participants(), ("Bob", "bob"));
        assert_ne!(id, derive_channel_id("bob", "bob").unwrap());
    }

    #[test]
    fn test_self_channel() {
        let id = derive_channel_id("carol@u.edu", "carol@u.edu").unwrap();

        assert_eq!(id, derive_channel_id("carol@u.edu", "carol@u.edu").unwrap());
        assert!(id.involves("carol@u.edu"));
        assert_eq!(id.peer_of("carol@u.edu"), Some("carol@u.edu"));
    }

    #[test]
    fn test_rejects_empty_and_delimiter() {
        let empty = derive_channel_id("", "bob@u.edu").unwrap_err();
        assert_eq!(
            empty,
            AddressError::InvalidIdentity {
                token: String::new(),
                reason: InvalidIdentityReason::Empty
            }
        );

        let smuggled = format!("alice{}bob", RESERVED_DELIMITER);
        let err = derive_channel_id("carol@u.edu", &smuggled).unwrap_err();
        assert!(matches!(
            err,
            AddressError::InvalidIdentity {
                reason: InvalidIdentityReason::ContainsDelimiter,
                ..
            }
        ));
    }

    #[test]
    fn test_distinct_pairs_never_collide() {
        // Tokens chosen so naive concatenation with common separators would collide
        let tokens = ["a", "b", "a_b", "b_c", "c", "a_", "_b", "ab", "a|b", "b|"];
        let mut seen: HashMap<ChannelId, (&str, &str)> = HashMap::new();

        for (i, a) in tokens.iter().enumerate() {
            for b in &tokens[i..] {
                let id = derive_channel_id(a, b).unwrap();
                if let Some(prev) = seen.insert(id, (*a, *b)) {
                    panic!("{:?} and {:?} collided", prev, (a, b));
                }
            }
        }
    }

    #[test]
    fn test_peer_of() {
        let id = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();

        assert_eq!(id.peer_of("alice@u.edu"), Some("bob@u.edu"));
        assert_eq!(id.peer_of("bob@u.edu"), Some("alice@u.edu"));
        assert_eq!(id.peer_of("mallory@u.edu"), None);
        assert!(!id.involves("mallory@u.edu"));
    }

    #[test]
    fn test_parse_accepts_only_derived_ids() {
        let id = derive_channel_id("bob@u.edu", "alice@u.edu").unwrap();
        assert_eq!(ChannelId::parse(id.as_str()).unwrap(), id);

        // Unsorted and undelimited keys were never produced by derive_channel_id
        let unsorted = format!("bob@u.edu{}alice@u.edu", RESERVED_DELIMITER);
        assert!(ChannelId::parse(&unsorted).is_err());
        assert!(ChannelId::parse("alice@u.edu_bob@u.edu").is_err());
    }

    #[test]
    fn test_short_id_hides_identities() {
        let id = derive_channel_id("alice@u.edu", "bob@u.edu").unwrap();
        let short = id.to_string();

        assert_eq!(short.len(), 8);
        assert!(!short.contains("alice"));
        assert_eq!(format!("{:x}", id).len(), SHA256_HASH_LEN * 2);
        assert!(format!("{:x}", id).ends_with(&short));
    }
}
