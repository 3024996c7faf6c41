//! Wire protocol spoken between syncmd replicas
//!
//! Every message is a postcard-encoded [`Message`] inside a frame of
//! `[u32 LE length][u32 LE crc32c][payload]`.

pub mod connection;
pub mod errors;
pub mod frame;
pub mod message;
pub mod validation;

pub use connection::FramedConnection;
pub use errors::{ProtoError, Result};
pub use frame::{encode_frame, FrameReader, FrameWriter, FRAME_HEADER_LEN, MAX_FRAME_BYTES};
pub use message::{Message, NackKind};
pub use validation::{ValidationError, Validator};

// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: &str = "0.1.0";
pub const PROTOCOL_VERSION_MAJOR: u32 = 0;
pub const PROTOCOL_VERSION_MINOR: u32 = 1;
pub const PROTOCOL_VERSION_PATCH: u32 = 0;

/// Version compatibility checking for the handshake
pub struct VersionNegotiator;

impl VersionNegotiator {
    /// Compatible when the major versions match
    pub fn is_compatible(peer_version: &str) -> bool {
        matches!(Self::parse_version(peer_version), Some((major, _, _)) if major == PROTOCOL_VERSION_MAJOR)
    }

    fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some((major, minor, patch))
    }

    pub fn compatibility_error(peer_version: &str) -> String {
        match Self::parse_version(peer_version) {
            Some((major, minor, patch)) => format!(
                "Protocol version incompatible: peer {}.{}.{}, we support {} (major version must match)",
                major, minor, patch, PROTOCOL_VERSION
            ),
            None => format!(
                "Invalid protocol version format '{}', expected format like '{}'",
                peer_version, PROTOCOL_VERSION
            ),
        }
    }
}
