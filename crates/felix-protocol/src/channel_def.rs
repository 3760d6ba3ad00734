//! Channel descriptors.
//!
//! A [`ChannelSource`] names one endpoint at which a peer is reachable,
//! tagged by transport kind.  Publishers advertise a list of sources; a
//! subscriber picks one whose kind intersects its own mask, preferring
//! kinds in [`KIND_PREFERENCE`] order.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Transport kind of a channel.  Doubles as a bitmask member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChannelKind {
    Tcp = 0b0001,
    Udp = 0b0010,
    Shm = 0b0100,
    Ws = 0b1000,
}

/// Subscriber/publisher kind selection order: fastest first.
pub const KIND_PREFERENCE: [ChannelKind; 4] = [
    ChannelKind::Shm,
    ChannelKind::Tcp,
    ChannelKind::Udp,
    ChannelKind::Ws,
];

/// A set of [`ChannelKind`]s packed into one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelKindMask(u8);

impl ChannelKindMask {
    pub const fn empty() -> Self {
        ChannelKindMask(0)
    }

    pub const fn single(kind: ChannelKind) -> Self {
        ChannelKindMask(kind as u8)
    }

    pub fn of(kinds: &[ChannelKind]) -> Self {
        let mut bits = 0;
        for kind in kinds {
            bits |= *kind as u8;
        }
        ChannelKindMask(bits)
    }

    pub fn contains(self, kind: ChannelKind) -> bool {
        self.0 & (kind as u8) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Kinds present in the mask, in [`KIND_PREFERENCE`] order.
    pub fn iter_preferred(self) -> impl Iterator<Item = ChannelKind> {
        KIND_PREFERENCE.into_iter().filter(move |k| self.contains(*k))
    }
}

impl std::ops::BitOr<ChannelKind> for ChannelKindMask {
    type Output = ChannelKindMask;

    fn bitor(self, rhs: ChannelKind) -> ChannelKindMask {
        ChannelKindMask(self.0 | rhs as u8)
    }
}

impl From<ChannelKind> for ChannelKindMask {
    fn from(kind: ChannelKind) -> Self {
        ChannelKindMask::single(kind)
    }
}

/// One reachable endpoint, tagged by kind.
///
/// Equality is structural.  A source is *valid* when its address fields are
/// populated; `listen` resolves port-0 / fresh-segment placeholders into
/// concrete addresses before a source is ever advertised to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelSource {
    Tcp { addr: SocketAddr },
    Udp { addr: SocketAddr },
    Shm { segment: String, size: u32 },
    Ws { url: String },
}

impl ChannelSource {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelSource::Tcp { .. } => ChannelKind::Tcp,
            ChannelSource::Udp { .. } => ChannelKind::Udp,
            ChannelSource::Shm { .. } => ChannelKind::Shm,
            ChannelSource::Ws { .. } => ChannelKind::Ws,
        }
    }

    /// A source is valid once every address field is populated.
    pub fn is_valid(&self) -> bool {
        match self {
            ChannelSource::Tcp { addr } | ChannelSource::Udp { addr } => addr.port() != 0,
            ChannelSource::Shm { segment, size } => !segment.is_empty() && *size > 0,
            ChannelSource::Ws { url } => url.starts_with("ws://") || url.starts_with("wss://"),
        }
    }

    /// Mint a placeholder source for `kind`: an OS-assigned port for
    /// TCP/UDP/WS, a fresh segment handle for SHM.
    pub fn pick_random(kind: ChannelKind) -> ChannelSource {
        match kind {
            ChannelKind::Tcp => ChannelSource::Tcp {
                addr: "127.0.0.1:0".parse().unwrap(),
            },
            ChannelKind::Udp => ChannelSource::Udp {
                addr: "127.0.0.1:0".parse().unwrap(),
            },
            ChannelKind::Shm => ChannelSource::Shm {
                segment: format!("felix-shm-{}", uuid::Uuid::new_v4().simple()),
                size: DEFAULT_SHM_SEGMENT_SIZE,
            },
            ChannelKind::Ws => ChannelSource::Ws {
                url: "ws://127.0.0.1:0".to_owned(),
            },
        }
    }
}

/// Default ring capacity for a freshly minted SHM segment, in bytes.
pub const DEFAULT_SHM_SEGMENT_SIZE: u32 = 1024 * 1024;

impl std::fmt::Display for ChannelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelSource::Tcp { addr } => write!(f, "tcp://{addr}"),
            ChannelSource::Udp { addr } => write!(f, "udp://{addr}"),
            ChannelSource::Shm { segment, size } => write!(f, "shm://{segment}#{size}"),
            ChannelSource::Ws { url } => write!(f, "{url}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_contains_and_preference_order() {
        let mask = ChannelKindMask::of(&[ChannelKind::Ws, ChannelKind::Tcp]);
        assert!(mask.contains(ChannelKind::Tcp));
        assert!(mask.contains(ChannelKind::Ws));
        assert!(!mask.contains(ChannelKind::Shm));

        let preferred: Vec<_> = mask.iter_preferred().collect();
        assert_eq!(preferred, vec![ChannelKind::Tcp, ChannelKind::Ws]);
    }

    #[test]
    fn pick_random_tcp_is_port_zero_placeholder() {
        let source = ChannelSource::pick_random(ChannelKind::Tcp);
        // Placeholder sources are not yet valid; listen() resolves them.
        assert!(!source.is_valid());
        assert_eq!(source.kind(), ChannelKind::Tcp);
    }

    #[test]
    fn pick_random_shm_mints_distinct_segments() {
        let a = ChannelSource::pick_random(ChannelKind::Shm);
        let b = ChannelSource::pick_random(ChannelKind::Shm);
        assert!(a.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn equality_is_structural() {
        let a = ChannelSource::Tcp {
            addr: "127.0.0.1:1234".parse().unwrap(),
        };
        let b = ChannelSource::Tcp {
            addr: "127.0.0.1:1234".parse().unwrap(),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn serde_round_trip_keeps_kind_tag() {
        let source = ChannelSource::Shm {
            segment: "seg".into(),
            size: 64,
        };
        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"kind\":\"shm\""));
        let back: ChannelSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
    }
}
