//! Common types used throughout the signaling core

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random identifier
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Connection identity of a peer (one per signaling socket)
    PeerId
);
string_id!(
    /// Caller-supplied room name
    RoomId
);
string_id!(
    /// Engine-assigned transport identifier
    TransportId
);
string_id!(
    /// Engine-assigned producer identifier
    ProducerId
);
string_id!(
    /// Engine-assigned consumer identifier
    ConsumerId
);

/// Media kind. Closed set, so per-kind state lives in a [`KindMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [Self; 2] = [Self::Audio, Self::Video];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media direction of a transport pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client sends media (producer side)
    Send,
    /// Client receives media (consumer side)
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send => f.write_str("producer"),
            Self::Recv => f.write_str("consumer"),
        }
    }
}

/// Fixed two-slot map indexed by [`MediaKind`]
#[derive(Debug, Clone)]
pub struct KindMap<T> {
    audio: Option<T>,
    video: Option<T>,
}

impl<T> Default for KindMap<T> {
    fn default() -> Self {
        Self {
            audio: None,
            video: None,
        }
    }
}

impl<T> KindMap<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            audio: None,
            video: None,
        }
    }

    const fn slot(&self, kind: MediaKind) -> &Option<T> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    fn slot_mut(&mut self, kind: MediaKind) -> &mut Option<T> {
        match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        }
    }

    pub const fn get(&self, kind: MediaKind) -> Option<&T> {
        self.slot(kind).as_ref()
    }

    pub fn get_mut(&mut self, kind: MediaKind) -> Option<&mut T> {
        self.slot_mut(kind).as_mut()
    }

    pub const fn contains(&self, kind: MediaKind) -> bool {
        self.slot(kind).is_some()
    }

    /// Insert a value, returning the previous occupant of the slot
    pub fn insert(&mut self, kind: MediaKind, value: T) -> Option<T> {
        self.slot_mut(kind).replace(value)
    }

    pub fn take(&mut self, kind: MediaKind) -> Option<T> {
        self.slot_mut(kind).take()
    }

    /// Remove the value only if `pred` holds for it
    pub fn take_if(&mut self, kind: MediaKind, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let slot = self.slot_mut(kind);
        if slot.as_ref().is_some_and(pred) {
            slot.take()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MediaKind, &T)> {
        MediaKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|v| (kind, v)))
    }

    /// Empty both slots
    pub fn drain(&mut self) -> Vec<(MediaKind, T)> {
        MediaKind::ALL
            .into_iter()
            .filter_map(|kind| self.take(kind).map(|v| (kind, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        usize::from(self.audio.is_some()) + usize::from(self.video.is_some())
    }

    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

macro_rules! opaque_json {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl From<Value> for $name {
            fn from(v: Value) -> Self {
                Self(v)
            }
        }
    };
}

opaque_json!(
    /// ICE username fragment/password as produced by the engine
    IceParameters
);
opaque_json!(
    /// ICE candidate list as produced by the engine
    IceCandidates
);
opaque_json!(
    /// DTLS role and fingerprints, in either direction
    DtlsParameters
);
opaque_json!(
    /// RTP sending/receiving parameters
    RtpParameters
);
opaque_json!(
    /// Router or remote-device RTP capabilities
    RtpCapabilities
);

/// Discovery tuple describing a live producer in some peer's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub producer_socket_id: PeerId,
    pub kind: MediaKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_map_slots() {
        let mut map = KindMap::new();
        assert!(map.is_empty());

        assert!(map.insert(MediaKind::Video, 1).is_none());
        assert_eq!(map.insert(MediaKind::Video, 2), Some(1));
        assert_eq!(map.get(MediaKind::Video), Some(&2));
        assert!(!map.contains(MediaKind::Audio));
        assert_eq!(map.len(), 1);

        map.insert(MediaKind::Audio, 3);
        let drained = map.drain();
        assert_eq!(drained, vec![(MediaKind::Audio, 3), (MediaKind::Video, 2)]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_kind_map_take_if() {
        let mut map = KindMap::new();
        map.insert(MediaKind::Audio, "a");

        assert!(map.take_if(MediaKind::Audio, |v| *v == "b").is_none());
        assert_eq!(map.take_if(MediaKind::Audio, |v| *v == "a"), Some("a"));
        assert!(map.take_if(MediaKind::Video, |_| true).is_none());
    }

    #[test]
    fn test_media_kind_serde() {
        assert_eq!(serde_json::to_string(&MediaKind::Audio).unwrap(), "\"audio\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
        assert!(serde_json::from_str::<MediaKind>("\"screen\"").is_err());
    }

    #[test]
    fn test_producer_info_wire_names() {
        let info = ProducerInfo {
            producer_id: ProducerId::from("p1"),
            producer_socket_id: PeerId::from("s1"),
            kind: MediaKind::Video,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["producerId"], "p1");
        assert_eq!(json["producerSocketId"], "s1");
        assert_eq!(json["kind"], "video");
    }
}
