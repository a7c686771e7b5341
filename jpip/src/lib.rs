//! JPIP data-bin layer.
//!
//! ISO/IEC 15444-9 delivers a JPEG 2000 codestream as a set of logical byte
//! containers called data-bins, each addressed by a class identifier and an
//! in-class identifier, and filled incrementally by messages that may arrive
//! in any order, overlap each other, and stop at arbitrary byte boundaries.
//!
//! This crate holds the receiving side of that model: `Databin` merges
//! incoming byte ranges into disjoint extents, `DatabinStore` routes messages
//! to the right bin and fires arrival listeners, and `ByteRangeBuffer` is the
//! append-only storage for one contiguous extent.
//!
//! Message header parsing itself (the Annex A.2 VBAS fields) is a transport
//! concern and happens before `save_data` is called.

use log::{debug, info};
use std::error;
use std::fmt;
use std::rc::Rc;

use std::collections::HashMap;

mod databin;

pub use databin::{
    ByteRangeBuffer, CopyBytesOptions, DataArrivedListener, Databin, ListenerId,
};

/// Error values returned from data-bin functions.
///
/// Every variant is a fatal data-format problem for the session; missing
/// bytes are never an error at this layer, a query against them simply
/// reports what has arrived so far.
#[derive(Debug)]
pub enum JpipError {
    /// The message class id is not one defined by Table A.2.
    UnknownClassId { class_id: u8 },

    /// The message class is not allowed for the negotiated stream type,
    /// e.g. a tile data-bin message on a JPP stream.
    ClassNotAllowed {
        class: MessageClass,
        stream_type: StreamType,
    },

    /// The main header data-bin has exactly one instance; its in-class
    /// identifier is always zero.
    MainHeaderInClassId { in_class_id: u64 },

    /// The message body length in the header disagrees with the number of
    /// raw bytes actually delivered.
    MessageBodyLengthMismatch { expected: usize, actual: usize },

    /// Two messages with the last-byte flag declared different total
    /// lengths for the same data-bin.
    DatabinLengthConflict {
        known_length: usize,
        conflicting_length: usize,
    },

    /// A message extends beyond the already-declared total length of the
    /// data-bin.
    MessageBeyondDatabinEnd {
        known_length: usize,
        message_end: usize,
    },
}

impl error::Error for JpipError {}
impl fmt::Display for JpipError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownClassId { class_id } => {
                write!(f, "unknown data-bin class id {}", class_id)
            }
            Self::ClassNotAllowed { class, stream_type } => {
                write!(
                    f,
                    "message class {:?} not allowed for stream type {:?}",
                    class, stream_type
                )
            }
            Self::MainHeaderInClassId { in_class_id } => {
                write!(
                    f,
                    "main header message with non-zero in-class id {}",
                    in_class_id
                )
            }
            Self::MessageBodyLengthMismatch { expected, actual } => {
                write!(
                    f,
                    "message header declares {} body bytes but {} were delivered",
                    expected, actual
                )
            }
            Self::DatabinLengthConflict {
                known_length,
                conflicting_length,
            } => {
                write!(
                    f,
                    "data-bin length already fixed at {} but a message declares {}",
                    known_length, conflicting_length
                )
            }
            Self::MessageBeyondDatabinEnd {
                known_length,
                message_end,
            } => {
                write!(
                    f,
                    "message ends at {} beyond declared data-bin length {}",
                    message_end, known_length
                )
            }
        }
    }
}

/// A.2.2 - Message class identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    // 0000 0000 Precinct data-bin message, no auxiliary field
    PrecinctNoAux,

    // 0000 0001 Precinct data-bin message with auxiliary field
    PrecinctWithAux,

    // 0000 0010 Tile header data-bin message
    TileHeader,

    // 0000 0100 Tile data-bin message, no auxiliary field
    TileNoAux,

    // 0000 0101 Tile data-bin message with auxiliary field
    TileWithAux,

    // 0000 0110 Main header data-bin message
    MainHeader,

    // 0000 1000 Metadata-bin message
    Metadata,
}

impl MessageClass {
    pub fn from_id(class_id: u8) -> Result<MessageClass, JpipError> {
        match class_id {
            0 => Ok(MessageClass::PrecinctNoAux),
            1 => Ok(MessageClass::PrecinctWithAux),
            2 => Ok(MessageClass::TileHeader),
            4 => Ok(MessageClass::TileNoAux),
            5 => Ok(MessageClass::TileWithAux),
            6 => Ok(MessageClass::MainHeader),
            8 => Ok(MessageClass::Metadata),
            _ => Err(JpipError::UnknownClassId { class_id }),
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            MessageClass::PrecinctNoAux => 0,
            MessageClass::PrecinctWithAux => 1,
            MessageClass::TileHeader => 2,
            MessageClass::TileNoAux => 4,
            MessageClass::TileWithAux => 5,
            MessageClass::MainHeader => 6,
            MessageClass::Metadata => 8,
        }
    }

    /// The data-bin family this message feeds. Classes that differ only in
    /// the presence of the auxiliary field target the same data-bins.
    pub fn databin_class(&self) -> Option<DatabinClass> {
        match self {
            MessageClass::PrecinctNoAux | MessageClass::PrecinctWithAux => {
                Some(DatabinClass::Precinct)
            }
            MessageClass::TileHeader => Some(DatabinClass::TileHeader),
            MessageClass::TileNoAux | MessageClass::TileWithAux => Some(DatabinClass::TilePart),
            MessageClass::MainHeader => Some(DatabinClass::MainHeader),
            MessageClass::Metadata => None,
        }
    }
}

/// Data-bin families, the partition key of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabinClass {
    MainHeader,
    TileHeader,
    Precinct,
    TilePart,
}

/// The stream type negotiated with the server: precinct-oriented (JPP) or
/// tile-part-oriented (JPT). Each forbids the other's data classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Jpp,
    Jpt,
}

impl StreamType {
    fn allows(&self, class: MessageClass) -> bool {
        match class {
            MessageClass::PrecinctNoAux | MessageClass::PrecinctWithAux => *self == StreamType::Jpp,
            MessageClass::TileNoAux | MessageClass::TileWithAux => *self == StreamType::Jpt,
            MessageClass::TileHeader | MessageClass::MainHeader | MessageClass::Metadata => true,
        }
    }
}

/// One already-parsed JPIP message header (Annex A.2). The VBAS decoding
/// itself is the transport's job.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub class: MessageClass,
    pub in_class_id: u64,

    /// Offset of this message's body from the start of the data-bin.
    pub message_offset: usize,

    pub message_body_length: usize,

    /// Set when this message carries the final byte of the data-bin, which
    /// fixes the bin's total length.
    pub is_last_byte_in_databin: bool,

    /// Auxiliary field of the `*WithAux` classes; for precinct data-bins it
    /// advertises the number of complete quality layers in the bin.
    pub aux: Option<u32>,
}

/// Owner of every data-bin of a session, partitioned by class.
///
/// Bins are created lazily on first reference or first arrival and bytes are
/// only ever added for the life of the session; a bin nobody listens to can
/// be evicted to bound memory.
pub struct DatabinStore {
    stream_type: StreamType,
    databins: HashMap<(DatabinClass, u64), Databin>,
    next_listener_id: ListenerId,

    loaded_bytes: usize,
    loaded_bytes_in_listened: usize,
}

impl DatabinStore {
    pub fn new(stream_type: StreamType) -> Self {
        DatabinStore {
            stream_type,
            databins: HashMap::new(),
            next_listener_id: 1,
            loaded_bytes: 0,
            loaded_bytes_in_listened: 0,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn databin(&self, class: DatabinClass, in_class_id: u64) -> Option<&Databin> {
        self.databins.get(&(class, in_class_id))
    }

    /// Returns the bin, creating an empty one on first reference.
    pub fn databin_mut(&mut self, class: DatabinClass, in_class_id: u64) -> &mut Databin {
        self.databins
            .entry((class, in_class_id))
            .or_insert_with(|| Databin::new(class, in_class_id))
    }

    pub fn main_header(&self) -> Option<&Databin> {
        self.databin(DatabinClass::MainHeader, 0)
    }

    /// Total bytes buffered across every data-bin. Overlapping message
    /// ranges are counted once.
    pub fn loaded_bytes(&self) -> usize {
        self.loaded_bytes
    }

    /// Bytes buffered in bins that currently have at least one listener.
    pub fn loaded_bytes_in_listened(&self) -> usize {
        self.loaded_bytes_in_listened
    }

    /// Applies one incoming message.
    ///
    /// The byte range is merged into the target bin's extents, the total
    /// length is fixed when the last-byte flag is set, global counters are
    /// updated and every listener of the bin is notified. Metadata-bin
    /// messages are accepted and dropped.
    pub fn save_data(&mut self, header: &MessageHeader, raw: &[u8]) -> Result<(), JpipError> {
        if header.message_body_length != raw.len() {
            return Err(JpipError::MessageBodyLengthMismatch {
                expected: header.message_body_length,
                actual: raw.len(),
            });
        }
        if !self.stream_type.allows(header.class) {
            return Err(JpipError::ClassNotAllowed {
                class: header.class,
                stream_type: self.stream_type,
            });
        }
        let class = match header.class.databin_class() {
            Some(class) => class,
            None => {
                debug!(
                    "ignoring metadata-bin message, {} bytes at offset {}",
                    raw.len(),
                    header.message_offset
                );
                return Ok(());
            }
        };
        if class == DatabinClass::MainHeader && header.in_class_id != 0 {
            return Err(JpipError::MainHeaderInClassId {
                in_class_id: header.in_class_id,
            });
        }

        let key = (class, header.in_class_id);
        let (added, listened, listeners) = {
            let databin = self
                .databins
                .entry(key)
                .or_insert_with(|| Databin::new(class, header.in_class_id));
            let added = databin.save(
                header.message_offset,
                raw,
                header.is_last_byte_in_databin,
            )?;
            if let Some(aux) = header.aux {
                databin.set_aux(aux);
            }
            (added, databin.has_listeners(), databin.listeners())
        };

        self.loaded_bytes += added;
        if listened {
            self.loaded_bytes_in_listened += added;
        }
        debug!(
            "saved {} new bytes into {:?} data-bin {} ({} total in session)",
            added, class, header.in_class_id, self.loaded_bytes
        );

        if added > 0 || header.is_last_byte_in_databin {
            let databin = self.databins.get(&key).unwrap();
            for listener in &listeners {
                listener.data_arrived(databin);
            }
        }

        Ok(())
    }

    /// Registers an arrival listener on a bin, creating the bin if needed.
    /// The returned id is stable for the life of the registration.
    pub fn add_listener(
        &mut self,
        class: DatabinClass,
        in_class_id: u64,
        listener: Rc<dyn DataArrivedListener>,
    ) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        let (first, loaded) = {
            let databin = self.databin_mut(class, in_class_id);
            let first = !databin.has_listeners();
            databin.add_listener(id, listener);
            (first, databin.get_loaded_bytes())
        };
        if first {
            self.loaded_bytes_in_listened += loaded;
        }
        id
    }

    /// Removes a listener registration; a no-op for an unknown id.
    pub fn remove_listener(&mut self, class: DatabinClass, in_class_id: u64, id: ListenerId) {
        let mut unlistened = 0;
        if let Some(databin) = self.databins.get_mut(&(class, in_class_id)) {
            if databin.remove_listener(id) && !databin.has_listeners() {
                unlistened = databin.get_loaded_bytes();
            }
        }
        self.loaded_bytes_in_listened -= unlistened;
    }

    /// Evicts every bin without listeners, except the main header, and
    /// returns the number of bytes reclaimed.
    pub fn cleanup_unlistened(&mut self) -> usize {
        let mut reclaimed = 0;
        self.databins.retain(|(class, _), databin| {
            let keep = *class == DatabinClass::MainHeader || databin.has_listeners();
            if !keep {
                reclaimed += databin.get_loaded_bytes();
            }
            keep
        });
        self.loaded_bytes -= reclaimed;
        if reclaimed > 0 {
            info!("evicted {} unlistened data-bin bytes", reclaimed);
        }
        reclaimed
    }
}
