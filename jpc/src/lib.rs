//! JPEG 2000 codestream side of the JPIP client engine.
//!
//! Everything here works against partially received data-bins: the
//! transactional `BitstreamReader` and `TagTree` consume only bytes that have
//! actually arrived, the `PacketHeaderParser` decodes Annex B packet headers
//! one quality layer at a time, the `QualityWaiter` aggregates per-precinct
//! progress across a requested region, and the `CodestreamReconstructor`
//! materializes a standards-valid codestream from whatever is buffered.
//!
//! A read that needs a byte the transport has not delivered yet fails with
//! `CodestreamError::InsufficientData`; that is the expected, frequent,
//! non-fatal outcome and simply means "retry after the next arrival".

use std::error;
use std::fmt;

mod bitstream;
mod packet;
mod progressive;
mod reconstruct;
mod structure;
mod tag_tree;

pub use bitstream::{BitstreamPosition, BitstreamReader, Transaction, TransactionalCell};
pub use packet::{
    CodeblockContribution, PacketHeaderParser, ParsedPacket, ParsedSubbandPacket, PrecinctArena,
    QualityLayerOffset, QualityLayerOffsetCache, SharedPrecinctArena,
};
pub use progressive::{
    ProgressivenessQuality, ProgressivenessStage, QualityCallback, QualityReport, QualityWaiter,
};
pub use reconstruct::CodestreamReconstructor;
pub use structure::{
    CodestreamPartParams, CodestreamStructure, CodestreamStructureParams, PixelRegion,
    PrecinctGeometry, PrecinctReference, SubbandGeometry, PROGRESSION_ORDER_RPCL,
};
pub use tag_tree::TagTree;

pub type MarkerSymbol = [u8; 2];

// Delimiting markers and marker segments
pub const MARKER_SYMBOL_SOC: MarkerSymbol = [255, 79]; // Start of codestream
pub const MARKER_SYMBOL_SOT: MarkerSymbol = [255, 144]; // Start of tile-part
pub const MARKER_SYMBOL_SOD: MarkerSymbol = [255, 147]; // Start of data
pub const MARKER_SYMBOL_EOC: MarkerSymbol = [255, 217]; // End of codestream

// Fixed information marker segments
pub const MARKER_SYMBOL_SIZ: MarkerSymbol = [255, 81]; // Image and tile size

// Functional marker segments
pub const MARKER_SYMBOL_COD: MarkerSymbol = [255, 82]; // Coding style default
pub const MARKER_SYMBOL_COC: MarkerSymbol = [255, 83]; // Coding style component
pub const MARKER_SYMBOL_QCD: MarkerSymbol = [255, 92]; // Quantization default
pub const MARKER_SYMBOL_QCC: MarkerSymbol = [255, 93]; // Quantization component
pub const MARKER_SYMBOL_POC: MarkerSymbol = [255, 95]; // Progression order change

// Pointer marker segments
pub const MARKER_SYMBOL_PPM: MarkerSymbol = [255, 96]; // Packed packet headers, main header
pub const MARKER_SYMBOL_PPT: MarkerSymbol = [255, 97]; // Packed packet headers, tile-part header

// In bit stream markers and marker segments
pub const MARKER_SYMBOL_SOP: MarkerSymbol = [255, 145]; // Start of packet
pub const MARKER_SYMBOL_EPH: MarkerSymbol = [255, 146]; // End of packet header

// Informational marker segments
pub const MARKER_SYMBOL_COM: MarkerSymbol = [255, 100]; // Comment

/// Error values returned from codestream functions.
#[derive(Debug)]
pub enum CodestreamError {
    /// A read needed a byte that has not arrived yet. Expected and
    /// non-fatal; abort the surrounding transaction and retry after the
    /// next arrival.
    InsufficientData,

    /// B.10.1 forbids a one bit in the most significant position of the
    /// byte following an 0xFF inside a packet header.
    BitStuffingViolation { byte_offset: usize },

    MarkerMissing {
        marker: MarkerSymbol,
        byte_offset: usize,
    },

    MarkerUnexpected {
        marker: MarkerSymbol,
        byte_offset: usize,
    },

    /// A marker segment's declared length is inconsistent with the header
    /// that contains it.
    MarkerSegmentTooShort {
        marker: MarkerSymbol,
        length: u16,
    },

    InvalidQuantizationStyle { value: u8 },

    /// The run of one bits before a code-block length field grew past any
    /// value a valid codestream can encode.
    InvalidCodeblockLengthField { quality_layer: u16 },

    /// A transaction was started while another one is still active, a
    /// commit/abort had no transaction, or a read ran outside one. A bug in
    /// the caller, not a data problem.
    TransactionMisuse { reason: &'static str },

    /// More quality layers were requested than the codestream declares.
    NoSuchQualityLayer { layer: u16, total: u16 },

    /// Packet headers moved out of band by PPM/PPT are permanently
    /// unsupported: packet boundaries are only discoverable by parsing.
    PackedPacketHeadersNotSupported { marker: MarkerSymbol },

    UnsupportedProgressionOrder { value: u8 },

    UnsupportedComponentScale {
        component: u16,
        horizontal: u8,
        vertical: u8,
    },

    /// COC/QCC per-component coding overrides are not supported.
    UnsupportedComponentOverride { marker: MarkerSymbol },

    StructureInvalid { reason: String },
}

impl CodestreamError {
    /// True for the retry-later sentinel, false for every real error.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, CodestreamError::InsufficientData)
    }
}

impl error::Error for CodestreamError {}
impl fmt::Display for CodestreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InsufficientData => {
                write!(f, "needed bytes have not arrived yet")
            }
            Self::BitStuffingViolation { byte_offset } => {
                write!(
                    f,
                    "bit-stuffing violation at byte offset {}: byte after 0xFF has its high bit set",
                    byte_offset
                )
            }
            Self::MarkerMissing {
                marker,
                byte_offset,
            } => {
                write!(
                    f,
                    "missing marker 0x{:0>2X?}{:0>2X?} at byte offset {}",
                    marker[0], marker[1], byte_offset
                )
            }
            Self::MarkerUnexpected {
                marker,
                byte_offset,
            } => {
                write!(
                    f,
                    "unexpected marker 0x{:0>2X?}{:0>2X?} at byte offset {}",
                    marker[0], marker[1], byte_offset
                )
            }
            Self::MarkerSegmentTooShort { marker, length } => {
                write!(
                    f,
                    "marker segment 0x{:0>2X?}{:0>2X?} declares impossible length {}",
                    marker[0], marker[1], length
                )
            }
            Self::InvalidQuantizationStyle { value } => {
                write!(f, "invalid quantization style 0x{:0>2X?}", value)
            }
            Self::InvalidCodeblockLengthField { quality_layer } => {
                write!(
                    f,
                    "code-block length field overflow in quality layer {}",
                    quality_layer
                )
            }
            Self::TransactionMisuse { reason } => {
                write!(f, "bitstream transaction misuse: {}", reason)
            }
            Self::NoSuchQualityLayer { layer, total } => {
                write!(
                    f,
                    "quality layer {} requested of a precinct with {} layers",
                    layer, total
                )
            }
            Self::PackedPacketHeadersNotSupported { marker } => {
                write!(
                    f,
                    "packed packet headers (0x{:0>2X?}{:0>2X?}) are not supported",
                    marker[0], marker[1]
                )
            }
            Self::UnsupportedProgressionOrder { value } => {
                write!(
                    f,
                    "progression order {} is not supported, only RPCL",
                    value
                )
            }
            Self::UnsupportedComponentScale {
                component,
                horizontal,
                vertical,
            } => {
                write!(
                    f,
                    "component {} sub-sampled {}x{}; only unit scale is supported",
                    component, horizontal, vertical
                )
            }
            Self::UnsupportedComponentOverride { marker } => {
                write!(
                    f,
                    "per-component override 0x{:0>2X?}{:0>2X?} is not supported",
                    marker[0], marker[1]
                )
            }
            Self::StructureInvalid { reason } => {
                write!(f, "invalid codestream structure: {}", reason)
            }
        }
    }
}
