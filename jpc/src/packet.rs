//! B.10 - packet header decoding over a precinct data-bin.
//!
//! A precinct's data-bin holds its packets for quality layers 0..L back to
//! back. Packet boundaries are not recorded anywhere; the only way to find
//! where layer q ends is to decode every packet header up to q and add up the
//! declared code-block body lengths. The parser here does exactly that and
//! nothing else: it never touches packet bodies, only their lengths.
//!
//! Parsing is resumable. Each attempt runs inside one reader transaction;
//! when a needed byte is missing the attempt aborts with `InsufficientData`
//! and a later attempt restarts the same packet from the last committed
//! position. Tag tree nodes roll back through the shared transaction token,
//! per-code-block durable state is staged on a scratch copy applied only on
//! commit.

use crate::bitstream::BitstreamReader;
use crate::structure::PrecinctGeometry;
use crate::tag_tree::TagTree;
use crate::{CodestreamError, MARKER_SYMBOL_EPH, MARKER_SYMBOL_SOP};
use jpip::Databin;
use log::trace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const START_OF_PACKET_SEGMENT_LENGTH: usize = 6;

/// What one code-block contributes to one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeblockContribution {
    pub body_length_bytes: usize,
    pub coding_passes: u16,
    pub zero_bit_planes: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSubbandPacket {
    /// Row-major, one entry per code-block of the subband's precinct grid.
    pub codeblocks: Vec<CodeblockContribution>,
    pub overall_body_length_bytes: usize,
}

/// One fully decoded packet header and the byte extent of the whole packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub quality_layer: u16,
    /// Offset of the packet's first byte, the SOP segment included when
    /// present.
    pub header_start_offset: usize,
    pub header_length_bytes: usize,
    pub overall_body_length_bytes: usize,
    /// Offset one past the packet's last body byte.
    pub end_offset: usize,
    pub subbands: Vec<ParsedSubbandPacket>,
}

/// Durable per-code-block decoding state carried across quality layers.
#[derive(Debug, Clone, Copy)]
struct CodeblockState {
    included_in_earlier_layer: bool,
    /// B.10.7.1 - current code-block length indicator, starts at 3.
    lblock: u8,
    zero_bit_planes: u16,
}

struct SubbandState {
    codeblocks_x: usize,
    codeblocks_y: usize,
    /// `None` for an empty subband, which contributes no header bits.
    inclusion_tree: Option<TagTree>,
    zero_bit_planes_tree: Option<TagTree>,
    codeblocks: Vec<CodeblockState>,
}

impl SubbandState {
    fn new(codeblocks_x: usize, codeblocks_y: usize) -> Self {
        let count = codeblocks_x * codeblocks_y;
        let trees = if count > 0 {
            (
                Some(TagTree::new(codeblocks_x, codeblocks_y)),
                Some(TagTree::new(codeblocks_x, codeblocks_y)),
            )
        } else {
            (None, None)
        };
        SubbandState {
            codeblocks_x,
            codeblocks_y,
            inclusion_tree: trees.0,
            zero_bit_planes_tree: trees.1,
            codeblocks: vec![
                CodeblockState {
                    included_in_earlier_layer: false,
                    lblock: 3,
                    zero_bit_planes: 0,
                };
                count
            ],
        }
    }
}

/// Incremental packet header parser for one precinct.
pub struct PacketHeaderParser {
    geometry: PrecinctGeometry,
    reader: BitstreamReader,
    subbands: Vec<SubbandState>,
    packets: Vec<ParsedPacket>,
}

impl PacketHeaderParser {
    pub fn new(geometry: PrecinctGeometry) -> Self {
        let subbands = geometry
            .subbands
            .iter()
            .map(|subband| SubbandState::new(subband.codeblocks_x, subband.codeblocks_y))
            .collect();
        PacketHeaderParser {
            geometry,
            reader: BitstreamReader::new(0),
            subbands,
            packets: Vec::new(),
        }
    }

    pub fn max_quality_layers(&self) -> u16 {
        self.geometry.num_quality_layers
    }

    pub fn num_parsed_packets(&self) -> u16 {
        self.packets.len() as u16
    }

    pub fn packets(&self) -> &[ParsedPacket] {
        &self.packets
    }

    /// Decodes the header of the next unparsed quality layer.
    ///
    /// On `InsufficientData` no state changes; call again once more of the
    /// data-bin has arrived.
    pub fn parse_next_packet(&mut self, databin: &Databin) -> Result<&ParsedPacket, CodestreamError> {
        let layer = self.packets.len() as u16;
        if layer >= self.geometry.num_quality_layers {
            return Err(CodestreamError::NoSuchQualityLayer {
                layer,
                total: self.geometry.num_quality_layers,
            });
        }

        self.reader.start_transaction()?;
        let mut scratch: Vec<Vec<CodeblockState>> = self
            .subbands
            .iter()
            .map(|subband| subband.codeblocks.clone())
            .collect();
        match self.parse_attempt(databin, layer, &mut scratch) {
            Ok(packet) => {
                self.reader.commit()?;
                for (subband, staged) in self.subbands.iter_mut().zip(scratch) {
                    subband.codeblocks = staged;
                }
                trace!(
                    "precinct {} layer {}: header {} bytes, body {} bytes",
                    databin.in_class_id(),
                    layer,
                    packet.header_length_bytes,
                    packet.overall_body_length_bytes
                );
                self.packets.push(packet);
                Ok(self.packets.last().unwrap())
            }
            Err(err) => {
                self.reader.abort()?;
                Err(err)
            }
        }
    }

    fn parse_attempt(
        &mut self,
        databin: &Databin,
        layer: u16,
        scratch: &mut [Vec<CodeblockState>],
    ) -> Result<ParsedPacket, CodestreamError> {
        let header_start_offset = self.reader.position().byte_offset;
        self.skip_start_of_packet_segment(databin, header_start_offset)?;

        let mut subbands: Vec<ParsedSubbandPacket> = Vec::with_capacity(self.subbands.len());

        // B.10.3 - a zero first bit means an empty packet: no code-block of
        // any subband contributes to this layer.
        if self.reader.shift_bit(databin)? == 0 {
            for subband in &self.subbands {
                subbands.push(ParsedSubbandPacket {
                    codeblocks: subband
                        .codeblocks
                        .iter()
                        .map(|state| CodeblockContribution {
                            body_length_bytes: 0,
                            coding_passes: 0,
                            zero_bit_planes: state.zero_bit_planes,
                        })
                        .collect(),
                    overall_body_length_bytes: 0,
                });
            }
        } else {
            for (subband_index, subband) in self.subbands.iter_mut().enumerate() {
                let staged = &mut scratch[subband_index];
                let mut codeblocks = Vec::with_capacity(staged.len());
                let mut subband_body = 0usize;
                for y in 0..subband.codeblocks_y {
                    for x in 0..subband.codeblocks_x {
                        let index = y * subband.codeblocks_x + x;
                        let contribution = parse_codeblock(
                            &mut self.reader,
                            databin,
                            layer,
                            subband.inclusion_tree.as_mut().unwrap(),
                            subband.zero_bit_planes_tree.as_mut().unwrap(),
                            &mut staged[index],
                            x,
                            y,
                        )?;
                        subband_body += contribution.body_length_bytes;
                        codeblocks.push(contribution);
                    }
                }
                subbands.push(ParsedSubbandPacket {
                    codeblocks,
                    overall_body_length_bytes: subband_body,
                });
            }
        }

        self.reader.shift_remaining_bits_in_byte(databin)?;
        self.skip_end_of_packet_header_segment(databin)?;

        let body_start = self.reader.position().byte_offset;
        let overall_body_length_bytes = subbands
            .iter()
            .map(|subband| subband.overall_body_length_bytes)
            .sum();
        let end_offset = body_start + overall_body_length_bytes;
        // Body bytes are skipped, not read; they need not have arrived.
        self.reader.seek_to_byte(end_offset)?;

        Ok(ParsedPacket {
            quality_layer: layer,
            header_start_offset,
            header_length_bytes: body_start - header_start_offset,
            overall_body_length_bytes,
            end_offset,
            subbands,
        })
    }

    /// Skips a leading SOP marker segment when the coding style allows one
    /// and the bytes say one is there. SOP lives outside the bit-stuffed
    /// header, so it is inspected byte-wise and stepped over with a seek.
    fn skip_start_of_packet_segment(
        &mut self,
        databin: &Databin,
        offset: usize,
    ) -> Result<(), CodestreamError> {
        if !self.geometry.uses_start_of_packet {
            return Ok(());
        }
        let first = databin
            .byte_at(offset)
            .ok_or(CodestreamError::InsufficientData)?;
        if first != MARKER_SYMBOL_SOP[0] {
            return Ok(());
        }
        let second = databin
            .byte_at(offset + 1)
            .ok_or(CodestreamError::InsufficientData)?;
        if second != MARKER_SYMBOL_SOP[1] {
            return Ok(());
        }
        databin
            .byte_at(offset + START_OF_PACKET_SEGMENT_LENGTH - 1)
            .ok_or(CodestreamError::InsufficientData)?;
        self.reader
            .seek_to_byte(offset + START_OF_PACKET_SEGMENT_LENGTH)
    }

    /// B.10.6 - when the coding style declares EPH markers, one terminates
    /// every packet header and its absence is a format error.
    fn skip_end_of_packet_header_segment(
        &mut self,
        databin: &Databin,
    ) -> Result<(), CodestreamError> {
        if !self.geometry.uses_end_of_packet_header {
            return Ok(());
        }
        let offset = self.reader.position().byte_offset;
        let first = databin
            .byte_at(offset)
            .ok_or(CodestreamError::InsufficientData)?;
        let second = databin
            .byte_at(offset + 1)
            .ok_or(CodestreamError::InsufficientData)?;
        if [first, second] != MARKER_SYMBOL_EPH {
            return Err(CodestreamError::MarkerMissing {
                marker: MARKER_SYMBOL_EPH,
                byte_offset: offset,
            });
        }
        self.reader.seek_to_byte(offset + 2)
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_codeblock(
    reader: &mut BitstreamReader,
    databin: &Databin,
    layer: u16,
    inclusion_tree: &mut TagTree,
    zero_bit_planes_tree: &mut TagTree,
    state: &mut CodeblockState,
    x: usize,
    y: usize,
) -> Result<CodeblockContribution, CodestreamError> {
    // B.10.4 - inclusion is a plain bit once the code-block has appeared in
    // an earlier layer, a tag tree query before that.
    let included = if state.included_in_earlier_layer {
        reader.shift_bit(databin)? == 1
    } else {
        inclusion_tree.is_value_less_or_equal(x, y, layer, reader, databin)?
    };
    if !included {
        return Ok(CodeblockContribution {
            body_length_bytes: 0,
            coding_passes: 0,
            zero_bit_planes: state.zero_bit_planes,
        });
    }

    if !state.included_in_earlier_layer {
        // B.10.5 - the number of missing bit planes comes from the second
        // tag tree, fully resolved on first inclusion.
        state.zero_bit_planes = zero_bit_planes_tree.get_value(x, y, reader, databin)?;
        state.included_in_earlier_layer = true;
    }

    let coding_passes = decode_coding_passes(reader, databin)?;

    // B.10.7.1 - Lblock grows by the length of the run of one bits.
    let lblock_increment = reader.count_ones_until_zero(databin, 32)?;
    if lblock_increment >= 32 {
        return Err(CodestreamError::InvalidCodeblockLengthField {
            quality_layer: layer,
        });
    }
    state.lblock += lblock_increment as u8;

    let length_bits = u32::from(state.lblock) + u32::from(floor_log2(coding_passes));
    if length_bits > 32 {
        return Err(CodestreamError::InvalidCodeblockLengthField {
            quality_layer: layer,
        });
    }
    let body_length_bytes = reader.shift_bits(databin, length_bits as u8)? as usize;

    Ok(CodeblockContribution {
        body_length_bytes,
        coding_passes,
        zero_bit_planes: state.zero_bit_planes,
    })
}

/// Table B.4 - number of coding passes, 1 to 164.
fn decode_coding_passes(
    reader: &mut BitstreamReader,
    databin: &Databin,
) -> Result<u16, CodestreamError> {
    if reader.shift_bit(databin)? == 0 {
        return Ok(1);
    }
    if reader.shift_bit(databin)? == 0 {
        return Ok(2);
    }
    let two = reader.shift_bits(databin, 2)? as u16;
    if two != 0b11 {
        return Ok(3 + two);
    }
    let five = reader.shift_bits(databin, 5)? as u16;
    if five != 31 {
        return Ok(6 + five);
    }
    let seven = reader.shift_bits(databin, 7)? as u16;
    Ok(37 + seven)
}

fn floor_log2(value: u16) -> u8 {
    debug_assert!(value > 0);
    (15 - value.leading_zeros()) as u8
}

/// Byte offset of the last quality layer of a precinct that is fully
/// buffered, plus how many layers that is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityLayerOffset {
    pub num_full_quality_layers: u16,
    pub end_offset: usize,
}

/// Memoized per-precinct layer-offset calculator.
///
/// Wraps one `PacketHeaderParser` and answers "through which byte do the
/// first q layers of this precinct extend, and how many of them have fully
/// arrived". Parsed packets are kept, so repeated queries after new arrivals
/// only parse forward.
pub struct QualityLayerOffsetCache {
    parser: PacketHeaderParser,
}

impl QualityLayerOffsetCache {
    pub fn new(geometry: PrecinctGeometry) -> Self {
        QualityLayerOffsetCache {
            parser: PacketHeaderParser::new(geometry),
        }
    }

    pub fn max_quality_layers(&self) -> u16 {
        self.parser.max_quality_layers()
    }

    /// Parses forward to `requested_quality_layers` as far as the buffered
    /// bytes allow and reports the last fully buffered packet boundary.
    pub fn calculate_end_offset_of_last_full_packet(
        &mut self,
        databin: &Databin,
        requested_quality_layers: u16,
    ) -> Result<QualityLayerOffset, CodestreamError> {
        let target = requested_quality_layers.min(self.parser.max_quality_layers());
        while self.parser.num_parsed_packets() < target {
            match self.parser.parse_next_packet(databin) {
                Ok(_) => {}
                Err(err) if err.is_insufficient_data() => break,
                Err(err) => return Err(err),
            }
        }

        let loaded_prefix_end = databin.loaded_prefix_end();
        let mut offset = QualityLayerOffset {
            num_full_quality_layers: 0,
            end_offset: 0,
        };
        for packet in self.parser.packets().iter().take(target as usize) {
            if packet.end_offset > loaded_prefix_end {
                break;
            }
            offset.num_full_quality_layers = packet.quality_layer + 1;
            offset.end_offset = packet.end_offset;
        }
        Ok(offset)
    }

    /// The byte extent of the first `quality_layers` packets, parsing them
    /// now if they have not been parsed yet. Unlike the offset calculation
    /// above this demands the headers to be decodable and fails with
    /// `InsufficientData` otherwise.
    pub fn get_quality_layer_offset(
        &mut self,
        databin: &Databin,
        quality_layers: u16,
    ) -> Result<usize, CodestreamError> {
        if quality_layers > self.parser.max_quality_layers() {
            return Err(CodestreamError::NoSuchQualityLayer {
                layer: quality_layers,
                total: self.parser.max_quality_layers(),
            });
        }
        if quality_layers == 0 {
            return Ok(0);
        }
        while self.parser.num_parsed_packets() < quality_layers {
            self.parser.parse_next_packet(databin)?;
        }
        Ok(self.parser.packets()[quality_layers as usize - 1].end_offset)
    }
}

/// Shared pool of per-precinct caches, keyed by the precinct data-bin's
/// in-class id so every consumer of a precinct reuses the same parsing
/// progress.
pub struct PrecinctArena {
    caches: HashMap<u64, QualityLayerOffsetCache>,
}

pub type SharedPrecinctArena = Rc<RefCell<PrecinctArena>>;

impl PrecinctArena {
    pub fn new() -> Self {
        PrecinctArena {
            caches: HashMap::new(),
        }
    }

    pub fn new_shared() -> SharedPrecinctArena {
        Rc::new(RefCell::new(PrecinctArena::new()))
    }

    /// The cache for one precinct, created from `geometry` on first use.
    pub fn cache_for<F: FnOnce() -> PrecinctGeometry>(
        &mut self,
        in_class_id: u64,
        geometry: F,
    ) -> &mut QualityLayerOffsetCache {
        self.caches
            .entry(in_class_id)
            .or_insert_with(|| QualityLayerOffsetCache::new(geometry()))
    }
}

impl Default for PrecinctArena {
    fn default() -> Self {
        PrecinctArena::new()
    }
}
