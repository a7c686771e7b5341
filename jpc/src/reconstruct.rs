//! Reassembly of a decodable codestream from buffered data-bins.
//!
//! The JPIP transport splits a codestream into header and precinct data-bins;
//! a stock decoder wants one contiguous codestream back. Reconstruction
//! copies the main header, re-emits each tile of the part as a single
//! tile-part, and concatenates each precinct's packets through the requested
//! quality, padding declared-but-absent layers with empty packets so the
//! packet count always matches the COD declaration.
//!
//! Header marker segments are patched on the way through: image and tile
//! sizes shrink to the part's resolution, dropped decomposition levels
//! disappear from COD and QCD, and the progression the packets are emitted
//! in (RPCL) is written into COD.
//!
//! Emission runs twice through a sink abstraction: a counting pass sizes the
//! output, a second pass fills a buffer allocated to exactly that size.

use crate::packet::SharedPrecinctArena;
use crate::structure::{CodestreamPartParams, CodestreamStructure};
use crate::{
    CodestreamError, MARKER_SYMBOL_COC, MARKER_SYMBOL_COD, MARKER_SYMBOL_COM, MARKER_SYMBOL_EOC,
    MARKER_SYMBOL_EPH, MARKER_SYMBOL_POC, MARKER_SYMBOL_PPM, MARKER_SYMBOL_PPT, MARKER_SYMBOL_QCC,
    MARKER_SYMBOL_QCD, MARKER_SYMBOL_SIZ, MARKER_SYMBOL_SOC, MARKER_SYMBOL_SOD, MARKER_SYMBOL_SOT,
};
use crate::structure::PROGRESSION_ORDER_RPCL;
use jpip::{CopyBytesOptions, Databin, DatabinClass, DatabinStore};
use log::debug;
use std::rc::Rc;

const VENDOR_COMMENT: &[u8] = b"reassembled from jpip data-bins";

/// Output target of one reconstruction pass.
trait ReconstructionSink {
    fn write(&mut self, bytes: &[u8]);
    fn write_zeros(&mut self, count: usize);
    fn position(&self) -> usize;
    /// Overwrites already-written bytes, for back-patching Psot.
    fn patch(&mut self, at: usize, bytes: &[u8]);
}

/// First pass: counts bytes without storing them.
struct LengthTally {
    length: usize,
}

impl ReconstructionSink for LengthTally {
    fn write(&mut self, bytes: &[u8]) {
        self.length += bytes.len();
    }

    fn write_zeros(&mut self, count: usize) {
        self.length += count;
    }

    fn position(&self) -> usize {
        self.length
    }

    fn patch(&mut self, _at: usize, _bytes: &[u8]) {}
}

/// Second pass: materializes the codestream.
struct BufferSink {
    buffer: Vec<u8>,
}

impl ReconstructionSink for BufferSink {
    fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }

    fn position(&self) -> usize {
        self.buffer.len()
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        self.buffer[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

pub struct CodestreamReconstructor {
    structure: Rc<CodestreamStructure>,
    arena: SharedPrecinctArena,
}

impl CodestreamReconstructor {
    pub fn new(structure: Rc<CodestreamStructure>, arena: SharedPrecinctArena) -> Self {
        CodestreamReconstructor { structure, arena }
    }

    /// Builds a codestream of the part carrying every fully buffered quality
    /// layer up to `max_quality_layers` (all declared layers when `None`).
    ///
    /// Reports `Ok(None)` when some precinct of the part has fewer than
    /// `min_quality_layers` full layers buffered, or a needed header bin has
    /// not fully arrived; call again after more data.
    pub fn create_codestream(
        &self,
        store: &DatabinStore,
        part: &CodestreamPartParams,
        min_quality_layers: u16,
        max_quality_layers: Option<u16>,
    ) -> Result<Option<Vec<u8>>, CodestreamError> {
        self.create(store, part, min_quality_layers, max_quality_layers, false)
    }

    /// Builds a codestream with the full header structure but no packet
    /// data, enough for a decoder to learn the image geometry.
    pub fn create_headers_codestream(
        &self,
        store: &DatabinStore,
        part: &CodestreamPartParams,
    ) -> Result<Option<Vec<u8>>, CodestreamError> {
        self.create(store, part, 0, Some(0), true)
    }

    fn create(
        &self,
        store: &DatabinStore,
        part: &CodestreamPartParams,
        min_quality_layers: u16,
        max_quality_layers: Option<u16>,
        headers_only: bool,
    ) -> Result<Option<Vec<u8>>, CodestreamError> {
        let declared = self.structure.num_quality_layers();
        let max_target = max_quality_layers.unwrap_or(declared).min(declared);
        let min_target = min_quality_layers.min(max_target);

        let mut tally = LengthTally { length: 0 };
        if !self.emit(&mut tally, store, part, min_target, max_target, headers_only)? {
            return Ok(None);
        }

        let mut sink = BufferSink {
            buffer: Vec::with_capacity(tally.length),
        };
        let complete = self.emit(&mut sink, store, part, min_target, max_target, headers_only)?;
        debug_assert!(complete, "store changed between reconstruction passes");
        debug_assert_eq!(sink.buffer.len(), tally.length);
        debug!(
            "reconstructed codestream: {} bytes, layers {}..={}",
            sink.buffer.len(),
            min_target,
            max_target
        );
        Ok(Some(sink.buffer))
    }

    /// One emission pass. `Ok(false)` means some needed bytes are still
    /// missing and nothing useful was produced.
    fn emit<S: ReconstructionSink>(
        &self,
        sink: &mut S,
        store: &DatabinStore,
        part: &CodestreamPartParams,
        min_target: u16,
        max_target: u16,
        headers_only: bool,
    ) -> Result<bool, CodestreamError> {
        let main_header = match store.main_header() {
            Some(databin) if databin.is_all_databin_loaded() => databin,
            _ => return Ok(false),
        };
        let raw_main = match copy_whole_databin(main_header) {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let patched_main = self.patch_segments(&raw_main, part, true)?;
        sink.write(&patched_main);

        for (part_tile_index, tile_index) in self.structure.tiles_in_part(part).iter().enumerate()
        {
            if !self.emit_tile(
                sink,
                store,
                part,
                *tile_index,
                part_tile_index as u16,
                min_target,
                max_target,
                headers_only,
            )? {
                return Ok(false);
            }
        }

        sink.write(&MARKER_SYMBOL_EOC);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_tile<S: ReconstructionSink>(
        &self,
        sink: &mut S,
        store: &DatabinStore,
        part: &CodestreamPartParams,
        tile_index: u32,
        part_tile_index: u16,
        min_target: u16,
        max_target: u16,
        headers_only: bool,
    ) -> Result<bool, CodestreamError> {
        let tile_header = match store.databin(DatabinClass::TileHeader, u64::from(tile_index)) {
            Some(databin) if databin.is_all_databin_loaded() => databin,
            _ => return Ok(false),
        };
        let raw_tile_header = match copy_whole_databin(tile_header) {
            Some(raw) => raw,
            None => return Ok(false),
        };
        let patched_tile_header = self.patch_segments(&raw_tile_header, part, false)?;

        // A.4.2 - one tile-part per tile, Psot back-patched once the tile's
        // packet bytes are known.
        let sot_start = sink.position();
        sink.write(&MARKER_SYMBOL_SOT);
        sink.write(&10u16.to_be_bytes());
        sink.write(&part_tile_index.to_be_bytes());
        sink.write(&0u32.to_be_bytes());
        sink.write(&[0, 1]);
        sink.write(&patched_tile_header);
        sink.write(&MARKER_SYMBOL_SOD);

        if !headers_only && !self.emit_tile_packets(sink, store, part, tile_index, min_target, max_target)? {
            return Ok(false);
        }

        let tile_part_length = (sink.position() - sot_start) as u32;
        sink.patch(sot_start + 6, &tile_part_length.to_be_bytes());
        Ok(true)
    }

    /// Writes the packets of every precinct of the tile in RPCL order. In
    /// that order the layers of one precinct are consecutive, so each
    /// precinct's contribution is one block copy from its data-bin followed
    /// by empty-packet padding for the layers not carried.
    fn emit_tile_packets<S: ReconstructionSink>(
        &self,
        sink: &mut S,
        store: &DatabinStore,
        part: &CodestreamPartParams,
        tile_index: u32,
        min_target: u16,
        max_target: u16,
    ) -> Result<bool, CodestreamError> {
        let declared = self.structure.num_quality_layers();
        let uses_eph = self.structure.params().uses_end_of_packet_header;
        let mut arena = self.arena.borrow_mut();

        for reference in self.structure.tile_packet_precincts(tile_index, part) {
            let databin = store.databin(DatabinClass::Precinct, reference.in_class_id);

            let (full_layers, end_offset, own_max_reached) = match databin {
                None => (0, 0, false),
                Some(databin) => {
                    let structure = self.structure.clone();
                    let cache = arena.cache_for(reference.in_class_id, || {
                        structure.precinct_geometry(&reference)
                    });
                    let offset =
                        cache.calculate_end_offset_of_last_full_packet(databin, max_target)?;
                    let own_layer_cap = match databin.aux() {
                        Some(aux) => aux.min(u32::from(declared)) as u16,
                        None => declared,
                    };
                    let own_max = offset.num_full_quality_layers >= own_layer_cap
                        || databin.is_all_databin_loaded();
                    (offset.num_full_quality_layers, offset.end_offset, own_max)
                }
            };

            if full_layers < min_target && !own_max_reached {
                return Ok(false);
            }

            if end_offset > 0 {
                let databin = databin.expect("buffered bytes without a data-bin");
                databin.for_each_loaded_range(0, end_offset, &mut |_, slice| sink.write(slice));
            }

            // B.10.3 - an empty packet is a single zero byte, followed by
            // the EPH marker when the coding style declares one.
            for _ in full_layers..declared {
                sink.write_zeros(1);
                if uses_eph {
                    sink.write(&MARKER_SYMBOL_EPH);
                }
            }
        }
        Ok(true)
    }

    /// Copies marker segments, rewriting the ones the part geometry
    /// invalidates. `in_main_header` gates the SOC prefix, the SIZ patch and
    /// the trailing vendor comment.
    fn patch_segments(
        &self,
        raw: &[u8],
        part: &CodestreamPartParams,
        in_main_header: bool,
    ) -> Result<Vec<u8>, CodestreamError> {
        let mut out = Vec::with_capacity(raw.len() + VENDOR_COMMENT.len() + 8);
        let mut pos = 0usize;
        if in_main_header {
            if raw.len() < 2 || raw[0..2] != MARKER_SYMBOL_SOC {
                return Err(CodestreamError::MarkerMissing {
                    marker: MARKER_SYMBOL_SOC,
                    byte_offset: 0,
                });
            }
            out.extend_from_slice(&MARKER_SYMBOL_SOC);
            pos = 2;
        }

        while pos < raw.len() {
            if raw.len() - pos < 4 || raw[pos] != 0xFF {
                return Err(CodestreamError::StructureInvalid {
                    reason: format!("malformed marker segment at header offset {}", pos),
                });
            }
            let marker = [raw[pos], raw[pos + 1]];
            let length = u16::from_be_bytes([raw[pos + 2], raw[pos + 3]]);
            let segment_end = pos + 2 + length as usize;
            if length < 2 || segment_end > raw.len() {
                return Err(CodestreamError::MarkerSegmentTooShort { marker, length });
            }
            let segment = &raw[pos..segment_end];

            if marker == MARKER_SYMBOL_SIZ && in_main_header {
                out.extend_from_slice(&self.patch_siz(segment, part)?);
            } else if marker == MARKER_SYMBOL_COD {
                out.extend_from_slice(&self.patch_cod(segment, part)?);
            } else if marker == MARKER_SYMBOL_QCD {
                out.extend_from_slice(&self.patch_qcd(segment, part)?);
            } else if marker == MARKER_SYMBOL_COC || marker == MARKER_SYMBOL_QCC {
                return Err(CodestreamError::UnsupportedComponentOverride { marker });
            } else if marker == MARKER_SYMBOL_PPM || marker == MARKER_SYMBOL_PPT {
                return Err(CodestreamError::PackedPacketHeadersNotSupported { marker });
            } else if marker == MARKER_SYMBOL_POC
                || marker == MARKER_SYMBOL_SOT
                || marker == MARKER_SYMBOL_SOD
                || marker == MARKER_SYMBOL_EOC
            {
                return Err(CodestreamError::MarkerUnexpected {
                    marker,
                    byte_offset: pos,
                });
            } else {
                out.extend_from_slice(segment);
            }
            pos = segment_end;
        }

        if in_main_header {
            self.append_vendor_comment(&mut out);
        }
        Ok(out)
    }

    /// A.5.1 - SIZ carries the reference grid and tile sizes; the part sees
    /// a zero-origin grid of its own tiles at its own resolution.
    fn patch_siz(
        &self,
        segment: &[u8],
        part: &CodestreamPartParams,
    ) -> Result<Vec<u8>, CodestreamError> {
        if segment.len() < 40 {
            return Err(CodestreamError::MarkerSegmentTooShort {
                marker: MARKER_SYMBOL_SIZ,
                length: (segment.len() as u16).saturating_sub(2),
            });
        }
        let mut out = segment.to_vec();
        let (image_width, image_height) = self.structure.part_image_dimensions(part);
        let (tile_width, tile_height) = self.structure.part_tile_dimensions(part);
        out[6..10].copy_from_slice(&image_width.to_be_bytes());
        out[10..14].copy_from_slice(&image_height.to_be_bytes());
        out[14..18].copy_from_slice(&0u32.to_be_bytes());
        out[18..22].copy_from_slice(&0u32.to_be_bytes());
        out[22..26].copy_from_slice(&tile_width.to_be_bytes());
        out[26..30].copy_from_slice(&tile_height.to_be_bytes());
        out[30..34].copy_from_slice(&0u32.to_be_bytes());
        out[34..38].copy_from_slice(&0u32.to_be_bytes());
        Ok(out)
    }

    /// A.6.1 - drops the cut decomposition levels from SPcod and writes the
    /// emitted progression order.
    fn patch_cod(
        &self,
        segment: &[u8],
        part: &CodestreamPartParams,
    ) -> Result<Vec<u8>, CodestreamError> {
        if segment.len() < 14 {
            return Err(CodestreamError::MarkerSegmentTooShort {
                marker: MARKER_SYMBOL_COD,
                length: (segment.len() as u16).saturating_sub(2),
            });
        }
        let cut = part.num_resolution_levels_cut as usize;
        let mut out = segment.to_vec();
        let coding_style = out[4];
        let levels = out[9] as usize;
        if levels < cut {
            return Err(CodestreamError::StructureInvalid {
                reason: format!("cannot cut {} of {} decomposition levels", cut, levels),
            });
        }
        out[5] = PROGRESSION_ORDER_RPCL;
        out[9] = (levels - cut) as u8;

        if coding_style & 0x01 != 0 {
            if segment.len() < 14 + levels + 1 {
                return Err(CodestreamError::MarkerSegmentTooShort {
                    marker: MARKER_SYMBOL_COD,
                    length: (segment.len() as u16).saturating_sub(2),
                });
            }
            // Precinct size bytes run lowest resolution first; the cut
            // levels are the trailing ones.
            out.truncate(out.len() - cut);
            let new_length = (out.len() - 2) as u16;
            out[2..4].copy_from_slice(&new_length.to_be_bytes());
        }
        Ok(out)
    }

    /// A.6.4 - quantization parameters are per subband; the cut levels each
    /// take three subbands away from the end.
    fn patch_qcd(
        &self,
        segment: &[u8],
        part: &CodestreamPartParams,
    ) -> Result<Vec<u8>, CodestreamError> {
        if segment.len() < 5 {
            return Err(CodestreamError::MarkerSegmentTooShort {
                marker: MARKER_SYMBOL_QCD,
                length: (segment.len() as u16).saturating_sub(2),
            });
        }
        let cut = part.num_resolution_levels_cut as usize;
        let mut out = segment.to_vec();
        let style = out[4] & 0x1F;
        let removed_bytes = match style {
            // No quantization: one byte per subband.
            0 => 3 * cut,
            // Scalar derived: a single value independent of the level count.
            1 => 0,
            // Scalar expounded: two bytes per subband.
            2 => 6 * cut,
            value => return Err(CodestreamError::InvalidQuantizationStyle { value }),
        };
        if removed_bytes > 0 {
            if out.len() < 5 + removed_bytes {
                return Err(CodestreamError::MarkerSegmentTooShort {
                    marker: MARKER_SYMBOL_QCD,
                    length: (segment.len() as u16).saturating_sub(2),
                });
            }
            out.truncate(out.len() - removed_bytes);
            let new_length = (out.len() - 2) as u16;
            out[2..4].copy_from_slice(&new_length.to_be_bytes());
        }
        Ok(out)
    }

    fn append_vendor_comment(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MARKER_SYMBOL_COM);
        let length = (2 + 2 + VENDOR_COMMENT.len()) as u16;
        out.extend_from_slice(&length.to_be_bytes());
        // Rcom 1: latin-1 text.
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(VENDOR_COMMENT);
    }
}

fn copy_whole_databin(databin: &Databin) -> Option<Vec<u8>> {
    let mut raw = Vec::new();
    let options = CopyBytesOptions {
        databin_start_offset: 0,
        max_length_to_copy: None,
        force_copy_all_range: true,
    };
    databin.copy_bytes(&mut raw, 0, &options)?;
    Some(raw)
}
