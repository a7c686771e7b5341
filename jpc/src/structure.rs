//! Static codestream geometry, consumed but not parsed.
//!
//! A collaborator parses the main-header marker segments once and hands the
//! resulting sizes and counts over as `CodestreamStructureParams`; everything
//! here is derived arithmetic: the tile grid, per-resolution precinct grids,
//! the JPIP in-class numbering of precinct data-bins, per-precinct code-block
//! grids, and the enumeration of tiles/precincts a requested image part
//! touches.
//!
//! The single hard global assumption (RPCL progression, unit component
//! scale, no per-component overrides) is validated here once, at
//! construction, as a precondition rather than per call.

use crate::CodestreamError;

/// A.6.1 - progression order value for Resolution-Position-Component-Layer.
pub const PROGRESSION_ORDER_RPCL: u8 = 2;

/// Samples of margin kept around a requested region when mapping it to lower
/// resolutions, covering the support of the 9-7/5-3 wavelet filters.
const DWT_FILTER_MARGIN: u32 = 4;

/// Main-header facts the engine needs, supplied by the structure parser.
#[derive(Debug, Clone)]
pub struct CodestreamStructureParams {
    pub reference_grid_width: u32,
    pub reference_grid_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub num_components: u16,
    pub num_decomposition_levels: u8,
    pub num_quality_layers: u16,
    pub progression_order: u8,

    /// PPx/PPy exponents per resolution level, lowest first; length is
    /// `num_decomposition_levels + 1`.
    pub precinct_width_exponents: Vec<u8>,
    pub precinct_height_exponents: Vec<u8>,

    pub codeblock_width_exponent: u8,
    pub codeblock_height_exponent: u8,

    pub uses_start_of_packet: bool,
    pub uses_end_of_packet_header: bool,

    /// XRsiz/YRsiz per component; anything but 1 is unsupported.
    pub component_horizontal_separations: Vec<u8>,
    pub component_vertical_separations: Vec<u8>,
}

/// A rectangle in pixels of some resolution level, max-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRegion {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x_exclusive: u32,
    pub max_y_exclusive: u32,
}

/// Descriptor of the image part a consumer is interested in.
#[derive(Debug, Clone)]
pub struct CodestreamPartParams {
    /// Region of interest in pixels at the part's (cut) resolution; `None`
    /// for the whole image.
    pub region: Option<PixelRegion>,

    /// Number of highest resolution levels dropped.
    pub num_resolution_levels_cut: u8,

    /// Component subset to wait for; `None` means all. Reconstruction
    /// always emits every component to preserve standard packet order.
    pub components: Option<Vec<u16>>,
}

impl CodestreamPartParams {
    pub fn whole_image() -> Self {
        CodestreamPartParams {
            region: None,
            num_resolution_levels_cut: 0,
            components: None,
        }
    }
}

/// One precinct of the codestream, identified by position and by its stable
/// JPIP in-class id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecinctReference {
    pub tile_index: u32,
    pub component: u16,
    pub resolution_level: u8,
    pub precinct_x: u32,
    pub precinct_y: u32,
    pub in_class_id: u64,
}

/// Code-block grid of one subband's share of a precinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubbandGeometry {
    pub codeblocks_x: usize,
    pub codeblocks_y: usize,
}

/// Everything the packet-header parser needs to know about one precinct.
#[derive(Debug, Clone)]
pub struct PrecinctGeometry {
    /// One subband at resolution 0 (LL), three (HL, LH, HH) above it.
    pub subbands: Vec<SubbandGeometry>,
    pub num_quality_layers: u16,
    pub uses_start_of_packet: bool,
    pub uses_end_of_packet_header: bool,
}

pub struct CodestreamStructure {
    params: CodestreamStructureParams,
    num_tiles_x: u32,
    num_tiles_y: u32,
}

impl CodestreamStructure {
    pub fn new(params: CodestreamStructureParams) -> Result<Self, CodestreamError> {
        if params.progression_order != PROGRESSION_ORDER_RPCL {
            return Err(CodestreamError::UnsupportedProgressionOrder {
                value: params.progression_order,
            });
        }
        for component in 0..params.num_components as usize {
            let horizontal = *params
                .component_horizontal_separations
                .get(component)
                .unwrap_or(&1);
            let vertical = *params
                .component_vertical_separations
                .get(component)
                .unwrap_or(&1);
            if horizontal != 1 || vertical != 1 {
                return Err(CodestreamError::UnsupportedComponentScale {
                    component: component as u16,
                    horizontal,
                    vertical,
                });
            }
        }
        let resolutions = params.num_decomposition_levels as usize + 1;
        if params.precinct_width_exponents.len() != resolutions
            || params.precinct_height_exponents.len() != resolutions
        {
            return Err(CodestreamError::StructureInvalid {
                reason: format!(
                    "expected {} precinct size exponents, got {}x{}",
                    resolutions,
                    params.precinct_width_exponents.len(),
                    params.precinct_height_exponents.len()
                ),
            });
        }
        // A.6.1 - above resolution 0 one exponent bit is spent on the band
        // halving, so PPx and PPy must be at least 1 there.
        for level in 1..resolutions {
            if params.precinct_width_exponents[level] == 0
                || params.precinct_height_exponents[level] == 0
            {
                return Err(CodestreamError::StructureInvalid {
                    reason: format!(
                        "precinct size exponent is 0 at resolution level {}",
                        level
                    ),
                });
            }
        }
        if params.tile_width == 0
            || params.tile_height == 0
            || params.reference_grid_width == 0
            || params.reference_grid_height == 0
        {
            return Err(CodestreamError::StructureInvalid {
                reason: "zero image or tile dimension".to_string(),
            });
        }
        if params.num_quality_layers == 0 || params.num_components == 0 {
            return Err(CodestreamError::StructureInvalid {
                reason: "zero quality layers or components".to_string(),
            });
        }

        let num_tiles_x = div_ceil(params.reference_grid_width, params.tile_width);
        let num_tiles_y = div_ceil(params.reference_grid_height, params.tile_height);
        Ok(CodestreamStructure {
            params,
            num_tiles_x,
            num_tiles_y,
        })
    }

    pub fn params(&self) -> &CodestreamStructureParams {
        &self.params
    }

    pub fn num_tiles_x(&self) -> u32 {
        self.num_tiles_x
    }

    pub fn num_tiles_y(&self) -> u32 {
        self.num_tiles_y
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tiles_x * self.num_tiles_y
    }

    pub fn num_components(&self) -> u16 {
        self.params.num_components
    }

    pub fn num_quality_layers(&self) -> u16 {
        self.params.num_quality_layers
    }

    pub fn num_resolution_levels(&self) -> u8 {
        self.params.num_decomposition_levels + 1
    }

    /// Divisor that maps reference-grid pixels to resolution `r` pixels.
    fn resolution_scale_log2(&self, resolution_level: u8) -> u8 {
        self.params.num_decomposition_levels - resolution_level
    }

    /// Tile dimensions in reference-grid pixels; edge tiles are clipped.
    pub fn tile_dimensions(&self, tile_index: u32) -> (u32, u32) {
        let tx = tile_index % self.num_tiles_x;
        let ty = tile_index / self.num_tiles_x;
        let width = (self.params.reference_grid_width - tx * self.params.tile_width)
            .min(self.params.tile_width);
        let height = (self.params.reference_grid_height - ty * self.params.tile_height)
            .min(self.params.tile_height);
        (width, height)
    }

    fn tile_dimensions_at(&self, tile_index: u32, resolution_level: u8) -> (u32, u32) {
        let (width, height) = self.tile_dimensions(tile_index);
        let shift = self.resolution_scale_log2(resolution_level) as u32;
        (shift_ceil(width, shift), shift_ceil(height, shift))
    }

    /// Precinct grid of one tile at one resolution level.
    pub fn precinct_counts(&self, tile_index: u32, resolution_level: u8) -> (u32, u32) {
        let (width, height) = self.tile_dimensions_at(tile_index, resolution_level);
        let ppx = self.params.precinct_width_exponents[resolution_level as usize] as u32;
        let ppy = self.params.precinct_height_exponents[resolution_level as usize] as u32;
        (
            shift_ceil(width, ppx).max(1),
            shift_ceil(height, ppy).max(1),
        )
    }

    /// Sequence number of a precinct within its tile-component, counting
    /// resolution-major in raster order.
    fn precinct_sequence_number(
        &self,
        tile_index: u32,
        resolution_level: u8,
        precinct_x: u32,
        precinct_y: u32,
    ) -> u64 {
        let mut sequence: u64 = 0;
        for level in 0..resolution_level {
            let (nx, ny) = self.precinct_counts(tile_index, level);
            sequence += u64::from(nx) * u64::from(ny);
        }
        let (nx, _) = self.precinct_counts(tile_index, resolution_level);
        sequence + u64::from(precinct_y) * u64::from(nx) + u64::from(precinct_x)
    }

    /// A.3.2 of 15444-9: the precinct data-bin in-class identifier is
    /// `t + (c + s * C) * T`.
    pub fn precinct_in_class_id(
        &self,
        tile_index: u32,
        component: u16,
        resolution_level: u8,
        precinct_x: u32,
        precinct_y: u32,
    ) -> u64 {
        let sequence =
            self.precinct_sequence_number(tile_index, resolution_level, precinct_x, precinct_y);
        u64::from(tile_index)
            + (u64::from(component) + sequence * u64::from(self.params.num_components))
                * u64::from(self.num_tiles())
    }

    /// Per-subband code-block grids of one precinct. Empty subbands (edge
    /// precincts of a one-sample band) get a zero-by-zero grid.
    pub fn precinct_geometry(&self, reference: &PrecinctReference) -> PrecinctGeometry {
        let r = reference.resolution_level;
        let (tile_w, tile_h) = self.tile_dimensions_at(reference.tile_index, r);
        let ppx = self.params.precinct_width_exponents[r as usize] as u32;
        let ppy = self.params.precinct_height_exponents[r as usize] as u32;

        // Subband copies of the precinct partition: at resolution 0 the LL
        // band has the resolution's own scale, above it the three bands are
        // half of it.
        let band_shift: u32 = if r == 0 { 0 } else { 1 };
        let band_ppx = ppx - band_shift;
        let band_ppy = ppy - band_shift;
        let cb_w = u32::from(self.params.codeblock_width_exponent).min(band_ppx);
        let cb_h = u32::from(self.params.codeblock_height_exponent).min(band_ppy);

        let band_dims: Vec<(u32, u32)> = if r == 0 {
            vec![(tile_w, tile_h)]
        } else {
            let low_w = shift_ceil(tile_w, 1);
            let high_w = tile_w / 2;
            let low_h = shift_ceil(tile_h, 1);
            let high_h = tile_h / 2;
            // HL, LH, HH
            vec![(high_w, low_h), (low_w, high_h), (high_w, high_h)]
        };

        let subbands = band_dims
            .into_iter()
            .map(|(band_w, band_h)| {
                let x0 = reference.precinct_x << band_ppx;
                let y0 = reference.precinct_y << band_ppy;
                let x1 = ((reference.precinct_x + 1) << band_ppx).min(band_w);
                let y1 = ((reference.precinct_y + 1) << band_ppy).min(band_h);
                let width = x1.saturating_sub(x0);
                let height = y1.saturating_sub(y0);
                SubbandGeometry {
                    codeblocks_x: shift_ceil(width, cb_w) as usize,
                    codeblocks_y: shift_ceil(height, cb_h) as usize,
                }
            })
            .collect();

        PrecinctGeometry {
            subbands,
            num_quality_layers: self.params.num_quality_layers,
            uses_start_of_packet: self.params.uses_start_of_packet,
            uses_end_of_packet_header: self.params.uses_end_of_packet_header,
        }
    }

    /// The part's region mapped to reference-grid pixels, `None` for whole
    /// image.
    fn part_region_on_reference_grid(&self, part: &CodestreamPartParams) -> Option<PixelRegion> {
        let region = part.region?;
        let shift = part.num_resolution_levels_cut as u32;
        Some(PixelRegion {
            min_x: region.min_x << shift,
            min_y: region.min_y << shift,
            max_x_exclusive: (region.max_x_exclusive << shift)
                .min(self.params.reference_grid_width),
            max_y_exclusive: (region.max_y_exclusive << shift)
                .min(self.params.reference_grid_height),
        })
    }

    /// Tile indices intersecting the part, in raster order.
    pub fn tiles_in_part(&self, part: &CodestreamPartParams) -> Vec<u32> {
        let (tx0, tx1, ty0, ty1) = self.part_tile_bounds(part);
        let mut tiles = Vec::new();
        for ty in ty0..ty1 {
            for tx in tx0..tx1 {
                tiles.push(ty * self.num_tiles_x + tx);
            }
        }
        tiles
    }

    /// Tile-grid bounds of the part: `(tx0, tx1, ty0, ty1)`, max-exclusive.
    pub fn part_tile_bounds(&self, part: &CodestreamPartParams) -> (u32, u32, u32, u32) {
        match self.part_region_on_reference_grid(part) {
            None => (0, self.num_tiles_x, 0, self.num_tiles_y),
            Some(region) => {
                let tx0 = region.min_x / self.params.tile_width;
                let ty0 = region.min_y / self.params.tile_height;
                let tx1 = div_ceil(region.max_x_exclusive, self.params.tile_width)
                    .min(self.num_tiles_x)
                    .max(tx0 + 1);
                let ty1 = div_ceil(region.max_y_exclusive, self.params.tile_height)
                    .min(self.num_tiles_y)
                    .max(ty0 + 1);
                (tx0, tx1, ty0, ty1)
            }
        }
    }

    /// Pixel dimensions of the part's full-tiles bounding box at the cut
    /// resolution. This is what a reconstructed SIZ declares.
    pub fn part_image_dimensions(&self, part: &CodestreamPartParams) -> (u32, u32) {
        let (tx0, tx1, ty0, ty1) = self.part_tile_bounds(part);
        let width = ((tx1 * self.params.tile_width).min(self.params.reference_grid_width))
            - tx0 * self.params.tile_width;
        let height = ((ty1 * self.params.tile_height).min(self.params.reference_grid_height))
            - ty0 * self.params.tile_height;
        let shift = part.num_resolution_levels_cut as u32;
        (shift_ceil(width, shift), shift_ceil(height, shift))
    }

    /// Tile dimensions at the cut resolution, for the reconstructed SIZ.
    pub fn part_tile_dimensions(&self, part: &CodestreamPartParams) -> (u32, u32) {
        let shift = part.num_resolution_levels_cut as u32;
        (
            shift_ceil(self.params.tile_width, shift),
            shift_ceil(self.params.tile_height, shift),
        )
    }

    /// Highest resolution level the part keeps.
    pub fn part_max_resolution_level(&self, part: &CodestreamPartParams) -> u8 {
        self.params.num_decomposition_levels - part.num_resolution_levels_cut
    }

    /// Every precinct the part needs, across its tiles, kept resolutions
    /// and requested components, with the DWT filter margin applied when a
    /// region is set.
    pub fn precincts_in_part(&self, part: &CodestreamPartParams) -> Vec<PrecinctReference> {
        let region = self.part_region_on_reference_grid(part);
        let max_level = self.part_max_resolution_level(part);
        let components: Vec<u16> = match &part.components {
            Some(subset) => subset.clone(),
            None => (0..self.params.num_components).collect(),
        };

        let mut precincts = Vec::new();
        for tile_index in self.tiles_in_part(part) {
            for resolution_level in 0..=max_level {
                let (px0, px1, py0, py1) =
                    self.precinct_range(tile_index, resolution_level, &region);
                for precinct_y in py0..py1 {
                    for precinct_x in px0..px1 {
                        for &component in &components {
                            precincts.push(self.precinct_reference(
                                tile_index,
                                component,
                                resolution_level,
                                precinct_x,
                                precinct_y,
                            ));
                        }
                    }
                }
            }
        }
        precincts
    }

    /// All precincts of one tile in RPCL packet order (layer iteration is
    /// the caller's, innermost), limited to the part's kept resolutions but
    /// NOT to its region: reconstruction keeps standard ordering.
    pub fn tile_packet_precincts(
        &self,
        tile_index: u32,
        part: &CodestreamPartParams,
    ) -> Vec<PrecinctReference> {
        let max_level = self.part_max_resolution_level(part);
        let mut precincts = Vec::new();
        for resolution_level in 0..=max_level {
            let (nx, ny) = self.precinct_counts(tile_index, resolution_level);
            for precinct_y in 0..ny {
                for precinct_x in 0..nx {
                    for component in 0..self.params.num_components {
                        precincts.push(self.precinct_reference(
                            tile_index,
                            component,
                            resolution_level,
                            precinct_x,
                            precinct_y,
                        ));
                    }
                }
            }
        }
        precincts
    }

    fn precinct_reference(
        &self,
        tile_index: u32,
        component: u16,
        resolution_level: u8,
        precinct_x: u32,
        precinct_y: u32,
    ) -> PrecinctReference {
        PrecinctReference {
            tile_index,
            component,
            resolution_level,
            precinct_x,
            precinct_y,
            in_class_id: self.precinct_in_class_id(
                tile_index,
                component,
                resolution_level,
                precinct_x,
                precinct_y,
            ),
        }
    }

    /// Precinct index range of one tile/resolution covering the region
    /// (whole grid when `None`), with the DWT margin.
    fn precinct_range(
        &self,
        tile_index: u32,
        resolution_level: u8,
        region: &Option<PixelRegion>,
    ) -> (u32, u32, u32, u32) {
        let (nx, ny) = self.precinct_counts(tile_index, resolution_level);
        let region = match region {
            None => return (0, nx, 0, ny),
            Some(region) => region,
        };
        let shift = self.resolution_scale_log2(resolution_level) as u32;
        let min_x = (region.min_x >> shift).saturating_sub(DWT_FILTER_MARGIN);
        let min_y = (region.min_y >> shift).saturating_sub(DWT_FILTER_MARGIN);
        let max_x = shift_ceil(region.max_x_exclusive, shift) + DWT_FILTER_MARGIN;
        let max_y = shift_ceil(region.max_y_exclusive, shift) + DWT_FILTER_MARGIN;

        let tx = tile_index % self.num_tiles_x;
        let ty = tile_index / self.num_tiles_x;
        let origin_x = (tx * self.params.tile_width) >> shift;
        let origin_y = (ty * self.params.tile_height) >> shift;

        let ppx = self.params.precinct_width_exponents[resolution_level as usize] as u32;
        let ppy = self.params.precinct_height_exponents[resolution_level as usize] as u32;
        let px0 = (min_x.saturating_sub(origin_x) >> ppx).min(nx);
        let py0 = (min_y.saturating_sub(origin_y) >> ppy).min(ny);
        let px1 = shift_ceil(max_x.saturating_sub(origin_x), ppx).min(nx).max(px0);
        let py1 = shift_ceil(max_y.saturating_sub(origin_y), ppy).min(ny).max(py0);
        (px0, px1, py0, py1)
    }
}

fn div_ceil(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}

/// `ceil(value / 2^shift)`.
fn shift_ceil(value: u32, shift: u32) -> u32 {
    if shift == 0 {
        return value;
    }
    (value + (1 << shift) - 1) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params_512() -> CodestreamStructureParams {
        CodestreamStructureParams {
            reference_grid_width: 512,
            reference_grid_height: 256,
            tile_width: 256,
            tile_height: 256,
            num_components: 3,
            num_decomposition_levels: 2,
            num_quality_layers: 4,
            progression_order: PROGRESSION_ORDER_RPCL,
            precinct_width_exponents: vec![6, 7, 7],
            precinct_height_exponents: vec![6, 7, 7],
            codeblock_width_exponent: 5,
            codeblock_height_exponent: 5,
            uses_start_of_packet: false,
            uses_end_of_packet_header: false,
            component_horizontal_separations: vec![1, 1, 1],
            component_vertical_separations: vec![1, 1, 1],
        }
    }

    #[test]
    fn test_non_rpcl_progression_is_rejected() {
        let mut params = params_512();
        params.progression_order = 0;
        match CodestreamStructure::new(params) {
            Err(CodestreamError::UnsupportedProgressionOrder { value: 0 }) => {}
            other => panic!("expected unsupported progression, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_subsampled_component_is_rejected() {
        let mut params = params_512();
        params.component_horizontal_separations = vec![1, 2, 1];
        assert!(CodestreamStructure::new(params).is_err());
    }

    #[test]
    fn test_zero_precinct_exponent_above_resolution_zero_is_rejected() {
        let mut params = params_512();
        params.precinct_width_exponents = vec![0, 0, 0];
        params.precinct_height_exponents = vec![0, 0, 0];
        match CodestreamStructure::new(params) {
            Err(CodestreamError::StructureInvalid { .. }) => {}
            other => panic!("expected invalid structure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_tile_grid() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        assert_eq!(structure.num_tiles_x(), 2);
        assert_eq!(structure.num_tiles_y(), 1);
        assert_eq!(structure.tile_dimensions(1), (256, 256));
    }

    #[test]
    fn test_precinct_counts_per_resolution() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        // Tile is 256 wide: 64 samples at r0 (PP 2^6), 128 at r1 (2^7),
        // 256 at r2 (2^7).
        assert_eq!(structure.precinct_counts(0, 0), (1, 1));
        assert_eq!(structure.precinct_counts(0, 1), (1, 1));
        assert_eq!(structure.precinct_counts(0, 2), (2, 2));
    }

    #[test]
    fn test_in_class_ids_are_unique_and_stable() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        let part = CodestreamPartParams::whole_image();
        let precincts = structure.precincts_in_part(&part);
        let mut ids: Vec<u64> = precincts.iter().map(|p| p.in_class_id).collect();
        let count = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), count, "in-class ids must be unique");

        // t + (c + s*C)*T for the very first precinct of tile 1.
        assert_eq!(structure.precinct_in_class_id(1, 0, 0, 0, 0), 1);
        assert_eq!(structure.precinct_in_class_id(1, 2, 0, 0, 0), 5);
    }

    #[test]
    fn test_resolution_zero_has_one_subband_others_three() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        let part = CodestreamPartParams::whole_image();
        let precincts = structure.precincts_in_part(&part);
        for precinct in precincts {
            let geometry = structure.precinct_geometry(&precinct);
            let expected = if precinct.resolution_level == 0 { 1 } else { 3 };
            assert_eq!(geometry.subbands.len(), expected);
        }
    }

    #[test]
    fn test_codeblock_grid_of_low_resolution_precinct() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        let reference = PrecinctReference {
            tile_index: 0,
            component: 0,
            resolution_level: 0,
            precinct_x: 0,
            precinct_y: 0,
            in_class_id: 0,
        };
        let geometry = structure.precinct_geometry(&reference);
        // LL band is 64x64 at r0, code-blocks 32x32.
        assert_eq!(
            geometry.subbands[0],
            SubbandGeometry {
                codeblocks_x: 2,
                codeblocks_y: 2
            }
        );
    }

    #[test]
    fn test_region_limits_tiles_and_precincts() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        let part = CodestreamPartParams {
            region: Some(PixelRegion {
                min_x: 0,
                min_y: 0,
                max_x_exclusive: 10,
                max_y_exclusive: 10,
            }),
            num_resolution_levels_cut: 0,
            components: Some(vec![0]),
        };
        assert_eq!(structure.tiles_in_part(&part), vec![0]);
        let precincts = structure.precincts_in_part(&part);
        assert!(!precincts.is_empty());
        assert!(precincts.iter().all(|p| p.tile_index == 0));
        assert!(precincts.iter().all(|p| p.component == 0));
        // A 10x10 corner region never reaches the second precinct column
        // of the top resolution (samples 128..256).
        assert!(precincts.iter().all(|p| p.precinct_x == 0));
    }

    #[test]
    fn test_resolution_cut_drops_high_levels() {
        let structure = CodestreamStructure::new(params_512()).unwrap();
        let part = CodestreamPartParams {
            region: None,
            num_resolution_levels_cut: 1,
            components: None,
        };
        assert_eq!(structure.part_max_resolution_level(&part), 1);
        assert_eq!(structure.part_image_dimensions(&part), (256, 128));
        assert_eq!(structure.part_tile_dimensions(&part), (128, 128));
        let precincts = structure.precincts_in_part(&part);
        assert!(precincts.iter().all(|p| p.resolution_level <= 1));
    }
}
