use clap::Parser;
use log::info;
use std::error;
use std::error::Error;
use std::fmt;
use std::fs;
use std::rc::Rc;

use jpc::{
    CodestreamPartParams, CodestreamReconstructor, CodestreamStructure,
    CodestreamStructureParams, PrecinctArena,
};
use jpip::{DatabinStore, MessageClass, MessageHeader, StreamType};

#[derive(Debug)]
enum JpipClientError {
    TruncatedTrace { record: usize, at: usize },
    UnknownStreamType { value: String },
    ExponentCount { expected: usize, actual: usize },
    DataNotArrived,
}

impl error::Error for JpipClientError {}
impl fmt::Display for JpipClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TruncatedTrace { record, at } => {
                write!(f, "trace ends mid record {} at byte {}", record, at)
            }
            Self::UnknownStreamType { value } => {
                write!(f, "unknown stream type {}, expected jpp or jpt", value)
            }
            Self::ExponentCount { expected, actual } => {
                write!(
                    f,
                    "expected 1 or {} precinct size exponents, got {}",
                    expected, actual
                )
            }
            Self::DataNotArrived => {
                write!(
                    f,
                    "the trace does not carry enough data for the requested quality"
                )
            }
        }
    }
}

/// Replay a recorded JPIP message trace and write the reconstructed
/// codestream.
#[derive(Parser)]
struct Opts {
    /// Path to the recorded message trace
    trace: String,

    /// Output codestream path
    #[clap(short, long, default_value = "out.jpc")]
    output: String,

    /// Stream type the trace was recorded from: jpp or jpt
    #[clap(long, default_value = "jpp")]
    stream: String,

    /// Reference grid width in pixels
    #[clap(long)]
    width: u32,

    /// Reference grid height in pixels
    #[clap(long)]
    height: u32,

    #[clap(long)]
    tile_width: u32,

    #[clap(long)]
    tile_height: u32,

    #[clap(long, default_value_t = 1)]
    components: u16,

    /// Number of wavelet decomposition levels
    #[clap(long, default_value_t = 0)]
    levels: u8,

    /// Number of quality layers declared in COD
    #[clap(long, default_value_t = 1)]
    layers: u16,

    /// Comma separated PPx exponents, lowest resolution first; a single
    /// value applies to every resolution
    #[clap(long, default_value = "15")]
    precinct_width_exponents: String,

    /// Comma separated PPy exponents, lowest resolution first
    #[clap(long, default_value = "15")]
    precinct_height_exponents: String,

    #[clap(long, default_value_t = 6)]
    codeblock_width_exponent: u8,

    #[clap(long, default_value_t = 6)]
    codeblock_height_exponent: u8,

    /// The coding style declares SOP marker segments
    #[clap(long)]
    sop: bool,

    /// The coding style declares EPH markers
    #[clap(long)]
    eph: bool,

    /// Fail unless every precinct has at least this many full layers
    #[clap(long, default_value_t = 0)]
    min_quality: u16,

    /// Copy at most this many quality layers per precinct
    #[clap(long)]
    max_quality: Option<u16>,

    /// Drop this many highest resolution levels
    #[clap(long, default_value_t = 0)]
    cut: u8,

    /// Emit the header structure only, without packet data
    #[clap(long)]
    headers_only: bool,
}

const TRACE_RECORD_HEADER_LENGTH: usize = 14;

/// Replays `class:u8, in_class_id:u32, offset:u32, length:u32, is_last:u8,
/// body` records (big-endian) into the store. Records of the with-aux
/// classes carry an extra `aux:u32` layer-count hint between the fixed
/// header and the body.
fn replay_trace(store: &mut DatabinStore, raw: &[u8]) -> Result<usize, Box<dyn Error>> {
    let mut pos = 0usize;
    let mut records = 0usize;
    while pos < raw.len() {
        if raw.len() - pos < TRACE_RECORD_HEADER_LENGTH {
            return Err(JpipClientError::TruncatedTrace {
                record: records,
                at: pos,
            }
            .into());
        }
        let class = MessageClass::from_id(raw[pos])?;
        let in_class_id = u32::from_be_bytes([raw[pos + 1], raw[pos + 2], raw[pos + 3], raw[pos + 4]]);
        let offset = u32::from_be_bytes([raw[pos + 5], raw[pos + 6], raw[pos + 7], raw[pos + 8]]);
        let length =
            u32::from_be_bytes([raw[pos + 9], raw[pos + 10], raw[pos + 11], raw[pos + 12]]) as usize;
        let is_last = raw[pos + 13] != 0;
        let has_aux = matches!(
            class,
            MessageClass::PrecinctWithAux | MessageClass::TileWithAux
        );
        let mut body_start = pos + TRACE_RECORD_HEADER_LENGTH;
        let aux = if has_aux {
            if raw.len() - body_start < 4 {
                return Err(JpipClientError::TruncatedTrace {
                    record: records,
                    at: body_start,
                }
                .into());
            }
            let aux = u32::from_be_bytes([
                raw[body_start],
                raw[body_start + 1],
                raw[body_start + 2],
                raw[body_start + 3],
            ]);
            body_start += 4;
            Some(aux)
        } else {
            None
        };
        if raw.len() - body_start < length {
            return Err(JpipClientError::TruncatedTrace {
                record: records,
                at: body_start,
            }
            .into());
        }
        let header = MessageHeader {
            class,
            in_class_id: u64::from(in_class_id),
            message_offset: offset as usize,
            message_body_length: length,
            is_last_byte_in_databin: is_last,
            aux,
        };
        store.save_data(&header, &raw[body_start..body_start + length])?;
        pos = body_start + length;
        records += 1;
    }
    Ok(records)
}

fn parse_exponents(raw: &str, resolutions: usize) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut values = Vec::new();
    for field in raw.split(',') {
        values.push(field.trim().parse::<u8>()?);
    }
    if values.len() == 1 {
        return Ok(vec![values[0]; resolutions]);
    }
    if values.len() != resolutions {
        return Err(JpipClientError::ExponentCount {
            expected: resolutions,
            actual: values.len(),
        }
        .into());
    }
    Ok(values)
}

fn run() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opts: Opts = Opts::parse();

    let stream_type = match opts.stream.as_str() {
        "jpp" => StreamType::Jpp,
        "jpt" => StreamType::Jpt,
        other => {
            return Err(JpipClientError::UnknownStreamType {
                value: other.to_owned(),
            }
            .into())
        }
    };

    let resolutions = opts.levels as usize + 1;
    let params = CodestreamStructureParams {
        reference_grid_width: opts.width,
        reference_grid_height: opts.height,
        tile_width: opts.tile_width,
        tile_height: opts.tile_height,
        num_components: opts.components,
        num_decomposition_levels: opts.levels,
        num_quality_layers: opts.layers,
        progression_order: jpc::PROGRESSION_ORDER_RPCL,
        precinct_width_exponents: parse_exponents(&opts.precinct_width_exponents, resolutions)?,
        precinct_height_exponents: parse_exponents(&opts.precinct_height_exponents, resolutions)?,
        codeblock_width_exponent: opts.codeblock_width_exponent,
        codeblock_height_exponent: opts.codeblock_height_exponent,
        uses_start_of_packet: opts.sop,
        uses_end_of_packet_header: opts.eph,
        component_horizontal_separations: vec![1; opts.components as usize],
        component_vertical_separations: vec![1; opts.components as usize],
    };
    let structure = Rc::new(CodestreamStructure::new(params)?);

    let raw_trace = fs::read(&opts.trace)?;
    let mut store = DatabinStore::new(stream_type);
    let records = replay_trace(&mut store, &raw_trace)?;
    info!(
        "replayed {} messages, {} bytes buffered",
        records,
        store.loaded_bytes()
    );

    let part = CodestreamPartParams {
        region: None,
        num_resolution_levels_cut: opts.cut,
        components: None,
    };
    let reconstructor = CodestreamReconstructor::new(structure, PrecinctArena::new_shared());
    let codestream = if opts.headers_only {
        reconstructor.create_headers_codestream(&store, &part)?
    } else {
        reconstructor.create_codestream(&store, &part, opts.min_quality, opts.max_quality)?
    };

    match codestream {
        Some(bytes) => {
            fs::write(&opts.output, &bytes)?;
            info!("wrote {} bytes to {}", bytes.len(), opts.output);
            Ok(())
        }
        None => Err(JpipClientError::DataNotArrived.into()),
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    match run() {
        Err(e) => {
            return Err(e.to_string().into());
        }
        Ok(_) => Ok(()),
    }
}
