use jpc::{PacketHeaderParser, PrecinctGeometry, QualityLayerOffsetCache, SubbandGeometry};
use jpip::{Databin, DatabinClass};

fn single_codeblock_geometry(num_quality_layers: u16) -> PrecinctGeometry {
    PrecinctGeometry {
        subbands: vec![SubbandGeometry {
            codeblocks_x: 1,
            codeblocks_y: 1,
        }],
        num_quality_layers,
        uses_start_of_packet: false,
        uses_end_of_packet_header: false,
    }
}

// Header bits: non-empty, inclusion tag tree "1" (first included at layer 0),
// zero bit planes tag tree "01" (value 1), one coding pass "0", Lblock
// unchanged "0", then a 3-bit length field 0b101 = 5 body bytes. Packed:
// 1101 0010 1 → 0xD2 0x80.
const SINGLE_CODEBLOCK_HEADER: [u8; 2] = [0xD2, 0x80];
const SINGLE_CODEBLOCK_BODY: [u8; 5] = [10, 20, 30, 40, 50];

fn single_codeblock_databin() -> Databin {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    databin.save(2, &SINGLE_CODEBLOCK_BODY, true).unwrap();
    databin
}

#[test]
fn test_single_codeblock_packet() {
    let databin = single_codeblock_databin();
    let mut parser = PacketHeaderParser::new(single_codeblock_geometry(1));

    let packet = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(packet.quality_layer, 0);
    assert_eq!(packet.header_start_offset, 0);
    assert_eq!(packet.header_length_bytes, 2);
    assert_eq!(packet.overall_body_length_bytes, 5);
    assert_eq!(packet.end_offset, 7);
    assert_eq!(packet.subbands.len(), 1);
    assert_eq!(packet.subbands[0].codeblocks.len(), 1);

    let contribution = packet.subbands[0].codeblocks[0];
    assert_eq!(contribution.coding_passes, 1);
    assert_eq!(contribution.zero_bit_planes, 1);
    assert_eq!(contribution.body_length_bytes, 5);
}

#[test]
fn test_empty_packet_is_one_zero_byte() {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &[0x00], true).unwrap();

    let geometry = PrecinctGeometry {
        subbands: vec![SubbandGeometry {
            codeblocks_x: 3,
            codeblocks_y: 1,
        }],
        num_quality_layers: 2,
        uses_start_of_packet: false,
        uses_end_of_packet_header: false,
    };
    let mut parser = PacketHeaderParser::new(geometry);

    let packet = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(packet.header_length_bytes, 1);
    assert_eq!(packet.overall_body_length_bytes, 0);
    assert_eq!(packet.end_offset, 1);
    assert_eq!(packet.subbands[0].codeblocks.len(), 3);
    for contribution in &packet.subbands[0].codeblocks {
        assert_eq!(contribution.coding_passes, 0);
        assert_eq!(contribution.body_length_bytes, 0);
    }
}

#[test]
fn test_parse_resumes_after_more_data_arrives() {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER[0..1], false).unwrap();

    let mut parser = PacketHeaderParser::new(single_codeblock_geometry(1));
    let err = parser.parse_next_packet(&databin).unwrap_err();
    assert!(err.is_insufficient_data());
    assert_eq!(parser.num_parsed_packets(), 0);

    databin.save(1, &SINGLE_CODEBLOCK_HEADER[1..], false).unwrap();
    databin.save(2, &SINGLE_CODEBLOCK_BODY, true).unwrap();
    let packet = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(packet.end_offset, 7);
    assert_eq!(parser.num_parsed_packets(), 1);
}

#[test]
fn test_two_parsers_agree_on_the_same_databin() {
    let databin = single_codeblock_databin();
    let mut first = PacketHeaderParser::new(single_codeblock_geometry(1));
    let mut second = PacketHeaderParser::new(single_codeblock_geometry(1));

    let a = first.parse_next_packet(&databin).unwrap().clone();
    let b = second.parse_next_packet(&databin).unwrap().clone();
    assert_eq!(a, b);
}

#[test]
fn test_second_layer_reuses_durable_codeblock_state() {
    // Layer 1 header: non-empty, inclusion bit 1, one pass "0", Lblock "0",
    // 3-bit length 0b100 = 4 body bytes. Packed: 1100 100 → 0xC8.
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    databin.save(2, &SINGLE_CODEBLOCK_BODY, false).unwrap();
    databin.save(7, &[0xC8], false).unwrap();
    databin.save(8, &[1, 2, 3, 4], true).unwrap();

    let mut parser = PacketHeaderParser::new(single_codeblock_geometry(2));
    let first = parser.parse_next_packet(&databin).unwrap().clone();
    assert_eq!(first.end_offset, 7);

    let second = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(second.quality_layer, 1);
    assert_eq!(second.header_start_offset, 7);
    assert_eq!(second.header_length_bytes, 1);
    assert_eq!(second.overall_body_length_bytes, 4);
    assert_eq!(second.end_offset, 12);
    // Zero bit planes stick from the first inclusion.
    assert_eq!(second.subbands[0].codeblocks[0].zero_bit_planes, 1);
}

#[test]
fn test_offset_cache_counts_only_fully_buffered_packets() {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    // Only 4 of 5 body bytes have arrived.
    databin.save(2, &SINGLE_CODEBLOCK_BODY[0..4], false).unwrap();

    let mut cache = QualityLayerOffsetCache::new(single_codeblock_geometry(1));
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 1)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 0);
    assert_eq!(offset.end_offset, 0);

    databin.save(6, &SINGLE_CODEBLOCK_BODY[4..], true).unwrap();
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 1)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 1);
    assert_eq!(offset.end_offset, 7);
}

#[test]
fn test_reached_layer_count_never_decreases_on_resave() {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    databin.save(2, &SINGLE_CODEBLOCK_BODY, false).unwrap();

    let mut cache = QualityLayerOffsetCache::new(single_codeblock_geometry(2));
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 2)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 1);

    // Redundant and overlapping re-saves of bytes already counted leave the
    // reached layer count where it was.
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    databin.save(1, &[SINGLE_CODEBLOCK_HEADER[1], 10, 20], false).unwrap();
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 2)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 1);
    assert_eq!(offset.end_offset, 7);

    // New bytes only ever move it forward.
    databin.save(7, &[0xC8, 1, 2, 3, 4], true).unwrap();
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 2)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 2);
    assert_eq!(offset.end_offset, 12);
}

#[test]
fn test_offset_cache_caps_at_requested_layers() {
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &SINGLE_CODEBLOCK_HEADER, false).unwrap();
    databin.save(2, &SINGLE_CODEBLOCK_BODY, false).unwrap();
    databin.save(7, &[0xC8], false).unwrap();
    databin.save(8, &[1, 2, 3, 4], true).unwrap();

    let mut cache = QualityLayerOffsetCache::new(single_codeblock_geometry(2));
    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 1)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 1);
    assert_eq!(offset.end_offset, 7);

    let offset = cache
        .calculate_end_offset_of_last_full_packet(&databin, 2)
        .unwrap();
    assert_eq!(offset.num_full_quality_layers, 2);
    assert_eq!(offset.end_offset, 12);
}

#[test]
fn test_end_of_packet_header_marker_is_checked() {
    let geometry = PrecinctGeometry {
        subbands: vec![SubbandGeometry {
            codeblocks_x: 1,
            codeblocks_y: 1,
        }],
        num_quality_layers: 1,
        uses_start_of_packet: false,
        uses_end_of_packet_header: true,
    };

    // Empty packet followed by EPH.
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &[0x00, 0xFF, 0x92], true).unwrap();
    let mut parser = PacketHeaderParser::new(geometry.clone());
    let packet = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(packet.header_length_bytes, 3);
    assert_eq!(packet.end_offset, 3);

    // Empty packet with the EPH bytes corrupted.
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &[0x00, 0xFF, 0x00], true).unwrap();
    let mut parser = PacketHeaderParser::new(geometry);
    assert!(parser.parse_next_packet(&databin).is_err());
}

#[test]
fn test_start_of_packet_segment_is_skipped() {
    let geometry = PrecinctGeometry {
        subbands: vec![SubbandGeometry {
            codeblocks_x: 1,
            codeblocks_y: 1,
        }],
        num_quality_layers: 1,
        uses_start_of_packet: true,
        uses_end_of_packet_header: false,
    };

    let mut bytes = vec![0xFF, 0x91, 0x00, 0x04, 0x00, 0x00];
    bytes.extend_from_slice(&SINGLE_CODEBLOCK_HEADER);
    bytes.extend_from_slice(&SINGLE_CODEBLOCK_BODY);
    let mut databin = Databin::new(DatabinClass::Precinct, 0);
    databin.save(0, &bytes, true).unwrap();

    let mut parser = PacketHeaderParser::new(geometry);
    let packet = parser.parse_next_packet(&databin).unwrap();
    assert_eq!(packet.header_start_offset, 0);
    assert_eq!(packet.header_length_bytes, 8);
    assert_eq!(packet.overall_body_length_bytes, 5);
    assert_eq!(packet.end_offset, 13);
}
