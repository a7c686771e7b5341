use std::cell::RefCell;
use std::rc::Rc;

use jpip::{
    DataArrivedListener, Databin, DatabinClass, DatabinStore, JpipError, MessageClass,
    MessageHeader, StreamType,
};

fn header(
    class: MessageClass,
    in_class_id: u64,
    offset: usize,
    length: usize,
    is_last: bool,
) -> MessageHeader {
    MessageHeader {
        class,
        in_class_id,
        message_offset: offset,
        message_body_length: length,
        is_last_byte_in_databin: is_last,
        aux: None,
    }
}

struct CountingListener {
    calls: Rc<RefCell<Vec<(u64, usize)>>>,
}

impl DataArrivedListener for CountingListener {
    fn data_arrived(&self, databin: &Databin) {
        self.calls
            .borrow_mut()
            .push((databin.in_class_id(), databin.get_loaded_bytes()));
    }
}

#[test]
fn test_stream_type_gates_message_classes() {
    let mut store = DatabinStore::new(StreamType::Jpp);
    let result = store.save_data(
        &header(MessageClass::TileNoAux, 0, 0, 3, false),
        &[1, 2, 3],
    );
    assert!(matches!(result, Err(JpipError::ClassNotAllowed { .. })));

    let mut store = DatabinStore::new(StreamType::Jpt);
    let result = store.save_data(
        &header(MessageClass::PrecinctNoAux, 0, 0, 3, false),
        &[1, 2, 3],
    );
    assert!(matches!(result, Err(JpipError::ClassNotAllowed { .. })));

    // Header classes are welcome in both stream types.
    store
        .save_data(&header(MessageClass::MainHeader, 0, 0, 2, false), &[1, 2])
        .unwrap();
}

#[test]
fn test_main_header_in_class_id_must_be_zero() {
    let mut store = DatabinStore::new(StreamType::Jpp);
    let result = store.save_data(&header(MessageClass::MainHeader, 7, 0, 1, false), &[9]);
    assert!(matches!(
        result,
        Err(JpipError::MainHeaderInClassId { in_class_id: 7 })
    ));
}

#[test]
fn test_metadata_messages_are_accepted_and_dropped() {
    let mut store = DatabinStore::new(StreamType::Jpp);
    store
        .save_data(&header(MessageClass::Metadata, 0, 0, 4, true), &[1, 2, 3, 4])
        .unwrap();
    assert_eq!(store.loaded_bytes(), 0);
}

#[test]
fn test_overlapping_messages_count_bytes_once() {
    let mut store = DatabinStore::new(StreamType::Jpp);
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 3, 0, 4, false),
            &[1, 2, 3, 4],
        )
        .unwrap();
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 3, 2, 4, false),
            &[3, 4, 5, 6],
        )
        .unwrap();
    assert_eq!(store.loaded_bytes(), 6);

    // Re-delivery adds nothing.
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 3, 0, 4, false),
            &[1, 2, 3, 4],
        )
        .unwrap();
    assert_eq!(store.loaded_bytes(), 6);
}

#[test]
fn test_listeners_fire_after_merge_with_current_state() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut store = DatabinStore::new(StreamType::Jpp);
    store.add_listener(
        DatabinClass::Precinct,
        5,
        Rc::new(CountingListener {
            calls: calls.clone(),
        }),
    );

    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 5, 0, 3, false),
            &[1, 2, 3],
        )
        .unwrap();
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 5, 3, 2, true),
            &[4, 5],
        )
        .unwrap();
    // The listener observes the databin after the merge, not before.
    assert_eq!(*calls.borrow(), vec![(5, 3), (5, 5)]);

    // A redundant re-delivery that adds nothing and carries no last-byte
    // flag stays silent.
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 5, 0, 3, false),
            &[1, 2, 3],
        )
        .unwrap();
    assert_eq!(calls.borrow().len(), 2);
}

#[test]
fn test_listened_byte_accounting() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut store = DatabinStore::new(StreamType::Jpp);

    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 1, 0, 4, false),
            &[1, 2, 3, 4],
        )
        .unwrap();
    assert_eq!(store.loaded_bytes_in_listened(), 0);

    let id = store.add_listener(
        DatabinClass::Precinct,
        1,
        Rc::new(CountingListener {
            calls: calls.clone(),
        }),
    );
    assert_eq!(store.loaded_bytes_in_listened(), 4);

    store
        .save_data(&header(MessageClass::PrecinctNoAux, 1, 4, 2, false), &[5, 6])
        .unwrap();
    assert_eq!(store.loaded_bytes_in_listened(), 6);

    store.remove_listener(DatabinClass::Precinct, 1, id);
    assert_eq!(store.loaded_bytes_in_listened(), 0);
    assert_eq!(store.loaded_bytes(), 6);
}

#[test]
fn test_cleanup_keeps_main_header_and_listened_bins() {
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut store = DatabinStore::new(StreamType::Jpp);
    store
        .save_data(&header(MessageClass::MainHeader, 0, 0, 3, true), &[1, 2, 3])
        .unwrap();
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 1, 0, 4, false),
            &[1, 2, 3, 4],
        )
        .unwrap();
    store
        .save_data(&header(MessageClass::PrecinctNoAux, 2, 0, 2, false), &[1, 2])
        .unwrap();
    store.add_listener(
        DatabinClass::Precinct,
        1,
        Rc::new(CountingListener {
            calls: calls.clone(),
        }),
    );

    let reclaimed = store.cleanup_unlistened();
    assert_eq!(reclaimed, 2);
    assert_eq!(store.loaded_bytes(), 7);
    assert!(store.main_header().is_some());
    assert!(store.databin(DatabinClass::Precinct, 1).is_some());
    assert!(store.databin(DatabinClass::Precinct, 2).is_none());
}

#[test]
fn test_databin_length_is_fixed_by_last_byte_flag() {
    let mut store = DatabinStore::new(StreamType::Jpp);
    store
        .save_data(
            &header(MessageClass::PrecinctNoAux, 0, 0, 4, true),
            &[1, 2, 3, 4],
        )
        .unwrap();
    let result = store.save_data(
        &header(MessageClass::PrecinctNoAux, 0, 4, 2, false),
        &[5, 6],
    );
    assert!(matches!(
        result,
        Err(JpipError::MessageBeyondDatabinEnd { .. })
    ));
}
