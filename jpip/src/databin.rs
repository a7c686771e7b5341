//! Data-bins and their byte-range storage.

use crate::{DatabinClass, JpipError};
use std::rc::Rc;

/// One contiguous extent of a data-bin, stored as an append-only ordered
/// concatenation of byte slices.
///
/// Appends may only move the covered range forward; the overlapping head of
/// an incoming slice is clipped away.
#[derive(Debug)]
pub struct ByteRangeBuffer {
    start: usize,
    parts: Vec<Vec<u8>>,
    length: usize,
}

impl ByteRangeBuffer {
    pub fn new(start: usize, bytes: &[u8]) -> Self {
        ByteRangeBuffer {
            start,
            parts: vec![bytes.to_vec()],
            length: bytes.len(),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end offset of the covered range.
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Appends `bytes` located at absolute `offset`, clipping the part that
    /// is already covered. `offset` must not leave a gap.
    pub fn extend_with(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset <= self.end(), "extent append would leave a gap");
        let skip = self.end() - offset;
        if skip < bytes.len() {
            self.parts.push(bytes[skip..].to_vec());
            self.length += bytes.len() - skip;
        }
    }

    /// Appends the tail of `other` that lies beyond this extent's end.
    /// `other` must overlap or touch this extent.
    pub fn absorb(&mut self, other: &ByteRangeBuffer) {
        assert!(other.start <= self.end(), "absorbed extent would leave a gap");
        if other.end() <= self.end() {
            return;
        }
        let mut offset = other.start;
        for part in &other.parts {
            self.extend_with(offset, part);
            offset += part.len();
        }
    }

    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        if offset < self.start || offset >= self.end() {
            return None;
        }
        let mut relative = offset - self.start;
        for part in &self.parts {
            if relative < part.len() {
                return Some(part[relative]);
            }
            relative -= part.len();
        }
        None
    }

    /// Calls `f` once per stored slice intersecting `[from, to)`, in order,
    /// with the slice's absolute offset.
    pub fn for_each_slice<F: FnMut(usize, &[u8])>(&self, from: usize, to: usize, f: &mut F) {
        let mut offset = self.start;
        for part in &self.parts {
            let part_end = offset + part.len();
            if part_end > from && offset < to {
                let lo = from.max(offset) - offset;
                let hi = to.min(part_end) - offset;
                f(offset + lo, &part[lo..hi]);
            }
            offset = part_end;
        }
    }
}

/// Handle for O(1) listener removal.
pub type ListenerId = u64;

/// Arrival notification for one data-bin. Fired synchronously from
/// `DatabinStore::save_data` after the bytes are merged.
pub trait DataArrivedListener {
    fn data_arrived(&self, databin: &Databin);
}

/// Options for `Databin::copy_bytes`.
#[derive(Debug, Clone, Default)]
pub struct CopyBytesOptions {
    pub databin_start_offset: usize,

    /// Upper bound on the bytes to copy; `None` means through the declared
    /// end of the bin (which must then be known for a forced copy).
    pub max_length_to_copy: Option<usize>,

    /// All-or-nothing: either the whole requested range is buffered and
    /// copied, or nothing is copied and the call reports `None`.
    pub force_copy_all_range: bool,
}

/// One logical byte container of the stream, filled incrementally.
///
/// Extents are disjoint and sorted; overlapping or adjacent incoming ranges
/// are merged so a byte is never counted twice. Once a message with the
/// last-byte flag arrives the total length is fixed for good.
pub struct Databin {
    class: DatabinClass,
    in_class_id: u64,
    extents: Vec<ByteRangeBuffer>,
    known_total_length: Option<usize>,
    loaded_byte_count: usize,
    listeners: Vec<(ListenerId, Rc<dyn DataArrivedListener>)>,
    aux: Option<u32>,
}

impl Databin {
    pub fn new(class: DatabinClass, in_class_id: u64) -> Self {
        Databin {
            class,
            in_class_id,
            extents: Vec::new(),
            known_total_length: None,
            loaded_byte_count: 0,
            listeners: Vec::new(),
            aux: None,
        }
    }

    pub fn class(&self) -> DatabinClass {
        self.class
    }

    pub fn in_class_id(&self) -> u64 {
        self.in_class_id
    }

    /// Quality-layer-count hint from the auxiliary field of the most recent
    /// `*WithAux` message, when the server sends one.
    pub fn aux(&self) -> Option<u32> {
        self.aux
    }

    pub fn set_aux(&mut self, aux: u32) {
        self.aux = Some(aux);
    }

    /// Merges one message's byte range, returning the number of bytes that
    /// were not already buffered. Re-saving an identical message adds zero.
    pub fn save(
        &mut self,
        offset: usize,
        bytes: &[u8],
        is_last_byte_in_databin: bool,
    ) -> Result<usize, JpipError> {
        let message_end = offset + bytes.len();
        if is_last_byte_in_databin {
            match self.known_total_length {
                None => self.known_total_length = Some(message_end),
                Some(known) if known != message_end => {
                    return Err(JpipError::DatabinLengthConflict {
                        known_length: known,
                        conflicting_length: message_end,
                    });
                }
                Some(_) => {}
            }
        }
        if let Some(known) = self.known_total_length {
            if message_end > known {
                return Err(JpipError::MessageBeyondDatabinEnd {
                    known_length: known,
                    message_end,
                });
            }
        }
        if bytes.is_empty() {
            return Ok(0);
        }

        let before = self.loaded_byte_count;

        // Extents overlapping or touching [offset, message_end].
        let lo = self.extents.partition_point(|e| e.end() < offset);
        let hi = self.extents.partition_point(|e| e.start() <= message_end);

        if lo == hi {
            self.extents.insert(lo, ByteRangeBuffer::new(offset, bytes));
        } else if self.extents[lo].start() <= offset {
            self.extents[lo].extend_with(offset, bytes);
            for merged in self.extents.drain(lo + 1..hi).collect::<Vec<_>>() {
                self.extents[lo].absorb(&merged);
            }
        } else {
            // The incoming range begins before every affected extent, so a
            // fresh extent takes their place and swallows their tails.
            let mut fresh = ByteRangeBuffer::new(offset, bytes);
            for merged in self.extents.drain(lo..hi) {
                fresh.absorb(&merged);
            }
            self.extents.insert(lo, fresh);
        }

        self.loaded_byte_count = self.extents.iter().map(ByteRangeBuffer::length).sum();
        Ok(self.loaded_byte_count - before)
    }

    pub fn get_loaded_bytes(&self) -> usize {
        self.loaded_byte_count
    }

    pub fn get_databin_length_if_known(&self) -> Option<usize> {
        self.known_total_length
    }

    /// True once a single extent spans the whole declared length.
    pub fn is_all_databin_loaded(&self) -> bool {
        match self.known_total_length {
            Some(0) => true,
            Some(known) => {
                self.extents.len() == 1
                    && self.extents[0].start() == 0
                    && self.extents[0].end() == known
            }
            None => false,
        }
    }

    /// The currently buffered ranges as `(start, end)` pairs.
    pub fn get_existing_ranges(&self) -> Vec<(usize, usize)> {
        self.extents.iter().map(|e| (e.start(), e.end())).collect()
    }

    /// End of the contiguous prefix starting at byte zero, or zero when the
    /// first byte has not arrived.
    pub fn loaded_prefix_end(&self) -> usize {
        match self.extents.first() {
            Some(extent) if extent.start() == 0 => extent.end(),
            _ => 0,
        }
    }

    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let idx = self.extents.partition_point(|e| e.end() <= offset);
        self.extents.get(idx).and_then(|e| e.byte_at(offset))
    }

    fn is_range_loaded(&self, start: usize, length: usize) -> bool {
        if length == 0 {
            return true;
        }
        let idx = self.extents.partition_point(|e| e.end() <= start);
        match self.extents.get(idx) {
            Some(extent) => extent.start() <= start && extent.end() >= start + length,
            None => false,
        }
    }

    /// Copies bytes into `dest` at `dest_offset`, growing `dest` as needed.
    ///
    /// Under `force_copy_all_range` the copy is all-or-nothing: the call
    /// reports `None` and copies nothing unless the whole requested range is
    /// buffered. Otherwise the maximal contiguously available prefix of the
    /// request is copied and its length returned.
    pub fn copy_bytes(
        &self,
        dest: &mut Vec<u8>,
        dest_offset: usize,
        options: &CopyBytesOptions,
    ) -> Option<usize> {
        let start = options.databin_start_offset;
        let requested = match options.max_length_to_copy {
            Some(max) => Some(max),
            None => self
                .known_total_length
                .map(|known| known.saturating_sub(start)),
        };

        let copy_length = if options.force_copy_all_range {
            let requested = requested?;
            if !self.is_range_loaded(start, requested) {
                return None;
            }
            requested
        } else {
            let idx = self.extents.partition_point(|e| e.end() <= start);
            let available = match self.extents.get(idx) {
                Some(extent) if extent.start() <= start => extent.end() - start,
                _ => 0,
            };
            match requested {
                Some(max) => available.min(max),
                None => available,
            }
        };

        if dest.len() < dest_offset + copy_length {
            dest.resize(dest_offset + copy_length, 0);
        }
        let mut copier = |absolute: usize, slice: &[u8]| {
            let at = dest_offset + (absolute - start);
            dest[at..at + slice.len()].copy_from_slice(slice);
        };
        self.for_each_loaded_range(start, copy_length, &mut copier);
        Some(copy_length)
    }

    /// Calls `f` for every buffered slice intersecting the window, with its
    /// absolute data-bin offset. The composite-array form of copy-out.
    pub fn for_each_loaded_range<F: FnMut(usize, &[u8])>(
        &self,
        start: usize,
        length: usize,
        f: &mut F,
    ) {
        let to = start + length;
        for extent in &self.extents {
            if extent.end() > start && extent.start() < to {
                extent.for_each_slice(start, to, f);
            }
        }
    }

    pub fn add_listener(&mut self, id: ListenerId, listener: Rc<dyn DataArrivedListener>) {
        self.listeners.push((id, listener));
    }

    /// Removes a listener by id in O(1); reports whether it was present.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        match self.listeners.iter().position(|(lid, _)| *lid == id) {
            Some(index) => {
                self.listeners.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn listeners(&self) -> Vec<Rc<dyn DataArrivedListener>> {
        self.listeners
            .iter()
            .map(|(_, listener)| Rc::clone(listener))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn precinct_bin() -> Databin {
        Databin::new(DatabinClass::Precinct, 7)
    }

    #[test]
    fn test_overlapping_messages_merge_to_one_extent() {
        // Three overlapping ranges, [0,10) [5,20) [15,25), in every order.
        let ranges: [(usize, Vec<u8>); 3] = [
            (0, (0..10).collect()),
            (5, (5..20).collect()),
            (15, (15..25).collect()),
        ];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in &orders {
            let mut bin = precinct_bin();
            for &i in order {
                let (offset, bytes) = &ranges[i];
                bin.save(*offset, bytes, false).unwrap();
            }
            assert_eq!(bin.get_existing_ranges(), vec![(0, 25)]);
            assert_eq!(bin.get_loaded_bytes(), 25);
            for offset in 0..25 {
                assert_eq!(bin.byte_at(offset), Some(offset as u8));
            }
        }
    }

    #[test]
    fn test_resave_is_idempotent() {
        let mut bin = precinct_bin();
        assert_eq!(bin.save(3, &[1, 2, 3, 4], false).unwrap(), 4);
        assert_eq!(bin.save(3, &[1, 2, 3, 4], false).unwrap(), 0);
        assert_eq!(bin.get_loaded_bytes(), 4);
        assert_eq!(bin.get_existing_ranges(), vec![(3, 7)]);
    }

    #[test]
    fn test_adjacent_ranges_coalesce() {
        let mut bin = precinct_bin();
        bin.save(0, &[0, 1], false).unwrap();
        bin.save(4, &[4, 5], false).unwrap();
        assert_eq!(bin.get_existing_ranges(), vec![(0, 2), (4, 6)]);
        bin.save(2, &[2, 3], false).unwrap();
        assert_eq!(bin.get_existing_ranges(), vec![(0, 6)]);
        assert_eq!(bin.loaded_prefix_end(), 6);
    }

    #[test]
    fn test_known_length_and_all_loaded() {
        let mut bin = precinct_bin();
        bin.save(4, &[4, 5, 6, 7], true).unwrap();
        assert_eq!(bin.get_databin_length_if_known(), Some(8));
        assert!(!bin.is_all_databin_loaded());
        bin.save(0, &[0, 1, 2, 3], false).unwrap();
        assert!(bin.is_all_databin_loaded());

        let conflict = bin.save(4, &[4, 5, 6], true);
        assert!(conflict.is_err());
    }

    #[test]
    fn test_empty_databin_with_zero_length_is_loaded() {
        let mut bin = Databin::new(DatabinClass::TileHeader, 0);
        bin.save(0, &[], true).unwrap();
        assert_eq!(bin.get_databin_length_if_known(), Some(0));
        assert!(bin.is_all_databin_loaded());
    }

    #[test]
    fn test_forced_copy_is_all_or_nothing() {
        let mut bin = precinct_bin();
        bin.save(0, &[10, 11, 12], false).unwrap();
        bin.save(5, &[15, 16], false).unwrap();

        let mut dest = Vec::new();
        let forced = CopyBytesOptions {
            databin_start_offset: 0,
            max_length_to_copy: Some(6),
            force_copy_all_range: true,
        };
        assert_eq!(bin.copy_bytes(&mut dest, 0, &forced), None);
        assert!(dest.is_empty());

        bin.save(3, &[13, 14], false).unwrap();
        assert_eq!(bin.copy_bytes(&mut dest, 0, &forced), Some(6));
        assert_eq!(dest, vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_unforced_copy_returns_available_prefix() {
        let mut bin = precinct_bin();
        bin.save(0, &[1, 2, 3], false).unwrap();
        bin.save(7, &[9], false).unwrap();

        let mut dest = Vec::new();
        let copied = bin.copy_bytes(
            &mut dest,
            0,
            &CopyBytesOptions {
                databin_start_offset: 0,
                max_length_to_copy: Some(10),
                force_copy_all_range: false,
            },
        );
        assert_eq!(copied, Some(3));
        assert_eq!(&dest[..3], &[1, 2, 3]);
    }

    #[test]
    fn test_listener_removal_by_id() {
        struct Quiet;
        impl DataArrivedListener for Quiet {
            fn data_arrived(&self, _databin: &Databin) {}
        }

        let mut bin = precinct_bin();
        bin.add_listener(1, Rc::new(Quiet));
        bin.add_listener(2, Rc::new(Quiet));
        assert!(bin.remove_listener(1));
        assert!(!bin.remove_listener(1));
        assert!(bin.has_listeners());
        assert!(bin.remove_listener(2));
        assert!(!bin.has_listeners());
    }
}
