//! Transactional bit cursor over a partially received data-bin.
//!
//! Packet-header parsing is incremental: a parse attempt may run out of
//! buffered bytes half way through, in which case everything it consumed must
//! be un-consumed so the attempt can be repeated verbatim after more data
//! arrives. Rather than closures over loop state, the rollback is an explicit
//! versioned cell: each cell remembers its committed value plus the value
//! written under the last-touching transaction token, and resolves the
//! pending value lazily once that transaction's fate is known.

use crate::CodestreamError;
use jpip::Databin;
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Shared fate token of one transaction. Cells touched under the token keep
/// a clone and check it on their next access.
#[derive(Debug, Clone)]
pub struct Transaction(Rc<Cell<TransactionState>>);

impl Transaction {
    fn new() -> Self {
        Transaction(Rc::new(Cell::new(TransactionState::Active)))
    }

    fn commit(&self) {
        debug_assert_eq!(self.0.get(), TransactionState::Active);
        self.0.set(TransactionState::Committed);
    }

    fn abort(&self) {
        debug_assert_eq!(self.0.get(), TransactionState::Active);
        self.0.set(TransactionState::Aborted);
    }

    pub fn is_active(&self) -> bool {
        self.0.get() == TransactionState::Active
    }
}

/// A value with read-as-of-last-commit semantics.
///
/// At most one transaction is active at a time per owning reader, so a cell
/// never holds more than one pending value.
#[derive(Debug)]
pub struct TransactionalCell<T: Copy> {
    committed: T,
    pending: Option<(Transaction, T)>,
}

impl<T: Copy> TransactionalCell<T> {
    pub fn new(value: T) -> Self {
        TransactionalCell {
            committed: value,
            pending: None,
        }
    }

    fn resolve(&mut self) {
        if let Some((transaction, value)) = &self.pending {
            match transaction.0.get() {
                TransactionState::Active => {}
                TransactionState::Committed => {
                    self.committed = *value;
                    self.pending = None;
                }
                TransactionState::Aborted => {
                    self.pending = None;
                }
            }
        }
    }

    /// The value as seen by the active transaction, or the committed value
    /// when none is active.
    pub fn get(&mut self) -> T {
        self.resolve();
        match &self.pending {
            Some((_, value)) => *value,
            None => self.committed,
        }
    }

    pub fn set(&mut self, transaction: &Transaction, value: T) {
        self.resolve();
        debug_assert!(transaction.is_active());
        self.pending = Some((transaction.clone(), value));
    }

    /// Overwrites the committed value directly, outside any transaction.
    pub fn set_committed(&mut self, value: T) {
        self.resolve();
        debug_assert!(self.pending.is_none());
        self.committed = value;
    }
}

/// Cursor state: next byte, bits already consumed from it, and whether the
/// previous raw byte was 0xFF (which makes the next byte a stuffed one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitstreamPosition {
    pub byte_offset: usize,
    bits_consumed: u8,
    previous_byte_was_0xff: bool,
}

impl BitstreamPosition {
    pub fn at_byte(byte_offset: usize) -> Self {
        BitstreamPosition {
            byte_offset,
            bits_consumed: 0,
            previous_byte_was_0xff: false,
        }
    }

    /// True when the cursor sits on a byte boundary.
    pub fn is_byte_aligned(&self) -> bool {
        self.bits_consumed == 0
    }
}

/// Transactional bit reader bound to one data-bin.
///
/// Every read either succeeds against already-buffered bytes or fails with
/// `InsufficientData` immediately, never blocking. Reads are only legal
/// inside a transaction; abort rewinds the cursor to the last commit.
pub struct BitstreamReader {
    position: TransactionalCell<BitstreamPosition>,
    active: Option<Transaction>,
}

impl BitstreamReader {
    pub fn new(start_byte_offset: usize) -> Self {
        BitstreamReader {
            position: TransactionalCell::new(BitstreamPosition::at_byte(start_byte_offset)),
            active: None,
        }
    }

    pub fn start_transaction(&mut self) -> Result<(), CodestreamError> {
        if let Some(transaction) = &self.active {
            if transaction.is_active() {
                return Err(CodestreamError::TransactionMisuse {
                    reason: "transaction started while another is active",
                });
            }
        }
        self.active = Some(Transaction::new());
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), CodestreamError> {
        match self.active.take() {
            Some(transaction) if transaction.is_active() => {
                transaction.commit();
                Ok(())
            }
            _ => Err(CodestreamError::TransactionMisuse {
                reason: "commit without an active transaction",
            }),
        }
    }

    pub fn abort(&mut self) -> Result<(), CodestreamError> {
        match self.active.take() {
            Some(transaction) if transaction.is_active() => {
                transaction.abort();
                Ok(())
            }
            _ => Err(CodestreamError::TransactionMisuse {
                reason: "abort without an active transaction",
            }),
        }
    }

    /// The active transaction token, for cells that roll back with this
    /// reader (tag tree nodes).
    pub fn transaction(&self) -> Result<Transaction, CodestreamError> {
        match &self.active {
            Some(transaction) if transaction.is_active() => Ok(transaction.clone()),
            _ => Err(CodestreamError::TransactionMisuse {
                reason: "read outside a transaction",
            }),
        }
    }

    pub fn position(&mut self) -> BitstreamPosition {
        self.position.get()
    }

    /// Moves the cursor to a byte boundary, discarding bit state. Used for
    /// SOP/EPH segments and packet bodies, which live outside the packet
    /// header's bit semantics.
    pub fn seek_to_byte(&mut self, byte_offset: usize) -> Result<(), CodestreamError> {
        let transaction = self.transaction()?;
        self.position
            .set(&transaction, BitstreamPosition::at_byte(byte_offset));
        Ok(())
    }

    pub fn shift_bit(&mut self, databin: &Databin) -> Result<u8, CodestreamError> {
        let transaction = self.transaction()?;
        let mut position = self.position.get();
        let byte = databin
            .byte_at(position.byte_offset)
            .ok_or(CodestreamError::InsufficientData)?;
        if position.bits_consumed == 0 && position.previous_byte_was_0xff {
            // B.10.1: the byte after 0xFF carries a stuffed zero in its most
            // significant bit.
            if byte & 0x80 != 0 {
                return Err(CodestreamError::BitStuffingViolation {
                    byte_offset: position.byte_offset,
                });
            }
            position.bits_consumed = 1;
        }
        let bit = (byte >> (7 - position.bits_consumed)) & 1;
        position.bits_consumed += 1;
        if position.bits_consumed == 8 {
            position.previous_byte_was_0xff = byte == 0xFF;
            position.byte_offset += 1;
            position.bits_consumed = 0;
        }
        self.position.set(&transaction, position);
        Ok(bit)
    }

    pub fn shift_bits(&mut self, databin: &Databin, count: u8) -> Result<u32, CodestreamError> {
        debug_assert!(count <= 32);
        let mut value: u32 = 0;
        for _ in 0..count {
            value = (value << 1) | u32::from(self.shift_bit(databin)?);
        }
        Ok(value)
    }

    /// Consumes the run of one bits and its terminating zero, up to `max`
    /// ones; at `max` the terminating zero is left unread.
    pub fn count_ones_until_zero(
        &mut self,
        databin: &Databin,
        max: u32,
    ) -> Result<u32, CodestreamError> {
        let mut ones = 0;
        while ones < max {
            if self.shift_bit(databin)? == 0 {
                return Ok(ones);
            }
            ones += 1;
        }
        Ok(ones)
    }

    pub fn count_zeros_until_one(
        &mut self,
        databin: &Databin,
        max: u32,
    ) -> Result<u32, CodestreamError> {
        let mut zeros = 0;
        while zeros < max {
            if self.shift_bit(databin)? == 1 {
                return Ok(zeros);
            }
            zeros += 1;
        }
        Ok(zeros)
    }

    /// Byte-aligns the cursor at packet boundaries, discarding the rest of
    /// the current byte.
    pub fn shift_remaining_bits_in_byte(
        &mut self,
        databin: &Databin,
    ) -> Result<(), CodestreamError> {
        let transaction = self.transaction()?;
        let mut position = self.position.get();
        if position.bits_consumed == 0 {
            return Ok(());
        }
        // The byte is partially consumed, so it is certainly buffered.
        let byte = databin
            .byte_at(position.byte_offset)
            .ok_or(CodestreamError::InsufficientData)?;
        position.previous_byte_was_0xff = byte == 0xFF;
        position.byte_offset += 1;
        position.bits_consumed = 0;
        self.position.set(&transaction, position);
        Ok(())
    }
}
