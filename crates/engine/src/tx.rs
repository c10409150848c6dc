use crate::events::LogEvent;
use crate::Error;
use fields::{Arena, FieldMap, Value};
use std::fmt;
use std::ops::BitOr;

/// Status code reported with a block when no `status` action has run.
pub const DEFAULT_BLOCK_STATUS: u16 = 403;

/// TxFlags is the transaction's bit-set of flags. Block flags are
/// monotonic-additive: once set, a flag is never cleared for the life of the
/// transaction, so a later advisory block cannot demote an earlier immediate
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxFlags(u32);

impl TxFlags {
    pub const NONE: TxFlags = TxFlags(0);
    pub const SUSPICIOUS: TxFlags = TxFlags(1 << 0);
    pub const BLOCK_ADVISORY: TxFlags = TxFlags(1 << 1);
    pub const BLOCK_PHASE: TxFlags = TxFlags(1 << 2);
    pub const BLOCK_IMMEDIATE: TxFlags = TxFlags(1 << 3);

    pub fn set(&mut self, flags: TxFlags) {
        self.0 |= flags.0;
    }

    pub fn contains(&self, flags: TxFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for TxFlags {
    type Output = TxFlags;

    fn bitor(self, rhs: TxFlags) -> TxFlags {
        TxFlags(self.0 | rhs.0)
    }
}

/// How a block action takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Note the block in flags and the DPI, but keep processing.
    Advisory,
    /// Finish the current phase, then block.
    Phase,
    /// Stop processing further rules and block.
    Immediate,
}

/// Intervention is the verdict reported to the host: exactly one of these
/// per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    None,
    Advise(u16),
    Block(u16),
}

/// Transaction is the per-request context: the DPI, flags, the block
/// status, and the buffered log events. It borrows the caller-owned arena;
/// dropping the arena after the transaction releases every allocation made
/// in its scope.
pub struct Transaction<'a> {
    id: u64,
    arena: &'a Arena,
    pub data: FieldMap<'a>,
    flags: TxFlags,
    block_status: u16,
    events: Vec<LogEvent>,
    bytes_in: u64,
    bytes_out: u64,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("block_status", &self.block_status)
            .field("fields", &self.data.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(id: u64, arena: &'a Arena) -> Transaction<'a> {
        Transaction {
            id,
            arena,
            data: FieldMap::new(),
            flags: TxFlags::NONE,
            block_status: DEFAULT_BLOCK_STATUS,
            events: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The arena every transaction-scoped allocation must come from.
    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    pub fn flags(&self) -> TxFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: TxFlags) {
        self.flags.set(flags);
    }

    pub fn block_status(&self) -> u16 {
        self.block_status
    }

    pub fn set_block_status(&mut self, status: u16) {
        self.block_status = status;
    }

    /// Apply a block action. Flags accumulate; the strongest one set wins at
    /// resolution time.
    pub fn block(&mut self, mode: BlockMode) -> Result<(), Error> {
        match mode {
            BlockMode::Advisory => {
                self.flags.set(TxFlags::BLOCK_ADVISORY);
                // Surface the advisory in the DPI for rules to read.
                // Re-bind rather than add, so repeated advisories are
                // idempotent.
                self.data.remove("TX.BLOCK");
                self.data.add_num("TX.BLOCK", 1, self.arena)?;
            }
            BlockMode::Phase => self.flags.set(TxFlags::BLOCK_PHASE),
            BlockMode::Immediate => self.flags.set(TxFlags::BLOCK_IMMEDIATE),
        }
        Ok(())
    }

    /// Resolve the intervention from the accumulated flags. Immediate and
    /// phase blocks report Block; an advisory alone reports Advise.
    pub fn intervention(&self) -> Intervention {
        if self.flags.contains(TxFlags::BLOCK_IMMEDIATE) || self.flags.contains(TxFlags::BLOCK_PHASE)
        {
            Intervention::Block(self.block_status)
        } else if self.flags.contains(TxFlags::BLOCK_ADVISORY) {
            Intervention::Advise(self.block_status)
        } else {
            Intervention::None
        }
    }

    pub fn push_event(&mut self, event: LogEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<LogEvent> {
        std::mem::take(&mut self.events)
    }

    /// Account request-side bytes and mirror the running total in the DPI.
    pub fn data_in(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.bytes_in += buf.len() as u64;
        self.set_counter("bytes_in", self.bytes_in)
    }

    /// Account response-side bytes.
    pub fn data_out(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.bytes_out += buf.len() as u64;
        self.set_counter("bytes_out", self.bytes_out)
    }

    fn set_counter(&mut self, name: &str, n: u64) -> Result<(), Error> {
        match self.data.get_mut(name) {
            Some(field) => field.setv(Value::Num(n as i64))?,
            None => self.data.add_num(name, n as i64, self.arena)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{BlockMode, Intervention, Transaction, TxFlags, DEFAULT_BLOCK_STATUS};
    use fields::{Arena, Value};

    #[test]
    fn test_flags() {
        let mut flags = TxFlags::NONE;
        assert!(!flags.contains(TxFlags::SUSPICIOUS));

        flags.set(TxFlags::SUSPICIOUS);
        flags.set(TxFlags::BLOCK_PHASE);
        assert!(flags.contains(TxFlags::SUSPICIOUS | TxFlags::BLOCK_PHASE));
        assert!(!flags.contains(TxFlags::BLOCK_ADVISORY));
    }

    #[test]
    fn test_block_transitions_are_monotonic() {
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        assert_eq!(tx.intervention(), Intervention::None);

        tx.block(BlockMode::Advisory).unwrap();
        assert_eq!(tx.intervention(), Intervention::Advise(DEFAULT_BLOCK_STATUS));
        assert!(matches!(
            tx.data.get("TX.BLOCK").unwrap().value().unwrap(),
            Value::Num(1)
        ));

        tx.block(BlockMode::Immediate).unwrap();
        assert_eq!(tx.intervention(), Intervention::Block(DEFAULT_BLOCK_STATUS));

        // A later advisory cannot clear the immediate block.
        tx.block(BlockMode::Advisory).unwrap();
        assert_eq!(tx.intervention(), Intervention::Block(DEFAULT_BLOCK_STATUS));
        assert!(tx
            .flags()
            .contains(TxFlags::BLOCK_ADVISORY | TxFlags::BLOCK_IMMEDIATE));
    }

    #[test]
    fn test_phase_block_reports_block() {
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        tx.set_block_status(503);
        tx.block(BlockMode::Phase).unwrap();
        assert_eq!(tx.intervention(), Intervention::Block(503));
    }

    #[test]
    fn test_data_counters() {
        let arena = Arena::new();
        let mut tx = Transaction::new(1, &arena);
        tx.data_in(b"abcd").unwrap();
        tx.data_in(b"ef").unwrap();
        tx.data_out(b"xyz").unwrap();

        assert!(matches!(
            tx.data.get("bytes_in").unwrap().value().unwrap(),
            Value::Num(6)
        ));
        assert!(matches!(
            tx.data.get("bytes_out").unwrap().value().unwrap(),
            Value::Num(3)
        ));
    }
}
