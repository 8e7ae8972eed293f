use std::{collections::BTreeSet, error::Error, fmt};

/// Why a slot request was refused. The two cases are distinct on the wire:
/// a client that asked for too much may retry smaller, a client refused on
/// a full machine should go elsewhere.
#[derive(Debug, PartialEq, Eq)]
pub enum SlotError {
    AllTaken,
    TooFewFree { requested: u32, free: u32 },
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotError::AllTaken => write!(f, "all slots are taken"),
            SlotError::TooFewFree { requested, free } => {
                write!(f, "too few free slots: requested {requested}, free {free}")
            }
        }
    }
}

impl Error for SlotError {}

/// Slot and port-offset accounting. A grant is all-or-nothing: it consumes
/// the requested slot count and exactly one port offset.
#[derive(Debug)]
pub struct SlotPool {
    total: u32,
    taken: u32,
    free_offsets: BTreeSet<u16>,
}

impl SlotPool {
    /// Port offsets run from 1 to `total`, one per possibly-parallel worker.
    pub fn new(total: u32) -> Self {
        Self {
            total,
            taken: 0,
            free_offsets: (1..=total as u16).collect(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn free(&self) -> u32 {
        self.total - self.taken
    }

    /// Grants `slots` slots and the lowest free port offset, or refuses.
    pub fn reserve(&mut self, slots: u32) -> Result<u16, SlotError> {
        if self.taken == self.total {
            return Err(SlotError::AllTaken);
        }
        let free = self.free();
        if slots > free {
            return Err(SlotError::TooFewFree {
                requested: slots,
                free,
            });
        }
        // free() > 0 implies an unused offset remains.
        let offset = *self.free_offsets.iter().next().unwrap();
        self.free_offsets.remove(&offset);
        self.taken += slots;
        Ok(offset)
    }

    /// Returns a grant to the pool.
    pub fn release(&mut self, slots: u32, offset: u16) {
        self.taken = self.taken.saturating_sub(slots);
        self.free_offsets.insert(offset);
    }
}
