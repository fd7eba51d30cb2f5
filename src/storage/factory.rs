//! Factory default programs compiled into the firmware.
//!
//! The blobs are assembled from the `.blk` sources next to them; a test keeps
//! both in sync.

use crate::storage::bytecode_slots::Slot;

static SLOT1: &[u8] = include_bytes!("factory/slot1.bin");
static SLOT2: &[u8] = include_bytes!("factory/slot2.bin");

/// Program a slot runs when nothing usable is stored in it.
pub fn default_program(slot: Slot) -> &'static [u8] {
    match slot {
        Slot::Slot1 => SLOT1,
        Slot::Slot2 => SLOT2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_BYTECODE_SIZE;
    use crate::virtual_machine::assembler::assemble_source;

    #[test]
    fn blobs_match_their_sources() {
        let sources = [
            (Slot::Slot1, include_str!("factory/slot1.blk")),
            (Slot::Slot2, include_str!("factory/slot2.blk")),
        ];
        for (slot, source) in sources {
            let program = assemble_source(source).unwrap();
            assert_eq!(program.to_bytes(), default_program(slot), "{slot} is stale");
        }
    }

    #[test]
    fn defaults_fit_a_slot() {
        for slot in Slot::ALL {
            let program = default_program(slot);
            assert!(!program.is_empty());
            assert!(program.len() <= MAX_BYTECODE_SIZE);
        }
    }
}
