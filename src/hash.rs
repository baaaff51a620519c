//! Build command hashing (§3 BuildLog entry, §4.J).
//!
//! A `command_hash` identifies *what command produced an output*, so a
//! BuildLog entry can be compared against the current manifest to decide
//! whether a rule's command line changed since the last successful build.
//! Grounded in the teacher's `hash.rs`, but narrowed to hash only the
//! command string (the spec's BuildLog format has no room for mtimes in
//! the hash — those are compared separately during dependency scanning).

use std::hash::Hasher;

const UNIT_SEPARATOR: u8 = 0x1F;

/// Hashes `command`, mirroring real Ninja's practice of keying a BuildLog
/// entry on the command line text rather than a full content hash.
pub fn hash_command(command: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::hash::Hash::hash(command, &mut hasher);
    hasher.write_u8(UNIT_SEPARATOR);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_command_hashes_equal() {
        assert_eq!(hash_command("cc -c a.c -o a.o"), hash_command("cc -c a.c -o a.o"));
    }

    #[test]
    fn different_commands_hash_differently() {
        assert_ne!(hash_command("cc -c a.c -o a.o"), hash_command("cc -c b.c -o b.o"));
    }
}
