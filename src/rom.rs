//! Embedded Boot ROM
//!
//! A 512-word image mapped at the top of the address space; the reset
//! vector points at its first word. The image is opaque to the emulator
//! core, which depends on nothing beyond its size.
//!
//! The stock image sets up a stack, probes the I/O ports once, and parks
//! the CPU. Replace `assets/boot.rom` with a real bootloader (little-endian
//! words, exactly 2048 bytes) to bring up an operating system.

use crate::bus::ROM_WORDS;

const BOOT_IMAGE: &[u8] = include_bytes!("../assets/boot.rom");

const _: () = assert!(BOOT_IMAGE.len() == ROM_WORDS * 4, "boot.rom must be 2048 bytes");

/// Decodes the embedded image into ROM words.
#[must_use]
pub fn boot_rom() -> [u32; ROM_WORDS] {
    let mut words = [0u32; ROM_WORDS];
    for (word, bytes) in words.iter_mut().zip(BOOT_IMAGE.chunks_exact(4)) {
        *word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_rom_has_512_words() {
        assert_eq!(boot_rom().len(), ROM_WORDS);
    }

    #[test]
    fn test_boot_rom_first_word_is_an_instruction() {
        // The image must not lead with an empty word; the machine fetches
        // its very first instruction from here.
        assert_ne!(boot_rom()[0], 0);
    }
}
