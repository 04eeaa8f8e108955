//! A64 disassembly for the list command and the stop-time pane

use yaxpeax_arch::{Arch, Decoder, U8Reader};
use yaxpeax_arm::armv8::a64::ARMv8;

/// Render one instruction word, or None if it does not decode
pub fn disasm(bytes: [u8; 4]) -> Option<String> {
    let decoder = <ARMv8 as Arch>::Decoder::default();
    let mut reader = U8Reader::new(&bytes[..]);
    match decoder.decode(&mut reader) {
        Ok(instruction) => Some(instruction.to_string()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::disasm;

    #[test]
    pub fn when_decode_ret_then_mnemonic_is_printed() {
        let text = disasm(0xD65F03C0u32.to_le_bytes()).unwrap();
        assert!(text.contains("ret"), "got {}", text);
    }

    #[test]
    pub fn when_decode_branch_and_link_then_mnemonic_is_printed() {
        let text = disasm(0x94000010u32.to_le_bytes()).unwrap();
        assert!(text.starts_with("bl"), "got {}", text);
    }
}
