use super::{Arch, EncodeError, Insn};
use crate::{CodeAddress, JumpType};

/// x86-64 branch sites.
///
/// Sites are emitted as the five-byte `nopl 0x0(%rax,%rax,1)`. A site may
/// have been shrunk to two bytes at build time when the label is within
/// `rel8` reach; the width is recovered by decoding the site.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct X86_64;

pub const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];
pub const NOP2: [u8; 2] = [0x66, 0x90];

const JMP32: u8 = 0xe9;
const JMP8: u8 = 0xeb;
const INT3: u8 = 0xcc;

impl Arch for X86_64 {
    const NAME: &'static str = "x86_64";
    const PROBE_LEN: usize = 2;
    const SITE_LEN: usize = 5;
    const BREAKPOINT: &'static [u8] = &[INT3];

    fn site_len(probe: &[u8]) -> Result<usize, EncodeError> {
        match probe {
            [JMP8, ..] | [0x66, 0x90, ..] => Ok(2),
            [JMP32, ..] | [0x0f, 0x1f, ..] => Ok(5),
            _ => Err(EncodeError::UnknownSite),
        }
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn encode(
        ty: JumpType,
        code: CodeAddress,
        target: CodeAddress,
        len: usize,
    ) -> Result<Insn, EncodeError> {
        // rel is measured from the end of the instruction
        let disp = target.displacement_from(code + len as u64);
        match (len, ty) {
            (5, JumpType::Nop) => Ok(Insn::from_slice(&NOP5)),
            (2, JumpType::Nop) => Ok(Insn::from_slice(&NOP2)),
            (5, JumpType::Jmp) => {
                let rel = i32::try_from(disp)
                    .map_err(|_| EncodeError::DisplacementOverflow { disp, len })?;
                let [a, b, c, d] = rel.to_le_bytes();
                Ok(Insn::from_slice(&[JMP32, a, b, c, d]))
            }
            (2, JumpType::Jmp) => {
                let rel = i8::try_from(disp)
                    .map_err(|_| EncodeError::DisplacementOverflow { disp, len })?;
                Ok(Insn::from_slice(&[JMP8, rel as u8]))
            }
            _ => Err(EncodeError::UnsupportedWidth(len)),
        }
    }
}
