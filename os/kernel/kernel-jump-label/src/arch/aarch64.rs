use super::{Arch, EncodeError, Insn, le_word};
use crate::{CodeAddress, JumpType};
use bitfield_struct::bitfield;

/// AArch64 branch sites: a single `nop` or `b <label>`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Aarch64;

pub const NOP: u32 = 0xd503_201f;

/// `BRK #0x004`.
pub const BRK: u32 = 0xd420_0000 | (0x004 << 5);

/// Unconditional immediate branch, `B imm26`.
///
/// The target is `pc + sign_extend(imm26) * 4`, giving ±128 MiB of reach.
#[bitfield(u32)]
struct BranchImm {
    /// Bits 0-25: word displacement.
    #[bits(26)]
    imm26: u32,
    /// Bits 26-31: `0b000101`.
    #[bits(6)]
    opcode: u8,
}

const B_OPCODE: u8 = 0b00_0101;
const B_REACH: i64 = 1 << 27;

impl Arch for Aarch64 {
    const NAME: &'static str = "aarch64";
    const PROBE_LEN: usize = 4;
    const SITE_LEN: usize = 4;
    const BREAKPOINT: &'static [u8] = &BRK.to_le_bytes();

    fn site_len(probe: &[u8]) -> Result<usize, EncodeError> {
        match le_word(probe) {
            Some(NOP) => Ok(4),
            Some(w) if BranchImm::from_bits(w).opcode() == B_OPCODE => Ok(4),
            _ => Err(EncodeError::UnknownSite),
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn encode(
        ty: JumpType,
        code: CodeAddress,
        target: CodeAddress,
        len: usize,
    ) -> Result<Insn, EncodeError> {
        if len != 4 {
            return Err(EncodeError::UnsupportedWidth(len));
        }
        if ty == JumpType::Nop {
            return Ok(Insn::from_word(NOP));
        }

        let disp = target.displacement_from(code);
        if disp & 0b11 != 0 {
            return Err(EncodeError::MisalignedTarget { disp });
        }
        if !(-B_REACH..B_REACH).contains(&disp) {
            return Err(EncodeError::DisplacementOverflow { disp, len });
        }

        let insn = BranchImm::new()
            .with_imm26(((disp >> 2) as u32) & 0x03ff_ffff)
            .with_opcode(B_OPCODE);
        Ok(Insn::from_word(insn.into_bits()))
    }
}
