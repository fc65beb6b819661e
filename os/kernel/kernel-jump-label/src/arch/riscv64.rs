use super::{Arch, EncodeError, Insn, le_word};
use crate::{CodeAddress, JumpType};
use bitfield_struct::bitfield;

/// RISC-V 64 branch sites: `nop` or `jal zero, <label>`.
///
/// Sites are emitted with `.option norvc`, so they are always a full
/// 32-bit word even when the compressed extension is available.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Riscv64;

/// `addi x0, x0, 0`.
pub const NOP: u32 = 0x0000_0013;

pub const EBREAK: u32 = 0x0010_0073;

/// J-type `jal` layout; the immediate is scattered over the upper 20 bits.
#[bitfield(u32)]
struct Jal {
    #[bits(7)]
    opcode: u8,
    #[bits(5)]
    rd: u8,
    #[bits(8)]
    imm_19_12: u8,
    imm_11: bool,
    #[bits(10)]
    imm_10_1: u16,
    imm_20: bool,
}

const JAL_OPCODE: u8 = 0b110_1111;
const JAL_REACH: i64 = 1 << 20;

impl Arch for Riscv64 {
    const NAME: &'static str = "riscv64";
    const PROBE_LEN: usize = 4;
    const SITE_LEN: usize = 4;
    const BREAKPOINT: &'static [u8] = &EBREAK.to_le_bytes();

    fn site_len(probe: &[u8]) -> Result<usize, EncodeError> {
        match le_word(probe).map(Jal::from_bits) {
            Some(w) if w.into_bits() == NOP => Ok(4),
            Some(w) if w.opcode() == JAL_OPCODE && w.rd() == 0 => Ok(4),
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
        if disp & 1 != 0 {
            return Err(EncodeError::MisalignedTarget { disp });
        }
        if !(-JAL_REACH..JAL_REACH).contains(&disp) {
            return Err(EncodeError::DisplacementOverflow { disp, len });
        }

        let imm = disp as u64;
        let insn = Jal::new()
            .with_opcode(JAL_OPCODE)
            .with_rd(0)
            .with_imm_19_12(((imm >> 12) & 0xff) as u8)
            .with_imm_11((imm >> 11) & 1 == 1)
            .with_imm_10_1(((imm >> 1) & 0x3ff) as u16)
            .with_imm_20((imm >> 20) & 1 == 1);
        Ok(Insn::from_word(insn.into_bits()))
    }
}
