//! Execution of compressed (Zca + Zcb) instructions.
//!
//! Compressed instructions have a 3-bit field for the popular registers,
//! which correspond to x8 to x15 (f8 to f15 for the FP forms).

use crate::exception::Exception;
use crate::hart::Hart;
use crate::primitives::bits::sign_extend;
use crate::primitives::constants::{BYTE, DOUBLEWORD, HALFWORD, WORD};

/// Execute one 16-bit parcel. `pc` has already been advanced by 2; jumps
/// and branches overwrite it.
pub fn execute_compressed(hart: &mut Hart, inst: u64) -> Result<(), Exception> {
    if inst == 0 {
        // Defined illegal instruction, since all bits are 0.
        return Err(Exception::IllegalInstruction(inst));
    }
    let opcode = inst & 0x3;
    let funct3 = (inst >> 13) & 0x7;
    match opcode {
        0 => quadrant0(hart, inst, funct3),
        1 => quadrant1(hart, inst, funct3),
        2 => quadrant2(hart, inst, funct3),
        _ => unreachable!("32-bit parcels are decoded elsewhere"),
    }
}

fn quadrant0(hart: &mut Hart, inst: u64, funct3: u64) -> Result<(), Exception> {
    let rd = ((inst >> 2) & 0x7) + 8;
    let rs1 = ((inst >> 7) & 0x7) + 8;
    let rs2 = rd;
    match funct3 {
        0x0 => {
            // c.addi4spn
            // Expands to addi rd, x2, nzuimm, where rd=rd'+8.
            // nzuimm[5:4|9:6|2|3] = inst[12:11|10:7|6|5]
            let nzuimm = ((inst >> 1) & 0x3c0)
                | ((inst >> 7) & 0x30)
                | ((inst >> 2) & 0x8)
                | ((inst >> 4) & 0x4);
            if nzuimm == 0 {
                return Err(Exception::IllegalInstruction(inst));
            }
            hart.wx(rd, hart.rx(2).wrapping_add(nzuimm));
        }
        0x1 => {
            // c.fld
            // Expands to fld rd, offset(rs1).
            hart.require_fp(inst)?;
            // offset[5:3|7:6] = inst[12:10|6:5]
            let offset = ((inst << 1) & 0xc0) | ((inst >> 7) & 0x38);
            let val = hart.load(hart.rx(rs1).wrapping_add(offset), DOUBLEWORD)?;
            hart.fregs.write_f64_bits(rd, val);
            hart.set_fs_dirty();
        }
        0x2 => {
            // c.lw
            // Expands to lw rd, offset(rs1).
            // offset[5:3|2|6] = inst[12:10|6|5]
            let offset = ((inst << 1) & 0x40) | ((inst >> 7) & 0x38) | ((inst >> 4) & 0x4);
            let val = hart.load(hart.rx(rs1).wrapping_add(offset), WORD)?;
            hart.wx(rd, val as i32 as i64 as u64);
        }
        0x3 => {
            if hart.rv64 {
                // c.ld
                let offset = ((inst << 1) & 0xc0) | ((inst >> 7) & 0x38);
                let val = hart.load(hart.rx(rs1).wrapping_add(offset), DOUBLEWORD)?;
                hart.wx(rd, val);
            } else {
                // c.flw
                hart.require_fp(inst)?;
                let offset = ((inst << 1) & 0x40) | ((inst >> 7) & 0x38) | ((inst >> 4) & 0x4);
                let val = hart.load(hart.rx(rs1).wrapping_add(offset), WORD)?;
                hart.fregs.write_f32_bits(rd, val as u32);
                hart.set_fs_dirty();
            }
        }
        0x4 => {
            // Zcb byte/halfword loads and stores.
            let sel = (inst >> 10) & 0x7;
            match sel {
                0x0 => {
                    // c.lbu; uimm[0|1] = inst[6|5]
                    let offset = ((inst >> 6) & 1) | ((inst >> 4) & 2);
                    let val = hart.load(hart.rx(rs1).wrapping_add(offset), BYTE)?;
                    hart.wx(rd, val);
                }
                0x1 => {
                    // c.lhu / c.lh; uimm[1] = inst[5], inst[6] picks sign
                    let offset = (inst >> 4) & 2;
                    let val = hart.load(hart.rx(rs1).wrapping_add(offset), HALFWORD)?;
                    if inst & 0x40 == 0 {
                        hart.wx(rd, val);
                    } else {
                        hart.wx(rd, val as i16 as i64 as u64);
                    }
                }
                0x2 => {
                    // c.sb
                    let offset = ((inst >> 6) & 1) | ((inst >> 4) & 2);
                    hart.store(hart.rx(rs1).wrapping_add(offset), hart.rx(rs2), BYTE)?;
                }
                0x3 => {
                    // c.sh; inst[6] set is reserved
                    if inst & 0x40 != 0 {
                        return Err(Exception::IllegalInstruction(inst));
                    }
                    let offset = (inst >> 4) & 2;
                    hart.store(hart.rx(rs1).wrapping_add(offset), hart.rx(rs2), HALFWORD)?;
                }
                _ => return Err(Exception::IllegalInstruction(inst)),
            }
        }
        0x5 => {
            // c.fsd
            hart.require_fp(inst)?;
            let offset = ((inst << 1) & 0xc0) | ((inst >> 7) & 0x38);
            hart.store(
                hart.rx(rs1).wrapping_add(offset),
                hart.fregs.read_raw(rs2),
                DOUBLEWORD,
            )?;
        }
        0x6 => {
            // c.sw
            let offset = ((inst << 1) & 0x40) | ((inst >> 7) & 0x38) | ((inst >> 4) & 0x4);
            hart.store(hart.rx(rs1).wrapping_add(offset), hart.rx(rs2), WORD)?;
        }
        0x7 => {
            if hart.rv64 {
                // c.sd
                let offset = ((inst << 1) & 0xc0) | ((inst >> 7) & 0x38);
                hart.store(hart.rx(rs1).wrapping_add(offset), hart.rx(rs2), DOUBLEWORD)?;
            } else {
                // c.fsw
                hart.require_fp(inst)?;
                let offset = ((inst << 1) & 0x40) | ((inst >> 7) & 0x38) | ((inst >> 4) & 0x4);
                hart.store(
                    hart.rx(rs1).wrapping_add(offset),
                    hart.fregs.read_raw(rs2) & 0xffff_ffff,
                    WORD,
                )?;
            }
        }
        _ => return Err(Exception::IllegalInstruction(inst)),
    }
    Ok(())
}

fn quadrant1(hart: &mut Hart, inst: u64, funct3: u64) -> Result<(), Exception> {
    let rd = (inst >> 7) & 0x1f;
    match funct3 {
        0x0 => {
            // c.addi (c.nop when rd is x0)
            // imm[5|4:0] = inst[12|6:2]
            let imm = sign_extend(((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f), 6);
            hart.wx(rd, hart.rx(rd).wrapping_add(imm));
        }
        0x1 => {
            if hart.rv64 {
                // c.addiw; rd = x0 is reserved
                if rd == 0 {
                    return Err(Exception::IllegalInstruction(inst));
                }
                let imm = sign_extend(((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f), 6);
                hart.wx(rd, hart.rx(rd).wrapping_add(imm) as i32 as i64 as u64);
            } else {
                // c.jal
                let offset = jump_offset(inst);
                let link = hart.pc;
                hart.pc = hart.canon(hart.exec_pc().wrapping_add(offset));
                hart.wx(1, link);
            }
        }
        0x2 => {
            // c.li
            let imm = sign_extend(((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f), 6);
            hart.wx(rd, imm);
        }
        0x3 => {
            if rd == 2 {
                // c.addi16sp
                // nzimm[9|4|6|8:7|5] = inst[12|6|5|4:3|2]
                let nzimm = sign_extend(
                    ((inst >> 3) & 0x200)
                        | ((inst >> 2) & 0x10)
                        | ((inst << 1) & 0x40)
                        | ((inst << 4) & 0x180)
                        | ((inst << 3) & 0x20),
                    10,
                );
                if nzimm == 0 {
                    return Err(Exception::IllegalInstruction(inst));
                }
                hart.wx(2, hart.rx(2).wrapping_add(nzimm));
            } else {
                // c.lui; nzimm[17|16:12] = inst[12|6:2]
                let nzimm = sign_extend(((inst << 5) & 0x20000) | ((inst << 10) & 0x1f000), 18);
                if nzimm == 0 {
                    return Err(Exception::IllegalInstruction(inst));
                }
                hart.wx(rd, nzimm);
            }
        }
        0x4 => {
            let rd = ((inst >> 7) & 0x7) + 8;
            match (inst >> 10) & 0x3 {
                0x0 => {
                    // c.srli
                    let shamt = ((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f);
                    if !hart.rv64 && shamt >= 32 {
                        return Err(Exception::IllegalInstruction(inst));
                    }
                    let val = if hart.rv64 {
                        hart.rx(rd) >> shamt
                    } else {
                        ((hart.rx(rd) as u32) >> shamt) as u64
                    };
                    hart.wx(rd, val);
                }
                0x1 => {
                    // c.srai
                    let shamt = ((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f);
                    if !hart.rv64 && shamt >= 32 {
                        return Err(Exception::IllegalInstruction(inst));
                    }
                    hart.wx(rd, ((hart.rx(rd) as i64) >> shamt) as u64);
                }
                0x2 => {
                    // c.andi
                    let imm = sign_extend(((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f), 6);
                    hart.wx(rd, hart.rx(rd) & imm);
                }
                _ => {
                    let rs2 = ((inst >> 2) & 0x7) + 8;
                    match ((inst >> 12) & 1, (inst >> 5) & 0x3) {
                        (0, 0x0) => {
                            // c.sub
                            hart.wx(rd, hart.rx(rd).wrapping_sub(hart.rx(rs2)));
                        }
                        (0, 0x1) => {
                            // c.xor
                            hart.wx(rd, hart.rx(rd) ^ hart.rx(rs2));
                        }
                        (0, 0x2) => {
                            // c.or
                            hart.wx(rd, hart.rx(rd) | hart.rx(rs2));
                        }
                        (0, 0x3) => {
                            // c.and
                            hart.wx(rd, hart.rx(rd) & hart.rx(rs2));
                        }
                        (1, 0x0) => {
                            // c.subw
                            if !hart.rv64 {
                                return Err(Exception::IllegalInstruction(inst));
                            }
                            hart.wx(rd, hart.rx(rd).wrapping_sub(hart.rx(rs2)) as i32 as i64 as u64);
                        }
                        (1, 0x1) => {
                            // c.addw
                            if !hart.rv64 {
                                return Err(Exception::IllegalInstruction(inst));
                            }
                            hart.wx(rd, hart.rx(rd).wrapping_add(hart.rx(rs2)) as i32 as i64 as u64);
                        }
                        (1, 0x2) => {
                            // c.mul (Zcb)
                            hart.wx(rd, hart.rx(rd).wrapping_mul(hart.rx(rs2)));
                        }
                        (1, 0x3) => {
                            // Zcb unary group, selected by inst[4:2].
                            match (inst >> 2) & 0x7 {
                                0x0 => hart.wx(rd, hart.rx(rd) & 0xff), // c.zext.b
                                0x1 => hart.wx(rd, hart.rx(rd) as i8 as i64 as u64), // c.sext.b
                                0x2 => hart.wx(rd, hart.rx(rd) as u16 as u64), // c.zext.h
                                0x3 => hart.wx(rd, hart.rx(rd) as i16 as i64 as u64), // c.sext.h
                                0x4 if hart.rv64 => {
                                    // c.zext.w
                                    hart.wx(rd, hart.rx(rd) as u32 as u64);
                                }
                                0x5 => hart.wx(rd, !hart.rx(rd)), // c.not
                                _ => return Err(Exception::IllegalInstruction(inst)),
                            }
                        }
                        _ => return Err(Exception::IllegalInstruction(inst)),
                    }
                }
            }
        }
        0x5 => {
            // c.j
            let offset = jump_offset(inst);
            hart.pc = hart.canon(hart.exec_pc().wrapping_add(offset));
        }
        0x6 => {
            // c.beqz
            let rs1 = ((inst >> 7) & 0x7) + 8;
            if hart.rx(rs1) == 0 {
                hart.pc = hart.canon(hart.exec_pc().wrapping_add(branch_offset(inst)));
            }
        }
        0x7 => {
            // c.bnez
            let rs1 = ((inst >> 7) & 0x7) + 8;
            if hart.rx(rs1) != 0 {
                hart.pc = hart.canon(hart.exec_pc().wrapping_add(branch_offset(inst)));
            }
        }
        _ => return Err(Exception::IllegalInstruction(inst)),
    }
    Ok(())
}

fn quadrant2(hart: &mut Hart, inst: u64, funct3: u64) -> Result<(), Exception> {
    let rd = (inst >> 7) & 0x1f;
    let rs2 = (inst >> 2) & 0x1f;
    match funct3 {
        0x0 => {
            // c.slli
            let shamt = ((inst >> 7) & 0x20) | ((inst >> 2) & 0x1f);
            if !hart.rv64 && shamt >= 32 {
                return Err(Exception::IllegalInstruction(inst));
            }
            hart.wx(rd, hart.rx(rd) << shamt);
        }
        0x1 => {
            // c.fldsp
            hart.require_fp(inst)?;
            // offset[8:6|5|4:3] = inst[4:2|12|6:5]
            let offset = ((inst << 4) & 0x1c0) | ((inst >> 7) & 0x20) | ((inst >> 2) & 0x18);
            let val = hart.load(hart.rx(2).wrapping_add(offset), DOUBLEWORD)?;
            hart.fregs.write_f64_bits(rd, val);
            hart.set_fs_dirty();
        }
        0x2 => {
            // c.lwsp; rd = x0 is reserved
            if rd == 0 {
                return Err(Exception::IllegalInstruction(inst));
            }
            // offset[7:6|5|4:2] = inst[3:2|12|6:4]
            let offset = ((inst << 4) & 0xc0) | ((inst >> 7) & 0x20) | ((inst >> 2) & 0x1c);
            let val = hart.load(hart.rx(2).wrapping_add(offset), WORD)?;
            hart.wx(rd, val as i32 as i64 as u64);
        }
        0x3 => {
            if hart.rv64 {
                // c.ldsp; rd = x0 is reserved
                if rd == 0 {
                    return Err(Exception::IllegalInstruction(inst));
                }
                let offset = ((inst << 4) & 0x1c0) | ((inst >> 7) & 0x20) | ((inst >> 2) & 0x18);
                let val = hart.load(hart.rx(2).wrapping_add(offset), DOUBLEWORD)?;
                hart.wx(rd, val);
            } else {
                // c.flwsp
                hart.require_fp(inst)?;
                let offset = ((inst << 4) & 0xc0) | ((inst >> 7) & 0x20) | ((inst >> 2) & 0x1c);
                let val = hart.load(hart.rx(2).wrapping_add(offset), WORD)?;
                hart.fregs.write_f32_bits(rd, val as u32);
                hart.set_fs_dirty();
            }
        }
        0x4 => {
            match ((inst >> 12) & 1, rd, rs2) {
                (0, 0, _) => return Err(Exception::IllegalInstruction(inst)),
                (0, rs1, 0) => {
                    // c.jr
                    hart.pc = hart.canon(hart.rx(rs1) & !1);
                }
                (0, rd, rs2) => {
                    // c.mv
                    hart.wx(rd, hart.rx(rs2));
                }
                (1, 0, 0) => {
                    // c.ebreak
                    return Err(Exception::Breakpoint(hart.exec_pc()));
                }
                (1, rs1, 0) => {
                    // c.jalr
                    let link = hart.pc;
                    hart.pc = hart.canon(hart.rx(rs1) & !1);
                    hart.wx(1, link);
                }
                (1, rd, rs2) => {
                    // c.add
                    hart.wx(rd, hart.rx(rd).wrapping_add(hart.rx(rs2)));
                }
                _ => return Err(Exception::IllegalInstruction(inst)),
            }
        }
        0x5 => {
            // c.fsdsp
            hart.require_fp(inst)?;
            // offset[8:6|5:3] = inst[9:7|12:10]
            let offset = ((inst >> 1) & 0x1c0) | ((inst >> 7) & 0x38);
            hart.store(
                hart.rx(2).wrapping_add(offset),
                hart.fregs.read_raw(rs2),
                DOUBLEWORD,
            )?;
        }
        0x6 => {
            // c.swsp; offset[7:6|5:2] = inst[8:7|12:9]
            let offset = ((inst >> 1) & 0xc0) | ((inst >> 7) & 0x3c);
            hart.store(hart.rx(2).wrapping_add(offset), hart.rx(rs2), WORD)?;
        }
        0x7 => {
            if hart.rv64 {
                // c.sdsp; offset[8:6|5:3] = inst[9:7|12:10]
                let offset = ((inst >> 1) & 0x1c0) | ((inst >> 7) & 0x38);
                hart.store(hart.rx(2).wrapping_add(offset), hart.rx(rs2), DOUBLEWORD)?;
            } else {
                // c.fswsp
                hart.require_fp(inst)?;
                let offset = ((inst >> 1) & 0xc0) | ((inst >> 7) & 0x3c);
                hart.store(
                    hart.rx(2).wrapping_add(offset),
                    hart.fregs.read_raw(rs2) & 0xffff_ffff,
                    WORD,
                )?;
            }
        }
        _ => return Err(Exception::IllegalInstruction(inst)),
    }
    Ok(())
}

/// The 12-bit c.j/c.jal target offset.
/// offset[11|10|9:8|7|6|5|4|3:1] = inst[12|8|10:9|6|7|2|11|5:3]
fn jump_offset(inst: u64) -> u64 {
    sign_extend(
        ((inst >> 1) & 0x800)
            | ((inst << 2) & 0x400)
            | ((inst >> 1) & 0x300)
            | ((inst << 1) & 0x80)
            | ((inst >> 1) & 0x40)
            | ((inst << 3) & 0x20)
            | ((inst >> 7) & 0x10)
            | ((inst >> 2) & 0xe),
        12,
    )
}

/// The 9-bit c.beqz/c.bnez offset.
/// offset[8|7:6|5|4:3|2:1] = inst[12|6:5|2|11:10|4:3]
fn branch_offset(inst: u64) -> u64 {
    sign_extend(
        ((inst >> 4) & 0x100)
            | ((inst << 1) & 0xc0)
            | ((inst << 3) & 0x20)
            | ((inst >> 7) & 0x18)
            | ((inst >> 2) & 0x6),
        9,
    )
}
