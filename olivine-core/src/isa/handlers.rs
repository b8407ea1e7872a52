//! Registry binding instruction declarations to interpreter handlers.
//!
//! Handlers never read the architectural PC register; the program counter is passed in as a
//! parameter, and PC writes are reported back through the handler's
//! [`Progress`](crate::isa::compile::Progress) return value. The registry marks which handlers
//! may write the PC (`writes_pc`) and which report a taken/not-taken decision (`branching`); the
//! dispatch engine asserts at runtime that handlers stay within their declared behavior, and
//! [`validate`] rejects schema/handler mismatches at startup.

use super::schema::InstructionSet;
use thiserror::Error;

/// Identifier of an interpreter handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Handler {
    // RV32I
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    Sb,
    Sh,
    Sw,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    // RV64I
    Lwu,
    Ld,
    Sd,
    Addiw,
    Slliw,
    Srliw,
    Sraiw,
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    // M
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,
    // A
    Lr { double: bool },
    Sc { double: bool },
    Amo { op: AmoOp, double: bool },
    // Zicsr
    Csr { op: CsrOp, immediate: bool },
    // Privileged
    Sret,
    Mret,
    Wfi,
    SfenceVma,
    // Compressed instructions without a direct 32-bit equivalent
    CAddi4spn,
    CLi,
    CLui,
    CAddi16sp,
    CJ,
    CJr,
    CJalr,
    CBeqz,
    CBnez,
    CMv,
    CLwsp,
    CLdsp,
    CSwsp,
    CSdsp,
}

/// The atomic-memory-operation flavors of the A extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

/// The CSR access flavors of the Zicsr extension.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsrOp {
    /// Atomic Read/Write CSR.
    ReadWrite,
    /// Atomic Read and Set Bits in CSR.
    ReadSet,
    /// Atomic Read and Clear Bits in CSR.
    ReadClear,
}

/// A handler parameter, filled in by the compiled decoder at each leaf.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Param {
    /// An argument field of the declaration, by name.
    Field(&'static str),
    /// The program counter of the instruction.
    Pc,
    /// The instruction size in bytes.
    Size,
}

/// Static description of one handler.
#[derive(Debug, Copy, Clone)]
pub struct HandlerSpec {
    pub handler: Handler,
    pub params: &'static [Param],
    /// The handler unconditionally writes the PC; the trace exits after it.
    pub writes_pc: bool,
    /// The handler conditionally writes the PC (branches); it reports taken/not-taken.
    pub branching: bool,
}

macro_rules! handler_table {
    ( $( $name:literal => $handler:expr, [ $($param:expr),* ], $writes_pc:expr, $branching:expr; )* ) => {
        /// Look up the handler bound to declaration `name`.
        pub fn lookup(name: &str) -> Option<HandlerSpec> {
            use Param::*;
            match name {
                $(
                    $name => Some(HandlerSpec {
                        handler: $handler,
                        params: &[ $($param),* ],
                        writes_pc: $writes_pc,
                        branching: $branching,
                    }),
                )*
                _ => None,
            }
        }
    };
}

handler_table! {
    "LUI" => Handler::Lui, [Field("rd"), Field("uimm")], false, false;
    "AUIPC" => Handler::Auipc, [Field("rd"), Field("uimm"), Pc], false, false;
    "JAL" => Handler::Jal, [Field("rd"), Field("jimm"), Pc, Size], true, false;
    "JALR" => Handler::Jalr, [Field("rd"), Field("rs1"), Field("imm"), Pc, Size], true, false;
    "BEQ" => Handler::Beq, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "BNE" => Handler::Bne, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "BLT" => Handler::Blt, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "BGE" => Handler::Bge, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "BLTU" => Handler::Bltu, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "BGEU" => Handler::Bgeu, [Field("rs1"), Field("rs2"), Field("bimm"), Pc], false, true;
    "LB" => Handler::Lb, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "LH" => Handler::Lh, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "LW" => Handler::Lw, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "LBU" => Handler::Lbu, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "LHU" => Handler::Lhu, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SB" => Handler::Sb, [Field("rs2"), Field("rs1"), Field("simm")], false, false;
    "SH" => Handler::Sh, [Field("rs2"), Field("rs1"), Field("simm")], false, false;
    "SW" => Handler::Sw, [Field("rs2"), Field("rs1"), Field("simm")], false, false;
    "ADDI" => Handler::Addi, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SLTI" => Handler::Slti, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SLTIU" => Handler::Sltiu, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "XORI" => Handler::Xori, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "ORI" => Handler::Ori, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "ANDI" => Handler::Andi, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SLLI" => Handler::Slli, [Field("rd"), Field("rs1"), Field("shamt6")], false, false;
    "SRLI" => Handler::Srli, [Field("rd"), Field("rs1"), Field("shamt6")], false, false;
    "SRAI" => Handler::Srai, [Field("rd"), Field("rs1"), Field("shamt6")], false, false;
    "ADD" => Handler::Add, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SUB" => Handler::Sub, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SLL" => Handler::Sll, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SLT" => Handler::Slt, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SLTU" => Handler::Sltu, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "XOR" => Handler::Xor, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SRL" => Handler::Srl, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SRA" => Handler::Sra, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "OR" => Handler::Or, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AND" => Handler::And, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "FENCE" => Handler::Fence, [], false, false;
    "FENCE.I" => Handler::FenceI, [], false, false;
    "ECALL" => Handler::Ecall, [], false, false;
    "EBREAK" => Handler::Ebreak, [], false, false;
    "LWU" => Handler::Lwu, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "LD" => Handler::Ld, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SD" => Handler::Sd, [Field("rs2"), Field("rs1"), Field("simm")], false, false;
    "ADDIW" => Handler::Addiw, [Field("rd"), Field("rs1"), Field("imm")], false, false;
    "SLLIW" => Handler::Slliw, [Field("rd"), Field("rs1"), Field("shamt5")], false, false;
    "SRLIW" => Handler::Srliw, [Field("rd"), Field("rs1"), Field("shamt5")], false, false;
    "SRAIW" => Handler::Sraiw, [Field("rd"), Field("rs1"), Field("shamt5")], false, false;
    "ADDW" => Handler::Addw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SUBW" => Handler::Subw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SLLW" => Handler::Sllw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SRLW" => Handler::Srlw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "SRAW" => Handler::Sraw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "MUL" => Handler::Mul, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "MULH" => Handler::Mulh, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "MULHSU" => Handler::Mulhsu, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "MULHU" => Handler::Mulhu, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "DIV" => Handler::Div, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "DIVU" => Handler::Divu, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "REM" => Handler::Rem, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "REMU" => Handler::Remu, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "MULW" => Handler::Mulw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "DIVW" => Handler::Divw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "DIVUW" => Handler::Divuw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "REMW" => Handler::Remw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "REMUW" => Handler::Remuw, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "LR.W" => Handler::Lr { double: false }, [Field("rd"), Field("rs1")], false, false;
    "SC.W" => Handler::Sc { double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOSWAP.W" => Handler::Amo { op: AmoOp::Swap, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOADD.W" => Handler::Amo { op: AmoOp::Add, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOXOR.W" => Handler::Amo { op: AmoOp::Xor, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOAND.W" => Handler::Amo { op: AmoOp::And, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOOR.W" => Handler::Amo { op: AmoOp::Or, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMIN.W" => Handler::Amo { op: AmoOp::Min, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMAX.W" => Handler::Amo { op: AmoOp::Max, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMINU.W" => Handler::Amo { op: AmoOp::Minu, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMAXU.W" => Handler::Amo { op: AmoOp::Maxu, double: false }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "LR.D" => Handler::Lr { double: true }, [Field("rd"), Field("rs1")], false, false;
    "SC.D" => Handler::Sc { double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOSWAP.D" => Handler::Amo { op: AmoOp::Swap, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOADD.D" => Handler::Amo { op: AmoOp::Add, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOXOR.D" => Handler::Amo { op: AmoOp::Xor, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOAND.D" => Handler::Amo { op: AmoOp::And, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOOR.D" => Handler::Amo { op: AmoOp::Or, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMIN.D" => Handler::Amo { op: AmoOp::Min, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMAX.D" => Handler::Amo { op: AmoOp::Max, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMINU.D" => Handler::Amo { op: AmoOp::Minu, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "AMOMAXU.D" => Handler::Amo { op: AmoOp::Maxu, double: true }, [Field("rd"), Field("rs1"), Field("rs2")], false, false;
    "CSRRW" => Handler::Csr { op: CsrOp::ReadWrite, immediate: false }, [Field("rd"), Field("rs1"), Field("csr")], false, false;
    "CSRRS" => Handler::Csr { op: CsrOp::ReadSet, immediate: false }, [Field("rd"), Field("rs1"), Field("csr")], false, false;
    "CSRRC" => Handler::Csr { op: CsrOp::ReadClear, immediate: false }, [Field("rd"), Field("rs1"), Field("csr")], false, false;
    "CSRRWI" => Handler::Csr { op: CsrOp::ReadWrite, immediate: true }, [Field("rd"), Field("zimm"), Field("csr")], false, false;
    "CSRRSI" => Handler::Csr { op: CsrOp::ReadSet, immediate: true }, [Field("rd"), Field("zimm"), Field("csr")], false, false;
    "CSRRCI" => Handler::Csr { op: CsrOp::ReadClear, immediate: true }, [Field("rd"), Field("zimm"), Field("csr")], false, false;
    "SRET" => Handler::Sret, [], true, false;
    "MRET" => Handler::Mret, [], true, false;
    "WFI" => Handler::Wfi, [], false, false;
    "SFENCE.VMA" => Handler::SfenceVma, [Field("rs1"), Field("rs2")], false, false;
    "C.ADDI4SPN" => Handler::CAddi4spn, [Field("crdp"), Field("ciw")], false, false;
    "C.LW" => Handler::Lw, [Field("crdp"), Field("crs1p"), Field("clw")], false, false;
    "C.LD" => Handler::Ld, [Field("crdp"), Field("crs1p"), Field("cld")], false, false;
    "C.SW" => Handler::Sw, [Field("crs2p"), Field("crs1p"), Field("clw")], false, false;
    "C.SD" => Handler::Sd, [Field("crs2p"), Field("crs1p"), Field("cld")], false, false;
    "C.ADDI" => Handler::Addi, [Field("crd"), Field("crd"), Field("cimm")], false, false;
    "C.ADDIW" => Handler::Addiw, [Field("crd"), Field("crd"), Field("cimm")], false, false;
    "C.LI" => Handler::CLi, [Field("crd"), Field("cimm")], false, false;
    "C.ADDI16SP" => Handler::CAddi16sp, [Field("c16sp")], false, false;
    "C.LUI" => Handler::CLui, [Field("crd"), Field("clui")], false, false;
    "C.SRLI" => Handler::Srli, [Field("crs1p"), Field("crs1p"), Field("cshamt")], false, false;
    "C.SRAI" => Handler::Srai, [Field("crs1p"), Field("crs1p"), Field("cshamt")], false, false;
    "C.ANDI" => Handler::Andi, [Field("crs1p"), Field("crs1p"), Field("cimm")], false, false;
    "C.SUB" => Handler::Sub, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.XOR" => Handler::Xor, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.OR" => Handler::Or, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.AND" => Handler::And, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.SUBW" => Handler::Subw, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.ADDW" => Handler::Addw, [Field("crs1p"), Field("crs1p"), Field("crs2p")], false, false;
    "C.J" => Handler::CJ, [Field("cj"), Pc], true, false;
    "C.BEQZ" => Handler::CBeqz, [Field("crs1p"), Field("cb"), Pc], false, true;
    "C.BNEZ" => Handler::CBnez, [Field("crs1p"), Field("cb"), Pc], false, true;
    "C.SLLI" => Handler::Slli, [Field("crd"), Field("crd"), Field("cshamt")], false, false;
    "C.LWSP" => Handler::CLwsp, [Field("crd"), Field("clwsp")], false, false;
    "C.LDSP" => Handler::CLdsp, [Field("crd"), Field("cldsp")], false, false;
    "C.JR" => Handler::CJr, [Field("crd")], true, false;
    "C.MV" => Handler::CMv, [Field("crd"), Field("crs2")], false, false;
    "C.EBREAK" => Handler::Ebreak, [], false, false;
    "C.JALR" => Handler::CJalr, [Field("crd"), Pc, Size], true, false;
    "C.ADD" => Handler::Add, [Field("crd"), Field("crd"), Field("crs2")], false, false;
    "C.SWSP" => Handler::CSwsp, [Field("crs2"), Field("cswsp")], false, false;
    "C.SDSP" => Handler::CSdsp, [Field("crs2"), Field("csdsp")], false, false;
}

/// Check that every regular declaration of `set` has a handler whose field parameters the
/// declaration provides.
///
/// A failure here is a build mistake in the instruction description, not a guest-visible
/// condition.
pub fn validate(set: &InstructionSet) -> Result<(), RegistryError> {
    for decl in set.decls() {
        if decl.kind != super::schema::DeclKind::Regular {
            continue;
        }
        let spec = lookup(&decl.name).ok_or_else(|| RegistryError::UnknownInstruction {
            name: decl.name.clone(),
        })?;
        for param in spec.params {
            if let Param::Field(field) = *param {
                if decl.field(field).is_none() {
                    return Err(RegistryError::MissingField {
                        name: decl.name.clone(),
                        field,
                    });
                }
            }
        }
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("declaration `{name}` has no registered handler")]
    UnknownInstruction { name: String },
    #[error("declaration `{name}` does not provide field `{field}` required by its handler")]
    MissingField { name: String, field: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::schema::InstructionSet;

    #[test]
    fn test_shipped_isa_is_fully_bound() {
        let set = InstructionSet::parse(crate::isa::RISCV_ISA).unwrap();
        validate(&set).unwrap();
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let set = InstructionSet::parse(
            "field rd 11:7\n\
             field imm s31:12@12\n\
             inst LUI | ...................._....._0110111 | rd imm\n",
        )
        .unwrap();
        assert!(matches!(
            validate(&set),
            Err(RegistryError::MissingField { field: "uimm", .. })
        ));
    }
}
