use std::cell::Cell;
use std::io::{self, Error, ErrorKind};

use num_traits::FromPrimitive;

use crate::jvm::class::{ClassId, ConstantPool, CpEntry, MethodId};
use crate::jvm::mem::{ObjRef, TypeKind};

/// Raw opcode bytes as they appear in the class file.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[rustfmt::skip]
#[allow(non_camel_case_types)]
pub enum RawOpcode {
    nop = 0x00, aconst_null, iconst_m1, iconst_0, iconst_1, iconst_2, iconst_3,
    iconst_4, iconst_5, lconst_0, lconst_1, fconst_0, fconst_1, fconst_2,
    dconst_0, dconst_1, bipush, sipush, ldc, ldc_w, ldc2_w,
    iload, lload, fload, dload, aload,
    iload_0, iload_1, iload_2, iload_3,
    lload_0, lload_1, lload_2, lload_3,
    fload_0, fload_1, fload_2, fload_3,
    dload_0, dload_1, dload_2, dload_3,
    aload_0, aload_1, aload_2, aload_3,
    iaload, laload, faload, daload, aaload, baload, caload, saload,
    istore, lstore, fstore, dstore, astore,
    istore_0, istore_1, istore_2, istore_3,
    lstore_0, lstore_1, lstore_2, lstore_3,
    fstore_0, fstore_1, fstore_2, fstore_3,
    dstore_0, dstore_1, dstore_2, dstore_3,
    astore_0, astore_1, astore_2, astore_3,
    iastore, lastore, fastore, dastore, aastore, bastore, castore, sastore,
    pop, pop2, dup, dup_x1, dup_x2, dup2, dup2_x1, dup2_x2, swap,
    iadd, ladd, fadd, dadd, isub, lsub, fsub, dsub,
    imul, lmul, fmul, dmul, idiv, ldiv, fdiv, ddiv,
    irem, lrem, frem, drem, ineg, lneg, fneg, dneg,
    ishl, lshl, ishr, lshr, iushr, lushr,
    iand, land, ior, lor, ixor, lxor, iinc,
    i2l, i2f, i2d, l2i, l2f, l2d, f2i, f2l, f2d, d2i, d2l, d2f, i2b, i2c, i2s,
    lcmp, fcmpl, fcmpg, dcmpl, dcmpg,
    ifeq, ifne, iflt, ifge, ifgt, ifle,
    if_icmpeq, if_icmpne, if_icmplt, if_icmpge, if_icmpgt, if_icmple,
    if_acmpeq, if_acmpne,
    goto, jsr, ret, tableswitch, lookupswitch,
    ireturn, lreturn, freturn, dreturn, areturn, r#return,
    getstatic, putstatic, getfield, putfield,
    invokevirtual, invokespecial, invokestatic, invokeinterface, invokedynamic,
    new, newarray, anewarray, arraylength, athrow, checkcast, instanceof,
    monitorenter, monitorexit, wide, multianewarray, ifnull, ifnonnull,
    goto_w, jsr_w,
}

/// Rewritten instruction kinds. Decoding and analysis collapse the raw
/// opcode space: constant pushes carry immediates, branch targets are
/// instruction indices rather than byte offsets, stack-shuffling opcodes are
/// specialized by the actual operand widths, and field accesses gain typed
/// variants once the referenced field resolves. Longs and doubles occupy a
/// single logical slot throughout.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum InsnKind {
    Nop,
    AConstNull,
    IConst(i32),
    LConst(i64),
    FConst(f32),
    DConst(f64),
    /// Load of a String/Class/MethodType/MethodHandle/dynamic constant
    /// (numeric ldc forms become the const kinds above).
    Ldc(u16),

    ILoad(u16),
    LLoad(u16),
    FLoad(u16),
    DLoad(u16),
    ALoad(u16),
    IStore(u16),
    LStore(u16),
    FStore(u16),
    DStore(u16),
    AStore(u16),

    IALoad,
    LALoad,
    FALoad,
    DALoad,
    AALoad,
    BALoad,
    CALoad,
    SALoad,
    IAStore,
    LAStore,
    FAStore,
    DAStore,
    AAStore,
    BAStore,
    CAStore,
    SAStore,

    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,

    IAdd, LAdd, FAdd, DAdd,
    ISub, LSub, FSub, DSub,
    IMul, LMul, FMul, DMul,
    IDiv, LDiv, FDiv, DDiv,
    IRem, LRem, FRem, DRem,
    INeg, LNeg, FNeg, DNeg,
    IShl, LShl, IShr, LShr, IUshr, LUshr,
    IAnd, LAnd, IOr, LOr, IXor, LXor,
    IInc { local: u16, delta: i16 },

    I2L, I2F, I2D, L2I, L2F, L2D,
    F2I, F2L, F2D, D2I, D2L, D2F,
    I2B, I2C, I2S,

    LCmp, FCmpL, FCmpG, DCmpL, DCmpG,

    IfEq(u32), IfNe(u32), IfLt(u32), IfGe(u32), IfGt(u32), IfLe(u32),
    IfICmpEq(u32), IfICmpNe(u32), IfICmpLt(u32), IfICmpGe(u32),
    IfICmpGt(u32), IfICmpLe(u32),
    IfACmpEq(u32), IfACmpNe(u32),
    IfNull(u32), IfNonNull(u32),
    Goto(u32),
    /// Index into `DecodedCode::table_switches`.
    TableSwitch(u16),
    /// Index into `DecodedCode::lookup_switches`.
    LookupSwitch(u16),

    IReturn, LReturn, FReturn, DReturn, AReturn, Return,

    GetStatic(u16),
    PutStatic(u16),
    GetField(u16),
    PutField(u16),
    /// Typed variants installed after first resolution; the byte offset (or
    /// static slot) lives in the instruction's inline cache.
    GetStaticK(TypeKind, u16),
    PutStaticK(TypeKind, u16),
    GetFieldK(TypeKind, u16),
    PutFieldK(TypeKind, u16),

    InvokeVirtual(u16),
    InvokeSpecial(u16),
    InvokeStatic(u16),
    InvokeInterface(u16),
    InvokeDynamic(u16),
    /// Signature-polymorphic MethodHandle.invoke/invokeExact call site,
    /// installed when resolution first identifies one.
    InvokeSigPoly { cp: u16, exact: bool },

    New(u16),
    NewArray(TypeKind),
    ANewArray(u16),
    MultiANewArray { cp: u16, dims: u8 },
    ArrayLength,
    AThrow,
    CheckCast(u16),
    InstanceOf(u16),
    MonitorEnter,
    MonitorExit,
}

impl InsnKind {
    pub fn branch_target(self) -> Option<u32> {
        Some(match self {
            InsnKind::IfEq(x) | InsnKind::IfNe(x) | InsnKind::IfLt(x)
            | InsnKind::IfGe(x) | InsnKind::IfGt(x) | InsnKind::IfLe(x)
            | InsnKind::IfICmpEq(x) | InsnKind::IfICmpNe(x) | InsnKind::IfICmpLt(x)
            | InsnKind::IfICmpGe(x) | InsnKind::IfICmpGt(x) | InsnKind::IfICmpLe(x)
            | InsnKind::IfACmpEq(x) | InsnKind::IfACmpNe(x)
            | InsnKind::IfNull(x) | InsnKind::IfNonNull(x)
            | InsnKind::Goto(x) => x,
            _ => return None,
        })
    }

    pub fn is_unconditional_exit(self) -> bool {
        matches!(
            self,
            InsnKind::Goto(_)
                | InsnKind::TableSwitch(_)
                | InsnKind::LookupSwitch(_)
                | InsnKind::IReturn
                | InsnKind::LReturn
                | InsnKind::FReturn
                | InsnKind::DReturn
                | InsnKind::AReturn
                | InsnKind::Return
                | InsnKind::AThrow
        )
    }

    pub fn is_return(self) -> bool {
        matches!(
            self,
            InsnKind::IReturn
                | InsnKind::LReturn
                | InsnKind::FReturn
                | InsnKind::DReturn
                | InsnKind::AReturn
                | InsnKind::Return
        )
    }
}

/// Per-call-site inline cache. Separate from the kind so updates do not
/// disturb decoded operands.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum InlineCache {
    None,
    /// Instance field byte offset within the object data area.
    FieldOffset { kind: TypeKind, offset: u32 },
    /// Static field location.
    StaticField { class: ClassId, kind: TypeKind, offset: u32 },
    /// Resolved non-virtual target.
    Method(MethodId),
    /// Monomorphic virtual/interface cache, valid while the receiver class
    /// matches.
    Virtual { expected: ClassId, target: MethodId },
}

/// One rewritten instruction. The kind itself is mutable: resolution
/// installs typed field variants and signature-polymorphic call kinds in
/// place. `ic2` holds the resolved CallSite (invokedynamic) or cached
/// MethodType (signature-polymorphic calls) and participates in GC.
#[derive(Debug)]
pub struct Instruction {
    pub kind: Cell<InsnKind>,
    pub ic: Cell<InlineCache>,
    pub ic2: Cell<Option<ObjRef>>,
}

impl Instruction {
    pub fn new(kind: InsnKind) -> Self {
        Instruction {
            kind: Cell::new(kind),
            ic: Cell::new(InlineCache::None),
            ic2: Cell::new(None),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableSwitchData {
    pub default_target: u32,
    pub low: i32,
    pub targets: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct LookupSwitchData {
    pub default_target: u32,
    pub pairs: Vec<(i32, u32)>,
}

/// Result of decoding a Code attribute's byte stream: one `Instruction` per
/// opcode, the original byte pc of each, and out-of-line switch tables.
/// Branch targets have already been rewritten to instruction indices.
#[derive(Debug)]
pub struct DecodedCode {
    pub insns: Vec<Instruction>,
    pub pcs: Vec<u16>,
    pub table_switches: Vec<TableSwitchData>,
    pub lookup_switches: Vec<LookupSwitchData>,
}

impl DecodedCode {
    /// Instruction index of an original byte pc (used for exception tables
    /// and stack map frames).
    pub fn index_of_pc(&self, pc: u16) -> io::Result<u32> {
        match self.pcs.binary_search(&pc) {
            Ok(index) => Ok(index as u32),
            Err(_) => Err(Error::new(
                ErrorKind::InvalidData,
                format!("byte offset {} is not an instruction boundary", pc),
            )),
        }
    }
}

struct CodeReader<'a> {
    code: &'a [u8],
    position: usize,
}

impl<'a> CodeReader<'a> {
    fn u8(&mut self) -> io::Result<u8> {
        match self.code.get(self.position) {
            Some(x) => {
                self.position += 1;
                Ok(*x)
            }
            None => Err(Error::new(ErrorKind::InvalidData, "truncated bytecode")),
        }
    }

    fn u16(&mut self) -> io::Result<u16> {
        Ok((self.u8()? as u16) << 8 | self.u8()? as u16)
    }

    fn u32(&mut self) -> io::Result<u32> {
        Ok((self.u16()? as u32) << 16 | self.u16()? as u32)
    }

    fn align4(&mut self) -> io::Result<()> {
        while self.position % 4 != 0 {
            self.u8()?;
        }
        Ok(())
    }
}

/// Branch described as an absolute byte target during the first decode pass.
enum PendingTarget {
    None,
    Single(u16),
    Switch,
}

/// Decode a method's bytecode. The constant pool is consulted to rewrite
/// numeric `ldc` forms into immediate pushes.
pub fn decode_code(code: &[u8], pool: &ConstantPool) -> io::Result<DecodedCode> {
    let mut reader = CodeReader { code, position: 0 };

    let mut insns = Vec::new();
    let mut pcs: Vec<u16> = Vec::new();
    // Byte target of each decoded branch, resolved to indices afterwards
    let mut branch_pcs: Vec<(usize, u16)> = Vec::new();
    let mut table_switches = Vec::new();
    let mut lookup_switches = Vec::new();
    // Switch tables keep byte targets until the pc map is complete
    let mut raw_tables: Vec<(usize, u32, i32, Vec<u32>)> = Vec::new();
    let mut raw_lookups: Vec<(usize, u32, Vec<(i32, u32)>)> = Vec::new();

    while reader.position < code.len() {
        let pc = reader.position as u16;
        let opcode_byte = reader.u8()?;
        let opcode = RawOpcode::from_u8(opcode_byte).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidData,
                format!("unknown opcode {:#04x} at pc {}", opcode_byte, pc),
            )
        })?;

        use InsnKind::*;
        use RawOpcode as Op;

        let mut pending = PendingTarget::None;
        let mut branch = |reader: &mut CodeReader, pending: &mut PendingTarget| -> io::Result<u32> {
            let offset = reader.u16()? as i16 as i32;
            let target = pc as i32 + offset;
            if target < 0 || target > code.len() as i32 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("branch target {} out of range at pc {}", target, pc),
                ));
            }
            *pending = PendingTarget::Single(target as u16);
            // Placeholder; fixed up once all pcs are known
            Ok(0)
        };

        let kind = match opcode {
            Op::nop => Nop,
            Op::aconst_null => AConstNull,
            Op::iconst_m1 => IConst(-1),
            Op::iconst_0 => IConst(0),
            Op::iconst_1 => IConst(1),
            Op::iconst_2 => IConst(2),
            Op::iconst_3 => IConst(3),
            Op::iconst_4 => IConst(4),
            Op::iconst_5 => IConst(5),
            Op::lconst_0 => LConst(0),
            Op::lconst_1 => LConst(1),
            Op::fconst_0 => FConst(0.0),
            Op::fconst_1 => FConst(1.0),
            Op::fconst_2 => FConst(2.0),
            Op::dconst_0 => DConst(0.0),
            Op::dconst_1 => DConst(1.0),
            Op::bipush => IConst(reader.u8()? as i8 as i32),
            Op::sipush => IConst(reader.u16()? as i16 as i32),

            Op::ldc | Op::ldc_w | Op::ldc2_w => {
                let index = if opcode == Op::ldc {
                    reader.u8()? as u16
                } else {
                    reader.u16()?
                };
                match pool.entry(index) {
                    CpEntry::Integer(x) if opcode != Op::ldc2_w => IConst(*x),
                    CpEntry::Float(x) if opcode != Op::ldc2_w => FConst(*x),
                    CpEntry::Long(x) if opcode == Op::ldc2_w => LConst(*x),
                    CpEntry::Double(x) if opcode == Op::ldc2_w => DConst(*x),
                    CpEntry::Str(_)
                    | CpEntry::Class(_)
                    | CpEntry::MethodType(_)
                    | CpEntry::MethodHandle(_)
                        if opcode != Op::ldc2_w =>
                    {
                        Ldc(index)
                    }
                    CpEntry::InvokeDynamic(info) if info.is_constant && opcode != Op::ldc2_w => {
                        Ldc(index)
                    }
                    x => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("ldc of unloadable constant {:?} at pc {}", x, pc),
                        ))
                    }
                }
            }

            Op::iload => ILoad(reader.u8()? as u16),
            Op::lload => LLoad(reader.u8()? as u16),
            Op::fload => FLoad(reader.u8()? as u16),
            Op::dload => DLoad(reader.u8()? as u16),
            Op::aload => ALoad(reader.u8()? as u16),
            Op::iload_0 | Op::iload_1 | Op::iload_2 | Op::iload_3 => {
                ILoad(opcode_byte as u16 - Op::iload_0 as u16)
            }
            Op::lload_0 | Op::lload_1 | Op::lload_2 | Op::lload_3 => {
                LLoad(opcode_byte as u16 - Op::lload_0 as u16)
            }
            Op::fload_0 | Op::fload_1 | Op::fload_2 | Op::fload_3 => {
                FLoad(opcode_byte as u16 - Op::fload_0 as u16)
            }
            Op::dload_0 | Op::dload_1 | Op::dload_2 | Op::dload_3 => {
                DLoad(opcode_byte as u16 - Op::dload_0 as u16)
            }
            Op::aload_0 | Op::aload_1 | Op::aload_2 | Op::aload_3 => {
                ALoad(opcode_byte as u16 - Op::aload_0 as u16)
            }

            Op::iaload => IALoad,
            Op::laload => LALoad,
            Op::faload => FALoad,
            Op::daload => DALoad,
            Op::aaload => AALoad,
            Op::baload => BALoad,
            Op::caload => CALoad,
            Op::saload => SALoad,

            Op::istore => IStore(reader.u8()? as u16),
            Op::lstore => LStore(reader.u8()? as u16),
            Op::fstore => FStore(reader.u8()? as u16),
            Op::dstore => DStore(reader.u8()? as u16),
            Op::astore => AStore(reader.u8()? as u16),
            Op::istore_0 | Op::istore_1 | Op::istore_2 | Op::istore_3 => {
                IStore(opcode_byte as u16 - Op::istore_0 as u16)
            }
            Op::lstore_0 | Op::lstore_1 | Op::lstore_2 | Op::lstore_3 => {
                LStore(opcode_byte as u16 - Op::lstore_0 as u16)
            }
            Op::fstore_0 | Op::fstore_1 | Op::fstore_2 | Op::fstore_3 => {
                FStore(opcode_byte as u16 - Op::fstore_0 as u16)
            }
            Op::dstore_0 | Op::dstore_1 | Op::dstore_2 | Op::dstore_3 => {
                DStore(opcode_byte as u16 - Op::dstore_0 as u16)
            }
            Op::astore_0 | Op::astore_1 | Op::astore_2 | Op::astore_3 => {
                AStore(opcode_byte as u16 - Op::astore_0 as u16)
            }

            Op::iastore => IAStore,
            Op::lastore => LAStore,
            Op::fastore => FAStore,
            Op::dastore => DAStore,
            Op::aastore => AAStore,
            Op::bastore => BAStore,
            Op::castore => CAStore,
            Op::sastore => SAStore,

            Op::pop => Pop,
            Op::pop2 => Pop2,
            Op::dup => Dup,
            Op::dup_x1 => DupX1,
            Op::dup_x2 => DupX2,
            Op::dup2 => Dup2,
            Op::dup2_x1 => Dup2X1,
            Op::dup2_x2 => Dup2X2,
            Op::swap => Swap,

            Op::iadd => IAdd,
            Op::ladd => LAdd,
            Op::fadd => FAdd,
            Op::dadd => DAdd,
            Op::isub => ISub,
            Op::lsub => LSub,
            Op::fsub => FSub,
            Op::dsub => DSub,
            Op::imul => IMul,
            Op::lmul => LMul,
            Op::fmul => FMul,
            Op::dmul => DMul,
            Op::idiv => IDiv,
            Op::ldiv => LDiv,
            Op::fdiv => FDiv,
            Op::ddiv => DDiv,
            Op::irem => IRem,
            Op::lrem => LRem,
            Op::frem => FRem,
            Op::drem => DRem,
            Op::ineg => INeg,
            Op::lneg => LNeg,
            Op::fneg => FNeg,
            Op::dneg => DNeg,
            Op::ishl => IShl,
            Op::lshl => LShl,
            Op::ishr => IShr,
            Op::lshr => LShr,
            Op::iushr => IUshr,
            Op::lushr => LUshr,
            Op::iand => IAnd,
            Op::land => LAnd,
            Op::ior => IOr,
            Op::lor => LOr,
            Op::ixor => IXor,
            Op::lxor => LXor,
            Op::iinc => IInc {
                local: reader.u8()? as u16,
                delta: reader.u8()? as i8 as i16,
            },

            Op::i2l => I2L,
            Op::i2f => I2F,
            Op::i2d => I2D,
            Op::l2i => L2I,
            Op::l2f => L2F,
            Op::l2d => L2D,
            Op::f2i => F2I,
            Op::f2l => F2L,
            Op::f2d => F2D,
            Op::d2i => D2I,
            Op::d2l => D2L,
            Op::d2f => D2F,
            Op::i2b => I2B,
            Op::i2c => I2C,
            Op::i2s => I2S,

            Op::lcmp => LCmp,
            Op::fcmpl => FCmpL,
            Op::fcmpg => FCmpG,
            Op::dcmpl => DCmpL,
            Op::dcmpg => DCmpG,

            Op::ifeq => IfEq(branch(&mut reader, &mut pending)?),
            Op::ifne => IfNe(branch(&mut reader, &mut pending)?),
            Op::iflt => IfLt(branch(&mut reader, &mut pending)?),
            Op::ifge => IfGe(branch(&mut reader, &mut pending)?),
            Op::ifgt => IfGt(branch(&mut reader, &mut pending)?),
            Op::ifle => IfLe(branch(&mut reader, &mut pending)?),
            Op::if_icmpeq => IfICmpEq(branch(&mut reader, &mut pending)?),
            Op::if_icmpne => IfICmpNe(branch(&mut reader, &mut pending)?),
            Op::if_icmplt => IfICmpLt(branch(&mut reader, &mut pending)?),
            Op::if_icmpge => IfICmpGe(branch(&mut reader, &mut pending)?),
            Op::if_icmpgt => IfICmpGt(branch(&mut reader, &mut pending)?),
            Op::if_icmple => IfICmpLe(branch(&mut reader, &mut pending)?),
            Op::if_acmpeq => IfACmpEq(branch(&mut reader, &mut pending)?),
            Op::if_acmpne => IfACmpNe(branch(&mut reader, &mut pending)?),
            Op::ifnull => IfNull(branch(&mut reader, &mut pending)?),
            Op::ifnonnull => IfNonNull(branch(&mut reader, &mut pending)?),
            Op::goto => Goto(branch(&mut reader, &mut pending)?),
            Op::goto_w => {
                let offset = reader.u32()? as i32;
                let target = pc as i32 + offset;
                if target < 0 || target > code.len() as i32 {
                    return Err(Error::new(ErrorKind::InvalidData, "goto_w target out of range"));
                }
                pending = PendingTarget::Single(target as u16);
                Goto(0)
            }

            Op::jsr | Op::jsr_w | Op::ret => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "jsr/ret are not accepted (pre-Java-6 class files must be recompiled)",
                ))
            }

            Op::tableswitch => {
                reader.align4()?;
                let default_target = (pc as i32 + reader.u32()? as i32) as u32;
                let low = reader.u32()? as i32;
                let high = reader.u32()? as i32;
                if low > high {
                    return Err(Error::new(ErrorKind::InvalidData, "tableswitch low > high"));
                }
                let count = (high as i64 - low as i64 + 1) as usize;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push((pc as i32 + reader.u32()? as i32) as u32);
                }
                raw_tables.push((insns.len(), default_target, low, targets));
                pending = PendingTarget::Switch;
                TableSwitch(0)
            }
            Op::lookupswitch => {
                reader.align4()?;
                let default_target = (pc as i32 + reader.u32()? as i32) as u32;
                let count = reader.u32()? as usize;
                let mut pairs = Vec::with_capacity(count);
                let mut last_key = None;
                for _ in 0..count {
                    let key = reader.u32()? as i32;
                    if let Some(last) = last_key {
                        if key <= last {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                "lookupswitch keys not sorted",
                            ));
                        }
                    }
                    last_key = Some(key);
                    pairs.push((key, (pc as i32 + reader.u32()? as i32) as u32));
                }
                raw_lookups.push((insns.len(), default_target, pairs));
                pending = PendingTarget::Switch;
                LookupSwitch(0)
            }

            Op::ireturn => IReturn,
            Op::lreturn => LReturn,
            Op::freturn => FReturn,
            Op::dreturn => DReturn,
            Op::areturn => AReturn,
            Op::r#return => Return,

            Op::getstatic => GetStatic(reader.u16()?),
            Op::putstatic => PutStatic(reader.u16()?),
            Op::getfield => GetField(reader.u16()?),
            Op::putfield => PutField(reader.u16()?),

            Op::invokevirtual => InvokeVirtual(reader.u16()?),
            Op::invokespecial => InvokeSpecial(reader.u16()?),
            Op::invokestatic => InvokeStatic(reader.u16()?),
            Op::invokeinterface => {
                let index = reader.u16()?;
                // count and zero bytes, historical
                reader.u8()?;
                reader.u8()?;
                InvokeInterface(index)
            }
            Op::invokedynamic => {
                let index = reader.u16()?;
                reader.u8()?;
                reader.u8()?;
                InvokeDynamic(index)
            }

            Op::new => New(reader.u16()?),
            Op::newarray => {
                let kind = match reader.u8()? {
                    4 => TypeKind::Boolean,
                    5 => TypeKind::Char,
                    6 => TypeKind::Float,
                    7 => TypeKind::Double,
                    8 => TypeKind::Byte,
                    9 => TypeKind::Short,
                    10 => TypeKind::Int,
                    11 => TypeKind::Long,
                    x => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("invalid newarray type code {}", x),
                        ))
                    }
                };
                NewArray(kind)
            }
            Op::anewarray => ANewArray(reader.u16()?),
            Op::arraylength => ArrayLength,
            Op::athrow => AThrow,
            Op::checkcast => CheckCast(reader.u16()?),
            Op::instanceof => InstanceOf(reader.u16()?),
            Op::monitorenter => MonitorEnter,
            Op::monitorexit => MonitorExit,

            Op::wide => {
                let wide_opcode = reader.u8()?;
                let index = reader.u16()?;
                match RawOpcode::from_u8(wide_opcode) {
                    Some(Op::iload) => ILoad(index),
                    Some(Op::lload) => LLoad(index),
                    Some(Op::fload) => FLoad(index),
                    Some(Op::dload) => DLoad(index),
                    Some(Op::aload) => ALoad(index),
                    Some(Op::istore) => IStore(index),
                    Some(Op::lstore) => LStore(index),
                    Some(Op::fstore) => FStore(index),
                    Some(Op::dstore) => DStore(index),
                    Some(Op::astore) => AStore(index),
                    Some(Op::iinc) => IInc { local: index, delta: reader.u16()? as i16 },
                    _ => {
                        return Err(Error::new(
                            ErrorKind::InvalidData,
                            format!("invalid wide opcode {:#04x}", wide_opcode),
                        ))
                    }
                }
            }

            Op::multianewarray => MultiANewArray { cp: reader.u16()?, dims: reader.u8()? },
        };

        if let PendingTarget::Single(target) = pending {
            branch_pcs.push((insns.len(), target));
        }

        pcs.push(pc);
        insns.push(Instruction::new(kind));
    }

    let index_of = |target: u32| -> io::Result<u32> {
        match pcs.binary_search(&(target as u16)) {
            Ok(index) => Ok(index as u32),
            Err(_) => Err(Error::new(
                ErrorKind::InvalidData,
                format!("branch lands inside an instruction at byte {}", target),
            )),
        }
    };

    // Rewrite single-target branches from byte offsets to instruction indices
    for (insn_index, target) in branch_pcs {
        let index = index_of(target as u32)?;
        let insn = &insns[insn_index];
        let rewritten = match insn.kind.get() {
            InsnKind::IfEq(_) => InsnKind::IfEq(index),
            InsnKind::IfNe(_) => InsnKind::IfNe(index),
            InsnKind::IfLt(_) => InsnKind::IfLt(index),
            InsnKind::IfGe(_) => InsnKind::IfGe(index),
            InsnKind::IfGt(_) => InsnKind::IfGt(index),
            InsnKind::IfLe(_) => InsnKind::IfLe(index),
            InsnKind::IfICmpEq(_) => InsnKind::IfICmpEq(index),
            InsnKind::IfICmpNe(_) => InsnKind::IfICmpNe(index),
            InsnKind::IfICmpLt(_) => InsnKind::IfICmpLt(index),
            InsnKind::IfICmpGe(_) => InsnKind::IfICmpGe(index),
            InsnKind::IfICmpGt(_) => InsnKind::IfICmpGt(index),
            InsnKind::IfICmpLe(_) => InsnKind::IfICmpLe(index),
            InsnKind::IfACmpEq(_) => InsnKind::IfACmpEq(index),
            InsnKind::IfACmpNe(_) => InsnKind::IfACmpNe(index),
            InsnKind::IfNull(_) => InsnKind::IfNull(index),
            InsnKind::IfNonNull(_) => InsnKind::IfNonNull(index),
            InsnKind::Goto(_) => InsnKind::Goto(index),
            x => panic!("pending branch on non-branch {:?}", x),
        };
        insn.kind.set(rewritten);
    }

    for (insn_index, default_target, low, targets) in raw_tables {
        let data = TableSwitchData {
            default_target: index_of(default_target)?,
            low,
            targets: targets.into_iter().map(index_of).collect::<io::Result<_>>()?,
        };
        insns[insn_index].kind.set(InsnKind::TableSwitch(table_switches.len() as u16));
        table_switches.push(data);
    }

    for (insn_index, default_target, pairs) in raw_lookups {
        let data = LookupSwitchData {
            default_target: index_of(default_target)?,
            pairs: pairs
                .into_iter()
                .map(|(k, t)| Ok((k, index_of(t)?)))
                .collect::<io::Result<_>>()?,
        };
        insns[insn_index].kind.set(InsnKind::LookupSwitch(lookup_switches.len() as u16));
        lookup_switches.push(data);
    }

    Ok(DecodedCode { insns, pcs, table_switches, lookup_switches })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvm::class::CpString;
    use std::cell::Cell;
    use std::rc::Rc;

    fn empty_pool() -> ConstantPool {
        ConstantPool::default()
    }

    #[test]
    fn collapses_short_forms() {
        // iconst_2; istore_1; iload_1; bipush 100; if_icmplt -> 0; return
        let code = [0x05, 0x3c, 0x1b, 0x10, 100, 0xa1, 0xff, 0xfb, 0xb1];
        let decoded = decode_code(&code, &empty_pool()).unwrap();

        assert_eq!(decoded.insns[0].kind.get(), InsnKind::IConst(2));
        assert_eq!(decoded.insns[1].kind.get(), InsnKind::IStore(1));
        assert_eq!(decoded.insns[2].kind.get(), InsnKind::ILoad(1));
        assert_eq!(decoded.insns[3].kind.get(), InsnKind::IConst(100));
        // Branch target byte 0 is instruction 0
        assert_eq!(decoded.insns[4].kind.get(), InsnKind::IfICmpLt(0));
        assert_eq!(decoded.insns[5].kind.get(), InsnKind::Return);
        assert_eq!(decoded.pcs, vec![0, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn ldc_of_numeric_constant_becomes_immediate() {
        let pool = ConstantPool::from_entries(vec![
            CpEntry::Integer(77),
            CpEntry::Float(2.5),
            CpEntry::Str(CpString { value: Rc::from("x"), interned: Cell::new(None) }),
        ]);

        // ldc #1; ldc #2; ldc #3; return
        let code = [0x12, 1, 0x12, 2, 0x12, 3, 0xb1];
        let decoded = decode_code(&code, &pool).unwrap();
        assert_eq!(decoded.insns[0].kind.get(), InsnKind::IConst(77));
        assert_eq!(decoded.insns[1].kind.get(), InsnKind::FConst(2.5));
        assert_eq!(decoded.insns[2].kind.get(), InsnKind::Ldc(3));
    }

    #[test]
    fn ldc2_of_long_becomes_immediate() {
        let pool = ConstantPool::from_entries(vec![
            CpEntry::Long(1 << 40),
            CpEntry::Placeholder,
        ]);
        let code = [0x14, 0, 1, 0xb1];
        let decoded = decode_code(&code, &pool).unwrap();
        assert_eq!(decoded.insns[0].kind.get(), InsnKind::LConst(1 << 40));
    }

    #[test]
    fn tableswitch_alignment_and_targets() {
        // pc 0: iconst_0, pc 1: tableswitch pad-to-4 default=+23 low=0 high=1
        // targets +22, +23; pc 24: nop, pc 25: return
        #[rustfmt::skip]
        let code = [
            0x03,
            0xaa, 0, 0,                 // tableswitch at pc 1, padding to 4
            0, 0, 0, 23,                // default -> pc 24
            0, 0, 0, 0,                 // low
            0, 0, 0, 1,                 // high
            0, 0, 0, 23,                // case 0 -> pc 24
            0, 0, 0, 24,                // case 1 -> pc 25
            0x00,                       // pc 24: nop
            0xb1,                       // pc 25: return
        ];
        let decoded = decode_code(&code, &empty_pool()).unwrap();

        assert_eq!(decoded.insns[1].kind.get(), InsnKind::TableSwitch(0));
        let table = &decoded.table_switches[0];
        assert_eq!(table.default_target, 2);
        assert_eq!(table.targets, vec![2, 3]);
    }

    #[test]
    fn branch_into_middle_of_instruction_rejected() {
        // goto +2 lands inside the goto itself
        let code = [0xa7, 0x00, 0x02, 0x00];
        assert!(decode_code(&code, &empty_pool()).is_err());
    }

    #[test]
    fn wide_prefix() {
        // wide iload 300; wide iinc 300 by -2; return
        let code = [0xc4, 0x15, 0x01, 0x2c, 0xc4, 0x84, 0x01, 0x2c, 0xff, 0xfe, 0xb1];
        let decoded = decode_code(&code, &empty_pool()).unwrap();
        assert_eq!(decoded.insns[0].kind.get(), InsnKind::ILoad(300));
        assert_eq!(
            decoded.insns[1].kind.get(),
            InsnKind::IInc { local: 300, delta: -2 }
        );
    }

    #[test]
    fn jsr_is_rejected() {
        let code = [0xa8, 0x00, 0x03, 0xb1];
        assert!(decode_code(&code, &empty_pool()).is_err());
    }
}
