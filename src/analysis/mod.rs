mod blocks;
mod npe;

pub use blocks::*;
pub use npe::*;

use std::io::{self, Error, ErrorKind};

use crate::class::attribute::{StackMapFrame, VerificationType};
use crate::instruction::{DecodedCode, InsnKind};
use crate::jvm::class::{ConstantPool, CpEntry};
use crate::jvm::mem::{FieldDescriptor, MethodDescriptor, TypeKind};
use crate::util::CompressedBitset;

/// Computational types tracked by the analyzer. After rewriting, long and
/// double values occupy a single stack slot, so these are logical-slot types.
/// `Top` marks a dead slot: the high half of a wide local, or a hole the
/// stack map declared unusable.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnalyType {
    Top,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl AnalyType {
    fn of_kind(kind: TypeKind) -> AnalyType {
        match kind {
            TypeKind::Boolean
            | TypeKind::Byte
            | TypeKind::Char
            | TypeKind::Short
            | TypeKind::Int => AnalyType::Int,
            TypeKind::Long => AnalyType::Long,
            TypeKind::Float => AnalyType::Float,
            TypeKind::Double => AnalyType::Double,
            TypeKind::Reference => AnalyType::Reference,
        }
    }

    fn of_verification(ty: &VerificationType) -> AnalyType {
        match ty {
            VerificationType::Top => AnalyType::Top,
            VerificationType::Integer => AnalyType::Int,
            VerificationType::Float => AnalyType::Float,
            VerificationType::Double => AnalyType::Double,
            VerificationType::Long => AnalyType::Long,
            VerificationType::Null
            | VerificationType::UninitializedThis
            | VerificationType::Object(_)
            | VerificationType::Uninitialized(_) => AnalyType::Reference,
        }
    }

    pub fn is_wide(self) -> bool {
        matches!(self, AnalyType::Long | AnalyType::Double)
    }
}

/// Where a stack value came from, for extended NullPointerException
/// messages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VarSource {
    /// The nth local slot, where the slot is a method parameter.
    Parameter(u16),
    /// The nth local slot, assigned within the body.
    Local(u16),
    /// Produced by the instruction at this index.
    Insn(u32),
    /// Merged or otherwise untraceable.
    Unknown,
}

/// Reduced top-of-stack classification recorded for the baseline JIT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReducedTos {
    Empty,
    Int,
    Long,
    Float,
    Double,
    Reference,
}

#[derive(Debug, Copy, Clone)]
struct StackEntry {
    ty: AnalyType,
    source: VarSource,
}

/// Per-method result of analysis: one record per instruction index.
#[derive(Debug, Default)]
pub struct CodeAnalysis {
    /// Which slots hold references at entry to each instruction. Bit layout:
    /// `[0, max_locals)` are locals, `[max_locals, max_locals + depth)` is
    /// the operand stack bottom-up. The GC walks these.
    pub refs_at: Vec<CompressedBitset>,
    /// Logical operand stack depth at entry to each instruction.
    pub stack_depth: Vec<u16>,
    pub tos_before: Vec<ReducedTos>,
    pub tos_after: Vec<ReducedTos>,
    /// Sources of the up-to-two operands that can trigger an NPE.
    pub sources: Vec<(VarSource, VarSource)>,
    pub blocks: Vec<BasicBlock>,
    pub max_locals: u16,
    pub max_stack: u16,
}

struct Analyzer<'a> {
    code: &'a DecodedCode,
    pool: &'a ConstantPool,
    max_stack: usize,
    max_locals: usize,
    locals: Vec<StackEntry>,
    stack: Vec<StackEntry>,
    /// Local slots holding parameters keep `Parameter` sources.
    parameter_slots: usize,
    insn: usize,
    reachable: bool,
}

impl<'a> Analyzer<'a> {
    fn fail(&self, message: impl AsRef<str>) -> Error {
        Error::new(
            ErrorKind::InvalidData,
            format!("verification of insn {} failed: {}", self.insn, message.as_ref()),
        )
    }

    fn push(&mut self, ty: AnalyType) -> io::Result<()> {
        self.push_from(ty, VarSource::Insn(self.insn as u32))
    }

    fn push_from(&mut self, ty: AnalyType, source: VarSource) -> io::Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(self.fail("operand stack overflow"));
        }
        self.stack.push(StackEntry { ty, source });
        Ok(())
    }

    fn pop_any(&mut self) -> io::Result<StackEntry> {
        self.stack.pop().ok_or_else(|| self.fail("operand stack underflow"))
    }

    fn pop(&mut self, expected: AnalyType) -> io::Result<StackEntry> {
        let entry = self.pop_any()?;
        if entry.ty != expected {
            return Err(self.fail(format!("expected {:?} on stack, found {:?}", expected, entry.ty)));
        }
        Ok(entry)
    }

    fn peek(&self, depth: usize) -> io::Result<StackEntry> {
        self.stack
            .len()
            .checked_sub(1 + depth)
            .map(|i| self.stack[i])
            .ok_or_else(|| self.fail("operand stack underflow"))
    }

    fn load(&mut self, index: u16, expected: AnalyType) -> io::Result<()> {
        let slot = self
            .locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| self.fail(format!("local {} out of range", index)))?;
        if slot.ty != expected {
            return Err(self.fail(format!(
                "local {} holds {:?}, expected {:?}",
                index, slot.ty, expected
            )));
        }
        self.push_from(slot.ty, slot.source)
    }

    fn store(&mut self, index: u16, expected: AnalyType) -> io::Result<()> {
        let value = self.pop(expected)?;
        let wide = value.ty.is_wide();
        if index as usize + wide as usize >= self.max_locals {
            return Err(self.fail(format!("local {} out of range", index)));
        }

        let source = if (index as usize) < self.parameter_slots {
            VarSource::Parameter(index)
        } else {
            VarSource::Local(index)
        };
        self.locals[index as usize] = StackEntry { ty: value.ty, source };
        if wide {
            // The occupant owns the base slot; the high half is dead
            self.locals[index as usize + 1] =
                StackEntry { ty: AnalyType::Top, source: VarSource::Unknown };
        }
        Ok(())
    }

    fn loadable_constant_type(&self, cp_index: u16) -> io::Result<AnalyType> {
        Ok(match self.pool.entry(cp_index) {
            CpEntry::Str(_)
            | CpEntry::Class(_)
            | CpEntry::MethodType(_)
            | CpEntry::MethodHandle(_) => AnalyType::Reference,
            CpEntry::InvokeDynamic(info) if info.is_constant => {
                AnalyType::of_kind(FieldDescriptor::parse(&info.descriptor)?.type_kind())
            }
            x => return Err(self.fail(format!("unloadable constant {:?}", x))),
        })
    }

    fn field_type(&self, cp_index: u16) -> AnalyType {
        AnalyType::of_kind(self.pool.field_ref(cp_index).descriptor.type_kind())
    }

    fn reduced_tos(&self) -> ReducedTos {
        match self.stack.last() {
            None => ReducedTos::Empty,
            Some(entry) => match entry.ty {
                AnalyType::Int | AnalyType::Top => ReducedTos::Int,
                AnalyType::Long => ReducedTos::Long,
                AnalyType::Float => ReducedTos::Float,
                AnalyType::Double => ReducedTos::Double,
                AnalyType::Reference => ReducedTos::Reference,
            },
        }
    }

    fn record_state(&self, analysis: &mut CodeAnalysis) {
        let capacity = self.max_locals + self.max_stack;
        let mut refs = CompressedBitset::with_capacity(capacity);
        for (i, slot) in self.locals.iter().enumerate() {
            if slot.ty == AnalyType::Reference {
                refs.set(i);
            }
        }
        for (i, slot) in self.stack.iter().enumerate() {
            if slot.ty == AnalyType::Reference {
                refs.set(self.max_locals + i);
            }
        }

        analysis.refs_at.push(refs);
        analysis.stack_depth.push(self.stack.len() as u16);
        analysis.tos_before.push(self.reduced_tos());
    }

    /// Reseed locals and stack from a stack map frame. In the table a wide
    /// entry accounts for two original local slots; on the stack every entry
    /// is one logical slot.
    fn reseed(&mut self, locals: &[VerificationType], stack: &[VerificationType]) -> io::Result<()> {
        self.locals.iter_mut().for_each(|slot| {
            *slot = StackEntry { ty: AnalyType::Top, source: VarSource::Unknown }
        });

        let mut slot = 0usize;
        for entry in locals {
            let ty = AnalyType::of_verification(entry);
            if slot + ty.is_wide() as usize >= self.max_locals + 1 {
                return Err(self.fail("stack map declares more locals than max_locals"));
            }
            if slot < self.max_locals {
                let source = if slot < self.parameter_slots {
                    VarSource::Parameter(slot as u16)
                } else {
                    VarSource::Local(slot as u16)
                };
                self.locals[slot] = StackEntry { ty, source };
            }
            slot += 1 + ty.is_wide() as usize;
        }
        if slot > self.max_locals {
            return Err(self.fail("stack map declares more locals than max_locals"));
        }

        self.stack.clear();
        for entry in stack {
            let ty = AnalyType::of_verification(entry);
            if self.stack.len() >= self.max_stack {
                return Err(self.fail("stack map declares more stack than max_stack"));
            }
            self.stack.push(StackEntry { ty, source: VarSource::Unknown });
        }

        self.reachable = true;
        Ok(())
    }
}

/// Stack map frames expanded to absolute byte offsets with the incremental
/// forms resolved against their predecessors.
fn expand_stack_map(
    frames: &[StackMapFrame],
    initial_locals: &[VerificationType],
) -> Vec<(u16, Vec<VerificationType>, Vec<VerificationType>)> {
    let mut expanded = Vec::with_capacity(frames.len());
    let mut locals: Vec<VerificationType> = initial_locals.to_vec();
    let mut pc: u32 = 0;
    let mut first = true;

    for frame in frames {
        pc = if first {
            frame.offset_delta() as u32
        } else {
            pc + frame.offset_delta() as u32 + 1
        };
        first = false;

        let stack: Vec<VerificationType> = match frame {
            StackMapFrame::Same { .. } => Vec::new(),
            StackMapFrame::SameLocalsOneStack { stack, .. } => vec![*stack],
            StackMapFrame::Chop { chopped, .. } => {
                for _ in 0..*chopped {
                    locals.pop();
                }
                Vec::new()
            }
            StackMapFrame::Append { locals: appended, .. } => {
                locals.extend_from_slice(appended);
                Vec::new()
            }
            StackMapFrame::Full { locals: full_locals, stack, .. } => {
                locals = full_locals.clone();
                stack.clone()
            }
        };

        expanded.push((pc as u16, locals.clone(), stack));
    }

    expanded
}

/// Initial local-variable declaration derived from the method descriptor, in
/// stack-map entry form (one entry per occupant, wide entries later expand to
/// two slots).
fn entry_locals(descriptor: &MethodDescriptor, is_static: bool) -> Vec<VerificationType> {
    let mut locals = Vec::new();
    if !is_static {
        locals.push(VerificationType::UninitializedThis);
    }
    for arg in &descriptor.args {
        locals.push(match AnalyType::of_kind(arg.type_kind()) {
            AnalyType::Int => VerificationType::Integer,
            AnalyType::Long => VerificationType::Long,
            AnalyType::Float => VerificationType::Float,
            AnalyType::Double => VerificationType::Double,
            _ => VerificationType::Object(0),
        });
    }
    locals
}

/// Analyze one method's rewritten instruction stream: type the stack and
/// locals at every pc (consulting the StackMapTable at frame pcs rather than
/// re-deriving branch states), record per-pc reference bitmaps and NPE
/// operand sources, specialize the width-sensitive stack opcodes in place,
/// and build the basic-block graph with its dominator tree.
pub fn analyze_code(
    code: &DecodedCode,
    pool: &ConstantPool,
    descriptor: &MethodDescriptor,
    is_static: bool,
    max_stack: u16,
    max_locals: u16,
    stack_map: &[StackMapFrame],
    handler_insns: &[u32],
) -> io::Result<CodeAnalysis> {
    let initial_locals = entry_locals(descriptor, is_static);
    let parameter_slots: usize = initial_locals
        .iter()
        .map(|x| 1 + VerificationType::is_wide(*x) as usize)
        .sum();

    let mut frames = expand_stack_map(stack_map, &initial_locals);
    // Earliest frame first; analysis walks them in step with the pc
    frames.sort_by_key(|(pc, _, _)| *pc);

    let mut analyzer = Analyzer {
        code,
        pool,
        max_stack: max_stack as usize,
        max_locals: max_locals as usize,
        locals: vec![
            StackEntry { ty: AnalyType::Top, source: VarSource::Unknown };
            max_locals as usize
        ],
        stack: Vec::with_capacity(max_stack as usize),
        parameter_slots,
        insn: 0,
        reachable: true,
    };

    // Seed entry state from the descriptor
    {
        let seed = initial_locals.clone();
        analyzer.reseed(&seed, &[])?;
        let mut slot = 0usize;
        for entry in &seed {
            if slot < analyzer.locals.len() {
                analyzer.locals[slot].source = VarSource::Parameter(slot as u16);
            }
            slot += 1 + entry.is_wide() as usize;
        }
    }

    let mut analysis = CodeAnalysis {
        max_locals,
        max_stack,
        ..CodeAnalysis::default()
    };

    let mut next_frame = 0usize;

    for insn_index in 0..code.insns.len() {
        analyzer.insn = insn_index;
        let pc = code.pcs[insn_index];

        if next_frame < frames.len() && frames[next_frame].0 == pc {
            let (_, locals, stack) = &frames[next_frame];
            let (locals, stack) = (locals.clone(), stack.clone());
            analyzer.reseed(&locals, &stack)?;
            next_frame += 1;
        } else if next_frame < frames.len() && frames[next_frame].0 < pc {
            return Err(analyzer.fail("stack map frame does not land on an instruction"));
        }

        if !analyzer.reachable {
            // Dead code past an unconditional exit with no frame; nothing to
            // model and nothing the GC needs
            analysis
                .refs_at
                .push(CompressedBitset::with_capacity(max_locals as usize + max_stack as usize));
            analysis.stack_depth.push(0);
            analysis.tos_before.push(ReducedTos::Empty);
            analysis.tos_after.push(ReducedTos::Empty);
            analysis.sources.push((VarSource::Unknown, VarSource::Unknown));
            continue;
        }

        analyzer.record_state(&mut analysis);
        analysis.sources.push(npe_sources(&analyzer, code.insns[insn_index].kind.get())?);

        step(&mut analyzer, insn_index)?;
        analysis.tos_after.push(analyzer.reduced_tos());

        if code.insns[insn_index].kind.get().is_unconditional_exit() {
            analyzer.reachable = false;
        }
    }

    analysis.blocks = scan_basic_blocks(code, handler_insns)?;
    compute_dominator_tree(&mut analysis.blocks);

    Ok(analysis)
}

/// Operand sources captured before an instruction executes, for NPE message
/// synthesis. `a` is the nullable operand, `b` a secondary operand such as
/// an array index.
fn npe_sources(analyzer: &Analyzer, kind: InsnKind) -> io::Result<(VarSource, VarSource)> {
    use InsnKind::*;

    let unknown = (VarSource::Unknown, VarSource::Unknown);
    Ok(match kind {
        GetField(_) | ArrayLength | AThrow | MonitorEnter | MonitorExit => {
            (analyzer.peek(0)?.source, VarSource::Unknown)
        }
        PutField(_) => (analyzer.peek(1)?.source, analyzer.peek(0)?.source),
        IALoad | LALoad | FALoad | DALoad | AALoad | BALoad | CALoad | SALoad => {
            (analyzer.peek(1)?.source, analyzer.peek(0)?.source)
        }
        IAStore | LAStore | FAStore | DAStore | AAStore | BAStore | CAStore | SAStore => {
            (analyzer.peek(2)?.source, analyzer.peek(1)?.source)
        }
        InvokeVirtual(cp) | InvokeSpecial(cp) | InvokeInterface(cp) => {
            let descriptor =
                FieldDescriptor::parse_method(&analyzer.pool.method_ref(cp).descriptor)?;
            (analyzer.peek(descriptor.argc())?.source, VarSource::Unknown)
        }
        _ => unknown,
    })
}

fn step(analyzer: &mut Analyzer, insn_index: usize) -> io::Result<()> {
    use AnalyType::*;
    use InsnKind::*;

    let insn = &analyzer.code.insns[insn_index];
    match insn.kind.get() {
        Nop => {}

        AConstNull => analyzer.push(Reference)?,
        IConst(_) => analyzer.push(Int)?,
        LConst(_) => analyzer.push(Long)?,
        FConst(_) => analyzer.push(Float)?,
        DConst(_) => analyzer.push(Double)?,
        Ldc(cp) => {
            let ty = analyzer.loadable_constant_type(cp)?;
            analyzer.push(ty)?;
        }

        ILoad(i) => analyzer.load(i, Int)?,
        LLoad(i) => analyzer.load(i, Long)?,
        FLoad(i) => analyzer.load(i, Float)?,
        DLoad(i) => analyzer.load(i, Double)?,
        ALoad(i) => analyzer.load(i, Reference)?,
        IStore(i) => analyzer.store(i, Int)?,
        LStore(i) => analyzer.store(i, Long)?,
        FStore(i) => analyzer.store(i, Float)?,
        DStore(i) => analyzer.store(i, Double)?,
        AStore(i) => analyzer.store(i, Reference)?,

        IALoad | BALoad | CALoad | SALoad => {
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
            analyzer.push(Int)?;
        }
        LALoad => {
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
            analyzer.push(Long)?;
        }
        FALoad => {
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
            analyzer.push(Float)?;
        }
        DALoad => {
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
            analyzer.push(Double)?;
        }
        AALoad => {
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
            analyzer.push(Reference)?;
        }
        IAStore | BAStore | CAStore | SAStore => {
            analyzer.pop(Int)?;
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
        }
        LAStore => {
            analyzer.pop(Long)?;
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
        }
        FAStore => {
            analyzer.pop(Float)?;
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
        }
        DAStore => {
            analyzer.pop(Double)?;
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
        }
        AAStore => {
            analyzer.pop(Reference)?;
            analyzer.pop(Int)?;
            analyzer.pop(Reference)?;
        }

        // The stack-shuffling opcodes are specialized by actual operand
        // widths, since wide values now occupy one logical slot.
        Pop => {
            analyzer.pop_any()?;
        }
        Pop2 => {
            let top = analyzer.pop_any()?;
            if !top.ty.is_wide() {
                let second = analyzer.pop_any()?;
                if second.ty.is_wide() {
                    return Err(analyzer.fail("pop2 splits a wide value"));
                }
            } else {
                insn.kind.set(Pop);
            }
        }
        Dup => {
            let top = analyzer.peek(0)?;
            if top.ty.is_wide() {
                return Err(analyzer.fail("dup of a wide value"));
            }
            analyzer.push_from(top.ty, top.source)?;
        }
        Dup2 => {
            let top = analyzer.peek(0)?;
            if top.ty.is_wide() {
                insn.kind.set(Dup);
                analyzer.push_from(top.ty, top.source)?;
            } else {
                let second = analyzer.peek(1)?;
                if second.ty.is_wide() {
                    return Err(analyzer.fail("dup2 splits a wide value"));
                }
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
            }
        }
        DupX1 => {
            let top = analyzer.pop_any()?;
            let second = analyzer.pop_any()?;
            if top.ty.is_wide() || second.ty.is_wide() {
                return Err(analyzer.fail("dup_x1 with wide operands"));
            }
            analyzer.push_from(top.ty, top.source)?;
            analyzer.push_from(second.ty, second.source)?;
            analyzer.push_from(top.ty, top.source)?;
        }
        DupX2 => {
            let top = analyzer.pop_any()?;
            if top.ty.is_wide() {
                return Err(analyzer.fail("dup_x2 with wide top"));
            }
            let second = analyzer.pop_any()?;
            if second.ty.is_wide() {
                // Form 2: value2 is a single wide slot
                insn.kind.set(DupX1);
                analyzer.push_from(top.ty, top.source)?;
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
            } else {
                let third = analyzer.pop_any()?;
                if third.ty.is_wide() {
                    return Err(analyzer.fail("dup_x2 splits a wide value"));
                }
                analyzer.push_from(top.ty, top.source)?;
                analyzer.push_from(third.ty, third.source)?;
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
            }
        }
        Dup2X1 => {
            let top = analyzer.pop_any()?;
            if top.ty.is_wide() {
                // Form 2: one wide on top of a narrow value
                insn.kind.set(DupX1);
                let second = analyzer.pop_any()?;
                if second.ty.is_wide() {
                    return Err(analyzer.fail("dup2_x1 with wide value2"));
                }
                analyzer.push_from(top.ty, top.source)?;
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
            } else {
                let second = analyzer.pop_any()?;
                let third = analyzer.pop_any()?;
                if second.ty.is_wide() || third.ty.is_wide() {
                    return Err(analyzer.fail("dup2_x1 splits a wide value"));
                }
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
                analyzer.push_from(third.ty, third.source)?;
                analyzer.push_from(second.ty, second.source)?;
                analyzer.push_from(top.ty, top.source)?;
            }
        }
        Dup2X2 => {
            let top = analyzer.pop_any()?;
            if top.ty.is_wide() {
                let second = analyzer.pop_any()?;
                if second.ty.is_wide() {
                    // Form 4: wide over wide
                    insn.kind.set(DupX1);
                    analyzer.push_from(top.ty, top.source)?;
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                } else {
                    // Form 2: wide over two narrow values
                    insn.kind.set(DupX2);
                    let third = analyzer.pop_any()?;
                    if third.ty.is_wide() {
                        return Err(analyzer.fail("dup2_x2 splits a wide value"));
                    }
                    analyzer.push_from(top.ty, top.source)?;
                    analyzer.push_from(third.ty, third.source)?;
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                }
            } else {
                let second = analyzer.pop_any()?;
                if second.ty.is_wide() {
                    return Err(analyzer.fail("dup2_x2 splits a wide value"));
                }
                let third = analyzer.pop_any()?;
                if third.ty.is_wide() {
                    // Form 3: two narrow values over a wide
                    insn.kind.set(Dup2X1);
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                    analyzer.push_from(third.ty, third.source)?;
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                } else {
                    let fourth = analyzer.pop_any()?;
                    if fourth.ty.is_wide() {
                        return Err(analyzer.fail("dup2_x2 splits a wide value"));
                    }
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                    analyzer.push_from(fourth.ty, fourth.source)?;
                    analyzer.push_from(third.ty, third.source)?;
                    analyzer.push_from(second.ty, second.source)?;
                    analyzer.push_from(top.ty, top.source)?;
                }
            }
        }
        Swap => {
            let top = analyzer.pop_any()?;
            let second = analyzer.pop_any()?;
            if top.ty.is_wide() || second.ty.is_wide() {
                return Err(analyzer.fail("swap of wide values"));
            }
            analyzer.push_from(top.ty, top.source)?;
            analyzer.push_from(second.ty, second.source)?;
        }

        IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor => {
            analyzer.pop(Int)?;
            analyzer.pop(Int)?;
            analyzer.push(Int)?;
        }
        LAdd | LSub | LMul | LDiv | LRem | LAnd | LOr | LXor => {
            analyzer.pop(Long)?;
            analyzer.pop(Long)?;
            analyzer.push(Long)?;
        }
        FAdd | FSub | FMul | FDiv | FRem => {
            analyzer.pop(Float)?;
            analyzer.pop(Float)?;
            analyzer.push(Float)?;
        }
        DAdd | DSub | DMul | DDiv | DRem => {
            analyzer.pop(Double)?;
            analyzer.pop(Double)?;
            analyzer.push(Double)?;
        }
        INeg => {
            analyzer.pop(Int)?;
            analyzer.push(Int)?;
        }
        LNeg => {
            analyzer.pop(Long)?;
            analyzer.push(Long)?;
        }
        FNeg => {
            analyzer.pop(Float)?;
            analyzer.push(Float)?;
        }
        DNeg => {
            analyzer.pop(Double)?;
            analyzer.push(Double)?;
        }
        IShl | IShr | IUshr => {
            analyzer.pop(Int)?;
            analyzer.pop(Int)?;
            analyzer.push(Int)?;
        }
        LShl | LShr | LUshr => {
            analyzer.pop(Int)?;
            analyzer.pop(Long)?;
            analyzer.push(Long)?;
        }
        IInc { local, .. } => {
            let slot = analyzer
                .locals
                .get(local as usize)
                .copied()
                .ok_or_else(|| analyzer.fail("iinc local out of range"))?;
            if slot.ty != Int {
                return Err(analyzer.fail("iinc of a non-int local"));
            }
        }

        I2L => convert(analyzer, Int, Long)?,
        I2F => convert(analyzer, Int, Float)?,
        I2D => convert(analyzer, Int, Double)?,
        L2I => convert(analyzer, Long, Int)?,
        L2F => convert(analyzer, Long, Float)?,
        L2D => convert(analyzer, Long, Double)?,
        F2I => convert(analyzer, Float, Int)?,
        F2L => convert(analyzer, Float, Long)?,
        F2D => convert(analyzer, Float, Double)?,
        D2I => convert(analyzer, Double, Int)?,
        D2L => convert(analyzer, Double, Long)?,
        D2F => convert(analyzer, Double, Float)?,
        I2B | I2C | I2S => convert(analyzer, Int, Int)?,

        LCmp => {
            analyzer.pop(Long)?;
            analyzer.pop(Long)?;
            analyzer.push(Int)?;
        }
        FCmpL | FCmpG => {
            analyzer.pop(Float)?;
            analyzer.pop(Float)?;
            analyzer.push(Int)?;
        }
        DCmpL | DCmpG => {
            analyzer.pop(Double)?;
            analyzer.pop(Double)?;
            analyzer.push(Int)?;
        }

        IfEq(_) | IfNe(_) | IfLt(_) | IfGe(_) | IfGt(_) | IfLe(_) => {
            analyzer.pop(Int)?;
        }
        IfICmpEq(_) | IfICmpNe(_) | IfICmpLt(_) | IfICmpGe(_) | IfICmpGt(_) | IfICmpLe(_) => {
            analyzer.pop(Int)?;
            analyzer.pop(Int)?;
        }
        IfACmpEq(_) | IfACmpNe(_) => {
            analyzer.pop(Reference)?;
            analyzer.pop(Reference)?;
        }
        IfNull(_) | IfNonNull(_) => {
            analyzer.pop(Reference)?;
        }
        Goto(_) => {}
        TableSwitch(_) | LookupSwitch(_) => {
            analyzer.pop(Int)?;
        }

        IReturn => {
            analyzer.pop(Int)?;
        }
        LReturn => {
            analyzer.pop(Long)?;
        }
        FReturn => {
            analyzer.pop(Float)?;
        }
        DReturn => {
            analyzer.pop(Double)?;
        }
        AReturn => {
            analyzer.pop(Reference)?;
        }
        Return => {}

        GetStatic(cp) => {
            let ty = analyzer.field_type(cp);
            analyzer.push(ty)?;
        }
        PutStatic(cp) => {
            let ty = analyzer.field_type(cp);
            analyzer.pop(ty)?;
        }
        GetField(cp) => {
            analyzer.pop(Reference)?;
            let ty = analyzer.field_type(cp);
            analyzer.push(ty)?;
        }
        PutField(cp) => {
            let ty = analyzer.field_type(cp);
            analyzer.pop(ty)?;
            analyzer.pop(Reference)?;
        }
        GetStaticK(..) | PutStaticK(..) | GetFieldK(..) | PutFieldK(..) | InvokeSigPoly { .. } => {
            // Installed by the interpreter after resolution; never present
            // when the analyzer runs
            return Err(analyzer.fail("rewritten opcode in unanalyzed code"));
        }

        InvokeVirtual(cp) | InvokeSpecial(cp) | InvokeInterface(cp) | InvokeStatic(cp) => {
            let method_ref = analyzer.pool.method_ref(cp);
            let descriptor = FieldDescriptor::parse_method(&method_ref.descriptor)?;
            invoke(
                analyzer,
                &descriptor,
                !matches!(insn.kind.get(), InvokeStatic(_)),
            )?;
        }
        InvokeDynamic(cp) => {
            let info = analyzer.pool.indy_info(cp);
            let descriptor = FieldDescriptor::parse_method(&info.descriptor)?;
            invoke(analyzer, &descriptor, false)?;
        }

        New(_) => analyzer.push(Reference)?,
        NewArray(_) | ANewArray(_) => {
            analyzer.pop(Int)?;
            analyzer.push(Reference)?;
        }
        MultiANewArray { dims, .. } => {
            for _ in 0..dims {
                analyzer.pop(Int)?;
            }
            analyzer.push(Reference)?;
        }
        ArrayLength => {
            analyzer.pop(Reference)?;
            analyzer.push(Int)?;
        }
        AThrow => {
            analyzer.pop(Reference)?;
        }
        CheckCast(_) => {
            analyzer.pop(Reference)?;
            analyzer.push(Reference)?;
        }
        InstanceOf(_) => {
            analyzer.pop(Reference)?;
            analyzer.push(Int)?;
        }
        MonitorEnter | MonitorExit => {
            analyzer.pop(Reference)?;
        }
    }

    Ok(())
}

fn convert(analyzer: &mut Analyzer, from: AnalyType, to: AnalyType) -> io::Result<()> {
    analyzer.pop(from)?;
    analyzer.push(to)
}

fn invoke(
    analyzer: &mut Analyzer,
    descriptor: &MethodDescriptor,
    has_receiver: bool,
) -> io::Result<()> {
    for arg in descriptor.args.iter().rev() {
        analyzer.pop(AnalyType::of_kind(arg.type_kind()))?;
    }
    if has_receiver {
        analyzer.pop(AnalyType::Reference)?;
    }
    if descriptor.returns != FieldDescriptor::Void {
        analyzer.push(AnalyType::of_kind(descriptor.returns.type_kind()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::decode_code;
    use crate::jvm::mem::FieldDescriptor;

    fn analyze(
        code: &[u8],
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        frames: &[StackMapFrame],
    ) -> io::Result<(DecodedCode, CodeAnalysis)> {
        let pool = ConstantPool::default();
        let decoded = decode_code(code, &pool)?;
        let descriptor = FieldDescriptor::parse_method(descriptor)?;
        let analysis = analyze_code(
            &decoded, &pool, &descriptor, true, max_stack, max_locals, frames, &[],
        )?;
        Ok((decoded, analysis))
    }

    #[test]
    fn models_simple_arithmetic() {
        // static int f(int): iload_0; iconst_2; imul; ireturn
        let (_, analysis) = analyze(&[0x1a, 0x05, 0x68, 0xac], "(I)I", 2, 1, &[]).unwrap();

        assert_eq!(analysis.stack_depth, vec![0, 1, 2, 1]);
        assert_eq!(analysis.tos_after[2], ReducedTos::Int);
    }

    #[test]
    fn wide_values_take_one_logical_slot() {
        // static long f(long): lload_0; lconst_1; ladd; lreturn
        let (_, analysis) = analyze(&[0x1e, 0x0a, 0x61, 0xad], "(J)J", 4, 2, &[]).unwrap();

        // Original max_stack would be 4; logically two longs are two slots
        assert_eq!(analysis.stack_depth, vec![0, 1, 2, 1]);
        assert_eq!(analysis.tos_before[3], ReducedTos::Long);
    }

    #[test]
    fn pop2_of_long_becomes_pop() {
        // static void f(long): lload_0; pop2; return
        let (decoded, _) = analyze(&[0x1e, 0x58, 0xb1], "(J)V", 2, 2, &[]).unwrap();
        assert_eq!(decoded.insns[1].kind.get(), InsnKind::Pop);
    }

    #[test]
    fn dup2_of_long_becomes_dup() {
        // static long f(long): lload_0; dup2; ladd; lreturn
        let (decoded, _) = analyze(&[0x1e, 0x5c, 0x61, 0xad], "(J)J", 4, 2, &[]).unwrap();
        assert_eq!(decoded.insns[1].kind.get(), InsnKind::Dup);
    }

    #[test]
    fn reference_bitmap_tracks_locals_and_stack() {
        // static int f(int[]): aload_0; arraylength; ireturn
        let (_, analysis) = analyze(&[0x2a, 0xbe, 0xac], "([I)I", 1, 1, &[]).unwrap();

        let mut bits = Vec::new();
        // At insn 0: local 0 is a reference, stack empty
        analysis.refs_at[0].list_bits(&mut bits);
        assert_eq!(bits, vec![0]);
        // At insn 1: the array ref sits on the stack (slot max_locals + 0)
        analysis.refs_at[1].list_bits(&mut bits);
        assert_eq!(bits, vec![0, 1]);
        // At insn 2: only the int length remains on the stack
        analysis.refs_at[2].list_bits(&mut bits);
        assert_eq!(bits, vec![0]);
    }

    #[test]
    fn bitmap_indices_stay_in_range() {
        let (_, analysis) = analyze(&[0x2a, 0xbe, 0xac], "([I)I", 1, 1, &[]).unwrap();
        let limit = (analysis.max_locals + analysis.max_stack) as u32;
        let mut bits = Vec::new();
        for refs in &analysis.refs_at {
            refs.list_bits(&mut bits);
            assert!(bits.iter().all(|x| *x < limit));
        }
    }

    #[test]
    fn stack_map_reseeds_branch_target() {
        // static int f(int):
        //   0: iload_0         (stack: [])
        //   1: ifeq -> 6       (pops int)
        //   4: iconst_1
        //   5: ireturn
        //   6: iconst_0        <- same_frame here
        //   7: ireturn
        let code = [0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let frames = [StackMapFrame::Same { offset_delta: 6 }];
        let (_, analysis) = analyze(&code, "(I)I", 1, 1, &frames).unwrap();

        assert_eq!(analysis.stack_depth, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn underflow_is_a_format_error() {
        // static void f(): pop; return
        assert!(analyze(&[0x57, 0xb1], "()V", 1, 0, &[]).is_err());
    }

    #[test]
    fn type_mismatch_is_a_format_error() {
        // static void f(int): iload_0; arraylength; return
        assert!(analyze(&[0x1a, 0xbe, 0xb1], "(I)V", 1, 1, &[]).is_err());
    }

    #[test]
    fn npe_sources_name_parameters() {
        // static int f(int[]): aload_0; arraylength; ireturn
        let (_, analysis) = analyze(&[0x2a, 0xbe, 0xac], "([I)I", 1, 1, &[]).unwrap();
        assert_eq!(analysis.sources[1].0, VarSource::Parameter(0));
    }
}
