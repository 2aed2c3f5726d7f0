use crate::analysis::VarSource;
use crate::instruction::InsnKind;
use crate::jvm::class::{CodeInfo, ConstantPool};

/// Build the extended NullPointerException message for a faulting
/// instruction, in the style of JEP 358: what the instruction was about to
/// do, and where its null operand came from, traced through the analyzer's
/// per-operand source tags.
pub fn extended_npe_message(
    code: &CodeInfo,
    pool: &ConstantPool,
    class_name: &str,
    method_name: &str,
    insn: u32,
) -> String {
    let kind = code.insns[insn as usize].kind.get();
    let action = describe_action(kind, pool);

    let (source_a, _) = code
        .analysis
        .sources
        .get(insn as usize)
        .copied()
        .unwrap_or((VarSource::Unknown, VarSource::Unknown));

    let mut message = action;
    if let Some(culprit) = describe_source(code, pool, source_a, 2) {
        message.push_str(" because ");
        message.push_str(&culprit);
        message.push_str(" is null");
    }

    // Name the enclosing method so the message is useful even without a
    // stack trace
    message.push_str(&format!(" (at {}.{})", class_name.replace('/', "."), method_name));
    message
}

fn describe_action(kind: InsnKind, pool: &ConstantPool) -> String {
    use InsnKind::*;

    match kind {
        ArrayLength => "Cannot read the array length".to_string(),
        IALoad | BALoad | CALoad | SALoad | LALoad | FALoad | DALoad | AALoad => {
            "Cannot load from null array".to_string()
        }
        IAStore | BAStore | CAStore | SAStore | LAStore | FAStore | DAStore | AAStore => {
            "Cannot store to null array".to_string()
        }
        GetField(cp) | GetFieldK(_, cp) => {
            format!("Cannot read field \"{}\"", pool.field_ref(cp).name)
        }
        PutField(cp) | PutFieldK(_, cp) => {
            format!("Cannot assign field \"{}\"", pool.field_ref(cp).name)
        }
        InvokeVirtual(cp) | InvokeSpecial(cp) | InvokeInterface(cp) | InvokeSigPoly { cp, .. } => {
            let method_ref = pool.method_ref(cp);
            let owner = pool.class_info(method_ref.class_index).name.replace('/', ".");
            format!("Cannot invoke \"{}.{}()\"", owner, method_ref.name)
        }
        AThrow => "Cannot throw exception".to_string(),
        MonitorEnter => "Cannot enter synchronized block".to_string(),
        MonitorExit => "Cannot exit synchronized block".to_string(),
        _ => "Cannot dereference null".to_string(),
    }
}

/// Render a source tag as a human-readable expression. `depth` bounds the
/// recursion through instruction sources (a.b.c chains).
fn describe_source(
    code: &CodeInfo,
    pool: &ConstantPool,
    source: VarSource,
    depth: u32,
) -> Option<String> {
    match source {
        VarSource::Parameter(slot) | VarSource::Local(slot) => {
            Some(match local_name(code, slot) {
                Some(name) => format!("\"{}\"", name),
                None => format!("\"<local{}>\"", slot),
            })
        }
        VarSource::Insn(producer) if depth > 0 => {
            describe_producer(code, pool, producer, depth - 1)
        }
        _ => None,
    }
}

fn describe_producer(
    code: &CodeInfo,
    pool: &ConstantPool,
    producer: u32,
    depth: u32,
) -> Option<String> {
    use InsnKind::*;

    let kind = code.insns[producer as usize].kind.get();
    let (source_a, _) = code.analysis.sources.get(producer as usize).copied()?;

    Some(match kind {
        GetField(cp) | GetFieldK(_, cp) => {
            let field = &pool.field_ref(cp).name;
            match describe_source(code, pool, source_a, depth) {
                // Fold "x" . field into "x.field"
                Some(base) if base.starts_with('"') && base.ends_with('"') => {
                    format!("\"{}.{}\"", &base[1..base.len() - 1], field)
                }
                _ => format!("\"{}\"", field),
            }
        }
        GetStatic(cp) | GetStaticK(_, cp) => {
            let field_ref = pool.field_ref(cp);
            let owner = pool.class_info(field_ref.class_index).name.replace('/', ".");
            format!("\"{}.{}\"", owner, field_ref.name)
        }
        InvokeVirtual(cp) | InvokeSpecial(cp) | InvokeStatic(cp) | InvokeInterface(cp) => {
            let method_ref = pool.method_ref(cp);
            let owner = pool.class_info(method_ref.class_index).name.replace('/', ".");
            format!("the return value of \"{}.{}()\"", owner, method_ref.name)
        }
        AALoad => match describe_source(code, pool, source_a, depth) {
            Some(base) if base.starts_with('"') && base.ends_with('"') => {
                format!("\"{}[...]\"", &base[1..base.len() - 1])
            }
            _ => "an array element".to_string(),
        },
        AConstNull => "null".to_string(),
        _ => return None,
    })
}

/// Look up a local's declared name via the LocalVariableTable, if present.
fn local_name(code: &CodeInfo, slot: u16) -> Option<&str> {
    // The table stores names per byte-pc range; parameter slots are live for
    // the whole method so any matching entry works for our purposes
    code.local_variables
        .iter()
        .find(|v| v.index == slot)
        .map(|v| v.name.as_ref())
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end through the interpreter tests: building a
    // CodeInfo by hand requires a full analysis run, so coverage lives in
    // tests/vm.rs (null array length and field chains).
}
