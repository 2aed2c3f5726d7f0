use std::io::{self, Error, ErrorKind};

use crate::instruction::{DecodedCode, InsnKind};

pub const NO_BLOCK: u32 = u32::MAX;

/// A node of the control-flow graph over rewritten instructions.
#[derive(Debug)]
pub struct BasicBlock {
    pub index: u32,
    pub start: u32,
    pub insn_count: u32,

    /// Successor block indices. For conditional branches the taken edge is
    /// first and the fallthrough second; for switches the default edge is
    /// last. Duplicates are possible with degenerate switches.
    pub next: Vec<u32>,
    /// Parallel to `next`: whether the edge is a backedge.
    pub is_backedge: Vec<bool>,
    pub prev: Vec<u32>,

    /// Pre/postorder of a DFS over the CFG.
    pub dfs_pre: u32,
    pub dfs_post: u32,
    /// Immediate dominator (`NO_BLOCK` for the entry and unreachable
    /// blocks).
    pub idom: u32,
    pub idominates: Vec<u32>,
    /// Pre/postorder within the dominator tree, for O(1) dominance queries.
    pub idom_pre: u32,
    pub idom_post: u32,

    /// Target of some backedge.
    pub is_loop_header: bool,
    /// Reachable from the entry without any exception being thrown. Blocks
    /// that are not (pure handler code) need not be compiled.
    pub nothrow_accessible: bool,
}

/// Split the instruction stream at branch targets, instructions following an
/// unconditional control transfer, and exception handler entries.
pub fn scan_basic_blocks(code: &DecodedCode, handler_insns: &[u32]) -> io::Result<Vec<BasicBlock>> {
    let count = code.insns.len() as u32;
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut leaders = vec![0u32];
    leaders.extend_from_slice(handler_insns);

    let mut note_target = |target: u32, leaders: &mut Vec<u32>| -> io::Result<()> {
        if target >= count {
            return Err(Error::new(ErrorKind::InvalidData, "branch target out of range"));
        }
        leaders.push(target);
        Ok(())
    };

    for (index, insn) in code.insns.iter().enumerate() {
        let kind = insn.kind.get();
        let mut splits_after = kind.is_unconditional_exit();

        if let Some(target) = kind.branch_target() {
            note_target(target, &mut leaders)?;
            splits_after = true;
        }
        match kind {
            InsnKind::TableSwitch(table) => {
                let data = &code.table_switches[table as usize];
                for target in &data.targets {
                    note_target(*target, &mut leaders)?;
                }
                note_target(data.default_target, &mut leaders)?;
            }
            InsnKind::LookupSwitch(table) => {
                let data = &code.lookup_switches[table as usize];
                for (_, target) in &data.pairs {
                    note_target(*target, &mut leaders)?;
                }
                note_target(data.default_target, &mut leaders)?;
            }
            InsnKind::AThrow => splits_after = true,
            _ => {}
        }

        if splits_after && (index as u32 + 1) < count {
            leaders.push(index as u32 + 1);
        }
    }

    leaders.sort_unstable();
    leaders.dedup();

    let block_of = |insn: u32| -> u32 {
        match leaders.binary_search(&insn) {
            Ok(i) => i as u32,
            Err(i) => i as u32 - 1,
        }
    };

    let mut blocks: Vec<BasicBlock> = leaders
        .iter()
        .enumerate()
        .map(|(i, start)| {
            let end = leaders.get(i + 1).copied().unwrap_or(count);
            BasicBlock {
                index: i as u32,
                start: *start,
                insn_count: end - start,
                next: Vec::new(),
                is_backedge: Vec::new(),
                prev: Vec::new(),
                dfs_pre: 0,
                dfs_post: 0,
                idom: NO_BLOCK,
                idominates: Vec::new(),
                idom_pre: 0,
                idom_post: 0,
                is_loop_header: false,
                nothrow_accessible: false,
            }
        })
        .collect();

    // Wire successor edges from each block's terminating instruction
    for i in 0..blocks.len() {
        let last = blocks[i].start + blocks[i].insn_count - 1;
        let kind = code.insns[last as usize].kind.get();
        let fallthrough = last + 1;

        let mut next = Vec::new();
        match kind {
            InsnKind::Goto(target) => next.push(block_of(target)),
            InsnKind::TableSwitch(table) => {
                let data = &code.table_switches[table as usize];
                next.extend(data.targets.iter().map(|x| block_of(*x)));
                next.push(block_of(data.default_target));
            }
            InsnKind::LookupSwitch(table) => {
                let data = &code.lookup_switches[table as usize];
                next.extend(data.pairs.iter().map(|(_, x)| block_of(*x)));
                next.push(block_of(data.default_target));
            }
            _ if kind.is_return() || kind == InsnKind::AThrow => {}
            _ => {
                if let Some(target) = kind.branch_target() {
                    // Taken edge first, fallthrough second
                    next.push(block_of(target));
                }
                if fallthrough < count {
                    next.push(block_of(fallthrough));
                } else if kind.branch_target().is_none() {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "execution can fall off the end of the code array",
                    ));
                }
            }
        }

        for succ in &next {
            blocks[*succ as usize].prev.push(i as u32);
        }
        blocks[i].is_backedge = vec![false; next.len()];
        blocks[i].next = next;
    }

    dfs_order(&mut blocks);
    mark_backedges(&mut blocks);
    mark_nothrow_accessible(&mut blocks);
    Ok(blocks)
}

/// Iterative DFS from the entry assigning pre/post orders.
fn dfs_order(blocks: &mut [BasicBlock]) {
    let mut pre = 0u32;
    let mut post = 0u32;
    let mut visited = vec![false; blocks.len()];
    // (block, next successor index to visit)
    let mut stack: Vec<(u32, usize)> = vec![(0, 0)];
    visited[0] = true;
    blocks[0].dfs_pre = pre;
    pre += 1;

    while let Some((block, succ)) = stack.pop() {
        if succ < blocks[block as usize].next.len() {
            stack.push((block, succ + 1));
            let target = blocks[block as usize].next[succ];
            if !visited[target as usize] {
                visited[target as usize] = true;
                blocks[target as usize].dfs_pre = pre;
                pre += 1;
                stack.push((target, 0));
            }
        } else {
            blocks[block as usize].dfs_post = post;
            post += 1;
        }
    }
}

/// An edge u -> v is a backedge when v is an ancestor of u in the DFS tree.
fn mark_backedges(blocks: &mut [BasicBlock]) {
    for i in 0..blocks.len() {
        for edge in 0..blocks[i].next.len() {
            let target = blocks[i].next[edge] as usize;
            let ancestor = blocks[target].dfs_pre <= blocks[i].dfs_pre
                && blocks[target].dfs_post >= blocks[i].dfs_post;
            if ancestor && reachable(blocks, i) {
                blocks[i].is_backedge[edge] = true;
                blocks[target].is_loop_header = true;
            }
        }
    }
}

fn reachable(blocks: &[BasicBlock], index: usize) -> bool {
    index == 0 || blocks[index].dfs_pre != 0
}

fn mark_nothrow_accessible(blocks: &mut [BasicBlock]) {
    let mut work = vec![0u32];
    while let Some(block) = work.pop() {
        if blocks[block as usize].nothrow_accessible {
            continue;
        }
        blocks[block as usize].nothrow_accessible = true;
        work.extend(blocks[block as usize].next.iter().copied());
    }
}

/// Lengauer–Tarjan immediate dominators over the blocks reachable from the
/// entry, followed by a pre/post numbering of the dominator tree itself so
/// `query_dominance` is a pair of comparisons.
pub fn compute_dominator_tree(blocks: &mut [BasicBlock]) {
    if blocks.is_empty() {
        return;
    }

    let n = blocks.len();
    // Vertices in DFS preorder; NO_BLOCK entries are unreachable
    let mut order: Vec<u32> = vec![NO_BLOCK; n];
    let mut number: Vec<u32> = vec![NO_BLOCK; n];
    let mut parent: Vec<u32> = vec![NO_BLOCK; n];

    {
        let mut next = 0u32;
        let mut stack = vec![(0u32, NO_BLOCK)];
        while let Some((block, from)) = stack.pop() {
            if number[block as usize] != NO_BLOCK {
                continue;
            }
            number[block as usize] = next;
            order[next as usize] = block;
            parent[next as usize] = from;
            next += 1;
            for succ in blocks[block as usize].next.iter().rev() {
                if number[*succ as usize] == NO_BLOCK {
                    stack.push((*succ, number[block as usize]));
                }
            }
        }
        order.truncate(next as usize);
    }

    let count = order.len();
    let mut semi: Vec<u32> = (0..count as u32).collect();
    let mut idom: Vec<u32> = vec![NO_BLOCK; count];
    let mut ancestor: Vec<u32> = vec![NO_BLOCK; count];
    let mut label: Vec<u32> = (0..count as u32).collect();
    let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); count];

    // eval with path compression over the link-eval forest
    fn eval(v: u32, ancestor: &mut [u32], label: &mut [u32], semi: &[u32]) -> u32 {
        if ancestor[v as usize] == NO_BLOCK {
            return label[v as usize];
        }

        // Iterative compress: collect the chain whose grandancestor exists,
        // then fold labels downward from the root
        let mut chain = Vec::new();
        let mut x = v;
        while ancestor[x as usize] != NO_BLOCK
            && ancestor[ancestor[x as usize] as usize] != NO_BLOCK
        {
            chain.push(x);
            x = ancestor[x as usize];
        }
        for x in chain.into_iter().rev() {
            let a = ancestor[x as usize];
            if semi[label[a as usize] as usize] < semi[label[x as usize] as usize] {
                label[x as usize] = label[a as usize];
            }
            ancestor[x as usize] = ancestor[a as usize];
        }

        label[v as usize]
    }

    for w in (1..count as u32).rev() {
        let block = order[w as usize];
        for pred in blocks[block as usize].prev.clone() {
            let v = number[pred as usize];
            if v == NO_BLOCK {
                continue;
            }
            let u = eval(v, &mut ancestor, &mut label, &semi);
            if semi[u as usize] < semi[w as usize] {
                semi[w as usize] = semi[u as usize];
            }
        }
        buckets[semi[w as usize] as usize].push(w);
        ancestor[w as usize] = parent[w as usize];

        let p = parent[w as usize];
        for v in std::mem::take(&mut buckets[p as usize]) {
            let u = eval(v, &mut ancestor, &mut label, &semi);
            idom[v as usize] = if semi[u as usize] < semi[v as usize] { u } else { p };
        }
    }

    for w in 1..count as u32 {
        if idom[w as usize] != semi[w as usize] {
            idom[w as usize] = idom[idom[w as usize] as usize];
        }
    }

    for block in blocks.iter_mut() {
        block.idom = NO_BLOCK;
        block.idominates.clear();
    }
    for w in 1..count {
        let block = order[w];
        let dominator = order[idom[w] as usize];
        blocks[block as usize].idom = dominator;
        blocks[dominator as usize].idominates.push(block);
    }

    // Pre/post order over the dominator tree for constant-time queries
    let mut clock_pre = 0u32;
    let mut clock_post = 0u32;
    let mut stack: Vec<(u32, usize)> = vec![(0, 0)];
    blocks[0].idom_pre = clock_pre;
    clock_pre += 1;
    while let Some((block, child)) = stack.pop() {
        if child < blocks[block as usize].idominates.len() {
            stack.push((block, child + 1));
            let target = blocks[block as usize].idominates[child];
            blocks[target as usize].idom_pre = clock_pre;
            clock_pre += 1;
            stack.push((target, 0));
        } else {
            blocks[block as usize].idom_post = clock_post;
            clock_post += 1;
        }
    }
}

/// True iff `dominator` dominates `dominated` (reflexively).
pub fn query_dominance(dominator: &BasicBlock, dominated: &BasicBlock) -> bool {
    dominator.idom_pre <= dominated.idom_pre && dominator.idom_post >= dominated.idom_post
}

/// Render the block graph in Graphviz dot form for debugging. Backedges are
/// dashed; blocks only reachable through an exception edge are grey.
pub fn dump_cfg_to_graphviz(out: &mut dyn std::io::Write, blocks: &[BasicBlock]) -> io::Result<()> {
    writeln!(out, "digraph cfg {{")?;
    for block in blocks {
        writeln!(
            out,
            "  b{} [label=\"{}: insns {}..{}\"{}];",
            block.index,
            block.index,
            block.start,
            block.start + block.insn_count,
            if block.nothrow_accessible { "" } else { " color=grey" },
        )?;
        for (edge, target) in block.next.iter().enumerate() {
            writeln!(
                out,
                "  b{} -> b{}{};",
                block.index,
                target,
                if block.is_backedge[edge] { " [style=dashed]" } else { "" },
            )?;
        }
    }
    writeln!(out, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::decode_code;
    use crate::jvm::class::ConstantPool;

    fn blocks_of(code: &[u8]) -> Vec<BasicBlock> {
        let decoded = decode_code(code, &ConstantPool::default()).unwrap();
        let mut blocks = scan_basic_blocks(&decoded, &[]).unwrap();
        compute_dominator_tree(&mut blocks);
        blocks
    }

    /// Reference dominator computation by iteration to a fixed point.
    fn naive_dominators(blocks: &[BasicBlock]) -> Vec<Vec<bool>> {
        let n = blocks.len();
        let mut dom = vec![vec![true; n]; n];
        dom[0] = vec![false; n];
        dom[0][0] = true;

        let mut changed = true;
        while changed {
            changed = false;
            for i in 1..n {
                if blocks[i].prev.is_empty() {
                    continue;
                }
                let mut meet = vec![true; n];
                for pred in &blocks[i].prev {
                    for x in 0..n {
                        meet[x] &= dom[*pred as usize][x];
                    }
                }
                meet[i] = true;
                if meet != dom[i] {
                    dom[i] = meet;
                    changed = true;
                }
            }
        }
        dom
    }

    #[test]
    fn diamond_blocks_and_dominators() {
        // 0: iload_0
        // 1: ifeq -> 8
        // 4: iconst_1
        // 5: istore_1
        // 6: goto -> 10
        // 8(wide pc 9?): actually pc 9: iconst_0, 10: istore_1, 11: iload_1, 12: ireturn
        #[rustfmt::skip]
        let code = [
            0x1a,                   // 0: iload_0
            0x99, 0x00, 0x08,       // 1: ifeq -> 9
            0x04,                   // 4: iconst_1
            0x3c,                   // 5: istore_1
            0xa7, 0x00, 0x05,       // 6: goto -> 11
            0x03,                   // 9: iconst_0
            0x3c,                   // 10: istore_1
            0x1b,                   // 11: iload_1
            0xac,                   // 12: ireturn
        ];
        let blocks = blocks_of(&code);

        // Entry, then-side, else-side, join
        assert_eq!(blocks.len(), 4);
        // ifeq: taken edge first, fallthrough second
        assert_eq!(blocks[0].next, vec![2, 1]);
        assert_eq!(blocks[3].prev.len(), 2);

        // Entry dominates everything; neither branch arm dominates the join
        assert!(query_dominance(&blocks[0], &blocks[3]));
        assert!(!query_dominance(&blocks[1], &blocks[3]));
        assert!(!query_dominance(&blocks[2], &blocks[3]));
        assert_eq!(blocks[3].idom, 0);
        assert!(blocks.iter().all(|b| b.nothrow_accessible));
    }

    #[test]
    fn loop_backedge_is_marked() {
        // 0: iconst_0; 1: istore_0
        // 2: iload_0; 3: bipush 10; 5: if_icmpge -> 14
        // 8: iinc 0 1; 11: goto -> 2
        // 14: return
        #[rustfmt::skip]
        let code = [
            0x03, 0x3b,
            0x1a, 0x10, 0x0a, 0xa2, 0x00, 0x09,
            0x84, 0x00, 0x01, 0xa7, 0xff, 0xf7,
            0xb1,
        ];
        let blocks = blocks_of(&code);

        let header = blocks.iter().find(|b| b.is_loop_header).expect("loop header");
        assert_eq!(header.start, 2);

        let body = blocks.iter().find(|b| b.next.contains(&header.index)).unwrap();
        let edge = body.next.iter().position(|x| *x == header.index).unwrap();
        assert!(body.is_backedge[edge]);

        // The loop header dominates the body
        assert!(query_dominance(header, body));
    }

    #[test]
    fn dominators_match_naive_iteration() {
        // A branchy method exercising switches and a loop
        #[rustfmt::skip]
        let code = [
            0x1a,                                // 0: iload_0
            0xaa, 0x00, 0x00,                    // 1: tableswitch (pad to 4)
            0x00, 0x00, 0x00, 0x1b,              // default -> 28
            0x00, 0x00, 0x00, 0x00,              // low 0
            0x00, 0x00, 0x00, 0x01,              // high 1
            0x00, 0x00, 0x00, 0x17,              // case 0 -> 24
            0x00, 0x00, 0x00, 0x1b,              // case 1 -> 28
            0x03,                                // 24: iconst_0
            0xa7, 0x00, 0x03,                    // 25: goto -> 28
            0x03,                                // 28: iconst_0 (default / case 1)
            0xac,                                // 29: ireturn
        ];
        let blocks = blocks_of(&code);
        let naive = naive_dominators(&blocks);

        for a in 0..blocks.len() {
            for b in 0..blocks.len() {
                if blocks[b].dfs_pre == 0 && b != 0 {
                    continue; // unreachable
                }
                assert_eq!(
                    query_dominance(&blocks[a], &blocks[b]),
                    naive[b][a],
                    "dominance mismatch for ({}, {})",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn graphviz_dump_names_every_block_and_edge() {
        let code = [0x1a, 0x99, 0x00, 0x05, 0x04, 0xac, 0x03, 0xac];
        let blocks = blocks_of(&code);

        let mut out = Vec::new();
        dump_cfg_to_graphviz(&mut out, &blocks).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("digraph cfg {"));
        for block in &blocks {
            assert!(text.contains(&format!("b{} [", block.index)));
        }
        assert!(text.contains("->"));
    }

    #[test]
    fn handler_blocks_are_not_nothrow_accessible() {
        // 0: iconst_0; 1: ireturn; handler at 2: iconst_1; 3: ireturn
        let code = [0x03, 0xac, 0x04, 0xac];
        let decoded = decode_code(&code, &ConstantPool::default()).unwrap();
        let mut blocks = scan_basic_blocks(&decoded, &[2]).unwrap();
        compute_dominator_tree(&mut blocks);

        let handler = blocks.iter().find(|b| b.start == 2).unwrap();
        assert!(!handler.nothrow_accessible);
        assert!(blocks[0].nothrow_accessible);
    }
}
