//! The rewrite passes, applied in `PIPELINE` order once per round.
//!
//! Every pass gets a freshly computed `PassContext` and must leave
//! instructions alone when it cannot show a rewrite is safe. Jump targets
//! are never dropped.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use super::{InstructionInfo, PassContext, ProgramView};
use crate::code::Opcode;
use crate::value::{self, ArithOp, Value};

/// Returns whether the pass changed anything.
pub type Pass = fn(&mut ProgramView, &PassContext) -> bool;

pub const PIPELINE: &[(&str, Pass)] = &[
    ("copy-propagation", propagate_single_assignment_globals as Pass),
    ("dead-globals", eliminate_dead_globals as Pass),
    ("constant-folding", fold_constants as Pass),
    ("dead-code-after-return", eliminate_dead_code_after_return as Pass),
    ("constant-compaction", compact_constants as Pass),
];

/// Replace reads of a global that is written exactly once, from a literal,
/// with that literal.
///
/// Only stores in the straight-line prefix of the top level qualify: before
/// the first jump and the first jump target, the store runs exactly once and
/// before anything that could read the slot.
pub fn propagate_single_assignment_globals(view: &mut ProgramView, ctx: &PassContext) -> bool {
    let Some(top) = view.streams.first() else { return false };
    let first_jump = top.instructions.iter().find(|ins| ins.is_jump).map(|ins| ins.offset);
    let first_target = ctx.jump_targets.first().and_then(|t| t.iter().min().copied());
    let limit = first_jump.into_iter().chain(first_target).min().unwrap_or(usize::MAX);

    let mut candidates = Vec::new();
    for pair in top.instructions.windows(2) {
        let (value, store) = (&pair[0], &pair[1]);
        if store.offset >= limit {
            break;
        }
        if store.opcode != Opcode::SetGlobal || !value.is_literal_push() {
            continue;
        }
        let slot = store.operands[0];
        if ctx.global_writes.get(&slot) == Some(&1) && ctx.global_reads.contains(&slot) {
            candidates.push((slot, store.offset, value.opcode, value.operands.clone()));
        }
    }

    let mut changed = false;
    for (slot, store_offset, opcode, operands) in candidates {
        for (s, stream) in view.streams.iter_mut().enumerate() {
            for ins in &mut stream.instructions {
                let after_store = s != 0 || ins.offset > store_offset;
                if ins.opcode == Opcode::GetGlobal && ins.operands[0] == slot && after_store {
                    trace!(target: "zen::optimizer", slot, stream = s, offset = ins.offset, "propagated literal");
                    ins.rewrite(opcode, operands.clone());
                    changed = true;
                }
            }
        }
    }
    changed
}

/// Drop stores to globals nobody reads, together with the instructions that
/// produced the stored value when those are free of side effects.
pub fn eliminate_dead_globals(view: &mut ProgramView, ctx: &PassContext) -> bool {
    let mut changed = false;
    let ProgramView { streams, constants } = view;
    for (s, stream) in streams.iter_mut().enumerate() {
        let Some(targets) = ctx.jump_targets.get(s) else { continue };
        let insts = &mut stream.instructions;
        for i in 1..insts.len() {
            let store = &insts[i];
            if !store.keep || store.opcode != Opcode::SetGlobal {
                continue;
            }
            let slot = store.operands[0];
            if ctx.global_reads.contains(&slot) || targets.contains(&store.offset) {
                continue;
            }
            let walker = ProducerWalk { insts: &insts[..], constants: &constants[..], targets };
            let Some(start) = walker.value_start(i - 1) else { continue };
            trace!(target: "zen::optimizer", slot, stream = s, removed = i + 1 - start, "removed dead global store");
            for ins in &mut insts[start..=i] {
                ins.keep = false;
            }
            changed = true;
        }
    }
    changed
}

/// Backward walk over side-effect-free value producers.
struct ProducerWalk<'a> {
    insts: &'a [InstructionInfo],
    constants: &'a [Value],
    targets: &'a std::collections::HashSet<usize>,
}

impl ProducerWalk<'_> {
    /// Index of the first instruction of the pure expression whose last
    /// instruction is `end`, or `None` if it is not one.
    fn value_start(&self, end: usize) -> Option<usize> {
        let ins = &self.insts[end];
        if !ins.keep || self.targets.contains(&ins.offset) {
            return None;
        }
        match ins.opcode {
            Opcode::Constant
            | Opcode::Null
            | Opcode::True
            | Opcode::False
            | Opcode::GetGlobal
            | Opcode::GetLocal
            | Opcode::GetFree
            | Opcode::GetBuiltin
            | Opcode::GetGlobalBuiltin
            | Opcode::CurrentClosure => Some(end),
            Opcode::Array => self.operands_start(end, ins.operands[0], false),
            Opcode::Hash => self.operands_start(end, ins.operands[0], true),
            Opcode::Closure => self.operands_start(end, ins.operands[1], false),
            _ => None,
        }
    }

    /// Walk back over the `count` values consumed by the construct at `construct`.
    fn operands_start(&self, construct: usize, count: usize, hash: bool) -> Option<usize> {
        let mut start = construct;
        for n in 0..count {
            let end = start.checked_sub(1)?;
            let value_start = self.value_start(end)?;
            // Walking backwards, every second hash operand is a key. Keys must
            // be literals so building the hash cannot fail.
            if hash && n % 2 == 1 && (value_start != end || !self.is_hashable_literal(&self.insts[end])) {
                return None;
            }
            start = value_start;
        }
        Some(start)
    }

    fn is_hashable_literal(&self, ins: &InstructionInfo) -> bool {
        match ins.opcode {
            Opcode::True | Opcode::False => true,
            Opcode::Constant => matches!(
                self.constants.get(ins.operands[0]),
                Some(Value::Integer(_) | Value::String(_) | Value::Boolean(_))
            ),
            _ => false,
        }
    }
}

/// Collapse `push a; push b; <arith>` into a single push of the result.
pub fn fold_constants(view: &mut ProgramView, ctx: &PassContext) -> bool {
    let mut changed = false;
    let ProgramView { streams, constants } = view;
    for (s, stream) in streams.iter_mut().enumerate() {
        let insts = &mut stream.instructions;
        // Indices of kept instructions; folding pops the operand and operator
        // so the result can feed a following fold.
        let mut window: Vec<usize> = Vec::new();
        for idx in 0..insts.len() {
            if !insts[idx].keep {
                continue;
            }
            window.push(idx);
            let n = window.len();
            if n < 3 {
                continue;
            }
            let (a, b, op) = (window[n - 3], window[n - 2], window[n - 1]);
            if ctx.is_jump_target(s, insts[b].offset) || ctx.is_jump_target(s, insts[op].offset) {
                continue;
            }
            let Some(result) = fold(&insts[a], &insts[b], &insts[op], constants) else { continue };
            let Some(index) = intern(constants, result) else { continue };
            trace!(target: "zen::optimizer", stream = s, offset = insts[a].offset, constant = index, "folded constants");
            insts[a].rewrite(Opcode::Constant, vec![index]);
            insts[b].keep = false;
            insts[op].keep = false;
            window.truncate(n - 2);
            changed = true;
        }
    }
    changed
}

fn fold(a: &InstructionInfo, b: &InstructionInfo, op: &InstructionInfo, constants: &[Value]) -> Option<Value> {
    let arith = match op.opcode {
        Opcode::Add => ArithOp::Add,
        Opcode::Sub => ArithOp::Sub,
        Opcode::Mul => ArithOp::Mul,
        Opcode::Div => ArithOp::Div,
        Opcode::Pow => ArithOp::Pow,
        Opcode::Mod => ArithOp::Mod,
        _ => return None,
    };
    if a.opcode != Opcode::Constant || b.opcode != Opcode::Constant {
        return None;
    }
    let left = constants.get(a.operands[0])?;
    let right = constants.get(b.operands[0])?;
    if !left.is_numeric() || !right.is_numeric() {
        return None;
    }
    // Operations that fail at run time are left for the VM to report.
    value::arithmetic(arith, left, right).ok()
}

/// Index of `value` in the pool, appending it if absent. `None` when the
/// index would not fit in an operand.
fn intern(constants: &mut Vec<Value>, value: Value) -> Option<usize> {
    if let Some(i) = constants.iter().position(|c| c.same(&value)) {
        return Some(i);
    }
    if constants.len() > u16::MAX as usize {
        return None;
    }
    constants.push(value);
    Some(constants.len() - 1)
}

/// After a return, nothing runs until control re-enters at a jump target.
pub fn eliminate_dead_code_after_return(view: &mut ProgramView, ctx: &PassContext) -> bool {
    let mut changed = false;
    for (s, stream) in view.streams.iter_mut().enumerate() {
        let mut dead = false;
        for ins in stream.instructions.iter_mut().filter(|ins| ins.keep) {
            if dead && ctx.is_jump_target(s, ins.offset) {
                dead = false;
            }
            if dead {
                ins.keep = false;
                changed = true;
                continue;
            }
            if matches!(ins.opcode, Opcode::ReturnValue | Opcode::Return) {
                dead = true;
            }
        }
        if changed {
            trace!(target: "zen::optimizer", stream = s, "removed unreachable code");
        }
    }
    changed
}

/// Keep only constants reachable from the top level, following closures
/// into function bodies, and renumber every reference.
pub fn compact_constants(view: &mut ProgramView, _ctx: &PassContext) -> bool {
    let stream_of: HashMap<usize, usize> = view
        .streams
        .iter()
        .enumerate()
        .filter_map(|(s, stream)| stream.owner.map(|owner| (owner, s)))
        .collect();

    let mut used = BTreeSet::new();
    let mut pending = vec![0];
    while let Some(s) = pending.pop() {
        for ins in view.streams[s].instructions.iter().filter(|ins| ins.keep) {
            if !matches!(ins.opcode, Opcode::Constant | Opcode::Closure) {
                continue;
            }
            let index = ins.operands[0];
            if index < view.constants.len() && used.insert(index) {
                if let Some(&body) = stream_of.get(&index) {
                    pending.push(body);
                }
            }
        }
    }
    if used.len() == view.constants.len() {
        return false;
    }

    let remap: HashMap<usize, usize> = used.iter().enumerate().map(|(new, &old)| (old, new)).collect();
    view.constants = used.iter().map(|&old| view.constants[old].clone()).collect();
    view.streams.retain(|stream| stream.owner.is_none_or(|owner| remap.contains_key(&owner)));
    for stream in &mut view.streams {
        stream.owner = stream.owner.and_then(|owner| remap.get(&owner).copied());
        for ins in &mut stream.instructions {
            if matches!(ins.opcode, Opcode::Constant | Opcode::Closure) {
                if let Some(&new) = remap.get(&ins.operands[0]) {
                    ins.operands[0] = new;
                }
            }
        }
    }
    trace!(target: "zen::optimizer", kept = view.constants.len(), "compacted constant pool");
    true
}
