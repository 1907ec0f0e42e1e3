//! Bytecode rewriting.
//!
//! Each round decodes every instruction stream (the top level and each
//! compiled function in the constant pool) into `InstructionInfo` records,
//! runs the passes in order, and re-encodes. A pass only clears `keep` flags
//! or rewrites instructions in place; `ProgramView::relayout` then drops the
//! unkept records and rewrites jump operands through an old-to-new offset map.
//! Rounds stop at the budget or when a round leaves the program unchanged.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::bytecode::Bytecode;
use crate::code::{self, Instructions, Opcode};
use crate::value::{CompiledFunction, Value};

pub mod passes;

pub const DEFAULT_ROUNDS: usize = 10;

/// Optimize with the default round budget.
pub fn optimize(bytecode: &Bytecode) -> Bytecode {
    optimize_with_rounds(bytecode, DEFAULT_ROUNDS)
}

/// Optimize with an explicit round budget. Zero rounds returns an identical
/// copy. The input is never modified.
pub fn optimize_with_rounds(bytecode: &Bytecode, rounds: usize) -> Bytecode {
    let mut current = bytecode.clone();
    for round in 0..rounds {
        let Some(next) = run_round(&current) else {
            debug!(target: "zen::optimizer", round, "undecodable instruction stream, leaving program untouched");
            break;
        };
        if next.same(&current) {
            debug!(target: "zen::optimizer", round, "fixed point reached");
            break;
        }
        debug!(
            target: "zen::optimizer",
            round,
            before = current.instructions.len(),
            after = next.instructions.len(),
            constants = next.constants.len(),
            "round changed program"
        );
        current = next;
    }
    current
}

fn run_round(bytecode: &Bytecode) -> Option<Bytecode> {
    let mut view = ProgramView::decode(bytecode)?;
    for (name, pass) in passes::PIPELINE {
        let ctx = PassContext::compute(&view);
        if pass(&mut view, &ctx) {
            trace!(target: "zen::optimizer", pass = name, "pass rewrote program");
        }
        view.relayout();
    }
    Some(view.encode())
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionInfo {
    pub opcode: Opcode,
    pub operands: Vec<usize>,
    pub width: usize,
    pub offset: usize,
    pub keep: bool,
    pub is_jump: bool,
}

impl InstructionInfo {
    pub fn new(opcode: Opcode, operands: Vec<usize>, offset: usize) -> Self {
        InstructionInfo {
            opcode,
            operands,
            width: opcode.width(),
            offset,
            keep: true,
            is_jump: opcode.is_jump(),
        }
    }

    /// Replace this instruction with another at the same position.
    pub fn rewrite(&mut self, opcode: Opcode, operands: Vec<usize>) {
        self.opcode = opcode;
        self.operands = operands;
        self.width = opcode.width();
        self.is_jump = opcode.is_jump();
    }

    /// A zero-effect push of a value known at compile time.
    pub fn is_literal_push(&self) -> bool {
        matches!(self.opcode, Opcode::Constant | Opcode::Null | Opcode::True | Opcode::False)
    }
}

/// A decoded instruction stream and where it came from.
#[derive(Debug, Clone)]
pub struct Stream {
    pub instructions: Vec<InstructionInfo>,
    /// Constant-pool index of the owning function; `None` for the top level.
    pub owner: Option<usize>,
    pub num_locals: usize,
    pub num_parameters: usize,
}

impl Stream {
    fn decode(instructions: &Instructions, owner: Option<usize>, num_locals: usize, num_parameters: usize) -> Option<Stream> {
        let decoded = instructions.decode().ok()?;
        Some(Stream {
            instructions: decoded
                .into_iter()
                .map(|(offset, op, operands)| InstructionInfo::new(op, operands, offset))
                .collect(),
            owner,
            num_locals,
            num_parameters,
        })
    }

    fn encode(&self) -> Instructions {
        let parts: Vec<Vec<u8>> = self
            .instructions
            .iter()
            .filter(|ins| ins.keep)
            .map(|ins| code::make(ins.opcode, &ins.operands))
            .collect();
        code::concat(&parts)
    }

    /// Drop unkept instructions, recompute offsets and retarget jumps.
    /// A jump whose target was dropped lands on the next kept instruction.
    fn relayout(&mut self) {
        let old_len = self.instructions.last().map_or(0, |ins| ins.offset + ins.width);
        let new_len: usize = self.instructions.iter().filter(|ins| ins.keep).map(|ins| ins.width).sum();

        let mut new_offsets = Vec::with_capacity(self.instructions.len());
        let mut next = 0;
        for ins in &self.instructions {
            new_offsets.push(next);
            if ins.keep {
                next += ins.width;
            }
        }

        let mut offset_map: HashMap<usize, usize> = HashMap::with_capacity(self.instructions.len() + 1);
        offset_map.insert(old_len, new_len);
        let mut following = new_len;
        for (ins, &new_offset) in self.instructions.iter().zip(&new_offsets).rev() {
            if ins.keep {
                following = new_offset;
            }
            offset_map.insert(ins.offset, following);
        }

        self.instructions.retain(|ins| ins.keep);
        let mut offset = 0;
        for ins in &mut self.instructions {
            if ins.is_jump {
                if let Some(&target) = ins.operands.first().and_then(|t| offset_map.get(t)) {
                    ins.operands[0] = target;
                }
            }
            ins.offset = offset;
            offset += ins.width;
        }
    }
}

/// All instruction streams of a program plus its constant pool, decoded for
/// rewriting. Stream 0 is the top level.
#[derive(Debug, Clone)]
pub struct ProgramView {
    pub streams: Vec<Stream>,
    pub constants: Vec<Value>,
}

impl ProgramView {
    pub fn decode(bytecode: &Bytecode) -> Option<ProgramView> {
        let mut streams = vec![Stream::decode(&bytecode.instructions, None, 0, 0)?];
        for (index, constant) in bytecode.constants.iter().enumerate() {
            if let Value::CompiledFunction(func) = constant {
                streams.push(Stream::decode(&func.instructions, Some(index), func.num_locals, func.num_parameters)?);
            }
        }
        Some(ProgramView { streams, constants: bytecode.constants.clone() })
    }

    pub fn encode(&self) -> Bytecode {
        let mut constants = self.constants.clone();
        let mut instructions = Instructions::new();
        for stream in &self.streams {
            let encoded = stream.encode();
            match stream.owner {
                None => instructions = encoded,
                Some(index) => {
                    if let Some(slot) = constants.get_mut(index) {
                        *slot = Value::CompiledFunction(Rc::new(CompiledFunction {
                            instructions: encoded,
                            num_locals: stream.num_locals,
                            num_parameters: stream.num_parameters,
                        }));
                    }
                }
            }
        }
        Bytecode { instructions, constants }
    }

    pub fn relayout(&mut self) {
        for stream in &mut self.streams {
            stream.relayout();
        }
    }
}

/// Facts about the whole program, recomputed before every pass.
#[derive(Debug, Default, Clone)]
pub struct PassContext {
    /// Jump target offsets, indexed like `ProgramView::streams`.
    pub jump_targets: Vec<HashSet<usize>>,
    /// Global slots read anywhere.
    pub global_reads: HashSet<usize>,
    /// Number of store instructions per global slot, anywhere.
    pub global_writes: HashMap<usize, usize>,
}

impl PassContext {
    pub fn compute(view: &ProgramView) -> PassContext {
        let mut ctx = PassContext::default();
        for stream in &view.streams {
            let mut targets = HashSet::new();
            for ins in stream.instructions.iter().filter(|ins| ins.keep) {
                match ins.opcode {
                    Opcode::Jump | Opcode::JumpNotTruthy => {
                        targets.insert(ins.operands[0]);
                    }
                    Opcode::GetGlobal => {
                        ctx.global_reads.insert(ins.operands[0]);
                    }
                    Opcode::SetGlobal => {
                        *ctx.global_writes.entry(ins.operands[0]).or_insert(0) += 1;
                    }
                    _ => {}
                }
            }
            ctx.jump_targets.push(targets);
        }
        ctx
    }

    pub fn is_jump_target(&self, stream: usize, offset: usize) -> bool {
        self.jump_targets.get(stream).is_some_and(|t| t.contains(&offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{concat, make};
    use crate::compiler::Compiler;

    fn compile(source: &str) -> Bytecode {
        let tokens = crate::lexer::lex(source).unwrap();
        let program = crate::parser::parse(tokens).unwrap();
        let mut compiler = Compiler::new("test.zen");
        compiler.compile(&program).unwrap();
        compiler.bytecode()
    }

    fn assert_jumps_land_on_instructions(bytecode: &Bytecode) {
        for stream in bytecode.streams() {
            let decoded = stream.decode().unwrap();
            let starts: HashSet<usize> = decoded.iter().map(|(offset, _, _)| *offset).collect();
            for (offset, op, operands) in &decoded {
                if op.is_jump() {
                    assert!(
                        starts.contains(&operands[0]),
                        "jump at {} targets {} which is not an instruction start\n{}",
                        offset,
                        operands[0],
                        bytecode.disassemble()
                    );
                }
            }
        }
    }

    #[test]
    fn dead_global_is_removed() {
        let optimized = optimize(&compile("var a = 5; 10"));
        assert_eq!(
            optimized.instructions,
            concat(&[make(Opcode::Constant, &[0]), make(Opcode::Pop, &[])])
        );
        assert_eq!(optimized.constants.len(), 1);
        assert!(optimized.constants[0].same(&Value::Integer(10)));
    }

    #[test]
    fn single_assignment_literal_is_propagated() {
        let optimized = optimize(&compile("var a = 5; a + 1"));
        assert_eq!(
            optimized.instructions,
            concat(&[make(Opcode::Constant, &[0]), make(Opcode::Pop, &[])])
        );
        assert!(optimized.constants[0].same(&Value::Integer(6)));
    }

    #[test]
    fn reassigned_global_is_not_propagated() {
        let optimized = optimize(&compile("var a = 5; a = 6; a"));
        let ops: Vec<Opcode> = optimized.instructions.decode().unwrap().iter().map(|(_, op, _)| *op).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::Constant,
                Opcode::SetGlobal,
                Opcode::Constant,
                Opcode::SetGlobal,
                Opcode::GetGlobal,
                Opcode::Pop
            ]
        );
    }

    #[test]
    fn folding_follows_promotion() {
        let optimized = optimize(&compile("1 + 2; 1 + 2.0; 7 / 2"));
        let values: Vec<String> = optimized.constants.iter().map(|c| c.to_string()).collect();
        assert_eq!(values, vec!["3", "3.0"]);
        assert!(optimized.constants[0].same(&Value::Integer(3)));
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let optimized = optimize(&compile("1 / 0"));
        let ops: Vec<Opcode> = optimized.instructions.decode().unwrap().iter().map(|(_, op, _)| *op).collect();
        assert_eq!(ops, vec![Opcode::Constant, Opcode::Constant, Opcode::Div, Opcode::Pop]);
    }

    #[test]
    fn zero_rounds_is_a_copy() {
        let original = compile("var a = 5; 10");
        assert!(optimize_with_rounds(&original, 0).same(&original));
    }

    #[test]
    fn optimizing_twice_changes_nothing() {
        let sources = [
            "var a = 5; var b = [a, 2]; 10",
            "func f(n) { if (n < 2) { return n } return f(n - 1) + 1 } f(3)",
            "var i = 0; while (i < 3) { i = i + 1; if (i == 2) { continue } } i",
            "var h = {\"k\": 1 + 2}; h.k",
        ];
        for source in sources {
            let once = optimize(&compile(source));
            let twice = optimize(&once);
            assert!(twice.same(&once), "not idempotent for {}", source);
            assert_jumps_land_on_instructions(&once);
        }
    }

    #[test]
    fn code_after_return_is_removed() {
        let optimized = optimize(&compile("func() { return 1; 2 }"));
        let func = optimized
            .constants
            .iter()
            .find_map(|c| match c {
                Value::CompiledFunction(f) => Some(f.clone()),
                _ => None,
            })
            .unwrap();
        let ops: Vec<Opcode> = func.instructions.decode().unwrap().iter().map(|(_, op, _)| *op).collect();
        assert_eq!(ops, vec![Opcode::Constant, Opcode::ReturnValue]);
    }

    #[test]
    fn relayout_retargets_jumps() {
        let mut stream = Stream::decode(
            &concat(&[
                make(Opcode::True, &[]),            // 0000
                make(Opcode::JumpNotTruthy, &[6]),  // 0001
                make(Opcode::Null, &[]),            // 0004
                make(Opcode::Pop, &[]),             // 0005
                make(Opcode::Jump, &[9]),           // 0006
                make(Opcode::Null, &[]),            // 0009
            ]),
            None,
            0,
            0,
        )
        .unwrap();
        stream.instructions[2].keep = false;
        stream.instructions[3].keep = false;
        stream.relayout();
        assert_eq!(
            stream.encode(),
            concat(&[
                make(Opcode::True, &[]),
                make(Opcode::JumpNotTruthy, &[4]),
                make(Opcode::Jump, &[7]),
                make(Opcode::Null, &[]),
            ])
        );
        assert_eq!(stream.instructions[3].offset, 7);
    }

    #[test]
    fn dropped_jump_target_moves_to_next_kept_instruction() {
        let mut stream = Stream::decode(
            &concat(&[
                make(Opcode::Jump, &[3]),  // 0000
                make(Opcode::Null, &[]),   // 0003
                make(Opcode::True, &[]),   // 0004
            ]),
            None,
            0,
            0,
        )
        .unwrap();
        stream.instructions[1].keep = false;
        stream.relayout();
        assert_eq!(stream.instructions[0].operands, vec![3]);
        assert_eq!(stream.instructions[1].opcode, Opcode::True);
        assert_eq!(stream.instructions[1].offset, 3);
    }

    #[test]
    fn context_collects_reads_writes_and_targets() {
        let view = ProgramView::decode(&compile("var a = 1; func() { a = 2; a }; if (a) { 1 }")).unwrap();
        let ctx = PassContext::compute(&view);
        assert!(ctx.global_reads.contains(&0));
        assert_eq!(ctx.global_writes.get(&0), Some(&2));
        assert!(!ctx.jump_targets[0].is_empty());
    }

    #[test]
    fn malformed_input_is_left_untouched() {
        let bytecode = Bytecode::new(Instructions(vec![Opcode::Constant as u8, 0]), vec![]);
        assert!(optimize(&bytecode).same(&bytecode));
    }
}
