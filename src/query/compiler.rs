//! Lowers a parsed [`Program`] into a [`Macro`] (§4.D): assigns variable
//! slots, resolves identifiers to columns/segments/vars, emits bytecode,
//! and — where the top-level form allows it — builds the index hint
//! program and sets the `countable` / `is_segment_math` flags.

use std::collections::HashMap;

use crate::errors::{Error, Result};
use crate::query::ast::{BinOp, Expr, Modifier, Program, SegmentDecl, Stmt};
use crate::query::macro_::{Macro, TallyTargetMeta};
use crate::query::opcode::{HintOp, Marshal, Op};
use crate::query::parser;
use crate::schema::Schema;
use crate::value::Val;

pub fn compile(schema: &Schema, source: &str) -> Result<Macro> {
    let program = parser::parse(source)?;
    compile_program(schema, &program)
}

/// Compiles an already-parsed program's top-level body (§4.D), e.g. when
/// the caller has parsed `source` once to also inspect its segment
/// declarations before compiling the body.
pub fn compile_program(schema: &Schema, program: &Program) -> Result<Macro> {
    let segment_names = program.segments.iter().map(|s| s.name.clone()).collect();
    compile_body(schema, segment_names, &program.body)
}

/// Compiles a single declared segment's body in isolation (§3/§4.D): used
/// to materialize the segment's own bitmap rather than the query's result
/// tree. `sibling_segments` carries every segment name declared alongside
/// it so the body can reference them (e.g. a segment defined in terms of
/// another one declared in the same query).
pub fn compile_segment(schema: &Schema, decl: &SegmentDecl, sibling_segments: &[String]) -> Result<Macro> {
    compile_body(schema, sibling_segments.to_vec(), &decl.body)
}

fn compile_body(schema: &Schema, segment_names: Vec<String>, body: &[Stmt]) -> Result<Macro> {
    let mut compiler = Compiler {
        schema,
        macro_: Macro::new(),
        vars: HashMap::new(),
        output_columns: HashMap::new(),
        segments: segment_names,
        loops: Vec::new(),
    };
    // A bare top-level segment-math expression (the only form `is_segment_math`
    // recognizes) is compiled as an implicit return rather than push-then-pop,
    // so the cell driving this Macro can read the population off the stack
    // without ever mounting a person.
    match body {
        [Stmt::Expr(expr)] if is_segment_math(expr) => {
            compiler.compile_expr(expr)?;
            compiler.emit(Op::ReturnVal);
        }
        _ => {
            for stmt in body {
                compiler.compile_stmt(stmt)?;
            }
        }
    }
    compiler.macro_.instructions.push(Op::Exit);
    compiler.detect_index_hints(body);
    Ok(compiler.macro_)
}

struct LoopCtx {
    continue_target: usize,
    break_patches: Vec<usize>,
}

struct Compiler<'a> {
    schema: &'a Schema,
    macro_: Macro,
    vars: HashMap<String, u16>,
    output_columns: HashMap<String, u16>,
    segments: Vec<String>,
    loops: Vec<LoopCtx>,
}

impl<'a> Compiler<'a> {
    fn var_id(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.vars.get(name) {
            return id;
        }
        let id = self.macro_.var_count;
        self.macro_.var_count += 1;
        self.vars.insert(name.to_string(), id);
        id
    }

    fn output_column_id(&mut self, name: &str) -> u16 {
        if let Some(&id) = self.output_columns.get(name) {
            return id;
        }
        let id = self.output_columns.len() as u16;
        self.output_columns.insert(name.to_string(), id);
        id
    }

    fn emit(&mut self, op: Op) -> usize {
        self.macro_.instructions.push(op);
        self.macro_.len() - 1
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        self.macro_.instructions[at] = match &self.macro_.instructions[at] {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
            other => other.clone(),
        };
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Assign(name, expr) => {
                self.compile_expr(expr)?;
                let id = self.var_id(name);
                self.emit(Op::StoreVar(id));
            }
            Stmt::If { cond, then, elifs, else_ } => {
                self.compile_if(cond, then, elifs, else_)?;
            }
            Stmt::ForEvents { body } => {
                self.emit(Op::Marshal(Marshal::IterMoveFirst, 0));
                self.emit(Op::Pop);
                let loop_start = self.macro_.len();
                let check = self.emit(Op::Marshal(Marshal::IterNext, 0));
                let _ = check;
                let exit_jump = self.emit(Op::JumpIfFalse(0));
                self.loops.push(LoopCtx { continue_target: loop_start, break_patches: Vec::new() });
                for s in body {
                    self.compile_stmt(s)?;
                }
                self.emit(Op::Jump(loop_start));
                let loop_end = self.macro_.len();
                self.patch_jump(exit_jump, loop_end);
                let ctx = self.loops.pop().unwrap();
                for patch in ctx.break_patches {
                    self.patch_jump(patch, loop_end);
                }
            }
            Stmt::Tally { keys, targets } => {
                // Keys are re-evaluated per target: `Op::Tally` consumes the
                // key tuple together with the value it addresses, and the
                // stack has no way to keep a key tuple live across multiple
                // pops without a dup instruction.
                let key_count = keys.len() as u8;
                for target in targets {
                    for key in keys {
                        self.compile_expr(key)?;
                    }
                    self.compile_expr(&target.expr)?;
                    let column = self.output_column_id(&target.column);
                    let idx = self
                        .macro_
                        .push_tally_target(TallyTargetMeta { column, modifier: target.modifier });
                    self.emit(Op::Tally { key_count, target: idx });
                }
            }
            Stmt::Emit(name) => {
                let idx = self.macro_.push_literal(Val::Text(name.clone()));
                self.emit(Op::Emit(idx));
            }
            Stmt::Schedule(name, expr) => {
                let idx = self.macro_.push_literal(Val::Text(name.clone()));
                self.compile_expr(expr)?;
                self.emit(Op::Schedule(idx));
            }
            Stmt::Log(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Log);
            }
            Stmt::Debug(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Debug);
            }
            Stmt::Return(expr) => match expr {
                Some(e) => {
                    self.compile_expr(e)?;
                    self.emit(Op::ReturnVal);
                }
                None => {
                    self.emit(Op::Return);
                }
            },
            Stmt::Break => {
                let patch = self.emit(Op::Jump(0));
                match self.loops.last_mut() {
                    Some(ctx) => ctx.break_patches.push(patch),
                    None => return Err(Error::QueryCompile("break outside of for_events".into())),
                }
            }
            Stmt::Continue => {
                let target = self
                    .loops
                    .last()
                    .ok_or_else(|| Error::QueryCompile("continue outside of for_events".into()))?
                    .continue_target;
                self.emit(Op::Jump(target));
            }
            Stmt::Exit => {
                self.emit(Op::Exit);
            }
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop);
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &[Stmt],
        elifs: &[(Expr, Vec<Stmt>)],
        else_: &Option<Vec<Stmt>>,
    ) -> Result<()> {
        self.compile_expr(cond)?;
        let skip_then = self.emit(Op::JumpIfFalse(0));
        for s in then {
            self.compile_stmt(s)?;
        }
        let mut end_patches = vec![self.emit(Op::Jump(0))];
        self.patch_jump(skip_then, self.macro_.len());

        for (econd, ebody) in elifs {
            self.compile_expr(econd)?;
            let skip = self.emit(Op::JumpIfFalse(0));
            for s in ebody {
                self.compile_stmt(s)?;
            }
            end_patches.push(self.emit(Op::Jump(0)));
            self.patch_jump(skip, self.macro_.len());
        }

        if let Some(ebody) = else_ {
            for s in ebody {
                self.compile_stmt(s)?;
            }
        }

        let end = self.macro_.len();
        for patch in end_patches {
            self.patch_jump(patch, end);
        }
        Ok(())
    }

    fn resolve_ident(&mut self, name: &str) -> Op {
        if let Some(&id) = self.vars.get(name) {
            return Op::LoadVar(id);
        }
        if self.segments.iter().any(|s| s == name) {
            let idx = self.macro_.push_segment(name);
            return Op::PushSegment(idx);
        }
        if let Some(id) = self.schema.column_id(name) {
            self.macro_.reference_column(id);
            return Op::PushColumn(id);
        }
        // Unknown identifiers are treated as segments resolved at runtime
        // against the partition's attribute store (e.g. segments declared
        // in another query and referenced here by name).
        let idx = self.macro_.push_segment(name);
        Op::PushSegment(idx)
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal(v) => {
                let idx = self.macro_.push_literal(v.clone());
                self.emit(Op::PushLit(idx));
            }
            Expr::Column(name) | Expr::Var(name) | Expr::Segment(name) => {
                let op = self.resolve_ident(name);
                self.emit(op);
            }
            Expr::Unary(op, inner) => {
                self.compile_expr(inner)?;
                self.emit(Op::Unary(*op));
            }
            Expr::Binary(l, op, r) => {
                self.compile_expr(l)?;
                self.compile_expr(r)?;
                self.emit(Op::Binary(*op));
            }
            Expr::Call(name, args) => {
                let marshal = Marshal::parse(name)
                    .ok_or_else(|| Error::QueryCompile(format!("unknown function {name}")))?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Marshal(marshal, args.len() as u8));
            }
        }
        Ok(())
    }

    /// Attempts to recognize the top-level form `if <predicate>: tally(...)`
    /// where `<predicate>` is expressible purely as column-equality bitmap
    /// ops *and* `then` is a single `tally(...)` whose key tuple is
    /// constant and whose targets only use population-determined modifiers
    /// (`count`/`dist_count_person`), and the segment-math form where every
    /// leaf is a segment-math marshal call. Sets `countable` /
    /// `is_segment_math` accordingly.
    fn detect_index_hints(&mut self, body: &[Stmt]) {
        if let [Stmt::If { cond, then, elifs, else_ }] = body {
            if elifs.is_empty() && else_.is_none() {
                if let Some(keys) = population_tally_keys(then) {
                    let mut hints = Vec::new();
                    if self.build_hint(cond, &mut hints) {
                        self.macro_.hint_program = hints;
                        self.macro_.countable = true;
                        self.macro_.countable_keys = keys;
                    }
                }
            }
        }
        if let [Stmt::Expr(expr)] = body {
            if is_segment_math(expr) {
                self.macro_.is_segment_math = true;
            }
        }
    }

    /// `HintOp::Eq` carries a literal-pool index rather than a hash so that
    /// `hint::fold` can recover the exact `Val` to look up in the attribute
    /// store (text columns are keyed by value, not by a lossy digest).
    fn build_hint(&mut self, expr: &Expr, out: &mut Vec<HintOp>) -> bool {
        match expr {
            Expr::Binary(l, BinOp::Eq, r) => match (l.as_ref(), r.as_ref()) {
                (Expr::Column(name), Expr::Literal(v)) | (Expr::Literal(v), Expr::Column(name)) => {
                    match self.schema.column_id(name) {
                        Some(id) => {
                            let lit = self.macro_.push_literal(v.clone());
                            out.push(HintOp::Eq(id, lit));
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            },
            Expr::Binary(l, BinOp::And, r) => {
                self.build_hint(l, out) && self.build_hint(r, out) && {
                    out.push(HintOp::And(2));
                    true
                }
            }
            Expr::Binary(l, BinOp::Or, r) => {
                self.build_hint(l, out) && self.build_hint(r, out) && {
                    out.push(HintOp::Or(2));
                    true
                }
            }
            Expr::Unary(crate::query::ast::UnOp::Not, inner) => {
                self.build_hint(inner, out) && {
                    out.push(HintOp::Not);
                    true
                }
            }
            _ => false,
        }
    }
}

/// Recognizes `then` as exactly one `tally(<literal>, ...)` whose every
/// target is population-determined (`count`/`dist_count_person`), with no
/// nested `if`/loop that could filter further. Returns the evaluated key
/// tuple on a match.
fn population_tally_keys(then: &[Stmt]) -> Option<Vec<Val>> {
    let [Stmt::Tally { keys, targets }] = then else { return None };
    if targets.is_empty() {
        return None;
    }
    if !targets.iter().all(|t| matches!(t.modifier, Modifier::Count | Modifier::DistCountPerson)) {
        return None;
    }
    keys.iter()
        .map(|k| match k {
            Expr::Literal(v) => Some(v.clone()),
            _ => None,
        })
        .collect()
}

fn is_segment_math(expr: &Expr) -> bool {
    match expr {
        Expr::Call(name, args) => {
            Marshal::parse(name).is_some_and(Marshal::is_segment_math)
                && args.iter().all(is_segment_math_arg)
        }
        _ => false,
    }
}

fn is_segment_math_arg(expr: &Expr) -> bool {
    match expr {
        Expr::Segment(_) | Expr::Column(_) => true,
        Expr::Call(..) => is_segment_math(expr),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnType, Schema};

    #[test]
    fn simple_tally_compiles() {
        let schema = Schema::default();
        let m = compile(&schema, "tally(1):\n    n = count(1)\n").unwrap();
        assert!(m.instructions.iter().any(|op| matches!(op, Op::Tally { .. })));
    }

    #[test]
    fn countable_flag_set_for_pure_equality_predicate() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let src = "if country == \"us\":\n    tally(1):\n        n = count(1)\n";
        let m = compile(&schema, src).unwrap();
        assert!(m.countable);
        assert_eq!(m.hint_program.len(), 1);
    }

    #[test]
    fn not_countable_when_predicate_is_not_indexable() {
        let schema = Schema::default();
        let src = "if now() > 0:\n    tally(1):\n        n = count(1)\n";
        let m = compile(&schema, src).unwrap();
        assert!(!m.countable);
    }

    #[test]
    fn not_countable_when_then_applies_an_unhinted_filter() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        schema.add_column("age", ColumnType::Int).unwrap();
        let src = "if country == \"us\":\n    if age > 30:\n        tally(1):\n            n = count(1)\n";
        let m = compile(&schema, src).unwrap();
        assert!(!m.countable);
    }

    #[test]
    fn not_countable_when_tally_key_is_not_literal() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let src = "if country == \"us\":\n    tally(country):\n        n = count(1)\n";
        let m = compile(&schema, src).unwrap();
        assert!(!m.countable);
    }

    #[test]
    fn not_countable_when_modifier_needs_actual_values() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        schema.add_column("price", ColumnType::Double).unwrap();
        let src = "if country == \"us\":\n    tally(1):\n        total = sum(price)\n";
        let m = compile(&schema, src).unwrap();
        assert!(!m.countable);
    }

    #[test]
    fn segment_math_detected() {
        let schema = Schema::default();
        let m = compile(&schema, "population(intersection(a, b))\n").unwrap();
        assert!(m.is_segment_math);
    }

    #[test]
    fn break_and_continue_resolve_within_for_events() {
        let schema = Schema::default();
        let src = "for_events:\n    if now() > 0:\n        break\n    continue\n";
        let m = compile(&schema, src).unwrap();
        assert!(m.instructions.iter().any(|op| matches!(op, Op::Jump(_))));
    }
}
