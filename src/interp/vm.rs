//! Stack-based interpreter (§4.E): executes a compiled [`Macro`] against one
//! mounted [`Grid`] and the partition's [`AttributeStore`]. `for_events`
//! loops are not special-cased here — the compiler already lowered them to
//! jumps around `iter_next`, so this is a single linear fetch-execute loop
//! over `Vec<Op>` with a program counter.

use crate::errors::{Error, Result};
use crate::index::{AttributeStore, IndexBits};
use crate::interp::marshals;
use crate::interp::result::ResultSet;
use crate::person::grid::Grid;
use crate::query::ast::{BinOp, UnOp};
use crate::query::macro_::Macro;
use crate::query::opcode::{Marshal, Op};
use crate::schema::{Schema, TIME_COLUMN};
use crate::value::Val;

/// One VM operand stack slot: marshals like `intersection`/`population`
/// operate on bitmaps rather than plain values, so the stack must carry
/// both (§4.D/§4.E).
#[derive(Debug, Clone)]
enum Operand {
    Scalar(Val),
    Bits(Box<IndexBits>),
}

pub struct Interp<'a> {
    schema: &'a Schema,
    grid: &'a Grid,
    store: &'a AttributeStore,
    capacity: usize,
    now_ms: i64,

    vars: Vec<Val>,
    stack: Vec<Operand>,
    /// Current row cursor. `None` until a `for_events` loop (or an explicit
    /// `iter_move_first`/`iter_move_last`) positions it; a query that never
    /// iterates sees the grid's most recent row (§4.E open question: bare
    /// column references default to "current value", not "first event").
    cursor: Option<usize>,
    bound_lo: Option<i64>,
    bound_hi: Option<i64>,

    results: ResultSet,
    emitted: Vec<String>,
    scheduled: Vec<(String, Val)>,
    log_lines: Vec<String>,
    debug_lines: Vec<String>,
    returned: Option<Val>,
}

impl<'a> Interp<'a> {
    pub fn new(schema: &'a Schema, grid: &'a Grid, store: &'a AttributeStore, capacity: usize, now_ms: i64) -> Interp<'a> {
        Interp {
            schema,
            grid,
            store,
            capacity,
            now_ms,
            vars: Vec::new(),
            stack: Vec::new(),
            cursor: None,
            bound_lo: None,
            bound_hi: None,
            results: ResultSet::new(),
            emitted: Vec::new(),
            scheduled: Vec::new(),
            log_lines: Vec::new(),
            debug_lines: Vec::new(),
            returned: None,
        }
    }

    pub fn results(&self) -> &ResultSet {
        &self.results
    }

    pub fn emitted(&self) -> &[String] {
        &self.emitted
    }

    pub fn scheduled(&self) -> &[(String, Val)] {
        &self.scheduled
    }

    pub fn log_lines(&self) -> &[String] {
        &self.log_lines
    }

    pub fn debug_lines(&self) -> &[String] {
        &self.debug_lines
    }

    pub fn returned(&self) -> Option<&Val> {
        self.returned.as_ref()
    }

    fn current_row(&self) -> Option<usize> {
        self.cursor.or_else(|| self.grid.row_count().checked_sub(1))
    }

    fn row_in_bounds(&self, row: usize) -> bool {
        if self.bound_lo.is_none() && self.bound_hi.is_none() {
            return true;
        }
        let Some(time_col) = self.schema.column_id(TIME_COLUMN) else { return true };
        let t = self.grid.column_value(row, time_col).and_then(Val::as_i64).unwrap_or(0);
        if let Some(lo) = self.bound_lo {
            if t < lo {
                return false;
            }
        }
        if let Some(hi) = self.bound_hi {
            if t > hi {
                return false;
            }
        }
        true
    }

    fn pop(&mut self) -> Result<Operand> {
        self.stack.pop().ok_or_else(|| Error::QueryRuntime("operand stack underflow".into()))
    }

    fn pop_scalar(&mut self) -> Result<Val> {
        match self.pop()? {
            Operand::Scalar(v) => Ok(v),
            Operand::Bits(_) => Err(Error::QueryRuntime("expected a scalar, found a bitmap".into())),
        }
    }

    fn pop_bits(&mut self) -> Result<IndexBits> {
        match self.pop()? {
            Operand::Bits(b) => Ok(*b),
            Operand::Scalar(_) => Err(Error::QueryRuntime("expected a bitmap, found a scalar".into())),
        }
    }

    fn push_scalar(&mut self, v: Val) {
        self.stack.push(Operand::Scalar(v));
    }

    fn push_bits(&mut self, b: IndexBits) {
        self.stack.push(Operand::Bits(Box::new(b)));
    }

    /// Pop `n` scalar args and return them in original (left-to-right) push
    /// order: the compiler pushes `arg0, arg1, ..., argN`, so the stack has
    /// `argN` on top.
    fn pop_scalar_args(&mut self, n: usize) -> Result<Vec<Val>> {
        let mut args = Vec::with_capacity(n);
        for _ in 0..n {
            args.push(self.pop_scalar()?);
        }
        args.reverse();
        Ok(args)
    }

    /// Runs `macro_` to completion (an explicit `return`/`exit`, or falling
    /// off the end — every compiled program ends in `Op::Exit`).
    pub fn run(&mut self, macro_: &Macro) -> Result<()> {
        let mut pc = 0usize;
        while pc < macro_.instructions.len() {
            match &macro_.instructions[pc] {
                Op::PushLit(idx) => {
                    let v = macro_.literals[*idx as usize].clone();
                    self.push_scalar(v);
                }
                Op::PushColumn(col) => {
                    let v = match self.current_row() {
                        Some(row) => self.grid.column_value(row, *col).cloned().unwrap_or(Val::Null),
                        None => Val::Null,
                    };
                    self.push_scalar(v);
                }
                Op::PushSegment(idx) => {
                    let name = &macro_.segments[*idx as usize];
                    let bits = self
                        .store
                        .get_segment(name)
                        .map(|(bits, _)| bits)
                        .unwrap_or_else(|| IndexBits::new(self.capacity));
                    self.push_bits(bits);
                }
                Op::LoadVar(id) => {
                    let v = self.vars.get(*id as usize).cloned().unwrap_or(Val::Null);
                    self.push_scalar(v);
                }
                Op::StoreVar(id) => {
                    let v = self.pop_scalar()?;
                    let id = *id as usize;
                    if self.vars.len() <= id {
                        self.vars.resize(id + 1, Val::Null);
                    }
                    self.vars[id] = v;
                }
                Op::Unary(op) => {
                    let v = self.pop_scalar()?;
                    self.push_scalar(eval_unary(*op, v));
                }
                Op::Binary(op) => {
                    let r = self.pop_scalar()?;
                    let l = self.pop_scalar()?;
                    self.push_scalar(eval_binary(*op, l, r));
                }
                Op::JumpIfFalse(target) => {
                    let cond = self.pop_scalar()?;
                    if !cond.as_bool().unwrap_or(false) {
                        pc = *target;
                        continue;
                    }
                }
                Op::Jump(target) => {
                    pc = *target;
                    continue;
                }
                Op::Marshal(marshal, argc) => {
                    self.exec_marshal(*marshal, *argc)?;
                }
                Op::Tally { key_count, target } => {
                    let value = self.pop_scalar()?;
                    let mut keys = Vec::with_capacity(*key_count as usize);
                    for _ in 0..*key_count {
                        keys.push(self.pop_scalar()?);
                    }
                    keys.reverse();
                    let meta = &macro_.tally_targets[*target as usize];
                    self.results.record(keys, meta.column as u32, meta.modifier, &value, self.grid.linear_id);
                }
                Op::Emit(idx) => {
                    if let Val::Text(name) = &macro_.literals[*idx as usize] {
                        self.emitted.push(name.clone());
                    }
                }
                Op::Schedule(idx) => {
                    let value = self.pop_scalar()?;
                    if let Val::Text(name) = &macro_.literals[*idx as usize] {
                        self.scheduled.push((name.clone(), value));
                    }
                }
                Op::Log => {
                    let v = self.pop_scalar()?;
                    log::info!("{v}");
                    self.log_lines.push(v.to_string());
                }
                Op::Debug => {
                    let v = self.pop_scalar()?;
                    log::debug!("{v}");
                    self.debug_lines.push(v.to_string());
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Return => break,
                Op::ReturnVal => {
                    let v = self.pop_scalar()?;
                    self.returned = Some(v);
                    break;
                }
                Op::Exit => break,
            }
            pc += 1;
        }
        Ok(())
    }

    fn exec_marshal(&mut self, marshal: Marshal, argc: u8) -> Result<()> {
        match marshal {
            Marshal::Now => self.push_scalar(Val::Int(self.now_ms)),
            Marshal::EventTime => {
                let time_col = self
                    .schema
                    .column_id(TIME_COLUMN)
                    .ok_or_else(|| Error::BadSchema("no time column".into()))?;
                let v = match self.current_row() {
                    Some(row) => self.grid.column_value(row, time_col).cloned().unwrap_or(Val::Null),
                    None => Val::Null,
                };
                self.push_scalar(v);
            }
            Marshal::DateSecond
            | Marshal::DateMinute
            | Marshal::DateHour
            | Marshal::DateDay
            | Marshal::DateWeek
            | Marshal::DateMonth
            | Marshal::DateYear => {
                let args = self.pop_scalar_args(1)?;
                let ts = args[0].as_i64().unwrap_or(self.now_ms);
                self.push_scalar(Val::Int(marshals::date_round(marshal, ts)));
            }
            Marshal::GetSecond
            | Marshal::GetMinute
            | Marshal::GetHour
            | Marshal::GetDayOfWeek
            | Marshal::GetDayOfMonth
            | Marshal::GetMonth
            | Marshal::GetYear => {
                let args = self.pop_scalar_args(1)?;
                let ts = args[0].as_i64().unwrap_or(self.now_ms);
                self.push_scalar(Val::Int(marshals::get_part(marshal, ts)));
            }
            Marshal::Population => {
                let bits = self.pop_bits()?;
                self.push_scalar(Val::Int(bits.population() as i64));
            }
            Marshal::Intersection => {
                let b = self.pop_bits()?;
                let a = self.pop_bits()?;
                self.push_bits(marshals::intersection(&a, &b));
            }
            Marshal::Union => {
                let b = self.pop_bits()?;
                let a = self.pop_bits()?;
                self.push_bits(marshals::union(&a, &b));
            }
            Marshal::Difference => {
                let b = self.pop_bits()?;
                let a = self.pop_bits()?;
                self.push_bits(marshals::difference(&a, &b));
            }
            Marshal::Compliment => {
                let a = self.pop_bits()?;
                self.push_bits(marshals::compliment(&a));
            }
            Marshal::IterMoveFirst => {
                self.cursor = if self.grid.row_count() > 0 { Some(0) } else { None };
                self.push_scalar(Val::Bool(self.cursor.is_some()));
            }
            Marshal::IterMoveLast => {
                self.cursor = self.grid.row_count().checked_sub(1);
                self.push_scalar(Val::Bool(self.cursor.is_some()));
            }
            Marshal::IterNext => {
                let start = self.cursor.map(|c| c + 1).unwrap_or(0);
                let found = (start..self.grid.row_count()).find(|&i| self.row_in_bounds(i));
                match found {
                    Some(i) => {
                        self.cursor = Some(i);
                        self.push_scalar(Val::Bool(true));
                    }
                    None => self.push_scalar(Val::Bool(false)),
                }
            }
            Marshal::IterPrev => {
                let found = match self.cursor {
                    Some(0) | None => None,
                    Some(c) => (0..c).rev().find(|&i| self.row_in_bounds(i)),
                };
                match found {
                    Some(i) => {
                        self.cursor = Some(i);
                        self.push_scalar(Val::Bool(true));
                    }
                    None => self.push_scalar(Val::Bool(false)),
                }
            }
            Marshal::IterWithin => {
                let args = self.pop_scalar_args(1)?;
                let window_ms = args[0].as_i64().unwrap_or(0);
                self.bound_hi = Some(self.now_ms);
                self.bound_lo = Some(self.now_ms - window_ms);
                self.push_scalar(Val::Bool(true));
            }
            Marshal::IterBetween => {
                let args = self.pop_scalar_args(2)?;
                self.bound_lo = args[0].as_i64();
                self.bound_hi = args[1].as_i64();
                self.push_scalar(Val::Bool(true));
            }
        }
        let _ = argc;
        Ok(())
    }
}

fn eval_unary(op: UnOp, v: Val) -> Val {
    match op {
        UnOp::Not => Val::Bool(!v.as_bool().unwrap_or(false)),
        UnOp::Neg => match v {
            Val::Int(i) => Val::Int(-i),
            Val::Double(d) => Val::Double((-d.into_inner()).into()),
            other => other,
        },
    }
}

fn eval_binary(op: BinOp, l: Val, r: Val) -> Val {
    match op {
        BinOp::Add => numeric(l, r, |a, b| a + b, |a, b| a + b),
        BinOp::Sub => numeric(l, r, |a, b| a - b, |a, b| a - b),
        BinOp::Mul => numeric(l, r, |a, b| a * b, |a, b| a * b),
        BinOp::Div => Val::Double((l.as_f64().unwrap_or(0.0) / r.as_f64().unwrap_or(1.0)).into()),
        BinOp::Eq => Val::Bool(l == r),
        BinOp::Ne => Val::Bool(l != r),
        BinOp::Lt => Val::Bool(l.partial_cmp(&r) == Some(std::cmp::Ordering::Less)),
        BinOp::Le => Val::Bool(matches!(l.partial_cmp(&r), Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal))),
        BinOp::Gt => Val::Bool(l.partial_cmp(&r) == Some(std::cmp::Ordering::Greater)),
        BinOp::Ge => Val::Bool(matches!(l.partial_cmp(&r), Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal))),
        BinOp::And => Val::Bool(l.as_bool().unwrap_or(false) && r.as_bool().unwrap_or(false)),
        BinOp::Or => Val::Bool(l.as_bool().unwrap_or(false) || r.as_bool().unwrap_or(false)),
    }
}

fn numeric(l: Val, r: Val, int_op: fn(i64, i64) -> i64, f_op: fn(f64, f64) -> f64) -> Val {
    match (&l, &r) {
        (Val::Int(a), Val::Int(b)) => Val::Int(int_op(*a, *b)),
        _ => Val::Double(f_op(l.as_f64().unwrap_or(0.0), r.as_f64().unwrap_or(0.0)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::person::intern::InternTable;
    use crate::person::record::PersonData;
    use crate::query::compiler::compile;
    use crate::schema::ColumnType;
    use serde_json::json;

    fn mount_person(schema: &mut Schema, rows: &[serde_json::Value]) -> (Grid, InternTable) {
        let mut interner = InternTable::default();
        let mut build = Grid::new();
        build.map_schema(schema, None).unwrap();
        build.external_id = 1;
        build.linear_id = 0;
        build.id = "p1".into();
        for row in rows {
            build.insert(schema, &mut interner, row, 0).unwrap();
        }
        let packed: PersonData = build.commit(schema, &mut interner).unwrap();
        let mut grid = Grid::new();
        grid.map_schema(schema, None).unwrap();
        grid.mount(&packed, schema, &interner).unwrap();
        (grid, interner)
    }

    #[test]
    fn tally_count_over_events() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let (grid, _interner) = mount_person(
            &mut schema,
            &[
                json!({"__time": 1, "__action": "view", "country": "us"}),
                json!({"__time": 2, "__action": "view", "country": "us"}),
            ],
        );
        let store = AttributeStore::new();
        let macro_ = compile(&schema, "for_events:\n    n = count(1)\n    tally(1):\n        n = count(1)\n").unwrap();
        let mut interp = Interp::new(&schema, &grid, &store, 16, 1000);
        interp.run(&macro_).unwrap();
        assert_eq!(interp.results().row_count(), 1);
    }

    #[test]
    fn log_and_emit_are_recorded() {
        let schema = Schema::default();
        let grid = Grid::new();
        let store = AttributeStore::new();
        let macro_ = compile(&schema, "log 1\nemit trigger_a\n").unwrap();
        let mut interp = Interp::new(&schema, &grid, &store, 16, 0);
        interp.run(&macro_).unwrap();
        assert_eq!(interp.log_lines(), &["1".to_string()]);
        assert_eq!(interp.emitted(), &["trigger_a".to_string()]);
    }

    #[test]
    fn return_val_halts_execution() {
        let schema = Schema::default();
        let grid = Grid::new();
        let store = AttributeStore::new();
        let macro_ = compile(&schema, "return 42\nlog 1\n").unwrap();
        let mut interp = Interp::new(&schema, &grid, &store, 16, 0);
        interp.run(&macro_).unwrap();
        assert_eq!(interp.returned(), Some(&Val::Int(42)));
        assert!(interp.log_lines().is_empty());
    }

    #[test]
    fn segment_math_program_returns_intersection_population() {
        let schema = Schema::default();
        let grid = Grid::new();
        let mut store = AttributeStore::new();
        let mut a = IndexBits::new(8);
        a.set(1);
        a.set(2);
        store.set_segment("a", a, crate::index::segment::SegmentMeta::new(0, 0, 0));
        let mut b = IndexBits::new(8);
        b.set(2);
        store.set_segment("b", b, crate::index::segment::SegmentMeta::new(0, 0, 0));
        let macro_ = compile(&schema, "population(intersection(a, b))\n").unwrap();
        assert!(macro_.is_segment_math);
        let mut interp = Interp::new(&schema, &grid, &store, 8, 0);
        interp.run(&macro_).unwrap();
        assert_eq!(interp.returned(), Some(&Val::Int(1)));
    }
}
