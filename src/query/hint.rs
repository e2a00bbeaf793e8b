//! Folds a Macro's postfix index hint program into bitmap operations
//! against a partition's attribute store (§4.D), producing the candidate
//! set of linear-IDs a `countable` Macro can answer without mounting a
//! single person.

use crate::errors::{Error, Result};
use crate::index::{AttributeStore, IndexBits};
use crate::query::macro_::Macro;
use crate::query::opcode::HintOp;

/// `capacity` bounds the produced bitmaps; callers pass the partition's
/// current linear-ID watermark.
pub fn fold(store: &AttributeStore, macro_: &Macro, capacity: usize) -> Result<IndexBits> {
    let mut stack: Vec<IndexBits> = Vec::new();
    for op in &macro_.hint_program {
        match *op {
            HintOp::Eq(column, literal_idx) => {
                let value = macro_.literals.get(literal_idx as usize).ok_or_else(|| {
                    Error::QueryRuntime("hint program references missing literal".into())
                })?;
                let bits = store.get(column, value).unwrap_or_else(|| IndexBits::new(capacity));
                stack.push(bits);
            }
            HintOp::And(n) => apply_nary(&mut stack, n, |acc, b| acc.and(&b))?,
            HintOp::Or(n) => apply_nary(&mut stack, n, |acc, b| acc.or(&b))?,
            HintOp::Not => {
                let mut top =
                    stack.pop().ok_or_else(|| Error::QueryRuntime("hint stack underflow".into()))?;
                top.not();
                stack.push(top);
            }
        }
    }
    if stack.len() != 1 {
        return Err(Error::QueryRuntime("hint program left stack unbalanced".into()));
    }
    Ok(stack.pop().unwrap())
}

fn apply_nary(stack: &mut Vec<IndexBits>, n: u8, combine: impl Fn(&mut IndexBits, IndexBits)) -> Result<()> {
    if (stack.len() as u8) < n || n == 0 {
        return Err(Error::QueryRuntime("hint stack underflow".into()));
    }
    let mut operands = stack.split_off(stack.len() - n as usize);
    let mut acc = operands.remove(0);
    for b in operands {
        combine(&mut acc, b);
    }
    stack.push(acc);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compiler;
    use crate::schema::{ColumnType, Schema};
    use crate::value::Val;

    #[test]
    fn folds_single_equality_into_stored_bitmap() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        let id = schema.column_id("country").unwrap();

        let mut store = AttributeStore::new();
        let mut bits = IndexBits::new(8);
        bits.set(2);
        bits.set(5);
        store.swap(id, &Val::Text("us".into()), bits.clone());

        let macro_ = compiler::compile(
            &schema,
            "if country == \"us\":\n    tally(1):\n        n = count(1)\n",
        )
        .unwrap();
        assert!(macro_.countable);

        let folded = fold(&store, &macro_, 8).unwrap();
        assert_eq!(folded, bits);
        assert_eq!(folded.population(), 2);
    }

    #[test]
    fn folds_and_of_two_predicates() {
        let mut schema = Schema::default();
        schema.add_column("country", ColumnType::Text).unwrap();
        schema.add_column("plan", ColumnType::Text).unwrap();
        let country_id = schema.column_id("country").unwrap();
        let plan_id = schema.column_id("plan").unwrap();

        let mut store = AttributeStore::new();
        let mut us = IndexBits::new(8);
        us.set(1);
        us.set(2);
        us.set(3);
        store.swap(country_id, &Val::Text("us".into()), us);
        let mut pro = IndexBits::new(8);
        pro.set(2);
        pro.set(3);
        pro.set(4);
        store.swap(plan_id, &Val::Text("pro".into()), pro);

        let macro_ = compiler::compile(
            &schema,
            "if country == \"us\" and plan == \"pro\":\n    tally(1):\n        n = count(1)\n",
        )
        .unwrap();
        let folded = fold(&store, &macro_, 8).unwrap();
        assert_eq!(folded.population(), 2);
    }
}
