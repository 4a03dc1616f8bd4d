use std::io::{self, Write};

use crate::cpu::CpuState;
use crate::expr::Evaluator;

/// Capacity of the watchpoint pool.
pub const NR_WP: usize = 32;

struct Slot {
    expr: Option<String>,
    next: Option<usize>,
}

/// Fixed-capacity pool of watchpoint expressions.
///
/// A live list and a free list partition the backing array; a watchpoint's
/// id is its slot index and never changes across allocations.
pub struct WatchpointPool {
    pool: Vec<Slot>,
    head: Option<usize>,
    free: Option<usize>,
}

impl WatchpointPool {
    pub fn new() -> Self {
        let pool = (0..NR_WP)
            .map(|i| Slot {
                expr: None,
                next: if i + 1 < NR_WP { Some(i + 1) } else { None },
            })
            .collect();

        Self {
            pool,
            head: None,
            free: Some(0),
        }
    }

    /// Install a watchpoint, returning its id, or `None` when the pool is
    /// exhausted.
    pub fn add(&mut self, expr: String) -> Option<usize> {
        let id = self.free?;
        self.free = self.pool[id].next;
        self.pool[id].next = self.head;
        self.pool[id].expr = Some(expr);
        self.head = Some(id);

        Some(id)
    }

    /// Delete the watchpoint with the given id. Returns false when no live
    /// watchpoint has that id.
    pub fn remove(&mut self, id: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut cur = self.head;

        while let Some(i) = cur {
            if i == id {
                let next = self.pool[i].next;
                match prev {
                    None => self.head = next,
                    Some(p) => self.pool[p].next = next,
                }
                self.pool[i].expr = None;
                self.pool[i].next = self.free;
                self.free = Some(i);
                return true;
            }
            prev = cur;
            cur = self.pool[i].next;
        }

        false
    }

    pub fn expr(&self, id: usize) -> Option<&str> {
        self.pool.get(id).and_then(|slot| slot.expr.as_deref())
    }

    /// Re-evaluate every live watchpoint; the first whose value is `0`
    /// (the predicate holds) trips and is returned. Expressions that fail
    /// to evaluate are skipped with a warning.
    pub fn check(&self, eval: &Evaluator, cpu: &CpuState) -> Option<usize> {
        let mut cur = self.head;

        while let Some(i) = cur {
            if let Some(expr) = self.pool[i].expr.as_deref() {
                match eval.eval(expr, cpu) {
                    Ok(0) => return Some(i),
                    Ok(_) => {}
                    Err(e) => log::warn!("watchpoint {} failed to evaluate: {:#}", i, e),
                }
            }
            cur = self.pool[i].next;
        }

        None
    }

    pub fn dump_to(&self, w: &mut impl Write) -> io::Result<()> {
        if self.head.is_none() {
            writeln!(w, "No watchpoints.")?;
            return Ok(());
        }

        writeln!(w, "Num  What")?;
        let mut cur = self.head;
        while let Some(i) = cur {
            writeln!(
                w,
                "{:<3}  {}",
                i,
                self.pool[i].expr.as_deref().unwrap_or("")
            )?;
            cur = self.pool[i].next;
        }

        Ok(())
    }

    pub fn dump(&self) {
        let _ = self.dump_to(&mut io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_slot_indices() {
        let mut pool = WatchpointPool::new();

        assert_eq!(pool.add("$a0".into()), Some(0));
        assert_eq!(pool.add("$a1".into()), Some(1));
        assert_eq!(pool.add("$a2".into()), Some(2));
        assert_eq!(pool.expr(1), Some("$a1"));
    }

    #[test]
    fn test_freed_slot_is_reused_with_stable_id() {
        let mut pool = WatchpointPool::new();

        pool.add("a".into());
        pool.add("b".into());
        assert!(pool.remove(0));
        assert_eq!(pool.expr(0), None);

        // Slot 0 sits at the head of the free list again.
        assert_eq!(pool.add("c".into()), Some(0));
        assert_eq!(pool.expr(0), Some("c"));
        assert_eq!(pool.expr(1), Some("b"));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = WatchpointPool::new();

        for i in 0..NR_WP {
            assert_eq!(pool.add(format!("{}", i)), Some(i));
        }
        assert_eq!(pool.add("overflow".into()), None);

        assert!(pool.remove(17));
        assert_eq!(pool.add("refill".into()), Some(17));
        assert_eq!(pool.add("overflow".into()), None);
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut pool = WatchpointPool::new();

        assert!(!pool.remove(0));
        pool.add("a".into());
        assert!(!pool.remove(5));
        assert!(!pool.remove(NR_WP + 10));
    }

    #[test]
    fn test_check_trips_on_zero() {
        let mut pool = WatchpointPool::new();
        let eval = Evaluator::new();
        let mut cpu = CpuState::new();

        let id = pool.add("$a0 == 5".into()).unwrap();
        assert_eq!(pool.check(&eval, &cpu), None);

        cpu.gpr[10] = 5;
        assert_eq!(pool.check(&eval, &cpu), Some(id));
    }

    #[test]
    fn test_check_skips_broken_expressions() {
        let mut pool = WatchpointPool::new();
        let eval = Evaluator::new();
        let cpu = CpuState::new();

        let tripping = pool.add("0".into()).unwrap();
        pool.add("1/0".into()).unwrap();

        // The walk starts at the newest entry; the broken expression is
        // skipped, not fatal, and the healthy watchpoint still trips.
        assert_eq!(pool.check(&eval, &cpu), Some(tripping));
    }

    #[test]
    fn test_dump_lists_live_watchpoints() {
        let mut pool = WatchpointPool::new();

        let mut buf = Vec::new();
        pool.dump_to(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "No watchpoints.\n");

        pool.add("$a0 == 5".into());
        pool.add("$sp".into());

        let mut buf = Vec::new();
        pool.dump_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("0    $a0 == 5"));
        assert!(text.contains("1    $sp"));
    }
}
