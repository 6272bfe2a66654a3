//! # Exploration driver
//!
//! A worklist symbolic executor over the [program model][crate::program].
//! Every pending state owns its heap; a branch clones it. Exploration is
//! depth-first and starts at the entry block of `main`.
//!
//! At every block entry a state is normalized: unreachable objects are
//! dropped (and reported as leaks), shapes are folded, and the heap is
//! canonicalized. It is then compared with the states seen at that block
//! before. A state covered by one of them is dropped. A state that differs
//! from earlier ones in segment lengths only is joined with them, so loops
//! that grow or shrink a list reach a fixpoint.
//!
//! Errors are handled by class: a program error is recorded with its location
//! and ends the branch, a resource error abandons the branch, and an integrity
//! error aborts the whole run.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use log::{debug, info, warn};

use crate::error::{ErrorClass, HeapError, Result};
use crate::heap::{SymHeap, DEFAULT_MAX_OBJECTS};
use crate::program::{Cmp, Insn, Loc, Operand, Place, Program};
use crate::reference::ObjId;
use crate::types::Offset;
use crate::value::Value;

/// When shapes are folded.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum AbstractionPolicy {
    /// After every instruction that changes the heap.
    Eager,
    /// Only when a state enters a block.
    #[default]
    Lazy,
}

/// Number of states with the same skeleton kept apart at a block before they
/// are joined.
const WIDENING_DELAY: usize = 2;

#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Ceiling on the objects of one heap.
    pub max_objects: usize,
    /// Ceiling on the number of executed steps.
    pub max_states: usize,
    pub abstraction: AbstractionPolicy,
    /// Join states on their first revisit of a block instead of keeping exact
    /// states around for a while.
    pub fast_mode: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_objects: DEFAULT_MAX_OBJECTS,
            max_states: 100_000,
            abstraction: AbstractionPolicy::default(),
            fast_mode: false,
        }
    }
}

impl FromStr for ExecConfig {
    type Err = HeapError;

    /// Parse a config string: empty for the defaults, or `fast`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" => Ok(ExecConfig::default()),
            "fast" => Ok(ExecConfig {
                fast_mode: true,
                ..ExecConfig::default()
            }),
            other => Err(HeapError::InvalidConfig(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DiagnosticKind {
    Error(HeapError),
    MemoryLeak,
}

/// Something wrong with the analyzed program, found at `loc`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Diagnostic {
    pub loc: Loc,
    pub kind: DiagnosticKind,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiagnosticKind::Error(e) => write!(f, "{}: error: {}", self.loc, e),
            DiagnosticKind::MemoryLeak => write!(f, "{}: error: memory leak detected", self.loc),
        }
    }
}

/// Outcome of one exploration.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Distinct diagnostics, in the order they were found.
    pub diagnostics: Vec<Diagnostic>,
    /// Executed steps.
    pub states: usize,
    /// Paths that reached `return` or `abort()`.
    pub paths_completed: usize,
    /// Branches dropped on a resource ceiling.
    pub abandoned: usize,
    /// Whether exploration stopped at the step ceiling.
    pub limit_reached: bool,
}

impl Report {
    fn push(&mut self, diagnostic: Diagnostic) {
        if !self.diagnostics.contains(&diagnostic) {
            info!("{}", diagnostic);
            self.diagnostics.push(diagnostic);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&Loc, &HeapError)> {
        self.diagnostics.iter().filter_map(|d| match &d.kind {
            DiagnosticKind::Error(e) => Some((&d.loc, e)),
            DiagnosticKind::MemoryLeak => None,
        })
    }

    pub fn leaks(&self) -> impl Iterator<Item = &Loc> {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::MemoryLeak)
            .map(|d| &d.loc)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.diagnostics {
            writeln!(f, "{}", d)?;
        }
        write!(
            f,
            "{} states, {} paths completed, {} abandoned",
            self.states, self.paths_completed, self.abandoned
        )?;
        if self.limit_reached {
            write!(f, " (step limit reached)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct State {
    heap: SymHeap,
    block: String,
    index: usize,
    /// Split off while executing an instruction; not checked at block entry again.
    entered: bool,
}

/// What to do after an instruction.
enum Flow {
    Next,
    Goto(Vec<String>),
    Exit,
}

pub struct Executor<'a> {
    program: &'a Program,
    config: ExecConfig,
}

impl<'a> Executor<'a> {
    pub fn new(program: &'a Program, config: ExecConfig) -> Self {
        Self { program, config }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Explore every path of `main`.
    ///
    /// Returns an error only when the run has to be aborted: no `main`, a
    /// malformed program, or a broken engine invariant.
    pub fn run(&self) -> Result<Report> {
        let main = self.program.main()?;
        info!("exec: entering {}()", main.name);

        let mut report = Report::default();
        let mut visited: HashMap<String, Vec<SymHeap>> = HashMap::new();
        let mut worklist = VecDeque::new();
        worklist.push_back(State {
            heap: SymHeap::new(self.config.max_objects),
            block: main.entry()?.name.clone(),
            index: 0,
            entered: false,
        });

        while let Some(mut state) = worklist.pop_back() {
            if report.states >= self.config.max_states {
                warn!(
                    "exec: step limit of {} reached, {} states left unexplored",
                    self.config.max_states,
                    worklist.len() + 1
                );
                report.limit_reached = true;
                break;
            }
            report.states += 1;
            let loc = Loc::new(&main.name, &state.block, state.index);

            if state.index == 0 && !state.entered {
                match self.enter_block(state, &loc, &mut visited, &mut report) {
                    Ok(Some(s)) => state = s,
                    Ok(None) => continue,
                    Err(e) => {
                        self.fail(e, &loc, &mut report)?;
                        continue;
                    }
                }
            }

            let block = main.find_block(&state.block)?;
            let Some(insn) = block.insns.get(state.index) else {
                return Err(HeapError::integrity(format!(
                    "block {} ends without a terminator",
                    block.name
                )));
            };
            debug!("{}: {}", loc, insn);

            let mut forks = Vec::new();
            let flow = self.step(&mut state.heap, insn, &mut forks);
            for heap in forks {
                debug!("{}: exploring split-off state", loc);
                worklist.push_back(State {
                    heap,
                    block: state.block.clone(),
                    index: state.index,
                    entered: true,
                });
            }
            match flow {
                Ok(Flow::Next) => {
                    if self.config.abstraction == AbstractionPolicy::Eager && insn.mutates_heap() {
                        if let Err(e) = state.heap.fold_shapes() {
                            self.fail(e, &loc, &mut report)?;
                            continue;
                        }
                    }
                    state.index += 1;
                    worklist.push_back(state);
                }
                Ok(Flow::Goto(targets)) => {
                    let last = targets.len().saturating_sub(1);
                    for (i, target) in targets.into_iter().enumerate() {
                        main.find_block(&target)?;
                        let heap = if i == last {
                            std::mem::take(&mut state.heap)
                        } else {
                            state.heap.clone()
                        };
                        worklist.push_back(State {
                            heap,
                            block: target,
                            index: 0,
                            entered: false,
                        });
                    }
                }
                Ok(Flow::Exit) => {
                    report.paths_completed += 1;
                    if let Insn::Ret = insn {
                        self.check_exit(state.heap, &loc, &mut report);
                    }
                }
                Err(e) => self.fail(e, &loc, &mut report)?,
            }
        }

        info!("exec: {}() finished: {}", main.name, report);
        Ok(report)
    }

    /// Route an error by class: record it, drop the branch, or abort the run.
    fn fail(&self, e: HeapError, loc: &Loc, report: &mut Report) -> Result<()> {
        match e.class() {
            ErrorClass::Program => {
                report.push(Diagnostic {
                    loc: loc.clone(),
                    kind: DiagnosticKind::Error(e),
                });
                Ok(())
            }
            ErrorClass::Resource => {
                warn!("{}: branch abandoned: {}", loc, e);
                report.abandoned += 1;
                Ok(())
            }
            ErrorClass::Integrity => Err(e),
        }
    }

    /// Normalize a state entering a block and check it against the states
    /// seen there. Returns the state to continue with, if any.
    fn enter_block(
        &self,
        state: State,
        loc: &Loc,
        visited: &mut HashMap<String, Vec<SymHeap>>,
        report: &mut Report,
    ) -> Result<Option<State>> {
        let canon = state.heap.canonicalize();
        if !canon.leaked.is_empty() {
            report.push(Diagnostic {
                loc: loc.clone(),
                kind: DiagnosticKind::MemoryLeak,
            });
        }
        let mut heap = canon.heap;
        if self.config.abstraction == AbstractionPolicy::Lazy && heap.fold_shapes()? > 0 {
            let folded = heap.canonicalize();
            if !folded.leaked.is_empty() {
                return Err(HeapError::integrity(format!(
                    "folding left {:?} unreachable",
                    folded.leaked
                )));
            }
            heap = folded.heap;
        }

        let seen = visited.entry(state.block.clone()).or_default();
        if seen.iter().any(|v| v.same_state(&heap) || v.covers(&heap)) {
            debug!("{}: state already covered", loc);
            return Ok(None);
        }

        let similar: Vec<usize> = (0..seen.len()).filter(|&i| seen[i].same_skeleton(&heap)).collect();
        let delay = if self.config.fast_mode { 1 } else { WIDENING_DELAY };
        if similar.len() >= delay {
            for &i in similar.iter().rev() {
                let old = seen.swap_remove(i);
                heap = old.join(&heap).unwrap_or(heap);
            }
            debug!("{}: widened over {} states", loc, similar.len());
        }
        seen.push(heap.clone());

        Ok(Some(State {
            heap,
            block: state.block,
            index: 0,
            entered: true,
        }))
    }

    /// Report what is still allocated when `main` returns.
    fn check_exit(&self, mut heap: SymHeap, loc: &Loc, report: &mut Report) {
        debug!("{}: heap at exit\n{}", loc, heap.debug_string());
        let names: Vec<String> = heap.vars().map(|(name, _)| name.to_string()).collect();
        for name in names {
            heap.remove_var(&name);
        }
        let leaked = heap.collect_garbage();
        if !leaked.is_empty() {
            debug!("{}: {} objects still allocated", loc, leaked.len());
            report.push(Diagnostic {
                loc: loc.clone(),
                kind: DiagnosticKind::MemoryLeak,
            });
        }
    }

    fn step(&self, heap: &mut SymHeap, insn: &Insn, forks: &mut Vec<SymHeap>) -> Result<Flow> {
        match insn {
            Insn::Alloc { dst, size } => {
                self.prepare(heap, dst, forks)?;
                let obj = heap.alloc(*size)?;
                self.store(heap, dst, Value::ptr(obj), forks)?;
                Ok(Flow::Next)
            }
            Insn::Free { ptr } => {
                let value = self.eval(heap, ptr, forks)?;
                if value == Value::Null {
                    return Ok(Flow::Next);
                }
                let value = resolve(heap, value, forks)?;
                let obj = heap.deref(value)?;
                let offset = value.as_ptr().map_or(Offset::ZERO, |p| p.offset);
                if offset != Offset::ZERO {
                    return Err(HeapError::FreeOffset { obj, offset });
                }
                heap.free(obj)?;
                Ok(Flow::Next)
            }
            Insn::Assign { dst, src } => {
                self.prepare(heap, dst, forks)?;
                let value = self.eval(heap, src, forks)?;
                self.store(heap, dst, value, forks)?;
                Ok(Flow::Next)
            }
            Insn::Cond {
                lhs,
                cmp,
                rhs,
                then,
                else_,
            } => {
                let targets = match self.decide(heap, lhs, *cmp, rhs, forks)? {
                    Some(true) => vec![then.clone()],
                    Some(false) => vec![else_.clone()],
                    None => vec![else_.clone(), then.clone()],
                };
                Ok(Flow::Goto(targets))
            }
            Insn::Jump(target) => Ok(Flow::Goto(vec![target.clone()])),
            Insn::Ret | Insn::Abort => Ok(Flow::Exit),
        }
    }

    fn eval(&self, heap: &mut SymHeap, op: &Operand, forks: &mut Vec<SymHeap>) -> Result<Value> {
        match op {
            Operand::Var(name) => Ok(var_value(heap, name)),
            Operand::Load { var, offset, width } => {
                let base = var_value(heap, var);
                let base = resolve(heap, base, forks)?;
                let obj = heap.deref(base)?;
                let at = base.as_ptr().map_or(Offset::ZERO, |p| p.offset) + *offset;
                heap.read(obj, at, *width)
            }
            Operand::Null => Ok(Value::Null),
            Operand::Int(x) => Ok(Value::Int(*x)),
            Operand::Unknown => Ok(Value::Unknown),
        }
    }

    /// Concretize the object a field destination lives in.
    fn prepare(&self, heap: &mut SymHeap, dst: &Place, forks: &mut Vec<SymHeap>) -> Result<()> {
        if let Place::Field { var, .. } = dst {
            let base = var_value(heap, var);
            resolve(heap, base, forks)?;
        }
        Ok(())
    }

    fn store(&self, heap: &mut SymHeap, dst: &Place, value: Value, forks: &mut Vec<SymHeap>) -> Result<()> {
        match dst {
            Place::Var(name) => {
                heap.set_var(name.clone(), value);
                Ok(())
            }
            Place::Field { var, offset, width } => {
                let base = var_value(heap, var);
                let base = resolve(heap, base, forks)?;
                let obj = heap.deref(base)?;
                let at = base.as_ptr().map_or(Offset::ZERO, |p| p.offset) + *offset;
                heap.write(obj, at, *width, value)
            }
        }
    }

    /// Outcome of a comparison, `None` when both outcomes are possible.
    fn decide(
        &self,
        heap: &mut SymHeap,
        lhs: &Operand,
        cmp: Cmp,
        rhs: &Operand,
        forks: &mut Vec<SymHeap>,
    ) -> Result<Option<bool>> {
        let mut l = self.eval(heap, lhs, forks)?;
        let mut r = self.eval(heap, rhs, forks)?;

        // Two pointers into the same segment may or may not alias: concretize
        // one of them and look again.
        if let (Value::Ptr(p), Value::Ptr(q)) = (l, r) {
            let ambiguous = p.target == q.target
                && p.hop != q.hop
                && heap.object(p.target).map_or(false, |o| o.is_abstract());
            if ambiguous {
                l = resolve(heap, l, forks)?;
                r = self.eval(heap, rhs, forks)?;
            }
        }

        let eq = match (l, r) {
            (Value::Undef, _) | (_, Value::Undef) => {
                return Err(HeapError::UninitializedRead {
                    obj: ObjId::INVALID,
                    offset: Offset::ZERO,
                })
            }
            (Value::Unknown, _) | (_, Value::Unknown) => return Ok(None),
            (Value::Int(a), Value::Int(b)) => return Ok(Some(holds(cmp, a.cmp(&b)))),
            (Value::Int(a), Value::Null) => return Ok(Some(holds(cmp, a.cmp(&0)))),
            (Value::Null, Value::Int(b)) => return Ok(Some(holds(cmp, 0.cmp(&b)))),
            (Value::Int(_), Value::Ptr(_)) | (Value::Ptr(_), Value::Int(_)) => return Ok(None),
            (Value::Null, Value::Null) => true,
            (Value::Null, Value::Ptr(_)) | (Value::Ptr(_), Value::Null) => false,
            (Value::Ptr(p), Value::Ptr(q)) => p == q,
        };
        Ok(match cmp {
            Cmp::Eq => Some(eq),
            Cmp::Ne => Some(!eq),
            Cmp::Lt | Cmp::Le => None,
        })
    }
}

fn holds(cmp: Cmp, ord: std::cmp::Ordering) -> bool {
    match cmp {
        Cmp::Eq => ord.is_eq(),
        Cmp::Ne => ord.is_ne(),
        Cmp::Lt => ord.is_lt(),
        Cmp::Le => ord.is_le(),
    }
}

/// Value of a program variable; one not assigned on this path is uninitialized.
fn var_value(heap: &SymHeap, name: &str) -> Value {
    heap.var(name).unwrap_or(Value::Undef)
}

/// Concretize the target of a pointer value if it is abstract.
fn resolve(heap: &mut SymHeap, value: Value, forks: &mut Vec<SymHeap>) -> Result<Value> {
    match value {
        Value::Ptr(p) => {
            let (q, alternatives) = heap.materialize(p)?;
            forks.extend(alternatives);
            Ok(Value::Ptr(q))
        }
        other => Ok(other),
    }
}

/// Explore `program` with the default configuration.
pub fn explore(program: &Program) -> Result<Report> {
    Executor::new(program, ExecConfig::default()).run()
}
