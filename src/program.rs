//! Normalized program model.
//!
//! This is the shape of input the front-end hands over: functions made of
//! named basic blocks, each a list of instructions over named variables.
//! Calls are inlined by the front-end; the first block of a function is its
//! entry.

use std::fmt;

use crate::error::{HeapError, Result};
use crate::types::{Offset, Size, PTR_SIZE};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Operand {
    Var(String),
    /// `var->[offset]`, read as `width` bytes.
    Load { var: String, offset: Offset, width: u32 },
    Null,
    Int(i64),
    /// Nondeterministic value.
    Unknown,
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var(name.into())
    }

    /// Pointer-sized load.
    pub fn load(var: impl Into<String>, offset: i64) -> Self {
        Operand::Load {
            var: var.into(),
            offset: Offset::new(offset),
            width: PTR_SIZE,
        }
    }

    pub fn load_int(var: impl Into<String>, offset: i64, width: u32) -> Self {
        Operand::Load {
            var: var.into(),
            offset: Offset::new(offset),
            width,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(v) => write!(f, "{}", v),
            Operand::Load { var, offset, .. } => write!(f, "{}->[{}]", var, offset),
            Operand::Null => write!(f, "NULL"),
            Operand::Int(x) => write!(f, "{}", x),
            Operand::Unknown => write!(f, "*"),
        }
    }
}

/// Destination of an assignment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Place {
    Var(String),
    Field { var: String, offset: Offset, width: u32 },
}

impl Place {
    pub fn var(name: impl Into<String>) -> Self {
        Place::Var(name.into())
    }

    /// Pointer-sized field of the object `var` points to.
    pub fn field(var: impl Into<String>, offset: i64) -> Self {
        Place::Field {
            var: var.into(),
            offset: Offset::new(offset),
            width: PTR_SIZE,
        }
    }

    pub fn int_field(var: impl Into<String>, offset: i64, width: u32) -> Self {
        Place::Field {
            var: var.into(),
            offset: Offset::new(offset),
            width,
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Var(v) => write!(f, "{}", v),
            Place::Field { var, offset, .. } => write!(f, "{}->[{}]", var, offset),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
}

impl fmt::Display for Cmp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cmp::Eq => "==",
            Cmp::Ne => "!=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Insn {
    /// `dst = malloc(size)`
    Alloc { dst: Place, size: Size },
    /// `free(ptr)`
    Free { ptr: Operand },
    Assign { dst: Place, src: Operand },
    Cond {
        lhs: Operand,
        cmp: Cmp,
        rhs: Operand,
        then: String,
        else_: String,
    },
    Jump(String),
    Ret,
    /// `abort()`: the path ends without any checks.
    Abort,
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Alloc { dst, size } => write!(f, "{} = malloc({})", dst, size),
            Insn::Free { ptr } => write!(f, "free({})", ptr),
            Insn::Assign { dst, src } => write!(f, "{} = {}", dst, src),
            Insn::Cond {
                lhs,
                cmp,
                rhs,
                then,
                else_,
            } => write!(f, "if ({} {} {}) goto {} else goto {}", lhs, cmp, rhs, then, else_),
            Insn::Jump(target) => write!(f, "goto {}", target),
            Insn::Ret => write!(f, "return"),
            Insn::Abort => write!(f, "abort()"),
        }
    }
}

impl Insn {
    pub fn mutates_heap(&self) -> bool {
        matches!(self, Insn::Alloc { .. } | Insn::Free { .. } | Insn::Assign { .. })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Block {
    pub name: String,
    pub insns: Vec<Insn>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insns: Vec::new(),
        }
    }

    pub fn push(mut self, insn: Insn) -> Self {
        self.insns.push(insn);
        self
    }

    pub fn alloc(self, dst: Place, size: u32) -> Self {
        self.push(Insn::Alloc {
            dst,
            size: Size::new(size),
        })
    }

    pub fn free(self, ptr: Operand) -> Self {
        self.push(Insn::Free { ptr })
    }

    pub fn assign(self, dst: Place, src: Operand) -> Self {
        self.push(Insn::Assign { dst, src })
    }

    pub fn cond(self, lhs: Operand, cmp: Cmp, rhs: Operand, then: &str, else_: &str) -> Self {
        self.push(Insn::Cond {
            lhs,
            cmp,
            rhs,
            then: then.to_string(),
            else_: else_.to_string(),
        })
    }

    pub fn jump(self, target: &str) -> Self {
        self.push(Insn::Jump(target.to_string()))
    }

    pub fn ret(self) -> Self {
        self.push(Insn::Ret)
    }

    pub fn abort(self) -> Self {
        self.push(Insn::Abort)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Function {
    pub name: String,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
        }
    }

    pub fn block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn entry(&self) -> Result<&Block> {
        self.blocks
            .first()
            .ok_or_else(|| HeapError::UnknownBlock(format!("{}:<entry>", self.name)))
    }

    pub fn find_block(&self, name: &str) -> Result<&Block> {
        self.blocks
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| HeapError::UnknownBlock(name.to_string()))
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Program {
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, function: Function) -> Self {
        self.functions.push(function);
        self
    }

    pub fn find_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// The function exploration starts from.
    pub fn main(&self) -> Result<&Function> {
        self.find_function("main").ok_or(HeapError::NoEntryFunction)
    }
}

/// Program location of an instruction.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Loc {
    pub function: String,
    pub block: String,
    pub index: usize,
}

impl Loc {
    pub fn new(function: &str, block: &str, index: usize) -> Self {
        Self {
            function: function.to_string(),
            block: block.to_string(),
            index,
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.function, self.block, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_lookup() {
        let program = Program::new().function(Function::new("helper"));
        assert_eq!(program.main(), Err(HeapError::NoEntryFunction));

        let program = program.function(Function::new("main").block(Block::new("entry").ret()));
        let main = program.main().unwrap();
        assert_eq!(main.entry().unwrap().name, "entry");
        assert!(main.find_block("entry").is_ok());
        assert_eq!(
            main.find_block("nowhere"),
            Err(HeapError::UnknownBlock("nowhere".to_string()))
        );
    }

    #[test]
    fn test_display() {
        let insn = Insn::Assign {
            dst: Place::field("p", 8),
            src: Operand::load("q", 0),
        };
        assert_eq!(insn.to_string(), "p->[+8] = q->[+0]");
        let block = Block::new("b").alloc(Place::var("p"), 16).free(Operand::var("p"));
        assert_eq!(block.insns[0].to_string(), "p = malloc(16B)");
        assert_eq!(block.insns[1].to_string(), "free(p)");
        assert_eq!(Loc::new("main", "b", 1).to_string(), "main:b:1");
    }
}
