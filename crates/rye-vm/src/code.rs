use std::rc::Rc;

/// Argument slot sentinel: the argument was syntactically missing.
pub const MISSING_ARG_IDX: u32 = u32::MAX;
/// Argument slot sentinel: `...`, expanded at the call site.
pub const DOTS_ARG_IDX: u32 = u32::MAX - 1;

/// A compiled code body. Immutable after `CodeStream::finalize`.
#[derive(Debug)]
pub struct CodeObject {
    /// Encoded instruction stream, byte-addressable.
    pub ops: Vec<u8>,
    /// Sparse instruction-start-pc → source-pool key mapping, sorted by pc.
    /// Instructions without an entry fall back to `src`.
    pub srcs: Vec<(u32, u32)>,
    /// Source-pool key of the whole expression this body was compiled from.
    pub src: u32,
    /// Conservative upper bound on value-stack growth during execution.
    pub stack_depth: u32,
}

impl CodeObject {
    /// Source key for the instruction starting at `pc`, falling back to the
    /// body's own source.
    pub fn src_at(&self, pc: u32) -> u32 {
        match self.srcs.binary_search_by_key(&pc, |&(p, _)| p) {
            Ok(i) => self.srcs[i].1,
            Err(_) => self.src,
        }
    }

    /// Source key for the instruction at `pc`, or None when the instruction
    /// has no source of its own.
    pub fn src_at_exact(&self, pc: u32) -> Option<u32> {
        self.srcs
            .binary_search_by_key(&pc, |&(p, _)| p)
            .ok()
            .map(|i| self.srcs[i].1)
    }
}

/// An ordered collection of code bodies realizing one compiled closure body:
/// the entry at index 0, promise bodies after it.
#[derive(Debug)]
pub struct FunctionObject {
    pub codes: Vec<Rc<CodeObject>>,
}

impl FunctionObject {
    pub fn entry(&self) -> &Rc<CodeObject> {
        &self.codes[0]
    }

    pub fn code_at(&self, idx: u32) -> Option<&Rc<CodeObject>> {
        self.codes.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// The compiled form of a closure body, stored behind the closure's opaque
/// `compiled` slot. `formal_codes` holds the promise-body index of each
/// formal's default expression (`MISSING_ARG_IDX` when there is none), in
/// formal order.
#[derive(Debug)]
pub struct CompiledBody {
    pub fun: Rc<FunctionObject>,
    pub formal_codes: Vec<u32>,
}

/// Back-reference stored inside promises: the owning function object plus
/// the promise body's index. Keeps the function alive for as long as any of
/// its promises are.
#[derive(Debug)]
pub struct PromiseCode {
    pub fun: Rc<FunctionObject>,
    pub idx: u32,
}
