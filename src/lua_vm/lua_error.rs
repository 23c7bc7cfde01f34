// Error values and control signals.
//
// A raised error carries an arbitrary Lua value plus a level and the
// traceback captured at the raise site. The second signal, Yield, is not an
// error at all: it unwinds the host-side dispatch back to the matching
// resume while the coroutine's own frames stay intact.

use crate::lua_value::LuaValue;

/// One traceback entry: `@short-source:line`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub source: String,
    pub line: i32,
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line >= 0 {
            write!(f, "{}:{}", self.source, self.line)
        } else {
            write!(f, "{}", self.source)
        }
    }
}

/// Structured runtime error: the raised value, the annotation level it was
/// raised with, and the stack positions captured when it was raised.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub value: LuaValue,
    /// Display form of `value`, rendered at raise time (the value itself is
    /// an id into the owning process's pool).
    pub message: String,
    pub level: u32,
    pub traceback: Vec<Position>,
}

impl RuntimeError {
    pub fn new(value: LuaValue, message: String, level: u32) -> Self {
        Self {
            value,
            message,
            level,
            traceback: Vec::new(),
        }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.traceback.is_empty() {
            write!(f, "\nstack traceback:")?;
            for pos in &self.traceback {
                write!(f, "\n\t{}", pos)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Result payload of every fallible VM operation.
#[derive(Debug, Clone)]
pub enum LuaError {
    Runtime(RuntimeError),
    /// Control signal: the current coroutine yielded. Values travel through
    /// the thread's transfer buffer, not through this variant.
    Yield,
}

impl LuaError {
    /// The runtime error inside, if this is one.
    pub fn runtime(self) -> Option<RuntimeError> {
        match self {
            LuaError::Runtime(e) => Some(e),
            LuaError::Yield => None,
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Runtime(e) => write!(f, "{}", e),
            LuaError::Yield => write!(f, "coroutine yield"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;
