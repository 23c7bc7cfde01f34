/// Resource ceilings for a process. Exceeding any of them raises
/// "stack overflow".
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Maximum value-stack slots per thread.
    pub max_stack_size: usize,
    /// Maximum Lua call frames per thread.
    pub max_call_depth: usize,
    /// Maximum re-entrant host calls (pcall, metamethods, hooks).
    pub max_native_recursion: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack_size: 1_000_000,
            max_call_depth: 200,
            max_native_recursion: 200,
        }
    }
}
