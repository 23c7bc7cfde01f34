// Test support: a small assembler for Lua 5.3 prototypes.
//
// The VM consumes prototypes as immutable input, so tests build them by hand
// the way the compiler collaborator would emit them.

pub mod test_errors;
pub mod test_gc;
pub mod test_operators;
pub mod test_upvalues;

use std::rc::Rc;

use crate::lua_value::{LocVar, LuaValue, Prototype, UpvalDesc, UpvalKind};
use crate::lua_vm::{Instruction, LuaVM, OpCode};

pub struct ProtoBuilder {
    source: String,
    line_defined: u32,
    num_params: u8,
    is_vararg: bool,
    max_stack_size: u8,
    constants: Vec<LuaValue>,
    upvalues: Vec<UpvalDesc>,
    protos: Vec<Rc<Prototype>>,
    code: Vec<u32>,
    line_info: Vec<u32>,
    loc_vars: Vec<LocVar>,
}

impl ProtoBuilder {
    pub fn new(source: &str) -> Self {
        Self {
            source: format!("@{}", source),
            line_defined: 0,
            num_params: 0,
            is_vararg: false,
            max_stack_size: 8,
            constants: Vec::new(),
            upvalues: Vec::new(),
            protos: Vec::new(),
            code: Vec::new(),
            line_info: Vec::new(),
            loc_vars: Vec::new(),
        }
    }

    pub fn params(mut self, n: u8) -> Self {
        self.num_params = n;
        self
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn max_stack(mut self, n: u8) -> Self {
        self.max_stack_size = n;
        self
    }

    pub fn line_defined(mut self, line: u32) -> Self {
        self.line_defined = line;
        self
    }

    /// Declare an upvalue captured from an enclosing local register.
    pub fn upval_local(mut self, name: &str, index: u32) -> Self {
        self.upvalues.push(UpvalDesc {
            name: name.to_string(),
            kind: UpvalKind::Local,
            index,
        });
        self
    }

    /// Declare an upvalue shared from the enclosing function's upvalues.
    pub fn upval_parent(mut self, name: &str, index: u32) -> Self {
        self.upvalues.push(UpvalDesc {
            name: name.to_string(),
            kind: UpvalKind::Upvalue,
            index,
        });
        self
    }

    pub fn local_var(mut self, name: &str, start_pc: u32, end_pc: u32) -> Self {
        self.loc_vars.push(LocVar {
            name: name.to_string(),
            start_pc,
            end_pc,
        });
        self
    }

    pub fn proto(mut self, p: Rc<Prototype>) -> Self {
        self.protos.push(p);
        self
    }

    // Constants return their index for use in RK operands.

    pub fn kv(&mut self, v: LuaValue) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn ki(&mut self, i: i64) -> u32 {
        self.constants.push(LuaValue::integer(i));
        (self.constants.len() - 1) as u32
    }

    pub fn kf(&mut self, f: f64) -> u32 {
        self.constants.push(LuaValue::float(f));
        (self.constants.len() - 1) as u32
    }

    pub fn ks(&mut self, vm: &mut LuaVM, s: &str) -> u32 {
        self.constants.push(vm.new_string(s));
        (self.constants.len() - 1) as u32
    }

    // Instruction emitters; each returns the pc of the emitted instruction.

    pub fn abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.code.push(Instruction::create_abc(op, a, b, c));
        self.line_info.push(self.code.len() as u32);
        self.code.len() - 1
    }

    pub fn abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.code.push(Instruction::create_abx(op, a, bx));
        self.line_info.push(self.code.len() as u32);
        self.code.len() - 1
    }

    pub fn asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.code.push(Instruction::create_asbx(op, a, sbx));
        self.line_info.push(self.code.len() as u32);
        self.code.len() - 1
    }

    pub fn ax(&mut self, op: OpCode, ax: u32) -> usize {
        self.code.push(Instruction::create_ax(op, ax));
        self.line_info.push(self.code.len() as u32);
        self.code.len() - 1
    }

    /// Override the default one-line-per-instruction line map.
    pub fn lines(mut self, lines: &[u32]) -> Self {
        self.line_info = lines.to_vec();
        self
    }

    pub fn build(self) -> Rc<Prototype> {
        let mut line_info = self.line_info;
        line_info.resize(self.code.len(), 0);
        Rc::new(Prototype {
            source: self.source,
            line_defined: self.line_defined,
            last_line_defined: self.line_defined,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            max_stack_size: self.max_stack_size,
            constants: self.constants,
            upvalues: self.upvalues,
            protos: self.protos,
            code: self.code,
            line_info,
            loc_vars: self.loc_vars,
        })
    }
}

/// RK operand addressing constant `index`.
pub fn rk(index: u32) -> u32 {
    Instruction::rk_constant(index)
}

/// Run a top-level prototype on a fresh frame of the root thread.
pub fn run(vm: &mut LuaVM, proto: Rc<Prototype>) -> Vec<LuaValue> {
    match crate::execute(vm, proto) {
        Ok(values) => values,
        Err(e) => panic!("execution failed: {}", e),
    }
}

pub fn int(v: &LuaValue) -> i64 {
    v.as_integer_strict().expect("expected an integer")
}
