// Lua 5.3 opcode set.

mod instruction;

pub use instruction::Instruction;

/// The 47 opcodes of the Lua 5.3 instruction set, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadK,
    LoadKx,
    LoadBool,
    LoadNil,
    GetUpval,
    GetTabUp,
    GetTable,
    SetTabUp,
    SetUpval,
    SetTable,
    NewTable,
    SelfOp,
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Jmp,
    Eq,
    Lt,
    Le,
    Test,
    TestSet,
    Call,
    TailCall,
    Return,
    ForLoop,
    ForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    Vararg,
    ExtraArg,
}

pub const NUM_OPCODES: u8 = 47;

const OPCODE_TABLE: [OpCode; NUM_OPCODES as usize] = [
    OpCode::Move,
    OpCode::LoadK,
    OpCode::LoadKx,
    OpCode::LoadBool,
    OpCode::LoadNil,
    OpCode::GetUpval,
    OpCode::GetTabUp,
    OpCode::GetTable,
    OpCode::SetTabUp,
    OpCode::SetUpval,
    OpCode::SetTable,
    OpCode::NewTable,
    OpCode::SelfOp,
    OpCode::Add,
    OpCode::Sub,
    OpCode::Mul,
    OpCode::Mod,
    OpCode::Pow,
    OpCode::Div,
    OpCode::IDiv,
    OpCode::BAnd,
    OpCode::BOr,
    OpCode::BXor,
    OpCode::Shl,
    OpCode::Shr,
    OpCode::Unm,
    OpCode::BNot,
    OpCode::Not,
    OpCode::Len,
    OpCode::Concat,
    OpCode::Jmp,
    OpCode::Eq,
    OpCode::Lt,
    OpCode::Le,
    OpCode::Test,
    OpCode::TestSet,
    OpCode::Call,
    OpCode::TailCall,
    OpCode::Return,
    OpCode::ForLoop,
    OpCode::ForPrep,
    OpCode::TForCall,
    OpCode::TForLoop,
    OpCode::SetList,
    OpCode::Closure,
    OpCode::Vararg,
    OpCode::ExtraArg,
];

/// Instruction layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    IABC,
    IABx,
    IAsBx,
    IAx,
}

impl OpCode {
    /// Decode from the low 6 bits of an instruction; None for an invalid
    /// opcode (a bytecode error, not a panic).
    pub fn from_u6(op: u8) -> Option<OpCode> {
        OPCODE_TABLE.get(op as usize).copied()
    }

    pub fn mode(self) -> OpMode {
        match self {
            OpCode::LoadK | OpCode::LoadKx | OpCode::Closure => OpMode::IABx,
            OpCode::Jmp | OpCode::ForLoop | OpCode::ForPrep | OpCode::TForLoop => OpMode::IAsBx,
            OpCode::ExtraArg => OpMode::IAx,
            _ => OpMode::IABC,
        }
    }

    /// Whether the instruction writes register A (used by the debug name
    /// derivation walk).
    pub fn sets_register_a(self) -> bool {
        !matches!(
            self,
            OpCode::SetTabUp
                | OpCode::SetUpval
                | OpCode::SetTable
                | OpCode::Jmp
                | OpCode::Eq
                | OpCode::Lt
                | OpCode::Le
                | OpCode::Test
                | OpCode::Return
                | OpCode::SetList
                | OpCode::ExtraArg
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Move => "MOVE",
            OpCode::LoadK => "LOADK",
            OpCode::LoadKx => "LOADKX",
            OpCode::LoadBool => "LOADBOOL",
            OpCode::LoadNil => "LOADNIL",
            OpCode::GetUpval => "GETUPVAL",
            OpCode::GetTabUp => "GETTABUP",
            OpCode::GetTable => "GETTABLE",
            OpCode::SetTabUp => "SETTABUP",
            OpCode::SetUpval => "SETUPVAL",
            OpCode::SetTable => "SETTABLE",
            OpCode::NewTable => "NEWTABLE",
            OpCode::SelfOp => "SELF",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Mod => "MOD",
            OpCode::Pow => "POW",
            OpCode::Div => "DIV",
            OpCode::IDiv => "IDIV",
            OpCode::BAnd => "BAND",
            OpCode::BOr => "BOR",
            OpCode::BXor => "BXOR",
            OpCode::Shl => "SHL",
            OpCode::Shr => "SHR",
            OpCode::Unm => "UNM",
            OpCode::BNot => "BNOT",
            OpCode::Not => "NOT",
            OpCode::Len => "LEN",
            OpCode::Concat => "CONCAT",
            OpCode::Jmp => "JMP",
            OpCode::Eq => "EQ",
            OpCode::Lt => "LT",
            OpCode::Le => "LE",
            OpCode::Test => "TEST",
            OpCode::TestSet => "TESTSET",
            OpCode::Call => "CALL",
            OpCode::TailCall => "TAILCALL",
            OpCode::Return => "RETURN",
            OpCode::ForLoop => "FORLOOP",
            OpCode::ForPrep => "FORPREP",
            OpCode::TForCall => "TFORCALL",
            OpCode::TForLoop => "TFORLOOP",
            OpCode::SetList => "SETLIST",
            OpCode::Closure => "CLOSURE",
            OpCode::Vararg => "VARARG",
            OpCode::ExtraArg => "EXTRAARG",
        }
    }
}
