use crate::errors::IllegalInstruction;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub type Register = u8;

const SIZE_OP: u32 = 7;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 8;
const SIZE_C: u32 = 8;
const SIZE_BX: u32 = SIZE_C + SIZE_B + 1;
const SIZE_AX: u32 = SIZE_BX + SIZE_A;

const POS_A: u32 = SIZE_OP;
const POS_K: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_K + 1;
const POS_C: u32 = POS_B + SIZE_B;
const POS_BX: u32 = POS_K;
const POS_AX: u32 = POS_A;

pub const MAX_A: u32 = (1 << SIZE_A) - 1;
pub const MAX_B: u32 = (1 << SIZE_B) - 1;
pub const MAX_C: u32 = (1 << SIZE_C) - 1;
pub const MAX_BX: u32 = (1 << SIZE_BX) - 1;
pub const MAX_AX: u32 = (1 << SIZE_AX) - 1;

/// Excess used by `sBx`
pub const OFFSET_SBX: i32 = (MAX_BX >> 1) as i32;
/// Excess used by `sJ`
pub const OFFSET_SJ: i32 = (MAX_AX >> 1) as i32;
/// Excess used by signed 8 bit operands
pub const OFFSET_SC: i32 = (MAX_C >> 1) as i32;

/// Values written by a single `SetList` before the next flush
pub const FIELDS_PER_FLUSH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
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
}

impl ArithOp {
    const ALL: [ArithOp; 12] = [
        ArithOp::Add,
        ArithOp::Sub,
        ArithOp::Mul,
        ArithOp::Mod,
        ArithOp::Pow,
        ArithOp::Div,
        ArithOp::IDiv,
        ArithOp::BAnd,
        ArithOp::BOr,
        ArithOp::BXor,
        ArithOp::Shl,
        ArithOp::Shr,
    ];

    #[inline]
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// Operand layouts are listed as `(A, B, C)`, `(A, Bx)`, `(Ax)`, or `(sJ)`.
///
/// `R[x]` is a register, `K[x]` a constant, `RK(x)` is `K[x]` when `k` is set and `R[x]` otherwise,
/// `U[x]` an up value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// R[A] = R[B]
    Move,
    /// R[A] = sBx
    LoadI,
    /// R[A] = sBx as a float
    LoadF,
    /// R[A] = K[Bx]
    LoadK,
    /// R[A] = K[extra arg]
    LoadKX,
    /// R[A] = B != 0, skips the next instruction when C != 0
    LoadBool,
    /// R[A..=A+B] = nil
    LoadNil,
    /// R[A] = U[B]
    GetUpVal,
    /// U[B] = R[A]
    SetUpVal,
    /// R[A] = U[B][K[C]]
    GetTabUp,
    /// R[A] = R[B][R[C]]
    GetTable,
    /// R[A] = R[B][C]
    GetI,
    /// R[A] = R[B][K[C]]
    GetField,
    /// U[A][K[B]] = RK(C)
    SetTabUp,
    /// R[A][R[B]] = RK(C)
    SetTable,
    /// R[A][B] = RK(C)
    SetI,
    /// R[A][K[B]] = RK(C)
    SetField,
    /// R[A] = {}, B and C are floating byte size hints for the hash and array parts
    NewTable,
    /// R[A+1] = R[B]; R[A] = R[B][RK(C)]
    SelfField,
    /// R[A] = R[B] + sC
    AddI,
    AddK,
    SubK,
    MulK,
    ModK,
    PowK,
    DivK,
    IDivK,
    BAndK,
    BOrK,
    BXorK,
    ShlK,
    ShrK,
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
    /// R[A] = -R[B]
    Unm,
    /// R[A] = ~R[B]
    BNot,
    /// R[A] = not R[B]
    Not,
    /// R[A] = #R[B]
    Len,
    /// R[A] = R[A] .. ... .. R[A+B-1]
    Concat,
    /// Closes up values at or above R[A]
    Close,
    /// pc += sJ
    Jmp,
    /// if (R[A] == R[B]) != k then pc++
    Eq,
    /// if (R[A] < R[B]) != k then pc++
    Lt,
    /// if (R[A] <= R[B]) != k then pc++
    Le,
    /// if (R[A] == K[B]) != k then pc++
    EqK,
    /// if (R[A] == sB) != k then pc++
    EqI,
    LtI,
    LeI,
    GtI,
    GeI,
    /// if truthy(R[A]) != k then pc++
    Test,
    /// if truthy(R[B]) != k then pc++ else R[A] = R[B]
    TestSet,
    /// R[A], ..., R[A+C-2] = R[A](R[A+1], ..., R[A+B-1])
    ///
    /// B = 0 passes everything up to the top, C = 0 keeps every result
    Call,
    /// return R[A](R[A+1], ..., R[A+B-1])
    TailCall,
    /// return R[A], ..., R[A+B-2], B = 0 returns everything up to the top
    Return,
    Return0,
    Return1,
    /// Numeric loop step, jumps back Bx when the loop continues
    ForLoop,
    /// Numeric loop setup, skips the loop by jumping Bx + 1 when it runs zero times
    ForPrep,
    /// Generic loop setup, pc += Bx
    TForPrep,
    /// R[A+4], ..., R[A+3+C] = R[A](R[A+1], R[A+2])
    TForCall,
    /// if R[A+4] != nil then { R[A+2] = R[A+4]; pc -= Bx }
    TForLoop,
    /// R[A][C+i] = R[A+i], 1 <= i <= B
    SetList,
    /// R[A] = closure(protos[Bx])
    Closure,
    /// R[A], ..., R[A+C-2] = varargs
    VarArg,
    /// Parameters are adjusted by the call manager, kept for compatibility with compilers that emit it
    VarArgPrep,
    ExtraArg,
}

impl OpCode {
    pub const COUNT: usize = OpCode::ExtraArg as usize + 1;

    /// The operation of `AddK..=ShrK` and `Add..=Shr`
    #[inline]
    pub fn arith_op(self) -> Option<ArithOp> {
        let index = self as u8;

        if (OpCode::AddK as u8..=OpCode::ShrK as u8).contains(&index) {
            Some(ArithOp::ALL[(index - OpCode::AddK as u8) as usize])
        } else if (OpCode::Add as u8..=OpCode::Shr as u8).contains(&index) {
            Some(ArithOp::ALL[(index - OpCode::Add as u8) as usize])
        } else {
            None
        }
    }

    pub fn arith_k(op: ArithOp) -> Self {
        Self::from_index(OpCode::AddK as u8 + op as u8)
    }

    pub fn arith(op: ArithOp) -> Self {
        Self::from_index(OpCode::Add as u8 + op as u8)
    }

    fn from_index(index: u8) -> Self {
        // callers only pass indices derived from valid opcodes
        Self::try_from(index).unwrap_or(OpCode::ExtraArg)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = IllegalInstruction;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use OpCode::*;

        const TABLE: [OpCode; OpCode::COUNT] = [
            Move, LoadI, LoadF, LoadK, LoadKX, LoadBool, LoadNil, GetUpVal, SetUpVal, GetTabUp,
            GetTable, GetI, GetField, SetTabUp, SetTable, SetI, SetField, NewTable, SelfField,
            AddI, AddK, SubK, MulK, ModK, PowK, DivK, IDivK, BAndK, BOrK, BXorK, ShlK, ShrK, Add,
            Sub, Mul, Mod, Pow, Div, IDiv, BAnd, BOr, BXor, Shl, Shr, Unm, BNot, Not, Len, Concat,
            Close, Jmp, Eq, Lt, Le, EqK, EqI, LtI, LeI, GtI, GeI, Test, TestSet, Call, TailCall,
            Return, Return0, Return1, ForLoop, ForPrep, TForPrep, TForCall, TForLoop, SetList,
            Closure, VarArg, VarArgPrep, ExtraArg,
        ];

        TABLE
            .get(value as usize)
            .copied()
            .ok_or(IllegalInstruction::UnknownOpcode(value))
    }
}

/// A 32 bit instruction word: `op:7 | A:8 | k:1 | B:8 | C:8`
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Instruction(pub u32);

impl Instruction {
    #[inline]
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8, k: bool) -> Self {
        Self(
            op as u32
                | (a as u32) << POS_A
                | (k as u32) << POS_K
                | (b as u32) << POS_B
                | (c as u32) << POS_C,
        )
    }

    #[inline]
    pub fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        debug_assert!(bx <= MAX_BX);
        Self(op as u32 | (a as u32) << POS_A | (bx & MAX_BX) << POS_BX)
    }

    #[inline]
    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        Self::abx(op, a, (sbx + OFFSET_SBX) as u32)
    }

    #[inline]
    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX);
        Self(op as u32 | (ax & MAX_AX) << POS_AX)
    }

    #[inline]
    pub fn sj(op: OpCode, sj: i32) -> Self {
        Self::ax(op, (sj + OFFSET_SJ) as u32)
    }

    /// Encodes a signed operand for `sB`/`sC` positions
    #[inline]
    pub fn signed_arg(value: i32) -> u8 {
        (value + OFFSET_SC) as u8
    }

    #[inline]
    pub fn raw_op(self) -> u8 {
        (self.0 & ((1 << SIZE_OP) - 1)) as u8
    }

    #[inline]
    pub fn op(self) -> Result<OpCode, IllegalInstruction> {
        OpCode::try_from(self.raw_op())
    }

    #[inline]
    pub fn a(self) -> u8 {
        (self.0 >> POS_A) as u8
    }

    #[inline]
    pub fn b(self) -> u8 {
        (self.0 >> POS_B) as u8
    }

    #[inline]
    pub fn c(self) -> u8 {
        (self.0 >> POS_C) as u8
    }

    #[inline]
    pub fn k(self) -> bool {
        (self.0 >> POS_K) & 1 != 0
    }

    #[inline]
    pub fn sb(self) -> i32 {
        self.b() as i32 - OFFSET_SC
    }

    #[inline]
    pub fn sc(self) -> i32 {
        self.c() as i32 - OFFSET_SC
    }

    #[inline]
    pub fn bx(self) -> u32 {
        self.0 >> POS_BX
    }

    #[inline]
    pub fn sbx(self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    #[inline]
    pub fn ax_arg(self) -> u32 {
        self.0 >> POS_AX
    }

    #[inline]
    pub fn sj_arg(self) -> i32 {
        self.ax_arg() as i32 - OFFSET_SJ
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op() {
            Ok(op) => write!(
                f,
                "{op:?} a={} b={} c={} k={} bx={}",
                self.a(),
                self.b(),
                self.c(),
                self.k() as u8,
                self.bx()
            ),
            Err(_) => write!(f, "Illegal({:#010x})", self.0),
        }
    }
}

/// Decodes the `eeeeexxx` floating byte used for table size hints
pub fn decode_floating_byte(byte: u8) -> usize {
    let exponent = (byte >> 3) as u32;
    let mantissa = (byte & 7) as usize;

    if exponent == 0 {
        mantissa
    } else {
        (mantissa + 8) << (exponent - 1)
    }
}

/// The smallest floating byte that decodes to at least `value`
pub fn encode_floating_byte(mut value: usize) -> u8 {
    if value < 8 {
        return value as u8;
    }

    let mut exponent = 0;

    while value >= (8 << 4) {
        value = (value + 0xf) >> 4;
        exponent += 4;
    }

    while value >= (8 << 1) {
        value = (value + 1) >> 1;
        exponent += 1;
    }

    (((exponent + 1) << 3) | (value - 8)) as u8
}
