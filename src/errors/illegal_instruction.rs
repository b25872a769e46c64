/// Malformed bytecode detected while decoding or executing a function.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum IllegalInstruction {
    UnknownOpcode(u8),
    OperandOutOfRange,
    MissingConstant(u32),
    MissingPrototype(u32),
    MissingUpValue(u8),
    /// `LoadKX` and `SetList` expect an `ExtraArg` to follow
    MissingExtraArg,
    InvalidHeapKey,
}
