//! DWARF location expression evaluation.
//!
//! Register values come exclusively from the caller supplied register
//! snapshot, so an expression of a non-innermost frame is evaluated against
//! that frame's registers and never against the live thread state.

use crate::debugger::debugee::dwarf::unit::ParsedUnit;
use crate::debugger::debugee::dwarf::EndianArcSlice;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{EvalOptionRequired, EvalUnsupportedRequire};
use crate::debugger::register::DwarfRegisterMap;
use bytes::{BufMut, Bytes, BytesMut};
use gimli::{
    AttributeValue, EvaluationResult, Expression, Location, Piece, Value, ValueType,
};
use nix::unistd::Pid;
use std::cmp::min;

#[derive(Default, Clone)]
pub struct EvalOption {
    pub frame_base: Option<u64>,
    pub cfa: Option<u64>,
}

impl EvalOption {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_base(self, frame_base: u64) -> Self {
        Self {
            frame_base: Some(frame_base),
            ..self
        }
    }

    pub fn with_cfa(self, cfa: u64) -> Self {
        Self { cfa: Some(cfa), ..self }
    }
}

/// Evaluator bound to one compile unit and one frame's register file.
pub struct ExpressionEvaluator<'a> {
    dwarf: &'a gimli::Dwarf<EndianArcSlice>,
    parsed: &'a ParsedUnit,
    pid: Pid,
    registers: &'a DwarfRegisterMap,
    mapping_offset: usize,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(
        dwarf: &'a gimli::Dwarf<EndianArcSlice>,
        parsed: &'a ParsedUnit,
        pid: Pid,
        registers: &'a DwarfRegisterMap,
        mapping_offset: usize,
    ) -> Self {
        Self {
            dwarf,
            parsed,
            pid,
            registers,
            mapping_offset,
        }
    }

    pub fn evaluate(&self, expr: Expression<EndianArcSlice>) -> Result<CompletedResult, Error> {
        self.evaluate_with_opts(expr, EvalOption::default())
    }

    pub fn evaluate_with_opts(
        &self,
        expr: Expression<EndianArcSlice>,
        opts: EvalOption,
    ) -> Result<CompletedResult, Error> {
        let encoding = self.parsed.unit.encoding();
        let mut eval = expr.evaluation(encoding);

        let mut result = eval.evaluate()?;
        while result != EvaluationResult::Complete {
            match result {
                EvaluationResult::RequiresRegister { register, .. } => {
                    let value = Value::Generic(self.registers.value(register)?);
                    result = eval.resume_with_register(value)?;
                }
                EvaluationResult::RequiresFrameBase => {
                    result = eval.resume_with_frame_base(
                        opts.frame_base.ok_or(EvalOptionRequired("frame_base"))?,
                    )?;
                }
                EvaluationResult::RequiresCallFrameCfa => {
                    result =
                        eval.resume_with_call_frame_cfa(opts.cfa.ok_or(EvalOptionRequired("cfa"))?)?;
                }
                EvaluationResult::RequiresMemory { address, size, .. } => {
                    let bytes =
                        crate::debugger::read_memory_by_pid(self.pid, address as usize, size as usize)
                            .map_err(Error::Ptrace)?;
                    let mut buf = [0u8; 8];
                    let n = min(bytes.len(), 8);
                    buf[..n].copy_from_slice(&bytes[..n]);
                    result = eval.resume_with_memory(Value::Generic(u64::from_ne_bytes(buf)))?;
                }
                EvaluationResult::RequiresRelocatedAddress(addr) => {
                    result = eval.resume_with_relocated_address(addr + self.mapping_offset as u64)?;
                }
                EvaluationResult::RequiresIndexedAddress { index, relocate } => {
                    // DWARF 5 .debug_addr entry
                    let addr = self.dwarf.address(&self.parsed.unit, index)?;
                    let addr = if relocate {
                        addr + self.mapping_offset as u64
                    } else {
                        addr
                    };
                    result = eval.resume_with_indexed_address(addr)?;
                }
                EvaluationResult::RequiresBaseType(offset) => {
                    let value_type = self
                        .parsed
                        .unit
                        .entry(offset)
                        .ok()
                        .and_then(|entry| {
                            let encoding = match entry.attr_value(gimli::DW_AT_encoding).ok()?? {
                                AttributeValue::Encoding(e) => e,
                                _ => return None,
                            };
                            let byte_size = entry
                                .attr_value(gimli::DW_AT_byte_size)
                                .ok()??
                                .udata_value()?;
                            ValueType::from_encoding(encoding, byte_size)
                        })
                        .unwrap_or(ValueType::Generic);
                    result = eval.resume_with_base_type(value_type)?;
                }
                EvaluationResult::RequiresEntryValue(expr) => {
                    // best effort: evaluate the sub-expression against the
                    // same (target frame) registers
                    let sub = self.evaluate_with_opts(expr, opts.clone())?;
                    let value = sub.into_scalar::<u64>()?;
                    result = eval.resume_with_entry_value(Value::Generic(value))?;
                }
                other => {
                    return Err(EvalUnsupportedRequire(format!("{other:?}")));
                }
            };
        }

        Ok(CompletedResult {
            inner: eval.result(),
            registers: self.registers.clone(),
            pid: self.pid,
        })
    }
}

/// Result of a completed evaluation: a piece list plus the register snapshot
/// it was computed against.
pub struct CompletedResult {
    inner: Vec<Piece<EndianArcSlice>>,
    registers: DwarfRegisterMap,
    pid: Pid,
}

impl CompletedResult {
    /// The memory address the expression resolves to, when it names one.
    pub fn address(&self) -> Option<usize> {
        match self.inner.first() {
            Some(Piece {
                location: Location::Address { address },
                ..
            }) => Some(*address as usize),
            _ => None,
        }
    }

    /// The value the expression computes: an address for location
    /// expressions, the register or literal value otherwise. Used for CFA
    /// and frame-base expressions where the address itself is the result.
    pub fn into_location_value(self) -> Result<u64, Error> {
        match self.inner.first() {
            Some(Piece {
                location: Location::Address { address },
                ..
            }) => Ok(*address),
            Some(Piece {
                location: Location::Register { register },
                ..
            }) => self.registers.value(*register),
            Some(Piece {
                location: Location::Value { value },
                ..
            }) => Ok(match value {
                Value::Generic(v) | Value::U64(v) => *v,
                Value::I8(v) => *v as u64,
                Value::U8(v) => *v as u64,
                Value::I16(v) => *v as u64,
                Value::U16(v) => *v as u64,
                Value::I32(v) => *v as u64,
                Value::U32(v) => *v as u64,
                Value::I64(v) => *v as u64,
                Value::F32(v) => *v as u64,
                Value::F64(v) => *v as u64,
            }),
            _ => Err(Error::NotAddressable),
        }
    }

    pub fn into_scalar<T: Copy>(self) -> Result<T, Error> {
        let type_size = std::mem::size_of::<T>();
        let bytes = self.into_raw_buffer(type_size)?;
        Ok(scalar_from_bytes(&bytes))
    }

    pub fn into_raw_buffer(self, byte_size: usize) -> Result<Bytes, Error> {
        let mut buf = BytesMut::with_capacity(byte_size);
        let registers = self.registers;
        let pid = self.pid;

        self.inner
            .into_iter()
            .try_for_each(|piece| -> Result<(), Error> {
                let read_size = piece
                    .size_in_bits
                    .map(|bits| bits as usize / 8)
                    .unwrap_or(byte_size);
                let offset = piece.bit_offset.unwrap_or(0);

                match piece.location {
                    Location::Register { register } => {
                        let value = registers.value(register)?;
                        let bytes = (value >> offset).to_ne_bytes();
                        buf.put_slice(&bytes[..min(read_size, 8)]);
                    }
                    Location::Address { address } => {
                        let mem =
                            crate::debugger::read_memory_by_pid(pid, address as usize, read_size)
                                .map_err(Error::Ptrace)?;
                        buf.put_slice(&mem);
                    }
                    Location::Value { value } => match value {
                        Value::Generic(v) | Value::U64(v) => buf.put_u64_ne(v),
                        Value::I8(v) => buf.put_i8(v),
                        Value::U8(v) => buf.put_u8(v),
                        Value::I16(v) => buf.put_i16_ne(v),
                        Value::U16(v) => buf.put_u16_ne(v),
                        Value::I32(v) => buf.put_i32_ne(v),
                        Value::U32(v) => buf.put_u32_ne(v),
                        Value::I64(v) => buf.put_i64_ne(v),
                        Value::F32(v) => buf.put_f32_ne(v),
                        Value::F64(v) => buf.put_f64_ne(v),
                    },
                    Location::Bytes { value, .. } => {
                        buf.put_slice(value.bytes());
                    }
                    Location::ImplicitPointer { .. } => {
                        return Err(EvalUnsupportedRequire("implicit pointer".to_string()));
                    }
                    Location::Empty => {}
                };
                Ok(())
            })?;

        Ok(buf.freeze())
    }
}

fn scalar_from_bytes<T: Copy>(bytes: &Bytes) -> T {
    let mut buf = vec![0u8; std::mem::size_of::<T>().max(bytes.len())];
    buf[..bytes.len()].copy_from_slice(bytes);
    unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) }
}
