//! Variable lookup and typed value reading.
//!
//! Identifiers resolve by scanning the target frame's parameters, then its
//! locals (narrowed by lexical scope), then unit level globals. All reads go
//! through the target frame's register snapshot.

use crate::debugger::address::GlobalAddress;
use crate::debugger::debugee::dwarf::eval::{EvalOption, ExpressionEvaluator};
use crate::debugger::debugee::dwarf::r#type::{self, TypeKind, TypeView};
use crate::debugger::debugee::dwarf::unit::{FunctionDie, VariableDie};
use crate::debugger::debugee::dwarf::unwind::FrameSpan;
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use bytes::Bytes;
use gimli::{AttributeValue, UnitOffset};

/// Everything needed to evaluate variables inside one stack frame.
pub struct FrameContext<'a> {
    pub debugee: &'a Debugee,
    pub pid: nix::unistd::Pid,
    pub frame: &'a FrameSpan,
    pub global_pc: GlobalAddress,
    pub unit_idx: usize,
    pub func: Option<&'a FunctionDie>,
    pub frame_base: Option<u64>,
}

/// A fully materialized variable value.
#[derive(Debug, Clone)]
pub struct VariableView {
    pub name: String,
    pub type_name: String,
    pub value: String,
    pub address: Option<usize>,
    pub unit_idx: usize,
    pub type_ref: Option<UnitOffset>,
    pub byte_size: usize,
    pub raw: Option<Bytes>,
}

impl VariableView {
    /// Count of child values a client may expand.
    pub fn children_count(&self, debugee: &Debugee) -> usize {
        let Some(view) = self.type_view(debugee) else {
            return 0;
        };
        match view.kind {
            TypeKind::Struct { members } => members.len(),
            TypeKind::Array { count, .. } => count.unwrap_or(0) as usize,
            TypeKind::Pointer { pointee: Some(_) } => 1,
            _ => 0,
        }
    }

    pub fn type_view(&self, debugee: &Debugee) -> Option<TypeView> {
        let type_ref = self.type_ref?;
        let unit = debugee.debug_info().unit(self.unit_idx);
        r#type::type_view(debugee.debug_info().dwarf(), unit, type_ref).ok()
    }
}

/// Resolve a variable DIE by name in the context of a frame.
pub fn find_variable_die<'a>(
    ctx: &'a FrameContext<'a>,
    name: &str,
) -> Result<(usize, &'a VariableDie), Error> {
    if let Some(func) = ctx.func {
        if let Some(die) = func
            .parameters
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
        {
            return Ok((ctx.unit_idx, die));
        }
        if let Some(die) = func.variables.iter().find(|v| {
            v.name.as_deref() == Some(name)
                && v.lexical_scope
                    .as_ref()
                    .map(|ranges| ctx.global_pc.in_ranges(ranges))
                    .unwrap_or(true)
        }) {
            return Ok((ctx.unit_idx, die));
        }
    }

    ctx.debugee
        .debug_info()
        .find_global_variables(name)
        .into_iter()
        .next()
        .ok_or_else(|| Error::UnboundIdentifier(name.to_string()))
}

/// Read the value of a named variable in the target frame.
pub fn read_variable(ctx: &FrameContext, name: &str) -> Result<VariableView, Error> {
    let (unit_idx, die) = find_variable_die(ctx, name)?;
    read_variable_die(ctx, unit_idx, die)
}

/// Read the value of a located variable DIE.
pub fn read_variable_die(
    ctx: &FrameContext,
    unit_idx: usize,
    die: &VariableDie,
) -> Result<VariableView, Error> {
    let debug_info = ctx.debugee.debug_info();
    let parsed = debug_info.unit(unit_idx);
    let name = die.name.clone().unwrap_or_else(|| "<unnamed>".to_string());

    let expression = match &die.location {
        Some(AttributeValue::Exprloc(expr)) => expr.clone(),
        Some(AttributeValue::LocationListsRef(offset)) => {
            let mut iter = debug_info.dwarf().locations(&parsed.unit, *offset)?;
            let mut found = None;
            while let Some(entry) = iter.next()? {
                let pc = u64::from(ctx.global_pc);
                if entry.range.begin <= pc && pc < entry.range.end {
                    found = Some(entry.data);
                    break;
                }
            }
            found.ok_or(Error::NotAddressable)?
        }
        _ => return Err(Error::NotAddressable),
    };

    let evaluator = ExpressionEvaluator::new(
        debug_info.dwarf(),
        parsed,
        ctx.pid,
        &ctx.frame.registers,
        ctx.debugee.mapping_offset(),
    );
    let mut opts = EvalOption::new().with_cfa(ctx.frame.cfa.as_u64());
    if let Some(frame_base) = ctx.frame_base {
        opts = opts.with_frame_base(frame_base);
    }
    let result = evaluator.evaluate_with_opts(expression, opts)?;

    let type_view = die
        .type_ref
        .map(|offset| r#type::type_view(debug_info.dwarf(), parsed, offset))
        .transpose()?
        .unwrap_or_else(TypeView::unknown);
    let byte_size = type_view.byte_size.unwrap_or(8) as usize;

    materialize(ctx, result, name, unit_idx, die.type_ref, &type_view, byte_size)
}

fn materialize(
    ctx: &FrameContext,
    result: crate::debugger::debugee::dwarf::eval::CompletedResult,
    name: String,
    unit_idx: usize,
    type_ref: Option<UnitOffset>,
    type_view: &TypeView,
    byte_size: usize,
) -> Result<VariableView, Error> {
    let (address, raw) = match result.address() {
        Some(addr) => {
            let bytes = crate::debugger::read_memory_by_pid(ctx.pid, addr, byte_size)
                .map_err(|_| Error::MemoryAccess(addr))?;
            (Some(addr), Bytes::from(bytes))
        }
        // register pieces and implicit values have no address; assemble the
        // raw bytes from the evaluation result instead
        None => (None, result.into_raw_buffer(byte_size).unwrap_or_default()),
    };

    let value = if raw.is_empty() {
        "<optimized out>".to_string()
    } else {
        r#type::render_scalar(type_view, &raw)
    };

    Ok(VariableView {
        name,
        type_name: type_view.name.clone(),
        value,
        address,
        unit_idx,
        type_ref,
        byte_size,
        raw: (!raw.is_empty()).then_some(raw),
    })
}

/// Read a value at a known address with a known type (children expansion,
/// dereference, array elements).
pub fn read_at_address(
    debugee: &Debugee,
    pid: nix::unistd::Pid,
    name: String,
    unit_idx: usize,
    type_ref: Option<UnitOffset>,
    address: usize,
) -> Result<VariableView, Error> {
    let debug_info = debugee.debug_info();
    let parsed = debug_info.unit(unit_idx);
    let type_view = type_ref
        .map(|offset| r#type::type_view(debug_info.dwarf(), parsed, offset))
        .transpose()?
        .unwrap_or_else(TypeView::unknown);
    let byte_size = type_view.byte_size.unwrap_or(8) as usize;

    let bytes = crate::debugger::read_memory_by_pid(pid, address, byte_size)
        .map_err(|_| Error::MemoryAccess(address))?;
    let raw = Bytes::from(bytes);

    Ok(VariableView {
        name,
        type_name: type_view.name.clone(),
        value: r#type::render_scalar(&type_view, &raw),
        address: Some(address),
        unit_idx,
        type_ref,
        byte_size,
        raw: Some(raw),
    })
}

/// Expand a composite value into child views.
pub fn children(
    debugee: &Debugee,
    pid: nix::unistd::Pid,
    parent: &VariableView,
) -> Result<Vec<VariableView>, Error> {
    const MAX_ARRAY_CHILDREN: u64 = 128;

    let Some(view) = parent.type_view(debugee) else {
        return Ok(vec![]);
    };
    let Some(parent_addr) = parent.address else {
        return Ok(vec![]);
    };
    let debug_info = debugee.debug_info();
    let parsed = debug_info.unit(parent.unit_idx);

    match view.kind {
        TypeKind::Struct { members } => members
            .iter()
            .map(|member| {
                read_at_address(
                    debugee,
                    pid,
                    member.name.clone().unwrap_or_else(|| "<anon>".to_string()),
                    parent.unit_idx,
                    member.type_ref,
                    parent_addr + member.offset as usize,
                )
            })
            .collect(),
        TypeKind::Array { element, count } => {
            let elem_size = element
                .map(|e| r#type::type_view(debug_info.dwarf(), parsed, e))
                .transpose()?
                .and_then(|v| v.byte_size)
                .unwrap_or(8) as usize;
            let n = count.unwrap_or(0).min(MAX_ARRAY_CHILDREN);
            (0..n)
                .map(|i| {
                    read_at_address(
                        debugee,
                        pid,
                        format!("[{i}]"),
                        parent.unit_idx,
                        element,
                        parent_addr + i as usize * elem_size,
                    )
                })
                .collect()
        }
        TypeKind::Pointer { pointee: Some(pointee) } => {
            let raw = parent
                .raw
                .as_ref()
                .ok_or(Error::NotAddressable)?;
            let mut buf = [0u8; 8];
            let n = raw.len().min(8);
            buf[..n].copy_from_slice(&raw[..n]);
            let target = u64::from_ne_bytes(buf) as usize;
            if target == 0 {
                return Ok(vec![]);
            }
            Ok(vec![read_at_address(
                debugee,
                pid,
                format!("*{}", parent.name),
                parent.unit_idx,
                Some(pointee),
                target,
            )?])
        }
        _ => Ok(vec![]),
    }
}

/// Overwrite a scalar variable in debuggee memory with a parsed value.
pub fn write_value(
    debugee: &Debugee,
    pid: nix::unistd::Pid,
    target: &VariableView,
    value: &str,
) -> Result<(), Error> {
    let address = target.address.ok_or(Error::NotAddressable)?;
    let view = target
        .type_view(debugee)
        .unwrap_or_else(TypeView::unknown);

    let bytes: Vec<u8> = match &view.kind {
        TypeKind::Scalar(encoding) => match *encoding {
            gimli::DW_ATE_float => {
                let v: f64 = value
                    .parse()
                    .map_err(|_| Error::TypeMismatch("expected a float literal"))?;
                match target.byte_size {
                    4 => (v as f32).to_ne_bytes().to_vec(),
                    _ => v.to_ne_bytes().to_vec(),
                }
            }
            gimli::DW_ATE_boolean => {
                let v: bool = value
                    .parse()
                    .map_err(|_| Error::TypeMismatch("expected true or false"))?;
                vec![v as u8]
            }
            _ => {
                let v: i64 = parse_int(value)?;
                v.to_ne_bytes()[..target.byte_size.min(8)].to_vec()
            }
        },
        TypeKind::Pointer { .. } | TypeKind::Enum { .. } | TypeKind::Unknown => {
            let v: i64 = parse_int(value)?;
            v.to_ne_bytes()[..target.byte_size.min(8)].to_vec()
        }
        _ => return Err(Error::TypeMismatch("only scalar values can be assigned")),
    };

    crate::debugger::write_memory_by_pid(pid, address, &bytes).map_err(Error::Ptrace)
}

fn parse_int(value: &str) -> Result<i64, Error> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16)
            .map_err(|_| Error::TypeMismatch("expected an integer literal"));
    }
    value
        .parse()
        .map_err(|_| Error::TypeMismatch("expected an integer literal"))
}
