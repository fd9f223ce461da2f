//! DWARF reader: lazy per-unit parsing of the debug sections of the target
//! binary, plus the indexes used by the rest of the native engine.

pub mod eval;
pub mod r#type;
pub mod unit;
pub mod unwind;

use crate::debugger::address::GlobalAddress;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{FunctionNotFound, NoFunctionAtAddress};
use gimli::{DebugFrame, EhFrame, RunTimeEndian, Section};
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol};
use rayon::prelude::*;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use unit::{FunctionDie, ParsedUnit, Place, VariableDie};

pub type EndianArcSlice = gimli::EndianArcSlice<RunTimeEndian>;

/// Symbol from the object symbol table (functions and objects).
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub addr: u64,
    pub size: u64,
}

/// Parsed debug information of a single object file.
pub struct DebugInformation {
    file: PathBuf,
    dwarf: gimli::Dwarf<EndianArcSlice>,
    pub eh_frame: EhFrame<EndianArcSlice>,
    pub debug_frame: Option<DebugFrame<EndianArcSlice>>,
    pub bases: gimli::BaseAddresses,
    units: Vec<ParsedUnit>,
    symbols: Vec<Symbol>,
    entry_point: Option<GlobalAddress>,
    /// (range begin, range end, unit idx, function idx), sorted by begin.
    fn_ranges: Vec<(u64, u64, usize, usize)>,
}

impl DebugInformation {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)?;

        let endian = if object.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<EndianArcSlice, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or_default();
            Ok(EndianArcSlice::new(Arc::from(data.as_ref()), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let eh_frame_data = load_section(gimli::SectionId::EhFrame)?;
        let eh_frame = EhFrame::from(eh_frame_data);
        let debug_frame = object
            .section_by_name(gimli::SectionId::DebugFrame.name())
            .and_then(|s| s.uncompressed_data().ok())
            .map(|data| DebugFrame::from(EndianArcSlice::new(Arc::from(data.as_ref()), endian)));

        let mut bases = gimli::BaseAddresses::default();
        if let Some(section) = object.section_by_name(".text") {
            bases = bases.set_text(section.address());
        }
        if let Some(section) = object.section_by_name(".eh_frame") {
            bases = bases.set_eh_frame(section.address());
        }
        if let Some(section) = object.section_by_name(".eh_frame_hdr") {
            bases = bases.set_eh_frame_hdr(section.address());
        }
        if let Some(section) = object.section_by_name(".got") {
            bases = bases.set_got(section.address());
        }

        let symbols = object
            .symbols()
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Symbol {
                    name: rustc_demangle::demangle(name).to_string(),
                    addr: sym.address(),
                    size: sym.size(),
                })
            })
            .collect();

        let mut headers = vec![];
        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            headers.push(header);
        }
        let units = headers
            .into_par_iter()
            .map(|header| ParsedUnit::parse(&dwarf, header))
            .collect::<Result<Vec<_>, _>>()?;

        let mut fn_ranges: Vec<(u64, u64, usize, usize)> = units
            .iter()
            .enumerate()
            .flat_map(|(unit_idx, unit)| {
                unit.functions.iter().enumerate().flat_map(move |(fn_idx, f)| {
                    f.ranges
                        .iter()
                        .map(move |r| (r.begin, r.end, unit_idx, fn_idx))
                })
            })
            .collect();
        fn_ranges.sort_unstable_by_key(|(begin, _, _, _)| *begin);

        Ok(Self {
            file: path.to_path_buf(),
            dwarf,
            eh_frame,
            debug_frame,
            bases,
            units,
            symbols,
            entry_point: Some(GlobalAddress::from(object.entry())),
            fn_ranges,
        })
    }

    pub fn pathname(&self) -> &Path {
        &self.file
    }

    pub fn entry_point(&self) -> Option<GlobalAddress> {
        self.entry_point
    }

    pub fn dwarf(&self) -> &gimli::Dwarf<EndianArcSlice> {
        &self.dwarf
    }

    pub fn unit(&self, idx: usize) -> &ParsedUnit {
        &self.units[idx]
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn find_unit_by_pc(&self, pc: GlobalAddress) -> Option<(usize, &ParsedUnit)> {
        self.units
            .iter()
            .enumerate()
            .find(|(_, unit)| unit.covers(pc))
    }

    /// PC to source position, with nearest-line fallback.
    pub fn find_place_from_pc(&self, pc: GlobalAddress) -> Result<Option<Place>, Error> {
        let Some((_, unit)) = self.find_unit_by_pc(pc) else {
            return Ok(None);
        };
        Ok(unit
            .find_row_by_pc(pc)
            .and_then(|row| unit.place_from_row(row)))
    }

    /// PC to source position, exact address match only.
    pub fn find_exact_place_from_pc(&self, pc: GlobalAddress) -> Result<Option<Place>, Error> {
        let Some((_, unit)) = self.find_unit_by_pc(pc) else {
            return Ok(None);
        };
        Ok(unit
            .find_exact_row(pc)
            .and_then(|row| unit.place_from_row(row)))
    }

    /// Source position to code addresses ("snap to next valid statement"
    /// applied when the requested line holds no statement).
    pub fn find_places_for_line(&self, file: &Path, line: u64) -> Vec<Place> {
        let mut places: Vec<Place> = self
            .units
            .iter()
            .flat_map(|unit| {
                unit.find_rows_for_line(file, line)
                    .into_iter()
                    .filter_map(|row| unit.place_from_row(row))
                    .collect::<Vec<_>>()
            })
            .collect();
        places.sort_by_key(|place| place.address);
        places.dedup_by_key(|place| place.address);
        places
    }

    /// Valid breakpoint positions inside a line range of a file.
    pub fn breakpoint_locations(&self, file: &Path, line: u64, end_line: u64) -> Vec<Place> {
        let mut places: Vec<Place> = self
            .units
            .iter()
            .flat_map(|unit| {
                unit.rows
                    .iter()
                    .filter(|row| {
                        !row.end_sequence
                            && row.is_stmt
                            && row.line >= line
                            && row.line <= end_line
                            && unit
                                .files
                                .get(row.file_idx as usize)
                                .map(|f| f.ends_with(file))
                                .unwrap_or(false)
                    })
                    .filter_map(|row| unit.place_from_row(row))
                    .collect::<Vec<_>>()
            })
            .collect();
        places.sort_by_key(|place| (place.line_number, place.column_number));
        places.dedup_by_key(|place| place.line_number);
        places
    }

    /// Find functions by name: exact match first, then with qualifying
    /// prefixes stripped.
    pub fn find_functions_by_name(&self, template: &str) -> Vec<(usize, &FunctionDie)> {
        let exact: Vec<(usize, &FunctionDie)> = self
            .units
            .iter()
            .enumerate()
            .flat_map(|(unit_idx, unit)| {
                unit.functions
                    .iter()
                    .filter(|f| f.full_name.as_deref() == Some(template))
                    .map(move |f| (unit_idx, f))
            })
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        self.units
            .iter()
            .enumerate()
            .flat_map(|(unit_idx, unit)| {
                unit.functions
                    .iter()
                    .filter(|f| f.match_name(template))
                    .map(move |f| (unit_idx, f))
            })
            .collect()
    }

    pub fn find_function_by_name(&self, template: &str) -> Result<(usize, &FunctionDie), Error> {
        self.find_functions_by_name(template)
            .into_iter()
            .next()
            .ok_or_else(|| FunctionNotFound(template.to_string()))
    }

    pub fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<(usize, &FunctionDie)> {
        let pc_u64 = u64::from(pc);
        let idx = self
            .fn_ranges
            .partition_point(|(begin, _, _, _)| *begin <= pc_u64);
        // ranges may nest (inlined instances share space), scan back to the
        // first candidate that truly covers pc
        self.fn_ranges[..idx]
            .iter()
            .rev()
            .take(32)
            .find(|(_, end, _, _)| pc_u64 < *end)
            .map(|(_, _, unit_idx, fn_idx)| (*unit_idx, &self.units[*unit_idx].functions[*fn_idx]))
    }

    pub fn function_by_pc_ensure(&self, pc: GlobalAddress) -> Result<(usize, &FunctionDie), Error> {
        self.find_function_by_pc(pc).ok_or(NoFunctionAtAddress(pc))
    }

    /// Address of the first statement after the function prologue.
    pub fn prolog_end(&self, unit_idx: usize, func: &FunctionDie) -> Option<GlobalAddress> {
        let unit = &self.units[unit_idx];
        let start = func.start_pc()?;

        let in_fn_rows = unit
            .rows
            .iter()
            .filter(|row| !row.end_sequence && func.contains(row.address));
        if let Some(row) = in_fn_rows.clone().find(|row| row.prolog_end) {
            return Some(row.address);
        }
        // no DW_LS prologue_end marker: take the second distinct address
        in_fn_rows
            .map(|row| row.address)
            .filter(|addr| *addr > start)
            .min()
            .or(Some(start))
    }

    /// Statement places of a function body, prologue excluded.
    pub fn function_statement_places(&self, unit_idx: usize, func: &FunctionDie) -> Vec<Place> {
        let unit = &self.units[unit_idx];
        let prolog_end = self.prolog_end(unit_idx, func);
        unit.rows
            .iter()
            .filter(|row| {
                !row.end_sequence
                    && row.is_stmt
                    && func.contains(row.address)
                    && prolog_end.map(|pe| row.address >= pe).unwrap_or(true)
                    && !row.address.in_ranges(&func.inline_ranges)
            })
            .filter_map(|row| unit.place_from_row(row))
            .collect()
    }

    /// Global variables with a matching name, across all units.
    pub fn find_global_variables(&self, name: &str) -> Vec<(usize, &VariableDie)> {
        self.units
            .iter()
            .enumerate()
            .flat_map(|(unit_idx, unit)| {
                unit.globals
                    .iter()
                    .filter(|var| var.name.as_deref() == Some(name))
                    .map(move |var| (unit_idx, var))
            })
            .collect()
    }

    /// Symbol table lookup by regular expression.
    pub fn find_symbols(&self, pattern: &str) -> Result<Vec<&Symbol>, Error> {
        let re = regex::Regex::new(pattern)?;
        Ok(self
            .symbols
            .iter()
            .filter(|sym| re.is_match(&sym.name))
            .collect())
    }
}
