use crate::debugger::address::GlobalAddress;
use crate::debugger::debugee::dwarf::EndianArcSlice;
use crate::debugger::error::Error;
use fallible_iterator::FallibleIterator;
use gimli::{
    AttributeValue, DW_AT_frame_base, DW_AT_linkage_name, DW_AT_location, DW_AT_name, DW_AT_type,
    DW_TAG_formal_parameter, DW_TAG_inlined_subroutine, DW_TAG_lexical_block, DW_TAG_namespace,
    DW_TAG_subprogram, DW_TAG_variable, Range, Reader, Unit, UnitOffset,
};
use std::path::{Path, PathBuf};

/// One row of the decoded line program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineRow {
    pub address: GlobalAddress,
    pub file_idx: u64,
    pub line: u64,
    pub column: u64,
    pub is_stmt: bool,
    pub prolog_end: bool,
    pub epilog_begin: bool,
    pub end_sequence: bool,
}

/// Owned description of a single source position.
#[derive(Debug, Clone, PartialEq)]
pub struct Place {
    pub file: PathBuf,
    pub line_number: u64,
    pub column_number: u64,
    pub address: GlobalAddress,
    pub is_stmt: bool,
    pub prolog_end: bool,
}

/// Variable or formal parameter DIE, indexed at parse time.
#[derive(Debug, Clone)]
pub struct VariableDie {
    pub name: Option<String>,
    pub die_offset: UnitOffset,
    pub type_ref: Option<UnitOffset>,
    pub location: Option<AttributeValue<EndianArcSlice>>,
    /// Ranges of the narrowest enclosing lexical block, `None` for
    /// function-wide visibility.
    pub lexical_scope: Option<Vec<Range>>,
}

/// Function DIE with everything the engine needs pre-extracted.
#[derive(Debug, Clone)]
pub struct FunctionDie {
    pub name: Option<String>,
    pub full_name: Option<String>,
    pub die_offset: UnitOffset,
    pub ranges: Vec<Range>,
    pub frame_base: Option<AttributeValue<EndianArcSlice>>,
    pub parameters: Vec<VariableDie>,
    pub variables: Vec<VariableDie>,
    /// Ranges of inlined subroutine bodies inside this function.
    pub inline_ranges: Vec<Range>,
}

impl FunctionDie {
    /// Match against a user supplied name: exact full name first, then a
    /// form with qualifying prefixes stripped.
    pub fn match_name(&self, template: &str) -> bool {
        if self.full_name.as_deref() == Some(template) || self.name.as_deref() == Some(template) {
            return true;
        }
        self.full_name
            .as_deref()
            .map(|fname| fname.ends_with(&format!("::{template}")))
            .unwrap_or(false)
    }

    pub fn start_pc(&self) -> Option<GlobalAddress> {
        self.ranges
            .iter()
            .map(|r| r.begin)
            .min()
            .map(GlobalAddress::from)
    }

    pub fn end_pc(&self) -> Option<GlobalAddress> {
        self.ranges
            .iter()
            .map(|r| r.end)
            .max()
            .map(GlobalAddress::from)
    }

    pub fn contains(&self, pc: GlobalAddress) -> bool {
        pc.in_ranges(&self.ranges)
    }
}

/// Fully parsed compile unit: gimli unit plus the indexes built over it.
pub struct ParsedUnit {
    pub unit: Unit<EndianArcSlice>,
    pub name: Option<String>,
    pub comp_dir: Option<PathBuf>,
    pub files: Vec<PathBuf>,
    pub rows: Vec<LineRow>,
    pub functions: Vec<FunctionDie>,
    pub globals: Vec<VariableDie>,
}

impl ParsedUnit {
    pub fn parse(
        dwarf: &gimli::Dwarf<EndianArcSlice>,
        header: gimli::UnitHeader<EndianArcSlice>,
    ) -> Result<ParsedUnit, Error> {
        let unit = dwarf.unit(header)?;

        let name = unit
            .name
            .clone()
            .and_then(|r| r.to_string_lossy().ok().map(|s| s.to_string()));
        let comp_dir = unit
            .comp_dir
            .clone()
            .and_then(|r| r.to_string_lossy().ok().map(|s| PathBuf::from(s.as_ref())));

        let (files, rows) = parse_lines(dwarf, &unit, comp_dir.as_deref())?;
        let (functions, globals) = parse_dies(dwarf, &unit)?;

        Ok(ParsedUnit {
            unit,
            name,
            comp_dir,
            files,
            rows,
            functions,
            globals,
        })
    }

    /// Last line row at or before `pc`, if the unit covers it.
    pub fn find_row_by_pc(&self, pc: GlobalAddress) -> Option<&LineRow> {
        let idx = self.rows.partition_point(|row| row.address <= pc);
        if idx == 0 {
            return None;
        }
        let row = &self.rows[idx - 1];
        (!row.end_sequence).then_some(row)
    }

    pub fn find_exact_row(&self, pc: GlobalAddress) -> Option<&LineRow> {
        self.find_row_by_pc(pc).filter(|row| row.address == pc)
    }

    pub fn place_from_row(&self, row: &LineRow) -> Option<Place> {
        let file = self.files.get(row.file_idx as usize)?.clone();
        Some(Place {
            file,
            line_number: row.line,
            column_number: row.column,
            address: row.address,
            is_stmt: row.is_stmt,
            prolog_end: row.prolog_end,
        })
    }

    /// Next row after the one covering `pc` (used for range iteration).
    pub fn next_row(&self, row_address: GlobalAddress) -> Option<&LineRow> {
        let idx = self.rows.partition_point(|row| row.address <= row_address);
        self.rows.get(idx).filter(|r| !r.end_sequence)
    }

    /// All statement rows in `file` at `line`; when the line holds no
    /// statement, snap to the closest following line that does.
    pub fn find_rows_for_line(&self, file: &Path, line: u64) -> Vec<&LineRow> {
        let file_matches = |row: &LineRow| {
            self.files
                .get(row.file_idx as usize)
                .map(|f| f.ends_with(file))
                .unwrap_or(false)
        };

        let exact: Vec<&LineRow> = self
            .rows
            .iter()
            .filter(|row| !row.end_sequence && row.is_stmt && row.line == line && file_matches(row))
            .collect();
        if !exact.is_empty() {
            return exact;
        }

        // snap to the next valid statement line
        let snapped_line = self
            .rows
            .iter()
            .filter(|row| !row.end_sequence && row.is_stmt && row.line > line && file_matches(row))
            .map(|row| row.line)
            .min();
        let Some(snapped_line) = snapped_line else {
            return vec![];
        };
        self.rows
            .iter()
            .filter(|row| {
                !row.end_sequence && row.is_stmt && row.line == snapped_line && file_matches(row)
            })
            .collect()
    }

    pub fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<&FunctionDie> {
        self.functions.iter().find(|f| f.contains(pc))
    }

    pub fn covers(&self, pc: GlobalAddress) -> bool {
        let idx = self.rows.partition_point(|row| row.address <= pc);
        idx > 0 && !self.rows[idx - 1].end_sequence
    }
}

fn parse_lines(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    comp_dir: Option<&Path>,
) -> Result<(Vec<PathBuf>, Vec<LineRow>), Error> {
    let Some(program) = unit.line_program.clone() else {
        return Ok((vec![], vec![]));
    };

    let header = program.header().clone();
    // the table is indexed by the raw file number of each line row; in
    // DWARF < 5 numbering starts at 1, so slot 0 may stay a placeholder
    let mut files = Vec::with_capacity(header.file_names().len() + 1);
    for idx in 0..=header.file_names().len() as u64 {
        let Some(file) = header.file(idx) else {
            files.push(PathBuf::new());
            continue;
        };
        let mut path = PathBuf::new();
        if let Some(dir) = comp_dir {
            path.push(dir);
        }
        if let Some(dir) = file.directory(&header) {
            let dir = dwarf.attr_string(unit, dir)?;
            let dir = PathBuf::from(dir.to_string_lossy()?.as_ref());
            if dir.is_absolute() {
                path = dir;
            } else {
                path.push(dir);
            }
        }
        let fname = dwarf.attr_string(unit, file.path_name())?;
        path.push(fname.to_string_lossy()?.as_ref());
        files.push(path);
    }

    let mut rows = vec![];
    let mut line_rows = program.rows();
    while let Some((_, row)) = line_rows.next_row()? {
        rows.push(LineRow {
            address: GlobalAddress::from(row.address()),
            file_idx: row.file_index(),
            line: row.line().map(|l| l.get()).unwrap_or(0),
            column: match row.column() {
                gimli::ColumnType::LeftEdge => 0,
                gimli::ColumnType::Column(c) => c.get(),
            },
            is_stmt: row.is_stmt(),
            prolog_end: row.prologue_end(),
            epilog_begin: row.epilogue_begin(),
            end_sequence: row.end_sequence(),
        });
    }
    rows.sort_unstable_by_key(|row| row.address);

    Ok((files, rows))
}

fn die_name(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Option<String> {
    let attr = entry.attr_value(DW_AT_name).ok()??;
    let s = dwarf.attr_string(unit, attr).ok()?;
    s.to_string_lossy().ok().map(|s| s.to_string())
}

fn die_ranges(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Result<Vec<Range>, Error> {
    Ok(dwarf.die_ranges(unit, entry)?.collect()?)
}

fn type_ref(entry: &gimli::DebuggingInformationEntry<EndianArcSlice>) -> Option<UnitOffset> {
    match entry.attr_value(DW_AT_type).ok()?? {
        AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

/// Walk the whole DIE tree once and index functions, parameters, local
/// variables and unit-level globals.
fn parse_dies(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    unit: &Unit<EndianArcSlice>,
) -> Result<(Vec<FunctionDie>, Vec<VariableDie>), Error> {
    let mut functions: Vec<FunctionDie> = vec![];
    let mut globals: Vec<VariableDie> = vec![];

    // scope stacks keyed by DIE depth
    let mut namespaces: Vec<(isize, String)> = vec![];
    let mut fn_stack: Vec<(isize, usize)> = vec![];
    let mut block_stack: Vec<(isize, Vec<Range>)> = vec![];

    let mut depth = 0isize;
    let mut cursor = unit.entries();
    while let Some((delta, entry)) = cursor.next_dfs()? {
        depth += delta;
        namespaces.retain(|(d, _)| *d < depth);
        fn_stack.retain(|(d, _)| *d < depth);
        block_stack.retain(|(d, _)| *d < depth);

        match entry.tag() {
            DW_TAG_namespace => {
                if let Some(name) = die_name(dwarf, unit, entry) {
                    namespaces.push((depth, name));
                }
            }
            DW_TAG_subprogram => {
                let ranges = die_ranges(dwarf, unit, entry)?;
                if ranges.is_empty() {
                    // declaration or inline-only instance
                    continue;
                }
                let name = die_name(dwarf, unit, entry);
                let linkage_name = entry
                    .attr_value(DW_AT_linkage_name)?
                    .and_then(|attr| dwarf.attr_string(unit, attr).ok())
                    .and_then(|s| s.to_string_lossy().ok().map(|s| s.to_string()));

                let full_name = match (&name, linkage_name) {
                    (_, Some(linkage)) => {
                        Some(rustc_demangle::demangle(&linkage).to_string())
                    }
                    (Some(name), None) if !namespaces.is_empty() => Some(format!(
                        "{}::{}",
                        namespaces.iter().map(|(_, n)| n.as_str()).collect::<Vec<_>>().join("::"),
                        name
                    )),
                    (Some(name), None) => Some(name.clone()),
                    (None, None) => None,
                };

                functions.push(FunctionDie {
                    name,
                    full_name,
                    die_offset: entry.offset(),
                    ranges,
                    frame_base: entry.attr_value(DW_AT_frame_base)?,
                    parameters: vec![],
                    variables: vec![],
                    inline_ranges: vec![],
                });
                fn_stack.push((depth, functions.len() - 1));
            }
            DW_TAG_inlined_subroutine => {
                let ranges = die_ranges(dwarf, unit, entry)?;
                if let Some((_, fn_idx)) = fn_stack.last() {
                    functions[*fn_idx].inline_ranges.extend(ranges);
                }
            }
            DW_TAG_lexical_block => {
                let ranges = die_ranges(dwarf, unit, entry)?;
                block_stack.push((depth, ranges));
            }
            DW_TAG_formal_parameter | DW_TAG_variable => {
                let var = VariableDie {
                    name: die_name(dwarf, unit, entry),
                    die_offset: entry.offset(),
                    type_ref: type_ref(entry),
                    location: entry.attr_value(DW_AT_location)?,
                    lexical_scope: block_stack.last().map(|(_, ranges)| ranges.clone()),
                };

                match fn_stack.last() {
                    Some((_, fn_idx)) if entry.tag() == DW_TAG_formal_parameter => {
                        functions[*fn_idx].parameters.push(var)
                    }
                    Some((_, fn_idx)) => functions[*fn_idx].variables.push(var),
                    None => globals.push(var),
                }
            }
            _ => {}
        }
    }

    // demangled full names sometimes end with a `::h<hash>` disambiguator
    for func in &mut functions {
        if let Some(full) = &func.full_name {
            if let Some(pos) = full.rfind("::h") {
                if full[pos + 3..].chars().all(|c| c.is_ascii_hexdigit()) {
                    func.full_name = Some(full[..pos].to_string());
                }
            }
        }
    }

    Ok((functions, globals))
}
