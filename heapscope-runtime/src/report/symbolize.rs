//! Program-counter symbolization for report generation.
//!
//! Two sources combine per program counter: `dladdr` supplies the containing
//! object file and the nearest exported symbol (always available for mapped
//! code), and the object's DWARF supplies source-level frames including
//! inline expansions (available only when debug info is present). Both
//! degrade independently: a pc that resolves to neither still produces one
//! physical frame with empty fields, so every pc expands to at least one
//! frame.
//!
//! DWARF contexts are built once per object file and cached; a file that
//! cannot be read or parsed is cached as absent so it is not retried for
//! every pc it contains.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use libc::c_void;
use object::{Object, ObjectKind, ObjectSection};
use rustc_demangle::demangle;

use crate::domain::SymbolizeError;

/// One logical frame at a program counter. A pc with inlined calls expands
/// to several of these; the last one is always the physical frame.
#[derive(Debug, Clone)]
pub struct SymFrame {
    pub func: Option<String>,
    pub file: Option<String>,
    /// 0 when unknown.
    pub line: u32,
    /// 0 when unknown.
    pub column: u32,
    pub is_inline: bool,
}

/// Everything the report records about one program counter.
#[derive(Debug, Clone)]
pub struct SymbolizedPc {
    pub object_path: Option<String>,
    /// Address relative to the object's load base (for shared objects) or
    /// the raw pc (for fixed-address executables and unresolved pcs).
    pub object_address: u64,
    /// Nearest exported symbol, demangled.
    pub object_symbol: Option<String>,
    /// Never empty; exactly the last entry has `is_inline == false`.
    pub frames: Vec<SymFrame>,
}

struct Module {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Shared objects are loaded at an arbitrary base, so pcs must be
    /// rebased before DWARF lookup. Fixed-address executables are not.
    relocatable: bool,
}

impl Module {
    fn load(path: &Path) -> Result<Self, SymbolizeError> {
        let data = fs::read(path)
            .map_err(|source| SymbolizeError::ReadObject { path: path.to_path_buf(), source })?;
        let obj = object::File::parse(&*data)?;
        let relocatable = obj.kind() == ObjectKind::Dynamic;

        let endian =
            if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };
        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf)?;

        Ok(Self { ctx, relocatable })
    }
}

pub struct Symbolizer {
    /// Per-object DWARF contexts; `None` marks an object whose debug info
    /// could not be loaded.
    modules: RefCell<HashMap<PathBuf, Option<Rc<Module>>>>,
}

impl Symbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self { modules: RefCell::new(HashMap::new()) }
    }

    /// Resolve one program counter. Infallible: missing information leaves
    /// the corresponding fields empty rather than failing the report.
    pub fn resolve(&self, pc: u64) -> SymbolizedPc {
        let mut out = SymbolizedPc {
            object_path: None,
            object_address: pc,
            object_symbol: None,
            frames: Vec::new(),
        };

        // SAFETY: dladdr only inspects the loader's mapping tables; any
        // address value is acceptable input.
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let resolved = unsafe { libc::dladdr(pc as usize as *const c_void, &mut info) } != 0;

        let mut module_path = None;
        if resolved {
            if !info.dli_fname.is_null() {
                // SAFETY: dladdr reported a valid NUL-terminated path.
                let path =
                    unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned();
                module_path = Some(PathBuf::from(&path));
                out.object_path = Some(path);
            }
            if !info.dli_sname.is_null() {
                // SAFETY: dladdr reported a valid NUL-terminated symbol name.
                let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
                out.object_symbol = Some(format!("{:#}", demangle(&name)));
            }
        }

        if let Some(module) = module_path.as_deref().and_then(|p| self.module(p)) {
            let lookup = if module.relocatable {
                pc.wrapping_sub(info.dli_fbase as u64)
            } else {
                pc
            };
            out.object_address = lookup;

            if let Ok(mut frames) = module.ctx.find_frames(lookup).skip_all_loads() {
                while let Ok(Some(frame)) = frames.next() {
                    let func = frame
                        .function
                        .as_ref()
                        .and_then(|f| f.demangle().ok().map(|s| s.to_string()));
                    let (file, line, column) = match frame.location {
                        Some(loc) => (
                            loc.file.map(str::to_string),
                            loc.line.unwrap_or(0),
                            loc.column.unwrap_or(0),
                        ),
                        None => (None, 0, 0),
                    };
                    out.frames.push(SymFrame { func, file, line, column, is_inline: true });
                }
            }
        }

        match out.frames.last_mut() {
            // DWARF iterates outermost-inline last; that last frame is the
            // physical one.
            Some(last) => last.is_inline = false,
            None => out.frames.push(SymFrame {
                func: out.object_symbol.clone(),
                file: None,
                line: 0,
                column: 0,
                is_inline: false,
            }),
        }

        out
    }

    fn module(&self, path: &Path) -> Option<Rc<Module>> {
        if let Some(cached) = self.modules.borrow().get(path) {
            return cached.clone();
        }
        let loaded = match Module::load(path) {
            Ok(module) => Some(Rc::new(module)),
            Err(err) => {
                log::debug!("no debug info for {}: {err}", path.display());
                None
            }
        };
        self.modules.borrow_mut().insert(path.to_path_buf(), loaded.clone());
        loaded
    }
}

impl Default for Symbolizer {
    fn default() -> Self {
        Self::new()
    }
}
