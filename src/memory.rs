//! Access to the memory of the server process on Linux.
//!
//! Modules are found with `dl_iterate_phdr`, and vtables through the symbols the compiler emits
//! for them, which the server binaries export.

use std::{
    ffi::{c_void, CStr},
    os::raw::{c_char, c_int},
    path::Path,
};

use cached::proc_macro::cached;
use dlopen::raw::Library;
use eyre::{Context, Result};

use crate::{
    host::{Memory, ModuleImage},
    meta::game_data::Platform,
};

/// The executable part of a loaded module.
#[derive(Clone, Copy, Debug)]
struct CodeRange {
    base: usize,
    len: usize,
}

struct Search<'a> {
    file_name: &'a str,
    found: Option<CodeRange>,
}

unsafe extern "C" fn visit_module(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let info = &*info;
    let search = &mut *(data as *mut Search);

    if info.dlpi_name.is_null() {
        return 0;
    }

    let name = CStr::from_ptr(info.dlpi_name).to_string_lossy();
    let matches = Path::new(name.as_ref())
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .map_or(false, |file_name| file_name.starts_with(search.file_name));

    if !matches {
        return 0;
    }

    let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

    search.found = headers
        .iter()
        .find(|header| header.p_type == libc::PT_LOAD && header.p_flags & libc::PF_X != 0)
        .map(|header| CodeRange {
            base: info.dlpi_addr as usize + header.p_vaddr as usize,
            len: header.p_memsz as usize,
        });

    // Stop iterating.
    1
}

#[cached(result = true)]
fn find_code(file_name: String) -> Result<CodeRange> {
    let mut search = Search {
        file_name: &file_name,
        found: None,
    };

    unsafe {
        libc::dl_iterate_phdr(
            Some(visit_module),
            &mut search as *mut Search as *mut c_void,
        );
    }

    let range = search
        .found
        .ok_or_else(|| eyre::format_err!("'{file_name}' is not loaded"))?;

    log::info!(
        "Found '{file_name}' code at {:#x} ({:#x} bytes).",
        range.base,
        range.len
    );

    Ok(range)
}

/// Returns the mangled name of `class`'s vtable.
fn vtable_symbol(class: &str) -> String {
    format!("_ZTV{}{class}", class.len())
}

#[cached(result = true)]
fn find_vtable(file_name: String, class: String) -> Result<usize> {
    let library = Library::open(&file_name)
        .wrap_err_with(|| format!("Failed to open '{file_name}'"))?;

    let symbol = unsafe { library.symbol::<*const u8>(&vtable_symbol(&class)) }
        .wrap_err_with(|| format!("No vtable for '{class}' in '{file_name}'"))?;

    // Objects point past the offset-to-top and type info entries.
    Ok(symbol as usize + 2 * std::mem::size_of::<usize>())
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 0x1000,
    }
}

fn protect(start: usize, len: usize, protection: c_int) -> Result<()> {
    if unsafe { libc::mprotect(start as *mut c_void, len, protection) } != 0 {
        return Err(std::io::Error::last_os_error())
            .wrap_err_with(|| format!("mprotect failed for {start:#x}"));
    }

    Ok(())
}

/// The memory of the process we're loaded into.
#[derive(Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    pub fn new() -> ProcessMemory {
        ProcessMemory
    }
}

impl Memory for ProcessMemory {
    fn module(&self, name: &str) -> Option<ModuleImage<'_>> {
        let file_name = Platform::Linux.library_file_name(name);

        match find_code(file_name) {
            Ok(range) => Some(ModuleImage {
                base: range.base,
                bytes: unsafe { std::slice::from_raw_parts(range.base as *const u8, range.len) },
            }),

            Err(err) => {
                log::warn!("{err:?}");
                None
            }
        }
    }

    fn vtable(&self, module: &str, class: &str) -> Option<usize> {
        let file_name = Platform::Linux.library_file_name(module);

        match find_vtable(file_name, class.to_string()) {
            Ok(address) => Some(address),
            Err(err) => {
                log::warn!("{err:?}");
                None
            }
        }
    }

    fn read_usize(&self, address: usize) -> Option<usize> {
        (address != 0).then(|| unsafe { (address as *const usize).read_unaligned() })
    }

    fn read_i32(&self, address: usize) -> Option<i32> {
        (address != 0).then(|| unsafe { (address as *const i32).read_unaligned() })
    }

    fn read_c_str(&self, address: usize) -> Option<String> {
        if address == 0 {
            return None;
        }

        let text = unsafe { CStr::from_ptr(address as *const c_char) };
        Some(text.to_string_lossy().into_owned())
    }

    fn read_bytes(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        if address == 0 {
            return None;
        }

        Some(unsafe { std::slice::from_raw_parts(address as *const u8, len) }.to_vec())
    }

    fn write_bytes(&self, address: usize, bytes: &[u8]) -> Result<()> {
        if address == 0 {
            return Err(eyre::format_err!("Refusing to write to a null address"));
        }

        let page = page_size();
        let start = address & !(page - 1);
        let end = (address + bytes.len() + page - 1) & !(page - 1);

        protect(
            start,
            end - start,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )?;

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        }

        protect(start, end - start, libc::PROT_READ | libc::PROT_EXEC)
    }
}
