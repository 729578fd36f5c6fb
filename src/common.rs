//! Merging of common (tentative) symbols.
//!
//! Commons behave like Fortran COMMON blocks: every module may carry one,
//! equal-size occurrences share storage at the first location chosen, and
//! a size disagreement is a hard error. Storage comes out of the loading
//! module's zero-filled common tail, so a common never outlives the module
//! that materialized it, and removal is handled by the ordinary symbol
//! unregistration path.

use crate::{
    Result,
    error::{common_mismatch, oom_error, state_error},
    loader::common_align,
    module::{Module, SymbolClass},
    os::Mmap,
    symtab::SymbolTable,
};

/// Gives every common symbol of `module` a home: either the storage an
/// earlier module already picked, or a fresh slot in this module's tail.
pub(crate) fn allocate_commons<M: Mmap>(
    module: &mut Module<M>,
    symtab: &mut SymbolTable,
) -> Result<()> {
    for idx in 0..module.symbols.len() {
        let sym = &module.symbols[idx];
        if sym.class != SymbolClass::Common {
            continue;
        }
        let name = sym.name.clone();
        let size = sym.size;
        if let Some(entry) = symtab.lookup(&name) {
            if entry.is_defined() {
                match entry.common_size {
                    Some(have) if have != size => {
                        return Err(common_mismatch(&name, have, size));
                    }
                    Some(_) => continue,
                    None => {
                        // A real definition absorbs a matching data common,
                        // but a function under a common is a type clash.
                        if entry.is_function() {
                            return Err(state_error(format!(
                                "common symbol `{name}` collides with a function definition"
                            )));
                        }
                        continue;
                    }
                }
            }
        }
        let Some(addr) = module.alloc_common(size, common_align(size)) else {
            return Err(oom_error(format!(
                "common tail exhausted allocating `{name}` ({size} bytes)"
            )));
        };
        symtab.define_common(&name, addr, size, module);
        log::trace!("common `{name}` placed at {addr:#x} ({size} bytes)");
    }
    Ok(())
}
