//! Host implementations of the classic Mac OS shared libraries.
//!
//! | Library | Globals | Host resources |
//! |---------|---------|----------------|
//! | [`StdCLib`] | C runtime data, `_iob` stream table | host files and standard streams |
//! | [`InterfaceLib`] | QuickDraw globals, fatal error handler | optional UI helper channel |

pub mod interfacelib;
pub mod stdclib;

pub use interfacelib::InterfaceLib;
pub use stdclib::StdCLib;

use crate::bridge::LibraryRegistry;

/// Register every built-in library with `registry`.
pub fn register_builtins(registry: &LibraryRegistry) {
    registry.register::<StdCLib>();
    registry.register::<InterfaceLib>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bridge::{LibraryContext, MachineState, SymbolResolution},
        test::address_space,
    };

    #[test]
    fn builtins_resolve_across_libraries() {
        let space = address_space();
        let registry = LibraryRegistry::new(LibraryContext::new(space.clone()));
        register_builtins(&registry);
        registry.load("StdCLib").unwrap();
        registry.load("InterfaceLib").unwrap();

        let SymbolResolution::Code(strlen) = registry.resolve("strlen").unwrap() else {
            panic!("strlen should be code");
        };
        assert!(matches!(
            registry.resolve("qd").unwrap(),
            SymbolResolution::Data(_)
        ));
        assert_eq!(
            registry.resolve("NewWindow").unwrap(),
            SymbolResolution::NotFound
        );

        let text = space.allocate_cstring("classic").unwrap();
        let mut state = MachineState::new();
        state.gpr[3] = text.value();
        registry.invoke(strlen, &mut state).unwrap();
        assert_eq!(state.return_value(), 7);

        registry.unload_all().unwrap();
        assert_eq!(registry.loaded_count(), 0);
    }
}
