use rustc_hash::FxHashMap;

use crate::ast::{Callee, Prototype};

/// Most recently seen prototype for every named function and operator.
///
/// Code generation consults it to declare functions that live in earlier
/// compilation units.
#[derive(Debug, Default)]
pub struct PrototypeRegistry {
    prototypes: FxHashMap<Callee, Prototype>,
}

impl PrototypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `prototype` and returns the entry it replaced.
    pub fn insert(&mut self, prototype: Prototype) -> Option<Prototype> {
        self.prototypes.insert(prototype.callee(), prototype)
    }

    pub fn get(&self, callee: &Callee) -> Option<&Prototype> {
        self.prototypes.get(callee)
    }

    pub fn contains(&self, callee: &Callee) -> bool {
        self.prototypes.contains_key(callee)
    }

    /// Puts back the entry [`PrototypeRegistry::insert`] displaced.
    pub fn restore(&mut self, callee: &Callee, previous: Option<Prototype>) {
        match previous {
            Some(prototype) => {
                self.prototypes.insert(callee.clone(), prototype);
            }
            None => {
                self.prototypes.remove(callee);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::PrototypeKind;

    #[test]
    fn operators_and_functions_share_no_keys() {
        let mut registry = PrototypeRegistry::new();
        registry.insert(Prototype::function("binary|", vec!["a".into(), "b".into()]));
        registry.insert(Prototype {
            name: "binary|".to_string(),
            params: vec!["a".into(), "b".into()],
            kind: PrototypeKind::Binary {
                op: '|',
                precedence: 5,
            },
        });
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&Callee::Binary('|')));
        assert!(registry.contains(&Callee::Named("binary|".to_string())));
    }

    #[test]
    fn restore_undoes_insert() {
        let mut registry = PrototypeRegistry::new();
        let original = Prototype::function("f", vec!["x".into()]);
        registry.insert(original.clone());

        let previous = registry.insert(Prototype::function("f", vec![]));
        registry.restore(&Callee::Named("f".to_string()), previous);
        assert_eq!(registry.get(&Callee::Named("f".to_string())), Some(&original));

        let previous = registry.insert(Prototype::function("g", vec![]));
        registry.restore(&Callee::Named("g".to_string()), previous);
        assert!(!registry.contains(&Callee::Named("g".to_string())));
    }
}
