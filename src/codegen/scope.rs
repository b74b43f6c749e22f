use rustc_hash::FxHashMap;

/// Variable name to storage handle for one function activation.
///
/// Nested `for` and `var` constructs shadow names with [`Scope::bind`] and
/// undo that with [`Scope::restore`], which puts back exactly what was there
/// before, including "nothing".
#[derive(Debug)]
pub struct Scope<S> {
    bindings: FxHashMap<String, S>,
}

/// The binding a [`Scope::bind`] call displaced.
#[derive(Debug)]
#[must_use = "a shadowed binding must be restored when its construct ends"]
pub struct Shadowed<S> {
    name: String,
    previous: Option<S>,
}

impl<S: Copy> Scope<S> {
    pub fn new() -> Self {
        Self {
            bindings: FxHashMap::default(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<S> {
        self.bindings.get(name).copied()
    }

    pub fn bind(&mut self, name: &str, slot: S) -> Shadowed<S> {
        let previous = self.bindings.insert(name.to_string(), slot);
        Shadowed {
            name: name.to_string(),
            previous,
        }
    }

    pub fn restore(&mut self, shadowed: Shadowed<S>) {
        match shadowed.previous {
            Some(slot) => {
                self.bindings.insert(shadowed.name, slot);
            }
            None => {
                self.bindings.remove(&shadowed.name);
            }
        }
    }
}

impl<S: Copy> Default for Scope<S> {
    fn default() -> Self {
        Self::new()
    }
}
