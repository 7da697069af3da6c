//! Finalizer rules for CompositionDefinitions
//!
//! Finalizer lists are computed, not mutated in place: each function returns
//! the new list, or `None` when nothing would change, so callers only write
//! when needed.

/// Set while instances of the generated kind exist
pub const COMPOSITIONS_FINALIZER: &str = "composition.krateo.io/composition-still-exist";

/// Set on every definition so deletion waits for the workload teardown
pub const CLEANUP_FINALIZER: &str = "core.krateo.io/cleanup";

pub fn has(finalizers: &[String], name: &str) -> bool {
    finalizers.iter().any(|f| f == name)
}

/// `finalizers` with `name` appended, or `None` if already present
pub fn ensure(finalizers: &[String], name: &str) -> Option<Vec<String>> {
    if has(finalizers, name) {
        return None;
    }
    let mut next = finalizers.to_vec();
    next.push(name.to_string());
    Some(next)
}

/// `finalizers` without any of `names`, or `None` if none was present
pub fn remove(finalizers: &[String], names: &[&str]) -> Option<Vec<String>> {
    if !finalizers.iter().any(|f| names.contains(&f.as_str())) {
        return None;
    }
    Some(
        finalizers
            .iter()
            .filter(|f| !names.contains(&f.as_str()))
            .cloned()
            .collect(),
    )
}

/// The finalizers this controller owns
pub fn owned() -> [&'static str; 2] {
    [COMPOSITIONS_FINALIZER, CLEANUP_FINALIZER]
}
