//! Universe configuration and the behavioural policies it selects.

/// How a parent's world transform is combined with a child's local transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Composition {
    /// Standard TRS composition: the child's translation is scaled and
    /// rotated into the parent's frame before it is added.
    #[default]
    Affine,
    /// Compatibility mode: rotations compose, translations are summed
    /// without rotating, and the parent's scale passes through unchanged.
    Legacy,
}

/// What happens when a moved cell's center leaves its parent's preferred
/// bounds (the parent's local bounds under its world transform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReparentPolicy {
    /// Log a warning and leave the graph alone.
    #[default]
    WarnOnly,
    /// Move the cell under the nearest container ancestor whose preferred
    /// bounds hold its center, keeping its world placement.
    ToContainer,
}

/// How many proximity events a single viewer move may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionPolicy {
    /// At most one enter or one exit per move, even when several nested
    /// volumes were crossed at once.
    #[default]
    Collapse,
    /// One event per crossed boundary: exits inner to outer, then enters
    /// outer to inner.
    PerBoundary,
}

/// Settings fixed for the lifetime of a [`Universe`](crate::universe::Universe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniverseConfig {
    pub composition: Composition,
    pub reparent: ReparentPolicy,
    pub transitions: TransitionPolicy,
    /// Name given to the applier thread.
    pub applier_thread_name: String,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            composition: Composition::default(),
            reparent: ReparentPolicy::default(),
            transitions: TransitionPolicy::default(),
            applier_thread_name: "orrery-applier".to_owned(),
        }
    }
}

impl UniverseConfig {
    pub fn with_composition(mut self, composition: Composition) -> Self {
        self.composition = composition;
        self
    }

    pub fn with_reparent(mut self, reparent: ReparentPolicy) -> Self {
        self.reparent = reparent;
        self
    }

    pub fn with_transitions(mut self, transitions: TransitionPolicy) -> Self {
        self.transitions = transitions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let config = UniverseConfig::default();
        assert_eq!(config.composition, Composition::Affine);
        assert_eq!(config.reparent, ReparentPolicy::WarnOnly);
        assert_eq!(config.transitions, TransitionPolicy::Collapse);
    }

    #[test]
    fn builders_override_single_fields() {
        let config = UniverseConfig::default()
            .with_transitions(TransitionPolicy::PerBoundary)
            .with_reparent(ReparentPolicy::ToContainer);
        assert_eq!(config.transitions, TransitionPolicy::PerBoundary);
        assert_eq!(config.reparent, ReparentPolicy::ToContainer);
        assert_eq!(config.composition, Composition::Affine);
    }
}
