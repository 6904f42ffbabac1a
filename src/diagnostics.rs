// ABOUTME: Diagnostics accumulator for non-fatal warnings during a command.
// ABOUTME: Collects warnings that shouldn't fail an operation but should be shown to users.

/// Collects non-fatal warnings during an operation.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: Vec<Warning>,
}

impl Diagnostics {
    /// Record a warning, auto-logging it via tracing.
    pub fn warn(&mut self, warning: Warning) {
        tracing::warn!(kind = ?warning.kind, "{}", warning.message);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
    }

    /// Warning texts, in the order they were recorded.
    pub fn messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.message.clone()).collect()
    }
}

/// A non-fatal warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A node or database could not be deleted and may be orphaned.
    pub fn resource_cleanup(message: impl Into<String>) -> Self {
        Self::new(WarningKind::ResourceCleanup, message)
    }

    /// A database was deliberately kept because it is shared or attached.
    pub fn resource_retained(message: impl Into<String>) -> Self {
        Self::new(WarningKind::ResourceRetained, message)
    }

    /// The previous container could not be removed after a redeploy.
    pub fn container_retire(message: impl Into<String>) -> Self {
        Self::new(WarningKind::ContainerRetire, message)
    }

    pub fn lock_break(message: impl Into<String>) -> Self {
        Self::new(WarningKind::LockBreak, message)
    }

    pub fn lock_release(message: impl Into<String>) -> Self {
        Self::new(WarningKind::LockRelease, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    ResourceCleanup,
    ResourceRetained,
    ContainerRetire,
    /// A stale or forced lock was removed.
    LockBreak,
    /// Failed to remove the lock file (it may remain).
    LockRelease,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_starts_empty() {
        let diag = Diagnostics::default();
        assert!(!diag.has_warnings());
        assert!(diag.warnings().is_empty());
    }

    #[test]
    fn diagnostics_collects_in_order() {
        let mut diag = Diagnostics::default();
        diag.warn(Warning::resource_cleanup("droplet 42 not deleted"));
        diag.warn(Warning::lock_break("broke stale lock"));

        assert!(diag.has_warnings());
        assert_eq!(
            diag.messages(),
            vec!["droplet 42 not deleted", "broke stale lock"]
        );
    }

    #[test]
    fn extend_merges_warnings() {
        let mut outer = Diagnostics::default();
        let mut inner = Diagnostics::default();
        inner.warn(Warning::container_retire("web-old still present"));
        outer.warn(Warning::resource_retained("database shared"));
        outer.extend(inner);

        let kinds: Vec<WarningKind> = outer.warnings().iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![WarningKind::ResourceRetained, WarningKind::ContainerRetire]
        );
    }
}
