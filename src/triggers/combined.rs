use super::{BackupTrigger, Trigger, TriggerContext};

/// Registers and unregisters a group of triggers together
#[derive(Debug)]
pub struct CombinedTrigger {
    children: Vec<Trigger>,
}

impl CombinedTrigger {
    /// Group `children`
    pub fn new(children: Vec<Trigger>) -> Self {
        Self { children }
    }

    /// Grouped triggers
    pub fn children(&self) -> &[Trigger] {
        &self.children
    }
}

impl BackupTrigger for CombinedTrigger {
    fn register(&self, ctx: TriggerContext) {
        for child in &self.children {
            child.register(ctx.clone());
        }
    }

    fn unregister(&self) {
        for child in &self.children {
            child.unregister();
        }
    }

    fn is_active(&self) -> bool {
        self.children.iter().any(BackupTrigger::is_active)
    }

    fn name(&self) -> &'static str {
        "combined"
    }
}
