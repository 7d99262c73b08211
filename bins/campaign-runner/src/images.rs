// Image registry check: prune work whose sandbox images were never built
use crate::runtime::SandboxRuntime;
use campaign_common::layout::image_name;
use campaign_common::types::WorkUnit;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ImageRegistry {
    runtime: Arc<dyn SandboxRuntime>,
    prefix: String,
}

impl ImageRegistry {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            prefix: prefix.into(),
        }
    }

    pub fn image_for(&self, identifier: &str) -> String {
        image_name(&self.prefix, identifier)
    }

    pub async fn exists(&self, identifier: &str) -> bool {
        let image = self.image_for(identifier);
        let found = self.runtime.image_exists(&image).await;
        debug!(image = %image, found, "Image lookup");
        found
    }

    /// Identifiers among `units` whose image cannot be found
    pub async fn find_missing(&self, units: &[WorkUnit]) -> BTreeSet<String> {
        let mut missing = BTreeSet::new();
        for identifier in identifiers(units) {
            if !self.exists(&identifier).await {
                missing.insert(identifier);
            }
        }
        missing
    }
}

/// Distinct service and tool identifiers referenced by `units`
pub fn identifiers(units: &[WorkUnit]) -> BTreeSet<String> {
    units
        .iter()
        .flat_map(|unit| [unit.service.clone(), unit.tool.clone()])
        .collect()
}

/// Drop every unit with a missing image on either side
pub fn filter_units(units: Vec<WorkUnit>, missing: &BTreeSet<String>) -> Vec<WorkUnit> {
    units
        .into_iter()
        .filter(|unit| !unit.references_any(missing))
        .collect()
}
