use std::collections::HashSet;
use std::sync::Arc;

use crate::plan::templates::{self, ANALYZER_IMAGE_PREFIX};
use crate::plan::{Axis, Plan, PlanError};
use crate::store::{Inventory, RecordStore, RepoRevSpec};

/// Descriptor files looked up at the repository root, in priority order.
pub const DESCRIPTOR_PATHS: &[&str] = &[".ci.yml", ".drone.yml"];

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Leave test steps out of auto-generated plans.
    pub skip_inferred_tests: bool,
}

/// Where the import step sends analyzer output.
#[derive(Clone)]
pub struct ImportTarget {
    pub url: String,
    /// Build-scoped credential.
    pub token: String,
}

impl std::fmt::Debug for ImportTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportTarget")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPlan {
    pub plan: Plan,
    pub axes: Vec<Axis>,
    /// True when the plan was synthesized from the inventory.
    pub generated: bool,
}

/// Compiles a repository revision into an executable plan.
pub struct PlanCompiler {
    store: Arc<dyn RecordStore>,
    options: CompileOptions,
}

impl PlanCompiler {
    pub fn new(store: Arc<dyn RecordStore>, options: CompileOptions) -> Self {
        Self { store, options }
    }

    /// Reads the descriptor (or inventory) for `rev` and builds the plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor is malformed or the store fails.
    pub async fn compile(
        &self,
        rev: &RepoRevSpec,
        import: &ImportTarget,
    ) -> Result<CompiledPlan, PlanError> {
        let descriptor = self.fetch_descriptor(rev).await?;
        let inventory = self.store.get_inventory(rev).await?;

        let compiled = synthesize(descriptor, &inventory, &self.options, import);
        tracing::debug!(
            rev = %rev,
            generated = compiled.generated,
            steps = compiled.plan.steps().len(),
            axes = compiled.axes.len(),
            "Compiled plan"
        );
        Ok(compiled)
    }

    async fn fetch_descriptor(&self, rev: &RepoRevSpec) -> Result<Option<Plan>, PlanError> {
        for path in DESCRIPTOR_PATHS {
            match self.store.get_repo_file(rev, path).await {
                Ok(bytes) => {
                    let text = String::from_utf8(bytes).map_err(|_| {
                        PlanError::Invalid(format!("{path} is not valid UTF-8"))
                    })?;
                    let plan = Plan::parse(&text).inspect_err(|e| {
                        tracing::warn!(rev = %rev, path, error = %e, "Malformed CI descriptor");
                    })?;
                    return Ok(Some(plan));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// Builds the final plan from an optional descriptor and the inventory.
pub fn synthesize(
    descriptor: Option<Plan>,
    inventory: &Inventory,
    options: &CompileOptions,
    import: &ImportTarget,
) -> CompiledPlan {
    let (mut plan, generated) = match descriptor {
        Some(plan) => (plan, false),
        None => (generate(inventory, options), true),
    };
    let axes = plan.axes();

    // Explicitly configured analyzers win over detected ones.
    if !plan.references_image(ANALYZER_IMAGE_PREFIX) && !inventory.is_empty() {
        inject_analyzers(&mut plan, inventory, &axes);
    }

    if plan.references_image(ANALYZER_IMAGE_PREFIX) {
        plan.insert_step(templates::import(&import.url, &import.token), &axes);
    }

    CompiledPlan {
        plan,
        axes,
        generated,
    }
}

fn generate(inventory: &Inventory, options: &CompileOptions) -> Plan {
    let mut plan = Plan::new();
    if inventory.is_empty() {
        plan.push_step(templates::no_language_detected());
        return plan;
    }

    let mut seen = HashSet::new();
    for lang in &inventory.languages {
        let Some(template) = templates::language(lang) else {
            plan.push_step(templates::unsupported_language(lang));
            continue;
        };
        // Languages sharing a template (JavaScript/TypeScript) build once.
        let key = template.build.first().map(|s| s.name.clone());
        if !seen.insert(key) {
            continue;
        }
        for step in template.build {
            plan.push_step(step);
        }
        if !options.skip_inferred_tests {
            for step in template.test {
                plan.push_step(step);
            }
        }
        plan.matrix.merge(&template.matrix);
    }
    plan
}

fn inject_analyzers(plan: &mut Plan, inventory: &Inventory, axes: &[Axis]) {
    let mut images = HashSet::new();
    for lang in &inventory.languages {
        match templates::analyzer(lang) {
            Some(step) => {
                if images.insert(step.image.clone()) {
                    plan.insert_step(step, axes);
                }
            }
            None => plan.insert_step(templates::unsupported_analyzer(lang), axes),
        }
    }
    if images.is_empty() {
        plan.insert_step(templates::no_analyzer(), axes);
    }
}
