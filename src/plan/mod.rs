//! CI plans: parsing, normalization and compilation.
//!
//! A plan is read from the repository's YAML descriptor or synthesized from
//! its language inventory, then extended with code-intelligence steps:
//!
//! - [`Plan`]: the ordered step list plus its [`Matrix`]
//! - [`matrix`]: matrix expansion into [`Axis`] values
//! - [`templates`]: per-language build/test/analyzer templates
//! - [`compiler`]: [`PlanCompiler`], which turns a repo revision into a plan

pub mod compiler;
pub mod matrix;
pub mod templates;

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::store::StoreError;

pub use compiler::{CompileOptions, CompiledPlan, ImportTarget, PlanCompiler};
pub use matrix::{Axis, Matrix};

/// Name given to the implicit step of the single-step shorthand.
pub const IMPLICIT_STEP_NAME: &str = "build";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("malformed CI descriptor: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid CI descriptor: {0}")]
    Invalid(String),

    #[error("failed to load plan inputs: {0}")]
    Store(#[from] StoreError),
}

/// A single build step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    /// `K=V` entries.
    pub environment: Vec<String>,
    pub allow_failure: bool,
    /// Only run under axes satisfying this filter.
    pub when: Option<Axis>,
}

impl Step {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            commands: Vec::new(),
            environment: Vec::new(),
            allow_failure: false,
            when: None,
        }
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    pub fn env(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.environment.push(format!("{key}={}", value.as_ref()));
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// A step that prints `message` and fails.
    pub fn failing(name: impl Into<String>, message: &str) -> Self {
        Self::new(name, templates::PLACEHOLDER_IMAGE)
            .command(format!("echo {}", shell_quote(message)))
            .command("exit 1")
    }

    /// Evaluates the step's axis filter.
    pub fn runs_under(&self, axis: &Axis) -> bool {
        self.when.as_ref().map_or(true, |filter| axis.satisfies(filter))
    }

    /// Looks up an environment entry by key.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.environment.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// The `build` section of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildSection {
    /// Shorthand: the section itself is one unnamed step.
    Implicit(Step),
    /// Ordered named steps.
    Named(Vec<Step>),
}

impl Default for BuildSection {
    fn default() -> Self {
        BuildSection::Named(Vec::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub build: BuildSection,
    pub matrix: Matrix,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a YAML descriptor. Unknown fields are ignored.
    ///
    /// Values are read as written: an unquoted `3.10` stays `3.10`.
    pub fn parse(text: &str) -> Result<Self, PlanError> {
        // The generic document only decides the shape; values come from a
        // typed pass over the text.
        let doc: Value = serde_yaml::from_str(text)?;
        let root = match doc {
            Value::Null => return Ok(Self::new()),
            Value::Mapping(root) => root,
            _ => return Err(PlanError::Invalid("descriptor must be a mapping".to_string())),
        };

        let (build, matrix) = match root.get("build") {
            None | Some(Value::Null) => {
                let doc: NamedDescriptor = serde_yaml::from_str(text)?;
                (BuildSection::default(), doc.matrix)
            }
            Some(Value::Mapping(section)) if is_step_body(section) => {
                let doc: ImplicitDescriptor = serde_yaml::from_str(text)?;
                let step = doc.build.into_step(IMPLICIT_STEP_NAME);
                (BuildSection::Implicit(step), doc.matrix)
            }
            Some(Value::Mapping(section)) => {
                if let Some((name, _)) = section.iter().find(|(_, body)| !body.is_mapping()) {
                    return Err(PlanError::Invalid(format!(
                        "step {} must be a mapping",
                        serde_yaml::to_string(name)?.trim_end()
                    )));
                }
                let doc: NamedDescriptor = serde_yaml::from_str(text)?;
                let steps = doc
                    .build
                    .map(|steps| steps.0)
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(name, body)| body.into_step(&name))
                    .collect();
                (BuildSection::Named(steps), doc.matrix)
            }
            Some(_) => return Err(PlanError::Invalid("build must be a mapping".to_string())),
        };

        Ok(Self {
            build,
            matrix: Matrix::from_descriptor(matrix.unwrap_or_default())?,
        })
    }

    pub fn to_yaml(&self) -> Result<String, PlanError> {
        let mut root = Mapping::new();
        let build = match &self.build {
            BuildSection::Implicit(step) => step_to_yaml(step)?,
            BuildSection::Named(steps) => {
                let mut section = Mapping::new();
                for step in steps {
                    section.insert(Value::from(step.name.as_str()), step_to_yaml(step)?);
                }
                Value::Mapping(section)
            }
        };
        root.insert(Value::from("build"), build);
        if !self.matrix.is_empty() {
            root.insert(Value::from("matrix"), serde_yaml::to_value(&self.matrix)?);
        }
        Ok(serde_yaml::to_string(&Value::Mapping(root))?)
    }

    pub fn steps(&self) -> &[Step] {
        match &self.build {
            BuildSection::Implicit(step) => std::slice::from_ref(step),
            BuildSection::Named(steps) => steps,
        }
    }

    /// Rewrites the single-step shorthand into the named-list form so steps
    /// can be appended. A no-op for plans already in list form.
    pub fn normalize(&mut self) {
        if let BuildSection::Implicit(step) = &mut self.build {
            let mut step = step.clone();
            step.name = IMPLICIT_STEP_NAME.to_string();
            self.build = BuildSection::Named(vec![step]);
        }
    }

    /// Normalizes, then appends `step` after all existing steps. The name is
    /// made unique among existing step names.
    pub fn push_step(&mut self, mut step: Step) {
        self.normalize();
        let BuildSection::Named(steps) = &mut self.build else {
            return;
        };
        let base = step.name.clone();
        let mut n = 2;
        while steps.iter().any(|s| s.name == step.name) {
            step.name = format!("{base} ({n})");
            n += 1;
        }
        steps.push(step);
    }

    /// Appends an axis-independent step. With more than one axis the step is
    /// restricted to the first so it does not run once per axis.
    pub fn insert_step(&mut self, mut step: Step, axes: &[Axis]) {
        if axes.len() > 1 {
            step.when = Some(axes[0].clone());
        }
        self.push_step(step);
    }

    pub fn references_image(&self, prefix: &str) -> bool {
        self.steps().iter().any(|s| s.image.starts_with(prefix))
    }

    pub fn axes(&self) -> Vec<Axis> {
        self.matrix.expand()
    }
}

fn is_step_body(section: &Mapping) -> bool {
    section.contains_key("image") || section.contains_key("commands")
}

type RawMatrix = Option<BTreeMap<String, Vec<String>>>;

#[derive(Deserialize)]
struct ImplicitDescriptor {
    build: StepBody,
    #[serde(default)]
    matrix: RawMatrix,
}

#[derive(Deserialize)]
struct NamedDescriptor {
    #[serde(default)]
    build: Option<NamedSteps>,
    #[serde(default)]
    matrix: RawMatrix,
}

/// Named steps in descriptor order.
struct NamedSteps(Vec<(String, StepBody)>);

impl<'de> Deserialize<'de> for NamedSteps {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StepsVisitor;

        impl<'de> Visitor<'de> for StepsVisitor {
            type Value = NamedSteps;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of step names to steps")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<NamedSteps, A::Error> {
                let mut steps = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, StepBody>()? {
                    steps.push(entry);
                }
                Ok(NamedSteps(steps))
            }
        }

        deserializer.deserialize_map(StepsVisitor)
    }
}

/// Step environment as `K=V` entries, written either as a list of entries
/// or as a mapping.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
struct StepEnv(Vec<String>);

impl StepEnv {
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for StepEnv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvVisitor;

        impl<'de> Visitor<'de> for EnvVisitor {
            type Value = StepEnv;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of K=V entries or a mapping")
            }

            fn visit_unit<E: de::Error>(self) -> Result<StepEnv, E> {
                Ok(StepEnv::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<StepEnv, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = seq.next_element::<String>()? {
                    entries.push(entry);
                }
                Ok(StepEnv(entries))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<StepEnv, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    entries.push(format!("{key}={value}"));
                }
                Ok(StepEnv(entries))
            }
        }

        deserializer.deserialize_any(EnvVisitor)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct When {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    matrix: Option<Axis>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StepBody {
    #[serde(default)]
    image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    commands: Vec<String>,
    #[serde(default, skip_serializing_if = "StepEnv::is_empty")]
    environment: StepEnv,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    allow_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    when: Option<When>,
}

impl StepBody {
    fn into_step(self, name: &str) -> Step {
        Step {
            name: name.to_string(),
            image: self.image,
            commands: self.commands,
            environment: self.environment.0,
            allow_failure: self.allow_failure,
            when: self.when.and_then(|when| when.matrix),
        }
    }
}

fn step_to_yaml(step: &Step) -> Result<Value, PlanError> {
    let body = StepBody {
        image: step.image.clone(),
        commands: step.commands.clone(),
        environment: StepEnv(step.environment.clone()),
        allow_failure: step.allow_failure,
        when: step.when.clone().map(|filter| When {
            matrix: Some(filter),
        }),
    };
    Ok(serde_yaml::to_value(body)?)
}

/// Quotes `s` for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORTHAND: &str = r#"
build:
  image: golang:1.21
  commands:
    - go test ./...
  environment:
    CGO_ENABLED: 0
notify:
  slack: {}
"#;

    const NAMED: &str = r#"
build:
  compile:
    image: golang:$$GO_VERSION
    commands: [go build ./...]
  lint:
    image: golangci/golangci-lint
    commands: [golangci-lint run]
    allow_failure: true
    when:
      matrix:
        GO_VERSION: 1.22
matrix:
  GO_VERSION: [1.21, 1.22]
"#;

    #[test]
    fn parses_shorthand_as_implicit_step() {
        let plan = Plan::parse(SHORTHAND).unwrap();
        let BuildSection::Implicit(step) = &plan.build else {
            panic!("expected implicit step");
        };
        assert_eq!(step.name, IMPLICIT_STEP_NAME);
        assert_eq!(step.image, "golang:1.21");
        assert_eq!(step.environment, vec!["CGO_ENABLED=0"]);
        assert!(plan.matrix.is_empty());
    }

    #[test]
    fn parses_named_steps_in_order() {
        let plan = Plan::parse(NAMED).unwrap();
        let names: Vec<_> = plan.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["compile", "lint"]);
        assert!(plan.steps()[1].allow_failure);
        assert_eq!(
            plan.steps()[1].when,
            Some(Axis::from_pairs([("GO_VERSION", "1.22")]))
        );
        assert_eq!(plan.axes().len(), 2);
    }

    #[test]
    fn unquoted_versions_keep_their_spelling() {
        let plan = Plan::parse(
            "build:\n  image: python:$$PY\nmatrix:\n  PY: [3.10, 3.9]\n  GO: [1.20]\n",
        )
        .unwrap();
        let labels: Vec<_> = plan.axes().iter().map(Axis::label).collect();
        assert_eq!(labels, ["GO=1.20 PY=3.10", "GO=1.20 PY=3.9"]);
        assert_eq!(plan.axes()[0].env(), ["GO=1.20", "PY=3.10"]);
    }

    #[test]
    fn unquoted_filter_matches_quoted_matrix_value() {
        let plan = Plan::parse(
            r#"
build:
  test:
    image: python:$$PY
    environment:
      TOOLCHAIN: 1.20
  coverage:
    image: python:$$PY
    when:
      matrix:
        PY: 3.10
matrix:
  PY: ["3.10", "3.9"]
"#,
        )
        .unwrap();
        assert_eq!(plan.steps()[0].environment, ["TOOLCHAIN=1.20"]);

        let coverage = &plan.steps()[1];
        let runs: Vec<_> = plan.axes().iter().map(|a| coverage.runs_under(a)).collect();
        assert_eq!(runs, [true, false]);

        let reparsed = Plan::parse(&plan.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, plan);
    }

    #[test]
    fn non_mapping_step_is_invalid() {
        let err = Plan::parse("build:\n  compile: go build\n").unwrap_err();
        assert!(matches!(err, PlanError::Invalid(_)));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let err = Plan::parse("build: [unterminated").unwrap_err();
        assert!(matches!(err, PlanError::Parse(_)));
    }

    #[test]
    fn empty_document_is_an_empty_plan() {
        let plan = Plan::parse("").unwrap();
        assert!(plan.steps().is_empty());
        assert_eq!(plan.axes(), vec![Axis::empty()]);
    }

    #[test]
    fn push_step_normalizes_shorthand_first() {
        let mut plan = Plan::parse(SHORTHAND).unwrap();
        plan.push_step(Step::new("extra", "alpine"));

        let BuildSection::Named(steps) = &plan.build else {
            panic!("expected named steps");
        };
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "build");
        assert_eq!(steps[1].name, "extra");
    }

    #[test]
    fn normalize_and_insert_only_appends() {
        let mut plan = Plan::parse(NAMED).unwrap();
        let before: Vec<Step> = plan.steps().to_vec();

        plan.normalize();
        plan.normalize();
        plan.push_step(Step::new("extra", "alpine"));

        assert_eq!(&plan.steps()[..before.len()], before.as_slice());
        assert_eq!(plan.steps().len(), before.len() + 1);
    }

    #[test]
    fn insert_step_restricts_to_first_axis_when_matrixed() {
        let mut plan = Plan::parse(NAMED).unwrap();
        let axes = plan.axes();
        plan.insert_step(Step::new("once", "alpine"), &axes);
        let inserted = plan.steps().last().unwrap();
        assert_eq!(inserted.when.as_ref(), Some(&axes[0]));
        assert!(inserted.runs_under(&axes[0]));
        assert!(!inserted.runs_under(&axes[1]));

        let mut single = Plan::parse(SHORTHAND).unwrap();
        let axes = single.axes();
        single.insert_step(Step::new("once", "alpine"), &axes);
        assert!(single.steps().last().unwrap().when.is_none());
    }

    #[test]
    fn duplicate_step_names_are_suffixed() {
        let mut plan = Plan::new();
        plan.push_step(Step::new("x", "alpine"));
        plan.push_step(Step::new("x", "alpine"));
        let names: Vec<_> = plan.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["x", "x (2)"]);
    }

    #[test]
    fn yaml_output_parses_back_to_same_plan() {
        let mut plan = Plan::parse(NAMED).unwrap();
        plan.push_step(Step::failing("broken", "it's broken").allow_failure());
        let reparsed = Plan::parse(&plan.to_yaml().unwrap()).unwrap();
        assert_eq!(reparsed, plan);
    }

    #[test]
    fn failing_step_quotes_message() {
        let step = Step::failing("x", "it's not supported");
        assert_eq!(step.commands[0], r"echo 'it'\''s not supported'");
        assert_eq!(step.commands[1], "exit 1");
    }
}
