//! Per-language build, test and code-intelligence templates used when a
//! repository has no CI descriptor of its own.

use crate::plan::{Matrix, Step};

/// Image used by placeholder steps that only print a message and fail.
pub const PLACEHOLDER_IMAGE: &str = "alpine:3.19";

/// Every analyzer image starts with this prefix. A descriptor that already
/// uses one opts out of automatic analyzer injection.
pub const ANALYZER_IMAGE_PREFIX: &str = "codeintel/scip-";

pub const IMPORT_IMAGE: &str = "codeintel/import:latest";
pub const IMPORT_STEP_NAME: &str = "Import code intelligence";
pub const IMPORT_URL_ENV: &str = "CODEINTEL_IMPORT_URL";
pub const IMPORT_TOKEN_ENV: &str = "CODEINTEL_IMPORT_TOKEN";

/// Build and test steps for one language, plus the matrix variables they use.
#[derive(Debug, Clone)]
pub struct LanguageTemplate {
    pub build: Vec<Step>,
    pub test: Vec<Step>,
    pub matrix: Matrix,
}

fn template(
    image: &str,
    build_name: &str,
    build: &[&str],
    test_name: &str,
    test: &[&str],
    matrix: Option<(&str, &str)>,
) -> LanguageTemplate {
    let step = |name: &str, commands: &[&str]| {
        commands
            .iter()
            .fold(Step::new(name, image), |s, cmd| s.command(*cmd))
    };
    let mut m = Matrix::new();
    if let Some((var, value)) = matrix {
        m.insert(var, [value]);
    }
    LanguageTemplate {
        build: vec![step(build_name, build)],
        test: vec![step(test_name, test)],
        matrix: m,
    }
}

/// Looks up the template for a language name as reported by the inventory.
pub fn language(name: &str) -> Option<LanguageTemplate> {
    let t = match name {
        "Go" => template(
            "golang:$$GO_VERSION",
            "Go build",
            &["go get -d ./...", "go build ./..."],
            "Go test",
            &["go test -v ./..."],
            Some(("GO_VERSION", "1.22")),
        ),
        "JavaScript" | "TypeScript" => template(
            "node:$$NODE_VERSION",
            "JavaScript build",
            &["npm install"],
            "JavaScript test",
            &["npm test"],
            Some(("NODE_VERSION", "20")),
        ),
        "Java" => template(
            "maven:3-eclipse-temurin-17",
            "Java build",
            &["mvn -B -DskipTests package"],
            "Java test",
            &["mvn -B test"],
            None,
        ),
        "Python" => template(
            "python:$$PYTHON_VERSION",
            "Python build",
            &["if [ -f requirements.txt ]; then pip install -r requirements.txt; fi"],
            "Python test",
            &["python -m pytest"],
            Some(("PYTHON_VERSION", "3.12")),
        ),
        "Ruby" => template(
            "ruby:$$RUBY_VERSION",
            "Ruby build",
            &["bundle install"],
            "Ruby test",
            &["bundle exec rake"],
            Some(("RUBY_VERSION", "3.3")),
        ),
        _ => return None,
    };
    Some(t)
}

/// Analyzer step producing code-intelligence data for a language.
pub fn analyzer(name: &str) -> Option<Step> {
    let (image, command) = match name {
        "Go" => ("codeintel/scip-go:latest", "scip-go"),
        "JavaScript" | "TypeScript" => {
            ("codeintel/scip-typescript:latest", "scip-typescript index")
        }
        "Java" => ("codeintel/scip-java:latest", "scip-java index"),
        "Python" => ("codeintel/scip-python:latest", "scip-python index ."),
        _ => return None,
    };
    Some(Step::new(format!("Code intelligence: {name}"), image).command(command))
}

pub fn unsupported_language(name: &str) -> Step {
    Step::failing(
        format!("{name} (unsupported)"),
        &format!(
            "{name} is not supported by automatic build configuration. \
             Add a .ci.yml file to the repository to configure the build."
        ),
    )
}

pub fn no_language_detected() -> Step {
    Step::failing(
        "No supported language",
        "No supported programming language was detected in this repository. \
         Add a .ci.yml file to the repository to configure the build.",
    )
}

pub fn unsupported_analyzer(name: &str) -> Step {
    Step::failing(
        format!("Code intelligence warning: {name}"),
        &format!("Code intelligence is not yet available for {name}."),
    )
    .allow_failure()
}

pub fn no_analyzer() -> Step {
    Step::failing(
        "Code intelligence warning",
        "No code intelligence support exists for the languages in this repository.",
    )
    .allow_failure()
}

/// Step that uploads analyzer output to `url`, authenticating with `token`.
pub fn import(url: &str, token: &str) -> Step {
    Step::new(IMPORT_STEP_NAME, IMPORT_IMAGE)
        .env(IMPORT_URL_ENV, url)
        .env(IMPORT_TOKEN_ENV, token)
        .command(format!(
            "codeintel-import --url \"${IMPORT_URL_ENV}\" --token \"${IMPORT_TOKEN_ENV}\""
        ))
}
