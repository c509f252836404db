//! The static language catalog (spec component C1).
//!
//! A read-only table loaded once at startup, exposing a single operation:
//! [`Catalog::resolve`].

use std::collections::HashMap;
use thiserror::Error;

/// The three placeholders a command template is allowed to reference.
const KNOWN_PLACEHOLDERS: [&str; 3] = ["file", "output", "classname"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("command template `{template}` references unknown placeholder `{{{placeholder}}}`")]
    InvalidTemplate {
        template: String,
        placeholder: String,
    },
    #[error("no language descriptor registered for tag `{0}`")]
    UnknownLanguage(String),
}

/// One catalog entry: everything needed to compile and run a submission in `tag`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LanguageDescriptor {
    pub tag: &'static str,
    pub ext: &'static str,
    pub image: &'static str,
    pub command_template: &'static str,
    /// Compiled languages (`c`, `cpp`, `java`) treat any stderr output as a failure even on
    /// exit 0; see spec.md §4.5.
    pub treat_stderr_as_failure: bool,
}

/// The concrete values bound into a command template for one invocation.
#[derive(Clone, Debug, Default)]
pub struct CommandBinding {
    pub file: String,
    pub output: String,
    pub classname: String,
}

impl LanguageDescriptor {
    /// Expands `command_template`, replacing every occurrence of `{file}`, `{output}`, and
    /// `{classname}` with the corresponding field of `binding`. All occurrences are replaced,
    /// not just the first, per spec.md §4.1.
    pub fn expand_command(&self, binding: &CommandBinding) -> String {
        self.command_template
            .replace("{file}", &binding.file)
            .replace("{output}", &binding.output)
            .replace("{classname}", &binding.classname)
    }
}

/// The immutable, in-memory language catalog.
pub struct Catalog {
    by_tag: HashMap<&'static str, LanguageDescriptor>,
}

impl Catalog {
    /// Builds the catalog from `descriptors`, validating every command template's placeholders.
    /// Returns an error if any template references a placeholder outside
    /// `{file}`/`{output}`/`{classname}` — this is a startup-time invariant, not a per-request
    /// check, per spec.md §4.1.
    pub fn new(descriptors: Vec<LanguageDescriptor>) -> Result<Self, CatalogError> {
        for descriptor in &descriptors {
            validate_template(descriptor.command_template)?;
        }
        let by_tag = descriptors.into_iter().map(|d| (d.tag, d)).collect();
        Ok(Self { by_tag })
    }

    /// Builds the catalog from the default rows in spec.md §4.1's table.
    pub fn with_defaults() -> Self {
        Self::new(default_descriptors()).expect("built-in catalog templates are well-formed")
    }

    /// Looks up a language by tag. `Err` corresponds to spec.md's `NotFound` outcome.
    pub fn resolve(&self, tag: &str) -> Result<&LanguageDescriptor, CatalogError> {
        self.by_tag
            .get(tag)
            .ok_or_else(|| CatalogError::UnknownLanguage(tag.to_string()))
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }
}

fn validate_template(template: &str) -> Result<(), CatalogError> {
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else {
            break;
        };
        let placeholder = &after_open[..close];
        if !KNOWN_PLACEHOLDERS.contains(&placeholder) {
            return Err(CatalogError::InvalidTemplate {
                template: template.to_string(),
                placeholder: placeholder.to_string(),
            });
        }
        rest = &after_open[close + 1..];
    }
    Ok(())
}

fn default_descriptors() -> Vec<LanguageDescriptor> {
    vec![
        LanguageDescriptor {
            tag: "c",
            ext: "c",
            image: "gcc:13",
            command_template: "gcc {file} -o {output} && {output}",
            treat_stderr_as_failure: true,
        },
        LanguageDescriptor {
            tag: "cpp",
            ext: "cpp",
            image: "gcc:13",
            command_template: "g++ {file} -o {output} && {output}",
            treat_stderr_as_failure: true,
        },
        LanguageDescriptor {
            tag: "python",
            ext: "py",
            image: "python",
            command_template: "python3 {file}",
            treat_stderr_as_failure: false,
        },
        LanguageDescriptor {
            tag: "java",
            ext: "java",
            image: "openjdk:17",
            command_template: "javac {file} && java {classname}",
            treat_stderr_as_failure: true,
        },
        LanguageDescriptor {
            tag: "node",
            ext: "js",
            image: "node",
            command_template: "node {file}",
            treat_stderr_as_failure: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn resolves_all_default_tags() {
        let catalog = Catalog::with_defaults();
        for tag in ["c", "cpp", "python", "java", "node"] {
            assert!(catalog.resolve(tag).is_ok(), "expected {tag} to resolve");
        }
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let catalog = Catalog::with_defaults();
        assert_matches!(
            catalog.resolve("brainfuck"),
            Err(CatalogError::UnknownLanguage(tag)) if tag == "brainfuck"
        );
    }

    #[test]
    fn expands_every_occurrence_of_a_placeholder() {
        let descriptor = LanguageDescriptor {
            tag: "test",
            ext: "t",
            image: "test",
            command_template: "{file} && echo {file} done",
            treat_stderr_as_failure: false,
        };
        let binding = CommandBinding {
            file: "/code/a.t".to_string(),
            output: String::new(),
            classname: String::new(),
        };
        assert_eq!(
            descriptor.expand_command(&binding),
            "/code/a.t && echo /code/a.t done"
        );
    }

    #[test]
    fn rejects_unknown_placeholder_at_construction() {
        let bad = LanguageDescriptor {
            tag: "bad",
            ext: "b",
            image: "bad",
            command_template: "run {bogus}",
            treat_stderr_as_failure: false,
        };
        assert_matches!(
            Catalog::new(vec![bad]),
            Err(CatalogError::InvalidTemplate { placeholder, .. }) if placeholder == "bogus"
        );
    }

    #[test]
    fn java_template_uses_classname() {
        let catalog = Catalog::with_defaults();
        let java = catalog.resolve("java").unwrap();
        let binding = CommandBinding {
            file: "/code/Greeter.java".to_string(),
            output: String::new(),
            classname: "Greeter".to_string(),
        };
        assert_eq!(
            java.expand_command(&binding),
            "javac /code/Greeter.java && java Greeter"
        );
    }
}
